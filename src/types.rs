use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::VolumeNodeAffinity;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::config::*;
use crate::guid::Guid;

/// TLS client material a backup job needs to connect to the primary as
/// the replication user (§4.1 step 9, §4.2).
#[derive(Debug, Clone)]
pub struct TlsMaterialRefs {
    pub replication_secret: String,
    pub ca_secret: String,
}

/// Everything the Cluster Introspector resolves about the source cluster
/// (§4.1's return value).
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub cluster_id: String,
    pub source_namespace: String,
    pub primary_pod_ip: String,
    pub primary_node: String,
    pub database_image: String,
    pub tls_material_refs: TlsMaterialRefs,
    pub source_node_affinity: Option<VolumeNodeAffinity>,
}

/// The requesting claim's coordinates (§3).
#[derive(Debug, Clone)]
pub struct ClaimCoordinates {
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
    pub storage_class: String,
    pub requested_storage: Quantity,
}

/// The eight annotations that constitute the SnapshotVolume's persistent
/// state (§3) — the controller is otherwise stateless, so this struct is
/// both what gets written at publish time and what gets read back at
/// bind/cleanup time.
#[derive(Debug, Clone)]
pub struct SnapshotAnnotations {
    pub source_cluster: String,
    pub source_namespace: String,
    pub source_pvc: String,
    pub source_backup_label: Guid,
    pub claim_namespace: String,
    pub claim_name: String,
    pub storage_class: String,
    pub node: String,
}

impl SnapshotAnnotations {
    pub fn to_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (ANNOTATION_SOURCE_CLUSTER.to_string(), self.source_cluster.clone()),
            (ANNOTATION_SOURCE_NAMESPACE.to_string(), self.source_namespace.clone()),
            (ANNOTATION_SOURCE_PVC.to_string(), self.source_pvc.clone()),
            (
                ANNOTATION_SOURCE_BACKUP_LABEL.to_string(),
                self.source_backup_label.as_str(),
            ),
            (ANNOTATION_CLAIM_NAMESPACE.to_string(), self.claim_namespace.clone()),
            (ANNOTATION_CLAIM_NAME.to_string(), self.claim_name.clone()),
            (ANNOTATION_STORAGE_CLASS.to_string(), self.storage_class.clone()),
            (ANNOTATION_NODE.to_string(), self.node.clone()),
        ])
    }

    /// Reconstructs the annotation set from a live object's annotations.
    /// Returns `None` if any required key is missing (§4.5: "missing
    /// annotations ... log and skip").
    pub fn from_map(annotations: &BTreeMap<String, String>) -> Option<Self> {
        Some(SnapshotAnnotations {
            source_cluster: annotations.get(ANNOTATION_SOURCE_CLUSTER)?.clone(),
            source_namespace: annotations.get(ANNOTATION_SOURCE_NAMESPACE)?.clone(),
            source_pvc: annotations.get(ANNOTATION_SOURCE_PVC)?.clone(),
            source_backup_label: Guid::from_claim_uid(Some(annotations.get(ANNOTATION_SOURCE_BACKUP_LABEL)?)),
            claim_namespace: annotations.get(ANNOTATION_CLAIM_NAMESPACE)?.clone(),
            claim_name: annotations.get(ANNOTATION_CLAIM_NAME)?.clone(),
            storage_class: annotations.get(ANNOTATION_STORAGE_CLASS)?.clone(),
            node: annotations.get(ANNOTATION_NODE)?.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SnapshotAnnotations {
        SnapshotAnnotations {
            source_cluster: "db-1".into(),
            source_namespace: "app".into(),
            source_pvc: "db-1-data".into(),
            source_backup_label: Guid::from_claim_uid(Some("abcd1234-0000-0000-0000-000000000000")),
            claim_namespace: "app".into(),
            claim_name: "db-clone".into(),
            storage_class: "pgrl".into(),
            node: "node-a".into(),
        }
    }

    #[test]
    fn round_trips_through_a_map() {
        let original = sample();
        let map = original.to_map();
        let restored = SnapshotAnnotations::from_map(&map).unwrap();
        assert_eq!(restored.source_cluster, original.source_cluster);
        assert_eq!(restored.node, original.node);
        assert_eq!(restored.source_backup_label, original.source_backup_label);
    }

    #[test]
    fn missing_key_yields_none() {
        let mut map = sample().to_map();
        map.remove(ANNOTATION_NODE);
        assert!(SnapshotAnnotations::from_map(&map).is_none());
    }
}
