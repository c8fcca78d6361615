//! The Volume Publisher (§4.4): creates the SnapshotVolume in its
//! late-binding, pre-bound form, then promotes it to fully bound once the
//! backup succeeds.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    LocalVolumeSource, ObjectReference, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeSpec, VolumeNodeAffinity,
};
use kube::api::{Patch, PatchParams, PostParams};
use kube::core::ObjectMeta;
use kube::{Api, Client, ResourceExt};
use tracing::{info, warn};

use crate::config::*;
use crate::errors::{ProvisioningError, Result};
use crate::ext::ReflinkerResourceExt;
use crate::guid::Guid;
use crate::types::{ClaimCoordinates, ResolvedSource, SnapshotAnnotations};

/// Builds and creates the pre-bound SnapshotVolume: no `storageClassName`
/// (so the scheduler can't bind it prematurely) and a `claimRef` that
/// names the claim without its UID. Idempotent: an existing volume with
/// the same name is left untouched and returned as-is.
pub async fn publish_pre_bound(
    client: &Client,
    guid: Guid,
    claim: &ClaimCoordinates,
    resolved: &ResolvedSource,
    reclaim_policy: &str,
    source_pvc_name: &str,
) -> Result<PersistentVolume> {
    let volumes: Api<PersistentVolume> = Api::all(client.clone());
    let name = guid.volume_name();

    if let Some(existing) = volumes.get_opt(&name).await.map_err(ProvisioningError::OrchestratorApi)? {
        return Ok(existing);
    }

    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL_KEY.to_string(), MANAGED_BY_LABEL_VALUE.to_string());

    let annotations = SnapshotAnnotations {
        source_cluster: resolved.cluster_id.clone(),
        source_namespace: resolved.source_namespace.clone(),
        source_pvc: source_pvc_name.to_string(),
        source_backup_label: guid,
        claim_namespace: claim.namespace.clone(),
        claim_name: claim.name.clone(),
        storage_class: claim.storage_class.clone(),
        node: resolved.primary_node.clone(),
    }
    .to_map();

    let mut capacity = BTreeMap::new();
    capacity.insert("storage".to_string(), claim.requested_storage.clone());

    let pv = PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            capacity: Some(capacity),
            // Single-writer regardless of what the claim asked for: this
            // is a single-node local volume, so advertising RWX would be
            // a lie (§4.4).
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            persistent_volume_reclaim_policy: Some(reclaim_policy.to_string()),
            storage_class_name: None,
            claim_ref: Some(ObjectReference {
                api_version: Some("v1".into()),
                kind: Some("PersistentVolumeClaim".into()),
                namespace: Some(claim.namespace.clone()),
                name: Some(claim.name.clone()),
                uid: None,
                ..Default::default()
            }),
            node_affinity: Some(
                resolved
                    .source_node_affinity
                    .clone()
                    .unwrap_or_else(|| node_affinity_for(&resolved.primary_node)),
            ),
            local: Some(LocalVolumeSource {
                path: host_path(&guid.as_str()).to_string_lossy().into_owned(),
                fs_type: None,
            }),
            ..Default::default()
        }),
        status: None,
    };

    let created = volumes
        .create(&PostParams::default(), &pv)
        .await
        .map_err(ProvisioningError::OrchestratorApi)?;
    info!(volume = %created.full_name(), "published pre-bound SnapshotVolume");
    Ok(created)
}

fn node_affinity_for(node_name: &str) -> VolumeNodeAffinity {
    use k8s_openapi::api::core::v1::{NodeSelector, NodeSelectorRequirement, NodeSelectorTerm};
    VolumeNodeAffinity {
        required: Some(NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(vec![NodeSelectorRequirement {
                    key: "kubernetes.io/hostname".into(),
                    operator: "In".into(),
                    values: Some(vec![node_name.to_string()]),
                }]),
                match_fields: None,
            }],
        }),
    }
}

/// Outcome of attempting to bind a SnapshotVolume after a successful
/// backup.
pub enum BindOutcome {
    Bound(PersistentVolume),
    /// The claim is already bound, or the claim disappeared out from
    /// under us; both are treated as terminal, not errors (§4.4).
    AlreadyBoundOrGone,
}

/// Promotes a pre-bound SnapshotVolume to fully bound: sets
/// `storageClassName` and fills in `claimRef.uid`. If the originating
/// claim is gone, deletes the SnapshotVolume instead — its eventual
/// deletion event is what drives cleanup (§4.5).
pub async fn bind(client: &Client, guid: Guid, storage_class: &str) -> Result<BindOutcome> {
    let volumes: Api<PersistentVolume> = Api::all(client.clone());
    let volume_name = guid.volume_name();

    let pv = match volumes.get_opt(&volume_name).await.map_err(ProvisioningError::OrchestratorApi)? {
        Some(pv) => pv,
        None => return Ok(BindOutcome::AlreadyBoundOrGone),
    };

    let annotations = pv.annotations();
    let claim_ns = annotations
        .get(ANNOTATION_CLAIM_NAMESPACE)
        .ok_or_else(|| ProvisioningError::BadRequest(format!("volume {volume_name} missing claim-namespace annotation")))?;
    let claim_name = annotations
        .get(ANNOTATION_CLAIM_NAME)
        .ok_or_else(|| ProvisioningError::BadRequest(format!("volume {volume_name} missing claim-name annotation")))?;

    let claims: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), claim_ns);
    let claim = match claims.get_opt(claim_name).await.map_err(ProvisioningError::OrchestratorApi)? {
        Some(claim) => claim,
        None => {
            warn!(volume = %volume_name, "source claim is gone, deleting pre-bound SnapshotVolume");
            volumes
                .delete(&volume_name, &Default::default())
                .await
                .map_err(ProvisioningError::OrchestratorApi)?;
            return Ok(BindOutcome::AlreadyBoundOrGone);
        }
    };

    let claim_uid = claim
        .uid()
        .ok_or_else(|| ProvisioningError::BadRequest(format!("claim {claim_ns}/{claim_name}: no UID")))?;

    if pv.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Bound") {
        return Ok(BindOutcome::AlreadyBoundOrGone);
    }

    let patch = serde_json::json!({
        "spec": {
            "storageClassName": storage_class,
            "claimRef": {
                "apiVersion": "v1",
                "kind": "PersistentVolumeClaim",
                "namespace": claim_ns,
                "name": claim_name,
                "uid": claim_uid,
            }
        }
    });

    match volumes
        .patch(&volume_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(updated) => {
            info!(volume = %volume_name, "bound SnapshotVolume to claim");
            Ok(BindOutcome::Bound(updated))
        }
        Err(kube::Error::Api(e)) if e.code == 409 => Ok(BindOutcome::AlreadyBoundOrGone),
        Err(e) => Err(ProvisioningError::OrchestratorApi(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_affinity_pins_hostname() {
        let affinity = node_affinity_for("node-a");
        let terms = affinity.required.unwrap().node_selector_terms;
        let expr = &terms[0].match_expressions.as_ref().unwrap()[0];
        assert_eq!(expr.key, "kubernetes.io/hostname");
        assert_eq!(expr.values.as_ref().unwrap()[0], "node-a");
    }
}
