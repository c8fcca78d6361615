//! The Cleanup Coordinator (§4.5): reclaims on-disk state after a failed
//! backup or a deleted SnapshotVolume.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, PersistentVolume, PodSpec, PodTemplateSpec};
use kube::api::PostParams;
use kube::core::ObjectMeta;
use kube::{Api, Client};
use tracing::{info, warn};

use crate::config::*;
use crate::errors::{ProvisioningError, Result};
use crate::ext::ReflinkerResourceExt;
use crate::guid::Guid;
use crate::types::SnapshotAnnotations;

/// On BackupJob failure: delete the pre-bound SnapshotVolume. A 404 means
/// someone already removed it, which counts as success (§4.5).
pub async fn delete_volume_for_failed_backup(client: &Client, guid: Guid) -> Result<()> {
    let volumes: Api<PersistentVolume> = Api::all(client.clone());
    let name = guid.volume_name();
    match volumes.delete(&name, &Default::default()).await {
        Ok(_) => {
            info!(volume = %name, "deleted SnapshotVolume after backup job failure");
            Ok(())
        }
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(ProvisioningError::OrchestratorApi(e)),
    }
}

/// On SnapshotVolume deletion: enqueue a node-pinned cleanup Job that
/// removes the on-host snapshot directory, but only when the volume's
/// reclaim policy was `Delete`. `Retain` is an intentional no-op — the
/// data is meant to survive the SnapshotVolume it was mounted through.
///
/// Missing annotations mean the volume predates this controller, or was
/// never fully published; both are logged and skipped rather than
/// treated as errors, since there is nothing safe to reclaim.
pub async fn handle_volume_deleted(
    client: &Client,
    volume_name: &str,
    reclaim_policy: &str,
    annotations: &BTreeMap<String, String>,
) -> Result<()> {
    if !needs_cleanup(reclaim_policy) {
        return Ok(());
    }

    let Some(guid) = Guid::from_volume_name(volume_name) else {
        warn!(volume_name, "deleted volume's name doesn't carry a guid, skipping cleanup");
        return Ok(());
    };

    let Some(annotations) = SnapshotAnnotations::from_map(annotations) else {
        warn!(volume_name, "deleted volume is missing required annotations, skipping cleanup");
        return Ok(());
    };

    enqueue_cleanup_job(client, guid, &annotations).await
}

/// `Retain` is deliberately a no-op: the data is meant to survive the
/// SnapshotVolume it was briefly mounted through.
fn needs_cleanup(reclaim_policy: &str) -> bool {
    reclaim_policy == "Delete"
}

async fn enqueue_cleanup_job(client: &Client, guid: Guid, annotations: &SnapshotAnnotations) -> Result<()> {
    let namespace = if annotations.source_namespace.is_empty() {
        DEFAULT_CLEANUP_NAMESPACE.to_string()
    } else {
        annotations.source_namespace.clone()
    };

    let jobs: Api<Job> = Api::namespaced(client.clone(), &namespace);
    let name = guid.cleanup_job_name();

    if jobs.get_opt(&name).await.map_err(ProvisioningError::OrchestratorApi)?.is_some() {
        return Ok(());
    }

    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL_KEY.to_string(), MANAGED_BY_LABEL_VALUE.to_string());

    let host_dir = host_path(&guid.as_str());
    let job = Job {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(2),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    node_name: Some(annotations.node.clone()),
                    restart_policy: Some("OnFailure".into()),
                    containers: vec![Container {
                        name: "cleanup".into(),
                        image: Some(CLEANUP_IMAGE.into()),
                        command: Some(vec!["rm".into(), "-rf".into(), host_dir.to_string_lossy().into_owned()]),
                        volume_mounts: Some(vec![k8s_openapi::api::core::v1::VolumeMount {
                            name: "host-root".into(),
                            mount_path: HOSTPATH_PREFIX.as_str().into(),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![k8s_openapi::api::core::v1::Volume {
                        name: "host-root".into(),
                        host_path: Some(k8s_openapi::api::core::v1::HostPathVolumeSource {
                            path: HOSTPATH_PREFIX.clone(),
                            type_: Some("Directory".into()),
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    };

    let created = jobs.create(&PostParams::default(), &job).await.map_err(ProvisioningError::OrchestratorApi)?;
    info!(job = %created.full_name(), guid = %guid, "enqueued cleanup job");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_annotations() -> BTreeMap<String, String> {
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
        .to_map()
    }

    #[test]
    fn only_delete_reclaim_policy_triggers_cleanup() {
        assert!(needs_cleanup("Delete"));
        assert!(!needs_cleanup("Retain"));
        assert!(!needs_cleanup(""));
    }

    #[test]
    fn guid_must_be_recoverable_from_volume_name() {
        assert!(Guid::from_volume_name("not-a-pvc-name").is_none());
        assert!(Guid::from_volume_name("pvc-abcd1234-0000-0000-0000-000000000000").is_some());
    }

    #[test]
    fn annotations_round_trip_for_cleanup() {
        let map = sample_annotations();
        let restored = SnapshotAnnotations::from_map(&map).unwrap();
        assert_eq!(restored.node, "node-a");
        assert_eq!(restored.claim_namespace, "app");
    }
}
