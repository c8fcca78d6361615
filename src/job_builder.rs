//! The Backup Job Builder (§4.2): the declarative worker Job that performs
//! the online base-backup and reflink clone.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, HostPathVolumeSource, NodeAffinity, PersistentVolumeClaimVolumeSource,
    PodSecurityContext, PodSpec, PodTemplateSpec, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use crate::config::*;
use crate::guid::Guid;
use crate::types::ResolvedSource;

/// Everything the builder needs to know about the requesting claim; kept
/// separate from `ResolvedSource` since it describes the request rather
/// than the thing being backed up.
pub struct BackupJobRequest<'a> {
    pub guid: Guid,
    /// Namespace the Job itself runs in — must be the *source* claim's
    /// namespace, since a pod can only mount a PersistentVolumeClaim
    /// volume from its own namespace.
    pub job_namespace: &'a str,
    pub source_pvc_name: &'a str,
    pub resolved: &'a ResolvedSource,
    pub owner: Option<OwnerReference>,
}

/// The inline script run inside the backup container: starts an online
/// base backup, reflink-clones the data directory, then overwrites the
/// reflinked `backup_label` with the one `pg_backup_stop` hands back
/// (§4.2's Backup Protocol — the copy predates the label PostgreSQL
/// expects to find there, so it must be replaced after the fact).
fn backup_script(guid: &Guid) -> String {
    format!(
        r#"set -euo pipefail
LABEL="pg-reflinker-{guid}"
psql -v ON_ERROR_STOP=1 -Atc "SELECT pg_backup_start('${{LABEL}}', true);"
cp -a --reflink=always /source /dest/pgdata
psql -v ON_ERROR_STOP=1 -Atc "SELECT labelfile FROM pg_backup_stop(false);" > /tmp/backup_label
cp /tmp/backup_label /dest/pgdata/backup_label
"#,
        guid = guid
    )
}

pub fn build_backup_job(req: &BackupJobRequest) -> Job {
    let guid = req.guid;
    let name = guid.backup_job_name();
    let host_dir = host_path(&guid.as_str());
    // Pinned to the resolved primary's node, not derived from the source
    // volume's affinity (§4.2) — the reflink copy must run local to the
    // data being cloned, and `primary_node` is always known, unlike
    // `source_node_affinity` which is best-effort.
    let node_name = Some(req.resolved.primary_node.clone());

    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL_KEY.to_string(), MANAGED_BY_LABEL_VALUE.to_string());

    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_PV_GUID.to_string(), guid.as_str());

    let pod_security_context = PodSecurityContext {
        fs_group: Some(POSTGRES_GID),
        run_as_user: Some(POSTGRES_UID),
        run_as_group: Some(POSTGRES_GID),
        ..Default::default()
    };

    let init_container = Container {
        name: "init-permissions".into(),
        image: Some(INIT_PERMISSIONS_IMAGE.into()),
        command: Some(vec!["sh".into(), "-c".into()]),
        args: Some(vec![format!(
            "mkdir -p /dest && chown -R {POSTGRES_UID}:{POSTGRES_GID} /dest"
        )]),
        security_context: Some(k8s_openapi::api::core::v1::SecurityContext {
            run_as_user: Some(0),
            run_as_group: Some(0),
            ..Default::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: "dest".into(),
            mount_path: "/dest".into(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let backup_container = Container {
        name: "backup".into(),
        image: Some(req.resolved.database_image.clone()),
        command: Some(vec!["bash".into(), "-c".into()]),
        args: Some(vec![backup_script(&guid)]),
        env: Some(vec![
            EnvVar {
                name: "PGHOST".into(),
                value: Some(req.resolved.primary_pod_ip.clone()),
                ..Default::default()
            },
            EnvVar {
                name: "PGUSER".into(),
                value: Some("streaming_replica".into()),
                ..Default::default()
            },
            EnvVar {
                name: "PGSSLMODE".into(),
                value: Some("verify-ca".into()),
                ..Default::default()
            },
            EnvVar {
                name: "PGSSLCERT".into(),
                value: Some("/certs/tls.crt".into()),
                ..Default::default()
            },
            EnvVar {
                name: "PGSSLKEY".into(),
                value: Some("/certs/tls.key".into()),
                ..Default::default()
            },
            EnvVar {
                name: "PGSSLROOTCERT".into(),
                value: Some("/ca/ca.crt".into()),
                ..Default::default()
            },
        ]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "source".into(),
                mount_path: "/source".into(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "dest".into(),
                mount_path: "/dest".into(),
                ..Default::default()
            },
            VolumeMount {
                name: "replication-tls".into(),
                mount_path: "/certs".into(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "ca".into(),
                mount_path: "/ca".into(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let volumes = vec![
        Volume {
            name: "source".into(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: req.source_pvc_name.to_string(),
                read_only: Some(true),
            }),
            ..Default::default()
        },
        Volume {
            name: "dest".into(),
            host_path: Some(HostPathVolumeSource {
                path: host_dir.to_string_lossy().into_owned(),
                type_: Some("DirectoryOrCreate".into()),
            }),
            ..Default::default()
        },
        Volume {
            name: "replication-tls".into(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(req.resolved.tls_material_refs.replication_secret.clone()),
                default_mode: Some(0o640),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "ca".into(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(req.resolved.tls_material_refs.ca_secret.clone()),
                default_mode: Some(0o640),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];

    Job {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(req.job_namespace.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: req.owner.clone().map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    node_name,
                    affinity: node_name_unset_affinity(&req.resolved.source_node_affinity),
                    restart_policy: Some("Never".into()),
                    security_context: Some(pod_security_context),
                    init_containers: Some(vec![init_container]),
                    containers: vec![backup_container],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Falls back to copying the source PV's full node affinity when no bare
/// hostname could be extracted, so scheduling still narrows to the right
/// node even if the label key in use isn't `kubernetes.io/hostname`.
fn node_name_unset_affinity(
    source_node_affinity: &Option<k8s_openapi::api::core::v1::VolumeNodeAffinity>,
) -> Option<k8s_openapi::api::core::v1::Affinity> {
    let required = source_node_affinity.as_ref()?.required.clone()?;
    Some(k8s_openapi::api::core::v1::Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(required),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        NodeSelectorRequirement, NodeSelectorTerm, VolumeNodeAffinity,
    };

    fn affinity_with_hostname(hostname: &str) -> k8s_openapi::api::core::v1::VolumeNodeAffinity {
        VolumeNodeAffinity {
            required: Some(k8s_openapi::api::core::v1::NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: "kubernetes.io/hostname".into(),
                        operator: "In".into(),
                        values: Some(vec![hostname.into()]),
                    }]),
                    match_fields: None,
                }],
            }),
        }
    }

    fn resolved(node_affinity: Option<k8s_openapi::api::core::v1::VolumeNodeAffinity>) -> ResolvedSource {
        ResolvedSource {
            cluster_id: "db-1".into(),
            source_namespace: "app".into(),
            primary_pod_ip: "10.0.0.5".into(),
            primary_node: "node-a".into(),
            database_image: "postgres:16".into(),
            tls_material_refs: crate::types::TlsMaterialRefs {
                replication_secret: "db-1-replication".into(),
                ca_secret: "db-1-ca".into(),
            },
            source_node_affinity: node_affinity,
        }
    }

    #[test]
    fn pins_job_to_primary_node() {
        let resolved = resolved(Some(affinity_with_hostname("node-b")));
        let guid = Guid::from_claim_uid(Some("abcd1234-0000-0000-0000-000000000000"));
        let req = BackupJobRequest {
            guid,
            job_namespace: "app",
            source_pvc_name: "db-1-data",
            resolved: &resolved,
            owner: None,
        };
        let job = build_backup_job(&req);
        let spec = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(spec.node_name.as_deref(), Some("node-a"));
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
    }

    #[test]
    fn mounts_source_read_only_and_dest_writable() {
        let resolved = resolved(None);
        let guid = Guid::from_claim_uid(Some("abcd1234-0000-0000-0000-000000000000"));
        let req = BackupJobRequest {
            guid,
            job_namespace: "app",
            source_pvc_name: "db-1-data",
            resolved: &resolved,
            owner: None,
        };
        let job = build_backup_job(&req);
        let spec = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(spec.node_name.as_deref(), Some("node-a"));
        let volumes = spec.volumes.unwrap();
        let source = volumes.iter().find(|v| v.name == "source").unwrap();
        assert_eq!(
            source.persistent_volume_claim.as_ref().unwrap().read_only,
            Some(true)
        );
        let dest = volumes.iter().find(|v| v.name == "dest").unwrap();
        assert!(dest.host_path.is_some());
    }

    #[test]
    fn script_overwrites_backup_label_after_reflink_copy() {
        let guid = Guid::from_claim_uid(Some("abcd1234-0000-0000-0000-000000000000"));
        let script = backup_script(&guid);
        let copy_pos = script.find("cp -a --reflink=always").unwrap();
        let overwrite_pos = script.find("backup_label").unwrap();
        assert!(copy_pos < overwrite_pos);
        assert!(script.contains("pg_backup_start"));
        assert!(script.contains("pg_backup_stop"));
    }
}
