//! The Cluster Introspector (§4.1): resolves a claim's source cluster to
//! a fully-qualified, connectable record, or a classified failure.

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, warn};

use crate::config::*;
use crate::errors::{ProvisioningError, Result};
use crate::ext::ReflinkerResourceExt;
use crate::types::{ResolvedSource, TlsMaterialRefs};

/// The provisioner-facing view of a storage class's relevant fields.
pub struct StorageClassInfo {
    pub reclaim_policy: String,
    pub provisioner: String,
}

pub async fn read_storage_class(client: &Client, name: &str) -> Result<StorageClassInfo> {
    let storage_classes = Api::<StorageClass>::all(client.clone());
    let sc = storage_classes
        .get(name)
        .await
        .map_err(|e| ProvisioningError::BadRequest(format!("storage class {name} unreadable: {e}")))?;

    Ok(StorageClassInfo {
        reclaim_policy: sc
            .reclaim_policy
            .unwrap_or_else(|| DEFAULT_RECLAIM_POLICY.into()),
        provisioner: sc.provisioner,
    })
}

/// Step 2: the claim must carry a `dataSourceRef` of kind "claim"
/// (`PersistentVolumeClaim`). Returns `(source_pvc_name, explicit_namespace)`.
pub fn require_claim_data_source(claim: &PersistentVolumeClaim) -> Result<(String, Option<String>)> {
    let data_source_ref = claim
        .spec
        .as_ref()
        .and_then(|s| s.data_source_ref.as_ref())
        .ok_or_else(|| ProvisioningError::BadRequest("claim has no dataSourceRef".into()))?;

    if data_source_ref.kind != "PersistentVolumeClaim" {
        return Err(ProvisioningError::BadRequest(format!(
            "dataSourceRef.kind must be PersistentVolumeClaim, got {}",
            data_source_ref.kind
        )));
    }

    Ok((data_source_ref.name.clone(), data_source_ref.namespace.clone()))
}

/// Step 3: resolve the namespace the source claim actually lives in.
/// First namespace in the ordered candidate list that contains the named
/// claim wins.
pub async fn resolve_source_namespace(
    client: &Client,
    claim_namespace: &str,
    explicit_namespace: Option<&str>,
    source_pvc_name: &str,
) -> Result<(String, PersistentVolumeClaim)> {
    if let Some(ns) = explicit_namespace {
        let api = Api::<PersistentVolumeClaim>::namespaced(client.clone(), ns);
        let pvc = api.get(source_pvc_name).await.map_err(|_| {
            ProvisioningError::SourceNotFound(format!(
                "source claim {source_pvc_name} not found in namespace {ns}"
            ))
        })?;
        return Ok((ns.to_string(), pvc));
    }

    let mut candidates = vec![claim_namespace.to_string()];
    candidates.extend(NAMESPACE_PATH.iter().cloned());

    for ns in &candidates {
        let api = Api::<PersistentVolumeClaim>::namespaced(client.clone(), ns);
        if let Some(pvc) = api.get_opt(source_pvc_name).await.map_err(ProvisioningError::OrchestratorApi)? {
            return Ok((ns.clone(), pvc));
        }
    }

    Err(ProvisioningError::SourceNotFound(format!(
        "source claim {source_pvc_name} not found in any of {candidates:?}"
    )))
}

/// Steps 4-9: given the located source claim, finish resolving cluster
/// identity, primary pod, image, and TLS material.
pub async fn resolve(client: Client, claim: &PersistentVolumeClaim) -> Result<ResolvedSource> {
    let (source_pvc_name, explicit_namespace) = require_claim_data_source(claim)?;
    let claim_namespace = claim
        .namespace()
        .ok_or_else(|| ProvisioningError::BadRequest("claim has no namespace".into()))?;

    let (source_namespace, source_pvc) = resolve_source_namespace(
        &client,
        &claim_namespace,
        explicit_namespace.as_deref(),
        &source_pvc_name,
    )
    .await?;

    // Step 4: source claim must be Bound.
    let phase = source_pvc
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("");
    if phase != "Bound" {
        return Err(ProvisioningError::NotYetReady {
            message: format!("source claim {} is {phase}, not Bound", source_pvc.full_name()),
            delay_secs: NOT_YET_READY_REQUEUE_SECS,
        });
    }

    // Step 5: exactly one owner of kind Cluster, api group postgresql.cnpg.io/v1.
    let owners = source_pvc.owner_references();
    let cnpg_owners: Vec<_> = owners
        .iter()
        .filter(|o| o.kind == CNPG_CLUSTER_KIND && o.api_version == format!("{CNPG_GROUP}/{CNPG_VERSION}"))
        .collect();
    let cluster_id = match cnpg_owners.as_slice() {
        [only] => only.name.clone(),
        [] => {
            return Err(ProvisioningError::Misowned(format!(
                "source claim {} has no postgresql.cnpg.io/v1 Cluster owner",
                source_pvc.full_name()
            )))
        }
        _ => {
            return Err(ProvisioningError::Misowned(format!(
                "source claim {} has multiple Cluster owners",
                source_pvc.full_name()
            )))
        }
    };

    // Step 6: read the Cluster's imageName.
    let database_image = read_cluster_image(&client, &source_namespace, &cluster_id).await?;

    // Step 7: list pods belonging to the cluster; select the first.
    let pods_api: Api<k8s_openapi::api::core::v1::Pod> = Api::namespaced(client.clone(), &source_namespace);
    let pods = pods_api
        .list(&kube::api::ListParams {
            label_selector: Some(format!("{CNPG_CLUSTER_POD_LABEL}={cluster_id}")),
            ..Default::default()
        })
        .await
        .map_err(ProvisioningError::OrchestratorApi)?;
    let primary_pod = pods.items.into_iter().next().ok_or_else(|| ProvisioningError::NotYetReady {
        message: format!("no pods found for cluster {cluster_id} in namespace {source_namespace}"),
        delay_secs: NOT_YET_READY_REQUEUE_SECS,
    })?;

    let primary_pod_ip = primary_pod
        .status
        .as_ref()
        .and_then(|s| s.pod_ip.clone())
        .ok_or_else(|| ProvisioningError::NotYetReady {
            message: format!("pod {} has no pod IP yet", primary_pod.full_name()),
            delay_secs: NOT_YET_READY_REQUEUE_SECS,
        })?;
    let primary_node = primary_pod
        .spec
        .as_ref()
        .and_then(|s| s.node_name.clone())
        .ok_or_else(|| ProvisioningError::NotYetReady {
            message: format!("pod {} is not yet scheduled", primary_pod.full_name()),
            delay_secs: NOT_YET_READY_REQUEUE_SECS,
        })?;

    // Step 8: node affinity from the bound PV, best-effort.
    let source_node_affinity = match &source_pvc.spec.as_ref().and_then(|s| s.volume_name.clone()) {
        Some(volume_name) => {
            let pvs = Api::<PersistentVolume>::all(client.clone());
            match pvs.get_opt(volume_name).await {
                Ok(Some(pv)) => pv.spec.and_then(|s| s.node_affinity),
                Ok(None) => None,
                Err(e) => {
                    warn!(error = %e, volume_name, "failed to read source PV node affinity, continuing without it");
                    None
                }
            }
        }
        None => None,
    };

    Ok(ResolvedSource {
        cluster_id: cluster_id.clone(),
        source_namespace,
        primary_pod_ip,
        primary_node,
        database_image,
        tls_material_refs: TlsMaterialRefs {
            replication_secret: format!("{cluster_id}-replication"),
            ca_secret: format!("{cluster_id}-ca"),
        },
        source_node_affinity,
    })
}

async fn read_cluster_image(client: &Client, namespace: &str, cluster_name: &str) -> Result<String> {
    let gvk = GroupVersionKind::gvk(CNPG_GROUP, CNPG_VERSION, CNPG_CLUSTER_KIND);
    let ar = ApiResource::from_gvk_with_plural(&gvk, CNPG_CLUSTER_PLURAL);
    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &ar);

    let cluster = api.get(cluster_name).await.map_err(|e| {
        ProvisioningError::BadRequest(format!("failed to read Cluster {namespace}/{cluster_name}: {e}"))
    })?;

    let image = cluster
        .data
        .get("spec")
        .and_then(|s| s.get("imageName"))
        .and_then(|v| v.as_str())
        .map(String::from);

    match image {
        Some(image) => {
            debug!(cluster = cluster_name, image, "resolved database image");
            Ok(image)
        }
        None => Ok(DEFAULT_DATABASE_IMAGE.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, TypedObjectReference};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn rejects_claim_without_data_source() {
        let claim = PersistentVolumeClaim {
            metadata: ObjectMeta::default(),
            spec: Some(PersistentVolumeClaimSpec::default()),
            ..Default::default()
        };
        let err = require_claim_data_source(&claim).unwrap_err();
        assert!(err.is_permanent());
    }

    #[test]
    fn rejects_wrong_kind_data_source() {
        let claim = PersistentVolumeClaim {
            metadata: ObjectMeta::default(),
            spec: Some(PersistentVolumeClaimSpec {
                data_source_ref: Some(TypedObjectReference {
                    api_group: None,
                    kind: "Secret".into(),
                    name: "whatever".into(),
                    namespace: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = require_claim_data_source(&claim).unwrap_err();
        assert!(err.is_permanent());
    }

    #[test]
    fn accepts_claim_data_source() {
        let claim = PersistentVolumeClaim {
            metadata: ObjectMeta::default(),
            spec: Some(PersistentVolumeClaimSpec {
                data_source_ref: Some(TypedObjectReference {
                    api_group: None,
                    kind: "PersistentVolumeClaim".into(),
                    name: "db-1-data".into(),
                    namespace: Some("app".into()),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let (name, ns) = require_claim_data_source(&claim).unwrap();
        assert_eq!(name, "db-1-data");
        assert_eq!(ns.as_deref(), Some("app"));
    }
}
