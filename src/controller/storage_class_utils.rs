use kube::{Api, Client};
use k8s_openapi::api::storage::v1::StorageClass;
use tracing::warn;

use crate::config::PROVISIONER_NAME;
use crate::errors::{ProvisioningError, Result};

pub trait StorageClassExt {
    /// Whether this StorageClass is handled by this controller.
    fn is_controlling(&self) -> bool;
}

impl StorageClassExt for StorageClass {
    fn is_controlling(&self) -> bool {
        self.provisioner == PROVISIONER_NAME
    }
}

/// Whether the StorageClass named `name` is handled by this controller.
/// A missing StorageClass is not controlling, and is logged rather than
/// treated as an error, since the claim may simply be unrelated to us.
pub async fn is_controlling_storage_class(client: &Client, name: &str) -> Result<bool> {
    let storage_classes = Api::<StorageClass>::all(client.clone());
    match storage_classes.get_opt(name).await.map_err(ProvisioningError::OrchestratorApi)? {
        Some(sc) => Ok(sc.is_controlling()),
        None => {
            warn!(storage_class = name, "storage class not found");
            Ok(false)
        }
    }
}
