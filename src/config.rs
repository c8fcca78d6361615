use lazy_static::lazy_static;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Storage class provisioner name this controller reacts to (§6).
pub const PROVISIONER_NAME: &str = "k8s.insiderscore.com/pg-reflinker";

/// Label applied to every object this controller creates.
pub const MANAGED_BY_LABEL_KEY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_LABEL_VALUE: &str = "pg-reflinker";

/// Group/version/kind of the CNPG Cluster CRD, owned by an external operator.
pub const CNPG_GROUP: &str = "postgresql.cnpg.io";
pub const CNPG_VERSION: &str = "v1";
pub const CNPG_CLUSTER_KIND: &str = "Cluster";
pub const CNPG_CLUSTER_PLURAL: &str = "clusters";

/// Label used by the CNPG operator to mark pods belonging to a cluster.
pub const CNPG_CLUSTER_POD_LABEL: &str = "cnpg.io/cluster";

/// Fallback PostgreSQL image when the Cluster spec doesn't set one.
pub const DEFAULT_DATABASE_IMAGE: &str = "postgres:16";

/// Default reclaim policy when the storage class doesn't set one.
pub const DEFAULT_RECLAIM_POLICY: &str = "Retain";

/// Default requeue delay for transient "not ready yet" failures (§4.1, §7).
pub const NOT_YET_READY_REQUEUE_SECS: u64 = 30;

/// Namespace the cleanup Job falls back to if a SnapshotVolume is missing
/// its `source-namespace` annotation.
pub const DEFAULT_CLEANUP_NAMESPACE: &str = "default";

pub const CLEANUP_IMAGE: &str = "busybox:1.36";
pub const INIT_PERMISSIONS_IMAGE: &str = "busybox:1.36";

/// PostgreSQL's conventional uid/gid, also CNPG's.
pub const POSTGRES_UID: i64 = 26;
pub const POSTGRES_GID: i64 = 26;

// Annotation keys that constitute the SnapshotVolume's persistent state (§3).
pub const ANNOTATION_SOURCE_CLUSTER: &str = "pg-reflinker/source-cluster";
pub const ANNOTATION_SOURCE_NAMESPACE: &str = "pg-reflinker/source-namespace";
pub const ANNOTATION_SOURCE_PVC: &str = "pg-reflinker/source-pvc";
pub const ANNOTATION_SOURCE_BACKUP_LABEL: &str = "pg-reflinker/source-backup-label";
pub const ANNOTATION_CLAIM_NAMESPACE: &str = "pg-reflinker/claim-namespace";
pub const ANNOTATION_CLAIM_NAME: &str = "pg-reflinker/claim-name";
pub const ANNOTATION_STORAGE_CLASS: &str = "pg-reflinker/storage-class";
pub const ANNOTATION_NODE: &str = "pg-reflinker/node";

/// Annotation on the BackupJob tying it back to its SnapshotVolume's guid.
pub const ANNOTATION_PV_GUID: &str = "pg-reflinker/pv-guid";

lazy_static! {
    /// Parent directory on each node under which snapshot subvolumes are
    /// materialized. See §6.
    pub static ref HOSTPATH_PREFIX: String =
        std::env::var("HOSTPATH_PREFIX").unwrap_or_else(|_| "/var/lib/pg-reflinker".into());

    /// Additional namespaces searched, in order, when a claim's data source
    /// reference omits a namespace. See §4.1 step 3, §6.
    pub static ref NAMESPACE_PATH: Vec<String> = std::env::var("NAMESPACE_PATH")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
}

/// Returns the on-host directory for a snapshot with the given guid.
pub fn host_path(guid: &str) -> std::path::PathBuf {
    std::path::Path::new(HOSTPATH_PREFIX.as_str()).join(guid)
}
