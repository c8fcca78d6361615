use uuid::Uuid;

/// The 128-bit snapshot identity derived from a claim's UID (§3, §6).
///
/// Kubernetes UIDs are already UUIDs, so deriving the guid is just
/// parsing; a random v4 is generated only in the documented fallback
/// case of a UID being unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid(Uuid);

impl Guid {
    pub fn from_claim_uid(uid: Option<&str>) -> Self {
        let parsed = uid.and_then(|u| Uuid::parse_str(u).ok());
        Guid(parsed.unwrap_or_else(Uuid::new_v4))
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }

    /// `pvc-{guid}`, the published volume's name.
    pub fn volume_name(&self) -> String {
        format!("pvc-{}", self.as_str())
    }

    /// `pg-reflinker-{guid}`, the backup worker Job's name.
    pub fn backup_job_name(&self) -> String {
        format!("pg-reflinker-{}", self.as_str())
    }

    /// `pg-reflinker-cleanup-{guid}`, the reclaim cleanup Job's name.
    pub fn cleanup_job_name(&self) -> String {
        format!("pg-reflinker-cleanup-{}", self.as_str())
    }

    /// Recovers the guid from a volume name of the form `pvc-{guid}`.
    pub fn from_volume_name(name: &str) -> Option<Self> {
        name.strip_prefix("pvc-")
            .and_then(|s| Uuid::parse_str(s).ok())
            .map(Guid)
    }

    /// Recovers the guid from a backup job name of the form
    /// `pg-reflinker-{guid}`. Returns `None` for cleanup job names too,
    /// since those carry an extra `cleanup-` segment that won't parse as
    /// a UUID.
    pub fn from_backup_job_name(name: &str) -> Option<Self> {
        name.strip_prefix("pg-reflinker-")
            .and_then(|s| Uuid::parse_str(s).ok())
            .map(Guid)
    }
}

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_same_guid_from_same_uid() {
        let uid = "abcd1234-0000-0000-0000-000000000000";
        let a = Guid::from_claim_uid(Some(uid));
        let b = Guid::from_claim_uid(Some(uid));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), uid);
    }

    #[test]
    fn falls_back_to_random_when_uid_missing() {
        let a = Guid::from_claim_uid(None);
        let b = Guid::from_claim_uid(None);
        assert_ne!(a, b);
    }

    #[test]
    fn falls_back_to_random_when_uid_unparseable() {
        let a = Guid::from_claim_uid(Some("not-a-uuid"));
        assert!(Uuid::parse_str(&a.as_str()).is_ok());
    }

    #[test]
    fn volume_and_job_names_round_trip() {
        let guid = Guid::from_claim_uid(Some("abcd1234-0000-0000-0000-000000000000"));
        assert_eq!(guid.volume_name(), "pvc-abcd1234-0000-0000-0000-000000000000");
        assert_eq!(
            guid.backup_job_name(),
            "pg-reflinker-abcd1234-0000-0000-0000-000000000000"
        );
        assert_eq!(Guid::from_volume_name(&guid.volume_name()), Some(guid));
    }

    #[test]
    fn from_volume_name_rejects_bad_input() {
        assert!(Guid::from_volume_name("not-a-pvc-name").is_none());
        assert!(Guid::from_volume_name("pvc-not-a-uuid").is_none());
    }

    #[test]
    fn from_backup_job_name_round_trips_and_rejects_cleanup_jobs() {
        let guid = Guid::from_claim_uid(Some("abcd1234-0000-0000-0000-000000000000"));
        assert_eq!(Guid::from_backup_job_name(&guid.backup_job_name()), Some(guid));
        assert_eq!(Guid::from_backup_job_name(&guid.cleanup_job_name()), None);
    }
}
