use thiserror::Error;

/// The taxonomy from §7: every resolution/publish step returns one of
/// these so the caller can decide whether to requeue.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    /// Malformed request: missing/wrong-kind data source, unreadable
    /// storage class, missing UID at bind time. Never retried.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The source claim couldn't be found in any candidate namespace.
    /// Never retried.
    #[error("source not found: {0}")]
    SourceNotFound(String),

    /// The source isn't ready yet (not Bound, no pods). Retried after
    /// `delay_secs`.
    #[error("not yet ready: {message} (retry in {delay_secs}s)")]
    NotYetReady { message: String, delay_secs: u64 },

    /// The source claim's ownership chain doesn't point at exactly one
    /// `postgresql.cnpg.io/v1` Cluster. Never retried.
    #[error("misowned: {0}")]
    Misowned(String),

    /// The orchestrator API itself failed or timed out. Retried.
    #[error("orchestrator API error: {0}")]
    OrchestratorApi(#[from] kube::Error),

    /// The spawned worker pod reported failure.
    #[error("backup job failed: {0}")]
    JobFailure(String),
}

impl ProvisioningError {
    /// Whether the orchestrator observer should give up instead of
    /// requeuing this request.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ProvisioningError::BadRequest(_)
                | ProvisioningError::SourceNotFound(_)
                | ProvisioningError::Misowned(_)
        )
    }

    /// Suggested requeue delay, if this error is transient.
    pub fn requeue_delay(&self) -> Option<std::time::Duration> {
        match self {
            ProvisioningError::NotYetReady { delay_secs, .. } => {
                Some(std::time::Duration::from_secs(*delay_secs))
            }
            ProvisioningError::OrchestratorApi(_) => {
                Some(std::time::Duration::from_secs(crate::config::NOT_YET_READY_REQUEUE_SECS))
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProvisioningError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_request_is_permanent() {
        assert!(ProvisioningError::BadRequest("x".into()).is_permanent());
        assert!(ProvisioningError::SourceNotFound("x".into()).is_permanent());
        assert!(ProvisioningError::Misowned("x".into()).is_permanent());
    }

    #[test]
    fn not_yet_ready_is_transient_with_delay() {
        let err = ProvisioningError::NotYetReady {
            message: "pending".into(),
            delay_secs: 30,
        };
        assert!(!err.is_permanent());
        assert_eq!(err.requeue_delay(), Some(std::time::Duration::from_secs(30)));
    }

    #[test]
    fn job_failure_is_not_permanent_and_has_no_requeue() {
        let err = ProvisioningError::JobFailure("x".into());
        assert!(!err.is_permanent());
        assert_eq!(err.requeue_delay(), None);
    }
}
