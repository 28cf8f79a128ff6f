/**
 * Typed conditions surfaced by the cluster cache
 */
use super::identity::ClusterId;
use super::kind::ResourceKind;
use crate::error::Error;
use thiserror::Error as ThisError;

#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum CacheError {
    /// The caller's wait elapsed while the listed kinds were still syncing
    #[error("cluster {cluster_id}: still syncing {pending:?}")]
    SyncTimeout {
        cluster_id: ClusterId,
        pending: Vec<ResourceKind>,
    },

    /// First sync failed (unreachable API server, rejected credentials, RBAC denial)
    #[error("cluster {cluster_id} unavailable{}: {reason}", kind_suffix(.kind))]
    ClusterUnavailable {
        cluster_id: ClusterId,
        kind: Option<ResourceKind>,
        reason: String,
        code: Option<u16>,
    },

    /// Lister requested before the kind's session exists or has synced
    #[error("cluster {cluster_id}: {kind} not ready")]
    NotReady {
        cluster_id: ClusterId,
        kind: ResourceKind,
    },

    /// The cache entry was retired; re-resolve through the manager
    #[error("cluster {cluster_id}: cache entry retired")]
    Retired { cluster_id: ClusterId },

    #[error("invalid label selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("cached {kind} {name} could not be decoded: {reason}")]
    Decode {
        kind: ResourceKind,
        name: String,
        reason: String,
    },

    /// Mutex/rwlock poisoning (indicates prior panic)
    #[error("{0} - this indicates a prior panic, cache state may be inconsistent")]
    LockPoisoned(String),
}

impl CacheError {
    /// Build a `ClusterUnavailable` from the error that broke the first sync
    #[must_use]
    pub fn unavailable(cluster_id: ClusterId, kind: Option<ResourceKind>, error: &Error) -> Self {
        Self::ClusterUnavailable {
            cluster_id,
            kind,
            reason: error.to_string(),
            code: error.api_status(),
        }
    }

    /// Whether retrying the same request later may succeed without operator action
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SyncTimeout { .. } | Self::NotReady { .. } | Self::Retired { .. }
        )
    }

    /// Status code a handler should answer with
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::SyncTimeout { .. } | Self::NotReady { .. } => 503,
            Self::ClusterUnavailable {
                code: Some(code @ (401 | 403)),
                ..
            } => *code,
            Self::ClusterUnavailable { .. } => 404,
            Self::Retired { .. } => 409,
            Self::InvalidSelector { .. } => 400,
            Self::Decode { .. } | Self::LockPoisoned(_) => 500,
        }
    }
}

fn kind_suffix(kind: &Option<ResourceKind>) -> String {
    kind.map(|k| format!(" ({k})")).unwrap_or_default()
}

/// Create a `LockPoisoned` error for mutex/rwlock poisoning
#[must_use]
pub fn lock_poisoned_error(message: &str) -> CacheError {
    CacheError::LockPoisoned(message.to_string())
}
