//! Defragmentation-specific error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the defragmentation engine and its collaborators.
///
/// Remote shards report failures through these variants as well; the engine
/// only distinguishes retriable from terminal errors (see
/// [`DefragError::is_retriable`]).
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DefragError {
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Shard unavailable: {0}")]
    ShardUnavailable(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Stale shard version: {0}")]
    StaleShardVersion(String),

    #[error("Stale routing info: {0}")]
    StaleRoutingInfo(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("No chunks found on shard: {0}")]
    NoChunksOnShard(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Remote operation failed: {0}")]
    Remote(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DefragError {
    /// Whether the originating work item may simply be re-enqueued.
    ///
    /// Transient transport failures and stale-routing responses are
    /// retriable; everything else is terminal for the current phase.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            DefragError::Timeout(_)
                | DefragError::ShardUnavailable(_)
                | DefragError::ConnectionLost(_)
                | DefragError::StaleShardVersion(_)
                | DefragError::StaleRoutingInfo(_)
        )
    }

    /// Get the error type as a string for log labeling
    pub fn error_type(&self) -> &'static str {
        match self {
            DefragError::Timeout(_) => "timeout",
            DefragError::ShardUnavailable(_) => "shard_unavailable",
            DefragError::ConnectionLost(_) => "connection_lost",
            DefragError::StaleShardVersion(_) => "stale_shard_version",
            DefragError::StaleRoutingInfo(_) => "stale_routing_info",
            DefragError::CollectionNotFound(_) => "collection_not_found",
            DefragError::NoChunksOnShard(_) => "no_chunks_on_shard",
            DefragError::Catalog(_) => "catalog",
            DefragError::Remote(_) => "remote",
            DefragError::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, DefragError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(DefragError::Timeout("5s elapsed".into()).is_retriable());
        assert!(DefragError::ShardUnavailable("shard-2".into()).is_retriable());
        assert!(DefragError::ConnectionLost("reset".into()).is_retriable());
        assert!(DefragError::StaleShardVersion("1|4".into()).is_retriable());
        assert!(DefragError::StaleRoutingInfo("epoch changed".into()).is_retriable());

        assert!(!DefragError::CollectionNotFound("db.coll".into()).is_retriable());
        assert!(!DefragError::NoChunksOnShard("shard-1".into()).is_retriable());
        assert!(!DefragError::Catalog("write failed".into()).is_retriable());
        assert!(!DefragError::Remote("invalid split key".into()).is_retriable());
        assert!(!DefragError::Internal("bug".into()).is_retriable());
    }

    #[test]
    fn test_display_impl() {
        let err = DefragError::StaleShardVersion("wanted 3|0".into());
        assert_eq!(err.to_string(), "Stale shard version: wanted 3|0");

        let err = DefragError::CollectionNotFound("inventory.items".into());
        assert_eq!(err.to_string(), "Collection not found: inventory.items");
    }

    #[test]
    fn test_error_type_labels() {
        assert_eq!(DefragError::Timeout("".into()).error_type(), "timeout");
        assert_eq!(DefragError::Catalog("".into()).error_type(), "catalog");
        assert_eq!(
            DefragError::NoChunksOnShard("".into()).error_type(),
            "no_chunks_on_shard"
        );
    }

    #[test]
    fn test_serde_roundtrip() {
        let err = DefragError::StaleRoutingInfo("collection epoch mismatch".into());
        let json = serde_json::to_string(&err).unwrap();
        let back: DefragError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
