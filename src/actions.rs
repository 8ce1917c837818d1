//! Actions the engine hands to the external executor
//!
//! The engine itself performs no I/O: every remote effect is described by one
//! of the variants below, dispatched by the surrounding balancer against the
//! target shard, and reported back through the typed acknowledgement methods
//! on [`crate::engine::DefragmentationPolicy`].

use crate::error::{DefragError, Result};
use crate::types::{ChunkRange, KeyBound, KeyPattern, RoutingVersion, ShardId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Probe the physical size of a chunk's data on its shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSizeAction {
    pub shard: ShardId,
    pub ns: String,
    pub uuid: Uuid,
    pub range: ChunkRange,
    pub version: RoutingVersion,
    pub key_pattern: KeyPattern,
    /// When false the shard performs a full scan rather than extrapolating
    pub estimate: bool,
}

/// Coalesce all chunks covered by `range` on `shard` into one chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeAction {
    pub shard: ShardId,
    pub ns: String,
    pub uuid: Uuid,
    pub version: RoutingVersion,
    pub range: ChunkRange,
}

/// Why a chunk migration was requested. Defragmentation only ever moves
/// chunks to shrink a fragmented collection's chunk count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationReason {
    ChunksImbalance,
}

/// Move one chunk from its current shard to a destination shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateAction {
    pub dest_shard: ShardId,
    pub ns: String,
    pub uuid: Uuid,
    pub range: ChunkRange,
    pub source_shard: ShardId,
    pub version: RoutingVersion,
    /// Move the chunk even if it exceeds the configured chunk size
    pub force_jumbo: bool,
    pub reason: MigrationReason,
}

/// Ask a shard to compute split points for an oversized range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoSplitVectorAction {
    pub shard: ShardId,
    pub ns: String,
    pub uuid: Uuid,
    pub version: RoutingVersion,
    pub key_pattern: KeyPattern,
    pub min: KeyBound,
    pub max: KeyBound,
    pub max_chunk_size_bytes: u64,
}

/// Split a range at previously discovered split points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitAction {
    pub shard: ShardId,
    pub ns: String,
    pub uuid: Uuid,
    pub version: RoutingVersion,
    pub min: KeyBound,
    pub max: KeyBound,
    pub split_points: Vec<KeyBound>,
    pub key_pattern: KeyPattern,
}

/// The closed set of remote effects the engine can request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DefragAction {
    DataSize(DataSizeAction),
    Merge(MergeAction),
    Migrate(MigrateAction),
    AutoSplitVector(AutoSplitVectorAction),
    Split(SplitAction),
}

impl DefragAction {
    /// Collection the action belongs to.
    pub fn uuid(&self) -> Uuid {
        match self {
            DefragAction::DataSize(a) => a.uuid,
            DefragAction::Merge(a) => a.uuid,
            DefragAction::Migrate(a) => a.uuid,
            DefragAction::AutoSplitVector(a) => a.uuid,
            DefragAction::Split(a) => a.uuid,
        }
    }

    /// Short action name for log labeling
    pub fn kind_name(&self) -> &'static str {
        match self {
            DefragAction::DataSize(_) => "data_size",
            DefragAction::Merge(_) => "merge",
            DefragAction::Migrate(_) => "migrate",
            DefragAction::AutoSplitVector(_) => "auto_split_vector",
            DefragAction::Split(_) => "split",
        }
    }
}

/// One element of the engine's action stream.
#[derive(Debug, Clone)]
pub enum ActionStreamItem {
    Action(DefragAction),
    /// The stream was closed; no further actions will ever be produced.
    EndOfStream,
}

/// Successful payload of a [`DataSizeAction`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSizeResponse {
    pub size_bytes: u64,
    pub num_objects: u64,
}

/// Uniform view of a remote result, routed to the owning phase.
#[derive(Debug, Clone)]
pub(crate) enum ActionOutcome {
    /// Merge, migrate and split actions report bare success or failure
    Unit(Result<()>),
    DataSize(Result<DataSizeResponse>),
    SplitPoints(Result<Vec<KeyBound>>),
}

impl ActionOutcome {
    /// The result status, with the success payload erased.
    pub(crate) fn status(&self) -> std::result::Result<(), &DefragError> {
        match self {
            ActionOutcome::Unit(r) => r.as_ref().map(|_| ()),
            ActionOutcome::DataSize(r) => r.as_ref().map(|_| ()),
            ActionOutcome::SplitPoints(r) => r.as_ref().map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KeyBound;

    #[test]
    fn test_action_uuid_accessor() {
        let uuid = Uuid::new_v4();
        let action = DefragAction::Merge(MergeAction {
            shard: "shard-1".into(),
            ns: "db.coll".to_string(),
            uuid,
            version: RoutingVersion::new(Uuid::new_v4(), 1, 1, 0),
            range: ChunkRange::new(KeyBound::MinKey, KeyBound::MaxKey),
        });
        assert_eq!(action.uuid(), uuid);
        assert_eq!(action.kind_name(), "merge");
    }

    #[test]
    fn test_outcome_status_erases_payload() {
        let ok = ActionOutcome::DataSize(Ok(DataSizeResponse {
            size_bytes: 42,
            num_objects: 7,
        }));
        assert!(ok.status().is_ok());

        let err = ActionOutcome::Unit(Err(DefragError::Timeout("probe".into())));
        assert!(err.status().is_err());
    }
}
