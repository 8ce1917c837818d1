//! Core routing-table types: shard ids, key bounds, chunk ranges and the
//! catalog records the engine consumes.

use crate::phases::DefragmentationPhaseKind;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Stable identifier of a shard (storage node) in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId(pub String);

impl ShardId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        ShardId(s.to_string())
    }
}

impl From<String> for ShardId {
    fn from(s: String) -> Self {
        ShardId(s)
    }
}

/// A bound in shard-key space.
///
/// Encoded keys compare bytewise; the two sentinels delimit the key space,
/// so `MinKey < Key(_) < MaxKey` falls out of the variant order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyBound {
    MinKey,
    Key(Vec<u8>),
    MaxKey,
}

impl KeyBound {
    pub fn key(bytes: impl Into<Vec<u8>>) -> Self {
        KeyBound::Key(bytes.into())
    }

    /// Byte length of the encoded key; sentinels carry no payload.
    pub fn payload_len(&self) -> usize {
        match self {
            KeyBound::Key(bytes) => bytes.len(),
            KeyBound::MinKey | KeyBound::MaxKey => 0,
        }
    }
}

/// Half-open key range `[min, max)` owned by exactly one shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRange {
    pub min: KeyBound,
    pub max: KeyBound,
}

impl ChunkRange {
    pub fn new(min: KeyBound, max: KeyBound) -> Self {
        Self { min, max }
    }

    pub fn contains_key(&self, key: &KeyBound) -> bool {
        *key >= self.min && *key < self.max
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}, {:?})", self.min, self.max)
    }
}

/// Opaque descriptor of a collection's shard key, forwarded verbatim to
/// shards inside data-size and split actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyPattern(pub serde_json::Value);

impl KeyPattern {
    pub fn new(value: serde_json::Value) -> Self {
        KeyPattern(value)
    }
}

/// Epoch component of a routing version.
///
/// `Unsharded` and `Ignored` are reserved wire sentinels: they round-trip
/// bit-exactly but never participate in ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionEpoch {
    Sharded(Uuid),
    Unsharded,
    Ignored,
}

/// Routing-table revision for a collection, attached to every action sent
/// to a shard so stale dispatches can be detected remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingVersion {
    pub epoch: VersionEpoch,
    pub timestamp: u64,
    pub major: u32,
    pub minor: u32,
}

impl RoutingVersion {
    pub fn new(epoch: Uuid, timestamp: u64, major: u32, minor: u32) -> Self {
        Self {
            epoch: VersionEpoch::Sharded(epoch),
            timestamp,
            major,
            minor,
        }
    }

    pub fn unsharded() -> Self {
        Self {
            epoch: VersionEpoch::Unsharded,
            timestamp: 0,
            major: 0,
            minor: 0,
        }
    }

    pub fn ignored() -> Self {
        Self {
            epoch: VersionEpoch::Ignored,
            timestamp: 0,
            major: 0,
            minor: 0,
        }
    }

    /// Two versions order only when both belong to the same sharded epoch.
    pub fn is_comparable_with(&self, other: &RoutingVersion) -> bool {
        matches!(
            (&self.epoch, &other.epoch),
            (VersionEpoch::Sharded(a), VersionEpoch::Sharded(b)) if a == b
        )
    }
}

impl PartialOrd for RoutingVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if !self.is_comparable_with(other) {
            return None;
        }
        Some(
            self.timestamp
                .cmp(&other.timestamp)
                .then(self.major.cmp(&other.major))
                .then(self.minor.cmp(&other.minor)),
        )
    }
}

impl fmt::Display for RoutingVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.epoch {
            VersionEpoch::Sharded(epoch) => {
                write!(
                    f,
                    "{}|{}|{}:{}",
                    self.timestamp, self.major, self.minor, epoch
                )
            }
            VersionEpoch::Unsharded => f.write_str("UNSHARDED"),
            VersionEpoch::Ignored => f.write_str("IGNORED"),
        }
    }
}

/// Catalog record for a sharded collection, as read from the external
/// metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionDescription {
    /// Fully qualified namespace (`db.collection`)
    pub ns: String,

    /// Immutable collection identity
    pub uuid: Uuid,

    /// Shard key descriptor
    pub key_pattern: KeyPattern,

    /// Whether defragmentation has been requested for this collection
    #[serde(default)]
    pub defragment_collection: bool,

    /// Persisted phase of an in-progress defragmentation run, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defragmentation_phase: Option<DefragmentationPhaseKind>,

    /// Per-collection chunk size target; falls back to the engine default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_chunk_size_bytes: Option<u64>,
}

/// Catalog record for a single chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub range: ChunkRange,

    pub shard: ShardId,

    /// Routing version stamped on the chunk's last modification
    pub version: RoutingVersion,

    /// Data-size estimate gathered by a previous probe, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_size_bytes: Option<u64>,
}

/// Point-in-time statistics for one shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardStats {
    pub shard: ShardId,

    /// Current data size hosted by the shard
    pub current_size_bytes: u64,

    /// Configured capacity; `0` means unbounded
    pub max_size_bytes: u64,

    /// Whether the shard is being decommissioned
    pub draining: bool,
}

impl ShardStats {
    /// A shard accepts new chunks unless it is draining or full.
    pub fn can_receive_chunks(&self) -> bool {
        if self.draining {
            return false;
        }
        self.max_size_bytes == 0 || self.current_size_bytes < self.max_size_bytes
    }
}
