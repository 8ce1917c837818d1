//! Defragmentation policy engine for a sharded collection balancer
//!
//! When a collection's data ends up scattered across many undersized chunks,
//! routing tables bloat and balancing degrades. This crate decides how to
//! put such a collection back together: it walks the collection through a
//! three-phase state machine (merge, move-and-merge, split) and emits the
//! remote operations — merges, data-size probes, chunk moves, splits — that
//! an external executor dispatches against the shards.
//!
//! # Architecture
//!
//! - **Engine**: [`engine::DefragmentationPolicy`], the streaming façade.
//!   Serves actions under a concurrency cap, multiplexes collections
//!   round-robin, and receives result acknowledgements.
//! - **Orchestrator**: per-collection phase holder; persists every phase
//!   transition through the catalog before the next phase produces work.
//! - **Phases**: merge coalesces runs of same-shard same-zone chunks;
//!   move-and-merge pairs small chunks with adjacent siblings under zone and
//!   capacity constraints; split restores the chunk size target.
//! - **Catalog**: [`catalog::CollectionCatalog`] and
//!   [`catalog::ClusterStatistics`] are the only collaborator seams — the
//!   engine itself performs no I/O.
//!
//! # Key properties
//!
//! - Every action carries the source shard's routing version at emission.
//! - A chunk is referenced by at most one in-flight operation at a time.
//! - Retriable remote errors re-enqueue the originating work item; terminal
//!   errors abort the phase to a predetermined fallback.
//! - Phase transitions are persisted before the new phase emits anything,
//!   so a restarted balancer resumes where the record says it left off.

pub mod actions;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod phases;
pub mod types;
pub mod zones;

mod orchestrator;

#[cfg(test)]
pub(crate) mod test_support;

pub use actions::{
    ActionStreamItem, AutoSplitVectorAction, DataSizeAction, DataSizeResponse, DefragAction,
    MergeAction, MigrateAction, MigrationReason, SplitAction,
};
pub use catalog::{ChunkCatalogView, CollectionCatalog, ClusterStatistics};
pub use config::DefragmentationConfig;
pub use engine::{DefragmentationPolicy, NextAction};
pub use error::{DefragError, Result};
pub use phases::DefragmentationPhaseKind;
pub use types::{
    ChunkMetadata, ChunkRange, CollectionDescription, KeyBound, KeyPattern, RoutingVersion,
    ShardId, ShardStats, VersionEpoch,
};
pub use zones::ZoneIndex;
