//! Collaborator seams for the external metadata catalog
//!
//! The engine is a pure state machine: everything it knows about the cluster
//! arrives through these traits, and every durable side effect (phase
//! persistence, size estimates) leaves through them. Implementations are
//! expected to be synchronous — action production never suspends, so the
//! engine calls the catalog under its own lock.

use crate::error::Result;
use crate::phases::DefragmentationPhaseKind;
use crate::types::{
    ChunkMetadata, ChunkRange, CollectionDescription, RoutingVersion, ShardId, ShardStats,
};
use crate::zones::ZoneIndex;
use std::sync::Arc;
use uuid::Uuid;

/// Read/write access to the sharding metadata store.
pub trait CollectionCatalog: Send + Sync {
    /// Fetch the current catalog record for a collection.
    fn collection(&self, uuid: Uuid) -> Result<CollectionDescription>;

    /// Fetch the collection's chunks, sorted by ascending min bound.
    fn collection_chunks(&self, coll: &CollectionDescription) -> Result<Vec<ChunkMetadata>>;

    /// Routing version of the shard's most recently modified chunk in the
    /// collection. Errors with `NoChunksOnShard` when the shard owns none.
    fn latest_shard_version(
        &self,
        coll: &CollectionDescription,
        shard: &ShardId,
    ) -> Result<RoutingVersion>;

    /// The collection's zone ranges as a range-to-tag listing.
    fn zone_ranges(&self, coll: &CollectionDescription) -> Result<Vec<(ChunkRange, String)>>;

    /// Persist the defragmentation phase on the collection record.
    ///
    /// `Some(phase)` sets the phase field; `None` unsets it together with
    /// the defragmentation request flag (the terminal encoding). Matching
    /// zero documents is a `CollectionNotFound` error. The update must be
    /// idempotent-safe and durable (majority write concern or equivalent).
    fn persist_phase(&self, uuid: Uuid, phase: Option<DefragmentationPhaseKind>) -> Result<()>;

    /// Record a freshly probed size estimate on one chunk.
    fn persist_chunk_size_estimate(
        &self,
        coll: &CollectionDescription,
        range: &ChunkRange,
        size_bytes: u64,
    ) -> Result<()>;

    /// Unset the size estimate of every chunk in the collection
    /// (multi-update; estimates are invalid once chunks have been split).
    fn clear_chunk_size_estimates(&self, uuid: Uuid) -> Result<()>;
}

/// Source of per-shard statistics snapshots.
pub trait ClusterStatistics: Send + Sync {
    /// Statistics of every shard hosting data for the collection.
    fn collection_shard_stats(&self, coll: &CollectionDescription) -> Result<Vec<ShardStats>>;
}

/// Read-through view bundling the catalog and statistics sources, plus the
/// engine defaults that fill in optional collection settings.
#[derive(Clone)]
pub struct ChunkCatalogView {
    catalog: Arc<dyn CollectionCatalog>,
    stats: Arc<dyn ClusterStatistics>,
    default_max_chunk_size_bytes: u64,
}

impl ChunkCatalogView {
    pub fn new(
        catalog: Arc<dyn CollectionCatalog>,
        stats: Arc<dyn ClusterStatistics>,
        default_max_chunk_size_bytes: u64,
    ) -> Self {
        Self {
            catalog,
            stats,
            default_max_chunk_size_bytes,
        }
    }

    pub fn collection(&self, uuid: Uuid) -> Result<CollectionDescription> {
        self.catalog.collection(uuid)
    }

    pub fn collection_chunks(&self, coll: &CollectionDescription) -> Result<Vec<ChunkMetadata>> {
        self.catalog.collection_chunks(coll)
    }

    pub fn shard_version(
        &self,
        coll: &CollectionDescription,
        shard: &ShardId,
    ) -> Result<RoutingVersion> {
        self.catalog.latest_shard_version(coll, shard)
    }

    pub fn zone_index(&self, coll: &CollectionDescription) -> Result<ZoneIndex> {
        Ok(ZoneIndex::new(self.catalog.zone_ranges(coll)?))
    }

    pub fn shard_stats(&self, coll: &CollectionDescription) -> Result<Vec<ShardStats>> {
        self.stats.collection_shard_stats(coll)
    }

    /// Chunk size target for the collection: its own override, or the
    /// engine-wide default.
    pub fn effective_max_chunk_size(&self, coll: &CollectionDescription) -> u64 {
        coll.max_chunk_size_bytes
            .unwrap_or(self.default_max_chunk_size_bytes)
    }

    pub fn persist_phase(
        &self,
        uuid: Uuid,
        phase: Option<DefragmentationPhaseKind>,
    ) -> Result<()> {
        self.catalog.persist_phase(uuid, phase)
    }

    pub fn persist_chunk_size_estimate(
        &self,
        coll: &CollectionDescription,
        range: &ChunkRange,
        size_bytes: u64,
    ) -> Result<()> {
        self.catalog.persist_chunk_size_estimate(coll, range, size_bytes)
    }

    pub fn clear_chunk_size_estimates(&self, uuid: Uuid) -> Result<()> {
        self.catalog.clear_chunk_size_estimates(uuid)
    }
}
