//! Shared in-memory doubles for driving the engine end to end.

#![allow(dead_code)]

use defrag_policy::{
    ChunkMetadata, ChunkRange, CollectionCatalog, CollectionDescription, ClusterStatistics,
    DefragError, DefragmentationConfig, DefragmentationPhaseKind, DefragmentationPolicy, KeyBound,
    KeyPattern, Result, RoutingVersion, ShardId, ShardStats,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Catalog double backed by hash maps, recording every write it receives.
#[derive(Default)]
pub struct TestCatalog {
    pub collections: Mutex<HashMap<Uuid, CollectionDescription>>,
    pub chunks: Mutex<HashMap<Uuid, Vec<ChunkMetadata>>>,
    pub zones: Mutex<HashMap<Uuid, Vec<(ChunkRange, String)>>>,
    pub persisted_phases: Mutex<Vec<(Uuid, Option<DefragmentationPhaseKind>)>>,
    pub size_estimates: Mutex<Vec<(ChunkRange, u64)>>,
    pub cleared_estimates: Mutex<Vec<Uuid>>,
}

impl TestCatalog {
    pub fn insert_collection(&self, coll: CollectionDescription, chunks: Vec<ChunkMetadata>) {
        self.chunks.lock().insert(coll.uuid, chunks);
        self.collections.lock().insert(coll.uuid, coll);
    }

    /// Mimic the metadata commit a successful merge performs remotely:
    /// replace the covered chunks with the single merged chunk.
    pub fn apply_merge(&self, uuid: Uuid, range: &ChunkRange) {
        let mut chunks = self.chunks.lock();
        let Some(list) = chunks.get_mut(&uuid) else {
            return;
        };
        let Some(first) = list.iter().position(|c| c.range.min == range.min) else {
            return;
        };
        let shard = list[first].shard.clone();
        let version = list[first].version;
        list.retain(|c| !(c.range.min >= range.min && c.range.max <= range.max));
        list.insert(
            first.min(list.len()),
            ChunkMetadata {
                range: range.clone(),
                shard,
                version,
                estimated_size_bytes: None,
            },
        );
        list.sort_by(|a, b| a.range.min.cmp(&b.range.min));
    }
}

impl CollectionCatalog for TestCatalog {
    fn collection(&self, uuid: Uuid) -> Result<CollectionDescription> {
        self.collections
            .lock()
            .get(&uuid)
            .cloned()
            .ok_or_else(|| DefragError::CollectionNotFound(uuid.to_string()))
    }

    fn collection_chunks(&self, coll: &CollectionDescription) -> Result<Vec<ChunkMetadata>> {
        let mut chunks = self
            .chunks
            .lock()
            .get(&coll.uuid)
            .cloned()
            .unwrap_or_default();
        chunks.sort_by(|a, b| a.range.min.cmp(&b.range.min));
        Ok(chunks)
    }

    fn latest_shard_version(
        &self,
        coll: &CollectionDescription,
        shard: &ShardId,
    ) -> Result<RoutingVersion> {
        self.chunks
            .lock()
            .get(&coll.uuid)
            .into_iter()
            .flatten()
            .filter(|c| c.shard == *shard)
            .map(|c| c.version)
            .max_by_key(|v| (v.timestamp, v.major, v.minor))
            .ok_or_else(|| DefragError::NoChunksOnShard(shard.to_string()))
    }

    fn zone_ranges(&self, coll: &CollectionDescription) -> Result<Vec<(ChunkRange, String)>> {
        Ok(self.zones.lock().get(&coll.uuid).cloned().unwrap_or_default())
    }

    fn persist_phase(&self, uuid: Uuid, phase: Option<DefragmentationPhaseKind>) -> Result<()> {
        let mut collections = self.collections.lock();
        let record = collections
            .get_mut(&uuid)
            .ok_or_else(|| DefragError::CollectionNotFound(uuid.to_string()))?;
        record.defragmentation_phase = phase;
        if phase.is_none() {
            record.defragment_collection = false;
        }
        self.persisted_phases.lock().push((uuid, phase));
        Ok(())
    }

    fn persist_chunk_size_estimate(
        &self,
        coll: &CollectionDescription,
        range: &ChunkRange,
        size_bytes: u64,
    ) -> Result<()> {
        if let Some(chunks) = self.chunks.lock().get_mut(&coll.uuid) {
            for chunk in chunks.iter_mut() {
                if chunk.range.min == range.min {
                    chunk.estimated_size_bytes = Some(size_bytes);
                }
            }
        }
        self.size_estimates.lock().push((range.clone(), size_bytes));
        Ok(())
    }

    fn clear_chunk_size_estimates(&self, uuid: Uuid) -> Result<()> {
        if let Some(chunks) = self.chunks.lock().get_mut(&uuid) {
            for chunk in chunks.iter_mut() {
                chunk.estimated_size_bytes = None;
            }
        }
        self.cleared_estimates.lock().push(uuid);
        Ok(())
    }
}

/// Statistics double returning fixed per-collection snapshots.
#[derive(Default)]
pub struct TestStatistics {
    pub stats: Mutex<HashMap<Uuid, Vec<ShardStats>>>,
}

impl ClusterStatistics for TestStatistics {
    fn collection_shard_stats(&self, coll: &CollectionDescription) -> Result<Vec<ShardStats>> {
        Ok(self.stats.lock().get(&coll.uuid).cloned().unwrap_or_default())
    }
}

pub struct Harness {
    pub catalog: Arc<TestCatalog>,
    pub stats: Arc<TestStatistics>,
    pub engine: DefragmentationPolicy,
}

pub fn make_engine(config: DefragmentationConfig) -> Harness {
    let catalog = Arc::new(TestCatalog::default());
    let stats = Arc::new(TestStatistics::default());
    let engine = DefragmentationPolicy::new(
        Arc::clone(&catalog) as Arc<dyn CollectionCatalog>,
        Arc::clone(&stats) as Arc<dyn ClusterStatistics>,
        config,
    );
    Harness {
        catalog,
        stats,
        engine,
    }
}

pub fn key(bytes: &[u8]) -> KeyBound {
    KeyBound::key(bytes.to_vec())
}

pub fn make_collection(ns: &str, max_chunk_size_bytes: u64) -> CollectionDescription {
    CollectionDescription {
        ns: ns.to_string(),
        uuid: Uuid::new_v4(),
        key_pattern: KeyPattern::new(serde_json::json!({ "_id": 1 })),
        defragment_collection: true,
        defragmentation_phase: None,
        max_chunk_size_bytes: Some(max_chunk_size_bytes),
    }
}

pub fn make_chunk(
    min: KeyBound,
    max: KeyBound,
    shard: &str,
    estimated_size_bytes: Option<u64>,
) -> ChunkMetadata {
    ChunkMetadata {
        range: ChunkRange::new(min, max),
        shard: shard.into(),
        version: RoutingVersion::new(Uuid::new_v4(), 1, 1, 0),
        estimated_size_bytes,
    }
}

pub fn make_shard_stats(shard: &str, current_size_bytes: u64) -> ShardStats {
    ShardStats {
        shard: shard.into(),
        current_size_bytes,
        max_size_bytes: 0,
        draining: false,
    }
}

pub fn draining_shard_stats(shard: &str, current_size_bytes: u64) -> ShardStats {
    ShardStats {
        shard: shard.into(),
        current_size_bytes,
        max_size_bytes: 0,
        draining: true,
    }
}
