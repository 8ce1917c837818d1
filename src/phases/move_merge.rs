//! Move-and-merge phase
//!
//! Pairs each small chunk with an adjacent sibling, moves it onto the
//! sibling's shard when needed, and merges the two — shrinking the chunk
//! count without crossing zone boundaries or overfilling shards. The phase
//! keeps the collection's routing table in memory and replays every
//! successful result against it, so decisions always reflect the moves and
//! merges already applied.
//!
//! Chunks live in an arena-backed doubly linked list ([`ChunkChain`]):
//! erasing a merged-away chunk vacates its slot and relinks the neighbors,
//! while the `ChunkRef` handles held by the per-shard small-chunk index and
//! the in-flight pipelines stay valid.

use super::{
    classify_result, reject_unexpected_action, DefragmentationPhase, DefragmentationPhaseKind,
    ResultDisposition,
};
use crate::actions::{
    ActionOutcome, DefragAction, MergeAction, MigrateAction, MigrationReason,
};
use crate::catalog::ChunkCatalogView;
use crate::error::Result;
use crate::types::{
    ChunkMetadata, ChunkRange, CollectionDescription, KeyBound, RoutingVersion, ShardId,
    ShardStats,
};
use crate::zones::ZoneIndex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::{error, warn};
use uuid::Uuid;

/// Percentage of the chunk size target below which a chunk is worth
/// merging away.
const SMALL_CHUNK_THRESHOLD_PCT: u64 = 25;

/// Stable handle into a [`ChunkChain`].
type ChunkRef = usize;

#[derive(Debug)]
struct ChunkEntry {
    range: ChunkRange,
    shard: ShardId,
    estimated_size_bytes: u64,
    busy: bool,
}

#[derive(Debug)]
struct ChunkSlot {
    entry: ChunkEntry,
    prev: Option<ChunkRef>,
    next: Option<ChunkRef>,
}

/// The collection routing table as an arena of doubly linked slots.
///
/// Slots are never reused, so a `ChunkRef` stays valid until its chunk is
/// erased; holding a ref across the erasure of *other* chunks is safe.
#[derive(Debug, Default)]
struct ChunkChain {
    slots: Vec<Option<ChunkSlot>>,
    head: Option<ChunkRef>,
    tail: Option<ChunkRef>,
    len: usize,
}

impl ChunkChain {
    fn push_back(&mut self, entry: ChunkEntry) -> ChunkRef {
        let idx = self.slots.len();
        self.slots.push(Some(ChunkSlot {
            entry,
            prev: self.tail,
            next: None,
        }));
        if let Some(tail) = self.tail {
            if let Some(slot) = self.slots[tail].as_mut() {
                slot.next = Some(idx);
            }
        } else {
            self.head = Some(idx);
        }
        self.tail = Some(idx);
        self.len += 1;
        idx
    }

    fn slot(&self, r: ChunkRef) -> &ChunkSlot {
        self.slots[r].as_ref().expect("stale chunk ref")
    }

    fn get(&self, r: ChunkRef) -> &ChunkEntry {
        &self.slot(r).entry
    }

    fn get_mut(&mut self, r: ChunkRef) -> &mut ChunkEntry {
        &mut self.slots[r].as_mut().expect("stale chunk ref").entry
    }

    fn prev(&self, r: ChunkRef) -> Option<ChunkRef> {
        self.slot(r).prev
    }

    fn next(&self, r: ChunkRef) -> Option<ChunkRef> {
        self.slot(r).next
    }

    /// Vacate a slot, splicing its neighbors together.
    fn remove(&mut self, r: ChunkRef) {
        let Some(slot) = self.slots[r].take() else {
            return;
        };
        match slot.prev {
            Some(p) => {
                if let Some(prev) = self.slots[p].as_mut() {
                    prev.next = slot.next;
                }
            }
            None => self.head = slot.next,
        }
        match slot.next {
            Some(n) => {
                if let Some(next) = self.slots[n].as_mut() {
                    next.prev = slot.prev;
                }
            }
            None => self.tail = slot.prev,
        }
        self.len -= 1;
    }

    fn len(&self) -> usize {
        self.len
    }

    fn iter(&self) -> ChunkChainIter<'_> {
        ChunkChainIter {
            chain: self,
            cursor: self.head,
        }
    }
}

struct ChunkChainIter<'a> {
    chain: &'a ChunkChain,
    cursor: Option<ChunkRef>,
}

impl<'a> Iterator for ChunkChainIter<'a> {
    type Item = (ChunkRef, &'a ChunkEntry);

    fn next(&mut self) -> Option<Self::Item> {
        let r = self.cursor?;
        let slot = self.chain.slot(r);
        self.cursor = slot.next;
        Some((r, &slot.entry))
    }
}

/// An in-flight pairing of a small chunk with the sibling it will be
/// merged into.
#[derive(Debug, Clone)]
struct MoveMergeRequest {
    chunk_to_move: ChunkRef,
    chunk_to_merge_with: ChunkRef,
    /// Whether the surviving sibling lies to the left of the moved chunk
    merge_with_left_sibling: bool,
}

impl MoveMergeRequest {
    fn new(chunk_to_move: ChunkRef, chunk_to_merge_with: ChunkRef, chain: &ChunkChain) -> Self {
        let merge_with_left_sibling =
            chain.get(chunk_to_merge_with).range.max == chain.get(chunk_to_move).range.min;
        Self {
            chunk_to_move,
            chunk_to_merge_with,
            merge_with_left_sibling,
        }
    }

    fn merged_range(&self, chain: &ChunkChain) -> ChunkRange {
        let moved = &chain.get(self.chunk_to_move).range;
        let kept = &chain.get(self.chunk_to_merge_with).range;
        if self.merge_with_left_sibling {
            ChunkRange::new(kept.min.clone(), moved.max.clone())
        } else {
            ChunkRange::new(moved.min.clone(), kept.max.clone())
        }
    }

    fn source_shard(&self, chain: &ChunkChain) -> ShardId {
        chain.get(self.chunk_to_move).shard.clone()
    }

    fn destination_shard(&self, chain: &ChunkChain) -> ShardId {
        chain.get(self.chunk_to_merge_with).shard.clone()
    }

    fn migration_min_key<'a>(&self, chain: &'a ChunkChain) -> &'a KeyBound {
        &chain.get(self.chunk_to_move).range.min
    }

    fn moved_size_bytes(&self, chain: &ChunkChain) -> u64 {
        chain.get(self.chunk_to_move).estimated_size_bytes
    }

    fn as_migrate_action(
        &self,
        chain: &ChunkChain,
        coll: &CollectionDescription,
        version: RoutingVersion,
    ) -> MigrateAction {
        MigrateAction {
            dest_shard: self.destination_shard(chain),
            ns: coll.ns.clone(),
            uuid: coll.uuid,
            range: chain.get(self.chunk_to_move).range.clone(),
            source_shard: self.source_shard(chain),
            version,
            force_jumbo: true,
            reason: MigrationReason::ChunksImbalance,
        }
    }

    fn as_merge_action(
        &self,
        chain: &ChunkChain,
        coll: &CollectionDescription,
        version: RoutingVersion,
    ) -> MergeAction {
        MergeAction {
            shard: self.destination_shard(chain),
            ns: coll.ns.clone(),
            uuid: coll.uuid,
            version,
            range: self.merged_range(chain),
        }
    }
}

pub(crate) struct MoveAndMergePhase {
    ns: String,
    uuid: Uuid,
    chunks: ChunkChain,
    /// Small-chunk handles per shard, sorted by ascending estimated size
    small_chunks_by_shard: BTreeMap<ShardId, Vec<ChunkRef>>,
    shard_infos: HashMap<ShardId, ShardStats>,
    /// Shard ids sorted by descending current data size
    shard_processing_order: Vec<ShardId>,
    outstanding_migrations: Vec<MoveMergeRequest>,
    actionable_merges: VecDeque<MoveMergeRequest>,
    outstanding_merges: Vec<MoveMergeRequest>,
    zones: ZoneIndex,
    small_chunk_threshold_bytes: u64,
    aborted: bool,
    next_phase: DefragmentationPhaseKind,
}

impl MoveAndMergePhase {
    pub(crate) fn build(
        coll: &CollectionDescription,
        chunks: &[ChunkMetadata],
        shard_stats: Vec<ShardStats>,
        zones: ZoneIndex,
        max_chunk_size_bytes: u64,
    ) -> Self {
        let small_chunk_threshold_bytes = max_chunk_size_bytes * SMALL_CHUNK_THRESHOLD_PCT / 100;
        let mut phase = Self {
            ns: coll.ns.clone(),
            uuid: coll.uuid,
            chunks: ChunkChain::default(),
            small_chunks_by_shard: BTreeMap::new(),
            shard_infos: shard_stats
                .into_iter()
                .map(|s| (s.shard.clone(), s))
                .collect(),
            shard_processing_order: Vec::new(),
            outstanding_migrations: Vec::new(),
            actionable_merges: VecDeque::new(),
            outstanding_merges: Vec::new(),
            zones,
            small_chunk_threshold_bytes,
            aborted: false,
            next_phase: DefragmentationPhaseKind::Split,
        };

        for chunk in chunks {
            let Some(estimated_size_bytes) = chunk.estimated_size_bytes else {
                warn!(
                    "Chunk {} of {} ({}) has no size estimate, falling back to the merge phase",
                    chunk.range, phase.ns, phase.uuid
                );
                phase.abort(DefragmentationPhaseKind::Merge);
                return phase;
            };
            phase.chunks.push_back(ChunkEntry {
                range: chunk.range.clone(),
                shard: chunk.shard.clone(),
                estimated_size_bytes,
                busy: false,
            });
        }

        for (r, entry) in phase.chunks.iter() {
            if entry.estimated_size_bytes <= small_chunk_threshold_bytes {
                phase
                    .small_chunks_by_shard
                    .entry(entry.shard.clone())
                    .or_default()
                    .push(r);
            }
        }
        let chain = &phase.chunks;
        for list in phase.small_chunks_by_shard.values_mut() {
            list.sort_by_key(|r| chain.get(*r).estimated_size_bytes);
        }

        let mut order: Vec<ShardId> = phase.shard_infos.keys().cloned().collect();
        order.sort();
        phase.shard_processing_order = order;
        phase.resort_shard_processing_order();

        phase
    }

    fn abort(&mut self, next_phase: DefragmentationPhaseKind) {
        self.aborted = true;
        self.next_phase = next_phase;
        self.actionable_merges.clear();
        self.small_chunks_by_shard.clear();
        self.shard_processing_order.clear();
    }

    fn resort_shard_processing_order(&mut self) {
        let infos = &self.shard_infos;
        self.shard_processing_order.sort_by(|a, b| {
            let size = |s: &ShardId| infos.get(s).map(|i| i.current_size_bytes).unwrap_or(0);
            size(b).cmp(&size(a))
        });
    }

    fn shard_current_size(&self, shard: &ShardId) -> u64 {
        self.shard_infos
            .get(shard)
            .map(|i| i.current_size_bytes)
            .unwrap_or(0)
    }

    fn shard_can_receive(&self, shard: &ShardId) -> bool {
        self.shard_infos
            .get(shard)
            .map(|i| i.can_receive_chunks())
            .unwrap_or(false)
    }

    /// Siblings a chunk could be merged into, filtered by zone and by the
    /// destination shard's capacity (busy state is not considered here).
    /// The right sibling, when eligible, comes first.
    fn chunk_siblings(&self, chunk: ChunkRef) -> Vec<ChunkRef> {
        let entry = self.chunks.get(chunk);
        let zone = self.zones.zone_for_range(&entry.range);
        let eligible = |sibling: ChunkRef| {
            let s = self.chunks.get(sibling);
            let on_same_zone = self.zones.zone_for_range(&s.range) == zone;
            let destination_available = s.shard == entry.shard || self.shard_can_receive(&s.shard);
            on_same_zone && destination_available
        };

        let mut siblings = Vec::new();
        if let Some(right) = self.chunks.next(chunk) {
            if eligible(right) {
                siblings.push(right);
            }
        }
        if let Some(left) = self.chunks.prev(chunk) {
            if eligible(left) {
                siblings.push(left);
            }
        }
        siblings
    }

    /// Walk the shard's small chunks in size order and return the first one
    /// that has at least one sibling which is neither busy nor on a reserved
    /// shard. Chunks with no eligible siblings at all are pruned as a side
    /// effect, and the shard's entry is dropped once its list empties.
    fn find_next_small_chunk_in_shard(
        &mut self,
        shard: &ShardId,
        used_shards: &HashSet<ShardId>,
    ) -> Option<(ChunkRef, Vec<ChunkRef>)> {
        let mut list = self.small_chunks_by_shard.remove(shard)?;
        let mut found = None;
        let mut i = 0;
        while i < list.len() {
            let candidate = list[i];
            if self.chunks.get(candidate).busy {
                i += 1;
                continue;
            }
            let siblings = self.chunk_siblings(candidate);
            if siblings.is_empty() {
                // Nothing this chunk could ever merge with under the current
                // zone and capacity constraints
                list.remove(i);
                continue;
            }
            let available: Vec<ChunkRef> = siblings
                .into_iter()
                .filter(|s| {
                    let entry = self.chunks.get(*s);
                    !entry.busy && !used_shards.contains(&entry.shard)
                })
                .collect();
            if !available.is_empty() {
                found = Some((candidate, available));
                break;
            }
            i += 1;
        }
        if !list.is_empty() {
            self.small_chunks_by_shard.insert(shard.clone(), list);
        }
        found
    }

    /// Score how attractive it is to merge `chunk` into `sibling`.
    fn rank_mergeable_sibling(&self, chunk: ChunkRef, sibling: ChunkRef) -> u32 {
        const NO_MOVE_REQUIRED: u32 = 1 << 4;
        const CONVENIENT_MOVE: u32 = 1 << 3;
        const MERGE_SOLVES_TWO_PENDING_CHUNKS: u32 = 1 << 2;
        const MERGE_SOLVES_ONE_PENDING_CHUNK: u32 = 1 << 1;

        let chunk = self.chunks.get(chunk);
        let sibling = self.chunks.get(sibling);
        let mut ranking = 0;
        if chunk.shard == sibling.shard {
            ranking += NO_MOVE_REQUIRED;
        } else if chunk.estimated_size_bytes < sibling.estimated_size_bytes {
            ranking += CONVENIENT_MOVE;
        }
        let estimated_merged_size = chunk.estimated_size_bytes + sibling.estimated_size_bytes;
        if estimated_merged_size > self.small_chunk_threshold_bytes {
            ranking += if sibling.estimated_size_bytes < self.small_chunk_threshold_bytes {
                MERGE_SOLVES_TWO_PENDING_CHUNKS
            } else {
                MERGE_SOLVES_ONE_PENDING_CHUNK
            };
        }
        ranking
    }

    fn remove_from_small_chunks(&mut self, chunk: ChunkRef, shard: &ShardId) {
        let Some(list) = self.small_chunks_by_shard.get_mut(shard) else {
            return;
        };
        list.retain(|r| *r != chunk);
        if list.is_empty() {
            self.small_chunks_by_shard.remove(shard);
        }
    }

    fn take_outstanding_migration(&mut self, min_key: &KeyBound) -> Option<MoveMergeRequest> {
        let chain = &self.chunks;
        let idx = self
            .outstanding_migrations
            .iter()
            .position(|req| req.migration_min_key(chain) == min_key)?;
        Some(self.outstanding_migrations.remove(idx))
    }

    fn take_outstanding_merge(&mut self, merged_range: &ChunkRange) -> Option<MoveMergeRequest> {
        let chain = &self.chunks;
        let idx = self
            .outstanding_merges
            .iter()
            .position(|req| merged_range.contains_key(req.migration_min_key(chain)))?;
        Some(self.outstanding_merges.remove(idx))
    }

    fn apply_migration_result(&mut self, request: MoveMergeRequest, outcome: &ActionOutcome) {
        match classify_result(&self.ns, self.uuid, self.kind(), outcome.status()) {
            ResultDisposition::Success => {
                let transferred = request.moved_size_bytes(&self.chunks);
                let source = request.source_shard(&self.chunks);
                let destination = request.destination_shard(&self.chunks);
                if let Some(info) = self.shard_infos.get_mut(&source) {
                    info.current_size_bytes = info.current_size_bytes.saturating_sub(transferred);
                }
                if let Some(info) = self.shard_infos.get_mut(&destination) {
                    info.current_size_bytes += transferred;
                }
                self.resort_shard_processing_order();
                self.actionable_merges.push_back(request);
            }
            ResultDisposition::Retry => {
                self.chunks.get_mut(request.chunk_to_move).busy = false;
                self.chunks.get_mut(request.chunk_to_merge_with).busy = false;
            }
            ResultDisposition::Abort => self.abort(DefragmentationPhaseKind::Merge),
        }
    }

    fn apply_merge_result(&mut self, request: MoveMergeRequest, outcome: &ActionOutcome) {
        match classify_result(&self.ns, self.uuid, self.kind(), outcome.status()) {
            ResultDisposition::Success => {
                let merged_range = request.merged_range(&self.chunks);
                let deleted = request.chunk_to_move;
                let survivor = request.chunk_to_merge_with;
                let deleted_shard = self.chunks.get(deleted).shard.clone();
                let deleted_size = self.chunks.get(deleted).estimated_size_bytes;

                let entry = self.chunks.get_mut(survivor);
                entry.range = merged_range;
                entry.estimated_size_bytes += deleted_size;
                entry.busy = false;
                let survivor_shard = entry.shard.clone();
                let survivor_size = entry.estimated_size_bytes;

                self.chunks.remove(deleted);
                self.remove_from_small_chunks(deleted, &deleted_shard);

                if survivor_size > self.small_chunk_threshold_bytes {
                    self.remove_from_small_chunks(survivor, &survivor_shard);
                } else {
                    // Keep the surviving shard's small-chunk list size-sorted
                    let chain = &self.chunks;
                    if let Some(list) = self.small_chunks_by_shard.get_mut(&survivor_shard) {
                        list.sort_by_key(|r| chain.get(*r).estimated_size_bytes);
                    }
                }
            }
            ResultDisposition::Retry => {
                self.actionable_merges.push_back(request);
            }
            ResultDisposition::Abort => self.abort(DefragmentationPhaseKind::Merge),
        }
    }
}

impl DefragmentationPhase for MoveAndMergePhase {
    fn kind(&self) -> DefragmentationPhaseKind {
        DefragmentationPhaseKind::MoveAndMerge
    }

    fn next_phase(&self) -> DefragmentationPhaseKind {
        self.next_phase
    }

    fn pop_next_streamable_action(
        &mut self,
        view: &ChunkCatalogView,
        coll: &CollectionDescription,
    ) -> Result<Option<DefragAction>> {
        let Some(request) = self.actionable_merges.pop_front() else {
            return Ok(None);
        };
        let version = match view.shard_version(coll, &request.destination_shard(&self.chunks)) {
            Ok(version) => version,
            Err(e) => {
                self.actionable_merges.push_front(request);
                return Err(e);
            }
        };
        let action = request.as_merge_action(&self.chunks, coll, version);
        self.outstanding_merges.push(request);
        Ok(Some(DefragAction::Merge(action)))
    }

    fn pop_next_migration(
        &mut self,
        view: &ChunkCatalogView,
        coll: &CollectionDescription,
        used_shards: &mut HashSet<ShardId>,
    ) -> Result<Option<MigrateAction>> {
        let order = self.shard_processing_order.clone();
        for shard in order {
            if used_shards.contains(&shard) {
                // The shard is already reserved by another migration
                continue;
            }
            let Some((small_chunk, candidates)) =
                self.find_next_small_chunk_in_shard(&shard, used_shards)
            else {
                continue;
            };

            // At most two candidates (left and right sibling); pick the
            // higher-ranked one, breaking ties toward the emptier shard.
            let mut target = candidates[0];
            if let Some(&challenger) = candidates.get(1) {
                let target_score = self.rank_mergeable_sibling(small_chunk, target);
                let challenger_score = self.rank_mergeable_sibling(small_chunk, challenger);
                let challenger_shard = &self.chunks.get(challenger).shard;
                let target_shard = &self.chunks.get(target).shard;
                if challenger_score > target_score
                    || (challenger_score == target_score
                        && self.shard_current_size(challenger_shard)
                            < self.shard_current_size(target_shard))
                {
                    target = challenger;
                }
            }

            let source_shard = self.chunks.get(small_chunk).shard.clone();
            let destination_shard = self.chunks.get(target).shard.clone();
            let version = view.shard_version(coll, &source_shard)?;

            self.chunks.get_mut(small_chunk).busy = true;
            self.chunks.get_mut(target).busy = true;
            used_shards.insert(source_shard);
            used_shards.insert(destination_shard);

            let request = MoveMergeRequest::new(small_chunk, target, &self.chunks);
            let action = request.as_migrate_action(&self.chunks, coll, version);
            self.outstanding_migrations.push(request);
            return Ok(Some(action));
        }
        Ok(None)
    }

    fn apply_action_result(
        &mut self,
        _view: &ChunkCatalogView,
        _coll: &CollectionDescription,
        action: &DefragAction,
        outcome: &ActionOutcome,
    ) {
        match action {
            DefragAction::Migrate(migration) => {
                let Some(request) = self.take_outstanding_migration(&migration.range.min) else {
                    error!(
                        "No outstanding migration matches result for {} on {} ({})",
                        migration.range, self.ns, self.uuid
                    );
                    return;
                };
                if !self.aborted {
                    self.apply_migration_result(request, outcome);
                }
            }
            DefragAction::Merge(merge) => {
                let Some(request) = self.take_outstanding_merge(&merge.range) else {
                    error!(
                        "No outstanding merge matches result for {} on {} ({})",
                        merge.range, self.ns, self.uuid
                    );
                    return;
                };
                if !self.aborted {
                    self.apply_merge_result(request, outcome);
                }
            }
            _ => reject_unexpected_action(&self.ns, self.uuid, self.kind(), action),
        }
    }

    fn is_complete(&self) -> bool {
        self.small_chunks_by_shard.is_empty()
            && self.outstanding_migrations.is_empty()
            && self.actionable_merges.is_empty()
            && self.outstanding_merges.is_empty()
    }
}
