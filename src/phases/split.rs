//! Split phase
//!
//! Restores the invariant that every chunk has a known size no larger than
//! the collection's chunk size target: oversized (or estimate-less) chunks
//! get a split-point discovery probe, and discovered points are turned into
//! concrete split commands. A probe whose response fills the wire document
//! is continued from its last returned key.

use super::{
    classify_result, reject_unexpected_action, DefragmentationPhase, DefragmentationPhaseKind,
    ResultDisposition,
};
use crate::actions::{
    ActionOutcome, AutoSplitVectorAction, DefragAction, MigrateAction, SplitAction,
};
use crate::catalog::ChunkCatalogView;
use crate::error::Result;
use crate::types::{ChunkMetadata, ChunkRange, CollectionDescription, KeyBound, KeyPattern, ShardId};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

/// Largest document the wire protocol accepts.
const MAX_DOCUMENT_BYTES: usize = 16 * 1024 * 1024;

/// Headroom under the document cap; a split-point response at least this
/// close to the cap was truncated by the remote side and must be continued.
const RESPONSE_CONTINUATION_MARGIN: usize = 4096;

#[derive(Default)]
struct PendingActions {
    /// Ranges awaiting split-point discovery
    ranges_to_find_split_points: Vec<ChunkRange>,
    /// Ranges with discovered split points, awaiting the split command
    ranges_to_split: Vec<(ChunkRange, Vec<KeyBound>)>,
}

impl PendingActions {
    fn is_empty(&self) -> bool {
        self.ranges_to_find_split_points.is_empty() && self.ranges_to_split.is_empty()
    }
}

pub(crate) struct SplitPhase {
    ns: String,
    uuid: Uuid,
    key_pattern: KeyPattern,
    max_chunk_size_bytes: u64,
    pending_by_shard: BTreeMap<ShardId, PendingActions>,
    outstanding_actions: usize,
    aborted: bool,
}

impl SplitPhase {
    pub(crate) fn build(
        coll: &CollectionDescription,
        chunks: &[ChunkMetadata],
        max_chunk_size_bytes: u64,
    ) -> Self {
        let mut pending_by_shard: BTreeMap<ShardId, PendingActions> = BTreeMap::new();
        for chunk in chunks {
            let oversized = match chunk.estimated_size_bytes {
                Some(size) => size > max_chunk_size_bytes,
                None => true,
            };
            if oversized {
                pending_by_shard
                    .entry(chunk.shard.clone())
                    .or_default()
                    .ranges_to_find_split_points
                    .push(chunk.range.clone());
            }
        }

        Self {
            ns: coll.ns.clone(),
            uuid: coll.uuid,
            key_pattern: coll.key_pattern.clone(),
            max_chunk_size_bytes,
            pending_by_shard,
            outstanding_actions: 0,
            aborted: false,
        }
    }

    fn pending_for(&mut self, shard: &ShardId) -> &mut PendingActions {
        self.pending_by_shard.entry(shard.clone()).or_default()
    }

    fn abort(&mut self) {
        self.aborted = true;
        self.pending_by_shard.clear();
    }

    /// The remote side caps its response at the wire document limit; a
    /// payload in the top margin means more split points remain past the
    /// last returned key.
    fn response_was_truncated(split_points: &[KeyBound]) -> bool {
        let total: usize = split_points.iter().map(|k| k.payload_len()).sum();
        total >= MAX_DOCUMENT_BYTES - RESPONSE_CONTINUATION_MARGIN
    }
}

impl DefragmentationPhase for SplitPhase {
    fn kind(&self) -> DefragmentationPhaseKind {
        DefragmentationPhaseKind::Split
    }

    fn next_phase(&self) -> DefragmentationPhaseKind {
        DefragmentationPhaseKind::Finished
    }

    fn pop_next_streamable_action(
        &mut self,
        view: &ChunkCatalogView,
        coll: &CollectionDescription,
    ) -> Result<Option<DefragAction>> {
        let Some((shard, _)) = self.pending_by_shard.iter().next() else {
            return Ok(None);
        };
        let shard = shard.clone();
        let version = view.shard_version(coll, &shard)?;

        let ns = self.ns.clone();
        let uuid = self.uuid;
        let key_pattern = self.key_pattern.clone();
        let max_chunk_size_bytes = self.max_chunk_size_bytes;
        let pending = self.pending_for(&shard);
        // Concrete splits drain before further discovery probes
        let action = if let Some((range, split_points)) = pending.ranges_to_split.pop() {
            Some(DefragAction::Split(SplitAction {
                shard: shard.clone(),
                ns,
                uuid,
                version,
                min: range.min,
                max: range.max,
                split_points,
                key_pattern,
            }))
        } else {
            pending.ranges_to_find_split_points.pop().map(|range| {
                DefragAction::AutoSplitVector(AutoSplitVectorAction {
                    shard: shard.clone(),
                    ns,
                    uuid,
                    version,
                    key_pattern,
                    min: range.min,
                    max: range.max,
                    max_chunk_size_bytes,
                })
            })
        };

        if action.is_some() {
            self.outstanding_actions += 1;
            if self.pending_for(&shard).is_empty() {
                self.pending_by_shard.remove(&shard);
            }
        }
        Ok(action)
    }

    fn pop_next_migration(
        &mut self,
        _view: &ChunkCatalogView,
        _coll: &CollectionDescription,
        _used_shards: &mut HashSet<ShardId>,
    ) -> Result<Option<MigrateAction>> {
        Ok(None)
    }

    fn apply_action_result(
        &mut self,
        _view: &ChunkCatalogView,
        _coll: &CollectionDescription,
        action: &DefragAction,
        outcome: &ActionOutcome,
    ) {
        self.outstanding_actions = self.outstanding_actions.saturating_sub(1);
        if self.aborted {
            return;
        }
        let disposition = classify_result(&self.ns, self.uuid, self.kind(), outcome.status());
        match (action, outcome) {
            (DefragAction::AutoSplitVector(probe), ActionOutcome::SplitPoints(result)) => {
                match disposition {
                    ResultDisposition::Success => {
                        let Ok(split_points) = result else { return };
                        if split_points.is_empty() {
                            // The range cannot be split any further
                            return;
                        }
                        let truncated = Self::response_was_truncated(split_points);
                        let last_point = split_points.last().cloned();
                        let pending = self.pending_for(&probe.shard);
                        pending.ranges_to_split.push((
                            ChunkRange::new(probe.min.clone(), probe.max.clone()),
                            split_points.clone(),
                        ));
                        if truncated {
                            if let Some(last) = last_point {
                                pending
                                    .ranges_to_find_split_points
                                    .push(ChunkRange::new(last, probe.max.clone()));
                            }
                        }
                    }
                    ResultDisposition::Retry => {
                        self.pending_for(&probe.shard)
                            .ranges_to_find_split_points
                            .push(ChunkRange::new(probe.min.clone(), probe.max.clone()));
                    }
                    ResultDisposition::Abort => self.abort(),
                }
            }
            (DefragAction::Split(split), ActionOutcome::Unit(_)) => match disposition {
                ResultDisposition::Success => {}
                ResultDisposition::Retry => {
                    self.pending_for(&split.shard).ranges_to_split.push((
                        ChunkRange::new(split.min.clone(), split.max.clone()),
                        split.split_points.clone(),
                    ));
                }
                ResultDisposition::Abort => self.abort(),
            },
            _ => reject_unexpected_action(&self.ns, self.uuid, self.kind(), action),
        }
    }

    fn is_complete(&self) -> bool {
        self.pending_by_shard.is_empty() && self.outstanding_actions == 0
    }
}
