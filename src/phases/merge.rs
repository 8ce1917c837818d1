//! Merge phase
//!
//! Coalesces every maximal run of consecutive chunks that share a shard and a
//! zone into a single chunk, and probes the data size of isolated chunks that
//! lack an estimate. Runs are detected once at construction by scanning the
//! routing table backwards from the highest key.

use super::{
    classify_result, reject_unexpected_action, DefragmentationPhase, DefragmentationPhaseKind,
    ResultDisposition,
};
use crate::actions::{ActionOutcome, DataSizeAction, DefragAction, MergeAction, MigrateAction};
use crate::catalog::ChunkCatalogView;
use crate::error::Result;
use crate::types::{ChunkMetadata, ChunkRange, CollectionDescription, KeyPattern, ShardId};
use crate::zones::ZoneIndex;
use std::collections::{BTreeMap, HashSet};
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Default)]
struct PendingActions {
    /// Ranges awaiting a merge command, most recently discovered last
    ranges_to_merge: Vec<ChunkRange>,
    /// Ranges awaiting a data-size probe
    ranges_without_size: Vec<ChunkRange>,
}

impl PendingActions {
    fn is_empty(&self) -> bool {
        self.ranges_to_merge.is_empty() && self.ranges_without_size.is_empty()
    }
}

pub(crate) struct MergePhase {
    ns: String,
    uuid: Uuid,
    key_pattern: KeyPattern,
    pending_by_shard: BTreeMap<ShardId, PendingActions>,
    outstanding_actions: usize,
    aborted: bool,
}

impl MergePhase {
    /// Scan the sorted chunk list backwards, enqueueing one merge per
    /// maximal run of length >= 2 and one size probe per estimate-less
    /// singleton.
    pub(crate) fn build(
        coll: &CollectionDescription,
        chunks: &[ChunkMetadata],
        zones: &ZoneIndex,
    ) -> Self {
        let consecutive = |prev: &ChunkMetadata, cur: &ChunkMetadata| {
            prev.shard == cur.shard
                && zones.zone_for_range(&prev.range) == zones.zone_for_range(&cur.range)
                && prev.range.max == cur.range.min
        };

        let mut pending_by_shard: BTreeMap<ShardId, PendingActions> = BTreeMap::new();
        let mut end = chunks.len();
        while end > 0 {
            let upper = end - 1;
            let mut lower = upper;
            while lower > 0 && consecutive(&chunks[lower - 1], &chunks[lower]) {
                lower -= 1;
            }
            let pending = pending_by_shard
                .entry(chunks[upper].shard.clone())
                .or_default();
            if lower != upper {
                pending.ranges_to_merge.push(ChunkRange::new(
                    chunks[lower].range.min.clone(),
                    chunks[upper].range.max.clone(),
                ));
            } else if chunks[upper].estimated_size_bytes.is_none() {
                pending.ranges_without_size.push(chunks[upper].range.clone());
            }
            end = lower;
        }
        pending_by_shard.retain(|_, pending| !pending.is_empty());

        Self {
            ns: coll.ns.clone(),
            uuid: coll.uuid,
            key_pattern: coll.key_pattern.clone(),
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
}

impl DefragmentationPhase for MergePhase {
    fn kind(&self) -> DefragmentationPhaseKind {
        DefragmentationPhaseKind::Merge
    }

    fn next_phase(&self) -> DefragmentationPhaseKind {
        DefragmentationPhaseKind::MoveAndMerge
    }

    fn pop_next_streamable_action(
        &mut self,
        view: &ChunkCatalogView,
        coll: &CollectionDescription,
    ) -> Result<Option<DefragAction>> {
        // TODO: rotate the starting shard between pops so a single shard
        // with a deep backlog cannot monopolize the stream.
        let Some((shard, _)) = self.pending_by_shard.iter().next() else {
            return Ok(None);
        };
        let shard = shard.clone();
        let version = view.shard_version(coll, &shard)?;

        let ns = self.ns.clone();
        let uuid = self.uuid;
        let key_pattern = self.key_pattern.clone();
        let pending = self.pending_for(&shard);
        let action = if pending.ranges_without_size.len() > pending.ranges_to_merge.len() {
            pending.ranges_without_size.pop().map(|range| {
                DefragAction::DataSize(DataSizeAction {
                    shard: shard.clone(),
                    ns,
                    uuid,
                    range,
                    version,
                    key_pattern,
                    estimate: false,
                })
            })
        } else {
            pending.ranges_to_merge.pop().map(|range| {
                DefragAction::Merge(MergeAction {
                    shard: shard.clone(),
                    ns,
                    uuid,
                    version,
                    range,
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
        view: &ChunkCatalogView,
        coll: &CollectionDescription,
        action: &DefragAction,
        outcome: &ActionOutcome,
    ) {
        self.outstanding_actions = self.outstanding_actions.saturating_sub(1);
        if self.aborted {
            return;
        }
        let disposition = classify_result(&self.ns, self.uuid, self.kind(), outcome.status());
        match (action, outcome) {
            (DefragAction::Merge(merge), ActionOutcome::Unit(_)) => match disposition {
                ResultDisposition::Success => {
                    // The freshly merged chunk needs a size estimate
                    self.pending_for(&merge.shard)
                        .ranges_without_size
                        .push(merge.range.clone());
                }
                ResultDisposition::Retry => {
                    self.pending_for(&merge.shard)
                        .ranges_to_merge
                        .push(merge.range.clone());
                }
                ResultDisposition::Abort => self.abort(),
            },
            (DefragAction::DataSize(probe), ActionOutcome::DataSize(result)) => match disposition {
                ResultDisposition::Success => {
                    if let Ok(response) = result {
                        if let Err(e) =
                            view.persist_chunk_size_estimate(coll, &probe.range, response.size_bytes)
                        {
                            if e.is_retriable() {
                                warn!(
                                    "Failed to persist size estimate for {} on {}, re-probing: {}",
                                    probe.range, probe.shard, e
                                );
                                self.pending_for(&probe.shard)
                                    .ranges_without_size
                                    .push(probe.range.clone());
                            } else {
                                error!(
                                    "Failed to persist size estimate for {} ({}): {}",
                                    self.ns, self.uuid, e
                                );
                                self.abort();
                            }
                        }
                    }
                }
                ResultDisposition::Retry => {
                    self.pending_for(&probe.shard)
                        .ranges_without_size
                        .push(probe.range.clone());
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
