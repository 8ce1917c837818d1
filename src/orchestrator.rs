//! Per-collection defragmentation state
//!
//! Owns the current phase object for one collection, advances it when it
//! completes, and persists every transition through the catalog *before*
//! constructing the next phase — an external observer reading the collection
//! record always sees the phase whose actions are about to be emitted.

use crate::actions::{ActionOutcome, DefragAction, MigrateAction};
use crate::catalog::ChunkCatalogView;
use crate::error::Result;
use crate::phases::{
    DefragmentationPhase, DefragmentationPhaseKind, MergePhase, MoveAndMergePhase, SplitPhase,
};
use crate::types::{CollectionDescription, ShardId};
use std::collections::HashSet;
use tracing::{error, info};

pub(crate) struct CollectionOrchestrator {
    coll: CollectionDescription,
    phase: Option<Box<dyn DefragmentationPhase>>,
}

impl CollectionOrchestrator {
    /// Start (or resume) defragmentation for a collection.
    ///
    /// When the record already carries a persisted phase the run resumes
    /// there without re-persisting; otherwise the initial merge phase is
    /// persisted first. Phases that report immediately complete are advanced
    /// until real work appears or the run finishes; `None` means there is
    /// nothing to do (or construction failed) and no state should be kept.
    pub(crate) fn start(view: &ChunkCatalogView, coll: CollectionDescription) -> Option<Self> {
        let phase_to_build = coll
            .defragmentation_phase
            .unwrap_or(DefragmentationPhaseKind::Merge);
        let should_persist = coll.defragmentation_phase.is_none();
        let mut phase = transition(view, &coll, phase_to_build, should_persist);
        while let Some(built) = &phase {
            if !built.is_complete() {
                break;
            }
            phase = transition(view, &coll, built.next_phase(), true);
        }
        phase.map(|phase| Self {
            coll,
            phase: Some(phase),
        })
    }

    /// Drop the collection's run, persisting the terminal state.
    pub(crate) fn finish(self, view: &ChunkCatalogView) {
        transition(view, &self.coll, DefragmentationPhaseKind::Finished, true);
    }

    /// `true` once the phase slot is empty; the engine drops such entries.
    pub(crate) fn is_defunct(&self) -> bool {
        self.phase.is_none()
    }

    /// Advance past completed phases, re-reading the collection record so
    /// transitions observe the latest settings.
    fn refresh_phase(&mut self, view: &ChunkCatalogView) -> Result<()> {
        let completed = matches!(&self.phase, Some(p) if p.is_complete());
        if !completed {
            return Ok(());
        }
        self.coll = view.collection(self.coll.uuid)?;
        while let Some(phase) = &self.phase {
            if !phase.is_complete() {
                break;
            }
            self.phase = transition(view, &self.coll, phase.next_phase(), true);
        }
        Ok(())
    }

    pub(crate) fn refresh_and_pop_streamable(
        &mut self,
        view: &ChunkCatalogView,
    ) -> Result<Option<DefragAction>> {
        self.refresh_phase(view)?;
        match self.phase.as_mut() {
            Some(phase) => phase.pop_next_streamable_action(view, &self.coll),
            None => Ok(None),
        }
    }

    pub(crate) fn refresh_and_pop_migration(
        &mut self,
        view: &ChunkCatalogView,
        used_shards: &mut HashSet<ShardId>,
    ) -> Result<Option<MigrateAction>> {
        self.refresh_phase(view)?;
        match self.phase.as_mut() {
            Some(phase) => phase.pop_next_migration(view, &self.coll, used_shards),
            None => Ok(None),
        }
    }

    pub(crate) fn apply_action_result(
        &mut self,
        view: &ChunkCatalogView,
        action: &DefragAction,
        outcome: &ActionOutcome,
    ) {
        if let Some(phase) = self.phase.as_mut() {
            phase.apply_action_result(view, &self.coll, action, outcome);
        }
    }
}

/// Persist `next_phase` on the collection record, then construct the phase
/// object. Returns `None` for `Finished` (which runs its finalization
/// instead) and on any persistence or construction failure.
fn transition(
    view: &ChunkCatalogView,
    coll: &CollectionDescription,
    next_phase: DefragmentationPhaseKind,
    should_persist: bool,
) -> Option<Box<dyn DefragmentationPhase>> {
    let built = build_phase(view, coll, next_phase, should_persist);
    match built {
        Ok(phase) => {
            info!(
                "Collection defragmentation for {} ({}) transitioning to {} phase",
                coll.ns, coll.uuid, next_phase
            );
            phase
        }
        Err(e) => {
            error!(
                "Failed to build {} defragmentation phase for {} ({}): {}",
                next_phase, coll.ns, coll.uuid, e
            );
            None
        }
    }
}

fn build_phase(
    view: &ChunkCatalogView,
    coll: &CollectionDescription,
    next_phase: DefragmentationPhaseKind,
    should_persist: bool,
) -> Result<Option<Box<dyn DefragmentationPhase>>> {
    if should_persist {
        let persisted = match next_phase {
            DefragmentationPhaseKind::Finished => None,
            other => Some(other),
        };
        view.persist_phase(coll.uuid, persisted)?;
    }
    match next_phase {
        DefragmentationPhaseKind::Merge => {
            let chunks = view.collection_chunks(coll)?;
            let zones = view.zone_index(coll)?;
            Ok(Some(Box::new(MergePhase::build(coll, &chunks, &zones))))
        }
        DefragmentationPhaseKind::MoveAndMerge => {
            let chunks = view.collection_chunks(coll)?;
            let zones = view.zone_index(coll)?;
            let shard_stats = view.shard_stats(coll)?;
            let max_chunk_size_bytes = view.effective_max_chunk_size(coll);
            Ok(Some(Box::new(MoveAndMergePhase::build(
                coll,
                &chunks,
                shard_stats,
                zones,
                max_chunk_size_bytes,
            ))))
        }
        DefragmentationPhaseKind::Split => {
            let chunks = view.collection_chunks(coll)?;
            let max_chunk_size_bytes = view.effective_max_chunk_size(coll);
            Ok(Some(Box::new(SplitPhase::build(
                coll,
                &chunks,
                max_chunk_size_bytes,
            ))))
        }
        DefragmentationPhaseKind::Finished => {
            // Size estimates are stale once chunks have been split
            view.clear_chunk_size_estimates(coll.uuid)?;
            Ok(None)
        }
    }
}
