//! Defragmentation phases
//!
//! A defragmentation run walks one collection through three phases — merge,
//! move-and-merge, split — each of which produces remote actions and consumes
//! their results until it reports completion. Phases share a uniform
//! capability set through [`DefragmentationPhase`]; the orchestrator advances
//! and persists transitions between them.

mod merge;
mod move_merge;
mod split;

pub(crate) use merge::MergePhase;
pub(crate) use move_merge::MoveAndMergePhase;
pub(crate) use split::SplitPhase;

use crate::actions::{ActionOutcome, DefragAction, MigrateAction};
use crate::catalog::ChunkCatalogView;
use crate::error::{DefragError, Result};
use crate::types::{CollectionDescription, ShardId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::error;
use uuid::Uuid;

/// Phase of a collection defragmentation run, as persisted on the
/// collection record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DefragmentationPhaseKind {
    Merge,
    MoveAndMerge,
    Split,
    Finished,
}

impl fmt::Display for DefragmentationPhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DefragmentationPhaseKind::Merge => "merge",
            DefragmentationPhaseKind::MoveAndMerge => "moveAndMerge",
            DefragmentationPhaseKind::Split => "split",
            DefragmentationPhaseKind::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// Uniform capability set of a phase object.
///
/// A phase yields streamable actions and migrations, consumes their results,
/// and reports completion; it holds no locks and performs no I/O beyond the
/// catalog view handed into each call.
pub(crate) trait DefragmentationPhase: Send {
    fn kind(&self) -> DefragmentationPhaseKind;

    /// Phase to build once this one completes (aborts may redirect it).
    fn next_phase(&self) -> DefragmentationPhaseKind;

    /// Next merge/probe/split action ready to be dispatched, if any.
    fn pop_next_streamable_action(
        &mut self,
        view: &ChunkCatalogView,
        coll: &CollectionDescription,
    ) -> Result<Option<DefragAction>>;

    /// Next chunk migration, respecting the caller's shard reservations.
    fn pop_next_migration(
        &mut self,
        view: &ChunkCatalogView,
        coll: &CollectionDescription,
        used_shards: &mut HashSet<ShardId>,
    ) -> Result<Option<MigrateAction>>;

    /// Route one remote result back into the phase's state.
    fn apply_action_result(
        &mut self,
        view: &ChunkCatalogView,
        coll: &CollectionDescription,
        action: &DefragAction,
        outcome: &ActionOutcome,
    );

    /// Whether all work lists are drained and no actions are outstanding.
    fn is_complete(&self) -> bool;
}

/// What to do with the work item that produced a remote result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResultDisposition {
    Success,
    /// Re-enqueue the originating work item unchanged
    Retry,
    /// Terminal failure: abort the phase to its fallback
    Abort,
}

/// Classify a remote result, logging terminal failures with the collection
/// and phase context.
pub(crate) fn classify_result(
    ns: &str,
    uuid: Uuid,
    phase: DefragmentationPhaseKind,
    status: std::result::Result<(), &DefragError>,
) -> ResultDisposition {
    match status {
        Ok(()) => ResultDisposition::Success,
        Err(e) if e.is_retriable() => ResultDisposition::Retry,
        Err(e) => {
            error!(
                "Defragmentation for collection {} ({}) hit non-retriable error in {} phase: {}",
                ns, uuid, phase, e
            );
            ResultDisposition::Abort
        }
    }
}

/// Log and ignore a result whose action variant this phase can never have
/// emitted. Results are routed by collection, so reaching this indicates a
/// bug in the executor's acknowledgement plumbing, not in the phase.
pub(crate) fn reject_unexpected_action(
    ns: &str,
    uuid: Uuid,
    phase: DefragmentationPhaseKind,
    action: &DefragAction,
) {
    error!(
        "Ignoring {} result for collection {} ({}): not produced by the {} phase",
        action.kind_name(),
        ns,
        uuid,
        phase
    );
}
