//! Policy engine façade
//!
//! [`DefragmentationPolicy`] multiplexes the per-collection orchestrators
//! behind a streaming interface: an external executor pulls actions with
//! [`next_action`](DefragmentationPolicy::next_action) and migrations with
//! [`select_chunks_to_move`](DefragmentationPolicy::select_chunks_to_move),
//! dispatches them remotely, and reports results through the typed
//! acknowledgement methods. A single mutex serializes all public operations;
//! the only suspension point is the consumer waiting on a parked
//! [`NextAction`] future when the concurrency cap is reached or no work is
//! currently producible.

use crate::actions::{
    ActionOutcome, ActionStreamItem, AutoSplitVectorAction, DataSizeAction, DataSizeResponse,
    DefragAction, MergeAction, MigrateAction, SplitAction,
};
use crate::catalog::{ChunkCatalogView, CollectionCatalog, ClusterStatistics};
use crate::config::DefragmentationConfig;
use crate::error::DefragError;
use crate::orchestrator::CollectionOrchestrator;
use crate::types::{CollectionDescription, KeyBound, ShardId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use uuid::Uuid;

struct EngineState {
    collections: HashMap<Uuid, CollectionOrchestrator>,
    /// Collection ids in insertion order; the cursor rotates the starting
    /// point so every collection gets a turn at the head of the stream.
    order: Vec<Uuid>,
    round_robin_cursor: usize,
    concurrent_streaming_ops: usize,
    parked_waiter: Option<oneshot::Sender<ActionStreamItem>>,
    stream_closed: bool,
}

/// Top-level defragmentation policy engine.
pub struct DefragmentationPolicy {
    view: ChunkCatalogView,
    max_concurrent_operations: usize,
    state: Mutex<EngineState>,
}

impl DefragmentationPolicy {
    pub fn new(
        catalog: Arc<dyn CollectionCatalog>,
        stats: Arc<dyn ClusterStatistics>,
        config: DefragmentationConfig,
    ) -> Self {
        Self {
            view: ChunkCatalogView::new(catalog, stats, config.default_max_chunk_size_bytes),
            max_concurrent_operations: config.max_concurrent_operations,
            state: Mutex::new(EngineState {
                collections: HashMap::new(),
                order: Vec::new(),
                round_robin_cursor: 0,
                concurrent_streaming_ops: 0,
                parked_waiter: None,
                stream_closed: false,
            }),
        }
    }

    /// Install or remove the orchestrator for a collection after its catalog
    /// record changed. Newly installed work wakes a parked consumer.
    pub fn refresh_collection(&self, coll: &CollectionDescription) {
        let mut state = self.state.lock();
        let known = state.collections.contains_key(&coll.uuid);
        if coll.defragment_collection && !known {
            if let Some(orchestrator) = CollectionOrchestrator::start(&self.view, coll.clone()) {
                state.collections.insert(coll.uuid, orchestrator);
                state.order.push(coll.uuid);
                self.try_fulfill_parked_waiter(&mut state);
            }
        } else if !coll.defragment_collection && known {
            if let Some(orchestrator) = state.collections.remove(&coll.uuid) {
                orchestrator.finish(&self.view);
            }
            self.remove_collection(&mut state, coll.uuid);
        }
    }

    /// Next streamable action, as a future.
    ///
    /// Resolves immediately when an action is producible under the
    /// concurrency cap; otherwise the consumer parks until an
    /// acknowledgement or refresh frees work. At most one consumer may be
    /// parked at a time.
    pub fn next_action(&self) -> NextAction {
        let mut state = self.state.lock();
        if state.concurrent_streaming_ops < self.max_concurrent_operations {
            if let Some(action) = self.next_streamable_action(&mut state) {
                state.concurrent_streaming_ops += 1;
                return NextAction::ready(ActionStreamItem::Action(action));
            }
        }
        // A closed stream never produces again, even with the cap exhausted
        if state.stream_closed {
            return NextAction::ready(ActionStreamItem::EndOfStream);
        }
        // A consumer that dropped its future has given up its slot
        if state
            .parked_waiter
            .as_ref()
            .is_some_and(|waiter| waiter.is_closed())
        {
            state.parked_waiter = None;
        }
        assert!(
            state.parked_waiter.is_none(),
            "only one parked next_action consumer is supported"
        );
        let (tx, rx) = oneshot::channel();
        state.parked_waiter = Some(tx);
        NextAction::parked(rx)
    }

    /// Drain ready migrations across all collections, reserving their shard
    /// pairs in `used_shards`. Full passes repeat until one adds nothing:
    /// a migration handed out for one collection can unblock another.
    pub fn select_chunks_to_move(&self, used_shards: &mut HashSet<ShardId>) -> Vec<MigrateAction> {
        let mut state = self.state.lock();
        let mut migrations = Vec::new();
        loop {
            let selected_in_previous_rounds = migrations.len();
            for uuid in state.order.clone() {
                let Some(orchestrator) = state.collections.get_mut(&uuid) else {
                    continue;
                };
                match orchestrator.refresh_and_pop_migration(&self.view, used_shards) {
                    Ok(Some(migration)) => migrations.push(migration),
                    Ok(None) => {
                        if orchestrator.is_defunct() {
                            self.remove_collection(&mut state, uuid);
                        }
                    }
                    Err(e) => {
                        error!(
                            "Error while selecting next defragmentation migration for {}: {}",
                            uuid, e
                        );
                        self.remove_collection(&mut state, uuid);
                    }
                }
            }
            if migrations.len() == selected_in_previous_rounds {
                break;
            }
        }
        migrations
    }

    pub fn acknowledge_merge_result(
        &self,
        action: MergeAction,
        result: Result<(), DefragError>,
    ) {
        self.apply_result(
            DefragAction::Merge(action),
            ActionOutcome::Unit(result),
            true,
        );
    }

    pub fn acknowledge_data_size_result(
        &self,
        action: DataSizeAction,
        result: Result<DataSizeResponse, DefragError>,
    ) {
        self.apply_result(
            DefragAction::DataSize(action),
            ActionOutcome::DataSize(result),
            true,
        );
    }

    pub fn acknowledge_auto_split_vector_result(
        &self,
        action: AutoSplitVectorAction,
        result: Result<Vec<KeyBound>, DefragError>,
    ) {
        self.apply_result(
            DefragAction::AutoSplitVector(action),
            ActionOutcome::SplitPoints(result),
            true,
        );
    }

    pub fn acknowledge_split_result(&self, action: SplitAction, result: Result<(), DefragError>) {
        self.apply_result(
            DefragAction::Split(action),
            ActionOutcome::Unit(result),
            true,
        );
    }

    /// Migrations are handed out by `select_chunks_to_move` and are not
    /// counted against the streaming cap.
    pub fn acknowledge_move_result(
        &self,
        action: MigrateAction,
        result: Result<(), DefragError>,
    ) {
        self.apply_result(
            DefragAction::Migrate(action),
            ActionOutcome::Unit(result),
            false,
        );
    }

    /// Hard shutdown: drop all collection state and resolve any parked
    /// consumer. Subsequent `next_action` calls resolve to `EndOfStream`.
    pub fn close_action_stream(&self) {
        let mut state = self.state.lock();
        state.collections.clear();
        state.order.clear();
        state.round_robin_cursor = 0;
        if let Some(waiter) = state.parked_waiter.take() {
            let _ = waiter.send(ActionStreamItem::EndOfStream);
        }
        state.stream_closed = true;
    }

    fn apply_result(&self, action: DefragAction, outcome: ActionOutcome, streamed: bool) {
        let mut state = self.state.lock();
        let uuid = action.uuid();
        match state.collections.get_mut(&uuid) {
            Some(orchestrator) => {
                orchestrator.apply_action_result(&self.view, &action, &outcome);
            }
            None => {
                // Defragmentation was canceled for the collection while the
                // action was in flight
                debug!(
                    "Discarding {} result for unknown collection {}",
                    action.kind_name(),
                    uuid
                );
            }
        }
        if streamed {
            state.concurrent_streaming_ops = state.concurrent_streaming_ops.saturating_sub(1);
        }
        self.try_fulfill_parked_waiter(&mut state);
    }

    /// Round-robin across collections for the next streamable action,
    /// dropping exhausted or failed entries along the way.
    fn next_streamable_action(&self, state: &mut EngineState) -> Option<DefragAction> {
        let count = state.order.len();
        if count == 0 {
            return None;
        }
        let start = state.round_robin_cursor % count;
        let ids: Vec<Uuid> = (0..count).map(|i| state.order[(start + i) % count]).collect();
        for uuid in ids {
            let Some(orchestrator) = state.collections.get_mut(&uuid) else {
                continue;
            };
            match orchestrator.refresh_and_pop_streamable(&self.view) {
                Ok(Some(action)) => {
                    if let Some(position) = state.order.iter().position(|u| *u == uuid) {
                        state.round_robin_cursor = (position + 1) % state.order.len();
                    }
                    return Some(action);
                }
                Ok(None) => {
                    if orchestrator.is_defunct() {
                        self.remove_collection(state, uuid);
                    }
                }
                Err(e) => {
                    error!(
                        "Error while producing next defragmentation action for {}: {}",
                        uuid, e
                    );
                    self.remove_collection(state, uuid);
                }
            }
        }
        None
    }

    fn remove_collection(&self, state: &mut EngineState, uuid: Uuid) {
        state.collections.remove(&uuid);
        if let Some(position) = state.order.iter().position(|u| *u == uuid) {
            state.order.remove(position);
            if position < state.round_robin_cursor {
                state.round_robin_cursor -= 1;
            }
            if !state.order.is_empty() {
                state.round_robin_cursor %= state.order.len();
            } else {
                state.round_robin_cursor = 0;
            }
        }
    }

    /// Hand freshly available work to a parked consumer, respecting the cap.
    fn try_fulfill_parked_waiter(&self, state: &mut EngineState) {
        match &state.parked_waiter {
            None => return,
            Some(waiter) if waiter.is_closed() => {
                state.parked_waiter = None;
                return;
            }
            Some(_) => {}
        }
        if state.concurrent_streaming_ops < self.max_concurrent_operations {
            if let Some(action) = self.next_streamable_action(state) {
                state.concurrent_streaming_ops += 1;
                if let Some(waiter) = state.parked_waiter.take() {
                    if waiter.send(ActionStreamItem::Action(action)).is_err() {
                        warn!("Parked defragmentation consumer vanished; dropping one action");
                        state.concurrent_streaming_ops =
                            state.concurrent_streaming_ops.saturating_sub(1);
                    }
                }
                return;
            }
        }
        // No action will ever come out of a closed stream; let the waiter go
        if state.stream_closed {
            if let Some(waiter) = state.parked_waiter.take() {
                let _ = waiter.send(ActionStreamItem::EndOfStream);
            }
        }
    }
}

/// Future returned by [`DefragmentationPolicy::next_action`].
///
/// Either already resolved, or parked on a one-shot channel that the engine
/// fulfills when work becomes available. A dropped engine resolves parked
/// consumers with `EndOfStream`.
pub enum NextAction {
    Ready(Option<ActionStreamItem>),
    Parked(oneshot::Receiver<ActionStreamItem>),
}

impl NextAction {
    fn ready(item: ActionStreamItem) -> Self {
        NextAction::Ready(Some(item))
    }

    fn parked(rx: oneshot::Receiver<ActionStreamItem>) -> Self {
        NextAction::Parked(rx)
    }
}

impl Future for NextAction {
    type Output = ActionStreamItem;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.get_mut() {
            NextAction::Ready(item) => {
                Poll::Ready(item.take().expect("NextAction polled after completion"))
            }
            NextAction::Parked(rx) => Pin::new(rx)
                .poll(cx)
                .map(|result| result.unwrap_or(ActionStreamItem::EndOfStream)),
        }
    }
}
