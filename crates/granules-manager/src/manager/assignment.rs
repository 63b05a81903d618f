// Copyright (c) Granules Contributors
// SPDX-License-Identifier: Apache-2.0

//! The assignment engine: sole consumer of the range-assignment queue, sole
//! mutator of the in-memory assignment map, and the only component that
//! sends assign/revoke RPCs to workers.
//!
//! Intents are consumed FIFO and stamped with strictly increasing sequence
//! numbers, so for any single range the RPCs a worker observes are ordered
//! by `(epoch, seqno)`, matching the worker's lock acceptance rule.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use granules_core::{
    messages::{AssignKind, AssignRangeRequest, RevokeRangeRequest},
    AssignmentSeq, KeyRange, RangeMap, WorkerId,
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::ManagerInner;
use crate::errors::{ManagerError, WorkerRpcError};

/// One intent submitted to the assignment engine.
#[derive(Debug, Clone)]
pub(crate) enum RangeAssignment {
    /// Map `range` to a worker and dispatch an assign RPC.
    Assign {
        range: KeyRange,
        /// Pre-selected worker; the engine picks one when absent.
        worker: Option<WorkerId>,
        kind: AssignKind,
    },
    /// Unmap `range` and dispatch revoke RPCs.
    Revoke {
        range: KeyRange,
        /// Targeted revoke of a specific worker (used after worker death);
        /// untargeted revokes go to every current owner under `range`.
        worker: Option<WorkerId>,
        /// The range left the active blob set; the worker disposes of its
        /// granule state.
        dispose: bool,
    },
}

/// Sending side of the assignment queue.
///
/// The queue itself is unbounded so that internal producers (recovery,
/// worker death, RPC retries) can never deadlock against the engine, but a
/// soft cap backpressures the client-range monitor during large range
/// additions.
#[derive(Clone)]
pub(crate) struct AssignmentQueue {
    tx: mpsc::UnboundedSender<RangeAssignment>,
    depth: watch::Sender<usize>,
    soft_cap: usize,
}

pub(crate) struct AssignmentQueueReceiver {
    rx: mpsc::UnboundedReceiver<RangeAssignment>,
    depth: watch::Sender<usize>,
}

impl AssignmentQueue {
    pub fn new(soft_cap: usize) -> (Self, AssignmentQueueReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (depth, _) = watch::channel(0usize);
        (
            Self {
                tx,
                depth: depth.clone(),
                soft_cap,
            },
            AssignmentQueueReceiver { rx, depth },
        )
    }

    /// Enqueues an intent.
    pub fn send(&self, assignment: RangeAssignment) {
        self.depth.send_modify(|depth| *depth += 1);
        if self.tx.send(assignment).is_err() {
            // Engine gone; the manager is unwinding.
            self.depth.send_modify(|depth| *depth -= 1);
        }
    }

    /// Enqueues an intent, waiting below the soft cap first.
    pub async fn send_backpressured(&self, assignment: RangeAssignment) {
        let mut depth = self.depth.subscribe();
        while *depth.borrow_and_update() >= self.soft_cap {
            if depth.changed().await.is_err() {
                return;
            }
        }
        self.send(assignment);
    }

    /// Resolves once every enqueued intent has been picked up by the engine.
    pub async fn wait_drained(&self) {
        let mut depth = self.depth.subscribe();
        while *depth.borrow_and_update() > 0 {
            if depth.changed().await.is_err() {
                return;
            }
        }
    }
}

impl AssignmentQueueReceiver {
    pub async fn recv(&mut self) -> Option<RangeAssignment> {
        let assignment = self.rx.recv().await;
        if assignment.is_some() {
            self.depth.send_modify(|depth| *depth -= 1);
        }
        assignment
    }
}

/// In-flight assign RPCs, cancellable by range.
///
/// A revoke covering a range cancels any assign RPC still in flight for it,
/// and a newer overlapping assign supersedes an older one.
#[derive(Default)]
pub(crate) struct InFlightAssignments {
    by_range: Option<RangeMap<u64>>,
    tokens: HashMap<u64, CancellationToken>,
    next_slot: u64,
}

impl InFlightAssignments {
    fn map(&mut self) -> &mut RangeMap<u64> {
        self.by_range
            .get_or_insert_with(|| RangeMap::new(0, KeyRange::normal().end))
    }

    /// Cancels in-flight assigns intersecting `range`.
    pub fn cancel(&mut self, range: &KeyRange) {
        let slots: Vec<u64> = self
            .map()
            .intersecting_ranges(range)
            .into_iter()
            .filter(|(_, slot)| **slot != 0)
            .map(|(_, slot)| *slot)
            .collect();
        for slot in slots {
            if let Some(token) = self.tokens.remove(&slot) {
                token.cancel();
            }
        }
        self.map().insert(range.clone(), 0);
    }

    /// Registers a new in-flight assign over `range`, superseding older
    /// overlapping ones, and returns its cancellation token plus slot id.
    pub fn insert(&mut self, range: &KeyRange) -> (CancellationToken, u64) {
        self.cancel(range);
        self.next_slot += 1;
        let slot = self.next_slot;
        let token = CancellationToken::new();
        self.map().insert(range.clone(), slot);
        self.tokens.insert(slot, token.clone());
        (token, slot)
    }

    /// Drops the bookkeeping of a completed RPC.
    pub fn finish(&mut self, slot: u64) {
        self.tokens.remove(&slot);
    }
}

/// Runs the engine until the queue closes or the manager unwinds.
#[tracing::instrument(skip_all, fields(epoch = inner.epoch))]
pub(crate) async fn run_assignment_engine(
    inner: Arc<ManagerInner>,
    mut queue: AssignmentQueueReceiver,
) -> Result<(), ManagerError> {
    let in_flight = Arc::new(Mutex::new(InFlightAssignments::default()));

    while let Some(assignment) = queue.recv().await {
        let seq = inner.next_seq();
        match assignment {
            RangeAssignment::Assign {
                range,
                worker,
                kind,
            } => handle_assign(&inner, &in_flight, range, worker, kind, seq).await,
            RangeAssignment::Revoke {
                range,
                worker,
                dispose,
            } => handle_revoke(&inner, &in_flight, range, worker, dispose, seq),
        }
    }
    Ok(())
}

async fn handle_assign(
    inner: &Arc<ManagerInner>,
    in_flight: &Arc<Mutex<InFlightAssignments>>,
    range: KeyRange,
    worker: Option<WorkerId>,
    kind: AssignKind,
    seq: AssignmentSeq,
) {
    {
        let state = inner.state.lock().expect("state mutex not poisoned");
        let current = state.assignments.intersecting_ranges(&range);
        debug_assert_eq!(
            current.len(),
            1,
            "an assign target must be exactly one current range"
        );
        if kind == AssignKind::Continue {
            let worker = worker.expect("continue assignments carry their worker");
            let stale = current.first().map_or(true, |(current_range, current_worker)| {
                *current_range != range || **current_worker != worker
            });
            if stale {
                // The granule was re-split or moved between the worker's
                // report and this intent.
                tracing::debug!(%range, %seq, "dropping out-of-date continue assignment");
                return;
            }
        }
    }

    let worker_id = match worker.filter(|worker| !worker.is_zero()) {
        Some(worker_id) => worker_id,
        None => pick_worker_for_assign(inner).await,
    };

    {
        let mut state = inner.state.lock().expect("state mutex not poisoned");
        state.assignments.insert(range.clone(), worker_id);
        inner.metrics.granules.set(state.assignments.len() as i64);
        if kind != AssignKind::Continue {
            if let Some(stats) = state.worker_stats.get_mut(&worker_id) {
                stats.num_granules_assigned += 1;
            }
        }
    }

    let (token, slot) = in_flight
        .lock()
        .expect("in-flight mutex not poisoned")
        .insert(&range);
    let rpc_inner = inner.clone();
    let rpc_in_flight = in_flight.clone();
    inner.spawn_task("assign-rpc", async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = dispatch_assign(&rpc_inner, range, worker_id, kind, seq) => {}
        }
        rpc_in_flight
            .lock()
            .expect("in-flight mutex not poisoned")
            .finish(slot);
        Ok(())
    });
}

fn handle_revoke(
    inner: &Arc<ManagerInner>,
    in_flight: &Arc<Mutex<InFlightAssignments>>,
    range: KeyRange,
    worker: Option<WorkerId>,
    dispose: bool,
    seq: AssignmentSeq,
) {
    if let Some(worker_id) = worker {
        // Targeted revoke: part of recovery or worker death.
        let mut state = inner.state.lock().expect("state mutex not poisoned");
        if let Some(stats) = state.worker_stats.get_mut(&worker_id) {
            stats.num_granules_assigned -= 1;
        }
        drop(state);
        let rpc_inner = inner.clone();
        let rpc_range = range.clone();
        inner.spawn_task("revoke-rpc", async move {
            dispatch_revoke(&rpc_inner, rpc_range, worker_id, dispose, seq).await;
            Ok(())
        });
    } else {
        let owners: Vec<(KeyRange, WorkerId)> = {
            let mut state = inner.state.lock().expect("state mutex not poisoned");
            let owners: Vec<(KeyRange, WorkerId)> = state
                .assignments
                .intersecting_ranges(&range)
                .into_iter()
                .map(|(sub, owner)| (sub, *owner))
                .collect();
            for (sub, owner) in &owners {
                // Untargeted revokes never truncate existing granules.
                debug_assert!(range.contains_range(sub), "revoke must cover whole granules");
                if let Some(stats) = state.worker_stats.get_mut(owner) {
                    stats.num_granules_assigned -= 1;
                }
            }
            state.assignments.insert(range.clone(), WorkerId::ZERO);
            inner.metrics.granules.set(state.assignments.len() as i64);
            owners
        };

        // Disjoint sub-ranges of one revocation share its sequence number.
        for (sub, owner) in owners {
            if owner.is_zero() {
                continue;
            }
            let rpc_inner = inner.clone();
            inner.spawn_task("revoke-rpc", async move {
                dispatch_revoke(&rpc_inner, sub, owner, dispose, seq).await;
                Ok(())
            });
        }
    }

    in_flight
        .lock()
        .expect("in-flight mutex not poisoned")
        .cancel(&range);
}

/// Picks the worker with the fewest granules, breaking ties uniformly at
/// random. Blocks until the recruiter has produced at least one worker.
pub(crate) async fn pick_worker_for_assign(inner: &Arc<ManagerInner>) -> WorkerId {
    let mut membership = inner.membership.subscribe();
    loop {
        {
            let state = inner.state.lock().expect("state mutex not poisoned");
            if !state.worker_stats.is_empty() {
                let min = state
                    .worker_stats
                    .values()
                    .map(|stats| stats.num_granules_assigned)
                    .min()
                    .expect("stats are not empty");
                let mut eligible: Vec<WorkerId> = state
                    .worker_stats
                    .iter()
                    .filter(|(_, stats)| stats.num_granules_assigned == min)
                    .map(|(id, _)| *id)
                    .collect();
                eligible.sort_unstable();
                let index = inner.with_rng(|rng| {
                    use rand::Rng as _;
                    rng.gen_range(0..eligible.len())
                });
                return eligible[index];
            }
        }
        // No workers at all: nudge the recruiter and wait.
        inner.restart_recruiting.notify_one();
        if membership.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn dispatch_assign(
    inner: &Arc<ManagerInner>,
    range: KeyRange,
    worker_id: WorkerId,
    kind: AssignKind,
    seq: AssignmentSeq,
) {
    tracing::debug!(%range, %seq, worker = %worker_id, ?kind, "assigning range");

    let api = {
        let state = inner.state.lock().expect("state mutex not poisoned");
        state.workers.get(&worker_id).map(|handle| handle.api.clone())
    };

    let result = match api {
        Some(api) => {
            inner.metrics.assignments_sent.inc();
            api.assign_range(AssignRangeRequest {
                range: range.clone(),
                seq,
                kind,
            })
            .await
        }
        // The worker died between selection and dispatch.
        None => Err(WorkerRpcError::NoMoreServers),
    };

    match result {
        Ok(()) => {}
        Err(WorkerRpcError::AssignmentConflict) => {
            // Another manager holds the granule lock. If the conflict came
            // from a successor, the lock check will notice and kill us.
            tracing::debug!(%range, worker = %worker_id, "assignment conflict, arming lock check");
            inner.do_lock_check.notify_one();
        }
        Err(WorkerRpcError::ManagerReplaced) => {
            inner.signal_replaced();
        }
        Err(error) => {
            tracing::debug!(%range, worker = %worker_id, ?error, "assign failed, requeueing");
            // Unassign from the failed worker first, then retry as a normal
            // assignment with the worker cleared.
            inner.queue.send(RangeAssignment::Revoke {
                range: range.clone(),
                worker: Some(worker_id),
                dispose: false,
            });
            inner.queue.send(RangeAssignment::Assign {
                range,
                worker: None,
                kind: AssignKind::Normal,
            });
        }
    }
}

async fn dispatch_revoke(
    inner: &Arc<ManagerInner>,
    range: KeyRange,
    worker_id: WorkerId,
    dispose: bool,
    seq: AssignmentSeq,
) {
    tracing::debug!(%range, %seq, worker = %worker_id, dispose, "revoking range");

    let api = {
        let state = inner.state.lock().expect("state mutex not poisoned");
        state.workers.get(&worker_id).map(|handle| handle.api.clone())
    };
    // Revoking from a dead worker is trivially complete.
    let Some(api) = api else { return };

    inner.metrics.revokes_sent.inc();
    let result = api
        .revoke_range(RevokeRangeRequest {
            range: range.clone(),
            seq,
            dispose,
        })
        .await;

    match result {
        Ok(()) => {}
        Err(WorkerRpcError::ManagerReplaced) => {
            inner.signal_replaced();
        }
        Err(WorkerRpcError::AssignmentConflict) => {
            inner.do_lock_check.notify_one();
        }
        Err(error) if dispose => {
            // A dispose must eventually reach a worker; retry with the
            // worker cleared so the current owner gets it.
            tracing::debug!(%range, ?error, "dispose revoke failed, requeueing");
            inner.queue.send(RangeAssignment::Revoke {
                range,
                worker: None,
                dispose: true,
            });
        }
        Err(error) => {
            tracing::debug!(%range, ?error, "revoke failed, ignoring");
        }
    }
}
