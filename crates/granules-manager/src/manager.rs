// Copyright (c) Granules Contributors
// SPDX-License-Identifier: Apache-2.0

//! The granule manager: one active instance per cluster partitions the user
//! key space into granules, assigns them to workers, splits growing
//! granules, replaces failed workers, and garbage-collects granule files.
//!
//! Every component is a long-running task tied to the manager's cancellation
//! token. Components communicate through typed channels; the in-memory
//! assignment map is mutated only by the assignment engine, everything else
//! submits intents onto the assignment queue.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use futures::future::join_all;
use granules_core::{
    messages::HaltWorkerRequest, AssignmentSeq, Epoch, KeyRange, RangeMap, SeqNo, WorkerId,
};
use prometheus::Registry;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ManagerConfig,
    errors::ManagerError,
    kv::{KvStore, SplitEstimator},
    metadata::{self, Metadata},
    metrics::ManagerMetricSet,
    object_store::FileStore,
    worker_service::{RecruitmentApi, WorkerHandle},
};

pub(crate) mod assignment;
pub(crate) mod chaos;
pub(crate) mod client_ranges;
pub(crate) mod recovery;
pub(crate) mod recruiter;
pub(crate) mod retention;
pub(crate) mod split;
pub(crate) mod supervisor;

use assignment::{AssignmentQueue, AssignmentQueueReceiver};

/// Per-worker bookkeeping kept by the assignment engine.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct WorkerStats {
    pub num_granules_assigned: i64,
}

/// Mutable state shared between the manager's components.
///
/// `assignments` is owned by the assignment engine: only the engine (and
/// recovery, which runs before the engine starts) mutates it. Other
/// components read snapshots under the mutex.
pub(crate) struct SharedState {
    pub workers: HashMap<WorkerId, WorkerHandle>,
    pub worker_stats: HashMap<WorkerId, WorkerStats>,
    pub worker_addresses: HashSet<String>,
    pub dead_workers: HashSet<WorkerId>,
    pub recruiting_addresses: HashSet<String>,
    pub assignments: RangeMap<WorkerId>,
    pub known_client_ranges: RangeMap<bool>,
}

impl SharedState {
    fn new() -> Self {
        Self {
            workers: HashMap::new(),
            worker_stats: HashMap::new(),
            worker_addresses: HashSet::new(),
            dead_workers: HashSet::new(),
            recruiting_addresses: HashSet::new(),
            assignments: RangeMap::new(WorkerId::ZERO, KeyRange::normal().end),
            known_client_ranges: RangeMap::new(false, KeyRange::normal().end),
        }
    }
}

pub(crate) struct ManagerInner {
    pub epoch: Epoch,
    pub config: ManagerConfig,
    pub kv: Arc<dyn KvStore>,
    pub estimator: Arc<dyn SplitEstimator>,
    pub files: Arc<dyn FileStore>,
    pub recruitment: Arc<dyn RecruitmentApi>,
    pub metadata: Metadata,
    pub metrics: ManagerMetricSet,
    pub state: Mutex<SharedState>,
    pub queue: AssignmentQueue,
    rng: Mutex<StdRng>,
    next_seqno: AtomicU64,
    // Signals. `membership` versions the worker set and recruiting counters;
    // `replaced` latches once the manager has lost its epoch.
    pub membership: watch::Sender<u64>,
    pub start_recruiting: watch::Sender<bool>,
    pub restart_recruiting: Notify,
    pub do_lock_check: Notify,
    pub replaced: watch::Sender<bool>,
    pub done_recovering: watch::Sender<bool>,
    pub cancel: CancellationToken,
    task_failures: mpsc::UnboundedSender<(&'static str, ManagerError)>,
}

impl ManagerInner {
    /// Draws the next assignment sequence number.
    pub fn next_seq(&self) -> AssignmentSeq {
        AssignmentSeq::new(self.epoch, self.next_seqno())
    }

    /// Draws the next raw sequence number.
    pub fn next_seqno(&self) -> SeqNo {
        self.next_seqno.fetch_add(1, Ordering::SeqCst)
    }

    /// Latches the replaced signal; every component unwinds on it.
    pub fn signal_replaced(&self) {
        let _ = self.replaced.send(true);
    }

    /// Bumps the membership version, waking anyone waiting for workers.
    pub fn bump_membership(&self) {
        self.membership.send_modify(|version| *version += 1);
    }

    pub fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock().expect("rng mutex not poisoned");
        f(&mut rng)
    }

    /// Spawns a component task tied to the manager's cancellation token.
    /// A task error is routed to the main loop, which tears the manager
    /// down.
    pub fn spawn_task(
        self: &Arc<Self>,
        name: &'static str,
        future: impl std::future::Future<Output = Result<(), ManagerError>> + Send + 'static,
    ) {
        let cancel = self.cancel.clone();
        let failures = self.task_failures.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = future => {
                    if let Err(error) = result {
                        let _ = failures.send((name, error));
                    }
                }
            }
        });
    }
}

/// How a manager run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerExit {
    /// A manager with a higher epoch took over.
    Replaced,
    /// The manager was halted through its RPC surface.
    Halted,
}

enum HaltCommand {
    /// Stop the manager.
    Manager(oneshot::Sender<()>),
    /// Tear down every worker, then stop the manager.
    Granules(oneshot::Sender<()>),
}

/// Cloneable handle exposing the manager's RPC surface and read-only state,
/// usable while [`GranuleManager::run`] drives the instance.
#[derive(Clone)]
pub struct ManagerHandle {
    inner: Arc<ManagerInner>,
    halt: mpsc::Sender<HaltCommand>,
}

impl ManagerHandle {
    /// The manager's epoch.
    pub fn epoch(&self) -> Epoch {
        self.inner.epoch
    }

    /// Resolves once recovery has completed.
    pub async fn wait_recovered(&self) {
        let mut done = self.inner.done_recovering.subscribe();
        while !*done.borrow_and_update() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }

    /// Resolves once the assignment queue is empty.
    pub async fn wait_assignments_drained(&self) {
        self.inner.queue.wait_drained().await;
    }

    /// Snapshot of the in-memory assignment map.
    pub fn assignments(&self) -> Vec<(KeyRange, WorkerId)> {
        let state = self.inner.state.lock().expect("state mutex not poisoned");
        state
            .assignments
            .ranges()
            .into_iter()
            .map(|(range, worker)| (range, *worker))
            .collect()
    }

    /// Ids of the currently live workers.
    pub fn live_workers(&self) -> Vec<WorkerId> {
        let state = self.inner.state.lock().expect("state mutex not poisoned");
        state.workers.keys().copied().collect()
    }

    /// `HaltBlobManager`: stops the manager.
    pub async fn halt(&self) {
        let (reply, done) = oneshot::channel();
        if self.halt.send(HaltCommand::Manager(reply)).await.is_ok() {
            let _ = done.await;
        }
    }

    /// `HaltBlobGranules`: halts and deregisters every worker, then stops
    /// the manager.
    pub async fn halt_granules(&self) {
        let (reply, done) = oneshot::channel();
        if self.halt.send(HaltCommand::Granules(reply)).await.is_ok() {
            let _ = done.await;
        }
    }
}

/// One granule manager instance.
pub struct GranuleManager {
    inner: Arc<ManagerInner>,
    handle: ManagerHandle,
    halt_rx: mpsc::Receiver<HaltCommand>,
    failures_rx: mpsc::UnboundedReceiver<(&'static str, ManagerError)>,
    queue_rx: Option<AssignmentQueueReceiver>,
}

impl GranuleManager {
    /// Claims the next manager epoch and builds an instance around it.
    ///
    /// Recovery has not run yet; [`run`][Self::run] performs it before any
    /// other component starts.
    pub async fn start(
        config: ManagerConfig,
        kv: Arc<dyn KvStore>,
        estimator: Arc<dyn SplitEstimator>,
        files: Arc<dyn FileStore>,
        recruitment: Arc<dyn RecruitmentApi>,
        registry: &Registry,
    ) -> Result<Self, ManagerError> {
        let epoch = metadata::acquire_manager_epoch(&kv).await?;
        tracing::info!(epoch, "granule manager claimed epoch");

        let metadata = Metadata::new(
            kv.clone(),
            epoch,
            config.scan_row_limit,
            config.mapping_chunk_size,
        );
        let metrics = ManagerMetricSet::new(registry);
        metrics.epoch.set(epoch as i64);

        let seed = config.seed.unwrap_or_else(|| rand::thread_rng().r#gen());
        let (queue, queue_rx) = AssignmentQueue::new(config.assignment_queue_soft_cap);
        let (task_failures, failures_rx) = mpsc::unbounded_channel();
        let (halt_tx, halt_rx) = mpsc::channel(4);

        let inner = Arc::new(ManagerInner {
            epoch,
            config,
            kv,
            estimator,
            files,
            recruitment,
            metadata,
            metrics,
            state: Mutex::new(SharedState::new()),
            queue,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            next_seqno: AtomicU64::new(1),
            membership: watch::channel(0).0,
            start_recruiting: watch::channel(false).0,
            restart_recruiting: Notify::new(),
            do_lock_check: Notify::new(),
            replaced: watch::channel(false).0,
            done_recovering: watch::channel(false).0,
            cancel: CancellationToken::new(),
            task_failures,
        });

        let handle = ManagerHandle {
            inner: inner.clone(),
            halt: halt_tx,
        };

        Ok(Self {
            inner,
            handle,
            halt_rx,
            failures_rx,
            queue_rx: Some(queue_rx),
        })
    }

    /// Returns a handle to this manager.
    pub fn handle(&self) -> ManagerHandle {
        self.handle.clone()
    }

    /// Runs the manager to completion: recovery first, then all components
    /// until the manager is replaced, halted, or a component fails.
    pub async fn run(mut self) -> Result<ManagerExit, ManagerError> {
        let inner = self.inner.clone();

        // The recruiter is spawned first but idles until recovery has
        // acknowledged the existing workers.
        inner.spawn_task("recruiter", recruiter::recruit_workers(inner.clone()));

        match recovery::recover(inner.clone()).await {
            Ok(()) => {}
            Err(ManagerError::Replaced) => {
                inner.signal_replaced();
            }
            Err(error) => {
                tracing::error!(?error, "granule manager recovery failed");
                inner.cancel.cancel();
                return Err(error);
            }
        }

        let queue_rx = self.queue_rx.take().expect("run is called once");
        inner.spawn_task(
            "assignment-engine",
            assignment::run_assignment_engine(inner.clone(), queue_rx),
        );
        inner.spawn_task("lock-watchdog", run_lock_watchdog(inner.clone()));
        inner.spawn_task(
            "client-range-monitor",
            client_ranges::monitor_client_ranges(inner.clone()),
        );
        inner.spawn_task(
            "retention-gc",
            retention::monitor_prune_intents(inner.clone()),
        );
        if inner.config.chaos_range_mover {
            inner.spawn_task("chaos-range-mover", chaos::chaos_range_mover(inner.clone()));
        }

        let mut replaced_rx = inner.replaced.subscribe();
        let exit = loop {
            // The signal may have latched before this point (e.g. during
            // recovery), so check before sleeping on it.
            if *replaced_rx.borrow_and_update() {
                tracing::info!(epoch = inner.epoch, "granule manager replaced, exiting");
                break ManagerExit::Replaced;
            }
            tokio::select! {
                result = replaced_rx.changed() => {
                    if result.is_err() {
                        break ManagerExit::Replaced;
                    }
                }
                Some(command) = self.halt_rx.recv() => match command {
                    HaltCommand::Manager(reply) => {
                        tracing::info!(epoch = inner.epoch, "granule manager halted");
                        let _ = reply.send(());
                        break ManagerExit::Halted;
                    }
                    HaltCommand::Granules(reply) => {
                        halt_granules(&inner).await;
                        tracing::info!(epoch = inner.epoch, "granules halted");
                        let _ = reply.send(());
                        break ManagerExit::Halted;
                    }
                },
                Some((name, error)) = self.failures_rx.recv() => {
                    if matches!(error, ManagerError::Replaced) {
                        inner.signal_replaced();
                        continue;
                    }
                    tracing::error!(task = name, ?error, "granule manager task failed");
                    inner.cancel.cancel();
                    return Err(error);
                }
            }
        };

        inner.cancel.cancel();
        Ok(exit)
    }
}

/// Halts and deregisters every registered worker.
async fn halt_granules(inner: &Arc<ManagerInner>) {
    let workers = match inner.metadata.list_workers().await {
        Ok(workers) => workers,
        Err(error) => {
            tracing::warn!(?error, "failed to list workers for halt");
            return;
        }
    };

    let halts = workers.iter().map(|registration| async {
        match inner.recruitment.connect_worker(registration).await {
            Ok(handle) => {
                let request = HaltWorkerRequest {
                    manager_epoch: inner.epoch,
                };
                if let Err(error) = handle.api.halt(request).await {
                    tracing::debug!(worker = %registration.worker_id, ?error, "halt failed");
                }
            }
            Err(error) => {
                tracing::debug!(worker = %registration.worker_id, ?error, "connect failed");
            }
        }
        if let Err(error) = inner.metadata.deregister_worker(registration.worker_id).await {
            tracing::warn!(worker = %registration.worker_id, ?error, "deregister failed");
        }
    });
    join_all(halts).await;
}


/// The epoch-lock watchdog: any component suspecting a conflict trips
/// `do_lock_check`; the watchdog debounces and re-reads the epoch key in a
/// fresh transaction, latching the replaced signal on mismatch.
#[tracing::instrument(skip_all, fields(epoch = inner.epoch))]
async fn run_lock_watchdog(inner: Arc<ManagerInner>) -> Result<(), ManagerError> {
    loop {
        inner.do_lock_check.notified().await;
        // Debounce: a burst of conflicts should produce one check.
        tokio::time::sleep(inner.config.lock_check_debounce).await;

        match inner.metadata.verify_manager_lock().await {
            Ok(()) => {
                tracing::debug!("manager lock still held after conflict");
            }
            Err(crate::errors::MetadataError::Replaced) => {
                tracing::info!("manager lock lost, signalling failover");
                inner.signal_replaced();
                return Ok(());
            }
            Err(crate::errors::MetadataError::Kv(error)) => {
                return Err(ManagerError::Kv(error));
            }
        }
    }
}
