// Copyright (c) Granules Contributors
// SPDX-License-Identifier: Apache-2.0

//! Channel-backed doubles of the manager's external collaborators: workers,
//! the recruitment endpoint, the split estimator, and the object store.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use granules_core::{
    messages::{
        AssignRangeRequest, GetGranuleAssignmentsReply, GetGranuleAssignmentsRequest,
        GranuleAssignment, GranuleStatusReply, GranuleStatusRequest, HaltWorkerRequest,
        RevokeRangeRequest, WorkerRegistration,
    },
    AssignmentSeq, Key, KeyRange, RangeMap, WorkerId,
};
use granules_manager::{
    errors::{RecruitError, WorkerRpcError},
    kv::{KvError, KvStore, MemoryKv, SplitEstimator},
    manager::{GranuleManager, ManagerExit, ManagerHandle},
    metadata::Metadata,
    object_store::FileStore,
    worker_service::{CandidateProcess, RecruitmentApi, WorkerApi, WorkerHandle},
    ManagerConfig,
};
use prometheus::Registry;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Everything a stub worker accepted, in acceptance order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Assign(AssignRangeRequest),
    Revoke(RevokeRangeRequest),
    Halt,
}

struct StubWorkerState {
    alive: AtomicBool,
    // Largest sequence accepted per range; requests below it are rejected,
    // mirroring the worker-side granule lock rule.
    last_seq: Mutex<RangeMap<AssignmentSeq>>,
    owned: Mutex<RangeMap<Option<AssignmentSeq>>>,
    events: Mutex<Vec<WorkerEvent>>,
    status_tx: Mutex<Option<mpsc::UnboundedSender<Result<GranuleStatusReply, WorkerRpcError>>>>,
}

/// A worker double driven entirely by the test.
#[derive(Clone)]
pub struct StubWorker {
    pub worker_id: WorkerId,
    pub address: String,
    state: Arc<StubWorkerState>,
}

impl StubWorker {
    pub fn new(worker_id: WorkerId, address: impl Into<String>) -> Self {
        Self {
            worker_id,
            address: address.into(),
            state: Arc::new(StubWorkerState {
                alive: AtomicBool::new(true),
                last_seq: Mutex::new(RangeMap::new(
                    AssignmentSeq::UNMAPPED,
                    KeyRange::normal().end,
                )),
                owned: Mutex::new(RangeMap::new(None, KeyRange::normal().end)),
                events: Mutex::new(Vec::new()),
                status_tx: Mutex::new(None),
            }),
        }
    }

    pub fn handle(&self, dc: Option<String>) -> WorkerHandle {
        WorkerHandle {
            worker_id: self.worker_id,
            address: self.address.clone(),
            dc,
            api: Arc::new(self.clone()),
        }
    }

    /// Stops answering RPCs and closes the status stream.
    pub fn kill(&self) {
        self.state.alive.store(false, Ordering::SeqCst);
        self.state
            .status_tx
            .lock()
            .unwrap()
            .take();
    }

    /// Pretends the worker already owns `range` at `seq` (state inherited
    /// from an earlier manager generation).
    pub fn seed_assignment(&self, range: KeyRange, seq: AssignmentSeq) {
        self.state.last_seq.lock().unwrap().insert(range.clone(), seq);
        self.state.owned.lock().unwrap().insert(range, Some(seq));
    }

    /// Pushes a granule status report onto the status stream, waiting for
    /// the supervisor to open it first.
    pub async fn send_status(&self, reply: GranuleStatusReply) {
        let mut reply = Some(reply);
        loop {
            {
                let guard = self.state.status_tx.lock().unwrap();
                if let Some(tx) = guard.as_ref() {
                    tx.send(Ok(reply.take().expect("sent once")))
                        .expect("status stream receiver dropped");
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn events(&self) -> Vec<WorkerEvent> {
        self.state.events.lock().unwrap().clone()
    }

    /// Currently owned ranges with the sequence they were accepted under.
    pub fn owned(&self) -> Vec<(KeyRange, AssignmentSeq)> {
        self.state
            .owned
            .lock()
            .unwrap()
            .ranges()
            .into_iter()
            .filter_map(|(range, seq)| seq.map(|seq| (range, seq)))
            .collect()
    }

    fn check_alive(&self) -> Result<(), WorkerRpcError> {
        if self.state.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(WorkerRpcError::ConnectionFailed)
        }
    }

    // Accept iff the request's sequence is at least every sequence already
    // accepted for an overlapping range.
    fn accept(&self, range: &KeyRange, seq: AssignmentSeq) -> Result<(), WorkerRpcError> {
        let mut last_seq = self.state.last_seq.lock().unwrap();
        let newest = last_seq
            .intersecting_ranges(range)
            .into_iter()
            .map(|(_, seq)| *seq)
            .max()
            .unwrap_or(AssignmentSeq::UNMAPPED);
        if seq < newest {
            return Err(WorkerRpcError::AssignmentConflict);
        }
        last_seq.insert(range.clone(), seq);
        Ok(())
    }
}

#[async_trait]
impl WorkerApi for StubWorker {
    async fn assign_range(&self, request: AssignRangeRequest) -> Result<(), WorkerRpcError> {
        self.check_alive()?;
        self.accept(&request.range, request.seq)?;
        self.state
            .owned
            .lock()
            .unwrap()
            .insert(request.range.clone(), Some(request.seq));
        self.state
            .events
            .lock()
            .unwrap()
            .push(WorkerEvent::Assign(request));
        Ok(())
    }

    async fn revoke_range(&self, request: RevokeRangeRequest) -> Result<(), WorkerRpcError> {
        self.check_alive()?;
        self.accept(&request.range, request.seq)?;
        self.state
            .owned
            .lock()
            .unwrap()
            .insert(request.range.clone(), None);
        self.state
            .events
            .lock()
            .unwrap()
            .push(WorkerEvent::Revoke(request));
        Ok(())
    }

    async fn get_granule_assignments(
        &self,
        _request: GetGranuleAssignmentsRequest,
    ) -> Result<GetGranuleAssignmentsReply, WorkerRpcError> {
        self.check_alive()?;
        let assignments = self
            .owned()
            .into_iter()
            .map(|(range, seq)| GranuleAssignment { range, seq })
            .collect();
        Ok(GetGranuleAssignmentsReply { assignments })
    }

    async fn halt(&self, _request: HaltWorkerRequest) -> Result<(), WorkerRpcError> {
        self.state.events.lock().unwrap().push(WorkerEvent::Halt);
        self.kill();
        Ok(())
    }

    async fn granule_status_stream(
        &self,
        _request: GranuleStatusRequest,
    ) -> Result<BoxStream<'static, Result<GranuleStatusReply, WorkerRpcError>>, WorkerRpcError>
    {
        self.check_alive()?;
        let (tx, rx) = mpsc::unbounded_channel();
        *self.state.status_tx.lock().unwrap() = Some(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn ping(&self) -> Result<(), WorkerRpcError> {
        self.check_alive()
    }
}

/// A recruitment endpoint with a scripted candidate queue and an in-memory
/// worker registry.
pub struct StubRecruitment {
    metadata: Metadata,
    registry: Mutex<HashMap<WorkerId, StubWorker>>,
    candidates: Mutex<VecDeque<CandidateProcess>>,
    candidates_changed: Notify,
    pub recruit_calls: AtomicUsize,
}

impl StubRecruitment {
    pub fn new(metadata: Metadata) -> Self {
        Self {
            metadata,
            registry: Mutex::new(HashMap::new()),
            candidates: Mutex::new(VecDeque::new()),
            candidates_changed: Notify::new(),
            recruit_calls: AtomicUsize::new(0),
        }
    }

    /// Makes a process address available for recruitment.
    pub fn add_candidate(&self, address: impl Into<String>) {
        self.candidates.lock().unwrap().push_back(CandidateProcess {
            address: address.into(),
            dc: None,
        });
        self.candidates_changed.notify_one();
    }

    /// Registers an already-running worker, as the worker itself would on
    /// startup.
    pub async fn adopt_existing(&self, worker: &StubWorker) {
        self.registry
            .lock()
            .unwrap()
            .insert(worker.worker_id, worker.clone());
        self.metadata
            .register_worker(&WorkerRegistration {
                worker_id: worker.worker_id,
                address: worker.address.clone(),
                dc: None,
            })
            .await
            .expect("worker registration failed");
    }

    pub fn recruited_workers(&self) -> Vec<StubWorker> {
        self.registry.lock().unwrap().values().cloned().collect()
    }
}

#[async_trait]
impl RecruitmentApi for StubRecruitment {
    async fn recruit_worker(
        &self,
        exclude_addresses: Vec<String>,
    ) -> Result<CandidateProcess, RecruitError> {
        self.recruit_calls.fetch_add(1, Ordering::SeqCst);
        let excluded: HashSet<String> = exclude_addresses.into_iter().collect();
        loop {
            {
                let mut candidates = self.candidates.lock().unwrap();
                if let Some(index) = candidates
                    .iter()
                    .position(|candidate| !excluded.contains(&candidate.address))
                {
                    return Ok(candidates.remove(index).expect("index is valid"));
                }
            }
            self.candidates_changed.notified().await;
        }
    }

    async fn initialize_worker(
        &self,
        candidate: &CandidateProcess,
        interface_id: WorkerId,
    ) -> Result<WorkerHandle, RecruitError> {
        let worker = StubWorker::new(interface_id, candidate.address.clone());
        self.registry
            .lock()
            .unwrap()
            .insert(interface_id, worker.clone());
        self.metadata
            .register_worker(&WorkerRegistration {
                worker_id: interface_id,
                address: candidate.address.clone(),
                dc: candidate.dc.clone(),
            })
            .await
            .map_err(|error| RecruitError::Other(anyhow::anyhow!("{error}")))?;
        Ok(worker.handle(candidate.dc.clone()))
    }

    async fn connect_worker(
        &self,
        registration: &WorkerRegistration,
    ) -> Result<WorkerHandle, RecruitError> {
        let registry = self.registry.lock().unwrap();
        registry
            .get(&registration.worker_id)
            .map(|worker| worker.handle(registration.dc.clone()))
            .ok_or_else(|| RecruitError::Other(anyhow::anyhow!("unknown worker")))
    }
}

/// A split estimator answering from scripted boundary lists, falling back
/// to "no split".
#[derive(Default)]
pub struct ScriptedEstimator {
    scripts: Mutex<HashMap<KeyRange, Vec<Key>>>,
}

impl ScriptedEstimator {
    pub fn script(&self, range: KeyRange, boundaries: Vec<Key>) {
        self.scripts.lock().unwrap().insert(range, boundaries);
    }
}

#[async_trait]
impl SplitEstimator for ScriptedEstimator {
    async fn split_points(
        &self,
        range: &KeyRange,
        _write_hot: bool,
    ) -> Result<Vec<Key>, KvError> {
        let scripts = self.scripts.lock().unwrap();
        Ok(scripts
            .get(range)
            .cloned()
            .unwrap_or_else(|| vec![range.begin.clone(), range.end.clone()]))
    }
}

/// An object store double tracking live and deleted paths.
#[derive(Default)]
pub struct RecordingFileStore {
    existing: Mutex<HashSet<String>>,
    deleted: Mutex<Vec<String>>,
}

impl RecordingFileStore {
    pub fn put(&self, path: impl Into<String>) {
        self.existing.lock().unwrap().insert(path.into());
    }

    pub fn existing(&self) -> HashSet<String> {
        self.existing.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl FileStore for RecordingFileStore {
    async fn delete(&self, path: &str) -> anyhow::Result<()> {
        self.existing.lock().unwrap().remove(path);
        self.deleted.lock().unwrap().push(path.to_owned());
        Ok(())
    }
}

/// One in-memory cluster: store, estimator, file store, recruitment.
pub struct TestCluster {
    pub kv: Arc<dyn KvStore>,
    pub estimator: Arc<ScriptedEstimator>,
    pub files: Arc<RecordingFileStore>,
    pub recruitment: Arc<StubRecruitment>,
    /// Client/admin-side metadata access (range declarations, prune
    /// requests, seeding).
    pub admin: Metadata,
}

impl TestCluster {
    pub fn new() -> Self {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new(1 << 20));
        let admin = Metadata::new(kv.clone(), 0, 10_000, 1000);
        Self {
            estimator: Arc::new(ScriptedEstimator::default()),
            files: Arc::new(RecordingFileStore::default()),
            recruitment: Arc::new(StubRecruitment::new(admin.clone())),
            admin,
            kv,
        }
    }

    pub fn config() -> ManagerConfig {
        ManagerConfig {
            worker_timeout: Duration::from_secs(2),
            worker_ping_interval: Duration::from_millis(500),
            worker_list_fetch_interval: Duration::from_millis(500),
            prune_timeout: Duration::from_secs(30),
            ..ManagerConfig::default()
        }
    }

    /// Creates and registers a worker that exists before the manager starts.
    pub async fn add_existing_worker(&self, worker_id: WorkerId, address: &str) -> StubWorker {
        let worker = StubWorker::new(worker_id, address);
        self.recruitment.adopt_existing(&worker).await;
        worker
    }

    /// Starts a manager and drives it on a background task.
    pub async fn spawn_manager(
        &self,
        config: ManagerConfig,
    ) -> (
        ManagerHandle,
        tokio::task::JoinHandle<Result<ManagerExit, granules_manager::errors::ManagerError>>,
    ) {
        let manager = GranuleManager::start(
            config,
            self.kv.clone(),
            self.estimator.clone(),
            self.files.clone(),
            self.recruitment.clone(),
            &Registry::new(),
        )
        .await
        .expect("manager start failed");
        let handle = manager.handle();
        let task = tokio::spawn(manager.run());
        (handle, task)
    }
}

/// Polls `condition` until it holds, panicking after `deadline` of (test)
/// time.
pub async fn eventually(deadline: Duration, what: &str, mut condition: impl FnMut() -> bool) {
    let start = tokio::time::Instant::now();
    while !condition() {
        if start.elapsed() > deadline {
            panic!("condition not reached within {deadline:?}: {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Asserts that `assignments` tile the user key space exactly once.
pub fn assert_full_coverage(assignments: &[(KeyRange, WorkerId)]) {
    assert!(!assignments.is_empty());
    assert_eq!(assignments[0].0.begin, Key::EMPTY);
    assert_eq!(
        assignments[assignments.len() - 1].0.end,
        KeyRange::normal().end
    );
    for pair in assignments.windows(2) {
        assert_eq!(
            pair[0].0.end, pair[1].0.begin,
            "assignment map has a gap or overlap"
        );
    }
}
