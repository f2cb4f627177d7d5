use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use async_trait::async_trait;
use num_traits::Num;
use regex::{escape, Regex};
use rill_subtask_types::communication::{
    ClientProvider,
    FetchRequest,
    GetRequest,
    MissingDataPolicy,
    MockClusterClient,
    MockMetaClient,
    MockQuotaClient,
    MockSlotManagerClient,
    MockStorageClient,
    MockTaskClient,
    MockWorkerMetaClient,
    PutInfo,
    SharedClusterClient,
    SharedMetaClient,
    SharedQuotaClient,
    SharedSlotManagerClient,
    SharedStorageClient,
    SharedSubtaskRunnerClient,
    SharedTaskClient,
    SharedWorkerMetaClient,
    StorageClient,
    StorageInfo,
    SubtaskRunnerClient,
};
use rill_subtask_types::errors::{ClientResult, ComputeError, SubtaskExecutionResult};
use rill_subtask_types::graph::{Chunk, ChunkGraph, ChunkTypeInfo};
use rill_subtask_types::operand::{
    ChunkKernel,
    ChunkKey,
    ComputeOp,
    OpKey,
    Operand,
    OperandKind,
    SizeContext,
};
use rill_subtask_types::store::{ChunkPayload, DataKey, DataStore, OperandContext};
use rill_subtask_types::subtask::{
    BandName,
    SessionId,
    SlotId,
    StageId,
    Subtask,
    SubtaskId,
    SubtaskResult,
    TaskId,
};

pub(crate) const TEST_SESSION: &str = "session-1";
pub(crate) const TEST_BAND: &str = "numa-0";
pub(crate) const TEST_WORKER: &str = "w1";
pub(crate) const TEST_SUPERVISOR: &str = "supervisor-1";

/// Parses one numeric metric value out of a Prometheus-rendered string,
/// optionally constrained to a label set.
pub(crate) fn parse_numeric_metric<T: Num + FromStr>(
    metrics_as_string: &str,
    metric_name: &str,
    labels: Option<&[(&'static str, &str)]>,
) -> Option<T> {
    let mut labels_pattern = String::new();
    if let Some(labels) = labels {
        let inner_pattern = labels
            .iter()
            .map(|(key, value)| format!(r#"{}="{}""#, escape(key), escape(value)))
            .collect::<Vec<_>>()
            .join(",");
        labels_pattern = format!(r"\{{{inner_pattern}\}}");
    }
    let pattern = format!(r"{}{}\s+(\d+)", escape(metric_name), labels_pattern);
    let re = Regex::new(&pattern).expect("valid metric regex");
    re.captures(metrics_as_string)
        .and_then(|captures| captures.get(1))
        .and_then(|value| value.as_str().parse().ok())
}

// Chunk and subtask builders.

pub(crate) fn fetch_chunk(key: &str) -> Chunk {
    let op = Arc::new(Operand {
        key: OpKey(format!("fetch-{key}")),
        gpu: false,
        inputs: vec![],
        outputs: vec![ChunkKey::from(key)],
        kind: OperandKind::Fetch,
    });
    Chunk::new(key, op)
}

pub(crate) fn shuffle_chunk(key: &str, n_mappers: usize) -> Chunk {
    let op = Arc::new(Operand {
        key: OpKey(format!("shuffle-{key}")),
        gpu: false,
        inputs: vec![],
        outputs: vec![ChunkKey::from(key)],
        kind: OperandKind::FetchShuffle { n_mappers },
    });
    Chunk::new(key, op)
}

pub(crate) fn compute_chunk(
    key: &str,
    op_key: &str,
    inputs: &[&str],
    retryable: bool,
    kernel: Arc<dyn ChunkKernel>,
) -> Chunk {
    let op = Arc::new(Operand {
        key: OpKey::from(op_key),
        gpu: false,
        inputs: inputs.iter().map(|input| ChunkKey::from(*input)).collect(),
        outputs: vec![ChunkKey::from(key)],
        kind: OperandKind::Compute(ComputeOp { retryable, kernel }),
    });
    let mut chunk = Chunk::new(key, op);
    chunk.type_info =
        Some(ChunkTypeInfo { data_type: "float64".to_owned(), shape: vec![Some(8)] });
    chunk
}

pub(crate) fn test_subtask(id: &str, chunk_graph: ChunkGraph) -> Subtask {
    Subtask {
        subtask_id: SubtaskId::from(id),
        session_id: SessionId::from(TEST_SESSION),
        task_id: TaskId::from("task-1"),
        stage_id: StageId::from("stage-1"),
        chunk_graph,
        pure_depend_keys: Default::default(),
        update_meta_chunks: None,
        retryable: true,
        extra_config: None,
    }
}

pub(crate) fn succeeded_result(subtask: &Subtask, data_size: u64) -> SubtaskResult {
    let mut result = SubtaskResult::for_subtask(subtask);
    result.status = rill_subtask_types::subtask::SubtaskStatus::Succeeded;
    result.progress = 1.0;
    result.data_size = Some(data_size);
    result
}

pub(crate) fn payload_of(value: u64) -> ChunkPayload {
    Arc::new(value)
}

// Kernels.

/// Estimates fixed per-output sizes and materializes a numeric payload per
/// output. Optionally fails when a required input is absent from the store.
#[derive(Debug)]
pub(crate) struct FixedSizeKernel {
    pub store_size: u64,
    pub memory_size: u64,
    pub requires: Vec<DataKey>,
}

impl FixedSizeKernel {
    pub(crate) fn new(store_size: u64, memory_size: u64) -> Self {
        Self { store_size, memory_size, requires: vec![] }
    }
}

impl ChunkKernel for FixedSizeKernel {
    fn estimate_size(&self, ctx: &mut SizeContext, op: &Operand) {
        for out in &op.outputs {
            ctx.insert(out.clone(), (self.store_size, self.memory_size));
        }
    }

    fn execute(
        &self,
        store: &mut DataStore,
        _ctx: &OperandContext,
        op: &Operand,
    ) -> Result<(), ComputeError> {
        for required in &self.requires {
            if !store.contains(required) {
                return Err(ComputeError::new(format!("missing required input {required}")));
            }
        }
        for out in &op.outputs {
            store.insert(DataKey::Chunk(out.clone()), payload_of(self.memory_size));
        }
        Ok(())
    }
}

/// Always fails to execute.
#[derive(Debug)]
pub(crate) struct FailingKernel {
    pub message: String,
}

impl ChunkKernel for FailingKernel {
    fn estimate_size(&self, ctx: &mut SizeContext, op: &Operand) {
        for out in &op.outputs {
            ctx.insert(out.clone(), (0, 0));
        }
    }

    fn execute(
        &self,
        _store: &mut DataStore,
        _ctx: &OperandContext,
        _op: &Operand,
    ) -> Result<(), ComputeError> {
        Err(ComputeError::new(self.message.clone()))
    }
}

/// Blocks inside `execute` until the test releases its gate.
pub(crate) struct GateKernel {
    pub started: Arc<AtomicBool>,
    gate: Mutex<mpsc::Receiver<()>>,
}

impl GateKernel {
    pub(crate) fn new() -> (Self, mpsc::Sender<()>, Arc<AtomicBool>) {
        let (sender, receiver) = mpsc::channel();
        let started = Arc::new(AtomicBool::new(false));
        (Self { started: started.clone(), gate: Mutex::new(receiver) }, sender, started)
    }
}

impl fmt::Debug for GateKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateKernel").finish()
    }
}

impl ChunkKernel for GateKernel {
    fn estimate_size(&self, ctx: &mut SizeContext, op: &Operand) {
        for out in &op.outputs {
            ctx.insert(out.clone(), (0, 0));
        }
    }

    fn execute(
        &self,
        store: &mut DataStore,
        _ctx: &OperandContext,
        op: &Operand,
    ) -> Result<(), ComputeError> {
        self.started.store(true, Ordering::SeqCst);
        let _ = self.gate.lock().expect("gate lock poisoned").recv();
        for out in &op.outputs {
            store.insert(DataKey::Chunk(out.clone()), payload_of(0));
        }
        Ok(())
    }
}

/// A shuffle mapper: writes one mapper-keyed payload per mapper index.
#[derive(Debug)]
pub(crate) struct MapperKernel {
    pub n_mappers: u32,
    pub memory_size_per_mapper: u64,
}

impl ChunkKernel for MapperKernel {
    fn estimate_size(&self, ctx: &mut SizeContext, op: &Operand) {
        for out in &op.outputs {
            ctx.insert(out.clone(), (0, 0));
        }
    }

    fn execute(
        &self,
        store: &mut DataStore,
        _ctx: &OperandContext,
        op: &Operand,
    ) -> Result<(), ComputeError> {
        for out in &op.outputs {
            for mapper in 0..self.n_mappers {
                store.insert(
                    DataKey::Mapper(out.clone(), mapper),
                    payload_of(self.memory_size_per_mapper),
                );
            }
        }
        Ok(())
    }
}

// Collaborator fakes and mock bundles.

/// In-slot runner double: pops one scripted outcome per run and hangs once
/// the script is exhausted; cancellation resolves or hangs per configuration.
pub(crate) struct FakeSubtaskRunner {
    results: Mutex<VecDeque<SubtaskExecutionResult<SubtaskResult>>>,
    cancel_hangs: bool,
    pub run_calls: AtomicUsize,
    pub cancel_calls: AtomicUsize,
}

impl FakeSubtaskRunner {
    pub(crate) fn scripted(
        results: Vec<SubtaskExecutionResult<SubtaskResult>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(results.into()),
            cancel_hangs: false,
            run_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
        })
    }

    /// Runs hang forever; cancellation optionally hangs as well.
    pub(crate) fn hanging(cancel_hangs: bool) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(VecDeque::new()),
            cancel_hangs,
            run_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn run_call_count(&self) -> usize {
        self.run_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn cancel_call_count(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SubtaskRunnerClient for FakeSubtaskRunner {
    async fn run_subtask_in_slot(
        &self,
        _band: BandName,
        _slot_id: SlotId,
        _subtask: Arc<Subtask>,
    ) -> SubtaskExecutionResult<SubtaskResult> {
        self.run_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.results.lock().expect("results lock poisoned").pop_front();
        match next {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    async fn cancel_subtask_in_slot(
        &self,
        _band: BandName,
        _slot_id: SlotId,
    ) -> ClientResult<()> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        if self.cancel_hangs {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

/// Storage double whose prefetch never resolves, for deadline tests.
#[derive(Debug, Default)]
pub(crate) struct HangingStorage;

#[async_trait]
impl StorageClient for HangingStorage {
    async fn fetch(&self, _requests: Vec<FetchRequest>) -> ClientResult<Vec<DataKey>> {
        std::future::pending().await
    }

    async fn get(
        &self,
        _requests: Vec<GetRequest>,
    ) -> ClientResult<Vec<Option<ChunkPayload>>> {
        unimplemented!("not used by deadline tests")
    }

    async fn put(
        &self,
        _entries: Vec<(DataKey, ChunkPayload)>,
    ) -> ClientResult<Vec<PutInfo>> {
        unimplemented!("not used by deadline tests")
    }

    async fn unpin(
        &self,
        _keys: Vec<DataKey>,
        _on_missing: MissingDataPolicy,
    ) -> ClientResult<()> {
        unimplemented!("not used by deadline tests")
    }

    async fn delete(
        &self,
        _keys: Vec<DataKey>,
        _on_missing: MissingDataPolicy,
    ) -> ClientResult<()> {
        unimplemented!("not used by deadline tests")
    }

    async fn get_infos(
        &self,
        _keys: Vec<ChunkKey>,
    ) -> ClientResult<Vec<Vec<StorageInfo>>> {
        unimplemented!("not used by deadline tests")
    }
}

/// One mock per collaborator, wired into a [`ClientProvider`] once the test
/// finished installing expectations.
pub(crate) struct MockClients {
    pub storage: MockStorageClient,
    pub meta: MockMetaClient,
    pub worker_meta: MockWorkerMetaClient,
    pub task: MockTaskClient,
    pub slot_manager: MockSlotManagerClient,
    pub quota: MockQuotaClient,
    pub cluster: MockClusterClient,
}

impl Default for MockClients {
    fn default() -> Self {
        let mut task = MockTaskClient::new();
        task.expect_set_subtask_result().returning(|_| Ok(()));
        Self {
            storage: MockStorageClient::new(),
            meta: MockMetaClient::new(),
            worker_meta: MockWorkerMetaClient::new(),
            task,
            slot_manager: MockSlotManagerClient::new(),
            quota: MockQuotaClient::new(),
            cluster: MockClusterClient::new(),
        }
    }
}

impl MockClients {
    pub(crate) fn into_provider(
        self,
        subtask_runner: SharedSubtaskRunnerClient,
    ) -> Arc<FixedClientProvider> {
        Arc::new(FixedClientProvider {
            storage: Arc::new(self.storage),
            meta: Arc::new(self.meta),
            worker_meta: Arc::new(self.worker_meta),
            task: Arc::new(self.task),
            subtask_runner,
            slot_manager: Arc::new(self.slot_manager),
            quota: Arc::new(self.quota),
            cluster: Arc::new(self.cluster),
        })
    }
}

/// Provider handing out fixed client instances regardless of session or band.
pub(crate) struct FixedClientProvider {
    pub storage: SharedStorageClient,
    pub meta: SharedMetaClient,
    pub worker_meta: SharedWorkerMetaClient,
    pub task: SharedTaskClient,
    pub subtask_runner: SharedSubtaskRunnerClient,
    pub slot_manager: SharedSlotManagerClient,
    pub quota: SharedQuotaClient,
    pub cluster: SharedClusterClient,
}

impl ClientProvider for FixedClientProvider {
    fn storage(&self, _session_id: &SessionId, _band: &BandName) -> SharedStorageClient {
        self.storage.clone()
    }

    fn meta(&self, _session_id: &SessionId, _supervisor_address: &str) -> SharedMetaClient {
        self.meta.clone()
    }

    fn worker_meta(&self, _session_id: &SessionId) -> SharedWorkerMetaClient {
        self.worker_meta.clone()
    }

    fn task(&self, _session_id: &SessionId, _supervisor_address: &str) -> SharedTaskClient {
        self.task.clone()
    }

    fn subtask_runner(&self) -> SharedSubtaskRunnerClient {
        self.subtask_runner.clone()
    }

    fn slot_manager(&self, _band: &BandName) -> SharedSlotManagerClient {
        self.slot_manager.clone()
    }

    fn quota(&self, _band: &BandName) -> SharedQuotaClient {
        self.quota.clone()
    }

    fn cluster(&self) -> SharedClusterClient {
        self.cluster.clone()
    }
}
