use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::{Arc, Mutex};

use chrono::Utc;
#[cfg(test)]
use mockall::automock;
use rill_subtask_types::communication::{
    ChunkMetaUpdate,
    GetRequest,
    MissingDataPolicy,
    ObjectRef,
    SharedMetaClient,
    SharedStorageClient,
    SharedTaskClient,
    SharedWorkerMetaClient,
};
use rill_subtask_types::errors::{
    ClientError,
    ComputeError,
    ExecutionError,
    SubtaskExecutionError,
    SubtaskExecutionResult,
};
use rill_subtask_types::graph::ChunkGraph;
use rill_subtask_types::operand::{ChunkKey, OpKey, OperandKind};
use rill_subtask_types::store::{ChunkPayload, DataKey, DataStore, OperandContext, OpProgressTracker};
use rill_subtask_types::subtask::{Band, Subtask, SubtaskId, SubtaskResult, SubtaskStatus};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SubtaskProcessorConfig;
use crate::metrics::{LABEL_SESSION_ID, LABEL_SUBTASK_ID, SUBTASK_EXECUTION_TIME_SECS};
use crate::utils::{cancellable, error_chain};

/// The external chunk-graph optimizer seam. Invoked once per run to derive
/// the executed graph; result chunks map positionally onto the raw graph's.
#[cfg_attr(test, automock)]
pub trait ChunkGraphOptimizer: Send + Sync {
    fn optimize(&self, graph: &ChunkGraph) -> ChunkGraph;
}

/// Pass-through optimizer.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityOptimizer;

impl ChunkGraphOptimizer for IdentityOptimizer {
    fn optimize(&self, graph: &ChunkGraph) -> ChunkGraph {
        graph.clone()
    }
}

/// Sizes and object ids recorded while persisting outputs.
#[derive(Debug, Default)]
struct StoredData {
    keys: Vec<DataKey>,
    store_sizes: HashMap<DataKey, u64>,
    memory_sizes: HashMap<DataKey, u64>,
    object_ids: HashMap<DataKey, String>,
}

/// Runs one subtask inside an allocated slot: load inputs, execute the chunk
/// graph op by op off the coordinator thread, unpin inputs, store outputs,
/// publish meta, and report progress while doing so.
pub struct SubtaskProcessor {
    subtask: Arc<Subtask>,
    band: Band,
    config: SubtaskProcessorConfig,
    optimizer: Arc<dyn ChunkGraphOptimizer>,

    storage: SharedStorageClient,
    meta: SharedMetaClient,
    worker_meta: SharedWorkerMetaClient,
    task: SharedTaskClient,

    cancel_token: CancellationToken,
    result: Arc<Mutex<SubtaskResult>>,
    op_progress: OpProgressTracker,
    operand_ctx: OperandContext,
    datastore: DataStore,
    /// Number of chunks that actually compute, the denominator of progress.
    actual_chunk_count: usize,
    is_done: watch::Sender<bool>,
}

impl SubtaskProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        subtask: Arc<Subtask>,
        storage: SharedStorageClient,
        meta: SharedMetaClient,
        worker_meta: SharedWorkerMetaClient,
        task: SharedTaskClient,
        band: Band,
        supervisor_address: String,
        config: SubtaskProcessorConfig,
        optimizer: Arc<dyn ChunkGraphOptimizer>,
        cancel_token: CancellationToken,
    ) -> Self {
        let actual_chunk_count =
            subtask.chunk_graph.chunks().filter(|chunk| !chunk.op.is_data_source()).count();
        let mut result = SubtaskResult::for_subtask(&subtask);
        result.bands = vec![band.clone()];
        result.execution_start_time = Some(Utc::now());
        let op_progress = OpProgressTracker::new();
        let operand_ctx = OperandContext::new(
            subtask.session_id.clone(),
            subtask.subtask_id.clone(),
            band.clone(),
            supervisor_address,
            op_progress.clone(),
        );
        let (is_done, _) = watch::channel(false);
        Self {
            subtask,
            band,
            config,
            optimizer,
            storage,
            meta,
            worker_meta,
            task,
            cancel_token,
            result: Arc::new(Mutex::new(result)),
            op_progress,
            operand_ctx,
            datastore: DataStore::new(),
            actual_chunk_count,
            is_done,
        }
    }

    pub fn subtask_id(&self) -> &SubtaskId {
        &self.subtask.subtask_id
    }

    pub fn result(&self) -> SubtaskResult {
        self.lock_result().clone()
    }

    /// Shared handle to the live result, for hosts that outlive the run call.
    pub fn result_handle(&self) -> Arc<Mutex<SubtaskResult>> {
        self.result.clone()
    }

    pub fn progress_handle(&self) -> OpProgressTracker {
        self.op_progress.clone()
    }

    /// Resolves to `true` once the run reached a terminal status.
    pub fn subscribe_done(&self) -> watch::Receiver<bool> {
        self.is_done.subscribe()
    }

    pub fn set_op_progress(&self, op_key: &OpKey, progress: f64) {
        self.op_progress.update(op_key, progress);
    }

    fn lock_result(&self) -> std::sync::MutexGuard<'_, SubtaskResult> {
        self.result.lock().expect("subtask result lock poisoned")
    }

    pub async fn run(&mut self) -> SubtaskExecutionResult<SubtaskResult> {
        self.lock_result().status = SubtaskStatus::Running;

        let raw_result_keys: Vec<ChunkKey> =
            self.subtask.chunk_graph.result_chunks().map(|chunk| chunk.key.clone()).collect();
        let executed_graph = self.optimizer.optimize(&self.subtask.chunk_graph);
        let optimized_result_keys: Vec<ChunkKey> =
            executed_graph.result_chunks().map(|chunk| chunk.key.clone()).collect();
        assert_eq!(
            raw_result_keys.len(),
            optimized_result_keys.len(),
            "the optimizer must preserve result chunk arity"
        );
        let update_meta_keys: HashSet<ChunkKey> = match &self.subtask.update_meta_chunks {
            None => optimized_result_keys.iter().cloned().collect(),
            Some(raw_keys) => raw_result_keys
                .iter()
                .zip(optimized_result_keys.iter())
                .filter(|(raw, _)| raw_keys.contains(*raw))
                .map(|(_, optimized)| optimized.clone())
                .collect(),
        };

        let reporter = self.spawn_progress_reporter();
        let pipeline_result = self.run_pipeline(&executed_graph, &update_meta_keys).await;
        if let Err(err) = &pipeline_result {
            self.fill_result_with_error(err);
        }
        self.done();
        self.record_execution_time();

        reporter.abort();
        let _ = reporter.await;

        pipeline_result.map(|_| self.result())
    }

    async fn run_pipeline(
        &mut self,
        executed_graph: &ChunkGraph,
        update_meta_keys: &HashSet<ChunkKey>,
    ) -> SubtaskExecutionResult<()> {
        let input_keys = self.load_input_data(executed_graph).await?;
        let exec_result = self.execute_graph(executed_graph).await;
        // Inputs are unpinned exactly once, on success, failure and
        // cancellation alike.
        let unpin_result = self.unpin_data(&input_keys).await;
        exec_result?;
        unpin_result?;

        let stored = self.store_data(executed_graph).await?;
        self.store_meta(executed_graph, update_meta_keys, &stored).await?;
        Ok(())
    }

    /// Pulls every external input of the executed graph into the data store.
    /// Returns the requested keys; each of them is pinned and must be
    /// unpinned exactly once.
    async fn load_input_data(
        &mut self,
        executed_graph: &ChunkGraph,
    ) -> SubtaskExecutionResult<Vec<DataKey>> {
        let mut requests: Vec<GetRequest> = Vec::new();
        let mut seen: HashSet<DataKey> = HashSet::new();
        for chunk in executed_graph.chunks() {
            if self.subtask.pure_depend_keys.contains(&chunk.key) {
                continue;
            }
            match &chunk.op.kind {
                OperandKind::Fetch => {
                    let key = DataKey::Chunk(chunk.key.clone());
                    if seen.insert(key.clone()) {
                        requests.push(GetRequest { key, on_missing: MissingDataPolicy::Raise });
                    }
                }
                OperandKind::FetchShuffle { n_mappers } => {
                    for mapper in 0..*n_mappers {
                        let key = DataKey::Mapper(
                            chunk.key.clone(),
                            u32::try_from(mapper).expect("mapper count fits in u32"),
                        );
                        if seen.insert(key.clone()) {
                            requests
                                .push(GetRequest { key, on_missing: MissingDataPolicy::Ignore });
                        }
                    }
                }
                OperandKind::Compute(_) => {}
            }
        }
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<DataKey> = requests.iter().map(|request| request.key.clone()).collect();
        debug!(
            "Start getting input data, keys: {:?}, subtask id: {}",
            keys, self.subtask.subtask_id
        );
        let values =
            cancellable(&self.cancel_token, self.storage.get(requests.clone())).await?;
        for (request, value) in requests.into_iter().zip(values) {
            // Tolerated shuffle misses simply stay absent from the store.
            if let Some(value) = value {
                self.datastore.insert(request.key, value);
            }
        }
        debug!(
            "Finish getting input data, keys: {:?}, subtask id: {}",
            keys, self.subtask.subtask_id
        );
        Ok(keys)
    }

    fn init_ref_counts(executed_graph: &ChunkGraph) -> HashMap<ChunkKey, usize> {
        let mut ref_counts: HashMap<ChunkKey, usize> = HashMap::new();
        for result_chunk in executed_graph.result_chunks() {
            *ref_counts.entry(result_chunk.key.clone()).or_insert(0) += 1;
        }
        for index in executed_graph.indices() {
            let chunk = executed_graph.chunk(index);
            *ref_counts.entry(chunk.key.clone()).or_insert(0) +=
                executed_graph.count_successors(index);
        }
        ref_counts
    }

    async fn execute_graph(&mut self, executed_graph: &ChunkGraph) -> SubtaskExecutionResult<()> {
        let mut ref_counts = Self::init_ref_counts(executed_graph);
        let order = executed_graph.topological_order()?;

        for index in order {
            let chunk = executed_graph.chunk(index);
            if !self.datastore.contains_chunk(&chunk.key) {
                self.execute_operand(executed_graph, index).await?;
            }
            self.op_progress.update(&chunk.op.key, 1.0);

            for pred_index in executed_graph.predecessors(index) {
                let pred_key = &executed_graph.chunk(*pred_index).key;
                let count = ref_counts
                    .get_mut(pred_key)
                    .expect("predecessor chunk must have a ref count");
                *count -= 1;
                if *count == 0 {
                    for data_key in self.datastore.data_keys_for(pred_key) {
                        self.datastore.remove(&data_key);
                    }
                }
            }
        }
        Ok(())
    }

    async fn execute_operand(
        &mut self,
        executed_graph: &ChunkGraph,
        index: usize,
    ) -> SubtaskExecutionResult<()> {
        let chunk = executed_graph.chunk(index);
        let OperandKind::Compute(compute) = &chunk.op.kind else {
            // Fetch inputs were loaded up front; shuffle pieces live under
            // their mapper keys and are consumed directly by successors.
            return Ok(());
        };

        self.op_progress.begin(&chunk.op.key);
        debug!(
            "Start executing operand: {}, chunk: {}, subtask id: {}",
            chunk.op.key, chunk.key, self.subtask.subtask_id
        );

        let op = chunk.op.clone();
        let kernel = compute.kernel.clone();
        let ctx = self.operand_ctx.clone();
        let store = mem::take(&mut self.datastore);
        let mut handle = tokio::task::spawn_blocking(move || {
            let mut store = store;
            let result = kernel.execute(&mut store, &ctx, &op);
            (store, result)
        });

        let join = tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => {
                debug!(
                    "Received cancel for operand: {}, chunk: {}, subtask id: {}; waiting for the \
                     inflight computation",
                    chunk.op.key, chunk.key, self.subtask.subtask_id
                );
                // The computation is not interruptible mid-op; wait it out,
                // then stop scheduling further chunks.
                let _ = (&mut handle).await;
                self.lock_result().status = SubtaskStatus::Cancelled;
                return Err(SubtaskExecutionError::Cancelled);
            }
            join = &mut handle => join,
        };

        let (store, exec_result) = join.map_err(|err| {
            SubtaskExecutionError::Execution(ExecutionError {
                op_key: chunk.op.key.clone(),
                nested: ComputeError::new(format!("operand execution panicked: {err}")),
            })
        })?;
        self.datastore = store;
        exec_result.map_err(|nested| {
            SubtaskExecutionError::Execution(ExecutionError { op_key: chunk.op.key.clone(), nested })
        })?;

        debug!(
            "Finish executing operand: {}, chunk: {}, subtask id: {}",
            chunk.op.key, chunk.key, self.subtask.subtask_id
        );
        Ok(())
    }

    /// Unpins every loaded input. Mapper keys tolerate misses, since some
    /// shuffle pieces were never stored.
    async fn unpin_data(&self, input_keys: &[DataKey]) -> SubtaskExecutionResult<()> {
        let (mapper_keys, plain_keys): (Vec<DataKey>, Vec<DataKey>) =
            input_keys.iter().cloned().partition(DataKey::is_mapper);
        if !plain_keys.is_empty() {
            self.storage.unpin(plain_keys, MissingDataPolicy::Raise).await?;
        }
        if !mapper_keys.is_empty() {
            self.storage.unpin(mapper_keys, MissingDataPolicy::Ignore).await?;
        }
        Ok(())
    }

    async fn store_data(
        &mut self,
        executed_graph: &ChunkGraph,
    ) -> SubtaskExecutionResult<StoredData> {
        let mut entries: Vec<(DataKey, ChunkPayload)> = Vec::new();
        let mut seen: HashSet<DataKey> = HashSet::new();
        for chunk in executed_graph.result_chunks() {
            if chunk.op.is_data_source() {
                continue;
            }
            for data_key in self.datastore.data_keys_for(&chunk.key) {
                if !seen.insert(data_key.clone()) {
                    continue;
                }
                if let Some(value) = self.datastore.get(&data_key) {
                    entries.push((data_key, value.clone()));
                }
            }
        }

        let mut stored = StoredData::default();
        if !entries.is_empty() {
            stored.keys = entries.iter().map(|(key, _)| key.clone()).collect();
            debug!(
                "Start putting data keys: {:?}, subtask id: {}",
                stored.keys, self.subtask.subtask_id
            );
            let storage = self.storage.clone();
            let mut put_task = tokio::spawn(async move { storage.put(entries).await });
            let put_infos = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => {
                    debug!(
                        "Cancelled putting data keys: {:?}, subtask id: {}",
                        stored.keys, self.subtask.subtask_id
                    );
                    put_task.abort();
                    self.lock_result().status = SubtaskStatus::Cancelled;
                    return Err(SubtaskExecutionError::Cancelled);
                }
                join = &mut put_task => join
                    .map_err(|err| ClientError::Peer(format!("storage put task failed: {err}")))
                    .map_err(SubtaskExecutionError::from)
                    .and_then(|result| result.map_err(SubtaskExecutionError::from))?,
            };
            for (key, info) in stored.keys.iter().zip(put_infos) {
                stored.store_sizes.insert(key.clone(), info.store_size);
                stored.memory_sizes.insert(key.clone(), info.memory_size);
                stored.object_ids.insert(key.clone(), info.object_id);
            }
            debug!(
                "Finish putting data keys: {:?}, subtask id: {}",
                stored.keys, self.subtask.subtask_id
            );
        }

        self.datastore = DataStore::new();
        Ok(stored)
    }

    async fn store_meta(
        &self,
        executed_graph: &ChunkGraph,
        update_meta_keys: &HashSet<ChunkKey>,
        stored: &StoredData,
    ) -> SubtaskExecutionResult<()> {
        let mut supervisor_updates: Vec<ChunkMetaUpdate> = Vec::new();
        let mut worker_updates: Vec<ChunkMetaUpdate> = Vec::new();
        let mut result_data_size: u64 = 0;

        for chunk in executed_graph.result_chunks() {
            let plain_key = DataKey::Chunk(chunk.key.clone());
            let (store_size, memory_size, object_ref) =
                if let Some(store_size) = stored.store_sizes.get(&plain_key) {
                    (
                        *store_size,
                        stored.memory_sizes[&plain_key],
                        ObjectRef::Single(stored.object_ids[&plain_key].clone()),
                    )
                } else {
                    // A shuffle mapper: aggregate over its mapper keys.
                    let mapper_keys: Vec<&DataKey> = stored
                        .keys
                        .iter()
                        .filter(|key| key.is_mapper() && key.chunk_key() == &chunk.key)
                        .collect();
                    let store_size = mapper_keys.iter().map(|key| stored.store_sizes[*key]).sum();
                    let memory_size =
                        mapper_keys.iter().map(|key| stored.memory_sizes[*key]).sum();
                    let refs =
                        mapper_keys.iter().map(|key| stored.object_ids[*key].clone()).collect();
                    (store_size, memory_size, ObjectRef::Many(refs))
                };
            result_data_size += memory_size;

            // Full meta (type payload, no object ref) goes to worker meta for
            // the chunks that asked for it; basic meta always goes to the
            // supervisor.
            if update_meta_keys.contains(&chunk.key) {
                worker_updates.push(ChunkMetaUpdate {
                    chunk_key: chunk.key.clone(),
                    memory_size,
                    store_size,
                    bands: vec![self.band.clone()],
                    object_ref: None,
                    type_info: chunk.type_info.clone(),
                });
            }
            supervisor_updates.push(ChunkMetaUpdate {
                chunk_key: chunk.key.clone(),
                memory_size,
                store_size,
                bands: vec![self.band.clone()],
                object_ref: Some(object_ref),
                type_info: None,
            });
        }

        if !supervisor_updates.is_empty() {
            let meta_keys: Vec<ChunkKey> =
                supervisor_updates.iter().map(|update| update.chunk_key.clone()).collect();
            debug!(
                "Start storing chunk metas for data keys: {:?}, subtask id: {}",
                meta_keys, self.subtask.subtask_id
            );
            let meta = self.meta.clone();
            let worker_meta = self.worker_meta.clone();
            let publish = tokio::spawn(async move {
                let worker_fut = async {
                    if worker_updates.is_empty() {
                        Ok(())
                    } else {
                        worker_meta.set_chunk_meta(worker_updates).await
                    }
                };
                let supervisor_fut = meta.set_chunk_meta(supervisor_updates);
                tokio::try_join!(worker_fut, supervisor_fut).map(|_| ())
            });
            // Meta publication must not be torn by cancellation: wait for the
            // write to finish, then observe the cancel.
            publish
                .await
                .map_err(|err| ClientError::Peer(format!("meta publish task failed: {err}")))
                .map_err(SubtaskExecutionError::from)
                .and_then(|result| result.map_err(SubtaskExecutionError::from))?;
            debug!(
                "Finish storing chunk metas for data keys: {:?}, subtask id: {}",
                meta_keys, self.subtask.subtask_id
            );
            if self.cancel_token.is_cancelled() {
                self.lock_result().status = SubtaskStatus::Cancelled;
                return Err(SubtaskExecutionError::Cancelled);
            }
        }

        self.lock_result().data_size = Some(result_data_size);
        Ok(())
    }

    fn fill_result_with_error(&self, err: &SubtaskExecutionError) {
        let mut result = self.lock_result();
        match err {
            SubtaskExecutionError::Cancelled => {
                info!(
                    "Cancelled subtask {} on band {}",
                    self.subtask.subtask_id, self.band
                );
                result.status = SubtaskStatus::Cancelled;
                result.error = Some(err.to_string());
                result.traceback = None;
            }
            SubtaskExecutionError::Execution(exec) => {
                warn!(
                    "Failed to run subtask {} on band {}: {err}",
                    self.subtask.subtask_id, self.band
                );
                result.status = SubtaskStatus::Errored;
                result.error = Some(exec.nested.message.clone());
                result.traceback =
                    exec.nested.traceback.clone().or_else(|| Some(error_chain(err)));
            }
            other => {
                warn!(
                    "Failed to run subtask {} on band {}: {other}",
                    self.subtask.subtask_id, self.band
                );
                result.status = SubtaskStatus::Errored;
                result.error = Some(other.to_string());
                result.traceback = Some(error_chain(other));
            }
        }
        result.progress = 1.0;
    }

    fn done(&self) {
        {
            let mut result = self.lock_result();
            if result.status == SubtaskStatus::Running {
                result.status = SubtaskStatus::Succeeded;
                result.execution_end_time = Some(Utc::now());
            }
            result.progress = 1.0;
        }
        // send_replace stores the value even with no live subscribers.
        self.is_done.send_replace(true);
    }

    fn record_execution_time(&self) {
        let result = self.result();
        if result.status != SubtaskStatus::Succeeded {
            return;
        }
        let (Some(start), Some(end)) = (result.execution_start_time, result.execution_end_time)
        else {
            return;
        };
        let cost_secs = (end - start).to_std().map(|d| d.as_secs_f64()).unwrap_or(0.0);
        info!(
            "Time consumed to execute subtask {} of session {}: {cost_secs}s",
            self.subtask.subtask_id, self.subtask.session_id
        );
        SUBTASK_EXECUTION_TIME_SECS.set(
            cost_secs,
            &[
                (LABEL_SESSION_ID, self.subtask.session_id.to_string()),
                (LABEL_SUBTASK_ID, self.subtask.subtask_id.to_string()),
            ],
        );
    }

    fn spawn_progress_reporter(&self) -> JoinHandle<()> {
        let result = self.result.clone();
        let op_progress = self.op_progress.clone();
        let task = self.task.clone();
        let actual_chunk_count = self.actual_chunk_count;
        let interval = self.config.progress_report_interval();
        let epsilon = self.config.progress_report_epsilon;
        tokio::spawn(async move {
            report_progress_periodically(
                result,
                op_progress,
                task,
                actual_chunk_count,
                interval,
                epsilon,
            )
            .await;
        })
    }
}

/// Samples aggregate op progress and posts the current result to the
/// supervisor whenever it moved by at least `epsilon`. Terminates once the
/// result goes terminal; the processor additionally aborts it on shutdown.
async fn report_progress_periodically(
    result: Arc<Mutex<SubtaskResult>>,
    op_progress: OpProgressTracker,
    task: SharedTaskClient,
    actual_chunk_count: usize,
    interval: std::time::Duration,
    epsilon: f64,
) {
    let mut last_progress = {
        let guard = result.lock().expect("subtask result lock poisoned");
        guard.progress
    };
    loop {
        let sampled = {
            let mut guard = result.lock().expect("subtask result lock poisoned");
            if guard.status.is_terminal() {
                break;
            }
            let denominator = actual_chunk_count.max(1);
            let progress = (op_progress.sum() / denominator as f64).min(1.0);
            // Progress never regresses.
            if progress > guard.progress {
                guard.progress = progress;
            }
            Some((guard.progress, guard.clone()))
        };
        if let Some((progress, snapshot)) = sampled {
            if (progress - last_progress).abs() >= epsilon {
                if let Err(err) = task.set_subtask_result(snapshot).await {
                    warn!("Failed to report subtask progress: {err}");
                }
            }
            tokio::time::sleep(interval).await;
            last_progress = progress;
        }
    }
}
