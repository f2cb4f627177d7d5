use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use rill_subtask_types::communication::{
    ChunkMetaField,
    FetchRequest,
    MissingDataPolicy,
    SharedClientProvider,
    SharedQuotaClient,
    SharedSlotManagerClient,
    SharedStorageClient,
    StorageLevel,
};
use rill_subtask_types::errors::{SubtaskExecutionError, SubtaskExecutionResult};
use rill_subtask_types::operand::{ChunkKey, OpKey, OperandKind};
use rill_subtask_types::store::DataKey;
use rill_subtask_types::subtask::{
    BandName,
    ResourceKey,
    SlotId,
    Subtask,
    SubtaskId,
    SubtaskResult,
    SubtaskStatus,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::config::SubtaskExecutorConfig;
use crate::metrics::{
    register_metrics,
    FINISHED_SUBTASK_COUNT,
    LABEL_BAND,
    SUBMITTED_SUBTASK_COUNT,
};
use crate::size_estimator::{estimate_sizes, InputSizes};
use crate::utils::{cancellable, check_cancelled, error_chain};

/// Band every non-GPU fetch is prefetched to.
const DEFAULT_NUMA_BAND: &str = "numa-0";

/// Default bound on graceful in-slot cancellation before the slot is killed.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Book-keeping of one accepted subtask, shared between its coordinating task
/// and cancel callers.
pub(crate) struct SubtaskExecutionInfo {
    pub(crate) band_name: BandName,
    pub(crate) supervisor_address: String,
    pub(crate) max_retries: u32,
    pub(crate) num_retries: AtomicU32,
    pub(crate) cancel_token: CancellationToken,
    pub(crate) kill_timeout: Mutex<Option<Duration>>,
    pub(crate) slot_id: Mutex<Option<SlotId>>,
    pub(crate) result: Mutex<SubtaskResult>,
    finished: watch::Sender<bool>,
}

impl SubtaskExecutionInfo {
    fn new(
        band_name: BandName,
        supervisor_address: String,
        max_retries: u32,
        result: SubtaskResult,
    ) -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            band_name,
            supervisor_address,
            max_retries,
            num_retries: AtomicU32::new(0),
            cancel_token: CancellationToken::new(),
            kill_timeout: Mutex::new(None),
            slot_id: Mutex::new(None),
            result: Mutex::new(result),
            finished,
        }
    }

    fn lock_result(&self) -> MutexGuard<'_, SubtaskResult> {
        self.result.lock().expect("subtask result lock poisoned")
    }

    fn num_retries(&self) -> u32 {
        self.num_retries.load(Ordering::Relaxed)
    }

    fn mark_finished(&self) {
        // send_replace stores the value even with no live subscribers, so a
        // later waiter still observes completion.
        self.finished.send_replace(true);
    }

    async fn wait_finished(&self) {
        let mut finished = self.finished.subscribe();
        let _ = finished.wait_for(|done| *done).await;
    }
}

#[derive(Clone)]
struct BandClients {
    slot_manager: SharedSlotManagerClient,
    quota: SharedQuotaClient,
}

/// Reruns `target` on transient failures within the subtask's retry budget.
///
/// Cancellation is never caught. When retries are exhausted the last error is
/// wrapped as `ExceedMaxRerun`; a non-transient error under an enabled retry
/// budget is wrapped as `Unhandled`; with a zero budget errors propagate
/// verbatim.
async fn retry_run<T, F, Fut>(
    subtask: &Subtask,
    info: &SubtaskExecutionInfo,
    mut target: F,
) -> SubtaskExecutionResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SubtaskExecutionResult<T>>,
{
    loop {
        match target().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) if err.is_transient() => {
                let num_retries = info.num_retries();
                if num_retries < info.max_retries {
                    error!(
                        "Rerun[{}/{}] subtask {} due to {err}",
                        num_retries, info.max_retries, subtask.subtask_id
                    );
                    info.num_retries.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                if info.max_retries > 0 {
                    error!(
                        "Exceeded max rerun[{}/{}] of subtask {}: {err}",
                        num_retries, info.max_retries, subtask.subtask_id
                    );
                    return Err(SubtaskExecutionError::ExceedMaxRerun {
                        subtask_id: subtask.subtask_id.clone(),
                        num_retries,
                        max_retries: info.max_retries,
                        source: Box::new(err),
                    });
                }
                return Err(err);
            }
            Err(err) => {
                if info.max_retries > 0 {
                    error!(
                        "Failed to rerun subtask {}, num_retries: {}, max_retries: {}, due to an \
                         unhandled error: {err}",
                        subtask.subtask_id,
                        info.num_retries(),
                        info.max_retries
                    );
                    return Err(SubtaskExecutionError::Unhandled {
                        subtask_id: subtask.subtask_id.clone(),
                        num_retries: info.num_retries(),
                        max_retries: info.max_retries,
                        source: Box::new(err),
                    });
                }
                return Err(err);
            }
        }
    }
}

/// Per-band subtask admission and lifecycle: data preparation, memory
/// estimation, quota and slot acquisition, the in-slot run, retry, cancel,
/// and cleanup.
pub struct SubtaskExecutor {
    config: SubtaskExecutorConfig,
    clients: SharedClientProvider,
    subtask_info: Mutex<HashMap<SubtaskId, Arc<SubtaskExecutionInfo>>>,
    /// Lazily resolved slot/quota handles per band, dropped after an
    /// actor-pool recovery so stale handles are not reused.
    band_clients: DashMap<BandName, BandClients>,
}

impl SubtaskExecutor {
    pub fn new(config: SubtaskExecutorConfig, clients: SharedClientProvider) -> Self {
        register_metrics();
        Self {
            config,
            clients,
            subtask_info: Mutex::new(HashMap::new()),
            band_clients: DashMap::new(),
        }
    }

    fn lock_info_table(&self) -> MutexGuard<'_, HashMap<SubtaskId, Arc<SubtaskExecutionInfo>>> {
        self.subtask_info.lock().expect("subtask info table lock poisoned")
    }

    fn band_clients(&self, band_name: &BandName) -> BandClients {
        self.band_clients
            .entry(band_name.clone())
            .or_insert_with(|| BandClients {
                slot_manager: self.clients.slot_manager(band_name),
                quota: self.clients.quota(band_name),
            })
            .clone()
    }

    fn invalidate_band_clients(&self, band_name: &BandName) {
        self.band_clients.remove(band_name);
    }

    /// Whether a subtask is currently tracked. Exposed for tests.
    pub fn is_tracked(&self, subtask_id: &SubtaskId) -> bool {
        self.lock_info_table().contains_key(subtask_id)
    }

    /// Accepts and executes a subtask on the band, returning its terminal
    /// result. Re-submission of a tracked subtask id is rejected.
    #[instrument(
        skip_all,
        fields(subtask_id = %subtask.subtask_id, band = %band_name),
        err
    )]
    pub async fn run_subtask(
        self: &Arc<Self>,
        subtask: Subtask,
        band_name: BandName,
        supervisor_address: String,
    ) -> SubtaskExecutionResult<SubtaskResult> {
        let subtask = Arc::new(subtask);
        let subtask_id = subtask.subtask_id.clone();
        let max_retries = subtask
            .extra_config
            .as_ref()
            .and_then(|extra| extra.subtask_max_retries)
            .unwrap_or(self.config.subtask_max_retries);
        let info = Arc::new(SubtaskExecutionInfo::new(
            band_name.clone(),
            supervisor_address,
            max_retries,
            SubtaskResult::for_subtask(&subtask),
        ));
        {
            let mut table = self.lock_info_table();
            if table.contains_key(&subtask_id) {
                return Err(SubtaskExecutionError::AlreadyRunning(subtask_id));
            }
            table.insert(subtask_id.clone(), info.clone());
        }
        debug!("Start to schedule subtask {subtask_id} on band {band_name}");
        SUBMITTED_SUBTASK_COUNT.increment(1, &[(LABEL_BAND, band_name.to_string())]);

        let this = Arc::clone(self);
        let run_handle: JoinHandle<SubtaskResult> = tokio::spawn(
            {
                let subtask = subtask.clone();
                let info = info.clone();
                async move { this.internal_run_subtask(subtask, info).await }
            }
            .in_current_span(),
        );

        let result = match run_handle.await {
            Ok(result) => result,
            Err(join_err) => {
                error!("Coordinating task of subtask {subtask_id} failed: {join_err}");
                {
                    let mut result = info.lock_result();
                    result.status = SubtaskStatus::Errored;
                    result.progress = 1.0;
                    result.error = Some(format!("coordinating task failed: {join_err}"));
                }
                info.mark_finished();
                info.lock_result().clone()
            }
        };
        self.lock_info_table().remove(&subtask_id);
        FINISHED_SUBTASK_COUNT.increment(1, &[(LABEL_BAND, band_name.to_string())]);
        debug!("Subtask {subtask_id} finished with status {:?}", result.status);
        Ok(result)
    }

    /// Cancels a tracked subtask and waits for it to reach a terminal status.
    /// A miss and repeated cancels are no-ops.
    #[instrument(skip(self))]
    pub async fn cancel_subtask(&self, subtask_id: &SubtaskId, kill_timeout: Duration) {
        let Some(info) = self.lock_info_table().get(subtask_id).cloned() else {
            info!("Subtask {subtask_id} does not exist, skip cancel");
            return;
        };
        let kill_timeout = self.config.enable_kill_slot.then_some(kill_timeout);
        info!(
            "Start to cancel subtask {subtask_id} in slot {:?}, kill_timeout is {:?}",
            *info.slot_id.lock().expect("slot id lock poisoned"),
            kill_timeout
        );
        if !info.cancel_token.is_cancelled() {
            *info.kill_timeout.lock().expect("kill timeout lock poisoned") = kill_timeout;
            info.cancel_token.cancel();
        }
        info.wait_finished().await;
        self.lock_info_table().remove(subtask_id);
    }

    async fn internal_run_subtask(
        &self,
        subtask: Arc<Subtask>,
        info: Arc<SubtaskExecutionInfo>,
    ) -> SubtaskResult {
        let token = info.cancel_token.clone();
        let outcome: SubtaskExecutionResult<()> = async {
            debug!("Preparing data for subtask {}", subtask.subtask_id);
            let storage = self.clients.storage(&subtask.session_id, &info.band_name);
            let prepare = retry_run(&subtask, &info, || {
                prepare_input_data(storage.clone(), subtask.clone(), info.band_name.clone())
            });
            let remote_mapper_keys = match tokio::time::timeout(
                self.config.data_prepare_timeout(),
                cancellable(&token, prepare),
            )
            .await
            {
                Ok(prepared) => prepared?,
                Err(_elapsed) => {
                    return Err(SubtaskExecutionError::DataPrepareTimeout {
                        timeout_secs: self.config.data_prepare_timeout_secs,
                    });
                }
            };

            let input_sizes =
                cancellable(&token, self.collect_input_sizes(&subtask, &info)).await?;
            let estimate_task = tokio::task::spawn_blocking({
                let subtask = subtask.clone();
                move || estimate_sizes(&subtask, &input_sizes)
            });
            let (_store_size, calc_size) = cancellable(&token, async {
                estimate_task
                    .await
                    .expect("size estimation task panicked")
                    .map_err(SubtaskExecutionError::from)
            })
            .await?;
            check_cancelled(&token)?;

            let resource_key = ResourceKey {
                session_id: subtask.session_id.clone(),
                subtask_id: subtask.subtask_id.clone(),
            };
            let quota_request = HashMap::from([(resource_key, calc_size)]);
            debug!("Start actual running of subtask {}", subtask.subtask_id);
            let result = self.retry_run_subtask(&subtask, &info, quota_request).await?;
            *info.lock_result() = result;

            if !remote_mapper_keys.is_empty() {
                // Remote shuffle pieces are not tracked by lifecycle; clean
                // them up without holding the subtask open.
                tokio::spawn(
                    remove_mapper_data(storage.clone(), remote_mapper_keys).in_current_span(),
                );
            }
            Ok(())
        }
        .await;

        if let Err(err) = outcome {
            self.fill_result_with_error(&subtask, &info, &err);
        }

        // New slot usages must reach the supervisor promptly, whatever the
        // outcome was.
        let slot_manager = self.band_clients(&info.band_name).slot_manager;
        if let Err(err) = slot_manager.upload_slot_usages(false).await {
            self.fill_result_with_error(&subtask, &info, &err.into());
        }

        self.lock_info_table().remove(&subtask.subtask_id);
        let result = info.lock_result().clone();
        info.mark_finished();
        result
    }

    async fn retry_run_subtask(
        &self,
        subtask: &Arc<Subtask>,
        info: &Arc<SubtaskExecutionInfo>,
        quota_request: HashMap<ResourceKey, u64>,
    ) -> SubtaskExecutionResult<SubtaskResult> {
        let band = self.band_clients(&info.band_name);
        if subtask.retryable {
            retry_run(subtask, info, || {
                self.run_subtask_once(subtask, info, &band, quota_request.clone())
            })
            .await
        } else {
            match self.run_subtask_once(subtask, info, &band, quota_request.clone()).await {
                Ok(result) => Ok(result),
                Err(err) if err.is_cancelled() => Err(err),
                Err(err) => {
                    let mut unretryable_ops: Vec<OpKey> = Vec::new();
                    for chunk in subtask.chunk_graph.chunks() {
                        if !chunk.op.retryable() && !unretryable_ops.contains(&chunk.op.key) {
                            unretryable_ops.push(chunk.op.key.clone());
                        }
                    }
                    error!(
                        "Run subtask failed due to {err}, the subtask {} is not retryable, it \
                         contains unretryable ops: {unretryable_ops:?}",
                        subtask.subtask_id
                    );
                    Err(SubtaskExecutionError::Unretryable {
                        subtask_id: subtask.subtask_id.clone(),
                        unretryable_ops,
                        source: Box::new(err),
                    })
                }
            }
        }
    }

    /// One attempt: quota, then slot, then the shielded in-slot run; releases
    /// in reverse order on every exit path.
    async fn run_subtask_once(
        &self,
        subtask: &Arc<Subtask>,
        info: &Arc<SubtaskExecutionInfo>,
        band: &BandClients,
        quota_request: HashMap<ResourceKey, u64>,
    ) -> SubtaskExecutionResult<SubtaskResult> {
        let token = info.cancel_token.clone();
        let resource_key = ResourceKey {
            session_id: subtask.session_id.clone(),
            subtask_id: subtask.subtask_id.clone(),
        };
        let mut slot_id: Option<SlotId> = None;
        let mut run_started = false;

        let attempt: SubtaskExecutionResult<SubtaskResult> = async {
            cancellable(&token, band.quota.request_batch_quota(quota_request)).await?;
            check_cancelled(&token)?;

            let acquired =
                cancellable(&token, band.slot_manager.acquire_free_slot(resource_key.clone()))
                    .await?;
            slot_id = Some(acquired);
            *info.slot_id.lock().expect("slot id lock poisoned") = Some(acquired);
            check_cancelled(&token)?;

            info.lock_result().status = SubtaskStatus::Running;
            let runner = self.clients.subtask_runner();
            let mut run_task = tokio::spawn(
                {
                    let band_name = info.band_name.clone();
                    let subtask = subtask.clone();
                    async move { runner.run_subtask_in_slot(band_name, acquired, subtask).await }
                }
                .in_current_span(),
            );
            run_started = true;

            // The inner run is shielded: cancellation is observed here and
            // drives the kill path instead of aborting the call.
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(SubtaskExecutionError::Cancelled),
                join = &mut run_task => match join {
                    Ok(result) => result,
                    Err(join_err) => Err(rill_subtask_types::errors::ClientError::Peer(
                        format!("in-slot runner task failed: {join_err}"),
                    )
                    .into()),
                },
            }
        }
        .await;

        let attempt = match attempt {
            Err(SubtaskExecutionError::Cancelled) => {
                if run_started {
                    self.cancel_run_in_slot(subtask, info, band, slot_id).await;
                }
                Err(SubtaskExecutionError::Cancelled)
            }
            Err(SubtaskExecutionError::Client(client_err)) => {
                // Likely a sub-process death (e.g. OOM inside the slot); wait
                // for its pool to come back before handing the error upward.
                if let Some(slot) = slot_id {
                    self.wait_slot_pool_recovered(&info.band_name, band, slot).await;
                }
                Err(SubtaskExecutionError::Client(client_err))
            }
            other => other,
        };

        // Release in reverse acquisition order: slot first, then quota.
        let release_slot = match slot_id {
            Some(slot) => Some(slot),
            None => band
                .slot_manager
                .get_subtask_slot(resource_key.clone())
                .await
                .unwrap_or_default(),
        };
        debug!("Subtask {} running ended, slot_id={:?}", subtask.subtask_id, release_slot);
        if let Some(slot) = release_slot {
            match band.slot_manager.release_free_slot(slot, resource_key.clone()).await {
                Ok(()) => {
                    debug!("Released slot {slot} for subtask {}", subtask.subtask_id);
                }
                Err(err) => {
                    error!("Failed to release slot {slot} of subtask {}: {err}", subtask.subtask_id);
                }
            }
        }
        if let Err(err) = band.quota.release_quotas(vec![resource_key]).await {
            error!("Failed to release quota of subtask {}: {err}", subtask.subtask_id);
        }

        attempt
    }

    /// Graceful in-slot cancel bounded by the kill timeout, escalating to a
    /// forced slot kill and waiting for the sub-pool to recover.
    async fn cancel_run_in_slot(
        &self,
        subtask: &Subtask,
        info: &SubtaskExecutionInfo,
        band: &BandClients,
        slot_id: Option<SlotId>,
    ) {
        let Some(slot) = slot_id else {
            return;
        };
        info!(
            "Start to cancel subtask {} in slot {slot} on band {}",
            subtask.subtask_id, info.band_name
        );
        let kill_timeout = *info.kill_timeout.lock().expect("kill timeout lock poisoned");
        let runner = self.clients.subtask_runner();
        // The cancel request itself keeps running past the deadline; only our
        // wait is bounded.
        let cancel_task = tokio::spawn({
            let band_name = info.band_name.clone();
            async move { runner.cancel_subtask_in_slot(band_name, slot).await }
        });
        let outcome = match kill_timeout {
            Some(deadline) => tokio::time::timeout(deadline, cancel_task).await,
            None => Ok(cancel_task.await),
        };
        match outcome {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => {
                error!(
                    "Unexpected error raised when cancelling subtask {} in slot {slot}: {err}",
                    subtask.subtask_id
                );
            }
            Ok(Err(join_err)) => {
                error!(
                    "Cancel task of subtask {} in slot {slot} failed: {join_err}",
                    subtask.subtask_id
                );
            }
            Err(_elapsed) => {
                info!(
                    "Wait for subtask to cancel timed out ({kill_timeout:?}). Start killing slot \
                     {slot}"
                );
                if let Err(err) = band.slot_manager.kill_slot(slot).await {
                    error!("Failed to kill slot {slot}: {err}");
                    return;
                }
                self.wait_slot_pool_recovered(&info.band_name, band, slot).await;
            }
        }
    }

    async fn wait_slot_pool_recovered(
        &self,
        band_name: &BandName,
        band: &BandClients,
        slot: SlotId,
    ) {
        let sub_pool_address = match band.slot_manager.get_slot_address(slot).await {
            Ok(address) => address,
            Err(err) => {
                error!("Failed to resolve address of slot {slot}: {err}");
                return;
            }
        };
        if let Err(err) = self.clients.cluster().wait_actor_pool_recovered(sub_pool_address).await {
            error!("Failed to wait for slot {slot} pool recovery: {err}");
            return;
        }
        // Handles resolved before the recovery may be stale.
        self.invalidate_band_clients(band_name);
    }

    /// Sizes of all independent fetch inputs: `(store_size, memory_cost)`,
    /// where shared-memory residency discounts the serialized part.
    async fn collect_input_sizes(
        &self,
        subtask: &Subtask,
        info: &SubtaskExecutionInfo,
    ) -> SubtaskExecutionResult<InputSizes> {
        let mut fetch_keys: Vec<ChunkKey> = Vec::new();
        for chunk in subtask.chunk_graph.iter_indep() {
            if chunk.op.is_fetch()
                && !subtask.pure_depend_keys.contains(&chunk.key)
                && !fetch_keys.contains(&chunk.key)
            {
                fetch_keys.push(chunk.key.clone());
            }
        }
        let mut sizes = InputSizes::new();
        if fetch_keys.is_empty() {
            return Ok(sizes);
        }

        let storage = self.clients.storage(&subtask.session_id, &info.band_name);
        let meta = self.clients.meta(&subtask.session_id, &info.supervisor_address);
        let fetch_metas = meta
            .get_chunk_meta(
                fetch_keys.clone(),
                vec![ChunkMetaField::MemorySize, ChunkMetaField::StoreSize],
            )
            .await?;
        let data_infos = storage.get_infos(fetch_keys.clone()).await?;

        for ((key, chunk_meta), infos) in
            fetch_keys.into_iter().zip(fetch_metas).zip(data_infos)
        {
            let level = infos
                .iter()
                .fold(StorageLevel::default(), |level, replica| level | replica.level);
            let mem_cost = if level.intersects(StorageLevel::MEMORY) {
                chunk_meta.memory_size.saturating_sub(chunk_meta.store_size)
            } else {
                chunk_meta.memory_size
            };
            sizes.insert(key, (chunk_meta.store_size, mem_cost));
        }
        Ok(sizes)
    }

    /// Routes a failed run into its result record: cancellation keeps its
    /// status, execution failures surface the nested kernel error.
    fn fill_result_with_error(
        &self,
        subtask: &Subtask,
        info: &SubtaskExecutionInfo,
        err: &SubtaskExecutionError,
    ) {
        let mut result = info.lock_result();
        match err {
            SubtaskExecutionError::Cancelled => {
                info!(
                    "Cancel run subtask {} on band {}",
                    subtask.subtask_id, info.band_name
                );
                result.status = SubtaskStatus::Cancelled;
                result.error = Some(err.to_string());
                result.traceback = None;
            }
            SubtaskExecutionError::Execution(exec) => {
                error!(
                    "Failed to run subtask {} on band {}: {err}",
                    subtask.subtask_id, info.band_name
                );
                result.status = SubtaskStatus::Errored;
                result.error = Some(exec.nested.message.clone());
                result.traceback =
                    exec.nested.traceback.clone().or_else(|| Some(error_chain(err)));
            }
            other => {
                error!(
                    "Failed to run subtask {} on band {}: {other}",
                    subtask.subtask_id, info.band_name
                );
                result.status = SubtaskStatus::Errored;
                result.error = Some(other.to_string());
                result.traceback = Some(error_chain(other));
            }
        }
        result.progress = 1.0;
    }
}

/// Prefetches every external input of the subtask into the band's storage.
/// Non-GPU fetches land on the default NUMA band; shuffle pieces tolerate
/// misses. Returns the remote mapper keys that were actually pulled, which
/// the caller must delete after a successful run.
async fn prepare_input_data(
    storage: SharedStorageClient,
    subtask: Arc<Subtask>,
    band_name: BandName,
) -> SubtaskExecutionResult<Vec<DataKey>> {
    let mut queries: Vec<FetchRequest> = Vec::new();
    let mut shuffle_queries: Vec<FetchRequest> = Vec::new();
    for chunk in subtask.chunk_graph.chunks() {
        if subtask.pure_depend_keys.contains(&chunk.key) {
            continue;
        }
        let to_fetch_band =
            if chunk.op.gpu { band_name.clone() } else { BandName::from(DEFAULT_NUMA_BAND) };
        match &chunk.op.kind {
            OperandKind::Fetch => {
                queries.push(FetchRequest {
                    key: DataKey::Chunk(chunk.key.clone()),
                    band: to_fetch_band,
                    on_missing: MissingDataPolicy::Raise,
                });
            }
            OperandKind::FetchShuffle { n_mappers } => {
                for mapper in 0..*n_mappers {
                    shuffle_queries.push(FetchRequest {
                        key: DataKey::Mapper(
                            chunk.key.clone(),
                            u32::try_from(mapper).expect("mapper count fits in u32"),
                        ),
                        band: to_fetch_band.clone(),
                        on_missing: MissingDataPolicy::Ignore,
                    });
                }
            }
            OperandKind::Compute(_) => {}
        }
    }
    if !queries.is_empty() {
        storage.fetch(queries).await?;
    }
    if !shuffle_queries.is_empty() {
        // Remote shuffle data is not recorded in meta and thus not tracked by
        // lifecycle; the fetched remote mapper keys come back for later
        // removal.
        return Ok(storage.fetch(shuffle_queries).await?);
    }
    Ok(Vec::new())
}

async fn remove_mapper_data(storage: SharedStorageClient, remote_mapper_keys: Vec<DataKey>) {
    debug!("Delete mapper data {remote_mapper_keys:?}");
    if let Err(err) = storage.delete(remote_mapper_keys, MissingDataPolicy::Ignore).await {
        warn!("Failed to delete remote mapper data: {err}");
    }
}
