use std::sync::{Arc, Mutex, MutexGuard};

use rill_subtask_types::communication::{
    SharedClientProvider,
    SharedMetaClient,
    SharedStorageClient,
    SharedTaskClient,
    SharedWorkerMetaClient,
};
use rill_subtask_types::errors::{ClientError, SubtaskExecutionError, SubtaskExecutionResult};
use rill_subtask_types::operand::OpKey;
use rill_subtask_types::store::OpProgressTracker;
use rill_subtask_types::subtask::{Band, SessionId, Subtask, SubtaskId, SubtaskResult};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::SubtaskProcessorConfig;
use crate::processor::{ChunkGraphOptimizer, SubtaskProcessor};

struct ActiveRun {
    subtask_id: SubtaskId,
    cancel_token: CancellationToken,
    result: Arc<Mutex<SubtaskResult>>,
    progress: OpProgressTracker,
    done: watch::Receiver<bool>,
}

/// Hosts subtask processors inside one slot's sub-pool: at most one live run
/// at a time, with the last finished result kept for late readers.
pub struct SlotProcessorHost {
    session_id: SessionId,
    band: Band,
    supervisor_address: String,
    config: SubtaskProcessorConfig,
    optimizer: Arc<dyn ChunkGraphOptimizer>,

    storage: SharedStorageClient,
    meta: SharedMetaClient,
    worker_meta: SharedWorkerMetaClient,
    task: SharedTaskClient,

    current: Mutex<Option<ActiveRun>>,
    last_result: Mutex<Option<Arc<Mutex<SubtaskResult>>>>,
}

impl SlotProcessorHost {
    pub fn new(
        session_id: SessionId,
        band: Band,
        supervisor_address: String,
        clients: &SharedClientProvider,
        config: SubtaskProcessorConfig,
        optimizer: Arc<dyn ChunkGraphOptimizer>,
    ) -> Self {
        let storage = clients.storage(&session_id, &band.name);
        let meta = clients.meta(&session_id, &supervisor_address);
        let worker_meta = clients.worker_meta(&session_id);
        let task = clients.task(&session_id, &supervisor_address);
        Self {
            session_id,
            band,
            supervisor_address,
            config,
            optimizer,
            storage,
            meta,
            worker_meta,
            task,
            current: Mutex::new(None),
            last_result: Mutex::new(None),
        }
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.current.lock().expect("active run lock poisoned")
    }

    /// Runs one subtask to completion. A second concurrent run is rejected.
    pub async fn run(&self, subtask: Subtask) -> SubtaskExecutionResult<SubtaskResult> {
        assert_eq!(
            subtask.session_id, self.session_id,
            "subtask session must match the host session"
        );
        let subtask = Arc::new(subtask);
        let cancel_token = CancellationToken::new();
        let mut processor = SubtaskProcessor::new(
            subtask.clone(),
            self.storage.clone(),
            self.meta.clone(),
            self.worker_meta.clone(),
            self.task.clone(),
            self.band.clone(),
            self.supervisor_address.clone(),
            self.config,
            self.optimizer.clone(),
            cancel_token.clone(),
        );

        {
            let mut current = self.lock_current();
            if let Some(active) = current.as_ref() {
                return Err(SubtaskExecutionError::AlreadyRunning(active.subtask_id.clone()));
            }
            *current = Some(ActiveRun {
                subtask_id: subtask.subtask_id.clone(),
                cancel_token,
                result: processor.result_handle(),
                progress: processor.progress_handle(),
                done: processor.subscribe_done(),
            });
        }

        info!("Start to run subtask {} on {}", subtask.subtask_id, self.band);
        let handle = tokio::spawn(async move { processor.run().await });
        let result = match handle.await {
            Ok(result) => result,
            Err(err) => {
                Err(ClientError::Peer(format!("subtask processor task failed: {err}")).into())
            }
        };

        if let Some(active) = self.lock_current().take() {
            *self.last_result.lock().expect("last result lock poisoned") = Some(active.result);
        }
        info!("Finished subtask {}", subtask.subtask_id);
        result
    }

    /// Cancels the live run, if any, and waits until it reaches a terminal
    /// status.
    pub async fn cancel(&self) {
        let Some((subtask_id, cancel_token, mut done)) = self
            .lock_current()
            .as_ref()
            .map(|active| (active.subtask_id.clone(), active.cancel_token.clone(), active.done.clone()))
        else {
            return;
        };
        info!("Cancelling subtask {}", subtask_id);
        cancel_token.cancel();
        let _ = done.wait_for(|is_done| *is_done).await;
    }

    /// Waits for the live run to reach a terminal status.
    pub async fn wait(&self) {
        let Some(mut done) = self.lock_current().as_ref().map(|active| active.done.clone())
        else {
            return;
        };
        let _ = done.wait_for(|is_done| *is_done).await;
    }

    /// The live result if a run is active, else the last finished one.
    pub fn result(&self) -> Option<SubtaskResult> {
        if let Some(active) = self.lock_current().as_ref() {
            return Some(active.result.lock().expect("subtask result lock poisoned").clone());
        }
        self.last_result
            .lock()
            .expect("last result lock poisoned")
            .as_ref()
            .map(|result| result.lock().expect("subtask result lock poisoned").clone())
    }

    pub fn running_subtask_id(&self) -> Option<SubtaskId> {
        self.lock_current().as_ref().map(|active| active.subtask_id.clone())
    }

    /// Forwards fractional progress reported for the running operand.
    pub fn set_running_op_progress(&self, op_key: &OpKey, progress: f64) {
        if let Some(active) = self.lock_current().as_ref() {
            active.progress.update(op_key, progress);
        }
    }
}
