use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Configuration of the per-band subtask execution coordinator.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Validate)]
pub struct SubtaskExecutorConfig {
    /// Default number of reruns for retryable subtasks; overridable per
    /// subtask through its extra config.
    pub subtask_max_retries: u32,
    /// Whether a cancel that outlives its kill timeout may tear down the slot
    /// sub-pool.
    pub enable_kill_slot: bool,
    #[validate(range(min = 1))]
    pub data_prepare_timeout_secs: u64,
}

impl Default for SubtaskExecutorConfig {
    fn default() -> Self {
        Self { subtask_max_retries: 0, enable_kill_slot: true, data_prepare_timeout_secs: 600 }
    }
}

impl SubtaskExecutorConfig {
    pub fn data_prepare_timeout(&self) -> Duration {
        Duration::from_secs(self.data_prepare_timeout_secs)
    }
}

/// Configuration of the in-slot subtask processor.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Validate)]
pub struct SubtaskProcessorConfig {
    #[validate(range(min = 1))]
    pub progress_report_interval_millis: u64,
    /// Minimum progress change worth reporting to the supervisor.
    #[validate(range(min = 0.0, max = 1.0))]
    pub progress_report_epsilon: f64,
}

impl Default for SubtaskProcessorConfig {
    fn default() -> Self {
        Self { progress_report_interval_millis: 500, progress_report_epsilon: 0.001 }
    }
}

impl SubtaskProcessorConfig {
    pub fn progress_report_interval(&self) -> Duration {
        Duration::from_millis(self.progress_report_interval_millis)
    }
}
