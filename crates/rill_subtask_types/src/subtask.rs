use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::ChunkGraph;
use crate::operand::ChunkKey;

#[derive(
    Clone,
    Debug,
    Default,
    derive_more::Display,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub struct SessionId(pub String);

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

#[derive(
    Clone,
    Debug,
    Default,
    derive_more::Display,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub struct TaskId(pub String);

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

#[derive(
    Clone,
    Debug,
    Default,
    derive_more::Display,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub struct StageId(pub String);

impl From<&str> for StageId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

#[derive(
    Clone,
    Debug,
    Default,
    derive_more::Display,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub struct SubtaskId(pub String);

impl From<&str> for SubtaskId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Name of a resource pool on a worker, e.g. `numa-0` or `gpu-0`.
#[derive(
    Clone,
    Debug,
    Default,
    derive_more::Display,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub struct BandName(pub String);

impl From<&str> for BandName {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// A band pinned to its hosting worker.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Band {
    pub worker_address: String,
    pub name: BandName,
}

impl Band {
    pub fn new(worker_address: impl Into<String>, name: impl Into<BandName>) -> Self {
        Self { worker_address: worker_address.into(), name: name.into() }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.worker_address, self.name)
    }
}

#[derive(Clone, Copy, Debug, derive_more::Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotId(pub u32);

/// Keys a subtask's quota and slot grants, so allocations survive recovery.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub session_id: SessionId,
    pub subtask_id: SubtaskId,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_id, self.subtask_id)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubtaskStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Errored,
    Cancelled,
}

impl SubtaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SubtaskStatus::Succeeded | SubtaskStatus::Errored | SubtaskStatus::Cancelled)
    }
}

/// Recognized per-subtask option overrides.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskExtraConfig {
    pub subtask_max_retries: Option<u32>,
}

/// A chunk-graph unit of scheduling, dispatched to one band. Immutable for the
/// duration of one run.
#[derive(Clone, Debug)]
pub struct Subtask {
    pub subtask_id: SubtaskId,
    pub session_id: SessionId,
    pub task_id: TaskId,
    pub stage_id: StageId,
    pub chunk_graph: ChunkGraph,
    /// Inputs depended on for ordering only; excluded from data preparation
    /// and size accounting.
    pub pure_depend_keys: HashSet<ChunkKey>,
    /// Result chunks whose full meta must be published to worker meta.
    /// `None` means all result chunks.
    pub update_meta_chunks: Option<HashSet<ChunkKey>>,
    pub retryable: bool,
    pub extra_config: Option<SubtaskExtraConfig>,
}

/// The one result record every accepted subtask eventually produces.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SubtaskResult {
    pub subtask_id: SubtaskId,
    pub session_id: SessionId,
    pub task_id: TaskId,
    pub stage_id: StageId,
    pub status: SubtaskStatus,
    pub progress: f64,
    pub bands: Vec<Band>,
    pub data_size: Option<u64>,
    pub error: Option<String>,
    pub traceback: Option<String>,
    pub execution_start_time: Option<DateTime<Utc>>,
    pub execution_end_time: Option<DateTime<Utc>>,
}

impl SubtaskResult {
    /// A pending result carrying the subtask's identity.
    pub fn for_subtask(subtask: &Subtask) -> Self {
        Self {
            subtask_id: subtask.subtask_id.clone(),
            session_id: subtask.session_id.clone(),
            task_id: subtask.task_id.clone(),
            stage_id: subtask.stage_id.clone(),
            status: SubtaskStatus::Pending,
            ..Self::default()
        }
    }
}
