use thiserror::Error;

use crate::graph::GraphCycleError;
use crate::operand::OpKey;
use crate::subtask::SubtaskId;

/// Transport-level failure of a collaborator call. Both variants are treated
/// as transient by the coordinator's retry policy.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    /// A worker-local OS-level failure (connection reset, subprocess death).
    #[error("worker io error: {0}")]
    Io(String),
    /// The remote peer answered with a framework-level error.
    #[error("peer rpc error: {0}")]
    Peer(String),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Failure raised by a kernel's `execute`; carried verbatim so the nested
/// cause survives the wrapping layers.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ComputeError {
    pub message: String,
    pub traceback: Option<String>,
}

impl ComputeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), traceback: None }
    }
}

/// A kernel failure wrapped at the operand boundary, retaining the nested
/// cause and its traceback.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("executing operand {} failed: {}", .op_key, .nested.message)]
pub struct ExecutionError {
    pub op_key: OpKey,
    #[source]
    pub nested: ComputeError,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SubtaskExecutionError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("subtask was cancelled")]
    Cancelled,
    #[error("data preparation timed out after {timeout_secs}s")]
    DataPrepareTimeout { timeout_secs: u64 },
    #[error("exceeded max rerun [{num_retries}/{max_retries}] of subtask {subtask_id}: {source}")]
    ExceedMaxRerun {
        subtask_id: SubtaskId,
        num_retries: u32,
        max_retries: u32,
        #[source]
        source: Box<SubtaskExecutionError>,
    },
    #[error(
        "failed to rerun subtask {subtask_id} [{num_retries}/{max_retries}] due to an unhandled \
         error: {source}"
    )]
    Unhandled {
        subtask_id: SubtaskId,
        num_retries: u32,
        max_retries: u32,
        #[source]
        source: Box<SubtaskExecutionError>,
    },
    #[error(
        "subtask {subtask_id} is not retryable, it contains unretryable ops \
         {unretryable_ops:?}: {source}"
    )]
    Unretryable {
        subtask_id: SubtaskId,
        unretryable_ops: Vec<OpKey>,
        #[source]
        source: Box<SubtaskExecutionError>,
    },
    #[error("subtask {0} is already running on this band")]
    AlreadyRunning(SubtaskId),
    #[error(transparent)]
    GraphCycle(#[from] GraphCycleError),
}

impl SubtaskExecutionError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SubtaskExecutionError::Cancelled)
    }

    /// Whether the retry policy may rerun after this failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, SubtaskExecutionError::Client(_))
    }
}

pub type SubtaskExecutionResult<T> = Result<T, SubtaskExecutionError>;
