use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::ComputeError;
use crate::store::{DataStore, OperandContext};

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
pub struct ChunkKey(pub String);

impl From<&str> for ChunkKey {
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
pub struct OpKey(pub String);

impl From<&str> for OpKey {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Estimated sizes per chunk key: `(store_size, memory_size)`. Populated by
/// kernels' [`ChunkKernel::estimate_size`] and consumed by the memory
/// estimator.
pub type SizeContext = HashMap<ChunkKey, (u64, u64)>;

/// The physical implementation seam of a compute operand. Implementations are
/// external to this crate.
pub trait ChunkKernel: Send + Sync + fmt::Debug {
    /// Populates `ctx[out] = (store_size, memory_size)` for every output of
    /// `op`, given the already-present sizes of its inputs.
    fn estimate_size(&self, ctx: &mut SizeContext, op: &Operand);

    /// Executes the operand: reads input values from `store`, writes every
    /// output value back into it.
    fn execute(
        &self,
        store: &mut DataStore,
        ctx: &OperandContext,
        op: &Operand,
    ) -> Result<(), ComputeError>;
}

#[derive(Clone, Debug)]
pub struct ComputeOp {
    pub retryable: bool,
    pub kernel: Arc<dyn ChunkKernel>,
}

/// Sealed operand variants; dispatch is on the tag, never on downcasts.
#[derive(Clone, Debug)]
pub enum OperandKind {
    /// External input resolved by a storage fetch of the chunk key itself.
    Fetch,
    /// External shuffle input: `n_mappers` tuple-shaped mapper keys, pieces of
    /// which may be legitimately absent.
    FetchShuffle { n_mappers: usize },
    Compute(ComputeOp),
}

#[derive(Clone, Debug)]
pub struct Operand {
    pub key: OpKey,
    pub gpu: bool,
    pub inputs: Vec<ChunkKey>,
    pub outputs: Vec<ChunkKey>,
    pub kind: OperandKind,
}

impl Operand {
    pub fn is_fetch(&self) -> bool {
        matches!(self.kind, OperandKind::Fetch)
    }

    pub fn is_data_source(&self) -> bool {
        matches!(self.kind, OperandKind::Fetch | OperandKind::FetchShuffle { .. })
    }

    pub fn compute(&self) -> Option<&ComputeOp> {
        match &self.kind {
            OperandKind::Compute(compute) => Some(compute),
            _ => None,
        }
    }

    /// Data sources are always retryable; compute operands carry their own
    /// flag.
    pub fn retryable(&self) -> bool {
        match &self.kind {
            OperandKind::Compute(compute) => compute.retryable,
            _ => true,
        }
    }
}
