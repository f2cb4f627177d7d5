use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::operand::{ChunkKey, OpKey};
use crate::subtask::{Band, SessionId, SubtaskId};

/// An in-memory chunk value. Payloads are opaque to the execution core; only
/// kernels and the storage service interpret them.
pub type ChunkPayload = Arc<dyn Any + Send + Sync>;

/// Key of one stored value. Shuffle mappers produce several values per chunk
/// key, addressed by a mapper index; everything else stores under the plain
/// chunk key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataKey {
    Chunk(ChunkKey),
    Mapper(ChunkKey, u32),
}

impl DataKey {
    pub fn chunk_key(&self) -> &ChunkKey {
        match self {
            DataKey::Chunk(key) | DataKey::Mapper(key, _) => key,
        }
    }

    pub fn is_mapper(&self) -> bool {
        matches!(self, DataKey::Mapper(..))
    }
}

impl From<ChunkKey> for DataKey {
    fn from(key: ChunkKey) -> Self {
        DataKey::Chunk(key)
    }
}

impl fmt::Display for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataKey::Chunk(key) => write!(f, "{key}"),
            DataKey::Mapper(key, index) => write!(f, "{key}:{index}"),
        }
    }
}

/// Temporary store holding chunk values during a single subtask run. A value
/// lives here strictly between the completion of its producing operand and the
/// last consumer's refcount decrement.
#[derive(Default)]
pub struct DataStore {
    values: HashMap<DataKey, ChunkPayload>,
}

impl fmt::Debug for DataStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataStore").field("keys", &self.values.keys().collect::<Vec<_>>()).finish()
    }
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: DataKey, value: ChunkPayload) {
        self.values.insert(key, value);
    }

    pub fn get(&self, key: &DataKey) -> Option<&ChunkPayload> {
        self.values.get(key)
    }

    pub fn remove(&mut self, key: &DataKey) -> Option<ChunkPayload> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &DataKey) -> bool {
        self.values.contains_key(key)
    }

    /// Whether a plain (non-mapper) value exists for the chunk key.
    pub fn contains_chunk(&self, key: &ChunkKey) -> bool {
        self.values.contains_key(&DataKey::Chunk(key.clone()))
    }

    /// All data keys belonging to a chunk key: the plain key first if present,
    /// then mapper keys ordered by mapper index.
    pub fn data_keys_for(&self, chunk_key: &ChunkKey) -> Vec<DataKey> {
        let mut keys: Vec<DataKey> =
            self.values.keys().filter(|key| key.chunk_key() == chunk_key).cloned().collect();
        keys.sort();
        keys
    }

    pub fn keys(&self) -> impl Iterator<Item = &DataKey> {
        self.values.keys()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

/// Shared per-operand progress, in `[0, 1]` per operand key. Written by the
/// executing side (including kernels, through [`OperandContext`]), sampled by
/// the processor's progress reporter.
#[derive(Clone, Debug, Default)]
pub struct OpProgressTracker {
    inner: Arc<Mutex<HashMap<OpKey, f64>>>,
}

impl OpProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an operand at progress 0. Only registered operands accept
    /// updates.
    pub fn begin(&self, op_key: &OpKey) {
        self.inner.lock().expect("op progress lock poisoned").insert(op_key.clone(), 0.0);
    }

    pub fn update(&self, op_key: &OpKey, progress: f64) {
        let mut entries = self.inner.lock().expect("op progress lock poisoned");
        if let Some(entry) = entries.get_mut(op_key) {
            *entry = entry.max(progress.clamp(0.0, 1.0));
        }
    }

    pub fn sum(&self) -> f64 {
        self.inner.lock().expect("op progress lock poisoned").values().sum()
    }
}

/// Explicit per-run context handed to every kernel `execute` call, replacing
/// any ambient process-local state.
#[derive(Clone, Debug)]
pub struct OperandContext {
    pub session_id: SessionId,
    pub subtask_id: SubtaskId,
    pub band: Band,
    pub supervisor_address: String,
    progress: OpProgressTracker,
}

impl OperandContext {
    pub fn new(
        session_id: SessionId,
        subtask_id: SubtaskId,
        band: Band,
        supervisor_address: String,
        progress: OpProgressTracker,
    ) -> Self {
        Self { session_id, subtask_id, band, supervisor_address, progress }
    }

    /// Lets a long-running kernel report fractional progress for its operand.
    pub fn report_op_progress(&self, op_key: &OpKey, progress: f64) {
        self.progress.update(op_key, progress);
    }
}
