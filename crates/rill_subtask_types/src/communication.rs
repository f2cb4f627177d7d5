use std::collections::HashMap;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(any(feature = "testing", test))]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::errors::{ClientResult, SubtaskExecutionResult};
use crate::graph::ChunkTypeInfo;
use crate::operand::ChunkKey;
use crate::store::{ChunkPayload, DataKey};
use crate::subtask::{Band, BandName, ResourceKey, SessionId, SlotId, Subtask, SubtaskResult};

/// How a storage call treats a missing key: fail the batch, or tolerate the
/// miss (used for shuffle pieces that may legitimately not exist).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissingDataPolicy {
    Raise,
    Ignore,
}

/// Bit-field of storage placements a replica occupies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageLevel(pub u8);

impl StorageLevel {
    pub const MEMORY: StorageLevel = StorageLevel(1);
    pub const DISK: StorageLevel = StorageLevel(1 << 1);
    pub const REMOTE: StorageLevel = StorageLevel(1 << 2);

    pub fn intersects(self, other: StorageLevel) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for StorageLevel {
    type Output = StorageLevel;

    fn bitor(self, rhs: StorageLevel) -> StorageLevel {
        StorageLevel(self.0 | rhs.0)
    }
}

impl BitOrAssign for StorageLevel {
    fn bitor_assign(&mut self, rhs: StorageLevel) {
        self.0 |= rhs.0;
    }
}

/// One replica of a stored value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub level: StorageLevel,
}

/// Sizes and object handle recorded by a storage put.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutInfo {
    pub store_size: u64,
    pub memory_size: u64,
    pub object_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub key: DataKey,
    /// Band the value is prefetched into.
    pub band: BandName,
    pub on_missing: MissingDataPolicy,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRequest {
    pub key: DataKey,
    pub on_missing: MissingDataPolicy,
}

/// Storage service bound to one `(session, band)` pair.
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Prefetches values into the local cache. Returns the keys that had to be
    /// pulled from a remote worker; those are not tracked by lifecycle and the
    /// caller owns their cleanup.
    async fn fetch(&self, requests: Vec<FetchRequest>) -> ClientResult<Vec<DataKey>>;

    /// Retrieves values, pinning them for the caller. `Ignore` misses come
    /// back as `None`.
    async fn get(&self, requests: Vec<GetRequest>) -> ClientResult<Vec<Option<ChunkPayload>>>;

    async fn put(&self, entries: Vec<(DataKey, ChunkPayload)>) -> ClientResult<Vec<PutInfo>>;

    async fn unpin(&self, keys: Vec<DataKey>, on_missing: MissingDataPolicy) -> ClientResult<()>;

    async fn delete(&self, keys: Vec<DataKey>, on_missing: MissingDataPolicy) -> ClientResult<()>;

    /// Placement info of every replica per key.
    async fn get_infos(&self, keys: Vec<ChunkKey>) -> ClientResult<Vec<Vec<StorageInfo>>>;
}

pub type SharedStorageClient = Arc<dyn StorageClient>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkMetaField {
    MemorySize,
    StoreSize,
    Bands,
    ObjectRef,
}

/// The basic meta fields published to the supervisor for every result chunk.
pub const BASIC_META_FIELDS: [ChunkMetaField; 4] = [
    ChunkMetaField::MemorySize,
    ChunkMetaField::StoreSize,
    ChunkMetaField::Bands,
    ChunkMetaField::ObjectRef,
];

/// Storage object handle(s) of a result chunk; mapper chunks collect one per
/// mapper key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectRef {
    Single(String),
    Many(Vec<String>),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub memory_size: u64,
    pub store_size: u64,
    pub bands: Vec<Band>,
    pub object_ref: Option<ObjectRef>,
}

/// One `set_chunk_meta` entry. Supervisor meta carries `object_ref` and no
/// `type_info`; worker meta carries `type_info` and no `object_ref`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetaUpdate {
    pub chunk_key: ChunkKey,
    pub memory_size: u64,
    pub store_size: u64,
    pub bands: Vec<Band>,
    pub object_ref: Option<ObjectRef>,
    pub type_info: Option<ChunkTypeInfo>,
}

/// Supervisor-side chunk meta service.
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait MetaClient: Send + Sync {
    async fn get_chunk_meta(
        &self,
        keys: Vec<ChunkKey>,
        fields: Vec<ChunkMetaField>,
    ) -> ClientResult<Vec<ChunkMeta>>;

    async fn set_chunk_meta(&self, updates: Vec<ChunkMetaUpdate>) -> ClientResult<()>;
}

pub type SharedMetaClient = Arc<dyn MetaClient>;

/// Worker-local chunk meta service; same contract as [`MetaClient`] over a
/// different schema (full meta, no object refs).
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait WorkerMetaClient: Send + Sync {
    async fn get_chunk_meta(
        &self,
        keys: Vec<ChunkKey>,
        fields: Vec<ChunkMetaField>,
    ) -> ClientResult<Vec<ChunkMeta>>;

    async fn set_chunk_meta(&self, updates: Vec<ChunkMetaUpdate>) -> ClientResult<()>;
}

pub type SharedWorkerMetaClient = Arc<dyn WorkerMetaClient>;

/// The supervisor's task-result sink.
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait TaskClient: Send + Sync {
    async fn set_subtask_result(&self, result: SubtaskResult) -> ClientResult<()>;
}

pub type SharedTaskClient = Arc<dyn TaskClient>;

/// Drives a subtask inside an allocated slot's sub-pool.
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait SubtaskRunnerClient: Send + Sync {
    async fn run_subtask_in_slot(
        &self,
        band: BandName,
        slot_id: SlotId,
        subtask: Arc<Subtask>,
    ) -> SubtaskExecutionResult<SubtaskResult>;

    async fn cancel_subtask_in_slot(&self, band: BandName, slot_id: SlotId) -> ClientResult<()>;
}

pub type SharedSubtaskRunnerClient = Arc<dyn SubtaskRunnerClient>;

/// Compute-slot bookkeeping of one band.
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait SlotManagerClient: Send + Sync {
    /// Blocks until a slot is free, then reserves it for `key`.
    async fn acquire_free_slot(&self, key: ResourceKey) -> ClientResult<SlotId>;

    async fn release_free_slot(&self, slot_id: SlotId, key: ResourceKey) -> ClientResult<()>;

    /// Forcibly tears down the slot's sub-pool.
    async fn kill_slot(&self, slot_id: SlotId) -> ClientResult<()>;

    async fn get_slot_address(&self, slot_id: SlotId) -> ClientResult<String>;

    /// The slot currently reserved for `key`, if any.
    async fn get_subtask_slot(&self, key: ResourceKey) -> ClientResult<Option<SlotId>>;

    async fn upload_slot_usages(&self, periodical: bool) -> ClientResult<()>;
}

pub type SharedSlotManagerClient = Arc<dyn SlotManagerClient>;

/// Byte-denominated memory admission of one band.
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait QuotaClient: Send + Sync {
    /// Blocks until every requested amount is granted.
    async fn request_batch_quota(&self, request: HashMap<ResourceKey, u64>) -> ClientResult<()>;

    async fn release_quotas(&self, keys: Vec<ResourceKey>) -> ClientResult<()>;
}

pub type SharedQuotaClient = Arc<dyn QuotaClient>;

/// Actor-framework surface needed by the coordinator: sub-pool recovery.
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Resolves once the sub-pool at `sub_pool_address` is back up.
    async fn wait_actor_pool_recovered(&self, sub_pool_address: String) -> ClientResult<()>;
}

pub type SharedClusterClient = Arc<dyn ClusterClient>;

/// Resolves collaborator handles for a session/band. Factory-shaped so tests
/// can substitute every collaborator.
#[cfg_attr(any(test, feature = "testing"), automock)]
pub trait ClientProvider: Send + Sync {
    fn storage(&self, session_id: &SessionId, band: &BandName) -> SharedStorageClient;
    fn meta(&self, session_id: &SessionId, supervisor_address: &str) -> SharedMetaClient;
    fn worker_meta(&self, session_id: &SessionId) -> SharedWorkerMetaClient;
    fn task(&self, session_id: &SessionId, supervisor_address: &str) -> SharedTaskClient;
    fn subtask_runner(&self) -> SharedSubtaskRunnerClient;
    fn slot_manager(&self, band: &BandName) -> SharedSlotManagerClient;
    fn quota(&self, band: &BandName) -> SharedQuotaClient;
    fn cluster(&self) -> SharedClusterClient;
}

pub type SharedClientProvider = Arc<dyn ClientProvider>;
