// packages/engine/src/state/mod.rs
//! Persisted state
//!
//! One repository trait per aggregate. The orchestrator writes through
//! these after every mutation; the in-memory registries stay authoritative
//! while the process runs.
//!
//! - **Memory**: `DashMap`-backed, the default
//! - **Sqlite**: JSON documents in a single `rusqlite` table

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::consensus::coordinator::ConsensusRequest;
use crate::executor::workflow::Workflow;
use crate::runtime::lifecycle::ManagedAgentInstance;
use crate::utils::config::{StorageBackend, StorageConfig};
use crate::utils::errors::Result;
use crate::utils::ids::{InstanceId, RequestId, WorkflowId};
use async_trait::async_trait;
use std::sync::Arc;

/// Repository for the Workflow aggregate
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    /// Save a workflow (insert or update)
    async fn save(&self, workflow: &Workflow) -> Result<()>;

    async fn find_by_id(&self, id: WorkflowId) -> Result<Option<Workflow>>;

    /// Pending and Running workflows
    async fn find_active(&self) -> Result<Vec<Workflow>>;

    async fn delete(&self, id: WorkflowId) -> Result<()>;
}

/// Repository for the ConsensusRequest aggregate
#[async_trait]
pub trait ConsensusRepository: Send + Sync {
    /// Save a request; an older version than the stored one is a conflict
    async fn save(&self, request: &ConsensusRequest) -> Result<()>;

    async fn find_by_id(&self, id: RequestId) -> Result<Option<ConsensusRequest>>;

    /// Requests without a result
    async fn find_pending(&self) -> Result<Vec<ConsensusRequest>>;
}

/// Repository for managed agent instances
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    async fn save(&self, instance: &ManagedAgentInstance) -> Result<()>;

    async fn find_by_id(&self, id: InstanceId) -> Result<Option<ManagedAgentInstance>>;

    /// Creating, Active and Paused instances
    async fn find_active(&self) -> Result<Vec<ManagedAgentInstance>>;

    async fn delete(&self, id: InstanceId) -> Result<()>;
}

/// The three repositories, backed by one store
#[derive(Clone)]
pub struct Repositories {
    pub workflows: Arc<dyn WorkflowRepository>,
    pub consensus: Arc<dyn ConsensusRepository>,
    pub instances: Arc<dyn InstanceRepository>,
}

impl Repositories {
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            workflows: store.clone(),
            consensus: store.clone(),
            instances: store,
        }
    }

    pub fn sqlite(store: SqliteStore) -> Self {
        let store = Arc::new(store);
        Self {
            workflows: store.clone(),
            consensus: store.clone(),
            instances: store,
        }
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        match config.backend {
            StorageBackend::Memory => Ok(Self::in_memory()),
            StorageBackend::Sqlite => Ok(Self::sqlite(SqliteStore::open(&config.path)?)),
        }
    }
}

impl Default for Repositories {
    fn default() -> Self {
        Self::in_memory()
    }
}
