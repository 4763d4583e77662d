// packages/engine/src/state/memory.rs
//! In-memory repositories

use crate::consensus::coordinator::ConsensusRequest;
use crate::executor::workflow::Workflow;
use crate::runtime::lifecycle::ManagedAgentInstance;
use crate::state::{ConsensusRepository, InstanceRepository, WorkflowRepository};
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::{InstanceId, RequestId, WorkflowId};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[derive(Default)]
pub struct MemoryStore {
    workflows: DashMap<WorkflowId, Workflow>,
    consensus: DashMap<RequestId, ConsensusRequest>,
    instances: DashMap<InstanceId, ManagedAgentInstance>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowRepository for MemoryStore {
    async fn save(&self, workflow: &Workflow) -> Result<()> {
        self.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: WorkflowId) -> Result<Option<Workflow>> {
        Ok(self.workflows.get(&id).map(|w| w.value().clone()))
    }

    async fn find_active(&self) -> Result<Vec<Workflow>> {
        let mut active: Vec<Workflow> = self
            .workflows
            .iter()
            .filter(|w| !w.status.is_terminal())
            .map(|w| w.value().clone())
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(active)
    }

    async fn delete(&self, id: WorkflowId) -> Result<()> {
        self.workflows.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl ConsensusRepository for MemoryStore {
    async fn save(&self, request: &ConsensusRequest) -> Result<()> {
        match self.consensus.entry(request.id) {
            Entry::Occupied(mut stored) => {
                if stored.get().version > request.version {
                    return Err(EngineError::ConcurrencyConflict(format!(
                        "consensus {} version {} is older than stored version {}",
                        request.id,
                        request.version,
                        stored.get().version
                    )));
                }
                stored.insert(request.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(request.clone());
            }
        }
        Ok(())
    }

    async fn find_by_id(&self, id: RequestId) -> Result<Option<ConsensusRequest>> {
        Ok(self.consensus.get(&id).map(|r| r.value().clone()))
    }

    async fn find_pending(&self) -> Result<Vec<ConsensusRequest>> {
        let mut pending: Vec<ConsensusRequest> = self
            .consensus
            .iter()
            .filter(|r| !r.is_finalized())
            .map(|r| r.value().clone())
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }
}

#[async_trait]
impl InstanceRepository for MemoryStore {
    async fn save(&self, instance: &ManagedAgentInstance) -> Result<()> {
        self.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: InstanceId) -> Result<Option<ManagedAgentInstance>> {
        Ok(self.instances.get(&id).map(|i| i.value().clone()))
    }

    async fn find_active(&self) -> Result<Vec<ManagedAgentInstance>> {
        let mut active: Vec<ManagedAgentInstance> = self
            .instances
            .iter()
            .filter(|i| i.status.is_live())
            .map(|i| i.value().clone())
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(active)
    }

    async fn delete(&self, id: InstanceId) -> Result<()> {
        self.instances.remove(&id);
        Ok(())
    }
}
