use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::core::{Deployment, DeploymentId, TaskId, TaskUpdate};
use crate::state::DeploymentStore;
use crate::{Error, Result};

type Slot = Arc<Mutex<Deployment>>;

/// Volatile store for tests and single-process runs.
///
/// Each record sits behind its own async mutex, so updates to one
/// deployment never wait on another.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: RwLock<HashMap<DeploymentId, Slot>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: DeploymentId) -> Result<Slot> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
            .ok_or(Error::DeploymentNotFound(id))
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeploymentStore for InMemoryStore {
    async fn save(&self, deployment: &Deployment) -> Result<()> {
        let existing = self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&deployment.id)
            .cloned();

        match existing {
            Some(slot) => *slot.lock().await = deployment.clone(),
            None => {
                self.records
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(deployment.id, Arc::new(Mutex::new(deployment.clone())));
            }
        }
        Ok(())
    }

    async fn load(&self, id: DeploymentId) -> Result<Deployment> {
        let slot = self.slot(id)?;
        let deployment = slot.lock().await.clone();
        Ok(deployment)
    }

    async fn update_task_status(
        &self,
        id: DeploymentId,
        task_id: TaskId,
        update: TaskUpdate,
    ) -> Result<Deployment> {
        let slot = self.slot(id)?;
        let mut deployment = slot.lock().await;
        deployment.apply(&task_id, update)?;
        Ok(deployment.clone())
    }

    async fn list(&self) -> Result<Vec<Deployment>> {
        let slots: Vec<Slot> = self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        let mut deployments = Vec::with_capacity(slots.len());
        for slot in slots {
            deployments.push(slot.lock().await.clone());
        }
        deployments.sort_by_key(|d| d.created_at);
        Ok(deployments)
    }

    async fn delete(&self, id: DeploymentId) -> Result<()> {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .map(|_| ())
            .ok_or(Error::DeploymentNotFound(id))
    }
}
