//! Durable deployment records.
//!
//! The store is the only mutable state shared between the scheduler and
//! callers polling for status. Writes to one deployment are serialized by a
//! per-deployment lock; different deployments never contend.
//!
//! Every task transition is written before the scheduler acts on it, so a
//! deployment reloaded after a crash reflects every decision already made.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use crate::core::{Deployment, DeploymentId, TaskId, TaskUpdate};
use crate::Result;

mod file;
mod memory;

pub use file::JsonFileStore;
pub use memory::InMemoryStore;

/// Persistence for deployment records.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Write the whole record, replacing any previous version.
    async fn save(&self, deployment: &Deployment) -> Result<()>;

    /// Read a record. Fails with `DeploymentNotFound` if absent.
    async fn load(&self, id: DeploymentId) -> Result<Deployment>;

    /// Apply one task transition to the active graph and persist it.
    ///
    /// Read-modify-write under the deployment's lock, so concurrent updates
    /// to different tasks of the same deployment never lose each other.
    /// Returns the record as written.
    async fn update_task_status(
        &self,
        id: DeploymentId,
        task_id: TaskId,
        update: TaskUpdate,
    ) -> Result<Deployment>;

    /// All records, oldest first.
    async fn list(&self) -> Result<Vec<Deployment>>;

    /// Remove a record. Fails with `DeploymentNotFound` if absent.
    async fn delete(&self, id: DeploymentId) -> Result<()>;
}

/// One async lock per deployment id.
#[derive(Debug, Default)]
pub(crate) struct DeploymentLocks {
    locks: Mutex<HashMap<DeploymentId, Arc<tokio::sync::Mutex<()>>>>,
}

impl DeploymentLocks {
    pub(crate) async fn acquire(&self, id: DeploymentId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(id).or_default())
        };
        lock.lock_owned().await
    }

    pub(crate) fn forget(&self, id: DeploymentId) {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }
}
