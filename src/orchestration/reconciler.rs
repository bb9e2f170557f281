//! Teardown of deployed labs.
//!
//! The reconciler switches a deployment to its teardown phase and runs the
//! deletion graph through the same scheduler as provisioning. Deletes treat
//! an absent resource as success, so a teardown can be repeated after a
//! partial failure or an out-of-band deletion.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::{build_teardown, DeploymentId, DeploymentPhase, DeploymentStatus};
use crate::orchestration::Scheduler;
use crate::state::DeploymentStore;
use crate::Result;

pub struct Reconciler {
    store: Arc<dyn DeploymentStore>,
    scheduler: Arc<Scheduler>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn DeploymentStore>, scheduler: Arc<Scheduler>) -> Self {
        Self { store, scheduler }
    }

    /// Make sure the deployment has a teardown graph to run.
    ///
    /// A teardown interrupted mid-run is resumed as is. A teardown that
    /// ended failed or cancelled is replaced by a fresh deletion graph;
    /// resources it already removed will report absent and succeed.
    pub async fn prepare(&self, id: DeploymentId) -> Result<()> {
        let mut deployment = self.store.load(id).await?;

        let in_progress = deployment.phase == DeploymentPhase::Teardown
            && deployment.teardown.is_some()
            && !deployment.status.is_terminal();
        if in_progress {
            debug!(deployment = %id, "resuming interrupted teardown");
            return Ok(());
        }

        let teardown = build_teardown(&deployment.graph)?;
        deployment.begin_teardown(teardown);
        self.store.save(&deployment).await?;
        Ok(())
    }

    /// Delete every resource of the deployment, dependents first.
    ///
    /// On success the deployment record is removed from the store.
    pub async fn teardown(&self, id: DeploymentId, cancel: CancellationToken) -> Result<DeploymentStatus> {
        self.prepare(id).await?;
        let status = self.scheduler.run(id, cancel).await?;

        if status == DeploymentStatus::Succeeded {
            self.store.delete(id).await?;
            info!(deployment = %id, "teardown complete, deployment record removed");
        }
        Ok(status)
    }
}
