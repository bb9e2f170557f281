//! Executes one task against its platform adapter.
//!
//! The worker turns a task's kind and action into adapter calls. Each
//! adapter call is bounded by the operation timeout; an expired deadline is
//! a transient failure like any other.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::core::{DeploymentId, TaskAction, TaskNode, TaskResult};
use crate::lab::{ResourceKind, ResourceSpec};
use crate::platform::{
    Placement, PlatformAdapter, PlatformError, PlatformResult, ResourceKey, ResourceState,
    ResourceStatus,
};
use crate::util::with_deadline;

/// Everything a worker needs, owned so it can move into a spawned task.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub deployment: DeploymentId,
    /// Snapshot of the task as dispatched (attempt count already bumped).
    pub task: TaskNode,
    pub spec: ResourceSpec,
    pub placement: Placement,
    pub timeout: Duration,
}

impl WorkItem {
    fn key(&self) -> ResourceKey {
        ResourceKey::new(self.deployment, &self.task.resource)
    }
}

/// Run the platform operations for one dispatch of a task.
pub async fn execute(
    adapter: Arc<dyn PlatformAdapter>,
    item: &WorkItem,
) -> PlatformResult<TaskResult> {
    match item.task.action {
        TaskAction::Create => create(adapter.as_ref(), item).await,
        TaskAction::Delete => delete(adapter.as_ref(), item).await,
    }
}

async fn create(adapter: &dyn PlatformAdapter, item: &WorkItem) -> PlatformResult<TaskResult> {
    let key = item.key();
    let timeout = item.timeout;

    // A previous dispatch may have created the resource before failing or
    // crashing. Look it up under the same key before creating again.
    if item.task.attempts > 1 {
        let status = with_deadline(timeout, adapter.get_status(item.task.kind, &key)).await?;
        if status.exists {
            return adopt(adapter, item, status).await;
        }
    }

    match item.task.kind {
        ResourceKind::Network => {
            let handle = with_deadline(timeout, adapter.create_network(&key, &item.spec)).await?;
            debug!(resource = %item.task.resource, network_id = %handle.network_id, "network created");
            Ok(TaskResult::new(handle.network_id))
        }
        ResourceKind::Compute => {
            let handle = with_deadline(
                timeout,
                adapter.create_compute(&key, &item.spec, &item.placement),
            )
            .await?;
            debug!(resource = %item.task.resource, compute_id = %handle.compute_id, "compute created");
            with_deadline(timeout, adapter.start_compute(&handle.compute_id)).await?;

            let address = match handle.address {
                Some(address) => Some(address),
                None => {
                    with_deadline(timeout, adapter.get_status(ResourceKind::Compute, &key))
                        .await?
                        .address
                }
            };
            Ok(TaskResult::new(handle.compute_id).with_address(address))
        }
    }
}

async fn adopt(
    adapter: &dyn PlatformAdapter,
    item: &WorkItem,
    status: ResourceStatus,
) -> PlatformResult<TaskResult> {
    let resource_id = status.resource_id.ok_or_else(|| {
        PlatformError::Transient(format!(
            "{} reported {} as existing without an id",
            adapter.name(),
            item.task.resource
        ))
    })?;
    info!(
        deployment = %item.deployment,
        resource = %item.task.resource,
        resource_id = %resource_id,
        attempt = item.task.attempts,
        "adopting resource from an earlier attempt"
    );

    if item.task.kind == ResourceKind::Compute && status.state != ResourceState::Running {
        with_deadline(item.timeout, adapter.start_compute(&resource_id)).await?;
    }
    Ok(TaskResult::new(resource_id).with_address(status.address))
}

async fn delete(adapter: &dyn PlatformAdapter, item: &WorkItem) -> PlatformResult<TaskResult> {
    let key = item.key();
    let timeout = item.timeout;

    let target = match &item.task.target {
        Some(id) => Some(id.clone()),
        // The create never recorded an id; it may still have left something
        // behind under the key.
        None => {
            let status = with_deadline(timeout, adapter.get_status(item.task.kind, &key)).await?;
            if status.exists {
                status.resource_id
            } else {
                None
            }
        }
    };

    let Some(resource_id) = target else {
        debug!(resource = %item.task.resource, "nothing to delete");
        return Ok(TaskResult::new(key.to_string()));
    };

    match item.task.kind {
        ResourceKind::Compute => {
            match with_deadline(timeout, adapter.stop_compute(&resource_id)).await {
                Ok(()) => {}
                Err(PlatformError::CapabilityMissing { .. }) => {
                    debug!(backend = adapter.name(), "backend cannot stop instances, deleting directly");
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            absent_ok(with_deadline(timeout, adapter.delete_compute(&resource_id)).await)?;
        }
        ResourceKind::Network => {
            absent_ok(with_deadline(timeout, adapter.delete_network(&resource_id)).await)?;
        }
    }

    debug!(resource = %item.task.resource, resource_id = %resource_id, "resource deleted");
    Ok(TaskResult::new(resource_id))
}

/// Deleting something already gone is success.
fn absent_ok(result: PlatformResult<()>) -> PlatformResult<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
