//! Scheduler for parallel task execution.
//!
//! The Scheduler drives one phase of a deployment (provisioning or teardown)
//! to a terminal status. It keeps a worklist over the active task graph:
//! ready tasks are dispatched to workers up to the concurrency limit,
//! transient failures go back to pending after a backoff, and a terminal
//! failure poisons every transitive dependent.
//!
//! Every transition is written to the store before the scheduler acts on
//! it, so a crash at any point leaves a record that [`Scheduler::run`] can
//! pick up again: tasks left `running` are reset to `pending` and retried
//! with an existence check.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::OrchestratorConfig;
use crate::core::{
    Deployment, DeploymentId, DeploymentPhase, DeploymentSnapshot, DeploymentStatus, TaskAction,
    TaskId, TaskResult, TaskStatus, TaskUpdate,
};
use crate::lab::{ResourceKind, ResourceSpec};
use crate::orchestration::worker::{self, WorkItem};
use crate::platform::{Placement, PlatformError, PlatformRegistry, PlatformResult};
use crate::state::DeploymentStore;
use crate::Result;

/// Events emitted by the scheduler for task lifecycle changes.
///
/// These allow external components to follow a run without polling the
/// store.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// A task was dispatched to a worker.
    TaskStarted {
        deployment: DeploymentId,
        task_id: TaskId,
        resource: String,
        action: TaskAction,
        attempt: u32,
    },
    TaskSucceeded {
        deployment: DeploymentId,
        task_id: TaskId,
        resource: String,
        result: TaskResult,
    },
    /// A transient failure; the task goes again after `delay`.
    TaskRetrying {
        deployment: DeploymentId,
        task_id: TaskId,
        resource: String,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    TaskFailed {
        deployment: DeploymentId,
        task_id: TaskId,
        resource: String,
        error: String,
    },
    TaskSkipped {
        deployment: DeploymentId,
        task_id: TaskId,
        resource: String,
        reason: String,
    },
    /// The phase reached a terminal status.
    DeploymentFinished {
        deployment: DeploymentId,
        phase: DeploymentPhase,
        status: DeploymentStatus,
    },
}

type WorkerOutput = (TaskId, PlatformResult<TaskResult>);

/// Bookkeeping for one run.
struct RunState {
    deployment: Deployment,
    in_flight: JoinSet<WorkerOutput>,
    /// Worker task id to graph task id, to attribute panics.
    workers: HashMap<Id, TaskId>,
    /// Backoff timers; each yields the task to re-ready.
    timers: JoinSet<TaskId>,
    backing_off: HashSet<TaskId>,
}

/// Drives a deployment's active graph to completion.
pub struct Scheduler {
    store: Arc<dyn DeploymentStore>,
    registry: Arc<PlatformRegistry>,
    config: OrchestratorConfig,
    events: broadcast::Sender<SchedulerEvent>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        registry: Arc<PlatformRegistry>,
        config: OrchestratorConfig,
        events: broadcast::Sender<SchedulerEvent>,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            events,
        }
    }

    /// Current snapshot of a deployment, for polling.
    pub async fn status(&self, id: DeploymentId) -> Result<DeploymentSnapshot> {
        Ok(self.store.load(id).await?.snapshot())
    }

    /// Run the deployment's active phase until it is terminal.
    ///
    /// Cancelling `cancel` stops dispatch; in-flight operations finish, then
    /// every task not yet started is skipped and the deployment ends
    /// `cancelled`. Returns the terminal status.
    ///
    /// # Errors
    /// Fails only if the store does. Task failures are recorded on the
    /// tasks and reflected in the returned status.
    #[instrument(skip(self, cancel), fields(deployment = %id))]
    pub async fn run(&self, id: DeploymentId, cancel: CancellationToken) -> Result<DeploymentStatus> {
        let deployment = self.recover(id).await?;
        info!(
            phase = %deployment.phase,
            tasks = deployment.active_graph().task_count(),
            "starting run"
        );

        let mut run = RunState {
            deployment,
            in_flight: JoinSet::new(),
            workers: HashMap::new(),
            timers: JoinSet::new(),
            backing_off: HashSet::new(),
        };
        let mut cancelled = cancel.is_cancelled();

        loop {
            if !cancelled {
                self.dispatch_ready(&mut run).await?;
            }

            if run.in_flight.is_empty() && (cancelled || run.timers.is_empty()) {
                break;
            }
            trace!(
                in_flight = run.in_flight.len(),
                backing_off = run.backing_off.len(),
                cancelled,
                "waiting for scheduler wakeup"
            );

            tokio::select! {
                biased;

                _ = cancel.cancelled(), if !cancelled => {
                    info!(in_flight = run.in_flight.len(), "cancellation requested, draining");
                    cancelled = true;
                    run.timers.abort_all();
                }

                Some(joined) = run.in_flight.join_next_with_id(), if !run.in_flight.is_empty() => {
                    self.handle_joined(&mut run, joined, cancelled).await?;
                }

                Some(fired) = run.timers.join_next(), if !run.timers.is_empty() => {
                    if let Ok(task_id) = fired {
                        trace!(task = %task_id, "backoff elapsed");
                        run.backing_off.remove(&task_id);
                    }
                }

                else => break,
            }
        }

        self.finish(run, cancelled).await
    }

    /// Load the record and repair what a crash may have left behind.
    async fn recover(&self, id: DeploymentId) -> Result<Deployment> {
        let mut deployment = self.store.load(id).await?;

        let interrupted: Vec<TaskId> = deployment
            .active_graph()
            .tasks()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| t.id)
            .collect();
        for task_id in interrupted {
            warn!(task = %task_id, "task was running when the last run stopped, resetting to pending");
            deployment = self
                .store
                .update_task_status(id, task_id, TaskUpdate::Reset)
                .await?;
        }

        // A crash between recording a failure and skipping its dependents
        // leaves dependents pending behind a failed task.
        let failed: Vec<TaskId> = deployment
            .active_graph()
            .tasks()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| t.id)
            .collect();
        for task_id in failed {
            self.poison(&mut deployment, task_id).await?;
        }

        Ok(deployment)
    }

    async fn dispatch_ready(&self, run: &mut RunState) -> Result<()> {
        let limit = self.config.max_concurrent_operations.max(1);
        let ready: Vec<TaskId> = run
            .deployment
            .active_graph()
            .ready_tasks()
            .into_iter()
            .map(|t| t.id)
            .filter(|id| !run.backing_off.contains(id))
            .collect();

        for task_id in ready {
            if run.in_flight.len() >= limit {
                trace!(limit, "concurrency limit reached, deferring ready tasks");
                break;
            }
            self.dispatch(run, task_id).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, run: &mut RunState, task_id: TaskId) -> Result<()> {
        let id = run.deployment.id;
        // Durable before the platform is touched.
        run.deployment = self
            .store
            .update_task_status(id, task_id, TaskUpdate::Started)
            .await?;

        let Some(task) = run.deployment.active_graph().get_task(&task_id).cloned() else {
            return Ok(());
        };
        let spec = run
            .deployment
            .lab
            .resource(&task.resource)
            .cloned()
            .unwrap_or_else(|| match task.kind {
                ResourceKind::Network => ResourceSpec::network(&task.resource, &task.platform),
                ResourceKind::Compute => ResourceSpec::compute(&task.resource, &task.platform),
            });
        let placement = match task.action {
            TaskAction::Create => placement(&run.deployment, &spec),
            TaskAction::Delete => Placement::default(),
        };

        debug!(
            task = %task_id,
            resource = %task.resource,
            action = %task.action,
            platform = %task.platform,
            attempt = task.attempts,
            "dispatching task"
        );
        self.emit(SchedulerEvent::TaskStarted {
            deployment: id,
            task_id,
            resource: task.resource.clone(),
            action: task.action,
            attempt: task.attempts,
        });

        let item = WorkItem {
            deployment: id,
            task,
            spec,
            placement,
            timeout: self.config.operation_timeout,
        };
        let registry = Arc::clone(&self.registry);
        let handle = run.in_flight.spawn(async move {
            let _permit = registry.acquire(&item.task.platform).await;
            let result = match registry.get(&item.task.platform) {
                Ok(adapter) => worker::execute(adapter, &item).await,
                Err(e) => Err(PlatformError::InvalidConfig(e.to_string())),
            };
            (item.task.id, result)
        });
        run.workers.insert(handle.id(), task_id);
        Ok(())
    }

    async fn handle_joined(
        &self,
        run: &mut RunState,
        joined: std::result::Result<(Id, WorkerOutput), JoinError>,
        cancelled: bool,
    ) -> Result<()> {
        let (task_id, result) = match joined {
            Ok((worker_id, output)) => {
                run.workers.remove(&worker_id);
                output
            }
            Err(join_error) => {
                let Some(task_id) = run.workers.remove(&join_error.id()) else {
                    return Ok(());
                };
                error!(task = %task_id, error = %join_error, "worker aborted");
                (
                    task_id,
                    Err(PlatformError::Permanent(format!("worker aborted: {}", join_error))),
                )
            }
        };

        match result {
            Ok(result) => self.succeed(run, task_id, result).await,
            Err(err) => self.fail(run, task_id, err, cancelled).await,
        }
    }

    async fn succeed(&self, run: &mut RunState, task_id: TaskId, result: TaskResult) -> Result<()> {
        let id = run.deployment.id;
        run.deployment = self
            .store
            .update_task_status(id, task_id, TaskUpdate::Succeeded(result.clone()))
            .await?;
        let resource = resource_name(&run.deployment, task_id);
        debug!(task = %task_id, resource = %resource, resource_id = %result.resource_id, "task succeeded");
        self.emit(SchedulerEvent::TaskSucceeded {
            deployment: id,
            task_id,
            resource,
            result,
        });
        Ok(())
    }

    async fn fail(
        &self,
        run: &mut RunState,
        task_id: TaskId,
        err: PlatformError,
        cancelled: bool,
    ) -> Result<()> {
        let id = run.deployment.id;
        let attempts = run
            .deployment
            .active_graph()
            .get_task(&task_id)
            .map(|t| t.attempts)
            .unwrap_or_default();
        let resource = resource_name(&run.deployment, task_id);
        let message = err.to_string();

        if err.is_transient() && self.config.retry.should_retry(attempts) {
            run.deployment = self
                .store
                .update_task_status(id, task_id, TaskUpdate::Retrying(message.clone()))
                .await?;
            if cancelled {
                // Left pending; skipped once the run drains.
                return Ok(());
            }

            let delay = self.config.retry.backoff(attempts);
            warn!(
                task = %task_id,
                resource = %resource,
                attempt = attempts,
                delay = ?delay,
                error = %message,
                "transient failure, retrying"
            );
            self.emit(SchedulerEvent::TaskRetrying {
                deployment: id,
                task_id,
                resource,
                attempt: attempts,
                delay,
                error: message,
            });
            run.backing_off.insert(task_id);
            run.timers.spawn(async move {
                tokio::time::sleep(delay).await;
                task_id
            });
            return Ok(());
        }

        warn!(
            task = %task_id,
            resource = %resource,
            attempt = attempts,
            transient = err.is_transient(),
            error = %message,
            "task failed"
        );
        run.deployment = self
            .store
            .update_task_status(id, task_id, TaskUpdate::Failed(message.clone()))
            .await?;
        self.emit(SchedulerEvent::TaskFailed {
            deployment: id,
            task_id,
            resource,
            error: message,
        });

        self.poison(&mut run.deployment, task_id).await
    }

    /// Skip every pending transitive dependent of a failed task.
    async fn poison(&self, deployment: &mut Deployment, failed: TaskId) -> Result<()> {
        let graph = deployment.active_graph();
        let culprit = graph
            .get_task(&failed)
            .map(|t| t.resource.clone())
            .unwrap_or_default();
        let victims: Vec<(TaskId, String)> = graph
            .transitive_dependents(&failed)
            .into_iter()
            .filter_map(|dep| graph.get_task(&dep))
            .filter(|t| t.status == TaskStatus::Pending)
            .map(|t| (t.id, t.resource.clone()))
            .collect();

        for (task_id, resource) in victims {
            let reason = format!("dependency {} failed", culprit);
            debug!(task = %task_id, resource = %resource, reason = %reason, "skipping task");
            *deployment = self
                .store
                .update_task_status(deployment.id, task_id, TaskUpdate::Skipped(reason.clone()))
                .await?;
            self.emit(SchedulerEvent::TaskSkipped {
                deployment: deployment.id,
                task_id,
                resource,
                reason,
            });
        }
        Ok(())
    }

    async fn finish(&self, run: RunState, cancelled: bool) -> Result<DeploymentStatus> {
        let mut deployment = run.deployment;
        let id = deployment.id;

        let leftover: Vec<(TaskId, String)> = deployment
            .active_graph()
            .tasks()
            .filter(|t| t.status == TaskStatus::Pending)
            .map(|t| (t.id, t.resource.clone()))
            .collect();

        if !leftover.is_empty() {
            let reason = if cancelled {
                deployment.mark_cancelled();
                self.store.save(&deployment).await?;
                "deployment cancelled"
            } else {
                "a dependency did not succeed"
            };
            for (task_id, resource) in leftover {
                deployment = self
                    .store
                    .update_task_status(id, task_id, TaskUpdate::Skipped(reason.to_string()))
                    .await?;
                self.emit(SchedulerEvent::TaskSkipped {
                    deployment: id,
                    task_id,
                    resource,
                    reason: reason.to_string(),
                });
            }
        }

        let status = deployment.status;
        let graph = deployment.active_graph();
        info!(
            phase = %deployment.phase,
            status = %status,
            succeeded = graph.count_status(TaskStatus::Succeeded),
            failed = graph.count_status(TaskStatus::Failed),
            skipped = graph.count_status(TaskStatus::Skipped),
            "run finished"
        );
        self.emit(SchedulerEvent::DeploymentFinished {
            deployment: id,
            phase: deployment.phase,
            status,
        });
        Ok(status)
    }

    fn emit(&self, event: SchedulerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn resource_name(deployment: &Deployment, task_id: TaskId) -> String {
    deployment
        .active_graph()
        .get_task(&task_id)
        .map(|t| t.resource.clone())
        .unwrap_or_else(|| task_id.short())
}

/// Resolve where a compute lands from the results of its dependencies.
///
/// Networks are listed in reference order: those named in `depends_on`
/// first, then attachments.
pub fn placement(deployment: &Deployment, spec: &ResourceSpec) -> Placement {
    let mut placement = Placement::default();
    if spec.kind != ResourceKind::Compute {
        return placement;
    }

    let mut seen = HashSet::new();
    for reference in spec.references() {
        if !seen.insert(reference) {
            continue;
        }
        let Some(upstream) = deployment.lab.resource(reference) else {
            continue;
        };
        let Some(result) = deployment.created_resource(reference) else {
            continue;
        };
        match upstream.kind {
            ResourceKind::Network => placement.network_ids.push(result.resource_id.clone()),
            ResourceKind::Compute => {
                if let Some(address) = &result.address {
                    placement
                        .upstream_addresses
                        .insert(reference.to_string(), address.clone());
                }
            }
        }
    }
    placement
}
