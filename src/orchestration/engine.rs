//! Caller-facing orchestration surface.
//!
//! The [`Orchestrator`] owns the background runs. Each deployment has at
//! most one active run (provisioning or teardown); callers submit, poll,
//! cancel and tear down by deployment id while the runs make progress on
//! the tokio runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::{build, Deployment, DeploymentId, DeploymentPhase, DeploymentSnapshot, DeploymentStatus};
use crate::lab::LabDefinition;
use crate::orchestration::{Reconciler, Scheduler, SchedulerEvent};
use crate::platform::PlatformRegistry;
use crate::state::{DeploymentStore, JsonFileStore};
use crate::{Error, Result};

const EVENT_CAPACITY: usize = 1024;

/// How a run ended: its terminal status, or the error that aborted it.
type RunOutcome = std::result::Result<DeploymentStatus, Arc<Error>>;

struct RunHandle {
    generation: u64,
    phase: DeploymentPhase,
    cancel: CancellationToken,
    done: watch::Receiver<Option<RunOutcome>>,
    task: JoinHandle<()>,
}

type Runs = Arc<Mutex<HashMap<DeploymentId, RunHandle>>>;

/// Entry point for submitting, observing and tearing down deployments.
pub struct Orchestrator {
    store: Arc<dyn DeploymentStore>,
    registry: Arc<PlatformRegistry>,
    scheduler: Arc<Scheduler>,
    reconciler: Arc<Reconciler>,
    runs: Runs,
    next_generation: AtomicU64,
    events: broadcast::Sender<SchedulerEvent>,
}

impl Orchestrator {
    /// Create an orchestrator over the given adapters and store.
    ///
    /// Per-platform limits from `config.platforms` are applied to the
    /// registry.
    pub fn new(config: &Config, mut registry: PlatformRegistry, store: Arc<dyn DeploymentStore>) -> Self {
        registry.apply_limits(&config.platforms);
        let registry = Arc::new(registry);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            config.orchestrator.clone(),
            events.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&store), Arc::clone(&scheduler)));

        Self {
            store,
            registry,
            scheduler,
            reconciler,
            runs: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            events,
        }
    }

    /// Create an orchestrator persisting to the configured state directory.
    pub fn with_file_store(config: &Config, registry: PlatformRegistry) -> Result<Self> {
        let store = JsonFileStore::open(config.state_dir()?)?;
        Ok(Self::new(config, registry, Arc::new(store)))
    }

    pub fn registry(&self) -> &PlatformRegistry {
        &self.registry
    }

    /// Receive scheduler events from every deployment.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    fn lock_runs(&self) -> MutexGuard<'_, HashMap<DeploymentId, RunHandle>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Validate a lab, persist its deployment and start provisioning.
    ///
    /// Reference, cycle and platform errors are reported here, before any
    /// platform call.
    pub async fn submit_deployment(&self, lab: LabDefinition) -> Result<DeploymentId> {
        let graph = build(&lab)?;
        for spec in &lab.resources {
            if !self.registry.contains(&spec.platform) {
                return Err(Error::PlatformNotRegistered(spec.platform.clone()));
            }
        }

        let deployment = Deployment::new(lab, graph);
        let id = deployment.id;
        self.store.save(&deployment).await?;
        info!(
            deployment = %id,
            lab = %deployment.lab.name,
            resources = deployment.graph.task_count(),
            "deployment submitted"
        );

        self.start_run(id, DeploymentPhase::Provision, None);
        Ok(id)
    }

    /// Current snapshot of a deployment.
    pub async fn get_deployment_status(&self, id: DeploymentId) -> Result<DeploymentSnapshot> {
        self.scheduler.status(id).await
    }

    /// Start tearing a deployment down.
    ///
    /// Returns once the teardown is accepted. An active provisioning run is
    /// cancelled first; teardown starts after its in-flight operations have
    /// finished. The record is removed when the teardown succeeds.
    pub async fn teardown_deployment(&self, id: DeploymentId) -> Result<()> {
        // Existence check up front so the caller gets a synchronous error.
        if !self.is_active(id) {
            self.store.load(id).await?;
        }

        let previous = {
            let runs = self.lock_runs();
            match runs.get(&id) {
                Some(run) if run.phase == DeploymentPhase::Teardown => {
                    debug!(deployment = %id, "teardown already running");
                    return Ok(());
                }
                Some(run) => {
                    info!(deployment = %id, "cancelling provisioning before teardown");
                    run.cancel.cancel();
                    Some(run.done.clone())
                }
                None => None,
            }
        };

        info!(deployment = %id, "teardown accepted");
        self.start_run(id, DeploymentPhase::Teardown, previous);
        Ok(())
    }

    /// Wait for the active run of a deployment to finish.
    ///
    /// Without an active run, returns the stored status.
    pub async fn wait(&self, id: DeploymentId) -> Result<DeploymentStatus> {
        let done = self.lock_runs().get(&id).map(|run| run.done.clone());
        match done {
            Some(done) => wait_done(done).await,
            None => Ok(self.store.load(id).await?.status),
        }
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    pub async fn wait_timeout(&self, id: DeploymentId, timeout: Duration) -> Result<DeploymentStatus> {
        tokio::time::timeout(timeout, self.wait(id))
            .await
            .map_err(|_| Error::Timeout(timeout))?
    }

    /// Stop dispatching new work for a deployment.
    ///
    /// In-flight operations finish; every task not yet started is skipped.
    pub async fn cancel_deployment(&self, id: DeploymentId) -> Result<()> {
        if let Some(run) = self.lock_runs().get(&id) {
            info!(deployment = %id, phase = %run.phase, "cancelling run");
            run.cancel.cancel();
            return Ok(());
        }
        // Nothing running; only report whether the deployment exists.
        self.store.load(id).await.map(|_| ())
    }

    /// Continue a deployment whose run was interrupted.
    ///
    /// Does nothing if a run is active or the deployment is terminal.
    pub async fn resume_deployment(&self, id: DeploymentId) -> Result<()> {
        if self.is_active(id) {
            return Ok(());
        }
        let deployment = self.store.load(id).await?;
        if deployment.status.is_terminal() {
            debug!(deployment = %id, status = %deployment.status, "nothing to resume");
            return Ok(());
        }
        info!(deployment = %id, phase = %deployment.phase, "resuming deployment");
        self.start_run(id, deployment.phase, None);
        Ok(())
    }

    /// Resume every stored deployment that is not terminal.
    ///
    /// Meant for process startup, after a crash. Returns the resumed ids.
    pub async fn resume_incomplete(&self) -> Result<Vec<DeploymentId>> {
        let mut resumed = Vec::new();
        for deployment in self.store.list().await? {
            if deployment.status.is_terminal() || self.is_active(deployment.id) {
                continue;
            }
            info!(deployment = %deployment.id, phase = %deployment.phase, "resuming deployment");
            self.start_run(deployment.id, deployment.phase, None);
            resumed.push(deployment.id);
        }
        Ok(resumed)
    }

    /// Delete a deployment record without touching any platform.
    ///
    /// Resources it created are left in place.
    pub async fn purge_deployment(&self, id: DeploymentId) -> Result<()> {
        if self.is_active(id) {
            return Err(Error::DeploymentBusy(id));
        }
        self.store.delete(id).await?;
        warn!(deployment = %id, "deployment record purged");
        Ok(())
    }

    /// Snapshots of every stored deployment, oldest first.
    pub async fn list_deployments(&self) -> Result<Vec<DeploymentSnapshot>> {
        Ok(self
            .store
            .list()
            .await?
            .iter()
            .map(Deployment::snapshot)
            .collect())
    }

    /// Whether a run is active for the deployment.
    pub fn is_active(&self, id: DeploymentId) -> bool {
        self.lock_runs().contains_key(&id)
    }

    /// Cancel every active run and wait for them to drain.
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut runs = self.lock_runs();
            runs.drain()
                .map(|(_, run)| {
                    run.cancel.cancel();
                    run.task
                })
                .collect()
        };
        info!(runs = tasks.len(), "shutting down");
        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!(error = %e, "run task ended abnormally");
            }
        }
    }

    fn start_run(
        &self,
        id: DeploymentId,
        phase: DeploymentPhase,
        after: Option<watch::Receiver<Option<RunOutcome>>>,
    ) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(None);

        let scheduler = Arc::clone(&self.scheduler);
        let reconciler = Arc::clone(&self.reconciler);
        let runs = Arc::clone(&self.runs);
        let token = cancel.clone();

        // Hold the map while spawning so the run cannot finish and try to
        // deregister before it is registered.
        let mut map = self.lock_runs();
        let task = tokio::spawn(async move {
            if let Some(previous) = after {
                let _ = wait_done(previous).await;
            }

            let result = match phase {
                DeploymentPhase::Provision => scheduler.run(id, token).await,
                DeploymentPhase::Teardown => reconciler.teardown(id, token).await,
            };
            let outcome = match result {
                Ok(status) => {
                    info!(deployment = %id, phase = %phase, status = %status, "run complete");
                    Ok(status)
                }
                Err(e) => {
                    error!(deployment = %id, phase = %phase, error = %e, "run aborted");
                    Err(Arc::new(e))
                }
            };

            {
                let mut runs = runs.lock().unwrap_or_else(|e| e.into_inner());
                if runs.get(&id).map(|r| r.generation) == Some(generation) {
                    runs.remove(&id);
                }
            }
            let _ = done_tx.send(Some(outcome));
        });

        map.insert(
            id,
            RunHandle {
                generation,
                phase,
                cancel,
                done: done_rx,
                task,
            },
        );
    }
}

async fn wait_done(mut done: watch::Receiver<Option<RunOutcome>>) -> Result<DeploymentStatus> {
    let outcome: Option<RunOutcome> = {
        let value = done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::TaskJoin("run ended without reporting an outcome".to_string()))?;
        Option::clone(&value)
    };
    match outcome {
        Some(Ok(status)) => Ok(status),
        Some(Err(e)) => Err(Error::RunAborted(e)),
        None => Err(Error::TaskJoin("run ended without reporting an outcome".to_string())),
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("active_runs", &self.lock_runs().len())
            .finish()
    }
}
