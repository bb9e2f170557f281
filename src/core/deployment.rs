//! Deployment records.
//!
//! A deployment is one execution of a lab definition: the lab, its creation
//! graph, an optional teardown graph and the overall status derived from
//! task statuses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::dag::TaskGraph;
use crate::core::task::{TaskAction, TaskId, TaskResult, TaskStatus, TaskUpdate};
use crate::error::{Error, Result};
use crate::lab::{LabDefinition, LabId, ResourceKind};

/// Unique identifier for a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentId(pub Uuid);

impl DeploymentId {
    /// Create a new unique deployment identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for DeploymentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for DeploymentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Overall deployment status, derived from task statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Nothing dispatched yet.
    Pending,
    /// At least one task started and more work remains.
    Running,
    /// Every task succeeded.
    Succeeded,
    /// Every task is terminal and at least one failed.
    Failed,
    /// The run was cancelled; unstarted tasks were skipped.
    Cancelled,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Succeeded | DeploymentStatus::Failed | DeploymentStatus::Cancelled
        )
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentStatus::Pending => write!(f, "pending"),
            DeploymentStatus::Running => write!(f, "running"),
            DeploymentStatus::Succeeded => write!(f, "succeeded"),
            DeploymentStatus::Failed => write!(f, "failed"),
            DeploymentStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Which graph a deployment is currently executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentPhase {
    Provision,
    Teardown,
}

impl std::fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentPhase::Provision => write!(f, "provision"),
            DeploymentPhase::Teardown => write!(f, "teardown"),
        }
    }
}

/// Durable record of one deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub lab_id: LabId,
    /// The submitted lab, kept for the resource configuration payloads.
    pub lab: LabDefinition,
    pub phase: DeploymentPhase,
    /// Creation graph.
    pub graph: TaskGraph,
    /// Deletion graph, present once teardown has started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teardown: Option<TaskGraph>,
    /// Set when the current phase's run was cancelled.
    #[serde(default)]
    pub cancelled: bool,
    pub status: DeploymentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    /// Create a deployment for a lab and its compiled creation graph.
    pub fn new(lab: LabDefinition, graph: TaskGraph) -> Self {
        let now = Utc::now();
        let mut deployment = Self {
            id: DeploymentId::new(),
            lab_id: lab.id,
            lab,
            phase: DeploymentPhase::Provision,
            graph,
            teardown: None,
            cancelled: false,
            status: DeploymentStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        deployment.refresh_status();
        deployment
    }

    /// The graph of the current phase.
    pub fn active_graph(&self) -> &TaskGraph {
        match (&self.phase, &self.teardown) {
            (DeploymentPhase::Teardown, Some(teardown)) => teardown,
            _ => &self.graph,
        }
    }

    fn active_graph_mut(&mut self) -> &mut TaskGraph {
        match (&self.phase, &mut self.teardown) {
            (DeploymentPhase::Teardown, Some(teardown)) => teardown,
            _ => &mut self.graph,
        }
    }

    /// Apply a task transition in the active graph and re-derive status.
    pub fn apply(&mut self, task_id: &TaskId, update: TaskUpdate) -> Result<()> {
        self.active_graph_mut().apply(task_id, update)?;
        self.touch();
        Ok(())
    }

    /// Switch to the teardown phase with the given deletion graph.
    pub fn begin_teardown(&mut self, teardown: TaskGraph) {
        self.phase = DeploymentPhase::Teardown;
        self.teardown = Some(teardown);
        self.cancelled = false;
        self.touch();
    }

    /// Record that the current run was cancelled.
    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.refresh_status();
    }

    /// Re-derive the overall status from the active graph.
    pub fn refresh_status(&mut self) {
        self.status = derive_status(self.active_graph(), self.cancelled);
    }

    /// Result of the succeeded creation task for a resource.
    pub fn created_resource(&self, resource: &str) -> Option<&TaskResult> {
        self.graph
            .find_by_resource(resource)
            .filter(|t| t.status == TaskStatus::Succeeded)
            .and_then(|t| t.result.as_ref())
    }

    /// Build a caller-facing snapshot.
    pub fn snapshot(&self) -> DeploymentSnapshot {
        let graph = self.active_graph();
        let ordered: Vec<_> = match graph.topological_order() {
            Ok(order) => order,
            Err(_) => graph.tasks().collect(),
        };

        DeploymentSnapshot {
            id: self.id,
            lab_id: self.lab_id,
            lab_name: self.lab.name.clone(),
            phase: self.phase,
            status: self.status,
            tasks: ordered
                .into_iter()
                .map(|t| TaskSnapshot {
                    id: t.id,
                    resource: t.resource.clone(),
                    kind: t.kind,
                    action: t.action,
                    status: t.status,
                    attempts: t.attempts,
                    last_error: t.last_error.clone(),
                    result: t.result.clone(),
                })
                .collect(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Derive a deployment status from its active graph.
///
/// Cancellation wins over failure once everything is terminal, so a caller
/// can tell a stopped run from one that failed on its own.
pub fn derive_status(graph: &TaskGraph, cancelled: bool) -> DeploymentStatus {
    let total = graph.task_count();
    let succeeded = graph.count_status(TaskStatus::Succeeded);
    if succeeded == total {
        return DeploymentStatus::Succeeded;
    }

    if graph.all_finished() {
        if cancelled {
            return DeploymentStatus::Cancelled;
        }
        return DeploymentStatus::Failed;
    }

    let untouched = graph
        .tasks()
        .all(|t| t.status == TaskStatus::Pending && t.attempts == 0);
    if untouched && !cancelled {
        DeploymentStatus::Pending
    } else {
        DeploymentStatus::Running
    }
}

/// Per-task view in a deployment snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub resource: String,
    pub kind: ResourceKind,
    pub action: TaskAction,
    pub status: TaskStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
}

/// Point-in-time view of a deployment for status polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSnapshot {
    pub id: DeploymentId,
    pub lab_id: LabId,
    pub lab_name: String,
    pub phase: DeploymentPhase,
    pub status: DeploymentStatus,
    /// Tasks of the active phase in dependency order.
    pub tasks: Vec<TaskSnapshot>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeploymentSnapshot {
    /// Look up a task by logical resource name.
    pub fn task(&self, resource: &str) -> Option<&TaskSnapshot> {
        self.tasks.iter().find(|t| t.resource == resource)
    }

    fn resources_with(&self, status: TaskStatus) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| t.status == status)
            .map(|t| t.resource.clone())
            .collect()
    }

    /// Turn a failed or cancelled deployment into a `PartialFailure` error.
    pub fn into_result(self) -> Result<Self> {
        match self.status {
            DeploymentStatus::Failed | DeploymentStatus::Cancelled => Err(Error::PartialFailure {
                succeeded: self.resources_with(TaskStatus::Succeeded),
                failed: self.resources_with(TaskStatus::Failed),
                skipped: self.resources_with(TaskStatus::Skipped),
            }),
            _ => Ok(self),
        }
    }
}
