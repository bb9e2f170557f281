//! Task data model for the deployment graph.
//!
//! A task is one lifecycle action (create or delete) on one resource of a
//! lab. Tasks track status, attempt count, last error and the result the
//! platform returned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::lab::ResourceKind;

/// Unique identifier for a task within a deployment.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle action a task performs on its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Create,
    Delete,
}

impl std::fmt::Display for TaskAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskAction::Create => write!(f, "create"),
            TaskAction::Delete => write!(f, "delete"),
        }
    }
}

/// Task status in its lifecycle.
///
/// `Pending` covers both "waiting on dependencies" and "waiting for a retry
/// backoff to expire". `Succeeded`, `Failed` and `Skipped` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not yet dispatched.
    Pending,
    /// A worker is executing the platform operation.
    Running,
    /// Platform operation completed.
    Succeeded,
    /// Platform operation failed permanently or ran out of retries.
    Failed,
    /// Never attempted: a dependency failed or the run was cancelled.
    Skipped,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    /// Whether no further transition can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// What the platform handed back for a successful operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Backend identifier of the resource (instance id, network id).
    pub resource_id: String,
    /// Address assigned to a compute instance, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl TaskResult {
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            address: None,
        }
    }

    pub fn with_address(mut self, address: Option<String>) -> Self {
        self.address = address;
        self
    }
}

/// A status transition applied to a task by the scheduler.
///
/// Every transition goes through [`TaskNode::apply`] so the store and the
/// scheduler's working copy always agree on the resulting record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskUpdate {
    /// Dispatched to a worker; bumps the attempt count.
    Started,
    /// Completed with the given result.
    Succeeded(TaskResult),
    /// Transient failure; back to pending until the backoff expires.
    Retrying(String),
    /// Terminal failure.
    Failed(String),
    /// Never attempted.
    Skipped(String),
    /// Recovered after a crash: a task left running is pending again.
    Reset,
}

/// A single task in the deployment graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Logical name of the resource this task acts on.
    pub resource: String,
    /// Kind of the resource.
    pub kind: ResourceKind,
    /// Platform target hosting the resource.
    pub platform: String,
    /// Create or delete.
    pub action: TaskAction,
    /// Tasks that must succeed before this one may start.
    #[serde(default)]
    pub depends_on: BTreeSet<TaskId>,
    /// Current execution status.
    pub status: TaskStatus,
    /// Number of times the task has been dispatched.
    #[serde(default)]
    pub attempts: u32,
    /// Last error seen, kept across retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Result payload once succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    /// Backend id to delete; known up front for delete tasks whose create succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// When the latest attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskNode {
    /// Create a pending task for the given resource and action.
    pub fn new(resource: &str, kind: ResourceKind, platform: &str, action: TaskAction) -> Self {
        Self {
            id: TaskId::new(),
            resource: resource.to_string(),
            kind,
            platform: platform.to_string(),
            action,
            depends_on: BTreeSet::new(),
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
            result: None,
            target: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Apply a status transition.
    pub fn apply(&mut self, update: TaskUpdate) {
        match update {
            TaskUpdate::Started => {
                self.status = TaskStatus::Running;
                self.attempts += 1;
                self.started_at = Some(Utc::now());
            }
            TaskUpdate::Succeeded(result) => {
                self.status = TaskStatus::Succeeded;
                self.result = Some(result);
                self.finished_at = Some(Utc::now());
            }
            TaskUpdate::Retrying(error) => {
                self.status = TaskStatus::Pending;
                self.last_error = Some(error);
            }
            TaskUpdate::Failed(error) => {
                self.status = TaskStatus::Failed;
                self.last_error = Some(error);
                self.finished_at = Some(Utc::now());
            }
            TaskUpdate::Skipped(reason) => {
                self.status = TaskStatus::Skipped;
                self.last_error = Some(reason);
                self.finished_at = Some(Utc::now());
            }
            TaskUpdate::Reset => {
                if self.status == TaskStatus::Running {
                    self.status = TaskStatus::Pending;
                }
            }
        }
    }

    /// Check if the task is in a terminal state.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if the task can be dispatched once its dependencies allow it.
    pub fn can_start(&self) -> bool {
        self.status == TaskStatus::Pending
    }
}
