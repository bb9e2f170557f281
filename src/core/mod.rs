//! Core domain models for deployment orchestration.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestrator: tasks, the task graph, its builder and deployments.

pub mod builder;
pub mod dag;
pub mod deployment;
pub mod task;

pub use builder::{build, build_teardown};
pub use dag::{DependencyKind, TaskGraph};
pub use deployment::{
    Deployment, DeploymentId, DeploymentPhase, DeploymentSnapshot, DeploymentStatus, TaskSnapshot,
};
pub use task::{TaskAction, TaskId, TaskNode, TaskResult, TaskStatus, TaskUpdate};
