//! Orchestration layer.
//!
//! The scheduler drives a deployment's task graph against the platform
//! adapters, the reconciler runs teardown through the same scheduler, and
//! the orchestrator exposes both to callers as background runs.

mod engine;
mod reconciler;
mod retry;
mod scheduler;
pub mod worker;

pub use engine::Orchestrator;
pub use reconciler::Reconciler;
pub use retry::RetryPolicy;
pub use scheduler::{placement, Scheduler, SchedulerEvent};
