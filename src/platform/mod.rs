//! Platform adapter abstraction.
//!
//! The orchestrator reaches every infrastructure backend (on-premise
//! hypervisors, public clouds) through the narrow `PlatformAdapter` trait.
//! One implementation exists per backend; the orchestrator never depends
//! on a concrete one.
//!
//! Every adapter classifies its own failures as transient or permanent so
//! the scheduler can decide whether to retry.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::core::DeploymentId;
use crate::lab::{ResourceKind, ResourceSpec};

pub mod memory;
mod registry;

pub use memory::InMemoryPlatform;
pub use registry::PlatformRegistry;

/// Result type for platform operations.
pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// Retry classification of a platform failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retrying may succeed (timeouts, refused connections, rate limits).
    Transient,
    /// Retrying cannot help.
    Permanent,
}

/// Failure reported by a platform adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{backend} does not support {operation}")]
    CapabilityMissing { backend: String, operation: String },

    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl PlatformError {
    /// Classify the failure for the retry policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            PlatformError::Timeout(_)
            | PlatformError::ConnectionRefused(_)
            | PlatformError::RateLimited(_)
            | PlatformError::Transient(_) => ErrorClass::Transient,
            PlatformError::NotFound(_)
            | PlatformError::InvalidConfig(_)
            | PlatformError::CapabilityMissing { .. }
            | PlatformError::Permanent(_) => ErrorClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::NotFound(_))
    }

    /// Error for an operation a backend cannot perform.
    pub fn capability_missing(backend: &str, operation: &str) -> Self {
        PlatformError::CapabilityMissing {
            backend: backend.to_string(),
            operation: operation.to_string(),
        }
    }
}

/// Client-supplied idempotency key for a platform resource.
///
/// Derived from the deployment and the logical resource name, so every
/// attempt to create the same resource uses the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    deployment: DeploymentId,
    resource: String,
}

impl ResourceKey {
    pub fn new(deployment: DeploymentId, resource: &str) -> Self {
        Self {
            deployment,
            resource: resource.to_string(),
        }
    }

    pub fn deployment(&self) -> DeploymentId {
        self.deployment
    }

    /// Logical resource name within the lab.
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gd-{}-{}", self.deployment, self.resource)
    }
}

/// Handle returned by `create_network`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkHandle {
    pub network_id: String,
}

/// Handle returned by `create_compute`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeHandle {
    pub compute_id: String,
    pub address: Option<String>,
}

/// Observed state of a platform resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Provisioning,
    /// A network ready for attachments.
    Available,
    Running,
    Stopped,
    Unknown,
}

/// Answer to an existence check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceStatus {
    pub exists: bool,
    pub resource_id: Option<String>,
    pub state: ResourceState,
    pub address: Option<String>,
}

impl ResourceStatus {
    /// Status of a resource the backend does not know.
    pub fn absent() -> Self {
        Self {
            exists: false,
            resource_id: None,
            state: ResourceState::Unknown,
            address: None,
        }
    }
}

/// Where a compute instance is placed, resolved from its dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placement {
    /// Backend ids of the networks to attach, in declaration order.
    pub network_ids: Vec<String>,
    /// Addresses of upstream compute instances keyed by logical name.
    pub upstream_addresses: BTreeMap<String, String>,
}

/// Capability interface over one infrastructure backend.
///
/// Implementations must be safe to call concurrently. Deletes report
/// `NotFound` for resources that are already gone; the orchestrator treats
/// that as success. A backend that cannot perform an operation must return
/// `PlatformError::CapabilityMissing` rather than silently succeed.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Backend name (for logging).
    fn name(&self) -> &str;

    /// Create a network tagged with `key`.
    async fn create_network(&self, key: &ResourceKey, spec: &ResourceSpec)
        -> PlatformResult<NetworkHandle>;

    /// Delete a network by backend id.
    async fn delete_network(&self, network_id: &str) -> PlatformResult<()>;

    /// Create a compute instance tagged with `key`.
    async fn create_compute(
        &self,
        key: &ResourceKey,
        spec: &ResourceSpec,
        placement: &Placement,
    ) -> PlatformResult<ComputeHandle>;

    /// Boot a created compute instance.
    async fn start_compute(&self, compute_id: &str) -> PlatformResult<()>;

    /// Stop a running compute instance.
    async fn stop_compute(&self, _compute_id: &str) -> PlatformResult<()> {
        Err(PlatformError::capability_missing(self.name(), "stop_compute"))
    }

    /// Delete a compute instance by backend id.
    async fn delete_compute(&self, compute_id: &str) -> PlatformResult<()>;

    /// Look up the resource created under `key`.
    async fn get_status(&self, kind: ResourceKind, key: &ResourceKey)
        -> PlatformResult<ResourceStatus>;
}
