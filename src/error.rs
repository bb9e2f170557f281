use std::sync::Arc;

use thiserror::Error;

use crate::core::DeploymentId;
use crate::platform::PlatformError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Resource {resource} references unknown resource {reference}")]
    UnresolvedReference { resource: String, reference: String },

    #[error("Cyclic dependency involving resource {resource}")]
    CyclicDependency { resource: String },

    #[error("Duplicate resource name: {0}")]
    DuplicateResource(String),

    #[error("Resource {resource} references {reference}, which is not a {expected}")]
    InvalidReference {
        resource: String,
        reference: String,
        expected: String,
    },

    #[error("Deployment not found: {0}")]
    DeploymentNotFound(DeploymentId),

    #[error("Deployment is busy: {0}")]
    DeploymentBusy(DeploymentId),

    #[error("No platform adapter registered for target: {0}")]
    PlatformNotRegistered(String),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error(
        "Deployment partially failed: {} succeeded, failed: [{}], skipped: [{}]",
        succeeded.len(),
        failed.join(", "),
        skipped.join(", ")
    )]
    PartialFailure {
        succeeded: Vec<String>,
        failed: Vec<String>,
        skipped: Vec<String>,
    },

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("State store error: {0}")]
    Storage(String),

    /// A background run stopped on an error before reaching a terminal
    /// status. Every waiter on the run shares the same underlying error.
    #[error("Run aborted: {0}")]
    RunAborted(Arc<Error>),
}

impl Error {
    /// The error that caused an aborted run, or `self` for any other error.
    pub fn root(&self) -> &Error {
        match self {
            Error::RunAborted(inner) => inner.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
