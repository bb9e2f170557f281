//! Glassdome deployment orchestration.
//!
//! Turns a lab definition (networks and compute instances spread over one
//! or more infrastructure backends) into a dependency graph of platform
//! operations, executes it with bounded concurrency and retries, persists
//! every transition so runs survive a crash, and tears labs down in reverse
//! dependency order.
//!
//! ```ignore
//! use std::sync::Arc;
//! use glassdome::config::Config;
//! use glassdome::lab::{LabDefinition, ResourceSpec};
//! use glassdome::orchestration::Orchestrator;
//! use glassdome::platform::{InMemoryPlatform, PlatformRegistry};
//!
//! let mut registry = PlatformRegistry::new();
//! registry.register("proxmox", Arc::new(InMemoryPlatform::new("proxmox")));
//! let orchestrator = Orchestrator::with_file_store(&Config::load()?, registry)?;
//!
//! let lab = LabDefinition::new("web")
//!     .with_resource(ResourceSpec::network("net-a", "proxmox"))
//!     .with_resource(ResourceSpec::compute("vm-1", "proxmox").attach("net-a"));
//! let id = orchestrator.submit_deployment(lab).await?;
//! let status = orchestrator.wait(id).await?;
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod lab;
pub mod log;
pub mod orchestration;
pub mod platform;
pub mod state;
pub mod util;

pub use error::{Error, Result};
