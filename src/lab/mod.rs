//! Lab definitions submitted for deployment.
//!
//! A lab is a named collection of networks and compute instances that are
//! deployed together. Definitions are immutable once submitted.

mod types;

pub use types::{LabDefinition, LabId, ResourceKind, ResourceSpec};
