//! Core lab type definitions.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Unique identifier for a lab definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabId(pub Uuid);

impl LabId {
    /// Create a new unique lab identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for LabId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for LabId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Kind of infrastructure resource a spec describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A virtual network or subnet.
    Network,
    /// A compute instance (VM).
    Compute,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Network => write!(f, "network"),
            ResourceKind::Compute => write!(f, "compute"),
        }
    }
}

/// One resource in a lab.
///
/// The `config` payload is backend-specific and opaque to the orchestrator;
/// it is handed to the platform adapter untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Network or compute.
    pub kind: ResourceKind,
    /// Logical name, unique within the lab.
    pub name: String,
    /// Identifier of the platform backend that hosts this resource.
    pub platform: String,
    /// Backend-specific configuration.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Logical names this resource depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Logical names of the networks a compute instance attaches to.
    #[serde(default)]
    pub networks: Vec<String>,
}

impl ResourceSpec {
    fn new(kind: ResourceKind, name: &str, platform: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            platform: platform.to_string(),
            config: serde_json::Value::Null,
            depends_on: Vec::new(),
            networks: Vec::new(),
        }
    }

    /// Create a network spec hosted on `platform`.
    pub fn network(name: &str, platform: &str) -> Self {
        Self::new(ResourceKind::Network, name, platform)
    }

    /// Create a compute spec hosted on `platform`.
    pub fn compute(name: &str, platform: &str) -> Self {
        Self::new(ResourceKind::Compute, name, platform)
    }

    /// Declare a dependency on another resource by logical name.
    pub fn depends_on(mut self, name: &str) -> Self {
        self.depends_on.push(name.to_string());
        self
    }

    /// Attach a compute instance to a network by logical name.
    pub fn attach(mut self, network: &str) -> Self {
        self.networks.push(network.to_string());
        self
    }

    /// Set the backend-specific configuration payload.
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// All logical names this spec references, declared dependencies first.
    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.depends_on
            .iter()
            .chain(self.networks.iter())
            .map(String::as_str)
    }
}

/// A set of resources deployed together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabDefinition {
    /// Unique identifier for this definition.
    pub id: LabId,
    /// Human-readable lab name.
    pub name: String,
    /// Resources in declaration order.
    pub resources: Vec<ResourceSpec>,
}

impl LabDefinition {
    /// Create an empty lab definition.
    pub fn new(name: &str) -> Self {
        Self {
            id: LabId::new(),
            name: name.to_string(),
            resources: Vec::new(),
        }
    }

    /// Add a resource, builder style.
    pub fn with_resource(mut self, spec: ResourceSpec) -> Self {
        self.resources.push(spec);
        self
    }

    /// Look up a resource by logical name.
    pub fn resource(&self, name: &str) -> Option<&ResourceSpec> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// Check that names are present and unique.
    ///
    /// Reference resolution is left to the graph builder.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("Lab name cannot be empty".to_string()));
        }

        let mut seen = HashSet::new();
        for spec in &self.resources {
            if spec.name.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "Lab {} contains a resource with an empty name",
                    self.name
                )));
            }
            if spec.platform.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "Resource {} has no platform target",
                    spec.name
                )));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(Error::DuplicateResource(spec.name.clone()));
            }
        }
        Ok(())
    }
}
