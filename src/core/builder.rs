//! Compiles lab definitions into task graphs.
//!
//! `build` produces the creation graph for a lab. `build_teardown` derives
//! the deletion graph from a creation graph by reversing every edge. Both
//! are pure: no platform is contacted.

use std::collections::HashMap;

use tracing::debug;

use crate::core::dag::{DependencyKind, TaskGraph};
use crate::core::task::{TaskAction, TaskId, TaskNode, TaskStatus};
use crate::error::{Error, Result};
use crate::lab::{LabDefinition, ResourceKind};

/// Compile a lab into its creation graph.
///
/// One `create` task per resource, with an edge for every declared
/// dependency. A compute resource additionally depends on every network it
/// references, through `networks` or `depends_on`, so instance creation
/// never races network creation.
///
/// # Errors
/// - `DuplicateResource` / `Validation` for malformed names
/// - `UnresolvedReference` if a reference names no resource in the lab
/// - `InvalidReference` if a `networks` entry names a compute resource
/// - `CyclicDependency` naming one member of a cycle
pub fn build(lab: &LabDefinition) -> Result<TaskGraph> {
    lab.validate()?;

    let kinds: HashMap<&str, ResourceKind> = lab
        .resources
        .iter()
        .map(|r| (r.name.as_str(), r.kind))
        .collect();

    for spec in &lab.resources {
        for reference in spec.references() {
            if !kinds.contains_key(reference) {
                return Err(Error::UnresolvedReference {
                    resource: spec.name.clone(),
                    reference: reference.to_string(),
                });
            }
        }
        for network in &spec.networks {
            if kinds.get(network.as_str()) != Some(&ResourceKind::Network) {
                return Err(Error::InvalidReference {
                    resource: spec.name.clone(),
                    reference: network.clone(),
                    expected: ResourceKind::Network.to_string(),
                });
            }
        }
    }

    let mut graph = TaskGraph::new();
    let mut ids: HashMap<&str, TaskId> = HashMap::new();
    for spec in &lab.resources {
        let node = TaskNode::new(&spec.name, spec.kind, &spec.platform, TaskAction::Create);
        ids.insert(spec.name.as_str(), node.id);
        graph.add_task(node);
    }

    for spec in &lab.resources {
        let to = ids[spec.name.as_str()];
        for dep in &spec.depends_on {
            graph.add_dependency(&ids[dep.as_str()], &to, DependencyKind::Declared)?;
        }
        if spec.kind == ResourceKind::Compute {
            for network in spec.references() {
                if kinds[network] == ResourceKind::Network {
                    graph.add_dependency(&ids[network], &to, DependencyKind::Network)?;
                }
            }
        }
    }

    debug!(
        lab = %lab.name,
        tasks = graph.task_count(),
        dependencies = graph.dependency_count(),
        "built creation graph"
    );
    Ok(graph)
}

/// Derive the deletion graph from a creation graph.
///
/// Each delete task carries the exact reverse dependency set of its
/// creation task: a resource is deleted only after everything that was
/// built on it. A delete task's `target` is the backend id recorded by its
/// creation task, when that task succeeded.
pub fn build_teardown(creation: &TaskGraph) -> Result<TaskGraph> {
    let mut graph = TaskGraph::new();
    let mut ids: HashMap<TaskId, TaskId> = HashMap::new();

    for task in creation.tasks() {
        let mut node = TaskNode::new(&task.resource, task.kind, &task.platform, TaskAction::Delete);
        if task.status == TaskStatus::Succeeded {
            node.target = task.result.as_ref().map(|r| r.resource_id.clone());
        }
        ids.insert(task.id, node.id);
        graph.add_task(node);
    }

    for task in creation.tasks() {
        for dep in &task.depends_on {
            graph.add_dependency(&ids[&task.id], &ids[dep], DependencyKind::Reverse)?;
        }
    }

    debug!(
        tasks = graph.task_count(),
        dependencies = graph.dependency_count(),
        "built teardown graph"
    );
    Ok(graph)
}
