//! Adapter contract tests.
//!
//! The orchestrator only relies on the `PlatformAdapter` trait. These tests
//! exercise that contract through a trait object, the way the worker sees a
//! backend.

use std::sync::Arc;

use glassdome::core::DeploymentId;
use glassdome::lab::{ResourceKind, ResourceSpec};
use glassdome::platform::{
    ErrorClass, InMemoryPlatform, Placement, PlatformAdapter, PlatformError, ResourceKey,
    ResourceState,
};

fn adapter() -> Arc<dyn PlatformAdapter> {
    Arc::new(InMemoryPlatform::new("mem"))
}

/// Test: Full lifecycle through the trait
/// Given a backend behind `dyn PlatformAdapter`
/// When a network and an instance on it are created, inspected and deleted
/// Then each step reports the state the orchestrator expects
#[tokio::test]
async fn test_adapter_lifecycle() {
    let adapter = adapter();
    let deployment = DeploymentId::new();
    let net_key = ResourceKey::new(deployment, "net-a");
    let vm_key = ResourceKey::new(deployment, "vm-1");

    let net = adapter
        .create_network(&net_key, &ResourceSpec::network("net-a", "mem"))
        .await
        .unwrap();
    let placement = Placement {
        network_ids: vec![net.network_id.clone()],
        ..Default::default()
    };
    let vm = adapter
        .create_compute(&vm_key, &ResourceSpec::compute("vm-1", "mem").attach("net-a"), &placement)
        .await
        .unwrap();
    adapter.start_compute(&vm.compute_id).await.unwrap();

    let status = adapter.get_status(ResourceKind::Compute, &vm_key).await.unwrap();
    assert!(status.exists);
    assert_eq!(status.resource_id.as_deref(), Some(vm.compute_id.as_str()));
    assert_eq!(status.state, ResourceState::Running);
    assert_eq!(status.address, vm.address);

    adapter.stop_compute(&vm.compute_id).await.unwrap();
    adapter.delete_compute(&vm.compute_id).await.unwrap();
    adapter.delete_network(&net.network_id).await.unwrap();

    let status = adapter.get_status(ResourceKind::Compute, &vm_key).await.unwrap();
    assert!(!status.exists);
}

/// Test: Deleting twice
/// Given an instance that was already deleted
/// When it is deleted again
/// Then the backend reports not found, which callers treat as success
#[tokio::test]
async fn test_second_delete_reports_not_found() {
    let adapter = adapter();
    let key = ResourceKey::new(DeploymentId::new(), "vm-1");
    let vm = adapter
        .create_compute(&key, &ResourceSpec::compute("vm-1", "mem"), &Placement::default())
        .await
        .unwrap();

    adapter.delete_compute(&vm.compute_id).await.unwrap();
    let err = adapter.delete_compute(&vm.compute_id).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.class(), ErrorClass::Permanent);
}

/// Test: Keys are scoped to their deployment
/// Given the same resource name created by two deployments
/// When each key is looked up
/// Then each finds its own resource
#[tokio::test]
async fn test_status_lookup_is_per_deployment() {
    let adapter = adapter();
    let spec = ResourceSpec::network("net-a", "mem");
    let first = ResourceKey::new(DeploymentId::new(), "net-a");
    let second = ResourceKey::new(DeploymentId::new(), "net-a");
    assert_ne!(first.to_string(), second.to_string());

    let a = adapter.create_network(&first, &spec).await.unwrap();
    let b = adapter.create_network(&second, &spec).await.unwrap();

    let found = adapter.get_status(ResourceKind::Network, &first).await.unwrap();
    assert_eq!(found.resource_id, Some(a.network_id));
    let found = adapter.get_status(ResourceKind::Network, &second).await.unwrap();
    assert_eq!(found.resource_id, Some(b.network_id));

    let wrong_kind = adapter.get_status(ResourceKind::Compute, &first).await.unwrap();
    assert!(!wrong_kind.exists);
}

/// Test: Deployments sharing an id prefix
/// Given two deployment ids with the same first eight characters
/// When each creates a resource with the same name and looks it up
/// Then the keys differ and each lookup finds only its own resource
#[tokio::test]
async fn test_keys_distinguish_ids_with_shared_prefix() {
    let adapter = adapter();
    let first: DeploymentId = "deadbeef-0000-4000-8000-000000000000".parse().unwrap();
    let second: DeploymentId = "deadbeef-1111-4000-8000-000000000000".parse().unwrap();
    assert_eq!(first.short(), second.short());

    let first_key = ResourceKey::new(first, "vm-1");
    let second_key = ResourceKey::new(second, "vm-1");
    assert_ne!(first_key.to_string(), second_key.to_string());

    let vm = adapter
        .create_compute(&first_key, &ResourceSpec::compute("vm-1", "mem"), &Placement::default())
        .await
        .unwrap();

    let other = adapter.get_status(ResourceKind::Compute, &second_key).await.unwrap();
    assert!(!other.exists);
    let own = adapter.get_status(ResourceKind::Compute, &first_key).await.unwrap();
    assert_eq!(own.resource_id, Some(vm.compute_id));
}

/// Test: Key format
/// Given a deployment id and a resource name
/// When the idempotency key is rendered
/// Then it carries the full deployment id and the name
#[test]
fn test_resource_key_format() {
    let deployment = DeploymentId::new();
    let key = ResourceKey::new(deployment, "dc-1");
    assert_eq!(key.to_string(), format!("gd-{}-dc-1", deployment));
    assert_eq!(key.resource(), "dc-1");
    assert_eq!(key.deployment(), deployment);
}

/// Test: Error classification
/// Given each kind of platform failure
/// When it is classified
/// Then only timeouts, refused connections, rate limits and transient errors are retryable
#[test]
fn test_error_classification() {
    let transient = [
        PlatformError::Timeout(std::time::Duration::from_secs(1)),
        PlatformError::ConnectionRefused("api".into()),
        PlatformError::RateLimited("429".into()),
        PlatformError::Transient("busy".into()),
    ];
    let permanent = [
        PlatformError::NotFound("vm".into()),
        PlatformError::InvalidConfig("bad image".into()),
        PlatformError::capability_missing("mem", "snapshot"),
        PlatformError::Permanent("quota".into()),
    ];

    assert!(transient.iter().all(PlatformError::is_transient));
    assert!(permanent.iter().all(|e| e.class() == ErrorClass::Permanent));
}
