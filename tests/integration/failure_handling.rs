//! Failure handling tests.
//!
//! These tests inject platform faults and verify retry classification,
//! bounded retries, poisoning of dependents and the idempotent recreate
//! path after a lost response.

use std::time::Duration;

use glassdome::core::{DeploymentStatus, TaskStatus};
use glassdome::lab::{LabDefinition, ResourceSpec};
use glassdome::orchestration::SchedulerEvent;
use glassdome::platform::memory::{Fault, Operation};
use glassdome::platform::{InMemoryPlatform, PlatformError};
use glassdome::Error;

use crate::fixtures::{chain_lab, drain, fast_config, web_lab, Harness, TARGET};

/// Test: Permanent failure poisons dependents
/// Given the web lab with creation of vm-1 failing permanently
/// When the deployment runs
/// Then vm-1 fails, vm-2 is skipped without a platform call and net-a stays created
#[tokio::test]
async fn test_permanent_failure_skips_dependents() {
    let h = Harness::new();
    h.platform.fail_next(
        Operation::CreateCompute,
        "vm-1",
        PlatformError::InvalidConfig("image not found".into()),
    );

    let (id, status) = h.deploy(web_lab()).await;
    assert_eq!(status, DeploymentStatus::Failed);

    let snapshot = h.orchestrator.get_deployment_status(id).await.unwrap();
    let vm1 = snapshot.task("vm-1").unwrap();
    assert_eq!(vm1.status, TaskStatus::Failed);
    assert_eq!(vm1.attempts, 1, "permanent failures are not retried");
    assert!(vm1.last_error.as_ref().unwrap().contains("image not found"));

    let vm2 = snapshot.task("vm-2").unwrap();
    assert_eq!(vm2.status, TaskStatus::Skipped);
    assert_eq!(vm2.attempts, 0);
    assert!(vm2.last_error.as_ref().unwrap().contains("vm-1"));

    assert_eq!(snapshot.task("net-a").unwrap().status, TaskStatus::Succeeded);
    assert_eq!(h.platform.call_count(Operation::CreateCompute, "vm-2"), 0);
    assert_eq!(h.platform.resource_count("net-a"), 1);

    match snapshot.into_result() {
        Err(Error::PartialFailure {
            succeeded,
            failed,
            skipped,
        }) => {
            assert_eq!(succeeded, vec!["net-a".to_string()]);
            assert_eq!(failed, vec!["vm-1".to_string()]);
            assert_eq!(skipped, vec!["vm-2".to_string()]);
        }
        other => panic!("expected partial failure, got {:?}", other),
    }
}

/// Test: Independent branches keep going
/// Given two instances on one network, one of which fails permanently
/// When the deployment runs
/// Then the other instance is still created
#[tokio::test]
async fn test_failure_does_not_stop_independent_branch() {
    let h = Harness::new();
    let lab = LabDefinition::new("pair")
        .with_resource(ResourceSpec::network("net-a", TARGET))
        .with_resource(ResourceSpec::compute("vm-1", TARGET).attach("net-a"))
        .with_resource(ResourceSpec::compute("vm-2", TARGET).attach("net-a"));
    h.platform.fail_next(
        Operation::CreateCompute,
        "vm-1",
        PlatformError::Permanent("quota exceeded".into()),
    );

    let (id, status) = h.deploy(lab).await;
    assert_eq!(status, DeploymentStatus::Failed);

    let snapshot = h.orchestrator.get_deployment_status(id).await.unwrap();
    assert_eq!(snapshot.task("vm-2").unwrap().status, TaskStatus::Succeeded);
    assert_eq!(h.platform.resource_count("vm-2"), 1);
}

/// Test: Transient failure is retried
/// Given a rate-limit error on the first creation of net-a
/// When the deployment runs
/// Then net-a succeeds on its second attempt and a retry event is emitted
#[tokio::test]
async fn test_transient_failure_is_retried() {
    let h = Harness::new();
    let mut events = h.orchestrator.subscribe();
    h.platform.fail_next(
        Operation::CreateNetwork,
        "net-a",
        PlatformError::RateLimited("429".into()),
    );

    let (id, status) = h.deploy(web_lab()).await;
    assert_eq!(status, DeploymentStatus::Succeeded);

    let snapshot = h.orchestrator.get_deployment_status(id).await.unwrap();
    let net = snapshot.task("net-a").unwrap();
    assert_eq!(net.attempts, 2);
    assert_eq!(h.platform.resource_count("net-a"), 1);

    let retried = drain(&mut events).into_iter().any(|e| {
        matches!(e, SchedulerEvent::TaskRetrying { ref resource, attempt: 1, .. } if resource == "net-a")
    });
    assert!(retried);
}

/// Test: Timeout once, then retry
/// Given a platform whose first creation of vm-1 applies but stalls past the operation timeout
/// When the deployment runs
/// Then the retry finds the instance already created and adopts it instead of creating a second one
#[tokio::test]
async fn test_timeout_then_retry_adopts_existing_resource() {
    let mut config = fast_config();
    config.orchestrator.operation_timeout = Duration::from_millis(100);
    let h = Harness::with(InMemoryPlatform::new(TARGET), config);
    h.platform.inject(
        Operation::CreateCompute,
        "vm-1",
        Fault::Stall(Duration::from_secs(5)),
    );

    let (id, status) = h.deploy(web_lab()).await;
    assert_eq!(status, DeploymentStatus::Succeeded);

    let snapshot = h.orchestrator.get_deployment_status(id).await.unwrap();
    let vm = snapshot.task("vm-1").unwrap();
    assert_eq!(vm.attempts, 2);
    assert_eq!(h.platform.resource_count("vm-1"), 1, "the retry must not duplicate the instance");
    assert_eq!(h.platform.call_count(Operation::CreateCompute, "vm-1"), 1);
    assert_eq!(h.platform.call_count(Operation::GetStatus, "vm-1"), 1);
    assert_eq!(
        h.platform.state_of("vm-1"),
        Some(glassdome::platform::ResourceState::Running)
    );
}

/// Test: Lost response
/// Given a network creation that succeeds on the backend but reports a connection error
/// When the deployment runs
/// Then exactly one network exists and the task succeeds on the retry
#[tokio::test]
async fn test_lost_response_does_not_duplicate() {
    let h = Harness::new();
    h.platform.inject(
        Operation::CreateNetwork,
        "net-a",
        Fault::ApplyThenFail(PlatformError::ConnectionRefused("reset by peer".into())),
    );

    let (id, status) = h.deploy(chain_lab()).await;
    assert_eq!(status, DeploymentStatus::Succeeded);
    assert_eq!(h.platform.resource_count("net-a"), 1);
    assert_eq!(h.platform.call_count(Operation::CreateNetwork, "net-a"), 1);

    let snapshot = h.orchestrator.get_deployment_status(id).await.unwrap();
    assert_eq!(snapshot.task("net-a").unwrap().attempts, 2);
}

/// Test: Retries are bounded
/// Given a transient error on every creation attempt of vm-1
/// When the deployment runs with max_attempts = 3
/// Then vm-1 fails after three attempts and vm-2 is skipped
#[tokio::test]
async fn test_retries_are_bounded() {
    let h = Harness::new();
    for _ in 0..3 {
        h.platform.fail_next(
            Operation::CreateCompute,
            "vm-1",
            PlatformError::Transient("backend busy".into()),
        );
    }

    let (id, status) = h.deploy(web_lab()).await;
    assert_eq!(status, DeploymentStatus::Failed);

    let snapshot = h.orchestrator.get_deployment_status(id).await.unwrap();
    let vm1 = snapshot.task("vm-1").unwrap();
    assert_eq!(vm1.status, TaskStatus::Failed);
    assert_eq!(vm1.attempts, 3);
    assert_eq!(snapshot.task("vm-2").unwrap().status, TaskStatus::Skipped);
    assert_eq!(h.platform.resource_count("vm-1"), 0);
}

/// Test: Cyclic lab is rejected
/// Given two instances that depend on each other
/// When the lab is submitted
/// Then submission fails with a cycle error and no platform call is made
#[tokio::test]
async fn test_cyclic_lab_is_rejected() {
    let h = Harness::new();
    let lab = LabDefinition::new("loop")
        .with_resource(ResourceSpec::compute("vm-1", TARGET).depends_on("vm-2"))
        .with_resource(ResourceSpec::compute("vm-2", TARGET).depends_on("vm-1"));

    let result = h.orchestrator.submit_deployment(lab).await;
    assert!(matches!(result, Err(Error::CyclicDependency { .. })));
    assert!(h.platform.calls().is_empty());
    assert!(h.orchestrator.list_deployments().await.unwrap().is_empty());
}

/// Test: Unknown reference is rejected
/// Given an instance attached to a network the lab does not declare
/// When the lab is submitted
/// Then submission fails naming the missing reference
#[tokio::test]
async fn test_unresolved_reference_is_rejected() {
    let h = Harness::new();
    let lab = LabDefinition::new("dangling")
        .with_resource(ResourceSpec::compute("vm-1", TARGET).attach("net-missing"));

    match h.orchestrator.submit_deployment(lab).await {
        Err(Error::UnresolvedReference {
            resource,
            reference,
        }) => {
            assert_eq!(resource, "vm-1");
            assert_eq!(reference, "net-missing");
        }
        other => panic!("expected unresolved reference, got {:?}", other),
    }
    assert!(h.store.is_empty());
}

/// Test: Unregistered platform
/// Given a lab targeting a platform with no adapter
/// When the lab is submitted
/// Then submission fails before anything is persisted
#[tokio::test]
async fn test_unregistered_platform_is_rejected() {
    let h = Harness::new();
    let lab = LabDefinition::new("elsewhere")
        .with_resource(ResourceSpec::network("net-a", "azure"));

    let result = h.orchestrator.submit_deployment(lab).await;
    assert!(matches!(result, Err(Error::PlatformNotRegistered(target)) if target == "azure"));
    assert!(h.store.is_empty());
}
