//! Teardown integration tests.
//!
//! These tests verify that deletion runs in reverse dependency order, that
//! a teardown tolerates resources already gone, and that a teardown can
//! interrupt provisioning.

use std::time::Duration;

use glassdome::core::{DeploymentId, DeploymentPhase, DeploymentStatus, TaskAction, TaskStatus};
use glassdome::orchestration::SchedulerEvent;
use glassdome::platform::memory::Operation;
use glassdome::platform::{InMemoryPlatform, PlatformError};
use glassdome::Error;

use crate::fixtures::{assert_finished_before, fast_config, finished, web_lab, Harness, TARGET};

/// Test: Reverse order
/// Given a provisioned web lab
/// When it is torn down
/// Then both instances are deleted before the network and the record is removed
#[tokio::test]
async fn test_teardown_deletes_dependents_first() {
    let h = Harness::with_latency(Duration::from_millis(5));
    let (id, status) = h.deploy(web_lab()).await;
    assert_eq!(status, DeploymentStatus::Succeeded);
    let provisioning_calls = h.platform.calls().len();

    let mut events = h.orchestrator.subscribe();
    h.orchestrator.teardown_deployment(id).await.unwrap();
    let status = finished(&mut events, id, DeploymentPhase::Teardown).await;
    assert_eq!(status, DeploymentStatus::Succeeded);

    let calls = h.platform.calls();
    let teardown_calls = &calls[provisioning_calls..];
    assert_finished_before(teardown_calls, "vm-2", "vm-1");
    assert_finished_before(teardown_calls, "vm-1", "net-a");
    assert_finished_before(teardown_calls, "vm-2", "net-a");

    assert_eq!(h.platform.total_resources(), 0);
    assert_eq!(h.platform.call_count(Operation::StopCompute, "vm-1"), 1);
    assert!(matches!(
        h.orchestrator.get_deployment_status(id).await,
        Err(Error::DeploymentNotFound(_))
    ));
}

/// Test: Out-of-band deletion
/// Given a provisioned lab whose vm-1 was removed outside the orchestrator
/// When it is torn down
/// Then the missing instance counts as deleted and the teardown succeeds
#[tokio::test]
async fn test_teardown_tolerates_missing_resource() {
    let h = Harness::new();
    let (id, _) = h.deploy(web_lab()).await;
    assert_eq!(h.platform.remove_out_of_band("vm-1"), 1);

    let mut events = h.orchestrator.subscribe();
    h.orchestrator.teardown_deployment(id).await.unwrap();
    let status = finished(&mut events, id, DeploymentPhase::Teardown).await;

    assert_eq!(status, DeploymentStatus::Succeeded);
    assert_eq!(h.platform.total_resources(), 0);
}

/// Test: Failed teardown can be repeated
/// Given a teardown whose deletion of vm-2 fails permanently
/// When teardown is requested a second time
/// Then the remaining resources are deleted and the record is removed
#[tokio::test]
async fn test_failed_teardown_can_be_repeated() {
    let h = Harness::new();
    let (id, _) = h.deploy(web_lab()).await;
    h.platform.fail_next(
        Operation::DeleteCompute,
        "vm-2",
        PlatformError::Permanent("instance is locked".into()),
    );

    h.orchestrator.teardown_deployment(id).await.unwrap();
    let status = h.orchestrator.wait(id).await.unwrap();
    assert_eq!(status, DeploymentStatus::Failed);

    let snapshot = h.orchestrator.get_deployment_status(id).await.unwrap();
    assert_eq!(snapshot.phase, DeploymentPhase::Teardown);
    assert!(snapshot.tasks.iter().all(|t| t.action == TaskAction::Delete));
    assert_eq!(snapshot.task("vm-2").unwrap().status, TaskStatus::Failed);
    assert_eq!(snapshot.task("vm-1").unwrap().status, TaskStatus::Skipped);
    assert_eq!(snapshot.task("net-a").unwrap().status, TaskStatus::Skipped);
    assert_eq!(h.platform.total_resources(), 3);

    let mut events = h.orchestrator.subscribe();
    h.orchestrator.teardown_deployment(id).await.unwrap();
    let status = finished(&mut events, id, DeploymentPhase::Teardown).await;
    assert_eq!(status, DeploymentStatus::Succeeded);
    assert_eq!(h.platform.total_resources(), 0);
}

/// Test: Teardown of a partially provisioned lab
/// Given a deployment where vm-1 failed permanently and vm-2 was skipped
/// When it is torn down
/// Then only the created network is deleted and the teardown succeeds
#[tokio::test]
async fn test_teardown_after_failed_provisioning() {
    let h = Harness::new();
    h.platform.fail_next(
        Operation::CreateCompute,
        "vm-1",
        PlatformError::Permanent("no capacity".into()),
    );
    let (id, status) = h.deploy(web_lab()).await;
    assert_eq!(status, DeploymentStatus::Failed);

    let mut events = h.orchestrator.subscribe();
    h.orchestrator.teardown_deployment(id).await.unwrap();
    let status = finished(&mut events, id, DeploymentPhase::Teardown).await;

    assert_eq!(status, DeploymentStatus::Succeeded);
    assert_eq!(h.platform.total_resources(), 0);
    assert_eq!(h.platform.call_count(Operation::DeleteNetwork, "net-a"), 1);
    assert_eq!(h.platform.call_count(Operation::DeleteCompute, "vm-1"), 0);
}

/// Test: Teardown interrupts provisioning
/// Given a deployment still provisioning on a slow platform
/// When teardown is requested
/// Then provisioning is cancelled, its in-flight work finishes and everything created is deleted
#[tokio::test]
async fn test_teardown_during_provisioning() {
    let h = Harness::with(
        InMemoryPlatform::with_latency(TARGET, Duration::from_millis(30)),
        fast_config(),
    );
    let mut events = h.orchestrator.subscribe();
    let id = h.orchestrator.submit_deployment(web_lab()).await.unwrap();
    loop {
        if let Ok(SchedulerEvent::TaskStarted { .. }) = events.recv().await {
            break;
        }
    }

    h.orchestrator.teardown_deployment(id).await.unwrap();
    assert!(h.orchestrator.is_active(id));

    let provision = finished(&mut events, id, DeploymentPhase::Provision).await;
    assert_eq!(provision, DeploymentStatus::Cancelled);
    let teardown = finished(&mut events, id, DeploymentPhase::Teardown).await;
    assert_eq!(teardown, DeploymentStatus::Succeeded);
    assert_eq!(h.platform.resource_count("net-a"), 0);
    assert_eq!(h.platform.call_count(Operation::DeleteNetwork, "net-a"), 1);
    assert_eq!(h.platform.total_resources(), 0);
}

/// Test: Teardown requested twice
/// Given a teardown already running on a slow platform
/// When teardown is requested again
/// Then the second request is accepted without starting another run
#[tokio::test]
async fn test_second_teardown_request_is_absorbed() {
    let h = Harness::with_latency(Duration::from_millis(20));
    let (id, _) = h.deploy(web_lab()).await;

    let mut events = h.orchestrator.subscribe();
    h.orchestrator.teardown_deployment(id).await.unwrap();
    h.orchestrator.teardown_deployment(id).await.unwrap();
    let status = finished(&mut events, id, DeploymentPhase::Teardown).await;

    assert_eq!(status, DeploymentStatus::Succeeded);
    assert_eq!(h.platform.call_count(Operation::DeleteNetwork, "net-a"), 1);
}

/// Test: Unknown deployment
/// Given an id that was never submitted
/// When teardown is requested
/// Then it fails with not found
#[tokio::test]
async fn test_teardown_unknown_deployment() {
    let h = Harness::new();
    let result = h.orchestrator.teardown_deployment(DeploymentId::new()).await;
    assert!(matches!(result, Err(Error::DeploymentNotFound(_))));
}
