//! Crash recovery tests.
//!
//! These tests hand-craft the records a crashed process would leave behind
//! and verify that a fresh orchestrator over the same store finishes the
//! work without duplicating platform resources.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use glassdome::core::{
    build, build_teardown, Deployment, DeploymentPhase, DeploymentStatus, TaskResult, TaskStatus,
    TaskUpdate,
};
use glassdome::orchestration::Orchestrator;
use glassdome::platform::memory::Operation;
use glassdome::platform::{InMemoryPlatform, PlatformAdapter, PlatformRegistry, ResourceKey};
use glassdome::state::{DeploymentStore, JsonFileStore};

use crate::fixtures::{fast_config, web_lab, Harness, TARGET};

/// A web lab deployment interrupted while creating net-a, after the
/// platform had already created it.
async fn interrupted_during_network(platform: &InMemoryPlatform) -> Deployment {
    let lab = web_lab();
    let mut deployment = Deployment::new(lab.clone(), build(&lab).unwrap());
    let net = deployment.graph.find_by_resource("net-a").unwrap().id;
    deployment.apply(&net, TaskUpdate::Started).unwrap();

    platform
        .create_network(
            &ResourceKey::new(deployment.id, "net-a"),
            lab.resource("net-a").unwrap(),
        )
        .await
        .unwrap();
    deployment
}

/// Test: Resume after crash
/// Given a stored deployment whose net-a task was running when the process died
/// When a new orchestrator resumes incomplete deployments
/// Then the network created before the crash is adopted and the lab completes
#[tokio::test]
async fn test_resume_incomplete_after_crash() {
    let h = Harness::new();
    let deployment = interrupted_during_network(&h.platform).await;
    h.store.save(&deployment).await.unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Running);

    let orchestrator = h.restarted();
    let resumed = orchestrator.resume_incomplete().await.unwrap();
    assert_eq!(resumed, vec![deployment.id]);

    let status = orchestrator
        .wait_timeout(deployment.id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(status, DeploymentStatus::Succeeded);

    let snapshot = orchestrator.get_deployment_status(deployment.id).await.unwrap();
    assert_eq!(snapshot.task("net-a").unwrap().attempts, 2);
    assert_eq!(h.platform.resource_count("net-a"), 1);
    assert_eq!(h.platform.call_count(Operation::CreateNetwork, "net-a"), 1);
    assert_eq!(h.platform.resource_count("vm-1"), 1);
    assert_eq!(h.platform.resource_count("vm-2"), 1);
}

/// Test: Terminal deployments stay put
/// Given one succeeded deployment in the store
/// When incomplete deployments are resumed
/// Then nothing is resumed and no platform call is made
#[tokio::test]
async fn test_resume_skips_terminal_deployments() {
    let h = Harness::new();
    let (id, _) = h.deploy(web_lab()).await;
    let calls = h.platform.calls().len();

    let orchestrator = h.restarted();
    assert!(orchestrator.resume_incomplete().await.unwrap().is_empty());
    orchestrator.resume_deployment(id).await.unwrap();
    assert!(!orchestrator.is_active(id));
    assert_eq!(h.platform.calls().len(), calls);
}

/// Test: Pending deployment never started
/// Given a deployment persisted but never dispatched
/// When it is resumed by id
/// Then it provisions normally on the first attempt
#[tokio::test]
async fn test_resume_pending_deployment() {
    let h = Harness::new();
    let lab = web_lab();
    let deployment = Deployment::new(lab.clone(), build(&lab).unwrap());
    h.store.save(&deployment).await.unwrap();

    h.orchestrator.resume_deployment(deployment.id).await.unwrap();
    let status = h.orchestrator.wait(deployment.id).await.unwrap();
    assert_eq!(status, DeploymentStatus::Succeeded);

    let snapshot = h.orchestrator.get_deployment_status(deployment.id).await.unwrap();
    assert!(snapshot.tasks.iter().all(|t| t.attempts == 1));
}

/// Test: Failure recorded before the crash
/// Given a stored deployment where vm-1 failed but vm-2 was never skipped
/// When it is resumed
/// Then vm-2 is skipped without a platform call and the deployment fails
#[tokio::test]
async fn test_resume_poisons_after_recorded_failure() {
    let h = Harness::new();
    let lab = web_lab();
    let mut deployment = Deployment::new(lab.clone(), build(&lab).unwrap());
    let net = deployment.graph.find_by_resource("net-a").unwrap().id;
    let vm1 = deployment.graph.find_by_resource("vm-1").unwrap().id;
    deployment.apply(&net, TaskUpdate::Started).unwrap();
    let network = h
        .platform
        .create_network(
            &ResourceKey::new(deployment.id, "net-a"),
            lab.resource("net-a").unwrap(),
        )
        .await
        .unwrap();
    deployment
        .apply(
            &net,
            TaskUpdate::Succeeded(TaskResult::new(network.network_id)),
        )
        .unwrap();
    deployment.apply(&vm1, TaskUpdate::Started).unwrap();
    deployment
        .apply(&vm1, TaskUpdate::Failed("permanent failure: bad image".into()))
        .unwrap();
    h.store.save(&deployment).await.unwrap();

    let orchestrator = h.restarted();
    assert_eq!(orchestrator.resume_incomplete().await.unwrap(), vec![deployment.id]);
    let status = orchestrator.wait(deployment.id).await.unwrap();
    assert_eq!(status, DeploymentStatus::Failed);

    let snapshot = orchestrator.get_deployment_status(deployment.id).await.unwrap();
    assert_eq!(snapshot.task("vm-2").unwrap().status, TaskStatus::Skipped);
    assert_eq!(h.platform.call_count(Operation::CreateCompute, "vm-2"), 0);
}

/// Test: Interrupted teardown
/// Given a deployment whose teardown had deleted vm-2 when the process died
/// When it is resumed
/// Then the teardown finishes the remaining deletions and the record is removed
#[tokio::test]
async fn test_resume_interrupted_teardown() {
    let h = Harness::new();
    let (id, _) = h.deploy(web_lab()).await;

    let mut deployment = h.store.load(id).await.unwrap();
    let teardown = build_teardown(&deployment.graph).unwrap();
    deployment.begin_teardown(teardown);
    let vm2 = deployment.active_graph().find_by_resource("vm-2").unwrap().clone();
    deployment.apply(&vm2.id, TaskUpdate::Started).unwrap();
    let vm2_target = vm2.target.clone().unwrap();
    h.platform.delete_compute(&vm2_target).await.unwrap();
    h.store.save(&deployment).await.unwrap();

    let orchestrator = h.restarted();
    assert_eq!(orchestrator.resume_incomplete().await.unwrap(), vec![id]);
    // A successful teardown removes the record; watch the run instead.
    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        while orchestrator.is_active(id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(drained.is_ok(), "teardown should finish");

    assert_eq!(h.platform.total_resources(), 0);
    assert!(h.store.load(id).await.is_err());
}

/// Test: Resume from disk
/// Given an interrupted deployment written by the file store
/// When a new orchestrator opens the same directory and resumes
/// Then the deployment completes and the record on disk reflects it
#[tokio::test]
async fn test_resume_from_file_store() {
    let dir = TempDir::new().unwrap();
    let platform = Arc::new(InMemoryPlatform::new(TARGET));

    let deployment = interrupted_during_network(&platform).await;
    {
        let store = JsonFileStore::open(dir.path()).unwrap();
        store.save(&deployment).await.unwrap();
    }

    let store = Arc::new(JsonFileStore::open(dir.path()).unwrap());
    let mut registry = PlatformRegistry::new();
    registry.register(TARGET, platform.clone());
    let orchestrator = Orchestrator::new(&fast_config(), registry, store.clone());

    assert_eq!(orchestrator.resume_incomplete().await.unwrap(), vec![deployment.id]);
    let status = orchestrator.wait(deployment.id).await.unwrap();
    assert_eq!(status, DeploymentStatus::Succeeded);

    let reloaded = JsonFileStore::open(dir.path())
        .unwrap()
        .load(deployment.id)
        .await
        .unwrap();
    assert_eq!(reloaded.status, DeploymentStatus::Succeeded);
    assert_eq!(reloaded.phase, DeploymentPhase::Provision);
    assert_eq!(platform.resource_count("net-a"), 1);
}
