// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end provisioning tests against the mock backend.

use std::sync::Arc;
use std::time::Duration;

use vmflock_connector::PowerState;
use vmflock_connector::mock::MockConnector;
use vmflock_pool::{
    AgentUserData, CloneBehaviour, CountingPolicy, ImageConfig, InstancePool, InstanceStatus,
    NameAllocator, PoolError, Provisioner, StatusPoller, StatusPollerConfig,
};

fn test_image() -> ImageConfig {
    ImageConfig {
        name: "linux-xl".to_string(),
        source_vm: "base-linux".to_string(),
        snapshot: Some("ready".to_string()),
        behaviour: CloneBehaviour::LinkedClone,
        folder: Some("build-agents".to_string()),
        resource_pool: Some("agents-rp".to_string()),
        max_instances: 5,
    }
}

struct Harness {
    pool: Arc<InstancePool>,
    connector: Arc<MockConnector>,
    provisioner: Provisioner,
    poller: StatusPoller,
    _dir: tempfile::TempDir,
}

fn harness_with(connector: MockConnector) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let pool = Arc::new(InstancePool::new(
        test_image(),
        Arc::new(NameAllocator::new(dir.path())),
    ));
    let connector = Arc::new(connector);
    let provisioner = Provisioner::new(pool.clone(), connector.clone())
        .with_task_timeout(Duration::from_secs(2));
    let poller = StatusPoller::new(
        pool.clone(),
        connector.clone(),
        StatusPollerConfig::default(),
    );
    Harness {
        pool,
        connector,
        provisioner,
        poller,
        _dir: dir,
    }
}

fn harness() -> Harness {
    harness_with(MockConnector::new())
}

/// Poll until `check` passes or the budget runs out.
async fn wait_until<F>(check: F)
where
    F: Fn() -> bool,
{
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within budget");
}

#[tokio::test]
async fn test_start_instance_clones_and_hands_off() {
    let h = harness();
    let data = AgentUserData {
        agent_name: "linux-agent".to_string(),
        auth_token: "tok".to_string(),
        server_url: "https://builds.example.com".to_string(),
        profile_id: "p1".to_string(),
        custom_properties: Default::default(),
    };

    let instance = h
        .provisioner
        .start_instance(&data, &CountingPolicy::default())
        .await
        .unwrap();
    assert_eq!(instance.status(), InstanceStatus::ScheduledToStart);
    assert!(!instance.is_ready());

    // The detached monitor settles the instance once the clone completes.
    let monitored = instance.clone();
    wait_until(move || monitored.status() == InstanceStatus::Starting).await;
    assert!(instance.is_ready());
    assert!(h.connector.has_vm(instance.name()).await);

    // The poller then observes the powered-on machine.
    h.poller.refresh().await;
    assert_eq!(instance.status(), InstanceStatus::Running);
}

#[tokio::test]
async fn test_failed_clone_submission_marks_error_and_keeps_pool_consistent() {
    let h = harness_with(MockConnector::failing_clones());

    let instance = h
        .provisioner
        .start_instance(&AgentUserData::default(), &CountingPolicy::default())
        .await
        .unwrap();

    let monitored = instance.clone();
    wait_until(move || monitored.status() == InstanceStatus::Error).await;
    assert!(!instance.is_ready());

    // No machine was created; the instance is tracked and removable, nothing
    // half-added.
    assert!(!h.connector.has_vm(instance.name()).await);
    assert_eq!(h.pool.instance_count(|_| true), 1);

    // The next reconcile cycle drops the failed instance and frees capacity.
    h.poller.refresh().await;
    assert_eq!(h.pool.instance_count(|_| true), 0);
    assert!(h.pool.can_start_new_instance(&CountingPolicy::default()));
}

#[tokio::test]
async fn test_stop_instance_walks_the_stop_path() {
    let h = harness();

    let instance = h
        .provisioner
        .start_instance(&AgentUserData::default(), &CountingPolicy::default())
        .await
        .unwrap();
    let started = instance.clone();
    wait_until(move || started.status() == InstanceStatus::Starting).await;
    h.poller.refresh().await;
    assert_eq!(instance.status(), InstanceStatus::Running);

    let stopped = h.provisioner.stop_instance(instance.name()).await.unwrap();
    assert_eq!(stopped.status(), InstanceStatus::ScheduledToStop);

    // Monitor moves it to Stopping when the power-off task finishes; the
    // poller settles Stopped once the backend reports the machine off.
    let monitored = instance.clone();
    wait_until(move || {
        matches!(
            monitored.status(),
            InstanceStatus::Stopping | InstanceStatus::Stopped
        )
    })
    .await;
    h.poller.refresh().await;
    assert_eq!(instance.status(), InstanceStatus::Stopped);

    // Stopped machines stay tracked for reuse.
    assert!(h.pool.get(instance.name()).is_some());
}

#[tokio::test]
async fn test_stop_rejects_instances_that_cannot_stop() {
    let h = harness();
    let instance = h
        .provisioner
        .start_instance(&AgentUserData::default(), &CountingPolicy::default())
        .await
        .unwrap();
    // Still ScheduledToStart: there is nothing to power off yet.
    match h.provisioner.stop_instance(instance.name()).await {
        Err(PoolError::InvalidState { operation, .. }) => assert_eq!(operation, "stop"),
        other => panic!("expected InvalidState, got {other:?}"),
    }
}

#[tokio::test]
async fn test_remove_instance_deletes_machine_and_untracks() {
    let h = harness();
    let instance = h
        .provisioner
        .start_instance(&AgentUserData::default(), &CountingPolicy::default())
        .await
        .unwrap();
    let started = instance.clone();
    wait_until(move || started.status() == InstanceStatus::Starting).await;

    // Walk to Stopped via the backend.
    h.connector
        .set_power(instance.name(), PowerState::PoweredOff)
        .await;
    instance.set_status(InstanceStatus::Running);
    h.poller.refresh().await;
    assert_eq!(instance.status(), InstanceStatus::Stopped);

    h.provisioner.remove_instance(instance.name()).await.unwrap();
    for _ in 0..100 {
        if !h.connector.has_vm(instance.name()).await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!h.connector.has_vm(instance.name()).await);

    h.poller.refresh().await;
    assert!(h.pool.get(instance.name()).is_none());
}

#[tokio::test]
async fn test_remove_rejects_running_instances() {
    let h = harness();
    let instance = h
        .provisioner
        .start_instance(&AgentUserData::default(), &CountingPolicy::default())
        .await
        .unwrap();
    let started = instance.clone();
    wait_until(move || started.status() == InstanceStatus::Starting).await;
    h.poller.refresh().await;
    assert_eq!(instance.status(), InstanceStatus::Running);

    match h.provisioner.remove_instance(instance.name()).await {
        Err(PoolError::InvalidState { operation, .. }) => assert_eq!(operation, "remove"),
        other => panic!("expected InvalidState, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_instance_is_reported() {
    let h = harness();
    match h.provisioner.stop_instance("linux-xl-99").await {
        Err(PoolError::InstanceNotFound(name)) => assert_eq!(name, "linux-xl-99"),
        other => panic!("expected InstanceNotFound, got {other:?}"),
    }
}
