// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Behavior tests for the async task wrapper.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use vmflock_connector::mock::{CountingProducer, MockVmTask};
use vmflock_connector::{AsyncVmTask, TaskOutcome, TaskPoll};

#[tokio::test]
async fn test_concurrent_submit_issues_producer_exactly_once() {
    let handle = Arc::new(MockVmTask::pending());
    let producer = CountingProducer::returning(handle);
    let calls = producer.call_count();
    let task = Arc::new(AsyncVmTask::new("clone base -> agent-1", producer));

    let submits = (0..8).map(|_| {
        let task = task.clone();
        tokio::spawn(async move { task.submit().await })
    });
    for result in futures::future::join_all(submits).await {
        assert_eq!(result.unwrap(), TaskPoll::Pending);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_poll_pending_through_transient_failures_then_success() {
    let handle = Arc::new(MockVmTask::succeeding("clone complete").with_transient_failures(3));
    let task = AsyncVmTask::new("clone base -> agent-2", CountingProducer::returning(handle));

    // Three transient probe failures read as still pending.
    assert_eq!(task.poll().await, TaskPoll::Pending);
    assert_eq!(task.poll().await, TaskPoll::Pending);
    assert_eq!(task.poll().await, TaskPoll::Pending);

    // The fourth probe reaches the backend and observes completion.
    assert_eq!(
        task.poll().await,
        TaskPoll::Complete(TaskOutcome::success("clone complete"))
    );
}

#[tokio::test]
async fn test_poll_fails_terminally_on_fourth_consecutive_failure() {
    let handle = Arc::new(
        MockVmTask::pending()
            .with_transient_failures(u32::MAX)
            .with_transient_error("backend unreachable"),
    );
    let task = AsyncVmTask::new("clone base -> agent-3", CountingProducer::returning(handle));

    assert_eq!(task.poll().await, TaskPoll::Pending);
    assert_eq!(task.poll().await, TaskPoll::Pending);
    assert_eq!(task.poll().await, TaskPoll::Pending);

    match task.poll().await {
        TaskPoll::Complete(outcome) => {
            assert!(outcome.is_failed());
            assert!(outcome.message().contains("backend unreachable"));
        }
        TaskPoll::Pending => panic!("fourth consecutive failure must be terminal"),
    }

    // The manufactured failure is cached; no further probes happen.
    assert_eq!(
        task.poll().await,
        TaskPoll::Complete(TaskOutcome::failed("transport error: backend unreachable"))
    );
}

#[tokio::test]
async fn test_successful_probe_resets_failure_streak() {
    // Failures interleaved with a successful probe: the streak restarts at
    // the success, so it never crosses the threshold.
    let handle = Arc::new(MockVmTask::pending().with_transient_failures(2));
    let task = AsyncVmTask::new("clone base -> agent-4", CountingProducer::returning(handle.clone()));

    assert_eq!(task.poll().await, TaskPoll::Pending);
    assert_eq!(task.poll().await, TaskPoll::Pending);
    assert_eq!(task.poll().await, TaskPoll::Pending); // successful probe

    handle.set_transient_failures(3);
    assert_eq!(task.poll().await, TaskPoll::Pending);
    assert_eq!(task.poll().await, TaskPoll::Pending);
    assert_eq!(task.poll().await, TaskPoll::Pending);
}

#[tokio::test]
async fn test_submission_failure_is_terminal_without_any_probe() {
    let producer = CountingProducer::failing("connection refused");
    let calls = producer.call_count();
    let task = AsyncVmTask::new("clone base -> agent-5", producer);

    match task.poll().await {
        TaskPoll::Complete(outcome) => {
            assert!(outcome.is_failed());
            assert!(outcome.message().contains("connection refused"));
        }
        TaskPoll::Pending => panic!("failed submission must be terminal on first poll"),
    }

    // The producer is never retried and waiting returns the same outcome.
    let outcome = task.wait(Duration::from_millis(50)).await;
    assert!(outcome.is_failed());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_wait_returns_backend_message() {
    let handle = Arc::new(MockVmTask::pending());
    let task = Arc::new(AsyncVmTask::new(
        "power on agent-6",
        CountingProducer::returning(handle.clone()),
    ));

    let waiter = tokio::spawn({
        let task = task.clone();
        async move { task.wait(Duration::from_secs(2)).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.complete("powered on").await;

    assert_eq!(waiter.await.unwrap(), TaskOutcome::success("powered on"));
}

#[tokio::test]
async fn test_wait_timeout_is_captured_as_failure() {
    let handle = Arc::new(MockVmTask::pending());
    let task = AsyncVmTask::new("power on agent-7", CountingProducer::returning(handle));

    let outcome = task.wait(Duration::from_millis(40)).await;
    assert!(outcome.is_failed());
    assert!(outcome.message().contains("timed out"));
}

#[tokio::test]
async fn test_backend_fault_message_is_carried() {
    let handle = Arc::new(MockVmTask::failing(Some("insufficient disk space on datastore")));
    let task = AsyncVmTask::new("clone base -> agent-8", CountingProducer::returning(handle));

    assert_eq!(
        task.poll().await,
        TaskPoll::Complete(TaskOutcome::failed("insufficient disk space on datastore"))
    );
}

#[tokio::test]
async fn test_missing_backend_fault_defaults_to_unknown_error() {
    let handle = Arc::new(MockVmTask::failing(None));
    let task = AsyncVmTask::new("clone base -> agent-9", CountingProducer::returning(handle));

    assert_eq!(
        task.poll().await,
        TaskPoll::Complete(TaskOutcome::failed("Unknown error"))
    );
}

#[tokio::test]
async fn test_cancel_accepted_raises_flag() {
    let handle = Arc::new(MockVmTask::pending());
    let task = AsyncVmTask::new("clone base -> agent-10", CountingProducer::returning(handle.clone()));

    assert!(!task.is_cancelled());
    assert!(task.cancel().await);
    assert!(task.is_cancelled());
    assert!(handle.cancel_requested());
}

#[tokio::test]
async fn test_cancel_rejection_returns_false_and_leaves_flag() {
    let handle = Arc::new(MockVmTask::pending().rejecting_cancel());
    let task = AsyncVmTask::new("clone base -> agent-11", CountingProducer::returning(handle));

    assert!(!task.cancel().await);
    assert!(!task.is_cancelled());
}

#[tokio::test]
async fn test_terminal_outcome_is_stable_across_accessors() {
    let handle = Arc::new(MockVmTask::succeeding("clone complete"));
    let task = AsyncVmTask::new("clone base -> agent-12", CountingProducer::returning(handle));

    let polled = task.poll().await;
    let waited = task.wait(Duration::from_millis(10)).await;
    assert_eq!(polled, TaskPoll::Complete(waited));
    assert_eq!(task.submit().await, polled);
}
