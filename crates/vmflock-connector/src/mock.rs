// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock backend for testing.
//!
//! A connector implementation that simulates a virtualization backend
//! without any remote endpoint: an in-memory machine model, scripted task
//! state sequences, and per-name probe failure injection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::connector::{CloneSpec, PowerState, VirtConnector, VmInfo};
use crate::error::{ConnectorError, Result};
use crate::task::{RemoteTask, TaskProducer, TaskState};

/// Interval at which [`MockVmTask::wait`] re-checks the task state.
const WAIT_PROBE_INTERVAL: Duration = Duration::from_millis(5);

/// Scriptable backend task handle.
pub struct MockVmTask {
    state: Mutex<TaskState>,
    message: Mutex<String>,
    fault: Mutex<Option<String>>,
    /// Remaining `state()` calls that fail with a transport error.
    transient_failures: AtomicU32,
    transient_error: String,
    accepts_cancel: bool,
    cancel_requested: AtomicBool,
    /// Number of `state()` calls made, including failed ones.
    state_calls: AtomicU32,
}

impl MockVmTask {
    fn build(state: TaskState, message: String, fault: Option<String>) -> Self {
        Self {
            state: Mutex::new(state),
            message: Mutex::new(message),
            fault: Mutex::new(fault),
            transient_failures: AtomicU32::new(0),
            transient_error: "connection reset by peer".to_string(),
            accepts_cancel: true,
            cancel_requested: AtomicBool::new(false),
            state_calls: AtomicU32::new(0),
        }
    }

    /// A task that is already completed with the given result message.
    pub fn succeeding(message: impl Into<String>) -> Self {
        Self::build(TaskState::Success, message.into(), None)
    }

    /// A task that is already failed with the given backend fault.
    /// `None` simulates a backend that supplies no fault message.
    pub fn failing(fault: Option<&str>) -> Self {
        Self::build(TaskState::Error, String::new(), fault.map(str::to_string))
    }

    /// A task that stays pending until completed or failed by the test.
    pub fn pending() -> Self {
        Self::build(TaskState::Pending, String::new(), None)
    }

    /// Fail the next `n` `state()` calls with a transport error.
    pub fn with_transient_failures(self, n: u32) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Fail the next `n` `state()` calls with a transport error, after
    /// construction.
    pub fn set_transient_failures(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Use a specific transport error message for scripted failures.
    pub fn with_transient_error(mut self, message: impl Into<String>) -> Self {
        self.transient_error = message.into();
        self
    }

    /// Reject cancellation requests.
    pub fn rejecting_cancel(mut self) -> Self {
        self.accepts_cancel = false;
        self
    }

    /// Mark the task completed with a result message.
    pub async fn complete(&self, message: impl Into<String>) {
        *self.message.lock().await = message.into();
        *self.state.lock().await = TaskState::Success;
    }

    /// Mark the task failed with an optional backend fault message.
    pub async fn fail(&self, fault: Option<&str>) {
        *self.fault.lock().await = fault.map(str::to_string);
        *self.state.lock().await = TaskState::Error;
    }

    /// Whether a cancellation request reached the backend.
    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Number of `state()` calls made against this handle.
    pub fn state_call_count(&self) -> u32 {
        self.state_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteTask for MockVmTask {
    async fn state(&self) -> Result<TaskState> {
        self.state_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ConnectorError::Transport(self.transient_error.clone()));
        }
        Ok(*self.state.lock().await)
    }

    async fn error_message(&self) -> Option<String> {
        self.fault.lock().await.clone()
    }

    async fn cancel(&self) -> Result<()> {
        if !self.accepts_cancel {
            return Err(ConnectorError::Transport(
                "cancellation rejected by backend".to_string(),
            ));
        }
        self.cancel_requested.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn wait(&self, connect: Duration, finish: Duration) -> Result<String> {
        let deadline = tokio::time::Instant::now() + connect + finish;
        loop {
            if *self.state.lock().await != TaskState::Pending {
                return Ok(self.message.lock().await.clone());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ConnectorError::Transport(
                    "timed out waiting for task".to_string(),
                ));
            }
            tokio::time::sleep(WAIT_PROBE_INTERVAL).await;
        }
    }
}

/// [`TaskProducer`] that counts how many times it is invoked.
///
/// Used to verify the single-execution guarantee of
/// [`AsyncVmTask`](crate::wrapper::AsyncVmTask).
pub struct CountingProducer {
    task: Option<Arc<dyn RemoteTask>>,
    error: Option<String>,
    calls: Arc<AtomicU32>,
}

impl CountingProducer {
    /// Producer that hands out the given handle.
    pub fn returning(task: Arc<dyn RemoteTask>) -> Self {
        Self {
            task: Some(task),
            error: None,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Producer whose submission fails synchronously with the given message.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            task: None,
            error: Some(message.into()),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Shared invocation counter, usable after the producer is handed to a
    /// wrapper.
    pub fn call_count(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

#[async_trait]
impl TaskProducer for CountingProducer {
    async fn produce(&self) -> Result<Arc<dyn RemoteTask>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match (&self.task, &self.error) {
            (_, Some(message)) => Err(ConnectorError::Submission(message.clone())),
            (Some(task), None) => Ok(task.clone()),
            (None, None) => Err(ConnectorError::Other("producer not configured".to_string())),
        }
    }
}

/// Mock machine state.
#[derive(Debug, Clone)]
struct MockVm {
    power: PowerState,
    changed_at: chrono::DateTime<Utc>,
}

/// Mock connector with an in-memory machine model.
pub struct MockConnector {
    vms: Arc<Mutex<HashMap<String, MockVm>>>,
    /// Per-name count of `vm_info` calls that fail with a transport error.
    probe_failures: Arc<Mutex<HashMap<String, u32>>>,
    /// If true, clone submissions fail synchronously.
    pub fail_clones: bool,
    /// How long spawned tasks stay pending (in milliseconds).
    pub task_delay_ms: u64,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    /// Create a mock connector with a short task delay.
    pub fn new() -> Self {
        Self {
            vms: Arc::new(Mutex::new(HashMap::new())),
            probe_failures: Arc::new(Mutex::new(HashMap::new())),
            fail_clones: false,
            task_delay_ms: 10,
        }
    }

    /// Create a mock connector whose clone submissions fail.
    pub fn failing_clones() -> Self {
        Self {
            fail_clones: true,
            ..Self::new()
        }
    }

    /// Add a machine to the model.
    pub async fn add_vm(&self, name: &str, power: PowerState) {
        self.vms.lock().await.insert(
            name.to_string(),
            MockVm {
                power,
                changed_at: Utc::now(),
            },
        );
    }

    /// Flip a machine's power state out from under the pool, simulating an
    /// operator or backend-side change.
    pub async fn set_power(&self, name: &str, power: PowerState) {
        if let Some(vm) = self.vms.lock().await.get_mut(name) {
            vm.power = power;
            vm.changed_at = Utc::now();
        }
    }

    /// Remove a machine from the model, simulating backend-side deletion.
    pub async fn remove_vm(&self, name: &str) {
        self.vms.lock().await.remove(name);
    }

    /// Check whether the model contains a machine.
    pub async fn has_vm(&self, name: &str) -> bool {
        self.vms.lock().await.contains_key(name)
    }

    /// Fail the next `n` status probes for a machine with a transport error.
    pub async fn fail_next_probes(&self, name: &str, n: u32) {
        self.probe_failures.lock().await.insert(name.to_string(), n);
    }

    /// Build a task that applies `apply` to the model after the configured
    /// delay, then completes with `message`.
    fn spawn_task<F>(&self, message: &'static str, apply: F) -> Arc<dyn RemoteTask>
    where
        F: FnOnce(&mut HashMap<String, MockVm>) + Send + 'static,
    {
        let task = Arc::new(MockVmTask::pending());
        let vms = self.vms.clone();
        let delay = self.task_delay_ms;
        let spawned = task.clone();
        tokio::spawn(async move {
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            apply(&mut *vms.lock().await);
            spawned.complete(message).await;
        });
        task
    }
}

#[async_trait]
impl VirtConnector for MockConnector {
    async fn clone_vm(&self, spec: &CloneSpec) -> Result<Arc<dyn RemoteTask>> {
        if self.fail_clones {
            return Err(ConnectorError::Submission("connection refused".to_string()));
        }
        let target = spec.target_name.clone();
        Ok(self.spawn_task("clone complete", move |vms| {
            vms.insert(
                target,
                MockVm {
                    power: PowerState::PoweredOn,
                    changed_at: Utc::now(),
                },
            );
        }))
    }

    async fn power_on(&self, name: &str) -> Result<Arc<dyn RemoteTask>> {
        if !self.has_vm(name).await {
            return Err(ConnectorError::VmNotFound(name.to_string()));
        }
        let name = name.to_string();
        Ok(self.spawn_task("powered on", move |vms| {
            if let Some(vm) = vms.get_mut(&name) {
                vm.power = PowerState::PoweredOn;
                vm.changed_at = Utc::now();
            }
        }))
    }

    async fn power_off(&self, name: &str) -> Result<Arc<dyn RemoteTask>> {
        if !self.has_vm(name).await {
            return Err(ConnectorError::VmNotFound(name.to_string()));
        }
        let name = name.to_string();
        Ok(self.spawn_task("powered off", move |vms| {
            if let Some(vm) = vms.get_mut(&name) {
                vm.power = PowerState::PoweredOff;
                vm.changed_at = Utc::now();
            }
        }))
    }

    async fn delete_vm(&self, name: &str) -> Result<Arc<dyn RemoteTask>> {
        if !self.has_vm(name).await {
            return Err(ConnectorError::VmNotFound(name.to_string()));
        }
        let name = name.to_string();
        Ok(self.spawn_task("deleted", move |vms| {
            vms.remove(&name);
        }))
    }

    async fn vm_info(&self, name: &str) -> Result<Option<VmInfo>> {
        {
            let mut failures = self.probe_failures.lock().await;
            if let Some(remaining) = failures.get_mut(name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ConnectorError::Transport(format!(
                        "status probe failed for {name}"
                    )));
                }
            }
        }
        Ok(self.vms.lock().await.get(name).map(|vm| VmInfo {
            name: name.to_string(),
            power: vm.power,
            changed_at: vm.changed_at,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_task_succeeding() {
        let task = MockVmTask::succeeding("done");
        assert_eq!(task.state().await.unwrap(), TaskState::Success);
        assert_eq!(task.wait(Duration::ZERO, Duration::ZERO).await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_mock_task_failing_carries_fault() {
        let task = MockVmTask::failing(Some("disk full"));
        assert_eq!(task.state().await.unwrap(), TaskState::Error);
        assert_eq!(task.error_message().await.as_deref(), Some("disk full"));
    }

    #[tokio::test]
    async fn test_mock_task_transient_script() {
        let task = MockVmTask::succeeding("done").with_transient_failures(2);
        assert!(task.state().await.is_err());
        assert!(task.state().await.is_err());
        assert_eq!(task.state().await.unwrap(), TaskState::Success);
        assert_eq!(task.state_call_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_task_wait_times_out() {
        let task = MockVmTask::pending();
        let result = task
            .wait(Duration::from_millis(10), Duration::from_millis(10))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_mock_task_rejecting_cancel() {
        let task = MockVmTask::pending().rejecting_cancel();
        assert!(task.cancel().await.is_err());
        assert!(!task.cancel_requested());
    }

    #[tokio::test]
    async fn test_mock_connector_clone_creates_vm() {
        let connector = MockConnector::new();
        let spec = CloneSpec {
            source_vm: "base".to_string(),
            snapshot: None,
            target_name: "agent-1".to_string(),
            folder: None,
            resource_pool: None,
            linked_clone: false,
            guest_properties: HashMap::new(),
        };

        let task = connector.clone_vm(&spec).await.unwrap();
        let message = task
            .wait(Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(message, "clone complete");
        assert!(connector.has_vm("agent-1").await);
        let info = connector.vm_info("agent-1").await.unwrap().unwrap();
        assert_eq!(info.power, PowerState::PoweredOn);
    }

    #[tokio::test]
    async fn test_mock_connector_probe_failure_script() {
        let connector = MockConnector::new();
        connector.add_vm("agent-1", PowerState::PoweredOn).await;
        connector.fail_next_probes("agent-1", 1).await;

        assert!(connector.vm_info("agent-1").await.is_err());
        assert!(connector.vm_info("agent-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_connector_unknown_vm() {
        let connector = MockConnector::new();
        assert!(matches!(
            connector.power_on("nope").await,
            Err(ConnectorError::VmNotFound(_))
        ));
        assert!(connector.vm_info("nope").await.unwrap().is_none());
    }
}
