// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioning glue: from "start an agent" to a tracked, booting machine.
//!
//! The provisioner ties the pieces together. Starting an instance admits it
//! into the pool, builds the clone task for the backend, and spawns a
//! detached monitor that settles the instance into `Starting` or `Error`
//! when the task finishes. Nothing here blocks the caller on the backend.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};
use vmflock_connector::{AsyncVmTask, CloneSpec, VirtConnector, VmOp, VmOperation};

use crate::config::{CountingPolicy, ImageConfig};
use crate::error::{PoolError, Result};
use crate::instance::{Instance, InstanceStatus};
use crate::pool::InstancePool;
use crate::user_data::AgentUserData;

/// Default budget for a clone or power task to finish.
const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(600);

/// Starts and stops instances of one image.
pub struct Provisioner {
    pool: Arc<InstancePool>,
    connector: Arc<dyn VirtConnector>,
    task_timeout: Duration,
}

impl Provisioner {
    /// Create a provisioner over a pool and its backend.
    pub fn new(pool: Arc<InstancePool>, connector: Arc<dyn VirtConnector>) -> Self {
        Self {
            pool,
            connector,
            task_timeout: DEFAULT_TASK_TIMEOUT,
        }
    }

    /// Override the per-task completion budget.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Start a new instance.
    ///
    /// Admits the instance into the pool (capacity-checked under `policy`),
    /// then clones it on the backend in the background. The returned
    /// instance is in [`InstanceStatus::ScheduledToStart`]; the detached
    /// monitor and the status poller move it forward from there.
    pub async fn start_instance(
        &self,
        user_data: &AgentUserData,
        policy: &CountingPolicy,
    ) -> Result<Arc<Instance>> {
        let instance = self.pool.start_new_instance(user_data, policy).await?;

        let image = self.pool.image();
        let spec = clone_spec(image, &instance);
        let op = VmOp::Clone(spec);
        let task = Arc::new(AsyncVmTask::new(
            op.label(),
            VmOperation::new(self.connector.clone(), op),
        ));

        spawn_task_monitor(
            instance.clone(),
            task,
            self.task_timeout,
            MonitorOutcome {
                on_success: InstanceStatus::Starting,
                mark_ready: true,
            },
        );
        Ok(instance)
    }

    /// Request a stop for a running instance.
    ///
    /// Marks the instance [`InstanceStatus::ScheduledToStop`] and powers it
    /// off in the background; the status poller settles it into `Stopped`
    /// once the backend reports the machine off.
    pub async fn stop_instance(&self, name: &str) -> Result<Arc<Instance>> {
        let instance = self
            .pool
            .get(name)
            .ok_or_else(|| PoolError::InstanceNotFound(name.to_string()))?;

        let status = instance.status();
        if !status.can_transition_to(InstanceStatus::ScheduledToStop) {
            return Err(PoolError::InvalidState {
                name: name.to_string(),
                operation: "stop",
                status: status.status_str(),
            });
        }
        instance.set_status(InstanceStatus::ScheduledToStop);

        let op = VmOp::PowerOff(name.to_string());
        let task = Arc::new(AsyncVmTask::new(
            op.label(),
            VmOperation::new(self.connector.clone(), op),
        ));
        spawn_task_monitor(
            instance.clone(),
            task,
            self.task_timeout,
            MonitorOutcome {
                on_success: InstanceStatus::Stopping,
                mark_ready: false,
            },
        );
        Ok(instance)
    }

    /// Delete a stopped or failed instance from the backend.
    ///
    /// The instance stays tracked until the status poller confirms the
    /// backend no longer knows the machine.
    pub async fn remove_instance(&self, name: &str) -> Result<Arc<Instance>> {
        let instance = self
            .pool
            .get(name)
            .ok_or_else(|| PoolError::InstanceNotFound(name.to_string()))?;

        let status = instance.status();
        if !status.can_be_removed() {
            return Err(PoolError::InvalidState {
                name: name.to_string(),
                operation: "remove",
                status: status.status_str(),
            });
        }

        let op = VmOp::Delete(name.to_string());
        let task = Arc::new(AsyncVmTask::new(
            op.label(),
            VmOperation::new(self.connector.clone(), op),
        ));
        // Keep the current status; deletion is confirmed by the poller
        // observing the machine gone.
        spawn_task_monitor(
            instance.clone(),
            task,
            self.task_timeout,
            MonitorOutcome {
                on_success: status,
                mark_ready: false,
            },
        );
        Ok(instance)
    }
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("image", &self.pool.image().name)
            .field("task_timeout", &self.task_timeout)
            .finish()
    }
}

/// Build the clone parameters for an instance of an image.
fn clone_spec(image: &ImageConfig, instance: &Instance) -> CloneSpec {
    CloneSpec {
        source_vm: image.source_vm.clone(),
        snapshot: image.snapshot.clone(),
        target_name: instance.name().to_string(),
        folder: image.folder.clone(),
        resource_pool: image.resource_pool.clone(),
        linked_clone: image.behaviour.is_linked(),
        guest_properties: instance
            .user_data()
            .guest_properties(instance.name(), &image.name),
    }
}

/// How a task monitor settles its instance on success.
#[derive(Debug, Clone, Copy)]
pub struct MonitorOutcome {
    /// Status to apply when the backend task succeeds.
    pub on_success: InstanceStatus,
    /// Whether success makes the instance usable.
    pub mark_ready: bool,
}

/// Spawn a detached task that waits for a backend task and settles the
/// instance: `outcome.on_success` when the task succeeds, `Error` with the
/// carried message when it fails.
pub fn spawn_task_monitor(
    instance: Arc<Instance>,
    task: Arc<AsyncVmTask>,
    timeout: Duration,
    outcome: MonitorOutcome,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = task.wait(timeout).await;
        if result.is_failed() {
            warn!(
                instance = %instance.name(),
                task = %task.name(),
                error = %result.message(),
                "backend task failed"
            );
            instance.set_status(InstanceStatus::Error);
            instance.set_ready(false);
        } else {
            info!(
                instance = %instance.name(),
                task = %task.name(),
                "backend task completed"
            );
            // The status poller may have observed the machine progress past
            // on_success already; don't step it backwards.
            if instance.status().can_transition_to(outcome.on_success) {
                instance.set_status(outcome.on_success);
            }
            instance.set_ready(outcome.mark_ready);
        }
    })
}
