// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that drives the instance state machine.
//!
//! The backend owns the truth about machine state. The poller periodically
//! probes every tracked instance and applies what it finds:
//! - a successful probe maps the power state onto the instance status and
//!   heals `Unknown`,
//! - a failed probe marks the instance `Unknown` until a probe succeeds,
//! - a backend that no longer knows the machine gets the instance removed
//!   from the pool, once its status allows removal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};
use vmflock_connector::{PowerState, VirtConnector};

use crate::instance::{Instance, InstanceStatus};
use crate::pool::InstancePool;

/// Configuration for the status poller.
#[derive(Debug, Clone)]
pub struct StatusPollerConfig {
    /// How often to probe tracked instances.
    pub poll_interval: Duration,
}

impl Default for StatusPollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// Background worker that reconciles pool state with the backend.
pub struct StatusPoller {
    pool: Arc<InstancePool>,
    connector: Arc<dyn VirtConnector>,
    config: StatusPollerConfig,
    shutdown: Arc<Notify>,
}

impl StatusPoller {
    /// Create a poller over a pool and its backend.
    pub fn new(
        pool: Arc<InstancePool>,
        connector: Arc<dyn VirtConnector>,
        config: StatusPollerConfig,
    ) -> Self {
        Self {
            pool,
            connector,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the poll loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            image = %self.pool.image().name,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "status poller started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(image = %self.pool.image().name, "status poller received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.refresh().await;
                }
            }
        }

        info!(image = %self.pool.image().name, "status poller stopped");
    }

    /// Probe every tracked instance once and apply the results.
    ///
    /// Public so callers (and tests) can drive a deterministic cycle.
    pub async fn refresh(&self) {
        for instance in self.pool.instances() {
            self.refresh_instance(&instance).await;
        }
    }

    async fn refresh_instance(&self, instance: &Arc<Instance>) {
        let current = instance.status();
        match self.connector.vm_info(instance.name()).await {
            Ok(Some(info)) => {
                let next = map_power_state(info.power, current);
                if next != current {
                    debug!(
                        instance = %instance.name(),
                        from = %current,
                        to = %next,
                        "status probe applied"
                    );
                }
                instance.set_status(next);
            }
            Ok(None) => {
                // The clone task has not created the machine yet; absence is
                // expected and not an error.
                if current == InstanceStatus::ScheduledToStart {
                    return;
                }
                if current.can_be_removed() {
                    self.pool.remove(instance.name());
                } else {
                    warn!(
                        instance = %instance.name(),
                        status = %current,
                        "backend no longer knows this machine"
                    );
                    instance.set_status(InstanceStatus::Error);
                }
            }
            Err(e) => {
                debug!(instance = %instance.name(), error = %e, "status probe failed");
                instance.set_status(InstanceStatus::Unknown);
            }
        }
    }
}

/// Map a backend power state onto an instance status, keeping transitional
/// statuses the pool itself set.
fn map_power_state(power: PowerState, current: InstanceStatus) -> InstanceStatus {
    match power {
        PowerState::PoweredOn => match current {
            // A machine scheduled to stop is still powered on; don't bounce
            // it back to Running.
            InstanceStatus::ScheduledToStop | InstanceStatus::Stopping => current,
            _ => InstanceStatus::Running,
        },
        PowerState::PoweredOff | PowerState::Suspended => match current {
            // Clones come up powered off before their first start.
            InstanceStatus::ScheduledToStart | InstanceStatus::Starting => current,
            _ => InstanceStatus::Stopped,
        },
    }
}
