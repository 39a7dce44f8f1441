// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance status and the shared instance handle.
//!
//! An [`Instance`] represents one VM-backed build agent belonging to an
//! image. Handles are shared (`Arc<Instance>`) between the pool, the status
//! poller, and provisioning monitors; status and readiness mutate through
//! interior locks so every holder observes the same lifecycle.

use std::fmt;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::user_data::AgentUserData;

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Accepted for start; the backend clone has not completed yet.
    ScheduledToStart,
    /// The backend machine exists and is booting.
    Starting,
    /// The machine is powered on and serving.
    Running,
    /// A stop was requested; the power-off has not completed yet.
    ScheduledToStop,
    /// The machine is shutting down.
    Stopping,
    /// The machine is powered off but still exists on the backend.
    Stopped,
    /// Provisioning or the machine itself failed.
    Error,
    /// The last status probe failed; self-heals on the next successful probe.
    Unknown,
}

impl InstanceStatus {
    /// Get the status string.
    pub fn status_str(&self) -> &'static str {
        match self {
            InstanceStatus::ScheduledToStart => "scheduled_to_start",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::ScheduledToStop => "scheduled_to_stop",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Error => "error",
            InstanceStatus::Unknown => "unknown",
        }
    }

    /// Whether the instance settled into a state it will keep without
    /// intervention.
    pub fn is_permanent(&self) -> bool {
        matches!(self, InstanceStatus::Running | InstanceStatus::Stopped)
    }

    /// Whether an instance in this status may leave the tracked set once the
    /// backend confirms the machine is gone.
    pub fn can_be_removed(&self) -> bool {
        matches!(self, InstanceStatus::Stopped | InstanceStatus::Error)
    }

    /// Whether this status counts toward the image's instance limit.
    ///
    /// A stopped machine still holds a backend identity, so whether it
    /// counts is an operator policy; every other tracked status counts
    /// unconditionally.
    pub fn counts_toward_limit(&self, count_stopped: bool) -> bool {
        match self {
            InstanceStatus::Stopped => count_stopped,
            _ => true,
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `Unknown` is reachable from anywhere (a failed probe) and may heal to
    /// anywhere (the next successful probe). `Error` is reachable from any
    /// active state, since provisioning can fail before the machine runs.
    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        if *self == next || next == Unknown || *self == Unknown || next == Error {
            return true;
        }
        matches!(
            (*self, next),
            (ScheduledToStart, Starting)
                | (Starting, Running)
                | (Running, ScheduledToStop)
                | (ScheduledToStop, Stopping)
                | (Stopping, Stopped)
                | (Running, Stopped)
                | (Stopped, ScheduledToStart)
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.status_str())
    }
}

struct StatusEntry {
    status: InstanceStatus,
    updated_at: DateTime<Utc>,
}

/// One VM-backed build agent tracked by a pool.
pub struct Instance {
    name: String,
    snapshot: Option<String>,
    user_data: AgentUserData,
    state: RwLock<StatusEntry>,
    ready: AtomicBool,
}

impl Instance {
    /// Create an instance in [`InstanceStatus::ScheduledToStart`].
    pub fn new(name: impl Into<String>, snapshot: Option<String>, user_data: AgentUserData) -> Self {
        Self {
            name: name.into(),
            snapshot,
            user_data,
            state: RwLock::new(StatusEntry {
                status: InstanceStatus::ScheduledToStart,
                updated_at: Utc::now(),
            }),
            ready: AtomicBool::new(false),
        }
    }

    /// Instance name, unique within the image.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot the instance was cloned from, if any.
    pub fn snapshot(&self) -> Option<&str> {
        self.snapshot.as_deref()
    }

    /// User data the booting agent was provisioned with.
    pub fn user_data(&self) -> &AgentUserData {
        &self.user_data
    }

    /// Current status.
    pub fn status(&self) -> InstanceStatus {
        self.read_state().status
    }

    /// When the status last changed.
    pub fn status_updated_at(&self) -> DateTime<Utc> {
        self.read_state().updated_at
    }

    /// Apply a status update and stamp the transition time.
    ///
    /// Status is owned by the backend probes, so surprising transitions are
    /// applied (the backend is the truth) and logged.
    pub fn set_status(&self, next: InstanceStatus) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.status == next {
            return;
        }
        if !state.status.can_transition_to(next) {
            debug!(
                instance = %self.name,
                from = %state.status,
                to = %next,
                "unexpected status transition"
            );
        }
        state.status = next;
        state.updated_at = Utc::now();
    }

    /// Whether provisioning handed the instance off as usable.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Set the readiness flag.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Whether the instance settled into Running or Stopped.
    pub fn is_in_permanent_status(&self) -> bool {
        self.status().is_permanent()
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, StatusEntry> {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read_state();
        f.debug_struct("Instance")
            .field("name", &self.name)
            .field("status", &state.status)
            .field("updated_at", &state.updated_at)
            .field("ready", &self.is_ready())
            .finish()
    }
}
