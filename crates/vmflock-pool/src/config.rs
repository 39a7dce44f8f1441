// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Image configuration and counting policy.

use serde::{Deserialize, Serialize};

/// How instances are created from the source machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloneBehaviour {
    /// Every start clones a fresh machine; stopped clones are deleted.
    FreshClone,
    /// Clones are kept across stops and powered back on for reuse.
    StartStop,
    /// Fresh clones are linked clones off the configured snapshot.
    LinkedClone,
}

impl CloneBehaviour {
    /// Whether a stopped clone may be powered back on instead of recloned.
    pub fn reuses_stopped_clones(&self) -> bool {
        matches!(self, CloneBehaviour::StartStop)
    }

    /// Whether clones are linked to the snapshot rather than full copies.
    pub fn is_linked(&self) -> bool {
        matches!(self, CloneBehaviour::LinkedClone)
    }
}

/// A logical image: the template instances are cloned from, plus placement
/// and the instance limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Logical image name; also the prefix for generated instance names.
    pub name: String,
    /// Source machine to clone.
    pub source_vm: String,
    /// Snapshot of the source to clone from, if any.
    pub snapshot: Option<String>,
    /// Clone behaviour.
    pub behaviour: CloneBehaviour,
    /// Placement folder on the backend.
    pub folder: Option<String>,
    /// Resource pool clones are placed in.
    pub resource_pool: Option<String>,
    /// Maximum number of counted instances.
    pub max_instances: usize,
}

/// Which instance statuses count toward the image limit.
///
/// Stopped machines still hold backend identity (disk, name, MAC) even
/// though they are not running, and operators want either policy. The value
/// is passed explicitly into every capacity check;
/// [`from_env`](Self::from_env) reads the override at call time so it can be
/// toggled on a live process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountingPolicy {
    /// Count stopped instances toward the limit.
    pub count_stopped: bool,
}

impl CountingPolicy {
    /// Environment variable read by [`from_env`](Self::from_env).
    pub const COUNT_STOPPED_ENV: &'static str = "VMFLOCK_COUNT_STOPPED_VMS";

    /// Build the policy from the process environment, reading the override
    /// fresh on every call.
    pub fn from_env() -> Self {
        let count_stopped = std::env::var(Self::COUNT_STOPPED_ENV)
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        Self { count_stopped }
    }

    /// Policy that counts stopped instances.
    pub fn counting_stopped() -> Self {
        Self { count_stopped: true }
    }
}
