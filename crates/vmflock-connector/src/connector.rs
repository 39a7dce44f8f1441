// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Virtualization backend interface.
//!
//! Defines the abstract surface vmflock consumes from a virtualization
//! management endpoint: clone/power/delete operations that return backend
//! task handles, and a per-name status probe that drives the instance state
//! machine.
//!
//! Connectors are PURE backend clients - they do not track instances or
//! enforce limits. Accounting is handled by the caller (vmflock-pool).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::task::{RemoteTask, TaskProducer};

/// Power state reported by the backend for a virtual machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    /// The machine is powered on.
    PoweredOn,
    /// The machine is powered off.
    PoweredOff,
    /// The machine is suspended.
    Suspended,
}

/// Snapshot of a virtual machine's backend-side state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    /// Machine name.
    pub name: String,
    /// Current power state.
    pub power: PowerState,
    /// When the backend last observed a state change for this machine.
    pub changed_at: DateTime<Utc>,
}

/// Parameters for cloning a source machine into a new instance.
#[derive(Debug, Clone)]
pub struct CloneSpec {
    /// Source machine to clone from.
    pub source_vm: String,
    /// Snapshot of the source to clone from, if any.
    pub snapshot: Option<String>,
    /// Name of the machine to create.
    pub target_name: String,
    /// Placement folder, if the backend supports folders.
    pub folder: Option<String>,
    /// Resource pool to place the clone in.
    pub resource_pool: Option<String>,
    /// Create a linked clone off the snapshot instead of a full copy.
    pub linked_clone: bool,
    /// Guest properties injected into the clone, readable by the booting
    /// agent.
    pub guest_properties: HashMap<String, String>,
}

/// Backend client for virtual machine lifecycle operations.
///
/// Long operations return a [`RemoteTask`] handle; the caller decides how to
/// track it (typically by wrapping it in an
/// [`AsyncVmTask`](crate::wrapper::AsyncVmTask) via [`VmOperation`]).
#[async_trait]
pub trait VirtConnector: Send + Sync {
    /// Clone a source machine (optionally from a snapshot) and power the
    /// clone on.
    async fn clone_vm(&self, spec: &CloneSpec) -> Result<Arc<dyn RemoteTask>>;

    /// Power a machine on.
    async fn power_on(&self, name: &str) -> Result<Arc<dyn RemoteTask>>;

    /// Power a machine off.
    async fn power_off(&self, name: &str) -> Result<Arc<dyn RemoteTask>>;

    /// Delete a machine from the backend.
    async fn delete_vm(&self, name: &str) -> Result<Arc<dyn RemoteTask>>;

    /// Probe a machine's current state.
    ///
    /// `Ok(None)` means the backend has no entity with this name - the
    /// signal the pool uses to drop an instance from its tracked set.
    async fn vm_info(&self, name: &str) -> Result<Option<VmInfo>>;
}

/// A deferred backend operation.
#[derive(Debug, Clone)]
pub enum VmOp {
    /// Clone a source machine into a new instance.
    Clone(CloneSpec),
    /// Power a machine on.
    PowerOn(String),
    /// Power a machine off.
    PowerOff(String),
    /// Delete a machine.
    Delete(String),
}

impl VmOp {
    /// Diagnostic label for the operation, used as the task name.
    pub fn label(&self) -> String {
        match self {
            VmOp::Clone(spec) => format!("clone {} -> {}", spec.source_vm, spec.target_name),
            VmOp::PowerOn(name) => format!("power on {name}"),
            VmOp::PowerOff(name) => format!("power off {name}"),
            VmOp::Delete(name) => format!("delete {name}"),
        }
    }
}

/// [`TaskProducer`] that issues a [`VmOp`] through a connector when the
/// wrapping task is first accessed.
pub struct VmOperation {
    connector: Arc<dyn VirtConnector>,
    op: VmOp,
}

impl VmOperation {
    /// Bind an operation to a connector.
    pub fn new(connector: Arc<dyn VirtConnector>, op: VmOp) -> Self {
        Self { connector, op }
    }

    /// Diagnostic label for the operation.
    pub fn label(&self) -> String {
        self.op.label()
    }
}

#[async_trait]
impl TaskProducer for VmOperation {
    async fn produce(&self) -> Result<Arc<dyn RemoteTask>> {
        match &self.op {
            VmOp::Clone(spec) => self.connector.clone_vm(spec).await,
            VmOp::PowerOn(name) => self.connector.power_on(name).await,
            VmOp::PowerOff(name) => self.connector.power_off(name).await,
            VmOp::Delete(name) => self.connector.delete_vm(name).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clone_spec(target: &str) -> CloneSpec {
        CloneSpec {
            source_vm: "base-agent".to_string(),
            snapshot: Some("ready".to_string()),
            target_name: target.to_string(),
            folder: None,
            resource_pool: None,
            linked_clone: true,
            guest_properties: HashMap::new(),
        }
    }

    #[test]
    fn test_op_labels() {
        assert_eq!(
            VmOp::Clone(clone_spec("agent-7")).label(),
            "clone base-agent -> agent-7"
        );
        assert_eq!(VmOp::PowerOn("agent-7".to_string()).label(), "power on agent-7");
        assert_eq!(VmOp::Delete("agent-7".to_string()).label(), "delete agent-7");
    }

    #[test]
    fn test_vm_info_serialization() {
        let info = VmInfo {
            name: "agent-1".to_string(),
            power: PowerState::PoweredOn,
            changed_at: Utc::now(),
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("powered_on"));
    }
}
