// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! vmflock Connector - Virtualization Backend Boundary
//!
//! This crate defines the surface vmflock consumes from a remote
//! virtualization management endpoint, and the machinery that turns the
//! backend's fire-and-forget task handles into tracked asynchronous results.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      vmflock-pool                             │
//! │        (instance accounting, naming, status polling)          │
//! └───────────────────────────────────────────────────────────────┘
//!                │ VmOperation                  │ vm_info
//!                ▼                              ▼
//! ┌───────────────────────────────────────────────────────────────┐
//! │                vmflock-connector (This Crate)                 │
//! │  ┌──────────────┐  ┌───────────────┐  ┌──────────────────┐    │
//! │  │  AsyncVmTask │  │ VirtConnector │  │  MockConnector   │    │
//! │  │   wrapper    │  │     trait     │  │   (testing)      │    │
//! │  └──────────────┘  └───────────────┘  └──────────────────┘    │
//! └───────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌───────────────────────────────────────────────────────────────┐
//! │              Virtualization management endpoint               │
//! │          (owns VM state and server-side task state)           │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Task Lifecycle
//!
//! An [`AsyncVmTask`](wrapper::AsyncVmTask) is constructed inert around a
//! deferred [`TaskProducer`](task::TaskProducer). The first access to its
//! result issues the producer call exactly once, even under concurrent first
//! access. From there:
//!
//! | Access | Behavior |
//! |--------|----------|
//! | `submit()` | Idempotent; issues the call if needed |
//! | `poll()` | Non-blocking state view, transient-failure tolerant |
//! | `wait(timeout)` | Suspends until terminal, budget split two-phase |
//! | `cancel()` | Advisory; true only when the backend accepted |
//!
//! Terminal outcomes (success, backend fault, submission failure, exhausted
//! poll retries) are cached: every later access returns the same
//! [`TaskOutcome`](task::TaskOutcome). Failures are data carried in the
//! outcome, never raised out of `poll()`/`wait()`.
//!
//! # Modules
//!
//! - [`connector`]: backend operation and status-probe traits
//! - [`error`]: error types for connector operations
//! - [`mock`]: in-memory backend for tests
//! - [`task`]: task handle capability set and outcome types
//! - [`wrapper`]: the lazy single-execution task wrapper

#![deny(missing_docs)]

/// Backend operation and status-probe traits.
pub mod connector;

/// Error types for connector operations.
pub mod error;

/// Mock backend for testing.
pub mod mock;

/// Task handle capability set and outcome types.
pub mod task;

/// Lazy single-execution wrapper around a backend task.
pub mod wrapper;

pub use connector::{CloneSpec, PowerState, VirtConnector, VmInfo, VmOp, VmOperation};
pub use error::{ConnectorError, Result};
pub use task::{RemoteTask, TaskOutcome, TaskPoll, TaskProducer, TaskState};
pub use wrapper::AsyncVmTask;
