// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backend task handle definitions.
//!
//! A virtualization backend executes long operations (clone, power on/off,
//! delete) as server-side tasks. The backend hands out an opaque handle that
//! can be polled, cancelled, and waited on; this module defines the capability
//! set vmflock consumes, together with the data types a finished task
//! produces.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Completion state reported by the backend for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// The task has not finished yet.
    Pending,
    /// The task finished successfully.
    Success,
    /// The task finished with a backend-reported error.
    Error,
}

/// Terminal result of a backend task.
///
/// Outcomes are data, not control flow: a failed task is a value carried out
/// of [`AsyncVmTask::poll`](crate::wrapper::AsyncVmTask::poll) and
/// [`AsyncVmTask::wait`](crate::wrapper::AsyncVmTask::wait), never a raised
/// error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// The task completed; `message` is the backend's result description.
    Success {
        /// Backend-provided result message (may be empty).
        message: String,
    },
    /// The task failed; `message` is the backend's localized fault message,
    /// the submission error, or the last transport error after retries were
    /// exhausted.
    Failed {
        /// Human-readable failure description.
        message: String,
    },
}

impl TaskOutcome {
    /// Build a success outcome.
    pub fn success(message: impl Into<String>) -> Self {
        TaskOutcome::Success {
            message: message.into(),
        }
    }

    /// Build a failure outcome.
    pub fn failed(message: impl Into<String>) -> Self {
        TaskOutcome::Failed {
            message: message.into(),
        }
    }

    /// Check if this outcome is a failure.
    pub fn is_failed(&self) -> bool {
        matches!(self, TaskOutcome::Failed { .. })
    }

    /// Get the carried message.
    pub fn message(&self) -> &str {
        match self {
            TaskOutcome::Success { message } | TaskOutcome::Failed { message } => message,
        }
    }
}

/// Non-blocking view of a wrapped task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPoll {
    /// The task is still in flight.
    Pending,
    /// The task reached a terminal outcome.
    Complete(TaskOutcome),
}

impl TaskPoll {
    /// Check if this view is terminal.
    pub fn is_complete(&self) -> bool {
        matches!(self, TaskPoll::Complete(_))
    }
}

/// Opaque handle to a task running on the virtualization backend.
///
/// Handles are issued by a [`VirtConnector`](crate::connector::VirtConnector)
/// operation. All methods may be called repeatedly and from any task;
/// implementations own whatever transport state that requires.
#[async_trait]
pub trait RemoteTask: Send + Sync {
    /// Query the backend for the task's completion state.
    ///
    /// Transport failures surface as
    /// [`ConnectorError::Transport`](crate::error::ConnectorError::Transport)
    /// and are retryable.
    async fn state(&self) -> Result<TaskState>;

    /// Fetch the backend's localized fault message for a failed task.
    ///
    /// `None` when the backend supplied no message (callers substitute
    /// `"Unknown error"`).
    async fn error_message(&self) -> Option<String>;

    /// Request cancellation. Best effort: `Ok(())` means the backend accepted
    /// the request, not that the operation stopped. A transport failure or a
    /// backend rejection surfaces as an error.
    async fn cancel(&self) -> Result<()>;

    /// Block until the task completes, in two phases: `connect` bounds the
    /// interim wait and `finish` bounds the finalizing wait, matching the
    /// backend's two-phase wait call. Returns the backend's result message.
    async fn wait(&self, connect: Duration, finish: Duration) -> Result<String>;
}

/// The deferred call that issues a backend task.
///
/// Producers are invoked at most once per
/// [`AsyncVmTask`](crate::wrapper::AsyncVmTask): the wrapper is lazy and
/// guards the call with a single-initialization primitive. A producer that
/// fails has failed for good; the wrapper never retries it.
#[async_trait]
pub trait TaskProducer: Send + Sync {
    /// Issue the remote operation and return its handle, or fail
    /// synchronously.
    async fn produce(&self) -> Result<std::sync::Arc<dyn RemoteTask>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_success() {
        let outcome = TaskOutcome::success("cloned");
        assert!(!outcome.is_failed());
        assert_eq!(outcome.message(), "cloned");
    }

    #[test]
    fn test_outcome_failed() {
        let outcome = TaskOutcome::failed("insufficient resources");
        assert!(outcome.is_failed());
        assert_eq!(outcome.message(), "insufficient resources");
    }

    #[test]
    fn test_poll_completeness() {
        assert!(!TaskPoll::Pending.is_complete());
        assert!(TaskPoll::Complete(TaskOutcome::success("")).is_complete());
    }

    #[test]
    fn test_outcome_serialization_roundtrip() {
        let outcome = TaskOutcome::failed("fault");
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("failed"));
    }
}
