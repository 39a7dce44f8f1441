// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lazy, single-execution wrapper around a backend task.
//!
//! [`AsyncVmTask`] turns a fire-and-forget backend task handle into a
//! pollable, cancellable, timeout-aware asynchronous result. Construction is
//! inert: the deferred producer call is issued on first access, exactly once,
//! no matter how many callers race on it. Once a terminal outcome is reached
//! (backend success, backend fault, submission failure, or exhausted poll
//! retries) it is cached and every later access returns the same value.
//!
//! Transport blips during polling are absorbed: up to
//! [`FAILURE_COUNT_THRESHOLD`] consecutive poll failures read as "still
//! pending", the next one turns into a terminal failure carrying the last
//! error. A successful probe resets the streak.

use std::fmt;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

use crate::task::{RemoteTask, TaskOutcome, TaskPoll, TaskProducer, TaskState};

/// Consecutive transient poll failures tolerated before the task is declared
/// failed. The next failure after the threshold is terminal.
pub const FAILURE_COUNT_THRESHOLD: u32 = 3;

/// Result of the one-shot submission.
enum Submission {
    /// The producer returned a handle; the task is running on the backend.
    InFlight(Arc<dyn RemoteTask>),
    /// The producer failed before returning a handle. Terminal, never retried.
    Rejected(String),
}

/// Lazily-submitted, pollable, cancellable backend task.
///
/// Any number of callers may share one wrapper behind an `Arc` and call
/// [`submit`](Self::submit), [`poll`](Self::poll), [`wait`](Self::wait) and
/// [`cancel`](Self::cancel) concurrently; the underlying remote call is
/// issued exactly once.
pub struct AsyncVmTask {
    name: String,
    producer: Mutex<Option<Box<dyn TaskProducer>>>,
    submission: OnceCell<Submission>,
    started_at: OnceLock<DateTime<Utc>>,
    cancelled: AtomicBool,
    consecutive_failures: AtomicU32,
    terminal: OnceLock<TaskOutcome>,
}

impl AsyncVmTask {
    /// Create an inert wrapper. No remote call is made until the first
    /// access to the result.
    pub fn new(name: impl Into<String>, producer: impl TaskProducer + 'static) -> Self {
        Self {
            name: name.into(),
            producer: Mutex::new(Some(Box::new(producer))),
            submission: OnceCell::new(),
            started_at: OnceLock::new(),
            cancelled: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            terminal: OnceLock::new(),
        }
    }

    /// Human-readable task label, for diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// When the underlying remote call was issued. `None` until the first
    /// [`submit`](Self::submit)/[`poll`](Self::poll)/[`wait`](Self::wait).
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at.get().copied()
    }

    /// Whether a cancellation request was accepted by the backend. Reflects
    /// the local flag only; the remote operation may still run to completion.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Issue the underlying remote call if it has not been issued yet and
    /// return the current view of the task. Idempotent.
    pub async fn submit(&self) -> TaskPoll {
        match self.submission().await {
            Submission::Rejected(message) => {
                TaskPoll::Complete(self.settle(TaskOutcome::failed(message.clone())))
            }
            Submission::InFlight(_) => match self.terminal.get() {
                Some(outcome) => TaskPoll::Complete(outcome.clone()),
                None => TaskPoll::Pending,
            },
        }
    }

    /// Non-blocking completion check.
    ///
    /// Submits the task first if needed. Transient probe failures count
    /// toward the failure streak and read as [`TaskPoll::Pending`] until the
    /// streak exceeds [`FAILURE_COUNT_THRESHOLD`]; then the task settles into
    /// a terminal failure carrying the last error.
    pub async fn poll(&self) -> TaskPoll {
        let task = match self.submission().await {
            Submission::Rejected(message) => {
                return TaskPoll::Complete(self.settle(TaskOutcome::failed(message.clone())));
            }
            Submission::InFlight(task) => task.clone(),
        };

        if let Some(outcome) = self.terminal.get() {
            return TaskPoll::Complete(outcome.clone());
        }

        match task.state().await {
            Ok(TaskState::Pending) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                TaskPoll::Pending
            }
            Ok(state) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                let outcome = self.finalize(&task, state, Duration::ZERO, Duration::ZERO).await;
                TaskPoll::Complete(self.settle(outcome))
            }
            Err(e) => {
                let streak = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if streak > FAILURE_COUNT_THRESHOLD {
                    warn!(
                        task = %self.name,
                        failures = streak,
                        error = %e,
                        "task poll failures exceeded threshold, declaring task failed"
                    );
                    TaskPoll::Complete(self.settle(TaskOutcome::failed(e.to_string())))
                } else {
                    debug!(task = %self.name, failures = streak, error = %e, "transient poll failure");
                    TaskPoll::Pending
                }
            }
        }
    }

    /// Suspend until the task reaches a terminal outcome or `timeout`
    /// elapses. The budget is split in half between the backend's two wait
    /// phases. Errors during the wait become a failure outcome; nothing is
    /// propagated raw.
    pub async fn wait(&self, timeout: Duration) -> TaskOutcome {
        let task = match self.submission().await {
            Submission::Rejected(message) => {
                return self.settle(TaskOutcome::failed(message.clone()));
            }
            Submission::InFlight(task) => task.clone(),
        };

        if let Some(outcome) = self.terminal.get() {
            return outcome.clone();
        }

        let half = timeout / 2;
        let outcome = match task.state().await {
            Ok(state @ (TaskState::Success | TaskState::Error)) => {
                self.finalize(&task, state, Duration::ZERO, Duration::ZERO).await
            }
            _ => match task.wait(half, half).await {
                Ok(message) => match task.state().await {
                    Ok(TaskState::Error) => TaskOutcome::failed(self.fault_message(&task).await),
                    Ok(_) => TaskOutcome::success(message),
                    Err(e) => TaskOutcome::failed(e.to_string()),
                },
                Err(e) => TaskOutcome::failed(e.to_string()),
            },
        };
        self.settle(outcome)
    }

    /// Request cancellation on the backend. Returns whether the request was
    /// accepted; only then is the local cancelled flag raised. A rejection is
    /// final and is not retried.
    pub async fn cancel(&self) -> bool {
        let task = match self.submission().await {
            Submission::Rejected(_) => return false,
            Submission::InFlight(task) => task.clone(),
        };

        match task.cancel().await {
            Ok(()) => {
                self.cancelled.store(true, Ordering::SeqCst);
                debug!(task = %self.name, "cancellation accepted by backend");
                true
            }
            Err(e) => {
                debug!(task = %self.name, error = %e, "cancellation rejected by backend");
                false
            }
        }
    }

    /// Drive the one-shot submission. Concurrent first callers block on each
    /// other only for the duration of the producer call itself.
    async fn submission(&self) -> &Submission {
        self.submission
            .get_or_init(|| async {
                let producer = self.producer.lock().await.take();
                let Some(producer) = producer else {
                    // Unreachable: the OnceCell runs this initializer once.
                    return Submission::Rejected("task producer already consumed".to_string());
                };
                match producer.produce().await {
                    Ok(task) => {
                        let _ = self.started_at.set(Utc::now());
                        debug!(task = %self.name, "task submitted");
                        Submission::InFlight(task)
                    }
                    Err(e) => {
                        warn!(task = %self.name, error = %e, "task submission failed");
                        Submission::Rejected(e.to_string())
                    }
                }
            })
            .await
    }

    /// Fetch the terminal outcome for a completed task.
    async fn finalize(
        &self,
        task: &Arc<dyn RemoteTask>,
        state: TaskState,
        connect: Duration,
        finish: Duration,
    ) -> TaskOutcome {
        if state == TaskState::Error {
            return TaskOutcome::failed(self.fault_message(task).await);
        }
        // The task already completed; the wait call returns promptly with the
        // backend's result message.
        match task.wait(connect, finish).await {
            Ok(message) => TaskOutcome::success(message),
            Err(_) => TaskOutcome::success(String::new()),
        }
    }

    async fn fault_message(&self, task: &Arc<dyn RemoteTask>) -> String {
        task.error_message()
            .await
            .unwrap_or_else(|| "Unknown error".to_string())
    }

    /// Cache the terminal outcome, first writer wins. Returns the cached
    /// value so racing settlers observe one consistent result.
    fn settle(&self, outcome: TaskOutcome) -> TaskOutcome {
        self.terminal.get_or_init(|| outcome).clone()
    }
}

impl fmt::Debug for AsyncVmTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncVmTask")
            .field("name", &self.name)
            .field("started_at", &self.started_at.get())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
