// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for vmflock-connector.

use thiserror::Error;

/// Errors from backend connector operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConnectorError {
    /// Transport-level failure talking to the backend. Task polling treats
    /// these as transient and tolerates a bounded number of them in a row.
    #[error("transport error: {0}")]
    Transport(String),

    /// The call that submits a backend task failed before a handle was
    /// returned. Never retried.
    #[error("task submission failed: {0}")]
    Submission(String),

    /// The backend has no virtual machine with the given name.
    #[error("virtual machine not found: {0}")]
    VmNotFound(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using [`ConnectorError`].
pub type Result<T> = std::result::Result<T, ConnectorError>;
