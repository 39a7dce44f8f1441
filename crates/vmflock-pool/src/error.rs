// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for vmflock-pool.

use thiserror::Error;

/// Pool errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// The image already has its maximum number of counted instances.
    /// Non-retryable until capacity frees up.
    #[error("image {image} is at its limit of {limit} instances")]
    CapacityExceeded {
        /// Image whose limit was hit.
        image: String,
        /// Configured maximum instance count.
        limit: usize,
    },

    /// No tracked instance with the given name.
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// The instance is in a state that does not allow the requested
    /// operation.
    #[error("instance {name} cannot {operation} while {status}")]
    InvalidState {
        /// Instance name.
        name: String,
        /// Requested operation.
        operation: &'static str,
        /// Current status.
        status: &'static str,
    },
}

/// Result type using [`PoolError`].
pub type Result<T> = std::result::Result<T, PoolError>;
