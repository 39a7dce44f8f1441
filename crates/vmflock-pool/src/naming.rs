// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Collision-free instance name generation.
//!
//! Names are `{image}-{n}` with `n` drawn from a durable per-image counter
//! file, so names stay unique across process restarts. Losing the counter
//! store must never block provisioning: when the store is unreadable the
//! allocator degrades to a large randomized suffix, disjoint from the normal
//! small-integer sequence with overwhelming probability.

use std::io;
use std::path::PathBuf;

use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Randomized fallback suffixes are strictly greater than this floor.
pub const FALLBACK_FLOOR: u64 = 100_000;

/// Durable, per-image instance name allocator.
///
/// One allocator owns a directory of counter files, one file per image,
/// holding the highest index issued so far. The read-increment-write cycle
/// is serialized by an internal lock, so concurrent allocations never see
/// the same counter value.
pub struct NameAllocator {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl NameAllocator {
    /// Create an allocator over a counter directory. The directory is
    /// created if it does not exist yet; failing to create it is not fatal
    /// (allocation falls back to randomized names).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            debug!(dir = %dir.display(), error = %e, "could not create counter store directory");
        }
        Self {
            dir,
            lock: Mutex::new(()),
        }
    }

    /// Allocate the next name for an image.
    ///
    /// With a live counter store the sequence is `{image}-1`, `{image}-2`,
    /// strictly increasing for the lifetime of the store. An absent counter
    /// file means no prior allocations. An unreadable, corrupt, or deleted
    /// store yields a randomized name with suffix above [`FALLBACK_FLOOR`]
    /// instead of an error.
    pub async fn next_name(&self, image: &str) -> String {
        let _guard = self.lock.lock().await;
        match self.next_index(image).await {
            Ok(index) => format!("{image}-{index}"),
            Err(e) => {
                warn!(
                    image = %image,
                    error = %e,
                    "counter store unavailable, falling back to randomized name"
                );
                let suffix = rand::thread_rng().gen_range(FALLBACK_FLOOR + 1..u64::from(u32::MAX));
                format!("{image}-{suffix}")
            }
        }
    }

    /// Read, increment, and persist the counter for an image.
    async fn next_index(&self, image: &str) -> io::Result<u64> {
        let path = self.dir.join(format!("{image}.idx"));
        let current = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents.trim().parse::<u64>().map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("corrupt counter file {}: {e}", path.display()),
                )
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };
        let next = current + 1;

        // Write through a temp file so a crash leaves either the old or the
        // new counter, never a torn one.
        let tmp = self.dir.join(format!("{image}.idx.tmp"));
        tokio::fs::write(&tmp, next.to_string()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(next)
    }
}

impl std::fmt::Debug for NameAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameAllocator").field("dir", &self.dir).finish()
    }
}
