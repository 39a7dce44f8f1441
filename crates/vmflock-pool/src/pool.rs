// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded per-image instance tracking.
//!
//! The pool owns the set of instances associated with one image and decides
//! whether a new instance may start. Add/remove/count operations take a
//! short in-process lock and never wait on the backend.
//!
//! `can_start_new_instance` followed by `start_new_instance` is deliberately
//! check-then-act: name allocation sits between the capacity check and the
//! insert, and holding the set lock across it would serialize every start
//! behind file I/O. Concurrent callers can therefore transiently overshoot
//! the limit by at most the number of racing callers; callers that need a
//! hard bound serialize starts themselves.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

use crate::config::{CountingPolicy, ImageConfig};
use crate::error::{PoolError, Result};
use crate::instance::{Instance, InstanceStatus};
use crate::naming::NameAllocator;
use crate::user_data::AgentUserData;

/// Tracked instances of one image, bounded by the image's instance limit.
pub struct InstancePool {
    image: ImageConfig,
    allocator: Arc<NameAllocator>,
    instances: Mutex<HashMap<String, Arc<Instance>>>,
}

impl InstancePool {
    /// Create an empty pool for an image.
    pub fn new(image: ImageConfig, allocator: Arc<NameAllocator>) -> Self {
        Self {
            image,
            allocator,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// The image this pool tracks.
    pub fn image(&self) -> &ImageConfig {
        &self.image
    }

    /// Whether a new instance may start under the given counting policy:
    /// true iff the number of counted instances is strictly below the
    /// image's limit.
    pub fn can_start_new_instance(&self, policy: &CountingPolicy) -> bool {
        self.counted_instances(policy) < self.image.max_instances
    }

    /// Number of instances counting toward the limit under a policy.
    pub fn counted_instances(&self, policy: &CountingPolicy) -> usize {
        self.instance_count(|status| status.counts_toward_limit(policy.count_stopped))
    }

    /// Count tracked instances whose status matches a predicate.
    pub fn instance_count<F>(&self, predicate: F) -> usize
    where
        F: Fn(InstanceStatus) -> bool,
    {
        self.lock_instances()
            .values()
            .filter(|instance| predicate(instance.status()))
            .count()
    }

    /// Admit a new instance: check capacity, allocate a name, and track the
    /// instance in [`InstanceStatus::ScheduledToStart`].
    ///
    /// Does not touch the backend and does not wait for the instance to
    /// become running; callers hand the returned instance to the
    /// provisioner and observe progress through status updates.
    pub async fn start_new_instance(
        &self,
        user_data: &AgentUserData,
        policy: &CountingPolicy,
    ) -> Result<Arc<Instance>> {
        if !self.can_start_new_instance(policy) {
            return Err(PoolError::CapacityExceeded {
                image: self.image.name.clone(),
                limit: self.image.max_instances,
            });
        }

        let name = self.allocator.next_name(&self.image.name).await;
        let instance = Arc::new(Instance::new(
            name.clone(),
            self.image.snapshot.clone(),
            user_data.clone(),
        ));
        self.lock_instances().insert(name.clone(), instance.clone());

        info!(
            image = %self.image.name,
            instance = %name,
            counted = self.counted_instances(policy),
            limit = self.image.max_instances,
            "instance admitted"
        );
        Ok(instance)
    }

    /// Look up a tracked instance by name.
    pub fn get(&self, name: &str) -> Option<Arc<Instance>> {
        self.lock_instances().get(name).cloned()
    }

    /// Snapshot of all tracked instances.
    pub fn instances(&self) -> Vec<Arc<Instance>> {
        self.lock_instances().values().cloned().collect()
    }

    /// Drop an instance from the tracked set.
    ///
    /// Called by the status poller once the backend confirms the machine no
    /// longer exists; a merely stopped machine stays tracked.
    pub fn remove(&self, name: &str) -> Option<Arc<Instance>> {
        let removed = self.lock_instances().remove(name);
        if let Some(instance) = &removed {
            info!(
                image = %self.image.name,
                instance = %name,
                status = %instance.status(),
                "instance removed from pool"
            );
        }
        removed
    }

    fn lock_instances(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Instance>>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstancePool")
            .field("image", &self.image.name)
            .field("tracked", &self.lock_instances().len())
            .field("limit", &self.image.max_instances)
            .finish()
    }
}
