//! Ephemera lifecycle registry: one expiry timer per workload instance.
//!
//! Per key the lifecycle is `Absent -> Armed -> (Fired | Cancelled) -> Absent`.
//!
//! Every arm gets a fresh generation number. A timer task only runs its destroy future after it
//! removed the entry carrying its own generation, so a replaced or cancelled timer can never fire,
//! and a fired timer is already absent when its destroy runs. Entries live in a sharded map; keys
//! in different shards never contend.

#![forbid(unsafe_code)]

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::{mapref::entry::Entry, DashMap};
use ephemera_core::InstanceKey;
use metrics::{counter, gauge};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

struct Armed {
    generation: u64,
    deadline: Instant,
    handle: JoinHandle<()>,
}

/// Result of [`LifecycleRegistry::arm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmOutcome {
    /// The key had no timer.
    Armed,
    /// A pending timer for the key was disarmed and replaced.
    Replaced,
}

/// Shared table of pending expiry timers. Construct once and hand out by reference or `Arc`.
pub struct LifecycleRegistry {
    timers: Arc<DashMap<InstanceKey, Armed>>,
    next_generation: AtomicU64,
}

impl Default for LifecycleRegistry {
    fn default() -> Self { Self::new() }
}

impl LifecycleRegistry {
    pub fn new() -> Self {
        Self { timers: Arc::new(DashMap::new()), next_generation: AtomicU64::new(1) }
    }

    /// Arm a timer that runs `destroy` once `lifetime` has elapsed. A pending timer for the same
    /// key is disarmed first and its destroy never runs.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm<F, E>(&self, key: InstanceKey, lifetime: Duration, destroy: F) -> ArmOutcome
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + lifetime;
        // The shard stays write-locked until the new entry is in place, so even a zero lifetime
        // cannot fire before it is visible.
        let outcome = match self.timers.entry(key.clone()) {
            Entry::Occupied(mut o) => {
                let handle = spawn_timer(Arc::clone(&self.timers), key.clone(), generation, deadline, destroy);
                let old = o.insert(Armed { generation, deadline, handle });
                old.handle.abort();
                ArmOutcome::Replaced
            }
            Entry::Vacant(v) => {
                let handle = spawn_timer(Arc::clone(&self.timers), key.clone(), generation, deadline, destroy);
                v.insert(Armed { generation, deadline, handle });
                ArmOutcome::Armed
            }
        };
        if outcome == ArmOutcome::Replaced {
            counter!("lifecycle_replaced_total", 1u64);
        }
        gauge!("lifecycle_armed", self.timers.len() as f64);
        info!(key = %key, lifetime_secs = lifetime.as_secs(), replaced = (outcome == ArmOutcome::Replaced), "timer armed");
        outcome
    }

    /// Disarm the timer for `key` without running its destroy. Returns `false` (and only logs) when
    /// nothing was armed.
    pub fn cancel(&self, key: &InstanceKey) -> bool {
        match self.timers.remove(key) {
            Some((_, armed)) => {
                armed.handle.abort();
                counter!("lifecycle_cancelled_total", 1u64);
                gauge!("lifecycle_armed", self.timers.len() as f64);
                info!(key = %key, "timer stopped");
                true
            }
            None => {
                info!(key = %key, "timer not armed");
                false
            }
        }
    }

    pub fn is_armed(&self, key: &InstanceKey) -> bool { self.timers.contains_key(key) }

    /// Time left before `key` fires, if armed.
    pub fn remaining(&self, key: &InstanceKey) -> Option<Duration> {
        self.timers.get(key).map(|a| a.deadline.saturating_duration_since(Instant::now()))
    }

    pub fn len(&self) -> usize { self.timers.len() }

    pub fn is_empty(&self) -> bool { self.timers.is_empty() }

    /// Armed keys, sorted.
    pub fn armed_keys(&self) -> Vec<InstanceKey> {
        let mut keys: Vec<_> = self.timers.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Disarm everything; destroys do not run. Returns how many timers were pending.
    pub fn shutdown(&self) -> usize {
        let keys: Vec<InstanceKey> = self.timers.iter().map(|e| e.key().clone()).collect();
        let mut n = 0;
        for key in keys {
            if let Some((_, armed)) = self.timers.remove(&key) {
                armed.handle.abort();
                n += 1;
            }
        }
        gauge!("lifecycle_armed", self.timers.len() as f64);
        n
    }
}

fn spawn_timer<F, E>(
    timers: Arc<DashMap<InstanceKey, Armed>>,
    key: InstanceKey,
    generation: u64,
    deadline: Instant,
    destroy: F,
) -> JoinHandle<()>
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep_until(deadline).await;
        if timers.remove_if(&key, |_, armed| armed.generation == generation).is_none() {
            debug!(key = %key, generation, "timer superseded");
            return;
        }
        gauge!("lifecycle_armed", timers.len() as f64);
        counter!("lifecycle_fired_total", 1u64);
        info!(key = %key, "lifetime elapsed; destroying");
        match destroy.await {
            Ok(()) => info!(key = %key, "destroyed"),
            Err(e) => {
                counter!("lifecycle_destroy_err_total", 1u64);
                error!(key = %key, error = %e, "destroy failed");
            }
        }
    })
}
