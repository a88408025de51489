//! Cross-workflow limiters.
//!
//! [`ResourceLimiter`] bounds how many workflow engines an owner (and the
//! node as a whole) may run at once. [`ExecutionRateLimiter`] bounds how
//! fast executions may start.

use std::collections::HashMap;
use std::num::NonZeroU32;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, DefaultKeyedRateLimiter, Quota, RateLimiter};
use parking_lot::Mutex;

use crate::error::{LimitScope, ResourceLimited};

/// Counting limiter with per-owner and global ceilings.
#[async_trait]
pub trait ResourceLimiter: Send + Sync {
    /// Take `n` units for `owner`.
    async fn use_slots(&self, owner: &str, n: usize) -> Result<(), ResourceLimited>;

    /// Return `n` units previously taken for `owner`.
    async fn free_slots(&self, owner: &str, n: usize);
}

/// In-memory [`ResourceLimiter`].
#[derive(Debug)]
pub struct WorkflowLimiter {
    per_owner: usize,
    global: usize,
    usage: Mutex<Usage>,
}

#[derive(Debug, Default)]
struct Usage {
    total: usize,
    by_owner: HashMap<String, usize>,
}

impl WorkflowLimiter {
    pub fn new(per_owner: usize, global: usize) -> Self {
        Self {
            per_owner,
            global,
            usage: Mutex::new(Usage::default()),
        }
    }

    /// Limiter that never denies.
    pub fn unbounded() -> Self {
        Self::new(usize::MAX, usize::MAX)
    }

    pub fn in_use(&self, owner: &str) -> usize {
        self.usage.lock().by_owner.get(owner).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ResourceLimiter for WorkflowLimiter {
    async fn use_slots(&self, owner: &str, n: usize) -> Result<(), ResourceLimited> {
        let mut usage = self.usage.lock();

        let owned = usage.by_owner.get(owner).copied().unwrap_or(0);
        if owned.saturating_add(n) > self.per_owner {
            return Err(ResourceLimited {
                scope: LimitScope::Owner,
                limit: self.per_owner,
            });
        }
        if usage.total.saturating_add(n) > self.global {
            return Err(ResourceLimited {
                scope: LimitScope::Global,
                limit: self.global,
            });
        }

        usage.total += n;
        *usage.by_owner.entry(owner.to_string()).or_default() += n;
        Ok(())
    }

    async fn free_slots(&self, owner: &str, n: usize) {
        let mut usage = self.usage.lock();
        usage.total = usage.total.saturating_sub(n);
        if let Some(owned) = usage.by_owner.get_mut(owner) {
            *owned = owned.saturating_sub(n);
            if *owned == 0 {
                usage.by_owner.remove(owner);
            }
        }
    }
}

/// Decides whether an execution may start now.
pub trait ExecutionRateLimiter: Send + Sync {
    fn allow(&self, owner: &str) -> Result<(), ResourceLimited>;
}

/// Token-bucket rate limiter with a global bucket and one bucket per owner.
pub struct GovernorRateLimiter {
    global: Option<DefaultDirectRateLimiter>,
    per_owner: Option<DefaultKeyedRateLimiter<String>>,
    global_rate: u32,
    owner_rate: u32,
}

impl GovernorRateLimiter {
    /// `global_per_sec` and `owner_per_sec` executions per second, each with
    /// the given burst. A zero rate disables that bucket.
    pub fn new(global_per_sec: u32, global_burst: u32, owner_per_sec: u32, owner_burst: u32) -> Self {
        Self {
            global: quota(global_per_sec, global_burst).map(RateLimiter::direct),
            per_owner: quota(owner_per_sec, owner_burst).map(RateLimiter::keyed),
            global_rate: global_per_sec,
            owner_rate: owner_per_sec,
        }
    }

    /// Limiter that never denies.
    pub fn unlimited() -> Self {
        Self::new(0, 0, 0, 0)
    }
}

fn quota(per_sec: u32, burst: u32) -> Option<Quota> {
    let rate = NonZeroU32::new(per_sec)?;
    let burst = NonZeroU32::new(burst).unwrap_or(rate);
    Some(Quota::per_second(rate).allow_burst(burst))
}

impl ExecutionRateLimiter for GovernorRateLimiter {
    fn allow(&self, owner: &str) -> Result<(), ResourceLimited> {
        // A global denial must not consume an owner token.
        if let Some(global) = &self.global {
            if global.check().is_err() {
                return Err(ResourceLimited {
                    scope: LimitScope::Global,
                    limit: self.global_rate as usize,
                });
            }
        }
        if let Some(per_owner) = &self.per_owner {
            if per_owner.check_key(&owner.to_string()).is_err() {
                return Err(ResourceLimited {
                    scope: LimitScope::Owner,
                    limit: self.owner_rate as usize,
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for GovernorRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernorRateLimiter")
            .field("global_rate", &self.global_rate)
            .field("owner_rate", &self.owner_rate)
            .finish()
    }
}
