//! Per-caller token-bucket rate limiting.
//!
//! Each rate-limit key owns one [`TokenBucket`], created lazily at full
//! capacity on first use. Buckets live in a `DashMap` and each is guarded by
//! its own mutex, so callers for different keys never contend and the
//! refill-then-debit sequence for one key is a single critical section.
//!
//! Stale buckets are swept by a background task. A bucket is only dropped
//! once it would have refilled to capacity anyway, so sweeping never grants
//! a caller more than an untouched bucket would.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RateLimitConfig;

/// Upper bound on the sweeper period, however slow the refill.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Seconds to a `Duration`, saturating for very slow refill rates.
fn duration_from_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Outcome of a [`TokenBucketLimiter::try_acquire`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LimitDecision {
    /// Tokens were debited.
    Admitted {
        /// Whole tokens left in the bucket after the debit.
        remaining: u32,
    },
    /// Not enough tokens; nothing was debited.
    Rejected {
        /// Time until the bucket holds `cost` tokens.
        retry_after: Duration,
    },
}

impl LimitDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }
}

/// A single token bucket.
///
/// `level` is kept in `[0, capacity]` by construction: refill is capped at
/// capacity and a debit only happens when `level >= cost`.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    level: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(capacity: u32, refill_per_sec: f64, now: Instant) -> Self {
        let capacity = f64::from(capacity);
        Self {
            capacity,
            refill_per_sec,
            level: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        // A caller that read the clock before another caller took the lock
        // may arrive with an older `now`; never move time backwards.
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.level = (self.level + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Refill for the time elapsed, then debit `cost` tokens if available.
    pub fn try_acquire(&mut self, cost: u32, now: Instant) -> LimitDecision {
        self.refill(now);
        let cost = f64::from(cost);

        if self.level >= cost {
            self.level -= cost;
            LimitDecision::Admitted {
                remaining: self.level.floor() as u32,
            }
        } else {
            let deficit = cost - self.level;
            LimitDecision::Rejected {
                retry_after: duration_from_secs(deficit / self.refill_per_sec),
            }
        }
    }

    /// Current token level (without refilling).
    pub fn level(&self) -> f64 {
        self.level
    }

    fn last_touched(&self) -> Instant {
        self.last_refill
    }
}

/// Keyed collection of token buckets sharing one capacity and refill rate.
pub struct TokenBucketLimiter {
    buckets: DashMap<String, Arc<Mutex<TokenBucket>>>,
    capacity: u32,
    refill_per_sec: f64,
    stale_after: Duration,
}

impl TokenBucketLimiter {
    /// Create a limiter from validated configuration.
    pub fn new(config: &RateLimitConfig) -> Self {
        let refill_per_sec = config.refill_rate();

        // Dropping a bucket before it is full would reset it early.
        let full_refill = duration_from_secs(f64::from(config.capacity) / refill_per_sec);
        let stale_after = config.stale_after.max(full_refill);

        info!(
            capacity = config.capacity,
            refill_per_sec,
            stale_secs = stale_after.as_secs(),
            key_strategy = ?config.key_strategy,
            scope = ?config.scope,
            "Token bucket limiter configured"
        );

        Self {
            buckets: DashMap::new(),
            capacity: config.capacity,
            refill_per_sec,
            stale_after,
        }
    }

    /// Try to take `cost` tokens from the bucket for `key`.
    ///
    /// The first call for an unknown key creates its bucket. Concurrent
    /// first calls for the same key resolve to one bucket: creation goes
    /// through the map's entry API, which holds the shard lock.
    pub fn try_acquire(&self, key: &str, cost: u32) -> LimitDecision {
        let bucket = match self.buckets.get(key) {
            Some(existing) => Arc::clone(existing.value()),
            None => {
                let entry = self.buckets.entry(key.to_string()).or_insert_with(|| {
                    Arc::new(Mutex::new(TokenBucket::new(
                        self.capacity,
                        self.refill_per_sec,
                        Instant::now(),
                    )))
                });
                Arc::clone(entry.value())
            }
        };

        let mut bucket = bucket.lock();
        bucket.try_acquire(cost, Instant::now())
    }

    /// Current level of the bucket for `key`, if it exists.
    pub fn level(&self, key: &str) -> Option<f64> {
        self.buckets.get(key).map(|b| b.lock().level())
    }

    /// Number of live buckets.
    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }

    /// Remove buckets untouched for longer than the stale threshold.
    ///
    /// Returns the number of buckets removed.
    pub fn cleanup_stale(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            now.saturating_duration_since(bucket.lock().last_touched()) < self.stale_after
        });
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(
                removed,
                remaining = self.buckets.len(),
                "Cleaned up stale rate limit buckets"
            );
        }
        removed
    }

    /// Spawn a background task that periodically sweeps stale buckets.
    ///
    /// Runs every `stale_after / 2` (at most hourly) until `shutdown` is
    /// cancelled.
    pub fn spawn_cleanup_task(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        let interval = (limiter.stale_after / 2).clamp(Duration::from_secs(1), MAX_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        limiter.cleanup_stale();
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Rate limiter cleanup task shutting down");
                        break;
                    }
                }
            }
        })
    }
}
