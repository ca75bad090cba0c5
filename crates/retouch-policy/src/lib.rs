//! Retouch Policy Engine
//!
//! Group allowlist/denylist and per-group sliding-window rate limiting

use retouch_config::{AccessConfig, GroupControlMode};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::Mutex;

/// Wall clock used for rate-limit windows.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Denial {
    #[error("This group is not authorized to use image editing")]
    NotAuthorized,
    #[error("Image editing is restricted in this group")]
    Restricted,
    #[error("This group reached its limit ({max_calls} calls / {window_secs} seconds), please try again later")]
    RateLimited { max_calls: u32, window_secs: u64 },
}

#[derive(Debug, Clone)]
pub struct AccessPolicy {
    pub mode: GroupControlMode,
    pub groups: HashSet<String>,
    pub rate_limit: Option<RateLimit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub window: Duration,
    pub max_calls: u32,
}

impl AccessPolicy {
    pub fn from_config(config: &AccessConfig) -> Self {
        let rate_limit = config.rate_limit_enabled.then(|| RateLimit {
            window: Duration::from_secs(config.rate_limit_window_seconds),
            max_calls: config.rate_limit_max_calls,
        });
        Self {
            mode: config.group_control_mode,
            groups: config
                .group_list
                .iter()
                .map(|g| g.trim().to_string())
                .filter(|g| !g.is_empty())
                .collect(),
            rate_limit,
        }
    }

    pub fn is_listed(&self, scope: &str) -> Option<Denial> {
        match self.mode {
            GroupControlMode::Whitelist if !self.groups.contains(scope) => {
                Some(Denial::NotAuthorized)
            }
            GroupControlMode::Blacklist if self.groups.contains(scope) => Some(Denial::Restricted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    window_start: SystemTime,
    count: u32,
}

enum Verdict {
    Allow,
    Deny(Denial),
}

/// Per-scope access gate. Buckets are created on first use and live as long
/// as the gate.
pub struct AccessGate {
    policy: AccessPolicy,
    clock: Arc<dyn Clock>,
    buckets: Mutex<HashMap<String, Arc<Mutex<Option<Bucket>>>>>,
}

impl AccessGate {
    pub fn new(policy: AccessPolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    pub fn with_clock(policy: AccessPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the reason to refuse, or `None` to let the request through.
    /// Requests without a scope (direct messages) are never limited.
    pub async fn check(&self, scope: Option<&str>) -> Option<Denial> {
        let scope = scope.map(str::trim).filter(|s| !s.is_empty())?;

        if let Some(denial) = self.policy.is_listed(scope) {
            tracing::info!(scope = %scope, reason = %denial, "Group access denied");
            return Some(denial);
        }

        let limit = self.policy.rate_limit?;
        match self.consume(scope, limit).await {
            Verdict::Allow => None,
            Verdict::Deny(denial) => {
                tracing::info!(scope = %scope, reason = %denial, "Group rate limit reached");
                Some(denial)
            }
        }
    }

    async fn scope_lock(&self, scope: &str) -> Arc<Mutex<Option<Bucket>>> {
        let mut buckets = self.buckets.lock().await;
        buckets
            .entry(scope.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    async fn consume(&self, scope: &str, limit: RateLimit) -> Verdict {
        let lock = self.scope_lock(scope).await;
        let mut slot = lock.lock().await;

        let now = self.clock.now();
        let mut bucket = (*slot).unwrap_or(Bucket {
            window_start: now,
            count: 0,
        });

        // A clock stepped backwards keeps the current window and its count.
        let elapsed = match now.duration_since(bucket.window_start) {
            Ok(elapsed) => elapsed,
            Err(err) => {
                tracing::warn!(
                    scope = %scope,
                    skew_ms = err.duration().as_millis() as u64,
                    "Clock moved backwards, keeping current rate-limit window"
                );
                Duration::ZERO
            }
        };
        if elapsed >= limit.window {
            bucket.window_start = now;
            bucket.count = 0;
        }

        if bucket.count >= limit.max_calls {
            *slot = Some(bucket);
            return Verdict::Deny(Denial::RateLimited {
                max_calls: limit.max_calls,
                window_secs: limit.window.as_secs(),
            });
        }

        bucket.count += 1;
        *slot = Some(bucket);
        Verdict::Allow
    }

    /// Calls consumed in the current window for `scope`.
    #[cfg(test)]
    async fn usage(&self, scope: &str) -> u32 {
        let lock = {
            let buckets = self.buckets.lock().await;
            match buckets.get(scope) {
                Some(lock) => lock.clone(),
                None => return 0,
            }
        };
        let slot = lock.lock().await;
        (*slot).map(|b| b.count).unwrap_or(0)
    }

    /// Drops every bucket.
    pub async fn clear(&self) {
        self.buckets.lock().await.clear();
    }
}
