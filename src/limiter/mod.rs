//! Per-destination sliding-window throttle.
//!
//! Keeps an ordered sequence of acquisition timestamps per key. Unlike an
//! inbound guard that drops over-limit traffic, `acquire` suspends the caller
//! until a slot frees up, then re-checks — concurrent acquirers may race to
//! the next freed slot, so an overshoot of one is possible and accepted.

use crate::config::RateLimitConfig;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// Minimum sleep between re-checks; guards against a zero-duration spin when
/// the oldest slot is right at the window edge.
const MIN_WAIT: Duration = Duration::from_millis(5);

struct Limit {
    calls: usize,
    period: Duration,
}

impl Limit {
    fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            calls: (config.calls.max(1)) as usize,
            period: Duration::from_secs_f64(config.period_seconds.max(0.001)),
        }
    }
}

pub struct RateLimiter {
    limits: HashMap<String, Limit>,
    default_limit: Limit,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(
        per_platform: &HashMap<String, RateLimitConfig>,
        default_limit: &RateLimitConfig,
    ) -> Self {
        let limits = per_platform
            .iter()
            .map(|(platform, config)| (platform.clone(), Limit::from_config(config)))
            .collect();
        Self {
            limits,
            default_limit: Limit::from_config(default_limit),
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn limit_for(&self, platform: &str) -> &Limit {
        self.limits.get(platform).unwrap_or(&self.default_limit)
    }

    /// Suspend until a send slot is free for `(platform, account)`, then
    /// claim it. Waits are not cancellable mid-acquire; callers mid-wait at
    /// shutdown complete their wait.
    pub async fn acquire(&self, platform: &str, account: &str) {
        let key = format!("{}:{}", platform, account);
        let limit = self.limit_for(platform);
        loop {
            let wait = {
                let mut windows = self.windows.lock().await;
                let slots = windows.entry(key.clone()).or_default();
                let now = Instant::now();
                while slots
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= limit.period)
                {
                    slots.pop_front();
                }
                if slots.len() < limit.calls {
                    slots.push_back(now);
                    None
                } else {
                    // Window full; oldest slot frees at oldest + period.
                    slots
                        .front()
                        .map(|oldest| limit.period.saturating_sub(now.duration_since(*oldest)))
                }
            };
            match wait {
                None => return,
                Some(d) => {
                    trace!("rate limit wait {:?} for {}", d, key);
                    tokio::time::sleep(d.max(MIN_WAIT)).await;
                }
            }
        }
    }

    /// How many slots remain open for `(platform, account)` right now.
    pub async fn remaining(&self, platform: &str, account: &str) -> usize {
        let key = format!("{}:{}", platform, account);
        let limit = self.limit_for(platform);
        let mut windows = self.windows.lock().await;
        let Some(slots) = windows.get_mut(&key) else {
            return limit.calls;
        };
        let now = Instant::now();
        while slots
            .front()
            .is_some_and(|t| now.duration_since(*t) >= limit.period)
        {
            slots.pop_front();
        }
        limit.calls.saturating_sub(slots.len())
    }
}
