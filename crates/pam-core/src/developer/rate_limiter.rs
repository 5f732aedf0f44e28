//! Sliding one-minute window per developer app.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::RateLimitTier;
use crate::error::{PamError, PamResult};

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the oldest counted request leaves the window.
    pub reset_secs: u64,
}

/// Per-app request windows. Each entry is locked by its DashMap shard while it is updated.
#[derive(Default)]
pub struct RateLimiter {
    windows: DashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request for `app_id` or refuse it with `RateLimited`.
    pub fn check(&self, app_id: &str, tier: RateLimitTier) -> PamResult<RateLimitStatus> {
        self.check_at(app_id, tier.requests_per_minute(), Instant::now())
    }

    pub fn check_at(&self, app_id: &str, limit: u32, now: Instant) -> PamResult<RateLimitStatus> {
        let mut window = self.windows.entry(app_id.to_string()).or_default();
        evict_expired(&mut window, now);

        if window.len() as u32 >= limit {
            let retry_after_secs = window
                .front()
                .map(|oldest| secs_until_expiry(*oldest, now))
                .unwrap_or(1);
            return Err(PamError::RateLimited { limit, retry_after_secs });
        }

        window.push_back(now);
        Ok(RateLimitStatus {
            limit,
            remaining: limit - window.len() as u32,
            reset_secs: window.front().map(|o| secs_until_expiry(*o, now)).unwrap_or(0),
        })
    }

    /// Current status without counting a request.
    pub fn status(&self, app_id: &str, tier: RateLimitTier) -> RateLimitStatus {
        let limit = tier.requests_per_minute();
        let now = Instant::now();
        match self.windows.get_mut(app_id) {
            Some(mut window) => {
                evict_expired(&mut window, now);
                RateLimitStatus {
                    limit,
                    remaining: limit.saturating_sub(window.len() as u32),
                    reset_secs: window.front().map(|o| secs_until_expiry(*o, now)).unwrap_or(0),
                }
            }
            None => RateLimitStatus { limit, remaining: limit, reset_secs: 0 },
        }
    }

    pub fn reset(&self, app_id: &str) {
        self.windows.remove(app_id);
    }
}

fn evict_expired(window: &mut VecDeque<Instant>, now: Instant) {
    while let Some(oldest) = window.front() {
        if now.saturating_duration_since(*oldest) >= WINDOW {
            window.pop_front();
        } else {
            break;
        }
    }
}

fn secs_until_expiry(oldest: Instant, now: Instant) -> u64 {
    let left = WINDOW.saturating_sub(now.saturating_duration_since(oldest));
    // Round up so clients never retry a moment too early.
    let secs = left.as_secs() + u64::from(left.subsec_nanos() > 0);
    secs.max(1)
}
