//! Developer API: app registry, rate-limit tiers, sliding-window limiter, usage counters.

mod apps;
mod rate_limiter;
mod tiers;
mod usage;

pub use apps::{
    hash_api_key, is_valid_app_id, AppInfo, AppRegistry, DeveloperApp, RegisterAppRequest,
    RegisteredApp, API_KEY_PREFIX, SCOPES,
};
pub use rate_limiter::{RateLimitStatus, RateLimiter};
pub use tiers::RateLimitTier;
pub use usage::{DailyUsage, UsageSummary, UsageTracker};
