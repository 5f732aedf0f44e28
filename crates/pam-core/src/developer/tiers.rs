use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Developer API plan. Each tier maps to a fixed per-minute request budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitTier {
    #[default]
    Free,
    Basic,
    Pro,
    Enterprise,
}

impl RateLimitTier {
    pub const ALL: [RateLimitTier; 4] = [
        RateLimitTier::Free,
        RateLimitTier::Basic,
        RateLimitTier::Pro,
        RateLimitTier::Enterprise,
    ];

    pub const NAMES: &'static [&'static str] = &["free", "basic", "pro", "enterprise"];

    pub fn requests_per_minute(self) -> u32 {
        match self {
            RateLimitTier::Free => 60,
            RateLimitTier::Basic => 300,
            RateLimitTier::Pro => 1000,
            RateLimitTier::Enterprise => 5000,
        }
    }

    /// Requests per UTC day at full per-minute rate.
    pub fn daily_capacity(self) -> u64 {
        u64::from(self.requests_per_minute()) * 60 * 24
    }

    /// Daily request count at which `usage.daily_limit_warning` fires (80% of capacity).
    pub fn daily_warning_threshold(self) -> u64 {
        self.daily_capacity() * 8 / 10
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RateLimitTier::Free => "free",
            RateLimitTier::Basic => "basic",
            RateLimitTier::Pro => "pro",
            RateLimitTier::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for RateLimitTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RateLimitTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(RateLimitTier::Free),
            "basic" => Ok(RateLimitTier::Basic),
            "pro" => Ok(RateLimitTier::Pro),
            "enterprise" => Ok(RateLimitTier::Enterprise),
            other => Err(format!("unknown tier '{}'", other)),
        }
    }
}
