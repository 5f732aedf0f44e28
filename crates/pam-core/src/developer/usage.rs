//! Per-app, per-day request counters in the `usage` tree.

use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::PamResult;
use crate::store::{scan_json, PamStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyUsage {
    pub date: NaiveDate,
    pub total: u64,
    #[serde(default)]
    pub endpoints: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub app_id: String,
    pub period_days: u32,
    pub total_requests: u64,
    pub today_requests: u64,
    pub endpoints: BTreeMap<String, u64>,
    pub daily: Vec<DailyUsage>,
}

#[derive(Clone)]
pub struct UsageTracker {
    store: PamStore,
}

fn usage_key(app_id: &str, date: NaiveDate) -> String {
    format!("{}:{}", app_id, date.format("%Y-%m-%d"))
}

impl UsageTracker {
    pub fn new(store: PamStore) -> Self {
        Self { store }
    }

    pub fn record(&self, app_id: &str, endpoint: &str) -> PamResult<u64> {
        self.record_on(app_id, endpoint, Utc::now().date_naive())
    }

    pub fn record_on(&self, app_id: &str, endpoint: &str, date: NaiveDate) -> PamResult<u64> {
        self.record_many_on(app_id, endpoint, date, 1)
    }

    /// Atomically add `count` requests to the counters for `date`; returns the day's new total.
    pub fn record_many_on(&self, app_id: &str, endpoint: &str, date: NaiveDate, count: u64) -> PamResult<u64> {
        let key = usage_key(app_id, date);
        let updated = self.store.usage().update_and_fetch(key.as_bytes(), |old| {
            let mut day = old
                .and_then(|b| serde_json::from_slice::<DailyUsage>(b).ok())
                .unwrap_or_else(|| DailyUsage { date, total: 0, endpoints: BTreeMap::new() });
            day.total += count;
            *day.endpoints.entry(endpoint.to_string()).or_insert(0) += count;
            serde_json::to_vec(&day).ok()
        })?;
        let total = updated
            .and_then(|b| serde_json::from_slice::<DailyUsage>(&b).ok())
            .map(|d| d.total)
            .unwrap_or(0);
        Ok(total)
    }

    pub fn summary(&self, app_id: &str, days: u32) -> PamResult<UsageSummary> {
        self.summary_on(app_id, days, Utc::now().date_naive())
    }

    /// Usage for the `days` days ending at `today` (inclusive), oldest first.
    pub fn summary_on(&self, app_id: &str, days: u32, today: NaiveDate) -> PamResult<UsageSummary> {
        let days = days.clamp(1, 90);
        let first = today - Duration::days(i64::from(days) - 1);
        let prefix = format!("{}:", app_id);

        let daily: Vec<DailyUsage> = scan_json::<DailyUsage>(self.store.usage(), &prefix)?
            .into_iter()
            .map(|(_, d)| d)
            .filter(|d| d.date >= first && d.date <= today)
            .collect();

        let mut endpoints = BTreeMap::new();
        for day in &daily {
            for (ep, n) in &day.endpoints {
                *endpoints.entry(ep.clone()).or_insert(0) += n;
            }
        }

        Ok(UsageSummary {
            app_id: app_id.to_string(),
            period_days: days,
            total_requests: daily.iter().map(|d| d.total).sum(),
            today_requests: daily.iter().find(|d| d.date == today).map(|d| d.total).unwrap_or(0),
            endpoints,
            daily,
        })
    }
}
