//! Daily API quota accounting with a 90% cutoff.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;

use crate::records::{QuotaUsage, day_key};
use crate::settings::SettingsStore;
use crate::store::Store;

/// Work stops once this share of the daily budget is consumed.
pub const QUOTA_CUTOFF_PERCENT: f64 = 90.0;

/// Units charged for one collection metadata lookup.
pub const METADATA_COST: i64 = 1;

/// Units charged for a failed request, whatever it was.
pub const FAILED_REQUEST_COST: i64 = 1;

const UNITS_PER_LISTING_PAGE: i64 = 3;
const LISTING_PAGE_SIZE: i64 = 50;

/// Estimated cost of listing `item_count` items including their details.
pub fn listing_cost(item_count: usize) -> i64 {
    let count = item_count as i64;
    let pages = (count + LISTING_PAGE_SIZE - 1) / LISTING_PAGE_SIZE;
    pages * UNITS_PER_LISTING_PAGE
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaStatus {
    pub usage_date: i64,
    pub consumed: i64,
    pub limit: i64,
    pub percentage: f64,
    pub can_continue: bool,
}

impl QuotaStatus {
    fn from_usage(usage_date: i64, consumed: i64, limit: i64) -> Self {
        let percentage = if limit > 0 {
            consumed as f64 / limit as f64 * 100.0
        } else {
            100.0
        };
        Self {
            usage_date,
            consumed,
            limit,
            percentage,
            can_continue: percentage < QUOTA_CUTOFF_PERCENT,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageDay {
    #[serde(flatten)]
    pub usage: QuotaUsage,
    pub percentage: f64,
}

#[derive(Clone)]
pub struct QuotaTracker {
    store: Store,
    settings: Arc<SettingsStore>,
}

impl QuotaTracker {
    pub fn new(store: Store, settings: Arc<SettingsStore>) -> Self {
        Self { store, settings }
    }

    fn default_limit(&self) -> i64 {
        self.settings.get().quota_daily_limit
    }

    pub async fn check_quota(&self) -> Result<QuotaStatus> {
        self.check_quota_at(Utc::now()).await
    }

    pub async fn check_quota_at(&self, now: DateTime<Utc>) -> Result<QuotaStatus> {
        let usage_date = day_key(now);
        let status = match self.store.quota_usage(usage_date).await? {
            Some(usage) => QuotaStatus::from_usage(usage_date, usage.quota_used, usage.quota_limit),
            None => QuotaStatus::from_usage(usage_date, 0, self.default_limit()),
        };
        Ok(status)
    }

    pub async fn track_usage(&self, cost: i64, success: bool) -> Result<()> {
        self.track_usage_at(Utc::now(), cost, success).await
    }

    pub async fn track_usage_at(&self, now: DateTime<Utc>, cost: i64, success: bool) -> Result<()> {
        let usage_date = day_key(now);
        debug!(usage_date, cost, success, "tracking API usage");
        self.store
            .add_quota_usage(usage_date, self.default_limit(), cost, success)
            .await
    }

    /// Usage of the last `days` days (today included), newest first.
    pub async fn usage_history(&self, days: i64) -> Result<Vec<UsageDay>> {
        let days = days.max(1);
        let since = day_key(Utc::now() - Duration::days(days - 1));
        let rows = self.store.quota_history(since).await?;
        Ok(rows
            .into_iter()
            .map(|usage| UsageDay {
                percentage: usage.percentage(),
                usage,
            })
            .collect())
    }
}
