//! Daily analytics snapshots derived from the stored episode counters.

use std::collections::BTreeSet;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::records::{DailySnapshot, SECONDS_PER_DAY, TrendingPodcast, day_key};
use crate::store::{EpisodeMetrics, Store};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AnalyticsStats {
    pub episodes_processed: i64,
    pub episodes_updated: i64,
    pub podcasts_updated: i64,
}

/// Growth since yesterday. Without a snapshot for yesterday there is no
/// baseline and the delta is zero; counters that shrank also report zero.
pub fn daily_delta(today: i64, yesterday: Option<i64>) -> i64 {
    match yesterday {
        Some(previous) => (today - previous).max(0),
        None => 0,
    }
}

#[derive(Clone)]
pub struct AnalyticsAggregator {
    store: Store,
}

impl AnalyticsAggregator {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn calculate_daily_metrics(
        &self,
        podcast_id: Option<i64>,
        episode_id: Option<i64>,
    ) -> Result<AnalyticsStats> {
        self.calculate_daily_metrics_at(Utc::now(), podcast_id, episode_id)
            .await
    }

    pub async fn calculate_daily_metrics_at(
        &self,
        now: DateTime<Utc>,
        podcast_id: Option<i64>,
        episode_id: Option<i64>,
    ) -> Result<AnalyticsStats> {
        let today = day_key(now);
        let yesterday = today - SECONDS_PER_DAY;
        let mut stats = AnalyticsStats::default();
        let mut touched = BTreeSet::new();

        for metrics in self.store.episode_metrics(podcast_id, episode_id).await? {
            stats.episodes_processed += 1;
            match self.snapshot_episode(&metrics, today, yesterday).await {
                Ok(()) => {
                    stats.episodes_updated += 1;
                    touched.insert(metrics.podcast_id);
                }
                Err(err) => warn!(
                    episode_id = metrics.episode_id,
                    "failed to snapshot episode: {err:#}"
                ),
            }
        }

        if podcast_id.is_none() && episode_id.is_none() {
            touched.extend(self.store.podcasts_with_episode_snapshots(today).await?);
        }

        for podcast in touched {
            let (totals, deltas) = self.store.sum_episode_snapshots(podcast, today).await?;
            self.store
                .upsert_snapshot(&DailySnapshot {
                    podcast_id: podcast,
                    episode_id: None,
                    snapshot_date: today,
                    total_views: totals.views,
                    total_likes: totals.likes,
                    total_comments: totals.comments,
                    views_today: deltas.views,
                    likes_today: deltas.likes,
                    comments_today: deltas.comments,
                })
                .await?;
            stats.podcasts_updated += 1;
        }

        info!(
            episodes = stats.episodes_processed,
            updated = stats.episodes_updated,
            podcasts = stats.podcasts_updated,
            "daily analytics calculated"
        );
        Ok(stats)
    }

    async fn snapshot_episode(&self, metrics: &EpisodeMetrics, today: i64, yesterday: i64) -> Result<()> {
        let previous = self
            .store
            .snapshot(metrics.podcast_id, Some(metrics.episode_id), yesterday)
            .await?;
        let totals = metrics.totals;
        self.store
            .upsert_snapshot(&DailySnapshot {
                podcast_id: metrics.podcast_id,
                episode_id: Some(metrics.episode_id),
                snapshot_date: today,
                total_views: totals.views,
                total_likes: totals.likes,
                total_comments: totals.comments,
                views_today: daily_delta(totals.views, previous.as_ref().map(|s| s.total_views)),
                likes_today: daily_delta(totals.likes, previous.as_ref().map(|s| s.total_likes)),
                comments_today: daily_delta(
                    totals.comments,
                    previous.as_ref().map(|s| s.total_comments),
                ),
            })
            .await
    }

    /// Drops snapshots older than `retention_days` days. Returns rows deleted.
    pub async fn cleanup_old_analytics(&self, retention_days: i64) -> Result<u64> {
        let cutoff = day_key(Utc::now()) - retention_days.max(1) * SECONDS_PER_DAY;
        let deleted = self.store.delete_snapshots_before(cutoff).await?;
        info!(deleted, retention_days, "cleaned up old analytics");
        Ok(deleted)
    }

    /// Podcasts ranked by views gained over the last `days` days.
    pub async fn trending_podcasts(&self, days: i64, limit: i64) -> Result<Vec<TrendingPodcast>> {
        let since = day_key(Utc::now() - Duration::days(days.max(1) - 1));
        self.store.trending_podcasts(since, limit.max(1)).await
    }
}
