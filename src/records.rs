//! Row types shared by the store, the sync pipeline and the HTTP layer.
//!
//! Everything here mirrors a table in the SQLite database and is serialized
//! as-is by the operator API.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub const SECONDS_PER_DAY: i64 = 86_400;

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// UNIX timestamp of UTC midnight for the day containing `now`. Used as the
/// key for quota rows and analytics snapshots.
pub fn day_key(now: DateTime<Utc>) -> i64 {
    let midnight = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .unwrap_or_default();
    Utc.from_utc_datetime(&midnight).timestamp()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodcastStatus {
    Pending,
    Approved,
    Rejected,
}

impl PodcastStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// A podcast tracked for synchronization. The counters are derived from its
/// episodes and rewritten after every reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Podcast {
    pub id: i64,
    pub title: String,
    pub slug: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub youtube_playlist_id: Option<String>,
    pub status: PodcastStatus,
    pub views: i64,
    pub likes: i64,
    pub comments: i64,
    pub episode_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Podcast {
    pub fn playlist_id(&self) -> Option<&str> {
        self.youtube_playlist_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    pub fn is_eligible(&self) -> bool {
        self.status == PodcastStatus::Approved && self.playlist_id().is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPodcast {
    pub title: String,
    pub slug: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub cover_image: Option<String>,
    #[serde(default)]
    pub youtube_playlist_id: Option<String>,
    #[serde(default = "default_new_status")]
    pub status: PodcastStatus,
}

fn default_new_status() -> PodcastStatus {
    PodcastStatus::Pending
}

/// Stored episode. Content fields are written once; only the counters move.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: i64,
    pub podcast_id: i64,
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub youtube_video_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    pub episode_number: i64,
    pub views: i64,
    pub likes: i64,
    pub comments: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    pub duration_seconds: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_date: Option<i64>,
    pub created_at: i64,
}

/// A video as returned by the source API after detail enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceItem {
    pub video_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub thumbnail: String,
    pub duration: String,
    pub duration_seconds: i64,
    pub published_date: i64,
    pub views: i64,
    pub likes: i64,
    pub comments: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMetadata {
    pub id: String,
    pub title: String,
    pub description: String,
    pub owner_name: String,
    pub thumbnail: String,
    pub item_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    FullSync,
    NewEpisodesCheck,
    PodcastSync,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FullSync => "full_sync",
            Self::NewEpisodesCheck => "new_episodes_check",
            Self::PodcastSync => "podcast_sync",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "full_sync" => Some(Self::FullSync),
            "new_episodes_check" => Some(Self::NewEpisodesCheck),
            "podcast_sync" => Some(Self::PodcastSync),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Paused)
    }
}

/// Counters accumulated over one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub items_processed: i64,
    pub items_updated: i64,
    pub items_failed: i64,
    pub new_episodes_found: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: i64,
    pub job_type: JobKind,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
    #[serde(flatten)]
    pub counts: JobCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimit,
    ApiError,
    InvalidData,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::ApiError => "api_error",
            Self::InvalidData => "invalid_data",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "rate_limit" => Some(Self::RateLimit),
            "api_error" => Some(Self::ApiError),
            "invalid_data" => Some(Self::InvalidData),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Podcast,
    Episode,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Podcast => "podcast",
            Self::Episode => "episode",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "podcast" => Some(Self::Podcast),
            "episode" => Some(Self::Episode),
            _ => None,
        }
    }
}

/// Error to be written to `sync_errors`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewSyncError {
    pub entity_type: EntityType,
    pub entity_id: Option<i64>,
    pub category: ErrorCategory,
    pub message: String,
    pub youtube_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncErrorRecord {
    pub id: i64,
    pub sync_job_id: i64,
    pub entity_type: EntityType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<i64>,
    pub error_type: ErrorCategory,
    pub error_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub youtube_id: Option<String>,
    pub resolved: bool,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub usage_date: i64,
    pub quota_used: i64,
    pub quota_limit: i64,
    pub requests_count: i64,
    pub successful_requests: i64,
    pub failed_requests: i64,
}

impl QuotaUsage {
    pub fn percentage(&self) -> f64 {
        if self.quota_limit > 0 {
            self.quota_used as f64 / self.quota_limit as f64 * 100.0
        } else {
            0.0
        }
    }
}

/// Cumulative totals plus day-over-day deltas for one subject and day.
/// Podcast-level rows carry `episode_id = None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySnapshot {
    pub podcast_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode_id: Option<i64>,
    pub snapshot_date: i64,
    pub total_views: i64,
    pub total_likes: i64,
    pub total_comments: i64,
    pub views_today: i64,
    pub likes_today: i64,
    pub comments_today: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricTotals {
    pub views: i64,
    pub likes: i64,
    pub comments: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendingPodcast {
    pub podcast_id: i64,
    pub title: String,
    pub views: i64,
    pub likes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminNotification {
    pub id: i64,
    pub kind: String,
    pub title: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    pub is_read: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedEmail {
    pub id: i64,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub status: String,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_key_truncates_to_utc_midnight() {
        let noon = Utc.with_ymd_and_hms(2024, 3, 10, 12, 34, 56).unwrap();
        let midnight = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        assert_eq!(day_key(noon), midnight.timestamp());
        assert_eq!(day_key(midnight), midnight.timestamp());
    }

    #[test]
    fn eligibility_requires_approval_and_playlist() {
        let mut podcast = Podcast {
            id: 1,
            title: "Show".into(),
            slug: "show".into(),
            description: String::new(),
            cover_image: None,
            youtube_playlist_id: Some("PL123".into()),
            status: PodcastStatus::Approved,
            views: 0,
            likes: 0,
            comments: 0,
            episode_count: 0,
            created_at: 0,
            updated_at: 0,
        };
        assert!(podcast.is_eligible());

        podcast.youtube_playlist_id = Some("   ".into());
        assert!(!podcast.is_eligible());

        podcast.youtube_playlist_id = Some("PL123".into());
        podcast.status = PodcastStatus::Pending;
        assert!(!podcast.is_eligible());
    }

    #[test]
    fn job_status_terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Paused.is_terminal());
    }

    #[test]
    fn quota_percentage_handles_zero_limit() {
        let usage = QuotaUsage {
            usage_date: 0,
            quota_used: 50,
            quota_limit: 0,
            requests_count: 1,
            successful_requests: 1,
            failed_requests: 0,
        };
        assert_eq!(usage.percentage(), 0.0);
    }
}
