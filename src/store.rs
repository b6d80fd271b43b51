//! SQLite persistence for podcasts, episodes, sync jobs and their side tables.
//!
//! Every public method opens its own short-lived connection so callers can
//! share a `Store` across tasks without coordinating access to a single
//! handle. No transaction spans more than one method call.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use libsql::{Builder, Connection, Database, Row, Rows, params};

use crate::records::{
    AdminNotification, DailySnapshot, Episode, EntityType, ErrorCategory, JobCounts, JobKind,
    JobStatus, MetricTotals, NewPodcast, NewSyncError, Podcast, PodcastStatus, QueuedEmail,
    QuotaUsage, SourceItem, SyncErrorRecord, SyncJob, TrendingPodcast, now_ts,
};

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS podcasts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            slug TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT '',
            cover_image TEXT,
            youtube_playlist_id TEXT UNIQUE,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'approved', 'rejected')),
            views INTEGER NOT NULL DEFAULT 0,
            likes INTEGER NOT NULL DEFAULT 0,
            comments INTEGER NOT NULL DEFAULT 0,
            episode_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS episodes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            podcast_id INTEGER NOT NULL REFERENCES podcasts(id) ON DELETE CASCADE,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            youtube_video_id TEXT NOT NULL,
            thumbnail TEXT,
            episode_number INTEGER NOT NULL,
            views INTEGER NOT NULL DEFAULT 0,
            likes INTEGER NOT NULL DEFAULT 0,
            comments INTEGER NOT NULL DEFAULT 0,
            duration TEXT,
            duration_seconds INTEGER NOT NULL DEFAULT 0,
            published_date INTEGER,
            created_at INTEGER NOT NULL,
            UNIQUE (podcast_id, youtube_video_id)
        );

        CREATE INDEX IF NOT EXISTS idx_episodes_podcast ON episodes(podcast_id, episode_number);

        CREATE TABLE IF NOT EXISTS sync_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_type TEXT NOT NULL
                CHECK (job_type IN ('full_sync', 'new_episodes_check', 'podcast_sync')),
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'running', 'completed', 'failed', 'paused')),
            started_at INTEGER,
            completed_at INTEGER,
            duration_seconds INTEGER,
            items_processed INTEGER NOT NULL DEFAULT 0,
            items_updated INTEGER NOT NULL DEFAULT 0,
            items_failed INTEGER NOT NULL DEFAULT 0,
            new_episodes_found INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sync_jobs_created ON sync_jobs(created_at);

        CREATE TABLE IF NOT EXISTS sync_errors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sync_job_id INTEGER NOT NULL REFERENCES sync_jobs(id) ON DELETE CASCADE,
            entity_type TEXT NOT NULL CHECK (entity_type IN ('podcast', 'episode')),
            entity_id INTEGER,
            error_type TEXT NOT NULL
                CHECK (error_type IN ('rate_limit', 'api_error', 'invalid_data')),
            error_message TEXT NOT NULL,
            youtube_id TEXT,
            resolved INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sync_errors_resolved ON sync_errors(resolved, created_at);

        CREATE TABLE IF NOT EXISTS youtube_api_usage (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            usage_date INTEGER NOT NULL UNIQUE,
            quota_used INTEGER NOT NULL DEFAULT 0,
            quota_limit INTEGER NOT NULL,
            requests_count INTEGER NOT NULL DEFAULT 0,
            successful_requests INTEGER NOT NULL DEFAULT 0,
            failed_requests INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS daily_analytics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            podcast_id INTEGER NOT NULL REFERENCES podcasts(id) ON DELETE CASCADE,
            episode_id INTEGER REFERENCES episodes(id) ON DELETE CASCADE,
            snapshot_date INTEGER NOT NULL,
            total_views INTEGER NOT NULL DEFAULT 0,
            total_likes INTEGER NOT NULL DEFAULT 0,
            total_comments INTEGER NOT NULL DEFAULT 0,
            views_today INTEGER NOT NULL DEFAULT 0,
            likes_today INTEGER NOT NULL DEFAULT 0,
            comments_today INTEGER NOT NULL DEFAULT 0
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_daily_analytics_subject
            ON daily_analytics(podcast_id, COALESCE(episode_id, 0), snapshot_date);

        CREATE TABLE IF NOT EXISTS sync_config (
            config_key TEXT PRIMARY KEY,
            config_value TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS email_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            recipient TEXT NOT NULL,
            subject TEXT NOT NULL,
            body TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at INTEGER NOT NULL,
            sent_at INTEGER
        );

        CREATE TABLE IF NOT EXISTS admin_notifications (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            title TEXT NOT NULL,
            message TEXT NOT NULL,
            link TEXT,
            is_read INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        );
        "#,
    )
    .await?;

    Ok(())
}

/// Current counters of one episode, used by the analytics pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpisodeMetrics {
    pub episode_id: i64,
    pub podcast_id: i64,
    pub totals: MetricTotals,
}

/// Handle to the sync database. Cloning is cheap.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
    path: PathBuf,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

impl Store {
    /// Opens (and if necessary creates) the database and provisions every
    /// table the sync subsystem touches.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating database directory {}", parent.display()))?;
            }
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening sync DB {}", path.display()))?;

        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) async fn connect(&self) -> Result<Connection> {
        let conn = self.db.connect()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;").await?;
        Ok(conn)
    }

    // ---- podcasts ----

    pub async fn insert_podcast(&self, podcast: &NewPodcast) -> Result<Podcast> {
        let conn = self.connect().await?;
        let now = now_ts();
        let playlist = podcast
            .youtube_playlist_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());
        conn.execute(
            r#"
            INSERT INTO podcasts (
                title, slug, description, cover_image, youtube_playlist_id,
                status, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            "#,
            params![
                podcast.title.as_str(),
                podcast.slug.as_str(),
                podcast.description.as_str(),
                podcast.cover_image.as_deref(),
                playlist,
                podcast.status.as_str(),
                now,
            ],
        )
        .await
        .with_context(|| format!("inserting podcast {}", podcast.slug))?;

        let id = conn.last_insert_rowid();
        self.get_podcast(id)
            .await?
            .ok_or_else(|| anyhow!("podcast {id} vanished after insert"))
    }

    pub async fn get_podcast(&self, id: i64) -> Result<Option<Podcast>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {PODCAST_COLUMNS} FROM podcasts WHERE id = ?1"),
                params![id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_podcast(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_podcasts(&self, status: Option<PodcastStatus>) -> Result<Vec<Podcast>> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {PODCAST_COLUMNS} FROM podcasts
                     WHERE (?1 IS NULL OR status = ?1)
                     ORDER BY id"
                ),
                params![status.map(PodcastStatus::as_str)],
            )
            .await?;
        collect_rows(rows, row_to_podcast).await
    }

    /// Approved podcasts that carry a playlist id, in id order.
    pub async fn list_eligible_podcasts(&self) -> Result<Vec<Podcast>> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {PODCAST_COLUMNS} FROM podcasts
                     WHERE status = 'approved'
                       AND youtube_playlist_id IS NOT NULL
                       AND TRIM(youtube_playlist_id) != ''
                     ORDER BY id"
                ),
                params![],
            )
            .await?;
        collect_rows(rows, row_to_podcast).await
    }

    /// Returns false when no such podcast exists.
    pub async fn set_podcast_status(&self, id: i64, status: PodcastStatus) -> Result<bool> {
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                "UPDATE podcasts SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, status.as_str(), now_ts()],
            )
            .await?;
        Ok(changed > 0)
    }

    /// Rewrites the derived counters of a podcast from its current episodes.
    pub async fn refresh_podcast_totals(&self, podcast_id: i64) -> Result<()> {
        let conn = self.connect().await?;
        conn.execute(
            r#"
            UPDATE podcasts SET
                episode_count = (SELECT COUNT(*) FROM episodes WHERE podcast_id = ?1),
                views = (SELECT COALESCE(SUM(views), 0) FROM episodes WHERE podcast_id = ?1),
                likes = (SELECT COALESCE(SUM(likes), 0) FROM episodes WHERE podcast_id = ?1),
                comments = (SELECT COALESCE(SUM(comments), 0) FROM episodes WHERE podcast_id = ?1),
                updated_at = ?2
            WHERE id = ?1
            "#,
            params![podcast_id, now_ts()],
        )
        .await
        .with_context(|| format!("refreshing totals of podcast {podcast_id}"))?;
        Ok(())
    }

    // ---- episodes ----

    pub async fn episode_video_ids(&self, podcast_id: i64) -> Result<HashSet<String>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT youtube_video_id FROM episodes WHERE podcast_id = ?1",
                params![podcast_id],
            )
            .await?;
        let mut ids = HashSet::new();
        while let Some(row) = rows.next().await? {
            ids.insert(row.get::<String>(0)?);
        }
        Ok(ids)
    }

    pub async fn next_episode_number(&self, podcast_id: i64) -> Result<i64> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT COALESCE(MAX(episode_number), 0) + 1 FROM episodes WHERE podcast_id = ?1",
                params![podcast_id],
            )
            .await?;
        let row = rows.next().await?.context("missing episode number row")?;
        Ok(row.get(0)?)
    }

    /// Inserts a new episode and returns its row id. Violating the
    /// `(podcast_id, youtube_video_id)` constraint is an error.
    pub async fn insert_episode(
        &self,
        podcast_id: i64,
        item: &SourceItem,
        thumbnail: Option<&str>,
        episode_number: i64,
    ) -> Result<i64> {
        let conn = self.connect().await?;
        conn.execute(
            r#"
            INSERT INTO episodes (
                podcast_id, title, description, youtube_video_id, thumbnail,
                episode_number, views, likes, comments, duration,
                duration_seconds, published_date, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                podcast_id,
                item.title.as_str(),
                item.description.as_str(),
                item.video_id.as_str(),
                thumbnail,
                episode_number,
                item.views,
                item.likes,
                item.comments,
                item.duration.as_str(),
                item.duration_seconds,
                item.published_date,
                now_ts(),
            ],
        )
        .await
        .with_context(|| format!("inserting episode {}", item.video_id))?;
        Ok(conn.last_insert_rowid())
    }

    /// Overwrites the counters of one episode. Returns the number of rows
    /// touched, which is zero when the episode no longer exists.
    pub async fn update_episode_stats(
        &self,
        podcast_id: i64,
        video_id: &str,
        views: i64,
        likes: i64,
        comments: i64,
    ) -> Result<u64> {
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                r#"
                UPDATE episodes SET views = ?3, likes = ?4, comments = ?5
                WHERE podcast_id = ?1 AND youtube_video_id = ?2
                "#,
                params![podcast_id, video_id, views, likes, comments],
            )
            .await
            .with_context(|| format!("updating stats of episode {video_id}"))?;
        Ok(changed)
    }

    pub async fn list_episodes(&self, podcast_id: i64) -> Result<Vec<Episode>> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                r#"
                SELECT id, podcast_id, title, description, youtube_video_id, thumbnail,
                       episode_number, views, likes, comments, duration,
                       duration_seconds, published_date, created_at
                FROM episodes
                WHERE podcast_id = ?1
                ORDER BY episode_number
                "#,
                params![podcast_id],
            )
            .await?;
        collect_rows(rows, row_to_episode).await
    }

    /// Titles of the most recently numbered episodes, newest first.
    pub async fn latest_episode_titles(&self, podcast_id: i64, limit: i64) -> Result<Vec<String>> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                r#"
                SELECT title FROM episodes
                WHERE podcast_id = ?1
                ORDER BY episode_number DESC
                LIMIT ?2
                "#,
                params![podcast_id, limit],
            )
            .await?;
        collect_rows(rows, |row| Ok(row.get::<String>(0)?)).await
    }

    pub async fn episode_metrics(
        &self,
        podcast_id: Option<i64>,
        episode_id: Option<i64>,
    ) -> Result<Vec<EpisodeMetrics>> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                r#"
                SELECT id, podcast_id, views, likes, comments
                FROM episodes
                WHERE (?1 IS NULL OR podcast_id = ?1)
                  AND (?2 IS NULL OR id = ?2)
                ORDER BY id
                "#,
                params![podcast_id, episode_id],
            )
            .await?;
        collect_rows(rows, |row| {
            Ok(EpisodeMetrics {
                episode_id: row.get(0)?,
                podcast_id: row.get(1)?,
                totals: MetricTotals {
                    views: row.get(2)?,
                    likes: row.get(3)?,
                    comments: row.get(4)?,
                },
            })
        })
        .await
    }

    // ---- sync jobs ----

    pub async fn create_job(&self, kind: JobKind) -> Result<i64> {
        let conn = self.connect().await?;
        conn.execute(
            "INSERT INTO sync_jobs (job_type, status, created_at) VALUES (?1, 'pending', ?2)",
            params![kind.as_str(), now_ts()],
        )
        .await
        .context("creating sync job")?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn mark_job_running(&self, job_id: i64, started_at: i64) -> Result<()> {
        let conn = self.connect().await?;
        conn.execute(
            "UPDATE sync_jobs SET status = 'running', started_at = ?2 WHERE id = ?1 AND status = 'pending'",
            params![job_id, started_at],
        )
        .await?;
        Ok(())
    }

    /// Moves a job to a terminal status. Jobs that already reached a terminal
    /// status are left untouched and `false` is returned.
    pub async fn finish_job(
        &self,
        job_id: i64,
        status: JobStatus,
        counts: JobCounts,
        error_message: Option<&str>,
        completed_at: i64,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(anyhow!("{} is not a terminal job status", status.as_str()));
        }
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                r#"
                UPDATE sync_jobs SET
                    status = ?2,
                    completed_at = ?3,
                    duration_seconds = ?3 - COALESCE(started_at, ?3),
                    items_processed = ?4,
                    items_updated = ?5,
                    items_failed = ?6,
                    new_episodes_found = ?7,
                    error_message = ?8
                WHERE id = ?1 AND status IN ('pending', 'running')
                "#,
                params![
                    job_id,
                    status.as_str(),
                    completed_at,
                    counts.items_processed,
                    counts.items_updated,
                    counts.items_failed,
                    counts.new_episodes_found,
                    error_message,
                ],
            )
            .await
            .with_context(|| format!("finishing sync job {job_id}"))?;
        Ok(changed > 0)
    }

    pub async fn get_job(&self, job_id: i64) -> Result<Option<SyncJob>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE id = ?1"),
                params![job_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn last_job(&self) -> Result<Option<SyncJob>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM sync_jobs ORDER BY id DESC LIMIT 1"),
                params![],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    /// Newest-first page of job history plus the total matching count.
    pub async fn list_jobs(
        &self,
        limit: i64,
        offset: i64,
        status: Option<JobStatus>,
    ) -> Result<(Vec<SyncJob>, i64)> {
        let conn = self.connect().await?;
        let status = status.map(JobStatus::as_str);
        let rows = conn
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM sync_jobs
                     WHERE (?1 IS NULL OR status = ?1)
                     ORDER BY id DESC
                     LIMIT ?2 OFFSET ?3"
                ),
                params![status, limit, offset],
            )
            .await?;
        let jobs = collect_rows(rows, row_to_job).await?;

        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM sync_jobs WHERE (?1 IS NULL OR status = ?1)",
                params![status],
            )
            .await?;
        let row = rows.next().await?.context("missing job count row")?;
        Ok((jobs, row.get(0)?))
    }

    // ---- sync errors ----

    pub async fn record_error(&self, job_id: i64, error: &NewSyncError) -> Result<i64> {
        let conn = self.connect().await?;
        conn.execute(
            r#"
            INSERT INTO sync_errors (
                sync_job_id, entity_type, entity_id, error_type,
                error_message, youtube_id, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                job_id,
                error.entity_type.as_str(),
                error.entity_id,
                error.category.as_str(),
                error.message.as_str(),
                error.youtube_id.as_deref(),
                now_ts(),
            ],
        )
        .await
        .with_context(|| format!("recording error for job {job_id}"))?;
        Ok(conn.last_insert_rowid())
    }

    /// Newest-first errors with the title of the podcast or episode they
    /// refer to, when it still exists.
    pub async fn list_errors(&self, resolved: bool, limit: i64) -> Result<Vec<SyncErrorRecord>> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                r#"
                SELECT e.id, e.sync_job_id, e.entity_type, e.entity_id, e.error_type,
                       e.error_message, e.youtube_id, e.resolved, e.created_at,
                       COALESCE(p.title, ep.title)
                FROM sync_errors e
                LEFT JOIN podcasts p ON e.entity_type = 'podcast' AND p.id = e.entity_id
                LEFT JOIN episodes ep ON e.entity_type = 'episode' AND ep.id = e.entity_id
                WHERE e.resolved = ?1
                ORDER BY e.id DESC
                LIMIT ?2
                "#,
                params![resolved as i64, limit],
            )
            .await?;
        collect_rows(rows, row_to_sync_error).await
    }

    pub async fn list_job_errors(&self, job_id: i64) -> Result<Vec<SyncErrorRecord>> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                r#"
                SELECT id, sync_job_id, entity_type, entity_id, error_type,
                       error_message, youtube_id, resolved, created_at, NULL
                FROM sync_errors
                WHERE sync_job_id = ?1
                ORDER BY id
                "#,
                params![job_id],
            )
            .await?;
        collect_rows(rows, row_to_sync_error).await
    }

    /// Returns false when the error row does not exist.
    pub async fn resolve_error(&self, error_id: i64) -> Result<bool> {
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                "UPDATE sync_errors SET resolved = 1 WHERE id = ?1",
                params![error_id],
            )
            .await?;
        Ok(changed > 0)
    }

    pub async fn count_errors(&self, resolved: bool, since: Option<i64>) -> Result<i64> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM sync_errors WHERE resolved = ?1 AND (?2 IS NULL OR created_at >= ?2)",
                params![resolved as i64, since],
            )
            .await?;
        let row = rows.next().await?.context("missing error count row")?;
        Ok(row.get(0)?)
    }

    // ---- quota ----

    pub async fn quota_usage(&self, usage_date: i64) -> Result<Option<QuotaUsage>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {USAGE_COLUMNS} FROM youtube_api_usage WHERE usage_date = ?1"),
                params![usage_date],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_usage(&row)?)),
            None => Ok(None),
        }
    }

    /// Adds one request worth `cost` units to the row of `usage_date`,
    /// creating it with `default_limit` if needed.
    pub async fn add_quota_usage(
        &self,
        usage_date: i64,
        default_limit: i64,
        cost: i64,
        success: bool,
    ) -> Result<()> {
        let conn = self.connect().await?;
        let (ok, failed) = if success { (1_i64, 0_i64) } else { (0, 1) };
        conn.execute(
            r#"
            INSERT INTO youtube_api_usage (
                usage_date, quota_used, quota_limit, requests_count,
                successful_requests, failed_requests
            ) VALUES (?1, ?2, ?3, 1, ?4, ?5)
            ON CONFLICT(usage_date) DO UPDATE SET
                quota_used = quota_used + excluded.quota_used,
                requests_count = requests_count + 1,
                successful_requests = successful_requests + excluded.successful_requests,
                failed_requests = failed_requests + excluded.failed_requests
            "#,
            params![usage_date, cost, default_limit, ok, failed],
        )
        .await
        .context("tracking API usage")?;
        Ok(())
    }

    /// Usage rows on or after `since_date`, newest first.
    pub async fn quota_history(&self, since_date: i64) -> Result<Vec<QuotaUsage>> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {USAGE_COLUMNS} FROM youtube_api_usage
                     WHERE usage_date >= ?1
                     ORDER BY usage_date DESC"
                ),
                params![since_date],
            )
            .await?;
        collect_rows(rows, row_to_usage).await
    }

    // ---- analytics ----

    pub async fn snapshot(
        &self,
        podcast_id: i64,
        episode_id: Option<i64>,
        snapshot_date: i64,
    ) -> Result<Option<DailySnapshot>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {SNAPSHOT_COLUMNS} FROM daily_analytics
                     WHERE podcast_id = ?1
                       AND COALESCE(episode_id, 0) = COALESCE(?2, 0)
                       AND snapshot_date = ?3"
                ),
                params![podcast_id, episode_id, snapshot_date],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_snapshot(&row)?)),
            None => Ok(None),
        }
    }

    /// Writes the snapshot for its (subject, day), replacing any earlier
    /// values for that same key.
    pub async fn upsert_snapshot(&self, snapshot: &DailySnapshot) -> Result<()> {
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                r#"
                UPDATE daily_analytics SET
                    total_views = ?4, total_likes = ?5, total_comments = ?6,
                    views_today = ?7, likes_today = ?8, comments_today = ?9
                WHERE podcast_id = ?1
                  AND COALESCE(episode_id, 0) = COALESCE(?2, 0)
                  AND snapshot_date = ?3
                "#,
                snapshot_params(snapshot),
            )
            .await?;
        if changed == 0 {
            conn.execute(
                r#"
                INSERT INTO daily_analytics (
                    podcast_id, episode_id, snapshot_date,
                    total_views, total_likes, total_comments,
                    views_today, likes_today, comments_today
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                snapshot_params(snapshot),
            )
            .await
            .with_context(|| {
                format!(
                    "inserting snapshot for podcast {} on {}",
                    snapshot.podcast_id, snapshot.snapshot_date
                )
            })?;
        }
        Ok(())
    }

    /// Podcasts that have at least one episode snapshot on `snapshot_date`.
    pub async fn podcasts_with_episode_snapshots(&self, snapshot_date: i64) -> Result<Vec<i64>> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                r#"
                SELECT DISTINCT podcast_id FROM daily_analytics
                WHERE episode_id IS NOT NULL AND snapshot_date = ?1
                ORDER BY podcast_id
                "#,
                params![snapshot_date],
            )
            .await?;
        collect_rows(rows, |row| Ok(row.get::<i64>(0)?)).await
    }

    /// Sums the episode snapshots of one podcast and day into
    /// `(cumulative totals, today's deltas)`.
    pub async fn sum_episode_snapshots(
        &self,
        podcast_id: i64,
        snapshot_date: i64,
    ) -> Result<(MetricTotals, MetricTotals)> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                r#"
                SELECT COALESCE(SUM(total_views), 0), COALESCE(SUM(total_likes), 0),
                       COALESCE(SUM(total_comments), 0), COALESCE(SUM(views_today), 0),
                       COALESCE(SUM(likes_today), 0), COALESCE(SUM(comments_today), 0)
                FROM daily_analytics
                WHERE podcast_id = ?1 AND episode_id IS NOT NULL AND snapshot_date = ?2
                "#,
                params![podcast_id, snapshot_date],
            )
            .await?;
        let row = rows.next().await?.context("missing snapshot sum row")?;
        Ok((
            MetricTotals {
                views: row.get(0)?,
                likes: row.get(1)?,
                comments: row.get(2)?,
            },
            MetricTotals {
                views: row.get(3)?,
                likes: row.get(4)?,
                comments: row.get(5)?,
            },
        ))
    }

    pub async fn delete_snapshots_before(&self, snapshot_date: i64) -> Result<u64> {
        let conn = self.connect().await?;
        let deleted = conn
            .execute(
                "DELETE FROM daily_analytics WHERE snapshot_date < ?1",
                params![snapshot_date],
            )
            .await?;
        Ok(deleted)
    }

    pub async fn trending_podcasts(&self, since_date: i64, limit: i64) -> Result<Vec<TrendingPodcast>> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                r#"
                SELECT a.podcast_id, p.title, SUM(a.views_today) AS views, SUM(a.likes_today)
                FROM daily_analytics a
                JOIN podcasts p ON p.id = a.podcast_id
                WHERE a.episode_id IS NOT NULL AND a.snapshot_date >= ?1
                GROUP BY a.podcast_id, p.title
                ORDER BY views DESC, a.podcast_id
                LIMIT ?2
                "#,
                params![since_date, limit],
            )
            .await?;
        collect_rows(rows, |row| {
            Ok(TrendingPodcast {
                podcast_id: row.get(0)?,
                title: row.get(1)?,
                views: row.get(2)?,
                likes: row.get(3)?,
            })
        })
        .await
    }

    // ---- settings ----

    pub async fn config_pairs(&self) -> Result<Vec<(String, String)>> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                "SELECT config_key, config_value FROM sync_config ORDER BY config_key",
                params![],
            )
            .await?;
        collect_rows(rows, |row| Ok((row.get::<String>(0)?, row.get::<String>(1)?))).await
    }

    pub async fn put_config(&self, key: &str, value: &str, description: &str) -> Result<()> {
        let conn = self.connect().await?;
        conn.execute(
            r#"
            INSERT INTO sync_config (config_key, config_value, description, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(config_key) DO UPDATE SET
                config_value = excluded.config_value,
                description = excluded.description,
                updated_at = excluded.updated_at
            "#,
            params![key, value, description, now_ts()],
        )
        .await
        .with_context(|| format!("persisting setting {key}"))?;
        Ok(())
    }

    // ---- notifications ----

    pub async fn queue_email(&self, recipient: &str, subject: &str, body: &str) -> Result<i64> {
        let conn = self.connect().await?;
        conn.execute(
            r#"
            INSERT INTO email_queue (recipient, subject, body, status, created_at)
            VALUES (?1, ?2, ?3, 'pending', ?4)
            "#,
            params![recipient, subject, body, now_ts()],
        )
        .await
        .context("queueing email")?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn pending_emails(&self) -> Result<Vec<QueuedEmail>> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                r#"
                SELECT id, recipient, subject, body, status, created_at
                FROM email_queue WHERE status = 'pending' ORDER BY id
                "#,
                params![],
            )
            .await?;
        collect_rows(rows, |row| {
            Ok(QueuedEmail {
                id: row.get(0)?,
                recipient: row.get(1)?,
                subject: row.get(2)?,
                body: row.get(3)?,
                status: row.get(4)?,
                created_at: row.get(5)?,
            })
        })
        .await
    }

    pub async fn add_admin_notification(
        &self,
        kind: &str,
        title: &str,
        message: &str,
        link: Option<&str>,
    ) -> Result<i64> {
        let conn = self.connect().await?;
        conn.execute(
            r#"
            INSERT INTO admin_notifications (kind, title, message, link, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![kind, title, message, link, now_ts()],
        )
        .await
        .context("adding admin notification")?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn list_admin_notifications(&self, limit: i64) -> Result<Vec<AdminNotification>> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                r#"
                SELECT id, kind, title, message, link, is_read, created_at
                FROM admin_notifications ORDER BY id DESC LIMIT ?1
                "#,
                params![limit],
            )
            .await?;
        collect_rows(rows, |row| {
            Ok(AdminNotification {
                id: row.get(0)?,
                kind: row.get(1)?,
                title: row.get(2)?,
                message: row.get(3)?,
                link: row.get(4)?,
                is_read: row.get::<i64>(5)? != 0,
                created_at: row.get(6)?,
            })
        })
        .await
    }
}

const PODCAST_COLUMNS: &str = "id, title, slug, description, cover_image, youtube_playlist_id, \
     status, views, likes, comments, episode_count, created_at, updated_at";

const JOB_COLUMNS: &str = "id, job_type, status, started_at, completed_at, duration_seconds, \
     items_processed, items_updated, items_failed, new_episodes_found, error_message, created_at";

const USAGE_COLUMNS: &str = "usage_date, quota_used, quota_limit, requests_count, \
     successful_requests, failed_requests";

const SNAPSHOT_COLUMNS: &str = "podcast_id, episode_id, snapshot_date, total_views, total_likes, \
     total_comments, views_today, likes_today, comments_today";

fn snapshot_params(snapshot: &DailySnapshot) -> impl libsql::params::IntoParams {
    params![
        snapshot.podcast_id,
        snapshot.episode_id,
        snapshot.snapshot_date,
        snapshot.total_views,
        snapshot.total_likes,
        snapshot.total_comments,
        snapshot.views_today,
        snapshot.likes_today,
        snapshot.comments_today,
    ]
}

async fn collect_rows<T>(mut rows: Rows, map: impl Fn(&Row) -> Result<T>) -> Result<Vec<T>> {
    let mut out = Vec::new();
    while let Some(row) = rows.next().await? {
        out.push(map(&row)?);
    }
    Ok(out)
}

fn row_to_podcast(row: &Row) -> Result<Podcast> {
    let status: String = row.get(6)?;
    Ok(Podcast {
        id: row.get(0)?,
        title: row.get(1)?,
        slug: row.get(2)?,
        description: row.get(3)?,
        cover_image: row.get(4)?,
        youtube_playlist_id: row.get(5)?,
        status: PodcastStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown podcast status {status:?}"))?,
        views: row.get(7)?,
        likes: row.get(8)?,
        comments: row.get(9)?,
        episode_count: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn row_to_episode(row: &Row) -> Result<Episode> {
    Ok(Episode {
        id: row.get(0)?,
        podcast_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        youtube_video_id: row.get(4)?,
        thumbnail: row.get(5)?,
        episode_number: row.get(6)?,
        views: row.get(7)?,
        likes: row.get(8)?,
        comments: row.get(9)?,
        duration: row.get(10)?,
        duration_seconds: row.get(11)?,
        published_date: row.get(12)?,
        created_at: row.get(13)?,
    })
}

fn row_to_job(row: &Row) -> Result<SyncJob> {
    let job_type: String = row.get(1)?;
    let status: String = row.get(2)?;
    Ok(SyncJob {
        id: row.get(0)?,
        job_type: JobKind::parse(&job_type)
            .ok_or_else(|| anyhow!("unknown job type {job_type:?}"))?,
        status: JobStatus::parse(&status).ok_or_else(|| anyhow!("unknown job status {status:?}"))?,
        started_at: row.get(3)?,
        completed_at: row.get(4)?,
        duration_seconds: row.get(5)?,
        counts: JobCounts {
            items_processed: row.get(6)?,
            items_updated: row.get(7)?,
            items_failed: row.get(8)?,
            new_episodes_found: row.get(9)?,
        },
        error_message: row.get(10)?,
        created_at: row.get(11)?,
    })
}

fn row_to_sync_error(row: &Row) -> Result<SyncErrorRecord> {
    let entity_type: String = row.get(2)?;
    let error_type: String = row.get(4)?;
    Ok(SyncErrorRecord {
        id: row.get(0)?,
        sync_job_id: row.get(1)?,
        entity_type: EntityType::parse(&entity_type)
            .ok_or_else(|| anyhow!("unknown entity type {entity_type:?}"))?,
        entity_id: row.get(3)?,
        error_type: ErrorCategory::parse(&error_type)
            .ok_or_else(|| anyhow!("unknown error type {error_type:?}"))?,
        error_message: row.get(5)?,
        youtube_id: row.get(6)?,
        resolved: row.get::<i64>(7)? != 0,
        created_at: row.get(8)?,
        entity_title: row.get(9)?,
    })
}

fn row_to_usage(row: &Row) -> Result<QuotaUsage> {
    Ok(QuotaUsage {
        usage_date: row.get(0)?,
        quota_used: row.get(1)?,
        quota_limit: row.get(2)?,
        requests_count: row.get(3)?,
        successful_requests: row.get(4)?,
        failed_requests: row.get(5)?,
    })
}

fn row_to_snapshot(row: &Row) -> Result<DailySnapshot> {
    Ok(DailySnapshot {
        podcast_id: row.get(0)?,
        episode_id: row.get(1)?,
        snapshot_date: row.get(2)?,
        total_views: row.get(3)?,
        total_likes: row.get(4)?,
        total_comments: row.get(5)?,
        views_today: row.get(6)?,
        likes_today: row.get(7)?,
        comments_today: row.get(8)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    pub(crate) async fn create_store() -> Result<(TempDir, Store)> {
        let dir = tempdir()?;
        let store = Store::open(&dir.path().join("db/sync.db")).await?;
        Ok((dir, store))
    }

    pub(crate) async fn approved_podcast(store: &Store, slug: &str, playlist: &str) -> Result<Podcast> {
        store
            .insert_podcast(&NewPodcast {
                title: format!("Podcast {slug}"),
                slug: slug.to_string(),
                description: String::new(),
                cover_image: None,
                youtube_playlist_id: Some(playlist.to_string()),
                status: PodcastStatus::Approved,
            })
            .await
    }

    pub(crate) fn sample_item(video_id: &str, views: i64) -> SourceItem {
        SourceItem {
            video_id: video_id.to_string(),
            title: format!("Episode {video_id}"),
            description: String::new(),
            thumbnail: format!("https://i.ytimg.com/vi/{video_id}/hq.jpg"),
            duration: "12:30".into(),
            duration_seconds: 750,
            published_date: 1_700_000_000,
            views,
            likes: views / 10,
            comments: views / 100,
        }
    }

    #[tokio::test]
    async fn opens_store_and_creates_schema() -> Result<()> {
        let (dir, store) = create_store().await?;
        assert!(dir.path().join("db/sync.db").exists());

        let conn = store.connect().await?;
        let mut rows = conn.query("PRAGMA journal_mode", params![]).await?;
        let row = rows.next().await?.context("missing journal_mode row")?;
        assert_eq!(row.get::<String>(0)?.to_lowercase(), "wal");

        for table in [
            "podcasts",
            "episodes",
            "sync_jobs",
            "sync_errors",
            "youtube_api_usage",
            "daily_analytics",
            "sync_config",
            "email_queue",
            "admin_notifications",
        ] {
            let mut rows = conn
                .query(
                    "SELECT name FROM sqlite_master WHERE type='table' AND name=?1",
                    params![table],
                )
                .await?;
            assert!(rows.next().await?.is_some(), "missing table {table}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn eligible_podcasts_skip_pending_and_blank_playlists() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let approved = approved_podcast(&store, "one", "PL1").await?;
        store
            .insert_podcast(&NewPodcast {
                title: "Pending".into(),
                slug: "pending".into(),
                description: String::new(),
                cover_image: None,
                youtube_playlist_id: Some("PL2".into()),
                status: PodcastStatus::Pending,
            })
            .await?;
        store
            .insert_podcast(&NewPodcast {
                title: "Blank".into(),
                slug: "blank".into(),
                description: String::new(),
                cover_image: None,
                youtube_playlist_id: Some("  ".into()),
                status: PodcastStatus::Approved,
            })
            .await?;

        let eligible = store.list_eligible_podcasts().await?;
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, approved.id);
        assert_eq!(store.list_podcasts(None).await?.len(), 3);
        assert_eq!(
            store.list_podcasts(Some(PodcastStatus::Pending)).await?.len(),
            1
        );
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_episode_insert_is_rejected() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let podcast = approved_podcast(&store, "dup", "PLdup").await?;
        let item = sample_item("vid1", 10);

        store.insert_episode(podcast.id, &item, Some(item.thumbnail.as_str()), 1).await?;
        assert!(
            store
                .insert_episode(podcast.id, &item, Some(item.thumbnail.as_str()), 2)
                .await
                .is_err()
        );
        assert_eq!(store.next_episode_number(podcast.id).await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn refresh_totals_sums_episodes() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let podcast = approved_podcast(&store, "sum", "PLsum").await?;
        for (n, id) in ["a", "b"].iter().enumerate() {
            let item = sample_item(id, 100);
            store
                .insert_episode(podcast.id, &item, Some(item.thumbnail.as_str()), n as i64 + 1)
                .await?;
        }
        store.update_episode_stats(podcast.id, "b", 300, 30, 3).await?;
        store.refresh_podcast_totals(podcast.id).await?;

        let podcast = store.get_podcast(podcast.id).await?.context("podcast")?;
        assert_eq!(podcast.episode_count, 2);
        assert_eq!(podcast.views, 400);
        assert_eq!(podcast.likes, 40);
        assert_eq!(podcast.comments, 4);
        Ok(())
    }

    #[tokio::test]
    async fn terminal_jobs_are_not_rewritten() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let job_id = store.create_job(JobKind::FullSync).await?;
        store.mark_job_running(job_id, 100).await?;

        let counts = JobCounts {
            items_processed: 3,
            ..JobCounts::default()
        };
        assert!(
            store
                .finish_job(job_id, JobStatus::Completed, counts, None, 130)
                .await?
        );
        assert!(
            !store
                .finish_job(job_id, JobStatus::Failed, counts, Some("late"), 140)
                .await?
        );

        let job = store.get_job(job_id).await?.context("job")?;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.duration_seconds, Some(30));
        assert_eq!(job.counts.items_processed, 3);
        assert!(job.error_message.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn list_jobs_filters_and_counts() -> Result<()> {
        let (_dir, store) = create_store().await?;
        for _ in 0..3 {
            let id = store.create_job(JobKind::NewEpisodesCheck).await?;
            store
                .finish_job(id, JobStatus::Completed, JobCounts::default(), None, now_ts())
                .await?;
        }
        let failed = store.create_job(JobKind::FullSync).await?;
        store
            .finish_job(failed, JobStatus::Failed, JobCounts::default(), Some("boom"), now_ts())
            .await?;

        let (page, total) = store.list_jobs(2, 0, None).await?;
        assert_eq!(total, 4);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, failed);

        let (page, total) = store.list_jobs(10, 0, Some(JobStatus::Failed)).await?;
        assert_eq!(total, 1);
        assert_eq!(page[0].error_message.as_deref(), Some("boom"));
        Ok(())
    }

    #[tokio::test]
    async fn errors_resolve_and_carry_titles() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let podcast = approved_podcast(&store, "err", "PLerr").await?;
        let job_id = store.create_job(JobKind::FullSync).await?;
        let error_id = store
            .record_error(
                job_id,
                &NewSyncError {
                    entity_type: EntityType::Podcast,
                    entity_id: Some(podcast.id),
                    category: ErrorCategory::ApiError,
                    message: "playlist gone".into(),
                    youtube_id: Some("PLerr".into()),
                },
            )
            .await?;

        let open = store.list_errors(false, 50).await?;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].entity_title.as_deref(), Some("Podcast err"));
        assert_eq!(store.count_errors(false, None).await?, 1);

        assert!(store.resolve_error(error_id).await?);
        assert!(!store.resolve_error(error_id + 100).await?);
        assert!(store.list_errors(false, 50).await?.is_empty());
        assert_eq!(store.list_errors(true, 50).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn podcast_level_snapshot_upsert_replaces_row() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let podcast = approved_podcast(&store, "snap", "PLsnap").await?;
        let mut snapshot = DailySnapshot {
            podcast_id: podcast.id,
            episode_id: None,
            snapshot_date: 86_400,
            total_views: 10,
            total_likes: 1,
            total_comments: 0,
            views_today: 0,
            likes_today: 0,
            comments_today: 0,
        };
        store.upsert_snapshot(&snapshot).await?;
        snapshot.total_views = 25;
        snapshot.views_today = 15;
        store.upsert_snapshot(&snapshot).await?;

        let stored = store
            .snapshot(podcast.id, None, 86_400)
            .await?
            .context("snapshot")?;
        assert_eq!(stored, snapshot);

        let conn = store.connect().await?;
        let mut rows = conn
            .query("SELECT COUNT(*) FROM daily_analytics", params![])
            .await?;
        let row = rows.next().await?.context("count")?;
        assert_eq!(row.get::<i64>(0)?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn quota_usage_accumulates_per_day() -> Result<()> {
        let (_dir, store) = create_store().await?;
        store.add_quota_usage(0, 10_000, 3, true).await?;
        store.add_quota_usage(0, 10_000, 1, false).await?;
        store.add_quota_usage(86_400, 10_000, 6, true).await?;

        let day = store.quota_usage(0).await?.context("usage")?;
        assert_eq!(day.quota_used, 4);
        assert_eq!(day.requests_count, 2);
        assert_eq!(day.successful_requests, 1);
        assert_eq!(day.failed_requests, 1);

        let history = store.quota_history(0).await?;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].usage_date, 86_400);
        Ok(())
    }
}
