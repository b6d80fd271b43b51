//! Job orchestration: one sync run at a time, podcasts processed in order,
//! quota checked before each podcast.
//!
//! A run is started with [`SyncService::start`] (or [`SyncService::start_podcast`])
//! which claims the [`RunGuard`] and creates the pending job row, then driven
//! to completion with [`SyncService::execute`]. Splitting the two lets HTTP
//! handlers answer with the job id while the run continues in the background.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::analytics::{AnalyticsAggregator, AnalyticsStats};
use crate::config::RuntimeSettings;
use crate::error::{SyncError, SyncResult};
use crate::notify::{Notifier, OutboxNotifier};
use crate::quota::{FAILED_REQUEST_COST, METADATA_COST, QuotaTracker, listing_cost};
use crate::reconcile::{ReconcileOutcome, Reconciler};
use crate::records::{
    EntityType, JobCounts, JobKind, JobStatus, NewSyncError, Podcast, now_ts,
};
use crate::rehost::{CloudinaryRehost, ImageRehost, PassthroughRehost};
use crate::settings::{SettingsStore, read_seed_file};
use crate::store::Store;
use crate::youtube::{SourceClient, YoutubeClient};

pub const QUOTA_PAUSE_MESSAGE: &str = "API quota limit reached (90%)";

/// Podcasts mentioned in one new-episode notification round.
const NOTIFY_PODCAST_LIMIT: usize = 5;
/// Episode titles listed per podcast in a new-episode notification.
const NOTIFY_TITLE_LIMIT: i64 = 5;
/// Error lines included in an error notification.
const NOTIFY_ERROR_LIMIT: usize = 10;

/// Live view of the run in flight.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveRun {
    pub job_id: i64,
    pub kind: JobKind,
    pub started_at: i64,
    pub total_podcasts: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_podcast: Option<i64>,
    #[serde(flatten)]
    pub counts: JobCounts,
}

/// Single-run lock. Holding a [`RunTicket`] is holding the guard.
#[derive(Debug, Default)]
pub struct RunGuard {
    active: Mutex<Option<ActiveRun>>,
}

impl RunGuard {
    fn try_claim(&self, kind: JobKind) -> SyncResult<()> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(SyncError::AlreadyRunning);
        }
        *active = Some(ActiveRun {
            job_id: 0,
            kind,
            started_at: now_ts(),
            total_podcasts: 0,
            current_podcast: None,
            counts: JobCounts::default(),
        });
        Ok(())
    }

    fn update(&self, apply: impl FnOnce(&mut ActiveRun)) {
        if let Some(run) = self.active.lock().as_mut() {
            apply(run);
        }
    }

    fn release(&self) {
        self.active.lock().take();
    }

    pub fn snapshot(&self) -> Option<ActiveRun> {
        self.active.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.active.lock().is_some()
    }
}

/// Claim on the run guard for one job. Dropping it frees the guard.
#[derive(Debug)]
pub struct RunTicket {
    guard: Arc<RunGuard>,
    job_id: i64,
    kind: JobKind,
    podcast_id: Option<i64>,
}

impl RunTicket {
    pub fn job_id(&self) -> i64 {
        self.job_id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }
}

impl Drop for RunTicket {
    fn drop(&mut self) {
        self.guard.release();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub job_id: i64,
    pub kind: JobKind,
    pub status: JobStatus,
    #[serde(flatten)]
    pub counts: JobCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub is_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_run: Option<ActiveRun>,
}

enum LoopEnd {
    Finished,
    QuotaPaused { used: i64, limit: i64 },
}

/// Accumulates what the notifications need while the loop runs.
#[derive(Default)]
struct RunTally {
    counts: JobCounts,
    new_items: Vec<(Podcast, i64)>,
    error_total: i64,
    error_lines: Vec<String>,
}

impl RunTally {
    fn note_error(&mut self, error: &NewSyncError) {
        self.error_total += 1;
        if self.error_lines.len() < NOTIFY_ERROR_LIMIT {
            self.error_lines.push(format!(
                "- {} ({}): {}",
                error.entity_type.as_str(),
                error.category.as_str(),
                error.message
            ));
        }
    }

    /// Job counters are per podcast. Item errors only feed the notification.
    fn absorb(&mut self, podcast: &Podcast, outcome: &ReconcileOutcome) {
        self.counts.items_processed += 1;
        self.counts.items_updated += 1;
        self.counts.new_episodes_found += outcome.new_count;
        for error in &outcome.errors {
            self.note_error(error);
        }
        if outcome.new_count > 0 {
            self.new_items.push((podcast.clone(), outcome.new_count));
        }
    }
}

pub struct SyncService {
    store: Store,
    settings: Arc<SettingsStore>,
    quota: QuotaTracker,
    source: Arc<dyn SourceClient>,
    reconciler: Reconciler,
    notifier: Arc<dyn Notifier>,
    analytics: AnalyticsAggregator,
    guard: Arc<RunGuard>,
}

impl SyncService {
    pub fn new(
        store: Store,
        settings: Arc<SettingsStore>,
        source: Arc<dyn SourceClient>,
        rehost: Arc<dyn ImageRehost>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            quota: QuotaTracker::new(store.clone(), settings.clone()),
            reconciler: Reconciler::new(store.clone(), rehost),
            analytics: AnalyticsAggregator::new(store.clone()),
            guard: Arc::new(RunGuard::default()),
            store,
            settings,
            source,
            notifier,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    pub fn analytics(&self) -> &AnalyticsAggregator {
        &self.analytics
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn status(&self) -> SyncStatus {
        let current_run = self.guard.snapshot();
        SyncStatus {
            is_running: current_run.is_some(),
            current_run,
        }
    }

    fn ensure_enabled(&self, kind: JobKind) -> SyncResult<()> {
        let settings = self.settings.get();
        if !settings.sync_enabled {
            return Err(SyncError::Disabled("sync is disabled".into()));
        }
        if kind == JobKind::NewEpisodesCheck && !settings.new_episode_check_enabled {
            return Err(SyncError::Disabled("new episode check is disabled".into()));
        }
        Ok(())
    }

    /// Claims the guard and creates the pending job for a run over every
    /// eligible podcast.
    pub async fn start(&self, kind: JobKind) -> SyncResult<RunTicket> {
        if kind == JobKind::PodcastSync {
            return Err(SyncError::invalid_config(
                "podcast_sync runs are started with start_podcast",
            ));
        }
        self.claim(kind, None).await
    }

    /// Like [`SyncService::start`] for a single podcast. The podcast must exist
    /// and be eligible before anything is claimed.
    pub async fn start_podcast(&self, podcast_id: i64) -> SyncResult<RunTicket> {
        let podcast = self
            .store
            .get_podcast(podcast_id)
            .await?
            .ok_or_else(|| SyncError::not_found(format!("podcast {podcast_id}")))?;
        if !podcast.is_eligible() {
            return Err(SyncError::NotEligible(podcast_id));
        }
        self.claim(JobKind::PodcastSync, Some(podcast_id)).await
    }

    async fn claim(&self, kind: JobKind, podcast_id: Option<i64>) -> SyncResult<RunTicket> {
        self.ensure_enabled(kind)?;
        self.guard.try_claim(kind)?;
        let mut ticket = RunTicket {
            guard: self.guard.clone(),
            job_id: 0,
            kind,
            podcast_id,
        };
        // On error the ticket drops here and frees the guard.
        ticket.job_id = self.store.create_job(kind).await?;
        let job_id = ticket.job_id;
        self.guard.update(|run| run.job_id = job_id);
        info!(job_id, kind = kind.as_str(), "sync job created");
        Ok(ticket)
    }

    pub async fn run_full_sync(&self) -> SyncResult<SyncReport> {
        let ticket = self.start(JobKind::FullSync).await?;
        self.execute(ticket).await
    }

    pub async fn check_new_episodes(&self) -> SyncResult<SyncReport> {
        let ticket = self.start(JobKind::NewEpisodesCheck).await?;
        self.execute(ticket).await
    }

    pub async fn sync_podcast(&self, podcast_id: i64) -> SyncResult<SyncReport> {
        let ticket = self.start_podcast(podcast_id).await?;
        self.execute(ticket).await
    }

    /// Drives a claimed run to a terminal status. The returned report is
    /// also what was persisted on the job row.
    pub async fn execute(&self, ticket: RunTicket) -> SyncResult<SyncReport> {
        let job_id = ticket.job_id;
        let kind = ticket.kind;
        let started_at = now_ts();
        if let Err(err) = self.store.mark_job_running(job_id, started_at).await {
            error!(job_id, "could not mark sync job running: {err:#}");
            let message = format!("could not start job: {err:#}");
            if let Err(finish_err) = self
                .store
                .finish_job(job_id, JobStatus::Failed, JobCounts::default(), Some(&message), now_ts())
                .await
            {
                error!(job_id, "could not mark sync job failed: {finish_err:#}");
            }
            return Err(err.into());
        }
        self.guard.update(|run| run.started_at = started_at);
        info!(job_id, kind = kind.as_str(), "sync job running");

        let mut tally = RunTally::default();
        let result = self.run_loop(&ticket, &mut tally).await;

        let (status, error_message) = match &result {
            Ok(LoopEnd::Finished) => (JobStatus::Completed, None),
            Ok(LoopEnd::QuotaPaused { used, limit }) => {
                warn!(job_id, used, limit, "pausing sync, quota limit reached");
                (JobStatus::Paused, Some(QUOTA_PAUSE_MESSAGE.to_string()))
            }
            Err(err) => {
                error!(job_id, "sync job failed: {err}");
                (JobStatus::Failed, Some(err.to_string()))
            }
        };

        if let Err(err) = self
            .store
            .finish_job(job_id, status, tally.counts, error_message.as_deref(), now_ts())
            .await
        {
            error!(
                job_id,
                status = status.as_str(),
                "could not persist sync job result: {err:#}"
            );
            return Err(err.into());
        }
        info!(
            job_id,
            status = status.as_str(),
            processed = tally.counts.items_processed,
            updated = tally.counts.items_updated,
            failed = tally.counts.items_failed,
            new_episodes = tally.counts.new_episodes_found,
            "sync job finished"
        );

        if let Ok(LoopEnd::QuotaPaused { used, limit }) = result {
            if let Err(err) = self.notifier.notify_quota_warning(used, limit).await {
                warn!(job_id, "failed to send quota warning: {err:#}");
            }
        }

        if status == JobStatus::Completed && kind == JobKind::FullSync {
            if let Err(err) = self.analytics.calculate_daily_metrics(None, None).await {
                warn!(job_id, "analytics after full sync failed: {err:#}");
            }
        }

        if status != JobStatus::Failed {
            self.send_run_notifications(&tally).await;
        }

        drop(ticket);
        Ok(SyncReport {
            job_id,
            kind,
            status,
            counts: tally.counts,
            error_message,
        })
    }

    async fn run_loop(&self, ticket: &RunTicket, tally: &mut RunTally) -> SyncResult<LoopEnd> {
        let targets = match ticket.podcast_id {
            Some(id) => {
                let podcast = self
                    .store
                    .get_podcast(id)
                    .await?
                    .ok_or_else(|| SyncError::not_found(format!("podcast {id}")))?;
                vec![podcast]
            }
            None => self.store.list_eligible_podcasts().await?,
        };

        let settings = self.settings.get();
        let batch_size = settings.sync_batch_size.max(1);
        let throttle = Duration::from_millis(settings.throttle_ms);
        let total = targets.len();
        let batches = total.div_ceil(batch_size);
        self.guard.update(|run| run.total_podcasts = total);
        info!(job_id = ticket.job_id, podcasts = total, batches, "syncing podcasts");

        for (index, podcast) in targets.iter().enumerate() {
            if index % batch_size == 0 {
                info!(
                    job_id = ticket.job_id,
                    batch = index / batch_size + 1,
                    batches,
                    "processing batch"
                );
            }

            let quota = self.quota.check_quota().await?;
            if !quota.can_continue {
                return Ok(LoopEnd::QuotaPaused {
                    used: quota.consumed,
                    limit: quota.limit,
                });
            }

            self.guard.update(|run| run.current_podcast = Some(podcast.id));
            match self.sync_target(ticket.job_id, podcast).await {
                Ok(outcome) => tally.absorb(podcast, &outcome),
                Err(SyncError::QuotaExceeded { .. }) => {
                    warn!(
                        job_id = ticket.job_id,
                        podcast_id = podcast.id,
                        "upstream reported quota exhausted"
                    );
                    let quota = self.quota.check_quota().await?;
                    return Ok(LoopEnd::QuotaPaused {
                        used: quota.consumed,
                        limit: quota.limit,
                    });
                }
                Err(err) => {
                    tally.counts.items_processed += 1;
                    tally.counts.items_failed += 1;
                    self.record_target_error(ticket.job_id, podcast, &err, tally)
                        .await;
                }
            }
            let counts = tally.counts;
            self.guard.update(|run| run.counts = counts);

            if index + 1 < total && !throttle.is_zero() {
                tokio::time::sleep(throttle).await;
            }
        }

        Ok(LoopEnd::Finished)
    }

    async fn sync_target(&self, job_id: i64, podcast: &Podcast) -> SyncResult<ReconcileOutcome> {
        let playlist_id = podcast
            .playlist_id()
            .ok_or(SyncError::NotEligible(podcast.id))?;

        let metadata = match self.source.collection_metadata(playlist_id).await {
            Ok(metadata) => {
                self.quota.track_usage(METADATA_COST, true).await?;
                metadata
            }
            Err(err) => {
                self.quota.track_usage(FAILED_REQUEST_COST, false).await?;
                return Err(err);
            }
        };

        let items = match self
            .source
            .list_collection_items(playlist_id, None, 0)
            .await
        {
            Ok(items) => {
                self.quota
                    .track_usage(listing_cost(items.len()), true)
                    .await?;
                items
            }
            Err(err) => {
                self.quota.track_usage(FAILED_REQUEST_COST, false).await?;
                return Err(err);
            }
        };

        info!(
            job_id,
            podcast_id = podcast.id,
            playlist = playlist_id,
            reported = metadata.item_count,
            fetched = items.len(),
            "fetched playlist"
        );
        self.reconciler.reconcile(job_id, podcast.id, &items).await
    }

    async fn record_target_error(
        &self,
        job_id: i64,
        podcast: &Podcast,
        err: &SyncError,
        tally: &mut RunTally,
    ) {
        warn!(job_id, podcast_id = podcast.id, "podcast sync failed: {err}");
        let error = NewSyncError {
            entity_type: EntityType::Podcast,
            entity_id: Some(podcast.id),
            category: err.category(),
            message: err.to_string(),
            youtube_id: podcast.playlist_id().map(str::to_string),
        };
        tally.note_error(&error);
        if let Err(store_err) = self.store.record_error(job_id, &error).await {
            warn!(job_id, "could not record sync error: {store_err:#}");
        }
    }

    async fn send_run_notifications(&self, tally: &RunTally) {
        for (podcast, count) in tally.new_items.iter().take(NOTIFY_PODCAST_LIMIT) {
            let titles = match self
                .store
                .latest_episode_titles(podcast.id, (*count).min(NOTIFY_TITLE_LIMIT))
                .await
            {
                Ok(titles) => titles,
                Err(err) => {
                    warn!(podcast_id = podcast.id, "loading episode titles failed: {err:#}");
                    Vec::new()
                }
            };
            if let Err(err) = self
                .notifier
                .notify_new_items(&podcast.title, *count, &titles)
                .await
            {
                warn!(podcast_id = podcast.id, "new episode notification failed: {err:#}");
            }
        }

        if tally.error_total > 0 {
            if let Err(err) = self
                .notifier
                .notify_errors(tally.error_total, &tally.error_lines)
                .await
            {
                warn!("error notification failed: {err:#}");
            }
        }
    }

    /// Recomputes today's analytics outside of any sync run.
    pub async fn recalculate_analytics(&self) -> SyncResult<AnalyticsStats> {
        Ok(self.analytics.calculate_daily_metrics(None, None).await?)
    }

    pub async fn cleanup_old_data(&self) -> SyncResult<u64> {
        let retention = self.settings.get().analytics_retention_days;
        Ok(self.analytics.cleanup_old_analytics(retention).await?)
    }
}

/// Opens the database and wires the production collaborators described by
/// the process settings.
pub async fn open_service(runtime: &RuntimeSettings) -> anyhow::Result<SyncService> {
    let store = Store::open(&runtime.db_path).await?;
    let seed = match &runtime.settings_seed {
        Some(path) => read_seed_file(path)?,
        None => Vec::new(),
    };
    let settings = Arc::new(
        SettingsStore::load(store.clone(), &seed)
            .await
            .context("loading sync settings")?,
    );

    let api_key = match runtime.require_youtube_api_key() {
        Ok(key) => key,
        Err(err) => {
            warn!("{err:#}, every sync target will fail");
            ""
        }
    };
    let source: Arc<dyn SourceClient> = Arc::new(YoutubeClient::new(api_key));
    let rehost: Arc<dyn ImageRehost> = match runtime.cloudinary() {
        Some((cloud_name, preset)) => Arc::new(CloudinaryRehost::new(cloud_name, preset)),
        None => {
            info!("no image CDN configured, keeping source thumbnails");
            Arc::new(PassthroughRehost)
        }
    };
    let notifier: Arc<dyn Notifier> = Arc::new(OutboxNotifier::new(store.clone(), settings.clone()));

    Ok(SyncService::new(store, settings, source, rehost, notifier))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::records::{CollectionMetadata, ErrorCategory, SourceItem, day_key};
    use crate::settings::{NEW_EPISODE_CHECK_ENABLED, SYNC_ENABLED, THROTTLE_MS};
    use crate::store::tests::{approved_podcast, create_store, sample_item};
    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::{HashMap, HashSet};
    use tempfile::TempDir;

    /// In-memory playlist source that records every metadata lookup.
    #[derive(Default)]
    pub(crate) struct FakeSource {
        pub playlists: Mutex<HashMap<String, Vec<SourceItem>>>,
        pub failing: HashSet<String>,
        pub out_of_quota: HashSet<String>,
        pub lookups: Mutex<Vec<String>>,
    }

    impl FakeSource {
        pub fn with_playlist(mut self, id: &str, items: Vec<SourceItem>) -> Self {
            self.playlists.get_mut().insert(id.to_string(), items);
            self
        }

        pub fn set_playlist(&self, id: &str, items: Vec<SourceItem>) {
            self.playlists.lock().insert(id.to_string(), items);
        }

        fn playlist(&self, id: &str) -> SyncResult<Vec<SourceItem>> {
            self.playlists
                .lock()
                .get(id)
                .cloned()
                .ok_or_else(|| SyncError::not_found(format!("playlist {id}")))
        }
    }

    #[async_trait]
    impl SourceClient for FakeSource {
        async fn collection_metadata(&self, collection_id: &str) -> SyncResult<CollectionMetadata> {
            self.lookups.lock().push(collection_id.to_string());
            if self.failing.contains(collection_id) {
                return Err(SyncError::external("backend error 500"));
            }
            if self.out_of_quota.contains(collection_id) {
                return Err(SyncError::upstream_quota());
            }
            let items = self.playlist(collection_id)?;
            Ok(CollectionMetadata {
                id: collection_id.to_string(),
                title: collection_id.to_string(),
                description: String::new(),
                owner_name: "owner".into(),
                thumbnail: String::new(),
                item_count: items.len() as i64,
            })
        }

        async fn list_collection_items(
            &self,
            collection_id: &str,
            max_results: Option<usize>,
            start_index: usize,
        ) -> SyncResult<Vec<SourceItem>> {
            Ok(self
                .playlist(collection_id)?
                .into_iter()
                .skip(start_index)
                .take(max_results.unwrap_or(usize::MAX))
                .collect())
        }

        async fn item_details(&self, video_ids: &[String]) -> SyncResult<Vec<SourceItem>> {
            Ok(self
                .playlists
                .lock()
                .values()
                .flatten()
                .filter(|item| video_ids.contains(&item.video_id))
                .cloned()
                .collect())
        }
    }

    pub(crate) async fn service_with(
        source: FakeSource,
    ) -> Result<(TempDir, Store, Arc<FakeSource>, SyncService)> {
        let (dir, store) = create_store().await?;
        let seed = vec![
            (SYNC_ENABLED.to_string(), "true".to_string()),
            (THROTTLE_MS.to_string(), "0".to_string()),
        ];
        let settings = Arc::new(SettingsStore::load(store.clone(), &seed).await?);
        let source = Arc::new(source);
        let notifier = Arc::new(OutboxNotifier::new(store.clone(), settings.clone()));
        let service = SyncService::new(
            store.clone(),
            settings,
            source.clone(),
            Arc::new(PassthroughRehost),
            notifier,
        );
        Ok((dir, store, source, service))
    }

    #[tokio::test]
    async fn full_sync_inserts_then_updates() -> Result<()> {
        let source = FakeSource::default()
            .with_playlist("PL1", vec![sample_item("a", 10), sample_item("b", 20)])
            .with_playlist("PL2", vec![sample_item("c", 30)]);
        let (_dir, store, _source, service) = service_with(source).await?;
        let first = approved_podcast(&store, "one", "PL1").await?;
        approved_podcast(&store, "two", "PL2").await?;

        let report = service.run_full_sync().await?;
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.counts.items_processed, 2);
        assert_eq!(report.counts.items_updated, 2);
        assert_eq!(report.counts.new_episodes_found, 3);
        assert_eq!(report.counts.items_failed, 0);

        let job = store.get_job(report.job_id).await?.context("job")?;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.counts, report.counts);

        let usage = store
            .quota_usage(day_key(Utc::now()))
            .await?
            .context("usage")?;
        assert_eq!(usage.quota_used, 2 * (METADATA_COST + 3));

        let stored = store.get_podcast(first.id).await?.context("podcast")?;
        assert_eq!(stored.episode_count, 2);
        assert_eq!(stored.views, 30);

        let today = day_key(Utc::now());
        assert!(store.snapshot(first.id, None, today).await?.is_some());
        let notices = store.list_admin_notifications(10).await?;
        assert_eq!(
            notices.iter().filter(|n| n.kind == "new_episodes").count(),
            2
        );

        let report = service.check_new_episodes().await?;
        assert_eq!(report.kind, JobKind::NewEpisodesCheck);
        assert_eq!(report.counts.new_episodes_found, 0);
        assert_eq!(report.counts.items_updated, 2);
        assert!(!service.status().is_running);
        Ok(())
    }

    #[tokio::test]
    async fn quota_exhaustion_pauses_before_any_call() -> Result<()> {
        let source = FakeSource::default().with_playlist("PL1", vec![sample_item("a", 1)]);
        let (_dir, store, source, service) = service_with(source).await?;
        approved_podcast(&store, "one", "PL1").await?;
        store
            .add_quota_usage(day_key(Utc::now()), 10_000, 9_000, true)
            .await?;

        let report = service.run_full_sync().await?;
        assert_eq!(report.status, JobStatus::Paused);
        assert_eq!(report.error_message.as_deref(), Some(QUOTA_PAUSE_MESSAGE));
        assert!(source.lookups.lock().is_empty());

        let job = store.get_job(report.job_id).await?.context("job")?;
        assert_eq!(job.status, JobStatus::Paused);
        let notices = store.list_admin_notifications(10).await?;
        assert!(notices.iter().any(|n| n.kind == "quota_warning"));
        Ok(())
    }

    #[tokio::test]
    async fn failing_podcast_is_recorded_and_run_continues() -> Result<()> {
        let mut source = FakeSource::default()
            .with_playlist("PLok", vec![sample_item("a", 1)])
            .with_playlist("PLbad", vec![]);
        source.failing.insert("PLbad".into());
        let (_dir, store, _source, service) = service_with(source).await?;
        let bad = approved_podcast(&store, "bad", "PLbad").await?;
        approved_podcast(&store, "ok", "PLok").await?;

        let report = service.run_full_sync().await?;
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.counts.items_processed, 2);
        assert_eq!(report.counts.items_updated, 1);
        assert_eq!(report.counts.items_failed, 1);
        assert_eq!(report.counts.new_episodes_found, 1);

        let errors = store.list_job_errors(report.job_id).await?;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].entity_id, Some(bad.id));
        assert_eq!(errors[0].error_type, ErrorCategory::ApiError);

        let usage = store
            .quota_usage(day_key(Utc::now()))
            .await?
            .context("usage")?;
        assert_eq!(usage.failed_requests, 1);
        let notices = store.list_admin_notifications(10).await?;
        assert!(notices.iter().any(|n| n.kind == "sync_errors"));
        Ok(())
    }

    #[tokio::test]
    async fn second_run_appends_new_episodes_after_existing_ones() -> Result<()> {
        let source = FakeSource::default().with_playlist(
            "PL1",
            vec![sample_item("A", 10), sample_item("B", 20), sample_item("C", 30)],
        );
        let (_dir, store, source, service) = service_with(source).await?;
        let podcast = approved_podcast(&store, "one", "PL1").await?;

        let report = service.run_full_sync().await?;
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.counts.new_episodes_found, 3);
        assert_eq!(report.counts.items_processed, 1);
        assert_eq!(report.counts.items_updated, 1);
        assert_eq!(report.counts.items_failed, 0);
        let stored = store.get_podcast(podcast.id).await?.context("podcast")?;
        assert_eq!(stored.episode_count, 3);
        assert_eq!(stored.views, 60);

        source.set_playlist(
            "PL1",
            vec![sample_item("A", 15), sample_item("B", 20), sample_item("D", 5)],
        );
        let report = service.run_full_sync().await?;
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.counts.new_episodes_found, 1);
        assert_eq!(report.counts.items_processed, 1);
        assert_eq!(report.counts.items_updated, 1);

        let episodes = store.list_episodes(podcast.id).await?;
        let by_id: HashMap<&str, &crate::records::Episode> = episodes
            .iter()
            .map(|episode| (episode.youtube_video_id.as_str(), episode))
            .collect();
        assert_eq!(by_id.len(), 4);
        assert_eq!(by_id["D"].episode_number, 4);
        assert_eq!(by_id["A"].views, 15);
        assert_eq!(by_id["B"].views, 20);
        assert_eq!(by_id["C"].views, 30);

        let stored = store.get_podcast(podcast.id).await?.context("podcast")?;
        assert_eq!(stored.episode_count, 4);
        assert_eq!(stored.views, 70);
        Ok(())
    }

    #[tokio::test]
    async fn upstream_quota_error_pauses_remaining_podcasts() -> Result<()> {
        let mut source = FakeSource::default()
            .with_playlist("PLfirst", vec![sample_item("a", 1)])
            .with_playlist("PLsecond", vec![sample_item("b", 1)]);
        source.out_of_quota.insert("PLfirst".into());
        let (_dir, store, source, service) = service_with(source).await?;
        approved_podcast(&store, "first", "PLfirst").await?;
        approved_podcast(&store, "second", "PLsecond").await?;

        let report = service.run_full_sync().await?;
        assert_eq!(report.status, JobStatus::Paused);
        assert_eq!(report.error_message.as_deref(), Some(QUOTA_PAUSE_MESSAGE));
        assert_eq!(report.counts.items_processed, 0);
        assert_eq!(report.counts.items_failed, 0);
        assert_eq!(*source.lookups.lock(), vec!["PLfirst".to_string()]);
        assert!(store.list_job_errors(report.job_id).await?.is_empty());

        let job = store.get_job(report.job_id).await?.context("job")?;
        assert_eq!(job.status, JobStatus::Paused);
        let notices = store.list_admin_notifications(10).await?;
        assert!(notices.iter().any(|n| n.kind == "quota_warning"));
        Ok(())
    }

    #[tokio::test]
    async fn storage_failure_at_start_marks_job_failed() -> Result<()> {
        let (_dir, store, _source, service) = service_with(FakeSource::default()).await?;
        let conn = store.connect().await?;
        conn.execute_batch(
            "CREATE TRIGGER refuse_running BEFORE UPDATE OF status ON sync_jobs \
             WHEN NEW.status = 'running' BEGIN SELECT RAISE(ABORT, 'disk unavailable'); END;",
        )
        .await?;

        let ticket = service.start(JobKind::FullSync).await?;
        let job_id = ticket.job_id();
        assert!(matches!(
            service.execute(ticket).await,
            Err(SyncError::Internal(_))
        ));
        assert!(!service.status().is_running);

        let job = store.get_job(job_id).await?.context("job")?;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(
            job.error_message
                .as_deref()
                .is_some_and(|message| message.contains("disk unavailable"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_running() -> Result<()> {
        let (_dir, _store, _source, service) = service_with(FakeSource::default()).await?;

        let ticket = service.start(JobKind::FullSync).await?;
        let status = service.status();
        assert!(status.is_running);
        assert_eq!(
            status.current_run.as_ref().map(|run| run.job_id),
            Some(ticket.job_id())
        );
        assert!(matches!(
            service.start(JobKind::NewEpisodesCheck).await,
            Err(SyncError::AlreadyRunning)
        ));

        let report = service.execute(ticket).await?;
        assert_eq!(report.status, JobStatus::Completed);
        assert!(!service.status().is_running);
        let again = service.start(JobKind::FullSync).await?;
        drop(again);
        assert!(!service.status().is_running);
        Ok(())
    }

    #[tokio::test]
    async fn disabled_settings_block_runs() -> Result<()> {
        let (_dir, _store, _source, service) = service_with(FakeSource::default()).await?;

        service
            .settings()
            .update(NEW_EPISODE_CHECK_ENABLED, "false")
            .await?;
        assert!(matches!(
            service.check_new_episodes().await,
            Err(SyncError::Disabled(_))
        ));
        assert!(service.start(JobKind::FullSync).await.is_ok());

        service.settings().update(SYNC_ENABLED, "false").await?;
        assert!(matches!(
            service.run_full_sync().await,
            Err(SyncError::Disabled(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn podcast_trigger_checks_eligibility_first() -> Result<()> {
        let source = FakeSource::default().with_playlist("PL1", vec![sample_item("a", 1)]);
        let (_dir, store, _source, service) = service_with(source).await?;
        let podcast = approved_podcast(&store, "one", "PL1").await?;

        assert!(matches!(
            service.sync_podcast(podcast.id + 50).await,
            Err(SyncError::NotFound(_))
        ));
        let (_, total) = store.list_jobs(10, 0, None).await?;
        assert_eq!(total, 0);

        let report = service.sync_podcast(podcast.id).await?;
        assert_eq!(report.kind, JobKind::PodcastSync);
        assert_eq!(report.counts.new_episodes_found, 1);

        store
            .set_podcast_status(podcast.id, crate::records::PodcastStatus::Rejected)
            .await?;
        assert!(matches!(
            service.sync_podcast(podcast.id).await,
            Err(SyncError::NotEligible(_))
        ));
        Ok(())
    }
}
