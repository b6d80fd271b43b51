//! Merges fetched items into the stored episodes of one podcast.
//!
//! New videos are inserted with the next episode number, known videos only
//! get their counters refreshed, and the podcast aggregates are recomputed
//! afterwards. Per-item failures are recorded against the job and never abort
//! the batch.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::records::{EntityType, ErrorCategory, NewSyncError, SourceItem};
use crate::rehost::ImageRehost;
use crate::store::Store;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileOutcome {
    pub new_count: i64,
    pub updated_count: i64,
    /// Item-level failures, already written to `sync_errors`.
    pub errors: Vec<NewSyncError>,
}

#[derive(Clone)]
pub struct Reconciler {
    store: Store,
    rehost: Arc<dyn ImageRehost>,
}

impl Reconciler {
    pub fn new(store: Store, rehost: Arc<dyn ImageRehost>) -> Self {
        Self { store, rehost }
    }

    pub async fn reconcile(
        &self,
        job_id: i64,
        podcast_id: i64,
        fetched: &[SourceItem],
    ) -> SyncResult<ReconcileOutcome> {
        let podcast = self
            .store
            .get_podcast(podcast_id)
            .await?
            .ok_or_else(|| SyncError::not_found(format!("podcast {podcast_id}")))?;
        if !podcast.is_eligible() {
            return Err(SyncError::NotEligible(podcast_id));
        }

        let existing = self.store.episode_video_ids(podcast_id).await?;
        let mut seen = HashSet::with_capacity(fetched.len());
        let mut outcome = ReconcileOutcome::default();

        for item in fetched {
            if !seen.insert(item.video_id.as_str()) {
                debug!(video_id = item.video_id.as_str(), "skipping duplicate item in batch");
                continue;
            }

            if existing.contains(&item.video_id) {
                self.update_item(job_id, podcast_id, item, &mut outcome).await;
            } else {
                self.insert_item(job_id, podcast_id, item, &mut outcome).await;
            }
        }

        self.store.refresh_podcast_totals(podcast_id).await?;
        debug!(
            podcast_id,
            new = outcome.new_count,
            updated = outcome.updated_count,
            failed = outcome.errors.len(),
            "reconciled podcast"
        );
        Ok(outcome)
    }

    async fn insert_item(
        &self,
        job_id: i64,
        podcast_id: i64,
        item: &SourceItem,
        outcome: &mut ReconcileOutcome,
    ) {
        let thumbnail = self.thumbnail_for(item).await;
        let result = async {
            let number = self.store.next_episode_number(podcast_id).await?;
            self.store
                .insert_episode(podcast_id, item, thumbnail.as_deref(), number)
                .await
        }
        .await;

        match result {
            Ok(_) => outcome.new_count += 1,
            Err(err) => {
                let error = NewSyncError {
                    entity_type: EntityType::Episode,
                    entity_id: None,
                    category: ErrorCategory::InvalidData,
                    message: format!("failed to insert episode: {err:#}"),
                    youtube_id: Some(item.video_id.clone()),
                };
                self.record(job_id, error, outcome).await;
            }
        }
    }

    async fn update_item(
        &self,
        job_id: i64,
        podcast_id: i64,
        item: &SourceItem,
        outcome: &mut ReconcileOutcome,
    ) {
        let result = self
            .store
            .update_episode_stats(podcast_id, &item.video_id, item.views, item.likes, item.comments)
            .await;
        match result {
            Ok(_) => outcome.updated_count += 1,
            Err(err) => {
                let error = NewSyncError {
                    entity_type: EntityType::Episode,
                    entity_id: None,
                    category: ErrorCategory::InvalidData,
                    message: format!("failed to update episode stats: {err:#}"),
                    youtube_id: Some(item.video_id.clone()),
                };
                self.record(job_id, error, outcome).await;
            }
        }
    }

    /// Re-hosted thumbnail URL, or the source URL if re-hosting fails.
    async fn thumbnail_for(&self, item: &SourceItem) -> Option<String> {
        if item.thumbnail.is_empty() {
            return None;
        }
        match self.rehost.rehost(&item.thumbnail, &item.video_id).await {
            Ok(url) => Some(url),
            Err(err) => {
                warn!(
                    video_id = item.video_id.as_str(),
                    "thumbnail re-host failed, keeping source URL: {err:#}"
                );
                Some(item.thumbnail.clone())
            }
        }
    }

    async fn record(&self, job_id: i64, error: NewSyncError, outcome: &mut ReconcileOutcome) {
        warn!(
            job_id,
            youtube_id = error.youtube_id.as_deref().unwrap_or(""),
            "{}",
            error.message
        );
        if let Err(err) = self.store.record_error(job_id, &error).await {
            warn!(job_id, "could not record sync error: {err:#}");
        }
        outcome.errors.push(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{JobKind, NewPodcast, PodcastStatus};
    use crate::rehost::PassthroughRehost;
    use crate::store::tests::{approved_podcast, create_store, sample_item};
    use anyhow::{Context, Result, anyhow};
    use async_trait::async_trait;

    struct FailingRehost;

    #[async_trait]
    impl ImageRehost for FailingRehost {
        async fn rehost(&self, _source_url: &str, _identifier: &str) -> anyhow::Result<String> {
            Err(anyhow!("cdn down"))
        }
    }

    struct PrefixRehost;

    #[async_trait]
    impl ImageRehost for PrefixRehost {
        async fn rehost(&self, _source_url: &str, identifier: &str) -> anyhow::Result<String> {
            Ok(format!("https://cdn.example/episodes/{identifier}"))
        }
    }

    #[tokio::test]
    async fn new_then_updated_items() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let podcast = approved_podcast(&store, "fresh", "PLfresh").await?;
        let job_id = store.create_job(JobKind::FullSync).await?;
        let reconciler = Reconciler::new(store.clone(), Arc::new(PrefixRehost));

        let first = vec![sample_item("a", 100), sample_item("b", 200), sample_item("c", 300)];
        let outcome = reconciler.reconcile(job_id, podcast.id, &first).await?;
        assert_eq!(outcome.new_count, 3);
        assert_eq!(outcome.updated_count, 0);
        assert!(outcome.errors.is_empty());

        let episodes = store.list_episodes(podcast.id).await?;
        let numbers: Vec<i64> = episodes.iter().map(|ep| ep.episode_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(
            episodes[0].thumbnail.as_deref(),
            Some("https://cdn.example/episodes/a")
        );
        let stored = store.get_podcast(podcast.id).await?.context("podcast")?;
        assert_eq!(stored.episode_count, 3);
        assert_eq!(stored.views, 600);

        let second = vec![sample_item("a", 150), sample_item("b", 200), sample_item("c", 300)];
        let outcome = reconciler.reconcile(job_id, podcast.id, &second).await?;
        assert_eq!(outcome.new_count, 0);
        assert_eq!(outcome.updated_count, 3);

        let stored = store.get_podcast(podcast.id).await?.context("podcast")?;
        assert_eq!(stored.episode_count, 3);
        assert_eq!(stored.views, 650);
        let episode_a = store
            .list_episodes(podcast.id)
            .await?
            .into_iter()
            .find(|ep| ep.youtube_video_id == "a")
            .context("episode a")?;
        assert_eq!(episode_a.views, 150);
        assert_eq!(episode_a.episode_number, 1);
        Ok(())
    }

    #[tokio::test]
    async fn ineligible_podcast_is_rejected_without_writes() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let pending = store
            .insert_podcast(&NewPodcast {
                title: "Pending".into(),
                slug: "pending".into(),
                description: String::new(),
                cover_image: None,
                youtube_playlist_id: Some("PLpending".into()),
                status: PodcastStatus::Pending,
            })
            .await?;
        let job_id = store.create_job(JobKind::FullSync).await?;
        let reconciler = Reconciler::new(store.clone(), Arc::new(PassthroughRehost));

        let err = reconciler
            .reconcile(job_id, pending.id, &[sample_item("x", 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotEligible(id) if id == pending.id));
        assert!(store.list_episodes(pending.id).await?.is_empty());

        let err = reconciler.reconcile(job_id, 9_999, &[]).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
        Ok(())
    }

    #[tokio::test]
    async fn duplicates_in_batch_collapse_to_first() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let podcast = approved_podcast(&store, "dupes", "PLdupes").await?;
        let job_id = store.create_job(JobKind::FullSync).await?;
        let reconciler = Reconciler::new(store.clone(), Arc::new(PassthroughRehost));

        let batch = vec![sample_item("v", 10), sample_item("v", 99), sample_item("w", 5)];
        let outcome = reconciler.reconcile(job_id, podcast.id, &batch).await?;
        assert_eq!(outcome.new_count, 2);
        assert!(outcome.errors.is_empty());

        let episodes = store.list_episodes(podcast.id).await?;
        assert_eq!(episodes.len(), 2);
        assert_eq!(episodes[0].views, 10);
        Ok(())
    }

    #[tokio::test]
    async fn rehost_failure_keeps_source_thumbnail() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let podcast = approved_podcast(&store, "thumbs", "PLthumbs").await?;
        let job_id = store.create_job(JobKind::FullSync).await?;
        let reconciler = Reconciler::new(store.clone(), Arc::new(FailingRehost));

        let item = sample_item("t", 1);
        let outcome = reconciler.reconcile(job_id, podcast.id, &[item.clone()]).await?;
        assert_eq!(outcome.new_count, 1);

        let episodes = store.list_episodes(podcast.id).await?;
        assert_eq!(episodes[0].thumbnail.as_deref(), Some(item.thumbnail.as_str()));
        Ok(())
    }

    #[tokio::test]
    async fn insert_failure_is_recorded_and_batch_continues() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let podcast = approved_podcast(&store, "reject", "PLreject").await?;
        let job_id = store.create_job(JobKind::FullSync).await?;
        let reconciler = Reconciler::new(store.clone(), Arc::new(PassthroughRehost));

        store
            .connect()
            .await?
            .execute_batch(
                r#"
                CREATE TRIGGER reject_bad BEFORE INSERT ON episodes
                WHEN NEW.youtube_video_id = 'bad'
                BEGIN SELECT RAISE(ABORT, 'rejected by test'); END;
                "#,
            )
            .await?;

        let batch = vec![sample_item("good1", 1), sample_item("bad", 2), sample_item("good2", 3)];
        let outcome = reconciler.reconcile(job_id, podcast.id, &batch).await?;
        assert_eq!(outcome.new_count, 2);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].category, ErrorCategory::InvalidData);

        let numbers: Vec<i64> = store
            .list_episodes(podcast.id)
            .await?
            .iter()
            .map(|ep| ep.episode_number)
            .collect();
        assert_eq!(numbers, vec![1, 2]);

        let recorded = store.list_job_errors(job_id).await?;
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].youtube_id.as_deref(), Some("bad"));
        assert_eq!(recorded[0].entity_type, EntityType::Episode);
        Ok(())
    }
}
