//! Operator notifications. Emails are rendered into the `email_queue` outbox
//! and picked up by whatever delivers mail; in-app notices land in
//! `admin_notifications`.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::settings::SettingsStore;
use crate::store::Store;

pub const SYNC_ADMIN_LINK: &str = "/admin/sync";

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_new_items(&self, podcast_title: &str, count: i64, titles: &[String])
    -> Result<()>;

    /// `details` are preformatted one-line descriptions of the failures.
    async fn notify_errors(&self, count: i64, details: &[String]) -> Result<()>;

    async fn notify_quota_warning(&self, used: i64, limit: i64) -> Result<()>;

    async fn send_test(&self, recipient: &str) -> Result<()>;
}

pub struct OutboxNotifier {
    store: Store,
    settings: Arc<SettingsStore>,
}

impl OutboxNotifier {
    pub fn new(store: Store, settings: Arc<SettingsStore>) -> Self {
        Self { store, settings }
    }

    /// Admin recipient, or `None` when email notifications are off.
    fn recipient(&self) -> Option<String> {
        let settings = self.settings.get();
        let email = settings.admin_email.trim();
        (settings.email_notifications_enabled && !email.is_empty()).then(|| email.to_string())
    }

    async fn queue(&self, subject: &str, body: &str) -> Result<()> {
        match self.recipient() {
            Some(recipient) => {
                self.store.queue_email(&recipient, subject, body).await?;
                debug!(subject, "queued notification email");
            }
            None => debug!(subject, "email notifications disabled, skipping"),
        }
        Ok(())
    }
}

fn render_new_items(podcast_title: &str, count: i64, titles: &[String]) -> (String, String) {
    let subject = format!("{count} new episode(s) for {podcast_title}");
    let mut body = format!("The sync found {count} new episode(s) for \"{podcast_title}\".\n");
    if !titles.is_empty() {
        body.push_str("\nLatest episodes:\n");
        for title in titles {
            body.push_str(&format!("- {title}\n"));
        }
    }
    (subject, body)
}

fn render_errors(count: i64, details: &[String]) -> (String, String) {
    let subject = format!("Sync finished with {count} error(s)");
    let mut body = format!("The last sync run recorded {count} error(s).\n\n");
    for line in details {
        body.push_str(line);
        body.push('\n');
    }
    if (details.len() as i64) < count {
        body.push_str(&format!("... and {} more\n", count - details.len() as i64));
    }
    body.push_str(&format!("\nReview them at {SYNC_ADMIN_LINK}.\n"));
    (subject, body)
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn notify_new_items(
        &self,
        podcast_title: &str,
        count: i64,
        titles: &[String],
    ) -> Result<()> {
        let (subject, body) = render_new_items(podcast_title, count, titles);
        self.queue(&subject, &body).await?;
        self.store
            .add_admin_notification("new_episodes", &subject, &body, Some(SYNC_ADMIN_LINK))
            .await?;
        Ok(())
    }

    async fn notify_errors(&self, count: i64, details: &[String]) -> Result<()> {
        let (subject, body) = render_errors(count, details);
        self.queue(&subject, &body).await?;
        self.store
            .add_admin_notification(
                "sync_errors",
                "Sync errors",
                &format!("{count} error(s) occurred during the last sync"),
                Some(SYNC_ADMIN_LINK),
            )
            .await?;
        Ok(())
    }

    async fn notify_quota_warning(&self, used: i64, limit: i64) -> Result<()> {
        let percentage = if limit > 0 {
            used as f64 / limit as f64 * 100.0
        } else {
            100.0
        };
        let subject = "YouTube API quota warning".to_string();
        let body = format!(
            "The sync paused after using {used} of {limit} API units ({percentage:.1}%).\n\
             It will resume with the next scheduled run after the daily reset.\n"
        );
        self.queue(&subject, &body).await?;
        self.store
            .add_admin_notification(
                "quota_warning",
                "API quota limit reached",
                &format!("{used}/{limit} units used ({percentage:.1}%)"),
                Some(SYNC_ADMIN_LINK),
            )
            .await?;
        Ok(())
    }

    async fn send_test(&self, recipient: &str) -> Result<()> {
        self.store
            .queue_email(
                recipient,
                "PodDB sync test notification",
                "This is a test message from the PodDB sync service.\n",
            )
            .await?;
        info!(recipient, "queued test notification");
        Ok(())
    }
}
