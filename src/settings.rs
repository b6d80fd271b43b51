//! Typed sync settings persisted in the `sync_config` table.
//!
//! Values are stored as text rows so operators can inspect them with any
//! SQLite client, but they are parsed and validated into [`SyncSettings`]
//! before anything else sees them.

use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{SyncError, SyncResult};
use crate::store::Store;

pub const SYNC_ENABLED: &str = "sync_enabled";
pub const NEW_EPISODE_CHECK_ENABLED: &str = "new_episode_check_enabled";
pub const EMAIL_NOTIFICATIONS_ENABLED: &str = "email_notifications_enabled";
pub const SYNC_SCHEDULE_HOUR: &str = "sync_schedule_hour";
pub const SYNC_BATCH_SIZE: &str = "sync_batch_size";
pub const QUOTA_DAILY_LIMIT: &str = "quota_daily_limit";
pub const ANALYTICS_RETENTION_DAYS: &str = "analytics_retention_days";
pub const THROTTLE_MS: &str = "throttle_ms";
pub const ADMIN_EMAIL: &str = "admin_email";

/// Every recognised key with the description stored next to it.
pub const SETTING_KEYS: &[(&str, &str)] = &[
    (SYNC_ENABLED, "Master switch for scheduled and manual syncs"),
    (NEW_EPISODE_CHECK_ENABLED, "Run the periodic new-episode check"),
    (EMAIL_NOTIFICATIONS_ENABLED, "Queue notification emails for the admin"),
    (SYNC_SCHEDULE_HOUR, "UTC hour of the daily full sync (0-23)"),
    (SYNC_BATCH_SIZE, "Podcasts per progress batch"),
    (QUOTA_DAILY_LIMIT, "Daily YouTube API quota in units"),
    (ANALYTICS_RETENTION_DAYS, "Days of analytics snapshots to keep"),
    (THROTTLE_MS, "Delay between podcasts in milliseconds"),
    (ADMIN_EMAIL, "Recipient of sync notifications"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    pub sync_enabled: bool,
    pub new_episode_check_enabled: bool,
    pub email_notifications_enabled: bool,
    pub sync_schedule_hour: u32,
    pub sync_batch_size: usize,
    pub quota_daily_limit: i64,
    pub analytics_retention_days: i64,
    pub throttle_ms: u64,
    pub admin_email: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            sync_enabled: false,
            new_episode_check_enabled: true,
            email_notifications_enabled: true,
            sync_schedule_hour: 2,
            sync_batch_size: 50,
            quota_daily_limit: 10_000,
            analytics_retention_days: 365,
            throttle_ms: 500,
            admin_email: String::new(),
        }
    }
}

impl SyncSettings {
    /// Builds settings from stored rows on top of the defaults. Unknown keys
    /// are skipped with a warning so an old database never blocks startup.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> SyncResult<Self>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut settings = Self::default();
        for (key, value) in pairs {
            let key = key.as_ref();
            if !is_known_key(key) {
                warn!(key, "ignoring unknown sync setting");
                continue;
            }
            settings.apply(key, value.as_ref())?;
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        SETTING_KEYS
            .iter()
            .filter_map(|(key, _)| self.get(key).map(|value| (*key, value)))
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let value = match key {
            SYNC_ENABLED => self.sync_enabled.to_string(),
            NEW_EPISODE_CHECK_ENABLED => self.new_episode_check_enabled.to_string(),
            EMAIL_NOTIFICATIONS_ENABLED => self.email_notifications_enabled.to_string(),
            SYNC_SCHEDULE_HOUR => self.sync_schedule_hour.to_string(),
            SYNC_BATCH_SIZE => self.sync_batch_size.to_string(),
            QUOTA_DAILY_LIMIT => self.quota_daily_limit.to_string(),
            ANALYTICS_RETENTION_DAYS => self.analytics_retention_days.to_string(),
            THROTTLE_MS => self.throttle_ms.to_string(),
            ADMIN_EMAIL => self.admin_email.clone(),
            _ => return None,
        };
        Some(value)
    }

    /// Parses `value` into the field named by `key` and re-validates.
    pub fn set(&mut self, key: &str, value: &str) -> SyncResult<()> {
        if !is_known_key(key) {
            return Err(SyncError::invalid_config(format!("unknown setting {key:?}")));
        }
        let mut next = self.clone();
        next.apply(key, value)?;
        next.validate()?;
        *self = next;
        Ok(())
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.sync_schedule_hour > 23 {
            return Err(SyncError::invalid_config(format!(
                "{SYNC_SCHEDULE_HOUR} must be between 0 and 23, got {}",
                self.sync_schedule_hour
            )));
        }
        if self.sync_batch_size == 0 {
            return Err(SyncError::invalid_config(format!(
                "{SYNC_BATCH_SIZE} must be at least 1"
            )));
        }
        if self.quota_daily_limit < 1 {
            return Err(SyncError::invalid_config(format!(
                "{QUOTA_DAILY_LIMIT} must be at least 1"
            )));
        }
        if self.analytics_retention_days < 1 {
            return Err(SyncError::invalid_config(format!(
                "{ANALYTICS_RETENTION_DAYS} must be at least 1"
            )));
        }
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> SyncResult<()> {
        let value = value.trim();
        match key {
            SYNC_ENABLED => self.sync_enabled = parse_bool(key, value)?,
            NEW_EPISODE_CHECK_ENABLED => self.new_episode_check_enabled = parse_bool(key, value)?,
            EMAIL_NOTIFICATIONS_ENABLED => {
                self.email_notifications_enabled = parse_bool(key, value)?
            }
            SYNC_SCHEDULE_HOUR => self.sync_schedule_hour = parse_number(key, value)?,
            SYNC_BATCH_SIZE => self.sync_batch_size = parse_number(key, value)?,
            QUOTA_DAILY_LIMIT => self.quota_daily_limit = parse_number(key, value)?,
            ANALYTICS_RETENTION_DAYS => self.analytics_retention_days = parse_number(key, value)?,
            THROTTLE_MS => self.throttle_ms = parse_number(key, value)?,
            ADMIN_EMAIL => self.admin_email = value.to_string(),
            _ => return Err(SyncError::invalid_config(format!("unknown setting {key:?}"))),
        }
        Ok(())
    }
}

fn is_known_key(key: &str) -> bool {
    SETTING_KEYS.iter().any(|(known, _)| *known == key)
}

fn description_for(key: &str) -> &'static str {
    SETTING_KEYS
        .iter()
        .find(|(known, _)| *known == key)
        .map(|(_, description)| *description)
        .unwrap_or("")
}

fn parse_bool(key: &str, value: &str) -> SyncResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(SyncError::invalid_config(format!(
            "{key} must be true or false, got {other:?}"
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> SyncResult<T> {
    value
        .parse()
        .map_err(|_| SyncError::invalid_config(format!("{key} must be a number, got {value:?}")))
}

/// Reads a TOML seed file (`key = value` pairs at the top level) into string
/// pairs understood by [`SyncSettings::set`].
pub fn read_seed_file(path: &Path) -> Result<Vec<(String, String)>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading settings seed {}", path.display()))?;
    let table: toml::Table =
        toml::from_str(&raw).with_context(|| format!("parsing settings seed {}", path.display()))?;

    let mut pairs = Vec::with_capacity(table.len());
    for (key, value) in table {
        let text = match value {
            toml::Value::String(text) => text,
            toml::Value::Integer(number) => number.to_string(),
            toml::Value::Boolean(flag) => flag.to_string(),
            other => anyhow::bail!("setting {key} has unsupported value {other}"),
        };
        pairs.push((key, text));
    }
    Ok(pairs)
}

/// In-memory copy of the settings backed by the database.
pub struct SettingsStore {
    store: Store,
    current: RwLock<SyncSettings>,
}

impl SettingsStore {
    /// Loads stored settings. Keys present in `seed` but absent from the
    /// database are written first, so the seed only fills gaps.
    pub async fn load(store: Store, seed: &[(String, String)]) -> SyncResult<Self> {
        let stored = store.config_pairs().await?;
        for (key, value) in seed {
            if stored.iter().any(|(existing, _)| existing == key) {
                continue;
            }
            let mut candidate = SyncSettings::default();
            candidate.set(key, value)?;
            store.put_config(key, value, description_for(key)).await?;
            info!(key, value = value.as_str(), "seeded sync setting");
        }

        let settings = SyncSettings::from_pairs(store.config_pairs().await?)?;
        Ok(Self {
            store,
            current: RwLock::new(settings),
        })
    }

    pub fn get(&self) -> SyncSettings {
        self.current.read().clone()
    }

    /// Re-reads the table and swaps the in-memory copy if it validates.
    pub async fn reload(&self) -> SyncResult<SyncSettings> {
        let settings = SyncSettings::from_pairs(self.store.config_pairs().await?)?;
        *self.current.write() = settings.clone();
        Ok(settings)
    }

    pub async fn update(&self, key: &str, value: &str) -> SyncResult<SyncSettings> {
        let mut next = self.get();
        next.set(key, value)?;
        let normalized = next.get(key).unwrap_or_default();
        self.store
            .put_config(key, &normalized, description_for(key))
            .await?;
        *self.current.write() = next.clone();
        info!(key, value = normalized.as_str(), "updated sync setting");
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::create_store;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_match_documented_values() {
        let settings = SyncSettings::default();
        assert!(!settings.sync_enabled);
        assert!(settings.new_episode_check_enabled);
        assert_eq!(settings.sync_schedule_hour, 2);
        assert_eq!(settings.sync_batch_size, 50);
        assert_eq!(settings.quota_daily_limit, 10_000);
        assert_eq!(settings.to_pairs().len(), SETTING_KEYS.len());
    }

    #[test]
    fn set_rejects_invalid_values_without_mutating() {
        let mut settings = SyncSettings::default();
        assert!(matches!(
            settings.set(SYNC_SCHEDULE_HOUR, "24"),
            Err(SyncError::InvalidConfig(_))
        ));
        assert!(settings.set(SYNC_BATCH_SIZE, "0").is_err());
        assert!(settings.set(SYNC_ENABLED, "yes").is_err());
        assert!(settings.set("bogus", "1").is_err());
        assert_eq!(settings, SyncSettings::default());

        settings.set(SYNC_ENABLED, " TRUE ").unwrap();
        assert!(settings.sync_enabled);
    }

    #[test]
    fn from_pairs_skips_unknown_keys() {
        let settings =
            SyncSettings::from_pairs([("legacy_flag", "1"), (SYNC_SCHEDULE_HOUR, "5")]).unwrap();
        assert_eq!(settings.sync_schedule_hour, 5);
    }

    #[test]
    fn seed_file_accepts_typed_toml_values() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(
            file,
            "sync_enabled = true\nsync_schedule_hour = 4\nadmin_email = \"ops@example.com\""
        )?;
        let mut pairs = read_seed_file(file.path())?;
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("admin_email".to_string(), "ops@example.com".to_string()),
                ("sync_enabled".to_string(), "true".to_string()),
                ("sync_schedule_hour".to_string(), "4".to_string()),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn seed_only_fills_missing_keys() -> Result<()> {
        let (_dir, store) = create_store().await?;
        store.put_config(SYNC_SCHEDULE_HOUR, "7", "").await?;

        let seed = vec![
            (SYNC_SCHEDULE_HOUR.to_string(), "4".to_string()),
            (SYNC_ENABLED.to_string(), "true".to_string()),
        ];
        let settings = SettingsStore::load(store, &seed).await?;
        let current = settings.get();
        assert_eq!(current.sync_schedule_hour, 7);
        assert!(current.sync_enabled);
        Ok(())
    }

    #[tokio::test]
    async fn update_persists_and_reload_reads_back() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let settings = SettingsStore::load(store.clone(), &[]).await?;

        settings.update(THROTTLE_MS, "0").await?;
        assert!(settings.update(SYNC_SCHEDULE_HOUR, "99").await.is_err());
        assert_eq!(settings.get().sync_schedule_hour, 2);

        store.put_config(SYNC_BATCH_SIZE, "5", "").await?;
        let reloaded = settings.reload().await?;
        assert_eq!(reloaded.throttle_ms, 0);
        assert_eq!(reloaded.sync_batch_size, 5);
        Ok(())
    }
}
