use anyhow::{Context, Result, anyhow};
use tracing_subscriber::EnvFilter;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DB_PATH: &str = "data/poddb.db";
pub const DEFAULT_PODDB_PORT: u16 = 8080;
pub const DEFAULT_PODDB_HOST: &str = "127.0.0.1";
pub const DEFAULT_LOG_FILTER: &str = "poddb_sync=info,sync_server=info,run_sync=info,tower_http=info";

/// Installs the global `tracing` subscriber. `RUST_LOG` overrides the default
/// filter.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Process-level settings. Everything the operator can change at runtime
/// lives in [`crate::settings::SyncSettings`] instead.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub youtube_api_key: Option<String>,
    pub admin_token: Option<String>,
    pub cloudinary_cloud_name: Option<String>,
    pub cloudinary_upload_preset: Option<String>,
    pub settings_seed: Option<PathBuf>,
}

impl RuntimeSettings {
    pub fn require_youtube_api_key(&self) -> Result<&str> {
        self.youtube_api_key
            .as_deref()
            .ok_or_else(|| anyhow!("YOUTUBE_API_KEY not set"))
    }

    pub fn require_admin_token(&self) -> Result<&str> {
        self.admin_token
            .as_deref()
            .ok_or_else(|| anyhow!("PODDB_ADMIN_TOKEN not set"))
    }

    /// Cloud name and upload preset, when both are configured.
    pub fn cloudinary(&self) -> Option<(&str, &str)> {
        Some((
            self.cloudinary_cloud_name.as_deref()?,
            self.cloudinary_upload_preset.as_deref()?,
        ))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub db_path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub settings_seed: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_settings_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeSettings> {
    build_runtime_settings_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeSettings> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let db_path = overrides
        .db_path
        .or_else(|| lookup("PODDB_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));
    let port = match overrides.port {
        Some(port) => port,
        None => match lookup("PODDB_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("PODDB_PORT is not a valid port: {raw}"))?,
            None => DEFAULT_PODDB_PORT,
        },
    };
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("PODDB_HOST"))
        .unwrap_or_else(|| DEFAULT_PODDB_HOST.to_string());
    let settings_seed = overrides
        .settings_seed
        .or_else(|| lookup("PODDB_SETTINGS_SEED").map(PathBuf::from));

    Ok(RuntimeSettings {
        db_path,
        host,
        port,
        youtube_api_key: lookup("YOUTUBE_API_KEY"),
        admin_token: lookup("PODDB_ADMIN_TOKEN"),
        cloudinary_cloud_name: lookup("CLOUDINARY_CLOUD_NAME"),
        cloudinary_upload_preset: lookup("CLOUDINARY_UPLOAD_PRESET"),
        settings_seed,
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok()
}

/// Environment wins over the file; blank values count as unset.
fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    let present = |value: String| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    };
    env_lookup(key)
        .and_then(present)
        .or_else(|| file_vars.get(key).cloned().and_then(present))
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
