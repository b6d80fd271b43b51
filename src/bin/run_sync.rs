#![forbid(unsafe_code)]

//! Runs a single sync job against the configured database and exits.
//!
//! Meant for cron or for operators poking at a stuck installation. The run
//! guard lives in the process, so nothing stops this from overlapping a run
//! of a live `sync_server` on the same database.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use poddb_sync::{
    config::{RuntimeOverrides, init_tracing, resolve_runtime_settings},
    records::JobStatus,
    security::ensure_not_root,
    sync::{SyncReport, open_service},
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "run_sync", about = "Run one PodDB sync job and exit")]
struct Cli {
    /// SQLite database file (PODDB_DB_PATH).
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,
    /// TOML file with default sync settings (PODDB_SETTINGS_SEED).
    #[arg(long, global = true)]
    settings_seed: Option<PathBuf>,
    /// Env file read before the process environment.
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sync every approved podcast, then recompute analytics.
    FullSync,
    /// Look for new episodes on every approved podcast.
    CheckNewEpisodes,
    /// Sync a single podcast by id.
    Podcast { id: i64 },
    /// Recompute today's analytics snapshots.
    Analytics,
    /// Delete analytics older than the retention window.
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    ensure_not_root("run_sync")?;

    let runtime = resolve_runtime_settings(RuntimeOverrides {
        db_path: cli.db_path,
        settings_seed: cli.settings_seed,
        env_path: Some(cli.env_file),
        ..RuntimeOverrides::default()
    })?;
    let service = open_service(&runtime)
        .await
        .context("initializing sync service")?;

    let report = match cli.command {
        Command::FullSync => service.run_full_sync().await?,
        Command::CheckNewEpisodes => service.check_new_episodes().await?,
        Command::Podcast { id } => service.sync_podcast(id).await?,
        Command::Analytics => {
            let stats = service.recalculate_analytics().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            return Ok(ExitCode::SUCCESS);
        }
        Command::Cleanup => {
            let deleted = service.cleanup_old_data().await?;
            println!("deleted {deleted} analytics rows");
            return Ok(ExitCode::SUCCESS);
        }
    };

    print_report(&report)
}

/// Prints the run summary. Only a failed run yields a non-zero exit code;
/// a quota pause is an expected outcome.
fn print_report(report: &SyncReport) -> Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(report)?);
    info!(
        job_id = report.job_id,
        status = report.status.as_str(),
        "sync job finished"
    );
    Ok(match report.status {
        JobStatus::Failed => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use poddb_sync::records::{JobCounts, JobKind};

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_podcast_subcommand_with_global_flags() {
        let cli = Cli::try_parse_from(["run_sync", "podcast", "12", "--db-path", "/tmp/x.db"])
            .unwrap();
        assert!(matches!(cli.command, Command::Podcast { id: 12 }));
        assert_eq!(cli.db_path, Some(PathBuf::from("/tmp/x.db")));
        assert_eq!(cli.env_file, PathBuf::from(".env"));
    }

    #[test]
    fn only_failed_runs_exit_non_zero() {
        let mut report = SyncReport {
            job_id: 1,
            kind: JobKind::FullSync,
            status: JobStatus::Paused,
            counts: JobCounts::default(),
            error_message: Some("API quota limit reached (90%)".into()),
        };
        assert_eq!(print_report(&report).unwrap(), ExitCode::SUCCESS);
        report.status = JobStatus::Failed;
        assert_eq!(print_report(&report).unwrap(), ExitCode::FAILURE);
    }
}
