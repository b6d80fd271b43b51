#![forbid(unsafe_code)]

//! Operator HTTP service for the podcast sync subsystem.
//!
//! Serves the admin endpoints under `/api` (all behind the bearer token) and
//! runs the in-process scheduler that fires the recurring sync jobs. Manual
//! triggers answer `202 Accepted` with the job id while the run continues in
//! the background; the single-run guard turns a concurrent trigger into 409.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path as AxumPath, Query, Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::{DateTime, Utc};
use clap::Parser;
use poddb_sync::{
    analytics::AnalyticsStats,
    config::{RuntimeOverrides, init_tracing, resolve_runtime_settings},
    error::SyncError,
    quota::{QuotaStatus, UsageDay},
    records::{
        Episode, JobKind, JobStatus, NewPodcast, Podcast, PodcastStatus, SyncErrorRecord, SyncJob,
        TrendingPodcast, day_key,
    },
    scheduler::{DAILY_SYNC, JobInfo, Scheduler, register_default_jobs},
    security::{AdminToken, ensure_not_root},
    settings::{SYNC_ENABLED, SYNC_SCHEDULE_HOUR, SyncSettings},
    sync::{SyncService, SyncStatus, open_service},
    youtube::extract_playlist_id,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;
const DEFAULT_ERROR_LIMIT: i64 = 50;
const DEFAULT_USAGE_DAYS: i64 = 7;
const DEFAULT_TRENDING_DAYS: i64 = 7;
const DEFAULT_TRENDING_LIMIT: i64 = 10;

#[derive(Debug, Parser)]
#[command(name = "sync_server", about = "PodDB sync service with operator API")]
struct ServerArgs {
    /// SQLite database file (PODDB_DB_PATH).
    #[arg(long)]
    db_path: Option<PathBuf>,
    /// Listen address (PODDB_HOST).
    #[arg(long)]
    host: Option<String>,
    /// Listen port (PODDB_PORT).
    #[arg(long)]
    port: Option<u16>,
    /// TOML file with default sync settings (PODDB_SETTINGS_SEED).
    #[arg(long)]
    settings_seed: Option<PathBuf>,
    /// Env file read before the process environment.
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,
}

impl ServerArgs {
    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            db_path: self.db_path.clone(),
            host: self.host.clone(),
            port: self.port,
            settings_seed: self.settings_seed.clone(),
            env_path: Some(self.env_file.clone()),
        }
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/PODDB_HOST")
}

#[derive(Clone)]
struct AppState {
    sync: Arc<SyncService>,
    scheduler: Arc<Scheduler>,
    admin: Arc<AdminToken>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::NotFound(_) => Self::not_found(err.to_string()),
            SyncError::AlreadyRunning => Self::conflict(err.to_string()),
            SyncError::NotEligible(_) | SyncError::Disabled(_) | SyncError::InvalidConfig(_) => {
                Self::bad_request(err.to_string())
            }
            SyncError::Internal(inner) => inner.into(),
            other => {
                error!("request failed: {other}");
                Self::internal(other.to_string())
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let detail = format!("{err:#}");
        if detail.contains("UNIQUE constraint failed") {
            return Self::conflict("a record with the same unique value already exists");
        }
        error!("request failed: {detail}");
        Self::internal(detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = ServerArgs::parse();
    ensure_not_root("sync_server")?;

    let runtime = resolve_runtime_settings(args.overrides())?;
    let admin = AdminToken::new(runtime.require_admin_token()?)?;
    let host = parse_host_arg(&runtime.host)?;

    let sync = Arc::new(
        open_service(&runtime)
            .await
            .context("initializing sync service")?,
    );
    let scheduler = Arc::new(Scheduler::new());
    register_default_jobs(&scheduler, &sync.settings().get());

    let shutdown = CancellationToken::new();
    let scheduler_task = tokio::spawn(scheduler.clone().run(sync.clone(), shutdown.clone()));

    let state = AppState {
        sync,
        scheduler,
        admin: Arc::new(admin),
    };
    let app = router(state);

    let addr = SocketAddr::new(host, runtime.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(%addr, db = %runtime.db_path.display(), "sync API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("running sync API server")?;

    shutdown.cancel();
    if let Err(err) = scheduler_task.await {
        warn!("scheduler task ended abnormally: {err}");
    }
    Ok(())
}

fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/sync/run-full-sync", post(run_full_sync))
        .route("/sync/check-new-episodes", post(check_new_episodes))
        .route("/sync/podcasts/{id}", post(sync_podcast))
        .route("/sync/recalculate-analytics", post(recalculate_analytics))
        .route("/sync/status", get(sync_status))
        .route("/sync/dashboard", get(dashboard))
        .route("/sync/jobs", get(list_jobs))
        .route("/sync/errors", get(list_errors))
        .route("/sync/errors/{id}/resolve", post(resolve_error))
        .route("/sync/config", get(get_config).put(update_config))
        .route("/sync/api-usage", get(api_usage))
        .route("/sync/test-email", post(send_test_email))
        .route("/sync/enable", post(enable_sync))
        .route("/sync/disable", post(disable_sync))
        .route("/sync/scheduler/pause", post(pause_scheduler))
        .route("/sync/scheduler/resume", post(resume_scheduler))
        .route("/podcasts", get(list_podcasts).post(create_podcast))
        .route("/podcasts/{id}", get(get_podcast))
        .route("/podcasts/{id}/status", put(set_podcast_status))
        .route("/podcasts/{id}/episodes", get(list_podcast_episodes))
        .route("/analytics/trending", get(trending))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .nest("/api", api)
        .fallback(not_found_fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(err) = result {
                error!("failed to install Ctrl+C handler: {err}");
            }
        }
        _ = shutdown.cancelled() => {}
    }
    info!("shutting down");
    shutdown.cancel();
}

async fn require_admin(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| state.admin.verify_bearer(value));
    if !authorized {
        return ApiError::unauthorized("missing or invalid admin token").into_response();
    }
    next.run(request).await
}

async fn not_found_fallback() -> ApiError {
    ApiError::not_found("endpoint not found")
}

// ---- sync triggers ----

#[derive(Debug, Serialize)]
struct TriggerResponse {
    job_id: i64,
    job_type: JobKind,
    status: &'static str,
}

/// Claims the run guard, then executes the job on a background task.
async fn spawn_run(
    state: &AppState,
    podcast_id: Option<i64>,
    kind: JobKind,
) -> ApiResult<(StatusCode, Json<TriggerResponse>)> {
    let ticket = match podcast_id {
        Some(id) => state.sync.start_podcast(id).await?,
        None => state.sync.start(kind).await?,
    };
    let response = TriggerResponse {
        job_id: ticket.job_id(),
        job_type: ticket.kind(),
        status: "started",
    };

    let sync = state.sync.clone();
    tokio::spawn(async move {
        if let Err(err) = sync.execute(ticket).await {
            error!("background sync run failed: {err}");
        }
    });
    Ok((StatusCode::ACCEPTED, Json(response)))
}

async fn run_full_sync(
    State(state): State<AppState>,
) -> ApiResult<(StatusCode, Json<TriggerResponse>)> {
    spawn_run(&state, None, JobKind::FullSync).await
}

async fn check_new_episodes(
    State(state): State<AppState>,
) -> ApiResult<(StatusCode, Json<TriggerResponse>)> {
    spawn_run(&state, None, JobKind::NewEpisodesCheck).await
}

async fn sync_podcast(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult<(StatusCode, Json<TriggerResponse>)> {
    spawn_run(&state, Some(id), JobKind::PodcastSync).await
}

async fn recalculate_analytics(State(state): State<AppState>) -> ApiResult<Json<AnalyticsStats>> {
    Ok(Json(state.sync.recalculate_analytics().await?))
}

// ---- status and history ----

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    sync: SyncStatus,
    scheduler_paused: bool,
    jobs: Vec<JobInfo>,
}

async fn sync_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        sync: state.sync.status(),
        scheduler_paused: state.scheduler.is_paused(),
        jobs: state.scheduler.jobs(),
    })
}

#[derive(Debug, Serialize)]
struct DashboardResponse {
    sync_enabled: bool,
    is_running: bool,
    last_job: Option<SyncJob>,
    quota: QuotaStatus,
    unresolved_errors: i64,
    errors_today: i64,
    next_sync: Option<DateTime<Utc>>,
}

async fn dashboard(State(state): State<AppState>) -> ApiResult<Json<DashboardResponse>> {
    let store = state.sync.store();
    let today = day_key(Utc::now());
    Ok(Json(DashboardResponse {
        sync_enabled: state.sync.settings().get().sync_enabled,
        is_running: state.sync.status().is_running,
        last_job: store.last_job().await?,
        quota: state.sync.quota().check_quota().await?,
        unresolved_errors: store.count_errors(false, None).await?,
        errors_today: store.count_errors(false, Some(today)).await?,
        next_sync: state.scheduler.next_run(DAILY_SYNC),
    }))
}

#[derive(Debug, Default, Deserialize)]
struct JobsQuery {
    limit: Option<i64>,
    offset: Option<i64>,
    status: Option<String>,
}

#[derive(Debug, Serialize)]
struct JobsPage {
    jobs: Vec<SyncJob>,
    total: i64,
    limit: i64,
    offset: i64,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobsQuery>,
) -> ApiResult<Json<JobsPage>> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0).max(0);
    let status = match query.status.as_deref().filter(|raw| !raw.is_empty()) {
        Some(raw) => Some(
            JobStatus::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown job status: {raw}")))?,
        ),
        None => None,
    };
    let (jobs, total) = state.sync.store().list_jobs(limit, offset, status).await?;
    Ok(Json(JobsPage {
        jobs,
        total,
        limit,
        offset,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct ErrorsQuery {
    limit: Option<i64>,
    resolved: Option<bool>,
}

async fn list_errors(
    State(state): State<AppState>,
    Query(query): Query<ErrorsQuery>,
) -> ApiResult<Json<Vec<SyncErrorRecord>>> {
    let limit = query.limit.unwrap_or(DEFAULT_ERROR_LIMIT).clamp(1, MAX_PAGE_SIZE);
    let errors = state
        .sync
        .store()
        .list_errors(query.resolved.unwrap_or(false), limit)
        .await?;
    Ok(Json(errors))
}

async fn resolve_error(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult<Json<Value>> {
    if !state.sync.store().resolve_error(id).await? {
        return Err(ApiError::not_found("sync error not found"));
    }
    Ok(Json(serde_json::json!({ "id": id, "resolved": true })))
}

// ---- configuration ----

async fn get_config(State(state): State<AppState>) -> Json<SyncSettings> {
    Json(state.sync.settings().get())
}

#[derive(Debug, Deserialize)]
struct ConfigUpdate {
    key: String,
    value: Value,
}

/// JSON strings are taken as-is; numbers and booleans use their literal form.
fn config_value_text(value: &Value) -> ApiResult<String> {
    match value {
        Value::String(text) => Ok(text.clone()),
        Value::Bool(flag) => Ok(flag.to_string()),
        Value::Number(number) => Ok(number.to_string()),
        other => Err(ApiError::bad_request(format!(
            "unsupported config value: {other}"
        ))),
    }
}

async fn apply_setting(state: &AppState, key: &str, value: &str) -> ApiResult<SyncSettings> {
    let updated = state.sync.settings().update(key, value).await?;
    if key == SYNC_SCHEDULE_HOUR {
        state.scheduler.reschedule_daily_sync(updated.sync_schedule_hour);
    }
    Ok(updated)
}

async fn update_config(
    State(state): State<AppState>,
    Json(payload): Json<ConfigUpdate>,
) -> ApiResult<Json<SyncSettings>> {
    let value = config_value_text(&payload.value)?;
    Ok(Json(apply_setting(&state, payload.key.trim(), &value).await?))
}

async fn enable_sync(State(state): State<AppState>) -> ApiResult<Json<SyncSettings>> {
    Ok(Json(apply_setting(&state, SYNC_ENABLED, "true").await?))
}

async fn disable_sync(State(state): State<AppState>) -> ApiResult<Json<SyncSettings>> {
    Ok(Json(apply_setting(&state, SYNC_ENABLED, "false").await?))
}

#[derive(Debug, Serialize)]
struct SchedulerState {
    paused: bool,
    jobs: Vec<JobInfo>,
}

async fn pause_scheduler(State(state): State<AppState>) -> Json<SchedulerState> {
    state.scheduler.pause();
    Json(SchedulerState {
        paused: true,
        jobs: state.scheduler.jobs(),
    })
}

async fn resume_scheduler(State(state): State<AppState>) -> Json<SchedulerState> {
    state.scheduler.resume();
    Json(SchedulerState {
        paused: false,
        jobs: state.scheduler.jobs(),
    })
}

// ---- quota and notifications ----

#[derive(Debug, Default, Deserialize)]
struct UsageQuery {
    days: Option<i64>,
}

#[derive(Debug, Serialize)]
struct UsageResponse {
    today: QuotaStatus,
    history: Vec<UsageDay>,
}

async fn api_usage(
    State(state): State<AppState>,
    Query(query): Query<UsageQuery>,
) -> ApiResult<Json<UsageResponse>> {
    let days = query.days.unwrap_or(DEFAULT_USAGE_DAYS).clamp(1, 365);
    let quota = state.sync.quota();
    Ok(Json(UsageResponse {
        today: quota.check_quota().await?,
        history: quota.usage_history(days).await?,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct TestEmailRequest {
    recipient: Option<String>,
}

async fn send_test_email(
    State(state): State<AppState>,
    payload: Option<Json<TestEmailRequest>>,
) -> ApiResult<Json<Value>> {
    let requested = payload.and_then(|Json(body)| body.recipient);
    let recipient = requested
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| state.sync.settings().get().admin_email);
    if recipient.is_empty() {
        return Err(ApiError::bad_request(
            "no recipient given and admin_email is not configured",
        ));
    }
    state.sync.notifier().send_test(&recipient).await?;
    Ok(Json(serde_json::json!({ "queued": true, "recipient": recipient })))
}

// ---- podcasts ----

#[derive(Debug, Default, Deserialize)]
struct PodcastsQuery {
    status: Option<String>,
}

async fn list_podcasts(
    State(state): State<AppState>,
    Query(query): Query<PodcastsQuery>,
) -> ApiResult<Json<Vec<Podcast>>> {
    let status = match query.status.as_deref().filter(|raw| !raw.is_empty()) {
        Some(raw) => Some(
            PodcastStatus::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown podcast status: {raw}")))?,
        ),
        None => None,
    };
    Ok(Json(state.sync.store().list_podcasts(status).await?))
}

async fn create_podcast(
    State(state): State<AppState>,
    Json(mut payload): Json<NewPodcast>,
) -> ApiResult<(StatusCode, Json<Podcast>)> {
    payload.title = payload.title.trim().to_string();
    payload.slug = payload.slug.trim().to_string();
    if payload.title.is_empty() || payload.slug.is_empty() {
        return Err(ApiError::bad_request("title and slug are required"));
    }
    payload.youtube_playlist_id = match payload.youtube_playlist_id.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(
            extract_playlist_id(raw)
                .ok_or_else(|| ApiError::bad_request(format!("not a playlist id or URL: {raw}")))?,
        ),
    };

    let podcast = state.sync.store().insert_podcast(&payload).await?;
    info!(podcast_id = podcast.id, slug = podcast.slug.as_str(), "podcast registered");
    Ok((StatusCode::CREATED, Json(podcast)))
}

async fn load_podcast(state: &AppState, id: i64) -> ApiResult<Podcast> {
    state
        .sync
        .store()
        .get_podcast(id)
        .await?
        .ok_or_else(|| ApiError::not_found("podcast not found"))
}

async fn get_podcast(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult<Json<Podcast>> {
    Ok(Json(load_podcast(&state, id).await?))
}

#[derive(Debug, Deserialize)]
struct StatusUpdate {
    status: PodcastStatus,
}

async fn set_podcast_status(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
    Json(payload): Json<StatusUpdate>,
) -> ApiResult<Json<Podcast>> {
    if !state.sync.store().set_podcast_status(id, payload.status).await? {
        return Err(ApiError::not_found("podcast not found"));
    }
    info!(podcast_id = id, status = payload.status.as_str(), "podcast status changed");
    Ok(Json(load_podcast(&state, id).await?))
}

async fn list_podcast_episodes(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult<Json<Vec<Episode>>> {
    load_podcast(&state, id).await?;
    Ok(Json(state.sync.store().list_episodes(id).await?))
}

// ---- analytics ----

#[derive(Debug, Default, Deserialize)]
struct TrendingQuery {
    days: Option<i64>,
    limit: Option<i64>,
}

async fn trending(
    State(state): State<AppState>,
    Query(query): Query<TrendingQuery>,
) -> ApiResult<Json<Vec<TrendingPodcast>>> {
    let days = query.days.unwrap_or(DEFAULT_TRENDING_DAYS).clamp(1, 365);
    let limit = query.limit.unwrap_or(DEFAULT_TRENDING_LIMIT).clamp(1, MAX_PAGE_SIZE);
    Ok(Json(
        state.sync.analytics().trending_podcasts(days, limit).await?,
    ))
}
