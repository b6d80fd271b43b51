//! YouTube Data API v3 client and the `SourceClient` seam the sync pipeline
//! talks to.
//!
//! HTTP calls go through a blocking `ureq` agent and run on the blocking pool.
//! Pagination is factored into [`PlaylistPager`], a lazy iterator over any
//! page-fetch function, so the windowing rules can be tested offline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::DateTime;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::records::{CollectionMetadata, SourceItem};

pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/youtube/v3";

/// Largest page the API hands out, and the largest id batch for details.
pub const PAGE_SIZE: usize = 50;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything the sync pipeline needs from the video platform.
#[async_trait]
pub trait SourceClient: Send + Sync {
    async fn collection_metadata(&self, collection_id: &str) -> SyncResult<CollectionMetadata>;

    /// Lists items of a collection, skipping the first `start_index` and
    /// stopping after `max_results` when given. Items come back enriched with
    /// their details.
    async fn list_collection_items(
        &self,
        collection_id: &str,
        max_results: Option<usize>,
        start_index: usize,
    ) -> SyncResult<Vec<SourceItem>>;

    async fn item_details(&self, video_ids: &[String]) -> SyncResult<Vec<SourceItem>>;
}

/// One page returned by a page-fetch function.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_page_token: Option<String>,
}

/// Lazily walks a paginated listing. Pages are fetched only when the iterator
/// runs past the buffered ones, so stopping early never costs extra requests.
pub struct PlaylistPager<T, F> {
    fetch: F,
    buffer: std::vec::IntoIter<T>,
    next_token: Option<String>,
    started: bool,
    finished: bool,
    to_skip: usize,
    remaining: Option<usize>,
}

impl<T, F> PlaylistPager<T, F>
where
    F: FnMut(Option<&str>) -> SyncResult<Page<T>>,
{
    pub fn new(fetch: F, max_results: Option<usize>, start_index: usize) -> Self {
        Self {
            fetch,
            buffer: Vec::new().into_iter(),
            next_token: None,
            started: false,
            finished: false,
            to_skip: start_index,
            remaining: max_results,
        }
    }

    fn fill(&mut self) -> SyncResult<bool> {
        if self.finished || (self.started && self.next_token.is_none()) {
            self.finished = true;
            return Ok(false);
        }
        let page = (self.fetch)(self.next_token.as_deref())?;
        self.started = true;
        self.next_token = page.next_page_token.filter(|token| !token.is_empty());
        self.buffer = page.items.into_iter();
        Ok(true)
    }
}

impl<T, F> Iterator for PlaylistPager<T, F>
where
    F: FnMut(Option<&str>) -> SyncResult<Page<T>>,
{
    type Item = SyncResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == Some(0) {
            return None;
        }
        loop {
            match self.buffer.next() {
                Some(_) if self.to_skip > 0 => self.to_skip -= 1,
                Some(item) => {
                    if let Some(remaining) = self.remaining.as_mut() {
                        *remaining -= 1;
                    }
                    return Some(Ok(item));
                }
                None => match self.fill() {
                    Ok(true) => continue,
                    Ok(false) => return None,
                    Err(err) => {
                        self.finished = true;
                        return Some(Err(err));
                    }
                },
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Thumbnail {
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Thumbnails {
    maxres: Option<Thumbnail>,
    high: Option<Thumbnail>,
    medium: Option<Thumbnail>,
    default: Option<Thumbnail>,
}

impl Thumbnails {
    fn best(&self) -> String {
        [&self.maxres, &self.high, &self.medium, &self.default]
            .into_iter()
            .flatten()
            .find_map(|thumb| thumb.url.clone())
            .unwrap_or_default()
    }

    /// Playlist covers prefer the 480px rendition over maxres.
    fn cover(&self) -> String {
        [&self.high, &self.medium, &self.default]
            .into_iter()
            .flatten()
            .find_map(|thumb| thumb.url.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct PlaylistResource {
    id: Option<String>,
    #[serde(default)]
    snippet: PlaylistSnippet,
    #[serde(rename = "contentDetails", default)]
    content_details: PlaylistContentDetails,
}

#[derive(Debug, Default, Deserialize)]
struct PlaylistSnippet {
    title: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(rename = "channelTitle", default)]
    channel_title: String,
    #[serde(default)]
    thumbnails: Thumbnails,
}

#[derive(Debug, Default, Deserialize)]
struct PlaylistContentDetails {
    #[serde(rename = "itemCount", default)]
    item_count: i64,
}

#[derive(Debug, Deserialize)]
struct PlaylistItemResource {
    #[serde(rename = "contentDetails")]
    content_details: Option<PlaylistItemContentDetails>,
}

#[derive(Debug, Deserialize)]
struct PlaylistItemContentDetails {
    #[serde(rename = "videoId")]
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VideoResource {
    id: Option<String>,
    snippet: Option<VideoSnippet>,
    #[serde(rename = "contentDetails", default)]
    content_details: VideoContentDetails,
    #[serde(default)]
    statistics: VideoStatistics,
}

#[derive(Debug, Deserialize)]
struct VideoSnippet {
    title: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(rename = "publishedAt")]
    published_at: Option<String>,
    #[serde(default)]
    thumbnails: Thumbnails,
}

#[derive(Debug, Default, Deserialize)]
struct VideoContentDetails {
    duration: Option<String>,
}

/// The API reports counters as decimal strings and omits hidden ones.
#[derive(Debug, Default, Deserialize)]
struct VideoStatistics {
    #[serde(rename = "viewCount")]
    view_count: Option<String>,
    #[serde(rename = "likeCount")]
    like_count: Option<String>,
    #[serde(rename = "commentCount")]
    comment_count: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    reason: String,
}

/// Reasons the Data API uses when the project's daily quota is gone.
const QUOTA_REASONS: [&str; 2] = ["quotaExceeded", "dailyLimitExceeded"];

/// Maps a non-2xx response to a [`SyncError`]. Quota refusals become
/// [`SyncError::QuotaExceeded`].
fn status_error(endpoint: &str, code: u16, body: &str) -> SyncError {
    match serde_json::from_str::<ApiErrorEnvelope>(body) {
        Ok(envelope) => {
            let quota = envelope
                .error
                .errors
                .iter()
                .any(|detail| QUOTA_REASONS.contains(&detail.reason.as_str()));
            if quota {
                warn!(endpoint, code, "YouTube API quota exhausted: {}", envelope.error.message);
                return SyncError::upstream_quota();
            }
            SyncError::external(format!("{endpoint} returned {code}: {}", envelope.error.message))
        }
        Err(_) => SyncError::external(format!("{endpoint} returned {code}: {body}")),
    }
}

fn parse_counter(value: Option<&str>) -> i64 {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(0)
}

impl VideoResource {
    fn into_source_item(self) -> SyncResult<SourceItem> {
        let video_id = self
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| SyncError::data("video resource without id"))?;
        let snippet = self
            .snippet
            .ok_or_else(|| SyncError::data(format!("video {video_id} has no snippet")))?;
        let title = snippet
            .title
            .ok_or_else(|| SyncError::data(format!("video {video_id} has no title")))?;
        let published = snippet
            .published_at
            .ok_or_else(|| SyncError::data(format!("video {video_id} has no publish date")))?;
        let published_date = parse_published(&published).ok_or_else(|| {
            SyncError::data(format!("video {video_id} has invalid publish date {published:?}"))
        })?;

        let duration_seconds = match self.content_details.duration.as_deref() {
            Some(raw) => parse_iso_duration(raw).ok_or_else(|| {
                SyncError::data(format!("video {video_id} has invalid duration {raw:?}"))
            })?,
            None => 0,
        };

        Ok(SourceItem {
            title,
            description: snippet.description,
            thumbnail: snippet.thumbnails.best(),
            duration: format_duration(duration_seconds),
            duration_seconds,
            published_date,
            views: parse_counter(self.statistics.view_count.as_deref()),
            likes: parse_counter(self.statistics.like_count.as_deref()),
            comments: parse_counter(self.statistics.comment_count.as_deref()),
            video_id,
        })
    }
}

impl PlaylistResource {
    fn into_metadata(self, requested_id: &str) -> SyncResult<CollectionMetadata> {
        let title = self
            .snippet
            .title
            .ok_or_else(|| SyncError::data(format!("playlist {requested_id} has no title")))?;
        Ok(CollectionMetadata {
            id: self.id.unwrap_or_else(|| requested_id.to_string()),
            title,
            description: self.snippet.description,
            owner_name: self.snippet.channel_title,
            thumbnail: self.snippet.thumbnails.cover(),
            item_count: self.content_details.item_count,
        })
    }
}

/// Parses an ISO-8601 duration such as `PT1H2M3S` or `P1DT5M` into seconds.
pub fn parse_iso_duration(raw: &str) -> Option<i64> {
    let rest = raw.trim().strip_prefix('P')?;
    let mut total = 0_i64;
    let mut number = String::new();
    let mut in_time = false;
    let mut saw_unit = false;

    for ch in rest.chars() {
        match ch {
            '0'..='9' => number.push(ch),
            'T' if !in_time && number.is_empty() => in_time = true,
            unit => {
                let value: i64 = number.parse().ok()?;
                number.clear();
                let multiplier = match (in_time, unit) {
                    (false, 'W') => 7 * 86_400,
                    (false, 'D') => 86_400,
                    (true, 'H') => 3_600,
                    (true, 'M') => 60,
                    (true, 'S') => 1,
                    _ => return None,
                };
                total = total.checked_add(value.checked_mul(multiplier)?)?;
                saw_unit = true;
            }
        }
    }

    if !number.is_empty() || !saw_unit {
        return None;
    }
    Some(total)
}

/// `HH:MM:SS`, or `MM:SS` when under an hour.
pub fn format_duration(total_seconds: i64) -> String {
    let total = total_seconds.max(0);
    let hours = total / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

pub fn parse_published(raw: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|parsed| parsed.timestamp())
}

fn is_id_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '-' || ch == '_'
}

fn query_param<'a>(url: &'a str, name: &str) -> Option<&'a str> {
    let query = url.split_once('?')?.1;
    let query = query.split('#').next().unwrap_or(query);
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name && !value.is_empty()).then_some(value)
    })
}

/// Accepts a playlist URL (anything carrying `list=`) or a bare playlist id.
pub fn extract_playlist_id(input: &str) -> Option<String> {
    let input = input.trim();
    if let Some(id) = query_param(input, "list") {
        return id.chars().all(is_id_char).then(|| id.to_string());
    }
    let bare = input.len() >= 10 && input.chars().all(is_id_char);
    bare.then(|| input.to_string())
}

/// Blocking HTTP client for the YouTube Data API.
#[derive(Clone)]
pub struct YoutubeClient {
    agent: ureq::Agent,
    api_key: Arc<str>,
    base_url: Arc<str>,
}

impl YoutubeClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, DEFAULT_API_BASE)
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();
        Self {
            agent,
            api_key: Arc::from(api_key.into()),
            base_url: Arc::from(base_url.into().trim_end_matches('/')),
        }
    }

    fn get_json<T: DeserializeOwned>(&self, endpoint: &str, query: &[(&str, &str)]) -> SyncResult<T> {
        let url = format!("{}/{endpoint}", self.base_url);
        let mut request = self.agent.get(&url).query("key", &self.api_key);
        for (name, value) in query {
            request = request.query(name, value);
        }
        debug!(endpoint, "calling YouTube API");

        match request.call() {
            Ok(response) => response
                .into_json::<T>()
                .map_err(|err| SyncError::data(format!("decoding {endpoint} response: {err}"))),
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(status_error(endpoint, code, &body))
            }
            Err(ureq::Error::Transport(transport)) => {
                Err(SyncError::external(format!("{endpoint} request failed: {transport}")))
            }
        }
    }

    fn fetch_metadata(&self, playlist_id: &str) -> SyncResult<CollectionMetadata> {
        let response: ListResponse<PlaylistResource> = self.get_json(
            "playlists",
            &[("part", "snippet,contentDetails"), ("id", playlist_id)],
        )?;
        response
            .items
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::not_found(format!("playlist {playlist_id}")))?
            .into_metadata(playlist_id)
    }

    fn fetch_item_page(
        &self,
        playlist_id: &str,
        page_token: Option<&str>,
    ) -> SyncResult<Page<String>> {
        let page_size = PAGE_SIZE.to_string();
        let mut query = vec![
            ("part", "contentDetails"),
            ("playlistId", playlist_id),
            ("maxResults", page_size.as_str()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }
        let response: ListResponse<PlaylistItemResource> =
            self.get_json("playlistItems", &query)?;
        let items = response
            .items
            .into_iter()
            .filter_map(|item| item.content_details.and_then(|details| details.video_id))
            .filter(|id| !id.is_empty())
            .collect();
        Ok(Page {
            items,
            next_page_token: response.next_page_token,
        })
    }

    /// Details for up to [`PAGE_SIZE`] ids per request, returned in the order
    /// the ids were given. Videos the API no longer knows are dropped.
    fn fetch_details(&self, video_ids: &[String]) -> SyncResult<Vec<SourceItem>> {
        let mut out = Vec::with_capacity(video_ids.len());
        for chunk in video_ids.chunks(PAGE_SIZE) {
            let ids = chunk.join(",");
            let response: ListResponse<VideoResource> = self.get_json(
                "videos",
                &[("part", "snippet,contentDetails,statistics"), ("id", ids.as_str())],
            )?;
            let mut by_id = HashMap::with_capacity(response.items.len());
            for resource in response.items {
                let item = resource.into_source_item()?;
                by_id.insert(item.video_id.clone(), item);
            }
            out.extend(chunk.iter().filter_map(|id| by_id.remove(id)));
        }
        Ok(out)
    }

    fn fetch_items(
        &self,
        playlist_id: &str,
        max_results: Option<usize>,
        start_index: usize,
    ) -> SyncResult<Vec<SourceItem>> {
        let pager = PlaylistPager::new(
            |token: Option<&str>| self.fetch_item_page(playlist_id, token),
            max_results,
            start_index,
        );
        let ids = pager.collect::<SyncResult<Vec<String>>>()?;
        self.fetch_details(&ids)
    }
}

async fn run_blocking<T, F>(task: F) -> SyncResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> SyncResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| SyncError::Internal(anyhow!("YouTube request task panicked: {err}")))?
}

#[async_trait]
impl SourceClient for YoutubeClient {
    async fn collection_metadata(&self, collection_id: &str) -> SyncResult<CollectionMetadata> {
        let client = self.clone();
        let id = collection_id.to_string();
        run_blocking(move || client.fetch_metadata(&id)).await
    }

    async fn list_collection_items(
        &self,
        collection_id: &str,
        max_results: Option<usize>,
        start_index: usize,
    ) -> SyncResult<Vec<SourceItem>> {
        let client = self.clone();
        let id = collection_id.to_string();
        run_blocking(move || client.fetch_items(&id, max_results, start_index)).await
    }

    async fn item_details(&self, video_ids: &[String]) -> SyncResult<Vec<SourceItem>> {
        let client = self.clone();
        let ids = video_ids.to_vec();
        run_blocking(move || client.fetch_details(&ids)).await
    }
}
