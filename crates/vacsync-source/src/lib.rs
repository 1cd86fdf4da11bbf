//! Source client contracts + the HTTP and fixture-backed implementations.
//!
//! A source client owns no state between passes: every call to
//! [`SourceClient::fetch_batch`] fetches and normalizes one complete batch.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;
use vacsync_core::{AppConfig, ListingFields, ListingPayload};
use vacsync_storage::{FetchError, HttpClientConfig, HttpFetcher};

pub const CRATE_NAME: &str = "vacsync-source";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchContext {
    pub run_id: Uuid,
}

impl FetchContext {
    pub fn new(run_id: Uuid) -> Self {
        Self { run_id }
    }
}

#[derive(Debug, Error)]
pub enum SourceFetchError {
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("malformed listing payload from {origin}: {source}")]
    Malformed {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("reading fixture {}: {source}", .path.display())]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Message(String),
}

#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Where batches come from, for logs.
    fn origin(&self) -> &str;

    async fn fetch_batch(&self, ctx: &FetchContext) -> Result<Vec<ListingPayload>, SourceFetchError>;
}

#[derive(Debug, Clone, Default, Deserialize)]
struct NamedRef {
    #[serde(default)]
    name: Option<String>,
}

/// One item as the upstream API returns it. Nested `{name}` objects and flat
/// `*_name` columns are both accepted.
#[derive(Debug, Clone, Default, Deserialize)]
struct RawListing {
    #[serde(default, alias = "id")]
    external_id: Option<i64>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    timetable_mode: Option<NamedRef>,
    #[serde(default)]
    timetable_mode_name: Option<String>,
    #[serde(default)]
    tag: Option<NamedRef>,
    #[serde(default)]
    tag_name: Option<String>,
    #[serde(default)]
    city: Option<NamedRef>,
    #[serde(default)]
    city_name: Option<String>,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    is_remote_available: Option<bool>,
    #[serde(default)]
    is_hot: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawBatch {
    Items(Vec<RawListing>),
    Envelope { items: Vec<RawListing> },
}

fn text_or_none(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn nested_or_flat(nested: Option<NamedRef>, flat: Option<String>) -> Option<String> {
    text_or_none(nested.and_then(|n| n.name)).or_else(|| text_or_none(flat))
}

impl RawListing {
    fn into_payload(self) -> ListingPayload {
        ListingPayload {
            external_id: self.external_id,
            fields: ListingFields {
                title: text_or_none(self.title).unwrap_or_default(),
                timetable_mode_name: nested_or_flat(self.timetable_mode, self.timetable_mode_name),
                tag_name: nested_or_flat(self.tag, self.tag_name),
                city_name: nested_or_flat(self.city, self.city_name),
                published_at: self.published_at,
                is_remote_available: self.is_remote_available.unwrap_or(false),
                is_hot: self.is_hot.unwrap_or(false),
            },
        }
    }
}

/// Decodes a response body (bare array or `{"items": [...]}`) into normalized payloads, in order.
pub fn parse_batch(bytes: &[u8]) -> Result<Vec<ListingPayload>, serde_json::Error> {
    let raw: RawBatch = serde_json::from_slice(bytes)?;
    let items = match raw {
        RawBatch::Items(items) | RawBatch::Envelope { items } => items,
    };
    Ok(items.into_iter().map(RawListing::into_payload).collect())
}

/// Fetches the batch from the configured upstream URL.
#[derive(Debug, Clone)]
pub struct HttpSourceClient {
    http: HttpFetcher,
    url: String,
}

impl HttpSourceClient {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }

    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout(),
            user_agent: Some(config.http_user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self::new(http, config.external_vacancies_api_url.clone()))
    }
}

#[async_trait]
impl SourceClient for HttpSourceClient {
    fn origin(&self) -> &str {
        &self.url
    }

    async fn fetch_batch(&self, ctx: &FetchContext) -> Result<Vec<ListingPayload>, SourceFetchError> {
        let resp = self.http.fetch_bytes(ctx.run_id, &self.url).await?;
        let batch = parse_batch(&resp.body).map_err(|source| SourceFetchError::Malformed {
            origin: resp.final_url.clone(),
            source,
        })?;
        debug!(run_id = %ctx.run_id, items = batch.len(), url = %resp.final_url, "decoded listing batch");
        Ok(batch)
    }
}

/// Reads the batch from a JSON file with the upstream response shape.
#[derive(Debug, Clone)]
pub struct FixtureSourceClient {
    path: PathBuf,
    origin: String,
}

impl FixtureSourceClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let origin = format!("file://{}", path.display());
        Self { path, origin }
    }
}

#[async_trait]
impl SourceClient for FixtureSourceClient {
    fn origin(&self) -> &str {
        &self.origin
    }

    async fn fetch_batch(&self, ctx: &FetchContext) -> Result<Vec<ListingPayload>, SourceFetchError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| SourceFetchError::Fixture {
                path: self.path.clone(),
                source,
            })?;
        let batch = parse_batch(&bytes).map_err(|source| SourceFetchError::Malformed {
            origin: self.origin.clone(),
            source,
        })?;
        debug!(run_id = %ctx.run_id, items = batch.len(), path = %self.path.display(), "loaded fixture batch");
        Ok(batch)
    }
}

/// Serves a fixed batch (or a fixed failure) from memory.
#[derive(Debug)]
pub struct StaticSourceClient {
    batch: Mutex<Result<Vec<ListingPayload>, String>>,
    fetches: AtomicUsize,
}

impl StaticSourceClient {
    pub fn new(batch: Vec<ListingPayload>) -> Self {
        Self {
            batch: Mutex::new(Ok(batch)),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            batch: Mutex::new(Err(message.into())),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn set_batch(&self, batch: Vec<ListingPayload>) {
        *self.batch.lock().unwrap_or_else(|p| p.into_inner()) = Ok(batch);
    }

    pub fn set_failure(&self, message: impl Into<String>) {
        *self.batch.lock().unwrap_or_else(|p| p.into_inner()) = Err(message.into());
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceClient for StaticSourceClient {
    fn origin(&self) -> &str {
        "static"
    }

    async fn fetch_batch(&self, _ctx: &FetchContext) -> Result<Vec<ListingPayload>, SourceFetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.batch
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .map_err(SourceFetchError::Message)
    }
}
