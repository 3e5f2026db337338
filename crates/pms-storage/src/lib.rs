//! Destination store boundary + HTTP utilities for PMS.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use pms_core::{
    Condition, DestinationRow, Filter, FilterOperator, FilterValue, PropertyKind, PropertySet,
    PropertyValue,
};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pms-storage";

pub const DEFAULT_NOTION_API_URL: &str = "https://api.notion.com/v1";
pub const NOTION_VERSION: &str = "2022-06-28";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// The workspace API allows an average of three requests per second.
    pub fn notion_default() -> Self {
        Self {
            capacity: 3,
            refill_every: Duration::from_millis(334),
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("request for {url} cannot be retried (streaming body)")]
    NotCloneable { url: String },
}

impl HttpError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            Self::NotCloneable { .. } => None,
        }
    }
}

/// JSON-over-HTTP client with retry/backoff and optional rate limiting.
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            token_bucket,
            backoff: config.backoff,
        })
    }

    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client.request(method, url)
    }

    /// Send `request`, retrying 429/5xx and transient transport failures, and decode the JSON body.
    pub async fn send_json(&self, request: RequestBuilder) -> Result<JsonValue, HttpError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }

            let Some(attempt_request) = request.try_clone() else {
                return Err(HttpError::NotCloneable {
                    url: String::from("<unknown>"),
                });
            };

            match attempt_request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.json::<JsonValue>().await?);
                    }

                    let retry_after = retry_after(resp.headers());
                    let body = resp.text().await.unwrap_or_default();
                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        let delay = retry_after
                            .unwrap_or_else(|| self.backoff.delay_for_attempt(attempt))
                            .min(self.backoff.max_delay);
                        warn!(status = status.as_u16(), url = %final_url, attempt, ?delay, "retrying request");
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    return Err(HttpError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body: truncate(&body, 512),
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retrying request after transport error");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(HttpError::Request(err));
                }
            }
        }

        match last_request_error {
            Some(err) => Err(HttpError::Request(err)),
            None => Err(HttpError::NotCloneable {
                url: String::from("<unknown>"),
            }),
        }
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("malformed store response: {0}")]
    MalformedResponse(String),
    #[error("row {0} not found")]
    NotFound(String),
}

/// The three primitives the reconciliation engine consumes.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    async fn query(&self, table_id: &str, filter: &Filter) -> Result<Vec<DestinationRow>, StoreError>;

    async fn create(
        &self,
        table_id: &str,
        properties: &PropertySet,
    ) -> Result<DestinationRow, StoreError>;

    async fn update(
        &self,
        row_id: &str,
        properties: &PropertySet,
    ) -> Result<DestinationRow, StoreError>;
}

#[derive(Debug, Clone)]
pub struct NotionConfig {
    pub api_url: String,
    pub token: String,
    pub notion_version: String,
    pub http: HttpClientConfig,
}

impl NotionConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            api_url: DEFAULT_NOTION_API_URL.to_string(),
            token: token.into(),
            notion_version: NOTION_VERSION.to_string(),
            http: HttpClientConfig {
                token_bucket: Some(TokenBucketConfig::notion_default()),
                ..Default::default()
            },
        }
    }
}

/// Database-backed store speaking the hosted workspace REST API.
#[derive(Debug)]
pub struct NotionStore {
    http: HttpClient,
    api_url: String,
    token: String,
    notion_version: String,
}

impl NotionStore {
    pub fn new(config: NotionConfig) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpClient::new(config.http)?,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.token,
            notion_version: config.notion_version,
        })
    }

    fn authorized(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, &format!("{}{}", self.api_url, path))
            .bearer_auth(&self.token)
            .header("Notion-Version", &self.notion_version)
    }
}

#[async_trait]
impl DestinationStore for NotionStore {
    async fn query(&self, table_id: &str, filter: &Filter) -> Result<Vec<DestinationRow>, StoreError> {
        let span = info_span!("store_query", table_id);
        async move {
            let mut rows = Vec::new();
            let mut cursor: Option<String> = None;
            loop {
                let mut body = json!({});
                if let Some(filter) = filter_to_json(filter) {
                    body["filter"] = filter;
                }
                if let Some(cursor) = &cursor {
                    body["start_cursor"] = json!(cursor);
                }

                let request = self
                    .authorized(Method::POST, &format!("/databases/{table_id}/query"))
                    .json(&body);
                let page = self.http.send_json(request).await?;
                let results = page
                    .get("results")
                    .and_then(JsonValue::as_array)
                    .ok_or_else(|| {
                        StoreError::MalformedResponse("query response has no results array".into())
                    })?;
                for result in results {
                    rows.push(row_from_json(result)?);
                }

                let has_more = page.get("has_more").and_then(JsonValue::as_bool).unwrap_or(false);
                cursor = page
                    .get("next_cursor")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string);
                if !has_more || cursor.is_none() {
                    break;
                }
            }
            debug!(rows = rows.len(), "store query complete");
            Ok(rows)
        }
        .instrument(span)
        .await
    }

    async fn create(
        &self,
        table_id: &str,
        properties: &PropertySet,
    ) -> Result<DestinationRow, StoreError> {
        let body = json!({
            "parent": { "database_id": table_id },
            "properties": properties_to_json(properties),
        });
        let request = self.authorized(Method::POST, "/pages").json(&body);
        let page = self.http.send_json(request).await?;
        row_from_json(&page)
    }

    async fn update(
        &self,
        row_id: &str,
        properties: &PropertySet,
    ) -> Result<DestinationRow, StoreError> {
        let body = json!({ "properties": properties_to_json(properties) });
        let request = self
            .authorized(Method::PATCH, &format!("/pages/{row_id}"))
            .json(&body);
        let page = self.http.send_json(request).await?;
        row_from_json(&page)
    }
}

fn rich_text_json(content: &str) -> JsonValue {
    json!([{ "type": "text", "text": { "content": content } }])
}

pub fn property_to_json(value: &PropertyValue) -> JsonValue {
    match value {
        PropertyValue::Date { start } => json!({ "date": { "start": start } }),
        PropertyValue::Number(n) => json!({ "number": n }),
        PropertyValue::RichText(text) => json!({ "rich_text": rich_text_json(text) }),
        PropertyValue::Select(name) => json!({ "select": { "name": name } }),
        PropertyValue::Title(text) => json!({ "title": rich_text_json(text) }),
        PropertyValue::Relation(ids) => json!({
            "relation": ids.iter().map(|id| json!({ "id": id })).collect::<Vec<_>>()
        }),
    }
}

pub fn properties_to_json(properties: &PropertySet) -> JsonValue {
    let map = properties
        .iter()
        .map(|(label, value)| (label.clone(), property_to_json(value)))
        .collect::<serde_json::Map<_, _>>();
    JsonValue::Object(map)
}

fn plain_text(fragments: &JsonValue) -> Option<String> {
    let fragments = fragments.as_array()?;
    Some(
        fragments
            .iter()
            .filter_map(|f| {
                f.get("plain_text")
                    .or_else(|| f.get("text").and_then(|t| t.get("content")))
                    .and_then(JsonValue::as_str)
            })
            .collect::<String>(),
    )
}

/// Decode one stored property; kinds this crate does not write are skipped.
pub fn property_from_json(value: &JsonValue) -> Option<PropertyValue> {
    let kind = value.get("type").and_then(JsonValue::as_str)?;
    let body = value.get(kind)?;
    match kind {
        "date" => body
            .get("start")
            .and_then(JsonValue::as_str)
            .map(|start| PropertyValue::Date {
                start: start.to_string(),
            }),
        "number" => Some(PropertyValue::Number(body.as_f64())),
        "rich_text" => plain_text(body).map(PropertyValue::RichText),
        "title" => plain_text(body).map(PropertyValue::Title),
        "select" => body
            .get("name")
            .and_then(JsonValue::as_str)
            .map(|name| PropertyValue::Select(name.to_string())),
        "relation" => body.as_array().map(|items| {
            PropertyValue::Relation(
                items
                    .iter()
                    .filter_map(|item| item.get("id").and_then(JsonValue::as_str))
                    .map(str::to_string)
                    .collect(),
            )
        }),
        _ => None,
    }
}

pub fn row_from_json(page: &JsonValue) -> Result<DestinationRow, StoreError> {
    let id = page
        .get("id")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| StoreError::MalformedResponse("page has no id".into()))?;
    let properties = page
        .get("properties")
        .and_then(JsonValue::as_object)
        .map(|props| {
            props
                .iter()
                .filter_map(|(label, value)| property_from_json(value).map(|v| (label.clone(), v)))
                .collect::<PropertySet>()
        })
        .unwrap_or_default();
    Ok(DestinationRow {
        id: id.to_string(),
        properties,
    })
}

pub fn condition_to_json(condition: &Condition) -> JsonValue {
    let operator = match condition.operator {
        FilterOperator::Equals => "equals",
        FilterOperator::OnOrAfter => "on_or_after",
        FilterOperator::Before => "before",
    };
    let value = match &condition.value {
        FilterValue::Number(n) => json!(n),
        FilterValue::Date(d) => json!(d.format("%Y-%m-%d").to_string()),
        FilterValue::Text(t) => json!(t),
    };
    let mut clause = serde_json::Map::new();
    clause.insert(operator.to_string(), value);
    let mut rendered = serde_json::Map::new();
    rendered.insert("property".to_string(), json!(condition.property));
    rendered.insert(condition.kind.as_str().to_string(), JsonValue::Object(clause));
    JsonValue::Object(rendered)
}

pub fn filter_to_json(filter: &Filter) -> Option<JsonValue> {
    match filter.conditions.as_slice() {
        [] => None,
        [single] => Some(condition_to_json(single)),
        many => Some(json!({ "and": many.iter().map(condition_to_json).collect::<Vec<_>>() })),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCalls {
    pub queries: usize,
    pub creates: usize,
    pub updates: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, Vec<DestinationRow>>,
    calls: StoreCalls,
}

/// In-process store for dry runs; rows keep insertion order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row directly, bypassing call accounting.
    pub async fn seed(&self, table_id: &str, properties: PropertySet) -> String {
        let id = Uuid::new_v4().to_string();
        let mut state = self.state.lock().await;
        state
            .tables
            .entry(table_id.to_string())
            .or_default()
            .push(DestinationRow {
                id: id.clone(),
                properties,
            });
        id
    }

    pub async fn rows(&self, table_id: &str) -> Vec<DestinationRow> {
        let state = self.state.lock().await;
        state.tables.get(table_id).cloned().unwrap_or_default()
    }

    pub async fn calls(&self) -> StoreCalls {
        self.state.lock().await.calls
    }
}

#[async_trait]
impl DestinationStore for MemoryStore {
    async fn query(&self, table_id: &str, filter: &Filter) -> Result<Vec<DestinationRow>, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.queries += 1;
        Ok(state
            .tables
            .get(table_id)
            .map(|rows| {
                rows.iter()
                    .filter(|row| filter.matches(&row.properties))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create(
        &self,
        table_id: &str,
        properties: &PropertySet,
    ) -> Result<DestinationRow, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.creates += 1;
        let row = DestinationRow {
            id: Uuid::new_v4().to_string(),
            properties: properties.clone(),
        };
        state
            .tables
            .entry(table_id.to_string())
            .or_default()
            .push(row.clone());
        Ok(row)
    }

    async fn update(
        &self,
        row_id: &str,
        properties: &PropertySet,
    ) -> Result<DestinationRow, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.updates += 1;
        let row = state
            .tables
            .values_mut()
            .flat_map(|rows| rows.iter_mut())
            .find(|row| row.id == row_id)
            .ok_or_else(|| StoreError::NotFound(row_id.to_string()))?;
        row.properties.merge(properties.clone());
        Ok(row.clone())
    }
}
