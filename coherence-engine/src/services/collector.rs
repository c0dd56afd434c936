//! Multi-source HTTP collector
//!
//! Polls every (source, endpoint) pair on its own timer and forwards the
//! extracted items to the scoring pipeline.
//!
//! # Scheduling
//! - One task per (source, endpoint); a slow endpoint never delays another
//! - Within one pair, the next tick is awaited only after the current fetch
//!   finishes, so fetches for a pair are strictly sequential
//! - Missed ticks are skipped rather than bursted
//!
//! # Fetching
//! - A shared semaphore bounds concurrent requests across all sources
//! - Optional per-source `governor` quota (`requests_per_minute`)
//! - Failed requests retry with linear delay `retry_base_delay_ms × attempt`
//! - HTTP 429 surfaces `RateLimited` and is not retried in that tick; a
//!   `Retry-After` pauses that pair until it elapses
//! - The whole fetch runs under the resilience breaker `fetch:<source>:<path>`;
//!   while that breaker is open the tick yields no items

use crate::utils::resilience::{ResilienceError, ResilienceRegistry, Retryable};
use chrono::{DateTime, Utc};
use coherence_common::events::{CoherenceEvent, EventBus};
use coherence_common::DataPoint;
use governor::{Quota, RateLimiter};
use reqwest::header::RETRY_AFTER;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Response fields that commonly wrap the item array, checked in order
const ARRAY_FIELDS: &[&str] = &[
    "data", "items", "results", "entries", "articles", "posts", "records", "children",
];

/// Item fields that carry a natural identifier, checked in order
const ID_FIELDS: &[&str] = &["id", "uuid", "guid", "key"];

/// Upper bound on a honoured `Retry-After`
const MAX_RETRY_AFTER_SECS: u64 = 3_600;

type DirectRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Collector errors
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("Invalid source descriptor: {0}")]
    InvalidSource(String),

    #[error("Source already registered: {0}")]
    DuplicateSource(String),

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("HTTP client error: {0}")]
    Client(String),
}

/// HTTP method for an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

/// Maps a parsed response body to content items
#[derive(Clone)]
pub struct DataExtractor(Arc<dyn Fn(&Value) -> Vec<Value> + Send + Sync>);

impl DataExtractor {
    pub fn new(f: impl Fn(&Value) -> Vec<Value> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn extract(&self, body: &Value) -> Vec<Value> {
        (self.0)(body)
    }
}

impl fmt::Debug for DataExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataExtractor(..)")
    }
}

/// One polled endpoint of a source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Path appended to the source base URL
    pub path: String,
    #[serde(default)]
    pub method: HttpMethod,
    /// Query parameters (GET) or JSON body (POST)
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: f64,
    /// Custom body-to-items mapping; heuristic unwrapping when absent
    #[serde(skip)]
    pub data_extractor: Option<DataExtractor>,
}

fn default_refresh_interval_secs() -> f64 {
    300.0
}

impl EndpointConfig {
    pub fn get(path: impl Into<String>, refresh_interval_secs: f64) -> Self {
        Self {
            path: path.into(),
            method: HttpMethod::Get,
            params: BTreeMap::new(),
            headers: BTreeMap::new(),
            refresh_interval_secs,
            data_extractor: None,
        }
    }

    pub fn with_extractor(mut self, extractor: DataExtractor) -> Self {
        self.data_extractor = Some(extractor);
        self
    }

    fn refresh_interval(&self) -> Duration {
        Duration::from_secs_f64(self.refresh_interval_secs)
    }
}

/// Source authentication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceAuth {
    Bearer { token: String },
    ApiKey { header: String, value: String },
    Basic {
        username: String,
        #[serde(default)]
        password: Option<String>,
    },
}

/// Per-source request quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    pub requests_per_minute: u32,
}

/// Static description of a polled source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub base_url: String,
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub auth: Option<SourceAuth>,
    #[serde(default)]
    pub rate_limits: Option<RateLimits>,
}

impl SourceDescriptor {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>, endpoints: Vec<EndpointConfig>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            base_url: base_url.into(),
            endpoints,
            auth: None,
            rate_limits: None,
        }
    }

    /// Boundary validation; malformed descriptors are rejected, never coerced
    pub fn validate(&self) -> Result<(), CollectorError> {
        if self.id.trim().is_empty() {
            return Err(CollectorError::InvalidSource("source id is empty".to_string()));
        }
        let url = Url::parse(&self.base_url).map_err(|e| {
            CollectorError::InvalidSource(format!("{}: bad base_url {:?}: {}", self.id, self.base_url, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CollectorError::InvalidSource(format!(
                "{}: unsupported scheme {}",
                self.id,
                url.scheme()
            )));
        }
        if self.endpoints.is_empty() {
            return Err(CollectorError::InvalidSource(format!("{}: no endpoints", self.id)));
        }
        for endpoint in &self.endpoints {
            if endpoint.path.trim().is_empty() {
                return Err(CollectorError::InvalidSource(format!("{}: empty endpoint path", self.id)));
            }
            if !endpoint.refresh_interval_secs.is_finite() || endpoint.refresh_interval_secs <= 0.0 {
                return Err(CollectorError::InvalidSource(format!(
                    "{}{}: refresh_interval_secs must be positive",
                    self.id, endpoint.path
                )));
            }
        }
        if let Some(limits) = &self.rate_limits {
            if limits.requests_per_minute == 0 {
                return Err(CollectorError::InvalidSource(format!(
                    "{}: requests_per_minute must be at least 1",
                    self.id
                )));
            }
        }
        Ok(())
    }

    fn endpoint_url(&self, endpoint: &EndpointConfig) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            endpoint.path.trim_start_matches('/')
        )
    }
}

/// Collector tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Requests in flight across all sources
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Retries after the first failed attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Capacity of the collector → pipeline channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_max_concurrent() -> usize {
    5
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1_000
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_user_agent() -> String {
    format!("coherence-engine/{}", env!("CARGO_PKG_VERSION"))
}
fn default_channel_capacity() -> usize {
    1_000
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            user_agent: default_user_agent(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl CollectorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent == 0 {
            return Err("collector.max_concurrent must be at least 1".to_string());
        }
        if self.request_timeout_ms == 0 {
            return Err("collector.request_timeout_ms must be positive".to_string());
        }
        if self.channel_capacity == 0 {
            return Err("collector.channel_capacity must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Per-source fetch status, reported in health snapshots
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceStatus {
    pub source_id: String,
    /// Timers are running
    pub active: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub items_collected: u64,
}

impl SourceStatus {
    /// Last fetch failed
    pub fn is_failed(&self) -> bool {
        self.consecutive_failures > 0
    }
}

/// Aggregate source counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCounts {
    pub total: usize,
    pub active: usize,
    pub failed: usize,
}

/// Outcome of one fetch as seen by the breaker
#[derive(Debug)]
enum FetchError {
    RateLimited { retry_after_secs: Option<u64> },
    Exhausted { attempts: u32, message: String },
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::RateLimited { .. } => f.write_str("rate limited (HTTP 429)"),
            FetchError::Exhausted { attempts, message } => {
                write!(f, "{} (after {} attempt(s))", message, attempts)
            }
        }
    }
}

impl Retryable for FetchError {
    // retries already happened inside the fetch
    fn is_retryable(&self) -> bool {
        false
    }

    // rate limiting is not a fault
    fn counts_as_failure(&self) -> bool {
        matches!(self, FetchError::Exhausted { .. })
    }
}

/// Outcome of a single HTTP attempt
enum AttemptError {
    RateLimited(Option<u64>),
    Failed(String),
}

struct SourceEntry {
    descriptor: Arc<SourceDescriptor>,
    rate_limiter: Option<Arc<DirectRateLimiter>>,
    status: Arc<Mutex<SourceStatus>>,
    token: Option<CancellationToken>,
}

/// State shared by every endpoint task
struct FetchShared {
    config: CollectorConfig,
    client: reqwest::Client,
    resilience: Arc<ResilienceRegistry>,
    event_bus: EventBus,
    output: mpsc::Sender<DataPoint>,
    limiter: Semaphore,
}

/// Polls registered sources and forwards items to the pipeline
pub struct Collector {
    shared: Arc<FetchShared>,
    sources: Mutex<HashMap<String, SourceEntry>>,
    running: Mutex<Option<CancellationToken>>,
}

fn lock_status(status: &Mutex<SourceStatus>) -> MutexGuard<'_, SourceStatus> {
    status.lock().unwrap_or_else(|e| e.into_inner())
}

impl Collector {
    pub fn new(
        config: CollectorConfig,
        resilience: Arc<ResilienceRegistry>,
        event_bus: EventBus,
        output: mpsc::Sender<DataPoint>,
    ) -> Result<Self, CollectorError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| CollectorError::Client(e.to_string()))?;

        let limiter = Semaphore::new(config.max_concurrent.max(1));
        Ok(Self {
            shared: Arc::new(FetchShared {
                config,
                client,
                resilience,
                event_bus,
                output,
                limiter,
            }),
            sources: Mutex::new(HashMap::new()),
            running: Mutex::new(None),
        })
    }

    fn sources(&self) -> MutexGuard<'_, HashMap<String, SourceEntry>> {
        self.sources.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn running(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a source; its timers start immediately if the collector is running
    pub fn add_source(&self, descriptor: SourceDescriptor) -> Result<(), CollectorError> {
        descriptor.validate()?;

        // held across insert-and-spawn so a concurrent start() sees the entry
        let running = self.running();
        let mut sources = self.sources();
        if sources.contains_key(&descriptor.id) {
            return Err(CollectorError::DuplicateSource(descriptor.id));
        }

        let rate_limiter = match &descriptor.rate_limits {
            Some(limits) => {
                let per_minute = NonZeroU32::new(limits.requests_per_minute).ok_or_else(|| {
                    CollectorError::InvalidSource(format!("{}: zero rate limit", descriptor.id))
                })?;
                Some(Arc::new(RateLimiter::direct(Quota::per_minute(per_minute))))
            }
            None => None,
        };

        let id = descriptor.id.clone();
        let mut entry = SourceEntry {
            descriptor: Arc::new(descriptor),
            rate_limiter,
            status: Arc::new(Mutex::new(SourceStatus {
                source_id: id.clone(),
                ..Default::default()
            })),
            token: None,
        };
        if let Some(root) = running.as_ref() {
            self.spawn_source(&mut entry, root);
        }

        tracing::info!(
            source_id = %id,
            endpoints = entry.descriptor.endpoints.len(),
            "Source registered"
        );
        sources.insert(id, entry);
        Ok(())
    }

    /// Unregister a source, cancelling only its timers
    pub fn remove_source(&self, source_id: &str) -> Result<(), CollectorError> {
        let entry = self
            .sources()
            .remove(source_id)
            .ok_or_else(|| CollectorError::UnknownSource(source_id.to_string()))?;
        if let Some(token) = entry.token {
            token.cancel();
        }
        tracing::info!(source_id, "Source removed");
        Ok(())
    }

    /// Start polling every registered source; no-op when already running
    pub fn start(&self) {
        let mut running = self.running();
        if running.is_some() {
            tracing::debug!("Collector already running");
            return;
        }

        let root = CancellationToken::new();
        let mut sources = self.sources();
        for entry in sources.values_mut() {
            self.spawn_source(entry, &root);
        }
        tracing::info!(sources = sources.len(), "Collector started");
        *running = Some(root);
    }

    /// Cancel every timer; in-flight fetches are abandoned, not awaited
    pub fn stop(&self) {
        let Some(root) = self.running().take() else {
            return;
        };
        root.cancel();
        for entry in self.sources().values_mut() {
            entry.token = None;
            lock_status(&entry.status).active = false;
        }
        tracing::info!("Collector stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    pub fn source_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sources().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Status of every source, sorted by id
    pub fn source_statuses(&self) -> Vec<SourceStatus> {
        let mut statuses: Vec<SourceStatus> = self
            .sources()
            .values()
            .map(|entry| lock_status(&entry.status).clone())
            .collect();
        statuses.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        statuses
    }

    pub fn source_counts(&self) -> SourceCounts {
        let statuses = self.source_statuses();
        SourceCounts {
            total: statuses.len(),
            active: statuses.iter().filter(|s| s.active).count(),
            failed: statuses.iter().filter(|s| s.is_failed()).count(),
        }
    }

    fn spawn_source(&self, entry: &mut SourceEntry, root: &CancellationToken) {
        let token = root.child_token();
        for index in 0..entry.descriptor.endpoints.len() {
            let task = EndpointTask {
                shared: Arc::clone(&self.shared),
                descriptor: Arc::clone(&entry.descriptor),
                endpoint_index: index,
                rate_limiter: entry.rate_limiter.clone(),
                status: Arc::clone(&entry.status),
                token: token.clone(),
            };
            tokio::spawn(task.run());
        }
        lock_status(&entry.status).active = true;
        entry.token = Some(token);
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        if let Some(root) = self.running().take() {
            root.cancel();
        }
    }
}

/// Poll loop for one (source, endpoint) pair
struct EndpointTask {
    shared: Arc<FetchShared>,
    descriptor: Arc<SourceDescriptor>,
    endpoint_index: usize,
    rate_limiter: Option<Arc<DirectRateLimiter>>,
    status: Arc<Mutex<SourceStatus>>,
    token: CancellationToken,
}

impl EndpointTask {
    fn endpoint(&self) -> &EndpointConfig {
        &self.descriptor.endpoints[self.endpoint_index]
    }

    async fn run(self) {
        let mut ticker = tokio::time::interval(self.endpoint().refresh_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let backoff = tokio::select! {
                _ = self.token.cancelled() => break,
                backoff = self.collect_once() => backoff,
            };

            // honour Retry-After: no request for this pair until it elapses
            if let Some(backoff) = backoff {
                tokio::select! {
                    _ = self.token.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                ticker.reset_immediately();
            }
        }

        tracing::debug!(
            source_id = %self.descriptor.id,
            endpoint = %self.endpoint().path,
            "Endpoint poller stopped"
        );
    }

    /// One tick; returns how long the source asked us to back off, if at all
    async fn collect_once(&self) -> Option<Duration> {
        let endpoint = self.endpoint();
        let operation = format!("fetch:{}:{}", self.descriptor.id, endpoint.path);

        let result = self
            .shared
            .resilience
            .execute_with_attempts(&operation, 1, || self.fetch_with_retry())
            .await;

        match result {
            Ok(items) => {
                self.publish(items).await;
                None
            }
            Err(ResilienceError::CircuitOpen { .. }) => {
                tracing::debug!(source_id = %self.descriptor.id, endpoint = %endpoint.path, "Circuit open, skipping fetch");
                None
            }
            Err(ResilienceError::Failed(FetchError::RateLimited { retry_after_secs })) => {
                tracing::warn!(
                    source_id = %self.descriptor.id,
                    endpoint = %endpoint.path,
                    retry_after_secs,
                    "Source rate limited request"
                );
                self.record_failure("rate limited (HTTP 429)".to_string());
                self.shared.event_bus.emit_lossy(CoherenceEvent::RateLimited {
                    source_id: self.descriptor.id.clone(),
                    endpoint: endpoint.path.clone(),
                    retry_after_secs,
                    timestamp: Utc::now(),
                });
                retry_after_secs
                    .filter(|secs| *secs > 0)
                    .map(|secs| Duration::from_secs(secs.min(MAX_RETRY_AFTER_SECS)))
            }
            Err(ResilienceError::Failed(FetchError::Exhausted { attempts, message })) => {
                self.record_failure(message.clone());
                self.shared.event_bus.emit_lossy(CoherenceEvent::CollectionError {
                    source_id: self.descriptor.id.clone(),
                    endpoint: endpoint.path.clone(),
                    error: message,
                    attempts,
                    timestamp: Utc::now(),
                });
                None
            }
        }
    }

    async fn fetch_with_retry(&self) -> Result<Vec<DataPoint>, FetchError> {
        let config = &self.shared.config;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.fetch_once().await {
                Ok(body) => return Ok(self.to_points(&body)),
                Err(AttemptError::RateLimited(retry_after_secs)) => {
                    return Err(FetchError::RateLimited { retry_after_secs });
                }
                Err(AttemptError::Failed(message)) => {
                    if attempt > config.max_retries {
                        tracing::error!(
                            source_id = %self.descriptor.id,
                            endpoint = %self.endpoint().path,
                            attempt,
                            error = %message,
                            "Fetch failed: retries exhausted"
                        );
                        return Err(FetchError::Exhausted {
                            attempts: attempt,
                            message,
                        });
                    }

                    let delay_ms = config.retry_base_delay_ms.saturating_mul(attempt as u64);
                    tracing::warn!(
                        source_id = %self.descriptor.id,
                        endpoint = %self.endpoint().path,
                        attempt,
                        delay_ms,
                        error = %message,
                        "Fetch failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }

    async fn fetch_once(&self) -> Result<Value, AttemptError> {
        // wait out the source quota before taking a shared fetch slot
        if let Some(limiter) = &self.rate_limiter {
            limiter.until_ready().await;
        }

        let _permit = self
            .shared
            .limiter
            .acquire()
            .await
            .map_err(|e| AttemptError::Failed(format!("fetch limiter closed: {}", e)))?;

        let endpoint = self.endpoint();
        let url = self.descriptor.endpoint_url(endpoint);
        let mut request = match endpoint.method {
            HttpMethod::Get => {
                let query: Vec<(String, String)> = endpoint
                    .params
                    .iter()
                    .map(|(k, v)| (k.clone(), param_string(v)))
                    .collect();
                self.shared.client.get(&url).query(&query)
            }
            HttpMethod::Post => self.shared.client.post(&url).json(&endpoint.params),
        };
        for (name, value) in &endpoint.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request = match &self.descriptor.auth {
            Some(SourceAuth::Bearer { token }) => request.bearer_auth(token),
            Some(SourceAuth::ApiKey { header, value }) => request.header(header.as_str(), value.as_str()),
            Some(SourceAuth::Basic { username, password }) => request.basic_auth(username, password.as_ref()),
            None => request,
        };

        let started = tokio::time::Instant::now();
        let response = request
            .send()
            .await
            .map_err(|e| AttemptError::Failed(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            return Err(AttemptError::RateLimited(retry_after));
        }
        if !status.is_success() {
            return Err(AttemptError::Failed(format!("{} returned HTTP {}", url, status)));
        }

        let text = response
            .text()
            .await
            .map_err(|e| AttemptError::Failed(format!("reading body from {} failed: {}", url, e)))?;

        tracing::debug!(
            source_id = %self.descriptor.id,
            url = %url,
            bytes = text.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Fetched endpoint"
        );

        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }

    fn to_points(&self, body: &Value) -> Vec<DataPoint> {
        let endpoint = self.endpoint();
        let items = match &endpoint.data_extractor {
            Some(extractor) => extractor.extract(body),
            None => extract_items(body),
        };

        let now = Utc::now();
        items
            .into_iter()
            .map(|item| {
                let id = item_id(&self.descriptor.id, &item);
                DataPoint::new(id, self.descriptor.id.clone(), now, item)
                    .with_metadata("endpoint", Value::String(endpoint.path.clone()))
                    .with_metadata("source_name", Value::String(self.descriptor.name.clone()))
            })
            .collect()
    }

    async fn publish(&self, points: Vec<DataPoint>) {
        let count = points.len();
        for point in points {
            self.shared
                .event_bus
                .emit_lossy(CoherenceEvent::Data { point: point.clone() });
            if self.shared.output.send(point).await.is_err() {
                tracing::debug!(source_id = %self.descriptor.id, "Pipeline closed, dropping items");
                break;
            }
        }

        let mut status = lock_status(&self.status);
        status.last_success = Some(Utc::now());
        status.last_error = None;
        status.consecutive_failures = 0;
        status.items_collected += count as u64;
    }

    fn record_failure(&self, message: String) {
        let mut status = lock_status(&self.status);
        status.last_error = Some(message);
        status.consecutive_failures = status.consecutive_failures.saturating_add(1);
    }
}

fn param_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Heuristically unwrap a response body into content items
///
/// A top-level array is used as-is; otherwise the first array found under a
/// common wrapper field (or `data.children`) is used; otherwise the body itself
/// is the single item. Empty bodies yield nothing.
pub fn extract_items(body: &Value) -> Vec<Value> {
    match body {
        Value::Array(items) => items.clone(),
        Value::Object(map) => {
            for field in ARRAY_FIELDS {
                if let Some(Value::Array(items)) = map.get(*field) {
                    return items.clone();
                }
            }
            if let Some(Value::Array(items)) = body.pointer("/data/children") {
                return items.clone();
            }
            vec![body.clone()]
        }
        Value::String(s) if s.trim().is_empty() => Vec::new(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

/// Natural id prefixed with the source id, or a fresh UUID
pub fn item_id(source_id: &str, item: &Value) -> String {
    let natural = item.as_object().and_then(|map| {
        ID_FIELDS.iter().find_map(|field| match map.get(*field) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
    });
    match natural {
        Some(id) => format!("{}:{}", source_id, id),
        None => Uuid::new_v4().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ResilienceConfig;
    use serde_json::json;

    fn collector() -> (Collector, mpsc::Receiver<DataPoint>) {
        let (tx, rx) = mpsc::channel(16);
        let collector = Collector::new(
            CollectorConfig::default(),
            Arc::new(ResilienceRegistry::new(ResilienceConfig::default())),
            EventBus::new(16),
            tx,
        )
        .unwrap();
        (collector, rx)
    }

    #[test]
    fn test_extract_top_level_array() {
        let items = extract_items(&json!([{"id": 1}, {"id": 2}]));
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_extract_wrapper_fields() {
        assert_eq!(extract_items(&json!({"results": [1, 2, 3]})).len(), 3);
        assert_eq!(extract_items(&json!({"meta": {}, "articles": [{"title": "a"}]})).len(), 1);

        let reddit = json!({"kind": "Listing", "data": {"children": [{"id": "x"}, {"id": "y"}]}});
        assert_eq!(extract_items(&reddit).len(), 2);
    }

    #[test]
    fn test_extract_single_object_and_empty() {
        let body = json!({"title": "only one"});
        assert_eq!(extract_items(&body), vec![body.clone()]);
        assert!(extract_items(&Value::Null).is_empty());
        assert!(extract_items(&json!("  ")).is_empty());
        assert_eq!(extract_items(&json!("plain text")).len(), 1);
    }

    #[test]
    fn test_item_id_prefers_natural_id() {
        assert_eq!(item_id("news", &json!({"id": 42})), "news:42");
        assert_eq!(item_id("news", &json!({"guid": "abc"})), "news:abc");

        let generated = item_id("news", &json!({"title": "no id"}));
        assert!(Uuid::parse_str(&generated).is_ok());
    }

    #[test]
    fn test_descriptor_validation() {
        let ok = SourceDescriptor::new("news", "http://localhost:8080", vec![EndpointConfig::get("/top", 60.0)]);
        assert!(ok.validate().is_ok());

        let mut no_endpoints = ok.clone();
        no_endpoints.endpoints.clear();
        assert!(matches!(no_endpoints.validate(), Err(CollectorError::InvalidSource(_))));

        let bad_url = SourceDescriptor::new("news", "not a url", vec![EndpointConfig::get("/top", 60.0)]);
        assert!(bad_url.validate().is_err());

        let zero_interval = SourceDescriptor::new("news", "http://localhost", vec![EndpointConfig::get("/top", 0.0)]);
        assert!(zero_interval.validate().is_err());

        let mut zero_quota = ok.clone();
        zero_quota.rate_limits = Some(RateLimits { requests_per_minute: 0 });
        assert!(zero_quota.validate().is_err());
    }

    #[test]
    fn test_endpoint_url_joins_slashes() {
        let source = SourceDescriptor::new("s", "http://host/api/", vec![EndpointConfig::get("/v1/items", 1.0)]);
        assert_eq!(source.endpoint_url(&source.endpoints[0]), "http://host/api/v1/items");
    }

    #[test]
    fn test_descriptor_from_toml() {
        let source: SourceDescriptor = toml::from_str(
            r#"
            id = "hn"
            base_url = "https://example.com"
            auth = { type = "bearer", token = "t" }
            rate_limits = { requests_per_minute = 30 }

            [[endpoints]]
            path = "/top"
            refresh_interval_secs = 30.0

            [[endpoints]]
            path = "/search"
            method = "POST"
            params = { q = "rust" }
            "#,
        )
        .unwrap();

        assert_eq!(source.endpoints.len(), 2);
        assert_eq!(source.endpoints[1].method, HttpMethod::Post);
        assert_eq!(source.endpoints[1].refresh_interval_secs, 300.0);
        assert_eq!(source.auth, Some(SourceAuth::Bearer { token: "t".to_string() }));
    }

    #[tokio::test]
    async fn test_add_remove_source() {
        let (collector, _rx) = collector();
        let source = SourceDescriptor::new("news", "http://127.0.0.1:9", vec![EndpointConfig::get("/top", 60.0)]);

        collector.add_source(source.clone()).unwrap();
        assert!(matches!(
            collector.add_source(source),
            Err(CollectorError::DuplicateSource(_))
        ));
        assert_eq!(collector.source_counts().total, 1);

        collector.remove_source("news").unwrap();
        assert!(matches!(
            collector.remove_source("news"),
            Err(CollectorError::UnknownSource(_))
        ));
        assert_eq!(collector.source_counts().total, 0);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_deactivates() {
        let (collector, _rx) = collector();
        collector
            .add_source(SourceDescriptor::new("a", "http://127.0.0.1:9", vec![EndpointConfig::get("/x", 3600.0)]))
            .unwrap();

        collector.start();
        collector.start();
        assert!(collector.is_running());
        assert_eq!(collector.source_counts().active, 1);

        collector.stop();
        collector.stop();
        assert!(!collector.is_running());
        assert_eq!(collector.source_counts().active, 0);
    }
}
