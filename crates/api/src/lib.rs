//! Orb public API façade.
//!
//! This crate defines the trait frontends (CLI, list services, pollers) depend on
//! to reach the fleet REST API, plus an HTTP implementation and an in-memory mock.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use orb_core::{Entity, EntityKind, Page, PageRequest, SortDir, DEFAULT_PAGE_LIMIT};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// API errors, serializable so they can be surfaced as-is to frontends.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum OrbError {
    #[error("http: {0}")]
    Http(String),
    #[error("status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("decode: {0}")]
    Decode(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for OrbError {
    fn from(e: reqwest::Error) -> Self { OrbError::Http(e.to_string()) }
}

impl From<serde_json::Error> for OrbError {
    fn from(e: serde_json::Error) -> Self { OrbError::Decode(e.to_string()) }
}

pub type OrbResult<T> = Result<T, OrbError>;

// ----------------- Configuration -----------------

/// Connection settings for the fleet API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
    pub page_limit: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:80".to_string(),
            token: None,
            timeout: Duration::from_secs(30),
            page_limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl ClientConfig {
    /// Read `ORB_URL`, `ORB_TOKEN`, `ORB_TIMEOUT_SECS` and `ORB_PAGE_LIMIT`, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        let base_url = std::env::var("ORB_URL").ok().filter(|s| !s.is_empty()).unwrap_or(d.base_url);
        let token = std::env::var("ORB_TOKEN").ok().filter(|s| !s.is_empty());
        let timeout = std::env::var("ORB_TIMEOUT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs).unwrap_or(d.timeout);
        let page_limit = std::env::var("ORB_PAGE_LIMIT").ok().and_then(|s| s.parse::<u64>().ok()).filter(|n| *n > 0).unwrap_or(d.page_limit);
        Self { base_url, token, timeout, page_limit }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self { self.base_url = url.into(); self }
    pub fn with_token(mut self, token: Option<String>) -> Self { self.token = token; self }
}

// ----------------- API surface -----------------

/// Declarative Orb API surface. Items travel as raw JSON; see [`list_typed`] and [`get_typed`]
/// for decoded access.
#[async_trait::async_trait]
pub trait OrbApi: Send + Sync {
    /// Fetch one page of entities of `kind`.
    async fn list(&self, kind: EntityKind, req: &PageRequest) -> OrbResult<Page<serde_json::Value>>;

    /// Fetch a single entity by id.
    async fn get(&self, kind: EntityKind, id: &str) -> OrbResult<serde_json::Value>;

    /// Delete a single entity by id.
    async fn delete(&self, kind: EntityKind, id: &str) -> OrbResult<()>;
}

pub async fn list_typed<T: Entity>(api: &dyn OrbApi, req: &PageRequest) -> OrbResult<Page<T>> {
    let page = api.list(T::KIND, req).await?;
    Ok(page.decode::<T>()?)
}

pub async fn get_typed<T: Entity>(api: &dyn OrbApi, id: &str) -> OrbResult<T> {
    let raw = api.get(T::KIND, id).await?;
    Ok(serde_json::from_value(raw)?)
}

/// Parse a list response body: `{offset, limit, total, <list_key>: [...]}`.
/// A missing items key is an empty page; missing counters fall back to the request.
pub fn parse_list(kind: EntityKind, body: serde_json::Value, req: &PageRequest) -> OrbResult<Page<serde_json::Value>> {
    let mut obj = match body {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => return Ok(Page::empty(req.offset, req.limit)),
        other => return Err(OrbError::Decode(format!("expected object for {} list, got {}", kind, type_name(&other)))),
    };
    let items = match obj.remove(kind.list_key()) {
        Some(serde_json::Value::Array(items)) => items,
        Some(serde_json::Value::Null) | None => Vec::new(),
        Some(other) => {
            return Err(OrbError::Decode(format!("expected array under `{}`, got {}", kind.list_key(), type_name(&other))))
        }
    };
    let num = |key: &str| obj.get(key).and_then(|v| v.as_u64());
    let offset = num("offset").unwrap_or(req.offset);
    let limit = num("limit").unwrap_or(req.limit);
    let total = num("total").unwrap_or(offset.saturating_add(items.len() as u64));
    Ok(Page { offset, limit, total, items })
}

fn type_name(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// ----------------- HTTP implementation -----------------

/// reqwest-backed client for `{base_url}/api/v1/...` with optional bearer auth.
#[derive(Debug)]
pub struct HttpApi {
    http: reqwest::Client,
    config: ClientConfig,
}

impl HttpApi {
    pub fn new(config: ClientConfig) -> OrbResult<Self> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ClientConfig { &self.config }

    fn url(&self, kind: EntityKind, id: Option<&str>) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        match id {
            Some(id) => format!("{}/api/v1/{}/{}", base, kind.path(), id),
            None => format!("{}/api/v1/{}", base, kind.path()),
        }
    }

    fn validate_id(id: &str) -> OrbResult<()> {
        uuid::Uuid::parse_str(id).map(|_| ()).map_err(|e| OrbError::Validation(format!("invalid id {:?}: {}", id, e)))
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let rb = self.http.request(method, url).header("accept", "application/json");
        match self.config.token.as_deref() {
            Some(token) => rb.bearer_auth(token),
            None => rb,
        }
    }

    async fn send(&self, kind: EntityKind, rb: reqwest::RequestBuilder, what: &str) -> OrbResult<reqwest::Response> {
        let t0 = Instant::now();
        let res = rb.send().await;
        histogram!("orb_api_request_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => kind.label());
        let response = match res {
            Ok(r) => r,
            Err(e) => {
                counter!("orb_api_errors_total", 1u64, "kind" => kind.label());
                warn!(kind = %kind, error = %e, "api: {} transport error", what);
                return Err(e.into());
            }
        };
        let status = response.status().as_u16();
        if status == 404 {
            return Err(OrbError::NotFound(format!("{} {}", kind, response.url().path())));
        }
        if status >= 400 {
            counter!("orb_api_errors_total", 1u64, "kind" => kind.label());
            let message = response.text().await.unwrap_or_else(|_| "(no body)".into());
            return Err(OrbError::Status { status, message });
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl OrbApi for HttpApi {
    async fn list(&self, kind: EntityKind, req: &PageRequest) -> OrbResult<Page<serde_json::Value>> {
        let t0 = Instant::now();
        debug!(kind = %kind, offset = req.offset, limit = req.limit, "api: list start");
        let url = self.url(kind, None);
        let rb = self.request(reqwest::Method::GET, &url).query(&req.query_pairs());
        let response = self.send(kind, rb, "list").await?;
        let body: serde_json::Value = response.json().await.map_err(|e| OrbError::Decode(e.to_string()))?;
        let page = parse_list(kind, body, req)?;
        info!(kind = %kind, items = page.items.len(), total = page.total, took_ms = %t0.elapsed().as_millis(), "api: list ok");
        Ok(page)
    }

    async fn get(&self, kind: EntityKind, id: &str) -> OrbResult<serde_json::Value> {
        Self::validate_id(id)?;
        let t0 = Instant::now();
        let url = self.url(kind, Some(id));
        let response = self.send(kind, self.request(reqwest::Method::GET, &url), "get").await?;
        let body = response.json().await.map_err(|e| OrbError::Decode(e.to_string()))?;
        info!(kind = %kind, id = %id, took_ms = %t0.elapsed().as_millis(), "api: get ok");
        Ok(body)
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> OrbResult<()> {
        Self::validate_id(id)?;
        let t0 = Instant::now();
        let url = self.url(kind, Some(id));
        self.send(kind, self.request(reqwest::Method::DELETE, &url), "delete").await?;
        info!(kind = %kind, id = %id, took_ms = %t0.elapsed().as_millis(), "api: delete ok");
        Ok(())
    }
}

// ----------------- Mock implementation -----------------

/// Simple in-memory mock implementation for tests.
///
/// Serves canned items per kind with offset/limit slicing, name filtering and
/// name ordering. `fail_next(n)` makes the next `n` calls return an internal error;
/// `set_delay` makes every call sleep first.
#[derive(Default)]
pub struct MockApi {
    items: Mutex<HashMap<EntityKind, Vec<serde_json::Value>>>,
    calls: Mutex<HashMap<EntityKind, usize>>,
    fail_next: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl MockApi {
    pub fn new() -> Self { Self::default() }

    pub fn with(self, kind: EntityKind, items: Vec<serde_json::Value>) -> Self {
        self.set_items(kind, items);
        self
    }

    pub fn set_items(&self, kind: EntityKind, items: Vec<serde_json::Value>) {
        if let Ok(mut map) = self.items.lock() { map.insert(kind, items); }
    }

    pub fn push(&self, kind: EntityKind, item: serde_json::Value) {
        if let Ok(mut map) = self.items.lock() { map.entry(kind).or_default().push(item); }
    }

    pub fn fail_next(&self, n: usize) { self.fail_next.store(n, Ordering::SeqCst); }

    pub fn set_delay(&self, delay: Option<Duration>) {
        if let Ok(mut d) = self.delay.lock() { *d = delay; }
    }

    /// Number of calls (list/get/delete) made for `kind`.
    pub fn calls(&self, kind: EntityKind) -> usize {
        self.calls.lock().map(|c| c.get(&kind).copied().unwrap_or(0)).unwrap_or(0)
    }

    async fn enter(&self, kind: EntityKind) -> OrbResult<()> {
        if let Ok(mut c) = self.calls.lock() { *c.entry(kind).or_insert(0) += 1; }
        let delay = self.delay.lock().ok().and_then(|d| *d);
        if let Some(d) = delay { tokio::time::sleep(d).await; }
        let failed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| if n > 0 { Some(n - 1) } else { None })
            .is_ok();
        if failed { return Err(OrbError::Internal("mock failure".into())); }
        Ok(())
    }

    fn snapshot(&self, kind: EntityKind) -> Vec<serde_json::Value> {
        self.items.lock().map(|m| m.get(&kind).cloned().unwrap_or_default()).unwrap_or_default()
    }
}

fn str_field<'a>(v: &'a serde_json::Value, key: &str) -> &'a str {
    v.get(key).and_then(|s| s.as_str()).unwrap_or("")
}

#[async_trait::async_trait]
impl OrbApi for MockApi {
    async fn list(&self, kind: EntityKind, req: &PageRequest) -> OrbResult<Page<serde_json::Value>> {
        self.enter(kind).await?;
        let mut all = self.snapshot(kind);
        if let Some(name) = req.name.as_deref().filter(|n| !n.is_empty()) {
            all.retain(|v| str_field(v, "name").contains(name));
        }
        if req.order == "name" {
            all.sort_by(|a, b| str_field(a, "name").cmp(str_field(b, "name")));
            if req.dir == SortDir::Desc { all.reverse(); }
        }
        let total = all.len() as u64;
        let items: Vec<_> = all.into_iter().skip(req.offset as usize).take(req.limit as usize).collect();
        Ok(Page { offset: req.offset, limit: req.limit, total, items })
    }

    async fn get(&self, kind: EntityKind, id: &str) -> OrbResult<serde_json::Value> {
        self.enter(kind).await?;
        self.snapshot(kind)
            .into_iter()
            .find(|v| str_field(v, "id") == id)
            .ok_or_else(|| OrbError::NotFound(format!("{} {}", kind, id)))
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> OrbResult<()> {
        self.enter(kind).await?;
        let mut map = self.items.lock().map_err(|e| OrbError::Internal(e.to_string()))?;
        let list = map.entry(kind).or_default();
        let before = list.len();
        list.retain(|v| str_field(v, "id") != id);
        if list.len() == before { return Err(OrbError::NotFound(format!("{} {}", kind, id))); }
        Ok(())
    }
}
