//! Orb store: offset/limit list services backed by an in-memory splice cache.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use orb_api::OrbApi;
use orb_core::{Agent, AgentGroup, AgentPolicy, Dataset, Entity, EntityKind, Page, PageRequest, Sink, SortDir};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Anything a list service can hold: raw JSON or a typed entity.
pub trait ListItem: Clone + Send + Sync + 'static {
    fn decode(raw: serde_json::Value) -> Result<Self>;
}

impl ListItem for serde_json::Value {
    fn decode(raw: serde_json::Value) -> Result<Self> { Ok(raw) }
}

macro_rules! typed_item {
    ($($ty:ty),*) => {$(
        impl ListItem for $ty {
            fn decode(raw: serde_json::Value) -> Result<Self> {
                serde_json::from_value(raw).with_context(|| format!("decoding {}", <$ty as Entity>::KIND))
            }
        }
    )*};
}

typed_item!(Agent, AgentGroup, Sink, AgentPolicy, Dataset);

type QueryKey = (String, SortDir, Option<String>);

/// Page cache keyed by position. Pages are spliced into one sparse position map,
/// so overlapping or out-of-order pages compose whatever total the server reports.
pub struct PageCache<T> {
    slots: BTreeMap<u64, T>,
    loaded: FxHashMap<u64, u64>,
    total: Option<u64>,
    query: Option<QueryKey>,
}

impl<T: Clone> Default for PageCache<T> {
    fn default() -> Self { Self::new() }
}

impl<T: Clone> PageCache<T> {
    pub fn new() -> Self {
        Self { slots: BTreeMap::new(), loaded: FxHashMap::default(), total: None, query: None }
    }

    pub fn total(&self) -> Option<u64> { self.total }
    pub fn len(&self) -> usize { self.slots.len() }
    pub fn is_empty(&self) -> bool { self.slots.is_empty() }

    pub fn invalidate(&mut self) {
        self.slots.clear();
        self.loaded.clear();
        self.total = None;
        self.query = None;
    }

    /// Splice `page` (fetched for `req`) into the cache. A different ordering/filter or a
    /// changed total means previously cached positions are stale and get dropped first.
    /// A page whose items run past its own total is rejected and leaves the cache untouched.
    pub fn insert(&mut self, req: &PageRequest, page: Page<T>) -> Result<()> {
        let end = page.offset.checked_add(page.items.len() as u64).filter(|end| *end <= page.total);
        if end.is_none() {
            bail!("page out of range: offset {} with {} items, total {}", page.offset, page.items.len(), page.total);
        }
        let key = req.query_key();
        if self.query.as_ref() != Some(&key) {
            self.invalidate();
            self.query = Some(key);
        }
        if self.total.is_some_and(|t| t != page.total) {
            debug!(old = ?self.total, new = page.total, "page cache: total changed; dropping cached pages");
            self.slots.clear();
            self.loaded.clear();
        }
        self.total = Some(page.total);
        for (i, item) in page.items.into_iter().enumerate() {
            self.slots.insert(page.offset + i as u64, item);
        }
        self.loaded.insert(page.offset, page.limit.max(req.limit));
        Ok(())
    }

    /// Cached page for `req`, if that offset was loaded for the same query with at least `req.limit`.
    pub fn get(&self, req: &PageRequest) -> Option<Page<T>> {
        if self.query.as_ref() != Some(&req.query_key()) { return None; }
        let total = self.total?;
        let loaded_limit = *self.loaded.get(&req.offset)?;
        if loaded_limit < req.limit { return None; }
        let end = req.offset.saturating_add(req.limit).min(total).max(req.offset);
        let items = (req.offset..end).map(|pos| self.slots.get(&pos).cloned()).collect::<Option<Vec<T>>>()?;
        Some(Page { offset: req.offset, limit: req.limit, total, items })
    }

    /// All cached items in position order (gaps skipped).
    pub fn items(&self) -> Vec<T> {
        self.slots.values().cloned().collect()
    }

    /// True when every position below the total is cached.
    pub fn is_complete(&self) -> bool {
        matches!(self.total, Some(t) if self.slots.len() as u64 == t)
    }
}

/// A complete list as of one walk over every page.
#[derive(Debug, Clone)]
pub struct ListSnapshot<T> {
    pub kind: EntityKind,
    pub total: u64,
    pub items: Vec<T>,
    pub fetched_at: DateTime<Utc>,
}

/// List service for one entity kind: cached page reads, forced refreshes, and full walks.
pub struct ListService<T: ListItem> {
    api: Arc<dyn OrbApi>,
    kind: EntityKind,
    page_limit: u64,
    cache: Mutex<PageCache<T>>,
    latest: ArcSwapOption<ListSnapshot<T>>,
}

impl<T: ListItem> ListService<T> {
    pub fn new(api: Arc<dyn OrbApi>, kind: EntityKind, page_limit: u64) -> Self {
        Self {
            api,
            kind,
            page_limit: page_limit.max(1),
            cache: Mutex::new(PageCache::new()),
            latest: ArcSwapOption::empty(),
        }
    }

    pub fn kind(&self) -> EntityKind { self.kind }

    fn cache(&self) -> MutexGuard<'_, PageCache<T>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn fetch(&self, req: &PageRequest) -> Result<Page<T>> {
        let raw = self.api.list(self.kind, req).await.with_context(|| format!("listing {} at offset {}", self.kind, req.offset))?;
        let Page { offset, limit, total, items } = raw;
        let items = items.into_iter().map(T::decode).collect::<Result<Vec<T>>>()?;
        Ok(Page { offset, limit, total, items })
    }

    /// Cached page if available, otherwise fetch and cache it.
    pub async fn page(&self, req: &PageRequest) -> Result<Page<T>> {
        if let Some(hit) = self.cache().get(req) {
            counter!("orb_store_cache_hits_total", 1u64, "kind" => self.kind.label());
            return Ok(hit);
        }
        counter!("orb_store_cache_misses_total", 1u64, "kind" => self.kind.label());
        self.refresh(req).await
    }

    /// Always fetch `req` and splice the result into the cache.
    pub async fn refresh(&self, req: &PageRequest) -> Result<Page<T>> {
        let page = self.fetch(req).await?;
        self.cache().insert(req, page.clone())?;
        Ok(page)
    }

    /// Walk every page with fresh fetches and publish the full list.
    /// The walk fills a private cache which replaces the shared one only once complete.
    pub async fn all(&self) -> Result<Arc<ListSnapshot<T>>> {
        let t0 = Instant::now();
        let mut walk = PageCache::new();
        let mut req = PageRequest::first(self.page_limit);
        let mut pages = 0usize;
        loop {
            let page = self.fetch(&req).await?;
            let total = page.total;
            let empty = page.items.is_empty();
            walk.insert(&req, page)?;
            pages += 1;
            // an empty page ends the walk even if the server reports a larger total
            if empty { break; }
            match req.next(total) {
                Some(next) => req = next,
                None => break,
            }
        }
        let snap = Arc::new(ListSnapshot {
            kind: self.kind,
            total: walk.total().unwrap_or(0),
            items: walk.items(),
            fetched_at: Utc::now(),
        });
        *self.cache() = walk;
        self.latest.store(Some(Arc::clone(&snap)));
        histogram!("orb_store_walk_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => self.kind.label());
        info!(kind = %self.kind, pages, items = snap.items.len(), took_ms = %t0.elapsed().as_millis(), "store: list walk ok");
        Ok(snap)
    }

    /// Most recent complete walk, if any.
    pub fn latest(&self) -> Option<Arc<ListSnapshot<T>>> { self.latest.load_full() }

    pub fn cached_len(&self) -> usize { self.cache().len() }
    pub fn total(&self) -> Option<u64> { self.cache().total() }

    pub fn invalidate(&self) {
        self.cache().invalidate();
    }
}

impl<T: ListItem + Entity> ListService<T> {
    pub fn typed(api: Arc<dyn OrbApi>, page_limit: u64) -> Self {
        Self::new(api, T::KIND, page_limit)
    }
}

// ---- overview ----

/// Fleet-wide counters shown on the console landing view.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FleetOverview {
    pub agents: u64,
    pub agent_states: BTreeMap<String, u64>,
    pub groups: u64,
    pub sinks: u64,
    pub sink_states: BTreeMap<String, u64>,
    pub policies: u64,
    pub datasets: u64,
    pub invalid_datasets: u64,
}

impl FleetOverview {
    /// Walk all five lists concurrently and summarize them.
    pub async fn fetch(api: Arc<dyn OrbApi>, page_limit: u64) -> Result<Self> {
        let t0 = Instant::now();
        let agents = ListService::<Agent>::typed(Arc::clone(&api), page_limit);
        let groups = ListService::<AgentGroup>::typed(Arc::clone(&api), page_limit);
        let sinks = ListService::<Sink>::typed(Arc::clone(&api), page_limit);
        let policies = ListService::<AgentPolicy>::typed(Arc::clone(&api), page_limit);
        let datasets = ListService::<Dataset>::typed(api, page_limit);
        let (agents, groups, sinks, policies, datasets) =
            futures::try_join!(agents.all(), groups.all(), sinks.all(), policies.all(), datasets.all())?;

        let mut out = FleetOverview {
            agents: agents.total,
            groups: groups.total,
            sinks: sinks.total,
            policies: policies.total,
            datasets: datasets.total,
            ..Default::default()
        };
        for a in &agents.items {
            *out.agent_states.entry(a.state.to_string()).or_insert(0) += 1;
        }
        for s in &sinks.items {
            let state = serde_json::to_value(s.state).ok().and_then(|v| v.as_str().map(str::to_string)).unwrap_or_default();
            *out.sink_states.entry(state).or_insert(0) += 1;
        }
        out.invalid_datasets = datasets.items.iter().filter(|d| !d.valid).count() as u64;
        info!(agents = out.agents, groups = out.groups, sinks = out.sinks, took_ms = %t0.elapsed().as_millis(), "store: overview ok");
        Ok(out)
    }
}
