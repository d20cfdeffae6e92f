//! Orb poll: the refresh orchestrator behind live list views.
//!
//! An [`OrbPoller`] merges two tick sources:
//! - a pausable interval timer (first tick right after `resume`, then every `interval`)
//! - a debounced refresh channel (`refresh_now` bursts collapse into one tick)
//!
//! Each [`OrbPoller::observe`] call spawns one worker that re-runs a fetch on every tick,
//! abandons a still-pending fetch when a newer tick arrives, swallows fetch errors by
//! re-subscribing, and shares the latest value with every subscriber.
//! [`OrbPoller::kill`] tears the whole thing down for good.

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

mod controller;
mod multiplex;

pub use multiplex::{Observed, Subscription};

const TICK_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Paused,
    Resumed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickSource {
    Timer,
    Refresh,
}

impl TickSource {
    pub fn as_str(&self) -> &'static str {
        match self { TickSource::Timer => "timer", TickSource::Refresh => "refresh" }
    }
}

/// A request to refetch, numbered in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub seq: u64,
    pub source: TickSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Period of the timer while resumed.
    pub interval: Duration,
    /// Quiet window closing a burst of `refresh_now` calls.
    pub debounce: Duration,
    /// Delay of the first timer tick after `resume`.
    pub first_tick_delay: Duration,
    /// Delay before refetching after a failed fetch (resumed pollers only).
    pub retry_delay: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            debounce: Duration::from_millis(1000),
            first_tick_delay: Duration::from_millis(1),
            retry_delay: Duration::from_millis(1),
        }
    }
}

impl PollConfig {
    /// Defaults overridden by `ORB_POLL_MS` and `ORB_DEBOUNCE_MS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let ms = |key: &str| std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_millis);
        Self { interval: ms("ORB_POLL_MS").unwrap_or(d.interval), debounce: ms("ORB_DEBOUNCE_MS").unwrap_or(d.debounce), ..d }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self { self.interval = interval; self }

    fn sanitized(mut self) -> Self {
        // tokio intervals reject a zero period
        self.interval = self.interval.max(Duration::from_millis(1));
        self
    }
}

/// Owned refresh orchestrator. Construct one per view (or per set of views that should
/// pause and refresh together) inside a tokio runtime; dropping it is the same as `kill`.
pub struct OrbPoller {
    config: PollConfig,
    state_tx: watch::Sender<PollState>,
    refresh_tx: mpsc::UnboundedSender<()>,
    ticks: broadcast::Sender<Tick>,
    kill: CancellationToken,
    last_update: Arc<watch::Sender<Option<DateTime<Utc>>>>,
}

impl OrbPoller {
    /// Create a paused poller and spawn its tick source.
    pub fn new(config: PollConfig) -> Self {
        let config = config.sanitized();
        let (state_tx, state_rx) = watch::channel(PollState::Paused);
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        let (ticks, _) = broadcast::channel(TICK_CAPACITY);
        let kill = CancellationToken::new();
        let (last_update, _) = watch::channel(None);
        controller::spawn_tick_source(config, state_rx, refresh_rx, ticks.clone(), kill.clone());
        info!(interval_ms = %config.interval.as_millis(), debounce_ms = %config.debounce.as_millis(), "poll: poller created");
        Self { config, state_tx, refresh_tx, ticks, kill, last_update: Arc::new(last_update) }
    }

    pub fn config(&self) -> &PollConfig { &self.config }

    pub fn state(&self) -> PollState { *self.state_tx.borrow() }

    /// Stop producing timer ticks. Fetches already running are left alone.
    pub fn pause(&self) {
        debug!("poll: pause");
        self.state_tx.send_replace(PollState::Paused);
    }

    /// Start a fresh timer: first tick almost immediately, then every interval.
    pub fn resume(&self) {
        debug!("poll: resume");
        self.state_tx.send_replace(PollState::Resumed);
    }

    /// Ask for an out-of-band refresh; coalesced with other requests inside the debounce window.
    pub fn refresh_now(&self) {
        let _ = self.refresh_tx.send(());
    }

    /// Permanently stop ticking and end every stream derived from this poller.
    pub fn kill(&self) {
        if !self.kill.is_cancelled() {
            info!("poll: kill");
        }
        self.kill.cancel();
    }

    pub fn is_killed(&self) -> bool { self.kill.is_cancelled() }

    /// Wall-clock time of the last successful fetch across all streams of this poller.
    pub fn last_update(&self) -> Option<DateTime<Utc>> { *self.last_update.borrow() }

    pub fn subscribe_last_update(&self) -> watch::Receiver<Option<DateTime<Utc>>> { self.last_update.subscribe() }

    /// Keep the result of `fetch` fresh: re-run it on every tick and share the latest value.
    pub fn observe<T, F, Fut>(&self, fetch: F) -> Observed<T>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.observe_named("stream", fetch)
    }

    /// Same as [`OrbPoller::observe`], with a label used in logs.
    pub fn observe_named<T, F, Fut>(&self, label: impl Into<String>, fetch: F) -> Observed<T>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let ctx = multiplex::WorkerCtx {
            cfg: self.config,
            ticks: self.ticks.subscribe(),
            state: self.state_tx.subscribe(),
            kill: self.kill.clone(),
            last_update: Arc::clone(&self.last_update),
            label: label.into(),
        };
        multiplex::spawn_worker(ctx, fetch)
    }
}

impl Drop for OrbPoller {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}
