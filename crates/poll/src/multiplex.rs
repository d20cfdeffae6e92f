//! Shared fetch streams: one worker per `observe` call, any number of subscribers.

#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant as StdInstant;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{PollConfig, PollState, Tick};

type BoxFetch<T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send>>;

struct Versioned<T> {
    epoch: u64,
    value: Arc<T>,
}

/// Handle on a shared, continuously refreshed value.
///
/// Cloning is cheap; all clones and subscriptions observe the same worker.
/// The worker stops when the poller is killed or once every handle and
/// subscription has been dropped.
pub struct Observed<T> {
    latest: Arc<ArcSwapOption<Versioned<T>>>,
    epoch_rx: watch::Receiver<u64>,
}

impl<T> Clone for Observed<T> {
    fn clone(&self) -> Self {
        Self { latest: Arc::clone(&self.latest), epoch_rx: self.epoch_rx.clone() }
    }
}

impl<T> Observed<T> {
    /// Latest delivered value, if any. Still readable after teardown.
    pub fn current(&self) -> Option<Arc<T>> {
        self.latest.load_full().map(|v| Arc::clone(&v.value))
    }

    /// Number of values delivered so far.
    pub fn epoch(&self) -> u64 { *self.epoch_rx.borrow() }

    /// True once the worker has stopped; no value will be delivered after this.
    pub fn is_closed(&self) -> bool { self.epoch_rx.has_changed().is_err() }

    /// New subscriber. Its first `next()` replays the latest value, if one exists.
    pub fn subscribe(&self) -> Subscription<T> {
        Subscription { latest: Arc::clone(&self.latest), rx: self.epoch_rx.clone(), seen: 0 }
    }
}

pub struct Subscription<T> {
    latest: Arc<ArcSwapOption<Versioned<T>>>,
    rx: watch::Receiver<u64>,
    seen: u64,
}

impl<T> Subscription<T> {
    /// Wait for a value newer than the last one returned. Intermediate values are skipped
    /// when the subscriber falls behind. `None` once the stream has been torn down.
    pub async fn next(&mut self) -> Option<Arc<T>> {
        loop {
            if self.rx.has_changed().is_err() { return None; }
            self.rx.borrow_and_update();
            if let Some(v) = self.latest.load_full() {
                if v.epoch > self.seen {
                    self.seen = v.epoch;
                    return Some(Arc::clone(&v.value));
                }
            }
            if self.rx.changed().await.is_err() { return None; }
        }
    }
}

async fn settle<T>(slot: &mut Option<BoxFetch<T>>) -> anyhow::Result<T> {
    match slot {
        Some(fut) => fut.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

pub(crate) struct WorkerCtx {
    pub cfg: PollConfig,
    pub ticks: broadcast::Receiver<Tick>,
    pub state: watch::Receiver<PollState>,
    pub kill: CancellationToken,
    pub last_update: Arc<watch::Sender<Option<DateTime<Utc>>>>,
    pub label: String,
}

fn start<T, F, Fut>(fetch: &F) -> BoxFetch<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let fut = fetch();
    Box::pin(async move {
        let t0 = StdInstant::now();
        let res = fut.await;
        histogram!("orb_poll_fetch_ms", t0.elapsed().as_secs_f64() * 1000.0);
        res
    })
}

/// Spawn the worker behind one `observe` call and hand back its shared handle.
pub(crate) fn spawn_worker<T, F, Fut>(ctx: WorkerCtx, fetch: F) -> Observed<T>
where
    T: Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let latest: Arc<ArcSwapOption<Versioned<T>>> = Arc::new(ArcSwapOption::empty());
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let observed = Observed { latest: Arc::clone(&latest), epoch_rx };

    let WorkerCtx { cfg, mut ticks, state, kill, last_update, label } = ctx;
    tokio::spawn(async move {
        let mut in_flight: Option<BoxFetch<T>> = None;
        let mut retry_at: Option<Instant> = None;
        let mut epoch = 0u64;
        let mut errors = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = kill.cancelled() => break,
                _ = epoch_tx.closed() => {
                    debug!(stream = %label, "poll: all observers gone");
                    break;
                }
                tick = ticks.recv() => {
                    match tick {
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                            if in_flight.is_some() {
                                debug!(stream = %label, "poll: superseding in-flight fetch");
                            }
                            // dropping the previous future discards its result
                            in_flight = Some(start(&fetch));
                            retry_at = None;
                            counter!("orb_poll_fetch_total", 1u64);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = sleep_opt(retry_at) => {
                    retry_at = None;
                    if *state.borrow() == PollState::Resumed {
                        in_flight = Some(start(&fetch));
                        counter!("orb_poll_fetch_total", 1u64);
                    }
                }
                res = settle(&mut in_flight) => {
                    in_flight = None;
                    match res {
                        Ok(value) => {
                            last_update.send_modify(|ts| {
                                let now = Utc::now();
                                *ts = Some(match *ts {
                                    Some(prev) if prev > now => prev,
                                    _ => now,
                                });
                            });
                            epoch += 1;
                            latest.store(Some(Arc::new(Versioned { epoch, value: Arc::new(value) })));
                            epoch_tx.send_replace(epoch);
                            errors = 0;
                        }
                        Err(e) => {
                            errors += 1;
                            counter!("orb_poll_fetch_errors_total", 1u64);
                            warn!(stream = %label, error = %e, consecutive = errors, "poll: fetch failed; retrying");
                            // re-subscription only produces work while the timer is running
                            if *state.borrow() == PollState::Resumed {
                                retry_at = Some(Instant::now() + cfg.retry_delay);
                            }
                        }
                    }
                }
            }
        }
        info!(stream = %label, delivered = epoch, "poll: stream stopped");
    });

    observed
}
