#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use orb_api::{MockApi, OrbApi, OrbError, OrbResult};
use orb_core::{Agent, EntityKind, Page, PageRequest};
use orb_poll::{OrbPoller, PollConfig, PollState};
use orb_store::ListService;
use tokio::time::{sleep, sleep_until, timeout, Instant};

fn ms(n: u64) -> Duration { Duration::from_millis(n) }

/// Fetch returning the 1-based call number; the count is taken when the fetch starts.
fn counting(calls: Arc<AtomicUsize>) -> impl Fn() -> std::future::Ready<anyhow::Result<usize>> + Send + Sync + 'static {
    move || {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        std::future::ready(Ok(n))
    }
}

fn count(calls: &AtomicUsize) -> usize { calls.load(Ordering::SeqCst) }

#[tokio::test(start_paused = true)]
async fn timer_ticks_only_while_resumed() {
    let poller = OrbPoller::new(PollConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let obs = poller.observe(counting(calls.clone()));
    let mut sub = obs.subscribe();

    sleep(ms(5000)).await;
    assert_eq!(count(&calls), 0, "a new poller starts paused");

    poller.resume();
    let t0 = Instant::now();
    assert_eq!(sub.next().await.as_deref(), Some(&1));
    assert!(t0.elapsed() <= ms(2), "first tick right after resume, got {:?}", t0.elapsed());

    // ticks at +1ms, +1001ms, +2001ms
    sleep_until(t0 + ms(2500)).await;
    assert_eq!(count(&calls), 3);

    poller.pause();
    assert_eq!(poller.state(), PollState::Paused);
    sleep(ms(10_000)).await;
    assert_eq!(count(&calls), 3);

    poller.resume();
    sleep(ms(10)).await;
    assert_eq!(count(&calls), 4, "resume restarts with an immediate tick");
}

#[tokio::test(start_paused = true)]
async fn resumed_poller_fetches_four_times_in_three_and_a_half_seconds() {
    let poller = OrbPoller::new(PollConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let _obs = poller.observe(counting(calls.clone()));
    let t0 = Instant::now();
    poller.resume();
    sleep_until(t0 + ms(3500)).await;
    assert_eq!(count(&calls), 4);
}

#[tokio::test(start_paused = true)]
async fn refresh_while_resumed_adds_one_tick_without_moving_the_timer() {
    let poller = OrbPoller::new(PollConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let _obs = poller.observe(counting(calls.clone()));

    let t0 = Instant::now();
    poller.resume();
    sleep_until(t0 + ms(100)).await;
    assert_eq!(count(&calls), 1);
    poller.refresh_now();

    // timer at +1ms and +1001ms, refresh at +1100ms
    sleep_until(t0 + ms(1099)).await;
    assert_eq!(count(&calls), 2);
    sleep_until(t0 + ms(1101)).await;
    assert_eq!(count(&calls), 3);
    sleep_until(t0 + ms(2000)).await;
    assert_eq!(count(&calls), 3);
    sleep_until(t0 + ms(2002)).await;
    assert_eq!(count(&calls), 4, "timer keeps its phase after a refresh");
}

#[tokio::test(start_paused = true)]
async fn refresh_burst_is_debounced_into_one_fetch() {
    let poller = OrbPoller::new(PollConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let _obs = poller.observe(counting(calls.clone()));

    let t0 = Instant::now();
    poller.refresh_now();
    sleep(ms(300)).await;
    poller.refresh_now();
    sleep(ms(300)).await;
    poller.refresh_now();

    // the last request was at +600ms
    sleep_until(t0 + ms(1599)).await;
    assert_eq!(count(&calls), 0);
    sleep_until(t0 + ms(1601)).await;
    assert_eq!(count(&calls), 1);
    sleep(ms(5000)).await;
    assert_eq!(count(&calls), 1, "paused poller only fetches on refresh");
}

#[tokio::test(start_paused = true)]
async fn subscribers_share_one_fetch_and_late_ones_replay() {
    let poller = OrbPoller::new(PollConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let obs = poller.observe(counting(calls.clone()));
    let mut a = obs.subscribe();
    let mut b = obs.subscribe();

    poller.resume();
    let va = a.next().await.expect("a");
    let vb = b.next().await.expect("b");
    assert!(Arc::ptr_eq(&va, &vb));
    assert_eq!(count(&calls), 1);

    let mut late = obs.subscribe();
    let replay = timeout(ms(1), late.next()).await.expect("replayed without waiting").expect("value");
    assert!(Arc::ptr_eq(&va, &replay));
    assert!(Arc::ptr_eq(&va, &obs.current().expect("current")));

    let next = late.next().await.expect("second tick");
    assert_eq!(*next, 2);
    assert_eq!(obs.epoch(), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_fetch_is_swallowed_and_next_tick_delivers() {
    let poller = OrbPoller::new(PollConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let obs = poller.observe(move || {
        let n = c.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if n == 1 { anyhow::bail!("boom") }
            Ok(n)
        }
    });
    let mut sub = obs.subscribe();

    poller.refresh_now();
    sleep(ms(1500)).await;
    assert_eq!(count(&calls), 1);
    assert_eq!(obs.epoch(), 0);
    assert!(poller.last_update().is_none(), "errors never touch the last update time");
    sleep(ms(5000)).await;
    assert_eq!(count(&calls), 1, "paused pollers do not retry on their own");

    poller.refresh_now();
    assert_eq!(sub.next().await.as_deref(), Some(&2));
    assert!(poller.last_update().is_some());
    assert!(!obs.is_closed());
}

#[tokio::test(start_paused = true)]
async fn resumed_stream_retries_right_after_an_error() {
    let poller = OrbPoller::new(PollConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let obs = poller.observe(move || {
        let n = c.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if n == 1 { anyhow::bail!("transient") }
            Ok(n)
        }
    });
    let mut sub = obs.subscribe();

    let t0 = Instant::now();
    poller.resume();
    assert_eq!(sub.next().await.as_deref(), Some(&2));
    assert!(t0.elapsed() < ms(10), "retry should not wait for the next interval, took {:?}", t0.elapsed());
}

#[tokio::test(start_paused = true)]
async fn newer_tick_supersedes_pending_fetch() {
    let poller = OrbPoller::new(PollConfig::default().with_interval(ms(100)));
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let obs = poller.observe(move || {
        let n = c.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if n == 1 { sleep(ms(500)).await; }
            Ok(n)
        }
    });
    let mut sub = obs.subscribe();

    poller.resume();
    assert_eq!(sub.next().await.as_deref(), Some(&2));
    poller.pause();
    sleep(ms(2000)).await;
    assert_eq!(obs.current().as_deref(), Some(&2), "the slow first fetch must never surface");
    assert_eq!(obs.epoch(), 1);
}

#[tokio::test(start_paused = true)]
async fn kill_ends_streams_for_good() {
    let poller = OrbPoller::new(PollConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let obs = poller.observe(counting(calls.clone()));
    let mut sub = obs.subscribe();

    poller.resume();
    assert_eq!(sub.next().await.as_deref(), Some(&1));

    poller.kill();
    assert!(poller.is_killed());
    assert!(sub.next().await.is_none());
    assert!(obs.subscribe().next().await.is_none());
    assert!(obs.is_closed());
    assert_eq!(obs.current().as_deref(), Some(&1), "last value stays readable");

    poller.resume();
    poller.refresh_now();
    sleep(ms(5000)).await;
    assert_eq!(count(&calls), 1);

    let after = poller.observe(counting(calls.clone()));
    assert!(after.subscribe().next().await.is_none());
    assert_eq!(count(&calls), 1);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_poller_kills_it() {
    let poller = OrbPoller::new(PollConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let obs = poller.observe(counting(calls.clone()));
    poller.resume();
    drop(poller);
    assert!(obs.subscribe().next().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn worker_stops_once_every_observer_is_gone() {
    let poller = OrbPoller::new(PollConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let obs = poller.observe(counting(calls.clone()));
    let mut sub = obs.subscribe();
    poller.resume();
    assert!(sub.next().await.is_some());
    drop(sub);
    drop(obs);
    sleep(ms(5000)).await;
    assert_eq!(count(&calls), 1);
}

#[tokio::test(start_paused = true)]
async fn last_update_is_shared_across_streams() {
    let poller = OrbPoller::new(PollConfig::default());
    let mut updates = poller.subscribe_last_update();
    let a = poller.observe_named("a", counting(Arc::new(AtomicUsize::new(0))));
    let b = poller.observe_named("b", counting(Arc::new(AtomicUsize::new(0))));
    poller.refresh_now();
    updates.changed().await.expect("first update");
    let first = (*updates.borrow_and_update()).expect("set");
    sleep(ms(1500)).await;
    let seen = poller.last_update().expect("set");
    assert!(seen >= first);
    assert_eq!(a.epoch(), 1);
    assert_eq!(b.epoch(), 1);
}

fn walk(svc: Arc<ListService<Agent>>) -> impl Fn() -> std::pin::Pin<Box<dyn Future<Output = anyhow::Result<usize>> + Send>> + Send + Sync {
    move || {
        let svc = Arc::clone(&svc);
        Box::pin(async move { Ok(svc.all().await?.items.len()) })
    }
}

#[tokio::test(start_paused = true)]
async fn observed_list_walk_picks_up_new_items() {
    let mock = Arc::new(MockApi::new().with(
        EntityKind::Agent,
        vec![serde_json::json!({ "id": "a1", "name": "edge-1", "state": "online" })],
    ));
    let svc = Arc::new(ListService::<Agent>::typed(mock.clone() as Arc<dyn OrbApi>, 10));
    let poller = OrbPoller::new(PollConfig::default());
    let obs = poller.observe_named("agents", walk(svc));
    let mut sub = obs.subscribe();

    poller.resume();
    assert_eq!(sub.next().await.as_deref(), Some(&1));
    mock.push(EntityKind::Agent, serde_json::json!({ "id": "a2", "name": "edge-2", "state": "stale" }));
    mock.fail_next(1);
    // +1001ms fails, the retry 1ms later succeeds
    assert_eq!(sub.next().await.as_deref(), Some(&2));
    assert_eq!(mock.calls(EntityKind::Agent), 3);
}

#[tokio::test(start_paused = true)]
async fn pause_lets_the_running_fetch_finish() {
    let mock = Arc::new(MockApi::new().with(
        EntityKind::Agent,
        vec![serde_json::json!({ "id": "a1", "name": "edge-1", "state": "online" })],
    ));
    mock.set_delay(Some(ms(300)));
    let svc = Arc::new(ListService::<Agent>::typed(mock.clone() as Arc<dyn OrbApi>, 10));
    let poller = OrbPoller::new(PollConfig::default());
    let obs = poller.observe_named("agents", walk(svc));

    let t0 = Instant::now();
    poller.resume();
    sleep_until(t0 + ms(10)).await;
    poller.pause();
    assert!(obs.current().is_none());

    sleep(ms(2000)).await;
    assert_eq!(obs.current().as_deref(), Some(&1));
    assert_eq!(mock.calls(EntityKind::Agent), 1);
    assert!(poller.last_update().is_some());
}

/// Backend reporting an impossible total until `sane` is set.
#[derive(Default)]
struct HugeTotalApi {
    sane: AtomicBool,
}

#[async_trait::async_trait]
impl OrbApi for HugeTotalApi {
    async fn list(&self, _kind: EntityKind, req: &PageRequest) -> OrbResult<Page<serde_json::Value>> {
        let total = if self.sane.load(Ordering::SeqCst) { 1 } else { u64::MAX };
        let items = vec![serde_json::json!({ "id": "a1", "name": "edge-1" })];
        Ok(Page { offset: u64::MAX - 1, limit: req.limit, total, items })
    }

    async fn get(&self, kind: EntityKind, id: &str) -> OrbResult<serde_json::Value> {
        Err(OrbError::NotFound(format!("{} {}", kind, id)))
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> OrbResult<()> {
        Err(OrbError::NotFound(format!("{} {}", kind, id)))
    }
}

#[tokio::test(start_paused = true)]
async fn malformed_pages_never_end_the_stream() {
    let api = Arc::new(HugeTotalApi::default());
    let svc = Arc::new(ListService::<serde_json::Value>::new(api.clone() as Arc<dyn OrbApi>, EntityKind::Agent, 10));
    let poller = OrbPoller::new(PollConfig::default());
    let obs = poller.observe(move || {
        let svc = Arc::clone(&svc);
        async move { Ok(svc.page(&PageRequest::first(10)).await?.items.len()) }
    });
    let mut sub = obs.subscribe();

    // offset u64::MAX - 1 is in range for a huge total
    poller.resume();
    assert_eq!(sub.next().await.as_deref(), Some(&1));

    // ...and out of range once the total shrinks to 1; every refetch fails
    api.sane.store(true, Ordering::SeqCst);
    sleep(ms(3000)).await;
    assert!(!obs.is_closed());
    assert_eq!(obs.epoch(), 1);
    assert_eq!(obs.current().as_deref(), Some(&1));
}
