//! Tick source: the pausable interval timer merged with the debounced refresh channel.

#![forbid(unsafe_code)]

use metrics::counter;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{PollConfig, PollState, Tick, TickSource};

fn new_timer(cfg: &PollConfig) -> Interval {
    let mut iv = tokio::time::interval_at(Instant::now() + cfg.first_tick_delay, cfg.interval);
    iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
    iv
}

async fn timer_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(iv) => { iv.tick().await; }
        None => std::future::pending::<()>().await,
    }
}

async fn quiet_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

/// Spawn the task owning the timer and the debounce window. Every tick goes out on `ticks`;
/// the task ends when `kill` fires.
pub(crate) fn spawn_tick_source(
    cfg: PollConfig,
    mut state_rx: watch::Receiver<PollState>,
    mut refresh_rx: mpsc::UnboundedReceiver<()>,
    ticks: broadcast::Sender<Tick>,
    kill: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer: Option<Interval> = match *state_rx.borrow_and_update() {
            PollState::Resumed => Some(new_timer(&cfg)),
            PollState::Paused => None,
        };
        let mut debounce_deadline: Option<Instant> = None;
        let mut refresh_open = true;
        let mut seq = 0u64;
        let mut emit = |source: TickSource| {
            seq += 1;
            counter!("orb_poll_ticks_total", 1u64, "source" => source.as_str());
            debug!(seq, source = source.as_str(), "poll: tick");
            let _ = ticks.send(Tick { seq, source });
        };
        loop {
            tokio::select! {
                biased;
                _ = kill.cancelled() => {
                    info!("poll: kill received; tick source stopped");
                    break;
                }
                changed = state_rx.changed() => {
                    if changed.is_err() { break; }
                    let state = *state_rx.borrow_and_update();
                    // every resume swaps in a fresh timer, even when already resumed
                    timer = match state {
                        PollState::Resumed => Some(new_timer(&cfg)),
                        PollState::Paused => None,
                    };
                    info!(state = ?state, "poll: state changed");
                }
                _ = timer_tick(&mut timer) => emit(TickSource::Timer),
                sig = refresh_rx.recv(), if refresh_open => {
                    match sig {
                        Some(()) => debounce_deadline = Some(Instant::now() + cfg.debounce),
                        None => refresh_open = false,
                    }
                }
                _ = quiet_until(debounce_deadline) => {
                    debounce_deadline = None;
                    emit(TickSource::Refresh);
                }
            }
        }
    })
}
