//! Deferred event dispatch
//!
//! The scheduler runs as its own task next to the orchestrator's wait on the
//! proxy under test. Events are sorted by offset and each one is released
//! when `clock + offset` is reached, into its own task so a slow host command
//! never delays a later event. Events at or past the horizon (the scenario
//! timeout) and events still pending at cancellation are dropped unfired;
//! events still in flight at stop get a grace period, then are aborted.

use abr_scenarios::TimedEvent;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Callback that performs one event on its host
pub type FireFn = Arc<dyn Fn(TimedEvent) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Per-run accounting of deferred events
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScheduleSummary {
    pub fired: usize,
    pub failed: usize,
    pub dropped: usize,
}

pub struct Scheduler {
    // `Some(grace)` once stopped: how long in-flight events may still take
    cancel: watch::Sender<Option<Duration>>,
    task: JoinHandle<ScheduleSummary>,
}

impl Scheduler {
    /// Start dispatching `events` relative to `clock`
    pub fn start(clock: Instant, horizon: Duration, events: Vec<TimedEvent>, fire: FireFn) -> Self {
        let (cancel, cancelled) = watch::channel(None);
        info!(
            "Scheduling {} deferred event(s) within {:?}",
            events.len(),
            horizon
        );
        let task = tokio::spawn(dispatch(clock, horizon, events, fire, cancelled));
        Self { cancel, task }
    }

    /// Stop releasing events and return the tally. In-flight events get
    /// `grace` to finish; the rest are aborted and counted as failed.
    pub async fn stop(self, grace: Duration) -> ScheduleSummary {
        let _ = self.cancel.send(Some(grace));
        match self.task.await {
            Ok(summary) => summary,
            Err(e) => {
                warn!("Scheduler task failed: {}", e);
                ScheduleSummary::default()
            }
        }
    }
}

async fn dispatch(
    clock: Instant,
    horizon: Duration,
    mut events: Vec<TimedEvent>,
    fire: FireFn,
    mut cancelled: watch::Receiver<Option<Duration>>,
) -> ScheduleSummary {
    // Stable: equal offsets keep descriptor order
    events.sort_by_key(|e| e.after);

    let mut summary = ScheduleSummary::default();
    let (due, late): (Vec<_>, Vec<_>) = events.into_iter().partition(|e| e.after < horizon);
    for event in &late {
        debug!(
            "Dropping {} on {} at {:?}: beyond scenario timeout",
            event.action.kind(),
            event.action.host(),
            event.after
        );
    }
    summary.dropped += late.len();

    let mut in_flight = JoinSet::new();
    let mut pending = due.into_iter();
    while let Some(event) = pending.next() {
        let deadline = clock + event.after;
        let stop = tokio::select! {
            biased;
            _ = cancelled.changed() => true,
            _ = sleep_until(deadline) => false,
        };
        if stop || cancelled.borrow().is_some() {
            let skipped = 1 + pending.len();
            debug!("Scheduler cancelled, dropping {} pending event(s)", skipped);
            summary.dropped += skipped;
            break;
        }

        debug!(
            "Firing {} on {} at {:?}",
            event.action.kind(),
            event.action.host(),
            clock.elapsed()
        );
        summary.fired += 1;
        in_flight.spawn(fire(event));
    }

    // In-flight events run freely until stop, then only for the grace period
    let mut abort_at = (*cancelled.borrow()).map(|grace| Instant::now() + grace);
    loop {
        tokio::select! {
            joined = in_flight.join_next() => match joined {
                None => break,
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => {
                    warn!("Deferred event failed: {}", e);
                    summary.failed += 1;
                }
                Some(Err(e)) => {
                    warn!("Deferred event task aborted: {}", e);
                    summary.failed += 1;
                }
            },
            changed = cancelled.changed(), if abort_at.is_none() => {
                let grace = match changed {
                    Ok(()) => (*cancelled.borrow()).unwrap_or_default(),
                    Err(_) => Duration::ZERO,
                };
                abort_at = Some(Instant::now() + grace);
            }
            _ = sleep_until(abort_at.unwrap_or_else(Instant::now)), if abort_at.is_some() => {
                let stuck = in_flight.len();
                warn!("Aborting {} deferred event(s) still running at stop", stuck);
                in_flight.abort_all();
                summary.failed += stuck;
                break;
            }
        }
    }

    summary
}
