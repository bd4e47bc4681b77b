// =============================================================================
// Trigger Engine — decides WHEN to run a Trading Cycle
// =============================================================================
//
// Three mutually exclusive modes, selected by `RuntimeConfig::loop_trigger`:
// timer (fixed interval), kline (fires on every closed-candle event, subject
// to a cooldown), and event (fires on a volatility-detector trigger, subject
// to the same cooldown). All three share one error-backoff ladder: a failed
// cycle doubles the wait up to `loop_backoff_max_sec`, and a successful cycle
// resets it to one second.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::cycle::{self, CycleDeps};
use crate::market_data::subscriber::StreamEvent;
use crate::types::TriggerMode;
use crate::volatility::VolatilityDetector;

const STAT_PERIOD: Duration = Duration::from_secs(10);

/// Drives cycle invocations for as long as `stop_rx` has not been set, per
/// the configured trigger mode. Runs once and returns if `loop_enable` is
/// false in `deps.config`.
pub async fn run(
    deps: Arc<CycleDeps>,
    mut events: mpsc::Receiver<StreamEvent>,
    mut volatility: VolatilityDetector,
    mut stop_rx: watch::Receiver<bool>,
) {
    if !deps.config.loop_enable {
        info!("loop_enable is false — running a single cycle and exiting");
        run_one(&deps).await;
        return;
    }

    let mode = deps.config.loop_trigger;
    info!(?mode, "trigger engine starting");

    match mode {
        TriggerMode::Timer => run_timer(deps, stop_rx).await,
        TriggerMode::Kline => run_kline(deps, &mut events, &mut stop_rx).await,
        TriggerMode::Event => run_event(deps, &mut events, &mut volatility, &mut stop_rx).await,
    }
}

async fn run_one(deps: &CycleDeps) {
    match cycle::run_cycle(deps).await {
        Ok(outcome) => info!(?outcome, "cycle completed"),
        Err(e) => error!(error = %e, "cycle failed"),
    }
}

/// Fixed-interval mode: invoke a cycle every `loop_interval_sec`, applying
/// the error back-off ladder by stretching the *next* wait on failure.
async fn run_timer(deps: Arc<CycleDeps>, mut stop_rx: watch::Receiver<bool>) {
    let base_interval = Duration::from_secs(deps.config.loop_interval_sec.max(1));
    let backoff_max = Duration::from_secs(deps.config.loop_backoff_max_sec.max(1));
    let mut backoff = Duration::from_secs(1);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(base_interval) => {}
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    info!("timer trigger stopping");
                    return;
                }
            }
        }

        match cycle::run_cycle(&deps).await {
            Ok(outcome) => {
                info!(?outcome, "cycle completed");
                backoff = Duration::from_secs(1);
            }
            Err(e) => {
                error!(error = %e, backoff_sec = backoff.as_secs(), "cycle failed — backing off");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            return;
                        }
                    }
                }
                backoff = (backoff * 2).min(backoff_max);
            }
        }
    }
}

/// Candle-close mode: invoke a cycle on every closed 1m candle, subject to
/// `loop_cooldown_sec` between invocations.
async fn run_kline(
    deps: Arc<CycleDeps>,
    events: &mut mpsc::Receiver<StreamEvent>,
    stop_rx: &mut watch::Receiver<bool>,
) {
    let cooldown = Duration::from_secs(deps.config.loop_cooldown_sec);
    let backoff_max = Duration::from_secs(deps.config.loop_backoff_max_sec.max(1));
    let mut backoff = Duration::from_secs(1);
    let mut last_run: Option<Instant> = None;

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(StreamEvent::Kline(_)) => {
                        if cooldown_elapsed(last_run, cooldown) {
                            backoff = fire(&deps, &mut last_run, backoff, backoff_max, stop_rx).await;
                        }
                    }
                    Some(_) => {}
                    None => {
                        warn!("event channel closed — kline trigger stopping");
                        return;
                    }
                }
            }
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    info!("kline trigger stopping");
                    return;
                }
            }
        }
    }
}

/// Volatility-event mode: invoke a cycle whenever the detector fires on an
/// incoming mark price or closed candle, subject to the same cooldown. Every
/// `STAT_PERIOD` logs a `{mark, kline, queue_depth}` counts summary.
async fn run_event(
    deps: Arc<CycleDeps>,
    events: &mut mpsc::Receiver<StreamEvent>,
    volatility: &mut VolatilityDetector,
    stop_rx: &mut watch::Receiver<bool>,
) {
    let cooldown = Duration::from_secs(deps.config.loop_cooldown_sec);
    let backoff_max = Duration::from_secs(deps.config.loop_backoff_max_sec.max(1));
    let mut backoff = Duration::from_secs(1);
    let mut last_run: Option<Instant> = None;

    let mut mark_count: u64 = 0;
    let mut kline_count: u64 = 0;
    let mut stat_interval = tokio::time::interval(STAT_PERIOD);
    stat_interval.tick().await; // first tick fires immediately; discard

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(StreamEvent::Mark { ts_ms, price }) => {
                        mark_count += 1;
                        let diag = volatility.evaluate_mark_price(ts_ms, price);
                        if diag.fired && cooldown_elapsed(last_run, cooldown) {
                            backoff = fire(&deps, &mut last_run, backoff, backoff_max, stop_rx).await;
                        }
                    }
                    Some(StreamEvent::Kline(candle)) => {
                        kline_count += 1;
                        let diag = volatility.evaluate_candle(&candle);
                        if diag.fired && cooldown_elapsed(last_run, cooldown) {
                            backoff = fire(&deps, &mut last_run, backoff, backoff_max, stop_rx).await;
                        }
                    }
                    Some(StreamEvent::User) => {}
                    None => {
                        warn!("event channel closed — event trigger stopping");
                        return;
                    }
                }
            }
            _ = stat_interval.tick() => {
                info!(
                    mark = mark_count,
                    kline = kline_count,
                    queue_depth = events.len(),
                    "event trigger counts"
                );
            }
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    info!("event trigger stopping");
                    return;
                }
            }
        }
    }
}

fn cooldown_elapsed(last_run: Option<Instant>, cooldown: Duration) -> bool {
    match last_run {
        None => true,
        Some(t) => t.elapsed() >= cooldown,
    }
}

/// Run one cycle, update `last_run`, and return the next backoff value —
/// shared by the kline and event trigger loops.
async fn fire(
    deps: &CycleDeps,
    last_run: &mut Option<Instant>,
    backoff: Duration,
    backoff_max: Duration,
    stop_rx: &mut watch::Receiver<bool>,
) -> Duration {
    *last_run = Some(Instant::now());
    match cycle::run_cycle(deps).await {
        Ok(outcome) => {
            info!(?outcome, "cycle completed");
            Duration::from_secs(1)
        }
        Err(e) => {
            error!(error = %e, backoff_sec = backoff.as_secs(), "cycle failed — backing off");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = stop_rx.changed() => {}
            }
            (backoff * 2).min(backoff_max)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_elapsed_is_true_on_first_run() {
        assert!(cooldown_elapsed(None, Duration::from_secs(30)));
    }

    #[test]
    fn cooldown_elapsed_is_false_immediately_after_a_run() {
        let now = Instant::now();
        assert!(!cooldown_elapsed(Some(now), Duration::from_secs(30)));
    }
}
