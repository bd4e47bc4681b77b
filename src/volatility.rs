// =============================================================================
// Volatility Detector — sliding-window fire/no-fire rules with diagnostics
// =============================================================================

use std::collections::VecDeque;

use tracing::debug;

use crate::stream_cache::ClosedCandle;

/// Why a single evaluation did or did not fire. Surfaces in logs only — not a
/// user-facing error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    Triggered,
    InsufficientSamples,
    DeltaBelowThreshold,
    CandleNotClosed,
    RangeBelowThreshold,
    VolumeHistoryUnavailable,
    VolumeBelowThreshold,
}

impl Reason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Triggered => "triggered",
            Self::InsufficientSamples => "insufficient_samples",
            Self::DeltaBelowThreshold => "delta_below_threshold",
            Self::CandleNotClosed => "candle_not_closed",
            Self::RangeBelowThreshold => "range_below_threshold",
            Self::VolumeHistoryUnavailable => "volume_history_unavailable",
            Self::VolumeBelowThreshold => "volume_below_threshold",
        }
    }
}

/// One evaluation's verdict plus the numeric inputs behind it.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub fired: bool,
    pub reason: Reason,
    pub delta_pct: Option<f64>,
    pub range_pct: Option<f64>,
    pub volume: Option<f64>,
    pub volume_mean: Option<f64>,
}

impl Diagnostic {
    fn no_fire(reason: Reason) -> Self {
        Self {
            fired: false,
            reason,
            delta_pct: None,
            range_pct: None,
            volume: None,
            volume_mean: None,
        }
    }

    fn fire(reason: Reason) -> Self {
        Self { fired: true, ..Self::no_fire(reason) }
    }
}

/// Tunables for the detector (mirrors the `MP_*`/`KLINE_*`/`VOL_*` config
/// keys).
#[derive(Debug, Clone)]
pub struct VolatilityParams {
    pub mp_window_sec: i64,
    pub mp_delta_pct: f64,
    pub kline_range_pct: f64,
    pub vol_lookback: usize,
    pub vol_mult: f64,
    pub use_quote_volume: bool,
}

impl Default for VolatilityParams {
    fn default() -> Self {
        Self {
            mp_window_sec: 60,
            mp_delta_pct: 0.5,
            kline_range_pct: 0.8,
            vol_lookback: 20,
            vol_mult: 2.0,
            use_quote_volume: true,
        }
    }
}

/// Stateful per-symbol detector: a sliding window of recent mark-price
/// samples plus a rolling window of recent candle volumes.
pub struct VolatilityDetector {
    params: VolatilityParams,
    mark_samples: VecDeque<(i64, f64)>,
    volume_history: VecDeque<f64>,
}

impl VolatilityDetector {
    pub fn new(params: VolatilityParams) -> Self {
        Self {
            params,
            mark_samples: VecDeque::new(),
            volume_history: VecDeque::new(),
        }
    }

    /// Evaluate the mark-price rule against a new `(ts_ms, price)` sample.
    pub fn evaluate_mark_price(&mut self, ts_ms: i64, price: f64) -> Diagnostic {
        self.mark_samples.push_back((ts_ms, price));

        let cutoff = ts_ms - self.params.mp_window_sec * 1000;
        while let Some(&(oldest_ts, _)) = self.mark_samples.front() {
            if oldest_ts < cutoff {
                self.mark_samples.pop_front();
            } else {
                break;
            }
        }

        if self.mark_samples.len() < 2 {
            return Diagnostic::no_fire(Reason::InsufficientSamples);
        }

        let p0 = self.mark_samples.front().unwrap().1;
        if p0 == 0.0 {
            return Diagnostic::no_fire(Reason::InsufficientSamples);
        }

        let delta_pct = ((price / p0) - 1.0).abs() * 100.0;
        let mut diag = if delta_pct >= self.params.mp_delta_pct {
            Diagnostic::fire(Reason::Triggered)
        } else {
            Diagnostic::no_fire(Reason::DeltaBelowThreshold)
        };
        diag.delta_pct = Some(delta_pct);

        debug!(
            delta_pct,
            threshold = self.params.mp_delta_pct,
            fired = diag.fired,
            "mark-price volatility evaluation"
        );
        diag
    }

    /// Evaluate the candle rule. Only meaningful for closed candles; the
    /// latest volume is appended to the rolling window *after* the mean is
    /// computed, so the first closed candle never fires on the volume
    /// sub-rule — preserved intentionally.
    pub fn evaluate_candle(&mut self, candle: &ClosedCandle) -> Diagnostic {
        if candle.close == 0.0 {
            return Diagnostic::no_fire(Reason::CandleNotClosed);
        }

        let range_pct = (candle.high - candle.low) / candle.close * 100.0;
        let range_fired = range_pct >= self.params.kline_range_pct;

        let vol = if self.params.use_quote_volume {
            candle.quote_volume
        } else {
            candle.volume
        };

        let (volume_fired, volume_mean) = if self.volume_history.is_empty() {
            (false, None)
        } else {
            let mean: f64 =
                self.volume_history.iter().sum::<f64>() / self.volume_history.len() as f64;
            (mean > 0.0 && vol >= self.params.vol_mult * mean, Some(mean))
        };

        self.volume_history.push_back(vol);
        while self.volume_history.len() > self.params.vol_lookback {
            self.volume_history.pop_front();
        }

        let fired = range_fired || volume_fired;
        let reason = if fired {
            Reason::Triggered
        } else if volume_mean.is_none() {
            Reason::VolumeHistoryUnavailable
        } else if !range_fired {
            Reason::RangeBelowThreshold
        } else {
            Reason::VolumeBelowThreshold
        };

        debug!(
            range_pct,
            vol,
            volume_mean,
            fired,
            reason = reason.as_str(),
            "candle volatility evaluation"
        );

        Diagnostic {
            fired,
            reason,
            delta_pct: None,
            range_pct: Some(range_pct),
            volume: Some(vol),
            volume_mean,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(high: f64, low: f64, close: f64, vol: f64) -> ClosedCandle {
        ClosedCandle {
            open_time: 0,
            close_time: 59_999,
            open: close,
            high,
            low,
            close,
            volume: vol,
            quote_volume: vol,
        }
    }

    #[test]
    fn fewer_than_two_samples_never_fires() {
        let mut det = VolatilityDetector::new(VolatilityParams::default());
        let diag = det.evaluate_mark_price(1000, 3000.0);
        assert!(!diag.fired);
        assert_eq!(diag.reason, Reason::InsufficientSamples);
    }

    #[test]
    fn mark_price_fires_on_sufficient_delta() {
        let mut params = VolatilityParams::default();
        params.mp_delta_pct = 1.0;
        let mut det = VolatilityDetector::new(params);
        det.evaluate_mark_price(0, 3000.0);
        let diag = det.evaluate_mark_price(1000, 3100.0);
        assert!(diag.fired);
    }

    #[test]
    fn old_samples_drop_out_of_window() {
        let mut params = VolatilityParams::default();
        params.mp_window_sec = 5;
        params.mp_delta_pct = 50.0;
        let mut det = VolatilityDetector::new(params);
        det.evaluate_mark_price(0, 1000.0);
        // 10 s later -- the first sample should have fallen out of the window.
        let diag = det.evaluate_mark_price(10_000, 1001.0);
        assert_eq!(diag.reason, Reason::InsufficientSamples);
    }

    #[test]
    fn first_closed_candle_never_fires_on_volume_sub_rule() {
        let mut params = VolatilityParams::default();
        params.kline_range_pct = 1000.0; // make the range rule unreachable
        let mut det = VolatilityDetector::new(params);
        let diag = det.evaluate_candle(&candle(100.0, 99.0, 100.0, 1_000_000.0));
        assert!(!diag.fired);
        assert_eq!(diag.reason, Reason::VolumeHistoryUnavailable);
    }

    #[test]
    fn volume_rule_fires_once_baseline_established() {
        let mut params = VolatilityParams::default();
        params.kline_range_pct = 1000.0;
        params.vol_mult = 2.0;
        let mut det = VolatilityDetector::new(params);
        det.evaluate_candle(&candle(100.0, 99.0, 100.0, 10.0));
        let diag = det.evaluate_candle(&candle(100.0, 99.0, 100.0, 30.0));
        assert!(diag.fired);
        assert_eq!(diag.reason, Reason::Triggered);
    }

    #[test]
    fn avg_vol_zero_or_negative_never_fires_volume_sub_rule() {
        let mut params = VolatilityParams::default();
        params.kline_range_pct = 1000.0;
        let mut det = VolatilityDetector::new(params);
        det.evaluate_candle(&candle(100.0, 99.0, 100.0, 0.0));
        let diag = det.evaluate_candle(&candle(100.0, 99.0, 100.0, 50.0));
        assert!(!diag.fired);
    }

    #[test]
    fn range_rule_fires_independently_of_volume() {
        let mut params = VolatilityParams::default();
        params.kline_range_pct = 0.5;
        let mut det = VolatilityDetector::new(params);
        let diag = det.evaluate_candle(&candle(101.0, 99.0, 100.0, 1.0));
        assert!(diag.fired);
    }
}
