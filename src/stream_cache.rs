// =============================================================================
// Stream Cache — latest mark price, last closed candle, per-order last event
// =============================================================================
//
// Single mutex guards every mutator and accessor. Passed as one long-lived
// `Arc` from startup to both the subscriber and the trigger loop/cycle — no
// process-wide global state.
// =============================================================================

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// A single closed 1-minute candle as reported by the kline stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClosedCandle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
}

#[derive(Default)]
struct CacheState {
    mark_price: Option<f64>,
    last_mark_ts: i64,
    last_kline_close: Option<ClosedCandle>,
    last_kline_ts: i64,
}

/// Consistent, shallow-copyable view of the cache at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub symbol: String,
    pub mark_price: Option<f64>,
    pub last_mark_ts: i64,
    pub last_kline_close: Option<ClosedCandle>,
}

impl CacheSnapshot {
    /// A cycle must not run until both a mark price and a closed candle
    /// have been observed.
    pub fn is_primed(&self) -> bool {
        self.mark_price.is_some() && self.last_kline_close.is_some() && self.last_mark_ts > 0
    }
}

/// Thread-safe cache of the latest market view for one configured symbol.
pub struct StreamCache {
    symbol: String,
    state: Mutex<CacheState>,
}

impl StreamCache {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Record a mark-price update. Out-of-order events (older `event_time_ms`
    /// than the one already cached) are dropped silently -- cache timestamps
    /// are monotonic per stream.
    pub fn set_mark(&self, price: f64, event_time_ms: i64) {
        let mut s = self.state.lock();
        if event_time_ms < s.last_mark_ts {
            trace!(event_time_ms, cached_ts = s.last_mark_ts, "dropping out-of-order mark price");
            return;
        }
        s.mark_price = Some(price);
        s.last_mark_ts = event_time_ms;
    }

    /// Record a closed candle. Same out-of-order drop rule as `set_mark`.
    pub fn set_kline_close(&self, candle: ClosedCandle, event_time_ms: i64) {
        let mut s = self.state.lock();
        if event_time_ms < s.last_kline_ts {
            trace!(event_time_ms, cached_ts = s.last_kline_ts, "dropping out-of-order candle close");
            return;
        }
        s.last_kline_close = Some(candle);
        s.last_kline_ts = event_time_ms;
    }

    /// Return a consistent, independent shallow copy of the cache.
    pub fn snapshot(&self) -> CacheSnapshot {
        let s = self.state.lock();
        CacheSnapshot {
            symbol: self.symbol.clone(),
            mark_price: s.mark_price,
            last_mark_ts: s.last_mark_ts,
            last_kline_close: s.last_kline_close.clone(),
        }
    }
}

/// Unwrap a stream frame that may be combined-stream-wrapped
/// (`{"stream": "...", "data": {...}}`) or a flat single-stream payload
/// (`{"e": "...", ...}`). Returns the inner payload either way.
pub fn unwrap_frame(raw: &serde_json::Value) -> &serde_json::Value {
    if raw.get("data").is_some() && raw.get("stream").is_some() {
        &raw["data"]
    } else {
        raw
    }
}

/// Extract `(symbol, event_time_ms, mark_price)` from an unwrapped mark-price
/// frame, tolerating both the regular (`markPrice`) and fast
/// (`markPriceUpdate`) stream field names.
pub fn parse_mark_price_frame(data: &serde_json::Value) -> Option<(String, i64, f64)> {
    let symbol = data
        .get("s")
        .or_else(|| data.get("symbol"))
        .and_then(|v| v.as_str())?
        .to_uppercase();
    let event_time_ms = data.get("E").and_then(|v| v.as_i64()).unwrap_or(0);
    let price = data
        .get("p")
        .or_else(|| data.get("markPrice"))
        .and_then(|v| {
            v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        })?;
    Some((symbol, event_time_ms, price))
}

/// Extract `(symbol, event_time_ms, candle)` from an unwrapped kline frame,
/// returning `None` for any interval other than "1m" or any still-open
/// candle. Handles the `continuous_kline` event shape, whose symbol lives
/// under `ps` (pair symbol) instead of `s`.
pub fn parse_kline_frame(data: &serde_json::Value) -> Option<(String, i64, ClosedCandle)> {
    let event_type = data.get("e").and_then(|v| v.as_str()).unwrap_or_default();

    let symbol = if event_type == "continuous_kline" {
        data.get("ps").and_then(|v| v.as_str())
    } else {
        data.get("s").and_then(|v| v.as_str())
    }?
    .to_uppercase();

    let k = data.get("k")?;
    let interval = k.get("i").and_then(|v| v.as_str()).unwrap_or_default();
    let is_closed = k.get("x").and_then(|v| v.as_bool()).unwrap_or(false);
    if interval != "1m" || !is_closed {
        return None;
    }

    let event_time_ms = data.get("E").and_then(|v| v.as_i64()).unwrap_or(0);

    let candle = ClosedCandle {
        open_time: k.get("t").and_then(|v| v.as_i64())?,
        close_time: k.get("T").and_then(|v| v.as_i64())?,
        open: parse_num(k.get("o")?)?,
        high: parse_num(k.get("h")?)?,
        low: parse_num(k.get("l")?)?,
        close: parse_num(k.get("c")?)?,
        volume: parse_num(k.get("v")?)?,
        quote_volume: parse_num(k.get("q")?)?,
    };

    Some((symbol, event_time_ms, candle))
}

fn parse_num(v: &serde_json::Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64) -> ClosedCandle {
        ClosedCandle {
            open_time: 0,
            close_time: 59_999,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
            quote_volume: 100.0,
        }
    }

    #[test]
    fn snapshot_unprimed_until_both_mark_and_candle_seen() {
        let cache = StreamCache::new("ETHUSDT");
        assert!(!cache.snapshot().is_primed());
        cache.set_mark(3000.0, 1000);
        assert!(!cache.snapshot().is_primed());
        cache.set_kline_close(candle(3000.0), 1000);
        assert!(cache.snapshot().is_primed());
    }

    #[test]
    fn out_of_order_mark_price_is_dropped() {
        let cache = StreamCache::new("ETHUSDT");
        cache.set_mark(3000.0, 2000);
        cache.set_mark(2900.0, 1000); // older timestamp — dropped
        let snap = cache.snapshot();
        assert_eq!(snap.mark_price, Some(3000.0));
        assert_eq!(snap.last_mark_ts, 2000);
    }

    #[test]
    fn snapshot_is_independent_copy() {
        let cache = StreamCache::new("ETHUSDT");
        cache.set_mark(100.0, 1);
        let first = cache.snapshot();
        cache.set_mark(200.0, 2);
        assert_eq!(first.mark_price, Some(100.0));
        assert_eq!(cache.snapshot().mark_price, Some(200.0));
    }

    #[test]
    fn unwrap_frame_handles_both_shapes() {
        let wrapped = serde_json::json!({"stream": "ethusdt@markPrice", "data": {"e": "markPriceUpdate"}});
        assert_eq!(unwrap_frame(&wrapped)["e"], "markPriceUpdate");

        let flat = serde_json::json!({"e": "markPriceUpdate"});
        assert_eq!(unwrap_frame(&flat)["e"], "markPriceUpdate");
    }

    #[test]
    fn parse_kline_frame_ignores_open_candle_and_wrong_interval() {
        let open_candle = serde_json::json!({
            "e": "kline", "s": "ETHUSDT",
            "k": {"t": 0, "T": 59999, "i": "1m", "o": "1", "h": "2", "l": "0", "c": "1.5", "v": "1", "q": "1", "x": false}
        });
        assert!(parse_kline_frame(&open_candle).is_none());

        let wrong_interval = serde_json::json!({
            "e": "kline", "s": "ETHUSDT",
            "k": {"t": 0, "T": 299999, "i": "5m", "o": "1", "h": "2", "l": "0", "c": "1.5", "v": "1", "q": "1", "x": true}
        });
        assert!(parse_kline_frame(&wrong_interval).is_none());
    }

    #[test]
    fn parse_kline_frame_accepts_closed_1m_and_continuous_variant() {
        let closed = serde_json::json!({
            "e": "kline", "s": "ETHUSDT", "E": 123,
            "k": {"t": 0, "T": 59999, "i": "1m", "o": "1", "h": "2", "l": "0", "c": "1.5", "v": "10", "q": "20", "x": true}
        });
        let (symbol, ts, candle) = parse_kline_frame(&closed).unwrap();
        assert_eq!(symbol, "ETHUSDT");
        assert_eq!(ts, 123);
        assert_eq!(candle.close, 1.5);

        let continuous = serde_json::json!({
            "e": "continuous_kline", "ps": "ETHUSDT",
            "k": {"t": 0, "T": 59999, "i": "1m", "o": "1", "h": "2", "l": "0", "c": "1.5", "v": "10", "q": "20", "x": true}
        });
        assert!(parse_kline_frame(&continuous).is_some());
    }

    #[test]
    fn cross_symbol_frame_is_ignored_by_caller_via_symbol_mismatch() {
        let frame = serde_json::json!({
            "e": "markPriceUpdate", "s": "BTCUSDT", "E": 1, "p": "50000"
        });
        let (symbol, _, _) = parse_mark_price_frame(&frame).unwrap();
        assert_ne!(symbol, "ETHUSDT");
    }
}
