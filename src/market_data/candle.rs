// =============================================================================
// Candle — OHLCV row shared by the exchange trait and the Stream Cache
// =============================================================================

use serde::{Deserialize, Serialize};

/// A single OHLCV candle, as returned by either the REST `/klines` endpoint
/// or the WebSocket kline stream (which carries a few extra fields).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trades_count: u64,
    pub taker_buy_volume: f64,
    pub taker_buy_quote_volume: f64,
    pub is_closed: bool,
}

impl Candle {
    /// Build a closed candle from a REST `/klines` row, which carries fewer
    /// fields than the WebSocket kline payload.
    pub fn new(
        open_time: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        close_time: i64,
    ) -> Self {
        Self {
            open_time,
            close_time,
            open,
            high,
            low,
            close,
            volume,
            quote_volume: 0.0,
            trades_count: 0,
            taker_buy_volume: 0.0,
            taker_buy_quote_volume: 0.0,
            is_closed: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_marks_rest_candle_closed_with_zeroed_extras() {
        let c = Candle::new(0, 1.0, 2.0, 0.5, 1.5, 10.0, 59_999);
        assert!(c.is_closed);
        assert_eq!(c.quote_volume, 0.0);
        assert_eq!(c.trades_count, 0);
    }
}
