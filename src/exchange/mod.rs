// =============================================================================
// Exchange trait — one explicit interface, two implementations (live, paper)
// =============================================================================
//
// No runtime reflection over method signatures to paper over API drift:
// the surface is a single typed trait and version drift is a client
// concern, not a call-site concern.
// =============================================================================

pub mod binance;
pub mod paper;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::market_data::Candle;
use crate::types::{OrderStatus, OrderType, PositionSide, Side};

/// Per-symbol precision/notional constraints.
/// Immutable per cycle; used to snap prices and quantities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolFilter {
    pub price_precision: u32,
    pub quantity_precision: u32,
    pub tick_size: f64,
    pub step_size: f64,
    pub min_notional: f64,
}

impl SymbolFilter {
    /// Round `price` down to the nearest multiple of `tick_size`.
    pub fn snap_price(&self, price: f64) -> f64 {
        snap(price, self.tick_size)
    }

    /// Round `qty` down to the nearest multiple of `step_size`.
    pub fn snap_qty(&self, qty: f64) -> f64 {
        snap(qty, self.step_size)
    }
}

fn snap(value: f64, increment: f64) -> f64 {
    if increment <= 0.0 {
        return value;
    }
    (value / increment).floor() * increment
}

/// Margin mode for a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    Isolated,
    Cross,
}

/// An open position for one symbol/side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    /// `None` when the venue reports its `0.0`/absent "not applicable"
    /// sentinel.
    pub liquidation_price: Option<f64>,
    pub break_even_price: f64,
    pub margin_mode: MarginMode,
    pub leverage: u32,
}

/// Parameters for a new order (covers market/limit entries and the
/// protective-order family).
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub position_side: Option<PositionSide>,
    pub order_type: OrderType,
    pub quantity: Option<f64>,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub reduce_only: bool,
    pub close_position: bool,
    pub time_in_force: Option<String>,
    /// `MARK_PRICE` or `CONTRACT_PRICE`, for stop/take-profit/trailing orders.
    pub working_type: Option<String>,
    pub activation_price: Option<f64>,
    pub callback_rate: Option<f64>,
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, side: Side, quantity: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            position_side: None,
            order_type: OrderType::Market,
            quantity: Some(quantity),
            price: None,
            stop_price: None,
            reduce_only: false,
            close_position: false,
            time_in_force: None,
            working_type: None,
            activation_price: None,
            callback_rate: None,
            client_order_id: None,
        }
    }
}

/// Minimal view of an order acknowledgment/poll response, already parsed
/// into the closed-set types used by the Order Store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: i64,
    pub symbol: String,
    pub status: OrderStatus,
    pub executed_qty: f64,
    pub avg_price: Option<f64>,
}

/// Top-of-book snapshot for the market-snapshot's spread/imbalance fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub best_bid: f64,
    pub best_ask: f64,
    pub bid_depth: f64,
    pub ask_depth: f64,
}

impl OrderBookSnapshot {
    pub fn spread_bps(&self) -> f64 {
        let mid = (self.best_bid + self.best_ask) / 2.0;
        if mid > 0.0 {
            (self.best_ask - self.best_bid) / mid * 10_000.0
        } else {
            0.0
        }
    }

    pub fn imbalance(&self) -> f64 {
        let total = self.bid_depth + self.ask_depth;
        if total > 0.0 {
            (self.bid_depth - self.ask_depth) / total
        } else {
            0.0
        }
    }
}

/// Account-level snapshot (equity, per-symbol leverage lives on `Position`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub total_wallet_balance: f64,
    pub available_balance: f64,
}

/// The full set of REST operations the cycle and ambient workers rely on.
/// A `live` implementation talks to the real venue; a `paper` implementation
/// simulates fills locally. No runtime introspection: either implementation
/// satisfies this trait completely and explicitly.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn exchange_info(&self, symbol: &str) -> anyhow::Result<SymbolFilter>;
    async fn position_mode(&self) -> anyhow::Result<bool>;
    async fn account(&self) -> anyhow::Result<AccountInfo>;
    async fn position_information(&self, symbol: &str) -> anyhow::Result<Vec<Position>>;
    async fn open_orders(&self, symbol: &str) -> anyhow::Result<Vec<OrderAck>>;
    async fn create_order(&self, req: OrderRequest) -> anyhow::Result<OrderAck>;
    async fn cancel_order(&self, symbol: &str, order_id: i64) -> anyhow::Result<()>;
    async fn get_order(&self, symbol: &str, order_id: i64) -> anyhow::Result<OrderAck>;
    async fn change_leverage(&self, symbol: &str, leverage: u32) -> anyhow::Result<()>;
    async fn mark_price(&self, symbol: &str) -> anyhow::Result<f64>;
    async fn premium_index(&self, symbol: &str) -> anyhow::Result<serde_json::Value>;
    async fn funding_rate(&self, symbol: &str) -> anyhow::Result<(f64, i64)>;
    async fn open_interest(&self, symbol: &str) -> anyhow::Result<f64>;
    async fn open_interest_hist(
        &self,
        symbol: &str,
        period: &str,
        limit: u32,
    ) -> anyhow::Result<serde_json::Value>;
    async fn global_long_short_account_ratio(
        &self,
        symbol: &str,
        period: &str,
    ) -> anyhow::Result<serde_json::Value>;
    async fn order_book(&self, symbol: &str, limit: u32) -> anyhow::Result<OrderBookSnapshot>;
    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> anyhow::Result<Vec<Candle>>;
    async fn ticker_24hr(&self, symbol: &str) -> anyhow::Result<serde_json::Value>;
    async fn create_listen_key(&self) -> anyhow::Result<String>;
    async fn keepalive_listen_key(&self, key: &str) -> anyhow::Result<()>;
    async fn close_listen_key(&self, key: &str) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snap_rounds_down_to_increment() {
        let filter = SymbolFilter {
            price_precision: 2,
            quantity_precision: 3,
            tick_size: 0.01,
            step_size: 0.001,
            min_notional: 5.0,
        };
        assert!((filter.snap_price(3000.567) - 3000.56).abs() < 1e-9);
        assert!((filter.snap_qty(0.1234) - 0.123).abs() < 1e-9);
    }

    #[test]
    fn order_book_spread_and_imbalance_handle_empty_book() {
        let book = OrderBookSnapshot {
            best_bid: 0.0,
            best_ask: 0.0,
            bid_depth: 0.0,
            ask_depth: 0.0,
        };
        assert_eq!(book.spread_bps(), 0.0);
        assert_eq!(book.imbalance(), 0.0);
    }

    #[test]
    fn order_book_imbalance_favors_heavier_side() {
        let book = OrderBookSnapshot {
            best_bid: 100.0,
            best_ask: 100.1,
            bid_depth: 30.0,
            ask_depth: 10.0,
        };
        assert!(book.imbalance() > 0.0);
    }
}
