// =============================================================================
// Paper exchange — simulates fills locally against the same trait surface
// =============================================================================
//
// Selected when `dry_run` is set: no network calls, no credentials.
// Market orders fill instantly at the last known mark price and feed a
// synthetic `ORDER_TRADE_UPDATE` straight into the shared Order Store, so the
// Trading Cycle's wait-for-terminal path behaves identically to the live
// client without a 30 s timeout on every entry. Resting order types (limit,
// stop, take-profit, trailing-stop) are recorded as open and left unfilled --
// the cycle never waits on them.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::market_data::Candle;
use crate::order_store::OrderStore;
use crate::types::{OrderStatus, OrderType, PositionSide, Side};

use super::{
    AccountInfo, ExchangeClient, MarginMode, OrderAck, OrderBookSnapshot, OrderRequest, Position,
    SymbolFilter,
};

#[derive(Debug, Clone)]
struct PaperOrder {
    symbol: String,
    side: Side,
    position_side: Option<PositionSide>,
    order_type: OrderType,
    status: OrderStatus,
    quantity: f64,
    executed_qty: f64,
    avg_price: Option<f64>,
}

/// In-memory exchange simulator. One instance per process, scoped to a single
/// symbol like the rest of the pipeline.
pub struct PaperExchangeClient {
    symbol: String,
    filter: SymbolFilter,
    hedge_mode: bool,
    order_store: Arc<OrderStore>,
    mark_price: Mutex<f64>,
    balance: Mutex<AccountInfo>,
    positions: Mutex<HashMap<PositionSide, Position>>,
    orders: Mutex<HashMap<i64, PaperOrder>>,
    next_order_id: AtomicI64,
}

impl PaperExchangeClient {
    pub fn new(symbol: impl Into<String>, hedge_mode: bool, order_store: Arc<OrderStore>) -> Self {
        Self {
            symbol: symbol.into(),
            filter: SymbolFilter {
                price_precision: 2,
                quantity_precision: 3,
                tick_size: 0.01,
                step_size: 0.001,
                min_notional: 5.0,
            },
            hedge_mode,
            order_store,
            mark_price: Mutex::new(0.0),
            balance: Mutex::new(AccountInfo {
                total_wallet_balance: 10_000.0,
                available_balance: 10_000.0,
            }),
            positions: Mutex::new(HashMap::new()),
            orders: Mutex::new(HashMap::new()),
            next_order_id: AtomicI64::new(1),
        }
    }

    /// Feed the simulator the latest mark price seen by the Stream Cache.
    /// Not part of the trait -- called directly by the wiring that owns both
    /// the cache and this client.
    pub fn update_mark_price(&self, price: f64) {
        *self.mark_price.lock() = price;
    }

    fn current_mark(&self) -> f64 {
        *self.mark_price.lock()
    }

    /// Apply a filled quantity to the simulated position book. `reduce_only`
    /// orders only ever shrink the opposing side; entries grow the side the
    /// order's `side` implies.
    fn apply_fill(&self, side: Side, position_side: Option<PositionSide>, qty: f64, price: f64) {
        let affected = position_side.unwrap_or(match side {
            Side::Buy => PositionSide::Long,
            Side::Sell => PositionSide::Short,
        });
        let closing_side = match side {
            Side::Buy => PositionSide::Short,
            Side::Sell => PositionSide::Long,
        };

        let mut positions = self.positions.lock();

        // A buy reduces an existing short (or the net book in one-way mode);
        // a sell reduces an existing long. Only fall through to opening/adding
        // on the same side once the opposing side has nothing left to close.
        let target_for_close = if self.hedge_mode { closing_side } else { affected };
        let remaining = {
            let entry = positions.entry(target_for_close).or_insert_with(|| {
                new_position(&self.symbol, target_for_close, self.hedge_mode_leverage())
            });
            if entry.quantity > 0.0 {
                let closed = qty.min(entry.quantity);
                entry.quantity -= closed;
                qty - closed
            } else {
                qty
            }
        };

        if remaining > 0.0 {
            let entry = positions
                .entry(affected)
                .or_insert_with(|| new_position(&self.symbol, affected, self.hedge_mode_leverage()));
            let prior_notional = entry.quantity * entry.entry_price;
            entry.quantity += remaining;
            entry.entry_price = if entry.quantity > 0.0 {
                (prior_notional + remaining * price) / entry.quantity
            } else {
                price
            };
        }
    }

    fn hedge_mode_leverage(&self) -> u32 {
        20
    }

    fn next_id(&self) -> i64 {
        self.next_order_id.fetch_add(1, Ordering::SeqCst)
    }

    fn synthetic_trade_update(&self, order_id: i64, order: &PaperOrder) -> serde_json::Value {
        serde_json::json!({
            "e": "ORDER_TRADE_UPDATE",
            "E": 0,
            "o": {
                "s": order.symbol,
                "i": order_id,
                "S": order.side.as_str(),
                "X": order.status.as_str(),
                "ot": order.order_type.as_str(),
                "z": order.executed_qty.to_string(),
                "q": order.quantity.to_string(),
                "ap": order.avg_price.map(|p| p.to_string()),
                "L": order.avg_price.map(|p| p.to_string()),
                "l": order.executed_qty.to_string(),
                "ps": order.position_side.map(PositionSide::as_str),
            }
        })
    }
}

fn new_position(symbol: &str, side: PositionSide, leverage: u32) -> Position {
    Position {
        symbol: symbol.to_string(),
        side,
        quantity: 0.0,
        entry_price: 0.0,
        unrealized_pnl: 0.0,
        liquidation_price: None,
        break_even_price: 0.0,
        margin_mode: MarginMode::Cross,
        leverage,
    }
}

#[async_trait]
impl ExchangeClient for PaperExchangeClient {
    async fn exchange_info(&self, _symbol: &str) -> anyhow::Result<SymbolFilter> {
        Ok(self.filter.clone())
    }

    async fn position_mode(&self) -> anyhow::Result<bool> {
        Ok(self.hedge_mode)
    }

    async fn account(&self) -> anyhow::Result<AccountInfo> {
        Ok(self.balance.lock().clone())
    }

    async fn position_information(&self, symbol: &str) -> anyhow::Result<Vec<Position>> {
        Ok(self
            .positions
            .lock()
            .values()
            .filter(|p| p.symbol == symbol && p.quantity > 0.0)
            .cloned()
            .collect())
    }

    async fn open_orders(&self, symbol: &str) -> anyhow::Result<Vec<OrderAck>> {
        Ok(self
            .orders
            .lock()
            .iter()
            .filter(|(_, o)| o.symbol == symbol && !o.status.is_terminal())
            .map(|(id, o)| OrderAck {
                order_id: *id,
                symbol: o.symbol.clone(),
                status: o.status,
                executed_qty: o.executed_qty,
                avg_price: o.avg_price,
            })
            .collect())
    }

    async fn create_order(&self, req: OrderRequest) -> anyhow::Result<OrderAck> {
        let order_id = self.next_id();
        let price = self.current_mark();
        let quantity = req.quantity.unwrap_or(0.0);

        let fills_immediately = matches!(req.order_type, OrderType::Market);

        let mut order = PaperOrder {
            symbol: req.symbol.clone(),
            side: req.side,
            position_side: req.position_side,
            order_type: req.order_type.clone(),
            status: OrderStatus::New,
            quantity,
            executed_qty: 0.0,
            avg_price: None,
        };

        if fills_immediately && quantity > 0.0 {
            order.status = OrderStatus::Filled;
            order.executed_qty = quantity;
            order.avg_price = Some(req.price.unwrap_or(price));
            self.apply_fill(req.side, req.position_side, quantity, order.avg_price.unwrap_or(price));
        }

        self.orders.lock().insert(order_id, order.clone());
        self.order_store
            .apply_event(&self.synthetic_trade_update(order_id, &order));

        info!(
            order_id,
            symbol = %req.symbol,
            side = %req.side,
            order_type = %order.order_type,
            quantity,
            status = %order.status,
            "paper order simulated"
        );

        Ok(OrderAck {
            order_id,
            symbol: req.symbol,
            status: order.status,
            executed_qty: order.executed_qty,
            avg_price: order.avg_price,
        })
    }

    async fn cancel_order(&self, _symbol: &str, order_id: i64) -> anyhow::Result<()> {
        let mut orders = self.orders.lock();
        if let Some(order) = orders.get_mut(&order_id) {
            if !order.status.is_terminal() {
                order.status = OrderStatus::Canceled;
                let snapshot = order.clone();
                drop(orders);
                self.order_store
                    .apply_event(&self.synthetic_trade_update(order_id, &snapshot));
                debug!(order_id, "paper order canceled");
            }
        }
        Ok(())
    }

    async fn get_order(&self, symbol: &str, order_id: i64) -> anyhow::Result<OrderAck> {
        let orders = self.orders.lock();
        let order = orders
            .get(&order_id)
            .ok_or_else(|| anyhow::anyhow!("paper order {order_id} not found"))?;
        Ok(OrderAck {
            order_id,
            symbol: symbol.to_string(),
            status: order.status,
            executed_qty: order.executed_qty,
            avg_price: order.avg_price,
        })
    }

    async fn change_leverage(&self, _symbol: &str, _leverage: u32) -> anyhow::Result<()> {
        Ok(())
    }

    async fn mark_price(&self, _symbol: &str) -> anyhow::Result<f64> {
        Ok(self.current_mark())
    }

    async fn premium_index(&self, _symbol: &str) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::json!({ "markPrice": self.current_mark(), "lastFundingRate": "0" }))
    }

    async fn funding_rate(&self, _symbol: &str) -> anyhow::Result<(f64, i64)> {
        Ok((0.0, 0))
    }

    async fn open_interest(&self, _symbol: &str) -> anyhow::Result<f64> {
        Ok(0.0)
    }

    async fn open_interest_hist(
        &self,
        _symbol: &str,
        _period: &str,
        _limit: u32,
    ) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::json!([]))
    }

    async fn global_long_short_account_ratio(
        &self,
        _symbol: &str,
        _period: &str,
    ) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::json!([]))
    }

    async fn order_book(&self, _symbol: &str, _limit: u32) -> anyhow::Result<OrderBookSnapshot> {
        let mid = self.current_mark();
        let half_spread = self.filter.tick_size.max(0.01);
        Ok(OrderBookSnapshot {
            best_bid: mid - half_spread,
            best_ask: mid + half_spread,
            bid_depth: 10.0,
            ask_depth: 10.0,
        })
    }

    async fn klines(&self, _symbol: &str, _interval: &str, _limit: u32) -> anyhow::Result<Vec<Candle>> {
        Ok(Vec::new())
    }

    async fn ticker_24hr(&self, _symbol: &str) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::json!({ "lastPrice": self.current_mark().to_string() }))
    }

    async fn create_listen_key(&self) -> anyhow::Result<String> {
        Ok("paper-listen-key".to_string())
    }

    async fn keepalive_listen_key(&self, _key: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close_listen_key(&self, _key: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn client() -> PaperExchangeClient {
        PaperExchangeClient::new("ETHUSDT", false, Arc::new(OrderStore::new()))
    }

    #[tokio::test]
    async fn market_order_fills_instantly_and_updates_position() {
        let client = client();
        client.update_mark_price(3000.0);

        let ack = client
            .create_order(OrderRequest::market("ETHUSDT", Side::Buy, 0.1))
            .await
            .unwrap();

        assert_eq!(ack.status, OrderStatus::Filled);
        assert_eq!(ack.executed_qty, 0.1);

        let positions = client.position_information("ETHUSDT").await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, PositionSide::Long);
        assert!((positions[0].quantity - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn reduce_only_sell_closes_long_position() {
        let client = client();
        client.update_mark_price(3000.0);

        client
            .create_order(OrderRequest::market("ETHUSDT", Side::Buy, 0.2))
            .await
            .unwrap();

        let mut close = OrderRequest::market("ETHUSDT", Side::Sell, 0.2);
        close.reduce_only = true;
        client.create_order(close).await.unwrap();

        let positions = client.position_information("ETHUSDT").await.unwrap();
        assert!(positions.is_empty());
    }

    #[tokio::test]
    async fn limit_order_rests_unfilled() {
        let client = client();
        client.update_mark_price(3000.0);

        let mut req = OrderRequest::market("ETHUSDT", Side::Sell, 0.05);
        req.order_type = OrderType::Limit;
        req.price = Some(3100.0);
        req.reduce_only = true;

        let ack = client.create_order(req).await.unwrap();
        assert_eq!(ack.status, OrderStatus::New);
        assert_eq!(ack.executed_qty, 0.0);
    }

    #[tokio::test]
    async fn cancel_order_marks_terminal() {
        let client = client();
        let mut req = OrderRequest::market("ETHUSDT", Side::Sell, 0.05);
        req.order_type = OrderType::Limit;
        req.price = Some(3100.0);
        let ack = client.create_order(req).await.unwrap();

        client.cancel_order("ETHUSDT", ack.order_id).await.unwrap();
        let fetched = client.get_order("ETHUSDT", ack.order_id).await.unwrap();
        assert_eq!(fetched.status, OrderStatus::Canceled);
    }
}
