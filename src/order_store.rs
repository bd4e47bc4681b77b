// =============================================================================
// Order Store — tracker registry keyed by exchange order id
// =============================================================================
//
// Mirrors the Binance `ORDER_TRADE_UPDATE` payload shape: the merge only
// applies fields actually present on the event, so a partial update never
// clobbers a field the previous update already set.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::types::{OrderStatus, OrderType, PositionSide, Side};

/// Mutable state for a single outgoing order, keyed by exchange order id.
pub struct OrderTracker {
    pub symbol: String,
    pub order_id: i64,
    inner: Mutex<TrackerFields>,
    /// One-shot completion signal; fired exactly once, on first terminal
    /// transition, and never reset.
    completion: Notify,
}

#[derive(Debug, Clone, Default)]
struct TrackerFields {
    side: Option<Side>,
    position_side: Option<PositionSide>,
    status: Option<OrderStatus>,
    order_type: Option<OrderType>,
    reduce_only: Option<bool>,
    price: Option<f64>,
    stop_price: Option<f64>,
    quantity: Option<f64>,
    executed_qty: f64,
    last_fill_qty: f64,
    avg_price: Option<f64>,
    last_fill_price: Option<f64>,
    update_time: Option<i64>,
    terminal_signaled: bool,
}

/// Point-in-time, read-only copy of a tracker's fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub symbol: String,
    pub order_id: i64,
    pub side: Option<Side>,
    pub position_side: Option<PositionSide>,
    pub status: Option<OrderStatus>,
    pub order_type: Option<OrderType>,
    pub reduce_only: Option<bool>,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub quantity: Option<f64>,
    pub executed_qty: f64,
    pub last_fill_qty: f64,
    pub avg_price: Option<f64>,
    pub last_fill_price: Option<f64>,
    pub update_time: Option<i64>,
}

/// Parameters accepted by [`OrderStore::register`]; all optional fields may
/// be filled in later by inbound events.
#[derive(Debug, Clone, Default)]
pub struct RegisterParams {
    pub order_type: Option<OrderType>,
    pub reduce_only: Option<bool>,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub quantity: Option<f64>,
}

impl OrderTracker {
    fn new(symbol: impl Into<String>, order_id: i64) -> Self {
        Self {
            symbol: symbol.into(),
            order_id,
            inner: Mutex::new(TrackerFields::default()),
            completion: Notify::new(),
        }
    }

    fn new_registered(
        symbol: impl Into<String>,
        order_id: i64,
        side: Side,
        position_side: Option<PositionSide>,
        params: RegisterParams,
    ) -> Self {
        let tracker = Self::new(symbol, order_id);
        {
            let mut f = tracker.inner.lock();
            f.side = Some(side);
            f.position_side = position_side;
            f.order_type = params.order_type;
            f.reduce_only = params.reduce_only;
            f.price = params.price;
            f.stop_price = params.stop_price;
            f.quantity = params.quantity;
            f.status = Some(OrderStatus::New);
        }
        tracker
    }

    pub fn snapshot(&self) -> OrderSnapshot {
        let f = self.inner.lock();
        OrderSnapshot {
            symbol: self.symbol.clone(),
            order_id: self.order_id,
            side: f.side,
            position_side: f.position_side,
            status: f.status,
            order_type: f.order_type.clone(),
            reduce_only: f.reduce_only,
            price: f.price,
            stop_price: f.stop_price,
            quantity: f.quantity,
            executed_qty: f.executed_qty,
            last_fill_qty: f.last_fill_qty,
            avg_price: f.avg_price,
            last_fill_price: f.last_fill_price,
            update_time: f.update_time,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.inner
            .lock()
            .status
            .map(OrderStatus::is_terminal)
            .unwrap_or(false)
    }

    /// Fill in order-placement fields the caller knows but a prior on-demand
    /// creation (from an inbound event that beat local `register`) could not
    /// have recorded -- e.g. `reduce_only`, which the venue's own event may
    /// omit. Never overwrites a field an event has already set.
    fn backfill_register_params(&self, params: RegisterParams) {
        let mut f = self.inner.lock();
        if f.order_type.is_none() {
            f.order_type = params.order_type;
        }
        if f.reduce_only.is_none() {
            f.reduce_only = params.reduce_only;
        }
        if f.price.is_none() {
            f.price = params.price;
        }
        if f.stop_price.is_none() {
            f.stop_price = params.stop_price;
        }
        if f.quantity.is_none() {
            f.quantity = params.quantity;
        }
    }

    /// Merge the fields of an inbound `o` sub-object (plus the envelope's `E`/
    /// `T` for update_time) into this tracker. Only fields present in the
    /// event are applied — absent fields leave the prior value untouched.
    fn merge_o_fields(&self, fields: MergeFields) {
        let mut f = self.inner.lock();

        if let Some(status) = fields.status {
            f.status = Some(status);
        }
        if let Some(side) = fields.side {
            f.side = Some(side);
        }
        if let Some(ps) = fields.position_side {
            f.position_side = Some(ps);
        }
        if let Some(ot) = fields.order_type {
            f.order_type = Some(ot);
        }
        if let Some(p) = fields.price {
            f.price = Some(p);
        }
        if let Some(sp) = fields.stop_price {
            f.stop_price = Some(sp);
        }
        if let Some(q) = fields.quantity {
            f.quantity = Some(q);
        }
        if let Some(z) = fields.executed_qty {
            f.executed_qty = z;
        }
        if let Some(lq) = fields.last_fill_qty {
            f.last_fill_qty = lq;
        }
        if let Some(ap) = fields.avg_price {
            f.avg_price = Some(ap);
        }
        if let Some(lp) = fields.last_fill_price {
            f.last_fill_price = Some(lp);
        }
        if let Some(ro) = fields.reduce_only {
            f.reduce_only = Some(ro);
        }
        if let Some(ts) = fields.update_time {
            f.update_time = Some(ts);
        }

        let now_terminal = f.status.map(OrderStatus::is_terminal).unwrap_or(false);
        let already_signaled = f.terminal_signaled;
        if now_terminal && !already_signaled {
            f.terminal_signaled = true;
            drop(f);
            self.completion.notify_waiters();
            debug!(order_id = self.order_id, "order reached terminal status");
        }
    }
}

/// Fields extracted from a raw user-data-stream `o` object, already parsed
/// from JSON into typed Rust values.
#[derive(Debug, Clone, Default)]
pub struct MergeFields {
    pub symbol: Option<String>,
    pub status: Option<OrderStatus>,
    pub side: Option<Side>,
    pub position_side: Option<PositionSide>,
    pub order_type: Option<OrderType>,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub quantity: Option<f64>,
    pub executed_qty: Option<f64>,
    pub last_fill_qty: Option<f64>,
    pub avg_price: Option<f64>,
    pub last_fill_price: Option<f64>,
    pub reduce_only: Option<bool>,
    pub update_time: Option<i64>,
}

impl MergeFields {
    /// Parse a raw `ORDER_TRADE_UPDATE` event into order id + merge fields.
    /// Returns `None` if the event carries no `o.i` (order id).
    pub fn from_order_trade_update(payload: &serde_json::Value) -> Option<(i64, Self)> {
        let o = payload.get("o")?;
        let order_id = o.get("i")?.as_i64()?;

        let fields = Self {
            symbol: o.get("s").and_then(|v| v.as_str()).map(String::from),
            status: o
                .get("X")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok()),
            side: o
                .get("S")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok()),
            position_side: o
                .get("ps")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok()),
            order_type: o
                .get("ot")
                .or_else(|| o.get("o"))
                .and_then(|v| v.as_str())
                .map(OrderType::from),
            price: parse_f64_field(o, "p"),
            stop_price: parse_f64_field(o, "sp"),
            quantity: parse_f64_field(o, "q"),
            executed_qty: parse_f64_field(o, "z"),
            last_fill_qty: parse_f64_field(o, "l"),
            avg_price: parse_f64_field(o, "ap"),
            last_fill_price: parse_f64_field(o, "L"),
            reduce_only: parse_bool_field(o, "R"),
            update_time: payload
                .get("E")
                .and_then(|v| v.as_i64())
                .or_else(|| payload.get("T").and_then(|v| v.as_i64())),
        };

        Some((order_id, fields))
    }
}

fn parse_f64_field(v: &serde_json::Value, key: &str) -> Option<f64> {
    match v.get(key) {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

fn parse_bool_field(v: &serde_json::Value, key: &str) -> Option<bool> {
    match v.get(key) {
        Some(serde_json::Value::Bool(b)) => Some(*b),
        Some(serde_json::Value::String(s)) => {
            Some(matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        }
        _ => None,
    }
}

/// Thread-safe registry of `OrderTracker`s keyed by exchange order id.
pub struct OrderStore {
    orders: Mutex<HashMap<i64, Arc<OrderTracker>>>,
}

impl OrderStore {
    pub fn new() -> Self {
        Self {
            orders: Mutex::new(HashMap::new()),
        }
    }

    /// Idempotent on order id: if a tracker already exists (e.g. created
    /// on-demand by an inbound event that beat this call), backfills any
    /// placement fields it doesn't have yet and returns it; otherwise
    /// creates and stores a new one.
    pub fn register(
        &self,
        symbol: &str,
        order_id: i64,
        side: Side,
        position_side: Option<PositionSide>,
        params: RegisterParams,
    ) -> Arc<OrderTracker> {
        let mut orders = self.orders.lock();
        if let Some(existing) = orders.get(&order_id) {
            existing.backfill_register_params(params);
            return Arc::clone(existing);
        }
        let tracker = Arc::new(OrderTracker::new_registered(
            symbol,
            order_id,
            side,
            position_side,
            params,
        ));
        orders.insert(order_id, Arc::clone(&tracker));
        tracker
    }

    pub fn get(&self, order_id: i64) -> Option<Arc<OrderTracker>> {
        self.orders.lock().get(&order_id).cloned()
    }

    /// Merge a raw `ORDER_TRADE_UPDATE` payload into the addressed tracker,
    /// creating it on-demand if the event arrived before local registration.
    pub fn apply_event(&self, payload: &serde_json::Value) {
        let etype = payload
            .get("e")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if etype != "ORDER_TRADE_UPDATE" {
            // Including the dead `EXECUTUIONREPORT` typo path upstream never
            // matched a real event and is not reimplemented here.
            return;
        }

        let Some((order_id, fields)) = MergeFields::from_order_trade_update(payload) else {
            return;
        };

        let tracker = {
            let mut orders = self.orders.lock();
            orders
                .entry(order_id)
                .or_insert_with(|| {
                    let symbol = fields.symbol.clone().unwrap_or_default();
                    Arc::new(OrderTracker::new(symbol, order_id))
                })
                .clone()
        };

        tracker.merge_o_fields(fields);
    }

    /// Block until the tracker reaches a terminal status or `timeout`
    /// elapses. Polls briefly for late registration if the tracker is
    /// absent at call time (covers the rare race where the fill event beats
    /// local `register`).
    pub async fn wait(&self, order_id: i64, timeout: Duration) -> Option<OrderSnapshot> {
        let deadline = Instant::now() + timeout;

        let tracker = loop {
            if let Some(t) = self.get(order_id) {
                break t;
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        };

        let notified = tracker.completion.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if tracker.is_terminal() {
            return Some(tracker.snapshot());
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(remaining) => {
                warn!(order_id, "wait() timed out before terminal status observed");
            }
        }

        if tracker.is_terminal() {
            Some(tracker.snapshot())
        } else {
            None
        }
    }

    pub fn list_open(&self) -> Vec<OrderSnapshot> {
        self.orders
            .lock()
            .values()
            .filter(|t| !t.is_terminal())
            .map(|t| t.snapshot())
            .collect()
    }
}

impl Default for OrderStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update_payload(order_id: i64, status: &str, z: f64) -> serde_json::Value {
        serde_json::json!({
            "e": "ORDER_TRADE_UPDATE",
            "E": 1_700_000_000_000i64,
            "o": {
                "s": "ETHUSDT",
                "i": order_id,
                "S": "BUY",
                "X": status,
                "z": z.to_string(),
                "q": "0.1",
            }
        })
    }

    #[test]
    fn register_is_idempotent_on_order_id() {
        let store = OrderStore::new();
        let a = store.register(
            "ETHUSDT",
            1,
            Side::Buy,
            None,
            RegisterParams::default(),
        );
        let b = store.register(
            "ETHUSDT",
            1,
            Side::Sell,
            None,
            RegisterParams::default(),
        );
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.orders.lock().len(), 1);
        // The second register call did not overwrite the first tracker's side.
        assert_eq!(a.snapshot().side, Some(Side::Buy));
    }

    #[test]
    fn register_backfills_reduce_only_onto_a_tracker_created_by_an_event() {
        let store = OrderStore::new();
        // The fill event beats local registration and creates the tracker
        // without ever knowing this order was reduce-only.
        store.apply_event(&update_payload(3, "NEW", 0.0));
        assert_eq!(store.get(3).unwrap().snapshot().reduce_only, None);

        let tracker = store.register(
            "ETHUSDT",
            3,
            Side::Sell,
            None,
            RegisterParams {
                reduce_only: Some(true),
                ..Default::default()
            },
        );
        assert_eq!(tracker.snapshot().reduce_only, Some(true));
    }

    #[test]
    fn apply_event_creates_tracker_on_demand() {
        let store = OrderStore::new();
        store.apply_event(&update_payload(42, "NEW", 0.0));
        let tracker = store.get(42).expect("tracker should be auto-created");
        assert_eq!(tracker.snapshot().status, Some(OrderStatus::New));
    }

    #[test]
    fn executed_qty_is_monotonically_non_decreasing_across_applications() {
        let store = OrderStore::new();
        store.apply_event(&update_payload(7, "PARTIALLY_FILLED", 0.03));
        store.apply_event(&update_payload(7, "PARTIALLY_FILLED", 0.07));
        store.apply_event(&update_payload(7, "FILLED", 0.10));
        let snap = store.get(7).unwrap().snapshot();
        assert_eq!(snap.executed_qty, 0.10);
        assert_eq!(snap.status, Some(OrderStatus::Filled));
    }

    #[test]
    fn apply_event_idempotent_on_repeated_terminal_event() {
        let store = OrderStore::new();
        store.apply_event(&update_payload(9, "FILLED", 0.5));
        let first = store.get(9).unwrap().snapshot();
        store.apply_event(&update_payload(9, "FILLED", 0.5));
        let second = store.get(9).unwrap().snapshot();
        assert_eq!(first.executed_qty, second.executed_qty);
        assert_eq!(first.status, second.status);
    }

    #[test]
    fn unrelated_event_type_is_ignored() {
        let store = OrderStore::new();
        let payload = serde_json::json!({ "e": "ACCOUNT_UPDATE" });
        store.apply_event(&payload);
        assert!(store.get(1).is_none());
    }

    #[test]
    fn partial_merge_leaves_absent_fields_untouched() {
        let store = OrderStore::new();
        store.apply_event(&serde_json::json!({
            "e": "ORDER_TRADE_UPDATE",
            "o": { "s": "ETHUSDT", "i": 11, "X": "NEW", "p": "3000.0" }
        }));
        store.apply_event(&serde_json::json!({
            "e": "ORDER_TRADE_UPDATE",
            "o": { "i": 11, "X": "PARTIALLY_FILLED", "z": "0.02" }
        }));
        let snap = store.get(11).unwrap().snapshot();
        assert_eq!(snap.price, Some(3000.0));
        assert_eq!(snap.executed_qty, 0.02);
    }

    #[tokio::test]
    async fn wait_returns_snapshot_once_terminal() {
        let store = Arc::new(OrderStore::new());
        store.register(
            "ETHUSDT",
            5,
            Side::Buy,
            None,
            RegisterParams::default(),
        );

        let store2 = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            store2.apply_event(&update_payload(5, "FILLED", 0.1));
        });

        let snap = store.wait(5, Duration::from_secs(1)).await;
        assert!(snap.is_some());
        assert_eq!(snap.unwrap().status, Some(OrderStatus::Filled));
    }

    #[tokio::test]
    async fn wait_times_out_when_never_terminal() {
        let store = OrderStore::new();
        store.register(
            "ETHUSDT",
            6,
            Side::Buy,
            None,
            RegisterParams::default(),
        );
        let snap = store.wait(6, Duration::from_millis(30)).await;
        assert!(snap.is_none());
    }
}
