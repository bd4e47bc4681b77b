// =============================================================================
// Trading Cycle — snapshot -> advise -> reconcile -> place -> confirm
// =============================================================================
//
// One invocation performs eleven steps in order; failure at any step
// short-circuits with a structured status update. Policy short-circuits
// (forbidden window is a notice, not a short-circuit; low confidence,
// invalid decision, zero quantity) are ordinary `Ok(Outcome::…)` returns,
// never errors -- only environmental/protocol failures propagate as `Err`
// up to the Trigger Engine, which applies back-off.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Timelike, Utc};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::advisor::Advisor;
use crate::config::RuntimeConfig;
use crate::exchange::{ExchangeClient, OrderAck, OrderRequest};
use crate::order_store::{OrderStore, RegisterParams};
use crate::status::StatusPublisher;
use crate::stream_cache::StreamCache;
use crate::types::{Decision, OrderType, PositionSide, Side};

/// Terminal result of one cycle invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed,
    Flat,
    Skipped(String),
    Invalid(String),
}

impl Outcome {
    fn as_status_str(&self) -> String {
        match self {
            Self::Completed => "completed".to_string(),
            Self::Flat => "flat".to_string(),
            Self::Skipped(reason) => format!("skipped({reason})"),
            Self::Invalid(reason) => format!("invalid({reason})"),
        }
    }
}

/// Everything one cycle invocation needs, built once at startup and shared
/// across invocations -- no ambient globals.
pub struct CycleDeps {
    pub symbol: String,
    pub cache: Arc<StreamCache>,
    pub order_store: Arc<OrderStore>,
    pub exchange: Arc<dyn ExchangeClient>,
    pub advisor: Arc<dyn Advisor>,
    pub status: Arc<StatusPublisher>,
    pub config: RuntimeConfig,
}

const WS_CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);
const REST_FALLBACK_DEADLINE: Duration = Duration::from_secs(10);
const REST_POLL_INTERVAL: Duration = Duration::from_millis(800);

/// Run one end-to-end trading cycle. `Err` is reserved for environmental and
/// protocol failures that the Trigger Engine should back off on; every policy
/// short-circuit is an `Ok(Outcome::…)`.
#[instrument(skip(deps), fields(symbol = %deps.symbol))]
pub async fn run_cycle(deps: &CycleDeps) -> Result<Outcome> {
    // ---- Step 1: precheck -------------------------------------------------
    let cache_snapshot = deps.cache.snapshot();
    if !cache_snapshot.is_primed() {
        publish_skip(deps, "ws_priming");
        return Ok(Outcome::Skipped("ws_priming".into()));
    }
    let mark_price = cache_snapshot.mark_price.expect("primed implies mark present");
    let last_candle = cache_snapshot
        .last_kline_close
        .clone()
        .expect("primed implies candle present");

    // ---- Step 2: snapshot assembly ----------------------------------------
    let snapshot = assemble_snapshot(deps, mark_price, &last_candle).await?;
    deps.status.set_latest_input(snapshot.clone()).ok();

    // ---- Step 3: advisory call ---------------------------------------------
    let advice = deps
        .advisor
        .advise(&snapshot)
        .await
        .context("advisor call failed")?;
    deps.status
        .append_ai_history(json!({"request": snapshot, "advice": &advice}))
        .ok();
    deps.status
        .set_latest_advice(serde_json::to_value(&advice).unwrap_or_default())
        .ok();

    let decision: Decision = match advice.decision.as_deref().map(|s| s.parse::<Decision>()) {
        Some(Ok(d)) => d,
        _ => {
            publish_invalid(deps, "invalid_decision");
            return Ok(Outcome::Invalid("invalid_decision".into()));
        }
    };

    // ---- Step 4: confidence gate -------------------------------------------
    let confidence = advice.confidence.unwrap_or(0.0);
    let threshold = deps.config.clamped_conf_threshold();
    if confidence > 0.0 && confidence < threshold {
        publish_skip(deps, "low_confidence");
        return Ok(Outcome::Skipped("low_confidence".into()));
    }

    // ---- Step 5: account read ----------------------------------------------
    let hedge_mode = deps.exchange.position_mode().await.context("position_mode failed")?;
    let positions = deps
        .exchange
        .position_information(&deps.symbol)
        .await
        .context("position_information failed")?;
    publish_positions(deps, &positions);

    // ---- Step 6: leverage adjustment ---------------------------------------
    if let Some(lev) = advice.position.size.leverage {
        if lev > 0.0 {
            if let Err(e) = deps.exchange.change_leverage(&deps.symbol, lev as u32).await {
                warn!(error = %e, leverage = lev, "leverage change failed (log-only)");
            }
        }
    }

    // ---- Step 7: flat decision ----------------------------------------------
    if decision == Decision::Flat {
        for pos in positions.iter().filter(|p| p.quantity > 0.0) {
            let close_side = match pos.side {
                PositionSide::Long => Side::Sell,
                PositionSide::Short => Side::Buy,
            };
            let ps = hedge_mode.then_some(pos.side);
            place_reduce_only_and_wait(deps, close_side, ps, pos.quantity).await?;
            publish_close_history(deps, pos, close_side);
        }
        cleanup_protective_orders(deps, hedge_mode).await?;
        refresh_and_publish_positions(deps).await;
        publish_terminal(deps, &Outcome::Flat);
        return Ok(Outcome::Flat);
    }

    let target_side = decision.position_side().expect("non-flat decision has a position side");
    let same_side_qty: f64 = positions
        .iter()
        .filter(|p| p.side == target_side)
        .map(|p| p.quantity)
        .sum();
    let opposite_side_qty: f64 = positions
        .iter()
        .filter(|p| p.side != target_side)
        .map(|p| p.quantity)
        .sum();
    let _ = same_side_qty; // scale-in sizing is left to the advisor's requested quantity

    // ---- Step 8: reverse -----------------------------------------------------
    if opposite_side_qty > 0.0 {
        let close_side = match target_side {
            PositionSide::Long => Side::Sell,
            PositionSide::Short => Side::Buy,
        };
        let opposite_position_side = match target_side {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        };
        let ps = hedge_mode.then_some(opposite_position_side);
        place_reduce_only_and_wait(deps, close_side, ps, opposite_side_qty).await?;
        for pos in positions.iter().filter(|p| p.side != target_side && p.quantity > 0.0) {
            publish_close_history(deps, pos, close_side);
        }
        cleanup_protective_orders(deps, hedge_mode).await?;
    }

    // ---- Step 9: entry ---------------------------------------------------
    let filter = deps
        .exchange
        .exchange_info(&deps.symbol)
        .await
        .context("exchange_info failed")?;

    let requested_qty = advice
        .position
        .size
        .contracts
        .or_else(|| advice.position.size.quote_value_usdt.map(|q| q / mark_price))
        .unwrap_or(0.0);
    let qty = filter.snap_qty(requested_qty);
    if qty <= 0.0 {
        publish_skip(deps, "zero_quantity");
        return Ok(Outcome::Skipped("zero_quantity".into()));
    }

    let entry_side = decision.entry_side().expect("non-flat decision has an entry side");
    let entry_position_side = hedge_mode.then_some(target_side);
    let entry_type = advice
        .position
        .entry
        .order_type
        .as_deref()
        .unwrap_or("market");

    let mut req = OrderRequest::market(&deps.symbol, entry_side, qty);
    req.position_side = entry_position_side;
    if entry_type.eq_ignore_ascii_case("limit") {
        req.order_type = OrderType::Limit;
        req.price = Some(filter.snap_price(advice.position.entry.price.unwrap_or(mark_price)));
        req.time_in_force = Some("GTC".into());
    }

    let ack = deps
        .exchange
        .create_order(req)
        .await
        .context("entry order submission failed")?;
    deps.order_store.register(
        &deps.symbol,
        ack.order_id,
        entry_side,
        entry_position_side,
        RegisterParams {
            order_type: Some(OrderType::from(entry_type.to_ascii_uppercase().as_str())),
            reduce_only: Some(false),
            price: req_price_for_log(&ack),
            stop_price: None,
            quantity: Some(qty),
        },
    );
    deps.status
        .append_order(json!({"order_id": ack.order_id, "side": entry_side.as_str(), "type": "entry"}))
        .ok();

    let confirmed = confirm_fill(deps, ack.order_id).await;
    let executed_qty = confirmed.as_ref().map(|s| s.executed_qty).unwrap_or(0.0);
    let filled_qty = if executed_qty > 0.0 {
        executed_qty
    } else if deps.config.dry_run {
        qty
    } else {
        0.0
    };

    // ---- Step 10: protection ------------------------------------------------
    if filled_qty > 0.0 {
        place_protective_orders(deps, entry_side, entry_position_side, filled_qty, &filter, &advice).await;
    }

    // ---- Step 11: status publication ---------------------------------------
    refresh_and_publish_positions(deps).await;
    publish_terminal(deps, &Outcome::Completed);
    Ok(Outcome::Completed)
}

fn req_price_for_log(ack: &OrderAck) -> Option<f64> {
    ack.avg_price
}

/// Place a reduce-only market order and block until it reaches terminal
/// status (WebSocket, falling back to REST polling).
async fn place_reduce_only_and_wait(
    deps: &CycleDeps,
    side: Side,
    position_side: Option<PositionSide>,
    qty: f64,
) -> Result<()> {
    let mut req = OrderRequest::market(&deps.symbol, side, qty);
    req.position_side = position_side;
    req.reduce_only = true;

    let ack = deps
        .exchange
        .create_order(req)
        .await
        .context("reduce-only order submission failed")?;
    deps.order_store.register(
        &deps.symbol,
        ack.order_id,
        side,
        position_side,
        RegisterParams {
            order_type: Some(OrderType::Market),
            reduce_only: Some(true),
            price: None,
            stop_price: None,
            quantity: Some(qty),
        },
    );

    let confirmed = confirm_fill(deps, ack.order_id).await;
    if confirmed.is_none() {
        warn!(order_id = ack.order_id, "reduce-only order confirmation timed out");
    }
    Ok(())
}

/// Prefer the WebSocket completion signal (30 s); on timeout, poll REST every
/// ~0.8 s for up to 10 s. Missing confirmation is non-fatal -- callers decide
/// how to treat it.
async fn confirm_fill(deps: &CycleDeps, order_id: i64) -> Option<crate::order_store::OrderSnapshot> {
    if let Some(snap) = deps.order_store.wait(order_id, WS_CONFIRM_TIMEOUT).await {
        return Some(snap);
    }

    let deadline = tokio::time::Instant::now() + REST_FALLBACK_DEADLINE;
    loop {
        match deps.exchange.get_order(&deps.symbol, order_id).await {
            Ok(ack) => {
                deps.order_store.apply_event(&rest_ack_as_trade_update(&ack));
                if ack.status.is_terminal() {
                    return deps.order_store.get(order_id).map(|t| t.snapshot());
                }
            }
            Err(e) => warn!(order_id, error = %e, "REST fallback getOrder failed"),
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(order_id, "fill confirmation timed out after REST fallback");
            return None;
        }
        tokio::time::sleep(REST_POLL_INTERVAL).await;
    }
}

/// Shape a REST order-ack as a minimal `ORDER_TRADE_UPDATE` payload so it can
/// be merged through the same `apply_event` path a WebSocket event would use.
fn rest_ack_as_trade_update(ack: &OrderAck) -> serde_json::Value {
    json!({
        "e": "ORDER_TRADE_UPDATE",
        "o": {
            "s": ack.symbol,
            "i": ack.order_id,
            "X": ack.status.as_str(),
            "z": ack.executed_qty.to_string(),
            "ap": ack.avg_price.map(|p| p.to_string()),
        }
    })
}

async fn place_protective_orders(
    deps: &CycleDeps,
    entry_side: Side,
    position_side: Option<PositionSide>,
    filled_qty: f64,
    filter: &crate::exchange::SymbolFilter,
    advice: &crate::advisor::Advice,
) {
    let exit_side = entry_side.opposite();

    if let Some(sl) = &advice.position.stop_loss {
        if let Some(price) = sl.price {
            let working_type = match sl.trigger_on.as_deref() {
                Some("mark") => "MARK_PRICE",
                _ => "CONTRACT_PRICE",
            };
            let mut req = OrderRequest::market(&deps.symbol, exit_side, filter.snap_qty(filled_qty));
            req.order_type = OrderType::StopMarket;
            req.position_side = position_side;
            req.reduce_only = true;
            req.stop_price = Some(filter.snap_price(price));
            req.working_type = Some(working_type.to_string());
            req.quantity = Some(filter.snap_qty(filled_qty));
            place_protective(deps, req, "stop_loss").await;
        }
    }

    for tp in &advice.position.take_profits {
        let (Some(price), Some(pct)) = (tp.price, tp.size_pct) else { continue };
        if pct <= 0.0 {
            continue;
        }
        let tp_qty = filter.snap_qty(filled_qty * pct / 100.0);
        if tp_qty <= 0.0 {
            continue;
        }
        let mut req = OrderRequest::market(&deps.symbol, exit_side, tp_qty);
        req.order_type = OrderType::Limit;
        req.position_side = position_side;
        req.reduce_only = true;
        req.price = Some(filter.snap_price(price));
        req.time_in_force = Some("GTC".into());
        place_protective(deps, req, "take_profit").await;
    }

    if let Some(trailing) = &advice.position.trailing_stop {
        if let (Some(activate), Some(callback)) = (trailing.activate_price, trailing.callback_pct) {
            let mut req = OrderRequest::market(&deps.symbol, exit_side, filter.snap_qty(filled_qty));
            req.order_type = OrderType::TrailingStopMarket;
            req.position_side = position_side;
            req.reduce_only = true;
            req.working_type = Some("MARK_PRICE".to_string());
            req.activation_price = Some(filter.snap_price(activate));
            req.callback_rate = Some(callback);
            req.quantity = Some(filter.snap_qty(filled_qty));
            place_protective(deps, req, "trailing_stop").await;
        }
    }
}

/// Submit and register a protective order; never waited on.
async fn place_protective(deps: &CycleDeps, req: OrderRequest, kind: &str) {
    let side = req.side;
    let position_side = req.position_side;
    let order_type = req.order_type.clone();
    let reduce_only = req.reduce_only;
    let price = req.price;
    let stop_price = req.stop_price;
    let quantity = req.quantity;

    match deps.exchange.create_order(req).await {
        Ok(ack) => {
            deps.order_store.register(
                &deps.symbol,
                ack.order_id,
                side,
                position_side,
                RegisterParams {
                    order_type: Some(order_type),
                    reduce_only: Some(reduce_only),
                    price,
                    stop_price,
                    quantity,
                },
            );
            deps.status
                .append_order(json!({"order_id": ack.order_id, "side": side.as_str(), "type": kind}))
                .ok();
            info!(order_id = ack.order_id, kind, "protective order placed");
        }
        Err(e) => {
            warn!(error = %e, kind, "protective order submission failed (best-effort)");
        }
    }
}

/// Cancel any open order whose type is in the protective family, is
/// reduce-only/close-position, and whose protected position is now zero
/// the position it protects is now flat.
async fn cleanup_protective_orders(deps: &CycleDeps, hedge_mode: bool) -> Result<()> {
    let open_orders = deps
        .exchange
        .open_orders(&deps.symbol)
        .await
        .context("open_orders failed during cleanup")?;
    let positions = deps
        .exchange
        .position_information(&deps.symbol)
        .await
        .context("position_information failed during cleanup")?;

    let zero_for = |ps: Option<PositionSide>| -> bool {
        match (hedge_mode, ps) {
            (true, Some(side)) => positions.iter().all(|p| p.side != side || p.quantity == 0.0),
            _ => positions.iter().all(|p| p.quantity == 0.0),
        }
    };

    for order in &open_orders {
        // `OrderAck` doesn't carry order type or reduce-only -- both were
        // recorded locally at placement time, so cleanup consults the Order
        // Store's registry instead of re-deriving them from the venue.
        let Some(tracker) = deps.order_store.get(order.order_id) else {
            continue;
        };
        let snap = tracker.snapshot();
        let is_protective = snap
            .order_type
            .as_ref()
            .map(OrderType::is_protective_family)
            .unwrap_or(false);
        if !is_protective || snap.reduce_only != Some(true) {
            continue;
        }
        if zero_for(snap.position_side) {
            if let Err(e) = deps.exchange.cancel_order(&deps.symbol, order.order_id).await {
                warn!(order_id = order.order_id, error = %e, "protective cleanup cancel failed");
            }
        }
    }
    Ok(())
}

async fn assemble_snapshot(
    deps: &CycleDeps,
    mark_price: f64,
    last_candle: &crate::stream_cache::ClosedCandle,
) -> Result<serde_json::Value> {
    let last_trade_price = deps
        .exchange
        .ticker_24hr(&deps.symbol)
        .await
        .ok()
        .and_then(|v| v.get("lastPrice").and_then(|p| p.as_str()).and_then(|s| s.parse::<f64>().ok()))
        .unwrap_or(mark_price);

    let premium = deps.exchange.premium_index(&deps.symbol).await.unwrap_or_default();
    let index_price = premium
        .get("indexPrice")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(mark_price);

    let (funding_rate, next_funding_time) = deps
        .exchange
        .funding_rate(&deps.symbol)
        .await
        .unwrap_or((0.0, 0));

    let open_interest = deps.exchange.open_interest(&deps.symbol).await.unwrap_or(0.0);
    let stats_24h = deps.exchange.ticker_24hr(&deps.symbol).await.unwrap_or_default();

    let book = deps.exchange.order_book(&deps.symbol, 20).await.ok();
    let (spread_bps, depth_imbalance) = book
        .as_ref()
        .map(|b| (b.spread_bps(), b.imbalance()))
        .unwrap_or((0.0, 0.0));

    let candles = deps
        .exchange
        .klines(&deps.symbol, "1m", deps.config.recent_candles as u32)
        .await
        .unwrap_or_default();

    let now = Utc::now();
    let forbidden_notice = forbidden_window_notice(&deps.config.forbidden_windows, now.hour(), now.minute());
    if let Some(ref notice) = forbidden_notice {
        deps.status
            .append_event(json!({"kind": "forbidden_window", "notice": notice}))
            .ok();
    }

    Ok(json!({
        "symbol": deps.symbol,
        "mark_price": mark_price,
        "last_trade_price": last_trade_price,
        "index_price": index_price,
        "funding_rate": funding_rate,
        "next_funding_time": next_funding_time,
        "open_interest": open_interest,
        "stats_24h": stats_24h,
        "spread_bps": spread_bps,
        "depth_imbalance": depth_imbalance,
        "last_closed_candle": {
            "open": last_candle.open,
            "high": last_candle.high,
            "low": last_candle.low,
            "close": last_candle.close,
            "volume": last_candle.volume,
        },
        "recent_candles": candles.iter().map(|c| json!({
            "open_time": c.open_time, "open": c.open, "high": c.high,
            "low": c.low, "close": c.close, "volume": c.volume,
        })).collect::<Vec<_>>(),
        // Indicator math is out of scope here; this is an opaque
        // passthrough an external computation would otherwise populate.
        "derived_indicators": {},
        "constraints": {
            "forbidden_windows": deps.config.forbidden_windows,
            "cooldown_minutes": deps.config.loop_cooldown_sec as f64 / 60.0,
            "max_orders": deps.config.max_orders,
            "forbidden_window_notice": forbidden_notice,
        },
    }))
}

/// Returns `Some(window)` if `hour:minute` UTC falls inside any configured
/// `HH:MM-HH:MM` window. Windows that wrap past midnight are supported.
fn forbidden_window_notice(windows: &[String], hour: u32, minute: u32) -> Option<String> {
    let now_min = hour * 60 + minute;
    for w in windows {
        let Some((start, end)) = parse_window(w) else { continue };
        let in_window = if start <= end {
            now_min >= start && now_min <= end
        } else {
            now_min >= start || now_min <= end
        };
        if in_window {
            return Some(w.clone());
        }
    }
    None
}

fn parse_window(w: &str) -> Option<(u32, u32)> {
    let (a, b) = w.split_once('-')?;
    Some((parse_hhmm(a)?, parse_hhmm(b)?))
}

fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.trim().split_once(':')?;
    Some(h.parse::<u32>().ok()? * 60 + m.parse::<u32>().ok()?)
}

/// Replace the status document's `positions` section with the current
/// open set, already known from a fresh account read.
fn publish_positions(deps: &CycleDeps, positions: &[crate::exchange::Position]) {
    deps.status
        .set_positions(serde_json::to_value(positions).unwrap_or_default())
        .ok();
}

/// Re-read positions from the exchange and publish them. Used after a cycle
/// has submitted orders that may have changed the open set, so the status
/// document doesn't go stale until the next invocation's account read.
async fn refresh_and_publish_positions(deps: &CycleDeps) {
    match deps.exchange.position_information(&deps.symbol).await {
        Ok(positions) => publish_positions(deps, &positions),
        Err(e) => warn!(error = %e, "failed to refresh positions for status publication"),
    }
}

/// Record one closed position to `close_history.jsonl`.
fn publish_close_history(deps: &CycleDeps, pos: &crate::exchange::Position, close_side: Side) {
    deps.status
        .append_close_history(json!({
            "symbol": deps.symbol,
            "side": pos.side.as_str(),
            "close_side": close_side.as_str(),
            "quantity": pos.quantity,
            "entry_price": pos.entry_price,
            "unrealized_pnl": pos.unrealized_pnl,
        }))
        .ok();
}

fn publish_skip(deps: &CycleDeps, reason: &str) {
    deps.status
        .append_event(json!({"kind": "cycle_skip", "reason": reason}))
        .ok();
    deps.status
        .update_section("trader", json!({"last_status": format!("skipped({reason})")}))
        .ok();
}

fn publish_invalid(deps: &CycleDeps, reason: &str) {
    deps.status
        .append_event(json!({"kind": "cycle_invalid", "reason": reason}))
        .ok();
    deps.status
        .update_section("trader", json!({"last_status": format!("invalid({reason})")}))
        .ok();
}

fn publish_terminal(deps: &CycleDeps, outcome: &Outcome) {
    deps.status
        .append_event(json!({"kind": "cycle_complete", "status": outcome.as_status_str()}))
        .ok();
    deps.status
        .update_section("trader", json!({"last_status": outcome.as_status_str()}))
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_window_matches_inside_range() {
        let windows = vec!["15:55-16:05".to_string()];
        assert!(forbidden_window_notice(&windows, 16, 0).is_some());
        assert!(forbidden_window_notice(&windows, 14, 0).is_none());
    }

    #[test]
    fn forbidden_window_handles_midnight_wraparound() {
        let windows = vec!["23:50-00:10".to_string()];
        assert!(forbidden_window_notice(&windows, 23, 55).is_some());
        assert!(forbidden_window_notice(&windows, 0, 5).is_some());
        assert!(forbidden_window_notice(&windows, 12, 0).is_none());
    }

    #[test]
    fn no_windows_never_forbids() {
        assert!(forbidden_window_notice(&[], 16, 0).is_none());
    }

    #[test]
    fn outcome_status_strings_use_expected_vocabulary() {
        assert_eq!(Outcome::Completed.as_status_str(), "completed");
        assert_eq!(Outcome::Flat.as_status_str(), "flat");
        assert_eq!(Outcome::Skipped("low_confidence".into()).as_status_str(), "skipped(low_confidence)");
        assert_eq!(Outcome::Invalid("invalid_decision".into()).as_status_str(), "invalid(invalid_decision)");
    }
}
