// =============================================================================
// Stream subscriber — the WebSocket execution context
// =============================================================================
//
// Owns the exchange's WebSocket connections. Each message is handled inline:
// parse, update the Stream Cache or Order Store under their own locks, then
// push a typed event into the bounded channel with a non-blocking `try_send`
// (drop-newest-on-full). Reconnection is the caller's job (main.rs runs each
// of these in a `loop { ...; sleep(5s) }` wrapper).
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::order_store::OrderStore;
use crate::stream_cache::{parse_kline_frame, parse_mark_price_frame, unwrap_frame, StreamCache};
use crate::types::Env;

/// One raw sample handed from the subscriber to the Trigger Engine. Kept
/// deliberately thin -- the channel only needs to carry enough for the
/// trigger modes (candle-close, volatility-event) to react; the
/// authoritative copy already lives in the Stream Cache / Order Store.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Mark { ts_ms: i64, price: f64 },
    Kline(crate::stream_cache::ClosedCandle),
    User,
}

/// Counts of events dropped because the bounded channel was full.
#[derive(Default)]
pub struct DropCounter(AtomicU64);

impl DropCounter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    fn bump(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

fn ws_base_url(env: Env) -> &'static str {
    match env {
        Env::Paper => "wss://stream.binancefuture.com",
        Env::Live => "wss://fstream.binance.com",
    }
}

fn try_push(tx: &mpsc::Sender<StreamEvent>, drops: &DropCounter, event: StreamEvent) {
    if tx.try_send(event).is_err() {
        drops.bump();
        if drops.get() % 100 == 1 {
            warn!(dropped = drops.get(), "event channel full — dropping newest sample");
        }
    }
}

/// Connect to the combined mark-price + 1m-kline stream for one symbol and
/// feed the Stream Cache and event channel until the connection drops.
pub async fn run_price_stream(
    symbol: &str,
    env: Env,
    cache: Arc<StreamCache>,
    tx: mpsc::Sender<StreamEvent>,
    drops: Arc<DropCounter>,
    mut stop_rx: watch::Receiver<bool>,
) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!(
        "{}/stream?streams={lower}@markPrice/{lower}@kline_1m",
        ws_base_url(env)
    );
    info!(url = %url, symbol, "connecting to mark-price/kline stream");

    let (ws_stream, _resp) = connect_async(&url)
        .await
        .context("failed to connect to price/kline stream")?;
    info!(symbol, "price/kline stream connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_price_frame(symbol, &text, &cache, &tx, &drops);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(error = %e, "price stream read error");
                        return Err(e.into());
                    }
                    None => {
                        warn!(symbol, "price stream ended");
                        return Ok(());
                    }
                }
            }
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    info!(symbol, "price stream closing on stop signal");
                    return Ok(());
                }
            }
        }
    }
}

fn handle_price_frame(
    symbol: &str,
    text: &str,
    cache: &Arc<StreamCache>,
    tx: &mpsc::Sender<StreamEvent>,
    drops: &DropCounter,
) {
    let raw: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "malformed price/kline frame — dropped");
            return;
        }
    };
    let data = unwrap_frame(&raw);

    if let Some((sym, ts, price)) = parse_mark_price_frame(data) {
        if sym != symbol {
            return; // symbol mismatch — drop without error
        }
        cache.set_mark(price, ts);
        try_push(tx, drops, StreamEvent::Mark { ts_ms: ts, price });
        return;
    }

    if let Some((sym, ts, candle)) = parse_kline_frame(data) {
        if sym != symbol {
            return;
        }
        cache.set_kline_close(candle.clone(), ts);
        try_push(tx, drops, StreamEvent::Kline(candle));
    }
    // Unknown event kinds are ignored.
}

/// Connect to the user-data stream keyed by `listen_key` and merge every
/// `ORDER_TRADE_UPDATE` into the Order Store.
pub async fn run_user_stream(
    symbol: &str,
    env: Env,
    listen_key: &str,
    order_store: Arc<OrderStore>,
    tx: mpsc::Sender<StreamEvent>,
    drops: Arc<DropCounter>,
    mut stop_rx: watch::Receiver<bool>,
) -> Result<()> {
    let url = format!("{}/ws/{listen_key}", ws_base_url(env));
    info!(symbol, "connecting to user-data stream");

    let (ws_stream, _resp) = connect_async(&url)
        .await
        .context("failed to connect to user-data stream")?;
    info!(symbol, "user-data stream connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let raw: serde_json::Value = match serde_json::from_str(&text) {
                            Ok(v) => v,
                            Err(e) => {
                                debug!(error = %e, "malformed user-data frame — dropped");
                                continue;
                            }
                        };
                        let data = unwrap_frame(&raw);
                        order_store.apply_event(data);
                        try_push(&tx, &drops, StreamEvent::User);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(error = %e, "user-data stream read error");
                        return Err(e.into());
                    }
                    None => {
                        warn!(symbol, "user-data stream ended");
                        return Ok(());
                    }
                }
            }
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    info!(symbol, "user-data stream closing on stop signal");
                    return Ok(());
                }
            }
        }
    }
}

const LISTEN_KEY_KEEPALIVE: std::time::Duration = std::time::Duration::from_secs(45 * 60);

/// Renew the user-data listen key every 45 minutes (the venue expires it
/// after 60) and close it on shutdown so the session doesn't linger.
pub async fn run_listen_key_keepalive(
    exchange: Arc<dyn crate::exchange::ExchangeClient>,
    listen_key: String,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(LISTEN_KEY_KEEPALIVE) => {
                if let Err(e) = exchange.keepalive_listen_key(&listen_key).await {
                    warn!(error = %e, "listen key keepalive failed");
                }
            }
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    break;
                }
            }
        }
    }
    if let Err(e) = exchange.close_listen_key(&listen_key).await {
        warn!(error = %e, "failed to close listen key on shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_cache::StreamCache;

    #[tokio::test]
    async fn mark_price_frame_updates_cache_and_pushes_event() {
        let cache = Arc::new(StreamCache::new("ETHUSDT"));
        let (tx, mut rx) = mpsc::channel(8);
        let drops = DropCounter::new();

        let frame = serde_json::json!({
            "stream": "ethusdt@markPrice",
            "data": {"e": "markPriceUpdate", "s": "ETHUSDT", "E": 1000, "p": "3000.5"}
        })
        .to_string();

        handle_price_frame("ETHUSDT", &frame, &cache, &tx, &drops);

        assert_eq!(cache.snapshot().mark_price, Some(3000.5));
        let event = rx.try_recv().unwrap();
        assert!(matches!(event, StreamEvent::Mark { ts_ms: 1000, price } if price == 3000.5));
        assert_eq!(drops.get(), 0);
    }

    #[tokio::test]
    async fn cross_symbol_frame_is_dropped_without_error() {
        let cache = Arc::new(StreamCache::new("ETHUSDT"));
        let (tx, mut rx) = mpsc::channel(8);
        let drops = DropCounter::new();

        let frame = serde_json::json!({"e": "markPriceUpdate", "s": "BTCUSDT", "E": 1, "p": "50000"})
            .to_string();
        handle_price_frame("ETHUSDT", &frame, &cache, &tx, &drops);

        assert!(cache.snapshot().mark_price.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_channel_increments_drop_counter_instead_of_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let drops = DropCounter::new();
        tx.try_send(StreamEvent::User).unwrap();
        try_push(&tx, &drops, StreamEvent::User);
        assert_eq!(drops.get(), 1);
    }
}
