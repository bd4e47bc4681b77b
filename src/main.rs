// =============================================================================
// perp-cycle-agent — main entry point
// =============================================================================
//
// Builds one long-lived shared context (Stream Cache, Order Store, Status
// Publisher, exchange client, advisor client) and hands it explicitly to
// every spawned task — no process-wide global state. `Ctrl+C` flips a
// `watch::Sender<bool>` that every task observes cooperatively; the
// process exits once all of them have unwound.
// =============================================================================

mod advisor;
mod binance;
mod config;
mod cycle;
mod exchange;
mod market_data;
mod order_store;
mod status;
mod stream_cache;
mod trigger;
mod types;
mod volatility;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::advisor::{Advisor, HttpAdvisor};
use crate::config::RuntimeConfig;
use crate::cycle::CycleDeps;
use crate::exchange::binance::BinanceFuturesClient;
use crate::exchange::paper::PaperExchangeClient;
use crate::exchange::ExchangeClient;
use crate::market_data::subscriber::{self, DropCounter, StreamEvent};
use crate::order_store::OrderStore;
use crate::status::StatusPublisher;
use crate::stream_cache::StreamCache;
use crate::volatility::{VolatilityDetector, VolatilityParams};

const EVENT_CHANNEL_CAPACITY: usize = 4_000;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const RUNTIME_CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("perp-cycle-agent starting up");

    let config = RuntimeConfig::load(RUNTIME_CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load runtime config, using defaults");
        RuntimeConfig::default()
    });

    info!(
        symbol = %config.symbol,
        env = ?config.env,
        dry_run = config.dry_run,
        loop_trigger = ?config.loop_trigger,
        "runtime config loaded"
    );

    let cache = Arc::new(StreamCache::new(&config.symbol));
    let order_store = Arc::new(OrderStore::new());

    let status_dir = std::env::var("STATUS_DIR").unwrap_or_else(|_| "./status".to_string());
    let status = Arc::new(StatusPublisher::new(&status_dir)?);
    status.update_section(
        "trader",
        serde_json::json!({"state": "starting", "symbol": config.symbol, "env": format!("{:?}", config.env)}),
    )?;

    let hedge_mode = std::env::var("HEDGE_MODE")
        .ok()
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);

    // Built once; `paper_bridge` stays `Some` only in dry-run mode, so the
    // mark-price bridge task below has somewhere to feed live prices.
    let (exchange, paper_bridge): (Arc<dyn ExchangeClient>, Option<Arc<PaperExchangeClient>>) =
        if config.dry_run {
            let paper = Arc::new(PaperExchangeClient::new(
                config.symbol.clone(),
                hedge_mode,
                order_store.clone(),
            ));
            (paper.clone(), Some(paper))
        } else {
            let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
            let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
            if api_key.is_empty() || api_secret.is_empty() {
                warn!("BINANCE_API_KEY/BINANCE_API_SECRET not set — live REST calls will fail");
            }
            let live = Arc::new(BinanceFuturesClient::new(api_key, api_secret, config.env));
            (live, None)
        };

    let advisor_url =
        std::env::var("ADVISOR_URL").unwrap_or_else(|_| "http://127.0.0.1:8090/advise".to_string());
    let advisor: Arc<dyn Advisor> = Arc::new(HttpAdvisor::new(advisor_url));

    let deps = Arc::new(CycleDeps {
        symbol: config.symbol.clone(),
        cache: cache.clone(),
        order_store: order_store.clone(),
        exchange: exchange.clone(),
        advisor,
        status: status.clone(),
        config: config.clone(),
    });

    let (stop_tx, stop_rx) = watch::channel(false);
    let (events_tx, events_rx) = mpsc::channel::<StreamEvent>(EVENT_CHANNEL_CAPACITY);
    let mut handles = Vec::new();

    if config.ws_enable && config.ws_price_enable {
        let symbol = config.symbol.clone();
        let env = config.env;
        let cache = cache.clone();
        let tx = events_tx.clone();
        let drops = Arc::new(DropCounter::new());
        let mut stop_rx = stop_rx.clone();
        handles.push(tokio::spawn(async move {
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                if let Err(e) = subscriber::run_price_stream(
                    &symbol,
                    env,
                    cache.clone(),
                    tx.clone(),
                    drops.clone(),
                    stop_rx.clone(),
                )
                .await
                {
                    error!(symbol = %symbol, error = %e, "price stream error — reconnecting in 5s");
                }
                if *stop_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(symbol = %symbol, "price stream task exited");
        }));
    } else {
        info!("price/kline stream disabled by configuration");
    }

    if let Some(paper) = paper_bridge {
        let cache = cache.clone();
        let mut stop_rx = stop_rx.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {
                        if let Some(price) = cache.snapshot().mark_price {
                            paper.update_mark_price(price);
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }));
    } else if config.ws_enable && config.ws_user_enable {
        match exchange.create_listen_key().await {
            Ok(listen_key) => {
                let symbol = config.symbol.clone();
                let env = config.env;
                let order_store = order_store.clone();
                let tx = events_tx.clone();
                let drops = Arc::new(DropCounter::new());
                let key_for_stream = listen_key.clone();
                let mut stop_rx_stream = stop_rx.clone();
                handles.push(tokio::spawn(async move {
                    loop {
                        if *stop_rx_stream.borrow() {
                            break;
                        }
                        if let Err(e) = subscriber::run_user_stream(
                            &symbol,
                            env,
                            &key_for_stream,
                            order_store.clone(),
                            tx.clone(),
                            drops.clone(),
                            stop_rx_stream.clone(),
                        )
                        .await
                        {
                            error!(symbol = %symbol, error = %e, "user stream error — reconnecting in 5s");
                        }
                        if *stop_rx_stream.borrow() {
                            break;
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                            _ = stop_rx_stream.changed() => {
                                if *stop_rx_stream.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                    info!(symbol = %symbol, "user stream task exited");
                }));

                let exchange_for_keepalive = exchange.clone();
                let stop_rx_keepalive = stop_rx.clone();
                handles.push(tokio::spawn(subscriber::run_listen_key_keepalive(
                    exchange_for_keepalive,
                    listen_key,
                    stop_rx_keepalive,
                )));
            }
            Err(e) => {
                error!(error = %e, "failed to create user-data listen key — order updates will rely on REST fallback only");
            }
        }
    } else {
        info!("user-data stream disabled by configuration");
    }

    let volatility = VolatilityDetector::new(VolatilityParams {
        mp_window_sec: config.mp_window_sec,
        mp_delta_pct: config.mp_delta_pct,
        kline_range_pct: config.kline_range_pct,
        vol_lookback: config.vol_lookback,
        vol_mult: config.vol_mult,
        use_quote_volume: config.use_quote_volume,
    });

    status.update_section("trader", serde_json::json!({"state": "running"}))?;

    let trigger_deps = deps.clone();
    let trigger_stop_rx = stop_rx.clone();
    let trigger_handle = tokio::spawn(async move {
        trigger::run(trigger_deps, events_rx, volatility, trigger_stop_rx).await;
    });

    info!("all subsystems running — press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    stop_tx.send(true).ok();

    if let Err(e) = trigger_handle.await {
        error!(error = %e, "trigger engine task panicked");
    }
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "background task panicked");
        }
    }

    if let Err(e) = config.save(RUNTIME_CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }
    status.update_section("trader", serde_json::json!({"state": "stopped"})).ok();

    info!("perp-cycle-agent shut down complete");
    Ok(())
}
