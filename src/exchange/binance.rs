// =============================================================================
// Live exchange client — HMAC-signed USDT-M futures REST calls
// =============================================================================
//
// Generalizes a spot-market (`/api/v3/...`) HMAC signing pattern to the
// futures (`/fapi/v1`, `/fapi/v2`) endpoint set this agent needs.
// `ENV=paper` selects the public testnet host; `ENV=live` selects mainnet.
// No signature introspection: every endpoint is an explicit method.
// =============================================================================

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::binance::rate_limit::RateLimitTracker;
use crate::market_data::Candle;
use crate::types::{Env, OrderStatus, OrderType, PositionSide, Side};

use super::{
    AccountInfo, ExchangeClient, MarginMode, OrderAck, OrderBookSnapshot, OrderRequest, Position,
    SymbolFilter,
};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: u64 = 5000;

/// Live USDT-M futures REST client.
pub struct BinanceFuturesClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    rate_limit: Arc<RateLimitTracker>,
}

impl BinanceFuturesClient {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, env: Env) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let base_url = match env {
            Env::Paper => "https://testnet.binancefuture.com".to_string(),
            Env::Live => "https://fapi.binance.com".to_string(),
        };

        debug!(base_url = %base_url, "BinanceFuturesClient initialised");

        Self {
            api_key,
            secret,
            base_url,
            client,
            rate_limit: Arc::new(RateLimitTracker::new()),
        }
    }

    pub fn rate_limit(&self) -> Arc<RateLimitTracker> {
        Arc::clone(&self.rate_limit)
    }

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    async fn signed_get(&self, path: &str, params: &str) -> Result<serde_json::Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        let resp = self.client.get(&url).send().await.with_context(|| format!("GET {path} failed"))?;
        self.rate_limit.update_from_headers(resp.headers());
        Self::parse_body(path, resp).await
    }

    async fn signed_post(&self, path: &str, params: &str) -> Result<serde_json::Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        let resp = self.client.post(&url).send().await.with_context(|| format!("POST {path} failed"))?;
        self.rate_limit.update_from_headers(resp.headers());
        Self::parse_body(path, resp).await
    }

    async fn signed_delete(&self, path: &str, params: &str) -> Result<serde_json::Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        let resp = self.client.delete(&url).send().await.with_context(|| format!("DELETE {path} failed"))?;
        self.rate_limit.update_from_headers(resp.headers());
        Self::parse_body(path, resp).await
    }

    async fn parse_body(path: &str, resp: reqwest::Response) -> Result<serde_json::Value> {
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse response body for {path}"))?;
        if !status.is_success() {
            anyhow::bail!("{path} returned {status}: {body}");
        }
        Ok(body)
    }

    fn parse_order_ack(body: &serde_json::Value) -> Result<OrderAck> {
        let order_id = body["orderId"].as_i64().context("missing orderId")?;
        let symbol = body["symbol"].as_str().unwrap_or_default().to_string();
        let status: OrderStatus = body["status"]
            .as_str()
            .context("missing status")?
            .parse()?;
        let executed_qty = parse_str_f64(&body["executedQty"]).unwrap_or(0.0);
        let avg_price = parse_str_f64(&body["avgPrice"]).filter(|p| *p > 0.0);
        Ok(OrderAck { order_id, symbol, status, executed_qty, avg_price })
    }
}

fn parse_str_f64(v: &serde_json::Value) -> Option<f64> {
    v.as_str().and_then(|s| s.parse().ok()).or_else(|| v.as_f64())
}

#[async_trait]
impl ExchangeClient for BinanceFuturesClient {
    #[instrument(skip(self), name = "exchange::exchange_info")]
    async fn exchange_info(&self, symbol: &str) -> Result<SymbolFilter> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        let resp = self.client.get(&url).send().await.context("GET exchangeInfo failed")?;
        let body: serde_json::Value = resp.json().await.context("failed to parse exchangeInfo")?;

        let entry = body["symbols"]
            .as_array()
            .and_then(|arr| arr.iter().find(|s| s["symbol"].as_str() == Some(symbol)))
            .with_context(|| format!("symbol {symbol} not found in exchangeInfo"))?;

        let price_precision = entry["pricePrecision"].as_u64().unwrap_or(2) as u32;
        let quantity_precision = entry["quantityPrecision"].as_u64().unwrap_or(3) as u32;

        let filters = entry["filters"].as_array().cloned().unwrap_or_default();
        let mut tick_size = 0.01;
        let mut step_size = 0.001;
        let mut min_notional = 5.0;
        for f in &filters {
            match f["filterType"].as_str() {
                Some("PRICE_FILTER") => {
                    tick_size = parse_str_f64(&f["tickSize"]).unwrap_or(tick_size);
                }
                Some("LOT_SIZE") => {
                    step_size = parse_str_f64(&f["stepSize"]).unwrap_or(step_size);
                }
                Some("MIN_NOTIONAL") => {
                    min_notional = parse_str_f64(&f["notional"]).unwrap_or(min_notional);
                }
                _ => {}
            }
        }

        Ok(SymbolFilter { price_precision, quantity_precision, tick_size, step_size, min_notional })
    }

    #[instrument(skip(self), name = "exchange::position_mode")]
    async fn position_mode(&self) -> Result<bool> {
        let body = self.signed_get("/fapi/v1/positionSide/dual", "").await?;
        Ok(body["dualSidePosition"].as_bool().unwrap_or(false))
    }

    #[instrument(skip(self), name = "exchange::account")]
    async fn account(&self) -> Result<AccountInfo> {
        let body = self.signed_get("/fapi/v2/account", "").await?;
        Ok(AccountInfo {
            total_wallet_balance: parse_str_f64(&body["totalWalletBalance"]).unwrap_or(0.0),
            available_balance: parse_str_f64(&body["availableBalance"]).unwrap_or(0.0),
        })
    }

    #[instrument(skip(self), name = "exchange::position_information")]
    async fn position_information(&self, symbol: &str) -> Result<Vec<Position>> {
        let params = format!("symbol={symbol}");
        let body = self.signed_get("/fapi/v2/positionRisk", &params).await?;
        let raw = body.as_array().cloned().unwrap_or_default();

        let mut positions = Vec::new();
        for p in raw {
            let quantity = parse_str_f64(&p["positionAmt"]).unwrap_or(0.0);
            let side = if quantity >= 0.0 { PositionSide::Long } else { PositionSide::Short };
            let liq_raw = parse_str_f64(&p["liquidationPrice"]).unwrap_or(0.0);
            let margin_mode = match p["marginType"].as_str() {
                Some("isolated") => MarginMode::Isolated,
                _ => MarginMode::Cross,
            };

            positions.push(Position {
                symbol: symbol.to_string(),
                side,
                quantity: quantity.abs(),
                entry_price: parse_str_f64(&p["entryPrice"]).unwrap_or(0.0),
                unrealized_pnl: parse_str_f64(&p["unRealizedProfit"]).unwrap_or(0.0),
                liquidation_price: if liq_raw == 0.0 { None } else { Some(liq_raw) },
                break_even_price: parse_str_f64(&p["breakEvenPrice"]).unwrap_or(0.0),
                margin_mode,
                leverage: p["leverage"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1),
            });
        }
        Ok(positions)
    }

    #[instrument(skip(self), name = "exchange::open_orders")]
    async fn open_orders(&self, symbol: &str) -> Result<Vec<OrderAck>> {
        let params = format!("symbol={symbol}");
        let body = self.signed_get("/fapi/v1/openOrders", &params).await?;
        let raw = body.as_array().cloned().unwrap_or_default();
        raw.iter().map(Self::parse_order_ack).collect()
    }

    #[instrument(skip(self, req), name = "exchange::create_order")]
    async fn create_order(&self, req: OrderRequest) -> Result<OrderAck> {
        let mut params = format!(
            "symbol={}&side={}&type={}",
            req.symbol,
            req.side,
            req.order_type
        );
        if let Some(ps) = req.position_side {
            params.push_str(&format!("&positionSide={ps}"));
        }
        if let Some(q) = req.quantity {
            params.push_str(&format!("&quantity={q}"));
        }
        if let Some(p) = req.price {
            params.push_str(&format!("&price={p}"));
        }
        if let Some(sp) = req.stop_price {
            params.push_str(&format!("&stopPrice={sp}"));
        }
        if req.reduce_only {
            params.push_str("&reduceOnly=true");
        }
        if req.close_position {
            params.push_str("&closePosition=true");
        }
        if let Some(tif) = &req.time_in_force {
            params.push_str(&format!("&timeInForce={tif}"));
        }
        if let Some(wt) = &req.working_type {
            params.push_str(&format!("&workingType={wt}"));
        }
        if let Some(ap) = req.activation_price {
            params.push_str(&format!("&activationPrice={ap}"));
        }
        if let Some(cr) = req.callback_rate {
            params.push_str(&format!("&callbackRate={cr}"));
        }
        if let Some(coid) = &req.client_order_id {
            params.push_str(&format!("&newClientOrderId={coid}"));
        }

        self.rate_limit.record_order_sent();
        let body = self.signed_post("/fapi/v1/order", &params).await?;
        Self::parse_order_ack(&body)
    }

    #[instrument(skip(self), name = "exchange::cancel_order")]
    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<()> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        self.signed_delete("/fapi/v1/order", &params).await?;
        Ok(())
    }

    #[instrument(skip(self), name = "exchange::get_order")]
    async fn get_order(&self, symbol: &str, order_id: i64) -> Result<OrderAck> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let body = self.signed_get("/fapi/v1/order", &params).await?;
        Self::parse_order_ack(&body)
    }

    #[instrument(skip(self), name = "exchange::change_leverage")]
    async fn change_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let params = format!("symbol={symbol}&leverage={leverage}");
        match self.signed_post("/fapi/v1/leverage", &params).await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(symbol, leverage, error = %e, "leverage change failed (log-only)");
                Ok(())
            }
        }
    }

    #[instrument(skip(self), name = "exchange::mark_price")]
    async fn mark_price(&self, symbol: &str) -> Result<f64> {
        let url = format!("{}/fapi/v1/premiumIndex?symbol={}", self.base_url, symbol);
        let resp = self.client.get(&url).send().await.context("GET premiumIndex failed")?;
        let body: serde_json::Value = resp.json().await.context("failed to parse premiumIndex")?;
        parse_str_f64(&body["markPrice"]).context("missing markPrice")
    }

    #[instrument(skip(self), name = "exchange::premium_index")]
    async fn premium_index(&self, symbol: &str) -> Result<serde_json::Value> {
        let url = format!("{}/fapi/v1/premiumIndex?symbol={}", self.base_url, symbol);
        let resp = self.client.get(&url).send().await.context("GET premiumIndex failed")?;
        resp.json().await.context("failed to parse premiumIndex")
    }

    #[instrument(skip(self), name = "exchange::funding_rate")]
    async fn funding_rate(&self, symbol: &str) -> Result<(f64, i64)> {
        let body = self.premium_index(symbol).await?;
        let rate = parse_str_f64(&body["lastFundingRate"]).unwrap_or(0.0);
        let next_ts = body["nextFundingTime"].as_i64().unwrap_or(0);
        Ok((rate, next_ts))
    }

    #[instrument(skip(self), name = "exchange::open_interest")]
    async fn open_interest(&self, symbol: &str) -> Result<f64> {
        let url = format!("{}/fapi/v1/openInterest?symbol={}", self.base_url, symbol);
        let resp = self.client.get(&url).send().await.context("GET openInterest failed")?;
        let body: serde_json::Value = resp.json().await.context("failed to parse openInterest")?;
        parse_str_f64(&body["openInterest"]).context("missing openInterest")
    }

    #[instrument(skip(self), name = "exchange::open_interest_hist")]
    async fn open_interest_hist(&self, symbol: &str, period: &str, limit: u32) -> Result<serde_json::Value> {
        let url = format!(
            "{}/futures/data/openInterestHist?symbol={}&period={}&limit={}",
            self.base_url, symbol, period, limit
        );
        let resp = self.client.get(&url).send().await.context("GET openInterestHist failed")?;
        resp.json().await.context("failed to parse openInterestHist")
    }

    #[instrument(skip(self), name = "exchange::global_long_short_account_ratio")]
    async fn global_long_short_account_ratio(&self, symbol: &str, period: &str) -> Result<serde_json::Value> {
        let url = format!(
            "{}/futures/data/globalLongShortAccountRatio?symbol={}&period={}",
            self.base_url, symbol, period
        );
        let resp = self.client.get(&url).send().await.context("GET globalLongShortAccountRatio failed")?;
        resp.json().await.context("failed to parse globalLongShortAccountRatio")
    }

    #[instrument(skip(self), name = "exchange::order_book")]
    async fn order_book(&self, symbol: &str, limit: u32) -> Result<OrderBookSnapshot> {
        let url = format!("{}/fapi/v1/depth?symbol={}&limit={}", self.base_url, symbol, limit);
        let resp = self.client.get(&url).send().await.context("GET depth failed")?;
        let body: serde_json::Value = resp.json().await.context("failed to parse depth")?;

        let bids = body["bids"].as_array().cloned().unwrap_or_default();
        let asks = body["asks"].as_array().cloned().unwrap_or_default();

        let best_bid = bids.first().and_then(|b| parse_str_f64(&b[0])).unwrap_or(0.0);
        let best_ask = asks.first().and_then(|a| parse_str_f64(&a[0])).unwrap_or(0.0);
        let bid_depth: f64 = bids.iter().filter_map(|b| parse_str_f64(&b[1])).sum();
        let ask_depth: f64 = asks.iter().filter_map(|a| parse_str_f64(&a[1])).sum();

        Ok(OrderBookSnapshot { best_bid, best_ask, bid_depth, ask_depth })
    }

    #[instrument(skip(self), name = "exchange::klines")]
    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );
        let resp = self.client.get(&url).send().await.context("GET klines failed")?;
        let body: serde_json::Value = resp.json().await.context("failed to parse klines")?;
        let raw = body.as_array().context("klines response is not an array")?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 7 {
                continue;
            }
            let open_time = arr[0].as_i64().unwrap_or(0);
            let open = parse_str_f64(&arr[1]).unwrap_or(0.0);
            let high = parse_str_f64(&arr[2]).unwrap_or(0.0);
            let low = parse_str_f64(&arr[3]).unwrap_or(0.0);
            let close = parse_str_f64(&arr[4]).unwrap_or(0.0);
            let volume = parse_str_f64(&arr[5]).unwrap_or(0.0);
            let close_time = arr[6].as_i64().unwrap_or(0);
            candles.push(Candle::new(open_time, open, high, low, close, volume, close_time));
        }
        Ok(candles)
    }

    #[instrument(skip(self), name = "exchange::ticker_24hr")]
    async fn ticker_24hr(&self, symbol: &str) -> Result<serde_json::Value> {
        let url = format!("{}/fapi/v1/ticker/24hr?symbol={}", self.base_url, symbol);
        let resp = self.client.get(&url).send().await.context("GET ticker/24hr failed")?;
        resp.json().await.context("failed to parse ticker/24hr")
    }

    #[instrument(skip(self), name = "exchange::create_listen_key")]
    async fn create_listen_key(&self) -> Result<String> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);
        let resp = self.client.post(&url).send().await.context("POST listenKey failed")?;
        let body: serde_json::Value = resp.json().await.context("failed to parse listenKey response")?;
        body["listenKey"].as_str().map(String::from).context("missing listenKey")
    }

    #[instrument(skip(self, key), name = "exchange::keepalive_listen_key")]
    async fn keepalive_listen_key(&self, key: &str) -> Result<()> {
        let url = format!("{}/fapi/v1/listenKey?listenKey={}", self.base_url, key);
        self.client.put(&url).send().await.context("PUT listenKey failed")?;
        Ok(())
    }

    #[instrument(skip(self, key), name = "exchange::close_listen_key")]
    async fn close_listen_key(&self, key: &str) -> Result<()> {
        let url = format!("{}/fapi/v1/listenKey?listenKey={}", self.base_url, key);
        self.client.delete(&url).send().await.context("DELETE listenKey failed")?;
        Ok(())
    }
}

impl std::fmt::Debug for BinanceFuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFuturesClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_selects_testnet_vs_mainnet_host() {
        let paper = BinanceFuturesClient::new("k", "s", Env::Paper);
        let live = BinanceFuturesClient::new("k", "s", Env::Live);
        assert!(paper.base_url.contains("testnet"));
        assert!(live.base_url.contains("fapi.binance.com"));
    }

    #[test]
    fn debug_impl_redacts_credentials() {
        let client = BinanceFuturesClient::new("my-secret-key", "my-secret-value", Env::Paper);
        let out = format!("{client:?}");
        assert!(!out.contains("my-secret-key"));
        assert!(!out.contains("my-secret-value"));
    }

    #[test]
    fn signature_is_deterministic_for_same_input() {
        let client = BinanceFuturesClient::new("k", "supersecret", Env::Paper);
        assert_eq!(client.sign("a=1&b=2"), client.sign("a=1&b=2"));
    }
}
