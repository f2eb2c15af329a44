// ===============================
// src/binance.rs
// ===============================
//
// Live venue: Binance Spot REST (signed) + kline WebSocket.
// - Sandbox : https://testnet.binance.vision , wss://testnet.binance.vision/ws
// - Mainnet : https://api.binance.com        , wss://stream.binance.com:9443/ws
//
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use tokio::{
    select,
    sync::{mpsc, watch},
    time::{sleep, Duration},
};
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::domain::{split_asset_quote, Account, Balance, Bar, Order, OrderStatus, OrderType, Side};
use crate::error::{EngineError, Result};
use crate::feed::Backoff;
use crate::metrics::{ORDERS_CREATED, WS_CONNECTED, WS_RECONNECTS};
use crate::venue::{CandleStream, DataFeed, Venue};

pub fn timestamp_ms() -> i64 { Utc::now().timestamp_millis() }

/// HMAC-SHA256 of the query string, hex encoded.
pub fn sign_query(secret: &str, query: &str) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| EngineError::Venue(format!("hmac key: {e}")))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn encode_params(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn num(s: &str) -> f64 { s.parse::<f64>().unwrap_or(0.0) }

fn millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[derive(Debug, Clone)]
pub struct BinanceConfig {
    pub rest_base: String,
    pub ws_base: String,
    pub api_key: String,
    pub api_secret: String,
    pub recv_window: u64,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

// ---- REST payloads ----
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    symbol: String,
    order_id: i64,
    #[serde(default)]
    order_list_id: Option<i64>,
    #[serde(default)]
    price: String,
    #[serde(default)]
    orig_qty: String,
    #[serde(default)]
    executed_qty: String,
    #[serde(rename = "cummulativeQuoteQty", default)]
    cumulative_quote_qty: String,
    #[serde(default)]
    stop_price: Option<String>,
    status: String,
    #[serde(rename = "type")]
    kind: String,
    side: String,
    #[serde(default)]
    time: Option<i64>,
    #[serde(default)]
    update_time: Option<i64>,
    #[serde(default)]
    transact_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OcoResponse {
    order_list_id: i64,
    transaction_time: i64,
    order_reports: Vec<OrderResponse>,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    balances: Vec<BalanceRow>,
}

#[derive(Debug, Deserialize)]
struct BalanceRow {
    asset: String,
    free: String,
    locked: String,
}

// ---- WS kline ----
#[derive(Debug, Deserialize)]
struct KlineEvent {
    #[serde(rename = "k")]
    k: WsKline,
}

#[derive(Debug, Deserialize)]
struct WsKline {
    #[serde(rename = "t")]
    start: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x")]
    is_final: bool,
}

fn order_from_response(pair: &str, r: &OrderResponse) -> Result<Order> {
    let side = match r.side.as_str() {
        "BUY" => Side::Buy,
        "SELL" => Side::Sell,
        s => return Err(EngineError::Venue(format!("unknown side {s}"))),
    };
    let order_type = OrderType::parse(&r.kind)
        .ok_or_else(|| EngineError::Venue(format!("unknown order type {}", r.kind)))?;
    let status = OrderStatus::parse(&r.status)
        .ok_or_else(|| EngineError::Venue(format!("unknown order status {}", r.status)))?;

    // executed orders report their average price
    let cost = num(&r.cumulative_quote_qty);
    let executed = num(&r.executed_qty);
    let (price, quantity) = if cost > 0.0 && executed > 0.0 {
        (cost / executed, executed)
    } else {
        (num(&r.price), num(&r.orig_qty))
    };

    let created = millis(r.time.or(r.transact_time).unwrap_or_else(timestamp_ms));
    let updated = millis(r.update_time.or(r.transact_time).unwrap_or_else(timestamp_ms));
    let stop = r.stop_price.as_deref().map(num).filter(|s| *s > 0.0);
    Ok(Order {
        id: 0,
        exchange_id: r.order_id,
        pair: if pair.is_empty() { r.symbol.clone() } else { pair.to_string() },
        side,
        order_type,
        status,
        quantity,
        price,
        stop,
        // -1 = not part of an order list
        group_id: r.order_list_id.filter(|id| *id >= 0),
        created_at: created,
        updated_at: updated,
        profit: 0.0,
    })
}

/// REST kline row: [openTime, open, high, low, close, volume, closeTime, ...]
fn bar_from_kline(pair: &str, row: &[Value]) -> Result<Bar> {
    let text = |i: usize| -> Result<f64> {
        row.get(i)
            .and_then(|v| v.as_str())
            .map(num)
            .ok_or_else(|| EngineError::Venue(format!("kline field {i} missing")))
    };
    let open_time = row
        .first()
        .and_then(|v| v.as_i64())
        .ok_or_else(|| EngineError::Venue("kline open time missing".into()))?;
    let t = millis(open_time);
    Ok(Bar {
        pair: pair.to_string(),
        time: t,
        updated_at: t,
        open: text(1)?,
        high: text(2)?,
        low: text(3)?,
        close: text(4)?,
        volume: text(5)?,
        complete: true,
        metadata: HashMap::new(),
    })
}

fn bar_from_ws(pair: &str, k: &WsKline) -> Bar {
    let t = millis(k.start);
    Bar {
        pair: pair.to_string(),
        time: t,
        updated_at: Utc::now(),
        open: num(&k.open),
        high: num(&k.high),
        low: num(&k.low),
        close: num(&k.close),
        volume: num(&k.volume),
        complete: k.is_final,
        metadata: HashMap::new(),
    }
}

pub struct BinanceVenue {
    http: reqwest::Client,
    cfg: BinanceConfig,
}

impl BinanceVenue {
    pub fn new(cfg: BinanceConfig) -> Self {
        Self { http: reqwest::Client::new(), cfg }
    }

    async fn signed(&self, method: Method, path: &str, mut params: Vec<(&str, String)>) -> Result<Value> {
        params.push(("recvWindow", self.cfg.recv_window.to_string()));
        params.push(("timestamp", timestamp_ms().to_string()));
        let query = encode_params(&params);
        let sig = sign_query(&self.cfg.api_secret, &query)?;
        let url = format!("{}{}?{}&signature={}", self.cfg.rest_base, path, query, sig);

        let rsp = self
            .http
            .request(method, url)
            .header("X-MBX-APIKEY", &self.cfg.api_key)
            .send()
            .await?;
        Self::decode(rsp).await
    }

    async fn public(&self, path: &str, params: Vec<(&str, String)>) -> Result<Value> {
        let url = format!("{}{}?{}", self.cfg.rest_base, path, encode_params(&params));
        let rsp = self.http.get(url).send().await?;
        Self::decode(rsp).await
    }

    async fn decode(rsp: reqwest::Response) -> Result<Value> {
        let code = rsp.status();
        if !code.is_success() {
            let body = rsp.text().await.unwrap_or_default();
            error!(%code, %body, "binance request failed");
            return Err(EngineError::Venue(format!("{code}: {body}")));
        }
        Ok(rsp.json::<Value>().await?)
    }

    async fn place(&self, pair: &str, params: Vec<(&str, String)>) -> Result<Order> {
        let v = self.signed(Method::POST, "/api/v3/order", params).await?;
        let r: OrderResponse = serde_json::from_value(v)?;
        let order = order_from_response(pair, &r)?;
        ORDERS_CREATED.with_label_values(&[order.order_type.as_str()]).inc();
        info!(id = order.exchange_id, %pair, kind = order.order_type.as_str(), "order sent OK");
        Ok(order)
    }

    async fn klines(&self, pair: &str, params: Vec<(&str, String)>) -> Result<Vec<Bar>> {
        let v = self.public("/api/v3/klines", params).await?;
        let rows: Vec<Vec<Value>> = serde_json::from_value(v)?;
        rows.iter().map(|r| bar_from_kline(pair, r)).collect()
    }
}

#[async_trait]
impl DataFeed for BinanceVenue {
    async fn last_quote(&self, pair: &str) -> Result<f64> {
        let v = self.public("/api/v3/ticker/price", vec![("symbol", pair.to_string())]).await?;
        v.get("price")
            .and_then(|p| p.as_str())
            .map(num)
            .ok_or_else(|| EngineError::NoMarketData(pair.to_string()))
    }

    async fn candles_by_limit(&self, pair: &str, timeframe: &str, limit: usize) -> Result<Vec<Bar>> {
        let mut bars = self
            .klines(
                pair,
                vec![
                    ("symbol", pair.to_string()),
                    ("interval", timeframe.to_string()),
                    ("limit", (limit + 1).to_string()),
                ],
            )
            .await?;
        // last kline is still forming
        bars.pop();
        Ok(bars)
    }

    async fn candles_by_period(
        &self,
        pair: &str,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>> {
        self.klines(
            pair,
            vec![
                ("symbol", pair.to_string()),
                ("interval", timeframe.to_string()),
                ("startTime", start.timestamp_millis().to_string()),
                ("endTime", end.timestamp_millis().to_string()),
            ],
        )
        .await
    }

    async fn candles_subscription(
        &self,
        pair: &str,
        timeframe: &str,
        mut stop: watch::Receiver<bool>,
    ) -> Result<CandleStream> {
        let topic = format!("{}@kline_{}", pair.to_lowercase(), timeframe);
        let ws_url = format!("{}/{}", self.cfg.ws_base.trim_end_matches('/'), topic);
        let url = Url::parse(&ws_url).map_err(|e| EngineError::Venue(format!("bad ws url {ws_url}: {e}")))?;

        let (bar_tx, bar_rx) = mpsc::channel(256);
        let (err_tx, err_rx) = mpsc::channel(16);
        let mut backoff = Backoff::new(self.cfg.backoff_min, self.cfg.backoff_max);
        let pair = pair.to_string();

        tokio::spawn(async move {
            let connected = WS_CONNECTED.with_label_values(&[pair.as_str()]);
            'outer: loop {
                info!(%ws_url, "connecting binance kline stream");
                let conn = select! {
                    c = connect_async(url.clone()) => c,
                    _ = stop.changed() => break,
                };
                match conn {
                    Ok((mut ws, _resp)) => {
                        info!(%pair, "connected to kline stream");
                        backoff.reset();
                        connected.set(1);
                        loop {
                            let frame = select! {
                                f = ws.next() => f,
                                _ = stop.changed() => break 'outer,
                            };
                            let Some(frame) = frame else { break };
                            match frame {
                                Ok(m) if m.is_text() => {
                                    let txt = match m.into_text() {
                                        Ok(t) => t,
                                        Err(e) => {
                                            warn!(?e, "failed to read text frame");
                                            continue;
                                        }
                                    };
                                    match serde_json::from_str::<KlineEvent>(&txt) {
                                        Ok(ev) => {
                                            if bar_tx.send(bar_from_ws(&pair, &ev.k)).await.is_err() {
                                                break 'outer;
                                            }
                                        }
                                        Err(e) => debug!(%e, "ignoring non-kline frame"),
                                    }
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    error!(?e, "ws read error");
                                    let _ = err_tx.try_send(EngineError::from(e));
                                    break;
                                }
                            }
                        }
                        connected.set(0);
                        info!(%pair, "kline stream disconnected, will reconnect");
                    }
                    Err(e) => {
                        error!(?e, "connect failed");
                        let _ = err_tx.try_send(EngineError::from(e));
                    }
                }

                WS_RECONNECTS.with_label_values(&[pair.as_str()]).inc();
                select! {
                    _ = sleep(backoff.next_delay()) => {}
                    _ = stop.changed() => break,
                }
                if *stop.borrow() {
                    break;
                }
            }
            connected.set(0);
            debug!(%pair, "kline subscription closed");
        });

        Ok(CandleStream { bars: bar_rx, errors: err_rx })
    }
}

#[async_trait]
impl Venue for BinanceVenue {
    async fn create_order_market(&self, side: Side, pair: &str, size: f64) -> Result<Order> {
        self.place(
            pair,
            vec![
                ("symbol", pair.to_string()),
                ("side", side.as_str().to_string()),
                ("type", "MARKET".to_string()),
                ("quantity", size.to_string()),
                ("newOrderRespType", "FULL".to_string()),
            ],
        )
        .await
    }

    async fn create_order_market_quote(&self, side: Side, pair: &str, quote: f64) -> Result<Order> {
        self.place(
            pair,
            vec![
                ("symbol", pair.to_string()),
                ("side", side.as_str().to_string()),
                ("type", "MARKET".to_string()),
                ("quoteOrderQty", quote.to_string()),
                ("newOrderRespType", "FULL".to_string()),
            ],
        )
        .await
    }

    async fn create_order_limit(&self, side: Side, pair: &str, size: f64, limit: f64) -> Result<Order> {
        self.place(
            pair,
            vec![
                ("symbol", pair.to_string()),
                ("side", side.as_str().to_string()),
                ("type", "LIMIT".to_string()),
                ("timeInForce", "GTC".to_string()),
                ("quantity", size.to_string()),
                ("price", limit.to_string()),
            ],
        )
        .await
    }

    async fn create_order_stop(&self, pair: &str, size: f64, limit: f64) -> Result<Order> {
        let mut order = self
            .place(
                pair,
                vec![
                    ("symbol", pair.to_string()),
                    ("side", "SELL".to_string()),
                    ("type", "STOP_LOSS".to_string()),
                    ("quantity", size.to_string()),
                    ("stopPrice", limit.to_string()),
                ],
            )
            .await?;
        order.stop = Some(limit);
        order.price = limit;
        order.quantity = size;
        Ok(order)
    }

    async fn create_order_oco(
        &self,
        side: Side,
        pair: &str,
        size: f64,
        price: f64,
        stop: f64,
        stop_limit: f64,
    ) -> Result<Vec<Order>> {
        let v = self
            .signed(
                Method::POST,
                "/api/v3/order/oco",
                vec![
                    ("symbol", pair.to_string()),
                    ("side", side.as_str().to_string()),
                    ("quantity", size.to_string()),
                    ("price", price.to_string()),
                    ("stopPrice", stop.to_string()),
                    ("stopLimitPrice", stop_limit.to_string()),
                    ("stopLimitTimeInForce", "GTC".to_string()),
                ],
            )
            .await?;
        let oco: OcoResponse = serde_json::from_value(v)?;
        let mut legs = Vec::with_capacity(oco.order_reports.len());
        for r in &oco.order_reports {
            let mut leg = order_from_response(pair, r)?;
            leg.group_id = Some(oco.order_list_id);
            leg.created_at = millis(oco.transaction_time);
            leg.updated_at = leg.created_at;
            if leg.order_type.is_stop() {
                leg.stop = Some(stop);
            }
            ORDERS_CREATED.with_label_values(&[leg.order_type.as_str()]).inc();
            legs.push(leg);
        }
        info!(group = oco.order_list_id, %pair, legs = legs.len(), "oco sent OK");
        Ok(legs)
    }

    async fn cancel(&self, order: &Order) -> Result<()> {
        self.signed(
            Method::DELETE,
            "/api/v3/order",
            vec![("symbol", order.pair.clone()), ("orderId", order.exchange_id.to_string())],
        )
        .await?;
        info!(id = order.exchange_id, pair = %order.pair, "cancel sent");
        Ok(())
    }

    async fn order(&self, pair: &str, id: i64) -> Result<Order> {
        let v = self
            .signed(Method::GET, "/api/v3/order", vec![("symbol", pair.to_string()), ("orderId", id.to_string())])
            .await?;
        let r: OrderResponse = serde_json::from_value(v)?;
        order_from_response(pair, &r)
    }

    async fn account(&self) -> Result<Account> {
        let v = self.signed(Method::GET, "/api/v3/account", Vec::new()).await?;
        let acc: AccountResponse = serde_json::from_value(v)?;
        let mut balances = Vec::with_capacity(acc.balances.len());
        for b in acc.balances {
            let free = b.free.parse::<f64>().map_err(|e| EngineError::Venue(format!("balance {}: {e}", b.asset)))?;
            let lock =
                b.locked.parse::<f64>().map_err(|e| EngineError::Venue(format!("balance {}: {e}", b.asset)))?;
            balances.push(Balance { asset: b.asset, free, lock, short: 0.0 });
        }
        Ok(Account { balances })
    }

    async fn position(&self, pair: &str) -> Result<(f64, f64)> {
        let (asset, quote) = split_asset_quote(pair);
        let acc = self.account().await?;
        Ok((acc.balance(&asset).net(), acc.balance(&quote).net()))
    }
}
