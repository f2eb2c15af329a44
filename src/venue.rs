// ===============================
// src/venue.rs
// ===============================
//
// Kapabilitas venue: dipenuhi oleh PaperEngine (simulasi) atau BinanceVenue (live).
// OrderController hanya tahu trait ini.
//
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};

use crate::domain::{Account, Bar, Order, Side};
use crate::error::{EngineError, Result};

/// Long-lived bar subscription. Both channels close when the source stops.
pub struct CandleStream {
    pub bars: mpsc::Receiver<Bar>,
    pub errors: mpsc::Receiver<EngineError>,
}

/// Market data side of a venue.
#[async_trait]
pub trait DataFeed: Send + Sync {
    async fn last_quote(&self, pair: &str) -> Result<f64>;
    async fn candles_by_limit(&self, pair: &str, timeframe: &str, limit: usize) -> Result<Vec<Bar>>;
    async fn candles_by_period(
        &self,
        pair: &str,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>>;
    /// Streams bars until `stop` flips to `true` or the source fails for good.
    async fn candles_subscription(
        &self,
        pair: &str,
        timeframe: &str,
        stop: watch::Receiver<bool>,
    ) -> Result<CandleStream>;
}

#[async_trait]
pub trait Venue: DataFeed {
    async fn create_order_market(&self, side: Side, pair: &str, size: f64) -> Result<Order>;
    async fn create_order_market_quote(&self, side: Side, pair: &str, quote: f64) -> Result<Order>;
    async fn create_order_limit(&self, side: Side, pair: &str, size: f64, limit: f64) -> Result<Order>;
    /// Sell stop-limit: triggers when price falls to `limit`.
    async fn create_order_stop(&self, pair: &str, size: f64, limit: f64) -> Result<Order>;
    async fn create_order_oco(
        &self,
        side: Side,
        pair: &str,
        size: f64,
        price: f64,
        stop: f64,
        stop_limit: f64,
    ) -> Result<Vec<Order>>;
    async fn cancel(&self, order: &Order) -> Result<()>;
    async fn order(&self, pair: &str, id: i64) -> Result<Order>;
    async fn account(&self) -> Result<Account>;
    /// (asset quantity, quote quantity) held for `pair`.
    async fn position(&self, pair: &str) -> Result<(f64, f64)>;
}

/// "1m", "4h", "1d", "1w" -> duration.
pub fn timeframe_duration(tf: &str) -> Option<chrono::Duration> {
    let tf = tf.trim();
    let split = tf.find(|c: char| !c.is_ascii_digit())?;
    let (n, unit) = tf.split_at(split);
    let n: i64 = n.parse().ok()?;
    match unit {
        "s" => Some(chrono::Duration::seconds(n)),
        "m" => Some(chrono::Duration::minutes(n)),
        "h" => Some(chrono::Duration::hours(n)),
        "d" => Some(chrono::Duration::days(n)),
        "w" => Some(chrono::Duration::weeks(n)),
        _ => None,
    }
}
