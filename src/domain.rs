// ===============================
// src/domain.rs
// ===============================
use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side { Buy, Sell }
impl Side {
    pub fn sign(&self) -> f64 { match self { Side::Buy => 1.0, Side::Sell => -1.0 } }
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "BUY", Side::Sell => "SELL" } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    LimitMaker,
    TakeProfit,
    TakeProfitLimit,
    StopLoss,
    StopLossLimit,
}

impl OrderType {
    /// Stop types execute at the stop trigger, not at the limit price.
    pub fn is_stop(&self) -> bool {
        matches!(self, OrderType::StopLoss | OrderType::StopLossLimit)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market          => "MARKET",
            OrderType::Limit           => "LIMIT",
            OrderType::LimitMaker      => "LIMIT_MAKER",
            OrderType::TakeProfit      => "TAKE_PROFIT",
            OrderType::TakeProfitLimit => "TAKE_PROFIT_LIMIT",
            OrderType::StopLoss        => "STOP_LOSS",
            OrderType::StopLossLimit   => "STOP_LOSS_LIMIT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MARKET"            => Some(OrderType::Market),
            "LIMIT"             => Some(OrderType::Limit),
            "LIMIT_MAKER"       => Some(OrderType::LimitMaker),
            "TAKE_PROFIT"       => Some(OrderType::TakeProfit),
            "TAKE_PROFIT_LIMIT" => Some(OrderType::TakeProfitLimit),
            "STOP_LOSS"         => Some(OrderType::StopLoss),
            "STOP_LOSS_LIMIT"   => Some(OrderType::StopLossLimit),
            _ => None,
        }
    }
}

/// Lifecycle of an order. `Rejected` and `Expired` are the venue's error outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    PendingCancel,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub const PENDING: [OrderStatus; 3] =
        [OrderStatus::New, OrderStatus::PartiallyFilled, OrderStatus::PendingCancel];

    pub fn is_final(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }

    /// Forward-only transitions. Same-status is not a transition.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (a, b) if *a == b => false,
            (New, _) => true,
            (PartiallyFilled, Filled | PendingCancel | Canceled | Rejected | Expired) => true,
            (PendingCancel, Filled | Canceled | Rejected | Expired) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New             => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled          => "FILLED",
            OrderStatus::PendingCancel   => "PENDING_CANCEL",
            OrderStatus::Canceled        => "CANCELED",
            OrderStatus::Rejected        => "REJECTED",
            OrderStatus::Expired         => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW"              => Some(OrderStatus::New),
            "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
            "FILLED"           => Some(OrderStatus::Filled),
            "PENDING_CANCEL"   => Some(OrderStatus::PendingCancel),
            "CANCELED"         => Some(OrderStatus::Canceled),
            "REJECTED"         => Some(OrderStatus::Rejected),
            "EXPIRED"          => Some(OrderStatus::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Storage id, assigned by the order log (0 until persisted).
    pub id: u64,
    /// Id assigned by the venue.
    pub exchange_id: i64,
    pub pair: String,
    pub side: Side,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub quantity: f64,
    pub price: f64,
    pub stop: Option<f64>,
    pub group_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Realized profit fraction, set once the fill closes part of a position.
    pub profit: f64,
}

impl Order {
    pub fn execution_price(&self) -> f64 {
        match (self.order_type.is_stop(), self.stop) {
            (true, Some(stop)) => stop,
            _ => self.price,
        }
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} | ID: {}, Type: {}, {} x ${:.4} (~${:.2})",
            self.status,
            self.side.as_str(),
            self.pair,
            self.exchange_id,
            self.order_type.as_str(),
            self.quantity,
            self.price,
            self.quantity * self.price,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub pair: String,
    pub time: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// `false` while the interval is still forming.
    pub complete: bool,
    #[serde(default)]
    pub metadata: HashMap<String, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: f64,
    pub lock: f64,
    /// Borrowed quantity of a short position.
    pub short: f64,
}

impl Balance {
    /// Signed net holding: negative when short.
    pub fn net(&self) -> f64 { self.free + self.lock - self.short }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Account { pub balances: Vec<Balance> }

impl Account {
    pub fn balance(&self, asset: &str) -> Balance {
        self.balances
            .iter()
            .find(|b| b.asset == asset)
            .cloned()
            .unwrap_or_else(|| Balance { asset: asset.to_string(), ..Default::default() })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AssetValue { pub time: DateTime<Utc>, pub value: f64 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent { pub order: Order, pub is_new: bool }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event { Bar(Bar), Order(OrderEvent), Equity(AssetValue), Note(String) }

const QUOTES: [&str; 9] = ["USDT", "BUSD", "USDC", "TUSD", "FDUSD", "BTC", "ETH", "BNB", "EUR"];

/// "BTCUSDT" -> ("BTC", "USDT"). Also accepts "BTC/USDT" and "BTC-USDT".
pub fn split_asset_quote(pair: &str) -> (String, String) {
    let up = pair.to_ascii_uppercase();
    if let Some((a, q)) = up.split_once(&['/', '-'][..]) {
        return (a.to_string(), q.to_string());
    }
    for q in QUOTES {
        if up.len() > q.len() && up.ends_with(q) {
            return (up[..up.len() - q.len()].to_string(), q.to_string());
        }
    }
    (up, String::new())
}
