// ===============================
// src/error.rs
// ===============================
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::OrderStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("insufficient funds: {pair} quantity {quantity}")]
    InsufficientFunds { pair: String, quantity: f64 },

    #[error("invalid quantity: {0}")]
    InvalidQuantity(f64),

    #[error("order not found: {0}")]
    OrderNotFound(i64),

    #[error("stale bar for {pair}: {time} is before {last}")]
    StaleBar { pair: String, time: DateTime<Utc>, last: DateTime<Utc> },

    #[error("no market data for {0}")]
    NoMarketData(String),

    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("venue error: {0}")]
    Venue(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Stale bars are dropped by callers; everything else is surfaced.
    pub fn is_stale(&self) -> bool { matches!(self, EngineError::StaleBar { .. }) }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self { EngineError::Venue(e.to_string()) }
}

impl From<tokio_tungstenite::tungstenite::Error> for EngineError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self { EngineError::Venue(e.to_string()) }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self { EngineError::Venue(format!("decode: {e}")) }
}

impl From<csv::Error> for EngineError {
    fn from(e: csv::Error) -> Self { EngineError::Storage(format!("csv: {e}")) }
}

pub type Result<T> = std::result::Result<T, EngineError>;
