// ===============================
// src/lib.rs
// ===============================
pub mod binance;      // live venue (signed REST + kline WS)
pub mod bot;
pub mod config;
pub mod controller;   // order lifecycle, reconciliation, profit attribution
pub mod domain;
pub mod engine;       // paper matching engine & wallet
pub mod error;
pub mod feed;         // csv / mock bars, reconnect backoff
pub mod ledger;
pub mod metrics;
pub mod position;
pub mod posttrade;
pub mod recorder;
pub mod stats;
pub mod storage;
pub mod strategy;
pub mod tools;
pub mod venue;
