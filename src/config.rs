// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : papertrade_rust — backtest & paper-trading engine in Rust
Module  : config.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
License : MIT (see LICENSE)

Summary : Reads .env + environment: pairs, base coin and starting balance,
          fees, reconciliation interval, feed/venue mode, CSV files,
          Binance endpoints & keys, metrics port and JSONL recording.
=============================================================================
*/
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use dotenvy::dotenv;

use crate::binance::BinanceConfig;

/// Venue yang dipakai untuk eksekusi order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VenueMode {
    Paper,
    BinanceSandbox,
    BinanceMainnet,
}

impl VenueMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "paper" | "mock"  => Some(VenueMode::Paper),
            "binance_sandbox" => Some(VenueMode::BinanceSandbox),
            "binance_mainnet" => Some(VenueMode::BinanceMainnet),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VenueMode::Paper          => "paper",
            VenueMode::BinanceSandbox => "binance_sandbox",
            VenueMode::BinanceMainnet => "binance_mainnet",
        }
    }

    pub fn default_rest_url(&self) -> &'static str {
        match self {
            VenueMode::BinanceMainnet => "https://api.binance.com",
            _                         => "https://testnet.binance.vision",
        }
    }
}

/// Sumber bar (market data)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedMode {
    Csv,
    Mock,
    BinanceSandbox,
    BinanceMainnet,
}

impl FeedMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv"             => Some(FeedMode::Csv),
            "mock"            => Some(FeedMode::Mock),
            "binance_sandbox" => Some(FeedMode::BinanceSandbox),
            "binance_mainnet" => Some(FeedMode::BinanceMainnet),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedMode::Csv            => "csv",
            FeedMode::Mock           => "mock",
            FeedMode::BinanceSandbox => "binance_sandbox",
            FeedMode::BinanceMainnet => "binance_mainnet",
        }
    }

    pub fn default_ws_url(&self) -> &'static str {
        match self {
            FeedMode::BinanceMainnet => "wss://stream.binance.com:9443/ws",
            _                        => "wss://testnet.binance.vision/ws",
        }
    }

    pub fn default_rest_url(&self) -> &'static str {
        match self {
            FeedMode::BinanceMainnet => "https://api.binance.com",
            _                        => "https://testnet.binance.vision",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Args {
    pub pairs: Vec<String>,
    pub base_coin: String,
    pub initial_balance: f64,
    pub maker_fee: f64,
    pub taker_fee: f64,
    pub reconcile_interval: Duration,
    pub timeframe: String,
    /// Overrides the strategy's own warmup when set.
    pub warmup_bars: Option<usize>,

    pub record_file: Option<String>,
    pub metrics_port: u16,

    pub venue_mode: VenueMode,
    pub feed_mode: FeedMode,
    pub csv_files: Vec<(String, PathBuf)>,

    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub binance_rest_url: String,
    pub binance_ws_url: String,
    pub binance_api_key: String,
    pub binance_api_secret: String,
    pub binance_recv_window: u64,
}

impl Args {
    pub fn binance(&self) -> BinanceConfig {
        BinanceConfig {
            rest_base: self.binance_rest_url.clone(),
            ws_base: self.binance_ws_url.clone(),
            api_key: self.binance_api_key.clone(),
            api_secret: self.binance_api_secret.clone(),
            recv_window: self.binance_recv_window,
            backoff_min: self.backoff_min,
            backoff_max: self.backoff_max,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

/// "BTCUSDT,ETHUSDT" -> ["BTCUSDT", "ETHUSDT"]
pub fn parse_pairs(s: &str) -> Vec<String> {
    s.split(',')
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
        .map(|x| x.to_ascii_uppercase())
        .collect()
}

/// "BTCUSDT=data/btc.csv,ETHUSDT=data/eth.csv"
pub fn parse_csv_files(s: &str) -> Vec<(String, PathBuf)> {
    s.split(',')
        .filter_map(|item| item.split_once('='))
        .map(|(pair, path)| (pair.trim().to_ascii_uppercase(), PathBuf::from(path.trim())))
        .filter(|(pair, path)| !pair.is_empty() && !path.as_os_str().is_empty())
        .collect()
}

pub fn load() -> Args {
    // .env opsional
    let _ = dotenv();

    let csv_files = env::var("CSV_FILES").map(|s| parse_csv_files(&s)).unwrap_or_default();

    // PAIRS kosong -> ambil dari CSV_FILES, lalu fallback BTCUSDT
    let pairs = env::var("PAIRS")
        .ok()
        .map(|s| parse_pairs(&s))
        .filter(|v| !v.is_empty())
        .or_else(|| {
            let from_csv: Vec<String> = csv_files.iter().map(|(p, _)| p.clone()).collect();
            (!from_csv.is_empty()).then_some(from_csv)
        })
        .unwrap_or_else(|| vec!["BTCUSDT".to_string()]);

    let venue_mode = env::var("VENUE_MODE").ok().and_then(|s| VenueMode::parse(&s)).unwrap_or(VenueMode::Paper);
    let feed_mode = env::var("FEED_MODE").ok().and_then(|s| FeedMode::parse(&s)).unwrap_or(FeedMode::Csv);

    let binance_ws_url = env::var("BINANCE_WS_URL").unwrap_or_else(|_| feed_mode.default_ws_url().to_string());
    let binance_rest_url = env::var("BINANCE_REST_URL").unwrap_or_else(|_| match venue_mode {
        VenueMode::Paper => feed_mode.default_rest_url().to_string(),
        live => live.default_rest_url().to_string(),
    });

    let backoff_min = Duration::from_millis(parse_env("BACKOFF_MIN_MS", 100u64));
    let backoff_max = Duration::from_millis(parse_env("BACKOFF_MAX_MS", 1_000u64)).max(backoff_min);

    Args {
        pairs,
        base_coin: env::var("BASE_COIN").map(|s| s.trim().to_ascii_uppercase()).unwrap_or_else(|_| "USDT".into()),
        initial_balance: parse_env("INITIAL_BALANCE", 10_000.0),
        maker_fee: parse_env("MAKER_FEE", 0.0),
        taker_fee: parse_env("TAKER_FEE", 0.0),
        reconcile_interval: Duration::from_millis(parse_env("RECONCILE_MS", 1_000u64)),
        timeframe: env::var("TIMEFRAME").unwrap_or_else(|_| "1h".into()),
        warmup_bars: env::var("WARMUP_BARS").ok().and_then(|s| s.trim().parse().ok()),
        record_file: env::var("RECORD_FILE").ok().filter(|s| !s.trim().is_empty()),
        metrics_port: parse_env("METRICS_PORT", 9898),
        venue_mode,
        feed_mode,
        csv_files,
        backoff_min,
        backoff_max,
        binance_rest_url,
        binance_ws_url,
        binance_api_key: env::var("BINANCE_API_KEY").unwrap_or_default(),
        binance_api_secret: env::var("BINANCE_API_SECRET").unwrap_or_default(),
        binance_recv_window: parse_env("BINANCE_RECV_WINDOW", 5_000),
    }
}
