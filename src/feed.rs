// ===============================
// src/feed.rs
// ===============================
//
// Market data adapters (bars):
// - CsvFeed   : historical bars per pair from CSV (time,open,close,low,high,volume)
// - MockFeed  : random-walk bar generator for offline paper trading
// - Backoff   : exponential reconnect delay, dipakai oleh stream live
//
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use tokio::{
    select,
    sync::{mpsc, watch, Mutex as AsyncMutex},
    time::{sleep, Duration},
};
use tracing::{debug, info, warn};

use crate::domain::Bar;
use crate::error::{EngineError, Result};
use crate::venue::{timeframe_duration, CandleStream, DataFeed};

/// Exponential backoff with a ceiling; `reset()` after a successful connect.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max: max.max(min), attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let shift = self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);
        let base = self.min.saturating_mul(1u32 << shift);
        // jitter up to a quarter of the floor
        let jitter_ms = (self.min.as_millis() as u64 / 4).max(1);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        (base + jitter).min(self.max)
    }

    pub fn reset(&mut self) { self.attempt = 0; }

    pub fn attempt(&self) -> u32 { self.attempt }
}

// ----------------------------------------------------------------------------
// CSV
// ----------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct CsvFeed {
    bars: HashMap<String, Vec<Bar>>,
}

impl CsvFeed {
    pub fn new() -> Self { Self::default() }

    pub fn with_file(mut self, pair: &str, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        let bars = read_bars(pair, file)?;
        info!(%pair, path = %path.display(), bars = bars.len(), "csv feed loaded");
        self.bars.insert(pair.to_string(), bars);
        Ok(self)
    }

    pub fn with_bars(mut self, pair: &str, mut bars: Vec<Bar>) -> Self {
        bars.sort_by_key(|b| b.time);
        self.bars.insert(pair.to_string(), bars);
        self
    }

    pub fn pairs(&self) -> Vec<String> {
        let mut p: Vec<String> = self.bars.keys().cloned().collect();
        p.sort();
        p
    }

    pub fn bars(&self, pair: &str) -> &[Bar] {
        self.bars.get(pair).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// All pairs merged into one time-ordered sequence (stable per pair).
    pub fn merged(&self) -> Vec<Bar> {
        let mut all: Vec<Bar> = self.pairs().iter().flat_map(|p| self.bars(p).to_vec()).collect();
        all.sort_by_key(|b| b.time);
        all
    }

    fn series(&self, pair: &str) -> Result<&Vec<Bar>> {
        self.bars
            .get(pair)
            .ok_or_else(|| EngineError::Venue(format!("no csv data for {pair}")))
    }
}

/// Parses `time,open,close,low,high,volume` rows (unix seconds). A header row is skipped.
pub fn read_bars<R: Read>(pair: &str, reader: R) -> Result<Vec<Bar>> {
    let mut rdr = csv::ReaderBuilder::new().has_headers(false).trim(csv::Trim::All).from_reader(reader);
    let mut bars = Vec::new();
    for (i, rec) in rdr.records().enumerate() {
        let rec = rec?;
        let field = |n: usize| -> Option<f64> { rec.get(n).and_then(|s| s.parse::<f64>().ok()) };
        let Some(ts) = rec.get(0).and_then(|s| s.parse::<i64>().ok()) else {
            if i == 0 {
                continue;
            }
            return Err(EngineError::Storage(format!("csv row {}: bad timestamp", i + 1)));
        };
        let (Some(open), Some(close), Some(low), Some(high), Some(volume)) =
            (field(1), field(2), field(3), field(4), field(5))
        else {
            return Err(EngineError::Storage(format!("csv row {}: expected 6 numeric columns", i + 1)));
        };
        let time = Utc
            .timestamp_opt(ts, 0)
            .single()
            .ok_or_else(|| EngineError::Storage(format!("csv row {}: timestamp out of range", i + 1)))?;
        bars.push(Bar {
            pair: pair.to_string(),
            time,
            updated_at: time,
            open,
            high,
            low,
            close,
            volume,
            complete: true,
            metadata: HashMap::new(),
        });
    }
    bars.sort_by_key(|b| b.time);
    Ok(bars)
}

#[async_trait]
impl DataFeed for CsvFeed {
    async fn last_quote(&self, pair: &str) -> Result<f64> {
        self.series(pair)?
            .last()
            .map(|b| b.close)
            .ok_or_else(|| EngineError::NoMarketData(pair.to_string()))
    }

    async fn candles_by_limit(&self, pair: &str, _timeframe: &str, limit: usize) -> Result<Vec<Bar>> {
        let s = self.series(pair)?;
        Ok(s[s.len().saturating_sub(limit)..].to_vec())
    }

    async fn candles_by_period(
        &self,
        pair: &str,
        _timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>> {
        Ok(self
            .series(pair)?
            .iter()
            .filter(|b| b.time >= start && b.time < end)
            .cloned()
            .collect())
    }

    async fn candles_subscription(
        &self,
        pair: &str,
        _timeframe: &str,
        mut stop: watch::Receiver<bool>,
    ) -> Result<CandleStream> {
        let bars = self.series(pair)?.clone();
        let (bar_tx, bar_rx) = mpsc::channel(1024);
        let (_err_tx, err_rx) = mpsc::channel(1);
        let pair = pair.to_string();
        tokio::spawn(async move {
            for bar in bars {
                if *stop.borrow() {
                    break;
                }
                select! {
                    sent = bar_tx.send(bar) => if sent.is_err() { break },
                    _ = stop.changed() => break,
                }
            }
            debug!(%pair, "csv replay finished");
        });
        Ok(CandleStream { bars: bar_rx, errors: err_rx })
    }
}

// ----------------------------------------------------------------------------
// Mock
// ----------------------------------------------------------------------------

/// Random-walk bars starting at `start_price`, one per `every`.
pub struct MockFeed {
    start_price: f64,
    every: Duration,
    last: AsyncMutex<HashMap<String, f64>>,
}

impl MockFeed {
    pub fn new(start_price: f64, every: Duration) -> Self {
        Self { start_price, every, last: AsyncMutex::new(HashMap::new()) }
    }
}

fn walk(pair: &str, prev: f64, time: DateTime<Utc>) -> Bar {
    // jangan simpan ThreadRng melewati .await
    let mut rng = rand::thread_rng();
    let close = (prev * (1.0 + rng.gen_range(-0.01..=0.01))).max(0.01);
    let high = prev.max(close) * (1.0 + rng.gen_range(0.0..=0.003));
    let low = prev.min(close) * (1.0 - rng.gen_range(0.0..=0.003));
    Bar {
        pair: pair.to_string(),
        time,
        updated_at: time,
        open: prev,
        high,
        low,
        close,
        volume: rng.gen_range(1.0..100.0),
        complete: true,
        metadata: HashMap::new(),
    }
}

#[async_trait]
impl DataFeed for MockFeed {
    async fn last_quote(&self, pair: &str) -> Result<f64> {
        Ok(self.last.lock().await.get(pair).copied().unwrap_or(self.start_price))
    }

    async fn candles_by_limit(&self, pair: &str, timeframe: &str, limit: usize) -> Result<Vec<Bar>> {
        let step = timeframe_duration(timeframe)
            .ok_or_else(|| EngineError::Venue(format!("bad timeframe {timeframe}")))?;
        let now = Utc::now();
        let mut price = self.start_price;
        let mut out = Vec::with_capacity(limit);
        for i in (1..=limit as i32).rev() {
            let bar = walk(pair, price, now - step * i);
            price = bar.close;
            out.push(bar);
        }
        self.last.lock().await.insert(pair.to_string(), price);
        Ok(out)
    }

    async fn candles_by_period(
        &self,
        pair: &str,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>> {
        let step = timeframe_duration(timeframe)
            .ok_or_else(|| EngineError::Venue(format!("bad timeframe {timeframe}")))?;
        let mut price = self.start_price;
        let mut out = Vec::new();
        let mut t = start;
        while t < end {
            let bar = walk(pair, price, t);
            price = bar.close;
            out.push(bar);
            t += step;
        }
        Ok(out)
    }

    async fn candles_subscription(
        &self,
        pair: &str,
        _timeframe: &str,
        mut stop: watch::Receiver<bool>,
    ) -> Result<CandleStream> {
        let (bar_tx, bar_rx) = mpsc::channel(256);
        let (_err_tx, err_rx) = mpsc::channel(1);
        let mut price = self.last_quote(pair).await?;
        let every = self.every;
        let pair = pair.to_string();
        tokio::spawn(async move {
            loop {
                select! {
                    _ = sleep(every) => {}
                    _ = stop.changed() => break,
                }
                if *stop.borrow() {
                    break;
                }
                let bar = walk(&pair, price, Utc::now());
                price = bar.close;
                if bar_tx.send(bar).await.is_err() {
                    warn!(%pair, "mock feed receiver dropped");
                    break;
                }
            }
        });
        Ok(CandleStream { bars: bar_rx, errors: err_rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn backoff_grows_to_ceiling_and_resets() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        let first = b.next_delay();
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        for _ in 0..20 {
            assert!(b.next_delay() <= Duration::from_secs(1));
        }
        assert_eq!(b.next_delay(), Duration::from_secs(1));
        b.reset();
        assert_eq!(b.attempt(), 0);
        assert!(b.next_delay() <= Duration::from_millis(125));
    }

    #[test]
    fn reads_csv_with_header() {
        let data = "time,open,close,low,high,volume\n120,10,11,9,12,5\n60,9,10,8,10.5,3\n";
        let bars = read_bars("BTCUSDT", data.as_bytes()).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].time.timestamp(), 60);
        assert_eq!(bars[1].close, 11.0);
        assert_eq!(bars[1].high, 12.0);
        assert_eq!(bars[1].low, 9.0);
    }

    #[test]
    fn rejects_malformed_rows() {
        let data = "60,9,10,8,10.5,3\n120,x,11,9,12,5\n";
        assert!(matches!(read_bars("BTCUSDT", data.as_bytes()), Err(EngineError::Storage(_))));
    }

    #[tokio::test]
    async fn csv_file_queries() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for i in 1..=5 {
            writeln!(f, "{},{},{},{},{},1", i * 60, i, i, i, i).unwrap();
        }
        let feed = CsvFeed::new().with_file("XUSDT", f.path()).unwrap();
        let tail = feed.candles_by_limit("XUSDT", "1m", 2).await.unwrap();
        assert_eq!(tail.iter().map(|b| b.close).collect::<Vec<_>>(), vec![4.0, 5.0]);

        let start = Utc.timestamp_opt(120, 0).unwrap();
        let end = Utc.timestamp_opt(240, 0).unwrap();
        assert_eq!(feed.candles_by_period("XUSDT", "1m", start, end).await.unwrap().len(), 2);
        assert_eq!(feed.last_quote("XUSDT").await.unwrap(), 5.0);
        assert!(feed.last_quote("YUSDT").await.is_err());
    }

    #[tokio::test]
    async fn csv_subscription_replays_then_closes() {
        let feed = CsvFeed::new().with_bars(
            "XUSDT",
            read_bars("XUSDT", "60,1,1,1,1,1\n120,2,2,2,2,1\n".as_bytes()).unwrap(),
        );
        let (_stop_tx, stop_rx) = watch::channel(false);
        let mut stream = feed.candles_subscription("XUSDT", "1m", stop_rx).await.unwrap();
        assert_eq!(stream.bars.recv().await.unwrap().close, 1.0);
        assert_eq!(stream.bars.recv().await.unwrap().close, 2.0);
        assert!(stream.bars.recv().await.is_none());
    }

    #[tokio::test]
    async fn mock_history_is_ordered() {
        let feed = MockFeed::new(100.0, Duration::from_millis(10));
        let bars = feed.candles_by_limit("XUSDT", "1m", 30).await.unwrap();
        assert_eq!(bars.len(), 30);
        assert!(bars.windows(2).all(|w| w[0].time < w[1].time));
        assert!(bars.iter().all(|b| b.low <= b.close && b.close <= b.high));
        assert_eq!(feed.last_quote("XUSDT").await.unwrap(), bars[29].close);
    }
}
