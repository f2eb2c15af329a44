// ===============================
// src/strategy.rs
// ===============================
//
// Permukaan strategi berbasis bar:
// - Dataframe          : kolom OHLCV per pair + seri metadata (indikator)
// - Strategy (trait)   : timeframe, warmup, indicators, on_bar, on_partial_bar (opsional)
// - StrategyController : menjaga dataframe, menolak bar telat, memanggil strategi setelah warmup
// - sma/ema/crossover/crossunder : helper indikator
// - CrossEma           : contoh strategi EMA8 x SMA21
//
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::controller::OrderController;
use crate::domain::{Bar, Side};

#[derive(Debug, Clone, Default)]
pub struct Dataframe {
    pub pair: String,
    pub time: Vec<DateTime<Utc>>,
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
    pub volume: Vec<f64>,
    pub last_update: Option<DateTime<Utc>>,
    /// Indicator series, index-aligned with `close`.
    pub metadata: HashMap<String, Vec<f64>>,
}

impl Dataframe {
    pub fn new(pair: &str) -> Self {
        Self { pair: pair.to_string(), ..Default::default() }
    }

    pub fn len(&self) -> usize { self.close.len() }

    pub fn is_empty(&self) -> bool { self.close.is_empty() }

    pub fn last_close(&self) -> Option<f64> { self.close.last().copied() }

    /// Appends `bar`, or overwrites the last row when it has the same open time.
    fn update(&mut self, bar: &Bar) {
        if self.time.last() == Some(&bar.time) {
            let i = self.time.len() - 1;
            self.open[i] = bar.open;
            self.high[i] = bar.high;
            self.low[i] = bar.low;
            self.close[i] = bar.close;
            self.volume[i] = bar.volume;
            for (k, v) in &bar.metadata {
                match self.metadata.get_mut(k).and_then(|s| s.last_mut()) {
                    Some(slot) => *slot = *v,
                    None => {
                        self.metadata.insert(k.clone(), vec![*v]);
                    }
                }
            }
            return;
        }
        self.time.push(bar.time);
        self.open.push(bar.open);
        self.high.push(bar.high);
        self.low.push(bar.low);
        self.close.push(bar.close);
        self.volume.push(bar.volume);
        self.last_update = Some(bar.time);
        for (k, v) in &bar.metadata {
            self.metadata.entry(k.clone()).or_default().push(*v);
        }
    }
}

// ---- indikator ----

/// Simple moving average; the first `period - 1` values are NaN.
pub fn sma(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }
    let mut sum: f64 = values[..period].iter().sum();
    out[period - 1] = sum / period as f64;
    for i in period..values.len() {
        sum += values[i] - values[i - period];
        out[i] = sum / period as f64;
    }
    out
}

/// Exponential moving average seeded with the SMA of the first `period` values.
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut prev = values[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = prev;
    for i in period..values.len() {
        prev += k * (values[i] - prev);
        out[i] = prev;
    }
    out
}

fn last_two(s: &[f64]) -> Option<(f64, f64)> {
    match s {
        [.., a, b] => Some((*a, *b)),
        _ => None,
    }
}

/// `a` moved above `b` on the last value.
pub fn crossover(a: &[f64], b: &[f64]) -> bool {
    match (last_two(a), last_two(b)) {
        (Some((a1, a0)), Some((b1, b0))) => a0 > b0 && a1 <= b1,
        _ => false,
    }
}

/// `a` moved below `b` on the last value.
pub fn crossunder(a: &[f64], b: &[f64]) -> bool {
    match (last_two(a), last_two(b)) {
        (Some((a1, a0)), Some((b1, b0))) => a0 <= b0 && a1 > b1,
        _ => false,
    }
}

#[async_trait]
pub trait Strategy: Send {
    fn timeframe(&self) -> &str;
    /// Bars required before `on_bar` is called.
    fn warmup_period(&self) -> usize;
    fn indicators(&mut self, df: &mut Dataframe);
    async fn on_bar(&mut self, df: &Dataframe, broker: &OrderController);

    /// Strategies that react to forming bars return true and implement `on_partial_bar`.
    fn wants_partial_bars(&self) -> bool { false }
    async fn on_partial_bar(&mut self, _df: &Dataframe, _broker: &OrderController) {}
}

pub struct StrategyController {
    strategy: Box<dyn Strategy>,
    dataframe: Dataframe,
    broker: Arc<OrderController>,
    started: bool,
}

impl StrategyController {
    pub fn new(pair: &str, strategy: Box<dyn Strategy>, broker: Arc<OrderController>) -> Self {
        Self { strategy, dataframe: Dataframe::new(pair), broker, started: false }
    }

    pub fn start(&mut self) {
        self.started = true;
        info!(pair = %self.dataframe.pair, warmup = self.strategy.warmup_period(), "strategy started");
    }

    pub fn pair(&self) -> &str { &self.dataframe.pair }

    pub fn timeframe(&self) -> &str { self.strategy.timeframe() }

    pub fn warmup_period(&self) -> usize { self.strategy.warmup_period() }

    pub fn dataframe(&self) -> &Dataframe { &self.dataframe }

    pub async fn on_bar(&mut self, bar: &Bar) {
        if let Some(last) = self.dataframe.time.last() {
            if bar.time < *last {
                error!(pair = %bar.pair, time = %bar.time, last = %last, "late bar received");
                return;
            }
        }
        self.dataframe.update(bar);
        if self.dataframe.len() >= self.strategy.warmup_period() {
            self.strategy.indicators(&mut self.dataframe);
            if self.started {
                self.strategy.on_bar(&self.dataframe, &self.broker).await;
            }
        }
    }

    pub async fn on_partial_bar(&mut self, bar: &Bar) {
        if bar.complete
            || !self.strategy.wants_partial_bars()
            || self.dataframe.len() < self.strategy.warmup_period()
        {
            return;
        }
        self.dataframe.update(bar);
        self.strategy.indicators(&mut self.dataframe);
        self.strategy.on_partial_bar(&self.dataframe, &self.broker).await;
    }
}

/// EMA(8) crossing SMA(21): buy with all quote on crossover, sell everything on crossunder.
pub struct CrossEma {
    timeframe: String,
}

impl CrossEma {
    pub const MIN_QUOTE: f64 = 10.0;

    pub fn new(timeframe: &str) -> Self { Self { timeframe: timeframe.to_string() } }
}

#[async_trait]
impl Strategy for CrossEma {
    fn timeframe(&self) -> &str { &self.timeframe }

    fn warmup_period(&self) -> usize { 22 }

    fn indicators(&mut self, df: &mut Dataframe) {
        let fast = ema(&df.close, 8);
        let slow = sma(&df.close, 21);
        df.metadata.insert("ema8".into(), fast);
        df.metadata.insert("sma21".into(), slow);
    }

    async fn on_bar(&mut self, df: &Dataframe, broker: &OrderController) {
        let (Some(close), Some(fast), Some(slow)) =
            (df.last_close(), df.metadata.get("ema8"), df.metadata.get("sma21"))
        else {
            return;
        };
        let (asset, quote) = match broker.position(&df.pair).await {
            Ok(p) => p,
            Err(e) => {
                error!(%e, pair = %df.pair, "position lookup failed");
                return;
            }
        };

        if quote >= Self::MIN_QUOTE && crossover(fast, slow) {
            if let Err(e) = broker.create_order_market(Side::Buy, &df.pair, quote / close).await {
                warn!(%e, pair = %df.pair, "cross_ema buy rejected");
            }
        }
        if asset > 0.0 && crossunder(fast, slow) {
            if let Err(e) = broker.create_order_market(Side::Sell, &df.pair, asset).await {
                warn!(%e, pair = %df.pair, "cross_ema sell rejected");
            }
        }
    }
}
