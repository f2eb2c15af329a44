// ===============================
// src/stats.rs
// ===============================
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{split_asset_quote, AssetValue};

/// Closed-trade results for one pair, split by direction.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TradeSummary {
    pub pair: String,
    pub win_long: Vec<f64>,
    pub win_short: Vec<f64>,
    pub lose_long: Vec<f64>,
    pub lose_short: Vec<f64>,
    pub volume: f64,
}

impl TradeSummary {
    pub fn new(pair: &str) -> Self {
        Self { pair: pair.to_string(), ..Default::default() }
    }

    pub fn record(&mut self, profit: f64, long: bool) {
        match (profit >= 0.0, long) {
            (true, true) => self.win_long.push(profit),
            (true, false) => self.win_short.push(profit),
            (false, true) => self.lose_long.push(profit),
            (false, false) => self.lose_short.push(profit),
        }
    }

    pub fn win(&self) -> Vec<f64> {
        self.win_long.iter().chain(&self.win_short).copied().collect()
    }

    pub fn lose(&self) -> Vec<f64> {
        self.lose_long.iter().chain(&self.lose_short).copied().collect()
    }

    pub fn trades(&self) -> usize {
        self.win_long.len() + self.win_short.len() + self.lose_long.len() + self.lose_short.len()
    }

    pub fn profit(&self) -> f64 {
        self.win().iter().chain(self.lose().iter()).sum()
    }

    pub fn win_percentage(&self) -> f64 {
        let n = self.trades();
        if n == 0 {
            return 0.0;
        }
        self.win().len() as f64 / n as f64 * 100.0
    }

    /// avg(win) / |avg(lose)|, 0 when either side is empty.
    pub fn payoff(&self) -> f64 {
        let (win, lose) = (self.win(), self.lose());
        if win.is_empty() || lose.is_empty() {
            return 0.0;
        }
        let avg_win = win.iter().sum::<f64>() / win.len() as f64;
        let avg_lose = lose.iter().sum::<f64>() / lose.len() as f64;
        if avg_lose == 0.0 {
            return 0.0;
        }
        avg_win / avg_lose.abs()
    }

    /// System quality number: sqrt(n) * mean / stddev (population).
    pub fn sqn(&self) -> f64 {
        let n = self.trades();
        if n == 0 {
            return 0.0;
        }
        let all: Vec<f64> = self.win().into_iter().chain(self.lose()).collect();
        let total = n as f64;
        let mean = all.iter().sum::<f64>() / total;
        let var = all.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / total;
        let std = var.sqrt();
        if std == 0.0 {
            return 0.0;
        }
        total.sqrt() * mean / std
    }
}

impl fmt::Display for TradeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (_, quote) = split_asset_quote(&self.pair);
        let rows = [
            ("Coin", self.pair.clone()),
            ("Trades", self.trades().to_string()),
            ("Win", self.win().len().to_string()),
            ("Loss", self.lose().len().to_string()),
            ("% Win", format!("{:.1}", self.win_percentage())),
            ("Payoff", format!("{:.1}", self.payoff() * 100.0)),
            ("SQN", format!("{:.1}", self.sqn())),
            ("Profit", format!("{:.4} {}", self.profit(), quote)),
            ("Volume", format!("{:.4} {}", self.volume, quote)),
        ];
        writeln!(f, "+--------+----------------------+")?;
        for (k, v) in rows {
            writeln!(f, "| {:<6} | {:>20} |", k, v)?;
        }
        write!(f, "+--------+----------------------+")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Drawdown {
    /// Negative fraction of the base value (0 when equity never declined).
    pub fraction: f64,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// Largest cumulative decline over the equity series.
pub fn max_drawdown(values: &[AssetValue]) -> Drawdown {
    if values.len() < 2 {
        return Drawdown::default();
    }

    // `local` starts positive so the first delta always opens a window
    let mut local = f64::INFINITY;
    let mut local_base = values[0].value;
    let mut local_start = values[0].time;
    let mut local_end = values[0].time;

    let mut global = 0.0_f64;
    let mut global_base = local_base;
    let mut span: Option<(DateTime<Utc>, DateTime<Utc>)> = None;

    for w in values.windows(2) {
        let (prev, cur) = (w[0], w[1]);
        let delta = cur.value - prev.value;
        if local >= 0.0 {
            local = delta;
            local_base = prev.value;
            local_start = prev.time;
            local_end = cur.time;
        } else {
            local += delta;
            local_end = cur.time;
        }

        if local < global {
            global = local;
            global_base = local_base;
            span = Some((local_start, local_end));
        }
    }

    match span {
        Some((start, end)) if global_base != 0.0 => Drawdown {
            fraction: global / global_base,
            start: Some(start),
            end: Some(end),
        },
        _ => Drawdown::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn series(values: &[f64]) -> Vec<AssetValue> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| AssetValue { time: Utc.timestamp_opt(i as i64 * 60, 0).unwrap(), value: *v })
            .collect()
    }

    #[test]
    fn rising_equity_has_no_drawdown() {
        let dd = max_drawdown(&series(&[100.0, 101.0, 105.0, 130.0]));
        assert_eq!(dd.fraction, 0.0);
        assert!(dd.start.is_none());
    }

    #[test]
    fn v_shape_drawdown() {
        let s = series(&[100.0, 80.0, 120.0]);
        let dd = max_drawdown(&s);
        assert!((dd.fraction + 0.2).abs() < 1e-12);
        assert_eq!(dd.start, Some(s[0].time));
        assert_eq!(dd.end, Some(s[1].time));
    }

    #[test]
    fn deepest_of_two_declines() {
        let dd = max_drawdown(&series(&[100.0, 90.0, 110.0, 100.0, 70.0, 120.0]));
        // 110 -> 70
        assert!((dd.fraction - (-40.0 / 110.0)).abs() < 1e-12);
    }

    #[test]
    fn short_series() {
        assert_eq!(max_drawdown(&series(&[100.0])), Drawdown::default());
        assert_eq!(max_drawdown(&[]), Drawdown::default());
    }

    #[test]
    fn summary_metrics() {
        let mut s = TradeSummary::new("BTCUSDT");
        s.record(10.0, true);
        s.record(20.0, false);
        s.record(-5.0, true);
        assert_eq!(s.trades(), 3);
        assert!((s.win_percentage() - 200.0 / 3.0).abs() < 1e-9);
        assert!((s.payoff() - 3.0).abs() < 1e-9);
        assert!((s.profit() - 25.0).abs() < 1e-9);

        let mean = 25.0 / 3.0;
        let std = ((10.0_f64 - mean).powi(2) + (20.0 - mean).powi(2) + (-5.0 - mean).powi(2)) / 3.0;
        let expected = 3.0_f64.sqrt() * mean / std.sqrt();
        assert!((s.sqn() - expected).abs() < 1e-9);
    }

    #[test]
    fn empty_summary_is_zeroed() {
        let s = TradeSummary::new("ETHUSDT");
        assert_eq!(s.payoff(), 0.0);
        assert_eq!(s.sqn(), 0.0);
        assert_eq!(s.win_percentage(), 0.0);
        assert!(s.to_string().contains("ETHUSDT"));
    }
}
