// ===============================
// src/tools.rs
// ===============================
//
// Helper untuk strategi: trailing stop dan order bersyarat (scheduler).
//
use tracing::error;

use crate::controller::OrderController;
use crate::domain::Side;
use crate::strategy::Dataframe;

/// Stop level that follows the price up by the same distance and never moves down.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrailingStop {
    current: f64,
    stop: f64,
    active: bool,
}

impl TrailingStop {
    pub fn new() -> Self { Self::default() }

    pub fn start(&mut self, current: f64, stop: f64) {
        self.current = current;
        self.stop = stop;
        self.active = true;
    }

    pub fn stop(&mut self) { self.active = false; }

    pub fn active(&self) -> bool { self.active }

    pub fn level(&self) -> f64 { self.stop }

    /// Returns true when `current` falls to the stop level.
    pub fn update(&mut self, current: f64) -> bool {
        if !self.active {
            return false;
        }
        if current > self.current {
            self.stop += current - self.current;
            self.current = current;
            return false;
        }
        self.current = current;
        current <= self.stop
    }
}

pub type Condition = Box<dyn Fn(&Dataframe) -> bool + Send + Sync>;

struct OrderCondition {
    condition: Condition,
    size: f64,
    side: Side,
}

/// One-shot market orders fired when their condition holds on the dataframe.
pub struct Scheduler {
    pair: String,
    conditions: Vec<OrderCondition>,
}

impl Scheduler {
    pub fn new(pair: &str) -> Self { Self { pair: pair.to_string(), conditions: Vec::new() } }

    pub fn buy_when(&mut self, size: f64, condition: impl Fn(&Dataframe) -> bool + Send + Sync + 'static) {
        self.conditions.push(OrderCondition { condition: Box::new(condition), size, side: Side::Buy });
    }

    pub fn sell_when(&mut self, size: f64, condition: impl Fn(&Dataframe) -> bool + Send + Sync + 'static) {
        self.conditions.push(OrderCondition { condition: Box::new(condition), size, side: Side::Sell });
    }

    pub fn pending(&self) -> usize { self.conditions.len() }

    /// Fires matching conditions. A condition whose order fails is kept for the next bar.
    pub async fn update(&mut self, df: &Dataframe, broker: &OrderController) {
        let mut keep = Vec::with_capacity(self.conditions.len());
        for oc in std::mem::take(&mut self.conditions) {
            if !(oc.condition)(df) {
                keep.push(oc);
                continue;
            }
            if let Err(e) = broker.create_order_market(oc.side, &self.pair, oc.size).await {
                error!(%e, pair = %self.pair, side = oc.side.as_str(), "scheduled order failed");
                keep.push(oc);
            }
        }
        self.conditions = keep;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Bar;
    use crate::engine::PaperEngine;
    use crate::storage::MemoryStorage;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;
    use std::sync::Arc;

    #[test]
    fn trailing_stop_follows_up_only() {
        let mut ts = TrailingStop::new();
        assert!(!ts.update(1.0));
        ts.start(100.0, 95.0);
        assert!(ts.active());
        assert!(!ts.update(110.0));
        assert_eq!(ts.level(), 105.0);
        assert!(!ts.update(106.0));
        assert_eq!(ts.level(), 105.0);
        assert!(ts.update(105.0));
        ts.stop();
        assert!(!ts.update(1.0));
    }

    #[tokio::test]
    async fn scheduler_fires_once_and_retries_failures() {
        let engine = Arc::new(PaperEngine::builder("USDT").with_asset("USDT", 100.0).build());
        let ctl = OrderController::new(engine.clone(), Arc::new(MemoryStorage::new()));
        let t = Utc.timestamp_opt(60, 0).unwrap();
        let b = Bar {
            pair: "XUSDT".into(),
            time: t,
            updated_at: t,
            open: 10.0,
            high: 10.0,
            low: 10.0,
            close: 10.0,
            volume: 1.0,
            complete: true,
            metadata: HashMap::new(),
        };
        engine.on_bar(&b).await.unwrap();

        let mut df = Dataframe::new("XUSDT");
        df.close.push(10.0);

        let mut s = Scheduler::new("XUSDT");
        s.buy_when(5.0, |df| df.last_close().is_some_and(|c| c <= 10.0));
        // 50 units cost 500 > 100 available
        s.buy_when(50.0, |_| true);
        s.sell_when(1.0, |df| df.last_close().is_some_and(|c| c > 20.0));

        s.update(&df, &ctl).await;
        assert_eq!(s.pending(), 2);
        assert_eq!(ctl.position("XUSDT").await.unwrap().0, 5.0);

        s.update(&df, &ctl).await;
        assert_eq!(s.pending(), 2);
        assert_eq!(ctl.position("XUSDT").await.unwrap().0, 5.0);
    }
}
