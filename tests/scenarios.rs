// End-to-end order flows through OrderController -> PaperEngine -> MemoryStorage.
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use papertrade_rust::{
    controller::OrderController,
    domain::{Bar, OrderStatus, OrderType, Side},
    engine::PaperEngine,
    stats::max_drawdown,
    storage::{MemoryStorage, OrderFilter, Storage},
    venue::Venue,
};

fn bar(minute: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
    let t = Utc.timestamp_opt(minute * 60, 0).unwrap();
    Bar {
        pair: "XUSDT".into(),
        time: t,
        updated_at: t,
        open,
        high,
        low,
        close,
        volume: 1.0,
        complete: true,
        metadata: HashMap::new(),
    }
}

fn flat(minute: i64, close: f64) -> Bar { bar(minute, close, close, close, close) }

struct Harness {
    engine: Arc<PaperEngine>,
    storage: Arc<MemoryStorage>,
    ctl: Arc<OrderController>,
}

impl Harness {
    fn new(engine: PaperEngine) -> Self {
        let engine = Arc::new(engine);
        let storage = Arc::new(MemoryStorage::new());
        let ctl = Arc::new(OrderController::new(engine.clone(), storage.clone()));
        Self { engine, storage, ctl }
    }

    async fn step(&self, b: &Bar) -> usize {
        self.engine.on_bar(b).await.unwrap();
        let n = self.ctl.update_orders().await;
        self.ctl.on_bar(b).await;
        n
    }

    async fn free(&self, asset: &str) -> f64 {
        self.engine.account().await.unwrap().balance(asset).free
    }
}

#[tokio::test]
async fn market_round_trip_realizes_loss() {
    let h = Harness::new(PaperEngine::builder("USDT").with_asset("USDT", 10_000.0).build());
    h.step(&flat(1, 10.0)).await;
    h.ctl.create_order_market(Side::Buy, "XUSDT", 500.0 / 10.0).await.unwrap();
    assert_eq!(h.free("X").await, 50.0);
    assert_eq!(h.free("USDT").await, 9_500.0);

    h.step(&flat(2, 12.0)).await;
    h.step(&flat(3, 8.0)).await;
    let sell = h.ctl.create_order_market(Side::Sell, "XUSDT", 50.0).await.unwrap();
    assert!((sell.profit + 0.2).abs() < 1e-12);
    assert_eq!(h.free("USDT").await, 9_900.0);

    let results = h.ctl.results().await;
    assert_eq!(results[0].lose(), vec![-100.0]);
    assert_eq!(h.engine.realized().await[0].realized.profit, -100.0);

    // start 10000, marked 10100 at close 12, then 9900
    let dd = max_drawdown(&h.engine.equity_values().await);
    assert!((dd.fraction - (-200.0 / 10_100.0)).abs() < 1e-12);
}

#[tokio::test]
async fn limit_and_stop_fill_at_their_own_prices() {
    let h = Harness::new(PaperEngine::builder("USDT").with_asset("X", 2.0).build());
    h.ctl.create_order_limit(Side::Sell, "XUSDT", 1.0, 12.0).await.unwrap();
    h.ctl.create_order_stop("XUSDT", 1.0, 9.0).await.unwrap();

    assert_eq!(h.step(&bar(1, 11.0, 13.0, 10.0, 11.0)).await, 1);
    assert_eq!(h.free("USDT").await, 12.0);

    assert_eq!(h.step(&bar(2, 10.0, 10.5, 8.5, 9.5)).await, 1);
    assert_eq!(h.free("USDT").await, 21.0);

    let filled = h.storage.orders(&OrderFilter::new().with_status(OrderStatus::Filled)).await.unwrap();
    let prices: Vec<f64> = filled.iter().map(|o| o.execution_price()).collect();
    assert_eq!(prices, vec![12.0, 9.0]);
}

#[tokio::test]
async fn oco_sibling_is_canceled_without_balance_effect() {
    let h = Harness::new(PaperEngine::builder("USDT").with_asset("X", 1.0).build());
    let legs = h.ctl.create_order_oco(Side::Sell, "XUSDT", 1.0, 12.0, 9.0, 8.5).await.unwrap();
    assert_eq!(legs.len(), 2);
    assert_eq!(legs[0].group_id, legs[1].group_id);

    let acc = h.engine.account().await.unwrap().balance("X");
    assert_eq!((acc.free, acc.lock), (0.0, 1.0));

    // the limit leg trades, the stop leg must not
    assert_eq!(h.step(&bar(1, 11.0, 12.5, 8.0, 11.0)).await, 2);
    let x = h.engine.account().await.unwrap().balance("X");
    assert_eq!((x.free, x.lock), (0.0, 0.0));
    assert_eq!(h.free("USDT").await, 12.0);

    let stored = h.storage.orders(&OrderFilter::new()).await.unwrap();
    let limit = stored.iter().find(|o| o.order_type == OrderType::LimitMaker).unwrap();
    let stop = stored.iter().find(|o| o.order_type == OrderType::StopLoss).unwrap();
    assert_eq!(limit.status, OrderStatus::Filled);
    assert_eq!(stop.status, OrderStatus::Canceled);
    assert_eq!(stop.price, legs.iter().find(|o| o.order_type == OrderType::StopLoss).unwrap().price);
}

#[tokio::test]
async fn reconciliation_reports_each_change_once() {
    let h = Harness::new(PaperEngine::builder("USDT").with_asset("USDT", 100.0).build());
    let mut events = h.ctl.subscribe();
    h.ctl.create_order_limit(Side::Buy, "XUSDT", 1.0, 10.0).await.unwrap();
    h.ctl.create_order_limit(Side::Buy, "XUSDT", 1.0, 5.0).await.unwrap();
    assert!(events.try_recv().unwrap().is_new);
    assert!(events.try_recv().unwrap().is_new);

    assert_eq!(h.step(&flat(1, 9.0)).await, 1);
    let ev = events.try_recv().unwrap();
    assert!(!ev.is_new);
    assert_eq!(ev.order.status, OrderStatus::Filled);
    assert!(events.try_recv().is_err());

    assert_eq!(h.ctl.update_orders().await, 0);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn short_then_cover_round_trip() {
    let h = Harness::new(PaperEngine::builder("USDT").with_asset("USDT", 1_000.0).build());
    h.step(&flat(1, 10.0)).await;
    h.ctl.create_order_market(Side::Sell, "XUSDT", 10.0).await.unwrap();
    let (asset, _) = h.ctl.position("XUSDT").await.unwrap();
    assert_eq!(asset, -10.0);

    h.step(&flat(2, 8.0)).await;
    let cover = h.ctl.create_order_market(Side::Buy, "XUSDT", 10.0).await.unwrap();
    assert!((cover.profit - 0.2).abs() < 1e-12);

    let summary = &h.ctl.results().await[0];
    assert_eq!(summary.win(), vec![20.0]);
    assert_eq!(h.free("USDT").await, 1_020.0);
    let x = h.engine.account().await.unwrap().balance("X");
    assert_eq!((x.free, x.lock, x.short), (0.0, 0.0, 0.0));
}

#[tokio::test]
async fn resting_cover_buys_each_lock_their_cost() {
    let h = Harness::new(PaperEngine::builder("USDT").with_asset("USDT", 1_000.0).build());
    h.step(&flat(1, 20.0)).await;
    h.ctl.create_order_market(Side::Sell, "XUSDT", 10.0).await.unwrap();
    assert_eq!(h.free("USDT").await, 800.0);

    let mut accepted = 0;
    for _ in 0..7 {
        if h.ctl.create_order_limit(Side::Buy, "XUSDT", 10.0, 20.0).await.is_ok() {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 4);

    assert_eq!(h.step(&flat(2, 20.0)).await, 4);
    let usdt = h.engine.account().await.unwrap().balance("USDT");
    assert_eq!((usdt.free, usdt.lock), (400.0, 0.0));
    let x = h.engine.account().await.unwrap().balance("X");
    assert_eq!((x.free, x.short), (30.0, 0.0));
    // flat price, nothing gained or lost
    assert_eq!(h.engine.equity_values().await.last().unwrap().value, 1_000.0);
}
