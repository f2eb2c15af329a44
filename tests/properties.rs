// Random order flows: engine-side incremental profit must match the
// controller's replay, no balance may go negative, and the wallet value at
// the last close must equal the start value plus realized and open profit.
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

use papertrade_rust::{
    controller::OrderController,
    domain::{Bar, OrderStatus, Side},
    engine::PaperEngine,
    position::PositionState,
    storage::{MemoryStorage, OrderFilter, Storage},
    venue::Venue,
};

const TOL: f64 = 1e-6;
const START: f64 = 1_000.0;

#[derive(Debug, Clone)]
enum Action {
    Market(Side, f64),
    Limit(Side, f64, f64),
    CancelOldest,
}

fn side() -> impl Strategy<Value = Side> {
    prop_oneof![Just(Side::Buy), Just(Side::Sell)]
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        3 => (side(), 0.1f64..20.0).prop_map(|(s, q)| Action::Market(s, q)),
        3 => (side(), 0.1f64..20.0, 0.8f64..1.2).prop_map(|(s, q, k)| Action::Limit(s, q, k)),
        1 => Just(Action::CancelOldest),
    ]
}

fn bar(minute: i64, close: f64) -> Bar {
    let t = Utc.timestamp_opt(minute * 60, 0).unwrap();
    Bar {
        pair: "XUSDT".into(),
        time: t,
        updated_at: t,
        open: close,
        high: close * 1.01,
        low: close * 0.99,
        close,
        volume: 1.0,
        complete: true,
        metadata: HashMap::new(),
    }
}

async fn check_balances(engine: &PaperEngine) -> Result<(), TestCaseError> {
    for b in engine.account().await.unwrap().balances {
        prop_assert!(b.free >= -TOL, "{} free {}", b.asset, b.free);
        prop_assert!(b.lock >= -TOL, "{} lock {}", b.asset, b.lock);
        prop_assert!(b.short >= -TOL, "{} short {}", b.asset, b.short);
        // never long and short at once
        prop_assert!(b.short < TOL || b.free + b.lock < TOL, "{} mixed {:?}", b.asset, b);
    }
    Ok(())
}

async fn run_case(steps: Vec<(f64, Vec<Action>)>, every: usize) -> Result<(), TestCaseError> {
    let engine = Arc::new(PaperEngine::builder("USDT").with_asset("USDT", START).build());
    let storage = Arc::new(MemoryStorage::new());
    let ctl = OrderController::new(engine.clone(), storage.clone());

    let mut last_close = 0.0;
    for (i, (price, actions)) in steps.into_iter().enumerate() {
        engine.on_bar(&bar(i as i64 + 1, price)).await.unwrap();
        last_close = price;
        // reconcile lags behind the bars, several fills per pass
        if i % every == 0 {
            ctl.update_orders().await;
        }

        for action in actions {
            // rejected orders are part of the exercise
            let _ = match action {
                Action::Market(s, q) => ctl.create_order_market(s, "XUSDT", q).await.map(|_| ()),
                Action::Limit(s, q, k) => ctl.create_order_limit(s, "XUSDT", q, price * k).await.map(|_| ()),
                Action::CancelOldest => {
                    let open = storage.orders(&OrderFilter::new().with_status(OrderStatus::New)).await.unwrap();
                    match open.first() {
                        Some(o) => ctl.cancel(o).await,
                        None => Ok(()),
                    }
                }
            };
            check_balances(&engine).await?;
        }
    }
    ctl.update_orders().await;

    let stored = storage.orders(&OrderFilter::new()).await.unwrap();
    let realized = engine.realized().await;
    for trade in &realized {
        let order = stored.iter().find(|o| o.exchange_id == trade.exchange_id).unwrap();
        let replay = ctl.calculate_profit(order).await.unwrap();
        prop_assert!(replay.is_some(), "replay found no closing trade for {}", order);
        let replay = replay.unwrap();
        prop_assert!(
            (replay.profit - trade.realized.profit).abs() < TOL,
            "order {}: replay {} vs incremental {}",
            order.exchange_id,
            replay.profit,
            trade.realized.profit
        );
    }

    let attributed: f64 = ctl.results().await.iter().map(|s| s.profit()).sum();
    let incremental: f64 = realized.iter().map(|t| t.realized.profit).sum();
    prop_assert!((attributed - incremental).abs() < TOL, "attributed {} vs incremental {}", attributed, incremental);

    // fees are zero: value = start + realized + open profit at the last close
    let mut fills: Vec<_> = stored.iter().filter(|o| o.status == OrderStatus::Filled).collect();
    fills.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
    let position = PositionState::replay(fills);
    let (net, _) = engine.position("XUSDT").await.unwrap();
    prop_assert!((net - position.quantity).abs() < TOL, "ledger net {} vs position {}", net, position.quantity);

    let open_profit = if position.quantity > 0.0 {
        position.quantity * (last_close - position.avg_long)
    } else {
        -position.quantity * (position.avg_short - last_close)
    };
    let value = engine.summary().await.final_value;
    prop_assert!(
        (value - (START + incremental + open_profit)).abs() < TOL,
        "value {} vs start {} + realized {} + open {}",
        value,
        START,
        incremental,
        open_profit
    );
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn incremental_matches_replay_and_value_is_conserved(
        steps in prop::collection::vec(
            (5.0f64..50.0, prop::collection::vec(action(), 0..4)),
            1..40,
        ),
        every in 1usize..5,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(run_case(steps, every))?;
    }
}
