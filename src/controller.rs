// ===============================
// src/controller.rs (order lifecycle)
// ===============================
//
// Satu-satunya penulis status order:
// - create/cancel lewat Venue, simpan ke Storage, publish OrderEvent.
// - loop rekonsiliasi periodik: order pending dicek ulang ke Venue.
// - profit dihitung ulang dari replay order FILLED sebelumnya (idempoten per order).
//
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::{
    select,
    sync::{broadcast, watch, Mutex as AsyncMutex},
    task::JoinHandle,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{debug, error, info};

use crate::domain::{Account, Bar, Order, OrderEvent, OrderStatus, Side};
use crate::error::{EngineError, Result};
use crate::metrics::{PNL_REALIZED, RECONCILE_ERRORS, RECONCILE_UPDATES};
use crate::position::{PositionState, Realized};
use crate::posttrade::Notifier;
use crate::stats::TradeSummary;
use crate::storage::{OrderFilter, Storage};
use crate::venue::Venue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerStatus { Running, Stopped, Error }

#[derive(Default)]
struct ControllerState {
    results: BTreeMap<String, TradeSummary>,
    last_price: HashMap<String, f64>,
}

struct Lifecycle {
    status: ControllerStatus,
    stop_tx: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

pub struct OrderController {
    venue: Arc<dyn Venue>,
    storage: Arc<dyn Storage>,
    events: broadcast::Sender<OrderEvent>,
    notifier: Option<Arc<dyn Notifier>>,
    state: AsyncMutex<ControllerState>,
    lifecycle: AsyncMutex<Lifecycle>,
    tick: Duration,
}

impl OrderController {
    pub fn new(venue: Arc<dyn Venue>, storage: Arc<dyn Storage>) -> Self {
        let (events, _) = broadcast::channel(4096);
        Self {
            venue,
            storage,
            events,
            notifier: None,
            state: AsyncMutex::new(ControllerState::default()),
            lifecycle: AsyncMutex::new(Lifecycle {
                status: ControllerStatus::Stopped,
                stop_tx: None,
                handle: None,
            }),
            tick: Duration::from_secs(1),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_interval(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrderEvent> { self.events.subscribe() }

    pub async fn on_bar(&self, bar: &Bar) {
        self.state.lock().await.last_price.insert(bar.pair.clone(), bar.close);
    }

    // ---------------- order placement ----------------

    pub async fn create_order_market(&self, side: Side, pair: &str, size: f64) -> Result<Order> {
        let mut st = self.state.lock().await;
        info!(side = side.as_str(), %pair, size, "creating MARKET order");
        let order = self.venue_call(self.venue.create_order_market(side, pair, size).await)?;
        self.record_new(&mut st, order).await
    }

    pub async fn create_order_market_quote(&self, side: Side, pair: &str, quote: f64) -> Result<Order> {
        let mut st = self.state.lock().await;
        info!(side = side.as_str(), %pair, quote, "creating MARKET order (quote)");
        let order = self.venue_call(self.venue.create_order_market_quote(side, pair, quote).await)?;
        self.record_new(&mut st, order).await
    }

    pub async fn create_order_limit(&self, side: Side, pair: &str, size: f64, limit: f64) -> Result<Order> {
        let mut st = self.state.lock().await;
        info!(side = side.as_str(), %pair, size, limit, "creating LIMIT order");
        let order = self.venue_call(self.venue.create_order_limit(side, pair, size, limit).await)?;
        self.record_new(&mut st, order).await
    }

    pub async fn create_order_stop(&self, pair: &str, size: f64, limit: f64) -> Result<Order> {
        let mut st = self.state.lock().await;
        info!(%pair, size, limit, "creating STOP order");
        let order = self.venue_call(self.venue.create_order_stop(pair, size, limit).await)?;
        self.record_new(&mut st, order).await
    }

    pub async fn create_order_oco(
        &self,
        side: Side,
        pair: &str,
        size: f64,
        price: f64,
        stop: f64,
        stop_limit: f64,
    ) -> Result<Vec<Order>> {
        let mut st = self.state.lock().await;
        info!(side = side.as_str(), %pair, size, price, stop, stop_limit, "creating OCO order");
        let legs = self.venue_call(
            self.venue.create_order_oco(side, pair, size, price, stop, stop_limit).await,
        )?;
        let mut out = Vec::with_capacity(legs.len());
        for leg in legs {
            out.push(self.record_new(&mut st, leg).await?);
        }
        Ok(out)
    }

    /// Cancels a resting order. Final orders are left untouched.
    pub async fn cancel(&self, order: &Order) -> Result<()> {
        let _st = self.state.lock().await;
        let mut stored = self.stored(order).await?;
        if stored.status.is_final() {
            debug!(id = stored.exchange_id, status = %stored.status, "cancel skipped, order already final");
            return Ok(());
        }
        info!(id = stored.exchange_id, pair = %stored.pair, "canceling order");
        self.venue_call(self.venue.cancel(&stored).await)?;
        if stored.status.can_transition_to(OrderStatus::PendingCancel) {
            stored.status = OrderStatus::PendingCancel;
            self.storage.update_order(&stored).await?;
            self.publish(stored, false);
        }
        Ok(())
    }

    // ---------------- reconciliation ----------------

    /// One reconciliation pass over pending orders. Returns how many changed.
    /// Per-order failures are logged and retried next pass.
    pub async fn update_orders(&self) -> usize {
        let mut st = self.state.lock().await;
        self.reconcile(&mut st).await
    }

    async fn reconcile(&self, st: &mut ControllerState) -> usize {
        let pending = match self
            .storage
            .orders(&OrderFilter::new().with_status_in(&OrderStatus::PENDING))
            .await
        {
            Ok(p) => p,
            Err(e) => {
                self.report(&e, "reconcile: list pending orders failed");
                return 0;
            }
        };

        // persist every change first so the profit replay sees all fills of this pass
        let mut changed = Vec::new();
        for mut order in pending {
            let fresh = match self.venue.order(&order.pair, order.exchange_id).await {
                Ok(o) => o,
                Err(e) => {
                    self.report(&e, "reconcile: venue lookup failed");
                    continue;
                }
            };
            if fresh.status == order.status {
                continue;
            }
            if !order.status.can_transition_to(fresh.status) {
                debug!(id = order.exchange_id, from = %order.status, to = %fresh.status, "reconcile: ignoring backward status");
                continue;
            }

            order.status = fresh.status;
            order.updated_at = fresh.updated_at;
            if let Err(e) = self.storage.update_order(&order).await {
                self.report(&e, "reconcile: storage update failed");
                continue;
            }
            changed.push(order);
        }

        // attribution in execution order
        changed.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        let count = changed.len();
        for mut order in changed {
            if order.status == OrderStatus::Filled {
                if let Err(e) = self.process_trade(st, &mut order).await {
                    self.report(&e, "reconcile: profit attribution failed");
                }
            }
            RECONCILE_UPDATES.with_label_values(&[order.status.as_str()]).inc();
            info!(id = order.exchange_id, pair = %order.pair, status = %order.status, "order updated");
            self.publish(order, false);
        }
        count
    }

    /// Spawns the periodic reconciliation loop.
    pub async fn start(self: &Arc<Self>) {
        let mut lc = self.lifecycle.lock().await;
        if lc.status == ControllerStatus::Running {
            return;
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let me = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut tick = interval(me.tick);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                select! {
                    _ = tick.tick() => {
                        me.update_orders().await;
                    }
                    res = stop_rx.changed() => {
                        if res.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("reconcile loop stopped");
        });
        lc.stop_tx = Some(stop_tx);
        lc.handle = Some(handle);
        lc.status = ControllerStatus::Running;
        info!(interval_ms = self.tick.as_millis() as u64, "order controller started");
    }

    /// One last reconciliation pass, then halts the loop.
    pub async fn stop(&self) {
        let mut lc = self.lifecycle.lock().await;
        self.update_orders().await;
        if let Some(tx) = lc.stop_tx.take() {
            let _ = tx.send(true);
        }
        let mut status = ControllerStatus::Stopped;
        if let Some(handle) = lc.handle.take() {
            if let Err(e) = handle.await {
                error!(?e, "reconcile loop ended abnormally");
                status = ControllerStatus::Error;
            }
        }
        lc.status = status;
        info!("order controller stopped");
    }

    pub async fn status(&self) -> ControllerStatus { self.lifecycle.lock().await.status }

    // ---------------- profit attribution ----------------

    /// Runs once per order: on creation when the venue filled it right away,
    /// otherwise on the reconcile pass that stores it as FILLED. Filled is
    /// final, so no later pass lists the order again.
    async fn process_trade(&self, st: &mut ControllerState, order: &mut Order) -> Result<()> {
        if order.status != OrderStatus::Filled {
            return Ok(());
        }
        let realized = self.calculate_profit(order).await?;

        let summary = st
            .results
            .entry(order.pair.clone())
            .or_insert_with(|| TradeSummary::new(&order.pair));
        summary.volume += order.quantity * order.execution_price();

        let Some(r) = realized else { return Ok(()) };
        order.profit = r.percent;
        summary.record(r.profit, r.long);
        PNL_REALIZED.with_label_values(&[order.pair.as_str()]).set(summary.profit());
        self.storage.update_order(order).await?;

        let kind = if r.long { "LONG" } else { "SHORT" };
        let message = format!(
            "[PROFIT] {} {} {:.4} ({:.2}%)\n{}",
            kind,
            order.pair,
            r.profit,
            r.percent * 100.0,
            summary
        );
        info!(id = order.exchange_id, pair = %order.pair, profit = r.profit, pct = r.percent, kind, "trade closed");
        if let Some(n) = &self.notifier {
            n.notify(&message);
        }
        Ok(())
    }

    /// Replays earlier fills of the same pair from the order log and applies
    /// `order` on top. Earlier = updated before, or same time and stored before.
    pub async fn calculate_profit(&self, order: &Order) -> Result<Option<Realized>> {
        let fills = self
            .storage
            .orders(
                &OrderFilter::new()
                    .with_status(OrderStatus::Filled)
                    .with_pair(&order.pair)
                    .with_updated_at_before_or_equal(order.updated_at),
            )
            .await?;
        let mut earlier: Vec<&Order> = fills
            .iter()
            .filter(|o| o.id != order.id && precedes(o, order.updated_at, order.id))
            .collect();
        earlier.sort_by_key(|o| o.updated_at);

        let mut position = PositionState::replay(earlier);
        Ok(position.apply(order.side, order.quantity, order.execution_price()))
    }

    // ---------------- passthroughs ----------------

    pub async fn account(&self) -> Result<Account> { self.venue.account().await }

    pub async fn position(&self, pair: &str) -> Result<(f64, f64)> { self.venue.position(pair).await }

    /// Asset quantity valued at the last seen close.
    pub async fn position_value(&self, pair: &str) -> Result<f64> {
        let (asset, _) = self.venue.position(pair).await?;
        let st = self.state.lock().await;
        let price = st
            .last_price
            .get(pair)
            .copied()
            .ok_or_else(|| EngineError::NoMarketData(pair.to_string()))?;
        Ok(asset * price)
    }

    pub async fn last_quote(&self, pair: &str) -> Result<f64> { self.venue.last_quote(pair).await }

    pub async fn order(&self, pair: &str, id: i64) -> Result<Order> { self.venue.order(pair, id).await }

    pub async fn results(&self) -> Vec<TradeSummary> {
        self.state.lock().await.results.values().cloned().collect()
    }

    pub async fn summary(&self) -> String {
        let st = self.state.lock().await;
        let mut out = String::new();
        let mut total = 0.0;
        for s in st.results.values() {
            total += s.profit();
            out.push_str(&s.to_string());
            out.push('\n');
        }
        out.push_str(&format!("TOTAL PROFIT = {total:.4}\n"));
        out
    }

    // ---------------- helpers ----------------

    async fn record_new(&self, st: &mut ControllerState, mut order: Order) -> Result<Order> {
        // resting orders that traded before this one must be in the log first
        if order.status == OrderStatus::Filled {
            self.reconcile(st).await;
        }
        // venue-side order stays alive even if this fails
        self.storage.create_order(&mut order).await?;
        if order.status == OrderStatus::Filled {
            self.process_trade(st, &mut order).await?;
        }
        self.publish(order.clone(), true);
        Ok(order)
    }

    async fn stored(&self, order: &Order) -> Result<Order> {
        let orders = self.storage.orders(&OrderFilter::new().with_pair(&order.pair)).await?;
        orders
            .into_iter()
            .find(|o| (order.id != 0 && o.id == order.id) || o.exchange_id == order.exchange_id)
            .ok_or(EngineError::OrderNotFound(order.exchange_id))
    }

    fn venue_call<T>(&self, res: Result<T>) -> Result<T> {
        res.map_err(|e| {
            if let Some(n) = &self.notifier {
                n.on_error(&e);
            }
            e
        })
    }

    fn publish(&self, order: Order, is_new: bool) {
        // no subscribers is fine
        let _ = self.events.send(OrderEvent { order, is_new });
    }

    fn report(&self, e: &EngineError, what: &str) {
        RECONCILE_ERRORS.inc();
        error!(%e, "{what}");
        if let Some(n) = &self.notifier {
            n.on_error(e);
        }
    }
}

fn precedes(o: &Order, time: DateTime<Utc>, id: u64) -> bool {
    o.updated_at < time || (o.updated_at == time && o.id < id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PaperEngine;
    use crate::storage::MemoryStorage;
    use chrono::TimeZone;

    fn flat(pair: &str, minute: i64, c: f64) -> Bar {
        let time = Utc.timestamp_opt(minute * 60, 0).unwrap();
        Bar {
            pair: pair.into(),
            time,
            updated_at: time,
            open: c,
            high: c,
            low: c,
            close: c,
            volume: 1.0,
            complete: true,
            metadata: Default::default(),
        }
    }

    fn setup(usdt: f64) -> (Arc<PaperEngine>, Arc<MemoryStorage>, OrderController) {
        let engine = Arc::new(PaperEngine::builder("USDT").with_asset("USDT", usdt).build());
        let storage = Arc::new(MemoryStorage::new());
        let ctl = OrderController::new(engine.clone(), storage.clone());
        (engine, storage, ctl)
    }

    #[tokio::test]
    async fn market_close_attributes_profit_once() {
        let (engine, storage, ctl) = setup(10_000.0);
        engine.on_bar(&flat("XUSDT", 1, 10.0)).await.unwrap();
        ctl.create_order_market(Side::Buy, "XUSDT", 50.0).await.unwrap();
        engine.on_bar(&flat("XUSDT", 2, 8.0)).await.unwrap();
        let sell = ctl.create_order_market(Side::Sell, "XUSDT", 50.0).await.unwrap();

        assert!((sell.profit + 0.2).abs() < 1e-9);
        let results = ctl.results().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].lose_long, vec![-100.0]);

        // reconciliation must not double count filled orders
        assert_eq!(ctl.update_orders().await, 0);
        assert_eq!(ctl.results().await[0].trades(), 1);
        let stored = storage.orders(&OrderFilter::new().with_pair("XUSDT")).await.unwrap();
        assert!((stored[1].profit + 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn reconcile_publishes_one_event_per_change() {
        let (engine, _storage, ctl) = setup(1_000.0);
        let mut events = ctl.subscribe();
        let o = ctl.create_order_limit(Side::Buy, "XUSDT", 10.0, 10.0).await.unwrap();
        let created = events.recv().await.unwrap();
        assert!(created.is_new);
        assert_eq!(created.order.id, o.id);

        assert_eq!(ctl.update_orders().await, 0);
        engine.on_bar(&flat("XUSDT", 1, 9.0)).await.unwrap();
        assert_eq!(ctl.update_orders().await, 1);
        assert_eq!(ctl.update_orders().await, 0);

        let update = events.recv().await.unwrap();
        assert!(!update.is_new);
        assert_eq!(update.order.status, OrderStatus::Filled);
        assert!(events.try_recv().is_err());
    }

    fn realized_sum(trades: &[crate::engine::RealizedTrade]) -> f64 {
        trades.iter().map(|t| t.realized.profit).sum()
    }

    #[tokio::test]
    async fn fills_seen_in_one_pass_attribute_in_execution_order() {
        let (engine, _storage, ctl) = setup(100.0);
        engine.on_bar(&flat("XUSDT", 1, 10.0)).await.unwrap();
        ctl.create_order_market(Side::Buy, "XUSDT", 1.0).await.unwrap();
        // stored first, trades last
        ctl.create_order_limit(Side::Sell, "XUSDT", 1.0, 12.0).await.unwrap();
        ctl.create_order_limit(Side::Buy, "XUSDT", 1.0, 9.0).await.unwrap();

        engine.on_bar(&flat("XUSDT", 2, 9.0)).await.unwrap();
        engine.on_bar(&flat("XUSDT", 3, 12.0)).await.unwrap();
        assert_eq!(ctl.update_orders().await, 2);

        // long 2 @ 9.5, one sold at 12
        let results = ctl.results().await;
        assert_eq!(results[0].win_long, vec![2.5]);
        assert_eq!(results[0].profit(), realized_sum(&engine.realized().await));
    }

    #[tokio::test]
    async fn immediate_fill_sees_unreconciled_resting_fills() {
        let (engine, storage, ctl) = setup(100.0);
        engine.on_bar(&flat("XUSDT", 1, 10.0)).await.unwrap();
        ctl.create_order_market(Side::Buy, "XUSDT", 1.0).await.unwrap();
        ctl.create_order_limit(Side::Buy, "XUSDT", 1.0, 9.0).await.unwrap();
        engine.on_bar(&flat("XUSDT", 2, 9.0)).await.unwrap();
        engine.on_bar(&flat("XUSDT", 3, 12.0)).await.unwrap();

        // no reconcile pass in between: the sell must still replay the limit fill
        let sell = ctl.create_order_market(Side::Sell, "XUSDT", 1.0).await.unwrap();
        assert!((sell.profit - 2.5 / 9.5).abs() < 1e-12);
        assert_eq!(ctl.results().await[0].profit(), realized_sum(&engine.realized().await));
        let stored = storage.orders(&OrderFilter::new().with_status(OrderStatus::Filled)).await.unwrap();
        assert_eq!(stored.len(), 3);
    }

    #[tokio::test]
    async fn cancel_goes_through_pending_cancel() {
        let (_engine, storage, ctl) = setup(1_000.0);
        let o = ctl.create_order_limit(Side::Buy, "XUSDT", 1.0, 10.0).await.unwrap();
        ctl.cancel(&o).await.unwrap();
        let stored = &storage.orders(&OrderFilter::new()).await.unwrap()[0];
        assert_eq!(stored.status, OrderStatus::PendingCancel);

        assert_eq!(ctl.update_orders().await, 1);
        let stored = &storage.orders(&OrderFilter::new()).await.unwrap()[0];
        assert_eq!(stored.status, OrderStatus::Canceled);

        // canceling again is a no-op
        ctl.cancel(&o).await.unwrap();
        assert_eq!(ctl.update_orders().await, 0);
    }

    #[tokio::test]
    async fn failed_create_publishes_nothing() {
        let (engine, storage, ctl) = setup(10.0);
        let mut events = ctl.subscribe();
        engine.on_bar(&flat("XUSDT", 1, 10.0)).await.unwrap();
        let err = ctl.create_order_market(Side::Buy, "XUSDT", 5.0).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));
        assert!(events.try_recv().is_err());
        assert!(storage.orders(&OrderFilter::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oco_leg_fill_and_sibling_cancel_reconciled() {
        let (engine, storage, ctl) = setup(1_000.0);
        engine.on_bar(&flat("XUSDT", 1, 10.0)).await.unwrap();
        ctl.create_order_market(Side::Buy, "XUSDT", 10.0).await.unwrap();
        let legs = ctl.create_order_oco(Side::Sell, "XUSDT", 10.0, 12.0, 9.0, 8.5).await.unwrap();
        assert_eq!(legs.len(), 2);

        engine.on_bar(&flat("XUSDT", 2, 8.0)).await.unwrap();
        assert_eq!(ctl.update_orders().await, 2);

        let stored = storage.orders(&OrderFilter::new()).await.unwrap();
        assert_eq!(stored[1].status, OrderStatus::Canceled);
        assert_eq!(stored[2].status, OrderStatus::Filled);
        // stop leg executes at its stop: (9 - 10) * 10
        assert_eq!(ctl.results().await[0].lose_long, vec![-10.0]);
    }

    #[tokio::test]
    async fn start_stop_runs_final_reconcile() {
        let (engine, storage, ctl) = setup(1_000.0);
        let ctl = Arc::new(ctl.with_interval(Duration::from_secs(3600)));
        ctl.start().await;
        assert_eq!(ctl.status().await, ControllerStatus::Running);

        ctl.create_order_limit(Side::Buy, "XUSDT", 1.0, 10.0).await.unwrap();
        engine.on_bar(&flat("XUSDT", 1, 9.0)).await.unwrap();
        ctl.stop().await;

        assert_eq!(ctl.status().await, ControllerStatus::Stopped);
        let stored = storage.orders(&OrderFilter::new()).await.unwrap();
        assert_eq!(stored[0].status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn position_value_uses_last_close() {
        let (engine, _storage, ctl) = setup(1_000.0);
        let bar = flat("XUSDT", 1, 10.0);
        engine.on_bar(&bar).await.unwrap();
        ctl.on_bar(&bar).await;
        ctl.create_order_market(Side::Buy, "XUSDT", 3.0).await.unwrap();
        assert_eq!(ctl.position_value("XUSDT").await.unwrap(), 30.0);
        assert!(matches!(ctl.position_value("YUSDT").await, Err(EngineError::NoMarketData(_))));
    }
}
