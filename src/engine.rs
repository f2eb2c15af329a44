// ===============================
// src/engine.rs (paper venue)
// ===============================
//
// Simulated matching & accounting venue:
// - Bar adalah satu-satunya jam: order resting dievaluasi terhadap OHLC bar.
// - Seluruh state (ledger, order, avg price, equity) di belakang satu lock.
// - Market order fill di close bar terakhir; limit/stop/OCO menunggu bar berikutnya.
//
use std::fmt;
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info};

use crate::domain::{split_asset_quote, Account, AssetValue, Bar, Order, OrderStatus, OrderType, Side};
use crate::error::{EngineError, Result};
use crate::ledger::{AssetId, Fill, Ledger, Reservation};
use crate::metrics::{BARS_BY_PAIR, EQUITY, FILLS, ORDERS_CREATED};
use crate::position::{PositionState, Realized};
use crate::stats::{max_drawdown, Drawdown};
use crate::venue::{CandleStream, DataFeed, Venue};

/// Market quantities are floored to this step.
const LOT_STEP: f64 = 1e-8;

#[derive(Debug, Clone, Copy, Default)]
pub struct Fees {
    pub maker: f64,
    pub taker: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PairId(usize);

#[derive(Debug)]
struct PairSlot {
    pair: String,
    asset: AssetId,
    quote: AssetId,
    position: PositionState,
    first: Option<Bar>,
    last: Option<Bar>,
    volume: f64,
}

/// A fill that closed (part of) a position, as seen by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct RealizedTrade {
    pub exchange_id: i64,
    pub pair: String,
    pub time: DateTime<Utc>,
    pub realized: Realized,
}

struct EngineState {
    base_coin: String,
    fees: Fees,
    counter: i64,
    initial_value: f64,
    /// Non-base deposits, valued at the first bar of their pair.
    seeds: HashMap<String, f64>,
    ledger: Ledger,
    index: HashMap<String, PairId>,
    pairs: Vec<PairSlot>,
    orders: Vec<Order>,
    /// keyed by group id for OCO legs, by exchange id otherwise
    reservations: HashMap<i64, Reservation>,
    asset_values: HashMap<String, Vec<AssetValue>>,
    equity: Vec<AssetValue>,
    realized: Vec<RealizedTrade>,
}

pub struct PaperEngineBuilder {
    base_coin: String,
    fees: Fees,
    deposits: Vec<(String, f64)>,
    feed: Option<Arc<dyn DataFeed>>,
}

impl PaperEngineBuilder {
    pub fn with_asset(mut self, symbol: &str, amount: f64) -> Self {
        self.deposits.push((symbol.to_ascii_uppercase(), amount));
        self
    }

    pub fn with_fees(mut self, maker: f64, taker: f64) -> Self {
        self.fees = Fees { maker, taker };
        self
    }

    pub fn with_feed(mut self, feed: Arc<dyn DataFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn build(self) -> PaperEngine {
        let mut ledger = Ledger::new();
        let mut initial_value = 0.0;
        let mut seeds = HashMap::new();
        for (symbol, amount) in &self.deposits {
            ledger.deposit(symbol, *amount);
            if *symbol == self.base_coin {
                initial_value += amount;
            } else {
                *seeds.entry(symbol.clone()).or_insert(0.0) += amount;
            }
        }
        ledger.id(&self.base_coin);

        PaperEngine {
            state: AsyncMutex::new(EngineState {
                base_coin: self.base_coin,
                fees: self.fees,
                counter: 0,
                initial_value,
                seeds,
                ledger,
                index: HashMap::new(),
                pairs: Vec::new(),
                orders: Vec::new(),
                reservations: HashMap::new(),
                asset_values: HashMap::new(),
                equity: Vec::new(),
                realized: Vec::new(),
            }),
            feed: self.feed,
        }
    }
}

pub struct PaperEngine {
    state: AsyncMutex<EngineState>,
    feed: Option<Arc<dyn DataFeed>>,
}

impl PaperEngine {
    pub fn builder(base_coin: &str) -> PaperEngineBuilder {
        PaperEngineBuilder {
            base_coin: base_coin.to_ascii_uppercase(),
            fees: Fees::default(),
            deposits: Vec::new(),
            feed: None,
        }
    }

    /// Advances simulated time for `bar.pair`: fills triggered resting orders
    /// and, for complete bars, appends an equity sample. Returns every order
    /// whose status changed.
    pub async fn on_bar(&self, bar: &Bar) -> Result<Vec<Order>> {
        let mut st = self.state.lock().await;
        let pid = st.slot(&bar.pair);

        if let Some(last) = &st.pairs[pid.0].last {
            if bar.time < last.time {
                return Err(EngineError::StaleBar {
                    pair: bar.pair.clone(),
                    time: bar.time,
                    last: last.time,
                });
            }
        }
        if st.pairs[pid.0].first.is_none() {
            st.seed(pid, bar.close);
            st.pairs[pid.0].first = Some(bar.clone());
        }
        st.pairs[pid.0].last = Some(bar.clone());
        BARS_BY_PAIR.with_label_values(&[bar.pair.as_str()]).inc();

        let mut changed = Vec::new();
        for i in 0..st.orders.len() {
            // re-check: an earlier fill in this loop may have canceled this one
            let o = &st.orders[i];
            if o.pair != bar.pair || o.status != OrderStatus::New {
                continue;
            }
            if let Some(price) = trigger_price(o, bar) {
                changed.extend(st.fill_resting(i, pid, price, bar.time));
            }
        }

        if bar.complete {
            st.revalue(bar.time);
        }
        Ok(changed)
    }

    pub async fn equity_values(&self) -> Vec<AssetValue> {
        self.state.lock().await.equity.clone()
    }

    pub async fn asset_values(&self, asset: &str) -> Vec<AssetValue> {
        self.state.lock().await.asset_values.get(asset).cloned().unwrap_or_default()
    }

    pub async fn max_drawdown(&self) -> Drawdown {
        max_drawdown(&self.state.lock().await.equity)
    }

    pub async fn realized(&self) -> Vec<RealizedTrade> {
        self.state.lock().await.realized.clone()
    }

    pub async fn pairs(&self) -> Vec<String> {
        self.state.lock().await.pairs.iter().map(|p| p.pair.clone()).collect()
    }

    pub async fn summary(&self) -> WalletSummary {
        let st = self.state.lock().await;
        let mut holdings = Vec::new();
        let mut total = 0.0;
        let mut market_change = 0.0;
        let mut priced = 0usize;
        let mut volume = Vec::new();

        for slot in &st.pairs {
            volume.push((slot.pair.clone(), slot.volume));
            let (Some(first), Some(last)) = (&slot.first, &slot.last) else { continue };
            let quantity = st.ledger.net(slot.asset);
            let value = liquidation_value(quantity, slot.position.avg_short, last.close);
            total += value;
            if first.close != 0.0 {
                market_change += (last.close - first.close) / first.close;
                priced += 1;
            }
            holdings.push(Holding {
                asset: st.ledger.balance(slot.asset).asset,
                quantity,
                value,
            });
        }

        let base = st.ledger.lookup(&st.base_coin).map(|id| st.ledger.balance(id)).unwrap_or_default();
        let base_value = base.free + base.lock;
        let final_value = total + base_value;
        let profit = final_value - st.initial_value;
        WalletSummary {
            base_coin: st.base_coin.clone(),
            holdings,
            base_value,
            start_value: st.initial_value,
            final_value,
            profit,
            profit_pct: if st.initial_value != 0.0 { profit / st.initial_value } else { 0.0 },
            market_change: if priced > 0 { market_change / priced as f64 } else { 0.0 },
            max_drawdown: max_drawdown(&st.equity),
            volume,
        }
    }

    async fn place(
        &self,
        side: Side,
        pair: &str,
        order_type: OrderType,
        size: f64,
        price: f64,
        stop: Option<f64>,
    ) -> Result<Order> {
        check_size(size)?;
        check_size(price)?;
        let mut st = self.state.lock().await;
        let pid = st.slot(pair);
        let fill = st.fill_for(pid, side, size, price, false);
        let reservation = st.reserve(pid, fill, false)?;
        let order = st.new_order(pid, side, order_type, size, price, stop, None, OrderStatus::New);
        st.reservations.insert(order.exchange_id, reservation);
        st.orders.push(order.clone());
        ORDERS_CREATED.with_label_values(&[order_type.as_str()]).inc();
        debug!(id = order.exchange_id, pair = %order.pair, kind = order_type.as_str(), "paper order resting");
        Ok(order)
    }
}

#[async_trait]
impl Venue for PaperEngine {
    async fn create_order_market(&self, side: Side, pair: &str, size: f64) -> Result<Order> {
        check_size(size)?;
        let mut st = self.state.lock().await;
        let pid = st.slot(pair);
        let bar = st.pairs[pid.0]
            .last
            .clone()
            .ok_or_else(|| EngineError::NoMarketData(pair.to_string()))?;

        let fill = st.fill_for(pid, side, size, bar.close, true);
        st.reserve(pid, fill, true)?;

        let realized = st.book_fill(pid, side, size, bar.close);
        let mut order = st.new_order(pid, side, OrderType::Market, size, bar.close, None, None, OrderStatus::Filled);
        order.profit = realized.map(|r| r.percent).unwrap_or(0.0);
        if let Some(r) = realized {
            st.realized.push(RealizedTrade {
                exchange_id: order.exchange_id,
                pair: order.pair.clone(),
                time: bar.time,
                realized: r,
            });
        }
        st.orders.push(order.clone());
        ORDERS_CREATED.with_label_values(&[OrderType::Market.as_str()]).inc();
        FILLS.with_label_values(&[order.pair.as_str(), side.as_str()]).inc();
        info!(id = order.exchange_id, pair = %order.pair, side = side.as_str(), qty = size, px = bar.close, "paper market fill");
        Ok(order)
    }

    async fn create_order_market_quote(&self, side: Side, pair: &str, quote: f64) -> Result<Order> {
        check_size(quote)?;
        let close = {
            let mut st = self.state.lock().await;
            let pid = st.slot(pair);
            st.pairs[pid.0]
                .last
                .as_ref()
                .map(|b| b.close)
                .ok_or_else(|| EngineError::NoMarketData(pair.to_string()))?
        };
        let size = (quote / close / LOT_STEP).floor() * LOT_STEP;
        self.create_order_market(side, pair, size).await
    }

    async fn create_order_limit(&self, side: Side, pair: &str, size: f64, limit: f64) -> Result<Order> {
        self.place(side, pair, OrderType::Limit, size, limit, None).await
    }

    async fn create_order_stop(&self, pair: &str, size: f64, limit: f64) -> Result<Order> {
        self.place(Side::Sell, pair, OrderType::StopLossLimit, size, limit, Some(limit)).await
    }

    async fn create_order_oco(
        &self,
        side: Side,
        pair: &str,
        size: f64,
        price: f64,
        stop: f64,
        stop_limit: f64,
    ) -> Result<Vec<Order>> {
        check_size(size)?;
        check_size(price)?;
        check_size(stop)?;
        check_size(stop_limit)?;
        let mut st = self.state.lock().await;
        let pid = st.slot(pair);

        // one reservation covers whichever leg fills, priced at the dearer of the two
        let reserve_at = price.max(stop);
        let fill = st.fill_for(pid, side, size, reserve_at, false);
        let reservation = st.reserve(pid, fill, false)?;

        st.counter += 1;
        let group = st.counter;
        let limit_maker = st.new_order(pid, side, OrderType::LimitMaker, size, price, None, Some(group), OrderStatus::New);
        let stop_loss = st.new_order(pid, side, OrderType::StopLoss, size, stop_limit, Some(stop), Some(group), OrderStatus::New);
        st.reservations.insert(group, reservation);
        st.orders.push(limit_maker.clone());
        st.orders.push(stop_loss.clone());
        ORDERS_CREATED.with_label_values(&["OCO"]).inc();
        debug!(group, pair = %pair, price, stop, "paper oco resting");
        Ok(vec![limit_maker, stop_loss])
    }

    async fn cancel(&self, order: &Order) -> Result<()> {
        let mut st = self.state.lock().await;
        let idx = st
            .orders
            .iter()
            .position(|o| o.exchange_id == order.exchange_id)
            .ok_or(EngineError::OrderNotFound(order.exchange_id))?;

        if st.orders[idx].status.is_final() {
            return Ok(());
        }
        let pair = st.orders[idx].pair.clone();
        let pid = st.slot(&pair);
        let now = st.now(pid);
        let (key, group) = {
            let o = &mut st.orders[idx];
            o.status = OrderStatus::Canceled;
            o.updated_at = now;
            (o.group_id.unwrap_or(o.exchange_id), o.group_id)
        };

        // a group reservation stays while a sibling can still fill
        let sibling_active = group.is_some()
            && st.orders.iter().any(|o| o.group_id == group && !o.status.is_final());
        if !sibling_active {
            if let Some(r) = st.reservations.remove(&key) {
                let slot = &st.pairs[pid.0];
                let (asset, quote) = (slot.asset, slot.quote);
                st.ledger.release(asset, quote, r);
            }
        }
        info!(id = order.exchange_id, pair = %pair, "paper order canceled");
        Ok(())
    }

    async fn order(&self, _pair: &str, id: i64) -> Result<Order> {
        let st = self.state.lock().await;
        st.orders
            .iter()
            .find(|o| o.exchange_id == id)
            .cloned()
            .ok_or(EngineError::OrderNotFound(id))
    }

    async fn account(&self) -> Result<Account> {
        let st = self.state.lock().await;
        Ok(Account { balances: st.ledger.balances() })
    }

    async fn position(&self, pair: &str) -> Result<(f64, f64)> {
        let mut st = self.state.lock().await;
        let pid = st.slot(pair);
        let slot = &st.pairs[pid.0];
        let quote = st.ledger.balance(slot.quote);
        Ok((st.ledger.net(slot.asset), quote.free + quote.lock))
    }
}

#[async_trait]
impl DataFeed for PaperEngine {
    async fn last_quote(&self, pair: &str) -> Result<f64> {
        {
            let st = self.state.lock().await;
            let last = st.index.get(pair).and_then(|pid| st.pairs[pid.0].last.as_ref());
            if let Some(bar) = last {
                return Ok(bar.close);
            }
        }
        self.feed()?.last_quote(pair).await
    }

    async fn candles_by_limit(&self, pair: &str, timeframe: &str, limit: usize) -> Result<Vec<Bar>> {
        self.feed()?.candles_by_limit(pair, timeframe, limit).await
    }

    async fn candles_by_period(
        &self,
        pair: &str,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>> {
        self.feed()?.candles_by_period(pair, timeframe, start, end).await
    }

    async fn candles_subscription(
        &self,
        pair: &str,
        timeframe: &str,
        stop: watch::Receiver<bool>,
    ) -> Result<CandleStream> {
        self.feed()?.candles_subscription(pair, timeframe, stop).await
    }
}

impl PaperEngine {
    fn feed(&self) -> Result<&Arc<dyn DataFeed>> {
        self.feed
            .as_ref()
            .ok_or_else(|| EngineError::Venue("paper engine has no data feed".into()))
    }
}

impl EngineState {
    fn slot(&mut self, pair: &str) -> PairId {
        if let Some(pid) = self.index.get(pair) {
            return *pid;
        }
        let (asset, quote) = split_asset_quote(pair);
        let pid = PairId(self.pairs.len());
        let slot = PairSlot {
            pair: pair.to_string(),
            asset: self.ledger.id(&asset),
            quote: self.ledger.id(&quote),
            position: PositionState::default(),
            first: None,
            last: None,
            volume: 0.0,
        };
        self.pairs.push(slot);
        self.index.insert(pair.to_string(), pid);
        pid
    }

    /// Deposited units of the pair's asset become a long at the first close.
    fn seed(&mut self, pid: PairId, close: f64) {
        let slot = &mut self.pairs[pid.0];
        let symbol = self.ledger.balance(slot.asset).asset;
        if let Some(qty) = self.seeds.remove(&symbol) {
            if qty > 0.0 {
                slot.position.apply(Side::Buy, qty, close);
                self.initial_value += qty * close;
            }
        }
    }

    fn now(&self, pid: PairId) -> DateTime<Utc> {
        self.pairs[pid.0].last.as_ref().map(|b| b.time).unwrap_or_else(Utc::now)
    }

    fn fill_for(&self, pid: PairId, side: Side, quantity: f64, price: f64, taker: bool) -> Fill {
        Fill {
            side,
            quantity,
            price,
            avg_short: self.pairs[pid.0].position.avg_short,
            fee_rate: if taker { self.fees.taker } else { self.fees.maker },
        }
    }

    fn reserve(&mut self, pid: PairId, fill: Fill, fill_now: bool) -> Result<Reservation> {
        let slot = &self.pairs[pid.0];
        self.ledger.reserve(&slot.pair, slot.asset, slot.quote, fill, fill_now)
    }

    /// Position and volume bookkeeping shared by every fill.
    fn book_fill(&mut self, pid: PairId, side: Side, qty: f64, price: f64) -> Option<Realized> {
        let slot = &mut self.pairs[pid.0];
        slot.volume += qty * price;
        slot.position.apply(side, qty, price)
    }

    #[allow(clippy::too_many_arguments)]
    fn new_order(
        &mut self,
        pid: PairId,
        side: Side,
        order_type: OrderType,
        quantity: f64,
        price: f64,
        stop: Option<f64>,
        group_id: Option<i64>,
        status: OrderStatus,
    ) -> Order {
        self.counter += 1;
        let now = self.now(pid);
        Order {
            id: 0,
            exchange_id: self.counter,
            pair: self.pairs[pid.0].pair.clone(),
            side,
            order_type,
            status,
            quantity,
            price,
            stop,
            group_id,
            created_at: now,
            updated_at: now,
            profit: 0.0,
        }
    }

    fn fill_resting(&mut self, idx: usize, pid: PairId, price: f64, time: DateTime<Utc>) -> Vec<Order> {
        let (side, qty, exchange_id, group) = {
            let o = &self.orders[idx];
            (o.side, o.quantity, o.exchange_id, o.group_id)
        };
        let r = self.reservations.remove(&group.unwrap_or(exchange_id)).unwrap_or_default();
        let fill = self.fill_for(pid, side, qty, price, false);
        let (asset, quote) = (self.pairs[pid.0].asset, self.pairs[pid.0].quote);
        self.ledger.fill_reserved(asset, quote, r, fill);
        let realized = self.book_fill(pid, side, qty, price);

        let mut changed = Vec::new();
        {
            let o = &mut self.orders[idx];
            o.status = OrderStatus::Filled;
            o.updated_at = time;
            o.profit = realized.map(|r| r.percent).unwrap_or(0.0);
            changed.push(o.clone());
        }
        if let Some(r) = realized {
            self.realized.push(RealizedTrade { exchange_id, pair: self.pairs[pid.0].pair.clone(), time, realized: r });
        }
        FILLS.with_label_values(&[self.pairs[pid.0].pair.as_str(), side.as_str()]).inc();
        info!(id = exchange_id, pair = %self.pairs[pid.0].pair, side = side.as_str(), qty, px = price, "paper fill");

        if group.is_some() {
            for o in self.orders.iter_mut() {
                if o.group_id == group && o.exchange_id != exchange_id && !o.status.is_final() {
                    o.status = OrderStatus::Canceled;
                    o.updated_at = time;
                    changed.push(o.clone());
                }
            }
        }
        changed
    }

    fn revalue(&mut self, time: DateTime<Utc>) {
        let mut total = 0.0;
        for slot in &self.pairs {
            let Some(last) = &slot.last else { continue };
            if self.ledger.balance(slot.quote).asset != self.base_coin {
                continue;
            }
            let quantity = self.ledger.net(slot.asset);
            total += liquidation_value(quantity, slot.position.avg_short, last.close);
            let symbol = self.ledger.balance(slot.asset).asset;
            self.asset_values
                .entry(symbol)
                .or_default()
                .push(AssetValue { time, value: quantity * last.close });
        }
        let base = self.ledger.lookup(&self.base_coin).map(|id| self.ledger.balance(id)).unwrap_or_default();
        let value = total + base.free + base.lock;
        self.equity.push(AssetValue { time, value });
        EQUITY.set(value);
    }
}

/// Long: v * close. Short: collateral plus open profit, 2·v·avgShort − v·close.
fn liquidation_value(quantity: f64, avg_short: f64, close: f64) -> f64 {
    if quantity < 0.0 {
        let v = quantity.abs();
        2.0 * v * avg_short - v * close
    } else {
        quantity * close
    }
}

fn trigger_price(o: &Order, bar: &Bar) -> Option<f64> {
    match (o.side, o.order_type) {
        (_, OrderType::Market) => None,
        (Side::Buy, t) if t.is_stop() => o.stop.filter(|s| bar.high >= *s),
        (Side::Buy, _) => (bar.close <= o.price).then_some(o.price),
        (Side::Sell, t) if t.is_stop() => o.stop.filter(|s| bar.low <= *s),
        (Side::Sell, _) => (bar.high >= o.price).then_some(o.price),
    }
}

fn check_size(v: f64) -> Result<()> {
    if v.is_finite() && v > 0.0 {
        Ok(())
    } else {
        Err(EngineError::InvalidQuantity(v))
    }
}

#[derive(Debug, Clone)]
pub struct Holding {
    pub asset: String,
    pub quantity: f64,
    pub value: f64,
}

#[derive(Debug, Clone)]
pub struct WalletSummary {
    pub base_coin: String,
    pub holdings: Vec<Holding>,
    pub base_value: f64,
    pub start_value: f64,
    pub final_value: f64,
    pub profit: f64,
    pub profit_pct: f64,
    pub market_change: f64,
    pub max_drawdown: Drawdown,
    pub volume: Vec<(String, f64)>,
}

impl fmt::Display for WalletSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "-- FINAL WALLET --")?;
        for h in &self.holdings {
            writeln!(f, "{:.4} {} = {:.4} {}", h.quantity, h.asset, h.value, self.base_coin)?;
        }
        writeln!(f, "{:.4} {}", self.base_value, self.base_coin)?;
        writeln!(f)?;
        writeln!(f, "----- RETURNS -----")?;
        writeln!(f, "START PORTFOLIO     = {:.2} {}", self.start_value, self.base_coin)?;
        writeln!(f, "FINAL PORTFOLIO     = {:.2} {}", self.final_value, self.base_coin)?;
        writeln!(f, "GROSS PROFIT        = {:.4} {} ({:.2}%)", self.profit, self.base_coin, self.profit_pct * 100.0)?;
        writeln!(f, "MARKET CHANGE (B&H) = {:.2}%", self.market_change * 100.0)?;
        writeln!(f)?;
        writeln!(f, "------ RISK -------")?;
        writeln!(f, "MAX DRAWDOWN = {:.2} %", self.max_drawdown.fraction * 100.0)?;
        writeln!(f)?;
        writeln!(f, "------ VOLUME -----")?;
        let mut total = 0.0;
        for (pair, vol) in &self.volume {
            total += vol;
            writeln!(f, "{:<12} = {:.2} {}", pair, vol, self.base_coin)?;
        }
        writeln!(f, "TOTAL        = {:.2} {}", total, self.base_coin)?;
        write!(f, "-------------------")
    }
}
