// ===============================
// src/bot.rs
// ===============================
//
// Runner yang menyambungkan venue, paper engine (opsional), OrderController,
// strategi per pair dan recorder.
// - backtest : semua bar digabung urut waktu; per bar -> engine, rekonsiliasi, strategi
// - live     : warmup via candles_by_limit, subscription per pair (fan-in), loop
//              rekonsiliasi di background, berhenti saat Ctrl-C
//
use std::sync::Arc;

use tokio::{
    select,
    sync::{broadcast, mpsc, watch},
};
use tracing::{debug, error, info, warn};

use crate::controller::OrderController;
use crate::domain::{Bar, Event, OrderEvent};
use crate::engine::PaperEngine;
use crate::error::Result;
use crate::metrics::STALE_BARS;
use crate::posttrade;
use crate::strategy::{Strategy, StrategyController};
use crate::venue::Venue;

pub struct Bot {
    venue: Arc<dyn Venue>,
    paper: Option<Arc<PaperEngine>>,
    controller: Arc<OrderController>,
    strategies: Vec<StrategyController>,
    recorder: Option<mpsc::Sender<Event>>,
    events: broadcast::Receiver<OrderEvent>,
    warmup: Option<usize>,
}

impl Bot {
    pub fn new(venue: Arc<dyn Venue>, controller: Arc<OrderController>) -> Self {
        let events = controller.subscribe();
        Self { venue, paper: None, controller, strategies: Vec::new(), recorder: None, events, warmup: None }
    }

    /// Simulated venue: bars are pushed into the engine before anything else sees them.
    pub fn with_paper_engine(mut self, engine: Arc<PaperEngine>) -> Self {
        self.paper = Some(engine);
        self
    }

    pub fn with_strategy(mut self, pair: &str, strategy: Box<dyn Strategy>) -> Self {
        let sc = StrategyController::new(pair, strategy, self.controller.clone());
        self.strategies.push(sc);
        self
    }

    /// Bars fetched before going live, instead of each strategy's warmup period.
    pub fn with_warmup(mut self, bars: usize) -> Self {
        self.warmup = Some(bars);
        self
    }

    pub fn with_recorder(mut self, tx: mpsc::Sender<Event>) -> Self {
        self.recorder = Some(tx);
        self
    }

    pub fn controller(&self) -> &Arc<OrderController> { &self.controller }

    pub fn pairs(&self) -> Vec<String> {
        self.strategies.iter().map(|s| s.pair().to_string()).collect()
    }

    async fn record(&self, ev: Event) {
        if let Some(tx) = &self.recorder {
            if tx.send(ev).await.is_err() {
                debug!("recorder closed, event dropped");
            }
        }
    }

    /// Forwards buffered order events to the recorder.
    async fn drain_events(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(ev) => self.record(Event::Order(ev)).await,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(skipped = n, "order events lagged, some not recorded");
                }
                Err(_) => break,
            }
        }
    }

    /// Returns false when the bar was stale and dropped.
    async fn on_bar(&mut self, bar: &Bar) -> Result<bool> {
        if let Some(engine) = &self.paper {
            match engine.on_bar(bar).await {
                Ok(changed) => {
                    if !changed.is_empty() {
                        debug!(pair = %bar.pair, changed = changed.len(), "resting orders triggered");
                    }
                }
                Err(e) if e.is_stale() => {
                    STALE_BARS.inc();
                    debug!(%e, "stale bar dropped");
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }

        self.controller.update_orders().await;
        self.controller.on_bar(bar).await;

        for sc in self.strategies.iter_mut().filter(|s| s.pair() == bar.pair) {
            if bar.complete {
                sc.on_bar(bar).await;
            } else {
                sc.on_partial_bar(bar).await;
            }
        }

        self.record(Event::Bar(bar.clone())).await;
        self.drain_events().await;
        Ok(true)
    }

    /// Replays `bars` through the paper engine in time order.
    pub async fn backtest(&mut self, mut bars: Vec<Bar>) -> Result<()> {
        bars.sort_by_key(|b| b.time);
        for sc in &mut self.strategies {
            sc.start();
        }
        info!(bars = bars.len(), pairs = ?self.pairs(), "backtest started");

        let mut dropped = 0usize;
        for bar in &bars {
            if !self.on_bar(bar).await? {
                dropped += 1;
            }
        }

        self.controller.update_orders().await;
        self.drain_events().await;
        if let Some(engine) = &self.paper {
            for v in engine.equity_values().await {
                self.record(Event::Equity(v)).await;
            }
        }
        info!(bars = bars.len(), dropped, "backtest finished");
        Ok(())
    }

    async fn warmup(&mut self) -> Result<()> {
        for sc in &mut self.strategies {
            let n = self.warmup.unwrap_or_else(|| sc.warmup_period());
            if n > 0 {
                let bars = self.venue.candles_by_limit(sc.pair(), sc.timeframe(), n).await?;
                info!(pair = %sc.pair(), bars = bars.len(), "warmup loaded");
                for b in &bars {
                    if let Some(engine) = &self.paper {
                        if let Err(e) = engine.on_bar(b).await {
                            debug!(%e, "warmup bar skipped by engine");
                        }
                    }
                    self.controller.on_bar(b).await;
                    sc.on_bar(b).await;
                }
            }
            sc.start();
        }
        Ok(())
    }

    /// Live/paper loop. Returns after Ctrl-C or when every bar stream ends.
    pub async fn run(&mut self) -> Result<()> {
        self.warmup().await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (bar_tx, mut bar_rx) = mpsc::channel::<Bar>(1024);
        for sc in &self.strategies {
            let mut stream = self.venue.candles_subscription(sc.pair(), sc.timeframe(), stop_rx.clone()).await?;
            let tx = bar_tx.clone();
            let pair = sc.pair().to_string();
            tokio::spawn(async move {
                loop {
                    select! {
                        bar = stream.bars.recv() => match bar {
                            Some(b) => if tx.send(b).await.is_err() { break },
                            None => break,
                        },
                        Some(e) = stream.errors.recv() => error!(%e, %pair, "bar stream error"),
                    }
                }
                debug!(%pair, "bar stream forwarder stopped");
            });
        }
        drop(bar_tx);

        tokio::spawn(posttrade::run(self.controller.subscribe(), None));
        self.controller.start().await;
        info!(pairs = ?self.pairs(), "bot running, Ctrl-C to stop");

        loop {
            select! {
                maybe = bar_rx.recv() => {
                    let Some(bar) = maybe else {
                        info!("all bar streams closed");
                        break;
                    };
                    if let Err(e) = self.on_bar(&bar).await {
                        error!(%e, pair = %bar.pair, "bar handling failed");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("ctrl-c received, shutting down");
                    break;
                }
            }
        }

        let _ = stop_tx.send(true);
        self.controller.stop().await;
        self.drain_events().await;
        Ok(())
    }

    /// Trade table plus, for simulated runs, the wallet summary.
    pub async fn summary(&self) -> String {
        let mut out = self.controller.summary().await;
        if let Some(engine) = &self.paper {
            out.push_str("\n\n");
            out.push_str(&engine.summary().await.to_string());
        }
        out
    }
}
