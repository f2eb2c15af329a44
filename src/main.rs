// ===============================
// src/main.rs
// ===============================
/*
 # backtest dari CSV
 CSV_FILES=BTCUSDT=data/btc.csv cargo run --release -- backtest

 # konfigurasi & aktivitas
 curl -s localhost:9898/metrics | egrep '^config_(mode|pair)'
 curl -s localhost:9898/metrics | grep '^fills_total'
*/
/*
=============================================================================
Project : papertrade_rust — backtest & paper-trading engine in Rust
Module  : main.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
License : MIT (see LICENSE)

Summary : Replays CSV bars through a simulated exchange (backtest), runs
          strategies against live bars with a paper wallet (paper), or
          trades on Binance Spot (live). Orders are reconciled and profit
          attributed per trade; Prometheus metrics and JSONL recording.
=============================================================================
*/
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::{sync::mpsc, time::Duration};
use tracing::info;
use tracing_subscriber::EnvFilter;

use papertrade_rust::{
    binance::BinanceVenue,
    bot::Bot,
    config::{self, Args, FeedMode, VenueMode},
    controller::OrderController,
    domain::Event,
    engine::PaperEngine,
    feed::{CsvFeed, MockFeed},
    metrics,
    recorder,
    storage::MemoryStorage,
    strategy::{CrossEma, Strategy},
    venue::{DataFeed, Venue},
};

#[derive(Parser, Debug)]
#[command(name = "papertrade", about = "Backtest / paper / live trading engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Comma separated pairs, overrides PAIRS
    #[arg(long, global = true)]
    pairs: Option<String>,

    /// Bar timeframe, overrides TIMEFRAME
    #[arg(long, global = true)]
    timeframe: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay CSV bars through the paper engine
    Backtest {
        /// PAIR=path entries, overrides CSV_FILES
        #[arg(long = "csv", value_delimiter = ',')]
        csv: Vec<String>,
    },
    /// Live bars, simulated wallet
    Paper,
    /// Live bars, orders on Binance
    Live,
}

fn strategy_for(args: &Args) -> Box<dyn Strategy> {
    Box::new(CrossEma::new(&args.timeframe))
}

fn paper_engine(args: &Args, feed: Option<Arc<dyn DataFeed>>) -> Arc<PaperEngine> {
    let mut b = PaperEngine::builder(&args.base_coin)
        .with_asset(&args.base_coin, args.initial_balance)
        .with_fees(args.maker_fee, args.taker_fee);
    if let Some(f) = feed {
        b = b.with_feed(f);
    }
    Arc::new(b.build())
}

fn live_feed(args: &Args) -> anyhow::Result<Arc<dyn DataFeed>> {
    let feed: Arc<dyn DataFeed> = match args.feed_mode {
        FeedMode::Mock => Arc::new(MockFeed::new(100.0, Duration::from_secs(1))),
        FeedMode::BinanceSandbox | FeedMode::BinanceMainnet => Arc::new(BinanceVenue::new(args.binance())),
        FeedMode::Csv => bail!("FEED_MODE=csv is only valid for backtest"),
    };
    Ok(feed)
}

fn build_bot(
    args: &Args,
    venue: Arc<dyn Venue>,
    paper: Option<Arc<PaperEngine>>,
    recorder: Option<mpsc::Sender<Event>>,
) -> Bot {
    let controller = Arc::new(
        OrderController::new(venue.clone(), Arc::new(MemoryStorage::new())).with_interval(args.reconcile_interval),
    );
    let mut bot = Bot::new(venue, controller);
    if let Some(n) = args.warmup_bars {
        bot = bot.with_warmup(n);
    }
    if let Some(engine) = paper {
        bot = bot.with_paper_engine(engine);
    }
    if let Some(tx) = recorder {
        bot = bot.with_recorder(tx);
    }
    for pair in &args.pairs {
        bot = bot.with_strategy(pair, strategy_for(args));
    }
    bot
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Config (+ override CLI) ----
    let cli = Cli::parse();
    let mut args = config::load();
    if let Some(p) = &cli.pairs {
        args.pairs = config::parse_pairs(p);
    }
    if let Some(tf) = &cli.timeframe {
        args.timeframe = tf.clone();
    }
    if let Command::Backtest { csv } = &cli.command {
        if !csv.is_empty() {
            args.csv_files = config::parse_csv_files(&csv.join(","));
            args.pairs = args.csv_files.iter().map(|(p, _)| p.clone()).collect();
        }
    }
    if let Command::Live = cli.command {
        if args.venue_mode == VenueMode::Paper {
            bail!("live needs VENUE_MODE=binance_sandbox or binance_mainnet");
        }
    }

    // ---- Metrics ----
    metrics::init();
    metrics::serve_metrics(args.metrics_port);

    let run_mode = match cli.command {
        Command::Backtest { .. } => "backtest",
        Command::Paper => "paper",
        Command::Live => "live",
    };
    info!(
        mode = run_mode,
        feed_mode = args.feed_mode.as_str(),
        venue_mode = args.venue_mode.as_str(),
        pairs = ?args.pairs,
        timeframe = %args.timeframe,
        base = %args.base_coin,
        balance = args.initial_balance,
        "startup config"
    );
    metrics::CONFIG_MODE.with_label_values(&["run", run_mode]).set(1);
    metrics::CONFIG_MODE.with_label_values(&["feed", args.feed_mode.as_str()]).set(1);
    metrics::CONFIG_MODE.with_label_values(&["venue", args.venue_mode.as_str()]).set(1);
    for p in &args.pairs {
        metrics::CONFIG_PAIR.with_label_values(&[p.as_str()]).set(1);
    }

    // ---- Recorder (opsional) ----
    let (rec_tx, rec_task) = match args.record_file.clone() {
        Some(path) => {
            let (tx, rx) = mpsc::channel::<Event>(8192);
            (Some(tx), Some(tokio::spawn(recorder::run(rx, path))))
        }
        None => (None, None),
    };

    match cli.command {
        Command::Backtest { .. } => {
            if args.csv_files.is_empty() {
                bail!("backtest needs CSV_FILES=PAIR=path,... or --csv");
            }
            let mut feed = CsvFeed::new();
            for (pair, path) in &args.csv_files {
                feed = feed
                    .with_file(pair, path)
                    .with_context(|| format!("loading {}", path.display()))?;
            }
            let bars = feed.merged();
            let engine = paper_engine(&args, Some(Arc::new(feed)));
            let mut bot = build_bot(&args, engine.clone(), Some(engine), rec_tx);
            bot.backtest(bars).await?;
            println!("{}", bot.summary().await);
        }
        Command::Paper => {
            let engine = paper_engine(&args, Some(live_feed(&args)?));
            let mut bot = build_bot(&args, engine.clone(), Some(engine), rec_tx);
            bot.run().await?;
            println!("{}", bot.summary().await);
        }
        Command::Live => {
            let venue: Arc<dyn Venue> = Arc::new(BinanceVenue::new(args.binance()));
            let mut bot = build_bot(&args, venue, None, rec_tx);
            bot.run().await?;
            println!("{}", bot.summary().await);
        }
    }

    // recorder flushes once every sender is gone
    if let Some(task) = rec_task {
        let _ = task.await;
    }
    Ok(())
}
