// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Market data --------
pub static BARS_BY_PAIR: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("bars_total_by_pair", "bars ingested by the paper engine per pair"),
        &["pair"],
    )
    .unwrap()
});

pub static STALE_BARS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("stale_bars_total", "bars dropped for arriving late").unwrap());

// -------- Orders --------
pub static ORDERS_CREATED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("orders_created_total", "orders accepted by the venue (label: type)"),
        &["type"],
    )
    .unwrap()
});

pub static FILLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("fills_total", "simulated fills"), &["pair", "side"]).unwrap()
});

// -------- Reconciliation --------
pub static RECONCILE_UPDATES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("reconcile_updates_total", "order status changes found by reconciliation"),
        &["status"],
    )
    .unwrap()
});

pub static RECONCILE_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("reconcile_errors_total", "per-order reconciliation failures").unwrap()
});

// -------- Equity & PnL --------
pub static EQUITY: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("equity_value", "last equity sample (base coin)").unwrap());

pub static PNL_REALIZED: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(Opts::new("pnl_realized", "realized profit per pair (quote)"), &["pair"]).unwrap()
});

// -------- Live feed health --------
pub static WS_CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("kline_ws_connected", "1 if kline stream connected, 0 otherwise"),
        &["pair"],
    )
    .unwrap()
});

pub static WS_RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("kline_ws_reconnects_total", "Number of reconnects to the kline stream"),
        &["pair"],
    )
    .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_mode", "run mode / feed / venue (labels: kind, mode)"),
        &["kind", "mode"],
    )
    .unwrap()
});

pub static CONFIG_PAIR: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_pair", "configured pairs (label: pair)"), &["pair"]).unwrap()
});

pub fn init() {
    for m in [
        REGISTRY.register(Box::new(BARS_BY_PAIR.clone())),
        REGISTRY.register(Box::new(STALE_BARS.clone())),
        REGISTRY.register(Box::new(ORDERS_CREATED.clone())),
        REGISTRY.register(Box::new(FILLS.clone())),
        REGISTRY.register(Box::new(RECONCILE_UPDATES.clone())),
        REGISTRY.register(Box::new(RECONCILE_ERRORS.clone())),
        REGISTRY.register(Box::new(EQUITY.clone())),
        REGISTRY.register(Box::new(PNL_REALIZED.clone())),
        REGISTRY.register(Box::new(WS_CONNECTED.clone())),
        REGISTRY.register(Box::new(WS_RECONNECTS.clone())),
        REGISTRY.register(Box::new(CONFIG_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_PAIR.clone())),
    ] {
        // double init (tests, repeated runs) just reports AlreadyReg
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics), tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Metrics server on a dedicated OS thread; bind failure is logged, not fatal
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                error!(?e, %addr, "metrics bind failed");
                return;
            }
        };
        info!(%addr, "metrics listening");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => error!(?e, "metrics accept error"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_families() {
        init();
        init();
        FILLS.with_label_values(&["BTCUSDT", "BUY"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("fills_total"));
    }
}
