// ===============================
// src/posttrade.rs
// ===============================
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::domain::{OrderEvent, OrderStatus};
use crate::error::EngineError;

/// Optional sink for human-facing messages (chat bot, email, ...).
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
    fn on_error(&self, err: &EngineError);
}

/// Notifier that only writes to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) { info!(%message, "notify"); }
    fn on_error(&self, err: &EngineError) { error!(%err, "notify error"); }
}

/// Logs every order event and forwards fills/cancels to the notifier.
pub async fn run(mut rx: broadcast::Receiver<OrderEvent>, notifier: Option<Arc<dyn Notifier>>) {
    loop {
        let ev = match rx.recv().await {
            Ok(ev) => ev,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "posttrade lagging behind order events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let o = &ev.order;
        match (ev.is_new, o.status) {
            (true, _) => info!(id = o.exchange_id, pair = %o.pair, kind = o.order_type.as_str(), "NEW"),
            (false, OrderStatus::Filled) => info!(id = o.exchange_id, qty = o.quantity, px = o.execution_price(), profit = o.profit, "FILLED"),
            (false, OrderStatus::PartiallyFilled) => info!(id = o.exchange_id, qty = o.quantity, "PARTIAL"),
            (false, OrderStatus::Canceled) => info!(id = o.exchange_id, "CANCELED"),
            (false, s) => warn!(id = o.exchange_id, status = %s, "ORDER UPDATE"),
        }
        if let Some(n) = &notifier {
            if o.status.is_final() || ev.is_new {
                n.notify(&o.to_string());
            }
        }
    }
}
