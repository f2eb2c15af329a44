// ===============================
// src/position.rs (avg cost & realized PnL per pair)
// ===============================
//
// Satu algoritma dipakai dua jalur:
// - PaperEngine: apply() inkremental di setiap fill.
// - OrderController: replay() dari nol atas order FILLED sebelumnya.
// Keduanya harus menghasilkan profit yang sama untuk order penutup yang sama.
//
use serde::{Deserialize, Serialize};

use crate::domain::{Order, Side};

pub const QTY_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    /// Signed net quantity (negative = short).
    pub quantity: f64,
    pub avg_long: f64,
    pub avg_short: f64,
}

/// Profit realized by a fill that reduced an open position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Realized {
    pub profit: f64,
    /// profit / (closed quantity * cost basis)
    pub percent: f64,
    pub closed: f64,
    /// `true` when a long was reduced (closing sell), `false` for a short.
    pub long: bool,
}

impl PositionState {
    pub fn is_flat(&self) -> bool { self.quantity.abs() < QTY_EPSILON }

    pub fn apply(&mut self, side: Side, qty: f64, price: f64) -> Option<Realized> {
        let prev = self.quantity;
        let signed = side.sign() * qty;

        // flat or same direction: extend the position
        if prev.abs() < QTY_EPSILON || prev.signum() == signed.signum() {
            let held = prev.abs();
            match side {
                Side::Buy => {
                    self.avg_long = if held < QTY_EPSILON {
                        price
                    } else {
                        (self.avg_long * held + price * qty) / (held + qty)
                    };
                }
                Side::Sell => {
                    self.avg_short = if held < QTY_EPSILON {
                        price
                    } else {
                        (self.avg_short * held + price * qty) / (held + qty)
                    };
                }
            }
            self.quantity = prev + signed;
            return None;
        }

        // opposite direction: close (and maybe flip)
        let closed = qty.min(prev.abs());
        let (profit, basis, long) = if prev > 0.0 {
            ((price - self.avg_long) * closed, self.avg_long, true)
        } else {
            ((self.avg_short - price) * closed, self.avg_short, false)
        };

        self.quantity = prev + signed;
        if qty - closed > QTY_EPSILON {
            match side {
                Side::Sell => self.avg_short = price,
                Side::Buy => self.avg_long = price,
            }
        }
        if self.quantity.abs() < QTY_EPSILON {
            self.quantity = 0.0;
        }

        let percent = if basis.abs() > 0.0 && closed > 0.0 { profit / (closed * basis) } else { 0.0 };
        Some(Realized { profit, percent, closed, long })
    }

    /// Rebuilds the position from scratch by folding previous fills in order.
    pub fn replay<'a, I>(fills: I) -> Self
    where
        I: IntoIterator<Item = &'a Order>,
    {
        let mut st = PositionState::default();
        for o in fills {
            st.apply(o.side, o.quantity, o.execution_price());
        }
        st
    }
}
