// ===============================
// src/ledger.rs
// ===============================
//
// Per-asset balance book for the paper engine.
// - Aset disimpan di arena (Vec) dan diakses lewat AssetId.
// - free / lock / short selalu >= 0; posisi short dicatat sebagai jumlah pinjaman.
// - reserve() memvalidasi dana dulu, baru mutasi (tidak pernah setengah jalan).
// - satu aset tidak pernah long dan short bersamaan (free+lock > 0 xor short > 0).
//
use ahash::AHashMap as HashMap;

use crate::domain::{Balance, Side};
use crate::error::{EngineError, Result};

const DUST: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AssetId(usize);

#[derive(Debug, Clone, Default)]
struct AssetBalance {
    symbol: String,
    free: f64,
    lock: f64,
    short: f64,
    /// quantity resting sells will short when they fill
    pending_short: f64,
}

/// Amounts held back for a resting order until it fills or is canceled.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Reservation {
    pub asset: f64,
    pub quote: f64,
    /// Part of a resting sell not backed by held units.
    pub short: f64,
}

/// One fill to validate or settle. `avg_short` is the cost basis of the
/// pair's current short (ignored when flat or long).
#[derive(Debug, Clone, Copy)]
pub struct Fill {
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    pub avg_short: f64,
    pub fee_rate: f64,
}

impl Fill {
    fn fee(&self) -> f64 { self.quantity * self.price * self.fee_rate }
}

#[derive(Debug, Default)]
pub struct Ledger {
    index: HashMap<String, AssetId>,
    assets: Vec<AssetBalance>,
}

impl Ledger {
    pub fn new() -> Self { Self::default() }

    pub fn id(&mut self, symbol: &str) -> AssetId {
        if let Some(id) = self.index.get(symbol) {
            return *id;
        }
        let id = AssetId(self.assets.len());
        self.assets.push(AssetBalance { symbol: symbol.to_string(), ..Default::default() });
        self.index.insert(symbol.to_string(), id);
        id
    }

    pub fn lookup(&self, symbol: &str) -> Option<AssetId> { self.index.get(symbol).copied() }

    pub fn deposit(&mut self, symbol: &str, amount: f64) {
        let id = self.id(symbol);
        self.assets[id.0].free += amount;
    }

    pub fn balance(&self, id: AssetId) -> Balance {
        let a = &self.assets[id.0];
        Balance { asset: a.symbol.clone(), free: a.free, lock: a.lock, short: a.short }
    }

    pub fn balances(&self) -> Vec<Balance> {
        self.assets.iter().map(|a| Balance {
            asset: a.symbol.clone(),
            free: a.free,
            lock: a.lock,
            short: a.short,
        }).collect()
    }

    /// Signed net quantity held (negative when short).
    pub fn net(&self, id: AssetId) -> f64 {
        let a = &self.assets[id.0];
        a.free + a.lock - a.short
    }

    /// Checks funds for `fill` and either settles it right away (`fill_now`)
    /// or locks what the order will consume. Never mutates on error.
    ///
    /// An asset is never long and short at the same time, so:
    /// - a sell past `free` is rejected while units are locked by resting sells,
    /// - a resting sell that locks units is rejected while another resting sell
    ///   is waiting to open a short,
    /// - resting buys lock their full cost; whatever short exists at fill time
    ///   is covered then.
    pub fn reserve(
        &mut self,
        pair: &str,
        asset: AssetId,
        quote: AssetId,
        fill: Fill,
        fill_now: bool,
    ) -> Result<Reservation> {
        let a = &self.assets[asset.0];
        let q = &self.assets[quote.0];
        let price = fill.price;

        let reservation = match fill.side {
            Side::Sell => {
                let held = a.free.min(fill.quantity);
                let excess = fill.quantity - held;
                if excess > DUST && a.lock > DUST {
                    return Err(insufficient(pair, fill.quantity));
                }
                if !fill_now && held > DUST && a.pending_short > DUST {
                    return Err(insufficient(pair, fill.quantity));
                }
                let funds = q.free + a.free * price;
                if funds + DUST < fill.quantity * price + fill.fee() {
                    return Err(insufficient(pair, fill.quantity));
                }
                if excess > DUST {
                    Reservation { asset: held, quote: excess * price + fill.fee(), short: excess }
                } else {
                    // selling held units pays the fee out of proceeds
                    Reservation { asset: held, quote: 0.0, short: 0.0 }
                }
            }
            Side::Buy if fill_now => {
                let cover = a.short.min(fill.quantity);
                let open = fill.quantity - cover;
                let released = cover * (2.0 * fill.avg_short - price);
                if q.free + released + DUST < open * price + fill.fee() {
                    return Err(insufficient(pair, fill.quantity));
                }
                Reservation::default()
            }
            Side::Buy => {
                let cost = fill.quantity * price + fill.fee();
                if q.free + DUST < cost {
                    return Err(insufficient(pair, fill.quantity));
                }
                Reservation { asset: 0.0, quote: cost, short: 0.0 }
            }
        };

        if fill_now {
            self.settle(asset, quote, fill);
        } else {
            let q = &mut self.assets[quote.0];
            q.free -= reservation.quote;
            q.lock += reservation.quote;
            let a = &mut self.assets[asset.0];
            a.free -= reservation.asset;
            a.lock += reservation.asset;
            a.pending_short += reservation.short;
            self.tidy(asset);
            self.tidy(quote);
        }
        Ok(reservation)
    }

    /// Returns a reservation's locked amounts to free.
    pub fn release(&mut self, asset: AssetId, quote: AssetId, r: Reservation) {
        let a = &mut self.assets[asset.0];
        a.lock -= r.asset;
        a.free += r.asset;
        a.pending_short -= r.short;
        let q = &mut self.assets[quote.0];
        q.lock -= r.quote;
        q.free += r.quote;
        self.tidy(asset);
        self.tidy(quote);
    }

    /// Fill of a resting order: unlock what it held, then settle at the fill price.
    pub fn fill_reserved(&mut self, asset: AssetId, quote: AssetId, r: Reservation, fill: Fill) {
        self.release(asset, quote, r);
        self.settle(asset, quote, fill);
    }

    fn settle(&mut self, asset: AssetId, quote: AssetId, fill: Fill) {
        let price = fill.price;
        let (quote_delta, asset_delta, short_delta) = {
            let a = &self.assets[asset.0];
            match fill.side {
                Side::Sell => {
                    let sold = a.free.min(fill.quantity);
                    let excess = fill.quantity - sold;
                    // excess opens/extends a short; its notional is posted as collateral
                    (sold * price - excess * price, -sold, excess)
                }
                Side::Buy => {
                    let cover = a.short.min(fill.quantity);
                    let open = fill.quantity - cover;
                    (cover * (2.0 * fill.avg_short - price) - open * price, open, -cover)
                }
            }
        };

        let q = &mut self.assets[quote.0];
        q.free += quote_delta - fill.fee();
        let a = &mut self.assets[asset.0];
        a.free += asset_delta;
        a.short += short_delta;
        self.tidy(asset);
        self.tidy(quote);
    }

    // float noise from repeated lock/unlock
    fn tidy(&mut self, id: AssetId) {
        let a = &mut self.assets[id.0];
        for v in [&mut a.free, &mut a.lock, &mut a.short, &mut a.pending_short] {
            if v.abs() < DUST {
                *v = 0.0;
            }
        }
    }
}

fn insufficient(pair: &str, quantity: f64) -> EngineError {
    EngineError::InsufficientFunds { pair: pair.to_string(), quantity }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book(quote: f64) -> (Ledger, AssetId, AssetId) {
        let mut l = Ledger::new();
        l.deposit("USDT", quote);
        let a = l.id("BTC");
        let q = l.id("USDT");
        (l, a, q)
    }

    fn fill(side: Side, quantity: f64, price: f64) -> Fill {
        Fill { side, quantity, price, avg_short: 0.0, fee_rate: 0.0 }
    }

    #[test]
    fn buy_then_sell_round_trip() {
        let (mut l, a, q) = book(10_000.0);
        l.reserve("BTCUSDT", a, q, fill(Side::Buy, 50.0, 10.0), true).unwrap();
        assert_eq!(l.balance(a).free, 50.0);
        assert_eq!(l.balance(q).free, 9_500.0);

        l.reserve("BTCUSDT", a, q, fill(Side::Sell, 50.0, 10.0), true).unwrap();
        assert_eq!(l.balance(a).free, 0.0);
        assert_eq!(l.balance(q).free, 10_000.0);
    }

    #[test]
    fn rejects_without_touching_balances() {
        let (mut l, a, q) = book(100.0);
        let err = l.reserve("BTCUSDT", a, q, fill(Side::Buy, 11.0, 10.0), false).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { quantity, .. } if quantity == 11.0));
        assert_eq!(l.balance(q).free, 100.0);
        assert_eq!(l.balance(q).lock, 0.0);
    }

    #[test]
    fn resting_sell_locks_asset_then_releases() {
        let (mut l, a, q) = book(0.0);
        l.deposit("BTC", 2.0);
        let r = l.reserve("BTCUSDT", a, q, fill(Side::Sell, 2.0, 12.0), false).unwrap();
        assert_eq!(l.balance(a).lock, 2.0);
        assert_eq!(l.balance(a).free, 0.0);

        l.release(a, q, r);
        assert_eq!(l.balance(a).free, 2.0);
        assert_eq!(l.balance(a).lock, 0.0);
    }

    #[test]
    fn short_and_cover() {
        let (mut l, a, q) = book(1_000.0);
        l.reserve("BTCUSDT", a, q, fill(Side::Sell, 10.0, 20.0), true).unwrap();
        assert_eq!(l.balance(a).short, 10.0);
        assert_eq!(l.balance(q).free, 800.0);
        assert_eq!(l.net(a), -10.0);

        // cover at 15: collateral 200 back plus 50 profit
        let cover = Fill { side: Side::Buy, quantity: 10.0, price: 15.0, avg_short: 20.0, fee_rate: 0.0 };
        l.reserve("BTCUSDT", a, q, cover, true).unwrap();
        assert_eq!(l.balance(a).short, 0.0);
        assert_eq!(l.balance(q).free, 1_050.0);
    }

    #[test]
    fn resting_buys_do_not_share_a_short() {
        let (mut l, a, q) = book(1_000.0);
        l.reserve("BTCUSDT", a, q, fill(Side::Sell, 10.0, 20.0), true).unwrap();
        assert_eq!(l.balance(q).free, 800.0);

        let buy = Fill { side: Side::Buy, quantity: 10.0, price: 20.0, avg_short: 20.0, fee_rate: 0.0 };
        let mut rs = Vec::new();
        for _ in 0..7 {
            if let Ok(r) = l.reserve("BTCUSDT", a, q, buy, false) {
                rs.push(r);
            }
        }
        // each resting buy locks its full cost
        assert_eq!(rs.len(), 4);
        assert_eq!((l.balance(q).free, l.balance(q).lock), (0.0, 800.0));

        for r in rs {
            l.fill_reserved(a, q, r, buy);
            assert!(l.balance(q).free >= 0.0);
        }
        // first fill covered the short, the others bought
        assert_eq!(l.balance(a).short, 0.0);
        assert_eq!(l.balance(a).free, 30.0);
        assert_eq!((l.balance(q).free, l.balance(q).lock), (400.0, 0.0));
    }

    #[test]
    fn sell_past_free_rejected_while_units_locked() {
        let (mut l, a, q) = book(100.0);
        l.deposit("BTC", 1.0);
        l.reserve("BTCUSDT", a, q, fill(Side::Sell, 1.0, 12.0), false).unwrap();

        assert!(l.reserve("BTCUSDT", a, q, fill(Side::Sell, 1.0, 10.0), true).is_err());
        assert!(l.reserve("BTCUSDT", a, q, fill(Side::Sell, 1.0, 10.0), false).is_err());
        let b = l.balance(a);
        assert_eq!((b.free, b.lock, b.short), (0.0, 1.0, 0.0));
        assert_eq!(l.balance(q).free, 100.0);
    }

    #[test]
    fn release_clears_pending_short() {
        let (mut l, a, q) = book(100.0);
        let r = l.reserve("BTCUSDT", a, q, fill(Side::Sell, 2.0, 10.0), false).unwrap();
        assert_eq!(r, Reservation { asset: 0.0, quote: 20.0, short: 2.0 });

        l.deposit("BTC", 1.0);
        assert!(l.reserve("BTCUSDT", a, q, fill(Side::Sell, 1.0, 10.0), false).is_err());
        l.release(a, q, r);
        assert!(l.reserve("BTCUSDT", a, q, fill(Side::Sell, 1.0, 10.0), false).is_ok());
        assert_eq!(l.balance(q).free, 100.0);
    }

    #[test]
    fn fees_come_out_of_quote() {
        let (mut l, a, q) = book(1_000.0);
        let f = Fill { side: Side::Buy, quantity: 10.0, price: 10.0, avg_short: 0.0, fee_rate: 0.001 };
        l.reserve("BTCUSDT", a, q, f, true).unwrap();
        assert!((l.balance(q).free - 899.9).abs() < 1e-9);
    }
}
