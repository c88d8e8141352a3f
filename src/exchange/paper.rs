//! In-memory execution sink.
//!
//! Resting grid orders fill when `on_price` crosses them; bracket entries fill
//! at once at the entry price. Clones share the same book, so a replay driver
//! or a test keeps a handle while the controller owns the boxed sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::{grid_orders, BracketOrder, ExecutionSink, FillRecord, OpenOrder};
use crate::grid::GridPlan;
use crate::ladder::Side;

#[derive(Debug, Clone, Copy)]
struct Resting {
    id: u64,
    side: Side,
    price: f64,
    qty: f64,
}

#[derive(Debug, Default)]
struct PaperBook {
    next_id: u64,
    resting: Vec<Resting>,
    fills: Vec<FillRecord>,
    cash: f64,
    position: f64,
    last_price: Option<f64>,
    grid_replacements: u64,
    brackets: u64,
}

impl PaperBook {
    fn id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn fill(&mut self, id: u64, side: Side, price: f64, qty: f64, fee_rate: f64, ts: u64) {
        let notional = price * qty;
        let fee = notional * fee_rate;
        self.cash -= side.sign() * notional + fee;
        self.position += side.sign() * qty;
        self.fills.push(FillRecord {
            id: format!("paper-{}", id),
            side: side.order_side().to_string(),
            price,
            qty,
            fee,
            ts,
        });
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PaperStats {
    pub resting: usize,
    pub fills: usize,
    pub grid_replacements: u64,
    pub brackets: u64,
    pub position: f64,
    pub equity: f64,
}

#[derive(Clone)]
pub struct PaperSink {
    book: Arc<Mutex<PaperBook>>,
    failing: Arc<AtomicBool>,
    fee_rate: f64,
}

impl PaperSink {
    pub fn new(equity: f64) -> Self {
        let book = PaperBook { cash: equity, ..Default::default() };
        Self { book: Arc::new(Mutex::new(book)), failing: Arc::new(AtomicBool::new(false)), fee_rate: 0.0005 }
    }

    pub fn with_fee_rate(mut self, fee_rate: f64) -> Self {
        self.fee_rate = fee_rate.max(0.0);
        self
    }

    /// While set, every placement is rejected.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, PaperBook>> {
        self.book.lock().map_err(|_| anyhow!("paper book poisoned"))
    }

    fn check_available(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("paper venue rejecting orders"));
        }
        Ok(())
    }

    /// Moves the market to `price`: fills every resting order it crosses.
    /// Returns the number of fills.
    pub fn on_price(&self, price: f64, ts: u64) -> usize {
        if !(price.is_finite() && price > 0.0) {
            return 0;
        }
        let mut book = match self.book.lock() {
            Ok(b) => b,
            Err(_) => return 0,
        };
        book.last_price = Some(price);
        let (hit, keep): (Vec<Resting>, Vec<Resting>) = book.resting.drain(..).partition(|o| match o.side {
            Side::Long => price <= o.price,
            Side::Short => price >= o.price,
        });
        book.resting = keep;
        for o in &hit {
            book.fill(o.id, o.side, o.price, o.qty, self.fee_rate, ts);
        }
        hit.len()
    }

    pub fn stats(&self) -> PaperStats {
        match self.book.lock() {
            Ok(b) => PaperStats {
                resting: b.resting.len(),
                fills: b.fills.len(),
                grid_replacements: b.grid_replacements,
                brackets: b.brackets,
                position: b.position,
                equity: b.cash + b.position * b.last_price.unwrap_or(0.0),
            },
            Err(_) => PaperStats::default(),
        }
    }
}

#[async_trait]
impl ExecutionSink for PaperSink {
    fn name(&self) -> &str {
        "paper"
    }

    async fn replace_standing_orders(&self, plan: &GridPlan, qty: f64, reference_price: f64) -> Result<usize> {
        self.check_available()?;
        if !qty.is_finite() || qty <= 0.0 {
            return Err(anyhow!("grid qty must be positive, got {}", qty));
        }
        let mut book = self.lock()?;
        book.resting.clear();
        for o in grid_orders(plan, reference_price) {
            let id = book.id();
            book.resting.push(Resting { id, side: o.side, price: o.price, qty });
        }
        book.grid_replacements += 1;
        book.last_price = Some(reference_price);
        Ok(book.resting.len())
    }

    async fn place_bracket(&self, order: &BracketOrder) -> Result<()> {
        self.check_available()?;
        if !order.qty.is_finite() || order.qty <= 0.0 || order.entry <= 0.0 {
            return Err(anyhow!("invalid bracket qty={} entry={}", order.qty, order.entry));
        }
        let mut book = self.lock()?;
        let id = book.id();
        let ts = crate::state::now_ts();
        book.fill(id, order.side, order.entry, order.qty, self.fee_rate, ts);
        book.brackets += 1;
        Ok(())
    }

    async fn list_open_orders(&self) -> Result<Vec<OpenOrder>> {
        let book = self.lock()?;
        Ok(book
            .resting
            .iter()
            .map(|o| OpenOrder {
                id: format!("paper-{}", o.id),
                side: o.side.order_side().to_string(),
                price: o.price,
                qty: o.qty,
            })
            .collect())
    }

    async fn list_recent_fills(&self, limit: usize) -> Result<Vec<FillRecord>> {
        let book = self.lock()?;
        let start = book.fills.len().saturating_sub(limit);
        Ok(book.fills[start..].to_vec())
    }

    async fn get_equity(&self) -> Option<f64> {
        let book = self.book.lock().ok()?;
        Some(book.cash + book.position * book.last_price.unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EntryKind;

    fn plan() -> GridPlan {
        GridPlan { lower: 99.0, upper: 101.0, levels: 5 }
    }

    #[tokio::test]
    async fn test_replace_clears_previous_grid() {
        let sink = PaperSink::new(10_000.0);
        assert_eq!(sink.replace_standing_orders(&plan(), 1.0, 100.0).await.unwrap(), 4);
        assert_eq!(sink.replace_standing_orders(&plan(), 1.0, 100.0).await.unwrap(), 4);
        assert_eq!(sink.list_open_orders().await.unwrap().len(), 4);
        assert_eq!(sink.stats().grid_replacements, 2);
    }

    #[tokio::test]
    async fn test_price_crossing_fills_orders() {
        let sink = PaperSink::new(10_000.0).with_fee_rate(0.0);
        sink.replace_standing_orders(&plan(), 2.0, 100.0).await.unwrap();
        assert_eq!(sink.on_price(99.4, 1), 1);
        let fills = sink.list_recent_fills(10).await.unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].side, "BUY");
        assert_eq!(fills[0].price, 99.5);
        assert_eq!(sink.stats().position, 2.0);
        // falling further takes the lowest buy too
        assert_eq!(sink.on_price(98.0, 2), 1);
        assert_eq!(sink.stats().resting, 2);
    }

    #[tokio::test]
    async fn test_failing_rejects_and_keeps_book() {
        let sink = PaperSink::new(10_000.0);
        let handle = sink.clone();
        sink.replace_standing_orders(&plan(), 1.0, 100.0).await.unwrap();
        handle.set_failing(true);
        assert!(sink.replace_standing_orders(&plan(), 1.0, 100.5).await.is_err());
        assert_eq!(sink.stats().grid_replacements, 1);
        handle.set_failing(false);
        assert!(sink.replace_standing_orders(&plan(), 1.0, 100.5).await.is_ok());
    }

    #[tokio::test]
    async fn test_bracket_fills_and_moves_equity() {
        let sink = PaperSink::new(1_000.0).with_fee_rate(0.0);
        let order = BracketOrder {
            side: Side::Short,
            qty: 1.0,
            entry: 100.0,
            stop: 101.0,
            target: 98.0,
            entry_kind: EntryKind::Market,
            reduce_only: false,
        };
        sink.place_bracket(&order).await.unwrap();
        sink.on_price(98.0, 5);
        let equity = sink.get_equity().await.unwrap();
        assert!((equity - 1_002.0).abs() < 1e-9);
        assert_eq!(sink.stats().brackets, 1);
    }

    #[tokio::test]
    async fn test_recent_fills_limit() {
        let sink = PaperSink::new(10_000.0);
        sink.replace_standing_orders(&plan(), 1.0, 100.0).await.unwrap();
        sink.on_price(90.0, 1);
        assert_eq!(sink.list_recent_fills(1).await.unwrap().len(), 1);
        assert_eq!(sink.list_recent_fills(10).await.unwrap().len(), 2);
    }
}
