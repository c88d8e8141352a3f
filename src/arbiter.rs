//! Per-tick execution arbitration.
//!
//! Exactly one decision per tick, by strict priority: halt, breakout entry,
//! full grid refresh, nothing. State only changes through `commit`, which the
//! loop calls after the execution sink accepted the order.

use serde::{Deserialize, Serialize};

use crate::breakout::Signal;
use crate::config::{ArbiterConfig, EntryKind};
use crate::grid::GridPlan;
use crate::ladder::{BracketLevels, LadderBook, RiskLadder, Side};
use crate::regime::RegimeStatus;
use crate::sizing::Sizer;

const DAY_SECS: u64 = 86_400;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionDecision {
    None,
    FullGrid {
        lower: f64,
        upper: f64,
        levels: u32,
        qty: f64,
    },
    MicroGrid {
        side: Side,
        lower: f64,
        upper: f64,
        levels: u32,
        qty: f64,
    },
    Bracket {
        side: Side,
        qty: f64,
        entry: f64,
        stop: f64,
        target: f64,
        entry_kind: EntryKind,
    },
}

impl ExecutionDecision {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionDecision::None => "NONE",
            ExecutionDecision::FullGrid { .. } => "FULL_GRID",
            ExecutionDecision::MicroGrid { .. } => "MICRO_GRID",
            ExecutionDecision::Bracket { .. } => "BRACKET",
        }
    }

    /// Grid-shaped decisions as a plan for the execution sink.
    pub fn as_grid(&self) -> Option<(GridPlan, f64)> {
        match *self {
            ExecutionDecision::FullGrid { lower, upper, levels, qty }
            | ExecutionDecision::MicroGrid { lower, upper, levels, qty, .. } => {
                Some((GridPlan { lower, upper, levels }, qty))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeCounters {
    pub trades_today: u32,
    /// UTC day number (days since epoch) the counter belongs to.
    pub trade_day: Option<u64>,
    pub last_long_ts: Option<u64>,
    pub last_short_ts: Option<u64>,
}

impl TradeCounters {
    /// Zeroes the daily count on a UTC day change. Returns true when rolled.
    pub fn roll_day(&mut self, now: u64) -> bool {
        let day = now / DAY_SECS;
        if self.trade_day == Some(day) {
            return false;
        }
        self.trade_day = Some(day);
        self.trades_today = 0;
        true
    }

    pub fn last_trade_ts(&self, side: Side) -> Option<u64> {
        match side {
            Side::Long => self.last_long_ts,
            Side::Short => self.last_short_ts,
        }
    }

    fn record(&mut self, side: Side, now: u64) {
        match side {
            Side::Long => self.last_long_ts = Some(now),
            Side::Short => self.last_short_ts = Some(now),
        }
        self.trades_today = self.trades_today.saturating_add(1);
    }
}

/// Reference point of the last accepted full grid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArbiterMemory {
    pub last_grid_mid: Option<f64>,
    pub last_grid_status: Option<RegimeStatus>,
}

/// Everything the arbiter looks at for one tick.
#[derive(Debug, Clone, Copy)]
pub struct ArbiterInput {
    pub status: RegimeStatus,
    pub mid: Option<f64>,
    pub signal: Signal,
    pub box_top: Option<f64>,
    pub box_bottom: Option<f64>,
    pub grid: GridPlan,
    pub leverage: f64,
    pub ladder_mult: f64,
    pub equity: Option<f64>,
    pub now: u64,
}

/// Tick context an accepted decision is committed under.
#[derive(Debug, Clone, Copy)]
pub struct Placement {
    pub status: RegimeStatus,
    pub mid: f64,
    pub now: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Arbitration {
    pub decision: ExecutionDecision,
    pub reason: &'static str,
}

impl Arbitration {
    fn new(decision: ExecutionDecision, reason: &'static str) -> Self {
        Self { decision, reason }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionArbiter {
    cfg: ArbiterConfig,
    replace_pct: f64,
    sizer: Sizer,
}

impl ExecutionArbiter {
    pub fn new(cfg: ArbiterConfig, replace_pct: f64, sizer: Sizer) -> Self {
        Self { cfg, replace_pct, sizer }
    }

    pub fn decide(&self, input: &ArbiterInput, counters: &TradeCounters, memory: &ArbiterMemory) -> Arbitration {
        let mid = match input.mid {
            Some(m) if m.is_finite() && m > 0.0 => m,
            _ => return Arbitration::new(ExecutionDecision::None, "no mid"),
        };
        if input.status.is_halting() {
            return Arbitration::new(ExecutionDecision::None, "halted");
        }

        let mut hold_reason = "hold";
        if let Some(side) = Side::from_signal(input.signal) {
            match self.entry(input, side, mid, counters) {
                Ok(decision) => return Arbitration::new(decision, "breakout"),
                Err(reason) => hold_reason = reason,
            }
        }

        let cap = self.sizer.notional_cap(input.equity);
        if self.grid_stale(input.status, mid, memory) {
            let plan = input.grid;
            let qty = self.sizer.grid_qty_per_level(cap, plan.levels, mid, input.leverage);
            if qty <= 0.0 {
                return Arbitration::new(ExecutionDecision::None, "grid qty below step");
            }
            return Arbitration::new(
                ExecutionDecision::FullGrid { lower: plan.lower, upper: plan.upper, levels: plan.levels, qty },
                "grid refresh",
            );
        }
        Arbitration::new(ExecutionDecision::None, hold_reason)
    }

    fn entry(
        &self,
        input: &ArbiterInput,
        side: Side,
        mid: f64,
        counters: &TradeCounters,
    ) -> Result<ExecutionDecision, &'static str> {
        if self.cfg.warn_blocks_entries && input.status == RegimeStatus::Warn {
            return Err("entry blocked under warn");
        }
        if counters.trades_today >= self.cfg.max_trades_per_day {
            return Err("daily cap");
        }
        if let Some(last) = counters.last_trade_ts(side) {
            if input.now.saturating_sub(last) < self.cfg.cooldown_secs {
                return Err("cooldown");
            }
        }

        if self.cfg.bracket_mode {
            let qty = self.sizer.bracket_qty(mid, input.leverage, input.ladder_mult);
            if qty <= 0.0 {
                return Err("bracket qty below step");
            }
            let lv = BracketLevels::around(side, mid, self.cfg.bracket_stop_pct, self.cfg.bracket_target_pct);
            return Ok(ExecutionDecision::Bracket {
                side,
                qty,
                entry: lv.entry,
                stop: lv.stop,
                target: lv.target,
                entry_kind: self.cfg.entry_kind,
            });
        }

        let center = match side {
            Side::Long => input.box_top,
            Side::Short => input.box_bottom,
        }
        .unwrap_or(mid);
        let band = self.cfg.micro_band_pct / 100.0;
        let levels = self.cfg.micro_levels.max(2);
        let cap = self.sizer.notional_cap(input.equity);
        let qty = self.sizer.grid_qty_per_level(cap, levels, center, input.leverage * input.ladder_mult);
        if qty <= 0.0 {
            return Err("micro qty below step");
        }
        Ok(ExecutionDecision::MicroGrid {
            side,
            lower: center * (1.0 - band),
            upper: center * (1.0 + band),
            levels,
            qty,
        })
    }

    fn grid_stale(&self, status: RegimeStatus, mid: f64, memory: &ArbiterMemory) -> bool {
        let last_mid = match memory.last_grid_mid {
            Some(m) if m > 0.0 => m,
            _ => return true,
        };
        if memory.last_grid_status != Some(status) {
            return true;
        }
        (mid - last_mid).abs() / last_mid * 100.0 > self.replace_pct
    }

    /// Applies an accepted decision to the loop state.
    pub fn commit(
        &self,
        decision: &ExecutionDecision,
        at: Placement,
        counters: &mut TradeCounters,
        memory: &mut ArbiterMemory,
        ladder: &RiskLadder,
        book: &mut LadderBook,
    ) {
        match *decision {
            ExecutionDecision::None => {}
            ExecutionDecision::FullGrid { .. } => {
                memory.last_grid_mid = Some(at.mid);
                memory.last_grid_status = Some(at.status);
            }
            ExecutionDecision::MicroGrid { side, .. } => counters.record(side, at.now),
            ExecutionDecision::Bracket { side, qty, entry, stop, target, .. } => {
                counters.record(side, at.now);
                ladder.open(book, side, qty, BracketLevels { entry, stop, target }, at.now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LadderConfig, SizingConfig};

    fn arbiter(cfg: ArbiterConfig) -> ExecutionArbiter {
        ExecutionArbiter::new(cfg, 0.5, Sizer::new(SizingConfig::default()))
    }

    fn input(status: RegimeStatus, signal: Signal) -> ArbiterInput {
        ArbiterInput {
            status,
            mid: Some(100.0),
            signal,
            box_top: Some(99.5),
            box_bottom: Some(95.0),
            grid: GridPlan { lower: 99.0, upper: 101.0, levels: 20 },
            leverage: 2.0,
            ladder_mult: 1.0,
            equity: Some(10_000.0),
            now: 1_000_000,
        }
    }

    fn placed_grid(mid: f64, status: RegimeStatus) -> ArbiterMemory {
        ArbiterMemory { last_grid_mid: Some(mid), last_grid_status: Some(status) }
    }

    #[test]
    fn test_halting_status_is_none() {
        let a = arbiter(ArbiterConfig::default());
        for status in [RegimeStatus::Panic, RegimeStatus::Suspend] {
            let r = a.decide(&input(status, Signal::Long), &TradeCounters::default(), &ArbiterMemory::default());
            assert_eq!(r.decision, ExecutionDecision::None);
        }
    }

    #[test]
    fn test_missing_mid_is_none() {
        let a = arbiter(ArbiterConfig::default());
        let mut inp = input(RegimeStatus::Ok, Signal::Long);
        inp.mid = None;
        let r = a.decide(&inp, &TradeCounters::default(), &ArbiterMemory::default());
        assert_eq!(r.decision, ExecutionDecision::None);
    }

    #[test]
    fn test_breakout_becomes_bracket() {
        let a = arbiter(ArbiterConfig::default());
        let r = a.decide(&input(RegimeStatus::Ok, Signal::Long), &TradeCounters::default(), &ArbiterMemory::default());
        match r.decision {
            ExecutionDecision::Bracket { side, qty, entry, stop, target, entry_kind } => {
                assert_eq!(side, Side::Long);
                // 50 * 2 * 1 / 100
                assert!((qty - 1.0).abs() < 1e-9);
                assert_eq!(entry, 100.0);
                assert!(stop < entry && target > entry);
                assert_eq!(entry_kind, EntryKind::Ioc);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_breakout_allowed_under_warn_by_default() {
        let a = arbiter(ArbiterConfig::default());
        let r = a.decide(&input(RegimeStatus::Warn, Signal::Short), &TradeCounters::default(), &ArbiterMemory::default());
        assert_eq!(r.decision.kind(), "BRACKET");

        let strict = arbiter(ArbiterConfig { warn_blocks_entries: true, ..Default::default() });
        let r = strict.decide(&input(RegimeStatus::Warn, Signal::Short), &TradeCounters::default(), &ArbiterMemory::default());
        assert_eq!(r.decision.kind(), "FULL_GRID");
    }

    #[test]
    fn test_micro_grid_centres_on_box_edge() {
        let a = arbiter(ArbiterConfig { bracket_mode: false, ..Default::default() });
        let r = a.decide(&input(RegimeStatus::Ok, Signal::Long), &TradeCounters::default(), &ArbiterMemory::default());
        match r.decision {
            ExecutionDecision::MicroGrid { side, lower, upper, levels, .. } => {
                assert_eq!(side, Side::Long);
                assert!(((lower + upper) / 2.0 - 99.5).abs() < 1e-9);
                assert_eq!(levels, 4);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_daily_cap_and_cooldown_fall_through() {
        let a = arbiter(ArbiterConfig::default());
        let mem = placed_grid(100.0, RegimeStatus::Ok);

        let capped = TradeCounters { trades_today: 12, ..Default::default() };
        let r = a.decide(&input(RegimeStatus::Ok, Signal::Long), &capped, &mem);
        assert_eq!(r.decision, ExecutionDecision::None);
        assert_eq!(r.reason, "daily cap");

        let inp = input(RegimeStatus::Ok, Signal::Long);
        let cooling = TradeCounters { last_long_ts: Some(inp.now - 10), ..Default::default() };
        let r = a.decide(&inp, &cooling, &mem);
        assert_eq!(r.reason, "cooldown");
        // the other side is not cooling down
        let r = a.decide(&input(RegimeStatus::Ok, Signal::Short), &cooling, &mem);
        assert_eq!(r.decision.kind(), "BRACKET");
    }

    #[test]
    fn test_full_grid_triggers() {
        let a = arbiter(ArbiterConfig::default());
        let counters = TradeCounters::default();
        let inp = input(RegimeStatus::Ok, Signal::None);

        // never placed
        assert_eq!(a.decide(&inp, &counters, &ArbiterMemory::default()).decision.kind(), "FULL_GRID");
        // unchanged mid and status
        assert_eq!(a.decide(&inp, &counters, &placed_grid(100.0, RegimeStatus::Ok)).decision, ExecutionDecision::None);
        // small drift under the threshold
        assert_eq!(a.decide(&inp, &counters, &placed_grid(99.7, RegimeStatus::Ok)).decision, ExecutionDecision::None);
        // drift over 0.5%
        assert_eq!(a.decide(&inp, &counters, &placed_grid(99.0, RegimeStatus::Ok)).decision.kind(), "FULL_GRID");
        // status change
        assert_eq!(a.decide(&inp, &counters, &placed_grid(100.0, RegimeStatus::Warn)).decision.kind(), "FULL_GRID");
    }

    #[test]
    fn test_small_qty_degrades() {
        let sizing = SizingConfig { bracket_notional: 0.01, notional_per_side: 0.01, ..Default::default() };
        let a = ExecutionArbiter::new(ArbiterConfig::default(), 0.5, Sizer::new(sizing));
        let r = a.decide(&input(RegimeStatus::Ok, Signal::Long), &TradeCounters::default(), &ArbiterMemory::default());
        // bracket too small, falls to grid, grid too small as well
        assert_eq!(r.decision, ExecutionDecision::None);
    }

    #[test]
    fn test_commit_bracket_updates_counters_and_ladder() {
        let a = arbiter(ArbiterConfig::default());
        let ladder = RiskLadder::new(LadderConfig::default());
        let mut book = LadderBook::default();
        let mut counters = TradeCounters::default();
        let mut mem = ArbiterMemory::default();
        let inp = input(RegimeStatus::Ok, Signal::Long);
        let r = a.decide(&inp, &counters, &mem);
        let at = Placement { status: inp.status, mid: 100.0, now: inp.now };
        a.commit(&r.decision, at, &mut counters, &mut mem, &ladder, &mut book);
        assert_eq!(counters.trades_today, 1);
        assert_eq!(counters.last_long_ts, Some(inp.now));
        assert_eq!(book.open.len(), 1);
        assert!(mem.last_grid_mid.is_none());
    }

    #[test]
    fn test_commit_full_grid_records_reference() {
        let a = arbiter(ArbiterConfig::default());
        let ladder = RiskLadder::new(LadderConfig::default());
        let mut book = LadderBook::default();
        let mut counters = TradeCounters::default();
        let mut mem = ArbiterMemory::default();
        let decision = ExecutionDecision::FullGrid { lower: 99.0, upper: 101.0, levels: 20, qty: 0.2 };
        let at = Placement { status: RegimeStatus::Warn, mid: 100.0, now: 5 };
        a.commit(&decision, at, &mut counters, &mut mem, &ladder, &mut book);
        assert_eq!(mem, placed_grid(100.0, RegimeStatus::Warn));
        assert_eq!(counters.trades_today, 0);
    }

    #[test]
    fn test_roll_day() {
        let mut c = TradeCounters { trades_today: 5, trade_day: Some(1), ..Default::default() };
        assert!(!c.roll_day(DAY_SECS + 10));
        assert_eq!(c.trades_today, 5);
        assert!(c.roll_day(2 * DAY_SECS));
        assert_eq!(c.trades_today, 0);
        assert_eq!(c.trade_day, Some(2));
    }

    #[test]
    fn test_decision_serializes_with_kind_tag() {
        let d = ExecutionDecision::FullGrid { lower: 1.0, upper: 2.0, levels: 2, qty: 0.1 };
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["kind"], "FULL_GRID");
    }
}
