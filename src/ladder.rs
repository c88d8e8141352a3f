//! Streak-based size ladder over synthetic bracket positions.
//!
//! Synthetic positions are the controller's own bookkeeping of bracket
//! entries. They are closed against the consensus mid and are never matched
//! against what the venue reports.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::breakout::Signal;
use crate::config::LadderConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn from_signal(signal: Signal) -> Option<Side> {
        match signal {
            Signal::Long => Some(Side::Long),
            Signal::Short => Some(Side::Short),
            Signal::None => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }

    /// Venue order side for the entry leg.
    pub fn order_side(&self) -> &'static str {
        match self {
            Side::Long => "BUY",
            Side::Short => "SELL",
        }
    }

    pub fn sign(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeResult {
    Win,
    Loss,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BracketLevels {
    pub entry: f64,
    pub stop: f64,
    pub target: f64,
}

impl BracketLevels {
    /// Stop and target placed `stop_pct` / `target_pct` away from the entry.
    pub fn around(side: Side, entry: f64, stop_pct: f64, target_pct: f64) -> Self {
        let s = side.sign();
        Self {
            entry,
            stop: entry * (1.0 - s * stop_pct / 100.0),
            target: entry * (1.0 + s * target_pct / 100.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticPosition {
    pub id: u64,
    pub side: Side,
    pub qty: f64,
    pub entry: f64,
    pub stop: f64,
    pub target: f64,
    pub opened_at: u64,
}

impl SyntheticPosition {
    fn exit_at(&self, mid: f64) -> Option<(f64, TradeResult)> {
        match self.side {
            Side::Long if mid <= self.stop => Some((self.stop, TradeResult::Loss)),
            Side::Long if mid >= self.target => Some((self.target, TradeResult::Win)),
            Side::Short if mid >= self.stop => Some((self.stop, TradeResult::Loss)),
            Side::Short if mid <= self.target => Some((self.target, TradeResult::Win)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedPosition {
    #[serde(flatten)]
    pub position: SyntheticPosition,
    pub exit: f64,
    pub closed_at: u64,
    pub result: TradeResult,
    pub return_pct: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StreakStats {
    pub last_result: Option<TradeResult>,
    pub streak_count: u32,
}

/// Open and closed synthetic positions plus lifetime totals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LadderBook {
    pub next_id: u64,
    pub open: Vec<SyntheticPosition>,
    pub closed: VecDeque<ClosedPosition>,
    pub wins: u64,
    pub losses: u64,
    pub realized_pct: f64,
}

impl LadderBook {
    pub fn streak(&self) -> StreakStats {
        let mut iter = self.closed.iter().rev();
        let last = match iter.next() {
            Some(c) => c.result,
            None => return StreakStats::default(),
        };
        let count = 1 + iter.take_while(|c| c.result == last).count() as u32;
        StreakStats { last_result: Some(last), streak_count: count }
    }
}

#[derive(Debug, Clone)]
pub struct RiskLadder {
    cfg: LadderConfig,
}

impl RiskLadder {
    pub fn new(cfg: LadderConfig) -> Self {
        Self { cfg }
    }

    pub fn open(&self, book: &mut LadderBook, side: Side, qty: f64, levels: BracketLevels, now: u64) -> u64 {
        book.next_id += 1;
        let id = book.next_id;
        book.open.push(SyntheticPosition {
            id,
            side,
            qty,
            entry: levels.entry,
            stop: levels.stop,
            target: levels.target,
            opened_at: now,
        });
        id
    }

    /// Closes every open position whose stop or target the mid has crossed.
    /// The stop is checked first.
    pub fn mark(&self, book: &mut LadderBook, mid: f64, now: u64) -> Vec<ClosedPosition> {
        if !mid.is_finite() || mid <= 0.0 {
            return Vec::new();
        }
        let mut closed_now = Vec::new();
        let mut still_open = Vec::with_capacity(book.open.len());
        for pos in book.open.drain(..) {
            match pos.exit_at(mid) {
                Some((exit, result)) => {
                    let return_pct = if pos.entry > 0.0 {
                        (exit - pos.entry) / pos.entry * 100.0 * pos.side.sign()
                    } else {
                        0.0
                    };
                    closed_now.push(ClosedPosition { position: pos, exit, closed_at: now, result, return_pct });
                }
                None => still_open.push(pos),
            }
        }
        book.open = still_open;

        for c in &closed_now {
            match c.result {
                TradeResult::Win => book.wins += 1,
                TradeResult::Loss => book.losses += 1,
            }
            book.realized_pct += c.return_pct;
            book.closed.push_back(c.clone());
        }
        let cap = self.cfg.history.max(1);
        while book.closed.len() > cap {
            book.closed.pop_front();
        }
        closed_now
    }

    pub fn multiplier(&self, book: &LadderBook) -> f64 {
        let stats = book.streak();
        let mult = match stats.last_result {
            Some(TradeResult::Win) => (1.0 + self.cfg.win_step * stats.streak_count as f64).min(self.cfg.max_mult),
            Some(TradeResult::Loss) if stats.streak_count >= self.cfg.penalty_after_losses => {
                self.cfg.loss_penalty_mult
            }
            _ => 1.0,
        };
        mult.clamp(self.cfg.loss_penalty_mult.min(self.cfg.max_mult), self.cfg.max_mult)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ladder() -> RiskLadder {
        RiskLadder::new(LadderConfig::default())
    }

    fn open_long(l: &RiskLadder, book: &mut LadderBook, now: u64) {
        l.open(book, Side::Long, 1.0, BracketLevels { entry: 100.0, stop: 99.0, target: 102.0 }, now);
    }

    #[test]
    fn test_long_closes_at_target_and_stop() {
        let l = ladder();
        let mut book = LadderBook::default();
        open_long(&l, &mut book, 1);
        assert!(l.mark(&mut book, 101.0, 2).is_empty());
        let closed = l.mark(&mut book, 102.5, 3);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].result, TradeResult::Win);
        assert_eq!(closed[0].exit, 102.0);
        assert!((closed[0].return_pct - 2.0).abs() < 1e-9);

        open_long(&l, &mut book, 4);
        let closed = l.mark(&mut book, 98.0, 5);
        assert_eq!(closed[0].result, TradeResult::Loss);
        assert_eq!(book.wins, 1);
        assert_eq!(book.losses, 1);
        assert!(book.open.is_empty());
    }

    #[test]
    fn test_short_mirrors() {
        let l = ladder();
        let mut book = LadderBook::default();
        l.open(&mut book, Side::Short, 1.0, BracketLevels { entry: 100.0, stop: 101.0, target: 98.0 }, 1);
        let closed = l.mark(&mut book, 97.0, 2);
        assert_eq!(closed[0].result, TradeResult::Win);
        assert!((closed[0].return_pct - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_stop_wins_when_both_crossed() {
        let l = ladder();
        let mut book = LadderBook::default();
        // inverted bracket: any mid crosses both
        l.open(&mut book, Side::Long, 1.0, BracketLevels { entry: 100.0, stop: 101.0, target: 99.0 }, 1);
        let closed = l.mark(&mut book, 100.0, 2);
        assert_eq!(closed[0].result, TradeResult::Loss);
    }

    #[test]
    fn test_three_losses_hit_penalty() {
        let l = ladder();
        let mut book = LadderBook::default();
        for i in 0..3 {
            open_long(&l, &mut book, i);
            l.mark(&mut book, 90.0, i);
        }
        assert_eq!(book.streak(), StreakStats { last_result: Some(TradeResult::Loss), streak_count: 3 });
        assert_eq!(l.multiplier(&book), 0.5);
    }

    #[test]
    fn test_single_loss_is_neutral() {
        let l = ladder();
        let mut book = LadderBook::default();
        open_long(&l, &mut book, 0);
        l.mark(&mut book, 90.0, 1);
        assert_eq!(l.multiplier(&book), 1.0);
    }

    #[test]
    fn test_win_streak_caps() {
        let l = ladder();
        let mut book = LadderBook::default();
        open_long(&l, &mut book, 0);
        l.mark(&mut book, 110.0, 1);
        assert!((l.multiplier(&book) - 1.25).abs() < 1e-12);
        for i in 0..10 {
            open_long(&l, &mut book, i);
            l.mark(&mut book, 110.0, i);
        }
        assert_eq!(l.multiplier(&book), 2.0);
    }

    #[test]
    fn test_multiplier_bounds_over_mixed_history() {
        let l = ladder();
        let cfg = LadderConfig::default();
        let mut book = LadderBook::default();
        let marks = [110.0, 90.0, 90.0, 110.0, 110.0, 110.0, 90.0, 90.0, 90.0, 90.0];
        for (i, m) in marks.iter().enumerate() {
            open_long(&l, &mut book, i as u64);
            l.mark(&mut book, *m, i as u64);
            let mult = l.multiplier(&book);
            assert!(mult >= cfg.loss_penalty_mult && mult <= cfg.max_mult);
        }
    }

    #[test]
    fn test_history_bounded_keeps_tail_streak() {
        let l = RiskLadder::new(LadderConfig { history: 3, ..Default::default() });
        let mut book = LadderBook::default();
        for (i, m) in [110.0, 110.0, 90.0, 90.0, 90.0].iter().enumerate() {
            open_long(&l, &mut book, i as u64);
            l.mark(&mut book, *m, i as u64);
        }
        assert_eq!(book.closed.len(), 3);
        assert_eq!(book.streak().streak_count, 3);
        assert_eq!(book.wins, 2);
        assert_eq!(book.losses, 3);
    }

    #[test]
    fn test_smallest_valid_history_still_reaches_penalty() {
        let cfg = LadderConfig { history: 2, penalty_after_losses: 2, ..Default::default() };
        let l = RiskLadder::new(cfg.clone());
        let mut book = LadderBook::default();
        for (i, m) in [110.0, 90.0, 90.0, 90.0].iter().enumerate() {
            open_long(&l, &mut book, i as u64);
            l.mark(&mut book, *m, i as u64);
        }
        assert_eq!(book.closed.len(), 2);
        assert_eq!(book.streak().streak_count, 2);
        assert_eq!(l.multiplier(&book), cfg.loss_penalty_mult);

        // one slot short of the penalty streak: trimming hides the third loss
        let short = RiskLadder::new(LadderConfig { history: 1, penalty_after_losses: 2, ..Default::default() });
        let mut book = LadderBook::default();
        for i in 0..3 {
            open_long(&short, &mut book, i);
            short.mark(&mut book, 90.0, i);
        }
        assert_eq!(short.multiplier(&book), 1.0);
        let mut rejected = crate::config::Config::default();
        rejected.ladder = LadderConfig { history: 1, penalty_after_losses: 2, ..Default::default() };
        assert!(!rejected.validate().is_empty());
    }

    #[test]
    fn test_bracket_levels_around() {
        let long = BracketLevels::around(Side::Long, 100.0, 0.6, 1.2);
        assert!((long.stop - 99.4).abs() < 1e-9 && (long.target - 101.2).abs() < 1e-9);
        let short = BracketLevels::around(Side::Short, 100.0, 0.6, 1.2);
        assert!((short.stop - 100.6).abs() < 1e-9 && (short.target - 98.8).abs() < 1e-9);
    }

    #[test]
    fn test_empty_book() {
        let l = ladder();
        let book = LadderBook::default();
        assert_eq!(book.streak(), StreakStats::default());
        assert_eq!(l.multiplier(&book), 1.0);
    }
}
