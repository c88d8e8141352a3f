//! Regime-aware grid band planning.

use serde::{Deserialize, Serialize};

use crate::config::GridConfig;
use crate::consensus::QuoteWindow;
use crate::regime::RegimeStatus;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridPlan {
    pub lower: f64,
    pub upper: f64,
    pub levels: u32,
}

impl GridPlan {
    /// Evenly spaced level prices from lower to upper, both inclusive.
    pub fn prices(&self) -> Vec<f64> {
        let levels = self.levels.max(2);
        let step = (self.upper - self.lower) / (levels - 1) as f64;
        (0..levels).map(|i| self.lower + i as f64 * step).collect()
    }

    pub fn step(&self) -> f64 {
        (self.upper - self.lower) / (self.levels.max(2) - 1) as f64
    }

    pub fn band_pct(&self) -> f64 {
        let mid = (self.upper + self.lower) / 2.0;
        if mid > 0.0 {
            (self.upper - mid) / mid * 100.0
        } else {
            0.0
        }
    }

    /// Rough replay of the grid along a price path: every full level step
    /// travelled between consecutive prices counts as one round trip earning
    /// `fee_frac` of the step.
    pub fn estimate_crossings(&self, prices: &[f64], fee_frac: f64) -> GridEstimate {
        let step = self.step();
        if prices.len() < 2 || step <= 0.0 {
            return GridEstimate::default();
        }
        let mut trades = 0u64;
        let mut pnl = 0.0;
        for pair in prices.windows(2) {
            let crosses = ((pair[1] - pair[0]).abs() / step).floor() as u64;
            trades += crosses;
            pnl += crosses as f64 * step * fee_frac;
        }
        GridEstimate { trades, pnl }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GridEstimate {
    pub trades: u64,
    pub pnl: f64,
}

#[derive(Debug, Clone)]
pub struct GridPlanner {
    cfg: GridConfig,
}

impl GridPlanner {
    pub fn new(cfg: GridConfig) -> Self {
        Self { cfg }
    }

    pub fn band_pct(&self, vol_pct: f64, status: RegimeStatus) -> f64 {
        let k = match status {
            RegimeStatus::Ok => self.cfg.k,
            RegimeStatus::Warn => self.cfg.k * self.cfg.widen_warn,
            RegimeStatus::Panic | RegimeStatus::Suspend => self.cfg.k * self.cfg.widen_panic,
        };
        let vol = if vol_pct.is_finite() { vol_pct.max(0.0) } else { 0.0 };
        // keep the lower edge strictly positive
        (k * vol).max(self.cfg.min_band_pct).min(99.0)
    }

    pub fn plan(&self, mid: f64, vol_pct: f64, status: RegimeStatus) -> GridPlan {
        let band = self.band_pct(vol_pct, status);
        GridPlan {
            lower: mid * (1.0 - band / 100.0),
            upper: mid * (1.0 + band / 100.0),
            levels: self.cfg.levels.max(2),
        }
    }

    /// `plan` plus the optional SMA trend filter on the level count.
    pub fn plan_with_trend(&self, mid: f64, vol_pct: f64, status: RegimeStatus, history: &QuoteWindow) -> GridPlan {
        let mut plan = self.plan(mid, vol_pct, status);
        if !self.cfg.trend_filter {
            return plan;
        }
        if let Some(sma) = history.sma(self.cfg.trend_sma_window) {
            plan.levels = if mid > sma {
                plan.levels.max(self.cfg.levels_bull)
            } else {
                plan.levels.min(self.cfg.levels_bear)
            };
            plan.levels = plan.levels.max(2);
        }
        plan
    }
}
