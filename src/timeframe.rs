//! Fast/slow candle cadence selection with stickiness.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::TimeframeConfig;
use crate::regime::RegimeStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
        }
    }

    pub fn secs(&self) -> u64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M3 => 180,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::H1 => 3600,
        }
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Timeframe::M1),
            "3m" => Ok(Timeframe::M3),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "1h" => Ok(Timeframe::H1),
            other => Err(format!("unsupported timeframe {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeframeState {
    pub current: Timeframe,
    pub pending: Option<Timeframe>,
    pub pending_count: u32,
}

impl TimeframeState {
    pub fn new(initial: Timeframe) -> Self {
        Self { current: initial, pending: None, pending_count: 0 }
    }
}

/// Outcome of one selection step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub timeframe: Timeframe,
    pub desired: Timeframe,
    pub switched: bool,
}

#[derive(Debug, Clone)]
pub struct TimeframeSelector {
    cfg: TimeframeConfig,
}

impl TimeframeSelector {
    pub fn new(cfg: TimeframeConfig) -> Self {
        Self { cfg }
    }

    pub fn desired(&self, current: Timeframe, status: RegimeStatus, vol_pct: f64, trades_today: u32) -> Timeframe {
        if status != RegimeStatus::Ok || vol_pct >= self.cfg.vol_high {
            return self.cfg.slow;
        }
        let warmup = self.cfg.warmup_frac * self.cfg.daily_target as f64;
        if (trades_today as f64) < warmup || vol_pct <= self.cfg.vol_low {
            return self.cfg.fast;
        }
        current
    }

    pub fn select(
        &self,
        state: &mut TimeframeState,
        status: RegimeStatus,
        vol_pct: f64,
        trades_today: u32,
    ) -> Selection {
        let desired = self.desired(state.current, status, vol_pct, trades_today);
        if desired == state.current {
            state.pending = None;
            state.pending_count = 0;
            return Selection { timeframe: state.current, desired, switched: false };
        }

        if state.pending == Some(desired) {
            state.pending_count += 1;
        } else {
            state.pending = Some(desired);
            state.pending_count = 1;
        }

        if state.pending_count >= self.cfg.sticky_ticks.max(1) {
            state.current = desired;
            state.pending = None;
            state.pending_count = 0;
            return Selection { timeframe: desired, desired, switched: true };
        }
        Selection { timeframe: state.current, desired, switched: false }
    }
}
