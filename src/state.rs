//! The control context: every piece of mutable loop state in one place.
//!
//! Components never hold state of their own; the loop hands them the slice of
//! the context they work on. Persistence is a JSON round-trip of this struct.

use serde::{Deserialize, Serialize};

use crate::alpha::AlphaState;
use crate::arbiter::{ArbiterMemory, TradeCounters};
use crate::breakout::BreakoutState;
use crate::config::Config;
use crate::consensus::QuoteWindow;
use crate::feed::fills::FillSnapshot;
use crate::ladder::LadderBook;
use crate::pid::ControllerState;
use crate::regime::RegimeStatus;
use crate::timeframe::TimeframeState;

pub const CONTEXT_VERSION: u32 = 1;

pub fn now_ts() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultCounters {
    pub data_unavailable: u64,
    pub low_confidence: u64,
    pub execution_failure: u64,
    pub persistence_failure: u64,
    pub malformed_snapshot: u64,
}

impl FaultCounters {
    pub fn total(&self) -> u64 {
        self.data_unavailable
            + self.low_confidence
            + self.execution_failure
            + self.persistence_failure
            + self.malformed_snapshot
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlContext {
    pub version: u32,
    pub window: QuoteWindow,
    #[serde(default)]
    pub controller: ControllerState,
    pub breakout: BreakoutState,
    pub timeframe: TimeframeState,
    pub ladder: LadderBook,
    pub counters: TradeCounters,
    pub arbiter: ArbiterMemory,
    pub alpha: AlphaState,
    pub last_fills: Option<FillSnapshot>,
    pub last_tick_ts: Option<u64>,
    pub last_status: Option<RegimeStatus>,
    pub faults: FaultCounters,
    pub ticks: u64,
}

impl ControlContext {
    pub fn new(cfg: &Config) -> Self {
        Self {
            version: CONTEXT_VERSION,
            window: QuoteWindow::new(cfg.regime.vol_window),
            controller: ControllerState::default(),
            breakout: BreakoutState::default(),
            timeframe: TimeframeState::new(cfg.timeframe.fast),
            ladder: LadderBook::default(),
            counters: TradeCounters::default(),
            arbiter: ArbiterMemory::default(),
            alpha: AlphaState::default(),
            last_fills: None,
            last_tick_ts: None,
            last_status: None,
            faults: FaultCounters::default(),
            ticks: 0,
        }
    }

    /// Accepts a persisted context only when it was written by this layout.
    pub fn restore(saved: Option<ControlContext>, cfg: &Config) -> Self {
        match saved {
            Some(ctx) if ctx.version == CONTEXT_VERSION => ctx,
            _ => ControlContext::new(cfg),
        }
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Wall seconds since the previous tick, `None` on the first tick.
    pub fn dt_secs(&self, now: u64) -> Option<f64> {
        self.last_tick_ts.map(|last| now.saturating_sub(last) as f64)
    }
}
