//! Operating regime classification from the tick's consensus quote.
//!
//! Stateless: every tick is reclassified from scratch. The check order is
//! significant, a tick with no quotes must never read as a volatility event.

use serde::{Deserialize, Serialize};

use crate::config::RegimeConfig;
use crate::consensus::ConsensusQuote;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RegimeStatus {
    Ok,
    Warn,
    Panic,
    Suspend,
}

impl RegimeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegimeStatus::Ok => "OK",
            RegimeStatus::Warn => "WARN",
            RegimeStatus::Panic => "PANIC",
            RegimeStatus::Suspend => "SUSPEND",
        }
    }

    /// PANIC and SUSPEND forbid new orders and trigger loop backoff.
    pub fn is_halting(&self) -> bool {
        matches!(self, RegimeStatus::Panic | RegimeStatus::Suspend)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Regime {
    pub status: RegimeStatus,
    pub reason: String,
}

impl Regime {
    fn new(status: RegimeStatus, reason: impl Into<String>) -> Self {
        Self { status, reason: reason.into() }
    }
}

pub fn classify(q: &ConsensusQuote, cfg: &RegimeConfig) -> Regime {
    if q.alive_count == 0 {
        return Regime::new(RegimeStatus::Suspend, "no datafeeds");
    }
    if q.alive_count < cfg.quorum {
        return Regime::new(RegimeStatus::Warn, "low quorum");
    }
    if q.divergence_bps > cfg.max_divergence_bps {
        return Regime::new(RegimeStatus::Warn, format!("divergence {:.1}bps", q.divergence_bps));
    }
    if cfg.safe_mode {
        if q.short_vol_pct >= cfg.vol_panic_pct {
            return Regime::new(RegimeStatus::Panic, format!("vol {:.2}% >= panic", q.short_vol_pct));
        }
        if q.short_vol_pct >= cfg.vol_warn_pct {
            return Regime::new(RegimeStatus::Warn, format!("vol {:.2}% >= warn", q.short_vol_pct));
        }
    }
    Regime::new(RegimeStatus::Ok, "ok")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(alive: usize, div: f64, vol: f64) -> ConsensusQuote {
        ConsensusQuote {
            mid: if alive > 0 { Some(100.0) } else { None },
            divergence_bps: div,
            short_vol_pct: vol,
            alive_count: alive,
            ts: 0,
        }
    }

    #[test]
    fn test_zero_alive_always_suspends() {
        let cfg = RegimeConfig::default();
        for (div, vol) in [(0.0, 0.0), (1e6, 0.0), (0.0, 99.0), (1e6, 99.0)] {
            let r = classify(&quote(0, div, vol), &cfg);
            assert_eq!(r.status, RegimeStatus::Suspend);
            assert_eq!(r.reason, "no datafeeds");
        }
    }

    #[test]
    fn test_low_quorum_warns_regardless_of_vol() {
        let cfg = RegimeConfig { quorum: 2, ..Default::default() };
        for vol in [0.0, 0.7, 50.0] {
            let r = classify(&quote(1, 0.0, vol), &cfg);
            assert_eq!(r.status, RegimeStatus::Warn);
            assert_eq!(r.reason, "low quorum");
        }
    }

    #[test]
    fn test_divergence_at_least_warn() {
        let cfg = RegimeConfig::default();
        let r = classify(&quote(3, cfg.max_divergence_bps + 0.1, 0.0), &cfg);
        assert_eq!(r.status, RegimeStatus::Warn);
        assert!(r.reason.starts_with("divergence"));
        // divergence is checked before vol, so high vol still reads as WARN
        let r = classify(&quote(3, cfg.max_divergence_bps + 0.1, 10.0), &cfg);
        assert_eq!(r.status, RegimeStatus::Warn);
    }

    #[test]
    fn test_vol_thresholds() {
        let cfg = RegimeConfig::default();
        assert_eq!(classify(&quote(3, 0.0, cfg.vol_panic_pct), &cfg).status, RegimeStatus::Panic);
        assert_eq!(classify(&quote(3, 0.0, cfg.vol_warn_pct), &cfg).status, RegimeStatus::Warn);
        assert_eq!(classify(&quote(3, 0.0, cfg.vol_warn_pct - 0.01), &cfg).status, RegimeStatus::Ok);
    }

    #[test]
    fn test_safe_mode_off_ignores_vol() {
        let cfg = RegimeConfig { safe_mode: false, ..Default::default() };
        assert_eq!(classify(&quote(3, 0.0, 50.0), &cfg).status, RegimeStatus::Ok);
    }

    #[test]
    fn test_halting_statuses() {
        assert!(RegimeStatus::Panic.is_halting());
        assert!(RegimeStatus::Suspend.is_halting());
        assert!(!RegimeStatus::Warn.is_halting());
        assert!(!RegimeStatus::Ok.is_halting());
    }
}
