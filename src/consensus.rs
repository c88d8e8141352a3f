//! Multi-source quote consensus: mean mid, dispersion and short-horizon vol.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

/// One tick's merged view of every responding source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConsensusQuote {
    pub mid: Option<f64>,
    pub divergence_bps: f64,
    pub short_vol_pct: f64,
    pub alive_count: usize,
    pub ts: u64,
}

/// Rolling window of consensus mids. Owned by the control context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteWindow {
    mids: VecDeque<f64>,
    capacity: usize,
}

impl QuoteWindow {
    pub fn new(capacity: usize) -> Self {
        Self { mids: VecDeque::with_capacity(capacity.min(4096)), capacity: capacity.max(1) }
    }

    pub fn len(&self) -> usize {
        self.mids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mids.is_empty()
    }

    pub fn mids(&self) -> impl Iterator<Item = &f64> {
        self.mids.iter()
    }

    pub fn push(&mut self, mid: f64) {
        self.mids.push_back(mid);
        while self.mids.len() > self.capacity {
            self.mids.pop_front();
        }
    }

    /// Population std-dev of tick-to-tick relative returns, in percent.
    pub fn short_vol_pct(&self) -> f64 {
        if self.mids.len() < 3 {
            return 0.0;
        }
        let returns: Vec<f64> = self
            .mids
            .iter()
            .zip(self.mids.iter().skip(1))
            .filter(|(p0, _)| **p0 > 0.0)
            .map(|(p0, p1)| p1 / p0 - 1.0)
            .collect();
        if returns.is_empty() {
            return 0.0;
        }
        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let var = returns.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / n;
        var.sqrt() * 100.0
    }

    /// Simple mean of the last `window` mids, if that many exist.
    pub fn sma(&self, window: usize) -> Option<f64> {
        if window == 0 || self.mids.len() < window {
            return None;
        }
        let sum: f64 = self.mids.iter().rev().take(window).sum();
        Some(sum / window as f64)
    }
}

fn usable(px: f64) -> bool {
    px.is_finite() && px > 0.0
}

/// Merges the tick's source prices and advances the mid window.
///
/// A source that did not answer maps to `None`. Zero answers is a valid
/// "no data" result: mid stays undefined and the window is left untouched.
pub fn aggregate(quotes: &BTreeMap<String, Option<f64>>, window: &mut QuoteWindow, ts: u64) -> ConsensusQuote {
    let prices: Vec<f64> = quotes.values().filter_map(|q| *q).filter(|px| usable(*px)).collect();
    let alive_count = prices.len();

    if alive_count == 0 {
        return ConsensusQuote {
            mid: None,
            divergence_bps: 0.0,
            short_vol_pct: window.short_vol_pct(),
            alive_count: 0,
            ts,
        };
    }

    let mid = prices.iter().sum::<f64>() / alive_count as f64;
    let divergence_bps = if alive_count >= 2 {
        let hi = prices.iter().cloned().fold(f64::MIN, f64::max);
        let lo = prices.iter().cloned().fold(f64::MAX, f64::min);
        ((hi - lo) / mid * 10_000.0).max(0.0)
    } else {
        0.0
    };

    window.push(mid);

    ConsensusQuote {
        mid: Some(mid),
        divergence_bps,
        short_vol_pct: window.short_vol_pct(),
        alive_count,
        ts,
    }
}
