//! Box-channel breakout detection with persistence.
//!
//! The box is the high/low channel of the `box_len` candles preceding the one
//! being classified. A classification only becomes a signal once it has held
//! for `hysteresis_bars` consecutive closes.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::config::BreakoutConfig;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub ts: u64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
}

impl Candle {
    /// Degenerate candle for feeds that only publish a last price.
    pub fn from_price(ts: u64, price: f64) -> Self {
        Self { ts, o: price, h: price, l: price, c: price, v: 0.0 }
    }

    pub fn body_mid(&self) -> f64 {
        (self.o + self.c) / 2.0
    }

    pub fn is_sane(&self) -> bool {
        [self.o, self.h, self.l, self.c].iter().all(|x| x.is_finite() && *x > 0.0) && self.h >= self.l
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    #[default]
    None,
    Long,
    Short,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::None => "none",
            Signal::Long => "long",
            Signal::Short => "short",
        }
    }

    pub fn is_entry(&self) -> bool {
        !matches!(self, Signal::None)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoxState {
    pub top: Option<f64>,
    pub bottom: Option<f64>,
    pub range_pct: Option<f64>,
    pub last_signal: Signal,
    pub persist_count: u32,
}

impl BoxState {
    pub fn mid(&self) -> Option<f64> {
        match (self.top, self.bottom) {
            (Some(t), Some(b)) => Some((t + b) / 2.0),
            _ => None,
        }
    }
}

/// Per-timeframe detector memory, part of the control context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakoutState {
    pub window: VecDeque<Candle>,
    pub last_ts: Option<u64>,
    pub boxed: BoxState,
    /// Confirmed signal as of the last processed close.
    pub signal: Signal,
}

impl BreakoutState {
    pub fn reset(&mut self) {
        *self = BreakoutState::default();
    }
}

#[derive(Debug, Clone)]
pub struct BreakoutDetector {
    cfg: BreakoutConfig,
}

impl BreakoutDetector {
    pub fn new(cfg: BreakoutConfig) -> Self {
        Self { cfg }
    }

    /// Feeds every candle newer than the last one seen, oldest first, and
    /// returns the confirmed signal after the newest close.
    pub fn ingest(&self, state: &mut BreakoutState, candles: &[Candle]) -> Signal {
        let mut ordered: Vec<&Candle> = candles.iter().collect();
        ordered.sort_by_key(|c| c.ts);
        for candle in ordered {
            self.on_candle(state, candle);
        }
        state.signal
    }

    /// Processes one close. Returns `None` when the candle is stale or malformed.
    pub fn on_candle(&self, state: &mut BreakoutState, candle: &Candle) -> Option<Signal> {
        if let Some(last) = state.last_ts {
            if candle.ts <= last {
                return None;
            }
        }
        if !candle.is_sane() {
            return None;
        }
        state.last_ts = Some(candle.ts);

        let class = self.classify(state, candle);
        if class == state.boxed.last_signal {
            state.boxed.persist_count = state.boxed.persist_count.saturating_add(1);
        } else {
            state.boxed.last_signal = class;
            state.boxed.persist_count = 1;
        }

        let box_len = self.cfg.box_len.max(1);
        state.window.push_back(*candle);
        while state.window.len() > box_len {
            state.window.pop_front();
        }

        state.signal = if class.is_entry() && state.boxed.persist_count >= self.cfg.hysteresis_bars.max(1) {
            class
        } else {
            Signal::None
        };
        Some(state.signal)
    }

    fn classify(&self, state: &mut BreakoutState, candle: &Candle) -> Signal {
        if state.window.len() < self.cfg.box_len.max(1) {
            return Signal::None;
        }
        let top = state.window.iter().map(|c| c.h).fold(f64::MIN, f64::max);
        let bottom = state.window.iter().map(|c| c.l).fold(f64::MAX, f64::min);
        let mid = (top + bottom) / 2.0;
        if mid <= 0.0 {
            return Signal::None;
        }
        let range_pct = (top - bottom) / mid * 100.0;
        if range_pct < self.cfg.min_pct || range_pct > self.cfg.max_pct {
            return Signal::None;
        }
        state.boxed.top = Some(top);
        state.boxed.bottom = Some(bottom);
        state.boxed.range_pct = Some(range_pct);

        let body = candle.body_mid();
        if candle.c > top && (!self.cfg.strong_close || body > top) {
            Signal::Long
        } else if candle.c < bottom && (!self.cfg.strong_close || body < bottom) {
            Signal::Short
        } else {
            Signal::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(box_len: usize, hysteresis: u32) -> BreakoutConfig {
        BreakoutConfig { box_len, min_pct: 0.1, max_pct: 15.0, strong_close: true, hysteresis_bars: hysteresis }
    }

    fn bar(ts: u64, o: f64, h: f64, l: f64, c: f64) -> Candle {
        Candle { ts, o, h, l, c, v: 1.0 }
    }

    /// Box of `n` candles spanning 95..105.
    fn seeded(det: &BreakoutDetector, n: usize) -> BreakoutState {
        let mut st = BreakoutState::default();
        for i in 0..n as u64 {
            det.on_candle(&mut st, &bar(i + 1, 100.0, 105.0, 95.0, 100.0));
        }
        st
    }

    #[test]
    fn test_too_few_candles_is_none() {
        let det = BreakoutDetector::new(cfg(5, 1));
        let mut st = seeded(&det, 4);
        let s = det.on_candle(&mut st, &bar(10, 110.0, 112.0, 109.0, 111.0));
        assert_eq!(s, Some(Signal::None));
        assert!(st.boxed.top.is_none());
    }

    #[test]
    fn test_weak_close_rejected_with_strong_close() {
        let det = BreakoutDetector::new(cfg(5, 1));
        let mut st = seeded(&det, 5);
        // body midpoint is exactly 105, not strictly beyond the top
        let s = det.on_candle(&mut st, &bar(10, 104.0, 106.5, 103.5, 106.0));
        assert_eq!(s, Some(Signal::None));
        assert_eq!(st.boxed.top, Some(105.0));
        assert_eq!(st.boxed.bottom, Some(95.0));
    }

    #[test]
    fn test_weak_close_accepted_without_strong_close() {
        let det = BreakoutDetector::new(BreakoutConfig { strong_close: false, ..cfg(5, 1) });
        let mut st = seeded(&det, 5);
        let s = det.on_candle(&mut st, &bar(10, 104.0, 106.5, 103.5, 106.0));
        assert_eq!(s, Some(Signal::Long));
    }

    #[test]
    fn test_hysteresis_two_confirms_on_second_close() {
        let det = BreakoutDetector::new(cfg(5, 2));
        let mut st = seeded(&det, 5);
        let first = det.on_candle(&mut st, &bar(10, 105.5, 106.0, 105.0, 106.0));
        assert_eq!(first, Some(Signal::None));
        assert_eq!(st.boxed.last_signal, Signal::Long);
        assert_eq!(st.boxed.persist_count, 1);
        // the first breakout bar is now inside the box, so the top is 106
        let second = det.on_candle(&mut st, &bar(11, 106.5, 107.5, 106.2, 107.0));
        assert_eq!(second, Some(Signal::Long));
        assert_eq!(st.boxed.persist_count, 2);
        assert_eq!(st.signal, Signal::Long);
    }

    #[test]
    fn test_short_breakout() {
        let det = BreakoutDetector::new(cfg(5, 1));
        let mut st = seeded(&det, 5);
        let s = det.on_candle(&mut st, &bar(10, 94.0, 94.5, 92.0, 93.0));
        assert_eq!(s, Some(Signal::Short));
    }

    #[test]
    fn test_out_of_range_box_keeps_previous() {
        let det = BreakoutDetector::new(BreakoutConfig { max_pct: 11.0, ..cfg(2, 1) });
        let mut st = seeded(&det, 3);
        assert_eq!(st.boxed.top, Some(105.0));
        // a huge wick makes the next box ~40% wide, which is rejected
        det.on_candle(&mut st, &bar(10, 100.0, 150.0, 95.0, 100.0));
        let s = det.on_candle(&mut st, &bar(11, 151.0, 160.0, 151.0, 159.0));
        assert_eq!(s, Some(Signal::None));
        assert_eq!(st.boxed.top, Some(105.0));
        assert_eq!(st.boxed.bottom, Some(95.0));
    }

    #[test]
    fn test_stale_candles_skipped() {
        let det = BreakoutDetector::new(cfg(3, 1));
        let mut st = seeded(&det, 3);
        assert_eq!(det.on_candle(&mut st, &bar(3, 1.0, 1.0, 1.0, 1.0)), None);
        assert_eq!(det.on_candle(&mut st, &bar(2, 1.0, 1.0, 1.0, 1.0)), None);
        assert_eq!(st.window.len(), 3);
    }

    #[test]
    fn test_ingest_sorts_and_dedups() {
        let det = BreakoutDetector::new(cfg(3, 1));
        let mut st = BreakoutState::default();
        let candles = vec![
            bar(3, 100.0, 105.0, 95.0, 100.0),
            bar(1, 100.0, 105.0, 95.0, 100.0),
            bar(2, 100.0, 105.0, 95.0, 100.0),
        ];
        det.ingest(&mut st, &candles);
        det.ingest(&mut st, &candles);
        assert_eq!(st.window.len(), 3);
        assert_eq!(st.last_ts, Some(3));
        let sig = det.ingest(&mut st, &[bar(4, 106.0, 108.0, 105.5, 107.0)]);
        assert_eq!(sig, Signal::Long);
    }

    #[test]
    fn test_never_signals_below_hysteresis() {
        let det = BreakoutDetector::new(cfg(4, 3));
        let mut st = seeded(&det, 4);
        let mut px = 106.0;
        for ts in 10..12 {
            let s = det.on_candle(&mut st, &bar(ts, px, px + 1.0, px - 0.5, px + 0.8));
            assert_eq!(s, Some(Signal::None));
            px += 2.0;
        }
    }

    #[test]
    fn test_reset_clears() {
        let det = BreakoutDetector::new(cfg(3, 1));
        let mut st = seeded(&det, 3);
        st.reset();
        assert!(st.window.is_empty());
        assert!(st.last_ts.is_none());
        assert_eq!(st.boxed, BoxState::default());
    }

    #[test]
    fn test_from_price() {
        let c = Candle::from_price(7, 42.0);
        assert_eq!((c.o, c.h, c.l, c.c, c.v), (42.0, 42.0, 42.0, 42.0, 0.0));
        assert!(c.is_sane());
    }
}
