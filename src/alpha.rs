//! Reporting-only alpha indicator over the consensus mid history.
//!
//! Blends a channel-position signal with a mean-reversion bias toward the
//! local median. Nothing downstream gates on it.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

const HISTORY_CAP: usize = 512;

#[derive(Debug, Clone)]
pub struct AlphaParams {
    pub w_breakout: f64,
    pub w_grid_bias: f64,
    pub lookback: usize,
    pub breakout_thr_bps: f64,
}

impl Default for AlphaParams {
    fn default() -> Self {
        Self { w_breakout: 0.6, w_grid_bias: 0.4, lookback: 60, breakout_thr_bps: 4.0 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlphaState {
    pub history: VecDeque<f64>,
    pub last_alpha: f64,
}

fn tail(series: &VecDeque<f64>, n: usize) -> impl Iterator<Item = &f64> {
    series.iter().skip(series.len().saturating_sub(n))
}

fn median(mut xs: Vec<f64>) -> f64 {
    xs.sort_by(|a, b| a.total_cmp(b));
    let n = xs.len();
    if n == 0 {
        0.0
    } else if n % 2 == 1 {
        xs[n / 2]
    } else {
        (xs[n / 2 - 1] + xs[n / 2]) / 2.0
    }
}

#[derive(Debug, Clone, Default)]
pub struct AlphaSignal {
    params: AlphaParams,
}

impl AlphaSignal {
    pub fn new(params: AlphaParams) -> Self {
        Self { params }
    }

    /// Appends a mid and returns the refreshed alpha in [-1, 1].
    pub fn update(&self, state: &mut AlphaState, mid: f64) -> f64 {
        if !mid.is_finite() || mid <= 0.0 {
            return state.last_alpha;
        }
        state.history.push_back(mid);
        while state.history.len() > HISTORY_CAP {
            state.history.pop_front();
        }
        let raw = self.params.w_breakout * self.channel(&state.history)
            + self.params.w_grid_bias * self.grid_bias(&state.history);
        state.last_alpha = raw.clamp(-1.0, 1.0);
        state.last_alpha
    }

    fn channel(&self, series: &VecDeque<f64>) -> f64 {
        let lb = self.params.lookback.max(10);
        if series.len() < lb {
            return 0.0;
        }
        let p = match series.back() {
            Some(p) => *p,
            None => return 0.0,
        };
        let (hi, lo) = tail(series, lb).fold((f64::MIN, f64::MAX), |(hi, lo), x| (hi.max(*x), lo.min(*x)));
        let mid = (hi + lo) / 2.0;
        let span = (hi - lo).max(1e-9);

        let bias = (p - mid) / span;
        let edge = ((p - hi) / hi.max(1e-9)).abs().max(((p - lo) / lo.max(1e-9)).abs());
        let mut sig = bias * (1.0 + edge);
        if ((p - mid) / mid.max(1e-9)).abs() <= self.params.breakout_thr_bps / 1e4 {
            sig *= 0.5;
        }
        sig.clamp(-1.0, 1.0)
    }

    fn grid_bias(&self, series: &VecDeque<f64>) -> f64 {
        if series.len() < 20 {
            return 0.0;
        }
        let n = if series.len() >= 40 { 40 } else { 20 };
        let p = match series.back() {
            Some(p) => *p,
            None => return 0.0,
        };
        let window: Vec<f64> = tail(series, n).copied().collect();
        let hi = window.iter().cloned().fold(f64::MIN, f64::max);
        let lo = window.iter().cloned().fold(f64::MAX, f64::min);
        let span = (hi - lo).max(1e-9);
        ((median(window) - p) / span).clamp(-1.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_history_is_zero() {
        let a = AlphaSignal::default();
        let mut st = AlphaState::default();
        for i in 0..10 {
            assert_eq!(a.update(&mut st, 100.0 + i as f64), 0.0);
        }
    }

    #[test]
    fn test_alpha_bounded() {
        let a = AlphaSignal::default();
        let mut st = AlphaState::default();
        for i in 0..400 {
            let px = 100.0 + ((i * 37) % 23) as f64 - if i > 300 { 50.0 } else { 0.0 };
            let v = a.update(&mut st, px);
            assert!((-1.0..=1.0).contains(&v));
        }
        assert!(st.history.len() <= HISTORY_CAP);
    }

    #[test]
    fn test_rally_reads_positive_channel() {
        let a = AlphaSignal::new(AlphaParams { w_breakout: 1.0, w_grid_bias: 0.0, ..Default::default() });
        let mut st = AlphaState::default();
        let mut v = 0.0;
        for i in 0..80 {
            v = a.update(&mut st, 100.0 + i as f64 * 0.1);
        }
        assert!(v > 0.0);
    }

    #[test]
    fn test_bad_mid_keeps_last() {
        let a = AlphaSignal::default();
        let mut st = AlphaState { last_alpha: 0.3, ..Default::default() };
        assert_eq!(a.update(&mut st, f64::NAN), 0.3);
        assert!(st.history.is_empty());
    }

    #[test]
    fn test_median() {
        assert_eq!(median(vec![3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(vec![4.0, 1.0, 2.0, 3.0]), 2.5);
    }
}
