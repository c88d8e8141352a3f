//! Order quantity sizing.
//!
//! All sizing functions return a quantity in base asset units, already rounded
//! down to the venue step. A result of zero means "too small to place".

use crate::config::SizingConfig;

// =============================================================================
// Primitives
// =============================================================================

/// Fixed notional value per order
pub fn fixed_notional(notional: f64, price: f64) -> f64 {
    if price <= 0.0 || !price.is_finite() {
        return 0.0;
    }
    notional / price
}

/// Apply minimum trade size (exchange minimums)
pub fn apply_min_size(requested: f64, min_size: f64) -> f64 {
    if requested.abs() < min_size {
        0.0
    } else {
        requested
    }
}

/// Round down to exchange lot size
pub fn round_to_lot(qty: f64, lot_size: f64) -> f64 {
    if lot_size <= 0.0 {
        return qty;
    }
    // absorbs representation error, 0.03 / 0.001 is 29.999...
    ((qty / lot_size) + 1e-9).floor() * lot_size
}

/// Rounded to the step, zero when below it.
pub fn to_step(qty: f64, step: f64) -> f64 {
    if !qty.is_finite() || qty <= 0.0 {
        return 0.0;
    }
    apply_min_size(round_to_lot(qty, step), step)
}

// =============================================================================
// Controller sizing
// =============================================================================

#[derive(Debug, Clone)]
pub struct Sizer {
    cfg: SizingConfig,
}

impl Sizer {
    pub fn new(cfg: SizingConfig) -> Self {
        Self { cfg }
    }

    pub fn step_size(&self) -> f64 {
        self.cfg.step_size
    }

    /// Notional budget per side: a slice of equity, capped by the configured
    /// per-side notional. Missing or bogus equity falls back to the config.
    pub fn notional_cap(&self, equity: Option<f64>) -> f64 {
        let equity = equity
            .filter(|e| e.is_finite() && *e > 0.0)
            .unwrap_or(self.cfg.equity_fallback);
        (equity * self.cfg.max_portfolio_pct / 100.0).min(self.cfg.notional_per_side).max(0.0)
    }

    pub fn grid_qty_per_level(&self, cap: f64, levels: u32, mid: f64, leverage: f64) -> f64 {
        if levels == 0 {
            return 0.0;
        }
        let per_level = fixed_notional(cap / levels as f64, mid) * leverage.max(0.01);
        to_step(per_level, self.cfg.step_size)
    }

    pub fn bracket_qty(&self, mid: f64, leverage: f64, ladder_mult: f64) -> f64 {
        let qty = fixed_notional(self.cfg.bracket_notional * leverage * ladder_mult, mid);
        to_step(qty, self.cfg.step_size)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_to_lot() {
        assert!((round_to_lot(1.234, 0.01) - 1.23).abs() < 1e-12);
        assert!((round_to_lot(1.239, 0.01) - 1.23).abs() < 1e-12);
        assert!((round_to_lot(0.03, 0.001) - 0.03).abs() < 1e-12);
    }

    #[test]
    fn test_to_step_below_step_is_zero() {
        assert_eq!(to_step(0.0004, 0.001), 0.0);
        assert_eq!(to_step(-1.0, 0.001), 0.0);
        assert_eq!(to_step(f64::NAN, 0.001), 0.0);
    }

    #[test]
    fn test_notional_cap() {
        let s = Sizer::new(SizingConfig::default());
        // 3% of 1000 = 30 < 200
        assert!((s.notional_cap(Some(1_000.0)) - 30.0).abs() < 1e-9);
        // 3% of 1e6 capped at 200
        assert_eq!(s.notional_cap(Some(1_000_000.0)), 200.0);
        // fallback 10k -> 300 capped at 200
        assert_eq!(s.notional_cap(None), 200.0);
        assert_eq!(s.notional_cap(Some(f64::NAN)), 200.0);
    }

    #[test]
    fn test_grid_qty_per_level() {
        let s = Sizer::new(SizingConfig::default());
        // 200 / 20 / 100 * 2 = 0.2
        assert!((s.grid_qty_per_level(200.0, 20, 100.0, 2.0) - 0.2).abs() < 1e-9);
        // tiny leverage floors at 0.01: 0.1 * 0.01 = 0.001
        assert!((s.grid_qty_per_level(200.0, 20, 100.0, 0.0) - 0.001).abs() < 1e-12);
        assert_eq!(s.grid_qty_per_level(1.0, 20, 65_000.0, 1.0), 0.0);
    }

    #[test]
    fn test_bracket_qty() {
        let s = Sizer::new(SizingConfig::default());
        // 50 * 2 * 1.5 / 100 = 1.5
        assert!((s.bracket_qty(100.0, 2.0, 1.5) - 1.5).abs() < 1e-9);
        assert_eq!(s.bracket_qty(0.0, 2.0, 1.0), 0.0);
    }
}
