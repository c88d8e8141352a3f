//! PID leverage controller.

use serde::{Deserialize, Serialize};

use crate::config::PidConfig;

/// Integrator and previous error. Persisted with the rest of the context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerState {
    pub integral: f64,
    pub last_error: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PidOutput {
    pub error: f64,
    pub output: f64,
    pub leverage: f64,
}

#[derive(Debug, Clone)]
pub struct LeverageController {
    cfg: PidConfig,
}

impl LeverageController {
    pub fn new(cfg: PidConfig) -> Self {
        Self { cfg }
    }

    /// Error fed to the loop: positive when the market is calmer than target.
    pub fn error_for(&self, observed_vol_pct: f64) -> f64 {
        self.cfg.target_vol_pct - observed_vol_pct
    }

    pub fn step(&self, state: &mut ControllerState, error: f64, dt_secs: f64) -> PidOutput {
        let dt = if dt_secs.is_finite() { dt_secs.max(1e-6) } else { 1e-6 };
        if !error.is_finite() {
            let output = self.clamp_output(self.cfg.ki * state.integral);
            return PidOutput { error: 0.0, output, leverage: self.leverage(output) };
        }

        let limit = self.cfg.integrator_limit.abs();
        state.integral = (state.integral + error * dt).clamp(-limit, limit);
        let derivative = match state.last_error {
            Some(prev) => (error - prev) / dt,
            None => 0.0,
        };
        state.last_error = Some(error);

        let raw = self.cfg.kp * error + self.cfg.ki * state.integral + self.cfg.kd * derivative;
        let output = self.clamp_output(raw);
        PidOutput { error, output, leverage: self.leverage(output) }
    }

    fn clamp_output(&self, raw: f64) -> f64 {
        if raw.is_nan() {
            return self.cfg.out_min;
        }
        raw.clamp(self.cfg.out_min, self.cfg.out_max)
    }

    /// Linear map of a clamped output onto [lev_min, lev_max].
    pub fn leverage(&self, output: f64) -> f64 {
        let span = self.cfg.out_max - self.cfg.out_min;
        let frac = if span > 0.0 { (output - self.cfg.out_min) / span } else { 0.0 };
        let lev = self.cfg.lev_min + frac.clamp(0.0, 1.0) * (self.cfg.lev_max - self.cfg.lev_min);
        lev.clamp(self.cfg.lev_min, self.cfg.lev_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> LeverageController {
        LeverageController::new(PidConfig::default())
    }

    #[test]
    fn test_first_sample_has_no_derivative() {
        let c = LeverageController::new(PidConfig { kp: 0.0, ki: 0.0, kd: 1.0, ..Default::default() });
        let mut st = ControllerState::default();
        let out = c.step(&mut st, 0.5, 1.0);
        assert_eq!(out.output, 0.0);
        assert_eq!(st.last_error, Some(0.5));
    }

    #[test]
    fn test_integrator_is_clamped() {
        let c = controller();
        let mut st = ControllerState::default();
        for _ in 0..1000 {
            c.step(&mut st, 10.0, 30.0);
        }
        assert_eq!(st.integral, PidConfig::default().integrator_limit);
        for _ in 0..1000 {
            c.step(&mut st, -10.0, 30.0);
        }
        assert_eq!(st.integral, -PidConfig::default().integrator_limit);
    }

    #[test]
    fn test_output_and_leverage_bounded() {
        let cfg = PidConfig::default();
        let c = LeverageController::new(cfg.clone());
        let mut st = ControllerState::default();
        let errors = [1e9, -1e9, 0.0, 3.3, -7.1, 1e-12, 42.0, -0.4, 1e6, -1e6];
        for (i, e) in errors.iter().cycle().take(200).enumerate() {
            let dt = 0.001 + (i % 7) as f64;
            let out = c.step(&mut st, *e, dt);
            assert!(out.output >= cfg.out_min && out.output <= cfg.out_max);
            assert!(out.leverage >= cfg.lev_min && out.leverage <= cfg.lev_max);
        }
    }

    #[test]
    fn test_leverage_mapping_endpoints() {
        let c = controller();
        assert_eq!(c.leverage(0.0), 1.0);
        assert_eq!(c.leverage(1.0), 3.0);
        assert!((c.leverage(0.5) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_non_finite_error_leaves_state() {
        let c = controller();
        let mut st = ControllerState { integral: 1.0, last_error: Some(0.2) };
        let out = c.step(&mut st, f64::NAN, 1.0);
        assert_eq!(st.integral, 1.0);
        assert_eq!(st.last_error, Some(0.2));
        assert!(out.output.is_finite());
    }

    #[test]
    fn test_calm_market_raises_leverage() {
        let c = controller();
        let mut calm = ControllerState::default();
        let mut wild = ControllerState::default();
        let lo = c.step(&mut wild, c.error_for(2.0), 30.0);
        let hi = c.step(&mut calm, c.error_for(0.0), 30.0);
        assert!(hi.leverage > lo.leverage);
    }
}
