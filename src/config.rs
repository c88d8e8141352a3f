//! Runtime configuration, read from the environment.
//!
//! Every section has a `Default` so tests can build a config without touching
//! the process environment.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::timeframe::Timeframe;

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeConfig {
    pub quorum: usize,
    pub max_divergence_bps: f64,
    pub safe_mode: bool,
    pub vol_warn_pct: f64,
    pub vol_panic_pct: f64,
    /// Capacity of the rolling consensus-mid window used for short vol.
    pub vol_window: usize,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            quorum: 2,
            max_divergence_bps: 25.0,
            safe_mode: true,
            vol_warn_pct: 0.6,
            vol_panic_pct: 1.2,
            vol_window: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidConfig {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub target_vol_pct: f64,
    pub out_min: f64,
    pub out_max: f64,
    pub integrator_limit: f64,
    pub lev_min: f64,
    pub lev_max: f64,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            kp: 0.8,
            ki: 0.05,
            kd: 0.1,
            target_vol_pct: 0.35,
            out_min: 0.0,
            out_max: 1.0,
            integrator_limit: 5.0,
            lev_min: 1.0,
            lev_max: 3.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    pub k: f64,
    pub min_band_pct: f64,
    pub widen_warn: f64,
    pub widen_panic: f64,
    pub levels: u32,
    /// Mid move (percent) since the last full grid that triggers a replace.
    pub replace_pct: f64,
    pub trend_filter: bool,
    pub trend_sma_window: usize,
    pub levels_bull: u32,
    pub levels_bear: u32,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            k: 2.0,
            min_band_pct: 1.0,
            widen_warn: 1.5,
            widen_panic: 2.5,
            levels: 20,
            replace_pct: 0.5,
            trend_filter: false,
            trend_sma_window: 20,
            levels_bull: 30,
            levels_bear: 12,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakoutConfig {
    pub box_len: usize,
    pub min_pct: f64,
    pub max_pct: f64,
    pub strong_close: bool,
    pub hysteresis_bars: u32,
}

impl Default for BreakoutConfig {
    fn default() -> Self {
        Self {
            box_len: 20,
            min_pct: 0.3,
            max_pct: 8.0,
            strong_close: true,
            hysteresis_bars: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeframeConfig {
    pub fast: Timeframe,
    pub slow: Timeframe,
    pub vol_low: f64,
    pub vol_high: f64,
    pub warmup_frac: f64,
    pub sticky_ticks: u32,
    pub daily_target: u32,
}

impl Default for TimeframeConfig {
    fn default() -> Self {
        Self {
            fast: Timeframe::M1,
            slow: Timeframe::M5,
            vol_low: 0.2,
            vol_high: 0.8,
            warmup_frac: 0.5,
            sticky_ticks: 3,
            daily_target: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LadderConfig {
    pub win_step: f64,
    pub max_mult: f64,
    pub loss_penalty_mult: f64,
    pub penalty_after_losses: u32,
    /// Closed records retained; older ones are dropped.
    pub history: usize,
}

impl Default for LadderConfig {
    fn default() -> Self {
        Self {
            win_step: 0.25,
            max_mult: 2.0,
            loss_penalty_mult: 0.5,
            penalty_after_losses: 2,
            history: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryKind {
    Market,
    Limit,
    Ioc,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Market => "MARKET",
            EntryKind::Limit => "LIMIT",
            EntryKind::Ioc => "IOC",
        }
    }
}

impl FromStr for EntryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "MARKET" => Ok(EntryKind::Market),
            "LIMIT" => Ok(EntryKind::Limit),
            "IOC" => Ok(EntryKind::Ioc),
            other => Err(format!("unknown entry kind {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbiterConfig {
    pub max_trades_per_day: u32,
    pub cooldown_secs: u64,
    pub bracket_mode: bool,
    pub bracket_stop_pct: f64,
    pub bracket_target_pct: f64,
    pub entry_kind: EntryKind,
    pub reduce_only: bool,
    pub micro_levels: u32,
    pub micro_band_pct: f64,
    pub warn_blocks_entries: bool,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            max_trades_per_day: 12,
            cooldown_secs: 300,
            bracket_mode: true,
            bracket_stop_pct: 0.6,
            bracket_target_pct: 1.2,
            entry_kind: EntryKind::Ioc,
            reduce_only: false,
            micro_levels: 4,
            micro_band_pct: 0.3,
            warn_blocks_entries: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    pub notional_per_side: f64,
    pub bracket_notional: f64,
    pub max_portfolio_pct: f64,
    pub equity_fallback: f64,
    pub step_size: f64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            notional_per_side: 200.0,
            bracket_notional: 50.0,
            max_portfolio_pct: 3.0,
            equity_fallback: 10_000.0,
            step_size: 0.001,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    pub tick_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    /// Zero disables the bound.
    pub max_runtime_secs: u64,
    pub shutdown_grace_secs: u64,
    pub source_timeout_ms: u64,
    pub circuit_threshold: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            tick_secs: 30,
            backoff_base_secs: 30,
            backoff_max_secs: 600,
            max_runtime_secs: 6 * 3600,
            shutdown_grace_secs: 5,
            source_timeout_ms: 3_000,
            circuit_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionKind {
    Paper,
    Pionex,
}

impl ExecutionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionKind::Paper => "paper",
            ExecutionKind::Pionex => "pionex",
        }
    }
}

#[derive(Debug, Clone)]
pub struct VenueConfig {
    pub base_asset: String,
    pub quote_asset: String,
    pub execution: ExecutionKind,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub pionex_base: String,
    pub binance_fapi_base: String,
    pub bybit_base: String,
    pub okx_base: String,
    pub fills_ws_url: Option<String>,
    pub sqlite_path: String,
    /// Report and ledger rows kept per table; 0 keeps everything.
    pub store_retention: usize,
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            base_asset: "SOL".to_string(),
            quote_asset: "USDT".to_string(),
            execution: ExecutionKind::Paper,
            api_key: None,
            api_secret: None,
            pionex_base: "https://api.pionex.com".to_string(),
            binance_fapi_base: "https://fapi.binance.com".to_string(),
            bybit_base: "https://api.bybit.com".to_string(),
            okx_base: "https://www.okx.com".to_string(),
            fills_ws_url: None,
            sqlite_path: "./gridpilot.sqlite".to_string(),
            store_retention: 100_000,
        }
    }
}

impl VenueConfig {
    /// `SOLUSDT`
    pub fn symbol(&self) -> String {
        format!("{}{}", self.base_asset, self.quote_asset)
    }

    /// `SOL_USDT`, the form the execution venue expects.
    pub fn venue_symbol(&self) -> String {
        format!("{}_{}", self.base_asset, self.quote_asset)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub regime: RegimeConfig,
    pub pid: PidConfig,
    pub grid: GridConfig,
    pub breakout: BreakoutConfig,
    pub timeframe: TimeframeConfig,
    pub ladder: LadderConfig,
    pub arbiter: ArbiterConfig,
    pub sizing: SizingConfig,
    pub looping: LoopConfig,
    pub venue: VenueConfig,
}

impl Config {
    pub fn from_env() -> Self {
        let d = Config::default();
        Self {
            regime: RegimeConfig {
                quorum: env_parse("QUORUM", d.regime.quorum),
                max_divergence_bps: env_parse("MAX_DIVERGENCE_BPS", d.regime.max_divergence_bps),
                safe_mode: env_flag("SAFE_MODE", d.regime.safe_mode),
                vol_warn_pct: env_parse("VOL_WARN_PCT", d.regime.vol_warn_pct),
                vol_panic_pct: env_parse("VOL_PANIC_PCT", d.regime.vol_panic_pct),
                vol_window: env_parse("VOL_WINDOW", d.regime.vol_window),
            },
            pid: PidConfig {
                kp: env_parse("PID_KP", d.pid.kp),
                ki: env_parse("PID_KI", d.pid.ki),
                kd: env_parse("PID_KD", d.pid.kd),
                target_vol_pct: env_parse("PID_TARGET_VOL_PCT", d.pid.target_vol_pct),
                out_min: env_parse("PID_OUT_MIN", d.pid.out_min),
                out_max: env_parse("PID_OUT_MAX", d.pid.out_max),
                integrator_limit: env_parse("PID_INTEGRATOR_LIMIT", d.pid.integrator_limit),
                lev_min: env_parse("LEV_MIN", d.pid.lev_min),
                lev_max: env_parse("LEV_MAX", d.pid.lev_max),
            },
            grid: GridConfig {
                k: env_parse("GRID_K", d.grid.k),
                min_band_pct: env_parse("GRID_MIN_BAND_PCT", d.grid.min_band_pct),
                widen_warn: env_parse("WIDEN_WARN", d.grid.widen_warn),
                widen_panic: env_parse("WIDEN_PANIC", d.grid.widen_panic),
                levels: env_parse("GRID_LEVELS", d.grid.levels),
                replace_pct: env_parse("GRID_REPLACE_PCT", d.grid.replace_pct),
                trend_filter: env_flag("TREND_FILTER", d.grid.trend_filter),
                trend_sma_window: env_parse("TREND_SMA_WINDOW", d.grid.trend_sma_window),
                levels_bull: env_parse("LEVELS_BULL", d.grid.levels_bull),
                levels_bear: env_parse("LEVELS_BEAR", d.grid.levels_bear),
            },
            breakout: BreakoutConfig {
                box_len: env_parse("BOX_LEN", d.breakout.box_len),
                min_pct: env_parse("BOX_MIN_PCT", d.breakout.min_pct),
                max_pct: env_parse("BOX_MAX_PCT", d.breakout.max_pct),
                strong_close: env_flag("STRONG_CLOSE", d.breakout.strong_close),
                hysteresis_bars: env_parse("HYSTERESIS_BARS", d.breakout.hysteresis_bars),
            },
            timeframe: TimeframeConfig {
                fast: env_parse("TF_FAST", d.timeframe.fast),
                slow: env_parse("TF_SLOW", d.timeframe.slow),
                vol_low: env_parse("TF_VOL_LOW", d.timeframe.vol_low),
                vol_high: env_parse("TF_VOL_HIGH", d.timeframe.vol_high),
                warmup_frac: env_parse("TF_WARMUP_FRAC", d.timeframe.warmup_frac),
                sticky_ticks: env_parse("TF_STICKY_TICKS", d.timeframe.sticky_ticks),
                daily_target: env_parse("DAILY_TRADE_TARGET", d.timeframe.daily_target),
            },
            ladder: LadderConfig {
                win_step: env_parse("LADDER_WIN_STEP", d.ladder.win_step),
                max_mult: env_parse("LADDER_MAX_MULT", d.ladder.max_mult),
                loss_penalty_mult: env_parse("LADDER_LOSS_MULT", d.ladder.loss_penalty_mult),
                penalty_after_losses: env_parse("LADDER_PENALTY_AFTER", d.ladder.penalty_after_losses),
                history: env_parse("LADDER_HISTORY", d.ladder.history),
            },
            arbiter: ArbiterConfig {
                max_trades_per_day: env_parse("MAX_TRADES_DAY", d.arbiter.max_trades_per_day),
                cooldown_secs: env_parse("COOLDOWN_SECS", d.arbiter.cooldown_secs),
                bracket_mode: env_flag("BRACKET_MODE", d.arbiter.bracket_mode),
                bracket_stop_pct: env_parse("BRACKET_STOP_PCT", d.arbiter.bracket_stop_pct),
                bracket_target_pct: env_parse("BRACKET_TARGET_PCT", d.arbiter.bracket_target_pct),
                entry_kind: env_parse("BRACKET_ENTRY", d.arbiter.entry_kind),
                reduce_only: env_flag("REDUCE_ONLY", d.arbiter.reduce_only),
                micro_levels: env_parse("MICRO_LEVELS", d.arbiter.micro_levels),
                micro_band_pct: env_parse("MICRO_BAND_PCT", d.arbiter.micro_band_pct),
                warn_blocks_entries: env_flag("WARN_BLOCKS_ENTRIES", d.arbiter.warn_blocks_entries),
            },
            sizing: SizingConfig {
                notional_per_side: env_parse("NOTIONAL_PER_SIDE", d.sizing.notional_per_side),
                bracket_notional: env_parse("BRACKET_NOTIONAL", d.sizing.bracket_notional),
                max_portfolio_pct: env_parse("MAX_PORTFOLIO_PCT", d.sizing.max_portfolio_pct),
                equity_fallback: env_parse("EQUITY_FALLBACK", d.sizing.equity_fallback),
                step_size: env_parse("STEP_SIZE", d.sizing.step_size),
            },
            looping: LoopConfig {
                tick_secs: env_parse("LOOP_SECS", d.looping.tick_secs),
                backoff_base_secs: env_parse("BACKOFF_BASE_SECS", d.looping.backoff_base_secs),
                backoff_max_secs: env_parse("BACKOFF_MAX_SECS", d.looping.backoff_max_secs),
                max_runtime_secs: env_parse("MAX_RUNTIME_SECS", d.looping.max_runtime_secs),
                shutdown_grace_secs: env_parse("SHUTDOWN_GRACE_SECS", d.looping.shutdown_grace_secs),
                source_timeout_ms: env_parse("SOURCE_TIMEOUT_MS", d.looping.source_timeout_ms),
                circuit_threshold: env_parse("CIRCUIT_THRESHOLD", d.looping.circuit_threshold),
            },
            venue: VenueConfig {
                base_asset: env_string("BASE_ASSET", &d.venue.base_asset),
                quote_asset: env_string("QUOTE_ASSET", &d.venue.quote_asset),
                execution: match std::env::var("EXECUTION").as_deref() {
                    Ok("pionex") => ExecutionKind::Pionex,
                    _ => ExecutionKind::Paper,
                },
                api_key: std::env::var("API_KEY").ok(),
                api_secret: std::env::var("API_SECRET").ok(),
                pionex_base: env_string("PIONEX_BASE", &d.venue.pionex_base),
                binance_fapi_base: env_string("BINANCE_FAPI_BASE", &d.venue.binance_fapi_base),
                bybit_base: env_string("BYBIT_BASE", &d.venue.bybit_base),
                okx_base: env_string("OKX_BASE", &d.venue.okx_base),
                fills_ws_url: std::env::var("FILLS_WS_URL").ok().filter(|v| !v.is_empty()),
                sqlite_path: env_string("SQLITE_PATH", &d.venue.sqlite_path),
                store_retention: env_parse("STORE_RETENTION", d.venue.store_retention),
            },
        }
    }

    /// Returns every problem found; an empty list means the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let floats = [
            ("MAX_DIVERGENCE_BPS", self.regime.max_divergence_bps),
            ("VOL_WARN_PCT", self.regime.vol_warn_pct),
            ("VOL_PANIC_PCT", self.regime.vol_panic_pct),
            ("PID_KP", self.pid.kp),
            ("PID_KI", self.pid.ki),
            ("PID_KD", self.pid.kd),
            ("PID_TARGET_VOL_PCT", self.pid.target_vol_pct),
            ("PID_OUT_MIN", self.pid.out_min),
            ("PID_OUT_MAX", self.pid.out_max),
            ("PID_INTEGRATOR_LIMIT", self.pid.integrator_limit),
            ("LEV_MIN", self.pid.lev_min),
            ("LEV_MAX", self.pid.lev_max),
            ("GRID_K", self.grid.k),
            ("GRID_MIN_BAND_PCT", self.grid.min_band_pct),
            ("WIDEN_WARN", self.grid.widen_warn),
            ("WIDEN_PANIC", self.grid.widen_panic),
            ("GRID_REPLACE_PCT", self.grid.replace_pct),
            ("BOX_MIN_PCT", self.breakout.min_pct),
            ("BOX_MAX_PCT", self.breakout.max_pct),
            ("TF_VOL_LOW", self.timeframe.vol_low),
            ("TF_VOL_HIGH", self.timeframe.vol_high),
            ("TF_WARMUP_FRAC", self.timeframe.warmup_frac),
            ("LADDER_WIN_STEP", self.ladder.win_step),
            ("LADDER_MAX_MULT", self.ladder.max_mult),
            ("LADDER_LOSS_MULT", self.ladder.loss_penalty_mult),
            ("BRACKET_STOP_PCT", self.arbiter.bracket_stop_pct),
            ("BRACKET_TARGET_PCT", self.arbiter.bracket_target_pct),
            ("MICRO_BAND_PCT", self.arbiter.micro_band_pct),
            ("NOTIONAL_PER_SIDE", self.sizing.notional_per_side),
            ("BRACKET_NOTIONAL", self.sizing.bracket_notional),
            ("MAX_PORTFOLIO_PCT", self.sizing.max_portfolio_pct),
            ("EQUITY_FALLBACK", self.sizing.equity_fallback),
            ("STEP_SIZE", self.sizing.step_size),
        ];
        for (name, value) in floats {
            if !value.is_finite() {
                problems.push(format!("{} must be a finite number", name));
            }
        }
        if self.regime.quorum == 0 {
            problems.push("QUORUM must be at least 1".to_string());
        }
        if self.regime.vol_window < 3 {
            problems.push("VOL_WINDOW must be at least 3".to_string());
        }
        if self.regime.vol_warn_pct > self.regime.vol_panic_pct {
            problems.push("VOL_WARN_PCT must not exceed VOL_PANIC_PCT".to_string());
        }
        if self.pid.out_min >= self.pid.out_max {
            problems.push("PID_OUT_MIN must be below PID_OUT_MAX".to_string());
        }
        if self.pid.lev_min > self.pid.lev_max {
            problems.push("LEV_MIN must not exceed LEV_MAX".to_string());
        }
        if self.pid.integrator_limit < 0.0 {
            problems.push("PID_INTEGRATOR_LIMIT must be non-negative".to_string());
        }
        if self.grid.min_band_pct <= 0.0 {
            problems.push("GRID_MIN_BAND_PCT must be positive".to_string());
        }
        if self.grid.min_band_pct >= 100.0 {
            problems.push("GRID_MIN_BAND_PCT must be below 100".to_string());
        }
        if self.breakout.box_len == 0 {
            problems.push("BOX_LEN must be at least 1".to_string());
        }
        if self.breakout.min_pct >= self.breakout.max_pct {
            problems.push("BOX_MIN_PCT must be below BOX_MAX_PCT".to_string());
        }
        if self.breakout.hysteresis_bars == 0 {
            problems.push("HYSTERESIS_BARS must be at least 1".to_string());
        }
        if self.timeframe.vol_low > self.timeframe.vol_high {
            problems.push("TF_VOL_LOW must not exceed TF_VOL_HIGH".to_string());
        }
        if self.ladder.loss_penalty_mult <= 0.0 || self.ladder.loss_penalty_mult > 1.0 {
            problems.push("LADDER_LOSS_MULT must be in (0, 1]".to_string());
        }
        if self.ladder.history < self.ladder.penalty_after_losses as usize {
            problems.push("LADDER_HISTORY must be at least LADDER_PENALTY_AFTER".to_string());
        }
        if self.ladder.max_mult < 1.0 {
            problems.push("LADDER_MAX_MULT must be at least 1".to_string());
        }
        if self.arbiter.bracket_stop_pct <= 0.0 || self.arbiter.bracket_target_pct <= 0.0 {
            problems.push("BRACKET_STOP_PCT and BRACKET_TARGET_PCT must be positive".to_string());
        }
        if self.arbiter.micro_band_pct <= 0.0 || self.arbiter.micro_band_pct >= 100.0 {
            problems.push("MICRO_BAND_PCT must be in (0, 100)".to_string());
        }
        if self.sizing.step_size <= 0.0 {
            problems.push("STEP_SIZE must be positive".to_string());
        }
        if self.looping.tick_secs == 0 {
            problems.push("LOOP_SECS must be at least 1".to_string());
        }
        if self.looping.backoff_base_secs > self.looping.backoff_max_secs {
            problems.push("BACKOFF_BASE_SECS must not exceed BACKOFF_MAX_SECS".to_string());
        }
        if self.venue.execution == ExecutionKind::Pionex
            && (self.venue.api_key.is_none() || self.venue.api_secret.is_none())
        {
            problems.push("EXECUTION=pionex requires API_KEY and API_SECRET".to_string());
        }
        problems
    }
}
