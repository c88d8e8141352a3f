//! The control loop: one tick runs consensus, regime, PID, grid, alpha, ladder,
//! timeframe, breakout and arbitration in that order, then places at most one
//! decision and persists the result.

use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::alpha::{AlphaParams, AlphaSignal};
use crate::arbiter::{ArbiterInput, Arbitration, ExecutionArbiter, ExecutionDecision, Placement};
use crate::breakout::BreakoutDetector;
use crate::config::Config;
use crate::consensus::aggregate;
use crate::exchange::{BracketOrder, ExecutionSink};
use crate::feed::fills::FillReader;
use crate::feed::{fetch_quotes, CandleSource, PriceSource};
use crate::grid::{GridPlan, GridPlanner};
use crate::ladder::RiskLadder;
use crate::logging::{self, log, obj, v_str, Domain, Level, ProfileScope};
use crate::pid::LeverageController;
use crate::regime::{classify, RegimeStatus};
use crate::reliability::CircuitBreaker;
use crate::sizing::Sizer;
use crate::state::{now_ts, ControlContext, FaultCounters, CONTEXT_VERSION};
use crate::storage::{BreakoutReport, LedgerRecord, LedgerStats, ReportRecord, StateSink};
use crate::timeframe::TimeframeSelector;

const LEDGER_CLOSED_TAIL: usize = 20;

// =============================================================================
// Faults
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    DataUnavailable,
    LowConfidence,
    ExecutionFailure,
    PersistenceFailure,
    MalformedExternalSnapshot,
}

impl Fault {
    pub fn as_str(&self) -> &'static str {
        match self {
            Fault::DataUnavailable => "data_unavailable",
            Fault::LowConfidence => "low_confidence",
            Fault::ExecutionFailure => "execution_failure",
            Fault::PersistenceFailure => "persistence_failure",
            Fault::MalformedExternalSnapshot => "malformed_snapshot",
        }
    }

    pub fn record(self, counters: &mut FaultCounters) {
        let slot = match self {
            Fault::DataUnavailable => &mut counters.data_unavailable,
            Fault::LowConfidence => &mut counters.low_confidence,
            Fault::ExecutionFailure => &mut counters.execution_failure,
            Fault::PersistenceFailure => &mut counters.persistence_failure,
            Fault::MalformedExternalSnapshot => &mut counters.malformed_snapshot,
        };
        *slot = slot.saturating_add(1);
    }
}

// =============================================================================
// Backoff
// =============================================================================

/// Sleep schedule between ticks. Doubles per consecutive halting tick up to
/// the ceiling; any non-halting tick returns to the plain interval.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_secs: u64,
    max_secs: u64,
    streak: u32,
}

impl Backoff {
    pub fn new(base_secs: u64, max_secs: u64) -> Self {
        Self { base_secs, max_secs: max_secs.max(base_secs), streak: 0 }
    }

    pub fn after_tick(&mut self, halting: bool, tick_secs: u64) -> u64 {
        if !halting {
            self.streak = 0;
            return tick_secs;
        }
        let factor = 2u64.saturating_pow(self.streak);
        self.streak = self.streak.saturating_add(1);
        self.base_secs.saturating_mul(factor).min(self.max_secs)
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }
}

// =============================================================================
// Controller
// =============================================================================

/// External collaborators the loop talks to.
pub struct Collaborators {
    pub sources: Vec<Box<dyn PriceSource>>,
    pub candles: Box<dyn CandleSource>,
    pub sink: Box<dyn ExecutionSink>,
    pub store: Box<dyn StateSink>,
    pub fills: Option<FillReader>,
}

/// What one tick did, for callers that drive ticks themselves.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickOutcome {
    pub ts: u64,
    pub status: RegimeStatus,
    pub mid: Option<f64>,
    pub decision: String,
    pub reason: String,
    /// `Some` when the decision reached the venue and was accepted.
    pub accepted: Option<usize>,
    pub halting: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub duration_secs: u64,
    pub ticks: u64,
    pub stop_reason: String,
    pub wins: u64,
    pub losses: u64,
    pub realized_pct: f64,
    pub faults: FaultCounters,
}

pub struct Controller {
    cfg: Config,
    ctx: ControlContext,
    pid: LeverageController,
    grid: GridPlanner,
    breakout: BreakoutDetector,
    timeframe: TimeframeSelector,
    ladder: RiskLadder,
    arbiter: ExecutionArbiter,
    alpha: AlphaSignal,
    circuit: CircuitBreaker,
    backoff: Backoff,
    /// Set until the first tick of this process has run.
    first_tick: bool,
    io: Collaborators,
}

impl Controller {
    /// Builds the components and restores any compatible saved context.
    pub fn new(cfg: Config, io: Collaborators) -> Self {
        let saved = io.store.load_context();
        let restored = saved.as_ref().map_or(false, |c| c.version == CONTEXT_VERSION);
        let ctx = ControlContext::restore(saved, &cfg);
        log(
            Level::Info,
            Domain::Persist,
            "context_loaded",
            obj(&[("restored", json!(restored)), ("ticks", json!(ctx.ticks))]),
        );
        Self {
            pid: LeverageController::new(cfg.pid.clone()),
            grid: GridPlanner::new(cfg.grid.clone()),
            breakout: BreakoutDetector::new(cfg.breakout.clone()),
            timeframe: TimeframeSelector::new(cfg.timeframe.clone()),
            ladder: RiskLadder::new(cfg.ladder.clone()),
            arbiter: ExecutionArbiter::new(cfg.arbiter.clone(), cfg.grid.replace_pct, Sizer::new(cfg.sizing.clone())),
            alpha: AlphaSignal::new(AlphaParams::default()),
            circuit: CircuitBreaker::new(cfg.looping.circuit_threshold),
            backoff: Backoff::new(cfg.looping.backoff_base_secs, cfg.looping.backoff_max_secs),
            first_tick: true,
            ctx,
            cfg,
            io,
        }
    }

    pub fn context(&self) -> &ControlContext {
        &self.ctx
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    fn fault(&mut self, fault: Fault, detail: &str) {
        fault.record(&mut self.ctx.faults);
        log(
            Level::Warn,
            Domain::System,
            "fault",
            obj(&[("kind", v_str(fault.as_str())), ("detail", v_str(detail))]),
        );
    }

    /// Runs one full tick at wall time `now` (seconds).
    pub async fn tick(&mut self, now: u64) -> TickOutcome {
        let _profile = ProfileScope::with_context("tick", &[("tick", json!(self.ctx.ticks + 1))]);
        self.circuit.on_tick();
        if self.ctx.counters.roll_day(now) {
            log(Level::Info, Domain::Risk, "day_rollover", obj(&[("day", json!(now / 86_400))]));
        }

        self.drain_fills();

        // consensus and regime
        let quotes = fetch_quotes(&self.io.sources, Duration::from_millis(self.cfg.looping.source_timeout_ms)).await;
        let q = aggregate(&quotes, &mut self.ctx.window, now);
        let listed: Vec<(String, Option<f64>)> = quotes.into_iter().collect();
        logging::log_quotes(&listed, q.mid, q.divergence_bps, q.short_vol_pct, q.alive_count);

        let regime = classify(&q, &self.cfg.regime);
        logging::log_regime(regime.status.as_str(), &regime.reason, self.ctx.last_status.map(|s| s.as_str()));
        match regime.status {
            RegimeStatus::Suspend => self.fault(Fault::DataUnavailable, &regime.reason),
            RegimeStatus::Warn | RegimeStatus::Panic => self.fault(Fault::LowConfidence, &regime.reason),
            RegimeStatus::Ok => {}
        }
        let status = regime.status;
        let vol = q.short_vol_pct;

        // leverage
        let dt = self.pid_dt(now);
        let error = self.pid.error_for(vol);
        let pid = self.pid.step(&mut self.ctx.controller, error, dt);
        logging::log_pid(pid.error, pid.output, pid.leverage, self.ctx.controller.integral, dt);

        // grid, alpha, ladder
        let plan: Option<GridPlan> = q.mid.map(|mid| self.grid.plan_with_trend(mid, vol, status, &self.ctx.window));
        if let Some(p) = plan {
            logging::log_grid(p.lower, p.upper, p.levels, p.band_pct());
        }
        let alpha = match q.mid {
            Some(mid) => self.alpha.update(&mut self.ctx.alpha, mid),
            None => self.ctx.alpha.last_alpha,
        };
        if let Some(mid) = q.mid {
            for c in self.ladder.mark(&mut self.ctx.ladder, mid, now) {
                logging::log_position_closed(
                    c.position.id,
                    c.position.side.as_str(),
                    if c.result == crate::ladder::TradeResult::Win { "win" } else { "loss" },
                    c.exit,
                    c.return_pct,
                );
            }
        }

        // cadence and breakout
        let previous_tf = self.ctx.timeframe.current;
        let selection = self.timeframe.select(&mut self.ctx.timeframe, status, vol, self.ctx.counters.trades_today);
        if selection.switched {
            self.ctx.breakout.reset();
            logging::log_timeframe_switch(previous_tf.as_str(), selection.timeframe.as_str());
        }
        let limit = self.cfg.breakout.box_len + self.cfg.breakout.hysteresis_bars as usize + 2;
        let signal = match self.io.candles.fetch(selection.timeframe, limit).await {
            Ok(candles) => self.breakout.ingest(&mut self.ctx.breakout, &candles),
            Err(e) => {
                self.fault(Fault::DataUnavailable, &format!("candles: {}", e));
                self.ctx.breakout.signal
            }
        };
        let boxed = &self.ctx.breakout.boxed;
        logging::log_breakout(
            selection.timeframe.as_str(),
            boxed.top,
            boxed.bottom,
            boxed.last_signal.as_str(),
            boxed.persist_count,
            signal.as_str(),
        );

        // arbitration
        let ladder_mult = self.ladder.multiplier(&self.ctx.ladder);
        let equity = self.io.sink.get_equity().await;
        let input = ArbiterInput {
            status,
            mid: q.mid,
            signal,
            box_top: self.ctx.breakout.boxed.top,
            box_bottom: self.ctx.breakout.boxed.bottom,
            grid: plan.unwrap_or(GridPlan { lower: 0.0, upper: 0.0, levels: 2 }),
            leverage: pid.leverage,
            ladder_mult,
            equity,
            now,
        };
        let Arbitration { decision, reason } = self.arbiter.decide(&input, &self.ctx.counters, &self.ctx.arbiter);
        logging::log_decision(decision.kind(), reason, serde_json::to_value(&decision).unwrap_or_default());

        let mut reason = reason.to_string();
        let accepted = match (q.mid, &decision) {
            (_, ExecutionDecision::None) | (None, _) => None,
            (Some(mid), _) => {
                if self.circuit.allow() {
                    self.place(&decision, mid, status, now).await
                } else {
                    reason = "circuit open".to_string();
                    log(
                        Level::Warn,
                        Domain::Exec,
                        "placement_skipped",
                        obj(&[("kind", v_str(decision.kind())), ("circuit", v_str(self.circuit.state.as_str()))]),
                    );
                    None
                }
            }
        };

        self.ctx.last_tick_ts = Some(now);
        self.ctx.last_status = Some(status);
        self.ctx.ticks += 1;

        let report = ReportRecord {
            ts: now,
            status,
            reason: regime.reason.clone(),
            mid: q.mid,
            short_vol_pct: vol,
            divergence_bps: q.divergence_bps,
            alive_count: q.alive_count,
            leverage: pid.leverage,
            pid_output: pid.output,
            grid: plan,
            breakout: BreakoutReport {
                top: self.ctx.breakout.boxed.top,
                bottom: self.ctx.breakout.boxed.bottom,
                range_pct: self.ctx.breakout.boxed.range_pct,
                last_signal: self.ctx.breakout.boxed.last_signal,
                persist_count: self.ctx.breakout.boxed.persist_count,
                signal,
            },
            alpha,
            timeframe: selection.timeframe.as_str().to_string(),
            decision: decision.kind().to_string(),
            decision_reason: reason.clone(),
            accepted,
        };
        self.persist(&report, ladder_mult, now);

        TickOutcome {
            ts: now,
            status,
            mid: q.mid,
            decision: decision.kind().to_string(),
            reason,
            accepted,
            halting: status.is_halting(),
        }
    }

    /// Seconds the integrator advances this tick. A process's first tick and
    /// a controller without a sample advance one tick interval; later gaps are
    /// bounded by the backoff ceiling.
    fn pid_dt(&mut self, now: u64) -> f64 {
        let tick = self.cfg.looping.tick_secs as f64;
        let first = std::mem::replace(&mut self.first_tick, false);
        if first || self.ctx.controller.last_error.is_none() {
            return tick;
        }
        let ceiling = self.cfg.looping.backoff_max_secs.max(self.cfg.looping.tick_secs) as f64;
        self.ctx.dt_secs(now).map_or(tick, |dt| dt.min(ceiling))
    }

    fn drain_fills(&mut self) {
        let drained = match self.io.fills.as_mut() {
            Some(reader) => reader.drain(),
            None => return,
        };
        for _ in 0..drained.malformed {
            self.fault(Fault::MalformedExternalSnapshot, "fills message");
        }
        if let Some(snapshot) = drained.latest {
            logging::log_fill_snapshot(snapshot.fills.len(), snapshot.ts);
            self.ctx.last_fills = Some(snapshot);
        }
    }

    /// Sends the decision to the venue and commits it on acceptance.
    async fn place(&mut self, decision: &ExecutionDecision, mid: f64, status: RegimeStatus, now: u64) -> Option<usize> {
        let result = match decision {
            ExecutionDecision::None => return None,
            ExecutionDecision::FullGrid { .. } | ExecutionDecision::MicroGrid { .. } => match decision.as_grid() {
                Some((plan, qty)) => self.io.sink.replace_standing_orders(&plan, qty, mid).await,
                None => return None,
            },
            ExecutionDecision::Bracket { side, qty, entry, stop, target, entry_kind } => {
                let order = BracketOrder {
                    side: *side,
                    qty: *qty,
                    entry: *entry,
                    stop: *stop,
                    target: *target,
                    entry_kind: *entry_kind,
                    reduce_only: self.cfg.arbiter.reduce_only,
                };
                self.io.sink.place_bracket(&order).await.map(|_| 1)
            }
        };

        match result {
            Ok(accepted) => {
                self.circuit.record_success();
                self.arbiter.commit(
                    decision,
                    Placement { status, mid, now },
                    &mut self.ctx.counters,
                    &mut self.ctx.arbiter,
                    &self.ladder,
                    &mut self.ctx.ladder,
                );
                let qty = match decision {
                    ExecutionDecision::FullGrid { qty, .. }
                    | ExecutionDecision::MicroGrid { qty, .. }
                    | ExecutionDecision::Bracket { qty, .. } => *qty,
                    ExecutionDecision::None => 0.0,
                };
                logging::log_order_placed(decision.kind(), accepted, qty);
                Some(accepted)
            }
            Err(e) => {
                self.circuit.record_failure();
                Fault::ExecutionFailure.record(&mut self.ctx.faults);
                logging::log_exec_failure(decision.kind(), &format!("{:#}", e), self.circuit.failures);
                None
            }
        }
    }

    fn persist(&mut self, report: &ReportRecord, multiplier: f64, now: u64) {
        let book = &self.ctx.ladder;
        let closed_tail = book.closed.iter().skip(book.closed.len().saturating_sub(LEDGER_CLOSED_TAIL)).cloned().collect();
        let ledger = LedgerRecord {
            ts: now,
            open: book.open.clone(),
            closed: closed_tail,
            stats: LedgerStats {
                trades_today: self.ctx.counters.trades_today,
                wins: book.wins,
                losses: book.losses,
                streak: book.streak(),
                multiplier,
                realized_pct: book.realized_pct,
            },
            last_fills: self.ctx.last_fills.clone(),
        };

        let mut failures: Vec<(&str, String)> = Vec::new();
        if let Err(e) = self.io.store.write_report(report) {
            failures.push(("write_report", e.to_string()));
        }
        if let Err(e) = self.io.store.write_ledger(&ledger) {
            failures.push(("write_ledger", e.to_string()));
        }
        if let Err(e) = self.io.store.save_context(&self.ctx) {
            failures.push(("save_context", e.to_string()));
        }
        for (op, err) in failures {
            Fault::PersistenceFailure.record(&mut self.ctx.faults);
            logging::log_persist_failure(op, &err);
        }
    }

    /// Ticks until shutdown or the runtime bound. A tick interrupted by
    /// shutdown gets the grace period to finish, then is abandoned.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> RunSummary {
        let started = Instant::now();
        let max_runtime = match self.cfg.looping.max_runtime_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let grace = Duration::from_secs(self.cfg.looping.shutdown_grace_secs);
        let session_start_ticks = self.ctx.ticks;

        log(
            Level::Info,
            Domain::System,
            "loop_start",
            obj(&[
                ("tick_secs", json!(self.cfg.looping.tick_secs)),
                ("max_runtime_secs", json!(self.cfg.looping.max_runtime_secs)),
                ("sink", v_str(self.io.sink.name())),
            ]),
        );

        let stop_reason = loop {
            if *shutdown.borrow() {
                break "shutdown";
            }
            if max_runtime.map_or(false, |m| started.elapsed() >= m) {
                break "max runtime";
            }

            let outcome = {
                let tick = self.tick(now_ts());
                tokio::pin!(tick);
                tokio::select! {
                    out = &mut tick => Some(out),
                    _ = shutdown_requested(&mut shutdown) => {
                        log(Level::Warn, Domain::System, "shutdown_during_tick", obj(&[("grace_secs", json!(grace.as_secs()))]));
                        tokio::time::timeout(grace, &mut tick).await.ok()
                    }
                }
            };
            let outcome = match outcome {
                Some(o) => o,
                None => {
                    log(Level::Warn, Domain::System, "tick_abandoned", obj(&[]));
                    break "shutdown";
                }
            };

            let mut delay = Duration::from_secs(self.backoff.after_tick(outcome.halting, self.cfg.looping.tick_secs));
            if outcome.halting {
                log(
                    Level::Warn,
                    Domain::System,
                    "backoff",
                    obj(&[("status", v_str(outcome.status.as_str())), ("sleep_secs", json!(delay.as_secs()))]),
                );
            }
            if let Some(m) = max_runtime {
                delay = delay.min(m.saturating_sub(started.elapsed()));
            }
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown_requested(&mut shutdown) => break "shutdown",
            }
        };

        let summary = RunSummary {
            duration_secs: started.elapsed().as_secs(),
            ticks: self.ctx.ticks - session_start_ticks,
            stop_reason: stop_reason.to_string(),
            wins: self.ctx.ladder.wins,
            losses: self.ctx.ladder.losses,
            realized_pct: self.ctx.ladder.realized_pct,
            faults: self.ctx.faults,
        };
        logging::log_session_summary(
            summary.duration_secs,
            summary.ticks,
            summary.wins,
            summary.losses,
            summary.realized_pct,
            summary.faults.total(),
        );
        summary
    }
}

/// Resolves once the flag is set. A dropped sender never resolves.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Flips the shutdown flag on Ctrl-C or SIGTERM.
pub fn spawn_signal_listener(tx: watch::Sender<bool>) -> Result<()> {
    #[cfg(unix)]
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::spawn(async move {
        #[cfg(unix)]
        let signal_name = tokio::select! {
            _ = tokio::signal::ctrl_c() => "ctrl_c",
            _ = term.recv() => "sigterm",
        };
        #[cfg(not(unix))]
        let signal_name = {
            let _ = tokio::signal::ctrl_c().await;
            "ctrl_c"
        };
        log(Level::Info, Domain::System, "shutdown_signal", obj(&[("signal", v_str(signal_name))]));
        let _ = tx.send(true);
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_ceiling_and_resets() {
        let mut b = Backoff::new(30, 200);
        assert_eq!(b.after_tick(true, 10), 30);
        assert_eq!(b.after_tick(true, 10), 60);
        assert_eq!(b.after_tick(true, 10), 120);
        assert_eq!(b.after_tick(true, 10), 200);
        assert_eq!(b.after_tick(true, 10), 200);
        assert_eq!(b.after_tick(false, 10), 10);
        assert_eq!(b.streak(), 0);
        assert_eq!(b.after_tick(true, 10), 30);
    }

    #[test]
    fn test_backoff_survives_long_streaks() {
        let mut b = Backoff::new(1, 600);
        for _ in 0..100 {
            b.after_tick(true, 1);
        }
        assert_eq!(b.after_tick(true, 1), 600);
    }

    #[test]
    fn test_fault_record() {
        let mut c = FaultCounters::default();
        Fault::ExecutionFailure.record(&mut c);
        Fault::ExecutionFailure.record(&mut c);
        Fault::MalformedExternalSnapshot.record(&mut c);
        assert_eq!(c.execution_failure, 2);
        assert_eq!(c.malformed_snapshot, 1);
        assert_eq!(c.total(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_requested_resolves_on_flag() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_millis(100), shutdown_requested(&mut rx)).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_requested_pending_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let r = tokio::time::timeout(Duration::from_millis(50), shutdown_requested(&mut rx)).await;
        assert!(r.is_err());
    }
}
