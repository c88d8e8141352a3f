//! Tick reports, position ledger, and the persisted control context.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::breakout::Signal;
use crate::feed::fills::FillSnapshot;
use crate::grid::GridPlan;
use crate::ladder::{ClosedPosition, StreakStats, SyntheticPosition};
use crate::regime::RegimeStatus;
use crate::state::ControlContext;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakoutReport {
    pub top: Option<f64>,
    pub bottom: Option<f64>,
    pub range_pct: Option<f64>,
    pub last_signal: Signal,
    pub persist_count: u32,
    pub signal: Signal,
}

/// One row per tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub ts: u64,
    pub status: RegimeStatus,
    pub reason: String,
    pub mid: Option<f64>,
    pub short_vol_pct: f64,
    pub divergence_bps: f64,
    pub alive_count: usize,
    pub leverage: f64,
    pub pid_output: f64,
    pub grid: Option<GridPlan>,
    pub breakout: BreakoutReport,
    pub alpha: f64,
    pub timeframe: String,
    pub decision: String,
    pub decision_reason: String,
    /// Orders the venue accepted for this tick's decision, if one was placed.
    pub accepted: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub trades_today: u32,
    pub wins: u64,
    pub losses: u64,
    pub streak: StreakStats,
    pub multiplier: f64,
    pub realized_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub ts: u64,
    pub open: Vec<SyntheticPosition>,
    pub closed: Vec<ClosedPosition>,
    pub stats: LedgerStats,
    pub last_fills: Option<FillSnapshot>,
}

pub trait StateSink: Send + Sync {
    fn write_report(&self, report: &ReportRecord) -> Result<()>;
    fn write_ledger(&self, ledger: &LedgerRecord) -> Result<()>;
    fn save_context(&self, ctx: &ControlContext) -> Result<()>;
    /// A missing or unreadable context both come back as `None`.
    fn load_context(&self) -> Option<ControlContext>;
}

// =============================================================================
// SQLite
// =============================================================================

/// Report and ledger rows are append-only; with a retention set, each insert
/// drops rows older than the newest `retention` in that table.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    retention: usize,
}

impl SqliteStore {
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("opening sqlite at {}", path))?;
        let store = Self { conn: Mutex::new(conn), retention: 0 };
        store.init()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let store = Self { conn: Mutex::new(Connection::open_in_memory()?), retention: 0 };
        store.init()?;
        Ok(store)
    }

    /// Rows kept per append-only table; 0 keeps everything.
    pub fn with_retention(mut self, rows: usize) -> Self {
        self.retention = rows;
        self
    }

    fn prune(&self, conn: &Connection, table: &str) -> Result<()> {
        if self.retention == 0 {
            return Ok(());
        }
        conn.execute(
            &format!("DELETE FROM {table} WHERE rowid <= (SELECT MAX(rowid) FROM {table}) - ?1"),
            params![self.retention as i64],
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("sqlite connection poisoned"))
    }

    fn init(&self) -> Result<()> {
        self.conn()?.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS reports (
                ts INTEGER NOT NULL,
                status TEXT NOT NULL,
                decision TEXT NOT NULL,
                body TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS ledger (
                ts INTEGER NOT NULL,
                body TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS context (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                saved_at INTEGER NOT NULL,
                body TEXT NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn report_count(&self) -> Result<u64> {
        let n: i64 = self.conn()?.query_row("SELECT COUNT(*) FROM reports", [], |r| r.get(0))?;
        Ok(n as u64)
    }

    pub fn ledger_count(&self) -> Result<u64> {
        let n: i64 = self.conn()?.query_row("SELECT COUNT(*) FROM ledger", [], |r| r.get(0))?;
        Ok(n as u64)
    }

    pub fn latest_ledger(&self) -> Result<Option<LedgerRecord>> {
        let body: Option<String> = self
            .conn()?
            .query_row("SELECT body FROM ledger ORDER BY rowid DESC LIMIT 1", [], |r| r.get(0))
            .optional()?;
        match body {
            Some(b) => Ok(Some(serde_json::from_str(&b)?)),
            None => Ok(None),
        }
    }
}

impl StateSink for SqliteStore {
    fn write_report(&self, report: &ReportRecord) -> Result<()> {
        let body = serde_json::to_string(report)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO reports (ts, status, decision, body) VALUES (?1, ?2, ?3, ?4)",
            params![report.ts as i64, report.status.as_str(), report.decision, body],
        )?;
        self.prune(&conn, "reports")
    }

    fn write_ledger(&self, ledger: &LedgerRecord) -> Result<()> {
        let body = serde_json::to_string(ledger)?;
        let conn = self.conn()?;
        conn.execute("INSERT INTO ledger (ts, body) VALUES (?1, ?2)", params![ledger.ts as i64, body])?;
        self.prune(&conn, "ledger")
    }

    fn save_context(&self, ctx: &ControlContext) -> Result<()> {
        let body = ctx.to_json()?;
        let saved_at = ctx.last_tick_ts.unwrap_or(0) as i64;
        self.conn()?.execute(
            "INSERT INTO context (id, saved_at, body) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET saved_at = excluded.saved_at, body = excluded.body",
            params![saved_at, body],
        )?;
        Ok(())
    }

    fn load_context(&self) -> Option<ControlContext> {
        let conn = self.conn().ok()?;
        let body: String = conn
            .query_row("SELECT body FROM context WHERE id = 1", [], |r| r.get(0))
            .optional()
            .ok()??;
        ControlContext::from_json(&body).ok()
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Default)]
struct MemoryInner {
    reports: Vec<ReportRecord>,
    ledgers: Vec<LedgerRecord>,
    context: Option<String>,
    failing: bool,
    retention: usize,
}

fn keep_tail<T>(rows: &mut Vec<T>, keep: usize) {
    if keep > 0 && rows.len() > keep {
        rows.drain(..rows.len() - keep);
    }
}

/// Clones share the same storage.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows kept per record kind; 0 keeps everything.
    pub fn with_retention(self, rows: usize) -> Self {
        if let Ok(mut inner) = self.inner.lock() {
            inner.retention = rows;
        }
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
        let guard = self.inner.lock().map_err(|_| anyhow!("memory store poisoned"))?;
        if guard.failing {
            return Err(anyhow!("memory store unavailable"));
        }
        Ok(guard)
    }

    /// While set, every write fails.
    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failing = failing;
        }
    }

    pub fn reports(&self) -> Vec<ReportRecord> {
        self.inner.lock().map(|i| i.reports.clone()).unwrap_or_default()
    }

    pub fn ledgers(&self) -> Vec<LedgerRecord> {
        self.inner.lock().map(|i| i.ledgers.clone()).unwrap_or_default()
    }
}

impl StateSink for MemoryStore {
    fn write_report(&self, report: &ReportRecord) -> Result<()> {
        let mut inner = self.lock()?;
        let keep = inner.retention;
        inner.reports.push(report.clone());
        keep_tail(&mut inner.reports, keep);
        Ok(())
    }

    fn write_ledger(&self, ledger: &LedgerRecord) -> Result<()> {
        let mut inner = self.lock()?;
        let keep = inner.retention;
        inner.ledgers.push(ledger.clone());
        keep_tail(&mut inner.ledgers, keep);
        Ok(())
    }

    fn save_context(&self, ctx: &ControlContext) -> Result<()> {
        let body = ctx.to_json()?;
        self.lock()?.context = Some(body);
        Ok(())
    }

    fn load_context(&self) -> Option<ControlContext> {
        let inner = self.inner.lock().ok()?;
        ControlContext::from_json(inner.context.as_deref()?).ok()
    }
}
