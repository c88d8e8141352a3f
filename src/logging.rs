//! Structured JSON-lines logging for the control loop.
//!
//! Every record carries a run id and a sequence number. `LOG_LEVEL` sets the
//! floor, `LOG_DOMAINS` (comma list or `all`) picks domains, and each process
//! writes `events.jsonl` and `trace.jsonl` under `LOG_DIR/<run_id>/`.

use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

// =============================================================================
// Levels and domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Fatal => "FATAL",
        }
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Level::Trace),
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            "fatal" => Ok(Level::Fatal),
            other => Err(format!("unknown log level {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Market,
    Regime,
    Control,
    Signal,
    Risk,
    Exec,
    Fill,
    Persist,
    System,
    Profile,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Market => "market",
            Domain::Regime => "regime",
            Domain::Control => "control",
            Domain::Signal => "signal",
            Domain::Risk => "risk",
            Domain::Exec => "exec",
            Domain::Fill => "fill",
            Domain::Persist => "persist",
            Domain::System => "system",
            Domain::Profile => "profile",
        }
    }
}

/// Which records get written. Read from the environment once per process.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    min: Level,
    /// `None` passes every domain.
    domains: Option<Vec<String>>,
}

impl Filter {
    /// Unknown levels fall back to info; an empty or `all` domain list passes
    /// everything.
    pub fn parse(level: Option<&str>, domains: Option<&str>) -> Self {
        let min = level.and_then(|l| l.parse().ok()).unwrap_or(Level::Info);
        let domains = domains
            .map(str::trim)
            .filter(|d| !d.is_empty() && *d != "all")
            .map(|d| d.split(',').map(|x| x.trim().to_string()).filter(|x| !x.is_empty()).collect());
        Self { min, domains }
    }

    pub fn allows(&self, level: Level, domain: Domain) -> bool {
        level >= self.min
            && self.domains.as_ref().map_or(true, |list| list.iter().any(|d| d == domain.as_str()))
    }
}

fn filter() -> &'static Filter {
    static FILTER: OnceLock<Filter> = OnceLock::new();
    FILTER.get_or_init(|| {
        let level = std::env::var("LOG_LEVEL").ok();
        let domains = std::env::var("LOG_DOMAINS").ok();
        Filter::parse(level.as_deref(), domains.as_deref())
    })
}

// =============================================================================
// Run outputs
// =============================================================================

type Writer = Mutex<BufWriter<File>>;

/// Per-process log files under `LOG_DIR/<run_id>/`. Either file may be
/// missing when the directory is not writable; stdout always gets the line.
struct RunOutputs {
    run_id: String,
    events: Option<Writer>,
    trace: Option<Writer>,
}

impl RunOutputs {
    fn open() -> Self {
        let run_id = std::env::var("RUN_ID").unwrap_or_else(|_| format!("gp-{}-{}", ts_epoch_ms(), std::process::id()));
        let dir = Path::new(&std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".to_string())).join(&run_id);
        if let Err(err) = create_dir_all(&dir) {
            eprintln!("[log] cannot create {}: {}", dir.display(), err);
            return Self { run_id, events: None, trace: None };
        }
        let manifest = json!({
            "run_id": run_id,
            "started": ts_now(),
            "pid": std::process::id(),
            "version": env!("CARGO_PKG_VERSION"),
        });
        if let Err(err) = std::fs::write(dir.join("manifest.json"), manifest.to_string()) {
            eprintln!("[log] cannot write manifest: {}", err);
        }
        Self { events: writer(&dir.join("events.jsonl")), trace: writer(&dir.join("trace.jsonl")), run_id }
    }

    fn write(&self, level: Level, line: &str) {
        let target = if level <= Level::Debug { &self.trace } else { &self.events };
        if let Some(Ok(mut w)) = target.as_ref().map(|m| m.lock()) {
            let _ = writeln!(w, "{}", line);
            let _ = w.flush();
        }
        println!("{}", line);
    }
}

fn writer(path: &Path) -> Option<Writer> {
    File::create(path)
        .map_err(|err| eprintln!("[log] cannot create {}: {}", path.display(), err))
        .ok()
        .map(|f| Mutex::new(BufWriter::new(f)))
}

fn outputs() -> &'static RunOutputs {
    static OUTPUTS: OnceLock<RunOutputs> = OnceLock::new();
    OUTPUTS.get_or_init(RunOutputs::open)
}

static SEQ: AtomicU64 = AtomicU64::new(0);

fn next_seq() -> u64 {
    SEQ.fetch_add(1, Ordering::Relaxed)
}

// =============================================================================
// Records
// =============================================================================

/// Field names whose values never reach a log line.
const REDACTED: [&str; 6] = ["authorization", "api_key", "api_secret", "signature", "pionex-key", "pionex-signature"];

/// Fields lifted out of `data` to the top level of a record.
const PROMOTED: [&str; 2] = ["symbol", "source"];

fn build_record(run_id: &str, seq: u64, level: Level, domain: &str, event: &str, mut fields: Map<String, Value>) -> Value {
    for (key, value) in fields.iter_mut() {
        if REDACTED.contains(&key.to_ascii_lowercase().as_str()) {
            *value = Value::String("[REDACTED]".to_string());
        }
    }
    let mut record = Map::new();
    record.insert("ts".into(), json!(ts_now()));
    record.insert("run_id".into(), json!(run_id));
    record.insert("seq".into(), json!(seq));
    record.insert("lvl".into(), json!(level.as_str()));
    record.insert("domain".into(), json!(domain));
    record.insert("event".into(), json!(event));
    record.insert("msg".into(), fields.remove("msg").unwrap_or_else(|| json!("")));
    for key in PROMOTED {
        if let Some(value) = fields.remove(key) {
            record.insert(key.into(), value);
        }
    }
    record.insert("data".into(), Value::Object(fields));
    Value::Object(record)
}

/// RFC3339 with milliseconds, UTC.
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

pub fn run_id() -> String {
    outputs().run_id.clone()
}

/// Writes one JSON line if the level and domain pass the filter.
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if !filter().allows(level, domain) {
        return;
    }
    let out = outputs();
    let line = build_record(&out.run_id, next_seq(), level, domain.as_str(), event, fields).to_string();
    out.write(level, &line);
}

// =============================================================================
// Domain-Specific Logging Helpers
// =============================================================================

pub fn log_quotes(quotes: &[(String, Option<f64>)], mid: Option<f64>, divergence_bps: f64, vol_pct: f64, alive: usize) {
    let per_source: Map<String, Value> = quotes
        .iter()
        .map(|(id, px)| (id.clone(), px.map(v_num).unwrap_or(Value::Null)))
        .collect();
    log(
        Level::Debug,
        Domain::Market,
        "consensus",
        obj(&[
            ("sources", Value::Object(per_source)),
            ("mid", mid.map(v_num).unwrap_or(Value::Null)),
            ("divergence_bps", v_num(divergence_bps)),
            ("short_vol_pct", v_num(vol_pct)),
            ("alive", json!(alive)),
        ]),
    );
}

pub fn log_regime(status: &str, reason: &str, previous: Option<&str>) {
    let changed = previous != Some(status);
    log(
        if changed { Level::Info } else { Level::Debug },
        Domain::Regime,
        if changed { "regime_change" } else { "regime" },
        obj(&[
            ("status", v_str(status)),
            ("reason", v_str(reason)),
            ("previous", previous.map(v_str).unwrap_or(Value::Null)),
        ]),
    );
}

pub fn log_pid(error: f64, output: f64, leverage: f64, integral: f64, dt_secs: f64) {
    log(
        Level::Debug,
        Domain::Control,
        "pid",
        obj(&[
            ("error", v_num(error)),
            ("output", v_num(output)),
            ("leverage", v_num(leverage)),
            ("integral", v_num(integral)),
            ("dt_secs", v_num(dt_secs)),
        ]),
    );
}

pub fn log_grid(lower: f64, upper: f64, levels: u32, band_pct: f64) {
    log(
        Level::Debug,
        Domain::Control,
        "grid",
        obj(&[
            ("lower", v_num(lower)),
            ("upper", v_num(upper)),
            ("levels", json!(levels)),
            ("band_pct", v_num(band_pct)),
        ]),
    );
}

pub fn log_breakout(timeframe: &str, top: Option<f64>, bottom: Option<f64>, class: &str, persist: u32, signal: &str) {
    log(
        if signal == "none" { Level::Debug } else { Level::Info },
        Domain::Signal,
        "breakout",
        obj(&[
            ("timeframe", v_str(timeframe)),
            ("top", top.map(v_num).unwrap_or(Value::Null)),
            ("bottom", bottom.map(v_num).unwrap_or(Value::Null)),
            ("last_signal", v_str(class)),
            ("persist_count", json!(persist)),
            ("signal", v_str(signal)),
        ]),
    );
}

pub fn log_timeframe_switch(from: &str, to: &str) {
    log(
        Level::Info,
        Domain::Signal,
        "timeframe_switch",
        obj(&[("from", v_str(from)), ("to", v_str(to))]),
    );
}

pub fn log_decision(kind: &str, reason: &str, detail: Value) {
    log(
        if kind == "NONE" { Level::Debug } else { Level::Info },
        Domain::Risk,
        "decision",
        obj(&[("kind", v_str(kind)), ("reason", v_str(reason)), ("detail", detail)]),
    );
}

pub fn log_order_placed(kind: &str, accepted: usize, qty: f64) {
    log(
        Level::Info,
        Domain::Exec,
        "order_placed",
        obj(&[("kind", v_str(kind)), ("accepted", json!(accepted)), ("qty", v_num(qty))]),
    );
}

pub fn log_exec_failure(op: &str, err: &str, consecutive: u32) {
    log(
        Level::Error,
        Domain::Exec,
        "exec_failure",
        obj(&[("op", v_str(op)), ("error", v_str(err)), ("consecutive", json!(consecutive))]),
    );
}

pub fn log_persist_failure(op: &str, err: &str) {
    log(
        Level::Error,
        Domain::Persist,
        "persist_failure",
        obj(&[("op", v_str(op)), ("error", v_str(err))]),
    );
}

pub fn log_fill_snapshot(count: usize, ts: u64) {
    log(
        Level::Info,
        Domain::Fill,
        "fills",
        obj(&[("count", json!(count)), ("snapshot_ts", json!(ts))]),
    );
}

pub fn log_position_closed(id: u64, side: &str, result: &str, exit: f64, return_pct: f64) {
    log(
        Level::Info,
        Domain::Risk,
        "position_closed",
        obj(&[
            ("id", json!(id)),
            ("side", v_str(side)),
            ("result", v_str(result)),
            ("exit", v_num(exit)),
            ("return_pct", v_num(return_pct)),
        ]),
    );
}

/// Session summary on shutdown
pub fn log_session_summary(duration_secs: u64, ticks: u64, wins: u64, losses: u64, realized_pct: f64, faults: u64) {
    let total = wins + losses;
    let win_rate = if total > 0 { wins as f64 / total as f64 } else { 0.0 };
    log(
        Level::Info,
        Domain::System,
        "session_summary",
        obj(&[
            ("duration_secs", json!(duration_secs)),
            ("ticks", json!(ticks)),
            ("wins", json!(wins)),
            ("losses", json!(losses)),
            ("win_rate", v_num(win_rate)),
            ("realized_pct", v_num(realized_pct)),
            ("faults", json!(faults)),
        ]),
    );
}

// =============================================================================
// Field helpers
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

/// Non-finite numbers serialize as null.
pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Profiling
// =============================================================================

/// Emits a trace-level `profile` record with the elapsed time when dropped.
pub struct ProfileScope {
    label: &'static str,
    fields: Map<String, Value>,
    started: Instant,
}

impl ProfileScope {
    pub fn with_context(label: &'static str, fields: &[(&str, Value)]) -> Self {
        Self { label, fields: obj(fields), started: Instant::now() }
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        let mut fields = std::mem::take(&mut self.fields);
        fields.insert("label".into(), v_str(self.label));
        fields.insert("elapsed_ms".into(), v_num(self.started.elapsed().as_secs_f64() * 1_000.0));
        log(Level::Trace, Domain::Profile, "profile", fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parse_and_order() {
        assert_eq!("WARNING".parse::<Level>(), Ok(Level::Warn));
        assert_eq!(" debug ".parse::<Level>(), Ok(Level::Debug));
        assert!("loud".parse::<Level>().is_err());
        assert!(Level::Trace < Level::Info && Level::Error < Level::Fatal);
    }

    #[test]
    fn test_filter_defaults_to_info_and_all_domains() {
        let f = Filter::parse(None, None);
        assert!(!f.allows(Level::Debug, Domain::Market));
        assert!(f.allows(Level::Info, Domain::Profile));

        let f = Filter::parse(Some("nonsense"), Some("all"));
        assert!(f.allows(Level::Info, Domain::Exec));
    }

    #[test]
    fn test_filter_domain_list() {
        let f = Filter::parse(Some("trace"), Some("exec, risk"));
        assert!(f.allows(Level::Trace, Domain::Exec));
        assert!(f.allows(Level::Info, Domain::Risk));
        assert!(!f.allows(Level::Fatal, Domain::Market));
    }

    #[test]
    fn test_non_finite_is_null() {
        assert_eq!(v_num(f64::NAN), Value::Null);
        assert_eq!(obj(&[("k", v_num(2.5))])["k"], 2.5);
    }

    #[test]
    fn test_secrets_redacted_case_insensitive() {
        let fields = obj(&[("PIONEX-KEY", v_str("abc")), ("Signature", v_str("deadbeef")), ("qty", v_num(1.0))]);
        let rec = build_record("gp-test", 1, Level::Info, "exec", "order", fields);
        assert_eq!(rec["data"]["PIONEX-KEY"], "[REDACTED]");
        assert_eq!(rec["data"]["Signature"], "[REDACTED]");
        assert_eq!(rec["data"]["qty"], 1.0);
    }

    #[test]
    fn test_record_shape() {
        let fields = obj(&[("msg", v_str("hello")), ("symbol", v_str("SOLUSDT")), ("x", json!(1))]);
        let rec = build_record("gp-test", 7, Level::Warn, "system", "startup", fields);
        assert_eq!(rec["lvl"], "WARN");
        assert_eq!(rec["seq"], 7);
        assert_eq!(rec["domain"], "system");
        assert_eq!(rec["msg"], "hello");
        assert_eq!(rec["symbol"], "SOLUSDT");
        assert_eq!(rec["data"]["x"], 1);
        assert!(rec["data"].get("msg").is_none());
    }
}
