//! One-shot health check: config, venue auth, datafeeds, candles, and
//! whether the configured notional clears the venue step size.
//!
//! Prints a JSON report and exits non-zero when any check fails.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};

use gridpilot::config::Config;
use gridpilot::consensus::{aggregate, QuoteWindow};
use gridpilot::feed::candles::BinanceKlines;
use gridpilot::feed::{default_sources, fetch_quotes, http_client, CandleSource};
use gridpilot::sizing::Sizer;
use gridpilot::state::now_ts;

fn check(name: &str, ok: bool, detail: Value) -> Value {
    let mut out = json!({ "name": name, "ok": ok });
    if let (Some(map), Value::Object(extra)) = (out.as_object_mut(), detail) {
        map.extend(extra);
    }
    out
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let mut checks: Vec<Value> = Vec::new();

    let problems = cfg.validate();
    checks.push(check("config", problems.is_empty(), json!({ "problems": problems })));

    let client = http_client(Duration::from_millis(cfg.looping.source_timeout_ms.max(1_000) * 2));

    // venue auth via balance
    let equity = match cfg.venue.execution.build(&cfg.venue, client.clone(), cfg.sizing.equity_fallback) {
        Ok(sink) => {
            let equity = sink.get_equity().await;
            let (open_orders, open_error) = match sink.list_open_orders().await {
                Ok(o) => (Some(o.len()), None),
                Err(e) => (None, Some(e.to_string())),
            };
            checks.push(check(
                "auth_balance",
                equity.is_some(),
                json!({ "sink": sink.name(), "equity": equity, "open_orders": open_orders, "error": open_error }),
            ));
            equity
        }
        Err(e) => {
            checks.push(check("auth_balance", false, json!({ "error": e.to_string() })));
            None
        }
    };

    // datafeeds
    let sources = default_sources(&cfg.venue, client.clone());
    let quotes: BTreeMap<String, Option<f64>> =
        fetch_quotes(&sources, Duration::from_millis(cfg.looping.source_timeout_ms)).await;
    let mut window = QuoteWindow::new(cfg.regime.vol_window);
    let q = aggregate(&quotes, &mut window, now_ts());
    checks.push(check(
        "datafeeds",
        q.alive_count > 0,
        json!({
            "sources": quotes,
            "mid": q.mid,
            "divergence_bps": q.divergence_bps,
            "alive": q.alive_count,
            "quorum": cfg.regime.quorum,
        }),
    ));

    // candles, also the mid fallback when every ticker is down
    let klines = BinanceKlines::new(client, &cfg.venue.binance_fapi_base, &cfg.venue.symbol());
    let candle_mid = match klines.fetch(cfg.timeframe.fast, 5).await {
        Ok(c) => {
            checks.push(check("candles", !c.is_empty(), json!({ "timeframe": cfg.timeframe.fast.as_str(), "count": c.len() })));
            c.last().map(|c| c.c)
        }
        Err(e) => {
            checks.push(check("candles", false, json!({ "error": e.to_string() })));
            None
        }
    };

    // qty per level against the step
    match q.mid.or(candle_mid) {
        Some(mid) => {
            let sizer = Sizer::new(cfg.sizing.clone());
            let cap = sizer.notional_cap(equity);
            let lev = 1.0_f64.clamp(cfg.pid.lev_min, cfg.pid.lev_max.max(cfg.pid.lev_min));
            let levels = cfg.grid.levels.max(2);
            let raw = cap / levels as f64 / mid * lev.max(0.01);
            let qty = sizer.grid_qty_per_level(cap, levels, mid, lev);
            checks.push(check(
                "qty_calc",
                qty > 0.0,
                json!({
                    "mid": mid,
                    "notional_cap": cap,
                    "levels": levels,
                    "leverage": lev,
                    "qty_per_level_raw": raw,
                    "qty_per_level": qty,
                    "step_size": sizer.step_size(),
                }),
            ));
        }
        None => checks.push(check("qty_calc", false, json!({ "reason": "no mid" }))),
    }

    let all_ok = checks.iter().all(|c| c.get("ok").and_then(Value::as_bool).unwrap_or(false));
    let report = json!({ "ts": now_ts(), "ok": all_ok, "checks": checks });
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !all_ok {
        std::process::exit(1);
    }
    Ok(())
}
