//! Drives the controller over a CSV of candles with static price sources and
//! the paper sink, then prints a JSON summary.
//!
//! Usage: replay <candles.csv> [grid_fee_frac]

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use serde_json::json;

use gridpilot::config::Config;
use gridpilot::engine::{Collaborators, Controller};
use gridpilot::exchange::paper::PaperSink;
use gridpilot::feed::candles::{load_csv, ReplayCandles};
use gridpilot::feed::sources::StaticSource;
use gridpilot::feed::PriceSource;
use gridpilot::storage::MemoryStore;

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let path = PathBuf::from(args.next().ok_or_else(|| anyhow!("usage: replay <candles.csv> [grid_fee_frac]"))?);
    let fee_frac: f64 = match args.next() {
        Some(raw) => raw.parse().map_err(|e| anyhow!("bad grid_fee_frac {}: {}", raw, e))?,
        None => 0.001,
    };

    let cfg = Config::from_env();
    let problems = cfg.validate();
    if !problems.is_empty() {
        return Err(anyhow!("invalid configuration: {}", problems.join("; ")));
    }

    let series = load_csv(&path)?;
    if series.len() < 2 {
        return Err(anyhow!("{} has fewer than two usable rows", path.display()));
    }
    let bar_secs = series[1].ts.saturating_sub(series[0].ts).max(1);

    let replay = ReplayCandles::new(series);
    let feeds: Vec<StaticSource> =
        (0..cfg.regime.quorum.max(1)).map(|i| StaticSource::new(&format!("replay-{}", i), None)).collect();
    let paper = PaperSink::new(cfg.sizing.equity_fallback);
    let store = MemoryStore::new();

    let io = Collaborators {
        sources: feeds.iter().cloned().map(|s| Box::new(s) as Box<dyn PriceSource>).collect(),
        candles: Box::new(replay.clone()),
        sink: Box::new(paper.clone()),
        store: Box::new(store.clone()),
        fills: None,
    };
    let mut controller = Controller::new(cfg, io);

    let mut decisions: BTreeMap<String, u64> = BTreeMap::new();
    let mut statuses: BTreeMap<String, u64> = BTreeMap::new();
    let mut placed = 0u64;
    let mut closes = Vec::with_capacity(replay.series().len());

    for candle in replay.series().to_vec() {
        let now = candle.ts + bar_secs;
        replay.set_clock(now);
        // walk the bar so resting orders inside its range fill
        paper.on_price(candle.l, now);
        paper.on_price(candle.h, now);
        paper.on_price(candle.c, now);
        for feed in &feeds {
            feed.set(Some(candle.c));
        }
        closes.push(candle.c);

        let outcome = controller.tick(now).await;
        *decisions.entry(outcome.decision.clone()).or_default() += 1;
        *statuses.entry(outcome.status.as_str().to_string()).or_default() += 1;
        if outcome.accepted.is_some() {
            placed += 1;
        }
    }

    let last_grid = store.reports().iter().rev().find_map(|r| r.grid);
    let estimate = last_grid.map(|g| g.estimate_crossings(&closes, fee_frac));
    let ctx = controller.context();
    let paper_stats = paper.stats();

    let summary = json!({
        "file": path.display().to_string(),
        "ticks": ctx.ticks,
        "bar_secs": bar_secs,
        "statuses": statuses,
        "decisions": decisions,
        "placed": placed,
        "trades_today": ctx.counters.trades_today,
        "ladder": {
            "open": ctx.ladder.open.len(),
            "wins": ctx.ladder.wins,
            "losses": ctx.ladder.losses,
            "realized_pct": ctx.ladder.realized_pct,
        },
        "paper": {
            "fills": paper_stats.fills,
            "resting": paper_stats.resting,
            "grid_replacements": paper_stats.grid_replacements,
            "brackets": paper_stats.brackets,
            "position": paper_stats.position,
            "equity": paper_stats.equity,
        },
        "faults": ctx.faults,
        "grid_estimate": {
            "plan": last_grid,
            "fee_frac": fee_frac,
            "trades": estimate.map(|e| e.trades),
            "pnl": estimate.map(|e| e.pnl),
        },
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
