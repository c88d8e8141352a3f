use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::json;
use tokio::sync::watch;

use gridpilot::config::Config;
use gridpilot::engine::{spawn_signal_listener, Collaborators, Controller};
use gridpilot::feed::candles::BinanceKlines;
use gridpilot::feed::fills::{fill_channel, start_fills_listener};
use gridpilot::feed::{default_sources, http_client};
use gridpilot::logging::{log, obj, run_id, v_str, Domain, Level};
use gridpilot::storage::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let problems = cfg.validate();
    if !problems.is_empty() {
        for p in &problems {
            log(Level::Fatal, Domain::System, "config_invalid", obj(&[("problem", v_str(p))]));
        }
        return Err(anyhow!("invalid configuration: {}", problems.join("; ")));
    }

    log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[
            ("run_id", v_str(&run_id())),
            ("symbol", v_str(&cfg.venue.symbol())),
            ("execution", v_str(cfg.venue.execution.as_str())),
            ("tick_secs", json!(cfg.looping.tick_secs)),
            ("fills_ws", json!(cfg.venue.fills_ws_url.is_some())),
        ]),
    );

    let client = http_client(Duration::from_millis(cfg.looping.source_timeout_ms.max(1_000) * 2));
    let sources = default_sources(&cfg.venue, client.clone());
    let candles = BinanceKlines::new(client.clone(), &cfg.venue.binance_fapi_base, &cfg.venue.symbol());
    let sink = cfg.venue.execution.build(&cfg.venue, client, cfg.sizing.equity_fallback)?;
    let store = SqliteStore::new(&cfg.venue.sqlite_path)?.with_retention(cfg.venue.store_retention);

    let fills = match cfg.venue.fills_ws_url.clone() {
        Some(url) => {
            let (tx, reader) = fill_channel();
            tokio::spawn(start_fills_listener(url, tx));
            Some(reader)
        }
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_listener(shutdown_tx)?;

    let io = Collaborators {
        sources,
        candles: Box::new(candles),
        sink,
        store: Box::new(store),
        fills,
    };
    let mut controller = Controller::new(cfg, io);
    let summary = controller.run(shutdown_rx).await;
    log(
        Level::Info,
        Domain::System,
        "exit",
        obj(&[("stop_reason", v_str(&summary.stop_reason)), ("ticks", json!(summary.ticks))]),
    );
    Ok(())
}
