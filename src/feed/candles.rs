//! Candle sources: Binance futures klines and an in-memory replay series.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::CandleSource;
use crate::breakout::Candle;
use crate::timeframe::Timeframe;

// =============================================================================
// Binance futures klines
// =============================================================================

fn num(v: &Value) -> Option<f64> {
    match v {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Parses a kline array, keeping only bars closed at `now_ms`.
pub fn parse_klines(body: &Value, now_ms: u64) -> Result<Vec<Candle>> {
    let rows = body.as_array().ok_or_else(|| anyhow!("klines: expected array"))?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let r = match row.as_array() {
            Some(r) if r.len() >= 7 => r,
            _ => continue,
        };
        let open_ms = r[0].as_u64().unwrap_or(0);
        let close_ms = r[6].as_u64().unwrap_or(u64::MAX);
        if close_ms >= now_ms {
            continue;
        }
        let (o, h, l, c, v) = match (num(&r[1]), num(&r[2]), num(&r[3]), num(&r[4]), num(&r[5])) {
            (Some(o), Some(h), Some(l), Some(c), Some(v)) => (o, h, l, c, v),
            _ => continue,
        };
        out.push(Candle { ts: open_ms / 1000, o, h, l, c, v });
    }
    Ok(out)
}

pub struct BinanceKlines {
    client: Client,
    base: String,
    symbol: String,
}

impl BinanceKlines {
    pub fn new(client: Client, base: &str, symbol: &str) -> Self {
        Self { client, base: base.to_string(), symbol: symbol.to_string() }
    }
}

#[async_trait]
impl CandleSource for BinanceKlines {
    async fn fetch(&self, tf: Timeframe, limit: usize) -> Result<Vec<Candle>> {
        // one extra row, the in-progress bar is dropped
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base,
            self.symbol,
            tf.as_str(),
            limit.saturating_add(1).min(1500)
        );
        let resp = self.client.get(&url).send().await.context("klines request")?;
        if !resp.status().is_success() {
            return Err(anyhow!("klines status {}", resp.status()));
        }
        let body: Value = resp.json().await.context("klines body")?;
        let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let mut candles = parse_klines(&body, now_ms)?;
        if candles.len() > limit {
            candles.drain(..candles.len() - limit);
        }
        Ok(candles)
    }
}

// =============================================================================
// Replay
// =============================================================================

/// Base-resolution candles served as if the clock stood at `set_clock`.
/// Coarser timeframes are aggregated from the base series.
#[derive(Clone)]
pub struct ReplayCandles {
    series: Arc<Vec<Candle>>,
    clock: Arc<AtomicU64>,
}

impl ReplayCandles {
    pub fn new(mut series: Vec<Candle>) -> Self {
        series.sort_by_key(|c| c.ts);
        series.dedup_by_key(|c| c.ts);
        Self { series: Arc::new(series), clock: Arc::new(AtomicU64::new(0)) }
    }

    pub fn set_clock(&self, ts: u64) {
        self.clock.store(ts, Ordering::SeqCst);
    }

    pub fn series(&self) -> &[Candle] {
        &self.series
    }

    fn aggregate(&self, tf: Timeframe, now: u64) -> Vec<Candle> {
        let span = tf.secs();
        let mut out: Vec<Candle> = Vec::new();
        for c in self.series.iter() {
            let bucket = c.ts / span * span;
            if bucket + span > now {
                break;
            }
            match out.last_mut() {
                Some(last) if last.ts == bucket => {
                    last.h = last.h.max(c.h);
                    last.l = last.l.min(c.l);
                    last.c = c.c;
                    last.v += c.v;
                }
                _ => out.push(Candle { ts: bucket, ..*c }),
            }
        }
        out
    }
}

#[async_trait]
impl CandleSource for ReplayCandles {
    async fn fetch(&self, tf: Timeframe, limit: usize) -> Result<Vec<Candle>> {
        let mut candles = self.aggregate(tf, self.clock.load(Ordering::SeqCst));
        if candles.len() > limit {
            candles.drain(..candles.len() - limit);
        }
        Ok(candles)
    }
}

/// Reads `ts,open,high,low,close[,volume]` rows, or bare `ts,price` rows
/// which become degenerate candles. A header line and malformed rows are
/// skipped; `ts` may be seconds or milliseconds.
pub fn load_csv(path: &Path) -> Result<Vec<Candle>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut out = Vec::new();
    for line in raw.lines() {
        let cols: Vec<&str> = line.split(',').map(|c| c.trim()).collect();
        let ts: u64 = match cols[0].parse::<f64>() {
            Ok(t) if t > 0.0 => t as u64,
            _ => continue,
        };
        let ts = if ts > 10_000_000_000 { ts / 1000 } else { ts };
        let vals: Vec<f64> = cols[1..].iter().filter_map(|c| c.parse().ok()).collect();
        let candle = match vals.len() {
            0 => continue,
            1..=3 => Candle::from_price(ts, vals[0]),
            _ => Candle { ts, o: vals[0], h: vals[1], l: vals[2], c: vals[3], v: vals.get(4).copied().unwrap_or(0.0) },
        };
        if candle.is_sane() {
            out.push(candle);
        }
    }
    Ok(out)
}
