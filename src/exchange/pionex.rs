//! Pionex spot REST sink.
//!
//! Every private call carries a `timestamp` query parameter and is signed with
//! `sign_pionex`. Reads go through `retry_async`; order placement does not, a
//! rejected order is retried by a later tick instead.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{json, Value};

use super::retry::{is_transient_status, retry_async, RetryPolicy, Transient};
use super::signing::{canonical_query, sign_pionex};
use super::{grid_orders, BracketOrder, ExecutionSink, FillRecord, OpenOrder};
use crate::config::{EntryKind, VenueConfig};
use crate::grid::GridPlan;
use crate::ladder::Side;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};

const PRICE_DECIMALS: usize = 4;
const SIZE_DECIMALS: usize = 4;

pub struct PionexSink {
    client: Client,
    base: String,
    symbol: String,
    quote_asset: String,
    api_key: String,
    api_secret: String,
    retry: RetryPolicy,
    order_seq: AtomicU64,
}

impl PionexSink {
    pub fn new(client: Client, venue: &VenueConfig, api_key: String, api_secret: String) -> Self {
        Self {
            client,
            base: venue.pionex_base.trim_end_matches('/').to_string(),
            symbol: venue.venue_symbol(),
            quote_asset: venue.quote_asset.clone(),
            api_key,
            api_secret,
            retry: RetryPolicy::default(),
            order_seq: AtomicU64::new(0),
        }
    }

    fn timestamp_ms() -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }

    fn client_order_id(&self) -> String {
        let n = self.order_seq.fetch_add(1, Ordering::SeqCst);
        format!("gp{}{:04}", Self::timestamp_ms(), n % 10_000)
    }

    async fn signed(&self, method: Method, path: &str, mut params: Vec<(&str, String)>, body: Option<Value>) -> Result<Value> {
        params.push(("timestamp", Self::timestamp_ms().to_string()));
        let query = canonical_query(&params);
        let body = body.map(|b| b.to_string());
        let signature = sign_pionex(method.as_str(), path, &query, body.as_deref(), &self.api_secret)
            .map_err(|e| anyhow!(e))?;

        let url = format!("{}{}?{}", self.base, path, query);
        let mut req = self
            .client
            .request(method.clone(), &url)
            .header("PIONEX-KEY", &self.api_key)
            .header("PIONEX-SIGNATURE", signature);
        if let Some(body) = body {
            req = req.header("Content-Type", "application/json").body(body);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| anyhow::Error::new(Transient(e.to_string())))
            .with_context(|| format!("{} {}", method, path))?;
        let status = resp.status();
        let payload: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let detail = format!("{} {} -> {}: {}", method, path, status.as_u16(), payload);
            if is_transient_status(status.as_u16()) {
                return Err(anyhow::Error::new(Transient(detail)));
            }
            return Err(anyhow!(detail));
        }
        parse_envelope(&payload)
    }

    async fn get(&self, op: &str, path: &'static str, params: Vec<(&'static str, String)>) -> Result<Value> {
        retry_async(&self.retry, op, move || self.signed(Method::GET, path, params.clone(), None)).await
    }

    async fn post_order(&self, side: Side, kind: EntryKind, price: f64, qty: f64) -> Result<String> {
        let mut body = json!({
            "symbol": self.symbol,
            "side": side.order_side(),
            "clientOrderId": self.client_order_id(),
        });
        match kind {
            EntryKind::Market => {
                body["type"] = json!("MARKET");
                if side == Side::Long {
                    // market buys are sized in quote currency
                    body["amount"] = json!(fmt_num(price * qty, 2));
                } else {
                    body["size"] = json!(fmt_num(qty, SIZE_DECIMALS));
                }
            }
            EntryKind::Limit | EntryKind::Ioc => {
                body["type"] = json!("LIMIT");
                body["price"] = json!(fmt_num(price, PRICE_DECIMALS));
                body["size"] = json!(fmt_num(qty, SIZE_DECIMALS));
                if kind == EntryKind::Ioc {
                    body["IOC"] = json!(true);
                }
            }
        }
        let data = self.signed(Method::POST, "/api/v1/trade/order", vec![], Some(body)).await?;
        Ok(data.get("orderId").map(id_string).unwrap_or_default())
    }

    async fn cancel_all(&self) -> Result<()> {
        self.signed(Method::DELETE, "/api/v1/trade/allOrders", vec![], Some(json!({ "symbol": self.symbol })))
            .await
            .map(|_| ())
    }
}

/// `{"result": true, "data": ...}` on success, `{"result": false, "code", "message"}` otherwise.
pub fn parse_envelope(payload: &Value) -> Result<Value> {
    match payload.get("result").and_then(Value::as_bool) {
        Some(true) => Ok(payload.get("data").cloned().unwrap_or(Value::Null)),
        Some(false) => {
            let code = payload.get("code").and_then(Value::as_str).unwrap_or("UNKNOWN");
            let message = payload.get("message").and_then(Value::as_str).unwrap_or("");
            Err(anyhow!("pionex error {}: {}", code, message))
        }
        None => Err(anyhow!("pionex: unexpected payload {}", payload)),
    }
}

/// Fixed decimals with trailing zeros removed.
pub fn fmt_num(x: f64, decimals: usize) -> String {
    let s = format!("{:.*}", decimals, x);
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s
    }
}

fn num(v: &Value) -> f64 {
    match v {
        Value::String(s) => s.parse().unwrap_or(0.0),
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct PionexOrder {
    order_id: Value,
    side: String,
    #[serde(default)]
    price: Value,
    #[serde(default)]
    size: Value,
}

#[derive(Deserialize, Debug)]
struct PionexFill {
    id: Value,
    side: String,
    price: Value,
    size: Value,
    #[serde(default)]
    fee: Value,
    timestamp: u64,
}

#[derive(Deserialize, Debug)]
struct PionexBalance {
    coin: String,
    free: String,
    frozen: String,
}

fn id_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn parse_open_orders(data: &Value) -> Result<Vec<OpenOrder>> {
    let rows: Vec<PionexOrder> = serde_json::from_value(data.get("orders").cloned().unwrap_or_else(|| json!([])))
        .context("open orders payload")?;
    Ok(rows
        .into_iter()
        .map(|o| OpenOrder { id: id_string(&o.order_id), side: o.side, price: num(&o.price), qty: num(&o.size) })
        .collect())
}

pub fn parse_fills(data: &Value) -> Result<Vec<FillRecord>> {
    let rows: Vec<PionexFill> =
        serde_json::from_value(data.get("fills").cloned().unwrap_or_else(|| json!([]))).context("fills payload")?;
    Ok(rows
        .into_iter()
        .map(|f| FillRecord {
            id: id_string(&f.id),
            side: f.side,
            price: num(&f.price),
            qty: num(&f.size),
            fee: num(&f.fee),
            ts: f.timestamp / 1000,
        })
        .collect())
}

/// Free plus frozen balance of the quote asset.
pub fn parse_equity(data: &Value, quote_asset: &str) -> Option<f64> {
    let rows: Vec<PionexBalance> = serde_json::from_value(data.get("balances")?.clone()).ok()?;
    let row = rows.iter().find(|b| b.coin.eq_ignore_ascii_case(quote_asset))?;
    let total = row.free.parse::<f64>().ok()? + row.frozen.parse::<f64>().ok()?;
    if total.is_finite() {
        Some(total)
    } else {
        None
    }
}

#[async_trait]
impl ExecutionSink for PionexSink {
    fn name(&self) -> &str {
        "pionex"
    }

    async fn replace_standing_orders(&self, plan: &GridPlan, qty: f64, reference_price: f64) -> Result<usize> {
        self.cancel_all().await.context("cancel before grid replace")?;
        let orders = grid_orders(plan, reference_price);
        let mut accepted = 0usize;
        let mut last_err: Option<anyhow::Error> = None;
        for o in &orders {
            match self.post_order(o.side, EntryKind::Limit, o.price, qty).await {
                Ok(_) => accepted += 1,
                Err(e) => {
                    log(
                        Level::Warn,
                        Domain::Exec,
                        "grid_order_rejected",
                        obj(&[("side", v_str(o.side.order_side())), ("price", v_num(o.price)), ("error", v_str(&e.to_string()))]),
                    );
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) if accepted == 0 => Err(e.context("no grid order accepted")),
            _ => Ok(accepted),
        }
    }

    /// Entry plus a resting take-profit on the opposite side. The stop leg is
    /// not sent: spot orders here have no trigger type, and the stop is
    /// tracked by the risk ladder against the consensus mid. `reduce_only`
    /// likewise has no spot counterpart.
    async fn place_bracket(&self, order: &BracketOrder) -> Result<()> {
        let entry_id = self.post_order(order.side, order.entry_kind, order.entry, order.qty).await?;
        let exit_side = match order.side {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        };
        if let Err(e) = self.post_order(exit_side, EntryKind::Limit, order.target, order.qty).await {
            log(
                Level::Warn,
                Domain::Exec,
                "bracket_target_rejected",
                obj(&[("entry_id", v_str(&entry_id)), ("target", v_num(order.target)), ("error", v_str(&e.to_string()))]),
            );
        }
        Ok(())
    }

    async fn list_open_orders(&self) -> Result<Vec<OpenOrder>> {
        let data = self.get("open_orders", "/api/v1/trade/openOrders", vec![("symbol", self.symbol.clone())]).await?;
        parse_open_orders(&data)
    }

    async fn list_recent_fills(&self, limit: usize) -> Result<Vec<FillRecord>> {
        let data = self.get("fills", "/api/v1/trade/fills", vec![("symbol", self.symbol.clone())]).await?;
        let mut fills = parse_fills(&data)?;
        fills.sort_by_key(|f| f.ts);
        if fills.len() > limit {
            fills.drain(..fills.len() - limit);
        }
        Ok(fills)
    }

    async fn get_equity(&self) -> Option<f64> {
        let data = self.get("balances", "/api/v1/account/balances", vec![]).await.ok()?;
        parse_equity(&data, &self.quote_asset)
    }
}
