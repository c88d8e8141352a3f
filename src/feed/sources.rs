//! HTTP ticker sources and a settable static source.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use super::PriceSource;

fn usable(px: f64) -> Option<f64> {
    if px.is_finite() && px > 0.0 {
        Some(px)
    } else {
        None
    }
}

async fn get_json(client: &Client, url: &str) -> Option<Value> {
    let resp = client.get(url).send().await.ok()?;
    if !resp.status().is_success() {
        return None;
    }
    resp.json::<Value>().await.ok()
}

// =============================================================================
// Binance USDⓈ-M futures
// =============================================================================

#[derive(Deserialize)]
struct BinancePrice {
    price: String,
}

pub fn parse_binance(body: &Value) -> Option<f64> {
    let p: BinancePrice = serde_json::from_value(body.clone()).ok()?;
    usable(p.price.parse().ok()?)
}

pub struct BinanceTicker {
    client: Client,
    url: String,
}

impl BinanceTicker {
    pub fn new(client: Client, base: &str, symbol: &str) -> Self {
        Self { client, url: format!("{}/fapi/v1/ticker/price?symbol={}", base, symbol) }
    }
}

#[async_trait]
impl PriceSource for BinanceTicker {
    fn id(&self) -> &str {
        "binance"
    }

    async fn fetch(&self) -> Option<f64> {
        parse_binance(&get_json(&self.client, &self.url).await?)
    }
}

// =============================================================================
// Bybit v5 linear
// =============================================================================

pub fn parse_bybit(body: &Value) -> Option<f64> {
    let row = body.get("result")?.get("list")?.as_array()?.first()?;
    usable(row.get("lastPrice")?.as_str()?.parse().ok()?)
}

pub struct BybitTicker {
    client: Client,
    url: String,
}

impl BybitTicker {
    pub fn new(client: Client, base: &str, symbol: &str) -> Self {
        Self { client, url: format!("{}/v5/market/tickers?category=linear&symbol={}", base, symbol) }
    }
}

#[async_trait]
impl PriceSource for BybitTicker {
    fn id(&self) -> &str {
        "bybit"
    }

    async fn fetch(&self) -> Option<f64> {
        parse_bybit(&get_json(&self.client, &self.url).await?)
    }
}

// =============================================================================
// OKX v5 swap
// =============================================================================

pub fn parse_okx(body: &Value) -> Option<f64> {
    let row = body.get("data")?.as_array()?.first()?;
    usable(row.get("last")?.as_str()?.parse().ok()?)
}

pub struct OkxTicker {
    client: Client,
    url: String,
}

impl OkxTicker {
    pub fn new(client: Client, base: &str, inst_id: &str) -> Self {
        Self { client, url: format!("{}/api/v5/market/ticker?instId={}", base, inst_id) }
    }
}

#[async_trait]
impl PriceSource for OkxTicker {
    fn id(&self) -> &str {
        "okx"
    }

    async fn fetch(&self) -> Option<f64> {
        parse_okx(&get_json(&self.client, &self.url).await?)
    }
}

// =============================================================================
// Static / replay
// =============================================================================

/// Returns whatever price was last set. Cloning shares the cell, so a test or
/// replay driver can move prices while the controller owns the source.
#[derive(Clone)]
pub struct StaticSource {
    id: String,
    price: Arc<Mutex<Option<f64>>>,
}

impl StaticSource {
    pub fn new(id: &str, price: Option<f64>) -> Self {
        Self { id: id.to_string(), price: Arc::new(Mutex::new(price)) }
    }

    pub fn set(&self, price: Option<f64>) {
        if let Ok(mut p) = self.price.lock() {
            *p = price;
        }
    }
}

#[async_trait]
impl PriceSource for StaticSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self) -> Option<f64> {
        self.price.lock().ok().and_then(|p| *p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_binance() {
        assert_eq!(parse_binance(&json!({"symbol": "SOLUSDT", "price": "151.23"})), Some(151.23));
        assert_eq!(parse_binance(&json!({"symbol": "SOLUSDT"})), None);
        assert_eq!(parse_binance(&json!({"price": "0"})), None);
    }

    #[test]
    fn test_parse_bybit() {
        let body = json!({"retCode": 0, "result": {"category": "linear", "list": [{"symbol": "SOLUSDT", "lastPrice": "150.9"}]}});
        assert_eq!(parse_bybit(&body), Some(150.9));
        assert_eq!(parse_bybit(&json!({"result": {"list": []}})), None);
    }

    #[test]
    fn test_parse_okx() {
        let body = json!({"code": "0", "data": [{"instId": "SOL-USDT-SWAP", "last": "151.01"}]});
        assert_eq!(parse_okx(&body), Some(151.01));
        assert_eq!(parse_okx(&json!({"data": [{"last": "nan"}]})), None);
    }

    #[tokio::test]
    async fn test_static_source_shared_cell() {
        let src = StaticSource::new("s", None);
        let handle = src.clone();
        assert_eq!(src.fetch().await, None);
        handle.set(Some(42.0));
        assert_eq!(src.fetch().await, Some(42.0));
    }
}
