//! Market data collaborators: price sources, candle sources, fills listener.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::join_all;
use reqwest::Client;

use crate::breakout::Candle;
use crate::config::VenueConfig;
use crate::timeframe::Timeframe;

pub mod candles;
pub mod fills;
pub mod sources;

/// One independent quote provider. Failures stay inside: a source that
/// cannot answer returns `None`.
#[async_trait]
pub trait PriceSource: Send + Sync {
    fn id(&self) -> &str;
    async fn fetch(&self) -> Option<f64>;
}

/// Closed candles for a timeframe, most recent last. May be empty.
#[async_trait]
pub trait CandleSource: Send + Sync {
    async fn fetch(&self, tf: Timeframe, limit: usize) -> Result<Vec<Candle>>;
}

/// Queries every source concurrently, each under its own timeout. A source
/// that times out contributes `None`; the others are kept.
pub async fn fetch_quotes(
    sources: &[Box<dyn PriceSource>],
    per_source_timeout: Duration,
) -> BTreeMap<String, Option<f64>> {
    let pending = sources.iter().map(|s| async move {
        let px = tokio::time::timeout(per_source_timeout, s.fetch()).await.ok().flatten();
        (s.id().to_string(), px)
    });
    join_all(pending).await.into_iter().collect()
}

pub fn http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("gridpilot/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Binance futures, Bybit linear and OKX swap tickers for the configured pair.
pub fn default_sources(venue: &VenueConfig, client: Client) -> Vec<Box<dyn PriceSource>> {
    vec![
        Box::new(sources::BinanceTicker::new(client.clone(), &venue.binance_fapi_base, &venue.symbol())),
        Box::new(sources::BybitTicker::new(client.clone(), &venue.bybit_base, &venue.symbol())),
        Box::new(sources::OkxTicker::new(
            client,
            &venue.okx_base,
            &format!("{}-{}-SWAP", venue.base_asset, venue.quote_asset),
        )),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use sources::StaticSource;

    struct Slow;

    #[async_trait]
    impl PriceSource for Slow {
        fn id(&self) -> &str {
            "slow"
        }

        async fn fetch(&self) -> Option<f64> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Some(1.0)
        }
    }

    #[tokio::test]
    async fn test_fetch_quotes_partial_results() {
        let sources: Vec<Box<dyn PriceSource>> = vec![
            Box::new(StaticSource::new("a", Some(100.0))),
            Box::new(StaticSource::new("b", None)),
            Box::new(Slow),
        ];
        let quotes = fetch_quotes(&sources, Duration::from_millis(50)).await;
        assert_eq!(quotes.len(), 3);
        assert_eq!(quotes["a"], Some(100.0));
        assert_eq!(quotes["b"], None);
        assert_eq!(quotes["slow"], None);
    }

    #[test]
    fn test_default_sources_ids() {
        let srcs = default_sources(&VenueConfig::default(), Client::new());
        let ids: Vec<&str> = srcs.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec!["binance", "bybit", "okx"]);
    }
}
