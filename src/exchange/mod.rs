//! Order placement: the `ExecutionSink` seam, order types, and the paper and
//! Pionex sinks behind it.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::{EntryKind, ExecutionKind, VenueConfig};
use crate::grid::GridPlan;
use crate::ladder::Side;

pub mod paper;
pub mod pionex;
pub mod retry;
pub mod signing;

/// A directional entry with its protective levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BracketOrder {
    pub side: Side,
    pub qty: f64,
    pub entry: f64,
    pub stop: f64,
    pub target: f64,
    pub entry_kind: EntryKind,
    pub reduce_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub id: String,
    pub side: String,
    pub price: f64,
    pub qty: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillRecord {
    pub id: String,
    pub side: String,
    pub price: f64,
    pub qty: f64,
    pub fee: f64,
    pub ts: u64,
}

/// One resting limit order of a grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridOrder {
    pub side: Side,
    pub price: f64,
}

/// Buys below the reference, sells above it. A level sitting on the
/// reference price is skipped.
pub fn grid_orders(plan: &GridPlan, reference_price: f64) -> Vec<GridOrder> {
    let eps = plan.step().abs() * 1e-6;
    plan.prices()
        .into_iter()
        .filter_map(|price| {
            if price < reference_price - eps {
                Some(GridOrder { side: Side::Long, price })
            } else if price > reference_price + eps {
                Some(GridOrder { side: Side::Short, price })
            } else {
                None
            }
        })
        .collect()
}

#[async_trait]
pub trait ExecutionSink: Send + Sync {
    fn name(&self) -> &str;
    /// Cancels every resting order and places the grid. Returns how many
    /// orders the venue accepted.
    async fn replace_standing_orders(&self, plan: &GridPlan, qty: f64, reference_price: f64) -> Result<usize>;
    async fn place_bracket(&self, order: &BracketOrder) -> Result<()>;
    async fn list_open_orders(&self) -> Result<Vec<OpenOrder>>;
    async fn list_recent_fills(&self, limit: usize) -> Result<Vec<FillRecord>>;
    async fn get_equity(&self) -> Option<f64>;
}

impl ExecutionKind {
    pub fn build(self, venue: &VenueConfig, client: Client, paper_equity: f64) -> Result<Box<dyn ExecutionSink>> {
        match self {
            ExecutionKind::Paper => Ok(Box::new(paper::PaperSink::new(paper_equity))),
            ExecutionKind::Pionex => {
                let key = venue.api_key.clone().ok_or_else(|| anyhow!("API_KEY is required for pionex execution"))?;
                let secret = venue.api_secret.clone().ok_or_else(|| anyhow!("API_SECRET is required for pionex execution"))?;
                Ok(Box::new(pionex::PionexSink::new(client, venue, key, secret)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_orders_split_around_reference() {
        let plan = GridPlan { lower: 99.0, upper: 101.0, levels: 5 };
        let orders = grid_orders(&plan, 100.0);
        // 99, 99.5, 100 (skipped), 100.5, 101
        assert_eq!(orders.len(), 4);
        assert_eq!(orders.iter().filter(|o| o.side == Side::Long).count(), 2);
        assert!(orders.iter().filter(|o| o.side == Side::Short).all(|o| o.price > 100.0));
    }

    #[test]
    fn test_grid_orders_reference_outside_band() {
        let plan = GridPlan { lower: 99.0, upper: 101.0, levels: 2 };
        let orders = grid_orders(&plan, 110.0);
        assert!(orders.iter().all(|o| o.side == Side::Long));
        assert_eq!(orders.len(), 2);
    }

    #[test]
    fn test_pionex_requires_credentials() {
        let venue = VenueConfig::default();
        assert!(ExecutionKind::Pionex.build(&venue, Client::new(), 0.0).is_err());
        assert!(ExecutionKind::Paper.build(&venue, Client::new(), 1_000.0).is_ok());
    }
}
