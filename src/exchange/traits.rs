//! Venue-agnostic traits for the collaborators the engine talks to.
//!
//! The engine only ever depends on these traits, so paper trading, the live
//! Polymarket client and test doubles are interchangeable:
//! - `MarketDiscovery`: resolve a market slug to tokens and expiry
//! - `OrderGateway`: submit fill-and-kill orders
//! - `ResolutionSource`: report the winning side once a market closes

use super::types::{MarketInfo, OrderRequest, OrderResponse};
use crate::market::{Cohort, Side};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Looks up the Up/Down market for a given slug.
#[async_trait]
pub trait MarketDiscovery: Send + Sync {
    /// Fetch one market by slug.
    ///
    /// `Ok(None)` means the venue has not listed it (yet).
    async fn fetch_market(
        &self,
        slug: &str,
        asset: &str,
        cohort: Cohort,
        slot_end: DateTime<Utc>,
    ) -> anyhow::Result<Option<MarketInfo>>;
}

/// Order entry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Submit an order and return the venue's raw response.
    ///
    /// Transport failures are `Err`; venue rejections come back as
    /// `Ok` with `success == false`.
    async fn submit_order(&self, order: &OrderRequest) -> anyhow::Result<OrderResponse>;

    /// Verify the trading API is reachable and authorised.
    async fn health_check(&self) -> anyhow::Result<()>;
}

/// Settlement outcome lookup.
#[async_trait]
pub trait ResolutionSource: Send + Sync {
    /// Winning side for a market label, or `None` while unresolved.
    async fn resolve(&self, label: &str) -> anyhow::Result<Option<Side>>;
}
