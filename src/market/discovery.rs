//! Market registry: which Up/Down markets are live for each cohort.
//!
//! Slugs are derived from the slot schedule, so discovery is a handful of
//! point lookups rather than a search. The registry refreshes on a fixed
//! interval and immediately when any cohort crosses into a new slot.

use crate::exchange::MarketDiscovery;
use crate::market::types::{Cohort, Market};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Venue slug for one asset's market in the slot containing `now`.
pub fn market_slug(asset: &str, cohort: Cohort, now: DateTime<Utc>) -> String {
    format!(
        "{}-updown-{}-{}",
        asset.to_lowercase(),
        cohort.slug_tag(),
        cohort.slot_start(now).timestamp()
    )
}

/// One expected lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlugTarget {
    pub asset: String,
    pub cohort: Cohort,
    pub slug: String,
    pub slot_end: DateTime<Utc>,
}

/// Every slug that should be live right now.
pub fn expected_slugs(assets: &[String], cohorts: &[Cohort], now: DateTime<Utc>) -> Vec<SlugTarget> {
    cohorts
        .iter()
        .flat_map(|cohort| {
            assets.iter().map(move |asset| SlugTarget {
                asset: asset.to_lowercase(),
                cohort: *cohort,
                slug: market_slug(asset, *cohort, now),
                slot_end: cohort.slot_end(now),
            })
        })
        .collect()
}

/// Result of one registry refresh.
#[derive(Debug, Default)]
pub struct RefreshOutcome {
    /// Markets now tracked
    pub markets: usize,
    /// Cohorts that moved to a new slot, with the expiry they rolled from
    pub rolled: Vec<(Cohort, DateTime<Utc>)>,
}

/// Live market set, rebuilt from discovery.
pub struct MarketRegistry {
    assets: Vec<String>,
    cohorts: Vec<Cohort>,
    refresh_interval: chrono::Duration,
    markets: Vec<Market>,
    last_refresh: Option<DateTime<Utc>>,
    /// Slot end each cohort was last refreshed for
    current_slots: HashMap<Cohort, DateTime<Utc>>,
}

impl MarketRegistry {
    pub fn new(assets: Vec<String>, cohorts: Vec<Cohort>, refresh_secs: u64) -> Self {
        Self {
            assets,
            cohorts,
            refresh_interval: chrono::Duration::seconds(refresh_secs as i64),
            markets: Vec::new(),
            last_refresh: None,
            current_slots: HashMap::new(),
        }
    }

    /// True when the cache expired or any cohort entered a new slot.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        let Some(last) = self.last_refresh else {
            return true;
        };
        if now - last >= self.refresh_interval {
            return true;
        }
        self.cohorts
            .iter()
            .any(|c| self.current_slots.get(c) != Some(&c.slot_end(now)))
    }

    /// Re-resolve every expected slug.
    ///
    /// Lookups that fail keep the previous market for that slug if it is
    /// still in the same slot; otherwise the market is simply absent until
    /// the next refresh.
    pub async fn refresh(&mut self, discovery: &dyn MarketDiscovery, now: DateTime<Utc>) -> Result<RefreshOutcome> {
        let targets = expected_slugs(&self.assets, &self.cohorts, now);
        let mut markets = Vec::with_capacity(targets.len());

        for target in &targets {
            match discovery
                .fetch_market(&target.slug, &target.asset, target.cohort, target.slot_end)
                .await
            {
                Ok(Some(info)) if info.closed => {
                    debug!(slug = %target.slug, "Market already closed, skipping");
                }
                Ok(Some(info)) if info.market.expiry <= now => {
                    debug!(slug = %target.slug, "Market already expired, skipping");
                }
                Ok(Some(info)) => markets.push(info.market),
                Ok(None) => debug!(slug = %target.slug, "Market not listed yet"),
                Err(e) => {
                    warn!(slug = %target.slug, error = %e, "Market lookup failed");
                    if let Some(previous) = self.markets.iter().find(|m| m.label == target.slug) {
                        markets.push(previous.clone());
                    }
                }
            }
        }

        let mut rolled = Vec::new();
        for cohort in &self.cohorts {
            let slot_end = cohort.slot_end(now);
            if let Some(previous) = self.current_slots.insert(*cohort, slot_end) {
                if previous != slot_end {
                    info!(%cohort, from = %previous, to = %slot_end, "🔄 Cohort rolled to new slot");
                    rolled.push((*cohort, previous));
                }
            }
        }

        self.markets = markets;
        self.last_refresh = Some(now);

        Ok(RefreshOutcome {
            markets: self.markets.len(),
            rolled,
        })
    }

    pub fn markets(&self) -> &[Market] {
        &self.markets
    }

    pub fn cohorts(&self) -> &[Cohort] {
        &self.cohorts
    }

    pub fn cohort_markets(&self, cohort: Cohort) -> Vec<&Market> {
        self.markets.iter().filter(|m| m.cohort == cohort).collect()
    }

    pub fn get(&self, condition_id: &str) -> Option<&Market> {
        self.markets.iter().find(|m| m.condition_id == condition_id)
    }

    /// Every Up and Down token of the tracked markets.
    pub fn token_ids(&self) -> Vec<String> {
        self.markets
            .iter()
            .flat_map(|m| [m.up_token.clone(), m.down_token.clone()])
            .collect()
    }
}
