//! Per-market positions and the cost views derived from them.

use crate::market::{Cohort, Market, Side};
use crate::utils::decimal::safe_div;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Shares and cost held in one market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub condition_id: String,
    pub label: String,
    pub asset: String,
    pub cohort: Cohort,
    pub expiry: DateTime<Utc>,
    pub up_shares: Decimal,
    pub down_shares: Decimal,
    pub up_cost: Decimal,
    pub down_cost: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn open(market: &Market, now: DateTime<Utc>) -> Self {
        Self {
            condition_id: market.condition_id.clone(),
            label: market.label.clone(),
            asset: market.asset.clone(),
            cohort: market.cohort,
            expiry: market.expiry,
            up_shares: Decimal::ZERO,
            down_shares: Decimal::ZERO,
            up_cost: Decimal::ZERO,
            down_cost: Decimal::ZERO,
            updated_at: now,
        }
    }

    pub fn shares(&self, side: Side) -> Decimal {
        match side {
            Side::Up => self.up_shares,
            Side::Down => self.down_shares,
        }
    }

    pub fn total_cost(&self) -> Decimal {
        self.up_cost + self.down_cost
    }

    /// Up minus Down.
    pub fn imbalance(&self) -> Decimal {
        self.up_shares - self.down_shares
    }

    pub fn is_empty(&self) -> bool {
        self.up_shares.is_zero()
            && self.down_shares.is_zero()
            && self.up_cost.is_zero()
            && self.down_cost.is_zero()
    }

    /// Payout if `outcome` wins: $1 per winning share.
    pub fn payout(&self, outcome: Side) -> Decimal {
        self.shares(outcome)
    }

    pub(crate) fn add(&mut self, side: Side, shares: Decimal, cost: Decimal, now: DateTime<Utc>) {
        match side {
            Side::Up => {
                self.up_shares += shares;
                self.up_cost += cost;
            }
            Side::Down => {
                self.down_shares += shares;
                self.down_cost += cost;
            }
        }
        self.updated_at = now;
    }
}

/// Cost view of a holding (one market or a whole cohort).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CostAnalysis {
    pub has_position: bool,
    pub up_shares: Decimal,
    pub down_shares: Decimal,
    pub total_cost: Decimal,
    /// Matched pairs: the guaranteed payout
    pub min_shares: Decimal,
    /// Cost per matched pair, zero when nothing is matched
    pub avg_cost_per_pair: Decimal,
    /// Guaranteed payout minus cost
    pub current_profit: Decimal,
    pub need_more_up: bool,
    pub need_more_down: bool,
}

impl CostAnalysis {
    pub fn from_totals(up_shares: Decimal, down_shares: Decimal, total_cost: Decimal) -> Self {
        let min_shares = up_shares.min(down_shares);
        Self {
            has_position: up_shares > Decimal::ZERO || down_shares > Decimal::ZERO,
            up_shares,
            down_shares,
            total_cost,
            min_shares,
            avg_cost_per_pair: safe_div(total_cost, min_shares),
            current_profit: min_shares - total_cost,
            need_more_up: up_shares < down_shares,
            need_more_down: down_shares < up_shares,
        }
    }

    pub fn imbalance(&self) -> Decimal {
        self.up_shares - self.down_shares
    }
}

/// Holdings of one asset within a cohort.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssetAggregate {
    pub up_shares: Decimal,
    pub down_shares: Decimal,
    pub up_cost: Decimal,
    pub down_cost: Decimal,
}

impl AssetAggregate {
    pub fn total_cost(&self) -> Decimal {
        self.up_cost + self.down_cost
    }

    pub fn imbalance(&self) -> Decimal {
        self.up_shares - self.down_shares
    }

    fn absorb(&mut self, position: &Position) {
        self.up_shares += position.up_shares;
        self.down_shares += position.down_shares;
        self.up_cost += position.up_cost;
        self.down_cost += position.down_cost;
    }
}

/// Sum over every live position sharing a cohort, with a per-asset breakdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CohortAggregate {
    pub cohort: Cohort,
    pub up_shares: Decimal,
    pub down_shares: Decimal,
    pub up_cost: Decimal,
    pub down_cost: Decimal,
    pub positions: usize,
    pub per_asset: BTreeMap<String, AssetAggregate>,
}

impl CohortAggregate {
    pub fn from_positions<'a>(cohort: Cohort, positions: impl Iterator<Item = &'a Position>) -> Self {
        let mut aggregate = Self {
            cohort,
            up_shares: Decimal::ZERO,
            down_shares: Decimal::ZERO,
            up_cost: Decimal::ZERO,
            down_cost: Decimal::ZERO,
            positions: 0,
            per_asset: BTreeMap::new(),
        };

        for position in positions.filter(|p| p.cohort == cohort) {
            aggregate.up_shares += position.up_shares;
            aggregate.down_shares += position.down_shares;
            aggregate.up_cost += position.up_cost;
            aggregate.down_cost += position.down_cost;
            aggregate.positions += 1;
            aggregate
                .per_asset
                .entry(position.asset.clone())
                .or_default()
                .absorb(position);
        }
        aggregate
    }

    pub fn total_cost(&self) -> Decimal {
        self.up_cost + self.down_cost
    }

    pub fn imbalance(&self) -> Decimal {
        self.up_shares - self.down_shares
    }

    pub fn has_position(&self) -> bool {
        self.up_shares > Decimal::ZERO || self.down_shares > Decimal::ZERO
    }

    pub fn analysis(&self) -> CostAnalysis {
        CostAnalysis::from_totals(self.up_shares, self.down_shares, self.total_cost())
    }
}
