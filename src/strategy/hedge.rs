//! Hedge controller: one-shot loss capping once the risk monitor fires.
//!
//! On entry the per-asset imbalance of the cohort is frozen into buy targets
//! for the short side. Targets are never recomputed; each cycle the
//! remainder is turned into single-sided decisions until everything is
//! filled, after which the cohort stops trading until it rolls.

use crate::config::HedgeConfig;
use crate::ledger::PositionLedger;
use crate::market::{Cohort, Market, QuoteBook, Side};
use crate::strategy::scanner::{Decision, DecisionReason, Leg};
use crate::utils::decimal::{floor_shares, TICK};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HedgePhase {
    Idle,
    Hedging,
    Completed,
}

/// Frozen buy target for one asset/side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HedgeTarget {
    pub asset: String,
    pub side: Side,
    pub target: Decimal,
    pub filled: Decimal,
    pub cost: Decimal,
    /// Remainder too small to trade at the last seen ask
    pub dust: bool,
}

impl HedgeTarget {
    pub fn remaining(&self) -> Decimal {
        (self.target - self.filled).max(Decimal::ZERO)
    }

    fn is_done(&self) -> bool {
        self.dust || self.remaining() < TICK
    }
}

/// Loss estimate recorded when hedging starts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HedgeEntry {
    pub cohort: Cohort,
    pub targets: Vec<HedgeTarget>,
    pub current_cost: Decimal,
    pub hedge_cost: Decimal,
    pub cost_after_hedge: Decimal,
    pub worst_case_payout: Decimal,
    pub expected_loss: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct CohortHedge {
    pub phase: HedgePhase,
    pub targets: Vec<HedgeTarget>,
    pub hedge_cost: Decimal,
    pub expected_loss: Decimal,
    pub started_at: Option<DateTime<Utc>>,
}

impl Default for CohortHedge {
    fn default() -> Self {
        Self {
            phase: HedgePhase::Idle,
            targets: Vec::new(),
            hedge_cost: Decimal::ZERO,
            expected_loss: Decimal::ZERO,
            started_at: None,
        }
    }
}

impl CohortHedge {
    fn all_done(&self) -> bool {
        self.targets.iter().all(HedgeTarget::is_done)
    }
}

pub struct HedgeController {
    config: HedgeConfig,
    min_order_notional: Decimal,
    cohorts: HashMap<Cohort, CohortHedge>,
}

impl HedgeController {
    pub fn new(config: HedgeConfig, min_order_notional: Decimal) -> Self {
        Self {
            config,
            min_order_notional,
            cohorts: HashMap::new(),
        }
    }

    pub fn phase(&self, cohort: Cohort) -> HedgePhase {
        self.cohorts
            .get(&cohort)
            .map(|h| h.phase)
            .unwrap_or(HedgePhase::Idle)
    }

    pub fn state(&self, cohort: Cohort) -> Option<&CohortHedge> {
        self.cohorts.get(&cohort)
    }

    /// Completed cohorts take no further trades until rollover.
    pub fn is_trading_suppressed(&self, cohort: Cohort) -> bool {
        self.phase(cohort) == HedgePhase::Completed
    }

    /// Freeze targets for `cohort`. Only the first call per cohort lifetime
    /// does anything.
    pub fn begin(
        &mut self,
        cohort: Cohort,
        ledger: &PositionLedger,
        markets: &[&Market],
        book: &QuoteBook,
        now: DateTime<Utc>,
    ) -> Option<HedgeEntry> {
        if self.phase(cohort) != HedgePhase::Idle {
            return None;
        }

        let aggregate = ledger.cohort_aggregate(cohort);
        let mut targets = Vec::new();
        let mut hedge_cost = Decimal::ZERO;
        let mut worst_case_payout = Decimal::ZERO;

        for (asset, holding) in &aggregate.per_asset {
            let imbalance = holding.imbalance();
            let mut up = holding.up_shares;
            let mut down = holding.down_shares;

            if !imbalance.is_zero() {
                let side = if imbalance > Decimal::ZERO { Side::Down } else { Side::Up };
                let target = imbalance.abs();
                let ask = current_ask(markets, asset, side, book, now).unwrap_or_else(|| {
                    warn!(%cohort, %asset, %side, "No ask for hedge estimate, assuming max price");
                    self.config.max_price
                });
                hedge_cost += target * ask;
                match side {
                    Side::Up => up += target,
                    Side::Down => down += target,
                }
                targets.push(HedgeTarget {
                    asset: asset.clone(),
                    side,
                    target,
                    filled: Decimal::ZERO,
                    cost: Decimal::ZERO,
                    dust: false,
                });
            }
            worst_case_payout += up.min(down);
        }

        let current_cost = aggregate.total_cost();
        let cost_after_hedge = current_cost + hedge_cost;
        let expected_loss = (cost_after_hedge - worst_case_payout).max(Decimal::ZERO);

        let mut state = CohortHedge {
            phase: HedgePhase::Hedging,
            targets: targets.clone(),
            hedge_cost: Decimal::ZERO,
            expected_loss,
            started_at: Some(now),
        };
        if state.all_done() {
            state.phase = HedgePhase::Completed;
        }

        info!(
            %cohort,
            targets = targets.len(),
            current_cost = %current_cost,
            hedge_cost = %hedge_cost,
            cost_after_hedge = %cost_after_hedge,
            worst_case_payout = %worst_case_payout,
            expected_loss = %expected_loss,
            phase = ?state.phase,
            "🛡️ [HEDGE] Targets frozen"
        );
        self.cohorts.insert(cohort, state);

        Some(HedgeEntry {
            cohort,
            targets,
            current_cost,
            hedge_cost,
            cost_after_hedge,
            worst_case_payout,
            expected_loss,
        })
    }

    /// Single-sided decisions for every open remainder.
    ///
    /// Marks dust remainders done and may complete the cohort.
    pub fn decisions(
        &mut self,
        cohort: Cohort,
        ledger: &PositionLedger,
        markets: &[&Market],
        book: &QuoteBook,
        now: DateTime<Utc>,
    ) -> Vec<Decision> {
        let max_price = self.config.max_price;
        let floor = self.min_order_notional;
        let Some(state) = self.cohorts.get_mut(&cohort) else {
            return Vec::new();
        };
        if state.phase != HedgePhase::Hedging {
            return Vec::new();
        }

        let aggregate = ledger.cohort_aggregate(cohort);
        let mut decisions = Vec::new();
        for target in state.targets.iter_mut().filter(|t| !t.is_done()) {
            let Some(market) = markets.iter().find(|m| m.asset == target.asset) else {
                continue;
            };
            let Some(quote) = book.read_at(market.token(target.side), now) else {
                continue;
            };
            if !quote.has_ask() || quote.best_ask > max_price {
                continue;
            }

            let remaining = floor_shares(target.remaining());
            if remaining * quote.best_ask < floor {
                info!(
                    %cohort,
                    asset = %target.asset,
                    side = %target.side,
                    remaining = %remaining,
                    "[HEDGE] Remainder below notional floor, treating as filled"
                );
                target.dust = true;
                continue;
            }

            let imbalance = aggregate
                .per_asset
                .get(&target.asset)
                .map(|a| a.imbalance())
                .unwrap_or(Decimal::ZERO);
            decisions.push(Decision::single(
                cohort,
                DecisionReason::Hedge,
                Leg {
                    market: (*market).clone(),
                    side: target.side,
                    ask: quote.best_ask,
                    ask_size: quote.ask_size,
                },
                remaining,
                imbalance,
                Decimal::ZERO,
            ));
        }

        Self::maybe_complete(cohort, state);
        decisions
    }

    /// Count a confirmed hedge fill against its target.
    pub fn record_hedge_fill(&mut self, cohort: Cohort, asset: &str, side: Side, shares: Decimal, cost: Decimal) {
        let Some(state) = self.cohorts.get_mut(&cohort) else {
            return;
        };
        if let Some(target) = state
            .targets
            .iter_mut()
            .find(|t| t.asset == asset && t.side == side)
        {
            target.filled += shares;
            target.cost += cost;
            state.hedge_cost += cost;
        }
        Self::maybe_complete(cohort, state);
    }

    fn maybe_complete(cohort: Cohort, state: &mut CohortHedge) {
        if state.phase == HedgePhase::Hedging && state.all_done() {
            state.phase = HedgePhase::Completed;
            info!(
                %cohort,
                hedge_cost = %state.hedge_cost,
                expected_loss = %state.expected_loss,
                "✅ [HEDGE] Hedge completed, cohort suppressed until rollover"
            );
        }
    }

    /// Back to idle on rollover.
    pub fn reset(&mut self, cohort: Cohort) {
        self.cohorts.remove(&cohort);
    }
}

fn current_ask(markets: &[&Market], asset: &str, side: Side, book: &QuoteBook, now: DateTime<Utc>) -> Option<Decimal> {
    let market = markets.iter().find(|m| m.asset == asset)?;
    let quote = book.read_at(market.token(side), now)?;
    quote.has_ask().then_some(quote.best_ask)
}
