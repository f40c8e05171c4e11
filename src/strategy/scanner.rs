//! Opportunity scanner: cheapest Up and cheapest Down across a cohort.
//!
//! Every market in a cohort settles at the same instant, so an Up share from
//! one market and a Down share from another still pay exactly $1 per matched
//! pair when the two underlyings move together. The scanner looks at the
//! whole cohort, picks the cheapest fresh ask on each side and emits at most
//! one decision per cohort per cycle.

use crate::config::ScannerConfig;
use crate::ledger::{CostAnalysis, PositionLedger};
use crate::market::{Cohort, Market, QuoteBook, Side};
use crate::utils::decimal::{floor_shares, profit_pct, safe_div};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, trace};

/// Asks at or below this are treated as placeholder quotes.
const MIN_ASK_PRICE: Decimal = dec!(0.01);
/// Levels thinner than one share are ignored.
const MIN_ASK_SIZE: Decimal = dec!(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    BuyBoth,
    BuyUpOnly,
    BuyDownOnly,
    Wait,
}

impl DecisionKind {
    pub fn single(side: Side) -> Self {
        match side {
            Side::Up => DecisionKind::BuyUpOnly,
            Side::Down => DecisionKind::BuyDownOnly,
        }
    }
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecisionKind::BuyBoth => "buy_both",
            DecisionKind::BuyUpOnly => "buy_up_only",
            DecisionKind::BuyDownOnly => "buy_down_only",
            DecisionKind::Wait => "wait",
        };
        f.write_str(s)
    }
}

/// Whether the two legs come from the same market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    SamePool,
    CrossPool,
}

/// Which rule produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// First matched pairs in an empty cohort
    OpenArbitrage,
    /// More matched pairs while the blended cost stays below threshold
    AddArbitrage,
    /// Top up the short side of an imbalanced cohort
    Rebalance,
    /// Loss-capping purchase after the risk monitor fired
    Hedge,
    /// Nothing worth buying this cycle
    NoOpportunity,
}

/// One side of a decision: the market and the quote it was priced from.
#[derive(Debug, Clone, PartialEq)]
pub struct Leg {
    pub market: Market,
    pub side: Side,
    pub ask: Decimal,
    pub ask_size: Decimal,
}

impl Leg {
    pub fn token_id(&self) -> &str {
        self.market.token(self.side)
    }
}

/// A trade the executor should attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub cohort: Cohort,
    pub kind: DecisionKind,
    pub reason: DecisionReason,
    /// Shares per leg
    pub quantity: Decimal,
    pub up: Option<Leg>,
    pub down: Option<Leg>,
    pub pool: PoolKind,
    /// Cohort Up minus Down before the trade
    pub imbalance: Decimal,
    /// Guaranteed payout minus cost after the trade
    pub predicted_profit: Decimal,
}

impl Decision {
    /// Single-sided decision for one leg.
    pub fn single(
        cohort: Cohort,
        reason: DecisionReason,
        leg: Leg,
        quantity: Decimal,
        imbalance: Decimal,
        predicted_profit: Decimal,
    ) -> Self {
        let kind = DecisionKind::single(leg.side);
        let (up, down) = match leg.side {
            Side::Up => (Some(leg), None),
            Side::Down => (None, Some(leg)),
        };
        Self {
            cohort,
            kind,
            reason,
            quantity,
            up,
            down,
            pool: PoolKind::SamePool,
            imbalance,
            predicted_profit,
        }
    }

    /// Legs in Up, Down order.
    pub fn legs(&self) -> impl Iterator<Item = &Leg> {
        self.up.iter().chain(self.down.iter())
    }

    pub fn is_single_sided(&self) -> bool {
        matches!(self.kind, DecisionKind::BuyUpOnly | DecisionKind::BuyDownOnly)
    }
}

/// Everything the scanner saw for one cohort this cycle.
#[derive(Debug, Clone)]
pub struct CohortScan {
    pub cohort: Cohort,
    pub expiry: DateTime<Utc>,
    pub best_up: Option<Leg>,
    pub best_down: Option<Leg>,
    /// Up ask plus Down ask, when both sides are quoted
    pub combined_cost: Option<Decimal>,
    pub is_real_arbitrage: bool,
    pub decision: Decision,
    /// A decision was found but suppressed by the cohort cooldown
    pub cooled_down: bool,
}

/// Finds profitable or risk-reducing trades per cohort.
pub struct OpportunityScanner {
    config: ScannerConfig,
    max_order_notional: Decimal,
    cooldown: chrono::Duration,
    last_acted: HashMap<Cohort, DateTime<Utc>>,
}

impl OpportunityScanner {
    pub fn new(config: ScannerConfig, max_order_notional: Decimal) -> Self {
        let cooldown = chrono::Duration::milliseconds(config.cohort_cooldown_ms as i64);
        Self {
            config,
            max_order_notional,
            cooldown,
            last_acted: HashMap::new(),
        }
    }

    /// Start the cohort cooldown after dispatching one of its decisions.
    pub fn mark_acted(&mut self, cohort: Cohort, now: DateTime<Utc>) {
        self.last_acted.insert(cohort, now);
    }

    pub fn in_cooldown(&self, cohort: Cohort, now: DateTime<Utc>) -> bool {
        self.last_acted
            .get(&cohort)
            .is_some_and(|at| now - *at < self.cooldown)
    }

    /// Forget cooldown state for a cohort that rolled.
    pub fn reset(&mut self, cohort: Cohort) {
        self.last_acted.remove(&cohort);
    }

    /// Scan one cohort. Returns `None` when the cohort has no markets.
    pub fn scan_cohort(
        &self,
        cohort: Cohort,
        markets: &[&Market],
        book: &QuoteBook,
        ledger: &PositionLedger,
        now: DateTime<Utc>,
    ) -> Option<CohortScan> {
        let expiry = markets.iter().map(|m| m.expiry).min()?;

        let best_up = cheapest_leg(markets, Side::Up, book, now);
        let best_down = cheapest_leg(markets, Side::Down, book, now);

        let (up, down) = match (&best_up, &best_down) {
            (Some(up), Some(down)) => (up, down),
            _ => {
                let missing = match (&best_up, &best_down) {
                    (None, None) => "up+down",
                    (None, Some(_)) => "up",
                    _ => "down",
                };
                trace!(%cohort, missing, "No fresh ask, skipping cohort");
                return Some(CohortScan {
                    cohort,
                    expiry,
                    best_up,
                    best_down,
                    combined_cost: None,
                    is_real_arbitrage: false,
                    decision: wait(cohort),
                    cooled_down: false,
                });
            }
        };

        let combined = up.ask + down.ask;
        let is_real_arbitrage = combined < self.config.arbitrage_threshold;
        let decision = self.decide(cohort, up, down, combined, is_real_arbitrage, ledger);

        let cooled_down = decision.kind != DecisionKind::Wait && self.in_cooldown(cohort, now);
        let decision = if cooled_down {
            trace!(%cohort, kind = %decision.kind, "Cohort cooling down, decision suppressed");
            wait(cohort)
        } else {
            decision
        };

        Some(CohortScan {
            cohort,
            expiry,
            combined_cost: Some(combined),
            is_real_arbitrage,
            decision,
            cooled_down,
            best_up,
            best_down,
        })
    }

    fn decide(
        &self,
        cohort: Cohort,
        up: &Leg,
        down: &Leg,
        combined: Decimal,
        is_real_arbitrage: bool,
        ledger: &PositionLedger,
    ) -> Decision {
        let aggregate = ledger.cohort_aggregate(cohort);
        let imbalance = aggregate.imbalance();
        let pool = if up.market.condition_id == down.market.condition_id {
            PoolKind::SamePool
        } else {
            PoolKind::CrossPool
        };

        // Rules 1 and 2: matched pairs
        if is_real_arbitrage {
            let quantity = self.pair_quantity(up, down, combined);
            if quantity > Decimal::ZERO {
                let predicted =
                    ledger.predict_cohort_after_buy(cohort, quantity, up.ask, quantity, down.ask);

                let reason = if !aggregate.has_position() {
                    let pct = profit_pct(combined);
                    (pct >= self.config.min_profit_pct).then_some(DecisionReason::OpenArbitrage)
                } else {
                    (predicted.avg_cost_per_pair < self.config.arbitrage_threshold)
                        .then_some(DecisionReason::AddArbitrage)
                };

                if let Some(reason) = reason {
                    debug!(
                        %cohort,
                        %reason,
                        combined = %combined,
                        quantity = %quantity,
                        predicted_profit = %predicted.current_profit,
                        "Arbitrage found"
                    );
                    return Decision {
                        cohort,
                        kind: DecisionKind::BuyBoth,
                        reason,
                        quantity,
                        up: Some(up.clone()),
                        down: Some(down.clone()),
                        pool,
                        imbalance,
                        predicted_profit: predicted.current_profit,
                    };
                }
            }
        }

        // Rule 3: rebalance the short side
        if aggregate.has_position() && imbalance.abs() > self.config.noise_floor {
            let leg = if imbalance < Decimal::ZERO { up } else { down };
            if leg.ask < self.config.rebalance_price_ceiling {
                let quantity = self.single_quantity(leg, imbalance.abs());
                if quantity > Decimal::ZERO {
                    let predicted = predict_single(ledger, cohort, leg, quantity);
                    if predicted.avg_cost_per_pair < self.config.arbitrage_threshold {
                        debug!(
                            %cohort,
                            side = %leg.side,
                            ask = %leg.ask,
                            quantity = %quantity,
                            imbalance = %imbalance,
                            "Rebalance found"
                        );
                        return Decision::single(
                            cohort,
                            DecisionReason::Rebalance,
                            leg.clone(),
                            quantity,
                            imbalance,
                            predicted.current_profit,
                        );
                    }
                }
            }
        }

        wait(cohort)
    }

    /// Matched quantity for a pair: depth-limited, notional-capped, floored.
    fn pair_quantity(&self, up: &Leg, down: &Leg, combined: Decimal) -> Decimal {
        let depth = up.ask_size.min(down.ask_size) * self.config.depth_utilization;
        let cap = safe_div(self.max_order_notional, combined);
        floor_shares(depth.min(cap))
    }

    /// Quantity for one leg, never more than `limit`.
    fn single_quantity(&self, leg: &Leg, limit: Decimal) -> Decimal {
        let depth = leg.ask_size * self.config.depth_utilization;
        let cap = safe_div(self.max_order_notional, leg.ask);
        floor_shares(depth.min(limit).min(cap))
    }
}

fn wait(cohort: Cohort) -> Decision {
    Decision {
        cohort,
        kind: DecisionKind::Wait,
        reason: DecisionReason::NoOpportunity,
        quantity: Decimal::ZERO,
        up: None,
        down: None,
        pool: PoolKind::SamePool,
        imbalance: Decimal::ZERO,
        predicted_profit: Decimal::ZERO,
    }
}

fn predict_single(ledger: &PositionLedger, cohort: Cohort, leg: &Leg, quantity: Decimal) -> CostAnalysis {
    match leg.side {
        Side::Up => ledger.predict_cohort_after_buy(cohort, quantity, leg.ask, Decimal::ZERO, Decimal::ZERO),
        Side::Down => ledger.predict_cohort_after_buy(cohort, Decimal::ZERO, Decimal::ZERO, quantity, leg.ask),
    }
}

/// Lowest usable fresh ask for one side across the cohort; first seen wins ties.
fn cheapest_leg(markets: &[&Market], side: Side, book: &QuoteBook, now: DateTime<Utc>) -> Option<Leg> {
    let mut best: Option<Leg> = None;
    for market in markets {
        let Some(quote) = book.read_at(market.token(side), now) else {
            continue;
        };
        if quote.best_ask <= MIN_ASK_PRICE || quote.ask_size < MIN_ASK_SIZE {
            continue;
        }
        if best.as_ref().is_some_and(|b| quote.best_ask >= b.ask) {
            continue;
        }
        best = Some(Leg {
            market: (*market).clone(),
            side,
            ask: quote.best_ask,
            ask_size: quote.ask_size,
        });
    }
    best
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecisionReason::OpenArbitrage => "open",
            DecisionReason::AddArbitrage => "add",
            DecisionReason::Rebalance => "rebalance",
            DecisionReason::Hedge => "hedge",
            DecisionReason::NoOpportunity => "none",
        };
        f.write_str(s)
    }
}
