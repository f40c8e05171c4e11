//! Execution coordinator: turns scanner and hedge decisions into FAK buys.
//!
//! Hazard controls run in a fixed order before anything is submitted:
//! notional floor, `(cohort, asset, side)` lock for single-sided same-pool
//! decisions, then the per-market cooldown. The legs of a `buy_both` go out
//! concurrently. Only fills the venue actually confirms are reconciled into
//! the ledger.

use crate::config::ExecutionConfig;
use crate::exchange::{OrderGateway, OrderRequest, OrderResponse};
use crate::ledger::{LedgerError, PositionLedger};
use crate::market::{Cohort, Market, Side};
use crate::strategy::locks::{LockKey, LockSet, MarketCooldowns};
use crate::strategy::scanner::{Decision, DecisionKind, DecisionReason, Leg, PoolKind};
use crate::utils::decimal::{floor_shares, round_to_tick, safe_div, TICK};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Why a decision or one of its legs produced no ledger change.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("{side} leg on {market}: notional {notional} below floor {floor}")]
    BelowFloor {
        market: String,
        side: Side,
        notional: Decimal,
        floor: Decimal,
    },
    #[error("lock {0} already held")]
    LockHeld(String),
    #[error("market {0} is cooling down")]
    Cooldown(String),
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("order on {0} killed without fill")]
    NoFill(String),
    #[error("implausible fill on {market}: {detail}")]
    InvariantViolation { market: String, detail: String },
    #[error("order transport failed: {0}")]
    Transport(String),
    #[error("execution batch timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ExecutionError {
    /// Counts toward the per-market malfunction streak. A killed FAK with
    /// no fill is ordinary thin liquidity and does not count.
    pub fn is_order_failure(&self) -> bool {
        matches!(
            self,
            ExecutionError::Rejected(_)
                | ExecutionError::Transport(_)
                | ExecutionError::InvariantViolation { .. }
        )
    }
}

/// Shares and cost the venue confirmed for one leg.
#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub market: Market,
    pub side: Side,
    pub order_id: Option<String>,
    pub requested: Decimal,
    pub limit_price: Decimal,
    pub shares: Decimal,
    pub cost: Decimal,
}

impl Fill {
    pub fn avg_price(&self) -> Decimal {
        safe_div(self.cost, self.shares)
    }
}

/// Outcome of one submitted leg.
#[derive(Debug)]
pub struct SliceResult {
    pub market: Market,
    pub side: Side,
    pub outcome: Result<Fill, ExecutionError>,
}

/// Everything submitted for one decision.
#[derive(Debug)]
pub struct ExecutionReport {
    pub cohort: Cohort,
    pub kind: DecisionKind,
    pub reason: DecisionReason,
    pub pool: PoolKind,
    pub quantity: Decimal,
    pub slices: Vec<SliceResult>,
}

impl ExecutionReport {
    pub fn fills(&self) -> impl Iterator<Item = &Fill> {
        self.slices.iter().filter_map(|s| s.outcome.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&SliceResult, &ExecutionError)> {
        self.slices
            .iter()
            .filter_map(|s| s.outcome.as_ref().err().map(|e| (s, e)))
    }

    pub fn fully_filled(&self) -> bool {
        !self.slices.is_empty() && self.slices.iter().all(|s| s.outcome.is_ok())
    }
}

/// Shared by every concurrent slice in a cycle.
pub struct ExecutionCoordinator {
    gateway: Arc<dyn OrderGateway>,
    config: ExecutionConfig,
    depth_utilization: Decimal,
    locks: Arc<LockSet>,
    cooldowns: MarketCooldowns,
}

impl ExecutionCoordinator {
    pub fn new(gateway: Arc<dyn OrderGateway>, config: ExecutionConfig, depth_utilization: Decimal) -> Self {
        let cooldowns = MarketCooldowns::new(config.market_cooldown_ms);
        Self {
            gateway,
            config,
            depth_utilization,
            locks: Arc::new(LockSet::new()),
            cooldowns,
        }
    }

    pub fn locks(&self) -> &Arc<LockSet> {
        &self.locks
    }

    pub fn cooldowns(&self) -> &MarketCooldowns {
        &self.cooldowns
    }

    /// Buy limit: ask plus tolerance, rounded to the tick, never above the ceiling.
    pub fn limit_price(&self, ask: Decimal) -> Decimal {
        let padded = round_to_tick(ask * (Decimal::ONE + self.config.price_tolerance), TICK);
        padded.min(self.config.max_limit_price)
    }

    /// Final per-leg quantity: decision size capped by depth and max notional.
    pub fn size(&self, decision: &Decision) -> Decimal {
        let legs: Vec<&Leg> = decision.legs().collect();
        let Some(min_depth) = legs.iter().map(|l| l.ask_size).min() else {
            return Decimal::ZERO;
        };
        let unit_cost: Decimal = legs.iter().map(|l| l.ask).sum();
        let depth_cap = min_depth * self.depth_utilization;
        let notional_cap = safe_div(self.config.max_order_notional, unit_cost);
        floor_shares(decision.quantity.min(depth_cap).min(notional_cap))
    }

    /// Run the hazard checks and submit every leg of `decision`.
    ///
    /// `Err` means nothing was submitted.
    pub async fn execute(&self, decision: &Decision, now: DateTime<Utc>) -> Result<ExecutionReport, ExecutionError> {
        let legs: Vec<&Leg> = decision.legs().collect();
        let quantity = self.size(decision);
        let Some(first) = legs.first().copied() else {
            return Ok(ExecutionReport {
                cohort: decision.cohort,
                kind: decision.kind,
                reason: decision.reason,
                pool: decision.pool,
                quantity,
                slices: Vec::new(),
            });
        };

        // Every leg must clear the floor before either is submitted
        for leg in &legs {
            let notional = quantity * leg.ask;
            if notional < self.config.min_order_notional {
                debug!(
                    cohort = %decision.cohort,
                    market = %leg.market.label,
                    side = %leg.side,
                    notional = %notional,
                    "Leg below notional floor, skipping decision"
                );
                return Err(ExecutionError::BelowFloor {
                    market: leg.market.label.clone(),
                    side: leg.side,
                    notional,
                    floor: self.config.min_order_notional,
                });
            }
        }

        let _guard = if decision.is_single_sided() && decision.pool == PoolKind::SamePool {
            let key = LockKey::new(decision.cohort, first.market.asset.clone(), first.side);
            match self.locks.guard(key.clone()) {
                Some(guard) => Some(guard),
                None => {
                    debug!(lock = %key, "Lock held, dropping decision this cycle");
                    return Err(ExecutionError::LockHeld(key.to_string()));
                }
            }
        } else {
            None
        };

        let mut market_ids: Vec<&str> = legs.iter().map(|l| l.market.condition_id.as_str()).collect();
        market_ids.dedup();
        if !self.cooldowns.try_begin_all(&market_ids, now) {
            let label = first.market.label.clone();
            debug!(market = %label, "Market cooling down, dropping decision");
            return Err(ExecutionError::Cooldown(label));
        }

        info!(
            cohort = %decision.cohort,
            kind = %decision.kind,
            reason = %decision.reason,
            quantity = %quantity,
            pool = ?decision.pool,
            "Submitting decision"
        );

        let slices = join_all(legs.iter().map(|leg| self.submit_leg(leg, quantity))).await;

        Ok(ExecutionReport {
            cohort: decision.cohort,
            kind: decision.kind,
            reason: decision.reason,
            pool: decision.pool,
            quantity,
            slices,
        })
    }

    async fn submit_leg(&self, leg: &Leg, quantity: Decimal) -> SliceResult {
        let limit_price = self.limit_price(leg.ask);
        let request = OrderRequest::fak_buy(leg.token_id(), quantity, limit_price);

        let outcome = match self.gateway.submit_order(&request).await {
            Ok(response) => extract_fill(&response, &leg.market, quantity).map(|(shares, cost)| Fill {
                market: leg.market.clone(),
                side: leg.side,
                order_id: response.order_id.clone(),
                requested: quantity,
                limit_price,
                shares,
                cost,
            }),
            Err(e) => Err(ExecutionError::Transport(format!("{:#}", e))),
        };

        match &outcome {
            Ok(fill) => info!(
                market = %leg.market.label,
                side = %leg.side,
                requested = %quantity,
                filled = %fill.shares,
                cost = %fill.cost,
                avg_price = %fill.avg_price(),
                "Leg filled"
            ),
            Err(e @ ExecutionError::InvariantViolation { .. }) => {
                error!(market = %leg.market.label, side = %leg.side, error = %e, "Fill rejected")
            }
            Err(e) => warn!(market = %leg.market.label, side = %leg.side, error = %e, "Leg failed"),
        }

        SliceResult {
            market: leg.market.clone(),
            side: leg.side,
            outcome,
        }
    }

    /// Write confirmed fills into the ledger. Returns the fills applied.
    pub fn reconcile(&self, report: &ExecutionReport, ledger: &mut PositionLedger, now: DateTime<Utc>) -> Vec<Fill> {
        let mut applied = Vec::new();
        for fill in report.fills() {
            match ledger.record_fill_at(&fill.market, fill.side, fill.shares, fill.cost, now) {
                Ok(_) => applied.push(fill.clone()),
                Err(e) => error!(
                    market = %fill.market.label,
                    side = %fill.side,
                    error = %e,
                    "Ledger refused fill"
                ),
            }
        }

        if report.kind == DecisionKind::BuyBoth && applied.len() == 1 {
            warn!(
                cohort = %report.cohort,
                filled_side = %applied[0].side,
                "Only one leg of a pair filled, cohort now imbalanced"
            );
        }
        applied
    }
}

/// Actual shares and cost from a venue response.
///
/// Per-fill records win over the aggregate matched amounts.
pub fn extract_fill(
    response: &OrderResponse,
    market: &Market,
    requested: Decimal,
) -> Result<(Decimal, Decimal), ExecutionError> {
    if !response.success {
        let reason = response
            .error_msg
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        return Err(ExecutionError::Rejected(reason));
    }

    let (shares, cost) = if response.fills.is_empty() {
        (
            response.taking_amount.unwrap_or(Decimal::ZERO),
            response.making_amount.unwrap_or(Decimal::ZERO),
        )
    } else {
        response.fills.iter().fold((Decimal::ZERO, Decimal::ZERO), |(s, c), f| {
            (s + f.size, c + f.size * f.price)
        })
    };

    let violation = |detail: String| ExecutionError::InvariantViolation {
        market: market.label.clone(),
        detail,
    };

    if shares < Decimal::ZERO || cost < Decimal::ZERO {
        return Err(violation(format!("negative amounts: shares {} cost {}", shares, cost)));
    }
    if shares.is_zero() {
        return Err(ExecutionError::NoFill(market.label.clone()));
    }
    if shares > requested {
        return Err(violation(format!("filled {} of {} requested", shares, requested)));
    }
    if cost / shares > Decimal::ONE {
        return Err(violation(format!("average price {} above 1", cost / shares)));
    }
    Ok((shares, cost))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::traits::MockOrderGateway;
    use crate::exchange::{MockVenue, TradeFill};
    use crate::market::QuoteBook;
    use crate::strategy::scanner::tests::{quote, test_market};
    use rust_decimal_macros::dec;

    fn config() -> ExecutionConfig {
        ExecutionConfig {
            max_order_notional: dec!(100),
            min_order_notional: dec!(1),
            price_tolerance: dec!(0.02),
            max_limit_price: dec!(0.99),
            market_cooldown_ms: 3000,
        }
    }

    fn leg(market: &Market, side: Side, ask: Decimal, size: Decimal) -> Leg {
        Leg {
            market: market.clone(),
            side,
            ask,
            ask_size: size,
        }
    }

    fn pair(market: &Market, quantity: Decimal) -> Decision {
        Decision {
            cohort: Cohort::FifteenMin,
            kind: DecisionKind::BuyBoth,
            reason: DecisionReason::OpenArbitrage,
            quantity,
            up: Some(leg(market, Side::Up, dec!(0.40), dec!(100))),
            down: Some(leg(market, Side::Down, dec!(0.45), dec!(100))),
            pool: PoolKind::SamePool,
            imbalance: Decimal::ZERO,
            predicted_profit: dec!(15),
        }
    }

    fn rebalance(market: &Market, quantity: Decimal) -> Decision {
        Decision::single(
            Cohort::FifteenMin,
            DecisionReason::Rebalance,
            leg(market, Side::Down, dec!(0.30), dec!(40)),
            quantity,
            dec!(30),
            dec!(12),
        )
    }

    fn filled(shares: Decimal, price: Decimal) -> OrderResponse {
        OrderResponse {
            success: true,
            error_msg: None,
            order_id: Some("o-1".to_string()),
            status: Some("matched".to_string()),
            making_amount: Some(shares * price),
            taking_amount: Some(shares),
            fills: Vec::new(),
        }
    }

    fn coordinator(mock: MockOrderGateway) -> ExecutionCoordinator {
        ExecutionCoordinator::new(Arc::new(mock), config(), Decimal::ONE)
    }

    #[test]
    fn test_limit_price() {
        let c = coordinator(MockOrderGateway::new());
        assert_eq!(c.limit_price(dec!(0.40)), dec!(0.41));
        assert_eq!(c.limit_price(dec!(0.30)), dec!(0.31));
        assert_eq!(c.limit_price(dec!(0.98)), dec!(0.99));
    }

    #[test]
    fn test_size_caps_by_notional() {
        let c = coordinator(MockOrderGateway::new());
        let m = test_market("c1", "btc");
        let mut deep = pair(&m, dec!(500));
        deep.up.as_mut().unwrap().ask_size = dec!(1000);
        deep.down.as_mut().unwrap().ask_size = dec!(1000);
        // 100 / 0.85
        assert_eq!(c.size(&deep), dec!(117.64));
    }

    #[test]
    fn test_size_caps_by_depth() {
        let c = coordinator(MockOrderGateway::new());
        let m = test_market("c1", "btc");
        // Both asks show 100, below the 117.64 notional cap
        assert_eq!(c.size(&pair(&m, dec!(500))), dec!(100));

        let mut thin = pair(&m, dec!(100));
        thin.down.as_mut().unwrap().ask_size = dec!(20);
        assert_eq!(c.size(&thin), dec!(20));
    }

    #[tokio::test]
    async fn test_buy_both_reconciles_both_legs() {
        let mut mock = MockOrderGateway::new();
        mock.expect_submit_order()
            .times(2)
            .returning(|order| {
                assert_eq!(order.size, dec!(100));
                let ask = if order.token_id.ends_with("-up") { dec!(0.40) } else { dec!(0.45) };
                Ok(filled(order.size, ask))
            });
        let wide = ExecutionConfig {
            max_order_notional: dec!(1000),
            ..config()
        };
        let c = ExecutionCoordinator::new(Arc::new(mock), wide, Decimal::ONE);
        let m = test_market("c1", "btc");
        let now = Utc::now();

        let mut decision = pair(&m, dec!(100));
        decision.up.as_mut().unwrap().ask_size = dec!(200);
        decision.down.as_mut().unwrap().ask_size = dec!(200);

        let report = c.execute(&decision, now).await.unwrap();
        assert!(report.fully_filled());

        let mut ledger = PositionLedger::new();
        let applied = c.reconcile(&report, &mut ledger, now);
        assert_eq!(applied.len(), 2);

        let pos = ledger.get("c1").unwrap();
        assert_eq!(pos.up_shares, dec!(100));
        assert_eq!(pos.up_cost, dec!(40));
        assert_eq!(pos.down_shares, dec!(100));
        assert_eq!(pos.down_cost, dec!(45));
    }

    #[tokio::test]
    async fn test_below_floor_submits_nothing() {
        let mut mock = MockOrderGateway::new();
        mock.expect_submit_order().times(0);
        let c = coordinator(mock);
        let m = test_market("c1", "btc");

        // Up leg: 2 × 0.40 = 0.80 < 1, so the Down leg is not sent either
        let err = c.execute(&pair(&m, dec!(2)), Utc::now()).await.unwrap_err();
        assert!(matches!(err, ExecutionError::BelowFloor { side: Side::Up, .. }));
    }

    #[tokio::test]
    async fn test_lock_checked_before_cooldown() {
        let mut mock = MockOrderGateway::new();
        mock.expect_submit_order().times(0);
        let c = coordinator(mock);
        let m = test_market("c1", "btc");
        let now = Utc::now();

        c.cooldowns().try_begin("c1", now);
        let _held = c
            .locks()
            .guard(LockKey::new(Cohort::FifteenMin, "btc", Side::Down))
            .unwrap();

        let err = c.execute(&rebalance(&m, dec!(30)), now).await.unwrap_err();
        assert!(matches!(err, ExecutionError::LockHeld(ref k) if k == "15min-btc-down"));
    }

    #[tokio::test]
    async fn test_cooldown_blocks_repeat_submission() {
        let mut mock = MockOrderGateway::new();
        mock.expect_submit_order()
            .times(1)
            .returning(|order| Ok(filled(order.size, dec!(0.30))));
        let c = coordinator(mock);
        let m = test_market("c1", "btc");
        let now = Utc::now();

        let report = c.execute(&rebalance(&m, dec!(30)), now).await.unwrap();
        assert!(report.fully_filled());
        // Lock released by the guard
        assert_eq!(c.locks().held_count(), 0);

        let err = c
            .execute(&rebalance(&m, dec!(30)), now + chrono::Duration::seconds(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Cooldown(_)));
    }

    #[tokio::test]
    async fn test_zero_fill_is_not_a_malfunction() {
        let mut mock = MockOrderGateway::new();
        mock.expect_submit_order()
            .returning(|_| Ok(filled(Decimal::ZERO, dec!(0.30))));
        let c = coordinator(mock);
        let m = test_market("c1", "btc");

        let report = c.execute(&rebalance(&m, dec!(30)), Utc::now()).await.unwrap();
        let (_, err) = report.failures().next().unwrap();
        assert!(matches!(err, ExecutionError::NoFill(_)));
        assert!(!err.is_order_failure());

        let mut ledger = PositionLedger::new();
        assert!(c.reconcile(&report, &mut ledger, Utc::now()).is_empty());
        assert!(ledger.get("c1").is_none());
    }

    #[tokio::test]
    async fn test_overfill_is_never_applied() {
        let mut mock = MockOrderGateway::new();
        mock.expect_submit_order()
            .returning(|_| Ok(filled(dec!(60), dec!(0.30))));
        let c = coordinator(mock);
        let m = test_market("c1", "btc");

        let report = c.execute(&rebalance(&m, dec!(30)), Utc::now()).await.unwrap();
        let mut ledger = PositionLedger::new();
        assert!(c.reconcile(&report, &mut ledger, Utc::now()).is_empty());
        assert!(matches!(
            report.slices[0].outcome,
            Err(ExecutionError::InvariantViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_venue_rejection_and_transport_error() {
        let mut mock = MockOrderGateway::new();
        let mut calls = 0;
        mock.expect_submit_order().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Ok(OrderResponse::rejected("not enough balance"))
            } else {
                Err(anyhow::anyhow!("connection reset"))
            }
        });
        let c = coordinator(mock);
        let m = test_market("c1", "btc");
        let now = Utc::now();

        let report = c.execute(&pair(&m, dec!(100)), now).await.unwrap();
        let errors: Vec<_> = report.failures().map(|(_, e)| e.to_string()).collect();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("not enough balance")));
        assert!(errors.iter().any(|e| e.contains("connection reset")));
    }

    #[test]
    fn test_extract_fill_prefers_fill_records() {
        let m = test_market("c1", "btc");
        let response = OrderResponse {
            fills: vec![
                TradeFill { price: dec!(0.40), size: dec!(10) },
                TradeFill { price: dec!(0.41), size: dec!(5) },
            ],
            ..filled(dec!(99), dec!(0.5))
        };
        let (shares, cost) = extract_fill(&response, &m, dec!(20)).unwrap();
        assert_eq!(shares, dec!(15));
        assert_eq!(cost, dec!(6.05));
    }

    #[test]
    fn test_extract_fill_rejects_price_above_one() {
        let m = test_market("c1", "btc");
        let response = OrderResponse {
            making_amount: Some(dec!(12)),
            taking_amount: Some(dec!(10)),
            ..filled(dec!(10), dec!(0.5))
        };
        assert!(matches!(
            extract_fill(&response, &m, dec!(10)),
            Err(ExecutionError::InvariantViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_partial_fill_against_paper_venue() {
        let book = Arc::new(QuoteBook::default());
        let m = test_market("c1", "btc");
        let now = Utc::now();
        quote(&book, "c1-up", dec!(0.40), dec!(100), now);
        quote(&book, "c1-down", dec!(0.45), dec!(100), now);
        let venue = Arc::new(MockVenue::new(Arc::clone(&book), dec!(1000)));

        let c = ExecutionCoordinator::new(venue.clone(), config(), Decimal::ONE);
        let report = c.execute(&pair(&m, dec!(100)), now).await.unwrap();

        assert_eq!(report.quantity, dec!(100));
        let mut ledger = PositionLedger::new();
        c.reconcile(&report, &mut ledger, now);
        let pos = ledger.get("c1").unwrap();
        assert_eq!(pos.up_shares, pos.down_shares);
        assert_eq!(pos.total_cost(), pos.up_shares * dec!(0.85));
        assert_eq!(venue.account().await.fill_count, 2);
    }
}
