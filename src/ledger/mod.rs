//! Position ledger: shares and cost basis per market, cohort views and
//! settlement accounting.
//!
//! The ledger is owned by the engine loop and mutated only by fill
//! reconciliation and settlement. Shares and costs never go negative: a
//! fill that would break that is rejected before anything is applied.

mod position;
mod settlement;

pub use position::{AssetAggregate, CohortAggregate, CostAnalysis, Position};
pub use settlement::{SettlementObserver, SettlementRecord};

use crate::market::{Cohort, Market, Side};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Ledger invariant violations.
#[derive(Debug, Error, PartialEq)]
pub enum LedgerError {
    #[error("fill for {condition_id} has non-positive shares {shares}")]
    NonPositiveShares { condition_id: String, shares: Decimal },
    #[error("fill for {condition_id} has negative cost {cost}")]
    NegativeCost { condition_id: String, cost: Decimal },
    #[error("no position for {0}")]
    UnknownPosition(String),
}

/// Position book with cohort aggregation and settlement history.
#[derive(Default)]
pub struct PositionLedger {
    /// Live positions, keyed by condition id
    positions: HashMap<String, Position>,
    /// Rolled out of the live book, waiting for an outcome
    awaiting: HashMap<String, Position>,
    settlements: Vec<SettlementRecord>,
    observers: Vec<Arc<dyn SettlementObserver>>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted state.
    pub fn restore(
        live: Vec<Position>,
        awaiting: Vec<Position>,
        settlements: Vec<SettlementRecord>,
    ) -> Self {
        Self {
            positions: live
                .into_iter()
                .map(|p| (p.condition_id.clone(), p))
                .collect(),
            awaiting: awaiting
                .into_iter()
                .map(|p| (p.condition_id.clone(), p))
                .collect(),
            settlements,
            observers: Vec::new(),
        }
    }

    pub fn add_observer(&mut self, observer: Arc<dyn SettlementObserver>) {
        self.observers.push(observer);
    }

    /// Apply a confirmed fill.
    pub fn record_fill(
        &mut self,
        market: &Market,
        side: Side,
        shares: Decimal,
        cost: Decimal,
    ) -> Result<&Position, LedgerError> {
        self.record_fill_at(market, side, shares, cost, Utc::now())
    }

    pub fn record_fill_at(
        &mut self,
        market: &Market,
        side: Side,
        shares: Decimal,
        cost: Decimal,
        now: DateTime<Utc>,
    ) -> Result<&Position, LedgerError> {
        if shares <= Decimal::ZERO {
            return Err(LedgerError::NonPositiveShares {
                condition_id: market.condition_id.clone(),
                shares,
            });
        }
        if cost < Decimal::ZERO {
            return Err(LedgerError::NegativeCost {
                condition_id: market.condition_id.clone(),
                cost,
            });
        }

        let position = self
            .positions
            .entry(market.condition_id.clone())
            .or_insert_with(|| Position::open(market, now));
        position.add(side, shares, cost, now);

        debug!(
            market = %market.label,
            %side,
            shares = %shares,
            cost = %cost,
            up = %position.up_shares,
            down = %position.down_shares,
            "Fill recorded"
        );
        Ok(&*position)
    }

    pub fn get(&self, condition_id: &str) -> Option<&Position> {
        self.positions.get(condition_id)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn awaiting_settlement(&self) -> impl Iterator<Item = &Position> {
        self.awaiting.values()
    }

    pub fn settlements(&self) -> &[SettlementRecord] {
        &self.settlements
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.settlements.iter().map(|s| s.profit).sum()
    }

    /// Up minus Down for one market; zero when there is no position.
    pub fn imbalance(&self, condition_id: &str) -> Decimal {
        self.positions
            .get(condition_id)
            .map(Position::imbalance)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn cost_analysis(&self, condition_id: &str) -> CostAnalysis {
        self.predict_after_buy(condition_id, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO)
    }

    /// Cost analysis as if the given buys had filled. Never mutates.
    pub fn predict_after_buy(
        &self,
        condition_id: &str,
        buy_up: Decimal,
        up_price: Decimal,
        buy_down: Decimal,
        down_price: Decimal,
    ) -> CostAnalysis {
        let (up, down, cost) = self
            .positions
            .get(condition_id)
            .map(|p| (p.up_shares, p.down_shares, p.total_cost()))
            .unwrap_or((Decimal::ZERO, Decimal::ZERO, Decimal::ZERO));

        CostAnalysis::from_totals(
            up + buy_up,
            down + buy_down,
            cost + buy_up * up_price + buy_down * down_price,
        )
    }

    pub fn cohort_aggregate(&self, cohort: Cohort) -> CohortAggregate {
        CohortAggregate::from_positions(cohort, self.positions.values())
    }

    pub fn asset_aggregate(&self, cohort: Cohort, asset: &str) -> AssetAggregate {
        self.cohort_aggregate(cohort)
            .per_asset
            .remove(asset)
            .unwrap_or_default()
    }

    pub fn cohort_analysis(&self, cohort: Cohort) -> CostAnalysis {
        self.cohort_aggregate(cohort).analysis()
    }

    /// Cohort-level cost analysis as if the given buys had filled.
    pub fn predict_cohort_after_buy(
        &self,
        cohort: Cohort,
        buy_up: Decimal,
        up_price: Decimal,
        buy_down: Decimal,
        down_price: Decimal,
    ) -> CostAnalysis {
        let aggregate = self.cohort_aggregate(cohort);
        CostAnalysis::from_totals(
            aggregate.up_shares + buy_up,
            aggregate.down_shares + buy_down,
            aggregate.total_cost() + buy_up * up_price + buy_down * down_price,
        )
    }

    /// Close a position with its outcome and append the settlement record.
    ///
    /// Looks in the awaiting set first, then the live book.
    pub fn settle(
        &mut self,
        condition_id: &str,
        outcome: Side,
        now: DateTime<Utc>,
    ) -> Result<SettlementRecord, LedgerError> {
        let position = self
            .awaiting
            .remove(condition_id)
            .or_else(|| self.positions.remove(condition_id))
            .ok_or_else(|| LedgerError::UnknownPosition(condition_id.to_string()))?;

        let record = SettlementRecord::from_position(&position, outcome, now);
        info!(
            market = %record.label,
            outcome = %record.outcome,
            payout = %record.payout,
            cost = %record.total_cost,
            profit = %record.profit,
            "💰 Position settled"
        );

        self.settlements.push(record.clone());
        for observer in &self.observers {
            observer.on_settlement(&record);
        }
        Ok(record)
    }

    /// Move every live position of `cohort` expiring at or before `boundary`
    /// into the awaiting-settlement set. Empty ones are dropped. Returns the
    /// condition ids taken out of the live book.
    pub fn roll_cohort(&mut self, cohort: Cohort, boundary: DateTime<Utc>) -> Vec<String> {
        let rolled: Vec<String> = self
            .positions
            .values()
            .filter(|p| p.cohort == cohort && p.expiry <= boundary)
            .map(|p| p.condition_id.clone())
            .collect();

        for id in &rolled {
            if let Some(position) = self.positions.remove(id) {
                if position.is_empty() {
                    continue;
                }
                self.awaiting.insert(id.clone(), position);
            }
        }

        if !rolled.is_empty() {
            info!(%cohort, count = rolled.len(), "Positions moved to awaiting settlement");
        }
        rolled
    }

    /// Drop all-zero positions. Returns how many were removed.
    pub fn purge_empty(&mut self) -> usize {
        let before = self.positions.len();
        self.positions.retain(|_, p| !p.is_empty());
        before - self.positions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    fn market(id: &str, asset: &str, cohort: Cohort) -> Market {
        Market {
            condition_id: id.to_string(),
            label: format!("{}-updown", asset),
            asset: asset.to_string(),
            expiry: Utc.timestamp_opt(1_768_534_200, 0).unwrap(),
            up_token: format!("{}-up", id),
            down_token: format!("{}-down", id),
            cohort,
        }
    }

    #[test]
    fn test_record_fill_accumulates() {
        let mut ledger = PositionLedger::new();
        let m = market("c1", "btc", Cohort::FifteenMin);

        ledger.record_fill(&m, Side::Up, dec!(10), dec!(4)).unwrap();
        ledger.record_fill(&m, Side::Up, dec!(5), dec!(2.1)).unwrap();
        ledger.record_fill(&m, Side::Down, dec!(8), dec!(3.6)).unwrap();

        let p = ledger.get("c1").unwrap();
        assert_eq!(p.up_shares, dec!(15));
        assert_eq!(p.up_cost, dec!(6.1));
        assert_eq!(p.down_shares, dec!(8));
        assert_eq!(ledger.imbalance("c1"), dec!(7));
        assert_eq!(ledger.imbalance("missing"), Decimal::ZERO);
    }

    #[test]
    fn test_invalid_fills_are_rejected() {
        let mut ledger = PositionLedger::new();
        let m = market("c1", "btc", Cohort::FifteenMin);

        assert!(matches!(
            ledger.record_fill(&m, Side::Up, Decimal::ZERO, dec!(1)),
            Err(LedgerError::NonPositiveShares { .. })
        ));
        assert!(matches!(
            ledger.record_fill(&m, Side::Up, dec!(-3), dec!(1)),
            Err(LedgerError::NonPositiveShares { .. })
        ));
        assert!(matches!(
            ledger.record_fill(&m, Side::Down, dec!(3), dec!(-1)),
            Err(LedgerError::NegativeCost { .. })
        ));
        assert!(ledger.get("c1").is_none());
    }

    #[test]
    fn test_predict_after_buy_is_pure() {
        let mut ledger = PositionLedger::new();
        let m = market("c1", "btc", Cohort::FifteenMin);
        ledger.record_fill(&m, Side::Up, dec!(80), dec!(36)).unwrap();
        ledger.record_fill(&m, Side::Down, dec!(50), dec!(22.5)).unwrap();
        let before = ledger.get("c1").cloned();

        let predicted = ledger.predict_after_buy("c1", Decimal::ZERO, Decimal::ZERO, dec!(30), dec!(0.30));
        assert_eq!(predicted.min_shares, dec!(80));
        assert_eq!(predicted.total_cost, dec!(67.5));
        assert!(predicted.avg_cost_per_pair < dec!(0.995));

        assert_eq!(ledger.get("c1").cloned(), before);
        assert_eq!(ledger.cost_analysis("c1").min_shares, dec!(50));
    }

    #[test]
    fn test_cohort_aggregate_with_per_asset_breakdown() {
        let mut ledger = PositionLedger::new();
        let btc = market("c1", "btc", Cohort::FifteenMin);
        let eth = market("c2", "eth", Cohort::FifteenMin);
        let hourly = market("c3", "btc", Cohort::Hourly);

        ledger.record_fill(&btc, Side::Up, dec!(100), dec!(40)).unwrap();
        ledger.record_fill(&eth, Side::Down, dec!(100), dec!(45)).unwrap();
        ledger.record_fill(&hourly, Side::Up, dec!(7), dec!(3)).unwrap();

        let agg = ledger.cohort_aggregate(Cohort::FifteenMin);
        assert_eq!(agg.up_shares, dec!(100));
        assert_eq!(agg.down_shares, dec!(100));
        assert_eq!(agg.total_cost(), dec!(85));
        assert_eq!(agg.positions, 2);
        assert_eq!(agg.per_asset["btc"].up_shares, dec!(100));
        assert_eq!(agg.per_asset["eth"].down_shares, dec!(100));

        let analysis = ledger.cohort_analysis(Cohort::FifteenMin);
        assert_eq!(analysis.current_profit, dec!(15));

        assert_eq!(ledger.asset_aggregate(Cohort::Hourly, "btc").up_cost, dec!(3));
        assert_eq!(ledger.asset_aggregate(Cohort::Hourly, "eth"), AssetAggregate::default());

        let predicted = ledger.predict_cohort_after_buy(Cohort::FifteenMin, dec!(10), dec!(0.4), dec!(10), dec!(0.45));
        assert_eq!(predicted.min_shares, dec!(110));
        assert_eq!(predicted.total_cost, dec!(93.5));
    }

    struct Recorder(Mutex<Vec<Decimal>>);

    impl SettlementObserver for Recorder {
        fn on_settlement(&self, record: &SettlementRecord) {
            self.0.lock().push(record.profit);
        }
    }

    #[test]
    fn test_settlement_down_outcome() {
        let mut ledger = PositionLedger::new();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        ledger.add_observer(recorder.clone());

        let m = market("c1", "btc", Cohort::FifteenMin);
        ledger.record_fill(&m, Side::Up, dec!(60), dec!(24)).unwrap();
        ledger.record_fill(&m, Side::Down, dec!(40), dec!(20)).unwrap();

        let record = ledger.settle("c1", Side::Down, Utc::now()).unwrap();
        assert_eq!(record.payout, dec!(40));
        assert_eq!(record.total_cost, dec!(44));
        assert_eq!(record.profit, dec!(-4));

        assert!(ledger.get("c1").is_none());
        assert_eq!(ledger.settlements().len(), 1);
        assert_eq!(ledger.realized_pnl(), dec!(-4));
        assert_eq!(*recorder.0.lock(), vec![dec!(-4)]);

        assert_eq!(
            ledger.settle("c1", Side::Up, Utc::now()),
            Err(LedgerError::UnknownPosition("c1".to_string()))
        );
    }

    #[test]
    fn test_roll_cohort_moves_expired_positions() {
        let mut ledger = PositionLedger::new();
        let m15 = market("c1", "btc", Cohort::FifteenMin);
        let m1h = market("c2", "btc", Cohort::Hourly);
        ledger.record_fill(&m15, Side::Up, dec!(10), dec!(4)).unwrap();
        ledger.record_fill(&m1h, Side::Up, dec!(10), dec!(4)).unwrap();

        let boundary = Utc.timestamp_opt(1_768_534_200, 0).unwrap();
        let rolled = ledger.roll_cohort(Cohort::FifteenMin, boundary);

        assert_eq!(rolled, vec!["c1".to_string()]);
        assert!(ledger.get("c1").is_none());
        assert_eq!(ledger.awaiting_settlement().count(), 1);
        assert_eq!(ledger.cohort_aggregate(Cohort::FifteenMin).positions, 0);
        assert!(ledger.get("c2").is_some());

        // Awaiting positions still settle
        let record = ledger.settle("c1", Side::Up, Utc::now()).unwrap();
        assert_eq!(record.profit, dec!(6));
        assert_eq!(ledger.awaiting_settlement().count(), 0);
    }

    #[test]
    fn test_purge_empty() {
        let mut ledger = PositionLedger::restore(
            vec![Position::open(&market("c1", "btc", Cohort::FifteenMin), Utc::now())],
            Vec::new(),
            Vec::new(),
        );
        assert_eq!(ledger.positions().count(), 1);
        assert_eq!(ledger.purge_empty(), 1);
        assert_eq!(ledger.positions().count(), 0);
    }
}
