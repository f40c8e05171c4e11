//! Settlement records and observers.

use crate::ledger::position::Position;
use crate::market::{Cohort, Side};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Final accounting for one market. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub condition_id: String,
    pub label: String,
    pub asset: String,
    pub cohort: Cohort,
    pub outcome: Side,
    pub up_shares: Decimal,
    pub down_shares: Decimal,
    pub total_cost: Decimal,
    pub payout: Decimal,
    pub profit: Decimal,
    pub settled_at: DateTime<Utc>,
}

impl SettlementRecord {
    pub fn from_position(position: &Position, outcome: Side, settled_at: DateTime<Utc>) -> Self {
        let payout = position.payout(outcome);
        let total_cost = position.total_cost();
        Self {
            condition_id: position.condition_id.clone(),
            label: position.label.clone(),
            asset: position.asset.clone(),
            cohort: position.cohort,
            outcome,
            up_shares: position.up_shares,
            down_shares: position.down_shares,
            total_cost,
            payout,
            profit: payout - total_cost,
            settled_at,
        }
    }
}

/// Notified after a settlement is appended.
pub trait SettlementObserver: Send + Sync {
    fn on_settlement(&self, record: &SettlementRecord);
}
