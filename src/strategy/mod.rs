//! Trading strategy implementation.
//!
//! Contains the core logic for:
//! - Cohort scanning and opportunity detection
//! - Order execution with locks, cooldowns and fill reconciliation
//! - Loss-capping hedges once the risk monitor fires

mod executor;
mod hedge;
mod locks;
mod scanner;

pub use executor::{extract_fill, ExecutionCoordinator, ExecutionError, ExecutionReport, Fill, SliceResult};
pub use hedge::{CohortHedge, HedgeController, HedgeEntry, HedgePhase, HedgeTarget};
pub use locks::{LockGuard, LockKey, LockSet, MarketCooldowns};
pub use scanner::{CohortScan, Decision, DecisionKind, DecisionReason, Leg, OpportunityScanner, PoolKind};
