//! Risk management for the Up/Down arbitrage engine.
//!
//! - Near-expiry combined-cost monitoring per cohort
//! - Malfunction detection (order failure streaks, feed health)

mod malfunction;
mod monitor;

pub use malfunction::{
    AlertSeverity, MalfunctionAlert, MalfunctionConfig, MalfunctionDetector, MalfunctionType,
};
pub use monitor::{RiskMode, RiskMonitor, RiskSummary, RiskVerdict, RiskWindow};
