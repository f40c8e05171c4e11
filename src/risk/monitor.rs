//! Near-expiry risk detection.
//!
//! A cohort whose combined cost keeps sitting far below $1 in the final
//! minutes is one where the market has priced a large move and the two legs
//! are no longer expected to settle together. Once enough in-window samples
//! confirm that regime the cohort latches triggered until it rolls.

use crate::config::RiskConfig;
use crate::market::Cohort;
use crate::utils::decimal::safe_div;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

/// What a triggered cohort does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskMode {
    /// Buy the short side to cap worst-case loss
    #[default]
    Hedge,
    /// Stop taking new exposure and hold to settlement
    Liquidate,
}

impl fmt::Display for RiskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskMode::Hedge => f.write_str("hedge"),
            RiskMode::Liquidate => f.write_str("liquidate"),
        }
    }
}

/// Sample statistics for one cohort lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RiskWindow {
    pub samples: u64,
    pub below_threshold: u64,
    pub min_cost: Option<Decimal>,
    pub max_cost: Option<Decimal>,
    cost_sum: Decimal,
    /// In-window samples
    pub checks: u32,
    /// In-window samples below threshold
    pub triggers: u32,
    pub triggered: bool,
    pub triggered_at: Option<DateTime<Utc>>,
}

impl RiskWindow {
    pub fn avg_cost(&self) -> Decimal {
        safe_div(self.cost_sum, Decimal::from(self.samples))
    }

    pub fn trigger_ratio(&self) -> Decimal {
        safe_div(Decimal::from(self.triggers), Decimal::from(self.checks))
    }
}

/// Trading instruction for a cohort.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RiskVerdict {
    pub pause: bool,
    pub should_hedge: bool,
}

/// Loggable snapshot of a cohort's window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskSummary {
    pub cohort: Cohort,
    pub samples: u64,
    pub below_threshold: u64,
    pub checks: u32,
    pub triggers: u32,
    pub min_cost: Option<Decimal>,
    pub max_cost: Option<Decimal>,
    pub avg_cost: Decimal,
    pub triggered: bool,
}

pub struct RiskMonitor {
    config: RiskConfig,
    windows: HashMap<Cohort, RiskWindow>,
}

impl RiskMonitor {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
        }
    }

    pub fn mode(&self) -> RiskMode {
        self.config.mode
    }

    /// Feed one combined-cost sample. Returns `true` only on the sample that
    /// latches the cohort.
    pub fn record_sample(
        &mut self,
        cohort: Cohort,
        combined_cost: Decimal,
        seconds_to_expiry: i64,
        now: DateTime<Utc>,
    ) -> bool {
        let config = &self.config;
        let window = self.windows.entry(cohort).or_default();
        let below = combined_cost < config.cost_threshold;

        window.samples += 1;
        window.cost_sum += combined_cost;
        window.min_cost = Some(window.min_cost.map_or(combined_cost, |m| m.min(combined_cost)));
        window.max_cost = Some(window.max_cost.map_or(combined_cost, |m| m.max(combined_cost)));
        if below {
            window.below_threshold += 1;
        }

        if !(0..=config.window_secs).contains(&seconds_to_expiry) {
            return false;
        }

        window.checks += 1;
        if below {
            window.triggers += 1;
        }

        if window.triggered
            || window.triggers < config.min_triggers
            || window.trigger_ratio() < config.trigger_ratio
        {
            return false;
        }

        window.triggered = true;
        window.triggered_at = Some(now);
        warn!(
            %cohort,
            checks = window.checks,
            triggers = window.triggers,
            ratio = %window.trigger_ratio().round_dp(3),
            seconds_to_expiry,
            mode = %config.mode,
            "⚠️ [RISK] Cohort triggered"
        );
        true
    }

    pub fn is_triggered(&self, cohort: Cohort) -> bool {
        self.windows.get(&cohort).is_some_and(|w| w.triggered)
    }

    pub fn should_pause_trading(&self, cohort: Cohort) -> RiskVerdict {
        if !self.is_triggered(cohort) {
            return RiskVerdict::default();
        }
        match self.config.mode {
            RiskMode::Liquidate => RiskVerdict {
                pause: true,
                should_hedge: false,
            },
            RiskMode::Hedge => RiskVerdict {
                pause: false,
                should_hedge: true,
            },
        }
    }

    pub fn summary(&self, cohort: Cohort) -> RiskSummary {
        let window = self.windows.get(&cohort).cloned().unwrap_or_default();
        RiskSummary {
            cohort,
            samples: window.samples,
            below_threshold: window.below_threshold,
            checks: window.checks,
            triggers: window.triggers,
            min_cost: window.min_cost,
            max_cost: window.max_cost,
            avg_cost: window.avg_cost(),
            triggered: window.triggered,
        }
    }

    /// Start a fresh window for the next settlement slot.
    pub fn reset(&mut self, cohort: Cohort) {
        if let Some(window) = self.windows.remove(&cohort) {
            debug!(
                %cohort,
                samples = window.samples,
                triggered = window.triggered,
                "Risk window reset"
            );
        }
    }
}
