//! Trading malfunction detection.
//!
//! Detects operational issues that could indicate system malfunction:
//! - Consecutive order failures on one market
//! - Feed disconnect storms and a feed that gave up reconnecting
//! - Fills the ledger refused as implausible
//!
//! Provides structured alerts for the log analysis workflow.

use crate::config::RiskConfig;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, error, info, warn};

/// Types of malfunctions that can be detected.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum MalfunctionType {
    /// Consecutive failed orders on one market
    OrderExecutionFailure {
        market: String,
        consecutive_failures: u32,
    },
    /// Too many feed disconnects in the last hour
    FeedDisconnects { disconnects: u32, window_minutes: u32 },
    /// Feed exhausted its reconnect attempts
    FeedGaveUp { attempts: u32 },
    /// Venue reported a fill that cannot be right
    ImplausibleFill { market: String, detail: String },
}

/// Severity levels for alerts.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Error => "ERROR",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

/// A malfunction alert.
#[derive(Debug, Clone, Serialize)]
pub struct MalfunctionAlert {
    pub alert_id: String,
    pub timestamp: DateTime<Utc>,
    pub malfunction_type: MalfunctionType,
    pub severity: AlertSeverity,
    pub message: String,
    pub should_halt: bool,
    pub suggested_action: String,
}

impl MalfunctionAlert {
    fn new(
        malfunction_type: MalfunctionType,
        severity: AlertSeverity,
        message: String,
        should_halt: bool,
        suggested_action: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let alert_id = format!("malfunction-{}-{}", timestamp.timestamp(), rand_suffix());
        Self {
            alert_id,
            timestamp,
            malfunction_type,
            severity,
            message,
            should_halt,
            suggested_action: suggested_action.to_string(),
        }
    }

    /// Emit alert as structured log.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();

        match self.severity {
            AlertSeverity::Info => info!(target: "risk_alert", "RISK_ALERT: {}", json),
            AlertSeverity::Warning => warn!(target: "risk_alert", "RISK_ALERT: {}", json),
            AlertSeverity::Error | AlertSeverity::Critical => {
                error!(target: "risk_alert", "RISK_ALERT: {}", json)
            }
        }
    }
}

fn rand_suffix() -> String {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("{:08x}", nanos)
}

#[derive(Debug, Clone)]
pub struct MalfunctionConfig {
    /// Consecutive order failures on one market before alerting
    pub max_consecutive_failures: u32,
    /// Feed disconnects within an hour before alerting
    pub max_disconnects_per_hour: u32,
    /// How long a halt lasts before new arbitrage resumes
    pub halt_cooldown: Duration,
}

impl Default for MalfunctionConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            max_disconnects_per_hour: 5,
            halt_cooldown: Duration::minutes(5),
        }
    }
}

impl From<&RiskConfig> for MalfunctionConfig {
    fn from(risk: &RiskConfig) -> Self {
        Self {
            max_consecutive_failures: risk.max_consecutive_failures,
            max_disconnects_per_hour: risk.max_disconnects_per_hour,
            halt_cooldown: Duration::seconds(risk.halt_cooldown_secs),
        }
    }
}

/// Detects trading malfunctions.
pub struct MalfunctionDetector {
    config: MalfunctionConfig,
    /// Consecutive failure count per market
    failure_counts: HashMap<String, u32>,
    /// Disconnect timestamps within the last hour
    disconnects: VecDeque<DateTime<Utc>>,
    /// Last cumulative disconnect count seen from the feed
    seen_disconnects: u64,
    feed_gave_up_reported: bool,
    active_alerts: Vec<MalfunctionAlert>,
    /// Set by the latest halting alert
    halted_at: Option<DateTime<Utc>>,
}

impl MalfunctionDetector {
    pub fn new(config: MalfunctionConfig) -> Self {
        Self {
            config,
            failure_counts: HashMap::new(),
            disconnects: VecDeque::new(),
            seen_disconnects: 0,
            feed_gave_up_reported: false,
            active_alerts: Vec::new(),
            halted_at: None,
        }
    }

    /// Record an order the venue rejected or that never reached it.
    pub fn record_order_failure(&mut self, market: &str, now: DateTime<Utc>) -> Option<MalfunctionAlert> {
        let count = self.failure_counts.entry(market.to_string()).or_insert(0);
        *count += 1;
        let count = *count;

        debug!(%market, consecutive_failures = count, "Recorded order failure");

        if count < self.config.max_consecutive_failures {
            return None;
        }
        let alert = MalfunctionAlert::new(
            MalfunctionType::OrderExecutionFailure {
                market: market.to_string(),
                consecutive_failures: count,
            },
            AlertSeverity::Error,
            format!("{} consecutive order failures on {}", count, market),
            count >= self.config.max_consecutive_failures * 2,
            "Check venue status and balance before resuming",
            now,
        );
        self.add_alert(alert.clone());
        Some(alert)
    }

    /// A confirmed fill resets the market's failure streak.
    pub fn record_order_success(&mut self, market: &str) {
        if let Some(count) = self.failure_counts.get_mut(market) {
            if *count > 0 {
                debug!(%market, previous_failures = *count, "Order success - resetting failure counter");
            }
            *count = 0;
        }
    }

    /// Observe the feed's cumulative disconnect counter.
    pub fn observe_disconnects(&mut self, total: u64, now: DateTime<Utc>) -> Option<MalfunctionAlert> {
        let new = total.saturating_sub(self.seen_disconnects);
        self.seen_disconnects = total;

        for _ in 0..new {
            self.disconnects.push_back(now);
        }
        let window_start = now - Duration::hours(1);
        while self.disconnects.front().is_some_and(|t| *t < window_start) {
            self.disconnects.pop_front();
        }

        let count = self.disconnects.len() as u32;
        if new == 0 || count < self.config.max_disconnects_per_hour {
            return None;
        }
        let alert = MalfunctionAlert::new(
            MalfunctionType::FeedDisconnects {
                disconnects: count,
                window_minutes: 60,
            },
            AlertSeverity::Warning,
            format!("{} market feed disconnects in the last hour", count),
            count >= self.config.max_disconnects_per_hour * 2,
            "Check network connectivity to the venue",
            now,
        );
        self.add_alert(alert.clone());
        Some(alert)
    }

    /// The feed stopped reconnecting. Reported once.
    pub fn record_feed_gave_up(&mut self, attempts: u32, now: DateTime<Utc>) -> Option<MalfunctionAlert> {
        if self.feed_gave_up_reported {
            return None;
        }
        self.feed_gave_up_reported = true;
        let alert = MalfunctionAlert::new(
            MalfunctionType::FeedGaveUp { attempts },
            AlertSeverity::Critical,
            format!("Market feed gave up after {} reconnect attempts", attempts),
            true,
            "Restart the engine once the venue is reachable",
            now,
        );
        self.add_alert(alert.clone());
        Some(alert)
    }

    pub fn record_implausible_fill(&mut self, market: &str, detail: &str, now: DateTime<Utc>) -> MalfunctionAlert {
        let alert = MalfunctionAlert::new(
            MalfunctionType::ImplausibleFill {
                market: market.to_string(),
                detail: detail.to_string(),
            },
            AlertSeverity::Critical,
            format!("Implausible fill on {}: {}", market, detail),
            true,
            "Reconcile positions against the venue before resuming",
            now,
        );
        self.add_alert(alert.clone());
        alert
    }

    fn add_alert(&mut self, alert: MalfunctionAlert) {
        if alert.should_halt {
            self.halted_at = Some(alert.timestamp);
        }

        alert.emit();
        self.active_alerts.push(alert);

        while self.active_alerts.len() > 100 {
            self.active_alerts.remove(0);
        }
    }

    pub fn active_alerts(&self) -> &[MalfunctionAlert] {
        &self.active_alerts
    }

    /// New arbitrage stops while this is true. Hedging keeps running.
    ///
    /// A halt lifts on its own once `halt_cooldown` has passed since the
    /// last halting alert.
    pub fn should_halt_trading(&mut self, now: DateTime<Utc>) -> bool {
        let Some(since) = self.halted_at else {
            return false;
        };
        if now - since < self.config.halt_cooldown {
            return true;
        }
        self.reset_halt();
        false
    }

    pub fn is_halted(&self) -> bool {
        self.halted_at.is_some()
    }

    pub fn reset_halt(&mut self) {
        self.halted_at = None;
        self.failure_counts.values_mut().for_each(|c| *c = 0);
        info!("Trading halt lifted");
    }

    pub fn failure_count(&self, market: &str) -> u32 {
        self.failure_counts.get(market).copied().unwrap_or(0)
    }

    /// Drop streaks for markets that rolled away.
    pub fn clear_market(&mut self, market: &str) {
        self.failure_counts.remove(market);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> MalfunctionDetector {
        MalfunctionDetector::new(MalfunctionConfig {
            max_consecutive_failures: 3,
            max_disconnects_per_hour: 3,
            halt_cooldown: Duration::minutes(5),
        })
    }

    #[test]
    fn test_order_failure_tracking() {
        let mut d = detector();
        let now = Utc::now();

        assert!(d.record_order_failure("btc-updown-15m", now).is_none());
        assert!(d.record_order_failure("btc-updown-15m", now).is_none());

        let alert = d.record_order_failure("btc-updown-15m", now).unwrap();
        assert!(matches!(
            alert.malfunction_type,
            MalfunctionType::OrderExecutionFailure { consecutive_failures: 3, .. }
        ));
        assert!(!d.should_halt_trading(now));

        d.record_order_success("btc-updown-15m");
        assert_eq!(d.failure_count("btc-updown-15m"), 0);
    }

    #[test]
    fn test_failure_streak_halts_at_double_threshold() {
        let mut d = detector();
        let now = Utc::now();
        for _ in 0..6 {
            d.record_order_failure("eth-updown-1h", now);
        }
        assert!(d.should_halt_trading(now));
        d.reset_halt();
        assert!(!d.should_halt_trading(now));
        assert_eq!(d.failure_count("eth-updown-1h"), 0);
    }

    #[test]
    fn test_halt_lifts_after_cooldown() {
        let mut d = detector();
        let t0 = Utc::now();
        for _ in 0..6 {
            d.record_order_failure("eth-updown-1h", t0);
        }
        assert!(d.should_halt_trading(t0 + Duration::minutes(4)));
        assert!(d.is_halted());

        assert!(!d.should_halt_trading(t0 + Duration::minutes(5)));
        assert!(!d.is_halted());
        // Streak starts over, so one more failure does not re-halt
        d.record_order_failure("eth-updown-1h", t0 + Duration::minutes(6));
        assert!(!d.should_halt_trading(t0 + Duration::minutes(6)));
    }

    #[test]
    fn test_disconnects_counted_per_hour() {
        let mut d = detector();
        let t0 = Utc::now();

        assert!(d.observe_disconnects(2, t0).is_none());
        // Same counter again: nothing new
        assert!(d.observe_disconnects(2, t0).is_none());
        assert!(d.observe_disconnects(3, t0).is_some());

        // An hour later the old disconnects have aged out
        let later = t0 + Duration::minutes(61);
        assert!(d.observe_disconnects(4, later).is_none());
    }

    #[test]
    fn test_feed_gave_up_reported_once() {
        let mut d = detector();
        let now = Utc::now();
        assert!(d.record_feed_gave_up(10, now).is_some());
        assert!(d.record_feed_gave_up(10, now).is_none());
        assert!(d.should_halt_trading(now));
    }

    #[test]
    fn test_alert_serializes_with_type_tag() {
        let mut d = detector();
        let alert = d.record_implausible_fill("btc-updown-15m", "filled 60 of 30 requested", Utc::now());
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["malfunction_type"]["type"], "ImplausibleFill");
        assert_eq!(json["severity"], "Critical");
        assert!(d.is_halted());
    }
}
