//! The trading loop.
//!
//! One cycle:
//! 1. Apply settlement outcomes handed over by the tracker
//! 2. Refresh the market registry and handle cohort rollover
//! 3. Move expired positions to awaiting settlement
//! 4. Check feed health and the malfunction halt
//! 5. Scan each cohort, feed the risk monitor, pick scanner or hedge decisions.
//!    A halt drops scanner decisions only, so hedges still go out.
//! 6. Dispatch all decisions concurrently under one timeout
//! 7. Reconcile fills into the ledger
//! 8. Periodic save and status line

pub mod settlement;

pub use settlement::{PendingSettlement, SettlementChannels, SettlementOutcome, SettlementTracker};

use crate::config::Config;
use crate::exchange::{FeedHandle, MarketDiscovery, MockVenue, OrderGateway};
use crate::ledger::{PositionLedger, SettlementRecord};
use crate::market::{Cohort, Market, MarketRegistry, QuoteBook};
use crate::notify::{EngineEvent, EventSink};
use crate::persistence::{LedgerStore, PositionSnapshot};
use crate::risk::{MalfunctionConfig, MalfunctionDetector, RiskMonitor};
use crate::strategy::{
    Decision, DecisionKind, DecisionReason, ExecutionCoordinator, ExecutionError, ExecutionReport,
    HedgeController, HedgePhase, OpportunityScanner,
};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

/// Counters for the status line.
#[derive(Debug)]
pub struct EngineMetrics {
    pub start_time: DateTime<Utc>,
    pub scan_count: u64,
    pub decisions: u64,
    pub orders: u64,
    pub fills: u64,
    pub failures: u64,
    pub hedges: u64,
    pub risk_triggers: u64,
    pub settlements: u64,
    pub batch_timeouts: u64,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self {
            start_time: Utc::now(),
            scan_count: 0,
            decisions: 0,
            orders: 0,
            fills: 0,
            failures: 0,
            hedges: 0,
            risk_triggers: 0,
            settlements: 0,
            batch_timeouts: 0,
        }
    }
}

pub struct Engine {
    config: Config,
    registry: MarketRegistry,
    book: Arc<QuoteBook>,
    ledger: PositionLedger,
    scanner: OpportunityScanner,
    coordinator: ExecutionCoordinator,
    hedge: HedgeController,
    risk: RiskMonitor,
    malfunction: MalfunctionDetector,
    discovery: Arc<dyn MarketDiscovery>,
    feed: Option<FeedHandle>,
    store: Option<Box<dyn LedgerStore>>,
    events: EventSink,
    paper: Option<Arc<MockVenue>>,
    pending: watch::Sender<Vec<PendingSettlement>>,
    outcomes: mpsc::Receiver<SettlementOutcome>,
    metrics: EngineMetrics,
    batch_timeout: Duration,
    last_save: DateTime<Utc>,
    last_status: DateTime<Utc>,
}

impl Engine {
    pub fn new(
        config: Config,
        discovery: Arc<dyn MarketDiscovery>,
        gateway: Arc<dyn OrderGateway>,
        book: Arc<QuoteBook>,
        mut ledger: PositionLedger,
        events: EventSink,
        settlement: SettlementChannels,
    ) -> Self {
        ledger.add_observer(Arc::new(events.clone()));

        let registry = MarketRegistry::new(
            config.markets.assets.clone(),
            config.markets.cohorts.clone(),
            config.markets.refresh_secs,
        );
        let scanner = OpportunityScanner::new(config.scanner.clone(), config.execution.max_order_notional);
        let coordinator = ExecutionCoordinator::new(
            gateway,
            config.execution.clone(),
            config.scanner.depth_utilization,
        );
        let hedge = HedgeController::new(config.hedge.clone(), config.execution.min_order_notional);
        let risk = RiskMonitor::new(config.risk.clone());
        let malfunction = MalfunctionDetector::new(MalfunctionConfig::from(&config.risk));
        let batch_timeout = Duration::from_secs(config.engine.batch_timeout_secs);
        let now = Utc::now();

        Self {
            config,
            registry,
            book,
            ledger,
            scanner,
            coordinator,
            hedge,
            risk,
            malfunction,
            discovery,
            feed: None,
            store: None,
            events,
            paper: None,
            pending: settlement.pending,
            outcomes: settlement.outcomes,
            metrics: EngineMetrics::default(),
            batch_timeout,
            last_save: now,
            last_status: now,
        }
    }

    pub fn with_feed(mut self, feed: FeedHandle) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn with_store(mut self, store: Box<dyn LedgerStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Credit settlement payouts to, and persist the balance of, a paper venue.
    pub fn with_paper_venue(mut self, venue: Arc<MockVenue>) -> Self {
        self.paper = Some(venue);
        self
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Run cycles until `shutdown` is set, then save once more.
    pub async fn run(mut self, shutdown: Arc<AtomicBool>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.engine.tick_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("🚀 Starting main trading loop...");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        while !shutdown.load(Ordering::SeqCst) {
            interval.tick().await;
            let loop_start = Utc::now();
            self.cycle(loop_start).await;
            trace!(elapsed_ms = (Utc::now() - loop_start).num_milliseconds(), "Cycle done");
        }

        info!("💾 [PERSISTENCE] Saving final state before shutdown...");
        self.save(None, Utc::now()).await;

        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        info!("🏁 Final Statistics:");
        self.log_status().await;
    }

    /// One pass of the loop at time `now`.
    pub async fn cycle(&mut self, now: DateTime<Utc>) {
        self.apply_settlements(now).await;

        if self.registry.needs_refresh(now) {
            self.refresh_markets(now).await;
        }

        for cohort in self.registry.cohorts().to_vec() {
            self.ledger.roll_cohort(cohort, now);
        }
        self.publish_pending();

        let halted = self.check_halt(now);
        let decisions = self.plan(halted, now);
        if !decisions.is_empty() {
            self.dispatch(decisions, now).await;
        }

        self.ledger.purge_empty();

        if now - self.last_save >= chrono::Duration::seconds(self.config.engine.save_interval_secs as i64) {
            self.save(None, now).await;
        }
        if now - self.last_status >= chrono::Duration::seconds(self.config.engine.status_interval_secs as i64) {
            self.last_status = now;
            self.log_status().await;
        }
    }

    async fn apply_settlements(&mut self, now: DateTime<Utc>) {
        while let Ok(outcome) = self.outcomes.try_recv() {
            match self.ledger.settle(&outcome.condition_id, outcome.outcome, now) {
                Ok(record) => {
                    self.metrics.settlements += 1;
                    if let Some(paper) = &self.paper {
                        paper.credit(record.payout).await;
                    }
                    info!(
                        market = %record.label,
                        outcome = %record.outcome,
                        payout = %record.payout,
                        profit = %record.profit,
                        realized_pnl = %self.ledger.realized_pnl(),
                        "🏁 [SETTLE] Settlement applied"
                    );
                    self.save(Some(&record), now).await;
                }
                // Already settled, or never held by this process
                Err(e) => debug!(market = %outcome.label, error = %e, "Ignoring settlement outcome"),
            }
        }
    }

    async fn refresh_markets(&mut self, now: DateTime<Utc>) {
        let previous: Vec<String> = self.registry.markets().iter().map(|m| m.label.clone()).collect();

        let outcome = match self.registry.refresh(self.discovery.as_ref(), now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "Market refresh failed, keeping current markets");
                return;
            }
        };

        for (cohort, from) in outcome.rolled {
            self.on_rollover(cohort, from);
        }

        let current: HashSet<&str> = self.registry.markets().iter().map(|m| m.label.as_str()).collect();
        for label in previous.iter().filter(|l| !current.contains(l.as_str())) {
            self.malfunction.clear_market(label);
        }

        let ids: Vec<String> = self
            .registry
            .markets()
            .iter()
            .map(|m| m.condition_id.clone())
            .collect();
        self.coordinator.cooldowns().retain(&ids);

        let tokens = self.registry.token_ids();
        self.book.retain_subscriptions(&tokens);
        if let Some(paper) = &self.paper {
            paper.retain_tokens(&tokens).await;
        }
        let new_tokens = self.book.subscribe(&tokens);
        if !new_tokens.is_empty() {
            debug!(count = new_tokens.len(), markets = outcome.markets, "Subscribing new tokens");
            if let Some(feed) = &self.feed {
                feed.subscribe(new_tokens);
            }
        }
    }

    /// A cohort moved to its next slot: every per-cohort state starts over.
    fn on_rollover(&mut self, cohort: Cohort, from: DateTime<Utc>) {
        let summary = self.risk.summary(cohort);
        info!(
            %cohort,
            samples = summary.samples,
            triggered = summary.triggered,
            min_cost = ?summary.min_cost,
            avg_cost = %summary.avg_cost.round_dp(4),
            "🔄 [RISK] Cohort window closed"
        );
        self.risk.reset(cohort);
        self.hedge.reset(cohort);
        self.scanner.reset(cohort);
        self.ledger.roll_cohort(cohort, from);
    }

    fn publish_pending(&self) {
        let mut pending: Vec<PendingSettlement> = self
            .ledger
            .awaiting_settlement()
            .map(|p| PendingSettlement {
                condition_id: p.condition_id.clone(),
                label: p.label.clone(),
            })
            .collect();
        pending.sort_by(|a, b| a.condition_id.cmp(&b.condition_id));

        self.pending.send_if_modified(|current| {
            if *current == pending {
                return false;
            }
            *current = pending;
            true
        });
    }

    /// Returns true while new arbitrage is halted.
    fn check_halt(&mut self, now: DateTime<Utc>) -> bool {
        if let Some(feed) = &self.feed {
            let health = feed.health().snapshot(self.book.dropped_count());
            self.malfunction.observe_disconnects(health.disconnects, now);
            if health.gave_up {
                self.malfunction.record_feed_gave_up(health.reconnect_attempts, now);
            }
        }
        self.malfunction.should_halt_trading(now)
    }

    /// Decisions for every cohort this cycle.
    fn plan(&mut self, halted: bool, now: DateTime<Utc>) -> Vec<Decision> {
        let mut decisions = Vec::new();
        for cohort in self.registry.cohorts().to_vec() {
            let markets: Vec<Market> = self.registry.cohort_markets(cohort).into_iter().cloned().collect();
            decisions.extend(self.plan_cohort(cohort, &markets, halted, now));
        }
        decisions
    }

    fn plan_cohort(
        &mut self,
        cohort: Cohort,
        markets: &[Market],
        halted: bool,
        now: DateTime<Utc>,
    ) -> Vec<Decision> {
        let markets: Vec<&Market> = markets.iter().collect();
        let Some(scan) = self
            .scanner
            .scan_cohort(cohort, &markets, &self.book, &self.ledger, now)
        else {
            return Vec::new();
        };
        self.metrics.scan_count += 1;

        if let Some(combined) = scan.combined_cost {
            let seconds_to_expiry = (scan.expiry - now).num_seconds();
            if self.risk.record_sample(cohort, combined, seconds_to_expiry, now) {
                self.metrics.risk_triggers += 1;
                self.events.emit(EngineEvent::RiskTriggered {
                    cohort,
                    mode: self.risk.mode(),
                    summary: self.risk.summary(cohort),
                });
            }
        }

        if self.hedge.is_trading_suppressed(cohort) {
            return Vec::new();
        }

        let verdict = self.risk.should_pause_trading(cohort);
        if verdict.pause {
            trace!(%cohort, "[RISK] Cohort paused until rollover");
            return Vec::new();
        }
        if verdict.should_hedge {
            if !self.config.hedge.enabled {
                trace!(%cohort, "[RISK] Hedging disabled, cohort paused until rollover");
                return Vec::new();
            }
            return self.hedge_decisions(cohort, &markets, now);
        }

        if halted {
            trace!(%cohort, "Arbitrage halted by malfunction detector");
            return Vec::new();
        }

        let decision = scan.decision;
        if decision.kind == DecisionKind::Wait {
            return Vec::new();
        }

        self.scanner.mark_acted(cohort, now);
        self.metrics.decisions += 1;
        info!(
            %cohort,
            kind = %decision.kind,
            reason = %decision.reason,
            qty = %decision.quantity,
            combined = ?scan.combined_cost,
            profit = %decision.predicted_profit,
            "📡 [SCAN] Opportunity found"
        );
        self.events.emit(EngineEvent::OpportunityFound {
            cohort,
            kind: decision.kind,
            reason: decision.reason,
            pool: decision.pool,
            quantity: decision.quantity,
            combined_cost: scan.combined_cost,
            predicted_profit: decision.predicted_profit,
        });
        vec![decision]
    }

    fn hedge_decisions(&mut self, cohort: Cohort, markets: &[&Market], now: DateTime<Utc>) -> Vec<Decision> {
        let before = self.hedge.phase(cohort);
        if let Some(entry) = self.hedge.begin(cohort, &self.ledger, markets, &self.book, now) {
            self.metrics.hedges += 1;
            self.events.emit(EngineEvent::HedgeStarted {
                cohort,
                targets: entry.targets,
                expected_loss: entry.expected_loss,
            });
        }
        let decisions = self.hedge.decisions(cohort, &self.ledger, markets, &self.book, now);
        self.note_hedge_phase(cohort, before);

        self.metrics.decisions += decisions.len() as u64;
        decisions
    }

    fn note_hedge_phase(&self, cohort: Cohort, before: HedgePhase) {
        if before == HedgePhase::Completed || self.hedge.phase(cohort) != HedgePhase::Completed {
            return;
        }
        let hedge_cost = self
            .hedge
            .state(cohort)
            .map(|s| s.hedge_cost)
            .unwrap_or(Decimal::ZERO);
        self.events.emit(EngineEvent::HedgeCompleted { cohort, hedge_cost });
    }

    async fn dispatch(&mut self, decisions: Vec<Decision>, now: DateTime<Utc>) {
        let batch = join_all(decisions.iter().map(|d| self.coordinator.execute(d, now)));
        let results = match tokio::time::timeout(self.batch_timeout, batch).await {
            Ok(results) => results,
            Err(_) => {
                self.metrics.batch_timeouts += 1;
                warn!(
                    error = %ExecutionError::Timeout(self.batch_timeout),
                    decisions = decisions.len(),
                    "[EXEC] Order batch abandoned"
                );
                return;
            }
        };

        for (decision, result) in decisions.iter().zip(results) {
            match result {
                Ok(report) => self.apply_report(report, now),
                Err(e) => debug!(
                    cohort = %decision.cohort,
                    kind = %decision.kind,
                    error = %e,
                    "[EXEC] Decision not submitted"
                ),
            }
        }
    }

    fn apply_report(&mut self, report: ExecutionReport, now: DateTime<Utc>) {
        self.metrics.orders += report.slices.len() as u64;

        for (slice, error) in report.failures() {
            self.metrics.failures += 1;
            match error {
                ExecutionError::InvariantViolation { market, detail } => {
                    self.malfunction.record_implausible_fill(market, detail, now);
                }
                e if e.is_order_failure() => {
                    self.malfunction.record_order_failure(&slice.market.label, now);
                }
                _ => {}
            }
        }

        let applied = self.coordinator.reconcile(&report, &mut self.ledger, now);
        let confirmed = report.fills().count();
        if applied.len() < confirmed {
            for fill in report.fills().filter(|f| !applied.contains(f)) {
                self.malfunction.record_implausible_fill(
                    &fill.market.label,
                    &format!("ledger refused {} shares for {}", fill.shares, fill.cost),
                    now,
                );
            }
        }

        for fill in &applied {
            self.metrics.fills += 1;
            self.malfunction.record_order_success(&fill.market.label);
            info!(
                cohort = %report.cohort,
                market = %fill.market.label,
                side = %fill.side,
                reason = %report.reason,
                shares = %fill.shares,
                cost = %fill.cost,
                "✅ [EXEC] Fill applied"
            );
            self.events.emit(EngineEvent::TradeFilled {
                cohort: report.cohort,
                market: fill.market.label.clone(),
                side: fill.side,
                reason: report.reason,
                shares: fill.shares,
                cost: fill.cost,
            });

            if report.reason == DecisionReason::Hedge {
                let before = self.hedge.phase(report.cohort);
                self.hedge
                    .record_hedge_fill(report.cohort, &fill.market.asset, fill.side, fill.shares, fill.cost);
                self.note_hedge_phase(report.cohort, before);
            }
        }
    }

    async fn save(&mut self, settlement: Option<&SettlementRecord>, now: DateTime<Utc>) {
        if self.store.is_none() {
            return;
        }
        let balance = match &self.paper {
            Some(paper) => Some(paper.account().await.balance),
            None => None,
        };
        let snapshot = PositionSnapshot::from_ledger(&self.ledger, balance);
        let Some(store) = &self.store else {
            return;
        };
        match store.save(&snapshot, settlement) {
            Ok(()) => {
                self.last_save = now;
                debug!(
                    live = snapshot.live.len(),
                    awaiting = snapshot.awaiting.len(),
                    "💾 [PERSISTENCE] State saved"
                );
            }
            Err(e) => error!(error = %e, "❌ [PERSISTENCE] Failed to save state"),
        }
    }

    async fn log_status(&self) {
        let runtime = Utc::now() - self.metrics.start_time;
        let awaiting = self.ledger.awaiting_settlement().count();
        let live = self.ledger.positions().count();

        info!("╔════════════════════════════════════════════════════════════╗");
        info!("║                    📊 [STATUS]                             ║");
        info!("╠════════════════════════════════════════════════════════════╣");
        info!("║ Runtime: {}h {}m", runtime.num_hours(), runtime.num_minutes() % 60);
        if let Some(paper) = &self.paper {
            let account = paper.account().await;
            info!("║ Paper Balance:       ${:>12.2}", account.balance);
            info!("║ Paper Orders:        {:>6} ({} filled)", account.order_count, account.fill_count);
        }
        info!("║ Realized PnL:        ${:>12.4}", self.ledger.realized_pnl());
        info!("╠════════════════════════════════════════════════════════════╣");
        info!("║ Scans:               {:>6}", self.metrics.scan_count);
        info!("║ Decisions:           {:>6}", self.metrics.decisions);
        info!("║ Orders:              {:>6}", self.metrics.orders);
        info!("║ Fills:               {:>6}", self.metrics.fills);
        info!("║ Failures:            {:>6}", self.metrics.failures);
        info!("║ Batch Timeouts:      {:>6}", self.metrics.batch_timeouts);
        info!("║ Hedges:              {:>6}", self.metrics.hedges);
        info!("║ Risk Triggers:       {:>6}", self.metrics.risk_triggers);
        info!("║ Settlements:         {:>6}", self.metrics.settlements);
        info!("║ Positions:           {:>6} live, {} awaiting", live, awaiting);
        info!("╠════════════════════════════════════════════════════════════╣");
        for cohort in self.registry.cohorts() {
            let analysis = self.ledger.cohort_analysis(*cohort);
            if !analysis.has_position {
                continue;
            }
            info!(
                "║ {:>6} | Up {:>8} | Down {:>8} | Cost ${:>8.2} | Pair ${:.4}",
                cohort.key(),
                analysis.up_shares,
                analysis.down_shares,
                analysis.total_cost,
                analysis.avg_cost_per_pair
            );
        }
        if let Some(feed) = &self.feed {
            let health = feed.health().snapshot(self.book.dropped_count());
            info!(
                "║ Feed: connected={} attempts={} gave_up={} disconnects={} dropped={}",
                health.connected,
                health.reconnect_attempts,
                health.gave_up,
                health.disconnects,
                health.dropped_messages
            );
        }
        info!(
            "║ Alerts: {} | Halted: {} | Events dropped: {}",
            self.malfunction.active_alerts().len(),
            self.malfunction.is_halted(),
            self.events.dropped()
        );
        info!("╚════════════════════════════════════════════════════════════╝");
    }
}
