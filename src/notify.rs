//! Structured engine events.
//!
//! Events are handed to a bounded channel with `try_send` so the trading
//! loop never waits on a consumer. The bundled consumer writes each event as
//! one JSON line under the `engine_event` target.

use crate::ledger::{SettlementObserver, SettlementRecord};
use crate::market::{Cohort, Side};
use crate::risk::{RiskMode, RiskSummary};
use crate::strategy::{DecisionKind, DecisionReason, HedgeTarget, PoolKind};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    OpportunityFound {
        cohort: Cohort,
        kind: DecisionKind,
        reason: DecisionReason,
        pool: PoolKind,
        quantity: Decimal,
        combined_cost: Option<Decimal>,
        predicted_profit: Decimal,
    },
    TradeFilled {
        cohort: Cohort,
        market: String,
        side: Side,
        reason: DecisionReason,
        shares: Decimal,
        cost: Decimal,
    },
    HedgeStarted {
        cohort: Cohort,
        targets: Vec<HedgeTarget>,
        expected_loss: Decimal,
    },
    HedgeCompleted {
        cohort: Cohort,
        hedge_cost: Decimal,
    },
    RiskTriggered {
        cohort: Cohort,
        mode: RiskMode,
        summary: RiskSummary,
    },
    Settlement {
        record: SettlementRecord,
    },
}

/// Event with its emission time.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: EngineEvent,
}

/// Fire-and-forget sender. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<EventEnvelope>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<EventEnvelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Never blocks. A full or closed channel drops the event.
    pub fn emit(&self, event: EngineEvent) {
        let envelope = EventEnvelope {
            at: Utc::now(),
            event,
        };
        if self.tx.try_send(envelope).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                warn!(dropped, "Event sink full, dropping engine events");
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl SettlementObserver for EventSink {
    fn on_settlement(&self, record: &SettlementRecord) {
        self.emit(EngineEvent::Settlement {
            record: record.clone(),
        });
    }
}

/// Log every event as `ENGINE_EVENT: {json}` until the senders are gone.
pub fn spawn_log_consumer(mut rx: mpsc::Receiver<EventEnvelope>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let json = serde_json::to_string(&envelope).unwrap_or_default();
            info!(target: "engine_event", "ENGINE_EVENT: {}", json);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_events_are_tagged_json() {
        let (sink, mut rx) = EventSink::channel(8);
        sink.emit(EngineEvent::HedgeCompleted {
            cohort: Cohort::FifteenMin,
            hedge_cost: dec!(50),
        });

        let envelope = rx.recv().await.unwrap();
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["event"], "hedge_completed");
        assert_eq!(json["cohort"], "15min");
        assert_eq!(json["hedge_cost"], "50");
        assert!(json["at"].is_string());
    }

    #[test]
    fn test_full_channel_drops_without_blocking() {
        let (sink, _rx) = EventSink::channel(1);
        for _ in 0..3 {
            sink.emit(EngineEvent::HedgeCompleted {
                cohort: Cohort::Hourly,
                hedge_cost: Decimal::ZERO,
            });
        }
        assert_eq!(sink.dropped(), 2);
    }

    #[tokio::test]
    async fn test_settlement_observer_forwards_record() {
        let (sink, mut rx) = EventSink::channel(8);
        let record = SettlementRecord {
            condition_id: "c1".to_string(),
            label: "btc-updown-15m-1768533300".to_string(),
            asset: "btc".to_string(),
            cohort: Cohort::FifteenMin,
            outcome: Side::Down,
            up_shares: dec!(60),
            down_shares: dec!(40),
            total_cost: dec!(44),
            payout: dec!(40),
            profit: dec!(-4),
            settled_at: Utc::now(),
        };
        sink.on_settlement(&record);

        let envelope = tokio_test::assert_ok!(rx.try_recv());
        assert!(matches!(envelope.event, EngineEvent::Settlement { ref record } if record.profit == dec!(-4)));
    }
}
