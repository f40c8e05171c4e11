//! Background settlement tracker.
//!
//! Polls the resolution source for every position awaiting an outcome and
//! hands confirmed outcomes back to the engine over a channel. The engine
//! stays the only writer of the ledger.

use crate::exchange::ResolutionSource;
use crate::market::Side;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A position the engine wants resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSettlement {
    pub condition_id: String,
    pub label: String,
}

/// Winning side for one market.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementOutcome {
    pub condition_id: String,
    pub label: String,
    pub outcome: Side,
}

/// Engine side of the tracker channels.
pub struct SettlementChannels {
    pub pending: watch::Sender<Vec<PendingSettlement>>,
    pub outcomes: mpsc::Receiver<SettlementOutcome>,
}

pub struct SettlementTracker {
    source: Arc<dyn ResolutionSource>,
    poll_interval: Duration,
    pending: watch::Receiver<Vec<PendingSettlement>>,
    outcomes: mpsc::Sender<SettlementOutcome>,
}

impl SettlementTracker {
    pub fn new(source: Arc<dyn ResolutionSource>, poll_secs: u64) -> (Self, SettlementChannels) {
        let (pending_tx, pending_rx) = watch::channel(Vec::new());
        let (outcome_tx, outcome_rx) = mpsc::channel(64);
        (
            Self {
                source,
                poll_interval: Duration::from_secs(poll_secs.max(1)),
                pending: pending_rx,
                outcomes: outcome_tx,
            },
            SettlementChannels {
                pending: pending_tx,
                outcomes: outcome_rx,
            },
        )
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Poll until the engine drops its side of the channels.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Sent but not yet removed from the pending list by the engine
        let mut reported: HashSet<String> = HashSet::new();

        loop {
            interval.tick().await;
            if self.outcomes.is_closed() || self.pending.has_changed().is_err() {
                info!("Engine gone, stopping settlement tracker");
                return;
            }

            let pending = self.pending.borrow().clone();
            reported.retain(|id| pending.iter().any(|p| &p.condition_id == id));
            let unresolved: Vec<PendingSettlement> = pending
                .into_iter()
                .filter(|p| !reported.contains(&p.condition_id))
                .collect();

            for item in unresolved {
                match self.source.resolve(&item.label).await {
                    Ok(Some(outcome)) => {
                        info!(market = %item.label, %outcome, "🏁 [SETTLE] Outcome resolved");
                        let message = SettlementOutcome {
                            condition_id: item.condition_id.clone(),
                            label: item.label,
                            outcome,
                        };
                        if self.outcomes.send(message).await.is_err() {
                            return;
                        }
                        reported.insert(item.condition_id);
                    }
                    Ok(None) => debug!(market = %item.label, "Not resolved yet"),
                    Err(e) => warn!(market = %item.label, error = %e, "Resolution lookup failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct FakeResolver {
        resolved: Mutex<Vec<(String, Side)>>,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl ResolutionSource for FakeResolver {
        async fn resolve(&self, label: &str) -> anyhow::Result<Option<Side>> {
            *self.calls.lock() += 1;
            Ok(self
                .resolved
                .lock()
                .iter()
                .find(|(l, _)| l == label)
                .map(|(_, side)| *side))
        }
    }

    fn pending(id: &str) -> PendingSettlement {
        PendingSettlement {
            condition_id: id.to_string(),
            label: format!("btc-updown-15m-{}", id),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolved_outcome_is_sent_once() {
        let resolver = Arc::new(FakeResolver {
            resolved: Mutex::new(vec![("btc-updown-15m-c1".to_string(), Side::Down)]),
            calls: Mutex::new(0),
        });
        let (tracker, mut channels) = SettlementTracker::new(resolver.clone(), 30);
        channels
            .pending
            .send(vec![pending("c1"), pending("c2")])
            .unwrap();
        let handle = tracker.spawn();

        let outcome = channels.outcomes.recv().await.unwrap();
        assert_eq!(outcome.condition_id, "c1");
        assert_eq!(outcome.outcome, Side::Down);

        // Several more polls while c1 is still listed: no duplicate
        tokio::time::sleep(Duration::from_secs(95)).await;
        assert!(channels.outcomes.try_recv().is_err());
        assert!(*resolver.calls.lock() >= 4);

        drop(channels);
        let joined = tokio_test::assert_ok!(tokio::time::timeout(Duration::from_secs(60), handle).await);
        tokio_test::assert_ok!(joined);
    }
}
