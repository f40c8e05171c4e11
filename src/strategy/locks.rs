//! Hazard controls shared by concurrent order slices: the
//! `(cohort, asset, side)` lock set and per-market cooldowns.

use crate::market::{Cohort, Side};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Key guarding one side of one asset within a cohort.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub cohort: Cohort,
    pub asset: String,
    pub side: Side,
}

impl LockKey {
    pub fn new(cohort: Cohort, asset: impl Into<String>, side: Side) -> Self {
        Self {
            cohort,
            asset: asset.into(),
            side,
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.cohort, self.asset, self.side)
    }
}

/// Set of held lock keys. Test-and-set happens under one mutex.
#[derive(Debug, Default)]
pub struct LockSet {
    held: Mutex<HashSet<LockKey>>,
}

impl LockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the key is already held.
    pub fn try_acquire(&self, key: &LockKey) -> bool {
        self.held.lock().insert(key.clone())
    }

    pub fn release(&self, key: &LockKey) -> bool {
        self.held.lock().remove(key)
    }

    pub fn is_held(&self, key: &LockKey) -> bool {
        self.held.lock().contains(key)
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Acquire and hand back a guard that releases on drop.
    pub fn guard(self: &Arc<Self>, key: LockKey) -> Option<LockGuard> {
        if !self.try_acquire(&key) {
            return None;
        }
        Some(LockGuard {
            set: Arc::clone(self),
            key,
        })
    }
}

/// Releases its key when dropped, whichever way the slice exits.
#[derive(Debug)]
pub struct LockGuard {
    set: Arc<LockSet>,
    key: LockKey,
}

impl LockGuard {
    pub fn key(&self) -> &LockKey {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.set.release(&self.key);
    }
}

/// Last submission time per market.
#[derive(Debug)]
pub struct MarketCooldowns {
    window: chrono::Duration,
    last: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MarketCooldowns {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window: chrono::Duration::milliseconds(window_ms as i64),
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Check and stamp in one step. Returns `false` while the market is cooling.
    pub fn try_begin(&self, condition_id: &str, now: DateTime<Utc>) -> bool {
        let mut last = self.last.lock();
        if let Some(at) = last.get(condition_id) {
            if now - *at < self.window {
                return false;
            }
        }
        last.insert(condition_id.to_string(), now);
        true
    }

    /// Like `try_begin` for several markets: either every market is stamped or none.
    pub fn try_begin_all(&self, condition_ids: &[&str], now: DateTime<Utc>) -> bool {
        let mut last = self.last.lock();
        let cooling = condition_ids
            .iter()
            .any(|id| last.get(*id).is_some_and(|at| now - *at < self.window));
        if cooling {
            return false;
        }
        for id in condition_ids {
            last.insert((*id).to_string(), now);
        }
        true
    }

    pub fn is_cooling(&self, condition_id: &str, now: DateTime<Utc>) -> bool {
        self.last
            .lock()
            .get(condition_id)
            .is_some_and(|at| now - *at < self.window)
    }

    /// Drop entries for markets that no longer trade.
    pub fn retain(&self, keep: &[String]) {
        self.last.lock().retain(|id, _| keep.contains(id));
    }
}
