//! Market feed mirror: best bid/ask per instrument, fed by the venue stream.
//!
//! The mirror is written only by the feed task and read by everything else.
//! Each quote is replaced whole under a short write lock, so readers always
//! see a consistent copy.

use crate::market::types::{BookSide, PriceLevel, Quote};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Default freshness window for a quote.
pub const DEFAULT_QUOTE_TTL_SECS: i64 = 10;

/// Parsed venue message, already reduced to what the mirror understands.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// Full book for one instrument
    Snapshot {
        token_id: String,
        asks: Vec<PriceLevel>,
        bids: Vec<PriceLevel>,
    },
    /// Top-of-book change for one side of one instrument
    Delta {
        token_id: String,
        side: BookSide,
        price: Decimal,
        size: Decimal,
    },
    /// Anything else the venue sends (ticks, trades, acks)
    Unknown,
}

/// Push notification for quote updates.
///
/// Fires at most once per applied update, after the mirror has released its
/// write lock.
pub trait QuoteObserver: Send + Sync {
    fn on_quote(&self, quote: &Quote);
}

/// Mirror of the venue's top of book.
pub struct QuoteBook {
    quotes: RwLock<HashMap<String, Quote>>,
    subscriptions: RwLock<BTreeSet<String>>,
    observers: RwLock<Vec<Arc<dyn QuoteObserver>>>,
    ttl: chrono::Duration,
    applied: AtomicU64,
    dropped: AtomicU64,
}

impl QuoteBook {
    pub fn new(ttl: chrono::Duration) -> Self {
        Self {
            quotes: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(BTreeSet::new()),
            observers: RwLock::new(Vec::new()),
            ttl,
            applied: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register interest in instruments. Returns the ids that were not
    /// already subscribed.
    pub fn subscribe(&self, token_ids: &[String]) -> Vec<String> {
        let mut subs = self.subscriptions.write();
        token_ids
            .iter()
            .filter(|id| subs.insert((*id).clone()))
            .cloned()
            .collect()
    }

    /// Drop subscriptions (and quotes) for instruments no longer tracked.
    pub fn retain_subscriptions(&self, keep: &[String]) -> usize {
        let keep: BTreeSet<&String> = keep.iter().collect();
        let removed: Vec<String> = {
            let mut subs = self.subscriptions.write();
            let removed: Vec<String> = subs.iter().filter(|id| !keep.contains(id)).cloned().collect();
            subs.retain(|id| keep.contains(id));
            removed
        };

        if !removed.is_empty() {
            let mut quotes = self.quotes.write();
            for id in &removed {
                quotes.remove(id);
            }
            debug!(removed = removed.len(), "Pruned stale subscriptions");
        }
        removed.len()
    }

    /// Every subscribed instrument, used for the re-subscribe batch.
    pub fn subscribed(&self) -> Vec<String> {
        self.subscriptions.read().iter().cloned().collect()
    }

    pub fn add_observer(&self, observer: Arc<dyn QuoteObserver>) {
        self.observers.write().push(observer);
    }

    /// Replace the book view for one instrument.
    pub fn apply_snapshot(&self, token_id: &str, asks: &[PriceLevel], bids: &[PriceLevel]) {
        self.apply_snapshot_at(token_id, asks, bids, Utc::now());
    }

    pub fn apply_snapshot_at(
        &self,
        token_id: &str,
        asks: &[PriceLevel],
        bids: &[PriceLevel],
        now: DateTime<Utc>,
    ) {
        let best_ask = best_level(asks, |candidate, best| candidate < best);
        let best_bid = best_level(bids, |candidate, best| candidate > best);

        let mut quote = Quote::empty(token_id, now);
        if let Some(level) = best_ask {
            quote.best_ask = level.price;
            quote.ask_size = level.size;
        }
        if let Some(level) = best_bid {
            quote.best_bid = level.price;
            quote.bid_size = level.size;
        }

        trace!(
            token_id,
            ask = %quote.best_ask,
            ask_size = %quote.ask_size,
            bid = %quote.best_bid,
            "Applied book snapshot"
        );
        self.store(quote);
    }

    /// Overwrite the best level of one side.
    pub fn apply_delta(&self, token_id: &str, side: BookSide, price: Decimal, size: Decimal) {
        self.apply_delta_at(token_id, side, price, size, Utc::now());
    }

    pub fn apply_delta_at(
        &self,
        token_id: &str,
        side: BookSide,
        price: Decimal,
        size: Decimal,
        now: DateTime<Utc>,
    ) {
        let mut quote = self
            .quotes
            .read()
            .get(token_id)
            .cloned()
            .unwrap_or_else(|| Quote::empty(token_id, now));

        match side {
            BookSide::Ask => {
                quote.best_ask = price;
                quote.ask_size = size;
            }
            BookSide::Bid => {
                quote.best_bid = price;
                quote.bid_size = size;
            }
        }
        quote.updated_at = now;
        self.store(quote);
    }

    /// Apply one parsed venue message.
    pub fn apply(&self, message: &FeedMessage, now: DateTime<Utc>) {
        match message {
            FeedMessage::Snapshot { token_id, asks, bids } => {
                self.apply_snapshot_at(token_id, asks, bids, now)
            }
            FeedMessage::Delta {
                token_id,
                side,
                price,
                size,
            } => self.apply_delta_at(token_id, *side, *price, *size, now),
            FeedMessage::Unknown => {}
        }
    }

    /// Count and log a message that could not be parsed. The mirror keeps
    /// its last good quote.
    pub fn record_dropped(&self, reason: &str) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(reason, dropped_total = total, "Dropped malformed feed message");
    }

    /// Fresh copy of a quote, or `None` when missing or stale.
    pub fn read(&self, token_id: &str) -> Option<Quote> {
        self.read_at(token_id, Utc::now())
    }

    pub fn read_at(&self, token_id: &str, now: DateTime<Utc>) -> Option<Quote> {
        let quotes = self.quotes.read();
        let quote = quotes.get(token_id)?;
        if quote.is_stale(now, self.ttl) {
            return None;
        }
        Some(quote.clone())
    }

    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn store(&self, quote: Quote) {
        {
            let mut quotes = self.quotes.write();
            quotes.insert(quote.token_id.clone(), quote.clone());
        }
        self.applied.fetch_add(1, Ordering::Relaxed);

        let observers: Vec<Arc<dyn QuoteObserver>> = self.observers.read().clone();
        for observer in observers {
            observer.on_quote(&quote);
        }
    }
}

impl Default for QuoteBook {
    fn default() -> Self {
        Self::new(chrono::Duration::seconds(DEFAULT_QUOTE_TTL_SECS))
    }
}

/// Linear scan for the best level; the first level seen wins exact ties.
fn best_level<F>(levels: &[PriceLevel], better: F) -> Option<PriceLevel>
where
    F: Fn(Decimal, Decimal) -> bool,
{
    let mut best: Option<PriceLevel> = None;
    for level in levels.iter().filter(|l| l.size > Decimal::ZERO) {
        match best {
            Some(current) if !better(level.price, current.price) => {}
            _ => best = Some(*level),
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    fn level(price: Decimal, size: Decimal) -> PriceLevel {
        PriceLevel::new(price, size)
    }

    #[test]
    fn test_snapshot_picks_lowest_ask_and_highest_bid() {
        let book = QuoteBook::default();
        book.apply_snapshot(
            "tok",
            &[level(dec!(0.52), dec!(10)), level(dec!(0.48), dec!(25)), level(dec!(0.50), dec!(5))],
            &[level(dec!(0.44), dec!(7)), level(dec!(0.46), dec!(3))],
        );

        let quote = book.read("tok").unwrap();
        assert_eq!(quote.best_ask, dec!(0.48));
        assert_eq!(quote.ask_size, dec!(25));
        assert_eq!(quote.best_bid, dec!(0.46));
        assert_eq!(quote.bid_size, dec!(3));
    }

    #[test]
    fn test_snapshot_tie_keeps_first_seen() {
        let book = QuoteBook::default();
        book.apply_snapshot(
            "tok",
            &[level(dec!(0.48), dec!(11)), level(dec!(0.48), dec!(99))],
            &[],
        );
        let quote = book.read("tok").unwrap();
        assert_eq!(quote.ask_size, dec!(11));
        assert_eq!(quote.best_bid, Decimal::ZERO);
    }

    #[test]
    fn test_snapshot_ignores_empty_levels() {
        let book = QuoteBook::default();
        book.apply_snapshot("tok", &[level(dec!(0.30), dec!(0)), level(dec!(0.35), dec!(4))], &[]);
        assert_eq!(book.read("tok").unwrap().best_ask, dec!(0.35));
    }

    #[test]
    fn test_delta_overwrites_best_level() {
        let book = QuoteBook::default();
        book.apply_snapshot("tok", &[level(dec!(0.40), dec!(100))], &[level(dec!(0.38), dec!(50))]);
        book.apply_delta("tok", BookSide::Ask, dec!(0.42), dec!(12));

        let quote = book.read("tok").unwrap();
        assert_eq!(quote.best_ask, dec!(0.42));
        assert_eq!(quote.ask_size, dec!(12));
        assert_eq!(quote.best_bid, dec!(0.38));
    }

    #[test]
    fn test_delta_creates_missing_quote() {
        let book = QuoteBook::default();
        book.apply_delta("new", BookSide::Bid, dec!(0.10), dec!(5));
        let quote = book.read("new").unwrap();
        assert_eq!(quote.best_bid, dec!(0.10));
        assert!(!quote.has_ask());
    }

    #[test]
    fn test_stale_quote_is_hidden() {
        let book = QuoteBook::new(chrono::Duration::seconds(10));
        let t0 = Utc::now();
        book.apply_snapshot_at("tok", &[level(dec!(0.40), dec!(1))], &[], t0);

        assert!(book.read_at("tok", t0 + chrono::Duration::seconds(10)).is_some());
        assert!(book.read_at("tok", t0 + chrono::Duration::seconds(11)).is_none());
        assert!(book.read_at("missing", t0).is_none());
    }

    #[test]
    fn test_subscribe_reports_only_new_ids() {
        let book = QuoteBook::default();
        let first = book.subscribe(&["a".to_string(), "b".to_string()]);
        let second = book.subscribe(&["b".to_string(), "c".to_string()]);
        assert_eq!(first, vec!["a", "b"]);
        assert_eq!(second, vec!["c"]);
        assert_eq!(book.subscribed(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_retain_prunes_quotes() {
        let book = QuoteBook::default();
        book.subscribe(&["a".to_string(), "b".to_string()]);
        book.apply_delta("a", BookSide::Ask, dec!(0.5), dec!(1));
        book.apply_delta("b", BookSide::Ask, dec!(0.5), dec!(1));

        assert_eq!(book.retain_subscriptions(&["b".to_string()]), 1);
        assert!(book.read("a").is_none());
        assert!(book.read("b").is_some());
    }

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl QuoteObserver for Recorder {
        fn on_quote(&self, quote: &Quote) {
            self.seen.lock().push(quote.token_id.clone());
        }
    }

    #[test]
    fn test_observer_fires_once_per_update() {
        let book = QuoteBook::default();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        book.add_observer(recorder.clone());

        book.apply_snapshot("a", &[level(dec!(0.5), dec!(1))], &[]);
        book.apply_delta("a", BookSide::Bid, dec!(0.4), dec!(1));
        book.apply(&FeedMessage::Unknown, Utc::now());

        assert_eq!(*recorder.seen.lock(), vec!["a", "a"]);
        assert_eq!(book.applied_count(), 2);
    }

    struct ReadingObserver {
        book: std::sync::Weak<QuoteBook>,
        asks: Mutex<Vec<Decimal>>,
    }

    impl QuoteObserver for ReadingObserver {
        fn on_quote(&self, quote: &Quote) {
            // Reading back must not deadlock: the write lock is already released.
            if let Some(book) = self.book.upgrade() {
                if let Some(q) = book.read(&quote.token_id) {
                    self.asks.lock().push(q.best_ask);
                }
            }
        }
    }

    #[test]
    fn test_observer_can_read_mirror() {
        let book = Arc::new(QuoteBook::default());
        let observer = Arc::new(ReadingObserver {
            book: Arc::downgrade(&book),
            asks: Mutex::new(Vec::new()),
        });
        book.add_observer(observer.clone());
        book.apply_delta("a", BookSide::Ask, dec!(0.33), dec!(2));
        assert_eq!(*observer.asks.lock(), vec![dec!(0.33)]);
    }

    #[test]
    fn test_dropped_messages_are_counted() {
        let book = QuoteBook::default();
        book.apply_delta("a", BookSide::Ask, dec!(0.33), dec!(2));
        book.record_dropped("bad json");
        book.record_dropped("missing price");
        assert_eq!(book.dropped_count(), 2);
        assert_eq!(book.read("a").unwrap().best_ask, dec!(0.33));
    }
}
