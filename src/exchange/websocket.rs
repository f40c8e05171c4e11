//! Polymarket market-channel WebSocket feed.
//!
//! Owns the only write path into the `QuoteBook`. On transport loss it
//! reconnects with exponential backoff, re-sending the full subscription set
//! in one batch, and gives up after a bounded number of failed attempts.

use crate::config::FeedConfig;
use crate::exchange::types::{OrderSide, SubscribeMessage, WsMessage, WsPriceLevel};
use crate::market::{BookSide, FeedMessage, PriceLevel, QuoteBook};
use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Serialize;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};

/// Commands accepted by a running feed.
#[derive(Debug, Clone)]
pub enum FeedCommand {
    /// Subscribe to additional instruments on the live connection
    Subscribe(Vec<String>),
}

/// Connection state shared between the feed task and the engine.
#[derive(Debug, Default)]
pub struct FeedHealth {
    connected: AtomicBool,
    gave_up: AtomicBool,
    reconnect_attempts: AtomicU32,
    disconnects: AtomicU64,
}

/// Point-in-time copy of the feed health, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeedHealthSnapshot {
    pub connected: bool,
    pub gave_up: bool,
    pub reconnect_attempts: u32,
    pub disconnects: u64,
    pub dropped_messages: u64,
}

impl FeedHealth {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn gave_up(&self) -> bool {
        self.gave_up.load(Ordering::Relaxed)
    }

    pub fn disconnects(&self) -> u64 {
        self.disconnects.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, dropped_messages: u64) -> FeedHealthSnapshot {
        FeedHealthSnapshot {
            connected: self.is_connected(),
            gave_up: self.gave_up(),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            disconnects: self.disconnects(),
            dropped_messages,
        }
    }

    fn on_connected(&self) {
        self.connected.store(true, Ordering::Relaxed);
        self.reconnect_attempts.store(0, Ordering::Relaxed);
    }

    fn on_disconnected(&self) {
        if self.connected.swap(false, Ordering::Relaxed) {
            self.disconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_attempt_failed(&self) -> u32 {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn on_gave_up(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.gave_up.store(true, Ordering::Relaxed);
    }
}

/// Exponential reconnect delay, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_ms: u64,
    max_ms: u64,
    multiplier: f64,
    current_ms: u64,
}

impl Backoff {
    pub fn new(initial_ms: u64, max_ms: u64, multiplier: f64) -> Self {
        Self {
            initial_ms,
            max_ms,
            multiplier,
            current_ms: initial_ms,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = Duration::from_millis(self.current_ms);
        let next = (self.current_ms as f64 * self.multiplier) as u64;
        self.current_ms = next.min(self.max_ms);
        delay
    }

    pub fn reset(&mut self) {
        self.current_ms = self.initial_ms;
    }
}

/// Handle used by the engine to talk to a running feed.
#[derive(Clone)]
pub struct FeedHandle {
    commands: mpsc::Sender<FeedCommand>,
    health: Arc<FeedHealth>,
}

impl FeedHandle {
    /// Ask the live connection to subscribe to new instruments.
    ///
    /// Never blocks; if the command queue is full the ids are still picked
    /// up by the next reconnect since the book keeps the full set.
    pub fn subscribe(&self, token_ids: Vec<String>) {
        if token_ids.is_empty() {
            return;
        }
        if let Err(e) = self.commands.try_send(FeedCommand::Subscribe(token_ids)) {
            warn!(error = %e, "Feed command queue unavailable");
        }
    }

    pub fn health(&self) -> &Arc<FeedHealth> {
        &self.health
    }
}

/// Market data stream feeding the quote mirror.
pub struct MarketFeed {
    url: String,
    book: Arc<QuoteBook>,
    health: Arc<FeedHealth>,
    backoff: Backoff,
    max_attempts: u32,
    ping_interval: Duration,
    commands: mpsc::Receiver<FeedCommand>,
}

impl MarketFeed {
    pub fn new(url: &str, config: &FeedConfig, book: Arc<QuoteBook>) -> (Self, FeedHandle) {
        let (tx, rx) = mpsc::channel(64);
        let health = Arc::new(FeedHealth::default());

        let feed = Self {
            url: url.to_string(),
            book,
            health: health.clone(),
            backoff: Backoff::new(
                config.reconnect_initial_ms,
                config.reconnect_max_ms,
                config.backoff_multiplier,
            ),
            max_attempts: config.max_reconnect_attempts,
            ping_interval: Duration::from_secs(config.ping_interval_secs.max(1)),
            commands: rx,
        };

        (feed, FeedHandle { commands: tx, health })
    }

    /// Run until every handle is dropped or the reconnect budget is spent.
    pub async fn run(mut self) {
        loop {
            match self.session().await {
                Ok(SessionEnd::HandlesDropped) => {
                    info!("Feed handles dropped, stopping market feed");
                    self.health.on_disconnected();
                    return;
                }
                Ok(SessionEnd::Disconnected) => {
                    self.health.on_disconnected();
                    self.backoff.reset();
                }
                Err(e) => {
                    self.health.on_disconnected();
                    let attempts = self.health.on_attempt_failed();
                    warn!(error = %e, attempts, "Market feed connection failed");

                    if attempts >= self.max_attempts {
                        error!(attempts, "Reconnect budget exhausted, giving up on market feed");
                        self.health.on_gave_up();
                        return;
                    }
                }
            }

            let delay = self.backoff.next_delay();
            info!(delay_ms = delay.as_millis() as u64, "Reconnecting market feed");
            tokio::time::sleep(delay).await;
        }
    }

    /// One connection lifetime.
    async fn session(&mut self) -> Result<SessionEnd> {
        info!(url = %self.url, "Connecting to market feed");
        let (ws, _) = connect_async(&self.url)
            .await
            .context("Failed to connect to WebSocket")?;
        let (mut write, mut read) = ws.split();

        self.health.on_connected();
        info!("📡 Market feed connected");

        // Full batch on every (re)connect
        let subscribed = self.book.subscribed();
        if !subscribed.is_empty() {
            send_subscribe(&mut write, subscribed).await?;
        }

        let book = self.book.clone();
        let mut ping = tokio::time::interval(self.ping_interval);
        ping.tick().await;

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => handle_frame(&book, text.as_str()),
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await.context("Failed to send pong")?;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Market feed closed by server");
                        return Ok(SessionEnd::Disconnected);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Market feed transport error");
                        return Ok(SessionEnd::Disconnected);
                    }
                    None => {
                        warn!("Market feed stream ended");
                        return Ok(SessionEnd::Disconnected);
                    }
                },
                cmd = self.commands.recv() => match cmd {
                    Some(FeedCommand::Subscribe(ids)) => send_subscribe(&mut write, ids).await?,
                    None => return Ok(SessionEnd::HandlesDropped),
                },
                _ = ping.tick() => {
                    write.send(Message::Text("PING".into())).await.context("Failed to send ping")?;
                }
            }
        }
    }
}

/// Apply one text frame to the mirror; malformed frames are counted and skipped.
fn handle_frame(book: &QuoteBook, text: &str) {
    if text == "PONG" {
        return;
    }
    trace!(bytes = text.len(), "Received feed frame");

    match parse_feed_messages(text) {
        Ok(messages) => {
            let now = Utc::now();
            for message in &messages {
                book.apply(message, now);
            }
        }
        Err(e) => book.record_dropped(&e.to_string()),
    }
}

enum SessionEnd {
    Disconnected,
    HandlesDropped,
}

async fn send_subscribe<S>(write: &mut S, asset_ids: Vec<String>) -> Result<()>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let total = asset_ids.len();
    let json = serde_json::to_string(&SubscribeMessage::market(asset_ids))
        .context("Failed to serialize subscription")?;
    write
        .send(Message::Text(json.into()))
        .await
        .context("Failed to send subscription")?;
    debug!(assets = total, "Subscribed to assets");
    Ok(())
}

/// Parse one text frame into mirror updates.
///
/// The venue sends either a single event object or an array of them. Any
/// unparsable price or size rejects the whole frame.
pub fn parse_feed_messages(text: &str) -> Result<Vec<FeedMessage>> {
    let raw: Vec<WsMessage> = if text.trim_start().starts_with('[') {
        serde_json::from_str(text).context("Malformed event array")?
    } else {
        vec![serde_json::from_str(text).context("Malformed event")?]
    };

    let mut out = Vec::new();
    for msg in raw {
        match msg {
            WsMessage::Book(book) => out.push(FeedMessage::Snapshot {
                token_id: book.asset_id,
                asks: parse_levels(&book.asks)?,
                bids: parse_levels(&book.bids)?,
            }),
            WsMessage::PriceChange(change) => {
                for c in change.price_changes {
                    out.push(FeedMessage::Delta {
                        token_id: c.asset_id,
                        side: match c.side {
                            OrderSide::Buy => BookSide::Bid,
                            OrderSide::Sell => BookSide::Ask,
                        },
                        price: parse_decimal(&c.price)?,
                        size: parse_decimal(&c.size)?,
                    });
                }
            }
            WsMessage::Unknown => out.push(FeedMessage::Unknown),
        }
    }
    Ok(out)
}

fn parse_levels(levels: &[WsPriceLevel]) -> Result<Vec<PriceLevel>> {
    levels
        .iter()
        .map(|l| Ok(PriceLevel::new(parse_decimal(&l.price)?, parse_decimal(&l.size)?)))
        .collect()
}

fn parse_decimal(raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw).with_context(|| format!("invalid decimal '{}'", raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_book_snapshot() {
        let text = r#"{
            "event_type": "book",
            "asset_id": "111",
            "market": "0xcond",
            "bids": [{"price": "0.44", "size": "10"}],
            "asks": [{"price": "0.47", "size": "25"}, {"price": "0.46", "size": "5"}]
        }"#;
        let messages = parse_feed_messages(text).unwrap();
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            FeedMessage::Snapshot { token_id, asks, bids } => {
                assert_eq!(token_id, "111");
                assert_eq!(asks.len(), 2);
                assert_eq!(bids[0].price, dec!(0.44));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_price_change_batch() {
        let text = r#"[{
            "event_type": "price_change",
            "price_changes": [
                {"asset_id": "111", "price": "0.48", "size": "30", "side": "SELL"},
                {"asset_id": "222", "price": "0.50", "size": "12", "side": "BUY"}
            ]
        }]"#;
        let messages = parse_feed_messages(text).unwrap();
        assert_eq!(
            messages,
            vec![
                FeedMessage::Delta {
                    token_id: "111".to_string(),
                    side: BookSide::Ask,
                    price: dec!(0.48),
                    size: dec!(30),
                },
                FeedMessage::Delta {
                    token_id: "222".to_string(),
                    side: BookSide::Bid,
                    price: dec!(0.50),
                    size: dec!(12),
                },
            ]
        );
    }

    #[test]
    fn test_parse_unknown_event() {
        let messages = parse_feed_messages(r#"{"event_type": "last_trade_price"}"#).unwrap();
        assert_eq!(messages, vec![FeedMessage::Unknown]);
    }

    #[test]
    fn test_malformed_frames_are_rejected() {
        assert!(parse_feed_messages("not json").is_err());
        let bad_price = r#"{"event_type": "book", "asset_id": "1", "asks": [{"price": "abc", "size": "1"}], "bids": []}"#;
        assert!(parse_feed_messages(bad_price).is_err());
    }

    #[test]
    fn test_malformed_frame_keeps_last_quote() {
        let book = QuoteBook::default();

        handle_frame(
            &book,
            r#"{"event_type": "book", "asset_id": "1", "asks": [{"price": "0.4", "size": "9"}], "bids": []}"#,
        );
        handle_frame(&book, r#"{"event_type": "book", "asset_id": "1", "asks": [{"price": "x"#);
        handle_frame(&book, "PONG");

        assert_eq!(book.read("1").unwrap().best_ask, dec!(0.4));
        assert_eq!(book.dropped_count(), 1);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(100, 500, 2.0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_feed_gives_up_after_bounded_attempts() {
        let config = FeedConfig {
            reconnect_initial_ms: 1,
            reconnect_max_ms: 2,
            max_reconnect_attempts: 2,
            ..FeedConfig::default()
        };
        // Nothing listens on port 9 (discard) locally
        let (feed, handle) =
            MarketFeed::new("ws://127.0.0.1:9", &config, Arc::new(QuoteBook::default()));
        feed.run().await;

        let health = handle.health().snapshot(0);
        assert!(!health.connected);
        assert!(health.gave_up);
        assert_eq!(health.reconnect_attempts, 2);
    }
}
