//! Polymarket integration.
//!
//! - Gamma REST: market discovery by slug and settlement resolution
//! - CLOB REST: fill-and-kill order entry with L2 HMAC auth
//! - Market WebSocket: book snapshots and top-of-book deltas
//! - Paper venue: fills against the mirrored book for dry runs

mod client;
pub mod mock;
pub mod traits;
mod types;
mod websocket;

pub use client::PolymarketClient;
pub use mock::MockVenue;
pub use traits::{MarketDiscovery, OrderGateway, ResolutionSource};
pub use types::*;
pub use websocket::{
    parse_feed_messages, Backoff, FeedCommand, FeedHandle, FeedHealth, FeedHealthSnapshot,
    MarketFeed,
};
