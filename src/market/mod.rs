//! Market model, live quote mirror and market discovery.

pub mod discovery;
pub mod feed;
mod types;

pub use discovery::{expected_slugs, market_slug, MarketRegistry, RefreshOutcome, SlugTarget};
pub use feed::{FeedMessage, QuoteBook, QuoteObserver, DEFAULT_QUOTE_TTL_SECS};
pub use types::*;
