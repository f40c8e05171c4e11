//! Core market model: outcomes, settlement cohorts, markets and quotes.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome side of a binary Up/Down market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Up,
    Down,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Up => Side::Down,
            Side::Down => Side::Up,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Up => "up",
            Side::Down => "down",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Side {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "up" | "yes" => Ok(Side::Up),
            "down" | "no" => Ok(Side::Down),
            other => Err(anyhow::anyhow!("unknown outcome side: {}", other)),
        }
    }
}

/// Side of the order book a level belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSide {
    Bid,
    Ask,
}

/// Settlement cadence shared by every market in a cohort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Cohort {
    #[serde(rename = "15min")]
    FifteenMin,
    #[serde(rename = "1h")]
    Hourly,
}

impl Cohort {
    /// Length of one settlement slot.
    pub fn period_secs(&self) -> i64 {
        match self {
            Cohort::FifteenMin => 900,
            Cohort::Hourly => 3600,
        }
    }

    /// Tag used in venue market slugs.
    pub fn slug_tag(&self) -> &'static str {
        match self {
            Cohort::FifteenMin => "15m",
            Cohort::Hourly => "1h",
        }
    }

    /// Stable key used in logs, lock tokens and persistence.
    pub fn key(&self) -> &'static str {
        match self {
            Cohort::FifteenMin => "15min",
            Cohort::Hourly => "1h",
        }
    }

    /// Derive the cohort from a market's slot length.
    pub fn from_period_secs(secs: i64) -> Option<Cohort> {
        match secs {
            900 => Some(Cohort::FifteenMin),
            3600 => Some(Cohort::Hourly),
            _ => None,
        }
    }

    pub fn from_key(key: &str) -> Option<Cohort> {
        match key {
            "15min" | "15m" => Some(Cohort::FifteenMin),
            "1h" | "hourly" => Some(Cohort::Hourly),
            _ => None,
        }
    }

    /// Start of the slot containing `now`.
    pub fn slot_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let period = self.period_secs();
        let start = now.timestamp().div_euclid(period) * period;
        Utc.timestamp_opt(start, 0).single().unwrap_or(now)
    }

    /// Settlement instant of the slot containing `now`.
    pub fn slot_end(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.slot_start(now) + chrono::Duration::seconds(self.period_secs())
    }
}

impl fmt::Display for Cohort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// A tradable Up/Down market for one underlying asset and one settlement slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Market {
    /// Settlement condition id
    pub condition_id: String,
    /// Human label (venue slug)
    pub label: String,
    /// Underlying asset, lowercase (e.g., "btc")
    pub asset: String,
    pub expiry: DateTime<Utc>,
    pub up_token: String,
    pub down_token: String,
    pub cohort: Cohort,
}

impl Market {
    pub fn token(&self, side: Side) -> &str {
        match side {
            Side::Up => &self.up_token,
            Side::Down => &self.down_token,
        }
    }

    pub fn side_of(&self, token_id: &str) -> Option<Side> {
        if token_id == self.up_token {
            Some(Side::Up)
        } else if token_id == self.down_token {
            Some(Side::Down)
        } else {
            None
        }
    }

    /// Seconds left until settlement (negative once expired).
    pub fn seconds_to_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.expiry - now).num_seconds()
    }
}

/// A price level as mirrored from the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// Top-of-book view of one instrument. Zero price and size mean "no level".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub token_id: String,
    pub best_ask: Decimal,
    pub ask_size: Decimal,
    pub best_bid: Decimal,
    pub bid_size: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Quote {
    pub fn empty(token_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            token_id: token_id.to_string(),
            best_ask: Decimal::ZERO,
            ask_size: Decimal::ZERO,
            best_bid: Decimal::ZERO,
            bid_size: Decimal::ZERO,
            updated_at: at,
        }
    }

    pub fn has_ask(&self) -> bool {
        self.best_ask > Decimal::ZERO && self.ask_size > Decimal::ZERO
    }

    pub fn is_stale(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.updated_at > ttl
    }
}
