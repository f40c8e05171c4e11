//! # UpDown Arb
//!
//! Market-neutral arbitrage on Polymarket's recurring Up/Down markets.
//! Buys both outcomes of a settlement cohort when the pair costs less than
//! the $1 payout, keeps the cohort balanced, and caps losses near expiry.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `market`: Market model, slug discovery and the live quote mirror
//! - `exchange`: Polymarket REST/WebSocket clients and the paper venue
//! - `ledger`: Positions, cohort aggregation and settlement accounting
//! - `strategy`: Opportunity scanning, order execution and hedging
//! - `risk`: Near-expiry risk monitoring and malfunction detection
//! - `engine`: The trading loop and the settlement tracker
//! - `notify`: Structured engine events
//! - `persistence`: SQLite-based ledger persistence
//! - `utils`: Shared utilities and decimal arithmetic

pub mod config;
pub mod engine;
pub mod exchange;
pub mod ledger;
pub mod market;
pub mod notify;
pub mod persistence;
pub mod risk;
pub mod strategy;
pub mod utils;

pub use config::Config;
