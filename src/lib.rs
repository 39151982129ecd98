//! # Delta Pair Bot
//!
//! Operates a delta-neutral cross-exchange position: one leveraged long leg
//! on one venue, one leveraged short leg on another, kept alive until the
//! operator stops it.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: Venue adapters (Bybit/BitMEX REST clients, mock for tests)
//! - `strategy`: Entry, capital allocation, reopen cycle, margin balancing
//! - `risk`: Liquidation-distance monitoring and emergency closing
//! - `bot`: Session state machine and the lifecycle controller
//! - `persistence`: SQLite store for sessions, legs and event logs
//! - `utils`: Shared decimal arithmetic helpers

pub mod bot;
pub mod config;
pub mod error;
pub mod exchange;
pub mod persistence;
pub mod risk;
pub mod strategy;
pub mod utils;

pub use config::Config;
