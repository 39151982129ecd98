//! Venue integrations.
//!
//! ## Bybit
//! USDT linear perpetuals on the v5 unified-account API. Two sub-wallets
//! (UNIFIED for trading, FUND for deposits/withdrawals).
//!
//! ## BitMEX
//! USDT linear perpetuals on the v1 REST API. Quantities are in contracts,
//! converted through the instrument's position multiplier; a single wallet
//! holds everything.
//!
//! All venue quirks stay behind [`ExchangeAdapter`]; core logic never
//! branches on venue names.

pub mod bitmex;
pub mod bybit;
pub mod mock;
mod traits;
mod types;

pub use bitmex::BitmexClient;
pub use bybit::BybitClient;
pub use mock::MockExchange;
pub use traits::{AdapterPair, ExchangeAdapter};
pub use types::*;
