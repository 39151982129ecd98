//! The venue adapter contract.
//!
//! One implementation per venue normalizes symbol formats, contract
//! multipliers and authentication behind this interface; the trading core
//! never branches on venue names.

use crate::error::AdapterError;
use crate::exchange::types::{
    CloseResult, OrderFill, SymbolSpec, Venue, VenuePosition, Wallet, WalletBalance,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;

/// Client for one venue, scoped to one user's credentials.
///
/// Read calls are retried internally with bounded backoff; mutating calls
/// (`submit_order`, `close_position`, `adjust_margin`, both transfers) are
/// attempted once and carry a caller-generated idempotency key, because a
/// blind retry of a money-movement call risks doubling it.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn venue(&self) -> Venue;

    /// Resolve the tradable perpetual contract for a base asset.
    async fn resolve_symbol(&self, base_asset: &str) -> Result<SymbolSpec, AdapterError>;

    /// Current mark price for a resolved symbol.
    async fn mark_price(&self, symbol: &str) -> Result<Decimal, AdapterError>;

    /// Submit a market order. Positive quantity opens/extends long exposure,
    /// negative short. Quantity is in venue order units.
    async fn submit_order(
        &self,
        symbol: &str,
        signed_qty: Decimal,
        client_order_id: &str,
    ) -> Result<OrderFill, AdapterError>;

    /// All open positions, optionally filtered to one symbol.
    async fn open_positions(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<VenuePosition>, AdapterError>;

    /// Close the open position on `symbol` (entirely when `size` is `None`).
    async fn close_position(
        &self,
        symbol: &str,
        size: Option<Decimal>,
        client_order_id: &str,
    ) -> Result<CloseResult, AdapterError>;

    /// Add (positive) or remove (negative) isolated margin on a position.
    async fn adjust_margin(&self, symbol: &str, signed_amount: Decimal)
        -> Result<(), AdapterError>;

    /// USDT balance per sub-wallet.
    async fn balances(&self) -> Result<HashMap<Wallet, WalletBalance>, AdapterError>;

    /// Move USDT between this venue's own sub-wallets.
    async fn transfer_internal(
        &self,
        from: Wallet,
        to: Wallet,
        amount: Decimal,
        transfer_id: &str,
    ) -> Result<(), AdapterError>;

    /// Withdraw USDT toward another venue's deposit address. Often an
    /// on-chain operation; slow, and never retried automatically.
    async fn transfer_funds(
        &self,
        destination: Venue,
        amount: Decimal,
        transfer_id: &str,
    ) -> Result<(), AdapterError>;
}

/// The two adapters of a session, selected once at construction.
#[derive(Clone)]
pub struct AdapterPair {
    pub long: Arc<dyn ExchangeAdapter>,
    pub short: Arc<dyn ExchangeAdapter>,
}

impl AdapterPair {
    pub fn new(long: Arc<dyn ExchangeAdapter>, short: Arc<dyn ExchangeAdapter>) -> Self {
        Self { long, short }
    }

    /// Adapter for one of the pair's venues.
    pub fn get(&self, venue: Venue) -> Result<&Arc<dyn ExchangeAdapter>, AdapterError> {
        if self.long.venue() == venue {
            Ok(&self.long)
        } else if self.short.venue() == venue {
            Ok(&self.short)
        } else {
            Err(AdapterError::Unavailable {
                venue,
                reason: "venue is not part of this session".to_string(),
            })
        }
    }

    pub fn both(&self) -> [&Arc<dyn ExchangeAdapter>; 2] {
        [&self.long, &self.short]
    }
}
