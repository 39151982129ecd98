//! Venue-agnostic types shared by all exchange adapters.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Venue identifier. One adapter implementation per variant, selected once
/// at session construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Bybit,
    Bitmex,
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Venue::Bybit => write!(f, "bybit"),
            Venue::Bitmex => write!(f, "bitmex"),
        }
    }
}

impl std::str::FromStr for Venue {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bybit" => Ok(Venue::Bybit),
            "bitmex" => Ok(Venue::Bitmex),
            other => Err(format!("unknown venue: {other}")),
        }
    }
}

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Sign applied to a quantity when submitting an order for this side.
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Long => Decimal::ONE,
            Side::Short => -Decimal::ONE,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "long"),
            Side::Short => write!(f, "short"),
        }
    }
}

/// Sub-wallet on a venue. Venues with a single account report everything
/// under `Trading`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Wallet {
    /// The wallet margin is drawn from when opening positions.
    Trading,
    /// Holding wallet for deposits/withdrawals (Bybit FUND account).
    Funding,
}

impl fmt::Display for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Wallet::Trading => write!(f, "trading"),
            Wallet::Funding => write!(f, "funding"),
        }
    }
}

/// Resolved contract metadata for a base asset on one venue.
///
/// `contract_multiplier` converts a base-asset quantity into the venue's
/// order quantity units (1 for venues quoting directly in base units).
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolSpec {
    pub symbol: String,
    pub lot_step: Decimal,
    pub contract_multiplier: Decimal,
}

/// Result of a filled (or partially filled) order.
#[derive(Debug, Clone)]
pub struct OrderFill {
    pub order_id: String,
    /// Filled size in venue order units (convert back with the multiplier).
    pub filled_size: Decimal,
    pub avg_price: Decimal,
}

/// An open position as reported by a venue, normalized.
#[derive(Debug, Clone)]
pub struct VenuePosition {
    pub symbol: String,
    pub side: Side,
    /// Size in base-asset units.
    pub size: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    /// Zero/absent on some venues right after entry; callers must degrade
    /// gracefully.
    pub liquidation_price: Option<Decimal>,
    /// Isolated margin currently assigned to the position, in USDT.
    pub margin: Decimal,
    pub leverage: Decimal,
    pub unrealized_pnl: Decimal,
}

/// Result of closing (part of) a position.
#[derive(Debug, Clone)]
pub struct CloseResult {
    pub closed_size: Decimal,
    pub exit_price: Decimal,
}

/// Per-currency balance of one wallet.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WalletBalance {
    pub free: Decimal,
    pub used: Decimal,
    pub total: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn venue_round_trips_through_str() {
        assert_eq!("bybit".parse::<Venue>().unwrap(), Venue::Bybit);
        assert_eq!("BitMEX".parse::<Venue>().unwrap(), Venue::Bitmex);
        assert!("kraken".parse::<Venue>().is_err());
        assert_eq!(Venue::Bybit.to_string(), "bybit");
    }

    #[test]
    fn side_sign_and_opposite() {
        assert_eq!(Side::Long.sign(), dec!(1));
        assert_eq!(Side::Short.sign(), dec!(-1));
        assert_eq!(Side::Long.opposite(), Side::Short);
    }
}
