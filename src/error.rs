//! Typed error taxonomy for the trading core.
//!
//! Transient adapter errors are caught at the loop level and retried on the
//! next tick. Partial-state errors (`RollbackFailed`, `StepFailed`) are never
//! auto-retried; they are persisted as high-severity events and left for the
//! next monitor tick or the operator.

use crate::exchange::Venue;
use rust_decimal::Decimal;
use thiserror::Error;

/// Errors surfaced by an [`crate::exchange::ExchangeAdapter`].
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{venue} request timed out")]
    Timeout { venue: Venue },

    #[error("{venue} unavailable: {reason}")]
    Unavailable { venue: Venue, reason: String },

    #[error("{venue} rejected order: {reason}")]
    OrderRejected { venue: Venue, reason: String },

    #[error("no tradable perpetual for {base_asset} on {venue}")]
    SymbolNotFound { venue: Venue, base_asset: String },

    #[error("{venue} authentication failed: {reason}")]
    Auth { venue: Venue, reason: String },

    #[error("{venue} returned malformed data: {reason}")]
    Decode { venue: Venue, reason: String },
}

impl AdapterError {
    /// Map a reqwest failure onto the taxonomy, preserving the timeout case
    /// so loop-level retry policy can distinguish it.
    pub fn from_http(venue: Venue, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AdapterError::Timeout { venue }
        } else {
            AdapterError::Unavailable {
                venue,
                reason: err.to_string(),
            }
        }
    }

    /// Whether the call is safe to retry on a later tick without an
    /// idempotency key (reads only).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AdapterError::Timeout { .. } | AdapterError::Unavailable { .. }
        )
    }
}

/// Errors from opening the initial leg pair.
///
/// "Already open" is deliberately not here: it is an idempotent signal
/// reported through [`crate::strategy::EntryOutcome`], not a failure.
#[derive(Debug, Error)]
pub enum EntryError {
    #[error("insufficient capital on {venue}: required {required}, available {available}")]
    InsufficientCapital {
        venue: Venue,
        required: Decimal,
        available: Decimal,
    },

    #[error("long leg rejected on {venue}: {reason}")]
    LongLegRejected { venue: Venue, reason: String },

    /// Short leg failed after the long leg filled; the compensating close of
    /// the long leg succeeded, so no position is left open.
    #[error("short leg rejected on {venue} ({reason}); long leg on {long_venue} was closed")]
    ShortLegFailed {
        venue: Venue,
        reason: String,
        long_venue: Venue,
    },

    /// Short leg failed after the long leg filled and the compensating close
    /// also failed: one leg is still open and requires operator attention.
    #[error(
        "short leg rejected on {venue} ({reason}); rollback of long {symbol} on {long_venue} \
         failed: {close_error}"
    )]
    RollbackFailed {
        venue: Venue,
        reason: String,
        long_venue: Venue,
        symbol: String,
        close_error: String,
    },

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("persistence failure: {0}")]
    Store(#[from] anyhow::Error),
}

impl EntryError {
    /// A leg survived the failure and must be reconciled manually; the
    /// controller surfaces this as degraded instead of retrying.
    pub fn leaves_open_leg(&self) -> bool {
        matches!(self, EntryError::RollbackFailed { .. })
    }
}

/// The three ordered steps of a margin balance transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStep {
    RemoveMargin,
    CrossVenueTransfer,
    AddMargin,
}

impl std::fmt::Display for TransferStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferStep::RemoveMargin => write!(f, "remove_margin"),
            TransferStep::CrossVenueTransfer => write!(f, "cross_venue_transfer"),
            TransferStep::AddMargin => write!(f, "add_margin"),
        }
    }
}

/// Errors from the margin balancer.
#[derive(Debug, Error)]
pub enum BalanceError {
    /// One of the three transfer steps failed. `compensated` reports whether
    /// the previous step was successfully undone; money-movement errors are
    /// never silently retried.
    #[error(
        "margin balance failed at {step} ({source_venue} -> {target_venue}, {amount} USDT): \
         {reason} (compensated: {compensated})"
    )]
    StepFailed {
        step: TransferStep,
        source_venue: Venue,
        target_venue: Venue,
        amount: Decimal,
        reason: String,
        compensated: bool,
    },

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("persistence failure: {0}")]
    Store(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let timeout = AdapterError::Timeout { venue: Venue::Bybit };
        let rejected = AdapterError::OrderRejected {
            venue: Venue::Bybit,
            reason: "bad qty".into(),
        };
        assert!(timeout.is_transient());
        assert!(!rejected.is_transient());
    }

    #[test]
    fn rollback_failed_is_flagged_as_degraded() {
        let err = EntryError::RollbackFailed {
            venue: Venue::Bitmex,
            reason: "down".into(),
            long_venue: Venue::Bybit,
            symbol: "SOLUSDT".into(),
            close_error: "also down".into(),
        };
        assert!(err.leaves_open_leg());

        let err = EntryError::ShortLegFailed {
            venue: Venue::Bitmex,
            reason: "down".into(),
            long_venue: Venue::Bybit,
        };
        assert!(!err.leaves_open_leg());
    }
}
