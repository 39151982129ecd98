//! Emergency position closing.
//!
//! Closes every open leg of a session, venue by venue in a stable order.
//! One failed close never aborts the rest: the report carries what closed
//! and what is still open for the next tick to retry.

use crate::bot::session::Leg;
use crate::exchange::AdapterPair;
use crate::persistence::Store;
use crate::risk::monitor::Severity;
use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{error, info, warn};

/// Why a close-all sweep was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseTrigger {
    /// A leg crossed the risk ceiling.
    RiskBreach,
    /// Operator-requested shutdown.
    OperatorStop,
}

impl CloseTrigger {
    fn event_type(&self) -> &'static str {
        match self {
            CloseTrigger::RiskBreach => "emergency_close",
            CloseTrigger::OperatorStop => "session_stop",
        }
    }

    fn severity(&self) -> Severity {
        match self {
            CloseTrigger::RiskBreach => Severity::Critical,
            CloseTrigger::OperatorStop => Severity::Low,
        }
    }
}

/// Outcome of one close-all sweep.
#[derive(Debug, Default)]
pub struct CloseReport {
    pub closed: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub realized_pnl: Decimal,
}

impl CloseReport {
    pub fn closed_count(&self) -> usize {
        self.closed.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// No leg is left open on any venue.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct EmergencyCloser;

impl EmergencyCloser {
    /// Close all open legs of a session. Legs are grouped per venue in a
    /// stable (venue, symbol) order; each close is attempted exactly once
    /// with its own idempotency key.
    pub async fn close_all(
        &self,
        adapters: &AdapterPair,
        store: &Store,
        session_id: &str,
        trigger: CloseTrigger,
    ) -> Result<CloseReport> {
        let legs = store.get_open_legs(session_id)?;
        let mut report = CloseReport::default();

        if legs.is_empty() {
            info!(session_id, "No open legs to close");
            return Ok(report);
        }

        info!(session_id, legs = legs.len(), trigger = ?trigger, "Closing all legs");

        for leg in &legs {
            match self.close_leg(adapters, store, leg).await {
                Ok(pnl) => {
                    report.realized_pnl += pnl;
                    report.closed.push(leg.leg_id.clone());
                }
                Err(e) => {
                    error!(
                        leg_id = %leg.leg_id,
                        venue = %leg.venue,
                        symbol = %leg.symbol,
                        error = %e,
                        "Failed to close leg, leaving it for the next tick"
                    );
                    report.failed.push((leg.leg_id.clone(), e.to_string()));
                }
            }
        }

        store.append_risk_event(
            session_id,
            trigger.event_type(),
            trigger.severity().as_str(),
            &json!({
                "closed_count": report.closed_count(),
                "failed_count": report.failed_count(),
                "failed_legs": report.failed,
                "realized_pnl": report.realized_pnl.to_string(),
            }),
        )?;

        if !report.is_complete() {
            warn!(
                session_id,
                closed = report.closed_count(),
                failed = report.failed_count(),
                "Close-all left legs open"
            );
        }

        Ok(report)
    }

    async fn close_leg(&self, adapters: &AdapterPair, store: &Store, leg: &Leg) -> Result<Decimal> {
        let adapter = adapters.get(leg.venue)?;

        // The venue may have nothing left to close (externally closed or
        // liquidated); archiving at the last mark is the best we can do.
        let on_venue = adapter
            .open_positions(Some(&leg.symbol))
            .await?
            .into_iter()
            .next();
        let Some(_) = on_venue else {
            info!(leg_id = %leg.leg_id, symbol = %leg.symbol, "Position already gone on venue");
            return Ok(store.close_leg(leg, leg.mark_price)?);
        };

        let now = Utc::now();
        let order_id = format!("close-{}-{}", now.timestamp(), now.timestamp_subsec_nanos());
        let result = adapter.close_position(&leg.symbol, None, &order_id).await?;

        let pnl = store.close_leg(leg, result.exit_price)?;
        info!(
            leg_id = %leg.leg_id,
            venue = %leg.venue,
            symbol = %leg.symbol,
            exit_price = %result.exit_price,
            %pnl,
            "Leg closed"
        );
        Ok(pnl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::session::LegStatus;
    use crate::exchange::{MockExchange, Side, Venue, VenuePosition};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn leg(leg_id: &str, venue: Venue, symbol: &str, side: Side) -> Leg {
        Leg {
            leg_id: leg_id.to_string(),
            session_id: "s-1".to_string(),
            venue,
            symbol: symbol.to_string(),
            side,
            size: dec!(10),
            entry_price: dec!(100),
            mark_price: dec!(100),
            liquidation_price: None,
            margin: dec!(333),
            leverage: dec!(3),
            risk_level: Decimal::ZERO,
            status: LegStatus::Open,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    fn venue_position(symbol: &str, side: Side) -> VenuePosition {
        VenuePosition {
            symbol: symbol.to_string(),
            side,
            size: dec!(10),
            entry_price: dec!(100),
            mark_price: dec!(100),
            liquidation_price: None,
            margin: dec!(333),
            leverage: dec!(3),
            unrealized_pnl: Decimal::ZERO,
        }
    }

    async fn setup() -> (AdapterPair, Store, Arc<MockExchange>, Arc<MockExchange>) {
        let long = Arc::new(MockExchange::new(Venue::Bybit));
        let short = Arc::new(MockExchange::new(Venue::Bitmex));
        let adapters = AdapterPair::new(long.clone(), short.clone());
        let store = Store::new(":memory:").unwrap();
        (adapters, store, long, short)
    }

    #[tokio::test]
    async fn closes_both_legs() {
        let (adapters, store, long, short) = setup().await;
        long.seed_position(venue_position("SOLUSDT", Side::Long)).await;
        short.seed_position(venue_position("SOLUSDT", Side::Short)).await;
        store.upsert_leg(&leg("leg-1", Venue::Bybit, "SOLUSDT", Side::Long)).unwrap();
        store.upsert_leg(&leg("leg-2", Venue::Bitmex, "SOLUSDT", Side::Short)).unwrap();

        let report = EmergencyCloser
            .close_all(&adapters, &store, "s-1", CloseTrigger::RiskBreach)
            .await
            .unwrap();

        assert_eq!(report.closed_count(), 2);
        assert!(report.is_complete());
        assert!(store.get_open_legs("s-1").unwrap().is_empty());
        assert_eq!(long.open_position_count().await, 0);
        assert_eq!(short.open_position_count().await, 0);
    }

    #[tokio::test]
    async fn one_failed_close_does_not_abort_the_rest() {
        let (adapters, store, long, short) = setup().await;
        long.seed_position(venue_position("SOLUSDT", Side::Long)).await;
        long.seed_position(venue_position("ETHUSDT", Side::Long)).await;
        short.seed_position(venue_position("SOLUSDT", Side::Short)).await;
        store.upsert_leg(&leg("leg-1", Venue::Bybit, "ETHUSDT", Side::Long)).unwrap();
        store.upsert_leg(&leg("leg-2", Venue::Bybit, "SOLUSDT", Side::Long)).unwrap();
        store.upsert_leg(&leg("leg-3", Venue::Bitmex, "SOLUSDT", Side::Short)).unwrap();

        long.fail_close_on("ETHUSDT").await;

        let report = EmergencyCloser
            .close_all(&adapters, &store, "s-1", CloseTrigger::RiskBreach)
            .await
            .unwrap();

        assert_eq!(report.closed_count(), 2);
        assert_eq!(report.failed_count(), 1);
        assert!(!report.is_complete());

        let remaining = store.get_open_legs("s-1").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].leg_id, "leg-1");
    }

    #[tokio::test]
    async fn leg_already_gone_on_venue_is_archived() {
        let (adapters, store, _long, _short) = setup().await;
        store.upsert_leg(&leg("leg-1", Venue::Bybit, "SOLUSDT", Side::Long)).unwrap();

        let report = EmergencyCloser
            .close_all(&adapters, &store, "s-1", CloseTrigger::OperatorStop)
            .await
            .unwrap();

        assert_eq!(report.closed_count(), 1);
        assert!(store.get_open_legs("s-1").unwrap().is_empty());
    }
}
