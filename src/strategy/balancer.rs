//! Periodic margin balancing between the two venues.
//!
//! Both legs bleed or accrue margin at different rates; when the split
//! drifts past a threshold, margin is moved from the heavy venue to the
//! light one. The move is three ordered steps (remove margin, cross-venue
//! transfer, add margin) with a compensating re-add if the transfer leg
//! fails. Money movement is never auto-retried; a partial run is recorded
//! and surfaced for the next scheduled pass or the operator.

use crate::bot::session::Leg;
use crate::error::{BalanceError, TransferStep};
use crate::exchange::{AdapterPair, Venue};
use crate::persistence::Store;
use crate::utils::decimal::imbalance_pct;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{error, info, warn};

/// Result of one balancing pass.
#[derive(Debug, PartialEq, Eq)]
pub enum BalanceOutcome {
    /// The split is within threshold (or there is nothing to balance).
    Balanced,
    /// Margin was moved and both sides ended near the midpoint.
    Completed {
        moved: Decimal,
        from: Venue,
        to: Venue,
    },
}

pub struct MarginBalancer {
    threshold_pct: Decimal,
}

impl MarginBalancer {
    pub fn new(threshold_pct: Decimal) -> Self {
        Self { threshold_pct }
    }

    /// Refresh leg margins from the venues and move margin from the heavy
    /// side to the light side when the imbalance crosses the threshold.
    pub async fn rebalance(
        &self,
        adapters: &AdapterPair,
        store: &Store,
        session_id: &str,
    ) -> Result<BalanceOutcome, BalanceError> {
        let legs = self.refresh_margins(adapters, store, session_id).await?;

        let long_venue = adapters.long.venue();
        let short_venue = adapters.short.venue();
        let long_total = venue_margin(&legs, long_venue);
        let short_total = venue_margin(&legs, short_venue);

        // A one-sided session has nothing to balance against.
        if long_total <= Decimal::ZERO || short_total <= Decimal::ZERO {
            return Ok(BalanceOutcome::Balanced);
        }

        let diff_pct = imbalance_pct(long_total, short_total);
        if diff_pct < self.threshold_pct {
            info!(
                session_id,
                long_margin = %long_total,
                short_margin = %short_total,
                diff_pct = %diff_pct,
                "Margin within threshold"
            );
            return Ok(BalanceOutcome::Balanced);
        }

        let (source_venue, target_venue, heavy, light) = if long_total >= short_total {
            (long_venue, short_venue, long_total, short_total)
        } else {
            (short_venue, long_venue, short_total, long_total)
        };
        let target_level = (heavy + light) / dec!(2);
        let amount = heavy - target_level;

        // Remove from the heaviest leg on the source side, add to the
        // lightest on the target side.
        let source_leg = extreme_leg(&legs, source_venue, true)
            .ok_or_else(|| no_leg_error(source_venue))?;
        let target_leg = extreme_leg(&legs, target_venue, false)
            .ok_or_else(|| no_leg_error(target_venue))?;

        info!(
            session_id,
            %source_venue,
            %target_venue,
            %amount,
            diff_pct = %diff_pct,
            "Rebalancing margin"
        );

        self.execute_transfer(
            adapters,
            store,
            session_id,
            source_venue,
            target_venue,
            &source_leg.symbol,
            &target_leg.symbol,
            amount,
        )
        .await?;

        Ok(BalanceOutcome::Completed {
            moved: amount,
            from: source_venue,
            to: target_venue,
        })
    }

    /// Pull current margins off the venues and write them back to the store
    /// so the totals reflect reality, not the last entry snapshot.
    async fn refresh_margins(
        &self,
        adapters: &AdapterPair,
        store: &Store,
        session_id: &str,
    ) -> Result<Vec<Leg>, BalanceError> {
        let mut legs = store.get_open_legs(session_id)?;
        for leg in &mut legs {
            let adapter = adapters.get(leg.venue)?;
            let position = adapter
                .open_positions(Some(&leg.symbol))
                .await?
                .into_iter()
                .next();
            if let Some(position) = position {
                leg.margin = position.margin;
                leg.mark_price = position.mark_price;
                leg.liquidation_price = position.liquidation_price;
                store.upsert_leg(leg)?;
            }
        }
        Ok(legs)
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_transfer(
        &self,
        adapters: &AdapterPair,
        store: &Store,
        session_id: &str,
        source_venue: Venue,
        target_venue: Venue,
        source_symbol: &str,
        target_symbol: &str,
        amount: Decimal,
    ) -> Result<(), BalanceError> {
        let source = adapters.get(source_venue)?;
        let target = adapters.get(target_venue)?;

        // Step 1: free the margin on the heavy side. A failure here leaves
        // everything untouched.
        if let Err(e) = source.adjust_margin(source_symbol, -amount).await {
            warn!(session_id, %source_venue, error = %e, "Margin removal failed");
            store.append_margin_balance(
                session_id,
                source_venue,
                target_venue,
                amount,
                "failed",
                Some(&e.to_string()),
            )?;
            return Err(BalanceError::StepFailed {
                step: TransferStep::RemoveMargin,
                source_venue,
                target_venue,
                amount,
                reason: e.to_string(),
                compensated: true,
            });
        }

        // Step 2: move the funds across venues. On failure the removed
        // margin is re-added so the source leg is not left underfunded.
        let now = Utc::now();
        let transfer_id = format!("mb-{}-{}", now.timestamp(), now.timestamp_subsec_nanos());
        if let Err(e) = source.transfer_funds(target_venue, amount, &transfer_id).await {
            warn!(session_id, %source_venue, %target_venue, error = %e, "Cross-venue transfer failed");
            let compensated = match source.adjust_margin(source_symbol, amount).await {
                Ok(()) => true,
                Err(re_add) => {
                    error!(
                        session_id,
                        %source_venue,
                        error = %re_add,
                        "Compensating margin re-add also failed"
                    );
                    false
                }
            };
            store.append_margin_balance(
                session_id,
                source_venue,
                target_venue,
                amount,
                "failed",
                Some(&e.to_string()),
            )?;
            return Err(BalanceError::StepFailed {
                step: TransferStep::CrossVenueTransfer,
                source_venue,
                target_venue,
                amount,
                reason: e.to_string(),
                compensated,
            });
        }

        // Step 3: back the light leg with the arrived funds. The funds have
        // already moved, so there is no compensation path; the run is
        // recorded as partial and the next pass sees the corrected totals.
        if let Err(e) = target.adjust_margin(target_symbol, amount).await {
            error!(
                session_id,
                %target_venue,
                error = %e,
                "Margin add failed after funds moved"
            );
            store.append_margin_balance(
                session_id,
                source_venue,
                target_venue,
                amount,
                "partial",
                Some(&e.to_string()),
            )?;
            return Err(BalanceError::StepFailed {
                step: TransferStep::AddMargin,
                source_venue,
                target_venue,
                amount,
                reason: e.to_string(),
                compensated: false,
            });
        }

        store.append_margin_balance(session_id, source_venue, target_venue, amount, "success", None)?;
        info!(session_id, %source_venue, %target_venue, %amount, "Margin rebalanced");
        Ok(())
    }
}

fn venue_margin(legs: &[Leg], venue: Venue) -> Decimal {
    legs.iter()
        .filter(|l| l.venue == venue)
        .map(|l| l.margin)
        .sum()
}

fn extreme_leg(legs: &[Leg], venue: Venue, largest: bool) -> Option<&Leg> {
    let on_venue = legs.iter().filter(|l| l.venue == venue);
    if largest {
        on_venue.max_by_key(|l| l.margin)
    } else {
        on_venue.min_by_key(|l| l.margin)
    }
}

fn no_leg_error(venue: Venue) -> BalanceError {
    BalanceError::Store(anyhow::anyhow!("no open leg on {venue} to adjust"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::session::LegStatus;
    use crate::exchange::{MockExchange, Side, VenuePosition};
    use std::sync::Arc;

    fn leg(leg_id: &str, venue: Venue, side: Side, margin: Decimal) -> Leg {
        Leg {
            leg_id: leg_id.to_string(),
            session_id: "s-1".to_string(),
            venue,
            symbol: "SOLUSDT".to_string(),
            side,
            size: dec!(10),
            entry_price: dec!(100),
            mark_price: dec!(100),
            liquidation_price: None,
            margin,
            leverage: dec!(3),
            risk_level: Decimal::ZERO,
            status: LegStatus::Open,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    fn venue_position(side: Side, margin: Decimal) -> VenuePosition {
        VenuePosition {
            symbol: "SOLUSDT".to_string(),
            side,
            size: dec!(10),
            entry_price: dec!(100),
            mark_price: dec!(100),
            liquidation_price: None,
            margin,
            leverage: dec!(3),
            unrealized_pnl: Decimal::ZERO,
        }
    }

    async fn setup(
        long_margin: Decimal,
        short_margin: Decimal,
    ) -> (AdapterPair, Store, Arc<MockExchange>, Arc<MockExchange>) {
        let long = Arc::new(MockExchange::new(Venue::Bybit));
        let short = Arc::new(MockExchange::new(Venue::Bitmex));
        long.seed_position(venue_position(Side::Long, long_margin)).await;
        short.seed_position(venue_position(Side::Short, short_margin)).await;

        let store = Store::new(":memory:").unwrap();
        store.upsert_leg(&leg("leg-1", Venue::Bybit, Side::Long, long_margin)).unwrap();
        store.upsert_leg(&leg("leg-2", Venue::Bitmex, Side::Short, short_margin)).unwrap();

        (AdapterPair::new(long.clone(), short.clone()), store, long, short)
    }

    #[tokio::test]
    async fn converges_both_sides_to_the_midpoint() {
        let (adapters, store, long, short) = setup(dec!(100), dec!(60)).await;

        let outcome = MarginBalancer::new(dec!(20))
            .rebalance(&adapters, &store, "s-1")
            .await
            .unwrap();

        // diff 40% of the larger side, so 20 moves across.
        assert_eq!(
            outcome,
            BalanceOutcome::Completed {
                moved: dec!(20),
                from: Venue::Bybit,
                to: Venue::Bitmex,
            }
        );
        assert_eq!(long.margin_of("SOLUSDT").await, Some(dec!(80)));
        assert_eq!(short.margin_of("SOLUSDT").await, Some(dec!(80)));
        assert_eq!(long.outbound_transfers().await, vec![(Venue::Bitmex, dec!(20))]);
    }

    #[tokio::test]
    async fn small_imbalance_is_left_alone() {
        let (adapters, store, long, short) = setup(dec!(100), dec!(90)).await;

        let outcome = MarginBalancer::new(dec!(20))
            .rebalance(&adapters, &store, "s-1")
            .await
            .unwrap();

        assert_eq!(outcome, BalanceOutcome::Balanced);
        assert_eq!(long.margin_of("SOLUSDT").await, Some(dec!(100)));
        assert_eq!(short.margin_of("SOLUSDT").await, Some(dec!(90)));
        assert!(long.outbound_transfers().await.is_empty());
    }

    #[tokio::test]
    async fn failed_transfer_re_adds_the_removed_margin() {
        let (adapters, store, long, short) = setup(dec!(100), dec!(60)).await;
        long.fail_cross_transfer(true).await;

        let err = MarginBalancer::new(dec!(20))
            .rebalance(&adapters, &store, "s-1")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BalanceError::StepFailed {
                step: TransferStep::CrossVenueTransfer,
                compensated: true,
                ..
            }
        ));
        // Source margin is restored, nothing moved.
        assert_eq!(long.margin_of("SOLUSDT").await, Some(dec!(100)));
        assert_eq!(short.margin_of("SOLUSDT").await, Some(dec!(60)));
        assert!(long.outbound_transfers().await.is_empty());
    }

    #[tokio::test]
    async fn failed_margin_add_is_reported_as_uncompensated() {
        let (adapters, store, long, short) = setup(dec!(100), dec!(60)).await;
        short.fail_margin_adjust(true).await;

        let err = MarginBalancer::new(dec!(20))
            .rebalance(&adapters, &store, "s-1")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BalanceError::StepFailed {
                step: TransferStep::AddMargin,
                compensated: false,
                ..
            }
        ));
        // The funds left the source venue but never backed the target leg.
        assert_eq!(long.margin_of("SOLUSDT").await, Some(dec!(80)));
        assert_eq!(short.margin_of("SOLUSDT").await, Some(dec!(60)));
        assert_eq!(long.outbound_transfers().await, vec![(Venue::Bitmex, dec!(20))]);
    }
}
