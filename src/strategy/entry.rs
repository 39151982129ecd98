//! Opening the delta-neutral pair.
//!
//! Entry is idempotent: if the session already has open legs (in the
//! store or live on a venue) nothing is submitted. Otherwise both venues
//! are funded first, then the long leg fills before the short; a failed
//! short triggers a best-effort close of the long so no naked exposure
//! survives the attempt.

use crate::bot::session::{Leg, LegStatus, Session};
use crate::config::TradeConfig;
use crate::error::EntryError;
use crate::exchange::{AdapterPair, OrderFill, Side, SymbolSpec, Venue, VenuePosition};
use crate::persistence::Store;
use crate::strategy::capital::CapitalAllocator;
use crate::utils::decimal::{round_down_to_lot, safe_div};
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn};

/// Result of an entry attempt.
#[derive(Debug)]
pub struct EntryOutcome {
    /// Legs already existed; nothing was submitted.
    pub already_open: bool,
    pub legs: Vec<Leg>,
}

pub struct EntryManager {
    trade: TradeConfig,
}

impl EntryManager {
    pub fn new(trade: TradeConfig) -> Self {
        Self { trade }
    }

    fn leverage(&self) -> Decimal {
        Decimal::from(self.trade.leverage)
    }

    /// Open the pair for a session, or report it already open.
    pub async fn open_pair(
        &self,
        adapters: &AdapterPair,
        store: &Store,
        session: &Session,
    ) -> Result<EntryOutcome, EntryError> {
        // Idempotency against our own records first.
        let existing = store.get_open_legs(&session.session_id)?;
        if !existing.is_empty() {
            info!(
                session_id = %session.session_id,
                legs = existing.len(),
                "Legs already open, skipping entry"
            );
            return Ok(EntryOutcome {
                already_open: true,
                legs: existing,
            });
        }

        let long_spec = adapters.long.resolve_symbol(&self.trade.base_asset).await?;
        let short_spec = adapters.short.resolve_symbol(&self.trade.base_asset).await?;

        // Then against the venues: positions opened by a previous run (or
        // out-of-band) are adopted, not duplicated.
        let mut adopted = Vec::new();
        for (adapter, spec) in [
            (&adapters.long, &long_spec),
            (&adapters.short, &short_spec),
        ] {
            for position in adapter.open_positions(Some(&spec.symbol)).await? {
                warn!(
                    venue = %adapter.venue(),
                    symbol = %position.symbol,
                    size = %position.size,
                    "Adopting position already live on venue"
                );
                let leg = Self::leg_from_position(session, adapter.venue(), &position);
                store.upsert_leg(&leg)?;
                adopted.push(leg);
            }
        }
        if !adopted.is_empty() {
            return Ok(EntryOutcome {
                already_open: true,
                legs: adopted,
            });
        }

        // Size both legs off one reference price, rounded down to the
        // coarser lot step so the base quantities match exactly.
        let price = adapters.long.mark_price(&long_spec.symbol).await?;
        let per_leg_capital = self.trade.capital_usdt / dec!(2);
        let raw_qty = safe_div(per_leg_capital * self.leverage(), price);
        let lot = long_spec.lot_step.max(short_spec.lot_step);
        let qty = round_down_to_lot(raw_qty, lot);
        if qty <= Decimal::ZERO {
            // One lot costs more than the per-leg capital buys; name the
            // venue whose lot step forced the floor.
            let venue = if long_spec.lot_step >= short_spec.lot_step {
                adapters.long.venue()
            } else {
                adapters.short.venue()
            };
            return Err(EntryError::InsufficientCapital {
                venue,
                required: safe_div(lot * price, self.leverage()),
                available: per_leg_capital,
            });
        }

        // Fund both venues before touching either order book.
        CapitalAllocator
            .ensure(adapters.long.as_ref(), per_leg_capital)
            .await?;
        CapitalAllocator
            .ensure(adapters.short.as_ref(), per_leg_capital)
            .await?;

        info!(
            session_id = %session.session_id,
            base_asset = %self.trade.base_asset,
            qty = %qty,
            price = %price,
            "Opening delta-neutral pair"
        );

        // Long leg first.
        let long_fill = adapters
            .long
            .submit_order(
                &long_spec.symbol,
                qty * long_spec.contract_multiplier,
                &Self::order_id("entry-long"),
            )
            .await
            .map_err(|e| EntryError::LongLegRejected {
                venue: adapters.long.venue(),
                reason: e.to_string(),
            })?;

        let long_size = Self::filled_base_size(&long_fill, &long_spec, qty);
        if long_size < qty {
            warn!(
                venue = %adapters.long.venue(),
                requested = %qty,
                filled = %long_size,
                "Long leg partially filled, recording the filled size"
            );
        }
        let long_leg = self.build_leg(
            session,
            adapters.long.venue(),
            &long_spec,
            Side::Long,
            long_size,
            long_fill.avg_price,
        );
        store.upsert_leg(&long_leg)?;

        // Short leg; roll the long back if it cannot fill.
        let short_result = adapters
            .short
            .submit_order(
                &short_spec.symbol,
                -(qty * short_spec.contract_multiplier),
                &Self::order_id("entry-short"),
            )
            .await;

        let short_fill = match short_result {
            Ok(fill) => fill,
            Err(short_err) => {
                warn!(
                    venue = %adapters.short.venue(),
                    error = %short_err,
                    "Short leg failed, closing long leg"
                );
                let rollback = adapters
                    .long
                    .close_position(&long_spec.symbol, None, &Self::order_id("entry-rollback"))
                    .await;
                return match rollback {
                    Ok(result) => {
                        store.close_leg(&long_leg, result.exit_price)?;
                        Err(EntryError::ShortLegFailed {
                            venue: adapters.short.venue(),
                            reason: short_err.to_string(),
                            long_venue: adapters.long.venue(),
                        })
                    }
                    Err(close_err) => Err(EntryError::RollbackFailed {
                        venue: adapters.short.venue(),
                        reason: short_err.to_string(),
                        long_venue: adapters.long.venue(),
                        symbol: long_spec.symbol.clone(),
                        close_error: close_err.to_string(),
                    }),
                };
            }
        };

        let short_size = Self::filled_base_size(&short_fill, &short_spec, qty);
        if short_size < qty {
            warn!(
                venue = %adapters.short.venue(),
                requested = %qty,
                filled = %short_size,
                "Short leg partially filled, recording the filled size"
            );
        }
        let short_leg = self.build_leg(
            session,
            adapters.short.venue(),
            &short_spec,
            Side::Short,
            short_size,
            short_fill.avg_price,
        );
        store.upsert_leg(&short_leg)?;

        info!(
            session_id = %session.session_id,
            long_venue = %adapters.long.venue(),
            short_venue = %adapters.short.venue(),
            qty = %qty,
            "Pair opened"
        );

        Ok(EntryOutcome {
            already_open: false,
            legs: vec![long_leg, short_leg],
        })
    }

    /// Fill sizes come back in venue order units; convert to base units.
    /// Falls back to the requested quantity when the venue omits the size.
    fn filled_base_size(fill: &OrderFill, spec: &SymbolSpec, requested: Decimal) -> Decimal {
        let filled = safe_div(fill.filled_size, spec.contract_multiplier);
        if filled > Decimal::ZERO {
            filled
        } else {
            requested
        }
    }

    fn order_id(prefix: &str) -> String {
        let now = Utc::now();
        format!("{prefix}-{}-{}", now.timestamp(), now.timestamp_subsec_nanos())
    }

    fn leg_id(venue: Venue) -> String {
        let now = Utc::now();
        format!("leg-{venue}-{}-{}", now.timestamp(), now.timestamp_subsec_nanos())
    }

    fn build_leg(
        &self,
        session: &Session,
        venue: Venue,
        spec: &SymbolSpec,
        side: Side,
        qty: Decimal,
        entry_price: Decimal,
    ) -> Leg {
        Leg {
            leg_id: Self::leg_id(venue),
            session_id: session.session_id.clone(),
            venue,
            symbol: spec.symbol.clone(),
            side,
            size: qty,
            entry_price,
            mark_price: entry_price,
            liquidation_price: None,
            margin: safe_div(qty * entry_price, self.leverage()),
            leverage: self.leverage(),
            risk_level: Decimal::ZERO,
            status: LegStatus::Open,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    fn leg_from_position(session: &Session, venue: Venue, position: &VenuePosition) -> Leg {
        Leg {
            leg_id: Self::leg_id(venue),
            session_id: session.session_id.clone(),
            venue,
            symbol: position.symbol.clone(),
            side: position.side,
            size: position.size,
            entry_price: position.entry_price,
            mark_price: position.mark_price,
            liquidation_price: position.liquidation_price,
            margin: position.margin,
            leverage: position.leverage,
            risk_level: Decimal::ZERO,
            status: LegStatus::Open,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{ExchangeAdapter, MockExchange, Wallet};
    use std::sync::Arc;

    struct Fixture {
        adapters: AdapterPair,
        store: Store,
        session: Session,
        long: Arc<MockExchange>,
        short: Arc<MockExchange>,
        entry: EntryManager,
    }

    async fn fixture() -> Fixture {
        let long = Arc::new(MockExchange::new(Venue::Bybit));
        let short = Arc::new(MockExchange::new(Venue::Bitmex));
        long.set_price("SOLUSDT", dec!(100)).await;
        short.set_price("SOLUSDT", dec!(100)).await;
        Fixture {
            adapters: AdapterPair::new(long.clone(), short.clone()),
            store: Store::new(":memory:").unwrap(),
            session: Session::new("alice", Venue::Bybit, Venue::Bitmex, "SOL"),
            long,
            short,
            entry: EntryManager::new(TradeConfig {
                base_asset: "SOL".to_string(),
                capital_usdt: dec!(1000),
                leverage: 3,
            }),
        }
    }

    #[tokio::test]
    async fn opens_equal_base_quantities_on_both_venues() {
        let f = fixture().await;
        // Coarser lot step on the short venue governs both legs.
        f.long.set_lot_step(dec!(0.1)).await;
        f.short.set_lot_step(dec!(0.5)).await;
        f.short.set_contract_multiplier(dec!(10000)).await;
        f.long.set_price("SOLUSDT", dec!(97)).await;

        let outcome = f
            .entry
            .open_pair(&f.adapters, &f.store, &f.session)
            .await
            .unwrap();
        assert!(!outcome.already_open);
        assert_eq!(outcome.legs.len(), 2);

        let long_pos = f.long.open_positions(None).await.unwrap();
        let short_pos = f.short.open_positions(None).await.unwrap();
        assert_eq!(long_pos[0].size, short_pos[0].size);
        assert_eq!(long_pos[0].side, Side::Long);
        assert_eq!(short_pos[0].side, Side::Short);
        // 500 * 3 / 97 = 15.46..., floored to the 0.5 lot.
        assert_eq!(long_pos[0].size, dec!(15.0));
    }

    #[tokio::test]
    async fn partial_fill_is_recorded_at_the_filled_size() {
        let f = fixture().await;
        f.long.partial_fill_ratio(dec!(0.5)).await;

        let outcome = f
            .entry
            .open_pair(&f.adapters, &f.store, &f.session)
            .await
            .unwrap();

        // 500 * 3 / 100 = 15 requested; the long venue fills half of it.
        let long_leg = outcome.legs.iter().find(|l| l.side == Side::Long).unwrap();
        let short_leg = outcome.legs.iter().find(|l| l.side == Side::Short).unwrap();
        assert_eq!(long_leg.size, dec!(7.5));
        assert_eq!(short_leg.size, dec!(15.0));

        // Persisted sizes agree with what the venues actually hold.
        let venue_long = f.long.open_positions(None).await.unwrap();
        let venue_short = f.short.open_positions(None).await.unwrap();
        assert_eq!(venue_long[0].size, long_leg.size);
        assert_eq!(venue_short[0].size, short_leg.size);
        let stored = f.store.get_open_legs(&f.session.session_id).unwrap();
        assert_eq!(
            stored.iter().map(|l| l.size).sum::<Decimal>(),
            dec!(22.5)
        );
    }

    #[tokio::test]
    async fn partial_fill_in_contracts_converts_back_to_base_units() {
        let f = fixture().await;
        f.short.set_contract_multiplier(dec!(10000)).await;
        f.short.partial_fill_ratio(dec!(0.4)).await;

        let outcome = f
            .entry
            .open_pair(&f.adapters, &f.store, &f.session)
            .await
            .unwrap();

        // 15 base units requested as 150000 contracts; 60000 fill.
        let short_leg = outcome.legs.iter().find(|l| l.side == Side::Short).unwrap();
        assert_eq!(short_leg.size, dec!(6.0));
        let venue_short = f.short.open_positions(None).await.unwrap();
        assert_eq!(venue_short[0].size, short_leg.size);
    }

    #[tokio::test]
    async fn second_entry_is_a_no_op() {
        let f = fixture().await;
        let first = f
            .entry
            .open_pair(&f.adapters, &f.store, &f.session)
            .await
            .unwrap();
        assert!(!first.already_open);

        let second = f
            .entry
            .open_pair(&f.adapters, &f.store, &f.session)
            .await
            .unwrap();
        assert!(second.already_open);
        assert_eq!(second.legs.len(), 2);
        assert_eq!(f.long.order_count().await, 1);
        assert_eq!(f.short.order_count().await, 1);
    }

    #[tokio::test]
    async fn live_venue_position_is_adopted_not_duplicated() {
        let f = fixture().await;
        f.long
            .seed_position(VenuePosition {
                symbol: "SOLUSDT".to_string(),
                side: Side::Long,
                size: dec!(15),
                entry_price: dec!(100),
                mark_price: dec!(100),
                liquidation_price: None,
                margin: dec!(500),
                leverage: dec!(3),
                unrealized_pnl: Decimal::ZERO,
            })
            .await;

        let outcome = f
            .entry
            .open_pair(&f.adapters, &f.store, &f.session)
            .await
            .unwrap();
        assert!(outcome.already_open);
        assert_eq!(outcome.legs.len(), 1);
        assert_eq!(f.long.order_count().await, 0);
        assert_eq!(f.short.order_count().await, 0);
        assert_eq!(f.store.get_open_legs(&f.session.session_id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn short_failure_rolls_back_the_long_leg() {
        let f = fixture().await;
        f.short.reject_orders(true).await;

        let err = f
            .entry
            .open_pair(&f.adapters, &f.store, &f.session)
            .await
            .unwrap_err();
        assert!(matches!(err, EntryError::ShortLegFailed { .. }));
        assert!(!err.leaves_open_leg());

        assert_eq!(f.long.open_position_count().await, 0);
        assert!(f.store.get_open_legs(&f.session.session_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_rollback_leaves_the_leg_recorded() {
        let f = fixture().await;
        f.short.reject_orders(true).await;
        f.long.fail_close_on("SOLUSDT").await;

        let err = f
            .entry
            .open_pair(&f.adapters, &f.store, &f.session)
            .await
            .unwrap_err();
        assert!(matches!(err, EntryError::RollbackFailed { .. }));
        assert!(err.leaves_open_leg());

        // The long leg is still live on the venue and still tracked.
        assert_eq!(f.long.open_position_count().await, 1);
        assert_eq!(f.store.get_open_legs(&f.session.session_id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lot_floor_to_zero_names_the_coarser_lot_venue() {
        let f = fixture().await;
        // 15 base units requested, but the short venue trades in lots of 20.
        f.short.set_lot_step(dec!(20)).await;

        let err = f
            .entry
            .open_pair(&f.adapters, &f.store, &f.session)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EntryError::InsufficientCapital { venue: Venue::Bitmex, .. }
        ));
        assert_eq!(f.long.order_count().await, 0);
        assert_eq!(f.short.order_count().await, 0);
    }

    #[tokio::test]
    async fn underfunded_venue_fails_before_any_order() {
        let f = fixture().await;
        f.short.set_wallet(Wallet::Trading, dec!(10)).await;

        let err = f
            .entry
            .open_pair(&f.adapters, &f.store, &f.session)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EntryError::InsufficientCapital { venue: Venue::Bitmex, .. }
        ));
        assert_eq!(f.long.order_count().await, 0);
        assert_eq!(f.short.order_count().await, 0);
    }
}
