//! Per-venue capital checks before entry.
//!
//! A venue is funded when its trading wallet can cover the required
//! margin; shortfalls are topped up from the venue's own funding wallet
//! first. No order is ever placed against an underfunded venue.

use crate::error::EntryError;
use crate::exchange::{ExchangeAdapter, Venue, Wallet, WalletBalance};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{debug, info};

/// One internal wallet move needed to fund the trading wallet.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletMove {
    pub from: Wallet,
    pub to: Wallet,
    pub amount: Decimal,
}

/// Result of a capital check on one venue.
#[derive(Debug, Clone)]
pub struct CapitalCheck {
    pub venue: Venue,
    pub required: Decimal,
    /// Free USDT across all wallets.
    pub available: Decimal,
    pub transfer_plan: Vec<WalletMove>,
    pub sufficient: bool,
}

pub struct CapitalAllocator;

impl CapitalAllocator {
    /// Pure planning step: decide whether `required` USDT of margin is
    /// coverable and which internal moves that takes.
    pub fn plan(
        venue: Venue,
        required: Decimal,
        balances: &HashMap<Wallet, WalletBalance>,
    ) -> CapitalCheck {
        let trading_free = balances
            .get(&Wallet::Trading)
            .map(|b| b.free)
            .unwrap_or(Decimal::ZERO);
        let funding_free = balances
            .get(&Wallet::Funding)
            .map(|b| b.free)
            .unwrap_or(Decimal::ZERO);
        let available = trading_free + funding_free;

        let mut transfer_plan = Vec::new();
        let sufficient = if trading_free >= required {
            true
        } else {
            let deficit = required - trading_free;
            if funding_free >= deficit {
                transfer_plan.push(WalletMove {
                    from: Wallet::Funding,
                    to: Wallet::Trading,
                    amount: deficit,
                });
                true
            } else {
                false
            }
        };

        CapitalCheck {
            venue,
            required,
            available,
            transfer_plan,
            sufficient,
        }
    }

    /// Check one venue and execute the planned wallet moves.
    pub async fn ensure(
        &self,
        adapter: &dyn ExchangeAdapter,
        required: Decimal,
    ) -> Result<CapitalCheck, EntryError> {
        let venue = adapter.venue();
        let balances = adapter.balances().await?;
        let check = Self::plan(venue, required, &balances);

        if !check.sufficient {
            return Err(EntryError::InsufficientCapital {
                venue,
                required,
                available: check.available,
            });
        }

        for wallet_move in &check.transfer_plan {
            let now = Utc::now();
            let transfer_id = format!(
                "fund-{}-{}",
                now.timestamp(),
                now.timestamp_subsec_nanos()
            );
            info!(
                %venue,
                from = %wallet_move.from,
                to = %wallet_move.to,
                amount = %wallet_move.amount,
                "Topping up trading wallet"
            );
            adapter
                .transfer_internal(
                    wallet_move.from,
                    wallet_move.to,
                    wallet_move.amount,
                    &transfer_id,
                )
                .await?;
        }

        debug!(%venue, required = %required, available = %check.available, "Capital check passed");
        Ok(check)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockExchange;
    use rust_decimal_macros::dec;

    fn balances(trading: Decimal, funding: Decimal) -> HashMap<Wallet, WalletBalance> {
        let mut map = HashMap::new();
        map.insert(
            Wallet::Trading,
            WalletBalance {
                free: trading,
                used: Decimal::ZERO,
                total: trading,
            },
        );
        map.insert(
            Wallet::Funding,
            WalletBalance {
                free: funding,
                used: Decimal::ZERO,
                total: funding,
            },
        );
        map
    }

    #[test]
    fn trading_wallet_alone_can_suffice() {
        let check = CapitalAllocator::plan(Venue::Bybit, dec!(500), &balances(dec!(600), dec!(0)));
        assert!(check.sufficient);
        assert!(check.transfer_plan.is_empty());
    }

    #[test]
    fn shortfall_is_covered_from_funding_wallet() {
        let check =
            CapitalAllocator::plan(Venue::Bybit, dec!(500), &balances(dec!(200), dec!(400)));
        assert!(check.sufficient);
        assert_eq!(
            check.transfer_plan,
            vec![WalletMove {
                from: Wallet::Funding,
                to: Wallet::Trading,
                amount: dec!(300),
            }]
        );
    }

    #[test]
    fn combined_shortfall_is_insufficient() {
        let check =
            CapitalAllocator::plan(Venue::Bybit, dec!(500), &balances(dec!(200), dec!(100)));
        assert!(!check.sufficient);
        assert_eq!(check.available, dec!(300));
    }

    #[tokio::test]
    async fn ensure_executes_planned_moves() {
        let venue = MockExchange::new(Venue::Bybit);
        venue.set_wallet(Wallet::Trading, dec!(200)).await;
        venue.set_wallet(Wallet::Funding, dec!(400)).await;

        let check = CapitalAllocator
            .ensure(&venue, dec!(500))
            .await
            .unwrap();
        assert!(check.sufficient);

        let transfers = venue.internal_transfers().await;
        assert_eq!(transfers, vec![(Wallet::Funding, Wallet::Trading, dec!(300))]);
    }

    #[tokio::test]
    async fn ensure_fails_fast_when_underfunded() {
        let venue = MockExchange::new(Venue::Bybit);
        venue.set_wallet(Wallet::Trading, dec!(10)).await;

        let err = CapitalAllocator.ensure(&venue, dec!(500)).await.unwrap_err();
        assert!(matches!(err, EntryError::InsufficientCapital { .. }));
        assert!(venue.internal_transfers().await.is_empty());
    }
}
