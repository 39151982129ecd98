//! In-memory venue double for tests.

use crate::error::AdapterError;
use crate::exchange::traits::ExchangeAdapter;
use crate::exchange::types::*;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug)]
struct MockState {
    prices: HashMap<String, Decimal>,
    positions: HashMap<String, VenuePosition>,
    wallets: HashMap<Wallet, WalletBalance>,
    lot_step: Decimal,
    contract_multiplier: Decimal,
    leverage: Decimal,
    fill_ratio: Decimal,
    reject_orders: bool,
    fail_close_symbols: HashSet<String>,
    fail_margin_adjust: bool,
    fail_cross_transfer: bool,
    order_count: u64,
    outbound_transfers: Vec<(Venue, Decimal)>,
    internal_transfers: Vec<(Wallet, Wallet, Decimal)>,
}

impl Default for MockState {
    fn default() -> Self {
        let mut wallets = HashMap::new();
        wallets.insert(
            Wallet::Trading,
            WalletBalance {
                free: dec!(1_000_000),
                used: Decimal::ZERO,
                total: dec!(1_000_000),
            },
        );
        Self {
            prices: HashMap::new(),
            positions: HashMap::new(),
            wallets,
            lot_step: dec!(0.1),
            contract_multiplier: Decimal::ONE,
            leverage: dec!(3),
            fill_ratio: Decimal::ONE,
            reject_orders: false,
            fail_close_symbols: HashSet::new(),
            fail_margin_adjust: false,
            fail_cross_transfer: false,
            order_count: 0,
            outbound_transfers: Vec::new(),
            internal_transfers: Vec::new(),
        }
    }
}

/// Simulated venue implementing [`ExchangeAdapter`].
pub struct MockExchange {
    venue: Venue,
    state: Arc<RwLock<MockState>>,
    order_id_counter: AtomicU64,
}

impl MockExchange {
    pub fn new(venue: Venue) -> Self {
        Self {
            venue,
            state: Arc::new(RwLock::new(MockState::default())),
            order_id_counter: AtomicU64::new(1),
        }
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.state
            .write()
            .await
            .prices
            .insert(symbol.to_string(), price);
    }

    pub async fn set_lot_step(&self, lot_step: Decimal) {
        self.state.write().await.lot_step = lot_step;
    }

    pub async fn set_contract_multiplier(&self, multiplier: Decimal) {
        self.state.write().await.contract_multiplier = multiplier;
    }

    pub async fn set_wallet(&self, wallet: Wallet, free: Decimal) {
        self.state.write().await.wallets.insert(
            wallet,
            WalletBalance {
                free,
                used: Decimal::ZERO,
                total: free,
            },
        );
    }

    pub async fn set_liquidation_price(&self, symbol: &str, price: Option<Decimal>) {
        if let Some(position) = self.state.write().await.positions.get_mut(symbol) {
            position.liquidation_price = price;
        }
    }

    /// Fill only this fraction of every subsequent order.
    pub async fn partial_fill_ratio(&self, ratio: Decimal) {
        self.state.write().await.fill_ratio = ratio;
    }

    /// Make every subsequent order submission fail.
    pub async fn reject_orders(&self, reject: bool) {
        self.state.write().await.reject_orders = reject;
    }

    /// Make closes on one symbol fail while others still succeed.
    pub async fn fail_close_on(&self, symbol: &str) {
        self.state
            .write()
            .await
            .fail_close_symbols
            .insert(symbol.to_string());
    }

    pub async fn fail_margin_adjust(&self, fail: bool) {
        self.state.write().await.fail_margin_adjust = fail;
    }

    pub async fn fail_cross_transfer(&self, fail: bool) {
        self.state.write().await.fail_cross_transfer = fail;
    }

    /// Install a position directly, bypassing order flow.
    pub async fn seed_position(&self, position: VenuePosition) {
        self.state
            .write()
            .await
            .positions
            .insert(position.symbol.clone(), position);
    }

    pub async fn order_count(&self) -> u64 {
        self.state.read().await.order_count
    }

    pub async fn open_position_count(&self) -> usize {
        self.state.read().await.positions.len()
    }

    pub async fn margin_of(&self, symbol: &str) -> Option<Decimal> {
        self.state
            .read()
            .await
            .positions
            .get(symbol)
            .map(|p| p.margin)
    }

    pub async fn outbound_transfers(&self) -> Vec<(Venue, Decimal)> {
        self.state.read().await.outbound_transfers.clone()
    }

    pub async fn internal_transfers(&self) -> Vec<(Wallet, Wallet, Decimal)> {
        self.state.read().await.internal_transfers.clone()
    }

    fn next_order_id(&self) -> String {
        format!(
            "mock-{}-{}",
            self.venue,
            self.order_id_counter.fetch_add(1, Ordering::SeqCst)
        )
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    fn venue(&self) -> Venue {
        self.venue
    }

    async fn resolve_symbol(&self, base_asset: &str) -> Result<SymbolSpec, AdapterError> {
        let state = self.state.read().await;
        Ok(SymbolSpec {
            symbol: format!("{}USDT", base_asset.to_uppercase()),
            lot_step: state.lot_step,
            contract_multiplier: state.contract_multiplier,
        })
    }

    async fn mark_price(&self, symbol: &str) -> Result<Decimal, AdapterError> {
        let state = self.state.read().await;
        Ok(state.prices.get(symbol).copied().unwrap_or(dec!(100)))
    }

    async fn submit_order(
        &self,
        symbol: &str,
        signed_qty: Decimal,
        client_order_id: &str,
    ) -> Result<OrderFill, AdapterError> {
        let mut state = self.state.write().await;
        if state.reject_orders {
            return Err(AdapterError::OrderRejected {
                venue: self.venue,
                reason: "rejected by test configuration".to_string(),
            });
        }

        let price = state.prices.get(symbol).copied().unwrap_or(dec!(100));
        let filled_contracts = signed_qty.abs() * state.fill_ratio;
        let size = filled_contracts / state.contract_multiplier;
        let side = if signed_qty > Decimal::ZERO {
            Side::Long
        } else {
            Side::Short
        };
        let margin = size * price / state.leverage;
        let leverage = state.leverage;

        state
            .positions
            .entry(symbol.to_string())
            .and_modify(|p| {
                p.size += size;
                p.margin += margin;
            })
            .or_insert(VenuePosition {
                symbol: symbol.to_string(),
                side,
                size,
                entry_price: price,
                mark_price: price,
                liquidation_price: None,
                margin,
                leverage,
                unrealized_pnl: Decimal::ZERO,
            });
        state.order_count += 1;

        debug!(venue = %self.venue, %symbol, qty = %signed_qty, client_order_id, "Mock order filled");

        Ok(OrderFill {
            order_id: self.next_order_id(),
            filled_size: filled_contracts,
            avg_price: price,
        })
    }

    async fn open_positions(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<VenuePosition>, AdapterError> {
        let state = self.state.read().await;
        Ok(state
            .positions
            .values()
            .filter(|p| symbol.map_or(true, |s| p.symbol == s))
            .cloned()
            .collect())
    }

    async fn close_position(
        &self,
        symbol: &str,
        size: Option<Decimal>,
        _client_order_id: &str,
    ) -> Result<CloseResult, AdapterError> {
        let mut state = self.state.write().await;
        if state.fail_close_symbols.contains(symbol) {
            return Err(AdapterError::Unavailable {
                venue: self.venue,
                reason: "close failure injected by test".to_string(),
            });
        }

        let position = state
            .positions
            .get(symbol)
            .cloned()
            .ok_or_else(|| AdapterError::OrderRejected {
                venue: self.venue,
                reason: format!("no open position on {symbol}"),
            })?;

        let exit_price = state
            .prices
            .get(symbol)
            .copied()
            .unwrap_or(position.mark_price);
        let closed = size.unwrap_or(position.size).min(position.size);
        if closed >= position.size {
            state.positions.remove(symbol);
        } else if let Some(p) = state.positions.get_mut(symbol) {
            p.size -= closed;
        }
        state.order_count += 1;

        Ok(CloseResult {
            closed_size: closed,
            exit_price,
        })
    }

    async fn adjust_margin(
        &self,
        symbol: &str,
        signed_amount: Decimal,
    ) -> Result<(), AdapterError> {
        let mut state = self.state.write().await;
        if state.fail_margin_adjust {
            return Err(AdapterError::Unavailable {
                venue: self.venue,
                reason: "margin adjust failure injected by test".to_string(),
            });
        }
        let position = state
            .positions
            .get_mut(symbol)
            .ok_or_else(|| AdapterError::OrderRejected {
                venue: self.venue,
                reason: format!("no open position on {symbol}"),
            })?;
        position.margin += signed_amount;
        Ok(())
    }

    async fn balances(&self) -> Result<HashMap<Wallet, WalletBalance>, AdapterError> {
        Ok(self.state.read().await.wallets.clone())
    }

    async fn transfer_internal(
        &self,
        from: Wallet,
        to: Wallet,
        amount: Decimal,
        _transfer_id: &str,
    ) -> Result<(), AdapterError> {
        let mut state = self.state.write().await;
        let available = state.wallets.get(&from).map(|b| b.free).unwrap_or_default();
        if available < amount {
            return Err(AdapterError::Unavailable {
                venue: self.venue,
                reason: format!("insufficient {from} balance: {available} < {amount}"),
            });
        }
        if let Some(balance) = state.wallets.get_mut(&from) {
            balance.free -= amount;
            balance.total -= amount;
        }
        let target = state.wallets.entry(to).or_default();
        target.free += amount;
        target.total += amount;
        state.internal_transfers.push((from, to, amount));
        Ok(())
    }

    async fn transfer_funds(
        &self,
        destination: Venue,
        amount: Decimal,
        _transfer_id: &str,
    ) -> Result<(), AdapterError> {
        let mut state = self.state.write().await;
        if state.fail_cross_transfer {
            return Err(AdapterError::Unavailable {
                venue: self.venue,
                reason: "cross-venue transfer failure injected by test".to_string(),
            });
        }
        if let Some(balance) = state.wallets.get_mut(&Wallet::Trading) {
            balance.free -= amount;
            balance.total -= amount;
        }
        state.outbound_transfers.push((destination, amount));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn order_creates_position_and_close_removes_it() {
        let venue = MockExchange::new(Venue::Bybit);
        venue.set_price("SOLUSDT", dec!(150)).await;

        venue
            .submit_order("SOLUSDT", dec!(2.5), "t-1")
            .await
            .unwrap();
        let positions = venue.open_positions(None).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, Side::Long);
        assert_eq!(positions[0].size, dec!(2.5));

        let result = venue.close_position("SOLUSDT", None, "t-2").await.unwrap();
        assert_eq!(result.closed_size, dec!(2.5));
        assert_eq!(result.exit_price, dec!(150));
        assert_eq!(venue.open_position_count().await, 0);
    }

    #[tokio::test]
    async fn contract_multiplier_converts_to_base_units() {
        let venue = MockExchange::new(Venue::Bitmex);
        venue.set_contract_multiplier(dec!(10000)).await;

        // 25000 contracts at multiplier 10000 is 2.5 base units.
        venue
            .submit_order("SOLUSDT", dec!(-25000), "t-1")
            .await
            .unwrap();
        let positions = venue.open_positions(Some("SOLUSDT")).await.unwrap();
        assert_eq!(positions[0].side, Side::Short);
        assert_eq!(positions[0].size, dec!(2.5));
    }

    #[tokio::test]
    async fn partial_fill_ratio_scales_position_and_fill() {
        let venue = MockExchange::new(Venue::Bybit);
        venue.partial_fill_ratio(dec!(0.5)).await;

        let fill = venue
            .submit_order("SOLUSDT", dec!(10), "t-1")
            .await
            .unwrap();
        assert_eq!(fill.filled_size, dec!(5.0));

        let positions = venue.open_positions(None).await.unwrap();
        assert_eq!(positions[0].size, dec!(5.0));
    }

    #[tokio::test]
    async fn rejected_orders_do_not_touch_state() {
        let venue = MockExchange::new(Venue::Bybit);
        venue.reject_orders(true).await;

        let err = venue
            .submit_order("SOLUSDT", dec!(1), "t-1")
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::OrderRejected { .. }));
        assert_eq!(venue.open_position_count().await, 0);
        assert_eq!(venue.order_count().await, 0);
    }
}
