//! Bybit v5 REST API client (USDT linear perpetuals).

use crate::config::VenueCredentials;
use crate::error::AdapterError;
use crate::exchange::traits::ExchangeAdapter;
use crate::exchange::types::*;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument};

const BASE_URL: &str = "https://api.bybit.com";
const TESTNET_URL: &str = "https://api-testnet.bybit.com";
const RECV_WINDOW: &str = "5000";
/// USDT network used for cross-venue withdrawals.
const USDT_CHAIN: &str = "ETH";

const READ_RETRIES: u32 = 3;

/// Standard v5 response envelope.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct InstrumentsResult {
    list: Vec<Instrument>,
}

#[derive(Debug, Deserialize)]
struct Instrument {
    #[serde(rename = "lotSizeFilter")]
    lot_size_filter: LotSizeFilter,
}

#[derive(Debug, Deserialize)]
struct LotSizeFilter {
    #[serde(rename = "qtyStep")]
    qty_step: String,
}

#[derive(Debug, Deserialize)]
struct TickersResult {
    list: Vec<Ticker>,
}

#[derive(Debug, Deserialize)]
struct Ticker {
    #[serde(rename = "markPrice")]
    mark_price: String,
}

#[derive(Debug, Deserialize)]
struct OrderCreateResult {
    #[serde(rename = "orderId")]
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct OrderQueryResult {
    list: Vec<OrderRow>,
}

#[derive(Debug, Deserialize)]
struct OrderRow {
    #[serde(rename = "avgPrice", default)]
    avg_price: String,
    #[serde(rename = "cumExecQty", default)]
    cum_exec_qty: String,
}

#[derive(Debug, Deserialize)]
struct PositionListResult {
    list: Vec<PositionRow>,
}

#[derive(Debug, Deserialize)]
struct PositionRow {
    symbol: String,
    side: String,
    size: String,
    #[serde(rename = "avgPrice", default)]
    avg_price: String,
    #[serde(rename = "markPrice", default)]
    mark_price: String,
    #[serde(rename = "liqPrice", default)]
    liq_price: String,
    #[serde(rename = "positionIM", default)]
    position_im: String,
    #[serde(default)]
    leverage: String,
    #[serde(rename = "unrealisedPnl", default)]
    unrealised_pnl: String,
}

#[derive(Debug, Deserialize)]
struct WalletBalanceResult {
    list: Vec<WalletRow>,
}

#[derive(Debug, Deserialize)]
struct WalletRow {
    #[serde(rename = "totalAvailableBalance", default)]
    total_available_balance: String,
    #[serde(default)]
    coin: Vec<CoinRow>,
}

#[derive(Debug, Deserialize)]
struct CoinRow {
    coin: String,
    #[serde(rename = "walletBalance", default)]
    wallet_balance: String,
}

#[derive(Debug, Deserialize)]
struct FundBalanceResult {
    balance: Vec<FundCoinRow>,
}

#[derive(Debug, Deserialize)]
struct FundCoinRow {
    coin: String,
    #[serde(rename = "walletBalance", default)]
    wallet_balance: String,
    #[serde(rename = "transferBalance", default)]
    transfer_balance: String,
}

/// Bybit API client scoped to one account.
pub struct BybitClient {
    http: Client,
    api_key: String,
    api_secret: String,
    base_url: String,
    /// USDT deposit addresses of the venues we may withdraw toward.
    deposit_addresses: HashMap<Venue, String>,
}

impl BybitClient {
    /// Create a new Bybit client from credentials.
    pub fn new(
        credentials: &VenueCredentials,
        deposit_addresses: HashMap<Venue, String>,
    ) -> Result<Self, AdapterError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AdapterError::Unavailable {
                venue: Venue::Bybit,
                reason: format!("failed to create HTTP client: {e}"),
            })?;

        let base_url = if credentials.testnet {
            TESTNET_URL.to_string()
        } else {
            BASE_URL.to_string()
        };

        Ok(Self {
            http,
            api_key: credentials.api_key.clone(),
            api_secret: credentials.api_secret.clone(),
            base_url,
            deposit_addresses,
        })
    }

    /// HMAC-SHA256 over `timestamp + api_key + recv_window + payload`.
    fn sign(&self, timestamp: u64, payload: &str) -> String {
        let message = format!("{}{}{}{}", timestamp, self.api_key, RECV_WINDOW, payload);
        let mut mac = Hmac::<sha2::Sha256>::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_millis() as u64
    }

    /// Market-order side parameter for a signed quantity.
    fn order_side(signed_qty: Decimal) -> &'static str {
        if signed_qty > Decimal::ZERO {
            "Buy"
        } else {
            "Sell"
        }
    }

    fn parse_dec(&self, value: &str, field: &str) -> Result<Decimal, AdapterError> {
        value.parse().map_err(|_| AdapterError::Decode {
            venue: Venue::Bybit,
            reason: format!("unparsable {field}: {value:?}"),
        })
    }

    /// Bybit reports absent liquidation prices as `""` or `"0"`.
    fn parse_opt_dec(value: &str) -> Option<Decimal> {
        let parsed: Decimal = value.parse().ok()?;
        (parsed > Decimal::ZERO).then_some(parsed)
    }

    fn unwrap_result<T>(&self, resp: ApiResponse<T>) -> Result<T, AdapterError> {
        match resp.ret_code {
            0 => resp.result.ok_or_else(|| AdapterError::Decode {
                venue: Venue::Bybit,
                reason: "missing result body".to_string(),
            }),
            10003 | 10004 | 10005 => Err(AdapterError::Auth {
                venue: Venue::Bybit,
                reason: resp.ret_msg,
            }),
            code => Err(AdapterError::Unavailable {
                venue: Venue::Bybit,
                reason: format!("retCode {code}: {}", resp.ret_msg),
            }),
        }
    }

    /// Like [`Self::unwrap_result`] but non-auth failures are order
    /// rejections rather than venue outages.
    fn unwrap_order<T>(&self, resp: ApiResponse<T>) -> Result<T, AdapterError> {
        match resp.ret_code {
            0 | 10003 | 10004 | 10005 => self.unwrap_result(resp),
            code => Err(AdapterError::OrderRejected {
                venue: Venue::Bybit,
                reason: format!("retCode {code}: {}", resp.ret_msg),
            }),
        }
    }

    /// Unauthenticated GET with bounded retry on transient failures.
    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &str,
    ) -> Result<T, AdapterError> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        let mut attempt = 0;
        loop {
            let result = self.get_once(&url, false).await;
            match result {
                Err(ref e) if e.is_transient() && attempt + 1 < READ_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(300 * attempt as u64)).await;
                }
                other => return other.and_then(|resp| self.unwrap_result(resp)),
            }
        }
    }

    /// Authenticated GET with bounded retry on transient failures.
    async fn signed_get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &str,
    ) -> Result<T, AdapterError> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        let mut attempt = 0;
        loop {
            let result = self.get_once(&url, true).await;
            match result {
                Err(ref e) if e.is_transient() && attempt + 1 < READ_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(300 * attempt as u64)).await;
                }
                other => return other.and_then(|resp| self.unwrap_result(resp)),
            }
        }
    }

    async fn get_once<T: DeserializeOwned>(
        &self,
        url: &str,
        signed: bool,
    ) -> Result<ApiResponse<T>, AdapterError> {
        let mut request = self.http.get(url);
        if signed {
            let query = url.split_once('?').map(|(_, q)| q).unwrap_or("");
            let timestamp = Self::timestamp();
            request = request
                .header("X-BAPI-API-KEY", &self.api_key)
                .header("X-BAPI-TIMESTAMP", timestamp.to_string())
                .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
                .header("X-BAPI-SIGN", self.sign(timestamp, query));
        }

        let response = request
            .send()
            .await
            .map_err(|e| AdapterError::from_http(Venue::Bybit, e))?;

        response
            .json()
            .await
            .map_err(|e| AdapterError::Decode {
                venue: Venue::Bybit,
                reason: e.to_string(),
            })
    }

    /// Authenticated POST. Never retried; every caller passes an
    /// idempotency key in the body instead.
    async fn signed_post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<ApiResponse<T>, AdapterError> {
        let payload = body.to_string();
        let timestamp = Self::timestamp();

        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", self.sign(timestamp, &payload))
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| AdapterError::from_http(Venue::Bybit, e))?;

        response
            .json()
            .await
            .map_err(|e| AdapterError::Decode {
                venue: Venue::Bybit,
                reason: e.to_string(),
            })
    }

    /// Place a market order and read back its fill.
    async fn place_market(
        &self,
        symbol: &str,
        side: &str,
        qty: Decimal,
        client_order_id: &str,
        reduce_only: bool,
    ) -> Result<OrderFill, AdapterError> {
        let body = json!({
            "category": "linear",
            "symbol": symbol,
            "side": side,
            "orderType": "Market",
            "qty": qty.normalize().to_string(),
            "orderLinkId": client_order_id,
            "reduceOnly": reduce_only,
        });

        debug!(%symbol, side, %qty, client_order_id, "Placing Bybit market order");

        let resp: ApiResponse<OrderCreateResult> = self.signed_post("/v5/order/create", &body).await?;
        let created = self.unwrap_order(resp)?;

        let query = format!(
            "category=linear&symbol={}&orderId={}",
            urlencoding::encode(symbol),
            urlencoding::encode(&created.order_id)
        );
        let orders: OrderQueryResult = self.signed_get("/v5/order/realtime", &query).await?;
        let row = orders.list.into_iter().next();

        // Market fills are immediate, but the query can race the match
        // engine; fall back to mark price / requested quantity.
        let avg_price = match row.as_ref().and_then(|r| Self::parse_opt_dec(&r.avg_price)) {
            Some(price) => price,
            None => self.mark_price(symbol).await?,
        };
        let filled_size = row
            .as_ref()
            .and_then(|r| Self::parse_opt_dec(&r.cum_exec_qty))
            .unwrap_or(qty);

        Ok(OrderFill {
            order_id: created.order_id,
            filled_size,
            avg_price,
        })
    }
}

#[async_trait]
impl ExchangeAdapter for BybitClient {
    fn venue(&self) -> Venue {
        Venue::Bybit
    }

    #[instrument(skip(self))]
    async fn resolve_symbol(&self, base_asset: &str) -> Result<SymbolSpec, AdapterError> {
        let symbol = format!("{}USDT", base_asset.to_uppercase());
        let query = format!("category=linear&symbol={}", urlencoding::encode(&symbol));
        let result: InstrumentsResult = self
            .public_get("/v5/market/instruments-info", &query)
            .await?;

        let instrument = result
            .list
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::SymbolNotFound {
                venue: Venue::Bybit,
                base_asset: base_asset.to_string(),
            })?;

        Ok(SymbolSpec {
            symbol,
            lot_step: self.parse_dec(&instrument.lot_size_filter.qty_step, "qtyStep")?,
            contract_multiplier: Decimal::ONE,
        })
    }

    #[instrument(skip(self))]
    async fn mark_price(&self, symbol: &str) -> Result<Decimal, AdapterError> {
        let query = format!("category=linear&symbol={}", urlencoding::encode(symbol));
        let result: TickersResult = self.public_get("/v5/market/tickers", &query).await?;

        let ticker = result
            .list
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::Decode {
                venue: Venue::Bybit,
                reason: format!("no ticker for {symbol}"),
            })?;

        self.parse_dec(&ticker.mark_price, "markPrice")
    }

    async fn submit_order(
        &self,
        symbol: &str,
        signed_qty: Decimal,
        client_order_id: &str,
    ) -> Result<OrderFill, AdapterError> {
        self.place_market(
            symbol,
            Self::order_side(signed_qty),
            signed_qty.abs(),
            client_order_id,
            false,
        )
        .await
    }

    #[instrument(skip(self))]
    async fn open_positions(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<VenuePosition>, AdapterError> {
        let query = match symbol {
            Some(s) => format!("category=linear&symbol={}", urlencoding::encode(s)),
            None => "category=linear&settleCoin=USDT".to_string(),
        };
        let result: PositionListResult = self.signed_get("/v5/position/list", &query).await?;

        let mut positions = Vec::new();
        for row in result.list {
            let size = self.parse_dec(&row.size, "size")?;
            if size == Decimal::ZERO {
                continue;
            }
            let side = match row.side.as_str() {
                "Buy" => Side::Long,
                "Sell" => Side::Short,
                other => {
                    return Err(AdapterError::Decode {
                        venue: Venue::Bybit,
                        reason: format!("unknown position side: {other:?}"),
                    })
                }
            };
            positions.push(VenuePosition {
                symbol: row.symbol,
                side,
                size,
                entry_price: self.parse_dec(&row.avg_price, "avgPrice")?,
                mark_price: self.parse_dec(&row.mark_price, "markPrice")?,
                liquidation_price: Self::parse_opt_dec(&row.liq_price),
                margin: Self::parse_opt_dec(&row.position_im).unwrap_or(Decimal::ZERO),
                leverage: Self::parse_opt_dec(&row.leverage).unwrap_or(Decimal::ONE),
                unrealized_pnl: row.unrealised_pnl.parse().unwrap_or(Decimal::ZERO),
            });
        }
        Ok(positions)
    }

    async fn close_position(
        &self,
        symbol: &str,
        size: Option<Decimal>,
        client_order_id: &str,
    ) -> Result<CloseResult, AdapterError> {
        let position = self
            .open_positions(Some(symbol))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::OrderRejected {
                venue: Venue::Bybit,
                reason: format!("no open position on {symbol}"),
            })?;

        let qty = size.unwrap_or(position.size);
        let side = match position.side.opposite() {
            Side::Long => "Buy",
            Side::Short => "Sell",
        };

        let fill = self
            .place_market(symbol, side, qty, client_order_id, true)
            .await?;

        Ok(CloseResult {
            closed_size: fill.filled_size,
            exit_price: fill.avg_price,
        })
    }

    #[instrument(skip(self))]
    async fn adjust_margin(
        &self,
        symbol: &str,
        signed_amount: Decimal,
    ) -> Result<(), AdapterError> {
        let body = json!({
            "category": "linear",
            "symbol": symbol,
            "margin": signed_amount.normalize().to_string(),
        });
        let resp: ApiResponse<serde_json::Value> =
            self.signed_post("/v5/position/add-margin", &body).await?;
        self.unwrap_result(resp)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn balances(&self) -> Result<HashMap<Wallet, WalletBalance>, AdapterError> {
        let mut balances = HashMap::new();

        let unified: WalletBalanceResult = self
            .signed_get("/v5/account/wallet-balance", "accountType=UNIFIED&coin=USDT")
            .await?;
        if let Some(row) = unified.list.into_iter().next() {
            let total = row
                .coin
                .iter()
                .find(|c| c.coin == "USDT")
                .and_then(|c| Self::parse_opt_dec(&c.wallet_balance))
                .unwrap_or(Decimal::ZERO);
            let free = Self::parse_opt_dec(&row.total_available_balance).unwrap_or(total);
            balances.insert(
                Wallet::Trading,
                WalletBalance {
                    free,
                    used: (total - free).max(Decimal::ZERO),
                    total,
                },
            );
        }

        let fund: FundBalanceResult = self
            .signed_get(
                "/v5/asset/transfer/query-account-coins-balance",
                "accountType=FUND&coin=USDT",
            )
            .await?;
        if let Some(row) = fund.balance.into_iter().find(|c| c.coin == "USDT") {
            let total = Self::parse_opt_dec(&row.wallet_balance).unwrap_or(Decimal::ZERO);
            let free = Self::parse_opt_dec(&row.transfer_balance).unwrap_or(total);
            balances.insert(
                Wallet::Funding,
                WalletBalance {
                    free,
                    used: (total - free).max(Decimal::ZERO),
                    total,
                },
            );
        }

        Ok(balances)
    }

    #[instrument(skip(self))]
    async fn transfer_internal(
        &self,
        from: Wallet,
        to: Wallet,
        amount: Decimal,
        transfer_id: &str,
    ) -> Result<(), AdapterError> {
        let account_type = |wallet: Wallet| match wallet {
            Wallet::Trading => "UNIFIED",
            Wallet::Funding => "FUND",
        };
        let body = json!({
            "transferId": transfer_id,
            "coin": "USDT",
            "amount": amount.normalize().to_string(),
            "fromAccountType": account_type(from),
            "toAccountType": account_type(to),
        });
        let resp: ApiResponse<serde_json::Value> = self
            .signed_post("/v5/asset/transfer/inter-transfer", &body)
            .await?;
        self.unwrap_result(resp)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn transfer_funds(
        &self,
        destination: Venue,
        amount: Decimal,
        transfer_id: &str,
    ) -> Result<(), AdapterError> {
        let address = self.deposit_addresses.get(&destination).ok_or_else(|| {
            AdapterError::Unavailable {
                venue: Venue::Bybit,
                reason: format!("no deposit address configured for {destination}"),
            }
        })?;

        // Withdrawals debit the FUND wallet; freed margin sits in UNIFIED.
        self.transfer_internal(
            Wallet::Trading,
            Wallet::Funding,
            amount,
            &format!("{transfer_id}-stage"),
        )
        .await?;

        let body = json!({
            "coin": "USDT",
            "chain": USDT_CHAIN,
            "address": address,
            "amount": amount.normalize().to_string(),
            "timestamp": Self::timestamp(),
            "accountType": "FUND",
            "requestId": transfer_id,
        });
        let resp: ApiResponse<serde_json::Value> =
            self.signed_post("/v5/asset/withdraw/create", &body).await?;
        self.unwrap_result(resp)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn order_side_from_signed_qty() {
        assert_eq!(BybitClient::order_side(dec!(1.5)), "Buy");
        assert_eq!(BybitClient::order_side(dec!(-1.5)), "Sell");
    }

    #[test]
    fn blank_liq_price_is_none() {
        assert_eq!(BybitClient::parse_opt_dec(""), None);
        assert_eq!(BybitClient::parse_opt_dec("0"), None);
        assert_eq!(BybitClient::parse_opt_dec("123.45"), Some(dec!(123.45)));
    }
}
