//! BitMEX v1 REST API client (USDT linear perpetuals).
//!
//! BitMEX quotes order quantities in contracts; the instrument's position
//! multiplier converts between contracts and base-asset units. USDT amounts
//! on wallet and margin endpoints are reported in millionths.

use crate::config::VenueCredentials;
use crate::error::AdapterError;
use crate::exchange::traits::ExchangeAdapter;
use crate::exchange::types::*;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

const BASE_URL: &str = "https://www.bitmex.com";
const TESTNET_URL: &str = "https://testnet.bitmex.com";
/// USDT network used for cross-venue withdrawals.
const USDT_NETWORK: &str = "eth";

const READ_RETRIES: u32 = 3;

/// USDT amounts are integers scaled by 1e6.
const USDT_SCALE: Decimal = dec!(1_000_000);

#[derive(Debug, Deserialize)]
struct Instrument {
    #[serde(rename = "lotSize")]
    lot_size: Option<Decimal>,
    #[serde(rename = "underlyingToPositionMultiplier")]
    underlying_to_position_multiplier: Option<Decimal>,
    #[serde(rename = "markPrice")]
    mark_price: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(rename = "orderID")]
    order_id: String,
    #[serde(rename = "orderQty")]
    order_qty: Option<Decimal>,
    #[serde(rename = "avgPx")]
    avg_px: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct PositionRow {
    symbol: String,
    #[serde(rename = "currentQty", default)]
    current_qty: Decimal,
    #[serde(rename = "avgEntryPrice")]
    avg_entry_price: Option<Decimal>,
    #[serde(rename = "markPrice")]
    mark_price: Option<Decimal>,
    #[serde(rename = "liquidationPrice")]
    liquidation_price: Option<Decimal>,
    #[serde(rename = "posMargin")]
    pos_margin: Option<Decimal>,
    leverage: Option<Decimal>,
    #[serde(rename = "unrealisedPnl")]
    unrealised_pnl: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct UserMargin {
    #[serde(rename = "walletBalance")]
    wallet_balance: Option<Decimal>,
    #[serde(rename = "availableMargin")]
    available_margin: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// BitMEX API client scoped to one account.
pub struct BitmexClient {
    http: Client,
    api_key: String,
    api_secret: String,
    base_url: String,
    /// USDT deposit addresses of the venues we may withdraw toward.
    deposit_addresses: HashMap<Venue, String>,
    /// Contract multipliers are static per instrument; cached after the
    /// first lookup.
    multipliers: RwLock<HashMap<String, Decimal>>,
}

impl BitmexClient {
    /// Create a new BitMEX client from credentials.
    pub fn new(
        credentials: &VenueCredentials,
        deposit_addresses: HashMap<Venue, String>,
    ) -> Result<Self, AdapterError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AdapterError::Unavailable {
                venue: Venue::Bitmex,
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
            multipliers: RwLock::new(HashMap::new()),
        })
    }

    /// BitMEX trades BTC under its legacy XBT ticker.
    fn translate_base(base_asset: &str) -> String {
        let upper = base_asset.to_uppercase();
        if upper == "BTC" {
            "XBT".to_string()
        } else {
            upper
        }
    }

    /// HMAC-SHA256 over `verb + path + expires + body`.
    fn sign(&self, verb: &str, path_and_query: &str, expires: u64, body: &str) -> String {
        let message = format!("{verb}{path_and_query}{expires}{body}");
        let mut mac = Hmac::<sha2::Sha256>::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn expires() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_secs()
            + 10
    }

    async fn decode_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
        order_endpoint: bool,
    ) -> Result<T, AdapterError> {
        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(|e| AdapterError::Decode {
                venue: Venue::Bitmex,
                reason: e.to_string(),
            });
        }

        let message = response
            .json::<ErrorEnvelope>()
            .await
            .map(|e| e.error.message)
            .unwrap_or_else(|_| status.to_string());

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            Err(AdapterError::Auth {
                venue: Venue::Bitmex,
                reason: message,
            })
        } else if order_endpoint && status.is_client_error() {
            Err(AdapterError::OrderRejected {
                venue: Venue::Bitmex,
                reason: message,
            })
        } else {
            Err(AdapterError::Unavailable {
                venue: Venue::Bitmex,
                reason: message,
            })
        }
    }

    /// Authenticated GET with bounded retry on transient failures.
    async fn get<T: DeserializeOwned>(&self, path_and_query: &str) -> Result<T, AdapterError> {
        let mut attempt = 0;
        loop {
            let result = self.get_once(path_and_query).await;
            match result {
                Err(ref e) if e.is_transient() && attempt + 1 < READ_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(300 * attempt as u64)).await;
                }
                other => return other,
            }
        }
    }

    async fn get_once<T: DeserializeOwned>(&self, path_and_query: &str) -> Result<T, AdapterError> {
        let expires = Self::expires();
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path_and_query))
            .header("api-key", &self.api_key)
            .header("api-expires", expires.to_string())
            .header("api-signature", self.sign("GET", path_and_query, expires, ""))
            .send()
            .await
            .map_err(|e| AdapterError::from_http(Venue::Bitmex, e))?;

        self.decode_response(response, false).await
    }

    /// Authenticated POST. Never retried; callers pass an idempotency key
    /// (`clOrdID` / withdrawal note) instead.
    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
        order_endpoint: bool,
    ) -> Result<T, AdapterError> {
        let payload = body.to_string();
        let expires = Self::expires();
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header("api-key", &self.api_key)
            .header("api-expires", expires.to_string())
            .header("api-signature", self.sign("POST", path, expires, &payload))
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| AdapterError::from_http(Venue::Bitmex, e))?;

        self.decode_response(response, order_endpoint).await
    }

    async fn fetch_instrument(&self, symbol: &str) -> Result<Instrument, AdapterError> {
        let path = format!(
            "/api/v1/instrument?symbol={}&count=1",
            urlencoding::encode(symbol)
        );
        let instruments: Vec<Instrument> = self.get(&path).await?;
        instruments
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::SymbolNotFound {
                venue: Venue::Bitmex,
                base_asset: symbol.to_string(),
            })
    }

    /// Contracts per base-asset unit for a symbol, cached.
    async fn multiplier(&self, symbol: &str) -> Result<Decimal, AdapterError> {
        if let Some(multiplier) = self.multipliers.read().await.get(symbol) {
            return Ok(*multiplier);
        }
        let instrument = self.fetch_instrument(symbol).await?;
        let multiplier = instrument
            .underlying_to_position_multiplier
            .unwrap_or(Decimal::ONE);
        self.multipliers
            .write()
            .await
            .insert(symbol.to_string(), multiplier);
        Ok(multiplier)
    }

    fn to_scaled_int(amount: Decimal) -> Result<i64, AdapterError> {
        (amount * USDT_SCALE)
            .round()
            .to_i64()
            .ok_or_else(|| AdapterError::Decode {
                venue: Venue::Bitmex,
                reason: format!("amount out of range: {amount}"),
            })
    }

    fn from_scaled(amount: Option<Decimal>) -> Decimal {
        amount.map(|a| a / USDT_SCALE).unwrap_or(Decimal::ZERO)
    }
}

#[async_trait]
impl ExchangeAdapter for BitmexClient {
    fn venue(&self) -> Venue {
        Venue::Bitmex
    }

    #[instrument(skip(self))]
    async fn resolve_symbol(&self, base_asset: &str) -> Result<SymbolSpec, AdapterError> {
        let symbol = format!("{}USDT", Self::translate_base(base_asset));
        let instrument = self.fetch_instrument(&symbol).await?;

        let multiplier = instrument
            .underlying_to_position_multiplier
            .unwrap_or(Decimal::ONE);
        self.multipliers
            .write()
            .await
            .insert(symbol.clone(), multiplier);

        // lotSize is in contracts; express the step in base units so
        // cross-venue sizing can compare steps directly.
        let lot_contracts = instrument.lot_size.unwrap_or(Decimal::ONE);
        let lot_step = if multiplier > Decimal::ZERO {
            lot_contracts / multiplier
        } else {
            lot_contracts
        };

        Ok(SymbolSpec {
            symbol,
            lot_step,
            contract_multiplier: multiplier,
        })
    }

    #[instrument(skip(self))]
    async fn mark_price(&self, symbol: &str) -> Result<Decimal, AdapterError> {
        let instrument = self.fetch_instrument(symbol).await?;
        instrument.mark_price.ok_or_else(|| AdapterError::Decode {
            venue: Venue::Bitmex,
            reason: format!("no mark price for {symbol}"),
        })
    }

    async fn submit_order(
        &self,
        symbol: &str,
        signed_qty: Decimal,
        client_order_id: &str,
    ) -> Result<OrderFill, AdapterError> {
        // BitMEX takes a signed orderQty in contracts.
        let body = json!({
            "symbol": symbol,
            "orderQty": signed_qty.round().to_i64().ok_or_else(|| AdapterError::Decode {
                venue: Venue::Bitmex,
                reason: format!("order quantity out of range: {signed_qty}"),
            })?,
            "ordType": "Market",
            "clOrdID": client_order_id,
        });

        debug!(%symbol, qty = %signed_qty, client_order_id, "Placing BitMEX market order");

        let order: OrderResponse = self.post("/api/v1/order", &body, true).await?;

        let avg_price = match order.avg_px {
            Some(price) => price,
            None => self.mark_price(symbol).await?,
        };

        Ok(OrderFill {
            order_id: order.order_id,
            filled_size: order.order_qty.map(|q| q.abs()).unwrap_or(signed_qty.abs()),
            avg_price,
        })
    }

    #[instrument(skip(self))]
    async fn open_positions(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<VenuePosition>, AdapterError> {
        let path = match symbol {
            Some(s) => format!(
                "/api/v1/position?filter={}",
                urlencoding::encode(&format!("{{\"symbol\":\"{s}\"}}"))
            ),
            None => "/api/v1/position".to_string(),
        };
        let rows: Vec<PositionRow> = self.get(&path).await?;

        let mut positions = Vec::new();
        for row in rows {
            if row.current_qty == Decimal::ZERO {
                continue;
            }
            let multiplier = self.multiplier(&row.symbol).await?;
            let side = if row.current_qty > Decimal::ZERO {
                Side::Long
            } else {
                Side::Short
            };
            let size = if multiplier > Decimal::ZERO {
                row.current_qty.abs() / multiplier
            } else {
                row.current_qty.abs()
            };
            let mark_price = row.mark_price.unwrap_or(Decimal::ZERO);
            positions.push(VenuePosition {
                symbol: row.symbol,
                side,
                size,
                entry_price: row.avg_entry_price.unwrap_or(mark_price),
                mark_price,
                liquidation_price: row.liquidation_price.filter(|p| *p > Decimal::ZERO),
                margin: Self::from_scaled(row.pos_margin),
                leverage: row.leverage.unwrap_or(Decimal::ONE),
                unrealized_pnl: Self::from_scaled(row.unrealised_pnl),
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
                venue: Venue::Bitmex,
                reason: format!("no open position on {symbol}"),
            })?;

        let close_size = size.unwrap_or(position.size).min(position.size);
        let multiplier = self.multiplier(symbol).await?;
        let contracts = (close_size * multiplier * position.side.opposite().sign())
            .round()
            .to_i64()
            .ok_or_else(|| AdapterError::Decode {
                venue: Venue::Bitmex,
                reason: format!("close quantity out of range: {close_size}"),
            })?;

        let body = json!({
            "symbol": symbol,
            "orderQty": contracts,
            "ordType": "Market",
            "execInst": "ReduceOnly",
            "clOrdID": client_order_id,
        });
        let order: OrderResponse = self.post("/api/v1/order", &body, true).await?;

        let exit_price = match order.avg_px {
            Some(price) => price,
            None => self.mark_price(symbol).await?,
        };

        Ok(CloseResult {
            closed_size: close_size,
            exit_price,
        })
    }

    #[instrument(skip(self))]
    async fn adjust_margin(
        &self,
        symbol: &str,
        signed_amount: Decimal,
    ) -> Result<(), AdapterError> {
        let body = json!({
            "symbol": symbol,
            "amount": Self::to_scaled_int(signed_amount)?,
        });
        let _: serde_json::Value = self
            .post("/api/v1/position/transferMargin", &body, false)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn balances(&self) -> Result<HashMap<Wallet, WalletBalance>, AdapterError> {
        let margin: UserMargin = self.get("/api/v1/user/margin?currency=USDt").await?;

        let total = Self::from_scaled(margin.wallet_balance);
        let free = Self::from_scaled(margin.available_margin).min(total);

        // Single-wallet venue: everything lives in the trading wallet.
        let mut balances = HashMap::new();
        balances.insert(
            Wallet::Trading,
            WalletBalance {
                free,
                used: (total - free).max(Decimal::ZERO),
                total,
            },
        );
        Ok(balances)
    }

    async fn transfer_internal(
        &self,
        from: Wallet,
        to: Wallet,
        _amount: Decimal,
        _transfer_id: &str,
    ) -> Result<(), AdapterError> {
        // One wallet holds everything, so a same-wallet move is a no-op and
        // anything else is unsupported.
        if from == to {
            return Ok(());
        }
        Err(AdapterError::Unavailable {
            venue: Venue::Bitmex,
            reason: format!("no internal transfer from {from} to {to} on a single-wallet venue"),
        })
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
                venue: Venue::Bitmex,
                reason: format!("no deposit address configured for {destination}"),
            }
        })?;

        let body = json!({
            "currency": "USDt",
            "network": USDT_NETWORK,
            "amount": Self::to_scaled_int(amount)?,
            "address": address,
            "text": transfer_id,
        });
        let _: serde_json::Value = self
            .post("/api/v1/user/requestWithdrawal", &body, false)
            .await?;
        Ok(())
    }
}
