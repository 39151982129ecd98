//! Configuration management for the delta pair bot.
//!
//! Loads settings from environment variables and config files. Venue API
//! credentials enter through the same layered path (`.env` in development,
//! real environment variables in production) and are never logged.

use crate::exchange::Venue;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Owner of the trading session; keys persisted state.
    #[serde(default = "default_user_id")]
    pub user_id: String,
    /// Which venue carries which leg
    #[serde(default)]
    pub venues: VenuePairConfig,
    /// Bybit API credentials
    #[serde(default)]
    pub bybit: VenueCredentials,
    /// BitMEX API credentials
    #[serde(default)]
    pub bitmex: VenueCredentials,
    /// Position sizing parameters
    #[serde(default)]
    pub trade: TradeConfig,
    /// Monitoring and lifecycle timings
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Margin balancing parameters
    #[serde(default)]
    pub margin: MarginConfig,
    /// SQLite database path
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuePairConfig {
    /// Venue for the long leg
    #[serde(default = "default_long_venue")]
    pub long: Venue,
    /// Venue for the short leg
    #[serde(default = "default_short_venue")]
    pub short: Venue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueCredentials {
    /// API key for authentication
    #[serde(default)]
    pub api_key: String,
    /// Secret key for signing requests
    #[serde(default)]
    pub api_secret: String,
    /// USDT deposit address other venues withdraw toward
    #[serde(default)]
    pub deposit_address: String,
    /// Use testnet instead of production
    #[serde(default)]
    pub testnet: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeConfig {
    /// Base asset to trade on both legs (perpetual contracts)
    #[serde(default = "default_base_asset")]
    pub base_asset: String,
    /// Total capital committed to the pair, in USDT (split evenly per leg)
    #[serde(default = "default_capital_usdt")]
    pub capital_usdt: Decimal,
    /// Leverage applied to both legs
    #[serde(default = "default_leverage")]
    pub leverage: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between risk monitor ticks
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Seconds between scheduler ticks (margin balance cadence check)
    #[serde(default = "default_scheduler_tick_secs")]
    pub scheduler_tick_secs: u64,
    /// Risk level (0-100) at which the emergency closer fires
    #[serde(default = "default_max_risk_level")]
    pub max_risk_level: Decimal,
    /// Cooldown before reopening after an emergency close, in seconds
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Consecutive reopen failures tolerated before the session is stopped
    /// (0 = retry forever)
    #[serde(default)]
    pub max_reopen_attempts: u32,
    /// Bound on waiting for background loops during stop, in seconds
    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginConfig {
    /// Margin imbalance (percent of the larger side) that triggers a transfer
    #[serde(default = "default_margin_threshold_pct")]
    pub threshold_pct: Decimal,
    /// Hours between margin balance runs
    #[serde(default = "default_margin_interval_hours")]
    pub interval_hours: u64,
}

// Default value functions

fn default_user_id() -> String {
    "default".to_string()
}

fn default_db_path() -> String {
    "delta_pair_bot.db".to_string()
}

fn default_long_venue() -> Venue {
    Venue::Bybit
}

fn default_short_venue() -> Venue {
    Venue::Bitmex
}

fn default_base_asset() -> String {
    "SOL".to_string()
}

fn default_capital_usdt() -> Decimal {
    Decimal::new(1000, 0) // 1000 USDT across both legs
}

fn default_leverage() -> u8 {
    3
}

fn default_check_interval_secs() -> u64 {
    30
}

fn default_scheduler_tick_secs() -> u64 {
    60
}

fn default_max_risk_level() -> Decimal {
    Decimal::new(80, 0)
}

fn default_cooldown_secs() -> u64 {
    5
}

fn default_join_timeout_secs() -> u64 {
    10
}

fn default_margin_threshold_pct() -> Decimal {
    Decimal::new(20, 0)
}

fn default_margin_interval_hours() -> u64 {
    4
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("DPB"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.venues.long != self.venues.short,
            "long and short legs must be on different venues"
        );

        anyhow::ensure!(
            self.trade.capital_usdt > Decimal::ZERO,
            "capital_usdt must be positive"
        );

        anyhow::ensure!(
            self.trade.leverage >= 1 && self.trade.leverage <= 25,
            "leverage must be between 1 and 25"
        );

        anyhow::ensure!(
            self.monitor.max_risk_level > Decimal::ZERO
                && self.monitor.max_risk_level <= Decimal::new(100, 0),
            "max_risk_level must be between 0 and 100"
        );

        anyhow::ensure!(
            self.margin.threshold_pct > Decimal::ZERO
                && self.margin.threshold_pct < Decimal::new(100, 0),
            "margin threshold_pct must be between 0 and 100"
        );

        anyhow::ensure!(
            self.monitor.check_interval_secs > 0 && self.monitor.scheduler_tick_secs > 0,
            "monitor intervals must be positive"
        );

        Ok(())
    }

    /// Credentials for one venue.
    pub fn credentials_for(&self, venue: Venue) -> &VenueCredentials {
        match venue {
            Venue::Bybit => &self.bybit,
            Venue::Bitmex => &self.bitmex,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_id: default_user_id(),
            venues: VenuePairConfig::default(),
            bybit: VenueCredentials::default(),
            bitmex: VenueCredentials::default(),
            trade: TradeConfig::default(),
            monitor: MonitorConfig::default(),
            margin: MarginConfig::default(),
            db_path: default_db_path(),
        }
    }
}

impl Default for VenuePairConfig {
    fn default() -> Self {
        Self {
            long: default_long_venue(),
            short: default_short_venue(),
        }
    }
}

impl Default for VenueCredentials {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            deposit_address: String::new(),
            testnet: false,
        }
    }
}

impl Default for TradeConfig {
    fn default() -> Self {
        Self {
            base_asset: default_base_asset(),
            capital_usdt: default_capital_usdt(),
            leverage: default_leverage(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            scheduler_tick_secs: default_scheduler_tick_secs(),
            max_risk_level: default_max_risk_level(),
            cooldown_secs: default_cooldown_secs(),
            max_reopen_attempts: 0,
            join_timeout_secs: default_join_timeout_secs(),
        }
    }
}

impl Default for MarginConfig {
    fn default() -> Self {
        Self {
            threshold_pct: default_margin_threshold_pct(),
            interval_hours: default_margin_interval_hours(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_same_venue_for_both_legs_is_rejected() {
        let mut config = Config::default();
        config.venues.short = Venue::Bybit;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_capital_is_rejected() {
        let mut config = Config::default();
        config.trade.capital_usdt = Decimal::ZERO;
        assert!(config.validate().is_err());
    }
}
