//! Session and leg models.
//!
//! A session is one lifecycle of the delta-neutral pair for one user; its
//! two legs live on different venues. Both are persisted on every
//! transition so a restarted process can observe what was running.

use crate::exchange::{Side, Venue};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a session.
///
/// Transitions only move forward through an emergency cycle
/// (`Active -> EmergencyClosing -> Cooldown -> Reopening -> Active`) or
/// toward `Stopped`; `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Active,
    EmergencyClosing,
    Cooldown,
    Reopening,
    Stopping,
    Stopped,
}

impl SessionStatus {
    /// Whether the lifecycle loops should keep running.
    pub fn is_running(&self) -> bool {
        !matches!(self, SessionStatus::Stopping | SessionStatus::Stopped)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Active => "active",
            SessionStatus::EmergencyClosing => "emergency_closing",
            SessionStatus::Cooldown => "cooldown",
            SessionStatus::Reopening => "reopening",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(SessionStatus::Starting),
            "active" => Ok(SessionStatus::Active),
            "emergency_closing" => Ok(SessionStatus::EmergencyClosing),
            "cooldown" => Ok(SessionStatus::Cooldown),
            "reopening" => Ok(SessionStatus::Reopening),
            "stopping" => Ok(SessionStatus::Stopping),
            "stopped" => Ok(SessionStatus::Stopped),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegStatus {
    Open,
    Closed,
}

impl fmt::Display for LegStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegStatus::Open => write!(f, "open"),
            LegStatus::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for LegStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(LegStatus::Open),
            "closed" => Ok(LegStatus::Closed),
            other => Err(format!("unknown leg status: {other}")),
        }
    }
}

/// One side of the pair on one venue.
#[derive(Debug, Clone)]
pub struct Leg {
    pub leg_id: String,
    pub session_id: String,
    pub venue: Venue,
    pub symbol: String,
    pub side: Side,
    /// Size in base-asset units.
    pub size: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub liquidation_price: Option<Decimal>,
    /// Isolated margin currently backing the leg, in USDT.
    pub margin: Decimal,
    pub leverage: Decimal,
    /// Last assessed risk level, 0-100.
    pub risk_level: Decimal,
    pub status: LegStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Leg {
    /// Realized PnL for this leg at a given exit price.
    pub fn realized_pnl(&self, exit_price: Decimal) -> Decimal {
        (exit_price - self.entry_price) * self.size * self.side.sign()
    }
}

/// Persisted session row.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub status: SessionStatus,
    pub venue_long: Venue,
    pub venue_short: Venue,
    pub base_asset: String,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub open_legs: u32,
    pub total_pnl: Decimal,
}

impl Session {
    pub fn new(user_id: &str, venue_long: Venue, venue_short: Venue, base_asset: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: format!("session-{}-{}", now.timestamp(), now.timestamp_subsec_nanos()),
            user_id: user_id.to_string(),
            status: SessionStatus::Starting,
            venue_long,
            venue_short,
            base_asset: base_asset.to_string(),
            started_at: now,
            stopped_at: None,
            last_activity_at: now,
            open_legs: 0,
            total_pnl: Decimal::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            SessionStatus::Starting,
            SessionStatus::Active,
            SessionStatus::EmergencyClosing,
            SessionStatus::Cooldown,
            SessionStatus::Reopening,
            SessionStatus::Stopping,
            SessionStatus::Stopped,
        ] {
            assert_eq!(status.to_string().parse::<SessionStatus>().unwrap(), status);
        }
        assert!(SessionStatus::Stopped.to_string().parse::<SessionStatus>().unwrap() == SessionStatus::Stopped);
        assert!(!SessionStatus::Stopping.is_running());
        assert!(SessionStatus::Cooldown.is_running());
    }

    #[test]
    fn realized_pnl_respects_side() {
        let leg = Leg {
            leg_id: "leg-1".into(),
            session_id: "s-1".into(),
            venue: Venue::Bybit,
            symbol: "SOLUSDT".into(),
            side: Side::Long,
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
        };
        assert_eq!(leg.realized_pnl(dec!(110)), dec!(100));

        let short = Leg {
            side: Side::Short,
            ..leg
        };
        assert_eq!(short.realized_pnl(dec!(110)), dec!(-100));
    }
}
