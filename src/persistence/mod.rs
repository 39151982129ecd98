//! SQLite persistence for session lifecycle state.
//!
//! Everything the process must be able to show after a restart lives here:
//! - Sessions and their lifecycle status
//! - Legs (one row per venue position)
//! - Risk events with JSON payloads
//! - Margin balance log
//! - Trade history (realized PnL per closed leg)
//!
//! Writes are upserts keyed by natural ids; no caller assumes a
//! cross-call transaction.

use crate::bot::session::{Leg, LegStatus, Session, SessionStatus};
use crate::exchange::{Side, Venue};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// A persisted risk event.
#[derive(Debug, Clone)]
pub struct RiskEvent {
    pub event_type: String,
    pub severity: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// SQLite-backed store shared by both lifecycle loops.
pub struct Store {
    conn: Mutex<Connection>,
}

fn text_err(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_ts(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl Store {
    /// Open the store, initializing the schema if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!("Store initialized at {:?}", db_path.as_ref());
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("store mutex poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL,
                venue_long TEXT NOT NULL,
                venue_short TEXT NOT NULL,
                base_asset TEXT NOT NULL,
                started_at TEXT NOT NULL,
                stopped_at TEXT,
                last_activity_at TEXT NOT NULL,
                open_legs INTEGER NOT NULL,
                total_pnl TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id, status);

            CREATE TABLE IF NOT EXISTS legs (
                leg_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                venue TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                size TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                mark_price TEXT NOT NULL,
                liquidation_price TEXT,
                margin TEXT NOT NULL,
                leverage TEXT NOT NULL,
                risk_level TEXT NOT NULL,
                status TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                closed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_legs_session ON legs(session_id, status);

            CREATE TABLE IF NOT EXISTS risk_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_risk_events_session ON risk_events(session_id, created_at);

            CREATE TABLE IF NOT EXISTS margin_balance_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                source_venue TEXT NOT NULL,
                target_venue TEXT NOT NULL,
                amount TEXT NOT NULL,
                outcome TEXT NOT NULL,
                detail TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS trade_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                leg_id TEXT NOT NULL,
                venue TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                size TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                exit_price TEXT NOT NULL,
                pnl TEXT NOT NULL,
                closed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_session ON trade_history(session_id);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ==================== Sessions ====================

    /// Insert or update a session row.
    pub fn upsert_session(&self, session: &Session) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO sessions (session_id, user_id, status, venue_long, venue_short,
                                  base_asset, started_at, stopped_at, last_activity_at,
                                  open_legs, total_pnl)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(session_id) DO UPDATE SET
                status = ?3,
                stopped_at = ?8,
                last_activity_at = ?9,
                open_legs = ?10,
                total_pnl = ?11
            "#,
            params![
                session.session_id,
                session.user_id,
                session.status.to_string(),
                session.venue_long.to_string(),
                session.venue_short.to_string(),
                session.base_asset,
                session.started_at.to_rfc3339(),
                session.stopped_at.map(|t| t.to_rfc3339()),
                session.last_activity_at.to_rfc3339(),
                session.open_legs,
                session.total_pnl.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let conn = self.conn()?;
        let session = conn
            .query_row(
                r#"
                SELECT session_id, user_id, status, venue_long, venue_short, base_asset,
                       started_at, stopped_at, last_activity_at, open_legs, total_pnl
                FROM sessions WHERE session_id = ?1
                "#,
                params![session_id],
                Self::session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    /// The most recently started non-stopped session of a user, if any.
    pub fn find_active_session(&self, user_id: &str) -> Result<Option<Session>> {
        let conn = self.conn()?;
        let session = conn
            .query_row(
                r#"
                SELECT session_id, user_id, status, venue_long, venue_short, base_asset,
                       started_at, stopped_at, last_activity_at, open_legs, total_pnl
                FROM sessions
                WHERE user_id = ?1 AND status != 'stopped'
                ORDER BY started_at DESC
                LIMIT 1
                "#,
                params![user_id],
                Self::session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    /// Per-tick heartbeat: activity timestamp, open-leg count and running
    /// PnL total.
    pub fn touch_session(
        &self,
        session_id: &str,
        open_legs: u32,
        total_pnl: Decimal,
    ) -> Result<()> {
        self.conn()?.execute(
            r#"
            UPDATE sessions
            SET last_activity_at = ?2, open_legs = ?3, total_pnl = ?4
            WHERE session_id = ?1
            "#,
            params![
                session_id,
                Utc::now().to_rfc3339(),
                open_legs,
                total_pnl.to_string(),
            ],
        )?;
        Ok(())
    }

    fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
        let status: String = row.get(2)?;
        let venue_long: String = row.get(3)?;
        let venue_short: String = row.get(4)?;
        let started_at: String = row.get(6)?;
        let stopped_at: Option<String> = row.get(7)?;
        let last_activity_at: String = row.get(8)?;
        let total_pnl: String = row.get(10)?;

        Ok(Session {
            session_id: row.get(0)?,
            user_id: row.get(1)?,
            status: status.parse::<SessionStatus>().map_err(text_err)?,
            venue_long: venue_long.parse::<Venue>().map_err(text_err)?,
            venue_short: venue_short.parse::<Venue>().map_err(text_err)?,
            base_asset: row.get(5)?,
            started_at: parse_ts(&started_at),
            stopped_at: stopped_at.as_deref().map(parse_ts),
            last_activity_at: parse_ts(&last_activity_at),
            open_legs: row.get(9)?,
            total_pnl: Decimal::from_str(&total_pnl).unwrap_or_default(),
        })
    }

    // ==================== Legs ====================

    /// Insert or update a leg row.
    pub fn upsert_leg(&self, leg: &Leg) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO legs (leg_id, session_id, venue, symbol, side, size, entry_price,
                              mark_price, liquidation_price, margin, leverage, risk_level,
                              status, opened_at, closed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            ON CONFLICT(leg_id) DO UPDATE SET
                size = ?6,
                mark_price = ?8,
                liquidation_price = ?9,
                margin = ?10,
                risk_level = ?12,
                status = ?13,
                closed_at = ?15
            "#,
            params![
                leg.leg_id,
                leg.session_id,
                leg.venue.to_string(),
                leg.symbol,
                leg.side.to_string(),
                leg.size.to_string(),
                leg.entry_price.to_string(),
                leg.mark_price.to_string(),
                leg.liquidation_price.map(|p| p.to_string()),
                leg.margin.to_string(),
                leg.leverage.to_string(),
                leg.risk_level.to_string(),
                leg.status.to_string(),
                leg.opened_at.to_rfc3339(),
                leg.closed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get_open_legs(&self, session_id: &str) -> Result<Vec<Leg>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT leg_id, session_id, venue, symbol, side, size, entry_price, mark_price,
                   liquidation_price, margin, leverage, risk_level, status, opened_at, closed_at
            FROM legs
            WHERE session_id = ?1 AND status = 'open'
            ORDER BY venue, symbol
            "#,
        )?;

        let legs = stmt
            .query_map(params![session_id], Self::leg_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(legs)
    }

    /// Update the monitor-owned fields of a leg.
    pub fn update_leg_risk(
        &self,
        leg_id: &str,
        risk_level: Decimal,
        mark_price: Decimal,
        liquidation_price: Option<Decimal>,
    ) -> Result<()> {
        self.conn()?.execute(
            r#"
            UPDATE legs
            SET risk_level = ?2, mark_price = ?3, liquidation_price = ?4
            WHERE leg_id = ?1
            "#,
            params![
                leg_id,
                risk_level.to_string(),
                mark_price.to_string(),
                liquidation_price.map(|p| p.to_string()),
            ],
        )?;
        Ok(())
    }

    /// Mark a leg closed and archive the realized trade. Returns the PnL.
    pub fn close_leg(&self, leg: &Leg, exit_price: Decimal) -> Result<Decimal> {
        let pnl = leg.realized_pnl(exit_price);
        let closed_at = Utc::now().to_rfc3339();

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE legs SET status = 'closed', closed_at = ?2 WHERE leg_id = ?1",
            params![leg.leg_id, closed_at],
        )?;
        tx.execute(
            r#"
            INSERT INTO trade_history (session_id, leg_id, venue, symbol, side, size,
                                       entry_price, exit_price, pnl, closed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                leg.session_id,
                leg.leg_id,
                leg.venue.to_string(),
                leg.symbol,
                leg.side.to_string(),
                leg.size.to_string(),
                leg.entry_price.to_string(),
                exit_price.to_string(),
                pnl.to_string(),
                closed_at,
            ],
        )?;
        tx.commit()?;

        debug!(leg_id = %leg.leg_id, %pnl, "Leg closed and archived");
        Ok(pnl)
    }

    /// Sum of realized PnL across the session's archived trades.
    pub fn session_realized_pnl(&self, session_id: &str) -> Result<Decimal> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT pnl FROM trade_history WHERE session_id = ?1")?;
        let total = stmt
            .query_map(params![session_id], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .filter_map(|s| Decimal::from_str(&s).ok())
            .sum();
        Ok(total)
    }

    fn leg_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Leg> {
        let venue: String = row.get(2)?;
        let side: String = row.get(4)?;
        let size: String = row.get(5)?;
        let entry_price: String = row.get(6)?;
        let mark_price: String = row.get(7)?;
        let liquidation_price: Option<String> = row.get(8)?;
        let margin: String = row.get(9)?;
        let leverage: String = row.get(10)?;
        let risk_level: String = row.get(11)?;
        let status: String = row.get(12)?;
        let opened_at: String = row.get(13)?;
        let closed_at: Option<String> = row.get(14)?;

        Ok(Leg {
            leg_id: row.get(0)?,
            session_id: row.get(1)?,
            venue: venue.parse::<Venue>().map_err(text_err)?,
            symbol: row.get(3)?,
            side: match side.as_str() {
                "long" => Side::Long,
                "short" => Side::Short,
                other => return Err(text_err(format!("unknown side: {other}"))),
            },
            size: Decimal::from_str(&size).unwrap_or_default(),
            entry_price: Decimal::from_str(&entry_price).unwrap_or_default(),
            mark_price: Decimal::from_str(&mark_price).unwrap_or_default(),
            liquidation_price: liquidation_price
                .as_deref()
                .and_then(|p| Decimal::from_str(p).ok()),
            margin: Decimal::from_str(&margin).unwrap_or_default(),
            leverage: Decimal::from_str(&leverage).unwrap_or_default(),
            risk_level: Decimal::from_str(&risk_level).unwrap_or_default(),
            status: status.parse::<LegStatus>().map_err(text_err)?,
            opened_at: parse_ts(&opened_at),
            closed_at: closed_at.as_deref().map(parse_ts),
        })
    }

    // ==================== Event logs ====================

    /// Record a risk event with a structured payload.
    pub fn append_risk_event(
        &self,
        session_id: &str,
        event_type: &str,
        severity: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO risk_events (session_id, event_type, severity, payload, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                session_id,
                event_type,
                severity,
                payload.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn recent_risk_events(&self, session_id: &str, limit: usize) -> Result<Vec<RiskEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT event_type, severity, payload, created_at
            FROM risk_events
            WHERE session_id = ?1
            ORDER BY id DESC
            LIMIT ?2
            "#,
        )?;

        let events = stmt
            .query_map(params![session_id, limit], |row| {
                let payload: String = row.get(2)?;
                let created_at: String = row.get(3)?;
                Ok(RiskEvent {
                    event_type: row.get(0)?,
                    severity: row.get(1)?,
                    payload: serde_json::from_str(&payload)
                        .unwrap_or(serde_json::Value::Null),
                    created_at: parse_ts(&created_at),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// Record one margin balance run that moved (or tried to move) money.
    pub fn append_margin_balance(
        &self,
        session_id: &str,
        source_venue: Venue,
        target_venue: Venue,
        amount: Decimal,
        outcome: &str,
        detail: Option<&str>,
    ) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO margin_balance_log (session_id, source_venue, target_venue, amount,
                                            outcome, detail, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                session_id,
                source_venue.to_string(),
                target_venue.to_string(),
                amount.to_string(),
                outcome,
                detail,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn open_leg(session_id: &str, leg_id: &str, venue: Venue, side: Side) -> Leg {
        Leg {
            leg_id: leg_id.to_string(),
            session_id: session_id.to_string(),
            venue,
            symbol: "SOLUSDT".to_string(),
            side,
            size: dec!(10),
            entry_price: dec!(100),
            mark_price: dec!(100),
            liquidation_price: Some(dec!(70)),
            margin: dec!(333),
            leverage: dec!(3),
            risk_level: Decimal::ZERO,
            status: LegStatus::Open,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    #[test]
    fn test_session_round_trip() {
        let store = Store::new(":memory:").unwrap();

        let mut session = Session::new("alice", Venue::Bybit, Venue::Bitmex, "SOL");
        session.status = SessionStatus::Active;
        store.upsert_session(&session).unwrap();

        let active = store.find_active_session("alice").unwrap().unwrap();
        assert_eq!(active.session_id, session.session_id);
        assert_eq!(active.status, SessionStatus::Active);
        assert_eq!(active.venue_long, Venue::Bybit);
        assert_eq!(active.venue_short, Venue::Bitmex);

        session.status = SessionStatus::Stopped;
        session.stopped_at = Some(Utc::now());
        store.upsert_session(&session).unwrap();
        assert!(store.find_active_session("alice").unwrap().is_none());
    }

    #[test]
    fn test_leg_round_trip_and_risk_update() {
        let store = Store::new(":memory:").unwrap();
        let leg = open_leg("s-1", "leg-1", Venue::Bybit, Side::Long);
        store.upsert_leg(&leg).unwrap();

        store
            .update_leg_risk("leg-1", dec!(42.5), dec!(105), None)
            .unwrap();

        let legs = store.get_open_legs("s-1").unwrap();
        assert_eq!(legs.len(), 1);
        assert_eq!(legs[0].risk_level, dec!(42.5));
        assert_eq!(legs[0].mark_price, dec!(105));
        assert_eq!(legs[0].liquidation_price, None);
    }

    #[test]
    fn test_close_leg_archives_trade() {
        let store = Store::new(":memory:").unwrap();
        let long = open_leg("s-1", "leg-1", Venue::Bybit, Side::Long);
        let short = open_leg("s-1", "leg-2", Venue::Bitmex, Side::Short);
        store.upsert_leg(&long).unwrap();
        store.upsert_leg(&short).unwrap();

        // Long closed +50, short closed -50 at the same prices.
        assert_eq!(store.close_leg(&long, dec!(105)).unwrap(), dec!(50));
        assert_eq!(store.close_leg(&short, dec!(105)).unwrap(), dec!(-50));

        assert!(store.get_open_legs("s-1").unwrap().is_empty());
        assert_eq!(store.session_realized_pnl("s-1").unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_risk_events() {
        let store = Store::new(":memory:").unwrap();
        store
            .append_risk_event(
                "s-1",
                "high_risk",
                "high",
                &serde_json::json!({"symbol": "SOLUSDT", "risk_level": "83"}),
            )
            .unwrap();

        let events = store.recent_risk_events("s-1", 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "high_risk");
        assert_eq!(events[0].payload["symbol"], "SOLUSDT");
    }
}
