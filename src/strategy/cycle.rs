//! Cooldown-and-reopen cycle after an emergency close.
//!
//! After all legs are closed the session waits out a cooldown and then
//! reopens the pair. The cooldown is interruptible by shutdown, failed
//! reopens count toward an optional attempt ceiling, and any successful
//! reopen resets that counter.

use crate::bot::session::Session;
use crate::exchange::AdapterPair;
use crate::persistence::Store;
use crate::risk::Severity;
use crate::strategy::entry::EntryManager;
use anyhow::Result;
use serde_json::json;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Result of one cooldown-and-reopen pass.
#[derive(Debug)]
pub enum CycleOutcome {
    /// The pair was reopened with these many legs.
    Reopened(usize),
    /// Legs were already live; nothing was submitted.
    AlreadyOpen,
    /// Shutdown was requested during the cooldown.
    Interrupted,
    /// The reopen attempt failed; it may be retried on a later tick.
    Failed(String),
    /// The configured attempt ceiling was reached; the session must stop.
    Exhausted,
}

pub struct CycleManager {
    cooldown: Duration,
    max_reopen_attempts: u32,
    attempts: u32,
}

impl CycleManager {
    /// `max_reopen_attempts` of zero means retry without a ceiling.
    pub fn new(cooldown_secs: u64, max_reopen_attempts: u32) -> Self {
        Self {
            cooldown: Duration::from_secs(cooldown_secs),
            max_reopen_attempts,
            attempts: 0,
        }
    }

    /// Consecutive failed reopens since the last success.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Wait out the cooldown (abandoning the wait if shutdown fires) and
    /// reopen the pair.
    pub async fn cooldown_and_reopen(
        &mut self,
        entry: &EntryManager,
        adapters: &AdapterPair,
        store: &Store,
        session: &Session,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<CycleOutcome> {
        if self.max_reopen_attempts > 0 && self.attempts >= self.max_reopen_attempts {
            error!(
                session_id = %session.session_id,
                attempts = self.attempts,
                "Reopen attempts exhausted"
            );
            store.append_risk_event(
                &session.session_id,
                "reopen_exhausted",
                Severity::Critical.as_str(),
                &json!({ "attempts": self.attempts }),
            )?;
            return Ok(CycleOutcome::Exhausted);
        }

        info!(
            session_id = %session.session_id,
            cooldown_secs = self.cooldown.as_secs(),
            "Cooling down before reopen"
        );
        tokio::select! {
            _ = tokio::time::sleep(self.cooldown) => {}
            _ = shutdown.wait_for(|stop| *stop) => {
                info!(session_id = %session.session_id, "Cooldown interrupted by shutdown");
                return Ok(CycleOutcome::Interrupted);
            }
        }

        match entry.open_pair(adapters, store, session).await {
            Ok(outcome) if outcome.already_open => {
                self.attempts = 0;
                Ok(CycleOutcome::AlreadyOpen)
            }
            Ok(outcome) => {
                self.attempts = 0;
                info!(
                    session_id = %session.session_id,
                    legs = outcome.legs.len(),
                    "Pair reopened after cooldown"
                );
                store.append_risk_event(
                    &session.session_id,
                    "position_reopened",
                    Severity::Low.as_str(),
                    &json!({ "legs": outcome.legs.len() }),
                )?;
                Ok(CycleOutcome::Reopened(outcome.legs.len()))
            }
            Err(e) => {
                self.attempts += 1;
                warn!(
                    session_id = %session.session_id,
                    attempts = self.attempts,
                    error = %e,
                    "Reopen attempt failed"
                );
                store.append_risk_event(
                    &session.session_id,
                    "reopen_failed",
                    Severity::High.as_str(),
                    &json!({
                        "attempts": self.attempts,
                        "error": e.to_string(),
                        "leg_left_open": e.leaves_open_leg(),
                    }),
                )?;
                Ok(CycleOutcome::Failed(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TradeConfig;
    use crate::exchange::{MockExchange, Venue};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    struct Fixture {
        adapters: AdapterPair,
        store: Store,
        session: Session,
        long: Arc<MockExchange>,
        short: Arc<MockExchange>,
        entry: EntryManager,
    }

    fn fixture() -> Fixture {
        let long = Arc::new(MockExchange::new(Venue::Bybit));
        let short = Arc::new(MockExchange::new(Venue::Bitmex));
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
    async fn reopens_after_cooldown() {
        let f = fixture();
        let mut cycle = CycleManager::new(0, 0);
        let (_tx, mut rx) = watch::channel(false);

        let outcome = cycle
            .cooldown_and_reopen(&f.entry, &f.adapters, &f.store, &f.session, &mut rx)
            .await
            .unwrap();
        assert!(matches!(outcome, CycleOutcome::Reopened(2)));
        assert_eq!(f.long.order_count().await, 1);
        assert_eq!(f.short.order_count().await, 1);
    }

    #[tokio::test]
    async fn shutdown_interrupts_the_cooldown() {
        let f = fixture();
        let mut cycle = CycleManager::new(3600, 0);
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();

        let outcome = cycle
            .cooldown_and_reopen(&f.entry, &f.adapters, &f.store, &f.session, &mut rx)
            .await
            .unwrap();
        assert!(matches!(outcome, CycleOutcome::Interrupted));
        assert_eq!(f.long.order_count().await, 0);
    }

    #[tokio::test]
    async fn failures_count_toward_the_ceiling() {
        let f = fixture();
        f.long.reject_orders(true).await;
        let mut cycle = CycleManager::new(0, 2);
        let (_tx, mut rx) = watch::channel(false);

        for expected in 1..=2u32 {
            let outcome = cycle
                .cooldown_and_reopen(&f.entry, &f.adapters, &f.store, &f.session, &mut rx)
                .await
                .unwrap();
            assert!(matches!(outcome, CycleOutcome::Failed(_)));
            assert_eq!(cycle.attempts(), expected);
        }

        let outcome = cycle
            .cooldown_and_reopen(&f.entry, &f.adapters, &f.store, &f.session, &mut rx)
            .await
            .unwrap();
        assert!(matches!(outcome, CycleOutcome::Exhausted));
    }

    #[tokio::test]
    async fn success_resets_the_failure_counter() {
        let f = fixture();
        f.long.reject_orders(true).await;
        let mut cycle = CycleManager::new(0, 5);
        let (_tx, mut rx) = watch::channel(false);

        let outcome = cycle
            .cooldown_and_reopen(&f.entry, &f.adapters, &f.store, &f.session, &mut rx)
            .await
            .unwrap();
        assert!(matches!(outcome, CycleOutcome::Failed(_)));
        assert_eq!(cycle.attempts(), 1);

        f.long.reject_orders(false).await;
        let outcome = cycle
            .cooldown_and_reopen(&f.entry, &f.adapters, &f.store, &f.session, &mut rx)
            .await
            .unwrap();
        assert!(matches!(outcome, CycleOutcome::Reopened(2)));
        assert_eq!(cycle.attempts(), 0);
    }
}
