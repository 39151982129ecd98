//! Session lifecycle controller.
//!
//! Owns one session end to end: pre-start checks, entry, the background
//! monitor and scheduler loops, and the stop sequence. The monitor loop
//! drives the emergency cycle (close, cooldown, reopen); the scheduler
//! loop runs margin balancing on its own cadence. A single async mutex
//! serializes every operation that moves money or closes positions so the
//! two loops and `stop` never interleave.

use crate::bot::session::{Session, SessionStatus};
use crate::config::Config;
use crate::exchange::AdapterPair;
use crate::persistence::Store;
use crate::risk::{CloseReport, CloseTrigger, EmergencyCloser, RiskMonitor, Severity};
use crate::strategy::{
    BalanceOutcome, CycleManager, CycleOutcome, EntryManager, MarginBalancer,
};
use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// State shared between the controller and its background loops.
struct Shared {
    session: Mutex<Session>,
    /// Serializes close-all, reopen and margin-balance operations.
    ops: tokio::sync::Mutex<()>,
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn status(&self) -> SessionStatus {
        self.session().status
    }
}

struct RunningSession {
    shared: Arc<Shared>,
    shutdown: Arc<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct BotController {
    config: Config,
    store: Arc<Store>,
    adapters: AdapterPair,
    runtime: tokio::sync::Mutex<Option<RunningSession>>,
}

impl BotController {
    pub fn new(config: Config, store: Arc<Store>, adapters: AdapterPair) -> Self {
        Self {
            config,
            store,
            adapters,
            runtime: tokio::sync::Mutex::new(None),
        }
    }

    /// Start (or resume) a session and spawn the background loops.
    ///
    /// Idempotent: a second call while a session is running returns the
    /// existing session id without touching the venues.
    pub async fn start(&self) -> Result<String> {
        let mut runtime = self.runtime.lock().await;
        if let Some(running) = runtime.as_ref() {
            let session = running.shared.session();
            if session.status.is_running() {
                info!(session_id = %session.session_id, "Session already running");
                return Ok(session.session_id.clone());
            }
        }

        // Credentials and connectivity are verified before any state is
        // created; a venue that cannot even report balances cannot trade.
        for adapter in self.adapters.both() {
            adapter.balances().await.with_context(|| {
                format!("pre-start balance check failed on {}", adapter.venue())
            })?;
        }

        let mut session = match self.store.find_active_session(&self.config.user_id)? {
            Some(existing) => {
                info!(session_id = %existing.session_id, "Resuming unfinished session");
                existing
            }
            None => Session::new(
                &self.config.user_id,
                self.adapters.long.venue(),
                self.adapters.short.venue(),
                &self.config.trade.base_asset,
            ),
        };
        session.status = SessionStatus::Starting;
        session.last_activity_at = Utc::now();
        self.store.upsert_session(&session)?;

        let entry = EntryManager::new(self.config.trade.clone());
        match entry.open_pair(&self.adapters, &self.store, &session).await {
            Ok(outcome) => {
                info!(
                    session_id = %session.session_id,
                    already_open = outcome.already_open,
                    legs = outcome.legs.len(),
                    "Entry complete"
                );
            }
            Err(e) => {
                error!(session_id = %session.session_id, error = %e, "Entry failed");
                self.store.append_risk_event(
                    &session.session_id,
                    "entry_failed",
                    Severity::High.as_str(),
                    &json!({
                        "error": e.to_string(),
                        "leg_left_open": e.leaves_open_leg(),
                    }),
                )?;
                session.status = SessionStatus::Stopped;
                session.stopped_at = Some(Utc::now());
                self.store.upsert_session(&session)?;
                return Err(e.into());
            }
        }

        session.status = SessionStatus::Active;
        session.last_activity_at = Utc::now();
        self.store.upsert_session(&session)?;
        let open = self.store.get_open_legs(&session.session_id)?.len() as u32;
        let realized = self.store.session_realized_pnl(&session.session_id)?;
        self.store.touch_session(&session.session_id, open, realized)?;

        let shared = Arc::new(Shared {
            session: Mutex::new(session.clone()),
            ops: tokio::sync::Mutex::new(()),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);

        let monitor = MonitorLoop {
            shared: Arc::clone(&shared),
            store: Arc::clone(&self.store),
            adapters: self.adapters.clone(),
            monitor: RiskMonitor::new(self.config.monitor.max_risk_level),
            entry: EntryManager::new(self.config.trade.clone()),
            cycle: CycleManager::new(
                self.config.monitor.cooldown_secs,
                self.config.monitor.max_reopen_attempts,
            ),
            check_interval: Duration::from_secs(self.config.monitor.check_interval_secs),
            shutdown: shutdown_rx.clone(),
            shutdown_tx: Arc::clone(&shutdown_tx),
        };
        let scheduler = SchedulerLoop {
            shared: Arc::clone(&shared),
            store: Arc::clone(&self.store),
            adapters: self.adapters.clone(),
            balancer: MarginBalancer::new(self.config.margin.threshold_pct),
            balance_interval: Duration::from_secs(self.config.margin.interval_hours * 3600),
            tick: Duration::from_secs(self.config.monitor.scheduler_tick_secs),
            shutdown: shutdown_rx,
        };

        let tasks = vec![tokio::spawn(monitor.run()), tokio::spawn(scheduler.run())];
        *runtime = Some(RunningSession {
            shared,
            shutdown: shutdown_tx,
            tasks,
        });

        info!(session_id = %session.session_id, "Session started");
        Ok(session.session_id)
    }

    /// Resolves when the session asks to stop on its own (for example after
    /// exhausting its reopen attempts). Resolves immediately if nothing is
    /// running.
    pub async fn wait_for_shutdown(&self) {
        let rx = self
            .runtime
            .lock()
            .await
            .as_ref()
            .map(|r| r.shutdown.subscribe());
        if let Some(mut rx) = rx {
            let _ = rx.wait_for(|stop| *stop).await;
        }
    }

    /// Stop the session: signal the loops, wait for them within a bound,
    /// then close every remaining leg and mark the session stopped.
    ///
    /// The close-all sweep runs even if a loop had to be aborted, so no
    /// position outlives the session on a clean stop path.
    pub async fn stop(&self) -> Result<Option<CloseReport>> {
        let mut runtime = self.runtime.lock().await;
        let Some(running) = runtime.take() else {
            info!("No running session to stop");
            return Ok(None);
        };

        let session_id = {
            let mut session = running.shared.session();
            session.status = SessionStatus::Stopping;
            session.last_activity_at = Utc::now();
            session.session_id.clone()
        };
        self.store
            .upsert_session(&running.shared.session().clone())?;
        info!(%session_id, "Stopping session");

        let _ = running.shutdown.send(true);
        let join_timeout = Duration::from_secs(self.config.monitor.join_timeout_secs);
        for mut task in running.tasks {
            if tokio::time::timeout(join_timeout, &mut task).await.is_err() {
                warn!(%session_id, "Background loop did not finish in time, aborting it");
                task.abort();
            }
        }

        let _ops = running.shared.ops.lock().await;
        let report = EmergencyCloser
            .close_all(&self.adapters, &self.store, &session_id, CloseTrigger::OperatorStop)
            .await?;
        if !report.is_complete() {
            warn!(
                %session_id,
                failed = report.failed_count(),
                "Some legs could not be closed on stop and need manual attention"
            );
        }

        let open = self.store.get_open_legs(&session_id)?.len() as u32;
        let realized = self.store.session_realized_pnl(&session_id)?;
        let session = {
            let mut session = running.shared.session();
            session.status = SessionStatus::Stopped;
            session.stopped_at = Some(Utc::now());
            session.last_activity_at = Utc::now();
            session.open_legs = open;
            session.total_pnl = realized;
            session.clone()
        };
        self.store.upsert_session(&session)?;
        self.store.touch_session(&session_id, open, realized)?;

        info!(
            %session_id,
            closed = report.closed_count(),
            realized_pnl = %realized,
            "Session stopped"
        );
        Ok(Some(report))
    }
}

/// Periodic risk scan plus the emergency close / reopen state machine.
struct MonitorLoop {
    shared: Arc<Shared>,
    store: Arc<Store>,
    adapters: AdapterPair,
    monitor: RiskMonitor,
    entry: EntryManager,
    cycle: CycleManager,
    check_interval: Duration,
    shutdown: watch::Receiver<bool>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl MonitorLoop {
    async fn run(mut self) {
        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                res = self.shutdown.changed() => {
                    if res.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
            if *self.shutdown.borrow() {
                break;
            }
            if let Err(e) = self.tick().await {
                warn!(error = %e, "Monitor tick failed, retrying next tick");
            }
            if !self.shared.status().is_running() {
                break;
            }
        }
        debug!("Monitor loop finished");
    }

    async fn tick(&mut self) -> Result<()> {
        match self.shared.status() {
            SessionStatus::Starting | SessionStatus::Active => self.tick_active().await,
            // A previous close-all left legs open; retry the sweep.
            SessionStatus::EmergencyClosing => self.run_emergency_close().await,
            // A previous reopen failed or was never reached; retry the cycle.
            SessionStatus::Cooldown | SessionStatus::Reopening => self.run_reopen_cycle().await,
            SessionStatus::Stopping | SessionStatus::Stopped => Ok(()),
        }
    }

    async fn tick_active(&mut self) -> Result<()> {
        let session_id = self.shared.session().session_id.clone();
        let assessments = self
            .monitor
            .check_legs(&self.adapters, &self.store, &session_id)
            .await?;

        let realized = self.store.session_realized_pnl(&session_id)?;
        self.store
            .touch_session(&session_id, assessments.len() as u32, realized)?;

        let breached: Vec<_> = assessments
            .iter()
            .filter(|a| self.monitor.is_breach(a))
            .collect();
        if breached.is_empty() {
            return Ok(());
        }

        for a in &breached {
            warn!(
                leg_id = %a.leg_id,
                venue = %a.venue,
                risk_level = %a.risk_level,
                "Risk ceiling breached"
            );
        }
        self.set_status(SessionStatus::EmergencyClosing)?;
        self.run_emergency_close().await
    }

    async fn run_emergency_close(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let _ops = shared.ops.lock().await;
        let session_id = self.shared.session().session_id.clone();

        let report = EmergencyCloser
            .close_all(&self.adapters, &self.store, &session_id, CloseTrigger::RiskBreach)
            .await?;
        let open = self.store.get_open_legs(&session_id)?.len() as u32;
        let realized = self.store.session_realized_pnl(&session_id)?;
        self.store.touch_session(&session_id, open, realized)?;

        if !report.is_complete() {
            // Stay in EmergencyClosing; the next tick retries the sweep.
            return Ok(());
        }

        self.set_status(SessionStatus::Cooldown)?;
        drop(_ops);
        self.run_reopen_cycle().await
    }

    async fn run_reopen_cycle(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let _ops = shared.ops.lock().await;
        let session = self.shared.session().clone();

        self.set_status(SessionStatus::Reopening)?;
        let outcome = self
            .cycle
            .cooldown_and_reopen(
                &self.entry,
                &self.adapters,
                &self.store,
                &session,
                &mut self.shutdown,
            )
            .await?;

        match outcome {
            CycleOutcome::Reopened(_) | CycleOutcome::AlreadyOpen => {
                self.set_status(SessionStatus::Active)?;
                let open = self.store.get_open_legs(&session.session_id)?.len() as u32;
                let realized = self.store.session_realized_pnl(&session.session_id)?;
                self.store.touch_session(&session.session_id, open, realized)?;
            }
            CycleOutcome::Failed(reason) => {
                warn!(session_id = %session.session_id, %reason, "Reopen failed, will retry");
                self.set_status(SessionStatus::Cooldown)?;
            }
            CycleOutcome::Interrupted => {
                self.set_status(SessionStatus::Cooldown)?;
            }
            CycleOutcome::Exhausted => {
                error!(
                    session_id = %session.session_id,
                    "Reopen attempts exhausted, stopping session"
                );
                self.set_status(SessionStatus::Stopping)?;
                let _ = self.shutdown_tx.send(true);
            }
        }
        Ok(())
    }

    fn set_status(&self, status: SessionStatus) -> Result<()> {
        let session = {
            let mut session = self.shared.session();
            session.status = status;
            session.last_activity_at = Utc::now();
            session.clone()
        };
        self.store.upsert_session(&session)
    }
}

/// Time-based maintenance: margin balancing on its own cadence.
struct SchedulerLoop {
    shared: Arc<Shared>,
    store: Arc<Store>,
    adapters: AdapterPair,
    balancer: MarginBalancer,
    balance_interval: Duration,
    tick: Duration,
    shutdown: watch::Receiver<bool>,
}

impl SchedulerLoop {
    async fn run(mut self) {
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_balance = Instant::now();
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                res = self.shutdown.changed() => {
                    if res.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
            if *self.shutdown.borrow() {
                break;
            }

            let status = self.shared.status();
            if !status.is_running() {
                break;
            }
            // Balancing only makes sense with both legs live and settled.
            if status != SessionStatus::Active {
                continue;
            }
            if last_balance.elapsed() < self.balance_interval {
                continue;
            }

            let session_id = self.shared.session().session_id.clone();
            let _ops = self.shared.ops.lock().await;
            match self
                .balancer
                .rebalance(&self.adapters, &self.store, &session_id)
                .await
            {
                Ok(BalanceOutcome::Balanced) => {
                    debug!(%session_id, "Margin within threshold")
                }
                Ok(BalanceOutcome::Completed { moved, from, to }) => {
                    info!(%session_id, %moved, %from, %to, "Margin rebalanced")
                }
                // Never auto-retried within the cadence; the row in the
                // margin balance log carries what happened.
                Err(e) => warn!(%session_id, error = %e, "Margin balance failed"),
            }
            last_balance = Instant::now();
        }
        debug!("Scheduler loop finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::exchange::{MockExchange, Venue};
    use rust_decimal_macros::dec;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.monitor.check_interval_secs = 1;
        config.monitor.cooldown_secs = 0;
        config.monitor.join_timeout_secs = 2;
        config
    }

    fn build(config: Config) -> (BotController, Arc<MockExchange>, Arc<MockExchange>) {
        let long = Arc::new(MockExchange::new(Venue::Bybit));
        let short = Arc::new(MockExchange::new(Venue::Bitmex));
        let adapters = AdapterPair::new(long.clone(), short.clone());
        let store = Arc::new(Store::new(":memory:").unwrap());
        (BotController::new(config, store, adapters), long, short)
    }

    #[tokio::test]
    async fn start_then_stop_leaves_no_position_behind() {
        let (controller, long, short) = build(test_config());

        let session_id = controller.start().await.unwrap();
        assert_eq!(long.open_position_count().await, 1);
        assert_eq!(short.open_position_count().await, 1);

        let report = controller.stop().await.unwrap().unwrap();
        assert!(report.is_complete());
        assert_eq!(long.open_position_count().await, 0);
        assert_eq!(short.open_position_count().await, 0);

        let session = controller.store.get_session(&session_id).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Stopped);
        assert!(session.stopped_at.is_some());
    }

    #[tokio::test]
    async fn second_start_reuses_the_running_session() {
        let (controller, long, short) = build(test_config());

        let first = controller.start().await.unwrap();
        let second = controller.start().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(long.order_count().await, 1);
        assert_eq!(short.order_count().await, 1);

        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn breach_closes_and_reopens_the_pair() {
        let (controller, long, short) = build(test_config());

        let session_id = controller.start().await.unwrap();
        let orders_before = long.order_count().await;

        // Push the long leg to the edge of liquidation: risk 95 >= 80.
        long.set_liquidation_price("SOLUSDT", Some(dec!(95))).await;
        tokio::time::sleep(Duration::from_secs(4)).await;

        // Close + reopen each add an order on the long venue.
        assert!(long.order_count().await >= orders_before + 2);
        assert_eq!(long.open_position_count().await, 1);
        assert_eq!(short.open_position_count().await, 1);

        let session = controller.store.get_session(&session_id).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Active);

        let events = controller
            .store
            .recent_risk_events(&session_id, 20)
            .unwrap();
        assert!(events.iter().any(|e| e.event_type == "emergency_close"));
        assert!(events.iter().any(|e| e.event_type == "position_reopened"));

        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let (controller, _long, _short) = build(test_config());
        assert!(controller.stop().await.unwrap().is_none());
    }
}
