//! Control surface: operator commands and dashboard snapshots.
//!
//! Commands never touch engine state directly. Pause is a shared flag the
//! engine observes at the top of its next cycle; close-all is queued to the
//! engine. Snapshots combine the engine's published view with live reads made
//! over this surface's own broker session.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use crate::broker::{BrokerError, BrokerGateway, BrokerSession};
use crate::models::{Account, AccountInfo, Position, Ticket};

use super::engine::{EngineCommand, EngineView, RunState};
use super::ledger::ReplicationStatus;
use super::risk::drawdown;

/// How a position relates to replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    New,
    Copied,
    Closed,
    /// Slave position with no master counterpart
    Manual,
}

impl From<ReplicationStatus> for PositionStatus {
    fn from(status: ReplicationStatus) -> Self {
        match status {
            ReplicationStatus::New => PositionStatus::New,
            ReplicationStatus::Copied => PositionStatus::Copied,
            ReplicationStatus::Closed => PositionStatus::Closed,
        }
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PositionStatus::New => "New",
            PositionStatus::Copied => "Copied",
            PositionStatus::Closed => "Closed",
            PositionStatus::Manual => "Manual",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionRow {
    pub position: Position,
    pub status: PositionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveStatus {
    Ok,
    Unreachable,
}

impl fmt::Display for SlaveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlaveStatus::Ok => f.write_str("OK"),
            SlaveStatus::Unreachable => f.write_str("Unreachable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MasterSummary {
    pub login: u64,
    pub balance: Decimal,
    pub equity: Decimal,
    /// Drawdown in percent (negative while in profit)
    pub drawdown_pct: Decimal,
    pub positions: Vec<PositionRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlaveSummary {
    pub login: u64,
    pub balance: Option<Decimal>,
    pub open_count: usize,
    pub total_profit: Decimal,
    pub status: SlaveStatus,
}

/// Everything the dashboard shows in one refresh.
#[derive(Debug, Clone)]
pub struct DashboardSnapshot {
    pub taken_at: DateTime<Utc>,
    /// `None` when the master could not be read this refresh
    pub master: Option<MasterSummary>,
    /// Master figures from the engine's last successful poll
    pub engine_master: Option<AccountInfo>,
    pub slaves: Vec<SlaveSummary>,
    pub run_state: RunState,
    pub paused: bool,
    pub last_poll_ok_at: Option<DateTime<Utc>>,
    /// Engine has not reached the master recently
    pub engine_stale: bool,
}

/// Operator-facing handle on a running engine.
pub struct ControlSurface<G> {
    session: BrokerSession<G>,
    master: Account,
    slaves: Vec<Account>,
    paused: Arc<AtomicBool>,
    commands: mpsc::UnboundedSender<EngineCommand>,
    view: Arc<RwLock<EngineView>>,
    stale_after: Duration,
}

impl<G: BrokerGateway> ControlSurface<G> {
    pub(crate) fn new(
        session: BrokerSession<G>,
        master: Account,
        slaves: Vec<Account>,
        paused: Arc<AtomicBool>,
        commands: mpsc::UnboundedSender<EngineCommand>,
        view: Arc<RwLock<EngineView>>,
        stale_after: Duration,
    ) -> Self {
        Self {
            session,
            master,
            slaves,
            paused,
            commands,
            view,
            stale_after,
        }
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("Copier paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("Copier resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Queue a close of every master and slave position.
    ///
    /// Runs at the start of the engine's next cycle, paused or not.
    pub fn close_all(&self) -> Result<()> {
        self.commands
            .send(EngineCommand::CloseAll)
            .context("Copier engine is not running")
    }

    /// Copy of the engine's last published view.
    pub async fn engine_view(&self) -> EngineView {
        self.view.read().await.clone()
    }

    pub async fn snapshot(&self) -> DashboardSnapshot {
        let view = self.engine_view().await;
        let now = Utc::now();

        let master = match self.master_summary(&view).await {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(error = %e, "Master unavailable for dashboard");
                None
            }
        };

        let mut slaves = Vec::with_capacity(self.slaves.len());
        for slave in &self.slaves {
            slaves.push(self.slave_summary(slave).await);
        }

        DashboardSnapshot {
            taken_at: now,
            master,
            engine_master: view.master,
            slaves,
            run_state: view.run_state,
            paused: self.is_paused(),
            last_poll_ok_at: view.last_poll_ok_at,
            engine_stale: view.is_stale(now, self.stale_after),
        }
    }

    /// Live positions of one slave, tagged by what they mirror.
    pub async fn slave_positions(&self, login: u64) -> Result<Vec<PositionRow>> {
        let slave = self
            .slaves
            .iter()
            .find(|s| s.login == login)
            .ok_or_else(|| anyhow!("No slave with login {} is configured", login))?;

        let view = self.engine_view().await;
        let mirrored: HashMap<Ticket, ReplicationStatus> = view
            .records
            .iter()
            .filter_map(|r| r.mirrors.get(&login).map(|t| (*t, r.status)))
            .collect();

        let positions = self
            .session
            .open_positions(slave)
            .await
            .with_context(|| format!("Failed to read positions of slave {}", login))?;
        Ok(positions
            .into_iter()
            .map(|position| {
                let status = mirrored
                    .get(&position.ticket)
                    .map(|s| PositionStatus::from(*s))
                    .unwrap_or(PositionStatus::Manual);
                PositionRow { position, status }
            })
            .collect())
    }

    async fn master_summary(&self, view: &EngineView) -> Result<MasterSummary, BrokerError> {
        let info = self.session.account_info(&self.master).await?;
        let positions = self.session.open_positions(&self.master).await?;

        // Against the day's baseline once the engine has one
        let reference = view
            .baseline
            .map(|b| b.equity)
            .filter(|e| *e > Decimal::ZERO)
            .unwrap_or(info.balance);

        let rows = positions
            .into_iter()
            .map(|position| {
                let status = view
                    .status_of(position.ticket)
                    .map(PositionStatus::from)
                    .unwrap_or(PositionStatus::New);
                PositionRow { position, status }
            })
            .collect();

        Ok(MasterSummary {
            login: self.master.login,
            balance: info.balance,
            equity: info.equity,
            drawdown_pct: (drawdown(info.equity, reference) * Decimal::ONE_HUNDRED).round_dp(2),
            positions: rows,
        })
    }

    async fn slave_summary(&self, slave: &Account) -> SlaveSummary {
        let info = self.session.account_info(slave).await;
        let positions = self.session.open_positions(slave).await;

        match (info, positions) {
            (Ok(info), Ok(positions)) => SlaveSummary {
                login: slave.login,
                balance: Some(info.balance),
                open_count: positions.len(),
                total_profit: Position::total_profit(&positions),
                status: SlaveStatus::Ok,
            },
            (info, _) => SlaveSummary {
                login: slave.login,
                balance: info.ok().map(|i| i.balance),
                open_count: 0,
                total_profit: Decimal::ZERO,
                status: SlaveStatus::Unreachable,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperGateway;
    use crate::models::{AccountRole, Direction};
    use crate::trading::{CopierEngine, PolicyConfig};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    async fn setup() -> (PaperGateway, CopierEngine<PaperGateway>, ControlSurface<PaperGateway>) {
        let gateway = PaperGateway::new();
        gateway.add_account(5001, dec!(10000));
        gateway.add_account(6001, dec!(20000));
        gateway.add_account(6002, dec!(40000));
        gateway.add_symbol("EURUSD", dec!(0.01), dec!(0.01));

        let policy = PolicyConfig {
            retry_delay_ms: 0,
            flatten_cooldown_ms: 0,
            ..Default::default()
        };
        let master = Account::new(5001, "pw", "Demo", AccountRole::Master);
        let slaves = vec![
            Account::new(6001, "pw", "Demo", AccountRole::Slave),
            Account::new(6002, "pw", "Demo", AccountRole::Slave),
        ];

        let mut engine = CopierEngine::new(policy, master, slaves, gateway.clone(), None);
        engine.initialize(day()).await.unwrap();
        let control = engine.control_surface(gateway.clone());
        (gateway, engine, control)
    }

    #[tokio::test]
    async fn test_snapshot_reports_accounts_and_statuses() {
        let (gateway, mut engine, control) = setup().await;
        let copied = gateway.open(5001, "EURUSD", Direction::Long, dec!(0.5));
        engine.run_cycle(day()).await;
        // Opened after the last cycle: not seen by the engine yet
        let fresh = gateway.open(5001, "EURUSD", Direction::Short, dec!(0.2));
        gateway.set_equity(5001, dec!(9800));

        let snapshot = control.snapshot().await;

        let master = snapshot.master.unwrap();
        assert_eq!(master.equity, dec!(9800));
        assert_eq!(master.drawdown_pct, dec!(2.00));
        let status = |t: Ticket| master.positions.iter().find(|r| r.position.ticket == t).unwrap().status;
        assert_eq!(status(copied), PositionStatus::Copied);
        assert_eq!(status(fresh), PositionStatus::New);

        assert_eq!(snapshot.slaves.len(), 2);
        assert_eq!(snapshot.slaves[0].open_count, 1);
        assert_eq!(snapshot.slaves[1].balance, Some(dec!(40000)));
        assert!(snapshot.slaves.iter().all(|s| s.status == SlaveStatus::Ok));
        assert_eq!(snapshot.run_state, RunState::Running);
        assert!(!snapshot.engine_stale);
    }

    #[tokio::test]
    async fn test_unreachable_slave_flagged() {
        let (gateway, _engine, control) = setup().await;
        gateway.set_offline(6002, true);

        let snapshot = control.snapshot().await;

        assert_eq!(snapshot.slaves[0].status, SlaveStatus::Ok);
        assert_eq!(snapshot.slaves[1].status, SlaveStatus::Unreachable);
        assert_eq!(snapshot.slaves[1].balance, None);
    }

    #[tokio::test]
    async fn test_stale_engine_distinguished_from_flat() {
        let (gateway, _engine, control) = setup().await;

        // Master is reachable and flat, but the engine has never polled it
        let snapshot = control.snapshot().await;
        assert!(snapshot.master.unwrap().positions.is_empty());
        assert!(snapshot.engine_stale);

        gateway.set_offline(5001, true);
        let snapshot = control.snapshot().await;
        assert!(snapshot.master.is_none());
        // Figures captured by the engine at startup are still shown
        assert_eq!(snapshot.engine_master.map(|m| m.equity), Some(dec!(10000)));
    }

    #[tokio::test]
    async fn test_slave_positions_tagged_mirror_or_manual() {
        let (gateway, mut engine, control) = setup().await;
        gateway.open(5001, "EURUSD", Direction::Long, dec!(1));
        let manual = gateway.open(6001, "EURUSD", Direction::Short, dec!(0.3));
        engine.run_cycle(day()).await;

        let rows = control.slave_positions(6001).await.unwrap();
        assert_eq!(rows.len(), 2);
        for row in &rows {
            if row.position.ticket == manual {
                assert_eq!(row.status, PositionStatus::Manual);
            } else {
                assert_eq!(row.status, PositionStatus::Copied);
                assert_eq!(row.position.volume, dec!(2.00));
            }
        }

        let err = control.slave_positions(9999).await.unwrap_err();
        assert!(err.to_string().contains("No slave with login 9999"));
        assert!(err.downcast_ref::<BrokerError>().is_none());

        gateway.set_offline(6001, true);
        let err = control.slave_positions(6001).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<BrokerError>(), Some(BrokerError::Connectivity(_))));
    }

    #[tokio::test]
    async fn test_pause_is_idempotent() {
        let (_gateway, mut engine, control) = setup().await;

        control.resume();
        assert!(!control.is_paused());

        control.pause();
        control.pause();
        assert!(control.is_paused());
        engine.run_cycle(day()).await;
        assert_eq!(control.engine_view().await.run_state, RunState::Paused);
    }
}
