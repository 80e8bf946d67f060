//! Copier engine: the reconciliation loop.
//!
//! Each cycle:
//! - Executes queued control commands (close-all)
//! - Skips all work while paused
//! - Polls master equity and positions, skipping the cycle on failure
//! - Rolls the risk baseline over on a new day and flattens on a breach
//! - Copies new master tickets to every slave and closes mirrors of
//!   master tickets that disappeared
//!
//! The engine is the only writer of the ledger and of its own state.
//! Everyone else reads the published [`EngineView`].

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerError, BrokerGateway, BrokerSession, CloseAllReport, RetryPolicy};
use crate::db::{Database, RiskEventKind};
use crate::models::{Account, AccountInfo, OrderRequest, Position, Ticket};

use super::control::ControlSurface;
use super::ledger::{Ledger, ReplicationRecord, ReplicationStatus};
use super::lot_scaler::{scale_factor, LotScaler, ScaledVolume, Untradeable};
use super::risk::{RiskBaseline, RiskMonitor};
use super::PolicyConfig;

/// Process run state as shown to operators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunState {
    #[default]
    Running,
    Paused,
    Flattening,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Running => "RUNNING",
            RunState::Paused => "PAUSED",
            RunState::Flattening => "FLATTENING",
        }
    }
}

/// Commands the control surface queues for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
    CloseAll,
}

/// What a single cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Paused,
    /// Master could not be queried; nothing was touched
    Skipped,
    Flattened,
    Reconciled { opened: usize, closed: usize },
}

/// Read-only copy of engine state, published after every cycle.
#[derive(Debug, Clone, Default)]
pub struct EngineView {
    pub run_state: RunState,
    /// `None` until a master equity has been captured
    pub baseline: Option<RiskBaseline>,
    pub master: Option<AccountInfo>,
    pub records: Vec<ReplicationRecord>,
    pub last_poll_ok_at: Option<DateTime<Utc>>,
}

impl EngineView {
    /// True when the master has not been polled successfully within `max_age`.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        match self.last_poll_ok_at {
            None => true,
            Some(at) => now
                .signed_duration_since(at)
                .to_std()
                .map(|age| age > max_age)
                .unwrap_or(false),
        }
    }

    pub fn status_of(&self, ticket: Ticket) -> Option<ReplicationStatus> {
        self.records
            .iter()
            .find(|r| r.master_ticket == ticket)
            .map(|r| r.status)
    }
}

/// State owned exclusively by the engine task.
#[derive(Debug, Default)]
struct EngineState {
    run_state: RunState,
    tracked: BTreeSet<Ticket>,
    last_poll_ok_at: Option<DateTime<Utc>>,
    last_master: Option<AccountInfo>,
    /// Baseline must be re-captured on the next successful poll
    rebaseline_pending: bool,
}

/// Combined outcome of closing every account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlattenReport {
    pub closed: usize,
    pub failed: usize,
    /// Accounts whose position list could not be read
    pub unreachable: Vec<u64>,
}

impl FlattenReport {
    fn absorb(&mut self, login: u64, result: std::result::Result<CloseAllReport, BrokerError>) {
        match result {
            Ok(report) => {
                self.closed += report.closed;
                self.failed += report.failed;
            }
            Err(e) => {
                warn!(account = login, error = %e, "Could not list positions to flatten");
                self.unreachable.push(login);
            }
        }
    }
}

/// Close every position on the master and then on each slave.
pub async fn flatten_accounts<G: BrokerGateway>(
    session: &BrokerSession<G>,
    master: &Account,
    slaves: &[Account],
) -> FlattenReport {
    let mut report = FlattenReport::default();

    report.absorb(master.login, session.close_all(master).await);
    for slave in slaves {
        report.absorb(slave.login, session.close_all(slave).await);
    }

    report
}

fn log_journal<T>(result: Result<T>) {
    if let Err(e) = result {
        warn!(error = %e, "Journal write failed");
    }
}

/// The reconciliation engine.
pub struct CopierEngine<G> {
    policy: PolicyConfig,
    master: Account,
    slaves: Vec<Account>,
    session: BrokerSession<G>,
    scaler: LotScaler,
    risk: RiskMonitor,
    ledger: Ledger,
    state: EngineState,
    journal: Option<Database>,

    // Shared with control surfaces
    paused: Arc<AtomicBool>,
    commands_tx: mpsc::UnboundedSender<EngineCommand>,
    commands: mpsc::UnboundedReceiver<EngineCommand>,
    view: Arc<RwLock<EngineView>>,
    shutdown: Arc<AtomicBool>,
}

impl<G: BrokerGateway> CopierEngine<G> {
    pub fn new(
        policy: PolicyConfig,
        master: Account,
        slaves: Vec<Account>,
        gateway: G,
        journal: Option<Database>,
    ) -> Self {
        let session = BrokerSession::new(gateway, RetryPolicy::from_config(&policy));
        let (commands_tx, commands) = mpsc::unbounded_channel();

        Self {
            scaler: LotScaler::new(policy.min_lot),
            // Placeholder until the first successful master poll
            risk: RiskMonitor::new(policy.drawdown_threshold, NaiveDate::MIN, Decimal::ZERO),
            policy,
            master,
            slaves,
            session,
            ledger: Ledger::new(),
            state: EngineState {
                rebaseline_pending: true,
                ..Default::default()
            },
            journal,
            paused: Arc::new(AtomicBool::new(false)),
            commands_tx,
            commands,
            view: Arc::new(RwLock::new(EngineView::default())),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Control surface over its own broker session.
    ///
    /// `gateway` must be a separate connection from the engine's.
    pub fn control_surface<H: BrokerGateway>(&self, gateway: H) -> ControlSurface<H> {
        ControlSurface::new(
            BrokerSession::new(gateway, RetryPolicy::from_config(&self.policy)),
            self.master.clone(),
            self.slaves.clone(),
            self.paused.clone(),
            self.commands_tx.clone(),
            self.view.clone(),
            self.policy.stale_after(),
        )
    }

    /// Get shutdown signal for external control.
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    #[cfg(test)]
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn baseline(&self) -> Option<RiskBaseline> {
        if self.state.rebaseline_pending {
            None
        } else {
            Some(self.risk.baseline())
        }
    }

    #[cfg(test)]
    pub fn run_state(&self) -> RunState {
        self.state.run_state
    }

    /// Capture the starting baseline and restore journaled mirrors.
    ///
    /// A failed equity read is not fatal: the baseline is captured on the
    /// first successful poll instead.
    pub async fn initialize(&mut self, today: NaiveDate) -> Result<()> {
        info!(
            master = self.master.login,
            slaves = self.slaves.len(),
            "Initializing copier engine"
        );

        if let Some(journal) = &self.journal {
            let mirrors = journal.open_mirrors().await?;
            for mirror in &mirrors {
                self.ledger
                    .restore_mirror(mirror.master_ticket(), mirror.slave_login(), mirror.slave_ticket());
            }
            self.state.tracked = self.ledger.all_tracked();
            if !mirrors.is_empty() {
                info!(
                    mirrors = mirrors.len(),
                    tickets = self.state.tracked.len(),
                    "Restored open mirrors from journal"
                );
            }
        }

        match self.session.account_info(&self.master).await {
            Ok(info) => {
                self.risk.reset(today, info.equity);
                self.state.rebaseline_pending = false;
                self.state.last_master = Some(info);
            }
            Err(e) => {
                warn!(error = %e, "Master equity unavailable at startup, baseline deferred");
            }
        }

        self.publish().await;
        Ok(())
    }

    /// Main run loop.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            poll_interval_ms = self.policy.poll_interval_ms,
            threshold = %self.policy.drawdown_threshold,
            "Starting copier loop"
        );

        let mut ticker = interval(self.policy.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.shutdown.load(Ordering::SeqCst) {
            ticker.tick().await;

            let today = Utc::now().date_naive();
            match self.run_cycle(today).await {
                CycleOutcome::Reconciled { opened, closed } if opened + closed > 0 => {
                    info!(opened, closed, "Cycle reconciled");
                }
                outcome => debug!(?outcome, "Cycle finished"),
            }
        }

        info!("Copier loop stopped");
        Ok(())
    }

    /// One reconciliation pass.
    pub async fn run_cycle(&mut self, today: NaiveDate) -> CycleOutcome {
        let outcome = self.cycle(today).await;
        self.publish().await;
        outcome
    }

    async fn cycle(&mut self, today: NaiveDate) -> CycleOutcome {
        self.drain_commands().await;

        // 1. Paused: idle until resumed
        if self.paused.load(Ordering::SeqCst) {
            self.state.run_state = RunState::Paused;
            return CycleOutcome::Paused;
        }
        self.state.run_state = RunState::Running;

        // 2. Master state
        let master = match self.poll_master().await {
            Some(polled) => polled,
            None => return CycleOutcome::Skipped,
        };
        let (info, positions) = master;

        // 3. Baseline maintenance
        if self.state.rebaseline_pending {
            self.risk.reset(today, info.equity);
            self.state.rebaseline_pending = false;
        } else if self.risk.rollover_if_new_day(today, info.equity) {
            info!(day = %today, equity = %info.equity, "New trading day, baseline reset");
            if let Some(journal) = &self.journal {
                log_journal(
                    journal
                        .record_risk_event(RiskEventKind::DayRollover, info.equity, info.equity, Decimal::ZERO)
                        .await,
                );
            }
        }

        // 4. Circuit-breaker
        if self.risk.should_flatten(info.equity) {
            self.flatten(today, info).await;
            return CycleOutcome::Flattened;
        }

        // 5. Diff and reconcile
        let current: BTreeSet<Ticket> = positions.iter().map(|p| p.ticket).collect();
        for ticket in current.difference(&self.state.tracked) {
            self.ledger.set_status(*ticket, ReplicationStatus::New);
            info!(master_ticket = %ticket, "New master position");
        }

        let opened = self.replicate(&positions, info.balance).await;

        let gone: Vec<Ticket> = self.state.tracked.difference(&current).copied().collect();
        for ticket in &gone {
            self.ledger.set_status(*ticket, ReplicationStatus::Closed);
            info!(master_ticket = %ticket, "Master position closed");
        }
        let closed = self.close_mirrors().await;

        self.state.tracked = current;

        CycleOutcome::Reconciled { opened, closed }
    }

    async fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                EngineCommand::CloseAll => self.close_all().await,
            }
        }
    }

    async fn poll_master(&mut self) -> Option<(AccountInfo, Vec<Position>)> {
        let info = match self.session.account_info(&self.master).await {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "Master account info unavailable, skipping cycle");
                return None;
            }
        };
        let positions = match self.session.open_positions(&self.master).await {
            Ok(positions) => positions,
            Err(e) => {
                warn!(error = %e, "Master positions unavailable, skipping cycle");
                return None;
            }
        };

        self.state.last_poll_ok_at = Some(Utc::now());
        self.state.last_master = Some(info);
        Some((info, positions))
    }

    /// Copy every `New` master position to the slaves that still need it.
    ///
    /// Returns the number of slave orders placed.
    async fn replicate(&mut self, positions: &[Position], master_balance: Decimal) -> usize {
        let pending: Vec<&Position> = positions
            .iter()
            .filter(|p| self.ledger.status(p.ticket) == Some(ReplicationStatus::New))
            .collect();
        if pending.is_empty() {
            return 0;
        }

        // Slave balances are read at most once per cycle
        let mut balances: HashMap<u64, Option<Decimal>> = HashMap::new();
        let mut opened = 0;

        for position in pending {
            for slave in &self.slaves {
                let settled = self
                    .ledger
                    .record(position.ticket)
                    .map(|r| r.is_settled_for(slave.login))
                    .unwrap_or(true);
                if settled {
                    continue;
                }

                if !balances.contains_key(&slave.login) {
                    let balance = match self.session.account_info(slave).await {
                        Ok(info) => Some(info.balance),
                        Err(e) => {
                            warn!(slave = slave.login, error = %e, "Slave account info unavailable");
                            None
                        }
                    };
                    balances.insert(slave.login, balance);
                }
                let Some(slave_balance) = balances.get(&slave.login).copied().flatten() else {
                    continue;
                };

                let Some(factor) = scale_factor(slave_balance, master_balance) else {
                    info!(
                        master_ticket = %position.ticket,
                        slave = slave.login,
                        slave_balance = %slave_balance,
                        master_balance = %master_balance,
                        "Slave balance below master, skipping trade"
                    );
                    self.ledger.mark_skipped(position.ticket, slave.login);
                    continue;
                };

                let constraints = match self.session.volume_constraints(slave, &position.symbol).await {
                    Ok(c) => Some(c),
                    Err(e) => {
                        warn!(symbol = %position.symbol, slave = slave.login, error = %e, "Volume constraints unavailable");
                        None
                    }
                };

                let volume = match self.scaler.scale(constraints.as_ref(), position.volume, factor) {
                    ScaledVolume::Tradeable(volume) => volume,
                    ScaledVolume::Untradeable(Untradeable::NoConstraints) => continue,
                    ScaledVolume::Untradeable(Untradeable::BelowMinimum) => {
                        info!(
                            master_ticket = %position.ticket,
                            slave = slave.login,
                            "Scaled volume below minimum lot, skipping trade"
                        );
                        self.ledger.mark_skipped(position.ticket, slave.login);
                        continue;
                    }
                };

                let order = OrderRequest::mirror_of(
                    position,
                    volume,
                    self.master.login,
                    self.policy.order_deviation,
                    self.policy.order_magic,
                );

                match self.session.submit_order(slave, &order).await {
                    Ok(ticket) => {
                        // Market orders open a position under the order ticket
                        self.ledger.record_slave_order(position.ticket, slave.login, ticket.order);
                        self.ledger.set_status(position.ticket, ReplicationStatus::Copied);
                        opened += 1;

                        info!(
                            master_ticket = %position.ticket,
                            slave = slave.login,
                            slave_ticket = %ticket.order,
                            symbol = %position.symbol,
                            side = position.direction.as_str(),
                            volume = %volume,
                            "Trade copied"
                        );

                        if let Some(journal) = &self.journal {
                            log_journal(
                                journal
                                    .record_mirror(position.ticket, slave.login, ticket.order, &position.symbol, volume)
                                    .await,
                            );
                        }
                    }
                    Err(e) => {
                        warn!(
                            master_ticket = %position.ticket,
                            slave = slave.login,
                            error = %e,
                            "Copy failed"
                        );
                        if let Some(journal) = &self.journal {
                            log_journal(
                                journal
                                    .record_failure(position.ticket, slave.login, &position.symbol, &e.to_string())
                                    .await,
                            );
                        }
                    }
                }
            }
        }

        opened
    }

    /// Close slave mirrors of every `Closed` master ticket.
    ///
    /// A mirror stays in the ledger until it is gone from the slave, so a
    /// failed close is attempted again next cycle.
    async fn close_mirrors(&mut self) -> usize {
        let tickets = self.ledger.closed_with_mirrors();
        let mut live: HashMap<u64, Option<BTreeSet<Ticket>>> = HashMap::new();
        let mut closed = 0;

        for ticket in tickets {
            let mirrors: Vec<(u64, Ticket)> = self
                .ledger
                .record(ticket)
                .map(|r| r.mirrors.iter().map(|(login, t)| (*login, *t)).collect())
                .unwrap_or_default();

            for (login, slave_ticket) in mirrors {
                let Some(slave) = self.slaves.iter().find(|s| s.login == login) else {
                    // Slave no longer configured
                    self.ledger.remove_slave_order(ticket, login);
                    if let Some(journal) = &self.journal {
                        log_journal(journal.mark_mirror_closed(ticket, login).await);
                    }
                    continue;
                };

                if !live.contains_key(&login) {
                    let open = match self.session.open_positions(slave).await {
                        Ok(positions) => Some(positions.iter().map(|p| p.ticket).collect()),
                        Err(e) => {
                            warn!(slave = login, error = %e, "Slave positions unavailable, close deferred");
                            None
                        }
                    };
                    live.insert(login, open);
                }

                let still_open = match live.get(&login) {
                    Some(Some(open)) => open.contains(&slave_ticket),
                    _ => continue,
                };

                if still_open {
                    if let Err(e) = self.session.close_position(slave, slave_ticket).await {
                        warn!(
                            master_ticket = %ticket,
                            slave = login,
                            slave_ticket = %slave_ticket,
                            error = %e,
                            "Mirror close failed, will retry"
                        );
                        continue;
                    }
                    closed += 1;
                    info!(master_ticket = %ticket, slave = login, slave_ticket = %slave_ticket, "Mirror closed");
                } else {
                    debug!(master_ticket = %ticket, slave = login, slave_ticket = %slave_ticket, "Mirror already gone");
                }

                self.ledger.remove_slave_order(ticket, login);
                if let Some(journal) = &self.journal {
                    log_journal(journal.mark_mirror_closed(ticket, login).await);
                }
            }
        }

        for ticket in self.ledger.settled_closed() {
            self.ledger.forget(ticket);
        }

        closed
    }

    /// Drawdown breach: close everything, cool down, re-baseline.
    async fn flatten(&mut self, today: NaiveDate, info: AccountInfo) {
        let baseline = self.risk.baseline().equity;
        let drawdown = self.risk.drawdown(info.equity);
        warn!(
            equity = %info.equity,
            baseline = %baseline,
            drawdown = %drawdown,
            threshold = %self.risk.threshold(),
            "Daily drawdown limit breached, flattening all accounts"
        );

        self.state.run_state = RunState::Flattening;
        self.publish().await;

        self.close_everything().await;
        if let Some(journal) = &self.journal {
            log_journal(
                journal
                    .record_risk_event(RiskEventKind::DrawdownFlatten, info.equity, baseline, drawdown)
                    .await,
            );
        }

        tokio::time::sleep(self.policy.flatten_cooldown()).await;

        match self.session.account_info(&self.master).await {
            Ok(after) => {
                self.risk.reset(today, after.equity);
                self.state.last_master = Some(after);
            }
            Err(e) => {
                error!(error = %e, "Post-flatten equity unavailable, baseline reset deferred");
                self.state.rebaseline_pending = true;
            }
        }

        self.state.run_state = RunState::Running;
    }

    /// Operator close-all. Does not touch the baseline.
    async fn close_all(&mut self) {
        info!("Close-all requested");
        let previous = self.state.run_state;
        self.state.run_state = RunState::Flattening;
        self.publish().await;

        self.close_everything().await;
        if let Some(journal) = &self.journal {
            let equity = self.state.last_master.map(|m| m.equity).unwrap_or_default();
            let baseline = self.risk.baseline().equity;
            log_journal(
                journal
                    .record_risk_event(RiskEventKind::ManualCloseAll, equity, baseline, self.risk.drawdown(equity))
                    .await,
            );
        }

        self.state.run_state = previous;
    }

    async fn close_everything(&mut self) {
        let report = flatten_accounts(&self.session, &self.master, &self.slaves).await;
        let cleared = self.ledger.clear_slave_orders();

        info!(
            closed = report.closed,
            failed = report.failed,
            unreachable = report.unreachable.len(),
            mirrors_cleared = cleared,
            "Accounts flattened"
        );

        if let Some(journal) = &self.journal {
            log_journal(journal.mark_all_flattened().await);
        }
    }

    async fn publish(&self) {
        let view = EngineView {
            run_state: self.state.run_state,
            baseline: self.baseline(),
            master: self.state.last_master,
            records: self.ledger.snapshot(),
            last_poll_ok_at: self.state.last_poll_ok_at,
        };
        *self.view.write().await = view;
    }
}
