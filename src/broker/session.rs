//! Retrying broker session.
//!
//! Every operation re-authenticates before it runs and the pair is retried
//! on a fixed schedule. Queries only retry connectivity and session failures;
//! order submissions and closes retry every failure, since the broker's
//! result codes are not classified.

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use tracing::{debug, warn};

use crate::models::{Account, AccountInfo, OrderRequest, OrderTicket, Position, Ticket, VolumeConstraints};
use crate::trading::PolicyConfig;

use super::{BrokerError, BrokerGateway};

/// Bounded attempts with a fixed delay between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    pub fn from_config(policy: &PolicyConfig) -> Self {
        Self::new(policy.retry_attempts, policy.retry_delay())
    }

    fn schedule(&self) -> FixedSchedule {
        let retries = self.attempts.saturating_sub(1);
        FixedSchedule {
            delay: self.delay,
            retries,
            remaining: retries,
        }
    }
}

/// `Backoff` that yields the same delay a fixed number of times.
struct FixedSchedule {
    delay: Duration,
    retries: u32,
    remaining: u32,
}

impl Backoff for FixedSchedule {
    fn reset(&mut self) {
        self.remaining = self.retries;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.delay)
    }
}

#[derive(Debug, Clone, Copy)]
enum RetryOn {
    Retryable,
    Always,
}

impl RetryOn {
    fn covers(self, err: &BrokerError) -> bool {
        match self {
            RetryOn::Retryable => err.is_retryable(),
            RetryOn::Always => true,
        }
    }
}

/// Outcome of closing every position on one account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseAllReport {
    pub closed: usize,
    pub failed: usize,
}

/// A gateway plus the retry policy applied to each of its operations.
pub struct BrokerSession<G> {
    gateway: G,
    policy: RetryPolicy,
}

impl<G: BrokerGateway> BrokerSession<G> {
    pub fn new(gateway: G, policy: RetryPolicy) -> Self {
        Self { gateway, policy }
    }

    pub async fn account_info(&self, account: &Account) -> Result<AccountInfo, BrokerError> {
        let gateway = &self.gateway;
        self.retry("account_info", account, RetryOn::Retryable, move || async move {
            gateway.login(account).await?;
            gateway.account_info(account).await
        })
        .await
    }

    pub async fn open_positions(&self, account: &Account) -> Result<Vec<Position>, BrokerError> {
        let gateway = &self.gateway;
        self.retry("open_positions", account, RetryOn::Retryable, move || async move {
            gateway.login(account).await?;
            gateway.open_positions(account).await
        })
        .await
    }

    /// Volume rules for `symbol` as seen from `account`'s server.
    pub async fn volume_constraints(&self, account: &Account, symbol: &str) -> Result<VolumeConstraints, BrokerError> {
        let gateway = &self.gateway;
        self.retry("volume_constraints", account, RetryOn::Retryable, move || async move {
            gateway.login(account).await?;
            gateway.volume_constraints(symbol).await
        })
        .await
    }

    pub async fn submit_order(&self, account: &Account, order: &OrderRequest) -> Result<OrderTicket, BrokerError> {
        let gateway = &self.gateway;
        self.retry("submit_order", account, RetryOn::Always, move || async move {
            gateway.login(account).await?;
            gateway.submit_order(account, order).await
        })
        .await
    }

    pub async fn close_position(&self, account: &Account, ticket: Ticket) -> Result<OrderTicket, BrokerError> {
        let gateway = &self.gateway;
        self.retry("close_position", account, RetryOn::Always, move || async move {
            gateway.login(account).await?;
            gateway.close_position(account, ticket).await
        })
        .await
    }

    /// Close every open position on `account`, each with its own retries.
    ///
    /// Fails only if the position list itself cannot be read.
    pub async fn close_all(&self, account: &Account) -> Result<CloseAllReport, BrokerError> {
        let positions = self.open_positions(account).await?;
        let mut report = CloseAllReport::default();

        for position in positions {
            match self.close_position(account, position.ticket).await {
                Ok(_) => report.closed += 1,
                Err(e) => {
                    warn!(
                        account = account.login,
                        ticket = %position.ticket,
                        error = %e,
                        "Failed to close position"
                    );
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    async fn retry<T, F, Fut>(
        &self,
        op_name: &'static str,
        account: &Account,
        retry_on: RetryOn,
        mut op: F,
    ) -> Result<T, BrokerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let login = account.login;
        debug!(op = op_name, account = login, "Broker call");

        backoff::future::retry_notify(
            self.policy.schedule(),
            move || {
                let attempt = op();
                async move {
                    attempt.await.map_err(|e| {
                        if retry_on.covers(&e) {
                            backoff::Error::transient(e)
                        } else {
                            backoff::Error::permanent(e)
                        }
                    })
                }
            },
            move |err: BrokerError, wait: Duration| {
                warn!(
                    op = op_name,
                    account = login,
                    error = %err,
                    retry_in_ms = wait.as_millis() as u64,
                    "Broker call failed, retrying"
                );
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperGateway;
    use crate::models::{AccountRole, Direction};
    use rust_decimal_macros::dec;

    fn session(gateway: &PaperGateway) -> BrokerSession<PaperGateway> {
        BrokerSession::new(gateway.clone(), RetryPolicy::new(3, Duration::ZERO))
    }

    fn slave() -> Account {
        Account::new(6001, "pw", "Demo", AccountRole::Slave)
    }

    #[test]
    fn test_schedule_is_bounded() {
        let mut schedule = RetryPolicy::new(3, Duration::from_secs(5)).schedule();

        assert_eq!(schedule.next_backoff(), Some(Duration::from_secs(5)));
        assert_eq!(schedule.next_backoff(), Some(Duration::from_secs(5)));
        assert_eq!(schedule.next_backoff(), None);

        schedule.reset();
        assert!(schedule.next_backoff().is_some());

        // Zero attempts still means one try and no retries
        let mut single = RetryPolicy::new(0, Duration::ZERO).schedule();
        assert_eq!(single.next_backoff(), None);
    }

    #[tokio::test]
    async fn test_login_failures_within_bound_recover() {
        let gateway = PaperGateway::new();
        gateway.add_account(6001, dec!(5000));
        gateway.fail_logins(6001, 2);

        let info = session(&gateway).account_info(&slave()).await.unwrap();
        assert_eq!(info.balance, dec!(5000));
    }

    #[tokio::test]
    async fn test_login_failures_beyond_bound_give_up() {
        let gateway = PaperGateway::new();
        gateway.add_account(6001, dec!(5000));
        gateway.fail_logins(6001, 3);

        let err = session(&gateway).account_info(&slave()).await.unwrap_err();
        assert!(matches!(err, BrokerError::Session(_)));
    }

    #[tokio::test]
    async fn test_unavailable_data_not_retried() {
        let gateway = PaperGateway::new();
        gateway.add_account(6001, dec!(5000));

        let err = session(&gateway)
            .volume_constraints(&slave(), "UNKNOWN")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_rejections_retried_to_the_bound() {
        let gateway = PaperGateway::new();
        gateway.add_account(6001, dec!(5000));
        gateway.reject_orders(6001, 10);

        let master = crate::models::Position::new(Ticket(1), "EURUSD", Direction::Long, dec!(1), dec!(1.1));
        let order = OrderRequest::mirror_of(&master, dec!(1), 5001, 20, 12345);

        let err = session(&gateway).submit_order(&slave(), &order).await.unwrap_err();
        assert!(matches!(err, BrokerError::Rejected { .. }));
        assert_eq!(gateway.order_attempts(6001), 3);
        assert!(gateway.positions(6001).is_empty());
    }

    #[tokio::test]
    async fn test_close_all_counts_failures() {
        let gateway = PaperGateway::new();
        gateway.add_account(6001, dec!(5000));
        gateway.open(6001, "EURUSD", Direction::Long, dec!(1));
        gateway.open(6001, "GBPUSD", Direction::Short, dec!(2));
        gateway.reject_closes(6001, 3);

        let report = session(&gateway).close_all(&slave()).await.unwrap();

        assert_eq!(report, CloseAllReport { closed: 1, failed: 1 });
        assert_eq!(gateway.positions(6001).len(), 1);
    }
}
