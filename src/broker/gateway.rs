//! Broker gateway contract.
//!
//! The gateway is the engine's only view of a broker. Implementations keep a
//! single logged-in session and are not shared between concurrent callers:
//! the engine and the dashboard each own their own instance.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Account, AccountInfo, OrderRequest, OrderTicket, Position, Ticket, VolumeConstraints};

/// Errors surfaced by a broker gateway.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Transport failure talking to the terminal or bridge
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Login refused, expired, or not established for the account
    #[error("Session error: {0}")]
    Session(String),

    /// The broker answered but had no data (unknown symbol, no account info)
    #[error("Data unavailable: {0}")]
    Unavailable(String),

    /// Order or close refused by the trade server
    #[error("Order rejected ({code}): {message}")]
    Rejected { code: i64, message: String },

    /// Response could not be understood
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// Connectivity and session problems are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::Connectivity(_) | BrokerError::Session(_))
    }
}

/// Pull-style broker API the copier is built on.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Authenticate as `account`. Idempotent; safe before every operation.
    async fn login(&self, account: &Account) -> Result<(), BrokerError>;

    async fn account_info(&self, account: &Account) -> Result<AccountInfo, BrokerError>;

    /// Open positions; an empty list when flat.
    async fn open_positions(&self, account: &Account) -> Result<Vec<Position>, BrokerError>;

    async fn submit_order(&self, account: &Account, order: &OrderRequest) -> Result<OrderTicket, BrokerError>;

    /// Volume step and minimum for a symbol on the current session's server.
    async fn volume_constraints(&self, symbol: &str) -> Result<VolumeConstraints, BrokerError>;

    /// Close one position in full with an opposite market deal.
    async fn close_position(&self, account: &Account, ticket: Ticket) -> Result<OrderTicket, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BrokerError::Connectivity("reset".into()).is_retryable());
        assert!(BrokerError::Session("expired".into()).is_retryable());
        assert!(!BrokerError::Unavailable("no info".into()).is_retryable());
        assert!(!BrokerError::Rejected { code: 10018, message: "Market closed".into() }.is_retryable());
    }
}
