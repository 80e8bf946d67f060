//! Broker login identity and the balance figures the engine sizes against.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which side of the replication an account sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountRole {
    Master,
    Slave,
}

impl AccountRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountRole::Master => "master",
            AccountRole::Slave => "slave",
        }
    }
}

/// One broker login. Immutable once loaded from configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct Account {
    /// Broker login number, unique per server
    pub login: u64,

    /// Trading password
    pub password: String,

    /// Broker server name
    pub server: String,

    pub role: AccountRole,
}

impl Account {
    pub fn new(login: u64, password: impl Into<String>, server: impl Into<String>, role: AccountRole) -> Self {
        Self {
            login,
            password: password.into(),
            server: server.into(),
            role,
        }
    }
}

// Credentials stay out of logs.
impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("login", &self.login)
            .field("password", &"***")
            .field("server", &self.server)
            .field("role", &self.role)
            .finish()
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}@{}", self.role.as_str(), self.login, self.server)
    }
}

/// Balance and equity as reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub balance: Decimal,
    pub equity: Decimal,
}
