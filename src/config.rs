//! Account configuration file: loading, template bootstrap, env overrides.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::models::{Account, AccountRole};
use crate::trading::PolicyConfig;

pub const DEFAULT_CONFIG_FILE: &str = "accounts.json";
pub const DEFAULT_BRIDGE_URL: &str = "http://127.0.0.1:8228";

/// Credentials for one login as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountConfig {
    pub login: u64,
    pub password: String,
    pub server: String,
}

impl AccountConfig {
    fn to_account(&self, role: AccountRole) -> Account {
        Account::new(self.login, self.password.clone(), self.server.clone(), role)
    }
}

/// Full application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub master: AccountConfig,

    /// Slaves in the order they are served each cycle
    #[serde(default)]
    pub slaves: Vec<AccountConfig>,

    /// Base URL of the trading terminal bridge
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,

    #[serde(default)]
    pub policy: PolicyConfig,
}

fn default_bridge_url() -> String {
    DEFAULT_BRIDGE_URL.to_string()
}

impl AppConfig {
    /// Placeholder configuration written on first run.
    pub fn template() -> Self {
        Self {
            master: AccountConfig {
                login: 0,
                password: "password".to_string(),
                server: "server".to_string(),
            },
            slaves: Vec::new(),
            bridge_url: default_bridge_url(),
            policy: PolicyConfig::default(),
        }
    }

    /// Load configuration from a JSON file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: AppConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Write the template unless a file already exists (or `force`).
    ///
    /// Returns `true` when a file was written.
    pub fn write_template(path: &Path, force: bool) -> Result<bool> {
        if path.exists() && !force {
            return Ok(false);
        }
        let body = serde_json::to_string_pretty(&Self::template())?;
        std::fs::write(path, body)
            .with_context(|| format!("Failed to write config template {}", path.display()))?;
        info!(path = %path.display(), "Config template written");
        Ok(true)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("REPLICATOR_BRIDGE_URL") {
            if !url.trim().is_empty() {
                self.bridge_url = url.trim().to_string();
            }
        }
        self.policy.apply_env();
    }

    fn validate(&self) -> Result<()> {
        if self.master.login == 0 {
            anyhow::bail!("Master login is not set; fill in the configuration file");
        }
        if self.slaves.iter().any(|s| s.login == self.master.login) {
            anyhow::bail!("Master login {} is also listed as a slave", self.master.login);
        }
        if self.policy.drawdown_threshold <= rust_decimal::Decimal::ZERO {
            anyhow::bail!("drawdown_threshold must be positive");
        }
        Ok(())
    }

    pub fn master_account(&self) -> Account {
        self.master.to_account(AccountRole::Master)
    }

    pub fn slave_accounts(&self) -> Vec<Account> {
        self.slaves.iter().map(|s| s.to_account(AccountRole::Slave)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("replicator-{}-{}.json", name, uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_template_written_once() {
        let path = temp_path("template");

        assert!(AppConfig::write_template(&path, false).unwrap());
        assert!(!AppConfig::write_template(&path, false).unwrap());

        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: AppConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, AppConfig::template());

        // Template master login is 0, which is refused at load time
        assert!(AppConfig::load(&path).is_err());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_load_minimal_file() {
        let path = temp_path("minimal");
        std::fs::write(
            &path,
            r#"{
                "master": {"login": 5001, "password": "m", "server": "Demo"},
                "slaves": [
                    {"login": 6001, "password": "a", "server": "Demo"},
                    {"login": 6002, "password": "b", "server": "Live"}
                ]
            }"#,
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.bridge_url, DEFAULT_BRIDGE_URL);
        assert_eq!(config.policy.min_lot, dec!(0.01));
        assert_eq!(config.master_account().role, AccountRole::Master);

        let slaves = config.slave_accounts();
        assert_eq!(slaves.len(), 2);
        assert_eq!(slaves[1].login, 6002);
        assert_eq!(slaves[1].role, AccountRole::Slave);
    }

    #[test]
    fn test_master_listed_as_slave_rejected() {
        let mut config = AppConfig::template();
        config.master.login = 5001;
        config.slaves.push(config.master.clone());

        assert!(config.validate().is_err());
    }
}
