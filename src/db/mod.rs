//! Replication journal.
//!
//! Stores enough to resume after a restart:
//! - Every slave-side replication outcome (mirrored or failed)
//! - Which mirrors are still open
//! - Risk events (drawdown flattens, manual close-alls, day rollovers)

use anyhow::{Context, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::Ticket;

pub const DEFAULT_JOURNAL_URL: &str = "sqlite:./replicator.db?mode=rwc";

/// Journal connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Open mirror as stored in the journal.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredMirror {
    pub master_ticket: i64,
    pub slave_login: i64,
    pub slave_ticket: i64,
    pub symbol: String,
    pub volume: f64,
    pub created_at: String,
}

impl StoredMirror {
    pub fn master_ticket(&self) -> Ticket {
        Ticket(self.master_ticket as u64)
    }

    pub fn slave_ticket(&self) -> Ticket {
        Ticket(self.slave_ticket as u64)
    }

    pub fn slave_login(&self) -> u64 {
        self.slave_login as u64
    }
}

/// Stored risk event.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RiskEvent {
    pub id: i64,
    pub kind: String,
    pub equity: f64,
    pub baseline: f64,
    pub drawdown: f64,
    pub occurred_at: String,
}

/// Replication counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationStats {
    pub total: i64,
    pub open: i64,
    pub closed: i64,
    pub flattened: i64,
    pub failed: i64,
}

/// Kinds of risk events written to the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskEventKind {
    DrawdownFlatten,
    ManualCloseAll,
    DayRollover,
}

impl RiskEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskEventKind::DrawdownFlatten => "drawdown_flatten",
            RiskEventKind::ManualCloseAll => "manual_close_all",
            RiskEventKind::DayRollover => "day_rollover",
        }
    }
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

impl Database {
    /// Open (or create) the journal.
    pub async fn new(database_url: &str) -> Result<Self> {
        // Every connection to `:memory:` is its own database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to journal database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replications (
                id TEXT PRIMARY KEY,
                master_ticket INTEGER NOT NULL,
                slave_login INTEGER NOT NULL,
                slave_ticket INTEGER,
                symbol TEXT NOT NULL,
                volume REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                error_message TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                closed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS risk_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                equity REAL NOT NULL,
                baseline REAL NOT NULL,
                drawdown REAL NOT NULL,
                occurred_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_replications_status ON replications(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_replications_master ON replications(master_ticket)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Replications ====================

    /// Record a mirror opened on a slave.
    pub async fn record_mirror(
        &self,
        master_ticket: Ticket,
        slave_login: u64,
        slave_ticket: Ticket,
        symbol: &str,
        volume: Decimal,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO replications (id, master_ticket, slave_login, slave_ticket, symbol, volume, status)
            VALUES (?, ?, ?, ?, ?, ?, 'open')
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(master_ticket.0 as i64)
        .bind(slave_login as i64)
        .bind(slave_ticket.0 as i64)
        .bind(symbol)
        .bind(to_f64(volume))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record a replication attempt that failed after retries.
    pub async fn record_failure(&self, master_ticket: Ticket, slave_login: u64, symbol: &str, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO replications (id, master_ticket, slave_login, symbol, status, error_message)
            VALUES (?, ?, ?, ?, 'failed', ?)
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(master_ticket.0 as i64)
        .bind(slave_login as i64)
        .bind(symbol)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark one slave's mirror of `master_ticket` closed.
    pub async fn mark_mirror_closed(&self, master_ticket: Ticket, slave_login: u64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE replications SET status = 'closed', closed_at = datetime('now')
            WHERE master_ticket = ? AND slave_login = ? AND status = 'open'
            "#,
        )
        .bind(master_ticket.0 as i64)
        .bind(slave_login as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark every open mirror as flattened. Returns the number of rows touched.
    pub async fn mark_all_flattened(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE replications SET status = 'flattened', closed_at = datetime('now') WHERE status = 'open'",
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// All mirrors still open, oldest first.
    pub async fn open_mirrors(&self) -> Result<Vec<StoredMirror>> {
        sqlx::query_as::<_, StoredMirror>(
            r#"
            SELECT master_ticket, slave_login, slave_ticket, symbol, volume, created_at
            FROM replications
            WHERE status = 'open' AND slave_ticket IS NOT NULL
            ORDER BY created_at, master_ticket
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch open mirrors")
    }

    /// Replication counts by status.
    pub async fn replication_stats(&self) -> Result<ReplicationStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM replications GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = ReplicationStats::default();
        for (status, count) in rows {
            match status.as_str() {
                "open" => stats.open = count,
                "closed" => stats.closed = count,
                "flattened" => stats.flattened = count,
                "failed" => stats.failed = count,
                _ => {}
            }
            stats.total += count;
        }

        Ok(stats)
    }

    // ==================== Risk events ====================

    pub async fn record_risk_event(
        &self,
        kind: RiskEventKind,
        equity: Decimal,
        baseline: Decimal,
        drawdown: Decimal,
    ) -> Result<()> {
        sqlx::query("INSERT INTO risk_events (kind, equity, baseline, drawdown) VALUES (?, ?, ?, ?)")
            .bind(kind.as_str())
            .bind(to_f64(equity))
            .bind(to_f64(baseline))
            .bind(to_f64(drawdown))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Most recent risk events, newest first.
    pub async fn recent_risk_events(&self, limit: i64) -> Result<Vec<RiskEvent>> {
        sqlx::query_as::<_, RiskEvent>("SELECT * FROM risk_events ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch risk events")
    }
}
