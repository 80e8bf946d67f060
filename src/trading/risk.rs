//! Daily drawdown circuit-breaker.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use tracing::info;

/// Master equity captured at the start of a trading day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskBaseline {
    pub day: NaiveDate,
    pub equity: Decimal,
}

/// Tracks the active baseline and decides when to flatten.
#[derive(Debug, Clone)]
pub struct RiskMonitor {
    threshold: Decimal,
    baseline: RiskBaseline,
}

impl RiskMonitor {
    pub fn new(threshold: Decimal, day: NaiveDate, equity: Decimal) -> Self {
        Self {
            threshold,
            baseline: RiskBaseline { day, equity },
        }
    }

    pub fn baseline(&self) -> RiskBaseline {
        self.baseline
    }

    pub fn threshold(&self) -> Decimal {
        self.threshold
    }

    /// Fractional drawdown of `equity` from the baseline.
    ///
    /// Zero when no baseline equity is known yet.
    pub fn drawdown(&self, equity: Decimal) -> Decimal {
        drawdown(equity, self.baseline.equity)
    }

    pub fn should_flatten(&self, equity: Decimal) -> bool {
        self.drawdown(equity) >= self.threshold
    }

    /// Replace the baseline, e.g. right after a flatten.
    pub fn reset(&mut self, day: NaiveDate, equity: Decimal) {
        info!(
            day = %day,
            previous = %self.baseline.equity,
            equity = %equity,
            "Risk baseline reset"
        );
        self.baseline = RiskBaseline { day, equity };
    }

    /// Reset to `equity` if `today` differs from the baseline's day.
    pub fn rollover_if_new_day(&mut self, today: NaiveDate, equity: Decimal) -> bool {
        if self.baseline.day == today {
            return false;
        }
        self.reset(today, equity);
        true
    }
}

/// `1 - equity / baseline`, defined as zero for a non-positive baseline.
pub fn drawdown(equity: Decimal, baseline: Decimal) -> Decimal {
    if baseline <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    Decimal::ONE - equity / baseline
}
