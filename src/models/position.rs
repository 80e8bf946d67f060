//! Position model: a live trade on an account as the broker reports it.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Broker-assigned position/order identifier, unique within one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ticket(pub u64);

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "buy")]
    Long,
    #[serde(rename = "sell")]
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "BUY",
            Direction::Short => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "buy" | "long" => Some(Direction::Long),
            "sell" | "short" => Some(Direction::Short),
            _ => None,
        }
    }
}

/// Snapshot of one open position. Only ever held for the duration of a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticket: Ticket,

    pub symbol: String,

    pub direction: Direction,

    /// Size in lots
    pub volume: Decimal,

    pub open_price: Decimal,

    #[serde(default)]
    pub stop_loss: Option<Decimal>,

    #[serde(default)]
    pub take_profit: Option<Decimal>,

    /// Unrealized P&L in account currency
    #[serde(default)]
    pub profit: Decimal,
}

impl Position {
    #[cfg(test)]
    pub fn new(ticket: Ticket, symbol: impl Into<String>, direction: Direction, volume: Decimal, open_price: Decimal) -> Self {
        Self {
            ticket,
            symbol: symbol.into(),
            direction,
            volume,
            open_price,
            stop_loss: None,
            take_profit: None,
            profit: Decimal::ZERO,
        }
    }

    /// Sum of unrealized P&L across a set of positions.
    pub fn total_profit(positions: &[Position]) -> Decimal {
        positions.iter().map(|p| p.profit).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_direction_parse() {
        assert_eq!(Direction::parse("BUY"), Some(Direction::Long));
        assert_eq!(Direction::parse("short"), Some(Direction::Short));
        assert_eq!(Direction::parse("hold"), None);
    }

    #[test]
    fn test_total_profit() {
        let mut a = Position::new(Ticket(1), "EURUSD", Direction::Long, dec!(1), dec!(1.1));
        let mut b = Position::new(Ticket(2), "XAUUSD", Direction::Short, dec!(0.5), dec!(2400));
        a.profit = dec!(12.50);
        b.profit = dec!(-20);

        assert_eq!(Position::total_profit(&[a, b]), dec!(-7.50));
        assert_eq!(Position::total_profit(&[]), Decimal::ZERO);
    }
}
