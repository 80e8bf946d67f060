//! Order requests sent to the broker and the identifiers it hands back.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Direction, Position, Ticket};

/// Market order to open a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,

    pub direction: Direction,

    /// Size in lots, already rounded to the symbol's volume step
    pub volume: Decimal,

    /// Requested price; `None` executes at market
    pub price: Option<Decimal>,

    pub stop_loss: Option<Decimal>,

    pub take_profit: Option<Decimal>,

    /// Maximum price deviation in points
    pub deviation: u32,

    /// Expert/magic number tagging our orders
    pub magic: u64,

    pub comment: String,
}

impl OrderRequest {
    /// Build the slave-side mirror of a master position at the scaled volume.
    pub fn mirror_of(position: &Position, volume: Decimal, master_login: u64, deviation: u32, magic: u64) -> Self {
        Self {
            symbol: position.symbol.clone(),
            direction: position.direction,
            volume,
            price: None,
            stop_loss: position.stop_loss,
            take_profit: position.take_profit,
            deviation,
            magic,
            comment: format!("Copied from {}", master_login),
        }
    }
}

/// Broker acknowledgement of an accepted order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTicket {
    /// Order identifier; for market deals this is the resulting position ticket
    pub order: Ticket,
}

/// Per-symbol volume rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConstraints {
    pub step: Decimal,
    pub min_volume: Decimal,
}
