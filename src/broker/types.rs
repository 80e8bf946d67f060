//! Wire types for the terminal bridge REST API.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{AccountInfo, Direction, OrderRequest, Position, Ticket, VolumeConstraints};

/// Body of `POST /session`.
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest<'a> {
    pub login: u64,
    pub password: &'a str,
    pub server: &'a str,
}

/// Response from `POST /session`.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub token: String,
}

/// Response from `GET /account`.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountResponse {
    pub balance: Decimal,
    pub equity: Decimal,
}

impl From<AccountResponse> for AccountInfo {
    fn from(r: AccountResponse) -> Self {
        AccountInfo {
            balance: r.balance,
            equity: r.equity,
        }
    }
}

/// One entry of `GET /positions`.
#[derive(Debug, Clone, Deserialize)]
pub struct PositionResponse {
    pub ticket: u64,
    pub symbol: String,
    #[serde(rename = "type")]
    pub side: String,
    pub volume: Decimal,
    pub price_open: Decimal,
    /// 0 means no stop
    #[serde(default)]
    pub sl: Decimal,
    /// 0 means no target
    #[serde(default)]
    pub tp: Decimal,
    #[serde(default)]
    pub profit: Decimal,
}

impl PositionResponse {
    /// Convert to a `Position`; `None` for sides we do not copy.
    pub fn into_position(self) -> Option<Position> {
        let direction = Direction::parse(&self.side)?;
        Some(Position {
            ticket: Ticket(self.ticket),
            symbol: self.symbol,
            direction,
            volume: self.volume,
            open_price: self.price_open,
            stop_loss: non_zero(self.sl),
            take_profit: non_zero(self.tp),
            profit: self.profit,
        })
    }
}

fn non_zero(value: Decimal) -> Option<Decimal> {
    (!value.is_zero()).then_some(value)
}

/// Body of `POST /orders`.
#[derive(Debug, Clone, Serialize)]
pub struct OrderPayload<'a> {
    pub symbol: &'a str,
    #[serde(rename = "type")]
    pub side: &'static str,
    pub volume: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    pub sl: Decimal,
    pub tp: Decimal,
    pub deviation: u32,
    pub magic: u64,
    pub comment: &'a str,
}

impl<'a> From<&'a OrderRequest> for OrderPayload<'a> {
    fn from(order: &'a OrderRequest) -> Self {
        OrderPayload {
            symbol: &order.symbol,
            side: match order.direction {
                Direction::Long => "buy",
                Direction::Short => "sell",
            },
            volume: order.volume,
            price: order.price,
            sl: order.stop_loss.unwrap_or(Decimal::ZERO),
            tp: order.take_profit.unwrap_or(Decimal::ZERO),
            deviation: order.deviation,
            magic: order.magic,
            comment: &order.comment,
        }
    }
}

/// Trade server result for an order or a close.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeResultResponse {
    pub retcode: i64,
    #[serde(default)]
    pub order: Option<u64>,
    #[serde(default)]
    pub comment: String,
}

/// `TRADE_RETCODE_DONE`
pub const RETCODE_DONE: i64 = 10009;

/// Response from `GET /symbols/{symbol}`.
#[derive(Debug, Clone, Deserialize)]
pub struct SymbolResponse {
    pub volume_step: Decimal,
    pub volume_min: Decimal,
}

impl From<SymbolResponse> for VolumeConstraints {
    fn from(r: SymbolResponse) -> Self {
        VolumeConstraints {
            step: r.volume_step,
            min_volume: r.volume_min,
        }
    }
}
