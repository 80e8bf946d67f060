//! Data models for accounts, positions, and orders.

mod account;
mod order;
mod position;

pub use account::{Account, AccountInfo, AccountRole};
pub use order::{OrderRequest, OrderTicket, VolumeConstraints};
pub use position::{Direction, Position, Ticket};
