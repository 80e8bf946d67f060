//! Trade replication: lot scaling, risk, ledger, the copier engine and its
//! control surface.

mod config;
mod control;
mod engine;
mod ledger;
mod lot_scaler;
mod risk;

pub use config::PolicyConfig;
pub use control::{ControlSurface, DashboardSnapshot, PositionRow};
pub use engine::{flatten_accounts, CopierEngine};

#[cfg(test)]
pub use control::{MasterSummary, PositionStatus, SlaveStatus, SlaveSummary};
#[cfg(test)]
pub use engine::RunState;
