//! Broker connectivity: the gateway contract, a retrying session over it,
//! and the terminal-bridge HTTP adapter.

mod gateway;
mod http;
#[cfg(test)]
mod paper;
mod session;
mod types;

pub use gateway::{BrokerError, BrokerGateway};
pub use http::HttpGateway;
#[cfg(test)]
pub use paper::PaperGateway;
pub use session::{BrokerSession, CloseAllReport, RetryPolicy};
