//! Terminal bridge client.
//!
//! Talks to a small REST bridge running next to the trading terminal. The
//! bridge holds one terminal login per bearer token, so this client keeps a
//! single session and re-authenticates when switching accounts or after the
//! bridge reports the token expired.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::models::{Account, AccountInfo, OrderRequest, OrderTicket, Position, Ticket, VolumeConstraints};

use super::types::*;
use super::{BrokerError, BrokerGateway};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
struct BridgeSession {
    login: u64,
    token: String,
}

/// Broker gateway over the terminal bridge's REST API.
pub struct HttpGateway {
    client: Client,
    base_url: String,
    session: Mutex<Option<BridgeSession>>,
}

impl HttpGateway {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            session: Mutex::new(None),
        })
    }

    fn current(&self) -> Option<BridgeSession> {
        self.session.lock().ok().and_then(|s| s.clone())
    }

    fn set_session(&self, session: Option<BridgeSession>) {
        if let Ok(mut guard) = self.session.lock() {
            *guard = session;
        }
    }

    /// Token for `login`, or a session error if we are logged in elsewhere.
    fn token_for(&self, login: Option<u64>) -> Result<String, BrokerError> {
        match (self.current(), login) {
            (Some(s), Some(l)) if s.login == l => Ok(s.token),
            (Some(s), None) => Ok(s.token),
            (Some(s), Some(l)) => Err(BrokerError::Session(format!(
                "session belongs to {}, not {}",
                s.login, l
            ))),
            (None, _) => Err(BrokerError::Session("not logged in".to_string())),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `{base}/symbols/{symbol}` with the symbol percent-encoded as one segment.
    fn symbol_url(&self, symbol: &str) -> Result<String, BrokerError> {
        let mut url =
            Url::parse(&self.base_url).map_err(|e| BrokerError::Protocol(format!("Invalid bridge URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| BrokerError::Protocol(format!("Bridge URL cannot take a path: {}", self.base_url)))?
            .pop_if_empty()
            .extend(["symbols", symbol]);
        Ok(url.into())
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, BrokerError> {
        let response = request
            .send()
            .await
            .map_err(|e| BrokerError::Connectivity(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                // Bridge dropped our token; force a fresh login next time
                self.set_session(None);
                BrokerError::Session(format!("{} - {}", status, body))
            }
            StatusCode::NOT_FOUND => BrokerError::Unavailable(format!("{} - {}", status, body)),
            s if s.is_server_error() => BrokerError::Connectivity(format!("{} - {}", status, body)),
            _ => BrokerError::Protocol(format!("{} - {}", status, body)),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String, login: Option<u64>) -> Result<T, BrokerError> {
        let token = self.token_for(login)?;
        debug!(url = %url, "Bridge GET");

        self.send(self.client.get(&url).bearer_auth(token))
            .await?
            .json()
            .await
            .map_err(|e| BrokerError::Protocol(format!("Failed to parse {}: {}", url, e)))
    }

    async fn post_trade<B: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        login: u64,
        body: &B,
    ) -> Result<OrderTicket, BrokerError> {
        let token = self.token_for(Some(login))?;
        let url = self.url(path);
        debug!(url = %url, "Bridge POST");

        let result: TradeResultResponse = self
            .send(self.client.post(&url).bearer_auth(token).json(body))
            .await?
            .json()
            .await
            .map_err(|e| BrokerError::Protocol(format!("Failed to parse {}: {}", path, e)))?;

        trade_result(result)
    }
}

fn trade_result(result: TradeResultResponse) -> Result<OrderTicket, BrokerError> {
    match (result.retcode, result.order) {
        (RETCODE_DONE, Some(order)) => Ok(OrderTicket { order: Ticket(order) }),
        (RETCODE_DONE, None) => Err(BrokerError::Protocol("accepted trade without order id".to_string())),
        (code, _) => Err(BrokerError::Rejected {
            code,
            message: result.comment,
        }),
    }
}

#[async_trait]
impl BrokerGateway for HttpGateway {
    async fn login(&self, account: &Account) -> Result<(), BrokerError> {
        if self.current().is_some_and(|s| s.login == account.login) {
            return Ok(());
        }

        let body = LoginRequest {
            login: account.login,
            password: &account.password,
            server: &account.server,
        };
        let response: LoginResponse = self
            .send(self.client.post(self.url("/session")).json(&body))
            .await?
            .json()
            .await
            .map_err(|e| BrokerError::Protocol(format!("Failed to parse login response: {}", e)))?;

        debug!(account = account.login, "Bridge session established");
        self.set_session(Some(BridgeSession {
            login: account.login,
            token: response.token,
        }));
        Ok(())
    }

    async fn account_info(&self, account: &Account) -> Result<AccountInfo, BrokerError> {
        let response: AccountResponse = self.get_json(self.url("/account"), Some(account.login)).await?;
        Ok(response.into())
    }

    async fn open_positions(&self, account: &Account) -> Result<Vec<Position>, BrokerError> {
        let items: Vec<PositionResponse> = self.get_json(self.url("/positions"), Some(account.login)).await?;

        Ok(items
            .into_iter()
            .filter_map(|p| {
                let ticket = p.ticket;
                let position = p.into_position();
                if position.is_none() {
                    warn!(account = account.login, ticket = ticket, "Skipping position with unknown side");
                }
                position
            })
            .collect())
    }

    async fn submit_order(&self, account: &Account, order: &OrderRequest) -> Result<OrderTicket, BrokerError> {
        let payload = OrderPayload::from(order);
        self.post_trade("/orders", account.login, &payload).await
    }

    async fn volume_constraints(&self, symbol: &str) -> Result<VolumeConstraints, BrokerError> {
        let response: SymbolResponse = self.get_json(self.symbol_url(symbol)?, None).await?;
        Ok(response.into())
    }

    async fn close_position(&self, account: &Account, ticket: Ticket) -> Result<OrderTicket, BrokerError> {
        let path = format!("/positions/{}/close", ticket.0);
        self.post_trade(&path, account.login, &serde_json::json!({})).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, Position};
    use rust_decimal_macros::dec;

    #[test]
    fn test_position_conversion() {
        let raw = r#"[
            {"ticket": 501, "symbol": "EURUSD", "type": "buy", "volume": 1.5,
             "price_open": 1.0842, "sl": 0, "tp": 1.0950, "profit": -12.4},
            {"ticket": 502, "symbol": "EURUSD", "type": "buy_limit", "volume": 1,
             "price_open": 1.07}
        ]"#;
        let items: Vec<PositionResponse> = serde_json::from_str(raw).unwrap();
        let positions: Vec<Position> = items.into_iter().filter_map(|p| p.into_position()).collect();

        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].ticket, Ticket(501));
        assert_eq!(positions[0].direction, Direction::Long);
        assert_eq!(positions[0].stop_loss, None);
        assert_eq!(positions[0].take_profit, Some(dec!(1.0950)));
        assert_eq!(positions[0].profit, dec!(-12.4));
    }

    #[test]
    fn test_order_payload_zeroes_missing_stops() {
        let master = Position::new(Ticket(9), "XAUUSD", Direction::Short, dec!(1), dec!(2400));
        let order = OrderRequest::mirror_of(&master, dec!(0.3), 5001, 20, 12345);
        let payload = serde_json::to_value(OrderPayload::from(&order)).unwrap();

        assert_eq!(payload["type"], "sell");
        assert_eq!(payload["sl"], "0");
        assert!(payload.get("price").is_none());
        assert_eq!(payload["comment"], "Copied from 5001");
    }

    #[test]
    fn test_trade_result_codes() {
        let done = TradeResultResponse {
            retcode: RETCODE_DONE,
            order: Some(88),
            comment: String::new(),
        };
        assert_eq!(trade_result(done).unwrap().order, Ticket(88));

        let rejected = TradeResultResponse {
            retcode: 10016,
            order: None,
            comment: "Invalid stops".to_string(),
        };
        assert_eq!(
            trade_result(rejected).unwrap_err(),
            BrokerError::Rejected {
                code: 10016,
                message: "Invalid stops".to_string()
            }
        );
    }

    #[test]
    fn test_symbol_url_encodes_broker_suffixes() {
        let gateway = HttpGateway::new("http://127.0.0.1:8787/").unwrap();
        assert_eq!(gateway.symbol_url("EURUSD").unwrap(), "http://127.0.0.1:8787/symbols/EURUSD");
        assert_eq!(gateway.symbol_url("US30#").unwrap(), "http://127.0.0.1:8787/symbols/US30%23");
        assert_eq!(gateway.symbol_url("EURUSD/").unwrap(), "http://127.0.0.1:8787/symbols/EURUSD%2F");

        let prefixed = HttpGateway::new("http://bridge.local/api").unwrap();
        assert_eq!(prefixed.symbol_url("XAUUSD.m").unwrap(), "http://bridge.local/api/symbols/XAUUSD.m");
    }

    #[test]
    fn test_token_requires_matching_login() {
        let gateway = HttpGateway::new("http://localhost:1/").unwrap();
        assert!(matches!(gateway.token_for(Some(1)), Err(BrokerError::Session(_))));

        gateway.set_session(Some(BridgeSession {
            login: 1,
            token: "abc".to_string(),
        }));
        assert_eq!(gateway.token_for(Some(1)).unwrap(), "abc");
        assert_eq!(gateway.token_for(None).unwrap(), "abc");
        assert!(gateway.token_for(Some(2)).is_err());
    }
}
