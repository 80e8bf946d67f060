//! In-memory broker used by the test-suite.
//!
//! Clones share the same book (the "broker") but each clone carries its own
//! login session, like two independent terminal connections.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::models::{
    Account, AccountInfo, Direction, OrderRequest, OrderTicket, Position, Ticket, VolumeConstraints,
};

use super::{BrokerError, BrokerGateway};

#[derive(Debug, Default)]
struct PaperAccount {
    balance: Decimal,
    equity: Decimal,
    positions: Vec<Position>,
    offline: bool,
    info_unavailable: bool,
    /// Successful info reads left before `failing_infos` kicks in
    infos_before_failure: u32,
    failing_infos: u32,
    failing_logins: u32,
    rejected_orders: u32,
    rejected_closes: u32,
    order_attempts: u32,
    close_attempts: u32,
}

#[derive(Debug)]
struct PaperBook {
    accounts: HashMap<u64, PaperAccount>,
    symbols: HashMap<String, VolumeConstraints>,
    next_ticket: u64,
}

pub struct PaperGateway {
    book: Arc<Mutex<PaperBook>>,
    session: Mutex<Option<u64>>,
}

impl Clone for PaperGateway {
    fn clone(&self) -> Self {
        Self {
            book: Arc::clone(&self.book),
            session: Mutex::new(None),
        }
    }
}

impl PaperGateway {
    pub fn new() -> Self {
        let book = PaperBook {
            accounts: HashMap::new(),
            symbols: HashMap::new(),
            next_ticket: 1000,
        };
        Self {
            book: Arc::new(Mutex::new(book)),
            session: Mutex::new(None),
        }
    }

    fn with_book<T>(&self, f: impl FnOnce(&mut PaperBook) -> T) -> T {
        let mut book = self.book.lock().expect("paper book poisoned");
        f(&mut book)
    }

    fn with_account<T>(&self, login: u64, f: impl FnOnce(&mut PaperAccount) -> T) -> T {
        self.with_book(|book| f(book.accounts.get_mut(&login).expect("unknown paper account")))
    }

    pub fn add_account(&self, login: u64, balance: Decimal) {
        self.with_book(|book| {
            book.accounts.insert(
                login,
                PaperAccount {
                    balance,
                    equity: balance,
                    ..Default::default()
                },
            );
        });
    }

    pub fn add_symbol(&self, symbol: &str, step: Decimal, min_volume: Decimal) {
        self.with_book(|book| {
            book.symbols.insert(symbol.to_string(), VolumeConstraints { step, min_volume });
        });
    }

    pub fn set_equity(&self, login: u64, equity: Decimal) {
        self.with_account(login, |a| a.equity = equity);
    }

    pub fn set_balance(&self, login: u64, balance: Decimal) {
        self.with_account(login, |a| a.balance = balance);
    }

    /// Open a position directly, as a human trader on that account would.
    pub fn open(&self, login: u64, symbol: &str, direction: Direction, volume: Decimal) -> Ticket {
        self.with_book(|book| {
            book.next_ticket += 1;
            let ticket = Ticket(book.next_ticket);
            let account = book.accounts.get_mut(&login).expect("unknown paper account");
            account
                .positions
                .push(Position::new(ticket, symbol, direction, volume, Decimal::ONE));
            ticket
        })
    }

    /// Remove a position directly, as a human trader closing it would.
    pub fn close(&self, login: u64, ticket: Ticket) {
        self.with_account(login, |a| a.positions.retain(|p| p.ticket != ticket));
    }

    pub fn positions(&self, login: u64) -> Vec<Position> {
        self.with_account(login, |a| a.positions.clone())
    }

    pub fn set_offline(&self, login: u64, offline: bool) {
        self.with_account(login, |a| a.offline = offline);
    }

    pub fn set_info_unavailable(&self, login: u64, unavailable: bool) {
        self.with_account(login, |a| a.info_unavailable = unavailable);
    }

    /// Let `after` account info reads through, then fail the next `count`.
    pub fn fail_account_info(&self, login: u64, after: u32, count: u32) {
        self.with_account(login, |a| {
            a.infos_before_failure = after;
            a.failing_infos = count;
        });
    }

    pub fn fail_logins(&self, login: u64, count: u32) {
        self.with_account(login, |a| a.failing_logins = count);
    }

    pub fn reject_orders(&self, login: u64, count: u32) {
        self.with_account(login, |a| a.rejected_orders = count);
    }

    pub fn reject_closes(&self, login: u64, count: u32) {
        self.with_account(login, |a| a.rejected_closes = count);
    }

    pub fn order_attempts(&self, login: u64) -> u32 {
        self.with_account(login, |a| a.order_attempts)
    }

    pub fn close_attempts(&self, login: u64) -> u32 {
        self.with_account(login, |a| a.close_attempts)
    }

    fn current_session(&self) -> Option<u64> {
        *self.session.lock().expect("paper session poisoned")
    }

    fn ensure_session(&self, account: &Account) -> Result<(), BrokerError> {
        if self.current_session() != Some(account.login) {
            return Err(BrokerError::Session(format!("not logged in as {}", account.login)));
        }
        let offline = self.with_book(|book| book.accounts.get(&account.login).map(|a| a.offline));
        match offline {
            Some(false) => Ok(()),
            Some(true) => Err(BrokerError::Connectivity("terminal offline".to_string())),
            None => Err(BrokerError::Session(format!("unknown login {}", account.login))),
        }
    }
}

#[async_trait]
impl BrokerGateway for PaperGateway {
    async fn login(&self, account: &Account) -> Result<(), BrokerError> {
        let outcome = self.with_book(|book| match book.accounts.get_mut(&account.login) {
            None => Err(BrokerError::Session(format!("unknown login {}", account.login))),
            Some(a) if a.offline => Err(BrokerError::Connectivity("terminal offline".to_string())),
            Some(a) if a.failing_logins > 0 => {
                a.failing_logins -= 1;
                Err(BrokerError::Session("invalid account".to_string()))
            }
            Some(_) => Ok(()),
        });
        if outcome.is_ok() {
            *self.session.lock().expect("paper session poisoned") = Some(account.login);
        }
        outcome
    }

    async fn account_info(&self, account: &Account) -> Result<AccountInfo, BrokerError> {
        self.ensure_session(account)?;
        self.with_account(account.login, |a| {
            if a.info_unavailable {
                return Err(BrokerError::Unavailable("account info".to_string()));
            }
            if a.failing_infos > 0 {
                if a.infos_before_failure > 0 {
                    a.infos_before_failure -= 1;
                } else {
                    a.failing_infos -= 1;
                    return Err(BrokerError::Unavailable("account info".to_string()));
                }
            }
            Ok(AccountInfo {
                balance: a.balance,
                equity: a.equity,
            })
        })
    }

    async fn open_positions(&self, account: &Account) -> Result<Vec<Position>, BrokerError> {
        self.ensure_session(account)?;
        Ok(self.positions(account.login))
    }

    async fn submit_order(&self, account: &Account, order: &OrderRequest) -> Result<OrderTicket, BrokerError> {
        self.ensure_session(account)?;
        self.with_book(|book| {
            let rejected = {
                let a = book.accounts.get_mut(&account.login).expect("unknown paper account");
                a.order_attempts += 1;
                if a.rejected_orders > 0 {
                    a.rejected_orders -= 1;
                    true
                } else {
                    false
                }
            };
            if rejected {
                return Err(BrokerError::Rejected {
                    code: 10006,
                    message: "Request rejected".to_string(),
                });
            }

            book.next_ticket += 1;
            let ticket = Ticket(book.next_ticket);
            let mut position = Position::new(
                ticket,
                order.symbol.clone(),
                order.direction,
                order.volume,
                order.price.unwrap_or(Decimal::ONE),
            );
            position.stop_loss = order.stop_loss;
            position.take_profit = order.take_profit;

            let a = book.accounts.get_mut(&account.login).expect("unknown paper account");
            a.positions.push(position);
            Ok(OrderTicket { order: ticket })
        })
    }

    async fn volume_constraints(&self, symbol: &str) -> Result<VolumeConstraints, BrokerError> {
        if self.current_session().is_none() {
            return Err(BrokerError::Session("no session".to_string()));
        }
        self.with_book(|book| {
            book.symbols
                .get(symbol)
                .copied()
                .ok_or_else(|| BrokerError::Unavailable(format!("unknown symbol {}", symbol)))
        })
    }

    async fn close_position(&self, account: &Account, ticket: Ticket) -> Result<OrderTicket, BrokerError> {
        self.ensure_session(account)?;
        self.with_book(|book| {
            book.next_ticket += 1;
            let deal = Ticket(book.next_ticket);
            let a = book.accounts.get_mut(&account.login).expect("unknown paper account");
            a.close_attempts += 1;
            if a.rejected_closes > 0 {
                a.rejected_closes -= 1;
                return Err(BrokerError::Rejected {
                    code: 10018,
                    message: "Market closed".to_string(),
                });
            }
            let before = a.positions.len();
            a.positions.retain(|p| p.ticket != ticket);
            if a.positions.len() == before {
                return Err(BrokerError::Rejected {
                    code: 10036,
                    message: format!("Position {} not found", ticket),
                });
            }
            Ok(OrderTicket { order: deal })
        })
    }
}
