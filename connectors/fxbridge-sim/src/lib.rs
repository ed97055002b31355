//! In-process broker simulator.
//!
//! Implements both capability traits against a scriptable in-memory book so
//! the session engine can be exercised without a real trading server. Tests
//! drive it through the `fail_next_connect` / `hang_next_order_call` /
//! `reject_next_order_call` knobs and by pushing quotes.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use fxbridge_broker::{
    GatewayError, GatewayResult, OpenRequest, OrderGateway, QuoteSession, SessionEvent,
    UpdateAction,
};
use fxbridge_core::{
    AccountInfo, Login, OrderKind, OrderSnapshot, Price, Quote, Ticket, Volume,
};
use rust_decimal::Decimal;
use tokio::sync::mpsc;

struct Inner {
    connected: bool,
    account: AccountInfo,
    quotes: HashMap<String, Quote>,
    open_orders: Vec<OrderSnapshot>,
    history: Vec<OrderSnapshot>,
    next_ticket: Ticket,
    connect_failures: VecDeque<GatewayError>,
    hang_order_calls: u32,
    order_failures: VecDeque<GatewayError>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

/// Simulated trading account exposing both broker capabilities.
#[derive(Clone)]
pub struct SimBroker {
    inner: Arc<Mutex<Inner>>,
}

impl SimBroker {
    #[must_use]
    pub fn new(login: Login) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                connected: false,
                account: AccountInfo {
                    connected: false,
                    master: true,
                    login,
                    trade_mode: 0,
                    leverage: 100,
                    limit_orders: 200,
                    balance: Decimal::new(10_000, 0),
                    credit: Decimal::ZERO,
                    profit: Decimal::ZERO,
                    equity: Decimal::new(10_000, 0),
                    margin: Decimal::ZERO,
                    margin_free: Decimal::new(10_000, 0),
                    currency: "USD".to_string(),
                    server: "Sim-Live".to_string(),
                    account_name: format!("sim-{login}"),
                },
                quotes: HashMap::new(),
                open_orders: Vec::new(),
                history: Vec::new(),
                next_ticket: 1_000,
                connect_failures: VecDeque::new(),
                hang_order_calls: 0,
                order_failures: VecDeque::new(),
                events: None,
            })),
        }
    }

    fn emit(&self, event: SessionEvent) {
        let inner = self.inner.lock().unwrap();
        if let Some(tx) = &inner.events {
            let _ = tx.send(event);
        }
    }

    /// Publish a tick and notify the session.
    pub fn set_quote(&self, symbol: &str, bid: Price, ask: Price) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.quotes.insert(symbol.to_string(), Quote { bid, ask });
        }
        self.emit(SessionEvent::Quote {
            symbol: symbol.to_string(),
        });
    }

    pub fn set_equity(&self, equity: Decimal) {
        let mut inner = self.inner.lock().unwrap();
        inner.account.equity = equity;
    }

    /// Queue one connect attempt to fail with the given error.
    pub fn fail_next_connect(&self, error: GatewayError) {
        self.inner.lock().unwrap().connect_failures.push_back(error);
    }

    /// Make the next `n` gateway order calls hang forever.
    pub fn hang_next_order_calls(&self, n: u32) {
        self.inner.lock().unwrap().hang_order_calls = n;
    }

    /// Queue one gateway order call to fail with the given error.
    pub fn reject_next_order_call(&self, error: GatewayError) {
        self.inner.lock().unwrap().order_failures.push_back(error);
    }

    /// Sever the connection as the broker would, with a pushed event.
    pub fn drop_connection(&self, reason: &str) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.connected = false;
            inner.account.connected = false;
        }
        self.emit(SessionEvent::Disconnected(reason.to_string()));
    }

    /// Seed a terminated order directly into the simulated archive.
    pub fn seed_history(&self, order: OrderSnapshot) {
        self.inner.lock().unwrap().history.push(order);
    }

    /// Place an order directly on the book, bypassing the gateway path.
    pub fn seed_open_order(&self, order: OrderSnapshot) {
        self.inner.lock().unwrap().open_orders.push(order);
    }

    /// Current open book, for assertions.
    #[must_use]
    pub fn book(&self) -> Vec<OrderSnapshot> {
        self.inner.lock().unwrap().open_orders.clone()
    }

    async fn order_call_gate(&self) -> GatewayResult<()> {
        let hang = {
            let mut inner = self.inner.lock().unwrap();
            if inner.hang_order_calls > 0 {
                inner.hang_order_calls -= 1;
                true
            } else {
                false
            }
        };
        if hang {
            std::future::pending::<()>().await;
        }
        let failure = self.inner.lock().unwrap().order_failures.pop_front();
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn now() -> NaiveDateTime {
        Utc::now().naive_utc()
    }
}

#[async_trait]
impl QuoteSession for SimBroker {
    async fn connect(&self) -> GatewayResult<()> {
        let failure = self.inner.lock().unwrap().connect_failures.pop_front();
        if let Some(error) = failure {
            self.emit(SessionEvent::ConnectFailed(error.to_string()));
            return Err(error);
        }
        {
            let mut inner = self.inner.lock().unwrap();
            inner.connected = true;
            inner.account.connected = true;
        }
        self.emit(SessionEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.connected = false;
        inner.account.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().connected
    }

    fn account(&self) -> AccountInfo {
        self.inner.lock().unwrap().account.clone()
    }

    fn quote(&self, symbol: &str) -> Option<Quote> {
        self.inner.lock().unwrap().quotes.get(symbol).copied()
    }

    async fn open_orders(&self) -> GatewayResult<Vec<OrderSnapshot>> {
        Ok(self.inner.lock().unwrap().open_orders.clone())
    }

    async fn order_history(
        &self,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> GatewayResult<Vec<OrderSnapshot>> {
        let mut rows: Vec<OrderSnapshot> = self
            .inner
            .lock()
            .unwrap()
            .history
            .iter()
            .filter(|o| o.close_time >= from && o.close_time <= to)
            .cloned()
            .collect();
        rows.sort_by_key(|o| o.open_time);
        Ok(rows)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().events = Some(tx);
        rx
    }
}

#[async_trait]
impl OrderGateway for SimBroker {
    async fn order_send(&self, request: OpenRequest) -> GatewayResult<OrderSnapshot> {
        self.order_call_gate().await?;
        let order = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.connected {
                return Err(GatewayError::Transport("not connected".to_string()));
            }
            let ticket = inner.next_ticket;
            inner.next_ticket += 1;
            let now = Self::now();
            let order = OrderSnapshot {
                ticket,
                kind: request.kind,
                symbol: request.symbol,
                open_time: now,
                close_time: now,
                open_price: request.price,
                close_price: request.price,
                stop_loss: request.stop_loss,
                take_profit: request.take_profit,
                commission: Decimal::ZERO,
                swap: Decimal::ZERO,
                volume: request.volume,
                profit: Decimal::ZERO,
                comment: request.comment,
            };
            inner.open_orders.push(order.clone());
            order
        };
        let action = if order.kind.is_market() {
            UpdateAction::PositionOpen
        } else {
            UpdateAction::PendingOpen
        };
        self.emit(SessionEvent::OrderUpdate {
            action,
            order: order.clone(),
        });
        Ok(order)
    }

    async fn order_modify(
        &self,
        ticket: Ticket,
        _kind: OrderKind,
        price: Price,
        stop_loss: Price,
        take_profit: Price,
    ) -> GatewayResult<OrderSnapshot> {
        self.order_call_gate().await?;
        let order = {
            let mut inner = self.inner.lock().unwrap();
            let order = inner
                .open_orders
                .iter_mut()
                .find(|o| o.ticket == ticket)
                .ok_or_else(|| GatewayError::Rejected(format!("unknown ticket {ticket}")))?;
            if !order.kind.is_market() {
                order.open_price = price;
            }
            order.stop_loss = stop_loss;
            order.take_profit = take_profit;
            order.clone()
        };
        self.emit(SessionEvent::OrderUpdate {
            action: UpdateAction::PositionModify,
            order: order.clone(),
        });
        Ok(order)
    }

    async fn order_close(
        &self,
        _symbol: &str,
        ticket: Ticket,
        _volume: Volume,
        price: Price,
    ) -> GatewayResult<OrderSnapshot> {
        self.order_call_gate().await?;
        let order = {
            let mut inner = self.inner.lock().unwrap();
            let idx = inner
                .open_orders
                .iter()
                .position(|o| o.ticket == ticket)
                .ok_or_else(|| GatewayError::Rejected(format!("unknown ticket {ticket}")))?;
            let mut order = inner.open_orders.remove(idx);
            order.close_time = Self::now();
            order.close_price = price;
            inner.history.push(order.clone());
            order
        };
        self.emit(SessionEvent::OrderUpdate {
            action: UpdateAction::PositionClose,
            order: order.clone(),
        });
        Ok(order)
    }

    async fn order_delete(
        &self,
        ticket: Ticket,
        _kind: OrderKind,
        _symbol: &str,
        _volume: Volume,
        _price: Price,
    ) -> GatewayResult<OrderSnapshot> {
        self.order_call_gate().await?;
        let order = {
            let mut inner = self.inner.lock().unwrap();
            let idx = inner
                .open_orders
                .iter()
                .position(|o| o.ticket == ticket)
                .ok_or_else(|| GatewayError::Rejected(format!("unknown ticket {ticket}")))?;
            let mut order = inner.open_orders.remove(idx);
            order.close_time = Self::now();
            order
        };
        self.emit(SessionEvent::OrderUpdate {
            action: UpdateAction::PendingClose,
            order: order.clone(),
        });
        Ok(order)
    }
}
