//! Broker-agnostic traits consumed by the session engine.
//!
//! The actual trading-protocol client (handshake, wire format, push event
//! delivery) lives behind [`QuoteSession`] and [`OrderGateway`]; everything
//! above these traits is broker-neutral.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use fxbridge_core::{AccountInfo, OrderKind, OrderSnapshot, Price, Quote, Symbol, Ticket, Volume};
use thiserror::Error;
use tokio::sync::mpsc;

/// Convenience alias for gateway results.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Common error type returned by broker capability implementations.
#[derive(Clone, Debug, Error)]
pub enum GatewayError {
    /// Login rejected or credentials revoked; terminal for the session.
    #[error("invalid credentials: {0}")]
    CredentialsInvalid(String),
    /// Broker refused the request (invalid stops, market closed, ...).
    #[error("rejected: {0}")]
    Rejected(String),
    /// Transport-level failure (network, protocol).
    #[error("transport error: {0}")]
    Transport(String),
    /// A catch-all branch for other issues.
    #[error("unexpected error: {0}")]
    Other(String),
}

/// Broker push events delivered to one account's session reactor.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    Connected,
    ConnectFailed(String),
    Disconnected(String),
    OrderUpdate {
        action: UpdateAction,
        order: OrderSnapshot,
    },
    Quote {
        symbol: Symbol,
    },
}

/// What an order-update push event describes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpdateAction {
    PendingOpen,
    PendingClose,
    PositionOpen,
    PositionClose,
    PositionModify,
    Balance,
    Credit,
}

impl UpdateAction {
    /// The order left the open set and its projection entry must go.
    #[must_use]
    pub fn closes_order(self) -> bool {
        matches!(self, Self::PendingClose | Self::PositionClose)
    }

    /// Terminal or balance-affecting: the order belongs in history now.
    #[must_use]
    pub fn affects_history(self) -> bool {
        self.closes_order() || matches!(self, Self::Balance | Self::Credit)
    }
}

/// One long-lived authenticated connection to a trading account.
#[async_trait]
pub trait QuoteSession: Send + Sync {
    /// Establish (or re-establish) the connection.
    async fn connect(&self) -> GatewayResult<()>;

    /// Tear the connection down. Safe to call when already disconnected.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Snapshot of the account financials and identity.
    fn account(&self) -> AccountInfo;

    /// Latest observed quote for a symbol, if any tick arrived yet.
    fn quote(&self, symbol: &str) -> Option<Quote>;

    /// Currently open positions and pending orders.
    async fn open_orders(&self) -> GatewayResult<Vec<OrderSnapshot>>;

    /// Terminated orders with close time in `[from, to]`, broker-local
    /// clock, sorted by open time ascending.
    async fn order_history(
        &self,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> GatewayResult<Vec<OrderSnapshot>>;

    /// Stream of push events. The session reactor subscribes exactly once.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent>;
}

/// Parameters for a new order submission.
#[derive(Clone, Debug, PartialEq)]
pub struct OpenRequest {
    pub symbol: Symbol,
    pub kind: OrderKind,
    pub volume: Volume,
    pub price: Price,
    pub stop_loss: Price,
    pub take_profit: Price,
    pub comment: String,
}

/// Order mutation interface of the broker.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn order_send(&self, request: OpenRequest) -> GatewayResult<OrderSnapshot>;

    async fn order_modify(
        &self,
        ticket: Ticket,
        kind: OrderKind,
        price: Price,
        stop_loss: Price,
        take_profit: Price,
    ) -> GatewayResult<OrderSnapshot>;

    /// Close a market order (fully, at the given price).
    async fn order_close(
        &self,
        symbol: &str,
        ticket: Ticket,
        volume: Volume,
        price: Price,
    ) -> GatewayResult<OrderSnapshot>;

    /// Delete a pending order.
    async fn order_delete(
        &self,
        ticket: Ticket,
        kind: OrderKind,
        symbol: &str,
        volume: Volume,
        price: Price,
    ) -> GatewayResult<OrderSnapshot>;
}

/// Outcome of one bounded-wait gateway submission.
///
/// A timeout means the side effect is unknown, so callers must escalate it
/// instead of retrying; every other error is retryable unless the broker
/// revoked the credentials.
#[derive(Debug)]
pub enum SubmitOutcome<T> {
    Ok(T),
    Timeout,
    Retryable(GatewayError),
    Fatal(GatewayError),
}

/// Run a gateway call with a hard upper bound on the wait.
pub async fn submit<T, F>(call: F, wait: Duration) -> SubmitOutcome<T>
where
    F: std::future::Future<Output = GatewayResult<T>>,
{
    match tokio::time::timeout(wait, call).await {
        Err(_) => SubmitOutcome::Timeout,
        Ok(Ok(value)) => SubmitOutcome::Ok(value),
        Ok(Err(err @ GatewayError::CredentialsInvalid(_))) => SubmitOutcome::Fatal(err),
        Ok(Err(err)) => SubmitOutcome::Retryable(err),
    }
}
