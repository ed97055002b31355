//! Instruction queue dispatcher.
//!
//! A single task polls the shared queue on a fixed cadence and executes the
//! pending batch strictly in order, one instruction at a time; the next poll
//! only happens after the batch completes, so batches never overlap. Results
//! are written back exactly once per instruction row.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fxbridge_broker::{submit, GatewayResult, OpenRequest, SubmitOutcome};
use fxbridge_config::DispatchConfig;
use fxbridge_core::{
    Instruction, InstructionAction, OrderKind, OrderSnapshot, Price, Quote, Ticket,
};
use fxbridge_session::{AccountRegistry, SessionHandle};
use fxbridge_store::InstructionStore;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

mod pricing;

pub use pricing::plan_targets;

/// Start the queue polling loop.
pub fn spawn_dispatcher(
    registry: Arc<AccountRegistry>,
    store: Arc<dyn InstructionStore>,
    config: DispatchConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let poll = Duration::from_millis(config.poll_interval_ms);
        let lookback = chrono::Duration::seconds(config.lookback_secs as i64);
        loop {
            tokio::time::sleep(poll).await;
            let logins = registry.master_logins();
            if logins.is_empty() {
                continue;
            }
            let batch = match store.fetch_pending(&logins, lookback) {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(%err, "instruction fetch failed");
                    continue;
                }
            };
            for instruction in batch {
                let Some(handle) = registry.get(instruction.login) else {
                    report(store.as_ref(), &instruction, None, Some("account not registered"));
                    continue;
                };
                process(handle, instruction, &store, &config).await;
            }
        }
    })
}

/// Write the outcome back to the queue, at most once. Locally synthesized
/// instructions carry no queue row and are skipped.
fn report(
    store: &dyn InstructionStore,
    instruction: &Instruction,
    ticket: Option<Ticket>,
    error: Option<&str>,
) {
    if instruction.id <= 0 {
        return;
    }
    match store.mark_executed(instruction.id, ticket, error) {
        Ok(true) => {}
        Ok(false) => warn!(id = instruction.id, "instruction already acknowledged"),
        Err(err) => warn!(id = instruction.id, %err, "instruction acknowledgement failed"),
    }
}

/// Execute one instruction and acknowledge it.
///
/// Async action variants are acknowledged up front and executed in the
/// background; their outcome is only logged.
pub async fn process(
    handle: Arc<SessionHandle>,
    instruction: Instruction,
    store: &Arc<dyn InstructionStore>,
    config: &DispatchConfig,
) {
    let action = match instruction.action.parse::<InstructionAction>() {
        Ok(action) => action,
        Err(err) => {
            warn!(id = instruction.id, login = instruction.login, %err, "instruction rejected");
            report(store.as_ref(), &instruction, None, Some(&err.to_string()));
            return;
        }
    };

    if action.is_async() {
        report(store.as_ref(), &instruction, None, None);
        let config = config.clone();
        tokio::spawn(async move {
            match perform(&handle, action, &instruction, &config).await {
                Ok(ticket) => debug!(id = instruction.id, ?ticket, "async instruction done"),
                Err(err) => warn!(id = instruction.id, err, "async instruction failed"),
            }
        });
        return;
    }

    match perform(&handle, action, &instruction, config).await {
        Ok(ticket) => {
            info!(id = instruction.id, login = instruction.login, ?ticket, "instruction executed");
            report(store.as_ref(), &instruction, ticket, None);
        }
        Err(err) => {
            warn!(id = instruction.id, login = instruction.login, err, "instruction failed");
            report(store.as_ref(), &instruction, None, Some(&err));
        }
    }
}

/// Run the instruction body; returns the resulting ticket, if one applies.
pub async fn perform(
    handle: &SessionHandle,
    action: InstructionAction,
    instruction: &Instruction,
    config: &DispatchConfig,
) -> Result<Option<Ticket>, String> {
    match action {
        InstructionAction::Open | InstructionAction::OpenAsync => {
            open(handle, instruction, config).await.map(Some)
        }
        InstructionAction::Modify | InstructionAction::ModifyAsync => {
            modify(handle, instruction, config).await
        }
        InstructionAction::Close | InstructionAction::CloseAsync => {
            close(handle, instruction, config).await
        }
    }
}

async fn open(
    handle: &SessionHandle,
    instruction: &Instruction,
    config: &DispatchConfig,
) -> Result<Ticket, String> {
    let kind: OrderKind = instruction.order_type.parse().map_err(stringify_err)?;
    if instruction.symbol.is_empty() {
        return Err("missing symbol".to_string());
    }
    if instruction.volume <= Decimal::ZERO {
        return Err(format!("invalid volume {}", instruction.volume));
    }

    let price = if kind.is_market() {
        let quote = wait_for_quote(handle, &instruction.symbol, config).await?;
        if kind.is_buy_side() {
            quote.ask
        } else {
            quote.bid
        }
    } else if instruction.price > Decimal::ZERO {
        instruction.price
    } else {
        return Err("missing price for pending order".to_string());
    };

    let (stop_loss, take_profit) = plan_targets(
        kind,
        &instruction.symbol,
        price,
        instruction.stop_loss,
        instruction.take_profit,
    );
    let request = OpenRequest {
        symbol: instruction.symbol.clone(),
        kind,
        volume: instruction.volume,
        price,
        stop_loss,
        take_profit,
        comment: instruction.comment.clone(),
    };

    let _permit = handle.submit_lock.lock().await;
    let opened = with_retries(config, || handle.gateway.order_send(request.clone())).await?;
    Ok(opened.ticket)
}

async fn modify(
    handle: &SessionHandle,
    instruction: &Instruction,
    config: &DispatchConfig,
) -> Result<Option<Ticket>, String> {
    let orders = matching_orders(handle, instruction).await?;
    let mut last_ticket = None;
    for order in orders {
        // Market orders must echo their entry; pending orders may be moved.
        let price = if order.kind.is_market() || instruction.price <= Decimal::ZERO {
            order.open_price
        } else {
            instruction.price
        };
        let (stop_loss, take_profit) = plan_targets(
            order.kind,
            &order.symbol,
            price,
            instruction.stop_loss,
            instruction.take_profit,
        );
        if price == order.open_price
            && stop_loss == order.stop_loss
            && take_profit == order.take_profit
        {
            continue;
        }
        let _permit = handle.submit_lock.lock().await;
        let updated = with_retries(config, || {
            handle
                .gateway
                .order_modify(order.ticket, order.kind, price, stop_loss, take_profit)
        })
        .await?;
        last_ticket = Some(updated.ticket);
    }
    match last_ticket {
        Some(ticket) => Ok(Some(ticket)),
        None => Err("no matches or changes".to_string()),
    }
}

async fn close(
    handle: &SessionHandle,
    instruction: &Instruction,
    config: &DispatchConfig,
) -> Result<Option<Ticket>, String> {
    let orders = matching_orders(handle, instruction).await?;
    if orders.is_empty() {
        return Err("no matches".to_string());
    }
    let mut last_ticket = None;
    for order in orders {
        let _permit = handle.submit_lock.lock().await;
        let closed = if order.kind.is_market() {
            let price = match handle.session.quote(&order.symbol) {
                Some(quote) => close_price_for(order.kind, &quote),
                None => order.close_price,
            };
            with_retries(config, || {
                handle
                    .gateway
                    .order_close(&order.symbol, order.ticket, order.volume, price)
            })
            .await?
        } else {
            with_retries(config, || {
                handle.gateway.order_delete(
                    order.ticket,
                    order.kind,
                    &order.symbol,
                    order.volume,
                    order.open_price,
                )
            })
            .await?
        };
        last_ticket = Some(closed.ticket);
    }
    Ok(last_ticket)
}

async fn matching_orders(
    handle: &SessionHandle,
    instruction: &Instruction,
) -> Result<Vec<OrderSnapshot>, String> {
    let orders = handle
        .session
        .open_orders()
        .await
        .map_err(stringify_err)?;
    Ok(orders
        .into_iter()
        .filter(|order| instruction.matches(order))
        .collect())
}

/// Busy-wait (bounded) for a first quote on a cold symbol.
async fn wait_for_quote(
    handle: &SessionHandle,
    symbol: &str,
    config: &DispatchConfig,
) -> Result<Quote, String> {
    let wait = Duration::from_millis(config.quote_wait_ms);
    tokio::time::timeout(wait, async {
        loop {
            if let Some(quote) = handle.session.quote(symbol) {
                return quote;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| format!("no quote for {symbol}"))
}

/// Bounded-wait submission with bounded retries.
///
/// Timeouts are never retried: the side effect is unknown and a blind repeat
/// could double an order. Broker refusals are retried after a short pause.
async fn with_retries<T, F, Fut>(config: &DispatchConfig, mut call: F) -> Result<T, String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = GatewayResult<T>>,
{
    let wait = Duration::from_millis(config.command_timeout_ms);
    let mut attempt = 0u32;
    loop {
        match submit(call(), wait).await {
            SubmitOutcome::Ok(value) => return Ok(value),
            SubmitOutcome::Timeout => return Err("timed out".to_string()),
            SubmitOutcome::Fatal(err) => return Err(err.to_string()),
            SubmitOutcome::Retryable(err) => {
                if attempt >= config.max_retries {
                    return Err(err.to_string());
                }
                attempt += 1;
                debug!(attempt, %err, "retrying gateway submission");
                tokio::time::sleep(Duration::from_millis(config.retry_backoff_ms)).await;
            }
        }
    }
}

fn stringify_err(err: impl std::fmt::Display) -> String {
    err.to_string()
}

/// Resolved price side for a market close, exposed for unit testing.
#[must_use]
pub fn close_price_for(kind: OrderKind, quote: &Quote) -> Price {
    if kind.is_buy_side() {
        quote.bid
    } else {
        quote.ask
    }
}
