//! Per-account session reactor.
//!
//! One task per registered account owns all of that account's state: the
//! broker event stream, the reconnect timer, and the risk sweep. Events are
//! processed strictly in arrival order, so the cache projection and the
//! history archive never see interleaved writes for one login.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, Utc};
use fxbridge_broker::{submit, GatewayError, SessionEvent, SubmitOutcome};
use fxbridge_config::RiskConfig;
use fxbridge_core::session_time;
use fxbridge_store::HistoryStore;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::registry::{AccountRegistry, SessionHandle};
use crate::risk::{plan_averaging, plan_stop_update};

/// Reactor timing and risk parameters.
#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub reconnect_interval: Duration,
    pub command_timeout: Duration,
    pub risk: RiskConfig,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(3),
            command_timeout: Duration::from_secs(2),
            risk: RiskConfig::default(),
        }
    }
}

/// No archived orders: backfill reaches back to this date, broker-local.
fn backfill_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2010, 1, 1)
        .expect("static date")
        .and_hms_opt(0, 0, 0)
        .expect("static time")
}

/// Register the account and start its reactor.
pub fn start_session(
    registry: &Arc<AccountRegistry>,
    handle: Arc<SessionHandle>,
    history: Arc<dyn HistoryStore>,
    settings: SessionSettings,
) {
    registry.register(Arc::clone(&handle));
    let task = spawn_session(Arc::clone(registry), Arc::clone(&handle), history, settings);
    handle.attach_task(task);
}

/// Spawn the reactor task without touching the registry.
pub fn spawn_session(
    registry: Arc<AccountRegistry>,
    handle: Arc<SessionHandle>,
    history: Arc<dyn HistoryStore>,
    settings: SessionSettings,
) -> JoinHandle<()> {
    tokio::spawn(run_session(registry, handle, history, settings))
}

async fn run_session(
    registry: Arc<AccountRegistry>,
    handle: Arc<SessionHandle>,
    history: Arc<dyn HistoryStore>,
    settings: SessionSettings,
) {
    let login = handle.login;
    let mut events = handle.session.subscribe();
    let mut connected = false;
    let mut averaging_paused_until: Option<Instant> = None;

    let mut reconnect = interval(settings.reconnect_interval);
    reconnect.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let sweep_every = Duration::from_millis(settings.risk.sweep_interval_ms);
    let mut sweep = interval(sweep_every);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            maybe = events.recv() => {
                let Some(event) = maybe else {
                    debug!(login, "event stream closed");
                    break;
                };
                match event {
                    SessionEvent::Connected => {
                        connected = true;
                        info!(login, server = %handle.server, "session connected");
                        on_connected(&handle, history.as_ref()).await;
                    }
                    SessionEvent::ConnectFailed(reason) => {
                        connected = false;
                        debug!(login, reason, "connect attempt failed");
                    }
                    SessionEvent::Disconnected(reason) => {
                        connected = false;
                        warn!(login, reason, "session dropped, reconnecting");
                    }
                    SessionEvent::OrderUpdate { action, order } => {
                        on_order_update(&handle, history.as_ref(), action, order).await;
                    }
                    SessionEvent::Quote { symbol } => {
                        on_quote(&handle, &symbol).await;
                    }
                }
            }
            _ = reconnect.tick(), if !connected => {
                match handle.session.connect().await {
                    Ok(()) => {}
                    Err(GatewayError::CredentialsInvalid(reason)) => {
                        error!(login, reason, "credentials rejected, abandoning account");
                        handle.session.disconnect().await;
                        handle.projection.teardown();
                        registry.detach(login);
                        return;
                    }
                    Err(err) => warn!(login, %err, "reconnect attempt failed"),
                }
            }
            _ = sweep.tick(), if connected => {
                sweep_pass(&handle, &settings, &mut averaging_paused_until).await;
            }
        }
    }
}

/// Fresh-connect projection rebuild plus history backfill.
async fn on_connected(handle: &SessionHandle, history: &dyn HistoryStore) {
    let login = handle.login;
    handle.projection.force_next();
    if let Err(err) = handle.projection.mark_live() {
        warn!(login, %err, "cache write failed");
    }
    if let Err(err) = handle.projection.write_account(&handle.session.account()) {
        warn!(login, %err, "account projection failed");
    }
    match handle.session.open_orders().await {
        Ok(orders) => {
            if let Err(err) = handle.projection.write_orders_full(&orders) {
                warn!(login, %err, "order projection failed");
            }
        }
        Err(err) => warn!(login, %err, "open order fetch failed"),
    }
    backfill(handle, history).await;
}

/// Pull terminated orders the archive has not seen yet.
///
/// The window starts at the last archived close time (shifted back to the
/// broker clock) and the insert is idempotent, so overlap with past runs is
/// harmless.
async fn backfill(handle: &SessionHandle, history: &dyn HistoryStore) {
    let login = handle.login;
    let from = match history.last_close_time(login) {
        Ok(Some(latest)) => session_time::to_session(latest).max(backfill_epoch()),
        Ok(None) => backfill_epoch(),
        Err(err) => {
            warn!(login, %err, "history cursor lookup failed");
            backfill_epoch()
        }
    };
    let to = session_time::to_session(Utc::now());
    match handle.session.order_history(from, to).await {
        Ok(rows) => {
            let mut inserted = 0usize;
            for row in &rows {
                match history.insert(login, row) {
                    Ok(true) => inserted += 1,
                    Ok(false) => {}
                    Err(err) => {
                        // A dead store would fail every remaining row too;
                        // the next connect retries from the high-water mark.
                        warn!(login, ticket = row.ticket, %err, "history insert failed, aborting backfill");
                        break;
                    }
                }
            }
            if inserted > 0 {
                info!(login, inserted, "order history backfilled");
            }
        }
        Err(err) => warn!(login, %err, "history fetch failed"),
    }
}

async fn on_order_update(
    handle: &SessionHandle,
    history: &dyn HistoryStore,
    action: fxbridge_broker::UpdateAction,
    order: fxbridge_core::OrderSnapshot,
) {
    let login = handle.login;
    if let Err(err) = handle.projection.write_account(&handle.session.account()) {
        warn!(login, %err, "account projection failed");
    }
    if action.closes_order() {
        if let Err(err) = handle.projection.delete_order(order.ticket) {
            warn!(login, ticket = order.ticket, %err, "order eviction failed");
        }
        // With the book empty no quote will move equity again; let the next
        // account write through regardless.
        if matches!(handle.session.open_orders().await, Ok(open) if open.is_empty()) {
            handle.projection.force_next();
        }
    }
    if action.affects_history() {
        if let Err(err) = history.insert(login, &order) {
            warn!(login, ticket = order.ticket, %err, "history insert failed");
        }
    } else if !action.closes_order() {
        if let Err(err) = handle.projection.refresh_orders(std::slice::from_ref(&order)) {
            warn!(login, ticket = order.ticket, %err, "order projection failed");
        }
    }
}

async fn on_quote(handle: &SessionHandle, symbol: &str) {
    let login = handle.login;
    if let Err(err) = handle.projection.write_account(&handle.session.account()) {
        warn!(login, %err, "account projection failed");
    }
    match handle.session.open_orders().await {
        Ok(orders) => {
            let on_symbol: Vec<_> = orders.into_iter().filter(|o| o.symbol == symbol).collect();
            if let Err(err) = handle.projection.refresh_orders(&on_symbol) {
                warn!(login, symbol, %err, "order projection failed");
            }
        }
        Err(err) => warn!(login, %err, "open order fetch failed"),
    }
}

/// Periodic pass: keep the projection TTLs alive, then let the enabled risk
/// managers inspect the book.
async fn sweep_pass(
    handle: &SessionHandle,
    settings: &SessionSettings,
    averaging_paused_until: &mut Option<Instant>,
) {
    let login = handle.login;
    if let Err(err) = handle.projection.refresh_ttls() {
        warn!(login, %err, "projection refresh failed");
    }
    if !handle.manage_stop_loss && !handle.average_losing_positions {
        return;
    }
    let orders = match handle.session.open_orders().await {
        Ok(orders) => orders,
        Err(err) => {
            warn!(login, %err, "open order fetch failed");
            return;
        }
    };

    if handle.manage_stop_loss {
        for order in &orders {
            let Some(quote) = handle.session.quote(&order.symbol) else {
                continue;
            };
            let Some(plan) = plan_stop_update(order, &quote, &settings.risk.stop_management)
            else {
                continue;
            };
            let _permit = handle.submit_lock.lock().await;
            let outcome = submit(
                handle.gateway.order_modify(
                    plan.ticket,
                    order.kind,
                    plan.price,
                    plan.stop_loss,
                    plan.take_profit,
                ),
                settings.command_timeout,
            )
            .await;
            match outcome {
                SubmitOutcome::Ok(updated) => {
                    info!(login, ticket = updated.ticket, stop = %updated.stop_loss, "stop stepped");
                }
                SubmitOutcome::Timeout => {
                    error!(login, ticket = plan.ticket, "stop rewrite timed out");
                }
                SubmitOutcome::Retryable(err) => {
                    warn!(login, ticket = plan.ticket, %err, "stop rewrite refused");
                }
                SubmitOutcome::Fatal(err) => {
                    error!(login, ticket = plan.ticket, %err, "stop rewrite failed fatally");
                }
            }
        }
    }

    if handle.average_losing_positions {
        if averaging_paused_until.is_some_and(|until| Instant::now() < until) {
            return;
        }
        *averaging_paused_until = None;
        let quote_for = |symbol: &str| handle.session.quote(symbol);
        for request in plan_averaging(&orders, quote_for, &settings.risk.loss_averaging) {
            let tag = request.comment.clone();
            let _permit = handle.submit_lock.lock().await;
            let outcome = submit(
                handle.gateway.order_send(request),
                settings.command_timeout,
            )
            .await;
            match outcome {
                SubmitOutcome::Ok(opened) => {
                    info!(login, ticket = opened.ticket, tag, "averaging order opened");
                }
                SubmitOutcome::Timeout => {
                    // The submission may or may not have landed. Back off and
                    // let the lineage tags disambiguate on the next pass.
                    let cooldown =
                        Duration::from_secs(settings.risk.loss_averaging.cooldown_secs);
                    *averaging_paused_until = Some(Instant::now() + cooldown);
                    error!(login, tag, "averaging submission timed out, pausing");
                    break;
                }
                SubmitOutcome::Retryable(err) => {
                    warn!(login, tag, %err, "averaging submission refused");
                }
                SubmitOutcome::Fatal(err) => {
                    error!(login, tag, %err, "averaging submission failed fatally");
                    break;
                }
            }
        }
    }
}
