//! Autonomous risk managers: stepped stop management and loss averaging.
//!
//! Both are pure planners; the reactor sweep owns the clock, the submission
//! lock and the gateway calls. All distances are expressed in pips of the
//! order's symbol so one parameter set covers every symbol family.

use fxbridge_broker::OpenRequest;
use fxbridge_config::{LossAveragingConfig, StopManagementConfig};
use fxbridge_core::{lineage_tag, pip_size, OrderSnapshot, Price, Quote, Ticket};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// One planned stop/take-profit rewrite.
#[derive(Clone, Debug, PartialEq)]
pub struct StopPlan {
    pub ticket: Ticket,
    pub price: Price,
    pub stop_loss: Price,
    pub take_profit: Price,
}

/// Signed profit distance of a market order, in pips. Buys are measured
/// against the bid, sells against the ask.
fn profit_pips(order: &OrderSnapshot, quote: &Quote) -> Decimal {
    let pip = pip_size(&order.symbol);
    if order.kind.is_buy_side() {
        (quote.bid - order.open_price) / pip
    } else {
        (order.open_price - quote.ask) / pip
    }
}

/// Decide whether a market order's stop should be stepped up.
///
/// Only orders that already carry a stop are managed; placing an initial
/// stop is the trader's call. Below `first_level_pips` of profit nothing
/// happens. At the first level the stop moves to `first_stop_pips` past the
/// entry; each further `step_pips` of profit drags it one step behind the
/// price. A rewrite is only proposed when it improves the current stop by at
/// least `min_improvement_pips`.
pub fn plan_stop_update(
    order: &OrderSnapshot,
    quote: &Quote,
    cfg: &StopManagementConfig,
) -> Option<StopPlan> {
    if !order.kind.is_market() || order.stop_loss == Decimal::ZERO {
        return None;
    }
    let profit = profit_pips(order, quote);
    if profit < cfg.min_profit_pips || profit < cfg.first_level_pips {
        return None;
    }

    let stop_distance = if profit < cfg.first_level_pips + cfg.step_pips {
        cfg.first_stop_pips
    } else {
        ((profit / cfg.step_pips).floor() - Decimal::ONE) * cfg.step_pips
    };

    let pip = pip_size(&order.symbol);
    let (stop_loss, take_profit) = if order.kind.is_buy_side() {
        let sl = order.open_price + stop_distance * pip;
        (sl, sl + cfg.paired_take_profit_pips * pip)
    } else {
        let sl = order.open_price - stop_distance * pip;
        (sl, sl - cfg.paired_take_profit_pips * pip)
    };

    let improvement = if order.kind.is_buy_side() {
        stop_loss - order.stop_loss
    } else {
        order.stop_loss - stop_loss
    };
    if improvement < cfg.min_improvement_pips * pip {
        return None;
    }

    Some(StopPlan {
        ticket: order.ticket,
        // Market orders must echo their entry price on modification.
        price: order.open_price,
        stop_loss,
        take_profit,
    })
}

/// Decide which averaging orders the open book calls for.
///
/// Every losing stopped market position that is not itself an averaging
/// order maps its adverse excursion to a severity level (one per
/// `level_gap_pips`); a level that has no tagged order yet gets one, same
/// symbol, side, volume and stop/take-profit as the parent. An order within
/// `stop_buffer_pips` of its own stop is about to resolve on its own and is
/// left alone. Tags make the pass idempotent across sweeps.
pub fn plan_averaging(
    orders: &[OrderSnapshot],
    quote_for: impl Fn(&str) -> Option<Quote>,
    cfg: &LossAveragingConfig,
) -> Vec<OpenRequest> {
    let mut requests: Vec<OpenRequest> = Vec::new();
    for order in orders {
        if !order.kind.is_market()
            || order.stop_loss == Decimal::ZERO
            || order.has_lineage_tag()
        {
            continue;
        }
        let Some(quote) = quote_for(&order.symbol) else {
            continue;
        };
        let adverse = -profit_pips(order, &quote);
        if adverse < cfg.level_gap_pips {
            continue;
        }
        let pip = pip_size(&order.symbol);
        let to_stop = if order.kind.is_buy_side() {
            (quote.bid - order.stop_loss) / pip
        } else {
            (order.stop_loss - quote.ask) / pip
        };
        if to_stop < cfg.stop_buffer_pips {
            continue;
        }
        let level = (adverse / cfg.level_gap_pips)
            .floor()
            .to_u32()
            .unwrap_or(u32::MAX);
        let tag = lineage_tag(level);
        let covered = orders
            .iter()
            .any(|o| o.symbol == order.symbol && o.kind == order.kind && o.comment.contains(&tag))
            || requests
                .iter()
                .any(|r| r.symbol == order.symbol && r.kind == order.kind && r.comment == tag);
        if covered {
            continue;
        }

        let price = if order.kind.is_buy_side() {
            quote.ask
        } else {
            quote.bid
        };
        requests.push(OpenRequest {
            symbol: order.symbol.clone(),
            kind: order.kind,
            volume: order.volume,
            price,
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
            comment: tag,
        });
    }
    requests
}
