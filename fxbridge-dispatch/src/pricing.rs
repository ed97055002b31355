//! Pip-offset to absolute-price translation for instruction targets.

use fxbridge_core::{pip_size, OrderKind, Price};
use rust_decimal::Decimal;

/// Resolve an instruction's stop-loss/take-profit pip offsets against an
/// entry price. Offsets of zero stay unset. The stop sits on the losing side
/// of the entry and the take-profit on the winning side, per order family.
#[must_use]
pub fn plan_targets(
    kind: OrderKind,
    symbol: &str,
    price: Price,
    stop_pips: Decimal,
    profit_pips: Decimal,
) -> (Price, Price) {
    let pip = pip_size(symbol);
    let (stop, profit) = if kind.is_buy_side() {
        (price - stop_pips * pip, price + profit_pips * pip)
    } else {
        (price + stop_pips * pip, price - profit_pips * pip)
    };
    let stop = if stop_pips > Decimal::ZERO {
        stop
    } else {
        Decimal::ZERO
    };
    let profit = if profit_pips > Decimal::ZERO {
        profit
    } else {
        Decimal::ZERO
    };
    (stop, profit)
}
