//! Fundamental data types shared across the entire workspace.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod session_time;

/// Alias for price precision.
pub type Price = Decimal;
/// Alias for lot volumes.
pub type Volume = Decimal;
/// Human-readable market symbols (e.g. `EURUSD`).
pub type Symbol = String;
/// Broker account identifier.
pub type Login = u32;
/// Broker-assigned unique order identifier.
pub type Ticket = i64;

/// Raised when a wire string does not map onto a known enum variant.
#[derive(Debug, Error, Eq, PartialEq)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Market and pending order flavors, numbered like the broker protocol.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum OrderKind {
    Buy = 0,
    Sell = 1,
    BuyLimit = 2,
    SellLimit = 3,
    BuyStop = 4,
    SellStop = 5,
}

impl OrderKind {
    /// True for orders holding a live position (vs. resting pending orders).
    #[must_use]
    pub fn is_market(self) -> bool {
        matches!(self, Self::Buy | Self::Sell)
    }

    /// True for the buy-direction family (market buy and pending buy variants).
    #[must_use]
    pub fn is_buy_side(self) -> bool {
        matches!(self, Self::Buy | Self::BuyLimit | Self::BuyStop)
    }

    /// Numeric code used by the broker protocol and the history table.
    #[must_use]
    pub fn code(self) -> i16 {
        self as i16
    }

    #[must_use]
    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(Self::Buy),
            1 => Some(Self::Sell),
            2 => Some(Self::BuyLimit),
            3 => Some(Self::SellLimit),
            4 => Some(Self::BuyStop),
            5 => Some(Self::SellStop),
            _ => None,
        }
    }

    /// Uppercase wire string used by the instruction queue.
    #[must_use]
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::BuyLimit => "BUYLIMIT",
            Self::SellLimit => "SELLLIMIT",
            Self::BuyStop => "BUYSTOP",
            Self::SellStop => "SELLSTOP",
        }
    }
}

impl FromStr for OrderKind {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            "BUYLIMIT" => Ok(Self::BuyLimit),
            "SELLLIMIT" => Ok(Self::SellLimit),
            "BUYSTOP" => Ok(Self::BuyStop),
            "SELLSTOP" => Ok(Self::SellStop),
            other => Err(UnknownVariant {
                kind: "order type",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Latest bid/ask pair for one symbol.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Quote {
    pub bid: Price,
    pub ask: Price,
}

/// Open-position or pending-order view as pushed by the broker session.
///
/// `open_time`/`close_time` are broker-local; convert through
/// [`session_time::to_utc`] before persisting. `close_price` doubles as the
/// current market price while the order is open.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OrderSnapshot {
    pub ticket: Ticket,
    pub kind: OrderKind,
    pub symbol: Symbol,
    pub open_time: NaiveDateTime,
    pub close_time: NaiveDateTime,
    pub open_price: Price,
    pub close_price: Price,
    pub stop_loss: Price,
    pub take_profit: Price,
    pub commission: Decimal,
    pub swap: Decimal,
    pub volume: Volume,
    pub profit: Decimal,
    pub comment: String,
}

impl OrderSnapshot {
    /// Profit with commission and swap folded in.
    #[must_use]
    pub fn net_profit(&self) -> Decimal {
        self.profit + self.commission + self.swap
    }

    /// Close reason inferred from the broker-side comment tags.
    #[must_use]
    pub fn close_reason(&self) -> &'static str {
        if self.comment.contains("[sl]") {
            "sl"
        } else if self.comment.contains("[tp]") {
            "tp"
        } else {
            ""
        }
    }

    /// True when the order was itself produced by loss-averaging.
    #[must_use]
    pub fn has_lineage_tag(&self) -> bool {
        self.comment.contains(LINEAGE_PREFIX)
    }
}

/// Prefix shared by all loss-averaging lineage tags.
pub const LINEAGE_PREFIX: &str = "[LP";

/// Comment tag marking a loss-averaging order of the given severity level.
#[must_use]
pub fn lineage_tag(level: u32) -> String {
    format!("[LP-{level}]")
}

/// Account financials and identity as projected to the cache.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AccountInfo {
    pub connected: bool,
    pub master: bool,
    pub login: Login,
    pub trade_mode: i32,
    pub leverage: i32,
    pub limit_orders: i32,
    pub balance: Decimal,
    pub credit: Decimal,
    pub profit: Decimal,
    pub equity: Decimal,
    pub margin: Decimal,
    pub margin_free: Decimal,
    pub currency: String,
    pub server: String,
    pub account_name: String,
}

impl AccountInfo {
    /// Equity over margin, as a percentage rounded to two decimals.
    /// Zero when no margin is in use.
    #[must_use]
    pub fn margin_level(&self) -> Decimal {
        if self.margin > Decimal::ZERO {
            round2(self.equity / self.margin * Decimal::ONE_HUNDRED)
        } else {
            Decimal::ZERO
        }
    }
}

/// Two-decimal rounding, midpoints away from zero, as the cache records use.
#[must_use]
pub fn round2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Symbol-specific minimum price increment used for pip-offset arithmetic.
#[must_use]
pub fn pip_size(symbol: &str) -> Decimal {
    if symbol == "XAUUSD" {
        Decimal::new(1, 1)
    } else if symbol.contains("JPY") || symbol == "XAGUSD" {
        Decimal::new(1, 2)
    } else {
        Decimal::new(1, 4)
    }
}

/// Action kinds accepted by the instruction queue.
///
/// The async variants submit to the gateway without waiting for the result.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum InstructionAction {
    Open,
    Modify,
    Close,
    OpenAsync,
    ModifyAsync,
    CloseAsync,
}

impl InstructionAction {
    #[must_use]
    pub fn is_async(self) -> bool {
        matches!(self, Self::OpenAsync | Self::ModifyAsync | Self::CloseAsync)
    }
}

impl FromStr for InstructionAction {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Open" => Ok(Self::Open),
            "Modify" => Ok(Self::Modify),
            "Close" => Ok(Self::Close),
            "OpenAsync" => Ok(Self::OpenAsync),
            "ModifyAsync" => Ok(Self::ModifyAsync),
            "CloseAsync" => Ok(Self::CloseAsync),
            other => Err(UnknownVariant {
                kind: "action",
                value: other.to_string(),
            }),
        }
    }
}

/// One row of the external instruction queue.
///
/// String fields stay unparsed here: an unknown action or order type must
/// surface as a reported execution error, not as a fetch failure. Empty
/// string / zero means "no filter" for the optional fields.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Instruction {
    pub id: i64,
    pub login: Login,
    pub action: String,
    pub symbol: Symbol,
    pub order_type: String,
    pub volume: Volume,
    pub price: Price,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub comment: String,
    pub ticket: Ticket,
}

impl Instruction {
    /// Blank instruction addressed to one account; fields default to "no filter".
    #[must_use]
    pub fn new(login: Login, action: &str) -> Self {
        Self {
            id: 0,
            login,
            action: action.to_string(),
            symbol: String::new(),
            order_type: String::new(),
            volume: Decimal::ZERO,
            price: Decimal::ZERO,
            stop_loss: Decimal::ZERO,
            take_profit: Decimal::ZERO,
            comment: String::new(),
            ticket: 0,
        }
    }

    /// True when `order` survives every non-default filter of this instruction.
    #[must_use]
    pub fn matches(&self, order: &OrderSnapshot) -> bool {
        if self.ticket > 0 && self.ticket != order.ticket {
            return false;
        }
        if !self.symbol.is_empty() && self.symbol != order.symbol {
            return false;
        }
        if !self.order_type.is_empty() {
            match self.order_type.parse::<OrderKind>() {
                Ok(kind) if kind == order.kind => {}
                _ => return false,
            }
        }
        if !self.comment.is_empty() && self.comment != order.comment {
            return false;
        }
        if self.volume > Decimal::ZERO && self.volume != order.volume {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn order(symbol: &str, kind: OrderKind) -> OrderSnapshot {
        let t = NaiveDate::from_ymd_opt(2024, 5, 10)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        OrderSnapshot {
            ticket: 1001,
            kind,
            symbol: symbol.to_string(),
            open_time: t,
            close_time: t,
            open_price: dec!(1.1000),
            close_price: dec!(1.1010),
            stop_loss: Decimal::ZERO,
            take_profit: Decimal::ZERO,
            commission: dec!(-0.5),
            swap: dec!(-0.1),
            volume: dec!(0.10),
            profit: dec!(10.0),
            comment: String::new(),
        }
    }

    #[test]
    fn pip_size_matches_symbol_families() {
        assert_eq!(pip_size("EURUSD"), dec!(0.0001));
        assert_eq!(pip_size("USDJPY"), dec!(0.01));
        assert_eq!(pip_size("XAUUSD"), dec!(0.1));
        assert_eq!(pip_size("XAGUSD"), dec!(0.01));
    }

    #[test]
    fn order_kind_wire_round_trip() {
        for kind in [
            OrderKind::Buy,
            OrderKind::Sell,
            OrderKind::BuyLimit,
            OrderKind::SellLimit,
            OrderKind::BuyStop,
            OrderKind::SellStop,
        ] {
            assert_eq!(kind.as_wire().parse::<OrderKind>().unwrap(), kind);
            assert_eq!(OrderKind::from_code(kind.code()).unwrap(), kind);
        }
        assert!("buy".parse::<OrderKind>().is_err());
    }

    #[test]
    fn close_reason_reads_comment_tags() {
        let mut o = order("EURUSD", OrderKind::Buy);
        assert_eq!(o.close_reason(), "");
        o.comment = "closed [sl]".into();
        assert_eq!(o.close_reason(), "sl");
        o.comment = "closed [tp]".into();
        assert_eq!(o.close_reason(), "tp");
    }

    #[test]
    fn net_profit_folds_costs() {
        let o = order("EURUSD", OrderKind::Buy);
        assert_eq!(o.net_profit(), dec!(9.4));
    }

    #[test]
    fn lineage_tags() {
        assert_eq!(lineage_tag(2), "[LP-2]");
        let mut o = order("EURUSD", OrderKind::Buy);
        assert!(!o.has_lineage_tag());
        o.comment = "[LP-3]".into();
        assert!(o.has_lineage_tag());
    }

    #[test]
    fn margin_level_rounds_away_from_zero() {
        let info = AccountInfo {
            connected: true,
            master: true,
            login: 123,
            trade_mode: 0,
            leverage: 100,
            limit_orders: 50,
            balance: dec!(1000),
            credit: Decimal::ZERO,
            profit: Decimal::ZERO,
            equity: dec!(1000.125),
            margin: dec!(100),
            margin_free: dec!(900),
            currency: "USD".into(),
            server: "Demo".into(),
            account_name: "test".into(),
        };
        assert_eq!(info.margin_level(), dec!(1000.13));
        let no_margin = AccountInfo {
            margin: Decimal::ZERO,
            ..info
        };
        assert_eq!(no_margin.margin_level(), Decimal::ZERO);
    }

    #[test]
    fn instruction_filters_ignore_defaults() {
        let ins = Instruction::new(123, "Close");
        let o = order("EURUSD", OrderKind::Buy);
        assert!(ins.matches(&o));

        let mut by_symbol = Instruction::new(123, "Close");
        by_symbol.symbol = "GBPUSD".into();
        assert!(!by_symbol.matches(&o));

        let mut by_kind = Instruction::new(123, "Close");
        by_kind.order_type = "SELL".into();
        assert!(!by_kind.matches(&o));
        by_kind.order_type = "BUY".into();
        assert!(by_kind.matches(&o));

        let mut by_volume = Instruction::new(123, "Close");
        by_volume.volume = dec!(0.20);
        assert!(!by_volume.matches(&o));
    }
}
