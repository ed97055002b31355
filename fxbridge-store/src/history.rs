//! Durable archive of terminated orders.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use fxbridge_core::{session_time, Login, OrderSnapshot};
use rusqlite::{params, Connection, OptionalExtension};

use crate::StoreResult;

/// Append-only archive keyed by broker ticket.
pub trait HistoryStore: Send + Sync {
    /// Insert one terminated order; returns false when the ticket already
    /// exists. Times in the snapshot are broker-local and are converted to
    /// UTC before persisting.
    fn insert(&self, login: Login, order: &OrderSnapshot) -> StoreResult<bool>;

    /// Close time (UTC) of the most recent archived order for one account.
    fn last_close_time(&self, login: Login) -> StoreResult<Option<DateTime<Utc>>>;
}

/// SQLite-backed [`HistoryStore`].
pub struct SqliteHistoryStore {
    conn: Mutex<Connection>,
}

impl SqliteHistoryStore {
    pub fn new(path: impl AsRef<std::path::Path>) -> StoreResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn new_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS account_orders (
                ticket      INTEGER PRIMARY KEY,
                login       INTEGER NOT NULL,
                order_type  INTEGER NOT NULL,
                symbol      TEXT NOT NULL,
                open_time   TEXT NOT NULL,
                close_time  TEXT NOT NULL,
                open_price  TEXT NOT NULL,
                close_price TEXT NOT NULL,
                stop_loss   TEXT NOT NULL,
                take_profit TEXT NOT NULL,
                commission  TEXT NOT NULL,
                swap        TEXT NOT NULL,
                volume      TEXT NOT NULL,
                profit      TEXT NOT NULL,
                net_profit  TEXT NOT NULL,
                reason      TEXT NOT NULL,
                comment     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_account_orders_login
                ON account_orders (login, close_time);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl HistoryStore for SqliteHistoryStore {
    fn insert(&self, login: Login, order: &OrderSnapshot) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "INSERT INTO account_orders (
                ticket, login, order_type, symbol, open_time, close_time,
                open_price, close_price, stop_loss, take_profit,
                commission, swap, volume, profit, net_profit, reason, comment
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
             ON CONFLICT(ticket) DO NOTHING",
            params![
                order.ticket,
                login,
                order.kind.code(),
                order.symbol,
                session_time::to_utc(order.open_time),
                session_time::to_utc(order.close_time),
                order.open_price.to_string(),
                order.close_price.to_string(),
                order.stop_loss.to_string(),
                order.take_profit.to_string(),
                order.commission.to_string(),
                order.swap.to_string(),
                order.volume.to_string(),
                order.profit.to_string(),
                order.net_profit().to_string(),
                order.close_reason(),
                order.comment,
            ],
        )?;
        Ok(changed > 0)
    }

    fn last_close_time(&self, login: Login) -> StoreResult<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().unwrap();
        let latest = conn
            .query_row(
                "SELECT MAX(close_time) FROM account_orders WHERE login = ?1",
                params![login],
                |row| row.get::<_, Option<DateTime<Utc>>>(0),
            )
            .optional()?
            .flatten();
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use fxbridge_core::OrderKind;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn closed_order(ticket: i64, close_day: u32) -> OrderSnapshot {
        let open = NaiveDate::from_ymd_opt(2024, 1, close_day)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        let close = NaiveDate::from_ymd_opt(2024, 1, close_day)
            .unwrap()
            .and_hms_opt(17, 30, 0)
            .unwrap();
        OrderSnapshot {
            ticket,
            kind: OrderKind::Sell,
            symbol: "GBPUSD".into(),
            open_time: open,
            close_time: close,
            open_price: dec!(1.2700),
            close_price: dec!(1.2650),
            stop_loss: Decimal::ZERO,
            take_profit: Decimal::ZERO,
            commission: dec!(-0.7),
            swap: dec!(-0.2),
            volume: dec!(0.50),
            profit: dec!(250.0),
            comment: "closed [tp]".into(),
        }
    }

    #[test]
    fn insert_is_idempotent_per_ticket() {
        let store = SqliteHistoryStore::new_in_memory().unwrap();
        assert!(store.insert(501, &closed_order(1, 10)).unwrap());
        assert!(!store.insert(501, &closed_order(1, 10)).unwrap());
        assert!(store.insert(501, &closed_order(2, 11)).unwrap());
    }

    #[test]
    fn archive_survives_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        {
            let store = SqliteHistoryStore::new(&path).unwrap();
            assert!(store.insert(501, &closed_order(1, 10)).unwrap());
        }
        let store = SqliteHistoryStore::new(&path).unwrap();
        assert!(!store.insert(501, &closed_order(1, 10)).unwrap());
        assert!(store.last_close_time(501).unwrap().is_some());
    }

    #[test]
    fn last_close_time_is_per_login_and_utc() {
        let store = SqliteHistoryStore::new_in_memory().unwrap();
        assert_eq!(store.last_close_time(501).unwrap(), None);

        store.insert(501, &closed_order(1, 10)).unwrap();
        store.insert(501, &closed_order(2, 12)).unwrap();
        store.insert(502, &closed_order(3, 20)).unwrap();

        // January is winter time: broker clock runs two hours ahead of UTC.
        let expected = NaiveDate::from_ymd_opt(2024, 1, 12)
            .unwrap()
            .and_hms_opt(15, 30, 0)
            .unwrap()
            .and_utc();
        assert_eq!(store.last_close_time(501).unwrap(), Some(expected));
    }
}
