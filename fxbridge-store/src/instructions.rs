//! Shared instruction queue written by upstream services.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use fxbridge_core::{Instruction, Login, Ticket};
use rusqlite::{params, Connection, Row, ToSql};
use rust_decimal::Decimal;

use crate::StoreResult;

/// Poll-and-acknowledge view of the instruction queue.
pub trait InstructionStore: Send + Sync {
    /// Append an instruction; returns its queue id.
    fn enqueue(&self, instruction: &Instruction) -> StoreResult<i64>;

    /// Unexecuted instructions created inside the lookback window and
    /// addressed to one of the given accounts, oldest first.
    fn fetch_pending(&self, logins: &[Login], lookback: Duration) -> StoreResult<Vec<Instruction>>;

    /// Record the outcome of one instruction. Returns false if the row was
    /// already acknowledged, so results are reported at most once.
    fn mark_executed(
        &self,
        id: i64,
        ticket: Option<Ticket>,
        error: Option<&str>,
    ) -> StoreResult<bool>;
}

/// SQLite-backed [`InstructionStore`].
pub struct SqliteInstructionStore {
    conn: Mutex<Connection>,
}

impl SqliteInstructionStore {
    pub fn new(path: impl AsRef<std::path::Path>) -> StoreResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn new_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Ticket and error recorded for an acknowledged instruction, if any.
    pub fn outcome(&self, id: i64) -> StoreResult<Option<(Option<Ticket>, Option<String>)>> {
        use rusqlite::OptionalExtension;
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT ticket, error FROM instructions
                 WHERE id = ?1 AND executed_at IS NOT NULL",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS instructions (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                login       INTEGER NOT NULL,
                action      TEXT NOT NULL,
                symbol      TEXT,
                order_type  TEXT,
                volume      TEXT,
                price       TEXT,
                stop_loss   TEXT,
                take_profit TEXT,
                comment     TEXT,
                ticket      INTEGER,
                created_at  TEXT NOT NULL,
                executed_at TEXT,
                error       TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_instructions_pending
                ON instructions (executed_at, created_at);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

/// Optional decimal column; missing or unparsable values fall back to zero
/// so a malformed row surfaces as a filter mismatch, not a fetch failure.
fn decimal_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: Option<String> = row.get(idx)?;
    Ok(raw.and_then(|s| s.parse().ok()).unwrap_or_default())
}

fn text_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<String> {
    Ok(row.get::<_, Option<String>>(idx)?.unwrap_or_default())
}

fn row_to_instruction(row: &Row<'_>) -> rusqlite::Result<Instruction> {
    Ok(Instruction {
        id: row.get(0)?,
        login: row.get(1)?,
        action: text_column(row, 2)?,
        symbol: text_column(row, 3)?.to_uppercase(),
        order_type: text_column(row, 4)?,
        volume: decimal_column(row, 5)?,
        price: decimal_column(row, 6)?,
        stop_loss: decimal_column(row, 7)?,
        take_profit: decimal_column(row, 8)?,
        comment: text_column(row, 9)?,
        ticket: row.get::<_, Option<Ticket>>(10)?.unwrap_or_default(),
    })
}

impl InstructionStore for SqliteInstructionStore {
    fn enqueue(&self, instruction: &Instruction) -> StoreResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO instructions (
                login, action, symbol, order_type, volume, price,
                stop_loss, take_profit, comment, ticket, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                instruction.login,
                instruction.action,
                instruction.symbol,
                instruction.order_type,
                instruction.volume.to_string(),
                instruction.price.to_string(),
                instruction.stop_loss.to_string(),
                instruction.take_profit.to_string(),
                instruction.comment,
                instruction.ticket,
                Utc::now(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn fetch_pending(&self, logins: &[Login], lookback: Duration) -> StoreResult<Vec<Instruction>> {
        if logins.is_empty() {
            return Ok(Vec::new());
        }
        let cutoff: DateTime<Utc> = Utc::now() - lookback;
        let placeholders = vec!["?"; logins.len()].join(", ");
        let sql = format!(
            "SELECT id, login, action, symbol, order_type, volume, price,
                    stop_loss, take_profit, comment, ticket
             FROM instructions
             WHERE executed_at IS NULL AND created_at > ? AND login IN ({placeholders})
             ORDER BY created_at ASC, id ASC"
        );

        let mut values: Vec<Box<dyn ToSql>> = vec![Box::new(cutoff)];
        values.extend(logins.iter().map(|login| Box::new(*login) as Box<dyn ToSql>));
        let bind: Vec<&dyn ToSql> = values.iter().map(AsRef::as_ref).collect();

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(&bind[..], row_to_instruction)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn mark_executed(
        &self,
        id: i64,
        ticket: Option<Ticket>,
        error: Option<&str>,
    ) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE instructions
             SET executed_at = ?1, ticket = COALESCE(?2, ticket), error = ?3
             WHERE id = ?4 AND executed_at IS NULL",
            params![Utc::now(), ticket, error, id],
        )?;
        Ok(changed > 0)
    }
}
