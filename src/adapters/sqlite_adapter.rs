//! SQLite ledger adapter.
//!
//! Every [`LedgerStore::atomically`] unit runs inside `BEGIN IMMEDIATE`, which
//! takes the database write lock up front: concurrent writers queue on the
//! busy timeout instead of interleaving read-then-write cycles. Decimals are
//! stored as TEXT and timestamps as RFC 3339 UTC TEXT.

use crate::domain::cash::{
    CashAccount, CashAccountKey, CashMovementKind, CashTransaction, NewCashMovement,
};
use crate::domain::config_validation::{DEFAULT_BUSY_TIMEOUT_MS, DEFAULT_POOL_SIZE};
use crate::domain::error::JournalError;
use crate::domain::money::{Money, Price, Quantity};
use crate::domain::position::{
    CumulativePosition, NewPositionTransaction, PositionTransaction, TransactionKind,
};
use crate::domain::query::{PositionFilter, PositionView, TransactionFilter};
use crate::domain::reference::{
    Currency, Instrument, InvestmentAccount, Market, NewCurrency, NewInstrument,
    NewInvestmentAccount, NewMarket, NewPlatform, Platform,
};
use crate::ports::config_port::ConfigPort;
use crate::ports::ledger_port::{LedgerSession, LedgerStore};
use crate::ports::reference_port::ReferencePort;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{ToSql, Type};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params, params_from_iter};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS currency (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code TEXT NOT NULL UNIQUE,
    title TEXT NOT NULL,
    symbol TEXT
);
CREATE TABLE IF NOT EXISTS market (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code TEXT NOT NULL,
    title TEXT NOT NULL,
    currency_id INTEGER NOT NULL REFERENCES currency(id)
);
CREATE TABLE IF NOT EXISTS platform (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    description TEXT
);
CREATE TABLE IF NOT EXISTS instrument (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code TEXT NOT NULL UNIQUE,
    title TEXT NOT NULL,
    market_id INTEGER NOT NULL REFERENCES market(id),
    is_active INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS investment_account (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    owner_id INTEGER NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS cash_account (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id INTEGER NOT NULL,
    currency_id INTEGER NOT NULL REFERENCES currency(id),
    platform_id INTEGER NOT NULL REFERENCES platform(id),
    label TEXT,
    balance TEXT NOT NULL DEFAULT '0'
);
CREATE UNIQUE INDEX IF NOT EXISTS ux_cash_account_key
    ON cash_account(owner_id, currency_id, platform_id, COALESCE(label, ''));
CREATE TABLE IF NOT EXISTS cash_transaction (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cash_account_id INTEGER NOT NULL REFERENCES cash_account(id),
    kind TEXT NOT NULL CHECK (kind IN ('DEPOSIT', 'WITHDRAW', 'DIVIDEND')),
    amount TEXT NOT NULL,
    executed_at TEXT NOT NULL,
    description TEXT,
    is_active INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_cash_transaction_account ON cash_transaction(cash_account_id);
CREATE TABLE IF NOT EXISTS cumulative_position (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    instrument_id INTEGER NOT NULL REFERENCES instrument(id),
    investment_account_id INTEGER NOT NULL REFERENCES investment_account(id),
    quantity TEXT NOT NULL,
    avg_cost TEXT NOT NULL,
    total_buys TEXT NOT NULL,
    total_sells TEXT NOT NULL,
    total_buy_amount TEXT NOT NULL,
    total_sell_amount TEXT NOT NULL,
    total_commission_cost TEXT NOT NULL,
    is_completed INTEGER NOT NULL DEFAULT 0,
    first_transaction_at TEXT NOT NULL,
    last_transaction_at TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS ux_open_position
    ON cumulative_position(instrument_id, investment_account_id) WHERE is_completed = 0;
CREATE TABLE IF NOT EXISTS position_transaction (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cumulative_position_id INTEGER NOT NULL REFERENCES cumulative_position(id),
    instrument_id INTEGER NOT NULL REFERENCES instrument(id),
    investment_account_id INTEGER NOT NULL REFERENCES investment_account(id),
    platform_id INTEGER NOT NULL REFERENCES platform(id),
    kind TEXT NOT NULL CHECK (kind IN ('BUY', 'SELL')),
    price TEXT NOT NULL,
    quantity TEXT NOT NULL,
    commission TEXT NOT NULL,
    executed_at TEXT NOT NULL,
    executed_by INTEGER NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    notes TEXT NOT NULL DEFAULT '',
    time_frame TEXT,
    pattern TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_position_transaction_position
    ON position_transaction(cumulative_position_id);
CREATE INDEX IF NOT EXISTS idx_position_transaction_executed_at
    ON position_transaction(executed_at, id);
";

const POSITION_COLUMNS: &str = "p.id, p.instrument_id, p.investment_account_id, p.quantity, \
     p.avg_cost, p.total_buys, p.total_sells, p.total_buy_amount, p.total_sell_amount, \
     p.total_commission_cost, p.is_completed, p.first_transaction_at, p.last_transaction_at";

const POSITION_VIEW_FROM: &str = "FROM cumulative_position p \
     JOIN instrument i ON i.id = p.instrument_id \
     JOIN market m ON m.id = i.market_id";

const TRANSACTION_COLUMNS: &str = "t.id, t.cumulative_position_id, t.instrument_id, \
     t.investment_account_id, t.platform_id, t.kind, t.price, t.quantity, t.commission, \
     t.executed_at, t.executed_by, t.description, t.notes, t.time_frame, t.pattern, \
     t.is_active, t.created_at";

const CASH_ACCOUNT_COLUMNS: &str = "id, owner_id, currency_id, platform_id, label, balance";

const CASH_TRANSACTION_SELECT: &str = "SELECT c.id, c.cash_account_id, a.owner_id, \
     a.currency_id, a.platform_id, c.kind, c.amount, c.executed_at, c.description, c.is_active \
     FROM cash_transaction c JOIN cash_account a ON a.id = c.cash_account_id";

pub struct SqliteAdapter {
    pool: Pool<SqliteConnectionManager>,
}

fn pool_err(e: r2d2::Error) -> JournalError {
    JournalError::Database {
        reason: e.to_string(),
    }
}

fn query_err(e: rusqlite::Error) -> JournalError {
    JournalError::DatabaseQuery {
        reason: e.to_string(),
    }
}

/// Unique-index conflicts become `ConstraintViolation`; everything else is a query error.
fn write_err(entity: &'static str) -> impl Fn(rusqlite::Error) -> JournalError {
    move |e| {
        if let rusqlite::Error::SqliteFailure(err, _) = &e {
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE {
                return JournalError::ConstraintViolation {
                    entity: entity.to_string(),
                    reason: e.to_string(),
                };
            }
        }
        query_err(e)
    }
}

fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn conversion_failure<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn decimal_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let s: String = row.get(idx)?;
    Decimal::from_str(&s).map_err(|e| conversion_failure(idx, e))
}

fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_failure(idx, e))
}

fn optional_timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| conversion_failure(idx, e))
    })
    .transpose()
}

/// Maps `POSITION_COLUMNS` starting at column 0.
fn position_from_row(row: &Row<'_>) -> rusqlite::Result<CumulativePosition> {
    Ok(CumulativePosition {
        id: row.get(0)?,
        instrument_id: row.get(1)?,
        investment_account_id: row.get(2)?,
        quantity: Quantity::new(decimal_at(row, 3)?),
        avg_cost: Price::new(decimal_at(row, 4)?),
        total_buys: Quantity::new(decimal_at(row, 5)?),
        total_sells: Quantity::new(decimal_at(row, 6)?),
        total_buy_amount: Money::new(decimal_at(row, 7)?),
        total_sell_amount: Money::new(decimal_at(row, 8)?),
        total_commission_cost: Money::new(decimal_at(row, 9)?),
        is_completed: row.get(10)?,
        first_transaction_at: timestamp_at(row, 11)?,
        last_transaction_at: optional_timestamp_at(row, 12)?,
    })
}

/// `POSITION_COLUMNS` followed by instrument code, market id and market code.
fn position_view_from_row(row: &Row<'_>) -> rusqlite::Result<PositionView> {
    let position = position_from_row(row)?;
    PositionView::new(position, row.get(13)?, row.get(14)?, row.get(15)?)
        .map_err(|e| conversion_failure(3, e))
}

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<PositionTransaction> {
    let kind: String = row.get(5)?;
    Ok(PositionTransaction {
        id: row.get(0)?,
        cumulative_position_id: row.get(1)?,
        instrument_id: row.get(2)?,
        investment_account_id: row.get(3)?,
        platform_id: row.get(4)?,
        kind: TransactionKind::from_str(&kind).map_err(|e| conversion_failure(5, e))?,
        price: Price::new(decimal_at(row, 6)?),
        quantity: Quantity::new(decimal_at(row, 7)?),
        commission: Money::new(decimal_at(row, 8)?),
        executed_at: timestamp_at(row, 9)?,
        executed_by: row.get(10)?,
        description: row.get(11)?,
        notes: row.get(12)?,
        time_frame: row.get(13)?,
        pattern: row.get(14)?,
        is_active: row.get(15)?,
        created_at: timestamp_at(row, 16)?,
    })
}

fn cash_account_from_row(row: &Row<'_>) -> rusqlite::Result<CashAccount> {
    Ok(CashAccount {
        id: row.get(0)?,
        key: CashAccountKey {
            owner_id: row.get(1)?,
            currency_id: row.get(2)?,
            platform_id: row.get(3)?,
            label: row.get(4)?,
        },
        balance: Money::new(decimal_at(row, 5)?),
    })
}

fn cash_transaction_from_row(row: &Row<'_>) -> rusqlite::Result<CashTransaction> {
    let kind: String = row.get(5)?;
    Ok(CashTransaction {
        id: row.get(0)?,
        cash_account_id: row.get(1)?,
        owner_id: row.get(2)?,
        currency_id: row.get(3)?,
        platform_id: row.get(4)?,
        kind: CashMovementKind::from_str(&kind).map_err(|e| conversion_failure(5, e))?,
        amount: Money::new(decimal_at(row, 6)?),
        executed_at: timestamp_at(row, 7)?,
        description: row.get(8)?,
        is_active: row.get(9)?,
    })
}

fn collect<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>, JournalError> {
    rows.collect::<rusqlite::Result<Vec<T>>>().map_err(query_err)
}

fn row_exists(conn: &Connection, table: &str, id: i64) -> Result<bool, JournalError> {
    conn.query_row(
        &format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE id = ?1)"),
        params![id],
        |row| row.get(0),
    )
    .map_err(query_err)
}

impl SqliteAdapter {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, JournalError> {
        let db_path =
            config
                .get_string("sqlite", "path")
                .ok_or_else(|| JournalError::ConfigMissing {
                    section: "sqlite".into(),
                    key: "path".into(),
                })?;

        let pool_size = config.get_int("sqlite", "pool_size", DEFAULT_POOL_SIZE) as u32;
        let busy_timeout =
            config.get_int("sqlite", "busy_timeout_ms", DEFAULT_BUSY_TIMEOUT_MS).max(0) as u64;

        Self::open(db_path, pool_size, Duration::from_millis(busy_timeout))
    }

    pub fn open<P: AsRef<Path>>(
        path: P,
        pool_size: u32,
        busy_timeout: Duration,
    ) -> Result<Self, JournalError> {
        let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")
        });
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(pool_err)?;

        Ok(Self { pool })
    }

    /// A private in-memory database. The pool holds a single connection, since
    /// every new connection would see an empty database.
    pub fn in_memory() -> Result<Self, JournalError> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(pool_err)?;

        Ok(Self { pool })
    }

    fn connection(&self) -> Result<PooledConnection<SqliteConnectionManager>, JournalError> {
        self.pool.get().map_err(pool_err)
    }
}

struct SqliteSession<'c> {
    conn: &'c Connection,
}

impl LedgerSession for SqliteSession<'_> {
    fn instrument(&mut self, id: i64) -> Result<Option<Instrument>, JournalError> {
        instrument_by_id(self.conn, id)
    }

    fn market(&mut self, id: i64) -> Result<Option<Market>, JournalError> {
        self.conn
            .query_row(
                "SELECT id, code, title, currency_id FROM market WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Market {
                        id: row.get(0)?,
                        code: row.get(1)?,
                        title: row.get(2)?,
                        currency_id: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(query_err)
    }

    fn platform(&mut self, id: i64) -> Result<Option<Platform>, JournalError> {
        self.conn
            .query_row(
                "SELECT id, title, description FROM platform WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Platform {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        description: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(query_err)
    }

    fn investment_account(&mut self, id: i64) -> Result<Option<InvestmentAccount>, JournalError> {
        self.conn
            .query_row(
                "SELECT id, title, owner_id, is_active FROM investment_account WHERE id = ?1",
                params![id],
                |row| {
                    Ok(InvestmentAccount {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        owner_id: row.get(2)?,
                        is_active: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(query_err)
    }

    fn currency_exists(&mut self, id: i64) -> Result<bool, JournalError> {
        row_exists(self.conn, "currency", id)
    }

    fn lock_open_position(
        &mut self,
        instrument_id: i64,
        investment_account_id: i64,
    ) -> Result<Option<CumulativePosition>, JournalError> {
        // The IMMEDIATE transaction already holds the write lock.
        self.conn
            .query_row(
                &format!(
                    "SELECT {POSITION_COLUMNS} FROM cumulative_position p \
                     WHERE p.instrument_id = ?1 AND p.investment_account_id = ?2 \
                     AND p.is_completed = 0"
                ),
                params![instrument_id, investment_account_id],
                position_from_row,
            )
            .optional()
            .map_err(query_err)
    }

    fn insert_position(
        &mut self,
        instrument_id: i64,
        investment_account_id: i64,
        opened_at: DateTime<Utc>,
    ) -> Result<CumulativePosition, JournalError> {
        let zero = Decimal::ZERO.to_string();
        self.conn
            .execute(
                "INSERT INTO cumulative_position (instrument_id, investment_account_id, quantity, \
                 avg_cost, total_buys, total_sells, total_buy_amount, total_sell_amount, \
                 total_commission_cost, is_completed, first_transaction_at) \
                 VALUES (?1, ?2, ?3, ?3, ?3, ?3, ?3, ?3, ?3, 0, ?4)",
                params![instrument_id, investment_account_id, zero, timestamp(&opened_at)],
            )
            .map_err(write_err("cumulative_position"))?;
        Ok(CumulativePosition::open(
            self.conn.last_insert_rowid(),
            instrument_id,
            investment_account_id,
            opened_at,
        ))
    }

    fn update_position(&mut self, position: &CumulativePosition) -> Result<(), JournalError> {
        self.conn
            .execute(
                "UPDATE cumulative_position SET quantity = ?2, avg_cost = ?3, total_buys = ?4, \
                 total_sells = ?5, total_buy_amount = ?6, total_sell_amount = ?7, \
                 total_commission_cost = ?8, is_completed = ?9, first_transaction_at = ?10, \
                 last_transaction_at = ?11 WHERE id = ?1",
                params![
                    position.id,
                    position.quantity.to_string(),
                    position.avg_cost.to_string(),
                    position.total_buys.to_string(),
                    position.total_sells.to_string(),
                    position.total_buy_amount.to_string(),
                    position.total_sell_amount.to_string(),
                    position.total_commission_cost.to_string(),
                    position.is_completed,
                    timestamp(&position.first_transaction_at),
                    position.last_transaction_at.as_ref().map(timestamp),
                ],
            )
            .map_err(write_err("cumulative_position"))?;
        Ok(())
    }

    fn lock_cash_account(
        &mut self,
        key: &CashAccountKey,
    ) -> Result<Option<CashAccount>, JournalError> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {CASH_ACCOUNT_COLUMNS} FROM cash_account \
                     WHERE owner_id = ?1 AND currency_id = ?2 AND platform_id = ?3 \
                     AND COALESCE(label, '') = COALESCE(?4, '')"
                ),
                params![key.owner_id, key.currency_id, key.platform_id, key.label],
                cash_account_from_row,
            )
            .optional()
            .map_err(query_err)
    }

    fn insert_cash_account(&mut self, key: &CashAccountKey) -> Result<CashAccount, JournalError> {
        self.conn
            .execute(
                "INSERT INTO cash_account (owner_id, currency_id, platform_id, label, balance) \
                 VALUES (?1, ?2, ?3, ?4, '0')",
                params![key.owner_id, key.currency_id, key.platform_id, key.label],
            )
            .map_err(write_err("cash_account"))?;
        Ok(CashAccount::new(self.conn.last_insert_rowid(), key.clone()))
    }

    fn update_cash_account(&mut self, account: &CashAccount) -> Result<(), JournalError> {
        self.conn
            .execute(
                "UPDATE cash_account SET balance = ?2 WHERE id = ?1",
                params![account.id, account.balance.to_string()],
            )
            .map_err(write_err("cash_account"))?;
        Ok(())
    }

    fn insert_position_transaction(
        &mut self,
        cumulative_position_id: i64,
        txn: &NewPositionTransaction,
        created_at: DateTime<Utc>,
    ) -> Result<PositionTransaction, JournalError> {
        self.conn
            .execute(
                "INSERT INTO position_transaction (cumulative_position_id, instrument_id, \
                 investment_account_id, platform_id, kind, price, quantity, commission, \
                 executed_at, executed_by, description, notes, time_frame, pattern, is_active, \
                 created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 1, ?15)",
                params![
                    cumulative_position_id,
                    txn.instrument_id,
                    txn.investment_account_id,
                    txn.platform_id,
                    txn.kind.as_str(),
                    txn.price.to_string(),
                    txn.quantity.to_string(),
                    txn.commission.to_string(),
                    timestamp(&txn.executed_at),
                    txn.executed_by,
                    txn.description,
                    txn.notes,
                    txn.time_frame,
                    txn.pattern,
                    timestamp(&created_at),
                ],
            )
            .map_err(write_err("position_transaction"))?;
        Ok(PositionTransaction {
            id: self.conn.last_insert_rowid(),
            cumulative_position_id,
            instrument_id: txn.instrument_id,
            investment_account_id: txn.investment_account_id,
            platform_id: txn.platform_id,
            kind: txn.kind,
            price: txn.price,
            quantity: txn.quantity,
            commission: txn.commission,
            executed_at: txn.executed_at,
            executed_by: txn.executed_by,
            description: txn.description.clone(),
            notes: txn.notes.clone(),
            time_frame: txn.time_frame.clone(),
            pattern: txn.pattern.clone(),
            is_active: true,
            created_at,
        })
    }

    fn insert_cash_transaction(
        &mut self,
        account: &CashAccount,
        movement: &NewCashMovement,
    ) -> Result<CashTransaction, JournalError> {
        self.conn
            .execute(
                "INSERT INTO cash_transaction (cash_account_id, kind, amount, executed_at, \
                 description, is_active) VALUES (?1, ?2, ?3, ?4, ?5, 1)",
                params![
                    account.id,
                    movement.kind.as_str(),
                    movement.amount.to_string(),
                    timestamp(&movement.executed_at),
                    movement.description,
                ],
            )
            .map_err(write_err("cash_transaction"))?;
        Ok(CashTransaction {
            id: self.conn.last_insert_rowid(),
            cash_account_id: account.id,
            owner_id: account.key.owner_id,
            currency_id: account.key.currency_id,
            platform_id: account.key.platform_id,
            kind: movement.kind,
            amount: movement.amount,
            executed_at: movement.executed_at,
            description: movement.description.clone(),
            is_active: true,
        })
    }
}

fn instrument_by_id(conn: &Connection, id: i64) -> Result<Option<Instrument>, JournalError> {
    conn.query_row(
        "SELECT id, code, title, market_id, is_active FROM instrument WHERE id = ?1",
        params![id],
        instrument_from_row,
    )
    .optional()
    .map_err(query_err)
}

fn instrument_from_row(row: &Row<'_>) -> rusqlite::Result<Instrument> {
    Ok(Instrument {
        id: row.get(0)?,
        code: row.get(1)?,
        title: row.get(2)?,
        market_id: row.get(3)?,
        is_active: row.get(4)?,
    })
}

impl LedgerStore for SqliteAdapter {
    fn initialize_schema(&self) -> Result<(), JournalError> {
        let conn = self.connection()?;
        conn.execute_batch(SCHEMA).map_err(query_err)?;
        Ok(())
    }

    fn atomically<T, F>(&self, work: F) -> Result<T, JournalError>
    where
        F: FnOnce(&mut dyn LedgerSession) -> Result<T, JournalError>,
    {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(query_err)?;
        // Dropping `tx` on the error path rolls back.
        let result = work(&mut SqliteSession { conn: &tx })?;
        tx.commit().map_err(query_err)?;
        Ok(result)
    }

    fn positions(&self, filter: &PositionFilter) -> Result<Vec<PositionView>, JournalError> {
        let conn = self.connection()?;

        let mut sql = format!(
            "SELECT {POSITION_COLUMNS}, i.code, m.id, m.code {POSITION_VIEW_FROM} WHERE 1 = 1"
        );
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();
        let mut clauses: Vec<&str> = Vec::new();

        if let Some(id) = filter.instrument_id {
            clauses.push("p.instrument_id =");
            args.push(Box::new(id));
        }
        if let Some(code) = filter.normalized_instrument_code() {
            clauses.push("i.code =");
            args.push(Box::new(code));
        }
        if let Some(id) = filter.market_id {
            clauses.push("m.id =");
            args.push(Box::new(id));
        }
        if let Some(code) = filter.normalized_market_code() {
            clauses.push("UPPER(m.code) =");
            args.push(Box::new(code));
        }
        if let Some(id) = filter.investment_account_id {
            clauses.push("p.investment_account_id =");
            args.push(Box::new(id));
        }
        if let Some(completed) = filter.is_completed {
            clauses.push("p.is_completed =");
            args.push(Box::new(completed));
        }
        for (n, clause) in clauses.iter().enumerate() {
            sql.push_str(&format!(" AND {clause} ?{}", n + 1));
        }
        sql.push_str(" ORDER BY p.id ASC");

        let mut stmt = conn.prepare(&sql).map_err(query_err)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), position_view_from_row)
            .map_err(query_err)?;
        collect(rows)
    }

    fn position(&self, id: i64) -> Result<Option<PositionView>, JournalError> {
        let conn = self.connection()?;
        conn.query_row(
            &format!(
                "SELECT {POSITION_COLUMNS}, i.code, m.id, m.code {POSITION_VIEW_FROM} WHERE p.id = ?1"
            ),
            params![id],
            position_view_from_row,
        )
        .optional()
        .map_err(query_err)
    }

    fn transactions(
        &self,
        filter: &TransactionFilter,
    ) -> Result<Vec<PositionTransaction>, JournalError> {
        let conn = self.connection()?;

        let mut sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM position_transaction t \
             JOIN instrument i ON i.id = t.instrument_id WHERE 1 = 1"
        );
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(q) = filter.q.as_ref().map(|q| q.trim()).filter(|q| !q.is_empty()) {
            args.push(Box::new(format!("%{}%", q.to_uppercase())));
            sql.push_str(&format!(" AND i.code LIKE ?{}", args.len()));
        }
        if let Some(id) = filter.investment_account_id {
            args.push(Box::new(id));
            sql.push_str(&format!(" AND t.investment_account_id = ?{}", args.len()));
        }
        if let Some(by) = filter.executed_by {
            args.push(Box::new(by));
            sql.push_str(&format!(" AND t.executed_by = ?{}", args.len()));
        }
        if let Some(active) = filter.is_active {
            args.push(Box::new(active));
            sql.push_str(&format!(" AND t.is_active = ?{}", args.len()));
        }
        if let Some(kind) = filter.kind {
            args.push(Box::new(kind.as_str()));
            sql.push_str(&format!(" AND t.kind = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY t.executed_at ASC, t.id ASC");

        let mut stmt = conn.prepare(&sql).map_err(query_err)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), transaction_from_row)
            .map_err(query_err)?;
        collect(rows)
    }

    fn position_transactions(
        &self,
        cumulative_position_id: i64,
    ) -> Result<Vec<PositionTransaction>, JournalError> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TRANSACTION_COLUMNS} FROM position_transaction t \
                 WHERE t.cumulative_position_id = ?1 ORDER BY t.executed_at ASC, t.id ASC"
            ))
            .map_err(query_err)?;
        let rows = stmt
            .query_map(params![cumulative_position_id], transaction_from_row)
            .map_err(query_err)?;
        collect(rows)
    }

    fn cash_accounts(&self, owner_id: i64) -> Result<Vec<CashAccount>, JournalError> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CASH_ACCOUNT_COLUMNS} FROM cash_account WHERE owner_id = ?1 ORDER BY id"
            ))
            .map_err(query_err)?;
        let rows = stmt
            .query_map(params![owner_id], cash_account_from_row)
            .map_err(query_err)?;
        collect(rows)
    }

    fn cash_transactions(
        &self,
        cash_account_id: i64,
    ) -> Result<Vec<CashTransaction>, JournalError> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(&format!(
                "{CASH_TRANSACTION_SELECT} WHERE c.cash_account_id = ?1 \
                 ORDER BY c.executed_at ASC, c.id ASC"
            ))
            .map_err(query_err)?;
        let rows = stmt
            .query_map(params![cash_account_id], cash_transaction_from_row)
            .map_err(query_err)?;
        collect(rows)
    }

    fn deactivate_transaction(&self, id: i64) -> Result<bool, JournalError> {
        let conn = self.connection()?;
        let changed = conn
            .execute(
                "UPDATE position_transaction SET is_active = 0 WHERE id = ?1 AND is_active = 1",
                params![id],
            )
            .map_err(query_err)?;
        Ok(changed > 0)
    }
}

impl SqliteAdapter {
    fn require(&self, conn: &Connection, table: &str, entity: &str, id: i64) -> Result<(), JournalError> {
        if row_exists(conn, table, id)? {
            Ok(())
        } else {
            Err(JournalError::not_found(entity, id))
        }
    }

    fn set_active(&self, table: &str, entity: &str, id: i64, active: bool) -> Result<(), JournalError> {
        let conn = self.connection()?;
        let changed = conn
            .execute(
                &format!("UPDATE {table} SET is_active = ?2 WHERE id = ?1"),
                params![id, active],
            )
            .map_err(query_err)?;
        if changed == 0 {
            return Err(JournalError::not_found(entity, id));
        }
        Ok(())
    }
}

impl ReferencePort for SqliteAdapter {
    fn register_currency(&self, currency: &NewCurrency) -> Result<Currency, JournalError> {
        let currency = currency.normalized()?;
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO currency (code, title, symbol) VALUES (?1, ?2, ?3)",
            params![currency.code, currency.title, currency.symbol],
        )
        .map_err(write_err("currency"))?;
        Ok(Currency {
            id: conn.last_insert_rowid(),
            code: currency.code,
            title: currency.title,
            symbol: currency.symbol,
        })
    }

    fn register_market(&self, market: &NewMarket) -> Result<Market, JournalError> {
        let market = market.normalized()?;
        let conn = self.connection()?;
        self.require(&conn, "currency", "currency", market.currency_id)?;
        conn.execute(
            "INSERT INTO market (code, title, currency_id) VALUES (?1, ?2, ?3)",
            params![market.code, market.title, market.currency_id],
        )
        .map_err(write_err("market"))?;
        Ok(Market {
            id: conn.last_insert_rowid(),
            code: market.code,
            title: market.title,
            currency_id: market.currency_id,
        })
    }

    fn register_platform(&self, platform: &NewPlatform) -> Result<Platform, JournalError> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO platform (title, description) VALUES (?1, ?2)",
            params![platform.title, platform.description],
        )
        .map_err(write_err("platform"))?;
        Ok(Platform {
            id: conn.last_insert_rowid(),
            title: platform.title.clone(),
            description: platform.description.clone(),
        })
    }

    fn register_instrument(&self, instrument: &NewInstrument) -> Result<Instrument, JournalError> {
        let instrument = instrument.normalized()?;
        let conn = self.connection()?;
        self.require(&conn, "market", "market", instrument.market_id)?;
        conn.execute(
            "INSERT INTO instrument (code, title, market_id, is_active) VALUES (?1, ?2, ?3, 1)",
            params![instrument.code, instrument.title, instrument.market_id],
        )
        .map_err(write_err("instrument"))?;
        Ok(Instrument {
            id: conn.last_insert_rowid(),
            code: instrument.code,
            title: instrument.title,
            market_id: instrument.market_id,
            is_active: true,
        })
    }

    fn register_investment_account(
        &self,
        account: &NewInvestmentAccount,
    ) -> Result<InvestmentAccount, JournalError> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO investment_account (title, owner_id, is_active) VALUES (?1, ?2, 1)",
            params![account.title, account.owner_id],
        )
        .map_err(write_err("investment_account"))?;
        Ok(InvestmentAccount {
            id: conn.last_insert_rowid(),
            title: account.title.clone(),
            owner_id: account.owner_id,
            is_active: true,
        })
    }

    fn set_instrument_active(&self, id: i64, active: bool) -> Result<(), JournalError> {
        self.set_active("instrument", "instrument", id, active)
    }

    fn set_investment_account_active(&self, id: i64, active: bool) -> Result<(), JournalError> {
        self.set_active("investment_account", "investment account", id, active)
    }

    fn instruments(&self) -> Result<Vec<Instrument>, JournalError> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare("SELECT id, code, title, market_id, is_active FROM instrument ORDER BY code")
            .map_err(query_err)?;
        let rows = stmt.query_map([], instrument_from_row).map_err(query_err)?;
        collect(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::journal::{record_cash_movement, record_transaction};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    struct EmptyConfig;

    impl ConfigPort for EmptyConfig {
        fn get_string(&self, _section: &str, _key: &str) -> Option<String> {
            None
        }
        fn get_int(&self, _section: &str, _key: &str, default: i64) -> i64 {
            default
        }
        fn get_bool(&self, _section: &str, _key: &str, default: bool) -> bool {
            default
        }
    }

    fn seeded() -> (SqliteAdapter, i64, i64, i64) {
        let adapter = SqliteAdapter::in_memory().unwrap();
        adapter.initialize_schema().unwrap();
        let usd = adapter
            .register_currency(&NewCurrency {
                code: "usd".into(),
                title: "US Dollar".into(),
                symbol: Some("$".into()),
            })
            .unwrap();
        let market = adapter
            .register_market(&NewMarket {
                code: "NASDAQGS".into(),
                title: "Nasdaq Global Select".into(),
                currency_id: usd.id,
            })
            .unwrap();
        let instrument = adapter
            .register_instrument(&NewInstrument {
                code: "aapl".into(),
                title: "Apple".into(),
                market_id: market.id,
            })
            .unwrap();
        let account = adapter
            .register_investment_account(&NewInvestmentAccount {
                title: "Main".into(),
                owner_id: 1,
            })
            .unwrap();
        let platform = adapter
            .register_platform(&NewPlatform {
                title: "Broker".into(),
                description: None,
            })
            .unwrap();
        (adapter, instrument.id, account.id, platform.id)
    }

    fn trade(
        instrument_id: i64,
        account_id: i64,
        platform_id: i64,
        kind: TransactionKind,
        qty: Decimal,
        price: Decimal,
    ) -> NewPositionTransaction {
        NewPositionTransaction {
            instrument_id,
            investment_account_id: account_id,
            platform_id,
            kind,
            price: Price::new(price),
            quantity: Quantity::new(qty),
            commission: Money::new(dec!(1)),
            executed_at: Utc.with_ymd_and_hms(2024, 5, 2, 15, 0, 0).unwrap(),
            executed_by: 1,
            description: "test".into(),
            notes: String::new(),
            time_frame: Some("1D".into()),
            pattern: None,
        }
    }

    #[test]
    fn from_config_missing_path() {
        let config = EmptyConfig;
        let result = SqliteAdapter::from_config(&config);
        match result {
            Err(JournalError::ConfigMissing { section, key }) => {
                assert_eq!(section, "sqlite");
                assert_eq!(key, "path");
            }
            Err(other) => panic!("expected ConfigMissing, got: {other}"),
            Ok(_) => panic!("expected error, got Ok"),
        }
    }

    #[test]
    fn in_memory_initialization_is_idempotent() {
        let adapter = SqliteAdapter::in_memory().unwrap();
        adapter.initialize_schema().unwrap();
        adapter.initialize_schema().unwrap();
    }

    #[test]
    fn instrument_code_stored_uppercase() {
        let (adapter, instrument_id, _, _) = seeded();
        let instruments = adapter.instruments().unwrap();
        assert_eq!(instruments.len(), 1);
        assert_eq!(instruments[0].id, instrument_id);
        assert_eq!(instruments[0].code, "AAPL");
    }

    #[test]
    fn duplicate_instrument_code_is_constraint_violation() {
        let (adapter, _, _, _) = seeded();
        let err = adapter
            .register_instrument(&NewInstrument {
                code: "AAPL".into(),
                title: "Apple again".into(),
                market_id: 1,
            })
            .unwrap_err();
        assert!(err.is_constraint_violation());
    }

    #[test]
    fn register_market_with_unknown_currency_fails() {
        let adapter = SqliteAdapter::in_memory().unwrap();
        adapter.initialize_schema().unwrap();
        let err = adapter
            .register_market(&NewMarket {
                code: "ASX".into(),
                title: "ASX".into(),
                currency_id: 42,
            })
            .unwrap_err();
        assert!(matches!(err, JournalError::NotFound { id: 42, .. }));
    }

    #[test]
    fn record_round_trips_decimals_and_timestamps() {
        let (adapter, instrument_id, account_id, platform_id) = seeded();
        let request = trade(
            instrument_id,
            account_id,
            platform_id,
            TransactionKind::Buy,
            dec!(3.5),
            dec!(187.4312),
        );
        let recorded = record_transaction(&adapter, &request).unwrap();

        let stored = adapter.position(recorded.position.id).unwrap().unwrap();
        assert_eq!(stored.position, recorded.position);
        assert_eq!(stored.instrument_code, "AAPL");
        assert_eq!(stored.market_code, "NASDAQGS");
        assert_eq!(stored.quantity(), Quantity::new(dec!(3.5)));

        let history = adapter.position_transactions(recorded.position.id).unwrap();
        assert_eq!(history, vec![recorded.transaction]);
    }

    #[test]
    fn second_open_position_for_pair_is_refused_by_index() {
        let (adapter, instrument_id, account_id, _) = seeded();
        let opened_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let err = adapter
            .atomically(|session| {
                session.insert_position(instrument_id, account_id, opened_at)?;
                session.insert_position(instrument_id, account_id, opened_at)
            })
            .unwrap_err();
        assert!(err.is_constraint_violation());
        assert!(adapter.positions(&PositionFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn default_cash_account_key_is_unique_with_null_label() {
        let (adapter, _, _, platform_id) = seeded();
        let key = CashAccountKey::platform_default(1, 1, platform_id);
        let err = adapter
            .atomically(|session| {
                session.insert_cash_account(&key)?;
                session.insert_cash_account(&key)
            })
            .unwrap_err();
        assert!(err.is_constraint_violation());

        let labelled = CashAccountKey {
            label: Some("savings".into()),
            ..key.clone()
        };
        adapter
            .atomically(|session| {
                session.insert_cash_account(&key)?;
                session.insert_cash_account(&labelled)
            })
            .unwrap();
        assert_eq!(adapter.cash_accounts(1).unwrap().len(), 2);
    }

    #[test]
    fn failed_unit_leaves_no_rows() {
        let (adapter, instrument_id, account_id, platform_id) = seeded();
        let sell = trade(
            instrument_id,
            account_id,
            platform_id,
            TransactionKind::Sell,
            dec!(5),
            dec!(100),
        );
        let err = record_transaction(&adapter, &sell).unwrap_err();
        assert!(matches!(err, JournalError::RejectedTransaction { .. }));
        assert!(adapter.transactions(&TransactionFilter::default()).unwrap().is_empty());
        assert!(adapter.positions(&PositionFilter::default()).unwrap().is_empty());
        assert!(adapter.cash_accounts(1).unwrap().is_empty());
    }

    #[test]
    fn cash_movements_are_journaled() {
        let (adapter, _, _, platform_id) = seeded();
        let key = CashAccountKey::platform_default(1, 1, platform_id);
        let at = Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap();
        for (kind, amount) in [
            (CashMovementKind::Deposit, dec!(500)),
            (CashMovementKind::Withdraw, dec!(200)),
        ] {
            record_cash_movement(
                &adapter,
                &key,
                &NewCashMovement {
                    kind,
                    amount: Money::new(amount),
                    executed_at: at,
                    description: None,
                },
            )
            .unwrap();
        }
        let accounts = adapter.cash_accounts(1).unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].balance, Money::new(dec!(300)));

        let journal = adapter.cash_transactions(accounts[0].id).unwrap();
        assert_eq!(journal.len(), 2);
        assert_eq!(journal[1].kind, CashMovementKind::Withdraw);
        assert_eq!(journal[1].platform_id, platform_id);
    }

    #[test]
    fn transaction_filter_matches_code_fragment_case_insensitively() {
        let (adapter, instrument_id, account_id, platform_id) = seeded();
        record_transaction(
            &adapter,
            &trade(instrument_id, account_id, platform_id, TransactionKind::Buy, dec!(1), dec!(10)),
        )
        .unwrap();

        let hit = TransactionFilter {
            q: Some("ap".into()),
            ..Default::default()
        };
        assert_eq!(adapter.transactions(&hit).unwrap().len(), 1);

        let miss = TransactionFilter {
            q: Some("msft".into()),
            ..Default::default()
        };
        assert!(adapter.transactions(&miss).unwrap().is_empty());

        let sells = TransactionFilter {
            kind: Some(TransactionKind::Sell),
            ..Default::default()
        };
        assert!(adapter.transactions(&sells).unwrap().is_empty());
    }

    #[test]
    fn deactivate_transaction_is_soft_and_reports_change() {
        let (adapter, instrument_id, account_id, platform_id) = seeded();
        let recorded = record_transaction(
            &adapter,
            &trade(instrument_id, account_id, platform_id, TransactionKind::Buy, dec!(2), dec!(10)),
        )
        .unwrap();

        assert!(adapter.deactivate_transaction(recorded.transaction.id).unwrap());
        assert!(!adapter.deactivate_transaction(recorded.transaction.id).unwrap());
        assert!(!adapter.deactivate_transaction(9999).unwrap());

        let inactive = TransactionFilter {
            is_active: Some(false),
            ..Default::default()
        };
        assert_eq!(adapter.transactions(&inactive).unwrap().len(), 1);
        let position = adapter.position(recorded.position.id).unwrap().unwrap();
        assert_eq!(position.quantity(), Quantity::new(dec!(2)));
    }

    #[test]
    fn set_active_on_unknown_id_is_not_found() {
        let (adapter, instrument_id, _, _) = seeded();
        adapter.set_instrument_active(instrument_id, false).unwrap();
        let err = adapter.set_investment_account_active(77, false).unwrap_err();
        assert!(matches!(err, JournalError::NotFound { id: 77, .. }));
    }
}
