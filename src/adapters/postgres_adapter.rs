//! PostgreSQL ledger adapter.
//!
//! Units run in a READ COMMITTED transaction. The open position and the cash
//! account are read with `FOR UPDATE`, so same-pair writers serialise on
//! those rows while disjoint pairs proceed in parallel. Inserts backing
//! find-or-create use `ON CONFLICT DO NOTHING`: an empty `RETURNING` means
//! another writer won and is reported as `ConstraintViolation`, which keeps
//! the surrounding transaction usable for the re-fetch.

use crate::domain::cash::{
    CashAccount, CashAccountKey, CashMovementKind, CashTransaction, NewCashMovement,
};
use crate::domain::config_validation::DEFAULT_POOL_SIZE;
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
use chrono::{DateTime, Utc};
use postgres::error::SqlState;
use postgres::types::ToSql;
use postgres::{GenericClient, NoTls, Row, Transaction};
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use rust_decimal::Decimal;
use std::str::FromStr;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS currency (
    id BIGSERIAL PRIMARY KEY,
    code TEXT NOT NULL UNIQUE,
    title TEXT NOT NULL,
    symbol TEXT
);
CREATE TABLE IF NOT EXISTS market (
    id BIGSERIAL PRIMARY KEY,
    code TEXT NOT NULL,
    title TEXT NOT NULL,
    currency_id BIGINT NOT NULL REFERENCES currency(id)
);
CREATE TABLE IF NOT EXISTS platform (
    id BIGSERIAL PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT
);
CREATE TABLE IF NOT EXISTS instrument (
    id BIGSERIAL PRIMARY KEY,
    code TEXT NOT NULL UNIQUE,
    title TEXT NOT NULL,
    market_id BIGINT NOT NULL REFERENCES market(id),
    is_active BOOLEAN NOT NULL DEFAULT TRUE
);
CREATE TABLE IF NOT EXISTS investment_account (
    id BIGSERIAL PRIMARY KEY,
    title TEXT NOT NULL,
    owner_id BIGINT NOT NULL,
    is_active BOOLEAN NOT NULL DEFAULT TRUE
);
CREATE TABLE IF NOT EXISTS cash_account (
    id BIGSERIAL PRIMARY KEY,
    owner_id BIGINT NOT NULL,
    currency_id BIGINT NOT NULL REFERENCES currency(id),
    platform_id BIGINT NOT NULL REFERENCES platform(id),
    label TEXT,
    balance NUMERIC NOT NULL DEFAULT 0
);
CREATE UNIQUE INDEX IF NOT EXISTS ux_cash_account_key
    ON cash_account(owner_id, currency_id, platform_id, COALESCE(label, ''));
CREATE TABLE IF NOT EXISTS cash_transaction (
    id BIGSERIAL PRIMARY KEY,
    cash_account_id BIGINT NOT NULL REFERENCES cash_account(id),
    kind TEXT NOT NULL CHECK (kind IN ('DEPOSIT', 'WITHDRAW', 'DIVIDEND')),
    amount NUMERIC NOT NULL,
    executed_at TIMESTAMPTZ NOT NULL,
    description TEXT,
    is_active BOOLEAN NOT NULL DEFAULT TRUE
);
CREATE INDEX IF NOT EXISTS idx_cash_transaction_account ON cash_transaction(cash_account_id);
CREATE TABLE IF NOT EXISTS cumulative_position (
    id BIGSERIAL PRIMARY KEY,
    instrument_id BIGINT NOT NULL REFERENCES instrument(id),
    investment_account_id BIGINT NOT NULL REFERENCES investment_account(id),
    quantity NUMERIC NOT NULL,
    avg_cost NUMERIC NOT NULL,
    total_buys NUMERIC NOT NULL,
    total_sells NUMERIC NOT NULL,
    total_buy_amount NUMERIC NOT NULL,
    total_sell_amount NUMERIC NOT NULL,
    total_commission_cost NUMERIC NOT NULL,
    is_completed BOOLEAN NOT NULL DEFAULT FALSE,
    first_transaction_at TIMESTAMPTZ NOT NULL,
    last_transaction_at TIMESTAMPTZ
);
CREATE UNIQUE INDEX IF NOT EXISTS ux_open_position
    ON cumulative_position(instrument_id, investment_account_id) WHERE NOT is_completed;
CREATE TABLE IF NOT EXISTS position_transaction (
    id BIGSERIAL PRIMARY KEY,
    cumulative_position_id BIGINT NOT NULL REFERENCES cumulative_position(id),
    instrument_id BIGINT NOT NULL REFERENCES instrument(id),
    investment_account_id BIGINT NOT NULL REFERENCES investment_account(id),
    platform_id BIGINT NOT NULL REFERENCES platform(id),
    kind TEXT NOT NULL CHECK (kind IN ('BUY', 'SELL')),
    price NUMERIC NOT NULL,
    quantity NUMERIC NOT NULL,
    commission NUMERIC NOT NULL,
    executed_at TIMESTAMPTZ NOT NULL,
    executed_by BIGINT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    notes TEXT NOT NULL DEFAULT '',
    time_frame TEXT,
    pattern TEXT,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    created_at TIMESTAMPTZ NOT NULL
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

type Manager = PostgresConnectionManager<NoTls>;

pub struct PostgresAdapter {
    pool: Pool<Manager>,
}

fn pool_err(e: r2d2::Error) -> JournalError {
    JournalError::Database {
        reason: e.to_string(),
    }
}

fn query_err(e: postgres::Error) -> JournalError {
    JournalError::DatabaseQuery {
        reason: e.to_string(),
    }
}

fn write_err(entity: &'static str) -> impl Fn(postgres::Error) -> JournalError {
    move |e| {
        if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
            return JournalError::ConstraintViolation {
                entity: entity.to_string(),
                reason: e.to_string(),
            };
        }
        query_err(e)
    }
}

fn conflict(entity: &str) -> JournalError {
    JournalError::ConstraintViolation {
        entity: entity.to_string(),
        reason: "row inserted concurrently".to_string(),
    }
}

fn bad_column(idx: usize, e: JournalError) -> JournalError {
    JournalError::DatabaseQuery {
        reason: format!("column {idx}: {e}"),
    }
}

fn position_from_row(row: &Row) -> Result<CumulativePosition, JournalError> {
    let decimal = |idx: usize| row.try_get::<_, Decimal>(idx).map_err(query_err);
    Ok(CumulativePosition {
        id: row.try_get(0).map_err(query_err)?,
        instrument_id: row.try_get(1).map_err(query_err)?,
        investment_account_id: row.try_get(2).map_err(query_err)?,
        quantity: Quantity::new(decimal(3)?),
        avg_cost: Price::new(decimal(4)?),
        total_buys: Quantity::new(decimal(5)?),
        total_sells: Quantity::new(decimal(6)?),
        total_buy_amount: Money::new(decimal(7)?),
        total_sell_amount: Money::new(decimal(8)?),
        total_commission_cost: Money::new(decimal(9)?),
        is_completed: row.try_get(10).map_err(query_err)?,
        first_transaction_at: row.try_get(11).map_err(query_err)?,
        last_transaction_at: row.try_get(12).map_err(query_err)?,
    })
}

fn position_view_from_row(row: &Row) -> Result<PositionView, JournalError> {
    let position = position_from_row(row)?;
    PositionView::new(
        position,
        row.try_get(13).map_err(query_err)?,
        row.try_get(14).map_err(query_err)?,
        row.try_get(15).map_err(query_err)?,
    )
}

fn transaction_from_row(row: &Row) -> Result<PositionTransaction, JournalError> {
    let kind: String = row.try_get(5).map_err(query_err)?;
    Ok(PositionTransaction {
        id: row.try_get(0).map_err(query_err)?,
        cumulative_position_id: row.try_get(1).map_err(query_err)?,
        instrument_id: row.try_get(2).map_err(query_err)?,
        investment_account_id: row.try_get(3).map_err(query_err)?,
        platform_id: row.try_get(4).map_err(query_err)?,
        kind: TransactionKind::from_str(&kind).map_err(|e| bad_column(5, e))?,
        price: Price::new(row.try_get(6).map_err(query_err)?),
        quantity: Quantity::new(row.try_get(7).map_err(query_err)?),
        commission: Money::new(row.try_get(8).map_err(query_err)?),
        executed_at: row.try_get(9).map_err(query_err)?,
        executed_by: row.try_get(10).map_err(query_err)?,
        description: row.try_get(11).map_err(query_err)?,
        notes: row.try_get(12).map_err(query_err)?,
        time_frame: row.try_get(13).map_err(query_err)?,
        pattern: row.try_get(14).map_err(query_err)?,
        is_active: row.try_get(15).map_err(query_err)?,
        created_at: row.try_get(16).map_err(query_err)?,
    })
}

fn cash_account_from_row(row: &Row) -> Result<CashAccount, JournalError> {
    Ok(CashAccount {
        id: row.try_get(0).map_err(query_err)?,
        key: CashAccountKey {
            owner_id: row.try_get(1).map_err(query_err)?,
            currency_id: row.try_get(2).map_err(query_err)?,
            platform_id: row.try_get(3).map_err(query_err)?,
            label: row.try_get(4).map_err(query_err)?,
        },
        balance: Money::new(row.try_get(5).map_err(query_err)?),
    })
}

fn cash_transaction_from_row(row: &Row) -> Result<CashTransaction, JournalError> {
    let kind: String = row.try_get(5).map_err(query_err)?;
    Ok(CashTransaction {
        id: row.try_get(0).map_err(query_err)?,
        cash_account_id: row.try_get(1).map_err(query_err)?,
        owner_id: row.try_get(2).map_err(query_err)?,
        currency_id: row.try_get(3).map_err(query_err)?,
        platform_id: row.try_get(4).map_err(query_err)?,
        kind: CashMovementKind::from_str(&kind).map_err(|e| bad_column(5, e))?,
        amount: Money::new(row.try_get(6).map_err(query_err)?),
        executed_at: row.try_get(7).map_err(query_err)?,
        description: row.try_get(8).map_err(query_err)?,
        is_active: row.try_get(9).map_err(query_err)?,
    })
}

fn instrument_from_row(row: &Row) -> Result<Instrument, JournalError> {
    Ok(Instrument {
        id: row.try_get(0).map_err(query_err)?,
        code: row.try_get(1).map_err(query_err)?,
        title: row.try_get(2).map_err(query_err)?,
        market_id: row.try_get(3).map_err(query_err)?,
        is_active: row.try_get(4).map_err(query_err)?,
    })
}

fn row_exists<C: GenericClient>(client: &mut C, table: &str, id: i64) -> Result<bool, JournalError> {
    let row = client
        .query_one(
            &format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE id = $1)"),
            &[&id],
        )
        .map_err(query_err)?;
    row.try_get(0).map_err(query_err)
}

impl PostgresAdapter {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, JournalError> {
        let connection_string = config
            .get_string("postgres", "connection_string")
            .ok_or_else(|| JournalError::ConfigMissing {
                section: "postgres".into(),
                key: "connection_string".into(),
            })?;
        let pool_size = config.get_int("postgres", "pool_size", DEFAULT_POOL_SIZE) as u32;

        let pg_config = connection_string
            .parse::<postgres::Config>()
            .map_err(|e| JournalError::ConfigInvalid {
                section: "postgres".into(),
                key: "connection_string".into(),
                reason: e.to_string(),
            })?;
        let manager = PostgresConnectionManager::new(pg_config, NoTls);
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(pool_err)?;

        Ok(Self { pool })
    }

    fn connection(&self) -> Result<PooledConnection<Manager>, JournalError> {
        self.pool.get().map_err(pool_err)
    }
}

struct PostgresSession<'t, 'c> {
    tx: &'t mut Transaction<'c>,
}

impl LedgerSession for PostgresSession<'_, '_> {
    fn instrument(&mut self, id: i64) -> Result<Option<Instrument>, JournalError> {
        self.tx
            .query_opt(
                "SELECT id, code, title, market_id, is_active FROM instrument WHERE id = $1",
                &[&id],
            )
            .map_err(query_err)?
            .as_ref()
            .map(instrument_from_row)
            .transpose()
    }

    fn market(&mut self, id: i64) -> Result<Option<Market>, JournalError> {
        let row = self
            .tx
            .query_opt(
                "SELECT id, code, title, currency_id FROM market WHERE id = $1",
                &[&id],
            )
            .map_err(query_err)?;
        row.map(|row| {
            Ok(Market {
                id: row.try_get(0).map_err(query_err)?,
                code: row.try_get(1).map_err(query_err)?,
                title: row.try_get(2).map_err(query_err)?,
                currency_id: row.try_get(3).map_err(query_err)?,
            })
        })
        .transpose()
    }

    fn platform(&mut self, id: i64) -> Result<Option<Platform>, JournalError> {
        let row = self
            .tx
            .query_opt(
                "SELECT id, title, description FROM platform WHERE id = $1",
                &[&id],
            )
            .map_err(query_err)?;
        row.map(|row| {
            Ok(Platform {
                id: row.try_get(0).map_err(query_err)?,
                title: row.try_get(1).map_err(query_err)?,
                description: row.try_get(2).map_err(query_err)?,
            })
        })
        .transpose()
    }

    fn investment_account(&mut self, id: i64) -> Result<Option<InvestmentAccount>, JournalError> {
        let row = self
            .tx
            .query_opt(
                "SELECT id, title, owner_id, is_active FROM investment_account WHERE id = $1",
                &[&id],
            )
            .map_err(query_err)?;
        row.map(|row| {
            Ok(InvestmentAccount {
                id: row.try_get(0).map_err(query_err)?,
                title: row.try_get(1).map_err(query_err)?,
                owner_id: row.try_get(2).map_err(query_err)?,
                is_active: row.try_get(3).map_err(query_err)?,
            })
        })
        .transpose()
    }

    fn currency_exists(&mut self, id: i64) -> Result<bool, JournalError> {
        row_exists(&mut *self.tx, "currency", id)
    }

    fn lock_open_position(
        &mut self,
        instrument_id: i64,
        investment_account_id: i64,
    ) -> Result<Option<CumulativePosition>, JournalError> {
        self.tx
            .query_opt(
                &format!(
                    "SELECT {POSITION_COLUMNS} FROM cumulative_position p \
                     WHERE p.instrument_id = $1 AND p.investment_account_id = $2 \
                     AND NOT p.is_completed FOR UPDATE"
                ),
                &[&instrument_id, &investment_account_id],
            )
            .map_err(query_err)?
            .as_ref()
            .map(position_from_row)
            .transpose()
    }

    fn insert_position(
        &mut self,
        instrument_id: i64,
        investment_account_id: i64,
        opened_at: DateTime<Utc>,
    ) -> Result<CumulativePosition, JournalError> {
        let zero = Decimal::ZERO;
        let row = self
            .tx
            .query_opt(
                "INSERT INTO cumulative_position (instrument_id, investment_account_id, quantity, \
                 avg_cost, total_buys, total_sells, total_buy_amount, total_sell_amount, \
                 total_commission_cost, is_completed, first_transaction_at) \
                 VALUES ($1, $2, $3, $3, $3, $3, $3, $3, $3, FALSE, $4) \
                 ON CONFLICT DO NOTHING RETURNING id",
                &[&instrument_id, &investment_account_id, &zero, &opened_at],
            )
            .map_err(write_err("cumulative_position"))?
            .ok_or_else(|| conflict("cumulative_position"))?;
        let id: i64 = row.try_get(0).map_err(query_err)?;
        Ok(CumulativePosition::open(
            id,
            instrument_id,
            investment_account_id,
            opened_at,
        ))
    }

    fn update_position(&mut self, position: &CumulativePosition) -> Result<(), JournalError> {
        self.tx
            .execute(
                "UPDATE cumulative_position SET quantity = $2, avg_cost = $3, total_buys = $4, \
                 total_sells = $5, total_buy_amount = $6, total_sell_amount = $7, \
                 total_commission_cost = $8, is_completed = $9, first_transaction_at = $10, \
                 last_transaction_at = $11 WHERE id = $1",
                &[
                    &position.id,
                    &position.quantity.value(),
                    &position.avg_cost.value(),
                    &position.total_buys.value(),
                    &position.total_sells.value(),
                    &position.total_buy_amount.value(),
                    &position.total_sell_amount.value(),
                    &position.total_commission_cost.value(),
                    &position.is_completed,
                    &position.first_transaction_at,
                    &position.last_transaction_at,
                ],
            )
            .map_err(write_err("cumulative_position"))?;
        Ok(())
    }

    fn lock_cash_account(
        &mut self,
        key: &CashAccountKey,
    ) -> Result<Option<CashAccount>, JournalError> {
        self.tx
            .query_opt(
                &format!(
                    "SELECT {CASH_ACCOUNT_COLUMNS} FROM cash_account \
                     WHERE owner_id = $1 AND currency_id = $2 AND platform_id = $3 \
                     AND COALESCE(label, '') = COALESCE($4, '') FOR UPDATE"
                ),
                &[&key.owner_id, &key.currency_id, &key.platform_id, &key.label],
            )
            .map_err(query_err)?
            .as_ref()
            .map(cash_account_from_row)
            .transpose()
    }

    fn insert_cash_account(&mut self, key: &CashAccountKey) -> Result<CashAccount, JournalError> {
        let row = self
            .tx
            .query_opt(
                "INSERT INTO cash_account (owner_id, currency_id, platform_id, label, balance) \
                 VALUES ($1, $2, $3, $4, 0) ON CONFLICT DO NOTHING RETURNING id",
                &[&key.owner_id, &key.currency_id, &key.platform_id, &key.label],
            )
            .map_err(write_err("cash_account"))?
            .ok_or_else(|| conflict("cash_account"))?;
        let id: i64 = row.try_get(0).map_err(query_err)?;
        Ok(CashAccount::new(id, key.clone()))
    }

    fn update_cash_account(&mut self, account: &CashAccount) -> Result<(), JournalError> {
        self.tx
            .execute(
                "UPDATE cash_account SET balance = $2 WHERE id = $1",
                &[&account.id, &account.balance.value()],
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
        let row = self
            .tx
            .query_one(
                "INSERT INTO position_transaction (cumulative_position_id, instrument_id, \
                 investment_account_id, platform_id, kind, price, quantity, commission, \
                 executed_at, executed_by, description, notes, time_frame, pattern, is_active, \
                 created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, TRUE, $15) \
                 RETURNING id",
                &[
                    &cumulative_position_id,
                    &txn.instrument_id,
                    &txn.investment_account_id,
                    &txn.platform_id,
                    &txn.kind.as_str(),
                    &txn.price.value(),
                    &txn.quantity.value(),
                    &txn.commission.value(),
                    &txn.executed_at,
                    &txn.executed_by,
                    &txn.description,
                    &txn.notes,
                    &txn.time_frame,
                    &txn.pattern,
                    &created_at,
                ],
            )
            .map_err(write_err("position_transaction"))?;
        Ok(PositionTransaction {
            id: row.try_get(0).map_err(query_err)?,
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
        let row = self
            .tx
            .query_one(
                "INSERT INTO cash_transaction (cash_account_id, kind, amount, executed_at, \
                 description, is_active) VALUES ($1, $2, $3, $4, $5, TRUE) RETURNING id",
                &[
                    &account.id,
                    &movement.kind.as_str(),
                    &movement.amount.value(),
                    &movement.executed_at,
                    &movement.description,
                ],
            )
            .map_err(write_err("cash_transaction"))?;
        Ok(CashTransaction {
            id: row.try_get(0).map_err(query_err)?,
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

impl LedgerStore for PostgresAdapter {
    fn initialize_schema(&self) -> Result<(), JournalError> {
        let mut client = self.connection()?;
        client.batch_execute(SCHEMA).map_err(query_err)
    }

    fn atomically<T, F>(&self, work: F) -> Result<T, JournalError>
    where
        F: FnOnce(&mut dyn LedgerSession) -> Result<T, JournalError>,
    {
        let mut client = self.connection()?;
        let mut tx = client.transaction().map_err(query_err)?;
        let result = work(&mut PostgresSession { tx: &mut tx })?;
        tx.commit().map_err(query_err)?;
        Ok(result)
    }

    fn positions(&self, filter: &PositionFilter) -> Result<Vec<PositionView>, JournalError> {
        let mut client = self.connection()?;

        let mut sql = format!(
            "SELECT {POSITION_COLUMNS}, i.code, m.id, m.code {POSITION_VIEW_FROM} WHERE TRUE"
        );
        let mut args: Vec<Box<dyn ToSql + Sync>> = Vec::new();
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
            sql.push_str(&format!(" AND {clause} ${}", n + 1));
        }
        sql.push_str(" ORDER BY p.id ASC");

        let params: Vec<&(dyn ToSql + Sync)> = args.iter().map(|a| a.as_ref()).collect();
        let rows = client.query(&sql, &params).map_err(query_err)?;
        rows.iter().map(position_view_from_row).collect()
    }

    fn position(&self, id: i64) -> Result<Option<PositionView>, JournalError> {
        let mut client = self.connection()?;
        client
            .query_opt(
                &format!(
                    "SELECT {POSITION_COLUMNS}, i.code, m.id, m.code {POSITION_VIEW_FROM} WHERE p.id = $1"
                ),
                &[&id],
            )
            .map_err(query_err)?
            .as_ref()
            .map(position_view_from_row)
            .transpose()
    }

    fn transactions(
        &self,
        filter: &TransactionFilter,
    ) -> Result<Vec<PositionTransaction>, JournalError> {
        let mut client = self.connection()?;

        let mut sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM position_transaction t \
             JOIN instrument i ON i.id = t.instrument_id WHERE TRUE"
        );
        let mut args: Vec<Box<dyn ToSql + Sync>> = Vec::new();

        if let Some(q) = filter.q.as_ref().map(|q| q.trim()).filter(|q| !q.is_empty()) {
            args.push(Box::new(format!("%{q}%")));
            sql.push_str(&format!(" AND i.code ILIKE ${}", args.len()));
        }
        if let Some(id) = filter.investment_account_id {
            args.push(Box::new(id));
            sql.push_str(&format!(" AND t.investment_account_id = ${}", args.len()));
        }
        if let Some(by) = filter.executed_by {
            args.push(Box::new(by));
            sql.push_str(&format!(" AND t.executed_by = ${}", args.len()));
        }
        if let Some(active) = filter.is_active {
            args.push(Box::new(active));
            sql.push_str(&format!(" AND t.is_active = ${}", args.len()));
        }
        if let Some(kind) = filter.kind {
            args.push(Box::new(kind.as_str()));
            sql.push_str(&format!(" AND t.kind = ${}", args.len()));
        }
        sql.push_str(" ORDER BY t.executed_at ASC, t.id ASC");

        let params: Vec<&(dyn ToSql + Sync)> = args.iter().map(|a| a.as_ref()).collect();
        let rows = client.query(&sql, &params).map_err(query_err)?;
        rows.iter().map(transaction_from_row).collect()
    }

    fn position_transactions(
        &self,
        cumulative_position_id: i64,
    ) -> Result<Vec<PositionTransaction>, JournalError> {
        let mut client = self.connection()?;
        let rows = client
            .query(
                &format!(
                    "SELECT {TRANSACTION_COLUMNS} FROM position_transaction t \
                     WHERE t.cumulative_position_id = $1 ORDER BY t.executed_at ASC, t.id ASC"
                ),
                &[&cumulative_position_id],
            )
            .map_err(query_err)?;
        rows.iter().map(transaction_from_row).collect()
    }

    fn cash_accounts(&self, owner_id: i64) -> Result<Vec<CashAccount>, JournalError> {
        let mut client = self.connection()?;
        let rows = client
            .query(
                &format!(
                    "SELECT {CASH_ACCOUNT_COLUMNS} FROM cash_account WHERE owner_id = $1 ORDER BY id"
                ),
                &[&owner_id],
            )
            .map_err(query_err)?;
        rows.iter().map(cash_account_from_row).collect()
    }

    fn cash_transactions(
        &self,
        cash_account_id: i64,
    ) -> Result<Vec<CashTransaction>, JournalError> {
        let mut client = self.connection()?;
        let rows = client
            .query(
                "SELECT c.id, c.cash_account_id, a.owner_id, a.currency_id, a.platform_id, \
                 c.kind, c.amount, c.executed_at, c.description, c.is_active \
                 FROM cash_transaction c JOIN cash_account a ON a.id = c.cash_account_id \
                 WHERE c.cash_account_id = $1 ORDER BY c.executed_at ASC, c.id ASC",
                &[&cash_account_id],
            )
            .map_err(query_err)?;
        rows.iter().map(cash_transaction_from_row).collect()
    }

    fn deactivate_transaction(&self, id: i64) -> Result<bool, JournalError> {
        let mut client = self.connection()?;
        let changed = client
            .execute(
                "UPDATE position_transaction SET is_active = FALSE WHERE id = $1 AND is_active",
                &[&id],
            )
            .map_err(query_err)?;
        Ok(changed > 0)
    }
}

impl PostgresAdapter {
    fn set_active(&self, table: &str, entity: &str, id: i64, active: bool) -> Result<(), JournalError> {
        let mut client = self.connection()?;
        let changed = client
            .execute(
                &format!("UPDATE {table} SET is_active = $2 WHERE id = $1"),
                &[&id, &active],
            )
            .map_err(query_err)?;
        if changed == 0 {
            return Err(JournalError::not_found(entity, id));
        }
        Ok(())
    }
}

impl ReferencePort for PostgresAdapter {
    fn register_currency(&self, currency: &NewCurrency) -> Result<Currency, JournalError> {
        let currency = currency.normalized()?;
        let mut client = self.connection()?;
        let row = client
            .query_one(
                "INSERT INTO currency (code, title, symbol) VALUES ($1, $2, $3) RETURNING id",
                &[&currency.code, &currency.title, &currency.symbol],
            )
            .map_err(write_err("currency"))?;
        Ok(Currency {
            id: row.try_get(0).map_err(query_err)?,
            code: currency.code,
            title: currency.title,
            symbol: currency.symbol,
        })
    }

    fn register_market(&self, market: &NewMarket) -> Result<Market, JournalError> {
        let market = market.normalized()?;
        let mut client = self.connection()?;
        if !row_exists(&mut *client, "currency", market.currency_id)? {
            return Err(JournalError::not_found("currency", market.currency_id));
        }
        let row = client
            .query_one(
                "INSERT INTO market (code, title, currency_id) VALUES ($1, $2, $3) RETURNING id",
                &[&market.code, &market.title, &market.currency_id],
            )
            .map_err(write_err("market"))?;
        Ok(Market {
            id: row.try_get(0).map_err(query_err)?,
            code: market.code,
            title: market.title,
            currency_id: market.currency_id,
        })
    }

    fn register_platform(&self, platform: &NewPlatform) -> Result<Platform, JournalError> {
        let mut client = self.connection()?;
        let row = client
            .query_one(
                "INSERT INTO platform (title, description) VALUES ($1, $2) RETURNING id",
                &[&platform.title, &platform.description],
            )
            .map_err(write_err("platform"))?;
        Ok(Platform {
            id: row.try_get(0).map_err(query_err)?,
            title: platform.title.clone(),
            description: platform.description.clone(),
        })
    }

    fn register_instrument(&self, instrument: &NewInstrument) -> Result<Instrument, JournalError> {
        let instrument = instrument.normalized()?;
        let mut client = self.connection()?;
        if !row_exists(&mut *client, "market", instrument.market_id)? {
            return Err(JournalError::not_found("market", instrument.market_id));
        }
        let row = client
            .query_one(
                "INSERT INTO instrument (code, title, market_id, is_active) \
                 VALUES ($1, $2, $3, TRUE) RETURNING id",
                &[&instrument.code, &instrument.title, &instrument.market_id],
            )
            .map_err(write_err("instrument"))?;
        Ok(Instrument {
            id: row.try_get(0).map_err(query_err)?,
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
        let mut client = self.connection()?;
        let row = client
            .query_one(
                "INSERT INTO investment_account (title, owner_id, is_active) \
                 VALUES ($1, $2, TRUE) RETURNING id",
                &[&account.title, &account.owner_id],
            )
            .map_err(write_err("investment_account"))?;
        Ok(InvestmentAccount {
            id: row.try_get(0).map_err(query_err)?,
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
        let mut client = self.connection()?;
        let rows = client
            .query(
                "SELECT id, code, title, market_id, is_active FROM instrument ORDER BY code",
                &[],
            )
            .map_err(query_err)?;
        rows.iter().map(instrument_from_row).collect()
    }
}
