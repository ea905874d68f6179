//! Ledger storage port.
//!
//! [`LedgerStore::atomically`] runs a unit of work against a
//! [`LedgerSession`] inside one storage transaction: the unit's writes are
//! committed together when it returns `Ok`, and discarded when it returns
//! `Err`. Implementations must serialise units touching the same open
//! position (row lock or database write lock).

use crate::domain::cash::{CashAccount, CashAccountKey, CashTransaction, NewCashMovement};
use crate::domain::error::JournalError;
use crate::domain::position::{CumulativePosition, NewPositionTransaction, PositionTransaction};
use crate::domain::query::{PositionFilter, TransactionFilter};
use crate::domain::query::PositionView;
use crate::domain::reference::{Instrument, InvestmentAccount, Market, Platform};
use chrono::{DateTime, Utc};

/// Operations available inside one storage transaction.
pub trait LedgerSession {
    fn instrument(&mut self, id: i64) -> Result<Option<Instrument>, JournalError>;

    fn market(&mut self, id: i64) -> Result<Option<Market>, JournalError>;

    fn platform(&mut self, id: i64) -> Result<Option<Platform>, JournalError>;

    fn investment_account(&mut self, id: i64) -> Result<Option<InvestmentAccount>, JournalError>;

    fn currency_exists(&mut self, id: i64) -> Result<bool, JournalError>;

    /// The open position for the pair, locked for the rest of the unit.
    fn lock_open_position(
        &mut self,
        instrument_id: i64,
        investment_account_id: i64,
    ) -> Result<Option<CumulativePosition>, JournalError>;

    /// Insert an empty open position. Fails with `ConstraintViolation` when
    /// an open position for the pair already exists.
    fn insert_position(
        &mut self,
        instrument_id: i64,
        investment_account_id: i64,
        opened_at: DateTime<Utc>,
    ) -> Result<CumulativePosition, JournalError>;

    fn update_position(&mut self, position: &CumulativePosition) -> Result<(), JournalError>;

    /// The cash account for `key`, locked for the rest of the unit.
    fn lock_cash_account(
        &mut self,
        key: &CashAccountKey,
    ) -> Result<Option<CashAccount>, JournalError>;

    /// Insert a zero-balance cash account. Fails with `ConstraintViolation`
    /// when the key is already taken.
    fn insert_cash_account(&mut self, key: &CashAccountKey) -> Result<CashAccount, JournalError>;

    fn update_cash_account(&mut self, account: &CashAccount) -> Result<(), JournalError>;

    fn insert_position_transaction(
        &mut self,
        cumulative_position_id: i64,
        txn: &NewPositionTransaction,
        created_at: DateTime<Utc>,
    ) -> Result<PositionTransaction, JournalError>;

    fn insert_cash_transaction(
        &mut self,
        account: &CashAccount,
        movement: &NewCashMovement,
    ) -> Result<CashTransaction, JournalError>;
}

/// Ledger storage: atomic units of work plus read-side queries.
pub trait LedgerStore {
    /// Create tables and indexes if they do not exist yet.
    fn initialize_schema(&self) -> Result<(), JournalError>;

    fn atomically<T, F>(&self, work: F) -> Result<T, JournalError>
    where
        F: FnOnce(&mut dyn LedgerSession) -> Result<T, JournalError>;

    /// Positions matching `filter`, in ascending id order.
    fn positions(&self, filter: &PositionFilter) -> Result<Vec<PositionView>, JournalError>;

    fn position(&self, id: i64) -> Result<Option<PositionView>, JournalError>;

    /// Journal entries matching `filter`, ordered by execution time then id.
    fn transactions(
        &self,
        filter: &TransactionFilter,
    ) -> Result<Vec<PositionTransaction>, JournalError>;

    /// All transactions linked to one position, in journal order.
    fn position_transactions(
        &self,
        cumulative_position_id: i64,
    ) -> Result<Vec<PositionTransaction>, JournalError>;

    fn cash_accounts(&self, owner_id: i64) -> Result<Vec<CashAccount>, JournalError>;

    fn cash_transactions(
        &self,
        cash_account_id: i64,
    ) -> Result<Vec<CashTransaction>, JournalError>;

    /// Soft-deactivate a journal entry. Returns whether a row changed.
    fn deactivate_transaction(&self, id: i64) -> Result<bool, JournalError>;
}
