//! Transaction application protocol.
//!
//! Each entry point runs as one [`LedgerStore::atomically`] unit: the
//! position, the settlement cash account and the journal row are written
//! together or not at all. Reference data is resolved here, so the ledgers in
//! [`super::position`] and [`super::cash`] only ever see explicit ids.

use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;

use super::cash::{CashAccount, CashAccountKey, CashTransaction, NewCashMovement};
use super::error::{JournalError, RejectionReason};
use super::position::{
    ApplyResult, CumulativePosition, NewPositionTransaction, PositionTransaction,
    SettlementContext,
};
use super::query::{PositionFilter, PositionOrdering, PositionView, TransactionFilter};
use crate::ports::ledger_port::{LedgerSession, LedgerStore};

/// Attempts a find-or-create loop makes before giving up on a contended key.
pub const MAX_FIND_OR_CREATE_ATTEMPTS: usize = 3;

/// Result of a successfully applied trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedTransaction {
    pub transaction: PositionTransaction,
    pub position: CumulativePosition,
    pub cash_account: CashAccount,
}

/// Result of a successfully applied cash movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedCashMovement {
    pub transaction: CashTransaction,
    pub cash_account: CashAccount,
}

fn exhausted(entity: &str) -> JournalError {
    JournalError::ConstraintViolation {
        entity: entity.to_string(),
        reason: format!("still contended after {MAX_FIND_OR_CREATE_ATTEMPTS} attempts"),
    }
}

/// Fetch the cash account for `key`, creating it with a zero balance when absent.
///
/// A unique-key conflict on insert means another writer created the row
/// first; the loop then re-reads it instead of failing.
pub fn find_or_create_cash_account_in(
    session: &mut dyn LedgerSession,
    key: &CashAccountKey,
) -> Result<CashAccount, JournalError> {
    for attempt in 1..=MAX_FIND_OR_CREATE_ATTEMPTS {
        if let Some(account) = session.lock_cash_account(key)? {
            return Ok(account);
        }
        match session.insert_cash_account(key) {
            Ok(account) => {
                debug!(
                    "created cash account {} for owner {} currency {} platform {}",
                    account.id, key.owner_id, key.currency_id, key.platform_id
                );
                return Ok(account);
            }
            Err(e) if e.is_constraint_violation() => {
                debug!("cash account insert conflicted (attempt {attempt}): {e}");
            }
            Err(e) => return Err(e),
        }
    }
    Err(exhausted("cash_account"))
}

/// The open position for the pair, or a fresh one if the last was completed.
fn find_or_open_position(
    session: &mut dyn LedgerSession,
    instrument_id: i64,
    investment_account_id: i64,
) -> Result<CumulativePosition, JournalError> {
    for attempt in 1..=MAX_FIND_OR_CREATE_ATTEMPTS {
        if let Some(position) = session.lock_open_position(instrument_id, investment_account_id)? {
            return Ok(position);
        }
        match session.insert_position(instrument_id, investment_account_id, Utc::now()) {
            Ok(position) => {
                debug!(
                    "opened position {} for instrument {instrument_id} account {investment_account_id}",
                    position.id
                );
                return Ok(position);
            }
            Err(e) if e.is_constraint_violation() => {
                debug!("position insert conflicted (attempt {attempt}): {e}");
            }
            Err(e) => return Err(e),
        }
    }
    Err(exhausted("cumulative_position"))
}

/// Store-level wrapper around [`find_or_create_cash_account_in`].
pub fn find_or_create_cash_account<S: LedgerStore>(
    store: &S,
    key: &CashAccountKey,
) -> Result<CashAccount, JournalError> {
    store.atomically(|session| {
        ensure_platform(session, key.platform_id)?;
        ensure_currency(session, key.currency_id)?;
        find_or_create_cash_account_in(session, key)
    })
}

fn ensure_platform(session: &mut dyn LedgerSession, id: i64) -> Result<(), JournalError> {
    session
        .platform(id)?
        .map(|_| ())
        .ok_or_else(|| JournalError::not_found("platform", id))
}

fn ensure_currency(session: &mut dyn LedgerSession, id: i64) -> Result<(), JournalError> {
    if session.currency_exists(id)? {
        Ok(())
    } else {
        Err(JournalError::not_found("currency", id))
    }
}

fn reject(reason: RejectionReason) -> JournalError {
    warn!("transaction rejected: {reason}");
    JournalError::RejectedTransaction { reason }
}

/// Record one trade: open or extend the position, settle cash, journal it.
pub fn record_transaction<S: LedgerStore>(
    store: &S,
    request: &NewPositionTransaction,
) -> Result<RecordedTransaction, JournalError> {
    request.validate()?;

    store.atomically(|session| {
        let instrument = session
            .instrument(request.instrument_id)?
            .ok_or_else(|| JournalError::not_found("instrument", request.instrument_id))?;
        let account = session
            .investment_account(request.investment_account_id)?
            .ok_or_else(|| {
                JournalError::not_found("investment account", request.investment_account_id)
            })?;
        let market = session
            .market(instrument.market_id)?
            .ok_or_else(|| JournalError::not_found("market", instrument.market_id))?;
        ensure_platform(session, request.platform_id)?;

        if !instrument.is_active {
            return Err(reject(RejectionReason::InactiveInstrument {
                instrument_id: instrument.id,
            }));
        }
        if !account.is_active {
            return Err(reject(RejectionReason::InactiveAccount {
                investment_account_id: account.id,
            }));
        }

        let settlement = SettlementContext {
            owner_id: account.owner_id,
            currency_id: market.currency_id,
        };

        let mut position = find_or_open_position(session, instrument.id, account.id)?;
        let key = CashAccountKey::platform_default(
            settlement.owner_id,
            settlement.currency_id,
            request.platform_id,
        );
        let mut cash = find_or_create_cash_account_in(session, &key)?;

        let transaction = session.insert_position_transaction(position.id, request, Utc::now())?;

        match position.apply_transaction(&mut cash, &transaction, &settlement)? {
            ApplyResult::Applied { completed } => {
                session.update_position(&position)?;
                session.update_cash_account(&cash)?;
                info!(
                    "{} {} {} @ {} on position {} (cash account {} balance {}){}",
                    transaction.kind,
                    transaction.quantity,
                    instrument.code,
                    transaction.price,
                    position.id,
                    cash.id,
                    cash.balance,
                    if completed { ", position completed" } else { "" }
                );
                Ok(RecordedTransaction {
                    transaction,
                    position,
                    cash_account: cash,
                })
            }
            ApplyResult::Mismatched => Err(reject(RejectionReason::PositionMismatch)),
            ApplyResult::InsufficientQuantity { open, requested } => {
                Err(reject(RejectionReason::InsufficientQuantity { open, requested }))
            }
        }
    })
}

/// Record a deposit, withdrawal or dividend against the cash account for `key`.
pub fn record_cash_movement<S: LedgerStore>(
    store: &S,
    key: &CashAccountKey,
    movement: &NewCashMovement,
) -> Result<RecordedCashMovement, JournalError> {
    movement.validate()?;

    store.atomically(|session| {
        ensure_platform(session, key.platform_id)?;
        ensure_currency(session, key.currency_id)?;

        let mut account = find_or_create_cash_account_in(session, key)?;
        let transaction = session.insert_cash_transaction(&account, movement)?;
        if let Err(e) = account.apply_movement(&transaction) {
            warn!("cash movement rejected: {e}");
            return Err(e);
        }
        session.update_cash_account(&account)?;
        info!(
            "{} {} on cash account {} (balance {})",
            transaction.kind, transaction.amount, account.id, account.balance
        );
        Ok(RecordedCashMovement {
            transaction,
            cash_account: account,
        })
    })
}

/// Filtered positions, sorted by `ordering_spec` (see [`PositionOrdering::parse`]).
pub fn query_positions<S: LedgerStore>(
    store: &S,
    filter: &PositionFilter,
    ordering_spec: &str,
) -> Result<Vec<PositionView>, JournalError> {
    let mut views = store.positions(filter)?;
    PositionOrdering::parse(ordering_spec).sort(&mut views);
    Ok(views)
}

pub fn list_transactions<S: LedgerStore>(
    store: &S,
    filter: &TransactionFilter,
) -> Result<Vec<PositionTransaction>, JournalError> {
    store.transactions(filter)
}

/// Mark a journal entry inactive. Position aggregates are left as they are.
pub fn deactivate_transaction<S: LedgerStore>(store: &S, id: i64) -> Result<bool, JournalError> {
    let changed = store.deactivate_transaction(id)?;
    if changed {
        info!("deactivated transaction {id}");
    }
    Ok(changed)
}
