//! Cumulative position ledger.
//!
//! A [`CumulativePosition`] aggregates every trade of one instrument within one
//! investment account from the first BUY until the quantity returns to zero.
//! It has two states, open and completed; completion is terminal and a later
//! trade for the same pair opens a fresh position.
//!
//! The ledger never reaches through reference data. The owner and settlement
//! currency arrive as a [`SettlementContext`], the cash account is passed in
//! by the caller, and persistence is the caller's business.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use super::cash::CashAccount;
use super::error::JournalError;
use super::money::{Money, Price, Quantity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Buy,
    Sell,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionKind::Buy => "BUY",
            TransactionKind::Sell => "SELL",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = JournalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "BUY" => Ok(TransactionKind::Buy),
            "SELL" => Ok(TransactionKind::Sell),
            _ => Err(JournalError::invalid_input(
                "kind",
                format!("expected BUY or SELL, got {s:?}"),
            )),
        }
    }
}

/// Trade payload as submitted by the caller, before it is journaled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPositionTransaction {
    pub instrument_id: i64,
    pub investment_account_id: i64,
    pub platform_id: i64,
    pub kind: TransactionKind,
    pub price: Price,
    pub quantity: Quantity,
    pub commission: Money,
    pub executed_at: DateTime<Utc>,
    pub executed_by: i64,
    pub description: String,
    pub notes: String,
    pub time_frame: Option<String>,
    pub pattern: Option<String>,
}

impl NewPositionTransaction {
    /// Checks the numeric payload before anything is touched.
    pub fn validate(&self) -> Result<(), JournalError> {
        if self.price.is_negative() {
            return Err(JournalError::invalid_input(
                "price",
                format!("must be non-negative, got {}", self.price),
            ));
        }
        if !self.quantity.is_positive() {
            return Err(JournalError::invalid_input(
                "quantity",
                format!("must be positive, got {}", self.quantity),
            ));
        }
        if self.commission.is_negative() {
            return Err(JournalError::invalid_input(
                "commission",
                format!("must be non-negative, got {}", self.commission),
            ));
        }
        Ok(())
    }
}

/// Journal entry for one trade. Never mutated after insert, only deactivated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PositionTransaction {
    pub id: i64,
    pub cumulative_position_id: i64,
    pub instrument_id: i64,
    pub investment_account_id: i64,
    pub platform_id: i64,
    pub kind: TransactionKind,
    pub price: Price,
    pub quantity: Quantity,
    pub commission: Money,
    pub executed_at: DateTime<Utc>,
    pub executed_by: i64,
    pub description: String,
    pub notes: String,
    pub time_frame: Option<String>,
    pub pattern: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl PositionTransaction {
    /// Price times quantity, commission excluded.
    pub fn notional(&self) -> Result<Money, JournalError> {
        in_range(self.price.checked_mul(self.quantity), "notional")
    }
}

/// Owner and settlement currency for the pair a position tracks, resolved by
/// the caller from the investment account and the instrument's market.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlementContext {
    pub owner_id: i64,
    pub currency_id: i64,
}

/// Outcome of [`CumulativePosition::apply_transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyResult {
    Applied { completed: bool },
    /// Transaction was routed to the wrong position. Caller-side bug.
    Mismatched,
    /// SELL larger than what is open. Nothing was changed.
    InsufficientQuantity { open: Quantity, requested: Quantity },
}

impl ApplyResult {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyResult::Applied { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CumulativePosition {
    pub id: i64,
    pub instrument_id: i64,
    pub investment_account_id: i64,
    pub quantity: Quantity,
    /// Weighted average of BUY prices only.
    pub avg_cost: Price,
    pub total_buys: Quantity,
    pub total_sells: Quantity,
    pub total_buy_amount: Money,
    pub total_sell_amount: Money,
    pub total_commission_cost: Money,
    pub is_completed: bool,
    pub first_transaction_at: DateTime<Utc>,
    pub last_transaction_at: Option<DateTime<Utc>>,
}

impl CumulativePosition {
    /// A fresh, empty, open position awaiting its first BUY.
    pub fn open(
        id: i64,
        instrument_id: i64,
        investment_account_id: i64,
        opened_at: DateTime<Utc>,
    ) -> Self {
        CumulativePosition {
            id,
            instrument_id,
            investment_account_id,
            quantity: Quantity::ZERO,
            avg_cost: Price::ZERO,
            total_buys: Quantity::ZERO,
            total_sells: Quantity::ZERO,
            total_buy_amount: Money::ZERO,
            total_sell_amount: Money::ZERO,
            total_commission_cost: Money::ZERO,
            is_completed: false,
            first_transaction_at: opened_at,
            last_transaction_at: None,
        }
    }

    /// `(buy amount + commission - sell amount) / quantity` while open.
    pub fn adjusted_avg_cost(&self) -> Result<Option<Price>, JournalError> {
        if self.is_completed || self.quantity.is_zero() {
            return Ok(None);
        }
        let remaining = in_range(
            self.cost_basis()?.checked_sub(self.total_sell_amount),
            "adjusted_avg_cost",
        )?;
        remaining.per_unit(self.quantity)
    }

    /// Realized P&L, defined once the position is completed.
    pub fn pnl_amount(&self) -> Result<Option<Money>, JournalError> {
        if !self.is_completed {
            return Ok(None);
        }
        let pnl = self.total_sell_amount.checked_sub(self.cost_basis()?);
        in_range(pnl, "pnl_amount").map(Some)
    }

    /// P&L over total cost (buys plus commission). `None` while open or when
    /// the cost base is zero.
    pub fn pnl_ratio(&self) -> Result<Option<Decimal>, JournalError> {
        match self.pnl_amount()? {
            Some(pnl) => pnl.ratio_of(self.cost_basis()?),
            None => Ok(None),
        }
    }

    fn cost_basis(&self) -> Result<Money, JournalError> {
        in_range(
            self.total_buy_amount.checked_add(self.total_commission_cost),
            "cost_basis",
        )
    }

    /// Apply one journaled trade to this position and its settlement cash account.
    ///
    /// The new aggregates and the cash delta are computed into a copy first,
    /// so a non-`Applied` result or an error (including arithmetic overflow)
    /// leaves both `self` and `cash` untouched.
    ///
    /// BUY: average cost is recomputed from BUY legs, cash is debited by
    /// notional plus commission. SELL: rejected when larger than the open
    /// quantity, otherwise cash is credited by notional and debited by
    /// commission. The position completes when quantity returns to zero.
    pub fn apply_transaction(
        &mut self,
        cash: &mut CashAccount,
        txn: &PositionTransaction,
        settlement: &SettlementContext,
    ) -> Result<ApplyResult, JournalError> {
        if txn.instrument_id != self.instrument_id
            || txn.investment_account_id != self.investment_account_id
            || self.is_completed
        {
            return Ok(ApplyResult::Mismatched);
        }
        if txn.kind == TransactionKind::Sell && txn.quantity > self.quantity {
            return Ok(ApplyResult::InsufficientQuantity {
                open: self.quantity,
                requested: txn.quantity,
            });
        }

        let notional = txn.notional()?;
        let mut next = self.clone();
        let cash_delta = match txn.kind {
            TransactionKind::Buy => {
                next.avg_cost = in_range(
                    Price::weighted_average(self.total_buys, self.avg_cost, txn.quantity, txn.price),
                    "avg_cost",
                )?;
                next.quantity = in_range(self.quantity.checked_add(txn.quantity), "quantity")?;
                next.total_buys = in_range(self.total_buys.checked_add(txn.quantity), "total_buys")?;
                next.total_buy_amount = in_range(
                    self.total_buy_amount.checked_add(notional),
                    "total_buy_amount",
                )?;
                next.first_transaction_at = self.first_transaction_at.min(txn.executed_at);
                in_range((-notional).checked_sub(txn.commission), "balance")?
            }
            TransactionKind::Sell => {
                next.quantity = in_range(self.quantity.checked_sub(txn.quantity), "quantity")?;
                next.total_sells =
                    in_range(self.total_sells.checked_add(txn.quantity), "total_sells")?;
                next.total_sell_amount = in_range(
                    self.total_sell_amount.checked_add(notional),
                    "total_sell_amount",
                )?;
                in_range(notional.checked_sub(txn.commission), "balance")?
            }
        };
        next.total_commission_cost = in_range(
            self.total_commission_cost.checked_add(txn.commission),
            "total_commission_cost",
        )?;

        if next.quantity.is_zero() {
            next.is_completed = true;
            next.last_transaction_at = Some(match self.last_transaction_at {
                Some(last) => last.max(txn.executed_at),
                None => txn.executed_at,
            });
        }

        // Stored aggregates must stay readable as views.
        next.adjusted_avg_cost()?;
        next.pnl_ratio()?;

        cash.settle_trade(
            settlement.owner_id,
            settlement.currency_id,
            txn.platform_id,
            cash_delta,
        )?;
        *self = next;

        Ok(ApplyResult::Applied {
            completed: self.is_completed,
        })
    }
}

fn in_range<T>(value: Option<T>, field: &str) -> Result<T, JournalError> {
    value.ok_or_else(|| JournalError::out_of_range(field))
}
