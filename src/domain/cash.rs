//! Cash account ledger.
//!
//! A cash account is a balance bucket for one (owner, currency, platform,
//! label) tuple. Its balance changes in exactly two ways: an explicit cash
//! movement ([`CashAccount::apply_movement`]) or the settlement leg of a
//! trade ([`CashAccount::settle_trade`]). Both check that the movement is
//! addressed to this account's owner, currency and platform first.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use super::error::JournalError;
use super::money::Money;

/// Identity of a cash account. `label == None` is the platform's default account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CashAccountKey {
    pub owner_id: i64,
    pub currency_id: i64,
    pub platform_id: i64,
    pub label: Option<String>,
}

impl CashAccountKey {
    /// The unlabelled account used for trade settlement.
    pub fn platform_default(owner_id: i64, currency_id: i64, platform_id: i64) -> Self {
        CashAccountKey {
            owner_id,
            currency_id,
            platform_id,
            label: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CashAccount {
    pub id: i64,
    pub key: CashAccountKey,
    pub balance: Money,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CashMovementKind {
    Deposit,
    Withdraw,
    Dividend,
}

impl CashMovementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CashMovementKind::Deposit => "DEPOSIT",
            CashMovementKind::Withdraw => "WITHDRAW",
            CashMovementKind::Dividend => "DIVIDEND",
        }
    }

    /// Balance effect of a movement of `amount`.
    pub fn signed(self, amount: Money) -> Money {
        match self {
            CashMovementKind::Deposit | CashMovementKind::Dividend => amount,
            CashMovementKind::Withdraw => -amount,
        }
    }
}

impl fmt::Display for CashMovementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CashMovementKind {
    type Err = JournalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "DEPOSIT" => Ok(CashMovementKind::Deposit),
            "WITHDRAW" => Ok(CashMovementKind::Withdraw),
            "DIVIDEND" => Ok(CashMovementKind::Dividend),
            _ => Err(JournalError::InvalidMovementKind {
                kind: s.to_string(),
            }),
        }
    }
}

/// Caller-supplied payload for a cash movement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCashMovement {
    pub kind: CashMovementKind,
    pub amount: Money,
    pub executed_at: DateTime<Utc>,
    pub description: Option<String>,
}

impl NewCashMovement {
    pub fn validate(&self) -> Result<(), JournalError> {
        if !self.amount.is_positive() {
            return Err(JournalError::invalid_input(
                "amount",
                format!("must be positive, got {}", self.amount),
            ));
        }
        Ok(())
    }
}

/// Immutable journal row for one cash movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CashTransaction {
    pub id: i64,
    pub cash_account_id: i64,
    pub owner_id: i64,
    pub currency_id: i64,
    pub platform_id: i64,
    pub kind: CashMovementKind,
    pub amount: Money,
    pub executed_at: DateTime<Utc>,
    pub description: Option<String>,
    pub is_active: bool,
}

impl CashAccount {
    pub fn new(id: i64, key: CashAccountKey) -> Self {
        CashAccount {
            id,
            key,
            balance: Money::ZERO,
        }
    }

    fn check_addressed(
        &self,
        owner_id: i64,
        currency_id: i64,
        platform_id: i64,
    ) -> Result<(), JournalError> {
        if self.key.currency_id != currency_id {
            return Err(JournalError::RejectedMovement {
                reason: format!(
                    "currency {} does not match cash account {} currency {}",
                    currency_id, self.id, self.key.currency_id
                ),
            });
        }
        if self.key.owner_id != owner_id {
            return Err(JournalError::RejectedMovement {
                reason: format!(
                    "owner {} does not match cash account {} owner {}",
                    owner_id, self.id, self.key.owner_id
                ),
            });
        }
        if self.key.platform_id != platform_id {
            return Err(JournalError::RejectedMovement {
                reason: format!(
                    "platform {} does not match cash account {} platform {}",
                    platform_id, self.id, self.key.platform_id
                ),
            });
        }
        Ok(())
    }

    /// Apply a recorded cash movement: deposits and dividends add, withdrawals subtract.
    pub fn apply_movement(&mut self, movement: &CashTransaction) -> Result<(), JournalError> {
        self.check_addressed(movement.owner_id, movement.currency_id, movement.platform_id)?;
        if movement.cash_account_id != self.id {
            return Err(JournalError::RejectedMovement {
                reason: format!(
                    "cash transaction {} belongs to cash account {}, not {}",
                    movement.id, movement.cash_account_id, self.id
                ),
            });
        }
        if !movement.amount.is_positive() {
            return Err(JournalError::RejectedMovement {
                reason: format!("amount must be positive, got {}", movement.amount),
            });
        }
        self.credit(movement.kind.signed(movement.amount))
    }

    /// Apply the signed settlement of a trade leg (negative for buys).
    pub fn settle_trade(
        &mut self,
        owner_id: i64,
        currency_id: i64,
        platform_id: i64,
        delta: Money,
    ) -> Result<(), JournalError> {
        self.check_addressed(owner_id, currency_id, platform_id)?;
        self.credit(delta)
    }

    /// Balance after adding `delta`, without applying it.
    fn balance_after(&self, delta: Money) -> Result<Money, JournalError> {
        self.balance
            .checked_add(delta)
            .ok_or_else(|| JournalError::out_of_range("balance"))
    }

    fn credit(&mut self, delta: Money) -> Result<(), JournalError> {
        self.balance = self.balance_after(delta)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn account() -> CashAccount {
        CashAccount::new(1, CashAccountKey::platform_default(10, 2, 3))
    }

    fn movement(kind: CashMovementKind, amount: Money) -> CashTransaction {
        CashTransaction {
            id: 1,
            cash_account_id: 1,
            owner_id: 10,
            currency_id: 2,
            platform_id: 3,
            kind,
            amount,
            executed_at: Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap(),
            description: None,
            is_active: true,
        }
    }

    #[test]
    fn deposit_then_withdraw() {
        let mut acc = account();
        acc.apply_movement(&movement(CashMovementKind::Deposit, Money::new(dec!(500))))
            .unwrap();
        acc.apply_movement(&movement(CashMovementKind::Withdraw, Money::new(dec!(200))))
            .unwrap();
        assert_eq!(acc.balance, Money::new(dec!(300)));
    }

    #[test]
    fn dividend_increases_balance() {
        let mut acc = account();
        acc.apply_movement(&movement(CashMovementKind::Dividend, Money::new(dec!(12.34))))
            .unwrap();
        assert_eq!(acc.balance, Money::new(dec!(12.34)));
    }

    #[test]
    fn withdraw_may_overdraw() {
        let mut acc = account();
        acc.apply_movement(&movement(CashMovementKind::Withdraw, Money::new(dec!(50))))
            .unwrap();
        assert_eq!(acc.balance, Money::new(dec!(-50)));
    }

    #[test]
    fn currency_mismatch_rejected_without_effect() {
        let mut acc = account();
        let mut m = movement(CashMovementKind::Deposit, Money::new(dec!(100)));
        m.currency_id = 99;
        match acc.apply_movement(&m) {
            Err(JournalError::RejectedMovement { reason }) => assert!(reason.contains("currency")),
            other => panic!("expected RejectedMovement, got {other:?}"),
        }
        assert_eq!(acc.balance, Money::ZERO);
    }

    #[test]
    fn owner_and_platform_mismatch_rejected() {
        let mut acc = account();
        let mut m = movement(CashMovementKind::Deposit, Money::new(dec!(100)));
        m.owner_id = 11;
        assert!(acc.apply_movement(&m).is_err());

        let mut m = movement(CashMovementKind::Deposit, Money::new(dec!(100)));
        m.platform_id = 4;
        assert!(acc.apply_movement(&m).is_err());
        assert_eq!(acc.balance, Money::ZERO);
    }

    #[test]
    fn settle_trade_checks_key() {
        let mut acc = account();
        acc.settle_trade(10, 2, 3, Money::new(dec!(-1001))).unwrap();
        assert_eq!(acc.balance, Money::new(dec!(-1001)));
        assert!(acc.settle_trade(10, 2, 4, Money::new(dec!(5))).is_err());
        assert_eq!(acc.balance, Money::new(dec!(-1001)));
    }

    #[test]
    fn balance_overflow_is_an_error_and_leaves_balance() {
        let mut acc = account();
        let near_max = Money::new(rust_decimal::Decimal::MAX);
        acc.apply_movement(&movement(CashMovementKind::Deposit, near_max))
            .unwrap();
        match acc.apply_movement(&movement(CashMovementKind::Dividend, Money::new(dec!(1)))) {
            Err(JournalError::InvalidInput { field, .. }) => assert_eq!(field, "balance"),
            other => panic!("expected InvalidInput, got {other:?}"),
        }
        assert_eq!(acc.balance, near_max);
    }

    #[test]
    fn movement_kind_parsing() {
        assert_eq!(
            "deposit".parse::<CashMovementKind>().unwrap(),
            CashMovementKind::Deposit
        );
        assert_eq!(
            "WITHDRAW".parse::<CashMovementKind>().unwrap(),
            CashMovementKind::Withdraw
        );
        match "TRANSFER".parse::<CashMovementKind>() {
            Err(JournalError::InvalidMovementKind { kind }) => assert_eq!(kind, "TRANSFER"),
            other => panic!("expected InvalidMovementKind, got {other:?}"),
        }
    }

    #[test]
    fn new_movement_requires_positive_amount() {
        let m = NewCashMovement {
            kind: CashMovementKind::Deposit,
            amount: Money::ZERO,
            executed_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            description: None,
        };
        assert!(matches!(m.validate(), Err(JournalError::InvalidInput { .. })));
    }
}
