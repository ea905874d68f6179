//! Domain error types.

use std::fmt;

use super::money::Quantity;

/// Why a trade was refused by the position ledger or the application protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    /// SELL larger than the open quantity. Short selling is not supported.
    InsufficientQuantity { open: Quantity, requested: Quantity },
    /// Transaction instrument/account does not match the targeted position.
    PositionMismatch,
    InactiveInstrument { instrument_id: i64 },
    InactiveAccount { investment_account_id: i64 },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::InsufficientQuantity { open, requested } => write!(
                f,
                "sell quantity {requested} exceeds open quantity {open}"
            ),
            RejectionReason::PositionMismatch => {
                write!(f, "transaction does not belong to the targeted position")
            }
            RejectionReason::InactiveInstrument { instrument_id } => {
                write!(f, "instrument {instrument_id} is inactive")
            }
            RejectionReason::InactiveAccount {
                investment_account_id,
            } => write!(f, "investment account {investment_account_id} is inactive"),
        }
    }
}

/// Top-level error type for monfaristo.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("database error: {reason}")]
    Database { reason: String },

    #[error("database query error: {reason}")]
    DatabaseQuery { reason: String },

    #[error("constraint violation on {entity}: {reason}")]
    ConstraintViolation { entity: String, reason: String },

    #[error("transaction rejected: {reason}")]
    RejectedTransaction { reason: RejectionReason },

    #[error("cash movement rejected: {reason}")]
    RejectedMovement { reason: String },

    #[error("invalid cash movement kind: {kind}")]
    InvalidMovementKind { kind: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: i64 },

    #[error("invalid {field}: {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error("csv error at row {row}: {reason}")]
    Csv { row: usize, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl JournalError {
    pub fn not_found(entity: &str, id: i64) -> Self {
        JournalError::NotFound {
            entity: entity.to_string(),
            id,
        }
    }

    pub fn invalid_input(field: &str, reason: impl Into<String>) -> Self {
        JournalError::InvalidInput {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Arithmetic on `field` would leave the representable decimal range.
    pub fn out_of_range(field: &str) -> Self {
        JournalError::invalid_input(field, "amount out of range")
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, JournalError::ConstraintViolation { .. })
    }

    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            JournalError::RejectedTransaction { .. }
                | JournalError::RejectedMovement { .. }
                | JournalError::InvalidMovementKind { .. }
        )
    }
}

impl From<&JournalError> for std::process::ExitCode {
    fn from(err: &JournalError) -> Self {
        let code: u8 = match err {
            JournalError::Io(_) | JournalError::Csv { .. } => 1,
            JournalError::ConfigParse { .. }
            | JournalError::ConfigMissing { .. }
            | JournalError::ConfigInvalid { .. } => 2,
            JournalError::Database { .. }
            | JournalError::DatabaseQuery { .. }
            | JournalError::ConstraintViolation { .. } => 3,
            JournalError::RejectedTransaction { .. }
            | JournalError::RejectedMovement { .. }
            | JournalError::InvalidMovementKind { .. } => 4,
            JournalError::NotFound { .. } | JournalError::InvalidInput { .. } => 5,
        };
        std::process::ExitCode::from(code)
    }
}
