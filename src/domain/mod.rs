//! Core domain types and ledger logic.

pub mod money;
pub mod reference;
pub mod cash;
pub mod position;
pub mod query;
pub mod journal;
pub mod config_validation;
pub mod error;
