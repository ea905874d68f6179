//! Port traits for the hexagonal architecture.

pub mod config_port;
pub mod ledger_port;
pub mod reference_port;
