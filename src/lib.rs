//! monfaristo: portfolio journal and position ledger.
//!
//! Hexagonal architecture: accounting rules in [`domain`], port traits in
//! [`ports`], storage/config/import implementations in [`adapters`], and the
//! command-line front end in [`cli`].

pub mod domain;
pub mod ports;
pub mod adapters;
pub mod cli;
