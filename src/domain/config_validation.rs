//! Configuration validation.
//!
//! Runs before any store is opened, so a bad file fails fast with the
//! offending section and key.

use crate::domain::error::JournalError;
use crate::domain::query::PositionOrdering;
use crate::ports::config_port::ConfigPort;
use log::LevelFilter;
use std::str::FromStr;

pub const DEFAULT_POOL_SIZE: i64 = 4;
pub const DEFAULT_BUSY_TIMEOUT_MS: i64 = 5000;
pub const DEFAULT_ORDERING: &str = "id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Sqlite,
    Postgres,
}

impl StorageBackend {
    /// `[storage] backend`, defaulting to sqlite.
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, JournalError> {
        match config
            .get_string("storage", "backend")
            .map(|s| s.trim().to_lowercase())
            .as_deref()
        {
            None | Some("") | Some("sqlite") => Ok(StorageBackend::Sqlite),
            Some("postgres") | Some("postgresql") => Ok(StorageBackend::Postgres),
            Some(other) => Err(JournalError::ConfigInvalid {
                section: "storage".to_string(),
                key: "backend".to_string(),
                reason: format!("unknown backend {other:?}, expected sqlite or postgres"),
            }),
        }
    }
}

pub fn validate_journal_config(config: &dyn ConfigPort) -> Result<(), JournalError> {
    match StorageBackend::from_config(config)? {
        StorageBackend::Sqlite => validate_sqlite(config)?,
        StorageBackend::Postgres => validate_postgres(config)?,
    }
    log_level(config)?;
    validate_default_ordering(config)?;
    Ok(())
}

fn require_non_empty(config: &dyn ConfigPort, section: &str, key: &str) -> Result<(), JournalError> {
    match config.get_string(section, key) {
        Some(s) if !s.trim().is_empty() => Ok(()),
        _ => Err(JournalError::ConfigMissing {
            section: section.to_string(),
            key: key.to_string(),
        }),
    }
}

fn validate_pool_size(config: &dyn ConfigPort, section: &str) -> Result<(), JournalError> {
    let value = config.get_int(section, "pool_size", DEFAULT_POOL_SIZE);
    if value <= 0 || value > u32::MAX as i64 {
        return Err(JournalError::ConfigInvalid {
            section: section.to_string(),
            key: "pool_size".to_string(),
            reason: "pool_size must be a positive integer".to_string(),
        });
    }
    Ok(())
}

fn validate_sqlite(config: &dyn ConfigPort) -> Result<(), JournalError> {
    require_non_empty(config, "sqlite", "path")?;
    validate_pool_size(config, "sqlite")?;
    let timeout = config.get_int("sqlite", "busy_timeout_ms", DEFAULT_BUSY_TIMEOUT_MS);
    if timeout < 0 {
        return Err(JournalError::ConfigInvalid {
            section: "sqlite".to_string(),
            key: "busy_timeout_ms".to_string(),
            reason: "busy_timeout_ms must be non-negative".to_string(),
        });
    }
    Ok(())
}

fn validate_postgres(config: &dyn ConfigPort) -> Result<(), JournalError> {
    require_non_empty(config, "postgres", "connection_string")?;
    validate_pool_size(config, "postgres")
}

/// `[logging] level`, defaulting to info.
pub fn log_level(config: &dyn ConfigPort) -> Result<LevelFilter, JournalError> {
    match config.get_string("logging", "level") {
        None => Ok(LevelFilter::Info),
        Some(s) => LevelFilter::from_str(s.trim()).map_err(|_| JournalError::ConfigInvalid {
            section: "logging".to_string(),
            key: "level".to_string(),
            reason: format!("unknown level {s:?}, expected off, error, warn, info, debug or trace"),
        }),
    }
}

fn validate_default_ordering(config: &dyn ConfigPort) -> Result<(), JournalError> {
    if let Some(spec) = config.get_string("journal", "default_ordering") {
        if !spec.trim().is_empty() && PositionOrdering::parse(&spec).is_empty() {
            return Err(JournalError::ConfigInvalid {
                section: "journal".to_string(),
                key: "default_ordering".to_string(),
                reason: format!("{spec:?} names no known ordering field"),
            });
        }
    }
    Ok(())
}

/// `[journal] default_ordering`, used when a query gives no ordering of its own.
pub fn default_ordering(config: &dyn ConfigPort) -> String {
    config
        .get_string("journal", "default_ordering")
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_ORDERING.to_string())
}
