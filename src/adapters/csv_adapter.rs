//! CSV trade import.
//!
//! Expected header:
//! `instrument_id,investment_account_id,platform_id,kind,price,quantity,commission,executed_at,executed_by,description,notes`
//! with optional trailing `time_frame` and `pattern` columns. The whole file is
//! parsed before anything is recorded; each row is then recorded in its own
//! atomic unit and the import stops at the first row the ledger refuses.

use crate::domain::error::JournalError;
use crate::domain::journal::{RecordedTransaction, record_transaction};
use crate::domain::money::{Money, Price, Quantity};
use crate::domain::position::{NewPositionTransaction, TransactionKind};
use crate::ports::ledger_port::LedgerStore;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use log::{info, warn};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Deserialize)]
struct TradeRow {
    instrument_id: i64,
    investment_account_id: i64,
    platform_id: i64,
    kind: String,
    price: String,
    quantity: String,
    #[serde(default)]
    commission: String,
    executed_at: String,
    executed_by: i64,
    #[serde(default)]
    description: String,
    #[serde(default)]
    notes: String,
    #[serde(default)]
    time_frame: Option<String>,
    #[serde(default)]
    pattern: Option<String>,
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) or a bare `YYYY-MM-DD` (midnight UTC).
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, JournalError> {
    let value = value.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(t.and_utc());
    }
    if let Ok(d) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(d.and_time(chrono::NaiveTime::MIN).and_utc());
    }
    Err(JournalError::invalid_input(
        "executed_at",
        format!("unrecognised timestamp {value:?}"),
    ))
}

fn parse_decimal<T: From<rust_decimal::Decimal>>(field: &str, value: &str) -> Result<T, JournalError> {
    rust_decimal::Decimal::from_str(value.trim())
        .map(T::from)
        .map_err(|e| JournalError::invalid_input(field, format!("{value:?}: {e}")))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl TradeRow {
    fn into_request(self) -> Result<NewPositionTransaction, JournalError> {
        let commission = if self.commission.trim().is_empty() {
            Money::ZERO
        } else {
            parse_decimal::<Money>("commission", &self.commission)?
        };
        let request = NewPositionTransaction {
            instrument_id: self.instrument_id,
            investment_account_id: self.investment_account_id,
            platform_id: self.platform_id,
            kind: TransactionKind::from_str(&self.kind)?,
            price: parse_decimal::<Price>("price", &self.price)?,
            quantity: parse_decimal::<Quantity>("quantity", &self.quantity)?,
            commission,
            executed_at: parse_timestamp(&self.executed_at)?,
            executed_by: self.executed_by,
            description: self.description,
            notes: self.notes,
            time_frame: non_empty(self.time_frame),
            pattern: non_empty(self.pattern),
        };
        request.validate()?;
        Ok(request)
    }
}

/// Outcome of an import run. `failed` holds the 1-based data row that stopped it.
#[derive(Debug)]
pub struct ImportReport {
    pub recorded: Vec<RecordedTransaction>,
    pub failed: Option<(usize, JournalError)>,
}

pub struct CsvTradeImporter {
    path: PathBuf,
}

impl CsvTradeImporter {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Parse and validate every row without touching any store.
    pub fn read(&self) -> Result<Vec<NewPositionTransaction>, JournalError> {
        let content = fs::read_to_string(&self.path)?;
        parse_trades(&content)
    }

    pub fn import<S: LedgerStore>(&self, store: &S) -> Result<ImportReport, JournalError> {
        let requests = self.read()?;
        let mut recorded = Vec::with_capacity(requests.len());

        for (idx, request) in requests.iter().enumerate() {
            match record_transaction(store, request) {
                Ok(r) => recorded.push(r),
                Err(e) => {
                    warn!(
                        "import of {} stopped at row {}: {e}",
                        self.path.display(),
                        idx + 1
                    );
                    return Ok(ImportReport {
                        recorded,
                        failed: Some((idx + 1, e)),
                    });
                }
            }
        }

        info!(
            "imported {} transactions from {}",
            recorded.len(),
            self.path.display()
        );
        Ok(ImportReport {
            recorded,
            failed: None,
        })
    }
}

pub fn parse_trades(content: &str) -> Result<Vec<NewPositionTransaction>, JournalError> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let mut requests = Vec::new();
    for (idx, result) in rdr.deserialize::<TradeRow>().enumerate() {
        let row = idx + 1;
        let record = result.map_err(|e| JournalError::Csv {
            row,
            reason: e.to_string(),
        })?;
        let request = record.into_request().map_err(|e| JournalError::Csv {
            row,
            reason: e.to_string(),
        })?;
        requests.push(request);
    }
    Ok(requests)
}
