//! CLI definition and dispatch.
//!
//! Every command loads and validates the INI file, installs the logger, opens
//! the configured store (creating the schema if needed) and runs against it.
//! Results go to stdout; diagnostics go to stderr.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;
use serde::Serialize;
use simple_logger::SimpleLogger;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use crate::adapters::csv_adapter::{parse_timestamp, CsvTradeImporter};
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::domain::cash::{CashAccount, CashAccountKey, CashMovementKind, NewCashMovement};
use crate::domain::config_validation::{
    default_ordering, log_level, validate_journal_config, StorageBackend,
};
use crate::domain::error::JournalError;
use crate::domain::journal::{
    deactivate_transaction, list_transactions, query_positions, record_cash_movement,
    record_transaction,
};
use crate::domain::money::{Money, Price, Quantity};
use crate::domain::position::{NewPositionTransaction, PositionTransaction, TransactionKind};
use crate::domain::query::{PositionFilter, PositionView, TransactionFilter};
use crate::domain::reference::{
    NewCurrency, NewInstrument, NewInvestmentAccount, NewMarket, NewPlatform,
};
use crate::ports::config_port::ConfigPort;
use crate::ports::ledger_port::LedgerStore;
use crate::ports::reference_port::ReferencePort;

#[derive(Parser, Debug)]
#[command(name = "monfaristo", about = "Portfolio journal and position ledger")]
pub struct Cli {
    /// INI configuration file
    #[arg(short, long, global = true, default_value = "monfaristo.ini")]
    pub config: PathBuf,

    /// Override `[logging] level`
    #[arg(long, global = true)]
    pub log_level: Option<LevelFilter>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the storage schema
    Init,
    /// Register reference data
    Register {
        #[command(subcommand)]
        entity: RegisterCommand,
    },
    /// Activate or deactivate an instrument or investment account
    SetActive {
        target: ActiveTarget,
        id: i64,
        #[arg(action = clap::ArgAction::Set)]
        active: bool,
    },
    /// Record a BUY or SELL
    Record {
        kind: TransactionKind,
        #[arg(long)]
        instrument: i64,
        #[arg(long)]
        account: i64,
        #[arg(long)]
        platform: i64,
        #[arg(long)]
        price: Price,
        #[arg(long)]
        quantity: Quantity,
        #[arg(long, default_value = "0")]
        commission: Money,
        /// Defaults to now
        #[arg(long, value_parser = parse_timestamp)]
        executed_at: Option<DateTime<Utc>>,
        #[arg(long)]
        executed_by: i64,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "")]
        notes: String,
        #[arg(long)]
        time_frame: Option<String>,
        #[arg(long)]
        pattern: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Record a deposit, withdrawal or dividend
    Cash {
        kind: CashMovementKind,
        amount: Money,
        #[arg(long)]
        owner: i64,
        #[arg(long)]
        currency: i64,
        #[arg(long)]
        platform: i64,
        #[arg(long)]
        label: Option<String>,
        #[arg(long, value_parser = parse_timestamp)]
        executed_at: Option<DateTime<Utc>>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Query positions
    Positions {
        #[arg(long)]
        instrument_id: Option<i64>,
        /// Instrument code, case-insensitive
        #[arg(long)]
        instrument: Option<String>,
        #[arg(long)]
        market_id: Option<i64>,
        #[arg(long)]
        market: Option<String>,
        #[arg(long)]
        account: Option<i64>,
        #[arg(long)]
        completed: Option<bool>,
        /// e.g. "-pnl_amount,id"; defaults to `[journal] default_ordering`
        #[arg(long)]
        ordering: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show one position and its journal entries
    Position {
        id: i64,
        #[arg(long)]
        json: bool,
    },
    /// List journal entries
    Transactions {
        /// Instrument code fragment
        #[arg(short, long)]
        q: Option<String>,
        #[arg(long)]
        account: Option<i64>,
        #[arg(long)]
        executed_by: Option<i64>,
        #[arg(long)]
        active: Option<bool>,
        #[arg(long)]
        kind: Option<TransactionKind>,
        #[arg(long)]
        json: bool,
    },
    /// Soft-deactivate a journal entry
    Deactivate { id: i64 },
    /// Import trades from a CSV file
    Import { file: PathBuf },
    /// List an owner's cash accounts
    CashAccounts {
        owner: i64,
        #[arg(long)]
        json: bool,
    },
    /// List the movements of one cash account
    CashHistory {
        cash_account: i64,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum RegisterCommand {
    Currency {
        code: String,
        title: String,
        #[arg(long)]
        symbol: Option<String>,
    },
    Market {
        code: String,
        title: String,
        #[arg(long)]
        currency: i64,
    },
    Platform {
        title: String,
        #[arg(long)]
        description: Option<String>,
    },
    Instrument {
        code: String,
        title: String,
        #[arg(long)]
        market: i64,
    },
    Account {
        title: String,
        #[arg(long)]
        owner: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ActiveTarget {
    Instrument,
    Account,
}

pub fn run(cli: Cli) -> ExitCode {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    run_with_output(cli, &mut out)
}

/// [`run`] with an explicit sink for command output.
pub fn run_with_output(cli: Cli, out: &mut dyn Write) -> ExitCode {
    let config = match load_config(&cli.config) {
        Ok(c) => c,
        Err(code) => return code,
    };

    if let Err(e) = validate_journal_config(&config) {
        eprintln!("error: {e}");
        return (&e).into();
    }

    let level = match cli.log_level {
        Some(level) => level,
        None => log_level(&config).unwrap_or(LevelFilter::Info),
    };
    init_logging(level, config.get_bool("logging", "timestamps", true));

    match execute(&config, cli.command, out) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            (&e).into()
        }
    }
}

pub fn load_config(path: &Path) -> Result<FileConfigAdapter, ExitCode> {
    FileConfigAdapter::from_file(path).map_err(|e| {
        let err = JournalError::ConfigParse {
            file: path.display().to_string(),
            reason: e.to_string(),
        };
        eprintln!("error: {err}");
        ExitCode::from(&err)
    })
}

fn init_logging(level: LevelFilter, timestamps: bool) {
    let logger = SimpleLogger::new().with_level(level);
    let logger = if timestamps {
        logger.with_utc_timestamps()
    } else {
        logger.without_timestamps()
    };
    if logger.init().is_err() {
        // A logger is already installed in this process; only adjust the level.
        log::set_max_level(level);
    }
}

fn execute(
    config: &FileConfigAdapter,
    command: Command,
    out: &mut dyn Write,
) -> Result<(), JournalError> {
    let ordering = default_ordering(config);
    match StorageBackend::from_config(config)? {
        StorageBackend::Sqlite => execute_sqlite(config, command, &ordering, out),
        StorageBackend::Postgres => execute_postgres(config, command, &ordering, out),
    }
}

#[cfg(feature = "sqlite")]
fn execute_sqlite(
    config: &FileConfigAdapter,
    command: Command,
    ordering: &str,
    out: &mut dyn Write,
) -> Result<(), JournalError> {
    let store = crate::adapters::sqlite_adapter::SqliteAdapter::from_config(config)?;
    dispatch(&store, command, ordering, out)
}

#[cfg(not(feature = "sqlite"))]
fn execute_sqlite(
    _config: &FileConfigAdapter,
    _command: Command,
    _ordering: &str,
    _out: &mut dyn Write,
) -> Result<(), JournalError> {
    Err(missing_backend("sqlite"))
}

#[cfg(feature = "postgres")]
fn execute_postgres(
    config: &FileConfigAdapter,
    command: Command,
    ordering: &str,
    out: &mut dyn Write,
) -> Result<(), JournalError> {
    let store = crate::adapters::postgres_adapter::PostgresAdapter::from_config(config)?;
    dispatch(&store, command, ordering, out)
}

#[cfg(not(feature = "postgres"))]
fn execute_postgres(
    _config: &FileConfigAdapter,
    _command: Command,
    _ordering: &str,
    _out: &mut dyn Write,
) -> Result<(), JournalError> {
    Err(missing_backend("postgres"))
}

#[allow(dead_code)]
fn missing_backend(name: &str) -> JournalError {
    JournalError::ConfigInvalid {
        section: "storage".to_string(),
        key: "backend".to_string(),
        reason: format!("{name} support not compiled in; rebuild with --features {name}"),
    }
}

/// Run one command against an opened store.
pub fn dispatch<S: LedgerStore + ReferencePort>(
    store: &S,
    command: Command,
    default_ordering: &str,
    out: &mut dyn Write,
) -> Result<(), JournalError> {
    store.initialize_schema()?;

    match command {
        Command::Init => {
            writeln!(out, "schema ready")?;
            Ok(())
        }
        Command::Register { entity } => register(store, entity, out),
        Command::SetActive { target, id, active } => {
            match target {
                ActiveTarget::Instrument => store.set_instrument_active(id, active)?,
                ActiveTarget::Account => store.set_investment_account_active(id, active)?,
            }
            let label = match target {
                ActiveTarget::Instrument => "instrument",
                ActiveTarget::Account => "investment account",
            };
            let state = if active { "active" } else { "inactive" };
            writeln!(out, "{label} {id} is now {state}")?;
            Ok(())
        }
        Command::Record {
            kind,
            instrument,
            account,
            platform,
            price,
            quantity,
            commission,
            executed_at,
            executed_by,
            description,
            notes,
            time_frame,
            pattern,
            json,
        } => {
            let request = NewPositionTransaction {
                instrument_id: instrument,
                investment_account_id: account,
                platform_id: platform,
                kind,
                price,
                quantity,
                commission,
                executed_at: executed_at.unwrap_or_else(Utc::now),
                executed_by,
                description,
                notes,
                time_frame,
                pattern,
            };
            let recorded = record_transaction(store, &request)?;
            if json {
                return write_json(out, &recorded);
            }
            let p = &recorded.position;
            writeln!(
                out,
                "recorded transaction {} on position {}: quantity {} avg_cost {}{}",
                recorded.transaction.id,
                p.id,
                p.quantity,
                p.avg_cost,
                if p.is_completed { " (completed)" } else { "" }
            )?;
            writeln!(
                out,
                "cash account {} balance {}",
                recorded.cash_account.id, recorded.cash_account.balance
            )?;
            Ok(())
        }
        Command::Cash {
            kind,
            amount,
            owner,
            currency,
            platform,
            label,
            executed_at,
            description,
            json,
        } => {
            let key = CashAccountKey {
                owner_id: owner,
                currency_id: currency,
                platform_id: platform,
                label,
            };
            let movement = NewCashMovement {
                kind,
                amount,
                executed_at: executed_at.unwrap_or_else(Utc::now),
                description,
            };
            let recorded = record_cash_movement(store, &key, &movement)?;
            if json {
                return write_json(out, &recorded);
            }
            writeln!(
                out,
                "recorded {} {} on cash account {}: balance {}",
                recorded.transaction.kind,
                recorded.transaction.amount,
                recorded.cash_account.id,
                recorded.cash_account.balance
            )?;
            Ok(())
        }
        Command::Positions {
            instrument_id,
            instrument,
            market_id,
            market,
            account,
            completed,
            ordering,
            json,
        } => {
            let filter = PositionFilter {
                instrument_id,
                instrument_code: instrument,
                market_id,
                market_code: market,
                investment_account_id: account,
                is_completed: completed,
            };
            let spec = ordering.as_deref().unwrap_or(default_ordering);
            let views = query_positions(store, &filter, spec)?;
            if json {
                return write_json(out, &views);
            }
            write_positions(out, &views)
        }
        Command::Position { id, json } => {
            let view = store
                .position(id)?
                .ok_or_else(|| JournalError::not_found("position", id))?;
            let transactions = store.position_transactions(id)?;
            if json {
                return write_json(
                    out,
                    &PositionDetail {
                        position: &view,
                        transactions: &transactions,
                    },
                );
            }
            write_positions(out, std::slice::from_ref(&view))?;
            writeln!(out)?;
            write_transactions(out, &transactions)
        }
        Command::Transactions {
            q,
            account,
            executed_by,
            active,
            kind,
            json,
        } => {
            let filter = TransactionFilter {
                q,
                investment_account_id: account,
                executed_by,
                is_active: active,
                kind,
            };
            let transactions = list_transactions(store, &filter)?;
            if json {
                return write_json(out, &transactions);
            }
            write_transactions(out, &transactions)
        }
        Command::Deactivate { id } => {
            if deactivate_transaction(store, id)? {
                writeln!(out, "transaction {id} deactivated")?;
            } else {
                writeln!(out, "transaction {id} was already inactive or does not exist")?;
            }
            Ok(())
        }
        Command::Import { file } => {
            let report = CsvTradeImporter::new(&file).import(store)?;
            writeln!(
                out,
                "imported {} transactions from {}",
                report.recorded.len(),
                file.display()
            )?;
            match report.failed {
                None => Ok(()),
                Some((row, e)) => {
                    eprintln!("error: import stopped at row {row}");
                    Err(e)
                }
            }
        }
        Command::CashAccounts { owner, json } => {
            let accounts = store.cash_accounts(owner)?;
            if json {
                return write_json(out, &accounts);
            }
            write_cash_accounts(out, &accounts)
        }
        Command::CashHistory { cash_account, json } => {
            let movements = store.cash_transactions(cash_account)?;
            if json {
                return write_json(out, &movements);
            }
            writeln!(
                out,
                "{:>6}  {:<8}  {:>14}  {:<20}  {:<6}  DESCRIPTION",
                "ID", "KIND", "AMOUNT", "EXECUTED_AT", "ACTIVE"
            )?;
            for m in &movements {
                writeln!(
                    out,
                    "{:>6}  {:<8}  {:>14}  {:<20}  {:<6}  {}",
                    m.id,
                    m.kind.as_str(),
                    m.amount.to_string(),
                    m.executed_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    m.is_active,
                    m.description.as_deref().unwrap_or("")
                )?;
            }
            Ok(())
        }
    }
}

fn register<S: ReferencePort>(
    store: &S,
    entity: RegisterCommand,
    out: &mut dyn Write,
) -> Result<(), JournalError> {
    match entity {
        RegisterCommand::Currency {
            code,
            title,
            symbol,
        } => {
            let c = store.register_currency(&NewCurrency {
                code,
                title,
                symbol,
            })?;
            writeln!(out, "registered currency {} ({})", c.id, c.code)?;
        }
        RegisterCommand::Market {
            code,
            title,
            currency,
        } => {
            let m = store.register_market(&NewMarket {
                code,
                title,
                currency_id: currency,
            })?;
            writeln!(out, "registered market {} ({})", m.id, m.code)?;
        }
        RegisterCommand::Platform { title, description } => {
            let p = store.register_platform(&NewPlatform { title, description })?;
            writeln!(out, "registered platform {} ({})", p.id, p.title)?;
        }
        RegisterCommand::Instrument {
            code,
            title,
            market,
        } => {
            let i = store.register_instrument(&NewInstrument {
                code,
                title,
                market_id: market,
            })?;
            writeln!(out, "registered instrument {} ({})", i.id, i.code)?;
        }
        RegisterCommand::Account { title, owner } => {
            let a = store.register_investment_account(&NewInvestmentAccount {
                title,
                owner_id: owner,
            })?;
            writeln!(out, "registered investment account {} ({})", a.id, a.title)?;
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct PositionDetail<'a> {
    #[serde(flatten)]
    position: &'a PositionView,
    transactions: &'a [PositionTransaction],
}

fn write_json<T: Serialize + ?Sized>(out: &mut dyn Write, value: &T) -> Result<(), JournalError> {
    serde_json::to_writer_pretty(&mut *out, value).map_err(io::Error::from)?;
    writeln!(out)?;
    Ok(())
}

fn or_dash<T: ToString>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map_or_else(|| "-".to_string(), ToString::to_string)
}

fn write_positions(out: &mut dyn Write, views: &[PositionView]) -> Result<(), JournalError> {
    writeln!(
        out,
        "{:>6}  {:<10}  {:<10}  {:>7}  {:>12}  {:>12}  {:>14}  {:>14}  {:>14}  {:>10}  STATUS",
        "ID", "CODE", "MARKET", "ACCOUNT", "QUANTITY", "AVG_COST", "BUY_AMOUNT", "SELL_AMOUNT",
        "PNL", "PNL_RATIO"
    )?;
    for v in views {
        let p = &v.position;
        writeln!(
            out,
            "{:>6}  {:<10}  {:<10}  {:>7}  {:>12}  {:>12}  {:>14}  {:>14}  {:>14}  {:>10}  {}",
            p.id,
            v.instrument_code,
            v.market_code,
            p.investment_account_id,
            p.quantity.to_string(),
            p.avg_cost.to_string(),
            p.total_buy_amount.to_string(),
            p.total_sell_amount.to_string(),
            or_dash(&v.pnl_amount),
            or_dash(&v.pnl_ratio.map(|r| r.round_dp(4))),
            if p.is_completed { "completed" } else { "open" }
        )?;
    }
    Ok(())
}

fn write_transactions(
    out: &mut dyn Write,
    transactions: &[PositionTransaction],
) -> Result<(), JournalError> {
    writeln!(
        out,
        "{:>6}  {:>8}  {:<4}  {:>12}  {:>12}  {:>10}  {:<20}  {:<6}  DESCRIPTION",
        "ID", "POSITION", "KIND", "QUANTITY", "PRICE", "COMMISSION", "EXECUTED_AT", "ACTIVE"
    )?;
    for t in transactions {
        writeln!(
            out,
            "{:>6}  {:>8}  {:<4}  {:>12}  {:>12}  {:>10}  {:<20}  {:<6}  {}",
            t.id,
            t.cumulative_position_id,
            t.kind.as_str(),
            t.quantity.to_string(),
            t.price.to_string(),
            t.commission.to_string(),
            t.executed_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            t.is_active,
            t.description
        )?;
    }
    Ok(())
}

fn write_cash_accounts(out: &mut dyn Write, accounts: &[CashAccount]) -> Result<(), JournalError> {
    writeln!(
        out,
        "{:>6}  {:>8}  {:>8}  {:<12}  {:>14}",
        "ID", "CURRENCY", "PLATFORM", "LABEL", "BALANCE"
    )?;
    for a in accounts {
        writeln!(
            out,
            "{:>6}  {:>8}  {:>8}  {:<12}  {:>14}",
            a.id,
            a.key.currency_id,
            a.key.platform_id,
            a.key.label.as_deref().unwrap_or("-"),
            a.balance.to_string()
        )?;
    }
    Ok(())
}
