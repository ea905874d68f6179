#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use monfaristo::domain::cash::{CashAccount, CashAccountKey, CashTransaction, NewCashMovement};
use monfaristo::domain::error::JournalError;
use monfaristo::domain::money::{Money, Price, Quantity};
use monfaristo::domain::position::{
    CumulativePosition, NewPositionTransaction, PositionTransaction, TransactionKind,
};
use monfaristo::domain::query::{PositionFilter, PositionView, TransactionFilter};
use monfaristo::domain::reference::{
    Currency, Instrument, InvestmentAccount, Market, NewCurrency, NewInstrument,
    NewInvestmentAccount, NewMarket, NewPlatform, Platform,
};
use monfaristo::ports::ledger_port::{LedgerSession, LedgerStore};
use monfaristo::ports::reference_port::ReferencePort;
use rust_decimal::Decimal;
use std::sync::Mutex;

/// Session operations a [`MemoryLedger`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    InsertPositionTransaction,
    UpdatePosition,
    UpdateCashAccount,
    InsertCashTransaction,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    next_id: i64,
    currencies: Vec<Currency>,
    markets: Vec<Market>,
    platforms: Vec<Platform>,
    instruments: Vec<Instrument>,
    accounts: Vec<InvestmentAccount>,
    positions: Vec<CumulativePosition>,
    cash_accounts: Vec<CashAccount>,
    transactions: Vec<PositionTransaction>,
    cash_transactions: Vec<CashTransaction>,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn view(&self, position: &CumulativePosition) -> Result<PositionView, JournalError> {
        let instrument = self
            .instruments
            .iter()
            .find(|i| i.id == position.instrument_id);
        let market = instrument.and_then(|i| self.markets.iter().find(|m| m.id == i.market_id));
        PositionView::new(
            position.clone(),
            instrument.map(|i| i.code.clone()).unwrap_or_default(),
            market.map(|m| m.id).unwrap_or_default(),
            market.map(|m| m.code.clone()).unwrap_or_default(),
        )
    }
}

fn same_key(a: &CashAccountKey, b: &CashAccountKey) -> bool {
    let label = |k: &CashAccountKey| k.label.clone().filter(|l| !l.is_empty());
    a.owner_id == b.owner_id
        && a.currency_id == b.currency_id
        && a.platform_id == b.platform_id
        && label(a) == label(b)
}

/// In-memory ledger. `atomically` works on a clone of the state and swaps it
/// in only when the unit succeeds, so an injected fault proves rollback.
pub struct MemoryLedger {
    state: Mutex<MemoryState>,
    fault: Mutex<Option<Fault>>,
    /// Simulated concurrent creators: each pending entry makes the next
    /// insert of that kind lose the race.
    racing_cash_inserts: Mutex<usize>,
    racing_position_inserts: Mutex<usize>,
    /// Cash inserts that report a conflict without the winning row ever
    /// becoming visible, which exhausts the find-or-create retries.
    phantom_cash_conflicts: Mutex<usize>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            fault: Mutex::new(None),
            racing_cash_inserts: Mutex::new(0),
            racing_position_inserts: Mutex::new(0),
            phantom_cash_conflicts: Mutex::new(0),
        }
    }

    pub fn with_fault(self, fault: Fault) -> Self {
        *self.fault.lock().unwrap() = Some(fault);
        self
    }

    pub fn clear_fault(&self) {
        *self.fault.lock().unwrap() = None;
    }

    pub fn with_racing_cash_inserts(self, n: usize) -> Self {
        *self.racing_cash_inserts.lock().unwrap() = n;
        self
    }

    pub fn with_racing_position_inserts(self, n: usize) -> Self {
        *self.racing_position_inserts.lock().unwrap() = n;
        self
    }

    pub fn with_phantom_cash_conflicts(self, n: usize) -> Self {
        *self.phantom_cash_conflicts.lock().unwrap() = n;
        self
    }

    pub fn transaction_count(&self) -> usize {
        self.state.lock().unwrap().transactions.len()
    }

    pub fn cash_transaction_count(&self) -> usize {
        self.state.lock().unwrap().cash_transactions.len()
    }

    pub fn all_positions(&self) -> Vec<CumulativePosition> {
        self.state.lock().unwrap().positions.clone()
    }

    pub fn all_cash_accounts(&self) -> Vec<CashAccount> {
        self.state.lock().unwrap().cash_accounts.clone()
    }
}

struct MemorySession<'a> {
    state: &'a mut MemoryState,
    fault: Option<Fault>,
    racing_cash_inserts: &'a mut usize,
    racing_position_inserts: &'a mut usize,
    phantom_cash_conflicts: &'a mut usize,
}

impl MemorySession<'_> {
    fn check(&self, op: Fault) -> Result<(), JournalError> {
        if self.fault == Some(op) {
            return Err(JournalError::DatabaseQuery {
                reason: format!("injected failure on {op:?}"),
            });
        }
        Ok(())
    }
}

impl LedgerSession for MemorySession<'_> {
    fn instrument(&mut self, id: i64) -> Result<Option<Instrument>, JournalError> {
        Ok(self.state.instruments.iter().find(|i| i.id == id).cloned())
    }

    fn market(&mut self, id: i64) -> Result<Option<Market>, JournalError> {
        Ok(self.state.markets.iter().find(|m| m.id == id).cloned())
    }

    fn platform(&mut self, id: i64) -> Result<Option<Platform>, JournalError> {
        Ok(self.state.platforms.iter().find(|p| p.id == id).cloned())
    }

    fn investment_account(&mut self, id: i64) -> Result<Option<InvestmentAccount>, JournalError> {
        Ok(self.state.accounts.iter().find(|a| a.id == id).cloned())
    }

    fn currency_exists(&mut self, id: i64) -> Result<bool, JournalError> {
        Ok(self.state.currencies.iter().any(|c| c.id == id))
    }

    fn lock_open_position(
        &mut self,
        instrument_id: i64,
        investment_account_id: i64,
    ) -> Result<Option<CumulativePosition>, JournalError> {
        Ok(self
            .state
            .positions
            .iter()
            .find(|p| {
                p.instrument_id == instrument_id
                    && p.investment_account_id == investment_account_id
                    && !p.is_completed
            })
            .cloned())
    }

    fn insert_position(
        &mut self,
        instrument_id: i64,
        investment_account_id: i64,
        opened_at: DateTime<Utc>,
    ) -> Result<CumulativePosition, JournalError> {
        if *self.racing_position_inserts > 0 {
            *self.racing_position_inserts -= 1;
            let id = self.state.next_id();
            self.state.positions.push(CumulativePosition::open(
                id,
                instrument_id,
                investment_account_id,
                opened_at,
            ));
        }
        let taken = self.state.positions.iter().any(|p| {
            p.instrument_id == instrument_id
                && p.investment_account_id == investment_account_id
                && !p.is_completed
        });
        if taken {
            return Err(JournalError::ConstraintViolation {
                entity: "cumulative_position".to_string(),
                reason: "open position already exists".to_string(),
            });
        }
        let id = self.state.next_id();
        let position = CumulativePosition::open(id, instrument_id, investment_account_id, opened_at);
        self.state.positions.push(position.clone());
        Ok(position)
    }

    fn update_position(&mut self, position: &CumulativePosition) -> Result<(), JournalError> {
        self.check(Fault::UpdatePosition)?;
        match self.state.positions.iter_mut().find(|p| p.id == position.id) {
            Some(p) => {
                *p = position.clone();
                Ok(())
            }
            None => Err(JournalError::not_found("position", position.id)),
        }
    }

    fn lock_cash_account(
        &mut self,
        key: &CashAccountKey,
    ) -> Result<Option<CashAccount>, JournalError> {
        Ok(self
            .state
            .cash_accounts
            .iter()
            .find(|a| same_key(&a.key, key))
            .cloned())
    }

    fn insert_cash_account(&mut self, key: &CashAccountKey) -> Result<CashAccount, JournalError> {
        if *self.phantom_cash_conflicts > 0 {
            *self.phantom_cash_conflicts -= 1;
            return Err(JournalError::ConstraintViolation {
                entity: "cash_account".to_string(),
                reason: "key already taken".to_string(),
            });
        }
        if *self.racing_cash_inserts > 0 {
            *self.racing_cash_inserts -= 1;
            let id = self.state.next_id();
            self.state.cash_accounts.push(CashAccount::new(id, key.clone()));
        }
        if self.state.cash_accounts.iter().any(|a| same_key(&a.key, key)) {
            return Err(JournalError::ConstraintViolation {
                entity: "cash_account".to_string(),
                reason: "key already taken".to_string(),
            });
        }
        let id = self.state.next_id();
        let account = CashAccount::new(id, key.clone());
        self.state.cash_accounts.push(account.clone());
        Ok(account)
    }

    fn update_cash_account(&mut self, account: &CashAccount) -> Result<(), JournalError> {
        self.check(Fault::UpdateCashAccount)?;
        match self.state.cash_accounts.iter_mut().find(|a| a.id == account.id) {
            Some(a) => {
                *a = account.clone();
                Ok(())
            }
            None => Err(JournalError::not_found("cash account", account.id)),
        }
    }

    fn insert_position_transaction(
        &mut self,
        cumulative_position_id: i64,
        txn: &NewPositionTransaction,
        created_at: DateTime<Utc>,
    ) -> Result<PositionTransaction, JournalError> {
        self.check(Fault::InsertPositionTransaction)?;
        let id = self.state.next_id();
        let row = PositionTransaction {
            id,
            cumulative_position_id,
            instrument_id: txn.instrument_id,
            investment_account_id: txn.investment_account_id,
            platform_id: txn.platform_id,
            kind: txn.kind,
            price: txn.price,
            quantity: txn.quantity,
            commission: txn.commission,
            executed_at: txn.executed_at,
            executed_by: txn.executed_by,
            description: txn.description.clone(),
            notes: txn.notes.clone(),
            time_frame: txn.time_frame.clone(),
            pattern: txn.pattern.clone(),
            is_active: true,
            created_at,
        };
        self.state.transactions.push(row.clone());
        Ok(row)
    }

    fn insert_cash_transaction(
        &mut self,
        account: &CashAccount,
        movement: &NewCashMovement,
    ) -> Result<CashTransaction, JournalError> {
        self.check(Fault::InsertCashTransaction)?;
        let id = self.state.next_id();
        let row = CashTransaction {
            id,
            cash_account_id: account.id,
            owner_id: account.key.owner_id,
            currency_id: account.key.currency_id,
            platform_id: account.key.platform_id,
            kind: movement.kind,
            amount: movement.amount,
            executed_at: movement.executed_at,
            description: movement.description.clone(),
            is_active: true,
        };
        self.state.cash_transactions.push(row.clone());
        Ok(row)
    }
}

impl LedgerStore for MemoryLedger {
    fn initialize_schema(&self) -> Result<(), JournalError> {
        Ok(())
    }

    fn atomically<T, F>(&self, work: F) -> Result<T, JournalError>
    where
        F: FnOnce(&mut dyn LedgerSession) -> Result<T, JournalError>,
    {
        let mut state = self.state.lock().unwrap();
        let mut working = state.clone();
        let fault = *self.fault.lock().unwrap();
        let mut racing_cash = self.racing_cash_inserts.lock().unwrap();
        let mut racing_position = self.racing_position_inserts.lock().unwrap();
        let mut phantom_cash = self.phantom_cash_conflicts.lock().unwrap();

        let result = {
            let mut session = MemorySession {
                state: &mut working,
                fault,
                racing_cash_inserts: &mut racing_cash,
                racing_position_inserts: &mut racing_position,
                phantom_cash_conflicts: &mut phantom_cash,
            };
            work(&mut session)
        };
        if result.is_ok() {
            *state = working;
        }
        result
    }

    fn positions(&self, filter: &PositionFilter) -> Result<Vec<PositionView>, JournalError> {
        let state = self.state.lock().unwrap();
        let mut views = state
            .positions
            .iter()
            .map(|p| state.view(p))
            .collect::<Result<Vec<_>, _>>()?;
        views.retain(|v| filter.matches(v));
        views.sort_by_key(|v| v.id());
        Ok(views)
    }

    fn position(&self, id: i64) -> Result<Option<PositionView>, JournalError> {
        let state = self.state.lock().unwrap();
        state
            .positions
            .iter()
            .find(|p| p.id == id)
            .map(|p| state.view(p))
            .transpose()
    }

    fn transactions(
        &self,
        filter: &TransactionFilter,
    ) -> Result<Vec<PositionTransaction>, JournalError> {
        let state = self.state.lock().unwrap();
        let q = filter.q.as_ref().map(|q| q.to_uppercase());
        let mut rows: Vec<PositionTransaction> = state
            .transactions
            .iter()
            .filter(|t| {
                let code = state
                    .instruments
                    .iter()
                    .find(|i| i.id == t.instrument_id)
                    .map(|i| i.code.as_str())
                    .unwrap_or("");
                q.as_ref().is_none_or(|q| code.contains(q.as_str()))
                    && filter
                        .investment_account_id
                        .is_none_or(|id| t.investment_account_id == id)
                    && filter.executed_by.is_none_or(|id| t.executed_by == id)
                    && filter.is_active.is_none_or(|a| t.is_active == a)
                    && filter.kind.is_none_or(|k| t.kind == k)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.executed_at.cmp(&b.executed_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    fn position_transactions(
        &self,
        cumulative_position_id: i64,
    ) -> Result<Vec<PositionTransaction>, JournalError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .transactions
            .iter()
            .filter(|t| t.cumulative_position_id == cumulative_position_id)
            .cloned()
            .collect())
    }

    fn cash_accounts(&self, owner_id: i64) -> Result<Vec<CashAccount>, JournalError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .cash_accounts
            .iter()
            .filter(|a| a.key.owner_id == owner_id)
            .cloned()
            .collect())
    }

    fn cash_transactions(
        &self,
        cash_account_id: i64,
    ) -> Result<Vec<CashTransaction>, JournalError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .cash_transactions
            .iter()
            .filter(|t| t.cash_account_id == cash_account_id)
            .cloned()
            .collect())
    }

    fn deactivate_transaction(&self, id: i64) -> Result<bool, JournalError> {
        let mut state = self.state.lock().unwrap();
        match state
            .transactions
            .iter_mut()
            .find(|t| t.id == id && t.is_active)
        {
            Some(t) => {
                t.is_active = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl ReferencePort for MemoryLedger {
    fn register_currency(&self, currency: &NewCurrency) -> Result<Currency, JournalError> {
        let currency = currency.normalized()?;
        let mut state = self.state.lock().unwrap();
        if state.currencies.iter().any(|c| c.code == currency.code) {
            return Err(JournalError::ConstraintViolation {
                entity: "currency".to_string(),
                reason: format!("code {} already registered", currency.code),
            });
        }
        let row = Currency {
            id: state.next_id(),
            code: currency.code,
            title: currency.title,
            symbol: currency.symbol,
        };
        state.currencies.push(row.clone());
        Ok(row)
    }

    fn register_market(&self, market: &NewMarket) -> Result<Market, JournalError> {
        let market = market.normalized()?;
        let mut state = self.state.lock().unwrap();
        if !state.currencies.iter().any(|c| c.id == market.currency_id) {
            return Err(JournalError::not_found("currency", market.currency_id));
        }
        let row = Market {
            id: state.next_id(),
            code: market.code,
            title: market.title,
            currency_id: market.currency_id,
        };
        state.markets.push(row.clone());
        Ok(row)
    }

    fn register_platform(&self, platform: &NewPlatform) -> Result<Platform, JournalError> {
        let mut state = self.state.lock().unwrap();
        let row = Platform {
            id: state.next_id(),
            title: platform.title.clone(),
            description: platform.description.clone(),
        };
        state.platforms.push(row.clone());
        Ok(row)
    }

    fn register_instrument(&self, instrument: &NewInstrument) -> Result<Instrument, JournalError> {
        let instrument = instrument.normalized()?;
        let mut state = self.state.lock().unwrap();
        if !state.markets.iter().any(|m| m.id == instrument.market_id) {
            return Err(JournalError::not_found("market", instrument.market_id));
        }
        if state.instruments.iter().any(|i| i.code == instrument.code) {
            return Err(JournalError::ConstraintViolation {
                entity: "instrument".to_string(),
                reason: format!("code {} already registered", instrument.code),
            });
        }
        let row = Instrument {
            id: state.next_id(),
            code: instrument.code,
            title: instrument.title,
            market_id: instrument.market_id,
            is_active: true,
        };
        state.instruments.push(row.clone());
        Ok(row)
    }

    fn register_investment_account(
        &self,
        account: &NewInvestmentAccount,
    ) -> Result<InvestmentAccount, JournalError> {
        let mut state = self.state.lock().unwrap();
        let row = InvestmentAccount {
            id: state.next_id(),
            title: account.title.clone(),
            owner_id: account.owner_id,
            is_active: true,
        };
        state.accounts.push(row.clone());
        Ok(row)
    }

    fn set_instrument_active(&self, id: i64, active: bool) -> Result<(), JournalError> {
        let mut state = self.state.lock().unwrap();
        match state.instruments.iter_mut().find(|i| i.id == id) {
            Some(i) => {
                i.is_active = active;
                Ok(())
            }
            None => Err(JournalError::not_found("instrument", id)),
        }
    }

    fn set_investment_account_active(&self, id: i64, active: bool) -> Result<(), JournalError> {
        let mut state = self.state.lock().unwrap();
        match state.accounts.iter_mut().find(|a| a.id == id) {
            Some(a) => {
                a.is_active = active;
                Ok(())
            }
            None => Err(JournalError::not_found("investment account", id)),
        }
    }

    fn instruments(&self) -> Result<Vec<Instrument>, JournalError> {
        Ok(self.state.lock().unwrap().instruments.clone())
    }
}

/// Reference data registered by [`seed`].
#[derive(Debug, Clone)]
pub struct Fixture {
    pub owner_id: i64,
    pub currency: Currency,
    pub market: Market,
    pub platform: Platform,
    pub account: InvestmentAccount,
    pub aapl: Instrument,
    pub nvda: Instrument,
}

/// USD, one NASDAQGS market, one broker, one account for owner 1, AAPL and NVDA.
pub fn seed<S: ReferencePort>(store: &S) -> Fixture {
    let currency = store
        .register_currency(&NewCurrency {
            code: "usd".to_string(),
            title: "US Dollar".to_string(),
            symbol: Some("$".to_string()),
        })
        .unwrap();
    let market = store
        .register_market(&NewMarket {
            code: "NASDAQGS".to_string(),
            title: "Nasdaq Global Select".to_string(),
            currency_id: currency.id,
        })
        .unwrap();
    let platform = store
        .register_platform(&NewPlatform {
            title: "Broker".to_string(),
            description: None,
        })
        .unwrap();
    let account = store
        .register_investment_account(&NewInvestmentAccount {
            title: "Main".to_string(),
            owner_id: 1,
        })
        .unwrap();
    let aapl = store
        .register_instrument(&NewInstrument {
            code: "aapl".to_string(),
            title: "Apple".to_string(),
            market_id: market.id,
        })
        .unwrap();
    let nvda = store
        .register_instrument(&NewInstrument {
            code: "NVDA".to_string(),
            title: "Nvidia".to_string(),
            market_id: market.id,
        })
        .unwrap();
    Fixture {
        owner_id: 1,
        currency,
        market,
        platform,
        account,
        aapl,
        nvda,
    }
}

pub fn ts(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, 10, 0, 0).unwrap()
}

pub fn d(s: &str) -> Decimal {
    s.parse().unwrap()
}

pub fn trade(
    fixture: &Fixture,
    instrument: &Instrument,
    kind: TransactionKind,
    price: &str,
    quantity: &str,
    commission: &str,
    day: u32,
) -> NewPositionTransaction {
    NewPositionTransaction {
        instrument_id: instrument.id,
        investment_account_id: fixture.account.id,
        platform_id: fixture.platform.id,
        kind,
        price: Price::new(d(price)),
        quantity: Quantity::new(d(quantity)),
        commission: Money::new(d(commission)),
        executed_at: ts(day),
        executed_by: fixture.owner_id,
        description: String::new(),
        notes: String::new(),
        time_frame: None,
        pattern: None,
    }
}

pub fn buy(fixture: &Fixture, instrument: &Instrument, price: &str, quantity: &str, commission: &str) -> NewPositionTransaction {
    trade(fixture, instrument, TransactionKind::Buy, price, quantity, commission, 2)
}

pub fn sell(fixture: &Fixture, instrument: &Instrument, price: &str, quantity: &str, commission: &str) -> NewPositionTransaction {
    trade(fixture, instrument, TransactionKind::Sell, price, quantity, commission, 3)
}

pub fn settlement_key(fixture: &Fixture) -> CashAccountKey {
    CashAccountKey::platform_default(fixture.owner_id, fixture.currency.id, fixture.platform.id)
}
