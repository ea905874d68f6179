//! Reference data registration port.

use crate::domain::error::JournalError;
use crate::domain::reference::{
    Currency, Instrument, InvestmentAccount, Market, NewCurrency, NewInstrument,
    NewInvestmentAccount, NewMarket, NewPlatform, Platform,
};

pub trait ReferencePort {
    fn register_currency(&self, currency: &NewCurrency) -> Result<Currency, JournalError>;

    fn register_market(&self, market: &NewMarket) -> Result<Market, JournalError>;

    fn register_platform(&self, platform: &NewPlatform) -> Result<Platform, JournalError>;

    /// The code is stored uppercase.
    fn register_instrument(&self, instrument: &NewInstrument) -> Result<Instrument, JournalError>;

    fn register_investment_account(
        &self,
        account: &NewInvestmentAccount,
    ) -> Result<InvestmentAccount, JournalError>;

    fn set_instrument_active(&self, id: i64, active: bool) -> Result<(), JournalError>;

    fn set_investment_account_active(&self, id: i64, active: bool) -> Result<(), JournalError>;

    fn instruments(&self) -> Result<Vec<Instrument>, JournalError>;
}
