//! Reference data the ledger hangs off: currencies, markets, platforms,
//! instruments and investment accounts.
//!
//! These are plain records. Registration lives behind
//! [`crate::ports::reference_port::ReferencePort`]; the ledger only reads them.

use serde::Serialize;

use super::error::JournalError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Currency {
    pub id: i64,
    pub code: String,
    pub title: String,
    pub symbol: Option<String>,
}

/// A market fixes the settlement currency of every instrument listed on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Market {
    pub id: i64,
    pub code: String,
    pub title: String,
    pub currency_id: i64,
}

/// Broker, bank or exchange where trades settle and cash is held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Platform {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instrument {
    pub id: i64,
    /// Always stored uppercase.
    pub code: String,
    pub title: String,
    pub market_id: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvestmentAccount {
    pub id: i64,
    pub title: String,
    pub owner_id: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCurrency {
    pub code: String,
    pub title: String,
    pub symbol: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMarket {
    pub code: String,
    pub title: String,
    pub currency_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPlatform {
    pub title: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInstrument {
    pub code: String,
    pub title: String,
    pub market_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInvestmentAccount {
    pub title: String,
    pub owner_id: i64,
}

/// Uppercases and trims a currency, market or instrument code, rejecting blanks.
pub fn normalize_code(field: &str, code: &str) -> Result<String, JournalError> {
    let code = code.trim().to_uppercase();
    if code.is_empty() {
        return Err(JournalError::invalid_input(field, "code must not be empty"));
    }
    Ok(code)
}

impl NewCurrency {
    pub fn normalized(&self) -> Result<NewCurrency, JournalError> {
        Ok(NewCurrency {
            code: normalize_code("currency code", &self.code)?,
            title: self.title.trim().to_string(),
            symbol: self.symbol.clone(),
        })
    }
}

impl NewMarket {
    pub fn normalized(&self) -> Result<NewMarket, JournalError> {
        Ok(NewMarket {
            code: normalize_code("market code", &self.code)?,
            title: self.title.trim().to_string(),
            currency_id: self.currency_id,
        })
    }
}

impl NewInstrument {
    pub fn normalized(&self) -> Result<NewInstrument, JournalError> {
        Ok(NewInstrument {
            code: normalize_code("instrument code", &self.code)?,
            title: self.title.trim().to_string(),
            market_id: self.market_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_uppercased_and_trimmed() {
        assert_eq!(normalize_code("code", " aapl ").unwrap(), "AAPL");
    }

    #[test]
    fn blank_code_rejected() {
        match normalize_code("instrument code", "   ") {
            Err(JournalError::InvalidInput { field, .. }) => assert_eq!(field, "instrument code"),
            other => panic!("expected InvalidInput, got {other:?}"),
        }
    }

    #[test]
    fn new_instrument_normalized() {
        let input = NewInstrument {
            code: "nvda".into(),
            title: " NVIDIA Corporation ".into(),
            market_id: 2,
        };
        let normalized = input.normalized().unwrap();
        assert_eq!(normalized.code, "NVDA");
        assert_eq!(normalized.title, "NVIDIA Corporation");
        assert_eq!(normalized.market_id, 2);
    }

    #[test]
    fn new_market_normalized() {
        let market = NewMarket {
            code: "nasdaqgs".into(),
            title: "The NASDAQ Global Select Market".into(),
            currency_id: 1,
        }
        .normalized()
        .unwrap();
        assert_eq!(market.code, "NASDAQGS");
    }
}
