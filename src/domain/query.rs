//! Read-side position queries: filters, ordering specs and the view type.
//!
//! Ordering strings look like `"-pnl_amount,id"`: comma separated field
//! names, a leading `-` for descending. Unknown names are dropped. Sorting is
//! stable, so rows that compare equal on every key keep retrieval order
//! (stores return rows by ascending id).

use log::debug;
use rust_decimal::Decimal;
use serde::Serialize;
use std::cmp::Ordering as CmpOrdering;
use std::fmt;

use super::error::JournalError;
use super::money::{Money, Price, Quantity};
use super::position::{CumulativePosition, TransactionKind};

/// Conjunctive position filter. `None` fields do not constrain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PositionFilter {
    pub instrument_id: Option<i64>,
    /// Case-insensitive exact match against the stored uppercase code.
    pub instrument_code: Option<String>,
    pub market_id: Option<i64>,
    pub market_code: Option<String>,
    pub investment_account_id: Option<i64>,
    pub is_completed: Option<bool>,
}

impl PositionFilter {
    pub fn normalized_instrument_code(&self) -> Option<String> {
        self.instrument_code.as_ref().map(|c| c.trim().to_uppercase())
    }

    pub fn normalized_market_code(&self) -> Option<String> {
        self.market_code.as_ref().map(|c| c.trim().to_uppercase())
    }

    pub fn matches(&self, view: &PositionView) -> bool {
        let p = &view.position;
        self.instrument_id.is_none_or(|id| p.instrument_id == id)
            && self
                .normalized_instrument_code()
                .is_none_or(|code| view.instrument_code == code)
            && self.market_id.is_none_or(|id| view.market_id == id)
            && self
                .normalized_market_code()
                .is_none_or(|code| view.market_code == code)
            && self
                .investment_account_id
                .is_none_or(|id| p.investment_account_id == id)
            && self.is_completed.is_none_or(|c| p.is_completed == c)
    }
}

/// Journal listing filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionFilter {
    /// Case-insensitive substring of the instrument code.
    pub q: Option<String>,
    pub investment_account_id: Option<i64>,
    pub executed_by: Option<i64>,
    pub is_active: Option<bool>,
    pub kind: Option<TransactionKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingField {
    Id,
    InstrumentCode,
    TotalBuyAmount,
    TotalSellAmount,
    PnlAmount,
    PnlRatio,
}

impl OrderingField {
    pub fn parse(name: &str) -> Option<OrderingField> {
        match name {
            "id" => Some(OrderingField::Id),
            "instrument_code" | "ticker_code" => Some(OrderingField::InstrumentCode),
            "total_buy_amount" => Some(OrderingField::TotalBuyAmount),
            "total_sell_amount" => Some(OrderingField::TotalSellAmount),
            "pnl_amount" => Some(OrderingField::PnlAmount),
            "pnl_ratio" => Some(OrderingField::PnlRatio),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderingField::Id => "id",
            OrderingField::InstrumentCode => "instrument_code",
            OrderingField::TotalBuyAmount => "total_buy_amount",
            OrderingField::TotalSellAmount => "total_sell_amount",
            OrderingField::PnlAmount => "pnl_amount",
            OrderingField::PnlRatio => "pnl_ratio",
        }
    }

    fn compare(self, a: &PositionView, b: &PositionView) -> CmpOrdering {
        match self {
            OrderingField::Id => a.position.id.cmp(&b.position.id),
            OrderingField::InstrumentCode => a.instrument_code.cmp(&b.instrument_code),
            OrderingField::TotalBuyAmount => a
                .position
                .total_buy_amount
                .cmp(&b.position.total_buy_amount),
            OrderingField::TotalSellAmount => a
                .position
                .total_sell_amount
                .cmp(&b.position.total_sell_amount),
            // Undefined values sort before defined ones.
            OrderingField::PnlAmount => a.pnl_amount.cmp(&b.pnl_amount),
            OrderingField::PnlRatio => a.pnl_ratio.cmp(&b.pnl_ratio),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderingKey {
    pub field: OrderingField,
    pub direction: SortDirection,
}

/// Parsed multi-key ordering, applied left to right.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PositionOrdering {
    pub keys: Vec<OrderingKey>,
}

impl PositionOrdering {
    /// Parse `"-pnl_amount,id"`-style specs. Unknown fields are dropped and a
    /// repeated field keeps its first occurrence.
    pub fn parse(spec: &str) -> Self {
        let mut keys: Vec<OrderingKey> = Vec::new();
        for raw in spec.split(',') {
            let token = raw.trim();
            if token.is_empty() {
                continue;
            }
            let direction = if token.starts_with('-') {
                SortDirection::Descending
            } else {
                SortDirection::Ascending
            };
            let name = token.trim_matches(|c: char| c == '-' || c == '+' || c.is_whitespace());
            match OrderingField::parse(name) {
                Some(field) if keys.iter().all(|k| k.field != field) => {
                    keys.push(OrderingKey { field, direction });
                }
                Some(_) => debug!("ignoring repeated ordering field {name:?}"),
                None => debug!("ignoring unknown ordering field {name:?}"),
            }
        }
        PositionOrdering { keys }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Stable multi-key sort in place.
    pub fn sort(&self, views: &mut [PositionView]) {
        if self.keys.is_empty() {
            return;
        }
        views.sort_by(|a, b| self.compare(a, b));
    }

    fn compare(&self, a: &PositionView, b: &PositionView) -> CmpOrdering {
        for key in &self.keys {
            let ord = key.field.compare(a, b);
            let ord = match key.direction {
                SortDirection::Ascending => ord,
                SortDirection::Descending => ord.reverse(),
            };
            if ord != CmpOrdering::Equal {
                return ord;
            }
        }
        CmpOrdering::Equal
    }
}

impl fmt::Display for PositionOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .keys
            .iter()
            .map(|k| match k.direction {
                SortDirection::Ascending => k.field.as_str().to_string(),
                SortDirection::Descending => format!("-{}", k.field.as_str()),
            })
            .collect();
        f.write_str(&parts.join(","))
    }
}

/// A position joined with its instrument and market codes, plus the derived
/// figures computed at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PositionView {
    #[serde(flatten)]
    pub position: CumulativePosition,
    pub instrument_code: String,
    pub market_id: i64,
    pub market_code: String,
    pub adjusted_avg_cost: Option<Price>,
    pub pnl_amount: Option<Money>,
    pub pnl_ratio: Option<Decimal>,
}

impl PositionView {
    pub fn new(
        position: CumulativePosition,
        instrument_code: String,
        market_id: i64,
        market_code: String,
    ) -> Result<Self, JournalError> {
        Ok(PositionView {
            adjusted_avg_cost: position.adjusted_avg_cost()?,
            pnl_amount: position.pnl_amount()?,
            pnl_ratio: position.pnl_ratio()?,
            position,
            instrument_code,
            market_id,
            market_code,
        })
    }

    pub fn id(&self) -> i64 {
        self.position.id
    }

    pub fn quantity(&self) -> Quantity {
        self.position.quantity
    }
}
