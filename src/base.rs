use std::{collections::BTreeMap, path::Path, str::FromStr};

use anyhow::Result;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};
use tracing::{info, warn};

/// An exact quantity of a currency, as reported by an exchange.
///
/// The code is the exchange ticker and is not case-normalized.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct CurrencyAmount {
    pub code: String,
    pub amount: Decimal,
}

impl CurrencyAmount {
    pub(crate) fn new(code: impl Into<String>, amount: Decimal) -> Self {
        Self {
            code: code.into(),
            amount,
        }
    }

    pub(crate) fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }
}

/// The part a currency amount plays within a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub(crate) enum Role {
    /// Value leaving the account
    From,
    /// Value entering the account
    To,
    /// Cost incurred
    Fee,
}

/// Closed set of fiscal categories handed to the tax engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, EnumIter)]
pub(crate) enum Category {
    Deposits,
    Withdrawals,
    Exchanges,
    CashIn,
    CashOut,
    CommercialRebates,
    Interests,
    Referrals,
}

/// Unified ledger transaction for all exchanges.
///
/// Every transaction has at least one `From` or `To` entry. A `Fee` entry
/// is only recorded next to a non-fee entry and never when it is zero.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct Transaction {
    pub timestamp: NaiveDateTime,
    pub note: String,
    /// Source kind of a swap leg, the only entries a later leg may merge into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub items: BTreeMap<Role, Vec<CurrencyAmount>>,
}

impl Transaction {
    pub(crate) fn new(timestamp: NaiveDateTime, note: impl Into<String>) -> Self {
        Self {
            timestamp,
            note: note.into(),
            kind: None,
            items: BTreeMap::new(),
        }
    }

    pub(crate) fn deposit(timestamp: NaiveDateTime, note: impl Into<String>, amount: CurrencyAmount) -> Self {
        Self::new(timestamp, note).with(Role::To, amount)
    }

    pub(crate) fn withdrawal(timestamp: NaiveDateTime, note: impl Into<String>, amount: CurrencyAmount) -> Self {
        Self::new(timestamp, note).with(Role::From, amount)
    }

    pub(crate) fn trade(timestamp: NaiveDateTime, note: impl Into<String>, outgoing: CurrencyAmount, incoming: CurrencyAmount) -> Self {
        Self::new(timestamp, note)
            .with(Role::From, outgoing)
            .with(Role::To, incoming)
    }

    pub(crate) fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub(crate) fn with(mut self, role: Role, amount: CurrencyAmount) -> Self {
        self.push(role, amount);
        self
    }

    /// Adds a fee, unless it is zero.
    pub(crate) fn with_fee(mut self, fee: CurrencyAmount) -> Self {
        if !fee.is_zero() {
            self.push(Role::Fee, fee);
        }
        self
    }

    pub(crate) fn push(&mut self, role: Role, amount: CurrencyAmount) {
        self.items.entry(role).or_default().push(amount);
    }

    pub(crate) fn amounts(&self, role: Role) -> &[CurrencyAmount] {
        self.items.get(&role).map(Vec::as_slice).unwrap_or_default()
    }

    /// Appends all entries of another leg of the same economic event.
    pub(crate) fn absorb(&mut self, other: Transaction) {
        for (role, amounts) in other.items {
            self.items.entry(role).or_default().extend(amounts);
        }
    }

    pub(crate) fn is_well_formed(&self) -> bool {
        !self.amounts(Role::From).is_empty() || !self.amounts(Role::To).is_empty()
    }
}

/// Category name to transactions, each sequence in processing order.
pub(crate) type CategoryLedger = BTreeMap<Category, Vec<Transaction>>;

/// The categorized output of one source, consumed by the tax engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct ExchangeLedger {
    pub source: String,
    pub first_used: NaiveDateTime,
    pub categories: CategoryLedger,
}

impl ExchangeLedger {
    pub(crate) fn transactions(&self, category: Category) -> &[Transaction] {
        self.categories.get(&category).map(Vec::as_slice).unwrap_or_default()
    }

    pub(crate) fn len(&self) -> usize {
        self.categories.values().map(Vec::len).sum()
    }

    /// Stable sort of every category by timestamp, for callers that want
    /// chronological rather than processing order.
    pub(crate) fn sort_by_timestamp(&mut self) {
        for transactions in self.categories.values_mut() {
            transactions.sort_by_key(|tx| tx.timestamp);
        }
    }
}

pub(crate) fn parse_decimal(raw: &str) -> Option<Decimal> {
    let raw = raw.trim();
    // Strip commas when necessary, since Decimal doesn't like those
    let raw = if raw.contains(',') { raw.replace(',', "") } else { raw.to_owned() };
    Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .ok()
}

/// Parses a decimal field, logging the raw value and falling back to zero
/// so that one bad field doesn't lose the rest of the record.
pub(crate) fn parse_decimal_or_zero(raw: &str, field: &str) -> Decimal {
    parse_decimal(raw).unwrap_or_else(|| {
        warn!(field, raw, "error parsing amount, using zero");
        Decimal::ZERO
    })
}

pub(crate) fn decimal_from_number(number: Option<&serde_json::Number>, field: &str) -> Decimal {
    match number {
        Some(number) => parse_decimal_or_zero(&number.to_string(), field),
        None => {
            warn!(field, "missing amount, using zero");
            Decimal::ZERO
        }
    }
}

/// Result of arithmetic on parsed amounts, zero when it overflowed.
pub(crate) fn decimal_or_zero(value: Option<Decimal>, field: &str) -> Decimal {
    value.unwrap_or_else(|| {
        warn!(field, "amount out of range, using zero");
        Decimal::ZERO
    })
}

pub(crate) fn save_ledgers_to_json(ledgers: &[ExchangeLedger], output_path: impl AsRef<Path>) -> Result<()> {
    info!("Saving {}", output_path.as_ref().display());

    let json = serde_json::to_string_pretty(ledgers)?;
    std::fs::write(output_path, json)?;

    Ok(())
}
