use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::NaiveDateTime;
use tracing::debug;

use crate::{
    base::{Category, CategoryLedger, ExchangeLedger, Transaction},
    classify::MergePolicy,
};

#[derive(Debug)]
struct LedgerState {
    categories: CategoryLedger,
    first_used: NaiveDateTime,
}

impl LedgerState {
    fn observe(&mut self, timestamp: NaiveDateTime) {
        if timestamp < self.first_used {
            self.first_used = timestamp;
        }
    }
}

/// Collects the categorized transactions of one exchange run. Writers from
/// concurrent endpoint tasks go through a single lock.
#[derive(Debug)]
pub(crate) struct LedgerAggregator {
    state: Mutex<LedgerState>,
}

impl LedgerAggregator {
    pub(crate) fn new(now: NaiveDateTime) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                categories: CategoryLedger::new(),
                first_used: now,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn append(&self, category: Category, tx: Transaction) {
        debug_assert!(tx.is_well_formed());
        let mut state = self.lock();
        state.observe(tx.timestamp);
        state.categories.entry(category).or_default().push(tx);
    }

    /// Appends a batch without interleaving with other writers.
    pub(crate) fn extend(&self, category: Category, txs: impl IntoIterator<Item = Transaction>) {
        let mut state = self.lock();
        for tx in txs {
            debug_assert!(tx.is_well_formed());
            state.observe(tx.timestamp);
            state.categories.entry(category).or_default().push(tx);
        }
    }

    /// Adds a swap leg to the first Exchanges entry it belongs to, or starts a
    /// new entry. Returns whether the leg was merged.
    pub(crate) fn merge_or_append_leg(&self, policy: &MergePolicy, leg: Transaction) -> bool {
        let mut state = self.lock();
        state.observe(leg.timestamp);

        let exchanges = state.categories.entry(Category::Exchanges).or_default();
        match exchanges.iter_mut().find(|existing| policy.matches(existing, &leg)) {
            Some(existing) => {
                debug!(timestamp = %leg.timestamp, kind = ?leg.kind, "merging swap leg");
                existing.absorb(leg);
                true
            }
            None => {
                exchanges.push(leg);
                false
            }
        }
    }

    pub(crate) fn first_used(&self) -> NaiveDateTime {
        self.lock().first_used
    }

    pub(crate) fn into_ledger(self, source: impl Into<String>) -> ExchangeLedger {
        let state = self.state.into_inner().unwrap_or_else(PoisonError::into_inner);
        ExchangeLedger {
            source: source.into(),
            first_used: state.first_used,
            categories: state.categories,
        }
    }
}
