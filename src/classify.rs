use std::{collections::HashSet, fmt::Debug};

use chrono::Duration;
use tracing::warn;

use crate::base::{Category, Transaction};

/// How a record of a given kind is turned into a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rule {
    /// Incoming `To {currency, amount}`
    Credit(Category),
    /// Outgoing `From {currency, -amount}`
    Debit(Category),
    /// Crypto bought with fiat, booked as CashIn
    Purchase,
    /// Crypto spent for fiat, booked as CashOut
    Payment,
    /// Both sides reported on a single record
    Exchange,
    /// One side of an exchange, the other side is a separate record
    SwapLeg,
    /// Internal movement without fiscal relevance
    Ignore,
}

impl Rule {
    pub(crate) fn category(self) -> Option<Category> {
        match self {
            Rule::Credit(category) | Rule::Debit(category) => Some(category),
            Rule::Purchase => Some(Category::CashIn),
            Rule::Payment => Some(Category::CashOut),
            Rule::Exchange | Rule::SwapLeg => Some(Category::Exchanges),
            Rule::Ignore => None,
        }
    }
}

/// Crypto.com App transaction kinds, sorted for binary search.
const APP_KIND_RULES: &[(&str, Rule)] = &[
    ("admin_wallet_credited", Rule::Credit(Category::Deposits)),
    ("card_cashback_reverted", Rule::Debit(Category::CommercialRebates)),
    ("crypto_deposit", Rule::Credit(Category::Deposits)),
    ("crypto_earn_extra_interest_paid", Rule::Credit(Category::Interests)),
    ("crypto_earn_interest_paid", Rule::Credit(Category::Interests)),
    ("crypto_earn_program_created", Rule::Ignore),
    ("crypto_earn_program_withdrawn", Rule::Ignore),
    ("crypto_exchange", Rule::Exchange),
    ("crypto_payment", Rule::Payment),
    ("crypto_purchase", Rule::Purchase),
    ("crypto_to_exchange_transfer", Rule::Debit(Category::Withdrawals)),
    ("crypto_transfer", Rule::Debit(Category::Withdrawals)),
    ("crypto_viban_exchange", Rule::Payment),
    ("crypto_wallet_swap_credited", Rule::SwapLeg),
    ("crypto_wallet_swap_debited", Rule::SwapLeg),
    ("crypto_withdrawal", Rule::Debit(Category::Withdrawals)),
    ("dust_conversion_credited", Rule::SwapLeg),
    ("dust_conversion_debited", Rule::SwapLeg),
    ("dynamic_coin_swap_bonus_exchange_deposit", Rule::Ignore),
    ("dynamic_coin_swap_credited", Rule::Ignore),
    ("dynamic_coin_swap_debited", Rule::Ignore),
    ("exchange_to_crypto_transfer", Rule::Credit(Category::Deposits)),
    ("gift_card_reward", Rule::Credit(Category::CommercialRebates)),
    ("interest_swap_credited", Rule::SwapLeg),
    ("interest_swap_debited", Rule::SwapLeg),
    ("lockup_lock", Rule::Ignore),
    ("lockup_swap_credited", Rule::SwapLeg),
    ("lockup_swap_debited", Rule::SwapLeg),
    ("lockup_swap_rebate", Rule::Ignore),
    ("lockup_upgrade", Rule::Ignore),
    ("mco_stake_reward", Rule::Credit(Category::Interests)),
    ("pay_checkout_reward", Rule::Credit(Category::CommercialRebates)),
    ("referral_bonus", Rule::Credit(Category::Referrals)),
    ("referral_card_cashback", Rule::Credit(Category::CommercialRebates)),
    ("referral_gift", Rule::Credit(Category::Referrals)),
    ("reimbursement", Rule::Credit(Category::CommercialRebates)),
    ("reimbursement_reverted", Rule::Debit(Category::CommercialRebates)),
    ("staking_reward", Rule::Credit(Category::Interests)),
    ("supercharger_deposit", Rule::Debit(Category::Withdrawals)),
    ("supercharger_withdrawal", Rule::Credit(Category::Deposits)),
    ("transfer_cashback", Rule::Credit(Category::CommercialRebates)),
    ("transfer_cashback_reverted", Rule::Debit(Category::CommercialRebates)),
    ("viban_deposit", Rule::Credit(Category::Deposits)),
    ("viban_purchase", Rule::Exchange),
];

pub(crate) fn app_kind_rule(kind: &str) -> Option<Rule> {
    APP_KIND_RULES
        .binary_search_by(|(k, _)| (*k).cmp(kind))
        .ok()
        .map(|index| APP_KIND_RULES[index].1)
}

/// Kinds without a rule seen during one run. Each one is reported once.
#[derive(Debug, Default)]
pub(crate) struct UnknownKinds {
    reported: HashSet<String>,
}

impl UnknownKinds {
    /// Logs the first record of an unknown kind. Returns whether this call
    /// logged.
    pub(crate) fn report(&mut self, source: &str, kind: &str, record: &dyn Debug) -> bool {
        if self.reported.contains(kind) {
            return false;
        }
        warn!(source, kind, "unsupported transaction kind, please open an issue: {:?}", record);
        self.reported.insert(kind.to_owned());
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.reported.len()
    }
}

/// Decides whether a swap leg belongs to an existing exchange entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MergePolicy {
    pub tolerance: Duration,
    pub kind_prefix_len: usize,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            tolerance: Duration::seconds(2),
            kind_prefix_len: 5,
        }
    }
}

impl MergePolicy {
    fn kind_prefix<'k>(&self, kind: &'k str) -> &'k str {
        kind.get(..self.kind_prefix_len).unwrap_or(kind)
    }

    pub(crate) fn matches(&self, existing: &Transaction, leg: &Transaction) -> bool {
        let (Some(existing_kind), Some(leg_kind)) = (&existing.kind, &leg.kind) else {
            return false;
        };
        (existing.timestamp - leg.timestamp).abs() <= self.tolerance
            && self.kind_prefix(existing_kind) == self.kind_prefix(leg_kind)
    }
}
