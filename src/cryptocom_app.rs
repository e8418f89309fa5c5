use std::{io::Read, path::Path};

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use linkme::distributed_slice;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{
    base::{decimal_or_zero, parse_decimal, parse_decimal_or_zero, Category, CurrencyAmount, ExchangeLedger, Role, Transaction},
    classify::{app_kind_rule, MergePolicy, Rule, UnknownKinds},
    ledger::LedgerAggregator,
    time::parse_date_time_or_default,
    SourceContext, SourceType,
};

const SOURCE: &str = "Crypto.com App CSV";

/// The app reports BTC withdrawals net of this network fee.
const BTC_WITHDRAWAL_FEE: Decimal = dec!(0.0003);

// Timestamp (UTC),Transaction Description,Currency,Amount,To Currency,To Amount,Native Currency,Native Amount,Native Amount (in USD),Transaction Kind
#[derive(Debug, Clone, Deserialize)]
struct AppCsvRecord {
    #[serde(rename = "Timestamp (UTC)")]
    timestamp: String,
    #[serde(rename = "Transaction Description")]
    description: String,
    #[serde(rename = "Currency")]
    currency: String,
    #[serde(rename = "Amount")]
    amount: String,
    #[serde(rename = "To Currency", default)]
    to_currency: String,
    #[serde(rename = "To Amount", default)]
    to_amount: String,
    #[serde(rename = "Native Currency", default)]
    native_currency: String,
    #[serde(rename = "Native Amount", default)]
    native_amount: String,
    #[serde(rename = "Native Amount (in USD)", default)]
    native_amount_usd: String,
    #[serde(rename = "Transaction Kind")]
    kind: String,
}

/// A CSV row with its fields parsed.
#[derive(Debug)]
struct AppRow {
    timestamp: NaiveDateTime,
    description: String,
    currency: String,
    amount: Decimal,
    to_currency: String,
    to_amount: Decimal,
    native_currency: String,
    native_amount: Decimal,
    kind: String,
}

impl From<AppCsvRecord> for AppRow {
    fn from(record: AppCsvRecord) -> Self {
        // the USD amount is validated for the log only, no rule uses it
        if !record.native_amount_usd.is_empty() {
            parse_decimal_or_zero(&record.native_amount_usd, "Native Amount (in USD)");
        }

        Self {
            timestamp: parse_date_time_or_default(&record.timestamp, "Timestamp (UTC)"),
            amount: parse_decimal_or_zero(&record.amount, "Amount"),
            // only exchanges have a destination amount
            to_amount: parse_decimal(&record.to_amount).unwrap_or_default(),
            native_amount: parse_decimal_or_zero(&record.native_amount, "Native Amount"),
            description: record.description,
            currency: record.currency,
            to_currency: record.to_currency,
            native_currency: record.native_currency,
            kind: record.kind,
        }
    }
}

enum Classified {
    Entry(Category, Transaction),
    Leg(Transaction),
    Ignored,
    Unknown,
}

impl AppRow {
    fn note(&self) -> String {
        format!("{} : {} {}", SOURCE, self.kind, self.description)
    }

    fn debit(&self) -> Transaction {
        let tx = Transaction::new(self.timestamp, self.note());
        if self.kind == "crypto_withdrawal" && self.description == "Withdraw BTC" {
            let amount = decimal_or_zero(self.amount.checked_add(BTC_WITHDRAWAL_FEE), "Amount");
            tx.with_fee(CurrencyAmount::new(&self.currency, BTC_WITHDRAWAL_FEE))
                .with(Role::From, CurrencyAmount::new(&self.currency, -amount))
        } else {
            tx.with(Role::From, CurrencyAmount::new(&self.currency, -self.amount))
        }
    }

    fn classify(&self) -> Classified {
        let Some(rule) = app_kind_rule(&self.kind) else {
            return Classified::Unknown;
        };
        let Some(category) = rule.category() else {
            return Classified::Ignored;
        };
        let tx = || Transaction::new(self.timestamp, self.note());
        // only swap legs carry their kind, which makes them merge candidates
        let leg = || tx().with_kind(&self.kind);
        let currency_amount = || CurrencyAmount::new(&self.currency, self.amount);

        let entry = match rule {
            Rule::Credit(_) => tx().with(Role::To, currency_amount()),
            Rule::Purchase => tx()
                .with(Role::To, currency_amount())
                .with(Role::From, CurrencyAmount::new(&self.native_currency, self.native_amount)),
            Rule::Debit(_) => self.debit(),
            Rule::Payment => self.debit().with(Role::To, CurrencyAmount::new(&self.native_currency, -self.native_amount)),
            Rule::Exchange => tx()
                .with(Role::To, CurrencyAmount::new(&self.to_currency, self.to_amount))
                .with(Role::From, CurrencyAmount::new(&self.currency, -self.amount)),
            Rule::SwapLeg if self.amount > Decimal::ZERO => return Classified::Leg(leg().with(Role::To, currency_amount())),
            Rule::SwapLeg => return Classified::Leg(leg().with(Role::From, CurrencyAmount::new(&self.currency, -self.amount))),
            Rule::Ignore => return Classified::Ignored,
        };
        Classified::Entry(category, entry)
    }
}

/// Categorizes Crypto.com App rows in file order, merging swap legs.
fn categorize(records: impl IntoIterator<Item = AppCsvRecord>, merge: &MergePolicy, now: NaiveDateTime) -> (ExchangeLedger, UnknownKinds) {
    let ledger = LedgerAggregator::new(now);
    let mut unknown = UnknownKinds::default();

    for record in records {
        let row = AppRow::from(record);
        match row.classify() {
            Classified::Entry(category, tx) => ledger.append(category, tx),
            Classified::Leg(leg) => {
                ledger.merge_or_append_leg(merge, leg);
            }
            Classified::Ignored => {}
            Classified::Unknown => {
                unknown.report(SOURCE, &row.kind, &row);
            }
        }
    }

    debug!(first_used = %ledger.first_used(), "{} categorized", SOURCE);
    (ledger.into_ledger(SOURCE), unknown)
}

fn read_records<R: Read>(reader: R) -> Vec<AppCsvRecord> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut records = Vec::new();

    for result in rdr.deserialize() {
        match result {
            Ok(record) => records.push(record),
            Err(err) => warn!("{}: skipping unreadable row: {}", SOURCE, err),
        }
    }

    records
}

// loads a Crypto.com App crypto transactions CSV file into a categorized ledger
pub(crate) fn load_app_csv(input_path: &Path, merge: &MergePolicy, now: NaiveDateTime) -> Result<ExchangeLedger> {
    let file = std::fs::File::open(input_path).with_context(|| format!("opening {}", input_path.display()))?;
    let (ledger, unknown) = categorize(read_records(file), merge, now);
    info!("{}: {} transactions, {} unsupported kinds", SOURCE, ledger.len(), unknown.len());
    Ok(ledger)
}

fn load_app_csv_source(context: &SourceContext) -> Result<ExchangeLedger> {
    load_app_csv(&context.source.full_path, &context.settings.merge, context.settings.now)
}

#[distributed_slice(crate::SOURCES)]
static CRYPTOCOM_APP_CSV: SourceType = SourceType {
    id: "CryptoComAppCsv",
    label: "Crypto.com App (CSV)",
    load_sync: Some(load_app_csv_source),
    load_async: None,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::tests::net_change;
    use chrono::NaiveDate;

    const HEADER: &str = "Timestamp (UTC),Transaction Description,Currency,Amount,To Currency,To Amount,Native Currency,Native Amount,Native Amount (in USD),Transaction Kind\n";

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2021, 12, 31).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2021, 3, 1).unwrap().and_hms_opt(h, m, s).unwrap()
    }

    fn run(rows: &str) -> (ExchangeLedger, UnknownKinds) {
        let csv_data = format!("{}{}", HEADER, rows);
        categorize(read_records(csv_data.as_bytes()), &MergePolicy::default(), now())
    }

    #[test]
    fn test_routing() {
        let (ledger, unknown) = run(r#"2021-03-01 10:00:00,Deposit BTC,BTC,0.01,,,EUR,450.12,530.01,crypto_deposit
2021-03-01 10:05:00,Buy CRO,CRO,100,,,EUR,15.5,18.2,crypto_purchase
2021-03-01 10:10:00,CRO -> BTC,CRO,-50,BTC,0.0001,EUR,-7.7,-9.1,crypto_exchange
2021-03-01 10:15:00,Card Cashback,CRO,1.5,,,EUR,0.23,0.27,referral_card_cashback
2021-03-01 10:20:00,Crypto Earn,CRO,0.42,,,EUR,0.06,0.07,crypto_earn_interest_paid
2021-03-01 10:25:00,Pay CRO,CRO,-20,,,EUR,-3.1,-3.6,crypto_payment
2021-03-01 10:30:00,Crypto Earn Deposit,CRO,-10,,,EUR,-1.5,-1.8,crypto_earn_program_created
2021-03-01 10:35:00,Referral Bonus,CRO,25,,,EUR,3.8,4.5,referral_bonus
"#);
        assert_eq!(unknown.len(), 0);

        let deposits = ledger.transactions(Category::Deposits);
        assert_eq!(deposits.len(), 1);
        assert_eq!(deposits[0].note, "Crypto.com App CSV : crypto_deposit Deposit BTC");
        assert_eq!(deposits[0].amounts(Role::To), &[CurrencyAmount::new("BTC", dec!(0.01))]);
        assert_eq!(deposits[0].timestamp, at(10, 0, 0));

        let cash_in = ledger.transactions(Category::CashIn);
        assert_eq!(cash_in[0].amounts(Role::To), &[CurrencyAmount::new("CRO", dec!(100))]);
        assert_eq!(cash_in[0].amounts(Role::From), &[CurrencyAmount::new("EUR", dec!(15.5))]);

        let exchanges = ledger.transactions(Category::Exchanges);
        assert_eq!(exchanges[0].amounts(Role::From), &[CurrencyAmount::new("CRO", dec!(50))]);
        assert_eq!(exchanges[0].amounts(Role::To), &[CurrencyAmount::new("BTC", dec!(0.0001))]);

        let cash_out = ledger.transactions(Category::CashOut);
        assert_eq!(cash_out[0].amounts(Role::From), &[CurrencyAmount::new("CRO", dec!(20))]);
        assert_eq!(cash_out[0].amounts(Role::To), &[CurrencyAmount::new("EUR", dec!(3.1))]);

        assert_eq!(ledger.transactions(Category::CommercialRebates).len(), 1);
        assert_eq!(ledger.transactions(Category::Interests).len(), 1);
        assert_eq!(ledger.transactions(Category::Referrals).len(), 1);
        assert!(ledger.transactions(Category::Withdrawals).is_empty());
        assert_eq!(ledger.len(), 7);
        assert_eq!(ledger.first_used, at(10, 0, 0));
    }

    #[test]
    fn test_swap_legs_merge_exactly() {
        let (ledger, _) = run(r#"2021-03-01 12:00:00,Convert Dust,CRO,0.00030000,,,EUR,0.01,0.01,dust_conversion_credited
2021-03-01 12:00:01,Convert Dust,CRO,-0.00030000,,,EUR,-0.01,-0.01,dust_conversion_debited
2021-03-01 12:00:11,Convert Dust,ADA,-1.5,,,EUR,-0.4,-0.5,dust_conversion_debited
"#);
        let exchanges = ledger.transactions(Category::Exchanges);
        assert_eq!(exchanges.len(), 2);

        let merged = &exchanges[0];
        assert_eq!(merged.amounts(Role::To), &[CurrencyAmount::new("CRO", dec!(0.00030000))]);
        assert_eq!(merged.amounts(Role::From), &[CurrencyAmount::new("CRO", dec!(0.00030000))]);
        assert_eq!(net_change(merged, "CRO"), Decimal::ZERO);

        assert_eq!(exchanges[1].amounts(Role::From), &[CurrencyAmount::new("ADA", dec!(1.5))]);
        assert!(exchanges[1].amounts(Role::To).is_empty());
    }

    #[test]
    fn test_swap_leg_never_joins_explicit_exchange() {
        let (ledger, _) = run(r#"2021-03-01 10:10:00,CRO -> BTC,CRO,-50,BTC,0.0001,EUR,-7.7,-9.1,crypto_exchange
2021-03-01 10:10:01,Swap,ADA,5,,,EUR,1.2,1.4,crypto_wallet_swap_credited
2021-03-01 10:10:02,Swap,CRO,-30,,,EUR,-1.2,-1.4,crypto_wallet_swap_debited
"#);
        let exchanges = ledger.transactions(Category::Exchanges);
        assert_eq!(exchanges.len(), 2);

        assert_eq!(exchanges[0].kind, None);
        assert_eq!(exchanges[0].amounts(Role::From), &[CurrencyAmount::new("CRO", dec!(50))]);
        assert_eq!(exchanges[0].amounts(Role::To), &[CurrencyAmount::new("BTC", dec!(0.0001))]);

        assert_eq!(exchanges[1].amounts(Role::To), &[CurrencyAmount::new("ADA", dec!(5))]);
        assert_eq!(exchanges[1].amounts(Role::From), &[CurrencyAmount::new("CRO", dec!(30))]);
    }

    #[test]
    fn test_unknown_kind_is_reported_once() {
        let (ledger, unknown) = run(r#"2021-03-01 10:00:00,NFT,CRO,-5,,,EUR,-1,-1,nft_purchase
2021-03-01 10:01:00,NFT,CRO,-6,,,EUR,-1,-1,nft_purchase
2021-03-01 10:02:00,NFT,CRO,-7,,,EUR,-1,-1,nft_purchase
"#);
        assert_eq!(unknown.len(), 1);
        assert_eq!(ledger.len(), 0);
        assert_eq!(ledger.first_used, now());
    }

    #[test]
    fn test_btc_withdrawal_fee() {
        let (ledger, _) = run(r#"2021-03-01 10:00:00,Withdraw BTC,BTC,-0.01,,,EUR,-450,-530,crypto_withdrawal
2021-03-01 11:00:00,Withdraw ETH,ETH,-0.5,,,EUR,-800,-950,crypto_withdrawal
"#);
        let withdrawals = ledger.transactions(Category::Withdrawals);
        assert_eq!(withdrawals.len(), 2);
        assert_eq!(withdrawals[0].amounts(Role::From), &[CurrencyAmount::new("BTC", dec!(0.0097))]);
        assert_eq!(withdrawals[0].amounts(Role::Fee), &[CurrencyAmount::new("BTC", dec!(0.0003))]);
        assert_eq!(withdrawals[1].amounts(Role::From), &[CurrencyAmount::new("ETH", dec!(0.5))]);
        assert!(withdrawals[1].amounts(Role::Fee).is_empty());
    }

    #[test]
    fn test_bad_fields_are_defaulted() {
        let (ledger, _) = run(r#"not a date,Deposit,BTC,abc,,,EUR,1,1,crypto_deposit
2021-03-01 10:00:00,Too,Few,Columns
"#);
        let deposits = ledger.transactions(Category::Deposits);
        assert_eq!(deposits.len(), 1);
        assert_eq!(deposits[0].timestamp, crate::time::epoch());
        assert_eq!(deposits[0].amounts(Role::To), &[CurrencyAmount::new("BTC", Decimal::ZERO)]);
        assert_eq!(ledger.first_used, crate::time::epoch());
    }

    #[test]
    fn test_load_csv_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crypto_transactions_record.csv");
        std::fs::write(&path, format!("{}2021-03-01 10:00:00,Staking,CRO,3,,,EUR,0.5,0.6,staking_reward\n", HEADER)).unwrap();

        let ledger = load_app_csv(&path, &MergePolicy::default(), now()).unwrap();
        assert_eq!(ledger.source, SOURCE);
        assert_eq!(ledger.transactions(Category::Interests).len(), 1);
        assert!(load_app_csv(&dir.path().join("missing.csv"), &MergePolicy::default(), now()).is_err());
    }
}
