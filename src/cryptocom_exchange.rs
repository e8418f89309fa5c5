use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use linkme::distributed_slice;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::{
    base::{decimal_from_number, decimal_or_zero, Category, CurrencyAmount, ExchangeLedger, Transaction},
    fetch::{quarter_windows, FetchError, Fetcher, HttpRequest, ReqwestTransport, Window},
    ledger::LedgerAggregator,
    time::from_timestamp_millis_or_default,
    LoadFuture, SourceContext, SourceType,
};

const EXCHANGE: &str = "Crypto.com Exchange API";
const BASE_URL: &str = "https://api.crypto.com/v2/";
const PAGE_SIZE: u32 = 200;

const DEPOSIT_HISTORY: &str = "private/get-deposit-history";
const WITHDRAWAL_HISTORY: &str = "private/get-withdrawal-history";
const TRADES: &str = "private/get-trades";

fn namespace(method: &str) -> String {
    format!("Crypto.com/Exchange/{}", method)
}

/// The exchange did not exist before this date.
fn launch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2019, 11, 14).expect("valid date")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiResponse<T> {
    #[serde(default)]
    id: i64,
    #[serde(default)]
    method: String,
    #[serde(default)]
    code: i64,
    result: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DepositList {
    #[serde(default)]
    deposit_list: Vec<DepositRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WithdrawalList {
    #[serde(default)]
    withdrawal_list: Vec<WithdrawalRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TradeList {
    #[serde(default)]
    trade_list: Vec<TradeRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DepositRecord {
    #[serde(default)]
    id: String,
    #[serde(default)]
    currency: String,
    #[serde(default)]
    amount: Option<serde_json::Number>,
    #[serde(default)]
    fee: Option<serde_json::Number>,
    #[serde(default)]
    address: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    create_time: Option<i64>,
    #[serde(default)]
    update_time: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WithdrawalRecord {
    #[serde(default)]
    id: String,
    #[serde(default)]
    currency: String,
    #[serde(default)]
    amount: Option<serde_json::Number>,
    #[serde(default)]
    fee: Option<serde_json::Number>,
    #[serde(default)]
    address: String,
    #[serde(default)]
    txid: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    create_time: Option<i64>,
    #[serde(default)]
    update_time: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TradeRecord {
    #[serde(default)]
    trade_id: String,
    #[serde(default)]
    order_id: String,
    #[serde(default)]
    instrument_name: String,
    #[serde(default)]
    side: String,
    #[serde(default)]
    traded_price: Option<serde_json::Number>,
    #[serde(default)]
    traded_quantity: Option<serde_json::Number>,
    #[serde(default)]
    fee: Option<serde_json::Number>,
    #[serde(default)]
    fee_currency: String,
    #[serde(default)]
    create_time: Option<i64>,
}

impl From<DepositRecord> for Transaction {
    fn from(item: DepositRecord) -> Self {
        let timestamp = from_timestamp_millis_or_default(item.update_time, "update_time");
        let amount = decimal_from_number(item.amount.as_ref(), "amount");
        let fee = decimal_from_number(item.fee.as_ref(), "fee");
        Transaction::deposit(
            timestamp,
            format!("{} : Deposit from {}", EXCHANGE, item.address),
            CurrencyAmount::new(item.currency.clone(), amount),
        )
        .with_fee(CurrencyAmount::new(item.currency, fee))
    }
}

impl From<WithdrawalRecord> for Transaction {
    fn from(item: WithdrawalRecord) -> Self {
        let timestamp = from_timestamp_millis_or_default(item.update_time, "update_time");
        let amount = decimal_from_number(item.amount.as_ref(), "amount");
        let fee = decimal_from_number(item.fee.as_ref(), "fee");
        Transaction::withdrawal(
            timestamp,
            format!("{} : Withdrawal to {}", EXCHANGE, item.address),
            CurrencyAmount::new(item.currency.clone(), amount),
        )
        .with_fee(CurrencyAmount::new(item.currency, fee))
    }
}

impl TryFrom<TradeRecord> for Transaction {
    type Error = anyhow::Error;

    fn try_from(item: TradeRecord) -> Result<Self, Self::Error> {
        let Some((base_currency, quote_currency)) = item.instrument_name.split_once('_') else {
            bail!("Invalid instrument name {:?}, expected: '<base>_<quote>'", item.instrument_name);
        };

        let timestamp = from_timestamp_millis_or_default(item.create_time, "create_time");
        let quantity = decimal_from_number(item.traded_quantity.as_ref(), "traded_quantity");
        let price = decimal_from_number(item.traded_price.as_ref(), "traded_price");
        let fee = decimal_from_number(item.fee.as_ref(), "fee");

        let base = CurrencyAmount::new(base_currency, quantity);
        let quote = CurrencyAmount::new(quote_currency, decimal_or_zero(quantity.checked_mul(price), "traded_quantity * traded_price"));
        let note = format!("{} : Exchange {}", EXCHANGE, item.trade_id);
        let tx = if item.side.eq_ignore_ascii_case("BUY") {
            Transaction::trade(timestamp, note, quote, base)
        } else {
            Transaction::trade(timestamp, note, base, quote)
        };

        Ok(tx.with_fee(CurrencyAmount::new(item.fee_currency, fee)))
    }
}

/// Builds the JSON-RPC style bodies of the private endpoints.
struct RequestBuilder<'a> {
    api_key: &'a str,
    next_id: AtomicU64,
}

impl<'a> RequestBuilder<'a> {
    fn new(api_key: &'a str) -> Self {
        Self {
            api_key,
            next_id: AtomicU64::new(1),
        }
    }

    fn request(&self, method: &str, window: &Window, status: Option<&str>) -> HttpRequest {
        let mut params = json!({
            "start_ts": window.start.and_utc().timestamp_millis(),
            "end_ts": window.end.and_utc().timestamp_millis(),
            "page_size": PAGE_SIZE,
            "page": 0,
        });
        if let Some(status) = status {
            params["status"] = json!(status);
        }

        HttpRequest::post(
            method,
            json!({
                "id": self.next_id.fetch_add(1, Ordering::Relaxed),
                "method": method,
                "api_key": self.api_key,
                "params": params,
                "nonce": Utc::now().timestamp_millis(),
            }),
        )
    }
}

/// Each window is fetched as a single page, so a full page means the window
/// may hold records that were not returned. Returns the number of full pages.
fn warn_on_full_pages(method: &str, windows: &[Window], page_sizes: impl IntoIterator<Item = usize>) -> usize {
    let mut full = 0;
    for (window, records) in windows.iter().zip(page_sizes) {
        if records >= PAGE_SIZE as usize {
            warn!(method, period = %window.period, records, "full page, later records of this window may be missing");
            full += 1;
        }
    }
    full
}

/// Fetches deposits, withdrawals and spot trades for all windows, one
/// concurrent task per endpoint. The first failing endpoint fails the run.
async fn ingest(fetcher: &Fetcher<'_>, windows: &[Window], api_key: &str, now: NaiveDateTime) -> Result<ExchangeLedger, FetchError> {
    let ledger = LedgerAggregator::new(now);
    let requests = RequestBuilder::new(api_key);

    let deposits = async {
        let pages: Vec<ApiResponse<DepositList>> = fetcher
            .fetch_windows(&namespace(DEPOSIT_HISTORY), windows, |window| requests.request(DEPOSIT_HISTORY, window, Some("1")))
            .await?;
        warn_on_full_pages(DEPOSIT_HISTORY, windows, pages.iter().map(|page| page.result.deposit_list.len()));
        let records = pages.into_iter().flat_map(|page| page.result.deposit_list);
        ledger.extend(Category::Deposits, records.map(Transaction::from));
        Ok::<_, FetchError>(())
    };

    let withdrawals = async {
        let pages: Vec<ApiResponse<WithdrawalList>> = fetcher
            .fetch_windows(&namespace(WITHDRAWAL_HISTORY), windows, |window| requests.request(WITHDRAWAL_HISTORY, window, None))
            .await?;
        warn_on_full_pages(WITHDRAWAL_HISTORY, windows, pages.iter().map(|page| page.result.withdrawal_list.len()));
        let records = pages.into_iter().flat_map(|page| page.result.withdrawal_list);
        ledger.extend(Category::Withdrawals, records.map(Transaction::from));
        Ok::<_, FetchError>(())
    };

    let trades = async {
        let pages: Vec<ApiResponse<TradeList>> = fetcher
            .fetch_windows(&namespace(TRADES), windows, |window| requests.request(TRADES, window, None))
            .await?;
        warn_on_full_pages(TRADES, windows, pages.iter().map(|page| page.result.trade_list.len()));
        let records = pages.into_iter().flat_map(|page| page.result.trade_list);
        let transactions = records.filter_map(|record| match Transaction::try_from(record) {
            Ok(tx) => Some(tx),
            Err(err) => {
                warn!("{}: skipping trade: {}", EXCHANGE, err);
                None
            }
        });
        ledger.extend(Category::Exchanges, transactions);
        Ok::<_, FetchError>(())
    };

    futures::try_join!(deposits, withdrawals, trades)?;

    let ledger = ledger.into_ledger(EXCHANGE);
    info!("{}: {} transactions, first used {}", EXCHANGE, ledger.len(), ledger.first_used);
    Ok(ledger)
}

fn load_exchange_api_async(context: SourceContext) -> LoadFuture {
    Box::pin(async move {
        let settings = &context.settings;
        let api_key = context.source.api_key.as_deref().context("missing api_key")?;
        let transport = ReqwestTransport::new(BASE_URL)?;
        let fetcher = Fetcher::new(&settings.cache, &transport, settings.retry).with_pause(settings.page_pause);

        let since = context.source.since.unwrap_or_else(launch_date);
        let windows = quarter_windows(since, settings.now, settings.timezone);
        Ok(ingest(&fetcher, &windows, api_key, settings.now).await?)
    })
}

#[distributed_slice(crate::SOURCES)]
static CRYPTOCOM_EXCHANGE_API: SourceType = SourceType {
    id: "CryptoComExchangeApi",
    label: "Crypto.com Exchange (API)",
    load_sync: None,
    load_async: Some(load_exchange_api_async),
};
