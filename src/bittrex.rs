use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use linkme::distributed_slice;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    base::{parse_decimal_or_zero, Category, CurrencyAmount, ExchangeLedger, Transaction},
    fetch::{FetchError, Fetcher, HttpRequest, ReqwestTransport},
    ledger::LedgerAggregator,
    time::parse_date_time_or_default,
    LoadFuture, SourceContext, SourceType,
};

const EXCHANGE: &str = "Bittrex Transfer API";
const BASE_URL: &str = "https://api.bittrex.com/v3/";

const CACHE_NAMESPACE: &str = "Bittrex";
const CACHE_KEY: &str = "transfers";

const DEPOSITS: &str = "deposits/closed";
const WITHDRAWALS: &str = "withdrawals/closed";

// Closed deposits and withdrawals share one shape. Withdrawals have no source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TransferRecord {
    id: String,
    currency_symbol: String,
    quantity: String,
    crypto_address: String,
    crypto_address_tag: String,
    tx_id: String,
    tx_cost: String,
    source: String,
    status: String,
    created_at: String,
    completed_at: String,
    updated_at: String,
}

impl TransferRecord {
    fn is_withdrawal(&self) -> bool {
        self.source.is_empty()
    }
}

impl From<TransferRecord> for Transaction {
    fn from(item: TransferRecord) -> Self {
        let timestamp = parse_date_time_or_default(&item.completed_at, "completedAt");
        let amount = CurrencyAmount::new(&item.currency_symbol, parse_decimal_or_zero(&item.quantity, "quantity"));
        let note = format!("{} : {}", EXCHANGE, item.crypto_address);

        if item.is_withdrawal() {
            let fee = if item.tx_cost.is_empty() { Decimal::ZERO } else { parse_decimal_or_zero(&item.tx_cost, "txCost") };
            Transaction::withdrawal(timestamp, note, amount).with_fee(CurrencyAmount::new(item.currency_symbol, fee))
        } else {
            Transaction::deposit(timestamp, note, amount)
        }
    }
}

fn request(endpoint: &str) -> HttpRequest {
    HttpRequest::get(endpoint)
        .with_query("status", "COMPLETED")
        .with_query("pageSize", "200")
}

/// Fetches closed deposits and withdrawals concurrently. Both lists are
/// cached together, once both were fetched.
async fn fetch_transfers(fetcher: &Fetcher<'_>) -> Result<Vec<TransferRecord>, FetchError> {
    if let Some(transfers) = fetcher.cache().get(CACHE_NAMESPACE, CACHE_KEY) {
        return Ok(transfers);
    }

    let deposits_request = || request(DEPOSITS);
    let withdrawals_request = || request(WITHDRAWALS);
    let (mut transfers, withdrawals): (Vec<TransferRecord>, Vec<TransferRecord>) = futures::try_join!(
        fetcher.fetch(DEPOSITS, CACHE_KEY, &deposits_request),
        fetcher.fetch(WITHDRAWALS, CACHE_KEY, &withdrawals_request),
    )?;
    transfers.extend(withdrawals);

    fetcher.cache().put(CACHE_NAMESPACE, CACHE_KEY, &transfers);
    fetcher.pause().await;
    Ok(transfers)
}

async fn ingest(fetcher: &Fetcher<'_>, now: NaiveDateTime) -> Result<ExchangeLedger, FetchError> {
    let transfers = fetch_transfers(fetcher).await?;

    let ledger = LedgerAggregator::new(now);
    let (withdrawals, deposits): (Vec<_>, Vec<_>) = transfers.into_iter().partition(TransferRecord::is_withdrawal);
    ledger.extend(Category::Deposits, deposits.into_iter().map(Transaction::from));
    ledger.extend(Category::Withdrawals, withdrawals.into_iter().map(Transaction::from));

    let ledger = ledger.into_ledger(EXCHANGE);
    info!("{}: {} transactions, first used {}", EXCHANGE, ledger.len(), ledger.first_used);
    Ok(ledger)
}

fn load_transfers_async(context: SourceContext) -> LoadFuture {
    Box::pin(async move {
        let settings = &context.settings;
        let api_key = context.source.api_key.as_deref().context("missing api_key")?;
        let transport = ReqwestTransport::new(BASE_URL)?.with_header("Api-Key", api_key);
        let fetcher = Fetcher::new(&settings.cache, &transport, settings.retry).with_pause(settings.page_pause);
        Ok(ingest(&fetcher, settings.now).await?)
    })
}

#[distributed_slice(crate::SOURCES)]
static BITTREX_TRANSFERS_API: SourceType = SourceType {
    id: "BittrexApi",
    label: "Bittrex Transfers (API)",
    load_sync: None,
    load_async: Some(load_transfers_async),
};
