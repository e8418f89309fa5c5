mod base;
mod bittrex;
mod cache;
mod classify;
mod config;
mod cryptocom_app;
mod cryptocom_exchange;
mod fetch;
mod ledger;
mod time;

use std::{future::Future, path::PathBuf, pin::Pin, sync::Arc};

use anyhow::{anyhow, Context, Result};
use base::{save_ledgers_to_json, Category, ExchangeLedger};
use chrono::Utc;
use clap::Parser;
use config::{Config, Settings, SourceConfig};
use linkme::distributed_slice;
use strum::IntoEnumIterator;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

pub(crate) type LoadFuture = Pin<Box<dyn Future<Output = Result<ExchangeLedger>> + Send>>;

/// What a source loader gets: the shared settings and its own entry from the
/// configuration file.
#[derive(Clone)]
pub(crate) struct SourceContext {
    pub settings: Arc<Settings>,
    pub source: SourceConfig,
}

pub(crate) struct SourceType {
    pub id: &'static str,
    pub label: &'static str,
    pub load_sync: Option<fn(&SourceContext) -> Result<ExchangeLedger>>,
    pub load_async: Option<fn(SourceContext) -> LoadFuture>,
}

#[distributed_slice]
pub(crate) static SOURCES: [SourceType];

fn source_type(id: &str) -> Option<&'static SourceType> {
    SOURCES.iter().find(|source_type| source_type.id == id)
}

async fn load_source(context: SourceContext) -> Result<ExchangeLedger> {
    let id = context.source.source_type.as_str();
    let source_type = source_type(id).ok_or_else(|| anyhow!("unknown source type {:?}", id))?;
    info!("Loading {} ({})", context.source.display_name(), source_type.label);

    if let Some(load_async) = source_type.load_async {
        load_async(context).await
    } else if let Some(load_sync) = source_type.load_sync {
        tokio::task::spawn_blocking(move || load_sync(&context)).await?
    } else {
        Err(anyhow!("source type {:?} cannot be loaded", source_type.id))
    }
}

/// Ingests exchange histories and writes them as categorized ledgers.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Sources configuration file
    #[arg(short, long, default_value = "sources.json")]
    config: PathBuf,

    /// Output file for the categorized ledgers
    #[arg(short, long, default_value = "ledger.json")]
    output: PathBuf,

    /// Sort each category by timestamp instead of processing order
    #[arg(long)]
    sort: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    let settings = Arc::new(Settings::from_config(&config, Utc::now().naive_utc())?);

    let sources: Vec<SourceConfig> = config
        .sources
        .into_iter()
        .filter(|source| {
            if !source.enabled {
                info!("Skipping disabled source {}", source.display_name());
            }
            source.enabled
        })
        .collect();

    let runs = sources.iter().map(|source| {
        load_source(SourceContext {
            settings: settings.clone(),
            source: source.clone(),
        })
    });
    let results = futures::future::join_all(runs).await;

    let mut ledgers = Vec::new();
    for (source, result) in sources.iter().zip(results) {
        match result {
            Ok(ledger) => {
                for category in Category::iter() {
                    let count = ledger.transactions(category).len();
                    if count > 0 {
                        info!("{}: {} {}", ledger.source, count, category);
                    }
                }
                ledgers.push(ledger);
            }
            Err(err) => error!("Failed to load {}: {:#}", source.display_name(), err),
        }
    }
    if ledgers.len() < sources.len() {
        warn!("{} of {} sources failed", sources.len() - ledgers.len(), sources.len());
    }

    if cli.sort {
        ledgers.iter_mut().for_each(ExchangeLedger::sort_by_timestamp);
    }

    save_ledgers_to_json(&ledgers, &cli.output).with_context(|| format!("writing {}", cli.output.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registered_sources() {
        let mut ids: Vec<&str> = SOURCES.iter().map(|source_type| source_type.id).collect();
        ids.sort();
        assert_eq!(ids, ["BittrexApi", "CryptoComAppCsv", "CryptoComExchangeApi"]);
        assert!(SOURCES.iter().all(|source_type| source_type.load_sync.is_some() != source_type.load_async.is_some()));
        assert!(source_type("KrakenApi").is_none());
    }

    #[tokio::test]
    async fn test_load_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.csv");
        std::fs::write(
            &path,
            "Timestamp (UTC),Transaction Description,Currency,Amount,To Currency,To Amount,Native Currency,Native Amount,Native Amount (in USD),Transaction Kind\n\
             2021-03-01 10:00:00,Deposit BTC,BTC,0.01,,,EUR,450.12,530.01,crypto_deposit\n",
        )
        .unwrap();

        let config = Config {
            cache_dir: Some(dir.path().join("cache")),
            ..Default::default()
        };
        let settings = Arc::new(Settings::from_config(&config, Utc::now().naive_utc()).unwrap());
        let mut source: SourceConfig = serde_json::from_str(r#"{ "source_type": "CryptoComAppCsv", "path": "app.csv" }"#).unwrap();
        source.full_path = path;

        let ledger = load_source(SourceContext { settings: settings.clone(), source }).await.unwrap();
        assert_eq!(ledger.len(), 1);

        let unknown: SourceConfig = serde_json::from_str(r#"{ "source_type": "KrakenApi" }"#).unwrap();
        assert!(load_source(SourceContext { settings, source: unknown }).await.is_err());
    }
}
