mod collector;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tracevault_core::collab::{CollaboratorError, Recommendation, RecordSource, RepairAdvisor};
use tracevault_core::collector::TraceCollector;
use tracevault_core::provider::StorageProvider;
use tracevault_engine::{
    AlertGate, Collaborators, EngineConfig, LogAlertSink, StorageContext, TraceVault,
};
use tracevault_storage::{FjallObjectProvider, FjallRegistryStore};
use tracing::{info, warn};

use crate::collector::JsonLinesCollector;

// ─────────────────────────────────────────────────────────────────────────────
// CLI
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "tracevault",
    about = "Tiered trace storage with replica verification and repair",
    version
)]
struct Cli {
    /// Engine configuration (TOML). Defaults apply when omitted.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory for the registry and the local object providers.
    #[arg(short, long)]
    data_dir: Option<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tracevault")
        .join("data")
}

// ─────────────────────────────────────────────────────────────────────────────
// Collaborator stand-ins
// ─────────────────────────────────────────────────────────────────────────────

/// Always proposes restoring from a healthy copy.
struct StaticAdvisor;

#[async_trait]
impl RepairAdvisor for StaticAdvisor {
    async fn recommend_strategy(&self, _key: &str) -> Result<Recommendation, CollaboratorError> {
        Ok(Recommendation {
            strategy: "single_corruption".to_string(),
            confidence: 0.5,
        })
    }
}

/// The daemon has no handle on the original ingestion source.
struct UnavailableSource;

#[async_trait]
impl RecordSource for UnavailableSource {
    async fn fetch_raw(&self, key: &str) -> Result<Vec<u8>, CollaboratorError> {
        Err(CollaboratorError::new(
            "record source",
            format!("no source configured for {key}"),
        ))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tracevault=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref())?;

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    std::fs::create_dir_all(&data_dir)?;
    let store = Arc::new(FjallRegistryStore::open(&data_dir)?);

    let mut providers: Vec<Arc<dyn StorageProvider>> = Vec::new();
    for local in &config.providers.local {
        let costs: HashMap<_, _> = local.costs.iter().map(|(t, c)| (*t, *c)).collect();
        providers.push(Arc::new(FjallObjectProvider::open(
            store.keyspace(),
            &local.name,
            costs,
            local.replica,
        )?));
    }
    if providers.is_empty() {
        anyhow::bail!("no providers configured under [[providers.local]]");
    }

    let alerts = Arc::new(AlertGate::new(Arc::new(LogAlertSink)));
    let ctx = StorageContext::open(config, providers, store.clone(), alerts)?;
    let vault = TraceVault::new(
        ctx,
        Collaborators {
            advisor: Arc::new(StaticAdvisor),
            analyzer: None,
            source: Arc::new(UnavailableSource),
            assigner: None,
        },
    )?;
    let tasks = vault.spawn_background();
    info!(data_dir = %data_dir.display(), "tracevault running");

    let mut collector = JsonLinesCollector::new(tokio::io::stdin());
    let mut record_rx = collector.start()?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut input_open = true;
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            record = record_rx.recv(), if input_open => match record {
                Some(record) => {
                    if let Err(e) = vault.ingest(record) {
                        warn!("record rejected: {e}");
                    }
                }
                None => {
                    info!(collector = collector.name(), "input closed, still serving");
                    input_open = false;
                }
            },
        }
    }

    info!("shutting down");
    collector.stop()?;
    vault.shutdown().await;
    tasks.join().await;
    store.persist()?;
    Ok(())
}
