use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use washpay::config::KioskConfig;
use washpay::domain::ports::SettlementStoreHandle;
use washpay::infrastructure::in_memory::InMemorySettlementStore;
use washpay::interfaces::csv::decision_writer::DecisionWriter;
use washpay::interfaces::csv::scenario_reader::ScenarioReader;
use washpay::interfaces::replay::ScenarioRunner;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input scenario CSV file
    input: PathBuf,

    /// Kiosk configuration (JSON). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn open_store(db_path: Option<PathBuf>) -> Result<SettlementStoreHandle> {
    #[cfg(feature = "storage-rocksdb")]
    if let Some(path) = db_path {
        let store = washpay::infrastructure::rocksdb::RocksDBStore::open(path).into_diagnostic()?;
        return Ok(Arc::new(store));
    }

    #[cfg(not(feature = "storage-rocksdb"))]
    if db_path.is_some() {
        eprintln!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }

    Ok(Arc::new(InMemorySettlementStore::new()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .into_diagnostic()?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => KioskConfig::from_json_file(path).into_diagnostic()?,
        None => KioskConfig::default(),
    };

    let store = open_store(cli.db_path)?;
    let mut runner = ScenarioRunner::new(config, store);

    let file = File::open(&cli.input).into_diagnostic()?;
    let reader = ScenarioReader::new(file);
    let stdout = io::stdout();
    let mut writer = DecisionWriter::new(stdout.lock());

    for step in reader.steps() {
        let step = match step {
            Ok(step) => step,
            Err(e) => {
                tracing::error!(error = %e, "Skipping unreadable scenario row");
                continue;
            }
        };
        match runner.apply(step).await {
            Ok(Some(outcome)) => {
                for decision in &outcome.decisions {
                    writer
                        .write_decision(outcome.seq, decision)
                        .into_diagnostic()?;
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(error = %e, code = %e.code(), "Attempt not settled");
            }
        }
    }
    writer.flush().into_diagnostic()?;

    Ok(())
}
