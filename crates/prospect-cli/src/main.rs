use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use prospect_core::IncomingRecord;
use prospect_storage::{MemoryProspectStore, PgProspectStore, ProspectStore};
use prospect_sync::{AbortSignal, DuplicateConfig, ProspectReconciler, ReconcileOptions};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "prospect-cli")]
#[command(about = "Prospect duplicate detection and reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile a JSON array of records for one source.
    Import {
        #[arg(long)]
        source_id: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        no_smart_matching: bool,
        #[arg(long)]
        no_preserve_ai_data: bool,
    },
    /// Print ranked duplicate candidates for a single record.
    Match {
        #[arg(long)]
        source_id: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Apply the embedded database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = DuplicateConfig::from_env();

    match cli.command {
        Commands::Import {
            source_id,
            file,
            no_smart_matching,
            no_preserve_ai_data,
        } => {
            let records = load_batch(&file)?;
            let options = apply_flags(ReconcileOptions::from_env(), no_smart_matching, no_preserve_ai_data);
            let store = open_store().await?;
            let mut reconciler = ProspectReconciler::new(store, config, options);
            let stats = reconciler
                .reconcile_batch(&source_id, records, &AbortSignal::new())
                .await
                .with_context(|| format!("reconciling {} for source {source_id}", file.display()))?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Match { source_id, file } => {
            let record = load_record(&file)?;
            let store = open_store().await?;
            let mut reconciler = ProspectReconciler::new(store, config, ReconcileOptions::from_env());
            let candidates = reconciler.find_candidates(&source_id, &record).await?;
            println!("{}", serde_json::to_string_pretty(&candidates)?);
        }
        Commands::Migrate => {
            let url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set to migrate")?;
            let store = PgProspectStore::connect(&url).await?;
            store.migrate().await?;
            info!("migrations applied");
        }
    }

    Ok(())
}

async fn open_store() -> Result<Arc<dyn ProspectStore>> {
    match std::env::var("DATABASE_URL") {
        Ok(url) if !url.trim().is_empty() => {
            let store = PgProspectStore::connect(&url)
                .await
                .context("connecting to DATABASE_URL")?;
            Ok(Arc::new(store))
        }
        _ => {
            warn!("DATABASE_URL not set; using an empty in-memory store");
            Ok(Arc::new(MemoryProspectStore::new()))
        }
    }
}

fn apply_flags(mut options: ReconcileOptions, no_smart_matching: bool, no_preserve_ai_data: bool) -> ReconcileOptions {
    if no_smart_matching {
        options.enable_smart_matching = false;
    }
    if no_preserve_ai_data {
        options.preserve_ai_data = false;
    }
    options
}

fn load_batch(path: &Path) -> Result<Vec<IncomingRecord>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    if !value.is_array() {
        bail!("{} must contain a JSON array of records", path.display());
    }
    serde_json::from_value(value).with_context(|| format!("decoding records in {}", path.display()))
}

fn load_record(path: &Path) -> Result<IncomingRecord> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("decoding record in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_batch_reads_records_and_keeps_unknown_keys() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"[{{"native_id":"X","title":"Software Engineer","naics":"541512","set_aside":"8a"}},{{"title":"Janitorial services"}}]"#
        )
        .expect("write");

        let records = load_batch(file.path()).expect("load");

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].protected.naics.as_deref(), Some("541512"));
        assert_eq!(records[0].extra.get("set_aside"), Some(&serde_json::json!("8a")));
        assert_eq!(records[1].native_id, None);
    }

    #[test]
    fn load_batch_rejects_a_single_object() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, r#"{{"title":"Software Engineer"}}"#).expect("write");
        assert!(load_batch(file.path()).is_err());
        assert!(load_record(file.path()).is_ok());
    }

    #[test]
    fn flags_only_turn_options_off() {
        let defaults = ReconcileOptions::default();
        assert_eq!(apply_flags(defaults, false, false), defaults);
        let off = apply_flags(defaults, true, true);
        assert!(!off.enable_smart_matching);
        assert!(!off.preserve_ai_data);
    }

    #[test]
    fn cli_parses_import_flags() {
        let cli = Cli::try_parse_from([
            "prospect-cli",
            "import",
            "--source-id",
            "sam_gov",
            "--file",
            "batch.json",
            "--no-smart-matching",
        ])
        .expect("parse");
        match cli.command {
            Commands::Import {
                source_id,
                no_smart_matching,
                no_preserve_ai_data,
                ..
            } => {
                assert_eq!(source_id, "sam_gov");
                assert!(no_smart_matching);
                assert!(!no_preserve_ai_data);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
