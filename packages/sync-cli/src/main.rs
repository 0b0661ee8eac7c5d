//! Demo client for the offline sync engine: create and edit documents,
//! trigger sync rounds, and inspect sync/tile-cache status from a terminal.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sync_core::{DocumentKind, Value};
use sync_engine::{EngineConfig, SyncEngine};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sync-cli", about = "Offline sync engine demo client")]
struct Cli {
    /// Loads engine configuration from a TOML file instead of the flags
    /// below (`SYNC_`-prefixed environment variables still override it).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Identifies this replica in HLC timestamps and sync requests.
    #[arg(long, default_value = "cli-node")]
    node_id: String,

    /// Path to the local `redb` database file.
    #[arg(long, default_value = "./sync-cli.redb")]
    db_path: String,

    /// Sync server endpoint the default HTTP transport posts to.
    #[arg(long, default_value = "http://127.0.0.1:8080/sync")]
    sync_endpoint: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Creates a new document.
    Create {
        doc_id: String,
        #[arg(long, value_enum, default_value = "map")]
        kind: CliDocumentKind,
        /// Initial fields as `key=value` pairs (map documents only).
        #[arg(long = "field")]
        fields: Vec<String>,
    },
    /// Sets one field on an existing map document.
    Edit { doc_id: String, path: String, value: String },
    /// Triggers a sync round: all pending documents, or one if `doc_id` is given.
    Sync { doc_id: Option<String> },
    /// Prints a document's sync metadata, or every document's pending conflicts.
    Status { doc_id: Option<String> },
    #[command(subcommand)]
    Tiles(TilesCommand),
}

#[derive(Subcommand)]
enum TilesCommand {
    /// Prints tile cache occupancy.
    Stats,
}

#[derive(Clone, clap::ValueEnum)]
enum CliDocumentKind {
    Map,
    List,
    Text,
}

impl From<CliDocumentKind> for DocumentKind {
    fn from(kind: CliDocumentKind) -> Self {
        match kind {
            CliDocumentKind::Map => DocumentKind::Map,
            CliDocumentKind::List => DocumentKind::List,
            CliDocumentKind::Text => DocumentKind::Text,
        }
    }
}

fn parse_field(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw.split_once('=').with_context(|| format!("field '{raw}' is not in key=value form"))?;
    Ok((key.to_string(), parse_value(value)))
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .map(json_to_value)
        .unwrap_or_else(|| Value::String(raw.to_string()))
}

fn json_to_value(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => Value::String(s),
        serde_json::Value::Array(items) => Value::Array(items.into_iter().map(json_to_value).collect()),
        serde_json::Value::Object(map) => {
            Value::Map(map.into_iter().map(|(k, v)| (k, json_to_value(v))).collect::<BTreeMap<_, _>>())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path).context("failed to load --config file")?,
        None => EngineConfig::new(cli.node_id, cli.db_path, cli.sync_endpoint),
    };

    let engine = SyncEngine::open(config).await.context("failed to open sync engine")?;

    match cli.command {
        Command::Create { doc_id, kind, fields } => {
            let parsed_fields = fields.iter().map(|f| parse_field(f)).collect::<Result<Vec<_>>>()?;
            engine.create_document(&doc_id, kind.into(), Some(parsed_fields)).await?;
            println!("created '{doc_id}'");
        }
        Command::Edit { doc_id, path, value } => {
            let value = parse_value(&value);
            engine.edit_document(&doc_id, |doc| doc.set_at_path(&path, value)).await?;
            println!("updated '{doc_id}'.{path}");
        }
        Command::Sync { doc_id } => match doc_id {
            Some(doc_id) => {
                engine.sync_document(&doc_id).await?;
                println!("synced '{doc_id}'");
            }
            None => {
                engine.sync_now().await;
                println!("sync round complete");
            }
        },
        Command::Status { doc_id } => match doc_id {
            Some(doc_id) => {
                let metadata = engine.documents.get_metadata(&doc_id).await?;
                println!("{metadata:#?}");
                let conflicts = engine.conflicts.get_by_doc(&doc_id);
                if !conflicts.is_empty() {
                    println!("{} pending conflict(s)", conflicts.len());
                }
            }
            None => {
                let pending = engine.conflicts.get_pending();
                println!("{} pending conflict(s) across all documents", pending.len());
            }
        },
        Command::Tiles(TilesCommand::Stats) => {
            println!("{} tiles cached, {} bytes", engine.tiles.len(), engine.tiles.total_bytes());
        }
    }

    Ok(())
}
