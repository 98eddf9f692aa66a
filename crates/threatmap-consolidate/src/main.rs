//! CLI entry point for the threatmap consolidation engine.
//!
//! Reads observation batches (or raw scan results) from files or stdin,
//! consolidates them into the configured graph store, and writes one JSON
//! result per batch to stdout. Logs go to stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing_subscriber::{fmt, EnvFilter};

use threatmap_core::config::{AppConfig, StoreBackend};
use threatmap_core::types::{Direction, GraphSnapshot, PropertyMap};
use threatmap_core::SchemaRegistry;
use threatmap_graph::neo4j::schema_statements;
use threatmap_graph::{GraphClient, GraphStore, MemoryGraphStore, Neo4jGraphStore};

use threatmap_consolidate::scan::ScanReport;
use threatmap_consolidate::{ConsolidationEngine, GraphQuery, ObservationBatch};

#[derive(Parser)]
#[command(name = "threatmap")]
#[command(about = "Schema-driven consolidation of recon observations into a knowledge graph")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config file prefix (default: threatmap).
    #[arg(short, long, default_value = "threatmap", global = true)]
    config: String,

    /// Schema document, overriding `schema.path`.
    #[arg(long, global = true)]
    schema: Option<PathBuf>,

    /// Graph store, overriding `store.backend`.
    #[arg(long, value_enum, global = true)]
    backend: Option<BackendArg>,

    /// Snapshot file the memory backend is loaded from and saved to.
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    /// Log output format.
    #[arg(long, value_enum, default_value = "json", global = true)]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the schema and print the Neo4j constraints it implies.
    CheckSchema,
    /// Ingest observation files (or stdin when none are given).
    Ingest {
        files: Vec<PathBuf>,

        /// Input format: observation batches or raw scan results.
        #[arg(long, value_enum, default_value = "batch")]
        format: InputFormat,

        /// Producer name for scan results (defaults to the scan command).
        #[arg(long, default_value = "")]
        source: String,

        /// Write a snapshot of the graph here after ingesting.
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Dump the whole graph as JSON.
    Export {
        /// Output file (default: stdout).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Look up a node by natural key, with its edges and neighbors.
    Query {
        #[arg(long = "type")]
        node_type: String,

        /// Constraint field, as `field=value`. Repeat for composite keys.
        /// Values are parsed as JSON when possible (`number=443`).
        #[arg(long = "key", value_parser = parse_key_value, required = true)]
        key: Vec<(String, Value)>,

        #[arg(long)]
        label: Option<String>,

        #[arg(long, value_enum, default_value = "both")]
        direction: DirectionArg,
    },
    /// Print node counts per type and edge counts per label.
    Verify,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Memory,
    Neo4j,
}

#[derive(Clone, Copy, ValueEnum)]
enum InputFormat {
    Batch,
    Scan,
}

#[derive(Clone, Copy, ValueEnum)]
enum DirectionArg {
    Out,
    In,
    Both,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = AppConfig::load(&cli.config)?;
    if let Some(path) = &cli.schema {
        config.schema.path = path.display().to_string();
    }
    if let Some(backend) = cli.backend {
        config.store.backend = match backend {
            BackendArg::Memory => StoreBackend::Memory,
            BackendArg::Neo4j => StoreBackend::Neo4j,
        };
    }

    // A bad schema is fatal: nothing is ingested under a partial schema.
    let schema = SchemaRegistry::load_file(&config.schema.path)
        .with_context(|| format!("loading schema {}", config.schema.path))?;

    if let Command::CheckSchema = cli.command {
        let report = json!({
            "node_types": schema.node_types(),
            "relationships": schema.relationships(),
            "cypher": schema_statements(&schema),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let store = open_store(&config, &schema, cli.state.as_deref()).await?;
    let engine = ConsolidationEngine::new(schema, store.handle());

    match cli.command {
        Command::CheckSchema => {}
        Command::Ingest {
            files,
            format,
            source,
            export,
        } => {
            let failed = ingest_inputs(&engine, &config, files, format, &source).await?;
            store.persist().await?;
            if let Some(path) = export {
                let snapshot = engine.store().export().await?;
                write_json(&path, &snapshot)?;
                tracing::info!(path = %path.display(), nodes = snapshot.nodes.len(), "Graph exported");
            }
            if failed > 0 {
                anyhow::bail!("{failed} batch(es) still had storage failures after retries");
            }
        }
        Command::Export { output } => {
            let snapshot = engine.store().export().await?;
            match output {
                Some(path) => write_json(&path, &snapshot)?,
                None => println!("{}", serde_json::to_string_pretty(&snapshot)?),
            }
        }
        Command::Query {
            node_type,
            key,
            label,
            direction,
        } => {
            let key: PropertyMap = key.into_iter().collect();
            let direction = match direction {
                DirectionArg::Out => Direction::Outgoing,
                DirectionArg::In => Direction::Incoming,
                DirectionArg::Both => Direction::Both,
            };
            let query = GraphQuery::new(&engine);
            match query.neighborhood(&node_type, key, direction, label.as_deref()).await? {
                Some(hood) => println!("{}", serde_json::to_string_pretty(&hood)?),
                None => anyhow::bail!("No {node_type} node with that key"),
            }
        }
        Command::Verify => {
            let summary = GraphQuery::new(&engine).summary().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

// ── Store ────────────────────────────────────────────────────────

enum OpenStore {
    Memory {
        store: Arc<MemoryGraphStore>,
        state: Option<PathBuf>,
    },
    Neo4j(Arc<Neo4jGraphStore>),
}

impl OpenStore {
    fn handle(&self) -> Arc<dyn GraphStore> {
        match self {
            Self::Memory { store, .. } => store.clone(),
            Self::Neo4j(store) => store.clone(),
        }
    }

    /// Save the memory backend to its state file, if it has one.
    async fn persist(&self) -> anyhow::Result<()> {
        if let Self::Memory {
            store,
            state: Some(path),
        } = self
        {
            let snapshot = store.export().await?;
            write_json(path, &snapshot)?;
            tracing::info!(path = %path.display(), nodes = snapshot.nodes.len(), "State saved");
        }
        Ok(())
    }
}

async fn open_store(config: &AppConfig, schema: &SchemaRegistry, state: Option<&Path>) -> anyhow::Result<OpenStore> {
    match config.store.backend {
        StoreBackend::Memory => {
            let store = match state {
                Some(path) if path.exists() => {
                    let raw = std::fs::read_to_string(path)?;
                    let snapshot: GraphSnapshot = serde_json::from_str(&raw)
                        .with_context(|| format!("reading state {}", path.display()))?;
                    tracing::info!(path = %path.display(), nodes = snapshot.nodes.len(), "State loaded");
                    MemoryGraphStore::from_snapshot(snapshot)
                }
                _ => MemoryGraphStore::new(),
            };
            Ok(OpenStore::Memory {
                store: Arc::new(store),
                state: state.map(Path::to_path_buf),
            })
        }
        StoreBackend::Neo4j => {
            let client = GraphClient::connect(&config.neo4j).await?;
            let store = Neo4jGraphStore::new(client);
            store.ensure_schema(schema).await?;
            Ok(OpenStore::Neo4j(Arc::new(store)))
        }
    }
}

// ── Ingest ───────────────────────────────────────────────────────

/// Ingest every input concurrently, bounded by `ingest.max_concurrent_batches`.
/// Returns the number of batches left with storage failures.
async fn ingest_inputs(
    engine: &ConsolidationEngine,
    config: &AppConfig,
    files: Vec<PathBuf>,
    format: InputFormat,
    source: &str,
) -> anyhow::Result<usize> {
    let mut inputs = Vec::new();
    if files.is_empty() {
        inputs.push(("-".to_string(), std::io::read_to_string(std::io::stdin())?));
    } else {
        for path in files {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            inputs.push((path.display().to_string(), raw));
        }
    }

    let mut batches = Vec::new();
    for (name, raw) in inputs {
        let parsed = parse_batches(&raw, format, source).with_context(|| format!("parsing {name}"))?;
        tracing::info!(input = %name, batches = parsed.len(), "Input parsed");
        batches.extend(parsed);
    }

    let semaphore = Arc::new(Semaphore::new(config.ingest.max_concurrent_batches.max(1)));
    let attempts = config.ingest.storage_retries.max(1);
    let mut handles = Vec::with_capacity(batches.len());
    for batch in batches {
        let engine = engine.clone();
        let semaphore = semaphore.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await?;
            anyhow::Ok(engine.ingest_with_retry(batch, attempts).await)
        }));
    }

    let mut failed = 0;
    for handle in handles {
        let result = handle.await??;
        if result.has_storage_failures() {
            failed += 1;
        }
        println!("{}", serde_json::to_string(&result)?);
    }
    Ok(failed)
}

/// Parse one input: a single object or an array of them.
fn parse_batches(raw: &str, format: InputFormat, source: &str) -> anyhow::Result<Vec<ObservationBatch>> {
    let value: Value = serde_json::from_str(raw)?;
    let items = match value {
        Value::Array(items) => items,
        other => vec![other],
    };

    let observed_at = chrono::Utc::now();
    items
        .into_iter()
        .map(|item| -> anyhow::Result<ObservationBatch> {
            Ok(match format {
                InputFormat::Batch => serde_json::from_value(item)?,
                InputFormat::Scan => serde_json::from_value::<ScanReport>(item)?.to_batch(source, observed_at),
            })
        })
        .collect()
}

/// `field=value`, with the value parsed as JSON when it is valid JSON.
fn parse_key_value(raw: &str) -> Result<(String, Value), String> {
    let (field, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected field=value, got {raw}"))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((field.trim().to_string(), value))
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
