//! VaultGraph CLI - Command-line interface
//!
//! Usage:
//!   vaultgraph build <chunks.jsonl> [--resume [path] | --fresh] [--no-skip] [--concurrency N]
//!   vaultgraph retry-failed [--failed path] [--use-retry-model]
//!   vaultgraph neighborhood <name>
//!   vaultgraph paths <source> <target> [--max-depth N]
//!   vaultgraph stats [--top N]
//!   vaultgraph context <question>
//!   vaultgraph ask <question>
//!   vaultgraph export [--output path]
//!   vaultgraph checkpoints

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use vg_builder::{CheckpointStore, GraphBuilder};
use vg_core::{AppConfig, Chunk, ExtractionStats, LoggingConfig};
use vg_extractor::{create_llm_client, ExtractionClient};
use vg_graph::{GraphQuerier, GraphStore, QueryEngine, VisualizationExport};

#[derive(Parser)]
#[command(name = "vaultgraph")]
#[command(about = "Build and query a knowledge graph from personal notes")]
#[command(version)]
struct Cli {
    /// TOML configuration file (environment variables still override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Graph snapshot to query (defaults to the saved graph, then the latest checkpoint)
    #[arg(long, global = true)]
    graph: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract entities and relationships from a JSON Lines chunk file
    Build {
        /// One `{"text": ..., "metadata": {...}}` object per line
        chunks: PathBuf,
        /// Resume from this snapshot (by default the newest of the saved graph
        /// and the checkpoints is resumed)
        #[arg(long, num_args = 0..=1)]
        resume: Option<Option<PathBuf>>,
        /// Start from an empty graph, replacing any saved one
        #[arg(long, conflicts_with = "resume")]
        fresh: bool,
        /// Re-extract chunks even if they were processed before
        #[arg(long)]
        no_skip: bool,
        /// Extraction requests in flight
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Re-run chunks recorded in the failed-chunk file
    RetryFailed {
        /// Failed-chunk file (defaults to failed_chunks.json in the data directory)
        #[arg(long)]
        failed: Option<PathBuf>,
        /// Use the configured retry model instead of the extraction model
        #[arg(long)]
        use_retry_model: bool,
    },
    /// Show an entity and its direct relationships
    Neighborhood {
        name: String,
    },
    /// Find paths between two entities
    Paths {
        source: String,
        target: String,
        #[arg(long)]
        max_depth: Option<usize>,
    },
    /// Graph size, density and most connected entities
    Stats {
        #[arg(long)]
        top: Option<usize>,
    },
    /// Print the graph context that would accompany a question
    Context {
        question: String,
    },
    /// Answer a question using the graph and the configured model
    Ask {
        question: String,
    },
    /// Write the visualization JSON
    Export {
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// List checkpoints in the data directory
    Checkpoints,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Build {
            chunks,
            resume,
            fresh,
            no_skip,
            concurrency,
        } => {
            let mut storage = config.storage.clone();
            if no_skip {
                storage.skip_processed = false;
            }
            if let Some(n) = concurrency {
                storage.concurrency = n.max(1);
            }

            let client = extraction_client(&config, &config.llm.model)?;
            let mut builder = GraphBuilder::new(client, storage);
            match (fresh, resume) {
                (_, Some(Some(path))) => builder.resume_from(&path)?,
                (true, _) => warn_before_fresh(builder.checkpoint_store())?,
                (false, _) => {
                    builder.resume_latest()?;
                }
            }

            let chunks = load_chunks(&chunks)?;
            let cancel = cancel_on_ctrl_c();
            let report = builder.build(&chunks, &cancel).await?;
            persist(&builder);
            print_json(&report)?;
        }
        Commands::RetryFailed {
            failed,
            use_retry_model,
        } => {
            let model = if use_retry_model {
                &config.llm.retry_model
            } else {
                &config.llm.model
            };
            let client = extraction_client(&config, model)?;
            let mut builder = GraphBuilder::new(client, config.storage.clone());
            if let Some(path) = snapshot_path(&config, cli.graph.as_deref())? {
                builder.resume_from(&path)?;
            }

            let failed = builder.checkpoint_store().load_failed(failed.as_deref())?;
            if failed.is_empty() {
                println!("No failed chunks to retry");
                return Ok(());
            }

            let cancel = cancel_on_ctrl_c();
            let report = builder.retry_failed(&failed, &cancel).await?;
            persist(&builder);
            print_json(&report)?;
        }
        Commands::Neighborhood { name } => {
            let (store, _) = load_graph(&config, cli.graph.as_deref())?;
            let engine = QueryEngine::new(&store).with_config(config.query.clone());
            print_json(&engine.neighborhood(&name))?;
        }
        Commands::Paths {
            source,
            target,
            max_depth,
        } => {
            let (store, _) = load_graph(&config, cli.graph.as_deref())?;
            let engine = QueryEngine::new(&store).with_config(config.query.clone());
            let paths = engine.paths(&source, &target, max_depth.unwrap_or(config.query.max_depth));
            if paths.is_empty() {
                println!("No paths found between '{source}' and '{target}'");
            }
            for path in paths {
                println!("{}", path.join(" -> "));
            }
        }
        Commands::Stats { top } => {
            let (store, _) = load_graph(&config, cli.graph.as_deref())?;
            let engine = QueryEngine::new(&store).with_config(config.query.clone());
            print_json(&engine.stats(top.unwrap_or(config.query.top_k)))?;
        }
        Commands::Context { question } => {
            let (store, _) = load_graph(&config, cli.graph.as_deref())?;
            let engine = QueryEngine::new(&store).with_config(config.query.clone());
            println!(
                "{}",
                engine.context_for_question(&question, config.query.max_context_entities)
            );
        }
        Commands::Ask { question } => {
            let (store, _) = load_graph(&config, cli.graph.as_deref())?;
            config.validate()?;
            let llm = create_llm_client(&config.llm)?;
            let querier =
                GraphQuerier::new(llm, &config.llm.model).with_config(config.query.clone());
            println!("{}", querier.answer(&store, &question).await?);
        }
        Commands::Export { output } => {
            let (store, stats) = load_graph(&config, cli.graph.as_deref())?;
            let checkpoints = CheckpointStore::new(&config.storage.root);
            let path = output.map_or_else(
                || checkpoints.export_path(),
                |p| checkpoints.resolve(&p),
            );
            checkpoints.save_export(&path, &VisualizationExport::from_store(&store, stats))?;
            println!("Exported to {}", path.display());
        }
        Commands::Checkpoints => {
            let checkpoints = CheckpointStore::new(&config.storage.root).list_checkpoints()?;
            if checkpoints.is_empty() {
                println!("No checkpoints in {}", config.storage.root.display());
            }
            for info in checkpoints {
                let modified = info
                    .modified
                    .map(|t| chrono::DateTime::<chrono::Local>::from(t).to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!("{:>8}  {}  {}", info.chunk_count, modified, info.path.display());
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::from_file(path)?.with_env_override()?,
        None => AppConfig::from_env()?,
    };
    Ok(config)
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &logging.level;
        EnvFilter::new(format!(
            "vaultgraph={level},vg_builder={level},vg_extractor={level},vg_graph={level}"
        ))
    });

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json_format {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn extraction_client(config: &AppConfig, model: &str) -> anyhow::Result<ExtractionClient> {
    config.validate()?;
    let llm = create_llm_client(&config.llm)?;
    Ok(ExtractionClient::new(llm, model, config.extraction.clone())
        .with_timeout(config.llm.timeout()))
}

/// Cancel the returned token on the first Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after in-flight chunks");
            token.cancel();
        }
    });
    cancel
}

fn load_chunks(path: &Path) -> anyhow::Result<Vec<Chunk>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read chunk file {}", path.display()))?;
    parse_chunks(&content).with_context(|| format!("invalid chunk file {}", path.display()))
}

fn parse_chunks(content: &str) -> anyhow::Result<Vec<Chunk>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str::<Chunk>(line).with_context(|| format!("line {}", n + 1))
        })
        .collect()
}

/// Explicit `--graph`, else the newest of the saved graph and the checkpoints
fn snapshot_path(config: &AppConfig, graph: Option<&Path>) -> anyhow::Result<Option<PathBuf>> {
    let checkpoints = CheckpointStore::new(&config.storage.root);
    if let Some(path) = graph {
        return Ok(Some(checkpoints.resolve(path)));
    }
    Ok(checkpoints.latest_snapshot()?)
}

/// `--fresh` replaces earlier results; say so before any of them are overwritten
fn warn_before_fresh(checkpoints: &CheckpointStore) -> anyhow::Result<()> {
    if let Some(previous) = checkpoints.latest_snapshot()? {
        tracing::warn!(
            previous = %previous.display(),
            "starting a fresh graph; the saved graph and same-numbered checkpoints will be replaced"
        );
    }
    Ok(())
}

fn load_graph(
    config: &AppConfig,
    graph: Option<&Path>,
) -> anyhow::Result<(GraphStore, ExtractionStats)> {
    let Some(path) = snapshot_path(config, graph)? else {
        bail!(
            "no graph found in {}; run `vaultgraph build` first",
            config.storage.root.display()
        );
    };
    let snapshot = CheckpointStore::new(&config.storage.root).load_snapshot(&path)?;
    let store = GraphStore::from_snapshot(snapshot.graph)?;
    tracing::debug!(path = %path.display(), nodes = store.node_count(), "graph loaded");
    Ok((store, snapshot.stats))
}

/// Save the graph and export; failures only warn since the report still prints
fn persist(builder: &GraphBuilder) {
    if let Err(e) = builder.save_graph(None) {
        tracing::warn!(error = %e, "could not save graph");
    }
    if let Err(e) = builder.export_json(None) {
        tracing::warn!(error = %e, "could not export graph");
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_optional_resume() {
        let cli = Cli::parse_from(["vaultgraph", "build", "chunks.jsonl", "--resume"]);
        match cli.command {
            Commands::Build { resume, .. } => assert_eq!(resume, Some(None)),
            _ => panic!("expected build"),
        }

        let cli = Cli::parse_from(["vaultgraph", "build", "c.jsonl", "--resume", "cp.json"]);
        match cli.command {
            Commands::Build { resume, .. } => {
                assert_eq!(resume, Some(Some(PathBuf::from("cp.json"))))
            }
            _ => panic!("expected build"),
        }
    }

    #[test]
    fn test_cli_fresh_conflicts_with_resume() {
        let cli = Cli::parse_from(["vaultgraph", "build", "c.jsonl", "--fresh"]);
        match cli.command {
            Commands::Build { fresh, resume, .. } => {
                assert!(fresh);
                assert_eq!(resume, None);
            }
            _ => panic!("expected build"),
        }

        assert!(Cli::try_parse_from(["vaultgraph", "build", "c.jsonl", "--fresh", "--resume"]).is_err());
    }

    #[test]
    fn test_snapshot_path_prefers_saved_graph() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            storage: vg_core::StorageConfig {
                root: dir.path().to_path_buf(),
                ..Default::default()
            },
            ..Default::default()
        };
        let checkpoints = CheckpointStore::new(dir.path());
        std::fs::write(checkpoints.checkpoint_path(10), "{}").unwrap();
        std::fs::write(checkpoints.graph_path(), "{}").unwrap();

        assert_eq!(
            snapshot_path(&config, None).unwrap(),
            Some(checkpoints.graph_path())
        );
    }

    #[test]
    fn test_parse_chunks_skips_blank_lines() {
        let content = "{\"text\": \"a\", \"metadata\": {\"filename\": \"a.md\", \"chunk_id\": 1}}\n\n{\"text\": \"b\"}\n";
        let chunks = parse_chunks(content).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].metadata.chunk_id, "1");
        assert_eq!(chunks[1].metadata.filename, "");
    }

    #[test]
    fn test_parse_chunks_reports_line() {
        let err = parse_chunks("{\"text\": \"a\"}\nnot json\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_missing_graph_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            storage: vg_core::StorageConfig {
                root: dir.path().to_path_buf(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(load_graph(&config, None).is_err());
    }
}
