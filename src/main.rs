use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};

use hive::HiveError;
use hive::db::DEFAULT_WAL_THRESHOLD_MB;
use hive::embedding::{EmbeddingClient, EmbeddingConfig};
use hive::memory::MemoryStore;
use hive::server::{DEFAULT_PORT, ServerConfig, StreamServer};
use hive::session::indexer::{SessionIndexer, file_mtime_secs};
use hive::session::viewer;
use hive::store::HiveStore;
use hive::sync::merge::{MergeOptions, merge_3way};
use hive::sync::{ExportOptions, ImportOptions, export_beads, flush, import_beads};

#[derive(Parser)]
#[command(
    name = "hive",
    version,
    about = "Coordination substrate for fleets of AI coding agents"
)]
struct Cli {
    /// Database file (defaults to <repo>/.hive/hive.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Project key (defaults to the current directory's absolute path)
    #[arg(long, global = true)]
    project: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the durable event stream over HTTP/SSE
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// Export beads as canonical JSONL to stdout
    Export {
        /// Leave out soft-deleted beads instead of exporting tombstones
        #[arg(long)]
        skip_deleted: bool,
    },
    /// Import beads from a JSONL file
    Import {
        file: PathBuf,
        #[arg(long)]
        skip_existing: bool,
    },
    /// 3-way merge of JSONL exports (usable as a git merge driver)
    Merge {
        base: PathBuf,
        ours: PathBuf,
        theirs: PathBuf,
        /// Resolve conflicts by the newer-updated_at policy instead of failing
        #[arg(long)]
        resolve: bool,
        /// Write the merged result here (defaults to overwriting OURS)
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Flush dirty projections to the .hive/*.jsonl sync files
    Flush {
        /// Directory holding the sync files (defaults to <repo>/.hive)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Rebuild projections from the event log
    Replay {
        /// Truncate projections for the project before re-applying
        #[arg(long)]
        clear_views: bool,
    },
    /// Index agent session transcripts into the memory store
    Index {
        /// Transcript files to index
        paths: Vec<PathBuf>,
        /// Re-index even when the file is not stale
        #[arg(long)]
        force: bool,
    },
    /// Show a transcript line with surrounding context
    View {
        path: PathBuf,
        #[arg(long)]
        line: usize,
        #[arg(long, default_value_t = viewer::DEFAULT_CONTEXT)]
        context: usize,
    },
    /// Database, WAL, and embedder health
    Doctor,
}

fn repo_root() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn open_store(cli: &Cli) -> hive::Result<HiveStore> {
    match &cli.db {
        Some(path) => HiveStore::open(path),
        None => HiveStore::from_repo(&repo_root()),
    }
}

fn project_key(cli: &Cli) -> String {
    cli.project
        .clone()
        .unwrap_or_else(|| repo_root().to_string_lossy().to_string())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hive=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!(
            "{}",
            serde_json::json!({
                "error": {
                    "code": err.code(),
                    "message": err.to_string(),
                    "retryable": err.retryable(),
                }
            })
        );
        let exit = match &err {
            HiveError::NotFound { .. } | HiveError::OutOfRange { .. } => 3,
            HiveError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => 3,
            _ => 1,
        };
        std::process::exit(exit);
    }
}

async fn run(cli: Cli) -> hive::Result<()> {
    match &cli.command {
        Commands::Serve { host, port } => {
            let store = Arc::new(Mutex::new(open_store(&cli)?));
            let addr: SocketAddr = format!("{host}:{port}")
                .parse()
                .map_err(|err| HiveError::Schema(format!("bad listen address: {err}")))?;
            let mut server = StreamServer::bind(store, addr, ServerConfig::default()).await?;
            println!("listening on http://{}", server.local_addr());
            tokio::signal::ctrl_c().await?;
            server.stop().await;
            Ok(())
        }
        Commands::Export { skip_deleted } => {
            let store = open_store(&cli)?;
            let jsonl = export_beads(
                &store,
                &project_key(&cli),
                ExportOptions {
                    skip_deleted: *skip_deleted,
                },
            )?;
            print!("{jsonl}");
            Ok(())
        }
        Commands::Import {
            file,
            skip_existing,
        } => {
            let store = open_store(&cli)?;
            let jsonl = std::fs::read_to_string(file)?;
            let summary = import_beads(
                &store,
                &project_key(&cli),
                &jsonl,
                ImportOptions {
                    skip_existing: *skip_existing,
                    ..Default::default()
                },
            )?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::Merge {
            base,
            ours,
            theirs,
            resolve,
            output,
        } => {
            let outcome = merge_3way(
                &std::fs::read_to_string(base)?,
                &std::fs::read_to_string(ours)?,
                &std::fs::read_to_string(theirs)?,
                MergeOptions {
                    resolve_conflicts: *resolve,
                    ..Default::default()
                },
            )?;
            let target = output.clone().unwrap_or_else(|| ours.clone());
            std::fs::write(&target, &outcome.merged)?;
            if !outcome.conflicts.is_empty() {
                eprintln!("{}", serde_json::to_string_pretty(&outcome.conflicts)?);
                return Err(HiveError::Conflict(format!(
                    "{} records need manual resolution",
                    outcome.conflicts.len()
                )));
            }
            Ok(())
        }
        Commands::Flush { dir } => {
            let store = open_store(&cli)?;
            let hive_dir = dir.clone().unwrap_or_else(|| repo_root().join(".hive"));
            let report = flush::flush_once(&store, &project_key(&cli), &hive_dir)?;
            println!(
                "flushed {} beads through sequence {}",
                report.beads_flushed, report.flushed_sequence
            );
            Ok(())
        }
        Commands::Replay { clear_views } => {
            let store = open_store(&cli)?;
            let replayed = store.replay(&project_key(&cli), *clear_views)?;
            println!("replayed {replayed} events");
            Ok(())
        }
        Commands::Index { paths, force } => {
            let store = open_store(&cli)?;
            let client = EmbeddingClient::new(EmbeddingConfig::default())?;
            let indexer = SessionIndexer::new(store.database());
            for path in paths {
                let mtime = file_mtime_secs(path)?;
                if !force && !indexer.is_stale(&path.to_string_lossy(), mtime)? {
                    println!("{}: fresh, skipped", path.display());
                    continue;
                }
                let report = indexer.index_file(&client, path).await?;
                println!(
                    "{}: {} messages, {} embedded{}",
                    path.display(),
                    report.indexed,
                    report.embedded,
                    if report.skipped { " (no agent pattern)" } else { "" }
                );
            }
            Ok(())
        }
        Commands::View {
            path,
            line,
            context,
        } => {
            print!("{}", viewer::view(path, *line, *context)?);
            Ok(())
        }
        Commands::Doctor => {
            let store = open_store(&cli)?;
            let db = store.database();
            db.quick_check()?;
            let wal = db.check_wal_health(DEFAULT_WAL_THRESHOLD_MB)?;
            let memories = MemoryStore::new(db);
            let stats = memories.stats()?;
            let client = EmbeddingClient::new(EmbeddingConfig::default())?;
            let embedder = client.check_health().await;
            let events: i64 = db
                .conn()
                .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
                .map_err(HiveError::from)?;
            let beads: i64 = db
                .conn()
                .query_row("SELECT COUNT(*) FROM beads", [], |row| row.get(0))
                .map_err(HiveError::from)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "integrity": "ok",
                    "wal": wal,
                    "events": events,
                    "beads": beads,
                    "memories": stats,
                    "embedder": embedder,
                }))?
            );
            Ok(())
        }
    }
}
