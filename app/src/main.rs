mod bootstrap;
mod server;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use scrivener_rag::error::RagError;
use scrivener_rag::processing::UserMetadata;
use scrivener_rag::types::{DocType, Outcome};
use scrivener_rag::RagConfig;

// sysexits-style codes plus 130 for interrupt.
const EXIT_OK: u8 = 0;
const EXIT_BAD_INPUT: u8 = 64;
const EXIT_UNAVAILABLE: u8 = 69;
const EXIT_INTERNAL: u8 = 70;
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(name = "scrivener", about = "Grounded-writing RAG service", version)]
struct Cli {
    /// Path to a JSON config file. Defaults are used when absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the service (HTTP surface + background rebuild).
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 8600)]
        port: u16,
    },
    /// Batch-ingest a file or directory of documents.
    Ingest {
        path: PathBuf,
        /// Document type applied to every file (filename hints fill in
        /// when omitted).
        #[arg(long)]
        doc_type: Option<String>,
        #[arg(long)]
        year: Option<i32>,
        /// Program names; repeatable.
        #[arg(long = "program")]
        programs: Vec<String>,
        /// Free-form tags; repeatable.
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        outcome: Option<String>,
        /// Confirms the sensitivity review for every ingested file.
        #[arg(long)]
        confirm_sensitivity: bool,
    },
    /// Ask a running service to rebuild the keyword index from the
    /// vector index.
    Reindex {
        #[arg(long, default_value = "http://127.0.0.1:8600")]
        addr: String,
    },
    /// Ask a running service to clear its query cache.
    CacheFlush {
        #[arg(long, default_value = "http://127.0.0.1:8600")]
        addr: String,
    },
    /// Ensure the metadata store schema.
    Migrate,
}

fn exit_code_for(err: &RagError) -> u8 {
    match err.kind() {
        "validation_error" | "not_found" | "conflict" => EXIT_BAD_INPUT,
        "dependency_unavailable" | "transient" => EXIT_UNAVAILABLE,
        "cancelled" => EXIT_CANCELLED,
        _ => EXIT_INTERNAL,
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<RagConfig, u8> {
    match path {
        Some(path) => RagConfig::from_file(path).map_err(|e| {
            eprintln!("config error: {}", e);
            EXIT_BAD_INPUT
        }),
        None => Ok(RagConfig::default()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match load_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(code) => return ExitCode::from(code),
    };

    let result = match cli.command {
        Command::Serve { host, port } => run_serve(config, &host, port).await,
        Command::Ingest {
            path,
            doc_type,
            year,
            programs,
            tags,
            outcome,
            confirm_sensitivity,
        } => {
            run_ingest(
                config,
                &path,
                doc_type,
                year,
                programs,
                tags,
                outcome,
                confirm_sensitivity,
            )
            .await
        }
        Command::Reindex { addr } => admin_post(&addr, "/api/reindex").await,
        Command::CacheFlush { addr } => admin_post(&addr, "/api/cache/flush").await,
        Command::Migrate => run_migrate(config).await,
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(err) => {
            eprintln!("error: {}", err);
            ExitCode::from(exit_code_for(&err))
        }
    }
}

async fn run_serve(config: RagConfig, host: &str, port: u16) -> Result<(), RagError> {
    let state = bootstrap::build(config).await?;
    tracing::info!(data_dir = %state.config.data_dir.display(), "service state ready");

    // Cold start: the keyword index rebuilds from the vector index
    // before the service accepts queries.
    let indexed = state.processor.rebuild_keyword_index().await?;
    tracing::info!(chunks = indexed, "keyword index ready");

    let addr = format!("{}:{}", host, port);
    tracing::info!(addr = %addr, "starting service");

    tokio::select! {
        result = server::serve(state, &addr) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            Err(RagError::cancelled("serve"))
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_ingest(
    config: RagConfig,
    path: &PathBuf,
    doc_type: Option<String>,
    year: Option<i32>,
    programs: Vec<String>,
    tags: Vec<String>,
    outcome: Option<String>,
    confirm_sensitivity: bool,
) -> Result<(), RagError> {
    if !confirm_sensitivity {
        return Err(RagError::validation_field(
            "confirm_sensitivity",
            "Batch ingest requires --confirm-sensitivity",
            "Review the files for sensitive content, then pass --confirm-sensitivity",
        ));
    }

    let doc_type = match doc_type.as_deref() {
        Some(raw) => Some(DocType::parse(raw).ok_or_else(|| {
            RagError::validation_field(
                "doc_type",
                format!("Unknown document type '{}'", raw),
                "Use one of: Grant Proposal, Annual Report, Program Description, Impact Report, Strategic Plan, Other",
            )
        })?),
        None => None,
    };
    let outcome = match outcome.as_deref() {
        Some(raw) => Some(Outcome::normalize(raw).ok_or_else(|| {
            RagError::validation_field(
                "outcome",
                format!("Unknown outcome '{}'", raw),
                "Use one of: Funded, Not Funded, Pending, Final Report",
            )
        })?),
        None => None,
    };

    let state = bootstrap::build(config).await?;

    let files: Vec<PathBuf> = if path.is_file() {
        vec![path.clone()]
    } else {
        walkdir::WalkDir::new(path)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase()).as_deref(),
                    Some("pdf") | Some("docx") | Some("txt") | Some("md")
                )
            })
            .collect()
    };

    if files.is_empty() {
        return Err(RagError::validation_field(
            "path",
            format!("No ingestable files under {}", path.display()),
            "Point at a PDF, DOCX, or text file, or a directory containing them",
        ));
    }

    let progress = indicatif::ProgressBar::new(files.len() as u64);
    let mut processed = 0usize;
    let mut failed = 0usize;

    for file in &files {
        let filename = file
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload")
            .to_string();
        let bytes = match std::fs::read(file) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(file = %file.display(), error = %e, "skipping unreadable file");
                failed += 1;
                progress.inc(1);
                continue;
            }
        };

        let metadata = UserMetadata {
            doc_type,
            year,
            programs: programs.clone(),
            tags: tags.clone(),
            outcome,
            notes: None,
            sensitivity_confirmed: true,
        };

        match state
            .processor
            .process_document(&bytes, &filename, &metadata, "cli")
            .await
        {
            Ok(done) => {
                processed += 1;
                for warning in &done.warnings {
                    tracing::warn!(file = %filename, warning = %warning, "ingest warning");
                }
            }
            Err(e) => {
                failed += 1;
                tracing::error!(file = %filename, error = %e, "ingest failed");
            }
        }
        progress.inc(1);
    }
    progress.finish_and_clear();

    println!("Ingested {} of {} file(s); {} failed", processed, files.len(), failed);
    if processed == 0 {
        return Err(RagError::internal("every file failed to ingest"));
    }
    Ok(())
}

/// The keyword index and query cache live inside the serving process,
/// so reindex and cache-flush are admin calls against it.
async fn admin_post(addr: &str, path: &str) -> Result<(), RagError> {
    let url = format!("{}{}", addr.trim_end_matches('/'), path);
    let response = reqwest::Client::new()
        .post(&url)
        .send()
        .await
        .map_err(|e| RagError::dependency("service", format!("{} unreachable: {}", url, e)))?;

    if !response.status().is_success() {
        return Err(RagError::dependency(
            "service",
            format!("{} returned {}", url, response.status()),
        ));
    }
    let body = response.text().await.unwrap_or_default();
    if !body.is_empty() {
        println!("{}", body.trim_end());
    }
    Ok(())
}

async fn run_migrate(config: RagConfig) -> Result<(), RagError> {
    let url = config.database_url();
    std::fs::create_dir_all(&config.data_dir).ok();
    let store = scrivener_rag::storage::SqliteMetadataStore::connect(&url).await?;
    store.migrate().await?;
    println!("Metadata schema is current at {}", url);
    Ok(())
}
