//! `movor`: resumable file uploads from the command line.

mod progress;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use movor_session::{Session, SessionConfig, TaskHandle, UploadState};
use movor_store::ChunkStore;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use progress::ProgressPrinter;

const CONFIG_FILE: &str = "config.json";

#[derive(Parser)]
#[command(name = "movor")]
#[command(version, about = "Resumable chunked uploads over tus", long_about = None)]
struct Cli {
    /// Upload endpoint, e.g. https://tus.example/files/
    #[arg(short = 'e', long, value_name = "URL", global = true)]
    endpoint: Option<String>,

    /// Session configuration file (JSON)
    #[arg(short = 'c', long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Storage root holding the upload store
    #[arg(short = 's', long = "store", value_name = "DIR", global = true)]
    store: Option<PathBuf>,

    /// Chunk size in KiB (overrides the config file)
    #[arg(long, value_name = "KIB", global = true)]
    chunk_size: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload one or more files
    Upload {
        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,
    },
    /// Resume every unfinished upload
    Resume,
    /// List persisted uploads
    List,
    /// Cancel one upload, or all of them
    Cancel {
        #[arg(value_name = "ID")]
        id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,movor=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = load_config(&cli)?;

    match &cli.command {
        Command::List => list(&config),
        Command::Upload { files } => {
            let session = start(&cli, config).await?;
            let mut handles = Vec::with_capacity(files.len());
            for file in files {
                let handle = session
                    .upload(file)
                    .await
                    .with_context(|| format!("cannot upload {}", file.display()))?;
                println!("{}  {}", handle.upload_id(), file.display());
                handles.push(handle);
            }
            wait(&session, handles).await
        }
        Command::Resume => {
            let session = start(&cli, config).await?;
            let resumed = session.resume_all().await?;
            if resumed == 0 {
                println!("nothing to resume");
                return Ok(ExitCode::SUCCESS);
            }
            let handles = session.tasks().await;
            wait(&session, handles).await
        }
        Command::Cancel { id } => {
            let session = start(&cli, config).await?;
            match id {
                Some(id) => {
                    session.cancel(id).await?;
                    println!("cancelled {id}");
                }
                None => {
                    let n = session.cancel_all().await;
                    println!("cancelled {n} upload(s)");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<SessionConfig> {
    let path = cli
        .config
        .clone()
        .or_else(|| movor_store::default_storage_root().map(|root| root.join(CONFIG_FILE)));
    let mut config = match path {
        Some(path) => SessionConfig::load(&path)?,
        None => SessionConfig::default(),
    };
    if let Some(store) = &cli.store {
        config.storage_root = Some(store.clone());
    }
    if let Some(kib) = cli.chunk_size {
        config.chunk_size = kib
            .checked_mul(1024)
            .with_context(|| format!("--chunk-size {kib} KiB is too large"))?;
    }
    Ok(config)
}

async fn start(cli: &Cli, config: SessionConfig) -> anyhow::Result<Session> {
    let Some(endpoint) = &cli.endpoint else {
        bail!("--endpoint is required for this command");
    };
    let session = Session::new(Arc::new(ProgressPrinter::default()));
    session
        .start(endpoint, config)
        .await
        .context("cannot start upload session")?;
    Ok(session)
}

/// Waits for every upload to stop. Ctrl-C pauses them so a later
/// `movor resume` continues where they left off.
async fn wait(session: &Session, handles: Vec<TaskHandle>) -> anyhow::Result<ExitCode> {
    let all = async {
        let mut failed = 0usize;
        for handle in &handles {
            if handle.wait().await == UploadState::Failed {
                failed += 1;
            }
        }
        failed
    };

    tokio::select! {
        failed = all => {
            if failed > 0 {
                eprintln!("{failed} upload(s) failed; run `movor resume` to retry");
                return Ok(ExitCode::FAILURE);
            }
            Ok(ExitCode::SUCCESS)
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, pausing uploads");
            if !session.stop_all().await {
                warn!("some uploads could not persist their progress");
            }
            eprintln!("paused; run `movor resume` to continue");
            Ok(ExitCode::from(130))
        }
    }
}

fn list(config: &SessionConfig) -> anyhow::Result<ExitCode> {
    let root = config
        .resolved_storage_root()
        .context("no storage location; pass --store")?;
    let store = ChunkStore::open(&root)?;

    let records = store.list_all()?;
    if records.is_empty() {
        println!("no uploads in {}", store.dir().display());
        return Ok(ExitCode::SUCCESS);
    }
    for entry in records {
        match entry {
            Ok(r) => println!(
                "{}  {:<9} {:>6.1}%  {}/{}  {}",
                r.upload_id,
                r.state().to_string(),
                r.progress() * 100.0,
                r.bytes_confirmed(),
                r.total_bytes,
                r.local_file_path.display()
            ),
            Err(e) => eprintln!("unreadable: {e}"),
        }
    }
    Ok(ExitCode::SUCCESS)
}
