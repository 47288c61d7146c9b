//! fieldcache - warm, inspect and wipe the offline data caches.
//!
//! Every HTTP call goes through the network cache worker, so a run of this
//! binary exercises the same read path the field application uses.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::json;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fieldcache_core::cache::{PersistentRecord, FILES_NAMESPACE, SHEETS_NAMESPACE};
use fieldcache_core::error::FetchErrorKind;
use fieldcache_core::{
    Broadcast, Config, ControlMessage, DataServices, FetchError, FetchOptions, NetworkCacheWorker,
    PersistentStore, ReqwestTransport, Transport, WorkerHandle,
};

// ============================================================================
// Constants
// ============================================================================

/// How long a default run waits for the startup prefetch.
const PREFETCH_WAIT_MS: u64 = 5000;

/// How long `--wipe` waits for the worker to confirm.
const WIPE_WAIT_MS: u64 = 5000;

/// Subdirectory of the cache dir holding durable records.
const OFFLINE_DIR: &str = "offline";

const LOG_DIR: &str = "logs";

const USAGE: &str = "\
Usage: fieldcache [COMMAND]

Commands:
  (none)           Prefetch configured data and print cache status
  --sheet <name>   Fetch one sheet and print its rows
  --folder <id>    Print the files in one folder
  --saved          List the records saved for offline use and their age
  --wipe           Delete every cached record and worker bucket
  --help           Show this message";

enum Command {
    Prefetch,
    Sheet(String),
    Folder(String),
    Saved,
    Wipe,
    Help,
}

fn parse_command(args: &[String]) -> Result<Command> {
    let value = |flag: &str| {
        args.get(2)
            .cloned()
            .with_context(|| format!("{} requires a value\n\n{}", flag, USAGE))
    };
    match args.get(1).map(String::as_str) {
        None => Ok(Command::Prefetch),
        Some("--sheet") => Ok(Command::Sheet(value("--sheet")?)),
        Some("--folder") => Ok(Command::Folder(value("--folder")?)),
        Some("--saved") => Ok(Command::Saved),
        Some("--wipe") => Ok(Command::Wipe),
        Some("--help") | Some("-h") => Ok(Command::Help),
        Some(other) => bail!("Unknown argument: {}\n\n{}", other, USAGE),
    }
}

/// Initialize the tracing subscriber for logging.
///
/// Stderr gets `RUST_LOG` (default `warn`); a daily rolling file under the
/// cache dir gets the same filter. The returned guard flushes the file log
/// and must live as long as `main`.
fn init_tracing(cache_dir: &Path) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let log_dir = cache_dir.join(LOG_DIR);
    let (file_layer, guard) = match std::fs::create_dir_all(&log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(&log_dir, "fieldcache.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .init();
    guard
}

/// Turn a fetch failure into the message a user should see.
fn user_error(what: &str, e: FetchError) -> anyhow::Error {
    match e.kind() {
        FetchErrorKind::NotConfigured => anyhow::anyhow!(
            "{} is not configured: {}. Set the API keys in the config file or FIELDCACHE_* variables.",
            what,
            e
        ),
        FetchErrorKind::TemporarilyUnreachable => anyhow::anyhow!(
            "{} is temporarily unreachable and no saved copy exists: {}",
            what,
            e
        ),
        FetchErrorKind::Upstream => anyhow::Error::new(e).context(format!("Failed to load {}", what)),
    }
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().collect();
    let command = parse_command(&args)?;
    if let Command::Help = command {
        println!("{}", USAGE);
        return Ok(());
    }

    let mut config = Config::load()?;
    config.apply_env();
    let cache_dir = config.cache_dir().unwrap_or_else(|_| PathBuf::from("./cache"));

    let _log_guard = init_tracing(&cache_dir);
    info!("fieldcache starting");

    let network: Arc<dyn Transport> = Arc::new(ReqwestTransport::new()?);
    let worker = NetworkCacheWorker::spawn(config.worker.clone(), network)
        .context("Failed to start the network cache worker")?;
    let persistent = Arc::new(
        PersistentStore::new(cache_dir.join(OFFLINE_DIR)).with_quota(config.persistent_quota_bytes),
    );
    let services = DataServices::new(&config, Arc::new(worker.clone()), persistent)?;

    let result = match command {
        Command::Prefetch => run_prefetch(&config, &services, &worker).await,
        Command::Sheet(name) => run_sheet(&services, &name).await,
        Command::Folder(id) => run_folder(&services, &id).await,
        Command::Saved => run_saved(&services).await,
        Command::Wipe => run_wipe(&services, &worker).await,
        Command::Help => Ok(()),
    };

    // Let background revalidations land in both tiers before exiting
    services.settle().await;
    worker.settle().await;

    info!("fieldcache shutting down");
    result
}

async fn run_prefetch(config: &Config, services: &DataServices, worker: &WorkerHandle) -> Result<()> {
    let scheduler = services.prefetch_scheduler(config);
    scheduler.start();
    let snapshot = scheduler
        .wait_for_completion(Duration::from_millis(PREFETCH_WAIT_MS))
        .await
        .unwrap_or_else(|| scheduler.snapshot());
    if snapshot.finished_at.is_none() {
        warn!(wait_ms = PREFETCH_WAIT_MS, "Prefetch still running, reporting partial status");
    }

    print_json(&json!({
        "prefetch": snapshot,
        "sheets": services.sheets.stats(),
        "drive": services.drive.stats(),
        "worker": {
            "lifecycle": format!("{:?}", worker.lifecycle()),
            "buckets": worker.bucket_sizes().await,
        },
        "offline_bytes": services.persistent().usage_bytes().await?,
    }))
}

async fn run_sheet(services: &DataServices, name: &str) -> Result<()> {
    let outcome = services
        .sheets
        .get_sheet(name, None, FetchOptions::default())
        .await
        .map_err(|e| user_error(&format!("sheet '{}'", name), e))?;
    if outcome.source.is_possibly_outdated() {
        eprintln!("Showing cached data ({}); it may be out of date.", outcome.source.as_str());
    }
    print_json(&json!({
        "sheet": name,
        "source": outcome.source,
        "rows": outcome.data,
    }))
}

async fn run_folder(services: &DataServices, folder_id: &str) -> Result<()> {
    let outcome = services
        .drive
        .list_files(folder_id, None, FetchOptions::default())
        .await
        .map_err(|e| user_error(&format!("folder '{}'", folder_id), e))?;
    if outcome.source.is_possibly_outdated() {
        eprintln!("Showing cached data ({}); it may be out of date.", outcome.source.as_str());
    }
    print_json(&json!({
        "folder": folder_id,
        "source": outcome.source,
        "files": outcome.data,
    }))
}

fn saved_entry(namespace: &str, record: &PersistentRecord<serde_json::Value>) -> serde_json::Value {
    json!({
        "namespace": namespace,
        "id": record.id,
        "saved_at": record.timestamp,
        "age": record.age_display(),
    })
}

async fn run_saved(services: &DataServices) -> Result<()> {
    let mut saved = Vec::new();
    for namespace in [SHEETS_NAMESPACE, FILES_NAMESPACE] {
        let records = services.persistent().list::<serde_json::Value>(namespace).await;
        saved.extend(records.iter().map(|r| saved_entry(namespace, r)));
    }
    print_json(&json!({
        "records": saved,
        "offline_bytes": services.persistent().usage_bytes().await?,
    }))
}

async fn run_wipe(services: &DataServices, worker: &WorkerHandle) -> Result<()> {
    let mut broadcasts = worker.subscribe();
    services.wipe_all().await.context("Failed to wipe the durable cache")?;
    worker.control(ControlMessage::WipeAll).await?;

    let confirmed = tokio::time::timeout(Duration::from_millis(WIPE_WAIT_MS), async {
        loop {
            match broadcasts.recv().await {
                Ok(Broadcast::WipeComplete) => return true,
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return false,
            }
        }
    })
    .await
    .unwrap_or(false);

    if !confirmed {
        bail!("The network cache worker did not confirm the wipe");
    }
    println!("All cached data wiped.");
    Ok(())
}
