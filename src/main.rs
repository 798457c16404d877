use anyhow::{Context, Result};
use std::env;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crm_inbox::cache::Cache;
use crm_inbox::config::Config;
use crm_inbox::message::ThreadKey;
use crm_inbox::store::HttpStore;
use crm_inbox::sync::{
    InboundEvent, SyncActorHandle, SyncCommand, SyncEngine, load_engine, spawn_sync_actor,
};
use crm_inbox::view::InboxSnapshot;

fn setup_logging() {
    use std::fs::OpenOptions;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,crm_inbox=debug"));

    // Try to create a log file in the data directory
    let log_file = Config::data_dir()
        .ok()
        .and_then(|dir| std::fs::create_dir_all(&dir).ok().map(|_| dir))
        .map(|dir| dir.join("crm-inbox.log"))
        .and_then(|path| {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .ok()
        });

    if let Some(file) = log_file {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false),
            )
            .init();
    } else {
        // Fallback to stderr if file logging fails
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_usage() {
    eprintln!(
        r#"crm-inbox - Lead inbox sync engine

Usage: crm-inbox [command]

Commands:
    run             Poll the message store and read push events from stdin
    replay <file>   Feed a JSON-lines script through the engine and print the inbox
    help            Show this help message

While running, stdin accepts one JSON event per line plus:
    :poll           Poll the store now
    :open <key>     Open a thread, e.g. ":open sms:L42"
    :quit           Stop

Configuration file: ~/.config/crm-inbox/config.toml
"#
    );
}

fn print_snapshot(snapshot: &InboxSnapshot) {
    match serde_json::to_string(snapshot) {
        Ok(json) => println!("{}", json),
        Err(e) => tracing::warn!("Failed to encode snapshot: {}", e),
    }
}

enum StdinLine {
    Command(SyncCommand),
    Quit,
    Skip,
}

fn parse_stdin_line(line: &str) -> StdinLine {
    let line = line.trim();
    if line.is_empty() {
        return StdinLine::Skip;
    }
    if let Some(rest) = line.strip_prefix(':') {
        let (cmd, arg) = rest.split_once(' ').unwrap_or((rest, ""));
        return match (cmd, arg.trim()) {
            ("poll", _) => StdinLine::Command(SyncCommand::PollNow),
            ("open", key) if !key.is_empty() => {
                StdinLine::Command(SyncCommand::OpenThread(ThreadKey::from(key)))
            }
            ("quit", _) => StdinLine::Quit,
            _ => {
                eprintln!("Unknown command: {}", line);
                StdinLine::Skip
            }
        };
    }
    match InboundEvent::parse(line) {
        Ok(event) => StdinLine::Command(SyncCommand::Event(event)),
        Err(e) => {
            tracing::warn!("Dropping malformed event: {}", e);
            StdinLine::Skip
        }
    }
}

async fn forward_stdin(handle: &SyncActorHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        match parse_stdin_line(&line) {
            StdinLine::Command(cmd) => handle.send(cmd).await?,
            StdinLine::Quit => break,
            StdinLine::Skip => {}
        }
    }
    Ok(())
}

async fn run_sync() -> Result<()> {
    setup_logging();

    let config = Config::load()?;
    config.ensure_dirs()?;

    let cache_path = Config::data_dir()?.join("cache.db");
    let cache = Arc::new(Cache::open(&cache_path, config.cache.read_cache_capacity).await?);
    let store = Arc::new(HttpStore::new(&config.store)?);
    tracing::info!("Syncing with {}", config.store.base_url);

    let engine = load_engine(&config, cache.as_ref()).await;
    let (handle, task) = spawn_sync_actor(engine, store, cache, config);

    let mut snapshot_rx = handle.snapshot_rx.clone();
    tokio::spawn(async move {
        while snapshot_rx.changed().await.is_ok() {
            let snapshot = snapshot_rx.borrow_and_update().clone();
            print_snapshot(&snapshot);
        }
    });

    tokio::select! {
        result = forward_stdin(&handle) => {
            if let Err(e) = result {
                tracing::warn!("Stopped reading stdin: {:#}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
        }
    }

    // The actor may already be gone; either way it is stopping
    handle.send(SyncCommand::Shutdown).await.ok();
    task.await.context("Sync actor panicked")?;
    Ok(())
}

fn run_replay(path: &str) -> Result<()> {
    setup_logging();

    let config = Config::load()?;
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open replay file: {}", path))?;

    let mut engine = SyncEngine::new(&config);
    let stats = crm_inbox::replay::replay(&mut engine, std::io::BufReader::new(file))?;

    let snapshot = engine.snapshot(chrono::Utc::now().timestamp(), None);
    let json = serde_json::to_string_pretty(&snapshot).context("Failed to encode snapshot")?;
    println!("{}", json);
    eprintln!(
        "{} steps, {} skipped lines, {} duplicates, {} dropped, {} ignored",
        stats.steps, stats.skipped, stats.duplicates, stats.dropped, stats.ignored
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("help") | Some("--help") | Some("-h") => {
            print_usage();
            Ok(())
        }
        Some("run") | None => run_sync().await,
        Some("replay") => match args.get(2) {
            Some(path) => run_replay(path),
            None => {
                eprintln!("replay needs a file");
                print_usage();
                std::process::exit(1);
            }
        },
        Some(cmd) => {
            eprintln!("Unknown command: {}", cmd);
            print_usage();
            std::process::exit(1);
        }
    }
}
