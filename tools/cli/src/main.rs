//! Driftwood CLI - Command line interface for a local-first record store.
//!
//! Records are written to a local SQLite store and pushed to a remote store
//! (a second SQLite file standing in for the server) when `sync` runs.

use anyhow::{bail, Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use driftwood_common::{payload_from_str, CollectionName, ConflictId, RecordId};
use driftwood_remote::{create_default_registry, RemoteStore};
use driftwood_store::LocalStore;
use driftwood_sync::{
    Connectivity, ConnectivityMonitor, Decision, FieldMerge, ManualConnectivity,
    ProbeConnectivity, SyncConfig, SyncMode, SyncOrchestrator, SyncOutcome, SyncReport,
    SyncScheduler,
};

#[derive(Parser)]
#[command(name = "driftwood")]
#[command(about = "Driftwood - Local-first record store with sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Local store database (default: <data dir>/driftwood/local.db).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Remote store database (default: <data dir>/driftwood/remote.db).
    #[arg(long, global = true)]
    remote: Option<PathBuf>,

    /// Sync configuration file (JSON).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update a record locally.
    Put {
        collection: String,
        id: String,
        /// Record payload as a JSON object.
        json: String,
    },

    /// Show a local record.
    Get { collection: String, id: String },

    /// Delete a record locally.
    Delete { collection: String, id: String },

    /// List records of a collection.
    List {
        collection: String,

        /// Only show records not yet confirmed by the remote.
        #[arg(short, long)]
        unsynced: bool,
    },

    /// List changes waiting to be pushed.
    Pending,

    /// Push pending changes and detect conflicts.
    Sync,

    /// Show the persisted sync status.
    Status {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List open conflicts.
    Conflicts,

    /// Resolve one conflict.
    Resolve {
        /// Conflict id, as `collection/id`.
        conflict: String,

        #[command(flatten)]
        choice: ResolveChoice,
    },

    /// Resolve every open conflict the same way.
    ResolveAll {
        /// Keep the local version everywhere.
        #[arg(long, conflicts_with = "server", required_unless_present = "server")]
        local: bool,

        /// Keep the server version everywhere.
        #[arg(long)]
        server: bool,
    },

    /// Delete acknowledged queue items older than the given age.
    Prune {
        #[arg(long, default_value = "168")]
        hours: u64,
    },

    /// Drop all local data, including unsynced changes.
    Reset {
        /// Confirm the reset.
        #[arg(long)]
        yes: bool,
    },

    /// Write a record directly to the remote store, as another device would.
    RemotePut {
        collection: String,
        id: String,
        json: String,
    },

    /// Show the remote version of a record.
    RemoteGet { collection: String, id: String },

    /// Keep syncing in the foreground until interrupted.
    Watch {
        /// Also sync every N seconds.
        #[arg(short, long)]
        interval: Option<u64>,

        /// Seconds between remote reachability probes.
        #[arg(long, default_value = "5")]
        probe: u64,
    },

    /// Generate shell completions.
    Completions { shell: Shell },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct ResolveChoice {
    /// Keep the local version.
    #[arg(long)]
    local: bool,

    /// Keep the server version.
    #[arg(long)]
    server: bool,

    /// Replace both versions with this JSON object.
    #[arg(long, value_name = "JSON")]
    merge: Option<String>,

    /// Start from the server version and keep these fields from the local one.
    #[arg(long = "keep-local", value_name = "FIELD", num_args = 1..)]
    keep_local: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let paths = Paths::from_cli(&cli);

    match cli.command {
        Commands::Put {
            collection,
            id,
            json,
        } => cmd_put(&paths, &collection, &id, &json),

        Commands::Get { collection, id } => cmd_get(&paths, &collection, &id),

        Commands::Delete { collection, id } => cmd_delete(&paths, &collection, &id),

        Commands::List {
            collection,
            unsynced,
        } => cmd_list(&paths, &collection, unsynced),

        Commands::Pending => cmd_pending(&paths),

        Commands::Sync => cmd_sync(&paths).await,

        Commands::Status { json } => cmd_status(&paths, json),

        Commands::Conflicts => cmd_conflicts(&paths),

        Commands::Resolve { conflict, choice } => cmd_resolve(&paths, &conflict, choice).await,

        Commands::ResolveAll { local, server: _ } => cmd_resolve_all(&paths, local).await,

        Commands::Prune { hours } => cmd_prune(&paths, hours),

        Commands::Reset { yes } => cmd_reset(&paths, yes),

        Commands::RemotePut {
            collection,
            id,
            json,
        } => cmd_remote_put(&paths, &collection, &id, &json).await,

        Commands::RemoteGet { collection, id } => cmd_remote_get(&paths, &collection, &id).await,

        Commands::Watch { interval, probe } => cmd_watch(&paths, interval, probe).await,

        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "driftwood",
                &mut std::io::stdout(),
            );
            Ok(())
        }
    }
}

/// Resolved file locations.
struct Paths {
    db: PathBuf,
    remote: PathBuf,
    config: Option<PathBuf>,
}

impl Paths {
    fn from_cli(cli: &Cli) -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("driftwood");

        Self {
            db: cli.db.clone().unwrap_or_else(|| data_dir.join("local.db")),
            remote: cli
                .remote
                .clone()
                .unwrap_or_else(|| data_dir.join("remote.db")),
            config: cli.config.clone(),
        }
    }

    fn load_config(&self) -> Result<SyncConfig> {
        match &self.config {
            Some(path) => SyncConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display())),
            None => Ok(SyncConfig::default()),
        }
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    Ok(())
}

fn open_store(paths: &Paths) -> Result<Arc<LocalStore>> {
    ensure_parent(&paths.db)?;
    let store = LocalStore::open(&paths.db)
        .with_context(|| format!("Failed to open local store {}", paths.db.display()))?;
    Ok(Arc::new(store))
}

fn open_remote(paths: &Paths) -> Result<Arc<dyn RemoteStore>> {
    ensure_parent(&paths.remote)?;
    let registry = create_default_registry();
    let config = serde_json::json!({ "path": paths.remote.to_string_lossy() });
    registry
        .resolve("sqlite", config)
        .with_context(|| format!("Failed to open remote store {}", paths.remote.display()))
}

/// Build an orchestrator whose connectivity is a one-off reachability check.
async fn one_shot_orchestrator(paths: &Paths) -> Result<SyncOrchestrator> {
    let config = paths.load_config()?;
    let store = open_store(paths)?;
    let remote = open_remote(paths)?;

    let reachable = matches!(
        tokio::time::timeout(config.request_timeout, remote.ping()).await,
        Ok(Ok(()))
    );
    let connectivity = if reachable {
        Connectivity::Online
    } else {
        Connectivity::Offline
    };

    SyncOrchestrator::new(
        store,
        remote,
        Arc::new(ManualConnectivity::new(connectivity)),
        config,
    )
    .context("Failed to start sync engine")
}

fn parse_key(collection: &str, id: &str) -> Result<(CollectionName, RecordId)> {
    let collection = CollectionName::new(collection).context("Invalid collection name")?;
    let id = RecordId::new(id).context("Invalid record id")?;
    Ok((collection, id))
}

fn cmd_put(paths: &Paths, collection: &str, id: &str, json: &str) -> Result<()> {
    let (collection, id) = parse_key(collection, id)?;
    let payload = payload_from_str(json).context("Invalid payload")?;

    let store = open_store(paths)?;
    let change = store
        .save(&collection, &id, payload)
        .context("Failed to save record")?;

    println!("Saved {}/{} ({})", collection, id, change.action);
    println!("  Change: {}", change.id);
    Ok(())
}

fn cmd_get(paths: &Paths, collection: &str, id: &str) -> Result<()> {
    let (collection, id) = parse_key(collection, id)?;
    let store = open_store(paths)?;

    match store.get(&collection, &id).context("Failed to read record")? {
        Some(record) => {
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        None => bail!("Record not found: {}/{}", collection, id),
    }
}

fn cmd_delete(paths: &Paths, collection: &str, id: &str) -> Result<()> {
    let (collection, id) = parse_key(collection, id)?;
    let store = open_store(paths)?;

    store
        .remove(&collection, &id)
        .context("Failed to delete record")?;

    println!("Deleted {}/{}", collection, id);
    Ok(())
}

fn cmd_list(paths: &Paths, collection: &str, unsynced: bool) -> Result<()> {
    let collection = CollectionName::new(collection).context("Invalid collection name")?;
    let store = open_store(paths)?;

    let records = if unsynced {
        store.get_all_unsynced(&collection)?
    } else {
        store.list(&collection)?
    };

    if records.is_empty() {
        println!("No records.");
        return Ok(());
    }

    println!("Records in {}:", collection);
    for record in records {
        let marker = if record.synced { " " } else { "*" };
        println!(
            "  {} {}  {}",
            marker,
            record.id,
            serde_json::Value::Object(record.payload)
        );
    }
    Ok(())
}

fn cmd_pending(paths: &Paths) -> Result<()> {
    let store = open_store(paths)?;
    let changes = store.drain().context("Failed to read pending changes")?;

    if changes.is_empty() {
        println!("Nothing to push.");
        return Ok(());
    }

    println!("Pending changes ({}):", changes.len());
    for change in changes {
        let failure = match (&change.last_failure, &change.last_error) {
            (Some(kind), Some(message)) => format!("  [{}: {}]", kind, message),
            (Some(kind), None) => format!("  [{}]", kind),
            _ => String::new(),
        };
        println!(
            "  {} {:<6} {}/{}  attempts={}{}",
            change.timestamp.format("%Y-%m-%d %H:%M:%S"),
            change.action.as_str(),
            change.collection,
            change.record_id,
            change.attempts,
            failure
        );
    }
    Ok(())
}

fn print_report(report: &SyncReport) {
    println!("  Pushed: {}", report.pushed);
    if report.failed > 0 {
        println!("  Failed: {}", report.failed);
    }
    if report.rejected > 0 {
        println!("  Rejected: {}", report.rejected);
    }
    if report.conflicts_found > 0 {
        println!("  New conflicts: {}", report.conflicts_found);
    }
    if report.converged > 0 {
        println!("  Converged: {}", report.converged);
    }
    if report.auto_resolved > 0 {
        println!("  Auto-resolved: {}", report.auto_resolved);
    }
    println!("  Still pending: {}", report.pending);
    println!("  Open conflicts: {}", report.conflicts);
    println!("  Passes: {} ({:?})", report.passes, report.duration);
}

async fn cmd_sync(paths: &Paths) -> Result<()> {
    let orchestrator = one_shot_orchestrator(paths).await?;

    match orchestrator.sync().await {
        SyncOutcome::Completed(report) => {
            println!("Sync completed.");
            print_report(&report);
            Ok(())
        }
        SyncOutcome::Failed { report, error } => {
            println!("Sync failed.");
            print_report(&report);
            bail!(error)
        }
        SyncOutcome::Coalesced => {
            println!("A sync is already running.");
            Ok(())
        }
        SyncOutcome::Offline => {
            println!("Remote store unreachable; changes stay queued.");
            Ok(())
        }
    }
}

fn cmd_status(paths: &Paths, json: bool) -> Result<()> {
    let config = paths.load_config()?;
    let store = open_store(paths)?;
    let remote = open_remote(paths)?;
    let orchestrator = SyncOrchestrator::new(
        store,
        remote,
        Arc::new(ManualConnectivity::offline()),
        config,
    )?;
    let status = orchestrator.status();

    if json {
        println!("{}", status.to_json()?);
        return Ok(());
    }

    println!("Sync Status:");
    println!("  State: {}", status.state);
    println!("  Pending changes: {}", status.pending);
    println!("  Open conflicts: {}", status.conflicts);
    match status.last_sync_at {
        Some(at) => println!("  Last sync: {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("  Last sync: never"),
    }
    if let Some(error) = status.last_error {
        println!("  Last error: {}", error);
    }
    Ok(())
}

fn cmd_conflicts(paths: &Paths) -> Result<()> {
    let store = open_store(paths)?;
    let conflicts = store.list_conflicts().context("Failed to list conflicts")?;

    if conflicts.is_empty() {
        println!("No open conflicts.");
        return Ok(());
    }

    for conflict in conflicts {
        println!("{}", conflict.id);
        println!("  Fields: {}", conflict.fields.join(", "));
        for field in &conflict.fields {
            let show = |value: Option<&serde_json::Value>| {
                value.map_or_else(|| "<absent>".to_string(), |v| v.to_string())
            };
            println!(
                "    {}: local={} server={}",
                field,
                show(conflict.local_data.get(field)),
                show(conflict.server_data.get(field))
            );
        }
        println!("  Local edit:  {}", conflict.local_timestamp);
        println!("  Server edit: {}", conflict.server_timestamp);
    }
    Ok(())
}

async fn cmd_resolve(paths: &Paths, conflict: &str, choice: ResolveChoice) -> Result<()> {
    let id: ConflictId = conflict.parse().context("Invalid conflict id")?;
    let orchestrator = one_shot_orchestrator(paths).await?;

    let decision = if choice.local {
        Decision::Local
    } else if choice.server {
        Decision::Server
    } else if let Some(json) = choice.merge {
        Decision::Merge(payload_from_str(&json).context("Invalid merge payload")?)
    } else {
        let conflict = orchestrator
            .store()
            .get_conflict(&id)?
            .with_context(|| format!("No open conflict for {}", id))?;
        let mut merge = FieldMerge::new(&conflict);
        for field in &choice.keep_local {
            merge = merge.take_local(field)?;
        }
        Decision::Merge(merge.build())
    };

    info!("Resolving {}", id);
    let record = orchestrator
        .resolve_one(&id, decision)
        .await
        .with_context(|| format!("Failed to resolve {}", id))?;

    println!("Resolved {}", id);
    println!("  {}", serde_json::Value::Object(record.payload));
    Ok(())
}

async fn cmd_resolve_all(paths: &Paths, local: bool) -> Result<()> {
    let orchestrator = one_shot_orchestrator(paths).await?;
    let decision = if local {
        Decision::Local
    } else {
        Decision::Server
    };

    let report = orchestrator.resolve_all(&decision).await?;
    println!("Resolved {} conflict(s).", report.resolved.len());
    for (id, error) in &report.failed {
        println!("  Failed {}: {}", id, error);
    }

    if !report.failed.is_empty() {
        bail!("{} conflict(s) left open", report.failed.len());
    }
    Ok(())
}

fn cmd_prune(paths: &Paths, hours: u64) -> Result<()> {
    let store = open_store(paths)?;
    let removed = store
        .prune_expired(Duration::from_secs(hours * 3600))
        .context("Failed to prune queue")?;

    println!("Pruned {} acknowledged change(s).", removed);
    Ok(())
}

fn cmd_reset(paths: &Paths, yes: bool) -> Result<()> {
    if !yes {
        bail!("Reset discards unsynced changes; pass --yes to confirm");
    }

    let store = open_store(paths)?;
    store.reset().context("Failed to reset local store")?;
    println!("Local store reset: {}", store.location());
    Ok(())
}

async fn cmd_remote_put(paths: &Paths, collection: &str, id: &str, json: &str) -> Result<()> {
    let (collection, id) = parse_key(collection, id)?;
    let payload = payload_from_str(json).context("Invalid payload")?;

    let remote = open_remote(paths)?;
    let stored = remote
        .upsert(&collection, &id, payload)
        .await
        .context("Remote write failed")?;

    println!("Remote {}/{} modified at {}", collection, id, stored.modified);
    Ok(())
}

async fn cmd_remote_get(paths: &Paths, collection: &str, id: &str) -> Result<()> {
    let (collection, id) = parse_key(collection, id)?;
    let remote = open_remote(paths)?;

    match remote.fetch_by_id(&collection, &id).await? {
        Some(record) => {
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        None => bail!("Remote record not found: {}/{}", collection, id),
    }
}

async fn cmd_watch(paths: &Paths, interval: Option<u64>, probe: u64) -> Result<()> {
    let mut config = paths.load_config()?;
    if let Some(secs) = interval {
        config.sync_mode = SyncMode::Periodic {
            interval: Duration::from_secs(secs),
        };
    }

    let store = open_store(paths)?;
    let remote = open_remote(paths)?;
    let connectivity: Arc<dyn ConnectivityMonitor> = Arc::new(ProbeConnectivity::for_remote(
        remote.clone(),
        Duration::from_secs(probe.max(1)),
        config.request_timeout,
    ));

    let orchestrator = Arc::new(SyncOrchestrator::new(store, remote, connectivity, config)?);
    let mut status = orchestrator.subscribe();
    let (scheduler, handle) = SyncScheduler::new(orchestrator);
    let task = tokio::spawn(handle.run());

    println!("Watching for changes (Ctrl-C to stop)...");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                println!(
                    "[{}] pending={} conflicts={}{}",
                    current.state,
                    current.pending,
                    current.conflicts,
                    current
                        .last_error
                        .map(|e| format!(" error={}", e))
                        .unwrap_or_default()
                );
            }
        }
    }

    scheduler.shutdown().await;
    task.await.context("Scheduler task failed")?;
    println!("Stopped.");
    Ok(())
}
