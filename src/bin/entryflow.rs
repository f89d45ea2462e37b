//! entryflow CLI: operator interface to the stage scheduler.

use entryflow::config::Config;
use entryflow::db::Db;
use entryflow::dispatch::{DispatchConfig, Dispatcher};
use entryflow::lease::LeaseManager;
use entryflow::model::{Entry, EntryId, NewEntry, WorkerId};
use entryflow::scheduler::EntryScheduler;
use entryflow::stage::SimulatedStage;
use entryflow::store::{MemoryStore, RecordStore};
use entryflow::telemetry::{TelemetryConfig, init_telemetry};
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "entryflow", about = "Lease-based stage scheduler for entries")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher daemon (sweeps for unfinished entries)
    Serve,
    /// Entry operations
    Entry {
        #[command(subcommand)]
        action: EntryAction,
    },
    /// Run entries through an in-memory store with competing workers
    Demo {
        /// Number of entries to create
        #[arg(long, default_value_t = 3)]
        entries: usize,
        /// Concurrent schedulers launched per entry
        #[arg(long, default_value_t = 2)]
        workers: usize,
        /// Simulated stage duration in milliseconds
        #[arg(long, default_value_t = 200)]
        delay_ms: u64,
        /// Make stage N (1-based) fail
        #[arg(long)]
        fail_at: Option<usize>,
    },
}

#[derive(Subcommand)]
enum EntryAction {
    /// Create an entry and process it
    Create {
        /// Display title
        title: String,
        /// Only store the entry; leave processing to a running `serve`
        #[arg(long)]
        detach: bool,
    },
    /// List entries, newest first
    List {
        /// Maximum entries to show (capped at 100)
        #[arg(long)]
        limit: Option<i64>,
        #[arg(long, default_value_t = 0)]
        offset: i64,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show an entry
    Show {
        /// Entry ID (full UUID or prefix)
        id: String,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Run the scheduler for an existing entry in the foreground
    Run {
        /// Entry ID (full UUID or prefix)
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig::from_config(&config))?;

    match cli.command {
        Command::Serve => cmd_serve(&config).await,
        Command::Demo {
            entries,
            workers,
            delay_ms,
            fail_at,
        } => cmd_demo(&config, entries, workers, delay_ms, fail_at).await,
        Command::Entry { action } => {
            let db = Db::connect(config.database_url()?.expose_secret()).await?;
            db.migrate().await?;
            let store: Arc<dyn RecordStore> = Arc::new(db);

            match action {
                EntryAction::Create { title, detach } => {
                    cmd_entry_create(&config, store, title, detach).await
                }
                EntryAction::List {
                    limit,
                    offset,
                    json,
                } => cmd_entry_list(store.as_ref(), limit, offset, json).await,
                EntryAction::Show { id, json } => cmd_entry_show(store.as_ref(), id, json).await,
                EntryAction::Run { id } => cmd_entry_run(&config, store, id).await,
            }
        }
    }
}

async fn cmd_serve(config: &Config) -> anyhow::Result<()> {
    let db = Db::connect(config.database_url()?.expose_secret()).await?;
    db.migrate().await?;
    db.health_check().await?;

    let scheduler = config.build_scheduler(Arc::new(db))?;
    let dispatcher = Dispatcher::new(
        Arc::new(scheduler),
        DispatchConfig {
            sweep_interval: config.sweep_interval,
            ..DispatchConfig::default()
        },
    );

    let d = dispatcher.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        d.shutdown();
    });

    dispatcher.run().await?;
    Ok(())
}

async fn cmd_entry_create(
    config: &Config,
    store: Arc<dyn RecordStore>,
    title: String,
    detach: bool,
) -> anyhow::Result<()> {
    let new = NewEntry::new(&title)?;

    if detach {
        let entry = store.insert(new).await?;
        println!("Created: {} (status: {})", entry.id, entry.status);
        return Ok(());
    }

    let dispatcher = Dispatcher::new(
        Arc::new(config.build_scheduler(Arc::clone(&store))?),
        DispatchConfig::default(),
    );
    let (entry, run) = dispatcher.create(new).await?;
    println!("Created: {} (status: {})", entry.id, entry.status);

    // The CLI process would exit before a background run finishes; wait here.
    run.await?;
    print_entry(&store.get(entry.id).await?);
    Ok(())
}

async fn cmd_entry_list(
    store: &dyn RecordStore,
    limit: Option<i64>,
    offset: i64,
    json: bool,
) -> anyhow::Result<()> {
    let page = store.list(limit, offset).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&page)?);
        return Ok(());
    }

    if page.entries.is_empty() {
        println!("No entries found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<30}  {:<10}  {:>4}  {:<16}  CREATED",
        "ID", "TITLE", "STATUS", "PCT", "LOCKED_BY"
    );
    println!("{}", "-".repeat(100));

    for entry in &page.entries {
        let short_id = &entry.id.to_string()[..8];
        let title: String = entry.title.chars().take(30).collect();
        let holder: String = entry
            .lease
            .holder()
            .map(|w| w.as_str().chars().take(16).collect())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<8}  {:<30}  {:<10}  {:>3}%  {:<16}  {}",
            short_id,
            title,
            entry.status,
            entry.progress,
            holder,
            entry.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!(
        "\n{}-{} of {} entries",
        page.offset + 1,
        page.offset + page.entries.len() as i64,
        page.total
    );
    Ok(())
}

async fn cmd_entry_show(store: &dyn RecordStore, id: String, json: bool) -> anyhow::Result<()> {
    let id = resolve_id(store, &id).await?;
    let entry = store.get(id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entry)?);
    } else {
        print_entry(&entry);
    }
    Ok(())
}

async fn cmd_entry_run(
    config: &Config,
    store: Arc<dyn RecordStore>,
    id: String,
) -> anyhow::Result<()> {
    let id = resolve_id(store.as_ref(), &id).await?;
    let scheduler = config.build_scheduler(Arc::clone(&store))?;

    let report = scheduler.run(id).await;
    println!(
        "Advanced {} stage(s), skipped {}, lost lease on {}",
        report.advanced, report.skipped, report.lease_lost
    );
    print_entry(&store.get(id).await?);
    Ok(())
}

async fn cmd_demo(
    config: &Config,
    entries: usize,
    workers: usize,
    delay_ms: u64,
    fail_at: Option<usize>,
) -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let plan = config.stage_plan()?;

    let mut processor = SimulatedStage::new(Duration::from_millis(delay_ms));
    if let Some(stage) = fail_at {
        anyhow::ensure!(stage >= 1, "--fail-at is 1-based");
        processor = processor.failing_at(stage - 1);
    }
    let processor = Arc::new(processor);

    let schedulers: Vec<Arc<EntryScheduler>> = (0..workers.max(1))
        .map(|_| {
            let leases = LeaseManager::new(
                store.clone(),
                WorkerId::generate(),
                config.lease_timeout,
            );
            Arc::new(
                EntryScheduler::new(leases, processor.clone(), plan.clone())
                    .with_policy(config.claim_policy),
            )
        })
        .collect();

    let mut ids = Vec::with_capacity(entries);
    let mut runs = Vec::new();
    for n in 0..entries {
        let entry = store.insert(NewEntry::new(format!("demo-{}", n + 1))?).await?;
        ids.push(entry.id);
        for scheduler in &schedulers {
            let dispatcher = Dispatcher::new(Arc::clone(scheduler), DispatchConfig::default());
            runs.push(dispatcher.dispatch(entry.id));
        }
    }

    for run in runs {
        run.await?;
    }

    for id in ids {
        print_entry(&store.get(id).await?);
        let history: Vec<String> = store
            .history(id)
            .into_iter()
            .map(|(status, progress)| format!("{status}({progress})"))
            .collect();
        println!("History:    {}", history.join(" -> "));
        println!();
    }
    Ok(())
}

/// Accept a full UUID, or a prefix matched against the newest 100 entries.
async fn resolve_id(store: &dyn RecordStore, id: &str) -> anyhow::Result<EntryId> {
    if let Ok(id) = id.parse::<EntryId>() {
        return Ok(id);
    }

    let page = store.list(Some(100), 0).await?;
    let matches: Vec<_> = page
        .entries
        .iter()
        .filter(|e| e.id.to_string().starts_with(id))
        .collect();
    match matches.len() {
        0 => anyhow::bail!("no entry matching prefix '{id}'"),
        1 => Ok(matches[0].id),
        n => anyhow::bail!("{n} entries match prefix '{id}', be more specific"),
    }
}

fn print_entry(entry: &Entry) {
    println!("ID:         {}", entry.id);
    println!("Title:      {}", entry.title);
    println!("Status:     {}", entry.status);
    println!("Progress:   {}%", entry.progress);
    println!("Result:     {}", entry.result.as_deref().unwrap_or("-"));
    match entry.lease.holder() {
        Some(worker) => println!("Locked By:  {worker}"),
        None => println!("Locked By:  -"),
    }
    println!("Created:    {}", entry.created_at);
    println!("Updated:    {}", entry.updated_at);
}
