//! ttlsync: incremental sync of a Turtle metadata export into a record platform.
//!
//! # Usage
//!
//! ```bash
//! # Download the latest export (or an older one with a negative offset)
//! ttlsync fetch-graph --version-offset -1
//!
//! # Turn the export into the canonical JSON document
//! ttlsync normalize
//!
//! # Push changed (dataset, model) groups to the dev platform
//! ttlsync sync dev --dry-run
//! ttlsync sync dev --dataset N:dataset:1234 --force-model sample
//!
//! # Send a dataset to a platform dataset with a different id
//! ttlsync map-dataset prod N:dataset:1234 N:dataset:5678
//!
//! # Inspect stored fingerprints and past runs
//! ttlsync status prod
//! ttlsync history prod --prune-before 2024-01-01
//! ```

mod config;
mod fetch;
mod history;
mod remote;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use ttlsync_core::{
    document::dataset_key, CanonicalDocument, DiffPlanner, Graph, MemoryStateStore, Normalizer, PlanOptions, PlatformApi,
    PlatformUpdater, ResumeJournal, RunLog, RunLogEntry, Schema, SqliteStateStore, SyncStateStore,
    UpdaterOptions,
};

use config::{Credentials, Environment, Settings};

#[derive(Parser, Debug)]
#[command(name = "ttlsync")]
#[command(author, version)]
#[command(about = "Incremental sync of Turtle metadata exports into a record platform")]
struct Cli {
    /// Settings file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Mapping schema replacing the built-in one
    #[arg(long, global = true)]
    schema: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download a Turtle export
    #[command(name = "fetch-graph")]
    FetchGraph {
        /// Versions back from the latest (0 = latest, -1 = previous)
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        version_offset: i32,
        /// Destination file (default: working directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Normalize a Turtle export into the canonical document
    Normalize {
        /// Turtle file (default: latest download)
        #[arg(long)]
        ttl: Option<PathBuf>,
        /// Document to write (default: working directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Push changed groups of the canonical document to the platform
    Sync {
        env: Environment,
        /// Canonical document (default: working directory)
        #[arg(long)]
        document: Option<PathBuf>,
        /// Only sync this dataset
        #[arg(long)]
        dataset: Option<String>,
        /// Re-send every previously synced group
        #[arg(long)]
        force: bool,
        /// Re-send previously synced groups of this model
        #[arg(long = "force-model")]
        force_models: Vec<String>,
        /// Skip datasets completed by the last interrupted run
        #[arg(long)]
        resume: bool,
        /// Show what would be sent without calling the platform
        #[arg(long)]
        dry_run: bool,
        /// Records per insert call
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Show stored fingerprints
    Status {
        env: Environment,
        #[arg(long)]
        dataset: Option<String>,
    },

    /// Delete every record of one dataset on the platform
    #[command(name = "clear-dataset")]
    ClearDataset {
        env: Environment,
        dataset: String,
        #[arg(long)]
        dry_run: bool,
    },

    /// Record the platform id of a dataset
    #[command(name = "map-dataset")]
    MapDataset {
        env: Environment,
        /// Dataset id in the export
        dataset: String,
        /// Dataset id on the platform
        platform_id: String,
    },

    /// Show past sync runs
    History {
        env: Environment,
        /// Remove runs started before this date (YYYY-MM-DD)
        #[arg(long)]
        prune_before: Option<String>,
    },
}

struct SyncArgs {
    env: Environment,
    document: Option<PathBuf>,
    dataset: Option<String>,
    force: bool,
    force_models: Vec<String>,
    resume: bool,
    dry_run: bool,
    batch_size: Option<usize>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("ttlsync=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    let schema_path = cli.schema.or_else(|| settings.schema.clone());

    match cli.command {
        Commands::FetchGraph {
            version_offset,
            output,
        } => cmd_fetch_graph(&settings, version_offset, output).await,

        Commands::Normalize { ttl, output } => {
            cmd_normalize(&settings, schema_path.as_deref(), ttl, output).await
        }

        Commands::Sync {
            env,
            document,
            dataset,
            force,
            force_models,
            resume,
            dry_run,
            batch_size,
        } => {
            let args = SyncArgs {
                env,
                document,
                dataset,
                force,
                force_models,
                resume,
                dry_run,
                batch_size,
            };
            cmd_sync(&settings, schema_path.as_deref(), args).await
        }

        Commands::Status { env, dataset } => cmd_status(&settings, env, dataset).await,

        Commands::ClearDataset {
            env,
            dataset,
            dry_run,
        } => cmd_clear_dataset(&settings, schema_path.as_deref(), env, dataset, dry_run).await,

        Commands::MapDataset {
            env,
            dataset,
            platform_id,
        } => cmd_map_dataset(&settings, env, &dataset, &platform_id).await,

        Commands::History { env, prune_before } => cmd_history(&settings, env, prune_before).await,
    }
}

fn load_schema(path: Option<&Path>) -> Result<Schema> {
    match path {
        Some(path) => Ok(Schema::load(path)?),
        None => Ok(Schema::builtin()?),
    }
}

/// Credentials are required before any processing unless nothing is sent.
fn credentials_for(dry_run: bool) -> Result<Option<Credentials>> {
    if dry_run {
        Ok(None)
    } else {
        Credentials::from_env().map(Some)
    }
}

fn connect(settings: &Settings, env: Environment, credentials: Option<Credentials>) -> Result<Option<remote::HttpPlatform>> {
    credentials
        .map(|creds| {
            remote::HttpPlatform::new(
                &settings.platform(env).api_host,
                creds,
                Duration::from_secs(settings.timeout_secs),
            )
        })
        .transpose()
}

/// The persistent store, or an in-memory copy of it for dry runs.
async fn open_store(settings: &Settings, env: Environment, dry_run: bool) -> Result<Box<dyn SyncStateStore>> {
    let path = settings.state_db(env);
    let store = SqliteStateStore::open(&path)
        .with_context(|| format!("Failed to open state store {}", path.display()))?;
    if dry_run {
        Ok(Box::new(MemoryStateStore::snapshot_of(&store).await?))
    } else {
        Ok(Box::new(store))
    }
}

async fn cmd_fetch_graph(settings: &Settings, version_offset: i32, output: Option<PathBuf>) -> Result<()> {
    let dest = output.unwrap_or_else(|| settings.ttl_path(version_offset));
    let fetcher = fetch::ExportFetcher::new(
        &settings.export_base_url,
        &settings.export_file_name,
        Duration::from_secs(settings.timeout_secs),
    )?;

    println!("Fetching export (offset {})...", version_offset);
    let version = fetcher.download(version_offset, &dest).await?;
    println!("  Version: {}", version);
    println!("  Saved:   {}", dest.display());
    Ok(())
}

async fn cmd_normalize(
    settings: &Settings,
    schema_path: Option<&Path>,
    ttl: Option<PathBuf>,
    output: Option<PathBuf>,
) -> Result<()> {
    let ttl = ttl.unwrap_or_else(|| settings.ttl_path(0));
    let output = output.unwrap_or_else(|| settings.document_path());
    let schema = load_schema(schema_path)?;
    let normalizer = Normalizer::new(&schema)?;

    let started = Instant::now();
    let graph = Graph::load(&ttl).with_context(|| format!("Failed to load {}", ttl.display()))?;
    println!("Loaded {} triples from {}", graph.len(), ttl.display());

    let normalized = normalizer.normalize(&graph);
    normalized.document.save(&output)?;

    println!("\nNormalized:");
    println!("  Datasets: {}", normalized.document.dataset_count());
    println!("  Records:  {}", normalized.document.record_count());
    for (model, count) in normalized.document.counts_by_model() {
        println!("    {:<12} {}", model, count);
    }
    println!("  Issues:   {}", normalized.issues.len());
    println!("  Time:     {}ms", started.elapsed().as_millis());
    println!("  Saved:    {}", output.display());
    Ok(())
}

async fn cmd_sync(settings: &Settings, schema_path: Option<&Path>, args: SyncArgs) -> Result<()> {
    let credentials = credentials_for(args.dry_run)?;
    let links = load_schema(schema_path)?.link_rules();
    let batch_size = args.batch_size.unwrap_or(settings.batch_size);
    if batch_size == 0 {
        return Err(anyhow!("--batch-size must be at least 1"));
    }

    let document_path = args.document.unwrap_or_else(|| settings.document_path());
    let document = CanonicalDocument::load(&document_path)
        .with_context(|| format!("Failed to load document {}", document_path.display()))?;
    let store = open_store(settings, args.env, args.dry_run).await?;

    let journal_path = settings.resume_path(args.env);
    let mut skip_datasets = Default::default();
    if args.resume {
        let journal = ResumeJournal::load(&journal_path)?;
        println!("Resuming: {} datasets already completed", journal.completed.len());
        skip_datasets = journal.completed;
    } else if !args.dry_run {
        ResumeJournal::new(&journal_path).reset()?;
    }

    let options = PlanOptions {
        dataset: args.dataset,
        force_all: args.force,
        force_models: args.force_models.into_iter().collect(),
        skip_datasets,
    };
    let plan = DiffPlanner::new(store.as_ref(), options).plan(&document).await?;
    println!(
        "Plan for {}: {} new, {} changed, {} unchanged ({} datasets)",
        args.env,
        plan.count(ttlsync_core::Classification::New),
        plan.count(ttlsync_core::Classification::Changed),
        plan.count(ttlsync_core::Classification::Unchanged),
        plan.dataset_ids().len()
    );

    let platform = connect(settings, args.env, credentials)?;
    let updater = PlatformUpdater::new(
        store.as_ref(),
        platform.as_ref().map(|p| p as &dyn PlatformApi),
        UpdaterOptions {
            batch_size,
            dry_run: args.dry_run,
            resume_journal: Some(journal_path),
            links,
        },
    );

    let started_at = chrono::Utc::now().timestamp();
    let started = Instant::now();
    let result = updater.apply(&plan, &document).await;

    let run_log = RunLog::new(&settings.working_dir, args.env.name());
    let mut entry = RunLogEntry::new(args.env.name(), started_at);
    entry.duration_ms = started.elapsed().as_millis() as u64;
    entry.datasets = plan.dataset_ids().len();

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            if !args.dry_run {
                entry.error = Some(e.to_string());
                run_log.append(&entry)?;
            }
            return Err(e).context("Sync aborted");
        }
    };

    if !args.dry_run {
        entry.skipped = report.skipped();
        entry.inserted = report.inserted();
        entry.replaced = report.replaced();
        entry.failed = report.failed();
        entry.success = !report.has_failures();
        run_log.append(&entry)?;
    }

    history::print_report(&report, &mut std::io::stdout())?;
    if report.has_failures() {
        for failure in report.failures() {
            eprintln!("  {}/{}: {}", failure.dataset_id, failure.model, failure.outcome);
        }
        return Err(anyhow!("{} models failed to sync", report.failed()));
    }
    Ok(())
}

async fn cmd_status(settings: &Settings, env: Environment, dataset: Option<String>) -> Result<()> {
    let store = SqliteStateStore::open(&settings.state_db(env))?;
    let entries = store.entries(dataset.as_deref()).await?;

    println!("Environment: {}", env);
    println!("State:       {}\n", settings.state_db(env).display());
    history::print_status(&entries, &mut std::io::stdout())?;

    let run_log = RunLog::new(&settings.working_dir, env.name());
    if let Some(entry) = run_log.latest()? {
        println!("\nLatest run:");
        println!("  {}", history::format_entry(&entry));
    }
    Ok(())
}

async fn cmd_clear_dataset(
    settings: &Settings,
    schema_path: Option<&Path>,
    env: Environment,
    dataset: String,
    dry_run: bool,
) -> Result<()> {
    let credentials = credentials_for(dry_run)?;
    let schema = load_schema(schema_path)?;
    let models: Vec<String> = schema.model_names().map(str::to_string).collect();
    let store = open_store(settings, env, dry_run).await?;
    let platform = connect(settings, env, credentials)?;

    println!("Clearing {} models of {} on {}...", models.len(), dataset, env);
    let updater = PlatformUpdater::new(
        store.as_ref(),
        platform.as_ref().map(|p| p as &dyn PlatformApi),
        UpdaterOptions {
            batch_size: settings.batch_size,
            dry_run,
            resume_journal: None,
            links: Vec::new(),
        },
    );
    let report = updater.clear_dataset(&dataset, &models).await?;

    history::print_report(&report, &mut std::io::stdout())?;
    if report.has_failures() {
        return Err(anyhow!("{} models could not be cleared", report.failed()));
    }
    Ok(())
}

/// Point `dataset` at `platform_id`. Returns the previous mapping.
async fn map_dataset(store: &dyn SyncStateStore, dataset: &str, platform_id: &str) -> Result<Option<String>> {
    if let Some(owner) = store.get_source_identifier(platform_id).await? {
        if owner != dataset_key(dataset) {
            return Err(anyhow!("{} is already mapped from {}", platform_id, owner));
        }
    }
    let previous = store.get_dataset_mapping(dataset).await?;
    store.put_dataset_mapping(dataset, platform_id).await?;
    Ok(previous)
}

async fn cmd_map_dataset(settings: &Settings, env: Environment, dataset: &str, platform_id: &str) -> Result<()> {
    let path = settings.state_db(env);
    let store = SqliteStateStore::open(&path)
        .with_context(|| format!("Failed to open state store {}", path.display()))?;

    let previous = map_dataset(&store, dataset, platform_id).await?;
    match previous {
        Some(previous) if previous != platform_id => {
            println!("{}: {} -> {} (was {})", env, dataset, platform_id, previous)
        }
        _ => println!("{}: {} -> {}", env, dataset, platform_id),
    }
    Ok(())
}

async fn cmd_history(settings: &Settings, env: Environment, prune_before: Option<String>) -> Result<()> {
    let run_log = RunLog::new(&settings.working_dir, env.name());

    if let Some(date) = prune_before {
        let day = chrono::NaiveDate::parse_from_str(&date, "%Y-%m-%d")
            .with_context(|| format!("Invalid date {} (expected YYYY-MM-DD)", date))?;
        let cutoff = day
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| anyhow!("Invalid date {}", date))?
            .and_utc()
            .timestamp();
        let removed = run_log.cleanup_before(cutoff)?;
        println!("Removed {} runs started before {}", removed, date);
        return Ok(());
    }

    history::print_history(&run_log, &mut std::io::stdout())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings(tmp: &TempDir) -> Settings {
        Settings {
            working_dir: tmp.path().to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_map_dataset_persists() {
        let tmp = TempDir::new().unwrap();
        let settings = settings(&tmp);
        cmd_map_dataset(&settings, Environment::Dev, "N:dataset:1", "N:dataset:9")
            .await
            .unwrap();

        let store = SqliteStateStore::open(&settings.state_db(Environment::Dev)).unwrap();
        assert_eq!(
            store.get_dataset_mapping("N:dataset:1").await.unwrap().as_deref(),
            Some("N:dataset:9")
        );
        assert!(!settings.state_db(Environment::Prod).exists());
    }

    #[tokio::test]
    async fn test_map_dataset_replaces_and_guards() {
        let store = MemoryStateStore::new();
        assert_eq!(map_dataset(&store, "N:dataset:1", "N:dataset:9").await.unwrap(), None);
        assert_eq!(
            map_dataset(&store, "N:dataset:1", "N:dataset:8").await.unwrap().as_deref(),
            Some("N:dataset:9")
        );
        // Remapping to the same id is a no-op
        assert_eq!(
            map_dataset(&store, "N:dataset:1", "N:dataset:8").await.unwrap().as_deref(),
            Some("N:dataset:8")
        );

        let err = map_dataset(&store, "N:dataset:2", "N:dataset:8").await.unwrap_err();
        assert!(err.to_string().contains("already mapped from dataset|N:dataset:1"));
        assert_eq!(store.get_dataset_mapping("N:dataset:2").await.unwrap(), None);
    }
}
