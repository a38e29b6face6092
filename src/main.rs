// Only compile UI module when TUI feature is enabled
#[cfg(feature = "tui")]
mod ui;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use entity_consolidation::{
    load_snapshot, open_database, write_snapshot, ConsolidationEngine, RunContext, StrategyRegistry,
};

#[derive(Parser)]
#[command(name = "consolidate", version, about = "Consolidate multi-source entity records into golden records")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a snapshot directory, consolidate it and store the result
    Run {
        /// Snapshot directory (sources/, xref/, associations/, fx_rates.csv)
        #[arg(long)]
        input: PathBuf,

        /// SQLite store
        #[arg(long, env = "CONSOLIDATION_DB")]
        db: PathBuf,

        /// Strategy registry JSON; built-in defaults when omitted
        #[arg(long)]
        config: Option<PathBuf>,

        /// Snapshot date used for ages and FX lookups (YYYY-MM-DD); today when omitted
        #[arg(long)]
        as_of: Option<NaiveDate>,

        /// Run identifier recorded in the store; a fresh UUID when omitted
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Write the built-in strategy registry as JSON
    ExportConfig {
        #[arg(long)]
        out: PathBuf,
    },

    /// Browse the stored snapshot and its review queue
    Review {
        #[arg(long, env = "CONSOLIDATION_DB")]
        db: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Run {
            input,
            db,
            config,
            as_of,
            run_id,
        } => run_consolidation(&input, &db, config.as_deref(), as_of, run_id),
        Command::ExportConfig { out } => export_config(&out),
        Command::Review { db } => run_review(&db),
    }
}

fn run_consolidation(
    input: &Path,
    db_path: &Path,
    config: Option<&Path>,
    as_of: Option<NaiveDate>,
    run_id: Option<String>,
) -> Result<()> {
    let registry = match config {
        Some(path) => StrategyRegistry::from_file(path)
            .with_context(|| format!("Failed to load strategy registry {}", path.display()))?,
        None => StrategyRegistry::with_defaults(),
    };

    let as_of = as_of.unwrap_or_else(|| Utc::now().date_naive());
    let run_id = run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    info!(run_id = %run_id, as_of = %as_of, input = %input.display(), "starting consolidation run");

    // 1. Load snapshot
    let loaded = load_snapshot(input, &registry)?;

    // 2. Consolidate
    let engine = ConsolidationEngine::new(registry, loaded.fx).context("Invalid strategy registry")?;
    let output = engine.run(&loaded.input, &RunContext::new(as_of));

    // 3. Store and diff against the previous snapshot
    let mut conn = open_database(db_path)?;
    let changes = write_snapshot(&mut conn, &output, &run_id, as_of)?;

    let summary = &output.summary;
    info!(
        entities = summary.entity_count(),
        associations = summary.association_count(),
        orphans = summary.orphan_entities,
        flagged = summary.flagged_entities,
        dropped_records = summary.dropped_records,
        ambiguous_keys = summary.ambiguous_keys,
        new = changes.new,
        changed = changes.changed,
        unchanged = changes.unchanged,
        removed = changes.removed,
        "consolidation run complete"
    );

    Ok(())
}

fn export_config(out: &Path) -> Result<()> {
    StrategyRegistry::with_defaults()
        .save(out)
        .with_context(|| format!("Failed to write {}", out.display()))?;
    info!(path = %out.display(), "default strategy registry written");
    Ok(())
}

#[cfg(feature = "tui")]
fn run_review(db_path: &Path) -> Result<()> {
    if !db_path.exists() {
        anyhow::bail!(
            "Database not found at {}; run `consolidate run` first",
            db_path.display()
        );
    }

    let conn = open_database(db_path)?;
    let mut app = ui::App::load(&conn)?;
    ui::run_ui(&mut app)
}

#[cfg(not(feature = "tui"))]
fn run_review(_db_path: &Path) -> Result<()> {
    anyhow::bail!("Review mode not available; rebuild with --features tui")
}
