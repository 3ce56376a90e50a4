use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use serde::Serialize;
use snapvault::storage::{FileStorage, StorageEngine};
use snapvault::{Configuration, Database, ExecutionContext, Schema, spawn_change_watcher};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "snapvault")]
#[command(about = "Inspect and watch SnapVault files")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the header, versions, schema and object counts of a file
    Inspect {
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Print a line for every version committed to a file until Ctrl-C
    Watch {
        path: PathBuf,
        #[arg(long, default_value_t = 250)]
        interval_ms: u64,
    },
}

#[derive(Serialize)]
struct InspectReport {
    path: PathBuf,
    format_version: u16,
    written_at: String,
    writer: String,
    version: u64,
    durable_version: Option<u64>,
    schema_version: u64,
    schema: Schema,
    objects: BTreeMap<String, usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Inspect { path, json } => inspect(&path, json),
        Command::Watch { path, interval_ms } => watch(path, interval_ms).await,
    }
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let storage = FileStorage::new(path);
    let (header, snapshot) = storage
        .load_with_header()
        .with_context(|| format!("Failed to read '{}'", path.display()))?
        .ok_or_else(|| anyhow!("'{}' does not exist", path.display()))?;
    let durable_version = storage.durable_version()?;

    let report = InspectReport {
        path: path.to_path_buf(),
        format_version: header.format_version,
        written_at: header.written_at.to_rfc3339(),
        writer: header.writer.to_string(),
        version: snapshot.version().as_u64(),
        durable_version: durable_version.map(|version| version.as_u64()),
        schema_version: snapshot.schema_version(),
        schema: snapshot.schema().clone(),
        objects: snapshot.class_counts(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("File:            {}", report.path.display());
    println!("Format:          {}", report.format_version);
    println!("Written at:      {}", report.written_at);
    println!("Writer session:  {}", report.writer);
    println!("Version:         v{}", report.version);
    match report.durable_version {
        Some(stamp) => println!("Version stamp:   v{}", stamp),
        None => println!("Version stamp:   missing"),
    }
    println!("Schema version:  {}", report.schema_version);
    for class in report.schema.classes() {
        let count = report.objects.get(class.name()).copied().unwrap_or(0);
        println!("  {} ({} objects)", class.name(), count);
        for property in class.properties() {
            let null = if property.nullable { "" } else { " NOT NULL" };
            match &property.default {
                Some(default) => println!(
                    "    {}: {}{} DEFAULT {}",
                    property.name, property.data_type, null, default
                ),
                None => println!("    {}: {}{}", property.name, property.data_type, null),
            }
        }
    }
    Ok(())
}

async fn watch(path: PathBuf, interval_ms: u64) -> Result<()> {
    let context = ExecutionContext::new();
    let (db, _token, watcher) = {
        let _entered = context.enter();
        let db = Database::open(Configuration::new(&path).read_only(true))
            .with_context(|| format!("Failed to open '{}'", path.display()))?;
        let token = db.add_listener(|notification| {
            println!(
                "{:?} {} {}",
                notification.kind,
                notification.version,
                notification.path.display()
            );
        })?;
        let watcher = spawn_change_watcher(&db, Duration::from_millis(interval_ms))?;
        println!("Watching {} at {}", path.display(), db.latest_version()?);
        (db, token, watcher)
    };

    context
        .run_until(tokio::signal::ctrl_c())
        .await
        .context("Failed to wait for Ctrl-C")?;

    watcher.stop().await?;
    Ok(())
}
