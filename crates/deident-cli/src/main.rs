//! deident — two-pass identity resolution and pseudonymization.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use deident_core::{DeidentConfig, IdentitySchema};
use deident_runtime::DeidentPipeline;
use deident_store::{IdentitySnapshot, IdentityStore, SqliteIdentityStore};

mod jsonl;
mod report;

fn resolve_data_dir() -> PathBuf {
    std::env::var("DEIDENT_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data"))
}

fn open_store(config: &DeidentConfig) -> anyhow::Result<SqliteIdentityStore> {
    SqliteIdentityStore::open(&config.data_paths.store)
        .map_err(|e| anyhow::anyhow!("Failed to open identity store: {}", e))
}

fn print_help() {
    println!("deident — identity resolution and pseudonymization");
    println!();
    println!("Usage: deident <command>");
    println!();
    println!("Commands:");
    println!("  run <schema> <input> <output>  Resolve identities, then scrub input into output");
    println!("  validate <schema>              Check an identity schema and show its layout");
    println!("  export <snapshot>              Write the identity map to a JSON Lines snapshot");
    println!("  verify <snapshot>              Check the identity map still honours a snapshot");
    println!("  help                           Show this help message");
    println!();
    println!("Input and output are JSON Lines of {{\"table\": ..., \"record\": {{...}}}}.");
    println!("The identity map lives under $DEIDENT_DATA_DIR (default ./data).");
}

async fn run(schema_path: &Path, input: &Path, output: &Path) -> anyhow::Result<()> {
    let data_dir = resolve_data_dir();
    info!("Data directory: {}", data_dir.display());
    let config = DeidentConfig::from_env(&data_dir)?;

    let schema = Arc::new(IdentitySchema::load(schema_path)?);
    let store: Arc<dyn IdentityStore> = Arc::new(open_store(&config)?);
    let rows = jsonl::read_rows(input)?;
    info!("Read {} rows from {}", rows.len(), input.display());

    let pipeline = DeidentPipeline::from_config(schema, store, &config);
    let out = pipeline
        .run_records(rows)
        .await
        .context("de-identification aborted; no output written")?;

    let written = jsonl::write_rows(
        output,
        out.shards.iter().flat_map(|s| s.records.iter()),
    )?;
    info!("Wrote {} rows to {}", written, output.display());

    report::print_run_report(&out.report);
    Ok(())
}

fn validate(schema_path: &Path) -> anyhow::Result<()> {
    let schema = IdentitySchema::load(schema_path)?;
    report::print_schema(&schema);
    Ok(())
}

fn export(snapshot_path: &Path) -> anyhow::Result<()> {
    let config = DeidentConfig::from_env(resolve_data_dir())?;
    let store = open_store(&config)?;
    let snapshot = IdentitySnapshot::capture(&store)?;
    snapshot.write_jsonl(snapshot_path)?;
    println!("Exported {} identities to {}", snapshot.len(), snapshot_path.display());
    Ok(())
}

fn verify(snapshot_path: &Path) -> anyhow::Result<()> {
    let config = DeidentConfig::from_env(resolve_data_dir())?;
    let store = open_store(&config)?;
    let snapshot = IdentitySnapshot::read_jsonl(snapshot_path)
        .with_context(|| format!("reading {}", snapshot_path.display()))?;
    let stability = snapshot.verify_against(&store)?;
    report::print_stability(&stability, &store.get_stats()?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("help");
    let arg = |i: usize| args.get(i).map(PathBuf::from);

    let result = match command {
        "run" => match (arg(2), arg(3), arg(4)) {
            (Some(schema), Some(input), Some(output)) => run(&schema, &input, &output).await,
            _ => usage("deident run <schema.json> <input.jsonl> <output.jsonl>"),
        },
        "validate" | "--validate" => match arg(2) {
            Some(schema) => validate(&schema),
            None => usage("deident validate <schema.json>"),
        },
        "export" => match arg(2) {
            Some(path) => export(&path),
            None => usage("deident export <snapshot.jsonl>"),
        },
        "verify" => match arg(2) {
            Some(path) => verify(&path),
            None => usage("deident verify <snapshot.jsonl>"),
        },
        "--help" | "-h" | "help" => {
            print_help();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}. Use 'deident help' for usage.", other);
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn usage(line: &str) -> anyhow::Result<()> {
    eprintln!("Usage: {}", line);
    std::process::exit(1);
}
