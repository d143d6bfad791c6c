//! Human-readable summaries for the terminal.

use deident_core::IdentitySchema;
use deident_runtime::RunReport;
use deident_store::{StabilityReport, StoreStats};

pub fn print_run_report(report: &RunReport) {
    let scrub = report.scrub_totals();

    println!("=== deident Run Report ===");
    println!();
    println!("Schema fingerprint: {}", report.schema_fingerprint);
    println!("Shards:             {}", report.identity.len());
    println!("Records:            {}", report.records());
    println!("Identities:         {} -> {}", report.identities_before, report.identities_after);
    println!("New identities:     {}", report.new_identities());
    println!("Slots filled:       {}", report.filled_slots());
    println!("Store retries:      {}", report.retries());
    println!("Substituted:        {}", scrub.substituted);
    println!("Removed:            {}", scrub.removed);
    println!("Null research ids:  {}", scrub.nulled);
    if let Some(stability) = &report.stability {
        println!(
            "Identity map:       stable ({} checked, {} extended)",
            stability.checked, stability.filled_since
        );
    }
    println!("Duration:           {}ms", report.duration_ms);
}

pub fn print_schema(schema: &IdentitySchema) {
    println!("=== deident Identity Schema ===");
    println!();
    println!("Fingerprint: {}", schema.fingerprint());
    for name in schema.table_names() {
        let Some(table) = schema.table(name) else {
            continue;
        };
        println!();
        println!("{}:", name);
        for rule in table.rules() {
            let types: Vec<String> = rule.types.iter().map(|t| t.to_string()).collect();
            let output = rule.output_column().unwrap_or_else(|| "(dropped)".into());
            println!(
                "  {:<24} [{}] slot={} -> {}",
                rule.column,
                types.join(", "),
                rule.slot,
                output
            );
        }
    }
}

pub fn print_stability(report: &StabilityReport, stats: &StoreStats) {
    println!("=== deident Identity Map ===");
    println!();
    println!("Path:               {}", stats.db_path);
    println!("Size:               {:.2} MB", stats.db_size_mb);
    println!("Identities:         {}", stats.total_identities);
    for (t, n) in &stats.filled {
        println!("  {:<18}{}", format!("{}:", t), n);
    }
    println!("Snapshot checked:   {}", report.checked);
    println!("Extended since:     {}", report.filled_since);
    println!();
    println!("Status: STABLE");
}
