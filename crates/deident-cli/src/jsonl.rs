//! JSON Lines row files: one `{"table": ..., "record": {...}}` per line.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use deident_core::Record;

#[derive(Debug, Serialize, Deserialize)]
struct Row {
    table: String,
    record: Record,
}

pub fn read_rows(path: &Path) -> anyhow::Result<Vec<(String, Record)>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut rows = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let row: Row = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: malformed row", path.display(), n + 1))?;
        rows.push((row.table, row.record));
    }
    Ok(rows)
}

/// Write rows to `path` via a temporary sibling, so a failed write never
/// leaves partial output behind.
pub fn write_rows<'a>(
    path: &Path,
    rows: impl IntoIterator<Item = &'a (String, Record)>,
) -> anyhow::Result<usize> {
    let tmp = path.with_extension("jsonl.tmp");
    let mut count = 0;
    {
        let mut out = BufWriter::new(
            File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?,
        );
        for (table, record) in rows {
            serde_json::to_writer(
                &mut out,
                &serde_json::json!({ "table": table, "record": record }),
            )?;
            out.write_all(b"\n")?;
            count += 1;
        }
        out.flush()?;
    }
    std::fs::rename(&tmp, path).with_context(|| format!("renaming to {}", path.display()))?;
    Ok(count)
}
