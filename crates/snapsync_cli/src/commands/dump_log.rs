//! Dump log command implementation.

use super::open_existing;
use serde::Serialize;
use snapsync_core::{Database, LogEntry, Mutation, SequenceNumber};
use std::path::Path;

/// Log entry representation for output.
#[derive(Debug, Serialize)]
pub struct LogEntryInfo {
    /// Sequence number.
    pub sequence: u64,
    /// `local` or `remote`.
    pub origin: String,
    /// Mutation kind.
    pub kind: &'static str,
    /// Number of mutations in the entry (more than one for a batch).
    pub parts: usize,
    /// Records the entry touches.
    pub records: Vec<String>,
    /// Collections the entry appends to.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub collections: Vec<String>,
}

impl From<&LogEntry> for LogEntryInfo {
    fn from(entry: &LogEntry) -> Self {
        let mut collections: Vec<String> = Vec::new();
        for part in entry.mutation.parts() {
            if let Mutation::AppendToCollection { collection, .. } = part {
                let name = collection.to_string();
                if !collections.contains(&name) {
                    collections.push(name);
                }
            }
        }
        Self {
            sequence: entry.sequence.as_u64(),
            origin: entry.origin.to_string(),
            kind: entry.mutation.kind(),
            parts: entry.mutation.parts().count(),
            records: entry
                .mutation
                .record_ids()
                .into_iter()
                .map(ToString::to_string)
                .collect(),
            collections,
        }
    }
}

/// Reads up to `limit` entries starting at sequence `from`.
pub fn read_entries(
    db: &Database,
    from: u64,
    limit: Option<usize>,
) -> Result<Vec<LogEntryInfo>, Box<dyn std::error::Error>> {
    let mut entries = Vec::new();
    for entry in db.replay_from(SequenceNumber::new(from)) {
        if limit.is_some_and(|limit| entries.len() >= limit) {
            break;
        }
        entries.push(LogEntryInfo::from(&entry?));
    }
    Ok(entries)
}

/// Runs the dump-log command.
pub fn run(
    path: &Path,
    from: u64,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = open_existing(path)?;
    let entries = read_entries(&db, from, limit)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            print_text_output(&entries, db.ack_watermark());
        }
    }

    Ok(())
}

fn print_text_output(entries: &[LogEntryInfo], watermark: SequenceNumber) {
    println!("Durable Log Entries");
    println!("===================");
    println!();

    if entries.is_empty() {
        println!("No entries found.");
        return;
    }

    for entry in entries {
        let acked = if entry.sequence <= watermark.as_u64() {
            "acked"
        } else {
            "pending"
        };
        print!(
            "[{:>6}] {:<6} {:<7} {:<8}",
            entry.sequence, entry.origin, acked, entry.kind
        );
        if entry.parts > 1 {
            print!(" parts={}", entry.parts);
        }
        print!(" records={}", entry.records.join(","));
        if !entry.collections.is_empty() {
            print!(" collections={}", entry.collections.join(","));
        }
        println!();
    }

    println!();
    println!("Total: {} entries", entries.len());
}
