//! Inspect command implementation.

use super::open_existing;
use serde::Serialize;
use snapsync_core::{Database, DatabaseStats};
use std::path::Path;

/// Database inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Database path.
    pub path: String,
    /// Counts and header values.
    #[serde(flatten)]
    pub stats: DatabaseStats,
    /// Entries not yet acknowledged by the remote authority.
    pub pending_upload: usize,
    /// Collection summaries (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collections: Option<Vec<CollectionSummary>>,
}

/// Member count for a single collection.
#[derive(Debug, Serialize)]
pub struct CollectionSummary {
    /// Collection name.
    pub name: String,
    /// Number of live members.
    pub members: usize,
}

/// Gathers the inspection numbers for an open database.
pub fn inspect(
    db: &Database,
    path: &Path,
    show_collections: bool,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let stats = db.stats()?;
    let pending_upload = db.pending_upload().count();
    let collections = show_collections.then(|| {
        db.store()
            .collection_ids()
            .into_iter()
            .map(|id| CollectionSummary {
                members: db.store().member_count(&id),
                name: id.to_string(),
            })
            .collect()
    });

    Ok(InspectResult {
        path: path.display().to_string(),
        stats,
        pending_upload,
        collections,
    })
}

/// Runs the inspect command.
pub fn run(
    path: &Path,
    show_collections: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = open_existing(path)?;
    let result = inspect(&db, path, show_collections)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text(&result),
    }
    Ok(())
}

fn print_text(result: &InspectResult) {
    let stats = &result.stats;
    println!("Snapsync Database Inspection");
    println!("============================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Durable Log:");
    println!("  Entries:        {}", stats.log_entries);
    println!("  Size:           {} bytes", stats.log_bytes);
    println!("  Last sequence:  {}", stats.last_sequence);
    println!("  Last compacted: {}", stats.last_compacted);
    println!();
    println!("Sync:");
    println!("  Ack watermark:  {}", stats.ack_watermark);
    println!("  Remote cursor:  {}", stats.remote_cursor);
    println!("  Pending upload: {}", result.pending_upload);
    println!();
    println!("Object Store:");
    println!("  Live records:   {}", stats.live_records);
    println!("  Tombstones:     {}", stats.tombstones);
    println!("  Collections:    {}", stats.collections);

    if let Some(ref collections) = result.collections {
        println!();
        println!("Collections:");
        for collection in collections {
            println!("  {}: {} members", collection.name, collection.members);
        }
    }
}
