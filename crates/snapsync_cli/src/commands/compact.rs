//! Compact command implementation.

use super::open_existing;
use std::path::Path;

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let db = open_existing(path)?;
    let before = db.stats()?;
    let compactable = db.compactable_entries();

    println!("Compacting database at {}", path.display());
    println!();
    println!("Current state:");
    println!("  Log entries:    {}", before.log_entries);
    println!("  Log size:       {} bytes", before.log_bytes);
    println!("  Last compacted: {}", before.last_compacted);
    println!("  Ack watermark:  {}", before.ack_watermark);
    println!("  Compactable:    {compactable} entries");
    println!();

    if compactable == 0 {
        println!("Nothing to compact: no acknowledged entries remain in the log.");
        return Ok(());
    }

    if dry_run {
        println!("Dry run - no changes made");
        println!(
            "Would fold {compactable} entries (through sequence {}) into the snapshot",
            before.ack_watermark
        );
        return Ok(());
    }

    let dropped = db.compact()?;
    let after = db.stats()?;
    let saved = before.log_bytes.saturating_sub(after.log_bytes);

    println!("Compaction complete:");
    println!("  Entries dropped: {dropped}");
    println!("  Log entries:     {}", after.log_entries);
    println!("  Log size:        {} bytes", after.log_bytes);
    println!("  Space saved:     {saved} bytes");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapsync_core::{fields, Config, Database, SequenceNumber};

    #[test]
    fn dry_run_leaves_the_log_alone() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(dir.path(), Config::default()).unwrap();
            db.submit("photos", fields([("text", "Cat".into())])).unwrap();
            db.submit("photos", fields([("text", "Dog".into())])).unwrap();
            db.acknowledge(SequenceNumber::new(1)).unwrap();
        }

        run(dir.path(), true).unwrap();
        let db = open_existing(dir.path()).unwrap();
        assert_eq!(db.log().entry_count(), 2);
        drop(db);

        run(dir.path(), false).unwrap();
        let db = open_existing(dir.path()).unwrap();
        assert_eq!(db.log().entry_count(), 1);
        assert_eq!(db.current_items("photos").len(), 2);
    }
}
