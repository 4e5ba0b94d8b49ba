//! Verify command implementation.

use snapsync_core::{
    scan_log, Config, Database, DatabaseDir, LogHeader, LogScan, SequenceNumber, StoreSnapshot,
};
use snapsync_storage::InMemoryBackend;
use std::fs;
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Frame walk over the log, if it got that far.
    pub scan: Option<LogScan>,
    /// Records in the compaction snapshot.
    pub snapshot_records: usize,
    /// Live records after a full replay.
    pub live_records: usize,
    /// Problems that do not make the database unreadable.
    pub warnings: Vec<String>,
    /// Problems that do.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Checks header, snapshot and every log frame, then replays the whole log
/// into a scratch store. Nothing on disk is modified.
pub fn verify(path: &Path) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    if !DatabaseDir::exists(path) {
        return Err(format!("No database found at {}", path.display()).into());
    }
    let dir = DatabaseDir::open(path, false)?;
    let log = read_or_empty(&dir.log_path())?;
    let header = read_or_empty(&dir.header_path())?;
    let snapshot = read_or_empty(&dir.snapshot_path())?;

    let mut result = VerifyResult::default();

    let decoded_header = match LogHeader::decode(&header) {
        Ok(h) => Some(h),
        Err(e) => {
            result.errors.push(format!("Log header: {e}"));
            None
        }
    };

    match StoreSnapshot::decode(&snapshot) {
        Ok(Some(snap)) => {
            result.snapshot_records = snap.records.len();
            if let Some(h) = decoded_header {
                if snap.applied_through < h.last_compacted {
                    result.errors.push(format!(
                        "Snapshot covers {} but the header says {} was compacted",
                        snap.applied_through, h.last_compacted
                    ));
                }
            }
        }
        Ok(None) => {
            if decoded_header.is_some_and(|h| h.last_compacted > SequenceNumber::ZERO) {
                result
                    .errors
                    .push("Log was compacted but no snapshot exists".to_string());
            }
        }
        Err(e) => result.errors.push(format!("Snapshot: {e}")),
    }

    match scan_log(&InMemoryBackend::with_data(log.clone())) {
        Ok(scan) => {
            if scan.torn_bytes > 0 {
                result.warnings.push(format!(
                    "{} bytes of torn tail will be discarded on next open",
                    scan.torn_bytes
                ));
            }
            if let (Some(h), Some(first)) = (decoded_header, scan.first) {
                if first <= h.last_compacted {
                    result.errors.push(format!(
                        "Entry {first} is at or below the compaction point {}",
                        h.last_compacted
                    ));
                }
            }
            if let (Some(h), Some(last)) = (decoded_header, scan.last) {
                if h.ack_watermark > last.max(h.last_compacted) {
                    result.warnings.push(format!(
                        "Ack watermark {} is ahead of the newest entry {last}",
                        h.ack_watermark
                    ));
                }
            }
            result.scan = Some(scan);
        }
        Err(e) => result.errors.push(format!("Durable log: {e}")),
    }

    if result.is_ok() {
        match Database::open_with_backends(
            Box::new(InMemoryBackend::with_data(log)),
            Box::new(InMemoryBackend::with_data(header)),
            Box::new(InMemoryBackend::with_data(snapshot)),
            &Config::default(),
        ) {
            Ok(db) => result.live_records = db.stats()?.live_records,
            Err(e) => result.errors.push(format!("Replay: {e}")),
        }
    }

    Ok(result)
}

fn read_or_empty(path: &Path) -> std::io::Result<Vec<u8>> {
    if path.exists() {
        fs::read(path)
    } else {
        Ok(Vec::new())
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying database at {}", path.display());
    println!();

    let result = verify(path)?;

    if let Some(ref scan) = result.scan {
        println!("Durable log:");
        println!("  Frames:      {}", scan.entries);
        println!("  Local:       {}", scan.local_entries);
        println!("  Remote:      {}", scan.remote_entries);
        if let (Some(first), Some(last)) = (scan.first, scan.last) {
            println!("  Sequences:   {first}..={last}");
        }
        println!("  Valid bytes: {}", scan.valid_bytes);
    }
    println!("Snapshot records: {}", result.snapshot_records);
    if result.is_ok() {
        println!("Live records after replay: {}", result.live_records);
    }

    for warning in &result.warnings {
        println!("  Warning: {warning}");
    }
    for error in &result.errors {
        println!("  Error: {error}");
    }

    println!();
    if result.is_ok() {
        println!("✓ Database verification passed");
        Ok(())
    } else {
        println!("✗ Database verification failed");
        Err("Verification failed".into())
    }
}
