//! CLI command implementations.

pub mod add_photo;
pub mod compact;
pub mod dump_log;
pub mod inspect;
pub mod list;
pub mod sync_demo;
pub mod verify;

use snapsync_core::{Config, Database};
use std::path::Path;

/// Opens an existing database; never creates one.
pub fn open_existing(path: &Path) -> Result<Database, Box<dyn std::error::Error>> {
    if !snapsync_core::DatabaseDir::exists(path) {
        return Err(format!("No database found at {}", path.display()).into());
    }
    Ok(Database::open(path, Config::default().create_if_missing(false))?)
}
