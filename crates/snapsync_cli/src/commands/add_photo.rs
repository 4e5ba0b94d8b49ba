//! Add photo command implementation.

use super::open_existing;
use snapsync_assets::{add_photo, Photo};
use snapsync_core::{Database, RecordId};
use std::fs;
use std::path::Path;

/// Reads `image`, downscales it and appends it with `text` to `collection`.
pub fn add_from_file(
    db: &Database,
    collection: &str,
    text: &str,
    image: &Path,
) -> Result<RecordId, Box<dyn std::error::Error>> {
    let bytes = fs::read(image)
        .map_err(|e| format!("Cannot read image {}: {e}", image.display()))?;
    Ok(add_photo(db, collection, text, &bytes)?)
}

/// Runs the add-photo command.
pub fn run(
    path: &Path,
    collection: &str,
    text: &str,
    image: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = open_existing(path)?;
    let id = add_from_file(&db, collection, text, image)?;

    let stored = db
        .get(&id)
        .map(|record| Photo::from_record(&record))
        .transpose()?;
    println!("Added photo {id} to '{collection}'");
    if let Some(photo) = stored {
        let size = photo.image_data.as_ref().map_or(0, Vec::len);
        println!("  Caption: {}", photo.text);
        println!("  PNG:     {size} bytes");
    }
    println!("  Sequence: {}", db.log().last_sequence());
    Ok(())
}
