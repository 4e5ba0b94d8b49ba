//! List command implementation.

use super::open_existing;
use serde::Serialize;
use snapsync_assets::{decode_asset, Photo};
use snapsync_core::Database;
use std::path::Path;

/// One collection item for output.
#[derive(Debug, Serialize)]
pub struct ListItem {
    /// Record id.
    pub id: String,
    /// Record version.
    pub version: u64,
    /// Caption, if the item is a photo.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Stored PNG size in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_bytes: Option<usize>,
    /// Stored image dimensions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<(u32, u32)>,
}

/// Lists the live members of `collection` in order.
#[must_use]
pub fn list_items(db: &Database, collection: &str) -> Vec<ListItem> {
    db.current_items(collection)
        .iter()
        .map(|record| {
            let photo = Photo::from_record(record).ok();
            let image = photo.as_ref().and_then(|p| p.image_data.as_deref());
            ListItem {
                id: record.id.to_string(),
                version: record.version.as_u64(),
                text: photo.as_ref().map(|p| p.text.clone()),
                image_bytes: image.map(<[u8]>::len),
                dimensions: image
                    .and_then(|bytes| decode_asset(bytes).ok())
                    .map(|img| (img.width(), img.height())),
            }
        })
        .collect()
}

/// Runs the list command.
pub fn run(path: &Path, collection: &str, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let db = open_existing(path)?;
    let items = list_items(&db, collection);

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&items)?),
        _ => {
            println!("Collection '{collection}'");
            println!();
            if items.is_empty() {
                println!("No items.");
            }
            for (position, item) in items.iter().enumerate() {
                print!("{:>4}. {} v{}", position + 1, item.id, item.version);
                if let Some(ref text) = item.text {
                    print!("  {text:?}");
                }
                if let Some((w, h)) = item.dimensions {
                    print!("  {w}x{h}");
                }
                if let Some(bytes) = item.image_bytes {
                    print!("  {bytes} bytes");
                }
                println!();
            }
        }
    }
    Ok(())
}
