//! Checkpoint metadata persistence.
//!
//! Each checkpoint keeps a `metadata.json` next to its image files so
//! the registry can be re-populated after a daemon restart.

use crate::error::Result;
use crate::types::Checkpoint;
use std::fs;
use std::path::Path;

pub const METADATA_FILE: &str = "metadata.json";

/// Write checkpoint metadata into its image directory.
///
/// Removes any previous file first: after a clone the metadata may be a
/// hard link into the source directory, and writing through it would
/// corrupt the source's record.
pub fn save_checkpoint(checkpoint: &Checkpoint) -> Result<()> {
    let path = checkpoint.image_dir.join(METADATA_FILE);
    match fs::remove_file(&path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let json = serde_json::to_string_pretty(checkpoint)?;
    fs::write(&path, json)?;
    Ok(())
}

pub fn load_checkpoint(image_dir: &Path) -> Result<Option<Checkpoint>> {
    let path = image_dir.join(METADATA_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read_to_string(&path)?;
    let checkpoint: Checkpoint = serde_json::from_str(&data)?;
    Ok(Some(checkpoint))
}

/// Load every checkpoint under a container's checkpoints directory,
/// oldest first.
pub fn list_checkpoints(checkpoints_dir: &Path) -> Result<Vec<Checkpoint>> {
    if !checkpoints_dir.exists() {
        return Ok(Vec::new());
    }
    let mut checkpoints = Vec::new();
    for entry in fs::read_dir(checkpoints_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(cp) = load_checkpoint(&entry.path())? {
                checkpoints.push(cp);
            }
        }
    }
    checkpoints.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(checkpoints)
}
