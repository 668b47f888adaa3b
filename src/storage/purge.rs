//! Bulk removal of every recording and its index entry.

use std::path::Path;

use thiserror::Error;

use super::index::{IndexError, IndexStore};
use super::segment::StorageError;

#[derive(Debug, Error)]
pub enum PurgeError {
    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// What a purge removed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PurgeReport {
    /// Segment files deleted from disk.
    pub files_removed: usize,
    /// Index entries whose file was already gone.
    pub files_missing: usize,
}

/// Delete every indexed segment file and its entry, then the recordings tree
/// and the index file itself.
///
/// Files that are already gone are counted, not treated as errors.
pub fn purge(index_path: &Path, recordings_dir: &Path) -> Result<PurgeReport, PurgeError> {
    let mut report = PurgeReport::default();
    let store = IndexStore::open(index_path)?;

    for segment in store.all()? {
        let file = segment.file_path();
        match std::fs::remove_file(&file) {
            Ok(()) => report.files_removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("purge: {} already missing ({})", file.display(), segment.id);
                report.files_missing += 1;
            }
            Err(source) => {
                return Err(StorageError::Remove { path: file, source }.into());
            }
        }
        store.delete(segment.id)?;
    }

    match std::fs::remove_dir_all(recordings_dir) {
        Ok(()) => log::info!("purge: removed {}", recordings_dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(StorageError::Remove {
                path: recordings_dir.to_path_buf(),
                source,
            }
            .into())
        }
    }
    store.remove()?;

    log::info!(
        "purge: {} files removed, {} already missing",
        report.files_removed,
        report.files_missing
    );
    Ok(report)
}
