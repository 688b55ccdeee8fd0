//! Removal of per-directory progress marker files

use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

/// Marker file left behind by dataset selection tools
pub const DEFAULT_MARKER: &str = "process.mark";

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub deleted: Vec<PathBuf>,
    pub failed: usize,
}

/// Recursively delete every file named `marker` below `root`
///
/// Failures are logged and counted; the walk always runs to completion.
pub fn delete_marker_files<P: AsRef<Path>>(root: P, marker: &str) -> CleanupReport {
    let root = root.as_ref();
    let mut report = CleanupReport::default();

    for entry in WalkDir::new(root) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "Skipping unreadable entry");
                report.failed += 1;
                continue;
            }
        };

        if !entry.file_type().is_file() || entry.file_name() != marker {
            continue;
        }

        let path = entry.into_path();
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(path = %path.display(), "Deleted marker");
                report.deleted.push(path);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to delete marker");
                report.failed += 1;
            }
        }
    }

    report
}
