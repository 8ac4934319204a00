//! Rescan decision for pass folders.
//!
//! A decoder keeps writing into a pass folder for a while after the pass
//! ends. A folder is considered settled once nothing inside it has been
//! modified for [`RESCAN_QUIET_PERIOD`]; until then it stays flagged for
//! another look on the next incremental run.

use std::path::Path;
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

pub const RESCAN_QUIET_PERIOD: Duration = Duration::from_secs(30 * 60);

/// Most recent modification time of any regular file under `dir`.
/// Unreadable entries are skipped.
pub fn latest_modification(dir: &Path) -> Option<SystemTime> {
    WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok()?.modified().ok())
        .max()
}

/// `true` when there is nothing to judge by, when the latest change is in the
/// future, or when it happened no more than [`RESCAN_QUIET_PERIOD`] ago.
pub fn needs_rescan(latest: Option<SystemTime>, now: SystemTime) -> bool {
    match latest {
        None => true,
        Some(latest) => match now.duration_since(latest) {
            Ok(age) => age <= RESCAN_QUIET_PERIOD,
            Err(_) => true,
        },
    }
}

pub fn folder_needs_rescan(dir: &Path) -> bool {
    needs_rescan(latest_modification(dir), SystemTime::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::tempdir;

    fn backdate(path: &Path, age: Duration) {
        let when = SystemTime::now() - age;
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(when)
            .unwrap();
    }

    #[test]
    fn test_needs_rescan_threshold() {
        let now = SystemTime::now();
        assert!(needs_rescan(None, now));
        assert!(needs_rescan(Some(now - Duration::from_secs(60)), now));
        assert!(needs_rescan(Some(now - RESCAN_QUIET_PERIOD), now));
        assert!(!needs_rescan(Some(now - RESCAN_QUIET_PERIOD - Duration::from_secs(1)), now));
        assert!(!needs_rescan(Some(now - Duration::from_secs(31 * 60)), now));
        assert!(needs_rescan(Some(now + Duration::from_secs(60)), now));
    }

    #[test]
    fn test_empty_folder_needs_rescan() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("empty_sub")).unwrap();
        assert_eq!(latest_modification(dir.path()), None);
        assert!(folder_needs_rescan(dir.path()));
    }

    #[test]
    fn test_latest_file_decides() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old.png");
        let nested = dir.path().join("sub/new.png");
        fs::write(&old, "x").unwrap();
        fs::create_dir_all(nested.parent().unwrap()).unwrap();
        fs::write(&nested, "x").unwrap();

        backdate(&old, Duration::from_secs(2 * 3600));
        backdate(&nested, Duration::from_secs(3600));
        assert!(!folder_needs_rescan(dir.path()));

        backdate(&nested, Duration::from_secs(5));
        assert!(folder_needs_rescan(dir.path()));
    }
}
