//! Timestamped snapshot files next to the database, bounded in count.

use std::path::{Path, PathBuf};

use time::{macros::format_description, OffsetDateTime};
use tracing::{debug, warn};

const BACKUP_PREFIX: &str = "ember_backup_";
const BACKUP_SUFFIX: &str = ".db";

const STAMP_FORMAT: &[time::format_description::FormatItem<'static>] =
    format_description!("[year][month][day]_[hour][minute][second]");

/// Picks a fresh snapshot path; `VACUUM INTO` refuses to overwrite, so a
/// same-second collision gets a numeric suffix.
pub(crate) fn next_snapshot_path(backup_dir: &Path) -> PathBuf {
    let stamp = OffsetDateTime::now_utc()
        .format(STAMP_FORMAT)
        .unwrap_or_else(|_| "unknown".to_string());
    let base = backup_dir.join(format!("{BACKUP_PREFIX}{stamp}{BACKUP_SUFFIX}"));
    if !base.exists() {
        return base;
    }
    for n in 1.. {
        let candidate = backup_dir.join(format!("{BACKUP_PREFIX}{stamp}_{n}{BACKUP_SUFFIX}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("counter loop always yields a free path");
}

/// Snapshot files, newest first. The timestamped names sort lexicographically.
pub(crate) fn list_newest_first(backup_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(backup_dir) else {
        return Vec::new();
    };
    let mut snapshots: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with(BACKUP_PREFIX) && name.ends_with(BACKUP_SUFFIX))
                .unwrap_or(false)
        })
        .collect();
    snapshots.sort();
    snapshots.reverse();
    snapshots
}

/// Deletes snapshots beyond `retain`, oldest first. Best effort: a snapshot
/// that cannot be removed is logged and skipped.
pub(crate) fn prune(backup_dir: &Path, retain: usize) {
    for stale in list_newest_first(backup_dir).into_iter().skip(retain) {
        match std::fs::remove_file(&stale) {
            Ok(()) => debug!(path = %stale.display(), "pruned old backup"),
            Err(err) => warn!(path = %stale.display(), error = %err, "could not prune backup"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_orders_newest_first_and_prune_keeps_bound() {
        let dir = tempfile::tempdir().unwrap();
        for stamp in ["20240101_000000", "20240301_000000", "20240201_000000"] {
            std::fs::write(
                dir.path().join(format!("{BACKUP_PREFIX}{stamp}{BACKUP_SUFFIX}")),
                b"x",
            )
            .unwrap();
        }
        std::fs::write(dir.path().join("unrelated.txt"), b"x").unwrap();

        let listed = list_newest_first(dir.path());
        assert_eq!(listed.len(), 3);
        assert!(listed[0].to_string_lossy().contains("20240301"));

        prune(dir.path(), 2);
        let remaining = list_newest_first(dir.path());
        assert_eq!(remaining.len(), 2);
        assert!(remaining
            .iter()
            .all(|p| !p.to_string_lossy().contains("20240101")));
    }

    #[test]
    fn snapshot_path_avoids_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let first = next_snapshot_path(dir.path());
        std::fs::write(&first, b"x").unwrap();
        let second = next_snapshot_path(dir.path());
        assert_ne!(first, second);
    }
}
