//! Directory scan of the instance backup root (§4.1): one subdirectory per
//! backup, named by its base-36 start-time, each holding a `backup.control`
//! (and, for full backups, `backup_content.control`). A directory whose
//! control file is unreadable or corrupt still gets a placeholder entry
//! with `BackupStatus::Corrupt`, so an enumeration never silently drops a
//! backup the operator can see on disk.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::warn;

use crate::error::{EngineError, Result};
use crate::model::{Backup, BackupMode, BackupStatus};

use super::control_file;

pub const CONTROL_FILE_NAME: &str = "backup.control";
pub const CONTENT_FILE_NAME: &str = "backup_content.control";

pub fn backup_dir(instance_root: &Utf8Path, start_time: u64) -> Utf8PathBuf {
    instance_root.join(backup_utils::base36::encode(start_time))
}

pub fn control_file_path(instance_root: &Utf8Path, start_time: u64) -> Utf8PathBuf {
    backup_dir(instance_root, start_time).join(CONTROL_FILE_NAME)
}

pub fn content_file_path(instance_root: &Utf8Path, start_time: u64) -> Utf8PathBuf {
    backup_dir(instance_root, start_time).join(CONTENT_FILE_NAME)
}

/// Scan `instance_root`, returning every backup found, newest first, with
/// `Backup::parent` resolved per §4.1 ("a backup's parent is the nearest
/// preceding backup whose own chain is intact through to a FULL").
pub fn enumerate(instance_root: &Utf8Path) -> Result<Vec<Backup>> {
    let mut backups = Vec::new();

    let entries = match std::fs::read_dir(instance_root) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(backups),
        Err(e) => return Err(EngineError::io(instance_root, e)),
    };

    for entry in entries {
        let entry = entry.map_err(|e| EngineError::io(instance_root, e))?;
        if !entry.file_type().map_err(|e| EngineError::io(instance_root, e))?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let start_time = match backup_utils::base36::decode(&name) {
            Ok(t) => t,
            Err(_) => {
                warn!(dir = %name, "skipping non-backup entry in instance root");
                continue;
            }
        };

        let control_path = control_file_path(instance_root, start_time);
        let backup = match std::fs::read_to_string(&control_path) {
            Ok(text) => match control_file::parse(&text) {
                Ok(b) => {
                    if b.start_time != start_time {
                        warn!(
                            dir = %name,
                            control_start_time = b.start_time,
                            "backup directory name disagrees with its control file's start-time, trusting the control file"
                        );
                    }
                    b
                }
                Err(e) => {
                    warn!(%control_path, error = %e, "corrupt control file, synthesizing placeholder");
                    placeholder(start_time)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(%control_path, "missing control file, synthesizing placeholder");
                placeholder(start_time)
            }
            Err(e) => return Err(EngineError::io(&control_path, e)),
        };
        backups.push(backup);
    }

    // Descending by start-time: newest backup first, matching the order
    // operators expect from a catalog listing.
    backups.sort_by(|a, b| b.start_time.cmp(&a.start_time));

    resolve_parent_links(&mut backups);

    Ok(backups)
}

fn placeholder(start_time: u64) -> Backup {
    let mut backup = Backup::new(BackupMode::Full, start_time);
    backup.status = BackupStatus::Corrupt;
    backup
}

/// Resolve each non-FULL backup's `parent` index to the backup with a
/// matching `parent_backup_id`, falling back to the nearest older backup
/// in the list (the next index, since `backups` is sorted newest-first)
/// when `parent_backup_id` is absent — pre-link-tracking backups recorded
/// no explicit parent, so the best available proxy is backup order.
fn resolve_parent_links(backups: &mut [Backup]) {
    let start_times: Vec<u64> = backups.iter().map(|b| b.start_time).collect();
    for i in 0..backups.len() {
        if !backups[i].backup_mode.requires_parent() {
            continue;
        }
        match backups[i].parent_backup_id {
            Some(parent_id) => {
                // start_times is descending; binary_search_by needs the
                // reverse comparator to find an exact match.
                if let Ok(idx) = start_times.binary_search_by(|probe| parent_id.cmp(probe)) {
                    backups[i].parent = Some(idx);
                }
            }
            None => {
                if i + 1 < backups.len() {
                    backups[i].parent = Some(i + 1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    fn write_backup(root: &Utf8Path, backup: &Backup) {
        let dir = backup_dir(root, backup.start_time);
        std::fs::create_dir_all(&dir).unwrap();
        control_file::write(&control_file_path(root, backup.start_time), backup).unwrap();
    }

    #[test]
    fn enumerates_newest_first() {
        let dir = tempdir().unwrap();
        let root = Utf8PathBuf::from(dir.path().to_string());

        let mut older = Backup::new(BackupMode::Full, 1_000);
        older.status = BackupStatus::Ok;
        let mut newer = Backup::new(BackupMode::Full, 2_000);
        newer.status = BackupStatus::Ok;
        write_backup(&root, &older);
        write_backup(&root, &newer);

        let backups = enumerate(&root).unwrap();
        assert_eq!(backups.len(), 2);
        assert_eq!(backups[0].start_time, 2_000);
        assert_eq!(backups[1].start_time, 1_000);
    }

    #[test]
    fn missing_control_file_becomes_corrupt_placeholder() {
        let dir = tempdir().unwrap();
        let root = Utf8PathBuf::from(dir.path().to_string());
        std::fs::create_dir_all(backup_dir(&root, 5_000)).unwrap();

        let backups = enumerate(&root).unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].status, BackupStatus::Corrupt);
    }

    #[test]
    fn resolves_parent_link_by_id() {
        let dir = tempdir().unwrap();
        let root = Utf8PathBuf::from(dir.path().to_string());

        let mut full = Backup::new(BackupMode::Full, 1_000);
        full.status = BackupStatus::Ok;
        let mut delta = Backup::new(BackupMode::Delta, 2_000);
        delta.status = BackupStatus::Ok;
        delta.parent_backup_id = Some(1_000);
        write_backup(&root, &full);
        write_backup(&root, &delta);

        let backups = enumerate(&root).unwrap();
        let delta_entry = backups.iter().find(|b| b.start_time == 2_000).unwrap();
        let parent_idx = delta_entry.parent.expect("parent resolved");
        assert_eq!(backups[parent_idx].start_time, 1_000);
    }

    #[test]
    fn falls_back_to_positional_parent_when_link_is_absent() {
        let dir = tempdir().unwrap();
        let root = Utf8PathBuf::from(dir.path().to_string());

        let mut full = Backup::new(BackupMode::Full, 1_000);
        full.status = BackupStatus::Ok;
        let mut delta = Backup::new(BackupMode::Delta, 2_000);
        delta.status = BackupStatus::Ok;
        // No parent_backup_id recorded, as with a pre-link-tracking backup.
        write_backup(&root, &full);
        write_backup(&root, &delta);

        let backups = enumerate(&root).unwrap();
        let delta_entry = backups.iter().find(|b| b.start_time == 2_000).unwrap();
        let parent_idx = delta_entry.parent.expect("parent resolved positionally");
        assert_eq!(backups[parent_idx].start_time, 1_000);
    }

    #[test]
    fn nonexistent_root_is_an_empty_catalog() {
        let backups = enumerate(Utf8Path::new("/nonexistent/instance/root")).unwrap();
        assert!(backups.is_empty());
    }
}
