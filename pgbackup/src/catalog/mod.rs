//! The Catalog Store (§4.1): on-disk layout, lockfile protocol, control
//! file and file list formats, and parent-chain resolution over an
//! enumerated instance.

pub mod chain;
pub mod control_file;
pub mod enumerate;
pub mod file_list;
pub mod lockfile;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::Result;
use crate::model::Backup;

pub const LOCKFILE_NAME: &str = "backup.pid";

/// `<catalog_root>/backups/<instance_name>`.
pub fn instance_root(catalog_root: &Utf8Path, instance_name: &str) -> Utf8PathBuf {
    catalog_root.join("backups").join(instance_name)
}

pub fn lockfile_path(backup_dir: &Utf8Path) -> Utf8PathBuf {
    backup_dir.join(LOCKFILE_NAME)
}

/// A loaded catalog: every backup known to an instance, newest first, with
/// parent links resolved. Thin wrapper so callers don't re-run
/// [`enumerate::enumerate`] for every chain query.
pub struct Catalog {
    pub instance_root: Utf8PathBuf,
    pub backups: Vec<Backup>,
}

impl Catalog {
    pub fn load(catalog_root: &Utf8Path, instance_name: &str) -> Result<Self> {
        let instance_root = instance_root(catalog_root, instance_name);
        let backups = enumerate::enumerate(&instance_root)?;
        Ok(Catalog {
            instance_root,
            backups,
        })
    }

    pub fn backup_dir(&self, start_time: u64) -> Utf8PathBuf {
        enumerate::backup_dir(&self.instance_root, start_time)
    }

    pub fn find_parent_full(&self, index: usize) -> Option<&Backup> {
        chain::find_parent_full(&self.backups, index).map(|i| &self.backups[i])
    }

    pub fn is_prolific(&self, index: usize) -> bool {
        chain::is_prolific(&self.backups, index)
    }

    /// Index of the most recent backup whose chain is fully intact (every
    /// ancestor OK/DONE) through a FULL root, used as the default
    /// `--parent` for incremental backups (§4.1). A chain that reaches a
    /// FULL root but passes through a non-{OK,DONE} ancestor is not
    /// offered as an automatic parent — callers that need that backup
    /// specifically must name it with an explicit `--parent`.
    pub fn latest_valid_backup(&self) -> Option<usize> {
        (0..self.backups.len()).find(|&i| {
            matches!(
                chain::scan_parent_chain(&self.backups, i),
                chain::ChainOutcome::IntactAllOk { .. }
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_root_joins_backups_and_name() {
        let root = instance_root(Utf8Path::new("/var/pgbackup"), "main");
        assert_eq!(root.as_str(), "/var/pgbackup/backups/main");
    }

    #[test]
    fn empty_catalog_has_no_latest_valid_backup() {
        let catalog = Catalog {
            instance_root: Utf8PathBuf::from("/nonexistent"),
            backups: Vec::new(),
        };
        assert!(catalog.latest_valid_backup().is_none());
    }
}
