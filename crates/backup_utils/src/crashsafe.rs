//! Crash-safe whole-file writes: write to `<path>.tmp`, `fsync`, `close`,
//! `rename` over `<path>`, then `fsync` the parent directory so the rename
//! itself is durable. On any failure the tmp file is removed so a retry
//! never trips over a stale `.tmp` sibling.

use std::fs::{self, File};
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};

pub fn tmp_path_for(path: &Utf8Path) -> Utf8PathBuf {
    path.with_extension(match path.extension() {
        Some(ext) => format!("{ext}.tmp"),
        None => "tmp".to_string(),
    })
}

/// Atomically replace the contents of `path` with `contents`. A concurrent
/// reader of `path` observes either the old content in full or the new
/// content in full, never a partial write.
pub fn overwrite(path: &Utf8Path, contents: &[u8]) -> io::Result<()> {
    let tmp_path = tmp_path_for(path);
    let result = (|| -> io::Result<()> {
        let mut file = File::create(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, path)?;
        fsync_parent(path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

fn fsync_parent(path: &Utf8Path) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    let dir = File::open(parent)?;
    dir.sync_all()
}

/// Create a directory (and, unlike `mkdir`, fsync its parent) so the
/// directory entry itself survives a crash right after creation.
pub fn create_dir(path: &Utf8Path) -> io::Result<()> {
    fs::create_dir(path)?;
    fsync_parent(path)
}

pub fn create_dir_all(path: &Utf8Path) -> io::Result<()> {
    fs::create_dir_all(path)?;
    fsync_parent(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    #[test]
    fn overwrite_replaces_content_and_cleans_tmp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup.control");
        overwrite(&path, b"status=RUNNING\n").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"status=RUNNING\n");
        assert!(!tmp_path_for(&path).exists());

        overwrite(&path, b"status=DONE\n").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"status=DONE\n");
    }

    #[test]
    fn tmp_path_appends_suffix() {
        let p = Utf8Path::new("/a/b/backup.control");
        assert_eq!(tmp_path_for(p), Utf8Path::new("/a/b/backup.control.tmp"));
        let p2 = Utf8Path::new("/a/b/backup_content");
        assert_eq!(tmp_path_for(p2), Utf8Path::new("/a/b/backup_content.tmp"));
    }
}
