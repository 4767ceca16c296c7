use std::fs::{self, OpenOptions as StdOpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{FileExt, MetadataExt, PermissionsExt};

use camino::{Utf8Path, Utf8PathBuf};

use crate::{
    DirEntry, DirEntryKind, FileIo, FileStat, Location, OpenOptions, RemoteFile, RemoteIoError,
    Result,
};

/// Direct pass-through to the local filesystem. Used for the backup
/// catalog itself, and for PGDATA when the database runs on the same host
/// as the backup engine.
pub struct LocalFileIo {
    location: Location,
}

impl LocalFileIo {
    pub fn new(location: Location) -> Self {
        LocalFileIo { location }
    }
}

struct LocalFile(fs::File);

impl RemoteFile for LocalFile {
    fn pread(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        Ok(self.0.read_at(buf, offset)?)
    }

    fn pwrite(&mut self, offset: u64, buf: &[u8]) -> Result<usize> {
        Ok(self.0.write_at(buf, offset)?)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.0.seek(SeekFrom::End(0))?;
        self.0.write_all(buf)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(self.0.flush()?)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        Ok(self.0.set_len(len)?)
    }

    fn sync_all(&mut self) -> Result<()> {
        Ok(self.0.sync_all()?)
    }
}

impl FileIo for LocalFileIo {
    fn location(&self) -> Location {
        self.location
    }

    fn open(&self, path: &Utf8Path, opts: OpenOptions) -> Result<Box<dyn RemoteFile>> {
        let file = StdOpenOptions::new()
            .read(opts.read)
            .write(opts.write)
            .create(opts.create)
            .truncate(opts.truncate)
            .open(path)
            .map_err(|e| map_not_found(e, path))?;
        Ok(Box::new(LocalFile(file)))
    }

    fn read_to_vec(&self, path: &Utf8Path) -> Result<Vec<u8>> {
        let mut file = fs::File::open(path).map_err(|e| map_not_found(e, path))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn write_file(&self, path: &Utf8Path, contents: &[u8]) -> Result<()> {
        fs::write(path, contents)?;
        Ok(())
    }

    fn stat(&self, path: &Utf8Path) -> Result<FileStat> {
        let meta = fs::symlink_metadata(path).map_err(|e| map_not_found(e, path))?;
        Ok(FileStat {
            len: meta.len(),
            mode: meta.mode(),
            mtime_unix: meta.mtime(),
            is_dir: meta.is_dir(),
            is_symlink: meta.file_type().is_symlink(),
        })
    }

    fn chmod(&self, path: &Utf8Path, mode: u32) -> Result<()> {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    fn mkdir(&self, path: &Utf8Path) -> Result<()> {
        fs::create_dir(path)?;
        Ok(())
    }

    fn mkdir_all(&self, path: &Utf8Path) -> Result<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<()> {
        fs::rename(from, to)?;
        Ok(())
    }

    fn unlink(&self, path: &Utf8Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }

    fn read_dir(&self, path: &Utf8Path) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path).map_err(|e| map_not_found(e, path))? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let kind = if file_type.is_symlink() {
                DirEntryKind::Symlink
            } else if file_type.is_dir() {
                DirEntryKind::Dir
            } else {
                DirEntryKind::Regular
            };
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind,
            });
        }
        Ok(entries)
    }

    fn read_link(&self, path: &Utf8Path) -> Result<Utf8PathBuf> {
        let target = fs::read_link(path)?;
        Utf8PathBuf::from_path_buf(target)
            .map_err(|p| RemoteIoError::NotFound(Utf8PathBuf::from(p.to_string_lossy().as_ref())))
    }
}

fn map_not_found(e: std::io::Error, path: &Utf8Path) -> RemoteIoError {
    if e.kind() == std::io::ErrorKind::NotFound {
        RemoteIoError::NotFound(path.to_path_buf())
    } else {
        RemoteIoError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    #[test]
    fn round_trips_a_file() {
        let dir = tempdir().unwrap();
        let io = LocalFileIo::new(Location::BackupHost);
        let path = Utf8PathBuf::from(dir.path().join("f").to_string());
        io.write_file(&path, b"hello").unwrap();
        assert_eq!(io.read_to_vec(&path).unwrap(), b"hello");
        let stat = io.stat(&path).unwrap();
        assert_eq!(stat.len, 5);
        assert!(!stat.is_dir);
    }

    #[test]
    fn missing_file_maps_to_not_found() {
        let dir = tempdir().unwrap();
        let io = LocalFileIo::new(Location::BackupHost);
        let path = Utf8PathBuf::from(dir.path().join("missing").to_string());
        assert!(matches!(
            io.read_to_vec(&path),
            Err(RemoteIoError::NotFound(_))
        ));
    }

    #[test]
    fn pread_reads_at_offset() {
        let dir = tempdir().unwrap();
        let io = LocalFileIo::new(Location::BackupHost);
        let path = Utf8PathBuf::from(dir.path().join("f").to_string());
        io.write_file(&path, b"0123456789").unwrap();
        let mut file = io.open(&path, OpenOptions::read_only()).unwrap();
        let mut buf = [0u8; 4];
        let n = file.pread(3, &mut buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"3456");
    }
}
