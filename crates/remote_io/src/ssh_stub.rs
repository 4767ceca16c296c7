use camino::{Utf8Path, Utf8PathBuf};

use crate::{
    DirEntry, FileIo, FileStat, Location, OpenOptions, RemoteFile, RemoteIoError, Result,
};

/// The specified-but-unimplemented remote transport: every [`FileIo`] call
/// for [`Location::DbHost`] is expected to be serialized over an
/// SSH-piped framed protocol to an agent running on the database host.
/// Wiring that protocol up is out of scope for this core; this type exists
/// so orchestrator code can depend on `dyn FileIo` today.
pub struct SshFileIo {
    location: Location,
}

impl SshFileIo {
    pub fn new(location: Location) -> Self {
        SshFileIo { location }
    }

    fn unimplemented(&self, op: &'static str) -> RemoteIoError {
        tracing::warn!(location = ?self.location, op, "SSH file transport not implemented in this core");
        RemoteIoError::NotImplemented {
            location: self.location,
            op,
        }
    }
}

impl FileIo for SshFileIo {
    fn location(&self) -> Location {
        self.location
    }

    fn open(&self, _path: &Utf8Path, _opts: OpenOptions) -> Result<Box<dyn RemoteFile>> {
        Err(self.unimplemented("open"))
    }

    fn read_to_vec(&self, _path: &Utf8Path) -> Result<Vec<u8>> {
        Err(self.unimplemented("read_to_vec"))
    }

    fn write_file(&self, _path: &Utf8Path, _contents: &[u8]) -> Result<()> {
        Err(self.unimplemented("write_file"))
    }

    fn stat(&self, _path: &Utf8Path) -> Result<FileStat> {
        Err(self.unimplemented("stat"))
    }

    fn chmod(&self, _path: &Utf8Path, _mode: u32) -> Result<()> {
        Err(self.unimplemented("chmod"))
    }

    fn mkdir(&self, _path: &Utf8Path) -> Result<()> {
        Err(self.unimplemented("mkdir"))
    }

    fn mkdir_all(&self, _path: &Utf8Path) -> Result<()> {
        Err(self.unimplemented("mkdir_all"))
    }

    fn rename(&self, _from: &Utf8Path, _to: &Utf8Path) -> Result<()> {
        Err(self.unimplemented("rename"))
    }

    fn unlink(&self, _path: &Utf8Path) -> Result<()> {
        Err(self.unimplemented("unlink"))
    }

    fn read_dir(&self, _path: &Utf8Path) -> Result<Vec<DirEntry>> {
        Err(self.unimplemented("read_dir"))
    }

    fn read_link(&self, _path: &Utf8Path) -> Result<Utf8PathBuf> {
        Err(self.unimplemented("read_link"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surfaces_not_implemented_with_location() {
        let io = SshFileIo::new(Location::DbHost);
        let err = io.mkdir(Utf8Path::new("/x")).unwrap_err();
        match err {
            RemoteIoError::NotImplemented { location, op } => {
                assert_eq!(location, Location::DbHost);
                assert_eq!(op, "mkdir");
            }
            _ => panic!("expected NotImplemented"),
        }
    }
}
