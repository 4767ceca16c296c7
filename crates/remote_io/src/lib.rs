//! The File I/O Facade: every path the engine touches goes through this
//! trait so that data-file and catalog code is agnostic to whether the
//! bytes live on the machine running the backup (`Location::BackupHost`,
//! e.g. the catalog itself, or PGDATA when it's local) or across an
//! SSH-tunneled connection to the database host (`Location::DbHost`).
//!
//! Only the API surface is specified here. A real SSH-piped transport is a
//! separate concern (framing, multiplexing, authentication) and is not
//! part of this core — [`SshFileIo`] exists so the orchestrator can be
//! written against the trait today and wired to a transport later.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};

mod local;
mod ssh_stub;

pub use local::LocalFileIo;
pub use ssh_stub::SshFileIo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    BackupHost,
    DbHost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub len: u64,
    pub mode: u32,
    pub mtime_unix: i64,
    pub is_dir: bool,
    pub is_symlink: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirEntryKind {
    Regular,
    Dir,
    Symlink,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub kind: DirEntryKind,
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteIoError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("path not found: {0}")]
    NotFound(Utf8PathBuf),
    #[error("transport to {location:?} is not implemented in this core: {op}")]
    NotImplemented {
        location: Location,
        op: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, RemoteIoError>;

/// A handle to an open file. Mirrors the subset of POSIX file operations
/// the Data-File Engine and Catalog Store need: positional reads, appends,
/// and truncation, without forcing a particular cursor model on callers.
pub trait RemoteFile: Send {
    fn pread(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;
    fn pwrite(&mut self, offset: u64, buf: &[u8]) -> Result<usize>;
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    fn set_len(&mut self, len: u64) -> Result<()>;
    fn sync_all(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
}

impl OpenOptions {
    pub fn read_only() -> Self {
        OpenOptions {
            read: true,
            ..Default::default()
        }
    }

    pub fn read_write_create() -> Self {
        OpenOptions {
            read: true,
            write: true,
            create: true,
            ..Default::default()
        }
    }
}

/// Uniform file operations behind a [`Location`] tag. Implementations:
/// [`LocalFileIo`] for same-machine paths, [`SshFileIo`] as the specified
/// (but unimplemented) remote transport surface.
pub trait FileIo: Send + Sync {
    fn location(&self) -> Location;

    fn open(&self, path: &Utf8Path, opts: OpenOptions) -> Result<Box<dyn RemoteFile>>;
    fn read_to_vec(&self, path: &Utf8Path) -> Result<Vec<u8>>;
    fn write_file(&self, path: &Utf8Path, contents: &[u8]) -> Result<()>;

    fn stat(&self, path: &Utf8Path) -> Result<FileStat>;
    fn chmod(&self, path: &Utf8Path, mode: u32) -> Result<()>;
    fn mkdir(&self, path: &Utf8Path) -> Result<()>;
    fn mkdir_all(&self, path: &Utf8Path) -> Result<()>;
    fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<()>;
    fn unlink(&self, path: &Utf8Path) -> Result<()>;
    fn read_dir(&self, path: &Utf8Path) -> Result<Vec<DirEntry>>;
    fn read_link(&self, path: &Utf8Path) -> Result<Utf8PathBuf>;
}
