//! The data model of §3: a `Backup` and the `FileEntry` records in its
//! file list, plus the small enums that appear in the control file.

use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use camino::Utf8PathBuf;
use pg_ffi::Lsn;
use serde::{Deserialize, Serialize};

/// Sentinel `write_size` meaning "file unchanged since the parent, bytes
/// not re-copied".
pub const BYTES_INVALID: i64 = -1;
/// Sentinel `write_size`/`size` meaning "source file disappeared mid-scan".
pub const FILE_NOT_FOUND: i64 = -2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupMode {
    Full,
    Page,
    Ptrack,
    Delta,
}

impl BackupMode {
    pub fn requires_parent(self) -> bool {
        !matches!(self, BackupMode::Full)
    }
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackupMode::Full => "FULL",
            BackupMode::Page => "PAGE",
            BackupMode::Ptrack => "PTRACK",
            BackupMode::Delta => "DELTA",
        };
        f.write_str(s)
    }
}

impl FromStr for BackupMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FULL" => Ok(BackupMode::Full),
            "PAGE" => Ok(BackupMode::Page),
            "PTRACK" => Ok(BackupMode::Ptrack),
            "DELTA" => Ok(BackupMode::Delta),
            other => Err(format!("unrecognized backup-mode {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupStatus {
    Invalid,
    Running,
    Ok,
    Done,
    Error,
    Merging,
    Deleting,
    Deleted,
    Orphan,
    Corrupt,
}

impl BackupStatus {
    /// A status for which `scan_parent_chain` considers the chain intact
    /// through this node.
    pub fn is_intact(self) -> bool {
        matches!(self, BackupStatus::Ok | BackupStatus::Done)
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackupStatus::Invalid => "INVALID",
            BackupStatus::Running => "RUNNING",
            BackupStatus::Ok => "OK",
            BackupStatus::Done => "DONE",
            BackupStatus::Error => "ERROR",
            BackupStatus::Merging => "MERGING",
            BackupStatus::Deleting => "DELETING",
            BackupStatus::Deleted => "DELETED",
            BackupStatus::Orphan => "ORPHAN",
            BackupStatus::Corrupt => "CORRUPT",
        };
        f.write_str(s)
    }
}

impl FromStr for BackupStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INVALID" => Ok(BackupStatus::Invalid),
            "RUNNING" => Ok(BackupStatus::Running),
            "OK" => Ok(BackupStatus::Ok),
            "DONE" => Ok(BackupStatus::Done),
            "ERROR" => Ok(BackupStatus::Error),
            "MERGING" => Ok(BackupStatus::Merging),
            "DELETING" => Ok(BackupStatus::Deleting),
            "DELETED" => Ok(BackupStatus::Deleted),
            "ORPHAN" => Ok(BackupStatus::Orphan),
            "CORRUPT" => Ok(BackupStatus::Corrupt),
            other => Err(format!("unrecognized status {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompressAlg {
    #[default]
    None,
    Zlib,
    Pglz,
}

impl fmt::Display for CompressAlg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompressAlg::None => "none",
            CompressAlg::Zlib => "zlib",
            CompressAlg::Pglz => "pglz",
        };
        f.write_str(s)
    }
}

impl FromStr for CompressAlg {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(CompressAlg::None),
            "zlib" => Ok(CompressAlg::Zlib),
            "pglz" => Ok(CompressAlg::Pglz),
            other => Err(format!("unrecognized compress-alg {other:?}")),
        }
    }
}

/// A single backup's metadata, as it lives in `backup.control`, plus the
/// in-memory-only parent link resolved after catalog enumeration.
#[derive(Debug, Clone)]
pub struct Backup {
    pub start_time: u64,
    pub backup_mode: BackupMode,
    pub status: BackupStatus,
    pub timeline_id: u32,
    pub start_lsn: Lsn,
    pub stop_lsn: Lsn,
    pub stop_lsn_exists: bool,
    pub start_time_ts: Option<chrono::DateTime<chrono::Local>>,
    pub end_time_ts: Option<chrono::DateTime<chrono::Local>>,
    pub recovery_time: Option<chrono::DateTime<chrono::Local>>,
    pub merge_time: Option<chrono::DateTime<chrono::Local>>,
    pub recovery_xid: u64,
    pub block_size: u32,
    pub xlog_block_size: u32,
    pub checksum_version: u32,
    pub program_version: String,
    pub server_version: String,
    pub compress_alg: CompressAlg,
    pub compress_level: i32,
    pub stream: bool,
    pub from_replica: bool,
    pub parent_backup_id: Option<u64>,
    pub primary_conninfo: Option<String>,
    pub external_dirs: Vec<Utf8PathBuf>,
    pub data_bytes: Option<i64>,
    pub wal_bytes: Option<i64>,

    /// Resolved post-enumeration; `None` for FULL or before resolution.
    pub parent: Option<usize>,
}

impl Backup {
    pub fn new(backup_mode: BackupMode, start_time: u64) -> Self {
        Backup {
            start_time,
            backup_mode,
            status: BackupStatus::Invalid,
            timeline_id: 0,
            start_lsn: Lsn::INVALID,
            stop_lsn: Lsn::INVALID,
            stop_lsn_exists: false,
            start_time_ts: None,
            end_time_ts: None,
            recovery_time: None,
            merge_time: None,
            recovery_xid: 0,
            block_size: pg_ffi::BLCKSZ as u32,
            xlog_block_size: pg_ffi::XLOG_BLCKSZ as u32,
            checksum_version: 0,
            program_version: env!("CARGO_PKG_VERSION").to_string(),
            server_version: String::new(),
            compress_alg: CompressAlg::None,
            compress_level: 1,
            stream: false,
            from_replica: false,
            parent_backup_id: None,
            primary_conninfo: None,
            external_dirs: Vec::new(),
            data_bytes: None,
            wal_bytes: None,
            parent: None,
        }
    }

    pub fn id(&self) -> String {
        backup_utils::base36::encode(self.start_time)
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Dir,
    Symlink,
}

/// One line of `backup_content.control`: everything the restore path needs
/// to know about a single source-tree entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: Utf8PathBuf,
    #[serde(skip)]
    pub rel_path: Utf8PathBuf,
    pub size: i64,
    pub mode: u32,
    #[serde(skip)]
    pub kind: FileKind,
    pub is_datafile: bool,
    pub is_cfs: bool,
    pub crc: u32,
    #[serde(default = "default_write_size")]
    pub write_size: i64,
    pub compress_alg: CompressAlg,
    pub external_dir_num: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segno: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked: Option<Utf8PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_blocks: Option<u32>,
    #[serde(skip)]
    pub dbnode: Option<u32>,
    #[serde(skip)]
    pub relnode: Option<u32>,
    #[serde(skip)]
    pub forknum: Option<u8>,
    #[serde(skip)]
    pub tblspcnode: Option<u32>,
    #[serde(skip)]
    pub exists_in_prev: bool,
    #[serde(skip)]
    pub pagemap_absent: bool,
}

fn default_write_size() -> i64 {
    BYTES_INVALID
}

impl Default for FileKind {
    fn default() -> Self {
        FileKind::Regular
    }
}

impl FileEntry {
    pub fn new_regular(path: Utf8PathBuf, rel_path: Utf8PathBuf, external_dir_num: usize) -> Self {
        FileEntry {
            path,
            rel_path,
            size: 0,
            mode: 0o600,
            kind: FileKind::Regular,
            is_datafile: false,
            is_cfs: false,
            crc: 0,
            write_size: BYTES_INVALID,
            compress_alg: CompressAlg::None,
            external_dir_num,
            segno: None,
            linked: None,
            n_blocks: None,
            dbnode: None,
            relnode: None,
            forknum: None,
            tblspcnode: None,
            exists_in_prev: false,
            pagemap_absent: false,
        }
    }
}
