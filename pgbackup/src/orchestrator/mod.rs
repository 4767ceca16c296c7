//! The Backup Orchestrator (§4.4): drives one backup session through
//! `INIT → CONNECTED → STARTED → LISTED → MAPPED → COPYING → STOPPED →
//! FINALIZED → (OK|ERROR)`. The main thread runs this state machine; file
//! workers and the stream worker run on their own threads, joined at
//! COPYING→STOPPED and STOPPED→FINALIZED respectively (§5).

mod handshake;
mod finalize;

pub use handshake::HandshakeError;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use tracing::{error, info, info_span, warn};

use crate::catalog::{self, lockfile, Catalog};
use crate::config::EngineConfig;
use crate::dbclient::DbClient;
use crate::error::{EngineError, Result};
use crate::model::{Backup, BackupMode, BackupStatus, FileEntry};
use crate::pagemap::PageMap;
use crate::stream_worker::StopSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Connected,
    Started,
    Listed,
    Mapped,
    Copying,
    Stopped,
    Finalized,
    Ok,
    Error,
}

/// Owns everything a session needs across its state transitions: the
/// in-progress `Backup` record, the resolved file list, the page map, and
/// the interrupt/stop signals shared with worker threads. Replaces the
/// source's process-global mutable state (§9 "Ownership and lifecycle").
pub struct BackupSession {
    pub state: SessionState,
    pub backup: Backup,
    pub instance_root: Utf8PathBuf,
    pub pgdata: Utf8PathBuf,
    pub files: Vec<FileEntry>,
    pub page_map: PageMap,
    pub interrupted: Arc<AtomicBool>,
    pub stop_signal: Arc<StopSignal>,
    parent: Option<Backup>,
}

impl BackupSession {
    pub fn new(mode: BackupMode, instance_root: Utf8PathBuf, pgdata: Utf8PathBuf) -> Self {
        let backup = Backup::new(mode, crate::model::unix_now());
        BackupSession {
            state: SessionState::Init,
            backup,
            instance_root,
            pgdata,
            files: Vec::new(),
            page_map: PageMap::new(),
            interrupted: Arc::new(AtomicBool::new(false)),
            stop_signal: StopSignal::new(),
            parent: None,
        }
    }

    fn backup_dir(&self) -> Utf8PathBuf {
        catalog::enumerate::backup_dir(&self.instance_root, self.backup.start_time)
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// INIT → CONNECTED (§4.4). Acquires the instance-level lock the
    /// moment the backup directory exists, so the at-exit cleanup of §4.4
    /// "Failure semantics" has something to clean up from here on.
    pub fn connect(
        &mut self,
        client: &mut dyn DbClient,
        config: &EngineConfig,
        min_server_version: &str,
    ) -> Result<()> {
        assert_eq!(self.state, SessionState::Init);

        backup_utils::crashsafe::create_dir_all(&self.backup_dir())
            .map_err(|e| EngineError::io(self.backup_dir(), e))?;
        let lock_outcome = lockfile::acquire(&catalog::lockfile_path(&self.backup_dir()))?;
        if lock_outcome == lockfile::LockOutcome::Busy {
            return Err(EngineError::Catalog(
                "another backup process holds the instance lock".to_string(),
            ));
        }

        handshake::verify_handshake(client, config, min_server_version, &mut self.backup)?;
        self.state = SessionState::Connected;
        Ok(())
    }

    /// CONNECTED → STARTED.
    pub fn start_backup(&mut self, client: &mut dyn DbClient, config: &EngineConfig) -> Result<()> {
        assert_eq!(self.state, SessionState::Connected);
        handshake::start_backup(client, config, &mut self.backup)?;
        self.backup.status = BackupStatus::Running;
        catalog::control_file::write(&self.control_file_path(), &self.backup)?;
        self.state = SessionState::Started;
        Ok(())
    }

    /// STARTED → LISTED.
    pub fn list_files(&mut self, config: &EngineConfig) -> Result<()> {
        assert_eq!(self.state, SessionState::Started);
        self.files = handshake::list_pgdata(&self.pgdata, &config.external_dirs, &self.backup)?;
        self.backup.external_dirs = config.external_dirs.clone();
        if self.files.len() < crate::config::defaults::MIN_PLAUSIBLE_PGDATA_ENTRIES {
            return Err(EngineError::Config(format!(
                "PGDATA has only {} entries, refusing implausible backup target",
                self.files.len()
            )));
        }
        self.state = SessionState::Listed;
        Ok(())
    }

    /// LISTED → MAPPED. For FULL/DELTA this is a no-op (no page-map
    /// needed); for PAGE/PTRACK it populates `self.page_map`.
    pub fn build_page_map(&mut self, client: &mut dyn DbClient, wal_dir: &Utf8PathBuf) -> Result<()> {
        assert_eq!(self.state, SessionState::Listed);
        match self.backup.backup_mode {
            BackupMode::Page | BackupMode::Ptrack => {
                handshake::build_page_map(client, &self.backup, &self.parent, &self.files, &self.page_map, wal_dir)?;
            }
            BackupMode::Full | BackupMode::Delta => {}
        }
        self.state = SessionState::Mapped;
        Ok(())
    }

    /// Attach the resolved parent backup (FULL/DELTA/PAGE/PTRACK chains
    /// all need it for LSN comparisons); called once before `start_backup`.
    pub fn set_parent(&mut self, parent: Option<Backup>) {
        if let Some(p) = &parent {
            self.backup.parent_backup_id = Some(p.start_time);
        }
        self.parent = parent;
    }

    fn control_file_path(&self) -> Utf8PathBuf {
        catalog::enumerate::control_file_path(&self.instance_root, self.backup.start_time)
    }

    fn content_file_path(&self) -> Utf8PathBuf {
        catalog::enumerate::content_file_path(&self.instance_root, self.backup.start_time)
    }

    /// MAPPED → COPYING: write the initial catalog snapshot, spawn
    /// `num_workers` file-copy threads, and join them. Each worker claims
    /// entries by index via a shared atomic cursor (§5 "per-entry atomic
    /// test-and-set flag").
    pub fn copy_files(&mut self, config: &EngineConfig) -> Result<()> {
        assert_eq!(self.state, SessionState::Mapped);

        catalog::file_list::write_all(&self.content_file_path(), &self.files)?;
        catalog::control_file::write(&self.control_file_path(), &self.backup)?;

        let cursor = AtomicUsize::new(0);
        let compress_alg = self.backup.compress_alg;
        let compress_level = self.backup.compress_level;
        let mode = self.backup.backup_mode;
        let parent_start_lsn = self.parent.as_ref().map(|p| p.start_lsn).unwrap_or(pg_ffi::Lsn::INVALID);
        let interrupted = &self.interrupted;
        let backup_dir = self.backup_dir();
        // Workers only read `FileEntry` (each copies its own file to its
        // catalog destination under `backup_dir`); the shared cursor hands
        // out disjoint indices, so an ordinary immutable borrow across the
        // scope suffices — no interior mutability needed on `self.files`.
        let files: &[FileEntry] = &self.files;
        let page_map = &self.page_map;

        let worker_errors: Vec<Option<EngineError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..config.num_workers().get())
                .map(|worker_idx| {
                    let cursor = &cursor;
                    let backup_dir = &backup_dir;
                    scope.spawn(move || {
                        let _span = info_span!("copy_worker", worker_idx).entered();
                        loop {
                            if interrupted.load(Ordering::SeqCst) {
                                return Some(EngineError::Interrupt);
                            }
                            let idx = cursor.fetch_add(1, Ordering::SeqCst);
                            if idx >= files.len() {
                                return None;
                            }
                            let entry = &files[idx];
                            if let Err(e) = copy_one_file(entry, backup_dir, mode, parent_start_lsn, compress_alg, compress_level, page_map) {
                                warn!(path = %entry.path, error = %e, "worker failed on file");
                                return Some(e);
                            }
                        }
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap_or(Some(EngineError::Protocol("worker panicked".into())))).collect()
        });

        if let Some(e) = worker_errors.into_iter().flatten().next() {
            self.backup.status = BackupStatus::Error;
            catalog::control_file::write(&self.control_file_path(), &self.backup)?;
            return Err(e);
        }

        self.state = SessionState::Copying;
        Ok(())
    }

    /// COPYING → STOPPED.
    pub fn stop_backup(&mut self, client: &mut dyn DbClient, config: &EngineConfig) -> Result<()> {
        assert_eq!(self.state, SessionState::Copying);
        finalize::stop_backup(client, config, &mut self.backup, &self.stop_signal)?;
        self.state = SessionState::Stopped;
        Ok(())
    }

    /// STOPPED → FINALIZED.
    pub fn finalize(&mut self, config: &EngineConfig, wal_dir: &Utf8PathBuf) -> Result<()> {
        assert_eq!(self.state, SessionState::Stopped);
        finalize::wait_and_finalize(config, wal_dir, &mut self.backup, &self.stop_signal)?;
        self.backup.status = BackupStatus::Done;
        catalog::file_list::write_all(&self.content_file_path(), &self.files)?;
        catalog::control_file::write(&self.control_file_path(), &self.backup)?;
        self.state = SessionState::Finalized;
        Ok(())
    }

    pub fn mark_ok(&mut self) -> Result<()> {
        assert_eq!(self.state, SessionState::Finalized);
        self.backup.status = BackupStatus::Ok;
        catalog::control_file::write(&self.control_file_path(), &self.backup)?;
        self.state = SessionState::Ok;
        lockfile::release(&catalog::lockfile_path(&self.backup_dir()))?;
        Ok(())
    }

    /// The at-exit cleanup of §4.4/§7: mark a RUNNING backup ERROR with an
    /// end-time, regardless of which state the session reached. Idempotent
    /// so it's safe to call unconditionally from a guard.
    pub fn cleanup_on_abort(&mut self) {
        if matches!(self.state, SessionState::Ok | SessionState::Error) {
            return;
        }
        error!(backup_id = %self.backup.id(), "session aborted, marking backup ERROR");
        self.backup.status = BackupStatus::Error;
        self.backup.end_time_ts = Some(chrono::Local::now());
        if let Err(e) = catalog::control_file::write(&self.control_file_path(), &self.backup) {
            error!(error = %e, "failed to persist ERROR status during cleanup");
        }
        let _ = lockfile::release(&catalog::lockfile_path(&self.backup_dir()));
        self.state = SessionState::Error;
    }
}

/// Build the catalog destination for one file entry: `<backup_dir>/database/<rel_path>`
/// for PGDATA entries (§4.4, spec layout "database/"), or
/// `<backup_dir>/external_directories/externaldir<N>/<rel_path>` for a file
/// pulled from the Nth configured external directory.
fn catalog_dest_path(backup_dir: &camino::Utf8Path, entry: &FileEntry) -> Utf8PathBuf {
    if entry.external_dir_num == 0 {
        backup_dir.join("database").join(&entry.rel_path)
    } else {
        backup_dir
            .join("external_directories")
            .join(format!("externaldir{}", entry.external_dir_num))
            .join(&entry.rel_path)
    }
}

fn copy_one_file(
    entry: &FileEntry,
    backup_dir: &camino::Utf8Path,
    mode: BackupMode,
    parent_start_lsn: pg_ffi::Lsn,
    compress_alg: crate::model::CompressAlg,
    compress_level: i32,
    page_map: &PageMap,
) -> Result<()> {
    let candidate_blocks = if entry.is_datafile {
        entry.forknum.and_then(|forknum| {
            page_map.blocks_for(crate::pagemap::RelKey {
                tblspcnode: entry.tblspcnode.unwrap_or(0),
                dbnode: entry.dbnode.unwrap_or(0),
                relnode: entry.relnode.unwrap_or(0),
                forknum,
            })
        })
    } else {
        None
    };

    let src = std::fs::File::open(&entry.path).map_err(|e| EngineError::io(&entry.path, e))?;
    let mut reader = std::io::BufReader::new(src);
    let dst_path = catalog_dest_path(backup_dir, entry);
    if let Some(parent) = dst_path.parent() {
        backup_utils::crashsafe::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
    }
    let mut dst = std::io::BufWriter::new(
        std::fs::File::create(&dst_path).map_err(|e| EngineError::io(&dst_path, e))?,
    );

    if entry.is_datafile {
        crate::datafile::copy_data_file(
            &mut reader,
            &mut dst,
            entry,
            mode,
            parent_start_lsn,
            candidate_blocks.as_deref(),
            compress_alg,
            compress_level,
            true,
        )?;
    } else {
        crate::datafile::copy_plain_file(&mut reader, &mut dst)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbclient::test_support::FakeDbClient;
    use camino_tempfile::tempdir;

    fn sample_config(root: &Utf8PathBuf) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.catalog_root = root.clone();
        config.num_workers = 2;
        config
    }

    #[test]
    fn connect_then_start_moves_through_states() {
        let dir = tempdir().unwrap();
        let root = Utf8PathBuf::from(dir.path().to_string());
        let instance_root = catalog::instance_root(&root, "main");
        let pgdata = Utf8PathBuf::from(dir.path().to_string());

        let mut session = BackupSession::new(BackupMode::Full, instance_root, pgdata);
        let mut client = FakeDbClient::default();
        let config = sample_config(&root);

        session.connect(&mut client, &config, "9.6").unwrap();
        assert_eq!(session.state, SessionState::Connected);

        session.start_backup(&mut client, &config).unwrap();
        assert_eq!(session.state, SessionState::Started);
        assert_eq!(session.backup.status, BackupStatus::Running);

        lockfile::release(&catalog::lockfile_path(&session.backup_dir())).unwrap();
    }

    #[test]
    fn cleanup_on_abort_marks_error_and_releases_lock() {
        let dir = tempdir().unwrap();
        let root = Utf8PathBuf::from(dir.path().to_string());
        let instance_root = catalog::instance_root(&root, "main");
        let pgdata = Utf8PathBuf::from(dir.path().to_string());

        let mut session = BackupSession::new(BackupMode::Full, instance_root, pgdata);
        let mut client = FakeDbClient::default();
        let config = sample_config(&root);
        session.connect(&mut client, &config, "9.6").unwrap();

        session.cleanup_on_abort();
        assert_eq!(session.backup.status, BackupStatus::Error);
        assert!(!catalog::lockfile_path(&session.backup_dir()).exists());
    }
}
