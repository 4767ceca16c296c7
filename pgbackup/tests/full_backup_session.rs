//! End-to-end exercise of the session state machine (§4.4) against a
//! synthetic PGDATA, without a live server. Lives in `tests/` rather than
//! a `#[cfg(test)]` module because it drives the public API the way a
//! caller of the library would, not internals of any single module.

use camino::Utf8PathBuf;

use pgbackup::config::EngineConfig;
use pgbackup::dbclient::{
    DbClient, PtrackBitmap, ServerGucs, StartBackupResult, StopBackupResult, TablespaceEntry,
};
use pgbackup::error::Result;
use pgbackup::model::BackupMode;
use pgbackup::orchestrator::{BackupSession, SessionState};

/// A minimal stand-in for a real server, local to this test: the crate's
/// own `FakeDbClient` lives behind `#[cfg(test)]` inside `dbclient`, which
/// isn't visible to an external integration test, so this one implements
/// the same public trait directly.
struct StubClient {
    start_lsn: pg_ffi::Lsn,
    stop_lsn: pg_ffi::Lsn,
}

impl DbClient for StubClient {
    fn server_version(&mut self) -> Result<String> {
        Ok("15.4".to_string())
    }
    fn system_identifier(&mut self) -> Result<u64> {
        Ok(42)
    }
    fn current_timeline(&mut self) -> Result<u32> {
        Ok(1)
    }
    fn is_in_recovery(&mut self) -> Result<bool> {
        Ok(false)
    }
    fn show_gucs(&mut self) -> Result<ServerGucs> {
        Ok(ServerGucs {
            block_size: pg_ffi::BLCKSZ as u32,
            wal_block_size: pg_ffi::XLOG_BLCKSZ as u32,
            data_checksums: true,
            ptrack_enable: false,
            checkpoint_timeout_secs: 300,
        })
    }
    fn start_backup(&mut self, _label: &str, _smooth: bool) -> Result<StartBackupResult> {
        Ok(StartBackupResult {
            start_lsn: self.start_lsn,
            timeline_id: 1,
        })
    }
    fn switch_wal(&mut self) -> Result<pg_ffi::Lsn> {
        Ok(self.start_lsn)
    }
    fn stop_backup(&mut self, _exclusive: bool) -> Result<StopBackupResult> {
        Ok(StopBackupResult {
            stop_lsn: self.stop_lsn,
            ..Default::default()
        })
    }
    fn last_replayed_lsn(&mut self) -> Result<pg_ffi::Lsn> {
        Ok(self.stop_lsn)
    }
    fn last_received_lsn(&mut self) -> Result<pg_ffi::Lsn> {
        Ok(self.stop_lsn)
    }
    fn list_tablespaces(&mut self) -> Result<Vec<TablespaceEntry>> {
        Ok(Vec::new())
    }
    fn create_restore_point(&mut self, _name: &str) -> Result<pg_ffi::Lsn> {
        Ok(self.stop_lsn)
    }
    fn ptrack_version(&mut self) -> Result<String> {
        Ok("2.4".to_string())
    }
    fn ptrack_enabled(&mut self) -> Result<bool> {
        Ok(false)
    }
    fn ptrack_init_for_db(&mut self, _dbnode: u32) -> Result<bool> {
        Ok(false)
    }
    fn ptrack_get_and_clear_db(&mut self, _dbnode: u32) -> Result<()> {
        Ok(())
    }
    fn ptrack_get_and_clear(&mut self, _t: u32, _d: u32, _r: u32) -> Result<PtrackBitmap> {
        Ok(None)
    }
    fn ptrack_control_lsn(&mut self) -> Result<pg_ffi::Lsn> {
        Ok(pg_ffi::Lsn::INVALID)
    }
}

/// Build a synthetic PGDATA past the plausibility floor
/// (`MIN_PLAUSIBLE_PGDATA_ENTRIES`): a handful of plain control files plus
/// enough `base/1/<relnode>` single-block relations to clear it.
fn make_pgdata(root: &Utf8PathBuf) -> Utf8PathBuf {
    let pgdata = root.join("pgdata");
    std::fs::create_dir_all(pgdata.join("base").join("1")).unwrap();
    std::fs::create_dir_all(pgdata.join("global")).unwrap();
    std::fs::write(pgdata.join("PG_VERSION"), b"15\n").unwrap();
    std::fs::write(pgdata.join("global").join("1262"), vec![0u8; pg_ffi::BLCKSZ]).unwrap();

    for relnode in 20000..20120u32 {
        let mut page = vec![0u8; pg_ffi::BLCKSZ];
        // Stamp a page LSN so DELTA-mode tests elsewhere have something to
        // compare against; irrelevant for the FULL-mode path exercised here.
        page[0..8].copy_from_slice(&0u64.to_le_bytes());
        std::fs::write(
            pgdata.join("base").join("1").join(relnode.to_string()),
            page,
        )
        .unwrap();
    }

    pgdata
}

#[test]
fn full_backup_session_runs_to_completion() {
    let dir = camino_tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let pgdata = make_pgdata(&root);

    let mut config = EngineConfig::default();
    config.catalog_root = root.clone();
    config.instance_name = "main".to_string();
    config.num_workers = 4;

    let instance_root = pgbackup::catalog::instance_root(&config.catalog_root, &config.instance_name);
    let mut session = BackupSession::new(BackupMode::Full, instance_root.clone(), pgdata);
    let mut client = StubClient {
        start_lsn: pg_ffi::Lsn(0x1_6000),
        stop_lsn: pg_ffi::Lsn(0x1_8000),
    };

    session.connect(&mut client, &config, "9.6").unwrap();
    assert_eq!(session.state, SessionState::Connected);

    session.start_backup(&mut client, &config).unwrap();
    assert_eq!(session.backup.start_lsn, pg_ffi::Lsn(0x1_6000));

    session.list_files(&config).unwrap();
    assert!(session.files.len() >= 120);

    let wal_dir = config.catalog_root.join("wal").join(&config.instance_name);
    session.build_page_map(&mut client, &wal_dir).unwrap();
    assert_eq!(session.state, SessionState::Mapped);

    session.copy_files(&config).unwrap();
    assert_eq!(session.state, SessionState::Copying);

    session.stop_backup(&mut client, &config).unwrap();
    assert_eq!(session.backup.stop_lsn, pg_ffi::Lsn(0x1_8000));

    session.finalize(&config, &wal_dir).unwrap();
    session.mark_ok().unwrap();
    assert_eq!(session.state, SessionState::Ok);

    // Every relation file copied under <backup_dir>/database/<rel_path>.
    let backup_dir = pgbackup::catalog::enumerate::backup_dir(&instance_root, session.backup.start_time);
    for entry in &session.files {
        if entry.is_datafile {
            let out = backup_dir.join("database").join(&entry.rel_path);
            assert!(out.exists(), "missing copy output for {}", entry.path);
        }
    }

    let catalog = pgbackup::catalog::Catalog::load(&config.catalog_root, &config.instance_name).unwrap();
    assert_eq!(catalog.backups.len(), 1);
    assert_eq!(catalog.backups[0].status, pgbackup::model::BackupStatus::Ok);
    assert_eq!(catalog.backups[0].start_time, session.backup.start_time);
}

#[test]
fn incremental_backup_requires_a_parent_in_the_catalog() {
    let dir = camino_tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();

    let catalog = pgbackup::catalog::Catalog::load(&root, "main").unwrap();
    assert!(catalog.backups.is_empty());
    assert!(catalog.latest_valid_backup().is_none());
    assert!(BackupMode::Delta.requires_parent());
}
