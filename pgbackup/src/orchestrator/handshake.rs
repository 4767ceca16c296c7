//! INIT→CONNECTED, CONNECTED→STARTED, STARTED→LISTED, and the PAGE/PTRACK
//! half of LISTED→MAPPED (§4.4). Split out of `mod.rs` because these steps
//! share no state beyond the `Backup` record being built up.

use std::collections::{HashMap, HashSet};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

use pg_ffi::Lsn;

use crate::config::EngineConfig;
use crate::datafile::classify::{classify_path, has_cfs_marker, keep_fork, RelId};
use crate::dbclient::DbClient;
use crate::error::{EngineError, Result};
use crate::model::{Backup, BackupMode, FileEntry};
use crate::pagemap::{build_page_map_from_wal, PageMap, RelKey, WalBlockRef};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("server version {found} is older than the minimum supported {minimum}")]
    ServerTooOld { found: String, minimum: String },
    #[error("page size mismatch: server reports {0}, compiled for {1}")]
    PageSizeMismatch(u32, usize),
}

pub fn verify_handshake(
    client: &mut dyn DbClient,
    _config: &EngineConfig,
    min_server_version: &str,
    backup: &mut Backup,
) -> Result<()> {
    let version = client.server_version()?;
    if version_less_than(&version, min_server_version) {
        return Err(EngineError::Config(
            HandshakeError::ServerTooOld {
                found: version,
                minimum: min_server_version.to_string(),
            }
            .to_string(),
        ));
    }
    backup.server_version = version;

    let gucs = client.show_gucs()?;
    if gucs.block_size != pg_ffi::BLCKSZ as u32 {
        return Err(EngineError::Config(
            HandshakeError::PageSizeMismatch(gucs.block_size, pg_ffi::BLCKSZ).to_string(),
        ));
    }
    backup.checksum_version = gucs.data_checksums as u32;
    backup.from_replica = client.is_in_recovery()?;
    let _ = client.system_identifier()?;
    Ok(())
}

fn version_less_than(found: &str, minimum: &str) -> bool {
    parse_version_tuple(found) < parse_version_tuple(minimum)
}

fn parse_version_tuple(v: &str) -> (u32, u32) {
    let mut it = v.split(|c: char| !c.is_ascii_digit()).filter(|s| !s.is_empty());
    let major = it.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let minor = it.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    (major, minor)
}

pub fn start_backup(client: &mut dyn DbClient, config: &EngineConfig, backup: &mut Backup) -> Result<()> {
    let label = format!("pgbackup_{}", backup.id());
    let result = client.start_backup(&label, false)?;
    backup.start_lsn = result.start_lsn;
    backup.timeline_id = result.timeline_id;

    if backup.backup_mode == BackupMode::Page {
        client.switch_wal()?;
    }

    backup.compress_alg = config.compress_alg;
    backup.compress_level = config.compress_level;
    Ok(())
}

/// STARTED → LISTED: walk PGDATA and every configured external directory
/// in sorted order, classify relation files, and drop temp relations and
/// non-init forks of unlogged relations.
pub fn list_pgdata(pgdata: &Utf8Path, external_dirs: &[Utf8PathBuf], backup: &Backup) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    entries.extend(list_one_tree(pgdata, 0)?);
    for (idx, dir) in external_dirs.iter().enumerate() {
        entries.extend(list_one_tree(dir, idx + 1)?);
    }

    info!(count = entries.len(), backup_id = %backup.id(), "PGDATA listed");
    Ok(entries)
}

/// Walk one directory tree (PGDATA or an external directory), tagging
/// every entry with `external_dir_num` (0 for PGDATA).
fn list_one_tree(root: &Utf8Path, external_dir_num: usize) -> Result<Vec<FileEntry>> {
    let mut paths: Vec<Utf8PathBuf> = Vec::new();
    for entry in WalkDir::new(root.as_std_path()) {
        let entry = entry.map_err(|e| EngineError::Io {
            path: root.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        })?;
        if entry.file_type().is_dir() {
            continue;
        }
        let path = Utf8PathBuf::from_path_buf(entry.path().to_path_buf())
            .map_err(|p| EngineError::Config(format!("non-UTF-8 path: {}", p.display())))?;
        paths.push(path);
    }
    paths.sort();

    // Unlogged relations have no durable main/fsm/vm fork, but PostgreSQL
    // always writes an "_init" fork for them and never writes one for a
    // permanent relation — a first pass collects every relnode with an
    // init fork on disk, so the classification pass below can tell the
    // two apart without a `pg_class` round-trip per file (§4.4).
    let mut unlogged_rels: HashSet<RelId> = HashSet::new();
    for path in &paths {
        let rel_path = path.strip_prefix(root).unwrap_or(path).to_path_buf();
        if let Some(class) = classify_path(&rel_path) {
            if class.forknum == pg_ffi::INIT_FORKNUM {
                unlogged_rels.insert(class.rel_id());
            }
        }
    }

    let mut cfs_dirs: HashMap<Utf8PathBuf, bool> = HashMap::new();
    let mut entries = Vec::with_capacity(paths.len());

    for path in paths {
        let rel_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let meta = std::fs::symlink_metadata(&path).map_err(|e| EngineError::io(&path, e))?;

        let mut entry = FileEntry::new_regular(path.clone(), rel_path.clone(), external_dir_num);
        entry.size = meta.len() as i64;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            entry.mode = meta.permissions().mode();
        }

        if let Some(class) = classify_path(&rel_path) {
            if class.is_temp {
                continue;
            }
            let relation_is_unlogged = unlogged_rels.contains(&class.rel_id());
            if !keep_fork(class.forknum, relation_is_unlogged) {
                continue;
            }
            entry.is_datafile = true;
            entry.tblspcnode = Some(class.tblspcnode);
            entry.dbnode = Some(class.dbnode);
            entry.relnode = Some(class.relnode);
            entry.forknum = Some(class.forknum);
            entry.segno = Some(class.segno);
            entry.n_blocks = Some((entry.size / pg_ffi::BLCKSZ as i64).max(0) as u32);

            if let Some(dir) = rel_path.parent() {
                let is_cfs = *cfs_dirs
                    .entry(dir.to_path_buf())
                    .or_insert_with(|| has_cfs_marker(&root.join(dir)));
                entry.is_cfs = is_cfs;
            }
        }

        entries.push(entry);
    }

    Ok(entries)
}

/// LISTED → MAPPED, PAGE/PTRACK branch. PAGE mode needs the parent's
/// start-LSN to bound the WAL scan; PTRACK mode fetches a per-relation
/// bitmap per file. Deep WAL record decoding is out of scope (§1); the
/// block-reference extraction the page map needs is not, so `wal_dir` is
/// scanned directly with [`pg_ffi::scan_block_refs`].
pub fn build_page_map(
    client: &mut dyn DbClient,
    backup: &Backup,
    parent: &Option<Backup>,
    files: &[FileEntry],
    page_map: &PageMap,
    wal_dir: &Utf8Path,
) -> Result<()> {
    match backup.backup_mode {
        BackupMode::Page => {
            let from_lsn = parent.as_ref().map(|p| p.start_lsn).unwrap_or(Lsn::INVALID);
            let to_lsn = backup.start_lsn;
            let refs = scan_wal_range(wal_dir, backup.timeline_id, from_lsn, to_lsn)?;
            build_page_map_from_wal(
                page_map,
                refs.into_iter().map(|r| WalBlockRef {
                    tblspcnode: r.tblspcnode,
                    dbnode: r.dbnode,
                    relnode: r.relnode,
                    forknum: r.forknum,
                    block: r.block,
                }),
            );
        }
        BackupMode::Ptrack => {
            for entry in files.iter().filter(|e| e.is_datafile) {
                let (Some(tblspcnode), Some(dbnode), Some(relnode), Some(forknum), Some(segno)) =
                    (entry.tblspcnode, entry.dbnode, entry.relnode, entry.forknum, entry.segno)
                else {
                    continue;
                };
                let db_has_ptrack_init = client.ptrack_init_for_db(dbnode)?;
                let lookup = crate::pagemap::ptrack_blocks_for_segment(
                    client,
                    RelKey { tblspcnode, dbnode, relnode, forknum },
                    segno,
                    db_has_ptrack_init,
                )?;
                if !lookup.pagemap_absent {
                    for block in lookup.blocks {
                        page_map.add_block(RelKey { tblspcnode, dbnode, relnode, forknum }, block);
                    }
                }
            }
        }
        BackupMode::Full | BackupMode::Delta => {}
    }
    Ok(())
}

/// PostgreSQL's `XLogFileName`: 8 hex digits of timeline, then the 64-bit
/// segment number split into two 32-bit halves (at the default 16 MiB
/// segment size, `2^32 / WAL_SEGMENT_SIZE == 256` segments per "xlogid").
fn wal_segment_filename(timeline_id: u32, segno: u64) -> String {
    let segments_per_xlogid = (1u64 << 32) / pg_ffi::WAL_SEGMENT_SIZE;
    let hi = segno / segments_per_xlogid;
    let lo = segno % segments_per_xlogid;
    format!("{timeline_id:08X}{hi:08X}{lo:08X}")
}

/// Read every archived WAL segment covering `(from_lsn, to_lsn]` and
/// extract block references from each. A segment not yet present on disk
/// is logged and skipped rather than treated as fatal — the caller always
/// has the whole-file fallback of treating an absent page map as "copy
/// everything" if this yields nothing for a given relation.
fn scan_wal_range(wal_dir: &Utf8Path, timeline_id: u32, from_lsn: Lsn, to_lsn: Lsn) -> Result<Vec<pg_ffi::WalBlockRef>> {
    let mut refs = Vec::new();
    if !to_lsn.is_valid() || to_lsn <= from_lsn {
        return Ok(refs);
    }
    let first_segno = from_lsn.segment_number(pg_ffi::WAL_SEGMENT_SIZE);
    let last_segno = to_lsn.segment_number(pg_ffi::WAL_SEGMENT_SIZE);

    for segno in first_segno..=last_segno {
        let path = wal_dir.join(wal_segment_filename(timeline_id, segno));
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(%path, "WAL segment not archived yet, skipping from this page-map scan");
                continue;
            }
            Err(e) => return Err(EngineError::io(&path, e)),
        };
        let segment_start = Lsn(segno * pg_ffi::WAL_SEGMENT_SIZE);
        for block_ref in pg_ffi::scan_block_refs(&bytes, segment_start, pg_ffi::XLOG_BLCKSZ) {
            if block_ref.lsn > from_lsn && block_ref.lsn <= to_lsn {
                refs.push(block_ref);
            }
        }
    }
    Ok(refs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_comparison_rejects_older_major() {
        assert!(version_less_than("9.6.1", "10.0"));
        assert!(!version_less_than("15.4", "10.0"));
    }

    #[test]
    fn lists_plain_files_from_a_directory() {
        let dir = camino_tempfile::tempdir().unwrap();
        let pgdata = Utf8PathBuf::from(dir.path().to_string());
        std::fs::write(pgdata.join("PG_VERSION"), b"15\n").unwrap();
        std::fs::create_dir_all(pgdata.join("base").join("1")).unwrap();
        std::fs::write(pgdata.join("base").join("1").join("1259"), vec![0u8; pg_ffi::BLCKSZ]).unwrap();

        let backup = Backup::new(BackupMode::Full, 1);
        let entries = list_pgdata(&pgdata, &[], &backup).unwrap();
        assert!(entries.iter().any(|e| e.rel_path.as_str() == "PG_VERSION"));
        let datafile = entries.iter().find(|e| e.is_datafile).unwrap();
        assert_eq!(datafile.dbnode, Some(1));
        assert_eq!(datafile.relnode, Some(1259));
    }

    #[test]
    fn temp_relations_are_excluded_from_listing() {
        let dir = camino_tempfile::tempdir().unwrap();
        let pgdata = Utf8PathBuf::from(dir.path().to_string());
        std::fs::create_dir_all(pgdata.join("base").join("1")).unwrap();
        std::fs::write(pgdata.join("base").join("1").join("t3_1259"), vec![0u8; pg_ffi::BLCKSZ]).unwrap();

        let backup = Backup::new(BackupMode::Full, 1);
        let entries = list_pgdata(&pgdata, &[], &backup).unwrap();
        assert!(entries.iter().all(|e| !e.path.as_str().contains("t3_1259")));
    }

    #[test]
    fn unlogged_relation_main_fork_is_dropped_but_init_fork_kept() {
        let dir = camino_tempfile::tempdir().unwrap();
        let pgdata = Utf8PathBuf::from(dir.path().to_string());
        std::fs::create_dir_all(pgdata.join("base").join("1")).unwrap();
        std::fs::write(pgdata.join("base").join("1").join("2000"), vec![0u8; pg_ffi::BLCKSZ]).unwrap();
        std::fs::write(pgdata.join("base").join("1").join("2000_init"), vec![0u8; pg_ffi::BLCKSZ]).unwrap();
        // A permanent relation with no "_init" fork keeps its main fork.
        std::fs::write(pgdata.join("base").join("1").join("2001"), vec![0u8; pg_ffi::BLCKSZ]).unwrap();

        let backup = Backup::new(BackupMode::Full, 1);
        let entries = list_pgdata(&pgdata, &[], &backup).unwrap();
        assert!(entries.iter().any(|e| e.relnode == Some(2000) && e.forknum == Some(pg_ffi::INIT_FORKNUM)));
        assert!(!entries.iter().any(|e| e.relnode == Some(2000) && e.forknum == Some(pg_ffi::MAIN_FORKNUM)));
        assert!(entries.iter().any(|e| e.relnode == Some(2001) && e.forknum == Some(pg_ffi::MAIN_FORKNUM)));
    }

    #[test]
    fn external_directory_entries_are_tagged_with_their_index() {
        let dir = camino_tempfile::tempdir().unwrap();
        let pgdata = Utf8PathBuf::from(dir.path().to_string());
        std::fs::create_dir_all(&pgdata).unwrap();
        std::fs::write(pgdata.join("PG_VERSION"), b"15\n").unwrap();

        let ext_dir = Utf8PathBuf::from(dir.path().join("ext1").to_string());
        std::fs::create_dir_all(&ext_dir).unwrap();
        std::fs::write(ext_dir.join("notes.txt"), b"external data").unwrap();

        let backup = Backup::new(BackupMode::Full, 1);
        let entries = list_pgdata(&pgdata, std::slice::from_ref(&ext_dir), &backup).unwrap();
        let ext_entry = entries.iter().find(|e| e.rel_path.as_str() == "notes.txt").unwrap();
        assert_eq!(ext_entry.external_dir_num, 1);
        let pgdata_entry = entries.iter().find(|e| e.rel_path.as_str() == "PG_VERSION").unwrap();
        assert_eq!(pgdata_entry.external_dir_num, 0);
    }

    #[test]
    fn page_mode_scan_finds_block_refs_in_an_archived_segment() {
        use byteorder::{ByteOrder, LittleEndian};

        let dir = camino_tempfile::tempdir().unwrap();
        let wal_dir = Utf8PathBuf::from(dir.path().to_string());

        // One minimal record referencing block 7 of (1663, 16384, 16385),
        // framed inside a single long-header WAL page.
        let mut body = Vec::new();
        body.push(0u8); // block_id
        body.push(0u8); // fork_flags: main fork, no image/data/same-rel
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&1663u32.to_le_bytes());
        body.extend_from_slice(&16384u32.to_le_bytes());
        body.extend_from_slice(&16385u32.to_le_bytes());
        body.extend_from_slice(&7u32.to_le_bytes());
        let tot_len = 24 + body.len();
        let mut record = Vec::new();
        record.extend_from_slice(&(tot_len as u32).to_le_bytes());
        record.extend_from_slice(&0u32.to_le_bytes());
        record.extend_from_slice(&0u64.to_le_bytes());
        record.push(0);
        record.push(0);
        record.extend_from_slice(&0u16.to_le_bytes());
        record.extend_from_slice(&0u32.to_le_bytes());
        record.extend_from_slice(&body);
        while record.len() % 8 != 0 {
            record.push(0);
        }

        let mut page = vec![0u8; pg_ffi::XLOG_BLCKSZ];
        LittleEndian::write_u16(&mut page[0..2], 0xD000);
        LittleEndian::write_u16(&mut page[2..4], 0x0002);
        page[40..40 + record.len()].copy_from_slice(&record);

        let filename = wal_segment_filename(1, 0);
        std::fs::write(wal_dir.join(filename), &page).unwrap();

        let refs = scan_wal_range(&wal_dir, 1, Lsn(0), Lsn(pg_ffi::WAL_SEGMENT_SIZE - 1)).unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].relnode, 16385);
        assert_eq!(refs[0].block, 7);
    }
}
