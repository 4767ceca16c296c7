//! `backup.control`: a whole-file, comment-aware `key = value` format
//! (§4.1, §6). Not TOML — pg_probackup-style control files predate the
//! engine's own `EngineConfig` and keep their historical shape.

use std::collections::BTreeMap;
use std::str::FromStr;

use camino::Utf8Path;
use chrono::{DateTime, Local};
use pg_ffi::Lsn;

use crate::error::{EngineError, Result};
use crate::model::{Backup, BackupMode, BackupStatus, CompressAlg};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%z";

/// Serialize `backup` to the `key = value` text format and write it
/// crash-safely to `path`.
pub fn write(path: &Utf8Path, backup: &Backup) -> Result<()> {
    let text = render(backup);
    backup_utils::crashsafe::overwrite(path, text.as_bytes())
        .map_err(|e| EngineError::io(path, e))
}

pub fn render(backup: &Backup) -> String {
    let mut out = String::new();
    out.push_str("# Backup contents\n");
    out.push_str(&format!("backup-mode = {}\n", backup.backup_mode));
    out.push_str(&format!("stream = {}\n", backup.stream));
    out.push_str(&format!("compress-alg = {}\n", backup.compress_alg));
    out.push_str(&format!("compress-level = {}\n", backup.compress_level));
    out.push_str(&format!("from-replica = {}\n", backup.from_replica));
    out.push('\n');
    out.push_str("# Compatibility\n");
    out.push_str(&format!("block-size = {}\n", backup.block_size));
    out.push_str(&format!("xlog-block-size = {}\n", backup.xlog_block_size));
    out.push_str(&format!(
        "checksum-version = {}\n",
        backup.checksum_version
    ));
    out.push_str(&format!("program-version = {}\n", backup.program_version));
    if !backup.server_version.is_empty() {
        out.push_str(&format!("server-version = {}\n", backup.server_version));
    }
    out.push('\n');
    out.push_str("# Result backup info\n");
    out.push_str(&format!("timelineid = {}\n", backup.timeline_id));
    if backup.start_lsn.is_valid() {
        out.push_str(&format!("start-lsn = {}\n", backup.start_lsn));
    }
    if backup.stop_lsn.is_valid() {
        out.push_str(&format!("stop-lsn = {}\n", backup.stop_lsn));
    }
    out.push_str(&format!("start-time = '{}'\n", backup.start_time));
    if let Some(ts) = backup.end_time_ts {
        out.push_str(&format!("end-time = '{}'\n", ts.format(TIME_FORMAT)));
    }
    if let Some(ts) = backup.recovery_time {
        out.push_str(&format!("recovery-time = '{}'\n", ts.format(TIME_FORMAT)));
    }
    if let Some(ts) = backup.merge_time {
        out.push_str(&format!("merge-time = '{}'\n", ts.format(TIME_FORMAT)));
    }
    if backup.recovery_xid != 0 {
        out.push_str(&format!("recovery-xid = {}\n", backup.recovery_xid));
    }
    if let Some(bytes) = backup.data_bytes {
        out.push_str(&format!("data-bytes = {bytes}\n"));
    }
    if let Some(bytes) = backup.wal_bytes {
        out.push_str(&format!("wal-bytes = {bytes}\n"));
    }
    out.push_str(&format!("status = {}\n", backup.status));
    if let Some(parent) = backup.parent_backup_id {
        out.push_str(&format!(
            "parent-backup-id = '{}'\n",
            backup_utils::base36::encode(parent)
        ));
    }
    if let Some(conninfo) = &backup.primary_conninfo {
        out.push_str(&format!("primary_conninfo = '{conninfo}'\n"));
    }
    if !backup.external_dirs.is_empty() {
        let dirs = backup
            .external_dirs
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(":");
        out.push_str(&format!("external-dirs = '{dirs}'\n"));
    }
    out
}

/// Parse a `key = value` document, tolerating `#`-prefixed comment lines
/// and blank lines. Returns the raw key/value map; [`parse_backup`]
/// interprets it into a [`Backup`].
fn parse_kv(text: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim().to_string();
            let value = value.trim().trim_matches('\'').to_string();
            map.insert(key, value);
        }
    }
    map
}

/// Parse a `backup.control` file into a [`Backup`]. The on-disk
/// `start-time` field is authoritative; a missing or zero value marks the
/// control file corrupt, per §4.1.
pub fn parse(text: &str) -> Result<Backup> {
    let kv = parse_kv(text);

    let start_time: u64 = kv
        .get("start-time")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| EngineError::Catalog("control file missing or zero start-time".into()))?;
    if start_time == 0 {
        return Err(EngineError::Catalog(
            "control file has zero start-time".into(),
        ));
    }

    let backup_mode = kv
        .get("backup-mode")
        .map(|v| BackupMode::from_str(v))
        .transpose()
        .map_err(EngineError::Catalog)?
        .ok_or_else(|| EngineError::Catalog("control file missing backup-mode".into()))?;

    let mut backup = Backup::new(backup_mode, start_time);

    if let Some(v) = kv.get("status") {
        backup.status = BackupStatus::from_str(v).map_err(EngineError::Catalog)?;
    }
    if let Some(v) = kv.get("stream") {
        backup.stream = parse_bool(v)?;
    }
    if let Some(v) = kv.get("from-replica") {
        backup.from_replica = parse_bool(v)?;
    }
    if let Some(v) = kv.get("compress-alg") {
        backup.compress_alg = CompressAlg::from_str(v).map_err(EngineError::Catalog)?;
    }
    if let Some(v) = kv.get("compress-level") {
        backup.compress_level = v
            .parse()
            .map_err(|_| EngineError::Catalog(format!("bad compress-level {v:?}")))?;
    }
    if let Some(v) = kv.get("block-size") {
        backup.block_size = v
            .parse()
            .map_err(|_| EngineError::Catalog(format!("bad block-size {v:?}")))?;
    }
    if let Some(v) = kv.get("xlog-block-size") {
        backup.xlog_block_size = v
            .parse()
            .map_err(|_| EngineError::Catalog(format!("bad xlog-block-size {v:?}")))?;
    }
    if let Some(v) = kv.get("checksum-version") {
        backup.checksum_version = v
            .parse()
            .map_err(|_| EngineError::Catalog(format!("bad checksum-version {v:?}")))?;
    }
    if let Some(v) = kv.get("program-version") {
        backup.program_version = v.clone();
    }
    if let Some(v) = kv.get("server-version") {
        backup.server_version = v.clone();
    }
    if let Some(v) = kv.get("timelineid") {
        backup.timeline_id = v
            .parse()
            .map_err(|_| EngineError::Catalog(format!("bad timelineid {v:?}")))?;
    }
    if let Some(v) = kv.get("start-lsn") {
        backup.start_lsn = Lsn::from_str(v).map_err(|e| EngineError::Catalog(e.to_string()))?;
    }
    if let Some(v) = kv.get("stop-lsn") {
        backup.stop_lsn = Lsn::from_str(v).map_err(|e| EngineError::Catalog(e.to_string()))?;
        backup.stop_lsn_exists = true;
    }
    if let Some(v) = kv.get("end-time") {
        backup.end_time_ts = parse_timestamp(v)?;
    }
    if let Some(v) = kv.get("recovery-time") {
        backup.recovery_time = parse_timestamp(v)?;
    }
    if let Some(v) = kv.get("merge-time") {
        backup.merge_time = parse_timestamp(v)?;
    }
    if let Some(v) = kv.get("recovery-xid") {
        backup.recovery_xid = v
            .parse()
            .map_err(|_| EngineError::Catalog(format!("bad recovery-xid {v:?}")))?;
    }
    if let Some(v) = kv.get("data-bytes") {
        backup.data_bytes = v.parse().ok();
    }
    if let Some(v) = kv.get("wal-bytes") {
        backup.wal_bytes = v.parse().ok();
    }
    if let Some(v) = kv.get("parent-backup-id") {
        backup.parent_backup_id = Some(
            backup_utils::base36::decode(v).map_err(|e| EngineError::Catalog(e.to_string()))?,
        );
    }
    if let Some(v) = kv.get("primary_conninfo") {
        backup.primary_conninfo = Some(v.clone());
    }
    if let Some(v) = kv.get("external-dirs") {
        backup.external_dirs = v.split(':').map(camino::Utf8PathBuf::from).collect();
    }

    Ok(backup)
}

fn parse_bool(v: &str) -> Result<bool> {
    match v {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(EngineError::Catalog(format!("bad boolean {other:?}"))),
    }
}

fn parse_timestamp(v: &str) -> Result<Option<DateTime<Local>>> {
    DateTime::parse_from_str(v, TIME_FORMAT)
        .map(|dt| Some(dt.with_timezone(&Local)))
        .map_err(|e| EngineError::Catalog(format!("bad timestamp {v:?}: {e}")))
}
