//! COPYING→STOPPED and STOPPED→FINALIZED (§4.4).

use std::time::Duration;

use camino::Utf8PathBuf;
use tracing::{info, warn};

use pg_ffi::Lsn;

use crate::config::EngineConfig;
use crate::dbclient::DbClient;
use crate::error::Result;
use crate::model::Backup;
use crate::stream_worker::StopSignal;
use crate::wal_waiter::{wait_for_lsn, WaitTarget, WalWaiterConfig};

/// COPYING→STOPPED: issue stop-of-backup and record what it returns.
/// Stop-of-backup is sent synchronously here; a cancellable async send
/// (§4.4 "so an interrupt can cancel") is the caller's responsibility —
/// this function is the poll-to-completion body such a wrapper calls.
pub fn stop_backup(
    client: &mut dyn DbClient,
    _config: &EngineConfig,
    backup: &mut Backup,
    stop_signal: &StopSignal,
) -> Result<()> {
    let exclusive = !backup.stream;
    let result = client.stop_backup(exclusive)?;

    backup.stop_lsn = result.stop_lsn;
    backup.stop_lsn_exists = true;
    backup.recovery_time = result.recovery_time;
    backup.recovery_xid = result.recovery_xid;
    stop_signal.publish(result.stop_lsn);

    info!(stop_lsn = %backup.stop_lsn, "stop-of-backup completed");
    Ok(())
}

/// STOPPED→FINALIZED: wait for stop-LSN durability, handling the
/// segment-boundary corner case (§4.4, scenario 6) where a zero
/// within-segment offset means "no record to wait for" — substitute the
/// last valid LSN at-or-before stop-LSN instead of waiting on an empty
/// segment.
pub fn wait_and_finalize(
    config: &EngineConfig,
    wal_dir: &Utf8PathBuf,
    backup: &mut Backup,
    stop_signal: &StopSignal,
) -> Result<()> {
    if backup.stream {
        // The stream worker already carries WAL up to stop-LSN; nothing
        // further to wait for once it has joined (joined by the caller
        // before invoking this function).
        return Ok(());
    }

    let wal_seg_size = 16 * 1024 * 1024u64;
    if backup.stop_lsn.segment_offset(wal_seg_size) == 0 {
        warn!(stop_lsn = %backup.stop_lsn, "stop-LSN at segment boundary, using last valid LSN instead");
        backup.stop_lsn = last_valid_lsn_before(backup.stop_lsn);
    } else {
        let waiter_config = WalWaiterConfig {
            wal_dir: wal_dir.clone(),
            wal_seg_size,
            timeout: config.archive_timeout,
            is_replica: backup.from_replica,
        };
        wait_for_lsn(
            &waiter_config,
            backup.timeline_id,
            backup.stop_lsn,
            WaitTarget::ContainingSegment,
            || false,
        )?;
    }

    let _ = stop_signal;
    Ok(())
}

/// Fallback for the segment-boundary corner case: step back one byte so a
/// subsequent wait targets the previous record instead of an LSN that
/// names the very start of an as-yet-unwritten segment.
fn last_valid_lsn_before(lsn: Lsn) -> Lsn {
    lsn.checked_sub(1).unwrap_or(Lsn::INVALID)
}

pub fn stream_stop_timeout(config: &EngineConfig, checkpoint_timeout: Duration) -> Duration {
    config.stream_stop_timeout(checkpoint_timeout)
}
