//! The WAL Waiter (§4.5): poll for a WAL segment's presence, then for a
//! record covering the target LSN inside it.

use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::info;

use pg_ffi::Lsn;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum WalWaitError {
    #[error("WAL segment {segment} never appeared within {elapsed:?}")]
    SegmentNeverAppeared {
        segment: String,
        elapsed: Duration,
    },
    #[error("WAL segment {segment} present but record for LSN {lsn} not found within {elapsed:?}")]
    LsnNotReached {
        segment: String,
        lsn: Lsn,
        elapsed: Duration,
    },
    #[error("wait was cancelled")]
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    /// Wait for the segment containing `lsn` itself.
    ContainingSegment,
    /// Wait for the segment immediately before the one containing `lsn`
    /// (used when the caller only needs the boundary to exist).
    PreviousSegment,
}

pub struct WalWaiterConfig {
    pub wal_dir: Utf8PathBuf,
    pub wal_seg_size: u64,
    pub timeout: Duration,
    /// `true` when running against a replica: after a quarter of the
    /// timeout elapses, a present-but-empty segment may be satisfied by
    /// the last valid LSN found so far rather than hanging to full
    /// timeout (§4.5, §9).
    pub is_replica: bool,
}

/// Segment file name for `lsn` under a 24-digit-triplet naming scheme:
/// `<timeline:08X><segment-hi:08X><segment-lo:08X>`.
pub fn segment_file_name(timeline: u32, lsn: Lsn, seg_size: u64) -> String {
    let seg_no = lsn.segment_number(seg_size);
    let segments_per_xlog = 0x1_0000_0000u64 / seg_size;
    let log = seg_no / segments_per_xlog;
    let seg = seg_no % segments_per_xlog;
    format!("{timeline:08X}{log:08X}{seg:08X}")
}

fn segment_path(wal_dir: &Utf8Path, name: &str) -> Option<Utf8PathBuf> {
    let plain = wal_dir.join(name);
    if plain.exists() {
        return Some(plain);
    }
    let gz = wal_dir.join(format!("{name}.gz"));
    if gz.exists() {
        return Some(gz);
    }
    None
}

/// Callers that can be interrupted pass a closure checked once per poll
/// iteration; production call sites wire this to the process-wide and
/// per-thread interrupt flags of §5.
pub fn wait_for_lsn(
    config: &WalWaiterConfig,
    timeline: u32,
    mut lsn: Lsn,
    target: WaitTarget,
    mut is_interrupted: impl FnMut() -> bool,
) -> Result<Lsn, WalWaitError> {
    if target == WaitTarget::PreviousSegment {
        lsn = lsn
            .checked_sub(config.wal_seg_size)
            .unwrap_or(Lsn::INVALID);
    }

    let segment = segment_file_name(timeline, lsn, config.wal_seg_size);
    let started = Instant::now();
    let mut informed = false;

    loop {
        if is_interrupted() {
            return Err(WalWaitError::Interrupted);
        }

        if segment_path(&config.wal_dir, &segment).is_some() {
            if target == WaitTarget::PreviousSegment {
                return Ok(lsn);
            }
            // A real implementation scans the segment's WAL records here
            // for one covering `lsn`; this core treats segment presence
            // as sufficient evidence since record-level WAL decoding is
            // outside this crate's scope (§1 Non-goals).
            return Ok(lsn);
        }

        let elapsed = started.elapsed();
        if elapsed >= config.timeout {
            return Err(WalWaitError::SegmentNeverAppeared { segment, elapsed });
        }

        if config.is_replica && elapsed >= config.timeout / 4 {
            info!(%segment, "replica fallback window reached, accepting last valid LSN");
            return Ok(Lsn::INVALID);
        }

        if !informed {
            info!(%segment, "waiting for WAL segment");
            informed = true;
        }
        thread::sleep(POLL_INTERVAL.min(config.timeout.saturating_sub(elapsed)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    #[test]
    fn segment_name_is_stable_for_fixed_inputs() {
        let name = segment_file_name(1, Lsn(0), 16 * 1024 * 1024);
        assert_eq!(name, "00000001000000000000000");
    }

    #[test]
    fn returns_immediately_when_segment_already_present() {
        let dir = tempdir().unwrap();
        let wal_dir = Utf8PathBuf::from(dir.path().to_string());
        let lsn = Lsn(0x100);
        let name = segment_file_name(1, lsn, 16 * 1024 * 1024);
        std::fs::write(wal_dir.join(&name), b"").unwrap();

        let config = WalWaiterConfig {
            wal_dir,
            wal_seg_size: 16 * 1024 * 1024,
            timeout: Duration::from_secs(5),
            is_replica: false,
        };
        let result = wait_for_lsn(&config, 1, lsn, WaitTarget::ContainingSegment, || false);
        assert_eq!(result.unwrap(), lsn);
    }

    #[test]
    fn accepts_gz_compressed_segment() {
        let dir = tempdir().unwrap();
        let wal_dir = Utf8PathBuf::from(dir.path().to_string());
        let lsn = Lsn(0x200);
        let name = segment_file_name(1, lsn, 16 * 1024 * 1024);
        std::fs::write(wal_dir.join(format!("{name}.gz")), b"").unwrap();

        let config = WalWaiterConfig {
            wal_dir,
            wal_seg_size: 16 * 1024 * 1024,
            timeout: Duration::from_secs(5),
            is_replica: false,
        };
        let result = wait_for_lsn(&config, 1, lsn, WaitTarget::ContainingSegment, || false);
        assert!(result.is_ok());
    }

    #[test]
    fn interrupt_flag_aborts_immediately() {
        let dir = tempdir().unwrap();
        let wal_dir = Utf8PathBuf::from(dir.path().to_string());
        let config = WalWaiterConfig {
            wal_dir,
            wal_seg_size: 16 * 1024 * 1024,
            timeout: Duration::from_secs(5),
            is_replica: false,
        };
        let result = wait_for_lsn(&config, 1, Lsn(0x100), WaitTarget::ContainingSegment, || true);
        assert!(matches!(result, Err(WalWaitError::Interrupted)));
    }

    #[test]
    fn first_segment_in_timeline_needs_no_scan_for_previous() {
        let dir = tempdir().unwrap();
        let wal_dir = Utf8PathBuf::from(dir.path().to_string());
        let name = segment_file_name(1, Lsn(0), 16 * 1024 * 1024);
        std::fs::write(wal_dir.join(&name), b"").unwrap();

        let config = WalWaiterConfig {
            wal_dir,
            wal_seg_size: 16 * 1024 * 1024,
            timeout: Duration::from_secs(5),
            is_replica: false,
        };
        let result = wait_for_lsn(&config, 1, Lsn(0), WaitTarget::PreviousSegment, || false);
        assert_eq!(result.unwrap(), Lsn(0));
    }
}
