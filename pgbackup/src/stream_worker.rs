//! The Stream Worker (§4.6): runs on its own thread, streams WAL from a
//! segment boundary, and stops once the streamed position reaches the
//! orchestrator-published stop-LSN.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pg_ffi::Lsn;

/// Shared between the orchestrator and the stream worker: the
/// orchestrator publishes the stop-LSN once stop-of-backup returns; the
/// worker's stop predicate polls it after each segment.
#[derive(Default)]
pub struct StopSignal {
    stop_lsn: AtomicU64,
}

impl StopSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(StopSignal::default())
    }

    pub fn publish(&self, lsn: Lsn) {
        self.stop_lsn.store(lsn.0, Ordering::SeqCst);
    }

    pub fn get(&self) -> Lsn {
        Lsn(self.stop_lsn.load(Ordering::SeqCst))
    }

    pub fn is_set(&self) -> bool {
        self.get().is_valid()
    }
}

/// Decide, after completing a segment ending at `streamed_upto`, whether
/// the stream worker may stop: the stop-LSN must be published and reached.
pub fn should_stop(signal: &StopSignal, streamed_upto: Lsn) -> bool {
    signal.is_set() && streamed_upto >= signal.get()
}

pub struct StreamWorkerConfig {
    pub wal_seg_size: u64,
    pub stream_stop_timeout: Duration,
    pub create_temp_slot: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    ReachedStopLsn,
    TimedOutAfterStop,
    Cancelled,
}

/// Drives the streaming loop. `receive_segment` is the caller-supplied
/// transport step (blocking receive of one WAL segment worth of bytes,
/// returning the LSN streamed up to); kept generic so tests can simulate
/// streaming without `libpq`'s replication protocol.
pub fn run(
    config: &StreamWorkerConfig,
    signal: &StopSignal,
    start_lsn: Lsn,
    mut receive_segment: impl FnMut() -> Option<Lsn>,
    mut is_cancelled: impl FnMut() -> bool,
) -> StreamOutcome {
    let aligned_start = start_lsn.segment_lsn(config.wal_seg_size);
    let mut streamed_upto = aligned_start;
    let mut stop_deadline: Option<Instant> = None;

    loop {
        if is_cancelled() {
            return StreamOutcome::Cancelled;
        }

        if signal.is_set() && stop_deadline.is_none() {
            stop_deadline = Some(Instant::now() + config.stream_stop_timeout);
        }
        if let Some(deadline) = stop_deadline {
            if Instant::now() >= deadline && !should_stop(signal, streamed_upto) {
                return StreamOutcome::TimedOutAfterStop;
            }
        }

        match receive_segment() {
            Some(lsn) => streamed_upto = lsn,
            None => continue,
        }

        if should_stop(signal, streamed_upto) {
            return StreamOutcome::ReachedStopLsn;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StreamWorkerConfig {
        StreamWorkerConfig {
            wal_seg_size: 16 * 1024 * 1024,
            stream_stop_timeout: Duration::from_millis(50),
            create_temp_slot: false,
        }
    }

    #[test]
    fn stops_once_stop_lsn_reached() {
        let signal = StopSignal::new();
        signal.publish(Lsn(300));
        let mut segments = vec![Lsn(100), Lsn(200), Lsn(300)].into_iter();

        let outcome = run(&config(), &signal, Lsn(0), || segments.next(), || false);
        assert_eq!(outcome, StreamOutcome::ReachedStopLsn);
    }

    #[test]
    fn cancel_flag_stops_immediately() {
        let signal = StopSignal::new();
        let outcome = run(&config(), &signal, Lsn(0), || Some(Lsn(0)), || true);
        assert_eq!(outcome, StreamOutcome::Cancelled);
    }

    #[test]
    fn unset_stop_lsn_never_satisfies_should_stop() {
        let signal = StopSignal::new();
        assert!(!should_stop(&signal, Lsn(1_000_000)));
    }
}
