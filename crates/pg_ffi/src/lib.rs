//! Constants and wire-level helpers copied (by hand, as upstream does) from
//! the pieces of the PostgreSQL on-disk format that the backup engine needs
//! to reason about: page headers, block-level checksums, fork numbers and
//! LSNs. None of this talks to a running server; it only decodes bytes the
//! engine already has.

mod checksum;
mod lsn;
mod page;
mod wal;

pub use checksum::page_checksum;
pub use lsn::{Lsn, ParseLsnError};
pub use page::{validate_header, verify_checksum, PageHeaderError, PageValidation};
pub use wal::{scan_block_refs, WalBlockRef, WAL_SEGMENT_SIZE};

/// Size in bytes of a PostgreSQL heap/index page.
pub const BLCKSZ: usize = 8192;

/// Size in bytes of a WAL page, as used by the WAL Waiter and stream worker.
pub const XLOG_BLCKSZ: usize = 8192;

/// Default number of blocks per relation segment file (`foo.1`, `foo.2`, ...).
pub const RELSEG_SIZE: u32 = 1024 * 1024 * 1024 / BLCKSZ as u32;

/// Fork numbers, from PostgreSQL's `relpath.h`.
pub const MAIN_FORKNUM: u8 = 0;
pub const FSM_FORKNUM: u8 = 1;
pub const VISIBILITYMAP_FORKNUM: u8 = 2;
pub const INIT_FORKNUM: u8 = 3;

pub fn forknum_name(forknum: u8) -> &'static str {
    match forknum {
        MAIN_FORKNUM => "main",
        FSM_FORKNUM => "fsm",
        VISIBILITYMAP_FORKNUM => "vm",
        INIT_FORKNUM => "init",
        _ => "unknown",
    }
}

pub const DEFAULTTABLESPACE_OID: u32 = 1663;
pub const GLOBALTABLESPACE_OID: u32 = 1664;

/// The header fields every page must satisfy, regardless of contents.
/// `pd_lower <= pd_upper <= pd_special <= BLCKSZ`, mirroring PostgreSQL's
/// `PageHeaderData` layout (`bufpage.h`).
pub const PAGE_HEADER_SIZE: usize = 24;

/// Mask of flag bits that `pd_flags` is allowed to carry (`PD_VALID_FLAG_BITS`).
pub const PD_VALID_FLAG_BITS: u16 = 0x0007;
