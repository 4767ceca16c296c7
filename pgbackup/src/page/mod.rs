//! Page Codec (§4.2): header validation (delegated to `pg_ffi`),
//! compression, and on-disk page framing.

mod compress;
mod frame;

pub use compress::{compress, decompress, looks_like_zlib_stream, CompressError};
pub use frame::{BackupPageHeader, FrameError, PAGE_IS_TRUNCATED, SKIP_CURRENT_PAGE};

pub use pg_ffi::{validate_header, verify_checksum, PageHeaderError, PageValidation};
