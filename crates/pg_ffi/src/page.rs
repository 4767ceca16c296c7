use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::{page_checksum, BLCKSZ, PAGE_HEADER_SIZE, PD_VALID_FLAG_BITS};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PageHeaderError {
    #[error("short read: got {0} bytes, expected {BLCKSZ}")]
    ShortRead(usize),
    #[error("pd_flags {0:#06x} outside valid bit mask")]
    InvalidFlags(u16),
    #[error("pd_lower {pd_lower} below header size {PAGE_HEADER_SIZE}")]
    LowerTooSmall { pd_lower: u16 },
    #[error("pd_lower {pd_lower} > pd_upper {pd_upper}")]
    LowerAboveUpper { pd_lower: u16, pd_upper: u16 },
    #[error("pd_upper {pd_upper} > pd_special {pd_special}")]
    UpperAboveSpecial { pd_upper: u16, pd_special: u16 },
    #[error("pd_special {pd_special} exceeds page size {BLCKSZ}")]
    SpecialPastEnd { pd_special: u16 },
    #[error("pd_special {pd_special} is not maximally aligned")]
    SpecialNotAligned { pd_special: u16 },
    #[error("pd_pagesize_version encodes page size {found}, expected {BLCKSZ}")]
    PageSizeMismatch { found: usize },
}

/// Result of validating a page header, distinguishing the "intentionally
/// empty" case (all-zero page, common right after `smgrextend`) from an
/// ordinary well-formed page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageValidation {
    Empty,
    Ok,
}

/// Validate a page's header per PostgreSQL's `PageHeaderIsValid`: field
/// ranges only, no checksum check (see [`page_checksum`] for that). `page`
/// must be exactly `BLCKSZ` bytes.
pub fn validate_header(page: &[u8]) -> Result<PageValidation, PageHeaderError> {
    if page.len() != BLCKSZ {
        return Err(PageHeaderError::ShortRead(page.len()));
    }
    if page.iter().all(|&b| b == 0) {
        return Ok(PageValidation::Empty);
    }

    // PageHeaderData layout (little-endian): lsn(8) checksum(2) flags(2)
    // lower(2) upper(2) special(2) pagesize_version(2) prune_xid(4)
    let flags = LittleEndian::read_u16(&page[10..12]);
    let pd_lower = LittleEndian::read_u16(&page[12..14]);
    let pd_upper = LittleEndian::read_u16(&page[14..16]);
    let pd_special = LittleEndian::read_u16(&page[16..18]);
    let pagesize_version = LittleEndian::read_u16(&page[18..20]);

    if flags & !PD_VALID_FLAG_BITS != 0 {
        return Err(PageHeaderError::InvalidFlags(flags));
    }
    if (pd_lower as usize) < PAGE_HEADER_SIZE {
        return Err(PageHeaderError::LowerTooSmall { pd_lower });
    }
    if pd_lower > pd_upper {
        return Err(PageHeaderError::LowerAboveUpper { pd_lower, pd_upper });
    }
    if pd_upper > pd_special {
        return Err(PageHeaderError::UpperAboveSpecial {
            pd_upper,
            pd_special,
        });
    }
    if pd_special as usize > BLCKSZ {
        return Err(PageHeaderError::SpecialPastEnd { pd_special });
    }
    if pd_special % 8 != 0 {
        return Err(PageHeaderError::SpecialNotAligned { pd_special });
    }
    // PageGetPageSize(): the page size lives in the top byte of
    // pd_pagesize_version, the bottom byte is the layout version.
    let encoded_size = (pagesize_version & 0xFF00) as usize;
    if encoded_size != BLCKSZ {
        return Err(PageHeaderError::PageSizeMismatch { found: encoded_size });
    }

    Ok(PageValidation::Ok)
}

/// Read the stored checksum out of a page's header (offset 8, 2 bytes).
pub fn stored_checksum(page: &[u8]) -> u16 {
    LittleEndian::read_u16(&page[8..10])
}

/// Verify `page`'s stored checksum against the computed one for
/// `block_number`. Always returns `true` for an all-zero page: empty pages
/// carry no checksum.
pub fn verify_checksum(page: &[u8], block_number: u32) -> bool {
    if page.iter().all(|&b| b == 0) {
        return true;
    }
    stored_checksum(page) == page_checksum(page, block_number)
}
