//! On-disk page frame (§3, §6): `{block: u32, compressed_size: i32}`
//! followed by `ALIGN8(compressed_size)` payload bytes.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

/// `compressed_size` sentinel: this frame is the end-of-file truncation
/// marker for the file (restore should `ftruncate` here). Never followed
/// by a payload.
pub const PAGE_IS_TRUNCATED: i32 = -2;

/// `compressed_size` sentinel used only in memory while deciding whether
/// to keep a block (DELTA mode); never written to disk.
pub const SKIP_CURRENT_PAGE: i32 = -3;

/// `compressed_size` sentinel meaning "read exhausted retries and the
/// page is corrupt"; per §4.3 this is fatal in strict mode and never
/// persisted.
pub const PAGE_IS_CORRUPT: i32 = -4;

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("compressed_size {0} exceeds page size")]
    OversizedPayload(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupPageHeader {
    pub block: u32,
    pub compressed_size: i32,
}

impl BackupPageHeader {
    pub const ENCODED_SIZE: usize = 8;

    pub fn truncation_marker() -> Self {
        BackupPageHeader {
            block: 0,
            compressed_size: PAGE_IS_TRUNCATED,
        }
    }

    /// Write this header followed by `payload`, word-aligning the frame
    /// with zero padding as §3/§6 require. Returns the total number of
    /// bytes written (header + payload + padding), which the caller folds
    /// into the running CRC-32.
    pub fn write_frame<W: Write>(&self, mut w: W, payload: &[u8]) -> Result<usize, FrameError> {
        if self.compressed_size > pg_ffi::BLCKSZ as i32 {
            return Err(FrameError::OversizedPayload(self.compressed_size));
        }
        w.write_u32::<LittleEndian>(self.block)?;
        w.write_i32::<LittleEndian>(self.compressed_size)?;
        let mut total = Self::ENCODED_SIZE;
        if self.compressed_size > 0 {
            w.write_all(payload)?;
            total += payload.len();
            let padded = align8(payload.len());
            if padded > payload.len() {
                let pad = vec![0u8; padded - payload.len()];
                w.write_all(&pad)?;
                total += pad.len();
            }
        }
        Ok(total)
    }

    /// Read one frame's header and payload (if any) from `r`. Returns
    /// `Ok(None)` at a clean EOF (no more frames).
    pub fn read_frame<R: Read>(mut r: R) -> Result<Option<(Self, Vec<u8>)>, FrameError> {
        let block = match r.read_u32::<LittleEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let compressed_size = r.read_i32::<LittleEndian>()?;
        let header = BackupPageHeader {
            block,
            compressed_size,
        };
        if compressed_size <= 0 {
            return Ok(Some((header, Vec::new())));
        }
        if compressed_size > pg_ffi::BLCKSZ as i32 {
            return Err(FrameError::OversizedPayload(compressed_size));
        }
        let mut payload = vec![0u8; compressed_size as usize];
        r.read_exact(&mut payload)?;
        let padded = align8(payload.len());
        if padded > payload.len() {
            let mut pad = vec![0u8; padded - payload.len()];
            r.read_exact(&mut pad)?;
        }
        Ok(Some((header, payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_regular_frame() {
        let header = BackupPageHeader {
            block: 7,
            compressed_size: 5,
        };
        let mut buf = Vec::new();
        header.write_frame(&mut buf, b"hello").unwrap();
        // header(8) + payload(5) padded to 8 = 16
        assert_eq!(buf.len(), 16);

        let (read_header, payload) = BackupPageHeader::read_frame(&buf[..]).unwrap().unwrap();
        assert_eq!(read_header, header);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn truncation_marker_has_no_payload() {
        let header = BackupPageHeader::truncation_marker();
        let mut buf = Vec::new();
        let n = header.write_frame(&mut buf, &[]).unwrap();
        assert_eq!(n, BackupPageHeader::ENCODED_SIZE);
        let (read_header, payload) = BackupPageHeader::read_frame(&buf[..]).unwrap().unwrap();
        assert_eq!(read_header.compressed_size, PAGE_IS_TRUNCATED);
        assert!(payload.is_empty());
    }

    #[test]
    fn empty_stream_reads_as_none() {
        assert!(BackupPageHeader::read_frame(&[][..]).unwrap().is_none());
    }

    #[test]
    fn rejects_oversized_payload() {
        let header = BackupPageHeader {
            block: 0,
            compressed_size: pg_ffi::BLCKSZ as i32 + 1,
        };
        let mut buf = Vec::new();
        assert!(matches!(
            header.write_frame(&mut buf, &vec![0u8; pg_ffi::BLCKSZ + 1]),
            Err(FrameError::OversizedPayload(_))
        ));
    }
}
