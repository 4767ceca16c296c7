//! `compress`/`decompress` (§4.2). Two real algorithms are wired up: zlib
//! via `flate2`, and `none` (the caller must not call compress for it).
//! `pglz`, PostgreSQL's in-house LZ variant, has no published standalone
//! crate; callers that choose it get a typed error rather than a silently
//! wrong encoding — see `CompressAlg::Pglz` handling below and DESIGN.md.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use thiserror::Error;

use crate::model::CompressAlg;

#[derive(Debug, Error)]
pub enum CompressError {
    #[error("compress/decompress called with alg=none")]
    NoneIsNotCallable,
    #[error("pglz is not implemented by this build; recompress with zlib or store uncompressed")]
    PglzUnsupported,
    #[error("zlib error: {0}")]
    Zlib(#[source] std::io::Error),
}

/// Compress `src` into `dst`, returning the number of bytes written.
/// Mirrors the source API of returning a byte count; unlike the original
/// C function there is no negative-return-code convention; failures are
/// typed errors that callers translate to "write raw" per §4.3.
pub fn compress(alg: CompressAlg, level: i32, src: &[u8], dst: &mut Vec<u8>) -> Result<usize, CompressError> {
    match alg {
        CompressAlg::None => Err(CompressError::NoneIsNotCallable),
        CompressAlg::Pglz => Err(CompressError::PglzUnsupported),
        CompressAlg::Zlib => {
            let compression = Compression::new(level.clamp(0, 9) as u32);
            let mut encoder = ZlibEncoder::new(Vec::new(), compression);
            encoder.write_all(src).map_err(CompressError::Zlib)?;
            let out = encoder.finish().map_err(CompressError::Zlib)?;
            dst.clear();
            dst.extend_from_slice(&out);
            Ok(dst.len())
        }
    }
}

pub fn decompress(alg: CompressAlg, src: &[u8], dst: &mut Vec<u8>) -> Result<usize, CompressError> {
    match alg {
        CompressAlg::None => Err(CompressError::NoneIsNotCallable),
        CompressAlg::Pglz => Err(CompressError::PglzUnsupported),
        CompressAlg::Zlib => {
            let mut decoder = ZlibDecoder::new(src);
            dst.clear();
            decoder.read_to_end(dst).map_err(CompressError::Zlib)?;
            Ok(dst.len())
        }
    }
}

/// The legacy decode heuristic of §4.2: for backups written before
/// 2.0.23, a stored `compressed_size == BLCKSZ` is ambiguous between
/// "uncompressed page" and "zlib-compressed payload that happens to be
/// exactly BLCKSZ bytes". Those old backups probed the first payload byte
/// for zlib's `0x78` magic. New backups never produce this ambiguity
/// because compressed data smaller than `BLCKSZ` is always framed with
/// its true compressed size.
pub fn looks_like_zlib_stream(payload: &[u8]) -> bool {
    payload.first() == Some(&0x78)
}
