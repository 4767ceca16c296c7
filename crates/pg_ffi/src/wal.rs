//! Minimal WAL record reader: enough of `xlogreader.c`'s record
//! reassembly and `DecodeXLogRecord`'s block-header walk to recover which
//! `(tablespace, database, relation, fork, block)` each record touched.
//! Record *payload* interpretation (what the record actually did) is out
//! of scope — only the block references are extracted, for the Page-Map
//! Builder (§4.7).

use byteorder::{ByteOrder, LittleEndian};

use crate::Lsn;

/// Default WAL segment size PostgreSQL ships with (`--wal-segsize` can
/// change this per-cluster; this core assumes the default).
pub const WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

const XLOG_PAGE_MAGIC_MIN: u16 = 0xD000;
const XLP_LONG_HEADER: u16 = 0x0002;
const SHORT_PHD_SIZE: usize = 24;
const LONG_PHD_SIZE: usize = 40;
const SIZE_OF_XLOG_RECORD: usize = 24;

const XLR_BLOCK_ID_TOPLEVEL_XID: u8 = 252;
const XLR_BLOCK_ID_ORIGIN: u8 = 253;
const XLR_BLOCK_ID_DATA_LONG: u8 = 254;
const XLR_BLOCK_ID_DATA_SHORT: u8 = 255;

const BKPBLOCK_FORK_MASK: u8 = 0x0F;
const BKPBLOCK_HAS_IMAGE: u8 = 0x10;
const BKPBLOCK_HAS_DATA: u8 = 0x20;
const BKPBLOCK_SAME_REL: u8 = 0x80;

fn maxalign(n: usize) -> usize {
    (n + 7) & !7
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalBlockRef {
    pub lsn: Lsn,
    pub tblspcnode: u32,
    pub dbnode: u32,
    pub relnode: u32,
    pub forknum: u8,
    pub block: u32,
}

/// Strip WAL page headers out of one segment, returning the contiguous
/// record stream plus the file offset (into `segment`) each output byte
/// came from — the offset lets a caller translate a position back into an
/// LSN via `segment_start_lsn + offset`.
fn strip_page_headers(segment: &[u8], page_size: usize) -> Vec<(u8, usize)> {
    let mut out = Vec::with_capacity(segment.len());
    let mut pos = 0usize;
    while pos + 8 <= segment.len() {
        let magic = LittleEndian::read_u16(&segment[pos..pos + 2]);
        let info = LittleEndian::read_u16(&segment[pos + 2..pos + 4]);
        let header_size = if info & XLP_LONG_HEADER != 0 { LONG_PHD_SIZE } else { SHORT_PHD_SIZE };
        if magic < XLOG_PAGE_MAGIC_MIN && pos != 0 {
            // Not a recognizable page header mid-file; stop rather than
            // risk walking garbage as record bytes.
            break;
        }
        let body_start = pos + header_size;
        let body_end = (pos + page_size).min(segment.len());
        if body_start >= body_end || body_start > segment.len() {
            break;
        }
        for (i, byte) in segment[body_start..body_end].iter().enumerate() {
            out.push((*byte, body_start + i));
        }
        pos += page_size;
    }
    out
}

/// Scan one WAL segment's raw bytes for block references touched by
/// records fully contained in it. `segment_start_lsn` is the LSN of the
/// first byte of the segment (`segno * WAL_SEGMENT_SIZE`); `page_size` is
/// `XLOG_BLCKSZ`. Records that straddle a segment boundary are skipped —
/// a real reader would carry the partial record into the next segment,
/// which this minimal scanner does not attempt.
pub fn scan_block_refs(segment: &[u8], segment_start_lsn: Lsn, page_size: usize) -> Vec<WalBlockRef> {
    let stream = strip_page_headers(segment, page_size);
    let mut refs = Vec::new();
    let mut i = 0usize;

    while i + SIZE_OF_XLOG_RECORD <= stream.len() {
        let record_offset = stream[i].1;
        let header: Vec<u8> = stream[i..i + SIZE_OF_XLOG_RECORD].iter().map(|(b, _)| *b).collect();
        let tot_len = LittleEndian::read_u32(&header[0..4]) as usize;
        if tot_len < SIZE_OF_XLOG_RECORD {
            break;
        }
        if i + tot_len > stream.len() {
            // Straddles the segment boundary (or truncated); stop here.
            break;
        }
        let record_lsn = Lsn(segment_start_lsn.0 + record_offset as u64);

        let mut cursor = i + SIZE_OF_XLOG_RECORD;
        let record_end = i + tot_len;
        let mut last_rel: Option<(u32, u32, u32)> = None;

        while cursor < record_end {
            let block_id = stream[cursor].0;
            cursor += 1;
            if cursor >= record_end {
                break;
            }
            match block_id {
                XLR_BLOCK_ID_DATA_SHORT => {
                    let len = stream[cursor].0 as usize;
                    cursor += 1 + len;
                }
                XLR_BLOCK_ID_DATA_LONG => {
                    if cursor + 4 > record_end {
                        break;
                    }
                    let bytes: Vec<u8> = stream[cursor..cursor + 4].iter().map(|(b, _)| *b).collect();
                    let len = LittleEndian::read_u32(&bytes) as usize;
                    cursor += 4 + len;
                }
                XLR_BLOCK_ID_ORIGIN => cursor += 2,
                XLR_BLOCK_ID_TOPLEVEL_XID => cursor += 4,
                id if (id as usize) < 32 => {
                    if cursor + 3 > record_end {
                        break;
                    }
                    let fork_flags = stream[cursor].0;
                    cursor += 1;
                    let data_length_bytes: Vec<u8> = stream[cursor..cursor + 2].iter().map(|(b, _)| *b).collect();
                    let _data_length = LittleEndian::read_u16(&data_length_bytes);
                    cursor += 2;

                    if fork_flags & BKPBLOCK_HAS_IMAGE != 0 {
                        if cursor + 4 > record_end {
                            break;
                        }
                        cursor += 4;
                    }
                    let _ = fork_flags & BKPBLOCK_HAS_DATA;

                    let (tblspcnode, dbnode, relnode) = if fork_flags & BKPBLOCK_SAME_REL != 0 {
                        match last_rel {
                            Some(rel) => rel,
                            None => break,
                        }
                    } else {
                        if cursor + 12 > record_end {
                            break;
                        }
                        let bytes: Vec<u8> = stream[cursor..cursor + 12].iter().map(|(b, _)| *b).collect();
                        cursor += 12;
                        (
                            LittleEndian::read_u32(&bytes[0..4]),
                            LittleEndian::read_u32(&bytes[4..8]),
                            LittleEndian::read_u32(&bytes[8..12]),
                        )
                    };
                    last_rel = Some((tblspcnode, dbnode, relnode));

                    if cursor + 4 > record_end {
                        break;
                    }
                    let bytes: Vec<u8> = stream[cursor..cursor + 4].iter().map(|(b, _)| *b).collect();
                    cursor += 4;
                    let block = LittleEndian::read_u32(&bytes);
                    let forknum = fork_flags & BKPBLOCK_FORK_MASK;

                    refs.push(WalBlockRef {
                        lsn: record_lsn,
                        tblspcnode,
                        dbnode,
                        relnode,
                        forknum,
                        block,
                    });
                }
                _ => break,
            }
        }

        i += maxalign(tot_len);
    }

    refs
}
