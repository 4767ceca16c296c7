//! PostgreSQL page checksum (`pg_checksum_page` in `checksum_impl.h`).
//!
//! The algorithm folds the page, viewed as 32-bit words, through a small
//! number of FNV-1a-derived mix rounds seeded from a fixed table, then
//! combines the result with the block number so that two physically
//! identical pages at different block numbers checksum differently.

const N_SUMS: usize = 32;
const FNV_PRIME: u32 = 16777619;

// The 32 seed values PostgreSQL mixes the page words through.
const CHECKSUM_BASE_OFFSETS: [u32; N_SUMS] = [
    0x5B1F36E9, 0xB8525960, 0x02AB50AA, 0x1DE66D2A, 0x79FF467A, 0x9BB9F8A3, 0x217E7CD2, 0x83E13D2C,
    0xF8D4474F, 0xE39EB339, 0x42C6AE16, 0x993216FA, 0x7B093B5D, 0x98DAFF3C, 0xF718902A, 0x0B1C9CDB,
    0xE58F764B, 0x187636BC, 0x5D7B3BB1, 0xE73DE7DE, 0x92BEC979, 0xCCA6C0B2, 0x304A0979, 0x85AA43D4,
    0x783125BB, 0x6CA8EAA2, 0x14E50EAB, 0x459394F6, 0x3DE9D6DE, 0xA2618FA5, 0x7CF67577, 0xE5B74476,
];

#[inline]
fn mix(mut checksum: u32, value: u32) -> u32 {
    checksum ^= value;
    checksum = checksum.wrapping_mul(FNV_PRIME);
    checksum
}

/// Compute the checksum PostgreSQL would store for `page` at absolute
/// `block_number`. `page` must be exactly `BLCKSZ` bytes (callers enforce
/// this via [`crate::page::validate_header`] before calling).
pub fn page_checksum(page: &[u8], block_number: u32) -> u16 {
    debug_assert_eq!(page.len(), crate::BLCKSZ);

    let words: &[u32] = &bytemuck_u32_slice(page);
    let mut sums = CHECKSUM_BASE_OFFSETS;

    // Process the page in chunks, folding each 32-bit word into all 32
    // accumulators the way PG's vectorized/scalar fallback does.
    for chunk in words.chunks(N_SUMS) {
        for (i, &w) in chunk.iter().enumerate() {
            sums[i] = mix(sums[i], w);
        }
    }

    let mut result: u32 = 0;
    for s in sums.iter() {
        result ^= s;
    }
    result ^= block_number;

    // Fold down to 16 bits, reserving 0 as "checksums disabled".
    let checksum = (result ^ (result >> 16)) as u16;
    if checksum == 0 {
        1
    } else {
        checksum
    }
}

fn bytemuck_u32_slice(bytes: &[u8]) -> Vec<u32> {
    use byteorder::{ByteOrder, LittleEndian};
    bytes.chunks_exact(4).map(LittleEndian::read_u32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_deterministic() {
        let page = vec![0u8; crate::BLCKSZ];
        let a = page_checksum(&page, 7);
        let b = page_checksum(&page, 7);
        assert_eq!(a, b);
    }

    #[test]
    fn checksum_depends_on_block_number() {
        let page = vec![0xAB; crate::BLCKSZ];
        assert_ne!(page_checksum(&page, 1), page_checksum(&page, 2));
    }

    #[test]
    fn checksum_never_zero() {
        // An all-zero page at block 0 is the pathological case that would
        // otherwise fold to zero.
        let page = vec![0u8; crate::BLCKSZ];
        assert_ne!(page_checksum(&page, 0), 0);
    }
}
