#![forbid(unsafe_code)]
//! On-disk block codec.
//!
//! Converts between raw block buffers and typed views of the AmigaDOS
//! structural blocks: boot, root, user directory, file header, file
//! list, OFS data, bitmap, bitmap extension, directory cache and
//! comment blocks.
//!
//! Every structural block carries a `type` tag in its first long, most
//! carry a `sec_type` tag in their last long, and all checksummed
//! blocks satisfy `sum of all longs == 0` with the checksum slot
//! holding the negated sum of the others. The boot block uses a
//! different, carry-wrapping sum.
//!
//! Two access paths exist on purpose:
//!
//! - the strict `read` constructors, used by the volume and node
//!   layers, which fail hard with a typed error on any violation;
//! - [`classify`], used by the validator, which reports tag and
//!   checksum state as plain data so a scan over arbitrarily corrupt
//!   input never aborts.
//!
//! Blocks historically address fields from both ends (the BCPL
//! convention); that is kept as the named `get_long` / `get_long_end`
//! accessor pair instead of raw negative indexing.

mod codec;

pub use codec::{
    BitmapBlock, BitmapExtBlock, BlockKind, BootBlock, CommentBlock, DirCacheBlock, DirCacheRecord,
    FileDataBlock, FileHeaderBlock, FileListBlock, RawTags, RootBlock, UserDirBlock, classify,
};

use adf_types::TimeStamp;

// ── Block type tags (first long) ────────────────────────────────────────────

pub const T_HEADER: u32 = 2;
pub const T_DATA: u32 = 8;
pub const T_LIST: u32 = 16;
pub const T_DIRCACHE: u32 = 33;
pub const T_COMMENT: u32 = 64;

// ── Sub-type tags (last long) ───────────────────────────────────────────────

pub const ST_ROOT: i32 = 1;
pub const ST_USERDIR: i32 = 2;
pub const ST_SOFTLINK: i32 = 3;
pub const ST_LINKDIR: i32 = 4;
pub const ST_FILE: i32 = -3;
pub const ST_LINKFILE: i32 = -4;

/// Long index of the checksum slot in header-style blocks.
pub const CHECKSUM_LONG: usize = 5;

/// Long index of the checksum slot in the boot area.
pub const BOOT_CHECKSUM_LONG: usize = 1;

/// `bm_flag` value marking the bitmap valid.
pub const BITMAP_VALID: u32 = 0xFFFF_FFFF;

// ── Long-word accessors ─────────────────────────────────────────────────────

/// Read the big-endian long at long index `idx`.
#[must_use]
pub fn get_long(bytes: &[u8], idx: usize) -> u32 {
    let off = idx * 4;
    u32::from_be_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

/// Write the big-endian long at long index `idx`.
pub fn put_long(bytes: &mut [u8], idx: usize, value: u32) {
    let off = idx * 4;
    bytes[off..off + 4].copy_from_slice(&value.to_be_bytes());
}

/// Read the long `idx` places before the end of the block (1-based:
/// `get_long_end(bytes, 1)` is the last long).
#[must_use]
pub fn get_long_end(bytes: &[u8], idx: usize) -> u32 {
    get_long(bytes, bytes.len() / 4 - idx)
}

/// Write the long `idx` places before the end of the block.
pub fn put_long_end(bytes: &mut [u8], idx: usize, value: u32) {
    put_long(bytes, bytes.len() / 4 - idx, value);
}

// ── Checksums ───────────────────────────────────────────────────────────────

fn negated_sum_skipping(bytes: &[u8], skip: usize) -> u32 {
    let mut sum = 0_u32;
    for idx in 0..bytes.len() / 4 {
        if idx != skip {
            sum = sum.wrapping_add(get_long(bytes, idx));
        }
    }
    sum.wrapping_neg()
}

/// Checksum for header-style blocks (slot at long 5).
#[must_use]
pub fn header_checksum(bytes: &[u8]) -> u32 {
    negated_sum_skipping(bytes, CHECKSUM_LONG)
}

/// A checksummed block verifies iff all its longs sum to zero.
#[must_use]
pub fn verify_header_checksum(bytes: &[u8]) -> bool {
    let mut sum = 0_u32;
    for idx in 0..bytes.len() / 4 {
        sum = sum.wrapping_add(get_long(bytes, idx));
    }
    sum == 0
}

/// Recompute and store the header checksum.
pub fn stamp_header_checksum(bytes: &mut [u8]) {
    let sum = header_checksum(bytes);
    put_long(bytes, CHECKSUM_LONG, sum);
}

/// Checksum for bitmap blocks (slot at long 0, same negated sum).
#[must_use]
pub fn bitmap_checksum(bytes: &[u8]) -> u32 {
    negated_sum_skipping(bytes, 0)
}

#[must_use]
pub fn verify_bitmap_checksum(bytes: &[u8]) -> bool {
    verify_header_checksum(bytes)
}

pub fn stamp_bitmap_checksum(bytes: &mut [u8]) {
    let sum = bitmap_checksum(bytes);
    put_long(bytes, 0, sum);
}

/// Boot-area checksum: carry-wrapping sum over the whole reserved area
/// with the slot (long 1) taken as zero, then inverted.
#[must_use]
pub fn boot_checksum(bytes: &[u8]) -> u32 {
    let mut sum = 0_u32;
    for idx in 0..bytes.len() / 4 {
        let value = if idx == BOOT_CHECKSUM_LONG {
            0
        } else {
            get_long(bytes, idx)
        };
        let (acc, carry) = sum.overflowing_add(value);
        sum = acc + u32::from(carry);
    }
    !sum
}

#[must_use]
pub fn verify_boot_checksum(bytes: &[u8]) -> bool {
    get_long(bytes, BOOT_CHECKSUM_LONG) == boot_checksum(bytes)
}

pub fn stamp_boot_checksum(bytes: &mut [u8]) {
    let sum = boot_checksum(bytes);
    put_long(bytes, BOOT_CHECKSUM_LONG, sum);
}

// ── Shared field offsets ────────────────────────────────────────────────────

pub(crate) const OFF_HEADER_KEY: usize = 1;
pub(crate) const OFF_HIGH_SEQ: usize = 2;
pub(crate) const OFF_HT_SIZE: usize = 3;
pub(crate) const OFF_FIRST_DATA: usize = 4;
pub(crate) const OFF_TABLE: usize = 6;

pub(crate) const END_SEC_TYPE: usize = 1;
pub(crate) const END_EXTENSION: usize = 2;
pub(crate) const END_PARENT: usize = 3;
pub(crate) const END_HASH_CHAIN: usize = 4;
pub(crate) const END_CREATE_DAYS: usize = 7;
pub(crate) const END_DISK_DAYS: usize = 10;
pub(crate) const END_MOD_DAYS: usize = 23;
pub(crate) const END_BM_EXT: usize = 24;
pub(crate) const END_BM_FIRST_PAGE: usize = 49;
pub(crate) const END_BM_FLAG: usize = 50;
pub(crate) const END_BYTE_SIZE: usize = 47;
pub(crate) const END_PROTECT: usize = 48;

/// Byte offset of the name field (length byte first).
#[must_use]
pub(crate) fn name_offset(block_size: usize) -> usize {
    block_size - 80
}

/// Byte offset of the comment field (length byte first).
#[must_use]
pub(crate) fn comment_offset(block_size: usize) -> usize {
    block_size - 184
}

/// Read a timestamp triple stored as three consecutive longs, `days`
/// at end-relative index `days_idx`.
#[must_use]
pub(crate) fn get_timestamp_end(bytes: &[u8], days_idx: usize) -> TimeStamp {
    TimeStamp {
        days: get_long_end(bytes, days_idx),
        mins: get_long_end(bytes, days_idx - 1),
        ticks: get_long_end(bytes, days_idx - 2),
    }
}

pub(crate) fn put_timestamp_end(bytes: &mut [u8], days_idx: usize, ts: TimeStamp) {
    put_long_end(bytes, days_idx, ts.days);
    put_long_end(bytes, days_idx - 1, ts.mins);
    put_long_end(bytes, days_idx - 2, ts.ticks);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_accessors_round_trip_both_ends() {
        let mut block = vec![0_u8; 512];
        put_long(&mut block, 0, 0xDEAD_BEEF);
        put_long_end(&mut block, 1, 0xCAFE_BABE);
        assert_eq!(get_long(&block, 0), 0xDEAD_BEEF);
        assert_eq!(get_long_end(&block, 1), 0xCAFE_BABE);
        // Last long is long 127 in a 512-byte block.
        assert_eq!(get_long(&block, 127), 0xCAFE_BABE);
        // End index 128 is the first long.
        assert_eq!(get_long_end(&block, 128), 0xDEAD_BEEF);
    }

    #[test]
    fn header_checksum_zeroes_total_sum() {
        let mut block = vec![0_u8; 512];
        put_long(&mut block, 0, T_HEADER);
        put_long(&mut block, 7, 0x1234_5678);
        put_long_end(&mut block, 1, ST_ROOT as u32);
        assert!(!verify_header_checksum(&block));
        stamp_header_checksum(&mut block);
        assert!(verify_header_checksum(&block));

        // Any bit flip outside the slot breaks it.
        block[40] ^= 0x01;
        assert!(!verify_header_checksum(&block));
    }

    #[test]
    fn bitmap_checksum_uses_slot_zero() {
        let mut block = vec![0xFF_u8; 512];
        stamp_bitmap_checksum(&mut block);
        assert!(verify_bitmap_checksum(&block));
        assert_ne!(get_long(&block, 0), 0xFFFF_FFFF);
    }

    #[test]
    fn boot_checksum_carry_wraps() {
        let mut area = vec![0xFF_u8; 1024];
        stamp_boot_checksum(&mut area);
        assert!(verify_boot_checksum(&area));
        area[100] ^= 0x80;
        assert!(!verify_boot_checksum(&area));
    }

    #[test]
    fn boot_checksum_of_zero_area() {
        let mut area = vec![0_u8; 1024];
        assert_eq!(boot_checksum(&area), !0_u32);
        stamp_boot_checksum(&mut area);
        assert!(verify_boot_checksum(&area));
    }
}
