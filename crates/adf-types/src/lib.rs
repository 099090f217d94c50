#![forbid(unsafe_code)]
//! Core types shared by the adf workspace.
//!
//! Unit-carrying newtypes (block numbers, dos types, timestamps,
//! protection bits), validated device geometry, and the AmigaDOS name
//! rules (Latin-1 strings, international case folding, the classic
//! `h = (h * 13 + byte) & 0x7FF` directory hash).
//!
//! Small parse-level errors (`GeometryError`, `NameError`,
//! `ProtectParseError`) live here and are converted into the unified
//! `AdfError` at crate boundaries; this crate stays independent of
//! `adf-error` to avoid cyclic dependencies.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Physical block number on the filesystem device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNum(pub u32);

impl fmt::Display for BlockNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unix timestamp of the AmigaDOS epoch, 1 Jan 1978 00:00 UTC.
pub const AMIGA_EPOCH_UNIX: u64 = 252_460_800;

/// Ticks per second in AmigaDOS timestamps.
pub const TICKS_PER_SEC: u32 = 50;

/// Longs occupied by the fixed head and tail of a directory-like block.
/// The hash table (or data-pointer table) fills the remainder.
pub const HEADER_RESERVED_LONGS: u32 = 56;

/// Maximum entry name length for classic (non-LNFS) volumes.
pub const MAX_NAME_LEN: usize = 30;

/// Maximum entry name length in long-filename (DOS6/DOS7) mode.
pub const MAX_LONG_NAME_LEN: usize = 110;

/// Maximum comment length.
pub const MAX_COMMENT_LEN: usize = 79;

/// Inline bitmap-block pointers in the root block.
pub const ROOT_BITMAP_PAGES: usize = 25;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("block size {0} is not a power of two >= 512")]
    BadBlockSize(u32),
    #[error("reserved block count {0} must be at least 1")]
    BadReserved(u32),
    #[error("device has {num_blocks} blocks but {reserved} are reserved")]
    TooSmall { num_blocks: u32, reserved: u32 },
}

/// Validated device geometry, threaded explicitly through every layer.
///
/// Nothing in the workspace assumes 512-byte blocks or two boot blocks;
/// all derived sizes come from here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    block_size: u32,
    num_blocks: u32,
    reserved: u32,
}

impl Geometry {
    pub fn new(block_size: u32, num_blocks: u32, reserved: u32) -> Result<Self, GeometryError> {
        if block_size < 512 || !block_size.is_power_of_two() {
            return Err(GeometryError::BadBlockSize(block_size));
        }
        if reserved == 0 {
            return Err(GeometryError::BadReserved(reserved));
        }
        if num_blocks <= reserved {
            return Err(GeometryError::TooSmall {
                num_blocks,
                reserved,
            });
        }
        Ok(Self {
            block_size,
            num_blocks,
            reserved,
        })
    }

    /// Standard double-density 3.5" floppy: 880 KiB, 512-byte blocks.
    #[must_use]
    pub fn floppy_dd() -> Self {
        Self {
            block_size: 512,
            num_blocks: 1760,
            reserved: 2,
        }
    }

    /// High-density 3.5" floppy: 1760 KiB.
    #[must_use]
    pub fn floppy_hd() -> Self {
        Self {
            block_size: 512,
            num_blocks: 3520,
            reserved: 2,
        }
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[must_use]
    pub fn num_blocks(&self) -> u32 {
        self.num_blocks
    }

    #[must_use]
    pub fn reserved(&self) -> u32 {
        self.reserved
    }

    /// 32-bit words per block.
    #[must_use]
    pub fn block_longs(&self) -> u32 {
        self.block_size / 4
    }

    /// Directory hash-table slots (and inline data pointers per file
    /// header): `block_longs - 56`.
    #[must_use]
    pub fn hash_table_size(&self) -> u32 {
        self.block_longs() - HEADER_RESERVED_LONGS
    }

    /// Where the root block lives unless the boot block says otherwise.
    #[must_use]
    pub fn root_block_hint(&self) -> BlockNum {
        BlockNum(self.num_blocks / 2)
    }

    /// Payload bytes per OFS data block (24-byte per-block header).
    #[must_use]
    pub fn ofs_data_bytes(&self) -> u32 {
        self.block_size - 24
    }

    /// Free-state bits held by a single bitmap block (first long is the
    /// checksum).
    #[must_use]
    pub fn bitmap_bits_per_block(&self) -> u32 {
        (self.block_size - 4) * 8
    }

    /// Bits the volume bitmap must cover: one per non-reserved block.
    #[must_use]
    pub fn bitmap_bits(&self) -> u32 {
        self.num_blocks - self.reserved
    }

    /// Bitmap blocks required to cover the volume.
    #[must_use]
    pub fn bitmap_blocks_needed(&self) -> u32 {
        self.bitmap_bits().div_ceil(self.bitmap_bits_per_block())
    }

    /// Whether `block` addresses a non-reserved filesystem block.
    #[must_use]
    pub fn contains(&self, block: BlockNum) -> bool {
        block.0 >= self.reserved && block.0 < self.num_blocks
    }
}

// ── Dos type ────────────────────────────────────────────────────────────────

/// `'D' 'O' 'S'` followed by the variant byte.
pub const DOS_BASE: u32 = 0x444F_5300;

const DOS_FLAG_FFS: u32 = 0x01;

/// The 32-bit volume tag from the boot block.
///
/// The low byte selects the filesystem variant: bit 0 toggles FFS,
/// values 2-3 are international, 4-5 directory-cache (which implies
/// international), 6-7 long-filename (which also implies international).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DosType(pub u32);

impl DosType {
    pub const OFS: Self = Self(DOS_BASE);
    pub const FFS: Self = Self(DOS_BASE | 1);
    pub const OFS_INTL: Self = Self(DOS_BASE | 2);
    pub const FFS_INTL: Self = Self(DOS_BASE | 3);
    pub const OFS_DIRCACHE: Self = Self(DOS_BASE | 4);
    pub const FFS_DIRCACHE: Self = Self(DOS_BASE | 5);
    pub const OFS_LONGNAME: Self = Self(DOS_BASE | 6);
    pub const FFS_LONGNAME: Self = Self(DOS_BASE | 7);

    /// True when the tag carries the `DOS` magic and a known variant.
    #[must_use]
    pub fn is_valid(self) -> bool {
        (self.0 & 0xFFFF_FF00) == DOS_BASE && (self.0 & 0xFF) <= 7
    }

    /// Variant byte, 0..=7 for valid tags.
    #[must_use]
    pub fn flags(self) -> u32 {
        self.0 & 0xFF
    }

    #[must_use]
    pub fn is_ffs(self) -> bool {
        self.flags() & DOS_FLAG_FFS != 0
    }

    /// International mode: set for DOS2 and above (dircache and
    /// long-filename variants fold Latin-1 as well).
    #[must_use]
    pub fn is_intl(self) -> bool {
        self.flags() >= 2
    }

    #[must_use]
    pub fn is_dircache(self) -> bool {
        matches!(self.flags(), 4 | 5)
    }

    #[must_use]
    pub fn is_longname(self) -> bool {
        matches!(self.flags(), 6 | 7)
    }

    /// Maximum entry-name length under this variant.
    #[must_use]
    pub fn max_name_len(self) -> usize {
        if self.is_longname() {
            MAX_LONG_NAME_LEN
        } else {
            MAX_NAME_LEN
        }
    }
}

impl fmt::Display for DosType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "DOS{}", self.flags())
        } else {
            write!(f, "{:#010x}", self.0)
        }
    }
}

// ── Timestamps ──────────────────────────────────────────────────────────────

/// AmigaDOS timestamp triple: days since 1 Jan 1978, minutes past
/// midnight, ticks (1/50 s) past the minute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeStamp {
    pub days: u32,
    pub mins: u32,
    pub ticks: u32,
}

impl TimeStamp {
    #[must_use]
    pub fn new(days: u32, mins: u32, ticks: u32) -> Self {
        Self { days, mins, ticks }
    }

    /// Convert from Unix seconds; times before the Amiga epoch clamp to
    /// zero.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)] // mins/ticks bounded by 86_400
    pub fn from_unix(secs: u64) -> Self {
        let rel = secs.saturating_sub(AMIGA_EPOCH_UNIX);
        let days = (rel / 86_400).min(u64::from(u32::MAX)) as u32;
        let rem = rel % 86_400;
        Self {
            days,
            mins: (rem / 60) as u32,
            ticks: ((rem % 60) * u64::from(TICKS_PER_SEC)) as u32,
        }
    }

    /// Convert back to Unix seconds (tick remainder truncates).
    #[must_use]
    pub fn to_unix(self) -> u64 {
        AMIGA_EPOCH_UNIX
            + u64::from(self.days) * 86_400
            + u64::from(self.mins) * 60
            + u64::from(self.ticks / TICKS_PER_SEC)
    }
}

// ── Protection bits ─────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid protect string {0:?} (expected 8 chars of \"hsparwed\" or '-')")]
pub struct ProtectParseError(pub String);

/// HSPARWED protection flags.
///
/// Bit polarity is not uniform: the RWED nibble is active-low (a set
/// bit *denies* the operation) while H, S, P and A are active-high.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Protection(pub u32);

impl Protection {
    pub const DELETE: u32 = 0x01;
    pub const EXECUTE: u32 = 0x02;
    pub const WRITE: u32 = 0x04;
    pub const READ: u32 = 0x08;
    pub const ARCHIVE: u32 = 0x10;
    pub const PURE: u32 = 0x20;
    pub const SCRIPT: u32 = 0x40;
    pub const HOLD: u32 = 0x80;

    /// Letter order of the string form, most significant bit first.
    const LETTERS: [(u32, char, bool); 8] = [
        (Self::HOLD, 'h', true),
        (Self::SCRIPT, 's', true),
        (Self::PURE, 'p', true),
        (Self::ARCHIVE, 'a', true),
        (Self::READ, 'r', false),
        (Self::WRITE, 'w', false),
        (Self::EXECUTE, 'e', false),
        (Self::DELETE, 'd', false),
    ];

    /// Parse the `"hsparwed"` string form.
    pub fn parse(s: &str) -> Result<Self, ProtectParseError> {
        let chars: Vec<char> = s.chars().collect();
        if chars.len() != 8 {
            return Err(ProtectParseError(s.to_owned()));
        }
        let mut bits = 0_u32;
        for ((bit, letter, active_high), ch) in Self::LETTERS.iter().zip(&chars) {
            let lit = match ch.to_ascii_lowercase() {
                c if c == *letter => true,
                '-' => false,
                _ => return Err(ProtectParseError(s.to_owned())),
            };
            // RWED letters show the *allowed* state, so a shown letter
            // means the deny bit is clear.
            if lit == *active_high {
                bits |= bit;
            }
        }
        Ok(Self(bits))
    }

    #[must_use]
    pub fn is_readable(self) -> bool {
        self.0 & Self::READ == 0
    }

    #[must_use]
    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITE == 0
    }

    #[must_use]
    pub fn is_executable(self) -> bool {
        self.0 & Self::EXECUTE == 0
    }

    #[must_use]
    pub fn is_deletable(self) -> bool {
        self.0 & Self::DELETE == 0
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (bit, letter, active_high) in Self::LETTERS {
            let set = self.0 & bit != 0;
            if set == active_high {
                write!(f, "{letter}")?;
            } else {
                write!(f, "-")?;
            }
        }
        Ok(())
    }
}

// ── Names ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("name is empty")]
    Empty,
    #[error("name is {len} bytes, maximum is {max}")]
    TooLong { len: usize, max: usize },
    #[error("name contains reserved byte {byte:#04x}")]
    InvalidByte { byte: u8 },
}

/// Upper-case a Latin-1 byte the way AmigaDOS does.
///
/// Plain mode folds only `a-z`; international mode additionally folds
/// the accented range `0xE0..=0xFE`, skipping `0xF7` (the division
/// sign).
#[must_use]
pub fn to_upper(byte: u8, intl: bool) -> u8 {
    if byte.is_ascii_lowercase() || (intl && (0xE0..=0xFE).contains(&byte) && byte != 0xF7) {
        byte - 0x20
    } else {
        byte
    }
}

/// Validate an entry or volume name against `max` length.
///
/// `/` and `:` are path syntax and control bytes cannot appear in BCPL
/// strings; a too-long name is an error, never a truncation.
pub fn validate_name(name: &[u8], max: usize) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > max {
        return Err(NameError::TooLong {
            len: name.len(),
            max,
        });
    }
    for &byte in name {
        if byte < 0x20 || byte == b'/' || byte == b':' {
            return Err(NameError::InvalidByte { byte });
        }
    }
    Ok(())
}

/// Classic AmigaDOS directory hash.
///
/// Seeded with the name length, folded over the upper-cased bytes with
/// `h = (h * 13 + byte) & 0x7FF`, then reduced modulo the directory's
/// hash-table size.
#[must_use]
#[expect(clippy::cast_possible_truncation)] // validated names are at most 110 bytes
pub fn name_hash(name: &[u8], hash_size: u32, intl: bool) -> u32 {
    debug_assert!(hash_size > 0);
    let mut h = name.len() as u32;
    for &byte in name {
        h = (h.wrapping_mul(13).wrapping_add(u32::from(to_upper(byte, intl)))) & 0x7FF;
    }
    h % hash_size
}

/// Case-insensitive name equality under the volume's folding rules.
#[must_use]
pub fn names_equal(a: &[u8], b: &[u8], intl: bool) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|(&x, &y)| to_upper(x, intl) == to_upper(y, intl))
}
