#![forbid(unsafe_code)]
//! Free-block bitmap allocator.
//!
//! AmigaDOS tracks free blocks with one bit per non-reserved block
//! (1 = free), stored in bitmap blocks referenced from the root block's
//! inline `bm_pages` table and, beyond 25 blocks, a chain of bitmap
//! extension blocks.
//!
//! The allocator mutates free state in memory (`set_bit` / `clr_bit`)
//! and persists with [`BitmapAlloc::write_only_bits`], which rewrites
//! just the bitmap blocks. Callers must persist immediately after every
//! allocation or free, before writing the structural blocks that
//! reference the affected blocks: the allocator has no transaction log,
//! and a crash between the two leaves an inconsistency only the
//! validator can find.

use adf_block::BlockDevice;
use adf_error::{AdfError, Result};
use adf_ondisk::{BitmapBlock, BitmapExtBlock, RootBlock};
use adf_types::{BlockNum, Geometry};
use std::collections::HashSet;

// ── Raw bit helpers ─────────────────────────────────────────────────────────

/// Get bit `idx` (1 = free). Bits are LSB-first within each word.
#[must_use]
pub fn bit_get(words: &[u32], idx: u32) -> bool {
    let word = (idx / 32) as usize;
    word < words.len() && (words[word] >> (idx % 32)) & 1 == 1
}

/// Set bit `idx` (mark free).
pub fn bit_set(words: &mut [u32], idx: u32) {
    let word = (idx / 32) as usize;
    if word < words.len() {
        words[word] |= 1 << (idx % 32);
    }
}

/// Clear bit `idx` (mark used).
pub fn bit_clear(words: &mut [u32], idx: u32) {
    let word = (idx / 32) as usize;
    if word < words.len() {
        words[word] &= !(1 << (idx % 32));
    }
}

/// Count free bits among the first `total` bits.
#[must_use]
pub fn count_free_bits(words: &[u32], total: u32) -> u32 {
    let full = (total / 32) as usize;
    let mut free: u32 = words.iter().take(full).map(|w| w.count_ones()).sum();
    let rem = total % 32;
    if rem > 0 && full < words.len() {
        free += (words[full] & ((1_u32 << rem) - 1)).count_ones();
    }
    free
}

/// Mask for the valid bits of the final partial word.
#[must_use]
pub fn trailing_mask(total: u32) -> u32 {
    match total % 32 {
        0 => u32::MAX,
        rem => (1_u32 << rem) - 1,
    }
}

// ── Bitmap allocator ────────────────────────────────────────────────────────

/// In-memory view of the volume bitmap plus the block numbers it
/// persists to.
///
/// Bit `k` covers block `reserved + k`. Trailing bits of the final
/// word are kept zero in memory and masked on read, so counts never
/// include phantom blocks.
#[derive(Debug, Clone)]
pub struct BitmapAlloc {
    geo: Geometry,
    words: Vec<u32>,
    bitmap_blocks: Vec<BlockNum>,
    ext_blocks: Vec<BlockNum>,
}

impl BitmapAlloc {
    /// A fresh bitmap with every non-reserved block free and no
    /// backing blocks attached yet. Volume creation clears the bits of
    /// the blocks it places and then calls [`Self::attach_blocks`].
    #[must_use]
    pub fn new_all_free(geo: Geometry) -> Self {
        let total = geo.bitmap_bits();
        let nwords = total.div_ceil(32) as usize;
        let mut words = vec![u32::MAX; nwords];
        if let Some(last) = words.last_mut() {
            *last &= trailing_mask(total);
        }
        Self {
            geo,
            words,
            bitmap_blocks: Vec::new(),
            ext_blocks: Vec::new(),
        }
    }

    /// Read the bitmap referenced by `root`, following the inline page
    /// table and then the extension chain (cycle-guarded).
    pub fn read(dev: &dyn BlockDevice, root: &RootBlock) -> Result<Self> {
        let geo = dev.geometry();
        let mut pages = root.bm_pages.clone();
        let mut ext_blocks = Vec::new();

        let mut seen: HashSet<u32> = HashSet::new();
        let mut ext = root.bm_ext;
        while ext != 0 {
            if !geo.contains(BlockNum(ext)) {
                return Err(AdfError::InvalidBitmapBlock {
                    block: ext,
                    detail: "bitmap extension pointer out of range".to_owned(),
                });
            }
            if !seen.insert(ext) {
                return Err(AdfError::InvalidBitmapBlock {
                    block: ext,
                    detail: "cycle in bitmap extension chain".to_owned(),
                });
            }
            let bytes = dev.read_block(BlockNum(ext))?;
            let ext_block = BitmapExtBlock::read(geo, &bytes)?;
            ext_blocks.push(BlockNum(ext));
            pages.extend(ext_block.pages);
            ext = ext_block.next;
        }

        let expected = geo.bitmap_blocks_needed();
        let actual = pages.len() as u32;
        if actual != expected {
            return Err(AdfError::BitmapBlockCountMismatch { expected, actual });
        }

        let total = geo.bitmap_bits();
        let mut words = Vec::with_capacity(total.div_ceil(32) as usize);
        for page in &pages {
            if !geo.contains(*page) {
                return Err(AdfError::InvalidBitmapBlock {
                    block: page.0,
                    detail: "bitmap page pointer out of range".to_owned(),
                });
            }
            let bytes = dev.read_block(*page)?;
            let bm = BitmapBlock::read(geo, *page, &bytes)?;
            words.extend(bm.words);
        }

        let actual_bits = (words.len() as u32).saturating_mul(32);
        if actual_bits < total {
            return Err(AdfError::BitmapSizeMismatch {
                expected_bits: total,
                actual_bits,
            });
        }
        words.truncate(total.div_ceil(32) as usize);
        if let Some(last) = words.last_mut() {
            *last &= trailing_mask(total);
        }

        Ok(Self {
            geo,
            words,
            bitmap_blocks: pages,
            ext_blocks,
        })
    }

    /// Record where the bitmap persists. `pages` order matches the
    /// on-disk chain order.
    pub fn attach_blocks(&mut self, pages: Vec<BlockNum>, ext_blocks: Vec<BlockNum>) {
        self.bitmap_blocks = pages;
        self.ext_blocks = ext_blocks;
    }

    #[must_use]
    pub fn bitmap_blocks(&self) -> &[BlockNum] {
        &self.bitmap_blocks
    }

    #[must_use]
    pub fn ext_blocks(&self) -> &[BlockNum] {
        &self.ext_blocks
    }

    #[must_use]
    pub fn total_bits(&self) -> u32 {
        self.geo.bitmap_bits()
    }

    #[must_use]
    pub fn free_count(&self) -> u32 {
        count_free_bits(&self.words, self.total_bits())
    }

    #[must_use]
    pub fn used_count(&self) -> u32 {
        self.total_bits() - self.free_count()
    }

    /// Raw words, masked to the valid bit range.
    #[must_use]
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    fn bit_index(&self, block: BlockNum) -> Result<u32> {
        if !self.geo.contains(block) {
            return Err(AdfError::BlockOutOfRange {
                block: block.0,
                num_blocks: self.geo.num_blocks(),
            });
        }
        Ok(block.0 - self.geo.reserved())
    }

    pub fn is_free(&self, block: BlockNum) -> Result<bool> {
        Ok(bit_get(&self.words, self.bit_index(block)?))
    }

    /// Mark `block` free (in memory only).
    pub fn set_bit(&mut self, block: BlockNum) -> Result<()> {
        let idx = self.bit_index(block)?;
        bit_set(&mut self.words, idx);
        Ok(())
    }

    /// Mark `block` used (in memory only).
    pub fn clr_bit(&mut self, block: BlockNum) -> Result<()> {
        let idx = self.bit_index(block)?;
        bit_clear(&mut self.words, idx);
        Ok(())
    }

    /// Linear scan for up to `n` free blocks (not necessarily
    /// contiguous). `None` when fewer than `n` are free; the bitmap is
    /// not modified.
    #[must_use]
    pub fn find_n_free(&self, n: u32) -> Option<Vec<BlockNum>> {
        let mut found = Vec::with_capacity(n as usize);
        if n == 0 {
            return Some(found);
        }
        for idx in 0..self.total_bits() {
            if bit_get(&self.words, idx) {
                found.push(BlockNum(self.geo.reserved() + idx));
                if found.len() as u32 == n {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Find and claim `n` free blocks, surfacing `NoFreeBlocks` when
    /// the volume cannot satisfy the request. The caller must persist
    /// with [`Self::write_only_bits`] before writing any block that
    /// references the result.
    pub fn alloc_n(&mut self, n: u32) -> Result<Vec<BlockNum>> {
        let blocks = self.find_n_free(n).ok_or_else(|| AdfError::NoFreeBlocks {
            requested: n,
            available: self.free_count(),
        })?;
        for block in &blocks {
            self.clr_bit(*block)?;
        }
        Ok(blocks)
    }

    /// Persist just the bitmap blocks (the extension chain only holds
    /// pointers and never changes after creation).
    pub fn write_only_bits(&self, dev: &dyn BlockDevice) -> Result<()> {
        let expected = self.geo.bitmap_blocks_needed();
        if self.bitmap_blocks.len() as u32 != expected {
            return Err(AdfError::BitmapBlockCountMismatch {
                expected,
                actual: self.bitmap_blocks.len() as u32,
            });
        }

        let words_per_block = self.geo.block_longs() as usize - 1;
        for (i, page) in self.bitmap_blocks.iter().enumerate() {
            let start = i * words_per_block;
            let end = (start + words_per_block).min(self.words.len());
            let mut words = vec![0_u32; words_per_block];
            if start < self.words.len() {
                words[..end - start].copy_from_slice(&self.words[start..end]);
            }
            let bytes = BitmapBlock { words }.to_bytes(self.geo)?;
            dev.write_block(*page, &bytes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adf_block::MemBlockDevice;
    use adf_types::TimeStamp;

    fn geo() -> Geometry {
        Geometry::floppy_dd()
    }

    #[test]
    fn raw_bit_helpers() {
        let mut words = vec![0_u32; 2];
        assert!(!bit_get(&words, 5));
        bit_set(&mut words, 5);
        assert!(bit_get(&words, 5));
        bit_set(&mut words, 33);
        assert_eq!(words[1], 2);
        bit_clear(&mut words, 5);
        assert!(!bit_get(&words, 5));
        // Out-of-range access is inert.
        bit_set(&mut words, 1000);
        assert!(!bit_get(&words, 1000));
    }

    #[test]
    fn trailing_mask_values() {
        assert_eq!(trailing_mask(32), u32::MAX);
        assert_eq!(trailing_mask(1758 % 32 + 32 * 54), trailing_mask(1758));
        assert_eq!(trailing_mask(1758), (1 << 30) - 1);
    }

    #[test]
    fn fresh_bitmap_has_all_blocks_free() {
        let alloc = BitmapAlloc::new_all_free(geo());
        assert_eq!(alloc.total_bits(), 1758);
        assert_eq!(alloc.free_count(), 1758);
        assert_eq!(alloc.used_count(), 0);
        assert!(alloc.is_free(BlockNum(2)).unwrap());
        assert!(alloc.is_free(BlockNum(1759)).unwrap());
    }

    #[test]
    fn bit_index_rejects_reserved_and_out_of_range() {
        let alloc = BitmapAlloc::new_all_free(geo());
        assert!(matches!(
            alloc.is_free(BlockNum(0)),
            Err(AdfError::BlockOutOfRange { .. })
        ));
        assert!(matches!(
            alloc.is_free(BlockNum(1760)),
            Err(AdfError::BlockOutOfRange { .. })
        ));
    }

    #[test]
    fn find_n_free_is_a_pure_scan() {
        let mut alloc = BitmapAlloc::new_all_free(geo());
        let found = alloc.find_n_free(3).unwrap();
        assert_eq!(found, vec![BlockNum(2), BlockNum(3), BlockNum(4)]);
        // Nothing was claimed.
        assert_eq!(alloc.free_count(), 1758);

        alloc.clr_bit(BlockNum(3)).unwrap();
        let found = alloc.find_n_free(3).unwrap();
        assert_eq!(found, vec![BlockNum(2), BlockNum(4), BlockNum(5)]);
    }

    #[test]
    fn alloc_n_surfaces_no_free_blocks() {
        let mut alloc = BitmapAlloc::new_all_free(geo());
        let taken = alloc.alloc_n(1758).unwrap();
        assert_eq!(taken.len(), 1758);
        assert_eq!(alloc.free_count(), 0);

        let err = alloc.alloc_n(1).unwrap_err();
        assert!(matches!(
            err,
            AdfError::NoFreeBlocks {
                requested: 1,
                available: 0
            }
        ));
    }

    #[test]
    fn allocate_then_free_restores_bitmap_bit_for_bit() {
        let mut alloc = BitmapAlloc::new_all_free(geo());
        alloc.clr_bit(BlockNum(880)).unwrap();
        let before = alloc.words().to_vec();

        let taken = alloc.find_n_free(40).unwrap();
        for block in &taken {
            alloc.clr_bit(*block).unwrap();
        }
        assert_ne!(alloc.words(), &before[..]);
        for block in &taken {
            alloc.set_bit(*block).unwrap();
        }
        assert_eq!(alloc.words(), &before[..]);
    }

    /// Build a device holding a root + persisted bitmap for read tests.
    fn device_with_bitmap() -> (MemBlockDevice, RootBlock) {
        let dev = MemBlockDevice::new(geo());
        let mut alloc = BitmapAlloc::new_all_free(geo());
        alloc.clr_bit(BlockNum(880)).unwrap();
        alloc.clr_bit(BlockNum(881)).unwrap();
        alloc.attach_blocks(vec![BlockNum(881)], Vec::new());
        alloc.write_only_bits(&dev).unwrap();

        let mut root = RootBlock::new(geo(), b"Test".to_vec(), TimeStamp::default());
        root.bm_pages = vec![BlockNum(881)];
        dev.write_block(BlockNum(880), &root.to_bytes(geo()).unwrap())
            .unwrap();
        (dev, root)
    }

    #[test]
    fn read_round_trips_persisted_state() {
        let (dev, root) = device_with_bitmap();
        let alloc = BitmapAlloc::read(&dev, &root).unwrap();
        assert_eq!(alloc.free_count(), 1756);
        assert!(!alloc.is_free(BlockNum(880)).unwrap());
        assert!(!alloc.is_free(BlockNum(881)).unwrap());
        assert!(alloc.is_free(BlockNum(882)).unwrap());
        assert_eq!(alloc.bitmap_blocks(), &[BlockNum(881)]);
    }

    #[test]
    fn read_rejects_wrong_page_count() {
        let (dev, mut root) = device_with_bitmap();
        root.bm_pages.clear();
        let err = BitmapAlloc::read(&dev, &root).unwrap_err();
        assert!(matches!(
            err,
            AdfError::BitmapBlockCountMismatch {
                expected: 1,
                actual: 0
            }
        ));
    }

    #[test]
    fn read_rejects_corrupt_bitmap_checksum() {
        let (dev, root) = device_with_bitmap();
        dev.patch(BlockNum(881), 16, &[0xFF]).unwrap();
        let err = BitmapAlloc::read(&dev, &root).unwrap_err();
        assert!(matches!(
            err,
            AdfError::InvalidBitmapBlock { block: 881, .. }
        ));
    }

    #[test]
    fn read_detects_extension_chain_cycle() {
        let (dev, mut root) = device_with_bitmap();
        // An extension block at 900 pointing at itself.
        let ext = BitmapExtBlock {
            pages: Vec::new(),
            next: 900,
        };
        dev.write_block(BlockNum(900), &ext.to_bytes(geo()).unwrap())
            .unwrap();
        root.bm_ext = 900;

        let err = BitmapAlloc::read(&dev, &root).unwrap_err();
        assert!(matches!(err, AdfError::InvalidBitmapBlock { block: 900, .. }));
    }

    #[test]
    fn write_only_bits_touches_only_bitmap_blocks() {
        let (dev, root) = device_with_bitmap();
        let mut alloc = BitmapAlloc::read(&dev, &root).unwrap();

        let root_before = dev.read_block(BlockNum(880)).unwrap();
        alloc.clr_bit(BlockNum(1000)).unwrap();
        alloc.write_only_bits(&dev).unwrap();
        assert_eq!(dev.read_block(BlockNum(880)).unwrap(), root_before);

        let reread = BitmapAlloc::read(&dev, &root).unwrap();
        assert!(!reread.is_free(BlockNum(1000)).unwrap());
    }

    #[test]
    fn multi_block_bitmap_chain() {
        // 512-byte blocks, 10_000 blocks: 9998 bits, 4064 per bitmap
        // block → 3 bitmap blocks, still inline in the root.
        let geo = Geometry::new(512, 10_000, 2).unwrap();
        assert_eq!(geo.bitmap_blocks_needed(), 3);

        let dev = MemBlockDevice::new(geo);
        let mut alloc = BitmapAlloc::new_all_free(geo);
        let pages = vec![BlockNum(5001), BlockNum(5002), BlockNum(5003)];
        for p in &pages {
            alloc.clr_bit(*p).unwrap();
        }
        alloc.clr_bit(BlockNum(5000)).unwrap();
        alloc.attach_blocks(pages.clone(), Vec::new());
        alloc.write_only_bits(&dev).unwrap();

        let mut root = RootBlock::new(geo, b"Big".to_vec(), TimeStamp::default());
        root.bm_pages = pages;
        dev.write_block(BlockNum(5000), &root.to_bytes(geo).unwrap())
            .unwrap();

        let back = BitmapAlloc::read(&dev, &root).unwrap();
        assert_eq!(back.free_count(), 9998 - 4);
        assert!(!back.is_free(BlockNum(5003)).unwrap());
        assert!(back.is_free(BlockNum(9999)).unwrap());
    }
}
