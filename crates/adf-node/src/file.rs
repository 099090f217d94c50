//! File nodes: multi-block storage in OFS and FFS layouts.

use crate::{FsCtx, MetaInfo, now_ts};
use adf_block::BlockDevice;
use adf_error::{AdfError, Result};
use adf_ondisk::{FileDataBlock, FileHeaderBlock, FileListBlock};
use adf_types::BlockNum;
use std::collections::HashSet;

/// A file node owning its header block view.
#[derive(Debug)]
pub struct File {
    block: BlockNum,
    hdr: FileHeaderBlock,
}

/// Block budget for a file of a given size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FilePlan {
    pub num_data: u32,
    pub num_ext: u32,
    /// Payload bytes per data block (`block_size` on FFS, 24 less on
    /// OFS).
    pub data_bytes: u32,
}

impl FilePlan {
    pub(crate) fn total_blocks(self) -> u32 {
        1 + self.num_ext + self.num_data
    }
}

/// Compute the block budget: data blocks from the payload size, list
/// blocks from how many pointers overflow the header's inline table.
pub(crate) fn plan(fs: &FsCtx, len: usize) -> Result<FilePlan> {
    let geo = fs.geometry();
    let byte_size = u32::try_from(len).map_err(|_| AdfError::InternalError {
        detail: format!("file of {len} bytes exceeds the 32-bit size field"),
    })?;
    let data_bytes = if fs.dos_type.is_ffs() {
        geo.block_size()
    } else {
        geo.ofs_data_bytes()
    };
    let num_data = byte_size.div_ceil(data_bytes);
    let ptrs_per_block = geo.hash_table_size();
    let num_ext = num_data
        .saturating_sub(ptrs_per_block)
        .div_ceil(ptrs_per_block);
    Ok(FilePlan {
        num_data,
        num_ext,
        data_bytes,
    })
}

/// Write a complete new file: data blocks first, then the list chain,
/// then the header. `blocks` is the up-front allocation
/// `[header, ext..., data...]`; the bitmap was already persisted by the
/// allocator before any of these writes.
pub(crate) fn write_new_file(
    fs: &FsCtx,
    blocks: &[BlockNum],
    plan: FilePlan,
    data: &[u8],
    name: &[u8],
    meta: &MetaInfo,
    hash_chain: u32,
    parent: BlockNum,
) -> Result<FileHeaderBlock> {
    let geo = fs.geometry();
    let hdr_block = blocks[0];
    let ext_blocks = &blocks[1..1 + plan.num_ext as usize];
    let data_blocks = &blocks[1 + plan.num_ext as usize..];

    let chunk_bytes = plan.data_bytes as usize;
    for (i, &block) in data_blocks.iter().enumerate() {
        let start = i * chunk_bytes;
        let chunk = &data[start..(start + chunk_bytes).min(data.len())];
        if fs.dos_type.is_ffs() {
            let mut buf = vec![0_u8; geo.block_size() as usize];
            buf[..chunk.len()].copy_from_slice(chunk);
            fs.dev.write_block(block, &buf)?;
        } else {
            let fdb = FileDataBlock {
                hdr_key: hdr_block.0,
                seq_num: i as u32 + 1,
                next_data: data_blocks.get(i + 1).map_or(0, |b| b.0),
                data: chunk.to_vec(),
            };
            fs.dev.write_block(block, &fdb.to_bytes(geo)?)?;
        }
    }

    let ptrs: Vec<u32> = data_blocks.iter().map(|b| b.0).collect();
    let ptrs_per_block = geo.hash_table_size() as usize;
    for (i, &block) in ext_blocks.iter().enumerate() {
        let start = (i + 1) * ptrs_per_block;
        let end = (start + ptrs_per_block).min(ptrs.len());
        let list = FileListBlock {
            own_key: block,
            data_blocks: ptrs[start..end].to_vec(),
            parent: hdr_block.0,
            extension: ext_blocks.get(i + 1).map_or(0, |b| b.0),
        };
        fs.dev.write_block(block, &list.to_bytes(geo)?)?;
    }

    let hdr = FileHeaderBlock {
        own_key: hdr_block,
        data_blocks: ptrs[..ptrs.len().min(ptrs_per_block)].to_vec(),
        protect: meta.protect,
        byte_size: data.len() as u32,
        comment: meta.comment.clone(),
        mod_ts: meta.mod_ts.unwrap_or_else(now_ts),
        name: name.to_vec(),
        hash_chain,
        parent: parent.0,
        extension: ext_blocks.first().map_or(0, |b| b.0),
    };
    fs.dev
        .write_block(hdr_block, &hdr.to_bytes(geo, fs.longname())?)?;
    Ok(hdr)
}

impl File {
    pub(crate) fn from_hdr(hdr: FileHeaderBlock) -> Self {
        Self {
            block: hdr.own_key,
            hdr,
        }
    }

    pub fn read_header(fs: &FsCtx, block: BlockNum) -> Result<Self> {
        let bytes = fs.dev.read_block(block)?;
        let hdr = FileHeaderBlock::read(fs.geometry(), fs.longname(), block, &bytes)?;
        Ok(Self::from_hdr(hdr))
    }

    #[must_use]
    pub fn name(&self) -> &[u8] {
        &self.hdr.name
    }

    #[must_use]
    pub fn block(&self) -> BlockNum {
        self.block
    }

    #[must_use]
    pub fn byte_size(&self) -> u32 {
        self.hdr.byte_size
    }

    #[must_use]
    pub fn header(&self) -> &FileHeaderBlock {
        &self.hdr
    }

    #[must_use]
    pub fn hash_chain(&self) -> u32 {
        self.hdr.hash_chain
    }

    #[must_use]
    pub fn protect(&self) -> adf_types::Protection {
        self.hdr.protect
    }

    #[must_use]
    pub fn comment(&self) -> &[u8] {
        &self.hdr.comment
    }

    pub(crate) fn set_protect(&mut self, fs: &FsCtx, protect: adf_types::Protection) -> Result<()> {
        self.hdr.protect = protect;
        let bytes = self.hdr.to_bytes(fs.geometry(), fs.longname())?;
        fs.dev.write_block(self.block, &bytes)
    }

    pub(crate) fn set_comment(&mut self, fs: &FsCtx, comment: Vec<u8>) -> Result<()> {
        self.hdr.comment = comment;
        self.hdr.mod_ts = now_ts();
        let bytes = self.hdr.to_bytes(fs.geometry(), fs.longname())?;
        fs.dev.write_block(self.block, &bytes)
    }

    pub(crate) fn set_hash_chain(&mut self, fs: &FsCtx, value: u32) -> Result<()> {
        self.hdr.hash_chain = value;
        let bytes = self.hdr.to_bytes(fs.geometry(), fs.longname())?;
        fs.dev.write_block(self.block, &bytes)
    }

    /// The file list blocks of the extension chain, cycle-guarded.
    pub fn list_blocks(&self, fs: &FsCtx) -> Result<Vec<FileListBlock>> {
        let geo = fs.geometry();
        let mut lists = Vec::new();
        let mut seen: HashSet<u32> = HashSet::new();
        let mut ext = self.hdr.extension;
        while ext != 0 {
            if !geo.contains(BlockNum(ext)) {
                return Err(AdfError::InvalidFileListBlock {
                    block: ext,
                    detail: "extension pointer out of range".to_owned(),
                });
            }
            if !seen.insert(ext) {
                return Err(AdfError::InvalidFileListBlock {
                    block: ext,
                    detail: "cycle in extension chain".to_owned(),
                });
            }
            let bytes = fs.dev.read_block(BlockNum(ext))?;
            let list = FileListBlock::read(geo, BlockNum(ext), &bytes)?;
            if list.parent != self.block.0 {
                return Err(AdfError::InvalidFileListBlock {
                    block: ext,
                    detail: format!(
                        "parent {} does not point back at file header {}",
                        list.parent, self.block
                    ),
                });
            }
            ext = list.extension;
            lists.push(list);
        }
        Ok(lists)
    }

    /// All data block numbers in read order, validated against the
    /// block budget the byte size implies.
    pub fn data_block_numbers(&self, fs: &FsCtx) -> Result<Vec<BlockNum>> {
        let plan = plan(fs, self.hdr.byte_size as usize)?;

        let lists = self.list_blocks(fs)?;
        if lists.len() as u32 != plan.num_ext {
            return Err(AdfError::FileListBlockCountMismatch {
                block: self.block.0,
                expected: plan.num_ext,
                actual: lists.len() as u32,
            });
        }

        let mut ptrs: Vec<u32> = self.hdr.data_blocks.clone();
        for list in &lists {
            ptrs.extend(&list.data_blocks);
        }
        if ptrs.len() as u32 != plan.num_data {
            return Err(AdfError::FileDataBlockCountMismatch {
                block: self.block.0,
                expected: plan.num_data,
                actual: ptrs.len() as u32,
            });
        }
        Ok(ptrs.into_iter().map(BlockNum).collect())
    }

    /// Read the whole payload.
    ///
    /// FFS blocks are raw and simply concatenated, the final block
    /// trimmed to the remaining byte count. OFS blocks carry their own
    /// header, which must name this file (`hdr_key`) and count up from
    /// 1 (`seq_num`); any mismatch is a data-integrity error.
    pub fn read_data(&self, fs: &FsCtx) -> Result<Vec<u8>> {
        let geo = fs.geometry();
        let data_blocks = self.data_block_numbers(fs)?;
        let byte_size = self.hdr.byte_size as usize;
        let mut out = Vec::with_capacity(byte_size);

        if fs.dos_type.is_ffs() {
            for block in &data_blocks {
                out.extend_from_slice(&fs.dev.read_block(*block)?);
            }
            out.truncate(byte_size);
        } else {
            for (i, block) in data_blocks.iter().enumerate() {
                let bytes = fs.dev.read_block(*block)?;
                let fdb = FileDataBlock::read(geo, *block, &bytes)?;
                if fdb.hdr_key != self.block.0 {
                    return Err(AdfError::InvalidFileDataBlock {
                        block: block.0,
                        detail: format!(
                            "hdr_key {} does not name file header {}",
                            fdb.hdr_key, self.block
                        ),
                    });
                }
                let expected_seq = i as u32 + 1;
                if fdb.seq_num != expected_seq {
                    return Err(AdfError::InvalidSeqNum {
                        block: block.0,
                        expected: expected_seq,
                        actual: fdb.seq_num,
                    });
                }
                out.extend_from_slice(&fdb.data);
            }
            if out.len() != byte_size {
                return Err(AdfError::InvalidFileDataBlock {
                    block: self.block.0,
                    detail: format!(
                        "data blocks carry {} bytes, header declares {byte_size}",
                        out.len()
                    ),
                });
            }
        }
        Ok(out)
    }

    /// Every block this file owns: header, list chain, data blocks.
    pub(crate) fn owned_blocks(&self, fs: &FsCtx) -> Result<Vec<BlockNum>> {
        let mut blocks = vec![self.block];
        blocks.extend(self.list_blocks(fs)?.iter().map(|l| l.own_key));
        blocks.extend(self.data_block_numbers(fs)?);
        Ok(blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adf_alloc::BitmapAlloc;
    use adf_block::MemBlockDevice;
    use adf_types::{DosType, Geometry};
    use std::sync::Arc;

    fn make_fs(dos_type: DosType) -> FsCtx {
        let geo = Geometry::floppy_dd();
        let dev = Arc::new(MemBlockDevice::new(geo));
        let mut alloc = BitmapAlloc::new_all_free(geo);
        alloc.clr_bit(BlockNum(880)).unwrap();
        alloc.clr_bit(BlockNum(881)).unwrap();
        alloc.attach_blocks(vec![BlockNum(881)], Vec::new());
        alloc.write_only_bits(dev.as_ref()).unwrap();
        FsCtx::new(dev, dos_type, alloc)
    }

    #[test]
    fn plan_matches_layout_math() {
        let ofs = make_fs(DosType::OFS);
        let p = plan(&ofs, 3000).unwrap();
        assert_eq!(p.data_bytes, 488);
        assert_eq!(p.num_data, 7);
        assert_eq!(p.num_ext, 0);
        assert_eq!(p.total_blocks(), 8);

        let ffs = make_fs(DosType::FFS);
        let p = plan(&ffs, 3000).unwrap();
        assert_eq!(p.data_bytes, 512);
        assert_eq!(p.num_data, 6);
        assert_eq!(p.num_ext, 0);

        // Empty file: just the header.
        let p = plan(&ffs, 0).unwrap();
        assert_eq!(p.num_data, 0);
        assert_eq!(p.total_blocks(), 1);

        // 100_000 bytes on FFS: 196 data blocks, 72 inline, two list
        // blocks for the remaining 124 pointers.
        let p = plan(&ffs, 100_000).unwrap();
        assert_eq!(p.num_data, 196);
        assert_eq!(p.num_ext, 2);

        // Exactly the inline capacity: no list blocks.
        let p = plan(&ffs, 72 * 512).unwrap();
        assert_eq!(p.num_data, 72);
        assert_eq!(p.num_ext, 0);

        // One block more spills.
        let p = plan(&ffs, 73 * 512).unwrap();
        assert_eq!(p.num_ext, 1);
    }

    fn write_fixture(fs: &FsCtx, data: &[u8]) -> File {
        let p = plan(fs, data.len()).unwrap();
        let blocks = fs.alloc_blocks(p.total_blocks()).unwrap();
        let hdr = write_new_file(
            fs,
            &blocks,
            p,
            data,
            b"blob",
            &MetaInfo::default(),
            0,
            BlockNum(880),
        )
        .unwrap();
        File::from_hdr(hdr)
    }

    #[test]
    fn ofs_round_trip_3000_bytes() {
        let fs = make_fs(DosType::OFS);
        let data: Vec<u8> = (0..3000_u32).map(|i| (i % 251) as u8).collect();
        let file = write_fixture(&fs, &data);

        let blocks = file.data_block_numbers(&fs).unwrap();
        assert_eq!(blocks.len(), 7);

        // Data blocks carry seq_num 1..=7 and chain through next_data.
        for (i, block) in blocks.iter().enumerate() {
            let fdb =
                FileDataBlock::read(fs.geometry(), *block, &fs.dev.read_block(*block).unwrap())
                    .unwrap();
            assert_eq!(fdb.seq_num, i as u32 + 1);
            assert_eq!(fdb.hdr_key, file.block().0);
            let expected_next = blocks.get(i + 1).map_or(0, |b| b.0);
            assert_eq!(fdb.next_data, expected_next);
        }

        assert_eq!(file.read_data(&fs).unwrap(), data);
    }

    #[test]
    fn ffs_round_trip_3000_bytes() {
        let fs = make_fs(DosType::FFS);
        let data: Vec<u8> = (0..3000_u32).map(|i| (i % 253) as u8).collect();
        let file = write_fixture(&fs, &data);
        assert_eq!(file.data_block_numbers(&fs).unwrap().len(), 6);
        assert_eq!(file.read_data(&fs).unwrap(), data);
    }

    #[test]
    fn large_file_spills_into_list_chain() {
        let fs = make_fs(DosType::FFS);
        let data: Vec<u8> = (0..100_000_u32).map(|i| (i % 241) as u8).collect();
        let file = write_fixture(&fs, &data);

        let lists = file.list_blocks(&fs).unwrap();
        assert_eq!(lists.len(), 2);
        assert_eq!(lists[0].data_blocks.len(), 72);
        assert_eq!(lists[1].data_blocks.len(), 52);
        assert_eq!(lists[1].extension, 0);
        assert_eq!(file.read_data(&fs).unwrap(), data);

        let owned = file.owned_blocks(&fs).unwrap();
        assert_eq!(owned.len(), 1 + 2 + 196);
    }

    #[test]
    fn empty_file_round_trip() {
        let fs = make_fs(DosType::OFS);
        let file = write_fixture(&fs, &[]);
        assert_eq!(file.byte_size(), 0);
        assert_eq!(file.read_data(&fs).unwrap(), Vec::<u8>::new());
        assert_eq!(file.owned_blocks(&fs).unwrap(), vec![file.block()]);
    }

    #[test]
    fn ofs_detects_foreign_data_block() {
        let fs = make_fs(DosType::OFS);
        let data = vec![7_u8; 1000];
        let file = write_fixture(&fs, &data);
        let blocks = file.data_block_numbers(&fs).unwrap();

        // Re-stamp the second data block as belonging to another file.
        let victim = blocks[1];
        let mut fdb =
            FileDataBlock::read(fs.geometry(), victim, &fs.dev.read_block(victim).unwrap())
                .unwrap();
        fdb.hdr_key = 42;
        fs.dev
            .write_block(victim, &fdb.to_bytes(fs.geometry()).unwrap())
            .unwrap();

        let err = file.read_data(&fs).unwrap_err();
        assert!(matches!(err, AdfError::InvalidFileDataBlock { .. }));
    }

    #[test]
    fn ofs_detects_sequence_gap() {
        let fs = make_fs(DosType::OFS);
        let data = vec![9_u8; 1000];
        let file = write_fixture(&fs, &data);
        let blocks = file.data_block_numbers(&fs).unwrap();

        let victim = blocks[1];
        let mut fdb =
            FileDataBlock::read(fs.geometry(), victim, &fs.dev.read_block(victim).unwrap())
                .unwrap();
        fdb.seq_num = 9;
        fs.dev
            .write_block(victim, &fdb.to_bytes(fs.geometry()).unwrap())
            .unwrap();

        let err = file.read_data(&fs).unwrap_err();
        assert!(matches!(
            err,
            AdfError::InvalidSeqNum {
                expected: 2,
                actual: 9,
                ..
            }
        ));
    }

    #[test]
    fn extension_chain_cycle_is_detected() {
        let fs = make_fs(DosType::FFS);
        let data = vec![1_u8; 100_000];
        let file = write_fixture(&fs, &data);
        let lists = file.list_blocks(&fs).unwrap();

        // Point the second list block back at the first.
        let mut second = lists[1].clone();
        second.extension = lists[0].own_key.0;
        fs.dev
            .write_block(second.own_key, &second.to_bytes(fs.geometry()).unwrap())
            .unwrap();

        let err = file.list_blocks(&fs).unwrap_err();
        assert!(matches!(err, AdfError::InvalidFileListBlock { .. }));
    }

    #[test]
    fn truncated_chain_is_a_count_mismatch() {
        let fs = make_fs(DosType::FFS);
        let data = vec![1_u8; 100_000];
        let file = write_fixture(&fs, &data);
        let lists = file.list_blocks(&fs).unwrap();

        // Cut the chain after the first list block.
        let mut first = lists[0].clone();
        first.extension = 0;
        fs.dev
            .write_block(first.own_key, &first.to_bytes(fs.geometry()).unwrap())
            .unwrap();

        let err = file.data_block_numbers(&fs).unwrap_err();
        assert!(matches!(
            err,
            AdfError::FileListBlockCountMismatch {
                expected: 2,
                actual: 1,
                ..
            }
        ));
    }
}
