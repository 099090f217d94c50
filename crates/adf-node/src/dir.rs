//! Directory nodes: hash-table scan, chained buckets, create/delete.

use crate::{File, FsCtx, MetaInfo, Node, invalid_name, lossy, now_ts};
use adf_block::BlockDevice;
use adf_error::{AdfError, Result};
use adf_ondisk::{
    DirCacheBlock, FileHeaderBlock, RootBlock, ST_FILE, ST_LINKDIR, ST_LINKFILE, ST_SOFTLINK,
    ST_USERDIR, UserDirBlock, get_long_end,
};
use adf_types::{BlockNum, Protection, TimeStamp, name_hash, names_equal, validate_name};
use std::collections::HashSet;
use tracing::warn;

#[derive(Debug)]
enum DirKind {
    Root(RootBlock),
    User(UserDirBlock),
}

/// A directory node: the root or a user directory.
///
/// Children are cached per hash bucket in on-disk chain order; the
/// cache is rebuilt from disk on first access and dropped by
/// [`Dir::flush`].
#[derive(Debug)]
pub struct Dir {
    block: BlockNum,
    kind: DirKind,
    children: Option<Vec<Vec<Node>>>,
}

impl Dir {
    pub(crate) fn from_root(block: BlockNum, root: RootBlock) -> Self {
        Self {
            block,
            kind: DirKind::Root(root),
            children: None,
        }
    }

    pub(crate) fn from_user(hdr: UserDirBlock) -> Self {
        Self {
            block: hdr.own_key,
            kind: DirKind::User(hdr),
            children: None,
        }
    }

    /// Read the root directory block.
    pub fn read_root(fs: &FsCtx, block: BlockNum) -> Result<Self> {
        let bytes = fs.dev.read_block(block)?;
        let root = RootBlock::read(fs.geometry(), block, &bytes)?;
        let expected = fs.geometry().hash_table_size();
        if root.hash_size != 0 && root.hash_size != expected {
            warn!(
                block = block.0,
                stored = root.hash_size,
                expected,
                "root block hash table size differs from geometry; trusting the stored value"
            );
        }
        Ok(Self::from_root(block, root))
    }

    /// Read a user directory block.
    pub fn read_user(fs: &FsCtx, block: BlockNum) -> Result<Self> {
        let bytes = fs.dev.read_block(block)?;
        let hdr = UserDirBlock::read(fs.geometry(), fs.longname(), block, &bytes)?;
        let expected = fs.geometry().hash_table_size();
        if hdr.hash_size != 0 && hdr.hash_size != expected {
            warn!(
                block = block.0,
                stored = hdr.hash_size,
                expected,
                "directory block hash table size differs from geometry; trusting the stored value"
            );
        }
        Ok(Self::from_user(hdr))
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        matches!(self.kind, DirKind::Root(_))
    }

    #[must_use]
    pub fn block(&self) -> BlockNum {
        self.block
    }

    #[must_use]
    pub fn name(&self) -> &[u8] {
        match &self.kind {
            DirKind::Root(root) => &root.name,
            DirKind::User(hdr) => &hdr.name,
        }
    }

    #[must_use]
    pub fn hash_chain(&self) -> u32 {
        match &self.kind {
            DirKind::Root(_) => 0,
            DirKind::User(hdr) => hdr.hash_chain,
        }
    }

    /// First directory cache block (dircache volumes), 0 otherwise.
    #[must_use]
    pub fn extension(&self) -> u32 {
        match &self.kind {
            DirKind::Root(root) => root.extension,
            DirKind::User(hdr) => hdr.extension,
        }
    }

    /// Root-block view for volume-level bookkeeping (bitmap anchors,
    /// volume name).
    #[must_use]
    pub fn root_block(&self) -> Option<&RootBlock> {
        match &self.kind {
            DirKind::Root(root) => Some(root),
            DirKind::User(_) => None,
        }
    }

    /// Rewrite the volume name on the root block (relabel).
    pub fn set_root_name(&mut self, fs: &FsCtx, name: Vec<u8>) -> Result<()> {
        match &mut self.kind {
            DirKind::Root(root) => {
                root.name = name;
                root.disk_ts = now_ts();
            }
            DirKind::User(_) => {
                return Err(AdfError::InternalError {
                    detail: "relabel applies to the root block only".to_owned(),
                });
            }
        }
        self.write_back(fs)
    }

    /// Current protection bits (the root block carries none).
    #[must_use]
    pub fn protect(&self) -> Protection {
        match &self.kind {
            DirKind::Root(_) => Protection::default(),
            DirKind::User(hdr) => hdr.protect,
        }
    }

    #[must_use]
    pub fn comment(&self) -> &[u8] {
        match &self.kind {
            DirKind::Root(_) => &[],
            DirKind::User(hdr) => &hdr.comment,
        }
    }

    pub(crate) fn set_protect(&mut self, fs: &FsCtx, protect: Protection) -> Result<()> {
        match &mut self.kind {
            DirKind::Root(_) => {
                return Err(AdfError::InternalError {
                    detail: "the root block carries no protection bits".to_owned(),
                });
            }
            DirKind::User(hdr) => hdr.protect = protect,
        }
        self.write_back(fs)
    }

    pub(crate) fn set_comment(&mut self, fs: &FsCtx, comment: Vec<u8>) -> Result<()> {
        match &mut self.kind {
            DirKind::Root(_) => {
                return Err(AdfError::InternalError {
                    detail: "the root block carries no comment field".to_owned(),
                });
            }
            DirKind::User(hdr) => hdr.comment = comment,
        }
        self.set_mod_ts(now_ts());
        self.write_back(fs)
    }

    /// The hash-table size this directory's walks must use: the stored
    /// field wins over the geometric value (clamped to the physical
    /// table), warned about at read time.
    #[must_use]
    pub fn hash_size(&self, fs: &FsCtx) -> u32 {
        let geo = fs.geometry();
        let stored = match &self.kind {
            DirKind::Root(root) => root.effective_hash_size(geo),
            DirKind::User(hdr) => hdr.effective_hash_size(geo),
        };
        stored.min(geo.hash_table_size())
    }

    fn hash_table(&self) -> &[u32] {
        match &self.kind {
            DirKind::Root(root) => &root.hash_table,
            DirKind::User(hdr) => &hdr.hash_table,
        }
    }

    fn set_mod_ts(&mut self, ts: TimeStamp) {
        match &mut self.kind {
            DirKind::Root(root) => root.mod_ts = ts,
            DirKind::User(hdr) => hdr.mod_ts = ts,
        }
    }

    /// Re-encode this directory's block and write it out.
    pub(crate) fn write_back(&self, fs: &FsCtx) -> Result<()> {
        let bytes = match &self.kind {
            DirKind::Root(root) => root.to_bytes(fs.geometry())?,
            DirKind::User(hdr) => hdr.to_bytes(fs.geometry(), fs.longname())?,
        };
        fs.dev.write_block(self.block, &bytes)
    }

    pub(crate) fn set_hash_chain(&mut self, fs: &FsCtx, value: u32) -> Result<()> {
        match &mut self.kind {
            DirKind::Root(_) => Err(AdfError::InternalError {
                detail: "the root block is never chained".to_owned(),
            }),
            DirKind::User(hdr) => {
                hdr.hash_chain = value;
                let bytes = hdr.to_bytes(fs.geometry(), fs.longname())?;
                fs.dev.write_block(self.block, &bytes)
            }
        }
    }

    fn set_slot_and_write(&mut self, fs: &FsCtx, bucket: usize, value: u32) -> Result<()> {
        match &mut self.kind {
            DirKind::Root(root) => root.hash_table[bucket] = value,
            DirKind::User(hdr) => hdr.hash_table[bucket] = value,
        }
        self.set_mod_ts(now_ts());
        self.write_back(fs)
    }

    /// Decode one chained entry, verifying it belongs to this
    /// directory.
    fn read_entry_node(&self, fs: &FsCtx, block: BlockNum) -> Result<Node> {
        let geo = fs.geometry();
        let bytes = fs.dev.read_block(block)?;
        let sec_type = get_long_end(&bytes, 1) as i32;
        let node = match sec_type {
            ST_USERDIR => Node::Dir(Self::from_user(UserDirBlock::read(
                geo,
                fs.longname(),
                block,
                &bytes,
            )?)),
            ST_FILE => Node::File(File::from_hdr(FileHeaderBlock::read(
                geo,
                fs.longname(),
                block,
                &bytes,
            )?)),
            ST_SOFTLINK | ST_LINKDIR | ST_LINKFILE => {
                return Err(AdfError::UnsupportedDirBlock {
                    block: block.0,
                    sec_type,
                });
            }
            other => {
                return Err(AdfError::InvalidUserDirBlock {
                    block: block.0,
                    detail: format!("chained block has sec_type {other}"),
                });
            }
        };

        let parent = match &node {
            Node::Dir(dir) => match &dir.kind {
                DirKind::User(hdr) => hdr.parent,
                DirKind::Root(_) => 0,
            },
            Node::File(file) => file.header().parent,
        };
        if parent != self.block.0 {
            return Err(AdfError::InvalidParentDirectory {
                block: block.0,
                detail: format!("entry names parent {parent}, owning directory is {}", self.block),
            });
        }
        Ok(node)
    }

    /// Rebuild the per-bucket child cache from the on-disk hash table.
    ///
    /// Each bucket chain is walked iteratively with a visited set; a
    /// repeated block number is a cycle error, not a hang.
    pub fn ensure_entries(&mut self, fs: &FsCtx) -> Result<()> {
        if self.children.is_some() {
            return Ok(());
        }
        let hash_size = self.hash_size(fs) as usize;
        let table: Vec<u32> = self.hash_table()[..hash_size].to_vec();

        let mut children: Vec<Vec<Node>> = (0..hash_size).map(|_| Vec::new()).collect();
        for (bucket, &head) in table.iter().enumerate() {
            let mut seen: HashSet<u32> = HashSet::new();
            let mut cur = head;
            while cur != 0 {
                if !fs.geometry().contains(BlockNum(cur)) {
                    return Err(AdfError::InvalidUserDirBlock {
                        block: cur,
                        detail: "hash chain pointer out of range".to_owned(),
                    });
                }
                if !seen.insert(cur) {
                    return Err(AdfError::InvalidUserDirBlock {
                        block: cur,
                        detail: "cycle in hash chain".to_owned(),
                    });
                }
                let node = self.read_entry_node(fs, BlockNum(cur))?;
                cur = node.hash_chain();
                children[bucket].push(node);
            }
        }
        self.children = Some(children);
        Ok(())
    }

    /// Drop the child cache (recursively).
    pub fn flush(&mut self) {
        self.children = None;
    }

    fn children_mut(&mut self) -> Result<&mut Vec<Vec<Node>>> {
        self.children.as_mut().ok_or_else(|| AdfError::InternalError {
            detail: "directory entries were not loaded".to_owned(),
        })
    }

    /// Locate `name` (case-insensitive) in its bucket chain. Requires
    /// loaded entries.
    fn find_pos(&self, fs: &FsCtx, name: &[u8]) -> Option<(usize, usize)> {
        let children = self.children.as_ref()?;
        let bucket = name_hash(name, self.hash_size(fs), fs.intl()) as usize;
        let pos = children
            .get(bucket)?
            .iter()
            .position(|node| names_equal(node.name(), name, fs.intl()))?;
        Some((bucket, pos))
    }

    /// Whether a case-insensitive match for `name` exists.
    pub fn has_name(&mut self, fs: &FsCtx, name: &[u8]) -> Result<bool> {
        self.ensure_entries(fs)?;
        Ok(self.find_pos(fs, name).is_some())
    }

    /// All entry names in bucket order.
    pub fn list(&mut self, fs: &FsCtx) -> Result<Vec<Vec<u8>>> {
        self.ensure_entries(fs)?;
        Ok(self
            .children_mut()?
            .iter()
            .flatten()
            .map(|node| node.name().to_vec())
            .collect())
    }

    /// Validate the new name and find its bucket, rejecting duplicates.
    fn prepare_insert(&mut self, fs: &FsCtx, name: &[u8]) -> Result<usize> {
        validate_name(name, fs.dos_type.max_name_len()).map_err(|e| invalid_name(name, &e))?;
        self.ensure_entries(fs)?;
        if self.find_pos(fs, name).is_some() {
            return Err(AdfError::NameAlreadyExists { name: lossy(name) });
        }
        Ok(name_hash(name, self.hash_size(fs), fs.intl()) as usize)
    }

    /// Create an empty subdirectory.
    ///
    /// The new block's `hash_chain` takes the current bucket head and
    /// the new entry becomes the head, on disk and in memory; chain
    /// insertion is head-first, matching AmigaDOS exactly.
    pub fn create_dir(&mut self, fs: &FsCtx, name: &[u8], meta: &MetaInfo) -> Result<BlockNum> {
        let bucket = self.prepare_insert(fs, name)?;
        let head = self.hash_table()[bucket];

        let own = fs.alloc_blocks(1)?[0];
        let mut hdr = UserDirBlock::new(
            fs.geometry(),
            own,
            self.block,
            name.to_vec(),
            meta.protect,
            meta.comment.clone(),
            meta.mod_ts.unwrap_or_else(now_ts),
        );
        hdr.hash_chain = head;
        fs.dev
            .write_block(own, &hdr.to_bytes(fs.geometry(), fs.longname())?)?;

        self.set_slot_and_write(fs, bucket, own.0)?;
        self.children_mut()?[bucket].insert(0, Node::Dir(Self::from_user(hdr)));
        Ok(own)
    }

    /// Create a file from a full payload.
    ///
    /// Every needed block (header, list chain, data) is allocated up
    /// front; on allocation failure nothing is linked and the tree is
    /// unchanged.
    pub fn create_file(
        &mut self,
        fs: &FsCtx,
        name: &[u8],
        data: &[u8],
        meta: &MetaInfo,
    ) -> Result<BlockNum> {
        let bucket = self.prepare_insert(fs, name)?;
        let head = self.hash_table()[bucket];

        let plan = crate::file::plan(fs, data.len())?;
        let blocks = fs.alloc_blocks(plan.total_blocks())?;
        let hdr =
            crate::file::write_new_file(fs, &blocks, plan, data, name, meta, head, self.block)?;
        let own = hdr.own_key;

        self.set_slot_and_write(fs, bucket, own.0)?;
        self.children_mut()?[bucket].insert(0, Node::File(File::from_hdr(hdr)));
        Ok(own)
    }

    /// Blocks owned by this directory itself: its header plus any
    /// directory cache chain.
    fn owned_blocks(&self, fs: &FsCtx) -> Result<Vec<BlockNum>> {
        let geo = fs.geometry();
        let mut blocks = vec![self.block];
        let mut seen: HashSet<u32> = HashSet::new();
        let mut ext = self.extension();
        while ext != 0 {
            if !geo.contains(BlockNum(ext)) || !seen.insert(ext) {
                return Err(AdfError::InvalidUserDirBlock {
                    block: ext,
                    detail: "bad directory cache chain".to_owned(),
                });
            }
            let bytes = fs.dev.read_block(BlockNum(ext))?;
            let cache = DirCacheBlock::read(geo, BlockNum(ext), &bytes).map_err(|detail| {
                AdfError::InvalidUserDirBlock { block: ext, detail }
            })?;
            blocks.push(BlockNum(ext));
            ext = cache.next;
        }
        Ok(blocks)
    }

    /// Delete the entry called `name`.
    ///
    /// Directories must be empty unless `recursive`; `wipe` zero-fills
    /// freed blocks. The entry is spliced out of its bucket chain (the
    /// predecessor's `hash_chain`, or the table slot for a head), then
    /// its blocks are freed and the bitmap persisted.
    pub fn delete(&mut self, fs: &FsCtx, name: &[u8], wipe: bool, recursive: bool) -> Result<()> {
        self.ensure_entries(fs)?;
        let Some((bucket, pos)) = self.find_pos(fs, name) else {
            return Err(AdfError::FileNotFound { path: lossy(name) });
        };

        // Empty out subdirectories first (or refuse).
        if let Node::Dir(child) = &mut self.children_mut()?[bucket][pos] {
            child.ensure_entries(fs)?;
            let entry_names: Vec<Vec<u8>> = child
                .children_mut()?
                .iter()
                .flatten()
                .map(|n| n.name().to_vec())
                .collect();
            if !entry_names.is_empty() {
                if !recursive {
                    return Err(AdfError::DeleteNotAllowed {
                        name: lossy(name),
                        reason: "directory is not empty".to_owned(),
                    });
                }
                for entry in entry_names {
                    child.delete(fs, &entry, wipe, true)?;
                }
            }
        }

        let (owned, successor) = {
            let children = self.children_mut()?;
            let node = &children[bucket][pos];
            let owned = match node {
                Node::Dir(dir) => dir.owned_blocks(fs)?,
                Node::File(file) => file.owned_blocks(fs)?,
            };
            (owned, node.hash_chain())
        };

        if pos > 0 {
            self.children_mut()?[bucket][pos - 1].set_hash_chain(fs, successor)?;
        } else {
            self.set_slot_and_write(fs, bucket, successor)?;
        }
        self.children_mut()?[bucket].remove(pos);

        fs.release_blocks(&owned, wipe)?;
        Ok(())
    }

    /// Walk `components` case-insensitively, stopping with `None` on
    /// the first missing component or on a file in directory position.
    pub fn get_path(&mut self, fs: &FsCtx, components: &[&[u8]]) -> Result<Option<&mut Node>> {
        let Some((first, rest)) = components.split_first() else {
            return Ok(None);
        };
        self.ensure_entries(fs)?;
        let Some((bucket, pos)) = self.find_pos(fs, first) else {
            return Ok(None);
        };
        let node = &mut self.children_mut()?[bucket][pos];
        if rest.is_empty() {
            return Ok(Some(node));
        }
        match node {
            Node::Dir(dir) => dir.get_path(fs, rest),
            Node::File(_) => Ok(None),
        }
    }
}
