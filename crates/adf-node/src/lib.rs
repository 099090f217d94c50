#![forbid(unsafe_code)]
//! Directory and file node tree.
//!
//! Builds the in-memory view of an AmigaDOS directory hierarchy on top
//! of the block codec and the bitmap allocator. A [`Node`] is a tagged
//! union over [`Dir`] and [`File`]; path walking matches on the variant
//! explicitly at every step.
//!
//! All on-disk chain walks (hash chains, extension chains) are
//! iterative with an explicit visited set, so corrupted chains that
//! point back at an earlier block fail with a typed error instead of
//! looping.
//!
//! Mutating operations allocate every block they need up front and
//! persist the bitmap before writing any structural block that
//! references the allocation; a failed operation leaves the in-memory
//! tree unchanged.

mod dir;
mod file;

pub use dir::Dir;
pub use file::File;

use adf_alloc::BitmapAlloc;
use adf_block::BlockDevice;
use adf_error::{AdfError, Result};
use adf_types::{BlockNum, DosType, Geometry, Protection, TimeStamp};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Shared filesystem context: the device, the volume variant and the
/// bitmap allocator.
///
/// The allocator is the single source of truth for free/used state and
/// is shared by reference between the volume and every node operation
/// that allocates or frees blocks.
pub struct FsCtx {
    pub dev: Arc<dyn BlockDevice>,
    pub dos_type: DosType,
    pub alloc: Mutex<BitmapAlloc>,
}

impl FsCtx {
    #[must_use]
    pub fn new(dev: Arc<dyn BlockDevice>, dos_type: DosType, alloc: BitmapAlloc) -> Self {
        Self {
            dev,
            dos_type,
            alloc: Mutex::new(alloc),
        }
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.dev.geometry()
    }

    #[must_use]
    pub fn intl(&self) -> bool {
        self.dos_type.is_intl()
    }

    #[must_use]
    pub fn longname(&self) -> bool {
        self.dos_type.is_longname()
    }

    #[must_use]
    pub fn free_blocks(&self) -> u32 {
        self.alloc.lock().free_count()
    }

    #[must_use]
    pub fn used_blocks(&self) -> u32 {
        self.alloc.lock().used_count()
    }

    /// Claim `n` free blocks and persist the bitmap before returning.
    ///
    /// The bitmap write happens before the caller can reference the
    /// blocks from any structural write; a crash right after this call
    /// leaves allocated-but-unreferenced blocks, which the validator
    /// reports.
    pub fn alloc_blocks(&self, n: u32) -> Result<Vec<BlockNum>> {
        let mut alloc = self.alloc.lock();
        let blocks = alloc.alloc_n(n)?;
        alloc.write_only_bits(&*self.dev)?;
        Ok(blocks)
    }

    /// Release blocks and persist the bitmap. With `wipe`, the block
    /// contents are zeroed on disk first.
    pub fn release_blocks(&self, blocks: &[BlockNum], wipe: bool) -> Result<()> {
        if wipe {
            let zeros = vec![0_u8; self.geometry().block_size() as usize];
            for block in blocks {
                self.dev.write_block(*block, &zeros)?;
            }
        }
        let mut alloc = self.alloc.lock();
        for block in blocks {
            alloc.set_bit(*block)?;
        }
        alloc.write_only_bits(&*self.dev)?;
        Ok(())
    }
}

impl std::fmt::Debug for FsCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsCtx")
            .field("dos_type", &self.dos_type)
            .field("geometry", &self.geometry())
            .field("free_blocks", &self.free_blocks())
            .finish()
    }
}

/// Entry metadata shared by directories and files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaInfo {
    pub protect: Protection,
    pub mod_ts: Option<TimeStamp>,
    pub comment: Vec<u8>,
}

/// Current time as an AmigaDOS timestamp.
#[must_use]
pub fn now_ts() -> TimeStamp {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    TimeStamp::from_unix(secs)
}

/// A directory or file node. Each node exclusively owns the typed view
/// of its structural block.
#[derive(Debug)]
pub enum Node {
    Dir(Dir),
    File(File),
}

impl Node {
    #[must_use]
    pub fn name(&self) -> &[u8] {
        match self {
            Self::Dir(dir) => dir.name(),
            Self::File(file) => file.name(),
        }
    }

    #[must_use]
    pub fn block(&self) -> BlockNum {
        match self {
            Self::Dir(dir) => dir.block(),
            Self::File(file) => file.block(),
        }
    }

    #[must_use]
    pub fn hash_chain(&self) -> u32 {
        match self {
            Self::Dir(dir) => dir.hash_chain(),
            Self::File(file) => file.hash_chain(),
        }
    }

    /// Rewrite this node's `hash_chain` pointer on disk (chain splice).
    pub fn set_hash_chain(&mut self, fs: &FsCtx, value: u32) -> Result<()> {
        match self {
            Self::Dir(dir) => dir.set_hash_chain(fs, value),
            Self::File(file) => file.set_hash_chain(fs, value),
        }
    }

    #[must_use]
    pub fn protect(&self) -> Protection {
        match self {
            Self::Dir(dir) => dir.protect(),
            Self::File(file) => file.protect(),
        }
    }

    #[must_use]
    pub fn comment(&self) -> &[u8] {
        match self {
            Self::Dir(dir) => dir.comment(),
            Self::File(file) => file.comment(),
        }
    }

    /// Rewrite the entry's protection bits on disk.
    pub fn set_protect(&mut self, fs: &FsCtx, protect: Protection) -> Result<()> {
        match self {
            Self::Dir(dir) => dir.set_protect(fs, protect),
            Self::File(file) => file.set_protect(fs, protect),
        }
    }

    /// Rewrite the entry's comment on disk.
    ///
    /// The comment must fit the block: at most 79 bytes, and on
    /// long-filename volumes within the combined name+comment budget.
    pub fn set_comment(&mut self, fs: &FsCtx, comment: Vec<u8>) -> Result<()> {
        let budget_ok = if fs.longname() {
            2 + self.name().len() + comment.len() <= 112
        } else {
            comment.len() <= adf_types::MAX_COMMENT_LEN
        };
        if !budget_ok {
            return Err(AdfError::InvalidFileName {
                name: lossy(self.name()),
                reason: format!("comment of {} bytes does not fit the entry block", comment.len()),
            });
        }
        match self {
            Self::Dir(dir) => dir.set_comment(fs, comment),
            Self::File(file) => file.set_comment(fs, comment),
        }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Dir(_))
    }

    #[must_use]
    pub fn as_dir_mut(&mut self) -> Option<&mut Dir> {
        match self {
            Self::Dir(dir) => Some(dir),
            Self::File(_) => None,
        }
    }

    #[must_use]
    pub fn as_file(&self) -> Option<&File> {
        match self {
            Self::Dir(_) => None,
            Self::File(file) => Some(file),
        }
    }

    /// Drop cached children (directories only).
    pub fn flush(&mut self) {
        if let Self::Dir(dir) = self {
            dir.flush();
        }
    }
}

pub(crate) fn lossy(name: &[u8]) -> String {
    String::from_utf8_lossy(name).into_owned()
}

pub(crate) fn invalid_name(name: &[u8], err: &adf_types::NameError) -> AdfError {
    AdfError::InvalidFileName {
        name: lossy(name),
        reason: err.to_string(),
    }
}
