#![forbid(unsafe_code)]
//! Structural validator (fsck).
//!
//! A four-phase, read-only sweep over the raw block stream that
//! re-derives the directory, file and bitmap structure without
//! trusting any cached state from the node tree:
//!
//! 1. **Block classification**: every block in `[reserved,
//!    num_blocks)` is decoded by its tags, reachable or not.
//! 2. **Directory scan**: every hash chain of every discovered live
//!    root/directory block is walked iteratively (cycle-guarded),
//!    verifying parent back-pointers and bucket placement; entries
//!    whose parent is a scanned directory but that no chain reached
//!    are reported as orphans.
//! 3. **File scan**: every live file header's extension chain and
//!    data pointers are followed and counted against its byte size;
//!    OFS data blocks must name their header and count up from 1.
//! 4. **Bitmap comparison**: an expected occupancy bitmap is rebuilt
//!    from the blocks phases 1-3 reached and compared word by word
//!    against the on-disk bitmap, with the trailing partial word
//!    masked.
//!
//! Deleting an entry leaves its blocks intact on disk, so valid-looking
//! tags in blocks the bitmap marks free are stale remnants, not
//! structure; the on-disk bitmap is loaded up front and such blocks are
//! noted at DEBUG instead of being walked.
//!
//! The validator never fails on corrupt input: every problem becomes a
//! leveled [`CheckEntry`] and the sweep continues, so one run yields a
//! complete inventory. Findings are mirrored to `tracing` at matching
//! levels.

use adf_alloc::{BitmapAlloc, trailing_mask};
use adf_block::BlockDevice;
use adf_ondisk::{
    BITMAP_VALID, BitmapExtBlock, BlockKind, RawTags, RootBlock, classify, get_long,
    verify_bitmap_checksum, verify_boot_checksum,
};
use adf_types::{BlockNum, DosType, Geometry, name_hash};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

// ── Findings ────────────────────────────────────────────────────────────────

/// Severity of a validator finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CheckLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl fmt::Display for CheckLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => write!(f, "DEBUG"),
            Self::Info => write!(f, "INFO"),
            Self::Warn => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
            Self::Fatal => write!(f, "FATAL"),
        }
    }
}

/// One finding: a level, the block it concerns (if any) and a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckEntry {
    pub level: CheckLevel,
    pub block: Option<u32>,
    pub msg: String,
}

impl fmt::Display for CheckEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.block {
            Some(block) => write!(f, "{} @{}: {}", self.level, block, self.msg),
            None => write!(f, "{}: {}", self.level, self.msg),
        }
    }
}

/// Ordered log of findings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckLog {
    pub entries: Vec<CheckEntry>,
}

impl CheckLog {
    fn push(&mut self, level: CheckLevel, block: Option<u32>, msg: String) {
        match level {
            CheckLevel::Debug => tracing::debug!(block, "{msg}"),
            CheckLevel::Info => tracing::info!(block, "{msg}"),
            CheckLevel::Warn => tracing::warn!(block, "{msg}"),
            CheckLevel::Error | CheckLevel::Fatal => tracing::error!(block, "{msg}"),
        }
        self.entries.push(CheckEntry { level, block, msg });
    }

    fn debug(&mut self, block: impl Into<Option<u32>>, msg: String) {
        self.push(CheckLevel::Debug, block.into(), msg);
    }

    fn info(&mut self, block: impl Into<Option<u32>>, msg: String) {
        self.push(CheckLevel::Info, block.into(), msg);
    }

    fn warn(&mut self, block: impl Into<Option<u32>>, msg: String) {
        self.push(CheckLevel::Warn, block.into(), msg);
    }

    fn error(&mut self, block: impl Into<Option<u32>>, msg: String) {
        self.push(CheckLevel::Error, block.into(), msg);
    }

    fn fatal(&mut self, block: impl Into<Option<u32>>, msg: String) {
        self.push(CheckLevel::Fatal, block.into(), msg);
    }

    /// Findings at `min` or above.
    #[must_use]
    pub fn count_at_or_above(&self, min: CheckLevel) -> usize {
        self.entries.iter().filter(|e| e.level >= min).count()
    }

    /// True when nothing at WARN or above was recorded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.count_at_or_above(CheckLevel::Warn) == 0
    }
}

/// Per-kind block counts from the classification phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckStats {
    pub root_blocks: u32,
    pub dir_blocks: u32,
    pub file_header_blocks: u32,
    pub file_list_blocks: u32,
    pub file_data_blocks: u32,
    pub dircache_blocks: u32,
    pub comment_blocks: u32,
    pub link_blocks: u32,
    pub not_structural: u32,
    pub tagged_bad_checksum: u32,
    pub read_errors: u32,
}

/// Full validator output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    pub log: CheckLog,
    pub stats: CheckStats,
    pub blocks_scanned: u32,
}

impl CheckReport {
    #[must_use]
    pub fn count_at_or_above(&self, min: CheckLevel) -> usize {
        self.log.count_at_or_above(min)
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.log.is_clean()
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scanned {} blocks: {} findings ({} warn, {} error, {} fatal)",
            self.blocks_scanned,
            self.log.entries.len(),
            self.log
                .entries
                .iter()
                .filter(|e| e.level == CheckLevel::Warn)
                .count(),
            self.log
                .entries
                .iter()
                .filter(|e| e.level == CheckLevel::Error)
                .count(),
            self.log
                .entries
                .iter()
                .filter(|e| e.level == CheckLevel::Fatal)
                .count(),
        )
    }
}

// ── Checker ─────────────────────────────────────────────────────────────────

/// The independent consistency checker.
///
/// Holds only a device reference: nothing from a mounted volume is
/// consulted, so it can run against images no volume would mount.
pub struct Checker<'a> {
    dev: &'a dyn BlockDevice,
}

struct Scan {
    geo: Geometry,
    is_ffs: bool,
    intl: bool,
    longname: bool,
    root_num: BlockNum,
    /// Structural tags per block, from phase 1.
    tags: BTreeMap<u32, RawTags>,
    /// On-disk bitmap words (1 = free), `None` when unreadable.
    disk_map: Option<Vec<u32>>,
    /// Blocks counted as occupied when rebuilding the bitmap.
    reachable: HashSet<u32>,
    log: CheckLog,
    stats: CheckStats,
}

impl Scan {
    /// Whether the on-disk bitmap marks `block` used. With no usable
    /// bitmap everything counts as used so the sweep degrades to
    /// walking all tagged blocks.
    fn is_used(&self, block: u32) -> bool {
        let Some(words) = &self.disk_map else {
            return true;
        };
        let idx = block - self.geo.reserved();
        let word = (idx / 32) as usize;
        match words.get(word) {
            Some(w) => (w >> (idx % 32)) & 1 == 0,
            None => true,
        }
    }
}

impl<'a> Checker<'a> {
    #[must_use]
    pub fn new(dev: &'a dyn BlockDevice) -> Self {
        Self { dev }
    }

    /// Run all four phases and return the complete report.
    pub fn run(&self) -> CheckReport {
        let geo = self.dev.geometry();
        let mut scan = Scan {
            geo,
            is_ffs: false,
            intl: false,
            longname: false,
            root_num: geo.root_block_hint(),
            tags: BTreeMap::new(),
            disk_map: None,
            reachable: HashSet::new(),
            log: CheckLog::default(),
            stats: CheckStats::default(),
        };

        self.check_boot(&mut scan);
        self.phase1_classify(&mut scan);
        self.load_bitmap(&mut scan);
        self.phase2_directories(&mut scan);
        self.phase3_files(&mut scan);
        self.phase4_bitmap(&mut scan);

        scan.log.info(
            None,
            format!(
                "scan complete: {} roots, {} dirs, {} file headers, {} file lists, {} data blocks",
                scan.stats.root_blocks,
                scan.stats.dir_blocks,
                scan.stats.file_header_blocks,
                scan.stats.file_list_blocks,
                scan.stats.file_data_blocks,
            ),
        );

        CheckReport {
            log: scan.log,
            stats: scan.stats,
            blocks_scanned: geo.num_blocks() - geo.reserved(),
        }
    }

    /// Decode the boot area to learn the volume variant. A broken boot
    /// block downgrades to OFS defaults so the sweep still runs.
    fn check_boot(&self, scan: &mut Scan) {
        let geo = scan.geo;
        let mut area = Vec::with_capacity((geo.reserved() * geo.block_size()) as usize);
        for block in 0..geo.reserved() {
            match self.dev.read_block(BlockNum(block)) {
                Ok(bytes) => area.extend_from_slice(&bytes),
                Err(err) => {
                    scan.stats.read_errors += 1;
                    scan.log.error(block, format!("boot block read failed: {err}"));
                    return;
                }
            }
        }

        let dos_type = DosType(get_long(&area, 0));
        if dos_type.is_valid() {
            scan.is_ffs = dos_type.is_ffs();
            scan.intl = dos_type.is_intl();
            scan.longname = dos_type.is_longname();
            scan.log.info(0, format!("boot block: {dos_type} volume"));
            if !verify_boot_checksum(&area) {
                scan.log
                    .info(0, "boot checksum invalid (volume is not bootable)".to_owned());
            }
        } else {
            scan.log.warn(
                0,
                format!(
                    "boot block has no usable DOS tag ({:#010x}); assuming DOS0",
                    dos_type.0
                ),
            );
        }

        let hint = get_long(&area, 2);
        if geo.contains(BlockNum(hint)) {
            scan.root_num = BlockNum(hint);
        }
    }

    /// Phase 1: classify every block by its tags, reachability aside.
    fn phase1_classify(&self, scan: &mut Scan) {
        let geo = scan.geo;
        for num in geo.reserved()..geo.num_blocks() {
            let bytes = match self.dev.read_block(BlockNum(num)) {
                Ok(bytes) => bytes,
                Err(err) => {
                    scan.stats.read_errors += 1;
                    scan.log.error(num, format!("read failed: {err}"));
                    continue;
                }
            };
            let tags = classify(geo, scan.longname, &bytes);

            if tags.kind == BlockKind::NotStructural {
                scan.stats.not_structural += 1;
                continue;
            }
            if !tags.checksum_ok {
                // On FFS volumes raw payload can resemble a tagged
                // block; without a valid checksum it is only noted.
                scan.stats.tagged_bad_checksum += 1;
                scan.log.info(
                    num,
                    format!("tagged as {:?} but the checksum does not verify", tags.kind),
                );
                continue;
            }

            match tags.kind {
                BlockKind::Root => {
                    scan.stats.root_blocks += 1;
                    if num == scan.root_num.0 {
                        scan.log.debug(num, "root block".to_owned());
                    } else {
                        scan.log
                            .info(num, "valid root block away from the root position".to_owned());
                    }
                }
                BlockKind::UserDir => scan.stats.dir_blocks += 1,
                BlockKind::FileHeader => scan.stats.file_header_blocks += 1,
                BlockKind::FileList => scan.stats.file_list_blocks += 1,
                BlockKind::FileData => scan.stats.file_data_blocks += 1,
                BlockKind::DirCache => scan.stats.dircache_blocks += 1,
                BlockKind::Comment => scan.stats.comment_blocks += 1,
                BlockKind::Link => {
                    scan.stats.link_blocks += 1;
                    scan.log.info(
                        num,
                        format!("link block (sec_type {}) is not supported", tags.sec_type),
                    );
                }
                BlockKind::NotStructural => unreachable!(),
            }

            // Keyed blocks must store their own block number.
            let keyed = matches!(
                tags.kind,
                BlockKind::UserDir
                    | BlockKind::FileHeader
                    | BlockKind::FileList
                    | BlockKind::DirCache
            );
            if keyed && tags.own_key != num {
                scan.log.error(
                    num,
                    format!("own_key is {}, not the physical block number", tags.own_key),
                );
            }

            scan.tags.insert(num, tags);
        }
    }

    /// Load the on-disk bitmap (pages + extension chain) so later
    /// phases can tell live structure from deleted remnants.
    fn load_bitmap(&self, scan: &mut Scan) {
        let geo = scan.geo;
        let root_num = scan.root_num;

        let root = match self
            .dev
            .read_block(root_num)
            .map_err(|e| e.to_string())
            .and_then(|bytes| RootBlock::read(geo, root_num, &bytes).map_err(|e| e.to_string()))
        {
            Ok(root) => root,
            Err(err) => {
                scan.log.fatal(
                    root_num.0,
                    format!("root block unusable, bitmap not checked: {err}"),
                );
                return;
            }
        };

        if root.bm_flag != BITMAP_VALID {
            scan.log.warn(
                root_num.0,
                format!("bm_flag is {:#010x}; bitmap is not marked valid", root.bm_flag),
            );
        }

        // Page list: inline table plus extension chain.
        let mut pages = root.bm_pages.clone();
        let mut seen: HashSet<u32> = HashSet::new();
        let mut ext = root.bm_ext;
        while ext != 0 {
            if !geo.contains(BlockNum(ext)) {
                scan.log.error(
                    root_num.0,
                    format!("bitmap extension pointer {ext} is out of range"),
                );
                break;
            }
            if !seen.insert(ext) {
                scan.log
                    .error(ext, "cycle in bitmap extension chain".to_owned());
                break;
            }
            let bytes = match self.dev.read_block(BlockNum(ext)) {
                Ok(bytes) => bytes,
                Err(err) => {
                    scan.log
                        .error(ext, format!("bitmap extension read failed: {err}"));
                    break;
                }
            };
            scan.reachable.insert(ext);
            match BitmapExtBlock::read(geo, &bytes) {
                Ok(block) => {
                    pages.extend(block.pages);
                    ext = block.next;
                }
                Err(err) => {
                    scan.log
                        .error(ext, format!("bitmap extension undecodable: {err}"));
                    break;
                }
            }
        }

        let expected_pages = geo.bitmap_blocks_needed();
        if pages.len() as u32 != expected_pages {
            scan.log.error(
                root_num.0,
                format!(
                    "bitmap chain holds {} blocks, geometry needs {expected_pages}",
                    pages.len()
                ),
            );
        }

        // Read the words; a bad checksum is reported but the words
        // still take part in the comparison.
        let mut disk_words: Vec<u32> = Vec::new();
        for page in &pages {
            if !geo.contains(*page) {
                scan.log
                    .error(page.0, "bitmap page pointer out of range".to_owned());
                continue;
            }
            scan.reachable.insert(page.0);
            match self.dev.read_block(*page) {
                Ok(bytes) => {
                    if !verify_bitmap_checksum(&bytes) {
                        scan.log
                            .error(page.0, "bitmap block checksum mismatch".to_owned());
                    }
                    for i in 1..geo.block_longs() as usize {
                        disk_words.push(get_long(&bytes, i));
                    }
                }
                Err(err) => {
                    scan.log.error(page.0, format!("bitmap read failed: {err}"));
                }
            }
        }

        let total_bits = geo.bitmap_bits();
        let needed_words = total_bits.div_ceil(32) as usize;
        if disk_words.len() < needed_words {
            scan.log.error(
                root_num.0,
                format!(
                    "bitmap covers {} bits, geometry needs {total_bits}",
                    disk_words.len() * 32
                ),
            );
            return;
        }
        disk_words.truncate(needed_words);
        scan.disk_map = Some(disk_words);
    }

    fn dir_hash_size(scan: &mut Scan, num: u32, tags: &RawTags) -> u32 {
        let expected = scan.geo.hash_table_size();
        if tags.ht_size == 0 {
            expected
        } else {
            if tags.ht_size != expected {
                scan.log.warn(
                    num,
                    format!(
                        "stored hash table size {} differs from the geometric {expected}; trusting the stored value",
                        tags.ht_size
                    ),
                );
            }
            tags.ht_size.min(expected)
        }
    }

    /// Phase 2: walk every bucket chain of every live directory.
    fn phase2_directories(&self, scan: &mut Scan) {
        let geo = scan.geo;
        scan.reachable.insert(scan.root_num.0);

        let dirs: Vec<(u32, RawTags)> = scan
            .tags
            .iter()
            .filter(|(n, t)| {
                matches!(t.kind, BlockKind::Root | BlockKind::UserDir) && scan.is_used(**n)
            })
            .map(|(n, t)| (*n, t.clone()))
            .collect();
        let dir_set: HashSet<u32> = dirs.iter().map(|(n, _)| *n).collect();

        let mut chained: HashSet<u32> = HashSet::new();
        for (dir_num, dir_tags) in &dirs {
            let bytes = match self.dev.read_block(BlockNum(*dir_num)) {
                Ok(bytes) => bytes,
                Err(err) => {
                    scan.log
                        .error(*dir_num, format!("directory re-read failed: {err}"));
                    continue;
                }
            };
            let hash_size = Self::dir_hash_size(scan, *dir_num, dir_tags);

            for bucket in 0..hash_size {
                let head = get_long(&bytes, 6 + bucket as usize);
                let mut seen: HashSet<u32> = HashSet::new();
                let mut cur = head;
                while cur != 0 {
                    if !geo.contains(BlockNum(cur)) {
                        scan.log.error(
                            *dir_num,
                            format!("bucket {bucket} chains to out-of-range block {cur}"),
                        );
                        break;
                    }
                    if !seen.insert(cur) {
                        scan.log.error(
                            cur,
                            format!("hash chain cycle in bucket {bucket} of directory {dir_num}"),
                        );
                        break;
                    }
                    if !scan.is_used(cur) {
                        scan.log.error(
                            cur,
                            format!(
                                "bucket {bucket} of directory {dir_num} chains to a block marked free"
                            ),
                        );
                        break;
                    }
                    let Some(entry) = scan.tags.get(&cur).filter(|t| {
                        t.checksum_ok
                            && matches!(t.kind, BlockKind::UserDir | BlockKind::FileHeader)
                    }) else {
                        scan.log.error(
                            cur,
                            format!(
                                "bucket {bucket} of directory {dir_num} chains to a non-entry block"
                            ),
                        );
                        break;
                    };
                    let entry = entry.clone();

                    if entry.parent != *dir_num {
                        scan.log.error(
                            cur,
                            format!(
                                "entry parent is {}, owning directory is {dir_num}",
                                entry.parent
                            ),
                        );
                    }
                    let expected_bucket = name_hash(&entry.name, hash_size, scan.intl);
                    if expected_bucket != bucket {
                        scan.log.error(
                            cur,
                            format!(
                                "entry {:?} sits in bucket {bucket} but hashes to {expected_bucket}",
                                String::from_utf8_lossy(&entry.name)
                            ),
                        );
                    }

                    chained.insert(cur);
                    scan.reachable.insert(cur);
                    cur = entry.hash_chain;
                }
            }
        }

        // Orphans: live entry blocks no chain walk reached. Entries in
        // blocks the bitmap marks free are deleted remnants.
        let mut orphan_findings: Vec<(CheckLevel, u32, String)> = Vec::new();
        for (num, tags) in &scan.tags {
            if !matches!(tags.kind, BlockKind::UserDir | BlockKind::FileHeader)
                || chained.contains(num)
            {
                continue;
            }
            if !scan.is_used(*num) {
                orphan_findings.push((
                    CheckLevel::Debug,
                    *num,
                    "stale entry block (free in the bitmap)".to_owned(),
                ));
            } else if dir_set.contains(&tags.parent) {
                orphan_findings.push((
                    CheckLevel::Error,
                    *num,
                    format!(
                        "orphaned entry: parent directory {} never chains to it",
                        tags.parent
                    ),
                ));
            } else {
                orphan_findings.push((
                    CheckLevel::Warn,
                    *num,
                    format!("unreachable entry block (parent {} is not a directory)", tags.parent),
                ));
            }
        }
        for (level, num, msg) in orphan_findings {
            scan.log.push(level, Some(num), msg);
        }

        // Directory cache chains hang off every reachable directory.
        let cache_roots: Vec<u32> = dirs
            .iter()
            .filter(|(n, _)| scan.reachable.contains(n))
            .map(|(n, _)| *n)
            .collect();
        for dir_num in cache_roots {
            self.walk_dircache_chain(scan, dir_num);
        }
    }

    fn walk_dircache_chain(&self, scan: &mut Scan, dir_num: u32) {
        let geo = scan.geo;
        let Some(dir_tags) = scan.tags.get(&dir_num) else {
            return;
        };
        let mut seen: HashSet<u32> = HashSet::new();
        let mut cur = dir_tags.extension;
        while cur != 0 {
            if !geo.contains(BlockNum(cur)) {
                scan.log.error(
                    dir_num,
                    format!("directory cache chain points at out-of-range block {cur}"),
                );
                break;
            }
            if !seen.insert(cur) {
                scan.log
                    .error(cur, format!("cycle in directory cache chain of {dir_num}"));
                break;
            }
            let Some(next) = scan
                .tags
                .get(&cur)
                .filter(|t| t.kind == BlockKind::DirCache && t.checksum_ok)
                .map(|t| t.extension)
            else {
                scan.log.error(
                    cur,
                    format!("directory cache chain of {dir_num} hits a non-cache block"),
                );
                break;
            };
            scan.reachable.insert(cur);
            cur = next;
        }
    }

    /// Extract the (reverse-stored) data pointer table of a header or
    /// list block, tolerantly.
    fn extract_ptrs(&self, scan: &mut Scan, num: u32, high_seq: u32) -> Vec<u32> {
        let capacity = scan.geo.hash_table_size();
        let count = high_seq.min(capacity);
        if high_seq > capacity {
            scan.log.error(
                num,
                format!("high_seq {high_seq} exceeds the {capacity}-slot pointer table"),
            );
        }
        let bytes = match self.dev.read_block(BlockNum(num)) {
            Ok(bytes) => bytes,
            Err(err) => {
                scan.log.error(num, format!("re-read failed: {err}"));
                return Vec::new();
            }
        };
        let mut ptrs = Vec::with_capacity(count as usize);
        for i in 0..count {
            let ptr = get_long(&bytes, 6 + (capacity - 1 - i) as usize);
            if ptr == 0 {
                scan.log
                    .error(num, format!("zero data pointer at table index {i}"));
                break;
            }
            ptrs.push(ptr);
        }
        ptrs
    }

    /// Phase 3: follow every live file header's extension chain and
    /// check its data blocks.
    fn phase3_files(&self, scan: &mut Scan) {
        let geo = scan.geo;
        let headers: Vec<(u32, RawTags)> = scan
            .tags
            .iter()
            .filter(|(n, t)| t.kind == BlockKind::FileHeader && scan.is_used(**n))
            .map(|(n, t)| (*n, t.clone()))
            .collect();

        let data_bytes = if scan.is_ffs {
            geo.block_size()
        } else {
            geo.ofs_data_bytes()
        };
        let ptrs_per_block = geo.hash_table_size();

        for (hdr_num, hdr_tags) in headers {
            let mut ptrs = self.extract_ptrs(scan, hdr_num, hdr_tags.high_seq);

            // Extension chain.
            let mut lists = 0_u32;
            let mut seen: HashSet<u32> = HashSet::new();
            let mut cur = hdr_tags.extension;
            while cur != 0 {
                if !geo.contains(BlockNum(cur)) {
                    scan.log.error(
                        hdr_num,
                        format!("extension chain points at out-of-range block {cur}"),
                    );
                    break;
                }
                if !seen.insert(cur) {
                    scan.log
                        .error(cur, format!("cycle in extension chain of file {hdr_num}"));
                    break;
                }
                let Some(list) = scan
                    .tags
                    .get(&cur)
                    .filter(|t| t.kind == BlockKind::FileList && t.checksum_ok)
                    .cloned()
                else {
                    scan.log.error(
                        cur,
                        format!("extension chain of file {hdr_num} hits a non-list block"),
                    );
                    break;
                };
                if list.parent != hdr_num {
                    scan.log.error(
                        cur,
                        format!(
                            "file list parent is {}, owning header is {hdr_num}",
                            list.parent
                        ),
                    );
                }
                lists += 1;
                scan.reachable.insert(cur);
                ptrs.extend(self.extract_ptrs(scan, cur, list.high_seq));
                cur = list.extension;
            }

            // Counts against the byte size.
            let expected_data = hdr_tags.byte_size.div_ceil(data_bytes);
            let expected_ext = expected_data
                .saturating_sub(ptrs_per_block)
                .div_ceil(ptrs_per_block);
            if lists != expected_ext {
                scan.log.error(
                    hdr_num,
                    format!(
                        "byte size {} needs {expected_ext} file list blocks, found {lists}",
                        hdr_tags.byte_size
                    ),
                );
            }
            if ptrs.len() as u32 != expected_data {
                scan.log.error(
                    hdr_num,
                    format!(
                        "byte size {} needs {expected_data} data blocks, found {}",
                        hdr_tags.byte_size,
                        ptrs.len()
                    ),
                );
            }

            // Data blocks.
            scan.reachable.insert(hdr_num);
            for (i, &ptr) in ptrs.iter().enumerate() {
                if !geo.contains(BlockNum(ptr)) {
                    scan.log.error(
                        hdr_num,
                        format!("data pointer {i} addresses out-of-range block {ptr}"),
                    );
                    continue;
                }
                scan.reachable.insert(ptr);

                if !scan.is_ffs {
                    let expected_seq = i as u32 + 1;
                    match scan.tags.get(&ptr) {
                        Some(d) if d.kind == BlockKind::FileData && d.checksum_ok => {
                            if d.own_key != hdr_num {
                                scan.log.error(
                                    ptr,
                                    format!(
                                        "data block hdr_key is {}, owning header is {hdr_num}",
                                        d.own_key
                                    ),
                                );
                            }
                            if d.high_seq != expected_seq {
                                scan.log.error(
                                    ptr,
                                    format!(
                                        "data block seq_num is {}, expected {expected_seq}",
                                        d.high_seq
                                    ),
                                );
                            }
                        }
                        _ => {
                            scan.log.error(
                                ptr,
                                format!(
                                    "file {hdr_num} references a block that is not a valid data block"
                                ),
                            );
                        }
                    }
                }
            }
        }
    }

    /// Phase 4: rebuild the expected bitmap from reachable blocks and
    /// compare it against the on-disk bitmap.
    fn phase4_bitmap(&self, scan: &mut Scan) {
        let geo = scan.geo;
        let Some(disk_words) = scan.disk_map.take() else {
            // load_bitmap already reported why.
            return;
        };

        let mut expected = BitmapAlloc::new_all_free(geo);
        for &block in &scan.reachable {
            if geo.contains(BlockNum(block)) {
                let _ = expected.clr_bit(BlockNum(block));
            }
        }

        let total_bits = geo.bitmap_bits();
        let needed_words = disk_words.len();
        let mut mismatched_words = 0_u32;
        for (w, (&disk, &want)) in disk_words.iter().zip(expected.words()).enumerate() {
            let mask = if w == needed_words - 1 {
                trailing_mask(total_bits)
            } else {
                u32::MAX
            };
            if disk & mask != want & mask {
                mismatched_words += 1;
                let first_block = geo.reserved() + (w as u32) * 32;
                scan.log.error(
                    first_block,
                    format!(
                        "bitmap word {w} (blocks {first_block}..{}) is {:#010x}, tree walk expects {:#010x}",
                        first_block + 31,
                        disk & mask,
                        want & mask
                    ),
                );
            }
        }
        scan.disk_map = Some(disk_words);
        if mismatched_words == 0 {
            scan.log
                .debug(None, "bitmap matches the derived occupancy".to_owned());
        }
    }
}
