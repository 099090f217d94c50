#![forbid(unsafe_code)]
//! The volume object: mount, format and the path-based façade.
//!
//! [`Volume`] ties the boot block, root block, bitmap allocator and
//! root directory together. `open` validates everything it touches and
//! fails fast on any structural violation and never mounts in a
//! partially-valid state; exhaustive damage reporting over bad images
//! is the validator's job (`adf-check`).
//!
//! Paths use Amiga conventions: `/` separates components, a leading
//! `Name:` device/volume prefix is stripped, and `""`, `"/"` and `":"`
//! all alias the root directory. Lookups are case-insensitive under the
//! volume's folding rules.

use adf_alloc::BitmapAlloc;
use adf_block::BlockDevice;
use adf_error::{AdfError, Result};
use adf_node::{Dir, FsCtx, MetaInfo, Node, now_ts};
use adf_ondisk::{BitmapExtBlock, BootBlock, RootBlock};
use adf_types::{BlockNum, DosType, Geometry, MAX_NAME_LEN, Protection, validate_name};
use std::sync::Arc;
use tracing::{debug, warn};

/// An opened (or freshly created) AmigaDOS volume.
pub struct Volume {
    fs: FsCtx,
    boot: BootBlock,
    root_num: BlockNum,
    root: Dir,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("name", &String::from_utf8_lossy(self.name()))
            .field("dos_type", &self.boot.dos_type)
            .field("root_block", &self.root_num)
            .field("geometry", &self.fs.geometry())
            .field("free_blocks", &self.fs.free_blocks())
            .finish()
    }
}

impl Volume {
    /// Mount an existing volume.
    ///
    /// Reads and validates the boot area, the root block and the
    /// bitmap chain. Any failure is fatal; nothing is silently
    /// repaired or skipped.
    pub fn open(dev: Arc<dyn BlockDevice>) -> Result<Self> {
        let geo = dev.geometry();

        let mut boot_area = Vec::with_capacity((geo.reserved() * geo.block_size()) as usize);
        for block in 0..geo.reserved() {
            boot_area.extend_from_slice(&dev.read_block(BlockNum(block))?);
        }
        let boot = BootBlock::read(geo, &boot_area)?;

        // The stored root number is a hint; fall back to the geometric
        // midpoint when it is absent or out of range.
        let hint = BlockNum(boot.root_block);
        let root_num = if geo.contains(hint) {
            hint
        } else {
            if boot.root_block != 0 {
                warn!(
                    stored = boot.root_block,
                    fallback = geo.root_block_hint().0,
                    "boot block root pointer out of range; using the geometric midpoint"
                );
            }
            geo.root_block_hint()
        };

        let bytes = dev.read_block(root_num)?;
        let root_block = RootBlock::read(geo, root_num, &bytes)?;
        if !root_block.bitmap_valid() {
            return Err(AdfError::InvalidBitmapBlock {
                block: root_num.0,
                detail: format!("root bm_flag is {:#010x}, bitmap not marked valid", root_block.bm_flag),
            });
        }

        let alloc = BitmapAlloc::read(&*dev, &root_block)?;
        let fs = FsCtx::new(dev, boot.dos_type, alloc);
        let root = Dir::read_root(&fs, root_num)?;

        debug!(
            dos_type = %boot.dos_type,
            root = root_num.0,
            free = fs.free_blocks(),
            "volume opened"
        );
        Ok(Self {
            fs,
            boot,
            root_num,
            root,
        })
    }

    /// Format the device with a fresh, empty filesystem.
    ///
    /// Writes the boot area, an empty root block and a blank bitmap in
    /// which only the root, bitmap and bitmap-extension blocks are
    /// used. Bitmap blocks are placed directly after the root block.
    pub fn create(
        dev: Arc<dyn BlockDevice>,
        name: &str,
        dos_type: DosType,
        boot_code: Option<&[u8]>,
    ) -> Result<Self> {
        let geo = dev.geometry();
        if !dos_type.is_valid() {
            return Err(AdfError::InvalidBootBlock {
                block: 0,
                detail: format!("{:#010x} is not a DOS0..DOS7 tag", dos_type.0),
            });
        }
        validate_name(name.as_bytes(), MAX_NAME_LEN).map_err(|e| AdfError::InvalidVolumeName {
            name: name.to_owned(),
            reason: e.to_string(),
        })?;

        let root_num = geo.root_block_hint();

        // Bitmap layout: pages first, extension blocks after, all in a
        // run starting right behind the root block.
        let pages_needed = geo.bitmap_blocks_needed();
        let ext_slots = geo.block_longs() - 1;
        let ext_needed = pages_needed
            .saturating_sub(adf_types::ROOT_BITMAP_PAGES as u32)
            .div_ceil(ext_slots);
        let span = 1 + pages_needed + ext_needed;
        if root_num.0 + span > geo.num_blocks() {
            return Err(AdfError::NoFreeBlocks {
                requested: span,
                available: geo.num_blocks() - root_num.0,
            });
        }
        let pages: Vec<BlockNum> = (0..pages_needed)
            .map(|i| BlockNum(root_num.0 + 1 + i))
            .collect();
        let exts: Vec<BlockNum> = (0..ext_needed)
            .map(|i| BlockNum(root_num.0 + 1 + pages_needed + i))
            .collect();

        let mut alloc = BitmapAlloc::new_all_free(geo);
        alloc.clr_bit(root_num)?;
        for block in pages.iter().chain(&exts) {
            alloc.clr_bit(*block)?;
        }
        alloc.attach_blocks(pages.clone(), exts.clone());

        // Boot area.
        let boot = BootBlock::new(dos_type, geo, boot_code.unwrap_or_default().to_vec());
        let boot_bytes = boot.to_bytes(geo)?;
        let bs = geo.block_size() as usize;
        for block in 0..geo.reserved() {
            let start = block as usize * bs;
            dev.write_block(BlockNum(block), &boot_bytes[start..start + bs])?;
        }

        // Root block with the inline page table and extension chain.
        let mut root_block = RootBlock::new(geo, name.as_bytes().to_vec(), now_ts());
        let inline = pages.len().min(adf_types::ROOT_BITMAP_PAGES);
        root_block.bm_pages = pages[..inline].to_vec();
        root_block.bm_ext = exts.first().map_or(0, |b| b.0);
        dev.write_block(root_num, &root_block.to_bytes(geo)?)?;

        // Extension chain contents.
        let mut overflow = pages[inline..].iter();
        for (i, ext) in exts.iter().enumerate() {
            let chunk: Vec<BlockNum> = overflow.by_ref().take(ext_slots as usize).copied().collect();
            let block = BitmapExtBlock {
                pages: chunk,
                next: exts.get(i + 1).map_or(0, |b| b.0),
            };
            dev.write_block(*ext, &block.to_bytes(geo)?)?;
        }

        alloc.write_only_bits(&*dev)?;
        dev.sync()?;

        let fs = FsCtx::new(dev, dos_type, alloc);
        let root = Dir::read_root(&fs, root_num)?;
        debug!(name, dos_type = %dos_type, root = root_num.0, "volume created");
        Ok(Self {
            fs,
            boot,
            root_num,
            root,
        })
    }

    // ── Accessors ───────────────────────────────────────────────────────

    #[must_use]
    pub fn name(&self) -> &[u8] {
        self.root.name()
    }

    #[must_use]
    pub fn dos_type(&self) -> DosType {
        self.boot.dos_type
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.fs.geometry()
    }

    #[must_use]
    pub fn boot_block(&self) -> &BootBlock {
        &self.boot
    }

    #[must_use]
    pub fn root_block_num(&self) -> BlockNum {
        self.root_num
    }

    #[must_use]
    pub fn fs(&self) -> &FsCtx {
        &self.fs
    }

    pub fn get_root_dir(&mut self) -> &mut Dir {
        &mut self.root
    }

    #[must_use]
    pub fn get_free_blocks(&self) -> u32 {
        self.fs.free_blocks()
    }

    #[must_use]
    pub fn get_used_blocks(&self) -> u32 {
        self.fs.used_blocks()
    }

    // ── Path handling ───────────────────────────────────────────────────

    /// Split an Amiga path: strip a `Name:` prefix, split on `/`, drop
    /// empty components. Root aliases (`""`, `"/"`, `":"`) come out
    /// empty.
    #[must_use]
    pub fn split_path(path: &str) -> Vec<&[u8]> {
        let rest = match path.split_once(':') {
            Some((_, rest)) => rest,
            None => path,
        };
        rest.split('/')
            .filter(|c| !c.is_empty())
            .map(str::as_bytes)
            .collect()
    }

    /// Resolve a path to its node. Root aliases and missing entries
    /// both yield `None`; use [`Volume::get_root_dir`] for the root.
    pub fn get_path_name(&mut self, path: &str) -> Result<Option<&mut Node>> {
        let components = Self::split_path(path);
        if components.is_empty() {
            return Ok(None);
        }
        self.root.get_path(&self.fs, &components)
    }

    /// Split a path into its parent directory components and the final
    /// (to-be-created) name.
    pub fn get_create_path_name(path: &str) -> Result<(Vec<&[u8]>, &[u8])> {
        let mut components = Self::split_path(path);
        let base = components.pop().ok_or_else(|| AdfError::InvalidFileName {
            name: path.to_owned(),
            reason: "path has no final component".to_owned(),
        })?;
        Ok((components, base))
    }

    // ── Façade operations ───────────────────────────────────────────────

    /// Create a directory at `path` (parents must exist).
    pub fn create_dir(&mut self, path: &str) -> Result<BlockNum> {
        let (parents, base) = Self::get_create_path_name(path)?;
        let fs = &self.fs;
        let dir = if parents.is_empty() {
            &mut self.root
        } else {
            match self.root.get_path(fs, &parents)? {
                Some(Node::Dir(dir)) => dir,
                _ => {
                    return Err(AdfError::FileNotFound {
                        path: path.to_owned(),
                    });
                }
            }
        };
        dir.create_dir(fs, base, &MetaInfo::default())
    }

    /// Write a complete file at `path` (parents must exist, the name
    /// must be new).
    pub fn write_file(&mut self, data: &[u8], path: &str) -> Result<BlockNum> {
        let (parents, base) = Self::get_create_path_name(path)?;
        let fs = &self.fs;
        let dir = if parents.is_empty() {
            &mut self.root
        } else {
            match self.root.get_path(fs, &parents)? {
                Some(Node::Dir(dir)) => dir,
                _ => {
                    return Err(AdfError::FileNotFound {
                        path: path.to_owned(),
                    });
                }
            }
        };
        dir.create_file(fs, base, data, &MetaInfo::default())
    }

    /// Read a file's full contents.
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let fs = &self.fs;
        let components = Self::split_path(path);
        if components.is_empty() {
            return Err(AdfError::FileNotFound {
                path: path.to_owned(),
            });
        }
        match self.root.get_path(fs, &components)? {
            Some(Node::File(file)) => file.read_data(fs),
            _ => Err(AdfError::FileNotFound {
                path: path.to_owned(),
            }),
        }
    }

    /// Delete the entry at `path`. `wipe` zero-fills freed blocks;
    /// `recursive` empties directories first.
    pub fn delete(&mut self, path: &str, wipe: bool, recursive: bool) -> Result<()> {
        let (parents, base) = Self::get_create_path_name(path).map_err(|_| {
            AdfError::DeleteNotAllowed {
                name: path.to_owned(),
                reason: "cannot delete the volume root".to_owned(),
            }
        })?;
        let fs = &self.fs;
        let dir = if parents.is_empty() {
            &mut self.root
        } else {
            match self.root.get_path(fs, &parents)? {
                Some(Node::Dir(dir)) => dir,
                _ => {
                    return Err(AdfError::FileNotFound {
                        path: path.to_owned(),
                    });
                }
            }
        };
        dir.delete(fs, base, wipe, recursive)
    }

    /// List the entry names of the directory at `path`.
    pub fn list(&mut self, path: &str) -> Result<Vec<String>> {
        let fs = &self.fs;
        let components = Self::split_path(path);
        let dir = if components.is_empty() {
            &mut self.root
        } else {
            match self.root.get_path(fs, &components)? {
                Some(Node::Dir(dir)) => dir,
                _ => {
                    return Err(AdfError::FileNotFound {
                        path: path.to_owned(),
                    });
                }
            }
        };
        Ok(dir
            .list(fs)?
            .into_iter()
            .map(|n| String::from_utf8_lossy(&n).into_owned())
            .collect())
    }

    /// Change an entry's protection bits.
    pub fn set_protect(&mut self, path: &str, protect: Protection) -> Result<()> {
        let fs = &self.fs;
        let components = Self::split_path(path);
        if components.is_empty() {
            return Err(AdfError::FileNotFound {
                path: path.to_owned(),
            });
        }
        match self.root.get_path(fs, &components)? {
            Some(node) => node.set_protect(fs, protect),
            None => Err(AdfError::FileNotFound {
                path: path.to_owned(),
            }),
        }
    }

    /// Change an entry's protection bits from the `"hsparwed"` string
    /// form.
    pub fn set_protect_str(&mut self, path: &str, protect: &str) -> Result<()> {
        let protect = Protection::parse(protect).map_err(|e| AdfError::InvalidProtectFormat {
            value: e.0,
        })?;
        self.set_protect(path, protect)
    }

    /// Change an entry's comment.
    pub fn set_comment(&mut self, path: &str, comment: &[u8]) -> Result<()> {
        let fs = &self.fs;
        let components = Self::split_path(path);
        if components.is_empty() {
            return Err(AdfError::FileNotFound {
                path: path.to_owned(),
            });
        }
        match self.root.get_path(fs, &components)? {
            Some(node) => node.set_comment(fs, comment.to_vec()),
            None => Err(AdfError::FileNotFound {
                path: path.to_owned(),
            }),
        }
    }

    /// Rename the volume (rewrites the root block).
    pub fn relabel(&mut self, name: &str) -> Result<()> {
        validate_name(name.as_bytes(), MAX_NAME_LEN).map_err(|e| AdfError::InvalidVolumeName {
            name: name.to_owned(),
            reason: e.to_string(),
        })?;
        self.root.set_root_name(&self.fs, name.as_bytes().to_vec())
    }

    /// Drop cached directory state and flush the device.
    pub fn flush(&mut self) -> Result<()> {
        self.root.flush();
        self.fs.dev.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adf_block::MemBlockDevice;

    fn mem_volume(dos_type: DosType) -> Volume {
        let dev = Arc::new(MemBlockDevice::new(Geometry::floppy_dd()));
        Volume::create(dev, "Workbench", dos_type, None).unwrap()
    }

    #[test]
    fn split_path_handles_amiga_conventions() {
        assert!(Volume::split_path("").is_empty());
        assert!(Volume::split_path("/").is_empty());
        assert!(Volume::split_path(":").is_empty());
        assert_eq!(Volume::split_path("Devs"), vec![b"Devs".as_slice()]);
        assert_eq!(
            Volume::split_path("Work:Devs/Keymaps"),
            vec![b"Devs".as_slice(), b"Keymaps".as_slice()]
        );
        assert_eq!(
            Volume::split_path(":s/startup-sequence"),
            vec![b"s".as_slice(), b"startup-sequence".as_slice()]
        );
        assert_eq!(
            Volume::split_path("a//b/"),
            vec![b"a".as_slice(), b"b".as_slice()]
        );
    }

    #[test]
    fn create_open_round_trip() {
        let dev = Arc::new(MemBlockDevice::new(Geometry::floppy_dd()));
        {
            let vol = Volume::create(dev.clone(), "Workbench", DosType::FFS, None).unwrap();
            assert_eq!(vol.name(), b"Workbench");
            assert_eq!(vol.root_block_num(), BlockNum(880));
            // Root and one bitmap block are used.
            assert_eq!(vol.get_used_blocks(), 2);
        }

        let mut vol = Volume::open(dev).unwrap();
        assert_eq!(vol.name(), b"Workbench");
        assert_eq!(vol.dos_type(), DosType::FFS);
        assert!(vol.list("").unwrap().is_empty());
    }

    #[test]
    fn create_rejects_bad_volume_names() {
        let dev = Arc::new(MemBlockDevice::new(Geometry::floppy_dd()));
        for bad in ["", "a/b", "a:b"] {
            let err = Volume::create(dev.clone(), bad, DosType::OFS, None).unwrap_err();
            assert!(matches!(err, AdfError::InvalidVolumeName { .. }), "{bad}");
        }
        let long = "x".repeat(31);
        assert!(matches!(
            Volume::create(dev, &long, DosType::OFS, None),
            Err(AdfError::InvalidVolumeName { .. })
        ));
    }

    #[test]
    fn create_rejects_invalid_dos_type() {
        let dev = Arc::new(MemBlockDevice::new(Geometry::floppy_dd()));
        let err = Volume::create(dev, "Disk", DosType(0x1234_5678), None).unwrap_err();
        assert!(matches!(err, AdfError::InvalidBootBlock { .. }));
    }

    #[test]
    fn open_rejects_unformatted_device() {
        let dev = Arc::new(MemBlockDevice::new(Geometry::floppy_dd()));
        let err = Volume::open(dev).unwrap_err();
        assert!(matches!(err, AdfError::InvalidBootBlock { .. }));
    }

    #[test]
    fn boot_code_makes_volume_bootable() {
        let dev = Arc::new(MemBlockDevice::new(Geometry::floppy_dd()));
        let code = vec![0x4E, 0x71, 0x4E, 0x75];
        let vol = Volume::create(dev.clone(), "Boot", DosType::OFS, Some(&code)).unwrap();
        assert!(vol.boot_block().bootable);
        drop(vol);

        let vol = Volume::open(dev).unwrap();
        assert!(vol.boot_block().bootable);
        assert_eq!(vol.boot_block().boot_code, code);
    }

    #[test]
    fn write_read_delete_file_via_paths() {
        let mut vol = mem_volume(DosType::FFS);
        let payload: Vec<u8> = (0..3000_u32).map(|i| (i % 239) as u8).collect();

        vol.create_dir("s").unwrap();
        vol.write_file(&payload, "s/startup-sequence").unwrap();

        assert_eq!(vol.read_file("S/Startup-Sequence").unwrap(), payload);
        assert_eq!(vol.list("s").unwrap(), vec!["startup-sequence"]);

        let free_before_delete = vol.get_free_blocks();
        vol.delete("s/startup-sequence", false, false).unwrap();
        assert!(vol.get_free_blocks() > free_before_delete);
        assert!(matches!(
            vol.read_file("s/startup-sequence"),
            Err(AdfError::FileNotFound { .. })
        ));
    }

    #[test]
    fn create_then_delete_restores_free_count() {
        let mut vol = mem_volume(DosType::OFS);
        let before = vol.get_free_blocks();

        vol.create_dir("Work").unwrap();
        vol.write_file(&vec![7_u8; 3000], "Work/blob").unwrap();
        vol.delete("Work", false, true).unwrap();

        assert_eq!(vol.get_free_blocks(), before);
    }

    #[test]
    fn deleting_root_is_refused() {
        let mut vol = mem_volume(DosType::OFS);
        for alias in ["", "/", ":"] {
            let err = vol.delete(alias, false, false).unwrap_err();
            assert!(matches!(err, AdfError::DeleteNotAllowed { .. }), "{alias}");
        }
    }

    #[test]
    fn missing_parent_is_file_not_found() {
        let mut vol = mem_volume(DosType::FFS);
        assert!(matches!(
            vol.write_file(b"x", "nope/file"),
            Err(AdfError::FileNotFound { .. })
        ));
        assert!(matches!(
            vol.create_dir("nope/dir"),
            Err(AdfError::FileNotFound { .. })
        ));
        assert!(matches!(
            vol.list("nope"),
            Err(AdfError::FileNotFound { .. })
        ));
    }

    #[test]
    fn protect_and_comment_round_trip() {
        let dev = Arc::new(MemBlockDevice::new(Geometry::floppy_dd()));
        let mut vol = Volume::create(dev.clone(), "Meta", DosType::FFS, None).unwrap();
        vol.write_file(b"#!", "script").unwrap();

        let protect = Protection::parse("-s--rwed").unwrap();
        vol.set_protect("script", protect).unwrap();
        vol.set_comment("script", b"shell script").unwrap();
        drop(vol);

        let mut vol = Volume::open(dev).unwrap();
        let node = vol.get_path_name("script").unwrap().unwrap();
        assert_eq!(node.protect(), protect);
        assert_eq!(node.comment(), b"shell script");

        assert!(matches!(
            vol.set_comment("script", &[b'x'; 80]),
            Err(AdfError::InvalidFileName { .. })
        ));
        assert!(matches!(
            vol.set_protect("absent", protect),
            Err(AdfError::FileNotFound { .. })
        ));
        assert!(matches!(
            vol.set_protect_str("script", "not-a-mask"),
            Err(AdfError::InvalidProtectFormat { .. })
        ));
        vol.set_protect_str("script", "----rwed").unwrap();
    }

    #[test]
    fn relabel_persists() {
        let dev = Arc::new(MemBlockDevice::new(Geometry::floppy_dd()));
        let mut vol = Volume::create(dev.clone(), "Old", DosType::FFS, None).unwrap();
        vol.relabel("New").unwrap();
        assert_eq!(vol.name(), b"New");
        drop(vol);

        let vol = Volume::open(dev).unwrap();
        assert_eq!(vol.name(), b"New");

        let mut vol = vol;
        assert!(matches!(
            vol.relabel("bad:name"),
            Err(AdfError::InvalidVolumeName { .. })
        ));
    }

    #[test]
    fn reopen_after_mutations_preserves_tree() {
        let dev = Arc::new(MemBlockDevice::new(Geometry::floppy_dd()));
        {
            let mut vol = Volume::create(dev.clone(), "Persist", DosType::OFS, None).unwrap();
            vol.create_dir("a").unwrap();
            vol.create_dir("a/b").unwrap();
            vol.write_file(b"deep", "a/b/c").unwrap();
            vol.flush().unwrap();
        }

        let mut vol = Volume::open(dev).unwrap();
        assert_eq!(vol.read_file("a/b/c").unwrap(), b"deep");
        let mut names = vol.list("a").unwrap();
        names.sort();
        assert_eq!(names, vec!["b"]);
    }

    #[test]
    fn get_path_name_resolves_nodes() {
        let mut vol = mem_volume(DosType::FFS);
        vol.create_dir("Devs").unwrap();
        vol.write_file(b"DF0:", "Devs/MountList").unwrap();

        assert!(vol.get_path_name("").unwrap().is_none());
        let node = vol.get_path_name("devs").unwrap().unwrap();
        assert!(node.is_dir());
        let node = vol.get_path_name("Devs/mountlist").unwrap().unwrap();
        assert!(!node.is_dir());
        assert!(vol.get_path_name("Devs/absent").unwrap().is_none());
    }
}
