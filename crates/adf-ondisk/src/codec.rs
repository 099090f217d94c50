//! Typed views over raw block buffers.
//!
//! Strict `read` constructors for the volume/node layers, `to_bytes`
//! encoders that restamp checksums, and the tolerant [`classify`] path
//! for the validator.

use crate::{
    BITMAP_VALID, END_BM_EXT, END_BM_FIRST_PAGE, END_BM_FLAG, END_BYTE_SIZE, END_CREATE_DAYS,
    END_DISK_DAYS, END_EXTENSION, END_HASH_CHAIN, END_MOD_DAYS, END_PARENT, END_PROTECT,
    END_SEC_TYPE, OFF_FIRST_DATA, OFF_HEADER_KEY, OFF_HIGH_SEQ, OFF_HT_SIZE, OFF_TABLE, ST_FILE,
    ST_ROOT, ST_USERDIR, T_COMMENT, T_DATA, T_DIRCACHE, T_HEADER, T_LIST, comment_offset,
    get_long, get_long_end, get_timestamp_end, name_offset, put_long, put_long_end,
    put_timestamp_end, stamp_header_checksum, verify_header_checksum,
};
use adf_error::{AdfError, Result};
use adf_types::{
    BlockNum, Geometry, MAX_COMMENT_LEN, MAX_LONG_NAME_LEN, MAX_NAME_LEN, Protection,
    ROOT_BITMAP_PAGES, TimeStamp,
};
use serde::{Deserialize, Serialize};

/// Bytes of the classic name field (length byte + 30 chars + spare).
const NAME_FIELD_BYTES: usize = 32;

/// Bytes of the classic comment field (length byte + 79 chars).
const COMMENT_FIELD_BYTES: usize = 80;

/// Combined name+comment capacity in long-filename blocks.
const NAC_FIELD_BYTES: usize = NAME_FIELD_BYTES + COMMENT_FIELD_BYTES;

fn check_len(geo: Geometry, bytes: &[u8]) -> Result<()> {
    if bytes.len() != geo.block_size() as usize {
        return Err(AdfError::InternalError {
            detail: format!(
                "block buffer is {} bytes, device block size is {}",
                bytes.len(),
                geo.block_size()
            ),
        });
    }
    Ok(())
}

fn sec_type_of(bytes: &[u8]) -> i32 {
    get_long_end(bytes, END_SEC_TYPE) as i32
}

fn read_bstr(bytes: &[u8], off: usize, cap: usize) -> Vec<u8> {
    let len = usize::from(bytes[off]).min(cap);
    bytes[off + 1..off + 1 + len].to_vec()
}

fn write_bstr(bytes: &mut [u8], off: usize, len: usize) -> &mut [u8] {
    // Helper split: callers validated len <= cap.
    bytes[off] = len as u8;
    &mut bytes[off + 1..off + 1 + len]
}

/// Read the classic (short) name and comment fields.
fn read_name_comment(bytes: &[u8], block_size: usize) -> (Vec<u8>, Vec<u8>) {
    let name = read_bstr(bytes, name_offset(block_size), MAX_NAME_LEN);
    let comment = read_bstr(bytes, comment_offset(block_size), MAX_COMMENT_LEN);
    (name, comment)
}

fn write_name_comment(bytes: &mut [u8], block_size: usize, name: &[u8], comment: &[u8]) {
    write_bstr(bytes, name_offset(block_size), name.len()).copy_from_slice(name);
    write_bstr(bytes, comment_offset(block_size), comment.len()).copy_from_slice(comment);
}

/// Read the combined name+comment stream of a long-filename block.
///
/// DOS6/DOS7 repurpose the comment field and the old name field as one
/// 112-byte stream: name length byte, name (up to 110), comment length
/// byte, comment. The stream is stored comment-field-first.
fn read_nac(bytes: &[u8], block_size: usize) -> (Vec<u8>, Vec<u8>) {
    let mut stream = Vec::with_capacity(NAC_FIELD_BYTES);
    let coff = comment_offset(block_size);
    let noff = name_offset(block_size);
    stream.extend_from_slice(&bytes[coff..coff + COMMENT_FIELD_BYTES]);
    stream.extend_from_slice(&bytes[noff..noff + NAME_FIELD_BYTES]);

    let nlen = usize::from(stream[0]).min(MAX_LONG_NAME_LEN);
    let name = stream[1..1 + nlen].to_vec();
    let cidx = 1 + nlen;
    let ccap = NAC_FIELD_BYTES - cidx - 1;
    let clen = usize::from(stream[cidx]).min(ccap.min(MAX_COMMENT_LEN));
    let comment = stream[cidx + 1..cidx + 1 + clen].to_vec();
    (name, comment)
}

fn write_nac(bytes: &mut [u8], block_size: usize, name: &[u8], comment: &[u8]) {
    let mut stream = vec![0_u8; NAC_FIELD_BYTES];
    stream[0] = name.len() as u8;
    stream[1..1 + name.len()].copy_from_slice(name);
    let cidx = 1 + name.len();
    stream[cidx] = comment.len() as u8;
    stream[cidx + 1..cidx + 1 + comment.len()].copy_from_slice(comment);

    let coff = comment_offset(block_size);
    let noff = name_offset(block_size);
    bytes[coff..coff + COMMENT_FIELD_BYTES].copy_from_slice(&stream[..COMMENT_FIELD_BYTES]);
    bytes[noff..noff + NAME_FIELD_BYTES].copy_from_slice(&stream[COMMENT_FIELD_BYTES..]);
}

fn check_entry_strings(longname: bool, name: &[u8], comment: &[u8]) -> Result<()> {
    let (max_name, budget_ok) = if longname {
        (
            MAX_LONG_NAME_LEN,
            2 + name.len() + comment.len() <= NAC_FIELD_BYTES,
        )
    } else {
        (MAX_NAME_LEN, comment.len() <= MAX_COMMENT_LEN)
    };
    if name.len() > max_name || !budget_ok {
        return Err(AdfError::InternalError {
            detail: format!(
                "entry strings exceed block capacity (name {} bytes, comment {} bytes)",
                name.len(),
                comment.len()
            ),
        });
    }
    Ok(())
}

// ── Boot block ──────────────────────────────────────────────────────────────

/// The boot area: all reserved blocks taken together.
///
/// Carries the dos type, a root block hint and optional boot code. The
/// carry-wrapping checksum is only meaningful for bootable disks, so
/// [`BootBlock::read`] records its state instead of enforcing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootBlock {
    pub dos_type: adf_types::DosType,
    pub root_block: u32,
    pub boot_code: Vec<u8>,
    pub bootable: bool,
}

impl BootBlock {
    #[must_use]
    pub fn new(dos_type: adf_types::DosType, geo: Geometry, boot_code: Vec<u8>) -> Self {
        Self {
            dos_type,
            root_block: geo.root_block_hint().0,
            bootable: !boot_code.is_empty(),
            boot_code,
        }
    }

    /// Decode the boot area (`reserved * block_size` bytes).
    pub fn read(geo: Geometry, bytes: &[u8]) -> Result<Self> {
        let expected = (geo.reserved() * geo.block_size()) as usize;
        if bytes.len() != expected {
            return Err(AdfError::InternalError {
                detail: format!(
                    "boot area is {} bytes, expected {expected}",
                    bytes.len()
                ),
            });
        }
        let dos_type = adf_types::DosType(get_long(bytes, 0));
        if !dos_type.is_valid() {
            return Err(AdfError::InvalidBootBlock {
                block: 0,
                detail: format!("bad dos type tag {:#010x}", dos_type.0),
            });
        }
        let root_block = get_long(bytes, 2);
        let bootable = crate::verify_boot_checksum(bytes);
        let mut boot_code = bytes[12..].to_vec();
        while boot_code.last() == Some(&0) {
            boot_code.pop();
        }
        Ok(Self {
            dos_type,
            root_block,
            boot_code,
            bootable,
        })
    }

    /// Encode the full boot area. The checksum is stamped only when
    /// boot code is present; non-bootable volumes leave it zero.
    pub fn to_bytes(&self, geo: Geometry) -> Result<Vec<u8>> {
        let size = (geo.reserved() * geo.block_size()) as usize;
        if 12 + self.boot_code.len() > size {
            return Err(AdfError::InvalidBootBlock {
                block: 0,
                detail: format!(
                    "boot code of {} bytes exceeds the {size}-byte boot area",
                    self.boot_code.len()
                ),
            });
        }
        let mut bytes = vec![0_u8; size];
        put_long(&mut bytes, 0, self.dos_type.0);
        put_long(&mut bytes, 2, self.root_block);
        bytes[12..12 + self.boot_code.len()].copy_from_slice(&self.boot_code);
        if !self.boot_code.is_empty() {
            crate::stamp_boot_checksum(&mut bytes);
        }
        Ok(bytes)
    }
}

// ── Root block ──────────────────────────────────────────────────────────────

/// The root block: a directory block that also anchors the bitmap and
/// the volume name/timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootBlock {
    /// Stored hash-table size. Read, not assumed; see
    /// [`RootBlock::effective_hash_size`].
    pub hash_size: u32,
    pub hash_table: Vec<u32>,
    pub bm_flag: u32,
    pub bm_pages: Vec<BlockNum>,
    pub bm_ext: u32,
    /// Last root directory modification.
    pub mod_ts: TimeStamp,
    pub name: Vec<u8>,
    /// Last volume modification.
    pub disk_ts: TimeStamp,
    /// Volume creation time.
    pub create_ts: TimeStamp,
    /// First directory cache block in dircache mode, 0 otherwise.
    pub extension: u32,
}

impl RootBlock {
    /// A fresh root with an empty hash table and a valid (but not yet
    /// attached) bitmap.
    #[must_use]
    pub fn new(geo: Geometry, name: Vec<u8>, now: TimeStamp) -> Self {
        Self {
            hash_size: geo.hash_table_size(),
            hash_table: vec![0; geo.hash_table_size() as usize],
            bm_flag: BITMAP_VALID,
            bm_pages: Vec::new(),
            bm_ext: 0,
            mod_ts: now,
            name,
            disk_ts: now,
            create_ts: now,
            extension: 0,
        }
    }

    pub fn read(geo: Geometry, block: BlockNum, bytes: &[u8]) -> Result<Self> {
        check_len(geo, bytes)?;
        let invalid = |detail: String| AdfError::InvalidRootBlock {
            block: block.0,
            detail,
        };
        if get_long(bytes, 0) != T_HEADER {
            return Err(invalid(format!("type tag is {}", get_long(bytes, 0))));
        }
        if sec_type_of(bytes) != ST_ROOT {
            return Err(invalid(format!("sec_type is {}", sec_type_of(bytes))));
        }
        if !verify_header_checksum(bytes) {
            return Err(invalid("checksum mismatch".to_owned()));
        }

        let capacity = geo.hash_table_size() as usize;
        let hash_table = (0..capacity)
            .map(|i| get_long(bytes, OFF_TABLE + i))
            .collect();

        let mut bm_pages = Vec::new();
        for i in 0..ROOT_BITMAP_PAGES {
            let page = get_long_end(bytes, END_BM_FIRST_PAGE - i);
            if page == 0 {
                break;
            }
            bm_pages.push(BlockNum(page));
        }

        let bs = geo.block_size() as usize;
        Ok(Self {
            hash_size: get_long(bytes, OFF_HT_SIZE),
            hash_table,
            bm_flag: get_long_end(bytes, END_BM_FLAG),
            bm_pages,
            bm_ext: get_long_end(bytes, END_BM_EXT),
            mod_ts: get_timestamp_end(bytes, END_MOD_DAYS),
            name: read_bstr(bytes, name_offset(bs), MAX_NAME_LEN),
            disk_ts: get_timestamp_end(bytes, END_DISK_DAYS),
            create_ts: get_timestamp_end(bytes, END_CREATE_DAYS),
            extension: get_long_end(bytes, END_EXTENSION),
        })
    }

    pub fn to_bytes(&self, geo: Geometry) -> Result<Vec<u8>> {
        let capacity = geo.hash_table_size() as usize;
        if self.hash_table.len() != capacity {
            return Err(AdfError::InternalError {
                detail: format!(
                    "root hash table has {} slots, geometry needs {capacity}",
                    self.hash_table.len()
                ),
            });
        }
        if self.bm_pages.len() > ROOT_BITMAP_PAGES {
            return Err(AdfError::InternalError {
                detail: format!("{} bitmap pages exceed the inline table", self.bm_pages.len()),
            });
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(AdfError::InternalError {
                detail: format!("volume name of {} bytes exceeds 30", self.name.len()),
            });
        }

        let bs = geo.block_size() as usize;
        let mut bytes = vec![0_u8; bs];
        put_long(&mut bytes, 0, T_HEADER);
        put_long(&mut bytes, OFF_HT_SIZE, self.hash_size);
        for (i, slot) in self.hash_table.iter().enumerate() {
            put_long(&mut bytes, OFF_TABLE + i, *slot);
        }
        put_long_end(&mut bytes, END_BM_FLAG, self.bm_flag);
        for (i, page) in self.bm_pages.iter().enumerate() {
            put_long_end(&mut bytes, END_BM_FIRST_PAGE - i, page.0);
        }
        put_long_end(&mut bytes, END_BM_EXT, self.bm_ext);
        put_timestamp_end(&mut bytes, END_MOD_DAYS, self.mod_ts);
        write_bstr(&mut bytes, name_offset(bs), self.name.len()).copy_from_slice(&self.name);
        put_timestamp_end(&mut bytes, END_DISK_DAYS, self.disk_ts);
        put_timestamp_end(&mut bytes, END_CREATE_DAYS, self.create_ts);
        put_long_end(&mut bytes, END_EXTENSION, self.extension);
        put_long_end(&mut bytes, END_SEC_TYPE, ST_ROOT as u32);
        stamp_header_checksum(&mut bytes);
        Ok(bytes)
    }

    /// The hash-table size directory code must use: the stored field
    /// when present, the geometric value otherwise. Callers warn when
    /// the stored value disagrees with `geo.hash_table_size()` but
    /// trust it regardless; volumes with non-standard sizes exist.
    #[must_use]
    pub fn effective_hash_size(&self, geo: Geometry) -> u32 {
        if self.hash_size == 0 {
            geo.hash_table_size()
        } else {
            self.hash_size
        }
    }

    #[must_use]
    pub fn bitmap_valid(&self) -> bool {
        self.bm_flag == BITMAP_VALID
    }
}

// ── User directory block ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDirBlock {
    pub own_key: BlockNum,
    /// Stored hash-table size; zero on standard volumes.
    pub hash_size: u32,
    pub hash_table: Vec<u32>,
    pub protect: Protection,
    pub comment: Vec<u8>,
    pub mod_ts: TimeStamp,
    pub name: Vec<u8>,
    pub hash_chain: u32,
    pub parent: u32,
    /// First directory cache block in dircache mode.
    pub extension: u32,
}

impl UserDirBlock {
    #[must_use]
    pub fn new(
        geo: Geometry,
        own_key: BlockNum,
        parent: BlockNum,
        name: Vec<u8>,
        protect: Protection,
        comment: Vec<u8>,
        now: TimeStamp,
    ) -> Self {
        Self {
            own_key,
            hash_size: 0,
            hash_table: vec![0; geo.hash_table_size() as usize],
            protect,
            comment,
            mod_ts: now,
            name,
            hash_chain: 0,
            parent: parent.0,
            extension: 0,
        }
    }

    pub fn read(geo: Geometry, longname: bool, block: BlockNum, bytes: &[u8]) -> Result<Self> {
        check_len(geo, bytes)?;
        let invalid = |detail: String| AdfError::InvalidUserDirBlock {
            block: block.0,
            detail,
        };
        if get_long(bytes, 0) != T_HEADER {
            return Err(invalid(format!("type tag is {}", get_long(bytes, 0))));
        }
        if sec_type_of(bytes) != ST_USERDIR {
            return Err(invalid(format!("sec_type is {}", sec_type_of(bytes))));
        }
        if !verify_header_checksum(bytes) {
            return Err(invalid("checksum mismatch".to_owned()));
        }
        let own_key = get_long(bytes, OFF_HEADER_KEY);
        if own_key != block.0 {
            return Err(invalid(format!("own_key {own_key} is not the block number")));
        }

        let capacity = geo.hash_table_size() as usize;
        let hash_table = (0..capacity)
            .map(|i| get_long(bytes, OFF_TABLE + i))
            .collect();
        let bs = geo.block_size() as usize;
        let (name, comment) = if longname {
            read_nac(bytes, bs)
        } else {
            read_name_comment(bytes, bs)
        };

        Ok(Self {
            own_key: BlockNum(own_key),
            hash_size: get_long(bytes, OFF_HT_SIZE),
            hash_table,
            protect: Protection(get_long_end(bytes, END_PROTECT)),
            comment,
            mod_ts: get_timestamp_end(bytes, END_MOD_DAYS),
            name,
            hash_chain: get_long_end(bytes, END_HASH_CHAIN),
            parent: get_long_end(bytes, END_PARENT),
            extension: get_long_end(bytes, END_EXTENSION),
        })
    }

    pub fn to_bytes(&self, geo: Geometry, longname: bool) -> Result<Vec<u8>> {
        let capacity = geo.hash_table_size() as usize;
        if self.hash_table.len() != capacity {
            return Err(AdfError::InternalError {
                detail: format!(
                    "dir hash table has {} slots, geometry needs {capacity}",
                    self.hash_table.len()
                ),
            });
        }
        check_entry_strings(longname, &self.name, &self.comment)?;

        let bs = geo.block_size() as usize;
        let mut bytes = vec![0_u8; bs];
        put_long(&mut bytes, 0, T_HEADER);
        put_long(&mut bytes, OFF_HEADER_KEY, self.own_key.0);
        put_long(&mut bytes, OFF_HT_SIZE, self.hash_size);
        for (i, slot) in self.hash_table.iter().enumerate() {
            put_long(&mut bytes, OFF_TABLE + i, *slot);
        }
        put_long_end(&mut bytes, END_PROTECT, self.protect.0);
        put_timestamp_end(&mut bytes, END_MOD_DAYS, self.mod_ts);
        if longname {
            write_nac(&mut bytes, bs, &self.name, &self.comment);
        } else {
            write_name_comment(&mut bytes, bs, &self.name, &self.comment);
        }
        put_long_end(&mut bytes, END_HASH_CHAIN, self.hash_chain);
        put_long_end(&mut bytes, END_PARENT, self.parent);
        put_long_end(&mut bytes, END_EXTENSION, self.extension);
        put_long_end(&mut bytes, END_SEC_TYPE, ST_USERDIR as u32);
        stamp_header_checksum(&mut bytes);
        Ok(bytes)
    }

    /// See [`RootBlock::effective_hash_size`].
    #[must_use]
    pub fn effective_hash_size(&self, geo: Geometry) -> u32 {
        if self.hash_size == 0 {
            geo.hash_table_size()
        } else {
            self.hash_size
        }
    }
}

// ── File header block ───────────────────────────────────────────────────────

/// File header: entry metadata plus the inline data-pointer table.
///
/// `data_blocks` is kept in logical (read) order; on disk the table is
/// filled backwards, the last slot holding the first data block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeaderBlock {
    pub own_key: BlockNum,
    pub data_blocks: Vec<u32>,
    pub protect: Protection,
    pub byte_size: u32,
    pub comment: Vec<u8>,
    pub mod_ts: TimeStamp,
    pub name: Vec<u8>,
    pub hash_chain: u32,
    pub parent: u32,
    /// First file list block, 0 when the inline table suffices.
    pub extension: u32,
}

impl FileHeaderBlock {
    pub fn read(geo: Geometry, longname: bool, block: BlockNum, bytes: &[u8]) -> Result<Self> {
        check_len(geo, bytes)?;
        let invalid = |detail: String| AdfError::InvalidFileHeaderBlock {
            block: block.0,
            detail,
        };
        if get_long(bytes, 0) != T_HEADER {
            return Err(invalid(format!("type tag is {}", get_long(bytes, 0))));
        }
        if sec_type_of(bytes) != ST_FILE {
            return Err(invalid(format!("sec_type is {}", sec_type_of(bytes))));
        }
        if !verify_header_checksum(bytes) {
            return Err(invalid("checksum mismatch".to_owned()));
        }
        let own_key = get_long(bytes, OFF_HEADER_KEY);
        if own_key != block.0 {
            return Err(invalid(format!("own_key {own_key} is not the block number")));
        }

        let capacity = geo.hash_table_size() as usize;
        let count = get_long(bytes, OFF_HIGH_SEQ) as usize;
        if count > capacity {
            return Err(invalid(format!(
                "high_seq {count} exceeds the {capacity}-slot pointer table"
            )));
        }
        let mut data_blocks = Vec::with_capacity(count);
        for i in 0..count {
            let ptr = get_long(bytes, OFF_TABLE + capacity - 1 - i);
            if ptr == 0 {
                return Err(invalid(format!("zero data pointer at index {i}")));
            }
            data_blocks.push(ptr);
        }

        let bs = geo.block_size() as usize;
        let (name, comment) = if longname {
            read_nac(bytes, bs)
        } else {
            read_name_comment(bytes, bs)
        };

        Ok(Self {
            own_key: BlockNum(own_key),
            data_blocks,
            protect: Protection(get_long_end(bytes, END_PROTECT)),
            byte_size: get_long_end(bytes, END_BYTE_SIZE),
            comment,
            mod_ts: get_timestamp_end(bytes, END_MOD_DAYS),
            name,
            hash_chain: get_long_end(bytes, END_HASH_CHAIN),
            parent: get_long_end(bytes, END_PARENT),
            extension: get_long_end(bytes, END_EXTENSION),
        })
    }

    pub fn to_bytes(&self, geo: Geometry, longname: bool) -> Result<Vec<u8>> {
        let capacity = geo.hash_table_size() as usize;
        if self.data_blocks.len() > capacity {
            return Err(AdfError::InternalError {
                detail: format!(
                    "{} inline data pointers exceed the {capacity}-slot table",
                    self.data_blocks.len()
                ),
            });
        }
        check_entry_strings(longname, &self.name, &self.comment)?;

        let bs = geo.block_size() as usize;
        let mut bytes = vec![0_u8; bs];
        put_long(&mut bytes, 0, T_HEADER);
        put_long(&mut bytes, OFF_HEADER_KEY, self.own_key.0);
        put_long(&mut bytes, OFF_HIGH_SEQ, self.data_blocks.len() as u32);
        put_long(
            &mut bytes,
            OFF_FIRST_DATA,
            self.data_blocks.first().copied().unwrap_or(0),
        );
        for (i, ptr) in self.data_blocks.iter().enumerate() {
            put_long(&mut bytes, OFF_TABLE + capacity - 1 - i, *ptr);
        }
        put_long_end(&mut bytes, END_PROTECT, self.protect.0);
        put_long_end(&mut bytes, END_BYTE_SIZE, self.byte_size);
        put_timestamp_end(&mut bytes, END_MOD_DAYS, self.mod_ts);
        if longname {
            write_nac(&mut bytes, bs, &self.name, &self.comment);
        } else {
            write_name_comment(&mut bytes, bs, &self.name, &self.comment);
        }
        put_long_end(&mut bytes, END_HASH_CHAIN, self.hash_chain);
        put_long_end(&mut bytes, END_PARENT, self.parent);
        put_long_end(&mut bytes, END_EXTENSION, self.extension);
        put_long_end(&mut bytes, END_SEC_TYPE, ST_FILE as u32);
        stamp_header_checksum(&mut bytes);
        Ok(bytes)
    }
}

// ── File list block ─────────────────────────────────────────────────────────

/// Continuation of a file's data-pointer table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileListBlock {
    pub own_key: BlockNum,
    pub data_blocks: Vec<u32>,
    /// The owning file header block.
    pub parent: u32,
    /// Next file list block, 0 at the end of the chain.
    pub extension: u32,
}

impl FileListBlock {
    pub fn read(geo: Geometry, block: BlockNum, bytes: &[u8]) -> Result<Self> {
        check_len(geo, bytes)?;
        let invalid = |detail: String| AdfError::InvalidFileListBlock {
            block: block.0,
            detail,
        };
        if get_long(bytes, 0) != T_LIST {
            return Err(invalid(format!("type tag is {}", get_long(bytes, 0))));
        }
        if sec_type_of(bytes) != ST_FILE {
            return Err(invalid(format!("sec_type is {}", sec_type_of(bytes))));
        }
        if !verify_header_checksum(bytes) {
            return Err(invalid("checksum mismatch".to_owned()));
        }
        let own_key = get_long(bytes, OFF_HEADER_KEY);
        if own_key != block.0 {
            return Err(invalid(format!("own_key {own_key} is not the block number")));
        }

        let capacity = geo.hash_table_size() as usize;
        let count = get_long(bytes, OFF_HIGH_SEQ) as usize;
        if count > capacity {
            return Err(invalid(format!(
                "high_seq {count} exceeds the {capacity}-slot pointer table"
            )));
        }
        let mut data_blocks = Vec::with_capacity(count);
        for i in 0..count {
            let ptr = get_long(bytes, OFF_TABLE + capacity - 1 - i);
            if ptr == 0 {
                return Err(invalid(format!("zero data pointer at index {i}")));
            }
            data_blocks.push(ptr);
        }

        Ok(Self {
            own_key: BlockNum(own_key),
            data_blocks,
            parent: get_long_end(bytes, END_PARENT),
            extension: get_long_end(bytes, END_EXTENSION),
        })
    }

    pub fn to_bytes(&self, geo: Geometry) -> Result<Vec<u8>> {
        let capacity = geo.hash_table_size() as usize;
        if self.data_blocks.len() > capacity {
            return Err(AdfError::InternalError {
                detail: format!(
                    "{} data pointers exceed the {capacity}-slot table",
                    self.data_blocks.len()
                ),
            });
        }
        let mut bytes = vec![0_u8; geo.block_size() as usize];
        put_long(&mut bytes, 0, T_LIST);
        put_long(&mut bytes, OFF_HEADER_KEY, self.own_key.0);
        put_long(&mut bytes, OFF_HIGH_SEQ, self.data_blocks.len() as u32);
        put_long(
            &mut bytes,
            OFF_FIRST_DATA,
            self.data_blocks.first().copied().unwrap_or(0),
        );
        for (i, ptr) in self.data_blocks.iter().enumerate() {
            put_long(&mut bytes, OFF_TABLE + capacity - 1 - i, *ptr);
        }
        put_long_end(&mut bytes, END_PARENT, self.parent);
        put_long_end(&mut bytes, END_EXTENSION, self.extension);
        put_long_end(&mut bytes, END_SEC_TYPE, ST_FILE as u32);
        stamp_header_checksum(&mut bytes);
        Ok(bytes)
    }
}

// ── OFS file data block ─────────────────────────────────────────────────────

/// OFS data block: 24-byte header plus payload. FFS stores raw payload
/// with no per-block structure, so it has no typed view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDataBlock {
    /// The owning file header block.
    pub hdr_key: u32,
    /// 1-based position within the file.
    pub seq_num: u32,
    pub next_data: u32,
    pub data: Vec<u8>,
}

impl FileDataBlock {
    pub fn read(geo: Geometry, block: BlockNum, bytes: &[u8]) -> Result<Self> {
        check_len(geo, bytes)?;
        let invalid = |detail: String| AdfError::InvalidFileDataBlock {
            block: block.0,
            detail,
        };
        if get_long(bytes, 0) != T_DATA {
            return Err(invalid(format!("type tag is {}", get_long(bytes, 0))));
        }
        if !verify_header_checksum(bytes) {
            return Err(invalid("checksum mismatch".to_owned()));
        }
        let data_size = get_long(bytes, OFF_HT_SIZE);
        if data_size > geo.ofs_data_bytes() {
            return Err(invalid(format!(
                "data_size {data_size} exceeds the {}-byte payload area",
                geo.ofs_data_bytes()
            )));
        }
        Ok(Self {
            hdr_key: get_long(bytes, OFF_HEADER_KEY),
            seq_num: get_long(bytes, OFF_HIGH_SEQ),
            next_data: get_long(bytes, OFF_FIRST_DATA),
            data: bytes[24..24 + data_size as usize].to_vec(),
        })
    }

    pub fn to_bytes(&self, geo: Geometry) -> Result<Vec<u8>> {
        if self.data.len() > geo.ofs_data_bytes() as usize {
            return Err(AdfError::InternalError {
                detail: format!(
                    "{} payload bytes exceed the {}-byte data area",
                    self.data.len(),
                    geo.ofs_data_bytes()
                ),
            });
        }
        let mut bytes = vec![0_u8; geo.block_size() as usize];
        put_long(&mut bytes, 0, T_DATA);
        put_long(&mut bytes, OFF_HEADER_KEY, self.hdr_key);
        put_long(&mut bytes, OFF_HIGH_SEQ, self.seq_num);
        put_long(&mut bytes, OFF_HT_SIZE, self.data.len() as u32);
        put_long(&mut bytes, OFF_FIRST_DATA, self.next_data);
        bytes[24..24 + self.data.len()].copy_from_slice(&self.data);
        stamp_header_checksum(&mut bytes);
        Ok(bytes)
    }
}

// ── Bitmap blocks ───────────────────────────────────────────────────────────

/// One bitmap block: checksum long followed by free-state words.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitmapBlock {
    pub words: Vec<u32>,
}

impl BitmapBlock {
    pub fn read(geo: Geometry, block: BlockNum, bytes: &[u8]) -> Result<Self> {
        check_len(geo, bytes)?;
        if !crate::verify_bitmap_checksum(bytes) {
            return Err(AdfError::InvalidBitmapBlock {
                block: block.0,
                detail: "checksum mismatch".to_owned(),
            });
        }
        let words = (1..geo.block_longs() as usize)
            .map(|i| get_long(bytes, i))
            .collect();
        Ok(Self { words })
    }

    pub fn to_bytes(&self, geo: Geometry) -> Result<Vec<u8>> {
        let capacity = geo.block_longs() as usize - 1;
        if self.words.len() != capacity {
            return Err(AdfError::InternalError {
                detail: format!(
                    "bitmap block holds {} words, geometry needs {capacity}",
                    self.words.len()
                ),
            });
        }
        let mut bytes = vec![0_u8; geo.block_size() as usize];
        for (i, word) in self.words.iter().enumerate() {
            put_long(&mut bytes, 1 + i, *word);
        }
        crate::stamp_bitmap_checksum(&mut bytes);
        Ok(bytes)
    }
}

/// Bitmap extension block: untagged, unchecksummed pointer block with
/// the next-extension pointer in its last long.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitmapExtBlock {
    pub pages: Vec<BlockNum>,
    pub next: u32,
}

impl BitmapExtBlock {
    pub fn read(geo: Geometry, bytes: &[u8]) -> Result<Self> {
        check_len(geo, bytes)?;
        let slots = geo.block_longs() as usize - 1;
        let mut pages = Vec::new();
        for i in 0..slots {
            let page = get_long(bytes, i);
            if page == 0 {
                break;
            }
            pages.push(BlockNum(page));
        }
        Ok(Self {
            pages,
            next: get_long_end(bytes, 1),
        })
    }

    pub fn to_bytes(&self, geo: Geometry) -> Result<Vec<u8>> {
        let slots = geo.block_longs() as usize - 1;
        if self.pages.len() > slots {
            return Err(AdfError::InternalError {
                detail: format!("{} bitmap pages exceed the {slots}-slot table", self.pages.len()),
            });
        }
        let mut bytes = vec![0_u8; geo.block_size() as usize];
        for (i, page) in self.pages.iter().enumerate() {
            put_long(&mut bytes, i, page.0);
        }
        put_long_end(&mut bytes, 1, self.next);
        Ok(bytes)
    }
}

// ── Directory cache block ───────────────────────────────────────────────────

/// Pre-rendered listing record inside a dir cache block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirCacheRecord {
    pub entry: u32,
    pub size: u32,
    pub protect: u32,
    pub mod_ts: TimeStamp,
    pub sec_type: i8,
    pub name: Vec<u8>,
    pub comment: Vec<u8>,
}

/// Dir cache block. Decoded and classified (the validator walks cache
/// chains); the node tree neither consults nor maintains the cache.
///
/// Decode errors are detail strings: cache corruption is a validator
/// finding, never a hard failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirCacheBlock {
    pub own_key: BlockNum,
    pub parent: u32,
    pub next: u32,
    pub records: Vec<DirCacheRecord>,
}

impl DirCacheBlock {
    pub fn read(geo: Geometry, block: BlockNum, bytes: &[u8]) -> std::result::Result<Self, String> {
        if bytes.len() != geo.block_size() as usize {
            return Err(format!("buffer is {} bytes", bytes.len()));
        }
        if get_long(bytes, 0) != T_DIRCACHE {
            return Err(format!("type tag is {}", get_long(bytes, 0)));
        }
        if !verify_header_checksum(bytes) {
            return Err("checksum mismatch".to_owned());
        }
        let own_key = get_long(bytes, OFF_HEADER_KEY);
        if own_key != block.0 {
            return Err(format!("own_key {own_key} is not the block number"));
        }
        let num_records = get_long(bytes, OFF_HT_SIZE) as usize;
        if num_records > (bytes.len() - 24) / 25 {
            return Err(format!("record count {num_records} cannot fit the block"));
        }
        let parent = get_long(bytes, OFF_HIGH_SEQ);
        let next = get_long(bytes, OFF_FIRST_DATA);

        // Records are even-aligned, not long-aligned.
        let be32 = |off: usize| {
            u32::from_be_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
        };

        let mut records = Vec::with_capacity(num_records);
        let mut off = 24_usize;
        for idx in 0..num_records {
            // Fixed part: entry, size, protect, uid/gid, date words, type.
            if off + 25 > bytes.len() {
                return Err(format!("record {idx} overruns the block"));
            }
            let entry = be32(off);
            let size = be32(off + 4);
            let protect = be32(off + 8);
            let days = u16::from_be_bytes([bytes[off + 16], bytes[off + 17]]);
            let mins = u16::from_be_bytes([bytes[off + 18], bytes[off + 19]]);
            let ticks = u16::from_be_bytes([bytes[off + 20], bytes[off + 21]]);
            let sec_type = bytes[off + 22] as i8;
            let name_len = usize::from(bytes[off + 23]);
            let name_start = off + 24;
            if name_start + name_len + 1 > bytes.len() {
                return Err(format!("record {idx} name overruns the block"));
            }
            let name = bytes[name_start..name_start + name_len].to_vec();
            let comment_len = usize::from(bytes[name_start + name_len]);
            let comment_start = name_start + name_len + 1;
            if comment_start + comment_len > bytes.len() {
                return Err(format!("record {idx} comment overruns the block"));
            }
            let comment = bytes[comment_start..comment_start + comment_len].to_vec();

            records.push(DirCacheRecord {
                entry,
                size,
                protect,
                mod_ts: TimeStamp::new(u32::from(days), u32::from(mins), u32::from(ticks)),
                sec_type,
                name,
                comment,
            });

            let mut rec_len = 25 + name_len + comment_len;
            if rec_len % 2 != 0 {
                rec_len += 1;
            }
            off += rec_len;
        }

        Ok(Self {
            own_key: BlockNum(own_key),
            parent,
            next,
            records,
        })
    }
}

// ── Comment block (long-filename volumes) ───────────────────────────────────

/// Overflow comment storage for long-filename entries. Validator-only;
/// the node tree keeps comments inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentBlock {
    pub own_key: BlockNum,
    /// The entry block this comment belongs to.
    pub header_key: u32,
    pub comment: Vec<u8>,
}

impl CommentBlock {
    pub fn read(geo: Geometry, block: BlockNum, bytes: &[u8]) -> std::result::Result<Self, String> {
        if bytes.len() != geo.block_size() as usize {
            return Err(format!("buffer is {} bytes", bytes.len()));
        }
        if get_long(bytes, 0) != T_COMMENT {
            return Err(format!("type tag is {}", get_long(bytes, 0)));
        }
        if !verify_header_checksum(bytes) {
            return Err("checksum mismatch".to_owned());
        }
        let own_key = get_long(bytes, OFF_HEADER_KEY);
        if own_key != block.0 {
            return Err(format!("own_key {own_key} is not the block number"));
        }
        Ok(Self {
            own_key: BlockNum(own_key),
            header_key: get_long(bytes, OFF_HIGH_SEQ),
            comment: read_bstr(bytes, 24, MAX_COMMENT_LEN),
        })
    }
}

// ── Classification ──────────────────────────────────────────────────────────

/// Structural kind derived from a block's type/sub-type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockKind {
    Root,
    UserDir,
    FileHeader,
    FileList,
    FileData,
    DirCache,
    Comment,
    /// A header-typed block with a link sub-type (soft/hard links).
    Link,
    /// No recognizable structural tags.
    NotStructural,
}

/// Tolerantly extracted tags and link fields of one block.
///
/// Never fails: garbage input classifies as [`BlockKind::NotStructural`]
/// and every field is a best-effort read. The validator's first phase
/// is built on this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTags {
    pub kind: BlockKind,
    pub checksum_ok: bool,
    pub block_type: u32,
    pub sec_type: i32,
    pub own_key: u32,
    pub parent: u32,
    pub hash_chain: u32,
    pub extension: u32,
    pub byte_size: u32,
    pub high_seq: u32,
    /// Stored hash-table size (root blocks; zero elsewhere).
    pub ht_size: u32,
    pub name: Vec<u8>,
}

/// Classify a raw block by its tags, without trusting any of them.
#[must_use]
pub fn classify(geo: Geometry, longname: bool, bytes: &[u8]) -> RawTags {
    if bytes.len() != geo.block_size() as usize || bytes.len() < 24 {
        return RawTags {
            kind: BlockKind::NotStructural,
            checksum_ok: false,
            block_type: 0,
            sec_type: 0,
            own_key: 0,
            parent: 0,
            hash_chain: 0,
            extension: 0,
            byte_size: 0,
            high_seq: 0,
            ht_size: 0,
            name: Vec::new(),
        };
    }

    let block_type = get_long(bytes, 0);
    let sec_type = sec_type_of(bytes);
    let kind = match (block_type, sec_type) {
        (T_HEADER, ST_ROOT) => BlockKind::Root,
        (T_HEADER, ST_USERDIR) => BlockKind::UserDir,
        (T_HEADER, ST_FILE) => BlockKind::FileHeader,
        (T_HEADER, s) if s == crate::ST_SOFTLINK || s == crate::ST_LINKDIR || s == crate::ST_LINKFILE => {
            BlockKind::Link
        }
        (T_LIST, ST_FILE) => BlockKind::FileList,
        (T_DATA, _) => BlockKind::FileData,
        (T_DIRCACHE, _) => BlockKind::DirCache,
        (T_COMMENT, _) => BlockKind::Comment,
        _ => BlockKind::NotStructural,
    };

    let bs = bytes.len();
    let name = match kind {
        BlockKind::UserDir | BlockKind::FileHeader => {
            if longname {
                read_nac(bytes, bs).0
            } else {
                read_bstr(bytes, name_offset(bs), MAX_NAME_LEN)
            }
        }
        BlockKind::Root => read_bstr(bytes, name_offset(bs), MAX_NAME_LEN),
        _ => Vec::new(),
    };

    RawTags {
        kind,
        checksum_ok: verify_header_checksum(bytes),
        block_type,
        sec_type,
        own_key: get_long(bytes, OFF_HEADER_KEY),
        parent: get_long_end(bytes, END_PARENT),
        hash_chain: get_long_end(bytes, END_HASH_CHAIN),
        extension: get_long_end(bytes, END_EXTENSION),
        byte_size: get_long_end(bytes, END_BYTE_SIZE),
        high_seq: get_long(bytes, OFF_HIGH_SEQ),
        ht_size: get_long(bytes, OFF_HT_SIZE),
        name,
    }
}
