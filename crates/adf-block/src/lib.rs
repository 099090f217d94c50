#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the [`BlockDevice`] trait consumed by every higher layer,
//! an in-memory device for tests, volume creation and validator
//! suites, and a file-backed device for raw disk images.
//!
//! Devices are addressed in whole blocks only. Out-of-range reads,
//! wrong-length writes and writes to a read-only device each surface
//! as their own [`AdfError`] kind rather than being masked.

use adf_error::{AdfError, Result};
use adf_types::{BlockNum, Geometry};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Block-addressed I/O interface.
///
/// Implementations are `Send + Sync` with `&self` I/O methods; the
/// engine itself is single-threaded, so interior mutability is only
/// needed to keep the trait object shareable.
pub trait BlockDevice: Send + Sync {
    /// Device geometry; fixed for the lifetime of the device.
    fn geometry(&self) -> Geometry;

    /// Read one block. `block` may address the reserved boot area.
    fn read_block(&self, block: BlockNum) -> Result<Vec<u8>>;

    /// Write one block. `data.len()` must equal the block size.
    fn write_block(&self, block: BlockNum, data: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_range(geo: Geometry, block: BlockNum) -> Result<()> {
    if block.0 >= geo.num_blocks() {
        return Err(AdfError::BlockOutOfRange {
            block: block.0,
            num_blocks: geo.num_blocks(),
        });
    }
    Ok(())
}

fn check_write_len(geo: Geometry, data: &[u8]) -> Result<()> {
    let expected = geo.block_size() as usize;
    if data.len() != expected {
        return Err(AdfError::WriteSizeMismatch {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// In-memory block device.
///
/// Blocks start zero-filled. Used by tests, by `Volume::create` flows
/// that build images from scratch, and by the validator end-to-end
/// suites.
#[derive(Debug)]
pub struct MemBlockDevice {
    geo: Geometry,
    blocks: RwLock<Vec<Vec<u8>>>,
    read_only: bool,
}

impl MemBlockDevice {
    #[must_use]
    pub fn new(geo: Geometry) -> Self {
        let bs = geo.block_size() as usize;
        let blocks = (0..geo.num_blocks()).map(|_| vec![0_u8; bs]).collect();
        Self {
            geo,
            blocks: RwLock::new(blocks),
            read_only: false,
        }
    }

    /// Flip the device read-only; subsequent writes fail with
    /// [`AdfError::ReadOnlyDevice`].
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Byte-level corruption helper for integrity tests.
    pub fn patch(&self, block: BlockNum, offset: usize, bytes: &[u8]) -> Result<()> {
        check_range(self.geo, block)?;
        let mut guard = self.blocks.write();
        let buf = &mut guard[block.0 as usize];
        let end = offset
            .checked_add(bytes.len())
            .filter(|&end| end <= buf.len())
            .ok_or(AdfError::WriteSizeMismatch {
                expected: buf.len(),
                actual: offset.saturating_add(bytes.len()),
            })?;
        buf[offset..end].copy_from_slice(bytes);
        Ok(())
    }
}

impl BlockDevice for MemBlockDevice {
    fn geometry(&self) -> Geometry {
        self.geo
    }

    fn read_block(&self, block: BlockNum) -> Result<Vec<u8>> {
        check_range(self.geo, block)?;
        Ok(self.blocks.read()[block.0 as usize].clone())
    }

    fn write_block(&self, block: BlockNum, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(AdfError::ReadOnlyDevice);
        }
        check_range(self.geo, block)?;
        check_write_len(self.geo, data)?;
        self.blocks.write()[block.0 as usize].copy_from_slice(data);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// File-backed block device over a raw disk image.
///
/// Container formats (ADF/HDF wrappers, gzip) are out of scope: a raw
/// image where byte offset `block * block_size` is block `block` is the
/// baseline contract. Uses `pread`/`pwrite`-style positioned I/O, so no
/// shared seek cursor is involved.
#[derive(Debug, Clone)]
pub struct FileBlockDevice {
    file: Arc<File>,
    geo: Geometry,
    writable: bool,
}

impl FileBlockDevice {
    /// Open an image, preferring read-write and falling back to
    /// read-only.
    pub fn open(path: impl AsRef<Path>, block_size: u32, reserved: u32) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;

        let len = file.metadata()?.len();
        let bs = u64::from(block_size);
        if bs == 0 || len % bs != 0 {
            return Err(AdfError::InternalError {
                detail: format!("image length {len} is not a multiple of block size {block_size}"),
            });
        }
        let num_blocks = u32::try_from(len / bs).map_err(|_| AdfError::InternalError {
            detail: format!("image holds more than {} blocks", u32::MAX),
        })?;
        let geo = Geometry::new(block_size, num_blocks, reserved).map_err(|e| {
            AdfError::InternalError {
                detail: format!("image geometry rejected: {e}"),
            }
        })?;
        Ok(Self {
            file: Arc::new(file),
            geo,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl BlockDevice for FileBlockDevice {
    fn geometry(&self) -> Geometry {
        self.geo
    }

    fn read_block(&self, block: BlockNum) -> Result<Vec<u8>> {
        check_range(self.geo, block)?;
        let mut buf = vec![0_u8; self.geo.block_size() as usize];
        let offset = u64::from(block.0) * u64::from(self.geo.block_size());
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    fn write_block(&self, block: BlockNum, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(AdfError::ReadOnlyDevice);
        }
        check_range(self.geo, block)?;
        check_write_len(self.geo, data)?;
        let offset = u64::from(block.0) * u64::from(self.geo.block_size());
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn mem_device_round_trips() {
        let dev = MemBlockDevice::new(Geometry::floppy_dd());
        let data = vec![0x5A_u8; 512];
        dev.write_block(BlockNum(880), &data).unwrap();
        assert_eq!(dev.read_block(BlockNum(880)).unwrap(), data);
        assert_eq!(dev.read_block(BlockNum(879)).unwrap(), vec![0_u8; 512]);
    }

    #[test]
    fn mem_device_rejects_out_of_range() {
        let dev = MemBlockDevice::new(Geometry::floppy_dd());
        let err = dev.read_block(BlockNum(1760)).unwrap_err();
        assert!(matches!(
            err,
            AdfError::BlockOutOfRange {
                block: 1760,
                num_blocks: 1760
            }
        ));
        let err = dev.write_block(BlockNum(2000), &[0_u8; 512]).unwrap_err();
        assert!(matches!(err, AdfError::BlockOutOfRange { .. }));
    }

    #[test]
    fn mem_device_rejects_short_write() {
        let dev = MemBlockDevice::new(Geometry::floppy_dd());
        let err = dev.write_block(BlockNum(3), &[0_u8; 100]).unwrap_err();
        assert!(matches!(
            err,
            AdfError::WriteSizeMismatch {
                expected: 512,
                actual: 100
            }
        ));
    }

    #[test]
    fn mem_device_read_only() {
        let dev = MemBlockDevice::new(Geometry::floppy_dd()).read_only();
        let err = dev.write_block(BlockNum(3), &[0_u8; 512]).unwrap_err();
        assert!(matches!(err, AdfError::ReadOnlyDevice));
        assert!(dev.read_block(BlockNum(3)).is_ok());
    }

    #[test]
    fn mem_device_patch_flips_bytes() {
        let dev = MemBlockDevice::new(Geometry::floppy_dd());
        dev.patch(BlockNum(5), 100, &[0xFF, 0xEE]).unwrap();
        let buf = dev.read_block(BlockNum(5)).unwrap();
        assert_eq!(&buf[100..102], &[0xFF, 0xEE]);
        assert!(dev.patch(BlockNum(5), 511, &[1, 2]).is_err());
    }

    #[test]
    fn file_device_round_trips() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0_u8; 512 * 1760]).unwrap();
        tmp.flush().unwrap();

        let dev = FileBlockDevice::open(tmp.path(), 512, 2).unwrap();
        assert!(dev.is_writable());
        assert_eq!(dev.geometry().num_blocks(), 1760);

        let data = vec![0xA5_u8; 512];
        dev.write_block(BlockNum(880), &data).unwrap();
        dev.sync().unwrap();
        assert_eq!(dev.read_block(BlockNum(880)).unwrap(), data);
    }

    #[test]
    fn file_device_rejects_unaligned_image() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0_u8; 1000]).unwrap();
        tmp.flush().unwrap();
        assert!(FileBlockDevice::open(tmp.path(), 512, 2).is_err());
    }
}
