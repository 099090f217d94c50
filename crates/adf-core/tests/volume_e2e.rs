//! End-to-end volume tests over both device backends.

use adf_block::{BlockDevice, FileBlockDevice, MemBlockDevice};
use adf_core::Volume;
use adf_node::Node;
use adf_types::{DosType, Geometry};
use std::io::Write;
use std::sync::Arc;

#[test]
fn ofs_and_ffs_block_budgets_for_3000_bytes() {
    let payload: Vec<u8> = (0..3000_u32).map(|i| (i % 199) as u8).collect();

    // OFS: ceil(3000 / 488) = 7 chained data blocks.
    let dev = Arc::new(MemBlockDevice::new(Geometry::floppy_dd()));
    let mut vol = Volume::create(dev, "OfsDisk", DosType::OFS, None).unwrap();
    let used_before = vol.get_used_blocks();
    vol.write_file(&payload, "blob").unwrap();
    assert_eq!(vol.get_used_blocks() - used_before, 1 + 7);

    let hdr_block = {
        let node = vol.get_path_name("blob").unwrap().expect("blob resolves");
        assert!(matches!(node, Node::File(_)));
        node.block()
    };
    let file = adf_node::File::read_header(vol.fs(), hdr_block).unwrap();
    assert_eq!(file.data_block_numbers(vol.fs()).unwrap().len(), 7);
    assert_eq!(vol.read_file("blob").unwrap(), payload);

    // FFS: ceil(3000 / 512) = 6 raw blocks.
    let dev = Arc::new(MemBlockDevice::new(Geometry::floppy_dd()));
    let mut vol = Volume::create(dev, "FfsDisk", DosType::FFS, None).unwrap();
    let used_before = vol.get_used_blocks();
    vol.write_file(&payload, "blob").unwrap();
    assert_eq!(vol.get_used_blocks() - used_before, 1 + 6);
    assert_eq!(vol.read_file("blob").unwrap(), payload);
}

#[test]
fn image_file_round_trip() {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(&vec![0_u8; 512 * 1760]).unwrap();
    tmp.flush().unwrap();

    {
        let dev = Arc::new(FileBlockDevice::open(tmp.path(), 512, 2).unwrap());
        let mut vol = Volume::create(dev, "OnDisk", DosType::FFS_INTL, None).unwrap();
        vol.create_dir("c").unwrap();
        vol.write_file(b"echo hello", "c/script").unwrap();
        vol.flush().unwrap();
    }

    // A second, independent mount of the same image.
    let dev = Arc::new(FileBlockDevice::open(tmp.path(), 512, 2).unwrap());
    let mut vol = Volume::open(dev).unwrap();
    assert_eq!(vol.name(), b"OnDisk");
    assert_eq!(vol.dos_type(), DosType::FFS_INTL);
    assert_eq!(vol.read_file("C/SCRIPT").unwrap(), b"echo hello");
}

#[test]
fn deep_tree_survives_flush_and_reread() {
    let dev = Arc::new(MemBlockDevice::new(Geometry::floppy_dd()));
    let mut vol = Volume::create(dev, "Tree", DosType::OFS, None).unwrap();

    vol.create_dir("a").unwrap();
    vol.create_dir("a/b").unwrap();
    vol.create_dir("a/b/c").unwrap();
    for i in 0..10 {
        vol.write_file(format!("file {i}").as_bytes(), &format!("a/b/c/f{i}"))
            .unwrap();
    }

    // Drop all cached entries; everything must re-derive from disk.
    vol.flush().unwrap();
    for i in 0..10 {
        assert_eq!(
            vol.read_file(&format!("a/b/c/f{i}")).unwrap(),
            format!("file {i}").as_bytes()
        );
    }
    assert_eq!(vol.list("a/b/c").unwrap().len(), 10);
}

#[test]
fn volume_fills_up_and_recovers() {
    let dev = Arc::new(MemBlockDevice::new(Geometry::floppy_dd()));
    let mut vol = Volume::create(dev.clone(), "Full", DosType::FFS, None).unwrap();

    // ~850 KiB of payload on an 880 KiB floppy: the second write runs
    // out of space and must leave no trace.
    vol.write_file(&vec![1_u8; 850 * 1024], "big").unwrap();
    let free_after_big = vol.get_free_blocks();
    let err = vol.write_file(&vec![2_u8; 100 * 1024], "too-much");
    assert!(err.is_err());
    assert_eq!(vol.get_free_blocks(), free_after_big);
    assert!(vol.get_path_name("too-much").unwrap().is_none());

    vol.delete("big", false, false).unwrap();
    vol.write_file(&vec![3_u8; 100 * 1024], "fits-now").unwrap();
    assert_eq!(vol.read_file("fits-now").unwrap(), vec![3_u8; 100 * 1024]);

    // The device geometry never changed underneath.
    assert_eq!(dev.geometry().num_blocks(), 1760);
}
