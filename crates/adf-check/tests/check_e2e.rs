//! End-to-end validator runs against real volumes built with the
//! volume layer, then deliberately damaged at the byte level.

use adf_block::{BlockDevice, MemBlockDevice};
use adf_check::{CheckLevel, Checker};
use adf_core::Volume;
use adf_ondisk::{put_long, put_long_end, stamp_header_checksum};
use adf_types::{BlockNum, DosType, Geometry};
use std::sync::Arc;

fn fresh_volume(dos_type: DosType) -> (Arc<MemBlockDevice>, Volume) {
    let dev = Arc::new(MemBlockDevice::new(Geometry::floppy_dd()));
    let vol = Volume::create(dev.clone(), "Scratch", dos_type, None).unwrap();
    (dev, vol)
}

fn rewrite(dev: &MemBlockDevice, block: BlockNum, patch: impl FnOnce(&mut Vec<u8>)) {
    let mut bytes = dev.read_block(block).unwrap();
    patch(&mut bytes);
    dev.write_block(block, &bytes).unwrap();
}

#[test]
fn fresh_empty_volume_is_clean() {
    for dos_type in [DosType::OFS, DosType::FFS, DosType::FFS_INTL] {
        let (dev, _vol) = fresh_volume(dos_type);
        let report = Checker::new(dev.as_ref()).run();
        assert_eq!(
            report.count_at_or_above(CheckLevel::Warn),
            0,
            "{dos_type}: {:?}",
            report.log.entries
        );
        assert_eq!(report.stats.root_blocks, 1);
        assert_eq!(report.blocks_scanned, 1758);
    }
}

#[test]
fn populated_volume_is_clean() {
    let (dev, mut vol) = fresh_volume(DosType::FFS);
    vol.create_dir("Devs").unwrap();
    vol.create_dir("Devs/Keymaps").unwrap();
    vol.write_file(&vec![0x42_u8; 100_000], "Devs/big").unwrap();
    vol.write_file(b"tiny", "note").unwrap();
    drop(vol);

    let report = Checker::new(dev.as_ref()).run();
    assert_eq!(
        report.count_at_or_above(CheckLevel::Warn),
        0,
        "{:?}",
        report.log.entries
    );
    assert_eq!(report.stats.dir_blocks, 2);
    assert_eq!(report.stats.file_header_blocks, 2);
    assert_eq!(report.stats.file_list_blocks, 2);
}

#[test]
fn populated_ofs_volume_is_clean() {
    let (dev, mut vol) = fresh_volume(DosType::OFS);
    vol.write_file(&vec![7_u8; 3000], "blob").unwrap();
    drop(vol);

    let report = Checker::new(dev.as_ref()).run();
    assert_eq!(
        report.count_at_or_above(CheckLevel::Warn),
        0,
        "{:?}",
        report.log.entries
    );
    assert_eq!(report.stats.file_data_blocks, 7);
}

#[test]
fn self_referencing_hash_chain_terminates_with_one_error() {
    let (dev, mut vol) = fresh_volume(DosType::OFS);
    let block = vol.create_dir("loop").unwrap();
    drop(vol);

    // Chain the entry to itself and restamp so only the cycle is wrong.
    rewrite(&dev, block, |bytes| {
        put_long_end(bytes, 4, block.0);
        stamp_header_checksum(bytes);
    });

    let report = Checker::new(dev.as_ref()).run();
    assert_eq!(
        report.count_at_or_above(CheckLevel::Error),
        1,
        "{:?}",
        report.log.entries
    );
    let finding = report
        .log
        .entries
        .iter()
        .find(|e| e.level == CheckLevel::Error)
        .unwrap();
    assert!(finding.msg.contains("cycle"), "{finding}");
    assert_eq!(finding.block, Some(block.0));
}

#[test]
fn corrupted_entry_checksum_breaks_the_chain() {
    let (dev, mut vol) = fresh_volume(DosType::FFS);
    let block = vol.create_dir("Devs").unwrap();
    drop(vol);

    // Flip a payload byte without restamping: the entry no longer
    // verifies, so the chain walk reports it and the bitmap disagrees.
    rewrite(&dev, block, |bytes| {
        bytes[400] ^= 0x01;
    });

    let report = Checker::new(dev.as_ref()).run();
    assert!(report.count_at_or_above(CheckLevel::Error) >= 1);
    assert!(
        report
            .log
            .entries
            .iter()
            .any(|e| e.level == CheckLevel::Error && e.msg.contains("non-entry")),
        "{:?}",
        report.log.entries
    );
}

#[test]
fn wrong_parent_pointer_is_reported() {
    let (dev, mut vol) = fresh_volume(DosType::FFS);
    let block = vol.write_file(b"data", "stray").unwrap();
    drop(vol);

    rewrite(&dev, block, |bytes| {
        put_long_end(bytes, 3, 2); // parent := reserved-area block
        stamp_header_checksum(bytes);
    });

    let report = Checker::new(dev.as_ref()).run();
    // The chain walk flags the bad parent, and the orphan pass flags
    // the block as unreachable-by-parent.
    assert!(
        report
            .log
            .entries
            .iter()
            .any(|e| e.level == CheckLevel::Error && e.msg.contains("parent")),
        "{:?}",
        report.log.entries
    );
}

#[test]
fn orphaned_entry_is_reported() {
    let (dev, mut vol) = fresh_volume(DosType::FFS);
    let root_num = vol.root_block_num();
    let block = vol.write_file(b"data", "ghost").unwrap();
    drop(vol);

    // Empty the root hash table: the file header still exists and
    // still names the root as parent, but no chain reaches it.
    rewrite(&dev, root_num, |bytes| {
        let bucket_base = 6_usize;
        for i in 0..72 {
            put_long(bytes, bucket_base + i, 0);
        }
        stamp_header_checksum(bytes);
    });

    let report = Checker::new(dev.as_ref()).run();
    assert!(
        report
            .log
            .entries
            .iter()
            .any(|e| e.level == CheckLevel::Error
                && e.block == Some(block.0)
                && e.msg.contains("orphaned")),
        "{:?}",
        report.log.entries
    );
}

#[test]
fn ofs_sequence_corruption_is_reported() {
    let (dev, mut vol) = fresh_volume(DosType::OFS);
    let hdr = vol.write_file(&vec![5_u8; 2000], "blob").unwrap();
    drop(vol);

    // Second data pointer sits in the last-but-one table slot.
    let hdr_bytes = dev.read_block(hdr).unwrap();
    let second_ptr = {
        let capacity = 72;
        adf_ondisk::get_long(&hdr_bytes, 6 + capacity - 2)
    };
    rewrite(&dev, BlockNum(second_ptr), |bytes| {
        put_long(bytes, 2, 7); // seq_num := 7
        stamp_header_checksum(bytes);
    });

    let report = Checker::new(dev.as_ref()).run();
    assert!(
        report
            .log
            .entries
            .iter()
            .any(|e| e.level == CheckLevel::Error && e.msg.contains("seq_num")),
        "{:?}",
        report.log.entries
    );
}

#[test]
fn bitmap_drift_is_reported_per_word() {
    let (dev, mut vol) = fresh_volume(DosType::FFS);
    vol.write_file(b"data", "file").unwrap();
    drop(vol);

    // Mark a far-away block used behind the allocator's back.
    let bitmap_block = BlockNum(881);
    rewrite(&dev, bitmap_block, |bytes| {
        // Bit for block 1000: index 998 → word 31, bit 6. Word 31 of
        // the map is long 32 of the block (long 0 is the checksum).
        let long = 1 + 998 / 32;
        let old = adf_ondisk::get_long(bytes, long);
        put_long(bytes, long, old & !(1 << (998 % 32)));
        adf_ondisk::stamp_bitmap_checksum(bytes);
    });

    let report = Checker::new(dev.as_ref()).run();
    let mismatches: Vec<_> = report
        .log
        .entries
        .iter()
        .filter(|e| e.level == CheckLevel::Error && e.msg.contains("bitmap word"))
        .collect();
    assert_eq!(mismatches.len(), 1, "{:?}", report.log.entries);
    assert!(mismatches[0].msg.contains("word 31"));
}

#[test]
fn unformatted_device_survives_the_sweep() {
    let dev = MemBlockDevice::new(Geometry::floppy_dd());
    // Garbage in a few blocks, zeroes elsewhere.
    for i in [0_u32, 1, 880, 900] {
        let bytes: Vec<u8> = (0..512).map(|j| (i + j) as u8).collect();
        dev.write_block(BlockNum(i), &bytes).unwrap();
    }

    let report = Checker::new(&dev).run();
    // No DOS tag, no root: the sweep still completes with findings.
    assert!(report.count_at_or_above(CheckLevel::Warn) >= 1);
    assert!(
        report
            .log
            .entries
            .iter()
            .any(|e| e.level == CheckLevel::Fatal),
        "{:?}",
        report.log.entries
    );
    assert_eq!(report.blocks_scanned, 1758);
}

#[test]
fn report_serializes_to_json() {
    let (dev, _vol) = fresh_volume(DosType::FFS);
    let report = Checker::new(dev.as_ref()).run();
    let json = serde_json::to_string(&report).unwrap();
    let back: adf_check::CheckReport = serde_json::from_str(&json).unwrap();
    assert_eq!(back, report);
}

#[test]
fn deleted_tree_leaves_a_clean_volume() {
    let (dev, mut vol) = fresh_volume(DosType::OFS);
    vol.create_dir("a").unwrap();
    vol.write_file(&vec![1_u8; 10_000], "a/big").unwrap();
    vol.delete("a", false, true).unwrap();
    drop(vol);

    let report = Checker::new(dev.as_ref()).run();
    assert_eq!(
        report.count_at_or_above(CheckLevel::Warn),
        0,
        "{:?}",
        report.log.entries
    );
}
