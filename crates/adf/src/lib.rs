#![forbid(unsafe_code)]
//! adf public API facade.
//!
//! Re-exports the volume layer and the validator through one stable
//! interface. This is the crate downstream consumers depend on; the
//! individual `adf-*` crates are implementation layers.

pub use adf_alloc::BitmapAlloc;
pub use adf_block::{BlockDevice, FileBlockDevice, MemBlockDevice};
pub use adf_check::{CheckEntry, CheckLevel, CheckLog, CheckReport, CheckStats, Checker};
pub use adf_core::Volume;
pub use adf_error::{AdfError, Result};
pub use adf_node::{Dir, File, FsCtx, MetaInfo, Node};
pub use adf_ondisk as ondisk;
pub use adf_types::{BlockNum, DosType, Geometry, Protection, TimeStamp};
