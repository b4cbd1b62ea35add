//! A tiny power-loss-resilient filesystem for raw flash block devices.
//!
//! Storage is organized around two structures. Metadata lives in small
//! append-only logs mirrored across pairs of erase blocks, where every
//! update batch is sealed by a checksum so a torn write simply rolls back
//! to the previous state. File data lives either inline in those logs or
//! in copy-on-write skip-list chains that are never modified in place, so
//! at any instant the disk holds one fully consistent filesystem. Blocks
//! that fail post-write verification are relocated on the fly, and a
//! lookahead allocator spreads writes across the device for wear leveling.
//!
//! The host provides the storage by implementing [`BlockDevice`]. A
//! device is prepared once with [`Fs::format`] and then attached with
//! [`Fs::mount`]:
//!
//! ```no_run
//! use pion::{Config, Fs, OpenFlags};
//! # fn demo<D: pion::BlockDevice>(dev: std::sync::Arc<D>) -> pion::Result<()> {
//! let cfg = Config { block_size: 4096, block_count: 256, ..Config::default() };
//! Fs::format(dev.clone(), cfg.clone())?;
//! let mut fs = Fs::mount(dev, cfg)?;
//!
//! let f = fs.open("/boot_count", OpenFlags::RDWR | OpenFlags::CREAT)?;
//! let mut count = [0u8; 4];
//! fs.read(f, &mut count)?;
//! count = (u32::from_le_bytes(count) + 1).to_le_bytes();
//! fs.rewind(f)?;
//! fs.write(f, &count)?;
//! fs.close(f)?;
//! # Ok(())
//! # }
//! ```
//!
//! Writes become durable only at [`Fs::fsync`] or [`Fs::close`]; losing
//! power before that point loses at most the unsynced data, never the
//! filesystem.

mod allocator;
mod block_dev;
mod cache;
mod config;
mod ctz;
mod directory;
mod error;
mod file;
mod fs;
mod metadata;
mod path;
mod tag;

pub use block_dev::BlockDevice;
pub use config::{Config, DISK_VERSION};
pub use directory::{FileType, Info};
pub use error::{FsError, Result};
pub use file::{OpenFlags, SeekFrom};
pub use fs::{DirId, FileId, Fs, FsInfo};
