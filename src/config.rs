use crate::error::{FsError, Result};

/// Magic string stored in the superblock's name record.
pub const MAGIC: &[u8; 6] = b"pionfs";

/// On-disk format version, major in the upper 16 bits.
/// Equal major is required to mount; a smaller minor is tolerated and the
/// superblock is rewritten lazily on the first write.
pub const DISK_VERSION: u32 = 0x0001_0000;

pub const fn disk_version_major(v: u32) -> u16 {
    (v >> 16) as u16
}

pub const fn disk_version_minor(v: u32) -> u16 {
    v as u16
}

/// Hard cap on name length imposed by the tag size field (10 bits, with
/// 0x3ff reserved as the delete sentinel).
pub const NAME_MAX: u32 = 0x3fe;
/// Hard cap on a single attribute payload, same tag-size-field bound.
pub const ATTR_MAX: u32 = 0x3fe;
/// Hard cap on file size imposed by the CTZ skip-list addressing.
pub const FILE_MAX: u32 = 0x7fff_ffff;

/// Runtime configuration. Geometry and limits are invariant for the life
/// of a mount; `block_count` may be zero, in which case it is taken from
/// the superblock at mount.
#[derive(Debug, Clone)]
pub struct Config {
    /// Minimum read granularity in bytes.
    pub read_size: u32,
    /// Minimum program granularity in bytes.
    pub prog_size: u32,
    /// Erase block size in bytes.
    pub block_size: u32,
    /// Number of erase blocks, or 0 to take the count from the superblock.
    pub block_count: u32,
    /// Number of erase cycles before a metadata pair is moved to fresh
    /// blocks for wear leveling, or 0 to disable.
    pub block_cycles: u32,
    /// Size of the read, program and per-file caches in bytes. Must be a
    /// multiple of both granularities and a factor of the block size.
    pub cache_size: u32,
    /// Size of the allocator lookahead bitmap in bytes.
    pub lookahead_size: u32,
    /// Metadata log fill level that triggers compaction during `gc`, in
    /// bytes, or 0 for the default (7/8 of the metadata budget).
    pub compact_thresh: u32,
    /// Maximum name length, or 0 for the format default.
    pub name_max: u32,
    /// Maximum file size, or 0 for the format default.
    pub file_max: u32,
    /// Maximum user attribute size, or 0 for the format default.
    pub attr_max: u32,
    /// Maximum bytes of a metadata block actually used, or 0 for the whole
    /// block. Lowering this bounds commit and compaction cost.
    pub metadata_max: u32,
    /// Maximum size of a file stored inline in its parent's metadata, or 0
    /// for the default (capped by the cache size and tag size field).
    pub inline_max: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_size: 1,
            prog_size: 1,
            block_size: 4096,
            block_count: 0,
            block_cycles: 512,
            cache_size: 256,
            lookahead_size: 16,
            compact_thresh: 0,
            name_max: 0,
            file_max: 0,
            attr_max: 0,
            metadata_max: 0,
            inline_max: 0,
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.read_size == 0 || self.prog_size == 0 || self.block_size == 0 {
            return Err(FsError::Invalid);
        }
        if self.cache_size % self.read_size != 0 || self.cache_size % self.prog_size != 0 {
            return Err(FsError::Invalid);
        }
        if self.block_size % self.cache_size != 0 {
            return Err(FsError::Invalid);
        }
        if self.lookahead_size == 0 {
            return Err(FsError::Invalid);
        }
        // A metadata pair must fit a revision, one commit and its CRC.
        if self.block_size < 128 {
            return Err(FsError::Invalid);
        }
        if self.name_max > NAME_MAX || self.attr_max > ATTR_MAX || self.file_max > FILE_MAX {
            return Err(FsError::Invalid);
        }
        if self.metadata_max > self.block_size {
            return Err(FsError::Invalid);
        }
        if self.inline_max > self.cache_size || self.inline_max > ATTR_MAX {
            return Err(FsError::Invalid);
        }
        Ok(())
    }

    pub(crate) fn name_limit(&self) -> u32 {
        if self.name_max != 0 { self.name_max } else { NAME_MAX }
    }

    pub(crate) fn file_limit(&self) -> u32 {
        if self.file_max != 0 { self.file_max } else { FILE_MAX }
    }

    pub(crate) fn attr_limit(&self) -> u32 {
        if self.attr_max != 0 { self.attr_max } else { ATTR_MAX }
    }

    pub(crate) fn metadata_limit(&self) -> u32 {
        if self.metadata_max != 0 { self.metadata_max } else { self.block_size }
    }

    pub(crate) fn inline_limit(&self) -> u32 {
        if self.inline_max != 0 {
            self.inline_max
        } else {
            self.cache_size
                .min(ATTR_MAX)
                .min(self.metadata_limit() / 8)
        }
    }

    pub(crate) fn compact_limit(&self) -> u32 {
        if self.compact_thresh != 0 {
            self.compact_thresh
        } else {
            self.metadata_limit() - self.metadata_limit() / 8
        }
    }
}
