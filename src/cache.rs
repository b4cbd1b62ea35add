//! Block caching layer between the filesystem and the raw device.
//!
//! Reads and programs are grouped at the configured `read_size` and
//! `prog_size` granularities. A read first checks the write-pending
//! program cache, then the read cache, bypasses both for large aligned
//! spans, and otherwise fills the read cache for the containing window.
//! Programs accumulate in a program cache until it fills or is flushed;
//! a flush invalidates the read cache first and optionally verifies the
//! programmed data by reading it back, reporting `BadBlock` on mismatch
//! so the caller can relocate.

use crate::block_dev::BlockDevice;
use crate::config::Config;
use crate::error::{FsError, Result};

/// A block address that may also be one of the two non-physical states a
/// cache or file position can refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockRef {
    /// No block; the cache is empty or the file has no data yet.
    Null,
    /// Data lives inline in the owning metadata pair, not in any block.
    Inline,
    /// A physical erase block.
    Block(u32),
}

#[derive(Debug)]
pub(crate) struct BlockCache {
    pub(crate) block: BlockRef,
    pub(crate) off: u32,
    pub(crate) size: u32,
    pub(crate) buffer: Vec<u8>,
}

impl BlockCache {
    pub(crate) fn new(cache_size: u32) -> Self {
        Self {
            block: BlockRef::Null,
            off: 0,
            size: 0,
            buffer: vec![0; cache_size as usize],
        }
    }

    /// Invalidates the cache without touching the buffer.
    pub(crate) fn drop_cache(&mut self) {
        self.block = BlockRef::Null;
        self.off = 0;
        self.size = 0;
    }
}

fn align_down(v: u32, align: u32) -> u32 {
    v - v % align
}

fn align_up(v: u32, align: u32) -> u32 {
    align_down(v + align - 1, align)
}

/// Reads `data` from `block` at `off`, consulting the program cache, the
/// read cache, and the device in that order. `hint` is how many bytes the
/// caller expects to need soon; larger hints let the read cache prefetch.
pub(crate) fn bd_read<D: BlockDevice>(
    dev: &D,
    cfg: &Config,
    pcache: Option<&BlockCache>,
    rcache: &mut BlockCache,
    hint: u32,
    block: u32,
    off: u32,
    data: &mut [u8],
) -> Result<()> {
    let mut off = off;
    let mut rest = data;
    debug_assert!(off as u64 + rest.len() as u64 <= cfg.block_size as u64);

    while !rest.is_empty() {
        let mut diff = rest.len() as u32;

        if let Some(pc) = pcache {
            if pc.block == BlockRef::Block(block) && off < pc.off + pc.size {
                if off >= pc.off {
                    let d = diff.min(pc.size - (off - pc.off)) as usize;
                    let start = (off - pc.off) as usize;
                    rest[..d].copy_from_slice(&pc.buffer[start..start + d]);
                    off += d as u32;
                    rest = &mut rest[d..];
                    continue;
                }
                // Serve the bytes before the program cache first.
                diff = diff.min(pc.off - off);
            }
        }

        if rcache.block == BlockRef::Block(block) && off < rcache.off + rcache.size {
            if off >= rcache.off {
                let d = diff.min(rcache.size - (off - rcache.off)) as usize;
                let start = (off - rcache.off) as usize;
                rest[..d].copy_from_slice(&rcache.buffer[start..start + d]);
                off += d as u32;
                rest = &mut rest[d..];
                continue;
            }
            diff = diff.min(rcache.off - off);
        }

        if diff >= hint && off % cfg.read_size == 0 && diff >= cfg.read_size {
            // Large aligned span, bypass the read cache entirely.
            let d = align_down(diff, cfg.read_size) as usize;
            dev.read(block, off, &mut rest[..d])?;
            off += d as u32;
            rest = &mut rest[d..];
            continue;
        }

        // Fill the read cache with the window containing `off`.
        rcache.block = BlockRef::Block(block);
        rcache.off = align_down(off, cfg.read_size);
        let want = align_up(off + hint.max(diff), cfg.read_size).min(cfg.block_size);
        rcache.size = (want - rcache.off).min(cfg.cache_size);
        let size = rcache.size as usize;
        dev.read(block, rcache.off, &mut rcache.buffer[..size])?;
    }

    Ok(())
}

/// Compares `data` against the on-device contents of `block` at `off`.
pub(crate) fn bd_cmp<D: BlockDevice>(
    dev: &D,
    cfg: &Config,
    rcache: &mut BlockCache,
    hint: u32,
    block: u32,
    off: u32,
    data: &[u8],
) -> Result<bool> {
    let mut scratch = [0u8; 32];
    let mut pos = 0usize;
    while pos < data.len() {
        let d = scratch.len().min(data.len() - pos);
        bd_read(
            dev,
            cfg,
            None,
            rcache,
            hint,
            block,
            off + pos as u32,
            &mut scratch[..d],
        )?;
        if scratch[..d] != data[pos..pos + d] {
            return Ok(false);
        }
        pos += d;
    }
    Ok(true)
}

/// Flushes the program cache to the device, padding to program alignment
/// with erased bytes. With `validate`, reads the span back and compares,
/// reporting `BadBlock` on any mismatch.
pub(crate) fn bd_flush<D: BlockDevice>(
    dev: &D,
    cfg: &Config,
    pcache: &mut BlockCache,
    rcache: &mut BlockCache,
    validate: bool,
) -> Result<()> {
    let BlockRef::Block(block) = pcache.block else {
        return Ok(());
    };
    if pcache.size == 0 {
        pcache.drop_cache();
        return Ok(());
    }

    let size = align_up(pcache.size, cfg.prog_size) as usize;
    pcache.buffer[pcache.size as usize..size].fill(0xff);
    dev.prog(block, pcache.off, &pcache.buffer[..size])?;

    if validate {
        // The read cache may alias the region just written.
        rcache.drop_cache();
        let ok = bd_cmp(
            dev,
            cfg,
            rcache,
            size as u32,
            block,
            pcache.off,
            &pcache.buffer[..size],
        )?;
        if !ok {
            // Keep the staged window; relocation reads the unflushed
            // bytes back out of it before retrying on a fresh block.
            log::warn!("post-write verify failed on block {block}, treating as bad");
            return Err(FsError::BadBlock);
        }
    }

    pcache.drop_cache();
    Ok(())
}

/// Programs `data` to `block` at `off` through the program cache. Flushes
/// transparently whenever the cache fills.
pub(crate) fn bd_prog<D: BlockDevice>(
    dev: &D,
    cfg: &Config,
    pcache: &mut BlockCache,
    rcache: &mut BlockCache,
    validate: bool,
    block: u32,
    off: u32,
    data: &[u8],
) -> Result<()> {
    let mut off = off;
    let mut rest = data;
    debug_assert!(off as u64 + rest.len() as u64 <= cfg.block_size as u64);

    while !rest.is_empty() {
        if pcache.block == BlockRef::Block(block)
            && off == pcache.off + pcache.size
            && pcache.size < cfg.cache_size
        {
            let d = (rest.len() as u32).min(cfg.cache_size - pcache.size) as usize;
            let start = pcache.size as usize;
            pcache.buffer[start..start + d].copy_from_slice(&rest[..d]);
            pcache.size += d as u32;
            off += d as u32;
            rest = &rest[d..];
            if pcache.size == cfg.cache_size {
                bd_flush(dev, cfg, pcache, rcache, validate)?;
            }
            continue;
        }

        if pcache.block != BlockRef::Null {
            bd_flush(dev, cfg, pcache, rcache, validate)?;
        }

        debug_assert!(off % cfg.prog_size == 0);
        pcache.block = BlockRef::Block(block);
        pcache.off = off;
        pcache.size = 0;
    }

    Ok(())
}

/// Erases a block, dropping any cache windows that alias it.
pub(crate) fn bd_erase<D: BlockDevice>(
    dev: &D,
    cfg: &Config,
    pcache: &mut BlockCache,
    rcache: &mut BlockCache,
    block: u32,
) -> Result<()> {
    debug_assert!(block < cfg.block_count || cfg.block_count == 0);
    if pcache.block == BlockRef::Block(block) {
        pcache.drop_cache();
    }
    if rcache.block == BlockRef::Block(block) {
        rcache.drop_cache();
    }
    dev.erase(block)
}

/// Flushes pending programs and syncs the underlying device.
pub(crate) fn bd_sync<D: BlockDevice>(
    dev: &D,
    cfg: &Config,
    pcache: &mut BlockCache,
    rcache: &mut BlockCache,
) -> Result<()> {
    bd_flush(dev, cfg, pcache, rcache, true)?;
    dev.sync()
}
