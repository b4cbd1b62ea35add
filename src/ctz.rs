//! CTZ skip-list addressing for out-of-line file data.
//!
//! File data lives in a backward-linked list of blocks where block `i`
//! (for `i >= 1`) begins with `ctz(i) + 1` little-endian u32 back-pointers,
//! pointer `j` targeting index `i - 2^j`; block 0 is all data. The index
//! of the block containing a byte offset, and the offset within it, are
//! derivable in closed form, and seeking walks backward from the head in
//! O(log n) hops. Growing a file never rewrites earlier blocks.

use crate::block_dev::BlockDevice;
use crate::cache::{self, BlockCache, BlockRef};
use crate::config::Config;
use crate::error::{FsError, Result};
use crate::fs::Fs;

/// Smallest power-of-two exponent covering `x`, i.e. ceil(log2(x)).
fn npw2(x: u32) -> u32 {
    debug_assert!(x >= 1);
    32 - (x - 1).leading_zeros()
}

/// Maps a byte offset to (block index, offset within that block). The
/// in-block offset includes the pointer prefix, so it points directly at
/// the byte's location.
pub(crate) fn ctz_index(cfg: &Config, off: u32) -> (u32, u32) {
    let b = cfg.block_size - 2 * 4;
    let i = off / b;
    if i == 0 {
        return (0, off);
    }
    let i = (off - 4 * ((i - 1).count_ones() + 2)) / b;
    (i, off - b * i - 4 * i.count_ones())
}

/// Walks backward from `head` (the block at the index of `size - 1`) to
/// the block holding `pos`, taking the largest hop that does not
/// undershoot at each step.
pub(crate) fn ctz_find<D: BlockDevice>(
    dev: &D,
    cfg: &Config,
    pcache: Option<&BlockCache>,
    rcache: &mut BlockCache,
    head: BlockRef,
    size: u32,
    pos: u32,
) -> Result<(BlockRef, u32)> {
    if size == 0 {
        return Ok((BlockRef::Null, 0));
    }
    let BlockRef::Block(mut head) = head else {
        return Err(FsError::Corrupt);
    };

    let (mut current, _) = ctz_index(cfg, size - 1);
    let (target, target_off) = ctz_index(cfg, pos);

    while current > target {
        let skip = (npw2(current - target + 1) - 1).min(current.trailing_zeros());
        let mut word = [0u8; 4];
        cache::bd_read(dev, cfg, pcache, rcache, 4, head, 4 * skip, &mut word)?;
        head = u32::from_le_bytes(word);
        current -= 1 << skip;
    }

    Ok((BlockRef::Block(head), target_off))
}

fn ctz_extend_once<D: BlockDevice>(
    fs: &mut Fs<D>,
    pcache: &mut BlockCache,
    head: BlockRef,
    size: u32,
) -> Result<(u32, u32)> {
    let nblock = fs.alloc()?;
    {
        let Fs { dev, cfg, rcache, pcache: fs_pcache, .. } = fs;
        cache::bd_erase(dev.as_ref(), cfg, fs_pcache, rcache, nblock)?;
        if pcache.block == BlockRef::Block(nblock) {
            pcache.drop_cache();
        }
    }

    if size == 0 {
        return Ok((nblock, 0));
    }
    let BlockRef::Block(head) = head else {
        return Err(FsError::Corrupt);
    };

    let (index, last_off) = ctz_index(&fs.cfg, size - 1);
    let noff = last_off + 1;

    if noff != fs.cfg.block_size {
        // The last block is incomplete; copy it forward so the chain's
        // earlier blocks stay untouched.
        for i in 0..noff {
            let mut byte = [0u8; 1];
            cache::bd_read(
                fs.dev.as_ref(),
                &fs.cfg,
                None,
                &mut fs.rcache,
                noff - i,
                head,
                i,
                &mut byte,
            )?;
            cache::bd_prog(
                fs.dev.as_ref(),
                &fs.cfg,
                pcache,
                &mut fs.rcache,
                true,
                nblock,
                i,
                &byte,
            )?;
        }
        return Ok((nblock, noff));
    }

    // The last block is full; start a fresh block whose pointer prefix
    // has ctz(index)+1 entries.
    let index = index + 1;
    let skips = index.trailing_zeros() + 1;
    let mut nhead = head;
    for i in 0..skips {
        cache::bd_prog(
            fs.dev.as_ref(),
            &fs.cfg,
            pcache,
            &mut fs.rcache,
            true,
            nblock,
            4 * i,
            &nhead.to_le_bytes(),
        )?;
        if i != skips - 1 {
            let mut word = [0u8; 4];
            cache::bd_read(
                fs.dev.as_ref(),
                &fs.cfg,
                None,
                &mut fs.rcache,
                4,
                nhead,
                4 * i,
                &mut word,
            )?;
            nhead = u32::from_le_bytes(word);
        }
    }

    Ok((nblock, 4 * skips))
}

/// Extends the chain by one block, returning the new block and the write
/// offset within it. Bad blocks are retried against fresh allocations.
pub(crate) fn ctz_extend<D: BlockDevice>(
    fs: &mut Fs<D>,
    pcache: &mut BlockCache,
    head: BlockRef,
    size: u32,
) -> Result<(u32, u32)> {
    loop {
        match ctz_extend_once(fs, pcache, head, size) {
            Err(FsError::BadBlock) => {
                log::warn!("bad block while extending file, relocating");
                pcache.drop_cache();
                continue;
            }
            res => return res,
        }
    }
}

/// Visits every block reachable from (head, size) exactly once, newest
/// first.
pub(crate) fn ctz_traverse<D, F>(
    dev: &D,
    cfg: &Config,
    pcache: Option<&BlockCache>,
    rcache: &mut BlockCache,
    head: BlockRef,
    size: u32,
    cb: &mut F,
) -> Result<()>
where
    D: BlockDevice,
    F: FnMut(u32) -> Result<()>,
{
    if size == 0 {
        return Ok(());
    }
    let BlockRef::Block(mut head) = head else {
        return Err(FsError::Corrupt);
    };

    let (mut index, _) = ctz_index(cfg, size - 1);
    loop {
        cb(head)?;
        if index == 0 {
            return Ok(());
        }
        let mut word = [0u8; 4];
        cache::bd_read(dev, cfg, pcache, rcache, 4, head, 0, &mut word)?;
        head = u32::from_le_bytes(word);
        index -= 1;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_cfg(block_size: u32) -> Config {
        Config {
            block_size,
            block_count: 64,
            cache_size: 16,
            read_size: 1,
            prog_size: 1,
            ..Config::default()
        }
    }

    #[test]
    fn test_index_contiguous() {
        // The offset->(index, off) map must advance one byte at a time,
        // skipping exactly the pointer prefix at each block boundary.
        let cfg = test_cfg(64);
        let (mut prev_i, mut prev_off) = ctz_index(&cfg, 0);
        assert_eq!((prev_i, prev_off), (0, 0));
        for off in 1..10_000u32 {
            let (i, boff) = ctz_index(&cfg, off);
            assert!(boff < cfg.block_size);
            if i == prev_i {
                assert_eq!(boff, prev_off + 1);
            } else {
                assert_eq!(i, prev_i + 1);
                assert_eq!(prev_off, cfg.block_size - 1);
                let ptrs = i.trailing_zeros() + 1;
                assert_eq!(boff, 4 * ptrs);
            }
            prev_i = i;
            prev_off = boff;
        }
    }

    #[test]
    fn test_index_pointer_prefix_bounds() {
        let cfg = test_cfg(128);
        for off in 0..50_000u32 {
            let (i, boff) = ctz_index(&cfg, off);
            let prefix = if i == 0 { 0 } else { 4 * (i.trailing_zeros() + 1) };
            assert!(boff >= prefix, "offset {off} landed inside pointers");
        }
    }

    #[test]
    fn test_npw2() {
        assert_eq!(npw2(1), 0);
        assert_eq!(npw2(2), 1);
        assert_eq!(npw2(3), 2);
        assert_eq!(npw2(4), 2);
        assert_eq!(npw2(5), 3);
    }
}
