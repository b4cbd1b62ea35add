//! File objects.
//!
//! Small files live inline in their parent's metadata pair; the whole
//! content sits in the handle's cache between syncs. Larger files live in
//! a CTZ skip-list chain. Writes are copy-on-write: they never touch the
//! committed chain, building new blocks forward from the write position,
//! and only the metadata commit on sync makes them visible. A handle that
//! fails an operation mid-flight latches `ERRED` and refuses further
//! writes; the committed state on disk stays whatever the last sync made
//! durable.

use bitflags::bitflags;

use crate::cache::{self, BlockCache, BlockRef};
use crate::ctz;
use crate::error::{FsError, Result};
use crate::fs::Fs;
use crate::metadata::Mdir;
use crate::BlockDevice;

bitflags! {
    /// Open mode and behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const RDONLY = 0x0001;
        const WRONLY = 0x0002;
        const RDWR   = 0x0003;
        const CREAT  = 0x0100;
        const EXCL   = 0x0200;
        const TRUNC  = 0x0400;
        const APPEND = 0x0800;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct FileState: u32 {
        const READING = 0x01;
        const WRITING = 0x02;
        const DIRTY   = 0x04;
        const ERRED   = 0x08;
        const INLINE  = 0x10;
    }
}

impl OpenFlags {
    pub(crate) fn readable(self) -> bool {
        self.contains(OpenFlags::RDONLY)
    }

    pub(crate) fn writable(self) -> bool {
        self.contains(OpenFlags::WRONLY)
    }
}

/// Seek origin for `Fs::seek`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u32),
    Current(i32),
    End(i32),
}

#[derive(Debug)]
pub(crate) struct FileHandle {
    pub(crate) mdir: Mdir,
    pub(crate) id: u16,
    pub(crate) flags: OpenFlags,
    pub(crate) state: FileState,
    pub(crate) pos: u32,
    /// Committed or flushed chain; for inline files `ctz_size` is the
    /// content length held in `cache`.
    pub(crate) ctz_head: BlockRef,
    pub(crate) ctz_size: u32,
    /// Current block and offset of the in-flight write point.
    pub(crate) block: BlockRef,
    pub(crate) off: u32,
    pub(crate) cache: BlockCache,
    /// User attributes committed alongside every sync.
    pub(crate) attrs: Vec<(u8, Vec<u8>)>,
    pub(crate) removed: bool,
}

/// Logical size including unflushed writes.
pub(crate) fn file_size(f: &FileHandle) -> u32 {
    if f.state.contains(FileState::WRITING) {
        f.pos.max(f.ctz_size)
    } else {
        f.ctz_size
    }
}

// Moves the write point onto a fresh copy of the data through a new
// block after the current one failed to program.
fn file_relocate<D: BlockDevice>(fs: &mut Fs<D>, f: &mut FileHandle) -> Result<()> {
    'relocate: loop {
        fs.protect(f);
        let nblock = fs.alloc()?;
        let Fs { dev, cfg, pcache, rcache, .. } = fs;
        let dev = dev.as_ref();
        match cache::bd_erase(dev, cfg, pcache, rcache, nblock) {
            Err(FsError::BadBlock) => continue 'relocate,
            other => other?,
        }

        if f.off > 0 {
            let BlockRef::Block(old) = f.block else {
                return Err(FsError::Corrupt);
            };
            let mut i = 0;
            while i < f.off {
                let mut byte = [0u8; 1];
                // Unflushed bytes come out of the handle's own cache.
                cache::bd_read(dev, cfg, Some(&f.cache), rcache, f.off - i, old, i, &mut byte)?;
                match cache::bd_prog(dev, cfg, pcache, rcache, true, nblock, i, &byte) {
                    Err(FsError::BadBlock) => {
                        pcache.drop_cache();
                        continue 'relocate;
                    }
                    other => other?,
                }
                i += 1;
            }
        }

        // The staging window now belongs to the handle.
        std::mem::swap(&mut f.cache, pcache);
        pcache.drop_cache();
        f.block = BlockRef::Block(nblock);
        log::warn!("relocated file data to block {nblock}");
        return Ok(());
    }
}

// Appends `data` at the current write point, extending the chain with
// copy-on-write blocks as it crosses boundaries.
fn flushed_write<D: BlockDevice>(fs: &mut Fs<D>, f: &mut FileHandle, data: &[u8]) -> Result<()> {
    let mut rest = data;
    while !rest.is_empty() {
        if !f.state.contains(FileState::WRITING) || f.off == fs.cfg.block_size {
            if !f.state.contains(FileState::WRITING) && f.pos > 0 {
                // Find the block the write point extends from.
                let (block, _) = ctz::ctz_find(
                    fs.dev.as_ref(),
                    &fs.cfg,
                    None,
                    &mut fs.rcache,
                    f.ctz_head,
                    f.ctz_size,
                    f.pos - 1,
                )?;
                f.block = block;
                f.cache.drop_cache();
            }

            // Everything freed so far is durably unreferenced; unsynced
            // chains are protected through the open-handle traversal.
            fs.protect(f);
            fs.lookahead.ckpoint_reset(fs.cfg.block_count);
            let head = if f.pos == 0 { BlockRef::Null } else { f.block };
            let (nblock, noff) = ctz::ctz_extend(fs, &mut f.cache, head, f.pos)?;
            f.block = BlockRef::Block(nblock);
            f.off = noff;
            f.state.insert(FileState::WRITING);
        }

        let d = rest.len().min((fs.cfg.block_size - f.off) as usize);
        loop {
            let BlockRef::Block(block) = f.block else {
                return Err(FsError::Corrupt);
            };
            let Fs { dev, cfg, rcache, .. } = fs;
            match cache::bd_prog(
                dev.as_ref(),
                cfg,
                &mut f.cache,
                rcache,
                true,
                block,
                f.off,
                &rest[..d],
            ) {
                Err(FsError::BadBlock) => file_relocate(fs, f)?,
                other => {
                    other?;
                    break;
                }
            }
        }

        f.pos += d as u32;
        f.off += d as u32;
        rest = &rest[d..];
    }
    Ok(())
}

// Reads from the flushed chain (or the inline cache) at the current
// position.
fn flushed_read<D: BlockDevice>(
    fs: &mut Fs<D>,
    f: &mut FileHandle,
    buf: &mut [u8],
) -> Result<usize> {
    let size = f.ctz_size;
    if f.pos >= size {
        return Ok(0);
    }
    let len = buf.len().min((size - f.pos) as usize);

    if f.state.contains(FileState::INLINE) {
        buf[..len].copy_from_slice(&f.cache.buffer[f.pos as usize..f.pos as usize + len]);
        f.pos += len as u32;
        return Ok(len);
    }

    let mut done = 0;
    while done < len {
        if !f.state.contains(FileState::READING) || f.off == fs.cfg.block_size {
            let (block, off) = ctz::ctz_find(
                fs.dev.as_ref(),
                &fs.cfg,
                None,
                &mut fs.rcache,
                f.ctz_head,
                f.ctz_size,
                f.pos,
            )?;
            f.block = block;
            f.off = off;
            f.state.insert(FileState::READING);
        }

        let BlockRef::Block(block) = f.block else {
            return Err(FsError::Corrupt);
        };
        let d = (len - done).min((fs.cfg.block_size - f.off) as usize);
        cache::bd_read(
            fs.dev.as_ref(),
            &fs.cfg,
            None,
            &mut f.cache,
            (len - done) as u32,
            block,
            f.off,
            &mut buf[done..done + d],
        )?;
        f.pos += d as u32;
        f.off += d as u32;
        done += d;
    }
    Ok(len)
}

/// Completes any in-flight write so the handle's chain describes the
/// whole file, copying forward whatever of the old chain lies past the
/// write point.
pub(crate) fn file_flush<D: BlockDevice>(fs: &mut Fs<D>, f: &mut FileHandle) -> Result<()> {
    if f.state.contains(FileState::READING) {
        if !f.state.contains(FileState::INLINE) {
            f.cache.drop_cache();
        }
        f.state.remove(FileState::READING);
    }

    if f.state.contains(FileState::WRITING) {
        let pos = f.pos;

        if f.pos < f.ctz_size {
            // Carry the old chain's tail over onto the new chain.
            let old_head = f.ctz_head;
            let old_size = f.ctz_size;
            let mut tcache = BlockCache::new(fs.cfg.cache_size);
            let mut rpos = f.pos;
            let mut scratch = [0u8; 64];
            while rpos < old_size {
                let (block, boff) = ctz::ctz_find(
                    fs.dev.as_ref(),
                    &fs.cfg,
                    None,
                    &mut tcache,
                    old_head,
                    old_size,
                    rpos,
                )?;
                let BlockRef::Block(block) = block else {
                    return Err(FsError::Corrupt);
                };
                let d = (scratch.len() as u32)
                    .min(old_size - rpos)
                    .min(fs.cfg.block_size - boff);
                cache::bd_read(
                    fs.dev.as_ref(),
                    &fs.cfg,
                    None,
                    &mut tcache,
                    old_size - rpos,
                    block,
                    boff,
                    &mut scratch[..d as usize],
                )?;
                flushed_write(fs, f, &scratch[..d as usize])?;
                rpos += d;
            }
        }

        // The chain is only whole once the staged tail is on the device.
        loop {
            let Fs { dev, cfg, rcache, .. } = fs;
            match cache::bd_flush(dev.as_ref(), cfg, &mut f.cache, rcache, true) {
                Err(FsError::BadBlock) => file_relocate(fs, f)?,
                other => {
                    other?;
                    break;
                }
            }
        }

        f.ctz_head = f.block;
        f.ctz_size = f.pos;
        f.state.remove(FileState::WRITING);
        f.state.insert(FileState::DIRTY);
        f.pos = pos;
    }

    Ok(())
}

// Converts an inline file to a CTZ chain by writing the whole content
// out and flushing.
fn file_outline<D: BlockDevice>(fs: &mut Fs<D>, f: &mut FileHandle) -> Result<()> {
    let data = f.cache.buffer[..f.ctz_size as usize].to_vec();
    let pos = f.pos;

    f.state.remove(FileState::INLINE | FileState::READING);
    f.cache.drop_cache();
    f.ctz_head = BlockRef::Null;
    f.ctz_size = 0;
    f.pos = 0;

    flushed_write(fs, f, &data)?;
    file_flush(fs, f)?;
    f.pos = pos;
    Ok(())
}

pub(crate) fn file_write<D: BlockDevice>(
    fs: &mut Fs<D>,
    f: &mut FileHandle,
    data: &[u8],
) -> Result<usize> {
    if f.removed || f.state.contains(FileState::ERRED) {
        return Err(FsError::BadFile);
    }
    if !f.flags.writable() {
        return Err(FsError::BadFile);
    }
    if data.is_empty() {
        return Ok(0);
    }

    if f.flags.contains(OpenFlags::APPEND) {
        f.pos = file_size(f);
    }
    if f.pos as u64 + data.len() as u64 > fs.cfg.file_limit() as u64 {
        return Err(FsError::FileTooLarge);
    }

    let res = file_write_inner(fs, f, data);
    if res.is_err() {
        f.state.insert(FileState::ERRED);
    }
    res
}

fn file_write_inner<D: BlockDevice>(
    fs: &mut Fs<D>,
    f: &mut FileHandle,
    data: &[u8],
) -> Result<usize> {
    if f.state.contains(FileState::READING) {
        file_flush(fs, f)?;
    }

    if f.state.contains(FileState::INLINE)
        && (f.pos as u64 + data.len() as u64).max(f.ctz_size as u64)
            > fs.cfg.inline_limit() as u64
    {
        file_outline(fs, f)?;
    }

    if f.state.contains(FileState::INLINE) {
        let pos = f.pos as usize;
        let end = pos + data.len();
        if f.cache.buffer.len() < end {
            f.cache.buffer.resize(end, 0);
        }
        // Zero the gap a seek past the end may have left.
        if pos > f.ctz_size as usize {
            f.cache.buffer[f.ctz_size as usize..pos].fill(0);
        }
        f.cache.buffer[pos..end].copy_from_slice(data);
        f.pos = end as u32;
        f.ctz_size = f.ctz_size.max(end as u32);
        f.state.insert(FileState::DIRTY);
        return Ok(data.len());
    }

    if !f.state.contains(FileState::WRITING) && f.pos > f.ctz_size {
        // Fill the gap with zeros before the payload lands.
        let target = f.pos;
        f.pos = f.ctz_size;
        let zeros = [0u8; 64];
        while f.pos < target {
            let d = (zeros.len() as u32).min(target - f.pos) as usize;
            flushed_write(fs, f, &zeros[..d])?;
        }
    }

    flushed_write(fs, f, data)?;
    f.state.insert(FileState::DIRTY);
    Ok(data.len())
}

pub(crate) fn file_read<D: BlockDevice>(
    fs: &mut Fs<D>,
    f: &mut FileHandle,
    buf: &mut [u8],
) -> Result<usize> {
    if f.removed || f.state.contains(FileState::ERRED) {
        return Err(FsError::BadFile);
    }
    if !f.flags.readable() {
        return Err(FsError::BadFile);
    }
    if f.state.contains(FileState::WRITING) {
        file_flush(fs, f)?;
    }
    flushed_read(fs, f, buf)
}

pub(crate) fn file_seek<D: BlockDevice>(
    fs: &mut Fs<D>,
    f: &mut FileHandle,
    whence: SeekFrom,
) -> Result<u32> {
    if f.state.contains(FileState::ERRED) {
        return Err(FsError::BadFile);
    }
    let base = match whence {
        SeekFrom::Start(off) => off as i64,
        SeekFrom::Current(off) => f.pos as i64 + off as i64,
        SeekFrom::End(off) => file_size(f) as i64 + off as i64,
    };
    if base < 0 || base > fs.cfg.file_limit() as i64 {
        return Err(FsError::Invalid);
    }
    let npos = base as u32;
    if npos != f.pos {
        file_flush(fs, f)?;
        f.state.remove(FileState::READING);
        f.pos = npos;
    }
    Ok(npos)
}

pub(crate) fn file_truncate<D: BlockDevice>(
    fs: &mut Fs<D>,
    f: &mut FileHandle,
    size: u32,
) -> Result<()> {
    if f.removed || f.state.contains(FileState::ERRED) {
        return Err(FsError::BadFile);
    }
    if !f.flags.writable() {
        return Err(FsError::BadFile);
    }
    if size > fs.cfg.file_limit() {
        return Err(FsError::FileTooLarge);
    }

    let pos = f.pos;
    let old = file_size(f);

    if size < old {
        if f.state.contains(FileState::INLINE) {
            f.ctz_size = size;
        } else if size <= fs.cfg.inline_limit() {
            // Shrink back to an inline file.
            file_flush(fs, f)?;
            let mut data = vec![0u8; size as usize];
            f.pos = 0;
            f.state.remove(FileState::READING);
            flushed_read(fs, f, &mut data)?;
            f.cache.drop_cache();
            f.cache.block = BlockRef::Inline;
            if f.cache.buffer.len() < data.len() {
                f.cache.buffer.resize(data.len(), 0);
            }
            f.cache.buffer[..data.len()].copy_from_slice(&data);
            f.ctz_head = BlockRef::Null;
            f.ctz_size = size;
            f.state.remove(FileState::READING | FileState::WRITING);
            f.state.insert(FileState::INLINE);
        } else {
            file_flush(fs, f)?;
            // The block holding the new last byte becomes the chain head.
            let (head, _) = ctz::ctz_find(
                fs.dev.as_ref(),
                &fs.cfg,
                None,
                &mut fs.rcache,
                f.ctz_head,
                f.ctz_size,
                size - 1,
            )?;
            f.ctz_head = head;
            f.ctz_size = size;
            f.state.remove(FileState::READING);
        }
        f.state.insert(FileState::DIRTY);
    } else if size > old {
        f.pos = old;
        let zeros = [0u8; 64];
        if f.state.contains(FileState::INLINE) && size <= fs.cfg.inline_limit() {
            if f.cache.buffer.len() < size as usize {
                f.cache.buffer.resize(size as usize, 0);
            }
            f.cache.buffer[old as usize..size as usize].fill(0);
            f.ctz_size = size;
        } else {
            if f.state.contains(FileState::INLINE) {
                file_outline(fs, f)?;
                f.pos = old;
            }
            while f.pos < size {
                let d = (zeros.len() as u32).min(size - f.pos) as usize;
                flushed_write(fs, f, &zeros[..d])?;
            }
        }
        f.state.insert(FileState::DIRTY);
    }

    // Settle any in-flight extension before moving the position off the
    // write point; the flush takes the new size from it.
    if f.state.contains(FileState::WRITING) {
        file_flush(fs, f)?;
    }
    f.pos = pos;
    Ok(())
}
