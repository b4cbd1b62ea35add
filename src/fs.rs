//! The filesystem session object and namespace operations.
//!
//! `Fs` owns the device, the shared read/program caches, the allocator
//! window, the global-state accumulator and an arena of open handles.
//! Public operations resolve paths against the directory thread rooted at
//! the superblock pair {0, 1}, whose soft tail points at the root
//! directory. Mutating operations first bring the filesystem back to full
//! consistency (completing an interrupted move, collecting orphans,
//! upgrading an old superblock) so that on-disk state is always one
//! atomic commit away from the requested change.

use std::sync::Arc;

use crate::allocator::Lookahead;
use crate::block_dev::{BlockDevice, DeviceLock};
use crate::cache::{self, BlockCache, BlockRef};
use crate::config::{
    disk_version_major, disk_version_minor, Config, DISK_VERSION, MAGIC,
};
use crate::ctz;
use crate::directory::{self, DirHandle, FileType, Info};
use crate::error::{FsError, Result};
use crate::file::{self, FileHandle, FileState, OpenFlags, SeekFrom};
use crate::metadata::{self, Attr, Mdir, MASK_ALL, MASK_CLASS};
use crate::path;
use crate::tag::{
    pair_from_bytes, pair_is_null, pair_sync, pair_to_bytes, Gstate, Pair, Tag, CLASS_SPLICE,
    ID_NONE, PAIR_NULL, TYPE_CREATE, TYPE_CTZSTRUCT, TYPE_DIR, TYPE_DIRSTRUCT,
    TYPE_HARDTAIL, TYPE_INLINESTRUCT, TYPE_REG, TYPE_SOFTTAIL, TYPE_SUPERBLOCK, TYPE_USERATTR,
};

/// Handle to an open file, valid until `close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileId(pub(crate) usize);

/// Handle to an open directory, valid until `closedir`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirId(pub(crate) usize);

/// Filesystem geometry and limits as recorded in the superblock.
#[derive(Debug, Clone)]
pub struct FsInfo {
    pub disk_version: u32,
    pub block_size: u32,
    pub block_count: u32,
    pub name_max: u32,
    pub file_max: u32,
    pub attr_max: u32,
}

// Superblock inline-struct payload.
fn sb_payload(cfg: &Config) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24);
    for v in [
        DISK_VERSION,
        cfg.block_size,
        cfg.block_count,
        cfg.name_limit(),
        cfg.file_limit(),
        cfg.attr_limit(),
    ] {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

fn pair_touches(a: Pair, b: Pair) -> bool {
    a[0] == b[0] || a[0] == b[1] || a[1] == b[0] || a[1] == b[1]
}

// Result of a name search within one directory chain.
struct Found {
    /// The pair holding the entry, or the chain's last pair if absent.
    mdir: Mdir,
    entry: Option<(u16, Tag)>,
}

enum Located {
    Root,
    Entry { mdir: Mdir, id: u16, tag: Tag },
}

pub struct Fs<D: BlockDevice> {
    pub(crate) dev: Arc<D>,
    pub(crate) cfg: Config,
    pub(crate) rcache: BlockCache,
    pub(crate) pcache: BlockCache,
    pub(crate) root: Pair,
    pub(crate) gstate: Gstate,
    pub(crate) gdisk: Gstate,
    pub(crate) lookahead: Lookahead,
    pub(crate) seed: u32,
    pub(crate) files: Vec<Option<FileHandle>>,
    pub(crate) dirs: Vec<Option<DirHandle>>,
    /// Chains owned by a handle currently outside the arena, still
    /// protected from the allocator.
    pub(crate) inflight: Vec<(BlockRef, u32)>,
    needs_superblock_rewrite: bool,
    disk_version: u32,
}

// Walks every reachable block: the directory thread, every CTZ chain it
// references, and the unsynced chains of open handles.
fn traverse_raw<D: BlockDevice>(
    dev: &D,
    cfg: &Config,
    rcache: &mut BlockCache,
    gdisk: &Gstate,
    files: &[Option<FileHandle>],
    inflight: &[(BlockRef, u32)],
    cb: &mut dyn FnMut(u32) -> Result<()>,
) -> Result<()> {
    let mut pair: Pair = [0, 1];
    let mut steps = 0u32;
    loop {
        steps += 1;
        if steps > cfg.block_count / 2 + 1 {
            return Err(FsError::Corrupt);
        }
        cb(pair[0])?;
        cb(pair[1])?;

        let mdir = metadata::dir_fetch(dev, cfg, None, rcache, pair)?;
        for id in 0..mdir.count {
            match metadata::dir_get(
                dev,
                cfg,
                None,
                rcache,
                gdisk,
                &mdir,
                MASK_CLASS,
                Tag::new(TYPE_DIRSTRUCT, id, 0),
            ) {
                Ok((tag, data)) if tag.typ() == TYPE_CTZSTRUCT && data.len() == 8 => {
                    let head = u32::from_le_bytes(data[0..4].try_into().map_err(|_| FsError::Corrupt)?);
                    let size = u32::from_le_bytes(data[4..8].try_into().map_err(|_| FsError::Corrupt)?);
                    if size > 0 {
                        ctz::ctz_traverse(
                            dev,
                            cfg,
                            None,
                            rcache,
                            BlockRef::Block(head),
                            size,
                            &mut |b| cb(b),
                        )?;
                    }
                }
                // Directory pairs are reached through the thread itself
                // and inline files own no blocks.
                Ok(_) | Err(FsError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }

        if pair_is_null(mdir.tail) {
            break;
        }
        pair = mdir.tail;
    }

    for f in files.iter().flatten() {
        if !f.state.intersects(FileState::DIRTY | FileState::WRITING)
            || f.state.contains(FileState::INLINE)
        {
            continue;
        }
        if let BlockRef::Block(_) = f.ctz_head {
            ctz::ctz_traverse(dev, cfg, None, rcache, f.ctz_head, f.ctz_size, &mut |b| cb(b))?;
        }
        if f.state.contains(FileState::WRITING) {
            if let BlockRef::Block(_) = f.block {
                ctz::ctz_traverse(dev, cfg, None, rcache, f.block, f.pos, &mut |b| cb(b))?;
            }
        }
    }
    for &(head, size) in inflight {
        if let BlockRef::Block(_) = head {
            ctz::ctz_traverse(dev, cfg, None, rcache, head, size, &mut |b| cb(b))?;
        }
    }

    Ok(())
}

impl<D: BlockDevice> Fs<D> {
    fn bare(dev: Arc<D>, cfg: Config) -> Self {
        Fs {
            rcache: BlockCache::new(cfg.cache_size),
            pcache: BlockCache::new(cfg.cache_size),
            root: PAIR_NULL,
            gstate: Gstate::default(),
            gdisk: Gstate::default(),
            lookahead: Lookahead::new(cfg.lookahead_size, cfg.block_count),
            seed: 0,
            files: Vec::new(),
            dirs: Vec::new(),
            inflight: Vec::new(),
            needs_superblock_rewrite: false,
            disk_version: DISK_VERSION,
            dev,
            cfg,
        }
    }

    /// Writes a fresh filesystem: the superblock pair at {0, 1} with a
    /// soft tail to a newly allocated empty root directory.
    pub fn format(dev: Arc<D>, cfg: Config) -> Result<()> {
        cfg.validate()?;
        if cfg.block_count < 4 {
            return Err(FsError::Invalid);
        }
        let locked = dev.clone();
        let _guard = DeviceLock::acquire(locked.as_ref())?;

        let mut fs = Fs::bare(dev, cfg);
        fs.lookahead.reset(0, fs.cfg.block_count);
        fs.lookahead.mark(fs.cfg.block_count, 0);
        fs.lookahead.mark(fs.cfg.block_count, 1);

        // Stale data in the superblock blocks must not shadow the new log.
        {
            let Fs { dev, cfg, pcache, rcache, .. } = &mut fs;
            cache::bd_erase(dev.as_ref(), cfg, pcache, rcache, 0)?;
            cache::bd_erase(dev.as_ref(), cfg, pcache, rcache, 1)?;
        }

        let mut root = metadata::dir_alloc(&mut fs)?;
        metadata::dir_commit_raw(&mut fs, &mut root, &[])?;

        let mut sb = Mdir {
            pair: [0, 1],
            rev: 0,
            off: 0,
            etag: Tag(0xffff_ffff),
            count: 0,
            erased: false,
            split: false,
            tail: PAIR_NULL,
            crc_seed: 0,
        };
        let attrs = [
            Attr::create(0),
            Attr::new(Tag::new(TYPE_SUPERBLOCK, 0, MAGIC.len() as u16), MAGIC.to_vec()),
            Attr::new(Tag::new(TYPE_INLINESTRUCT, 0, 24), sb_payload(&fs.cfg)),
            Attr::new(Tag::new(TYPE_SOFTTAIL, ID_NONE, 8), pair_to_bytes(root.pair).to_vec()),
        ];
        metadata::dir_commit_raw(&mut fs, &mut sb, &attrs)?;

        // Read it back before declaring the device formatted.
        let check = fs.fetch_pair([0, 1])?;
        let (_, magic) = metadata::dir_get(
            fs.dev.as_ref(),
            &fs.cfg,
            None,
            &mut fs.rcache,
            &fs.gdisk,
            &check,
            MASK_ALL,
            Tag::new(TYPE_SUPERBLOCK, 0, 0),
        )?;
        if magic != MAGIC {
            return Err(FsError::Corrupt);
        }

        let Fs { dev, cfg, pcache, rcache, .. } = &mut fs;
        cache::bd_sync(dev.as_ref(), cfg, pcache, rcache)?;
        log::debug!("formatted {} blocks of {} bytes", fs.cfg.block_count, fs.cfg.block_size);
        Ok(())
    }

    /// Mounts an existing filesystem, validating the superblock and
    /// reconstructing the global state from the directory thread.
    pub fn mount(dev: Arc<D>, cfg: Config) -> Result<Self> {
        cfg.validate()?;
        let locked = dev.clone();
        let _guard = DeviceLock::acquire(locked.as_ref())?;

        let mut fs = Fs::bare(dev, cfg);
        let autodetect = fs.cfg.block_count == 0;
        if autodetect {
            // Until the superblock tells us the geometry, trust reads to
            // stay within blocks 0 and 1.
            fs.cfg.block_count = 2;
        }

        let sb = fs.fetch_pair([0, 1])?;
        let magic = metadata::dir_get(
            fs.dev.as_ref(),
            &fs.cfg,
            None,
            &mut fs.rcache,
            &fs.gdisk,
            &sb,
            MASK_ALL,
            Tag::new(TYPE_SUPERBLOCK, 0, 0),
        );
        match magic {
            Ok((_, m)) if m == MAGIC => {}
            Ok(_) | Err(FsError::NotFound) => return Err(FsError::Corrupt),
            Err(e) => return Err(e),
        }

        let (_, payload) = metadata::dir_get(
            fs.dev.as_ref(),
            &fs.cfg,
            None,
            &mut fs.rcache,
            &fs.gdisk,
            &sb,
            MASK_ALL,
            Tag::new(TYPE_INLINESTRUCT, 0, 0),
        )?;
        if payload.len() != 24 {
            return Err(FsError::Corrupt);
        }
        let word = |i: usize| -> Result<u32> {
            Ok(u32::from_le_bytes(
                payload[4 * i..4 * i + 4].try_into().map_err(|_| FsError::Corrupt)?,
            ))
        };
        let version = word(0)?;
        let block_size = word(1)?;
        let block_count = word(2)?;
        let name_max = word(3)?;
        let file_max = word(4)?;
        let attr_max = word(5)?;

        if disk_version_major(version) != disk_version_major(DISK_VERSION)
            || disk_version_minor(version) > disk_version_minor(DISK_VERSION)
        {
            log::error!("incompatible disk version {version:#010x}");
            return Err(FsError::Invalid);
        }
        if disk_version_minor(version) < disk_version_minor(DISK_VERSION) {
            log::debug!("older minor version {version:#010x}, superblock upgrade pending");
            fs.needs_superblock_rewrite = true;
        }
        fs.disk_version = version;

        if block_size != fs.cfg.block_size {
            return Err(FsError::Invalid);
        }
        if !autodetect && fs.cfg.block_count != block_count {
            return Err(FsError::Invalid);
        }
        fs.cfg.block_count = block_count;

        if name_max > fs.cfg.name_limit()
            || file_max > fs.cfg.file_limit()
            || attr_max > fs.cfg.attr_limit()
        {
            return Err(FsError::Invalid);
        }
        fs.cfg.name_max = name_max;
        fs.cfg.file_max = file_max;
        fs.cfg.attr_max = attr_max;

        if pair_is_null(sb.tail) || sb.split {
            return Err(FsError::Corrupt);
        }
        fs.root = sb.tail;

        // Walk the whole thread: accumulate the on-disk global state and
        // seed entropy, and reject tail cycles (Brent's algorithm).
        let mut gdisk = Gstate::default();
        let mut seed = 0u32;
        let mut cursor = sb;
        let mut tortoise: Pair = PAIR_NULL;
        let mut power = 1u32;
        let mut lam = 0u32;
        loop {
            seed ^= cursor.crc_seed;
            let contrib = metadata::dir_contribution(
                fs.dev.as_ref(),
                &fs.cfg,
                None,
                &mut fs.rcache,
                &cursor,
            )?;
            gdisk.xor(contrib);

            if pair_is_null(cursor.tail) {
                break;
            }
            if pair_sync(cursor.tail, tortoise) {
                log::error!("cycle detected in directory thread");
                return Err(FsError::Corrupt);
            }
            lam += 1;
            if lam == power {
                tortoise = cursor.pair;
                power = power.saturating_mul(2);
                lam = 0;
            }
            cursor = fs.fetch_pair(cursor.tail)?;
        }
        fs.gdisk = gdisk;
        fs.gstate = gdisk;
        if fs.gstate.has_move() || fs.gstate.orphans() > 0 {
            log::warn!("unclean shutdown detected, recovery deferred to first write");
        }

        fs.seed = seed;
        fs.lookahead = Lookahead::new(fs.cfg.lookahead_size, fs.cfg.block_count);
        fs.lookahead.reset(seed % fs.cfg.block_count, fs.cfg.block_count);
        // A fresh window claims every block free until in-use blocks are
        // marked into it.
        {
            let Fs { dev, cfg, rcache, gdisk, files, inflight, lookahead, .. } = &mut fs;
            let block_count = cfg.block_count;
            traverse_raw(dev.as_ref(), cfg, rcache, gdisk, files, inflight, &mut |b| {
                lookahead.mark(block_count, b);
                Ok(())
            })?;
        }

        log::debug!(
            "mounted: {} blocks of {} bytes, root [{}, {}]",
            fs.cfg.block_count,
            fs.cfg.block_size,
            fs.root[0],
            fs.root[1]
        );
        Ok(fs)
    }

    /// Releases the filesystem. Fails (and drops the session) if any
    /// handle is still open.
    pub fn unmount(mut self) -> Result<()> {
        let dev = self.dev.clone();
        let _guard = DeviceLock::acquire(dev.as_ref())?;
        if self.files.iter().any(Option::is_some) || self.dirs.iter().any(Option::is_some) {
            return Err(FsError::Invalid);
        }
        let Fs { dev, cfg, pcache, rcache, .. } = &mut self;
        cache::bd_sync(dev.as_ref(), cfg, pcache, rcache)
    }

    // ---- allocator ----------------------------------------------------

    /// Records the chains of a handle currently outside the arena so an
    /// allocator rescan cannot hand its blocks out.
    pub(crate) fn protect(&mut self, f: &FileHandle) {
        self.inflight.clear();
        self.inflight.push((f.ctz_head, f.ctz_size));
        if f.state.contains(FileState::WRITING) {
            self.inflight.push((f.block, f.pos));
        }
    }

    pub(crate) fn alloc(&mut self) -> Result<u32> {
        loop {
            if let Some(block) = self.lookahead.next_free(self.cfg.block_count) {
                return Ok(block);
            }
            if self.lookahead.exhausted() {
                log::error!("no free blocks");
                return Err(FsError::NoSpace);
            }
            self.lookahead.advance(self.cfg.block_count);
            log::debug!("allocator rescan, window start {}", self.lookahead.start);
            let Fs { dev, cfg, rcache, gdisk, files, inflight, lookahead, .. } = self;
            let block_count = cfg.block_count;
            traverse_raw(dev.as_ref(), cfg, rcache, gdisk, files, inflight, &mut |b| {
                lookahead.mark(block_count, b);
                Ok(())
            })?;
        }
    }

    // ---- commits and relocation fix-ups -------------------------------

    pub(crate) fn fetch_pair(&mut self, pair: Pair) -> Result<Mdir> {
        metadata::dir_fetch(self.dev.as_ref(), &self.cfg, None, &mut self.rcache, pair)
    }

    // Follows freshly chained tails until `id` falls inside `mdir`,
    // re-aiming a (pair, id) reference after a compaction split moved the
    // upper ids onto a new pair.
    fn chase_split(&mut self, mdir: &mut Mdir, id: &mut u16) -> Result<()> {
        while *id >= mdir.count && mdir.split {
            *id -= mdir.count;
            *mdir = self.fetch_pair(mdir.tail)?;
        }
        Ok(())
    }

    fn update_handles(
        &mut self,
        opair: Pair,
        mdir: &Mdir,
        attrs: &[Attr],
        fix_splices: bool,
    ) -> Result<()> {
        for i in 0..self.files.len() {
            let Some(mut f) = self.files[i].take() else { continue };
            if pair_sync(f.mdir.pair, opair) || pair_sync(f.mdir.pair, mdir.pair) {
                f.mdir = mdir.clone();
                if fix_splices {
                    for attr in attrs {
                        if attr.tag.class() != CLASS_SPLICE {
                            continue;
                        }
                        if attr.tag.typ() == TYPE_CREATE {
                            if f.id >= attr.tag.id() {
                                f.id += 1;
                            }
                        } else if f.id == attr.tag.id() {
                            f.removed = true;
                        } else if f.id > attr.tag.id() {
                            f.id -= 1;
                        }
                    }
                }
                let chased =
                    if f.removed { Ok(()) } else { self.chase_split(&mut f.mdir, &mut f.id) };
                self.files[i] = Some(f);
                chased?;
            } else {
                self.files[i] = Some(f);
            }
        }
        for i in 0..self.dirs.len() {
            let Some(mut d) = self.dirs[i].take() else { continue };
            if pair_sync(d.head, opair) {
                d.head = mdir.pair;
            }
            if pair_sync(d.mdir.pair, opair) || pair_sync(d.mdir.pair, mdir.pair) {
                d.mdir = mdir.clone();
                if fix_splices {
                    for attr in attrs {
                        if attr.tag.class() != CLASS_SPLICE {
                            continue;
                        }
                        if attr.tag.typ() == TYPE_CREATE {
                            if attr.tag.id() < d.id {
                                d.id += 1;
                                d.pos += 1;
                            }
                        } else if attr.tag.id() < d.id {
                            d.id -= 1;
                            d.pos -= 1;
                        }
                    }
                }
                // An iteration point parked at the pair's end stays there
                // unless a split pushed more ids behind a new tail.
                let chased = self.chase_split(&mut d.mdir, &mut d.id);
                self.dirs[i] = Some(d);
                chased?;
            } else {
                self.dirs[i] = Some(d);
            }
        }
        if pair_sync(self.root, opair) {
            self.root = mdir.pair;
        }
        Ok(())
    }

    fn commit_inner(
        &mut self,
        mdir: &mut Mdir,
        attrs: &[Attr],
        fix_splices: bool,
    ) -> Result<Option<Pair>> {
        let opair = mdir.pair;
        let reloc = metadata::dir_commit_raw(self, mdir, attrs)?;
        self.update_handles(opair, mdir, attrs, fix_splices)?;
        Ok(reloc)
    }

    pub(crate) fn commit(&mut self, mdir: &mut Mdir, attrs: &[Attr]) -> Result<()> {
        self.commit_opts(mdir, attrs, true)
    }

    fn commit_opts(&mut self, mdir: &mut Mdir, attrs: &[Attr], fix_splices: bool) -> Result<()> {
        let reloc = self.commit_inner(mdir, attrs, fix_splices)?;
        if let Some(old) = reloc {
            self.fix_relocation(old, mdir.pair)?;
        }
        Ok(())
    }

    // Re-points the parent entry and the predecessor tail at a pair's new
    // address. Fix-up commits may themselves relocate, so this runs a
    // bounded work list rather than recursing.
    fn fix_relocation(&mut self, old: Pair, new: Pair) -> Result<()> {
        let mut work = vec![(old, new)];
        let mut steps = 0u32;
        while let Some((old, new)) = work.pop() {
            steps += 1;
            if steps > self.cfg.block_count.max(16) {
                return Err(FsError::Corrupt);
            }
            log::debug!(
                "fixing references: pair [{}, {}] moved to [{}, {}]",
                old[0],
                old[1],
                new[0],
                new[1]
            );
            if pair_sync(self.root, old) {
                self.root = new;
            }

            let parent = self.find_parent(old, new)?;
            let had_parent = parent.is_some();
            if let Some((mut pmdir, id)) = parent {
                // Until the predecessor is fixed too, the thread and the
                // tree disagree; flag it so a crash here is recoverable.
                self.gstate.add_orphans(1);
                let attrs = [Attr::new(
                    Tag::new(TYPE_DIRSTRUCT, id, 8),
                    pair_to_bytes(new).to_vec(),
                )];
                if let Some(o) = self.commit_inner(&mut pmdir, &attrs, true)? {
                    work.push((o, pmdir.pair));
                }
            }

            if let Some(mut pred) = self.find_pred(old)? {
                if had_parent {
                    self.gstate.add_orphans(-1);
                }
                let typ = if pred.split { TYPE_HARDTAIL } else { TYPE_SOFTTAIL };
                let attrs = [Attr::new(Tag::new(typ, ID_NONE, 8), pair_to_bytes(new).to_vec())];
                if let Some(o) = self.commit_inner(&mut pred, &attrs, true)? {
                    work.push((o, pred.pair));
                }
            } else if had_parent {
                self.gstate.add_orphans(-1);
            }
        }
        Ok(())
    }

    // Finds the directory entry whose pair references `pair` (sharing at
    // least one block), skipping entries already pointing at `new`.
    fn find_parent(&mut self, pair: Pair, new: Pair) -> Result<Option<(Mdir, u16)>> {
        let mut cursor: Pair = [0, 1];
        let mut steps = 0u32;
        loop {
            steps += 1;
            if steps > self.cfg.block_count / 2 + 1 {
                return Err(FsError::Corrupt);
            }
            let mdir = self.fetch_pair(cursor)?;
            for id in 0..mdir.count {
                let got = metadata::dir_get(
                    self.dev.as_ref(),
                    &self.cfg,
                    None,
                    &mut self.rcache,
                    &self.gdisk,
                    &mdir,
                    MASK_CLASS,
                    Tag::new(TYPE_DIRSTRUCT, id, 0),
                );
                match got {
                    Ok((tag, data)) if tag.typ() == TYPE_DIRSTRUCT && data.len() == 8 => {
                        let p = pair_from_bytes(&data);
                        if pair_touches(p, pair) && !pair_sync(p, new) {
                            return Ok(Some((mdir, id)));
                        }
                    }
                    Ok(_) | Err(FsError::NotFound) => {}
                    Err(e) => return Err(e),
                }
            }
            if pair_is_null(mdir.tail) {
                return Ok(None);
            }
            cursor = mdir.tail;
        }
    }

    // Unthreads a dropped pair: its tail is committed into the
    // predecessor, and its global-state contribution is folded back into
    // the delta so the commit re-emits it.
    fn drop_pair(&mut self, pred: &mut Mdir, dropped: &Mdir) -> Result<()> {
        let contrib = metadata::dir_contribution(
            self.dev.as_ref(),
            &self.cfg,
            None,
            &mut self.rcache,
            dropped,
        )?;
        self.gdisk.xor(contrib);
        let typ = if dropped.split { TYPE_HARDTAIL } else { TYPE_SOFTTAIL };
        let attrs = [Attr::new(
            Tag::new(typ, ID_NONE, 8),
            pair_to_bytes(dropped.tail).to_vec(),
        )];
        self.commit(pred, &attrs)
    }

    // Finds the pair whose tail references `pair`.
    fn find_pred(&mut self, pair: Pair) -> Result<Option<Mdir>> {
        if pair_sync(pair, [0, 1]) {
            return Ok(None);
        }
        let mut cursor: Pair = [0, 1];
        let mut steps = 0u32;
        loop {
            steps += 1;
            if steps > self.cfg.block_count / 2 + 1 {
                return Err(FsError::Corrupt);
            }
            let mdir = self.fetch_pair(cursor)?;
            if pair_is_null(mdir.tail) {
                return Ok(None);
            }
            if pair_touches(mdir.tail, pair) {
                return Ok(Some(mdir));
            }
            cursor = mdir.tail;
        }
    }

    // ---- consistency --------------------------------------------------

    /// Brings the on-disk state back to full consistency and renews the
    /// allocator checkpoint. Every mutating operation runs this first.
    pub(crate) fn prep_write(&mut self) -> Result<()> {
        if self.needs_superblock_rewrite {
            self.rewrite_superblock()?;
            self.needs_superblock_rewrite = false;
            self.disk_version = DISK_VERSION;
        }
        self.demove()?;
        self.deorphan()?;
        self.lookahead.ckpoint_reset(self.cfg.block_count);
        Ok(())
    }

    fn rewrite_superblock(&mut self) -> Result<()> {
        let mut sb = self.fetch_pair([0, 1])?;
        let attrs = [Attr::new(Tag::new(TYPE_INLINESTRUCT, 0, 24), sb_payload(&self.cfg))];
        self.commit(&mut sb, &attrs)
    }

    // Completes an interrupted cross-directory rename: the destination
    // entry landed, so the stale source entry (already hidden from reads)
    // gets its physical delete.
    fn demove(&mut self) -> Result<()> {
        if !self.gdisk.has_move() {
            return Ok(());
        }
        let pair = self.gdisk.move_pair();
        let id = self.gdisk.move_id();
        log::debug!("completing interrupted move: pair [{}, {}] id {id}", pair[0], pair[1]);
        let mut mdir = self.fetch_pair(pair)?;
        self.gstate.clear_move();
        // Open handles already see the post-move numbering, so the splice
        // must not shift them again.
        self.commit_opts(&mut mdir, &[Attr::delete(id)], false)
    }

    // Collects directories left unreachable (interrupted remove or mkdir)
    // and re-synchronizes tails with parent entries after an interrupted
    // relocation. Parent entries are authoritative: relocation updates
    // them before the predecessor tail.
    fn deorphan(&mut self) -> Result<()> {
        if self.gstate.orphans() == 0 {
            return Ok(());
        }
        log::debug!("collecting orphans");
        let mut fixed = true;
        while fixed {
            fixed = false;
            let mut pdir = self.fetch_pair([0, 1])?;
            let mut steps = 0u32;
            while !pair_is_null(pdir.tail) {
                steps += 1;
                if steps > self.cfg.block_count {
                    return Err(FsError::Corrupt);
                }
                if !pdir.split && !pair_sync(pdir.tail, self.root) {
                    let tpair = pdir.tail;
                    match self.find_parent(tpair, PAIR_NULL)? {
                        None => {
                            log::debug!("dropping orphan [{}, {}]", tpair[0], tpair[1]);
                            let tmdir = self.fetch_pair(tpair)?;
                            self.drop_pair(&mut pdir, &tmdir)?;
                            fixed = true;
                            continue;
                        }
                        Some((pmdir, id)) => {
                            let (_, data) = metadata::dir_get(
                                self.dev.as_ref(),
                                &self.cfg,
                                None,
                                &mut self.rcache,
                                &self.gdisk,
                                &pmdir,
                                MASK_CLASS,
                                Tag::new(TYPE_DIRSTRUCT, id, 0),
                            )?;
                            let ppair = pair_from_bytes(&data);
                            if !pair_sync(ppair, tpair) {
                                log::debug!(
                                    "resyncing tail [{}, {}] -> [{}, {}]",
                                    tpair[0],
                                    tpair[1],
                                    ppair[0],
                                    ppair[1]
                                );
                                let attrs = [Attr::new(
                                    Tag::new(TYPE_SOFTTAIL, ID_NONE, 8),
                                    pair_to_bytes(ppair).to_vec(),
                                )];
                                self.commit(&mut pdir, &attrs)?;
                                fixed = true;
                                continue;
                            }
                        }
                    }
                }
                pdir = self.fetch_pair(pdir.tail)?;
            }
        }
        let orphans = self.gstate.orphans();
        self.gstate.add_orphans(-(orphans as i32));
        Ok(())
    }

    // ---- path resolution ----------------------------------------------

    fn find_in_dir(&mut self, head: Pair, name: &str) -> Result<Found> {
        let mut pair = head;
        loop {
            let mdir = self.fetch_pair(pair)?;
            let found = metadata::dir_find_name(
                self.dev.as_ref(),
                &self.cfg,
                None,
                &mut self.rcache,
                &self.gdisk,
                &mdir,
                name,
            );
            match found {
                Ok((id, tag)) => return Ok(Found { mdir, entry: Some((id, tag)) }),
                Err(FsError::NotFound) => {
                    if mdir.split {
                        pair = mdir.tail;
                    } else {
                        return Ok(Found { mdir, entry: None });
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn find_dir_pair(&mut self, comps: &[&str]) -> Result<Pair> {
        let mut pair = self.root;
        for name in comps {
            let found = self.find_in_dir(pair, name)?;
            let Some((id, tag)) = found.entry else {
                return Err(FsError::NotFound);
            };
            if tag.typ() != TYPE_DIR {
                return Err(FsError::NotDir);
            }
            let (_, data) = metadata::dir_get(
                self.dev.as_ref(),
                &self.cfg,
                None,
                &mut self.rcache,
                &self.gdisk,
                &found.mdir,
                MASK_CLASS,
                Tag::new(TYPE_DIRSTRUCT, id, 0),
            )?;
            if data.len() != 8 {
                return Err(FsError::Corrupt);
            }
            pair = pair_from_bytes(&data);
        }
        Ok(pair)
    }

    fn locate(&mut self, path: &str) -> Result<Located> {
        let comps = path::components(path)?;
        let Some((name, parent)) = comps.split_last() else {
            return Ok(Located::Root);
        };
        let head = self.find_dir_pair(parent)?;
        let found = self.find_in_dir(head, name)?;
        match found.entry {
            Some((id, tag)) => Ok(Located::Entry { mdir: found.mdir, id, tag }),
            None => Err(FsError::NotFound),
        }
    }

    fn entry_pair(&mut self, mdir: &Mdir, id: u16) -> Result<Pair> {
        let (tag, data) = metadata::dir_get(
            self.dev.as_ref(),
            &self.cfg,
            None,
            &mut self.rcache,
            &self.gdisk,
            mdir,
            MASK_CLASS,
            Tag::new(TYPE_DIRSTRUCT, id, 0),
        )?;
        if tag.typ() != TYPE_DIRSTRUCT || data.len() != 8 {
            return Err(FsError::Corrupt);
        }
        Ok(pair_from_bytes(&data))
    }

    // ---- namespace operations ------------------------------------------

    pub fn stat(&mut self, path: &str) -> Result<Info> {
        let dev = self.dev.clone();
        let _guard = DeviceLock::acquire(dev.as_ref())?;
        match self.locate(path)? {
            Located::Root => Ok(Info { name: "/".into(), file_type: FileType::Dir, size: 0 }),
            Located::Entry { mdir, id, .. } => directory::entry_info(self, &mdir, id),
        }
    }

    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        let dev = self.dev.clone();
        let _guard = DeviceLock::acquire(dev.as_ref())?;
        self.prep_write()?;

        let (parent, name) = path::split_parent(path)?;
        path::check_name(name, self.cfg.name_limit())?;
        let head = self.find_dir_pair(&parent)?;
        let found = self.find_in_dir(head, name)?;
        if found.entry.is_some() {
            return Err(FsError::Exists);
        }
        // The search ended on the last pair of the chain, which is where
        // both the entry and the thread link land, in one commit.
        let mut cwd = found.mdir;

        let mut dir = metadata::dir_alloc(self)?;
        let mut dir_attrs = Vec::new();
        if !pair_is_null(cwd.tail) {
            dir_attrs.push(Attr::new(
                Tag::new(TYPE_SOFTTAIL, ID_NONE, 8),
                pair_to_bytes(cwd.tail).to_vec(),
            ));
        }
        metadata::dir_commit_raw(self, &mut dir, &dir_attrs)?;

        let id = cwd.count;
        let attrs = [
            Attr::create(id),
            Attr::new(Tag::new(TYPE_DIR, id, name.len() as u16), name.as_bytes().to_vec()),
            Attr::new(Tag::new(TYPE_DIRSTRUCT, id, 8), pair_to_bytes(dir.pair).to_vec()),
            Attr::new(Tag::new(TYPE_SOFTTAIL, ID_NONE, 8), pair_to_bytes(dir.pair).to_vec()),
        ];
        self.commit(&mut cwd, &attrs)
    }

    pub fn remove(&mut self, path: &str) -> Result<()> {
        let dev = self.dev.clone();
        let _guard = DeviceLock::acquire(dev.as_ref())?;
        self.prep_write()?;

        let Located::Entry { mdir: mut cwd, id, tag } = self.locate(path)? else {
            return Err(FsError::Invalid);
        };

        if tag.typ() != TYPE_DIR {
            return self.commit(&mut cwd, &[Attr::delete(id)]);
        }

        let dpair = self.entry_pair(&cwd, id)?;
        let dmdir = self.fetch_pair(dpair)?;
        if dmdir.count != 0 || dmdir.split {
            return Err(FsError::NotEmpty);
        }
        if self.dirs.iter().flatten().any(|d| pair_sync(d.head, dpair)) {
            return Err(FsError::Invalid);
        }

        // Delete the entry first; until the pair is unthreaded below it
        // is a flagged orphan.
        self.gstate.add_orphans(1);
        self.commit(&mut cwd, &[Attr::delete(id)])?;

        let mut pred = self.find_pred(dpair)?.ok_or(FsError::Corrupt)?;
        self.gstate.add_orphans(-1);
        self.drop_pair(&mut pred, &dmdir)
    }

    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        let dev = self.dev.clone();
        let _guard = DeviceLock::acquire(dev.as_ref())?;
        self.prep_write()?;

        let Located::Entry { mdir: oldcwd, id: oldid, tag: oldtag } = self.locate(from)? else {
            return Err(FsError::Invalid);
        };
        let (parent, name) = path::split_parent(to)?;
        path::check_name(name, self.cfg.name_limit())?;
        let head = self.find_dir_pair(&parent)?;
        let found = self.find_in_dir(head, name)?;
        let mut newcwd = found.mdir;

        let samepair = pair_sync(oldcwd.pair, newcwd.pair);
        let mut dest_drop: Option<Pair> = None;
        let (newid, exists) = match found.entry {
            Some((nid, ntag)) => {
                if samepair && nid == oldid {
                    return Ok(());
                }
                if ntag.typ() != oldtag.typ() {
                    return Err(if ntag.typ() == TYPE_DIR {
                        FsError::IsDir
                    } else {
                        FsError::NotDir
                    });
                }
                if ntag.typ() == TYPE_DIR {
                    let dpair = self.entry_pair(&newcwd, nid)?;
                    let dmdir = self.fetch_pair(dpair)?;
                    if dmdir.count != 0 || dmdir.split {
                        return Err(FsError::NotEmpty);
                    }
                    if self.dirs.iter().flatten().any(|d| pair_sync(d.head, dpair)) {
                        return Err(FsError::Invalid);
                    }
                    dest_drop = Some(dpair);
                }
                (nid, true)
            }
            None => (newcwd.count, false),
        };

        let src_attrs = metadata::dir_entry_attrs(
            self.dev.as_ref(),
            &self.cfg,
            &mut self.rcache,
            &oldcwd,
            oldid,
        )?;

        let mut attrs = Vec::new();
        if exists {
            attrs.push(Attr::delete(newid));
        }
        attrs.push(Attr::create(newid));
        attrs.push(Attr::new(
            Tag::new(oldtag.typ(), newid, name.len() as u16),
            name.as_bytes().to_vec(),
        ));
        for a in &src_attrs {
            attrs.push(Attr::new(a.tag.with_id(newid), a.data.clone()));
        }

        if dest_drop.is_some() {
            self.gstate.add_orphans(1);
        }

        if samepair {
            let mut delid = oldid;
            if !exists && oldid >= newid {
                delid += 1;
            }
            attrs.push(Attr::delete(delid));
            self.commit(&mut newcwd, &attrs)?;
        } else {
            // Cross-directory: flag the source entry as pending-moved so
            // a crash between the two commits leaves exactly one of the
            // names visible.
            self.gstate.set_move(oldcwd.pair, oldid);
            self.commit(&mut newcwd, &attrs)?;
            self.gstate.clear_move();
            let mut src = self.fetch_pair(oldcwd.pair)?;
            self.commit(&mut src, &[Attr::delete(oldid)])?;
        }

        if let Some(dpair) = dest_drop {
            let dmdir = self.fetch_pair(dpair)?;
            let mut pred = self.find_pred(dpair)?.ok_or(FsError::Corrupt)?;
            self.gstate.add_orphans(-1);
            self.drop_pair(&mut pred, &dmdir)?;
        }
        Ok(())
    }

    // ---- user attributes ------------------------------------------------

    fn locate_attr_target(&mut self, path: &str) -> Result<(Mdir, u16)> {
        match self.locate(path)? {
            // Root attributes live on the superblock entry.
            Located::Root => Ok((self.fetch_pair([0, 1])?, 0)),
            Located::Entry { mdir, id, .. } => Ok((mdir, id)),
        }
    }

    /// Reads a user attribute into `buf`, returning the attribute's full
    /// size (which may exceed the buffer).
    pub fn getattr(&mut self, path: &str, typ: u8, buf: &mut [u8]) -> Result<u32> {
        let dev = self.dev.clone();
        let _guard = DeviceLock::acquire(dev.as_ref())?;
        let (mdir, id) = self.locate_attr_target(path)?;
        let got = metadata::dir_getslice(
            self.dev.as_ref(),
            &self.cfg,
            None,
            &mut self.rcache,
            &self.gdisk,
            &mdir,
            MASK_ALL,
            Tag::new(TYPE_USERATTR | typ as u16, id, 0),
            0,
            buf,
        );
        match got {
            Ok((tag, _)) => Ok(tag.size() as u32),
            Err(FsError::NotFound) => Err(FsError::NoAttr),
            Err(e) => Err(e),
        }
    }

    pub fn setattr(&mut self, path: &str, typ: u8, value: &[u8]) -> Result<()> {
        let dev = self.dev.clone();
        let _guard = DeviceLock::acquire(dev.as_ref())?;
        if value.len() as u32 > self.cfg.attr_limit() {
            return Err(FsError::NoSpace);
        }
        self.prep_write()?;
        let (mut mdir, id) = self.locate_attr_target(path)?;
        let attrs = [Attr::new(
            Tag::new(TYPE_USERATTR | typ as u16, id, value.len() as u16),
            value.to_vec(),
        )];
        self.commit(&mut mdir, &attrs)
    }

    pub fn removeattr(&mut self, path: &str, typ: u8) -> Result<()> {
        let dev = self.dev.clone();
        let _guard = DeviceLock::acquire(dev.as_ref())?;
        self.prep_write()?;
        let (mut mdir, id) = self.locate_attr_target(path)?;
        self.commit(&mut mdir, &[Attr::remove(TYPE_USERATTR | typ as u16, id)])
    }

    // ---- files -----------------------------------------------------------

    pub fn open(&mut self, path: &str, flags: OpenFlags) -> Result<FileId> {
        self.open_with(path, flags, &[])
    }

    /// Opens a file with user attributes that will be committed on every
    /// sync.
    pub fn open_with(
        &mut self,
        path: &str,
        flags: OpenFlags,
        attrs: &[(u8, Vec<u8>)],
    ) -> Result<FileId> {
        let dev = self.dev.clone();
        let _guard = DeviceLock::acquire(dev.as_ref())?;
        if !flags.readable() && !flags.writable() {
            return Err(FsError::Invalid);
        }
        if flags.contains(OpenFlags::CREAT) {
            self.prep_write()?;
        }

        let (parent, name) = path::split_parent(path)?;
        let head = self.find_dir_pair(&parent)?;
        let found = self.find_in_dir(head, name)?;

        let (mdir, id) = match found.entry {
            Some((id, tag)) => {
                if flags.contains(OpenFlags::CREAT) && flags.contains(OpenFlags::EXCL) {
                    return Err(FsError::Exists);
                }
                if tag.typ() == TYPE_DIR {
                    return Err(FsError::IsDir);
                }
                (found.mdir, id)
            }
            None => {
                if !flags.contains(OpenFlags::CREAT) {
                    return Err(FsError::NotFound);
                }
                path::check_name(name, self.cfg.name_limit())?;
                let mut cwd = found.mdir;
                let id = cwd.count;
                let new = [
                    Attr::create(id),
                    Attr::new(
                        Tag::new(TYPE_REG, id, name.len() as u16),
                        name.as_bytes().to_vec(),
                    ),
                    Attr::new(Tag::new(TYPE_INLINESTRUCT, id, 0), Vec::new()),
                ];
                self.commit(&mut cwd, &new)?;
                // The commit may have compacted and split the pair,
                // pushing the new entry onto a chained tail.
                let mut id = id;
                self.chase_split(&mut cwd, &mut id)?;
                (cwd, id)
            }
        };

        if self
            .files
            .iter()
            .flatten()
            .any(|f| pair_sync(f.mdir.pair, mdir.pair) && f.id == id)
        {
            return Err(FsError::Invalid);
        }

        let mut f = FileHandle {
            mdir,
            id,
            flags,
            state: FileState::empty(),
            pos: 0,
            ctz_head: BlockRef::Null,
            ctz_size: 0,
            block: BlockRef::Null,
            off: 0,
            cache: BlockCache::new(self.cfg.cache_size),
            attrs: attrs.to_vec(),
            removed: false,
        };

        let (stag, data) = metadata::dir_get(
            self.dev.as_ref(),
            &self.cfg,
            None,
            &mut self.rcache,
            &self.gdisk,
            &f.mdir,
            MASK_CLASS,
            Tag::new(TYPE_DIRSTRUCT, id, 0),
        )?;
        match stag.typ() {
            TYPE_INLINESTRUCT => {
                if f.cache.buffer.len() < data.len() {
                    f.cache.buffer.resize(data.len(), 0);
                }
                f.cache.buffer[..data.len()].copy_from_slice(&data);
                f.cache.block = BlockRef::Inline;
                f.ctz_size = data.len() as u32;
                f.state.insert(FileState::INLINE);
            }
            TYPE_CTZSTRUCT if data.len() == 8 => {
                let h = u32::from_le_bytes(data[0..4].try_into().map_err(|_| FsError::Corrupt)?);
                let s = u32::from_le_bytes(data[4..8].try_into().map_err(|_| FsError::Corrupt)?);
                f.ctz_head = if s == 0 { BlockRef::Null } else { BlockRef::Block(h) };
                f.ctz_size = s;
            }
            _ => return Err(FsError::Corrupt),
        }

        if flags.contains(OpenFlags::TRUNC) && flags.writable() && f.ctz_size > 0 {
            f.ctz_head = BlockRef::Null;
            f.ctz_size = 0;
            f.cache.drop_cache();
            f.cache.block = BlockRef::Inline;
            f.state = FileState::INLINE | FileState::DIRTY;
        }

        Ok(FileId(self.insert_file(f)))
    }

    fn insert_file(&mut self, f: FileHandle) -> usize {
        if let Some(i) = self.files.iter().position(Option::is_none) {
            self.files[i] = Some(f);
            i
        } else {
            self.files.push(Some(f));
            self.files.len() - 1
        }
    }

    fn take_file(&mut self, id: FileId) -> Result<FileHandle> {
        self.files
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or(FsError::BadFile)
    }

    fn with_file<T>(
        &mut self,
        id: FileId,
        op: impl FnOnce(&mut Self, &mut FileHandle) -> Result<T>,
    ) -> Result<T> {
        let dev = self.dev.clone();
        let _guard = DeviceLock::acquire(dev.as_ref())?;
        let mut f = self.take_file(id)?;
        let res = op(self, &mut f);
        self.files[id.0] = Some(f);
        self.inflight.clear();
        res
    }

    pub fn read(&mut self, id: FileId, buf: &mut [u8]) -> Result<usize> {
        self.with_file(id, |fs, f| file::file_read(fs, f, buf))
    }

    pub fn write(&mut self, id: FileId, data: &[u8]) -> Result<usize> {
        self.with_file(id, |fs, f| file::file_write(fs, f, data))
    }

    pub fn seek(&mut self, id: FileId, whence: SeekFrom) -> Result<u32> {
        self.with_file(id, |fs, f| file::file_seek(fs, f, whence))
    }

    pub fn truncate(&mut self, id: FileId, size: u32) -> Result<()> {
        self.with_file(id, |fs, f| file::file_truncate(fs, f, size))
    }

    pub fn rewind(&mut self, id: FileId) -> Result<()> {
        self.seek(id, SeekFrom::Start(0)).map(|_| ())
    }

    pub fn tell(&self, id: FileId) -> Result<u32> {
        let _guard = DeviceLock::acquire(self.dev.as_ref())?;
        let f = self.files.get(id.0).and_then(Option::as_ref).ok_or(FsError::BadFile)?;
        Ok(f.pos)
    }

    pub fn size(&self, id: FileId) -> Result<u32> {
        let _guard = DeviceLock::acquire(self.dev.as_ref())?;
        let f = self.files.get(id.0).and_then(Option::as_ref).ok_or(FsError::BadFile)?;
        Ok(file::file_size(f))
    }

    /// Makes the file durable: completes the in-flight chain and commits
    /// the struct record (plus user attributes) to the parent pair.
    pub fn fsync(&mut self, id: FileId) -> Result<()> {
        let dev = self.dev.clone();
        let _guard = DeviceLock::acquire(dev.as_ref())?;
        self.fsync_inner(id)
    }

    fn fsync_inner(&mut self, id: FileId) -> Result<()> {
        {
            let f = self.files.get(id.0).and_then(Option::as_ref).ok_or(FsError::BadFile)?;
            if f.state.contains(FileState::ERRED) {
                return Err(FsError::BadFile);
            }
            if f.removed || !f.flags.writable() {
                return Ok(());
            }
        }

        // Flush with the handle out of the arena (no commits happen here,
        // so no other handle can go stale).
        let mut f = self.take_file(id)?;
        let res = file::file_flush(self, &mut f);
        if res.is_err() {
            f.state.insert(FileState::ERRED);
        }
        self.files[id.0] = Some(f);
        self.inflight.clear();
        res?;

        // Recovery commits may touch this file's pair; the handle is back
        // in the arena so they keep it coherent.
        self.prep_write()?;

        let (mut mdir, attrs) = {
            let f = self.files.get(id.0).and_then(Option::as_ref).ok_or(FsError::BadFile)?;
            if !f.state.contains(FileState::DIRTY) {
                return Ok(());
            }
            let mut attrs = Vec::new();
            if f.state.contains(FileState::INLINE) {
                attrs.push(Attr::new(
                    Tag::new(TYPE_INLINESTRUCT, f.id, f.ctz_size as u16),
                    f.cache.buffer[..f.ctz_size as usize].to_vec(),
                ));
            } else {
                let head = match f.ctz_head {
                    BlockRef::Block(b) => b,
                    _ if f.ctz_size == 0 => 0xffff_ffff,
                    _ => return Err(FsError::Corrupt),
                };
                let mut buf = [0u8; 8];
                buf[..4].copy_from_slice(&head.to_le_bytes());
                buf[4..].copy_from_slice(&f.ctz_size.to_le_bytes());
                attrs.push(Attr::new(Tag::new(TYPE_CTZSTRUCT, f.id, 8), buf.to_vec()));
            }
            for (t, v) in &f.attrs {
                if v.len() as u32 > self.cfg.attr_limit() {
                    return Err(FsError::NoSpace);
                }
                attrs.push(Attr::new(
                    Tag::new(TYPE_USERATTR | *t as u16, f.id, v.len() as u16),
                    v.clone(),
                ));
            }
            (f.mdir.clone(), attrs)
        };

        let res = self.commit(&mut mdir, &attrs);
        let f = self.files.get_mut(id.0).and_then(Option::as_mut).ok_or(FsError::BadFile)?;
        match res {
            Ok(()) => {
                f.state.remove(FileState::DIRTY);
                Ok(())
            }
            Err(e) => {
                f.state.insert(FileState::ERRED);
                Err(e)
            }
        }
    }

    /// Syncs (unless errored or removed) and releases the handle.
    pub fn close(&mut self, id: FileId) -> Result<()> {
        let dev = self.dev.clone();
        let _guard = DeviceLock::acquire(dev.as_ref())?;
        let erred = {
            let f = self.files.get(id.0).and_then(Option::as_ref).ok_or(FsError::BadFile)?;
            f.state.contains(FileState::ERRED)
        };
        let res = if erred { Ok(()) } else { self.fsync_inner(id) };
        self.files[id.0] = None;
        res
    }

    // ---- directories ----------------------------------------------------

    pub fn opendir(&mut self, path: &str) -> Result<DirId> {
        let dev = self.dev.clone();
        let _guard = DeviceLock::acquire(dev.as_ref())?;
        let comps = path::components(path)?;
        let head = if comps.is_empty() {
            self.root
        } else {
            match self.locate(path)? {
                Located::Root => self.root,
                Located::Entry { mdir, id, tag } => {
                    if tag.typ() != TYPE_DIR {
                        return Err(FsError::NotDir);
                    }
                    self.entry_pair(&mdir, id)?
                }
            }
        };
        let mdir = self.fetch_pair(head)?;
        let d = DirHandle { mdir, head, id: 0, pos: 0 };
        let slot = if let Some(i) = self.dirs.iter().position(Option::is_none) {
            self.dirs[i] = Some(d);
            i
        } else {
            self.dirs.push(Some(d));
            self.dirs.len() - 1
        };
        Ok(DirId(slot))
    }

    fn with_dir<T>(
        &mut self,
        id: DirId,
        op: impl FnOnce(&mut Self, &mut DirHandle) -> Result<T>,
    ) -> Result<T> {
        let dev = self.dev.clone();
        let _guard = DeviceLock::acquire(dev.as_ref())?;
        let mut d = self
            .dirs
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or(FsError::BadFile)?;
        let res = op(self, &mut d);
        self.dirs[id.0] = Some(d);
        res
    }

    /// Returns the next entry, or `None` at the end of the directory.
    pub fn readdir(&mut self, id: DirId) -> Result<Option<Info>> {
        self.with_dir(id, directory::dir_read)
    }

    pub fn dir_seek(&mut self, id: DirId, pos: u32) -> Result<()> {
        self.with_dir(id, |fs, d| directory::dir_seek(fs, d, pos))
    }

    pub fn dir_tell(&self, id: DirId) -> Result<u32> {
        let _guard = DeviceLock::acquire(self.dev.as_ref())?;
        let d = self.dirs.get(id.0).and_then(Option::as_ref).ok_or(FsError::BadFile)?;
        Ok(d.pos)
    }

    pub fn dir_rewind(&mut self, id: DirId) -> Result<()> {
        self.with_dir(id, directory::dir_rewind)
    }

    pub fn closedir(&mut self, id: DirId) -> Result<()> {
        self.dirs
            .get_mut(id.0)
            .and_then(Option::take)
            .map(|_| ())
            .ok_or(FsError::BadFile)
    }

    // ---- whole-filesystem operations -------------------------------------

    fn traverse_inner(&mut self, cb: &mut dyn FnMut(u32) -> Result<()>) -> Result<()> {
        let Fs { dev, cfg, rcache, gdisk, files, inflight, .. } = self;
        traverse_raw(dev.as_ref(), cfg, rcache, gdisk, files, inflight, cb)
    }

    /// Calls `cb` for every block currently in use.
    pub fn traverse(&mut self, mut cb: impl FnMut(u32)) -> Result<()> {
        let dev = self.dev.clone();
        let _guard = DeviceLock::acquire(dev.as_ref())?;
        self.traverse_inner(&mut |b| {
            cb(b);
            Ok(())
        })
    }

    /// Number of blocks currently in use.
    pub fn fs_size(&mut self) -> Result<u32> {
        let mut n = 0u32;
        self.traverse(|_| n += 1)?;
        Ok(n)
    }

    pub fn fs_stat(&self) -> Result<FsInfo> {
        let _guard = DeviceLock::acquire(self.dev.as_ref())?;
        Ok(FsInfo {
            disk_version: self.disk_version,
            block_size: self.cfg.block_size,
            block_count: self.cfg.block_count,
            name_max: self.cfg.name_limit(),
            file_max: self.cfg.file_limit(),
            attr_max: self.cfg.attr_limit(),
        })
    }

    /// Changes the number of blocks the filesystem may use. Growing is
    /// always safe; shrinking requires that a traversal proves no live
    /// block lies at or beyond the new bound.
    pub fn grow(&mut self, block_count: u32) -> Result<()> {
        let dev = self.dev.clone();
        let _guard = DeviceLock::acquire(dev.as_ref())?;
        if block_count == self.cfg.block_count {
            return Ok(());
        }
        if block_count < 4 {
            return Err(FsError::Invalid);
        }
        self.prep_write()?;

        if block_count < self.cfg.block_count {
            let mut max = 0u32;
            self.traverse_inner(&mut |b| {
                max = max.max(b);
                Ok(())
            })?;
            if max >= block_count {
                return Err(FsError::Invalid);
            }
        }

        self.cfg.block_count = block_count;
        self.rewrite_superblock()?;
        let start = self.lookahead.start % block_count;
        self.lookahead = Lookahead::new(self.cfg.lookahead_size, block_count);
        self.lookahead.reset(start, block_count);
        let Fs { dev, cfg, rcache, gdisk, files, inflight, lookahead, .. } = self;
        traverse_raw(dev.as_ref(), cfg, rcache, gdisk, files, inflight, &mut |b| {
            lookahead.mark(block_count, b);
            Ok(())
        })?;
        log::debug!("resized to {block_count} blocks");
        Ok(())
    }

    /// Forces any recovery pending from an unclean shutdown (superblock
    /// upgrade, interrupted move, flagged orphans) to resolve now instead
    /// of on the next write.
    pub fn mkconsistent(&mut self) -> Result<()> {
        let dev = self.dev.clone();
        let _guard = DeviceLock::acquire(dev.as_ref())?;
        self.prep_write()
    }

    /// Opportunistic maintenance: compacts metadata logs past the
    /// configured threshold and repopulates the allocator window.
    pub fn gc(&mut self) -> Result<()> {
        let dev = self.dev.clone();
        let _guard = DeviceLock::acquire(dev.as_ref())?;
        self.prep_write()?;

        let mut pair: Pair = [0, 1];
        let mut steps = 0u32;
        loop {
            steps += 1;
            if steps > self.cfg.block_count / 2 + 1 {
                return Err(FsError::Corrupt);
            }
            let mut mdir = self.fetch_pair(pair)?;
            let next = mdir.tail;
            if mdir.off > self.cfg.compact_limit() {
                log::debug!("gc: compacting pair [{}, {}]", pair[0], pair[1]);
                mdir.erased = false;
                self.commit(&mut mdir, &[])?;
            }
            if pair_is_null(next) {
                break;
            }
            pair = next;
        }

        let start = self.lookahead.start;
        self.lookahead.reset(start, self.cfg.block_count);
        let Fs { dev, cfg, rcache, gdisk, files, inflight, lookahead, .. } = self;
        let block_count = cfg.block_count;
        traverse_raw(dev.as_ref(), cfg, rcache, gdisk, files, inflight, &mut |b| {
            lookahead.mark(block_count, b);
            Ok(())
        })?;
        Ok(())
    }
}
