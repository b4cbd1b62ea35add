//! Metadata pair log engine.
//!
//! Every directory (and the superblock) lives in a metadata pair: two
//! erase blocks holding revisions of a small append-only log of tagged
//! attribute records. One block is active; updates append records to it,
//! each batch sealed by a CRC record that makes the batch atomic. When
//! the log fills, the live attributes are compacted into the other block
//! under an incremented revision and the roles swap. A torn commit is
//! simply a log suffix that fails its CRC and is ignored on the next
//! fetch, so every update is all-or-nothing.
//!
//! Compaction that still does not fit splits the directory across a
//! second pair linked by a hard tail. Blocks that fail post-write
//! verification, or that hit the configured erase-cycle budget, cause
//! the pair to relocate to freshly allocated blocks; the caller then
//! re-points the parent entry and predecessor tail.

use std::collections::BTreeMap;

use crate::block_dev::BlockDevice;
use crate::cache::{self, BlockCache, BlockRef};
use crate::config::Config;
use crate::error::{FsError, Result};
use crate::fs::Fs;
use crate::tag::{
    crc32, pair_from_bytes, pair_is_null, pair_sync, pair_to_bytes, rev_newer, Gstate, Pair, Tag,
    CLASS_SPLICE, CLASS_STRUCT, CLASS_TAIL, CLASS_USERATTR, ID_NONE, PAIR_NULL, TYPE_CRC,
    TYPE_CREATE, TYPE_DELETE, TYPE_HARDTAIL, TYPE_MOVESTATE, TYPE_SOFTTAIL,
};

/// Match mask covering the full type and id fields.
pub(crate) const MASK_ALL: u32 = 0x7fff_fc00;
/// Match mask covering only the 3-bit class and the id.
pub(crate) const MASK_CLASS: u32 = 0x700f_fc00;
/// Match mask covering the type field alone. Used for records whose id
/// field carries payload rather than an entry number (movestate).
pub(crate) const MASK_TYPE: u32 = 0x7ff0_0000;

/// A pending attribute for a commit. Delete records carry no data.
#[derive(Debug, Clone)]
pub(crate) struct Attr {
    pub(crate) tag: Tag,
    pub(crate) data: Vec<u8>,
}

impl Attr {
    pub(crate) fn new(tag: Tag, data: Vec<u8>) -> Self {
        debug_assert!(tag.is_delete() || tag.size() as usize == data.len());
        Attr { tag, data }
    }

    pub(crate) fn create(id: u16) -> Self {
        Attr::new(Tag::new(TYPE_CREATE, id, 0), Vec::new())
    }

    pub(crate) fn delete(id: u16) -> Self {
        Attr::new(Tag::new(TYPE_DELETE, id, 0), Vec::new())
    }

    pub(crate) fn remove(typ: u16, id: u16) -> Self {
        Attr::new(Tag::delete_of(typ, id), Vec::new())
    }
}

/// In-RAM handle on one fetched metadata pair. `pair[0]` is always the
/// active block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Mdir {
    pub(crate) pair: Pair,
    pub(crate) rev: u32,
    /// End of the last sealed commit; appends start here.
    pub(crate) off: u32,
    /// Decoded tag of the last committed record, the XOR chain anchor for
    /// both appends and backward scans.
    pub(crate) etag: Tag,
    pub(crate) count: u16,
    /// Whether the space past `off` is known erased so appending is safe.
    pub(crate) erased: bool,
    pub(crate) split: bool,
    pub(crate) tail: Pair,
    /// XOR of this pair's commit checksums, entropy for the allocator.
    pub(crate) crc_seed: u32,
}

/// Reads both halves of a pair and reconstructs the newest consistent
/// state, preferring the block with the newer revision and falling back
/// to the other if its log yields no sealed commit.
pub(crate) fn dir_fetch<D: BlockDevice>(
    dev: &D,
    cfg: &Config,
    pcache: Option<&BlockCache>,
    rcache: &mut BlockCache,
    pair: Pair,
) -> Result<Mdir> {
    let mut revs = [0u32; 2];
    for i in 0..2 {
        if pair[i] >= cfg.block_count && cfg.block_count != 0 {
            return Err(FsError::Corrupt);
        }
        let mut buf = [0u8; 4];
        if cache::bd_read(dev, cfg, pcache, rcache, 4, pair[i], 0, &mut buf).is_ok() {
            revs[i] = u32::from_le_bytes(buf);
        }
    }
    let first = if rev_newer(revs[1], revs[0]) { 1usize } else { 0 };

    for &i in &[first, 1 - first] {
        let block = pair[i];
        let rev = revs[i];
        let limit = cfg.metadata_limit();

        let mut crc = crc32(0xffff_ffff, &rev.to_le_bytes());
        let mut off = 4u32;
        let mut ptag = Tag(0xffff_ffff);
        let mut crc_seed = 0u32;

        let mut committed: Option<(u32, Tag)> = None;
        let (mut ccount, mut ctail, mut csplit) = (0u16, PAIR_NULL, false);
        let mut cerased = false;

        let (mut tcount, mut ttail, mut tsplit) = (0u16, PAIR_NULL, false);

        loop {
            if off + 4 > limit {
                cerased = false;
                break;
            }
            let mut raw = [0u8; 4];
            if cache::bd_read(dev, cfg, pcache, rcache, limit - off, block, off, &mut raw).is_err()
            {
                cerased = false;
                break;
            }
            let tag = Tag(u32::from_be_bytes(raw) ^ ptag.0);
            if !tag.is_valid() {
                // Appending in place is only safe when the log ends
                // exactly at a sealed commit on a program boundary; a
                // torn commit may leave programmed garbage past the
                // last seal that must not be programmed over.
                cerased = ptag.typ() == TYPE_CRC && off % cfg.prog_size == 0;
                break;
            }
            crc = crc32(crc, &raw);
            if off + tag.dsize() > limit {
                cerased = false;
                break;
            }

            if tag.typ() == TYPE_CRC {
                if tag.is_delete() || tag.size() < 4 {
                    cerased = false;
                    break;
                }
                let mut word = [0u8; 4];
                if cache::bd_read(dev, cfg, pcache, rcache, 4, block, off + 4, &mut word).is_err()
                {
                    cerased = false;
                    break;
                }
                let expected = u32::from_le_bytes(word);
                if crc != expected {
                    // Torn commit; everything before the last CRC stands.
                    cerased = false;
                    break;
                }
                crc_seed ^= expected;
                off += tag.dsize();
                committed = Some((off, tag));
                ccount = tcount;
                ctail = ttail;
                csplit = tsplit;
                crc = 0xffff_ffff;
                ptag = tag;
                continue;
            }

            if !tag.is_delete() {
                let mut pos = 0u32;
                let mut scratch = [0u8; 32];
                let mut ok = true;
                while pos < tag.size() as u32 {
                    let d = (scratch.len() as u32).min(tag.size() as u32 - pos) as usize;
                    if cache::bd_read(
                        dev,
                        cfg,
                        pcache,
                        rcache,
                        tag.size() as u32 - pos,
                        block,
                        off + 4 + pos,
                        &mut scratch[..d],
                    )
                    .is_err()
                    {
                        ok = false;
                        break;
                    }
                    crc = crc32(crc, &scratch[..d]);
                    pos += d as u32;
                }
                if !ok {
                    cerased = false;
                    break;
                }
            }

            if tag.class() == CLASS_SPLICE {
                if tag.typ() == TYPE_CREATE {
                    tcount = (tcount + 1).max(tag.id() + 1);
                } else {
                    tcount = (tcount as i32 + tag.splice()).max(0) as u16;
                }
            } else if tag.class() == CLASS_TAIL && tag.size() == 8 {
                let mut buf = [0u8; 8];
                if cache::bd_read(dev, cfg, pcache, rcache, 8, block, off + 4, &mut buf).is_err() {
                    cerased = false;
                    break;
                }
                ttail = pair_from_bytes(&buf);
                tsplit = tag.chunk() & 1 == 1;
            } else if tag.id() != ID_NONE && tag.id() + 1 > tcount {
                tcount = tag.id() + 1;
            }

            ptag = tag;
            off += tag.dsize();
        }

        if let Some((coff, cetag)) = committed {
            return Ok(Mdir {
                pair: if i == 0 { pair } else { [pair[1], pair[0]] },
                rev,
                off: coff,
                etag: cetag,
                count: ccount,
                erased: cerased,
                split: csplit,
                tail: ctail,
                crc_seed,
            });
        }
    }

    log::debug!("no sealed commit in pair [{}, {}]", pair[0], pair[1]);
    Err(FsError::Corrupt)
}

/// Walks the committed log backward for the newest record matching
/// `gtag` under `mask`, copying up to `buf.len()` payload bytes starting
/// at `goff`. Create and delete records renumber ids on the way down, and
/// an entry shadowed by the global pending move reads as absent.
pub(crate) fn dir_getslice<D: BlockDevice>(
    dev: &D,
    cfg: &Config,
    pcache: Option<&BlockCache>,
    rcache: &mut BlockCache,
    gdisk: &Gstate,
    mdir: &Mdir,
    mask: u32,
    gtag: Tag,
    goff: u32,
    buf: &mut [u8],
) -> Result<(Tag, u32)> {
    let id_query = gtag.id() != ID_NONE && mask & (0x3ff << 10) != 0;
    let mut gdiff: i32 = 0;

    if id_query && gdisk.has_move() && pair_sync(gdisk.move_pair(), mdir.pair) {
        let move_id = gdisk.move_id();
        if move_id == gtag.id() {
            return Err(FsError::NotFound);
        }
        if move_id < gtag.id() {
            // The pending delete will shift later ids down by one.
            gdiff -= 1;
        }
    }

    let mut off = mdir.off;
    let mut ntag = mdir.etag;
    while off >= 4 + ntag.dsize() {
        off -= ntag.dsize();
        let tag = ntag;
        let mut raw = [0u8; 4];
        cache::bd_read(dev, cfg, pcache, rcache, 4, mdir.pair[0], off, &mut raw)?;
        ntag = Tag((u32::from_be_bytes(raw) ^ tag.0) & 0x7fff_ffff);

        let want_id = gtag.id() as i32 - gdiff;
        if id_query && tag.class() == CLASS_SPLICE && (tag.id() as i32) <= want_id {
            if tag.typ() == TYPE_CREATE && tag.id() as i32 == want_id {
                // Nothing before the entry's creation can belong to it.
                return Err(FsError::NotFound);
            }
            gdiff += tag.splice();
            continue;
        }

        let want = if id_query {
            if !(0..=0x3fe).contains(&want_id) {
                continue;
            }
            gtag.with_id(want_id as u16)
        } else {
            gtag
        };
        if tag.0 & mask == want.0 & mask {
            if tag.is_delete() {
                return Err(FsError::NotFound);
            }
            let avail = (tag.size() as u32).saturating_sub(goff);
            let d = avail.min(buf.len() as u32);
            cache::bd_read(
                dev,
                cfg,
                pcache,
                rcache,
                d,
                mdir.pair[0],
                off + 4 + goff,
                &mut buf[..d as usize],
            )?;
            return Ok((tag, d));
        }
    }

    Err(FsError::NotFound)
}

/// Like `dir_getslice` but returns the whole payload.
pub(crate) fn dir_get<D: BlockDevice>(
    dev: &D,
    cfg: &Config,
    pcache: Option<&BlockCache>,
    rcache: &mut BlockCache,
    gdisk: &Gstate,
    mdir: &Mdir,
    mask: u32,
    gtag: Tag,
) -> Result<(Tag, Vec<u8>)> {
    let mut buf = vec![0u8; 0x3fe];
    let (tag, len) =
        dir_getslice(dev, cfg, pcache, rcache, gdisk, mdir, mask, gtag, 0, &mut buf)?;
    buf.truncate(len as usize);
    Ok((tag, buf))
}

/// This pair's contribution to the global state, zero if it has never
/// committed one.
pub(crate) fn dir_contribution<D: BlockDevice>(
    dev: &D,
    cfg: &Config,
    pcache: Option<&BlockCache>,
    rcache: &mut BlockCache,
    mdir: &Mdir,
) -> Result<Gstate> {
    let zero = Gstate::default();
    match dir_get(
        dev,
        cfg,
        pcache,
        rcache,
        &zero,
        mdir,
        // The record's id field holds the move id, so match on type only.
        MASK_TYPE,
        Tag::new(TYPE_MOVESTATE, ID_NONE, 12),
    ) {
        Ok((_, data)) if data.len() == 12 => Ok(Gstate::from_bytes(&data)),
        Ok(_) => Err(FsError::Corrupt),
        Err(FsError::NotFound) => Ok(zero),
        Err(e) => Err(e),
    }
}

/// Finds the id of the entry named `name` within a single pair.
pub(crate) fn dir_find_name<D: BlockDevice>(
    dev: &D,
    cfg: &Config,
    pcache: Option<&BlockCache>,
    rcache: &mut BlockCache,
    gdisk: &Gstate,
    mdir: &Mdir,
    name: &str,
) -> Result<(u16, Tag)> {
    for id in 0..mdir.count {
        let got = dir_get(
            dev,
            cfg,
            pcache,
            rcache,
            gdisk,
            mdir,
            MASK_CLASS,
            Tag::new(0, id, 0),
        );
        match got {
            Ok((tag, data)) if data == name.as_bytes() => return Ok((id, tag)),
            Ok(_) | Err(FsError::NotFound) => {}
            Err(e) => return Err(e),
        }
    }
    Err(FsError::NotFound)
}

// In-flight commit into one block.
struct Commit {
    block: u32,
    off: u32,
    ptag: u32,
    crc: u32,
}

fn commit_attr<D: BlockDevice>(
    dev: &D,
    cfg: &Config,
    pcache: &mut BlockCache,
    rcache: &mut BlockCache,
    c: &mut Commit,
    tag: Tag,
    data: &[u8],
) -> Result<()> {
    // Reserve room for the smallest possible sealing CRC record.
    let reserve = 4 + 4;
    if c.off + tag.dsize() + reserve > cfg.metadata_limit() {
        return Err(FsError::NoSpace);
    }

    let raw = (tag.0 ^ c.ptag).to_be_bytes();
    cache::bd_prog(dev, cfg, pcache, rcache, true, c.block, c.off, &raw)?;
    c.crc = crc32(c.crc, &raw);
    if !tag.is_delete() {
        cache::bd_prog(dev, cfg, pcache, rcache, true, c.block, c.off + 4, data)?;
        c.crc = crc32(c.crc, data);
    }
    c.ptag = tag.0;
    c.off += tag.dsize();
    Ok(())
}

fn commit_crc<D: BlockDevice>(
    dev: &D,
    cfg: &Config,
    pcache: &mut BlockCache,
    rcache: &mut BlockCache,
    c: &mut Commit,
) -> Result<Tag> {
    // Pad the payload so the commit ends on a program boundary.
    let end = (c.off + 4 + 4).div_ceil(cfg.prog_size) * cfg.prog_size;
    let psize = end - c.off - 4;
    if psize > 0x3fe || end > cfg.metadata_limit() {
        return Err(FsError::NoSpace);
    }
    let tag = Tag::new(TYPE_CRC, ID_NONE, psize as u16);

    let raw = (tag.0 ^ c.ptag).to_be_bytes();
    cache::bd_prog(dev, cfg, pcache, rcache, true, c.block, c.off, &raw)?;
    c.crc = crc32(c.crc, &raw);

    let mut payload = vec![0xffu8; psize as usize];
    payload[..4].copy_from_slice(&c.crc.to_le_bytes());
    cache::bd_prog(dev, cfg, pcache, rcache, true, c.block, c.off + 4, &payload)?;
    cache::bd_flush(dev, cfg, pcache, rcache, true)?;

    c.ptag = tag.0;
    c.off += tag.dsize();
    Ok(tag)
}

// Fully materialized logical state of one pair, used for compaction.
struct RState {
    entries: Vec<BTreeMap<u16, Vec<u8>>>,
    tail: Pair,
    split: bool,
    contribution: Gstate,
}

fn replay<D: BlockDevice>(
    dev: &D,
    cfg: &Config,
    rcache: &mut BlockCache,
    mdir: &Mdir,
) -> Result<RState> {
    let mut state = RState {
        entries: Vec::new(),
        tail: PAIR_NULL,
        split: false,
        contribution: Gstate::default(),
    };

    let mut off = 4u32;
    let mut ptag = Tag(0xffff_ffff);
    while off < mdir.off {
        let mut raw = [0u8; 4];
        cache::bd_read(dev, cfg, None, rcache, mdir.off - off, mdir.pair[0], off, &mut raw)?;
        let tag = Tag(u32::from_be_bytes(raw) ^ ptag.0);
        if !tag.is_valid() {
            return Err(FsError::Corrupt);
        }
        let mut data = Vec::new();
        if !tag.is_delete() && tag.typ() != TYPE_CRC {
            data = vec![0u8; tag.size() as usize];
            cache::bd_read(
                dev,
                cfg,
                None,
                rcache,
                tag.size() as u32,
                mdir.pair[0],
                off + 4,
                &mut data,
            )?;
        }
        if tag.typ() != TYPE_CRC {
            apply_record(&mut state, tag, &data);
        }
        ptag = tag;
        off += tag.dsize();
    }

    Ok(state)
}

fn apply_record(state: &mut RState, tag: Tag, data: &[u8]) {
    if tag.class() == CLASS_SPLICE {
        if tag.typ() == TYPE_CREATE {
            let id = tag.id() as usize;
            while state.entries.len() < id {
                state.entries.push(BTreeMap::new());
            }
            state.entries.insert(id, BTreeMap::new());
        } else if (tag.id() as usize) < state.entries.len() {
            state.entries.remove(tag.id() as usize);
        }
        return;
    }
    if tag.class() == CLASS_TAIL {
        state.tail = pair_from_bytes(data);
        state.split = tag.chunk() & 1 == 1;
        return;
    }
    if tag.typ() == TYPE_MOVESTATE {
        state.contribution = Gstate::from_bytes(data);
        return;
    }
    if tag.id() != ID_NONE {
        let id = tag.id() as usize;
        while state.entries.len() <= id {
            state.entries.push(BTreeMap::new());
        }
        if tag.is_delete() {
            state.entries[id].remove(&tag.typ());
        } else {
            state.entries[id].insert(tag.typ(), data.to_vec());
        }
    }
}

/// Allocates a brand new, unwritten pair. Its first commit always runs
/// through compaction since nothing on it is known erased.
pub(crate) fn dir_alloc<D: BlockDevice>(fs: &mut Fs<D>) -> Result<Mdir> {
    let b1 = fs.alloc()?;
    let b0 = fs.alloc()?;
    // Carry the stale revision forward so wear history survives reuse.
    let mut rev = 0u32;
    let mut buf = [0u8; 4];
    if cache::bd_read(
        fs.dev.as_ref(),
        &fs.cfg,
        None,
        &mut fs.rcache,
        4,
        b0,
        0,
        &mut buf,
    )
    .is_ok()
    {
        rev = u32::from_le_bytes(buf);
    }
    Ok(Mdir {
        pair: [b0, b1],
        rev,
        off: 0,
        etag: Tag(0xffff_ffff),
        count: 0,
        erased: false,
        split: false,
        tail: PAIR_NULL,
        crc_seed: 0,
    })
}

fn tail_attr(state: &RState) -> Option<Attr> {
    if pair_is_null(state.tail) {
        return None;
    }
    let typ = if state.split { TYPE_HARDTAIL } else { TYPE_SOFTTAIL };
    Some(Attr::new(
        Tag::new(typ, ID_NONE, 8),
        pair_to_bytes(state.tail).to_vec(),
    ))
}

// One attempt at writing `state` into mdir.pair[1]. On success the pair
// roles are swapped and mdir reflects the new block.
fn compact_write<D: BlockDevice>(
    fs: &mut Fs<D>,
    mdir: &mut Mdir,
    state: &RState,
    rev: u32,
    delta: Gstate,
) -> Result<()> {
    let Fs { dev, cfg, pcache, rcache, .. } = fs;
    let dev = dev.as_ref();

    cache::bd_erase(dev, cfg, pcache, rcache, mdir.pair[1])?;
    cache::bd_prog(
        dev,
        cfg,
        pcache,
        rcache,
        true,
        mdir.pair[1],
        0,
        &rev.to_le_bytes(),
    )?;

    let mut c = Commit {
        block: mdir.pair[1],
        off: 4,
        ptag: 0xffff_ffff,
        crc: crc32(0xffff_ffff, &rev.to_le_bytes()),
    };

    for (id, records) in state.entries.iter().enumerate() {
        for (&typ, data) in records {
            let tag = Tag::new(typ, id as u16, data.len() as u16);
            commit_attr(dev, cfg, pcache, rcache, &mut c, tag, data)?;
        }
    }
    if let Some(attr) = tail_attr(state) {
        commit_attr(dev, cfg, pcache, rcache, &mut c, attr.tag, &attr.data)?;
    }
    let mut contribution = state.contribution;
    contribution.xor(delta);
    if !contribution.is_zero() {
        commit_attr(
            dev,
            cfg,
            pcache,
            rcache,
            &mut c,
            Tag::new(TYPE_MOVESTATE, Tag(contribution.tag).id(), 12),
            &contribution.to_bytes(),
        )?;
    }
    let etag = commit_crc(dev, cfg, pcache, rcache, &mut c)?;

    mdir.pair.swap(0, 1);
    mdir.rev = rev;
    mdir.off = c.off;
    mdir.etag = etag;
    mdir.count = state.entries.len() as u16;
    mdir.erased = true;
    mdir.split = state.split;
    mdir.tail = state.tail;
    Ok(())
}

// Compacts `state` into the pair, splitting and relocating as needed.
// Returns the pair's previous address if it moved.
fn dir_compact<D: BlockDevice>(
    fs: &mut Fs<D>,
    mdir: &mut Mdir,
    mut state: RState,
    delta: Gstate,
) -> Result<Option<Pair>> {
    let mut relocated: Option<Pair> = None;
    let mut rev = mdir.rev.wrapping_add(1);
    let is_root_pair = pair_sync(mdir.pair, [0, 1]);

    // Wear leveling: after block_cycles erases, prefer fresh blocks.
    if fs.cfg.block_cycles > 0
        && !is_root_pair
        && rev % fs.cfg.block_cycles == 0
        && relocated.is_none()
    {
        match fs.alloc() {
            Ok(nblock) => {
                relocated = Some(mdir.pair);
                mdir.pair[1] = nblock;
                rev = rev.wrapping_add(1);
            }
            // A full disk just keeps wearing the old blocks.
            Err(FsError::NoSpace) => {}
            Err(e) => return Err(e),
        }
    }

    loop {
        match compact_write(fs, mdir, &state, rev, delta) {
            Ok(()) => {
                fs.gdisk = fs.gstate;
                return Ok(relocated);
            }
            Err(FsError::NoSpace) => {
                if state.entries.len() <= 1 {
                    return Err(FsError::NoSpace);
                }
                // Split the upper half of the ids into a new pair chained
                // by a hard tail. The new pair is unreachable until the
                // commit below lands, so power loss at worst leaks blocks
                // the allocator will rescan.
                let at = state.entries.len() / 2;
                let tail_entries = state.entries.split_off(at);
                let tail_state = RState {
                    entries: tail_entries,
                    tail: state.tail,
                    split: state.split,
                    contribution: Gstate::default(),
                };
                let mut tail_mdir = dir_alloc(fs)?;
                dir_compact(fs, &mut tail_mdir, tail_state, Gstate::default())?;
                state.tail = tail_mdir.pair;
                state.split = true;
                log::debug!(
                    "split pair [{}, {}] at id {at}, tail [{}, {}]",
                    mdir.pair[0],
                    mdir.pair[1],
                    tail_mdir.pair[0],
                    tail_mdir.pair[1]
                );
            }
            Err(FsError::BadBlock) => {
                if is_root_pair {
                    log::error!("superblock pair went bad, filesystem is frozen");
                    return Err(FsError::Frozen);
                }
                log::warn!("bad metadata block {}, relocating", mdir.pair[1]);
                fs.pcache.drop_cache();
                if relocated.is_none() {
                    relocated = Some(mdir.pair);
                }
                mdir.pair[1] = fs.alloc()?;
            }
            Err(e) => return Err(e),
        }
    }
}

fn apply_attrs_to_mdir(mdir: &mut Mdir, attrs: &[Attr]) {
    for attr in attrs {
        if attr.tag.class() == CLASS_SPLICE {
            mdir.count = (mdir.count as i32 + attr.tag.splice()).max(0) as u16;
        } else if attr.tag.class() == CLASS_TAIL {
            mdir.tail = pair_from_bytes(&attr.data);
            mdir.split = attr.tag.chunk() & 1 == 1;
        }
    }
}

/// Commits a batch of attributes to the pair atomically. Appends to the
/// active block when possible, compacts (and possibly splits or
/// relocates) otherwise. Returns the pair's previous address if
/// relocation moved it; the caller must then re-point the parent entry
/// and predecessor tail.
pub(crate) fn dir_commit_raw<D: BlockDevice>(
    fs: &mut Fs<D>,
    mdir: &mut Mdir,
    attrs: &[Attr],
) -> Result<Option<Pair>> {
    for attr in attrs {
        debug_assert!(attr.tag.typ() != TYPE_CRC && attr.tag.typ() != TYPE_MOVESTATE);
    }

    let mut delta = fs.gstate;
    delta.xor(fs.gdisk);

    if mdir.erased {
        let contribution = if !delta.is_zero() {
            dir_contribution(fs.dev.as_ref(), &fs.cfg, None, &mut fs.rcache, mdir)?
        } else {
            Gstate::default()
        };

        let attempt = (|| -> Result<(u32, Tag)> {
            let Fs { dev, cfg, pcache, rcache, .. } = fs;
            let dev = dev.as_ref();
            let mut c = Commit {
                block: mdir.pair[0],
                off: mdir.off,
                ptag: mdir.etag.0,
                crc: 0xffff_ffff,
            };
            for attr in attrs {
                commit_attr(dev, cfg, pcache, rcache, &mut c, attr.tag, &attr.data)?;
            }
            if !delta.is_zero() {
                let mut value = contribution;
                value.xor(delta);
                commit_attr(
                    dev,
                    cfg,
                    pcache,
                    rcache,
                    &mut c,
                    Tag::new(TYPE_MOVESTATE, Tag(value.tag).id(), 12),
                    &value.to_bytes(),
                )?;
            }
            let etag = commit_crc(dev, cfg, pcache, rcache, &mut c)?;
            Ok((c.off, etag))
        })();

        match attempt {
            Ok((off, etag)) => {
                mdir.off = off;
                mdir.etag = etag;
                apply_attrs_to_mdir(mdir, attrs);
                fs.gdisk = fs.gstate;
                return Ok(None);
            }
            Err(FsError::NoSpace) | Err(FsError::BadBlock) => {
                // The active block now holds an unsealed suffix; only a
                // compaction onto the other block can proceed.
                mdir.erased = false;
                fs.pcache.drop_cache();
            }
            Err(e) => return Err(e),
        }
    }

    let mut state = replay(fs.dev.as_ref(), &fs.cfg, &mut fs.rcache, mdir)?;
    for attr in attrs {
        apply_record(&mut state, attr.tag, &attr.data);
    }
    dir_compact(fs, mdir, state, delta)
}

/// Materializes the struct and user-attribute records of one entry, used
/// to carry an entry's state across a rename.
pub(crate) fn dir_entry_attrs<D: BlockDevice>(
    dev: &D,
    cfg: &Config,
    rcache: &mut BlockCache,
    mdir: &Mdir,
    id: u16,
) -> Result<Vec<Attr>> {
    let state = replay(dev, cfg, rcache, mdir)?;
    let Some(records) = state.entries.get(id as usize) else {
        return Err(FsError::NotFound);
    };
    Ok(records
        .iter()
        .filter(|&(&typ, _)| {
            let class = typ >> 8;
            class == CLASS_STRUCT || class == CLASS_USERATTR
        })
        .map(|(&typ, data)| Attr::new(Tag::new(typ, id, data.len() as u16), data.clone()))
        .collect())
}
