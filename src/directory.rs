//! Directory handles and iteration.
//!
//! A directory is a chain of metadata pairs linked by hard tails when a
//! single pair overflowed. Iteration yields synthesized `.` and `..`
//! entries at positions 0 and 1, then the real entries in id order across
//! the chain.

use crate::error::{FsError, Result};
use crate::fs::Fs;
use crate::metadata::{self, Mdir, MASK_CLASS};
use crate::tag::{Pair, Tag, TYPE_CTZSTRUCT, TYPE_DIR, TYPE_DIRSTRUCT, TYPE_INLINESTRUCT, TYPE_REG};
use crate::BlockDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Dir,
}

/// Directory entry metadata, also returned by `Fs::stat`.
#[derive(Debug, Clone)]
pub struct Info {
    pub name: String,
    pub file_type: FileType,
    pub size: u32,
}

#[derive(Debug)]
pub(crate) struct DirHandle {
    pub(crate) mdir: Mdir,
    /// First pair of the chain, for rewind.
    pub(crate) head: Pair,
    pub(crate) id: u16,
    pub(crate) pos: u32,
}

/// Builds the `Info` for one entry of a pair.
pub(crate) fn entry_info<D: BlockDevice>(fs: &mut Fs<D>, mdir: &Mdir, id: u16) -> Result<Info> {
    let (tag, name) = metadata::dir_get(
        fs.dev.as_ref(),
        &fs.cfg,
        None,
        &mut fs.rcache,
        &fs.gdisk,
        mdir,
        MASK_CLASS,
        Tag::new(0, id, 0),
    )?;
    let name = String::from_utf8(name).map_err(|_| FsError::Corrupt)?;

    let file_type = match tag.typ() {
        TYPE_REG => FileType::File,
        TYPE_DIR => FileType::Dir,
        _ => return Err(FsError::Corrupt),
    };

    let mut size = 0;
    if file_type == FileType::File {
        let (stag, data) = metadata::dir_get(
            fs.dev.as_ref(),
            &fs.cfg,
            None,
            &mut fs.rcache,
            &fs.gdisk,
            mdir,
            MASK_CLASS,
            Tag::new(TYPE_DIRSTRUCT, id, 0),
        )?;
        size = match stag.typ() {
            TYPE_INLINESTRUCT => stag.size() as u32,
            TYPE_CTZSTRUCT if data.len() == 8 => {
                u32::from_le_bytes(data[4..8].try_into().map_err(|_| FsError::Corrupt)?)
            }
            _ => return Err(FsError::Corrupt),
        };
    }

    Ok(Info { name, file_type, size })
}

pub(crate) fn dir_read<D: BlockDevice>(
    fs: &mut Fs<D>,
    d: &mut DirHandle,
) -> Result<Option<Info>> {
    if d.pos == 0 {
        d.pos = 1;
        return Ok(Some(Info { name: ".".into(), file_type: FileType::Dir, size: 0 }));
    }
    if d.pos == 1 {
        d.pos = 2;
        return Ok(Some(Info { name: "..".into(), file_type: FileType::Dir, size: 0 }));
    }

    loop {
        if d.id == d.mdir.count {
            if !d.mdir.split {
                return Ok(None);
            }
            d.mdir = metadata::dir_fetch(
                fs.dev.as_ref(),
                &fs.cfg,
                None,
                &mut fs.rcache,
                d.mdir.tail,
            )?;
            d.id = 0;
            continue;
        }

        let id = d.id;
        d.id += 1;
        match entry_info(fs, &d.mdir, id) {
            Ok(info) => {
                d.pos += 1;
                return Ok(Some(info));
            }
            // An entry shadowed by a pending move reads as absent.
            Err(FsError::NotFound) => continue,
            Err(e) => return Err(e),
        }
    }
}

pub(crate) fn dir_rewind<D: BlockDevice>(fs: &mut Fs<D>, d: &mut DirHandle) -> Result<()> {
    d.mdir = metadata::dir_fetch(fs.dev.as_ref(), &fs.cfg, None, &mut fs.rcache, d.head)?;
    d.id = 0;
    d.pos = 0;
    Ok(())
}

pub(crate) fn dir_seek<D: BlockDevice>(fs: &mut Fs<D>, d: &mut DirHandle, pos: u32) -> Result<()> {
    dir_rewind(fs, d)?;
    while d.pos < pos {
        if dir_read(fs, d)?.is_none() {
            return Err(FsError::Invalid);
        }
    }
    Ok(())
}
