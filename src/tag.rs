//! On-disk record primitives: the tag codec, metadata pair addresses,
//! global-state algebra and the checksums guarding commits.
//!
//! The tag layout is a serialization contract. Each attribute record in a
//! metadata log is prefixed by one 32-bit tag, stored big-endian and XORed
//! with the previous tag on disk (seed 0xffffffff), so a never-programmed
//! word decodes with the invalid bit set. Field widths, MSB first:
//!
//! ```text
//! [ 1 valid | 11 type (3 class + 8 chunk) | 10 id | 10 size ]
//! ```
//!
//! `id` 0x3ff means "no id" (commit-level records), `size` 0x3ff is the
//! delete sentinel: the record tombstones its (type, id) key instead of
//! carrying a payload.

/// "No id" sentinel for records not attached to a directory entry.
pub(crate) const ID_NONE: u16 = 0x3ff;
/// Size field value marking a deletion instead of a payload.
pub(crate) const SIZE_DELETE: u16 = 0x3ff;

// 11-bit tag types. The 3-bit class is the upper part of the type.
pub(crate) const TYPE_REG: u16 = 0x001;
pub(crate) const TYPE_DIR: u16 = 0x002;
pub(crate) const TYPE_SUPERBLOCK: u16 = 0x0ff;
pub(crate) const TYPE_DIRSTRUCT: u16 = 0x200;
pub(crate) const TYPE_INLINESTRUCT: u16 = 0x201;
pub(crate) const TYPE_CTZSTRUCT: u16 = 0x202;
pub(crate) const TYPE_USERATTR: u16 = 0x300;
pub(crate) const TYPE_CREATE: u16 = 0x401;
pub(crate) const TYPE_DELETE: u16 = 0x4ff;
pub(crate) const TYPE_CRC: u16 = 0x500;
pub(crate) const TYPE_SOFTTAIL: u16 = 0x600;
pub(crate) const TYPE_HARDTAIL: u16 = 0x601;
pub(crate) const TYPE_MOVESTATE: u16 = 0x7ff;

// 3-bit classes.
pub(crate) const CLASS_STRUCT: u16 = 0x2;
pub(crate) const CLASS_USERATTR: u16 = 0x3;
pub(crate) const CLASS_SPLICE: u16 = 0x4;
pub(crate) const CLASS_TAIL: u16 = 0x6;

/// A decoded attribute tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tag(pub(crate) u32);

impl Tag {
    pub(crate) fn new(typ: u16, id: u16, size: u16) -> Self {
        debug_assert!(typ <= 0x7ff && id <= 0x3ff && size <= 0x3ff);
        Tag(((typ as u32) << 20) | ((id as u32) << 10) | size as u32)
    }

    pub(crate) fn delete_of(typ: u16, id: u16) -> Self {
        Tag::new(typ, id, SIZE_DELETE)
    }

    /// True when the valid bit is clear. An erased word XORed into the
    /// running chain decodes as invalid, terminating the log.
    pub(crate) fn is_valid(self) -> bool {
        self.0 & 0x8000_0000 == 0
    }

    /// Full 11-bit type.
    pub(crate) fn typ(self) -> u16 {
        ((self.0 >> 20) & 0x7ff) as u16
    }

    /// Upper 3 bits of the type.
    pub(crate) fn class(self) -> u16 {
        ((self.0 >> 28) & 0x7) as u16
    }

    /// Lower 8 bits of the type.
    pub(crate) fn chunk(self) -> u8 {
        ((self.0 >> 20) & 0xff) as u8
    }

    pub(crate) fn id(self) -> u16 {
        ((self.0 >> 10) & 0x3ff) as u16
    }

    pub(crate) fn size(self) -> u16 {
        (self.0 & 0x3ff) as u16
    }

    pub(crate) fn is_delete(self) -> bool {
        self.size() == SIZE_DELETE
    }

    /// Bytes occupied on disk: the tag word plus the payload, except that
    /// delete records carry none.
    pub(crate) fn dsize(self) -> u32 {
        4 + if self.is_delete() { 0 } else { self.size() as u32 }
    }

    pub(crate) fn with_id(self, id: u16) -> Self {
        Tag((self.0 & !(0x3ff << 10)) | ((id as u32) << 10))
    }

    /// Signed id shift a splice record applies to all higher ids:
    /// +1 for create, -1 for delete.
    pub(crate) fn splice(self) -> i32 {
        self.chunk() as i8 as i32
    }
}

/// The two candidate blocks of a metadata pair.
pub(crate) type Pair = [u32; 2];

pub(crate) const PAIR_NULL: Pair = [0xffff_ffff, 0xffff_ffff];

pub(crate) fn pair_is_null(pair: Pair) -> bool {
    pair[0] == 0xffff_ffff && pair[1] == 0xffff_ffff
}

/// Pairs are unordered sets; either block may be listed first.
pub(crate) fn pair_sync(a: Pair, b: Pair) -> bool {
    (a[0] == b[0] && a[1] == b[1]) || (a[0] == b[1] && a[1] == b[0])
}

pub(crate) fn pair_to_bytes(pair: Pair) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[..4].copy_from_slice(&pair[0].to_le_bytes());
    buf[4..].copy_from_slice(&pair[1].to_le_bytes());
    buf
}

pub(crate) fn pair_from_bytes(buf: &[u8]) -> Pair {
    [
        u32::from_le_bytes(buf[0..4].try_into().unwrap()),
        u32::from_le_bytes(buf[4..8].try_into().unwrap()),
    ]
}

/// Filesystem-wide accumulator of in-flight operations, XORed together
/// from the deltas committed into every metadata pair. All-zero means
/// clean. The tag word encodes the pending-move id (0x3ff when none) and
/// the outstanding orphan count in the size field; `pair` addresses the
/// pair holding a pending move's stale source entry ([0, 0] when none).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Gstate {
    pub(crate) tag: u32,
    pub(crate) pair: [u32; 2],
}

impl Gstate {
    pub(crate) fn is_zero(self) -> bool {
        self.tag == 0 && self.pair == [0, 0]
    }

    pub(crate) fn xor(&mut self, other: Gstate) {
        self.tag ^= other.tag;
        self.pair[0] ^= other.pair[0];
        self.pair[1] ^= other.pair[1];
    }

    pub(crate) fn has_move(self) -> bool {
        Tag(self.tag).typ() == TYPE_MOVESTATE && Tag(self.tag).id() != ID_NONE
    }

    pub(crate) fn move_id(self) -> u16 {
        Tag(self.tag).id()
    }

    pub(crate) fn move_pair(self) -> Pair {
        self.pair
    }

    pub(crate) fn orphans(self) -> u16 {
        if Tag(self.tag).typ() == TYPE_MOVESTATE {
            Tag(self.tag).size()
        } else {
            0
        }
    }

    fn rebuild(&mut self, move_id: u16, orphans: u16) {
        if move_id == ID_NONE && orphans == 0 {
            self.tag = 0;
            self.pair = [0, 0];
        } else {
            self.tag = Tag::new(TYPE_MOVESTATE, move_id, orphans).0;
        }
    }

    pub(crate) fn set_move(&mut self, pair: Pair, id: u16) {
        let orphans = self.orphans();
        self.pair = pair;
        self.rebuild(id, orphans);
    }

    pub(crate) fn clear_move(&mut self) {
        let orphans = self.orphans();
        self.pair = [0, 0];
        self.rebuild(ID_NONE, orphans);
    }

    pub(crate) fn add_orphans(&mut self, diff: i32) {
        let orphans = (self.orphans() as i32 + diff).max(0) as u16;
        let move_id = if self.has_move() { self.move_id() } else { ID_NONE };
        self.rebuild(move_id, orphans);
    }

    pub(crate) fn to_bytes(self) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[..4].copy_from_slice(&self.tag.to_le_bytes());
        buf[4..8].copy_from_slice(&self.pair[0].to_le_bytes());
        buf[8..].copy_from_slice(&self.pair[1].to_le_bytes());
        buf
    }

    pub(crate) fn from_bytes(buf: &[u8]) -> Self {
        Gstate {
            tag: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            pair: [
                u32::from_le_bytes(buf[4..8].try_into().unwrap()),
                u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            ],
        }
    }
}

/// CRC-32 (reflected polynomial 0xedb88320), initial state passed in and
/// no final inversion, so commits can checksum incrementally.
pub(crate) fn crc32(mut crc: u32, data: &[u8]) -> u32 {
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xedb8_8320 & mask);
        }
    }
    crc
}

/// Wraparound-safe comparison of revision counters.
pub(crate) fn rev_newer(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) as i32 > 0
}
