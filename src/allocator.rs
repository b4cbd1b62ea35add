//! Lookahead block allocator state.
//!
//! The allocator never stores free-block state on disk. Instead it keeps
//! a small bitmap window over the block address space; when the window is
//! exhausted the filesystem re-scans all reachable metadata and data
//! blocks and marks them in the next window. A checkpoint counter bounds
//! the total scan distance per allocation pass so a genuinely full disk
//! reports `NoSpace` instead of spinning.
//!
//! The window logically wraps around the end of the device, and its
//! starting point is seeded from a per-mount pseudorandom value so wear
//! spreads across the device between mounts.

#[derive(Debug)]
pub(crate) struct Lookahead {
    /// First block covered by the window.
    pub(crate) start: u32,
    /// Window size in blocks.
    pub(crate) size: u32,
    /// Next bit to scan within the window.
    pub(crate) next: u32,
    /// Remaining blocks we may scan before the device is known full.
    pub(crate) ckpoint: u32,
    buffer: Vec<u8>,
}

impl Lookahead {
    pub(crate) fn new(lookahead_size: u32, block_count: u32) -> Self {
        Self {
            start: 0,
            size: (8 * lookahead_size).min(block_count),
            next: 0,
            ckpoint: block_count,
            buffer: vec![0; lookahead_size as usize],
        }
    }

    /// Discards the window contents and restarts it at `start`.
    pub(crate) fn reset(&mut self, start: u32, block_count: u32) {
        self.start = start % block_count.max(1);
        self.size = (8 * self.buffer.len() as u32).min(block_count);
        self.next = 0;
        self.ckpoint = block_count;
        self.buffer.fill(0);
    }

    /// Slides the window to the blocks just past the current one. The
    /// caller must re-mark in-use blocks afterwards.
    pub(crate) fn advance(&mut self, block_count: u32) {
        self.start = (self.start + self.size) % block_count;
        self.next = 0;
        self.buffer.fill(0);
    }

    /// Marks `block` as in use if it falls inside the window.
    pub(crate) fn mark(&mut self, block_count: u32, block: u32) {
        let off = (block.wrapping_sub(self.start)).wrapping_add(block_count) % block_count;
        if off < self.size {
            self.buffer[(off / 8) as usize] |= 1 << (off % 8);
        }
    }

    /// Scans the window for the next free block. Consumes checkpoint
    /// budget for every block examined; returns `None` when the window is
    /// exhausted.
    pub(crate) fn next_free(&mut self, block_count: u32) -> Option<u32> {
        while self.next < self.size {
            let off = self.next;
            self.next += 1;
            self.ckpoint = self.ckpoint.saturating_sub(1);
            if self.buffer[(off / 8) as usize] & (1 << (off % 8)) == 0 {
                return Some((self.start + off) % block_count);
            }
        }
        None
    }

    /// Resets the scan budget to a full device pass. Safe once every block
    /// freed by previous operations is durably unreferenced on disk.
    pub(crate) fn ckpoint_reset(&mut self, block_count: u32) {
        self.ckpoint = block_count;
    }

    pub(crate) fn exhausted(&self) -> bool {
        self.ckpoint == 0
    }
}
