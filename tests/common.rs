//! Common utilities for tests
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use pion::{BlockDevice, Config, FsError, Result};

pub const ORANGE: &str = "\x1b[38;5;214m";
pub const RESET: &str = "\x1b[0m";

/// Provides a macro for logging messages during tests.
/// e.g. log!("placeholder") -> println!("[test] placeholder");
#[macro_export]
macro_rules! log {
    ($msg:expr, $($arg:tt)*) => {
        println!("{}[test] {}{}", crate::common::ORANGE, format!($msg, $($arg)*), crate::common::RESET)
    };
    ($msg:expr) => {
        println!("{}[test] {}{}", crate::common::ORANGE, format!($msg), crate::common::RESET)
    };
}

/// RAM-backed flash emulation with NOR semantics: reads of never-written
/// regions return 0xff, and programming a region that is not in the
/// erased state panics, since the engine must never do that.
///
/// A power cut can be scheduled `n` program calls in the future. The
/// offending program writes only half of its data (a torn write) and the
/// device then fails every operation until `revive` is called, modelling
/// a reboot.
pub struct RamFlash {
    block_size: u32,
    block_count: u32,
    state: Mutex<FlashState>,
}

struct FlashState {
    data: Vec<u8>,
    progs: u64,
    erases: u64,
    cut: Option<u64>,
    dead: bool,
}

impl RamFlash {
    pub fn new(block_size: u32, block_count: u32) -> Self {
        let size = (block_size * block_count) as usize;
        RamFlash {
            block_size,
            block_count,
            state: Mutex::new(FlashState {
                data: vec![0xff; size],
                progs: 0,
                erases: 0,
                cut: None,
                dead: false,
            }),
        }
    }

    /// Schedules a power cut: the next `after` program calls succeed, the
    /// one after that is torn and the device goes dead.
    pub fn schedule_power_cut(&self, after: u64) {
        let mut s = self.state.lock().unwrap();
        s.cut = Some(after);
        s.dead = false;
    }

    /// Models a reboot: clears any pending cut and brings the device back.
    pub fn revive(&self) {
        let mut s = self.state.lock().unwrap();
        s.cut = None;
        s.dead = false;
    }

    pub fn prog_count(&self) -> u64 {
        self.state.lock().unwrap().progs
    }

    pub fn erase_count(&self) -> u64 {
        self.state.lock().unwrap().erases
    }

    fn range(&self, block: u32, off: u32, len: usize) -> std::ops::Range<usize> {
        assert!(block < self.block_count, "block {block} out of range");
        assert!(
            off + len as u32 <= self.block_size,
            "access past block end: off {off} len {len}"
        );
        let start = (block * self.block_size + off) as usize;
        start..start + len
    }
}

impl BlockDevice for RamFlash {
    fn read(&self, block: u32, off: u32, buf: &mut [u8]) -> Result<()> {
        let range = self.range(block, off, buf.len());
        let s = self.state.lock().unwrap();
        if s.dead {
            return Err(FsError::Io);
        }
        buf.copy_from_slice(&s.data[range]);
        Ok(())
    }

    fn prog(&self, block: u32, off: u32, buf: &[u8]) -> Result<()> {
        let range = self.range(block, off, buf.len());
        let mut s = self.state.lock().unwrap();
        if s.dead {
            return Err(FsError::Io);
        }
        assert!(
            s.data[range.clone()].iter().all(|&b| b == 0xff),
            "program of unerased region: block {block} off {off}"
        );
        if let Some(left) = s.cut {
            if left == 0 {
                let torn = buf.len() / 2;
                let start = range.start;
                s.data[start..start + torn].copy_from_slice(&buf[..torn]);
                s.dead = true;
                return Err(FsError::Io);
            }
            s.cut = Some(left - 1);
        }
        s.progs += 1;
        s.data[range].copy_from_slice(buf);
        Ok(())
    }

    fn erase(&self, block: u32) -> Result<()> {
        let range = self.range(block, 0, self.block_size as usize);
        let mut s = self.state.lock().unwrap();
        if s.dead {
            return Err(FsError::Io);
        }
        s.erases += 1;
        s.data[range].fill(0xff);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        if self.state.lock().unwrap().dead {
            return Err(FsError::Io);
        }
        Ok(())
    }
}

/// Small geometry that still forces metadata compaction and CTZ chains.
pub fn small_config() -> Config {
    Config {
        block_size: 512,
        block_count: 64,
        cache_size: 64,
        lookahead_size: 16,
        block_cycles: 0,
        ..Config::default()
    }
}

pub fn small_device() -> Arc<RamFlash> {
    let cfg = small_config();
    Arc::new(RamFlash::new(cfg.block_size, cfg.block_count))
}
