use crate::error::{FsError, Result};

/// Abstraction over a raw flash block device.
///
/// The engine consumes exactly four operations plus an optional lock pair.
/// All offsets and sizes passed to `read` and `prog` are aligned to the
/// configured `read_size`/`prog_size`; `prog` is only ever issued against
/// regions that have been erased since the last program.
pub trait BlockDevice: Send + Sync {
    /// Reads `buf.len()` bytes from `block` starting at `off`.
    fn read(&self, block: u32, off: u32, buf: &mut [u8]) -> Result<()>;

    /// Programs `buf.len()` bytes to `block` starting at `off`.
    /// The region must have been erased first.
    /// May return `FsError::BadBlock`; callers treat this as non-fatal
    /// and retry against a different block.
    fn prog(&self, block: u32, off: u32, buf: &[u8]) -> Result<()>;

    /// Erases `block`. The block must be erased before being programmed.
    /// May return `FsError::BadBlock`.
    fn erase(&self, block: u32) -> Result<()>;

    /// Flushes any buffered writes to the physical medium.
    fn sync(&self) -> Result<()>;

    /// Optional host-supplied mutual exclusion, taken once around each
    /// public filesystem operation.
    fn lock(&self) -> Result<()> {
        Ok(())
    }

    /// Releases the host-supplied lock.
    fn unlock(&self) {}
}

/// RAII guard for the device's optional lock/unlock pair.
pub(crate) struct DeviceLock<'a, D: BlockDevice> {
    dev: &'a D,
}

impl<'a, D: BlockDevice> DeviceLock<'a, D> {
    pub(crate) fn acquire(dev: &'a D) -> Result<Self> {
        dev.lock().map_err(|_| FsError::Io)?;
        Ok(Self { dev })
    }
}

impl<D: BlockDevice> Drop for DeviceLock<'_, D> {
    fn drop(&mut self) {
        self.dev.unlock();
    }
}
