//! Member device abstraction
//!
//! Sets address their members through [`MemberDevice`]: a byte-addressable
//! device with a fixed size. [`RawFile`](crate::RawFile) backs it with a
//! disk or image file; [`MemDevice`] keeps the bytes in memory and can be
//! told to fail, which is how degraded and crash paths get exercised.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use volset_common::{Error, Result};

/// A device that can back a set member
pub trait MemberDevice: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Size in bytes
    fn size(&self) -> u64;

    /// Native block size in bytes
    fn block_size(&self) -> u64 {
        512
    }

    /// Fill `buf` from `offset`
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `data` at `offset`
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Flush written data to stable storage
    fn sync(&self) -> Result<()> {
        Ok(())
    }

    /// Read `len` bytes at `offset` into a new buffer
    fn read_bytes(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }
}

/// Check that `len` bytes at `offset` fit on a device
pub fn check_bounds(device: &dyn MemberDevice, offset: u64, len: usize) -> Result<()> {
    let end = offset.checked_add(len as u64);
    if end.is_none_or(|end| end > device.size()) {
        return Err(Error::io(
            device.name(),
            format!(
                "access of {len} bytes at {offset} beyond device size {}",
                device.size()
            ),
        ));
    }
    Ok(())
}

/// In-memory member device with fault injection
pub struct MemDevice {
    name: String,
    data: RwLock<Vec<u8>>,
    block_size: u64,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    /// Writes allowed before every later write fails; `u64::MAX` disables
    write_budget: AtomicU64,
}

impl MemDevice {
    /// Create a zero-filled device
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self::from_bytes(name, vec![0u8; size as usize])
    }

    /// Create a device holding the given bytes
    pub fn from_bytes(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data: RwLock::new(data),
            block_size: 512,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            write_budget: AtomicU64::new(u64::MAX),
        }
    }

    /// Report a different native block size
    #[must_use]
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    /// Make every read fail, or stop doing so
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every write fail, or stop doing so
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Let `count` more writes through, then fail the rest
    pub fn fail_writes_after(&self, count: u64) {
        self.write_budget.store(count, Ordering::SeqCst);
    }

    /// Clear every injected fault
    pub fn heal(&self) {
        self.fail_reads(false);
        self.fail_writes(false);
        self.write_budget.store(u64::MAX, Ordering::SeqCst);
    }

    /// Copy of the current contents
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    fn take_write_budget(&self) -> bool {
        self.write_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                u64::MAX => Some(u64::MAX),
                0 => None,
                n => Some(n - 1),
            })
            .is_ok()
    }
}

impl MemberDevice for MemDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::io(&self.name, "injected read failure"));
        }
        check_bounds(self, offset, buf.len())?;
        let data = self.data.read();
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) || !self.take_write_budget() {
            return Err(Error::io(&self.name, "injected write failure"));
        }
        check_bounds(self, offset, data.len())?;
        let mut contents = self.data.write();
        let start = offset as usize;
        contents[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_device_read_write() {
        let dev = MemDevice::new("mem0", 8192);
        assert_eq!(dev.size(), 8192);
        dev.write_at(100, b"volset").unwrap();
        assert_eq!(dev.read_bytes(100, 6).unwrap(), b"volset");
        assert!(dev.read_bytes(8190, 4).is_err());
        assert!(dev.write_at(u64::MAX, b"x").is_err());
    }

    #[test]
    fn test_mem_device_fault_injection() {
        let dev = MemDevice::new("mem1", 4096);
        dev.fail_reads(true);
        let err = dev.read_bytes(0, 16).unwrap_err();
        assert!(err.is_device_failure());

        dev.fail_writes_after(2);
        dev.write_at(0, b"a").unwrap();
        dev.write_at(1, b"b").unwrap();
        assert!(dev.write_at(2, b"c").is_err());
        assert!(dev.write_at(3, b"d").is_err());

        dev.heal();
        dev.write_at(2, b"c").unwrap();
        assert_eq!(&dev.snapshot()[..3], b"abc");
    }
}
