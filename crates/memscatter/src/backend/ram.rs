//! In-memory physical backend.
//!
//! Holds a physical image in a byte vector. Ranges can be marked unreadable
//! (reads stop short at them) or stalling (reads touching them time out),
//! which models the sparse validity of live acquisition.

use crate::error::{Error, Result};
use crate::traits::PhysicalBackend;
use parking_lot::RwLock;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct RamBackend {
    name: String,
    data: RwLock<Vec<u8>>,
    read_only: bool,
    holes: Vec<Range<u64>>,
    stalls: Vec<Range<u64>>,
    available: AtomicBool,
}

impl RamBackend {
    /// A zero-filled image of `size` bytes.
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self::from_bytes(name, vec![0u8; size as usize])
    }

    /// An image with the given contents.
    pub fn from_bytes(name: impl Into<String>, data: Vec<u8>) -> Self {
        RamBackend {
            name: name.into(),
            data: RwLock::new(data),
            read_only: false,
            holes: Vec::new(),
            stalls: Vec::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Reject all writes.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Mark a range as unreadable.
    pub fn with_hole(mut self, range: Range<u64>) -> Self {
        self.holes.push(range);
        self
    }

    /// Mark a range as timing out on every read.
    pub fn with_stall(mut self, range: Range<u64>) -> Self {
        self.stalls.push(range);
        self
    }

    /// Simulate the medium disappearing (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Store bytes directly, regardless of the read-only flag.
    pub fn poke(&self, address: u64, bytes: &[u8]) {
        let mut data = self.data.write();
        let start = address as usize;
        let end = (start + bytes.len()).min(data.len());
        if start < end {
            data[start..end].copy_from_slice(&bytes[..end - start]);
        }
    }

    /// Store a little-endian u64.
    pub fn poke_u64(&self, address: u64, value: u64) {
        self.poke(address, &value.to_le_bytes());
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::backend_unavailable(&self.name, "device detached"))
        }
    }

    /// End of the readable run that starts at `address`.
    fn readable_end(&self, address: u64, end: u64) -> u64 {
        self.holes
            .iter()
            .filter(|hole| hole.end > address && hole.start < end)
            .map(|hole| hole.start.max(address))
            .min()
            .unwrap_or(end)
    }
}

impl PhysicalBackend for RamBackend {
    fn read_into(&self, address: u64, buf: &mut [u8]) -> Result<usize> {
        self.check_available()?;

        let data = self.data.read();
        let size = data.len() as u64;
        if address >= size {
            return Ok(0);
        }

        let end = address.saturating_add(buf.len() as u64).min(size);
        if self
            .stalls
            .iter()
            .any(|stall| stall.start < end && stall.end > address)
        {
            return Err(Error::backend_timeout(&self.name, address));
        }

        let end = self.readable_end(address, end);
        let count = (end - address) as usize;
        buf[..count].copy_from_slice(&data[address as usize..end as usize]);
        Ok(count)
    }

    fn write(&self, address: u64, bytes: &[u8]) -> Result<usize> {
        self.check_available()?;
        if self.read_only {
            return Ok(0);
        }

        let mut data = self.data.write();
        let size = data.len() as u64;
        if address >= size {
            return Ok(0);
        }

        let count = bytes.len().min((size - address) as usize);
        let start = address as usize;
        data[start..start + count].copy_from_slice(&bytes[..count]);
        Ok(count)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn is_writable(&self) -> bool {
        !self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write() {
        let ram = RamBackend::new("ram", 0x2000);
        assert_eq!(ram.write(0x1000, &[0xAA, 0xBB]).unwrap(), 2);

        let (data, read) = ram.read(0x1000, 2).unwrap();
        assert_eq!(read, 2);
        assert_eq!(data, vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_short_read_at_end_and_hole() {
        let ram = RamBackend::new("ram", 0x3000).with_hole(0x1800..0x2000);

        let (_, read) = ram.read(0x2ff0, 0x20).unwrap();
        assert_eq!(read, 0x10);

        let (_, read) = ram.read(0x1000, 0x1000).unwrap();
        assert_eq!(read, 0x800);

        let (_, read) = ram.read(0x1900, 0x10).unwrap();
        assert_eq!(read, 0);

        let (_, read) = ram.read(0x2000, 0x1000).unwrap();
        assert_eq!(read, 0x1000);
    }

    #[test]
    fn test_read_only() {
        let ram = RamBackend::new("ram", 0x1000).read_only();
        assert_eq!(ram.write(0, &[1, 2, 3]).unwrap(), 0);
        assert_eq!(ram.read(0, 3).unwrap().0, vec![0, 0, 0]);

        ram.poke(0, &[1, 2, 3]);
        assert_eq!(ram.read(0, 3).unwrap().0, vec![1, 2, 3]);
    }

    #[test]
    fn test_stall_and_detach() {
        let ram = RamBackend::new("ram", 0x3000).with_stall(0x2000..0x3000);
        let err = ram.read(0x2000, 8).unwrap_err();
        assert!(matches!(err, Error::BackendTimeout { address: 0x2000, .. }));
        assert!(!err.is_session_fatal());

        ram.set_available(false);
        assert!(ram.read(0, 8).unwrap_err().is_session_fatal());
        ram.set_available(true);
        assert!(ram.read(0, 8).is_ok());
    }
}
