//! Core traits for abstracting the acquisition medium.
//!
//! The [`PhysicalBackend`] trait lets the cache, walker and executor work with
//! any source of physical memory: raw dump files, in-memory images, or live
//! acquisition devices injected by the embedding application.

use crate::error::Result;
use std::sync::Arc;

/// Byte-range access to a target's physical address space.
///
/// Reads beyond the end of the medium or into unreadable ranges are short,
/// not errors: the return value says how many leading bytes of `buf` were
/// filled. `Err` is reserved for conditions that affect the medium as a whole
/// ([`crate::Error::BackendUnavailable`]) or the specific call
/// ([`crate::Error::BackendTimeout`]).
pub trait PhysicalBackend: Send + Sync {
    /// Read into `buf` starting at `address`. Returns the number of leading
    /// bytes filled.
    fn read_into(&self, address: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write `data` at `address`. Returns the number of bytes accepted.
    ///
    /// Acceptance does not promise visibility on the next read; read-only
    /// media accept nothing and return `Ok(0)`.
    fn write(&self, address: u64, data: &[u8]) -> Result<usize>;

    /// The name of this backend.
    fn name(&self) -> &str;

    /// Exclusive upper bound of the physical address space.
    fn size(&self) -> u64;

    /// Whether writes can be accepted at all.
    fn is_writable(&self) -> bool;

    /// Read `length` bytes at `address` into a fresh buffer. The buffer is
    /// always `length` long; bytes past the returned count are zero.
    fn read(&self, address: u64, length: usize) -> Result<(Vec<u8>, usize)> {
        let mut buf = vec![0u8; length];
        let read = self.read_into(address, &mut buf)?;
        Ok((buf, read))
    }
}

/// Produces backends for live acquisition devices.
///
/// Device handshakes and configuration live with the implementor; the engine
/// only asks for a ready backend by identifier.
pub trait DeviceConnector {
    fn connect(&self, identifier: &str) -> Result<Arc<dyn PhysicalBackend>>;
}
