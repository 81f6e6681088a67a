//! Physical backend implementations.
//!
//! - `MmapFileBackend` - raw memory dump mapped from disk
//! - `RamBackend` - in-memory image with optional unreadable or stalling ranges
//!
//! Live acquisition devices are supplied by a [`crate::DeviceConnector`].

pub mod mmap_file;
pub mod ram;

pub use mmap_file::MmapFileBackend;
pub use ram::RamBackend;
