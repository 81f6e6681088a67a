//! Memory-mapped dump file backend.
//!
//! Maps a raw physical memory dump so that physical address `n` is byte `n`
//! of the file.

use crate::error::{Error, Result};
use crate::traits::PhysicalBackend;
use memmap2::{Mmap, MmapMut, MmapOptions};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use tracing::{debug, info};

/// Internal state for the memory-mapped backend.
enum MmapState {
    ReadOnly(Mmap),
    Writable(MmapMut),
    /// Zero-length files cannot be mapped.
    Empty,
}

impl MmapState {
    fn as_slice(&self) -> &[u8] {
        match self {
            MmapState::ReadOnly(m) => m.as_ref(),
            MmapState::Writable(m) => m.as_ref(),
            MmapState::Empty => &[],
        }
    }
}

/// A raw dump file exposed as physical memory.
///
/// # Thread Safety
///
/// Reads share a `parking_lot::RwLock`; writes and [`close`](Self::close)
/// take it exclusively.
///
/// # Example
///
/// ```rust,ignore
/// let backend = MmapFileBackend::open("physical", "/dumps/target.raw", false)?;
/// let (page, read) = backend.read(0x1000, 0x1000)?;
/// ```
pub struct MmapFileBackend {
    name: String,
    location: String,
    path: PathBuf,
    size: u64,
    writable: bool,
    /// None once the backend has been closed.
    state: RwLock<Option<MmapState>>,
}

// ---------------------------------------------------------------------------
// Always-available helpers
// ---------------------------------------------------------------------------
impl MmapFileBackend {
    /// Parse a file:// URL or plain path.
    fn parse_location(location: &str) -> PathBuf {
        let path_str = match location.strip_prefix("file://") {
            // file:///C:/path -> C:/path
            Some(url_path)
                if url_path.starts_with('/')
                    && url_path.len() > 2
                    && url_path.chars().nth(2) == Some(':') =>
            {
                &url_path[1..]
            }
            Some(url_path) => url_path,
            None => location,
        };

        PathBuf::from(percent_decode(path_str))
    }

    fn create_mmap(path: &PathBuf, writable: bool) -> Result<(MmapState, u64)> {
        let file = if writable {
            OpenOptions::new().read(true).write(true).open(path)?
        } else {
            File::open(path)?
        };

        let size = file.metadata()?.len();
        if size == 0 {
            return Ok((MmapState::Empty, 0));
        }

        let state = if writable {
            MmapState::Writable(unsafe { MmapOptions::new().map_mut(&file)? })
        } else {
            MmapState::ReadOnly(unsafe { MmapOptions::new().map(&file)? })
        };
        Ok((state, size))
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------
impl MmapFileBackend {
    /// Open a dump file.
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the backend
    /// * `location` - File location (file:// URL or plain filesystem path)
    /// * `writable` - Whether writes should reach the file
    pub fn open(name: impl Into<String>, location: impl Into<String>, writable: bool) -> Result<Self> {
        let name = name.into();
        let location = location.into();
        let path = Self::parse_location(&location);
        let (state, size) = Self::create_mmap(&path, writable).map_err(|e| match e {
            Error::Io(io) => Error::backend_unavailable(
                &name,
                format!("cannot map {}: {}", path.display(), io),
            ),
            other => other,
        })?;

        info!(
            "Opened dump {} ({:#x} bytes, {})",
            path.display(),
            size,
            if writable { "writable" } else { "read-only" }
        );

        Ok(MmapFileBackend {
            name,
            location,
            path,
            size,
            writable,
            state: RwLock::new(Some(state)),
        })
    }

    /// Release the mapping. Later calls report the backend as unavailable.
    pub fn close(&self) {
        debug!("Closing dump {}", self.path.display());
        *self.state.write() = None;
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        match self.state.read().as_ref() {
            Some(MmapState::Writable(m)) => Ok(m.flush()?),
            Some(_) => Ok(()),
            None => Err(Error::backend_unavailable(&self.name, "backend closed")),
        }
    }

    /// The file location as given.
    pub fn location(&self) -> &str {
        &self.location
    }
}

// ---------------------------------------------------------------------------
// PhysicalBackend trait implementation
// ---------------------------------------------------------------------------
impl PhysicalBackend for MmapFileBackend {
    fn read_into(&self, address: u64, buf: &mut [u8]) -> Result<usize> {
        let guard = self.state.read();
        let state = guard
            .as_ref()
            .ok_or_else(|| Error::backend_unavailable(&self.name, "backend closed"))?;

        if address >= self.size {
            return Ok(0);
        }

        let data = state.as_slice();
        let start = address as usize;
        let count = buf.len().min(data.len() - start);
        buf[..count].copy_from_slice(&data[start..start + count]);
        Ok(count)
    }

    fn write(&self, address: u64, data: &[u8]) -> Result<usize> {
        let mut guard = self.state.write();
        let state = guard
            .as_mut()
            .ok_or_else(|| Error::backend_unavailable(&self.name, "backend closed"))?;

        let MmapState::Writable(mmap) = state else {
            return Ok(0);
        };
        if address >= self.size {
            return Ok(0);
        }

        let start = address as usize;
        let count = data.len().min(mmap.len() - start);
        mmap[start..start + count].copy_from_slice(&data[..count]);
        Ok(count)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn is_writable(&self) -> bool {
        self.writable
    }
}

/// Decode %XX escapes in file paths.
fn percent_decode(input: &str) -> String {
    let raw = input.as_bytes();
    let mut bytes = Vec::with_capacity(raw.len());
    let mut i = 0;

    while i < raw.len() {
        if raw[i] == b'%' && i + 2 < raw.len() {
            let decoded = std::str::from_utf8(&raw[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = decoded {
                bytes.push(byte);
                i += 3;
                continue;
            }
        }
        bytes.push(raw[i]);
        i += 1;
    }

    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn dump_with(contents: &[u8]) -> NamedTempFile {
        let mut tmpfile = NamedTempFile::new().unwrap();
        tmpfile.write_all(contents).unwrap();
        tmpfile.flush().unwrap();
        tmpfile
    }

    #[test]
    fn test_parse_file_url() {
        let path = MmapFileBackend::parse_location("file:///tmp/test.raw");
        assert_eq!(path, PathBuf::from("/tmp/test.raw"));
    }

    #[test]
    fn test_parse_plain_path() {
        let path = MmapFileBackend::parse_location("/tmp/test.raw");
        assert_eq!(path, PathBuf::from("/tmp/test.raw"));
    }

    #[test]
    fn test_percent_decode() {
        let path = MmapFileBackend::parse_location("file:///tmp/test%20file.raw");
        assert_eq!(path, PathBuf::from("/tmp/test file.raw"));
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("a%zzb"), "a%zzb");
    }

    #[test]
    fn test_open_and_read() {
        let tmpfile = dump_with(b"Hello, World!");
        let backend =
            MmapFileBackend::open("test", tmpfile.path().to_str().unwrap(), false).unwrap();

        assert_eq!(backend.size(), 13);
        let (data, read) = backend.read(7, 5).unwrap();
        assert_eq!(read, 5);
        assert_eq!(&data, b"World");
    }

    #[test]
    fn test_short_read_at_end() {
        let tmpfile = dump_with(b"Hello");
        let backend =
            MmapFileBackend::open("test", tmpfile.path().to_str().unwrap(), false).unwrap();

        let (data, read) = backend.read(3, 5).unwrap();
        assert_eq!(read, 2);
        assert_eq!(&data, b"lo\0\0\0");

        let (data, read) = backend.read(100, 3).unwrap();
        assert_eq!(read, 0);
        assert_eq!(&data, b"\0\0\0");
    }

    #[test]
    fn test_read_only_write_rejected() {
        let tmpfile = dump_with(b"0123456789");
        let backend =
            MmapFileBackend::open("test", tmpfile.path().to_str().unwrap(), false).unwrap();

        assert!(!backend.is_writable());
        assert_eq!(backend.write(0, b"xx").unwrap(), 0);
        assert_eq!(backend.read(0, 2).unwrap().0, b"01");
    }

    #[test]
    fn test_writable_dump() {
        let tmpfile = dump_with(b"0123456789");
        let backend =
            MmapFileBackend::open("test", tmpfile.path().to_str().unwrap(), true).unwrap();

        assert_eq!(backend.write(8, b"abcd").unwrap(), 2);
        backend.flush().unwrap();
        assert_eq!(backend.read(6, 4).unwrap().0, b"67ab");
        assert_eq!(std::fs::read(tmpfile.path()).unwrap(), b"01234567ab");
    }

    #[test]
    fn test_missing_file_is_unavailable() {
        let err = MmapFileBackend::open("test", "/nonexistent/dump.raw", false)
            .err()
            .unwrap();
        assert!(err.is_session_fatal());
    }

    #[test]
    fn test_close() {
        let tmpfile = dump_with(b"data");
        let backend =
            MmapFileBackend::open("test", tmpfile.path().to_str().unwrap(), false).unwrap();

        assert!(backend.read(0, 4).is_ok());
        backend.close();
        assert!(backend.read(0, 4).unwrap_err().is_session_fatal());
    }
}
