//! Error types for engine operations.

use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by engine calls.
///
/// Only [`Error::BackendUnavailable`] is fatal to a session. Everything else
/// describes a single request; inside a batch those conditions are recorded
/// per item as a [`FailureReason`] instead of being returned.
#[derive(Error, Debug)]
pub enum Error {
    /// The acquisition medium is gone (closed dump, detached device).
    #[error("Backend '{backend}' unavailable: {message}")]
    BackendUnavailable { backend: String, message: String },

    /// The backend did not answer in time.
    #[error("Backend '{backend}' timed out at {address:#x}")]
    BackendTimeout { backend: String, address: u64 },

    /// Fewer bytes than requested could be read.
    #[error("Short read at {address:#x}: {read} of {requested} bytes")]
    ShortRead {
        address: u64,
        requested: usize,
        read: usize,
    },

    /// Fewer bytes than requested were accepted by the backend.
    #[error("Partial write at {address:#x}: {accepted} of {requested} bytes accepted")]
    PartialWrite {
        address: u64,
        requested: usize,
        accepted: usize,
    },

    /// The virtual address has no backing page.
    #[error("Address {address:#x} not mapped ({level} entry {entry:#x})")]
    TranslationNotMapped {
        address: u64,
        level: &'static str,
        entry: u64,
    },

    /// A paging-structure read failed during the walk.
    #[error("Could not read {level} entry at {entry_address:#x} while translating {address:#x}")]
    TranslationBackendFailure {
        address: u64,
        level: &'static str,
        entry_address: u64,
    },

    /// The address lies outside the addressable range.
    #[error("Address {address:#x} out of bounds: {message}")]
    OutOfBounds { address: u64, message: String },

    /// No address space is registered for the process.
    #[error("Process {0} not found")]
    ProcessNotFound(u32),

    /// Invalid parameter provided.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a BackendUnavailable error.
    pub fn backend_unavailable(backend: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::BackendUnavailable {
            backend: backend.into(),
            message: msg.into(),
        }
    }

    /// Create a BackendTimeout error.
    pub fn backend_timeout(backend: impl Into<String>, address: u64) -> Self {
        Error::BackendTimeout {
            backend: backend.into(),
            address,
        }
    }

    /// Create an OutOfBounds error.
    pub fn out_of_bounds(address: u64, msg: impl Into<String>) -> Self {
        Error::OutOfBounds {
            address,
            message: msg.into(),
        }
    }

    /// Whether the error ends the acquisition session.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Error::BackendUnavailable { .. })
    }

    /// Item-level classification of this error, as recorded in batch results.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            Error::BackendUnavailable { .. } => FailureReason::BackendUnavailable,
            Error::BackendTimeout { .. } => FailureReason::Timeout,
            Error::ShortRead { .. } | Error::Io(_) => FailureReason::ShortRead,
            Error::PartialWrite { .. } => FailureReason::PartialWrite,
            Error::TranslationNotMapped { .. } => FailureReason::NotMapped,
            Error::TranslationBackendFailure { .. } => FailureReason::BackendFailure,
            Error::OutOfBounds { .. } => FailureReason::OutOfBounds,
            Error::ProcessNotFound(_) => FailureReason::ProcessNotFound,
            Error::InvalidParameter(_) | Error::Config(_) => FailureReason::InvalidRequest,
        }
    }
}

/// Why a single scatter item failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Definitive: the address has no backing page.
    NotMapped,
    /// Transient: a paging structure could not be read.
    BackendFailure,
    /// The backend returned fewer bytes than the item needed.
    ShortRead,
    /// The backend accepted fewer bytes than the item carried.
    PartialWrite,
    /// The address is outside the addressable range.
    OutOfBounds,
    /// The process has no registered address space.
    ProcessNotFound,
    /// The backend timed out for this item's frame.
    Timeout,
    /// The backend went away mid-batch.
    BackendUnavailable,
    /// The item itself is malformed (e.g. longer than a frame).
    InvalidRequest,
}

impl FailureReason {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            FailureReason::BackendFailure | FailureReason::Timeout | FailureReason::ShortRead
        )
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            FailureReason::NotMapped => "not mapped",
            FailureReason::BackendFailure => "paging structure unreadable",
            FailureReason::ShortRead => "short read",
            FailureReason::PartialWrite => "partial write",
            FailureReason::OutOfBounds => "out of bounds",
            FailureReason::ProcessNotFound => "process not found",
            FailureReason::Timeout => "backend timeout",
            FailureReason::BackendUnavailable => "backend unavailable",
            FailureReason::InvalidRequest => "invalid request",
        };
        f.write_str(text)
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_mapped_error() {
        let err = Error::TranslationNotMapped {
            address: 0x7ff0_0000_1000,
            level: "page table",
            entry: 0,
        };
        assert!(err.to_string().contains("0x7ff000001000"));
        assert!(err.to_string().contains("page table"));
        assert_eq!(err.failure_reason(), FailureReason::NotMapped);
    }

    #[test]
    fn test_only_unavailable_is_fatal() {
        assert!(Error::backend_unavailable("physical", "closed").is_session_fatal());
        assert!(!Error::backend_timeout("physical", 0x1000).is_session_fatal());
        assert!(!Error::out_of_bounds(0x1000, "beyond dump").is_session_fatal());
        assert!(!Error::ProcessNotFound(4).is_session_fatal());
    }

    #[test]
    fn test_failure_reason_transience() {
        assert!(FailureReason::BackendFailure.is_transient());
        assert!(FailureReason::Timeout.is_transient());
        assert!(!FailureReason::NotMapped.is_transient());
        assert!(!FailureReason::OutOfBounds.is_transient());
        assert_eq!(FailureReason::NotMapped.to_string(), "not mapped");
    }
}
