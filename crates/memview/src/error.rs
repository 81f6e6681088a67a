//! Error types for the memview crate.

use thiserror::Error;

/// Layout parsing and structure reading errors.
#[derive(Debug, Error)]
pub enum ViewError {
    #[error("Layout file not found: {0}")]
    FileNotFound(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("XZ/LZMA decompression error: {0}")]
    Decompression(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("Unsupported pointer size {0} (expected 4 or 8)")]
    PointerSize(usize),

    #[error("Type not found: {0}")]
    TypeNotFound(String),

    #[error("Field not found: {field} in type {type_name}")]
    FieldNotFound { type_name: String, field: String },

    #[error("Memory read error at offset {offset:#x}: {msg}")]
    MemoryRead { offset: u64, msg: String },

    #[error("Short read at offset {offset:#x}: wanted {wanted} bytes, got {got}")]
    ShortRead { offset: u64, wanted: usize, got: usize },

    #[error("Invalid pointer: {0:#x}")]
    InvalidPointer(u64),
}

pub type ViewResult<T> = Result<T, ViewError>;
