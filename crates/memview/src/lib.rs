//! Structure reader for raw memory accessors.
//!
//! This crate is the boundary between an acquisition engine and the parsers
//! that turn raw bytes into records. It provides:
//!
//! - [`MemoryAccess`], the read contract any memory view implements
//! - Layout descriptions loaded from `.json` or `.json.xz` files
//! - [`StructReader`] for reading little-endian fields at named offsets
//! - [`ListIterator`] for walking circular doubly-linked lists
//!
//! # Example
//!
//! ```rust,ignore
//! use memview::{parse_layouts_file, StructReader};
//!
//! let layouts = parse_layouts_file("layouts/process.json")?;
//! let reader = StructReader::new(&layouts, &memory, base, "process")?;
//! let pid = reader.read_u32("pid")?;
//! ```

pub mod error;
pub mod parser;
pub mod reader;
pub mod types;

pub use error::{ViewError, ViewResult};
pub use parser::{parse_layouts_bytes, parse_layouts_file, parse_layouts_str};
pub use reader::{ListIterator, MemoryAccess, StructReader};
pub use types::{FieldDef, FieldKind, StructLayout, StructLayouts};
