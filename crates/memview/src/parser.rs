//! Layout file parser. Handles both plain JSON and .json.xz compressed files.

use crate::error::{ViewError, ViewResult};
use crate::types::{LayoutFile, StructLayouts};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use xz2::read::XzDecoder;

/// Magic bytes at the start of every XZ stream.
const XZ_MAGIC: [u8; 6] = [0xFD, b'7', b'z', b'X', b'Z', 0x00];

/// Parse a layout file from a filesystem path.
///
/// `.xz` files are decompressed before parsing.
pub fn parse_layouts_file(path: impl AsRef<Path>) -> ViewResult<StructLayouts> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(ViewError::FileNotFound(path.display().to_string()));
    }

    let file = File::open(path)
        .map_err(|e| ViewError::Io(format!("opening {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    reader
        .read_to_end(&mut buf)
        .map_err(|e| ViewError::Io(format!("reading {}: {}", path.display(), e)))?;

    parse_layouts_bytes(&buf)
}

/// Parse layouts from raw bytes, decompressing XZ data when the magic matches.
pub fn parse_layouts_bytes(bytes: &[u8]) -> ViewResult<StructLayouts> {
    if bytes.starts_with(&XZ_MAGIC) {
        let mut decoder = XzDecoder::new(bytes);
        let mut json = Vec::new();
        decoder
            .read_to_end(&mut json)
            .map_err(|e| ViewError::Decompression(e.to_string()))?;
        let file: LayoutFile =
            serde_json::from_slice(&json).map_err(|e| ViewError::JsonParse(e.to_string()))?;
        return resolve(file);
    }

    let file: LayoutFile =
        serde_json::from_slice(bytes).map_err(|e| ViewError::JsonParse(e.to_string()))?;
    resolve(file)
}

/// Parse layouts from a JSON string.
pub fn parse_layouts_str(json: &str) -> ViewResult<StructLayouts> {
    let file: LayoutFile =
        serde_json::from_str(json).map_err(|e| ViewError::JsonParse(e.to_string()))?;
    resolve(file)
}

fn resolve(file: LayoutFile) -> ViewResult<StructLayouts> {
    if file.pointer_size != 4 && file.pointer_size != 8 {
        return Err(ViewError::PointerSize(file.pointer_size));
    }

    // Nested struct fields must name a known type.
    for layout in file.types.values() {
        for field in layout.fields.values() {
            if let crate::types::FieldKind::Struct { name } = &field.kind {
                if !file.types.contains_key(name) {
                    return Err(ViewError::TypeNotFound(name.clone()));
                }
            }
        }
    }

    Ok(StructLayouts {
        pointer_size: file.pointer_size,
        types: file.types,
    })
}
