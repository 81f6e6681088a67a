//! StructReader: reads structures from memory using layout offsets.
//!
//! Given a base address and a structure name, reads individual fields at the
//! offsets recorded in the layout description.

use crate::error::{ViewError, ViewResult};
use crate::types::{FieldKind, StructLayouts};

/// Trait for reading raw bytes from memory (physical or virtual).
///
/// Defined here rather than in the engine so parsers depend only on this
/// crate. Implementations return an error when the full range cannot be read.
pub trait MemoryAccess: Send + Sync {
    fn read(
        &self,
        offset: u64,
        length: usize,
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>>;
    fn is_valid(&self, offset: u64, length: u64) -> bool;
}

/// Read exactly `length` bytes or fail.
fn read_exact(memory: &dyn MemoryAccess, addr: u64, length: usize) -> ViewResult<Vec<u8>> {
    let bytes = memory.read(addr, length).map_err(|e| ViewError::MemoryRead {
        offset: addr,
        msg: e.to_string(),
    })?;
    if bytes.len() < length {
        return Err(ViewError::ShortRead {
            offset: addr,
            wanted: length,
            got: bytes.len(),
        });
    }
    Ok(bytes)
}

fn decode_pointer(bytes: &[u8], pointer_size: usize) -> ViewResult<u64> {
    match pointer_size {
        4 => Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64),
        8 => Ok(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
            bytes[4], bytes[5], bytes[6], bytes[7],
        ])),
        n => Err(ViewError::PointerSize(n)),
    }
}

/// Reads fields from a structure at a given base address.
///
/// # Example
///
/// ```rust,ignore
/// let reader = StructReader::new(&layouts, &memory, base_addr, "process")?;
/// let pid = reader.read_u32("pid")?;
/// let links = reader.nested("links", "list_entry")?;
/// ```
pub struct StructReader<'a> {
    layouts: &'a StructLayouts,
    memory: &'a dyn MemoryAccess,
    base_addr: u64,
    type_name: String,
}

impl<'a> StructReader<'a> {
    /// Create a new StructReader for a structure at the given address.
    pub fn new(
        layouts: &'a StructLayouts,
        memory: &'a dyn MemoryAccess,
        base_addr: u64,
        type_name: &str,
    ) -> ViewResult<Self> {
        if layouts.get_type(type_name).is_none() {
            return Err(ViewError::TypeNotFound(type_name.to_string()));
        }
        Ok(StructReader {
            layouts,
            memory,
            base_addr,
            type_name: type_name.to_string(),
        })
    }

    /// The base address of this structure in memory.
    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }

    /// The type name of this structure.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    fn field_offset(&self, field: &str) -> ViewResult<usize> {
        self.layouts
            .field_offset(&self.type_name, field)
            .ok_or_else(|| ViewError::FieldNotFound {
                type_name: self.type_name.clone(),
                field: field.to_string(),
            })
    }

    /// Read raw bytes at a field's offset.
    pub fn read_field_bytes(&self, field: &str, length: usize) -> ViewResult<Vec<u8>> {
        let offset = self.field_offset(field)?;
        read_exact(self.memory, self.base_addr + offset as u64, length)
    }

    /// Read a field using the size recorded in its layout.
    pub fn read_field(&self, field: &str) -> ViewResult<Vec<u8>> {
        let def = self
            .layouts
            .field(&self.type_name, field)
            .ok_or_else(|| ViewError::FieldNotFound {
                type_name: self.type_name.clone(),
                field: field.to_string(),
            })?;
        let size = self
            .layouts
            .kind_size(&def.kind)
            .ok_or_else(|| match &def.kind {
                FieldKind::Struct { name } => ViewError::TypeNotFound(name.clone()),
                _ => ViewError::TypeNotFound(self.type_name.clone()),
            })?;
        read_exact(self.memory, self.base_addr + def.offset as u64, size)
    }

    /// Read raw bytes at a specific offset from base.
    pub fn read_at_offset(&self, offset: usize, length: usize) -> ViewResult<Vec<u8>> {
        read_exact(self.memory, self.base_addr + offset as u64, length)
    }

    /// Read a u8 field.
    pub fn read_u8(&self, field: &str) -> ViewResult<u8> {
        let bytes = self.read_field_bytes(field, 1)?;
        Ok(bytes[0])
    }

    /// Read a u16 (little-endian) field.
    pub fn read_u16(&self, field: &str) -> ViewResult<u16> {
        let bytes = self.read_field_bytes(field, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Read a u32 (little-endian) field.
    pub fn read_u32(&self, field: &str) -> ViewResult<u32> {
        let bytes = self.read_field_bytes(field, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a u64 (little-endian) field.
    pub fn read_u64(&self, field: &str) -> ViewResult<u64> {
        let bytes = self.read_field_bytes(field, 8)?;
        Ok(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
            bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    /// Read a pointer-sized value (4 or 8 bytes depending on the layout's pointer size).
    pub fn read_pointer(&self, field: &str) -> ViewResult<u64> {
        let bytes = self.read_field_bytes(field, self.layouts.pointer_size)?;
        decode_pointer(&bytes, self.layouts.pointer_size)
    }

    /// Read a pointer at a raw address (not field-based).
    pub fn read_pointer_at(&self, addr: u64) -> ViewResult<u64> {
        let bytes = read_exact(self.memory, addr, self.layouts.pointer_size)?;
        decode_pointer(&bytes, self.layouts.pointer_size)
    }

    /// Read a NUL-terminated ASCII string from a byte array field.
    pub fn read_string(&self, field: &str, max_length: usize) -> ViewResult<String> {
        let bytes = self.read_field_bytes(field, max_length)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    /// Create a sub-reader for an embedded structure field.
    pub fn nested(&self, field: &str, nested_type: &str) -> ViewResult<StructReader<'a>> {
        let offset = self.field_offset(field)?;
        StructReader::new(
            self.layouts,
            self.memory,
            self.base_addr + offset as u64,
            nested_type,
        )
    }

    /// Create a reader for a structure at a pointer field's target address.
    pub fn deref(&self, field: &str, target_type: &str) -> ViewResult<StructReader<'a>> {
        let ptr = self.read_pointer(field)?;
        if ptr == 0 {
            return Err(ViewError::InvalidPointer(0));
        }
        StructReader::new(self.layouts, self.memory, ptr, target_type)
    }

    /// Iterate over a circular doubly-linked list anchored at `field`.
    ///
    /// Follows forward links (the first pointer of each list entry) until the
    /// walk returns to the head. Yields readers for the containing structures,
    /// whose list entry lives at `containing_field` of `containing_type`.
    pub fn walk_list(
        &self,
        field: &str,
        containing_type: &str,
        containing_field: &str,
    ) -> ViewResult<ListIterator<'a>> {
        let head_addr = self.base_addr + self.field_offset(field)? as u64;
        let entry_offset = self
            .layouts
            .field_offset(containing_type, containing_field)
            .ok_or_else(|| ViewError::FieldNotFound {
                type_name: containing_type.to_string(),
                field: containing_field.to_string(),
            })?;

        Ok(ListIterator {
            layouts: self.layouts,
            memory: self.memory,
            head_addr,
            current_addr: head_addr,
            entry_offset: entry_offset as u64,
            containing_type: containing_type.to_string(),
            max_iterations: 65536,
            iteration_count: 0,
        })
    }
}

/// Iterator over a circular doubly-linked list.
pub struct ListIterator<'a> {
    layouts: &'a StructLayouts,
    memory: &'a dyn MemoryAccess,
    head_addr: u64,
    current_addr: u64,
    entry_offset: u64,
    containing_type: String,
    /// Bound on corrupted or cyclic lists.
    max_iterations: usize,
    iteration_count: usize,
}

impl<'a> ListIterator<'a> {
    /// Get the next entry in the list, or None once the walk returns to the head.
    pub fn next_entry(&mut self) -> ViewResult<Option<StructReader<'a>>> {
        if self.iteration_count >= self.max_iterations {
            return Ok(None);
        }

        let bytes = read_exact(self.memory, self.current_addr, self.layouts.pointer_size)?;
        let flink = decode_pointer(&bytes, self.layouts.pointer_size)?;

        if flink == self.head_addr || flink == 0 {
            return Ok(None);
        }
        if flink < self.entry_offset {
            return Err(ViewError::InvalidPointer(flink));
        }

        self.current_addr = flink;
        self.iteration_count += 1;

        let reader = StructReader::new(
            self.layouts,
            self.memory,
            flink - self.entry_offset,
            &self.containing_type,
        )?;
        Ok(Some(reader))
    }

    /// Collect all entries into a vector.
    pub fn collect_all(&mut self) -> ViewResult<Vec<StructReader<'a>>> {
        let mut results = Vec::new();
        while let Some(entry) = self.next_entry()? {
            results.push(entry);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_layouts_str;
    use std::collections::BTreeMap;
    use std::sync::RwLock;

    /// Sparse mock memory made of independent blocks.
    struct MockMemory {
        data: RwLock<BTreeMap<u64, Vec<u8>>>,
    }

    impl MockMemory {
        fn new() -> Self {
            MockMemory {
                data: RwLock::new(BTreeMap::new()),
            }
        }

        fn write(&self, addr: u64, bytes: &[u8]) {
            self.data.write().unwrap().insert(addr, bytes.to_vec());
        }
    }

    impl MemoryAccess for MockMemory {
        fn read(
            &self,
            offset: u64,
            length: usize,
        ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
            let data = self.data.read().unwrap();
            for (&block_addr, block) in data.iter() {
                if offset >= block_addr && offset + length as u64 <= block_addr + block.len() as u64
                {
                    let start = (offset - block_addr) as usize;
                    return Ok(block[start..start + length].to_vec());
                }
            }
            Err(format!("no data at offset {:#x}", offset).into())
        }

        fn is_valid(&self, offset: u64, length: u64) -> bool {
            self.read(offset, length as usize).is_ok()
        }
    }

    const LAYOUT: &str = r#"{
        "pointer_size": 8,
        "types": {
            "list_entry": {
                "size": 16,
                "fields": {
                    "flink": { "offset": 0, "type": { "kind": "pointer" } },
                    "blink": { "offset": 8, "type": { "kind": "pointer" } }
                }
            },
            "head": {
                "size": 16,
                "fields": { "list": { "offset": 0, "type": { "kind": "struct", "name": "list_entry" } } }
            },
            "process": {
                "size": 64,
                "fields": {
                    "pid": { "offset": 0, "type": { "kind": "u32" } },
                    "links": { "offset": 8, "type": { "kind": "struct", "name": "list_entry" } },
                    "dtb": { "offset": 24, "type": { "kind": "u64" } },
                    "name": { "offset": 32, "type": { "kind": "bytes", "count": 16 } }
                }
            }
        }
    }"#;

    fn process_block(pid: u32, flink: u64, name: &[u8]) -> Vec<u8> {
        let mut block = vec![0u8; 64];
        block[0..4].copy_from_slice(&pid.to_le_bytes());
        block[8..16].copy_from_slice(&flink.to_le_bytes());
        block[24..32].copy_from_slice(&(0x1000u64 * pid as u64).to_le_bytes());
        block[32..32 + name.len()].copy_from_slice(name);
        block
    }

    #[test]
    fn test_read_fields() {
        let layouts = parse_layouts_str(LAYOUT).unwrap();
        let mem = MockMemory::new();
        mem.write(0x2000, &process_block(4, 0, b"System\0"));

        let reader = StructReader::new(&layouts, &mem, 0x2000, "process").unwrap();
        assert_eq!(reader.read_u32("pid").unwrap(), 4);
        assert_eq!(reader.read_u64("dtb").unwrap(), 0x4000);
        assert_eq!(reader.read_string("name", 16).unwrap(), "System");
        assert_eq!(reader.read_field("name").unwrap().len(), 16);

        let links = reader.nested("links", "list_entry").unwrap();
        assert_eq!(links.base_addr(), 0x2008);
        assert_eq!(links.read_pointer("flink").unwrap(), 0);
    }

    #[test]
    fn test_walk_list() {
        let layouts = parse_layouts_str(LAYOUT).unwrap();
        let mem = MockMemory::new();

        // head(0x1000) -> p1.links(0x2008) -> p2.links(0x3008) -> head
        let mut head = vec![0u8; 16];
        head[0..8].copy_from_slice(&0x2008u64.to_le_bytes());
        mem.write(0x1000, &head);
        mem.write(0x2000, &process_block(4, 0x3008, b"System\0"));
        mem.write(0x3000, &process_block(8, 0x1000, b"init\0"));

        let head = StructReader::new(&layouts, &mem, 0x1000, "head").unwrap();
        let entries = head
            .walk_list("list", "process", "links")
            .unwrap()
            .collect_all()
            .unwrap();

        let pids: Vec<u32> = entries.iter().map(|p| p.read_u32("pid").unwrap()).collect();
        assert_eq!(pids, vec![4, 8]);
        assert_eq!(entries[1].base_addr(), 0x3000);
    }

    #[test]
    fn test_type_not_found() {
        let layouts = parse_layouts_str(LAYOUT).unwrap();
        let mem = MockMemory::new();
        assert!(StructReader::new(&layouts, &mem, 0x1000, "nonexistent").is_err());
    }

    #[test]
    fn test_field_not_found() {
        let layouts = parse_layouts_str(LAYOUT).unwrap();
        let mem = MockMemory::new();
        mem.write(0x1000, &[0u8; 64]);

        let reader = StructReader::new(&layouts, &mem, 0x1000, "process").unwrap();
        assert!(matches!(
            reader.read_u32("missing"),
            Err(ViewError::FieldNotFound { .. })
        ));
    }

    #[test]
    fn test_unreadable_memory() {
        let layouts = parse_layouts_str(LAYOUT).unwrap();
        let mem = MockMemory::new();

        let reader = StructReader::new(&layouts, &mem, 0x9000, "process").unwrap();
        assert!(matches!(
            reader.read_u32("pid"),
            Err(ViewError::MemoryRead { offset: 0x9000, .. })
        ));
        assert!(matches!(
            reader.deref("links", "list_entry"),
            Err(ViewError::MemoryRead { .. })
        ));
    }
}
