//! Handle-addressed memory store shared by every interpreter
//! instantiated against it. Handles are positive `i32`s; handle `0` is
//! reserved as null/invalid. Blocks are append-only and never
//! relocated, so span base offsets remain stable for the store's
//! lifetime.

use std::cell::RefCell;

use crate::error::{Error, Result};

/// A span's backing bytes live inside its parent's `Vec<u8>`; rather
/// than borrow across blocks (which `RefCell<Vec<Block>>` can't express
/// safely) every block owns its own buffer and a span is created by
/// copying the parent's current base/offset relationship. Writes to a
/// span are kept in sync with its root by forwarding through `root`
/// rather than aliasing memory directly.
struct Block {
    /// Index of the ultimate non-span block whose buffer actually
    /// holds the bytes. Equal to this block's own index for roots.
    root: usize,
    /// Offset of this block's first byte within `blocks[root]`'s buffer.
    base: usize,
    size: usize,
    read_only: bool,
    /// Only populated for root blocks (`root == self index`).
    buffer: Vec<u8>,
}

/// A single-threaded, append-only arena of byte blocks addressed by
/// handle. Shared by every `Interpreter` built against it (`Rc` in the
/// embedder, interior mutability here since allocation must be
/// possible through a shared reference).
pub struct MemoryStore {
    blocks: RefCell<Vec<Block>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut blocks = Vec::new();
        // handle 0 reserved as null/invalid.
        blocks.push(Block {
            root: 0,
            base: 0,
            size: 0,
            read_only: true,
            buffer: Vec::new(),
        });
        MemoryStore {
            blocks: RefCell::new(blocks),
        }
    }

    pub fn alloc(&self, size: i32) -> Result<i32> {
        if size < 0 {
            return Err(Error::InvalidSize(size));
        }
        let mut blocks = self.blocks.borrow_mut();
        let idx = blocks.len();
        blocks.push(Block {
            root: idx,
            base: 0,
            size: size as usize,
            read_only: false,
            buffer: vec![0u8; size as usize],
        });
        Ok(idx as i32)
    }

    pub fn alloc_readonly(&self, bytes: &[u8]) -> Result<i32> {
        let mut blocks = self.blocks.borrow_mut();
        let idx = blocks.len();
        blocks.push(Block {
            root: idx,
            base: 0,
            size: bytes.len(),
            read_only: true,
            buffer: bytes.to_vec(),
        });
        Ok(idx as i32)
    }

    pub fn make_span(&self, handle: i32, offset: i32, size: i32) -> Result<i32> {
        let mut blocks = self.blocks.borrow_mut();
        let parent_idx = validate_handle(&blocks, handle)?;
        if offset < 0 || size < 0 {
            return Err(Error::OutOfBounds {
                handle,
                offset,
                size: size.max(0) as usize,
            });
        }
        let (offset, size) = (offset as usize, size as usize);
        let parent = &blocks[parent_idx];
        if offset + size > parent.size {
            return Err(Error::OutOfBounds {
                handle,
                offset: offset as i32,
                size,
            });
        }
        let root = parent.root;
        let base = parent.base + offset;
        let read_only = parent.read_only;

        let idx = blocks.len();
        blocks.push(Block {
            root,
            base,
            size,
            read_only,
            buffer: Vec::new(),
        });
        Ok(idx as i32)
    }

    pub fn read_i8(&self, h: i32, offset: i32) -> Result<i8> {
        self.read_bytes(h, offset, 1).map(|b| b[0] as i8)
    }
    pub fn read_u8(&self, h: i32, offset: i32) -> Result<u8> {
        self.read_bytes(h, offset, 1).map(|b| b[0])
    }
    pub fn read_i16(&self, h: i32, offset: i32) -> Result<i16> {
        self.read_bytes(h, offset, 2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
    }
    pub fn read_u16(&self, h: i32, offset: i32) -> Result<u16> {
        self.read_bytes(h, offset, 2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
    }
    pub fn read_i32(&self, h: i32, offset: i32) -> Result<i32> {
        let bytes = self.read_bytes(h, offset, 4)?;
        Ok(i32::from_le_bytes(to_array(bytes)?))
    }
    pub fn read_u32(&self, h: i32, offset: i32) -> Result<u32> {
        let bytes = self.read_bytes(h, offset, 4)?;
        Ok(u32::from_le_bytes(to_array(bytes)?))
    }
    pub fn read_i64(&self, h: i32, offset: i32) -> Result<i64> {
        let bytes = self.read_bytes(h, offset, 8)?;
        Ok(i64::from_le_bytes(to_array(bytes)?))
    }
    pub fn read_u64(&self, h: i32, offset: i32) -> Result<u64> {
        let bytes = self.read_bytes(h, offset, 8)?;
        Ok(u64::from_le_bytes(to_array(bytes)?))
    }
    pub fn read_f32(&self, h: i32, offset: i32) -> Result<f32> {
        let bytes = self.read_bytes(h, offset, 4)?;
        Ok(f32::from_le_bytes(to_array(bytes)?))
    }
    pub fn read_f64(&self, h: i32, offset: i32) -> Result<f64> {
        let bytes = self.read_bytes(h, offset, 8)?;
        Ok(f64::from_le_bytes(to_array(bytes)?))
    }

    pub fn write_i8(&self, h: i32, offset: i32, v: i8) -> Result<()> {
        self.write_bytes(h, offset, &v.to_le_bytes())
    }
    pub fn write_u8(&self, h: i32, offset: i32, v: u8) -> Result<()> {
        self.write_bytes(h, offset, &v.to_le_bytes())
    }
    pub fn write_i16(&self, h: i32, offset: i32, v: i16) -> Result<()> {
        self.write_bytes(h, offset, &v.to_le_bytes())
    }
    pub fn write_u16(&self, h: i32, offset: i32, v: u16) -> Result<()> {
        self.write_bytes(h, offset, &v.to_le_bytes())
    }
    pub fn write_i32(&self, h: i32, offset: i32, v: i32) -> Result<()> {
        self.write_bytes(h, offset, &v.to_le_bytes())
    }
    pub fn write_u32(&self, h: i32, offset: i32, v: u32) -> Result<()> {
        self.write_bytes(h, offset, &v.to_le_bytes())
    }
    pub fn write_i64(&self, h: i32, offset: i32, v: i64) -> Result<()> {
        self.write_bytes(h, offset, &v.to_le_bytes())
    }
    pub fn write_u64(&self, h: i32, offset: i32, v: u64) -> Result<()> {
        self.write_bytes(h, offset, &v.to_le_bytes())
    }
    pub fn write_f32(&self, h: i32, offset: i32, v: f32) -> Result<()> {
        self.write_bytes(h, offset, &v.to_le_bytes())
    }
    pub fn write_f64(&self, h: i32, offset: i32, v: f64) -> Result<()> {
        self.write_bytes(h, offset, &v.to_le_bytes())
    }

    fn read_bytes(&self, handle: i32, offset: i32, size: usize) -> Result<Vec<u8>> {
        let blocks = self.blocks.borrow();
        let idx = validate_handle(&blocks, handle)?;
        let block = &blocks[idx];
        let offset = validate_access(block, handle, offset, size)?;
        let root = &blocks[block.root];
        Ok(root.buffer[offset..offset + size].to_vec())
    }

    fn write_bytes(&self, handle: i32, offset: i32, bytes: &[u8]) -> Result<()> {
        let mut blocks = self.blocks.borrow_mut();
        let idx = validate_handle(&blocks, handle)?;
        if blocks[idx].read_only {
            return Err(Error::WriteToReadOnly(handle));
        }
        let abs_offset = validate_access(&blocks[idx], handle, offset, bytes.len())?;
        let root = blocks[idx].root;
        blocks[root].buffer[abs_offset..abs_offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

fn validate_handle(blocks: &[Block], handle: i32) -> Result<usize> {
    if handle <= 0 || handle as usize >= blocks.len() {
        return Err(Error::InvalidHandle(handle));
    }
    Ok(handle as usize)
}

/// Returns the absolute offset into the root block's buffer.
fn validate_access(block: &Block, handle: i32, offset: i32, size: usize) -> Result<usize> {
    if offset < 0 || (offset as usize) + size > block.size {
        return Err(Error::OutOfBounds {
            handle,
            offset,
            size,
        });
    }
    Ok(block.base + offset as usize)
}

/// Converts the exact-length byte vector `read_bytes` hands back into a
/// fixed-size array for `from_le_bytes`. The length always matches `N`
/// in practice (`read_bytes` copies exactly the requested size); this
/// still reports a fault instead of panicking if that invariant were
/// ever broken.
fn to_array<const N: usize>(bytes: Vec<u8>) -> Result<[u8; N]> {
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| Error::Internal(format!("expected {} bytes, got {}", N, len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_zero_initialized() {
        let store = MemoryStore::new();
        let h = store.alloc(8).unwrap();
        assert_eq!(store.read_i32(h, 0).unwrap(), 0);
    }

    #[test]
    fn test_negative_size_fails() {
        let store = MemoryStore::new();
        assert_eq!(store.alloc(-1), Err(Error::InvalidSize(-1)));
    }

    #[test]
    fn test_write_then_read_round_trips() {
        let store = MemoryStore::new();
        let h = store.alloc(16).unwrap();
        store.write_f64(h, 0, 1.1).unwrap();
        store.write_f64(h, 8, 2.2).unwrap();
        assert!((store.read_f64(h, 0).unwrap() - 1.1).abs() < 1e-12);
        assert!((store.read_f64(h, 8).unwrap() - 2.2).abs() < 1e-12);
    }

    #[test]
    fn test_out_of_bounds() {
        let store = MemoryStore::new();
        let h = store.alloc(4).unwrap();
        assert!(matches!(
            store.read_i32(h, 4),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_invalid_handle() {
        let store = MemoryStore::new();
        assert_eq!(store.read_i32(0, 0), Err(Error::InvalidHandle(0)));
        assert_eq!(store.read_i32(99, 0), Err(Error::InvalidHandle(99)));
    }

    #[test]
    fn test_readonly_write_fails_and_leaves_contents() {
        let store = MemoryStore::new();
        let h = store.alloc_readonly(&[1, 2, 3, 4]).unwrap();
        assert_eq!(store.write_u8(h, 0, 9), Err(Error::WriteToReadOnly(h)));
        assert_eq!(store.read_u8(h, 0).unwrap(), 1);
    }

    #[test]
    fn test_span_aliases_parent() {
        let store = MemoryStore::new();
        let h = store.alloc(12).unwrap();
        let span = store.make_span(h, 4, 8).unwrap();
        store.write_i32(span, 0, 11).unwrap();
        assert_eq!(store.read_i32(h, 4).unwrap(), 11);
    }

    #[test]
    fn test_span_out_of_bounds_rejected() {
        let store = MemoryStore::new();
        let h = store.alloc(8).unwrap();
        assert!(matches!(
            store.make_span(h, 4, 8),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_span_inherits_readonly() {
        let store = MemoryStore::new();
        let h = store.alloc_readonly(&[0u8; 8]).unwrap();
        let span = store.make_span(h, 0, 4).unwrap();
        assert_eq!(store.write_u8(span, 0, 1), Err(Error::WriteToReadOnly(span)));
    }

    #[test]
    fn test_chained_spans() {
        let store = MemoryStore::new();
        let h = store.alloc(16).unwrap();
        let s1 = store.make_span(h, 4, 12).unwrap();
        let s2 = store.make_span(s1, 4, 8).unwrap();
        store.write_i32(s2, 0, 42).unwrap();
        assert_eq!(store.read_i32(h, 8).unwrap(), 42);
    }
}
