//! Arena memory manager
//!
//! Managed blocks live in bump-allocated segments. Every block carries a
//! [`BlockHeader`] immediately before its payload: a reference count, the
//! payload size, and a type tag. `release` never reclaims an individual
//! block; reclamation is whole-segment via [`MemoryManager::reset`], so
//! pointers stay valid between resets no matter how refcounts move.
//!
//! Layout of one block:
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ BlockHeader (padded to 16 bytes)     │
//! │  - ref_count: i64                    │
//! │  - size: i64                         │
//! │  - tag: u8                           │
//! ├──────────────────────────────────────┤
//! │ Payload (String or Table)            │
//! └──────────────────────────────────────┘
//! ```

use crate::vm::table::Table;
use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use sunscript_bytecode::TypeTag;
use thiserror::Error;

/// Memory manager errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// The pointer does not belong to any owned segment
    #[error("Pointer is not owned by this memory manager")]
    BadPointer,
}

/// Header stored before each managed payload
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BlockHeader {
    /// Number of live references to the payload.
    pub ref_count: i64,
    /// Payload size in bytes.
    pub size: i64,
    /// Payload type tag.
    pub tag: u8,
}

// Keeps payloads 16-byte aligned behind a 16-byte-aligned header.
const HEADER_SIZE: usize = 32;
const BLOCK_ALIGN: usize = 16;
const FIRST_SEGMENT_SIZE: usize = 64 * 1024;

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Pointer to a managed payload
///
/// Compares by identity; the block header lives directly before the
/// address. Copying the pointer does not touch the reference count — that
/// is the caller's discipline, tracked through
/// [`MemoryManager::addref`]/[`MemoryManager::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ManagedPtr(NonNull<u8>);

impl ManagedPtr {
    /// Raw payload address.
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    unsafe fn header(self) -> *mut BlockHeader {
        self.0.as_ptr().sub(HEADER_SIZE) as *mut BlockHeader
    }

    /// Borrow the payload as `T`.
    ///
    /// # Safety
    ///
    /// The block must have been allocated for a `T` (checked via its tag)
    /// and the owning manager must not have been reset since.
    pub unsafe fn payload<T>(&self) -> &T {
        &*(self.0.as_ptr() as *const T)
    }

    /// Borrow the payload mutably as `T`.
    ///
    /// # Safety
    ///
    /// Same as [`ManagedPtr::payload`], and no other reference to the
    /// payload may be live.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn payload_mut<T>(&self) -> &mut T {
        &mut *(self.0.as_ptr() as *mut T)
    }
}

struct Segment {
    memory: NonNull<u8>,
    layout: Layout,
    pos: usize,
    total: usize,
}

impl Segment {
    fn new(size: usize) -> Segment {
        let layout = Layout::from_size_align(size, BLOCK_ALIGN).expect("segment layout");
        let memory = unsafe { alloc(layout) };
        let memory = NonNull::new(memory).expect("segment allocation failed");
        Segment {
            memory,
            layout,
            pos: 0,
            total: size,
        }
    }

    fn contains(&self, ptr: *const u8) -> bool {
        let start = self.memory.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= start && addr < start + self.total
    }

    /// Bump-allocate a block, returning the payload pointer.
    fn allocate(&mut self, payload_size: usize) -> Option<NonNull<u8>> {
        let start = align_up(self.pos, BLOCK_ALIGN);
        let end = start + HEADER_SIZE + payload_size;
        if end > self.total {
            return None;
        }
        self.pos = end;
        let payload = unsafe { self.memory.as_ptr().add(start + HEADER_SIZE) };
        Some(unsafe { NonNull::new_unchecked(payload) })
    }
}

/// Arena allocator for managed strings and tables
///
/// Instance-local and single-threaded; sharing managed pointers across VM
/// instances is not supported.
pub struct MemoryManager {
    segments: Vec<Segment>,
    blocks: Vec<ManagedPtr>,
    next_segment_size: usize,
}

impl MemoryManager {
    /// Create a manager with no segments; the first allocation maps one.
    pub fn new() -> Self {
        MemoryManager {
            segments: Vec::new(),
            blocks: Vec::new(),
            next_segment_size: FIRST_SEGMENT_SIZE,
        }
    }

    fn allocate_raw(&mut self, payload_size: usize, tag: TypeTag) -> ManagedPtr {
        let payload = match self.segments.last_mut().and_then(|s| s.allocate(payload_size)) {
            Some(payload) => payload,
            None => {
                let needed = align_up(HEADER_SIZE + payload_size, BLOCK_ALIGN);
                let size = self.next_segment_size.max(needed);
                self.next_segment_size = size.saturating_mul(2);
                self.segments.push(Segment::new(size));
                self.segments
                    .last_mut()
                    .and_then(|s| s.allocate(payload_size))
                    .expect("fresh segment must fit the block")
            }
        };

        let ptr = ManagedPtr(payload);
        unsafe {
            ptr.header().write(BlockHeader {
                ref_count: 1,
                size: payload_size as i64,
                tag: tag as u8,
            });
        }
        self.blocks.push(ptr);
        ptr
    }

    /// Allocate a managed string with refcount 1.
    pub fn alloc_string(&mut self, value: String) -> ManagedPtr {
        let ptr = self.allocate_raw(std::mem::size_of::<String>(), TypeTag::String);
        unsafe { (ptr.as_ptr() as *mut String).write(value) };
        ptr
    }

    /// Allocate a managed table with refcount 1.
    pub fn alloc_table(&mut self, value: Table) -> ManagedPtr {
        let ptr = self.allocate_raw(std::mem::size_of::<Table>(), TypeTag::Object);
        unsafe { (ptr.as_ptr() as *mut Table).write(value) };
        ptr
    }

    /// Whether `ptr` lies within an owned segment.
    pub fn owns(&self, ptr: ManagedPtr) -> bool {
        self.segments.iter().any(|s| s.contains(ptr.as_ptr()))
    }

    /// Increment a block's reference count.
    pub fn addref(&self, ptr: ManagedPtr) -> Result<(), MemoryError> {
        if !self.owns(ptr) {
            return Err(MemoryError::BadPointer);
        }
        unsafe { (*ptr.header()).ref_count += 1 };
        Ok(())
    }

    /// Decrement a block's reference count. At zero the block is dead but
    /// stays mapped until [`MemoryManager::reset`].
    pub fn release(&self, ptr: ManagedPtr) -> Result<(), MemoryError> {
        if !self.owns(ptr) {
            return Err(MemoryError::BadPointer);
        }
        unsafe {
            let header = &mut *ptr.header();
            debug_assert!(header.ref_count > 0, "release of dead block");
            header.ref_count -= 1;
        }
        Ok(())
    }

    /// Current reference count of a block.
    pub fn ref_count(&self, ptr: ManagedPtr) -> Result<i64, MemoryError> {
        if !self.owns(ptr) {
            return Err(MemoryError::BadPointer);
        }
        Ok(unsafe { (*ptr.header()).ref_count })
    }

    /// Read a block's type tag, validating segment membership.
    pub fn tag(&self, ptr: ManagedPtr) -> Result<TypeTag, MemoryError> {
        if !self.owns(ptr) {
            return Err(MemoryError::BadPointer);
        }
        Ok(unsafe { Self::tag_unchecked(ptr) })
    }

    /// Read a block's type tag without validating ownership.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation from some [`MemoryManager`].
    pub unsafe fn tag_unchecked(ptr: ManagedPtr) -> TypeTag {
        TypeTag::from_byte((*ptr.header()).tag).unwrap_or(TypeTag::Void)
    }

    /// Drop every payload and free all segments. Every outstanding
    /// [`ManagedPtr`] is invalidated.
    pub fn reset(&mut self) {
        for ptr in self.blocks.drain(..) {
            unsafe {
                match TypeTag::from_byte((*ptr.header()).tag) {
                    Some(TypeTag::String) => {
                        std::ptr::drop_in_place(ptr.as_ptr() as *mut String)
                    }
                    Some(TypeTag::Object) => {
                        std::ptr::drop_in_place(ptr.as_ptr() as *mut Table)
                    }
                    _ => {}
                }
            }
        }
        for segment in self.segments.drain(..) {
            unsafe { dealloc(segment.memory.as_ptr(), segment.layout) };
        }
        self.next_segment_size = FIRST_SEGMENT_SIZE;
    }

    /// One-line statistics report.
    pub fn dump(&self) -> String {
        let used: usize = self.segments.iter().map(|s| s.pos).sum();
        let total: usize = self.segments.iter().map(|s| s.total).sum();
        let live = self
            .blocks
            .iter()
            .filter(|p| unsafe { (*p.header()).ref_count > 0 })
            .count();
        format!(
            "segments: {}, bytes: {}/{}, blocks: {} ({} live)",
            self.segments.len(),
            used,
            total,
            self.blocks.len(),
            live
        )
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_tag() {
        let mut mm = MemoryManager::new();
        let s = mm.alloc_string("hello".to_string());
        let t = mm.alloc_table(Table::new());

        assert_eq!(mm.tag(s).unwrap(), TypeTag::String);
        assert_eq!(mm.tag(t).unwrap(), TypeTag::Object);
        assert_eq!(unsafe { s.payload::<String>() }, "hello");
    }

    #[test]
    fn test_refcount_lifecycle() {
        let mut mm = MemoryManager::new();
        let s = mm.alloc_string("x".to_string());
        assert_eq!(mm.ref_count(s).unwrap(), 1);

        mm.addref(s).unwrap();
        assert_eq!(mm.ref_count(s).unwrap(), 2);

        mm.release(s).unwrap();
        mm.release(s).unwrap();
        assert_eq!(mm.ref_count(s).unwrap(), 0);

        // Dead, but the pointer stays valid until reset.
        assert_eq!(mm.tag(s).unwrap(), TypeTag::String);
    }

    #[test]
    fn test_bad_pointer_rejected() {
        let mm1 = MemoryManager::new();
        let mut mm2 = MemoryManager::new();
        let foreign = mm2.alloc_string("other".to_string());

        assert_eq!(mm1.addref(foreign), Err(MemoryError::BadPointer));
        assert_eq!(mm1.release(foreign), Err(MemoryError::BadPointer));
        assert_eq!(mm1.tag(foreign), Err(MemoryError::BadPointer));
    }

    #[test]
    fn test_segment_growth() {
        let mut mm = MemoryManager::new();
        // Force more than one segment with many strings.
        let ptrs: Vec<_> = (0..4096)
            .map(|i| mm.alloc_string(format!("string-{i}")))
            .collect();
        for (i, ptr) in ptrs.iter().enumerate() {
            assert_eq!(unsafe { ptr.payload::<String>() }, &format!("string-{i}"));
        }
        assert!(mm.dump().starts_with("segments: "));
    }

    #[test]
    fn test_reset_invalidates() {
        let mut mm = MemoryManager::new();
        let s = mm.alloc_string("gone".to_string());
        mm.reset();
        assert!(!mm.owns(s));
        assert_eq!(mm.tag(s), Err(MemoryError::BadPointer));

        // The arena is reusable after reset.
        let s2 = mm.alloc_string("back".to_string());
        assert_eq!(mm.tag(s2).unwrap(), TypeTag::String);
    }
}
