use crate::ShmError;
use basalt_mmap::SharedMapping;
use basalt_msg::SegmentKey;
use std::ptr;
use std::sync::Arc;

/// One mapped segment. Unmapped when the last handle and the owning
/// `SharedMemoryAccess` entry are gone.
pub(crate) struct Segment {
    key: SegmentKey,
    /// Owns the mmap lifetime; kept alive but not directly accessed after init.
    _mm: SharedMapping,
    /// Raw pointer to the start of the mapped region.
    base: *mut u8,
    len: usize,
}

// SAFETY: the mapping is MAP_SHARED memory that other processes mutate anyway;
// this type never hands out references into it, only raw pointers and copies.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    pub(crate) fn new(key: SegmentKey, mut mm: SharedMapping) -> Self {
        let base = mm.as_mut_ptr();
        let len = mm.len();
        Self {
            key,
            _mm: mm,
            base,
            len,
        }
    }
}

/// Capability to read and write one attached segment.
///
/// Cloning a handle does not create a new mapping. Accessors are bounds
/// checked against the mapped size; there is no locking over the contents.
#[derive(Clone)]
pub struct SegmentHandle {
    pub(crate) segment: Arc<Segment>,
}

impl SegmentHandle {
    #[inline]
    pub fn key(&self) -> SegmentKey {
        self.segment.key
    }

    /// Mapped size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.segment.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.segment.len == 0
    }

    /// Base address of the mapping. Valid while this handle is alive; writes
    /// through it must stay below [`len`](Self::len).
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.segment.base
    }

    /// Pointer to `offset`, checked so that `len` bytes from there are mapped.
    pub fn ptr_at(&self, offset: usize, len: usize) -> Result<*mut u8, ShmError> {
        self.check(offset, len)?;
        // SAFETY: offset + len <= mapped size was just checked
        Ok(unsafe { self.segment.base.add(offset) })
    }

    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<(), ShmError> {
        let src = self.ptr_at(offset, buf.len())?;
        // SAFETY: range checked; the mapping cannot overlap a Rust-owned buffer
        unsafe { ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<(), ShmError> {
        let dst = self.ptr_at(offset, data.len())?;
        // SAFETY: range checked; the mapping cannot overlap a Rust-owned buffer
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    /// True if both handles refer to the same mapping.
    pub fn same_mapping(&self, other: &SegmentHandle) -> bool {
        Arc::ptr_eq(&self.segment, &other.segment)
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), ShmError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.segment.len => Ok(()),
            _ => Err(ShmError::OutOfBounds {
                offset,
                len,
                size: self.segment.len,
            }),
        }
    }
}

impl std::fmt::Debug for SegmentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentHandle")
            .field("key", &self.segment.key)
            .field("base", &self.segment.base)
            .field("len", &self.segment.len)
            .finish()
    }
}
