use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ops::{Deref, DerefMut};

use crate::error::{CoreError, Result};

/// Alignment used for slot memory. A multiple of 512, so it also satisfies
/// direct I/O on 4K-native media.
pub const DEFAULT_ALIGNMENT: usize = 4096;

/// Fixed-size, zero-initialised byte region whose start address is aligned,
/// as required by `O_DIRECT` reads and writes.
pub struct AlignedBuffer {
    ptr: *mut u8,
    size: usize,
    capacity: usize,
    layout: Layout,
}

impl AlignedBuffer {
    pub fn new(size: usize, alignment: usize) -> Result<Self> {
        if size == 0 {
            return Err(CoreError::InvalidConfig(
                "buffer size must be greater than 0".into(),
            ));
        }
        if !alignment.is_power_of_two() {
            return Err(CoreError::InvalidConfig(format!(
                "alignment {alignment} is not a power of 2"
            )));
        }

        let aligned_size = size
            .checked_add(alignment - 1)
            .map(|s| s & !(alignment - 1))
            .ok_or(CoreError::Allocation { size, alignment })?;

        let layout = Layout::from_size_align(aligned_size, alignment)
            .map_err(|_| CoreError::Allocation { size, alignment })?;

        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };

        if ptr.is_null() {
            return Err(CoreError::Allocation {
                size: aligned_size,
                alignment,
            });
        }

        Ok(Self {
            ptr,
            size,
            capacity: aligned_size,
            layout,
        })
    }

    #[inline]
    pub fn new_default(size: usize) -> Result<Self> {
        Self::new(size, DEFAULT_ALIGNMENT)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for `size` initialised bytes for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.as_mut_slice().fill(0);
    }

    #[inline]
    pub fn is_aligned(&self) -> bool {
        (self.ptr as usize).is_multiple_of(self.layout.align())
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            // SAFETY: ptr was returned by alloc_zeroed with this exact layout.
            unsafe {
                dealloc(self.ptr, self.layout);
            }
        }
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl DerefMut for AlignedBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut_slice()
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("size", &self.size)
            .field("capacity", &self.capacity)
            .field("alignment", &self.layout.align())
            .finish()
    }
}

// SAFETY: the buffer exclusively owns its allocation; shared access only hands
// out `&[u8]`.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}
