//! Executable code storage.
//!
//! A page-aligned anonymous mapping with read/write/execute permission and
//! bump allocation. There is no growth: generated code must not move once
//! emitted, because intra-trace branch displacements are patched assuming
//! stable addresses. Dropping the storage unmaps the whole region and
//! invalidates every function pointer handed out from it.

use crate::error::RewriteError;

pub struct CodeStorage {
    base: *mut u8,
    capacity: usize,
    used: usize,
}

// Emitted code is immutable once `commit` returns; the storage itself is
// only mutated through `&mut self`.
unsafe impl Send for CodeStorage {}

impl CodeStorage {
    /// Map an RWX region of at least `size` bytes, rounded up to the page
    /// size.
    pub fn new(size: usize) -> Result<Self, RewriteError> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let page = page.max(4096);
        let capacity = size.checked_add(page - 1).ok_or(RewriteError::Map(0))? & !(page - 1);

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(RewriteError::Map(errno));
        }

        tracing::debug!(capacity, "mapped code storage");

        Ok(Self {
            base: ptr.cast(),
            capacity,
            used: 0,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.used
    }

    /// Address the next `commit` will hand out.
    #[inline]
    pub fn tail_addr(&self) -> u64 {
        self.base as u64 + self.used as u64
    }

    /// Check that `size` bytes are available and return the writable tail
    /// slice without advancing the cursor.
    pub fn reserve(&mut self, size: usize) -> Result<&mut [u8], RewriteError> {
        if size > self.remaining() {
            return Err(RewriteError::StorageExhausted {
                need: size,
                avail: self.remaining(),
            });
        }
        Ok(unsafe { std::slice::from_raw_parts_mut(self.base.add(self.used), size) })
    }

    /// Advance the cursor over `size` previously reserved bytes, returning
    /// the start of the committed range.
    pub fn commit(&mut self, size: usize) -> Result<*const u8, RewriteError> {
        if size > self.remaining() {
            return Err(RewriteError::StorageExhausted {
                need: size,
                avail: self.remaining(),
            });
        }
        let start = unsafe { self.base.add(self.used) };
        self.used += size;
        Ok(start)
    }
}

impl Drop for CodeStorage {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.cast(), self.capacity);
        }
    }
}
