//! OS platform abstraction: virtual memory, file mapping, and thread
//! coordination primitives used by the heap and the column file loader.

#[cfg(windows)]
mod windows;

#[cfg(unix)]
mod unix;

use crate::config::PAGE_SIZE;
use crate::error::Error;
use std::fs::File;
use std::sync::{Condvar, Mutex};

/// Reserve and commit `size` bytes of anonymous virtual memory, aligned to
/// `PAGE_SIZE`. Memory is zero-initialized by the OS. Returns null on
/// failure. `size` is rounded up to the platform allocation granularity.
///
/// # Safety
/// Caller must eventually call `vm_release` with the returned pointer and
/// the same `size` (before rounding).
#[inline]
pub unsafe fn vm_alloc(size: usize) -> *mut u8 {
    #[cfg(windows)]
    {
        unsafe { windows::page_alloc(size) }
    }
    #[cfg(unix)]
    {
        unsafe { unix::page_alloc(size) }
    }
}

/// Reserve and commit `size` bytes of anonymous virtual memory whose base
/// address is aligned to `align` (a power of two), not merely to
/// `PAGE_SIZE`. Used by `pool::create_pool` with `align == size` so a
/// pool's base satisfies `addr & ~(size - 1) == base` for every address
/// inside it. Returns null on failure.
///
/// # Safety
/// Caller must eventually call `vm_release` with the returned pointer and
/// the same `size` (before rounding).
#[inline]
pub unsafe fn vm_alloc_aligned(size: usize, align: usize) -> *mut u8 {
    #[cfg(windows)]
    {
        unsafe { windows::page_alloc_aligned(size, align) }
    }
    #[cfg(unix)]
    {
        unsafe { unix::page_alloc_aligned(size, align) }
    }
}

/// Release virtual memory previously obtained from `vm_alloc`, unmapping the
/// address range entirely.
///
/// # Safety
/// `ptr` must have been returned by `vm_alloc`, and `size` must match the
/// original allocation size.
#[inline]
pub unsafe fn vm_release(ptr: *mut u8, size: usize) {
    #[cfg(windows)]
    {
        unsafe { windows::page_dealloc(ptr) };
    }
    #[cfg(unix)]
    {
        unsafe { unix::page_dealloc(ptr, size) };
    }
}

/// Discard the physical pages backing `[ptr, ptr+size)` but keep the address
/// range reserved: a subsequent read returns zeros and no address-space
/// change is observable to other mappings. Used by `heap_release_pages` to
/// shrink RSS for large free blocks without touching the buddy structure.
///
/// # Safety
/// `ptr` and `size` must refer to a range within a live `vm_alloc` mapping.
#[inline]
pub unsafe fn vm_decommit(ptr: *mut u8, size: usize) {
    #[cfg(windows)]
    {
        unsafe { windows::page_decommit(ptr, size) };
    }
    #[cfg(unix)]
    {
        unsafe { unix::page_decommit(ptr, size) };
    }
}

/// Re-commit pages previously decommitted by `vm_decommit`.
///
/// # Safety
/// `ptr` and `size` must refer to a range within a live `vm_alloc` mapping
/// that was previously decommitted.
#[inline]
pub unsafe fn vm_recommit(ptr: *mut u8, size: usize) {
    #[cfg(windows)]
    {
        unsafe { windows::page_recommit(ptr, size) };
    }
    #[cfg(unix)]
    {
        // madvise(MADV_DONTNEED) doesn't unmap; touching the range again
        // transparently re-commits it.
        let _ = (ptr, size);
    }
}

/// Round `size` up to a multiple of `PAGE_SIZE`.
#[inline]
pub fn round_up_page(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// A private, read-only mapping of a file's contents.
pub struct FileMap {
    ptr: *mut u8,
    len: usize,
}

impl FileMap {
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// The mapping is read-only and not interior-mutable from our side.
unsafe impl Send for FileMap {}
unsafe impl Sync for FileMap {}

impl Drop for FileMap {
    fn drop(&mut self) {
        if !self.ptr.is_null() && self.len > 0 {
            #[cfg(unix)]
            unsafe {
                unix::unmap_file(self.ptr, self.len)
            };
            #[cfg(windows)]
            unsafe {
                windows::unmap_file(self.ptr)
            };
        }
    }
}

/// Map `file` privately (copy-on-write) and read-only for its full length.
/// The file handle may be dropped by the caller immediately after this
/// returns; the mapping remains valid.
pub fn map_file(file: &File) -> Result<FileMap, Error> {
    let len = file.metadata()?.len() as usize;
    if len == 0 {
        return Ok(FileMap {
            ptr: std::ptr::NonNull::dangling().as_ptr(),
            len: 0,
        });
    }
    #[cfg(unix)]
    let ptr = unsafe { unix::map_file(file, len) }?;
    #[cfg(windows)]
    let ptr = unsafe { windows::map_file(file, len) }?;
    Ok(FileMap { ptr, len })
}

/// Advise the kernel that `[ptr, ptr+len)` will be read sequentially once.
///
/// # Safety
/// `ptr`/`len` must describe a currently-mapped range.
#[inline]
pub unsafe fn advise_sequential(ptr: *const u8, len: usize) {
    #[cfg(unix)]
    unsafe {
        unix::advise_sequential(ptr, len)
    };
    #[cfg(windows)]
    {
        let _ = (ptr, len);
    }
}

/// A simple counting semaphore built on `Mutex`+`Condvar`, used by the
/// cooperative GC to park threads awaiting quiescence. Not on any allocator
/// hot path, so a blocking primitive is appropriate here (unlike `sync.rs`'s
/// spinlocks, which guard allocator-internal data structures).
pub struct Semaphore {
    state: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            state: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    pub fn acquire(&self) {
        let mut count = self.state.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    pub fn release(&self) {
        let mut count = self.state.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_dealloc() {
        unsafe {
            let ptr = vm_alloc(PAGE_SIZE);
            assert!(!ptr.is_null());
            for i in 0..PAGE_SIZE {
                assert_eq!(*ptr.add(i), 0);
            }
            for i in 0..PAGE_SIZE {
                *ptr.add(i) = (i & 0xFF) as u8;
            }
            for i in 0..PAGE_SIZE {
                assert_eq!(*ptr.add(i), (i & 0xFF) as u8);
            }
            vm_release(ptr, PAGE_SIZE);
        }
    }

    #[test]
    fn test_alloc_multiple_pages() {
        unsafe {
            let size = PAGE_SIZE * 8;
            let ptr = vm_alloc(size);
            assert!(!ptr.is_null());
            *ptr = 0xAA;
            *ptr.add(size - 1) = 0xBB;
            assert_eq!(*ptr, 0xAA);
            assert_eq!(*ptr.add(size - 1), 0xBB);
            vm_release(ptr, size);
        }
    }

    #[test]
    fn test_alloc_aligned_is_self_aligned_above_page_size() {
        unsafe {
            let size = PAGE_SIZE * 4;
            let ptr = vm_alloc_aligned(size, size);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize & (size - 1), 0);
            *ptr = 0xAA;
            *ptr.add(size - 1) = 0xBB;
            assert_eq!(*ptr, 0xAA);
            assert_eq!(*ptr.add(size - 1), 0xBB);
            vm_release(ptr, size);
        }
    }

    #[test]
    fn test_map_file_roundtrip() {
        use std::io::Write;
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[1u8, 2, 3, 4, 5]).unwrap();
        tmp.flush().unwrap();
        let file = tmp.reopen().unwrap();
        let map = map_file(&file).unwrap();
        assert_eq!(map.len(), 5);
        let bytes = unsafe { std::slice::from_raw_parts(map.as_ptr(), map.len()) };
        assert_eq!(bytes, &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_semaphore_basic() {
        let sem = Semaphore::new(0);
        sem.release();
        sem.acquire();
    }
}
