//! Windows virtual memory and file-mapping implementation using
//! VirtualAlloc/VirtualFree and CreateFileMapping/MapViewOfFile.

use crate::error::Error;
use std::ffi::c_void;
use std::fs::File;
use std::os::windows::io::AsRawHandle;

const MEM_COMMIT: u32 = 0x1000;
const MEM_RESERVE: u32 = 0x2000;
const MEM_RELEASE: u32 = 0x8000;
const MEM_DECOMMIT: u32 = 0x4000;
const PAGE_READWRITE: u32 = 0x04;
const PAGE_READONLY: u32 = 0x02;
const FILE_MAP_READ: u32 = 0x0004;

// Windows allocation granularity is 64 KiB.
const ALLOC_GRANULARITY: usize = 65536;

unsafe extern "system" {
    #[link_name = "VirtualAlloc"]
    fn virtual_alloc(
        lp_address: *mut c_void,
        dw_size: usize,
        fl_allocation_type: u32,
        fl_protect: u32,
    ) -> *mut c_void;

    #[link_name = "VirtualFree"]
    fn virtual_free(lp_address: *mut c_void, dw_size: usize, dw_free_type: u32) -> i32;

    #[link_name = "CreateFileMappingW"]
    fn create_file_mapping(
        h_file: *mut c_void,
        lp_attributes: *mut c_void,
        fl_protect: u32,
        dw_max_size_high: u32,
        dw_max_size_low: u32,
        lp_name: *const u16,
    ) -> *mut c_void;

    #[link_name = "MapViewOfFile"]
    fn map_view_of_file(
        h_file_mapping_object: *mut c_void,
        dw_desired_access: u32,
        dw_file_offset_high: u32,
        dw_file_offset_low: u32,
        dw_number_of_bytes_to_map: usize,
    ) -> *mut c_void;

    #[link_name = "UnmapViewOfFile"]
    fn unmap_view_of_file(lp_base_address: *mut c_void) -> i32;

    #[link_name = "CloseHandle"]
    fn close_handle(h_object: *mut c_void) -> i32;
}

#[inline]
const fn round_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    let alloc_size = round_up(size, ALLOC_GRANULARITY);
    let ptr = unsafe {
        virtual_alloc(
            std::ptr::null_mut(),
            alloc_size,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        )
    };
    ptr as *mut u8
}

/// Reserve and commit `size` bytes self-aligned to `align` (a power of
/// two greater than `ALLOC_GRANULARITY`). `VirtualFree(MEM_RELEASE)` only
/// ever releases a whole mapping, so there is no lead/trail trim as on
/// Unix: instead over-reserve, release the whole thing, then immediately
/// re-request memory at the aligned address the first reservation proved
/// was free. A concurrent allocator could win that address first, so the
/// re-request is retried a bounded number of times before giving up.
pub unsafe fn page_alloc_aligned(size: usize, align: usize) -> *mut u8 {
    const MAX_ATTEMPTS: u32 = 8;
    for _ in 0..MAX_ATTEMPTS {
        let probe_size = size + align;
        let probe = unsafe { virtual_alloc(std::ptr::null_mut(), probe_size, MEM_RESERVE, PAGE_READWRITE) };
        if probe.is_null() {
            return std::ptr::null_mut();
        }
        let probe_addr = probe as usize;
        let aligned_addr = round_up(probe_addr, align);
        unsafe { virtual_free(probe, 0, MEM_RELEASE) };

        let claimed = unsafe {
            virtual_alloc(
                aligned_addr as *mut c_void,
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        if !claimed.is_null() {
            return claimed as *mut u8;
        }
        // Someone else claimed the aligned address between our release and
        // re-request; retry with a fresh probe.
    }
    std::ptr::null_mut()
}

pub unsafe fn page_dealloc(ptr: *mut u8) {
    unsafe { virtual_free(ptr as *mut c_void, 0, MEM_RELEASE) };
}

pub unsafe fn page_decommit(ptr: *mut u8, size: usize) {
    unsafe { virtual_free(ptr as *mut c_void, size, MEM_DECOMMIT) };
}

pub unsafe fn page_recommit(ptr: *mut u8, size: usize) {
    unsafe { virtual_alloc(ptr as *mut c_void, size, MEM_COMMIT, PAGE_READWRITE) };
}

pub unsafe fn map_file(file: &File, len: usize) -> Result<*mut u8, Error> {
    let mapping = unsafe {
        create_file_mapping(
            file.as_raw_handle() as *mut c_void,
            std::ptr::null_mut(),
            PAGE_READONLY,
            0,
            0,
            std::ptr::null(),
        )
    };
    if mapping.is_null() {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    let view = unsafe { map_view_of_file(mapping, FILE_MAP_READ, 0, 0, len) };
    unsafe { close_handle(mapping) };
    if view.is_null() {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(view as *mut u8)
}

pub unsafe fn unmap_file(ptr: *mut u8) {
    unsafe { unmap_view_of_file(ptr as *mut c_void) };
}
