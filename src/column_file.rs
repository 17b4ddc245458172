//! Column file framing: the on-disk form of a column is the in-memory
//! byte image of its header followed by its payload and (if present) its
//! external nullmap, written and read back with either a `memcpy` copy
//! or a zero-copy private file mapping.

use crate::block::{attrs, kind, mmod, Header};
use crate::error::Error;
use crate::heap;
use crate::platform;
use crate::rc;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

const HEADER_BYTES: usize = size_of::<Header>();

fn esz_for(type_: i8) -> Result<usize, Error> {
    kind::fixed_esz(type_).ok_or_else(|| Error::type_mismatch("scalar column type", kind::name(type_)))
}

/// Write `v` to `path` in column-file wire format: the header with
/// `mmod`/`order`/`rc`/`SLICE` cleared, then the payload, then the
/// external nullmap if present.
///
/// # Safety
/// `v` must be a live vector header whose type is on the scalar
/// allowlist.
pub unsafe fn col_save(v: *const Header, path: &Path) -> Result<(), Error> {
    unsafe {
        let type_ = (*v).type_;
        if type_ == kind::ENUM {
            return Err(Error::Nyi("ENUM columns are not yet supported by column file I/O"));
        }
        if !kind::FILE_ALLOWLIST.contains(&type_) {
            return Err(Error::type_mismatch("scalar column type", kind::name(type_)));
        }
        let esz = esz_for(type_)?;
        let len = (*v).len();
        if len < 0 {
            return Err(Error::Range("column length must be non-negative"));
        }

        let mut stored = std::ptr::read(v);
        stored.mmod = 0;
        stored.order = 0;
        stored.rc = std::sync::atomic::AtomicU32::new(0);
        stored.attrs &= !attrs::SLICE;

        let mut file = File::create(path)?;
        file.write_all(header_bytes(&stored))?;
        let payload_len = len as usize * esz;
        let payload = std::slice::from_raw_parts((*v).payload_ptr(), payload_len);
        file.write_all(payload)?;

        if (*v).attrs & attrs::NULLMAP_EXT != 0 {
            let bitmap = (*v).ext_nullmap();
            let bitmap_len = (len as usize).div_ceil(8);
            let bits = std::slice::from_raw_parts((*bitmap).payload_ptr(), bitmap_len);
            file.write_all(bits)?;
        }
        Ok(())
    }
}

fn header_bytes(h: &Header) -> &[u8] {
    unsafe { std::slice::from_raw_parts(h as *const Header as *const u8, HEADER_BYTES) }
}

fn validate_header(h: &Header, file_size: u64) -> Result<(usize, usize), Error> {
    if !kind::FILE_ALLOWLIST.contains(&h.type_) {
        return Err(Error::Corrupt("column file type not on the scalar allowlist"));
    }
    let len = h.len();
    if len < 0 {
        return Err(Error::Corrupt("column file length is negative"));
    }
    let esz = esz_for(h.type_)?;
    let len = len as usize;
    let payload_len = len * esz;
    let without_bitmap = HEADER_BYTES as u64 + payload_len as u64;
    let bitmap_len = (len).div_ceil(8);
    let with_bitmap = without_bitmap + bitmap_len as u64;
    if file_size == without_bitmap {
        Ok((len, 0))
    } else if h.attrs & attrs::HAS_NULLS != 0 && file_size == with_bitmap {
        Ok((len, bitmap_len))
    } else {
        Err(Error::Corrupt("column file size disagrees with header length"))
    }
}

/// Read and verify a column file's header, then `memcpy` its payload (and
/// nullmap, if present) into a freshly allocated buddy vector.
pub fn col_load_copy(path: &Path) -> Result<*mut Header, Error> {
    let mut file = File::open(path)?;
    let file_size = file.metadata()?.len();
    let mut header_buf = [0u8; HEADER_BYTES];
    file.read_exact(&mut header_buf)?;
    let stored: Header = unsafe { std::ptr::read(header_buf.as_ptr() as *const Header) };
    let (len, bitmap_len) = validate_header(&stored, file_size)?;
    let esz = esz_for(stored.type_)?;
    let payload_len = len * esz;

    let out = heap::with_heap(|heap| heap.allocate(payload_len))?;
    unsafe {
        (*out).type_ = stored.type_;
        (*out).attrs = stored.attrs & !attrs::NULLMAP_EXT;
        (*out).set_len(len as i64);
        if stored.attrs & attrs::HAS_NULLS != 0 && bitmap_len == 0 {
            // Inline nullmap: the null bits live directly in the header's
            // `overlay`, which `col_save` writes to disk verbatim. A fresh
            // allocation zeroes `overlay`, so it must be copied back from
            // the stored header or the null set is silently lost.
            (*out).overlay = stored.overlay;
        }
        let dst = std::slice::from_raw_parts_mut((*out).payload_mut_ptr(), payload_len);
        file.read_exact(dst)?;

        if bitmap_len > 0 {
            let mut bits = vec![0u8; bitmap_len];
            file.read_exact(&mut bits)?;
            let bitmap = heap::with_heap(|heap| heap.allocate(bitmap_len))?;
            (*bitmap).type_ = kind::BOOL;
            (*bitmap).set_len((bitmap_len * 8) as i64);
            std::ptr::copy_nonoverlapping(bits.as_ptr(), (*bitmap).payload_mut_ptr(), bitmap_len);
            (*out).attrs |= attrs::NULLMAP_EXT;
            (*out).set_ext_nullmap(bitmap);
        }
    }
    Ok(out)
}

/// Read and verify a column file's header, then privately map the whole
/// file and return a header patched to point at it (`mmod = FILE_MAPPED`,
/// `rc = 1`). The mapping is released through the ordinary `rc::release`
/// path when the last reference drops.
pub fn col_load_mmap(path: &Path) -> Result<*mut Header, Error> {
    let file = File::open(path)?;
    let file_size = file.metadata()?.len();
    let map = platform::map_file(&file)?;
    if (map.len() as u64) < HEADER_BYTES as u64 {
        return Err(Error::Corrupt("column file too small to hold a header"));
    }
    let stored: Header = unsafe { std::ptr::read(map.as_ptr() as *const Header) };
    validate_header(&stored, file_size)?;
    if stored.attrs & attrs::NULLMAP_EXT != 0 {
        // The external nullmap's `overlay` slot holds the saving process's
        // live heap pointer, not a reloadable on-disk reference — patching
        // it in place would leave `rc::release`/`is_null` dereferencing
        // garbage. Mapping these zero-copy isn't supported; `col_load_copy`
        // materializes a proper nullmap vector instead.
        return Err(Error::Nyi("zero-copy mmap load of a column with an external nullmap"));
    }

    unsafe {
        let raw = map.as_ptr() as *mut Header;
        (*raw).mmod = mmod::FILE_MAPPED;
        (*raw).rc = std::sync::atomic::AtomicU32::new(1);
        (*raw).order = 0;
        // The mapping must outlive the returned header; leaking `map` here
        // is intentional, it is reclaimed by `ThreadHeap::free_file_mapped`
        // calling `vm_release` on the exact same range when `rc` hits 0.
        std::mem::forget(map);
        Ok(raw)
    }
}

/// Validate a stored header without allocating — used by `splay`/`partition_io`
/// to check a directory member before committing to either load mode.
pub fn peek_header(path: &Path) -> Result<(i8, i64), Error> {
    let mut file = File::open(path)?;
    let file_size = file.metadata()?.len();
    let mut header_buf = [0u8; HEADER_BYTES];
    file.read_exact(&mut header_buf)?;
    let stored: Header = unsafe { std::ptr::read(header_buf.as_ptr() as *const Header) };
    validate_header(&stored, file_size)?;
    Ok((stored.type_, stored.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::with_heap;
    use crate::vector;

    fn make_i64_vec(values: &[i64]) -> *mut Header {
        let mut v = vector::vec_new(kind::I64, 0).unwrap();
        for x in values {
            v = unsafe { vector::vec_append(v, &x.to_le_bytes()).unwrap() };
        }
        v
    }

    #[test]
    fn save_then_copy_load_roundtrips() {
        let v = make_i64_vec(&(0..1024).collect::<Vec<i64>>());
        let tmp = tempfile::NamedTempFile::new().unwrap();
        unsafe {
            col_save(v, tmp.path()).unwrap();
        }
        let loaded = col_load_copy(tmp.path()).unwrap();
        unsafe {
            assert_eq!((*loaded).len(), 1024);
            let data = (*loaded).payload_ptr() as *const i64;
            for i in 0..1024 {
                assert_eq!(*data.add(i), i as i64);
            }
            rc::release(v);
            rc::release(loaded);
        }
    }

    #[test]
    fn save_then_mmap_load_roundtrips_and_releases() {
        let v = make_i64_vec(&(0..1024).collect::<Vec<i64>>());
        let tmp = tempfile::NamedTempFile::new().unwrap();
        unsafe {
            col_save(v, tmp.path()).unwrap();
        }
        let loaded = col_load_mmap(tmp.path()).unwrap();
        unsafe {
            assert_eq!((*loaded).len(), 1024);
            assert_eq!((*loaded).mmod, mmod::FILE_MAPPED);
            let data = (*loaded).payload_ptr() as *const i64;
            for i in 0..1024 {
                assert_eq!(*data.add(i), i as i64);
            }
            rc::release(v);
            rc::release(loaded); // drives the FILE_MAPPED free path (vm_release)
        }
        with_heap(|_| {}); // ensure the thread's heap was actually touched above
    }

    #[test]
    fn corrupt_type_is_rejected() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut bogus = [0u8; HEADER_BYTES];
        bogus[16] = kind::TABLE as u8; // TABLE is never on the scalar allowlist
        std::fs::write(tmp.path(), bogus).unwrap();
        assert!(col_load_copy(tmp.path()).is_err());
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let v = make_i64_vec(&[1, 2, 3]);
        let tmp = tempfile::NamedTempFile::new().unwrap();
        unsafe {
            col_save(v, tmp.path()).unwrap();
            rc::release(v);
        }
        let mut bytes = std::fs::read(tmp.path()).unwrap();
        bytes.push(0xFF);
        std::fs::write(tmp.path(), &bytes).unwrap();
        assert!(col_load_copy(tmp.path()).is_err());
    }
}
