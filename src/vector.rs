//! Typed columnar vector storage: construction, element size resolution,
//! append/concat with copy-on-write, nullmaps, and slice views.

use crate::block::{attrs, kind, Header};
use crate::error::Error;
use crate::heap;
use crate::rc;
use std::sync::atomic::Ordering;

const PTR_SIZE: usize = size_of::<usize>();

/// Element size in bytes for a vector header, resolving `SYM`'s
/// attrs-encoded width and falling back to pointer size for the
/// pointer-array kinds (`LIST`, `STR`, `TABLE` columns, `PARTED`
/// segments).
///
/// # Safety
/// `h` must point to a live, non-atom vector header.
pub unsafe fn esz(h: *const Header) -> usize {
    unsafe {
        let t = (*h).type_;
        if t == kind::SYM {
            return attrs::sym_width_bytes((*h).attrs);
        }
        match kind::fixed_esz(t) {
            Some(sz) => sz,
            None => PTR_SIZE,
        }
    }
}

fn capacity_for(kind_tag: i8, attrs_byte: u8, cap: usize) -> usize {
    if kind_tag == kind::SYM {
        cap * attrs::sym_width_bytes(attrs_byte)
    } else {
        match kind::fixed_esz(kind_tag) {
            Some(sz) => cap * sz,
            None => cap * PTR_SIZE,
        }
    }
}

/// Allocate a new, zeroed vector of `cap` elements of kind `kind_tag`.
pub fn vec_new(kind_tag: i8, cap: usize) -> Result<*mut Header, Error> {
    if kind::is_atom(kind_tag) {
        return Err(Error::type_mismatch("vector kind", "atom kind"));
    }
    let payload_bytes = capacity_for(kind_tag, attrs::SYM_W64, cap);
    let h = heap::with_heap(|heap| heap.allocate(payload_bytes))?;
    unsafe {
        (*h).type_ = kind_tag;
        (*h).set_len(cap as i64);
        if kind_tag == kind::SYM {
            (*h).attrs = attrs::SYM_W64;
        }
        let payload = (*h).payload_mut_ptr();
        std::ptr::write_bytes(payload, 0, payload_bytes);
    }
    Ok(h)
}

/// Append `elem` (`esz(v)` bytes) to vector `v`, copy-on-writing and
/// growing capacity as needed. Returns the (possibly new) vector header;
/// callers must use the returned pointer, not the one they passed in.
///
/// # Safety
/// `v` must be a live, non-slice vector header; `elem` must be exactly
/// `esz(v)` bytes.
pub unsafe fn vec_append(v: *mut Header, elem: &[u8]) -> Result<*mut Header, Error> {
    unsafe {
        if (*v).attrs & attrs::SLICE != 0 {
            return Err(Error::type_mismatch("appendable vector", "slice view"));
        }
        let v = rc::cow(v);
        let element_size = esz(v);
        debug_assert_eq!(elem.len(), element_size);
        let len = (*v).len();
        let needed = (len as usize + 1) * element_size;
        if needed <= (*v).payload_capacity() {
            let dst = (*v).payload_mut_ptr().add(len as usize * element_size);
            dst.copy_from_nonoverlapping(elem.as_ptr(), element_size);
            (*v).set_len(len + 1);
            return Ok(v);
        }
        let new_cap = ((len as usize + 1) * 2).max(1);
        let grown = scratch_realloc(v, capacity_for((*v).type_, (*v).attrs, new_cap))?;
        let dst = (*grown).payload_mut_ptr().add(len as usize * element_size);
        dst.copy_from_nonoverlapping(elem.as_ptr(), element_size);
        (*grown).set_len(len + 1);
        Ok(grown)
    }
}

/// Grow (or shrink) `v` to a block able to hold `new_payload_bytes`,
/// preserving metadata, payload prefix, and owned children, then
/// releasing the original block.
///
/// # Safety
/// `v` must be uniquely owned (`rc == 1`) — callers `cow` before calling
/// this.
pub unsafe fn scratch_realloc(v: *mut Header, new_payload_bytes: usize) -> Result<*mut Header, Error> {
    unsafe {
        let new_block = heap::with_heap(|heap| heap.allocate(new_payload_bytes))?;
        let old_payload_len = (*v).payload_capacity();
        let copy_len = old_payload_len.min(new_payload_bytes);
        std::ptr::copy_nonoverlapping((*v).payload_ptr(), (*new_block).payload_mut_ptr(), copy_len);
        (*new_block).type_ = (*v).type_;
        (*new_block).attrs = (*v).attrs;
        (*new_block).mmod = (*v).mmod;
        (*new_block).val = (*v).val;
        (*new_block).overlay = (*v).overlay;

        // Any owned children now live (by raw bytes) in `new_block`'s
        // payload too; retain them there, then detach `v`'s slots so
        // releasing `v` below doesn't double-release them.
        rc::retain_children(new_block);
        rc::detach_children(v);
        (*v).rc.store(0, Ordering::Relaxed);
        heap::with_heap(|heap| heap.free_block(v));
        Ok(new_block)
    }
}

/// Concatenate `a` and `b` (same kind) into a freshly allocated vector.
///
/// # Safety
/// `a` and `b` must be live vectors of the same kind.
pub unsafe fn vec_concat(a: *const Header, b: *const Header) -> Result<*mut Header, Error> {
    unsafe {
        if (*a).type_ != (*b).type_ {
            return Err(Error::type_mismatch(kind::name((*a).type_), kind::name((*b).type_)));
        }
        let element_size = esz(a);
        let total = (*a).len() as usize + (*b).len() as usize;
        let out = vec_new((*a).type_, total)?;
        (*out).attrs = (*a).attrs;
        let dst = (*out).payload_mut_ptr();
        std::ptr::copy_nonoverlapping((*a).payload_ptr(), dst, (*a).len() as usize * element_size);
        std::ptr::copy_nonoverlapping(
            (*b).payload_ptr(),
            dst.add((*a).len() as usize * element_size),
            (*b).len() as usize * element_size,
        );
        if (*a).type_ == kind::LIST || (*a).type_ == kind::STR {
            let slots = (*out).payload_ptr() as *const *mut Header;
            for i in 0..total {
                rc::retain(*slots.add(i));
            }
        }
        Ok(out)
    }
}

/// Create a zero-copy slice view over `[offset, offset+len)` of `parent`.
/// The view retains `parent`; releasing the slice releases `parent` once.
///
/// # Safety
/// `parent` must be a live vector and `[offset, offset+len)` must be in
/// bounds.
pub unsafe fn vec_slice(parent: *mut Header, offset: i64, len: i64) -> Result<*mut Header, Error> {
    unsafe {
        if offset < 0 || len < 0 || offset + len > (*parent).len() {
            return Err(Error::Range("slice range out of bounds"));
        }
        let view = heap::with_heap(|heap| heap.allocate(0))?;
        (*view).type_ = (*parent).type_;
        (*view).attrs = attrs::SLICE;
        (*view).set_len(len);
        (*view).set_slice(parent, offset);
        rc::retain(parent);
        Ok(view)
    }
}

/// Mark row `idx` of `v` as null, using the inline nullmap for vectors of
/// <= 128 rows and the external nullmap vector otherwise.
///
/// # Safety
/// `v` must be a live, non-slice vector; `idx` must be in bounds.
pub unsafe fn set_null(v: *mut Header, idx: i64) -> Result<(), Error> {
    unsafe {
        if idx < 0 || idx >= (*v).len() {
            return Err(Error::Range("null index out of bounds"));
        }
        (*v).attrs |= attrs::HAS_NULLS;
        if (*v).len() <= 128 {
            let byte = (idx / 8) as usize;
            let bit = (idx % 8) as u8;
            (*v).inline_nullmap_mut()[byte] |= 1 << bit;
            return Ok(());
        }
        if (*v).attrs & attrs::NULLMAP_EXT == 0 {
            let nbytes = ((*v).len() as usize).div_ceil(8);
            let bitmap = vec_new(kind::BOOL, nbytes * 8)?;
            (*v).attrs |= attrs::NULLMAP_EXT;
            (*v).set_ext_nullmap(bitmap);
        }
        let bitmap = (*v).ext_nullmap();
        let byte = (idx / 8) as usize;
        let bit = (idx % 8) as u8;
        (*(*bitmap).payload_mut_ptr().add(byte)) |= 1 << bit;
        Ok(())
    }
}

/// Whether row `idx` of `v` is null.
///
/// # Safety
/// `v` must be a live vector; `idx` must be in bounds.
pub unsafe fn is_null(v: *const Header, idx: i64) -> bool {
    unsafe {
        if (*v).attrs & attrs::HAS_NULLS == 0 {
            return false;
        }
        if (*v).len() <= 128 {
            let byte = (idx / 8) as usize;
            let bit = (idx % 8) as u8;
            return (*v).inline_nullmap()[byte] & (1 << bit) != 0;
        }
        let bitmap = (*v).ext_nullmap();
        let byte = (idx / 8) as usize;
        let bit = (idx % 8) as u8;
        (*(*bitmap).payload_ptr().add(byte)) & (1 << bit) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_vector_is_zeroed_with_right_length() {
        let v = vec_new(kind::I64, 4).unwrap();
        unsafe {
            assert_eq!((*v).len(), 4);
            assert_eq!(esz(v), 8);
            rc::release(v);
        }
    }

    #[test]
    fn append_grows_and_preserves_prefix() {
        let mut v = vec_new(kind::I32, 0).unwrap();
        unsafe {
            for i in 0..10i32 {
                v = vec_append(v, &i.to_le_bytes()).unwrap();
            }
            assert_eq!((*v).len(), 10);
            let data = (*v).payload_ptr() as *const i32;
            for i in 0..10 {
                assert_eq!(*data.add(i as usize), i);
            }
            rc::release(v);
        }
    }

    #[test]
    fn concat_joins_in_order() {
        let a = vec_new(kind::I64, 0).unwrap();
        let b = vec_new(kind::I64, 0).unwrap();
        unsafe {
            let a = vec_append(a, &1i64.to_le_bytes()).unwrap();
            let a = vec_append(a, &2i64.to_le_bytes()).unwrap();
            let b = vec_append(b, &3i64.to_le_bytes()).unwrap();
            let out = vec_concat(a, b).unwrap();
            assert_eq!((*out).len(), 3);
            let data = (*out).payload_ptr() as *const i64;
            assert_eq!([*data, *data.add(1), *data.add(2)], [1, 2, 3]);
            rc::release(a);
            rc::release(b);
            rc::release(out);
        }
    }

    #[test]
    fn slice_view_rejects_out_of_bounds() {
        let v = vec_new(kind::I64, 4).unwrap();
        unsafe {
            assert!(vec_slice(v, 2, 10).is_err());
            rc::release(v);
        }
    }

    #[test]
    fn null_bit_roundtrips_small_vector() {
        let v = vec_new(kind::I64, 4).unwrap();
        unsafe {
            assert!(!is_null(v, 1));
            set_null(v, 1).unwrap();
            assert!(is_null(v, 1));
            assert!(!is_null(v, 0));
            rc::release(v);
        }
    }
}
