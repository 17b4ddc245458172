//! Reference counting and copy-on-write.
//!
//! Typed child ownership is implemented once, as a visitor over "owned
//! child slots" parameterised by type tag, rather than a retain/release/
//! detach tree duplicated per container type.

use crate::block::{attrs, kind, Header};
use crate::heap;
use std::sync::atomic::Ordering;

/// Call `f` once for every owned child pointer slot in `h`'s payload. `f`
/// receives a pointer to the slot itself (not its value) so callers can
/// overwrite it (used by `detach`).
///
/// # Safety
/// `h` must be a live, fully-initialized header.
pub unsafe fn for_each_child_slot(h: *mut Header, mut f: impl FnMut(*mut *mut Header)) {
    unsafe {
        let t = (*h).type_;
        let a = (*h).attrs;

        if a & attrs::SLICE != 0 {
            f((*h).overlay[0..8].as_mut_ptr() as *mut *mut Header);
            return;
        }
        if a & attrs::NULLMAP_EXT != 0 {
            f((*h).overlay[0..8].as_mut_ptr() as *mut *mut Header);
        }

        if t == kind::atom_of(kind::STR) && a & attrs::HEAP_STR != 0 {
            f((*h).val.as_mut_ptr() as *mut *mut Header);
            return;
        }
        if t == kind::atom_of(kind::GUID) {
            f((*h).val.as_mut_ptr() as *mut *mut Header);
            return;
        }

        let n = (*h).len();
        if n <= 0 {
            return;
        }
        let n = n as usize;

        if t == kind::TABLE {
            // Payload is [schema_ptr, col_0, .. col_{n-1}] for n == ncols.
            let base = (*h).payload_mut_ptr() as *mut *mut Header;
            f(base);
            for i in 1..=n {
                f(base.add(i));
            }
            return;
        }
        if t == kind::LIST || t == kind::STR {
            let base = (*h).payload_mut_ptr() as *mut *mut Header;
            for i in 0..n {
                f(base.add(i));
            }
            return;
        }

        if kind::is_parted(t) {
            let base = (*h).payload_mut_ptr() as *mut *mut Header;
            for i in 0..n {
                f(base.add(i));
            }
            return;
        }

        if t == kind::MAPCOMMON {
            let base = (*h).payload_mut_ptr() as *mut *mut Header;
            f(base);
            f(base.add(1));
        }
    }
}

/// Atomically increment `h`'s reference count.
///
/// # Safety
/// `h` must be non-null and point to a live header.
pub unsafe fn retain(h: *mut Header) {
    if h.is_null() {
        return;
    }
    unsafe { (*h).rc.fetch_add(1, Ordering::Relaxed) };
}

pub(crate) fn retain_children(h: *mut Header) {
    unsafe {
        for_each_child_slot(h, |slot| {
            let child = *slot;
            retain(child);
        });
    }
}

fn release_children(h: *mut Header) {
    unsafe {
        for_each_child_slot(h, |slot| {
            let child = *slot;
            release(child);
        });
    }
}

/// Null out every owned child slot without releasing them — used right
/// before a block is discarded after its children have already been
/// transplanted elsewhere (e.g. `scratch_realloc`), to avoid a double
/// release when the discarded block itself is freed.
///
/// # Safety
/// Every child previously referenced from `h` must have already been
/// retained into its new home.
pub unsafe fn detach_children(h: *mut Header) {
    unsafe {
        for_each_child_slot(h, |slot| {
            *slot = std::ptr::null_mut();
        });
    }
}

/// Atomically decrement `h`'s reference count; on transition to zero,
/// release owned children and return the block to its heap.
///
/// # Safety
/// `h` must be non-null and point to a live header with `rc >= 1`.
pub unsafe fn release(h: *mut Header) {
    if h.is_null() {
        return;
    }
    let prev = unsafe { (*h).rc.fetch_sub(1, Ordering::AcqRel) };
    debug_assert!(prev >= 1, "rc underflow");
    if prev == 1 {
        release_children(h);
        heap::with_heap(|heap| unsafe { heap.free_block(h) });
    }
}

/// If `h` is uniquely owned, return it unchanged; otherwise allocate a
/// shallow copy, retain every owned child, release the original, and
/// return the copy.
///
/// # Safety
/// `h` must be non-null and point to a live header.
pub unsafe fn cow(h: *mut Header) -> *mut Header {
    unsafe {
        if (*h).rc.load(Ordering::Acquire) == 1 {
            return h;
        }
        let payload_len = (*h).payload_capacity();
        let copy = heap::with_heap(|heap| heap.allocate(payload_len)).expect("cow allocation failed");
        let src = h as *const u8;
        let dst = copy as *mut u8;
        std::ptr::copy_nonoverlapping(
            src.add(size_of::<Header>()),
            dst.add(size_of::<Header>()),
            payload_len,
        );
        (*copy).type_ = (*h).type_;
        (*copy).attrs = (*h).attrs;
        (*copy).mmod = (*h).mmod;
        (*copy).val = (*h).val;
        (*copy).overlay = (*h).overlay;
        retain_children(copy);
        release(h);
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::mmod;

    fn new_plain(kind: i8, len: i64) -> *mut Header {
        heap::with_heap(|heap| {
            let h = heap.allocate(32).unwrap();
            unsafe {
                (*h).type_ = kind;
                (*h).set_len(len);
                (*h).mmod = mmod::BUDDY;
            }
            h
        })
    }

    #[test]
    fn retain_release_matched_pair_returns_to_initial_rc() {
        let v = new_plain(kind::I64, 1);
        unsafe {
            assert_eq!((*v).rc.load(Ordering::Relaxed), 1);
            retain(v);
            assert_eq!((*v).rc.load(Ordering::Relaxed), 2);
            release(v);
            assert_eq!((*v).rc.load(Ordering::Relaxed), 1);
            release(v);
        }
    }

    #[test]
    fn cow_on_shared_value_copies() {
        let v = new_plain(kind::I64, 1);
        unsafe {
            retain(v);
            let c = cow(v);
            assert_ne!(c, v);
            assert_eq!((*v).rc.load(Ordering::Relaxed), 1);
            assert_eq!((*c).rc.load(Ordering::Relaxed), 1);
            release(v);
            release(c);
        }
    }

    #[test]
    fn cow_on_unique_value_is_noop() {
        let v = new_plain(kind::I64, 1);
        unsafe {
            let c = cow(v);
            assert_eq!(c, v);
            release(c);
        }
    }

    #[test]
    fn list_children_are_retained_and_released() {
        let child = new_plain(kind::I64, 1);
        let list = heap::with_heap(|heap| heap.allocate(16).unwrap());
        unsafe {
            (*list).type_ = kind::LIST;
            (*list).set_len(1);
            let base = (*list).payload_mut_ptr() as *mut *mut Header;
            base.write(child);
            retain(child); // list now owns a reference too
            assert_eq!((*child).rc.load(Ordering::Relaxed), 2);
            release(list); // drops the list's owned reference to `child`
            assert_eq!((*child).rc.load(Ordering::Relaxed), 1);
            release(child);
        }
    }
}
