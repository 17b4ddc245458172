//! Partitioned columns (`PARTED_*`): an ordered array of segment vectors
//! sharing one base type, and `MAPCOMMON`: a parallel pair of
//! (key, row_count) vectors describing how those segments map onto an
//! external partition key space (date/int/sym).

use crate::block::{kind, Header};
use crate::error::Error;
use crate::heap;
use crate::rc;
use crate::vector;

/// Build a `PARTED_<base>` column from `segments`, all of the same base
/// vector kind, retaining each into the new column.
///
/// # Safety
/// Every entry of `segments` must be a live vector header of the same
/// kind.
pub unsafe fn parted_new(segments: &[*mut Header]) -> Result<*mut Header, Error> {
    unsafe {
        let Some(&first) = segments.first() else {
            return Err(Error::Range("a partitioned column needs at least one segment"));
        };
        let base = (*first).type_;
        for seg in segments {
            if (**seg).type_ != base {
                return Err(Error::type_mismatch(kind::name(base), kind::name((**seg).type_)));
            }
        }
        let n = segments.len();
        let payload_bytes = n * size_of::<usize>();
        let h = heap::with_heap(|heap| heap.allocate(payload_bytes))?;
        (*h).type_ = kind::parted_of(base);
        (*h).set_len(n as i64);
        let slots = (*h).payload_mut_ptr() as *mut *mut Header;
        for (i, seg) in segments.iter().enumerate() {
            rc::retain(*seg);
            slots.add(i).write(*seg);
        }
        Ok(h)
    }
}

/// # Safety
/// `parted` must be a live `PARTED_*` header.
pub unsafe fn parted_base_type(parted: *const Header) -> i8 {
    unsafe { kind::parted_base_type((*parted).type_) }
}

/// # Safety
/// `parted` must be a live `PARTED_*` header; `idx` must be in bounds.
pub unsafe fn parted_segment(parted: *const Header, idx: usize) -> *mut Header {
    unsafe {
        let slots = (*parted).payload_ptr() as *const *mut Header;
        *slots.add(idx)
    }
}

/// `MAPCOMMON` key vector's inferred attrs, identifying which of the
/// partition key domains (date/int/sym) the caller is using, so callers
/// don't need to separately track it.
pub mod key_kind {
    pub const DATE: u8 = 0;
    pub const INT: u8 = 1;
    pub const SYM: u8 = 2;
}

/// Build a `MAPCOMMON` value pairing `keys` (a `DATE`, `I64`, or `SYM`
/// vector) with `row_counts` (an `I64` vector of equal length), retaining
/// both.
///
/// # Safety
/// `keys` and `row_counts` must be live vector headers of equal length.
pub unsafe fn mapcommon_new(keys: *mut Header, row_counts: *mut Header) -> Result<*mut Header, Error> {
    unsafe {
        if (*keys).len() != (*row_counts).len() {
            return Err(Error::Range("mapcommon keys and row_counts must have equal length"));
        }
        let key_t = (*keys).type_;
        if key_t != kind::DATE && key_t != kind::I64 && key_t != kind::SYM {
            return Err(Error::type_mismatch("date, i64, or sym key vector", kind::name(key_t)));
        }
        let h = heap::with_heap(|heap| heap.allocate(2 * size_of::<usize>()))?;
        (*h).type_ = kind::MAPCOMMON;
        (*h).set_len((*keys).len());
        (*h).attrs = match key_t {
            kind::DATE => key_kind::DATE,
            kind::SYM => key_kind::SYM,
            _ => key_kind::INT,
        };
        rc::retain(keys);
        rc::retain(row_counts);
        let slots = (*h).payload_mut_ptr() as *mut *mut Header;
        slots.write(keys);
        slots.add(1).write(row_counts);
        Ok(h)
    }
}

/// # Safety
/// `m` must be a live `MAPCOMMON` header.
pub unsafe fn mapcommon_keys(m: *const Header) -> *mut Header {
    unsafe { *((*m).payload_ptr() as *const *mut Header) }
}

/// # Safety
/// `m` must be a live `MAPCOMMON` header.
pub unsafe fn mapcommon_row_counts(m: *const Header) -> *mut Header {
    unsafe { *((*m).payload_ptr() as *const *mut Header).add(1) }
}

/// Total row count across every `(key, row_count)` pair.
///
/// # Safety
/// `m` must be a live `MAPCOMMON` header.
pub unsafe fn mapcommon_total_rows(m: *const Header) -> i64 {
    unsafe {
        let counts = mapcommon_row_counts(m);
        let data = (*counts).payload_ptr() as *const i64;
        let n = (*counts).len() as usize;
        (0..n).map(|i| *data.add(i)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i64_vec(values: &[i64]) -> *mut Header {
        let mut v = vector::vec_new(kind::I64, 0).unwrap();
        for x in values {
            v = unsafe { vector::vec_append(v, &x.to_le_bytes()).unwrap() };
        }
        v
    }

    #[test]
    fn parted_segments_roundtrip() {
        let a = i64_vec(&[1, 2]);
        let b = i64_vec(&[3]);
        unsafe {
            let p = parted_new(&[a, b]).unwrap();
            assert_eq!(parted_base_type(p), kind::I64);
            assert_eq!((*parted_segment(p, 1)).len(), 1);
            rc::release(a);
            rc::release(b);
            rc::release(p);
        }
    }

    #[test]
    fn parted_rejects_mixed_segment_kinds() {
        let a = i64_vec(&[1]);
        let b = vector::vec_new(kind::F64, 1).unwrap();
        unsafe {
            assert!(parted_new(&[a, b]).is_err());
            rc::release(a);
            rc::release(b);
        }
    }

    #[test]
    fn mapcommon_sums_row_counts() {
        let keys = i64_vec(&[20260101, 20260102]);
        let counts = i64_vec(&[5, 7]);
        unsafe {
            let m = mapcommon_new(keys, counts).unwrap();
            assert_eq!(mapcommon_total_rows(m), 12);
            rc::release(keys);
            rc::release(counts);
            rc::release(m);
        }
    }
}
