//! The public, safe owning handle over a `Header`. Every constructor
//! returns a `Value`; its `Drop` releases exactly the reference it
//! created, so callers never call `rc::release` themselves.

use crate::block::{attrs, kind, Header};
use crate::error::Error;
use crate::heap;
use crate::rc;
use std::fmt;

pub struct Value {
    raw: *mut Header,
}

// A `Value` only ever touches memory reached through its own `raw`
// pointer and the heap/registry machinery beneath it, both of which are
// safe to hand between threads.
unsafe impl Send for Value {}
unsafe impl Sync for Value {}

impl Value {
    /// Take ownership of an already-retained header (the caller's
    /// reference transfers to the returned `Value`).
    ///
    /// # Safety
    /// `raw` must be non-null and point to a live header whose reference
    /// count already accounts for this `Value`.
    pub unsafe fn from_raw(raw: *mut Header) -> Self {
        Value { raw }
    }

    pub fn as_raw(&self) -> *const Header {
        self.raw
    }

    pub fn as_raw_mut(&mut self) -> *mut Header {
        self.raw
    }

    /// Consume this `Value`, handing the caller its reference without
    /// releasing it.
    pub fn into_raw(self) -> *mut Header {
        let raw = self.raw;
        std::mem::forget(self);
        raw
    }

    pub fn type_tag(&self) -> i8 {
        unsafe { (*self.raw).type_ }
    }

    pub fn type_name(&self) -> &'static str {
        kind::name(self.type_tag())
    }

    pub fn len(&self) -> i64 {
        unsafe { (*self.raw).len() }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A fixed-seed content hash, normalizing `-0.0` to `+0.0` for `F64`
    /// atoms and vectors so two values that compare equal also hash
    /// equal. Containers (tables, partitioned columns, selection masks)
    /// hash by type and length only; hashing their full contents means
    /// walking child values recursively, which callers needing that can
    /// do themselves via the `vector`/`table` accessors.
    pub fn content_hash(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut state = std::collections::hash_map::DefaultHasher::new();
        let t = self.type_tag();
        t.hash(&mut state);
        unsafe {
            if kind::is_atom(t) {
                let base = kind::vector_of(t);
                if base == kind::F64 {
                    hash_f64_bits(f64::from_le_bytes((*self.raw).val), &mut state);
                } else {
                    (*self.raw).val.hash(&mut state);
                }
                return state.finish();
            }
            self.len().hash(&mut state);
            if let Some(esz) = kind::fixed_esz(t) {
                let n = self.len().max(0) as usize;
                let base = (*self.raw).payload_ptr();
                if t == kind::F64 {
                    for i in 0..n {
                        let bits = *(base.add(i * esz) as *const f64);
                        hash_f64_bits(bits, &mut state);
                    }
                } else {
                    let bytes = std::slice::from_raw_parts(base, n * esz);
                    bytes.hash(&mut state);
                }
            }
        }
        state.finish()
    }
}

fn hash_f64_bits(v: f64, state: &mut impl std::hash::Hasher) {
    use std::hash::Hash;
    let normalized = if v == 0.0 { 0.0f64 } else { v };
    normalized.to_bits().hash(state);
}

impl Clone for Value {
    fn clone(&self) -> Self {
        unsafe {
            rc::retain(self.raw);
            Value { raw: self.raw }
        }
    }
}

impl Drop for Value {
    fn drop(&mut self) {
        unsafe { rc::release(self.raw) };
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value")
            .field("type", &self.type_name())
            .field("len", &self.len())
            .finish()
    }
}

fn atom(kind_tag: i8, write: impl FnOnce(&mut Header)) -> Result<Value, Error> {
    let h = heap::with_heap(|heap| heap.allocate(0))?;
    unsafe {
        (*h).type_ = kind::atom_of(kind_tag);
        write(&mut *h);
        Ok(Value::from_raw(h))
    }
}

pub fn bool_atom(v: bool) -> Result<Value, Error> {
    atom(kind::BOOL, |h| h.val[0] = v as u8)
}

pub fn i8_atom(v: i8) -> Result<Value, Error> {
    atom(kind::I8, |h| h.val[0] = v as u8)
}

pub fn i16_atom(v: i16) -> Result<Value, Error> {
    atom(kind::I16, |h| h.val[0..2].copy_from_slice(&v.to_le_bytes()))
}

pub fn i32_atom(v: i32) -> Result<Value, Error> {
    atom(kind::I32, |h| h.val[0..4].copy_from_slice(&v.to_le_bytes()))
}

pub fn i64_atom(v: i64) -> Result<Value, Error> {
    atom(kind::I64, |h| h.val = v.to_le_bytes())
}

pub fn f64_atom(v: f64) -> Result<Value, Error> {
    atom(kind::F64, |h| h.val = v.to_le_bytes())
}

pub fn char_atom(v: u8) -> Result<Value, Error> {
    atom(kind::CHAR, |h| h.val[0] = v)
}

pub fn date_atom(days_since_epoch: i32) -> Result<Value, Error> {
    atom(kind::DATE, |h| h.val[0..4].copy_from_slice(&days_since_epoch.to_le_bytes()))
}

pub fn time_atom(millis_since_midnight: i32) -> Result<Value, Error> {
    atom(kind::TIME, |h| h.val[0..4].copy_from_slice(&millis_since_midnight.to_le_bytes()))
}

pub fn timestamp_atom(nanos_since_epoch: i64) -> Result<Value, Error> {
    atom(kind::TIMESTAMP, |h| h.val = nanos_since_epoch.to_le_bytes())
}

/// A 16-byte GUID atom. GUIDs don't fit in `val`'s 8 bytes, so they are
/// always stored as a heap-allocated 16-byte child, the same path
/// `for_each_child_slot` already knows to retain/release.
pub fn guid_atom(bytes: [u8; 16]) -> Result<Value, Error> {
    let child = heap::with_heap(|heap| heap.allocate(16))?;
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), (*child).payload_mut_ptr(), 16);
    }
    atom(kind::GUID, move |h| {
        h.val[0..8].copy_from_slice(&(child as usize).to_le_bytes());
    })
}

const SSO_CAP: usize = 8;

/// A string atom: inline small-string-optimized storage for strings of
/// <= 8 bytes, a heap-allocated `STR`-kind child otherwise.
pub fn str_atom(s: &str) -> Result<Value, Error> {
    let bytes = s.as_bytes();
    if bytes.len() <= SSO_CAP {
        return atom(kind::STR, |h| {
            h.val[..bytes.len()].copy_from_slice(bytes);
            h.set_len(bytes.len() as i64);
        });
    }
    let child = heap::with_heap(|heap| heap.allocate(bytes.len()))?;
    unsafe {
        (*child).type_ = kind::CHAR;
        (*child).set_len(bytes.len() as i64);
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), (*child).payload_mut_ptr(), bytes.len());
    }
    atom(kind::STR, move |h| {
        h.attrs |= attrs::HEAP_STR;
        h.set_len(bytes.len() as i64);
        h.val[0..8].copy_from_slice(&(child as usize).to_le_bytes());
    })
}

/// Read a string atom's contents back out as an owned `String`.
pub fn str_atom_get(v: &Value) -> Result<String, Error> {
    unsafe {
        let h = v.raw;
        if (*h).type_ != kind::atom_of(kind::STR) {
            return Err(Error::type_mismatch("str atom", kind::name((*h).type_)));
        }
        let len = (*h).len() as usize;
        if (*h).attrs & attrs::HEAP_STR == 0 {
            let bytes = &(*h).val[..len];
            return Ok(String::from_utf8_lossy(bytes).into_owned());
        }
        let child_ptr = usize::from_le_bytes((*h).val[0..8].try_into().unwrap()) as *const Header;
        let bytes = std::slice::from_raw_parts((*child_ptr).payload_ptr(), len);
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Wrap an already-built vector/table/parted/mapcommon/sel header
/// (produced by `vector`, `table`, `parted`, or `sel`) as a `Value`.
///
/// # Safety
/// `raw` must be a live header whose single owning reference transfers
/// to the returned `Value`.
pub unsafe fn from_container(raw: *mut Header) -> Value {
    unsafe { Value::from_raw(raw) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i64_atom_roundtrip() {
        let v = i64_atom(-42).unwrap();
        assert_eq!(v.type_tag(), kind::atom_of(kind::I64));
        unsafe {
            assert_eq!(i64::from_le_bytes((*v.as_raw()).val), -42);
        }
    }

    #[test]
    fn short_string_is_inline() {
        let v = str_atom("hi").unwrap();
        unsafe {
            assert_eq!((*v.as_raw()).attrs & attrs::HEAP_STR, 0);
        }
        assert_eq!(str_atom_get(&v).unwrap(), "hi");
    }

    #[test]
    fn long_string_spills_to_heap_child() {
        let v = str_atom("a string well over eight bytes long").unwrap();
        unsafe {
            assert_ne!((*v.as_raw()).attrs & attrs::HEAP_STR, 0);
        }
        assert_eq!(str_atom_get(&v).unwrap(), "a string well over eight bytes long");
    }

    #[test]
    fn clone_shares_until_dropped() {
        let v = i64_atom(7).unwrap();
        let raw = v.as_raw();
        let v2 = v.clone();
        unsafe {
            assert_eq!((*raw).rc.load(std::sync::atomic::Ordering::Relaxed), 2);
        }
        drop(v2);
        unsafe {
            assert_eq!((*raw).rc.load(std::sync::atomic::Ordering::Relaxed), 1);
        }
        drop(v);
    }

    #[test]
    fn guid_roundtrips_through_heap_child() {
        let bytes = [7u8; 16];
        let v = guid_atom(bytes).unwrap();
        unsafe {
            let child_ptr = usize::from_le_bytes((*v.as_raw()).val[0..8].try_into().unwrap()) as *const Header;
            let got = std::slice::from_raw_parts((*child_ptr).payload_ptr(), 16);
            assert_eq!(got, &bytes);
        }
    }

    #[test]
    fn content_hash_is_deterministic_for_identical_bytes() {
        let a = i64_atom(42).unwrap();
        let b = i64_atom(42).unwrap();
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn content_hash_treats_negative_and_positive_zero_as_equal() {
        let neg = f64_atom(-0.0).unwrap();
        let pos = f64_atom(0.0).unwrap();
        assert_eq!(neg.content_hash(), pos.content_hash());
    }
}
