//! The 32-byte tagged value header and the type/attribute tag spaces it
//! carries. This is the one layout every other module in the crate builds
//! on: buddy free-list nodes, foreign-free queue nodes, and live values are
//! all the same 32 bytes, interpreted differently depending on `rc`.

use std::mem::offset_of;
use std::sync::atomic::AtomicU32;

/// Type tags. Vector/container kinds are non-negative; the atom variant of
/// a kind is its negation (so `-kind::I64` is an `I64` atom, not a vector).
/// `PARTED_BASE + k` is a partitioned column whose segments are vectors of
/// kind `k`.
pub mod kind {
    pub const LIST: i8 = 0;
    pub const BOOL: i8 = 1;
    pub const I8: i8 = 2;
    pub const I16: i8 = 3;
    pub const I32: i8 = 4;
    pub const I64: i8 = 5;
    pub const F64: i8 = 6;
    pub const DATE: i8 = 7;
    pub const TIME: i8 = 8;
    pub const TIMESTAMP: i8 = 9;
    pub const GUID: i8 = 10;
    pub const SYM: i8 = 11;
    pub const CHAR: i8 = 12;
    pub const ENUM: i8 = 13;
    pub const STR: i8 = 14;
    pub const TABLE: i8 = 15;
    pub const MAPCOMMON: i8 = 16;
    pub const SEL: i8 = 17;
    pub const TYPE_COUNT: i8 = 18;
    pub const PARTED_BASE: i8 = 32;

    /// Scalar vector kinds a column file may hold.
    pub const FILE_ALLOWLIST: &[i8] = &[
        BOOL, I8, CHAR, I16, I32, I64, F64, DATE, TIME, TIMESTAMP, GUID, SYM,
    ];

    #[inline]
    pub fn is_parted(t: i8) -> bool {
        t >= PARTED_BASE && t < PARTED_BASE + TYPE_COUNT
    }

    #[inline]
    pub fn parted_base_type(t: i8) -> i8 {
        t - PARTED_BASE
    }

    #[inline]
    pub fn parted_of(base: i8) -> i8 {
        PARTED_BASE + base
    }

    #[inline]
    pub fn is_atom(t: i8) -> bool {
        t < 0
    }

    /// The atom tag for vector kind `t` (e.g. `atom_of(kind::I64) == -5`).
    #[inline]
    pub fn atom_of(t: i8) -> i8 {
        debug_assert!(t >= 0);
        -t
    }

    /// The vector kind underlying atom tag `t` (e.g. `vector_of(-5) == 5`).
    #[inline]
    pub fn vector_of(t: i8) -> i8 {
        debug_assert!(t < 0);
        -t
    }

    #[inline]
    pub fn name(t: i8) -> &'static str {
        if is_parted(t) {
            return "parted";
        }
        let v = if is_atom(t) { vector_of(t) } else { t };
        match v {
            LIST => "list",
            BOOL => "bool",
            I8 => "i8",
            I16 => "i16",
            I32 => "i32",
            I64 => "i64",
            F64 => "f64",
            DATE => "date",
            TIME => "time",
            TIMESTAMP => "timestamp",
            GUID => "guid",
            SYM => "sym",
            CHAR => "char",
            ENUM => "enum",
            STR => "str",
            TABLE => "table",
            MAPCOMMON => "mapcommon",
            SEL => "sel",
            _ => "unknown",
        }
    }

    /// Fixed element size in bytes for primitive vector kind `t`, or `None`
    /// for variable-width / pointer-array kinds.
    #[inline]
    pub fn fixed_esz(t: i8) -> Option<usize> {
        match t {
            BOOL | I8 | CHAR => Some(1),
            I16 => Some(2),
            I32 | DATE | TIME => Some(4),
            I64 | F64 | TIMESTAMP => Some(8),
            GUID => Some(16),
            ENUM => Some(4),
            _ => None,
        }
    }
}

/// `attrs` byte bit flags, plus the `SYM` width sub-encoding in its low 2
/// bits.
pub mod attrs {
    pub const SYM_W_MASK: u8 = 0x03;
    pub const SYM_W8: u8 = 0x00;
    pub const SYM_W16: u8 = 0x01;
    pub const SYM_W32: u8 = 0x02;
    pub const SYM_W64: u8 = 0x03;

    pub const SLICE: u8 = 0x10;
    pub const NULLMAP_EXT: u8 = 0x20;
    pub const HAS_NULLS: u8 = 0x40;
    /// Private to `ATOM_STR`: set when the string is too long for inline
    /// SSO storage and `val` holds a child pointer instead of inline bytes.
    pub const HEAP_STR: u8 = 0x80;

    #[inline]
    pub fn sym_width_bytes(a: u8) -> usize {
        match a & SYM_W_MASK {
            SYM_W8 => 1,
            SYM_W16 => 2,
            SYM_W32 => 4,
            _ => 8,
        }
    }
}

/// Memory origin of a block's payload.
pub mod mmod {
    pub const BUDDY: u8 = 0;
    pub const FILE_MAPPED: u8 = 1;
    pub const DIRECT_MAPPED: u8 = 2;
}

/// The 32-byte value header. Bytes 0..16 are reinterpreted depending on
/// context (live nullmap vs. slice descriptor vs. freelist/foreign-queue
/// overlay) via the raw accessor methods below rather than a Rust `union`,
/// since the active interpretation is tracked externally by `rc`/`attrs`,
/// not by the type system.
#[repr(C)]
pub struct Header {
    pub overlay: [u8; 16],
    pub type_: i8,
    pub order: u8,
    pub mmod: u8,
    pub attrs: u8,
    pub rc: AtomicU32,
    pub val: [u8; 8],
}

const _: () = assert!(size_of::<Header>() == 32);
const _: () = assert!(offset_of!(Header, overlay) == 0);
const _: () = assert!(offset_of!(Header, type_) == 16);
const _: () = assert!(offset_of!(Header, order) == 17);
const _: () = assert!(offset_of!(Header, mmod) == 18);
const _: () = assert!(offset_of!(Header, attrs) == 19);
const _: () = assert!(offset_of!(Header, rc) == 20);
const _: () = assert!(offset_of!(Header, val) == 24);

impl Header {
    #[inline]
    pub fn payload_ptr(&self) -> *const u8 {
        (self as *const Header as *const u8).wrapping_add(size_of::<Header>())
    }

    #[inline]
    pub fn payload_mut_ptr(&mut self) -> *mut u8 {
        (self as *mut Header as *mut u8).wrapping_add(size_of::<Header>())
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        1usize << self.order
    }

    #[inline]
    pub fn payload_capacity(&self) -> usize {
        self.block_size() - size_of::<Header>()
    }

    /// Signed element/column count, stored in `val` as a little-endian i64.
    #[inline]
    pub fn len(&self) -> i64 {
        i64::from_le_bytes(self.val)
    }

    #[inline]
    pub fn set_len(&mut self, len: i64) {
        self.val = len.to_le_bytes();
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.rc.load(std::sync::atomic::Ordering::Relaxed) == 0
    }

    /// Read the `{parent, offset}` slice descriptor overlaid on `overlay`.
    /// Only meaningful when `attrs & SLICE != 0`.
    #[inline]
    pub fn slice_parent(&self) -> *mut Header {
        usize::from_le_bytes(self.overlay[0..8].try_into().unwrap()) as *mut Header
    }

    #[inline]
    pub fn slice_offset(&self) -> i64 {
        i64::from_le_bytes(self.overlay[8..16].try_into().unwrap())
    }

    #[inline]
    pub fn set_slice(&mut self, parent: *mut Header, offset: i64) {
        self.overlay[0..8].copy_from_slice(&(parent as usize).to_le_bytes());
        self.overlay[8..16].copy_from_slice(&offset.to_le_bytes());
    }

    /// Read the external-nullmap-vector pointer overlaid on `overlay[0..8]`.
    /// Only meaningful when `attrs & NULLMAP_EXT != 0`.
    #[inline]
    pub fn ext_nullmap(&self) -> *mut Header {
        usize::from_le_bytes(self.overlay[0..8].try_into().unwrap()) as *mut Header
    }

    #[inline]
    pub fn set_ext_nullmap(&mut self, nullmap: *mut Header) {
        self.overlay[0..8].copy_from_slice(&(nullmap as usize).to_le_bytes());
    }

    /// Inline nullmap bits for vectors with <= 128 rows and no external
    /// bitmap. Bit `i` set means row `i` is null.
    #[inline]
    pub fn inline_nullmap(&self) -> &[u8; 16] {
        &self.overlay
    }

    #[inline]
    pub fn inline_nullmap_mut(&mut self) -> &mut [u8; 16] {
        &mut self.overlay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_32_bytes() {
        assert_eq!(size_of::<Header>(), 32);
    }

    #[test]
    fn atom_vector_tag_roundtrip() {
        assert_eq!(kind::atom_of(kind::I64), -kind::I64);
        assert_eq!(kind::vector_of(-kind::I64), kind::I64);
        assert!(kind::is_atom(-kind::I64));
        assert!(!kind::is_atom(kind::I64));
    }

    #[test]
    fn parted_tag_roundtrip() {
        let p = kind::parted_of(kind::I64);
        assert!(kind::is_parted(p));
        assert_eq!(kind::parted_base_type(p), kind::I64);
        assert!(!kind::is_parted(kind::I64));
    }

    #[test]
    fn fixed_esz_table() {
        assert_eq!(kind::fixed_esz(kind::BOOL), Some(1));
        assert_eq!(kind::fixed_esz(kind::I64), Some(8));
        assert_eq!(kind::fixed_esz(kind::GUID), Some(16));
        assert_eq!(kind::fixed_esz(kind::LIST), None);
        assert_eq!(kind::fixed_esz(kind::STR), None);
    }

    #[test]
    fn sym_width_decoding() {
        assert_eq!(attrs::sym_width_bytes(attrs::SYM_W8), 1);
        assert_eq!(attrs::sym_width_bytes(attrs::SYM_W16), 2);
        assert_eq!(attrs::sym_width_bytes(attrs::SYM_W32), 4);
        assert_eq!(attrs::sym_width_bytes(attrs::SYM_W64), 8);
    }
}
