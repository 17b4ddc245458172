//! Selection masks: a morsel-segmented bitmap recording which rows of a
//! table pass a predicate, with a per-segment flag (`NONE`/`MIX`/`ALL`)
//! and popcount cached so downstream operators can skip fully-excluded
//! or fully-included segments without scanning their bits.

use crate::block::{kind, Header};
use crate::config::MORSEL;
use crate::error::Error;
use crate::heap;

pub mod seg_flag {
    pub const NONE: u8 = 0;
    pub const MIX: u8 = 1;
    pub const ALL: u8 = 2;
}

fn n_segments(nrows: i64) -> usize {
    (nrows as usize).div_ceil(MORSEL)
}

/// Layout: payload holds `[Meta][seg_flags: u8; nsegs][seg_popcnt: u32; nsegs][bits: u64; words]`
/// where `Meta` is `{nrows: i64, nsegs: i64, total_pass: i64}`.
#[repr(C)]
struct Meta {
    nrows: i64,
    nsegs: i64,
    /// Sum of every segment's popcount, kept current by `sel_recompute`.
    /// Cached here rather than summed on demand since callers (join/filter
    /// operators sizing an output) query it once per mask, not once per row.
    total_pass: i64,
}

unsafe fn meta(h: *const Header) -> *const Meta {
    unsafe { (*h).payload_ptr() as *const Meta }
}

fn popcnt_offset(nsegs: usize) -> usize {
    (size_of::<Meta>() + nsegs).div_ceil(4) * 4
}

fn bits_offset(nsegs: usize) -> usize {
    (popcnt_offset(nsegs) + nsegs * size_of::<u32>()).div_ceil(8) * 8
}

unsafe fn seg_flags(h: *const Header) -> *mut u8 {
    unsafe { ((*h).payload_ptr() as *mut u8).add(size_of::<Meta>()) }
}

unsafe fn seg_popcnt(h: *const Header, nsegs: usize) -> *mut u32 {
    unsafe { ((*h).payload_ptr() as *mut u8).add(popcnt_offset(nsegs)) as *mut u32 }
}

unsafe fn bits(h: *const Header, nsegs: usize) -> *mut u64 {
    unsafe { ((*h).payload_ptr() as *mut u8).add(bits_offset(nsegs)) as *mut u64 }
}

fn payload_len(nrows: i64) -> usize {
    let nsegs = n_segments(nrows);
    let nwords = (nrows as usize).div_ceil(64);
    bits_offset(nsegs) + nwords * size_of::<u64>()
}

/// Allocate a new, all-clear selection mask over `nrows` rows.
pub fn sel_new(nrows: i64) -> Result<*mut Header, Error> {
    if nrows < 0 {
        return Err(Error::Range("selection mask row count must be non-negative"));
    }
    let bytes = payload_len(nrows);
    let h = heap::with_heap(|heap| heap.allocate(bytes))?;
    unsafe {
        (*h).type_ = kind::SEL;
        (*h).set_len(nrows);
        std::ptr::write_bytes((*h).payload_mut_ptr(), 0, bytes);
        let nsegs = n_segments(nrows);
        let m = (*h).payload_mut_ptr() as *mut Meta;
        (*m).nrows = nrows;
        (*m).nsegs = nsegs as i64;
        (*m).total_pass = 0;
        std::ptr::write_bytes(seg_flags(h), seg_flag::NONE, nsegs);
    }
    Ok(h)
}

/// Build a selection mask by evaluating `pred(row_index)` over every row.
pub fn sel_from_pred(nrows: i64, mut pred: impl FnMut(i64) -> bool) -> Result<*mut Header, Error> {
    let h = sel_new(nrows)?;
    unsafe {
        for row in 0..nrows {
            if pred(row) {
                set_bit(h, row);
            }
        }
        sel_recompute(h);
    }
    Ok(h)
}

/// Set bit `row` (caller must call `sel_recompute` once done setting
/// bits in bulk; this function does not update segment flags itself).
///
/// # Safety
/// `h` must be a live selection mask; `row` must be in bounds.
pub unsafe fn set_bit(h: *mut Header, row: i64) {
    unsafe {
        let nsegs = (*meta(h)).nsegs as usize;
        let words = bits(h, nsegs);
        let word = (row / 64) as usize;
        let bit = (row % 64) as u32;
        *words.add(word) |= 1u64 << bit;
    }
}

/// Whether bit `row` is set.
///
/// # Safety
/// `h` must be a live selection mask; `row` must be in bounds.
pub unsafe fn test_bit(h: *const Header, row: i64) -> bool {
    unsafe {
        let nsegs = (*meta(h)).nsegs as usize;
        let words = bits(h, nsegs);
        let word = (row / 64) as usize;
        let bit = (row % 64) as u32;
        (*words.add(word)) & (1u64 << bit) != 0
    }
}

/// Recompute every segment's flag and popcount from its raw bits. Called
/// once after bulk bit mutation (`sel_from_pred`, `sel_and`) rather than
/// incrementally, since a single pass over the bitmap is cheap relative
/// to morsel-granularity bookkeeping on every `set_bit`.
///
/// # Safety
/// `h` must be a live selection mask.
pub unsafe fn sel_recompute(h: *mut Header) {
    unsafe {
        let nrows = (*meta(h)).nrows;
        let nsegs = (*meta(h)).nsegs as usize;
        let flags = seg_flags(h);
        let counts = seg_popcnt(h, nsegs);
        let words = bits(h, nsegs);
        let mut total = 0i64;
        for seg in 0..nsegs {
            let seg_start = seg * MORSEL;
            let seg_end = ((seg + 1) * MORSEL).min(nrows as usize);
            let seg_len = seg_end - seg_start;
            let mut set = 0u32;
            for row in seg_start..seg_end {
                let word = row / 64;
                let bit = row % 64;
                if (*words.add(word)) & (1u64 << bit) != 0 {
                    set += 1;
                }
            }
            *counts.add(seg) = set;
            total += set as i64;
            *flags.add(seg) = if set == 0 {
                seg_flag::NONE
            } else if set as usize == seg_len {
                seg_flag::ALL
            } else {
                seg_flag::MIX
            };
        }
        (*((*h).payload_mut_ptr() as *mut Meta)).total_pass = total;
    }
}

/// Total number of set bits across the whole mask, as of the last
/// `sel_recompute`.
///
/// # Safety
/// `h` must be a live selection mask.
pub unsafe fn total_pass(h: *const Header) -> i64 {
    unsafe { (*meta(h)).total_pass }
}

/// AND two masks of equal row count into a freshly allocated mask.
///
/// # Safety
/// `a` and `b` must be live selection masks with equal `nrows`.
pub unsafe fn sel_and(a: *const Header, b: *const Header) -> Result<*mut Header, Error> {
    unsafe {
        let nrows = (*meta(a)).nrows;
        if nrows != (*meta(b)).nrows {
            return Err(Error::Range("selection masks must cover the same row count"));
        }
        let out = sel_new(nrows)?;
        let nsegs = (*meta(a)).nsegs as usize;
        let nwords = (nrows as usize).div_ceil(64);
        let aw = bits(a, nsegs);
        let bw = bits(b, nsegs);
        let ow = bits(out, nsegs);
        for i in 0..nwords {
            *ow.add(i) = (*aw.add(i)) & (*bw.add(i));
        }
        sel_recompute(out);
        Ok(out)
    }
}

/// Segment flag for segment `seg`.
///
/// # Safety
/// `h` must be a live selection mask; `seg` must be in bounds.
pub unsafe fn segment_flag(h: *const Header, seg: usize) -> u8 {
    unsafe {
        let nsegs = (*meta(h)).nsegs as usize;
        *seg_flags(h).add(seg.min(nsegs.saturating_sub(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rc;

    #[test]
    fn empty_mask_segments_are_none() {
        let h = sel_new(10).unwrap();
        unsafe {
            assert_eq!(segment_flag(h, 0), seg_flag::NONE);
            rc::release(h);
        }
    }

    #[test]
    fn full_mask_segment_is_all() {
        let h = sel_from_pred(10, |_| true).unwrap();
        unsafe {
            assert_eq!(segment_flag(h, 0), seg_flag::ALL);
            rc::release(h);
        }
    }

    #[test]
    fn mixed_predicate_segment_is_mix() {
        let h = sel_from_pred(10, |r| r % 2 == 0).unwrap();
        unsafe {
            assert_eq!(segment_flag(h, 0), seg_flag::MIX);
            assert!(test_bit(h, 0));
            assert!(!test_bit(h, 1));
            rc::release(h);
        }
    }

    #[test]
    fn boundary_straddling_morsel_recomputes_each_segment_independently() {
        let morsel = MORSEL as i64;
        let nrows = morsel + 5;
        let h = sel_from_pred(nrows, |r| r >= morsel).unwrap();
        unsafe {
            assert_eq!(segment_flag(h, 0), seg_flag::NONE);
            assert_eq!(segment_flag(h, 1), seg_flag::ALL);
            rc::release(h);
        }
    }

    #[test]
    fn single_bit_past_the_morsel_boundary_recomputes_to_all() {
        let nrows = MORSEL as i64 + 1;
        let h = sel_new(nrows).unwrap();
        unsafe {
            set_bit(h, MORSEL as i64);
            sel_recompute(h);
            assert_eq!(segment_flag(h, 0), seg_flag::NONE);
            // Segment 1 holds exactly one row (row `MORSEL`), and that row's
            // bit is set, so popcnt == segment length and the flag is ALL.
            assert_eq!(segment_flag(h, 1), seg_flag::ALL);
            rc::release(h);
        }
    }

    #[test]
    fn total_pass_sums_across_segments() {
        let morsel = MORSEL as i64;
        let nrows = morsel + 5;
        let h = sel_from_pred(nrows, |r| r >= morsel - 2).unwrap();
        unsafe {
            assert_eq!(total_pass(h), 7);
            rc::release(h);
        }
    }

    #[test]
    fn and_combines_bitwise() {
        let a = sel_from_pred(8, |r| r < 5).unwrap();
        let b = sel_from_pred(8, |r| r >= 2).unwrap();
        unsafe {
            let c = sel_and(a, b).unwrap();
            for r in 0..8 {
                assert_eq!(test_bit(c, r), (2..5).contains(&r));
            }
            rc::release(a);
            rc::release(b);
            rc::release(c);
        }
    }
}
