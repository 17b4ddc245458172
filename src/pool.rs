//! Self-aligned buddy pools.
//!
//! A pool is a `vm_alloc`-backed region whose size is a power of two and
//! whose address is aligned to that size, so `addr & ~(pool_size - 1)`
//! recovers the pool's base for any address inside it — *except* for
//! oversized pools (allocated for a single request larger than the
//! standard pool size), where the natural alignment is coarser than
//! `POOL_SIZE` and a bounded downward stride walk is needed instead (see
//! `pool_of`).
//!
//! The pool's first minimum-order block is never handed out: it holds a
//! `PoolHeader` describing the pool, with `rc = 1` so ordinary freelist
//! scans and coalescing never touch it.

use crate::block::Header;
use crate::config::{MIN_ORDER, POOL_ORDER, POOL_SIZE};
use crate::error::Error;
use crate::platform;
use std::sync::atomic::{AtomicU32, Ordering};

#[repr(C)]
pub struct PoolHeader {
    pub heap_id: u64,
    pub pool_order: u8,
    pub vm_base: usize,
    /// Number of blocks currently allocated out of this pool. Used by the
    /// oversized-pool reclaim pass in `gc.rs`: a pool with `pool_order >
    /// POOL_ORDER` and `live_count == 0` is unmapped outright rather than
    /// having its pages merely advised away.
    pub live_count: AtomicU32,
}

/// Maximum number of `POOL_SIZE` strides to walk back while searching for
/// an oversized pool's true base. Bounded by how much larger than
/// `POOL_SIZE` an oversized pool can possibly be.
const MAX_STRIDE_WALK: usize = 1 << 16;

/// Reserve and commit a fresh pool of size `2^pool_order` for `heap_id`.
/// Returns the pool's base `Header`, pre-marked as a single free block of
/// order `pool_order` (the caller — `heap.rs` — cascades this down to
/// `MIN_ORDER`, installing the pool header in the leftmost resulting
/// block).
pub fn create_pool(heap_id: u64, pool_order: u8) -> Result<*mut Header, Error> {
    let size = 1usize << pool_order;
    let base = unsafe { platform::vm_alloc_aligned(size, size) };
    if base.is_null() {
        return Err(Error::Oom("vm_alloc failed while growing a pool"));
    }
    debug_assert_eq!(base as usize & (size - 1), 0, "pool base must be self-aligned");

    let header = base as *mut Header;
    unsafe {
        (*header).overlay = [0; 16];
        (*header).type_ = 0;
        (*header).order = pool_order;
        (*header).mmod = 0;
        (*header).attrs = 0;
        (*header).rc = AtomicU32::new(0);
        (*header).val = [0; 8];
    }

    // Stash the soon-to-be pool header metadata in the whole-pool block's
    // payload for now; `install_pool_header` overwrites this once the
    // cascading split has carved out the real leftmost min-block.
    let _ = heap_id;
    Ok(header)
}

/// Install the `PoolHeader` into the leftmost min-order block produced by
/// cascading `create_pool`'s block down to `MIN_ORDER`.
///
/// # Safety
/// `min_block` must be the leftmost `MIN_ORDER` block of a pool created by
/// `create_pool`, not yet exposed to any freelist.
pub unsafe fn install_pool_header(min_block: *mut Header, heap_id: u64, pool_order: u8, vm_base: usize) {
    unsafe {
        (*min_block).type_ = 0;
        (*min_block).order = MIN_ORDER;
        (*min_block).mmod = 0;
        (*min_block).attrs = 0;
        (*min_block).rc.store(1, Ordering::Relaxed);
        let payload = (*min_block).payload_mut_ptr() as *mut PoolHeader;
        payload.write(PoolHeader {
            heap_id,
            pool_order,
            vm_base,
            live_count: AtomicU32::new(0),
        });
    }
}

#[inline]
fn pool_header_at(candidate: usize) -> Option<&'static PoolHeader> {
    if candidate == 0 {
        return None;
    }
    let header = candidate as *const Header;
    unsafe {
        let ph = (*header).payload_ptr() as *const PoolHeader;
        Some(&*ph)
    }
}

/// Find the pool header covering `addr`, trying the direct `POOL_SIZE`
/// mask first (the common case: a standard-size pool) and falling back to
/// a bounded downward stride walk for oversized pools.
///
/// # Safety
/// `addr` must lie within some pool created by `create_pool`.
pub unsafe fn pool_of(addr: usize) -> *const PoolHeader {
    let mut candidate = addr & !(POOL_SIZE - 1);
    for _ in 0..MAX_STRIDE_WALK {
        if let Some(ph) = pool_header_at(candidate) {
            if ph.vm_base == candidate {
                let span = 1usize << ph.pool_order;
                if addr >= ph.vm_base && addr < ph.vm_base + span {
                    return ph as *const PoolHeader;
                }
            }
        }
        match candidate.checked_sub(POOL_SIZE) {
            Some(next) => candidate = next,
            None => break,
        }
    }
    std::ptr::null()
}

/// Release a pool back to the OS. Only valid once every block inside it is
/// confirmed free (checked by the caller in `gc.rs`).
///
/// # Safety
/// No live references into `[vm_base, vm_base + 2^pool_order)` may exist.
pub unsafe fn destroy_pool(vm_base: usize, pool_order: u8) {
    unsafe { platform::vm_release(vm_base as *mut u8, 1usize << pool_order) };
}

/// Default order for a standard pool grown on demand.
pub const STANDARD_POOL_ORDER: u8 = POOL_ORDER;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_find_standard_pool() {
        let block = create_pool(1, STANDARD_POOL_ORDER).unwrap();
        let vm_base = block as usize;
        unsafe {
            install_pool_header(block, 1, STANDARD_POOL_ORDER, vm_base);
            let ph = pool_of(vm_base + 1234);
            assert!(!ph.is_null());
            assert_eq!((*ph).heap_id, 1);
            assert_eq!((*ph).vm_base, vm_base);
            destroy_pool(vm_base, STANDARD_POOL_ORDER);
        }
    }

    #[test]
    fn create_and_find_oversized_pool() {
        let oversized_order = STANDARD_POOL_ORDER + 2;
        let block = create_pool(7, oversized_order).unwrap();
        let vm_base = block as usize;
        unsafe {
            install_pool_header(block, 7, oversized_order, vm_base);
            // An address deep inside the oversized pool, well past one
            // POOL_SIZE stride from the true base.
            let probe = vm_base + 3 * POOL_SIZE + 17;
            let ph = pool_of(probe);
            assert!(!ph.is_null());
            assert_eq!((*ph).vm_base, vm_base);
            destroy_pool(vm_base, oversized_order);
        }
    }
}
