//! Cooperative garbage collection: the process-wide `parallel` fence and
//! the per-heap GC pass it triggers.
//!
//! There is no global stop-the-world sweep. Each heap cleans up only
//! itself — draining blocks other threads freed on its behalf, reclaiming
//! oversized pools it created, and releasing pages for large free blocks —
//! which is why this is "cooperative" rather than coordinated: a heap that
//! never calls `parallel_end`/`heap_gc` simply accumulates inbound traffic
//! on its return stack (see `registry.rs`) until it does.

use crate::heap;
use std::sync::atomic::{AtomicBool, Ordering};

static PARALLEL: AtomicBool = AtomicBool::new(false);

/// True while coalescing is suspended for the calling thread's heap, i.e.
/// between a `parallel_begin`/`parallel_end` pair.
pub fn parallel_active() -> bool {
    PARALLEL.load(Ordering::Relaxed)
}

/// Suspend coalescing. Buddies may be on another heap's freelist while
/// parallel work is in flight, and unlinking them without that heap's
/// cooperation would race its owner.
pub fn parallel_begin() {
    PARALLEL.store(true, Ordering::SeqCst);
}

/// Resume coalescing and immediately run a full GC pass on the calling
/// thread's heap.
pub fn parallel_end() {
    PARALLEL.store(false, Ordering::SeqCst);
    heap_gc();
}

/// Run one GC pass on the calling thread's heap: drain cross-thread frees
/// addressed to it, fold them into the ordinary free path (which will
/// coalesce now that `parallel_active()` is false), and reclaim any
/// oversized pool it owns that has gone fully idle.
pub fn heap_gc() {
    heap::with_heap(|h| {
        h.drain_inbound();
        h.reclaim_oversized_pools();
    });
    log::debug!("heap_gc complete");
}

/// Advise the OS to discard physical pages backing large free blocks on
/// the calling thread's heap, without otherwise touching the buddy
/// structure.
pub fn heap_release_pages() {
    heap::with_heap(|h| h.release_pages());
}

/// Fold another heap's pending inbound cross-thread-free traffic into the
/// calling thread's heap. Used when a thread is retiring and wants a
/// survivor heap to adopt blocks still arriving on its return stack.
pub fn heap_merge(other_heap_id: u64) {
    heap::with_heap(|h| {
        let mut node = crate::registry::drain_inbound(other_heap_id);
        while !node.is_null() {
            let next = unsafe { crate::registry::foreign_next(node) };
            unsafe { h.free_block(node) };
            node = next;
        }
    });
}

/// Initialize the calling thread's heap (idempotent: heaps are created
/// lazily on first use, so this just forces that to happen now).
pub fn heap_init() {
    heap::with_heap(|_| {});
}

/// Tear down the calling thread's heap: drain inbound traffic (twice,
/// separated by a fence, to catch frees racing the teardown), then release
/// every pool it still owns back to the OS unconditionally. Callers must
/// ensure no other thread still holds pointers into this heap's pools.
pub fn heap_destroy() {
    heap::with_heap(|h| {
        h.drain_inbound();
        std::sync::atomic::fence(Ordering::SeqCst);
        h.drain_inbound();
        h.release_all_pools();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallel_fence_toggles() {
        assert!(!parallel_active());
        parallel_begin();
        assert!(parallel_active());
        parallel_end();
        assert!(!parallel_active());
    }
}
