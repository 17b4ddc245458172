//! Global heap registry: a lock-free per-heap "return stack" that any
//! thread can push a cross-thread-freed block onto, and that the owning
//! heap drains during its own GC pass. Registration (finding or creating a
//! heap's stack) is protected by a backoff CAS spinlock since it is rare
//! (once per heap lifetime) relative to pushes/drains.

use crate::block::Header;
use crate::sync::BackoffSpinLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::OnceLock;

#[inline]
unsafe fn foreign_next_raw(node: *mut Header) -> *mut Header {
    unsafe { usize::from_le_bytes((*node).overlay[0..8].try_into().unwrap()) as *mut Header }
}

#[inline]
unsafe fn set_foreign_next(node: *mut Header, next: *mut Header) {
    unsafe { (*node).overlay[0..8].copy_from_slice(&(next as usize).to_le_bytes()) };
}

/// Read the `next` link of a block drained from a return stack.
///
/// # Safety
/// `node` must have come from `drain_inbound`.
pub unsafe fn foreign_next(node: *mut Header) -> *mut Header {
    unsafe { foreign_next_raw(node) }
}

struct ReturnStack {
    head: AtomicPtr<Header>,
}

impl ReturnStack {
    fn new() -> Self {
        Self {
            head: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    fn push(&self, node: *mut Header) {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { set_foreign_next(node, head) };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }

    fn drain(&self) -> *mut Header {
        self.head.swap(std::ptr::null_mut(), Ordering::Acquire)
    }
}

struct Registry {
    lock: BackoffSpinLock,
    stacks: std::cell::UnsafeCell<HashMap<u64, Box<ReturnStack>>>,
}

unsafe impl Sync for Registry {}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry {
        lock: BackoffSpinLock::new(),
        stacks: std::cell::UnsafeCell::new(HashMap::new()),
    })
}

fn stack_for(heap_id: u64) -> *const ReturnStack {
    let reg = registry();
    reg.lock.lock();
    let map = unsafe { &mut *reg.stacks.get() };
    let entry = map.entry(heap_id).or_insert_with(|| Box::new(ReturnStack::new()));
    let ptr: *const ReturnStack = &**entry;
    reg.lock.unlock();
    ptr
}

/// Push a cross-thread-freed block onto `target_heap_id`'s inbound stack.
///
/// # Safety
/// `block` must not be reachable from any other structure after this call.
pub fn push_foreign(target_heap_id: u64, block: *mut Header) {
    let stack = stack_for(target_heap_id);
    unsafe { (*stack).push(block) };
}

/// Drain `heap_id`'s inbound stack, returning the head of a singly-linked
/// chain (via `foreign_next`) of blocks to fold into the local freelists.
pub fn drain_inbound(heap_id: u64) -> *mut Header {
    let stack = stack_for(heap_id);
    unsafe { (*stack).drain() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, Layout};

    #[test]
    fn push_and_drain() {
        unsafe {
            let layout = Layout::new::<Header>();
            let a = alloc_zeroed(layout) as *mut Header;
            let b = alloc_zeroed(layout) as *mut Header;
            push_foreign(999, a);
            push_foreign(999, b);
            let head = drain_inbound(999);
            assert_eq!(head, b);
            let next = foreign_next(head);
            assert_eq!(next, a);
            std::alloc::dealloc(a as *mut u8, layout);
            std::alloc::dealloc(b as *mut u8, layout);
        }
    }
}
