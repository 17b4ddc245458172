//! Lightweight synchronization primitives for use in the allocator.
//!
//! We cannot use `std::sync::Mutex` for the heap registry's map-mutation
//! path, since it must stay usable from allocator code that may itself be
//! called from a signal-unsafe or allocation-sensitive context. Instead we
//! provide a CAS spinlock with backoff.

use core::sync::atomic::{AtomicBool, Ordering};

/// A CAS spinlock with exponential pause/yield backoff, for the global heap
/// registry: writes are rare (pool/heap registration) but must never block a
/// hot allocate/free path indefinitely behind an unrelated registration.
pub struct BackoffSpinLock {
    locked: AtomicBool,
}

impl Default for BackoffSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl BackoffSpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) {
        let mut spins: u32 = 0;
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            if spins < 10 {
                for _ in 0..(1u32 << spins) {
                    core::hint::spin_loop();
                }
            } else {
                std::thread::yield_now();
            }
            spins = spins.saturating_add(1);
        }
    }

    #[inline]
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

unsafe impl Send for BackoffSpinLock {}
unsafe impl Sync for BackoffSpinLock {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn basic_lock_unlock() {
        let lock = BackoffSpinLock::new();
        lock.lock();
        lock.unlock();
    }

    #[test]
    fn serializes_concurrent_increments() {
        let lock = Arc::new(BackoffSpinLock::new());
        let counter = Arc::new(core::sync::atomic::AtomicU64::new(0));
        let num_threads = 8;
        let iterations = 10_000;

        let handles: Vec<_> = (0..num_threads)
            .map(|_| {
                let l = Arc::clone(&lock);
                let c = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..iterations {
                        l.lock();
                        c.fetch_add(1, Ordering::Relaxed);
                        l.unlock();
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::Relaxed), num_threads * iterations);
    }
}
