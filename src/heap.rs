//! The per-thread buddy heap: pool growth, cascading split/coalesce, slab
//! cache, and the local side of cross-thread free (see `registry.rs` for
//! the lock-free hand-back stacks and `gc.rs` for the cooperative GC that
//! drains them).

use crate::block::Header;
use crate::config::{HEADER_SIZE, MAX_ORDER, MIN_ORDER, PAGE_SIZE, POOL_ORDER, SLAB_CACHE_SIZE, SLAB_MAX_ORDER};
use crate::error::Error;
use crate::freelist::FreeList;
use crate::gc::parallel_active;
use crate::platform;
use crate::pool::{self, PoolHeader};
use crate::registry;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

fn num_orders() -> usize {
    (MAX_ORDER - MIN_ORDER + 1) as usize
}

#[inline]
fn order_index(order: u8) -> usize {
    (order - MIN_ORDER) as usize
}

struct PoolRecord {
    vm_base: usize,
    pool_order: u8,
}

struct DirectTracker {
    header: *mut Header,
    mapped_size: usize,
}

pub struct ThreadHeap {
    heap_id: u64,
    pools: Vec<PoolRecord>,
    free_lists: Vec<FreeList>,
    avail: u64,
    slabs: Vec<Vec<*mut Header>>,
    direct: Vec<DirectTracker>,
}

// Raw pointers only ever touch this thread's own memory plus blocks handed
// to us exclusively via `registry`'s lock-free stacks, so a `ThreadHeap` is
// fine to move but never to share.
unsafe impl Send for ThreadHeap {}

static NEXT_HEAP_ID: AtomicU64 = AtomicU64::new(1);

impl ThreadHeap {
    fn new() -> Self {
        assert!(num_orders() <= 64, "order range must fit the avail bitmask");
        let slab_orders = (SLAB_MAX_ORDER - MIN_ORDER + 1) as usize;
        Self {
            heap_id: NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed),
            pools: Vec::new(),
            free_lists: (0..num_orders()).map(|_| FreeList::new()).collect(),
            avail: 0,
            slabs: (0..slab_orders).map(|_| Vec::new()).collect(),
            direct: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.heap_id
    }

    fn order_for(payload_bytes: usize) -> u8 {
        let needed = payload_bytes.saturating_add(HEADER_SIZE).max(1usize << MIN_ORDER);
        let mut order = (usize::BITS - (needed - 1).leading_zeros()) as u8;
        if order < MIN_ORDER {
            order = MIN_ORDER;
        }
        order
    }

    fn set_avail(&mut self, order: u8) {
        self.avail |= 1u64 << order_index(order);
    }

    fn clear_avail_if_empty(&mut self, order: u8) {
        if self.free_lists[order_index(order)].is_empty() {
            self.avail &= !(1u64 << order_index(order));
        }
    }

    fn pool_containing(&self, addr: usize) -> Option<usize> {
        self.pools
            .iter()
            .position(|p| addr >= p.vm_base && addr < p.vm_base + (1usize << p.pool_order))
    }

    /// Split `block` (of order `from`) down to order `to`, pushing every
    /// right half produced along the way onto its freelist. Returns the
    /// final leftmost block, still unlinked from any list.
    unsafe fn split_down(&mut self, block: *mut Header, from: u8, to: u8) -> *mut Header {
        let mut order = from;
        let mut cur = block;
        while order > to {
            order -= 1;
            let half = 1usize << order;
            let right = (cur as usize + half) as *mut Header;
            unsafe {
                (*right).overlay = [0; 16];
                (*right).type_ = 0;
                (*right).order = order;
                (*right).mmod = 0;
                (*right).attrs = 0;
                (*right).rc = std::sync::atomic::AtomicU32::new(0);
                (*right).val = [0; 8];
                self.free_lists[order_index(order)].push_front(right);
            }
            self.set_avail(order);
        }
        cur = cur; // leftmost half, order == to
        unsafe {
            (*cur).order = to;
        }
        cur
    }

    fn grow_pool(&mut self, want_order: u8) -> Result<(), Error> {
        let pool_order = if want_order >= POOL_ORDER {
            want_order + 1
        } else {
            POOL_ORDER
        };
        let whole = pool::create_pool(self.heap_id, pool_order)?;
        let vm_base = whole as usize;
        self.pools.push(PoolRecord { vm_base, pool_order });

        let leftmost = unsafe { self.split_down(whole, pool_order, MIN_ORDER) };
        unsafe { pool::install_pool_header(leftmost, self.heap_id, pool_order, vm_base) };
        // The header consumes the leftmost min-block; it is intentionally
        // not linked into `free_lists[0]`.
        Ok(())
    }

    fn pop_free_at(&mut self, order: u8) -> Option<*mut Header> {
        let node = self.free_lists[order_index(order)].pop_front()?;
        self.clear_avail_if_empty(order);
        Some(node)
    }

    fn find_and_split(&mut self, order: u8) -> Option<*mut Header> {
        let mask = self.avail & (!0u64 << order_index(order));
        let mut remaining = mask;
        while remaining != 0 {
            let idx = remaining.trailing_zeros() as usize;
            let found_order = MIN_ORDER + idx as u8;
            if let Some(block) = self.pop_free_at(found_order) {
                let leftover = unsafe { self.split_down(block, found_order, order) };
                return Some(leftover);
            }
            // Stale bit: clear it and keep scanning.
            self.avail &= !(1u64 << idx);
            remaining &= !(1u64 << idx);
        }
        None
    }

    fn bump_live(&self, addr: usize, delta: i64) {
        if let Some(idx) = self.pool_containing(addr) {
            let rec = &self.pools[idx];
            if let Some(ph) = unsafe { pool_header_ref(rec.vm_base) } {
                if delta >= 0 {
                    ph.live_count.fetch_add(delta as u32, Ordering::Relaxed);
                } else {
                    ph.live_count.fetch_sub((-delta) as u32, Ordering::Relaxed);
                }
            }
        }
    }

    fn alloc_buddy(&mut self, order: u8) -> Result<*mut Header, Error> {
        if order <= SLAB_MAX_ORDER {
            let slab_idx = (order - MIN_ORDER) as usize;
            if let Some(block) = self.slabs[slab_idx].pop() {
                return Ok(block);
            }
        }
        if let Some(block) = self.find_and_split(order) {
            return Ok(block);
        }
        self.drain_inbound();
        if let Some(block) = self.find_and_split(order) {
            return Ok(block);
        }
        self.grow_pool(order)?;
        self.find_and_split(order)
            .ok_or(Error::Oom("pool growth did not yield the requested order"))
    }

    pub fn allocate(&mut self, payload_bytes: usize) -> Result<*mut Header, Error> {
        let order = Self::order_for(payload_bytes);
        if order > MAX_ORDER {
            return self.allocate_direct(payload_bytes);
        }
        let block = self.alloc_buddy(order)?;
        unsafe {
            (*block).overlay = [0; 16];
            (*block).type_ = 0;
            (*block).order = order;
            (*block).mmod = 0;
            (*block).attrs = 0;
            (*block).rc = std::sync::atomic::AtomicU32::new(1);
            (*block).val = [0; 8];
        }
        self.bump_live(block as usize, 1);
        Ok(block)
    }

    fn allocate_direct(&mut self, payload_bytes: usize) -> Result<*mut Header, Error> {
        let total = platform::round_up_page(payload_bytes + HEADER_SIZE);
        let base = unsafe { platform::vm_alloc(total) };
        if base.is_null() {
            return Err(Error::Oom("direct mapping failed"));
        }
        let header = base as *mut Header;
        unsafe {
            (*header).overlay = [0; 16];
            (*header).type_ = 0;
            (*header).order = MAX_ORDER;
            (*header).mmod = crate::block::mmod::DIRECT_MAPPED;
            (*header).attrs = 0;
            (*header).rc = std::sync::atomic::AtomicU32::new(1);
            (*header).val = [0; 8];
        }
        self.direct.push(DirectTracker {
            header,
            mapped_size: total,
        });
        Ok(header)
    }

    /// Return a block to this heap. If it belongs to a pool this heap did
    /// not create, it is handed off to the owner's lock-free return stack
    /// instead.
    ///
    /// # Safety
    /// `block`'s `rc` must already be 0 and all owned children must already
    /// be released (see `rc::release`).
    pub unsafe fn free_block(&mut self, block: *mut Header) {
        let addr = block as usize;
        let mmod = unsafe { (*block).mmod };
        if mmod == crate::block::mmod::FILE_MAPPED {
            unsafe { self.free_file_mapped(block) };
            return;
        }
        if mmod == crate::block::mmod::DIRECT_MAPPED {
            unsafe { self.free_direct(block) };
            return;
        }

        let owner = unsafe { pool::pool_of(addr) };
        if owner.is_null() {
            debug_assert!(false, "freed block does not belong to any known pool");
            return;
        }
        let owner_heap_id = unsafe { (*owner).heap_id };
        if owner_heap_id != self.heap_id {
            registry::push_foreign(owner_heap_id, block);
            return;
        }

        self.bump_live(addr, -1);
        self.free_local(block);
    }

    fn free_local(&mut self, block: *mut Header) {
        let order = unsafe { (*block).order };
        if order <= SLAB_MAX_ORDER {
            let slab_idx = (order - MIN_ORDER) as usize;
            if self.slabs[slab_idx].len() < SLAB_CACHE_SIZE {
                unsafe { (*block).rc.store(1, Ordering::Relaxed) };
                self.slabs[slab_idx].push(block);
                return;
            }
        }

        if parallel_active() {
            unsafe { (*block).rc.store(0, Ordering::Relaxed) };
            self.free_lists[order_index(order)].push_front(block);
            self.set_avail(order);
            return;
        }

        self.coalesce_and_insert(block, order);
    }

    fn coalesce_and_insert(&mut self, block: *mut Header, order: u8) {
        let Some(pool_idx) = self.pool_containing(block as usize) else {
            unsafe { (*block).rc.store(0, Ordering::Relaxed) };
            self.free_lists[order_index(order)].push_front(block);
            self.set_avail(order);
            return;
        };
        let pool = &self.pools[pool_idx];
        let pool_top = pool.pool_order;
        let pool_base = pool.vm_base;

        let mut cur = block;
        let mut cur_order = order;
        while cur_order < pool_top.min(MAX_ORDER) {
            let size = 1usize << cur_order;
            let cur_addr = cur as usize;
            let buddy_addr = pool_base + ((cur_addr - pool_base) ^ size);
            if buddy_addr < pool_base || buddy_addr >= pool_base + (1usize << pool_top) {
                break;
            }
            let buddy = buddy_addr as *mut Header;
            let buddy_order = unsafe { (*buddy).order };
            let buddy_free = unsafe { (*buddy).is_free() };
            if !buddy_free || buddy_order != cur_order {
                break;
            }
            unsafe { FreeList::unlink(buddy) };
            self.clear_avail_if_empty(buddy_order);
            cur = if buddy_addr < cur_addr { buddy } else { cur };
            cur_order += 1;
        }

        unsafe {
            (*cur).order = cur_order;
            (*cur).rc.store(0, Ordering::Relaxed);
        }
        self.free_lists[order_index(cur_order)].push_front(cur);
        self.set_avail(cur_order);
    }

    /// Unconditionally release every pool this heap owns back to the OS.
    /// Only safe to call when the heap is being torn down and no other
    /// thread can still be holding pointers into its pools.
    pub fn release_all_pools(&mut self) {
        for rec in self.pools.drain(..) {
            unsafe { pool::destroy_pool(rec.vm_base, rec.pool_order) };
        }
        for list in &mut self.free_lists {
            *list = FreeList::new();
        }
        for slab in &mut self.slabs {
            slab.clear();
        }
        self.avail = 0;
    }

    /// `FILE_MAPPED` blocks are not buddy-allocated, so `order`/`block_size`
    /// don't describe their extent; recompute the exact mapped length from
    /// the header fields the way `column_file::col_load_mmap` derived it
    /// (header + `len * esz`, plus the trailing bitmap if present), rather
    /// than rounding to a power of two and risking an under- or over-sized
    /// unmap.
    unsafe fn free_file_mapped(&mut self, block: *mut Header) {
        unsafe {
            let esz = crate::block::kind::fixed_esz((*block).type_).unwrap_or(1);
            let len = (*block).len().max(0) as usize;
            let mut size = HEADER_SIZE + len * esz;
            if (*block).attrs & crate::block::attrs::NULLMAP_EXT != 0 {
                size += len.div_ceil(8);
            }
            platform::vm_release(block as *mut u8, size);
        }
    }

    unsafe fn free_direct(&mut self, block: *mut Header) {
        if let Some(idx) = self.direct.iter().position(|t| t.header == block) {
            let tracker = self.direct.swap_remove(idx);
            unsafe { platform::vm_release(tracker.header as *mut u8, tracker.mapped_size) };
        } else {
            log::warn!("direct block freed from a thread other than its allocating thread; leaking by contract");
        }
    }

    /// Drain this heap's inbound cross-thread-free stack and fold every
    /// block into the ordinary local free path.
    pub fn drain_inbound(&mut self) {
        let mut node = registry::drain_inbound(self.heap_id);
        while !node.is_null() {
            let next = unsafe { registry::foreign_next(node) };
            self.bump_live(node as usize, -1);
            self.free_local(node);
            node = next;
        }
    }

    /// Advise the OS to discard pages backing free blocks larger than one
    /// page. Called from `heap_release_pages`.
    pub fn release_pages(&mut self) {
        for list_idx in 0..self.free_lists.len() {
            let order = MIN_ORDER + list_idx as u8;
            let size = 1usize << order;
            if size <= PAGE_SIZE {
                continue;
            }
            let mut node = self.free_lists[list_idx].pop_front();
            let mut collected = Vec::new();
            while let Some(n) = node {
                collected.push(n);
                node = self.free_lists[list_idx].pop_front();
            }
            for n in collected {
                unsafe {
                    let start = (n as usize + PAGE_SIZE) as *mut u8;
                    let advise_len = size - PAGE_SIZE;
                    platform::vm_decommit(start, advise_len);
                    (*n).rc.store(0, Ordering::Relaxed);
                }
                self.free_lists[list_idx].push_front(n);
            }
            self.set_avail(order);
        }
    }

    /// Reclaim any oversized pool created by this heap whose live
    /// allocation count has dropped to zero.
    pub fn reclaim_oversized_pools(&mut self) {
        let mut i = 0;
        while i < self.pools.len() {
            let rec = &self.pools[i];
            if rec.pool_order > POOL_ORDER {
                let live = unsafe { pool_header_ref(rec.vm_base) }
                    .map(|ph| ph.live_count.load(Ordering::Relaxed))
                    .unwrap_or(1);
                if live == 0 {
                    let vm_base = rec.vm_base;
                    let pool_order = rec.pool_order;
                    self.remove_pool_free_entries(vm_base, pool_order);
                    self.pools.remove(i);
                    unsafe { pool::destroy_pool(vm_base, pool_order) };
                    log::debug!("reclaimed oversized pool at {vm_base:#x} (order {pool_order})");
                    continue;
                }
            }
            i += 1;
        }
    }

    fn remove_pool_free_entries(&mut self, vm_base: usize, pool_order: u8) {
        let top = pool_order.min(MAX_ORDER);
        for order in MIN_ORDER..=top {
            let idx = order_index(order);
            loop {
                match self.free_lists[idx].pop_front() {
                    Some(n) if (n as usize) >= vm_base && (n as usize) < vm_base + (1usize << pool_order) => {
                        continue; // drop it; the whole pool is being unmapped
                    }
                    Some(n) => {
                        // Not part of this pool: push back and stop scanning
                        // this order (pools never interleave addresses).
                        self.free_lists[idx].push_front(n);
                        break;
                    }
                    None => break,
                }
            }
            self.clear_avail_if_empty(order);
        }
        let slab_top = top.min(SLAB_MAX_ORDER);
        for order in MIN_ORDER..=slab_top {
            let idx = (order - MIN_ORDER) as usize;
            self.slabs[idx].retain(|&n| !((n as usize) >= vm_base && (n as usize) < vm_base + (1usize << pool_order)));
        }
    }
}

unsafe fn pool_header_ref(vm_base: usize) -> Option<&'static PoolHeader> {
    if vm_base == 0 {
        return None;
    }
    let header = vm_base as *const Header;
    unsafe {
        let ph = (*header).payload_ptr() as *const PoolHeader;
        Some(&*ph)
    }
}

thread_local! {
    static HEAP: RefCell<ThreadHeap> = RefCell::new(ThreadHeap::new());
}

/// Run `f` with exclusive access to the current thread's heap.
pub fn with_heap<R>(f: impl FnOnce(&mut ThreadHeap) -> R) -> R {
    HEAP.with(|h| f(&mut h.borrow_mut()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_BLOCK_SIZE;

    #[test]
    fn allocate_and_free_roundtrip() {
        with_heap(|heap| {
            let block = heap.allocate(16).unwrap();
            unsafe {
                assert_eq!((*block).rc.load(Ordering::Relaxed), 1);
                (*block).rc.store(0, Ordering::Relaxed);
                heap.free_block(block);
            }
        });
    }

    #[test]
    fn buddy_coalesces_back_to_one_free_block() {
        with_heap(|heap| {
            let a = heap.allocate(MIN_BLOCK_SIZE - HEADER_SIZE).unwrap();
            let b = heap.allocate(MIN_BLOCK_SIZE - HEADER_SIZE).unwrap();
            assert_ne!(a, b);
            let order_before = unsafe { (*a).order };
            unsafe {
                (*a).rc.store(0, Ordering::Relaxed);
                heap.free_block(a);
                (*b).rc.store(0, Ordering::Relaxed);
                heap.free_block(b);
            }
            // The pair coalesced one order up from where they were
            // allocated, and `avail` has exactly that one bit set for
            // everything at or above MIN_ORDER (lower orders never had
            // anything carved off them).
            let coalesced_order = order_before + 1;
            assert_eq!(heap.avail, 1u64 << order_index(coalesced_order));
            assert!(heap.free_lists[order_index(order_before)].is_empty());
        });
    }

    #[test]
    fn cross_thread_free_drains_into_owners_pool() {
        use std::sync::mpsc::channel;

        let (ptr_tx, ptr_rx) = channel::<(u64, usize)>();
        let (freed_tx, freed_rx) = channel::<()>();
        let (gc_done_tx, gc_done_rx) = channel::<()>();

        let owner = std::thread::spawn(move || {
            with_heap(|heap| {
                let block = heap.allocate(4096).unwrap();
                ptr_tx.send((heap.id(), block as usize)).unwrap();
            });
            freed_rx.recv().unwrap();
            crate::gc::heap_gc();
            gc_done_tx.send(()).unwrap();
        });

        let (owner_heap_id, addr) = ptr_rx.recv().unwrap();

        let freer = std::thread::spawn(move || {
            with_heap(|heap| {
                assert_ne!(heap.id(), owner_heap_id);
                let block = addr as *mut Header;
                unsafe {
                    (*block).rc.store(0, Ordering::Relaxed);
                    heap.free_block(block);
                }
            });
        });
        freer.join().unwrap();

        // Before the owner drains, the block sits on its inbound stack.
        freed_tx.send(()).unwrap();
        gc_done_rx.recv().unwrap();
        owner.join().unwrap();

        // `heap_gc` drained the stack as part of `parallel_end`'s pass, so
        // nothing is left pending for this heap id.
        assert!(registry::drain_inbound(owner_heap_id).is_null());
    }
}
