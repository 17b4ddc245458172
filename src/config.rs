//! Build-time-resolved tunables (see `build.rs` / `heap.toml`), plus the
//! small set of derived constants that are cheaper to compute once here
//! than to regenerate.

include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));

/// Smallest block size in bytes (`2^MIN_ORDER`).
pub const MIN_BLOCK_SIZE: usize = 1 << MIN_ORDER;

/// Standard pool size in bytes (`2^POOL_ORDER`).
pub const POOL_SIZE: usize = 1 << POOL_ORDER;

/// Header size in bytes; also the minimum allocatable unit's metadata cost.
pub const HEADER_SIZE: usize = 32;

/// Rows per selection-mask / morsel segment.
pub const MORSEL: usize = MORSEL_ELEMS;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_are_sane() {
        assert!(MIN_ORDER < POOL_ORDER);
        assert!(POOL_ORDER < MAX_ORDER);
        assert!(SLAB_MIN_ORDER <= SLAB_MAX_ORDER);
        assert!((SLAB_MAX_ORDER as u32) < POOL_ORDER as u32);
        assert_eq!(MIN_BLOCK_SIZE, 1usize << MIN_ORDER);
        assert!(MORSEL.is_power_of_two());
    }
}
