use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Deserialize, Default)]
struct HeapSection {
    page_shift: Option<u32>,
    pool_order: Option<u32>,
    min_order: Option<u32>,
    max_order: Option<u32>,
    slab_max_order: Option<u32>,
    slab_cache_size: Option<usize>,
    morsel_elems: Option<usize>,
}

#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    heap: HeapSection,
}

struct Resolved {
    page_shift: u32,
    pool_order: u32,
    min_order: u32,
    max_order: u32,
    slab_max_order: u32,
    slab_cache_size: usize,
    morsel_elems: usize,
}

fn resolve(cfg: &HeapSection) -> Resolved {
    let page_shift = cfg.page_shift.unwrap_or(12);
    let pool_order = cfg.pool_order.unwrap_or(25);
    let min_order = cfg.min_order.unwrap_or(6);
    let max_order = cfg.max_order.unwrap_or(31);
    let slab_max_order = cfg.slab_max_order.unwrap_or(12);
    let slab_cache_size = cfg.slab_cache_size.unwrap_or(64);
    let morsel_elems = cfg.morsel_elems.unwrap_or(1024);

    assert!(page_shift >= 10, "page_shift ({page_shift}) must be >= 10 (1 KiB)");
    assert!(min_order >= 5, "min_order ({min_order}) must be >= 5 (32 B header room)");
    assert!(
        max_order > pool_order,
        "max_order ({max_order}) must be > pool_order ({pool_order}) so direct mappings exist above the standard pool size"
    );
    assert!(
        pool_order > min_order,
        "pool_order ({pool_order}) must be > min_order ({min_order})"
    );
    assert!(
        slab_max_order >= min_order && slab_max_order < pool_order,
        "slab_max_order ({slab_max_order}) must be within [min_order, pool_order)"
    );
    assert!(slab_cache_size > 0, "slab_cache_size must be > 0");
    assert!(morsel_elems > 0 && morsel_elems.is_power_of_two(), "morsel_elems must be a power of two");
    assert!(max_order <= 63, "max_order ({max_order}) must fit a 6-bit order field region sanely");

    Resolved {
        page_shift,
        pool_order,
        min_order,
        max_order,
        slab_max_order,
        slab_cache_size,
        morsel_elems,
    }
}

fn generate(cfg: &Resolved, out_path: &Path) {
    let code = format!(
        "// Auto-generated by build.rs from heap.toml. Do not edit.\n\n\
         pub const PAGE_SHIFT: usize = {};\n\
         pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;\n\
         pub const POOL_ORDER: u8 = {};\n\
         pub const MIN_ORDER: u8 = {};\n\
         pub const MAX_ORDER: u8 = {};\n\
         pub const SLAB_MIN_ORDER: u8 = MIN_ORDER;\n\
         pub const SLAB_MAX_ORDER: u8 = {};\n\
         pub const SLAB_CACHE_SIZE: usize = {};\n\
         pub const MORSEL_ELEMS: usize = {};\n",
        cfg.page_shift,
        cfg.pool_order,
        cfg.min_order,
        cfg.max_order,
        cfg.slab_max_order,
        cfg.slab_cache_size,
        cfg.morsel_elems,
    );
    fs::write(out_path, code).expect("failed to write config_gen.rs");
}

fn default_config_path() -> String {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    format!("{manifest_dir}/heap.toml")
}

fn main() {
    println!("cargo:rerun-if-env-changed=FRAMECORE_HEAP_CONFIG");

    let out_dir = env::var("OUT_DIR").unwrap();
    let config_path = env::var("FRAMECORE_HEAP_CONFIG").unwrap_or_else(|_| default_config_path());
    println!("cargo:rerun-if-changed={config_path}");

    let content = fs::read_to_string(&config_path)
        .unwrap_or_else(|e| panic!("failed to read {config_path}: {e}"));
    let config: Config = toml::from_str(&content).expect("failed to parse heap.toml");
    let resolved = resolve(&config.heap);

    generate(&resolved, &Path::new(&out_dir).join("config_gen.rs"));
}
