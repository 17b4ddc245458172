//! Partitioned dataset I/O: `root/sym` holds the symbol table, and
//! `root/<part>/T/` holds one splayed table directory per partition
//! key, with `<part>` rendered as `YYYY.MM.DD` for date keys, a plain
//! signed integer for int keys, or the interned string for symbol keys.

use crate::block::{kind, Header};
use crate::error::Error;
use crate::parted::{self, key_kind};
use crate::path;
use crate::rc;
use crate::splay;
use crate::symtab;
use crate::table;
use std::fs;
use std::path::Path;

const TABLE_DIR: &str = "T";
const SYM_FILE: &str = "sym";

fn date_to_ymd(days_since_epoch: i32) -> (i32, u32, u32) {
    // Civil-from-days, Howard Hinnant's algorithm; avoids a chrono
    // dependency for a single conversion used only in directory naming.
    let z = days_since_epoch as i64 + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let y = if m <= 2 { y + 1 } else { y };
    (y as i32, m, d)
}

fn partition_name(key_type: u8, key_vec: *const Header, idx: usize) -> Result<String, Error> {
    unsafe {
        match key_type {
            key_kind::DATE => {
                let days = *((*key_vec).payload_ptr() as *const i32).add(idx);
                let (y, m, d) = date_to_ymd(days);
                Ok(format!("{y:04}.{m:02}.{d:02}"))
            }
            key_kind::SYM => {
                let width = crate::block::attrs::sym_width_bytes((*key_vec).attrs);
                let id = match width {
                    1 => *((*key_vec).payload_ptr()).add(idx) as i64,
                    2 => *((*key_vec).payload_ptr() as *const i16).add(idx) as i64,
                    4 => *((*key_vec).payload_ptr() as *const i32).add(idx) as i64,
                    _ => *((*key_vec).payload_ptr() as *const i64).add(idx),
                };
                symtab::sym_str(id).ok_or(Error::Corrupt("partition key references an unknown symbol id"))
            }
            _ => {
                let v = *((*key_vec).payload_ptr() as *const i64).add(idx);
                Ok(v.to_string())
            }
        }
    }
}

/// Write a partitioned dataset: `keys`/`segment tables` pairs, one
/// sub-directory per key, plus the shared symbol table at `root/sym`.
///
/// # Safety
/// `keys` must be a live `DATE`, `I64`, or `SYM` vector; `segments` must
/// have one live table header per key, in the same order.
pub unsafe fn partition_save(root: &Path, keys: *const Header, segments: &[*mut Header]) -> Result<(), Error> {
    unsafe {
        let n = (*keys).len() as usize;
        if n != segments.len() {
            return Err(Error::Range("one table segment is required per partition key"));
        }
        let key_type = match (*keys).type_ {
            kind::DATE => key_kind::DATE,
            kind::SYM => key_kind::SYM,
            kind::I64 => key_kind::INT,
            other => return Err(Error::type_mismatch("date, i64, or sym partition keys", kind::name(other))),
        };

        fs::create_dir_all(root)?;
        symtab::sym_save(&root.join(SYM_FILE))?;

        for i in 0..n {
            let name = partition_name(key_type, keys, i)?;
            path::validate_component(&name)?;
            let part_dir = root.join(&name).join(TABLE_DIR);
            splay::splay_save(segments[i], &part_dir)?;
        }
        Ok(())
    }
}

/// Load every partition under `root` (in directory-listing order) into a
/// `PARTED_*`-segmented table: each column becomes a `PARTED_<base>`
/// whose segments are that column's per-partition vectors, in the order
/// partitions were discovered.
pub fn partition_load(root: &Path) -> Result<*mut Header, Error> {
    symtab::sym_load(&root.join(SYM_FILE))?;

    let mut part_dirs: Vec<_> = fs::read_dir(root)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    part_dirs.sort();

    let mut loaded_tables = Vec::with_capacity(part_dirs.len());
    for dir in &part_dirs {
        loaded_tables.push(splay::splay_load(&dir.join(TABLE_DIR))?);
    }

    if loaded_tables.is_empty() {
        return Err(Error::Corrupt("partitioned dataset has no partitions"));
    }

    unsafe {
        let first = loaded_tables[0];
        let ncols = table::table_ncols(first);
        let schema = table::table_schema(first);
        let names_ptr = (*schema).payload_ptr() as *const i64;
        let mut names = Vec::with_capacity(ncols);
        let mut parted_cols = Vec::with_capacity(ncols);

        for col_idx in 0..ncols {
            names.push(*names_ptr.add(col_idx));
            let segs: Vec<*mut Header> = loaded_tables
                .iter()
                .map(|&t| table::table_get_col_idx(t, col_idx))
                .collect();
            parted_cols.push(parted::parted_new(&segs)?);
        }

        let result = table::table_new(&names, &parted_cols);
        for c in parted_cols {
            rc::release(c);
        }
        for t in loaded_tables {
            rc::release(t);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector;

    fn i64_vec(values: &[i64]) -> *mut Header {
        let mut v = vector::vec_new(kind::I64, 0).unwrap();
        for x in values {
            v = unsafe { vector::vec_append(v, &x.to_le_bytes()).unwrap() };
        }
        v
    }

    #[test]
    fn date_conversion_matches_known_epoch_days() {
        assert_eq!(date_to_ymd(0), (1970, 1, 1));
        assert_eq!(date_to_ymd(31), (1970, 2, 1));
    }

    #[test]
    fn save_and_load_int_partitioned_dataset() {
        let keys = i64_vec(&[1, 2]);
        let px0 = i64_vec(&[10, 11]);
        let px1 = i64_vec(&[20, 21, 22]);
        let name_id = symtab::sym_intern("partition-test-px");

        let tmp = tempfile::tempdir().unwrap();
        unsafe {
            let t0 = table::table_new(&[name_id], &[px0]).unwrap();
            let t1 = table::table_new(&[name_id], &[px1]).unwrap();
            partition_save(tmp.path(), keys, &[t0, t1]).unwrap();
            rc::release(keys);
            rc::release(px0);
            rc::release(px1);
            rc::release(t0);
            rc::release(t1);
        }

        let loaded = partition_load(tmp.path()).unwrap();
        unsafe {
            assert_eq!(table::table_nrows(loaded).unwrap(), 5);
            let col = table::table_get_col(loaded, name_id).unwrap();
            assert!(kind::is_parted((*col).type_));
            rc::release(loaded);
        }
    }
}
