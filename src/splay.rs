//! Splayed table I/O: a table directory `T/` holding `T/.d` (an `I64`
//! vector of column name ids, in column order) plus one file per column
//! named after its interned symbol. Saves write to a sibling temp
//! directory and rename it into place, so a crash mid-write never leaves
//! a half-written directory at the final path.

use crate::block::{kind, Header};
use crate::column_file;
use crate::error::Error;
use crate::path;
use crate::rc;
use crate::symtab;
use crate::table;
use crate::vector;
use std::fs;
use std::path::{Path, PathBuf};

const SCHEMA_FILE: &str = ".d";

/// Save `table` as a splayed directory at `dir`, via a temp sibling
/// directory renamed into place on success.
///
/// # Safety
/// `table` must be a live table header whose columns are all on the
/// scalar file allowlist.
pub unsafe fn splay_save(table: *const Header, dir: &Path) -> Result<(), Error> {
    unsafe {
        let n = crate::table::table_ncols(table);
        let schema = crate::table::table_schema(table);
        let names_ptr = (*schema).payload_ptr() as *const i64;

        let parent = dir.parent().unwrap_or_else(|| Path::new("."));
        let tmp_name = format!(
            ".{}.tmp",
            dir.file_name().and_then(|n| n.to_str()).unwrap_or("splay")
        );
        let tmp_dir = parent.join(tmp_name);
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)?;
        }
        fs::create_dir_all(&tmp_dir)?;

        column_file::col_save(schema, &tmp_dir.join(SCHEMA_FILE))?;

        for i in 0..n {
            let name_id = *names_ptr.add(i);
            let name = symtab::sym_str(name_id).ok_or(Error::Corrupt("column name id is not interned"))?;
            path::validate_component(&name)?;
            let col = crate::table::table_get_col_idx(table, i);
            column_file::col_save(col, &tmp_dir.join(&name))?;
        }

        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        fs::rename(&tmp_dir, dir)?;
        Ok(())
    }
}

/// Load a splayed table directory, preserving column order. Columns are
/// loaded via `copy` mode; see `splay_load_mmap` for zero-copy loading.
pub fn splay_load(dir: &Path) -> Result<*mut Header, Error> {
    load(dir, column_file::col_load_copy)
}

/// Load a splayed table directory with each column zero-copy mapped.
pub fn splay_load_mmap(dir: &Path) -> Result<*mut Header, Error> {
    load(dir, column_file::col_load_mmap)
}

fn load(dir: &Path, loader: impl Fn(&Path) -> Result<*mut Header, Error>) -> Result<*mut Header, Error> {
    let schema_header = column_file::col_load_copy(&dir.join(SCHEMA_FILE))?;
    unsafe {
        if (*schema_header).type_ != kind::I64 {
            rc::release(schema_header);
            return Err(Error::Corrupt("splay schema file must be an I64 vector"));
        }
        let n = (*schema_header).len() as usize;
        let names = (*schema_header).payload_ptr() as *const i64;
        let mut names_vec = Vec::with_capacity(n);
        let mut cols = Vec::with_capacity(n);
        for i in 0..n {
            let name_id = *names.add(i);
            let name = match symtab::sym_str(name_id) {
                Some(name) => name,
                None => {
                    rc::release(schema_header);
                    for c in cols {
                        rc::release(c);
                    }
                    return Err(Error::Corrupt("splay schema references an unknown symbol id"));
                }
            };
            let col_path: PathBuf = dir.join(&name);
            match loader(&col_path) {
                Ok(col) => {
                    names_vec.push(name_id);
                    cols.push(col);
                }
                Err(e) => {
                    rc::release(schema_header);
                    for c in cols {
                        rc::release(c);
                    }
                    return Err(e);
                }
            }
        }
        rc::release(schema_header);
        let result = table::table_new(&names_vec, &cols);
        for c in cols {
            rc::release(c);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i64_vec(values: &[i64]) -> *mut Header {
        let mut v = vector::vec_new(kind::I64, 0).unwrap();
        for x in values {
            v = unsafe { vector::vec_append(v, &x.to_le_bytes()).unwrap() };
        }
        v
    }

    #[test]
    fn save_then_load_preserves_order_and_data() {
        let px = i64_vec(&[1, 2, 3]);
        let sz = i64_vec(&[10, 20, 30]);
        let px_id = symtab::sym_intern("splay-test-px");
        let sz_id = symtab::sym_intern("splay-test-sz");

        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("T");
        unsafe {
            let t = table::table_new(&[px_id, sz_id], &[px, sz]).unwrap();
            splay_save(t, &dir).unwrap();
            rc::release(px);
            rc::release(sz);
            rc::release(t);
        }

        let loaded = splay_load(&dir).unwrap();
        unsafe {
            assert_eq!(table::table_ncols(loaded), 2);
            assert_eq!(table::table_col_idx(loaded, px_id), Some(0));
            assert_eq!(table::table_col_idx(loaded, sz_id), Some(1));
            let got_sz = table::table_get_col(loaded, sz_id).unwrap();
            let data = (*got_sz).payload_ptr() as *const i64;
            assert_eq!([*data, *data.add(1), *data.add(2)], [10, 20, 30]);
            rc::release(loaded);
        }
    }
}
