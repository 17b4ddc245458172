//! Columnar tables: a schema vector of interned column-name ids plus a
//! parallel array of owned column pointers.

use crate::block::{kind, Header};
use crate::error::Error;
use crate::heap;
use crate::parted;
use crate::rc;
use crate::vector;

/// Allocate a table from `names` (symbol ids) and `cols` (owned column
/// headers, one per name, retained into the new table).
///
/// # Safety
/// Every entry of `cols` must be a live header with row count agreeing
/// with the others (uniform table shape is the caller's responsibility;
/// this function does not check it, matching `add_col` below).
pub unsafe fn table_new(names: &[i64], cols: &[*mut Header]) -> Result<*mut Header, Error> {
    unsafe {
        if names.len() != cols.len() {
            return Err(Error::Range("schema name count must match column count"));
        }
        let n = names.len();
        let schema = vector::vec_new(kind::I64, n)?;
        {
            let data = (*schema).payload_mut_ptr() as *mut i64;
            for (i, name) in names.iter().enumerate() {
                *data.add(i) = *name;
            }
        }
        let payload_bytes = (n + 1) * size_of::<usize>();
        let table = heap::with_heap(|heap| heap.allocate(payload_bytes))?;
        (*table).type_ = kind::TABLE;
        (*table).set_len(n as i64);
        let slots = (*table).payload_mut_ptr() as *mut *mut Header;
        slots.write(schema);
        for (i, col) in cols.iter().enumerate() {
            rc::retain(*col);
            slots.add(1 + i).write(*col);
        }
        Ok(table)
    }
}

/// Append a new named column to `table`, copy-on-writing the table,
/// growing its schema and slot array, and retaining `col` into the copy.
///
/// # Safety
/// `table` must be a live table header; `col` must be a live header with
/// a row count matching the table's other columns.
pub unsafe fn add_col(table: *mut Header, name: i64, col: *mut Header) -> Result<*mut Header, Error> {
    unsafe {
        let table = rc::cow(table);
        let n = (*table).len() as usize;

        let schema_slot = (*table).payload_mut_ptr() as *mut *mut Header;
        let old_schema = *schema_slot;
        let new_schema = vector::vec_append(old_schema, &name.to_le_bytes())?;
        *schema_slot = new_schema;

        let new_bytes = (n + 2) * size_of::<usize>();
        let grown = vector::scratch_realloc(table, new_bytes)?;
        (*grown).set_len((n + 1) as i64);
        let slots = (*grown).payload_mut_ptr() as *mut *mut Header;
        rc::retain(col);
        slots.add(1 + n).write(col);
        Ok(grown)
    }
}

/// Find column `name`'s index, if present.
///
/// # Safety
/// `table` must be a live table header.
pub unsafe fn table_col_idx(table: *const Header, name: i64) -> Option<usize> {
    unsafe {
        let schema = table_schema(table);
        let n = (*schema).len() as usize;
        let data = (*schema).payload_ptr() as *const i64;
        (0..n).find(|&i| *data.add(i) == name)
    }
}

/// # Safety
/// `table` must be a live table header.
pub unsafe fn table_schema(table: *const Header) -> *mut Header {
    unsafe {
        let slots = (*table).payload_ptr() as *const *mut Header;
        *slots
    }
}

/// # Safety
/// `table` must be a live table header; `idx` must be in bounds.
pub unsafe fn table_get_col_idx(table: *const Header, idx: usize) -> *mut Header {
    unsafe {
        let slots = (*table).payload_ptr() as *const *mut Header;
        *slots.add(1 + idx)
    }
}

/// # Safety
/// `table` must be a live table header.
pub unsafe fn table_get_col(table: *const Header, name: i64) -> Option<*mut Header> {
    unsafe { table_col_idx(table, name).map(|i| table_get_col_idx(table, i)) }
}

/// # Safety
/// `table` must be a live table header.
pub unsafe fn table_ncols(table: *const Header) -> usize {
    unsafe { (*table).len() as usize }
}

/// Row count of a table: the length of its first column, resolving
/// partitioned and `MAPCOMMON` special cases (whose "length" is a segment
/// count or a key count rather than a row count) to the sum/lookup the
/// spec describes.
///
/// # Safety
/// `table` must be a live table header with at least one column.
pub unsafe fn table_nrows(table: *const Header) -> Result<i64, Error> {
    unsafe {
        let n = table_ncols(table);
        if n == 0 {
            return Ok(0);
        }
        let first = table_get_col_idx(table, 0);
        let t = (*first).type_;
        if kind::is_parted(t) {
            let segs = (*first).len() as usize;
            let slots = (*first).payload_ptr() as *const *mut Header;
            let mut total = 0i64;
            for i in 0..segs {
                total += (*(*slots.add(i))).len();
            }
            return Ok(total);
        }
        if t == kind::MAPCOMMON {
            let slots = (*first).payload_ptr() as *const *mut Header;
            let row_counts = *slots.add(1);
            let counts = (*row_counts).payload_ptr() as *const i64;
            let m = (*row_counts).len() as usize;
            let mut total = 0i64;
            for i in 0..m {
                total += *counts.add(i);
            }
            return Ok(total);
        }
        Ok((*first).len())
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
    fn new_table_roundtrips_columns() {
        let a = i64_vec(&[1, 2, 3]);
        let b = i64_vec(&[4, 5, 6]);
        unsafe {
            let t = table_new(&[100, 200], &[a, b]).unwrap();
            assert_eq!(table_ncols(t), 2);
            assert_eq!(table_nrows(t).unwrap(), 3);
            assert_eq!(table_col_idx(t, 200), Some(1));
            let got_b = table_get_col(t, 200).unwrap();
            assert_eq!((*got_b).len(), 3);
            rc::release(a);
            rc::release(b);
            rc::release(t);
        }
    }

    #[test]
    fn add_col_extends_schema_and_slots() {
        let a = i64_vec(&[1, 2]);
        let c = i64_vec(&[9, 9]);
        unsafe {
            let t = table_new(&[1], &[a]).unwrap();
            let t = add_col(t, 2, c).unwrap();
            assert_eq!(table_ncols(t), 2);
            assert_eq!(table_col_idx(t, 2), Some(1));
            rc::release(a);
            rc::release(c);
            rc::release(t);
        }
    }

    #[test]
    fn add_col_on_retained_table_does_not_mutate_original() {
        let a = i64_vec(&[1, 2, 3]);
        let b = i64_vec(&[4, 5, 6]);
        let c = i64_vec(&[7, 8, 9]);
        unsafe {
            let original = table_new(&[100, 200], &[a, b]).unwrap();
            let shared = original;
            rc::retain(shared);

            let extended = add_col(shared, 300, c).unwrap();

            assert_eq!(table_ncols(original), 2);
            assert_eq!(table_col_idx(original, 300), None);
            assert_eq!(table_ncols(extended), 3);
            assert_eq!(table_col_idx(extended, 300), Some(2));

            rc::release(a);
            rc::release(b);
            rc::release(c);
            rc::release(original);
            rc::release(extended);
        }
    }

    #[test]
    fn nrows_sums_partitioned_segment_lengths() {
        let seg0 = i64_vec(&[1, 2, 3]);
        let seg1 = i64_vec(&[]);
        let seg2 = i64_vec(&[4, 5, 6, 7, 8]);
        unsafe {
            let p = parted::parted_new(&[seg0, seg1, seg2]).unwrap();
            let t = table_new(&[1], &[p]).unwrap();
            assert_eq!(table_nrows(t).unwrap(), 8);
            rc::release(seg0);
            rc::release(seg1);
            rc::release(seg2);
            rc::release(p);
            rc::release(t);
        }
    }
}
