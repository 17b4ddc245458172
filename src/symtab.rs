//! Process-wide symbol intern table: the only host in this crate for the
//! shared `SYM` identifier space that `MAPCOMMON` keys and `SYM` columns
//! draw from. A single `Mutex`-guarded table is sufficient here since
//! interning is rare relative to the allocator hot path the per-thread
//! heaps are built for.

use crate::error::Error;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::{Mutex, OnceLock};

struct SymbolTable {
    strings: Vec<String>,
    ids: HashMap<String, i64>,
}

impl SymbolTable {
    fn new() -> Self {
        Self {
            strings: Vec::new(),
            ids: HashMap::new(),
        }
    }

    fn intern(&mut self, s: &str) -> i64 {
        if let Some(&id) = self.ids.get(s) {
            return id;
        }
        let id = self.strings.len() as i64;
        self.strings.push(s.to_owned());
        self.ids.insert(s.to_owned(), id);
        id
    }
}

static TABLE: OnceLock<Mutex<SymbolTable>> = OnceLock::new();

fn table() -> &'static Mutex<SymbolTable> {
    TABLE.get_or_init(|| Mutex::new(SymbolTable::new()))
}

/// Intern `s`, returning its id (stable for the lifetime of the process;
/// re-interning the same string returns the same id).
pub fn sym_intern(s: &str) -> i64 {
    table().lock().unwrap().intern(s)
}

/// Look up an already-interned string's id without creating a new entry.
pub fn sym_find(s: &str) -> Option<i64> {
    table().lock().unwrap().ids.get(s).copied()
}

/// The string behind `id`, if it has been interned.
pub fn sym_str(id: i64) -> Option<String> {
    let guard = table().lock().unwrap();
    usize::try_from(id).ok().and_then(|i| guard.strings.get(i)).cloned()
}

/// Number of interned symbols.
pub fn sym_count() -> usize {
    table().lock().unwrap().strings.len()
}

/// Persist the table as one string per line, in id order.
pub fn sym_save(path: &Path) -> Result<(), Error> {
    let guard = table().lock().unwrap();
    let mut file = File::create(path)?;
    for s in &guard.strings {
        writeln!(file, "{s}")?;
    }
    Ok(())
}

/// Load symbols from a newline-delimited file, interning each in file
/// order. Existing entries are left alone; a string already interned
/// keeps its original id rather than being duplicated.
pub fn sym_load(path: &Path) -> Result<(), Error> {
    let file = File::open(path)?;
    for line in BufReader::new(file).lines() {
        sym_intern(&line?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_same_string_returns_same_id() {
        let a = sym_intern("roundtrip-test-symbol-a");
        let b = sym_intern("roundtrip-test-symbol-a");
        assert_eq!(a, b);
        assert_eq!(sym_str(a).as_deref(), Some("roundtrip-test-symbol-a"));
    }

    #[test]
    fn distinct_strings_get_distinct_ids() {
        let a = sym_intern("roundtrip-test-symbol-b1");
        let b = sym_intern("roundtrip-test-symbol-b2");
        assert_ne!(a, b);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let id = sym_intern("roundtrip-test-symbol-c");
        sym_save(tmp.path()).unwrap();
        sym_load(tmp.path()).unwrap();
        assert_eq!(sym_find("roundtrip-test-symbol-c"), Some(id));
    }
}
