//! Error kinds returned at the crate's public API boundary.
//!
//! `heap`/`pool`/`block` return `Result<*mut Header, Error>` directly
//! rather than threading a separate raw-pointer sentinel through the
//! allocator's hot paths — `Error` here is already just a few small
//! variants, so there was no separate encoding worth keeping distinct
//! from it. Every function outside those three modules returns
//! `Result<T, Error>` at its boundary.

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The buddy heap (or a direct mapping request) could not satisfy an
    /// allocation: no memory available from the OS, or the requested order
    /// exceeds `MAX_ORDER` and a direct mapping also failed.
    #[error("out of memory ({0})")]
    Oom(&'static str),

    /// A platform or file I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation was applied to a value of the wrong type (e.g.
    /// `vec_append` on a table, or a column file whose header type is not on
    /// the scalar allowlist).
    #[error("type error: {0}")]
    Type(TypeError),

    /// An index, length, or row count was out of bounds or negative where a
    /// non-negative value was required.
    #[error("range error: {0}")]
    Range(&'static str),

    /// A persisted artifact (column file, splay directory, partition
    /// metadata) failed validation: bad magic/size invariants, a name
    /// outside the scalar allowlist, or a length that disagrees with the
    /// file's actual size.
    #[error("corrupt data: {0}")]
    Corrupt(&'static str),

    /// The operation is a recognized but unimplemented variant (e.g. an
    /// `ENUM` column written to a column file).
    #[error("not yet implemented: {0}")]
    Nyi(&'static str),
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub found: &'static str,
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected {}, found {}", self.expected, self.found)
    }
}

impl Error {
    pub fn type_mismatch(expected: &'static str, found: &'static str) -> Self {
        Error::Type(TypeError { expected, found })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
