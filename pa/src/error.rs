// Copyright 2022 Oxide Computer Company

use std::fmt;
use std::io;

use crate::prefix::Prefix;

#[derive(Debug)]
pub enum Error {
    /// The exact (prefix, element) pair is already linked in the trie.
    DuplicateEntry(Prefix),

    /// Flooding delay out of range. The delay is doubled in 32-bit
    /// arithmetic, so values of 2^31 and above are rejected.
    InvalidFloodingDelay(u32),

    /// Rule priority zero is reserved; a rule carrying it could never be
    /// accepted by the match pass.
    InvalidRulePriority,

    /// A prefix string could not be parsed.
    InvalidPrefix(String),

    /// Storage file I/O failure.
    Io(io::Error),

    /// One or more storage lines were rejected. The cache keeps every line
    /// that did parse.
    StorageParse { rejected: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::DuplicateEntry(p) => {
                write!(f, "entry already present in trie at {}", p)
            }
            Error::InvalidFloodingDelay(d) => {
                write!(f, "flooding delay {} out of range", d)
            }
            Error::InvalidRulePriority => {
                write!(f, "rule priority 0 is reserved")
            }
            Error::InvalidPrefix(s) => {
                write!(f, "invalid prefix {:?}", s)
            }
            Error::Io(e) => write!(f, "storage i/o: {}", e),
            Error::StorageParse { rejected } => {
                write!(f, "{} storage line(s) rejected", rejected)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
