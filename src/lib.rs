//! The on-disk core of a full-text search index: term dictionaries stored as
//! ordered hash files, posting lists stored as skip-friendly block runs, and
//! minimized finite-state transducers for fuzzy and prefix term matching.
//!
//! The write path streams sorted `(field, term, docnum, weight, value)`
//! postings into a [`segment::FieldWriter`], which batches them through the
//! [`postings`] block writer and records per-term statistics in the term
//! index. The read path memory-maps the closed segment and answers lookups
//! through [`segment::TermsReader`] and [`segment::PerDocReader`].

pub mod columns;
pub mod compound;
pub mod fsa;
pub mod fst;
pub mod io_helper;
pub mod numeric;
pub mod postings;
pub mod segment;
pub mod tables;
pub mod terminfo;

#[macro_use]
extern crate serde_derive;

use std::{io, str::Utf8Error};

#[derive(Debug)]
pub enum Error {
    /// Keys, terms, or doc ids arrived out of order; fatal to the write.
    OrderViolation(String),
    /// Wrong magic bytes on open.
    BadMagic([u8; 4]),
    /// Recognized an older on-disk format we no longer read.
    UnsupportedVersion(String),
    /// Corrupt length field, truncated trailer, and similar.
    Corrupt(String),
    /// A value rejected by the FST value type.
    InvalidValue(String),
    /// A matcher was advanced past its final posting.
    ReadPastEnd,
    /// Hash selector byte we don't implement.
    UnsupportedHash(u8),
    InternalSizeErr,
    IO(io::Error),
    Utf8DecodeError(Utf8Error),
    BadMeta(serde_json::Error),
    Context(String, Box<Error>),
}

impl Error {
    pub fn with_context<S>(self, msg: S) -> Error
    where
        S: Into<String>,
    {
        Error::Context(msg.into(), Box::new(self))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IO(err)
    }
}

impl From<Utf8Error> for Error {
    fn from(err: Utf8Error) -> Error {
        Error::Utf8DecodeError(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Error {
        Error::BadMeta(err)
    }
}

/// Document number within a single segment.
pub type DocId = u32;

/// Sentinel stored in TermInfo headers when a min/max id is absent.
pub const NO_ID: u32 = 0xFFFF_FFFF;

/// Items with this doc number feed the spelling dictionary only; the field
/// writer accepts and skips them since this codec keeps no spelling graph.
pub const SPELL_DOC: i64 = -1;
