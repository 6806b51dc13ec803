//! Pluggable value types carried on FST arcs. Minimization pushes shared
//! value prefixes toward the root: `common` finds the shared part, `add`
//! and `subtract` move residues up and down a path, and `to_bytes` feeds
//! node-identity fingerprints. `merge` (optional) combines the values of
//! duplicate keys.
//!
//! Absent values are `None` at every call site; implementations only see
//! present values.

use crate::io_helper::{DataInputStream, InputStream, SliceInputStream};
use crate::numeric::write_vbyte;
use crate::Error;
use std::fmt::Debug;
use std::io::{self, Write};

pub trait Values {
    type V: Clone + PartialEq + Debug;

    fn is_valid(v: &Self::V) -> bool;

    /// The shared part of two values, if any.
    fn common(a: Option<&Self::V>, b: Option<&Self::V>) -> Option<Self::V>;

    /// Prepend `prefix` to `v`.
    fn add(prefix: Option<&Self::V>, v: Option<&Self::V>) -> Option<Self::V>;

    /// Remove the leading `prefix` from `v`.
    fn subtract(v: Option<&Self::V>, prefix: Option<&Self::V>) -> Option<Self::V>;

    fn write<W: Write>(out: &mut W, v: &Self::V) -> io::Result<()>;
    fn read(input: &mut SliceInputStream) -> Result<Self::V, Error>;
    fn skip(input: &mut SliceInputStream) -> Result<(), Error> {
        Self::read(input).map(|_| ())
    }

    /// Stable byte form for node fingerprinting.
    fn to_bytes(v: &Self::V) -> Vec<u8>;
}

/// Unsigned integers: the common part is the minimum, paths accumulate by
/// addition.
pub struct IntValues;

impl Values for IntValues {
    type V = u64;

    fn is_valid(_v: &u64) -> bool {
        true
    }

    fn common(a: Option<&u64>, b: Option<&u64>) -> Option<u64> {
        match (a, b) {
            (Some(a), Some(b)) => Some(*a.min(b)),
            _ => None,
        }
    }

    fn add(prefix: Option<&u64>, v: Option<&u64>) -> Option<u64> {
        match (prefix, v) {
            (Some(p), Some(v)) => Some(p + v),
            (Some(p), None) => Some(*p),
            (None, Some(v)) => Some(*v),
            (None, None) => None,
        }
    }

    fn subtract(v: Option<&u64>, prefix: Option<&u64>) -> Option<u64> {
        match (v, prefix) {
            (Some(v), Some(p)) => Some(v - p),
            (Some(v), None) => Some(*v),
            (None, _) => None,
        }
    }

    fn write<W: Write>(out: &mut W, v: &u64) -> io::Result<()> {
        write_vbyte(*v, out)?;
        Ok(())
    }

    fn read(input: &mut SliceInputStream) -> Result<u64, Error> {
        input.read_vbyte()
    }

    fn to_bytes(v: &u64) -> Vec<u8> {
        v.to_be_bytes().to_vec()
    }
}

/// Byte strings: the common part is the shared prefix, paths accumulate by
/// concatenation.
pub struct BytesValues;

impl Values for BytesValues {
    type V = Vec<u8>;

    fn is_valid(_v: &Vec<u8>) -> bool {
        true
    }

    fn common(a: Option<&Vec<u8>>, b: Option<&Vec<u8>>) -> Option<Vec<u8>> {
        let (a, b) = match (a, b) {
            (Some(a), Some(b)) => (a, b),
            _ => return None,
        };
        let shared: Vec<u8> = a
            .iter()
            .zip(b.iter())
            .take_while(|(x, y)| x == y)
            .map(|(x, _)| *x)
            .collect();
        if shared.is_empty() {
            None
        } else {
            Some(shared)
        }
    }

    fn add(prefix: Option<&Vec<u8>>, v: Option<&Vec<u8>>) -> Option<Vec<u8>> {
        match (prefix, v) {
            (Some(p), Some(v)) => {
                let mut out = p.clone();
                out.extend_from_slice(v);
                Some(out)
            }
            (Some(p), None) => Some(p.clone()),
            (None, Some(v)) => Some(v.clone()),
            (None, None) => None,
        }
    }

    fn subtract(v: Option<&Vec<u8>>, prefix: Option<&Vec<u8>>) -> Option<Vec<u8>> {
        match (v, prefix) {
            (Some(v), Some(p)) => {
                debug_assert!(v.starts_with(p));
                let rest = v[p.len()..].to_vec();
                if rest.is_empty() {
                    None
                } else {
                    Some(rest)
                }
            }
            (Some(v), None) => Some(v.clone()),
            (None, _) => None,
        }
    }

    fn write<W: Write>(out: &mut W, v: &Vec<u8>) -> io::Result<()> {
        write_vbyte(v.len() as u64, out)?;
        out.write_all(v)
    }

    fn read(input: &mut SliceInputStream) -> Result<Vec<u8>, Error> {
        let len = input.read_vbyte()? as usize;
        Ok(input.read_bytes(len)?.to_vec())
    }

    fn to_bytes(v: &Vec<u8>) -> Vec<u8> {
        v.clone()
    }
}

/// Lists of integers, treated as sequences: common prefix / concatenation,
/// like [`BytesValues`] but element-wise.
pub struct IntListValues;

impl Values for IntListValues {
    type V = Vec<u64>;

    fn is_valid(_v: &Vec<u64>) -> bool {
        true
    }

    fn common(a: Option<&Vec<u64>>, b: Option<&Vec<u64>>) -> Option<Vec<u64>> {
        let (a, b) = match (a, b) {
            (Some(a), Some(b)) => (a, b),
            _ => return None,
        };
        let shared: Vec<u64> = a
            .iter()
            .zip(b.iter())
            .take_while(|(x, y)| x == y)
            .map(|(x, _)| *x)
            .collect();
        if shared.is_empty() {
            None
        } else {
            Some(shared)
        }
    }

    fn add(prefix: Option<&Vec<u64>>, v: Option<&Vec<u64>>) -> Option<Vec<u64>> {
        match (prefix, v) {
            (Some(p), Some(v)) => {
                let mut out = p.clone();
                out.extend_from_slice(v);
                Some(out)
            }
            (Some(p), None) => Some(p.clone()),
            (None, Some(v)) => Some(v.clone()),
            (None, None) => None,
        }
    }

    fn subtract(v: Option<&Vec<u64>>, prefix: Option<&Vec<u64>>) -> Option<Vec<u64>> {
        match (v, prefix) {
            (Some(v), Some(p)) => {
                debug_assert!(v.starts_with(p));
                let rest = v[p.len()..].to_vec();
                if rest.is_empty() {
                    None
                } else {
                    Some(rest)
                }
            }
            (Some(v), None) => Some(v.clone()),
            (None, _) => None,
        }
    }

    fn write<W: Write>(out: &mut W, v: &Vec<u64>) -> io::Result<()> {
        write_vbyte(v.len() as u64, out)?;
        for x in v {
            write_vbyte(*x, out)?;
        }
        Ok(())
    }

    fn read(input: &mut SliceInputStream) -> Result<Vec<u64>, Error> {
        let len = input.read_vbyte()? as usize;
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(input.read_vbyte()?);
        }
        Ok(out)
    }

    fn to_bytes(v: &Vec<u64>) -> Vec<u8> {
        let mut out = Vec::with_capacity(v.len() * 8);
        for x in v {
            out.extend_from_slice(&x.to_be_bytes());
        }
        out
    }
}

/// Value type for plain FSAs: nothing is stored on any arc.
pub struct NoValues;

/// Uninhabited; no arc ever carries one.
#[derive(Clone, PartialEq, Debug)]
pub enum Never {}

impl Values for NoValues {
    type V = Never;

    fn is_valid(_v: &Never) -> bool {
        true
    }
    fn common(_a: Option<&Never>, _b: Option<&Never>) -> Option<Never> {
        None
    }
    fn add(_prefix: Option<&Never>, _v: Option<&Never>) -> Option<Never> {
        None
    }
    fn subtract(_v: Option<&Never>, _prefix: Option<&Never>) -> Option<Never> {
        None
    }
    fn write<W: Write>(_out: &mut W, v: &Never) -> io::Result<()> {
        match *v {}
    }
    fn read(_input: &mut SliceInputStream) -> Result<Never, Error> {
        Err(Error::Corrupt("value in a valueless graph".into()))
    }
    fn to_bytes(v: &Never) -> Vec<u8> {
        match *v {}
    }
}
