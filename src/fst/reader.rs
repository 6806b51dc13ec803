//! Memory-mapped graph reader. Arcs are parsed on demand; a node whose
//! arcs share one size starts with a pseudo-arc that enables binary
//! search. The [`Cursor`] rests *on an arc* and keeps the arc stack from
//! the root, which is what ordered iteration, `skip_to`, and the fuzzy
//! walks build on.

use super::values::Values;
use super::{
    ARC_ACCEPT, ARC_HAS_ACCEPT_VAL, ARC_HAS_VAL, ARC_LAST, ARC_STOP, FIXED_SIZE, GRAPH_MAGIC,
    GRAPH_VERSION, MULTIBYTE_LABEL,
};
use crate::io_helper::{open_mmap_file, DataInputStream, InputStream, SliceInputStream, ValueEntry};
use crate::Error;
use fnv::{FnvHashMap as HashMap, FnvHashSet as HashSet};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::Path;

const HEADER_SIZE: usize = 4 + 4 + 8;
const FIXED_HEADER_SIZE: usize = 1 + 4 + 4;

/// One parsed arc. `endpos` is where the next sibling starts.
#[derive(Debug, Clone, PartialEq)]
pub struct FstArc<V> {
    pub label: Vec<u8>,
    pub target: Option<u64>,
    pub accept: bool,
    pub lastarc: bool,
    pub value: Option<V>,
    pub acceptval: Option<V>,
    pub endpos: u64,
}

pub struct GraphReader<T: Values> {
    data: ValueEntry,
    roots: HashMap<String, u64>,
    _values: PhantomData<T>,
}

impl<T: Values> GraphReader<T> {
    pub fn open(path: &Path) -> Result<Self, Error> {
        Self::from_entry(ValueEntry::whole_file(open_mmap_file(path)?))
    }

    pub fn from_entry(data: ValueEntry) -> Result<Self, Error> {
        let bytes = data.as_bytes();
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Corrupt("graph file too short".into()));
        }
        if &bytes[0..4] != GRAPH_MAGIC {
            return Err(Error::BadMagic([bytes[0], bytes[1], bytes[2], bytes[3]]));
        }
        let mut header = SliceInputStream::new(&bytes[4..HEADER_SIZE]);
        let version = header.read_u32()?;
        if version != GRAPH_VERSION {
            return Err(Error::UnsupportedVersion(format!(
                "graph version {}",
                version
            )));
        }
        let trailer = header.read_u64()? as usize;
        if trailer < HEADER_SIZE || trailer > bytes.len() {
            return Err(Error::Corrupt("graph trailer out of bounds".into()));
        }
        let roots: HashMap<String, u64> = serde_json::from_slice(&bytes[trailer..])?;
        Ok(GraphReader {
            data,
            roots,
            _values: PhantomData,
        })
    }

    pub fn has_root(&self, fieldname: &str) -> bool {
        self.roots.contains_key(fieldname)
    }

    pub fn root(&self, fieldname: &str) -> Option<u64> {
        self.roots.get(fieldname).copied()
    }

    pub fn root_names(&self) -> impl Iterator<Item = &str> {
        self.roots.keys().map(|s| s.as_str())
    }

    fn stream_at(&self, position: u64) -> Result<SliceInputStream, Error> {
        let mut stream = SliceInputStream::new(self.data.as_bytes());
        stream.seek(position as usize)?;
        Ok(stream)
    }

    fn read_arc(&self, input: &mut SliceInputStream) -> Result<FstArc<T::V>, Error> {
        let flags = input.get()?;
        debug_assert_ne!(flags, FIXED_SIZE);
        let label = if flags & MULTIBYTE_LABEL != 0 {
            let len = input.read_vbyte()? as usize;
            input.read_bytes(len)?.to_vec()
        } else {
            vec![input.get()?]
        };
        let target = if flags & ARC_STOP == 0 {
            Some(input.read_u32()? as u64)
        } else {
            None
        };
        let value = if flags & ARC_HAS_VAL != 0 {
            Some(T::read(input)?)
        } else {
            None
        };
        let acceptval = if flags & ARC_HAS_ACCEPT_VAL != 0 {
            Some(T::read(input)?)
        } else {
            None
        };
        Ok(FstArc {
            label,
            target,
            accept: flags & ARC_ACCEPT != 0,
            lastarc: flags & ARC_LAST != 0,
            value,
            acceptval,
            endpos: input.tell() as u64,
        })
    }

    /// First arc of the node at `address` (skipping the fixed-size
    /// pseudo-arc if present).
    pub fn arc_at(&self, address: u64) -> Result<FstArc<T::V>, Error> {
        let mut stream = self.stream_at(address)?;
        if stream.peek() == Some(FIXED_SIZE) {
            stream.advance(FIXED_HEADER_SIZE)?;
        }
        self.read_arc(&mut stream)
    }

    /// The arc starting exactly at `position` (a sibling position, never a
    /// node header).
    fn sibling_at(&self, position: u64) -> Result<FstArc<T::V>, Error> {
        let mut stream = self.stream_at(position)?;
        self.read_arc(&mut stream)
    }

    /// All arcs of the node at `address`, in label order.
    pub fn list_arcs(&self, address: u64) -> Result<Vec<FstArc<T::V>>, Error> {
        let mut out = Vec::new();
        let mut arc = self.arc_at(address)?;
        loop {
            let last = arc.lastarc;
            let endpos = arc.endpos;
            out.push(arc);
            if last {
                return Ok(out);
            }
            arc = self.sibling_at(endpos)?;
        }
    }

    /// Single-byte-label view of a node, for the edit-distance walk.
    pub fn arc_dict(&self, address: u64) -> Result<BTreeMap<u8, FstArc<T::V>>, Error> {
        let mut out = BTreeMap::new();
        for arc in self.list_arcs(address)? {
            if arc.label.len() == 1 {
                out.insert(arc.label[0], arc);
            }
        }
        Ok(out)
    }

    /// Find the arc with `label` leaving the node at `address`; binary
    /// search when the node's arcs are fixed-size.
    pub fn find_arc(&self, address: u64, label: &[u8]) -> Result<Option<FstArc<T::V>>, Error> {
        let mut stream = self.stream_at(address)?;
        if stream.peek() == Some(FIXED_SIZE) && label.len() == 1 {
            stream.advance(1)?;
            let size = stream.read_u32()? as u64;
            let count = stream.read_u32()? as u64;
            let body = address + FIXED_HEADER_SIZE as u64;
            return self.binary_search_fixed(body, size, count, label[0]);
        }
        self.scan_for_arc(&mut stream, label)
    }

    /// Linear probe from the current stream position; arcs within a node
    /// are sorted by label.
    fn scan_for_arc(
        &self,
        stream: &mut SliceInputStream,
        label: &[u8],
    ) -> Result<Option<FstArc<T::V>>, Error> {
        loop {
            let arc = self.read_arc(stream)?;
            if arc.label.as_slice() == label {
                return Ok(Some(arc));
            }
            if arc.label.as_slice() > label || arc.lastarc {
                return Ok(None);
            }
        }
    }

    fn binary_search_fixed(
        &self,
        body: u64,
        size: u64,
        count: u64,
        label: u8,
    ) -> Result<Option<FstArc<T::V>>, Error> {
        let mut lo = 0u64;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let mut probe = self.stream_at(body + mid * size)?;
            let flags = probe.get()?;
            if flags & MULTIBYTE_LABEL != 0 {
                // Mixed in a fixed-size run we can't probe cheaply; fall
                // back to a scan.
                let mut stream = self.stream_at(body)?;
                return self.scan_for_arc(&mut stream, &[label]);
            }
            let midlabel = probe.get()?;
            if midlabel < label {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == count {
            return Ok(None);
        }
        let mut stream = self.stream_at(body + lo * size)?;
        let arc = self.read_arc(&mut stream)?;
        if arc.label.as_slice() == &[label][..] {
            Ok(Some(arc))
        } else {
            Ok(None)
        }
    }

    /// Walk `path` from `address`; the arc consumed by the final label, if
    /// the whole path exists.
    pub fn find_path(&self, address: u64, path: &[u8]) -> Result<Option<FstArc<T::V>>, Error> {
        let mut here = address;
        let mut found: Option<FstArc<T::V>> = None;
        for (i, &label) in path.iter().enumerate() {
            let arc = match self.find_arc(here, &[label])? {
                Some(arc) => arc,
                None => return Ok(None),
            };
            if i + 1 < path.len() {
                here = match arc.target {
                    Some(t) => t,
                    None => return Ok(None),
                };
            }
            found = Some(arc);
        }
        Ok(found)
    }
}

/// A cursor rests on an arc; the stack holds the arcs from the root down
/// to the current position, so `prefix` is just their labels.
pub struct Cursor<'g, T: Values> {
    graph: &'g GraphReader<T>,
    stack: Vec<FstArc<T::V>>,
}

impl<'g, T: Values> Cursor<'g, T> {
    pub fn new(graph: &'g GraphReader<T>, root: u64) -> Result<Self, Error> {
        let first = graph.arc_at(root)?;
        Ok(Cursor {
            graph,
            stack: vec![first],
        })
    }

    pub fn is_active(&self) -> bool {
        !self.stack.is_empty()
    }

    pub fn label(&self) -> Option<&[u8]> {
        self.stack.last().map(|arc| arc.label.as_slice())
    }

    pub fn prefix(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.stack.len());
        for arc in &self.stack {
            out.extend_from_slice(&arc.label);
        }
        out
    }

    pub fn accept(&self) -> bool {
        self.stack.last().map(|arc| arc.accept).unwrap_or(false)
    }

    pub fn stopped(&self) -> bool {
        self.stack
            .last()
            .map(|arc| arc.target.is_none())
            .unwrap_or(true)
    }

    pub fn at_last_arc(&self) -> bool {
        self.stack.last().map(|arc| arc.lastarc).unwrap_or(true)
    }

    /// Accumulated value along the current path.
    pub fn value(&self) -> Option<T::V> {
        let mut acc: Option<T::V> = None;
        for arc in &self.stack {
            acc = T::add(acc.as_ref(), arc.value.as_ref());
        }
        if let Some(top) = self.stack.last() {
            if top.accept {
                acc = T::add(acc.as_ref(), top.acceptval.as_ref());
            }
        }
        acc
    }

    /// The current prefix extended along the single cheapest path to the
    /// nearest key boundary.
    pub fn peek_key(&self) -> Option<Vec<u8>> {
        if self.stack.is_empty() {
            return None;
        }
        let mut key = self.prefix();
        let mut arc = self.stack.last().cloned().unwrap();
        while !arc.accept {
            let target = arc.target?;
            arc = self.graph.arc_at(target).ok()?;
            key.extend_from_slice(&arc.label);
        }
        Some(key)
    }

    /// Move to the next sibling arc, popping ancestors that were on their
    /// last arc. The cursor goes inactive at the end of the root node.
    pub fn next_arc(&mut self) -> Result<(), Error> {
        while let Some(top) = self.stack.last() {
            if top.lastarc {
                self.stack.pop();
            } else {
                let next = self.graph.sibling_at(top.endpos)?;
                *self.stack.last_mut().unwrap() = next;
                return Ok(());
            }
        }
        Ok(())
    }

    /// Descend into the current arc's target node.
    pub fn follow(&mut self) -> Result<(), Error> {
        let target = match self.stack.last().and_then(|arc| arc.target) {
            Some(t) => t,
            None => return Err(Error::ReadPastEnd),
        };
        let first = self.graph.arc_at(target)?;
        self.stack.push(first);
        Ok(())
    }

    /// Move to the sibling arc with the given label; `false` if this node
    /// has no such arc at or after the current position.
    pub fn switch_to(&mut self, label: u8) -> Result<bool, Error> {
        let top = match self.stack.last() {
            Some(top) => top,
            None => return Ok(false),
        };
        if top.label.as_slice() == &[label][..] {
            return Ok(true);
        }
        if top.label.as_slice() > &[label][..] || top.lastarc {
            return Ok(false);
        }
        let mut stream = self.graph.stream_at(top.endpos)?;
        match self.graph.scan_for_arc(&mut stream, &[label])? {
            Some(arc) => {
                *self.stack.last_mut().unwrap() = arc;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Position the cursor at the path spelling `key`, or at the next
    /// greater path in flatten order.
    pub fn skip_to(&mut self, key: &[u8]) -> Result<(), Error> {
        if self.stack.is_empty() {
            return Ok(());
        }
        // Longest agreement between the current path and the key.
        let mut i = 0;
        while i < self.stack.len()
            && i < key.len()
            && self.stack[i].label.as_slice() == &[key[i]][..]
        {
            i += 1;
        }
        if i == key.len() {
            // The current path starts with the key; it is already >= key.
            return Ok(());
        }
        if i < self.stack.len() {
            self.stack.truncate(i + 1);
            if self.stack[i].label.as_slice() > &[key[i]][..] {
                return Ok(());
            }
        } else {
            // The stack is a strict prefix path of the key.
            i = self.stack.len() - 1;
        }

        while let Some(top) = self.stack.last() {
            debug_assert!(i < key.len());
            let label = top.label.as_slice();
            if label == &[key[i]][..] {
                if i + 1 == key.len() {
                    return Ok(());
                }
                if top.target.is_none() {
                    // The path spelling the key's prefix ends here; the
                    // next key is a sibling or an ancestor's sibling.
                    self.next_arc()?;
                    i = self.stack.len().saturating_sub(1);
                    continue;
                }
                self.follow()?;
                i += 1;
            } else if label > &[key[i]][..] {
                return Ok(());
            } else {
                self.next_arc()?;
                i = match self.stack.len() {
                    0 => return Ok(()),
                    depth => depth - 1,
                };
            }
        }
        Ok(())
    }

    /// Remaining keys in lexicographic order.
    pub fn keys(&mut self) -> FlattenIter<'_, 'g, T> {
        FlattenIter { cursor: self }
    }

    pub fn flatten(&mut self) -> Result<Vec<Vec<u8>>, Error> {
        self.keys().collect()
    }

    pub fn flatten_v(&mut self) -> Result<Vec<(Vec<u8>, Option<T::V>)>, Error> {
        let mut out = Vec::new();
        while self.is_active() {
            let item = if self.accept() {
                Some((self.prefix(), self.value()))
            } else {
                None
            };
            if !self.stopped() {
                self.follow()?;
            } else {
                self.next_arc()?;
            }
            if let Some(item) = item {
                out.push(item);
            }
        }
        Ok(out)
    }
}

/// Stateful iterator over the remaining keys of a cursor.
pub struct FlattenIter<'c, 'g, T: Values> {
    cursor: &'c mut Cursor<'g, T>,
}

impl<'c, 'g, T: Values> Iterator for FlattenIter<'c, 'g, T> {
    type Item = Result<Vec<u8>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.cursor.is_active() {
            let key = if self.cursor.accept() {
                Some(self.cursor.prefix())
            } else {
                None
            };
            let step = if !self.cursor.stopped() {
                self.cursor.follow()
            } else {
                self.cursor.next_arc()
            };
            if let Err(e) = step {
                return Some(Err(e));
            }
            if let Some(key) = key {
                return Some(Ok(key));
            }
        }
        None
    }
}

/// Stack state for the within-`k` walk: graph position, edits left,
/// input position, bytes spelled so far, and whether the last arc taken
/// accepts.
#[derive(Clone, PartialEq, Eq, Hash)]
struct WithinState {
    address: Option<u64>,
    edits_left: u32,
    position: usize,
    sofar: Vec<u8>,
    accept: bool,
}

/// Enumerate the keys of a graph within `k` edits of `text` by a direct
/// stack search over the DAG, trying match, insertion, deletion,
/// substitution, and transposition at each step. An alternative to the
/// automaton product for small `k`.
pub struct Within<'g, T: Values> {
    graph: &'g GraphReader<T>,
    text: Vec<u8>,
    stack: Vec<WithinState>,
    seen: HashSet<WithinState>,
}

impl<'g, T: Values> Within<'g, T> {
    pub fn new(
        graph: &'g GraphReader<T>,
        root: u64,
        text: &[u8],
        k: u32,
        prefix: usize,
    ) -> Result<Self, Error> {
        let mut stack = Vec::new();
        let mut address = Some(root);
        let mut sofar = Vec::new();
        let mut accept = false;
        let mut usable = true;

        if prefix > 0 {
            let prefixbytes = &text[..prefix.min(text.len())];
            match graph.find_path(root, prefixbytes)? {
                Some(arc) => {
                    sofar.extend_from_slice(prefixbytes);
                    address = arc.target;
                    accept = arc.accept;
                }
                None => usable = false,
            }
        }
        if usable {
            stack.push(WithinState {
                address,
                edits_left: k,
                position: prefix.min(text.len()),
                sofar,
                accept,
            });
        }
        Ok(Within {
            graph,
            text: text.to_vec(),
            stack,
            seen: HashSet::default(),
        })
    }

    pub fn next_match(&mut self) -> Result<Option<Vec<u8>>, Error> {
        while let Some(state) = self.stack.pop() {
            if self.seen.contains(&state) {
                continue;
            }
            self.seen.insert(state.clone());

            let WithinState {
                address,
                edits_left,
                position,
                sofar,
                accept,
            } = state;
            let text = &self.text;

            // Deleting the rest of the input must fit in the edit budget.
            let result = if accept && (text.len() - position) as u32 <= edits_left {
                Some(sofar.clone())
            } else {
                None
            };

            if let Some(address) = address {
                // Exact match on the next input byte.
                if position < text.len() {
                    if let Some(arc) = self.graph.find_arc(address, &[text[position]])? {
                        self.stack.push(WithinState {
                            address: arc.target,
                            edits_left,
                            position: position + 1,
                            sofar: push_byte(&sofar, text[position]),
                            accept: arc.accept,
                        });
                    }
                }
                if edits_left > 0 {
                    let edits_left = edits_left - 1;
                    let arcs = self.graph.arc_dict(address)?;

                    // Insertions
                    for (&byte, arc) in &arcs {
                        self.stack.push(WithinState {
                            address: arc.target,
                            edits_left,
                            position,
                            sofar: push_byte(&sofar, byte),
                            accept: arc.accept,
                        });
                    }

                    if position < text.len() {
                        let current = text[position];
                        // Deletion
                        self.stack.push(WithinState {
                            address: Some(address),
                            edits_left,
                            position: position + 1,
                            sofar: sofar.clone(),
                            accept: false,
                        });
                        // Substitution
                        for (&byte, arc) in &arcs {
                            if byte != current {
                                self.stack.push(WithinState {
                                    address: arc.target,
                                    edits_left,
                                    position: position + 1,
                                    sofar: push_byte(&sofar, byte),
                                    accept: arc.accept,
                                });
                            }
                        }
                        // Transposition
                        if position + 1 < text.len() {
                            let ahead = text[position + 1];
                            if ahead != current {
                                if let Some(first) = arcs.get(&ahead) {
                                    if let Some(target) = first.target {
                                        if let Some(second) =
                                            self.graph.find_arc(target, &[current])?
                                        {
                                            let mut swapped = push_byte(&sofar, ahead);
                                            swapped.push(current);
                                            self.stack.push(WithinState {
                                                address: second.target,
                                                edits_left,
                                                position: position + 2,
                                                sofar: swapped,
                                                accept: second.accept,
                                            });
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }

            if result.is_some() {
                return Ok(result);
            }
        }
        Ok(None)
    }
}

fn push_byte(sofar: &[u8], byte: u8) -> Vec<u8> {
    let mut out = sofar.to_vec();
    out.push(byte);
    out
}
