//! Incremental graph writer: keys arrive in sorted order, the unshared
//! tail of the previous key is frozen bottom-up, and structurally equal
//! frozen nodes are reused by content fingerprint, so each field's graph
//! lands on disk already minimized. Values ride along arcs; shared value
//! fragments migrate toward the root as keys are inserted.

use super::values::Values;
use super::{
    ARC_ACCEPT, ARC_HAS_ACCEPT_VAL, ARC_HAS_VAL, ARC_LAST, ARC_STOP, FIXED_SIZE, GRAPH_MAGIC,
    GRAPH_VERSION,
};
use crate::io_helper::CountingFileWriter;
use crate::Error;
use fnv::FnvHashMap as HashMap;
use log::debug;
use std::io::Write;
use std::path::Path;

const TRAILER_OFFSET_POS: u64 = 4 + 4;

struct UncompiledArc<V> {
    label: u8,
    /// None while the child is still being built, or for leaf targets.
    target: Option<u64>,
    accept: bool,
    value: Option<V>,
    acceptval: Option<V>,
}

struct UncompiledNode<V> {
    arcs: Vec<UncompiledArc<V>>,
    accept: bool,
    /// Accept value pending until this node's parent arc freezes.
    value: Option<V>,
}

impl<V: Clone> UncompiledNode<V> {
    fn new() -> Self {
        UncompiledNode {
            arcs: Vec::new(),
            accept: false,
            value: None,
        }
    }

    fn add_arc(&mut self, label: u8) {
        self.arcs.push(UncompiledArc {
            label,
            target: None,
            accept: false,
            value: None,
            acceptval: None,
        });
    }

    fn last_value(&self, label: u8) -> Option<&V> {
        let arc = self.arcs.last()?;
        debug_assert_eq!(arc.label, label);
        arc.value.as_ref()
    }

    fn set_last_value(&mut self, label: u8, value: Option<V>) {
        if let Some(arc) = self.arcs.last_mut() {
            debug_assert_eq!(arc.label, label);
            arc.value = value;
        }
    }

    fn replace_last(&mut self, label: u8, target: Option<u64>, accept: bool, acceptval: Option<V>) {
        let arc = self.arcs.last_mut().expect("replace_last on empty node");
        debug_assert_eq!(arc.label, label);
        arc.target = target;
        arc.accept = accept;
        arc.acceptval = acceptval;
    }
}

type MergeFn<V> = fn(Option<V>, Option<V>) -> Option<V>;

pub struct GraphWriter<T: Values> {
    file: CountingFileWriter,
    fieldroots: HashMap<String, u64>,
    fieldname: Option<String>,
    /// Frozen-node fingerprints to their addresses, per field.
    seen: HashMap<Vec<u8>, u64>,
    nodes: Vec<UncompiledNode<T::V>>,
    lastkey: Vec<u8>,
    inserted: bool,
    merge: Option<MergeFn<T::V>>,
    node_count: u64,
    arc_count: u64,
}

impl<T: Values> GraphWriter<T> {
    pub fn create(path: &Path) -> Result<Self, Error> {
        let mut file = CountingFileWriter::create(path)?;
        file.write_all(GRAPH_MAGIC)?;
        file.write_u32(GRAPH_VERSION)?;
        file.write_u64(0)?; // trailer offset, patched at close
        Ok(GraphWriter {
            file,
            fieldroots: HashMap::default(),
            fieldname: None,
            seen: HashMap::default(),
            nodes: Vec::new(),
            lastkey: Vec::new(),
            inserted: false,
            merge: None,
            node_count: 0,
            arc_count: 0,
        })
    }

    /// Allow duplicate keys, combining their values with `merge`.
    pub fn with_merge(mut self, merge: MergeFn<T::V>) -> Self {
        self.merge = Some(merge);
        self
    }

    pub fn start_field(&mut self, fieldname: &str) -> Result<(), Error> {
        if fieldname.is_empty() {
            return Err(Error::InvalidValue("empty field name".into()));
        }
        if self.fieldname.is_some() {
            self.finish_field()?;
        }
        self.fieldname = Some(fieldname.to_string());
        self.seen.clear();
        self.nodes = vec![UncompiledNode::new()];
        self.lastkey.clear();
        self.inserted = false;
        Ok(())
    }

    pub fn finish_field(&mut self) -> Result<(), Error> {
        let fieldname = match self.fieldname.take() {
            Some(name) => name,
            None => {
                return Err(Error::InvalidValue(
                    "finish_field before start_field".into(),
                ))
            }
        };
        if self.inserted {
            let root = self.freeze_root()?;
            self.fieldroots.insert(fieldname, root);
        }
        Ok(())
    }

    pub fn insert(&mut self, key: &[u8], mut value: Option<T::V>) -> Result<(), Error> {
        if self.fieldname.is_none() {
            return Err(Error::InvalidValue(format!(
                "inserted {:?} before starting a field",
                key
            )));
        }
        if key.is_empty() {
            return Err(Error::InvalidValue("can't store a null key".into()));
        }
        let duplicate = key == self.lastkey.as_slice();
        if !self.lastkey.is_empty() && key < self.lastkey.as_slice() {
            return Err(Error::OrderViolation(format!(
                "keys out of order: {:?}..{:?}",
                self.lastkey, key
            )));
        }
        if duplicate && self.merge.is_none() {
            return Err(Error::OrderViolation(format!(
                "duplicate key {:?} without a merge function",
                key
            )));
        }
        if let Some(v) = &value {
            if !T::is_valid(v) {
                return Err(Error::InvalidValue(format!("invalid value {:?}", v)));
            }
        }
        self.inserted = true;

        let prefixlen = self
            .lastkey
            .iter()
            .zip(key.iter())
            .take_while(|(a, b)| a == b)
            .count();

        // The previous key's unshared tail is final now.
        self.freeze_tail(prefixlen + 1)?;

        for &label in &key[prefixlen..] {
            self.nodes.last_mut().unwrap().add_arc(label);
            self.nodes.push(UncompiledNode::new());
        }
        self.nodes.last_mut().unwrap().accept = true;

        // Push value commonalities up through the shared prefix.
        for i in 1..=prefixlen {
            let (left, right) = self.nodes.split_at_mut(i);
            let parent = left.last_mut().unwrap();
            let node = right.first_mut().unwrap();
            let label = key[i - 1];

            let common = match parent.last_value(label).cloned() {
                Some(lastvalue) => {
                    let common = T::common(value.as_ref(), Some(&lastvalue));
                    let suffix = T::subtract(Some(&lastvalue), common.as_ref());
                    parent.set_last_value(label, common.clone());
                    prepend_value::<T>(node, suffix);
                    common
                }
                None => None,
            };
            value = T::subtract(value.as_ref(), common.as_ref());
        }

        if duplicate {
            if let (Some(merge), Some(lastnode)) = (self.merge, self.nodes.last_mut()) {
                lastnode.value = merge(lastnode.value.take(), value);
            }
        } else {
            // The rest of the value rides the first unshared arc.
            self.nodes[prefixlen].set_last_value(key[prefixlen], value);
        }

        self.lastkey.clear();
        self.lastkey.extend_from_slice(key);
        Ok(())
    }

    fn freeze_tail(&mut self, prefixlen: usize) -> Result<(), Error> {
        let downto = prefixlen.max(1);
        while self.nodes.len() > downto {
            let node = self.nodes.pop().unwrap();
            let accept = node.accept || node.arcs.is_empty();
            let acceptval = node.value.clone();
            let address = self.compile_node(node)?;

            let inlabel = self.lastkey[self.nodes.len() - 1];
            self.nodes
                .last_mut()
                .unwrap()
                .replace_last(inlabel, address, accept, acceptval);
        }
        Ok(())
    }

    fn freeze_root(&mut self) -> Result<u64, Error> {
        self.freeze_tail(0)?;
        let root = match self.nodes.pop() {
            Some(root) if !root.arcs.is_empty() => root,
            _ => return Err(Error::Corrupt("empty graph root".into())),
        };
        match self.compile_node(root)? {
            Some(address) => Ok(address),
            None => Err(Error::Corrupt("rootless graph".into())),
        }
    }

    /// Leaves have no address; interior nodes are deduplicated by content.
    fn compile_node(&mut self, node: UncompiledNode<T::V>) -> Result<Option<u64>, Error> {
        if node.arcs.is_empty() {
            if node.accept {
                return Ok(None);
            }
            return Err(Error::Corrupt("dead-end node is not an accept state".into()));
        }
        let digest = self.fingerprint(&node);
        if let Some(&address) = self.seen.get(&digest) {
            return Ok(Some(address));
        }
        let address = self.write_node(&node)?;
        self.seen.insert(digest, address);
        Ok(Some(address))
    }

    fn fingerprint(&self, node: &UncompiledNode<T::V>) -> Vec<u8> {
        let mut digest = Vec::with_capacity(node.arcs.len() * 12);
        digest.push(node.accept as u8);
        for arc in &node.arcs {
            digest.push(arc.label);
            digest.push(arc.accept as u8);
            match arc.target {
                Some(t) => {
                    digest.push(1);
                    digest.extend_from_slice(&t.to_be_bytes());
                }
                None => digest.push(0),
            }
            for v in [&arc.value, &arc.acceptval] {
                match v {
                    Some(v) => {
                        let bytes = T::to_bytes(v);
                        digest.push(1);
                        digest.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                        digest.extend_from_slice(&bytes);
                    }
                    None => digest.push(0),
                }
            }
        }
        digest
    }

    fn write_node(&mut self, node: &UncompiledNode<T::V>) -> Result<u64, Error> {
        self.node_count += 1;
        let numarcs = node.arcs.len();

        let mut buf: Vec<u8> = Vec::new();
        let mut fixedsize: i64 = -1;
        let mut arcstart = 0;
        for (i, arc) in node.arcs.iter().enumerate() {
            self.arc_count += 1;
            let mut flags = 0u8;
            if i == numarcs - 1 {
                flags |= ARC_LAST;
            }
            if arc.accept {
                flags |= ARC_ACCEPT;
            }
            if arc.target.is_none() {
                flags |= ARC_STOP;
            }
            if arc.value.is_some() {
                flags |= ARC_HAS_VAL;
            }
            if arc.acceptval.is_some() {
                flags |= ARC_HAS_ACCEPT_VAL;
            }
            buf.push(flags);
            buf.push(arc.label);
            if let Some(target) = arc.target {
                buf.extend_from_slice(&(target as u32).to_be_bytes());
            }
            if let Some(v) = &arc.value {
                T::write(&mut buf, v)?;
            }
            if let Some(v) = &arc.acceptval {
                T::write(&mut buf, v)?;
            }

            let thissize = (buf.len() - arcstart) as i64;
            arcstart = buf.len();
            if fixedsize == -1 {
                fixedsize = thissize;
            } else if fixedsize > 0 && thissize != fixedsize {
                fixedsize = 0;
            }
        }

        let address = self.file.tell();
        if fixedsize > 0 && numarcs > 1 {
            // A pseudo-arc recording the common size lets readers binary
            // search this node.
            self.file.write_byte(FIXED_SIZE)?;
            self.file.write_u32(fixedsize as u32)?;
            self.file.write_u32(numarcs as u32)?;
        }
        self.file.write_all(&buf)?;
        Ok(address)
    }

    pub fn close(mut self) -> Result<u64, Error> {
        if self.fieldname.is_some() {
            self.finish_field()?;
        }
        let trailer_start = self.file.tell();
        let trailer = serde_json::to_vec(&self.fieldroots)?;
        self.file.write_all(&trailer)?;
        self.file.patch_u64(TRAILER_OFFSET_POS, trailer_start)?;
        debug!(
            "graph closed: {} fields, {} nodes, {} arcs",
            self.fieldroots.len(),
            self.node_count,
            self.arc_count
        );
        self.file.finish()
    }
}

fn prepend_value<T: Values>(node: &mut UncompiledNode<T::V>, prefix: Option<T::V>) {
    if prefix.is_none() {
        return;
    }
    for arc in node.arcs.iter_mut() {
        arc.value = T::add(prefix.as_ref(), arc.value.as_ref());
    }
    if node.accept {
        node.value = T::add(prefix.as_ref(), node.value.as_ref());
    }
}
