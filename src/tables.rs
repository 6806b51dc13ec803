//! Immutable on-disk key/value tables, after D. J. Bernstein's CDB: records
//! appended in insertion order, 256 open-addressed hash tables, and a
//! directory in the trailer. The ordered variants add a position index per
//! key so the term dictionary can answer "smallest key >= k" by binary
//! search, globally or per field.
//!
//! Layout: `"HSH3"` magic, hash selector byte, eight reserved bytes, a
//! `u64` trailer offset patched at close, then `(klen, vlen, key, value)`
//! records. The trailer holds the 256 bucket tables' directory, the JSON
//! extras map, and the extras length as the final four bytes.

use crate::io_helper::{
    open_mmap_file, CountingFileWriter, DataInputStream, InputStream, SliceInputStream, ValueEntry,
};
use crate::numeric::IndexType;
use crate::Error;
use fnv::FnvHashMap as HashMap;
use serde_json::Value as Json;
use std::io::Write;
use std::path::Path;

pub const HASH_MAGIC: &[u8; 4] = b"HSH3";
/// Pickle-era tables; recognized so we can report them, never read.
const LEGACY_MAGIC: &[u8; 4] = b"HASH";

const HEADER_SIZE: usize = 4 + 1 + 8 + 8;
const TRAILER_OFFSET_POS: u64 = 4 + 1 + 8;
const DIR_ENTRY_SIZE: usize = 8 + 4;
const DIRECTORY_SIZE: usize = 256 * DIR_ENTRY_SIZE;
const LENGTHS_SIZE: usize = 4 + 4;
const SLOT_SIZE: usize = 4 + 8;

// Hash selectors. Selector 0 belonged to MD5 in an older format and is
// deliberately left unassigned.
pub const HASH_CRC32: u8 = 1;
pub const HASH_CDB: u8 = 2;

fn cdb_hash(key: &[u8]) -> u32 {
    let mut h: u32 = 5381;
    for b in key {
        h = (h.wrapping_add(h << 5)) ^ (*b as u32);
    }
    h
}

fn crc_hash(key: &[u8]) -> u32 {
    crc32fast::hash(key)
}

/// The selector set is closed; the byte in the file picks from this table.
fn hash_function(selector: u8) -> Result<fn(&[u8]) -> u32, Error> {
    match selector {
        HASH_CRC32 => Ok(crc_hash),
        HASH_CDB => Ok(cdb_hash),
        other => Err(Error::UnsupportedHash(other)),
    }
}

/// Append-only writer for the unordered table. Keys may repeat; lookups
/// will replay duplicates in insertion order.
pub struct HashWriter {
    file: CountingFileWriter,
    hashfn: fn(&[u8]) -> u32,
    buckets: Vec<Vec<(u32, u64)>>,
    directory: Vec<(u64, u32)>,
    pub extras: serde_json::Map<String, Json>,
}

impl HashWriter {
    pub fn create(path: &Path) -> Result<Self, Error> {
        Self::with_hash(path, HASH_CDB)
    }

    pub fn with_hash(path: &Path, selector: u8) -> Result<Self, Error> {
        let hashfn = hash_function(selector)?;
        let mut file = CountingFileWriter::create(path)?;
        file.write_all(HASH_MAGIC)?;
        file.write_byte(selector)?;
        file.write_u64(0)?; // reserved
        file.write_u64(0)?; // trailer offset, patched at close
        Ok(HashWriter {
            file,
            hashfn,
            buckets: (0..256).map(|_| Vec::new()).collect(),
            directory: Vec::new(),
            extras: serde_json::Map::new(),
        })
    }

    pub fn tell(&self) -> u64 {
        self.file.tell()
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let pos = self.file.tell();
        self.file.write_u32(key.len() as u32)?;
        self.file.write_u32(value.len() as u32)?;
        self.file.write_all(key)?;
        self.file.write_all(value)?;

        let h = (self.hashfn)(key);
        self.buckets[(h & 0xff) as usize].push((h, pos));
        Ok(())
    }

    pub fn add_all<'a, I>(&mut self, items: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
    {
        for (key, value) in items {
            self.add(key, value)?;
        }
        Ok(())
    }

    /// Write the 256 bucket hash tables; fills the directory.
    fn write_hashtables(&mut self) -> Result<(), Error> {
        for entries in &self.buckets {
            let pos = self.file.tell();
            let numslots = 2 * entries.len();
            self.directory.push((pos, numslots as u32));

            let mut table: Vec<(u32, u64)> = vec![(0, 0); numslots];
            for &(hashval, position) in entries {
                let mut slot = ((hashval >> 8) as usize) % numslots;
                while table[slot] != (0, 0) {
                    slot = (slot + 1) % numslots;
                }
                table[slot] = (hashval, position);
            }
            for (hashval, position) in table {
                self.file.write_u32(hashval)?;
                self.file.write_u64(position)?;
            }
        }
        Ok(())
    }

    /// Directory, extras, extras length; patches the header pointer.
    fn write_trailer(mut self) -> Result<u64, Error> {
        let directory_start = self.file.tell();
        for &(position, numslots) in &self.directory {
            self.file.write_u64(position)?;
            self.file.write_u32(numslots)?;
        }
        let extras = serde_json::to_vec(&Json::Object(std::mem::take(&mut self.extras)))?;
        self.file.write_all(&extras)?;
        self.file.write_i32(extras.len() as i32)?;
        self.file.patch_u64(TRAILER_OFFSET_POS, directory_start)?;
        self.file.finish()
    }

    pub fn close(mut self) -> Result<u64, Error> {
        self.write_hashtables()?;
        self.write_trailer()
    }
}

/// One record's parsed offsets within the table file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordRange {
    pub keypos: usize,
    pub keylen: usize,
    pub datapos: usize,
    pub datalen: usize,
}

pub struct HashReader {
    data: ValueEntry,
    hashfn: fn(&[u8]) -> u32,
    startofdata: usize,
    endofdata: usize,
    tables: Vec<(u64, u32)>,
    pub extras: serde_json::Map<String, Json>,
}

impl HashReader {
    pub fn open(path: &Path) -> Result<HashReader, Error> {
        let mmap = open_mmap_file(path)?;
        Self::from_entry(ValueEntry::whole_file(mmap))
    }

    pub fn from_entry(data: ValueEntry) -> Result<HashReader, Error> {
        let bytes = data.as_bytes();
        if bytes.len() < HEADER_SIZE + DIRECTORY_SIZE + 4 {
            return Err(Error::Corrupt("hash file too short".into()));
        }
        let mut header = SliceInputStream::new(bytes);
        let magic: [u8; 4] = [bytes[0], bytes[1], bytes[2], bytes[3]];
        header.advance(4)?;
        if &magic == LEGACY_MAGIC {
            return Err(Error::UnsupportedVersion(
                "legacy HASH tables are no longer readable".into(),
            ));
        }
        if &magic != HASH_MAGIC {
            return Err(Error::BadMagic(magic));
        }
        let selector = header.get()?;
        let hashfn = hash_function(selector)?;
        let _reserved = header.read_u64()?;
        let directory_start = header.read_u64()? as usize;
        let startofdata = header.tell();

        if directory_start + DIRECTORY_SIZE > bytes.len() {
            return Err(Error::Corrupt("hash directory out of bounds".into()));
        }
        let mut dir = SliceInputStream::new(&bytes[directory_start..]);
        let mut tables = Vec::with_capacity(256);
        for _ in 0..256 {
            let position = dir.read_u64()?;
            let numslots = dir.read_u32()?;
            tables.push((position, numslots));
        }

        let exlen_pos = bytes.len() - 4;
        let mut tail = SliceInputStream::new(&bytes[exlen_pos..]);
        let exlen = tail.read_i32()? as usize;
        if exlen_pos < exlen {
            return Err(Error::Corrupt("extras length out of bounds".into()));
        }
        let extras = match serde_json::from_slice(&bytes[exlen_pos - exlen..exlen_pos])? {
            Json::Object(map) => map,
            _ => return Err(Error::Corrupt("extras is not a map".into())),
        };

        let endofdata = tables[0].0 as usize;
        Ok(HashReader {
            data,
            hashfn,
            startofdata,
            endofdata,
            tables,
            extras,
        })
    }

    fn bytes(&self) -> &[u8] {
        self.data.as_bytes()
    }

    pub fn key_at(&self, pos: usize) -> Result<&[u8], Error> {
        let bytes = self.bytes();
        let mut rdr = SliceInputStream::new(bytes);
        rdr.seek(pos)?;
        let keylen = rdr.read_u32()? as usize;
        let _datalen = rdr.read_u32()?;
        rdr.read_bytes(keylen)
    }

    pub fn record_at(&self, pos: usize) -> Result<Option<RecordRange>, Error> {
        if pos >= self.endofdata {
            return Ok(None);
        }
        let mut rdr = SliceInputStream::new(self.bytes());
        rdr.seek(pos)?;
        let keylen = rdr.read_u32()? as usize;
        let datalen = rdr.read_u32()? as usize;
        let keypos = pos + LENGTHS_SIZE;
        Ok(Some(RecordRange {
            keypos,
            keylen,
            datapos: keypos + keylen,
            datalen,
        }))
    }

    pub(crate) fn get_range(&self, pos: usize, len: usize) -> &[u8] {
        &self.bytes()[pos..pos + len]
    }

    /// All records in file order, from `pos` (or the start) to `eod`.
    pub fn ranges(&self, pos: Option<usize>, eod: Option<usize>) -> RangeIter<'_> {
        RangeIter {
            reader: self,
            pos: pos.unwrap_or(self.startofdata),
            eod: eod.unwrap_or(self.endofdata),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<(&[u8], &[u8]), Error>> {
        self.ranges(None, None).map(move |r| {
            let r = r?;
            Ok((
                self.get_range(r.keypos, r.keylen),
                self.get_range(r.datapos, r.datalen),
            ))
        })
    }

    /// `(datapos, datalen)` for every record matching the key, in insertion
    /// order. Missing keys are an empty result, not an error.
    pub fn ranges_for_key(&self, key: &[u8]) -> Result<Vec<(usize, usize)>, Error> {
        let keyhash = (self.hashfn)(key);
        let (tablestart, numslots) = self.tables[(keyhash & 0xff) as usize];
        let mut found = Vec::new();
        if numslots == 0 {
            return Ok(found);
        }
        let tablestart = tablestart as usize;
        let numslots = numslots as usize;

        let bytes = self.bytes();
        let mut slotpos = tablestart + ((keyhash >> 8) as usize % numslots) * SLOT_SIZE;
        for _ in 0..numslots {
            let mut slot = SliceInputStream::new(&bytes[slotpos..slotpos + SLOT_SIZE]);
            let slothash = slot.read_u32()?;
            let itempos = slot.read_u64()? as usize;
            if itempos == 0 {
                // Empty slot ends the probe chain.
                return Ok(found);
            }
            if slothash == keyhash {
                let mut rec = SliceInputStream::new(bytes);
                rec.seek(itempos)?;
                let keylen = rec.read_u32()? as usize;
                let datalen = rec.read_u32()? as usize;
                if keylen == key.len() {
                    let keystart = itempos + LENGTHS_SIZE;
                    if key == &bytes[keystart..keystart + keylen] {
                        found.push((keystart + keylen, datalen));
                    }
                }
            }
            slotpos += SLOT_SIZE;
            if slotpos == tablestart + numslots * SLOT_SIZE {
                slotpos = tablestart;
            }
        }
        Ok(found)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<&[u8]>, Error> {
        Ok(self
            .ranges_for_key(key)?
            .first()
            .map(|&(pos, len)| self.get_range(pos, len)))
    }

    pub fn all(&self, key: &[u8]) -> Result<Vec<&[u8]>, Error> {
        Ok(self
            .ranges_for_key(key)?
            .into_iter()
            .map(|(pos, len)| self.get_range(pos, len))
            .collect())
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool, Error> {
        Ok(!self.ranges_for_key(key)?.is_empty())
    }
}

pub struct RangeIter<'r> {
    reader: &'r HashReader,
    pos: usize,
    eod: usize,
}

impl<'r> Iterator for RangeIter<'r> {
    type Item = Result<RecordRange, Error>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.eod {
            return None;
        }
        match self.reader.record_at(self.pos) {
            Ok(Some(range)) => {
                self.pos = range.datapos + range.datalen;
                Some(Ok(range))
            }
            Ok(None) => None,
            Err(e) => {
                self.pos = self.eod;
                Some(Err(e))
            }
        }
    }
}

// Ordered variant: every key's record offset is kept in an index array so
// we can binary search for the closest key.

pub struct OrderedHashWriter {
    inner: HashWriter,
    index: Vec<u64>,
    lastkey: Vec<u8>,
}

impl OrderedHashWriter {
    pub fn create(path: &Path) -> Result<Self, Error> {
        Ok(OrderedHashWriter {
            inner: HashWriter::create(path)?,
            index: Vec::new(),
            lastkey: Vec::new(),
        })
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        if !self.lastkey.is_empty() && key <= self.lastkey.as_slice() {
            return Err(Error::OrderViolation(format!(
                "keys must increase: {:?}..{:?}",
                self.lastkey, key
            )));
        }
        self.index.push(self.inner.tell());
        self.inner.add(key, value)?;
        self.lastkey.clear();
        self.lastkey.extend_from_slice(key);
        Ok(())
    }

    pub fn close(mut self) -> Result<u64, Error> {
        self.inner.write_hashtables()?;

        let indexpos = self.inner.tell();
        let typecode = IndexType::for_max(self.index.last().copied().unwrap_or(0));
        for &pos in &self.index {
            typecode.write(pos, &mut self.inner.file)?;
        }
        self.inner
            .extras
            .insert("indexpos".into(), Json::from(indexpos));
        self.inner
            .extras
            .insert("indexlen".into(), Json::from(self.index.len()));
        self.inner
            .extras
            .insert("indextype".into(), serde_json::to_value(typecode)?);
        self.inner.write_trailer()
    }
}

pub struct OrderedHashReader {
    pub inner: HashReader,
    indexpos: usize,
    indexlen: usize,
    indextype: IndexType,
}

impl OrderedHashReader {
    pub fn open(path: &Path) -> Result<Self, Error> {
        Self::wrap(HashReader::open(path)?)
    }

    pub fn wrap(inner: HashReader) -> Result<Self, Error> {
        let indexpos = inner
            .extras
            .get("indexpos")
            .and_then(Json::as_u64)
            .ok_or_else(|| Error::Corrupt("missing indexpos".into()))? as usize;
        let indexlen = inner
            .extras
            .get("indexlen")
            .and_then(Json::as_u64)
            .ok_or_else(|| Error::Corrupt("missing indexlen".into()))? as usize;
        let indextype: IndexType = serde_json::from_value(
            inner
                .extras
                .get("indextype")
                .cloned()
                .ok_or_else(|| Error::Corrupt("missing indextype".into()))?,
        )?;
        Ok(OrderedHashReader {
            inner,
            indexpos,
            indexlen,
            indextype,
        })
    }

    fn index_entry(&self, i: usize) -> Result<usize, Error> {
        let width = self.indextype.width();
        let at = self.indexpos + i * width;
        let mut rdr = SliceInputStream::new(&self.inner.bytes()[at..at + width]);
        Ok(self.indextype.read(&mut rdr)? as usize)
    }

    /// Record position of `key`, or of the next greater key.
    pub fn closest_key_pos(&self, key: &[u8]) -> Result<Option<usize>, Error> {
        let mut lo = 0;
        let mut hi = self.indexlen;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let midkey = self.inner.key_at(self.index_entry(mid)?)?;
            if midkey < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == self.indexlen {
            return Ok(None);
        }
        Ok(Some(self.index_entry(lo)?))
    }

    pub fn closest_key(&self, key: &[u8]) -> Result<Option<&[u8]>, Error> {
        Ok(match self.closest_key_pos(key)? {
            None => None,
            Some(pos) => Some(self.inner.key_at(pos)?),
        })
    }

    pub fn ranges_from(&self, key: &[u8]) -> Result<RangeIter<'_>, Error> {
        let pos = self.closest_key_pos(key)?;
        Ok(match pos {
            Some(pos) => self.inner.ranges(Some(pos), None),
            // An empty iterator: start == end.
            None => self.inner.ranges(Some(0), Some(0)),
        })
    }

    pub fn keys_from<'r>(
        &'r self,
        key: &[u8],
    ) -> Result<impl Iterator<Item = Result<&'r [u8], Error>>, Error> {
        let inner = &self.inner;
        Ok(self
            .ranges_from(key)?
            .map(move |r| r.map(|r| inner.get_range(r.keypos, r.keylen))))
    }

    pub fn items_from<'r>(
        &'r self,
        key: &[u8],
    ) -> Result<impl Iterator<Item = Result<(&'r [u8], &'r [u8]), Error>>, Error> {
        let inner = &self.inner;
        Ok(self.ranges_from(key)?.map(move |r| {
            r.map(|r| {
                (
                    inner.get_range(r.keypos, r.keylen),
                    inner.get_range(r.datapos, r.datalen),
                )
            })
        }))
    }
}

// Fielded variant: the term dictionary. The ordering contract and the
// position index hold independently within each field's region.

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FieldRegion {
    start: u64,
    indexpos: u64,
    indexlen: u64,
    indextype: IndexType,
}

pub struct FieldedOrderedHashWriter {
    inner: HashWriter,
    fieldmap: HashMap<String, FieldRegion>,
    fieldstart: u64,
    fieldname: Option<String>,
    poses: Vec<u64>,
    lastkey: Vec<u8>,
}

impl FieldedOrderedHashWriter {
    pub fn create(path: &Path) -> Result<Self, Error> {
        Ok(FieldedOrderedHashWriter {
            inner: HashWriter::create(path)?,
            fieldmap: HashMap::default(),
            fieldstart: 0,
            fieldname: None,
            poses: Vec::new(),
            lastkey: Vec::new(),
        })
    }

    pub fn start_field(&mut self, fieldname: &str) -> Result<(), Error> {
        if self.fieldname.is_some() {
            self.end_field()?;
        }
        self.fieldstart = self.inner.tell();
        self.fieldname = Some(fieldname.to_string());
        self.poses.clear();
        self.lastkey.clear();
        Ok(())
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        debug_assert!(self.fieldname.is_some());
        if !self.lastkey.is_empty() && key <= self.lastkey.as_slice() {
            return Err(Error::OrderViolation(format!(
                "keys must increase: {:?}..{:?}",
                self.lastkey, key
            )));
        }
        self.poses.push(self.inner.tell() - self.fieldstart);
        self.inner.add(key, value)?;
        self.lastkey.clear();
        self.lastkey.extend_from_slice(key);
        Ok(())
    }

    /// Extra metadata carried in the trailer next to the field map.
    pub fn inner_extras(&mut self) -> &mut serde_json::Map<String, Json> {
        &mut self.inner.extras
    }

    /// Writes the field's position index inline, after its records.
    pub fn end_field(&mut self) -> Result<(), Error> {
        let fieldname = match self.fieldname.take() {
            Some(name) => name,
            None => return Ok(()),
        };
        let indexpos = self.inner.tell();
        let typecode = IndexType::for_max(self.poses.last().copied().unwrap_or(0));
        for &pos in &self.poses {
            typecode.write(pos, &mut self.inner.file)?;
        }
        self.fieldmap.insert(
            fieldname,
            FieldRegion {
                start: self.fieldstart,
                indexpos,
                indexlen: self.poses.len() as u64,
                indextype: typecode,
            },
        );
        self.poses.clear();
        Ok(())
    }

    pub fn close(mut self) -> Result<u64, Error> {
        self.end_field()?;
        self.inner.write_hashtables()?;
        self.inner
            .extras
            .insert("fieldmap".into(), serde_json::to_value(&self.fieldmap)?);
        self.inner.write_trailer()
    }
}

pub struct FieldedOrderedHashReader {
    pub inner: HashReader,
    fieldmap: HashMap<String, FieldRegion>,
    /// Field names with their (start, indexpos) spans, sorted by start.
    fieldlist: Vec<(String, u64, u64)>,
}

impl FieldedOrderedHashReader {
    pub fn open(path: &Path) -> Result<Self, Error> {
        Self::wrap(HashReader::open(path)?)
    }

    pub fn wrap(inner: HashReader) -> Result<Self, Error> {
        let fieldmap: HashMap<String, FieldRegion> = serde_json::from_value(
            inner
                .extras
                .get("fieldmap")
                .cloned()
                .ok_or_else(|| Error::Corrupt("missing fieldmap".into()))?,
        )?;
        let mut fieldlist: Vec<(String, u64, u64)> = fieldmap
            .iter()
            .map(|(name, region)| (name.clone(), region.start, region.indexpos))
            .collect();
        fieldlist.sort_by_key(|&(_, start, _)| start);
        Ok(FieldedOrderedHashReader {
            inner,
            fieldmap,
            fieldlist,
        })
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fieldlist.iter().map(|(name, _, _)| name.as_str())
    }

    pub fn has_field(&self, fieldname: &str) -> bool {
        self.fieldmap.contains_key(fieldname)
    }

    pub fn field_start(&self, fieldname: &str) -> Option<u64> {
        self.fieldmap.get(fieldname).map(|r| r.start)
    }

    /// The field's `(start, end)` record span; the end is where its
    /// position index begins.
    pub fn field_region(&self, fieldname: &str) -> Option<(u64, u64)> {
        self.fieldmap.get(fieldname).map(|r| (r.start, r.indexpos))
    }

    fn region(&self, fieldname: &str) -> Result<&FieldRegion, Error> {
        self.fieldmap
            .get(fieldname)
            .ok_or_else(|| Error::Corrupt(format!("no such field {:?}", fieldname)))
    }

    /// Walk `(fieldname, record)` pairs across all fields, skipping the
    /// inline index arrays between field regions.
    pub fn fielded_ranges(&self) -> impl Iterator<Item = Result<(&str, RecordRange), Error>> {
        let reader = &self.inner;
        self.fieldlist.iter().flat_map(move |(name, start, end)| {
            reader
                .ranges(Some(*start as usize), Some(*end as usize))
                .map(move |r| r.map(|r| (name.as_str(), r)))
        })
    }

    pub fn iter_terms(&self) -> impl Iterator<Item = Result<(&str, &[u8]), Error>> {
        let reader = &self.inner;
        self.fielded_ranges()
            .map(move |r| r.map(|(name, r)| (name, reader.get_range(r.keypos, r.keylen))))
    }

    pub fn iter_term_items(&self) -> impl Iterator<Item = Result<(&str, &[u8], &[u8]), Error>> {
        let reader = &self.inner;
        self.fielded_ranges().map(move |r| {
            r.map(|(name, r)| {
                (
                    name,
                    reader.get_range(r.keypos, r.keylen),
                    reader.get_range(r.datapos, r.datalen),
                )
            })
        })
    }

    /// The first match whose record lies inside the field's region.
    pub fn range_for_term(
        &self,
        fieldname: &str,
        key: &[u8],
    ) -> Result<Option<(usize, usize)>, Error> {
        let region = self.region(fieldname)?;
        for (datapos, datalen) in self.inner.ranges_for_key(key)? {
            if region.start < datapos as u64 && (datapos as u64) < region.indexpos {
                return Ok(Some((datapos, datalen)));
            }
        }
        Ok(None)
    }

    pub fn term_get(&self, fieldname: &str, key: &[u8]) -> Result<Option<&[u8]>, Error> {
        Ok(self
            .range_for_term(fieldname, key)?
            .map(|(pos, len)| self.inner.get_range(pos, len)))
    }

    pub fn contains_term(&self, fieldname: &str, key: &[u8]) -> Result<bool, Error> {
        Ok(self.range_for_term(fieldname, key)?.is_some())
    }

    fn index_entry(&self, region: &FieldRegion, i: usize) -> Result<usize, Error> {
        let width = region.indextype.width();
        let at = region.indexpos as usize + i * width;
        let mut rdr = SliceInputStream::new(&self.inner.bytes()[at..at + width]);
        Ok(region.start as usize + region.indextype.read(&mut rdr)? as usize)
    }

    pub fn closest_term_pos(&self, fieldname: &str, key: &[u8]) -> Result<Option<usize>, Error> {
        let region = self.region(fieldname)?;
        let mut lo = 0;
        let mut hi = region.indexlen as usize;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let midkey = self.inner.key_at(self.index_entry(region, mid)?)?;
            if midkey < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == region.indexlen as usize {
            return Ok(None);
        }
        Ok(Some(self.index_entry(region, lo)?))
    }

    pub fn closest_term(&self, fieldname: &str, key: &[u8]) -> Result<Option<&[u8]>, Error> {
        Ok(match self.closest_term_pos(fieldname, key)? {
            None => None,
            Some(pos) => Some(self.inner.key_at(pos)?),
        })
    }

    pub fn term_ranges_from(&self, fieldname: &str, key: &[u8]) -> Result<RangeIter<'_>, Error> {
        let region = self.region(fieldname)?;
        Ok(match self.closest_term_pos(fieldname, key)? {
            Some(pos) => self.inner.ranges(Some(pos), Some(region.indexpos as usize)),
            None => self.inner.ranges(Some(0), Some(0)),
        })
    }

    pub fn terms_from<'r>(
        &'r self,
        fieldname: &str,
        key: &[u8],
    ) -> Result<impl Iterator<Item = Result<&'r [u8], Error>>, Error> {
        let inner = &self.inner;
        Ok(self
            .term_ranges_from(fieldname, key)?
            .map(move |r| r.map(|r| inner.get_range(r.keypos, r.keylen))))
    }

    pub fn term_items_from<'r>(
        &'r self,
        fieldname: &str,
        key: &[u8],
    ) -> Result<impl Iterator<Item = Result<(&'r [u8], &'r [u8]), Error>>, Error> {
        let inner = &self.inner;
        Ok(self.term_ranges_from(fieldname, key)?.map(move |r| {
            r.map(|r| {
                (
                    inner.get_range(r.keypos, r.keylen),
                    inner.get_range(r.datapos, r.datalen),
                )
            })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn hash_round_trip_with_duplicates() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("t.hsh");
        {
            let mut w = HashWriter::create(&path).unwrap();
            w.add(b"alpha", b"1").unwrap();
            w.add(b"beta", b"2").unwrap();
            w.add(b"alpha", b"3").unwrap();
            w.add(b"gamma", b"4").unwrap();
            w.close().unwrap();
        }
        let r = HashReader::open(&path).unwrap();
        assert_eq!(Some(&b"1"[..]), r.get(b"alpha").unwrap());
        // Lookup order equals insertion order.
        assert_eq!(vec![&b"1"[..], &b"3"[..]], r.all(b"alpha").unwrap());
        assert_eq!(Some(&b"2"[..]), r.get(b"beta").unwrap());
        assert!(r.contains(b"gamma").unwrap());
        assert!(!r.contains(b"delta").unwrap());
        assert_eq!(None, r.get(b"delta").unwrap());

        let items: Vec<(Vec<u8>, Vec<u8>)> = r
            .iter()
            .map(|kv| kv.map(|(k, v)| (k.to_vec(), v.to_vec())))
            .collect::<Result<_, Error>>()
            .unwrap();
        assert_eq!(4, items.len());
        assert_eq!((b"alpha".to_vec(), b"1".to_vec()), items[0]);
        assert_eq!((b"gamma".to_vec(), b"4".to_vec()), items[3]);
    }

    #[test]
    fn hash_many_keys_crc() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("many.hsh");
        {
            let mut w = HashWriter::with_hash(&path, HASH_CRC32).unwrap();
            for i in 0u32..2000 {
                let key = format!("key{:05}", i);
                let value = format!("{:x}", i * 7);
                w.add(key.as_bytes(), value.as_bytes()).unwrap();
            }
            w.close().unwrap();
        }
        let r = HashReader::open(&path).unwrap();
        for i in (0u32..2000).step_by(37) {
            let key = format!("key{:05}", i);
            let expected = format!("{:x}", i * 7);
            assert_eq!(Some(expected.as_bytes()), r.get(key.as_bytes()).unwrap());
        }
    }

    #[test]
    fn unsupported_hash_selector_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.hsh");
        match HashWriter::with_hash(&path, 0) {
            Err(Error::UnsupportedHash(0)) => {}
            other => panic!("expected UnsupportedHash, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn ordered_hash_binary_search() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ord.hsh");
        {
            let mut w = OrderedHashWriter::create(&path).unwrap();
            w.add(b"a", b"1").unwrap();
            w.add(b"c", b"2").unwrap();
            w.add(b"e", b"3").unwrap();
            w.close().unwrap();
        }
        let r = OrderedHashReader::open(&path).unwrap();
        assert_eq!(Some(&b"c"[..]), r.closest_key(b"b").unwrap());
        assert_eq!(Some(&b"a"[..]), r.closest_key(b"a").unwrap());
        assert_eq!(None, r.closest_key(b"f").unwrap());

        let keys: Vec<Vec<u8>> = r
            .keys_from(b"b")
            .unwrap()
            .map(|k| k.map(|k| k.to_vec()))
            .collect::<Result<_, Error>>()
            .unwrap();
        assert_eq!(vec![b"c".to_vec(), b"e".to_vec()], keys);

        let items: Vec<(Vec<u8>, Vec<u8>)> = r
            .items_from(b"d")
            .unwrap()
            .map(|kv| kv.map(|(k, v)| (k.to_vec(), v.to_vec())))
            .collect::<Result<_, Error>>()
            .unwrap();
        assert_eq!(vec![(b"e".to_vec(), b"3".to_vec())], items);
    }

    #[test]
    fn ordered_hash_rejects_unordered_keys() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad-order.hsh");
        let mut w = OrderedHashWriter::create(&path).unwrap();
        w.add(b"m", b"1").unwrap();
        match w.add(b"a", b"2") {
            Err(Error::OrderViolation(_)) => {}
            other => panic!("expected OrderViolation, got {:?}", other),
        }
        // Equal keys are rejected too.
        match w.add(b"m", b"3") {
            Err(Error::OrderViolation(_)) => {}
            other => panic!("expected OrderViolation, got {:?}", other),
        }
    }

    #[test]
    fn fielded_ordered_hash() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("fielded.hsh");
        {
            let mut w = FieldedOrderedHashWriter::create(&path).unwrap();
            w.start_field("body").unwrap();
            w.add(b"apple", b"b1").unwrap();
            w.add(b"cherry", b"b2").unwrap();
            w.start_field("title").unwrap();
            // Per-field ordering restarts; "apple" again is fine.
            w.add(b"apple", b"t1").unwrap();
            w.add(b"banana", b"t2").unwrap();
            w.close().unwrap();
        }
        let r = FieldedOrderedHashReader::open(&path).unwrap();
        assert!(r.has_field("body"));
        assert!(r.has_field("title"));
        assert!(!r.has_field("tags"));

        assert_eq!(Some(&b"b1"[..]), r.term_get("body", b"apple").unwrap());
        assert_eq!(Some(&b"t1"[..]), r.term_get("title", b"apple").unwrap());
        assert_eq!(None, r.term_get("title", b"cherry").unwrap());

        assert_eq!(
            Some(&b"cherry"[..]),
            r.closest_term("body", b"banana").unwrap()
        );
        assert_eq!(
            Some(&b"banana"[..]),
            r.closest_term("title", b"banana").unwrap()
        );
        assert_eq!(None, r.closest_term("body", b"zebra").unwrap());

        let title_terms: Vec<Vec<u8>> = r
            .terms_from("title", b"")
            .unwrap()
            .map(|t| t.map(|t| t.to_vec()))
            .collect::<Result<_, Error>>()
            .unwrap();
        assert_eq!(vec![b"apple".to_vec(), b"banana".to_vec()], title_terms);

        let all: Vec<(String, Vec<u8>)> = r
            .iter_terms()
            .map(|t| t.map(|(f, t)| (f.to_string(), t.to_vec())))
            .collect::<Result<_, Error>>()
            .unwrap();
        assert_eq!(4, all.len());
        assert_eq!(("body".to_string(), b"apple".to_vec()), all[0]);
        assert_eq!(("title".to_string(), b"banana".to_vec()), all[3]);
    }
}
