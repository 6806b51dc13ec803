//! Segments: the immutable unit of index storage. A segment is a set of
//! files sharing an id: the term index (`.trm`, a fielded ordered
//! hash), the posting file (`.pst`), the vector posting file (`.vps`),
//! and one `.col` file per column, plus in-memory bookkeeping for the
//! deleted-docs set and per-field length totals. Writers run once and
//! close; afterward any number of readers may share the files.

use crate::columns::{FixedColumnReader, FixedColumnWriter, VarColumnReader, VarColumnWriter};
use crate::compound::{write_compound, CompoundReader, COMPOUND_EXT};
use crate::fsa::{levenshtein_automaton, FuzzyMatches};
use crate::io_helper::{open_mmap_file, CountingFileWriter, ValueEntry};
use crate::numeric::{byte_to_length, length_to_byte};
use crate::postings::{
    BlockMatcher, BlockScorer, InlineMatcher, Matcher, PostFormat, PostingsWriter, VectorMatcher,
};
use crate::tables::{FieldedOrderedHashReader, FieldedOrderedHashWriter};
use crate::terminfo::TermInfo;
use crate::{DocId, Error, SPELL_DOC};
use fnv::FnvHashMap as HashMap;
use log::debug;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

pub const TERMS_EXT: &str = "trm";
pub const POSTS_EXT: &str = "pst";
pub const VPOSTS_EXT: &str = "vps";
pub const COLUMN_EXT: &str = "col";

pub const STORED_COLUMN: &str = "_stored";

fn len_column(fieldname: &str) -> String {
    format!("_{}_len", fieldname)
}

fn vec_column(fieldname: &str) -> String {
    format!("_{}_vec", fieldname)
}

fn vec_len_column(fieldname: &str) -> String {
    format!("_{}_vecL", fieldname)
}

static SEGMENT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Shared metadata for one segment. The files are immutable once the
/// writers close; only the deleted set may grow afterward.
#[derive(Debug, Clone)]
pub struct Segment {
    pub id: String,
    pub doc_count: u32,
    pub field_lengths: HashMap<String, u64>,
    deleted: BTreeSet<DocId>,
}

impl Segment {
    pub fn new(indexname: &str) -> Segment {
        let n = SEGMENT_COUNTER.fetch_add(1, Ordering::Relaxed);
        Segment {
            id: format!("{}_{:06x}", indexname, n),
            doc_count: 0,
            field_lengths: HashMap::default(),
            deleted: BTreeSet::new(),
        }
    }

    pub fn file_name(&self, ext: &str) -> String {
        format!("{}.{}", self.id, ext)
    }

    pub fn column_file_name(&self, colname: &str) -> String {
        format!("{}.{}.{}", self.id, colname, COLUMN_EXT)
    }

    pub fn field_length(&self, fieldname: &str) -> u64 {
        self.field_lengths.get(fieldname).copied().unwrap_or(0)
    }

    pub fn doc_count_all(&self) -> u32 {
        self.doc_count
    }

    /// Live documents.
    pub fn live_doc_count(&self) -> u32 {
        self.doc_count - self.deleted.len() as u32
    }

    pub fn delete_document(&mut self, docnum: DocId) {
        self.deleted.insert(docnum);
    }

    pub fn is_deleted(&self, docnum: DocId) -> bool {
        self.deleted.contains(&docnum)
    }

    pub fn has_deletions(&self) -> bool {
        !self.deleted.is_empty()
    }

    pub fn deleted_docs(&self) -> impl Iterator<Item = DocId> + '_ {
        self.deleted.iter().copied()
    }

    /// Delta-coded snapshot of the deleted set.
    pub fn deleted_snapshot(&self) -> Vec<u8> {
        let mut deltas: Vec<u32> = Vec::with_capacity(self.deleted.len());
        let mut prev = 0;
        for &doc in &self.deleted {
            deltas.push(doc - prev);
            prev = doc;
        }
        let mut buffer = vec![0u8; 5 * deltas.len().max(1)];
        let used = stream_vbyte::encode::<stream_vbyte::Scalar>(&deltas, &mut buffer);
        buffer.truncate(used);

        let mut out = Vec::with_capacity(4 + buffer.len());
        out.extend_from_slice(&(deltas.len() as u32).to_be_bytes());
        out.extend_from_slice(&buffer);
        out
    }

    pub fn restore_deleted(&mut self, snapshot: &[u8]) -> Result<(), Error> {
        if snapshot.len() < 4 {
            return Err(Error::Corrupt("deleted snapshot too short".into()));
        }
        let count = u32::from_be_bytes([snapshot[0], snapshot[1], snapshot[2], snapshot[3]]) as usize;
        let mut deltas = vec![0u32; count];
        stream_vbyte::decode::<stream_vbyte::Scalar>(&snapshot[4..], count, &mut deltas);
        let mut prev = 0;
        for delta in deltas {
            prev += delta;
            self.deleted.insert(prev);
        }
        Ok(())
    }

    /// Every loose file belonging to this segment, in name order.
    pub fn loose_files(&self, dir: &Path) -> Result<Vec<String>, Error> {
        let prefix = format!("{}.", self.id);
        let compound = self.file_name(COMPOUND_EXT);
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(&prefix) && name != compound {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Pack the segment's loose files into a single `.seg` file and
    /// remove them. Read-side opens the result transparently.
    pub fn into_compound(&self, dir: &Path) -> Result<(), Error> {
        let names = self.loose_files(dir)?;
        let target = dir.join(self.file_name(COMPOUND_EXT));
        write_compound(dir, &names, &target)?;
        for name in &names {
            std::fs::remove_file(dir.join(name))?;
        }
        debug!("segment {} compacted into {:?}", self.id, target);
        Ok(())
    }
}

/// Resolves a segment's member files whether they are loose on disk or
/// packed in a compound file.
pub struct SegmentFiles {
    dir: PathBuf,
    compound: Option<CompoundReader>,
}

impl SegmentFiles {
    pub fn open(dir: &Path, segment: &Segment) -> Result<SegmentFiles, Error> {
        let compound_path = dir.join(segment.file_name(COMPOUND_EXT));
        let compound = if compound_path.is_file() {
            Some(CompoundReader::open(&compound_path)?)
        } else {
            None
        };
        Ok(SegmentFiles {
            dir: dir.to_path_buf(),
            compound,
        })
    }

    pub fn entry(&self, name: &str) -> Result<Option<ValueEntry>, Error> {
        if let Some(compound) = &self.compound {
            return Ok(compound.member(name));
        }
        let path = self.dir.join(name);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(ValueEntry::whole_file(open_mmap_file(&path)?)))
    }

    fn required(&self, name: &str) -> Result<ValueEntry, Error> {
        self.entry(name)?
            .ok_or_else(|| Error::Corrupt(format!("missing segment file {:?}", name)))
    }
}

/// Codec configuration and factory for the segment writers and readers.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    pub blocklimit: usize,
    pub compression: u32,
    pub inlinelimit: usize,
}

impl Default for Codec {
    fn default() -> Codec {
        Codec {
            blocklimit: crate::postings::DEFAULT_BLOCK_LIMIT,
            compression: crate::postings::DEFAULT_COMPRESSION,
            inlinelimit: crate::postings::DEFAULT_INLINE_LIMIT,
        }
    }
}

impl Codec {
    pub fn new_segment(&self, indexname: &str) -> Segment {
        Segment::new(indexname)
    }

    pub fn per_document_writer(&self, dir: &Path, segment: &Segment) -> Result<PerDocWriter, Error> {
        PerDocWriter::open(dir, segment)
    }

    pub fn field_writer(&self, dir: &Path, segment: &Segment) -> Result<FieldWriter, Error> {
        FieldWriter::open(*self, dir, segment)
    }

    pub fn postings_writer(&self, format: PostFormat) -> PostingsWriter {
        PostingsWriter::with_limits(format, self.blocklimit, self.compression, self.inlinelimit)
    }

    /// Materialize a matcher for a TermInfo against the posting file.
    pub fn postings_reader(
        &self,
        postfile: ValueEntry,
        terminfo: TermInfo,
        format: PostFormat,
        scorer: Option<Box<dyn BlockScorer>>,
    ) -> Result<Matcher, Error> {
        matcher_for(postfile, terminfo, format, scorer)
    }

    pub fn terms_reader(&self, dir: &Path, segment: &Segment) -> Result<TermsReader, Error> {
        TermsReader::open(dir, segment)
    }

    pub fn per_document_reader(&self, dir: &Path, segment: &Segment) -> Result<PerDocReader, Error> {
        PerDocReader::open(dir, segment)
    }
}

/// Inline postings become an in-memory matcher; extents a lazy block
/// reader over the posting file.
fn matcher_for(
    postfile: ValueEntry,
    terminfo: TermInfo,
    format: PostFormat,
    scorer: Option<Box<dyn BlockScorer>>,
) -> Result<Matcher, Error> {
    let min_length = terminfo.min_length.unwrap_or(0);
    if let Some((offset, length)) = terminfo.extent() {
        return Ok(Matcher::Block(BlockMatcher::new(
            postfile, offset, length, format, scorer,
        )?));
    }
    match terminfo.into_inlined() {
        Some((ids, weights, values)) => Ok(Matcher::Inline(InlineMatcher::new(
            ids, weights, values, min_length, scorer,
        ))),
        None => Err(Error::Corrupt(
            "term info has neither extent nor inline postings".into(),
        )),
    }
}

/// Writes stored fields, length bytes, and term vectors for one document
/// at a time. Documents must arrive in ascending order with no reuse.
pub struct PerDocWriter {
    dir: PathBuf,
    segid: String,
    stored: VarColumnWriter,
    fixed_columns: HashMap<String, FixedColumnWriter>,
    vpostfile: Option<CountingFileWriter>,
    field_lengths: HashMap<String, u64>,
    doc_count: u32,
    docnum: DocId,
    stored_fields: serde_json::Map<String, serde_json::Value>,
    in_doc: bool,
    cancelled: u32,
}

impl PerDocWriter {
    fn open(dir: &Path, segment: &Segment) -> Result<PerDocWriter, Error> {
        let stored = VarColumnWriter::create(&dir.join(segment.column_file_name(STORED_COLUMN)))?;
        Ok(PerDocWriter {
            dir: dir.to_path_buf(),
            segid: segment.id.clone(),
            stored,
            fixed_columns: HashMap::default(),
            vpostfile: None,
            field_lengths: HashMap::default(),
            doc_count: 0,
            docnum: 0,
            stored_fields: serde_json::Map::new(),
            in_doc: false,
            cancelled: 0,
        })
    }

    pub fn start_doc(&mut self, docnum: DocId) -> Result<(), Error> {
        if self.in_doc {
            return Err(Error::OrderViolation(
                "start_doc while already in a document".into(),
            ));
        }
        if docnum != self.doc_count {
            return Err(Error::OrderViolation(format!(
                "start_doc({}) but expected {}",
                docnum, self.doc_count
            )));
        }
        self.docnum = docnum;
        self.doc_count += 1;
        self.stored_fields.clear();
        self.in_doc = true;
        Ok(())
    }

    pub fn add_field(
        &mut self,
        fieldname: &str,
        value: Option<serde_json::Value>,
        length: Option<u32>,
    ) -> Result<(), Error> {
        if let Some(value) = value {
            self.stored_fields.insert(fieldname.to_string(), value);
        }
        if let Some(length) = length {
            let colname = len_column(fieldname);
            let docnum = self.docnum;
            self.fixed_column(&colname, 1)?
                .add(docnum, &[length_to_byte(length)])?;
            *self
                .field_lengths
                .entry(fieldname.to_string())
                .or_insert(0) += length as u64;
        }
        Ok(())
    }

    fn fixed_column(
        &mut self,
        colname: &str,
        width: usize,
    ) -> Result<&mut FixedColumnWriter, Error> {
        if !self.fixed_columns.contains_key(colname) {
            let path = self
                .dir
                .join(format!("{}.{}.{}", self.segid, colname, COLUMN_EXT));
            self.fixed_columns
                .insert(colname.to_string(), FixedColumnWriter::create(&path, width)?);
        }
        Ok(self.fixed_columns.get_mut(colname).unwrap())
    }

    /// Write one document's term vector as an independent byte-id posting
    /// run and record its extent in the vector columns.
    pub fn add_vector_items(
        &mut self,
        fieldname: &str,
        format: PostFormat,
        items: &[(Vec<u8>, f32, Vec<u8>)],
    ) -> Result<(), Error> {
        if items.is_empty() {
            return Ok(());
        }
        if self.vpostfile.is_none() {
            let path = self
                .dir
                .join(format!("{}.{}", self.segid, VPOSTS_EXT));
            let mut file = CountingFileWriter::create(&path)?;
            // Offset zero means "no vector"; burn it with a header.
            file.write_all(b"VPST")?;
            self.vpostfile = Some(file);
        }
        let postfile = self.vpostfile.as_mut().unwrap();

        let mut writer = PostingsWriter::new(format).byte_ids();
        writer.start_postings(postfile)?;
        for (term, weight, value) in items {
            writer.add_byte_posting(postfile, term, *weight, value)?;
        }
        let terminfo = writer.finish_postings(postfile)?;
        let (offset, length) = terminfo
            .extent()
            .ok_or_else(|| Error::Corrupt("vector postings were inlined".into()))?;
        debug_assert_ne!(0, offset);

        let docnum = self.docnum;
        self.fixed_column(&vec_column(fieldname), 8)?
            .add(docnum, &offset.to_be_bytes())?;
        self.fixed_column(&vec_len_column(fieldname), 4)?
            .add(docnum, &length.to_be_bytes())?;
        Ok(())
    }

    pub fn finish_doc(&mut self) -> Result<(), Error> {
        if !self.in_doc {
            return Err(Error::OrderViolation("finish_doc outside a document".into()));
        }
        if !self.stored_fields.is_empty() {
            let json = serde_json::to_vec(&self.stored_fields)?;
            let blob = lz4_flex::compress_prepend_size(&json);
            self.stored.add(self.docnum, &blob)?;
            self.stored_fields.clear();
        }
        self.in_doc = false;
        Ok(())
    }

    /// Abandon the current document; its number is reused.
    pub fn cancel_doc(&mut self) {
        if self.in_doc {
            self.doc_count -= 1;
            self.cancelled += 1;
            self.stored_fields.clear();
            self.in_doc = false;
        }
    }

    /// Seal every column and move the totals onto the segment.
    pub fn close(mut self, segment: &mut Segment) -> Result<(), Error> {
        if self.in_doc {
            self.finish_doc()?;
        }
        let doc_count = self.doc_count;
        self.stored.finish(doc_count)?;
        for (_, column) in self.fixed_columns.drain() {
            column.finish(doc_count)?;
        }
        if let Some(file) = self.vpostfile.take() {
            file.finish()?;
        }
        segment.doc_count = doc_count;
        segment.field_lengths = std::mem::take(&mut self.field_lengths);
        debug!(
            "per-doc writer closed: {} docs ({} cancelled)",
            doc_count, self.cancelled
        );
        Ok(())
    }
}

/// One posting event for the field writer: a `(field, term, doc, weight,
/// value)` tuple plus the field length the scorer will want later.
#[derive(Debug, Clone)]
pub struct PostItem {
    pub field: String,
    pub term: Vec<u8>,
    /// [`SPELL_DOC`] marks a dictionary-only entry with no posting.
    pub docnum: i64,
    pub weight: f32,
    pub value: Vec<u8>,
    pub length: Option<u32>,
}

/// Streams sorted postings into the posting file and writes one TermInfo
/// record per term into the term index.
pub struct FieldWriter {
    codec: Codec,
    tindex: FieldedOrderedHashWriter,
    postfile: CountingFileWriter,
    field_ids: HashMap<String, u16>,
    postwriter: Option<PostingsWriter>,
    fieldname: Option<String>,
    fieldid: u16,
    term: Option<Vec<u8>>,
}

impl FieldWriter {
    fn open(codec: Codec, dir: &Path, segment: &Segment) -> Result<FieldWriter, Error> {
        let tindex = FieldedOrderedHashWriter::create(&dir.join(segment.file_name(TERMS_EXT)))?;
        let postfile = CountingFileWriter::create(&dir.join(segment.file_name(POSTS_EXT)))?;
        Ok(FieldWriter {
            codec,
            tindex,
            postfile,
            field_ids: HashMap::default(),
            postwriter: None,
            fieldname: None,
            fieldid: 0,
            term: None,
        })
    }

    pub fn start_field(&mut self, fieldname: &str, format: PostFormat) -> Result<(), Error> {
        if self.fieldname.is_some() {
            self.finish_field()?;
        }
        let next_id = self.field_ids.len() as u16;
        let fieldid = *self
            .field_ids
            .entry(fieldname.to_string())
            .or_insert(next_id);
        self.tindex.start_field(fieldname)?;
        self.fieldname = Some(fieldname.to_string());
        self.fieldid = fieldid;
        self.postwriter = Some(self.codec.postings_writer(format));
        Ok(())
    }

    pub fn start_term(&mut self, term: &[u8]) -> Result<(), Error> {
        let postwriter = self
            .postwriter
            .as_mut()
            .ok_or_else(|| Error::OrderViolation("start_term before start_field".into()))?;
        self.term = Some(term.to_vec());
        postwriter.start_postings(&self.postfile)
    }

    pub fn add(
        &mut self,
        docnum: DocId,
        weight: f32,
        value: &[u8],
        length: Option<u32>,
    ) -> Result<(), Error> {
        let postwriter = self
            .postwriter
            .as_mut()
            .ok_or_else(|| Error::OrderViolation("add before start_term".into()))?;
        postwriter.add_posting(&mut self.postfile, docnum, weight, value, length)
    }

    pub fn finish_term(&mut self) -> Result<(), Error> {
        let postwriter = self
            .postwriter
            .as_mut()
            .ok_or_else(|| Error::OrderViolation("finish_term before start_field".into()))?;
        let term = self
            .term
            .take()
            .ok_or_else(|| Error::OrderViolation("finish_term before start_term".into()))?;
        let terminfo = postwriter.finish_postings(&mut self.postfile)?;

        let mut key = Vec::with_capacity(2 + term.len());
        key.extend_from_slice(&self.fieldid.to_be_bytes());
        key.extend_from_slice(&term);
        self.tindex.add(&key, &terminfo.to_bytes()?)
    }

    pub fn finish_field(&mut self) -> Result<(), Error> {
        if self.fieldname.is_none() {
            return Err(Error::OrderViolation(
                "finish_field before start_field".into(),
            ));
        }
        self.fieldname = None;
        self.postwriter = None;
        self.tindex.end_field()
    }

    /// Drive the writer from a stream of items sorted by (field, term,
    /// docnum). Out-of-order input fails before any partial term is
    /// flushed; spelling-only items are skipped.
    pub fn add_postings<I, F>(&mut self, items: I, format_for: F) -> Result<(), Error>
    where
        I: IntoIterator<Item = PostItem>,
        F: Fn(&str) -> PostFormat,
    {
        let mut last_field: Option<String> = None;
        let mut last_term: Option<Vec<u8>> = None;

        for item in items {
            if let Some(lastfn) = &last_field {
                if &item.field < lastfn {
                    return Err(Error::OrderViolation(format!(
                        "field {:?} after {:?}",
                        item.field, lastfn
                    )));
                }
                if &item.field == lastfn {
                    if let Some(lasttext) = &last_term {
                        if &item.term < lasttext {
                            return Err(Error::OrderViolation(format!(
                                "term {:?}:{:?} after {:?}:{:?}",
                                item.field, item.term, lastfn, lasttext
                            )));
                        }
                    }
                }
            }

            if last_field.as_deref() != Some(item.field.as_str()) {
                if last_term.is_some() {
                    self.finish_term()?;
                    last_term = None;
                }
                if last_field.is_some() {
                    self.finish_field()?;
                }
                self.start_field(&item.field, format_for(&item.field))?;
                last_field = Some(item.field.clone());
            }

            if item.docnum == SPELL_DOC {
                // Dictionary-only update; no posting output.
                continue;
            }
            let docnum = if item.docnum >= 0 && item.docnum <= u32::max_value() as i64 {
                item.docnum as DocId
            } else {
                return Err(Error::InvalidValue(format!(
                    "doc number {} out of range",
                    item.docnum
                )));
            };

            if last_term.as_deref() != Some(item.term.as_slice()) {
                if last_term.is_some() {
                    self.finish_term()?;
                }
                self.start_term(&item.term)?;
                last_term = Some(item.term.clone());
            }
            self.add(docnum, item.weight, &item.value, item.length)?;
        }

        if last_term.is_some() {
            self.finish_term()?;
        }
        if last_field.is_some() {
            self.finish_field()?;
        }
        Ok(())
    }

    pub fn close(mut self) -> Result<(), Error> {
        if self.fieldname.is_some() {
            self.finish_field()?;
        }
        let field_ids: HashMap<String, u16> = std::mem::take(&mut self.field_ids);
        self.tindex.inner_extras().insert(
            "fieldids".into(),
            serde_json::to_value(&field_ids)?,
        );
        self.tindex.close()?;
        self.postfile.finish()?;
        Ok(())
    }
}

/// Read side of the term dictionary: term lookup, ordered iteration, and
/// matcher construction over the posting file.
pub struct TermsReader {
    tindex: FieldedOrderedHashReader,
    postfile: ValueEntry,
    field_ids: HashMap<String, u16>,
}

impl TermsReader {
    pub fn open(dir: &Path, segment: &Segment) -> Result<TermsReader, Error> {
        let files = SegmentFiles::open(dir, segment)?;
        let tindex =
            FieldedOrderedHashReader::wrap(crate::tables::HashReader::from_entry(
                files.required(&segment.file_name(TERMS_EXT))?,
            )?)?;
        let postfile = files.required(&segment.file_name(POSTS_EXT))?;
        let field_ids: HashMap<String, u16> = match tindex.inner.extras.get("fieldids") {
            Some(value) => serde_json::from_value(value.clone())?,
            None => HashMap::default(),
        };
        Ok(TermsReader {
            tindex,
            postfile,
            field_ids,
        })
    }

    pub fn indexed_field_names(&self) -> impl Iterator<Item = &str> {
        self.tindex.field_names()
    }

    fn term_key(&self, fieldname: &str, term: &[u8]) -> Option<Vec<u8>> {
        let id = self.field_ids.get(fieldname)?;
        let mut key = Vec::with_capacity(2 + term.len());
        key.extend_from_slice(&id.to_be_bytes());
        key.extend_from_slice(term);
        Some(key)
    }

    pub fn contains_term(&self, fieldname: &str, term: &[u8]) -> Result<bool, Error> {
        match self.term_key(fieldname, term) {
            Some(key) => self.tindex.contains_term(fieldname, &key),
            None => Ok(false),
        }
    }

    pub fn term_info(&self, fieldname: &str, term: &[u8]) -> Result<Option<TermInfo>, Error> {
        let key = match self.term_key(fieldname, term) {
            Some(key) => key,
            None => return Ok(None),
        };
        match self.tindex.term_get(fieldname, &key)? {
            Some(bytes) => Ok(Some(TermInfo::from_bytes(bytes)?)),
            None => Ok(None),
        }
    }

    pub fn weight(&self, fieldname: &str, term: &[u8]) -> Result<f32, Error> {
        let key = match self.term_key(fieldname, term) {
            Some(key) => key,
            None => return Ok(0.0),
        };
        match self.tindex.term_get(fieldname, &key)? {
            Some(bytes) => TermInfo::read_weight(bytes),
            None => Ok(0.0),
        }
    }

    pub fn doc_frequency(&self, fieldname: &str, term: &[u8]) -> Result<u32, Error> {
        let key = match self.term_key(fieldname, term) {
            Some(key) => key,
            None => return Ok(0),
        };
        match self.tindex.term_get(fieldname, &key)? {
            Some(bytes) => TermInfo::read_doc_freq(bytes),
            None => Ok(0),
        }
    }

    /// All `(field, term)` pairs in index order.
    pub fn terms(&self) -> impl Iterator<Item = Result<(&str, Vec<u8>), Error>> + '_ {
        self.tindex
            .iter_terms()
            .map(|r| r.map(|(field, key)| (field, key[2..].to_vec())))
    }

    /// Terms of one field starting at `prefix`.
    pub fn terms_from(
        &self,
        fieldname: &str,
        prefix: &[u8],
    ) -> Result<Vec<Vec<u8>>, Error> {
        let key = match self.term_key(fieldname, prefix) {
            Some(key) => key,
            None => return Ok(Vec::new()),
        };
        let mut out = Vec::new();
        for term in self.tindex.terms_from(fieldname, &key)? {
            out.push(term?[2..].to_vec());
        }
        Ok(out)
    }

    /// Matcher for one term's postings: inline postings come back as an
    /// in-memory matcher, block runs as a lazy reader over the posting
    /// file.
    pub fn matcher(
        &self,
        fieldname: &str,
        term: &[u8],
        format: PostFormat,
        scorer: Option<Box<dyn BlockScorer>>,
    ) -> Result<Option<Matcher>, Error> {
        match self.term_info(fieldname, term)? {
            Some(terminfo) => Ok(Some(matcher_for(
                self.postfile.clone(),
                terminfo,
                format,
                scorer,
            )?)),
            None => Ok(None),
        }
    }

    /// Terms of `fieldname` within `k` edits of `term`, in term order.
    /// Runs the query automaton in lockstep with the ordered dictionary.
    pub fn terms_within(
        &self,
        fieldname: &str,
        term: &[u8],
        k: u32,
        prefix: usize,
    ) -> Result<Vec<Vec<u8>>, Error> {
        let id_prefix = match self.field_ids.get(fieldname) {
            Some(id) => id.to_be_bytes(),
            None => return Ok(Vec::new()),
        };
        let mut dfa = levenshtein_automaton(term, k, prefix).to_dfa();
        dfa.minimize();

        let tindex = &self.tindex;
        let fieldname = fieldname.to_string();
        let lookup = |probe: &[u8]| -> Result<Option<Vec<u8>>, Error> {
            let mut key = Vec::with_capacity(2 + probe.len());
            key.extend_from_slice(&id_prefix);
            key.extend_from_slice(probe);
            Ok(tindex
                .closest_term(&fieldname, &key)?
                .map(|found| found[2..].to_vec()))
        };

        let mut matches = FuzzyMatches::new(&dfa, lookup);
        let mut out = Vec::new();
        while let Some(found) = matches.next_match()? {
            out.push(found);
        }
        Ok(out)
    }

    /// Positioned cursor over one field's terms.
    pub fn cursor(&self, fieldname: &str) -> Result<FieldCursor<'_>, Error> {
        let (_, region_end) = self
            .tindex
            .field_region(fieldname)
            .ok_or_else(|| Error::Corrupt(format!("no such field {:?}", fieldname)))?;
        let mut cursor = FieldCursor {
            reader: self,
            fieldname: fieldname.to_string(),
            region_end: region_end as usize,
            pos: None,
        };
        cursor.first()?;
        Ok(cursor)
    }
}

/// Stateful cursor over the terms of a single field.
pub struct FieldCursor<'r> {
    reader: &'r TermsReader,
    fieldname: String,
    region_end: usize,
    pos: Option<usize>,
}

impl<'r> FieldCursor<'r> {
    pub fn first(&mut self) -> Result<(), Error> {
        let id_key = match self.reader.field_ids.get(&self.fieldname) {
            Some(id) => id.to_be_bytes().to_vec(),
            None => {
                self.pos = None;
                return Ok(());
            }
        };
        self.pos = self
            .reader
            .tindex
            .closest_term_pos(&self.fieldname, &id_key)?;
        Ok(())
    }

    /// Seek to `term` or the next term after it.
    pub fn find(&mut self, term: &[u8]) -> Result<(), Error> {
        let key = match self.reader.term_key(&self.fieldname, term) {
            Some(key) => key,
            None => {
                self.pos = None;
                return Ok(());
            }
        };
        self.pos = self
            .reader
            .tindex
            .closest_term_pos(&self.fieldname, &key)?;
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.pos.is_some()
    }

    pub fn next(&mut self) -> Result<(), Error> {
        if let Some(pos) = self.pos {
            let next = match self.reader.tindex.inner.record_at(pos)? {
                Some(range) => range.datapos + range.datalen,
                None => {
                    self.pos = None;
                    return Ok(());
                }
            };
            self.pos = if next < self.region_end {
                Some(next)
            } else {
                None
            };
        }
        Ok(())
    }

    pub fn text(&self) -> Result<Option<Vec<u8>>, Error> {
        Ok(match self.pos {
            Some(pos) => Some(self.reader.tindex.inner.key_at(pos)?[2..].to_vec()),
            None => None,
        })
    }

    pub fn term_info(&self) -> Result<Option<TermInfo>, Error> {
        Ok(match self.pos {
            Some(pos) => match self.reader.tindex.inner.record_at(pos)? {
                Some(range) => Some(TermInfo::from_bytes(
                    self.reader.tindex.inner.get_range(range.datapos, range.datalen),
                )?),
                None => None,
            },
            None => None,
        })
    }
}

/// Read side of the per-document data: stored fields, lengths, vectors.
pub struct PerDocReader {
    files: SegmentFiles,
    segment: Segment,
    stored: Option<VarColumnReader>,
    length_columns: HashMap<String, Option<FixedColumnReader>>,
    vector_columns: HashMap<String, Option<FixedColumnReader>>,
    minmax_cache: HashMap<String, (u32, u32)>,
}

impl PerDocReader {
    pub fn open(dir: &Path, segment: &Segment) -> Result<PerDocReader, Error> {
        let files = SegmentFiles::open(dir, segment)?;
        let stored = match files.entry(&segment.column_file_name(STORED_COLUMN))? {
            Some(entry) => Some(VarColumnReader::from_entry(entry)?),
            None => None,
        };
        Ok(PerDocReader {
            files,
            segment: segment.clone(),
            stored,
            length_columns: HashMap::default(),
            vector_columns: HashMap::default(),
            minmax_cache: HashMap::default(),
        })
    }

    pub fn doc_count(&self) -> u32 {
        self.segment.live_doc_count()
    }

    pub fn doc_count_all(&self) -> u32 {
        self.segment.doc_count
    }

    pub fn is_deleted(&self, docnum: DocId) -> bool {
        self.segment.is_deleted(docnum)
    }

    pub fn has_deletions(&self) -> bool {
        self.segment.has_deletions()
    }

    pub fn field_length(&self, fieldname: &str) -> u64 {
        self.segment.field_length(fieldname)
    }

    pub fn stored_fields(
        &self,
        docnum: DocId,
    ) -> Result<Option<serde_json::Map<String, serde_json::Value>>, Error> {
        let stored = match &self.stored {
            Some(stored) => stored,
            None => return Ok(None),
        };
        let blob = match stored.blob(docnum) {
            Some(blob) if !blob.is_empty() => blob,
            _ => return Ok(None),
        };
        let json = lz4_flex::decompress_size_prepended(blob)
            .map_err(|e| Error::Corrupt(format!("stored fields: {}", e)))?;
        Ok(Some(serde_json::from_slice(&json)?))
    }

    fn length_column(&mut self, fieldname: &str) -> Result<Option<&FixedColumnReader>, Error> {
        if !self.length_columns.contains_key(fieldname) {
            let name = self.segment.column_file_name(&len_column(fieldname));
            let column = match self.files.entry(&name)? {
                Some(entry) => Some(FixedColumnReader::from_entry(entry)?),
                None => None,
            };
            self.length_columns.insert(fieldname.to_string(), column);
        }
        Ok(self.length_columns.get(fieldname).unwrap().as_ref())
    }

    pub fn doc_field_length(&mut self, docnum: DocId, fieldname: &str) -> Result<u32, Error> {
        Ok(match self.length_column(fieldname)? {
            Some(column) => column.cell_u8(docnum).map(byte_to_length).unwrap_or(0),
            None => 0,
        })
    }

    fn minmax_field_length(&mut self, fieldname: &str) -> Result<(u32, u32), Error> {
        if let Some(&cached) = self.minmax_cache.get(fieldname) {
            return Ok(cached);
        }
        let result = match self.length_column(fieldname)? {
            Some(column) => {
                let mut min = u32::max_value();
                let mut max = 0u32;
                for byte in column.iter_u8() {
                    if byte == 0 {
                        continue;
                    }
                    let length = byte_to_length(byte);
                    min = min.min(length);
                    max = max.max(length);
                }
                if max == 0 {
                    (0, 0)
                } else {
                    (min, max)
                }
            }
            None => (0, 0),
        };
        self.minmax_cache.insert(fieldname.to_string(), result);
        Ok(result)
    }

    pub fn min_field_length(&mut self, fieldname: &str) -> Result<u32, Error> {
        Ok(self.minmax_field_length(fieldname)?.0)
    }

    pub fn max_field_length(&mut self, fieldname: &str) -> Result<u32, Error> {
        Ok(self.minmax_field_length(fieldname)?.1)
    }

    fn vector_column(&mut self, colname: &str) -> Result<Option<&FixedColumnReader>, Error> {
        if !self.vector_columns.contains_key(colname) {
            let name = self.segment.column_file_name(colname);
            let column = match self.files.entry(&name)? {
                Some(entry) => Some(FixedColumnReader::from_entry(entry)?),
                None => None,
            };
            self.vector_columns.insert(colname.to_string(), column);
        }
        Ok(self.vector_columns.get(colname).unwrap().as_ref())
    }

    fn vector_extent(&mut self, docnum: DocId, fieldname: &str) -> Result<Option<(u64, u32)>, Error> {
        let offset = match self.vector_column(&vec_column(fieldname))? {
            Some(column) => column.cell_u64(docnum).unwrap_or(0),
            None => 0,
        };
        if offset == 0 {
            return Ok(None);
        }
        let length = match self.vector_column(&vec_len_column(fieldname))? {
            Some(column) => column.cell_u32(docnum).unwrap_or(0),
            None => 0,
        };
        Ok(Some((offset, length)))
    }

    pub fn has_vector(&mut self, docnum: DocId, fieldname: &str) -> Result<bool, Error> {
        Ok(self.vector_extent(docnum, fieldname)?.is_some())
    }

    pub fn vector(
        &mut self,
        docnum: DocId,
        fieldname: &str,
        format: PostFormat,
    ) -> Result<Option<VectorMatcher>, Error> {
        let (offset, length) = match self.vector_extent(docnum, fieldname)? {
            Some(extent) => extent,
            None => return Ok(None),
        };
        let vps = self
            .files
            .required(&format!("{}.{}", self.segment.id, VPOSTS_EXT))?;
        Ok(Some(VectorMatcher::new(vps, offset, length, format)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn item(field: &str, term: &[u8], docnum: i64, weight: f32) -> PostItem {
        PostItem {
            field: field.to_string(),
            term: term.to_vec(),
            docnum,
            weight,
            value: Vec::new(),
            length: Some(4),
        }
    }

    fn build_segment(dir: &Path, items: Vec<PostItem>) -> Segment {
        let codec = Codec::default();
        let mut segment = codec.new_segment("t");

        let max_doc = items
            .iter()
            .filter(|i| i.docnum >= 0)
            .map(|i| i.docnum)
            .max()
            .unwrap_or(-1);
        let mut pdw = codec.per_document_writer(dir, &segment).unwrap();
        for docnum in 0..=max_doc {
            pdw.start_doc(docnum as DocId).unwrap();
            pdw.add_field(
                "body",
                Some(serde_json::json!(format!("doc {}", docnum))),
                Some(4),
            )
            .unwrap();
            pdw.finish_doc().unwrap();
        }
        pdw.close(&mut segment).unwrap();

        let mut fw = codec.field_writer(dir, &segment).unwrap();
        fw.add_postings(items, |_| PostFormat::no_values()).unwrap();
        fw.close().unwrap();
        segment
    }

    #[test]
    fn segment_write_and_read_terms() {
        let tmp = TempDir::new().unwrap();
        let items = vec![
            item("body", b"cat", 0, 2.0),
            item("body", b"cat", 3, 1.0),
            item("body", b"dog", 1, 1.0),
            item("title", b"cat", 2, 1.0),
        ];
        let segment = build_segment(tmp.path(), items);
        assert_eq!(4, segment.doc_count);
        assert_eq!(16, segment.field_length("body"));

        let codec = Codec::default();
        let tr = codec.terms_reader(tmp.path(), &segment).unwrap();
        assert!(tr.contains_term("body", b"cat").unwrap());
        assert!(tr.contains_term("title", b"cat").unwrap());
        assert!(!tr.contains_term("title", b"dog").unwrap());

        let ti = tr.term_info("body", b"cat").unwrap().unwrap();
        assert_eq!(2, ti.doc_freq);
        assert_eq!(Some(0), ti.min_id);
        assert_eq!(Some(3), ti.max_id);
        assert_eq!(3.0, ti.weight);
        assert_eq!(2.0, ti.max_weight);

        assert_eq!(2, tr.doc_frequency("body", b"cat").unwrap());
        assert_eq!(3.0, tr.weight("body", b"cat").unwrap());
        assert_eq!(0, tr.doc_frequency("body", b"horse").unwrap());

        let all: Vec<(String, Vec<u8>)> = tr
            .terms()
            .map(|t| t.map(|(f, t)| (f.to_string(), t)))
            .collect::<Result<_, Error>>()
            .unwrap();
        assert_eq!(
            vec![
                ("body".to_string(), b"cat".to_vec()),
                ("body".to_string(), b"dog".to_vec()),
                ("title".to_string(), b"cat".to_vec()),
            ],
            all
        );
    }

    #[test]
    fn matcher_reads_postings_back() {
        let tmp = TempDir::new().unwrap();
        let items = vec![
            item("body", b"cat", 0, 2.0),
            item("body", b"cat", 3, 1.0),
            item("body", b"cat", 9, 4.0),
        ];
        let segment = build_segment(tmp.path(), items);
        let codec = Codec::default();
        let tr = codec.terms_reader(tmp.path(), &segment).unwrap();

        let mut m = tr
            .matcher("body", b"cat", PostFormat::no_values(), None)
            .unwrap()
            .unwrap();
        let mut got = Vec::new();
        while m.is_active() {
            got.push((m.id().unwrap(), m.weight().unwrap()));
            let _ = m.next();
        }
        assert_eq!(vec![(0, 2.0), (3, 1.0), (9, 4.0)], got);

        // A single-posting term is inlined.
        let items2 = vec![item("body", b"lonely", 5, 1.0)];
        let tmp2 = TempDir::new().unwrap();
        let segment2 = build_segment(tmp2.path(), items2);
        let tr2 = codec.terms_reader(tmp2.path(), &segment2).unwrap();
        let ti = tr2.term_info("body", b"lonely").unwrap().unwrap();
        assert!(ti.is_inlined());
        let mut m = tr2
            .matcher("body", b"lonely", PostFormat::no_values(), None)
            .unwrap()
            .unwrap();
        assert_eq!(5, m.id().unwrap());
    }

    #[test]
    fn out_of_order_terms_rejected_without_partial_flush() {
        let tmp = TempDir::new().unwrap();
        let codec = Codec::default();
        let segment = codec.new_segment("t");
        let mut fw = codec.field_writer(tmp.path(), &segment).unwrap();
        let items = vec![item("a", b"z", 0, 1.0), item("a", b"a", 1, 1.0)];
        match fw.add_postings(items, |_| PostFormat::no_values()) {
            Err(Error::OrderViolation(_)) => {}
            other => panic!("expected OrderViolation, got {:?}", other),
        }
    }

    #[test]
    fn terms_from_and_cursor() {
        let tmp = TempDir::new().unwrap();
        let items = vec![
            item("body", b"apple", 0, 1.0),
            item("body", b"banana", 1, 1.0),
            item("body", b"cherry", 2, 1.0),
        ];
        let segment = build_segment(tmp.path(), items);
        let codec = Codec::default();
        let tr = codec.terms_reader(tmp.path(), &segment).unwrap();

        assert_eq!(
            vec![b"banana".to_vec(), b"cherry".to_vec()],
            tr.terms_from("body", b"b").unwrap()
        );

        let mut cursor = tr.cursor("body").unwrap();
        assert!(cursor.is_valid());
        assert_eq!(Some(b"apple".to_vec()), cursor.text().unwrap());
        cursor.next().unwrap();
        assert_eq!(Some(b"banana".to_vec()), cursor.text().unwrap());
        let ti = cursor.term_info().unwrap().unwrap();
        assert_eq!(1, ti.doc_freq);
        cursor.find(b"cc").unwrap();
        assert_eq!(Some(b"cherry".to_vec()), cursor.text().unwrap());
        cursor.next().unwrap();
        assert!(!cursor.is_valid());
        assert_eq!(None, cursor.text().unwrap());
    }

    #[test]
    fn fuzzy_terms_within_dictionary() {
        let tmp = TempDir::new().unwrap();
        let items = vec![
            item("body", b"car", 0, 1.0),
            item("body", b"cart", 1, 1.0),
            item("body", b"cat", 2, 1.0),
            item("body", b"dog", 3, 1.0),
        ];
        let segment = build_segment(tmp.path(), items);
        let codec = Codec::default();
        let tr = codec.terms_reader(tmp.path(), &segment).unwrap();

        let found = tr.terms_within("body", b"cat", 1, 0).unwrap();
        assert_eq!(
            vec![b"car".to_vec(), b"cart".to_vec(), b"cat".to_vec()],
            found
        );
        assert!(tr.terms_within("missing", b"cat", 1, 0).unwrap().is_empty());
    }

    #[test]
    fn per_document_data_round_trip() {
        let tmp = TempDir::new().unwrap();
        let codec = Codec::default();
        let mut segment = codec.new_segment("t");
        let mut pdw = codec.per_document_writer(tmp.path(), &segment).unwrap();

        pdw.start_doc(0).unwrap();
        pdw.add_field("body", Some(serde_json::json!("hello world")), Some(2))
            .unwrap();
        pdw.add_vector_items(
            "body",
            PostFormat::no_values(),
            &[
                (b"hello".to_vec(), 1.0, Vec::new()),
                (b"world".to_vec(), 2.0, Vec::new()),
            ],
        )
        .unwrap();
        pdw.finish_doc().unwrap();

        pdw.start_doc(1).unwrap();
        pdw.add_field("body", None, Some(7)).unwrap();
        pdw.finish_doc().unwrap();

        pdw.close(&mut segment).unwrap();
        assert_eq!(2, segment.doc_count);
        assert_eq!(9, segment.field_length("body"));

        let mut pdr = codec.per_document_reader(tmp.path(), &segment).unwrap();
        let stored = pdr.stored_fields(0).unwrap().unwrap();
        assert_eq!(Some("hello world"), stored.get("body").and_then(|v| v.as_str()));
        assert_eq!(None, pdr.stored_fields(1).unwrap());

        assert_eq!(2, pdr.doc_field_length(0, "body").unwrap());
        assert_eq!(7, pdr.doc_field_length(1, "body").unwrap());
        assert_eq!(0, pdr.doc_field_length(0, "title").unwrap());
        assert_eq!(2, pdr.min_field_length("body").unwrap());
        assert_eq!(7, pdr.max_field_length("body").unwrap());

        assert!(pdr.has_vector(0, "body").unwrap());
        assert!(!pdr.has_vector(1, "body").unwrap());
        let mut vm = pdr
            .vector(0, "body", PostFormat::no_values())
            .unwrap()
            .unwrap();
        let got = vm.read_all().unwrap();
        assert_eq!(2, got.len());
        assert_eq!(b"hello".to_vec(), got[0].0);
        assert_eq!(2.0, got[1].1);
    }

    #[test]
    fn per_doc_writer_enforces_doc_order() {
        let tmp = TempDir::new().unwrap();
        let codec = Codec::default();
        let segment = codec.new_segment("t");
        let mut pdw = codec.per_document_writer(tmp.path(), &segment).unwrap();
        pdw.start_doc(0).unwrap();
        pdw.finish_doc().unwrap();
        match pdw.start_doc(5) {
            Err(Error::OrderViolation(_)) => {}
            other => panic!("expected OrderViolation, got {:?}", other),
        }
    }

    #[test]
    fn deleted_docs_snapshot_round_trip() {
        let mut segment = Segment::new("t");
        segment.doc_count = 100;
        segment.delete_document(3);
        segment.delete_document(40);
        segment.delete_document(41);
        assert!(segment.has_deletions());
        assert!(segment.is_deleted(40));
        assert!(!segment.is_deleted(4));
        assert_eq!(97, segment.live_doc_count());

        let snapshot = segment.deleted_snapshot();
        let mut restored = Segment::new("t2");
        restored.doc_count = 100;
        restored.restore_deleted(&snapshot).unwrap();
        assert_eq!(
            vec![3, 40, 41],
            restored.deleted_docs().collect::<Vec<_>>()
        );
    }

    #[test]
    fn compound_segment_reads_transparently() {
        let tmp = TempDir::new().unwrap();
        let items = vec![
            item("body", b"alpha", 0, 1.0),
            item("body", b"beta", 1, 2.0),
            item("body", b"beta", 2, 1.0),
        ];
        let segment = build_segment(tmp.path(), items);
        segment.into_compound(tmp.path()).unwrap();

        // Only the .seg file remains.
        let remaining: Vec<String> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(1, remaining.len());
        assert!(remaining[0].ends_with(".seg"));

        let codec = Codec::default();
        let tr = codec.terms_reader(tmp.path(), &segment).unwrap();
        let ti = tr.term_info("body", b"beta").unwrap().unwrap();
        assert_eq!(2, ti.doc_freq);
        let mut m = tr
            .matcher("body", b"beta", PostFormat::no_values(), None)
            .unwrap()
            .unwrap();
        assert_eq!(1, m.id().unwrap());

        let mut pdr = codec.per_document_reader(tmp.path(), &segment).unwrap();
        assert!(pdr.stored_fields(0).unwrap().is_some());
        assert_eq!(4, pdr.doc_field_length(2, "body").unwrap());
    }

    #[test]
    fn spelling_only_items_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let items = vec![
            item("body", b"misspelt", SPELL_DOC, 1.0),
            item("body", b"proper", 0, 1.0),
        ];
        let segment = build_segment(tmp.path(), items);
        let codec = Codec::default();
        let tr = codec.terms_reader(tmp.path(), &segment).unwrap();
        assert!(!tr.contains_term("body", b"misspelt").unwrap());
        assert!(tr.contains_term("body", b"proper").unwrap());
    }
}
