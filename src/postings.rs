//! Posting lists as variable-sized block runs. Each term's run starts
//! with a four-byte magic; each block carries a fixed-layout info header
//! (count, last id, max weight, compression, quantized min/max lengths,
//! section lengths) so readers can decide to skip a block before paying
//! to decode it. Bodies hold three sections (ids, weights, values) with
//! one optional zlib pass over the lot.
//!
//! Ids are doc numbers delta-coded as vbytes, or length-prefixed byte
//! strings for vector postings where the "id" is a term.

use crate::io_helper::{
    CountingFileWriter, DataInputStream, InputStream, SliceInputStream, ValueEntry,
};
use crate::numeric::{
    byte_to_length, length_bound_to_byte, length_to_byte, write_vbyte, write_vbytes_slice,
};
use crate::terminfo::TermInfo;
use crate::{DocId, Error};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Magic at the start of every term's posting run.
pub const POSTING_MAGIC: &[u8; 4] = b"W3Bl";
/// Older block stream; recognized so we can report it, never read.
const LEGACY_POSTING_MAGIC: &[u8; 4] = b"Blk3";

pub const DEFAULT_BLOCK_LIMIT: usize = 128;
pub const DEFAULT_COMPRESSION: u32 = 3;
pub const DEFAULT_INLINE_LIMIT: usize = 1;

/// Body bytes below this aren't worth a zlib pass.
const COMPRESSION_FLOOR: usize = 20;

// Info-header flag bits.
const WEIGHTS_ALL_ONE: u8 = 1;
const WEIGHTS_UNIFORM: u8 = 2;
const BYTE_IDS: u8 = 4;

/// How a field's posting payloads are laid out: fixed-size (`Some(n)`),
/// absent (`Some(0)`), or variable (`None`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostFormat {
    pub fixed_value_size: Option<usize>,
}

impl PostFormat {
    pub fn fixed(size: usize) -> PostFormat {
        PostFormat {
            fixed_value_size: Some(size),
        }
    }
    pub fn no_values() -> PostFormat {
        PostFormat {
            fixed_value_size: Some(0),
        }
    }
    pub fn variable() -> PostFormat {
        PostFormat {
            fixed_value_size: None,
        }
    }
}

/// Upper-bound quality function supplied by a scorer, consulted against
/// block statistics to skip whole blocks.
pub trait BlockScorer {
    fn block_quality(&self, max_weight: f32, min_length: u32) -> f32;
}

/// Orders skip decisions by weight alone; the no-scorer default.
pub struct MaxWeightScorer;

impl BlockScorer for MaxWeightScorer {
    fn block_quality(&self, max_weight: f32, _min_length: u32) -> f32 {
        max_weight
    }
}

// Section codecs, shared with inlined postings in TermInfo.

pub(crate) fn encode_doc_ids(ids: &[DocId]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ids.len() * 2);
    let mut prev = 0;
    for &id in ids {
        write_vbyte((id - prev) as u64, &mut out).expect("vec write");
        prev = id;
    }
    out
}

pub(crate) fn decode_doc_ids(bytes: &[u8], count: usize) -> Result<Vec<DocId>, Error> {
    let mut input = SliceInputStream::new(bytes);
    let mut out = Vec::with_capacity(count);
    let mut prev = 0u32;
    for _ in 0..count {
        prev += input.read_vbyte()? as u32;
        out.push(prev);
    }
    Ok(out)
}

fn encode_byte_ids(ids: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for id in ids {
        write_vbytes_slice(id, &mut out).expect("vec write");
    }
    out
}

fn decode_byte_ids(bytes: &[u8], count: usize) -> Result<Vec<Vec<u8>>, Error> {
    let mut input = SliceInputStream::new(bytes);
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let len = input.read_vbyte()? as usize;
        out.push(input.read_bytes(len)?.to_vec());
    }
    Ok(out)
}

/// All-ones and uniform runs take zero or four bytes; the flag bits say
/// which case applies.
pub(crate) fn encode_weights(weights: &[f32]) -> (u8, Vec<u8>) {
    if weights.iter().all(|&w| w == 1.0) {
        return (WEIGHTS_ALL_ONE, Vec::new());
    }
    if weights.iter().all(|&w| w == weights[0]) {
        return (WEIGHTS_UNIFORM, weights[0].to_be_bytes().to_vec());
    }
    let mut out = Vec::with_capacity(weights.len() * 4);
    for w in weights {
        out.extend_from_slice(&w.to_be_bytes());
    }
    (0, out)
}

pub(crate) fn decode_weights(bytes: &[u8], count: usize, flags: u8) -> Result<Vec<f32>, Error> {
    if flags & WEIGHTS_ALL_ONE != 0 {
        return Ok(vec![1.0; count]);
    }
    let mut input = SliceInputStream::new(bytes);
    if flags & WEIGHTS_UNIFORM != 0 {
        let w = input.read_f32()?;
        return Ok(vec![w; count]);
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(input.read_f32()?);
    }
    Ok(out)
}

pub(crate) fn encode_values(values: &[Vec<u8>], format: PostFormat) -> Result<Vec<u8>, Error> {
    match format.fixed_value_size {
        Some(0) => Ok(Vec::new()),
        Some(size) => {
            let mut out = Vec::with_capacity(values.len() * size);
            for v in values {
                if v.len() != size {
                    return Err(Error::InvalidValue(format!(
                        "payload of {} bytes in a format of fixed size {}",
                        v.len(),
                        size
                    )));
                }
                out.extend_from_slice(v);
            }
            Ok(out)
        }
        None => {
            let mut out = Vec::new();
            for v in values {
                write_vbytes_slice(v, &mut out)?;
            }
            Ok(out)
        }
    }
}

pub(crate) fn decode_values(
    bytes: &[u8],
    count: usize,
    format: PostFormat,
) -> Result<Vec<Vec<u8>>, Error> {
    match format.fixed_value_size {
        Some(0) => Ok(vec![Vec::new(); count]),
        Some(size) => {
            if bytes.len() != count * size {
                return Err(Error::Corrupt("fixed-size value section mismatch".into()));
            }
            Ok(bytes.chunks_exact(size).map(|c| c.to_vec()).collect())
        }
        None => {
            let mut input = SliceInputStream::new(bytes);
            let mut out = Vec::with_capacity(count);
            for _ in 0..count {
                let len = input.read_vbyte()? as usize;
                out.push(input.read_bytes(len)?.to_vec());
            }
            Ok(out)
        }
    }
}

enum BlockIds {
    Docs(Vec<DocId>),
    Terms(Vec<Vec<u8>>),
}

impl BlockIds {
    fn len(&self) -> usize {
        match self {
            BlockIds::Docs(v) => v.len(),
            BlockIds::Terms(v) => v.len(),
        }
    }
    fn clear(&mut self) {
        match self {
            BlockIds::Docs(v) => v.clear(),
            BlockIds::Terms(v) => v.clear(),
        }
    }
}

/// Buffers postings for one term at a time and flushes them as blocks,
/// keeping per-term statistics on a TermInfo as it goes. Lists that fit
/// in one small block are handed back inline instead of touching the
/// posting file.
pub struct PostingsWriter {
    format: PostFormat,
    blocklimit: usize,
    compression: u32,
    inlinelimit: usize,

    in_term: bool,
    startoffset: u64,
    blockcount: u32,
    terminfo: TermInfo,

    ids: BlockIds,
    weights: Vec<f32>,
    values: Vec<Vec<u8>>,
    minlength: Option<u32>,
    maxlength: u32,
    maxweight: f32,
}

impl PostingsWriter {
    pub fn new(format: PostFormat) -> PostingsWriter {
        Self::with_limits(
            format,
            DEFAULT_BLOCK_LIMIT,
            DEFAULT_COMPRESSION,
            DEFAULT_INLINE_LIMIT,
        )
    }

    pub fn with_limits(
        format: PostFormat,
        blocklimit: usize,
        compression: u32,
        inlinelimit: usize,
    ) -> PostingsWriter {
        PostingsWriter {
            format,
            blocklimit,
            compression,
            inlinelimit,
            in_term: false,
            startoffset: 0,
            blockcount: 0,
            terminfo: TermInfo::new(),
            ids: BlockIds::Docs(Vec::new()),
            weights: Vec::new(),
            values: Vec::new(),
            minlength: None,
            maxlength: 0,
            maxweight: 0.0,
        }
    }

    /// Byte-string ids instead of doc numbers (vector postings).
    pub fn byte_ids(mut self) -> PostingsWriter {
        self.ids = BlockIds::Terms(Vec::new());
        self
    }

    pub fn written(&self) -> bool {
        self.blockcount > 0
    }

    pub fn start_postings(&mut self, postfile: &CountingFileWriter) -> Result<(), Error> {
        if self.in_term {
            return Err(Error::OrderViolation(
                "start_postings while already in a term".into(),
            ));
        }
        self.in_term = true;
        self.blockcount = 0;
        self.terminfo = TermInfo::new();
        self.reset_block();
        self.startoffset = postfile.tell();
        Ok(())
    }

    fn reset_block(&mut self) {
        self.ids.clear();
        self.weights.clear();
        self.values.clear();
        self.minlength = None;
        self.maxlength = 0;
        self.maxweight = 0.0;
    }

    pub fn add_posting(
        &mut self,
        postfile: &mut CountingFileWriter,
        id: DocId,
        weight: f32,
        value: &[u8],
        length: Option<u32>,
    ) -> Result<(), Error> {
        if self.ids.len() >= self.blocklimit {
            self.write_block(postfile, false)?;
        }
        match &mut self.ids {
            BlockIds::Docs(ids) => {
                if let Some(&last) = ids.last() {
                    if id <= last {
                        return Err(Error::OrderViolation(format!(
                            "doc ids out of order: {}..{}",
                            last, id
                        )));
                    }
                }
                ids.push(id);
            }
            BlockIds::Terms(_) => {
                return Err(Error::InvalidValue(
                    "integer id in a byte-id posting list".into(),
                ))
            }
        }
        self.push_common(weight, value, length);
        Ok(())
    }

    pub fn add_byte_posting(
        &mut self,
        postfile: &mut CountingFileWriter,
        id: &[u8],
        weight: f32,
        value: &[u8],
    ) -> Result<(), Error> {
        if self.ids.len() >= self.blocklimit {
            self.write_block(postfile, false)?;
        }
        match &mut self.ids {
            BlockIds::Terms(ids) => ids.push(id.to_vec()),
            BlockIds::Docs(_) => {
                return Err(Error::InvalidValue(
                    "byte id in an integer-id posting list".into(),
                ))
            }
        }
        self.push_common(weight, value, None);
        Ok(())
    }

    fn push_common(&mut self, weight: f32, value: &[u8], length: Option<u32>) {
        self.weights.push(weight);
        self.values.push(value.to_vec());
        if weight > self.maxweight {
            self.maxweight = weight;
        }
        if let Some(length) = length {
            if self.minlength.map(|m| length < m).unwrap_or(true) {
                self.minlength = Some(length);
            }
            if length > self.maxlength {
                self.maxlength = length;
            }
        }
    }

    /// Roll the buffered term into either an inline TermInfo or the final
    /// block on disk, and return the finished TermInfo.
    pub fn finish_postings(
        &mut self,
        postfile: &mut CountingFileWriter,
    ) -> Result<TermInfo, Error> {
        if !self.in_term {
            return Err(Error::OrderViolation(
                "finish_postings outside a term".into(),
            ));
        }
        let inlinable = matches!(self.ids, BlockIds::Docs(_));
        if !self.written() && inlinable && self.ids.len() <= self.inlinelimit {
            self.absorb_block_stats();
            let ids = match &self.ids {
                BlockIds::Docs(ids) => ids.clone(),
                BlockIds::Terms(_) => unreachable!(),
            };
            self.terminfo
                .set_inlined(ids, self.weights.clone(), self.values.clone());
        } else {
            if self.ids.len() > 0 {
                self.write_block(postfile, true)?;
            }
            let length = postfile.tell() - self.startoffset;
            self.terminfo.set_extent(self.startoffset, length as u32);
        }
        self.in_term = false;
        Ok(std::mem::replace(&mut self.terminfo, TermInfo::new()))
    }

    /// Fold the buffered block's statistics into the term totals.
    fn absorb_block_stats(&mut self) {
        let ti = &mut self.terminfo;
        ti.weight += self.weights.iter().sum::<f32>();
        ti.doc_freq += self.ids.len() as u32;
        if let Some(minlength) = self.minlength {
            ti.min_length = Some(ti.min_length.map(|m| m.min(minlength)).unwrap_or(minlength));
        }
        if self.maxlength > ti.max_length {
            ti.max_length = self.maxlength;
        }
        if self.maxweight > ti.max_weight {
            ti.max_weight = self.maxweight;
        }
        if let BlockIds::Docs(ids) = &self.ids {
            if let (Some(&first), Some(&last)) = (ids.first(), ids.last()) {
                if ti.min_id.is_none() {
                    ti.min_id = Some(first);
                }
                ti.max_id = Some(last);
            }
        }
    }

    fn write_block(&mut self, postfile: &mut CountingFileWriter, last: bool) -> Result<(), Error> {
        if self.ids.len() == 0 {
            return Err(Error::Corrupt("flushing an empty posting block".into()));
        }
        if self.blockcount == 0 {
            postfile.write_all(POSTING_MAGIC)?;
        }
        self.absorb_block_stats();

        let count = self.ids.len();
        let (mut flags, ids_bytes, last_id) = match &self.ids {
            BlockIds::Docs(ids) => (0u8, encode_doc_ids(ids), LastId::Doc(ids[count - 1])),
            BlockIds::Terms(ids) => (
                BYTE_IDS,
                encode_byte_ids(ids),
                LastId::Term(ids[count - 1].clone()),
            ),
        };
        let (wflags, weight_bytes) = encode_weights(&self.weights);
        flags |= wflags;
        let value_bytes = encode_values(&self.values, self.format)?;

        let mut body = Vec::with_capacity(ids_bytes.len() + weight_bytes.len() + value_bytes.len());
        body.extend_from_slice(&ids_bytes);
        body.extend_from_slice(&weight_bytes);
        body.extend_from_slice(&value_bytes);

        let mut compression = 0u8;
        if self.compression > 0 && body.len() > COMPRESSION_FLOOR {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(self.compression));
            encoder.write_all(&body)?;
            body = encoder.finish()?;
            compression = self.compression as u8;
        }

        // Info header: enough to decide skips without touching the body.
        let mut info = Vec::with_capacity(32);
        info.extend_from_slice(&(count as u32).to_be_bytes());
        info.push(flags);
        info.push(compression);
        info.push(self.minlength.map(length_to_byte).unwrap_or(0));
        info.push(length_bound_to_byte(self.maxlength));
        info.extend_from_slice(&self.maxweight.to_be_bytes());
        match &last_id {
            LastId::Doc(id) => info.extend_from_slice(&id.to_be_bytes()),
            LastId::Term(term) => {
                write_vbytes_slice(term, &mut info)?;
            }
        }
        write_vbyte(ids_bytes.len() as u64, &mut info)?;
        write_vbyte(weight_bytes.len() as u64, &mut info)?;
        write_vbyte(value_bytes.len() as u64, &mut info)?;

        let mut blocklength = (info.len() + body.len()) as i32;
        if last {
            blocklength = -blocklength;
        }
        postfile.write_i32(blocklength)?;
        postfile.write_all(&info)?;
        postfile.write_all(&body)?;

        self.blockcount += 1;
        self.reset_block();
        Ok(())
    }
}

enum LastId {
    Doc(DocId),
    Term(Vec<u8>),
}

/// Parsed block info header.
#[derive(Debug, Clone)]
struct BlockInfo {
    count: usize,
    flags: u8,
    compression: u8,
    min_length_byte: u8,
    max_length_byte: u8,
    max_weight: f32,
    last_doc: Option<DocId>,
    ids_len: usize,
    weights_len: usize,
    values_len: usize,
}

/// Walks a block run inside the posting file; shared by the doc-id and
/// vector matchers.
struct BlockRun {
    source: ValueEntry,
    format: PostFormat,
    baseoffset: usize,
    endoffset: usize,

    info: BlockInfo,
    dataoffset: usize,
    nextoffset: usize,
    lastblock: bool,
    atend: bool,

    body: Option<Vec<u8>>,
    i: usize,
}

impl BlockRun {
    /// `source` spans the whole posting file (or the compound member);
    /// the extent gives the term's run inside it.
    fn new(source: ValueEntry, offset: u64, length: u32, format: PostFormat) -> Result<Self, Error> {
        let start = offset as usize;
        let end = start + length as usize;
        if end > source.len() || (length as usize) < 8 {
            return Err(Error::Corrupt("posting extent out of bounds".into()));
        }
        let bytes = source.as_bytes();
        if &bytes[start..start + 4] == LEGACY_POSTING_MAGIC {
            return Err(Error::UnsupportedVersion(
                "v2 posting blocks are no longer readable".into(),
            ));
        }
        if &bytes[start..start + 4] != POSTING_MAGIC {
            return Err(Error::BadMagic([
                bytes[start],
                bytes[start + 1],
                bytes[start + 2],
                bytes[start + 3],
            ]));
        }
        let mut run = BlockRun {
            source,
            format,
            baseoffset: start + 4,
            endoffset: end,
            info: BlockInfo {
                count: 0,
                flags: 0,
                compression: 0,
                min_length_byte: 0,
                max_length_byte: 0,
                max_weight: 0.0,
                last_doc: None,
                ids_len: 0,
                weights_len: 0,
                values_len: 0,
            },
            dataoffset: 0,
            nextoffset: 0,
            lastblock: false,
            atend: false,
            body: None,
            i: 0,
        };
        run.goto(run.baseoffset)?;
        Ok(run)
    }

    fn reset(&mut self) -> Result<(), Error> {
        self.lastblock = false;
        self.atend = false;
        self.goto(self.baseoffset)
    }

    /// Parse the block header at `position` and stage its body for lazy
    /// decoding.
    fn goto(&mut self, position: usize) -> Result<(), Error> {
        self.body = None;
        self.i = 0;

        let bytes = self.source.as_bytes();
        if position + 4 > self.endoffset {
            return Err(Error::Corrupt("posting block past extent".into()));
        }
        let mut input = SliceInputStream::new(&bytes[position..self.endoffset]);
        let mut blocklength = input.read_i32()?;
        if blocklength < 0 {
            self.lastblock = true;
            blocklength = -blocklength;
        }
        self.nextoffset = position + 4 + blocklength as usize;
        if self.nextoffset > self.endoffset {
            return Err(Error::Corrupt("posting block overruns extent".into()));
        }

        let count = input.read_u32()? as usize;
        let flags = input.get()?;
        let compression = input.get()?;
        let min_length_byte = input.get()?;
        let max_length_byte = input.get()?;
        let max_weight = input.read_f32()?;
        let last_doc = if flags & BYTE_IDS == 0 {
            Some(input.read_u32()?)
        } else {
            let len = input.read_vbyte()? as usize;
            input.read_bytes(len)?;
            None
        };
        let ids_len = input.read_vbyte()? as usize;
        let weights_len = input.read_vbyte()? as usize;
        let values_len = input.read_vbyte()? as usize;
        self.dataoffset = position + 4 + input.tell();

        self.info = BlockInfo {
            count,
            flags,
            compression,
            min_length_byte,
            max_length_byte,
            max_weight,
            last_doc,
            ids_len,
            weights_len,
            values_len,
        };
        Ok(())
    }

    fn next_block(&mut self) -> Result<(), Error> {
        if self.atend {
            return Err(Error::ReadPastEnd);
        }
        if self.lastblock {
            self.atend = true;
        } else {
            let next = self.nextoffset;
            self.goto(next)?;
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        !self.atend && self.i < self.info.count
    }

    /// Decompress (if needed) and cache the block body.
    fn body(&mut self) -> Result<&[u8], Error> {
        if self.body.is_none() {
            let raw = &self.source.as_bytes()[self.dataoffset..self.nextoffset];
            let body = if self.info.compression > 0 {
                let mut decoder = ZlibDecoder::new(raw);
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                out
            } else {
                raw.to_vec()
            };
            let expected = self.info.ids_len + self.info.weights_len + self.info.values_len;
            if body.len() != expected {
                return Err(Error::Corrupt("posting block body length mismatch".into()));
            }
            self.body = Some(body);
        }
        Ok(self.body.as_deref().unwrap())
    }

    fn sections(&mut self) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>), Error> {
        let (ids_len, weights_len) = (self.info.ids_len, self.info.weights_len);
        let body = self.body()?;
        let ids = body[..ids_len].to_vec();
        let weights = body[ids_len..ids_len + weights_len].to_vec();
        let values = body[ids_len + weights_len..].to_vec();
        Ok((ids, weights, values))
    }
}

/// On-disk posting reader for integer doc ids, with the skip interface
/// the query layer drives.
pub struct BlockMatcher {
    run: BlockRun,
    scorer: Box<dyn BlockScorer>,
    ids: Option<Vec<DocId>>,
    weights: Option<Vec<f32>>,
    values: Option<Vec<Vec<u8>>>,
}

impl BlockMatcher {
    pub fn new(
        source: ValueEntry,
        offset: u64,
        length: u32,
        format: PostFormat,
        scorer: Option<Box<dyn BlockScorer>>,
    ) -> Result<Self, Error> {
        let run = BlockRun::new(source, offset, length, format)?;
        Ok(BlockMatcher {
            run,
            scorer: scorer.unwrap_or_else(|| Box::new(MaxWeightScorer)),
            ids: None,
            weights: None,
            values: None,
        })
    }

    pub fn reset(&mut self) -> Result<(), Error> {
        self.clear_decoded();
        self.run.reset()
    }

    fn clear_decoded(&mut self) {
        self.ids = None;
        self.weights = None;
        self.values = None;
    }

    pub fn is_active(&self) -> bool {
        self.run.is_active()
    }

    fn require_active(&self) -> Result<(), Error> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::ReadPastEnd)
        }
    }

    fn load_ids(&mut self) -> Result<(), Error> {
        if self.ids.is_none() {
            let count = self.run.info.count;
            let (ids, _, _) = self.run.sections()?;
            self.ids = Some(decode_doc_ids(&ids, count)?);
        }
        Ok(())
    }

    pub fn id(&mut self) -> Result<DocId, Error> {
        self.require_active()?;
        self.load_ids()?;
        Ok(self.ids.as_ref().unwrap()[self.run.i])
    }

    pub fn weight(&mut self) -> Result<f32, Error> {
        self.require_active()?;
        if self.weights.is_none() {
            let count = self.run.info.count;
            let flags = self.run.info.flags;
            let (_, weights, _) = self.run.sections()?;
            self.weights = Some(decode_weights(&weights, count, flags)?);
        }
        Ok(self.weights.as_ref().unwrap()[self.run.i])
    }

    pub fn value(&mut self) -> Result<Vec<u8>, Error> {
        self.require_active()?;
        if self.values.is_none() {
            let count = self.run.info.count;
            let format = self.run.format;
            let (_, _, values) = self.run.sections()?;
            self.values = Some(decode_values(&values, count, format)?);
        }
        Ok(self.values.as_ref().unwrap()[self.run.i].clone())
    }

    /// Advance one posting; true when a block boundary was crossed.
    pub fn next(&mut self) -> Result<bool, Error> {
        self.require_active()?;
        self.run.i += 1;
        if self.run.i >= self.run.info.count {
            self.clear_decoded();
            self.run.next_block()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Advance to the first posting with id >= `target`, skipping whole
    /// blocks on their `last_doc` header field alone.
    pub fn skip_to(&mut self, target: DocId) -> Result<(), Error> {
        self.require_active()?;
        if target <= self.id()? {
            return Ok(());
        }
        while self.is_active() && self.block_max_id()? < target {
            self.clear_decoded();
            self.run.next_block()?;
        }
        while self.is_active() && self.id()? < target {
            self.next()?;
        }
        Ok(())
    }

    /// Skip blocks whose quality bound can't beat `minquality`; the count
    /// of skipped blocks comes back for the scorer's bookkeeping.
    pub fn skip_to_quality(&mut self, minquality: f32) -> Result<usize, Error> {
        let mut skipped = 0;
        if self.block_quality() > minquality {
            return Ok(skipped);
        }
        while self.is_active() && self.block_quality() <= minquality {
            self.clear_decoded();
            self.run.next_block()?;
            skipped += 1;
        }
        Ok(skipped)
    }

    pub fn block_quality(&self) -> f32 {
        self.scorer.block_quality(
            self.run.info.max_weight,
            byte_to_length(self.run.info.min_length_byte),
        )
    }

    pub fn block_min_id(&mut self) -> Result<DocId, Error> {
        self.load_ids()?;
        Ok(self.ids.as_ref().unwrap()[0])
    }

    pub fn block_max_id(&mut self) -> Result<DocId, Error> {
        self.run
            .info
            .last_doc
            .ok_or_else(|| Error::Corrupt("doc block without last id".into()))
    }

    pub fn block_min_length(&self) -> u32 {
        byte_to_length(self.run.info.min_length_byte)
    }

    pub fn block_max_length(&self) -> u32 {
        byte_to_length(self.run.info.max_length_byte)
    }

    pub fn block_max_weight(&self) -> f32 {
        self.run.info.max_weight
    }
}

/// Reader for byte-id (vector) posting runs: each posting is a
/// `(term, weight, value)` triple.
pub struct VectorMatcher {
    run: BlockRun,
    ids: Option<Vec<Vec<u8>>>,
    weights: Option<Vec<f32>>,
    values: Option<Vec<Vec<u8>>>,
}

impl VectorMatcher {
    pub fn new(
        source: ValueEntry,
        offset: u64,
        length: u32,
        format: PostFormat,
    ) -> Result<Self, Error> {
        Ok(VectorMatcher {
            run: BlockRun::new(source, offset, length, format)?,
            ids: None,
            weights: None,
            values: None,
        })
    }

    pub fn is_active(&self) -> bool {
        self.run.is_active()
    }

    fn load(&mut self) -> Result<(), Error> {
        if self.ids.is_none() {
            let count = self.run.info.count;
            let flags = self.run.info.flags;
            let format = self.run.format;
            let (ids, weights, values) = self.run.sections()?;
            if flags & BYTE_IDS == 0 {
                return Err(Error::Corrupt("expected byte-id posting block".into()));
            }
            self.ids = Some(decode_byte_ids(&ids, count)?);
            self.weights = Some(decode_weights(&weights, count, flags)?);
            self.values = Some(decode_values(&values, count, format)?);
        }
        Ok(())
    }

    pub fn id(&mut self) -> Result<Vec<u8>, Error> {
        if !self.is_active() {
            return Err(Error::ReadPastEnd);
        }
        self.load()?;
        Ok(self.ids.as_ref().unwrap()[self.run.i].clone())
    }

    pub fn weight(&mut self) -> Result<f32, Error> {
        if !self.is_active() {
            return Err(Error::ReadPastEnd);
        }
        self.load()?;
        Ok(self.weights.as_ref().unwrap()[self.run.i])
    }

    pub fn value(&mut self) -> Result<Vec<u8>, Error> {
        if !self.is_active() {
            return Err(Error::ReadPastEnd);
        }
        self.load()?;
        Ok(self.values.as_ref().unwrap()[self.run.i].clone())
    }

    pub fn next(&mut self) -> Result<(), Error> {
        if !self.is_active() {
            return Err(Error::ReadPastEnd);
        }
        self.run.i += 1;
        if self.run.i >= self.run.info.count {
            self.ids = None;
            self.weights = None;
            self.values = None;
            self.run.next_block()?;
        }
        Ok(())
    }

    /// Drain the whole run.
    pub fn read_all(&mut self) -> Result<Vec<(Vec<u8>, f32, Vec<u8>)>, Error> {
        let mut out = Vec::new();
        while self.is_active() {
            out.push((self.id()?, self.weight()?, self.value()?));
            self.next()?;
        }
        Ok(out)
    }
}

/// In-memory matcher over postings inlined in a TermInfo; presents the
/// same interface as [`BlockMatcher`].
pub struct InlineMatcher {
    ids: Vec<DocId>,
    weights: Vec<f32>,
    values: Vec<Vec<u8>>,
    i: usize,
    atend: bool,
    scorer: Box<dyn BlockScorer>,
    min_length: u32,
}

impl InlineMatcher {
    pub fn new(
        ids: Vec<DocId>,
        weights: Vec<f32>,
        values: Vec<Vec<u8>>,
        min_length: u32,
        scorer: Option<Box<dyn BlockScorer>>,
    ) -> InlineMatcher {
        InlineMatcher {
            ids,
            weights,
            values,
            i: 0,
            atend: false,
            scorer: scorer.unwrap_or_else(|| Box::new(MaxWeightScorer)),
            min_length,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.atend && self.i < self.ids.len()
    }

    fn require_active(&self) -> Result<(), Error> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::ReadPastEnd)
        }
    }

    pub fn id(&mut self) -> Result<DocId, Error> {
        self.require_active()?;
        Ok(self.ids[self.i])
    }

    pub fn weight(&mut self) -> Result<f32, Error> {
        self.require_active()?;
        Ok(self.weights[self.i])
    }

    pub fn value(&mut self) -> Result<Vec<u8>, Error> {
        self.require_active()?;
        Ok(self.values[self.i].clone())
    }

    pub fn next(&mut self) -> Result<bool, Error> {
        self.require_active()?;
        self.i += 1;
        if self.i >= self.ids.len() {
            self.atend = true;
        }
        Ok(false)
    }

    pub fn skip_to(&mut self, target: DocId) -> Result<(), Error> {
        self.require_active()?;
        while self.is_active() && self.ids[self.i] < target {
            self.i += 1;
        }
        if self.i >= self.ids.len() {
            self.atend = true;
        }
        Ok(())
    }

    pub fn skip_to_quality(&mut self, minquality: f32) -> Result<usize, Error> {
        if self.block_quality() <= minquality {
            self.i = self.ids.len();
            self.atend = true;
        }
        Ok(0)
    }

    pub fn block_quality(&self) -> f32 {
        let max_weight = self.weights.iter().cloned().fold(0.0f32, f32::max);
        self.scorer.block_quality(max_weight, self.min_length)
    }

    pub fn block_max_id(&mut self) -> Result<DocId, Error> {
        self.ids
            .last()
            .copied()
            .ok_or_else(|| Error::Corrupt("empty inline posting list".into()))
    }
}

/// Either kind of term matcher, as handed out by the terms reader.
pub enum Matcher {
    Block(BlockMatcher),
    Inline(InlineMatcher),
}

impl Matcher {
    pub fn is_active(&self) -> bool {
        match self {
            Matcher::Block(m) => m.is_active(),
            Matcher::Inline(m) => m.is_active(),
        }
    }
    pub fn id(&mut self) -> Result<DocId, Error> {
        match self {
            Matcher::Block(m) => m.id(),
            Matcher::Inline(m) => m.id(),
        }
    }
    pub fn weight(&mut self) -> Result<f32, Error> {
        match self {
            Matcher::Block(m) => m.weight(),
            Matcher::Inline(m) => m.weight(),
        }
    }
    pub fn value(&mut self) -> Result<Vec<u8>, Error> {
        match self {
            Matcher::Block(m) => m.value(),
            Matcher::Inline(m) => m.value(),
        }
    }
    pub fn next(&mut self) -> Result<bool, Error> {
        match self {
            Matcher::Block(m) => m.next(),
            Matcher::Inline(m) => m.next(),
        }
    }
    pub fn skip_to(&mut self, target: DocId) -> Result<(), Error> {
        match self {
            Matcher::Block(m) => m.skip_to(target),
            Matcher::Inline(m) => m.skip_to(target),
        }
    }
    pub fn skip_to_quality(&mut self, minquality: f32) -> Result<usize, Error> {
        match self {
            Matcher::Block(m) => m.skip_to_quality(minquality),
            Matcher::Inline(m) => m.skip_to_quality(minquality),
        }
    }
    pub fn block_quality(&self) -> f32 {
        match self {
            Matcher::Block(m) => m.block_quality(),
            Matcher::Inline(m) => m.block_quality(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_helper::open_mmap_file;
    use tempfile::TempDir;

    fn write_term(
        path: &std::path::Path,
        postings: &[(DocId, f32, &[u8], u32)],
        format: PostFormat,
        blocklimit: usize,
        inlinelimit: usize,
    ) -> TermInfo {
        let mut postfile = CountingFileWriter::create(path).unwrap();
        let mut writer = PostingsWriter::with_limits(format, blocklimit, 3, inlinelimit);
        writer.start_postings(&postfile).unwrap();
        for &(id, weight, value, length) in postings {
            writer
                .add_posting(&mut postfile, id, weight, value, Some(length))
                .unwrap();
        }
        let terminfo = writer.finish_postings(&mut postfile).unwrap();
        postfile.finish().unwrap();
        terminfo
    }

    fn open_matcher(path: &std::path::Path, terminfo: &TermInfo, format: PostFormat) -> BlockMatcher {
        let (offset, length) = terminfo.extent().unwrap();
        let source = ValueEntry::whole_file(open_mmap_file(path).unwrap());
        BlockMatcher::new(source, offset, length, format, None).unwrap()
    }

    #[test]
    fn block_iteration_is_blocklimit_invariant() {
        let postings: Vec<(DocId, f32, &[u8], u32)> = (0..57)
            .map(|i| (i * 3 + 1, (i % 5) as f32 + 0.5, &b"xy"[..], i + 2))
            .collect();
        let format = PostFormat::fixed(2);

        let mut runs: Vec<Vec<(DocId, f32, Vec<u8>)>> = Vec::new();
        for blocklimit in [4usize, 16, 128] {
            let tmp = TempDir::new().unwrap();
            let path = tmp.path().join("p.pst");
            let terminfo = write_term(&path, &postings, format, blocklimit, 1);
            assert_eq!(57, terminfo.doc_freq);

            let mut m = open_matcher(&path, &terminfo, format);
            let mut got = Vec::new();
            while m.is_active() {
                got.push((m.id().unwrap(), m.weight().unwrap(), m.value().unwrap()));
                let _ = m.next();
            }
            runs.push(got);
        }
        assert_eq!(runs[0], runs[1]);
        assert_eq!(runs[1], runs[2]);
        assert_eq!(57, runs[0].len());
        assert_eq!(1, runs[0][0].0);
    }

    #[test]
    fn skip_to_lands_on_block_boundary() {
        // Seed scenario: ids in three blocks of three.
        let ids = [1u32, 2, 3, 50, 51, 52, 100, 101, 102];
        let postings: Vec<(DocId, f32, &[u8], u32)> =
            ids.iter().map(|&id| (id, 1.0, &b""[..], 1)).collect();
        let format = PostFormat::no_values();
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("skip.pst");
        let terminfo = write_term(&path, &postings, format, 3, 1);

        let mut m = open_matcher(&path, &terminfo, format);
        m.skip_to(50).unwrap();
        assert_eq!(50, m.id().unwrap());

        m.skip_to(101).unwrap();
        assert_eq!(101, m.id().unwrap());

        // Skipping past the end leaves the matcher inactive.
        m.skip_to(1000).unwrap();
        assert!(!m.is_active());
        match m.id() {
            Err(Error::ReadPastEnd) => {}
            other => panic!("expected ReadPastEnd, got {:?}", other),
        }
    }

    #[test]
    fn skip_to_quality_consults_block_stats() {
        // Three blocks with max weights 2.0, 9.0, 4.0.
        let mut postings: Vec<(DocId, f32, &[u8], u32)> = Vec::new();
        for (block, &maxw) in [2.0f32, 9.0, 4.0].iter().enumerate() {
            for i in 0..4u32 {
                let id = (block as u32) * 10 + i + 1;
                let w = if i == 3 { maxw } else { 1.0 };
                postings.push((id, w, b"", 1));
            }
        }
        let format = PostFormat::no_values();
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("q.pst");
        let terminfo = write_term(&path, &postings, format, 4, 1);
        assert_eq!(9.0, terminfo.max_weight);

        let mut m = open_matcher(&path, &terminfo, format);
        let skipped = m.skip_to_quality(3.0).unwrap();
        assert_eq!(1, skipped);
        assert_eq!(11, m.id().unwrap());

        // Already above the bar: no movement.
        assert_eq!(0, m.skip_to_quality(3.0).unwrap());
        assert_eq!(11, m.id().unwrap());
    }

    #[test]
    fn inline_round_trip() {
        // Seed scenario: one posting with inline_limit=1 never touches
        // the posting file.
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("inline.pst");
        let format = PostFormat::no_values();
        let terminfo = write_term(&path, &[(7, 1.0, b"", 1)], format, 128, 1);

        assert!(terminfo.is_inlined());
        let (ids, weights, values) = terminfo.inlined_postings().unwrap();
        assert_eq!(&[7][..], ids);
        assert_eq!(&[1.0][..], weights);
        assert_eq!(vec![Vec::<u8>::new()], values);

        // No block magic was written for this term.
        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(0, len);

        let mut m = InlineMatcher::new(ids.to_vec(), weights.to_vec(), values.to_vec(), 1, None);
        assert!(m.is_active());
        assert_eq!(7, m.id().unwrap());
        assert_eq!(1.0, m.weight().unwrap());
        m.next().unwrap();
        assert!(!m.is_active());
    }

    #[test]
    fn two_postings_overflow_inline_limit() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("two.pst");
        let format = PostFormat::no_values();
        let terminfo = write_term(&path, &[(3, 1.0, b"", 1), (9, 2.0, b"", 1)], format, 128, 1);
        assert!(!terminfo.is_inlined());
        let (offset, _) = terminfo.extent().unwrap();
        assert_eq!(0, offset);

        let mut m = open_matcher(&path, &terminfo, format);
        assert_eq!(3, m.id().unwrap());
        m.next().unwrap();
        assert_eq!(9, m.id().unwrap());
        assert_eq!(2.0, m.weight().unwrap());
    }

    #[test]
    fn variable_values_round_trip_compressed() {
        let values: Vec<Vec<u8>> = (0..40u32)
            .map(|i| format!("payload-{:04}", i).into_bytes())
            .collect();
        let postings: Vec<(DocId, f32, &[u8], u32)> = values
            .iter()
            .enumerate()
            .map(|(i, v)| (i as u32 * 2 + 1, 1.0, v.as_slice(), 3))
            .collect();
        let format = PostFormat::variable();
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("vals.pst");
        let terminfo = write_term(&path, &postings, format, 16, 1);

        let mut m = open_matcher(&path, &terminfo, format);
        for v in &values {
            assert_eq!(*v, m.value().unwrap());
            let _ = m.next();
        }
        assert!(!m.is_active());
    }

    #[test]
    fn writer_rejects_out_of_order_ids() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ord.pst");
        let mut postfile = CountingFileWriter::create(&path).unwrap();
        let mut writer = PostingsWriter::new(PostFormat::no_values());
        writer.start_postings(&postfile).unwrap();
        writer
            .add_posting(&mut postfile, 10, 1.0, b"", None)
            .unwrap();
        match writer.add_posting(&mut postfile, 10, 1.0, b"", None) {
            Err(Error::OrderViolation(_)) => {}
            other => panic!("expected OrderViolation, got {:?}", other),
        }
    }

    #[test]
    fn byte_id_postings_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("vec.pst");
        let format = PostFormat::variable();
        let items: Vec<(&[u8], f32, &[u8])> = vec![
            (b"alpha", 2.0, b"a-data"),
            (b"beta", 1.0, b""),
            (b"gamma", 4.5, b"g"),
        ];
        let terminfo;
        {
            let mut postfile = CountingFileWriter::create(&path).unwrap();
            // Reserve offset zero, as the vector file does.
            postfile.write_all(b"VPST").unwrap();
            let mut writer = PostingsWriter::new(format).byte_ids();
            writer.start_postings(&postfile).unwrap();
            for &(id, w, v) in &items {
                writer.add_byte_posting(&mut postfile, id, w, v).unwrap();
            }
            terminfo = writer.finish_postings(&mut postfile).unwrap();
            postfile.finish().unwrap();
        }
        let (offset, length) = terminfo.extent().unwrap();
        assert_eq!(4, offset);
        let source = ValueEntry::whole_file(open_mmap_file(&path).unwrap());
        let mut m = VectorMatcher::new(source, offset, length, format).unwrap();
        let got = m.read_all().unwrap();
        assert_eq!(3, got.len());
        for ((id, w, v), (eid, ew, ev)) in got.iter().zip(items.iter()) {
            assert_eq!(id.as_slice(), *eid);
            assert_eq!(w, ew);
            assert_eq!(v.as_slice(), *ev);
        }
    }

    #[test]
    fn weights_elided_when_all_one() {
        let (flags, bytes) = encode_weights(&[1.0, 1.0, 1.0]);
        assert_eq!(WEIGHTS_ALL_ONE, flags);
        assert!(bytes.is_empty());
        assert_eq!(
            vec![1.0, 1.0, 1.0],
            decode_weights(&bytes, 3, flags).unwrap()
        );

        let (flags, bytes) = encode_weights(&[2.5, 2.5]);
        assert_eq!(WEIGHTS_UNIFORM, flags);
        assert_eq!(4, bytes.len());
        assert_eq!(vec![2.5, 2.5], decode_weights(&bytes, 2, flags).unwrap());

        let (flags, bytes) = encode_weights(&[1.0, 2.0]);
        assert_eq!(0, flags);
        assert_eq!(8, bytes.len());
    }
}
