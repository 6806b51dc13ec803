//! Per-term statistics plus the pointer to (or an inline copy of) the
//! term's posting list. The fixed header packs lengths through the
//! one-byte codec and encodes absent ids with an out-of-band sentinel, so
//! scorers can read bounds without touching the posting file.

use crate::io_helper::{DataInputStream, InputStream, SliceInputStream};
use crate::numeric::{byte_to_length, length_bound_to_byte, length_to_byte, write_vbyte};
use crate::postings::{decode_doc_ids, decode_values, decode_weights, encode_doc_ids, encode_weights, encode_values, PostFormat};
use crate::{DocId, Error, NO_ID};

const INLINED_FLAG: u8 = 1;

#[derive(Debug, Clone, PartialEq)]
enum Payload {
    /// Still accumulating; never serialized.
    Empty,
    Extent { offset: u64, length: u32 },
    Inlined {
        ids: Vec<DocId>,
        weights: Vec<f32>,
        values: Vec<Vec<u8>>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TermInfo {
    /// Total weight across all postings.
    pub weight: f32,
    pub doc_freq: u32,
    pub min_length: Option<u32>,
    pub max_length: u32,
    pub max_weight: f32,
    pub min_id: Option<DocId>,
    pub max_id: Option<DocId>,
    payload: Payload,
}

impl TermInfo {
    pub fn new() -> TermInfo {
        TermInfo {
            weight: 0.0,
            doc_freq: 0,
            min_length: None,
            max_length: 0,
            max_weight: 0.0,
            min_id: None,
            max_id: None,
            payload: Payload::Empty,
        }
    }

    pub fn set_extent(&mut self, offset: u64, length: u32) {
        debug_assert!(matches!(self.payload, Payload::Empty));
        self.payload = Payload::Extent { offset, length };
    }

    pub fn set_inlined(&mut self, ids: Vec<DocId>, weights: Vec<f32>, values: Vec<Vec<u8>>) {
        debug_assert!(matches!(self.payload, Payload::Empty));
        self.payload = Payload::Inlined {
            ids,
            weights,
            values,
        };
    }

    pub fn is_inlined(&self) -> bool {
        matches!(self.payload, Payload::Inlined { .. })
    }

    pub fn extent(&self) -> Option<(u64, u32)> {
        match &self.payload {
            Payload::Extent { offset, length } => Some((*offset, *length)),
            _ => None,
        }
    }

    pub fn inlined_postings(&self) -> Option<(&[DocId], &[f32], &[Vec<u8>])> {
        match &self.payload {
            Payload::Inlined {
                ids,
                weights,
                values,
            } => Some((ids, weights, values)),
            _ => None,
        }
    }

    /// Consume the inline payload for building a matcher.
    pub fn into_inlined(self) -> Option<(Vec<DocId>, Vec<f32>, Vec<Vec<u8>>)> {
        match self.payload {
            Payload::Inlined {
                ids,
                weights,
                values,
            } => Some((ids, weights, values)),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(32);
        let inlined = match &self.payload {
            Payload::Empty => {
                return Err(Error::InvalidValue(
                    "term info has neither extent nor inlined postings".into(),
                ))
            }
            Payload::Extent { .. } => false,
            Payload::Inlined { .. } => true,
        };
        out.push(if inlined { INLINED_FLAG } else { 0 });
        out.extend_from_slice(&self.weight.to_be_bytes());
        out.extend_from_slice(&self.doc_freq.to_be_bytes());
        out.push(self.min_length.map(length_to_byte).unwrap_or(0));
        out.push(length_bound_to_byte(self.max_length));
        out.extend_from_slice(&self.max_weight.to_be_bytes());
        out.extend_from_slice(&self.min_id.unwrap_or(NO_ID).to_be_bytes());
        out.extend_from_slice(&self.max_id.unwrap_or(NO_ID).to_be_bytes());

        match &self.payload {
            Payload::Extent { offset, length } => {
                out.extend_from_slice(&offset.to_be_bytes());
                out.extend_from_slice(&(*length as i32).to_be_bytes());
            }
            Payload::Inlined {
                ids,
                weights,
                values,
            } => {
                // Inline lists are tiny; values always length-prefixed.
                let ids_bytes = encode_doc_ids(ids);
                let (wflags, weight_bytes) = encode_weights(weights);
                let value_bytes = encode_values(values, PostFormat::variable())?;
                out.push(wflags);
                write_vbyte(ids.len() as u64, &mut out)?;
                write_vbyte(ids_bytes.len() as u64, &mut out)?;
                write_vbyte(weight_bytes.len() as u64, &mut out)?;
                out.extend_from_slice(&ids_bytes);
                out.extend_from_slice(&weight_bytes);
                out.extend_from_slice(&value_bytes);
            }
            Payload::Empty => unreachable!(),
        }
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<TermInfo, Error> {
        let mut input = SliceInputStream::new(bytes);
        let flags = input.get()?;
        let weight = input.read_f32()?;
        let doc_freq = input.read_u32()?;
        let min_length_byte = input.get()?;
        let max_length_byte = input.get()?;
        let max_weight = input.read_f32()?;
        let min_id = match input.read_u32()? {
            NO_ID => None,
            id => Some(id),
        };
        let max_id = match input.read_u32()? {
            NO_ID => None,
            id => Some(id),
        };

        let payload = if flags & INLINED_FLAG != 0 {
            let wflags = input.get()?;
            let count = input.read_vbyte()? as usize;
            let ids_len = input.read_vbyte()? as usize;
            let weights_len = input.read_vbyte()? as usize;
            let ids = decode_doc_ids(input.read_bytes(ids_len)?, count)?;
            let weights = decode_weights(input.read_bytes(weights_len)?, count, wflags)?;
            let rest = &bytes[input.tell()..];
            let values = decode_values(rest, count, PostFormat::variable())?;
            Payload::Inlined {
                ids,
                weights,
                values,
            }
        } else {
            let offset = input.read_u64()?;
            let length = input.read_i32()?;
            if length < 0 {
                return Err(Error::Corrupt("negative posting extent".into()));
            }
            Payload::Extent {
                offset,
                length: length as u32,
            }
        };

        Ok(TermInfo {
            weight,
            doc_freq,
            min_length: if min_length_byte == 0 {
                None
            } else {
                Some(byte_to_length(min_length_byte))
            },
            max_length: byte_to_length(max_length_byte),
            max_weight,
            min_id,
            max_id,
            payload,
        })
    }

    /// Peek the total weight without parsing the rest of the record.
    pub fn read_weight(bytes: &[u8]) -> Result<f32, Error> {
        let mut input = SliceInputStream::new(bytes);
        let _flags = input.get()?;
        input.read_f32()
    }

    /// Peek the document frequency without parsing the rest of the record.
    pub fn read_doc_freq(bytes: &[u8]) -> Result<u32, Error> {
        let mut input = SliceInputStream::new(bytes);
        let _flags = input.get()?;
        let _weight = input.read_f32()?;
        input.read_u32()
    }
}

impl Default for TermInfo {
    fn default() -> Self {
        TermInfo::new()
    }
}
