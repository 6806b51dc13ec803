//! Compound segment files: a closed segment's loose files concatenated
//! into one `.seg` file with a JSON table of contents, so a segment costs
//! one file handle instead of half a dozen. Readers open members as mmap
//! slices; the loose files can be deleted after conversion.
//!
//! Layout: `"SCF1"` magic, `u32` version, `u64` TOC offset (patched at
//! close), member bodies back to back, then the JSON TOC.

use crate::io_helper::{open_mmap_file, CountingFileWriter, DataInputStream, SliceInputStream, ValueEntry};
use crate::Error;
use fnv::FnvHashMap as HashMap;
use log::debug;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

pub const COMPOUND_MAGIC: &[u8; 4] = b"SCF1";
pub const COMPOUND_VERSION: u32 = 1;
pub const COMPOUND_EXT: &str = "seg";

const HEADER_SIZE: usize = 4 + 4 + 8;
const TOC_OFFSET_POS: u64 = 4 + 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TocEntry {
    offset: u64,
    length: u64,
}

/// Concatenate `names` (paths relative to `dir`) into `target`. Inputs
/// with the compound extension are refused: a compound file never nests.
pub fn write_compound(dir: &Path, names: &[String], target: &Path) -> Result<(), Error> {
    for name in names {
        if name.ends_with(&format!(".{}", COMPOUND_EXT)) {
            return Err(Error::InvalidValue(format!(
                "refusing to pack compound file {:?} into a compound file",
                name
            )));
        }
    }

    let mut out = CountingFileWriter::create(target)?;
    out.write_all(COMPOUND_MAGIC)?;
    out.write_u32(COMPOUND_VERSION)?;
    out.write_u64(0)?; // TOC offset, patched below

    let mut toc: HashMap<String, TocEntry> = HashMap::default();
    for name in names {
        let offset = out.tell();
        let mut input = File::open(dir.join(name))?;
        let length = io::copy(&mut input, &mut out)?;
        toc.insert(name.clone(), TocEntry { offset, length });
    }

    let toc_start = out.tell();
    let toc_bytes = serde_json::to_vec(&toc)?;
    out.write_all(&toc_bytes)?;
    out.patch_u64(TOC_OFFSET_POS, toc_start)?;
    out.finish()?;
    debug!("compound {:?}: {} members", target, names.len());
    Ok(())
}

pub struct CompoundReader {
    data: ValueEntry,
    toc: HashMap<String, TocEntry>,
}

impl CompoundReader {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let data = ValueEntry::whole_file(open_mmap_file(path)?);
        let bytes = data.as_bytes();
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Corrupt("compound file too short".into()));
        }
        if &bytes[0..4] != COMPOUND_MAGIC {
            return Err(Error::BadMagic([bytes[0], bytes[1], bytes[2], bytes[3]]));
        }
        let mut header = SliceInputStream::new(&bytes[4..HEADER_SIZE]);
        let version = header.read_u32()?;
        if version != COMPOUND_VERSION {
            return Err(Error::UnsupportedVersion(format!(
                "compound version {}",
                version
            )));
        }
        let toc_start = header.read_u64()? as usize;
        if toc_start < HEADER_SIZE || toc_start > bytes.len() {
            return Err(Error::Corrupt("compound TOC out of bounds".into()));
        }
        let toc: HashMap<String, TocEntry> = serde_json::from_slice(&bytes[toc_start..])?;
        Ok(CompoundReader { data, toc })
    }

    pub fn member_names(&self) -> impl Iterator<Item = &str> {
        self.toc.keys().map(|s| s.as_str())
    }

    pub fn has_member(&self, name: &str) -> bool {
        self.toc.contains_key(name)
    }

    /// The member's bytes as a slice of the shared mmap.
    pub fn member(&self, name: &str) -> Option<ValueEntry> {
        let entry = self.toc.get(name)?;
        Some(
            self.data
                .slice(entry.offset as usize, (entry.offset + entry.length) as usize),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn compound_round_trip() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.trm"), b"term index bytes").unwrap();
        fs::write(tmp.path().join("a.pst"), b"posting bytes, longer").unwrap();
        fs::write(tmp.path().join("a.body_len.col"), b"").unwrap();

        let names = vec![
            "a.trm".to_string(),
            "a.pst".to_string(),
            "a.body_len.col".to_string(),
        ];
        let target = tmp.path().join("a.seg");
        write_compound(tmp.path(), &names, &target).unwrap();

        let reader = CompoundReader::open(&target).unwrap();
        assert!(reader.has_member("a.trm"));
        assert!(!reader.has_member("a.vps"));
        assert_eq!(
            b"term index bytes",
            reader.member("a.trm").unwrap().as_bytes()
        );
        assert_eq!(
            b"posting bytes, longer",
            reader.member("a.pst").unwrap().as_bytes()
        );
        assert_eq!(0, reader.member("a.body_len.col").unwrap().len());
    }

    #[test]
    fn compound_refuses_nesting() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.seg"), b"whatever").unwrap();
        let target = tmp.path().join("b.seg");
        match write_compound(tmp.path(), &["a.seg".to_string()], &target) {
            Err(Error::InvalidValue(_)) => {}
            other => panic!("expected InvalidValue, got {:?}", other),
        }
    }
}
