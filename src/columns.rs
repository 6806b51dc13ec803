//! Per-document column files. A fixed column stores one `width`-byte cell
//! per document (length bytes, vector offsets); a variable column stores
//! blobs addressed through an offset array in the trailer (stored
//! fields). Rows may be added sparsely in ascending doc order; gaps read
//! back as zero cells or empty blobs, which double as the "absent"
//! sentinel.

use crate::io_helper::{
    open_mmap_file, CountingFileWriter, DataInputStream, SliceInputStream, ValueEntry,
};
use crate::{DocId, Error};
use std::convert::TryInto;
use std::io::Write;
use std::path::Path;

pub const FIXED_COLUMN_MAGIC: &[u8; 4] = b"COLF";
pub const VAR_COLUMN_MAGIC: &[u8; 4] = b"COLV";

/// One cell of exactly `width` bytes per document.
pub struct FixedColumnWriter {
    file: CountingFileWriter,
    width: usize,
    rows: u32,
}

impl FixedColumnWriter {
    pub fn create(path: &Path, width: usize) -> Result<Self, Error> {
        let mut file = CountingFileWriter::create(path)?;
        file.write_all(FIXED_COLUMN_MAGIC)?;
        file.write_byte(width as u8)?;
        Ok(FixedColumnWriter {
            file,
            width,
            rows: 0,
        })
    }

    /// Add a cell for `docnum`, zero-filling any skipped documents.
    pub fn add(&mut self, docnum: DocId, cell: &[u8]) -> Result<(), Error> {
        if cell.len() != self.width {
            return Err(Error::InvalidValue(format!(
                "cell of {} bytes in a column of width {}",
                cell.len(),
                self.width
            )));
        }
        if docnum < self.rows {
            return Err(Error::OrderViolation(format!(
                "column rows must ascend: {}..{}",
                self.rows, docnum
            )));
        }
        while self.rows < docnum {
            self.file.write_all(&vec![0u8; self.width])?;
            self.rows += 1;
        }
        self.file.write_all(cell)?;
        self.rows += 1;
        Ok(())
    }

    /// Pad out to the segment's doc count and seal the file.
    pub fn finish(mut self, doc_count: u32) -> Result<(), Error> {
        while self.rows < doc_count {
            self.file.write_all(&vec![0u8; self.width])?;
            self.rows += 1;
        }
        self.file.write_u32(self.rows)?;
        self.file.finish()?;
        Ok(())
    }
}

pub struct FixedColumnReader {
    data: ValueEntry,
    width: usize,
    rows: u32,
}

impl FixedColumnReader {
    pub fn open(path: &Path) -> Result<Self, Error> {
        Self::from_entry(ValueEntry::whole_file(open_mmap_file(path)?))
    }

    pub fn from_entry(data: ValueEntry) -> Result<Self, Error> {
        let bytes = data.as_bytes();
        if bytes.len() < 9 {
            return Err(Error::Corrupt("fixed column too short".into()));
        }
        if &bytes[0..4] != FIXED_COLUMN_MAGIC {
            return Err(Error::BadMagic([bytes[0], bytes[1], bytes[2], bytes[3]]));
        }
        let width = bytes[4] as usize;
        let rows = u32::from_be_bytes(bytes[bytes.len() - 4..].try_into().unwrap());
        if 5 + rows as usize * width + 4 != bytes.len() {
            return Err(Error::Corrupt("fixed column size mismatch".into()));
        }
        Ok(FixedColumnReader { data, width, rows })
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    /// The raw cell, or None past the column's end.
    pub fn cell(&self, docnum: DocId) -> Option<&[u8]> {
        if docnum >= self.rows {
            return None;
        }
        let start = 5 + docnum as usize * self.width;
        Some(&self.data.as_bytes()[start..start + self.width])
    }

    pub fn cell_u8(&self, docnum: DocId) -> Option<u8> {
        self.cell(docnum).map(|c| c[0])
    }

    pub fn cell_u32(&self, docnum: DocId) -> Option<u32> {
        self.cell(docnum)
            .map(|c| u32::from_be_bytes(c.try_into().unwrap()))
    }

    pub fn cell_u64(&self, docnum: DocId) -> Option<u64> {
        self.cell(docnum)
            .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
    }

    pub fn iter_u8(&self) -> impl Iterator<Item = u8> + '_ {
        (0..self.rows).filter_map(move |d| self.cell_u8(d))
    }
}

/// One variable-length blob per document; offsets live in the trailer.
pub struct VarColumnWriter {
    file: CountingFileWriter,
    offsets: Vec<u64>,
    rows: u32,
}

impl VarColumnWriter {
    pub fn create(path: &Path) -> Result<Self, Error> {
        let mut file = CountingFileWriter::create(path)?;
        file.write_all(VAR_COLUMN_MAGIC)?;
        Ok(VarColumnWriter {
            file,
            offsets: Vec::new(),
            rows: 0,
        })
    }

    pub fn add(&mut self, docnum: DocId, blob: &[u8]) -> Result<(), Error> {
        if docnum < self.rows {
            return Err(Error::OrderViolation(format!(
                "column rows must ascend: {}..{}",
                self.rows, docnum
            )));
        }
        while self.rows < docnum {
            self.offsets.push(self.file.tell());
            self.rows += 1;
        }
        self.offsets.push(self.file.tell());
        self.file.write_all(blob)?;
        self.rows += 1;
        Ok(())
    }

    pub fn finish(mut self, doc_count: u32) -> Result<(), Error> {
        while self.rows < doc_count {
            self.offsets.push(self.file.tell());
            self.rows += 1;
        }
        // Final sentinel offset marks the end of the last blob.
        self.offsets.push(self.file.tell());

        let offsets_pos = self.file.tell();
        for &offset in &self.offsets {
            self.file.write_u64(offset)?;
        }
        self.file.write_u64(offsets_pos)?;
        self.file.write_u32(self.rows)?;
        self.file.finish()?;
        Ok(())
    }
}

pub struct VarColumnReader {
    data: ValueEntry,
    offsets_pos: usize,
    rows: u32,
}

impl VarColumnReader {
    pub fn open(path: &Path) -> Result<Self, Error> {
        Self::from_entry(ValueEntry::whole_file(open_mmap_file(path)?))
    }

    pub fn from_entry(data: ValueEntry) -> Result<Self, Error> {
        let bytes = data.as_bytes();
        if bytes.len() < 16 {
            return Err(Error::Corrupt("variable column too short".into()));
        }
        if &bytes[0..4] != VAR_COLUMN_MAGIC {
            return Err(Error::BadMagic([bytes[0], bytes[1], bytes[2], bytes[3]]));
        }
        let mut trailer = SliceInputStream::new(&bytes[bytes.len() - 12..]);
        let offsets_pos = trailer.read_u64()? as usize;
        let rows = trailer.read_u32()?;
        if offsets_pos + (rows as usize + 1) * 8 + 12 != bytes.len() {
            return Err(Error::Corrupt("variable column trailer mismatch".into()));
        }
        Ok(VarColumnReader {
            data,
            offsets_pos,
            rows,
        })
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    fn offset_at(&self, i: usize) -> u64 {
        let start = self.offsets_pos + i * 8;
        u64::from_be_bytes(
            self.data.as_bytes()[start..start + 8]
                .try_into()
                .unwrap(),
        )
    }

    /// The blob for `docnum`; empty means the document has none.
    pub fn blob(&self, docnum: DocId) -> Option<&[u8]> {
        if docnum >= self.rows {
            return None;
        }
        let start = self.offset_at(docnum as usize) as usize;
        let end = self.offset_at(docnum as usize + 1) as usize;
        Some(&self.data.as_bytes()[start..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fixed_column_with_gaps() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("len.col");
        {
            let mut w = FixedColumnWriter::create(&path, 1).unwrap();
            w.add(0, &[42]).unwrap();
            w.add(3, &[99]).unwrap();
            w.finish(6).unwrap();
        }
        let r = FixedColumnReader::open(&path).unwrap();
        assert_eq!(6, r.rows());
        assert_eq!(Some(42), r.cell_u8(0));
        assert_eq!(Some(0), r.cell_u8(1));
        assert_eq!(Some(0), r.cell_u8(2));
        assert_eq!(Some(99), r.cell_u8(3));
        assert_eq!(Some(0), r.cell_u8(5));
        assert_eq!(None, r.cell_u8(6));
    }

    #[test]
    fn fixed_column_u64_cells() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("vec.col");
        {
            let mut w = FixedColumnWriter::create(&path, 8).unwrap();
            w.add(1, &0xDEAD_BEEF_u64.to_be_bytes()).unwrap();
            w.finish(2).unwrap();
        }
        let r = FixedColumnReader::open(&path).unwrap();
        assert_eq!(Some(0), r.cell_u64(0));
        assert_eq!(Some(0xDEAD_BEEF), r.cell_u64(1));
    }

    #[test]
    fn fixed_column_rejects_regression() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.col");
        let mut w = FixedColumnWriter::create(&path, 1).unwrap();
        w.add(5, &[1]).unwrap();
        match w.add(5, &[2]) {
            Err(Error::OrderViolation(_)) => {}
            other => panic!("expected OrderViolation, got {:?}", other),
        }
    }

    #[test]
    fn var_column_blobs() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("stored.col");
        {
            let mut w = VarColumnWriter::create(&path).unwrap();
            w.add(0, b"first doc").unwrap();
            w.add(2, b"third").unwrap();
            w.finish(4).unwrap();
        }
        let r = VarColumnReader::open(&path).unwrap();
        assert_eq!(4, r.rows());
        assert_eq!(Some(&b"first doc"[..]), r.blob(0));
        assert_eq!(Some(&b""[..]), r.blob(1));
        assert_eq!(Some(&b"third"[..]), r.blob(2));
        assert_eq!(Some(&b""[..]), r.blob(3));
        assert_eq!(None, r.blob(4));
    }
}
