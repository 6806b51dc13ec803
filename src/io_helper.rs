use crate::Error;
use memmap::{Mmap, MmapOptions};
use std::path::Path;
use std::sync::Arc;
use std::{cmp::Ordering, str};
use std::{convert::TryInto, fs::File};
use std::{fmt, io};
use std::{
    fs,
    io::{Seek, SeekFrom, Write},
};

pub fn open_mmap_file(path: &Path) -> Result<Arc<Mmap>, Error> {
    let file = fs::File::open(path)?;
    let opts = MmapOptions::new();
    let mmap: Mmap = unsafe { opts.map(&file)? };
    Ok(Arc::new(mmap))
}

/// A byte range inside a shared mmap; how readers hand out file regions
/// without copying. A whole file is the degenerate case.
#[derive(Debug, Clone)]
pub struct ValueEntry {
    pub source: Arc<Mmap>,
    pub start: usize,
    pub end: usize,
}

impl ValueEntry {
    pub fn whole_file(source: Arc<Mmap>) -> ValueEntry {
        let end = source.len();
        ValueEntry {
            source,
            start: 0,
            end,
        }
    }
    pub fn len(&self) -> usize {
        self.end - self.start
    }
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
    pub fn as_bytes(&self) -> &[u8] {
        &self.source[self.start..self.end]
    }
    pub fn to_str(&self) -> Result<&str, Error> {
        Ok(std::str::from_utf8(self.as_bytes())?)
    }
    pub fn stream(&self) -> SliceInputStream {
        SliceInputStream::new(self.as_bytes())
    }
    /// A sub-range, relative to this entry's start.
    pub fn slice(&self, start: usize, end: usize) -> ValueEntry {
        debug_assert!(start <= end);
        debug_assert!(self.start + end <= self.end);
        ValueEntry {
            source: self.source.clone(),
            start: self.start + start,
            end: self.start + end,
        }
    }
    pub fn substream(&self, start: usize, end: usize) -> ArcInputStream {
        let sub_start = self.start + start;
        let sub_end = self.start + end;
        debug_assert!(sub_start <= sub_end);
        debug_assert!(sub_end <= self.end);
        ArcInputStream::new(self.source.clone(), sub_start, sub_end)
    }
}

/// An owned boxed key; hashable, comparable to borrowed slices.
#[derive(Hash, Eq, PartialEq, Clone, Ord, PartialOrd)]
pub struct Bytes {
    pub data: Box<[u8]>,
}
impl Bytes {
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    pub fn from_slice(input: &[u8]) -> Self {
        let mut tmp = Vec::new();
        tmp.reserve_exact(input.len());
        tmp.extend_from_slice(input);
        Self {
            data: tmp.into_boxed_slice(),
        }
    }
    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_ref()
    }
    /// Compare to another byte slice somewhere else.
    pub fn compare(&self, rhs: &[u8]) -> Ordering {
        self.data.as_ref().cmp(rhs)
    }
}
impl fmt::Debug for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Ok(readable) = str::from_utf8(&self.data) {
            write!(f, "{}", readable)
        } else {
            write!(f, "{:?}", &self.data)
        }
    }
}

pub trait InputStream {
    fn tell(&self) -> usize;
    fn eof(&self) -> bool;
    fn advance(&mut self, n: usize) -> Result<&[u8], Error>;
    fn get(&mut self) -> Result<u8, Error>;
}

pub trait DataInputStream {
    fn read_vbyte(&mut self) -> Result<u64, Error>;
    fn read_u64(&mut self) -> Result<u64, Error>;
    fn read_u32(&mut self) -> Result<u32, Error>;
    fn read_i32(&mut self) -> Result<i32, Error>;
    fn read_u16(&mut self) -> Result<u16, Error>;
    fn read_f32(&mut self) -> Result<f32, Error>;
}

impl<I> DataInputStream for I
where
    I: InputStream,
{
    /// Our vbyte: highest-bit set means stop.
    fn read_vbyte(&mut self) -> Result<u64, Error> {
        let mut result: u64 = 0;
        let mut bit_p: u8 = 0;
        while !self.eof() {
            let byte = self.get()? as u64;
            if byte & 0x80 > 0 {
                result |= (byte & 0x7f) << bit_p;
                return Ok(result);
            }
            result |= byte << bit_p;
            bit_p += 7;
        }
        Err(Error::InternalSizeErr)
    }
    fn read_u64(&mut self) -> Result<u64, Error> {
        let exact = self.advance(8)?;
        Ok(u64::from_be_bytes(exact.try_into().unwrap()))
    }
    fn read_u32(&mut self) -> Result<u32, Error> {
        let exact = self.advance(4)?;
        Ok(u32::from_be_bytes(exact.try_into().unwrap()))
    }
    fn read_i32(&mut self) -> Result<i32, Error> {
        let exact = self.advance(4)?;
        Ok(i32::from_be_bytes(exact.try_into().unwrap()))
    }
    fn read_u16(&mut self) -> Result<u16, Error> {
        let exact = self.advance(2)?;
        Ok(u16::from_be_bytes(exact.try_into().unwrap()))
    }
    fn read_f32(&mut self) -> Result<f32, Error> {
        let exact = self.advance(4)?;
        Ok(f32::from_be_bytes(exact.try_into().unwrap()))
    }
}

// Zero-Copy InputStream
#[derive(Clone)]
pub struct SliceInputStream<'src> {
    data: &'src [u8],
    /// This supports rewinding and "telling" how far we've read.
    position: usize,
}

impl fmt::Debug for SliceInputStream<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SliceInputStream[@{}..{}]",
            self.position,
            self.data.len()
        )
    }
}

impl<'src> InputStream for SliceInputStream<'src> {
    fn tell(&self) -> usize {
        self.position
    }
    fn eof(&self) -> bool {
        self.position >= self.data.len()
    }
    fn advance(&mut self, n: usize) -> Result<&[u8], Error> {
        self.consume(n)
    }
    fn get(&mut self) -> Result<u8, Error> {
        if self.position >= self.data.len() {
            Err(Error::InternalSizeErr)
        } else {
            let result = Ok(self.data[self.position]);
            self.position += 1;
            result
        }
    }
}

impl<'src> SliceInputStream<'src> {
    pub fn new(data: &'src [u8]) -> Self {
        Self { data, position: 0 }
    }
    pub fn peek(&self) -> Option<u8> {
        if self.position < self.data.len() {
            Some(self.data[self.position])
        } else {
            None
        }
    }
    pub fn seek(&mut self, position: usize) -> Result<(), Error> {
        self.position = position;
        if self.position <= self.data.len() {
            Ok(())
        } else {
            Err(Error::InternalSizeErr)
        }
    }
    #[inline]
    pub fn consume(&mut self, n: usize) -> Result<&'src [u8], Error> {
        let end = self.position + n;
        if end > self.data.len() {
            return Err(Error::InternalSizeErr);
        }
        let found = &self.data[self.position..end];
        self.position = end;
        Ok(found)
    }
    pub fn read_bytes(&mut self, n: usize) -> Result<&'src [u8], Error> {
        self.consume(n)
    }
}

/// A window into a shared mmap, streamed independently of other readers.
#[derive(Debug, Clone)]
pub struct ArcInputStream {
    source: Arc<Mmap>,
    start: usize,
    end: usize,
    offset: usize,
}

impl ArcInputStream {
    pub fn from_mmap(source: Arc<Mmap>) -> Self {
        let end = source.len();
        Self {
            source,
            start: 0,
            end,
            offset: 0,
        }
    }
    pub fn new(source: Arc<Mmap>, start: usize, end: usize) -> Self {
        Self {
            source,
            start,
            end,
            offset: 0,
        }
    }
}

impl InputStream for ArcInputStream {
    fn tell(&self) -> usize {
        self.offset
    }
    fn eof(&self) -> bool {
        self.offset + self.start >= self.end
    }
    fn advance(&mut self, n: usize) -> Result<&[u8], Error> {
        let lhs = self.start + self.offset;
        let rhs = lhs + n;
        self.offset += n;
        if rhs > self.end {
            return Err(Error::InternalSizeErr);
        }
        Ok(&self.source[lhs..rhs])
    }
    fn get(&mut self) -> Result<u8, Error> {
        if self.eof() {
            Err(Error::InternalSizeErr)
        } else {
            let b = self.source[self.start + self.offset];
            self.offset += 1;
            Ok(b)
        }
    }
}

/// Buffered file writer that knows its own offset, so table writers can
/// record record positions without a syscall per `tell`.
pub struct CountingFileWriter {
    file: io::BufWriter<File>,
    written: u64,
}

impl CountingFileWriter {
    pub fn create(path: &Path) -> Result<Self, Error> {
        Ok(Self::new(File::create(path)?))
    }
    pub fn new(file: File) -> Self {
        Self {
            file: io::BufWriter::new(file),
            written: 0,
        }
    }
    pub fn tell(&self) -> u64 {
        self.written
    }
    pub fn write_byte(&mut self, b: u8) -> io::Result<()> {
        self.written += 1;
        self.file.write_all(&[b])
    }
    pub fn write_u16(&mut self, x: u16) -> io::Result<()> {
        self.written += 2;
        self.file.write_all(&x.to_be_bytes())
    }
    pub fn write_u32(&mut self, x: u32) -> io::Result<()> {
        self.written += 4;
        self.file.write_all(&x.to_be_bytes())
    }
    pub fn write_i32(&mut self, x: i32) -> io::Result<()> {
        self.written += 4;
        self.file.write_all(&x.to_be_bytes())
    }
    pub fn write_u64(&mut self, x: u64) -> io::Result<()> {
        self.written += 8;
        self.file.write_all(&x.to_be_bytes())
    }
    pub fn write_f32(&mut self, x: f32) -> io::Result<()> {
        self.written += 4;
        self.file.write_all(&x.to_be_bytes())
    }
    /// The single permitted seek-back: patch a header pointer in place.
    /// Returns to the previous end of file afterward.
    pub fn patch_u64(&mut self, position: u64, value: u64) -> io::Result<()> {
        self.file.flush()?;
        let inner = self.file.get_mut();
        inner.seek(SeekFrom::Start(position))?;
        inner.write_all(&value.to_be_bytes())?;
        inner.seek(SeekFrom::Start(self.written))?;
        Ok(())
    }
    pub fn finish(mut self) -> Result<u64, Error> {
        self.file.flush()?;
        self.file.get_mut().sync_all()?;
        Ok(self.written)
    }
}

impl io::Write for CountingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numeric::write_vbyte;

    #[test]
    fn test_vbytes() {
        let expected = &[
            0u64, 0xf, 0xef, 0xeef, 0xbeef, 0xdbeef, 0xadbeef, 0xeadbeef, 0xdeadbeef,
        ];
        let mut buf = Vec::new();
        for x in expected {
            write_vbyte(*x, &mut buf).unwrap();
        }

        let mut rdr = SliceInputStream::new(&buf[0..]);
        for x in expected {
            assert_eq!(*x, rdr.read_vbyte().unwrap());
        }
        assert!(rdr.eof());
    }

    #[test]
    fn test_read_u32() {
        let expected = &[0x11, 0x22, 0x33, 0x44];
        let mut rdr = SliceInputStream::new(&expected[0..]);
        assert_eq!(0x11223344, rdr.read_u32().unwrap());
        assert!(rdr.eof());
    }

    #[test]
    fn test_counting_writer_patch() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("patch.bin");
        {
            let mut w = CountingFileWriter::create(&path).unwrap();
            w.write_u32(0xdeadbeef).unwrap();
            w.write_u64(0).unwrap(); // placeholder
            w.write_u16(7).unwrap();
            w.patch_u64(4, 42).unwrap();
            w.finish().unwrap();
        }
        let map = open_mmap_file(&path).unwrap();
        let mut rdr = SliceInputStream::new(&map[..]);
        assert_eq!(0xdeadbeef, rdr.read_u32().unwrap());
        assert_eq!(42, rdr.read_u64().unwrap());
        assert_eq!(7, rdr.read_u16().unwrap());
        assert!(rdr.eof());
    }
}
