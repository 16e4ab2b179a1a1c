//! Buffered positional reading of PZ files.
//!
//! All multi-byte reads are little-endian. Short reads mean the file is
//! corrupt and surface as [`LoadError::UnexpectedEof`]. The reader knows
//! its filename so every error carries it.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::errors::LoadError;

/// The reader's underlying stream: a buffered file in production, an
/// in-memory cursor in tests.
pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

pub struct BinaryInput {
    stream: Box<dyn ReadSeek>,
    filename: String,
}

impl std::fmt::Debug for BinaryInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryInput")
            .field("filename", &self.filename)
            .finish()
    }
}

impl BinaryInput {
    /// Opens a file for reading.
    pub fn open(path: &str) -> Result<BinaryInput, LoadError> {
        let file = File::open(Path::new(path)).map_err(|source| LoadError::Io {
            filename: path.to_string(),
            source,
        })?;
        Ok(BinaryInput {
            stream: Box::new(BufReader::new(file)),
            filename: path.to_string(),
        })
    }

    /// Wraps an in-memory image; used by the loader tests.
    pub fn from_bytes(filename: &str, bytes: Vec<u8>) -> BinaryInput {
        BinaryInput {
            stream: Box::new(std::io::Cursor::new(bytes)),
            filename: filename.to_string(),
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    fn io_error(&self, source: std::io::Error) -> LoadError {
        if source.kind() == std::io::ErrorKind::UnexpectedEof {
            LoadError::UnexpectedEof(self.filename.clone())
        } else {
            LoadError::Io {
                filename: self.filename.clone(),
                source,
            }
        }
    }

    fn read_exact_buf(&mut self, buf: &mut [u8]) -> Result<(), LoadError> {
        match self.stream.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(source) => Err(self.io_error(source)),
        }
    }

    pub fn read_u8(&mut self) -> Result<u8, LoadError> {
        let mut buf = [0u8; 1];
        self.read_exact_buf(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, LoadError> {
        let mut buf = [0u8; 2];
        self.read_exact_buf(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&mut self) -> Result<u32, LoadError> {
        let mut buf = [0u8; 4];
        self.read_exact_buf(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&mut self) -> Result<u64, LoadError> {
        let mut buf = [0u8; 8];
        self.read_exact_buf(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads a 16-bit length-prefixed string.
    pub fn read_len_string(&mut self) -> Result<String, LoadError> {
        let len = self.read_u16()? as usize;
        let mut buf = vec![0u8; len];
        self.read_exact_buf(&mut buf)?;
        // Names are not required to be UTF-8 on disk; anything else is
        // carried through lossily rather than rejected.
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    pub fn tell(&mut self) -> Result<u64, LoadError> {
        self.stream
            .stream_position()
            .map_err(|source| self.io_error(source))
    }

    pub fn seek_set(&mut self, pos: u64) -> Result<(), LoadError> {
        self.stream
            .seek(SeekFrom::Start(pos))
            .map(|_| ())
            .map_err(|source| self.io_error(source))
    }

    pub fn seek_cur(&mut self, delta: i64) -> Result<(), LoadError> {
        self.stream
            .seek(SeekFrom::Current(delta))
            .map(|_| ())
            .map_err(|source| self.io_error(source))
    }

    /// True at end of file. Does not consume input.
    pub fn is_at_eof(&mut self) -> Result<bool, LoadError> {
        let mut buf = [0u8; 1];
        let n = self
            .stream
            .read(&mut buf)
            .map_err(|source| self.io_error(source))?;
        if n == 0 {
            Ok(true)
        } else {
            self.seek_cur(-1)?;
            Ok(false)
        }
    }

    /// Closes the stream by dropping it.
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(bytes: &[u8]) -> BinaryInput {
        BinaryInput::from_bytes("test.pz", bytes.to_vec())
    }

    #[test]
    fn integers_are_little_endian() {
        let mut r = input(&[0x01, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(r.read_u8().unwrap(), 1);
        assert_eq!(r.read_u16().unwrap(), 0x1234);
        assert_eq!(r.read_u32().unwrap(), 0x12345678);
    }

    #[test]
    fn u64_round_trip() {
        let mut r = input(&0x0123_4567_89AB_CDEFu64.to_le_bytes());
        assert_eq!(r.read_u64().unwrap(), 0x0123_4567_89AB_CDEF);
    }

    #[test]
    fn len_string() {
        let mut r = input(&[5, 0, b'h', b'e', b'l', b'l', b'o']);
        assert_eq!(r.read_len_string().unwrap(), "hello");
    }

    #[test]
    fn short_read_is_unexpected_eof() {
        let mut r = input(&[0x01, 0x02]);
        let err = r.read_u32().unwrap_err();
        assert!(matches!(err, LoadError::UnexpectedEof(f) if f == "test.pz"));
    }

    #[test]
    fn tell_and_seek() {
        let mut r = input(&[1, 2, 3, 4, 5, 6]);
        r.read_u16().unwrap();
        assert_eq!(r.tell().unwrap(), 2);
        r.seek_cur(2).unwrap();
        assert_eq!(r.read_u8().unwrap(), 5);
        r.seek_set(0).unwrap();
        assert_eq!(r.read_u8().unwrap(), 1);
    }

    #[test]
    fn eof_probe_does_not_consume() {
        let mut r = input(&[9]);
        assert!(!r.is_at_eof().unwrap());
        assert_eq!(r.read_u8().unwrap(), 9);
        assert!(r.is_at_eof().unwrap());
    }

    #[test]
    fn open_missing_file_reports_filename() {
        let err = BinaryInput::open("/nonexistent/really-not-here.pz").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("really-not-here.pz"));
    }
}
