//! Little-endian stream primitives with byte accounting.
//!
//! Every field that crosses the control socket goes through [`WireReader`]
//! or [`WireWriter`]. Both count bytes so callers can verify the
//! `packet_length`/`packet_size` declared on the wire. Strings use
//! null-terminated UTF-8 framing (no length prefix); numeric fields are
//! little-endian, floats are IEEE-754 binary32/64.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::ProtocolError;

/// Counting reader over the control socket (or any byte stream).
///
/// Short reads are fatal: any partially-read field yields
/// [`ProtocolError::UnexpectedEof`].
#[derive(Debug)]
pub struct WireReader<R> {
    inner: R,
    bytes_read: u64,
}

impl<R: Read> WireReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, bytes_read: 0 }
    }

    /// Bytes consumed since construction or the last [`Self::reset_byte_count`].
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Restart the byte counter at a message boundary.
    pub fn reset_byte_count(&mut self) {
        self.bytes_read = 0;
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        let v = self.inner.read_u8().map_err(ProtocolError::from_read_error)?;
        self.bytes_read += 1;
        Ok(v)
    }

    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        let v = self.inner.read_u32::<LittleEndian>().map_err(ProtocolError::from_read_error)?;
        self.bytes_read += 4;
        Ok(v)
    }

    pub fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        let v = self.inner.read_u64::<LittleEndian>().map_err(ProtocolError::from_read_error)?;
        self.bytes_read += 8;
        Ok(v)
    }

    /// Two's-complement signed 32-bit. Negative values are meaningful
    /// (e.g. an unset thread index) and must be preserved.
    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        let v = self.inner.read_i32::<LittleEndian>().map_err(ProtocolError::from_read_error)?;
        self.bytes_read += 4;
        Ok(v)
    }

    pub fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        let v = self.inner.read_i64::<LittleEndian>().map_err(ProtocolError::from_read_error)?;
        self.bytes_read += 8;
        Ok(v)
    }

    pub fn read_f32(&mut self) -> Result<f32, ProtocolError> {
        let v = self.inner.read_f32::<LittleEndian>().map_err(ProtocolError::from_read_error)?;
        self.bytes_read += 4;
        Ok(v)
    }

    pub fn read_f64(&mut self) -> Result<f64, ProtocolError> {
        let v = self.inner.read_f64::<LittleEndian>().map_err(ProtocolError::from_read_error)?;
        self.bytes_read += 8;
        Ok(v)
    }

    /// Read a null-terminated UTF-8 string, consuming the trailing zero.
    pub fn read_utf8z(&mut self) -> Result<String, ProtocolError> {
        let mut buf = Vec::new();
        loop {
            let b = self.read_u8()?;
            if b == 0 {
                break;
            }
            buf.push(b);
        }
        Ok(String::from_utf8(buf)?)
    }

    /// Consume and discard `count` bytes (packet-length padding).
    pub fn skip(&mut self, count: u64) -> Result<(), ProtocolError> {
        for _ in 0..count {
            self.read_u8()?;
        }
        Ok(())
    }
}

/// Counting writer for the control socket.
///
/// Short writes are fatal, like short reads: a sink that stops accepting
/// bytes mid-field yields [`ProtocolError::ShortWrite`].
#[derive(Debug)]
pub struct WireWriter<W> {
    inner: W,
    bytes_written: u64,
}

impl<W: Write> WireWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, bytes_written: 0 }
    }

    /// Bytes written since construction or the last [`Self::reset_byte_count`].
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn reset_byte_count(&mut self) {
        self.bytes_written = 0;
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn write_u8(&mut self, v: u8) -> Result<(), ProtocolError> {
        self.inner.write_u8(v).map_err(ProtocolError::from_write_error)?;
        self.bytes_written += 1;
        Ok(())
    }

    pub fn write_bool(&mut self, v: bool) -> Result<(), ProtocolError> {
        self.write_u8(u8::from(v))
    }

    pub fn write_u32(&mut self, v: u32) -> Result<(), ProtocolError> {
        self.inner.write_u32::<LittleEndian>(v).map_err(ProtocolError::from_write_error)?;
        self.bytes_written += 4;
        Ok(())
    }

    pub fn write_u64(&mut self, v: u64) -> Result<(), ProtocolError> {
        self.inner.write_u64::<LittleEndian>(v).map_err(ProtocolError::from_write_error)?;
        self.bytes_written += 8;
        Ok(())
    }

    pub fn write_i32(&mut self, v: i32) -> Result<(), ProtocolError> {
        self.inner.write_i32::<LittleEndian>(v).map_err(ProtocolError::from_write_error)?;
        self.bytes_written += 4;
        Ok(())
    }

    pub fn write_i64(&mut self, v: i64) -> Result<(), ProtocolError> {
        self.inner.write_i64::<LittleEndian>(v).map_err(ProtocolError::from_write_error)?;
        self.bytes_written += 8;
        Ok(())
    }

    pub fn write_f32(&mut self, v: f32) -> Result<(), ProtocolError> {
        self.inner.write_f32::<LittleEndian>(v).map_err(ProtocolError::from_write_error)?;
        self.bytes_written += 4;
        Ok(())
    }

    pub fn write_f64(&mut self, v: f64) -> Result<(), ProtocolError> {
        self.inner.write_f64::<LittleEndian>(v).map_err(ProtocolError::from_write_error)?;
        self.bytes_written += 8;
        Ok(())
    }

    /// Write a raw byte slice (pre-encoded message bodies).
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.inner.write_all(bytes).map_err(ProtocolError::from_write_error)?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Write a UTF-8 string followed by the terminating zero byte.
    pub fn write_utf8z(&mut self, s: &str) -> Result<(), ProtocolError> {
        self.inner.write_all(s.as_bytes()).map_err(ProtocolError::from_write_error)?;
        self.bytes_written += s.len() as u64;
        self.write_u8(0)
    }

    pub fn flush(&mut self) -> Result<(), ProtocolError> {
        self.inner.flush()?;
        Ok(())
    }
}

/// Wire size of a null-terminated UTF-8 string.
pub fn utf8z_len(s: &str) -> u32 {
    s.len() as u32 + 1
}
