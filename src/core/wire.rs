//! Wire codec - length-prefixed framing over a byte stream
//!
//! Every value on the wire is either a raw `u64` (little-endian) or a byte
//! array preceded by its length as a `u64`. Booleans travel as 0/1 integers.
//! There is no versioning or checksum: the parent and the sidecar take turns
//! strictly (one request, one response).
//!
//! Any I/O error here is fatal to the session.

use std::io::{self, Read, Write};

/// Upper bound on a single array; anything larger means the stream is out of sync
pub const MAX_ARRAY_LEN: u64 = 1 << 32;

/// Reads framed values from the parent
pub struct WireReader<R> {
    inner: R,
}

impl<R: Read> WireReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn read_u64(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        // read_exact loops over short reads
        self.inner.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_bytes(&mut self) -> io::Result<Vec<u8>> {
        let len = self.read_u64()?;
        if len > MAX_ARRAY_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("array length {} exceeds limit", len),
            ));
        }
        let mut buf = vec![0u8; len as usize];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Byte array interpreted as UTF-8 (lossy)
    pub fn read_string(&mut self) -> io::Result<String> {
        let bytes = self.read_bytes()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Writes framed values back to the parent
pub struct WireWriter<W> {
    inner: W,
}

impl<W: Write> WireWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn write_u64(&mut self, value: u64) -> io::Result<()> {
        self.inner.write_all(&value.to_le_bytes())
    }

    pub fn write_bool(&mut self, value: bool) -> io::Result<()> {
        self.write_u64(value as u64)
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_u64(data.len() as u64)?;
        self.inner.write_all(data)
    }

    pub fn write_str(&mut self, text: &str) -> io::Result<()> {
        self.write_bytes(text.as_bytes())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
