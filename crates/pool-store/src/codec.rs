use std::io::{self, Read, Write};

use pool_types::{ChunkHash, ChunkHasher};

/// Writer adapter counting the bytes that reach the inner writer.
///
/// Sits below the compressor so the count is the on-disk (compressed) size.
pub struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader that hashes decompressed content as it streams and fails at end of
/// stream when the digest differs from the chunk's name.
///
/// Consumers must treat any error from this reader as "the chunk is corrupt or
/// does not match its name".
pub struct VerifyingReader<R> {
    inner: R,
    expected: ChunkHash,
    hasher: Option<ChunkHasher>,
}

impl<R: Read> VerifyingReader<R> {
    pub fn new(inner: R, expected: ChunkHash) -> Self {
        Self {
            inner,
            expected,
            hasher: Some(ChunkHasher::new()),
        }
    }

    pub fn expected(&self) -> &ChunkHash {
        &self.expected
    }
}

impl<R: Read> Read for VerifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(hasher) = self.hasher.as_mut() else {
            return Ok(0);
        };
        let n = self.inner.read(buf)?;
        if n > 0 {
            hasher.update(&buf[..n]);
            return Ok(n);
        }

        let computed = self.hasher.take().map(ChunkHasher::finalize);
        match computed {
            Some(computed) if computed != self.expected => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "chunk {} decodes to content hashing to {computed}",
                    self.expected
                ),
            )),
            _ => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_writer_counts() {
        let mut w = CountingWriter::new(Vec::new());
        w.write_all(b"abc").unwrap();
        w.write_all(b"de").unwrap();
        assert_eq!(w.count(), 5);
        assert_eq!(w.into_inner(), b"abcde");
    }

    #[test]
    fn verifying_reader_accepts_matching_content() {
        let mut reader = VerifyingReader::new(&b"hello"[..], ChunkHash::of(b"hello"));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn verifying_reader_fails_at_end_on_mismatch() {
        let mut reader = VerifyingReader::new(&b"hellO"[..], ChunkHash::of(b"hello"));
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn verifying_reader_is_fused_after_success() {
        let mut reader = VerifyingReader::new(&b""[..], ChunkHash::of(b""));
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }
}
