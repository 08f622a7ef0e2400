use crate::error::{ErrorKind, NetError, NetResult};
use std::io;

// One transport read per readiness dispatch pulls at most this much.
const READ_CHUNK: usize = 10240;

/// A capacity-capped byte FIFO. Data is appended at the tail by `ingress`
/// and drained from the head by `egress`/`consume`.
pub struct Buffer {
    data: Vec<u8>,
    limit: usize,
}

impl Buffer {
    #[inline]
    pub fn new(limit: usize) -> Buffer {
        Buffer {
            data: Vec::with_capacity(limit.min(READ_CHUNK)),
            limit,
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.limit - self.data.len()
    }

    /// Slice containing the buffered data.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Drops `count` bytes from the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        self.data.drain(..count);
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Appends raw bytes, failing with `Overrun` when the cap is exceeded.
    pub fn push(&mut self, bytes: &[u8]) -> NetResult<()> {
        if bytes.len() > self.free_capacity() {
            return Err(NetError::Fatal(ErrorKind::Overrun));
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Reads from the supplied reader until it would block, the buffer is
    /// full, or the peer closes. Returns the number of bytes read;
    /// `Err(Closed)` when the very first read hits end-of-stream.
    pub fn ingress<R: io::Read>(&mut self, reader: &mut R) -> NetResult<usize> {
        let mut total = 0;
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let want = self.free_capacity().min(chunk.len());
            if want == 0 {
                return Err(NetError::Fatal(ErrorKind::Overrun));
            }

            match reader.read(&mut chunk[..want]) {
                Ok(0) => {
                    return match total {
                        0 => Err(NetError::Closed),
                        _ => Ok(total),
                    }
                }
                Ok(count) => {
                    self.data.extend_from_slice(&chunk[..count]);
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Writes buffered data to the supplied writer until empty or the writer
    /// would block. Returns the number of bytes written.
    pub fn egress<W: io::Write>(&mut self, writer: &mut W) -> NetResult<usize> {
        let mut written = 0;

        while written < self.data.len() {
            match writer.write(&self.data[written..]) {
                Ok(0) => {
                    self.consume(written);
                    return Err(NetError::Fatal(ErrorKind::WriteZero));
                }
                Ok(count) => written += count,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.consume(written);
                    return Err(err.into());
                }
            }
        }

        self.consume(written);
        Ok(written)
    }
}
