//! Length-prefixed message framing.
//!
//! Every message on the wire is a 4-byte big-endian length followed by that
//! many payload bytes:
//!
//! ```text
//! ┌──────────────┬──────────────────────┐
//! │ Length (4B)  │ Payload              │
//! │ big-endian   │ (Length bytes)       │
//! └──────────────┴──────────────────────┘
//! ```
//!
//! The length is read as a signed 32-bit integer. Zero and negative lengths
//! are both protocol violations: there is no empty message on this wire, and
//! senders refuse empty payloads before they reach the socket.

use bytes::{Bytes, BytesMut};

/// Frame header size: one big-endian length.
pub const HEADER_SIZE: usize = 4;

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// Errors raised while decoding frames. Each one closes the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The length field is zero or negative.
    #[error("frame length {0} is not positive")]
    NonPositiveLength(i32),

    /// The length field exceeds the configured maximum.
    #[error("frame length {len} exceeds maximum {max}")]
    TooLarge { len: usize, max: usize },
}

/// Encode the length header for a payload of `len` bytes.
///
/// Callers must have checked `len` against the frame limit, which never
/// exceeds `i32::MAX`.
pub fn encode_header(len: usize) -> [u8; HEADER_SIZE] {
    debug_assert!(len <= i32::MAX as usize);
    (len as u32).to_be_bytes()
}

/// Read the length field at the start of `buf`, if a full header is present.
pub fn peek_length(buf: &[u8]) -> Option<i32> {
    let header: [u8; HEADER_SIZE] = buf.get(..HEADER_SIZE)?.try_into().ok()?;
    Some(i32::from_be_bytes(header))
}

/// Growable receive buffer with a read cursor and a write cursor.
///
/// Bytes between the cursors are received but not yet parsed. Owned by a
/// single receive sequence, so it needs no locking.
#[derive(Debug, Default)]
pub struct Accumulator {
    buf: BytesMut,
    read: usize,
    write: usize,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::zeroed(capacity),
            read: 0,
            write: 0,
        }
    }

    /// Append received bytes at the write cursor, growing if needed.
    pub fn extend(&mut self, data: &[u8]) {
        if self.write + data.len() > self.buf.len() && self.read > 0 {
            self.compact();
        }

        let end = self.write + data.len();
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[self.write..end].copy_from_slice(data);
        self.write = end;
    }

    /// Received bytes not yet consumed.
    pub fn unread(&self) -> &[u8] {
        &self.buf[self.read..self.write]
    }

    /// Advance the read cursor.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(self.read + n <= self.write);
        self.read = (self.read + n).min(self.write);
    }

    /// Move the unread remainder to the front and reset the cursors.
    pub fn compact(&mut self) {
        if self.read == self.write {
            self.read = 0;
            self.write = 0;
        } else if self.read > 0 {
            self.buf.copy_within(self.read..self.write, 0);
            self.write -= self.read;
            self.read = 0;
        }
    }

    /// Number of unread bytes.
    pub fn len(&self) -> usize {
        self.write - self.read
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    /// Current read cursor position.
    #[cfg(test)]
    pub fn read_pos(&self) -> usize {
        self.read
    }

    /// Bytes allocated for the buffer.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }
}

/// Stateful frame extractor over an [`Accumulator`].
///
/// Feeding the same byte stream in any split yields the same frames in the
/// same order.
#[derive(Debug)]
pub struct FrameDecoder {
    acc: Accumulator,
    max_frame: usize,
}

impl FrameDecoder {
    pub fn new(max_frame: usize) -> Self {
        Self {
            acc: Accumulator::new(),
            max_frame,
        }
    }

    /// Create a decoder whose accumulator starts with `capacity` bytes.
    pub fn with_capacity(max_frame: usize, capacity: usize) -> Self {
        Self {
            acc: Accumulator::with_capacity(capacity),
            max_frame,
        }
    }

    /// Bytes received but not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.acc.len()
    }

    pub fn accumulator(&self) -> &Accumulator {
        &self.acc
    }

    /// Append received bytes without decoding.
    pub fn extend(&mut self, data: &[u8]) {
        self.acc.extend(data);
    }

    /// Extract the next complete frame.
    ///
    /// Returns `Ok(None)` if the accumulator holds no complete frame yet.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        let unread = self.acc.unread();
        let Some(raw) = peek_length(unread) else {
            return Ok(None);
        };

        let len = self.check_length(raw)?;
        let total = HEADER_SIZE + len;
        if unread.len() < total {
            return Ok(None);
        }

        let payload = Bytes::copy_from_slice(&unread[HEADER_SIZE..total]);
        self.acc.consume(total);
        Ok(Some(payload))
    }

    /// Append `data`, hand every complete frame to `emit` in arrival order,
    /// then compact the accumulator.
    ///
    /// Returns the number of frames emitted. On a protocol violation the
    /// remaining bytes are left unparsed and the error is returned; frames
    /// before the bad header have already been emitted.
    pub fn decode(
        &mut self,
        data: &[u8],
        mut emit: impl FnMut(Bytes),
    ) -> Result<usize, FrameError> {
        self.acc.extend(data);

        let mut count = 0;
        while let Some(payload) = self.next_frame()? {
            emit(payload);
            count += 1;
        }

        self.acc.compact();
        Ok(count)
    }

    fn check_length(&self, raw: i32) -> Result<usize, FrameError> {
        if raw <= 0 {
            return Err(FrameError::NonPositiveLength(raw));
        }
        let len = raw as usize;
        if len > self.max_frame {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame,
            });
        }
        Ok(len)
    }
}
