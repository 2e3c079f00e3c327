//! Newline framing for stream-oriented transports.
//!
//! A TCP backend delivers bytes with no message boundaries. [`LineFramer`]
//! accumulates those bytes and yields one message per `\n`-terminated line,
//! holding any unterminated tail until more bytes arrive.

/// Byte that terminates a message on the stream leg.
pub const DELIMITER: u8 = b'\n';

/// Default limit on buffered bytes that have not yet formed a message (1 MiB).
pub const DEFAULT_MAX_BUFFERED: usize = 1024 * 1024;

/// Errors produced while framing a byte stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The unterminated tail grew past the configured limit.
    #[error("unterminated frame of {buffered} bytes exceeds limit of {limit}")]
    Oversized {
        /// Bytes buffered without a delimiter.
        buffered: usize,
        /// Configured limit.
        limit: usize,
    },
}

/// Incremental splitter turning a byte stream into trimmed, non-empty lines.
///
/// Feeding the same bytes in one chunk or in any number of smaller chunks
/// yields the same sequence of messages. Whitespace-only lines are dropped.
#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    /// Bytes before this offset are known to contain no delimiter.
    scanned: usize,
    max_buffered: usize,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFramer {
    /// Creates an empty framer with [`DEFAULT_MAX_BUFFERED`].
    #[must_use]
    pub const fn new() -> Self {
        Self::with_max_buffered(DEFAULT_MAX_BUFFERED)
    }

    /// Creates an empty framer with a custom limit on the unterminated tail.
    #[must_use]
    pub const fn with_max_buffered(max_buffered: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_buffered,
        }
    }

    /// Appends bytes without extracting anything.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Extracts the next complete message, if one is buffered.
    ///
    /// Returned bytes exclude the delimiter and surrounding ASCII whitespace.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            let offset = self.buffer[self.scanned..]
                .iter()
                .position(|b| *b == DELIMITER);
            let Some(offset) = offset else {
                self.scanned = self.buffer.len();
                return None;
            };
            let end = self.scanned + offset;
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            self.scanned = 0;

            let trimmed = line[..line.len() - 1].trim_ascii();
            if !trimmed.is_empty() {
                return Some(trimmed.to_vec());
            }
        }
    }

    /// Appends `chunk` and returns every message it completed, in order.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Oversized`] if, after extraction, the remaining
    /// unterminated bytes exceed the limit. The buffer is cleared in that
    /// case. Use [`LineFramer::feed_into`] to keep the messages completed
    /// before the overflow.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
        let mut frames = Vec::new();
        self.feed_into(chunk, &mut frames)?;
        Ok(frames)
    }

    /// Appends `chunk` and pushes every message it completed onto `out`.
    ///
    /// Completed messages are pushed before the limit is checked, so `out`
    /// holds them even when an error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Oversized`] if the remaining unterminated bytes
    /// exceed the limit. The residue is cleared in that case.
    pub fn feed_into(&mut self, chunk: &[u8], out: &mut Vec<Vec<u8>>) -> Result<(), FrameError> {
        self.push(chunk);
        while let Some(frame) = self.next_frame() {
            out.push(frame);
        }
        if self.buffer.len() > self.max_buffered {
            let buffered = self.buffer.len();
            self.clear();
            return Err(FrameError::Oversized {
                buffered,
                limit: self.max_buffered,
            });
        }
        Ok(())
    }

    /// Number of buffered bytes not yet returned as a message.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Discards any buffered residue.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
    }
}
