//! Newline framing for the client protocol.
//!
//! # Why not `lines()`? (for beginners)
//!
//! `AsyncBufReadExt::lines()` buffers until it sees `\n`, however long the
//! line is.  A client that never sends a newline could make the daemon grow
//! its buffer without bound.  [`LineReader`] caps every read at the
//! configured limit; an overlong line is discarded up to the next newline and
//! reported as [`Frame::Malformed`] so the session can keep going.
//!
//! Blank lines are skipped.  `\r\n` endings are accepted.  A final line
//! without a newline at EOF is still delivered.

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// Why a line could not be delivered.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum LineError {
    #[error("line exceeds {limit} bytes")]
    TooLong { limit: usize },
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
}

/// One unit read from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete line without its terminator.
    Line(String),
    /// A line that was read and discarded.
    Malformed(LineError),
}

/// Splits a byte stream into bounded lines.
pub struct LineReader<R> {
    inner: BufReader<R>,
    max_line: usize,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R, max_line: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            max_line,
            buf: Vec::new(),
        }
    }

    /// Reads the next frame.  `Ok(None)` means the peer closed the stream.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error; the session should end.
    pub async fn next_frame(&mut self) -> std::io::Result<Option<Frame>> {
        loop {
            self.buf.clear();
            // Room for the content plus a `\r\n` terminator.
            let limit = self.max_line as u64 + 2;
            let n = (&mut self.inner)
                .take(limit)
                .read_until(b'\n', &mut self.buf)
                .await?;
            if n == 0 {
                return Ok(None);
            }

            let terminated = self.buf.last() == Some(&b'\n');
            if terminated {
                self.buf.pop();
            }
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
            if self.buf.len() > self.max_line {
                if !terminated {
                    self.discard_line().await?;
                }
                return Ok(Some(Frame::Malformed(LineError::TooLong {
                    limit: self.max_line,
                })));
            }

            if self.buf.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return Ok(Some(match std::str::from_utf8(&self.buf) {
                Ok(line) => Frame::Line(line.to_owned()),
                Err(_) => Frame::Malformed(LineError::InvalidUtf8),
            }));
        }
    }

    /// Consumes input up to and including the next `\n` (or EOF).
    async fn discard_line(&mut self) -> std::io::Result<()> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                return Ok(());
            }
            if let Some(pos) = available.iter().position(|b| *b == b'\n') {
                self.inner.consume(pos + 1);
                return Ok(());
            }
            let len = available.len();
            self.inner.consume(len);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
