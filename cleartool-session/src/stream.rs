//! Incremental line splitting over an async byte stream.
//!
//! Reads are cancel-safe: a `fill` future dropped before completion has not
//! consumed any bytes, so the reader can sit in a `tokio::select!` next to a
//! timer and the other stream.

use futures::FutureExt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

const CHUNK_SIZE: usize = 4096;

pub(crate) struct LineReader {
    name: &'static str,
    inner: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pending: Vec<u8>,
    eof: bool,
}

impl LineReader {
    pub(crate) fn new(name: &'static str, inner: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        Self {
            name,
            inner: Some(inner),
            pending: Vec::new(),
            eof: false,
        }
    }

    pub(crate) fn is_eof(&self) -> bool {
        self.eof
    }

    /// Read one chunk into the buffer. Returns the number of bytes read;
    /// zero means the stream has ended.
    pub(crate) async fn fill(&mut self) -> io::Result<usize> {
        let Some(inner) = self.inner.as_mut() else {
            self.eof = true;
            return Ok(0);
        };
        let mut chunk = [0u8; CHUNK_SIZE];
        let n = inner.read(&mut chunk).await?;
        if n == 0 {
            self.eof = true;
        } else {
            self.pending.extend_from_slice(&chunk[..n]);
        }
        Ok(n)
    }

    /// Pull in whatever is readable right now without waiting.
    pub(crate) fn fill_ready(&mut self) -> io::Result<usize> {
        let mut total = 0;
        while !self.eof {
            match self.fill().now_or_never() {
                Some(Ok(0)) | None => break,
                Some(Ok(n)) => total += n,
                Some(Err(e)) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Pop the next complete line, without its terminator.
    pub(crate) fn next_line(&mut self) -> Option<String> {
        let newline = self.pending.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=newline).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Once the stream has ended, the trailing bytes that had no newline.
    pub(crate) fn take_partial(&mut self) -> Option<String> {
        if !self.eof || self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }

    /// Throw away everything currently buffered or readable.
    pub(crate) fn discard_ready(&mut self) -> usize {
        if let Err(e) = self.fill_ready() {
            tracing::debug!("error while draining {}: {}", self.name, e);
        }
        let mut discarded = 0;
        while let Some(line) = self.next_line() {
            tracing::trace!("discarding stray {} line: {:?}", self.name, line);
            discarded += 1;
        }
        discarded
    }

    /// Drop the underlying stream; further reads report end of stream.
    pub(crate) fn close(&mut self) {
        self.inner = None;
        self.eof = true;
        self.pending.clear();
    }
}
