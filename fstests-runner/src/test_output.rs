// Copyright (c) The fast-fstests Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Output sinks for streaming test stdout/stderr.
//!
//! The sink contract is an append-only byte stream that may be written from
//! the transport's I/O task. [`CaptureSink`] is the runner's implementation:
//! it optionally persists the full stream to a file and always retains a
//! bounded tail for the result record's excerpt.

use camino::Utf8Path;
use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::io::AsyncWrite;

/// An append-only byte sink a supervisor streams test output into.
pub trait OutputSink: AsyncWrite + Send + Unpin {}

impl<T: AsyncWrite + Send + Unpin + ?Sized> OutputSink for T {}

/// How many trailing bytes of output are retained for excerpts.
pub const EXCERPT_TAIL_BYTES: usize = 4096;

/// A bounded buffer retaining the last [`EXCERPT_TAIL_BYTES`] bytes written.
#[derive(Clone, Debug, Default)]
pub struct TailBuffer {
    buf: Vec<u8>,
    truncated: bool,
}

impl TailBuffer {
    fn extend(&mut self, bytes: &[u8]) {
        if bytes.len() >= EXCERPT_TAIL_BYTES {
            self.truncated = self.truncated || !self.buf.is_empty() || bytes.len() > EXCERPT_TAIL_BYTES;
            self.buf.clear();
            self.buf
                .extend_from_slice(&bytes[bytes.len() - EXCERPT_TAIL_BYTES..]);
            return;
        }
        let overflow = (self.buf.len() + bytes.len()).saturating_sub(EXCERPT_TAIL_BYTES);
        if overflow > 0 {
            self.buf.drain(..overflow);
            self.truncated = true;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// The retained tail, lossily decoded, with a marker when output was
    /// dropped from the front.
    pub fn to_excerpt(&self) -> String {
        let tail = String::from_utf8_lossy(&self.buf);
        if self.truncated {
            format!("[... output truncated ...]\n{tail}")
        } else {
            tail.into_owned()
        }
    }
}

/// A sink that tees writes into an optional backing file and a tail buffer.
#[derive(Debug)]
pub struct CaptureSink {
    file: Option<tokio::fs::File>,
    tail: TailBuffer,
}

impl CaptureSink {
    /// A sink backed by a file at `path`; the full stream is persisted.
    pub async fn file_backed(path: &Utf8Path) -> io::Result<Self> {
        let file = tokio::fs::File::create(path).await?;
        Ok(Self {
            file: Some(file),
            tail: TailBuffer::default(),
        })
    }

    /// A sink that only retains the excerpt tail.
    pub fn memory_only() -> Self {
        Self {
            file: None,
            tail: TailBuffer::default(),
        }
    }

    /// The captured excerpt.
    pub fn excerpt(&self) -> String {
        self.tail.to_excerpt()
    }

    /// Flushes the backing file, if any.
    pub async fn finish(mut self) -> io::Result<String> {
        if let Some(file) = self.file.as_mut() {
            use tokio::io::AsyncWriteExt;
            file.flush().await?;
        }
        Ok(self.tail.to_excerpt())
    }
}

impl AsyncWrite for CaptureSink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let this = &mut *self;
        let written = match this.file.as_mut() {
            Some(file) => match Pin::new(file).poll_write(cx, buf) {
                Poll::Ready(Ok(n)) => n,
                Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                Poll::Pending => return Poll::Pending,
            },
            // Memory-only sinks accept everything.
            None => buf.len(),
        };
        this.tail.extend(&buf[..written]);
        Poll::Ready(Ok(written))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.file.as_mut() {
            Some(file) => Pin::new(file).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        match self.file.as_mut() {
            Some(file) => Pin::new(file).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}
