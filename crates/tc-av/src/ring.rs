//! Bounded capture of a process's standard error.

use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

/// Keeps only the last `capacity` bytes written to it.
#[derive(Debug, Clone)]
pub struct StderrTail {
    buf: VecDeque<u8>,
    capacity: usize,
    total: u64,
}

impl StderrTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
            total: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.total += bytes.len() as u64;
        if self.capacity == 0 {
            return;
        }
        // Only the tail of an oversized chunk can survive.
        let bytes = if bytes.len() > self.capacity {
            &bytes[bytes.len() - self.capacity..]
        } else {
            bytes
        };
        let overflow = (self.buf.len() + bytes.len()).saturating_sub(self.capacity);
        self.buf.drain(..overflow);
        self.buf.extend(bytes);
    }

    /// Bytes currently held.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Total bytes ever pushed.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Whether earlier output was discarded.
    pub fn truncated(&self) -> bool {
        self.total > self.buf.len() as u64
    }

    /// Lossy UTF-8 rendering of the retained tail, trimmed.
    pub fn excerpt(&self) -> String {
        let (a, b) = self.buf.as_slices();
        let mut bytes = Vec::with_capacity(a.len() + b.len());
        bytes.extend_from_slice(a);
        bytes.extend_from_slice(b);
        String::from_utf8_lossy(&bytes).trim().to_string()
    }

    /// Read `reader` to EOF (or until `stop` fires), keeping the tail.
    pub async fn capture<R>(mut reader: R, capacity: usize, stop: &CancellationToken) -> Self
    where
        R: AsyncRead + Unpin,
    {
        let mut tail = Self::new(capacity);
        let mut chunk = [0u8; 4096];
        loop {
            let read = tokio::select! {
                _ = stop.cancelled() => break,
                r = reader.read(&mut chunk) => r,
            };
            match read {
                Ok(0) => break,
                Ok(n) => tail.push(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!("stderr capture stopped: {e}");
                    break;
                }
            }
        }
        tail
    }
}
