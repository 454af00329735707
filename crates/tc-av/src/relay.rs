//! Bounded byte relay between an async reader and an async writer.
//!
//! A relay owns exactly one buffer of `budget` bytes and alternates
//! read → `write_all`, so its memory footprint does not depend on the payload
//! size and a slow sink stalls the source. Any I/O failure cancels the supplied
//! token before returning so the process on the other end can be stopped.

use tc_core::RelaySide;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Owned, type-erased reader handed to a runner.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Owned, type-erased writer handed to a runner.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Why a relay stopped before reaching end of input.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("{side} failed after {transferred} bytes: {source}")]
    Io {
        side: RelaySide,
        transferred: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("relay cancelled after {transferred} bytes")]
    Cancelled { transferred: u64 },
}

impl RelayError {
    pub fn transferred(&self) -> u64 {
        match self {
            Self::Io { transferred, .. } | Self::Cancelled { transferred } => *transferred,
        }
    }

    /// The failing side, if this was an I/O failure.
    pub fn side(&self) -> Option<RelaySide> {
        match self {
            Self::Io { side, .. } => Some(*side),
            Self::Cancelled { .. } => None,
        }
    }

    /// Whether the sink was a pipe whose reader went away.
    pub fn is_broken_pipe(&self) -> bool {
        matches!(
            self,
            Self::Io {
                side: RelaySide::Sink,
                source,
                ..
            } if source.kind() == std::io::ErrorKind::BrokenPipe
        )
    }

    pub fn into_error(self) -> tc_core::Error {
        match self {
            Self::Io { side, source, .. } => tc_core::Error::io(side, source),
            Self::Cancelled { .. } => tc_core::Error::Cancelled,
        }
    }
}

/// Copy `source` into `sink` until EOF, using one buffer of `budget` bytes.
///
/// Returns the number of bytes written. The sink is flushed but not shut down.
pub async fn relay<R, W>(
    source: &mut R,
    sink: &mut W,
    budget: usize,
    cancel: &CancellationToken,
) -> Result<u64, RelayError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; budget.max(1)];
    let mut transferred = 0u64;

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RelayError::Cancelled { transferred }),
            r = source.read(&mut buf) => r,
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(fail(cancel, RelaySide::Source, transferred, e)),
        };

        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RelayError::Cancelled { transferred }),
            r = sink.write_all(&buf[..n]) => r,
        };
        if let Err(e) = written {
            return Err(fail(cancel, RelaySide::Sink, transferred, e));
        }
        transferred += n as u64;
    }

    let flushed = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(RelayError::Cancelled { transferred }),
        r = sink.flush() => r,
    };
    if let Err(e) = flushed {
        return Err(fail(cancel, RelaySide::Sink, transferred, e));
    }

    Ok(transferred)
}

fn fail(
    cancel: &CancellationToken,
    side: RelaySide,
    transferred: u64,
    source: std::io::Error,
) -> RelayError {
    tracing::debug!(%side, transferred, "relay failed: {source}");
    cancel.cancel();
    RelayError::Io {
        side,
        transferred,
        source,
    }
}
