//! Media sources and sinks.
//!
//! [`MediaStore`] is the narrow interface the coordinator uses to open a job's
//! input and output. [`LocalMediaStore`] hands inline payloads to the
//! transcoder's stdin. Remote URIs (HTTP(S) or the local filesystem) are first
//! copied into a spool file, since containers such as MP4 with the index at
//! the end cannot be demuxed from a pipe. Output goes to temp files that are
//! either handed back to the caller (spooled) or renamed into the output
//! directory (stored).

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::Url;
use tc_av::{BoxReader, BoxWriter, MediaInput};
use tc_core::config::StorageConfig;
use tc_core::{Error, JobId, OutputTarget, RelaySide, Result, SourceLocator};
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

/// HTTP connect timeout for remote sources.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Copy buffer used when staging remote sources.
const DEFAULT_BUFFER_BUDGET: usize = 64 * 1024;

/// An opened job source.
pub struct OpenedSource {
    pub input: MediaInput,
    /// Local copy of a remote source. Deleted on drop, so it must outlive
    /// the run.
    pub staged: Option<TempPath>,
}

/// Finished output of a successful job.
#[derive(Debug, Clone)]
pub enum OutputRef {
    /// Temp file to stream back to the caller. Deleted when the last clone
    /// is dropped.
    Spooled(Arc<TempPath>),
    /// Persisted under `key` in the output directory.
    Stored { key: String, path: PathBuf },
}

impl OutputRef {
    pub fn path(&self) -> &Path {
        match self {
            Self::Spooled(tmp) => {
                let path: &Path = tmp;
                path
            }
            Self::Stored { path, .. } => path.as_path(),
        }
    }
}

/// Output that has been opened but not yet committed.
#[derive(Debug)]
pub enum PendingOutput {
    Spool(TempPath),
    Stored {
        key: String,
        tmp: TempPath,
        dest: PathBuf,
    },
}

/// An opened sink: the writer the runner fills, plus what to commit after.
pub struct OutputSink {
    pub writer: BoxWriter,
    pub pending: PendingOutput,
}

/// Access to job inputs and outputs.
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Open the job's source. Failures are I/O errors; staging a remote
    /// source may also fail on the spool side.
    async fn open_source(&self, source: &SourceLocator) -> Result<OpenedSource>;

    /// Open a writer for the job's output. Failures are sink-side I/O errors.
    async fn open_sink(&self, job_id: JobId, target: &OutputTarget) -> Result<OutputSink>;

    /// Make a fully written output visible.
    async fn commit(&self, pending: PendingOutput) -> Result<OutputRef>;

    /// Drop partial output of a job that did not succeed.
    async fn discard(&self, pending: PendingOutput);
}

/// Filesystem- and HTTP-backed [`MediaStore`].
pub struct LocalMediaStore {
    spool_dir: PathBuf,
    output_dir: PathBuf,
    http: reqwest::Client,
    buffer_budget: usize,
}

impl LocalMediaStore {
    pub fn new(storage: &StorageConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::Internal(format!("HTTP client error: {e}")))?;
        Ok(Self {
            spool_dir: storage.spool_dir(),
            output_dir: storage.output_dir.clone(),
            http,
            buffer_budget: DEFAULT_BUFFER_BUDGET,
        })
    }

    /// Size of the single buffer used to stage remote sources.
    pub fn with_buffer_budget(mut self, bytes: usize) -> Self {
        self.buffer_budget = bytes;
        self
    }

    pub fn spool_dir(&self) -> &Path {
        &self.spool_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    async fn open_remote(&self, uri: &str) -> Result<BoxReader> {
        let url = Url::parse(uri).map_err(|e| Error::io(RelaySide::Source, e))?;
        match url.scheme() {
            "http" | "https" => {
                let resp = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| Error::io(RelaySide::Source, e))?;
                let content_type = resp
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok());
                if is_html(content_type) {
                    // Typically a sign-in or virus-scan interstitial.
                    return Err(Error::io(
                        RelaySide::Source,
                        "source returned an HTML page instead of media; is it shared publicly?",
                    ));
                }
                let stream = resp
                    .bytes_stream()
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
                Ok(Box::new(StreamReader::new(stream)))
            }
            "file" => {
                let path = url.to_file_path().map_err(|()| {
                    Error::io(RelaySide::Source, format!("not a local path: {uri}"))
                })?;
                let file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|e| Error::io(RelaySide::Source, format!("{}: {e}", path.display())))?;
                Ok(Box::new(file))
            }
            other => Err(Error::io(
                RelaySide::Source,
                format!("unsupported scheme: {other}"),
            )),
        }
    }

    /// Copy a remote source into a spool file the transcoder can seek in.
    ///
    /// Dropping the future mid-copy deletes the partial file.
    async fn stage_remote(&self, uri: &str) -> Result<OpenedSource> {
        let mut reader = self.open_remote(uri).await?;
        let (mut file, path) = Self::create_temp_in(&self.spool_dir, "tc-src-").await?;

        let copied = tc_av::relay(
            &mut reader,
            &mut file,
            self.buffer_budget,
            &CancellationToken::new(),
        )
        .await
        .map_err(tc_av::RelayError::into_error)?;
        file.shutdown()
            .await
            .map_err(|e| Error::io(RelaySide::Sink, e))?;
        drop(file);

        tracing::debug!(bytes = copied, path = %path.display(), "remote source staged");
        Ok(OpenedSource {
            input: MediaInput::File(path.to_path_buf()),
            staged: Some(path),
        })
    }

    async fn create_temp_in(dir: &Path, prefix: &str) -> Result<(tokio::fs::File, TempPath)> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::io(RelaySide::Sink, format!("{}: {e}", dir.display())))?;
        let dir = dir.to_path_buf();
        let prefix = prefix.to_string();
        let tmp = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new().prefix(&prefix).tempfile_in(&dir)
        })
        .await
        .map_err(|e| Error::Internal(format!("spool task failed: {e}")))?
        .map_err(|e| Error::io(RelaySide::Sink, e))?;

        let (file, path) = tmp.into_parts();
        Ok((tokio::fs::File::from_std(file), path))
    }
}

#[async_trait]
impl MediaStore for LocalMediaStore {
    async fn open_source(&self, source: &SourceLocator) -> Result<OpenedSource> {
        match source {
            SourceLocator::Inline(bytes) => Ok(OpenedSource {
                input: MediaInput::Stream(Box::new(io::Cursor::new(bytes.clone()))),
                staged: None,
            }),
            SourceLocator::Remote(uri) => self.stage_remote(uri).await,
        }
    }

    async fn open_sink(&self, job_id: JobId, target: &OutputTarget) -> Result<OutputSink> {
        match target {
            OutputTarget::Inline => {
                let (file, path) =
                    Self::create_temp_in(&self.spool_dir, &format!("tc-{job_id}-")).await?;
                Ok(OutputSink {
                    writer: Box::new(file),
                    pending: PendingOutput::Spool(path),
                })
            }
            OutputTarget::Stored { key } => {
                let (file, tmp) =
                    Self::create_temp_in(&self.output_dir, &format!(".tc-{job_id}-")).await?;
                Ok(OutputSink {
                    writer: Box::new(file),
                    pending: PendingOutput::Stored {
                        key: key.clone(),
                        tmp,
                        dest: self.output_dir.join(key),
                    },
                })
            }
        }
    }

    async fn commit(&self, pending: PendingOutput) -> Result<OutputRef> {
        match pending {
            PendingOutput::Spool(path) => Ok(OutputRef::Spooled(Arc::new(path))),
            PendingOutput::Stored { key, tmp, dest } => {
                let target = dest.clone();
                tokio::task::spawn_blocking(move || tmp.persist(&target))
                    .await
                    .map_err(|e| Error::Internal(format!("persist task failed: {e}")))?
                    .map_err(|e| Error::io(RelaySide::Sink, e.error))?;
                tracing::debug!(key = %key, path = %dest.display(), "output stored");
                Ok(OutputRef::Stored { key, path: dest })
            }
        }
    }

    async fn discard(&self, pending: PendingOutput) {
        let tmp = match pending {
            PendingOutput::Spool(tmp) | PendingOutput::Stored { tmp, .. } => tmp,
        };
        let shown = tmp.display().to_string();
        if let Err(e) = tokio::task::spawn_blocking(move || tmp.close()).await {
            tracing::warn!("failed to discard partial output {shown}: {e}");
        }
    }
}

/// Whether a response's content type is an HTML document.
fn is_html(content_type: Option<&str>) -> bool {
    content_type
        .and_then(|ct| ct.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("text/html"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn store(dir: &tempfile::TempDir) -> LocalMediaStore {
        LocalMediaStore::new(&StorageConfig {
            spool_dir: Some(dir.path().join("spool")),
            output_dir: dir.path().join("out"),
        })
        .unwrap()
    }

    async fn read_all(mut reader: BoxReader) -> Vec<u8> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        buf
    }

    async fn serve(app: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{addr}")
    }

    fn spool_entries(dir: &tempfile::TempDir) -> usize {
        std::fs::read_dir(dir.path().join("spool"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn inline_source_is_streamed() {
        let dir = tempfile::tempdir().unwrap();
        let src = SourceLocator::Inline(Bytes::from_static(b"inline bytes"));
        let opened = store(&dir).open_source(&src).await.unwrap();
        assert!(opened.staged.is_none());
        assert!(matches!(opened.input, MediaInput::Stream(_)));
        assert_eq!(read_all(opened.input.into_reader().await.unwrap()).await, b"inline bytes");
    }

    #[tokio::test]
    async fn file_source_is_staged_in_spool() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.bin");
        std::fs::write(&path, b"from disk").unwrap();
        let uri = Url::from_file_path(&path).unwrap().to_string();

        let opened = store(&dir)
            .with_buffer_budget(4)
            .open_source(&SourceLocator::Remote(uri))
            .await
            .unwrap();
        let MediaInput::File(staged_path) = &opened.input else {
            panic!("remote source should be staged to a file");
        };
        let staged_path = staged_path.clone();
        assert!(staged_path.starts_with(dir.path().join("spool")));
        assert_ne!(staged_path, path);
        assert_eq!(std::fs::read(&staged_path).unwrap(), b"from disk");

        drop(opened);
        assert!(!staged_path.exists());
    }

    #[tokio::test]
    async fn http_source_is_staged_in_spool() {
        let dir = tempfile::tempdir().unwrap();
        let app = axum::Router::new().route(
            "/clip.mp4",
            axum::routing::get(|| async {
                ([(axum::http::header::CONTENT_TYPE, "video/mp4")], "ftyp then mdat then moov")
            }),
        );
        let base = serve(app).await;

        let opened = store(&dir)
            .open_source(&SourceLocator::Remote(format!("{base}/clip.mp4")))
            .await
            .unwrap();
        assert!(opened.staged.is_some());
        assert_eq!(spool_entries(&dir), 1);
        assert_eq!(
            read_all(opened.input.into_reader().await.unwrap()).await,
            b"ftyp then mdat then moov"
        );
    }

    #[tokio::test]
    async fn html_page_is_source_error() {
        let dir = tempfile::tempdir().unwrap();
        let app = axum::Router::new().route(
            "/uc",
            axum::routing::get(|| async {
                axum::response::Html("<html><body>Google Drive can't scan this file</body></html>")
            }),
        );
        let base = serve(app).await;

        let err = match store(&dir)
            .open_source(&SourceLocator::Remote(format!("{base}/uc")))
            .await
        {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        match err {
            Error::Io {
                side: RelaySide::Source,
                message,
            } => assert!(message.contains("HTML")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(spool_entries(&dir), 0);
    }

    #[test]
    fn html_content_types() {
        assert!(is_html(Some("text/html")));
        assert!(is_html(Some("text/html; charset=utf-8")));
        assert!(is_html(Some("TEXT/HTML")));
        assert!(!is_html(Some("video/mp4")));
        assert!(!is_html(Some("application/octet-stream")));
        assert!(!is_html(None));
    }

    #[tokio::test]
    async fn missing_file_is_source_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = match store(&dir)
            .open_source(&SourceLocator::Remote("file:///nonexistent/input.mov".into()))
            .await
        {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert!(matches!(
            err,
            Error::Io {
                side: RelaySide::Source,
                ..
            }
        ));
        assert_eq!(spool_entries(&dir), 0);
    }

    #[tokio::test]
    async fn spooled_output_lives_until_last_reference() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let mut sink = store
            .open_sink(JobId::new(), &OutputTarget::Inline)
            .await
            .unwrap();
        sink.writer.write_all(b"transcoded").await.unwrap();
        sink.writer.shutdown().await.unwrap();
        drop(sink.writer);

        let output = store.commit(sink.pending).await.unwrap();
        let path = output.path().to_path_buf();
        assert!(path.starts_with(dir.path().join("spool")));
        assert_eq!(std::fs::read(&path).unwrap(), b"transcoded");

        drop(output);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn stored_output_is_renamed_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let target = OutputTarget::Stored {
            key: "clip.mp4".into(),
        };
        let mut sink = store.open_sink(JobId::new(), &target).await.unwrap();
        sink.writer.write_all(b"mp4 bytes").await.unwrap();
        sink.writer.shutdown().await.unwrap();
        drop(sink.writer);

        let output = store.commit(sink.pending).await.unwrap();
        let expected = dir.path().join("out").join("clip.mp4");
        assert_eq!(output.path(), expected.as_path());
        assert_eq!(std::fs::read(&expected).unwrap(), b"mp4 bytes");

        // Only the committed file remains; no temp leftovers.
        let entries = std::fs::read_dir(dir.path().join("out")).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn discard_removes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let target = OutputTarget::Stored {
            key: "partial.mp4".into(),
        };
        let mut sink = store.open_sink(JobId::new(), &target).await.unwrap();
        sink.writer.write_all(b"half").await.unwrap();
        drop(sink.writer);

        store.discard(sink.pending).await;
        let entries = std::fs::read_dir(dir.path().join("out")).unwrap().count();
        assert_eq!(entries, 0);
        assert!(!dir.path().join("out").join("partial.mp4").exists());
    }
}
