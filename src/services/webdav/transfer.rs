//! Chunked streaming between local readers/writers and HTTP bodies
//!
//! Downloads read the response body in [`CHUNK_SIZE`] pieces, honor the pause
//! gate of an attached [`TransferProgress`] before every read, and report each
//! chunk to the tracker and the caller's progress callback. Whatever the
//! outcome, the body reader is dropped before the completion callback runs,
//! and the completion callback runs exactly once.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::progress::TransferProgress;
use crate::error::{Result, WebDavError};

/// 1 MiB
pub const CHUNK_SIZE: usize = 1024 * 1024;

pub type ProgressCallback = Box<dyn FnMut(u64) + Send>;
pub type CompletionCallback = Box<dyn FnOnce(bool) + Send>;

/// Caller hooks for a transfer
#[derive(Default)]
pub struct TransferCallbacks {
    pub(crate) on_progress: Option<ProgressCallback>,
    pub(crate) on_complete: Option<CompletionCallback>,
}

impl TransferCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with the length of every chunk moved
    pub fn on_progress(mut self, callback: impl FnMut(u64) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    /// Called once with the success flag when the transfer ends
    pub fn on_complete(mut self, callback: impl FnOnce(bool) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }
}

impl std::fmt::Debug for TransferCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferCallbacks")
            .field("on_progress", &self.on_progress.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

/// Runs a completion callback exactly once: explicitly through
/// [`complete`](Self::complete), or with `false` when dropped unfired
/// (early return, error, or task cancellation).
pub(crate) struct CompletionGuard {
    callback: Option<CompletionCallback>,
}

impl CompletionGuard {
    pub(crate) fn new(callback: Option<CompletionCallback>) -> Self {
        Self { callback }
    }

    pub(crate) fn complete(mut self, success: bool) {
        if let Some(callback) = self.callback.take() {
            callback(success);
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(false);
        }
    }
}

/// Settings for one [`copy_chunked`] run
#[derive(Debug, Default)]
pub struct TransferOptions {
    /// Required byte count; `None` or `Some(0)` accepts any clean end of stream
    pub expected_len: Option<u64>,
    pub progress: Option<Arc<TransferProgress>>,
    pub callbacks: TransferCallbacks,
}

impl TransferOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expected_len(mut self, len: Option<u64>) -> Self {
        self.expected_len = len;
        self
    }

    pub fn progress(mut self, progress: Arc<TransferProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn callbacks(mut self, callbacks: TransferCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Ends a transfer that failed before any data moved
    pub(crate) fn fail(self, err: WebDavError) -> WebDavError {
        if let Some(progress) = &self.progress {
            progress.finish(false);
        }
        CompletionGuard::new(self.callbacks.on_complete).complete(false);
        err
    }
}

/// Reads until `buf` is full, the reader is exhausted, or a read fails.
///
/// The length returned always counts the bytes read before a failure.
async fn read_chunk<R>(reader: &mut R, buf: &mut [u8]) -> (usize, io::Result<()>)
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) => return (filled, Err(e)),
        }
    }
    (filled, Ok(()))
}

/// Turns an I/O error back into the transport error it wraps, if any
pub(crate) fn classify_io_error(err: io::Error) -> WebDavError {
    let kind = err.kind();
    match err.into_inner() {
        Some(inner) => match inner.downcast::<reqwest::Error>() {
            Ok(transport) => WebDavError::Connection(*transport),
            Err(other) => WebDavError::Io(io::Error::new(kind, other)),
        },
        None => WebDavError::Io(io::Error::from(kind)),
    }
}

/// A body that stopped before its announced length: a plain EOF, or the
/// HTTP client rejecting an incomplete body
fn is_truncated_body(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        return true;
    }
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
        .is_some_and(|e| e.is_body() || e.is_decode())
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    expected_len: Option<u64>,
    progress: Option<&TransferProgress>,
    on_progress: &mut Option<ProgressCallback>,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let expected_len = expected_len.filter(|len| *len > 0);
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total: u64 = 0;

    loop {
        if let Some(progress) = progress {
            progress.gate().wait_open().await;
        }

        let (n, read_result) = read_chunk(reader, &mut buf).await;

        if n > 0 {
            if let Some(expected) = expected_len {
                if total + n as u64 > expected {
                    return Err(WebDavError::LengthExceeded { expected });
                }
            }

            writer.write_all(&buf[..n]).await?;
            total += n as u64;

            if let Some(progress) = progress {
                progress.add_bytes(n as u64);
            }
            if let Some(callback) = on_progress.as_mut() {
                callback(n as u64);
            }
        }

        if let Err(e) = read_result {
            writer.flush().await?;
            return Err(match expected_len {
                Some(expected) if total < expected && is_truncated_body(&e) => {
                    debug!("Body ended after {} of {} bytes: {}", total, expected, e);
                    WebDavError::ShortTransfer {
                        expected,
                        actual: total,
                    }
                }
                _ => classify_io_error(e),
            });
        }

        if n == 0 {
            break;
        }
    }

    writer.flush().await?;

    match expected_len {
        Some(expected) if total != expected => Err(WebDavError::ShortTransfer {
            expected,
            actual: total,
        }),
        _ => Ok(total),
    }
}

/// Copies `reader` into `writer` chunk by chunk.
///
/// `reader` is consumed and dropped before the completion callback fires.
pub async fn copy_chunked<R, W>(reader: R, writer: &mut W, options: TransferOptions) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let TransferOptions {
        expected_len,
        progress,
        callbacks,
    } = options;
    let completion = CompletionGuard::new(callbacks.on_complete);
    let mut on_progress = callbacks.on_progress;

    if let Some(progress) = &progress {
        if expected_len.is_some() {
            progress.set_total_length(expected_len);
        }
    }

    let mut reader = reader;
    let outcome = pump(
        &mut reader,
        writer,
        expected_len,
        progress.as_deref(),
        &mut on_progress,
    )
    .await;
    drop(reader);

    let success = outcome.is_ok();
    if let Some(progress) = &progress {
        progress.finish(success);
    }

    match &outcome {
        Ok(total) => info!("Transfer complete: {} bytes", total),
        Err(WebDavError::ShortTransfer { expected, actual }) => {
            warn!("Short transfer: expected {} bytes, received {}", expected, actual)
        }
        Err(e) => warn!("Transfer failed: {}", e),
    }

    completion.complete(success);
    outcome
}

/// Download body as an `AsyncRead`
pub(crate) fn response_reader(response: reqwest::Response) -> impl AsyncRead + Unpin + Send {
    use futures_util::TryStreamExt;

    let stream = response.bytes_stream().map_err(io::Error::other);
    debug!("Streaming response body in {} byte chunks", CHUNK_SIZE);
    tokio_util::io::StreamReader::new(Box::pin(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::ReadBuf;

    use crate::services::webdav::progress::TransferStatus;

    /// Reader that records when it is dropped
    struct TrackedReader {
        inner: io::Cursor<Vec<u8>>,
        fail_after: Option<(usize, io::ErrorKind)>,
        read_so_far: usize,
        dropped: Arc<AtomicUsize>,
    }

    impl TrackedReader {
        fn new(data: Vec<u8>, dropped: Arc<AtomicUsize>) -> Self {
            Self {
                inner: io::Cursor::new(data),
                fail_after: None,
                read_so_far: 0,
                dropped,
            }
        }
    }

    impl AsyncRead for TrackedReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if let Some((limit, kind)) = self.fail_after {
                if self.read_so_far >= limit {
                    return Poll::Ready(Err(io::Error::new(kind, "stream failed")));
                }
            }
            let before = buf.filled().len();
            let result = Pin::new(&mut self.inner).poll_read(cx, buf);
            let read = buf.filled().len() - before;
            self.read_so_far += read;
            result
        }
    }

    impl Drop for TrackedReader {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn recording_callbacks() -> (TransferCallbacks, Arc<Mutex<Vec<u64>>>, Arc<Mutex<Vec<bool>>>) {
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let completions = Arc::new(Mutex::new(Vec::new()));
        let c = Arc::clone(&chunks);
        let d = Arc::clone(&completions);
        let callbacks = TransferCallbacks::new()
            .on_progress(move |n| c.lock().unwrap().push(n))
            .on_complete(move |ok| d.lock().unwrap().push(ok));
        (callbacks, chunks, completions)
    }

    #[tokio::test]
    async fn test_three_mib_in_three_chunks() {
        let data: Vec<u8> = (0..3 * CHUNK_SIZE).map(|i| (i % 251) as u8).collect();
        let dropped = Arc::new(AtomicUsize::new(0));
        let progress = Arc::new(TransferProgress::new(None));
        let (callbacks, chunks, completions) = recording_callbacks();

        let mut sink = Vec::new();
        let total = copy_chunked(
            TrackedReader::new(data.clone(), Arc::clone(&dropped)),
            &mut sink,
            TransferOptions::new()
                .expected_len(Some(data.len() as u64))
                .progress(Arc::clone(&progress))
                .callbacks(callbacks),
        )
        .await
        .unwrap();

        assert_eq!(total, data.len() as u64);
        assert_eq!(sink, data);
        assert_eq!(*chunks.lock().unwrap(), vec![CHUNK_SIZE as u64; 3]);
        assert_eq!(*completions.lock().unwrap(), vec![true]);
        assert_eq!(progress.status(), TransferStatus::Done);
        assert_eq!(progress.bytes_transferred(), data.len() as u64);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_short_read_marks_error() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let progress = Arc::new(TransferProgress::new(None));
        let (callbacks, _chunks, completions) = recording_callbacks();

        let mut sink = Vec::new();
        let err = copy_chunked(
            TrackedReader::new(vec![7u8; 400], Arc::clone(&dropped)),
            &mut sink,
            TransferOptions::new()
                .expected_len(Some(500))
                .progress(Arc::clone(&progress))
                .callbacks(callbacks),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, WebDavError::ShortTransfer { expected: 500, actual: 400 }));
        assert_eq!(progress.status(), TransferStatus::Error);
        assert_eq!(*completions.lock().unwrap(), vec![false]);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_truncated_body_keeps_received_bytes() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let progress = Arc::new(TransferProgress::new(None));
        let (callbacks, chunks, completions) = recording_callbacks();
        let mut reader = TrackedReader::new(vec![7u8; 400], Arc::clone(&dropped));
        reader.fail_after = Some((400, io::ErrorKind::UnexpectedEof));

        let mut sink = Vec::new();
        let err = copy_chunked(
            reader,
            &mut sink,
            TransferOptions::new()
                .expected_len(Some(500))
                .progress(Arc::clone(&progress))
                .callbacks(callbacks),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, WebDavError::ShortTransfer { expected: 500, actual: 400 }));
        assert_eq!(sink, vec![7u8; 400]);
        assert_eq!(*chunks.lock().unwrap(), vec![400]);
        assert_eq!(progress.bytes_transferred(), 400);
        assert_eq!(progress.status(), TransferStatus::Error);
        assert_eq!(*completions.lock().unwrap(), vec![false]);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_eof_error_without_known_length_stays_io() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let mut reader = TrackedReader::new(vec![7u8; 400], dropped);
        reader.fail_after = Some((400, io::ErrorKind::UnexpectedEof));

        let mut sink = Vec::new();
        let err = copy_chunked(reader, &mut sink, TransferOptions::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            WebDavError::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof
        ));
        assert_eq!(sink.len(), 400);
    }

    #[tokio::test]
    async fn test_unknown_length_always_succeeds_on_clean_end() {
        for expected in [None, Some(0)] {
            let dropped = Arc::new(AtomicUsize::new(0));
            let mut sink = Vec::new();
            let total = copy_chunked(
                TrackedReader::new(vec![1u8; 1234], dropped),
                &mut sink,
                TransferOptions::new().expected_len(expected),
            )
            .await
            .unwrap();
            assert_eq!(total, 1234);
        }
    }

    #[tokio::test]
    async fn test_overlong_stream_never_exceeds_total() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let progress = Arc::new(TransferProgress::new(None));
        let mut sink = Vec::new();

        let err = copy_chunked(
            TrackedReader::new(vec![0u8; 600], dropped),
            &mut sink,
            TransferOptions::new()
                .expected_len(Some(500))
                .progress(Arc::clone(&progress)),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, WebDavError::LengthExceeded { expected: 500 }));
        assert!(progress.bytes_transferred() <= 500);
        assert_eq!(progress.status(), TransferStatus::Error);
    }

    #[tokio::test]
    async fn test_io_error_releases_reader_and_reports_failure() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let (callbacks, _chunks, completions) = recording_callbacks();
        let mut reader = TrackedReader::new(vec![0u8; 4096], Arc::clone(&dropped));
        reader.fail_after = Some((1024, io::ErrorKind::ConnectionReset));

        let mut sink = Vec::new();
        let err = copy_chunked(reader, &mut sink, TransferOptions::new().callbacks(callbacks))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            WebDavError::Io(ref e) if e.kind() == io::ErrorKind::ConnectionReset
        ));
        // Bytes read before the failure still reach the sink
        assert_eq!(sink.len(), 4096);
        assert_eq!(*completions.lock().unwrap(), vec![false]);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pause_halts_reads_until_resume() {
        let (client, mut server) = tokio::io::duplex(64);
        let progress = Arc::new(TransferProgress::new(None));
        let finished = Arc::new(AtomicBool::new(false));

        let task = {
            let progress = Arc::clone(&progress);
            let finished = Arc::clone(&finished);
            tokio::spawn(async move {
                let mut sink = Vec::new();
                let callbacks = TransferCallbacks::new()
                    .on_complete(move |ok| finished.store(ok, Ordering::SeqCst));
                copy_chunked(
                    client,
                    &mut sink,
                    TransferOptions::new().progress(progress).callbacks(callbacks),
                )
                .await
                .map(|_| sink)
            })
        };

        progress.pause();
        server.write_all(b"hello").await.unwrap();
        drop(server);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(progress.bytes_transferred(), 0);
        assert_eq!(progress.status(), TransferStatus::Paused);
        assert!(!task.is_finished());

        progress.resume();
        let sink = task.await.unwrap().unwrap();
        assert_eq!(sink, b"hello");
        assert_eq!(progress.status(), TransferStatus::Done);
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_completion_guard_fires_false_on_drop() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let f = Arc::clone(&fired);
        let guard = CompletionGuard::new(Some(Box::new(move |ok| f.lock().unwrap().push(ok))));
        drop(guard);
        assert_eq!(*fired.lock().unwrap(), vec![false]);
    }

    #[test]
    fn test_completion_guard_fires_once() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let f = Arc::clone(&fired);
        let guard = CompletionGuard::new(Some(Box::new(move |ok| f.lock().unwrap().push(ok))));
        guard.complete(true);
        assert_eq!(*fired.lock().unwrap(), vec![true]);
    }
}
