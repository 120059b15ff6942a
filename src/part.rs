use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;

use crate::ParseError;

/// Chunks buffered per file between the tokenizer and its consumer.
pub(crate) const FILE_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Default)]
struct StreamStatus {
    truncated: AtomicBool,
}

/// Body of one file part, streamed while the request is still being read.
///
/// Dropping the stream (or calling [`FileStream::discard`]) tells the
/// tokenizer to skip the rest of the part; parsing of later parts continues.
#[derive(Debug)]
pub struct FileStream {
    rx: mpsc::Receiver<Result<Bytes, ParseError>>,
    status: Arc<StreamStatus>,
}

impl FileStream {
    /// Returns a handle that can report truncation after the stream was consumed.
    pub fn monitor(&self) -> StreamMonitor {
        StreamMonitor {
            status: Arc::clone(&self.status),
        }
    }

    /// Returns `true` when the file size limit cut the part short.
    ///
    /// Only final once the stream has ended.
    pub fn truncated(&self) -> bool {
        self.status.truncated.load(Ordering::Acquire)
    }

    /// Closes the stream; the tokenizer discards the remaining bytes.
    pub fn discard(self) {
        drop(self);
    }
}

impl Stream for FileStream {
    type Item = Result<Bytes, ParseError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Observes the truncation flag of a [`FileStream`] that has been handed off.
#[derive(Debug, Clone)]
pub struct StreamMonitor {
    status: Arc<StreamStatus>,
}

impl StreamMonitor {
    /// Returns `true` when the file size limit cut the part short.
    pub fn truncated(&self) -> bool {
        self.status.truncated.load(Ordering::Acquire)
    }
}

/// Tokenizer side of a [`FileStream`].
#[derive(Debug)]
pub(crate) struct FileSink {
    tx: Option<mpsc::Sender<Result<Bytes, ParseError>>>,
    status: Arc<StreamStatus>,
    written: u64,
    limit: Option<u64>,
}

impl FileSink {
    /// Creates a connected sink and stream pair.
    pub(crate) fn channel(limit: Option<u64>) -> (Self, FileStream) {
        let (tx, rx) = mpsc::channel(FILE_CHANNEL_CAPACITY);
        let status = Arc::new(StreamStatus::default());
        let sink = Self {
            tx: Some(tx),
            status: Arc::clone(&status),
            written: 0,
            limit,
        };
        (sink, FileStream { rx, status })
    }

    /// Forwards a body chunk, cutting the part at the size limit.
    ///
    /// Bytes past the limit, or arriving after the consumer went away, are
    /// dropped. The limit is tracked even when nobody is reading.
    pub(crate) async fn feed(&mut self, chunk: Bytes) {
        if chunk.is_empty() || self.status.truncated.load(Ordering::Acquire) {
            return;
        }

        let mut chunk = chunk;
        let mut hit_limit = false;
        if let Some(limit) = self.limit {
            let remaining = limit.saturating_sub(self.written);
            if chunk.len() as u64 > remaining {
                chunk.truncate(remaining as usize);
                hit_limit = true;
            }
        }

        self.written += chunk.len() as u64;
        if !chunk.is_empty() {
            self.send(Ok(chunk)).await;
        }

        if hit_limit {
            self.status.truncated.store(true, Ordering::Release);
            self.tx = None;
        }
    }

    /// Forwards a read failure to the consumer and closes the stream.
    pub(crate) async fn fail(&mut self, err: ParseError) {
        self.send(Err(err)).await;
        self.tx = None;
    }

    /// Ends the stream.
    pub(crate) fn finish(self) {}

    async fn send(&mut self, item: Result<Bytes, ParseError>) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(item).await.is_err() {
            self.tx = None;
        }
    }
}
