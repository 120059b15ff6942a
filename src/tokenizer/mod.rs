//! Streaming multipart tokenizer.
//!
//! [`Tokenizer::run`] reads a request body to its end and reports what it
//! finds as [`TokenizerEvent`]s in wire order. File bodies are not buffered;
//! they flow through the [`FileStream`] carried by each file event.

/// Multipart boundary parsing helpers.
pub mod boundary;
/// Multipart part header parsing helpers.
pub mod headers;
mod scanner;

use std::{fmt::Display, pin::pin};

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

pub use boundary::{extract_multipart_boundary, Boundary};
pub use headers::{
    parse_content_disposition, parse_part_content_type, parse_part_headers,
    parse_transfer_encoding, ContentDisposition, PartHeaders,
};

use crate::{
    part::{FileSink, FileStream},
    storage::FileMeta,
    Limits, ParseError,
};
use scanner::{PartScanner, ScanItem};

/// Events queued between the tokenizer and its consumer.
pub const EVENT_CHANNEL_CAPACITY: usize = 32;

/// A complete text field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldEvent {
    /// Field name, cut at the field name size limit.
    pub name: String,
    /// Field value, cut at the field size limit.
    pub value: String,
    /// `true` when the name was cut.
    pub name_truncated: bool,
    /// `true` when the value was cut.
    pub value_truncated: bool,
    /// Declared transfer encoding.
    pub encoding: String,
    /// Declared content type.
    pub mime_type: mime::Mime,
}

/// The start of a file part.
#[derive(Debug)]
pub struct FileEvent {
    /// Part metadata.
    pub meta: FileMeta,
    /// Body of the part.
    pub stream: FileStream,
}

/// Everything the tokenizer reports, in wire order.
#[derive(Debug)]
pub enum TokenizerEvent {
    /// A text field.
    Field(FieldEvent),
    /// A file part; its body arrives through the event's stream.
    File(FileEvent),
    /// The part count limit was reached; later parts are skipped.
    PartsLimit,
    /// The file count limit was reached; later files are skipped.
    FilesLimit,
    /// The field count limit was reached; later fields are skipped.
    FieldsLimit,
    /// The body is malformed or could not be read. No further parts follow.
    Error(ParseError),
    /// The body was read to its end without error.
    Finish,
}

#[derive(Debug)]
enum Current {
    Idle,
    Field {
        headers: PartHeaders,
        name_truncated: bool,
        value: BytesMut,
        value_truncated: bool,
    },
    File(FileSink),
    Skip,
}

#[derive(Debug, Default)]
struct Counts {
    parts: usize,
    files: usize,
    fields: usize,
    parts_hit: bool,
    files_hit: bool,
    fields_hit: bool,
}

/// Multipart tokenizer for one request body.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    boundary: Boundary,
    limits: Limits,
    preserve_paths: bool,
}

impl Tokenizer {
    /// Creates a tokenizer from the request `Content-Type` value.
    pub fn new(content_type: &str, limits: Limits, preserve_paths: bool) -> Result<Self, ParseError> {
        let boundary = Boundary::from_content_type(content_type)?;
        Ok(Self {
            boundary,
            limits,
            preserve_paths,
        })
    }

    /// Returns the multipart boundary.
    pub fn boundary(&self) -> &str {
        self.boundary.as_str()
    }

    /// Reads `body` to its end, sending events to `events`.
    ///
    /// The body is drained even after an error or after the receiver has
    /// gone away.
    pub async fn run<S, E>(self, body: S, events: mpsc::Sender<TokenizerEvent>)
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let mut body = pin!(body);
        let mut run = Run {
            scanner: PartScanner::new(&self.boundary, self.limits.header_pairs),
            tokenizer: &self,
            events,
            current: Current::Idle,
            counts: Counts::default(),
            failed: false,
            done: false,
        };

        while let Some(chunk) = body.next().await {
            if run.failed {
                continue;
            }
            match chunk {
                Ok(chunk) => {
                    run.scanner.feed(&chunk);
                    run.advance(false).await;
                }
                Err(err) => run.fail(read_error(err)).await,
            }
        }

        if !run.failed {
            run.advance(true).await;
        }
        if !run.failed {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                parts = run.counts.parts,
                files = run.counts.files,
                fields = run.counts.fields,
                "tokenizer: finished"
            );
            run.emit(TokenizerEvent::Finish).await;
        }
    }
}

struct Run<'a> {
    scanner: PartScanner,
    tokenizer: &'a Tokenizer,
    events: mpsc::Sender<TokenizerEvent>,
    current: Current,
    counts: Counts,
    failed: bool,
    done: bool,
}

impl Run<'_> {
    async fn advance(&mut self, eof: bool) {
        while !self.done {
            let item = match self.scanner.next_item(eof) {
                Ok(item) => item,
                Err(err) => {
                    self.fail(err).await;
                    return;
                }
            };

            let step = match item {
                ScanItem::NeedMore => return,
                ScanItem::Done => {
                    self.done = true;
                    Ok(())
                }
                ScanItem::Headers(raw) => self.start_part(&raw).await,
                ScanItem::Body(bytes) => {
                    self.feed_part(bytes).await;
                    Ok(())
                }
                ScanItem::PartEnd => {
                    self.end_part().await;
                    Ok(())
                }
            };

            if let Err(err) = step {
                self.fail(err).await;
                return;
            }
        }
    }

    async fn start_part(&mut self, raw: &http::HeaderMap) -> Result<(), ParseError> {
        if headers::disposition_type(raw).as_deref() != Some("form-data") {
            self.current = Current::Skip;
            return Ok(());
        }

        let parsed = parse_part_headers(raw)?;
        let limits = self.tokenizer.limits;

        if self.counts.parts_hit || limits.parts.is_some_and(|max| self.counts.parts >= max) {
            self.hit_limit(TokenizerEvent::PartsLimit).await;
            self.current = Current::Skip;
            return Ok(());
        }
        self.counts.parts += 1;

        if parsed.is_file() {
            if self.counts.files_hit || limits.files.is_some_and(|max| self.counts.files >= max) {
                self.hit_limit(TokenizerEvent::FilesLimit).await;
                self.current = Current::Skip;
                return Ok(());
            }
            self.counts.files += 1;
            self.start_file(parsed).await;
        } else {
            if self.counts.fields_hit || limits.fields.is_some_and(|max| self.counts.fields >= max)
            {
                self.hit_limit(TokenizerEvent::FieldsLimit).await;
                self.current = Current::Skip;
                return Ok(());
            }
            self.counts.fields += 1;
            let mut headers = parsed;
            let name_truncated = truncate_utf8(&mut headers.field_name, limits.field_name_size);
            self.current = Current::Field {
                headers,
                name_truncated,
                value: BytesMut::new(),
                value_truncated: false,
            };
        }
        Ok(())
    }

    async fn start_file(&mut self, parsed: PartHeaders) {
        let raw_name = parsed.file_name.unwrap_or_default();
        let original_name = if self.tokenizer.preserve_paths {
            raw_name
        } else {
            basename(&raw_name).to_owned()
        };

        let (sink, stream) = FileSink::channel(self.tokenizer.limits.file_size);
        let meta = FileMeta {
            field_name: parsed.field_name,
            original_name,
            encoding: parsed.transfer_encoding,
            mime_type: parsed.content_type,
        };
        self.current = Current::File(sink);
        self.emit(TokenizerEvent::File(FileEvent { meta, stream })).await;
    }

    async fn feed_part(&mut self, bytes: Bytes) {
        let field_size = self.tokenizer.limits.field_size;
        match &mut self.current {
            Current::File(sink) => sink.feed(bytes).await,
            Current::Field {
                value,
                value_truncated,
                ..
            } => {
                if *value_truncated {
                    return;
                }
                let room = field_size.map_or(usize::MAX, |max| max.saturating_sub(value.len()));
                if bytes.len() > room {
                    value.extend_from_slice(&bytes[..room]);
                    *value_truncated = true;
                } else {
                    value.extend_from_slice(&bytes);
                }
            }
            Current::Idle | Current::Skip => {}
        }
    }

    async fn end_part(&mut self) {
        match std::mem::replace(&mut self.current, Current::Idle) {
            Current::File(sink) => sink.finish(),
            Current::Field {
                headers,
                name_truncated,
                value,
                value_truncated,
            } => {
                let event = FieldEvent {
                    name: headers.field_name,
                    value: String::from_utf8_lossy(&value).into_owned(),
                    name_truncated,
                    value_truncated,
                    encoding: headers.transfer_encoding,
                    mime_type: headers.content_type,
                };
                self.emit(TokenizerEvent::Field(event)).await;
            }
            Current::Idle | Current::Skip => {}
        }
    }

    async fn hit_limit(&mut self, event: TokenizerEvent) {
        let flag = match event {
            TokenizerEvent::PartsLimit => &mut self.counts.parts_hit,
            TokenizerEvent::FilesLimit => &mut self.counts.files_hit,
            TokenizerEvent::FieldsLimit => &mut self.counts.fields_hit,
            _ => return,
        };
        if std::mem::replace(flag, true) {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(event = ?event, "tokenizer: limit reached");
        self.emit(event).await;
    }

    async fn fail(&mut self, err: ParseError) {
        #[cfg(feature = "tracing")]
        tracing::debug!(error = %err, "tokenizer: failed");

        self.failed = true;
        self.done = true;
        let current = std::mem::replace(&mut self.current, Current::Idle);
        self.emit(TokenizerEvent::Error(err.clone())).await;
        if let Current::File(mut sink) = current {
            sink.fail(err).await;
        }
    }

    async fn emit(&mut self, event: TokenizerEvent) {
        // A gone consumer does not stop the body from being drained.
        let _ = self.events.send(event).await;
    }
}

fn read_error<E: Display>(err: E) -> ParseError {
    ParseError::new(format!("failed to read request body: {err}"))
}

/// Cuts `value` to at most `max` bytes on a character boundary.
fn truncate_utf8(value: &mut String, max: Option<usize>) -> bool {
    let Some(max) = max else {
        return false;
    };
    if value.len() <= max {
        return false;
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value.truncate(end);
    true
}

fn basename(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}
