use bytes::{Buf, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue};

use super::boundary::Boundary;
use crate::error::ParseError;

/// Upper bound on one part's header block.
const MAX_HEADER_BLOCK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Preamble,
    Headers,
    Body,
    Epilogue,
}

/// One step of progress through a multipart body.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ScanItem {
    /// Raw headers of a new part.
    Headers(HeaderMap),
    /// A chunk of the current part's body.
    Body(Bytes),
    /// The current part ended.
    PartEnd,
    /// The closing boundary was seen; remaining input is epilogue.
    Done,
    /// More input is required.
    NeedMore,
}

/// Incremental multipart scanner.
///
/// Input is pushed with [`PartScanner::feed`] and progress is pulled with
/// [`PartScanner::next_item`]; body bytes are released as soon as they cannot
/// belong to a boundary.
#[derive(Debug)]
pub(crate) struct PartScanner {
    delimiter: Vec<u8>,
    buffer: BytesMut,
    state: ScanState,
    header_pairs: Option<usize>,
}

impl PartScanner {
    pub(crate) fn new(boundary: &Boundary, header_pairs: Option<usize>) -> Self {
        let mut buffer = BytesMut::new();
        // Lets the opening boundary match the same CRLF-prefixed delimiter.
        buffer.extend_from_slice(b"\r\n");
        Self {
            delimiter: boundary.delimiter(),
            buffer,
            state: ScanState::Preamble,
            header_pairs,
        }
    }

    pub(crate) fn feed(&mut self, chunk: &[u8]) {
        if self.state == ScanState::Epilogue {
            return;
        }
        self.buffer.extend_from_slice(chunk);
    }

    /// Returns the next item; `eof` reports that no more input will arrive.
    pub(crate) fn next_item(&mut self, eof: bool) -> Result<ScanItem, ParseError> {
        let item = match self.state {
            ScanState::Preamble => self.scan_preamble()?,
            ScanState::Headers => self.scan_headers()?,
            ScanState::Body => self.scan_body()?,
            ScanState::Epilogue => {
                self.buffer.clear();
                return Ok(ScanItem::Done);
            }
        };

        if item == ScanItem::NeedMore && eof {
            return Err(ParseError::new("Unexpected end of form"));
        }
        Ok(item)
    }

    fn scan_preamble(&mut self) -> Result<ScanItem, ParseError> {
        let Some(start) = find_subslice(&self.buffer, &self.delimiter) else {
            let keep = self.delimiter.len().saturating_sub(1);
            if self.buffer.len() > keep {
                let excess = self.buffer.len() - keep;
                self.buffer.advance(excess);
            }
            return Ok(ScanItem::NeedMore);
        };

        match self.after_delimiter(start)? {
            Some(closing) => {
                self.state = if closing {
                    ScanState::Epilogue
                } else {
                    ScanState::Headers
                };
                self.next_after_boundary(closing)
            }
            None => Ok(ScanItem::NeedMore),
        }
    }

    fn scan_headers(&mut self) -> Result<ScanItem, ParseError> {
        let block_len = if self.buffer.starts_with(b"\r\n") {
            0
        } else {
            match find_subslice(&self.buffer, b"\r\n\r\n") {
                Some(end) => end + 2,
                None if self.buffer.len() > MAX_HEADER_BLOCK => {
                    return Err(ParseError::new("Malformed part header"));
                }
                None => return Ok(ScanItem::NeedMore),
            }
        };

        if block_len > MAX_HEADER_BLOCK {
            return Err(ParseError::new("Malformed part header"));
        }

        let raw = self.buffer.split_to(block_len);
        self.buffer.advance(2);
        let headers = parse_header_block(&raw, self.header_pairs)?;
        self.state = ScanState::Body;
        Ok(ScanItem::Headers(headers))
    }

    fn scan_body(&mut self) -> Result<ScanItem, ParseError> {
        match find_subslice(&self.buffer, &self.delimiter) {
            Some(0) => match self.after_delimiter(0)? {
                Some(closing) => {
                    self.state = if closing {
                        ScanState::Epilogue
                    } else {
                        ScanState::Headers
                    };
                    Ok(ScanItem::PartEnd)
                }
                None => Ok(ScanItem::NeedMore),
            },
            Some(end) => Ok(ScanItem::Body(self.buffer.split_to(end).freeze())),
            None => {
                let safe = safe_body_len(&self.buffer, &self.delimiter);
                if safe == 0 {
                    return Ok(ScanItem::NeedMore);
                }
                Ok(ScanItem::Body(self.buffer.split_to(safe).freeze()))
            }
        }
    }

    /// Consumes a delimiter at `start` and the line ending after it.
    ///
    /// Returns `Some(true)` for the closing boundary, `Some(false)` for a part
    /// boundary and `None` when more input is needed.
    fn after_delimiter(&mut self, start: usize) -> Result<Option<bool>, ParseError> {
        let suffix_start = start + self.delimiter.len();
        let suffix = &self.buffer[suffix_start..];

        if suffix.starts_with(b"--") {
            self.buffer.advance(suffix_start + 2);
            return Ok(Some(true));
        }

        let padding = suffix
            .iter()
            .take_while(|byte| matches!(byte, b' ' | b'\t'))
            .count();
        let rest = &suffix[padding..];
        if rest.starts_with(b"\r\n") {
            self.buffer.advance(suffix_start + padding + 2);
            return Ok(Some(false));
        }

        let undecided = rest.is_empty() || rest == b"\r" || (padding == 0 && rest == b"-");
        if undecided {
            return Ok(None);
        }
        Err(ParseError::new("malformed multipart boundary"))
    }

    fn next_after_boundary(&mut self, closing: bool) -> Result<ScanItem, ParseError> {
        if closing {
            self.buffer.clear();
            return Ok(ScanItem::Done);
        }
        self.scan_headers()
    }
}

/// Bytes at the front of `buffer` that cannot be part of a delimiter.
fn safe_body_len(buffer: &[u8], delimiter: &[u8]) -> usize {
    let tail_start = buffer.len().saturating_sub(delimiter.len() - 1);
    for start in tail_start..buffer.len() {
        if delimiter.starts_with(&buffer[start..]) {
            return start;
        }
    }
    buffer.len()
}

fn parse_header_block(raw: &[u8], max_pairs: Option<usize>) -> Result<HeaderMap, ParseError> {
    let text =
        std::str::from_utf8(raw).map_err(|_| ParseError::new("part headers must be UTF-8"))?;
    let mut headers = HeaderMap::new();

    let lines = text.split("\r\n").filter(|line| !line.is_empty());
    for line in lines.take(max_pairs.unwrap_or(usize::MAX)) {
        let Some((raw_name, raw_value)) = line.split_once(':') else {
            return Err(ParseError::new("Malformed part header"));
        };

        let name = raw_name
            .trim()
            .parse::<HeaderName>()
            .map_err(|_| ParseError::new("invalid part header name"))?;
        let value = HeaderValue::from_str(raw_value.trim())
            .map_err(|_| ParseError::new("invalid part header value"))?;
        headers.append(name, value);
    }

    Ok(headers)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }

    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
