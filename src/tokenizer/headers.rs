use http::{header, HeaderMap, HeaderValue};

use crate::error::ParseError;

const DEFAULT_PART_CONTENT_TYPE: &str = "application/octet-stream";
const DEFAULT_TRANSFER_ENCODING: &str = "7bit";
const CONTENT_TRANSFER_ENCODING: &str = "content-transfer-encoding";

/// Parsed `Content-Disposition` of one part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDisposition {
    /// Disposition type, lowercased.
    pub disposition: String,
    /// `name` parameter.
    pub name: Option<String>,
    /// `filename*` when present, otherwise `filename`.
    pub filename: Option<String>,
}

impl ContentDisposition {
    /// Parses a raw header value.
    pub fn parse(value: &str) -> Result<Self, ParseError> {
        let (kind, params) = value.split_once(';').unwrap_or((value, ""));
        let disposition = kind.trim().to_ascii_lowercase();
        if disposition.is_empty() {
            return Err(ParseError::new("invalid Content-Disposition header"));
        }

        let mut name = None;
        let mut filename = None;
        let mut extended = None;
        let mut cursor = Params { rest: params };
        while let Some((key, value)) = cursor.next_param()? {
            if key.eq_ignore_ascii_case("name") {
                name = Some(value);
            } else if key.eq_ignore_ascii_case("filename") {
                filename = Some(value);
            } else if key.eq_ignore_ascii_case("filename*") {
                extended = Some(decode_ext_value(&value)?);
            }
        }

        if disposition == "form-data" && name.as_deref().map_or(true, str::is_empty) {
            return Err(ParseError::new(
                "form-data Content-Disposition must include non-empty `name`",
            ));
        }

        Ok(Self {
            disposition,
            name,
            filename: extended.or(filename),
        })
    }
}

/// Headers of one part, reduced to what the tokenizer acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartHeaders {
    /// Field name from the disposition.
    pub field_name: String,
    /// Client filename; `Some` marks the part as a file.
    pub file_name: Option<String>,
    /// Part `Content-Type`.
    pub content_type: mime::Mime,
    /// Declared `Content-Transfer-Encoding`, lowercased.
    pub transfer_encoding: String,
}

impl PartHeaders {
    /// Returns `true` when the part declares a filename, even an empty one.
    pub fn is_file(&self) -> bool {
        self.file_name.is_some()
    }
}

/// Parses a part `Content-Disposition` value.
pub fn parse_content_disposition(value: &str) -> Result<ContentDisposition, ParseError> {
    ContentDisposition::parse(value)
}

/// Parses a part `Content-Type`, defaulting to `application/octet-stream`.
pub fn parse_part_content_type(value: Option<&str>) -> Result<mime::Mime, ParseError> {
    value
        .unwrap_or(DEFAULT_PART_CONTENT_TYPE)
        .trim()
        .parse::<mime::Mime>()
        .map_err(|_| ParseError::new("invalid part Content-Type header"))
}

/// Reads the disposition, content type and transfer encoding of a part.
pub fn parse_part_headers(headers: &HeaderMap) -> Result<PartHeaders, ParseError> {
    let raw = headers
        .get(header::CONTENT_DISPOSITION)
        .ok_or_else(|| ParseError::new("missing Content-Disposition header"))?;
    let raw = header_text(raw)
        .ok_or_else(|| ParseError::new("Content-Disposition header must be UTF-8"))?;
    let disposition = ContentDisposition::parse(raw)?;

    let content_type = match headers.get(header::CONTENT_TYPE) {
        Some(value) => Some(
            header_text(value)
                .ok_or_else(|| ParseError::new("Content-Type header must be UTF-8"))?,
        ),
        None => None,
    };

    Ok(PartHeaders {
        field_name: disposition
            .name
            .ok_or_else(|| ParseError::new("missing part field name"))?,
        file_name: disposition.filename,
        content_type: parse_part_content_type(content_type)?,
        transfer_encoding: parse_transfer_encoding(headers)?,
    })
}

/// Reads the part `Content-Transfer-Encoding`, defaulting to `7bit`.
pub fn parse_transfer_encoding(headers: &HeaderMap) -> Result<String, ParseError> {
    let value = match headers.get(CONTENT_TRANSFER_ENCODING) {
        Some(value) => header_text(value)
            .ok_or_else(|| ParseError::new("Content-Transfer-Encoding header must be UTF-8"))?
            .trim(),
        None => "",
    };

    Ok(if value.is_empty() {
        DEFAULT_TRANSFER_ENCODING.to_owned()
    } else {
        value.to_ascii_lowercase()
    })
}

/// Returns the disposition type of a part, if it declares one.
pub(crate) fn disposition_type(headers: &HeaderMap) -> Option<String> {
    let raw = header_text(headers.get(header::CONTENT_DISPOSITION)?)?;
    let kind = raw.split(';').next()?.trim();
    (!kind.is_empty()).then(|| kind.to_ascii_lowercase())
}

/// Part headers may carry raw UTF-8, which `HeaderValue::to_str` rejects.
fn header_text(value: &HeaderValue) -> Option<&str> {
    std::str::from_utf8(value.as_bytes()).ok()
}

/// Walks `key=value` pairs separated by `;`, honouring quoted strings.
struct Params<'a> {
    rest: &'a str,
}

impl Params<'_> {
    fn next_param(&mut self) -> Result<Option<(String, String)>, ParseError> {
        let rest = self.rest.trim_start_matches(|c: char| c == ';' || c.is_whitespace());
        if rest.is_empty() {
            self.rest = rest;
            return Ok(None);
        }

        let Some(eq) = rest.find(['=', ';']).filter(|&at| rest[at..].starts_with('=')) else {
            return Err(ParseError::new(
                "invalid Content-Disposition parameter format",
            ));
        };
        let key = rest[..eq].trim().to_owned();
        let after = rest[eq + 1..].trim_start();

        let (value, tail) = match after.strip_prefix('"') {
            Some(quoted) => read_quoted(quoted)?,
            None => {
                let end = after.find(';').unwrap_or(after.len());
                let token = after[..end].trim();
                if token.contains('"') {
                    return Err(ParseError::new("invalid quoted parameter value"));
                }
                (token.to_owned(), &after[end..])
            }
        };

        self.rest = tail;
        Ok(Some((key, value)))
    }
}

/// Reads a quoted string body; returns the unescaped text and what follows it.
fn read_quoted(input: &str) -> Result<(String, &str), ParseError> {
    let mut value = String::new();
    let mut chars = input.char_indices();

    while let Some((at, ch)) = chars.next() {
        match ch {
            '"' => {
                let tail = input[at + 1..].trim_start();
                if !(tail.is_empty() || tail.starts_with(';')) {
                    return Err(ParseError::new("invalid quoted parameter value"));
                }
                return Ok((value, tail));
            }
            '\\' => match chars.next() {
                Some((_, escaped)) => value.push(escaped),
                None => break,
            },
            other => value.push(other),
        }
    }

    Err(ParseError::new("unterminated quoted parameter value"))
}

/// Decodes an RFC 5987 `charset'language'value` string.
fn decode_ext_value(value: &str) -> Result<String, ParseError> {
    let mut pieces = value.splitn(3, '\'');
    let (Some(charset), Some(_language), Some(encoded)) =
        (pieces.next(), pieces.next(), pieces.next())
    else {
        return Err(ParseError::new("invalid filename* parameter encoding"));
    };

    if !charset.eq_ignore_ascii_case("utf-8") {
        return Err(ParseError::new("only UTF-8 filename* charset is supported"));
    }

    percent_decode_utf8(
        encoded,
        "invalid percent-encoding in filename*",
        "filename* is not valid UTF-8",
    )
}

pub(crate) fn percent_decode_utf8(
    value: &str,
    bad_escape: &'static str,
    bad_utf8: &'static str,
) -> Result<String, ParseError> {
    let mut out = Vec::with_capacity(value.len());
    let mut bytes = value.bytes();

    while let Some(byte) = bytes.next() {
        if byte != b'%' {
            out.push(byte);
            continue;
        }
        match (
            bytes.next().and_then(hex_digit),
            bytes.next().and_then(hex_digit),
        ) {
            (Some(hi), Some(lo)) => out.push((hi << 4) | lo),
            _ => return Err(ParseError::new(bad_escape)),
        }
    }

    String::from_utf8(out).map_err(|_| ParseError::new(bad_utf8))
}

fn hex_digit(byte: u8) -> Option<u8> {
    char::from(byte).to_digit(16).map(|digit| digit as u8)
}
