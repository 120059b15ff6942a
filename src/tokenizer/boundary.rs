use std::fmt;

use super::headers::percent_decode_utf8;
use crate::error::ParseError;

/// RFC 2046 caps boundaries at 70 characters.
const MAX_BOUNDARY_LEN: usize = 70;

/// Validated boundary of one `multipart/form-data` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Boundary(String);

impl Boundary {
    /// Reads the boundary from a request `Content-Type` value.
    pub fn from_content_type(content_type: &str) -> Result<Self, ParseError> {
        let mime = content_type
            .parse::<mime::Mime>()
            .map_err(|_| ParseError::new("invalid Content-Type header"))?;

        if mime.type_() != mime::MULTIPART || mime.subtype() != mime::FORM_DATA {
            return Err(ParseError::new("Content-Type must be multipart/form-data"));
        }

        let raw = mime
            .get_param("boundary")
            .ok_or_else(|| ParseError::new("missing multipart boundary parameter"))?;

        let value = if raw.as_str().contains('%') {
            percent_decode_utf8(
                raw.as_str(),
                "invalid percent-encoding in multipart boundary",
                "multipart boundary percent-encoding is not valid UTF-8",
            )?
        } else {
            raw.as_str().to_owned()
        };

        Self::new(value)
    }

    /// Validates a bare boundary value.
    pub fn new(value: impl Into<String>) -> Result<Self, ParseError> {
        let value = value.into();
        let message = match value.as_str() {
            "" => Some("multipart boundary cannot be empty"),
            v if v.len() > MAX_BOUNDARY_LEN => {
                Some("multipart boundary cannot exceed 70 characters")
            }
            v if v.ends_with(' ') => Some("multipart boundary cannot end with whitespace"),
            v if !v.chars().all(is_bchar) => Some("multipart boundary contains invalid characters"),
            _ => None,
        };

        match message {
            Some(message) => Err(ParseError::new(message)),
            None => Ok(Self(value)),
        }
    }

    /// Returns the boundary text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Bytes that open every part and the closing marker, CRLF included.
    pub(crate) fn delimiter(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() + 4);
        out.extend_from_slice(b"\r\n--");
        out.extend_from_slice(self.0.as_bytes());
        out
    }
}

impl fmt::Display for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extracts and validates the `boundary` parameter from a `Content-Type` value.
pub fn extract_multipart_boundary(content_type: &str) -> Result<String, ParseError> {
    Boundary::from_content_type(content_type).map(|boundary| boundary.0)
}

fn is_bchar(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '\'' | '(' | ')' | '+' | '_' | ',' | '-' | '.' | '/' | ':' | '=' | '?' | ' '
        )
}
