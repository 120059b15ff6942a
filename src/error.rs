use std::fmt;

use http::StatusCode;
use thiserror::Error;

/// Configuration-time validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A file field name was empty.
    #[error("file field name cannot be empty")]
    EmptyFieldName,
    /// A file field rule has an invalid `max_files` of zero.
    #[error("file field `{name}` has invalid max_files of 0")]
    InvalidMaxFiles {
        /// Name of the field with an invalid count.
        name: String,
    },
    /// The same file field name was declared twice.
    #[error("duplicate file field `{name}`")]
    DuplicateFieldName {
        /// Duplicated field name.
        name: String,
    },
    /// A configured numeric limit must be strictly greater than zero.
    #[error("limit `{limit}` must be greater than 0")]
    InvalidLimitValue {
        /// Name of the limit.
        limit: &'static str,
    },
    /// A fan-out storage list was configured without any module.
    #[error("fan-out storage requires at least one storage module")]
    EmptyFanOut,
    /// A per-module storage setup did not line up with the configured modules.
    #[error("storage setup has {actual} entries but {expected} storage modules are configured")]
    SetupLengthMismatch {
        /// Number of configured storage modules.
        expected: usize,
        /// Number of setup entries supplied.
        actual: usize,
    },
}

/// Tokenizer-level multipart failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Generic parser failure with message context.
    #[error("{message}")]
    Message {
        /// Parser failure message.
        message: String,
    },
}

impl ParseError {
    /// Creates a parser error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }
}

/// Storage module failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Generic storage failure with message context.
    #[error("{message}")]
    Message {
        /// Storage failure message.
        message: String,
    },
}

impl StorageError {
    /// Creates a storage error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }
}

/// Misuse of a [`CompletionCounter`](crate::counter::CompletionCounter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CounterError {
    /// `decrement` was called while the count was already zero.
    #[error("completion counter decremented below zero")]
    Underflow,
}

/// Stable classification of a request failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Unclassified failure, including errors raised by user hooks.
    Internal,
    /// Too many parts in the request.
    PartCountLimit,
    /// A file was truncated by the file size limit.
    FileSizeLimit,
    /// Too many files in the request.
    FileCountLimit,
    /// A field name was too long or truncated.
    FieldKeyLimit,
    /// A field value was truncated.
    FieldValueLimit,
    /// Too many fields in the request.
    FieldCountLimit,
    /// A file arrived under a field that does not accept it.
    UnexpectedFile,
    /// The configuration or a hook-supplied storage setup is invalid.
    InvalidConfiguration,
    /// The request is not valid multipart form data.
    InvalidFormData,
    /// A storage module failed.
    Storage,
}

impl ErrorKind {
    /// Returns the stable machine-readable code for this kind.
    pub fn code(self) -> &'static str {
        match self {
            Self::Internal => "INTERNAL_ERROR",
            Self::PartCountLimit => "LIMIT_PART_COUNT",
            Self::FileSizeLimit => "LIMIT_FILE_SIZE",
            Self::FileCountLimit => "LIMIT_FILE_COUNT",
            Self::FieldKeyLimit => "LIMIT_FIELD_KEY",
            Self::FieldValueLimit => "LIMIT_FIELD_VALUE",
            Self::FieldCountLimit => "LIMIT_FIELD_COUNT",
            Self::UnexpectedFile => "LIMIT_UNEXPECTED_FILE",
            Self::InvalidConfiguration => "INVALID_CONFIGURATION",
            Self::InvalidFormData => "INVALID_FORMDATA",
            Self::Storage => "STORAGE_ERROR",
        }
    }

    /// Returns the human-readable summary for this kind.
    pub fn message(self) -> &'static str {
        match self {
            Self::Internal => "Unhandled exception",
            Self::PartCountLimit => "Too many parts",
            Self::FileSizeLimit => "File too large",
            Self::FileCountLimit => "Too many files",
            Self::FieldKeyLimit => "Field name too long",
            Self::FieldValueLimit => "Field value too long",
            Self::FieldCountLimit => "Too many fields",
            Self::UnexpectedFile => "Unexpected field",
            Self::InvalidConfiguration => "A required configuration property is missing or invalid",
            Self::InvalidFormData => "Invalid form or data",
            Self::Storage => "Error during file storage",
        }
    }

    /// Returns the HTTP status a framework adapter should answer with.
    pub fn status_code(self) -> StatusCode {
        match self {
            Self::PartCountLimit
            | Self::FileSizeLimit
            | Self::FileCountLimit
            | Self::FieldKeyLimit
            | Self::FieldValueLimit
            | Self::FieldCountLimit => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UnexpectedFile | Self::InvalidFormData => StatusCode::BAD_REQUEST,
            Self::Internal | Self::InvalidConfiguration | Self::Storage => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Terminal error of a multipart request.
///
/// The first fatal error of a request is the reported one. Errors observed
/// while winding down (other storage failures, cleanup failures) are kept in
/// [`DepartError::related`] instead of replacing it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}{}", render_tail(.details, .related))]
pub struct DepartError {
    kind: ErrorKind,
    details: Option<String>,
    related: Vec<DepartError>,
}

impl DepartError {
    /// Creates an error of `kind` without details.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            details: None,
            related: Vec::new(),
        }
    }

    /// Creates an error of `kind` carrying a detail string.
    pub fn with_details(kind: ErrorKind, details: impl Into<String>) -> Self {
        Self {
            kind,
            details: Some(details.into()),
            related: Vec::new(),
        }
    }

    /// Creates an [`ErrorKind::Internal`] error, the usual choice for hook failures.
    pub fn internal(details: impl Into<String>) -> Self {
        Self::with_details(ErrorKind::Internal, details)
    }

    /// Wraps a storage module failure with the file it was processing.
    pub fn storage(field_name: &str, original_name: &str, err: &StorageError) -> Self {
        Self::with_details(
            ErrorKind::Storage,
            format!("{field_name}.{original_name}: {err}"),
        )
    }

    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the stable code of the error kind.
    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    /// Returns the detail string, commonly the offending field name.
    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    /// Returns errors merged into this one after it was raised.
    pub fn related(&self) -> &[DepartError] {
        &self.related
    }

    /// Returns the HTTP status matching the error kind.
    pub fn status_code(&self) -> StatusCode {
        self.kind.status_code()
    }

    /// Appends `other` to the related trail.
    pub fn fold(&mut self, other: DepartError) {
        self.related.push(other);
    }

    /// Appends every error of `others` to the related trail.
    pub fn with_related(mut self, others: impl IntoIterator<Item = DepartError>) -> Self {
        self.related.extend(others);
        self
    }
}

fn render_tail(details: &Option<String>, related: &[DepartError]) -> String {
    let mut out = String::new();
    if let Some(details) = details {
        out.push_str(": ");
        out.push_str(details);
    }
    if !related.is_empty() {
        let rendered: Vec<String> = related.iter().map(ToString::to_string).collect();
        out.push_str(" (also: ");
        out.push_str(&rendered.join("; "));
        out.push(')');
    }
    out
}

impl From<ConfigError> for DepartError {
    fn from(err: ConfigError) -> Self {
        Self::with_details(ErrorKind::InvalidConfiguration, err.to_string())
    }
}

impl From<ParseError> for DepartError {
    fn from(err: ParseError) -> Self {
        Self::with_details(ErrorKind::InvalidFormData, err.to_string())
    }
}

impl From<StorageError> for DepartError {
    fn from(err: StorageError) -> Self {
        Self::with_details(ErrorKind::Storage, err.to_string())
    }
}

impl From<CounterError> for DepartError {
    fn from(err: CounterError) -> Self {
        Self::internal(err.to_string())
    }
}
