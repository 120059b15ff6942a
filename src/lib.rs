#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Streaming `multipart/form-data` processing for `depart`.
//!
//! A [`Depart`] instance parses request bodies as they arrive, hands every
//! accepted file to one or more storage modules, and returns either the
//! complete [`FormData`] or one [`DepartError`]. When a request fails, files
//! it already stored are removed again before the error is returned.

/// Fluent builder API.
pub mod builder;
/// Processing configuration.
pub mod config;
/// Pending-work counter.
pub mod counter;
/// Error types exposed by this crate.
pub mod error;
pub mod field;
pub mod form;
/// Request and field limits.
pub mod limits;
/// Streamed file bodies.
pub mod part;
/// Storage module traits, built-in modules and dispatch.
pub mod storage;
pub mod tokenizer;

mod cleanup;
mod context;
mod engine;

#[cfg(feature = "actix")]
pub mod actix;
#[cfg(feature = "axum")]
pub mod axum;

use std::{fmt::Display, sync::Arc};

use bytes::Bytes;
use futures::Stream;
use http::{header, HeaderMap};

pub use builder::DepartBuilder;
pub use config::{DepartConfig, FileDecision, FileFieldRule, FileFields};
pub use counter::{CompletionCounter, PendingGuard};
pub use error::{ConfigError, CounterError, DepartError, ErrorKind, ParseError, StorageError};
pub use field::FieldValue;
pub use form::{FileId, FormData, FormDataBuilder, UploadedFile};
pub use limits::Limits;
pub use part::{FileStream, StreamMonitor};
pub use storage::{
    DiskStorage, DiskStorageBuilder, FileMeta, FilenameStrategy, MemoryStorage, ModuleOutcome,
    ModuleSetup, SetupPlan, StorageDispatcher, StorageModule, StorageResult, StorageSetup,
    StoredFile,
};

/// Reusable multipart processor.
///
/// Cloning is cheap; clones share one read-only configuration and can serve
/// any number of concurrent requests.
#[derive(Debug, Clone, Default)]
pub struct Depart {
    config: Arc<DepartConfig>,
}

impl Depart {
    /// Creates a processor that stores files in memory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a processor from an explicit configuration.
    pub fn with_config(config: DepartConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::with_config_unchecked(config))
    }

    pub(crate) fn with_config_unchecked(config: DepartConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Creates a fluent builder with permissive defaults.
    pub fn builder() -> DepartBuilder {
        DepartBuilder::default()
    }

    /// Returns the active configuration.
    pub fn config(&self) -> &DepartConfig {
        &self.config
    }

    /// Processes a request from its headers and body stream.
    pub async fn parse<S, E>(&self, headers: &HeaderMap, body: S) -> Result<FormData, DepartError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Display + Send,
    {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        self.parse_content_type(content_type, body).await
    }

    /// Processes a request from its raw `Content-Type` value and body stream.
    pub async fn parse_content_type<S, E>(
        &self,
        content_type: &str,
        body: S,
    ) -> Result<FormData, DepartError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Display + Send,
    {
        engine::process(Arc::clone(&self.config), content_type, body).await
    }
}
