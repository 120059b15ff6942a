//! Storage module abstractions and built-in implementations.

use std::{path::PathBuf, pin::Pin};

use bytes::Bytes;
use futures::Stream;

use crate::{ParseError, StorageError};

/// Disk-backed storage module.
pub mod disk;
/// Single and fan-out dispatch over storage modules.
pub mod dispatch;
/// In-memory storage module.
pub mod memory;
pub use disk::{DiskStorage, DiskStorageBuilder, FilenameStrategy};
pub use dispatch::StorageDispatcher;
pub use memory::MemoryStorage;

/// Boxed stream type used by storage modules.
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = T> + Send + 'a>>;

/// Byte stream of one file part as handed to a storage module.
pub type FileBody<'a> = BoxStream<'a, Result<Bytes, ParseError>>;

/// Metadata describing a file part before persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    /// Multipart field name.
    pub field_name: String,
    /// Client-supplied filename.
    pub original_name: String,
    /// Declared transfer encoding of the part.
    pub encoding: String,
    /// Content type observed on the uploaded file part.
    pub mime_type: mime::Mime,
}

/// Metadata describing a stored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    /// Module-specific opaque key or location identifier.
    pub storage_key: String,
    /// Multipart field name.
    pub field_name: String,
    /// Client-supplied filename.
    pub original_name: String,
    /// Content type observed on the uploaded file part.
    pub content_type: mime::Mime,
    /// Persisted file size in bytes.
    pub size: u64,
    /// Final filesystem path when stored on disk.
    pub path: Option<PathBuf>,
    /// File contents when the module keeps them in memory.
    pub buffer: Option<Bytes>,
}

/// What one storage module did with one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleOutcome {
    /// The module persisted the file.
    Stored(StoredFile),
    /// The module deliberately did not store the file.
    Skipped,
}

impl ModuleOutcome {
    /// Returns the stored file, if any.
    pub fn stored(&self) -> Option<&StoredFile> {
        match self {
            Self::Stored(file) => Some(file),
            Self::Skipped => None,
        }
    }
}

/// Storage outcome of a file across every configured module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageResult {
    /// Outcome when exactly one module is configured.
    Single(ModuleOutcome),
    /// Outcomes in module order when storage fans out.
    PerModule(Vec<ModuleOutcome>),
}

impl StorageResult {
    /// Returns the outcomes in module order.
    pub fn outcomes(&self) -> &[ModuleOutcome] {
        match self {
            Self::Single(outcome) => std::slice::from_ref(outcome),
            Self::PerModule(outcomes) => outcomes,
        }
    }

    /// Returns the outcome of the module at `index`.
    pub fn module(&self, index: usize) -> Option<&ModuleOutcome> {
        self.outcomes().get(index)
    }

    /// Iterates over every stored copy of the file.
    pub fn stored(&self) -> impl Iterator<Item = &StoredFile> {
        self.outcomes().iter().filter_map(ModuleOutcome::stored)
    }
}

/// Per-file storage overrides supplied by an accept hook.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StorageSetup {
    /// Directory to store the file in, for modules that write to disk.
    pub destination: Option<PathBuf>,
    /// Name to store the file under, for modules that name their output.
    pub file_name: Option<String>,
}

impl StorageSetup {
    /// Creates an empty setup.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the destination directory.
    pub fn destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Sets the stored file name.
    pub fn file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }
}

/// Setup for one module of a fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ModuleSetup {
    /// Use the module defaults.
    #[default]
    Default,
    /// Use the given overrides.
    With(StorageSetup),
    /// Do not hand this file to the module.
    Skip,
}

/// Storage plan for one file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SetupPlan {
    /// Every module uses its defaults.
    #[default]
    Default,
    /// Every module receives the same overrides.
    Single(StorageSetup),
    /// One entry per configured module, in module order.
    PerModule(Vec<ModuleSetup>),
}

/// Async trait abstraction for file storage modules.
///
/// Modules may be called concurrently for unrelated files and must not rely
/// on call order.
#[async_trait::async_trait]
pub trait StorageModule: Send + Sync + 'static {
    /// Persists the file stream, or reports [`ModuleOutcome::Skipped`].
    async fn handle_file(
        &self,
        stream: FileBody<'_>,
        meta: &FileMeta,
        setup: Option<&StorageSetup>,
    ) -> Result<ModuleOutcome, StorageError>;

    /// Removes a file this module previously stored.
    async fn remove_file(&self, stored: &StoredFile) -> Result<(), StorageError>;
}
