use std::{
    fmt, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use futures::TryStreamExt;
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
};
use tokio_util::io::StreamReader;
use uuid::Uuid;

use super::{FileBody, FileMeta, ModuleOutcome, StorageModule, StorageSetup, StoredFile};
use crate::StorageError;

type NameFn = dyn Fn(&FileMeta) -> String + Send + Sync;
type FilterFn = dyn Fn(&FileMeta) -> bool + Send + Sync;

/// How [`DiskStorage`] names the files it writes.
#[derive(Clone)]
pub enum FilenameStrategy {
    /// The client filename, sanitized.
    Keep,
    /// A random hex name without extension.
    Random,
    /// A name computed from the file metadata, sanitized.
    Custom(Arc<NameFn>),
}

impl fmt::Debug for FilenameStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Keep => "Keep",
            Self::Random => "Random",
            Self::Custom(_) => "Custom(<fn>)",
        })
    }
}

#[derive(Clone)]
struct DiskOptions {
    root: PathBuf,
    strategy: FilenameStrategy,
    filter: Option<Arc<FilterFn>>,
}

impl fmt::Debug for DiskOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskOptions")
            .field("root", &self.root)
            .field("strategy", &self.strategy)
            .field("filter", &self.filter.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Builder for [`DiskStorage`].
#[derive(Debug, Clone)]
pub struct DiskStorageBuilder {
    options: DiskOptions,
}

impl Default for DiskStorageBuilder {
    fn default() -> Self {
        Self {
            options: DiskOptions {
                root: std::env::temp_dir().join("depart"),
                strategy: FilenameStrategy::Random,
                filter: None,
            },
        }
    }
}

impl DiskStorageBuilder {
    /// Directory files are written to unless a setup overrides it.
    pub fn destination(mut self, root: impl Into<PathBuf>) -> Self {
        self.options.root = root.into();
        self
    }

    /// Selects the naming strategy.
    pub fn filename(mut self, strategy: FilenameStrategy) -> Self {
        self.options.strategy = strategy;
        self
    }

    /// Shorthand for [`FilenameStrategy::Custom`].
    pub fn custom_filename<F>(self, name: F) -> Self
    where
        F: Fn(&FileMeta) -> String + Send + Sync + 'static,
    {
        self.filename(FilenameStrategy::Custom(Arc::new(name)))
    }

    /// Files the filter rejects are reported as skipped by this module.
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&FileMeta) -> bool + Send + Sync + 'static,
    {
        self.options.filter = Some(Arc::new(filter));
        self
    }

    /// Validates the options.
    pub fn build(self) -> Result<DiskStorage, StorageError> {
        if self.options.root.as_os_str().is_empty() {
            return Err(StorageError::new("disk storage root path cannot be empty"));
        }
        Ok(DiskStorage {
            options: Arc::new(self.options),
        })
    }
}

/// Storage module that streams each file into its own file on disk.
#[derive(Debug, Clone)]
pub struct DiskStorage {
    options: Arc<DiskOptions>,
}

impl DiskStorage {
    /// Starts a builder with a random-name strategy under the temp directory.
    pub fn builder() -> DiskStorageBuilder {
        DiskStorageBuilder::default()
    }

    /// Default destination directory.
    pub fn root(&self) -> &Path {
        &self.options.root
    }

    fn file_name_for(&self, meta: &FileMeta, setup: Option<&StorageSetup>) -> String {
        let name = match setup.and_then(|setup| setup.file_name.clone()) {
            Some(name) => name,
            None => match &self.options.strategy {
                FilenameStrategy::Keep => meta.original_name.clone(),
                FilenameStrategy::Random => Uuid::new_v4().simple().to_string(),
                FilenameStrategy::Custom(name) => name(meta),
            },
        };
        sanitize_filename(&name)
    }

    fn accepts(&self, meta: &FileMeta) -> bool {
        match &self.options.filter {
            Some(filter) => filter(meta),
            None => true,
        }
    }
}

#[async_trait::async_trait]
impl StorageModule for DiskStorage {
    async fn handle_file(
        &self,
        stream: FileBody<'_>,
        meta: &FileMeta,
        setup: Option<&StorageSetup>,
    ) -> Result<ModuleOutcome, StorageError> {
        if !self.accepts(meta) {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                field_name = meta.field_name.as_str(),
                original_name = meta.original_name.as_str(),
                "disk storage: filter skipped file"
            );
            return Ok(ModuleOutcome::Skipped);
        }

        let directory = match setup.and_then(|setup| setup.destination.as_ref()) {
            Some(directory) => directory.clone(),
            None => self.options.root.clone(),
        };
        fs::create_dir_all(&directory).await.map_err(|err| {
            StorageError::new(format!("failed to create storage directory: {err}"))
        })?;

        let (path, file) = create_unique(directory.join(self.file_name_for(meta, setup))).await?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            field_name = meta.field_name.as_str(),
            path = %path.display(),
            "disk storage: writing file"
        );

        let size = match write_body(stream, file).await {
            Ok(size) => size,
            Err(err) => {
                // A partial file must not outlive a failed store.
                if let Err(_remove_err) = fs::remove_file(&path).await {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        path = %path.display(),
                        error = %_remove_err,
                        "disk storage: could not remove partial file"
                    );
                }
                return Err(StorageError::new(format!("failed to write output file: {err}")));
            }
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(size, path = %path.display(), "disk storage: file written");

        Ok(ModuleOutcome::Stored(StoredFile {
            storage_key: path.to_string_lossy().into_owned(),
            field_name: meta.field_name.clone(),
            original_name: meta.original_name.clone(),
            content_type: meta.mime_type.clone(),
            size,
            path: Some(path),
            buffer: None,
        }))
    }

    async fn remove_file(&self, stored: &StoredFile) -> Result<(), StorageError> {
        let Some(path) = stored.path.as_deref() else {
            return Err(StorageError::new("stored file has no path on disk"));
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(path = %path.display(), "disk storage: removing file");

        fs::remove_file(path).await.map_err(|err| {
            StorageError::new(format!("failed to remove `{}`: {err}", path.display()))
        })
    }
}

/// Copies the body into `file` and flushes it; the file is closed on return.
async fn write_body(stream: FileBody<'_>, mut file: File) -> io::Result<u64> {
    let mut reader =
        StreamReader::new(stream.map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err)));
    let size = tokio::io::copy(&mut reader, &mut file).await?;
    file.flush().await?;
    Ok(size)
}

/// Creates `path`, or a suffixed sibling when the name is already taken.
async fn create_unique(path: PathBuf) -> Result<(PathBuf, File), StorageError> {
    let mut candidate = path.clone();
    loop {
        let opened = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await;
        match opened {
            Ok(file) => return Ok((candidate, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                #[cfg(feature = "tracing")]
                tracing::debug!(path = %candidate.display(), "disk storage: name taken, adding suffix");
                candidate = suffixed(&path, &Uuid::new_v4().simple().to_string());
            }
            Err(err) => {
                return Err(StorageError::new(format!("failed to create output file: {err}")));
            }
        }
    }
}

/// `dir/name.ext` becomes `dir/name-tag.ext`.
fn suffixed(path: &Path, tag: &str) -> PathBuf {
    let stem = path.file_stem().and_then(|stem| stem.to_str()).unwrap_or("file");
    let name = match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if !ext.is_empty() => format!("{stem}-{tag}.{ext}"),
        _ => format!("{stem}-{tag}"),
    };
    path.with_file_name(name)
}

/// Reduces a client filename to one safe path component.
///
/// Directory parts are dropped; control characters and characters reserved
/// on Windows become `_`. Non-ASCII names pass through.
pub fn sanitize_filename(input: &str) -> String {
    let base = input.rsplit(['/', '\\']).next().unwrap_or(input);
    let replaced: String = base
        .chars()
        .map(|ch| match ch {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .collect();

    match replaced.trim_matches(['.', ' ']) {
        "" => "file".to_owned(),
        name => name.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_directories_and_reserved_characters() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("..\\..\\bad:name?.txt"), "bad_name_.txt");
        assert_eq!(sanitize_filename(".."), "file");
    }

    #[test]
    fn suffix_goes_before_the_extension() {
        assert_eq!(
            suffixed(Path::new("/tmp/up/a.tar"), "x1"),
            PathBuf::from("/tmp/up/a-x1.tar")
        );
        assert_eq!(
            suffixed(Path::new("/tmp/up/README"), "x1"),
            PathBuf::from("/tmp/up/README-x1")
        );
    }
}
