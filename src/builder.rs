use std::{fmt, future::Future, sync::Arc};

use futures::FutureExt;

use crate::{
    config::{DepartConfig, FileDecision, FileFields},
    error::ConfigError,
    form::UploadedFile,
    limits::Limits,
    storage::{StorageDispatcher, StorageModule},
    Depart, DepartError,
};

#[derive(Clone, Default)]
enum StorageChoice {
    #[default]
    Memory,
    None,
    Modules(Vec<Arc<dyn StorageModule>>),
}

/// Builder for configuring a [`Depart`] instance.
#[derive(Clone, Default)]
pub struct DepartBuilder {
    config: DepartConfig,
    storage: StorageChoice,
}

impl fmt::Debug for DepartBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let storage = match &self.storage {
            StorageChoice::Memory => "memory".to_owned(),
            StorageChoice::None => "none".to_owned(),
            StorageChoice::Modules(modules) => format!("{} module(s)", modules.len()),
        };
        f.debug_struct("DepartBuilder")
            .field("config", &self.config)
            .field("storage", &storage)
            .finish()
    }
}

impl DepartBuilder {
    /// Creates a builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current builder configuration snapshot.
    pub fn config(&self) -> &DepartConfig {
        &self.config
    }

    /// Sets which fields may carry files.
    pub fn file_fields(mut self, file_fields: FileFields) -> Self {
        self.config.file_fields = file_fields;
        self
    }

    /// Sets request limits.
    pub fn limits(mut self, limits: Limits) -> Self {
        self.config.limits = limits;
        self
    }

    /// Stores files in `module` only, replacing earlier storage choices.
    pub fn storage(mut self, module: impl StorageModule) -> Self {
        let module: Arc<dyn StorageModule> = Arc::new(module);
        self.storage = StorageChoice::Modules(vec![module]);
        self
    }

    /// Adds a storage module; with more than one, files fan out to all of them.
    pub fn add_storage(mut self, module: impl StorageModule) -> Self {
        let module: Arc<dyn StorageModule> = Arc::new(module);
        match &mut self.storage {
            StorageChoice::Modules(modules) => modules.push(module),
            other => *other = StorageChoice::Modules(vec![module]),
        }
        self
    }

    /// Parses files without storing them.
    pub fn no_storage(mut self) -> Self {
        self.storage = StorageChoice::None;
        self
    }

    /// Sets the accept hook run before each file is stored.
    pub fn on_file<F, Fut, D>(mut self, hook: F) -> Self
    where
        F: Fn(UploadedFile) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<D, DepartError>> + Send + 'static,
        D: Into<FileDecision>,
    {
        self.config.on_file = Some(Arc::new(move |file: UploadedFile| {
            hook(file)
                .map(|decision| decision.map(Into::<FileDecision>::into))
                .boxed()
        }));
        self
    }

    /// Sets the hook run after each file was stored.
    pub fn on_file_stored<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(UploadedFile) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DepartError>> + Send + 'static,
    {
        self.config.on_file_stored = Some(Arc::new(move |file: UploadedFile| hook(file).boxed()));
        self
    }

    /// Keeps directory components of client filenames.
    pub fn preserve_paths(mut self, preserve: bool) -> Self {
        self.config.preserve_paths = preserve;
        self
    }

    /// Validates builder configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.config.validate()
    }

    /// Finalizes and returns validated configuration.
    pub fn build_config(self) -> Result<DepartConfig, ConfigError> {
        let mut config = self.config;
        config.storage = match self.storage {
            StorageChoice::Memory => config.storage,
            StorageChoice::None => None,
            StorageChoice::Modules(mut modules) if modules.len() == 1 => {
                modules.pop().map(StorageDispatcher::from_shared)
            }
            StorageChoice::Modules(modules) => Some(StorageDispatcher::fan_out(modules)?),
        };
        config.validate()?;
        Ok(config)
    }

    /// Builds a reusable processor.
    pub fn build(self) -> Result<Depart, ConfigError> {
        self.build_config().map(Depart::with_config_unchecked)
    }
}
