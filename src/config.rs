use std::{fmt, sync::Arc};

use futures::future::BoxFuture;

use crate::{
    form::{FormDataBuilder, UploadedFile},
    limits::Limits,
    storage::{MemoryStorage, SetupPlan, StorageDispatcher},
    ConfigError, DepartError, ErrorKind,
};

/// Per-field constraints for [`FileFields::Rules`].
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFieldRule {
    /// Field name the rule applies to.
    pub name: String,
    /// Maximum number of files accepted for this field.
    #[cfg_attr(feature = "serde", serde(default))]
    pub max_files: Option<usize>,
    /// Rejects a second file with the same client filename under this field.
    #[cfg_attr(feature = "serde", serde(default))]
    pub require_unique_original_name: bool,
}

impl FileFieldRule {
    /// Creates a rule with no count limit.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_files: None,
            require_unique_original_name: false,
        }
    }

    /// Sets the maximum number of files accepted for this field.
    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = Some(max_files);
        self
    }

    /// Rejects duplicate client filenames under this field.
    pub fn unique_original_names(mut self) -> Self {
        self.require_unique_original_name = true;
        self
    }
}

/// Which fields may carry files.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FileFields {
    /// Any field, any number of files.
    #[default]
    Any,
    /// Only the listed fields, any number of files each.
    Names(Vec<String>),
    /// Only fields with a rule, constrained by it.
    Rules(Vec<FileFieldRule>),
}

impl FileFields {
    /// Allows files only under `names`.
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Names(names.into_iter().map(Into::into).collect())
    }

    /// Allows files only under fields with a rule.
    pub fn rules(rules: impl IntoIterator<Item = FileFieldRule>) -> Self {
        Self::Rules(rules.into_iter().collect())
    }

    /// Validates field names and per-field limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let names: Vec<&str> = match self {
            Self::Any => return Ok(()),
            Self::Names(names) => names.iter().map(String::as_str).collect(),
            Self::Rules(rules) => {
                for rule in rules {
                    if rule.max_files == Some(0) {
                        return Err(ConfigError::InvalidMaxFiles {
                            name: rule.name.clone(),
                        });
                    }
                }
                rules.iter().map(|rule| rule.name.as_str()).collect()
            }
        };

        for (index, name) in names.iter().enumerate() {
            if name.trim().is_empty() {
                return Err(ConfigError::EmptyFieldName);
            }
            if names[..index].contains(name) {
                return Err(ConfigError::DuplicateFieldName {
                    name: (*name).to_owned(),
                });
            }
        }
        Ok(())
    }

    /// Decides whether a new file under `field_name` is expected, given the
    /// files already recorded.
    pub(crate) fn check(
        &self,
        field_name: &str,
        original_name: &str,
        form: &FormDataBuilder,
    ) -> Result<(), DepartError> {
        let unexpected = || DepartError::with_details(ErrorKind::UnexpectedFile, field_name);

        let rule = match self {
            Self::Any => return Ok(()),
            Self::Names(names) => {
                return if names.iter().any(|name| name == field_name) {
                    Ok(())
                } else {
                    Err(unexpected())
                };
            }
            Self::Rules(rules) => rules
                .iter()
                .find(|rule| rule.name == field_name)
                .ok_or_else(unexpected)?,
        };

        if rule
            .max_files
            .is_some_and(|max| form.count_in(field_name) >= max)
        {
            return Err(unexpected());
        }

        if rule.require_unique_original_name
            && form
                .files_in(field_name)
                .any(|file| file.original_name == original_name)
        {
            return Err(DepartError::with_details(
                ErrorKind::UnexpectedFile,
                format!("{field_name}: duplicate file name `{original_name}`"),
            ));
        }

        Ok(())
    }
}

/// What the accept hook decided for a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileDecision {
    /// Drop the file without storing it.
    Skip,
    /// Store the file according to the plan.
    Accept(SetupPlan),
}

impl FileDecision {
    /// Accepts the file with default storage behaviour.
    pub fn accept() -> Self {
        Self::Accept(SetupPlan::Default)
    }
}

impl From<bool> for FileDecision {
    fn from(accept: bool) -> Self {
        if accept {
            Self::accept()
        } else {
            Self::Skip
        }
    }
}

/// Accept hook run before a file is stored.
pub type OnFileHook =
    Arc<dyn Fn(UploadedFile) -> BoxFuture<'static, Result<FileDecision, DepartError>> + Send + Sync>;

/// Hook run after a file was stored.
pub type OnFileStoredHook =
    Arc<dyn Fn(UploadedFile) -> BoxFuture<'static, Result<(), DepartError>> + Send + Sync>;

/// Validated processing configuration shared by every request.
#[derive(Clone)]
pub struct DepartConfig {
    /// Fields allowed to carry files.
    pub file_fields: FileFields,
    /// Limits forwarded to the tokenizer.
    pub limits: Limits,
    /// Storage for accepted files; `None` parses files without storing them.
    pub storage: Option<StorageDispatcher>,
    /// Accept hook.
    pub on_file: Option<OnFileHook>,
    /// Post-store hook.
    pub on_file_stored: Option<OnFileStoredHook>,
    /// Keeps directory components of client filenames.
    pub preserve_paths: bool,
}

impl fmt::Debug for DepartConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DepartConfig")
            .field("file_fields", &self.file_fields)
            .field("limits", &self.limits)
            .field("storage", &self.storage)
            .field("on_file", &self.on_file.as_ref().map(|_| "<fn>"))
            .field("on_file_stored", &self.on_file_stored.as_ref().map(|_| "<fn>"))
            .field("preserve_paths", &self.preserve_paths)
            .finish()
    }
}

impl Default for DepartConfig {
    fn default() -> Self {
        Self {
            file_fields: FileFields::Any,
            limits: Limits::default(),
            storage: Some(StorageDispatcher::single(MemoryStorage::new())),
            on_file: None,
            on_file_stored: None,
            preserve_paths: false,
        }
    }
}

impl DepartConfig {
    /// Creates the default configuration, storing files in memory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.file_fields.validate()?;
        self.limits.validate()
    }
}
