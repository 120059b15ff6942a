//! Accumulation of fields and file records for one request.

use std::collections::BTreeMap;

use crate::{
    field::{append_field, FieldValue},
    storage::{FileMeta, SetupPlan, StorageResult},
    DepartError, ErrorKind,
};

/// Identity of a file record inside a [`FormDataBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(u64);

/// A file part of the request and, once stored, where it went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    /// Multipart field name.
    pub field_name: String,
    /// Client-supplied filename.
    pub original_name: String,
    /// Declared transfer encoding.
    pub encoding: String,
    /// Declared content type.
    pub mime_type: mime::Mime,
    /// Storage plan chosen by the accept hook, `None` for defaults.
    pub storage_setup: Option<SetupPlan>,
    /// Storage outcome, `None` until stored or when no storage is configured.
    pub storage_result: Option<StorageResult>,
}

impl UploadedFile {
    /// Creates a record that has not been stored yet.
    pub fn new(meta: FileMeta) -> Self {
        Self {
            field_name: meta.field_name,
            original_name: meta.original_name,
            encoding: meta.encoding,
            mime_type: meta.mime_type,
            storage_setup: None,
            storage_result: None,
        }
    }

    /// Returns the stored size reported by the first module that stored the file.
    pub fn size(&self) -> Option<u64> {
        self.storage_result
            .as_ref()
            .and_then(|result| result.stored().next())
            .map(|stored| stored.size)
    }
}

/// Mutable accumulator filled while a request is parsed.
#[derive(Debug, Default)]
pub struct FormDataBuilder {
    fields: BTreeMap<String, FieldValue>,
    files: Vec<(FileId, UploadedFile)>,
    next_id: u64,
}

impl FormDataBuilder {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a text field, applying the bracket naming grammar.
    pub fn add_field(&mut self, name: &str, value: impl Into<String>) {
        append_field(&mut self.fields, name, value.into());
    }

    /// Records a file; its position in the final result is fixed here.
    pub fn add_file(&mut self, file: UploadedFile) -> FileId {
        let id = FileId(self.next_id);
        self.next_id += 1;
        self.files.push((id, file));
        id
    }

    /// Removes the record with identity `id`.
    pub fn remove_file(&mut self, id: FileId) -> Result<UploadedFile, DepartError> {
        let index = self
            .files
            .iter()
            .position(|(candidate, _)| *candidate == id)
            .ok_or_else(|| unknown_file(id))?;
        Ok(self.files.remove(index).1)
    }

    /// Records the storage plan and outcome of a file.
    pub fn attach_storage(
        &mut self,
        id: FileId,
        setup: Option<SetupPlan>,
        result: Option<StorageResult>,
    ) -> Result<(), DepartError> {
        let file = self.file_mut(id)?;
        file.storage_setup = setup;
        file.storage_result = result;
        Ok(())
    }

    /// Returns the record with identity `id`.
    pub fn file(&self, id: FileId) -> Option<&UploadedFile> {
        self.files
            .iter()
            .find(|(candidate, _)| *candidate == id)
            .map(|(_, file)| file)
    }

    /// Iterates the records under `field_name` in arrival order.
    pub fn files_in<'a>(&'a self, field_name: &'a str) -> impl Iterator<Item = &'a UploadedFile> {
        self.files
            .iter()
            .map(|(_, file)| file)
            .filter(move |file| file.field_name == field_name)
    }

    /// Returns the number of records under `field_name`.
    pub fn count_in(&self, field_name: &str) -> usize {
        self.files_in(field_name).count()
    }

    /// Freezes the accumulator into the request result.
    pub fn seal(self) -> FormData {
        let files: Vec<UploadedFile> = self.files.into_iter().map(|(_, file)| file).collect();
        let mut by_field: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (index, file) in files.iter().enumerate() {
            by_field
                .entry(file.field_name.clone())
                .or_default()
                .push(index);
        }

        FormData {
            fields: self.fields,
            files,
            by_field,
        }
    }

    fn file_mut(&mut self, id: FileId) -> Result<&mut UploadedFile, DepartError> {
        self.files
            .iter_mut()
            .find(|(candidate, _)| *candidate == id)
            .map(|(_, file)| file)
            .ok_or_else(|| unknown_file(id))
    }
}

fn unknown_file(id: FileId) -> DepartError {
    DepartError::with_details(
        ErrorKind::UnexpectedFile,
        format!("no file record with id {}", id.0),
    )
}

/// Fields and files of a successfully processed request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FormData {
    fields: BTreeMap<String, FieldValue>,
    files: Vec<UploadedFile>,
    by_field: BTreeMap<String, Vec<usize>>,
}

impl FormData {
    /// Returns every text field.
    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    /// Returns the value collected for `name`.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Returns the text of a single-valued field.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(FieldValue::as_text)
    }

    /// Returns every uploaded file in arrival order.
    pub fn files(&self) -> &[UploadedFile] {
        &self.files
    }

    /// Returns the files uploaded under `field_name` in arrival order.
    pub fn files_in(&self, field_name: &str) -> Vec<&UploadedFile> {
        self.by_field
            .get(field_name)
            .map(|indexes| indexes.iter().map(|&index| &self.files[index]).collect())
            .unwrap_or_default()
    }

    /// Groups files by field name.
    pub fn files_by_field(&self) -> BTreeMap<&str, Vec<&UploadedFile>> {
        self.by_field
            .iter()
            .map(|(name, indexes)| {
                let files = indexes.iter().map(|&index| &self.files[index]).collect();
                (name.as_str(), files)
            })
            .collect()
    }
}
