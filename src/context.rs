use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{
    config::DepartConfig,
    counter::CompletionCounter,
    form::{FileId, FormData, FormDataBuilder, UploadedFile},
    DepartError, ErrorKind,
};

/// State of one request, shared between the event driver and file pipelines.
#[derive(Debug)]
pub(crate) struct RequestContext {
    pub(crate) config: Arc<DepartConfig>,
    pub(crate) pending: Arc<CompletionCounter>,
    error: Mutex<Option<DepartError>>,
    form: Mutex<FormDataBuilder>,
    uploaded: Mutex<Vec<UploadedFile>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RequestContext {
    pub(crate) fn new(config: Arc<DepartConfig>) -> Self {
        Self {
            config,
            pending: Arc::new(CompletionCounter::new()),
            error: Mutex::new(None),
            form: Mutex::new(FormDataBuilder::new()),
            uploaded: Mutex::new(Vec::new()),
        }
    }

    /// Records `err`; the first one is reported, later ones join its trail.
    pub(crate) fn latch(&self, err: DepartError) {
        let mut slot = lock(&self.error);
        match slot.as_mut() {
            Some(first) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %err, "engine: folding error into latched error");
                first.fold(err);
            }
            None => {
                #[cfg(feature = "tracing")]
                tracing::debug!(code = err.code(), error = %err, "engine: error latched");
                *slot = Some(err);
            }
        }
    }

    pub(crate) fn is_failed(&self) -> bool {
        lock(&self.error).is_some()
    }

    pub(crate) fn take_error(&self) -> Option<DepartError> {
        lock(&self.error).take()
    }

    pub(crate) fn with_form<R>(&self, apply: impl FnOnce(&mut FormDataBuilder) -> R) -> R {
        apply(&mut lock(&self.form))
    }

    /// Returns a copy of the record with identity `id`.
    pub(crate) fn file(&self, id: FileId) -> Result<UploadedFile, DepartError> {
        self.with_form(|form| form.file(id).cloned()).ok_or_else(|| {
            DepartError::with_details(ErrorKind::UnexpectedFile, "file record vanished")
        })
    }

    /// Marks a stored file as needing removal if the request fails.
    pub(crate) fn push_uploaded(&self, file: UploadedFile) {
        lock(&self.uploaded).push(file);
    }

    pub(crate) fn take_uploaded(&self) -> Vec<UploadedFile> {
        std::mem::take(&mut *lock(&self.uploaded))
    }

    pub(crate) fn seal(&self) -> FormData {
        std::mem::take(&mut *lock(&self.form)).seal()
    }
}
