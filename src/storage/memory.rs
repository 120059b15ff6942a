use std::{collections::HashMap, sync::Arc};

use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{FileBody, FileMeta, ModuleOutcome, StorageModule, StorageSetup, StoredFile};
use crate::StorageError;

/// Storage module that buffers each file and keeps it under a random key.
///
/// Clones share the same buffers.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    buffers: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl MemoryStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes stored under `key`.
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        self.buffers.read().await.get(key).cloned()
    }

    /// Number of buffers currently held.
    pub async fn len(&self) -> usize {
        self.buffers.read().await.len()
    }

    /// `true` when nothing is held.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait::async_trait]
impl StorageModule for MemoryStorage {
    async fn handle_file(
        &self,
        stream: FileBody<'_>,
        meta: &FileMeta,
        _setup: Option<&StorageSetup>,
    ) -> Result<ModuleOutcome, StorageError> {
        let buffer = stream
            .map_err(|err| StorageError::new(err.to_string()))
            .try_fold(BytesMut::new(), |mut buffer, chunk| async move {
                buffer.extend_from_slice(&chunk);
                Ok::<_, StorageError>(buffer)
            })
            .await?
            .freeze();

        let key = Uuid::new_v4().to_string();
        let size = buffer.len() as u64;
        self.buffers.write().await.insert(key.clone(), buffer.clone());

        #[cfg(feature = "tracing")]
        tracing::debug!(
            field_name = meta.field_name.as_str(),
            storage_key = key.as_str(),
            size,
            "memory storage: buffered file"
        );

        Ok(ModuleOutcome::Stored(StoredFile {
            storage_key: key,
            field_name: meta.field_name.clone(),
            original_name: meta.original_name.clone(),
            content_type: meta.mime_type.clone(),
            size,
            path: None,
            buffer: Some(buffer),
        }))
    }

    async fn remove_file(&self, stored: &StoredFile) -> Result<(), StorageError> {
        self.buffers
            .write()
            .await
            .remove(&stored.storage_key)
            .map(drop)
            .ok_or_else(|| {
                StorageError::new(format!(
                    "no stored payload for key `{}`",
                    stored.storage_key
                ))
            })
    }
}
