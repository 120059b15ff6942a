#![allow(missing_docs)]

use std::{convert::Infallible, path::PathBuf, sync::Arc, time::Duration};

use bytes::Bytes;
use depart::{
    storage::FileBody, Depart, DepartError, DiskStorage, ErrorKind, FileDecision, FileMeta,
    FilenameStrategy, Limits, MemoryStorage, ModuleOutcome, ModuleSetup, SetupPlan, StorageError,
    StorageModule, StorageSetup, StoredFile, UploadedFile,
};
use futures::{stream, Stream};
use tokio::sync::Notify;
use uuid::Uuid;

const CONTENT_TYPE: &str = "multipart/form-data; boundary=BOUND";

#[tokio::test]
async fn every_module_receives_identical_bytes() {
    let first = MemoryStorage::new();
    let second = MemoryStorage::new();
    let depart = Depart::builder()
        .add_storage(first.clone())
        .add_storage(second.clone())
        .build()
        .expect("builder should succeed");
    assert!(depart
        .config()
        .storage
        .as_ref()
        .is_some_and(|storage| storage.is_fan_out()));

    let payload: Vec<u8> = (0..=255_u8).cycle().take(10_000).collect();
    let body = multipart_body(&[("doc", "data.bin", &payload)]);
    let form = depart
        .parse_content_type(CONTENT_TYPE, chunked(body, 333))
        .await
        .expect("request should succeed");

    let result = form.files()[0]
        .storage_result
        .as_ref()
        .expect("file should carry a storage result");
    assert_eq!(result.outcomes().len(), 2);

    let copies: Vec<Bytes> = result
        .stored()
        .map(|stored| stored.buffer.clone().expect("memory buffer"))
        .collect();
    assert_eq!(copies.len(), 2);
    assert!(copies.iter().all(|copy| copy.as_ref() == payload.as_slice()));
    assert_eq!(first.len().await, 1);
    assert_eq!(second.len().await, 1);
}

#[tokio::test]
async fn fan_out_writes_to_every_disk_destination() {
    let left = temp_root();
    let right = temp_root();
    let depart = Depart::builder()
        .add_storage(disk(&left))
        .add_storage(disk(&right))
        .build()
        .expect("builder should succeed");

    let body = multipart_body(&[("doc", "copy.txt", b"mirrored")]);
    let form = depart
        .parse_content_type(CONTENT_TYPE, chunked(body, 4))
        .await
        .expect("request should succeed");

    let paths: Vec<PathBuf> = form.files()[0]
        .storage_result
        .as_ref()
        .expect("storage result")
        .stored()
        .filter_map(|stored| stored.path.clone())
        .collect();
    assert_eq!(paths, [left.join("copy.txt"), right.join("copy.txt")]);
    for path in &paths {
        assert_eq!(tokio::fs::read(path).await.expect("read copy"), b"mirrored");
    }

    cleanup(left).await;
    cleanup(right).await;
}

#[tokio::test]
async fn per_module_setup_can_skip_a_module() {
    let first = MemoryStorage::new();
    let second = MemoryStorage::new();
    let depart = Depart::builder()
        .add_storage(first.clone())
        .add_storage(second.clone())
        .on_file(|_file: UploadedFile| async {
            Ok::<_, DepartError>(FileDecision::Accept(SetupPlan::PerModule(vec![
                ModuleSetup::Skip,
                ModuleSetup::Default,
            ])))
        })
        .build()
        .expect("builder should succeed");

    let body = multipart_body(&[("doc", "a.txt", b"only second")]);
    let form = depart
        .parse_content_type(CONTENT_TYPE, chunked(body, 5))
        .await
        .expect("request should succeed");

    let result = form.files()[0]
        .storage_result
        .as_ref()
        .expect("storage result");
    assert_eq!(result.module(0), Some(&ModuleOutcome::Skipped));
    assert!(result.module(1).and_then(ModuleOutcome::stored).is_some());
    assert!(first.is_empty().await);
    assert_eq!(second.len().await, 1);
}

#[tokio::test]
async fn per_module_setup_overrides_one_destination() {
    let default_root = temp_root();
    let override_root = temp_root();
    let hook_root = override_root.clone();
    let depart = Depart::builder()
        .add_storage(disk(&default_root))
        .add_storage(disk(&default_root.join("mirror")))
        .on_file(move |_file: UploadedFile| {
            let setup = StorageSetup::new().destination(hook_root.clone());
            async move {
                Ok::<_, DepartError>(FileDecision::Accept(SetupPlan::PerModule(vec![
                    ModuleSetup::Default,
                    ModuleSetup::With(setup),
                ])))
            }
        })
        .build()
        .expect("builder should succeed");

    let body = multipart_body(&[("doc", "a.txt", b"split")]);
    let form = depart
        .parse_content_type(CONTENT_TYPE, chunked(body, 5))
        .await
        .expect("request should succeed");

    let paths: Vec<PathBuf> = form.files()[0]
        .storage_result
        .as_ref()
        .expect("storage result")
        .stored()
        .filter_map(|stored| stored.path.clone())
        .collect();
    assert_eq!(
        paths,
        [default_root.join("a.txt"), override_root.join("a.txt")]
    );

    cleanup(default_root).await;
    cleanup(override_root).await;
}

#[tokio::test]
async fn truncated_fan_out_file_is_removed_everywhere() {
    let left = temp_root();
    let right = temp_root();
    let depart = Depart::builder()
        .limits(Limits {
            file_size: Some(8),
            ..Limits::default()
        })
        .add_storage(disk(&left))
        .add_storage(disk(&right))
        .build()
        .expect("builder should succeed");

    let body = multipart_body(&[("doc", "big.txt", b"far more than eight bytes")]);
    let err = depart
        .parse_content_type(CONTENT_TYPE, chunked(body, 4))
        .await
        .expect_err("oversized file must fail");

    assert_eq!(err.kind(), ErrorKind::FileSizeLimit);
    assert!(err.related().is_empty());
    assert!(!tokio::fs::try_exists(left.join("big.txt"))
        .await
        .expect("try_exists should succeed"));
    assert!(!tokio::fs::try_exists(right.join("big.txt"))
        .await
        .expect("try_exists should succeed"));

    cleanup(left).await;
    cleanup(right).await;
}

#[tokio::test]
async fn failing_module_rolls_back_the_other_copies() {
    let healthy = MemoryStorage::new();
    let depart = Depart::builder()
        .add_storage(healthy.clone())
        .add_storage(RejectingStorage)
        .build()
        .expect("builder should succeed");

    let body = multipart_body(&[("doc", "a.txt", b"body")]);
    let err = depart
        .parse_content_type(CONTENT_TYPE, chunked(body, 3))
        .await
        .expect_err("failing module must fail the request");

    assert_eq!(err.kind(), ErrorKind::Storage);
    assert_eq!(err.details(), Some("doc.a.txt: quota exceeded"));
    assert!(healthy.is_empty().await);
}

#[tokio::test]
async fn a_module_that_waits_does_not_stall_the_others() {
    let gate = Arc::new(Notify::new());
    let depart = Depart::builder()
        .add_storage(SignallingStorage {
            inner: MemoryStorage::new(),
            gate: Arc::clone(&gate),
        })
        .add_storage(WaitingStorage {
            inner: MemoryStorage::new(),
            gate,
        })
        .build()
        .expect("builder should succeed");

    let payload = vec![b'q'; 1024 * 1024];
    let body = multipart_body(&[("doc", "big.bin", &payload)]);
    let form = tokio::time::timeout(
        Duration::from_secs(10),
        depart.parse_content_type(CONTENT_TYPE, chunked(body, 8 * 1024)),
    )
    .await
    .expect("fan-out must not deadlock")
    .expect("request should succeed");

    let sizes: Vec<u64> = form.files()[0]
        .storage_result
        .as_ref()
        .expect("storage result")
        .stored()
        .map(|stored| stored.size)
        .collect();
    assert_eq!(sizes, [payload.len() as u64, payload.len() as u64]);
}

#[tokio::test]
async fn empty_fan_out_is_rejected() {
    let err = depart::StorageDispatcher::fan_out(Vec::new()).expect_err("must fail");
    assert_eq!(err, depart::ConfigError::EmptyFanOut);
}

/// Stores normally, then opens the gate.
struct SignallingStorage {
    inner: MemoryStorage,
    gate: Arc<Notify>,
}

#[async_trait::async_trait]
impl StorageModule for SignallingStorage {
    async fn handle_file(
        &self,
        stream: FileBody<'_>,
        meta: &FileMeta,
        setup: Option<&StorageSetup>,
    ) -> Result<ModuleOutcome, StorageError> {
        let outcome = self.inner.handle_file(stream, meta, setup).await?;
        self.gate.notify_one();
        Ok(outcome)
    }

    async fn remove_file(&self, stored: &StoredFile) -> Result<(), StorageError> {
        self.inner.remove_file(stored).await
    }
}

/// Reads nothing until the gate opens.
struct WaitingStorage {
    inner: MemoryStorage,
    gate: Arc<Notify>,
}

#[async_trait::async_trait]
impl StorageModule for WaitingStorage {
    async fn handle_file(
        &self,
        stream: FileBody<'_>,
        meta: &FileMeta,
        setup: Option<&StorageSetup>,
    ) -> Result<ModuleOutcome, StorageError> {
        self.gate.notified().await;
        self.inner.handle_file(stream, meta, setup).await
    }

    async fn remove_file(&self, stored: &StoredFile) -> Result<(), StorageError> {
        self.inner.remove_file(stored).await
    }
}

struct RejectingStorage;

#[async_trait::async_trait]
impl StorageModule for RejectingStorage {
    async fn handle_file(
        &self,
        _stream: FileBody<'_>,
        _meta: &FileMeta,
        _setup: Option<&StorageSetup>,
    ) -> Result<ModuleOutcome, StorageError> {
        Err(StorageError::new("quota exceeded"))
    }

    async fn remove_file(&self, _stored: &StoredFile) -> Result<(), StorageError> {
        Err(StorageError::new("nothing to remove"))
    }
}

fn disk(root: &std::path::Path) -> DiskStorage {
    DiskStorage::builder()
        .destination(root)
        .filename(FilenameStrategy::Keep)
        .build()
        .expect("builder should succeed")
}

fn temp_root() -> PathBuf {
    std::env::temp_dir().join(format!("depart-test-{}", Uuid::new_v4()))
}

async fn cleanup(path: PathBuf) {
    let _ = tokio::fs::remove_dir_all(path).await;
}

fn multipart_body(parts: &[(&str, &str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (field, file_name, body) in parts {
        out.extend_from_slice(b"--BOUND\r\n");
        let disposition =
            format!("Content-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\n\r\n");
        out.extend_from_slice(disposition.as_bytes());
        out.extend_from_slice(body);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"--BOUND--\r\n");
    out
}

fn chunked(body: Vec<u8>, size: usize) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
    let chunks: Vec<Result<Bytes, Infallible>> = body
        .chunks(size)
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect();
    stream::iter(chunks)
}
