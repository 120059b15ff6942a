#![allow(missing_docs)]

use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use depart::storage::disk::sanitize_filename;
use depart::{
    Depart, DepartError, DiskStorage, FileDecision, FileMeta, FilenameStrategy, ModuleOutcome,
    ParseError, SetupPlan, StorageModule, StorageResult, StorageSetup, UploadedFile,
};
use futures::{channel::mpsc, stream, SinkExt, Stream};
use uuid::Uuid;

const CONTENT_TYPE: &str = "multipart/form-data; boundary=BOUND";

type ObservedFileMeta = Option<(String, String, String)>;

#[tokio::test]
async fn keep_strategy_sanitizes_filename_and_writes_to_disk() {
    let root = temp_root();
    let storage = DiskStorage::builder()
        .destination(&root)
        .filename(FilenameStrategy::Keep)
        .build()
        .expect("builder should succeed");
    let depart = Depart::builder()
        .storage(storage)
        .preserve_paths(true)
        .build()
        .expect("builder should succeed");

    let body = multipart_body(&[("upload", "../../bad:name?.txt", "text/plain", b"hello")]);
    let form = depart
        .parse_content_type(CONTENT_TYPE, bytes_stream(body))
        .await
        .expect("request should succeed");

    let path = stored_path(&form.files()[0]);
    assert!(path.starts_with(&root));
    assert_eq!(tokio::fs::read(&path).await.expect("read file"), b"hello");
    assert_eq!(
        path.file_name().and_then(|value| value.to_str()),
        Some("bad_name_.txt")
    );

    cleanup(root).await;
}

#[tokio::test]
async fn random_strategy_generates_distinct_paths() {
    let root = temp_root();
    let depart = disk_processor(&root, FilenameStrategy::Random);

    let body = multipart_body(&[
        ("a", "same.txt", "text/plain", b"one"),
        ("b", "same.txt", "text/plain", b"two"),
    ]);
    let form = depart
        .parse_content_type(CONTENT_TYPE, bytes_stream(body))
        .await
        .expect("request should succeed");

    let first = stored_path(&form.files()[0]);
    let second = stored_path(&form.files()[1]);
    assert_ne!(first, second);
    assert_eq!(tokio::fs::read(&first).await.expect("read first"), b"one");
    assert_eq!(tokio::fs::read(&second).await.expect("read second"), b"two");

    cleanup(root).await;
}

#[tokio::test]
async fn keep_strategy_avoids_overwriting_existing_files() {
    let root = temp_root();
    let depart = disk_processor(&root, FilenameStrategy::Keep);

    let body = multipart_body(&[
        ("a", "same.txt", "text/plain", b"one"),
        ("b", "same.txt", "text/plain", b"two"),
    ]);
    let form = depart
        .parse_content_type(CONTENT_TYPE, bytes_stream(body))
        .await
        .expect("request should succeed");

    let first = stored_path(&form.files()[0]);
    let second = stored_path(&form.files()[1]);
    assert_ne!(first, second);

    let mut contents = vec![
        tokio::fs::read(&first).await.expect("read first"),
        tokio::fs::read(&second).await.expect("read second"),
    ];
    contents.sort();
    assert_eq!(contents, [b"one".to_vec(), b"two".to_vec()]);

    cleanup(root).await;
}

#[tokio::test]
async fn custom_strategy_applies_transform() {
    let root = temp_root();
    let storage = DiskStorage::builder()
        .destination(&root)
        .custom_filename(|meta| format!("prefix-{}", meta.original_name))
        .build()
        .expect("builder should succeed");
    let depart = Depart::builder()
        .storage(storage)
        .build()
        .expect("builder should succeed");

    let body = multipart_body(&[("doc", "report.txt", "text/plain", b"payload")]);
    let form = depart
        .parse_content_type(CONTENT_TYPE, bytes_stream(body))
        .await
        .expect("request should succeed");

    let path = stored_path(&form.files()[0]);
    assert_eq!(
        path.file_name().and_then(|value| value.to_str()),
        Some("prefix-report.txt")
    );

    cleanup(root).await;
}

#[tokio::test]
async fn disk_filter_skips_files_before_write() {
    let root = temp_root();
    let storage = DiskStorage::builder()
        .destination(&root)
        .filename(FilenameStrategy::Keep)
        .filter(|meta| meta.original_name != "reject.txt")
        .build()
        .expect("builder should succeed");
    let depart = Depart::builder()
        .storage(storage)
        .build()
        .expect("builder should succeed");

    let body = multipart_body(&[("upload", "reject.txt", "text/plain", b"hello")]);
    let form = depart
        .parse_content_type(CONTENT_TYPE, bytes_stream(body))
        .await
        .expect("a skipped file is not an error");

    assert_eq!(
        form.files()[0].storage_result,
        Some(StorageResult::Single(ModuleOutcome::Skipped))
    );
    assert!(!tokio::fs::try_exists(&root).await.expect("try_exists should succeed"));

    cleanup(root).await;
}

#[tokio::test]
async fn disk_filter_receives_core_file_metadata() {
    let root = temp_root();
    let observed_meta: Arc<Mutex<ObservedFileMeta>> = Arc::new(Mutex::new(None));
    let observed = Arc::clone(&observed_meta);

    let storage = DiskStorage::builder()
        .destination(&root)
        .filename(FilenameStrategy::Keep)
        .filter(move |meta| {
            *observed.lock().expect("lock should succeed") = Some((
                meta.field_name.clone(),
                meta.original_name.clone(),
                meta.mime_type.essence_str().to_owned(),
            ));
            true
        })
        .build()
        .expect("builder should succeed");
    let depart = Depart::builder()
        .storage(storage)
        .build()
        .expect("builder should succeed");

    let body = multipart_body(&[("upload", "hinted.txt", "text/plain", b"hello")]);
    depart
        .parse_content_type(CONTENT_TYPE, bytes_stream(body))
        .await
        .expect("request should succeed");

    let captured = observed_meta.lock().expect("lock should succeed").clone();
    assert_eq!(
        captured,
        Some((
            "upload".to_owned(),
            "hinted.txt".to_owned(),
            "text/plain".to_owned(),
        ))
    );

    cleanup(root).await;
}

#[tokio::test]
async fn accept_hook_setup_overrides_destination_and_name() {
    let root = temp_root();
    let override_dir = root.join("override");
    let hook_dir = override_dir.clone();
    let storage = DiskStorage::builder()
        .destination(root.join("default"))
        .build()
        .expect("builder should succeed");
    let depart = Depart::builder()
        .storage(storage)
        .on_file(move |_file: UploadedFile| {
            let setup = StorageSetup::new()
                .destination(hook_dir.clone())
                .file_name("renamed.bin");
            async move { Ok::<_, DepartError>(FileDecision::Accept(SetupPlan::Single(setup))) }
        })
        .build()
        .expect("builder should succeed");

    let body = multipart_body(&[("doc", "original.bin", "application/octet-stream", b"data")]);
    let form = depart
        .parse_content_type(CONTENT_TYPE, bytes_stream(body))
        .await
        .expect("request should succeed");

    let path = stored_path(&form.files()[0]);
    assert_eq!(path, override_dir.join("renamed.bin"));
    assert_eq!(tokio::fs::read(&path).await.expect("read file"), b"data");
    assert!(!tokio::fs::try_exists(root.join("default"))
        .await
        .expect("try_exists should succeed"));

    cleanup(root).await;
}

#[tokio::test]
async fn binary_payload_is_written_byte_for_byte() {
    let root = temp_root();
    let depart = disk_processor(&root, FilenameStrategy::Random);

    let payload: Vec<u8> = (0..=255_u8).cycle().take(256 * 40).collect();
    let body = multipart_body(&[("blob", "blob.bin", "application/octet-stream", &payload)]);
    let form = depart
        .parse_content_type(CONTENT_TYPE, chunked(body, 7))
        .await
        .expect("request should succeed");

    let file = &form.files()[0];
    assert_eq!(file.size(), Some(payload.len() as u64));
    let written = tokio::fs::read(stored_path(file)).await.expect("read file");
    assert_eq!(written, payload);

    cleanup(root).await;
}

#[tokio::test]
async fn zero_byte_file_is_stored() {
    let root = temp_root();
    let depart = disk_processor(&root, FilenameStrategy::Keep);

    let body = multipart_body(&[("empty", "empty.txt", "text/plain", b"")]);
    let form = depart
        .parse_content_type(CONTENT_TYPE, bytes_stream(body))
        .await
        .expect("request should succeed");

    let file = &form.files()[0];
    assert_eq!(file.size(), Some(0));
    let metadata = tokio::fs::metadata(stored_path(file))
        .await
        .expect("metadata should exist");
    assert_eq!(metadata.len(), 0);

    cleanup(root).await;
}

#[tokio::test]
async fn unicode_filename_is_kept_on_disk() {
    let root = temp_root();
    let depart = disk_processor(&root, FilenameStrategy::Keep);

    let body = multipart_body(&[("doc", "résumé 履歴書.txt", "text/plain", b"cv")]);
    let form = depart
        .parse_content_type(CONTENT_TYPE, bytes_stream(body))
        .await
        .expect("request should succeed");

    let path = stored_path(&form.files()[0]);
    assert_eq!(
        path.file_name().and_then(|value| value.to_str()),
        Some("résumé 履歴書.txt")
    );

    cleanup(root).await;
}

#[tokio::test]
async fn streams_large_file_to_disk_from_chunked_input() {
    let root = temp_root();
    let depart = disk_processor(&root, FilenameStrategy::Random);

    let (tx, rx) = mpsc::unbounded::<Result<Bytes, Infallible>>();
    tx.unbounded_send(Ok(Bytes::from_static(
        b"--BOUND\r\nContent-Disposition: form-data; name=\"upload\"; filename=\"big.bin\"\r\n\r\n",
    )))
    .expect("send prelude");
    for _ in 0..128 {
        tx.unbounded_send(Ok(Bytes::from(vec![b'z'; 64 * 1024])))
            .expect("send payload chunk");
    }
    tx.unbounded_send(Ok(Bytes::from_static(b"\r\n--BOUND--\r\n")))
        .expect("send trailer");
    drop(tx);

    let form = depart
        .parse_content_type(CONTENT_TYPE, rx)
        .await
        .expect("request should succeed");

    let file = &form.files()[0];
    assert_eq!(file.size(), Some(128 * 64 * 1024));
    let metadata = tokio::fs::metadata(stored_path(file))
        .await
        .expect("metadata should exist");
    assert_eq!(metadata.len(), 128 * 64 * 1024);

    cleanup(root).await;
}

#[tokio::test]
async fn remove_file_unlinks_the_stored_path() {
    let root = temp_root();
    let storage = DiskStorage::builder()
        .destination(&root)
        .build()
        .expect("builder should succeed");
    let meta = FileMeta {
        field_name: "doc".to_owned(),
        original_name: "a.txt".to_owned(),
        encoding: "7bit".to_owned(),
        mime_type: mime::TEXT_PLAIN,
    };

    let body = stream::iter([Ok::<Bytes, ParseError>(Bytes::from_static(b"bytes"))]);
    let outcome = storage
        .handle_file(Box::pin(body), &meta, None)
        .await
        .expect("store should succeed");
    let stored = outcome.stored().expect("file should be stored").clone();
    let path = stored.path.clone().expect("disk path should be present");
    assert!(tokio::fs::try_exists(&path).await.expect("try_exists should succeed"));

    storage.remove_file(&stored).await.expect("remove should succeed");
    assert!(!tokio::fs::try_exists(&path).await.expect("try_exists should succeed"));
    storage
        .remove_file(&stored)
        .await
        .expect_err("second removal must fail");

    cleanup(root).await;
}

#[tokio::test]
async fn failed_stream_leaves_no_partial_file() {
    let root = temp_root();
    let storage = DiskStorage::builder()
        .destination(&root)
        .filename(FilenameStrategy::Keep)
        .build()
        .expect("builder should succeed");
    let meta = FileMeta {
        field_name: "doc".to_owned(),
        original_name: "partial.bin".to_owned(),
        encoding: "7bit".to_owned(),
        mime_type: mime::APPLICATION_OCTET_STREAM,
    };

    let body = stream::iter([
        Ok(Bytes::from_static(b"first half")),
        Err(ParseError::new("client went away")),
    ]);
    storage
        .handle_file(Box::pin(body), &meta, None)
        .await
        .expect_err("stream failure must fail the store");

    assert!(!tokio::fs::try_exists(root.join("partial.bin"))
        .await
        .expect("try_exists should succeed"));

    cleanup(root).await;
}

#[test]
fn sanitize_filename_rejects_traversal_and_null_bytes() {
    let traversal = sanitize_filename("../../etc/passwd");
    assert_eq!(traversal, "passwd");

    let nul = sanitize_filename("..\\..\\nul\0byte?.txt");
    assert!(!nul.contains('\0'));
    assert!(!nul.contains(".."));
    assert!(!nul.contains('?'));

    assert_eq!(sanitize_filename("..."), "file");
    assert_eq!(sanitize_filename("ファイル.txt"), "ファイル.txt");
}

#[tokio::test]
#[ignore = "stress scenario for CI/release validation"]
async fn stress_multi_gb_disk_upload_uses_bounded_stream_memory() {
    const CHUNK_SIZE: usize = 64 * 1024;
    const QUEUE_CAPACITY: usize = 1;

    let root = temp_root();
    let depart = disk_processor(&root, FilenameStrategy::Random);

    let chunk_count: usize = match std::env::var("DEPART_STRESS_4GB") {
        Ok(value) if value == "1" => 65_536,
        _ => 4_096,
    };
    let expected_size = (chunk_count as u64) * (CHUNK_SIZE as u64);

    let (mut tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(QUEUE_CAPACITY);
    let producer = tokio::spawn(async move {
        tx.send(Ok(Bytes::from_static(
            b"--BOUND\r\nContent-Disposition: form-data; name=\"upload\"; filename=\"huge.bin\"\r\n\r\n",
        )))
        .await
        .expect("send prelude");
        for _ in 0..chunk_count {
            tx.send(Ok(Bytes::from(vec![b'x'; CHUNK_SIZE])))
                .await
                .expect("send payload chunk");
        }
        tx.send(Ok(Bytes::from_static(b"\r\n--BOUND--\r\n")))
            .await
            .expect("send trailer");
    });

    let form = depart
        .parse_content_type(CONTENT_TYPE, rx)
        .await
        .expect("request should succeed");
    producer.await.expect("producer should finish");

    let file = &form.files()[0];
    assert_eq!(file.size(), Some(expected_size));
    let metadata = tokio::fs::metadata(stored_path(file))
        .await
        .expect("metadata should exist");
    assert_eq!(metadata.len(), expected_size);

    cleanup(root).await;
}

fn disk_processor(root: &Path, strategy: FilenameStrategy) -> Depart {
    let storage = DiskStorage::builder()
        .destination(root)
        .filename(strategy)
        .build()
        .expect("builder should succeed");
    Depart::builder()
        .storage(storage)
        .build()
        .expect("builder should succeed")
}

fn stored_path(file: &UploadedFile) -> PathBuf {
    file.storage_result
        .as_ref()
        .and_then(|result| result.stored().next())
        .and_then(|stored| stored.path.clone())
        .expect("file should be stored on disk")
}

fn temp_root() -> PathBuf {
    std::env::temp_dir().join(format!("depart-test-{}", Uuid::new_v4()))
}

async fn cleanup(path: PathBuf) {
    let _ = tokio::fs::remove_dir_all(path).await;
}

fn multipart_body(parts: &[(&str, &str, &str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (field, file_name, content_type, body) in parts {
        out.extend_from_slice(b"--BOUND\r\n");
        let disposition =
            format!("Content-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\n");
        out.extend_from_slice(disposition.as_bytes());
        let content_type = format!("Content-Type: {content_type}\r\n\r\n");
        out.extend_from_slice(content_type.as_bytes());
        out.extend_from_slice(body);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"--BOUND--\r\n");
    out
}

fn bytes_stream(body: Vec<u8>) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
    stream::iter([Ok(Bytes::from(body))])
}

fn chunked(body: Vec<u8>, size: usize) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
    let chunks: Vec<Result<Bytes, Infallible>> = body
        .chunks(size)
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect();
    stream::iter(chunks)
}
