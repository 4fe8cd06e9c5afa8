//! End-to-end uploads from the engine into the reference chunk store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use sliceup_engine::{
    EngineConfig, MergeMode, ResumeState, ServerFuture, UploadEngine, UploadRequest, UploadServer,
};
use sliceup_protocol::{
    CheckExistsRequest, CheckExistsResponse, InitUploadRequest, InitUploadResponse, MergeRequest,
    MergeResponse, TaskStatus, UploadChunkRequest, UploadChunkResponse, UploadStatusResponse,
};
use sliceup_store::ChunkStore;
use sliceup_transfer::checksum_bytes;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const CHUNK: u64 = 1024;

fn sample(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
        .collect()
}

fn write(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

fn config() -> EngineConfig {
    EngineConfig {
        chunk_size: CHUNK,
        hash_batch_size: 4096,
        concurrency_limit: 3,
        ..Default::default()
    }
}

async fn settle(engine: &UploadEngine) {
    tokio::time::timeout(Duration::from_secs(20), engine.wait_idle())
        .await
        .expect("engine did not settle");
}

/// Delegates to the store and counts chunk transfers.
struct Counting {
    store: Arc<ChunkStore>,
    chunks: AtomicUsize,
    inits: AtomicUsize,
}

impl Counting {
    fn new(store: Arc<ChunkStore>) -> Self {
        Self {
            store,
            chunks: AtomicUsize::new(0),
            inits: AtomicUsize::new(0),
        }
    }
}

impl UploadServer for Counting {
    fn init_upload(&self, request: InitUploadRequest) -> ServerFuture<'_, InitUploadResponse> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        UploadServer::init_upload(self.store.as_ref(), request)
    }

    fn upload_chunk(
        &self,
        request: UploadChunkRequest,
        data: Vec<u8>,
        cancel: CancellationToken,
    ) -> ServerFuture<'_, UploadChunkResponse> {
        self.chunks.fetch_add(1, Ordering::SeqCst);
        self.store.upload_chunk(request, data, cancel)
    }

    fn check_exists(&self, request: CheckExistsRequest) -> ServerFuture<'_, CheckExistsResponse> {
        UploadServer::check_exists(self.store.as_ref(), request)
    }

    fn merge_chunks(&self, request: MergeRequest) -> ServerFuture<'_, MergeResponse> {
        self.store.merge_chunks(request)
    }

    fn upload_status(&self, slice_id: String) -> ServerFuture<'_, UploadStatusResponse> {
        self.store.upload_status(slice_id)
    }
}

#[tokio::test]
async fn uploaded_file_matches_source() {
    let src = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let data = sample(10 * 1024 + 123, 7);
    let path = write(src.path(), "video.bin", &data);

    let store = Arc::new(ChunkStore::open(root.path()).await.unwrap());
    let engine = UploadEngine::new(config(), store.clone()).unwrap();
    let id = engine.enqueue(vec![UploadRequest::new(&path)]).unwrap().remove(0);
    settle(&engine).await;

    let task = engine.task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.chunk_count, Some(11));
    let record = task.file_record.unwrap();
    assert_eq!(record.fingerprint, checksum_bytes(&data));
    assert_eq!(std::fs::read(&record.path).unwrap(), data);
    assert!(engine.stats().peak_running <= 3);
}

#[tokio::test]
async fn same_content_is_uploaded_once() {
    let src = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let data = sample(5000, 3);
    let first = write(src.path(), "first.bin", &data);
    let second = write(src.path(), "copy-of-first.bin", &data);

    let store = Arc::new(ChunkStore::open(root.path()).await.unwrap());
    let counting = Arc::new(Counting::new(store.clone()));
    let engine = UploadEngine::new(config(), counting.clone()).unwrap();

    let a = engine.enqueue(vec![UploadRequest::new(&first)]).unwrap().remove(0);
    settle(&engine).await;
    let b = engine.enqueue(vec![UploadRequest::new(&second)]).unwrap().remove(0);
    settle(&engine).await;

    let a = engine.task(&a).unwrap();
    let b = engine.task(&b).unwrap();
    assert_eq!(a.status, TaskStatus::Completed);
    assert_eq!(b.status, TaskStatus::Completed);
    assert_eq!(b.chunk_count, None);
    assert_eq!(b.file_record, a.file_record);

    assert_eq!(counting.inits.load(Ordering::SeqCst), 1);
    assert_eq!(counting.chunks.load(Ordering::SeqCst), 5);
    assert_eq!(store.session_ids().len(), 1);
}

#[tokio::test]
async fn merge_is_independent_of_arrival_order() {
    let root = TempDir::new().unwrap();
    let store = ChunkStore::open(root.path()).await.unwrap();
    let orders: [&[u64]; 4] = [&[0, 1, 2, 3], &[3, 2, 1, 0], &[2, 0, 3, 1], &[1, 3, 0, 2]];

    for (n, order) in orders.iter().enumerate() {
        let data = sample(3 * CHUNK as usize + 17, n as u8);
        let fingerprint = checksum_bytes(&data);
        let init = store
            .init_upload(InitUploadRequest {
                file_name: format!("f{n}.bin"),
                file_size: data.len() as u64,
                fingerprint: fingerprint.clone(),
                chunk_size: CHUNK,
            })
            .await
            .unwrap();
        assert_eq!(init.chunk_count, 4);

        for &sequence in order.iter() {
            let start = (sequence * CHUNK) as usize;
            let end = (start + CHUNK as usize).min(data.len());
            let bytes = &data[start..end];
            store
                .put_chunk(
                    UploadChunkRequest {
                        slice_id: init.slice_id.clone(),
                        sequence,
                        chunk_count: 4,
                        fingerprint: fingerprint.clone(),
                        file_name: format!("f{n}.bin"),
                        chunk_md5: checksum_bytes(bytes),
                    },
                    bytes,
                )
                .await
                .unwrap();
        }

        let merged = store
            .merge(MergeRequest {
                slice_id: init.slice_id,
                fingerprint,
                chunk_count: 4,
                file_name: format!("f{n}.bin"),
                file_size: data.len() as u64,
            })
            .await
            .unwrap();
        assert_eq!(std::fs::read(&merged.file_record.path).unwrap(), data, "order {order:?}");
    }
}

#[tokio::test]
async fn resume_sends_only_missing_chunks() {
    let src = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let data = sample(4 * CHUNK as usize, 9);
    let path = write(src.path(), "big.bin", &data);

    // First run: upload every chunk but leave the merge to a later process.
    let resume = {
        let store = Arc::new(ChunkStore::open(root.path()).await.unwrap());
        let engine = UploadEngine::new(
            EngineConfig {
                merge_mode: MergeMode::Manual,
                ..config()
            },
            store,
        )
        .unwrap();
        let id = engine.enqueue(vec![UploadRequest::new(&path)]).unwrap().remove(0);
        settle(&engine).await;
        let task = engine.task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::AwaitingMerge);
        task.resume_state().unwrap()
    };

    // Drop one chunk from disk to simulate an interrupted upload.
    let chunk = root
        .path()
        .join("sessions")
        .join(&resume.slice_id)
        .join("chunks")
        .join("2");
    std::fs::remove_file(chunk).unwrap();

    let store = Arc::new(ChunkStore::open(root.path()).await.unwrap());
    assert_eq!(
        store.status(&resume.slice_id).unwrap().uploaded_chunks,
        vec![0, 1, 3]
    );
    let counting = Arc::new(Counting::new(store.clone()));
    let engine = UploadEngine::new(config(), counting.clone()).unwrap();
    let id = engine
        .resume(
            UploadRequest::new(&path),
            ResumeState {
                fingerprint: resume.fingerprint.clone(),
                slice_id: resume.slice_id.clone(),
            },
        )
        .unwrap();
    settle(&engine).await;

    let task = engine.task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(counting.chunks.load(Ordering::SeqCst), 1);
    assert_eq!(counting.inits.load(Ordering::SeqCst), 0);
    assert_eq!(std::fs::read(task.file_record.unwrap().path).unwrap(), data);
}

#[tokio::test]
async fn corrupted_source_fails_merge_verification() {
    let src = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let data = sample(3000, 1);
    let path = write(src.path(), "drift.bin", &data);

    let store = Arc::new(ChunkStore::open(root.path()).await.unwrap());
    let engine = UploadEngine::new(
        EngineConfig {
            merge_mode: MergeMode::Manual,
            ..config()
        },
        store.clone(),
    )
    .unwrap();

    // Hash and upload the original, then rewrite chunk 0 on the server side.
    let id = engine.enqueue(vec![UploadRequest::new(&path)]).unwrap().remove(0);
    settle(&engine).await;
    let slice = engine.task(&id).unwrap().slice_id.unwrap();
    let stored = root.path().join("sessions").join(&slice).join("chunks").join("0");
    std::fs::write(&stored, vec![0u8; CHUNK as usize]).unwrap();

    engine.merge_task(&id).unwrap();
    settle(&engine).await;

    let task = engine.task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("expected"));
    assert_eq!(task.uploaded_chunks, vec![0, 1, 2]);
}
