//! Scripted in-memory server used by the engine tests.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use sliceup_protocol::{
    CheckExistsRequest, CheckExistsResponse, FileRecord, InitUploadRequest, InitUploadResponse,
    MergeRequest, MergeResponse, SessionStatus, UploadChunkRequest, UploadChunkResponse,
    UploadStatusResponse,
};
use tokio_util::sync::CancellationToken;

use crate::error::ServerError;
use crate::server::{ServerFuture, UploadServer};

/// Recorded server call.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    CheckExists(String),
    Init(InitUploadRequest),
    Chunk { sequence: u64, md5: String, len: usize },
    Merge(String),
    Status(String),
}

/// Scripted reaction to one chunk upload.
#[derive(Debug, Clone)]
pub(crate) enum ChunkBehavior {
    Accept,
    Reject,
    Fail(ServerError),
    /// Block until the request is cancelled.
    Hang,
}

pub(crate) struct MockServer {
    pub existing: Mutex<Option<Result<CheckExistsResponse, ServerError>>>,
    pub init_uploaded: Mutex<Vec<u64>>,
    pub session_status: Mutex<Option<Result<UploadStatusResponse, ServerError>>>,
    pub merge_failures: Mutex<VecDeque<ServerError>>,
    pub chunk_delay: Duration,
    chunk_script: Mutex<HashMap<u64, VecDeque<ChunkBehavior>>>,
    accepted: Mutex<BTreeSet<u64>>,
    chunk_total: AtomicUsize,
    sessions: AtomicUsize,
    calls: Mutex<Vec<Call>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Decrements the in-flight counter even if the request future is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockServer {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(chunk_delay: Duration) -> Self {
        Self {
            existing: Mutex::new(None),
            init_uploaded: Mutex::new(Vec::new()),
            session_status: Mutex::new(None),
            merge_failures: Mutex::new(VecDeque::new()),
            chunk_delay,
            chunk_script: Mutex::new(HashMap::new()),
            accepted: Mutex::new(BTreeSet::new()),
            chunk_total: AtomicUsize::new(0),
            sessions: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Queues behaviours for `sequence`; once exhausted, chunks are accepted.
    pub fn script(&self, sequence: u64, behaviors: impl IntoIterator<Item = ChunkBehavior>) {
        self.chunk_script
            .lock()
            .unwrap()
            .entry(sequence)
            .or_default()
            .extend(behaviors);
    }

    pub fn set_existing(&self, record: FileRecord) {
        *self.existing.lock().unwrap() = Some(Ok(CheckExistsResponse {
            exists: true,
            file_record: Some(record),
        }));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn chunk_calls(&self, sequence: u64) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Chunk { sequence: s, .. } if *s == sequence))
            .count()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_behavior(&self, sequence: u64) -> ChunkBehavior {
        self.chunk_script
            .lock()
            .unwrap()
            .get_mut(&sequence)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ChunkBehavior::Accept)
    }
}

pub(crate) fn record_for(fingerprint: &str, name: &str, size: u64) -> FileRecord {
    FileRecord {
        file_id: format!("file-{fingerprint}"),
        fingerprint: fingerprint.to_string(),
        file_name: name.to_string(),
        size_bytes: size,
        path: String::new(),
        created_at: None,
    }
}

impl UploadServer for MockServer {
    fn init_upload(&self, request: InitUploadRequest) -> ServerFuture<'_, InitUploadResponse> {
        self.record(Call::Init(request.clone()));
        // Every init opens a fresh session: slice-1, slice-2, ...
        let slice_id = format!("slice-{}", self.sessions.fetch_add(1, Ordering::SeqCst) + 1);
        let uploaded_chunks = self.init_uploaded.lock().unwrap().clone();
        *self.accepted.lock().unwrap() = uploaded_chunks.iter().copied().collect();
        let planned = sliceup_transfer::chunk_count(request.file_size, request.chunk_size);
        if let Ok(count) = planned {
            self.chunk_total.store(count as usize, Ordering::SeqCst);
        }
        Box::pin(async move {
            let chunk_count = planned.map_err(|e| ServerError::Status {
                status: 400,
                message: e.to_string(),
            })?;
            Ok(InitUploadResponse {
                slice_id,
                chunk_count,
                uploaded_chunks,
            })
        })
    }

    fn upload_chunk(
        &self,
        request: UploadChunkRequest,
        data: Vec<u8>,
        cancel: CancellationToken,
    ) -> ServerFuture<'_, UploadChunkResponse> {
        self.record(Call::Chunk {
            sequence: request.sequence,
            md5: request.chunk_md5.clone(),
            len: data.len(),
        });
        let behavior = self.next_behavior(request.sequence);
        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            let _guard = InFlight(&self.in_flight);
            self.peak.fetch_max(now, Ordering::SeqCst);

            match behavior {
                ChunkBehavior::Accept => {
                    if !self.chunk_delay.is_zero() {
                        tokio::time::sleep(self.chunk_delay).await;
                    }
                    self.accepted.lock().unwrap().insert(request.sequence);
                    Ok(UploadChunkResponse { accepted: true })
                }
                ChunkBehavior::Reject => Ok(UploadChunkResponse { accepted: false }),
                ChunkBehavior::Fail(e) => Err(e),
                ChunkBehavior::Hang => {
                    cancel.cancelled().await;
                    Err(ServerError::Cancelled)
                }
            }
        })
    }

    fn check_exists(&self, request: CheckExistsRequest) -> ServerFuture<'_, CheckExistsResponse> {
        self.record(Call::CheckExists(request.fingerprint.clone()));
        let scripted = self.existing.lock().unwrap().clone();
        Box::pin(async move {
            scripted.unwrap_or(Ok(CheckExistsResponse {
                exists: false,
                file_record: None,
            }))
        })
    }

    fn merge_chunks(&self, request: MergeRequest) -> ServerFuture<'_, MergeResponse> {
        self.record(Call::Merge(request.slice_id.clone()));
        let failure = self.merge_failures.lock().unwrap().pop_front();
        Box::pin(async move {
            if let Some(e) = failure {
                return Err(e);
            }
            Ok(MergeResponse {
                file_record: record_for(&request.fingerprint, &request.file_name, request.file_size),
            })
        })
    }

    fn upload_status(&self, slice_id: String) -> ServerFuture<'_, UploadStatusResponse> {
        self.record(Call::Status(slice_id));
        let scripted = self.session_status.lock().unwrap().clone();
        let accepted: Vec<u64> = self.accepted.lock().unwrap().iter().copied().collect();
        let chunk_total = self.chunk_total.load(Ordering::SeqCst) as u64;
        Box::pin(async move {
            scripted.unwrap_or_else(|| {
                Ok(UploadStatusResponse {
                    chunk_total,
                    chunk_uploaded: accepted.len() as u64,
                    uploaded_chunks: accepted,
                    status: SessionStatus::Uploading,
                    file_record: None,
                })
            })
        })
    }
}
