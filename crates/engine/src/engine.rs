//! Public engine handle and unit orchestration.
//!
//! Every piece of work (prepare, chunk, merge) is a unit that goes through
//! the same FIFO and concurrency limit, including retries. Unit bodies run
//! on spawned tasks without holding the state lock; completions come back
//! through [`Inner::complete`], which is the only place task state changes
//! after admission.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sliceup_protocol::{FileRecord, MergeRequest, QueueStatusEntry, TaskStatus, UploadChunkRequest};
use sliceup_transfer::{
    ChunkDescriptor, ChunkReader, HashProgress, format_eta, format_rate, hashing_percent, plan,
    upload_percent,
};
use tokio::runtime::Handle;
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, MergeMode};
use crate::error::{EngineError, ServerError, UploadError};
use crate::merge::merge;
use crate::prepare::{self, PrepareInput, Prepared};
use crate::scheduler::{Interrupt, Scheduler, SchedulerStats, Unit, UnitKind};
use crate::server::UploadServer;
use crate::status::{StatusEvent, StatusPatch, StatusStore};
use crate::task::{ResumeState, TaskId, TaskRecord, TaskSnapshot, UploadRequest};
use crate::uploader::{ChunkJob, upload_chunk};

/// Handle to the upload engine. Cheap to clone.
#[derive(Clone)]
pub struct UploadEngine {
    inner: Arc<Inner>,
}

struct Inner {
    config: EngineConfig,
    server: Arc<dyn UploadServer>,
    runtime: Handle,
    state: Mutex<State>,
    status: Arc<StatusStore>,
    idle: Notify,
}

#[derive(Default)]
struct State {
    scheduler: Scheduler,
    tasks: HashMap<TaskId, TaskRecord>,
}

enum Work {
    /// Hashing stops only with the task token; pause interrupts the
    /// session round-trips that follow.
    Prepare {
        input: PrepareInput,
        hash_token: CancellationToken,
    },
    Chunk(ChunkJob),
    Merge(MergeRequest),
}

enum UnitOutput {
    Prepared(Prepared),
    ChunkAcked { sequence: u64, bytes: u64 },
    Merged(FileRecord),
}

impl UploadEngine {
    /// Creates an engine bound to the current tokio runtime.
    pub fn new(config: EngineConfig, server: Arc<dyn UploadServer>) -> Result<Self, EngineError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                server,
                runtime,
                state: Mutex::new(State::default()),
                status: Arc::new(StatusStore::new()),
                idle: Notify::new(),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Admits files at the back of the queue and starts work if slots are
    /// free.
    ///
    /// Returns once queue state is updated; uploads complete in the
    /// background. Either every request is admitted or none is.
    pub fn enqueue(&self, requests: Vec<UploadRequest>) -> Result<Vec<TaskId>, EngineError> {
        let records = requests
            .into_iter()
            .map(|req| self.inner.new_record(req))
            .collect::<Result<Vec<_>, _>>()?;

        let mut state = self.inner.lock();
        let mut seen = HashSet::new();
        for record in &records {
            if state.tasks.contains_key(&record.id) || !seen.insert(record.id.clone()) {
                return Err(EngineError::DuplicateTask(record.id.clone()));
            }
        }

        let ids = records.iter().map(|r| r.id.clone()).collect();
        for record in records {
            self.inner.admit(&mut state, record);
        }
        self.inner.pump(&mut state);
        Ok(ids)
    }

    /// Enqueues a file whose fingerprint and session come from an earlier
    /// run. The file is not hashed again; only chunks the server lacks are
    /// sent.
    pub fn resume(&self, request: UploadRequest, resume: ResumeState) -> Result<TaskId, EngineError> {
        let mut record = self.inner.new_record(request)?;
        record.fingerprint = Some(resume.fingerprint);
        record.slice_id = Some(resume.slice_id);

        let mut state = self.inner.lock();
        if state.tasks.contains_key(&record.id) {
            return Err(EngineError::DuplicateTask(record.id));
        }
        let id = record.id.clone();
        self.inner.admit(&mut state, record);
        self.inner.pump(&mut state);
        Ok(id)
    }

    /// Interrupts every running network request and stops admission.
    /// Interrupted units go back to the head of the queue; no task is
    /// failed. Hashing already under way runs to completion.
    pub fn pause_all(&self) {
        let mut state = self.inner.lock();
        let interrupted = state.scheduler.pause();
        info!(interrupted, "uploads paused");
        for task in state.tasks.values().filter(|t| t.status.is_active()) {
            self.inner
                .status
                .patch(task.id.as_str(), StatusPatch::default().with_message("paused"));
        }
    }

    /// Re-admits queued units after [`pause_all`](Self::pause_all).
    pub fn resume_all(&self) {
        let mut state = self.inner.lock();
        if !state.scheduler.is_paused() {
            return;
        }
        state.scheduler.resume();
        info!("uploads resumed");
        self.inner.pump(&mut state);
    }

    /// Cancels one task: queued units are dropped, in-flight requests are
    /// aborted, and the task ends `cancelled`. Acknowledged chunks are kept
    /// but no merge is sent.
    pub fn cancel_task(&self, id: &TaskId) -> Result<(), EngineError> {
        let mut state = self.inner.lock();
        self.inner.cancel_locked(&mut state, id)?;
        self.inner.pump(&mut state);
        Ok(())
    }

    /// Cancels every task that has not finished. Returns how many were
    /// cancelled.
    pub fn cancel_all(&self) -> usize {
        let mut state = self.inner.lock();
        let ids: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.id.clone())
            .collect();
        let cancelled = ids
            .iter()
            .filter(|id| self.inner.cancel_locked(&mut state, id).is_ok())
            .count();
        self.inner.pump(&mut state);
        cancelled
    }

    /// Removes completed, failed and cancelled tasks. Returns how many were
    /// removed.
    pub fn clear_completed(&self) -> usize {
        let mut state = self.inner.lock();
        let ids: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|t| t.status.is_terminal())
            .map(|t| t.id.clone())
            .collect();
        for id in &ids {
            state.tasks.remove(id);
            self.inner.status.remove(id.as_str());
        }
        debug!(removed = ids.len(), "cleared finished tasks");
        ids.len()
    }

    /// Sends the merge of a task parked in `awaiting-merge`.
    pub fn merge_task(&self, id: &TaskId) -> Result<(), EngineError> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownTask(id.clone()))?;
        if task.status != TaskStatus::AwaitingMerge {
            return Err(EngineError::InvalidState {
                task: id.clone(),
                status: task.status,
                operation: "merge",
            });
        }

        info!(task = %id, "manual merge triggered");
        task.status = TaskStatus::Merging;
        self.inner.status.patch(
            id.as_str(),
            StatusPatch::status(TaskStatus::Merging).with_message("merging"),
        );
        state.scheduler.push_back(Unit::new(id.clone(), UnitKind::Merge));
        self.inner.pump(state);
        Ok(())
    }

    /// Re-enqueues a failed task from where it stopped, reusing its
    /// fingerprint, session and acknowledged chunks.
    pub fn retry_task(&self, id: &TaskId) -> Result<(), EngineError> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownTask(id.clone()))?;
        if task.status != TaskStatus::Failed {
            return Err(EngineError::InvalidState {
                task: id.clone(),
                status: task.status,
                operation: "retry",
            });
        }

        info!(task = %id, uploaded = task.uploaded.len(), "retrying failed task");
        task.status = TaskStatus::Pending;
        task.cancel = CancellationToken::new();
        task.retry_count = 0;
        task.last_error = None;
        self.inner.status.patch(
            id.as_str(),
            StatusPatch::status(TaskStatus::Pending)
                .with_message("waiting")
                .with_error(""),
        );
        state.scheduler.push_back(Unit::new(id.clone(), UnitKind::Prepare));
        self.inner.pump(state);
        Ok(())
    }

    /// Read-only status store shared with observers.
    pub fn status_store(&self) -> Arc<StatusStore> {
        Arc::clone(&self.inner.status)
    }

    /// Subscribes to status patches.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.status.subscribe()
    }

    /// Status entries in enqueue order.
    pub fn status(&self) -> Vec<QueueStatusEntry> {
        self.inner.status.snapshot()
    }

    pub fn task(&self, id: &TaskId) -> Option<TaskSnapshot> {
        self.inner.lock().tasks.get(id).map(TaskRecord::snapshot)
    }

    /// Snapshots of every task in enqueue order.
    pub fn tasks(&self) -> Vec<TaskSnapshot> {
        let order = self.inner.status.snapshot();
        let state = self.inner.lock();
        order
            .iter()
            .filter_map(|entry| state.tasks.get(&TaskId::from(entry.task_id.as_str())))
            .map(TaskRecord::snapshot)
            .collect()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.lock().scheduler.stats()
    }

    /// Waits until no unit is queued, running or backing off.
    ///
    /// Never returns while paused with queued work.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.lock().scheduler.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn new_record(&self, request: UploadRequest) -> Result<TaskRecord, EngineError> {
        let metadata = std::fs::metadata(&request.source).map_err(|source| EngineError::Io {
            path: request.source.clone(),
            source,
        })?;
        if !metadata.is_file() {
            return Err(EngineError::Io {
                path: request.source,
                source: io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
            });
        }

        let name = request
            .name
            .or_else(|| {
                request
                    .source
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| request.source.display().to_string());
        let id = request.id.unwrap_or_else(TaskId::generate);
        Ok(TaskRecord::new(
            id,
            name,
            request.source,
            metadata.len(),
            self.config.chunk_size,
        ))
    }

    fn admit(&self, state: &mut State, record: TaskRecord) {
        info!(
            task = %record.id,
            file = %record.name,
            size = record.size_bytes,
            resume = record.slice_id.is_some(),
            "task enqueued"
        );
        self.status
            .insert(QueueStatusEntry::pending(record.id.as_str(), record.name.clone()));
        state
            .scheduler
            .push_back(Unit::new(record.id.clone(), UnitKind::Prepare));
        state.tasks.insert(record.id.clone(), record);
    }

    /// Starts admissible units until the limit is reached or the queue is
    /// empty.
    fn pump(self: &Arc<Self>, state: &mut State) {
        let limit = self.config.concurrency_limit;
        let scope = self.config.concurrency_scope;

        while let Some(unit) = state.scheduler.next_admissible(limit, scope) {
            let Some(task) = state
                .tasks
                .get_mut(&unit.task)
                .filter(|t| t.status.is_active())
            else {
                debug!(task = %unit.task, unit = %unit.kind, "dropping stale unit");
                continue;
            };

            let work = match self.start_unit(task, &unit.kind) {
                Ok(work) => work,
                Err(e) => {
                    self.fail_task(&mut state.scheduler, task, e);
                    continue;
                }
            };
            let token = task.cancel.child_token();
            debug!(task = %unit.task, unit = %unit.kind, attempt = unit.retries, "unit started");
            let unit_id = state.scheduler.start(unit, token.clone());

            let inner = Arc::clone(self);
            self.runtime.spawn(async move {
                let result = inner.execute(work, &token).await;
                inner.complete(unit_id, result);
            });
        }

        if state.scheduler.is_idle() {
            self.idle.notify_waiters();
        }
    }

    /// Copies what the unit needs out of the task record.
    fn start_unit(&self, task: &mut TaskRecord, kind: &UnitKind) -> Result<Work, UploadError> {
        let work = match kind {
            UnitKind::Prepare => {
                if task.fingerprint.is_none() {
                    task.status = TaskStatus::Hashing;
                    self.status.patch(
                        task.id.as_str(),
                        StatusPatch::status(TaskStatus::Hashing).with_message("hashing"),
                    );
                } else {
                    task.status = TaskStatus::Uploading;
                    self.status.patch(
                        task.id.as_str(),
                        StatusPatch::status(TaskStatus::Uploading)
                            .with_message("checking upload session"),
                    );
                }
                Work::Prepare {
                    input: PrepareInput {
                        task: task.id.clone(),
                        name: task.name.clone(),
                        source: task.source.clone(),
                        size_bytes: task.size_bytes,
                        fingerprint: task.fingerprint.clone(),
                        slice_id: task.slice_id.clone(),
                    },
                    hash_token: task.cancel.clone(),
                }
            }
            UnitKind::Chunk(chunk) => {
                let (slice_id, fingerprint) = session_of(task)?;
                Work::Chunk(ChunkJob {
                    reader: ChunkReader::new(&task.source, task.size_bytes),
                    chunk: *chunk,
                    request: UploadChunkRequest {
                        slice_id,
                        sequence: chunk.sequence,
                        chunk_count: task.chunk_count(),
                        fingerprint,
                        file_name: task.name.clone(),
                        chunk_md5: String::new(),
                    },
                    verify: self.config.verify_chunks,
                })
            }
            UnitKind::Merge => {
                let (slice_id, fingerprint) = session_of(task)?;
                Work::Merge(MergeRequest {
                    slice_id,
                    fingerprint,
                    chunk_count: task.chunk_count(),
                    file_name: task.name.clone(),
                    file_size: task.size_bytes,
                })
            }
        };
        Ok(work)
    }

    async fn execute(
        self: &Arc<Self>,
        work: Work,
        token: &CancellationToken,
    ) -> Result<UnitOutput, UploadError> {
        let server = self.server.as_ref();
        match work {
            Work::Prepare { input, hash_token } => self.prepare(input, &hash_token, token).await,
            Work::Chunk(job) => {
                let sequence = job.chunk.sequence;
                let upload = upload_chunk(server, job, self.config.chunk_timeout, token);
                until_cancelled(token, upload)
                    .await
                    .map(|bytes| UnitOutput::ChunkAcked { sequence, bytes })
            }
            Work::Merge(request) => until_cancelled(token, merge(server, request))
                .await
                .map(UnitOutput::Merged),
        }
    }

    async fn prepare(
        self: &Arc<Self>,
        input: PrepareInput,
        hash_token: &CancellationToken,
        token: &CancellationToken,
    ) -> Result<UnitOutput, UploadError> {
        let fingerprint = match input.fingerprint.clone() {
            Some(fp) => fp,
            None => {
                let status = Arc::clone(&self.status);
                let task = input.task.clone();
                let on_hash = move |p: HashProgress| {
                    status.patch(
                        task.as_str(),
                        StatusPatch::progress(hashing_percent(p.ratio()))
                            .with_message(format!("hashing {:.0}%", p.ratio() * 100.0)),
                    );
                };
                let hashing = prepare::hash(&input, self.config.hash_batch_size, on_hash);
                let fp = until_cancelled(hash_token, hashing).await?;
                self.record_fingerprint(&input.task, &fp);
                fp
            }
        };
        let session =
            prepare::open_session(self.server.as_ref(), &self.config, &input, fingerprint);
        until_cancelled(token, session)
            .await
            .map(UnitOutput::Prepared)
    }

    /// Stores a freshly computed fingerprint so retries never hash again.
    fn record_fingerprint(&self, id: &TaskId, fingerprint: &str) {
        let mut state = self.lock();
        if let Some(task) = state.tasks.get_mut(id) {
            task.fingerprint.get_or_insert_with(|| fingerprint.to_string());
        }
        let message = if state.scheduler.is_paused() {
            "paused"
        } else {
            "checking for duplicates"
        };
        self.status.patch(
            id.as_str(),
            StatusPatch::progress(hashing_percent(1.0)).with_message(message),
        );
    }

    /// Handles the result of a finished unit.
    fn complete(self: &Arc<Self>, unit_id: u64, result: Result<UnitOutput, UploadError>) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(running) = state.scheduler.finish(unit_id) else {
            return;
        };
        let unit = running.unit;

        match (result, running.interrupt) {
            (Ok(output), None | Some(Interrupt::Pause)) => self.apply(state, &unit, output),
            (Ok(UnitOutput::ChunkAcked { sequence, .. }), Some(_)) => {
                // Acknowledged before the interrupt landed.
                if let Some(task) = state.tasks.get_mut(&unit.task) {
                    task.uploaded.insert(sequence);
                }
            }
            (Ok(_), Some(_)) => {}
            (Err(_), Some(Interrupt::Pause)) => {
                debug!(task = %unit.task, unit = %unit.kind, "unit paused");
                state.scheduler.push_front(unit);
            }
            (Err(_), Some(interrupt)) => {
                debug!(task = %unit.task, unit = %unit.kind, ?interrupt, "unit dropped");
            }
            (Err(UploadError::Cancelled), None) => {
                debug!(task = %unit.task, unit = %unit.kind, "unit cancelled");
            }
            (Err(e), None) => self.handle_failure(state, unit, e),
        }

        self.pump(state);
    }

    fn apply(&self, state: &mut State, unit: &Unit, output: UnitOutput) {
        let Some(task) = state.tasks.get_mut(&unit.task) else {
            return;
        };
        match output {
            UnitOutput::Prepared(Prepared::Duplicate {
                fingerprint,
                record,
            }) => {
                task.fingerprint.get_or_insert(fingerprint);
                self.complete_task(task, record, "already stored");
            }
            UnitOutput::Prepared(Prepared::Ready {
                fingerprint,
                slice_id,
                chunk_count,
                server_chunks,
            }) => match self.install_plan(task, fingerprint, slice_id, chunk_count, server_chunks) {
                Ok(missing) if missing.is_empty() => {
                    self.all_chunks_uploaded(&mut state.scheduler, task);
                }
                Ok(missing) => {
                    for chunk in missing {
                        state
                            .scheduler
                            .push_back(Unit::new(task.id.clone(), UnitKind::Chunk(chunk)));
                    }
                }
                Err(e) => self.fail_task(&mut state.scheduler, task, e),
            },
            UnitOutput::ChunkAcked { sequence, bytes } => {
                task.uploaded.insert(sequence);
                task.retry_count = 0;
                task.speed.record(bytes);

                let uploaded = task.uploaded.len() as u64;
                let total = task.chunk_count();
                let mut message = format!(
                    "{uploaded}/{total} chunks, {}",
                    format_rate(task.speed.bytes_per_second())
                );
                let eta = task.speed.eta(task.remaining_bytes());
                if let Some(eta) = eta.filter(|_| uploaded < total) {
                    message.push_str(&format!(", {} left", format_eta(eta)));
                }
                self.status.patch(
                    task.id.as_str(),
                    StatusPatch::progress(upload_percent(uploaded, total)).with_message(message),
                );
                if task.status == TaskStatus::Uploading && task.all_uploaded() {
                    self.all_chunks_uploaded(&mut state.scheduler, task);
                }
            }
            UnitOutput::Merged(record) => self.complete_task(task, record, "merged"),
        }
    }

    /// Installs the chunk plan and returns the chunks still to send.
    fn install_plan(
        &self,
        task: &mut TaskRecord,
        fingerprint: String,
        slice_id: String,
        chunk_count: u64,
        server_chunks: Vec<u64>,
    ) -> Result<Vec<ChunkDescriptor>, UploadError> {
        task.fingerprint.get_or_insert(fingerprint);
        let chunks = plan(task.size_bytes, task.chunk_size).map_err(UploadError::Source)?;
        if chunk_count != chunks.len() as u64 {
            return Err(UploadError::InitFailure(ServerError::Protocol(format!(
                "server expects {chunk_count} chunks, planned {}",
                chunks.len()
            ))));
        }

        // The session's own list is authoritative; acknowledgements from an
        // earlier or expired session do not carry over.
        task.slice_id = Some(slice_id);
        task.chunks = chunks;
        task.uploaded = server_chunks
            .into_iter()
            .filter(|s| *s < chunk_count)
            .collect();
        task.status = TaskStatus::Uploading;

        let uploaded = task.uploaded.len() as u64;
        self.status.patch(
            task.id.as_str(),
            StatusPatch::status(TaskStatus::Uploading)
                .with_progress(upload_percent(uploaded, chunk_count))
                .with_message(format!("{uploaded}/{chunk_count} chunks")),
        );
        debug!(task = %task.id, uploaded, total = chunk_count, "chunk plan ready");
        Ok(task.missing_chunks())
    }

    fn all_chunks_uploaded(&self, scheduler: &mut Scheduler, task: &mut TaskRecord) {
        match self.config.merge_mode {
            MergeMode::Automatic => {
                task.status = TaskStatus::Merging;
                self.status.patch(
                    task.id.as_str(),
                    StatusPatch::status(TaskStatus::Merging).with_message("merging"),
                );
                scheduler.push_back(Unit::new(task.id.clone(), UnitKind::Merge));
            }
            MergeMode::Manual => {
                info!(task = %task.id, "all chunks uploaded, awaiting merge");
                task.status = TaskStatus::AwaitingMerge;
                self.status.patch(
                    task.id.as_str(),
                    StatusPatch::status(TaskStatus::AwaitingMerge)
                        .with_message("waiting for merge trigger"),
                );
            }
        }
    }

    fn complete_task(&self, task: &mut TaskRecord, record: FileRecord, how: &str) {
        info!(task = %task.id, file_id = %record.file_id, how, "upload complete");
        task.status = TaskStatus::Completed;
        task.retry_count = 0;
        task.file_record = Some(record);
        self.status.patch(
            task.id.as_str(),
            StatusPatch::status(TaskStatus::Completed)
                .with_progress(100.0)
                .with_message(how),
        );
    }

    /// Re-queues a retryable failure after its backoff, or fails the task.
    fn handle_failure(self: &Arc<Self>, state: &mut State, mut unit: Unit, err: UploadError) {
        let Some(task) = state
            .tasks
            .get_mut(&unit.task)
            .filter(|t| t.status.is_active())
        else {
            return;
        };

        let budget = match unit.kind {
            UnitKind::Merge => self.config.merge_max_retries,
            _ => self.config.retry.max_retries,
        };
        if !err.is_retryable() || unit.retries >= budget {
            let err = if err.is_retryable() {
                UploadError::RetriesExhausted {
                    attempts: unit.retries + 1,
                    last: Box::new(err),
                }
            } else {
                err
            };
            self.fail_task(&mut state.scheduler, task, err);
            return;
        }

        let delay = self.config.retry.delay_for_retry(unit.retries);
        unit.retries += 1;
        task.retry_count = unit.retries;
        warn!(
            task = %task.id,
            unit = %unit.kind,
            attempt = unit.retries,
            max = budget,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying after backoff"
        );
        self.status.patch(
            task.id.as_str(),
            StatusPatch::default().with_message(format!(
                "{} failed, retry {}/{} in {:.1}s",
                unit.kind,
                unit.retries,
                budget,
                delay.as_secs_f64()
            )),
        );

        let token = task.cancel.clone();
        state.scheduler.begin_backoff();
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            let requeue = tokio::select! {
                biased;
                _ = token.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            };
            inner.end_backoff(unit, requeue);
        });
    }

    fn end_backoff(self: &Arc<Self>, unit: Unit, requeue: bool) {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.scheduler.end_backoff();
        let active = state
            .tasks
            .get(&unit.task)
            .is_some_and(|t| t.status.is_active());
        if requeue && active {
            debug!(task = %unit.task, unit = %unit.kind, "re-queued after backoff");
            state.scheduler.push_back(unit);
        }
        self.pump(state);
    }

    fn fail_task(&self, scheduler: &mut Scheduler, task: &mut TaskRecord, err: UploadError) {
        if task.status.is_terminal() {
            return;
        }
        error!(task = %task.id, error = %err, uploaded = task.uploaded.len(), "task failed");
        let message = err.to_string();
        task.status = TaskStatus::Failed;
        task.last_error = Some(message.clone());
        task.cancel.cancel();
        scheduler.remove_task(&task.id, Interrupt::TaskFailed);
        self.status.patch(
            task.id.as_str(),
            StatusPatch::status(TaskStatus::Failed)
                .with_message("failed")
                .with_error(message),
        );
    }

    fn cancel_locked(&self, state: &mut State, id: &TaskId) -> Result<(), EngineError> {
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownTask(id.clone()))?;
        if matches!(task.status, TaskStatus::Completed | TaskStatus::Cancelled) {
            return Err(EngineError::InvalidState {
                task: id.clone(),
                status: task.status,
                operation: "cancel",
            });
        }

        task.status = TaskStatus::Cancelled;
        task.cancel.cancel();
        let units = state.scheduler.remove_task(id, Interrupt::Cancel);
        info!(task = %id, units, uploaded = task.uploaded.len(), "task cancelled");
        self.status.patch(
            id.as_str(),
            StatusPatch::status(TaskStatus::Cancelled).with_message("cancelled"),
        );
        Ok(())
    }
}

/// Runs `fut` unless `token` fires first.
async fn until_cancelled<T>(
    token: &CancellationToken,
    fut: impl Future<Output = Result<T, UploadError>>,
) -> Result<T, UploadError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(UploadError::Cancelled),
        result = fut => result,
    }
}

fn session_of(task: &TaskRecord) -> Result<(String, String), UploadError> {
    match (&task.slice_id, &task.fingerprint) {
        (Some(slice_id), Some(fingerprint)) => Ok((slice_id.clone(), fingerprint.clone())),
        _ => Err(UploadError::InitFailure(ServerError::Protocol(
            "no upload session".into(),
        ))),
    }
}
