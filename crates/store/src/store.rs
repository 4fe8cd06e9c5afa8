//! Filesystem chunk store.
//!
//! Layout under the root directory:
//!
//! ```text
//! sessions/<slice_id>/session.json
//! sessions/<slice_id>/chunks/<sequence>
//! files/<file_id>/<file_name>
//! index/<fingerprint>.json
//! ```
//!
//! Chunk files are the source of truth for what a session holds; they are
//! written under a temporary name and renamed into place, so a chunk is
//! either fully stored or absent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sliceup_protocol::{
    CheckExistsRequest, CheckExistsResponse, FileRecord, InitUploadRequest, InitUploadResponse,
    MergeRequest, MergeResponse, SessionStatus, UploadChunkRequest, UploadChunkResponse,
    UploadStatusResponse,
};
use sliceup_transfer::{
    ChunkWriter, DEFAULT_HASH_BATCH_SIZE, chunk_count, digest_file, validate_file_name,
    verify_checksum,
};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::session::Session;

const SESSION_FILE: &str = "session.json";

/// Outcome of [`ChunkStore::cleanup_expired`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub sessions_removed: usize,
    pub bytes_freed: u64,
}

/// Server-side chunk store on a local directory.
pub struct ChunkStore {
    root: PathBuf,
    hash_batch_size: usize,
    sessions: Mutex<HashMap<String, Session>>,
    /// Serializes merges so one session is never assembled twice at once.
    merge_lock: tokio::sync::Mutex<()>,
}

impl ChunkStore {
    /// Opens (or creates) a store rooted at `root` and loads its sessions.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in ["sessions", "files", "index"] {
            tokio::fs::create_dir_all(root.join(dir)).await?;
        }

        let sessions = load_sessions(&root.join("sessions")).await?;
        info!(root = %root.display(), sessions = sessions.len(), "chunk store opened");
        Ok(Self {
            root,
            hash_batch_size: DEFAULT_HASH_BATCH_SIZE,
            sessions: Mutex::new(sessions),
            merge_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Slice ids of every known session, sorted.
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Opens a session for a fingerprint, or reopens the open session that
    /// already holds chunks of the same content.
    pub async fn init_upload(
        &self,
        req: InitUploadRequest,
    ) -> Result<InitUploadResponse, StoreError> {
        validate_file_name(&req.file_name)?;
        validate_fingerprint(&req.fingerprint)?;
        let count = chunk_count(req.file_size, req.chunk_size)?;

        let session = {
            let mut sessions = self.lock();
            if let Some(existing) = sessions
                .values()
                .find(|s| s.matches(&req.fingerprint, req.file_size, req.chunk_size))
            {
                info!(
                    slice = %existing.slice_id,
                    fingerprint = %req.fingerprint,
                    stored = existing.uploaded.len(),
                    "reopening upload session"
                );
                return Ok(InitUploadResponse {
                    slice_id: existing.slice_id.clone(),
                    chunk_count: existing.chunk_count,
                    uploaded_chunks: existing.uploaded.iter().copied().collect(),
                });
            }

            let session = Session::new(
                uuid::Uuid::new_v4().to_string(),
                req.fingerprint,
                req.file_name,
                req.file_size,
                req.chunk_size,
                count,
            );
            sessions.insert(session.slice_id.clone(), session.clone());
            session
        };

        if let Err(e) = self.persist(&session).await {
            self.lock().remove(&session.slice_id);
            return Err(e);
        }
        info!(
            slice = %session.slice_id,
            file = %session.file_name,
            size = session.file_size,
            chunks = count,
            "upload session created"
        );
        Ok(InitUploadResponse {
            slice_id: session.slice_id,
            chunk_count: count,
            uploaded_chunks: Vec::new(),
        })
    }

    /// Stores one chunk after checking its length and checksum.
    ///
    /// Re-sending a stored chunk, or any chunk of a merged session, succeeds
    /// without writing.
    pub async fn put_chunk(
        &self,
        req: UploadChunkRequest,
        data: &[u8],
    ) -> Result<UploadChunkResponse, StoreError> {
        let expected_len = {
            let sessions = self.lock();
            let session = sessions
                .get(&req.slice_id)
                .ok_or_else(|| StoreError::UnknownSession(req.slice_id.clone()))?;
            if session.fingerprint != req.fingerprint {
                return Err(StoreError::InvalidRequest(format!(
                    "fingerprint does not match session {}",
                    req.slice_id
                )));
            }
            if session.status == SessionStatus::Merged
                || session.uploaded.contains(&req.sequence)
            {
                debug!(slice = %req.slice_id, sequence = req.sequence, "chunk already stored");
                return Ok(UploadChunkResponse { accepted: true });
            }
            if req.sequence >= session.chunk_count {
                return Err(StoreError::InvalidRequest(format!(
                    "sequence {} out of range 0..{}",
                    req.sequence, session.chunk_count
                )));
            }
            session.chunk_len(req.sequence)
        };

        if data.len() as u64 != expected_len {
            return Err(StoreError::InvalidRequest(format!(
                "chunk {} is {} bytes, expected {expected_len}",
                req.sequence,
                data.len()
            )));
        }
        verify_checksum(req.sequence, data, &req.chunk_md5)?;

        let dir = self.chunk_dir(&req.slice_id);
        tokio::fs::create_dir_all(&dir).await?;
        let tmp = dir.join(format!("{}.{}.tmp", req.sequence, uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, dir.join(req.sequence.to_string())).await?;

        let mut sessions = self.lock();
        if let Some(session) = sessions.get_mut(&req.slice_id) {
            session.uploaded.insert(req.sequence);
            session.updated_at = Utc::now();
        }
        debug!(slice = %req.slice_id, sequence = req.sequence, bytes = data.len(), "chunk stored");
        Ok(UploadChunkResponse { accepted: true })
    }

    /// Looks up a merged file by fingerprint.
    pub async fn check_exists(
        &self,
        req: CheckExistsRequest,
    ) -> Result<CheckExistsResponse, StoreError> {
        validate_fingerprint(&req.fingerprint)?;
        let path = self.index_path(&req.fingerprint);
        let record: FileRecord = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CheckExistsResponse {
                    exists: false,
                    file_record: None,
                });
            }
            Err(e) => return Err(e.into()),
        };

        if !tokio::fs::try_exists(&record.path).await? {
            warn!(fingerprint = %req.fingerprint, path = %record.path, "indexed file is gone");
            return Ok(CheckExistsResponse {
                exists: false,
                file_record: None,
            });
        }
        Ok(CheckExistsResponse {
            exists: true,
            file_record: Some(record),
        })
    }

    /// Assembles a session into its final file.
    ///
    /// Every sequence in `0..chunk_count` must be stored. The assembled file
    /// must hash to the session fingerprint, otherwise it is deleted. Merging
    /// a merged session returns its record again.
    pub async fn merge(&self, req: MergeRequest) -> Result<MergeResponse, StoreError> {
        let _merging = self.merge_lock.lock().await;

        let session = self
            .lock()
            .get(&req.slice_id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownSession(req.slice_id.clone()))?;
        if let Some(record) = session.file_record.clone() {
            debug!(slice = %req.slice_id, "session already merged");
            return Ok(MergeResponse {
                file_record: record,
            });
        }
        if req.fingerprint != session.fingerprint || req.chunk_count != session.chunk_count {
            return Err(StoreError::InvalidRequest(format!(
                "merge request does not match session {}",
                req.slice_id
            )));
        }
        let missing = session.missing();
        if !missing.is_empty() {
            return Err(StoreError::MissingChunks { missing });
        }

        let file_id = uuid::Uuid::new_v4().to_string();
        let file_dir = self.root.join("files").join(&file_id);
        let target = file_dir.join(&session.file_name);
        let assembled = tokio::task::spawn_blocking({
            let chunks = self.chunk_dir(&session.slice_id);
            let target = target.clone();
            let (chunk_size, count, size) =
                (session.chunk_size, session.chunk_count, session.file_size);
            move || assemble(&chunks, &target, chunk_size, count, size)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?;
        if let Err(e) = assembled {
            let _ = tokio::fs::remove_dir_all(&file_dir).await;
            return Err(e);
        }

        let actual = digest_file(&target, self.hash_batch_size, |_| {}).await?;
        if !actual.eq_ignore_ascii_case(&session.fingerprint) {
            warn!(slice = %session.slice_id, expected = %session.fingerprint, actual = %actual, "merged file corrupt, discarding");
            tokio::fs::remove_dir_all(&file_dir).await?;
            return Err(StoreError::FingerprintMismatch {
                expected: session.fingerprint,
                actual,
            });
        }

        let record = FileRecord {
            file_id,
            fingerprint: session.fingerprint.clone(),
            file_name: session.file_name.clone(),
            size_bytes: session.file_size,
            path: target.to_string_lossy().into_owned(),
            created_at: Some(Utc::now()),
        };
        write_json(&self.index_path(&session.fingerprint), &record).await?;

        let merged = {
            let mut sessions = self.lock();
            let Some(entry) = sessions.get_mut(&session.slice_id) else {
                return Err(StoreError::UnknownSession(session.slice_id));
            };
            entry.status = SessionStatus::Merged;
            entry.file_record = Some(record.clone());
            entry.updated_at = Utc::now();
            entry.clone()
        };
        self.persist(&merged).await?;
        if let Err(e) = tokio::fs::remove_dir_all(self.chunk_dir(&merged.slice_id)).await {
            warn!(slice = %merged.slice_id, error = %e, "failed to delete merged chunks");
        }

        info!(
            slice = %merged.slice_id,
            file_id = %record.file_id,
            size = record.size_bytes,
            "session merged"
        );
        Ok(MergeResponse {
            file_record: record,
        })
    }

    pub fn status(&self, slice_id: &str) -> Result<UploadStatusResponse, StoreError> {
        self.lock()
            .get(slice_id)
            .map(Session::to_status)
            .ok_or_else(|| StoreError::UnknownSession(slice_id.to_string()))
    }

    /// Deletes open sessions, with their chunks, untouched for longer than
    /// `max_age`. Merged sessions hold no chunk data and are kept.
    pub async fn cleanup_expired(&self, max_age: Duration) -> Result<CleanupReport, StoreError> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| StoreError::InvalidRequest(format!("max age: {e}")))?;
        let cutoff = Utc::now() - max_age;

        let expired: Vec<Session> = {
            let mut sessions = self.lock();
            let ids: Vec<String> = sessions
                .values()
                .filter(|s| s.status == SessionStatus::Uploading && s.updated_at <= cutoff)
                .map(|s| s.slice_id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        let mut report = CleanupReport::default();
        for session in expired {
            let dir = self.session_dir(&session.slice_id);
            report.bytes_freed += dir_size(&self.chunk_dir(&session.slice_id)).await;
            tokio::fs::remove_dir_all(&dir).await?;
            report.sessions_removed += 1;
            info!(
                slice = %session.slice_id,
                file = %session.file_name,
                chunks = session.uploaded.len(),
                "expired session removed"
            );
        }
        Ok(report)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session_dir(&self, slice_id: &str) -> PathBuf {
        self.root.join("sessions").join(slice_id)
    }

    fn chunk_dir(&self, slice_id: &str) -> PathBuf {
        self.session_dir(slice_id).join("chunks")
    }

    fn index_path(&self, fingerprint: &str) -> PathBuf {
        self.root
            .join("index")
            .join(format!("{}.json", fingerprint.to_ascii_lowercase()))
    }

    async fn persist(&self, session: &Session) -> Result<(), StoreError> {
        let dir = self.session_dir(&session.slice_id);
        tokio::fs::create_dir_all(&dir).await?;
        write_json(&dir.join(SESSION_FILE), session).await
    }
}

/// Fingerprints name index files, so only hex digests are accepted.
fn validate_fingerprint(fingerprint: &str) -> Result<(), StoreError> {
    if fingerprint.is_empty() || !fingerprint.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(StoreError::InvalidRequest(format!(
            "fingerprint must be a hex digest, got {fingerprint:?}"
        )));
    }
    Ok(())
}

/// Writes every chunk at its offset into `target`.
fn assemble(
    chunks: &Path,
    target: &Path,
    chunk_size: u64,
    count: u64,
    size_bytes: u64,
) -> Result<PathBuf, StoreError> {
    let mut writer = ChunkWriter::create(target, chunk_size)?;
    for sequence in 0..count {
        let data = std::fs::read(chunks.join(sequence.to_string()))?;
        writer.write_chunk(sequence, &data)?;
    }
    Ok(writer.finish(size_bytes)?)
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn load_sessions(dir: &Path) -> Result<HashMap<String, Session>, StoreError> {
    let mut sessions = HashMap::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let meta_path = entry.path().join(SESSION_FILE);
        let bytes = match tokio::fs::read(&meta_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %meta_path.display(), error = %e, "skipping session without metadata");
                continue;
            }
        };
        let mut session: Session = match serde_json::from_slice(&bytes) {
            Ok(session) => session,
            Err(e) => {
                warn!(path = %meta_path.display(), error = %e, "skipping unreadable session");
                continue;
            }
        };

        if session.status == SessionStatus::Uploading {
            scan_chunks(&entry.path().join("chunks"), &mut session).await?;
        }
        sessions.insert(session.slice_id.clone(), session);
    }
    Ok(sessions)
}

/// Rebuilds the stored chunk set and the last activity time from disk.
async fn scan_chunks(dir: &Path, session: &mut Session) -> Result<(), StoreError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(sequence) = name.to_str().and_then(|n| n.parse::<u64>().ok()) else {
            // Leftover temporary file from an interrupted write.
            let _ = tokio::fs::remove_file(entry.path()).await;
            continue;
        };
        if sequence >= session.chunk_count {
            continue;
        }
        session.uploaded.insert(sequence);
        if let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) {
            session.updated_at = session.updated_at.max(DateTime::<Utc>::from(modified));
        }
    }
    Ok(())
}

async fn dir_size(dir: &Path) -> u64 {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return 0;
    };
    let mut total = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Ok(meta) = entry.metadata().await {
            total += meta.len();
        }
    }
    total
}
