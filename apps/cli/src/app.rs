//! Command implementations, wired to an HTTP server or a local chunk store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use sliceup_engine::{EngineConfig, ResumeState, TaskId, UploadEngine, UploadRequest, UploadServer};
use sliceup_http::HttpUploadServer;
use sliceup_protocol::{MergeRequest, TaskStatus, UploadStatusResponse};
use sliceup_store::{ChunkStore, CleanupReport};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;

/// Where uploads go.
pub enum Target {
    Http(Arc<HttpUploadServer>),
    Local(Arc<ChunkStore>),
}

/// Target selection from the command line. Flags win over the config file.
#[derive(Debug, Clone, Default)]
pub struct TargetOptions {
    pub server: Option<String>,
    pub local_dir: Option<PathBuf>,
    pub headers: Vec<(String, String)>,
}

impl Target {
    pub async fn open(options: &TargetOptions, config: &Config) -> anyhow::Result<Self> {
        if let Some(url) = &options.server {
            return Self::http(url, options, config);
        }
        if let Some(dir) = &options.local_dir {
            return Self::local(dir).await;
        }
        if let Some(url) = &config.server {
            return Self::http(url, options, config);
        }
        if let Some(dir) = &config.local_dir {
            return Self::local(dir).await;
        }
        bail!("no upload target: pass --server or --local-dir, or set one in the config file")
    }

    fn http(url: &str, options: &TargetOptions, config: &Config) -> anyhow::Result<Self> {
        let mut http = config.http.to_http_config(url);
        for (name, value) in &options.headers {
            http = http.with_header(name, value);
        }
        let server = HttpUploadServer::new(http).context("configuring HTTP client")?;
        tracing::debug!(url, "uploading over HTTP");
        Ok(Self::Http(Arc::new(server)))
    }

    async fn local(dir: &Path) -> anyhow::Result<Self> {
        let store = ChunkStore::open(dir)
            .await
            .with_context(|| format!("opening chunk store {}", dir.display()))?;
        tracing::debug!(dir = %dir.display(), "uploading into local chunk store");
        Ok(Self::Local(Arc::new(store)))
    }

    pub fn server(&self) -> Arc<dyn UploadServer> {
        match self {
            Self::Http(s) => s.clone(),
            Self::Local(s) => s.clone(),
        }
    }
}

/// One finished task, as reported to the user.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub file_name: String,
    pub status: TaskStatus,
    pub detail: String,
}

/// Uploads `files` and waits until every task settles or Ctrl-C.
pub async fn upload(
    target: &Target,
    config: EngineConfig,
    files: &[PathBuf],
    show_progress: bool,
) -> anyhow::Result<Vec<Outcome>> {
    let engine = UploadEngine::new(config, target.server())?;
    let progress = show_progress.then(|| spawn_progress(&engine));

    let requests = files.iter().map(UploadRequest::new).collect();
    let ids = engine.enqueue(requests)?;
    tracing::info!(files = ids.len(), "upload started");

    finish(engine, ids, progress).await
}

/// Continues an upload from a known fingerprint and session.
pub async fn resume(
    target: &Target,
    config: EngineConfig,
    file: &Path,
    state: ResumeState,
    show_progress: bool,
) -> anyhow::Result<Vec<Outcome>> {
    let engine = UploadEngine::new(config, target.server())?;
    let progress = show_progress.then(|| spawn_progress(&engine));

    let slice = state.slice_id.clone();
    let id = engine.resume(UploadRequest::new(file), state)?;
    tracing::info!(task = %id, slice = %slice, "resuming upload");

    finish(engine, vec![id], progress).await
}

async fn finish(
    engine: UploadEngine,
    ids: Vec<TaskId>,
    progress: Option<JoinHandle<()>>,
) -> anyhow::Result<Vec<Outcome>> {
    tokio::select! {
        _ = engine.wait_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            let cancelled = engine.cancel_all();
            tracing::warn!(cancelled, "interrupted, cancelling uploads");
            engine.wait_idle().await;
        }
    }
    if let Some(handle) = progress {
        handle.abort();
    }

    Ok(ids
        .iter()
        .filter_map(|id| engine.task(id))
        .map(|task| {
            let detail = match task.status {
                TaskStatus::Completed => task.file_record.map(|r| r.path).unwrap_or_default(),
                TaskStatus::AwaitingMerge => format!(
                    "slice {} fingerprint {}",
                    task.slice_id.as_deref().unwrap_or_default(),
                    task.fingerprint.as_deref().unwrap_or_default()
                ),
                _ => task.error.unwrap_or_default(),
            };
            Outcome {
                file_name: task.name,
                status: task.status,
                detail,
            }
        })
        .collect())
}

/// Prints one line per status or message change.
fn spawn_progress(engine: &UploadEngine) -> JoinHandle<()> {
    let mut rx = engine.subscribe();
    tokio::spawn(async move {
        let mut last: HashMap<String, (TaskStatus, String)> = HashMap::new();
        loop {
            match rx.recv().await {
                Ok(sliceup_engine::StatusEvent::Updated(entry)) => {
                    let key = (entry.lifecycle_status, entry.status_message.clone());
                    if last.get(&entry.task_id) == Some(&key) {
                        continue;
                    }
                    last.insert(entry.task_id.clone(), key);
                    println!(
                        "{:<14} {:>5.1}%  {}  {}",
                        entry.lifecycle_status.to_string(),
                        entry.progress_percent,
                        entry.file_name,
                        entry.status_message
                    );
                }
                Ok(sliceup_engine::StatusEvent::Removed(_)) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "progress output fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Server view of one session.
pub async fn status(target: &Target, slice_id: &str) -> anyhow::Result<UploadStatusResponse> {
    Ok(target.server().upload_status(slice_id.to_string()).await?)
}

/// Merges a session whose chunks are all uploaded.
pub async fn merge(
    target: &Target,
    file: &Path,
    chunk_size: u64,
    state: ResumeState,
) -> anyhow::Result<sliceup_protocol::FileRecord> {
    let meta = tokio::fs::metadata(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", file.display()))?;
    let chunk_count = sliceup_transfer::chunk_count(meta.len(), chunk_size)?;

    let response = target
        .server()
        .merge_chunks(MergeRequest {
            slice_id: state.slice_id,
            fingerprint: state.fingerprint,
            chunk_count,
            file_name,
            file_size: meta.len(),
        })
        .await?;
    Ok(response.file_record)
}

/// Removes stale sessions from a local chunk store.
pub async fn clean(target: &Target, older_than: Duration) -> anyhow::Result<CleanupReport> {
    let Target::Local(store) = target else {
        bail!("clean only works on a local chunk store (--local-dir)");
    };
    Ok(store.cleanup_expired(older_than).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sliceup_engine::MergeMode;
    use sliceup_protocol::SessionStatus;

    fn local(dir: &Path) -> TargetOptions {
        TargetOptions {
            local_dir: Some(dir.to_path_buf()),
            ..Default::default()
        }
    }

    fn engine_config(merge_mode: MergeMode) -> EngineConfig {
        EngineConfig {
            chunk_size: 16,
            merge_mode,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn missing_target_is_an_error() {
        let err = Target::open(&TargetOptions::default(), &Config::default())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("no upload target"));
    }

    #[tokio::test]
    async fn flags_override_config() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            server: Some("http://127.0.0.1:9".into()),
            ..Default::default()
        };
        let target = Target::open(&local(tmp.path()), &config).await.unwrap();
        assert!(matches!(target, Target::Local(_)));

        let target = Target::open(&TargetOptions::default(), &config).await.unwrap();
        assert!(matches!(target, Target::Http(_)));
    }

    #[tokio::test]
    async fn bad_server_url_is_reported() {
        let options = TargetOptions {
            server: Some("not a url".into()),
            ..Default::default()
        };
        assert!(Target::open(&options, &Config::default()).await.is_err());
    }

    #[tokio::test]
    async fn upload_into_local_store() {
        let src = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let file = src.path().join("notes.txt");
        std::fs::write(&file, b"hello chunked world, forty bytes long!!").unwrap();

        let target = Target::open(&local(root.path()), &Config::default()).await.unwrap();
        let outcomes = upload(&target, engine_config(MergeMode::Automatic), &[file.clone()], false)
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, TaskStatus::Completed);
        assert_eq!(
            std::fs::read(&outcomes[0].detail).unwrap(),
            std::fs::read(&file).unwrap()
        );
    }

    #[tokio::test]
    async fn manual_merge_then_status_and_merge() {
        let src = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let file = src.path().join("data.bin");
        std::fs::write(&file, vec![7u8; 50]).unwrap();

        let target = Target::open(&local(root.path()), &Config::default()).await.unwrap();
        let engine = UploadEngine::new(engine_config(MergeMode::Manual), target.server()).unwrap();
        let id = engine.enqueue(vec![UploadRequest::new(&file)]).unwrap().remove(0);
        engine.wait_idle().await;
        let state = engine.task(&id).unwrap().resume_state().unwrap();

        let session = status(&target, &state.slice_id).await.unwrap();
        assert_eq!(session.chunk_total, 4);
        assert_eq!(session.chunk_uploaded, 4);
        assert_eq!(session.status, SessionStatus::Uploading);

        let record = merge(&target, &file, 16, state.clone()).await.unwrap();
        assert_eq!(std::fs::read(&record.path).unwrap(), vec![7u8; 50]);
        let session = status(&target, &state.slice_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Merged);
    }

    #[tokio::test]
    async fn resume_completes_upload() {
        let src = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let file = src.path().join("data.bin");
        std::fs::write(&file, vec![3u8; 40]).unwrap();

        let target = Target::open(&local(root.path()), &Config::default()).await.unwrap();
        let outcomes = upload(&target, engine_config(MergeMode::Manual), &[file.clone()], false)
            .await
            .unwrap();
        assert_eq!(outcomes[0].status, TaskStatus::AwaitingMerge);
        assert!(outcomes[0].detail.starts_with("slice "));

        let Target::Local(store) = &target else {
            unreachable!()
        };
        let slice = store.session_ids().remove(0);
        let fingerprint = sliceup_transfer::checksum_bytes(&[3u8; 40]);
        let outcomes = resume(
            &target,
            engine_config(MergeMode::Automatic),
            &file,
            ResumeState {
                fingerprint,
                slice_id: slice,
            },
            false,
        )
        .await
        .unwrap();
        assert_eq!(outcomes[0].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn clean_requires_local_store() {
        let target = Target::open(
            &TargetOptions {
                server: Some("http://127.0.0.1:9".into()),
                ..Default::default()
            },
            &Config::default(),
        )
        .await
        .unwrap();
        assert!(clean(&target, Duration::from_secs(3600)).await.is_err());
    }

    #[tokio::test]
    async fn clean_removes_stale_sessions() {
        let src = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let file = src.path().join("data.bin");
        std::fs::write(&file, vec![1u8; 20]).unwrap();

        let target = Target::open(&local(root.path()), &Config::default()).await.unwrap();
        upload(&target, engine_config(MergeMode::Manual), &[file], false)
            .await
            .unwrap();

        let report = clean(&target, Duration::ZERO).await.unwrap();
        assert_eq!(report.sessions_removed, 1);
    }
}
