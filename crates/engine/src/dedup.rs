use sliceup_protocol::{CheckExistsRequest, FileRecord};
use tracing::{debug, warn};

use crate::config::DedupPolicy;
use crate::error::{ServerError, UploadError};
use crate::server::UploadServer;

/// Result of the dedup round-trip.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DedupOutcome {
    /// The server already stores this content.
    Duplicate(FileRecord),
    /// Upload the content.
    Proceed,
}

/// Asks the server whether `fingerprint` is already stored.
///
/// A failed check follows `policy`: fail-open proceeds with the upload,
/// fail-closed fails the task.
pub(crate) async fn check(
    server: &dyn UploadServer,
    policy: DedupPolicy,
    fingerprint: &str,
    file_name: &str,
    size_bytes: u64,
) -> Result<DedupOutcome, UploadError> {
    if policy == DedupPolicy::Disabled {
        return Ok(DedupOutcome::Proceed);
    }

    let request = CheckExistsRequest {
        fingerprint: fingerprint.to_string(),
        file_name: file_name.to_string(),
    };
    match server.check_exists(request).await {
        Ok(resp) if resp.exists => {
            debug!(fingerprint, "content already stored");
            // Some servers answer `exists` without the record.
            let record = resp.file_record.unwrap_or_else(|| FileRecord {
                file_id: String::new(),
                fingerprint: fingerprint.to_string(),
                file_name: file_name.to_string(),
                size_bytes,
                path: String::new(),
                created_at: None,
            });
            Ok(DedupOutcome::Duplicate(record))
        }
        Ok(_) => Ok(DedupOutcome::Proceed),
        Err(ServerError::Cancelled) => Err(UploadError::Cancelled),
        Err(e) if policy == DedupPolicy::FailOpen => {
            warn!(fingerprint, error = %e, "dedup check failed, uploading anyway");
            Ok(DedupOutcome::Proceed)
        }
        Err(e) => Err(UploadError::DedupCheckFailure(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Call, MockServer, record_for};
    use sliceup_protocol::CheckExistsResponse;

    fn failing_server() -> MockServer {
        let server = MockServer::new();
        *server.existing.lock().unwrap() = Some(Err(ServerError::Status {
            status: 503,
            message: "down".into(),
        }));
        server
    }

    #[tokio::test]
    async fn duplicate_returns_record() {
        let server = MockServer::new();
        server.set_existing(record_for("abc", "a.bin", 3));

        let outcome = check(&server, DedupPolicy::FailOpen, "abc", "a.bin", 3)
            .await
            .unwrap();
        assert_eq!(outcome, DedupOutcome::Duplicate(record_for("abc", "a.bin", 3)));
    }

    #[tokio::test]
    async fn exists_without_record_synthesizes_one() {
        let server = MockServer::new();
        *server.existing.lock().unwrap() = Some(Ok(CheckExistsResponse {
            exists: true,
            file_record: None,
        }));

        match check(&server, DedupPolicy::FailOpen, "abc", "a.bin", 3).await {
            Ok(DedupOutcome::Duplicate(record)) => {
                assert_eq!(record.fingerprint, "abc");
                assert_eq!(record.size_bytes, 3);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn disabled_skips_round_trip() {
        let server = MockServer::new();
        let outcome = check(&server, DedupPolicy::Disabled, "abc", "a.bin", 3)
            .await
            .unwrap();
        assert_eq!(outcome, DedupOutcome::Proceed);
        assert!(server.calls().is_empty());
    }

    #[tokio::test]
    async fn fail_open_proceeds() {
        let server = failing_server();
        let outcome = check(&server, DedupPolicy::FailOpen, "abc", "a.bin", 3)
            .await
            .unwrap();
        assert_eq!(outcome, DedupOutcome::Proceed);
        assert_eq!(server.calls(), vec![Call::CheckExists("abc".into())]);
    }

    #[tokio::test]
    async fn fail_closed_fails() {
        let server = failing_server();
        let result = check(&server, DedupPolicy::FailClosed, "abc", "a.bin", 3).await;
        assert!(matches!(result, Err(UploadError::DedupCheckFailure(_))));
    }
}
