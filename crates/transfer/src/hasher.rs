use std::path::Path;

use md5::{Digest, Md5};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{DEFAULT_HASH_BATCH_SIZE, TransferError};

/// Hashing progress reported after every batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashProgress {
    pub bytes_read: u64,
    pub total_bytes: u64,
}

impl HashProgress {
    /// Fraction of the input consumed so far, in `[0.0, 1.0]`.
    ///
    /// An empty input counts as fully read.
    pub fn ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        (self.bytes_read as f64 / self.total_bytes as f64).min(1.0)
    }
}

/// Computes MD5 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Checks `data` against the hex MD5 `expected` for chunk `sequence`.
///
/// An empty `expected` skips verification.
pub fn verify_checksum(sequence: u64, data: &[u8], expected: &str) -> Result<(), TransferError> {
    if expected.is_empty() || checksum_bytes(data).eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(TransferError::ChecksumMismatch { sequence })
    }
}

/// Computes the content fingerprint of a file.
///
/// The file is read in sequential batches of `batch_size` bytes (0 selects
/// [`DEFAULT_HASH_BATCH_SIZE`]); only one batch is resident at a time.
/// `on_progress` runs after every batch and the task yields to the runtime
/// between batches.
pub async fn digest_file<F>(
    path: &Path,
    batch_size: usize,
    on_progress: F,
) -> Result<String, TransferError>
where
    F: FnMut(HashProgress),
{
    let file = tokio::fs::File::open(path).await?;
    let total_bytes = file.metadata().await?.len();
    digest_reader(file, total_bytes, batch_size, on_progress).await
}

/// Streams `reader` through MD5. See [`digest_file`].
///
/// Any read error aborts the digest; no partial fingerprint is returned.
/// Reading a different number of bytes than `total_bytes` is reported as
/// [`TransferError::SourceChanged`].
pub async fn digest_reader<R, F>(
    mut reader: R,
    total_bytes: u64,
    batch_size: usize,
    mut on_progress: F,
) -> Result<String, TransferError>
where
    R: AsyncRead + Unpin,
    F: FnMut(HashProgress),
{
    let batch_size = if batch_size == 0 {
        DEFAULT_HASH_BATCH_SIZE
    } else {
        batch_size
    };

    let mut hasher = Md5::new();
    let mut buf = vec![0u8; batch_size];
    let mut bytes_read: u64 = 0;

    on_progress(HashProgress {
        bytes_read,
        total_bytes,
    });

    loop {
        let n = fill_batch(&mut reader, &mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        bytes_read += n as u64;
        on_progress(HashProgress {
            bytes_read,
            total_bytes,
        });
        if n < buf.len() {
            break;
        }
        tokio::task::yield_now().await;
    }

    if bytes_read != total_bytes {
        return Err(TransferError::SourceChanged {
            expected: total_bytes,
            actual: bytes_read,
        });
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Reads until `buf` is full or EOF. Returns the number of bytes read.
async fn fill_batch<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<usize, TransferError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
