use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::TransferError;

/// One planned chunk: a contiguous `[start, end)` range of the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkDescriptor {
    /// 0-indexed position within the file.
    pub sequence: u64,
    pub start: u64,
    pub end: u64,
}

impl ChunkDescriptor {
    /// Number of bytes covered by this chunk.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Returns `true` for the single chunk of an empty file.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// Number of chunks for a file: `ceil(size / chunk_size)`, and 1 for an
/// empty file.
pub fn chunk_count(size_bytes: u64, chunk_size: u64) -> Result<u64, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::InvalidChunkSize);
    }
    if size_bytes == 0 {
        return Ok(1);
    }
    Ok(size_bytes.div_ceil(chunk_size))
}

/// Splits `size_bytes` into ordered chunks of `chunk_size` bytes.
///
/// The last chunk may be shorter. An empty file yields one zero-length
/// chunk so the server still records the upload.
pub fn plan(size_bytes: u64, chunk_size: u64) -> Result<Vec<ChunkDescriptor>, TransferError> {
    let count = chunk_count(size_bytes, chunk_size)?;
    let chunks = (0..count)
        .map(|sequence| {
            let start = sequence * chunk_size;
            let end = std::cmp::min(start + chunk_size, size_bytes);
            ChunkDescriptor {
                sequence,
                start,
                end,
            }
        })
        .collect();
    Ok(chunks)
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Reads planned chunks from a source file for transfer.
#[derive(Debug, Clone)]
pub struct ChunkReader {
    file_path: PathBuf,
    file_size: u64,
}

impl ChunkReader {
    /// Creates a reader for `path`, which must still be `file_size` bytes
    /// long whenever a chunk is read.
    pub fn new(path: &Path, file_size: u64) -> Self {
        Self {
            file_path: path.to_path_buf(),
            file_size,
        }
    }

    /// Reads the bytes of `chunk`.
    ///
    /// Fails with [`TransferError::SourceChanged`] if the file size differs
    /// from the size the chunk plan was built for.
    pub async fn read(&self, chunk: &ChunkDescriptor) -> Result<Vec<u8>, TransferError> {
        let mut file = tokio::fs::File::open(&self.file_path).await?;
        let actual = file.metadata().await?.len();
        if actual != self.file_size {
            return Err(TransferError::SourceChanged {
                expected: self.file_size,
                actual,
            });
        }

        let mut buf = vec![0u8; chunk.len() as usize];
        if !buf.is_empty() {
            file.seek(SeekFrom::Start(chunk.start)).await?;
            file.read_exact(&mut buf).await?;
        }
        Ok(buf)
    }
}

// ---------------------------------------------------------------------------
// ChunkWriter
// ---------------------------------------------------------------------------

/// Assembles received chunks into a target file by sequence.
///
/// Each chunk lands at `sequence * chunk_size`, so the arrival order does
/// not affect the result.
pub struct ChunkWriter {
    target: PathBuf,
    chunk_size: u64,
    file: std::fs::File,
}

impl ChunkWriter {
    /// Creates (or truncates) `target`, creating parent directories as needed.
    pub fn create(target: &Path, chunk_size: u64) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidChunkSize);
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(target)?;
        Ok(Self {
            target: target.to_path_buf(),
            chunk_size,
            file,
        })
    }

    /// Writes the bytes of chunk `sequence` at its offset.
    pub fn write_chunk(&mut self, sequence: u64, data: &[u8]) -> Result<(), TransferError> {
        if data.len() as u64 > self.chunk_size {
            return Err(TransferError::ChunkTooLarge {
                sequence,
                len: data.len() as u64,
                chunk_size: self.chunk_size,
            });
        }
        self.file
            .seek(SeekFrom::Start(sequence * self.chunk_size))?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// Flushes and truncates the file to `size_bytes`, returning its path.
    pub fn finish(mut self, size_bytes: u64) -> Result<PathBuf, TransferError> {
        self.file.flush()?;
        self.file.set_len(size_bytes)?;
        self.file.sync_all()?;
        Ok(self.target)
    }
}
