use std::path::{Component, Path};

use crate::TransferError;

/// Maximum length of a file name in bytes.
const MAX_FILE_NAME_LEN: usize = 255;

/// Validates a client-supplied file name before it is used on disk.
///
/// The name must be a single normal path component: no separators, no
/// `.`/`..`, no drive prefixes, no NUL bytes and at most 255 bytes.
pub fn validate_file_name(name: &str) -> Result<(), TransferError> {
    if name.trim().is_empty() {
        return Err(TransferError::InvalidPath("empty file name".into()));
    }
    if name.len() > MAX_FILE_NAME_LEN {
        return Err(TransferError::InvalidPath(format!(
            "file name longer than {MAX_FILE_NAME_LEN} bytes"
        )));
    }
    if name.contains('\0') {
        return Err(TransferError::InvalidPath("file name contains NUL".into()));
    }
    // Backslash separates on Windows; reject it everywhere so stored names
    // mean the same thing on every platform.
    if name.contains('/') || name.contains('\\') {
        return Err(TransferError::InvalidPath(format!(
            "file name contains a path separator: {name}"
        )));
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(TransferError::InvalidPath(format!(
            "not a plain file name: {name}"
        ))),
    }
}
