//! Hashing and transfer helpers used by asset deployment.
//!
//! - `digest`: streaming SHA-256 of a file, base64 encoded
//! - `download`: streaming HTTP download with throttled progress logging
//! - [`available_space`]: free bytes on the filesystem holding a path

mod digest;
mod download;

use std::io;
use std::path::Path;

use thiserror::Error;

pub use digest::sha256_base64;
pub use download::{
    Downloader, Progress, ProgressSnapshot, DEFAULT_PROGRESS_INTERVAL, DEFAULT_READ_TIMEOUT,
};

/// Errors from transfer operations.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Unexpected HTTP status {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Download truncated: expected {expected} bytes, received {received}")]
    Truncated { expected: u64, received: u64 },
}

/// Free bytes available to unprivileged users on the filesystem of `path`.
pub fn available_space(path: &Path) -> io::Result<u64> {
    fs2::available_space(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_space_of_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(available_space(dir.path()).unwrap() > 0);
    }

    #[test]
    fn test_available_space_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        assert!(available_space(&dir.path().join("nope")).is_err());
    }
}
