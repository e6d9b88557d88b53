//! The typed error taxonomy the Ingest Coordinator's retry loop and
//! skip-missing check match on. Orchestration code above the coordinator
//! uses `anyhow::Result` and lets these convert via `?`.

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::hashing::Fingerprint;

#[derive(Debug, Error)]
pub enum IngestError {
    /// The source file vanished mid-scan or mid-read. Locally suppressed
    /// when the path matches the skip-missing pattern set and the feature
    /// flag is on; otherwise bubbles up.
    #[error("source file vanished: {0}")]
    SourceFileNotFound(Utf8PathBuf),

    /// Internal sentinel: size or hash disagreement during a single blob
    /// acquisition attempt. Always caught by the retry loop; never observed
    /// outside `ingest::task`.
    #[error("{path}: observed size/hash changed mid-ingest ({detail})")]
    BlobFileChanged { path: Utf8PathBuf, detail: String },

    /// Blob acquisition retries exhausted.
    #[error("{0}: file content kept changing during ingest; gave up after retries")]
    VolatileBlobFile(Utf8PathBuf),

    /// Neither a regular file, directory, nor symlink.
    #[error("{path}: unsupported file type (mode {mode:#o})")]
    UnsupportedFileFormat { path: Utf8PathBuf, mode: u32 },

    /// A symlink target was not valid UTF-8 — surfaced as an error rather
    /// than lossily converted.
    #[error("{0}: symlink target is not valid UTF-8")]
    NonUtf8SymlinkTarget(Utf8PathBuf),

    /// Any failure from the Catalog Session.
    #[error("catalog error: {0}")]
    CatalogError(#[from] rusqlite::Error),

    /// Unexpected I/O failure; logged with context by the caller, then
    /// bubbles up.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else (compressor setup, glob matching, etc.) that only
    /// needs to propagate with context, not be matched on.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IngestError {
    pub fn blob_file_changed(path: impl Into<Utf8PathBuf>, detail: impl Into<String>) -> Self {
        IngestError::BlobFileChanged {
            path: path.into(),
            detail: detail.into(),
        }
    }
}

/// What a dedup check or write-path verification expected vs. observed,
/// used to build a `BlobFileChanged` detail message.
#[derive(Debug)]
pub struct SizeHashExpectation {
    pub expected_size: u64,
    pub observed_size: u64,
    pub expected_hash: Option<Fingerprint>,
    pub observed_hash: Fingerprint,
}

impl std::fmt::Display for SizeHashExpectation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "expected size {} hash {:?}, observed size {} hash {}",
            self.expected_size, self.expected_hash, self.observed_size, self.observed_hash
        )
    }
}
