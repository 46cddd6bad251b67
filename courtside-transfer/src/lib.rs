//! Chapter transfer engine: moves chapter bytes from a camera's range-serving
//! HTTP endpoint into object storage.
//!
//! Two paths satisfy the same contract: a disk-staged path (download with
//! resume to scratch storage, then multipart upload) and a streaming path
//! (camera bytes accumulated into ~25 MiB parts and dispatched straight to
//! the multipart upload). Guarantees either way: interrupted transfers leave
//! resumable partial state, completed transfers match the advertised size
//! when it is known, and a camera never serves more than one transfer at a
//! time.

use std::time::Duration;

use courtside_types::SegmentSession;

pub mod engine;
pub mod source;
pub mod store;

pub use engine::{TransferEngine, TransferOutcome, TransferPath};
pub use source::{CameraChapterSource, ChapterSource, OpenOutcome};
pub use store::{ChapterStore, S3ChapterStore, StoreError};

/// Multipart part size; every part except the final one is at least this big.
pub const PART_SIZE: usize = 25 * 1024 * 1024;
/// Read chunk size, small enough that a stall trips the read timeout quickly.
pub const CHUNK_SIZE: usize = 256 * 1024;
/// Maximum delay between retry attempts.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("http error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },
    #[error("camera returned {status} for {url}")]
    UnexpectedStatus {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("no bytes received within the read timeout")]
    ReadStall,
    #[error("object store error: {source}")]
    Store {
        #[from]
        source: StoreError,
    },
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("transfer of {filename} failed after {attempts} attempts: {last}")]
    Exhausted {
        filename: String,
        attempts: u32,
        last: String,
    },
    #[error("no data received for {filename}")]
    EmptyTransfer { filename: String },
}

/// Transfer tuning; see the configuration crate for the operator-facing
/// knobs these come from.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub part_size: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_retries: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            chunk_size: CHUNK_SIZE,
            part_size: PART_SIZE,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            max_retries: 20,
        }
    }
}

/// Object-key prefix under which a session's raw chapters live.
pub fn raw_chapter_prefix(session: &SegmentSession) -> String {
    format!("raw-chapters/{session}/")
}

/// Deterministic object key for one raw chapter: a dense 1-based 3-digit
/// index in chapter sort order, then the original filename.
pub fn chapter_object_key(session: &SegmentSession, index: usize, filename: &str) -> String {
    format!("raw-chapters/{session}/chapter_{index:03}_{filename}")
}

/// Exponential backoff delay for a 0-based attempt number, capped.
pub fn backoff_delay(attempt: u32) -> Duration {
    let secs = 1u64 << attempt.min(5);
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chapter_keys_are_dense_and_three_digit() {
        let session = SegmentSession::from_raw("enxd43260ddac87_FL_20260120_195030");
        assert_eq!(
            chapter_object_key(&session, 1, "GX018471.MP4"),
            "raw-chapters/enxd43260ddac87_FL_20260120_195030/chapter_001_GX018471.MP4"
        );
        assert_eq!(
            chapter_object_key(&session, 12, "GX128471.MP4"),
            "raw-chapters/enxd43260ddac87_FL_20260120_195030/chapter_012_GX128471.MP4"
        );
        assert!(chapter_object_key(&session, 100, "a.MP4").contains("chapter_100_"));
        assert_eq!(
            raw_chapter_prefix(&session),
            "raw-chapters/enxd43260ddac87_FL_20260120_195030/"
        );
    }

    #[test]
    fn backoff_caps_at_thirty_seconds() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(4), Duration::from_secs(16));
        assert_eq!(backoff_delay(5), Duration::from_secs(30));
        assert_eq!(backoff_delay(19), Duration::from_secs(30));
    }
}
