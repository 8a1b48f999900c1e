//! Chunked resumable upload state machine.
//!
//! Multi-phase upload platforms follow INIT → APPEND(chunk[i]) → FINALIZE →
//! POLL until ready. The machine is a plain value over a [`MediaTransport`]
//! so each adapter supplies only the wire calls and tests can script phases
//! deterministically. Polling uses capped exponential backoff (1 s start,
//! doubling to 30 s) with a 10-minute ceiling, after which the attempt fails
//! `UPLOAD_PROCESSING_TIMEOUT`.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::Clock;
use crate::error::{Error, ErrorKind, Result};
use crate::storage::ObjectStore;

/// Platform-agnostic chunk size; Twitter and the other chunked APIs accept
/// 5 MiB segments.
pub const CHUNK_SIZE: u64 = 5 * 1024 * 1024;

pub const POLL_INITIAL: Duration = Duration::from_secs(1);
pub const POLL_CAP: Duration = Duration::from_secs(30);
pub const POLL_CEILING: Duration = Duration::from_secs(600);

/// Processing state reported by the platform after FINALIZE.
#[derive(Debug, Clone)]
pub enum ProcessingState {
    Pending { check_after: Option<Duration> },
    Ready { url: Option<String> },
    Failed { message: String },
}

/// Wire calls for one platform's chunked upload endpoints.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Returns the platform's media id for the upload session.
    async fn init(&self, total_bytes: i64, media_type: &str) -> Result<String>;

    async fn append(&self, media_id: &str, segment_index: i64, chunk: Vec<u8>) -> Result<()>;

    async fn finalize(&self, media_id: &str) -> Result<()>;

    async fn status(&self, media_id: &str) -> Result<ProcessingState>;
}

pub struct ChunkedUploader {
    chunk_size: u64,
}

impl ChunkedUploader {
    pub fn new() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(chunk_size: u64) -> Self {
        Self { chunk_size }
    }

    /// Drive the full upload; returns the platform media id once the
    /// platform reports the media ready.
    pub async fn run(
        &self,
        transport: &dyn MediaTransport,
        store: &dyn ObjectStore,
        key: &str,
        total_bytes: i64,
        media_type: &str,
        clock: &dyn Clock,
    ) -> Result<String> {
        let media_id = transport.init(total_bytes, media_type).await?;

        let mut offset: u64 = 0;
        let mut segment: i64 = 0;
        while (offset as i64) < total_bytes {
            let chunk = store.read_range(key, offset, self.chunk_size).await?;
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len() as u64;
            transport.append(&media_id, segment, chunk).await?;
            segment += 1;
        }

        transport.finalize(&media_id).await?;
        poll_until_ready(clock, || transport.status(&media_id)).await?;
        Ok(media_id)
    }
}

impl Default for ChunkedUploader {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll a processing probe with capped exponential backoff until the
/// platform reports ready, failed, or the ceiling elapses.
pub async fn poll_until_ready<F, Fut>(clock: &dyn Clock, mut probe: F) -> Result<Option<String>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<ProcessingState>>,
{
    let deadline = clock.now_ms() + POLL_CEILING.as_millis() as i64;
    let mut delay = POLL_INITIAL;

    loop {
        match probe().await? {
            ProcessingState::Ready { url } => return Ok(url),
            ProcessingState::Failed { message } => {
                return Err(Error::new(ErrorKind::PlatformPermanent, message));
            }
            ProcessingState::Pending { check_after } => {
                if clock.now_ms() >= deadline {
                    return Err(Error::new(
                        ErrorKind::UploadProcessingTimeout,
                        "platform never reported the upload ready",
                    ));
                }
                let wait = check_after.unwrap_or(delay);
                clock.sleep(wait).await;
                delay = (delay * 2).min(POLL_CAP);
            }
        }
    }
}
