//! Persistence for job state, per spec.md's three logical keys:
//! `jobs/{jobId}/state` (without token), `jobs/{jobId}/token`, and
//! `jobs/{jobId}/alarm`.
//!
//! Writes are issued `state` first, then `token`: on recovery a missing
//! token file is reconciled as "no active stream".

use std::path::PathBuf;

use async_trait::async_trait;
use book_core::{JobState, TokenEnvelope};
use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error persisting job {job_id}: {source}")]
    Io {
        job_id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error persisting job {job_id}: {source}")]
    Serde {
        job_id: String,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn save_state(&self, job: &JobState) -> Result<(), StoreError>;
    async fn load_state(&self, job_id: &str) -> Result<Option<JobState>, StoreError>;
    async fn save_token(&self, job_id: &str, token: &TokenEnvelope) -> Result<(), StoreError>;
    async fn load_token(&self, job_id: &str) -> Result<Option<TokenEnvelope>, StoreError>;
    async fn save_alarm(&self, job_id: &str, fires_at: DateTime<Utc>) -> Result<(), StoreError>;
    async fn load_alarm(&self, job_id: &str) -> Result<Option<DateTime<Utc>>, StoreError>;
    async fn delete(&self, job_id: &str) -> Result<(), StoreError>;
}

/// A `tokio::fs`-backed store rooted at a directory, one subdirectory per
/// job.
pub struct FileJobStore {
    root: PathBuf,
}

impl FileJobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root.join("jobs").join(job_id)
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn save_state(&self, job: &JobState) -> Result<(), StoreError> {
        let dir = self.job_dir(&job.job_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| StoreError::Io { job_id: job.job_id.clone(), source })?;

        // Persist state without token fields, per the atomicity note: the
        // two files are two independent sources of truth.
        let mut stateless = job.clone();
        stateless.auth_token = None;
        stateless.auth_token_expires_at = None;

        let json = serde_json::to_vec_pretty(&stateless)
            .map_err(|source| StoreError::Serde { job_id: job.job_id.clone(), source })?;
        tokio::fs::write(dir.join("state.json"), json)
            .await
            .map_err(|source| StoreError::Io { job_id: job.job_id.clone(), source })
    }

    async fn load_state(&self, job_id: &str) -> Result<Option<JobState>, StoreError> {
        let path = self.job_dir(job_id).join("state.json");
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| StoreError::Serde { job_id: job_id.to_string(), source }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { job_id: job_id.to_string(), source }),
        }
    }

    async fn save_token(&self, job_id: &str, token: &TokenEnvelope) -> Result<(), StoreError> {
        let dir = self.job_dir(job_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| StoreError::Io { job_id: job_id.to_string(), source })?;
        let json = serde_json::to_vec_pretty(token)
            .map_err(|source| StoreError::Serde { job_id: job_id.to_string(), source })?;
        tokio::fs::write(dir.join("token.json"), json)
            .await
            .map_err(|source| StoreError::Io { job_id: job_id.to_string(), source })
    }

    async fn load_token(&self, job_id: &str) -> Result<Option<TokenEnvelope>, StoreError> {
        let path = self.job_dir(job_id).join("token.json");
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| StoreError::Serde { job_id: job_id.to_string(), source }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { job_id: job_id.to_string(), source }),
        }
    }

    async fn save_alarm(&self, job_id: &str, fires_at: DateTime<Utc>) -> Result<(), StoreError> {
        let dir = self.job_dir(job_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| StoreError::Io { job_id: job_id.to_string(), source })?;
        tokio::fs::write(dir.join("alarm.json"), fires_at.to_rfc3339())
            .await
            .map_err(|source| StoreError::Io { job_id: job_id.to_string(), source })
    }

    async fn load_alarm(&self, job_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let path = self.job_dir(job_id).join("alarm.json");
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => DateTime::parse_from_rfc3339(text.trim())
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(|_| StoreError::Serde {
                    job_id: job_id.to_string(),
                    source: serde_json::Error::io(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "malformed alarm timestamp",
                    )),
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { job_id: job_id.to_string(), source }),
        }
    }

    async fn delete(&self, job_id: &str) -> Result<(), StoreError> {
        let dir = self.job_dir(job_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { job_id: job_id.to_string(), source }),
        }
    }
}
