//! Error taxonomy shared by every core operation.

use thiserror::Error;

use crate::hashing::ContentHash;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid specification: {0}")]
    InvalidSpecification(String),

    #[error("Unknown shot: {0}")]
    UnknownShot(String),

    #[error("Version {version} not found for shot {shot_id}")]
    VersionNotFound { shot_id: String, version: u32 },

    #[error("Patch conflict: {0}")]
    PatchConflict(String),

    #[error("Shot {shot_id} is already at version {version} with hash {hash}")]
    DuplicateVersion {
        shot_id: String,
        version: u32,
        hash: ContentHash,
    },

    #[error("Stale base version {expected} for shot {shot_id}, current is {current}")]
    StaleVersion {
        shot_id: String,
        expected: u32,
        current: u32,
    },

    #[error("Render failed for {hash}: {message}")]
    RenderFailure { hash: ContentHash, message: String },

    #[error("Scheduler fault: {0}")]
    SchedulerFault(String),

    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Idempotent re-submissions are reported, not recovered from.
    pub fn is_informational(&self) -> bool {
        matches!(self, CoreError::DuplicateVersion { .. })
    }
}
