use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use super::ledger::LedgerError;
use super::record::Stage;

/// Machine-readable failure class reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    QuotaExceeded,
    RateLimited,
    Provider,
    Storage,
    MissingUpstreamArtifact,
    MuxingLaunch,
    MuxingFailure,
    AlreadyFinalized,
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("no creative found for {subject}/{campaign}")]
    NotFound { subject: String, campaign: String },

    #[error("{stage} limit of {max} reached for this campaign ({used} used)")]
    QuotaExceeded { stage: Stage, used: u32, max: u32 },

    #[error("too many {stage} requests; try again in {retry_after_secs}s")]
    RateLimited { stage: Stage, retry_after_secs: u64 },

    #[error("{provider} generation failed: {message}")]
    Provider {
        provider: &'static str,
        message: String,
    },

    /// Generation succeeded but its result could not be written or recorded.
    /// `orphaned` names an artifact left on disk without a ledger entry.
    #[error("storage failed after generation: {message}")]
    Storage {
        message: String,
        orphaned: Option<PathBuf>,
    },

    #[error("missing upstream {stage} artifact '{reference}'")]
    MissingUpstreamArtifact { stage: Stage, reference: String },

    #[error("could not launch muxing tool '{program}': {message}")]
    MuxingLaunch { program: String, message: String },

    #[error("muxing tool exited with {}: {}", exit_label(.code), .message)]
    MuxingFailure { code: Option<i32>, message: String },

    #[error("creative '{campaign}' is already finalized")]
    AlreadyFinalized { campaign: String },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "no exit code".to_string(),
    }
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Validation(_) => ErrorKind::Validation,
            StageError::NotFound { .. } => ErrorKind::NotFound,
            StageError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            StageError::RateLimited { .. } => ErrorKind::RateLimited,
            StageError::Provider { .. } => ErrorKind::Provider,
            StageError::Storage { .. } => ErrorKind::Storage,
            StageError::MissingUpstreamArtifact { .. } => ErrorKind::MissingUpstreamArtifact,
            StageError::MuxingLaunch { .. } => ErrorKind::MuxingLaunch,
            StageError::MuxingFailure { .. } => ErrorKind::MuxingFailure,
            StageError::AlreadyFinalized { .. } => ErrorKind::AlreadyFinalized,
        }
    }

    pub fn storage(message: impl Into<String>, orphaned: Option<PathBuf>) -> Self {
        StageError::Storage {
            message: message.into(),
            orphaned,
        }
    }

    /// Artifact left on disk without a ledger reference, if any.
    pub fn orphaned_artifact(&self) -> Option<&PathBuf> {
        match self {
            StageError::Storage { orphaned, .. } => orphaned.as_ref(),
            _ => None,
        }
    }

    /// Maps a ledger failure; `orphaned` is the artifact already written for
    /// this operation, if any.
    pub fn from_ledger(err: LedgerError, orphaned: Option<PathBuf>) -> Self {
        match err {
            LedgerError::NotFound { subject, campaign } => StageError::NotFound { subject, campaign },
            LedgerError::AlreadyFinalized { campaign } => StageError::AlreadyFinalized { campaign },
            LedgerError::QuotaExceeded { stage, used, max } => {
                StageError::QuotaExceeded { stage, used, max }
            }
            other => StageError::storage(format!("ledger update failed: {other}"), orphaned),
        }
    }
}
