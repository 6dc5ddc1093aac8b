//! Plumbing shared by the generation stages: admission checks, provider
//! deadlines and the write-then-record step, which runs off the async
//! workers.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::time::timeout;

use super::artifacts::{ArtifactRef, ArtifactStore, unique_file_name};
use super::error::StageError;
use super::keyed_lock::KeyedLocks;
use super::ledger::{AttemptLedger, StageArtifact};
use super::quota::QuotaConfig;
use super::record::{AttemptRecord, CreativeKey, Stage};
use crate::ui::prelude::{Level, emit};

/// Collaborators every stage is constructed with.
#[derive(Clone)]
pub struct StageDeps {
    pub ledger: Arc<AttemptLedger>,
    pub artifacts: Arc<ArtifactStore>,
    pub locks: Arc<KeyedLocks>,
    pub quota: QuotaConfig,
}

/// A stored, recorded stage result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedArtifact {
    pub stage: Stage,
    pub reference: ArtifactRef,
    pub url: String,
    #[serde(skip)]
    pub record: AttemptRecord,
}

impl StageDeps {
    pub fn new(ledger: Arc<AttemptLedger>, artifacts: Arc<ArtifactStore>, quota: QuotaConfig) -> Self {
        Self {
            ledger,
            artifacts,
            locks: Arc::new(KeyedLocks::new()),
            quota,
        }
    }

    /// Rejects final records and exhausted stages before any external call.
    pub(crate) fn admit(&self, stage: Stage, record: &AttemptRecord) -> Result<(), StageError> {
        if record.is_final {
            return Err(StageError::AlreadyFinalized {
                campaign: record.campaign.clone(),
            });
        }
        if !self.quota.allows(stage, &record.stage_counts) {
            let max = self.quota.max_for(stage).unwrap_or_default();
            emit(
                Level::Warn,
                "creative.quota.exceeded",
                &format!(
                    "{} limit of {} reached for {}/{}",
                    stage, max, record.subject, record.campaign
                ),
                None,
            );
            return Err(StageError::QuotaExceeded {
                stage,
                used: record.stage_counts.get(stage),
                max,
            });
        }
        Ok(())
    }

    /// Writes provider output and records it. The counter only moves once
    /// both the file and the ledger row are persisted. Runs on the blocking
    /// pool and completes even if the caller stops waiting.
    pub(crate) async fn persist(
        &self,
        key: &CreativeKey,
        record_as: impl for<'a> Fn(&'a str) -> StageArtifact<'a> + Send + 'static,
        prompt: &str,
        prefix: &str,
        extension: &str,
        bytes: Vec<u8>,
    ) -> Result<GeneratedArtifact, StageError> {
        let deps = self.clone();
        let key = key.clone();
        let prompt = prompt.to_string();
        let file_name = unique_file_name(prefix, extension);
        blocking(move || deps.write_and_record(&key, record_as, &prompt, &file_name, &bytes)).await
    }

    fn write_and_record(
        &self,
        key: &CreativeKey,
        record_as: impl for<'a> Fn(&'a str) -> StageArtifact<'a>,
        prompt: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<GeneratedArtifact, StageError> {
        let stage = record_as("").stage();
        let reference = self
            .artifacts
            .put(stage, key, file_name, bytes)
            .map_err(|e| {
                StageError::storage(
                    format!(
                        "{stage} was generated but could not be written ({e}); the result is lost and unrecorded"
                    ),
                    None,
                )
            })?;

        let record = self
            .ledger
            .record_stage_success(
                key,
                record_as(reference.as_str()),
                prompt,
                self.quota.max_for(stage),
            )
            .map_err(|err| self.unrecorded(stage, &reference, err))?;

        emit(
            Level::Success,
            &format!("creative.{stage}.stored"),
            &format!("Stored {} for {} at {}", stage, key, reference),
            Some(json!({
                "reference": reference.as_str(),
                "attempts": record.stage_counts.get(stage),
            })),
        );

        Ok(GeneratedArtifact {
            stage,
            url: self.artifacts.public_url(&reference),
            reference,
            record,
        })
    }

    /// Maps a failed ledger update for an artifact already on disk.
    ///
    /// Rejections (quota, finalized) remove the artifact. Anything else
    /// leaves it orphaned and reports the path for reconciliation.
    pub(crate) fn unrecorded(
        &self,
        stage: Stage,
        reference: &ArtifactRef,
        err: super::ledger::LedgerError,
    ) -> StageError {
        let mapped = StageError::from_ledger(err, self.artifacts.resolve(reference.as_str()).ok());
        match &mapped {
            StageError::Storage { orphaned, .. } => {
                emit(
                    Level::Warn,
                    "creative.ledger.orphan",
                    &format!(
                        "{} artifact {} exists on disk but is not recorded: {}",
                        stage, reference, mapped
                    ),
                    Some(json!({
                        "stage": stage,
                        "orphaned": orphaned.as_ref().map(|p| p.display().to_string()),
                    })),
                );
            }
            _ => {
                if let Err(e) = self.artifacts.remove(reference) {
                    emit(
                        Level::Warn,
                        "creative.artifact.cleanup",
                        &format!("Failed to remove rejected artifact {}: {}", reference, e),
                        None,
                    );
                }
            }
        }
        mapped
    }
}

/// Runs a provider call under a deadline, mapping every failure to
/// [`StageError::Provider`].
pub(crate) async fn call_provider<T, F>(
    provider: &'static str,
    limit: Duration,
    call: F,
) -> Result<T, StageError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(StageError::Provider {
            provider,
            message: format!("{err:#}"),
        }),
        Err(_) => Err(StageError::Provider {
            provider,
            message: format!("no response within {}s", limit.as_secs()),
        }),
    }
}

/// Runs filesystem and ledger work on tokio's blocking pool.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T, StageError>
where
    F: FnOnce() -> Result<T, StageError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| StageError::storage(format!("storage task did not complete: {e}"), None))?
}

pub(crate) fn require_text(field: &str, value: &str) -> Result<(), StageError> {
    if value.trim().is_empty() {
        return Err(StageError::Validation(format!("{field} is required")));
    }
    Ok(())
}

