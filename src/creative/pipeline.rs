//! End-to-end composite ad generation: image, then voice, then video.
//!
//! The pipeline only sequences the stages. Every stage validates, admits,
//! persists and records on its own, so a failure anywhere leaves the ledger
//! exactly as the last successful stage left it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use super::artifacts::{ArtifactRef, ArtifactStore};
use super::compose::{ComposeRequest, Composer};
use super::error::{ErrorKind, StageError};
use super::image::{ImageGenerator, ImageRequest};
use super::ledger::{AttemptLedger, FinalizeOutcome};
use super::mux::{FfmpegMuxer, Muxer};
use super::providers::{
    ElevenLabsSpeechProvider, ImageProvider, OpenAiImageProvider, SpeechProvider,
};
use super::quota::QuotaConfig;
use super::rate_limit::RateLimiter;
use super::record::{CreativeKey, CreativeKind, Stage, StageCounts, normalize_subject};
use super::segment::Segment;
use super::stage::{StageDeps, require_text};
use super::voice::{VoiceGenerator, VoiceRequest};
use crate::common::config::AppConfig;
use crate::ui::prelude::{Level, emit};

#[derive(Debug, Clone)]
pub struct CompositeRequest {
    pub subject: String,
    pub campaign: String,
    pub prompt: String,
    pub image_style: Option<String>,
    pub voice_style: Option<String>,
    pub kind: CreativeKind,
}

/// Step of a pipeline run a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    /// Checks before any stage ran: input validation, throttling and
    /// finalization state.
    Request,
    Image,
    Voice,
    Video,
}

impl From<Stage> for PipelineStage {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Image => PipelineStage::Image,
            Stage::Voice => PipelineStage::Voice,
            Stage::Video => PipelineStage::Video,
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineStage::Request => "request",
            PipelineStage::Image => "image",
            PipelineStage::Voice => "voice",
            PipelineStage::Video => "video",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
#[error("{failed_stage} stage failed: {error}")]
pub struct PipelineFailure {
    pub failed_stage: PipelineStage,
    #[source]
    pub error: StageError,
}

impl PipelineFailure {
    pub fn at(failed_stage: impl Into<PipelineStage>, error: StageError) -> Self {
        Self {
            failed_stage: failed_stage.into(),
            error,
        }
    }

    pub fn report(&self) -> FailureReport {
        FailureReport {
            failed_stage: self.failed_stage,
            error_kind: self.error.kind(),
            message: self.error.to_string(),
            orphaned_artifact: self.error.orphaned_artifact().cloned(),
        }
    }
}

/// Structured failure returned to the caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    pub failed_stage: PipelineStage,
    pub error_kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orphaned_artifact: Option<PathBuf>,
}

/// Structured success of a full pipeline run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeAd {
    pub subject: String,
    pub campaign: String,
    pub image_ref: ArtifactRef,
    pub image_url: String,
    pub audio_ref: ArtifactRef,
    pub audio_url: String,
    pub video_ref: ArtifactRef,
    pub video_url: String,
    pub sync_map: Vec<Segment>,
    pub total_attempts: u32,
    pub stage_counts: StageCounts,
}

/// Outcome of a finalize request as reported to callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeReport {
    pub is_final: bool,
    pub finalized_at: Option<DateTime<Utc>>,
    /// True when the record was already final and nothing changed.
    pub conflict: bool,
}

pub struct Pipeline {
    deps: StageDeps,
    image: ImageGenerator,
    voice: VoiceGenerator,
    composer: Composer,
    limiter: Option<RateLimiter>,
}

impl Pipeline {
    pub fn new(
        deps: StageDeps,
        image_provider: Arc<dyn ImageProvider>,
        speech_provider: Arc<dyn SpeechProvider>,
        muxer: Arc<dyn Muxer>,
        provider_timeout: Duration,
    ) -> Self {
        Self {
            image: ImageGenerator::new(deps.clone(), image_provider, provider_timeout),
            voice: VoiceGenerator::new(deps.clone(), speech_provider, provider_timeout),
            composer: Composer::new(deps.clone(), muxer),
            deps,
            limiter: None,
        }
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Wires the production providers, ledger and store from configuration.
    pub fn from_config(config: &AppConfig, verbose: bool) -> Result<Self> {
        let ledger = AttemptLedger::open(&config.database_path).with_context(|| {
            format!("opening attempt ledger at {}", config.database_path.display())
        })?;
        let artifacts = ArtifactStore::new(config.output_dir.clone(), config.public_base_url.clone());
        let deps = StageDeps::new(Arc::new(ledger), Arc::new(artifacts), config.quota.clone());

        let provider_timeout = Duration::from_secs(config.provider_timeout_secs.max(1));
        let client = Client::builder()
            .timeout(provider_timeout)
            .build()
            .context("building HTTP client")?;

        let muxer = FfmpegMuxer::new(
            config.ffmpeg.path.clone(),
            Duration::from_secs(config.ffmpeg.timeout_secs.max(1)),
            verbose,
        );

        let mut pipeline = Self::new(
            deps,
            Arc::new(OpenAiImageProvider::new(client.clone(), config.openai.clone())),
            Arc::new(ElevenLabsSpeechProvider::new(client, config.elevenlabs.clone())),
            Arc::new(muxer),
            provider_timeout,
        );
        if config.rate_limit.enabled {
            pipeline = pipeline
                .with_rate_limiter(RateLimiter::new(&config.rate_limit, config.quota.clone()));
        }
        Ok(pipeline)
    }

    pub fn ledger(&self) -> &AttemptLedger {
        &self.deps.ledger
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.deps.artifacts
    }

    pub fn quota(&self) -> &QuotaConfig {
        &self.deps.quota
    }

    pub fn image(&self) -> &ImageGenerator {
        &self.image
    }

    pub fn voice(&self) -> &VoiceGenerator {
        &self.voice
    }

    pub fn composer(&self) -> &Composer {
        &self.composer
    }

    /// Applies the burst throttle, when configured, to one stage request.
    pub async fn throttle(&self, subject: &str, stage: Stage) -> Result<(), StageError> {
        match &self.limiter {
            Some(limiter) => {
                let key_subject = normalize_subject(subject);
                limiter.check(&key_subject, stage).await
            }
            None => Ok(()),
        }
    }

    pub async fn generate(&self, request: &CompositeRequest) -> Result<CompositeAd, PipelineFailure> {
        let key = self
            .validate(request)
            .map_err(|e| PipelineFailure::at(PipelineStage::Request, e))?;

        let record = self
            .deps
            .ledger
            .begin_attempt(&key, &request.prompt, request.kind)
            .map_err(|e| PipelineFailure::at(PipelineStage::Request, StageError::from_ledger(e, None)))?;

        emit(
            Level::Info,
            "creative.pipeline.start",
            &format!("Starting attempt {} for {}", record.total_attempts, key),
            Some(json!({
                "subject": key.subject(),
                "campaign": key.campaign(),
                "attempt": record.total_attempts,
            })),
        );

        let result = self.run_stages(&key, request).await;
        match &result {
            Ok(ad) => emit(
                Level::Success,
                "creative.pipeline.done",
                &format!("Composite ad ready for {}: {}", key, ad.video_url),
                None,
            ),
            Err(failure) => emit(
                Level::Error,
                "creative.pipeline.failed",
                &format!("Pipeline for {} stopped: {}", key, failure),
                serde_json::to_value(failure.report()).ok(),
            ),
        }
        result
    }

    fn validate(&self, request: &CompositeRequest) -> Result<CreativeKey, StageError> {
        if !request.kind.is_full_chain() {
            return Err(StageError::Validation(format!(
                "kind '{}' does not run the full pipeline; use the single-stage commands",
                request.kind
            )));
        }
        let key = CreativeKey::new(&request.subject, &request.campaign)?;
        require_text("prompt", &request.prompt)?;
        Ok(key)
    }

    async fn run_stages(
        &self,
        key: &CreativeKey,
        request: &CompositeRequest,
    ) -> Result<CompositeAd, PipelineFailure> {
        self.gate(key, Stage::Image).await?;
        let image = self
            .image
            .generate(&ImageRequest {
                subject: key.subject().to_string(),
                campaign: key.campaign().to_string(),
                prompt: request.prompt.clone(),
                style: request.image_style.clone(),
            })
            .await
            .map_err(|e| PipelineFailure::at(Stage::Image, e))?;

        self.gate(key, Stage::Voice).await?;
        let audio = self
            .voice
            .generate(&VoiceRequest {
                subject: key.subject().to_string(),
                campaign: key.campaign().to_string(),
                text: request.prompt.clone(),
                voice: request.voice_style.clone(),
            })
            .await
            .map_err(|e| PipelineFailure::at(Stage::Voice, e))?;

        self.gate(key, Stage::Video).await?;
        let video = self
            .composer
            .compose(&ComposeRequest {
                subject: key.subject().to_string(),
                campaign: key.campaign().to_string(),
                prompt: request.prompt.clone(),
                image: image.reference.clone(),
                audio: audio.reference.clone(),
            })
            .await
            .map_err(|e| PipelineFailure::at(Stage::Video, e))?;

        Ok(CompositeAd {
            subject: key.subject().to_string(),
            campaign: key.campaign().to_string(),
            image_ref: image.reference,
            image_url: image.url,
            audio_ref: audio.reference,
            audio_url: audio.url,
            video_ref: video.reference,
            video_url: video.url,
            sync_map: video.sync_map,
            total_attempts: video.record.total_attempts,
            stage_counts: video.record.stage_counts,
        })
    }

    async fn gate(&self, key: &CreativeKey, stage: Stage) -> Result<(), PipelineFailure> {
        self.throttle(key.subject(), stage)
            .await
            .map_err(|e| PipelineFailure::at(stage, e))
    }

    /// Marks the creative final. A repeat request reports a conflict and
    /// leaves the record untouched.
    pub fn finalize(&self, subject: &str, campaign: &str) -> Result<FinalizeReport, StageError> {
        let key = CreativeKey::new(subject, campaign)?;
        let outcome = self
            .deps
            .ledger
            .finalize(&key)
            .map_err(|e| StageError::from_ledger(e, None))?;

        let report = match outcome {
            FinalizeOutcome::Finalized { finalized_at } => {
                emit(
                    Level::Success,
                    "creative.finalized",
                    &format!("Finalized {}", key),
                    None,
                );
                FinalizeReport {
                    is_final: true,
                    finalized_at: Some(finalized_at),
                    conflict: false,
                }
            }
            FinalizeOutcome::AlreadyFinal { finalized_at } => {
                emit(
                    Level::Warn,
                    "creative.finalize.conflict",
                    &format!("{} was already finalized", key),
                    None,
                );
                FinalizeReport {
                    is_final: true,
                    finalized_at,
                    conflict: true,
                }
            }
        };
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_report_names_stage_and_kind() {
        let failure = PipelineFailure::at(
            Stage::Voice,
            StageError::Provider {
                provider: "elevenlabs",
                message: "401 unauthorized".into(),
            },
        );
        let value = serde_json::to_value(failure.report()).unwrap();
        assert_eq!(value["failedStage"], "voice");
        assert_eq!(value["errorKind"], "provider");
        assert!(value["message"].as_str().unwrap().contains("401"));
        assert!(value.get("orphanedArtifact").is_none());
    }

    #[test]
    fn failure_display_leads_with_stage() {
        let failure = PipelineFailure::at(
            PipelineStage::Request,
            StageError::Validation("prompt is required".into()),
        );
        assert_eq!(
            failure.to_string(),
            "request stage failed: invalid request: prompt is required"
        );
    }
}
