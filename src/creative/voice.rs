use std::sync::Arc;
use std::time::Duration;

use super::error::StageError;
use super::ledger::StageArtifact;
use super::providers::SpeechProvider;
use super::record::{CreativeKey, CreativeKind, Stage};
use super::stage::{GeneratedArtifact, StageDeps, call_provider, require_text};
use crate::ui::prelude::{Level, emit};

#[derive(Debug, Clone)]
pub struct VoiceRequest {
    pub subject: String,
    pub campaign: String,
    /// Narration text
    pub text: String,
    /// Provider voice, configured default when unset
    pub voice: Option<String>,
}

/// Generates the narration track of a creative.
pub struct VoiceGenerator {
    deps: StageDeps,
    provider: Arc<dyn SpeechProvider>,
    timeout: Duration,
}

impl VoiceGenerator {
    pub fn new(deps: StageDeps, provider: Arc<dyn SpeechProvider>, timeout: Duration) -> Self {
        Self {
            deps,
            provider,
            timeout,
        }
    }

    pub async fn generate(&self, request: &VoiceRequest) -> Result<GeneratedArtifact, StageError> {
        let key = CreativeKey::new(&request.subject, &request.campaign)?;
        require_text("text", &request.text)?;

        let _guard = self.deps.locks.lock(&key).await;
        let record = self
            .deps
            .ledger
            .load_or_create(&key, &request.text, CreativeKind::Voice)
            .map_err(|e| StageError::from_ledger(e, None))?;
        self.deps.admit(Stage::Voice, &record)?;

        emit(
            Level::Info,
            "creative.voice.start",
            &format!(
                "Synthesizing narration for {} via {} (attempt {} of {})",
                key,
                self.provider.name(),
                record.stage_counts.audio + 1,
                self.deps.quota.audio
            ),
            None,
        );

        let bytes = call_provider(
            self.provider.name(),
            self.timeout,
            self.provider.synthesize(&request.text, request.voice.as_deref()),
        )
        .await?;
        if bytes.is_empty() {
            return Err(StageError::Provider {
                provider: self.provider.name(),
                message: "provider returned no audio data".into(),
            });
        }

        self.deps
            .persist(
                &key,
                |reference| StageArtifact::Voice(reference),
                &request.text,
                "audio",
                self.provider.file_extension(),
                bytes,
            )
            .await
    }
}
