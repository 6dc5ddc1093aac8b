use std::sync::Arc;
use std::time::Duration;

use super::error::StageError;
use super::ledger::StageArtifact;
use super::providers::ImageProvider;
use super::record::{CreativeKey, CreativeKind, Stage};
use super::stage::{GeneratedArtifact, StageDeps, call_provider, require_text};
use crate::ui::prelude::{Level, emit};

#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub subject: String,
    pub campaign: String,
    pub prompt: String,
    pub style: Option<String>,
}

/// Generates the still image of a creative.
pub struct ImageGenerator {
    deps: StageDeps,
    provider: Arc<dyn ImageProvider>,
    timeout: Duration,
}

impl ImageGenerator {
    pub fn new(deps: StageDeps, provider: Arc<dyn ImageProvider>, timeout: Duration) -> Self {
        Self {
            deps,
            provider,
            timeout,
        }
    }

    pub async fn generate(&self, request: &ImageRequest) -> Result<GeneratedArtifact, StageError> {
        let key = CreativeKey::new(&request.subject, &request.campaign)?;
        require_text("prompt", &request.prompt)?;

        let _guard = self.deps.locks.lock(&key).await;
        let record = self
            .deps
            .ledger
            .load_or_create(&key, &request.prompt, CreativeKind::Image)
            .map_err(|e| StageError::from_ledger(e, None))?;
        self.deps.admit(Stage::Image, &record)?;

        emit(
            Level::Info,
            "creative.image.start",
            &format!(
                "Generating image for {} via {} (attempt {} of {})",
                key,
                self.provider.name(),
                record.stage_counts.image + 1,
                self.deps.quota.image
            ),
            None,
        );

        let bytes = call_provider(
            self.provider.name(),
            self.timeout,
            self.provider.generate(&request.prompt, request.style.as_deref()),
        )
        .await?;
        if bytes.is_empty() {
            return Err(StageError::Provider {
                provider: self.provider.name(),
                message: "provider returned no image data".into(),
            });
        }

        self.deps
            .persist(
                &key,
                |reference| StageArtifact::Image(reference),
                &request.prompt,
                "image",
                self.provider.file_extension(),
                bytes,
            )
            .await
    }
}
