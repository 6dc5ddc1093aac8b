//! External generation providers.

mod elevenlabs;
mod openai;

pub use elevenlabs::ElevenLabsSpeechProvider;
pub use openai::OpenAiImageProvider;

use anyhow::Result;
use async_trait::async_trait;

/// Text-to-image backend.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Generate one image for `prompt` and return its encoded bytes.
    async fn generate(&self, prompt: &str, style: Option<&str>) -> Result<Vec<u8>>;

    /// Human-readable name of the provider for logging
    fn name(&self) -> &'static str;

    /// File extension of the returned bytes
    fn file_extension(&self) -> &'static str {
        "png"
    }
}

/// Text-to-speech backend.
#[async_trait]
pub trait SpeechProvider: Send + Sync {
    /// Synthesize `text` and return encoded audio bytes.
    ///
    /// # Arguments
    /// * `text` - Narration text
    /// * `voice_id` - Provider voice, or the configured default when `None`
    async fn synthesize(&self, text: &str, voice_id: Option<&str>) -> Result<Vec<u8>>;

    /// Human-readable name of the provider for logging
    fn name(&self) -> &'static str;

    /// File extension of the returned bytes
    fn file_extension(&self) -> &'static str {
        "mp3"
    }
}
