//! ElevenLabs text-to-speech

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::ACCEPT;
use serde_json::json;

use super::SpeechProvider;
use crate::common::config::ElevenLabsConfig;

pub struct ElevenLabsSpeechProvider {
    client: Client,
    config: ElevenLabsConfig,
}

impl ElevenLabsSpeechProvider {
    pub fn new(client: Client, config: ElevenLabsConfig) -> Self {
        Self { client, config }
    }

    fn endpoint(&self, voice_id: Option<&str>) -> String {
        let voice = voice_id
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(self.config.voice_id.as_str());
        format!(
            "{}/v1/text-to-speech/{}",
            self.config.base_url.trim_end_matches('/'),
            voice
        )
    }
}

#[async_trait]
impl SpeechProvider for ElevenLabsSpeechProvider {
    async fn synthesize(&self, text: &str, voice_id: Option<&str>) -> Result<Vec<u8>> {
        let api_key = self.config.api_key.as_deref().context(
            "ElevenLabs API key not configured (set ELEVENLABS_API_KEY or [elevenlabs].api_key)",
        )?;

        let body = json!({
            "text": text,
            "voice_settings": {
                "stability": self.config.stability,
                "similarity_boost": self.config.similarity_boost,
            },
        });

        let resp = self
            .client
            .post(self.endpoint(voice_id))
            .header("xi-api-key", api_key)
            .header(ACCEPT, "audio/mpeg")
            .json(&body)
            .send()
            .await
            .context("Failed to connect to ElevenLabs API")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("ElevenLabs API error ({}): {}", status, text);
        }

        let bytes = resp
            .bytes()
            .await
            .context("Failed to read ElevenLabs audio stream")?;
        if bytes.is_empty() {
            anyhow::bail!("ElevenLabs returned empty audio");
        }

        Ok(bytes.to_vec())
    }

    fn name(&self) -> &'static str {
        "elevenlabs"
    }
}
