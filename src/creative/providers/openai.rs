//! OpenAI image generation

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use serde_json::json;

use super::ImageProvider;
use crate::common::config::OpenAiConfig;

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageDatum>,
}

#[derive(Debug, Deserialize)]
struct ImageDatum {
    b64_json: Option<String>,
}

pub struct OpenAiImageProvider {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiImageProvider {
    pub fn new(client: Client, config: OpenAiConfig) -> Self {
        Self { client, config }
    }

    fn build_prompt(&self, prompt: &str, style: Option<&str>) -> String {
        let style = style.map(str::trim).filter(|s| !s.is_empty()).unwrap_or("default");
        match self.config.style_suffix.as_deref() {
            Some(suffix) if !suffix.trim().is_empty() => {
                format!("{prompt}, style: {style}, {}", suffix.trim())
            }
            _ => format!("{prompt}, style: {style}"),
        }
    }
}

#[async_trait]
impl ImageProvider for OpenAiImageProvider {
    async fn generate(&self, prompt: &str, style: Option<&str>) -> Result<Vec<u8>> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .context("OpenAI API key not configured (set OPENAI_API_KEY or [openai].api_key)")?;

        let url = format!(
            "{}/v1/images/generations",
            self.config.base_url.trim_end_matches('/')
        );
        let body = json!({
            "model": self.config.model,
            "prompt": self.build_prompt(prompt, style),
            "n": 1,
            "size": self.config.size,
            "response_format": "b64_json",
        });

        let resp = self
            .client
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await
            .context("Failed to connect to OpenAI images API")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI images API error ({}): {}", status, text);
        }

        let parsed: ImagesResponse = resp
            .json()
            .await
            .context("Failed to parse OpenAI images response")?;

        decode_first_image(parsed)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

fn decode_first_image(response: ImagesResponse) -> Result<Vec<u8>> {
    let encoded = response
        .data
        .into_iter()
        .next()
        .and_then(|d| d.b64_json)
        .context("OpenAI response contained no image data")?;

    let bytes = STANDARD
        .decode(encoded.trim())
        .context("OpenAI returned invalid base64 image data")?;
    if bytes.is_empty() {
        anyhow::bail!("OpenAI returned an empty image");
    }
    Ok(bytes)
}
