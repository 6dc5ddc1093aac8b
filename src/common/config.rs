//! Application configuration
//!
//! Loaded once at startup from `<config_dir>/adsynq/config.toml` (created with
//! defaults when missing), then overlaid with environment variables. The
//! resulting [`AppConfig`] is passed into every component explicitly.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::paths;
use crate::creative::quota::QuotaConfig;
use crate::creative::rate_limit::RateLimitConfig;
use crate::ui::prelude::{Level, emit};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Root directory for generated images, audio and videos
    pub output_dir: PathBuf,
    /// SQLite attempt ledger
    pub database_path: PathBuf,
    /// Base URL artifact links are built from
    pub public_base_url: String,
    /// Upper bound for one provider call, in seconds
    pub provider_timeout_secs: u64,
    pub quota: QuotaConfig,
    pub rate_limit: RateLimitConfig,
    pub openai: OpenAiConfig,
    pub elevenlabs: ElevenLabsConfig,
    pub ffmpeg: FfmpegConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            output_dir: paths::default_output_dir(),
            database_path: paths::default_database_path(),
            public_base_url: Self::DEFAULT_PUBLIC_BASE_URL.to_string(),
            provider_timeout_secs: 120,
            quota: QuotaConfig::default(),
            rate_limit: RateLimitConfig::default(),
            openai: OpenAiConfig::default(),
            elevenlabs: ElevenLabsConfig::default(),
            ffmpeg: FfmpegConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub size: String,
    /// Appended to every image prompt
    pub style_suffix: Option<String>,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com".to_string(),
            model: "dall-e-3".to_string(),
            size: "1024x1024".to_string(),
            style_suffix: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElevenLabsConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    /// Voice used when a request names none
    pub voice_id: String,
    pub stability: f32,
    pub similarity_boost: f32,
}

impl ElevenLabsConfig {
    pub const DEFAULT_VOICE_ID: &'static str = "EXAVITQu4vr4xnSDxMaL";
}

impl Default for ElevenLabsConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.elevenlabs.io".to_string(),
            voice_id: Self::DEFAULT_VOICE_ID.to_string(),
            stability: 0.5,
            similarity_boost: 0.75,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FfmpegConfig {
    /// ffmpeg executable, looked up on PATH when not absolute
    pub path: String,
    /// Seconds before a running mux is killed
    pub timeout_secs: u64,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            path: "ffmpeg".to_string(),
            timeout_secs: 300,
        }
    }
}

impl AppConfig {
    pub const DEFAULT_PUBLIC_BASE_URL: &'static str = "http://localhost:5000";

    /// Load from the default location and apply environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_with_env(&paths::config_file_path()?)
    }

    pub fn load_with_env(path: &Path) -> Result<Self> {
        let mut config = Self::load_from_path(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            let config = Self::default();
            config.save_to_path(path)?;
            return Ok(config);
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("parsing config at {}", path.display()))
    }

    pub fn save_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating config directory {}", parent.display()))?;
        }

        let toml = toml::to_string_pretty(self).context("serializing config")?;
        fs::write(path, toml).with_context(|| format!("writing config to {}", path.display()))?;
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Overlay values from `lookup`. Blank values are skipped and numbers
    /// that do not parse keep the current value.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(key) = get("OPENAI_API_KEY") {
            self.openai.api_key = Some(key);
        }
        if let Some(key) = get("ELEVENLABS_API_KEY") {
            self.elevenlabs.api_key = Some(key);
        }
        if let Some(voice) = get("ELEVENLABS_VOICE_ID") {
            self.elevenlabs.voice_id = voice;
        }
        if let Some(path) = get("FFMPEG_PATH") {
            self.ffmpeg.path = path;
        }
        if let Some(max) = get("MAX_IMAGE_PER_AD").and_then(|v| parse_limit("MAX_IMAGE_PER_AD", &v)) {
            self.quota.image = max;
        }
        if let Some(max) = get("MAX_AUDIO_PER_AD").and_then(|v| parse_limit("MAX_AUDIO_PER_AD", &v)) {
            self.quota.audio = max;
        }
        if let Some(max) = get("MAX_VIDEO_PER_AD").and_then(|v| parse_limit("MAX_VIDEO_PER_AD", &v)) {
            self.quota.video = Some(max);
        }
    }
}

fn parse_limit(name: &str, value: &str) -> Option<u32> {
    match value.parse::<u32>() {
        Ok(max) => Some(max),
        Err(_) => {
            emit(
                Level::Warn,
                "config.env.invalid",
                &format!("Ignoring {name}={value}: not a non-negative integer"),
                None,
            );
            None
        }
    }
}
