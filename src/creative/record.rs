//! Attempt records and the identifiers they are keyed by.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::StageError;
use super::segment::Segment;

/// One generation step of a creative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Image,
    Voice,
    Video,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Image => "image",
            Stage::Voice => "voice",
            Stage::Video => "video",
        }
    }

    /// Directory under the output root holding this stage's artifacts.
    pub fn artifact_dir(self) -> &'static str {
        match self {
            Stage::Image => "images",
            Stage::Voice => "audio",
            Stage::Video => "videos",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "image" => Ok(Stage::Image),
            "voice" | "audio" => Ok(Stage::Voice),
            "video" => Ok(Stage::Video),
            other => Err(format!("unknown stage '{other}'")),
        }
    }
}

/// What the caller asked for when the record was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreativeKind {
    Image,
    Voice,
    #[default]
    Video,
    Composite,
}

impl CreativeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CreativeKind::Image => "image",
            CreativeKind::Voice => "voice",
            CreativeKind::Video => "video",
            CreativeKind::Composite => "composite",
        }
    }

    /// Whether this kind runs the full image, voice and video chain.
    pub fn is_full_chain(self) -> bool {
        matches!(self, CreativeKind::Video | CreativeKind::Composite)
    }
}

impl fmt::Display for CreativeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CreativeKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "image" => Ok(CreativeKind::Image),
            "voice" | "audio" => Ok(CreativeKind::Voice),
            "video" => Ok(CreativeKind::Video),
            "composite" => Ok(CreativeKind::Composite),
            other => Err(format!("unknown creative kind '{other}'")),
        }
    }
}

/// Lowercases, trims and replaces whitespace runs with `_`.
pub fn normalize_subject(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
}

/// Natural key of an attempt record: (subject, campaign).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CreativeKey {
    subject: String,
    campaign: String,
}

impl CreativeKey {
    /// Normalizes the subject and validates both parts.
    ///
    /// The subject ends up in artifact paths, so separators and `..` are
    /// rejected outright.
    pub fn new(subject: &str, campaign: &str) -> Result<Self, StageError> {
        let subject = normalize_subject(subject);
        if subject.is_empty() {
            return Err(StageError::Validation("subject is required".into()));
        }
        if subject.contains(['/', '\\']) || subject.contains("..") || subject.starts_with('.') {
            return Err(StageError::Validation(format!(
                "subject '{subject}' contains path characters"
            )));
        }

        let campaign = campaign.trim();
        if campaign.is_empty() {
            return Err(StageError::Validation("campaign name is required".into()));
        }

        Ok(Self {
            subject,
            campaign: campaign.to_string(),
        })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn campaign(&self) -> &str {
        &self.campaign
    }

    /// File-name friendly form of the campaign name.
    pub fn campaign_slug(&self) -> String {
        let slug: String = self
            .campaign
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("_")
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if slug.is_empty() {
            "campaign".to_string()
        } else {
            slug
        }
    }
}

impl fmt::Display for CreativeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subject, self.campaign)
    }
}

/// Successful, persisted generations per stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub image: u32,
    pub audio: u32,
    pub video: u32,
}

impl StageCounts {
    pub fn get(&self, stage: Stage) -> u32 {
        match stage {
            Stage::Image => self.image,
            Stage::Voice => self.audio,
            Stage::Video => self.video,
        }
    }
}

/// The current creative-in-progress for one (subject, campaign) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub subject: String,
    pub campaign: String,
    pub source_prompt: String,
    pub kind: CreativeKind,
    pub image_ref: Option<String>,
    pub audio_ref: Option<String>,
    pub video_ref: Option<String>,
    pub sync_map: Vec<Segment>,
    pub stage_counts: StageCounts,
    pub total_attempts: u32,
    pub is_final: bool,
    pub finalized_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn artifact_ref(&self, stage: Stage) -> Option<&str> {
        match stage {
            Stage::Image => self.image_ref.as_deref(),
            Stage::Voice => self.audio_ref.as_deref(),
            Stage::Video => self.video_ref.as_deref(),
        }
    }
}

/// One cataloged artifact. Every recorded stage success adds a row; the
/// version counts that stage's successes for the creative.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRecord {
    pub id: i64,
    pub subject: String,
    pub campaign: String,
    pub stage: Stage,
    pub reference: String,
    pub prompt: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_is_normalized() {
        let key = CreativeKey::new("  Jane   Doe ", "Spring Promo").unwrap();
        assert_eq!(key.subject(), "jane_doe");
        assert_eq!(key.campaign(), "Spring Promo");
    }

    #[test]
    fn rejects_path_like_subjects() {
        assert!(CreativeKey::new("../etc", "promo").is_err());
        assert!(CreativeKey::new("a/b", "promo").is_err());
        assert!(CreativeKey::new("   ", "promo").is_err());
        assert!(CreativeKey::new("u1", "  ").is_err());
    }

    #[test]
    fn campaign_slug_drops_unsafe_characters() {
        let key = CreativeKey::new("u1", "Summer Sale: 50% off!").unwrap();
        assert_eq!(key.campaign_slug(), "summer_sale_50_off");

        let key = CreativeKey::new("u1", "???").unwrap();
        assert_eq!(key.campaign_slug(), "campaign");
    }

    #[test]
    fn kind_parses_aliases() {
        assert_eq!("Audio".parse::<CreativeKind>(), Ok(CreativeKind::Voice));
        assert_eq!("video".parse::<CreativeKind>(), Ok(CreativeKind::Video));
        assert!("gif".parse::<CreativeKind>().is_err());
        assert!(CreativeKind::Composite.is_full_chain());
        assert!(!CreativeKind::Image.is_full_chain());
        assert_eq!("audio".parse::<Stage>(), Ok(Stage::Voice));
        assert_eq!(" Image".parse::<Stage>(), Ok(Stage::Image));
        assert!("text".parse::<Stage>().is_err());
    }
}
