//! Per-stage attempt ceilings.
//!
//! A hard cap on successful generations per creative, not a rate window.
//! Bursty clients are throttled separately by [`super::rate_limit`].

use serde::{Deserialize, Serialize};

use super::record::{Stage, StageCounts};

/// True iff another attempt fits under `max`.
pub fn can_attempt(current: u32, max: u32) -> bool {
    current < max
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Maximum image generations per creative
    pub image: u32,
    /// Maximum voice generations per creative
    pub audio: u32,
    /// Maximum video compositions per creative (unset = unlimited)
    pub video: Option<u32>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            image: Self::DEFAULT_IMAGE,
            audio: Self::DEFAULT_AUDIO,
            video: None,
        }
    }
}

impl QuotaConfig {
    pub const DEFAULT_IMAGE: u32 = 3;
    pub const DEFAULT_AUDIO: u32 = 3;

    /// Configured ceiling for a stage, `None` when uncapped.
    pub fn max_for(&self, stage: Stage) -> Option<u32> {
        match stage {
            Stage::Image => Some(self.image),
            Stage::Voice => Some(self.audio),
            Stage::Video => self.video,
        }
    }

    pub fn allows(&self, stage: Stage, counts: &StageCounts) -> bool {
        self.max_for(stage)
            .is_none_or(|max| can_attempt(counts.get(stage), max))
    }

    pub fn remaining(&self, stage: Stage, counts: &StageCounts) -> Option<u32> {
        self.max_for(stage)
            .map(|max| max.saturating_sub(counts.get(stage)))
    }
}
