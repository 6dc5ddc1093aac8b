//! Short-window request throttle in front of generation stages.
//!
//! Independent of the ledger quota: this only smooths bursts from one
//! subject within a process, it never counts toward or against the
//! per-creative ceilings.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::error::StageError;
use super::quota::QuotaConfig;
use super::record::Stage;
use crate::ui::prelude::{Level, emit};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Whether the burst throttle is active
    pub enabled: bool,
    /// Window length in seconds
    pub window_secs: u64,
    /// Requests per subject and stage per window (unset = 2x the stage quota)
    pub max_requests: Option<u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_secs: 60 * 60,
            max_requests: None,
        }
    }
}

#[derive(Debug, Clone)]
struct RequestCounter {
    count: u32,
    window_start: Instant,
}

pub struct RateLimiter {
    window: Duration,
    max_requests: Option<u32>,
    quota: QuotaConfig,
    counters: Mutex<HashMap<(String, Stage), RequestCounter>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, quota: QuotaConfig) -> Self {
        Self {
            window: Duration::from_secs(config.window_secs.max(1)),
            max_requests: config.max_requests,
            quota,
            counters: Mutex::new(HashMap::new()),
        }
    }

    fn limit_for(&self, stage: Stage) -> Option<u32> {
        self.max_requests
            .or_else(|| self.quota.max_for(stage).map(|max| max.saturating_mul(2)))
    }

    /// Counts one request; rejects it when the window is already full.
    pub async fn check(&self, subject: &str, stage: Stage) -> Result<(), StageError> {
        let Some(limit) = self.limit_for(stage) else {
            return Ok(());
        };

        let mut counters = self.counters.lock().await;
        let now = Instant::now();
        counters.retain(|_, counter| now.duration_since(counter.window_start) < self.window);
        let counter = counters
            .entry((subject.to_string(), stage))
            .or_insert(RequestCounter {
                count: 0,
                window_start: now,
            });

        if counter.count >= limit {
            let retry_after = self
                .window
                .saturating_sub(now.duration_since(counter.window_start));
            emit(
                Level::Warn,
                "creative.rate_limited",
                &format!(
                    "Rate limit hit for {} {} requests: {}/{}",
                    subject, stage, counter.count, limit
                ),
                None,
            );
            return Err(StageError::RateLimited {
                stage,
                retry_after_secs: retry_after.as_secs().max(1),
            });
        }

        counter.count += 1;
        Ok(())
    }

    #[cfg(test)]
    async fn tracked(&self) -> usize {
        self.counters.lock().await.len()
    }
}
