#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use adsynq::creative::mux::{MuxExit, Muxer};
use adsynq::creative::providers::{ImageProvider, SpeechProvider};
use adsynq::creative::{
    ArtifactStore, AttemptLedger, CreativeKey, Pipeline, QuotaConfig, Stage, StageDeps,
};
use anyhow::{Result, bail};
use async_trait::async_trait;
use tempfile::TempDir;

pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(5);

/// Temp output directory plus an on-disk ledger inside it.
pub struct TestEnvironment {
    temp_dir: TempDir,
    pub ledger: Arc<AttemptLedger>,
    pub artifacts: Arc<ArtifactStore>,
}

impl TestEnvironment {
    pub fn new() -> Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let ledger = AttemptLedger::open(&temp_dir.path().join("ledger.db"))?;
        let artifacts = ArtifactStore::new(temp_dir.path().join("output"), "http://test.local");
        Ok(Self {
            temp_dir,
            ledger: Arc::new(ledger),
            artifacts: Arc::new(artifacts),
        })
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.temp_dir.path().join("ledger.db")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.artifacts.root().to_path_buf()
    }

    pub fn deps(&self, quota: QuotaConfig) -> StageDeps {
        StageDeps::new(self.ledger.clone(), self.artifacts.clone(), quota)
    }

    pub fn pipeline(
        &self,
        quota: QuotaConfig,
        image: Arc<FakeImageProvider>,
        speech: Arc<FakeSpeechProvider>,
        muxer: Arc<FakeMuxer>,
    ) -> Pipeline {
        Pipeline::new(self.deps(quota), image, speech, muxer, PROVIDER_TIMEOUT)
    }

    /// Files (not directories) currently stored for a stage and subject.
    pub fn stored_files(&self, stage: Stage, subject: &str) -> Vec<PathBuf> {
        let Ok(key) = CreativeKey::new(subject, "any") else {
            return Vec::new();
        };
        let dir = self.artifacts.stage_dir(stage, &key);
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        files.sort();
        files
    }
}

pub fn quota(image: u32, audio: u32, video: Option<u32>) -> QuotaConfig {
    QuotaConfig {
        image,
        audio,
        video,
    }
}

pub struct FakeImageProvider {
    calls: AtomicUsize,
    fail: bool,
    delay: Duration,
}

impl FakeImageProvider {
    pub fn ok() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: false,
            delay: Duration::ZERO,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: true,
            delay: Duration::ZERO,
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: false,
            delay,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageProvider for FakeImageProvider {
    async fn generate(&self, prompt: &str, style: Option<&str>) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            bail!("image API error (500): upstream unavailable");
        }
        Ok(format!("PNG:{prompt}:{}", style.unwrap_or("default")).into_bytes())
    }

    fn name(&self) -> &'static str {
        "fake-image"
    }
}

pub struct FakeSpeechProvider {
    calls: AtomicUsize,
    fail: bool,
}

impl FakeSpeechProvider {
    pub fn ok() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: true,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechProvider for FakeSpeechProvider {
    async fn synthesize(&self, text: &str, voice_id: Option<&str>) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            bail!("speech API error (401): invalid key");
        }
        Ok(format!("MP3:{}:{text}", voice_id.unwrap_or("default")).into_bytes())
    }

    fn name(&self) -> &'static str {
        "fake-speech"
    }
}

#[derive(Debug, Clone, Copy)]
pub enum MuxMode {
    /// Write a stub video and exit 0
    Write,
    /// Write partial output, then exit with the code
    ExitCode(i32),
    /// Fail to start
    LaunchFailure,
    /// Exit 0 without writing anything
    Silent,
}

pub struct FakeMuxer {
    mode: MuxMode,
    launches: AtomicUsize,
}

impl FakeMuxer {
    pub fn new(mode: MuxMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            launches: AtomicUsize::new(0),
        })
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Muxer for FakeMuxer {
    async fn mux(&self, image: &Path, audio: &Path, output: &Path) -> std::io::Result<MuxExit> {
        if let MuxMode::LaunchFailure = self.mode {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "fake-ffmpeg: not found",
            ));
        }
        self.launches.fetch_add(1, Ordering::SeqCst);
        assert!(image.is_file(), "image input missing: {}", image.display());
        assert!(audio.is_file(), "audio input missing: {}", audio.display());

        match self.mode {
            MuxMode::Write => {
                std::fs::write(output, b"MP4")?;
                Ok(MuxExit::Success)
            }
            MuxMode::ExitCode(code) => {
                std::fs::write(output, b"MP")?;
                Ok(MuxExit::Failed { code: Some(code) })
            }
            MuxMode::Silent => Ok(MuxExit::Success),
            MuxMode::LaunchFailure => unreachable!(),
        }
    }

    fn program(&self) -> &str {
        "fake-ffmpeg"
    }
}
