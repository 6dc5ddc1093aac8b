use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

use crate::ui::prelude::{Level, emit};

/// How a muxing run ended once the tool was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxExit {
    Success,
    Failed { code: Option<i32> },
    TimedOut { after: Duration },
}

/// Merges a still image and an audio track into a video container.
///
/// An `Err` means the tool could not be started at all.
#[async_trait]
pub trait Muxer: Send + Sync {
    async fn mux(&self, image: &Path, audio: &Path, output: &Path) -> io::Result<MuxExit>;

    /// Program name for diagnostics
    fn program(&self) -> &str;
}

#[derive(Debug, Clone)]
pub struct FfmpegMuxer {
    program: String,
    timeout: Duration,
    verbose: bool,
}

impl FfmpegMuxer {
    pub fn new(program: impl Into<String>, timeout: Duration, verbose: bool) -> Self {
        Self {
            program: program.into(),
            timeout,
            verbose,
        }
    }
}

/// Looped still image + audio, H.264/AAC, cut to the shorter stream.
pub fn still_image_args(image: &Path, audio: &Path, output: &Path, verbose: bool) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into()];
    if !verbose {
        args.extend(["-loglevel".into(), "error".into()]);
    }
    args.extend([
        "-y".into(),
        "-loop".into(),
        "1".into(),
        "-i".into(),
        image.to_string_lossy().into_owned(),
        "-i".into(),
        audio.to_string_lossy().into_owned(),
        "-c:v".into(),
        "libx264".into(),
        "-tune".into(),
        "stillimage".into(),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        "192k".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-shortest".into(),
        output.to_string_lossy().into_owned(),
    ]);
    args
}

#[async_trait]
impl Muxer for FfmpegMuxer {
    async fn mux(&self, image: &Path, audio: &Path, output: &Path) -> io::Result<MuxExit> {
        let args = still_image_args(image, audio, output, self.verbose);
        emit(
            Level::Debug,
            "creative.mux.spawn",
            &format!("{} {}", self.program, args.join(" ")),
            None,
        );

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        match timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(MuxExit::Success),
            Ok(Ok(status)) => Ok(MuxExit::Failed {
                code: status.code(),
            }),
            Ok(Err(err)) => {
                emit(
                    Level::Warn,
                    "creative.mux.wait",
                    &format!("Failed to wait for {}: {}", self.program, err),
                    None,
                );
                let _ = child.kill().await;
                Ok(MuxExit::Failed { code: None })
            }
            Err(_) => {
                let _ = child.kill().await;
                Ok(MuxExit::TimedOut {
                    after: self.timeout,
                })
            }
        }
    }

    fn program(&self) -> &str {
        &self.program
    }
}
