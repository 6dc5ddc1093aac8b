//! Video assembly from an existing image and narration track.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use super::artifacts::{ArtifactRef, unique_file_name};
use super::error::StageError;
use super::ledger::StageArtifact;
use super::mux::{MuxExit, Muxer};
use super::record::{AttemptRecord, CreativeKey, CreativeKind, Stage};
use super::segment::{Segment, build_sync_map, total_duration};
use super::stage::{StageDeps, blocking, require_text};
use crate::ui::prelude::{Level, emit};

#[derive(Debug, Clone)]
pub struct ComposeRequest {
    pub subject: String,
    pub campaign: String,
    pub prompt: String,
    pub image: ArtifactRef,
    pub audio: ArtifactRef,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Composition {
    pub reference: ArtifactRef,
    pub url: String,
    pub sync_map: Vec<Segment>,
    pub sync_map_path: Option<PathBuf>,
    #[serde(skip)]
    pub record: AttemptRecord,
}

/// Removes a partially written output unless disarmed, including when the
/// composing future is dropped mid-run.
struct PartialOutput {
    path: PathBuf,
    armed: bool,
}

impl PartialOutput {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PartialOutput {
    fn drop(&mut self) {
        if self.armed && self.path.exists() {
            let _ = fs::remove_file(&self.path);
        }
    }
}

pub struct Composer {
    deps: StageDeps,
    muxer: Arc<dyn Muxer>,
}

impl Composer {
    pub fn new(deps: StageDeps, muxer: Arc<dyn Muxer>) -> Self {
        Self { deps, muxer }
    }

    /// Resolves an input that must be a stored artifact of `stage` for the
    /// key's subject.
    fn upstream(
        &self,
        stage: Stage,
        key: &CreativeKey,
        reference: &ArtifactRef,
    ) -> Result<PathBuf, StageError> {
        let path = self
            .deps
            .artifacts
            .stage_local(stage, key, reference)
            .map_err(StageError::Validation)?;
        if !path.is_file() {
            return Err(StageError::MissingUpstreamArtifact {
                stage,
                reference: reference.to_string(),
            });
        }
        Ok(path)
    }

    pub async fn compose(&self, request: &ComposeRequest) -> Result<Composition, StageError> {
        let key = CreativeKey::new(&request.subject, &request.campaign)?;
        require_text("prompt", &request.prompt)?;

        let image_path = self.upstream(Stage::Image, &key, &request.image)?;
        let audio_path = self.upstream(Stage::Voice, &key, &request.audio)?;

        let _guard = self.deps.locks.lock(&key).await;
        let record = self
            .deps
            .ledger
            .load_or_create(&key, &request.prompt, CreativeKind::Video)
            .map_err(|e| StageError::from_ledger(e, None))?;
        self.deps.admit(Stage::Video, &record)?;

        let file_name = unique_file_name(&key.campaign_slug(), "mp4");
        let (reference, final_path) = self
            .deps
            .artifacts
            .reserve(Stage::Video, &key, &file_name)
            .map_err(|e| StageError::storage(format!("cannot prepare video output: {e}"), None))?;

        let sync_map = build_sync_map(&request.prompt);
        let sync_map_path = self.write_sync_map(&key, &final_path, &sync_map);
        let partial = PartialOutput::new(partial_path(&final_path));

        emit(
            Level::Info,
            "creative.video.start",
            &format!(
                "Composing video for {} ({} segments, ~{:.1}s narration)",
                key,
                sync_map.len(),
                total_duration(&sync_map)
            ),
            None,
        );

        let exit = self
            .muxer
            .mux(&image_path, &audio_path, &partial.path)
            .await
            .map_err(|e| StageError::MuxingLaunch {
                program: self.muxer.program().to_string(),
                message: e.to_string(),
            })?;

        emit(
            Level::Debug,
            "creative.mux.exit",
            &format!("{} finished: {:?}", self.muxer.program(), exit),
            None,
        );

        match exit {
            MuxExit::Success => {}
            MuxExit::Failed { code } => {
                return Err(StageError::MuxingFailure {
                    code,
                    message: format!("{} could not render {}", self.muxer.program(), reference),
                });
            }
            MuxExit::TimedOut { after } => {
                return Err(StageError::MuxingFailure {
                    code: None,
                    message: format!("killed after {}s without finishing", after.as_secs()),
                });
            }
        }

        if !partial.path.is_file() {
            return Err(StageError::MuxingFailure {
                code: Some(0),
                message: format!("{} reported success but wrote no output", self.muxer.program()),
            });
        }
        fs::rename(&partial.path, &final_path).map_err(|e| {
            StageError::storage(format!("rendered video could not be moved into place: {e}"), None)
        })?;
        partial.disarm();

        let record = {
            let deps = self.deps.clone();
            let key = key.clone();
            let reference = reference.clone();
            let image = request.image.clone();
            let audio = request.audio.clone();
            let prompt = request.prompt.clone();
            let sync_map = sync_map.clone();
            blocking(move || {
                deps.ledger
                    .record_stage_success(
                        &key,
                        StageArtifact::Video {
                            video: reference.as_str(),
                            image: image.as_str(),
                            audio: audio.as_str(),
                            sync_map: &sync_map,
                        },
                        &prompt,
                        deps.quota.max_for(Stage::Video),
                    )
                    .map_err(|err| deps.unrecorded(Stage::Video, &reference, err))
            })
            .await?
        };

        emit(
            Level::Success,
            "creative.video.stored",
            &format!("Stored video for {} at {}", key, reference),
            Some(json!({
                "reference": reference.as_str(),
                "segments": sync_map.len(),
            })),
        );

        Ok(Composition {
            url: self.deps.artifacts.public_url(&reference),
            reference,
            sync_map,
            sync_map_path,
            record,
        })
    }

    /// Writes the human-readable sync map next to the video it belongs to,
    /// named after the video's file stem. Failure is reported and otherwise
    /// ignored.
    fn write_sync_map(
        &self,
        key: &CreativeKey,
        video_path: &Path,
        sync_map: &[Segment],
    ) -> Option<PathBuf> {
        let file_name = sync_map_file_name(video_path);
        let written = serde_json::to_vec_pretty(sync_map)
            .map_err(std::io::Error::other)
            .and_then(|bytes| {
                self.deps
                    .artifacts
                    .write_side_file(Stage::Video, key, &file_name, &bytes)
            });

        match written {
            Ok(path) => Some(path),
            Err(e) => {
                emit(
                    Level::Warn,
                    "creative.sync_map.write",
                    &format!("Could not write sync map for {}: {}", key, e),
                    None,
                );
                None
            }
        }
    }
}

fn sync_map_file_name(video_path: &Path) -> String {
    let stem = video_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());
    format!("{stem}_syncMap.json")
}

fn partial_path(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video.mp4".to_string());
    final_path.with_file_name(format!(".partial_{name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_path_keeps_extension() {
        let partial = partial_path(Path::new("/out/videos/u1/promo_1_ab.mp4"));
        assert_eq!(partial, PathBuf::from("/out/videos/u1/.partial_promo_1_ab.mp4"));
    }

    #[test]
    fn sync_map_is_named_after_the_video() {
        assert_eq!(
            sync_map_file_name(Path::new("/out/videos/u1/promo_1_1700000000000_0a1b2c3d.mp4")),
            "promo_1_1700000000000_0a1b2c3d_syncMap.json"
        );
    }

    #[test]
    fn partial_output_is_removed_unless_disarmed() {
        let dir = tempfile::tempdir().unwrap();
        let doomed = dir.path().join("a.mp4");
        let kept = dir.path().join("b.mp4");
        fs::write(&doomed, b"x").unwrap();
        fs::write(&kept, b"x").unwrap();

        drop(PartialOutput::new(doomed.clone()));
        PartialOutput::new(kept.clone()).disarm();

        assert!(!doomed.exists());
        assert!(kept.exists());
    }
}
