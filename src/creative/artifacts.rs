//! Stage-local artifact storage on the filesystem.
//!
//! Artifacts are addressed by output-relative references such as
//! `images/<subject>/image_<ts>_<suffix>.png`. Writes land in a temporary
//! file in the destination directory and are renamed into place, so a
//! referenced artifact is never half-written.

use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::record::{CreativeKey, Stage};

/// Output-relative path of a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique file name: `<prefix>_<millis>_<hex>.<ext>`.
pub fn unique_file_name(prefix: &str, extension: &str) -> String {
    let suffix: u32 = rand::thread_rng().r#gen();
    format!(
        "{}_{}_{:08x}.{}",
        prefix,
        Utc::now().timestamp_millis(),
        suffix,
        extension
    )
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    public_base_url: String,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding `stage` artifacts for the key's subject.
    pub fn stage_dir(&self, stage: Stage, key: &CreativeKey) -> PathBuf {
        self.root.join(stage.artifact_dir()).join(key.subject())
    }

    fn reference_for(stage: Stage, key: &CreativeKey, file_name: &str) -> ArtifactRef {
        ArtifactRef(format!(
            "{}/{}/{}",
            stage.artifact_dir(),
            key.subject(),
            file_name
        ))
    }

    /// Atomically writes `bytes` as a new artifact.
    pub fn put(
        &self,
        stage: Stage,
        key: &CreativeKey,
        file_name: &str,
        bytes: &[u8],
    ) -> io::Result<ArtifactRef> {
        let dir = self.stage_dir(stage, key);
        fs::create_dir_all(&dir)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(dir.join(file_name)).map_err(|e| e.error)?;

        Ok(Self::reference_for(stage, key, file_name))
    }

    /// Reserves a destination for an artifact produced by an external tool.
    /// Creates the directory; the file itself is left to the caller.
    pub fn reserve(
        &self,
        stage: Stage,
        key: &CreativeKey,
        file_name: &str,
    ) -> io::Result<(ArtifactRef, PathBuf)> {
        let dir = self.stage_dir(stage, key);
        fs::create_dir_all(&dir)?;
        Ok((Self::reference_for(stage, key, file_name), dir.join(file_name)))
    }

    /// Writes an auxiliary file next to a stage's artifacts.
    pub fn write_side_file(
        &self,
        stage: Stage,
        key: &CreativeKey,
        file_name: &str,
        bytes: &[u8],
    ) -> io::Result<PathBuf> {
        self.put(stage, key, file_name, bytes)?;
        Ok(self.stage_dir(stage, key).join(file_name))
    }

    /// Absolute path for a reference. Rejects absolute references and any
    /// that would escape the output root.
    pub fn resolve(&self, reference: &str) -> Result<PathBuf, String> {
        let relative = Path::new(reference);
        if reference.trim().is_empty() {
            return Err("empty artifact reference".to_string());
        }

        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(format!(
                        "artifact reference '{reference}' must stay inside the output directory"
                    ));
                }
            }
        }
        Ok(resolved)
    }

    /// Absolute path for a reference that must name a file directly inside
    /// `stage_dir(stage, key)`, i.e. exactly `<stage dir>/<subject>/<file>`.
    pub fn stage_local(
        &self,
        stage: Stage,
        key: &CreativeKey,
        reference: &ArtifactRef,
    ) -> Result<PathBuf, String> {
        let mut parts = Path::new(reference.as_str())
            .components()
            .filter(|c| !matches!(c, Component::CurDir));
        let matches_layout = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (
                Some(Component::Normal(dir)),
                Some(Component::Normal(subject)),
                Some(Component::Normal(file)),
                None,
            ) => {
                dir == OsStr::new(stage.artifact_dir())
                    && subject == OsStr::new(key.subject())
                    && !file.to_string_lossy().starts_with('.')
            }
            _ => false,
        };
        if !matches_layout {
            return Err(format!(
                "'{}' is not a {} artifact of {}; expected {}/{}/<file>",
                reference,
                stage,
                key.subject(),
                stage.artifact_dir(),
                key.subject()
            ));
        }
        self.resolve(reference.as_str())
    }

    pub fn exists(&self, reference: &str) -> bool {
        self.resolve(reference)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    pub fn public_url(&self, reference: &ArtifactRef) -> String {
        format!("{}/{}", self.public_base_url, reference.as_str())
    }

    pub fn remove(&self, reference: &ArtifactRef) -> io::Result<()> {
        let path = self
            .resolve(reference.as_str())
            .map_err(|msg| io::Error::new(io::ErrorKind::InvalidInput, msg))?;
        fs::remove_file(path)
    }
}
