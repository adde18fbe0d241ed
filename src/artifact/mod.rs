//! Locating the binary image in toolchain output.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::errors::PipelineError;

/// A located binary image and its contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

impl Artifact {
    /// Read the image at `path`.
    pub async fn load(path: PathBuf) -> Result<Self, PipelineError> {
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Self { path, bytes }),
            Err(source) => Err(PipelineError::Encoding { path, source }),
        }
    }

    /// File name of the image, e.g. `sketch.ino.hex`.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Finds binary images by extension, in priority order.
#[derive(Debug, Clone)]
pub struct ArtifactLocator {
    extensions: Vec<String>,
}

impl ArtifactLocator {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|ext| ext.into().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Select one binary image under `build_dir`.
    ///
    /// The tree is walked in sorted file-name order, so repeated runs over the
    /// same output always pick the same file. An earlier extension in the list
    /// beats a later one regardless of position in the walk.
    pub fn locate(&self, build_dir: &Path) -> Result<PathBuf, PipelineError> {
        let files: Vec<PathBuf> = WalkDir::new(build_dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect();

        self.extensions
            .iter()
            .find_map(|wanted| {
                files
                    .iter()
                    .find(|path| {
                        path.extension()
                            .is_some_and(|ext| ext.to_string_lossy().eq_ignore_ascii_case(wanted))
                    })
                    .cloned()
            })
            .ok_or_else(|| PipelineError::ArtifactNotFound {
                build_dir: build_dir.to_path_buf(),
            })
    }
}

impl Default for ArtifactLocator {
    fn default() -> Self {
        Self::new(["hex", "bin"])
    }
}
