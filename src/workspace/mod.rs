//! Per-request build workspaces.
//!
//! Each compile request gets its own directory tree:
//!
//! ```text
//! <base_dir>/firmforge-XXXXXX/
//!   sketch/sketch.ino    staged source (sketch dir name == file stem)
//!   build/               toolchain output
//! ```
//!
//! The tree is removed by [`Workspace::release`], or by `Drop` when a request
//! is abandoned before it reaches release.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::errors::PipelineError;

const WORKSPACE_PREFIX: &str = "firmforge-";
/// Name of the toolchain output directory inside each workspace.
pub const BUILD_DIR_NAME: &str = "build";

/// Allocates isolated workspaces under a base directory.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    base_dir: PathBuf,
    sketch_name: String,
    source_extension: String,
}

impl WorkspaceManager {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        sketch_name: impl Into<String>,
        source_extension: impl Into<String>,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            sketch_name: sketch_name.into(),
            source_extension: source_extension.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Create a fresh, uniquely named workspace with empty source and build dirs.
    pub fn acquire(&self) -> Result<Workspace, PipelineError> {
        std::fs::create_dir_all(&self.base_dir).map_err(|source| PipelineError::Workspace {
            path: self.base_dir.clone(),
            source,
        })?;

        let dir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(&self.base_dir)
            .map_err(|source| PipelineError::Workspace {
                path: self.base_dir.clone(),
                source,
            })?;

        let source_dir = dir.path().join(&self.sketch_name);
        let build_dir = dir.path().join(BUILD_DIR_NAME);
        for path in [&source_dir, &build_dir] {
            std::fs::create_dir(path).map_err(|source| PipelineError::Workspace {
                path: path.clone(),
                source,
            })?;
        }

        let source_file =
            source_dir.join(format!("{}.{}", self.sketch_name, self.source_extension));
        debug!(root = %dir.path().display(), "workspace acquired");

        Ok(Workspace {
            dir: Some(dir),
            source_dir,
            build_dir,
            source_file,
        })
    }
}

/// One request's source and build directories.
#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    source_dir: PathBuf,
    build_dir: PathBuf,
    source_file: PathBuf,
}

impl Workspace {
    pub fn root(&self) -> &Path {
        self.dir
            .as_ref()
            .map(TempDir::path)
            .unwrap_or_else(|| Path::new(""))
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    pub fn source_file(&self) -> &Path {
        &self.source_file
    }

    /// Write the generated program as the workspace's single source file.
    pub async fn stage(&self, code: &str) -> Result<PathBuf, PipelineError> {
        tokio::fs::write(&self.source_file, code)
            .await
            .map_err(|source| PipelineError::Workspace {
                path: self.source_file.clone(),
                source,
            })?;
        Ok(self.source_file.clone())
    }

    /// Remove the whole tree. Failures are logged and otherwise ignored.
    pub fn release(mut self) {
        if let Some(dir) = self.dir.take() {
            let root = dir.path().to_path_buf();
            match dir.close() {
                Ok(()) => debug!(root = %root.display(), "workspace released"),
                Err(e) => warn!(root = %root.display(), error = %e, "failed to remove workspace"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn manager(base: &Path) -> WorkspaceManager {
        WorkspaceManager::new(base, "sketch", "ino")
    }

    #[test]
    fn acquire_creates_empty_source_and_build_dirs() {
        let base = tempdir().unwrap();
        let ws = manager(base.path()).acquire().unwrap();

        assert!(ws.root().starts_with(base.path()));
        assert!(ws.source_dir().is_dir());
        assert!(ws.build_dir().is_dir());
        assert_eq!(std::fs::read_dir(ws.source_dir()).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(ws.build_dir()).unwrap().count(), 0);
        assert_eq!(ws.source_file(), ws.source_dir().join("sketch.ino"));
    }

    #[test]
    fn acquire_creates_missing_base_dir() {
        let parent = tempdir().unwrap();
        let base = parent.path().join("nested").join("workspaces");
        let ws = manager(&base).acquire().unwrap();
        assert!(ws.root().starts_with(&base));
    }

    #[test]
    fn acquired_roots_are_unique() {
        let base = tempdir().unwrap();
        let mgr = manager(base.path());
        let workspaces: Vec<_> = (0..16).map(|_| mgr.acquire().unwrap()).collect();
        let roots: HashSet<_> = workspaces.iter().map(|w| w.root().to_path_buf()).collect();
        assert_eq!(roots.len(), 16);
    }

    #[tokio::test]
    async fn stage_writes_source_file() {
        let base = tempdir().unwrap();
        let ws = manager(base.path()).acquire().unwrap();
        let path = ws.stage("void setup() {}\nvoid loop() {}\n").await.unwrap();
        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            "void setup() {}\nvoid loop() {}\n"
        );
    }

    #[tokio::test]
    async fn release_removes_tree() {
        let base = tempdir().unwrap();
        let ws = manager(base.path()).acquire().unwrap();
        ws.stage("x").await.unwrap();
        std::fs::write(ws.build_dir().join("sketch.ino.hex"), b":00000001FF").unwrap();
        let root = ws.root().to_path_buf();

        ws.release();
        assert!(!root.exists());
        assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 0);
    }

    #[test]
    fn dropping_workspace_removes_tree() {
        let base = tempdir().unwrap();
        let root = {
            let ws = manager(base.path()).acquire().unwrap();
            ws.root().to_path_buf()
        };
        assert!(!root.exists());
    }

    #[test]
    fn release_tolerates_already_removed_tree() {
        let base = tempdir().unwrap();
        let ws = manager(base.path()).acquire().unwrap();
        std::fs::remove_dir_all(ws.root()).unwrap();
        ws.release();
    }

    #[test]
    fn custom_sketch_layout() {
        let base = tempdir().unwrap();
        let ws = WorkspaceManager::new(base.path(), "firmware", "cpp")
            .acquire()
            .unwrap();
        assert!(ws.source_dir().ends_with("firmware"));
        assert_eq!(ws.source_file(), ws.source_dir().join("firmware.cpp"));
    }
}
