//! Typed error hierarchy for the compile pipeline.
//!
//! Every variant belongs to exactly one pipeline [`Stage`]; the orchestrator
//! uses [`PipelineError::stage`] to tag the failure it hands back to callers.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::build::BuildResult;
use crate::pipeline::Stage;

/// Errors produced by individual pipeline stages.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Language model request failed: {0}")]
    Generation(String),

    #[error("Model output is not a valid JSON object: {reason}")]
    InvalidJson { raw: String, reason: String },

    #[error("Model output is missing required key '{key}'")]
    MissingKey { key: &'static str, raw: String },

    #[error("Model output key '{key}' must be a string")]
    InvalidField { key: &'static str, raw: String },

    #[error("Failed to prepare workspace at {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to launch toolchain '{program}': {source}")]
    BuildInvocation {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Toolchain timeout: build exceeded {}s limit and was killed", .limit.as_secs())]
    BuildTimeout {
        limit: Duration,
        /// Output printed before the toolchain was killed.
        stdout: String,
        stderr: String,
    },

    #[error("compilation failed")]
    CompilationFailed { result: BuildResult },

    #[error("No binary image found under {build_dir}")]
    ArtifactNotFound { build_dir: PathBuf },

    #[error("Failed to read artifact {path}: {source}")]
    Encoding {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    /// The stage this error aborts.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Generation(_) => Stage::Generate,
            Self::InvalidJson { .. } | Self::MissingKey { .. } | Self::InvalidField { .. } => {
                Stage::Parse
            }
            Self::Workspace { .. } => Stage::Stage,
            Self::BuildInvocation { .. } | Self::BuildTimeout { .. } | Self::CompilationFailed { .. } => {
                Stage::Build
            }
            Self::ArtifactNotFound { .. } => Stage::Locate,
            Self::Encoding { .. } => Stage::Encode,
        }
    }

    /// Raw model text carried by parse errors.
    pub fn raw_output(&self) -> Option<&str> {
        match self {
            Self::InvalidJson { raw, .. }
            | Self::MissingKey { raw, .. }
            | Self::InvalidField { raw, .. } => Some(raw),
            _ => None,
        }
    }
}
