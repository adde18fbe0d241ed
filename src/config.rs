//! Layered configuration for firmforge.
//!
//! Settings are resolved once at startup: built-in defaults, then an optional
//! `firmforge.toml`, then environment variables, then CLI flags (applied by the
//! binary). The resolved values are handed to the pipeline by construction.
//!
//! # Configuration File Format
//!
//! ```toml
//! [llm]
//! api_base = "https://api.openai.com/v1"
//! model = "gpt-4o-mini"
//! timeout_secs = 60
//!
//! [toolchain]
//! program = "arduino-cli"
//! target_flag = "--fqbn"
//! timeout_secs = 300
//! sketch_name = "sketch"
//! source_extension = "ino"
//! artifact_extensions = ["hex", "bin"]
//!
//! [workspace]
//! base_dir = "/var/tmp/firmforge"
//!
//! [server]
//! host = "0.0.0.0"
//! port = 5000
//! cors = false
//! ```
//!
//! The API key is only ever read from `OPENAI_API_KEY`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactLocator;
use crate::build::ToolchainInvoker;
use crate::generate::{ChatCompletionsConfig, ChatCompletionsGenerator};
use crate::pipeline::Pipeline;
use crate::workspace::{BUILD_DIR_NAME, WorkspaceManager};

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "firmforge.toml";

/// Language model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    /// Populated from `OPENAI_API_KEY`; never read from or written to the file.
    #[serde(skip)]
    pub api_key: Option<String>,
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_llm_timeout() -> u64 {
    60
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            model: default_model(),
            timeout_secs: default_llm_timeout(),
            api_key: None,
        }
    }
}

/// External compiler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainSection {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_target_flag")]
    pub target_flag: String,
    #[serde(default = "default_build_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_sketch_name")]
    pub sketch_name: String,
    #[serde(default = "default_source_extension")]
    pub source_extension: String,
    /// Binary-image extensions, highest priority first.
    #[serde(default = "default_artifact_extensions")]
    pub artifact_extensions: Vec<String>,
}

fn default_program() -> String {
    "arduino-cli".to_string()
}

fn default_target_flag() -> String {
    "--fqbn".to_string()
}

fn default_build_timeout() -> u64 {
    300
}

fn default_sketch_name() -> String {
    "sketch".to_string()
}

fn default_source_extension() -> String {
    "ino".to_string()
}

fn default_artifact_extensions() -> Vec<String> {
    vec!["hex".to_string(), "bin".to_string()]
}

impl Default for ToolchainSection {
    fn default() -> Self {
        Self {
            program: default_program(),
            target_flag: default_target_flag(),
            timeout_secs: default_build_timeout(),
            sketch_name: default_sketch_name(),
            source_extension: default_source_extension(),
            artifact_extensions: default_artifact_extensions(),
        }
    }
}

/// Where per-request workspaces are created.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceSection {
    /// Defaults to the system temp directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_dir: Option<PathBuf>,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors: false,
        }
    }
}

/// The complete firmforge.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub toolchain: ToolchainSection,
    #[serde(default)]
    pub workspace: WorkspaceSection,
    #[serde(default)]
    pub server: ServerSection,
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse settings from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse firmforge.toml")
    }

    /// Resolve file and environment layers.
    ///
    /// An explicit `path` must exist; otherwise `firmforge.toml` in the current
    /// directory is used when present.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => Self::load(path)?,
            None => {
                let default_path = Path::new(CONFIG_FILE_NAME);
                if default_path.exists() {
                    Self::load(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Apply environment overrides, reading variables through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = var("OPENAI_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(base) = var("FIRMFORGE_API_BASE") {
            self.llm.api_base = base;
        }
        if let Some(model) = var("FIRMFORGE_MODEL") {
            self.llm.model = model;
        }
        if let Some(program) = var("FIRMFORGE_TOOLCHAIN") {
            self.toolchain.program = program;
        }
        if let Some(secs) = var("FIRMFORGE_BUILD_TIMEOUT") {
            self.toolchain.timeout_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("FIRMFORGE_BUILD_TIMEOUT must be seconds, got '{}'", secs))?;
        }
        if let Some(dir) = var("FIRMFORGE_WORKSPACE_DIR") {
            self.workspace.base_dir = Some(PathBuf::from(dir));
        }
        if let Some(port) = var("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("PORT must be a port number, got '{}'", port))?;
        }
        Ok(())
    }

    /// Validate the settings and return any problems found.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.llm.timeout_secs == 0 {
            problems.push("llm.timeout_secs must be greater than zero".to_string());
        }
        if self.llm.model.trim().is_empty() {
            problems.push("llm.model must not be empty".to_string());
        }
        if !self.llm.api_base.starts_with("http://") && !self.llm.api_base.starts_with("https://") {
            problems.push(format!(
                "llm.api_base '{}' must be an http(s) URL",
                self.llm.api_base
            ));
        }
        if self.toolchain.timeout_secs == 0 {
            problems.push("toolchain.timeout_secs must be greater than zero".to_string());
        }
        if self.toolchain.program.trim().is_empty() {
            problems.push("toolchain.program must not be empty".to_string());
        }
        if self.toolchain.target_flag.trim().is_empty() {
            problems.push("toolchain.target_flag must not be empty".to_string());
        }
        if self.toolchain.sketch_name.trim().is_empty() || self.toolchain.sketch_name.contains('/') {
            problems.push(format!(
                "toolchain.sketch_name '{}' must be a plain file stem",
                self.toolchain.sketch_name
            ));
        }
        if self.toolchain.sketch_name == BUILD_DIR_NAME {
            problems.push(format!(
                "toolchain.sketch_name must not be '{}', which is reserved for build output",
                BUILD_DIR_NAME
            ));
        }
        if self.toolchain.artifact_extensions.is_empty() {
            problems.push("toolchain.artifact_extensions must list at least one extension".to_string());
        }

        problems
    }

    /// Render as TOML, with the API key reported as a comment only.
    pub fn to_toml(&self) -> Result<String> {
        let body = toml::to_string_pretty(self).context("Failed to serialize settings")?;
        let key_state = if self.llm.api_key.is_some() { "set" } else { "not set" };
        Ok(format!("# OPENAI_API_KEY: {}\n{}", key_state, body))
    }

    pub fn workspace_manager(&self) -> WorkspaceManager {
        WorkspaceManager::new(
            self.workspace
                .base_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
            self.toolchain.sketch_name.clone(),
            self.toolchain.source_extension.clone(),
        )
    }

    pub fn toolchain(&self) -> ToolchainInvoker {
        ToolchainInvoker::new(
            self.toolchain.program.clone(),
            self.toolchain.target_flag.clone(),
            Duration::from_secs(self.toolchain.timeout_secs),
        )
    }

    /// Wire a pipeline from these settings.
    pub fn pipeline(&self) -> Result<Pipeline> {
        let generator = ChatCompletionsGenerator::new(ChatCompletionsConfig {
            api_base: self.llm.api_base.clone(),
            api_key: self.llm.api_key.clone(),
            model: self.llm.model.clone(),
            timeout: Duration::from_secs(self.llm.timeout_secs),
        })?;

        Ok(Pipeline::new(
            Arc::new(generator),
            Arc::new(self.toolchain()),
            self.workspace_manager(),
            ArtifactLocator::new(self.toolchain.artifact_extensions.iter().cloned()),
        ))
    }
}
