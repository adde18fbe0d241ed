//! Compile pipeline orchestration.
//!
//! ```text
//! generate ─> parse ─> stage ─> build ─> locate ─> encode ─> Success
//!    │          │      └──────── workspace held ────────┘
//!    └──────────┴──────────┴────────┴────────┴────────┴──> Failure{stage}
//! ```
//!
//! A stage runs only if every earlier stage succeeded. The workspace is
//! acquired after parsing and released before [`Pipeline::compile`] returns,
//! whatever the outcome. Failures carry whatever the earlier stages produced
//! so callers can show partial progress.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::artifact::{Artifact, ArtifactLocator};
use crate::build::BuildInvoker;
use crate::encode;
use crate::errors::PipelineError;
use crate::generate::{CodeGenerator, GeneratedSource, parse_response};
use crate::workspace::{Workspace, WorkspaceManager};

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Generate,
    Parse,
    Stage,
    Build,
    Locate,
    Encode,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Parse => "parse",
            Self::Stage => "stage",
            Self::Build => "build",
            Self::Locate => "locate",
            Self::Encode => "encode",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One validated compile request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileRequest {
    pub instruction: String,
    pub target: String,
}

impl CompileRequest {
    pub fn new(instruction: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            target: target.into(),
        }
    }

    /// Check the request is worth running: a non-empty instruction and a
    /// `vendor:arch:board` target (further `:option` segments allowed).
    pub fn validate(&self) -> Result<(), String> {
        if self.instruction.trim().is_empty() {
            return Err("instruction must not be empty".to_string());
        }
        let segments: Vec<&str> = self.target.split(':').collect();
        if segments.len() < 3 || segments[..3].iter().any(|s| s.trim().is_empty()) {
            return Err(format!(
                "invalid target '{}': expected vendor:architecture:board",
                self.target
            ));
        }
        Ok(())
    }
}

/// Output of a fully successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledFirmware {
    pub code: String,
    pub explanation: String,
    pub artifact_name: String,
    pub artifact_base64: String,
    pub stdout: String,
    pub stderr: String,
}

/// Whatever earlier stages produced before a failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_dir: Option<PathBuf>,
}

impl PartialContext {
    fn from_source(source: &GeneratedSource) -> Self {
        Self {
            code: Some(source.code.clone()),
            explanation: Some(source.explanation.clone()),
            ..Self::default()
        }
    }
}

/// A stage-tagged failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: Stage,
    pub message: String,
    pub context: PartialContext,
}

/// Outcome of one [`Pipeline::compile`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineResult {
    Success(CompiledFirmware),
    Failure(StageFailure),
}

impl PipelineResult {
    fn failed(err: PipelineError, mut context: PartialContext) -> Self {
        match &err {
            PipelineError::CompilationFailed { result } => {
                context.exit_code = Some(result.exit_code);
                context.stdout = Some(result.stdout.clone());
                context.stderr = Some(result.stderr.clone());
            }
            PipelineError::BuildTimeout { stdout, stderr, .. } => {
                context.stdout = Some(stdout.clone());
                context.stderr = Some(stderr.clone());
            }
            _ => {}
        }
        if context.raw.is_none() {
            context.raw = err.raw_output().map(str::to_string);
        }
        let stage = err.stage();
        warn!(%stage, error = %err, "pipeline failed");
        Self::Failure(StageFailure {
            stage,
            message: err.to_string(),
            context,
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn failure(&self) -> Option<&StageFailure> {
        match self {
            Self::Failure(failure) => Some(failure),
            Self::Success(_) => None,
        }
    }

    pub fn success(&self) -> Option<&CompiledFirmware> {
        match self {
            Self::Success(firmware) => Some(firmware),
            Self::Failure(_) => None,
        }
    }
}

/// Sequences generation, staging, build and artifact extraction.
///
/// Holds no per-request state; one instance serves any number of concurrent
/// requests.
pub struct Pipeline {
    generator: Arc<dyn CodeGenerator>,
    builder: Arc<dyn BuildInvoker>,
    workspaces: WorkspaceManager,
    locator: ArtifactLocator,
}

impl Pipeline {
    pub fn new(
        generator: Arc<dyn CodeGenerator>,
        builder: Arc<dyn BuildInvoker>,
        workspaces: WorkspaceManager,
        locator: ArtifactLocator,
    ) -> Self {
        Self {
            generator,
            builder,
            workspaces,
            locator,
        }
    }

    /// Run the whole pipeline for one request. Never panics or errors; every
    /// failure is reported as [`PipelineResult::Failure`].
    ///
    /// Dropping the returned future mid-run kills any running toolchain
    /// process and removes the workspace.
    pub async fn compile(&self, request: &CompileRequest) -> PipelineResult {
        let run_id = Uuid::new_v4();
        let span = info_span!("compile", %run_id, target = %request.target);
        self.run(request).instrument(span).await
    }

    async fn run(&self, request: &CompileRequest) -> PipelineResult {
        info!(stage = %Stage::Generate, "generating source");
        let raw = match self.generator.generate(&request.instruction).await {
            Ok(raw) => raw,
            Err(e) => return PipelineResult::failed(e, PartialContext::default()),
        };

        info!(stage = %Stage::Parse, "parsing model output");
        let source = match parse_response(&raw) {
            Ok(source) => source,
            Err(e) => {
                let context = PartialContext {
                    raw: Some(raw),
                    ..PartialContext::default()
                };
                return PipelineResult::failed(e, context);
            }
        };

        // Directory creation and the artifact walk below are blocking
        // filesystem work, kept off the async workers.
        let manager = self.workspaces.clone();
        let acquired = tokio::task::spawn_blocking(move || manager.acquire())
            .await
            .unwrap_or_else(|e| {
                Err(PipelineError::Workspace {
                    path: self.workspaces.base_dir().to_path_buf(),
                    source: std::io::Error::other(e),
                })
            });
        let workspace = match acquired {
            Ok(ws) => ws,
            Err(e) => return PipelineResult::failed(e, PartialContext::from_source(&source)),
        };

        let result = self.run_in_workspace(&workspace, request, source).await;
        workspace.release();
        result
    }

    async fn run_in_workspace(
        &self,
        workspace: &Workspace,
        request: &CompileRequest,
        source: GeneratedSource,
    ) -> PipelineResult {
        let mut context = PartialContext::from_source(&source);

        info!(stage = %Stage::Stage, root = %workspace.root().display(), "staging source");
        if let Err(e) = workspace.stage(&source.code).await {
            return PipelineResult::failed(e, context);
        }

        info!(stage = %Stage::Build, "invoking toolchain");
        let build = match self
            .builder
            .build(workspace.source_dir(), workspace.build_dir(), &request.target)
            .await
        {
            Ok(build) => build,
            Err(e) => return PipelineResult::failed(e, context),
        };
        if !build.success() {
            return PipelineResult::failed(PipelineError::CompilationFailed { result: build }, context);
        }
        context.exit_code = Some(build.exit_code);
        context.stdout = Some(build.stdout.clone());
        context.stderr = Some(build.stderr.clone());

        info!(stage = %Stage::Locate, "locating binary image");
        let locator = self.locator.clone();
        let build_dir = workspace.build_dir().to_path_buf();
        let located = tokio::task::spawn_blocking(move || locator.locate(&build_dir))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "artifact search task failed");
                Err(PipelineError::ArtifactNotFound {
                    build_dir: workspace.build_dir().to_path_buf(),
                })
            });
        let path = match located {
            Ok(path) => path,
            Err(e) => {
                context.build_dir = Some(workspace.build_dir().to_path_buf());
                return PipelineResult::failed(e, context);
            }
        };

        info!(stage = %Stage::Encode, artifact = %path.display(), "encoding binary image");
        let artifact = match Artifact::load(path).await {
            Ok(artifact) => artifact,
            Err(e) => return PipelineResult::failed(e, context),
        };

        info!(bytes = artifact.bytes.len(), "compile succeeded");
        PipelineResult::Success(CompiledFirmware {
            code: source.code,
            explanation: source.explanation,
            artifact_name: artifact.file_name(),
            artifact_base64: encode::encode(&artifact.bytes),
            stdout: build.stdout,
            stderr: build.stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::BuildResult;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct ScriptedGenerator(Result<String, String>);

    #[async_trait]
    impl CodeGenerator for ScriptedGenerator {
        async fn generate(&self, _instruction: &str) -> Result<String, PipelineError> {
            self.0.clone().map_err(PipelineError::Generation)
        }
    }

    /// Records each call and writes `files` into the build dir before returning `exit_code`.
    struct RecordingBuilder {
        exit_code: i32,
        files: Vec<(&'static str, Vec<u8>)>,
        calls: AtomicUsize,
        staged: Mutex<Vec<String>>,
    }

    impl RecordingBuilder {
        fn new(exit_code: i32, files: Vec<(&'static str, Vec<u8>)>) -> Self {
            Self {
                exit_code,
                files,
                calls: AtomicUsize::new(0),
                staged: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BuildInvoker for RecordingBuilder {
        async fn build(
            &self,
            source_dir: &Path,
            build_dir: &Path,
            _target: &str,
        ) -> Result<BuildResult, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let staged = std::fs::read_to_string(source_dir.join("sketch.ino")).unwrap();
            self.staged.lock().unwrap().push(staged);
            for (name, bytes) in &self.files {
                std::fs::write(build_dir.join(name), bytes).unwrap();
            }
            Ok(BuildResult {
                exit_code: self.exit_code,
                stdout: "Sketch uses 924 bytes".into(),
                stderr: if self.exit_code == 0 {
                    String::new()
                } else {
                    "syntax error line 3".into()
                },
            })
        }
    }

    fn reply(code: &str, explanation: &str) -> Result<String, String> {
        Ok(serde_json::json!({"code": code, "explanation": explanation}).to_string())
    }

    fn pipeline(
        base: &Path,
        generator: ScriptedGenerator,
        builder: Arc<RecordingBuilder>,
    ) -> Pipeline {
        Pipeline::new(
            Arc::new(generator),
            builder,
            WorkspaceManager::new(base, "sketch", "ino"),
            ArtifactLocator::default(),
        )
    }

    fn request() -> CompileRequest {
        CompileRequest::new("blink an LED on pin 13", "arduino:avr:uno")
    }

    #[test]
    fn stage_names() {
        let names: Vec<_> = [
            Stage::Generate,
            Stage::Parse,
            Stage::Stage,
            Stage::Build,
            Stage::Locate,
            Stage::Encode,
        ]
        .iter()
        .map(Stage::as_str)
        .collect();
        assert_eq!(names, ["generate", "parse", "stage", "build", "locate", "encode"]);
        assert_eq!(serde_json::to_value(Stage::Locate).unwrap(), "locate");
    }

    #[test]
    fn validate_rejects_bad_requests() {
        assert!(request().validate().is_ok());
        assert!(CompileRequest::new("x", "esp32:esp32:esp32:PSRAM=enabled").validate().is_ok());
        assert!(CompileRequest::new("  ", "arduino:avr:uno").validate().is_err());
        assert!(CompileRequest::new("x", "arduino:avr").validate().is_err());
        assert!(CompileRequest::new("x", "arduino::uno").validate().is_err());
        assert!(CompileRequest::new("x", "").validate().is_err());
    }

    #[tokio::test]
    async fn success_carries_code_and_encoded_artifact() {
        let base = tempdir().unwrap();
        let builder = Arc::new(RecordingBuilder::new(0, vec![("sketch.ino.hex", vec![1, 0, 2])]));
        let p = pipeline(
            base.path(),
            ScriptedGenerator(reply("void setup() {}\\nvoid loop() {}", "does nothing")),
            builder.clone(),
        );

        let result = p.compile(&request()).await;
        let firmware = result.success().expect("expected success");
        assert_eq!(firmware.code, "void setup() {}\nvoid loop() {}");
        assert_eq!(firmware.explanation, "does nothing");
        assert_eq!(firmware.artifact_name, "sketch.ino.hex");
        assert_eq!(encode::decode(&firmware.artifact_base64).unwrap(), vec![1, 0, 2]);
        assert_eq!(firmware.stdout, "Sketch uses 924 bytes");

        // The staged file holds the normalized source.
        assert_eq!(
            builder.staged.lock().unwrap().as_slice(),
            ["void setup() {}\nvoid loop() {}"]
        );
        assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn generation_failure_creates_no_workspace() {
        let base = tempdir().unwrap();
        let ws_base = base.path().join("ws");
        let builder = Arc::new(RecordingBuilder::new(0, vec![]));
        let p = pipeline(&ws_base, ScriptedGenerator(Err("connection refused".into())), builder.clone());

        let result = p.compile(&request()).await;
        let failure = result.failure().unwrap();
        assert_eq!(failure.stage, Stage::Generate);
        assert!(failure.message.contains("connection refused"));
        assert_eq!(failure.context, PartialContext::default());
        assert!(!ws_base.exists());
        assert_eq!(builder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn parse_failure_never_builds() {
        let base = tempdir().unwrap();
        let builder = Arc::new(RecordingBuilder::new(0, vec![]));
        let p = pipeline(
            base.path(),
            ScriptedGenerator(Ok(r#"{"explanation": "forgot the code"}"#.into())),
            builder.clone(),
        );

        let failure = p.compile(&request()).await.failure().cloned().unwrap();
        assert_eq!(failure.stage, Stage::Parse);
        assert_eq!(failure.context.raw.as_deref(), Some(r#"{"explanation": "forgot the code"}"#));
        assert_eq!(builder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn compile_failure_reports_streams_and_code() {
        let base = tempdir().unwrap();
        let builder = Arc::new(RecordingBuilder::new(1, vec![]));
        let p = pipeline(base.path(), ScriptedGenerator(reply("void loop() {", "broken")), builder);

        let failure = p.compile(&request()).await.failure().cloned().unwrap();
        assert_eq!(failure.stage, Stage::Build);
        assert_eq!(failure.message, "compilation failed");
        assert_eq!(failure.context.exit_code, Some(1));
        assert_eq!(failure.context.stderr.as_deref(), Some("syntax error line 3"));
        assert_eq!(failure.context.code.as_deref(), Some("void loop() {"));
        assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 0);
    }

    struct StalledBuilder;

    #[async_trait]
    impl BuildInvoker for StalledBuilder {
        async fn build(
            &self,
            _source_dir: &Path,
            _build_dir: &Path,
            _target: &str,
        ) -> Result<BuildResult, PipelineError> {
            Err(PipelineError::BuildTimeout {
                limit: std::time::Duration::from_secs(300),
                stdout: "Compiling core...\n".into(),
                stderr: "warning: slow disk\n".into(),
            })
        }
    }

    #[tokio::test]
    async fn timeout_failure_keeps_partial_output() {
        let base = tempdir().unwrap();
        let p = Pipeline::new(
            Arc::new(ScriptedGenerator(reply("void loop() {}", "x"))),
            Arc::new(StalledBuilder),
            WorkspaceManager::new(base.path(), "sketch", "ino"),
            ArtifactLocator::default(),
        );

        let failure = p.compile(&request()).await.failure().cloned().unwrap();
        assert_eq!(failure.stage, Stage::Build);
        assert!(failure.message.contains("timeout"));
        assert_eq!(failure.context.stdout.as_deref(), Some("Compiling core...\n"));
        assert_eq!(failure.context.stderr.as_deref(), Some("warning: slow disk\n"));
        assert_eq!(failure.context.exit_code, None);
        assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn missing_artifact_fails_at_locate() {
        let base = tempdir().unwrap();
        let builder = Arc::new(RecordingBuilder::new(0, vec![("sketch.ino.elf", vec![7])]));
        let p = pipeline(base.path(), ScriptedGenerator(reply("void loop() {}", "x")), builder);

        let failure = p.compile(&request()).await.failure().cloned().unwrap();
        assert_eq!(failure.stage, Stage::Locate);
        assert!(failure.context.build_dir.is_some());
        assert_eq!(failure.context.stdout.as_deref(), Some("Sketch uses 924 bytes"));
        assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 0);
    }

    #[test]
    fn result_serializes_with_status_tag() {
        let failure = PipelineResult::Failure(StageFailure {
            stage: Stage::Parse,
            message: "bad".into(),
            context: PartialContext {
                raw: Some("sorry".into()),
                ..PartialContext::default()
            },
        });
        let value = serde_json::to_value(&failure).unwrap();
        assert_eq!(value["status"], "failure");
        assert_eq!(value["stage"], "parse");
        assert_eq!(value["context"]["raw"], "sorry");
        assert!(value["context"].get("stdout").is_none());

        let back: PipelineResult = serde_json::from_value(value).unwrap();
        assert_eq!(back, failure);
    }
}
