//! Toolchain invocation.
//!
//! [`BuildInvoker`] is the seam between the pipeline and the external
//! compiler. [`ToolchainInvoker`] is the real implementation: it runs an
//! `arduino-cli`-style program as a child process, bounded by a wall-clock
//! timeout, and captures everything it prints. The toolchain runs in its own
//! process group, and the whole group is killed once the build returns, times
//! out or is abandoned.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::PipelineError;

/// How long to keep reading output after the process group was killed.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Snapshot of one toolchain run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl BuildResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Abstraction over toolchain execution for testability.
/// Real implementation: `ToolchainInvoker`.
#[async_trait]
pub trait BuildInvoker: Send + Sync {
    /// Compile `source_dir` for `target`, writing output under `build_dir`.
    ///
    /// A non-zero exit is reported through [`BuildResult::exit_code`], not as
    /// an error. Errors mean the toolchain could not run to completion.
    async fn build(
        &self,
        source_dir: &Path,
        build_dir: &Path,
        target: &str,
    ) -> Result<BuildResult, PipelineError>;
}

/// Runs `<program> compile <target_flag> <target> --output-dir <build> <source>`.
#[derive(Debug, Clone)]
pub struct ToolchainInvoker {
    program: String,
    target_flag: String,
    timeout: Duration,
}

impl ToolchainInvoker {
    pub fn new(program: impl Into<String>, target_flag: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            target_flag: target_flag.into(),
            timeout,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn command(&self, source_dir: &Path, build_dir: &Path, target: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("compile")
            .arg(&self.target_flag)
            .arg(target)
            .arg("--output-dir")
            .arg(build_dir)
            .arg(source_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout can take down compiler subprocesses too.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

#[async_trait]
impl BuildInvoker for ToolchainInvoker {
    async fn build(
        &self,
        source_dir: &Path,
        build_dir: &Path,
        target: &str,
    ) -> Result<BuildResult, PipelineError> {
        debug!(
            program = %self.program,
            target,
            source = %source_dir.display(),
            output = %build_dir.display(),
            "spawning toolchain"
        );

        let mut child = self
            .command(source_dir, build_dir, target)
            .spawn()
            .map_err(|source| PipelineError::BuildInvocation {
                program: self.program.clone(),
                source,
            })?;
        let mut group = ProcessGroup::new(child.id());

        let mut stdout = OutputCapture::spawn(child.stdout.take());
        let mut stderr = OutputCapture::spawn(child.stderr.take());

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status.map_err(|source| PipelineError::BuildInvocation {
                program: self.program.clone(),
                source,
            })?,
            Err(_) => {
                warn!(
                    program = %self.program,
                    limit_secs = self.timeout.as_secs(),
                    "toolchain exceeded time limit, killing"
                );
                terminate(&mut child, &mut group).await;
                let drain = Instant::now() + DRAIN_GRACE;
                stdout.drain_until(drain).await;
                stderr.drain_until(drain).await;
                return Err(PipelineError::BuildTimeout {
                    limit: self.timeout,
                    stdout: stdout.take(),
                    stderr: stderr.take(),
                });
            }
        };

        // Whatever is left in the group was backgrounded by the toolchain and
        // may still hold the output pipes open.
        group.kill();
        let drain = Instant::now() + DRAIN_GRACE;
        stdout.drain_until(drain).await;
        stderr.drain_until(drain).await;

        let exit_code = status.code().unwrap_or(-1);
        info!(exit_code, "toolchain finished");

        Ok(BuildResult {
            exit_code,
            stdout: stdout.take(),
            stderr: stderr.take(),
        })
    }
}

/// Accumulates one output stream of the toolchain.
///
/// Bytes land in a shared buffer as they are read, so whatever was printed
/// before a kill is still available.
struct OutputCapture {
    buf: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl OutputCapture {
    fn spawn<R>(stream: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let task = tokio::spawn(async move {
            let Some(mut stream) = stream else {
                return;
            };
            let mut chunk = [0u8; 8192];
            loop {
                match stream.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => sink
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .extend_from_slice(&chunk[..n]),
                    Err(e) => {
                        warn!(error = %e, "failed to read toolchain output");
                        break;
                    }
                }
            }
        });
        Self { buf, task }
    }

    /// Wait for end of stream, giving up at `deadline`.
    async fn drain_until(&mut self, deadline: Instant) {
        if tokio::time::timeout_at(deadline, &mut self.task).await.is_err() {
            warn!("toolchain output still open after its process group was killed");
            self.task.abort();
        }
    }

    fn take(&self) -> String {
        let bytes = std::mem::take(&mut *self.buf.lock().unwrap_or_else(PoisonError::into_inner));
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Drop for OutputCapture {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The toolchain's process group. Killed on drop unless already killed, which
/// covers a build future abandoned mid-run.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    /// SIGKILL every process in the group. Later calls do nothing.
    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_process_group(pgid);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Kill the child's process group and the child itself, then reap it.
async fn terminate(child: &mut Child, group: &mut ProcessGroup) {
    group.kill();
    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill toolchain process");
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    // SAFETY: killpg only sends a signal. The group id equals the child's pid
    // because the child was spawned with process_group(0).
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid, "killpg found no process group");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}
