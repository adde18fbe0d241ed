//! One-shot local compile — `firmforge compile`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use console::style;

use firmforge::config::Settings;
use firmforge::encode;
use firmforge::pipeline::{CompileRequest, PipelineResult};

/// Run one request and report it. Returns whether the pipeline succeeded.
pub async fn cmd_compile(
    config_path: Option<&Path>,
    instruction: &str,
    board: &str,
    output: Option<&Path>,
    json: bool,
) -> Result<bool> {
    let settings = Settings::resolve(config_path)?;
    let problems = settings.validate();
    if !problems.is_empty() {
        bail!("Invalid configuration:\n  - {}", problems.join("\n  - "));
    }

    let request = CompileRequest::new(instruction, board);
    if let Err(msg) = request.validate() {
        bail!(msg);
    }

    let pipeline = settings.pipeline()?;
    let result = pipeline.compile(&request).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(result.is_success());
    }

    match result {
        PipelineResult::Success(firmware) => {
            println!();
            println!("{}", style("Explanation").bold().cyan());
            println!("{}", firmware.explanation);
            println!();
            println!("{}", style("Code").bold().cyan());
            println!("{}", firmware.code);
            println!();

            let bytes = encode::decode(&firmware.artifact_base64)
                .context("Encoded artifact is not valid base64")?;
            let path = output
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(&firmware.artifact_name));
            std::fs::write(&path, &bytes)
                .with_context(|| format!("Failed to write {}", path.display()))?;

            println!(
                "{} {} ({} bytes)",
                style("Wrote").green().bold(),
                path.display(),
                bytes.len()
            );
            Ok(true)
        }
        PipelineResult::Failure(failure) => {
            eprintln!(
                "{} {} stage: {}",
                style("Error:").red().bold(),
                failure.stage,
                failure.message
            );
            if let Some(raw) = &failure.context.raw {
                eprintln!();
                eprintln!("{}", style("Model output").dim());
                eprintln!("{}", raw);
            }
            if let Some(stderr) = failure.context.stderr.as_deref().filter(|s| !s.is_empty()) {
                eprintln!();
                eprintln!("{}", style("Toolchain stderr").dim());
                eprintln!("{}", stderr);
            }
            Ok(false)
        }
    }
}
