//! HTTP server command — `firmforge serve`.

use std::path::Path;

use anyhow::{Result, bail};

use firmforge::config::Settings;

pub async fn cmd_serve(
    config_path: Option<&Path>,
    host: Option<String>,
    port: Option<u16>,
    cors: bool,
) -> Result<()> {
    let mut settings = Settings::resolve(config_path)?;
    if let Some(host) = host {
        settings.server.host = host;
    }
    if let Some(port) = port {
        settings.server.port = port;
    }
    settings.server.cors |= cors;

    let problems = settings.validate();
    if !problems.is_empty() {
        bail!("Invalid configuration:\n  - {}", problems.join("\n  - "));
    }
    if settings.llm.api_key.is_none() {
        tracing::warn!("OPENAI_API_KEY is not set; generation requests will be unauthenticated");
    }

    let pipeline = settings.pipeline()?;
    firmforge::server::start_server(pipeline, &settings.server).await
}
