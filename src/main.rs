use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cmd;

#[derive(Parser)]
#[command(name = "firmforge")]
#[command(version, about = "Compile English instructions into microcontroller firmware")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to firmforge.toml (defaults to ./firmforge.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the compile API over HTTP
    Serve {
        /// Interface to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Allow cross-origin requests from any origin
        #[arg(long)]
        cors: bool,
    },
    /// Run one instruction through the pipeline
    Compile {
        /// What the firmware should do, in plain English
        instruction: String,

        /// Fully qualified board name, e.g. arduino:avr:uno
        #[arg(short, long, default_value = "arduino:avr:uno")]
        board: String,

        /// Where to write the binary image (defaults to its file name)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print the full result as JSON instead of writing the image
        #[arg(long)]
        json: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any problems
    Validate,
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "firmforge=debug,tower_http=debug"
    } else {
        "firmforge=info,tower_http=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Serve { host, port, cors } => {
            cmd::cmd_serve(cli.config.as_deref(), host.clone(), *port, *cors).await?;
        }
        Commands::Compile {
            instruction,
            board,
            output,
            json,
        } => {
            let ok = cmd::cmd_compile(
                cli.config.as_deref(),
                instruction,
                board,
                output.as_deref(),
                *json,
            )
            .await?;
            if !ok {
                std::process::exit(1);
            }
        }
        Commands::Config { command } => cmd::cmd_config(cli.config.as_deref(), command.clone())?,
    }

    Ok(())
}
