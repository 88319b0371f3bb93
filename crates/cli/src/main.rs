//! Node QoS Guard CLI
//!
//! A command-line tool for inspecting a running QoS agent, toggling its
//! pipeline valves and replaying snapshot files through the engine offline.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::valve::PipelineName;
use commands::{replay, status, valve};
use std::path::PathBuf;

/// Node QoS Guard CLI
#[derive(Parser)]
#[command(name = "qosctl")]
#[command(author, version, about = "CLI for Node QoS Guard", long_about = None)]
pub struct Cli {
    /// Agent API URL (can also be set via QOSCTL_API_URL env var)
    #[arg(long, env = "QOSCTL_API_URL")]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short, value_enum)]
    pub format: Option<output::OutputFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the latest cycle status of the agent
    Status,

    /// Inspect or toggle a pipeline valve
    #[command(subcommand)]
    Valve(ValveCommands),

    /// Run a snapshot file through both pipelines offline
    Replay {
        /// JSON lines file with one usage snapshot per line
        file: PathBuf,

        /// Engine configuration (flat JSON object)
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum ValveCommands {
    /// Show whether the valve is open
    Get {
        #[arg(value_enum)]
        pipeline: PipelineName,
    },

    /// Open the valve
    Enable {
        #[arg(value_enum)]
        pipeline: PipelineName,
    },

    /// Close the valve
    Disable {
        #[arg(value_enum)]
        pipeline: PipelineName,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = config::Config::load()?;
    let format = settings.resolve_format(cli.format);

    match cli.command {
        Commands::Status => {
            let client = client::ApiClient::new(&settings.resolve_api_url(cli.api_url))?;
            status::show_status(&client, format).await?;
        }
        Commands::Valve(valve_cmd) => {
            let client = client::ApiClient::new(&settings.resolve_api_url(cli.api_url))?;
            match valve_cmd {
                ValveCommands::Get { pipeline } => {
                    valve::get_valve(&client, pipeline, format).await?;
                }
                ValveCommands::Enable { pipeline } => {
                    valve::set_valve(&client, pipeline, true, format).await?;
                }
                ValveCommands::Disable { pipeline } => {
                    valve::set_valve(&client, pipeline, false, format).await?;
                }
            }
        }
        Commands::Replay { file, config } => {
            replay::replay(&file, config.as_deref(), format).await?;
        }
    }

    Ok(())
}
