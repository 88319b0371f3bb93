//! Pipeline valve commands

use anyhow::Result;
use clap::ValueEnum;

use crate::client::ApiClient;
use crate::output::{color_valve, print_json, print_success, OutputFormat};

/// Pipeline a valve belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PipelineName {
    Qos,
    Estimator,
}

impl PipelineName {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineName::Qos => "qos",
            PipelineName::Estimator => "estimator",
        }
    }
}

/// Show whether a pipeline valve is open
pub async fn get_valve(client: &ApiClient, pipeline: PipelineName, format: OutputFormat) -> Result<()> {
    let valve = client.valve(pipeline.as_str()).await?;

    match format {
        OutputFormat::Json => print_json(&valve),
        OutputFormat::Table => println!("{} valve: {}", valve.pipeline, color_valve(valve.enabled)),
    }
    Ok(())
}

/// Open or close a pipeline valve
pub async fn set_valve(
    client: &ApiClient,
    pipeline: PipelineName,
    enabled: bool,
    format: OutputFormat,
) -> Result<()> {
    let valve = client.set_valve(pipeline.as_str(), enabled).await?;

    match format {
        OutputFormat::Json => print_json(&valve),
        OutputFormat::Table => print_success(&format!(
            "{} valve is now {}",
            valve.pipeline,
            color_valve(valve.enabled)
        )),
    }
    Ok(())
}
