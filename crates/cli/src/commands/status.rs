//! Agent cycle status

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{
    color_count, color_phase, color_valve, format_slack, format_timestamp, print_json,
    print_warning, OutputFormat,
};

/// Row for the observers table
#[derive(Tabled)]
struct ObserverRow {
    #[tabled(rename = "Observer")]
    name: String,
    #[tabled(rename = "Phase")]
    phase: String,
}

/// Show the latest cycle status of the agent
pub async fn show_status(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let status = client.status().await?;

    match format {
        OutputFormat::Json => print_json(&status),
        OutputFormat::Table => {
            println!("{}", "Agent Status".bold());
            println!("{}", "=".repeat(40));

            if status.cycles == 0 {
                print_warning("No cycle completed yet");
                return Ok(());
            }

            println!("Cycles:           {}", status.cycles);
            if let Some(ts) = status.last_snapshot_timestamp {
                println!("Last snapshot:    {}", format_timestamp(ts).cyan());
            }
            println!("Workloads:        {}", status.workloads);
            println!(
                "Corrections:      {} last cycle, {} total",
                color_count(status.last_corrections.len()),
                status.total_corrections
            );
            println!(
                "Slack cpus:       {}",
                format_slack(status.last_slack.as_ref().map(|s| s.cpus))
            );
            println!("QoS valve:        {}", color_valve(status.qos_valve_open));
            println!("Estimator valve:  {}", color_valve(status.estimator_valve_open));

            for action in &status.last_corrections {
                println!("  {} {}", "terminate".red(), action.target);
            }
            if let Some(error) = &status.last_sink_error {
                print_warning(&format!(
                    "Sink failed in {} cycles, last error: {}",
                    status.sink_failures, error
                ));
            }

            if !status.observers.is_empty() {
                println!();
                let rows: Vec<ObserverRow> = status
                    .observers
                    .iter()
                    .map(|o| ObserverRow {
                        name: o.name.clone(),
                        phase: color_phase(&o.phase),
                    })
                    .collect();
                let table = tabled::Table::new(rows)
                    .with(tabled::settings::Style::rounded())
                    .to_string();
                println!("{}", table);
            }
        }
    }

    Ok(())
}
