//! Offline replay of a snapshot file through both pipelines

use anyhow::{Context, Result};
use colored::Colorize;
use qos_core::ingest::{JsonLinesSource, UsageSource};
use qos_core::{
    ControlBus, CorrectionAction, EstimatorPipelineBuilder, QosConfig, QosPipelineBuilder,
    UsageSnapshot, WorkloadId,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tabled::Tabled;

use crate::output::{
    color_count, format_slack, print_info, print_json, print_success, print_table, print_warning,
    OutputFormat,
};

/// Outcome of one replayed cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub timestamp: f64,
    pub contentions: usize,
    pub corrections: Vec<CorrectionAction>,
    pub slack_cpus: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayReport {
    pub cycles: Vec<CycleReport>,
    /// Every terminated workload, in order of first termination
    pub terminated: Vec<WorkloadId>,
}

#[derive(Tabled, Serialize)]
struct CycleRow {
    #[tabled(rename = "Cycle")]
    cycle: u64,
    #[tabled(rename = "Timestamp")]
    timestamp: String,
    #[tabled(rename = "Contentions")]
    contentions: usize,
    #[tabled(rename = "Corrections")]
    corrections: String,
    #[tabled(rename = "Slack")]
    slack: String,
}

/// Load an engine configuration file (flat JSON object)
pub fn load_engine_config(path: &Path) -> Result<QosConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read engine config {}", path.display()))?;
    serde_json::from_str(&content).context("Failed to parse engine config")
}

/// Run every snapshot through fresh pipelines sharing one control bus
pub fn replay_snapshots(snapshots: &[UsageSnapshot], config: &QosConfig) -> Result<ReplayReport> {
    let bus = Arc::new(ControlBus::new());
    let qos = QosPipelineBuilder::new()
        .with_config(config.clone())
        .with_bus(bus.clone())
        .build()?;
    let estimator = EstimatorPipelineBuilder::new()
        .with_config(config.clone())
        .with_bus(bus)
        .build()?;

    let mut report = ReplayReport::default();
    for (index, snapshot) in snapshots.iter().enumerate() {
        let mut errors = Vec::new();

        let (contentions, corrections) = match qos.run(snapshot) {
            Ok(Some(actions)) => (qos.last_contentions(), actions),
            Ok(None) => (0, Vec::new()),
            Err(e) => {
                errors.push(format!("qos: {}", e));
                (0, Vec::new())
            }
        };
        let slack_cpus = match estimator.run(snapshot) {
            Ok(estimate) => estimate.map(|e| e.cpus),
            Err(e) => {
                errors.push(format!("estimator: {}", e));
                None
            }
        };

        for action in &corrections {
            if !report.terminated.contains(&action.target) {
                report.terminated.push(action.target.clone());
            }
        }
        report.cycles.push(CycleReport {
            cycle: index as u64 + 1,
            timestamp: snapshot.timestamp,
            contentions,
            corrections,
            slack_cpus,
            error: (!errors.is_empty()).then(|| errors.join("; ")),
        });
    }

    Ok(report)
}

async fn read_snapshots(path: &Path) -> Result<Vec<UsageSnapshot>> {
    let source = JsonLinesSource::new(path);
    let mut snapshots = Vec::new();
    while let Some(snapshot) = source.next_snapshot().await? {
        snapshots.push(snapshot);
    }
    Ok(snapshots)
}

/// Replay a snapshot file and print one row per cycle plus a summary
pub async fn replay(file: &Path, config: Option<&Path>, format: OutputFormat) -> Result<()> {
    let engine_config = match config {
        Some(path) => load_engine_config(path)?,
        None => QosConfig::default(),
    };
    let snapshots = read_snapshots(file).await?;
    if snapshots.is_empty() {
        print_warning("No snapshots found");
        return Ok(());
    }

    let report = replay_snapshots(&snapshots, &engine_config)?;

    if let OutputFormat::Json = format {
        print_json(&report);
        return Ok(());
    }

    let rows: Vec<CycleRow> = report
        .cycles
        .iter()
        .map(|c| CycleRow {
            cycle: c.cycle,
            timestamp: format!("{:.1}", c.timestamp),
            contentions: c.contentions,
            corrections: match &c.error {
                Some(e) => e.red().to_string(),
                None => color_count(c.corrections.len()),
            },
            slack: format_slack(c.slack_cpus),
        })
        .collect();
    print_table(&rows, format);

    println!();
    print_info(&format!("Replayed {} snapshots", report.cycles.len()));
    if report.terminated.is_empty() {
        print_success("No workload was terminated");
    } else {
        println!("{}", "Terminated workloads".bold());
        for id in &report.terminated {
            println!("  {}", id.to_string().red());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use qos_core::config::keys;
    use qos_core::{WorkloadSample, WorkloadStats};
    use std::io::Write;

    fn node(ts: f64, pr_secs: f64, be_secs: f64) -> UsageSnapshot {
        let stats = |secs: f64, limit: f64| {
            WorkloadStats::at(ts)
                .with_cpu_time(secs, 0.0)
                .with_cpus_limit(limit)
        };
        UsageSnapshot::new(
            ts,
            vec![
                WorkloadSample::new(WorkloadId::new("fw", "pr"))
                    .production(4.0)
                    .with_stats(stats(pr_secs, 4.0)),
                WorkloadSample::new(WorkloadId::new("fw", "be"))
                    .best_effort(1.0)
                    .with_stats(stats(be_secs, 1.0)),
            ],
        )
        .with_total_cpus(8.0)
    }

    #[test]
    fn test_replay_reports_overload_correction() {
        let config = QosConfig::new().with(keys::NEW_EXECUTOR_THRESHOLD_SEC, 0.0);
        let snapshots = vec![node(1.0, 0.0, 0.0), node(2.0, 3.0, 3.0), node(3.0, 4.0, 4.0)];

        let report = replay_snapshots(&snapshots, &config).unwrap();

        assert_eq!(report.cycles.len(), 3);
        assert!(report.cycles[0].corrections.is_empty());
        assert_eq!(report.cycles[1].contentions, 1);
        assert_eq!(
            report.cycles[1].corrections,
            vec![CorrectionAction::terminate(WorkloadId::new("fw", "be"))]
        );
        // Overload corrections do not pause the estimator
        assert_eq!(report.cycles[1].slack_cpus, Some(1.0));
        assert_eq!(report.cycles[2].slack_cpus, Some(3.0));
        assert_eq!(report.terminated, vec![WorkloadId::new("fw", "be")]);
        assert!(report.cycles.iter().all(|c| c.error.is_none()));
    }

    #[test]
    fn test_invalid_engine_config_fails_replay() {
        let config = QosConfig::new().with(keys::CPU_STRATEGY, "magic");
        assert!(replay_snapshots(&[node(1.0, 0.0, 0.0)], &config).is_err());
    }

    #[tokio::test]
    async fn test_reads_snapshot_file_and_engine_config() {
        let mut snapshots = tempfile::NamedTempFile::new().unwrap();
        for snapshot in [node(1.0, 0.0, 0.0), node(2.0, 0.5, 0.5)] {
            writeln!(snapshots, "{}", serde_json::to_string(&snapshot).unwrap()).unwrap();
        }
        snapshots.flush().unwrap();

        let mut config = tempfile::NamedTempFile::new().unwrap();
        write!(config, r#"{{"drop_detector": "rolling", "window_size": 5}}"#).unwrap();
        config.flush().unwrap();

        let loaded = read_snapshots(snapshots.path()).await.unwrap();
        assert_eq!(loaded.len(), 2);

        let engine = load_engine_config(config.path()).unwrap();
        assert_eq!(engine.get_str(keys::DROP_DETECTOR), Some("rolling"));
        assert_eq!(engine.get_i64(keys::WINDOW_SIZE), Some(5));
    }
}
