//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use serde::{Deserialize, Serialize};
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print a table from a list of items
pub fn print_table<T: Tabled + Serialize>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                println!("{}", "No items found".yellow());
                return;
            }
            let table = Table::new(items).with(Style::rounded()).to_string();
            println!("{}", table);
        }
        OutputFormat::Json => print_json(&items),
    }
}

/// Print any serializable value as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => print_error(&format!("Failed to serialize output: {}", e)),
    }
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format a snapshot timestamp (seconds) as UTC time
pub fn format_timestamp(timestamp: f64) -> String {
    let secs = timestamp.floor() as i64;
    let nanos = ((timestamp - timestamp.floor()) * 1e9) as u32;
    chrono::DateTime::from_timestamp(secs, nanos)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| format!("{:.3}", timestamp))
}

/// Format an optional slack estimate in cpus
pub fn format_slack(cpus: Option<f64>) -> String {
    match cpus {
        Some(cpus) => format!("{:.2}", cpus),
        None => "-".to_string(),
    }
}

/// Color a valve state
pub fn color_valve(enabled: bool) -> String {
    if enabled {
        "open".green().to_string()
    } else {
        "closed".red().to_string()
    }
}

/// Color an observer phase
pub fn color_phase(phase: &str) -> String {
    match phase {
        "idle" => phase.green().to_string(),
        "collecting" | "deciding" => phase.blue().to_string(),
        "cooling_down" => phase.yellow().to_string(),
        _ => phase.to_string(),
    }
}

/// Color a correction count
pub fn color_count(count: usize) -> String {
    if count == 0 {
        count.to_string()
    } else {
        count.to_string().red().bold().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0.0), "1970-01-01 00:00:00");
        assert_eq!(format_timestamp(86_400.5), "1970-01-02 00:00:00");
    }

    #[test]
    fn test_format_slack() {
        assert_eq!(format_slack(Some(1.234)), "1.23");
        assert_eq!(format_slack(None), "-");
    }
}
