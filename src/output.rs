//! Console output: status lines, a single resource's JSON, and the
//! hydration stats table, grounded in `octofhir-cli`'s `output.rs`
//! (`colored` for status lines, `tabled` for tables).

use colored::Colorize;
use serde_json::Value;
use tabled::builder::Builder;
use tabled::settings::Style;

use crate::hydrate::TaskStats;

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

pub fn print_warning(msg: &str) {
    eprintln!("{} {}", "!".yellow(), msg);
}

/// Pretty-prints a single fetched resource (the `single` subcommand).
pub fn print_resource(value: &Value) {
    let rt = value.get("resourceType").and_then(|v| v.as_str()).unwrap_or("Resource");
    let id = value.get("id").and_then(|v| v.as_str()).unwrap_or("-");
    println!("{} {}/{}", "Resource:".cyan(), rt.cyan(), id.cyan());
    println!("{}", serde_json::to_string_pretty(value).unwrap());
}

/// Prints a hydration task's results, at both resource and item (attachment/
/// reference) granularity when they differ — matches the original's
/// `TaskStats.print`.
pub fn print_task_stats(task_name: &str, adjective: &str, resource_header: &str, item_header: Option<&str>, stats: &TaskStats) {
    println!("{}", format!("{task_name}:").cyan().bold());

    let mut builder = Builder::default();
    match item_header {
        Some(item_header) => {
            builder.push_record(["", resource_header, item_header]);
            builder.push_record(["Total examined", &stats.total_resources.to_string(), &stats.total.to_string()]);
            if stats.already_done > 0 {
                builder.push_record([
                    &format!("Already {adjective}"),
                    &stats.already_done_resources.to_string(),
                    &stats.already_done.to_string(),
                ]);
            }
            builder.push_record([
                &format!("Newly {adjective}"),
                &stats.newly_done_resources.to_string(),
                &stats.newly_done.to_string(),
            ]);
            if stats.fatal_errors > 0 {
                builder.push_record(["Fatal errors", &stats.fatal_errors_resources.to_string(), &stats.fatal_errors.to_string()]);
            }
            if stats.retry_errors > 0 {
                builder.push_record([
                    "Retried but gave up",
                    &stats.retry_errors_resources.to_string(),
                    &stats.retry_errors.to_string(),
                ]);
            }
        }
        None => {
            builder.push_record(["", resource_header]);
            builder.push_record(["Total examined", &stats.total.to_string()]);
            if stats.already_done > 0 {
                builder.push_record([&format!("Already {adjective}"), &stats.already_done.to_string()]);
            }
            builder.push_record([&format!("Newly {adjective}"), &stats.newly_done.to_string()]);
            if stats.fatal_errors > 0 {
                builder.push_record(["Fatal errors", &stats.fatal_errors.to_string()]);
            }
            if stats.retry_errors > 0 {
                builder.push_record(["Retried but gave up", &stats.retry_errors.to_string()]);
            }
        }
    }

    println!("{}", builder.build().with(Style::rounded()));
}

/// `cli_utils.py::human_file_size` — byte counts for status lines only, not
/// parsed data.
pub fn human_file_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;
    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }
    if unit_index == 0 {
        format!("{bytes} {}", UNITS[0])
    } else {
        format!("{size:.1} {}", UNITS[unit_index])
    }
}

/// `cli_utils.py::human_time_offset` — coarse duration formatting for status
/// lines (e.g. "2h 15m", "45s").
pub fn human_time_offset(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {secs}s")
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_file_size_picks_appropriate_unit() {
        assert_eq!(human_file_size(512), "512 B");
        assert_eq!(human_file_size(2048), "2.0 KB");
        assert_eq!(human_file_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn human_time_offset_formats_by_magnitude() {
        assert_eq!(human_time_offset(45), "45s");
        assert_eq!(human_time_offset(125), "2m 5s");
        assert_eq!(human_time_offset(7500), "2h 5m");
    }
}
