//! Command handlers.

use crate::commands::{Commands, QueueCommands};
use crate::config::{CliConfig, OutputFormat};
use anyhow::{Context, Result};
use console::{StyledObject, style};
use ember_core::queue::QueueStats;
use ember_core::quota::{QuotaStatus, QuotaWindow};
use ember_core::warming::{ScheduleResult, WarmingRequest, WarmingResult};
use ember_db::{Database, PgCacheStore, PgUsageLog, PgWarmingQueue};
use ember_engine::{ControlPlane, HttpExplorerFetcher, MaintenanceReport, SystemStats};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Errors listed under a warming summary before the rest are elided.
const MAX_LISTED_ERRORS: usize = 10;

pub async fn run(command: Commands, config: &CliConfig, output: OutputFormat) -> Result<()> {
    match command {
        Commands::Warm {
            strategies,
            addresses,
            network,
            budget,
            cache_type,
        } => {
            let network = config.network_or_default(network.as_deref()).to_string();
            let cache_type = cache_type.unwrap_or(config.engine.warmer.default_cache_type);
            let request = if addresses.is_empty() {
                WarmingRequest::strategies(network, strategies, budget)
            } else {
                WarmingRequest::addresses(network, addresses, budget)
            }
            .with_cache_type(cache_type);

            let result = connect(config).await?.warm(&request).await?;
            emit(output, &result, print_warming_result)
        }
        Commands::Stats { network } => {
            let stats = connect(config).await?.stats(network.as_deref()).await?;
            emit(output, &stats, print_stats)
        }
        Commands::Quota { network } => {
            let windows = connect(config).await?.quota(network.as_deref()).await?;
            emit(output, &windows, |w| print_quota(w))
        }
        Commands::Cleanup { aggressive } => {
            let report = connect(config).await?.cleanup(aggressive).await?;
            emit(output, &report, print_cleanup)
        }
        Commands::Queue { command } => {
            let control = connect(config).await?;
            queue(&control, config, command, output).await
        }
        Commands::Migrate => migrate(config, output).await,
    }
}

async fn queue(
    control: &ControlPlane,
    config: &CliConfig,
    command: QueueCommands,
    output: OutputFormat,
) -> Result<()> {
    match command {
        QueueCommands::Pause => {
            control.pause_queue().await?;
            emit(output, &json!({ "paused": true }), |_| {
                println!("{} Warming queue paused", style("✓").green())
            })
        }
        QueueCommands::Resume => {
            control.resume_queue().await?;
            emit(output, &json!({ "paused": false }), |_| {
                println!("{} Warming queue resumed", style("✓").green())
            })
        }
        QueueCommands::ResetStuck => {
            let reset = control.reset_stuck().await?;
            emit(output, &json!({ "reset": reset }), |_| {
                println!("{} Reset {} stuck item(s)", style("✓").green(), reset)
            })
        }
        QueueCommands::Status => {
            let stats = control.queue_status().await?;
            emit(output, &stats, print_queue_stats)
        }
        QueueCommands::Enqueue {
            addresses,
            network,
            priority,
            cache_type,
        } => {
            let network = config.network_or_default(network.as_deref());
            let cache_type = cache_type.unwrap_or(config.engine.warmer.default_cache_type);
            let result = control
                .enqueue(&addresses, network, cache_type, priority)
                .await?;
            emit(output, &result, print_schedule)
        }
        QueueCommands::Process {
            batch_size,
            network,
            priority,
        } => {
            let network = config.network_or_default(network.as_deref());
            let result = control.process_queue(network, batch_size, priority).await?;
            emit(output, &result, print_warming_result)
        }
    }
}

async fn connect(config: &CliConfig) -> Result<ControlPlane> {
    let db = Database::connect(config.database_url()?)
        .await
        .context("connecting to database")?;
    let pool = db.pool().clone();
    debug!(networks = ?config.explorers.networks.keys().collect::<Vec<_>>(), "connected to database");

    let cache = Arc::new(PgCacheStore::new(pool.clone()).with_policy(config.engine.cache.clone()));
    let queue = Arc::new(PgWarmingQueue::new(pool.clone()).with_policy(config.engine.queue.clone()));
    let usage = Arc::new(PgUsageLog::new(pool));
    let fetcher = Arc::new(HttpExplorerFetcher::new(&config.explorers)?);

    Ok(ControlPlane::new(
        cache,
        queue,
        usage,
        fetcher,
        config.engine.clone(),
    ))
}

async fn migrate(config: &CliConfig, output: OutputFormat) -> Result<()> {
    let db = Database::connect(config.database_url()?)
        .await
        .context("connecting to database")?;
    db.migrate().await?;
    emit(output, &json!({ "migrated": true }), |_| {
        println!("{} Database migrations applied", style("✓").green())
    })
}

fn emit<T: Serialize>(output: OutputFormat, value: &T, table: impl FnOnce(&T)) -> Result<()> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Table => table(value),
    }
    Ok(())
}

fn print_warming_result(result: &WarmingResult) {
    println!(
        "{} Warming finished in {:.1}s",
        style("✓").green(),
        result.time_taken_seconds
    );
    println!(
        "  API calls: {} of {} allowed",
        style(result.api_calls_used).bold(),
        result.allowance
    );
    println!(
        "  Successful: {}  Failed: {}  Already cached: {}  Skipped (quota): {}  Skipped (deadline): {}",
        style(result.successful).green(),
        style(result.failed).red(),
        result.already_cached,
        result.skipped_quota,
        result.skipped_deadline
    );

    if !result.strategies_executed.is_empty() {
        println!();
        println!(
            "  {:<16} {:>10} {:>10} {:>8} {:>8} {:>8}",
            style("STRATEGY").bold(),
            "CANDIDATES",
            "SUCCESSFUL",
            "FAILED",
            "CACHED",
            "SKIPPED"
        );
        for (name, counts) in &result.strategies_executed {
            println!(
                "  {:<16} {:>10} {:>10} {:>8} {:>8} {:>8}",
                name,
                counts.candidates,
                counts.successful,
                counts.failed,
                counts.already_cached,
                counts.skipped_quota + counts.skipped_deadline
            );
        }
    }

    if !result.errors.is_empty() {
        println!();
        println!("  {}", style("Errors").red().bold());
        for error in result.errors.iter().take(MAX_LISTED_ERRORS) {
            println!("    {} {}", style(&error.address).dim(), error.message);
        }
        if result.errors.len() > MAX_LISTED_ERRORS {
            println!("    ... and {} more", result.errors.len() - MAX_LISTED_ERRORS);
        }
    }
}

fn print_stats(stats: &SystemStats) {
    let cache = &stats.cache;
    println!("{}", style("Cache").bold());
    println!(
        "  Entries: {} ({} active, {} expired, {} low quality)",
        cache.total_entries, cache.active_entries, cache.expired_entries, cache.low_quality_entries
    );
    println!("  Average quality: {:.2}", cache.avg_quality);
    println!(
        "  Hits: {}  API calls saved: {}  Size: {}",
        cache.total_hits,
        cache.total_api_calls_saved,
        format_bytes(cache.total_size_bytes)
    );
    println!();

    print_queue_stats(&stats.queue);
    println!();
    print_quota(&stats.quota);

    if !stats.recommendations.is_empty() {
        println!();
        println!("{}", style("Recommendations").bold());
        for recommendation in &stats.recommendations {
            println!("  {} {}", style("!").yellow(), recommendation);
        }
    }
}

fn print_queue_stats(stats: &QueueStats) {
    let state = if stats.paused {
        style("paused").yellow()
    } else {
        style("running").green()
    };
    println!("{} ({})", style("Warming queue").bold(), state);
    println!(
        "  Pending: {}  Processing: {}  Completed: {}  Failed: {}",
        stats.pending, stats.processing, stats.completed, stats.failed
    );
    println!(
        "  Success rate: {:.1}%  Avg processing: {:.1}s  Est. drain time: {:.0}s",
        stats.success_rate, stats.avg_processing_seconds, stats.estimated_queue_seconds
    );
    if !stats.by_priority.is_empty() {
        let parts: Vec<String> = stats
            .by_priority
            .iter()
            .map(|(priority, count)| format!("{priority}={count}"))
            .collect();
        println!("  Pending by priority: {}", parts.join(" "));
    }
    if !stats.by_network.is_empty() {
        let parts: Vec<String> = stats
            .by_network
            .iter()
            .map(|(network, count)| format!("{network}={count}"))
            .collect();
        println!("  Pending by network: {}", parts.join(" "));
    }
}

fn print_quota(windows: &[QuotaWindow]) {
    if windows.is_empty() {
        println!("{} No quota data", style("i").blue());
        return;
    }

    println!(
        "{:<12} {:<14} {:>10} {:>10} {:>7} {:>6} {:>6} {:<9} {:>8}",
        style("NETWORK").bold(),
        "PROVIDER",
        "USED",
        "LIMIT",
        "USED%",
        "1M",
        "1H",
        "STATUS",
        "HOURS"
    );
    for window in windows {
        let hours = window
            .estimated_hours_remaining
            .map(|h| format!("{h:.1}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<12} {:<14} {:>10} {:>10} {:>6.1}% {:>6} {:>6} {:<9} {:>8}",
            window.network,
            window.provider,
            window.used_today,
            window.daily_limit,
            window.percent_used,
            window.requests_last_minute,
            window.requests_last_hour,
            status_style(window.status),
            hours
        );
    }
}

fn print_cleanup(report: &MaintenanceReport) {
    println!(
        "{} Deleted {} cache entr{} ({} freed)",
        style("✓").green(),
        report.cache.deleted,
        if report.cache.deleted == 1 { "y" } else { "ies" },
        format_bytes(report.cache.bytes_freed)
    );
    println!("  Stuck queue items reset: {}", report.stuck_reset);
    println!("  Finished queue items purged: {}", report.queue_purged);
    println!("  Usage events purged: {}", report.usage_purged);
}

fn print_schedule(result: &ScheduleResult) {
    println!(
        "{} Enqueued {} address(es), {} already queued",
        style("✓").green(),
        result.enqueued,
        result.deduped
    );
}

fn status_style(status: QuotaStatus) -> StyledObject<&'static str> {
    let styled = style(status.as_str());
    match status {
        QuotaStatus::Healthy => styled.green(),
        QuotaStatus::Moderate => styled.cyan(),
        QuotaStatus::Warning => styled.yellow(),
        QuotaStatus::Critical => styled.red().bold(),
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn test_json_output_shape() {
        let result = WarmingResult {
            processed: 2,
            successful: 2,
            ..Default::default()
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["successful"], 2);
        assert!(value["strategies_executed"].is_object());
    }
}
