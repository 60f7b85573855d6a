//! Run command implementation.

use crate::config::CliConfig;
use anyhow::{Context, Result};
use colored::Colorize;
use spindle_orchestrator::{RunExecutor, RunReport};
use spindle_training::{RunConfig, RunMode};

pub async fn execute(config: RunConfig, cli_config: &CliConfig, json_output: bool) -> Result<()> {
    config.validate()?;
    let mode = config.mode;

    let executor = RunExecutor::new(config).with_default_cluster_size(cli_config.cluster_size);
    let report = executor.execute().await.with_context(|| format!("{mode} run failed"))?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    print_report(&report);
    Ok(())
}

fn print_report(report: &RunReport) {
    let cluster = &report.cluster;
    let title = match report.mode {
        RunMode::Train => "Training complete",
        RunMode::Inference => "Inference complete",
    };

    println!();
    println!("{}", title.bold().green());
    println!("  Run:      {}", report.run_id.to_string().cyan());
    println!(
        "  Cluster:  {} workers, {} parameter servers ({} input)",
        cluster.workers, cluster.parameter_servers, report.input_mode
    );
    println!(
        "  Records:  {} fed, {} consumed, {} drained",
        cluster.records_submitted, cluster.records_consumed, cluster.records_drained
    );
    if report.mode == RunMode::Train {
        let loss = cluster.final_loss.map_or_else(|| "-".to_string(), |l| format!("{l:.4}"));
        println!("  Steps:    {} (last loss {})", cluster.global_step, loss);
    }
    if let Some(lines) = report.prediction_lines {
        println!("  Predictions: {}", lines.to_string().cyan());
    }

    println!();
    println!("{}", report.artifact_dir.display().to_string().bold());
    for entry in &report.artifacts {
        let size = if entry.is_dir { "-".to_string() } else { entry.size.to_string() };
        println!("  {:<24} {:>10}", entry.name, size.dimmed());
    }
    println!();
}
