//! Generate command implementation.

use anyhow::{Context, Result};
use colored::Colorize;
use spindle_training::write_csv_dataset;
use std::path::Path;

pub fn execute(dir: &Path, count: usize, seed: u64, partitions: usize) -> Result<()> {
    let (images, labels) = write_csv_dataset(dir, count, seed, partitions)
        .with_context(|| format!("Failed to write dataset under {}", dir.display()))?;

    println!("{}", format!("Generated {count} records").bold().green());
    println!("  Images: {}", images.display().to_string().cyan());
    println!("  Labels: {}", labels.display().to_string().cyan());
    println!();
    println!(
        "  {}",
        format!("Next: spindle run --images {} --labels {}", images.display(), labels.display()).dimmed()
    );
    Ok(())
}
