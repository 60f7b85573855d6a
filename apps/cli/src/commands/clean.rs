//! Clean command implementation.

use anyhow::{Context, Result};
use colored::Colorize;
use spindle_training::clear_path;
use std::path::PathBuf;

/// Remove each path recursively. Paths that do not exist are reported and skipped.
pub fn execute(paths: &[PathBuf]) -> Result<()> {
    let mut total_removed = 0;
    for path in paths {
        let removed = clear_path(path).with_context(|| format!("Failed to remove {}", path.display()))?;
        if removed {
            println!("  Removed {}", path.display().to_string().dimmed());
            total_removed += 1;
        } else {
            println!("  Nothing to remove at {}", path.display().to_string().dimmed());
        }
    }

    if total_removed > 0 {
        println!("{}", format!("✓ Removed {} paths", total_removed).green().bold());
    } else {
        println!("{}", "✓ Already clean".green().bold());
    }
    Ok(())
}
