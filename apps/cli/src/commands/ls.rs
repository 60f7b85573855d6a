//! Ls command implementation.

use anyhow::{Context, Result};
use colored::Colorize;
use spindle_training::list_dir;
use std::path::Path;

pub fn execute(path: &Path, json_output: bool) -> Result<()> {
    let entries = list_dir(path).with_context(|| format!("Failed to list {}", path.display()))?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!("{}", format!("{} ({} entries)", path.display(), entries.len()).bold().cyan());
    for entry in entries {
        if entry.is_dir {
            println!("  {}/", entry.name.blue());
        } else {
            println!("  {:<24} {:>10}", entry.name, entry.size.to_string().dimmed());
        }
    }
    Ok(())
}
