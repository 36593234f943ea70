//! Standalone checkpoint command.

use anyhow::Result;
use std::path::Path;

use waypoint::checkpoint::validate;

pub fn cmd_validate(project_dir: &Path, patterns: &[String]) -> Result<()> {
    let result = validate(patterns, project_dir);

    for pattern in result.satisfied() {
        println!("  {} {}", console::style("found  ").green(), pattern);
    }
    for pattern in &result.missing {
        println!("  {} {}", console::style("missing").red(), pattern);
    }
    if !result.found.is_empty() {
        println!();
        for path in &result.found {
            println!("  {}", console::style(path).dim());
        }
    }
    println!();
    println!("Checkpoint: {}", result.status);

    if !result.passed() {
        anyhow::bail!(
            "{} of {} patterns missing",
            result.missing.len(),
            result.required.len()
        );
    }
    Ok(())
}
