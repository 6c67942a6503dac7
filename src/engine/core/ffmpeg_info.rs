use anyhow::{Context, Result};
use std::process::Command;

/// Check that a tool runs and return the first line of its `-version` output
pub fn tool_version(program: &str) -> Result<String> {
    let output = Command::new(program)
        .arg("-version")
        .output()
        .with_context(|| format!("Failed to execute {}. Is it installed and in PATH?", program))?;

    if !output.status.success() {
        anyhow::bail!("{} command failed with status: {}", program, output.status);
    }

    Ok(first_line(&String::from_utf8_lossy(&output.stdout)))
}

fn first_line(text: &str) -> String {
    text.lines()
        .next()
        .filter(|l| !l.trim().is_empty())
        .unwrap_or("Unknown version")
        .to_string()
}
