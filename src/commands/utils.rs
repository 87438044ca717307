use anyhow::{Context, Result};
use colored::{Colorize, control};
use debrew::{Formula, PipelineError};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

/// Honor `NO_COLOR`, `CLICOLOR_FORCE` and `CLICOLOR=0`, else color only on a TTY.
pub fn init_colors() {
    let var = |key: &str| std::env::var(key).ok();
    let enabled = if var("NO_COLOR").is_some() {
        false
    } else if var("CLICOLOR_FORCE").is_some_and(|v| v != "0") {
        true
    } else if var("CLICOLOR").as_deref() == Some("0") {
        false
    } else {
        std::io::stdout().is_terminal()
    };
    control::set_override(enabled);
}

/// Spinner on a TTY, hidden otherwise.
pub fn spinner(message: String) -> ProgressBar {
    if !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Load every formula file, stopping at the first that does not parse.
pub fn load_formulas(paths: &[PathBuf]) -> Result<Vec<Formula>> {
    paths
        .iter()
        .map(|path| {
            Formula::load(path).with_context(|| format!("Failed to load {}", path.display()))
        })
        .collect()
}

pub fn print_failure(err: &PipelineError) {
    println!(
        "{} {} {} failed at {}: {}",
        "✗".red(),
        err.formula.bold(),
        err.version,
        err.stage.to_string().yellow(),
        err.source
    );
    if let debrew::DebrewError::BuildStepFailed { output, .. } = &err.source {
        let tail: Vec<&str> = output.lines().rev().take(20).collect();
        for line in tail.into_iter().rev() {
            println!("    {}", line.dimmed());
        }
    }
}

pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    match bytes {
        b if b >= GB => format!("{:.2} GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.2} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.2} KB", b as f64 / KB as f64),
        b => format!("{b} bytes"),
    }
}
