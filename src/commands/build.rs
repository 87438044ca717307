use super::utils::{format_size, load_formulas, print_failure, spinner};
use anyhow::{Result, bail};
use colored::Colorize;
use debrew::Engine;
use std::path::PathBuf;

/// Build every formula into a `.deb` and report per-formula outcomes.
pub async fn build(engine: &Engine, paths: &[PathBuf], json: bool) -> Result<()> {
    let formulas = load_formulas(paths)?;

    let pb = spinner(format!(
        "Building {} formulae ({} at a time)...",
        formulas.len(),
        engine.config().jobs
    ));
    let results = engine.build_all(&formulas).await;
    pb.finish_and_clear();

    let mut failed = 0;
    for result in &results {
        match result {
            Ok(built) if json => println!("{}", serde_json::to_string(built)?),
            Ok(built) => println!(
                "{} {} {} {} {} ({}, {:.1}s)",
                "✓".green(),
                built.name.bold(),
                built.version,
                "→".dimmed(),
                built.deb_path.display().to_string().cyan(),
                format_size(built.size_bytes),
                built.time_ms as f64 / 1000.0
            ),
            Err(err) => {
                failed += 1;
                print_failure(err);
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} builds failed", results.len());
    }
    Ok(())
}
