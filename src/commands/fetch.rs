use super::utils::{format_size, load_formulas, print_failure, spinner};
use anyhow::{Result, bail};
use colored::Colorize;
use debrew::Engine;
use std::path::PathBuf;

/// Download and verify source artifacts without building.
pub async fn fetch(engine: &Engine, paths: &[PathBuf]) -> Result<()> {
    let formulas = load_formulas(paths)?;

    let pb = spinner(format!("Fetching {} artifacts...", formulas.len()));
    let results = engine.fetch_all(&formulas).await;
    pb.finish_and_clear();

    let mut failed = 0;
    for result in &results {
        match result {
            Ok(fetched) => {
                let size = std::fs::metadata(&fetched.path).map(|m| m.len()).unwrap_or(0);
                println!(
                    "{} {} {} ({}, {}ms)",
                    "✓".green(),
                    fetched.name.bold(),
                    fetched.version,
                    format_size(size),
                    fetched.time_ms
                );
            }
            Err(err) => {
                failed += 1;
                print_failure(err);
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} fetches failed", results.len());
    }
    println!(
        "{} Artifacts cached in {}",
        "✓".green().bold(),
        engine.config().cache_dir.display().to_string().cyan()
    );
    Ok(())
}
