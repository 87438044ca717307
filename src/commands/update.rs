use super::utils::spinner;
use anyhow::{Context, Result, bail};
use colored::Colorize;
use debrew::Updater;
use debrew::formula::FormulaSpec;
use futures::future::join_all;
use std::path::PathBuf;

/// Check formulae for newer upstream releases, rewriting them with `write`.
pub async fn update(updater: &Updater, paths: &[PathBuf], write: bool) -> Result<()> {
    let specs = paths
        .iter()
        .map(|path| {
            FormulaSpec::read(path).with_context(|| format!("Failed to load {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let pb = spinner(format!("Checking {} formulae...", specs.len()));
    let results = join_all(specs.iter().map(|spec| updater.update(spec))).await;
    pb.finish_and_clear();

    let mut failed = 0;
    let mut outdated = 0;
    for ((path, spec), result) in paths.iter().zip(&specs).zip(results) {
        let name = spec.name.as_deref().unwrap_or("<unnamed>");
        match result {
            Ok(Some(update)) => {
                outdated += 1;
                println!(
                    "{} {} {} -> {} ({})",
                    "↑".yellow(),
                    name.bold(),
                    update.release.previous,
                    update.release.next.green(),
                    update.release.upstream.to_string().dimmed()
                );
                if write {
                    std::fs::write(path, update.spec.to_json()?)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("  {} {}", "wrote".dimmed(), path.display());
                }
            }
            Ok(None) => println!("{} {} up to date", "✓".green(), name.bold()),
            Err(err) => {
                failed += 1;
                println!("{} {}: {}", "✗".red(), name.bold(), err);
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} update checks failed", specs.len());
    }
    if outdated > 0 && !write {
        println!("Run with {} to rewrite the formula files", "--write".cyan());
    }
    Ok(())
}
