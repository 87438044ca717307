use super::utils::format_size;
use anyhow::Result;
use colored::Colorize;
use debrew::cache;
use std::path::Path;

/// Show what the download cache holds.
pub fn info(cache_dir: &Path) -> Result<()> {
    let downloads = cache::downloads_dir(cache_dir);
    println!("{}", "==> Download Cache".bold().green());
    println!();
    println!("{}: {}", "Location".bold(), downloads.display().to_string().cyan());

    let mut count = 0;
    let mut total = 0u64;
    if downloads.exists() {
        for entry in std::fs::read_dir(&downloads)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_file() {
                count += 1;
                total += meta.len();
            }
        }
    }

    println!("{}: {}", "Artifacts".bold(), count.to_string().cyan());
    println!("{}: {}", "Size".bold(), format_size(total).cyan());
    if count > 0 {
        println!();
        println!("Run {} to clean the cache", "debrew cache clean".dimmed());
    }
    Ok(())
}

pub fn clean(cache_dir: &Path) -> Result<()> {
    let removed = cache::clear_downloads(cache_dir)?;
    if removed == 0 {
        println!("{} Cache is already empty", "✓".green());
    } else {
        println!(
            "{} Removed {} cached artifacts",
            "✓".green().bold(),
            removed.to_string().bold()
        );
    }
    Ok(())
}
