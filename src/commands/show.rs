use anyhow::{Context, Result};
use colored::Colorize;
use debrew::Formula;
use debrew::formula::Procedure;
use debrew::platform;
use std::path::Path;

/// Print a formula with every variable resolved, without building it.
pub fn show(path: &Path, maintainer: &str) -> Result<()> {
    let formula =
        Formula::load(path).with_context(|| format!("Failed to load {}", path.display()))?;

    println!("{} {}", "==>".bold().green(), formula.id().bold());
    let field = |name: &str, value: &str| println!("{}: {}", name.bold(), value);

    field("Version", formula.version().as_str());
    field("Upstream", formula.version().upstream());
    field("Architecture", formula.arch().unwrap_or(platform::host_arch()));
    field("Maintainer", formula.maintainer().unwrap_or(maintainer));
    if let Some(homepage) = formula.homepage() {
        field("Homepage", homepage);
    }
    if let Some(section) = formula.section() {
        field("Section", section);
    }
    field("Source", formula.url());
    field("Checksum", &formula.checksum().to_string());

    let list = |deps: Vec<String>| {
        if deps.is_empty() {
            "none".dimmed().to_string()
        } else {
            deps.join(", ")
        }
    };
    field(
        "Depends",
        &list(formula.depends().iter().map(ToString::to_string).collect()),
    );
    field(
        "Build-Depends",
        &list(formula.build_depends().iter().map(ToString::to_string).collect()),
    );
    if !formula.conflicts().is_empty() {
        field("Conflicts", &list(formula.conflicts().iter().cloned().collect()));
    }
    if !formula.patches().is_empty() {
        field("Patches", &formula.patches().join(", "));
    }

    match formula.procedure() {
        Procedure::Default => field("Procedure", "copy source into prefix"),
        Procedure::Custom { build, install } => {
            println!("{}:", "Procedure".bold());
            for (phase, steps) in [("build", build), ("install", install)] {
                for step in steps {
                    println!("  {} {}", format!("{phase}:").dimmed(), step);
                }
            }
        }
    }

    Ok(())
}
