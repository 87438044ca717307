mod commands;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use debrew::{Config, Engine, Updater};
use std::path::PathBuf;
use tracing::warn;

#[derive(Parser)]
#[command(name = "debrew")]
#[command(author, version, about = "Build Debian packages from formulae", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: $XDG_CONFIG_HOME/debrew/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build formulae into .deb packages
    Build {
        /// Formula files (JSON)
        #[arg(required = true)]
        formulae: Vec<PathBuf>,

        /// Directory for the finished packages
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Formulae to build concurrently
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Keep build directories for inspection
        #[arg(long)]
        keep_work: bool,

        /// Print one JSON result per built package
        #[arg(long)]
        json: bool,
    },

    /// Download and verify sources without building
    Fetch {
        /// Formula files (JSON)
        #[arg(required = true)]
        formulae: Vec<PathBuf>,
    },

    /// Show a formula with all variables resolved
    Show {
        /// Formula file (JSON)
        formula: PathBuf,
    },

    /// Check formulae for newer upstream releases
    Update {
        /// Formula files (JSON)
        #[arg(required = true)]
        formulae: Vec<PathBuf>,

        /// Rewrite the formula files with the new version and checksum
        #[arg(long)]
        write: bool,
    },

    /// Inspect or clean the download cache
    Cache {
        #[command(subcommand)]
        action: Option<CacheAction>,
    },

    /// Generate shell completions
    Completions {
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Remove every cached download
    Clean,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debrew=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
    commands::utils::init_colors();

    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Build {
            formulae,
            output,
            jobs,
            keep_work,
            json,
        } => {
            if let Some(output) = output {
                config.output_dir = output;
            }
            if let Some(jobs) = jobs {
                config.jobs = jobs.max(1);
            }
            config.keep_work |= keep_work;

            let engine = Engine::new(config)?;
            cancel_on_ctrl_c(&engine);
            commands::build(&engine, &formulae, json).await?;
        }
        Commands::Fetch { formulae } => {
            let engine = Engine::new(config)?;
            cancel_on_ctrl_c(&engine);
            commands::fetch(&engine, &formulae).await?;
        }
        Commands::Show { formula } => {
            commands::show(&formula, &config.maintainer)?;
        }
        Commands::Update { formulae, write } => {
            let updater = Updater::from_config(&config)?;
            commands::update(&updater, &formulae, write).await?;
        }
        Commands::Cache { action } => match action {
            Some(CacheAction::Clean) => commands::cache::clean(&config.cache_dir)?,
            None => commands::cache::info(&config.cache_dir)?,
        },
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "debrew", &mut std::io::stdout());
        }
    }

    Ok(())
}

/// First Ctrl-C cancels running pipelines; they clean up and report `Cancelled`.
fn cancel_on_ctrl_c(engine: &Engine) {
    let token = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling builds");
            token.cancel();
        }
    });
}
