//! High-level build engine: formula in, `.deb` out.
//!
//! [`Engine`] owns what is shared across builds (configuration, the download
//! cache with its single-flight table, the cancellation token) and runs each
//! formula through the same fixed sequence of stages:
//!
//! ```text
//! prepare -> fetch -> extract -> patch -> build -> assemble
//! ```
//!
//! Every stage starts with a cancellation checkpoint. The first failure ends
//! that formula's pipeline and is reported as a [`PipelineError`] naming the
//! formula, its version and the stage. No `.deb` is written for a failed
//! pipeline; a verified download stays cached.
//!
//! # Quick Start
//!
//! ```no_run
//! use debrew::{Config, Engine, Formula};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = Engine::new(Config::load(None)?)?;
//!     let formula = Formula::load(Path::new("demos/golang.json"))?;
//!
//!     let result = engine.build(&formula).await?;
//!     println!("Built {} {} -> {}", result.name, result.version, result.deb_path.display());
//!     Ok(())
//! }
//! ```
//!
//! # Batches
//!
//! [`Engine::build_all`] runs up to `jobs` pipelines at once and returns one
//! result per formula, in input order, so one failure never hides another
//! formula's success. Constraints between formulas of the same batch
//! (`golang (= 1.15.6+thepwagner1)`) are checked against the versions the
//! batch actually produces.

use crate::build::BuildExecutor;
use crate::config::Config;
use crate::context::BuildContext;
use crate::deb::Package;
use crate::download::{Fetcher, HttpTransport, RetryPolicy, Transport};
use crate::error::{DebrewError, PipelineError, Result, Stage};
use crate::formula::Formula;
use crate::version::VersionRegistry;
use crate::{extract, patch, platform};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of a successful build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    /// Package name
    pub name: String,
    /// Canonical version written to the control file
    pub version: String,
    /// Debian architecture
    pub architecture: String,
    /// Where the `.deb` was written
    pub deb_path: PathBuf,
    /// The control file as written
    pub control: String,
    /// Size of the `.deb` in bytes
    pub size_bytes: u64,
    /// Time taken (milliseconds)
    pub time_ms: u64,
    pub built_at: DateTime<Utc>,
}

/// Result of a fetch-only run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResult {
    pub name: String,
    pub version: String,
    /// Verified artifact in the download cache
    pub path: PathBuf,
    pub time_ms: u64,
}

/// Formula-to-package build engine.
///
/// Keep one instance for a whole run: concurrent builds that need the same
/// upstream artifact share a single download.
pub struct Engine {
    config: Config,
    fetcher: Fetcher,
    cancel: CancellationToken,
}

impl Engine {
    /// Create an engine that fetches over HTTP(S) and `file://`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: Config) -> Result<Self> {
        let transport = HttpTransport::new(config.fetch_timeout())?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Create an engine with a custom transport (mirrors, tests).
    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Self {
        let fetcher = Fetcher::new(
            transport,
            config.cache_dir.clone(),
            RetryPolicy::from_config(&config),
        );
        Self {
            config,
            fetcher,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Token observed by every stage; cancel it to stop all pipelines.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Build one formula on its own.
    pub async fn build(&self, formula: &Formula) -> std::result::Result<BuildResult, PipelineError> {
        let mut registry = VersionRegistry::new();
        registry.register(formula.name(), formula.version());
        self.build_with_registry(formula, &registry).await
    }

    /// Build a batch, up to `jobs` at a time. Results come back in input order.
    ///
    /// A formula whose name and version repeat an earlier entry fails in the
    /// prepare stage without running.
    pub async fn build_all(
        &self,
        formulas: &[Formula],
    ) -> Vec<std::result::Result<BuildResult, PipelineError>> {
        let mut registry = VersionRegistry::new();
        let mut seen = HashSet::new();
        let duplicate: Vec<bool> = formulas
            .iter()
            .map(|f| !seen.insert(f.id()))
            .collect();
        for formula in formulas {
            registry.register(formula.name(), formula.version());
        }

        let registry = &registry;
        stream::iter(formulas.iter().zip(duplicate))
            .map(|(formula, duplicate)| async move {
                if duplicate {
                    return Err(PipelineError::new(
                        formula.name(),
                        formula.version().as_str(),
                        Stage::Prepare,
                        DebrewError::malformed(format!("{} appears twice in this run", formula.id())),
                    ));
                }
                self.build_with_registry(formula, registry).await
            })
            .buffered(self.config.jobs.max(1))
            .collect()
            .await
    }

    /// Build one formula, checking its constraints against `registry`.
    pub async fn build_with_registry(
        &self,
        formula: &Formula,
        registry: &VersionRegistry,
    ) -> std::result::Result<BuildResult, PipelineError> {
        let start = Instant::now();
        let name = formula.name();
        let version = formula.version().as_str();
        let at = |stage: Stage| move |source: DebrewError| PipelineError::new(name, version, stage, source);

        info!(formula = %formula.id(), "starting build");

        // Stage 1: Build context
        self.checkpoint().map_err(at(Stage::Prepare))?;
        let mut ctx = BuildContext::create(
            &self.config.work_dir,
            name,
            version,
            &self.config.install_prefix,
            self.config.keep_work,
        )
        .map_err(at(Stage::Prepare))?;

        // Stage 2: Fetch and verify
        self.checkpoint().map_err(at(Stage::Fetch))?;
        let artifact = self.fetch_into(formula, &ctx).await.map_err(at(Stage::Fetch))?;

        // Stage 3: Extract
        self.checkpoint().map_err(at(Stage::Extract))?;
        let dest = ctx.source_dir().to_path_buf();
        let root = blocking(move || extract::extract_archive(&artifact, &dest))
            .await
            .map_err(at(Stage::Extract))?;
        debug!(formula = %formula.id(), root = %root.display(), "extracted");
        ctx.set_source_root(root);

        // Stage 4: Patches, in declaration order
        if !formula.patches().is_empty() {
            self.checkpoint().map_err(at(Stage::Patch))?;
            let patches = formula.patches().to_vec();
            let patch_dir = formula.patch_dir().map(Path::to_path_buf);
            let root = ctx.source_root().to_path_buf();
            let patched =
                blocking(move || patch::apply_patches(&patches, patch_dir.as_deref(), &root)).await;
            if let Err(err) = patched {
                ctx.invalidate();
                return Err(at(Stage::Patch)(err));
            }
        }

        // Stage 5: Build and install into the stage
        self.checkpoint().map_err(at(Stage::Build))?;
        let mut executor = BuildExecutor::new(self.config.step_timeout(), self.cancel.clone());
        executor
            .run(formula.procedure(), &mut ctx)
            .await
            .map_err(at(Stage::Build))?;

        // Stage 6: Assemble and write the package
        self.checkpoint().map_err(at(Stage::Assemble))?;
        let package = Package::assemble(
            formula,
            &ctx,
            executor.state(),
            registry,
            &self.config.maintainer,
            platform::host_arch(),
        )
        .map_err(at(Stage::Assemble))?;

        let control = package.control();
        let out_dir = self.config.output_dir.clone();
        let mtime = self.config.source_date_epoch;
        let writer = package.clone();
        let deb_path = blocking(move || writer.write_deb(&out_dir, mtime))
            .await
            .map_err(at(Stage::Assemble))?;
        let size_bytes = fs::metadata(&deb_path)
            .map(|m| m.len())
            .map_err(|e| at(Stage::Assemble)(e.into()))?;

        let time_ms = start.elapsed().as_millis() as u64;
        info!(formula = %formula.id(), path = %deb_path.display(), time_ms, "build complete");

        Ok(BuildResult {
            name: package.name,
            version: package.version.to_string(),
            architecture: package.architecture,
            deb_path,
            control,
            size_bytes,
            time_ms,
            built_at: Utc::now(),
        })
    }

    /// Download and verify the source artifact without building.
    pub async fn fetch(&self, formula: &Formula) -> std::result::Result<FetchResult, PipelineError> {
        let start = Instant::now();
        let fail = |source| {
            PipelineError::new(formula.name(), formula.version().as_str(), Stage::Fetch, source)
        };

        self.checkpoint().map_err(fail)?;
        let path = self
            .fetcher
            .fetch(formula.url(), formula.checksum(), &self.cancel)
            .await
            .map_err(fail)?;

        Ok(FetchResult {
            name: formula.name().to_string(),
            version: formula.version().to_string(),
            path,
            time_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Fetch a batch, up to `jobs` at a time.
    pub async fn fetch_all(
        &self,
        formulas: &[Formula],
    ) -> Vec<std::result::Result<FetchResult, PipelineError>> {
        stream::iter(formulas)
            .map(|formula| self.fetch(formula))
            .buffered(self.config.jobs.max(1))
            .collect()
            .await
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(DebrewError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Fetch through the shared cache, then give the build its own copy.
    async fn fetch_into(&self, formula: &Formula, ctx: &BuildContext) -> Result<PathBuf> {
        let cached = self
            .fetcher
            .fetch(formula.url(), formula.checksum(), &self.cancel)
            .await?;

        let file_name = cached
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "artifact".into());
        let local = ctx.download_dir().join(file_name);
        if tokio::fs::hard_link(&cached, &local).await.is_err() {
            warn!(path = %cached.display(), "hard link failed, copying artifact");
            tokio::fs::copy(&cached, &local).await?;
        }
        Ok(local)
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DebrewError::from(std::io::Error::other(e)))?
}
