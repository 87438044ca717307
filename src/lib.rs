//! Library interface for debrew: builds Debian packages from formulae.
//!
//! A formula names an upstream artifact, its checksum, optional patches and
//! a build procedure. [`Engine`] turns it into a `.deb` through a fixed
//! pipeline of fetch, extract, patch, build and assemble.

pub mod build;
pub mod cache;
pub mod config;
pub mod context;
pub mod deb;
pub mod download;
pub mod error;
pub mod extract;
pub mod formula;
pub mod patch;
pub mod pipeline;
pub mod platform;
pub mod update;
pub mod version;

// Re-export commonly used types
pub use config::Config;
pub use deb::Package;
pub use error::{DebrewError, PipelineError, Result, Stage};
pub use formula::Formula;
pub use pipeline::{BuildResult, Engine, FetchResult};
pub use update::Updater;
pub use version::{Version, VersionRegistry};
