//! Command implementations for the debrew CLI
//!
//! - **build**: formula files to `.deb` packages
//! - **fetch**: download and verify sources only
//! - **show**: resolved formula metadata
//! - **cache**: download cache inspection and cleanup
//! - **update**: newer upstream releases, optionally written back
//! - **utils**: shared output helpers (internal)

pub mod build;
pub mod cache;
pub mod fetch;
pub mod show;
pub mod update;
pub(crate) mod utils;

pub use build::build;
pub use fetch::fetch;
pub use show::show;
pub use update::update;
