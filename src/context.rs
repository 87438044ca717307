//! Per-build scratch space.
//!
//! Every pipeline run gets a fresh directory under the configured work dir:
//! ```text
//! <work_dir>/<name>-<version>-<pid>-<n>/
//!   download/      artifact copy private to this build
//!   src/           extracted upstream source
//!   stage/         DESTDIR; becomes the package payload
//!     usr/local/   install prefix inside the stage
//!   home/          HOME for build steps
//!     tmp/         TMPDIR for build steps
//! ```
//! Two runs never share a context, even for the same formula, and the
//! directory is removed when the context is dropped unless `keep_work` is set.

use crate::error::{DebrewError, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
pub struct BuildContext {
    root: PathBuf,
    download_dir: PathBuf,
    source_dir: PathBuf,
    stage_dir: PathBuf,
    prefix_dir: PathBuf,
    install_prefix: PathBuf,
    home_dir: PathBuf,
    tmp_dir: PathBuf,
    source_root: Option<PathBuf>,
    valid: bool,
    keep: bool,
}

impl BuildContext {
    /// Create the directory layout for one build of `name` at `version`.
    pub fn create(
        work_dir: &Path,
        name: &str,
        version: &str,
        install_prefix: &Path,
        keep: bool,
    ) -> Result<Self> {
        let relative_prefix = relative_prefix(install_prefix)?;
        let serial = NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed);
        let dir_name = format!(
            "{name}-{}-{}-{serial}",
            version.replace(':', "_"),
            std::process::id()
        );
        let root = work_dir.join(dir_name);

        // A leftover from a crashed process with a recycled pid.
        if root.exists() {
            fs::remove_dir_all(&root)?;
        }

        let stage_dir = root.join("stage");
        let home_dir = root.join("home");
        let ctx = Self {
            download_dir: root.join("download"),
            source_dir: root.join("src"),
            prefix_dir: stage_dir.join(&relative_prefix),
            install_prefix: Path::new("/").join(&relative_prefix),
            tmp_dir: home_dir.join("tmp"),
            stage_dir,
            home_dir,
            root,
            source_root: None,
            valid: true,
            keep,
        };

        for dir in [
            &ctx.download_dir,
            &ctx.source_dir,
            &ctx.prefix_dir,
            &ctx.tmp_dir,
        ] {
            fs::create_dir_all(dir)?;
        }

        debug!(path = %ctx.root.display(), "created build context");
        Ok(ctx)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Where the archive is extracted.
    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    /// DESTDIR: the package payload root.
    pub fn stage_dir(&self) -> &Path {
        &self.stage_dir
    }

    /// The install prefix as seen from the build host, inside the stage.
    pub fn prefix_dir(&self) -> &Path {
        &self.prefix_dir
    }

    /// The install prefix as seen on the target system, e.g. `/usr/local`.
    pub fn install_prefix(&self) -> &Path {
        &self.install_prefix
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    pub fn set_source_root(&mut self, root: PathBuf) {
        self.source_root = Some(root);
    }

    /// Top of the extracted source tree; falls back to `src/` before
    /// extraction has happened.
    pub fn source_root(&self) -> &Path {
        self.source_root.as_deref().unwrap_or(&self.source_dir)
    }

    /// Mark the stage as unusable after a failed step.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Fail with `AssemblyError` if the stage may not be packaged.
    pub fn ensure_valid(&self) -> Result<()> {
        if self.valid {
            Ok(())
        } else {
            Err(DebrewError::assembly(format!(
                "build context {} was invalidated by a failed step",
                self.root.display()
            )))
        }
    }
}

impl Drop for BuildContext {
    fn drop(&mut self) {
        if self.keep {
            debug!(path = %self.root.display(), "keeping build context");
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.root.display(), error = %e, "failed to remove build context");
            }
        }
    }
}

/// `/usr/local` -> `usr/local`. Rejects `..` so the prefix stays inside the stage.
fn relative_prefix(prefix: &Path) -> Result<PathBuf> {
    let mut relative = PathBuf::new();
    for component in prefix.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => relative.push(part),
            Component::ParentDir | Component::Prefix(_) => {
                return Err(DebrewError::malformed(format!(
                    "install prefix `{}` must not contain `..`",
                    prefix.display()
                )));
            }
        }
    }
    Ok(relative)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let work = tempfile::tempdir().unwrap();
        let ctx = BuildContext::create(
            work.path(),
            "golang",
            "1:1.15.6+thepwagner1",
            Path::new("/usr/local"),
            false,
        )
        .unwrap();

        assert!(ctx.prefix_dir().ends_with("stage/usr/local"));
        assert!(ctx.prefix_dir().is_dir());
        assert!(ctx.tmp_dir().is_dir());
        assert_eq!(ctx.install_prefix(), Path::new("/usr/local"));
        assert!(!ctx.root().to_string_lossy().contains(':'));
        assert_eq!(ctx.source_root(), ctx.source_dir());
    }

    #[test]
    fn test_contexts_are_distinct() {
        let work = tempfile::tempdir().unwrap();
        let a = BuildContext::create(work.path(), "ant", "1.10.9", Path::new("/usr"), false).unwrap();
        let b = BuildContext::create(work.path(), "ant", "1.10.9", Path::new("/usr"), false).unwrap();
        assert_ne!(a.root(), b.root());
    }

    #[test]
    fn test_drop_removes_unless_kept() {
        let work = tempfile::tempdir().unwrap();
        let removed = BuildContext::create(work.path(), "ant", "1", Path::new("/usr"), false).unwrap();
        let kept = BuildContext::create(work.path(), "ant", "1", Path::new("/usr"), true).unwrap();
        let (removed_root, kept_root) = (removed.root().to_path_buf(), kept.root().to_path_buf());

        drop(removed);
        drop(kept);
        assert!(!removed_root.exists());
        assert!(kept_root.exists());
    }

    #[test]
    fn test_invalidate() {
        let work = tempfile::tempdir().unwrap();
        let mut ctx = BuildContext::create(work.path(), "ant", "1", Path::new("/usr"), false).unwrap();
        assert!(ctx.ensure_valid().is_ok());
        ctx.invalidate();
        assert!(!ctx.is_valid());
        assert!(matches!(ctx.ensure_valid(), Err(DebrewError::AssemblyError(_))));
    }

    #[test]
    fn test_prefix_must_stay_inside_stage() {
        let work = tempfile::tempdir().unwrap();
        assert!(BuildContext::create(work.path(), "ant", "1", Path::new("/usr/../.."), false).is_err());
    }
}
