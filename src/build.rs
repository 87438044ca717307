//! Build executor: runs a formula's procedure inside its build context.
//!
//! Each executor drives one build through
//! `Unbuilt -> Configuring -> Building -> Installed`, or to `Failed` from any
//! of them. The `build` steps run while `Configuring` and the `install` steps
//! (or the default copy into the prefix) while `Building`. Steps run strictly in order, one subprocess each, with the
//! extracted source root as working directory and this environment:
//!
//! | variable        | value                                     |
//! |-----------------|-------------------------------------------|
//! | `PREFIX`        | install prefix inside the stage           |
//! | `DESTDIR`       | the stage root                            |
//! | `DEBREW_PREFIX` | install prefix on the target, `/usr/local`|
//! | `HOME`          | `home/` in the build context              |
//! | `TMPDIR`        | `home/tmp/` in the build context          |
//!
//! A failing step is never retried; the context is invalidated so nothing
//! gets packaged from a half-built stage.

use crate::context::BuildContext;
use crate::error::{DebrewError, Result};
use crate::formula::{Procedure, Step};
use std::fmt;
use std::fs;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Captured step output kept for error reports, from the end of the stream.
const MAX_OUTPUT_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Unbuilt,
    Configuring,
    Building,
    Installed,
    Failed,
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unbuilt => "unbuilt",
            Self::Configuring => "configuring",
            Self::Building => "building",
            Self::Installed => "installed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Build,
    Install,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Build => f.write_str("build"),
            Self::Install => f.write_str("install"),
        }
    }
}

/// How a failed step ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Exited(i32),
    Signaled(i32),
    TimedOut(Duration),
    SpawnFailed(String),
}

impl StepStatus {
    fn from_exit(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            Self::Signaled(status.signal().unwrap_or(-1))
        }
        #[cfg(not(unix))]
        {
            Self::Signaled(-1)
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with status {code}"),
            Self::Signaled(signal) => write!(f, "was killed by signal {signal}"),
            Self::TimedOut(limit) => write!(f, "timed out after {}s", limit.as_secs()),
            Self::SpawnFailed(reason) => write!(f, "could not be started: {reason}"),
        }
    }
}

pub struct BuildExecutor {
    state: BuildState,
    failed_during: Option<BuildState>,
    step_timeout: Duration,
    cancel: CancellationToken,
}

impl BuildExecutor {
    pub fn new(step_timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            state: BuildState::Unbuilt,
            failed_during: None,
            step_timeout,
            cancel,
        }
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    /// The state the executor was in when the build failed.
    pub fn failed_during(&self) -> Option<BuildState> {
        self.failed_during
    }

    /// Run `procedure` to completion. On success the stage holds exactly what
    /// the procedure installed and the state is `Installed`.
    pub async fn run(&mut self, procedure: &Procedure, ctx: &mut BuildContext) -> Result<()> {
        if self.state != BuildState::Unbuilt {
            return Err(DebrewError::NotRunnable(self.state));
        }

        let result = self.drive(procedure, ctx).await;
        match &result {
            Ok(()) => self.state = BuildState::Installed,
            Err(err) => {
                warn!(state = %self.state, error = %err, "build failed");
                self.failed_during = Some(self.state);
                self.state = BuildState::Failed;
                ctx.invalidate();
            }
        }
        result
    }

    async fn drive(&mut self, procedure: &Procedure, ctx: &BuildContext) -> Result<()> {
        self.state = BuildState::Configuring;
        self.checkpoint()?;

        match procedure {
            Procedure::Default => {
                self.state = BuildState::Building;
                let source = ctx.source_root().to_path_buf();
                let prefix = ctx.prefix_dir().to_path_buf();
                let copied = tokio::task::spawn_blocking(move || copy_tree(&source, &prefix))
                    .await
                    .map_err(|e| DebrewError::from(std::io::Error::other(e)))??;
                info!(files = copied, prefix = %ctx.install_prefix().display(), "staged source tree");
            }
            Procedure::Custom { build, install } => {
                let resolve = |steps: &[Step]| -> Result<Vec<Step>> {
                    steps
                        .iter()
                        .map(|step| step.resolve(ctx.prefix_dir(), ctx.stage_dir()))
                        .collect()
                };
                let build = resolve(build)?;
                let install = resolve(install)?;

                for (phase, steps) in [(Phase::Build, &build), (Phase::Install, &install)] {
                    self.state = match phase {
                        Phase::Build => BuildState::Configuring,
                        Phase::Install => BuildState::Building,
                    };
                    for (index, step) in steps.iter().enumerate() {
                        self.checkpoint()?;
                        self.run_step(phase, index, step, ctx).await?;
                    }
                }
            }
        }

        self.checkpoint()
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(DebrewError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn run_step(&self, phase: Phase, index: usize, step: &Step, ctx: &BuildContext) -> Result<()> {
        let command_line = step.to_string();
        let failed = |status: StepStatus, output: String| DebrewError::BuildStepFailed {
            phase,
            index,
            command: command_line.clone(),
            status,
            output,
        };

        let mut cmd = match step {
            Step::Shell(line) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(line);
                cmd
            }
            Step::Exec(argv) => {
                let Some((program, args)) = argv.split_first() else {
                    return Err(failed(StepStatus::SpawnFailed("empty argv".into()), String::new()));
                };
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        };

        cmd.current_dir(ctx.source_root())
            .env("PREFIX", ctx.prefix_dir())
            .env("DESTDIR", ctx.stage_dir())
            .env("DEBREW_PREFIX", ctx.install_prefix())
            .env("HOME", ctx.home_dir())
            .env("TMPDIR", ctx.tmp_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(%phase, index, command = %command_line, "running step");
        let child = cmd
            .spawn()
            .map_err(|e| failed(StepStatus::SpawnFailed(e.to_string()), String::new()))?;

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DebrewError::Cancelled),
            waited = tokio::time::timeout(self.step_timeout, child.wait_with_output()) => match waited {
                Ok(output) => output?,
                Err(_) => {
                    return Err(failed(StepStatus::TimedOut(self.step_timeout), String::new()));
                }
            },
        };

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        let text = tail(&combined);

        if output.status.success() {
            debug!(%phase, index, output = %text, "step finished");
            Ok(())
        } else {
            Err(failed(StepStatus::from_exit(output.status), text))
        }
    }
}

/// Last `MAX_OUTPUT_BYTES` of `bytes` as lossy UTF-8.
fn tail(bytes: &[u8]) -> String {
    let start = bytes.len().saturating_sub(MAX_OUTPUT_BYTES);
    String::from_utf8_lossy(&bytes[start..]).into_owned()
}

/// Copy everything under `source` into `dest`, keeping symlinks as symlinks.
/// Returns the number of files copied.
fn copy_tree(source: &Path, dest: &Path) -> Result<usize> {
    let mut copied = 0;

    for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(std::io::Error::other)?;
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&link, &target)?;
            #[cfg(not(unix))]
            fs::copy(entry.path(), &target)?;
            copied += 1;
        } else {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }

    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn context(work: &Path) -> BuildContext {
        BuildContext::create(work, "azcopy", "10.7.0", Path::new("/usr/local"), false).unwrap()
    }

    fn custom(build: &[&str], install: &[&str]) -> Procedure {
        let steps = |lines: &[&str]| lines.iter().map(|l| Step::Shell(l.to_string())).collect();
        Procedure::Custom {
            build: steps(build),
            install: steps(install),
        }
    }

    #[tokio::test]
    async fn test_default_procedure_copies_source() {
        let work = tempfile::tempdir().unwrap();
        let mut ctx = context(work.path());
        fs::create_dir_all(ctx.source_dir().join("go/bin")).unwrap();
        fs::write(ctx.source_dir().join("go/bin/go"), "#!/bin/sh\n").unwrap();
        ctx.set_source_root(ctx.source_dir().join("go"));

        let mut executor = BuildExecutor::new(Duration::from_secs(30), CancellationToken::new());
        executor.run(&Procedure::Default, &mut ctx).await.unwrap();

        assert_eq!(executor.state(), BuildState::Installed);
        assert!(ctx.prefix_dir().join("bin/go").is_file());
    }

    #[tokio::test]
    async fn test_steps_see_build_environment() {
        let work = tempfile::tempdir().unwrap();
        let mut ctx = context(work.path());
        let procedure = custom(
            &["echo built > artifact"],
            &[
                "mkdir -p $PREFIX/bin && cp artifact $PREFIX/bin/azcopy",
                "echo \"$DEBREW_PREFIX\" > #{prefix}/where",
            ],
        );

        let mut executor = BuildExecutor::new(Duration::from_secs(30), CancellationToken::new());
        executor.run(&procedure, &mut ctx).await.unwrap();

        let prefix = ctx.prefix_dir();
        assert_eq!(fs::read_to_string(prefix.join("bin/azcopy")).unwrap(), "built\n");
        assert_eq!(fs::read_to_string(prefix.join("where")).unwrap(), "/usr/local\n");
        assert!(ctx.is_valid());
    }

    #[tokio::test]
    async fn test_failing_step_reports_phase_and_index() {
        let work = tempfile::tempdir().unwrap();
        let mut ctx = context(work.path());
        let procedure = custom(&["true", "echo compiler exploded >&2; exit 3"], &["true"]);

        let mut executor = BuildExecutor::new(Duration::from_secs(30), CancellationToken::new());
        let err = executor.run(&procedure, &mut ctx).await.unwrap_err();

        match err {
            DebrewError::BuildStepFailed {
                phase,
                index,
                status,
                output,
                ..
            } => {
                assert_eq!(phase, Phase::Build);
                assert_eq!(index, 1);
                assert_eq!(status, StepStatus::Exited(3));
                assert!(output.contains("compiler exploded"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(executor.state(), BuildState::Failed);
        assert_eq!(executor.failed_during(), Some(BuildState::Configuring));
        assert!(!ctx.is_valid());
    }

    #[tokio::test]
    async fn test_install_steps_run_while_building() {
        let work = tempfile::tempdir().unwrap();
        let mut ctx = context(work.path());
        let procedure = custom(&["true"], &["exit 1"]);

        let mut executor = BuildExecutor::new(Duration::from_secs(30), CancellationToken::new());
        let err = executor.run(&procedure, &mut ctx).await.unwrap_err();

        assert!(matches!(
            err,
            DebrewError::BuildStepFailed {
                phase: Phase::Install,
                index: 0,
                ..
            }
        ));
        assert_eq!(executor.failed_during(), Some(BuildState::Building));
    }

    #[tokio::test]
    async fn test_rerun_is_not_allowed() {
        let work = tempfile::tempdir().unwrap();
        let mut ctx = context(work.path());
        let mut executor = BuildExecutor::new(Duration::from_secs(30), CancellationToken::new());
        executor.run(&custom(&["false"], &[]), &mut ctx).await.unwrap_err();

        let err = executor.run(&custom(&["true"], &[]), &mut ctx).await.unwrap_err();
        assert!(matches!(err, DebrewError::NotRunnable(BuildState::Failed)));
    }

    #[tokio::test]
    async fn test_step_timeout() {
        let work = tempfile::tempdir().unwrap();
        let mut ctx = context(work.path());
        let mut executor = BuildExecutor::new(Duration::from_millis(200), CancellationToken::new());

        let err = executor.run(&custom(&["sleep 10"], &[]), &mut ctx).await.unwrap_err();
        assert!(matches!(
            err,
            DebrewError::BuildStepFailed {
                status: StepStatus::TimedOut(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_cancel_kills_running_step() {
        let work = tempfile::tempdir().unwrap();
        let mut ctx = context(work.path());
        let cancel = CancellationToken::new();
        let mut executor = BuildExecutor::new(Duration::from_secs(30), cancel.clone());

        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let err = executor.run(&custom(&["sleep 10"], &[]), &mut ctx).await.unwrap_err();
        trigger.await.unwrap();

        assert!(matches!(err, DebrewError::Cancelled));
        assert!(!ctx.is_valid());
    }
}
