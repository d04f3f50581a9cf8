//! The package installer backends
//!
//! Environments are populated either by pip (driven as `python -m pip
//! --python <venv python>`, which needs pip 22.3+) or by uv (`uv pip
//! --python <venv python>`). [PackageInstaller] is the seam the environment
//! builder and the lockfile engine program against, so tests can substitute
//! a recording fake.
//!
//! All invocations run under [CommandLimits]: an independent timeout per
//! subprocess plus a shared cancellation flag. Exceeding either kills the
//! child and reports the build as failed.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::Error;
use crate::interpreters::venv_interpreter;

/// Cooperative cancellation shared between a caller and running builds
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aborts the running and all future subprocesses using this token
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Deadline and cancellation for a single subprocess invocation
#[derive(Debug, Clone)]
pub struct CommandLimits {
    pub timeout: Duration,
    pub cancel: CancelToken,
}

impl CommandLimits {
    pub fn new(timeout: Duration, cancel: &CancelToken) -> Self {
        Self {
            timeout,
            cancel: cancel.clone(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct CommandOutput {
    pub stdout: String,
    #[allow(dead_code)]
    pub stderr: String,
}

/// Runs a command to completion under the given limits. Non-zero exit,
/// timeout and cancellation all fail the build; stderr goes into the error
/// message.
pub(crate) fn run_limited(
    mut command: Command,
    stdin_data: Option<&str>,
    limits: &CommandLimits,
    what: &str,
) -> Result<CommandOutput, Error> {
    debug!("Running {:?}", command);
    command
        .stdin(if stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = command
        .spawn()
        .map_err(|err| Error::BuildFailed(format!("Failed to start {}: {}", what, err)))?;

    if let Some(data) = stdin_data {
        if let Some(mut stdin) = child.stdin.take() {
            // The child may exit without reading everything; its exit status
            // has the real story then
            let _ = stdin.write_all(data.as_bytes());
        }
    }
    let stdout = collect_pipe(child.stdout.take());
    let stderr = collect_pipe(child.stderr.take());

    let deadline = Instant::now() + limits.timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(err) => {
                let _ = child.kill();
                return Err(Error::BuildFailed(format!(
                    "Failed to wait for {}: {}",
                    what, err
                )));
            }
        }
        if limits.cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::BuildFailed(format!("{} was cancelled", what)));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::BuildFailed(format!(
                "{} timed out after {}s",
                what,
                limits.timeout.as_secs()
            )));
        }
        thread::sleep(Duration::from_millis(20));
    };

    let stdout = stdout.join().unwrap_or_default();
    let stderr = stderr.join().unwrap_or_default();
    if status.success() {
        Ok(CommandOutput { stdout, stderr })
    } else {
        Err(Error::BuildFailed(format!(
            "{} failed ({}): {}",
            what,
            status,
            stderr.trim()
        )))
    }
}

fn collect_pipe<R: std::io::Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut buffer);
        }
        buffer
    })
}

/// What the environment builder needs from an installer backend
pub trait PackageInstaller {
    /// Name for log and error messages
    fn name(&self) -> &str;

    /// Whether the backend works without the interpreter's own pip
    fn standalone(&self) -> bool;

    /// Installs the given PEP 508 requirements into the venv
    fn install(
        &self,
        venv: &Path,
        requirements: &[String],
        limits: &CommandLimits,
    ) -> Result<(), Error>;

    /// Installs a pinned requirements document, verifying integrity hashes
    fn install_locked(&self, venv: &Path, pinned: &str, limits: &CommandLimits)
        -> Result<(), Error>;

    /// One `name==version` line per package installed in the venv
    fn freeze(&self, venv: &Path, limits: &CommandLimits) -> Result<String, Error>;

    /// Transitively resolves requirements into a pinned document with
    /// integrity hashes. Not every backend can.
    fn compile(&self, _requirements: &[String], _limits: &CommandLimits) -> Result<String, Error> {
        Err(Error::LockingUnsupported(self.name().to_string()))
    }
}

/// Drives a host pip against the target venv via `--python`
pub struct PipInstaller {
    /// Prefix that gets us a pip command line, e.g. `["python3", "-m", "pip"]`
    base_command: Vec<String>,
}

impl PipInstaller {
    pub fn new(base_command: Vec<String>) -> Self {
        debug_assert!(!base_command.is_empty());
        Self { base_command }
    }

    /// Drives the pip of the first python on PATH
    pub fn from_host_python() -> Self {
        let python = which::which("python3")
            .or_else(|_| which::which("python"))
            .map(|path| path.to_string_lossy().to_string())
            .unwrap_or_else(|_| "python3".to_string());
        Self::new(vec![python, "-m".to_string(), "pip".to_string()])
    }

    fn command(&self, venv: &Path) -> Command {
        let mut command = Command::new(&self.base_command[0]);
        command.args(&self.base_command[1..]);
        command.arg("--disable-pip-version-check");
        command.arg("--python");
        command.arg(venv_interpreter(venv));
        command
    }
}

impl PackageInstaller for PipInstaller {
    fn name(&self) -> &str {
        "pip"
    }

    fn standalone(&self) -> bool {
        false
    }

    fn install(
        &self,
        venv: &Path,
        requirements: &[String],
        limits: &CommandLimits,
    ) -> Result<(), Error> {
        let mut command = self.command(venv);
        command.arg("install").arg("-q").args(requirements);
        run_limited(command, None, limits, "pip install")?;
        Ok(())
    }

    fn install_locked(
        &self,
        venv: &Path,
        pinned: &str,
        limits: &CommandLimits,
    ) -> Result<(), Error> {
        let mut lockfile = tempfile::NamedTempFile::new()?;
        lockfile.write_all(pinned.as_bytes())?;
        let mut command = self.command(venv);
        command
            .arg("install")
            .arg("-q")
            .arg("--requirement")
            .arg(lockfile.path())
            .arg("--require-hashes");
        run_limited(command, None, limits, "pip install from lockfile")?;
        Ok(())
    }

    fn freeze(&self, venv: &Path, limits: &CommandLimits) -> Result<String, Error> {
        let mut command = self.command(venv);
        command.arg("freeze");
        Ok(run_limited(command, None, limits, "pip freeze")?.stdout)
    }
}

/// Drives uv, which brings its own resolver and doesn't need pip in the
/// parent interpreter
pub struct UvInstaller {
    uv: PathBuf,
}

impl UvInstaller {
    pub fn new(uv: PathBuf) -> Self {
        Self { uv }
    }

    /// Uses uv when it is on PATH
    pub fn locate() -> Option<Self> {
        which::which("uv").ok().map(Self::new)
    }

    fn command(&self, venv: &Path, subcommand: &str) -> Command {
        let mut command = Command::new(&self.uv);
        command.arg("pip").arg(subcommand);
        command.arg("--python");
        command.arg(venv_interpreter(venv));
        command
    }
}

impl PackageInstaller for UvInstaller {
    fn name(&self) -> &str {
        "uv"
    }

    fn standalone(&self) -> bool {
        true
    }

    fn install(
        &self,
        venv: &Path,
        requirements: &[String],
        limits: &CommandLimits,
    ) -> Result<(), Error> {
        let mut command = self.command(venv, "install");
        command.args(requirements);
        run_limited(command, None, limits, "uv pip install")?;
        Ok(())
    }

    fn install_locked(
        &self,
        venv: &Path,
        pinned: &str,
        limits: &CommandLimits,
    ) -> Result<(), Error> {
        let mut lockfile = tempfile::NamedTempFile::new()?;
        lockfile.write_all(pinned.as_bytes())?;
        let mut command = self.command(venv, "install");
        command
            .arg("--requirement")
            .arg(lockfile.path())
            .arg("--require-hashes");
        run_limited(command, None, limits, "uv pip install from lockfile")?;
        Ok(())
    }

    fn freeze(&self, venv: &Path, limits: &CommandLimits) -> Result<String, Error> {
        let command = self.command(venv, "freeze");
        Ok(run_limited(command, None, limits, "uv pip freeze")?.stdout)
    }

    fn compile(&self, requirements: &[String], limits: &CommandLimits) -> Result<String, Error> {
        let mut command = Command::new(&self.uv);
        command.args([
            "pip",
            "compile",
            "--universal",
            "--no-strip-markers",
            "--generate-hashes",
            "-",
        ]);
        let input = requirements.join("\n");
        Ok(run_limited(command, Some(&input), limits, "uv pip compile")?.stdout)
    }
}
