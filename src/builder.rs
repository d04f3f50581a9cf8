//! Materializing a virtual environment for a specification
//!
//! Given a validated spec and a catalogue-assigned target directory, pick an
//! interpreter from the enumerator, create an empty venv with it, install the
//! declared (or pinned) dependencies and freeze the result. Any failure on the
//! way removes the partial directory so the catalogue never learns about it.

use std::io;
use std::path::Path;
use std::process::Command;

use fs_err as fs;
use pep440_rs::Version;
use tracing::{debug, warn};

use crate::catalogue::Environment;
use crate::config::Config;
use crate::error::Error;
use crate::installer::{run_limited, CancelToken, CommandLimits, PackageInstaller};
use crate::interpreters::PythonInstall;
use crate::spec::{specifiers_permit, Specification};

/// pip learned `--python` in 22.3, older ones can't target a foreign venv
const MINIMUM_PIP: &[usize] = &[22, 3];

/// Picks the first enumerated interpreter that can drive the installer and
/// satisfies `requires-python`, if the spec has one. The enumerator's order
/// is the priority order.
pub fn select_interpreter(
    spec: &Specification,
    candidates: &[PythonInstall],
    installer: &dyn PackageInstaller,
) -> Result<PythonInstall, Error> {
    let requires_python = spec.requires_python()?;
    for candidate in candidates {
        if !installer.standalone() {
            let Some(pip_version) = &candidate.pip_version else {
                debug!(
                    "Python at {} has no pip installed, skipping",
                    candidate.executable.display()
                );
                continue;
            };
            match pip_version.parse::<Version>() {
                Ok(pip) if pip.release.as_slice() < MINIMUM_PIP => {
                    debug!(
                        "Python at {} has pip {} without `--python` support, skipping",
                        candidate.executable.display(),
                        pip_version
                    );
                    continue;
                }
                Ok(_) => {}
                Err(_) => {
                    warn!(
                        "Python at {} reports unparseable pip version {:?}, skipping",
                        candidate.executable.display(),
                        pip_version
                    );
                    continue;
                }
            }
        }
        let version = match candidate.version.parse::<Version>() {
            Ok(version) => version,
            Err(_) => {
                warn!(
                    "Skipping python with unparseable version {:?} at {}",
                    candidate.version,
                    candidate.executable.display()
                );
                continue;
            }
        };
        if let Some(specifiers) = &requires_python {
            if !specifiers_permit(specifiers, &version) {
                continue;
            }
        }
        return Ok(candidate.clone());
    }
    Err(Error::InterpreterNotFound(
        spec.details
            .requires_python
            .clone()
            .unwrap_or_else(|| "any version".to_string()),
    ))
}

/// Builds the environment for `spec` at `target` from the already selected
/// `parent` interpreter. On failure the partially built directory is removed;
/// inserting the result into the catalogue is the caller's job.
#[allow(clippy::too_many_arguments)]
pub fn build(
    spec: &Specification,
    parent: PythonInstall,
    pinned: Option<&str>,
    name: &str,
    target: &Path,
    config: &Config,
    installer: &dyn PackageInstaller,
    cancel: &CancelToken,
    timestamp: String,
) -> Result<Environment, Error> {
    debug!(
        "Building with python {} at {}",
        parent.version,
        parent.executable.display()
    );

    let result = create_venv(
        &parent.executable,
        target,
        &CommandLimits::new(config.venv_timeout(), cancel),
    )
    .and_then(|()| install_and_freeze(spec, pinned, target, config, installer, cancel));
    let installed_packages = match result {
        Ok(packages) => packages,
        Err(err) => {
            remove_partial(target);
            return Err(err);
        }
    };

    Ok(Environment {
        name: name.to_string(),
        path: target.to_path_buf(),
        interpreter_version: parent.version,
        parent_interpreter: parent.executable,
        created_at: timestamp.clone(),
        last_used_at: timestamp,
        fingerprints: vec![spec.fingerprint().to_string()],
        installed_packages,
    })
}

fn create_venv(interpreter: &Path, target: &Path, limits: &CommandLimits) -> Result<(), Error> {
    debug!("Creating venv in {}", target.display());
    let mut command = Command::new(interpreter);
    command.args(["-m", "venv", "--without-pip"]).arg(target);
    run_limited(command, None, limits, "venv creation")?;
    Ok(())
}

fn install_and_freeze(
    spec: &Specification,
    pinned: Option<&str>,
    target: &Path,
    config: &Config,
    installer: &dyn PackageInstaller,
    cancel: &CancelToken,
) -> Result<Vec<String>, Error> {
    if spec.details.dependencies.is_empty() {
        return Ok(Vec::new());
    }
    let limits = CommandLimits::new(config.install_timeout(), cancel);
    match pinned {
        Some(pinned) => {
            debug!("Installing pinned dependencies from the lockfile");
            installer.install_locked(target, pinned, &limits)?;
        }
        None => {
            debug!(
                "Installing dependencies from PyPI: {}",
                spec.details.dependencies.join(", ")
            );
            installer.install(target, &spec.details.dependencies, &limits)?;
        }
    }
    let freeze = installer.freeze(
        target,
        &CommandLimits::new(config.freeze_timeout(), cancel),
    )?;
    Ok(freeze
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

fn remove_partial(target: &Path) {
    if let Err(err) = fs::remove_dir_all(target) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(
                "Failed to remove partial environment at {}: {}",
                target.display(),
                err
            );
        }
    }
}
