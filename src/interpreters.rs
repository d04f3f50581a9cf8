//! Discovering python installs on the host
//!
//! The catalogue doesn't care where interpreters come from, it walks whatever
//! an [InterpreterEnumerator] yields, in order, and takes the first match.
//! [SystemInterpreters] is the production enumerator: pyenv installs plus
//! whatever python is on PATH, newest version first.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use fs_err as fs;
use pep440_rs::Version;
use tracing::{debug, warn};

/// A candidate interpreter on the host system
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PythonInstall {
    pub executable: PathBuf,
    /// Dotted version, e.g. `3.12.5`
    pub version: String,
    /// Version of the pip importable from this install, if there is one
    pub pip_version: Option<String>,
}

impl PythonInstall {
    pub fn has_installer(&self) -> bool {
        self.pip_version.is_some()
    }
}

/// A finite, restartable sequence of candidate interpreters. The builder
/// respects the yielded order, so implementations decide priority by ordering.
pub trait InterpreterEnumerator {
    fn enumerate(&self) -> Vec<PythonInstall>;
}

/// The interpreter inside a venv, `bin/python` or `Scripts\python.exe`
pub fn venv_interpreter(venv: &Path) -> PathBuf {
    if cfg!(windows) {
        venv.join("Scripts").join("python.exe")
    } else {
        venv.join("bin").join("python")
    }
}

/// Enumerates pyenv installs and the pythons on PATH, highest version first
pub struct SystemInterpreters;

impl InterpreterEnumerator for SystemInterpreters {
    fn enumerate(&self) -> Vec<PythonInstall> {
        let mut seen = HashSet::new();
        let mut installs = Vec::new();
        for executable in pyenv_interpreters().into_iter().chain(path_interpreters()) {
            // PATH entries are usually symlinks into an install we already saw
            let canonical = fs::canonicalize(&executable).unwrap_or_else(|_| executable.clone());
            if !seen.insert(canonical) {
                continue;
            }
            let Some(version) = query_version(&executable) else {
                warn!(
                    "Python at {} did not report its version, skipping",
                    executable.display()
                );
                continue;
            };
            let pip_version = query_pip_version(&executable);
            debug!(
                "Found python {} at {} (pip: {})",
                version,
                executable.display(),
                pip_version.as_deref().unwrap_or("none")
            );
            installs.push(PythonInstall {
                executable,
                version,
                pip_version,
            });
        }
        sort_newest_first(&mut installs);
        installs
    }
}

/// `~/.pyenv/versions/<version>/bin/python` (or `$PYENV_ROOT`)
fn pyenv_interpreters() -> Vec<PathBuf> {
    let root = match env::var_os("PYENV_ROOT") {
        Some(root) => PathBuf::from(root),
        None => match dirs::home_dir() {
            Some(home) => home.join(".pyenv"),
            None => return Vec::new(),
        },
    };
    let Ok(version_dirs) = fs::read_dir(root.join("versions")) else {
        return Vec::new();
    };
    let mut found: Vec<PathBuf> = version_dirs
        .filter_map(|entry| entry.ok())
        .map(|entry| venv_interpreter(&entry.path()))
        .filter(|python| python.is_file())
        .collect();
    found.sort();
    found
}

fn path_interpreters() -> Vec<PathBuf> {
    ["python3", "python"]
        .iter()
        .filter_map(|name| which::which(name).ok())
        .collect()
}

fn query_version(executable: &Path) -> Option<String> {
    let output = Command::new(executable)
        .args(["-c", "import platform; print(platform.python_version())"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!version.is_empty()).then_some(version)
}

fn query_pip_version(executable: &Path) -> Option<String> {
    let output = Command::new(executable)
        .args(["-m", "pip", "--version"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_pip_version(&String::from_utf8_lossy(&output.stdout))
}

/// `pip 24.0 from /usr/lib/python3/dist-packages/pip (python 3.12)` -> `24.0`
fn parse_pip_version(output: &str) -> Option<String> {
    let mut words = output.split_whitespace();
    if words.next()? != "pip" {
        return None;
    }
    words.next().map(str::to_string)
}

fn sort_newest_first(installs: &mut [PythonInstall]) {
    installs.sort_by(|left, right| {
        let left = left.version.parse::<Version>().ok();
        let right = right.version.parse::<Version>().ok();
        // Unparseable versions go last
        right.partial_cmp(&left).unwrap_or(Ordering::Equal)
    });
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use super::{parse_pip_version, sort_newest_first, PythonInstall};

    fn install(version: &str) -> PythonInstall {
        PythonInstall {
            executable: PathBuf::from(format!("/opt/python{}/bin/python", version)),
            version: version.to_string(),
            pip_version: Some("24.0".to_string()),
        }
    }

    #[test]
    fn test_parse_pip_version() {
        assert_eq!(
            parse_pip_version("pip 24.0 from /usr/lib/python3/dist-packages/pip (python 3.12)"),
            Some("24.0".to_string())
        );
        assert_eq!(parse_pip_version("no pip here"), None);
        assert_eq!(parse_pip_version(""), None);
    }

    #[test]
    fn test_sort_newest_first() {
        let mut installs = vec![install("3.9.1"), install("3.12.5"), install("3.10.14")];
        sort_newest_first(&mut installs);
        let versions: Vec<&str> = installs
            .iter()
            .map(|install| install.version.as_str())
            .collect();
        assert_eq!(versions, ["3.12.5", "3.10.14", "3.9.1"]);
    }

    #[test]
    fn test_unparseable_versions_sort_last() {
        let mut installs = vec![install("mystery"), install("3.11.9")];
        sort_newest_first(&mut installs);
        assert_eq!(installs[0].version, "3.11.9");
    }
}
