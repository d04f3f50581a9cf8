//! End-to-end catalogue tests against a fake python and a recording installer
//!
//! The fake python is a tiny shell script that stands in for
//! `python -m venv`, so these tests exercise the real build path (subprocess
//! included) without needing an actual python install.

#![cfg(unix)]

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use chrono::{NaiveDate, NaiveDateTime};
use fs_err as fs;
use scriptenv::installer::{CancelToken, CommandLimits, PackageInstaller};
use scriptenv::interpreters::{InterpreterEnumerator, PythonInstall};
use scriptenv::lockfile::LOCK_HEADER_PREFIX;
use scriptenv::{Catalogue, Config, Error, Specification};
use tempfile::TempDir;

/// A shell script that mimics `python -m venv --without-pip <target>`
fn fake_python(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(
        &path,
        "#!/bin/sh\n# stand-in for `python -m venv`\nmkdir -p \"$4/bin\"\ntouch \"$4/bin/python\"\n",
    )
    .unwrap();
    fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

struct StaticInterpreters(Vec<PythonInstall>);

impl InterpreterEnumerator for StaticInterpreters {
    fn enumerate(&self) -> Vec<PythonInstall> {
        self.0.clone()
    }
}

/// Pretends to install by remembering what was asked for and replaying it as
/// freeze output
struct FakeInstaller {
    /// requirement string -> freeze line
    pins: HashMap<String, String>,
    calls: Mutex<Vec<String>>,
    frozen: Mutex<Vec<String>>,
    fail_install: bool,
}

impl FakeInstaller {
    fn new(pins: &[(&str, &str)]) -> Self {
        Self {
            pins: pins
                .iter()
                .map(|(requirement, pin)| (requirement.to_string(), pin.to_string()))
                .collect(),
            calls: Mutex::new(Vec::new()),
            frozen: Mutex::new(Vec::new()),
            fail_install: false,
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl PackageInstaller for FakeInstaller {
    fn name(&self) -> &str {
        "fake"
    }

    fn standalone(&self) -> bool {
        true
    }

    fn install(
        &self,
        _venv: &Path,
        requirements: &[String],
        _limits: &CommandLimits,
    ) -> Result<(), Error> {
        if self.fail_install {
            return Err(Error::BuildFailed("injected install failure".to_string()));
        }
        self.calls
            .lock()
            .unwrap()
            .push(format!("install {}", requirements.join(" ")));
        *self.frozen.lock().unwrap() = requirements
            .iter()
            .map(|requirement| self.pins[requirement].clone())
            .collect();
        Ok(())
    }

    fn install_locked(
        &self,
        _venv: &Path,
        pinned: &str,
        _limits: &CommandLimits,
    ) -> Result<(), Error> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("install_locked {}", pinned.trim()));
        *self.frozen.lock().unwrap() = pinned
            .lines()
            .filter(|line| !line.starts_with('#') && line.contains("=="))
            .map(str::to_string)
            .collect();
        Ok(())
    }

    fn freeze(&self, _venv: &Path, _limits: &CommandLimits) -> Result<String, Error> {
        Ok(self.frozen.lock().unwrap().join("\n"))
    }
}

struct TestSetup {
    _dir: TempDir,
    root: PathBuf,
    config: Config,
    interpreters: StaticInterpreters,
    cancel: CancelToken,
}

impl TestSetup {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let python = fake_python(dir.path(), "python3.12");
        let root = dir.path().join("catalogue");
        let config = Config {
            catalogue_root: root.clone(),
            ..Config::default()
        };
        let interpreters = StaticInterpreters(vec![PythonInstall {
            executable: python,
            version: "3.12.5".to_string(),
            pip_version: Some("24.0".to_string()),
        }]);
        Self {
            _dir: dir,
            root,
            config,
            interpreters,
            cancel: CancelToken::new(),
        }
    }
}

fn spec_with_deps(dependencies: &str) -> Specification {
    Specification::from_raw(format!("dependencies = [{}]\n", dependencies)).unwrap()
}

#[test]
fn test_empty_spec_builds_once_and_reuses() {
    let setup = TestSetup::new();
    let installer = FakeInstaller::new(&[]);
    let spec = Specification::from_raw("").unwrap();
    let mut catalogue = Catalogue::new(setup.root.clone());

    let env = catalogue
        .find_or_create(
            &spec,
            &setup.config,
            &installer,
            &setup.interpreters,
            &setup.cancel,
        )
        .unwrap();
    assert_eq!(env.name, "env_0");
    assert_eq!(env.interpreter_version, "3.12.5");
    assert!(env.installed_packages.is_empty());
    assert_eq!(env.fingerprints, [spec.fingerprint()]);
    assert!(env.interpreter_path().is_file());
    // No dependencies, so the installer was never involved
    assert!(installer.calls().is_empty());

    let again = catalogue
        .find_or_create(
            &spec,
            &setup.config,
            &installer,
            &setup.interpreters,
            &setup.cancel,
        )
        .unwrap();
    assert_eq!(again.name, "env_0");
    assert_eq!(catalogue.environments().len(), 1);
}

#[test]
fn test_version_constraint_picks_matching_interpreter() {
    let setup = TestSetup::new();
    let old_python = fake_python(setup._dir.path(), "python3.10");
    let new_python = fake_python(setup._dir.path(), "python3.12");
    let interpreters = StaticInterpreters(vec![
        PythonInstall {
            executable: old_python,
            version: "3.10.2".to_string(),
            pip_version: Some("24.0".to_string()),
        },
        PythonInstall {
            executable: new_python.clone(),
            version: "3.12.1".to_string(),
            pip_version: Some("24.0".to_string()),
        },
    ]);
    let installer = FakeInstaller::new(&[]);
    let spec = Specification::from_raw("requires-python = \">=3.11\"\n").unwrap();
    let mut catalogue = Catalogue::new(setup.root.clone());

    let env = catalogue
        .find_or_create(&spec, &setup.config, &installer, &interpreters, &setup.cancel)
        .unwrap();
    assert_eq!(env.interpreter_version, "3.12.1");
    assert_eq!(env.parent_interpreter, new_python);
}

#[test]
fn test_sufficient_match_reuses_and_learns_fingerprint() {
    let setup = TestSetup::new();
    let installer = FakeInstaller::new(&[("requests>=2.30", "requests==2.32.3")]);
    let mut catalogue = Catalogue::new(setup.root.clone());

    let loose = spec_with_deps("\"requests>=2.30\"");
    let built = catalogue
        .find_or_create(
            &loose,
            &setup.config,
            &installer,
            &setup.interpreters,
            &setup.cancel,
        )
        .unwrap();
    assert_eq!(built.installed_packages, ["requests==2.32.3"]);

    // A stricter spec that the build happens to satisfy hits phase 2
    let stricter = spec_with_deps("\"requests>=2.32,<3\"");
    assert_ne!(loose.fingerprint(), stricter.fingerprint());
    let reused = catalogue
        .find_or_create(
            &stricter,
            &setup.config,
            &installer,
            &setup.interpreters,
            &setup.cancel,
        )
        .unwrap();
    assert_eq!(reused.name, built.name);
    assert_eq!(catalogue.environments().len(), 1);
    assert_eq!(
        reused.fingerprints,
        [loose.fingerprint(), stricter.fingerprint()]
    );
}

#[test]
fn test_pinned_and_range_specs_share_an_environment() {
    let setup = TestSetup::new();
    let installer = FakeInstaller::new(&[("cowsay==6.1", "cowsay==6.1")]);
    let mut catalogue = Catalogue::new(setup.root.clone());

    let pinned = spec_with_deps("\"cowsay==6.1\"");
    catalogue
        .find_or_create(
            &pinned,
            &setup.config,
            &installer,
            &setup.interpreters,
            &setup.cancel,
        )
        .unwrap();

    let range = spec_with_deps("\"cowsay>=6\"");
    let reused = catalogue
        .find_or_create(
            &range,
            &setup.config,
            &installer,
            &setup.interpreters,
            &setup.cancel,
        )
        .unwrap();
    assert_eq!(catalogue.environments().len(), 1);
    assert_eq!(reused.fingerprints.len(), 2);
    // Only the first spec triggered a build
    assert_eq!(installer.calls().len(), 1);
}

#[test]
fn test_eviction_keeps_the_most_recently_used() {
    static TICK: AtomicI64 = AtomicI64::new(0);
    fn ticking_clock() -> NaiveDateTime {
        let tick = TICK.fetch_add(1, Ordering::Relaxed);
        NaiveDate::from_ymd_opt(2024, 9, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
            + chrono::Duration::seconds(tick)
    }

    let setup = TestSetup::new();
    let config = Config {
        cache_max_count: 2,
        ..setup.config.clone()
    };
    let installer = FakeInstaller::new(&[
        ("first==1", "first==1"),
        ("second==1", "second==1"),
        ("third==1", "third==1"),
    ]);
    let mut catalogue = Catalogue::new(setup.root.clone());
    catalogue.set_clock(ticking_clock);

    let mut paths = Vec::new();
    for dependency in ["\"first==1\"", "\"second==1\"", "\"third==1\""] {
        let env = catalogue
            .find_or_create(
                &spec_with_deps(dependency),
                &config,
                &installer,
                &setup.interpreters,
                &setup.cancel,
            )
            .unwrap();
        paths.push(env.path.clone());
    }

    let names: Vec<&str> = catalogue
        .environments()
        .iter()
        .map(|env| env.name.as_str())
        .collect();
    assert_eq!(names, ["env_1", "env_2"]);
    // The evicted environment's directory is gone, the survivors are intact
    assert!(!paths[0].exists());
    assert!(paths[1].exists() && paths[2].exists());
    // Eviction doesn't rewind the counter
    assert_eq!(catalogue.counter(), 3);
}

#[test]
fn test_failed_build_does_not_evict() {
    let setup = TestSetup::new();
    let config = Config {
        cache_max_count: 1,
        ..setup.config.clone()
    };
    let good = FakeInstaller::new(&[("alpha==1", "alpha==1")]);
    let mut catalogue = Catalogue::new(setup.root.clone());
    let kept = catalogue
        .find_or_create(
            &spec_with_deps("\"alpha==1\""),
            &config,
            &good,
            &setup.interpreters,
            &setup.cancel,
        )
        .unwrap();

    // At capacity, a failing rebuild must not cost us the environment we have
    let mut bad = FakeInstaller::new(&[]);
    bad.fail_install = true;
    let err = catalogue
        .find_or_create(
            &spec_with_deps("\"beta==1\""),
            &config,
            &bad,
            &setup.interpreters,
            &setup.cancel,
        )
        .unwrap_err();
    assert!(matches!(err, Error::BuildFailed(_)), "{:?}", err);

    let names: Vec<&str> = catalogue
        .environments()
        .iter()
        .map(|env| env.name.as_str())
        .collect();
    assert_eq!(names, ["env_0"]);
    assert!(kept.path.exists());
    // Nothing about the eviction was persisted either
    let reloaded = Catalogue::load(&setup.root).unwrap();
    assert_eq!(reloaded.environments().len(), 1);
}

#[test]
fn test_lockfile_mismatch_aborts_before_building() {
    let setup = TestSetup::new();
    let installer = FakeInstaller::new(&[]);
    let spec = spec_with_deps("\"cowsay\"").with_lockdata(format!(
        "{}{}\ncowsay==6.1\n",
        LOCK_HEADER_PREFIX,
        "b".repeat(64)
    ));
    let mut catalogue = Catalogue::new(setup.root.clone());

    let err = catalogue
        .find_or_create(
            &spec,
            &setup.config,
            &installer,
            &setup.interpreters,
            &setup.cancel,
        )
        .unwrap_err();
    assert!(matches!(err, Error::LockfileMismatch { .. }), "{:?}", err);
    assert!(catalogue.environments().is_empty());
    assert!(!setup.root.join("env_0").exists());
    assert!(installer.calls().is_empty());
}

#[test]
fn test_lockdata_installs_pinned() {
    let setup = TestSetup::new();
    let installer = FakeInstaller::new(&[]);
    let spec = spec_with_deps("\"cowsay\"");
    let lockdata = format!(
        "{}{}\ncowsay==6.1\n",
        LOCK_HEADER_PREFIX,
        spec.fingerprint()
    );
    let spec = spec.with_lockdata(lockdata);
    let mut catalogue = Catalogue::new(setup.root.clone());

    let env = catalogue
        .find_or_create(
            &spec,
            &setup.config,
            &installer,
            &setup.interpreters,
            &setup.cancel,
        )
        .unwrap();
    assert_eq!(env.installed_packages, ["cowsay==6.1"]);
    let calls = installer.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].starts_with("install_locked"), "{:?}", calls);
}

#[test]
fn test_failed_install_leaves_no_trace() {
    let setup = TestSetup::new();
    let mut installer = FakeInstaller::new(&[("cowsay", "cowsay==6.1")]);
    installer.fail_install = true;
    let mut catalogue = Catalogue::new(setup.root.clone());

    let err = catalogue
        .find_or_create(
            &spec_with_deps("\"cowsay\""),
            &setup.config,
            &installer,
            &setup.interpreters,
            &setup.cancel,
        )
        .unwrap_err();
    assert!(matches!(err, Error::BuildFailed(_)), "{:?}", err);
    assert!(catalogue.environments().is_empty());
    // The partial venv was cleaned up
    assert!(!setup.root.join("env_0").exists());
}

#[test]
fn test_invalid_spec_is_rejected_before_building() {
    let setup = TestSetup::new();
    let installer = FakeInstaller::new(&[]);
    let spec = spec_with_deps("\"!!nonsense!!\"");
    let mut catalogue = Catalogue::new(setup.root.clone());

    let err = catalogue
        .find_or_create(
            &spec,
            &setup.config,
            &installer,
            &setup.interpreters,
            &setup.cancel,
        )
        .unwrap_err();
    assert!(matches!(err, Error::SpecInvalid(_)), "{:?}", err);
    assert!(catalogue.environments().is_empty());
}

#[test]
fn test_catalogue_survives_reload() {
    let setup = TestSetup::new();
    let installer = FakeInstaller::new(&[("rich", "rich==13.8.0")]);
    let spec = spec_with_deps("\"rich\"");
    let mut catalogue = Catalogue::new(setup.root.clone());
    catalogue
        .find_or_create(
            &spec,
            &setup.config,
            &installer,
            &setup.interpreters,
            &setup.cancel,
        )
        .unwrap();
    drop(catalogue);

    // A fresh load sees the environment and hits phase 1 without building
    let mut reloaded = Catalogue::load(&setup.root).unwrap();
    assert_eq!(reloaded.counter(), 1);
    let found = reloaded.find(&spec).unwrap().unwrap();
    assert_eq!(found.name, "env_0");
    assert_eq!(found.installed_packages, ["rich==13.8.0"]);
}
