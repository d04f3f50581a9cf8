//! The persistent registry of cached environments
//!
//! One catalogue root holds the venvs themselves plus `catalogue.json`, a
//! record of what each venv was built from and when it was last used. Lookup
//! runs in two phases:
//!
//! 1. *Exact*: an environment that has seen this exact metadata block text
//!    before (fingerprint membership) is reused as-is. This guarantees at
//!    most one build per exact spec text across invocations.
//! 2. *Sufficient*: otherwise any environment whose interpreter satisfies
//!    `requires-python` and whose installed packages satisfy every declared
//!    requirement is reused, and it learns the new fingerprint so the next
//!    run hits phase 1. Packages installed beyond what the spec asks for are
//!    no obstacle; that's what lets cache hits survive script evolution.
//!
//! The first match in persistence order wins in both phases. Every mutation
//! is followed by an atomic rewrite of `catalogue.json`.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use fs_err as fs;
use pep440_rs::Version;
use pep508_rs::VersionOrUrl;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::builder;
use crate::config::Config;
use crate::error::Error;
use crate::installer::{CancelToken, PackageInstaller};
use crate::interpreters::{venv_interpreter, InterpreterEnumerator};
use crate::lockfile;
use crate::spec::{specifiers_permit, Specification};
use crate::store::{self, CatalogueLock, CATALOGUE_FILENAME};

/// Timestamps are stored in this local-naive format; it compares
/// chronologically as a plain string
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Injectable time source so created/last-used stamps are testable
pub type Clock = fn() -> NaiveDateTime;

fn system_clock() -> NaiveDateTime {
    Local::now().naive_local()
}

fn default_clock() -> Clock {
    system_clock
}

/// One cached venv and the specs it is known to satisfy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    /// `env_<N>`; names are identifiers and never reused, even after eviction
    pub name: String,
    pub path: PathBuf,
    /// Dotted version of the interpreter inside, e.g. `3.12.5`
    pub interpreter_version: String,
    /// The install this venv was created from. Externally managed; if it
    /// disappears the environment is invalid.
    pub parent_interpreter: PathBuf,
    pub created_at: String,
    pub last_used_at: String,
    /// Fingerprints of every spec this environment has satisfied
    pub fingerprints: Vec<String>,
    /// Freeze output from build time, one `name==version` per line
    pub installed_packages: Vec<String>,
}

impl Environment {
    /// The interpreter inside this environment
    pub fn interpreter_path(&self) -> PathBuf {
        venv_interpreter(&self.path)
    }

    pub fn exists(&self) -> bool {
        self.interpreter_path().exists()
    }

    pub fn parent_exists(&self) -> bool {
        self.parent_interpreter.exists()
    }

    /// Usable only while both the venv and the interpreter it was built from
    /// still exist
    pub fn is_valid(&self) -> bool {
        self.exists() && self.parent_exists()
    }

    pub fn created_date(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&self.created_at, "%Y-%m-%dT%H:%M:%S%.f").ok()
    }

    /// Set semantics on an ordered list keeps the serialization stable
    fn push_fingerprint(&mut self, fingerprint: &str) {
        if !self.fingerprints.iter().any(|existing| existing == fingerprint) {
            self.fingerprints.push(fingerprint.to_string());
        }
    }

    fn remove_dir(&self) -> Result<(), Error> {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalogue {
    #[serde(skip)]
    root: PathBuf,
    #[serde(skip, default = "default_clock")]
    clock: Clock,
    /// Next `env_<N>` suffix; monotonic, eviction never decrements it
    #[serde(default)]
    counter: u64,
    /// Persistence order is iteration order and with it lookup tie-break order
    #[serde(default)]
    environments: Vec<Environment>,
}

impl Catalogue {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            clock: system_clock,
            counter: 0,
            environments: Vec::new(),
        }
    }

    /// Loads the catalogue at `root`. A missing or corrupt file is an empty
    /// catalogue (the corrupt file is left in place for the operator);
    /// environments whose venv or parent interpreter vanished are dropped.
    pub fn load(root: &Path) -> Result<Self, Error> {
        let path = root.join(CATALOGUE_FILENAME);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("No catalogue at {} yet", path.display());
                return Ok(Self::new(root.to_path_buf()));
            }
            Err(err) => return Err(err.into()),
        };
        let mut catalogue: Catalogue = match serde_json::from_str(&contents) {
            Ok(catalogue) => catalogue,
            Err(err) => {
                warn!(
                    "The catalogue at {} is corrupt ({}), starting over with an empty one",
                    path.display(),
                    err
                );
                return Ok(Self::new(root.to_path_buf()));
            }
        };
        catalogue.root = root.to_path_buf();
        catalogue.environments.retain(|env| {
            if env.is_valid() {
                true
            } else {
                warn!(
                    "Dropping environment {}: its directory or parent python {} is gone",
                    env.name,
                    env.parent_interpreter.display()
                );
                false
            }
        });
        Ok(catalogue)
    }

    /// Atomically rewrites `catalogue.json`; called after every mutation
    pub fn save(&self) -> Result<(), Error> {
        fs::create_dir_all(&self.root)?;
        let contents = serde_json::to_string_pretty(self)?;
        store::write_atomic(&self.root.join(CATALOGUE_FILENAME), &contents)?;
        Ok(())
    }

    /// Acquires the cross-process lock for `root`, loads the catalogue and
    /// runs `f` on it. The lock is released on every exit path.
    pub fn with_lock<T>(
        root: &Path,
        f: impl FnOnce(&mut Catalogue) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let _lock = CatalogueLock::acquire(root)?;
        let mut catalogue = Self::load(root)?;
        f(&mut catalogue)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn environments(&self) -> &[Environment] {
        &self.environments
    }

    pub fn get(&self, name: &str) -> Option<&Environment> {
        self.environments.iter().find(|env| env.name == name)
    }

    /// Testing hook: replaces the time source for new timestamps
    pub fn set_clock(&mut self, clock: Clock) {
        self.clock = clock;
    }

    fn now(&self) -> String {
        (self.clock)().format(TIMESTAMP_FORMAT).to_string()
    }

    /// Two-phase lookup, see the module documentation. A hit updates
    /// `last_used_at` (and in phase 2 the fingerprint list) and saves.
    pub fn find(&mut self, spec: &Specification) -> Result<Option<Environment>, Error> {
        if let Some(index) = self.find_exact(spec) {
            debug!(
                "Fingerprint {} matched environment {}",
                spec.fingerprint(),
                self.environments[index].name
            );
            self.environments[index].last_used_at = self.now();
            self.save()?;
            return Ok(Some(self.environments[index].clone()));
        }
        if let Some(index) = self.find_sufficient(spec)? {
            debug!(
                "Spec satisfied by {}, adding {} to its fingerprints",
                self.environments[index].name,
                spec.fingerprint()
            );
            let now = self.now();
            let env = &mut self.environments[index];
            env.last_used_at = now;
            env.push_fingerprint(spec.fingerprint());
            self.save()?;
            return Ok(Some(self.environments[index].clone()));
        }
        Ok(None)
    }

    fn find_exact(&self, spec: &Specification) -> Option<usize> {
        let fingerprint = spec.fingerprint();
        self.environments.iter().position(|env| {
            env.fingerprints
                .iter()
                .any(|existing| existing == fingerprint)
        })
    }

    fn find_sufficient(&self, spec: &Specification) -> Result<Option<usize>, Error> {
        let requires_python = spec.requires_python()?;
        let requirements = spec.requirements()?;
        'environments: for (index, env) in self.environments.iter().enumerate() {
            if let Some(specifiers) = &requires_python {
                let version = match env.interpreter_version.parse::<Version>() {
                    Ok(version) => version,
                    Err(_) => {
                        warn!(
                            "Environment {} has unparseable python version {:?}",
                            env.name, env.interpreter_version
                        );
                        continue;
                    }
                };
                if !specifiers_permit(specifiers, &version) {
                    continue;
                }
            }
            // name -> installed version, from the freeze output at build time.
            // Lines that aren't `name==version` can't prove anything, skip them.
            let installed: HashMap<&str, Version> = env
                .installed_packages
                .iter()
                .filter_map(|line| {
                    let (name, version) = line.split_once("==")?;
                    Some((name, version.parse::<Version>().ok()?))
                })
                .collect();
            for requirement in &requirements {
                let Some(version) = installed.get(requirement.name.as_str()) else {
                    continue 'environments;
                };
                match &requirement.version_or_url {
                    None => {}
                    Some(VersionOrUrl::VersionSpecifier(specifiers)) => {
                        if !specifiers_permit(specifiers, version) {
                            continue 'environments;
                        }
                    }
                    // A url requirement can't be proven satisfied by a version
                    // number alone
                    Some(VersionOrUrl::Url(_)) => continue 'environments,
                }
            }
            return Ok(Some(index));
        }
        Ok(None)
    }

    /// Builds a new environment for the spec. Least recently used
    /// environments beyond the configured bound are evicted, but the
    /// eviction only takes effect together with the insert once the build
    /// has succeeded: a failed or cancelled build leaves the catalogue
    /// exactly as it was.
    pub fn create(
        &mut self,
        spec: &Specification,
        config: &Config,
        installer: &dyn PackageInstaller,
        interpreters: &dyn InterpreterEnumerator,
        cancel: &CancelToken,
    ) -> Result<Environment, Error> {
        let errors = spec.validate();
        if !errors.is_empty() {
            return Err(Error::SpecInvalid(errors.join("; ")));
        }

        // Everything that can fail cheaply fails before the build: a missing
        // interpreter or a stale lockfile must leave the catalogue untouched
        let candidates = interpreters.enumerate();
        let parent = builder::select_interpreter(spec, &candidates, installer)?;
        let pinned = spec
            .lockdata
            .as_deref()
            .map(|lockdata| lockfile::consume(spec, lockdata))
            .transpose()?;

        // Pick which environments make room for the new one, but don't touch
        // them yet: they are only removed once the build has succeeded
        let mut victims: Vec<String> = Vec::new();
        while self.environments.len() - victims.len() >= config.cache_max_count {
            let Some(oldest) = self.oldest_environment(&victims) else {
                break;
            };
            victims.push(oldest);
        }

        let name = format!("env_{}", self.counter);
        self.counter += 1;
        let target = self.root.join(&name);
        if target.exists() {
            return Err(Error::BuildFailed(format!(
                "The environment directory {} already exists, clear the cache to recover",
                target.display()
            )));
        }
        let timestamp = self.now();
        let environment = builder::build(
            spec,
            parent,
            pinned,
            &name,
            &target,
            config,
            installer,
            cancel,
            timestamp,
        )?;
        // One mutation: the evicted environments go out, the new one goes in,
        // so the count never exceeds the bound and a reader of the state file
        // sees either the old catalogue or the new one
        for victim in &victims {
            info!("Evicting least recently used environment {}", victim);
            self.remove_environment(victim)?;
        }
        self.environments.push(environment.clone());
        self.save()?;
        Ok(environment)
    }

    pub fn find_or_create(
        &mut self,
        spec: &Specification,
        config: &Config,
        installer: &dyn PackageInstaller,
        interpreters: &dyn InterpreterEnumerator,
        cancel: &CancelToken,
    ) -> Result<Environment, Error> {
        if let Some(environment) = self.find(spec)? {
            return Ok(environment);
        }
        info!("No cached environment satisfies the spec, building a new one");
        self.create(spec, config, installer, interpreters, cancel)
    }

    /// First environment with the smallest `last_used_at` (the timestamp
    /// format makes string order chronological order), ignoring the already
    /// chosen eviction victims
    fn oldest_environment(&self, excluded: &[String]) -> Option<String> {
        let mut oldest: Option<&Environment> = None;
        for env in &self.environments {
            if excluded.contains(&env.name) {
                continue;
            }
            match oldest {
                Some(current) if env.last_used_at < current.last_used_at => oldest = Some(env),
                None => oldest = Some(env),
                _ => {}
            }
        }
        oldest.map(|env| env.name.clone())
    }

    fn remove_environment(&mut self, name: &str) -> Result<(), Error> {
        let index = self
            .environments
            .iter()
            .position(|env| env.name == name)
            .ok_or_else(|| Error::UnknownEnvironment(name.to_string()))?;
        self.environments[index].remove_dir()?;
        self.environments.remove(index);
        Ok(())
    }

    /// Deletes one environment, directory included
    pub fn delete(&mut self, name: &str) -> Result<(), Error> {
        self.remove_environment(name)?;
        self.save()
    }

    /// Deletes every environment older than `max_age`; saves once at the end
    pub fn expire(&mut self, max_age: chrono::Duration) -> Result<(), Error> {
        let now = (self.clock)();
        let expired: Vec<String> = self
            .environments
            .iter()
            .filter(|env| match env.created_date() {
                Some(created) => now - created > max_age,
                None => {
                    warn!(
                        "Environment {} has an unreadable creation time {:?}, expiring it",
                        env.name, env.created_at
                    );
                    true
                }
            })
            .map(|env| env.name.clone())
            .collect();
        for name in &expired {
            debug!("Expiring environment {}", name);
            self.remove_environment(name)?;
        }
        self.save()
    }

    /// Removes the whole catalogue folder, state file included
    pub fn purge(&mut self) -> Result<(), Error> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.environments.clear();
        Ok(())
    }
}
