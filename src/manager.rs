//! Ties config, catalogue, installer and interpreter discovery together
//!
//! This is the layer the CLI talks to: run a script in an environment that
//! satisfies its inline metadata, write a lockfile next to a script, clear or
//! purge the cache.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context};
use fs_err as fs;
use tracing::{debug, info};

use crate::catalogue::{Catalogue, Environment};
use crate::config::{Config, CONFIG_FILENAME};
use crate::installer::{CancelToken, CommandLimits, PackageInstaller, PipInstaller, UvInstaller};
use crate::interpreters::SystemInterpreters;
use crate::lockfile;
use crate::spec::Specification;

pub struct Manager {
    pub config: Config,
    installer: Box<dyn PackageInstaller>,
    interpreters: SystemInterpreters,
    cancel: CancelToken,
}

impl Manager {
    /// Loads the config from the default catalogue root
    pub fn new() -> Self {
        let config = Config::load(&crate::config::default_catalogue_root().join(CONFIG_FILENAME));
        Self::with_config(config)
    }

    pub fn with_config(config: Config) -> Self {
        let installer = choose_installer(&config);
        Self {
            config,
            installer,
            interpreters: SystemInterpreters,
            cancel: CancelToken::new(),
        }
    }

    /// The flag aborting any build in flight; hand it to a signal handler
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Finds or builds an environment for the script's inline metadata.
    /// Expired environments are cleared on the way, like on every catalogue
    /// access.
    pub fn script_environment(
        &self,
        script: &Path,
        lockdata: Option<String>,
    ) -> anyhow::Result<Environment> {
        let mut spec = Specification::from_script(script)
            .with_context(|| format!("Failed to read the spec from {}", script.display()))?;
        if let Some(lockdata) = lockdata {
            spec = spec.with_lockdata(lockdata);
        }
        let environment = Catalogue::with_lock(&self.config.catalogue_root, |catalogue| {
            catalogue.expire(self.config.cache_lifetime())?;
            catalogue.find_or_create(
                &spec,
                &self.config,
                self.installer.as_ref(),
                &self.interpreters,
                &self.cancel,
            )
        })?;
        Ok(environment)
    }

    /// Runs the script inside its environment and returns the exit code
    pub fn run_script(
        &self,
        script: &Path,
        args: &[String],
        lockfile_path: Option<&Path>,
    ) -> anyhow::Result<i32> {
        let lockdata = lockfile_path
            .map(fs::read_to_string)
            .transpose()
            .context("Failed to read the lockfile")?;
        let environment = self.script_environment(script, lockdata)?;
        info!("Using environment at {}", environment.path.display());

        let status = Command::new(environment.interpreter_path())
            .arg(script)
            .args(args)
            .status()
            .with_context(|| format!("Failed to launch {}", script.display()))?;
        debug!("Script exited with {}", status);
        Ok(status.code().unwrap_or(1))
    }

    /// Resolves and pins the script's dependencies, writing `<script>.lock`
    /// unless an output path is given. Returns the written path.
    pub fn write_lockfile(
        &self,
        script: &Path,
        output: Option<&Path>,
    ) -> anyhow::Result<PathBuf> {
        let spec = Specification::from_script(script)?;
        let limits = CommandLimits::new(self.config.lock_timeout(), &self.cancel);
        let Some(lockdata) = lockfile::generate(&spec, self.installer.as_ref(), &limits)? else {
            bail!(
                "{} declares no dependencies, there is nothing to lock",
                script.display()
            );
        };
        let path = match output {
            Some(path) => path.to_path_buf(),
            None => {
                let mut path = script.as_os_str().to_os_string();
                path.push(".lock");
                PathBuf::from(path)
            }
        };
        info!("Writing lockfile to {}", path.display());
        fs::write(&path, lockdata)?;
        Ok(path)
    }

    /// The environments currently in the catalogue
    pub fn list_environments(&self) -> anyhow::Result<Vec<Environment>> {
        let catalogue = Catalogue::load(&self.config.catalogue_root)?;
        Ok(catalogue.environments().to_vec())
    }

    /// Deletes expired environments, or all of them
    pub fn clear_cache(&self, all: bool) -> anyhow::Result<()> {
        let max_age = if all {
            chrono::Duration::zero()
        } else {
            self.config.cache_lifetime()
        };
        Catalogue::with_lock(&self.config.catalogue_root, |catalogue| {
            catalogue.expire(max_age)
        })?;
        Ok(())
    }

    /// Deletes the whole catalogue folder
    pub fn purge_cache(&self) -> anyhow::Result<()> {
        info!(
            "Deleting the environment catalogue at {}",
            self.config.catalogue_root.display()
        );
        Catalogue::with_lock(&self.config.catalogue_root, |catalogue| catalogue.purge())?;
        Ok(())
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

fn choose_installer(config: &Config) -> Box<dyn PackageInstaller> {
    if config.prefer_uv {
        if let Some(uv) = UvInstaller::locate() {
            return Box::new(uv);
        }
        debug!("uv is not on PATH, driving pip instead");
    }
    Box::new(PipInstaller::from_host_python())
}
