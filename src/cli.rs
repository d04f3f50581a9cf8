use std::path::PathBuf;

use clap::Parser;

use crate::manager::Manager;

#[derive(Parser)]
#[clap(version, about)]
pub enum Cli {
    /// Run a python script in an environment satisfying its inline metadata.
    ///
    /// The environment is cached: running the same script (or any script with
    /// a compatible metadata block) again reuses it instead of rebuilding.
    #[clap(trailing_var_arg = true)]
    Run {
        /// Install from this lockfile instead of resolving the loose
        /// dependency list
        #[clap(long)]
        lockfile: Option<PathBuf>,
        script: PathBuf,
        /// Arguments passed through to the script
        args: Vec<String>,
    },
    /// Resolve the script's dependencies and pin them into a lockfile
    Lock {
        script: PathBuf,
        /// Where to write the lockfile (default: `<script>.lock`)
        #[clap(long, short)]
        output: Option<PathBuf>,
    },
    /// List the cached environments
    List,
    /// Delete expired environments (all of them with `--all`)
    Clear {
        #[clap(long)]
        all: bool,
    },
    /// Delete the whole environment catalogue, state file included
    Purge,
}

pub fn run_cli(cli: Cli) -> anyhow::Result<Option<i32>> {
    let manager = Manager::new();
    match cli {
        Cli::Run {
            lockfile,
            script,
            args,
        } => {
            let exit_code = manager.run_script(&script, &args, lockfile.as_deref())?;
            Ok(Some(exit_code))
        }
        Cli::Lock { script, output } => {
            let path = manager.write_lockfile(&script, output.as_deref())?;
            println!("{}", path.display());
            Ok(None)
        }
        Cli::List => {
            for env in manager.list_environments()? {
                println!(
                    "{}: python {} with {} packages, last used {}",
                    env.name,
                    env.interpreter_version,
                    env.installed_packages.len(),
                    env.last_used_at
                );
            }
            Ok(None)
        }
        Cli::Clear { all } => {
            manager.clear_cache(all)?;
            Ok(None)
        }
        Cli::Purge => {
            manager.purge_cache()?;
            Ok(None)
        }
    }
}
