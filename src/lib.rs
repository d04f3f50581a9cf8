//! Run single-file python scripts with inline dependencies in cached
//! virtualenvs
//!
//! Scripts declare what they need in an inline metadata block
//! (`# /// script` ... `# ///`). On every run we either find a cached
//! environment that satisfies the declaration or build a new one, then run
//! the script inside it. See [catalogue::Catalogue] for the lookup contract.

pub use crate::catalogue::{Catalogue, Environment};
pub use crate::cli::{run_cli, Cli};
pub use crate::config::Config;
pub use crate::error::Error;
pub use crate::manager::Manager;
pub use crate::spec::Specification;

pub mod builder;
pub mod catalogue;
mod cli;
pub mod config;
mod error;
pub mod installer;
pub mod interpreters;
pub mod lockfile;
mod manager;
pub mod script_metadata;
pub mod spec;
pub mod store;
