use std::io;

use thiserror::Error;

/// All the ways running a script environment can fail
#[derive(Debug, Error)]
pub enum Error {
    /// The inline metadata block itself doesn't parse (bad delimiters, bad TOML)
    #[error("Invalid inline metadata block: {0}")]
    SpecMalformed(String),
    /// The block parses but a version specifier or requirement inside it doesn't
    #[error("Invalid environment specification: {0}")]
    SpecInvalid(String),
    #[error("Could not find a python install satisfying the spec: {0}")]
    InterpreterNotFound(String),
    #[error("Failed to build environment: {0}")]
    BuildFailed(String),
    #[error("{0} can't resolve dependencies to a lockfile")]
    LockingUnsupported(String),
    #[error("Lockfile is missing the originating specification hash header")]
    LockfileHeaderMissing,
    #[error(
        "Lockfile was generated from a different specification \
        (spec hash is {expected}, lockfile header says {found})"
    )]
    LockfileMismatch { expected: String, found: String },
    #[error("No environment named {0} in the catalogue")]
    UnknownEnvironment(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("Failed to serialize the catalogue: {0}")]
    Serialize(#[from] serde_json::Error),
}
