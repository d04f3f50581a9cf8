//! Pinning a specification's dependencies for reproducible builds
//!
//! A lockfile is the installer's pinned resolution prefixed with a header
//! naming the fingerprint of the specification it was generated from:
//!
//! ```text
//! # Original Specification Hash: <64 hex digits>
//! requests==2.32.3 \
//!     --hash=sha256:...
//! ```
//!
//! Consumers refuse lockdata whose header is missing or names a different
//! fingerprint, so a stale lockfile can never silently install the wrong
//! pins.

use crate::error::Error;
use crate::installer::{CommandLimits, PackageInstaller};
use crate::spec::Specification;

pub const LOCK_HEADER_PREFIX: &str = "# Original Specification Hash: ";

/// Resolves and pins the spec's dependencies through the installer's compile
/// capability. A spec without dependencies has nothing to lock.
pub fn generate(
    spec: &Specification,
    installer: &dyn PackageInstaller,
    limits: &CommandLimits,
) -> Result<Option<String>, Error> {
    if spec.details.dependencies.is_empty() {
        return Ok(None);
    }
    let pinned = installer.compile(&spec.details.dependencies, limits)?;
    Ok(Some(format!(
        "{}{}\n{}",
        LOCK_HEADER_PREFIX,
        spec.fingerprint(),
        pinned
    )))
}

/// Checks the lockdata header against the spec and returns the pinned body
/// for the installer
pub fn consume<'a>(spec: &Specification, lockdata: &'a str) -> Result<&'a str, Error> {
    let (header, body) = lockdata.split_once('\n').unwrap_or((lockdata, ""));
    let found = header
        .trim_end()
        .strip_prefix(LOCK_HEADER_PREFIX)
        .ok_or(Error::LockfileHeaderMissing)?;
    if found != spec.fingerprint() {
        return Err(Error::LockfileMismatch {
            expected: spec.fingerprint().to_string(),
            found: found.to_string(),
        });
    }
    Ok(body)
}
