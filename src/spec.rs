//! The environment specification of a single script invocation
//!
//! A [Specification] is the parsed `script` metadata block plus the verbatim
//! text it was parsed from. The verbatim text matters: its hash is the cache
//! key for the exact-match phase of the catalogue lookup, so two blocks that
//! differ only in whitespace are different specifications on purpose.

use std::path::Path;
use std::sync::OnceLock;

use pep440_rs::{Version, VersionSpecifiers};
use pep508_rs::Requirement;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::script_metadata::ScriptMetadata;

/// The keys of the `script` block we understand. Unknown keys are ignored,
/// `[tool.*]` tables are carried along verbatim for other consumers.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SpecDetails {
    #[serde(rename = "requires-python")]
    pub requires_python: Option<String>,
    pub dependencies: Vec<String>,
    pub tool: Option<toml::Table>,
}

#[derive(Debug, Clone)]
pub struct Specification {
    /// The metadata block exactly as it appeared in the script
    pub raw_text: String,
    pub details: SpecDetails,
    /// Pinned resolution produced by the lockfile engine, if the caller
    /// supplied one
    pub lockdata: Option<String>,
    fingerprint: OnceLock<String>,
}

impl PartialEq for Specification {
    fn eq(&self, other: &Self) -> bool {
        self.raw_text == other.raw_text && self.lockdata == other.lockdata
    }
}

impl Specification {
    /// Reads the script at `path` and parses its inline metadata. A script
    /// without a metadata block is a valid, empty specification.
    pub fn from_script(path: impl AsRef<Path>) -> Result<Self, Error> {
        let metadata = ScriptMetadata::parse_file(path)?;
        Self::from_raw(metadata.script_block().unwrap_or_default())
    }

    /// Parses the TOML body of a metadata block. Syntax errors surface here;
    /// bad version specifiers and requirements only surface in [Self::validate]
    /// so that they can all be reported at once.
    pub fn from_raw(raw_text: impl Into<String>) -> Result<Self, Error> {
        let raw_text = raw_text.into();
        let details = toml::from_str(&raw_text)
            .map_err(|err| Error::SpecMalformed(err.message().to_string()))?;
        Ok(Self {
            raw_text,
            details,
            lockdata: None,
            fingerprint: OnceLock::new(),
        })
    }

    /// Hex digest over the verbatim block text, the exact-match cache key
    pub fn fingerprint(&self) -> &str {
        self.fingerprint
            .get_or_init(|| format!("{:x}", Sha256::digest(self.raw_text.as_bytes())))
    }

    /// The same specification with a pinned dependency resolution attached.
    /// The raw text and with it the fingerprint are unchanged.
    pub fn with_lockdata(mut self, lockdata: impl Into<String>) -> Self {
        self.lockdata = Some(lockdata.into());
        self
    }

    /// All the reasons this specification can't be built, human readable and
    /// without short-circuiting. The catalogue refuses creation on a non-empty
    /// result.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if let Some(requires_python) = &self.details.requires_python {
            if let Err(err) = requires_python.parse::<VersionSpecifiers>() {
                errors.push(format!(
                    "Invalid python version specifier {:?}: {}",
                    requires_python, err
                ));
            }
        }
        for dependency in &self.details.dependencies {
            if let Err(err) = dependency.parse::<Requirement>() {
                errors.push(format!("Invalid dependency {:?}: {}", dependency, err));
            }
        }
        errors
    }

    /// The parsed `requires-python` constraint, if any
    pub fn requires_python(&self) -> Result<Option<VersionSpecifiers>, Error> {
        self.details
            .requires_python
            .as_deref()
            .map(|specifiers| {
                specifiers.parse::<VersionSpecifiers>().map_err(|err| {
                    Error::SpecInvalid(format!(
                        "Invalid python version specifier {:?}: {}",
                        specifiers, err
                    ))
                })
            })
            .transpose()
    }

    /// The dependency list parsed to PEP 508 requirements, in declaration order
    pub fn requirements(&self) -> Result<Vec<Requirement>, Error> {
        self.details
            .dependencies
            .iter()
            .map(|dependency| {
                dependency.parse::<Requirement>().map_err(|err| {
                    Error::SpecInvalid(format!("Invalid dependency {:?}: {}", dependency, err))
                })
            })
            .collect()
    }
}

/// Whether `version` is in `specifiers`, with the PEP 440 pre-release gate:
/// a pre-release or dev version only matches when one of the clauses names a
/// pre-release itself (`packaging`'s default behavior, which plain specifier
/// containment in pep440_rs doesn't apply).
pub(crate) fn specifiers_permit(specifiers: &VersionSpecifiers, version: &Version) -> bool {
    if !specifiers.contains(version) {
        return false;
    }
    if version.pre.is_none() && version.dev.is_none() {
        return true;
    }
    specifiers
        .to_string()
        .split(',')
        .any(|clause| clause_has_prerelease(clause))
}

fn clause_has_prerelease(clause: &str) -> bool {
    let version_text = clause
        .trim()
        .trim_start_matches(|c: char| "=<>!~".contains(c))
        .trim()
        .trim_end_matches(".*");
    match version_text.parse::<Version>() {
        Ok(version) => version.pre.is_some() || version.dev.is_some(),
        Err(_) => false,
    }
}
