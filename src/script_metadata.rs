//! Extracts inline metadata blocks from python scripts
//!
//! <https://packaging.python.org/en/latest/specifications/inline-script-metadata/>
//!
//! A block looks like
//!
//! ```text
//! # /// script
//! # requires-python = ">=3.11"
//! # dependencies = ["requests"]
//! # ///
//! ```
//!
//! Every line between the markers must be a comment; the leading `# ` (or a bare
//! `#`) is stripped to recover the embedded TOML document. Only the block tagged
//! `script` is consumed further down, but we collect all of them so that other
//! tags at least get their delimiters checked.

use std::collections::BTreeMap;
use std::path::Path;

use fs_err as fs;
use regex::Regex;
use tracing::warn;

use crate::error::Error;

const BLOCK_PREFIX: &str = "# /// ";
const BLOCK_END: &str = "# ///";

/// The metadata blocks of one script, keyed by tag
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ScriptMetadata {
    pub blocks: BTreeMap<String, String>,
}

impl ScriptMetadata {
    pub fn parse_file(script: impl AsRef<Path>) -> Result<Self, Error> {
        let source = fs::read_to_string(script.as_ref())?;
        Self::parse_str(&source)
    }

    /// See the module level documentation for the accepted grammar
    pub fn parse_str(source: &str) -> Result<Self, Error> {
        let tag_re = Regex::new(r"^[a-zA-Z0-9-]+$").unwrap();
        let mut blocks: BTreeMap<String, String> = BTreeMap::new();
        // Tag of the block we're inside and the stripped lines collected so far
        let mut current: Option<(String, String)> = None;

        for line in source.lines() {
            current = match current.take() {
                Some((tag, mut content)) => {
                    if line == BLOCK_END {
                        if blocks.contains_key(&tag) {
                            return Err(Error::SpecMalformed(format!(
                                "Duplicate metadata block `{}`",
                                tag
                            )));
                        }
                        blocks.insert(tag, content);
                        None
                    } else if line == "#" {
                        content.push('\n');
                        Some((tag, content))
                    } else if let Some(rest) = line.strip_prefix("# ") {
                        content.push_str(rest);
                        content.push('\n');
                        Some((tag, content))
                    } else {
                        // A non-comment line before the end marker: the block
                        // was never closed and doesn't count
                        warn!("Unclosed metadata block `{}`, ignoring it", tag);
                        None
                    }
                }
                // Block openers always start with `# `, so a line can only open
                // a block when we're not inside one
                None => line
                    .strip_prefix(BLOCK_PREFIX)
                    .filter(|tag| tag_re.is_match(tag))
                    .map(|tag| (tag.to_string(), String::new())),
            };
        }

        if let Some((tag, _)) = current {
            warn!("Metadata block `{}` is still open at end of file", tag);
        }

        Ok(Self { blocks })
    }

    /// The raw TOML body of the `script` block, if the script has one
    pub fn script_block(&self) -> Option<&str> {
        self.blocks.get("script").map(String::as_str)
    }
}
