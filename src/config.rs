//! User configuration and the platform default catalogue location

use std::path::{Path, PathBuf};
use std::time::Duration;

use fs_err as fs;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const CONFIG_FILENAME: &str = "config.json";

/// `~/.cache/scriptenv` on linux, the equivalent elsewhere
pub fn default_catalogue_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(env!("CARGO_PKG_NAME"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where the catalogue file and the environments live
    pub catalogue_root: PathBuf,
    /// Least recently used environments beyond this count are evicted
    pub cache_max_count: usize,
    /// Environments built longer ago than this are deleted on the next run
    pub cache_lifetime_days: u32,
    /// Install with uv when it is on PATH instead of driving pip
    pub prefer_uv: bool,
    /// Subprocess timeouts, in seconds
    pub venv_timeout_secs: u64,
    pub install_timeout_secs: u64,
    pub freeze_timeout_secs: u64,
    pub lock_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            catalogue_root: default_catalogue_root(),
            cache_max_count: 10,
            cache_lifetime_days: 14,
            prefer_uv: true,
            venv_timeout_secs: 60,
            install_timeout_secs: 600,
            freeze_timeout_secs: 60,
            lock_timeout_secs: 600,
        }
    }
}

impl Config {
    /// Reads `config.json`, falling back to the defaults when the file is
    /// missing or unreadable. A broken config should never keep a script from
    /// running.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => config,
                Err(err) => {
                    warn!("Ignoring invalid config at {}: {}", path.display(), err);
                    Self::default()
                }
            },
            Err(err) => {
                debug!("No config at {} ({}), using defaults", path.display(), err);
                Self::default()
            }
        }
    }

    pub fn cache_lifetime(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.cache_lifetime_days))
    }

    pub fn venv_timeout(&self) -> Duration {
        Duration::from_secs(self.venv_timeout_secs)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn freeze_timeout(&self) -> Duration {
        Duration::from_secs(self.freeze_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}
