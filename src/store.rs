//! Atomic persistence and cross-process locking for the catalogue file
//!
//! The catalogue document on disk is the only resource shared between
//! concurrently running invocations. Writes always go through
//! write-temp-then-rename so a reader sees either the old or the new document,
//! never a truncated one. Invocations that mutate the catalogue additionally
//! hold an advisory lock on `catalogue.lock` across the whole
//! read-modify-write cycle.

use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use fs_err as fs;
use fs_err::File;
use tracing::warn;

pub const CATALOGUE_FILENAME: &str = "catalogue.json";
const LOCK_FILENAME: &str = "catalogue.lock";

/// Writes `contents` to `<path>.tmp` next to the target, then renames over it
pub fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Holding a `CatalogueLock` means this invocation owns the catalogue at
/// `root` for a whole read-modify-write cycle. Dropping the guard releases
/// the lock on every exit path, panics included; the `catalogue.lock` file
/// itself stays behind, only the flock on it goes away.
pub struct CatalogueLock {
    root: PathBuf,
    lockfile: File,
}

impl CatalogueLock {
    /// Takes the exclusive lock for `root`, creating the folder on first
    /// use. When another invocation is working on the same catalogue this
    /// says so and waits for it to finish.
    pub fn acquire(root: &Path) -> io::Result<Self> {
        fs::create_dir_all(root)?;
        let lockfile = File::create(root.join(LOCK_FILENAME))?;
        if lockfile.file().try_lock_exclusive().is_err() {
            warn!(
                "The environment catalogue at {} is locked by another process, \
                waiting for it to finish",
                root.display()
            );
            lockfile.file().lock_exclusive()?;
        }
        Ok(Self {
            root: root.to_path_buf(),
            lockfile,
        })
    }

    /// Non-blocking variant; `None` means another invocation currently owns
    /// this catalogue
    pub fn try_acquire(root: &Path) -> io::Result<Option<Self>> {
        fs::create_dir_all(root)?;
        let lockfile = File::create(root.join(LOCK_FILENAME))?;
        match lockfile.file().try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                root: root.to_path_buf(),
                lockfile,
            })),
            Err(_) => Ok(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for CatalogueLock {
    fn drop(&mut self) {
        if let Err(err) = self.lockfile.file().unlock() {
            // Other invocations stay blocked until this process exits
            warn!(
                "Failed to release the catalogue lock at {}: {}",
                self.root.join(LOCK_FILENAME).display(),
                err
            );
        }
    }
}
