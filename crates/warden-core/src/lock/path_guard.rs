//! Trusted-root path checks.
//!
//! Every state path (database, event log, lock directory, lock files) is
//! resolved through a [`PathGuard`] before it is opened. A path whose real
//! location is outside the root, or a lock file that is a symlink, is a
//! `SymlinkViolation` and the operation stops there.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::CoreError;

/// What a checked path is expected to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    File,
    Dir,
}

#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
}

impl PathGuard {
    /// Create (if needed) and canonicalize the trusted root.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, CoreError> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        let root = fs::canonicalize(root)?;
        if !root.is_dir() {
            return Err(CoreError::InvalidConfig(format!(
                "state root {} is not a directory",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Join `relative` onto the root and verify the result.
    ///
    /// Absolute paths and `..` components are rejected outright.
    pub fn resolve(&self, relative: impl AsRef<Path>, expect: Expect) -> Result<PathBuf, CoreError> {
        let relative = relative.as_ref();
        let escapes = relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)));
        if escapes {
            return Err(CoreError::SymlinkViolation {
                path: relative.to_path_buf(),
            });
        }
        let candidate = self.root.join(relative);
        self.verify(&candidate, expect)?;
        Ok(candidate)
    }

    /// Check an existing or about-to-be-created path.
    ///
    /// Existing paths must resolve inside the root and have the expected
    /// type. Missing paths must have a parent that resolves inside the root.
    pub fn verify(&self, path: &Path, expect: Expect) -> Result<(), CoreError> {
        match fs::symlink_metadata(path) {
            Ok(_) => {
                let real = fs::canonicalize(path)?;
                if !real.starts_with(&self.root) {
                    return Err(CoreError::SymlinkViolation {
                        path: path.to_path_buf(),
                    });
                }
                let meta = fs::metadata(&real)?;
                let type_ok = match expect {
                    Expect::File => meta.is_file(),
                    Expect::Dir => meta.is_dir(),
                };
                if !type_ok {
                    return Err(CoreError::SymlinkViolation {
                        path: path.to_path_buf(),
                    });
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let parent = path.parent().unwrap_or(&self.root);
                let real_parent = fs::canonicalize(parent)?;
                if real_parent.starts_with(&self.root) {
                    Ok(())
                } else {
                    Err(CoreError::SymlinkViolation {
                        path: path.to_path_buf(),
                    })
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Lock files must never be symlinks, not even ones pointing inside the root.
    pub fn verify_lock_file(&self, path: &Path) -> Result<(), CoreError> {
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_symlink() => Err(CoreError::SymlinkViolation {
                path: path.to_path_buf(),
            }),
            Ok(_) => self.verify(path, Expect::File),
            Err(e) if e.kind() == io::ErrorKind::NotFound => self.verify(path, Expect::File),
            Err(e) => Err(e.into()),
        }
    }
}
