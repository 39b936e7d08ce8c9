//! Lock & Ledger layer.
//!
//! Scoped exclusive locks on named resources (`task-store`, `events`,
//! `budget`, `gate-<task>`, `breaker-<key>`). Acquisition retries with
//! exponential backoff and gives up with `LockTimeout`.
//!
//! # Backends
//! - **Files**: one `<name>.lock` file per held lock under the state root,
//!   created with `create_new` (O_EXCL). Works across worker processes.
//! - **InProcess**: a set of held names. For tests and single-process use.

pub mod path_guard;

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::error::CoreError;
pub use path_guard::{Expect, PathGuard};

/// Backoff and timeout bounds of lock acquisition.
#[derive(Debug, Clone)]
pub struct LockPolicy {
    /// Wait after the first failed attempt.
    pub initial_backoff: Duration,
    /// Upper bound of a single wait.
    pub max_backoff: Duration,
    pub max_attempts: u32,
    /// A lock file older than this is considered abandoned by a crashed holder.
    pub stale_after: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(500),
            max_attempts: 12,
            stale_after: Duration::from_secs(60),
        }
    }
}

impl LockPolicy {
    /// delay = initial_backoff * 2^(attempt - 1), capped at `max_backoff`.
    ///
    /// With initial=5ms, max=500ms: 5, 10, 20, 40, 80, 160, 320, 500, 500...
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

#[derive(Clone)]
enum Backend {
    Files { guard: PathGuard, dir: PathBuf },
    InProcess(Arc<Mutex<HashSet<String>>>),
}

/// Hands out [`LockGuard`]s. Cheap to clone; clones share the backend.
#[derive(Clone)]
pub struct LockManager {
    backend: Backend,
    policy: LockPolicy,
}

impl LockManager {
    /// File locks under `<root>/<dir_name>`.
    pub fn files(guard: &PathGuard, dir_name: &str, policy: LockPolicy) -> Result<Self, CoreError> {
        let dir = guard.root().join(dir_name);
        guard.verify(&dir, Expect::Dir)?;
        fs::create_dir_all(&dir)?;
        guard.verify(&dir, Expect::Dir)?;
        Ok(Self {
            backend: Backend::Files {
                guard: guard.clone(),
                dir,
            },
            policy,
        })
    }

    pub fn in_process(policy: LockPolicy) -> Self {
        Self {
            backend: Backend::InProcess(Arc::new(Mutex::new(HashSet::new()))),
            policy,
        }
    }

    pub fn policy(&self) -> &LockPolicy {
        &self.policy
    }

    /// Acquire `resource`, waiting with backoff.
    pub async fn acquire(&self, resource: &str) -> Result<LockGuard, CoreError> {
        let name = sanitize(resource);
        let attempts = self.policy.max_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(guard) = self.try_acquire(&name)? {
                return Ok(guard);
            }
            if attempt < attempts {
                let delay = self.policy.next_delay(attempt);
                debug!(resource = %name, attempt, ?delay, "lock busy, backing off");
                tokio::time::sleep(delay).await;
            }
        }
        warn!(resource = %name, attempts, "lock timeout");
        Err(CoreError::LockTimeout {
            resource: name,
            attempts,
        })
    }

    /// Single non-blocking attempt.
    pub fn try_acquire(&self, resource: &str) -> Result<Option<LockGuard>, CoreError> {
        let name = sanitize(resource);
        match &self.backend {
            Backend::InProcess(held) => {
                let mut set = held.lock().unwrap_or_else(|e| e.into_inner());
                if !set.insert(name.clone()) {
                    return Ok(None);
                }
                Ok(Some(LockGuard {
                    release: Release::InProcess {
                        held: Arc::clone(held),
                        name,
                    },
                }))
            }
            Backend::Files { guard, dir } => {
                let path = dir.join(format!("{name}.lock"));
                guard.verify_lock_file(&path)?;
                match create_lock_file(&path) {
                    Ok(()) => Ok(Some(LockGuard {
                        release: Release::File(path),
                    })),
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                        if self.is_abandoned(&path) {
                            return self.break_abandoned(guard, dir, &name);
                        }
                        Ok(None)
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Replace an abandoned `<name>.lock`.
    ///
    /// Breakers serialize on `<name>.lock.break` and re-check the age under
    /// it, so a lock another contender has just re-created is never removed.
    fn break_abandoned(
        &self,
        guard: &PathGuard,
        dir: &std::path::Path,
        name: &str,
    ) -> Result<Option<LockGuard>, CoreError> {
        let path = dir.join(format!("{name}.lock"));
        let breaker = dir.join(format!("{name}.lock.break"));
        guard.verify_lock_file(&breaker)?;
        match create_lock_file(&breaker) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // a breaker that crashed mid-break
                if self.is_abandoned(&breaker) {
                    let _ = fs::remove_file(&breaker);
                }
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }
        let _breaking = LockGuard {
            release: Release::File(breaker),
        };

        if !self.is_abandoned(&path) {
            return Ok(None);
        }
        warn!(path = %path.display(), "breaking abandoned lock");
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match create_lock_file(&path) {
            Ok(()) => Ok(Some(LockGuard {
                release: Release::File(path),
            })),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn is_abandoned(&self, path: &std::path::Path) -> bool {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age > self.policy.stale_after)
    }
}

/// Released on drop.
pub struct LockGuard {
    release: Release,
}

enum Release {
    File(PathBuf),
    InProcess {
        held: Arc<Mutex<HashSet<String>>>,
        name: String,
    },
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match &self.release {
            Release::File(path) => {
                if let Err(e) = fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "failed to release lock file");
                }
            }
            Release::InProcess { held, name } => {
                held.lock().unwrap_or_else(|e| e.into_inner()).remove(name);
            }
        }
    }
}

fn create_lock_file(path: &std::path::Path) -> io::Result<()> {
    // create_new は既存の symlink も辿らずに失敗する
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(())
}

/// Lock names become file names; keep them to a safe alphabet.
fn sanitize(resource: &str) -> String {
    resource
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    fn fast_policy(max_attempts: u32) -> LockPolicy {
        LockPolicy {
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            max_attempts,
            stale_after: Duration::from_secs(60),
        }
    }

    #[rstest]
    #[case(1, 5)]
    #[case(2, 10)]
    #[case(3, 20)]
    #[case(4, 40)]
    #[case(8, 500)]
    #[case(40, 500)]
    fn backoff_doubles_up_to_cap(#[case] attempt: u32, #[case] expected_ms: u64) {
        let policy = LockPolicy::default();
        assert_eq!(policy.next_delay(attempt), Duration::from_millis(expected_ms));
    }

    #[tokio::test]
    async fn in_process_lock_is_exclusive_until_dropped() {
        let locks = LockManager::in_process(fast_policy(3));

        let held = locks.acquire("task-store").await.unwrap();
        assert!(locks.try_acquire("task-store").unwrap().is_none());
        assert!(locks.try_acquire("events").unwrap().is_some());

        drop(held);
        assert!(locks.try_acquire("task-store").unwrap().is_some());
    }

    #[tokio::test]
    async fn busy_lock_times_out_after_max_attempts() {
        let locks = LockManager::in_process(fast_policy(3));
        let _held = locks.acquire("budget").await.unwrap();

        let err = locks.acquire("budget").await.err().unwrap();
        match err {
            CoreError::LockTimeout { resource, attempts } => {
                assert_eq!(resource, "budget");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn waiter_gets_lock_after_holder_releases() {
        let locks = LockManager::in_process(fast_policy(20));
        let held = locks.acquire("task-store").await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("task-store").await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(15)).await;
        drop(held);

        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn file_lock_creates_and_removes_lock_file() {
        let dir = TempDir::new().unwrap();
        let guard = PathGuard::new(dir.path()).unwrap();
        let locks = LockManager::files(&guard, "locks", fast_policy(2)).unwrap();
        let lock_path = guard.root().join("locks").join("gate-task-1.lock");

        let held = locks.acquire("gate-task-1").await.unwrap();
        assert!(lock_path.exists());
        assert!(locks.try_acquire("gate-task-1").unwrap().is_none());

        drop(held);
        assert!(!lock_path.exists());
    }

    #[tokio::test]
    async fn abandoned_file_lock_is_broken() {
        let dir = TempDir::new().unwrap();
        let guard = PathGuard::new(dir.path()).unwrap();
        let policy = LockPolicy {
            stale_after: Duration::ZERO,
            ..fast_policy(2)
        };
        let locks = LockManager::files(&guard, "locks", policy).unwrap();

        // crashed holder left its file behind
        let path = guard.root().join("locks").join("events.lock");
        fs::write(&path, b"12345\n").unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert!(locks.acquire("events").await.is_ok());
    }

    fn backdate(path: &std::path::Path, by: Duration) {
        let file = OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    #[tokio::test]
    async fn lock_re_taken_after_a_break_is_not_broken_again() {
        let dir = TempDir::new().unwrap();
        let guard = PathGuard::new(dir.path()).unwrap();
        let a = LockManager::files(&guard, "locks", fast_policy(2)).unwrap();
        let b = LockManager::files(&guard, "locks", fast_policy(2)).unwrap();
        let locks_dir = guard.root().join("locks");
        let path = locks_dir.join("budget.lock");

        fs::write(&path, b"12345\n").unwrap();
        backdate(&path, Duration::from_secs(3600));

        // both saw the old file; a breaks first
        let held = a.acquire("budget").await.unwrap();
        assert!(b.break_abandoned(&guard, &locks_dir, "budget").unwrap().is_none());
        assert!(path.exists());
        assert!(b.try_acquire("budget").unwrap().is_none());

        drop(held);
        assert!(b.try_acquire("budget").unwrap().is_some());
    }

    #[tokio::test]
    async fn crashed_breaker_is_cleaned_up() {
        let dir = TempDir::new().unwrap();
        let guard = PathGuard::new(dir.path()).unwrap();
        let locks = LockManager::files(&guard, "locks", fast_policy(3)).unwrap();
        let locks_dir = guard.root().join("locks");

        for file in ["events.lock", "events.lock.break"] {
            let path = locks_dir.join(file);
            fs::write(&path, b"12345\n").unwrap();
            backdate(&path, Duration::from_secs(3600));
        }

        assert!(locks.acquire("events").await.is_ok());
        assert!(!locks_dir.join("events.lock.break").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinked_lock_file_is_a_violation() {
        use std::os::unix::fs::symlink;

        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let guard = PathGuard::new(dir.path()).unwrap();
        let locks = LockManager::files(&guard, "locks", fast_policy(2)).unwrap();
        symlink(
            outside.path().join("target"),
            guard.root().join("locks").join("task-store.lock"),
        )
        .unwrap();

        let err = locks.acquire("task-store").await.err().unwrap();
        assert!(matches!(err, CoreError::SymlinkViolation { .. }));
    }

    #[test]
    fn resource_names_are_sanitized() {
        assert_eq!(sanitize("breaker-delegate:cmd"), "breaker-delegate_cmd");
        assert_eq!(sanitize("../../etc/passwd"), "_.._etc_passwd");
    }
}
