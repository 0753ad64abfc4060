// Pool-wide mutual exclusion
//
// One invocation per pool at a time. The lock is an exclusive non-blocking
// flock on `<pool>/.lockfile`; a second invocation fails immediately instead
// of queueing behind a long image build.

use std::fs::{File, OpenOptions};
use std::path::Path;

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

/// Held for the whole invocation; released when dropped.
#[derive(Debug)]
pub struct PoolLock {
    _lock: Flock<File>,
}

impl PoolLock {
    pub fn acquire(lockfile: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(lockfile)
            .with_context(|| format!("Failed to open lockfile {}", lockfile.display()))?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Self { _lock: lock }),
            Err((_, Errno::EWOULDBLOCK)) => {
                bail!("pool is locked by another invocation ({})", lockfile.display())
            }
            Err((_, err)) => {
                Err(err).with_context(|| format!("Failed to lock {}", lockfile.display()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_per_pool() {
        let dir = tempfile::tempdir().unwrap();
        let lockfile = dir.path().join(".lockfile");

        let first = PoolLock::acquire(&lockfile).unwrap();
        let second = PoolLock::acquire(&lockfile);
        assert!(second.is_err());
        assert!(second.unwrap_err().to_string().contains("locked"));

        // Released on drop, so a later invocation gets through
        drop(first);
        PoolLock::acquire(&lockfile).unwrap();
    }

    #[test]
    fn test_independent_pools_do_not_contend() {
        let dir = tempfile::tempdir().unwrap();
        let _a = PoolLock::acquire(&dir.path().join("a.lock")).unwrap();
        let _b = PoolLock::acquire(&dir.path().join("b.lock")).unwrap();
    }
}
