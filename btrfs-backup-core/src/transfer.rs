// Snapshot transfer: pull one new capture from the source host
//
// The wire path is ssh(btrfs send | compress) -> local decompress -> btrfs
// receive into the staging directory, then a two-step promotion into
// snapshots/. Every pipeline stage's exit status is checked; nothing is
// promoted unless all of them succeeded.

use std::collections::BTreeSet;
use std::process::{Command, Stdio};

use anyhow::{anyhow, bail, Context, Result};

use crate::btrfs;
use crate::config::Config;
use crate::metadata::MetadataStore;
use crate::remote::Remote;
use crate::snapshot::{self, SnapshotName};

/// Pick the differential-send parent: the newest local snapshot that is
/// read-only and still present on the remote host. A remotely-deleted or
/// interrupted (writable) local snapshot cannot seed a differential stream.
pub fn choose_parent<'a>(
    local_readonly: &'a [SnapshotName],
    remote: &BTreeSet<String>,
) -> Option<&'a SnapshotName> {
    local_readonly
        .iter()
        .rev()
        .find(|snap| remote.contains(snap.as_str()))
}

/// Delete whatever a crashed run left in the staging directory. Receive
/// streams are not resumable, so partial subvolumes are only in the way.
fn purge_staging(cfg: &Config) -> Result<()> {
    let staging = cfg.staging_dir();
    if !staging.is_dir() {
        return Ok(());
    }

    for entry in std::fs::read_dir(&staging)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            log::warn!("Removing stale staging entry {:?}", entry.file_name());
            if btrfs::delete_subvolume(&entry.path()).is_err() {
                // not a subvolume; a plain directory can be removed directly
                std::fs::remove_dir_all(entry.path())?;
            }
        } else {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

fn log_pool_space(cfg: &Config) {
    if let Ok(stat) = nix::sys::statvfs::statvfs(&cfg.pool) {
        let avail = stat.blocks_available() as u64 * stat.fragment_size() as u64;
        log::info!("Pool free space: {} MiB", avail / (1024 * 1024));
        if avail < 1024 * 1024 * 1024 {
            log::warn!("Less than 1 GiB free in the pool");
        }
    }
}

/// The Backup operation. Returns the name of the promoted snapshot.
pub fn run(cfg: &Config) -> Result<SnapshotName> {
    let remote = Remote::new(&cfg.host);
    let snapshots_dir = cfg.snapshots_dir();
    let staging = cfg.staging_dir();

    purge_staging(cfg)?;
    std::fs::create_dir_all(&staging)
        .with_context(|| format!("Failed to create {}", staging.display()))?;
    log_pool_space(cfg);

    let snap = SnapshotName::now();
    let remote_set = remote.list_snapshots()?;
    let local_readonly = snapshot::list_readonly(&snapshots_dir)?;
    let parent = choose_parent(&local_readonly, &remote_set);

    match parent {
        Some(parent) => log::info!("Differential backup of {} against {}", snap, parent),
        None => log::info!("Full backup of {}", snap),
    }

    remote.create_snapshot(snap.as_str())?;

    let mut send = remote.spawn_send(
        snap.as_str(),
        parent.map(SnapshotName::as_str),
        &cfg.compress,
    )?;
    let send_stdout = send
        .stdout
        .take()
        .ok_or_else(|| anyhow!("send stream has no stdout"))?;

    let mut decompress = Command::new(&cfg.decompress[0])
        .args(&cfg.decompress[1..])
        .stdin(send_stdout)
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .with_context(|| format!("Failed to start decompressor {:?}", cfg.decompress))?;
    let decompress_stdout = decompress
        .stdout
        .take()
        .ok_or_else(|| anyhow!("decompressor has no stdout"))?;

    let receive = Command::new("btrfs")
        .arg("receive")
        .arg(&staging)
        .stdin(decompress_stdout)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .context("Failed to start btrfs receive")?;

    // Wait for the whole pipeline and surface the first failing stage; a
    // stage dying of a broken pipe after a downstream failure must not mask
    // the original error.
    let receive_output = receive
        .wait_with_output()
        .context("Failed to wait for btrfs receive")?;
    let decompress_status = decompress
        .wait()
        .context("Failed to wait for decompressor")?;
    let send_status = send.wait().context("Failed to wait for remote send")?;

    if !send_status.success() {
        bail!("remote send pipeline failed ({})", send_status);
    }
    if !decompress_status.success() {
        bail!("decompressor {:?} failed ({})", cfg.decompress, decompress_status);
    }
    if !receive_output.status.success() {
        let stderr = String::from_utf8_lossy(&receive_output.stderr);
        bail!("btrfs receive failed: {}", stderr.trim());
    }

    // Promote: a fresh read-only snapshot of the staged subvolume, then
    // drop the staging copy. The promoted snapshot gets its own received
    // UUID and staging ends up empty either way.
    let staged = staging.join(snap.as_str());
    let promoted = snapshots_dir.join(snap.as_str());
    btrfs::snapshot(&staged, &promoted, true)
        .context("Failed to promote received snapshot")?;
    btrfs::delete_subvolume(&staged).context("Failed to prune staging copy")?;

    log::info!("Promoted snapshot {}", snap);

    MetadataStore::new(cfg.metadata_path())
        .capture(&remote, cfg)
        .context("Failed to refresh metadata after transfer")?;

    Ok(snap)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<SnapshotName> {
        list.iter().map(|n| SnapshotName::parse(n).unwrap()).collect()
    }

    fn remote(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parent_is_newest_common_snapshot() {
        let local = names(&["2024.01.01_00.00", "2024.01.02_00.00", "2024.01.03_00.00"]);
        let remote = remote(&["2024.01.01_00.00", "2024.01.02_00.00"]);

        let parent = choose_parent(&local, &remote).unwrap();
        assert_eq!(parent.as_str(), "2024.01.02_00.00");
    }

    #[test]
    fn test_no_common_snapshot_means_full_backup() {
        let local = names(&["2024.01.01_00.00"]);
        assert!(choose_parent(&local, &remote(&[])).is_none());
        assert!(choose_parent(&[], &remote(&["2024.01.01_00.00"])).is_none());
    }

    #[test]
    fn test_remotely_deleted_parent_skipped() {
        let local = names(&["2024.01.01_00.00", "2024.01.02_00.00"]);
        let remote = remote(&["2024.01.01_00.00", "2024.01.03_00.00"]);

        let parent = choose_parent(&local, &remote).unwrap();
        assert_eq!(parent.as_str(), "2024.01.01_00.00");
    }
}
