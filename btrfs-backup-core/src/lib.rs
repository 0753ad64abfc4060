// Core engine for btrfs-backup
//
// Pulls read-only snapshots of a remote host's btrfs rootfs into a local
// backup pool, keeps a time-stratified retention of them, and can turn the
// pool into a bootable VM disk image.

pub mod blockdev;
pub mod btrfs;
pub mod config;
pub mod image;
pub mod lock;
pub mod metadata;
pub mod pool;
pub mod remote;
pub mod retention;
pub mod snapshot;
pub mod transfer;

pub use config::Config;

/// Snapshot directory on the remote host. The engine treats this path as a
/// contract and never tries to discover it.
pub const REMOTE_SNAPSHOT_ROOT: &str = "/.btrfs/snapshots";

/// Per-pool override file, read after the lock is taken and before
/// command-line overrides apply.
pub const POOL_CONF_NAME: &str = "btrfs-backup.conf";

pub const LOCKFILE_NAME: &str = ".lockfile";
pub const METADATA_NAME: &str = "metadata.tar";
