// Pool setup and layout checks

use anyhow::{bail, Context, Result};

use crate::btrfs;
use crate::config::Config;
use crate::metadata::MetadataStore;
use crate::remote::Remote;
use crate::retention::BUCKETS;

/// The Setup operation: create the pool layout (idempotently), apply the
/// compression profile to the snapshot directory, and take the initial
/// metadata capture from the source host.
pub fn setup(cfg: &Config) -> Result<()> {
    if !cfg.pool.is_dir() {
        bail!("backup directory {} is not a directory", cfg.pool.display());
    }
    if !btrfs::is_btrfs(&cfg.pool)? {
        bail!("backup directory {} is not on a btrfs filesystem", cfg.pool.display());
    }

    let snapshots = cfg.snapshots_dir();
    std::fs::create_dir_all(&snapshots)
        .with_context(|| format!("Failed to create {}", snapshots.display()))?;
    std::fs::create_dir_all(cfg.staging_dir())?;
    for bucket in BUCKETS {
        std::fs::create_dir_all(cfg.retention_dir(bucket))?;
    }
    std::fs::create_dir_all(cfg.images_dir())?;

    btrfs::set_property(&snapshots, "compression", &cfg.compression)
        .context("Failed to set compression profile on snapshots/")?;

    let remote = Remote::new(&cfg.host);
    MetadataStore::new(cfg.metadata_path()).capture(&remote, cfg)?;

    log::info!("Pool {} ready", cfg.pool.display());
    Ok(())
}
