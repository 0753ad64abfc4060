// Centralized configuration for a backup pool invocation

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::{LOCKFILE_NAME, METADATA_NAME, POOL_CONF_NAME};

/// Keep-counts per retention bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionCounts {
    pub latest: usize,
    pub days: usize,
    pub weeks: usize,
    pub months: usize,
    pub years: usize,
}

impl Default for RetentionCounts {
    fn default() -> Self {
        Self {
            latest: 5,
            days: 5,
            weeks: 4,
            months: 4,
            years: 20,
        }
    }
}

impl RetentionCounts {
    /// Keep-count for a bucket directory name
    pub fn for_bucket(&self, bucket: &str) -> usize {
        match bucket {
            "latest" => self.latest,
            "days" => self.days,
            "weeks" => self.weeks,
            "months" => self.months,
            "years" => self.years,
            _ => 0,
        }
    }
}

/// Configuration record for one invocation
///
/// Built in three layers: compiled-in defaults, then the pool's
/// `btrfs-backup.conf` (if present), then explicit command-line overrides.
/// Components receive this record (or projections of it) explicitly; there
/// is no mutable global state.
#[derive(Debug, Clone)]
pub struct Config {
    /// Backup pool directory (must be on btrfs)
    pub pool: PathBuf,

    /// Source hostname, reached over ssh as root
    pub host: String,

    /// Name of the rootfs subvolume inside the image (default "@")
    pub rootfs: String,

    /// Source block device name without /dev/ prefix (default "sda")
    pub rootdev: String,

    /// Partition number of the source rootfs (default 2)
    pub rootpart: u32,

    /// btrfs compression property applied to pool and image data
    pub compression: String,

    /// Compressor the remote side pipes the send stream through
    pub compress: Vec<String>,

    /// Local filter that undoes `compress`
    pub decompress: Vec<String>,

    pub retention: RetentionCounts,

    /// Work directly in the qcow2 image via qemu-nbd instead of a raw
    /// working image converted afterwards
    pub direct_qcow2: bool,
}

impl Config {
    pub fn new(pool: PathBuf, host: String) -> Self {
        Self {
            pool,
            host,
            rootfs: "@".to_string(),
            rootdev: "sda".to_string(),
            rootpart: 2,
            compression: "zstd".to_string(),
            compress: vec!["zstd".to_string(), "-c".to_string()],
            decompress: vec!["zstd".to_string(), "-dc".to_string()],
            retention: RetentionCounts::default(),
            direct_qcow2: false,
        }
    }

    /// Apply overrides from the pool's `btrfs-backup.conf`, if it exists
    pub fn apply_pool_conf(&mut self) -> Result<()> {
        let path = self.conf_path();
        if !path.exists() {
            return Ok(());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        self.apply_conf_str(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    fn apply_conf_str(&mut self, content: &str) -> Result<()> {
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .with_context(|| format!("Line {}: expected key=value", lineno + 1))?;
            let (key, value) = (key.trim(), value.trim());

            match key {
                "rootfs" => self.rootfs = value.to_string(),
                "rootdev" => self.rootdev = value.to_string(),
                "rootpart" => {
                    self.rootpart = value
                        .parse()
                        .with_context(|| format!("Line {}: bad partition number", lineno + 1))?
                }
                "compression" => self.compression = value.to_string(),
                "compress" => self.compress = split_filter(value, lineno)?,
                "decompress" => self.decompress = split_filter(value, lineno)?,
                "latest" => self.retention.latest = parse_count(value, lineno)?,
                "days" => self.retention.days = parse_count(value, lineno)?,
                "weeks" => self.retention.weeks = parse_count(value, lineno)?,
                "months" => self.retention.months = parse_count(value, lineno)?,
                "years" => self.retention.years = parse_count(value, lineno)?,
                "direct_qcow2" => {
                    self.direct_qcow2 = match value {
                        "1" | "true" | "yes" => true,
                        "0" | "false" | "no" => false,
                        other => bail!("Line {}: bad boolean '{}'", lineno + 1, other),
                    }
                }
                other => bail!("Line {}: unknown key '{}'", lineno + 1, other),
            }
        }
        Ok(())
    }

    pub fn conf_path(&self) -> PathBuf {
        self.pool.join(POOL_CONF_NAME)
    }

    pub fn lockfile(&self) -> PathBuf {
        self.pool.join(LOCKFILE_NAME)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.pool.join(METADATA_NAME)
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.pool.join("snapshots")
    }

    /// Staging area for in-flight receives
    pub fn staging_dir(&self) -> PathBuf {
        self.snapshots_dir().join("new")
    }

    pub fn retention_dir(&self, bucket: &str) -> PathBuf {
        self.pool.join("retention").join(bucket)
    }

    pub fn images_dir(&self) -> PathBuf {
        self.pool.join("images")
    }

    pub fn raw_image(&self) -> PathBuf {
        self.images_dir().join("image.raw")
    }

    pub fn qcow2_image(&self) -> PathBuf {
        self.images_dir().join("image.qcow2")
    }

    /// The image file that init/restore operate on: the qcow2 in direct
    /// mode, the raw working image otherwise.
    pub fn working_image(&self) -> PathBuf {
        if self.direct_qcow2 {
            self.qcow2_image()
        } else {
            self.raw_image()
        }
    }
}

fn split_filter(value: &str, lineno: usize) -> Result<Vec<String>> {
    let parts: Vec<String> = value.split_whitespace().map(String::from).collect();
    if parts.is_empty() {
        bail!("Line {}: empty filter command", lineno + 1);
    }
    Ok(parts)
}

fn parse_count(value: &str, lineno: usize) -> Result<usize> {
    value
        .parse()
        .with_context(|| format!("Line {}: bad keep-count", lineno + 1))
}

/// Partition node name for a parent device: `sda` + 1 -> `sda1`, while
/// devices whose name ends in a digit (nvme0n1, loop0, nbd3) get a `p`
/// separator.
pub fn partition_name(dev: &str, part: u32) -> String {
    if dev.chars().last().is_some_and(|c| c.is_ascii_digit()) {
        format!("{}p{}", dev, part)
    } else {
        format!("{}{}", dev, part)
    }
}

/// Same, but for a full /dev path
pub fn partition_path(dev: &Path, part: u32) -> PathBuf {
    let name = dev.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    dev.with_file_name(partition_name(&name, part))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config::new(PathBuf::from("/backup/pool"), "alpha".to_string())
    }

    #[test]
    fn test_defaults() {
        let cfg = base();
        assert_eq!(cfg.rootfs, "@");
        assert_eq!(cfg.rootdev, "sda");
        assert_eq!(cfg.rootpart, 2);
        assert_eq!(cfg.retention, RetentionCounts::default());
        assert!(!cfg.direct_qcow2);
        assert_eq!(cfg.working_image(), PathBuf::from("/backup/pool/images/image.raw"));
    }

    #[test]
    fn test_conf_overrides() {
        let mut cfg = base();
        cfg.apply_conf_str(
            "# pool overrides\n\
             rootdev = nvme0n1\n\
             rootpart = 3\n\
             days=7\n\
             decompress = lz4 -dc\n\
             direct_qcow2 = yes\n",
        )
        .unwrap();

        assert_eq!(cfg.rootdev, "nvme0n1");
        assert_eq!(cfg.rootpart, 3);
        assert_eq!(cfg.retention.days, 7);
        assert_eq!(cfg.retention.latest, 5);
        assert_eq!(cfg.decompress, vec!["lz4", "-dc"]);
        assert!(cfg.direct_qcow2);
        assert_eq!(cfg.working_image(), PathBuf::from("/backup/pool/images/image.qcow2"));
    }

    #[test]
    fn test_conf_rejects_unknown_key() {
        let mut cfg = base();
        assert!(cfg.apply_conf_str("frobnicate=1\n").is_err());
        assert!(cfg.apply_conf_str("no equals sign\n").is_err());
    }

    #[test]
    fn test_partition_name() {
        assert_eq!(partition_name("sda", 1), "sda1");
        assert_eq!(partition_name("vdb", 2), "vdb2");
        assert_eq!(partition_name("nvme0n1", 2), "nvme0n1p2");
        assert_eq!(partition_name("loop0", 1), "loop0p1");
        assert_eq!(partition_name("nbd3", 2), "nbd3p2");
    }
}
