// Block-device broker: expose image files as partitioned block devices
//
// Raw images go through a partition-scanned loop device, qcow2 images
// through qemu-nbd on a free /dev/nbdN slot. Attach and mount are RAII
// guards: release runs on every exit path, in LIFO order (mount before
// device), and tolerates being called twice.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::btrfs;
use crate::config::partition_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backing {
    Loop,
    Nbd,
}

/// An attached image file
pub struct BlockDevice {
    dev: PathBuf,
    backing: Backing,
    active: bool,
    /// Partition whose filesystem UUID is randomized right before detach.
    /// Set only when mkfs ran in this session; an image UUID identical to
    /// the source host's would collide if both disks ever met on one system.
    randomize_uuid: Option<PathBuf>,
}

impl BlockDevice {
    /// Attach a raw image via a partition-scanned loop device
    pub fn attach_raw(image: &Path) -> Result<Self> {
        let output = Command::new("losetup")
            .arg("--partscan")
            .arg("--find")
            .arg("--show")
            .arg(image)
            .output()
            .context("Failed to execute losetup")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("losetup failed for {}: {}", image.display(), stderr.trim());
        }

        let dev = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
        log::info!("Attached {} as {}", image.display(), dev.display());

        Ok(Self {
            dev,
            backing: Backing::Loop,
            active: true,
            randomize_uuid: None,
        })
    }

    /// Attach a qcow2 image via qemu-nbd on a free nbd slot
    pub fn attach_qcow2(image: &Path) -> Result<Self> {
        let status = Command::new("modprobe")
            .arg("nbd")
            .arg("max_part=16")
            .status()
            .context("Failed to execute modprobe")?;
        if !status.success() {
            bail!("modprobe nbd failed (is the nbd kernel module available?)");
        }

        let dev = find_free_nbd()?;
        let status = Command::new("qemu-nbd")
            .arg("--format=qcow2")
            .arg("--connect")
            .arg(&dev)
            .arg(image)
            .status()
            .context("Failed to execute qemu-nbd")?;
        if !status.success() {
            bail!("qemu-nbd --connect failed for {}", image.display());
        }

        log::info!("Attached {} as {}", image.display(), dev.display());
        Ok(Self {
            dev,
            backing: Backing::Nbd,
            active: true,
            randomize_uuid: None,
        })
    }

    pub fn node(&self) -> &Path {
        &self.dev
    }

    pub fn partition(&self, part: u32) -> PathBuf {
        partition_path(&self.dev, part)
    }

    /// Wait for the device manager to settle and the partition node to
    /// appear. Fails if it never does: an image without the expected
    /// partition table is unusable.
    pub fn wait_partition(&self, part: u32) -> Result<PathBuf> {
        let node = self.partition(part);

        let _ = Command::new("udevadm").arg("settle").status();
        for _ in 0..50 {
            if node.exists() {
                return Ok(node);
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        bail!("partition node {} did not appear", node.display());
    }

    /// Randomize the filesystem UUID of `part` at release time
    pub fn randomize_uuid_on_release(&mut self, part: u32) {
        self.randomize_uuid = Some(self.partition(part));
    }

    pub fn release(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;

        if let Some(part) = self.randomize_uuid.take() {
            log::info!("Randomizing filesystem UUID on {}", part.display());
            btrfs::randomize_uuid(&part)?;
        }

        let status = match self.backing {
            Backing::Loop => Command::new("losetup")
                .arg("-d")
                .arg(&self.dev)
                .status()
                .context("Failed to execute losetup -d")?,
            Backing::Nbd => Command::new("qemu-nbd")
                .arg("--disconnect")
                .arg(&self.dev)
                .status()
                .context("Failed to execute qemu-nbd --disconnect")?,
        };

        if !status.success() {
            bail!("failed to detach {}", self.dev.display());
        }
        Ok(())
    }
}

impl Drop for BlockDevice {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = self.release() {
                log::warn!("Leaking attached device {}: {:#}", self.dev.display(), e);
            }
        }
    }
}

/// First nbd slot whose reported size is zero
fn find_free_nbd() -> Result<PathBuf> {
    for i in 0..16 {
        let dev = PathBuf::from(format!("/dev/nbd{}", i));
        if !dev.exists() {
            continue;
        }
        let size = std::fs::read_to_string(format!("/sys/block/nbd{}/size", i))
            .unwrap_or_default();
        if size.trim() == "0" {
            return Ok(dev);
        }
    }
    bail!("no free /dev/nbdN device found");
}

/// A mounted partition, unmounted on release or drop
pub struct Mount {
    point: PathBuf,
    mounted: bool,
    _dir: Option<tempfile::TempDir>,
}

impl Mount {
    /// Mount a btrfs partition at subvolume id 5 (the top of the subvolume
    /// hierarchy) on a scratch mountpoint.
    pub fn subvol_root(device: &Path) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("btrfs-backup-mnt.")
            .tempdir()
            .context("Failed to create scratch mountpoint")?;

        let status = Command::new("mount")
            .arg("-o")
            .arg("subvolid=5")
            .arg(device)
            .arg(dir.path())
            .status()
            .context("Failed to execute mount")?;
        if !status.success() {
            bail!("mount failed for {}", device.display());
        }

        Ok(Self {
            point: dir.path().to_path_buf(),
            mounted: true,
            _dir: Some(dir),
        })
    }

    pub fn path(&self) -> &Path {
        &self.point
    }

    pub fn release(&mut self) -> Result<()> {
        if !self.mounted {
            return Ok(());
        }
        self.mounted = false;

        let status = Command::new("umount")
            .arg(&self.point)
            .status()
            .context("Failed to execute umount")?;
        if !status.success() {
            bail!("umount failed for {}", self.point.display());
        }
        Ok(())
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        if self.mounted {
            if let Err(e) = self.release() {
                log::warn!("Leaking mount {}: {:#}", self.point.display(), e);
            }
        }
    }
}
