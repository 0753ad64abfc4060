// Image builder: turn the pool into a bootable VM disk
//
// Three phases over a working image (raw by default, the qcow2 itself in
// direct mode):
//   init      - empty disk of the recorded length, partition table, boot
//               partition bytes, fresh btrfs on the root partition
//   restore   - receive the pool's latest snapshot into the image
//   finalize  - convert to qcow2 (indirect mode) and materialize the
//               subvolume layout the restored host expects to boot from
//
// create-image runs all three, update-image restore+finalize, clone-image
// finalize alone.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Local};

use crate::blockdev::{BlockDevice, Mount};
use crate::btrfs;
use crate::config::Config;
use crate::metadata::{self, MetadataStore};
use crate::snapshot;

pub struct ImageBuilder<'a> {
    cfg: &'a Config,
    store: MetadataStore,
}

impl<'a> ImageBuilder<'a> {
    pub fn new(cfg: &'a Config) -> Self {
        Self {
            cfg,
            store: MetadataStore::new(cfg.metadata_path()),
        }
    }

    pub fn create(&self) -> Result<()> {
        self.init()?;
        self.restore()?;
        self.finalize()
    }

    pub fn update(&self) -> Result<()> {
        self.restore()?;
        self.finalize()
    }

    pub fn clone_image(&self) -> Result<()> {
        self.finalize()
    }

    fn attach_working(&self) -> Result<BlockDevice> {
        let image = self.cfg.working_image();
        if !image.exists() {
            bail!("{} does not exist; run --create-image first", image.display());
        }
        if self.cfg.direct_qcow2 {
            BlockDevice::attach_qcow2(&image)
        } else {
            BlockDevice::attach_raw(&image)
        }
    }

    /// Fabricate an empty copy of the source disk: same byte length, same
    /// partition table, byte-identical boot partition, fresh btrfs with the
    /// source's label on the root partition.
    fn init(&self) -> Result<()> {
        if !self.store.exists() {
            bail!("no metadata captured yet; run --setup or --backup first");
        }

        let bytes = self.store.disk_bytes()?;
        let target = self.cfg.working_image();
        std::fs::create_dir_all(self.cfg.images_dir())?;

        log::info!("Creating {} ({} bytes)", target.display(), bytes);
        let tmp = tempfile::NamedTempFile::new_in(self.cfg.images_dir())
            .context("Failed to create temporary image file")?;
        if self.cfg.direct_qcow2 {
            let status = Command::new("qemu-img")
                .arg("create")
                .arg("-f")
                .arg("qcow2")
                .arg(tmp.path())
                .arg(bytes.to_string())
                .stdout(Stdio::null())
                .status()
                .context("Failed to execute qemu-img create")?;
            if !status.success() {
                bail!("qemu-img create failed");
            }
        } else {
            tmp.as_file().set_len(bytes).context("Failed to size image file")?;
        }
        tmp.persist(&target)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to move image into {}", target.display()))?;

        let mut dev = self.attach_working()?;

        // Reinstall the partition table from the source's sgdisk backup
        let mut table = tempfile::NamedTempFile::new()?;
        self.store.copy_entry_to(metadata::ENTRY_SGDISK, table.as_file_mut())?;
        table.flush()?;
        let status = Command::new("sgdisk")
            .arg(format!("--load-backup={}", table.path().display()))
            .arg(dev.node())
            .stdout(Stdio::null())
            .status()
            .context("Failed to execute sgdisk")?;
        if !status.success() {
            bail!("sgdisk --load-backup failed on {}", dev.node().display());
        }

        // The device was attached with an empty disk, so ask the kernel to
        // rescan now that a partition table exists. partprobe is optional;
        // wait_partition catches the case where nothing appears.
        let _ = Command::new("partprobe").arg(dev.node()).status();

        // Boot partition, byte for byte
        let boot = dev.wait_partition(1)?;
        log::info!("Cloning boot partition to {}", boot.display());
        let mut boot_dev = std::fs::OpenOptions::new()
            .write(true)
            .open(&boot)
            .with_context(|| format!("Failed to open {}", boot.display()))?;
        self.store.copy_entry_to(metadata::ENTRY_PART1, &mut boot_dev)?;
        boot_dev.flush()?;

        // Fresh root filesystem with the source's label. The UUID is not
        // cloned: the partition gets a random one on first detach.
        let root = dev.wait_partition(self.cfg.rootpart)?;
        let label = self.store.fs_label()?;
        log::info!("Formatting {} (label '{}')", root.display(), label);
        btrfs::mkfs(&root, &label)?;
        dev.randomize_uuid_on_release(self.cfg.rootpart);

        dev.release()
    }

    /// Bring the image's snapshot set up to the pool's latest snapshot
    fn restore(&self) -> Result<()> {
        let mut dev = self.attach_working()?;
        let root = dev.wait_partition(self.cfg.rootpart)?;
        let mut mount = Mount::subvol_root(&root)?;

        let image_snapshots = mount.path().join("snapshots");
        std::fs::create_dir_all(&image_snapshots)?;

        let pool_latest = snapshot::list_readonly(&self.cfg.snapshots_dir())?
            .into_iter()
            .next_back()
            .ok_or_else(|| anyhow!("pool has no snapshots to restore"))?;
        let image_parent = snapshot::list_readonly(&image_snapshots)?
            .into_iter()
            .next_back();

        if image_parent.as_ref() == Some(&pool_latest) {
            log::info!("Image already contains {}", pool_latest);
        } else {
            match &image_parent {
                Some(parent) => {
                    log::info!("Restoring {} into image (parent {})", pool_latest, parent)
                }
                None => log::info!("Restoring {} into image (full)", pool_latest),
            }
            self.send_into_image(&pool_latest, image_parent.as_ref(), &image_snapshots)?;
            log::info!("Image updated to {}", pool_latest);
        }

        mount.release()?;
        dev.release()
    }

    /// Local pool-to-image send/receive
    fn send_into_image(
        &self,
        latest: &snapshot::SnapshotName,
        parent: Option<&snapshot::SnapshotName>,
        image_snapshots: &Path,
    ) -> Result<()> {
        let snapshots_dir = self.cfg.snapshots_dir();

        let mut send_cmd = Command::new("btrfs");
        send_cmd.arg("send");
        if let Some(parent) = parent {
            send_cmd.arg("-p").arg(snapshots_dir.join(parent.as_str()));
        }
        send_cmd.arg(snapshots_dir.join(latest.as_str()));

        let mut send = send_cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .context("Failed to start btrfs send")?;
        let send_stdout = send
            .stdout
            .take()
            .ok_or_else(|| anyhow!("send has no stdout"))?;

        let receive = Command::new("btrfs")
            .arg("receive")
            .arg(image_snapshots)
            .stdin(send_stdout)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to start btrfs receive")?;

        let receive_output = receive.wait_with_output()?;
        let send_status = send.wait()?;

        if !send_status.success() {
            bail!("btrfs send failed ({})", send_status);
        }
        if !receive_output.status.success() {
            let stderr = String::from_utf8_lossy(&receive_output.stderr);
            bail!("btrfs receive failed: {}", stderr.trim());
        }
        Ok(())
    }

    /// Produce the final qcow2 and make it bootable: default subvolume,
    /// fstab-declared subvolumes, boot loader constraints, neutered swap.
    fn finalize(&self) -> Result<()> {
        let qcow2 = self.cfg.qcow2_image();

        if !self.cfg.direct_qcow2 {
            let raw = self.cfg.raw_image();
            if !raw.exists() {
                bail!("{} does not exist; run --create-image first", raw.display());
            }
            log::info!("Converting {} to qcow2", raw.display());
            let tmp = tempfile::NamedTempFile::new_in(self.cfg.images_dir())?;
            let status = Command::new("qemu-img")
                .arg("convert")
                .arg("-O")
                .arg("qcow2")
                .arg(&raw)
                .arg(tmp.path())
                .status()
                .context("Failed to execute qemu-img convert")?;
            if !status.success() {
                bail!("qemu-img convert failed");
            }
            tmp.persist(&qcow2)
                .map_err(|e| e.error)
                .with_context(|| format!("Failed to move image into {}", qcow2.display()))?;
        }

        let mut dev = BlockDevice::attach_qcow2(&qcow2)?;
        let root = dev.wait_partition(self.cfg.rootpart)?;
        let mut mount = Mount::subvol_root(&root)?;

        self.materialize_layout(mount.path())?;

        mount.release()?;
        dev.release()
    }

    fn materialize_layout(&self, top: &Path) -> Result<()> {
        let rootfs = top.join(&self.cfg.rootfs);

        // The boot subvolume is a writable snapshot of the newest capture
        if !rootfs.exists() {
            let newest = snapshot::list_readonly(&top.join("snapshots"))?
                .into_iter()
                .next_back()
                .ok_or_else(|| anyhow!("image contains no snapshots to boot from"))?;
            log::info!("Creating {} from {}", self.cfg.rootfs, newest);
            btrfs::snapshot(&top.join("snapshots").join(newest.as_str()), &rootfs, false)?;
        }

        let id = btrfs::subvolume_id(&rootfs)?;
        btrfs::set_default(id, top)?;

        // Subvolumes the restored fstab wants to mount
        for name in self.store.fstab_subvolumes()? {
            if name == self.cfg.rootfs {
                continue;
            }
            let path = top.join(&name);
            if !path.exists() {
                log::info!("Creating subvolume {}", name);
                btrfs::create_subvolume(&path)?;
            }
        }

        let swap = top.join("@swap");
        if swap.exists() {
            btrfs::set_nocow(&swap)?;
        }

        // The boot loader reads the filesystem itself and predates zstd;
        // everything under boot/ must stay on the legacy profile.
        let boot = rootfs.join("boot");
        if boot.is_dir() {
            force_compression(&boot, "zlib")?;
        }

        let fstab = rootfs.join("etc/fstab");
        if fstab.is_file() {
            let text = std::fs::read_to_string(&fstab)?;
            let patched = comment_swap_lines(&text);
            if patched != text {
                log::info!("Commenting out swap entries in image fstab");
                std::fs::write(&fstab, patched)?;
            }
        }

        Ok(())
    }
}

/// Apply a compression property to a directory tree (directories only; files
/// inherit on rewrite, and the property controls newly written extents)
fn force_compression(dir: &Path, profile: &str) -> Result<()> {
    btrfs::set_property(dir, "compression", profile)?;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            force_compression(&entry.path(), profile)?;
        }
    }
    Ok(())
}

/// Comment out every fstab line whose filesystem type is swap; the restored
/// VM has no swap device to resume onto.
pub fn comment_swap_lines(fstab: &str) -> String {
    let mut out = String::with_capacity(fstab.len());
    for line in fstab.lines() {
        let is_swap = !line.trim_start().starts_with('#')
            && line.split_whitespace().nth(2) == Some("swap");
        if is_swap {
            out.push('#');
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// The list-images operation
pub fn list(cfg: &Config) -> Result<()> {
    let mut found = false;
    for image in [cfg.raw_image(), cfg.qcow2_image()] {
        if let Ok(meta) = std::fs::metadata(&image) {
            let modified: DateTime<Local> = meta
                .modified()
                .with_context(|| format!("Failed to stat {}", image.display()))?
                .into();
            println!(
                "{}\t{} bytes\t{}",
                image.display(),
                meta.len(),
                modified.format("%Y-%m-%d %H:%M:%S")
            );
            found = true;
        }
    }
    if !found {
        println!("no images in {}", cfg.images_dir().display());
    }
    Ok(())
}

/// Mount an image and drop into a shell (or $SHELL replacement) inside it
pub fn mount_shell(cfg: &Config, qcow2: bool) -> Result<()> {
    let image = if qcow2 { cfg.qcow2_image() } else { cfg.raw_image() };
    if !image.exists() {
        bail!("{} does not exist", image.display());
    }

    let mut dev = if qcow2 {
        BlockDevice::attach_qcow2(&image)?
    } else {
        BlockDevice::attach_raw(&image)?
    };
    let root = dev.wait_partition(cfg.rootpart)?;
    let mut mount = Mount::subvol_root(&root)?;

    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    log::info!("Entering {} in {}", shell, mount.path().display());
    let status = Command::new(&shell)
        .current_dir(mount.path())
        .status()
        .with_context(|| format!("Failed to start {}", shell))?;
    if !status.success() {
        log::warn!("{} exited with {}", shell, status);
    }

    mount.release()?;
    dev.release()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comment_swap_lines() {
        let fstab = "\
UUID=1 /     btrfs subvol=@      0 0\n\
UUID=1 none  swap  sw            0 0\n\
/dev/sdb2 swap swap defaults     0 0\n\
# UUID=2 none swap sw            0 0\n";

        let patched = comment_swap_lines(fstab);
        assert_eq!(
            patched,
            "\
UUID=1 /     btrfs subvol=@      0 0\n\
#UUID=1 none  swap  sw            0 0\n\
#/dev/sdb2 swap swap defaults     0 0\n\
# UUID=2 none swap sw            0 0\n"
        );
        // already-neutralized input is a fixpoint
        assert_eq!(comment_swap_lines(&patched), patched);
    }

    #[test]
    fn test_comment_swap_ignores_swap_mountpoints() {
        // a btrfs subvolume mounted at /swap is not a swap filesystem
        let fstab = "UUID=1 /swap btrfs subvol=@swap 0 0\n";
        assert_eq!(comment_swap_lines(fstab), fstab);
    }
}
