// Metadata store: source-host artifacts needed to rebuild its disk
//
// A tar archive at the pool root with five fixed entries captured over ssh.
// The archive is rewritten as a whole on every capture, via a sibling temp
// file renamed over the canonical path.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::config::{partition_name, Config};
use crate::remote::Remote;

pub const ENTRY_FDISK: &str = "fdisk-l";
pub const ENTRY_SGDISK: &str = "sgdisk-backup";
pub const ENTRY_PART1: &str = "part1-img";
pub const ENTRY_SUPER: &str = "super-dump";
pub const ENTRY_FSTAB: &str = "fstab";

pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Capture all five artifacts from the source host and atomically
    /// replace the archive.
    pub fn capture(&self, remote: &Remote, cfg: &Config) -> Result<()> {
        log::info!("Capturing source metadata from {}", cfg.host);

        let disk = format!("/dev/{}", cfg.rootdev);
        let boot_part = format!("/dev/{}", partition_name(&cfg.rootdev, 1));
        let root_part = format!("/dev/{}", partition_name(&cfg.rootdev, cfg.rootpart));

        // The byte-length parser depends on fixed token positions, so the
        // remote locale is pinned to C.
        let fdisk = remote.capture(&format!("env LC_ALL=C fdisk -l {}", disk))?;
        let sgdisk = remote.capture(&format!(
            "t=$(mktemp) && sgdisk --backup=$t {} >/dev/null && cat $t && rm -f $t",
            disk
        ))?;
        let part1 = remote.capture(&format!("dd if={} bs=1M status=none", boot_part))?;
        let superdump =
            remote.capture(&format!("btrfs inspect-internal dump-super {}", root_part))?;
        let fstab = remote.capture("cat /etc/fstab")?;

        let dir = self
            .path
            .parent()
            .context("metadata path has no parent directory")?;
        let tmp = tempfile::NamedTempFile::new_in(dir)
            .context("Failed to create temporary metadata archive")?;

        let mut builder = tar::Builder::new(tmp);
        append_entry(&mut builder, ENTRY_FDISK, &fdisk)?;
        append_entry(&mut builder, ENTRY_SGDISK, &sgdisk)?;
        append_entry(&mut builder, ENTRY_PART1, &part1)?;
        append_entry(&mut builder, ENTRY_SUPER, &superdump)?;
        append_entry(&mut builder, ENTRY_FSTAB, &fstab)?;

        let tmp = builder
            .into_inner()
            .context("Failed to finish metadata archive")?;
        tmp.persist(&self.path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to move archive into {}", self.path.display()))?;

        Ok(())
    }

    /// Raw bytes of a named archive entry
    pub fn read_entry(&self, name: &str) -> Result<Vec<u8>> {
        let file = std::fs::File::open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        let mut archive = tar::Archive::new(file);

        for entry in archive.entries().context("Failed to read metadata archive")? {
            let mut entry = entry?;
            if entry.path()?.as_ref() == Path::new(name) {
                let mut data = Vec::new();
                entry.read_to_end(&mut data)?;
                return Ok(data);
            }
        }

        bail!("metadata archive has no '{}' entry", name);
    }

    /// Stream an entry into a writer without buffering it whole; the boot
    /// partition image can be hundreds of megabytes.
    pub fn copy_entry_to(&self, name: &str, dest: &mut dyn std::io::Write) -> Result<u64> {
        let file = std::fs::File::open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        let mut archive = tar::Archive::new(file);

        for entry in archive.entries().context("Failed to read metadata archive")? {
            let mut entry = entry?;
            if entry.path()?.as_ref() == Path::new(name) {
                return std::io::copy(&mut entry, dest)
                    .with_context(|| format!("Failed to copy out metadata entry '{}'", name));
            }
        }

        bail!("metadata archive has no '{}' entry", name);
    }

    fn read_text(&self, name: &str) -> Result<String> {
        String::from_utf8(self.read_entry(name)?)
            .with_context(|| format!("metadata entry '{}' is not valid UTF-8", name))
    }

    /// Byte length of the source disk, from the fdisk listing
    pub fn disk_bytes(&self) -> Result<u64> {
        parse_disk_bytes(&self.read_text(ENTRY_FDISK)?)
    }

    /// Filesystem label of the source rootfs; empty when the source had none
    pub fn fs_label(&self) -> Result<String> {
        Ok(parse_super_field(&self.read_text(ENTRY_SUPER)?, "label").unwrap_or_default())
    }

    /// `@`-named subvolumes the source's fstab expects to exist
    pub fn fstab_subvolumes(&self) -> Result<Vec<String>> {
        Ok(parse_fstab_subvolumes(&self.read_text(ENTRY_FSTAB)?))
    }
}

fn append_entry<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    data: &[u8],
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, name, data)
        .with_context(|| format!("Failed to append '{}' to metadata archive", name))
}

/// Extract the disk byte length from an `fdisk -l` listing.
///
/// The "Disk ... bytes, ... sectors" line is parsed by fixed whitespace
/// position (5th token). Intentionally narrow: a mismatch is an error, not a
/// guess.
pub fn parse_disk_bytes(listing: &str) -> Result<u64> {
    let line = listing
        .lines()
        .find(|l| l.starts_with("Disk ") && l.contains(" bytes"))
        .context("no 'Disk ... bytes' line in partition listing")?;

    line.split_whitespace()
        .nth(4)
        .and_then(|tok| tok.parse().ok())
        .with_context(|| format!("could not read byte length from: {}", line))
}

/// Second token of a `<field> <value>` line in a dump-super listing
pub fn parse_super_field(dump: &str, field: &str) -> Option<String> {
    dump.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        if tokens.next() == Some(field) {
            tokens.next().map(str::to_string)
        } else {
            None
        }
    })
}

/// Every `subvol=@...` value mentioned in an fstab, deduplicated
pub fn parse_fstab_subvolumes(fstab: &str) -> Vec<String> {
    let mut subvols = Vec::new();

    for line in fstab.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some(options) = line.split_whitespace().nth(3) else {
            continue;
        };
        for opt in options.split(',') {
            if let Some(value) = opt.strip_prefix("subvol=") {
                let value = value.trim_start_matches('/');
                if value.starts_with('@') && !subvols.iter().any(|s| s == value) {
                    subvols.push(value.to_string());
                }
            }
        }
    }

    subvols
}

#[cfg(test)]
mod tests {
    use super::*;

    const FDISK: &str = "\
Disk /dev/sda: 100 GiB, 107374182400 bytes, 209715200 sectors\n\
Disk model: QEMU HARDDISK\n\
Units: sectors of 1 * 512 = 512 bytes\n\
\n\
Device       Start       End   Sectors  Size Type\n\
/dev/sda1     2048   1050623   1048576  512M EFI System\n\
/dev/sda2  1050624 209715166 208664543 99.5G Linux filesystem\n";

    const SUPER: &str = "\
superblock: bytenr=65536, device=/dev/sda2\n\
---------------------------------------------------------\n\
csum_type\t\t0 (crc32c)\n\
fsid\t\t9cc9dccd-21fa-4caa-8ef9-0001fc9bb63a\n\
label\t\talpha-root\n\
generation\t\t74921\n";

    #[test]
    fn test_parse_disk_bytes() {
        assert_eq!(parse_disk_bytes(FDISK).unwrap(), 107374182400);
    }

    #[test]
    fn test_parse_disk_bytes_fails_loudly() {
        assert!(parse_disk_bytes("").is_err());
        assert!(parse_disk_bytes("Disk /dev/sda: broken line\n").is_err());
    }

    #[test]
    fn test_parse_super_fields() {
        assert_eq!(
            parse_super_field(SUPER, "fsid").as_deref(),
            Some("9cc9dccd-21fa-4caa-8ef9-0001fc9bb63a")
        );
        assert_eq!(parse_super_field(SUPER, "label").as_deref(), Some("alpha-root"));
        assert_eq!(parse_super_field(SUPER, "flags"), None);
        // unlabeled filesystem: the line is there but has no value token
        assert_eq!(parse_super_field("label\ngeneration\t5\n", "label"), None);
    }

    #[test]
    fn test_parse_fstab_subvolumes() {
        let fstab = "\
# /etc/fstab\n\
UUID=9cc9dccd /     btrfs rw,compress=zstd,subvol=/@      0 0\n\
UUID=9cc9dccd /home btrfs rw,compress=zstd,subvol=@home   0 0\n\
UUID=9cc9dccd /var  btrfs rw,subvol=@var,noatime          0 0\n\
UUID=9cc9dccd /swap btrfs rw,subvol=@swap                 0 0\n\
UUID=abcd     /boot ext4  defaults                        0 2\n\
tmpfs         /tmp  tmpfs defaults                        0 0\n";

        assert_eq!(parse_fstab_subvolumes(fstab), ["@", "@home", "@var", "@swap"]);
    }

    #[test]
    fn test_fstab_subvolumes_ignores_non_at_names() {
        let fstab = "UUID=1 /data btrfs subvol=data 0 0\n";
        assert!(parse_fstab_subvolumes(fstab).is_empty());
    }

    #[test]
    fn test_archive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path().join("metadata.tar"));

        // build an archive by hand the same way capture() does
        let tmp = tempfile::NamedTempFile::new_in(dir.path()).unwrap();
        let mut builder = tar::Builder::new(tmp);
        append_entry(&mut builder, ENTRY_FDISK, FDISK.as_bytes()).unwrap();
        append_entry(&mut builder, ENTRY_SUPER, SUPER.as_bytes()).unwrap();
        append_entry(&mut builder, ENTRY_PART1, &[0xebu8, 0x63, 0x90]).unwrap();
        let tmp = builder.into_inner().unwrap();
        tmp.persist(dir.path().join("metadata.tar")).unwrap();

        assert_eq!(store.disk_bytes().unwrap(), 107374182400);
        assert_eq!(store.fs_label().unwrap(), "alpha-root");
        assert_eq!(store.read_entry(ENTRY_PART1).unwrap(), vec![0xeb, 0x63, 0x90]);
        assert!(store.read_entry(ENTRY_FSTAB).is_err());
    }
}
