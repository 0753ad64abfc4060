// Wrappers around the btrfs command line tools

use std::path::Path;
use std::process::{Command, Output};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

fn run(cmd: &mut Command, what: &str) -> Result<Output> {
    let output = cmd
        .output()
        .with_context(|| format!("Failed to execute {}", what))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{} failed: {}", what, stderr.trim());
    }

    Ok(output)
}

/// Check whether a path lives on a btrfs filesystem
pub fn is_btrfs(path: &Path) -> Result<bool> {
    #[derive(Deserialize)]
    struct FindmntOutput {
        filesystems: Vec<FindmntEntry>,
    }

    #[derive(Deserialize)]
    struct FindmntEntry {
        fstype: String,
    }

    let output = run(
        Command::new("findmnt")
            .arg("-J")
            .arg("-o")
            .arg("FSTYPE")
            .arg("-T")
            .arg(path),
        "findmnt",
    )?;

    let parsed: FindmntOutput = serde_json::from_slice(&output.stdout)
        .context("Failed to parse findmnt JSON output")?;

    Ok(parsed
        .filesystems
        .first()
        .is_some_and(|fs| fs.fstype == "btrfs"))
}

/// Create a snapshot of a subvolume
pub fn snapshot(source: &Path, dest: &Path, readonly: bool) -> Result<()> {
    let mut cmd = Command::new("btrfs");
    cmd.arg("subvolume").arg("snapshot");
    if readonly {
        cmd.arg("-r");
    }
    cmd.arg(source).arg(dest);

    run(&mut cmd, "btrfs subvolume snapshot")?;
    Ok(())
}

pub fn create_subvolume(path: &Path) -> Result<()> {
    run(
        Command::new("btrfs").arg("subvolume").arg("create").arg(path),
        "btrfs subvolume create",
    )?;
    Ok(())
}

pub fn delete_subvolume(path: &Path) -> Result<()> {
    run(
        Command::new("btrfs").arg("subvolume").arg("delete").arg(path),
        "btrfs subvolume delete",
    )?;
    Ok(())
}

/// Read-only property of a subvolume
pub fn is_readonly(path: &Path) -> Result<bool> {
    let output = run(
        Command::new("btrfs")
            .arg("property")
            .arg("get")
            .arg("-ts")
            .arg(path)
            .arg("ro"),
        "btrfs property get",
    )?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.trim() == "ro=true")
}

/// Set a btrfs property (compression profile, read-only flag, ...) on a
/// subvolume, file or directory
pub fn set_property(path: &Path, name: &str, value: &str) -> Result<()> {
    run(
        Command::new("btrfs")
            .arg("property")
            .arg("set")
            .arg(path)
            .arg(name)
            .arg(value),
        "btrfs property set",
    )?;
    Ok(())
}

/// Numeric subvolume id of a path
pub fn subvolume_id(path: &Path) -> Result<u64> {
    let output = run(
        Command::new("btrfs").arg("subvolume").arg("show").arg(path),
        "btrfs subvolume show",
    )?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        let line = line.trim();
        if line.starts_with("Subvolume ID:") {
            if let Some(id) = line.split_whitespace().nth(2).and_then(|s| s.parse().ok()) {
                return Ok(id);
            }
        }
    }

    bail!("Could not parse subvolume ID for {}", path.display());
}

/// Make a subvolume the default one mounted when no subvol= option is given
pub fn set_default(id: u64, mount_point: &Path) -> Result<()> {
    run(
        Command::new("btrfs")
            .arg("subvolume")
            .arg("set-default")
            .arg(id.to_string())
            .arg(mount_point),
        "btrfs subvolume set-default",
    )?;
    Ok(())
}

/// Assign a fresh random filesystem UUID to an unmounted btrfs partition
pub fn randomize_uuid(device: &Path) -> Result<()> {
    run(
        Command::new("btrfstune").arg("-f").arg("-u").arg(device),
        "btrfstune -u",
    )?;
    Ok(())
}

/// Format a partition as btrfs with the given label
pub fn mkfs(device: &Path, label: &str) -> Result<()> {
    run(
        Command::new("mkfs.btrfs")
            .arg("-f")
            .arg("-L")
            .arg(label)
            .arg(device),
        "mkfs.btrfs",
    )?;
    Ok(())
}

/// Disable copy-on-write for a directory (swap files must not be CoW)
pub fn set_nocow(path: &Path) -> Result<()> {
    run(Command::new("chattr").arg("+C").arg(path), "chattr +C")?;
    Ok(())
}
