// btrfs-backup - pull snapshots of a remote btrfs rootfs into a local pool
// and keep them bootable as a VM disk image

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};

use btrfs_backup_core::image::{self, ImageBuilder};
use btrfs_backup_core::lock::PoolLock;
use btrfs_backup_core::{pool, retention, transfer, Config};

const OPERATIONS: [(&str, &str); 9] = [
    ("setup", "Create the pool layout and capture initial metadata"),
    ("backup", "Pull a new snapshot from the source host"),
    ("retention", "Apply the retention policy to the snapshot set"),
    ("create-image", "Build a bootable disk image from scratch"),
    ("update-image", "Bring the image up to the pool's latest snapshot"),
    ("clone-image", "Re-derive the qcow2 image and its subvolume layout"),
    ("list-images", "List the pool's disk images"),
    ("mount-raw", "Mount the raw image and open a shell inside it"),
    ("mount-qcow2", "Mount the qcow2 image and open a shell inside it"),
];

fn cli() -> Command {
    let mut cmd = Command::new("btrfs-backup")
        .about("Remote btrfs rootfs backup with VM image materialization")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("backup-dir")
                .long("backup-dir")
                .value_name("PATH")
                .required(true)
                .help("Backup pool directory (must be on btrfs)"),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("HOST")
                .required(true)
                .help("Source host, reached over ssh as root"),
        )
        .arg(
            Arg::new("rootfs")
                .long("rootfs")
                .value_name("NAME")
                .help("Rootfs subvolume name in the image [default: @]"),
        )
        .arg(
            Arg::new("rootdev")
                .long("rootdev")
                .value_name("NAME")
                .help("Source block device, without /dev/ [default: sda]"),
        )
        .arg(
            Arg::new("rootpart")
                .long("rootpart")
                .value_name("N")
                .value_parser(clap::value_parser!(u32))
                .help("Source rootfs partition number [default: 2]"),
        )
        .arg(
            Arg::new("direct-qcow2")
                .long("direct-qcow2")
                .action(ArgAction::SetTrue)
                .help("Work directly in the qcow2 image via qemu-nbd"),
        );

    for bucket in ["latest", "days", "weeks", "months", "years"] {
        cmd = cmd.arg(
            Arg::new(bucket)
                .long(bucket)
                .value_name("N")
                .value_parser(clap::value_parser!(usize))
                .help(format!("Snapshots to keep in the {} bucket", bucket)),
        );
    }

    for (name, help) in OPERATIONS {
        cmd = cmd.arg(
            Arg::new(name)
                .long(name)
                .action(ArgAction::Count)
                .help(help),
        );
    }

    cmd
}

/// Operation flags in the order they appeared on the command line
fn ordered_operations(matches: &ArgMatches) -> Vec<&'static str> {
    let mut ops: Vec<(usize, &'static str)> = Vec::new();
    for (name, _) in OPERATIONS {
        if let Some(indices) = matches.indices_of(name) {
            for index in indices {
                ops.push((index, name));
            }
        }
    }
    ops.sort();
    ops.into_iter().map(|(_, name)| name).collect()
}

fn build_config(matches: &ArgMatches) -> Result<Config> {
    let pool = PathBuf::from(matches.get_one::<String>("backup-dir").unwrap());
    let host = matches.get_one::<String>("host").unwrap().clone();

    let mut cfg = Config::new(pool, host);
    cfg.apply_pool_conf()?;

    // Command-line overrides win over the pool configuration file
    if let Some(v) = matches.get_one::<String>("rootfs") {
        cfg.rootfs = v.clone();
    }
    if let Some(v) = matches.get_one::<String>("rootdev") {
        cfg.rootdev = v.clone();
    }
    if let Some(v) = matches.get_one::<u32>("rootpart") {
        cfg.rootpart = *v;
    }
    if let Some(v) = matches.get_one::<usize>("latest") {
        cfg.retention.latest = *v;
    }
    if let Some(v) = matches.get_one::<usize>("days") {
        cfg.retention.days = *v;
    }
    if let Some(v) = matches.get_one::<usize>("weeks") {
        cfg.retention.weeks = *v;
    }
    if let Some(v) = matches.get_one::<usize>("months") {
        cfg.retention.months = *v;
    }
    if let Some(v) = matches.get_one::<usize>("years") {
        cfg.retention.years = *v;
    }
    if matches.get_flag("direct-qcow2") {
        cfg.direct_qcow2 = true;
    }

    Ok(cfg)
}

fn run() -> Result<()> {
    let matches = cli().get_matches();

    let operations = ordered_operations(&matches);
    if operations.is_empty() {
        bail!("no operation given (try --setup, --backup, --retention, ...)");
    }

    let pool_dir = PathBuf::from(matches.get_one::<String>("backup-dir").unwrap());
    if !pool_dir.is_dir() {
        bail!("backup directory {} is not a directory", pool_dir.display());
    }

    // Everything below runs under the pool lock, the configuration file
    // included: a concurrent invocation must not see half-applied state.
    let _lock = PoolLock::acquire(&pool_dir.join(btrfs_backup_core::LOCKFILE_NAME))?;
    let cfg = build_config(&matches)?;

    if operations.iter().any(|op| *op != "list-images") && unsafe { libc::geteuid() } != 0 {
        bail!("this operation requires root privileges");
    }

    for op in operations {
        log::info!("=== {} ===", op);
        match op {
            "setup" => pool::setup(&cfg)?,
            "backup" => {
                transfer::run(&cfg)?;
            }
            "retention" => retention::run(&cfg)?,
            "create-image" => ImageBuilder::new(&cfg).create()?,
            "update-image" => ImageBuilder::new(&cfg).update()?,
            "clone-image" => ImageBuilder::new(&cfg).clone_image()?,
            "list-images" => image::list(&cfg)?,
            "mount-raw" => image::mount_shell(&cfg, false)?,
            "mount-qcow2" => image::mount_shell(&cfg, true)?,
            other => unreachable!("unknown operation {}", other),
        }
    }

    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        eprintln!("ERROR: {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operations_keep_command_line_order() {
        let matches = cli().get_matches_from([
            "btrfs-backup",
            "--backup-dir=/pool",
            "--host=alpha",
            "--retention",
            "--backup",
            "--retention",
        ]);
        assert_eq!(
            ordered_operations(&matches),
            ["retention", "backup", "retention"]
        );
    }

    #[test]
    fn test_cli_overrides() {
        let matches = cli().get_matches_from([
            "btrfs-backup",
            "--backup-dir=/nonexistent-pool",
            "--host=alpha",
            "--rootdev=vda",
            "--rootpart=3",
            "--days=9",
            "--direct-qcow2",
            "--backup",
        ]);
        let cfg = build_config(&matches).unwrap();
        assert_eq!(cfg.rootdev, "vda");
        assert_eq!(cfg.rootpart, 3);
        assert_eq!(cfg.retention.days, 9);
        assert_eq!(cfg.retention.latest, 5);
        assert!(cfg.direct_qcow2);
    }

    #[test]
    fn test_required_options() {
        assert!(cli()
            .try_get_matches_from(["btrfs-backup", "--backup", "--host=alpha"])
            .is_err());
        assert!(cli()
            .try_get_matches_from(["btrfs-backup", "--backup", "--backup-dir=/pool"])
            .is_err());
    }
}
