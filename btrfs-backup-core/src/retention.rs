// Time-stratified retention over the snapshot directory
//
// Each bucket under retention/ is a directory of symlinks into snapshots/.
// The link name is the bucket's calendar coordinate and the first snapshot
// of a coordinate wins it; trimming keeps the newest K coordinates. A
// snapshot referenced by no bucket is garbage.
//
// The decision logic is a pure function over directory listings
// (RetentionPlan); only apply() touches the filesystem. Deleting snapshots
// happens in exactly one place, after the kept set is known, and dangling
// links are swept last.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};

use crate::btrfs;
use crate::config::{Config, RetentionCounts};
use crate::snapshot::{self, SnapshotName};

pub const BUCKETS: [&str; 5] = ["latest", "days", "weeks", "months", "years"];

/// Links present in one bucket: link name -> target snapshot name
pub type BucketLinks = BTreeMap<String, String>;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RetentionPlan {
    /// (bucket, link name, target) for missing coordinates
    pub create: Vec<(String, String, String)>,
    /// (bucket, link name) trimmed beyond the keep-count
    pub trim: Vec<(String, String)>,
    /// Snapshots referenced by no bucket after trimming
    pub delete: Vec<String>,
    /// (bucket, link name) whose target is not a present snapshot
    pub sweep: Vec<(String, String)>,
}

/// Calendar coordinate of a snapshot inside a bucket
pub fn bucket_key(bucket: &str, snap: &SnapshotName) -> String {
    match bucket {
        "latest" => snap.as_str().to_string(),
        "days" => snap.day_key(),
        "weeks" => snap.week_key(),
        "months" => snap.month_key(),
        "years" => snap.year_key(),
        other => unreachable!("unknown bucket {}", other),
    }
}

/// Compute the full retention decision for the current pool state.
///
/// `snapshots` must be sorted ascending (as snapshot::list returns them) so
/// that the earliest snapshot of each coordinate claims the link.
pub fn plan(
    snapshots: &[SnapshotName],
    existing: &BTreeMap<String, BucketLinks>,
    counts: &RetentionCounts,
) -> RetentionPlan {
    let mut result = RetentionPlan::default();
    let present: BTreeSet<&str> = snapshots.iter().map(|s| s.as_str()).collect();
    let mut kept_targets: BTreeSet<String> = BTreeSet::new();

    for bucket in BUCKETS {
        let mut links = existing.get(bucket).cloned().unwrap_or_default();

        // First-wins: only coordinates without a link get one
        for snap in snapshots {
            let key = bucket_key(bucket, snap);
            if !links.contains_key(&key) {
                links.insert(key.clone(), snap.as_str().to_string());
                result
                    .create
                    .push((bucket.to_string(), key, snap.as_str().to_string()));
            }
        }

        // Keep the lexicographically-last K coordinates
        let keep = counts.for_bucket(bucket);
        let coords: Vec<String> = links.keys().cloned().collect();
        let cut = coords.len().saturating_sub(keep);
        for coord in &coords[..cut] {
            links.remove(coord);
            result.trim.push((bucket.to_string(), coord.clone()));
        }

        for (link, target) in &links {
            kept_targets.insert(target.clone());
            if !present.contains(target.as_str()) {
                result.sweep.push((bucket.to_string(), link.clone()));
            }
        }
    }

    for snap in snapshots {
        if !kept_targets.contains(snap.as_str()) {
            result.delete.push(snap.as_str().to_string());
        }
    }

    result
}

/// Read the links of every bucket directory
pub fn read_links(cfg: &Config) -> Result<BTreeMap<String, BucketLinks>> {
    let mut buckets = BTreeMap::new();

    for bucket in BUCKETS {
        let dir = cfg.retention_dir(bucket);
        let mut links = BucketLinks::new();

        if dir.is_dir() {
            for entry in std::fs::read_dir(&dir)
                .with_context(|| format!("Failed to read {}", dir.display()))?
            {
                let entry = entry?;
                if !entry.file_type()?.is_symlink() {
                    continue;
                }
                let target = std::fs::read_link(entry.path())?;
                let Some(target) = target.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                links.insert(
                    entry.file_name().to_string_lossy().into_owned(),
                    target.to_string(),
                );
            }
        }

        buckets.insert(bucket.to_string(), links);
    }

    Ok(buckets)
}

fn create_link(cfg: &Config, bucket: &str, link: &str, target: &str) -> Result<()> {
    let path = cfg.retention_dir(bucket).join(link);
    let dest = Path::new("../../snapshots").join(target);
    match std::os::unix::fs::symlink(&dest, &path) {
        Ok(()) => Ok(()),
        // First-wins also against a link that appeared since the scan
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => {
            Err(e).with_context(|| format!("Failed to create retention link {}", path.display()))
        }
    }
}

fn remove_link(cfg: &Config, bucket: &str, link: &str) -> Result<()> {
    let path = cfg.retention_dir(bucket).join(link);
    std::fs::remove_file(&path)
        .with_context(|| format!("Failed to remove retention link {}", path.display()))
}

/// Execute a plan in the order the invariants require: new links, trims,
/// snapshot deletion, dangling-link sweep.
pub fn apply(cfg: &Config, plan: &RetentionPlan) -> Result<()> {
    for (bucket, link, target) in &plan.create {
        create_link(cfg, bucket, link, target)?;
    }
    for (bucket, link) in &plan.trim {
        remove_link(cfg, bucket, link)?;
    }
    for name in &plan.delete {
        log::info!("Deleting unreferenced snapshot {}", name);
        btrfs::delete_subvolume(&cfg.snapshots_dir().join(name))?;
    }
    for (bucket, link) in &plan.sweep {
        log::info!("Sweeping dangling retention link {}/{}", bucket, link);
        remove_link(cfg, bucket, link)?;
    }
    Ok(())
}

/// The Retention operation
pub fn run(cfg: &Config) -> Result<()> {
    for bucket in BUCKETS {
        std::fs::create_dir_all(cfg.retention_dir(bucket))?;
    }

    let snapshots = snapshot::list(&cfg.snapshots_dir())?;
    let existing = read_links(cfg)?;
    let plan = plan(&snapshots, &existing, &cfg.retention);

    log::info!(
        "Retention: {} new links, {} trimmed, {} snapshots to delete, {} swept",
        plan.create.len(),
        plan.trim.len(),
        plan.delete.len(),
        plan.sweep.len()
    );

    apply(cfg, &plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snaps(names: &[&str]) -> Vec<SnapshotName> {
        names
            .iter()
            .map(|n| SnapshotName::parse(n).expect("test snapshot name"))
            .collect()
    }

    fn no_links() -> BTreeMap<String, BucketLinks> {
        BUCKETS
            .iter()
            .map(|b| (b.to_string(), BucketLinks::new()))
            .collect()
    }

    /// Simulate apply() on the in-memory state, so idempotence can be
    /// checked without a filesystem.
    fn replay(
        snapshots: &mut Vec<SnapshotName>,
        existing: &mut BTreeMap<String, BucketLinks>,
        plan: &RetentionPlan,
    ) {
        for (bucket, link, target) in &plan.create {
            existing
                .get_mut(bucket)
                .unwrap()
                .entry(link.clone())
                .or_insert_with(|| target.clone());
        }
        for (bucket, link) in &plan.trim {
            existing.get_mut(bucket).unwrap().remove(link);
        }
        snapshots.retain(|s| !plan.delete.contains(&s.as_str().to_string()));
        for (bucket, link) in &plan.sweep {
            existing.get_mut(bucket).unwrap().remove(link);
        }
    }

    #[test]
    fn test_first_snapshot_of_day_wins() {
        let snapshots = snaps(&[
            "2024.01.01_00.00",
            "2024.01.02_00.00",
            "2024.01.02_12.00",
        ]);
        let counts = RetentionCounts {
            latest: 1,
            days: 2,
            weeks: 0,
            months: 0,
            years: 0,
        };

        let plan = plan(&snapshots, &no_links(), &counts);

        // days gets one link per day, the 12.00 capture does not overwrite
        let day_links: Vec<_> = plan
            .create
            .iter()
            .filter(|(b, _, _)| b == "days")
            .collect();
        assert_eq!(day_links.len(), 2);
        assert!(plan.create.contains(&(
            "days".into(),
            "2024.01.02".into(),
            "2024.01.02_00.00".into()
        )));

        // latest keeps only the newest, so 00.00 of the 2nd survives via
        // days and 12.00 survives via latest; the 1st is kept by days
        assert!(plan.delete.is_empty());
    }

    #[test]
    fn test_unreferenced_snapshot_deleted() {
        // days=2 and nothing else: the second capture of a day is garbage
        let snapshots = snaps(&[
            "2024.01.01_00.00",
            "2024.01.02_00.00",
            "2024.01.02_12.00",
        ]);
        let counts = RetentionCounts {
            latest: 0,
            days: 2,
            weeks: 0,
            months: 0,
            years: 0,
        };

        let plan = plan(&snapshots, &no_links(), &counts);
        assert_eq!(plan.delete, ["2024.01.02_12.00"]);
    }

    #[test]
    fn test_zero_keep_counts_delete_everything() {
        let snapshots = snaps(&["2024.01.01_00.00", "2024.02.01_00.00"]);
        let counts = RetentionCounts {
            latest: 0,
            days: 0,
            weeks: 0,
            months: 0,
            years: 0,
        };

        let plan = plan(&snapshots, &no_links(), &counts);
        assert_eq!(plan.delete.len(), 2);
    }

    #[test]
    fn test_trim_keeps_newest_coordinates() {
        let snapshots = snaps(&[
            "2024.01.01_00.00",
            "2024.01.02_00.00",
            "2024.01.03_00.00",
            "2024.01.04_00.00",
        ]);
        let counts = RetentionCounts {
            latest: 4,
            days: 2,
            weeks: 0,
            months: 0,
            years: 0,
        };

        let plan = plan(&snapshots, &no_links(), &counts);
        let trimmed: Vec<_> = plan.trim.iter().filter(|(b, _)| b == "days").collect();
        assert_eq!(
            trimmed,
            [
                &("days".to_string(), "2024.01.01".to_string()),
                &("days".to_string(), "2024.01.02".to_string())
            ]
        );
    }

    #[test]
    fn test_existing_link_not_overwritten() {
        let snapshots = snaps(&["2024.01.02_00.00", "2024.01.02_12.00"]);
        let mut existing = no_links();
        existing.get_mut("days").unwrap().insert(
            "2024.01.02".to_string(),
            "2024.01.02_00.00".to_string(),
        );

        let counts = RetentionCounts::default();
        let plan = plan(&snapshots, &existing, &counts);
        assert!(!plan.create.iter().any(|(b, k, _)| b == "days" && k == "2024.01.02"));
    }

    #[test]
    fn test_dangling_link_swept() {
        let snapshots = snaps(&["2024.01.02_00.00"]);
        let mut existing = no_links();
        existing.get_mut("days").unwrap().insert(
            "2024.01.01".to_string(),
            "2024.01.01_00.00".to_string(), // deleted out-of-band
        );

        let plan = plan(&snapshots, &existing, &RetentionCounts::default());
        assert!(plan
            .sweep
            .contains(&("days".to_string(), "2024.01.01".to_string())));
        assert!(!plan.delete.contains(&"2024.01.02_00.00".to_string()));
    }

    #[test]
    fn test_iso_week_53_buckets_with_its_iso_year() {
        let snapshots = snaps(&["2021.01.01_06.00", "2021.01.04_06.00"]);
        let plan = plan(&snapshots, &no_links(), &RetentionCounts::default());

        let weeks: Vec<_> = plan
            .create
            .iter()
            .filter(|(b, _, _)| b == "weeks")
            .map(|(_, k, _)| k.as_str())
            .collect();
        assert_eq!(weeks, ["2020-53", "2021-01"]);
    }

    #[test]
    fn test_idempotent_under_stable_state() {
        let mut snapshots = snaps(&[
            "2023.12.31_23.00",
            "2024.01.01_00.00",
            "2024.01.01_12.00",
            "2024.01.02_00.00",
            "2024.02.01_00.00",
        ]);
        let counts = RetentionCounts {
            latest: 2,
            days: 2,
            weeks: 2,
            months: 2,
            years: 1,
        };
        let mut existing = no_links();

        let first = plan(&snapshots, &existing, &counts);
        replay(&mut snapshots, &mut existing, &first);
        let state_after_first = (snapshots.clone(), existing.clone());

        // A second pass may recreate-and-trim old coordinates, but it must
        // not delete anything and must leave the pool state unchanged.
        let second = plan(&snapshots, &existing, &counts);
        assert!(second.delete.is_empty(), "second pass deletes: {:?}", second.delete);
        assert!(second.sweep.is_empty());
        replay(&mut snapshots, &mut existing, &second);
        assert_eq!((snapshots, existing), state_after_first);
    }

    #[test]
    fn test_read_links_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::new(dir.path().to_path_buf(), "alpha".to_string());

        std::fs::create_dir_all(cfg.retention_dir("days")).unwrap();
        for bucket in BUCKETS {
            std::fs::create_dir_all(cfg.retention_dir(bucket)).unwrap();
        }
        std::os::unix::fs::symlink(
            "../../snapshots/2024.01.01_00.00",
            cfg.retention_dir("days").join("2024.01.01"),
        )
        .unwrap();
        // stray regular file is ignored
        std::fs::write(cfg.retention_dir("days").join("README"), b"x").unwrap();

        let links = read_links(&cfg).unwrap();
        assert_eq!(
            links["days"].get("2024.01.01").map(String::as_str),
            Some("2024.01.01_00.00")
        );
        assert!(links["weeks"].is_empty());
    }
}
