// Snapshot naming and pool directory scans

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{Datelike, Local, NaiveDateTime};

use crate::btrfs;

/// Timestamp format shared by the pool directory, the retention indices and
/// the remote snapshot directory.
const NAME_FORMAT: &str = "%Y.%m.%d_%H.%M";

/// A snapshot name of the form `YYYY.MM.DD_HH.MM`
///
/// Lexicographic order of the name equals chronological order, so sorting
/// name strings is enough everywhere a "latest" is needed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SnapshotName {
    name: String,
    stamp: NaiveDateTime,
}

impl SnapshotName {
    /// Name for a capture taken now (local time, minute resolution)
    pub fn now() -> Self {
        let name = Local::now().format(NAME_FORMAT).to_string();
        Self::parse(&name).expect("formatted timestamp must re-parse")
    }

    /// Parse a directory entry; `None` for anything that is not a snapshot
    /// name (the staging directory, stray files, foreign subvolumes).
    pub fn parse(name: &str) -> Option<Self> {
        let stamp = NaiveDateTime::parse_from_str(name, NAME_FORMAT).ok()?;
        Some(Self {
            name: name.to_string(),
            stamp,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// `Y.M.D` retention coordinate
    pub fn day_key(&self) -> String {
        self.stamp.format("%Y.%m.%d").to_string()
    }

    /// `Y-W` retention coordinate, ISO week numbering (week 53 belongs to
    /// the ISO year, not the calendar year)
    pub fn week_key(&self) -> String {
        let week = self.stamp.iso_week();
        format!("{:04}-{:02}", week.year(), week.week())
    }

    /// `Y.M` retention coordinate
    pub fn month_key(&self) -> String {
        self.stamp.format("%Y.%m").to_string()
    }

    /// `Y` retention coordinate
    pub fn year_key(&self) -> String {
        self.stamp.format("%Y").to_string()
    }
}

impl std::fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// All snapshot-named entries in a directory, sorted ascending
pub fn list(dir: &Path) -> Result<Vec<SnapshotName>> {
    let mut snapshots = Vec::new();

    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read snapshot directory {}", dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(snap) = entry.file_name().to_str().and_then(SnapshotName::parse) {
            snapshots.push(snap);
        }
    }

    snapshots.sort();
    Ok(snapshots)
}

/// Snapshot-named subvolumes in a directory whose read-only property is
/// true, sorted ascending. Entries that fail the property probe are skipped:
/// an interrupted receive leaves a writable subvolume that must never be
/// used as a send parent.
pub fn list_readonly(dir: &Path) -> Result<Vec<SnapshotName>> {
    let mut snapshots = Vec::new();
    for snap in list(dir)? {
        if btrfs::is_readonly(&dir.join(snap.as_str())).unwrap_or(false) {
            snapshots.push(snap);
        }
    }
    Ok(snapshots)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip() {
        let snap = SnapshotName::parse("2024.03.09_14.05").unwrap();
        assert_eq!(snap.as_str(), "2024.03.09_14.05");
        assert_eq!(snap.day_key(), "2024.03.09");
        assert_eq!(snap.month_key(), "2024.03");
        assert_eq!(snap.year_key(), "2024");
    }

    #[test]
    fn test_parse_rejects_non_snapshots() {
        assert!(SnapshotName::parse("new").is_none());
        assert!(SnapshotName::parse("2024.03.09").is_none());
        assert!(SnapshotName::parse("2024.13.01_00.00").is_none());
        assert!(SnapshotName::parse("2024.03.09_14.05.33").is_none());
    }

    #[test]
    fn test_lexicographic_is_chronological() {
        let a = SnapshotName::parse("2023.12.31_23.59").unwrap();
        let b = SnapshotName::parse("2024.01.01_00.00").unwrap();
        let c = SnapshotName::parse("2024.01.01_00.01").unwrap();
        assert!(a < b && b < c);
        assert!(a.as_str() < b.as_str() && b.as_str() < c.as_str());
    }

    #[test]
    fn test_iso_week_53() {
        // 2021-01-01 falls in ISO week 53 of 2020
        let snap = SnapshotName::parse("2021.01.01_06.00").unwrap();
        assert_eq!(snap.week_key(), "2020-53");
        // while 2021-01-04 starts ISO week 1 of 2021
        let snap = SnapshotName::parse("2021.01.04_06.00").unwrap();
        assert_eq!(snap.week_key(), "2021-01");
    }

    #[test]
    fn test_list_skips_foreign_entries() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["2024.01.01_00.00", "2024.01.02_12.30", "new", "notes"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        std::fs::write(dir.path().join("2024.01.03_00.00"), b"a file").unwrap();

        let names: Vec<String> = list(dir.path())
            .unwrap()
            .into_iter()
            .map(|s| s.as_str().to_string())
            .collect();
        assert_eq!(names, ["2024.01.01_00.00", "2024.01.02_12.30"]);
    }
}
