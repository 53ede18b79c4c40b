// sbak_common is the main sbak library implementing the backup engine logic.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::cancel::CancelToken;
use crate::cmd;
use crate::{Error, Result};

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

use chrono::prelude::*;

const CREATE_DEADLINE: Duration = Duration::from_secs(120);
const DELETE_DEADLINE: Duration = Duration::from_secs(300);

const DELETE_ATTEMPTS: u32 = 3;
const DELETE_PAUSE: Duration = Duration::from_secs(1);

/// Whether a snapshot lives on the subvolume being backed up or on the
/// backup drive.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Location {
    Source,
    Destination,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Destination => write!(f, "destination"),
        }
    }
}

/// A `SnapshotName` identifies a snapshot via the source subvolume's
/// basename and the UTC timestamp embedded in the directory name.
///
/// The textual timestamp form sorts the same way the instants do, so
/// name ordering is creation ordering.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SnapshotName {
    basename: String,
    taken: NaiveDateTime,
}

impl SnapshotName {
    const TIMESTAMP_FMT: &'static str = "%Y-%m-%dT%H:%M:%SZ";

    /// Returns a name for a snapshot taken now.
    pub fn now(basename: &str) -> Self {
        let taken = Utc::now().naive_utc();
        // Sub-second precision does not survive the name round trip.
        let taken = taken.with_nanosecond(0).unwrap_or(taken);

        Self {
            basename: basename.to_string(),
            taken,
        }
    }

    pub fn basename(&self) -> &str {
        &self.basename
    }

    /// Returns the timestamp of when the snapshot was taken.
    pub fn taken(&self) -> NaiveDateTime {
        self.taken
    }

    /// Converts the name to its storage location inside `dir`.
    pub fn in_dir(&self, dir: &Path) -> PathBuf {
        dir.join(self.to_string())
    }
}

impl fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}",
            self.basename,
            self.taken.format(Self::TIMESTAMP_FMT)
        )
    }
}

impl TryFrom<&str> for SnapshotName {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        // The timestamp is the dot-free tail, the basename may itself
        // contain dots.
        let (basename, timestamp) = value.rsplit_once('.').ok_or_else(|| {
            Error::InvalidInput(format!("`{value}` is not a snapshot name"))
        })?;

        if basename.is_empty() {
            return Err(Error::InvalidInput(format!(
                "`{value}` has an empty subvolume basename"
            )));
        }

        let taken = NaiveDateTime::parse_from_str(timestamp, Self::TIMESTAMP_FMT)
            .map_err(|e| {
                Error::InvalidInput(format!("`{value}` has no parsable timestamp: {e}"))
            })?;

        Ok(Self {
            basename: basename.to_string(),
            taken,
        })
    }
}

impl TryFrom<&Path> for SnapshotName {
    type Error = Error;

    fn try_from(value: &Path) -> Result<Self> {
        Self::try_from(
            value
                .file_name()
                .ok_or_else(|| {
                    Error::InvalidInput(format!("{} has no file name", value.display()))
                })?
                .to_str()
                .ok_or_else(|| {
                    Error::InvalidInput(format!("{} is not valid Unicode", value.display()))
                })?,
        )
    }
}

/// What kind of transfer a run performs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BackupKind {
    /// The whole subvolume is streamed.
    Full,
    /// Only the delta from `parent` is streamed. The parent exists on
    /// both sides under the same name.
    Incremental { parent: SnapshotName },
}

/// Creates a read-only snapshot of `subvol` at `snapshot_path`.
pub fn create_readonly(subvol: &Path, snapshot_path: &Path, cancel: &CancelToken) -> Result<()> {
    cmd::run(
        "btrfs",
        &[
            "subvolume",
            "snapshot",
            "-r",
            cmd::path_arg(subvol)?,
            cmd::path_arg(snapshot_path)?,
        ],
        CREATE_DEADLINE,
        cancel,
    )
    .map_err(|e| Error::SnapshotOperationFailed {
        operation: "create",
        path: snapshot_path.to_path_buf(),
        source: Box::new(e),
    })?;

    Ok(())
}

/// Deletes the snapshot at `path`, retrying a bounded number of times.
/// From the second attempt on, deletion waits for the transaction commit
/// to also reap snapshots left in a partial state.
pub fn delete_with_retry(path: &Path, cancel: &CancelToken) -> Result<()> {
    let path_str = cmd::path_arg(path)?;
    let mut attempt = 0;

    loop {
        attempt += 1;
        cancel.check()?;

        let args: &[&str] = if attempt == 1 {
            &["subvolume", "delete", path_str]
        } else {
            &["subvolume", "delete", "--commit-after", path_str]
        };

        match cmd::run("btrfs", args, DELETE_DEADLINE, cancel) {
            Ok(_) => return Ok(()),
            Err(e @ Error::Interrupted(_)) => return Err(e),
            Err(_) if attempt < DELETE_ATTEMPTS => thread::sleep(DELETE_PAUSE),
            Err(e) => {
                return Err(Error::SnapshotOperationFailed {
                    operation: "delete",
                    path: path.to_path_buf(),
                    source: Box::new(e),
                })
            }
        }
    }
}

/// Returns the snapshots of `basename` in `dir`, ordered oldest first by
/// the timestamp embedded in the name. Entries that carry the prefix but
/// no parsable timestamp are foreign and skipped.
pub fn list(dir: &Path, basename: &str) -> Result<Vec<SnapshotName>> {
    let entries = fs::read_dir(dir).map_err(|e| Error::SnapshotOperationFailed {
        operation: "list",
        path: dir.to_path_buf(),
        source: Box::new(e),
    })?;

    let prefix = format!("{basename}.");
    let mut names = Vec::new();

    for entry in entries {
        let entry = entry.map_err(|e| Error::SnapshotOperationFailed {
            operation: "list",
            path: dir.to_path_buf(),
            source: Box::new(e),
        })?;

        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if !name.starts_with(&prefix) {
            continue;
        }

        if let Ok(parsed) = SnapshotName::try_from(name) {
            names.push(parsed);
        }
    }

    names.sort_by_key(SnapshotName::taken);
    Ok(names)
}

/// Selects the parent for an incremental transfer: the newest snapshot
/// name present in both directories, never the current run's snapshot.
/// Names are ordered by the embedded timestamp; equal timestamps fall
/// back to the source side's modification time.
///
/// `None` means no common ancestor exists and a full transfer is due.
pub fn select_parent(
    source_dir: &Path,
    dest_dir: &Path,
    basename: &str,
    current: &SnapshotName,
) -> Result<Option<SnapshotName>> {
    let on_dest: HashSet<SnapshotName> = list(dest_dir, basename)?.into_iter().collect();

    let mut candidates: Vec<SnapshotName> = list(source_dir, basename)?
        .into_iter()
        .filter(|name| name != current)
        .filter(|name| on_dest.contains(name))
        .collect();

    candidates.sort_by(|a, b| {
        a.taken()
            .cmp(&b.taken())
            .then_with(|| modified(source_dir, a).cmp(&modified(source_dir, b)))
    });

    Ok(candidates.pop())
}

fn modified(dir: &Path, name: &SnapshotName) -> SystemTime {
    fs::metadata(name.in_dir(dir))
        .and_then(|meta| meta.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    fn name(s: &str) -> SnapshotName {
        SnapshotName::try_from(s).unwrap()
    }

    #[test]
    fn name_round_trips_through_display() {
        let parsed = name("data.2025-01-01T00:00:00Z");
        assert_eq!(parsed.basename(), "data");
        assert_eq!(parsed.to_string(), "data.2025-01-01T00:00:00Z");
    }

    #[test]
    fn basename_may_contain_dots() {
        let parsed = name("my.volume.2025-06-30T12:34:56Z");
        assert_eq!(parsed.basename(), "my.volume");
    }

    #[test]
    fn rejects_names_without_timestamps() {
        assert!(SnapshotName::try_from("data").is_err());
        assert!(SnapshotName::try_from("data.backup").is_err());
        assert!(SnapshotName::try_from(".2025-01-01T00:00:00Z").is_err());
    }

    #[test]
    fn textual_order_is_temporal_order() {
        let older = name("data.2025-01-01T00:00:00Z");
        let newer = name("data.2025-01-02T00:00:00Z");

        assert!(older.taken() < newer.taken());
        assert!(older.to_string() < newer.to_string());
    }

    #[test]
    fn fresh_names_parse_back() {
        let fresh = SnapshotName::now("data");
        let parsed = name(&fresh.to_string());
        assert_eq!(parsed, fresh);
    }

    #[test]
    fn list_is_sorted_and_filtered() {
        let dir = tempdir().unwrap();

        for entry in [
            "data.2025-01-02T00:00:00Z",
            "data.2025-01-01T00:00:00Z",
            "data.not-a-timestamp",
            "other.2025-01-03T00:00:00Z",
        ] {
            fs::create_dir(dir.path().join(entry)).unwrap();
        }

        let names = list(dir.path(), "data").unwrap();
        assert_eq!(
            names.iter().map(ToString::to_string).collect::<Vec<_>>(),
            [
                "data.2025-01-01T00:00:00Z".to_string(),
                "data.2025-01-02T00:00:00Z".to_string(),
            ]
        );
    }

    #[test]
    fn parent_is_newest_name_present_on_both_sides() {
        let source = tempdir().unwrap();
        let dest = tempdir().unwrap();

        for entry in [
            "data.2025-01-01T00:00:00Z",
            "data.2025-01-02T00:00:00Z",
            "data.2025-01-03T00:00:00Z",
        ] {
            fs::create_dir(source.path().join(entry)).unwrap();
        }
        // The newest source snapshot never made it across.
        for entry in ["data.2025-01-01T00:00:00Z", "data.2025-01-02T00:00:00Z"] {
            fs::create_dir(dest.path().join(entry)).unwrap();
        }

        let current = name("data.2025-01-04T00:00:00Z");
        let parent = select_parent(source.path(), dest.path(), "data", &current)
            .unwrap()
            .unwrap();

        assert_eq!(parent.to_string(), "data.2025-01-02T00:00:00Z");
    }

    #[test]
    fn parent_never_equals_the_current_snapshot() {
        let source = tempdir().unwrap();
        let dest = tempdir().unwrap();

        let current = name("data.2025-01-05T00:00:00Z");
        fs::create_dir(source.path().join(current.to_string())).unwrap();
        fs::create_dir(dest.path().join(current.to_string())).unwrap();

        let parent = select_parent(source.path(), dest.path(), "data", &current).unwrap();
        assert_eq!(parent, None);
    }

    #[test]
    fn source_only_snapshot_is_no_parent() {
        let source = tempdir().unwrap();
        let dest = tempdir().unwrap();

        fs::create_dir(source.path().join("data.2025-01-01T00:00:00Z")).unwrap();

        let current = name("data.2025-01-02T00:00:00Z");
        let parent = select_parent(source.path(), dest.path(), "data", &current).unwrap();
        assert_eq!(parent, None);
    }
}
