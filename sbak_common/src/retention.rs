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

//! Failure cleanup and age-based retention pruning.

use crate::cancel::CancelToken;
use crate::engine::RunState;
use crate::observe::Observer;
use crate::snapshot::{self, Location, SnapshotName};
use crate::{Error, Result};

use std::path::Path;

use chrono::prelude::*;

/// Age-based pruning rules for one run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetentionPolicy {
    /// Snapshots older than this many days are pruned. 0 disables.
    pub retention_days: u32,
    /// Count of snapshots always kept per side, regardless of age.
    pub keep_minimum: usize,
}

impl RetentionPolicy {
    pub fn is_enabled(&self) -> bool {
        self.retention_days > 0
    }

    /// The effective floor. At least one snapshot always survives so
    /// the next run keeps its incremental parent.
    pub fn floor(&self) -> usize {
        self.keep_minimum.max(1)
    }
}

/// Removes the artifacts a failed run may have left behind.
///
/// What gets removed is driven by what was actually created: the
/// `snapshot_created` flag for the source side, a probe for the
/// destination side. Removal failures are reported to the observer and
/// returned so the caller can attach them to the primary error as
/// suppressed causes; they never replace it. A pending cancellation is
/// ignored; cleanup is best-effort but always runs to completion.
pub fn cleanup_failed_run(
    state: &RunState,
    snapshot_dir: &Path,
    dest_dir: &Path,
    observer: &dyn Observer,
) -> Vec<Error> {
    let inert = CancelToken::new();
    let name = state.snapshot_name();
    let mut suppressed = Vec::new();

    if state.snapshot_created() {
        remove_if_present(&name.in_dir(snapshot_dir), observer, &inert, &mut suppressed);
    } else {
        // A create that died midway can leave the subvolume behind
        // without the flag ever being set. The same scan catches
        // leftovers of a previous run that never got to clean up.
        match snapshot::list(snapshot_dir, name.basename()) {
            Ok(names) => {
                if let Some(newest) = names.last() {
                    if newest == name {
                        remove_if_present(
                            &newest.in_dir(snapshot_dir),
                            observer,
                            &inert,
                            &mut suppressed,
                        );
                    }
                }
            }
            Err(e) => {
                observer.on_warn(&format!(
                    "cannot scan {} for orphans: {e}",
                    snapshot_dir.display()
                ));
                suppressed.push(e);
            }
        }
    }

    remove_if_present(&name.in_dir(dest_dir), observer, &inert, &mut suppressed);

    suppressed
}

fn remove_if_present(
    path: &Path,
    observer: &dyn Observer,
    cancel: &CancelToken,
    suppressed: &mut Vec<Error>,
) {
    if !path.exists() {
        return;
    }

    observer.on_warn(&format!("removing leftover snapshot {}", path.display()));

    if let Err(e) = snapshot::delete_with_retry(path, cancel) {
        let failure = Error::CleanupFailed {
            path: path.to_path_buf(),
            detail: e.to_string(),
        };
        observer.on_warn(&failure.to_string());
        suppressed.push(failure);
    }
}

/// Prunes snapshots of `basename` in `dir`, the `side` snapshot
/// directory, that have aged past the policy cutoff. Returns how many
/// were removed.
pub fn prune(
    dir: &Path,
    basename: &str,
    side: Location,
    policy: &RetentionPolicy,
    observer: &dyn Observer,
    cancel: &CancelToken,
) -> Result<usize> {
    if !policy.is_enabled() {
        return Ok(0);
    }

    cancel.check()?;

    let names = snapshot::list(dir, basename)?;
    let cutoff = Utc::now().naive_utc() - chrono::Duration::days(policy.retention_days.into());
    let prunable = select_prunable(&names, cutoff, policy.floor());

    for name in &prunable {
        observer.on_info(&format!("pruning {name} from the {side}"));
        snapshot::delete_with_retry(&name.in_dir(dir), cancel)?;
    }

    Ok(prunable.len())
}

/// Chooses which snapshots to prune. Age is decided by the timestamp
/// embedded in the name; the filesystem's own timestamps are ignored
/// here because the two sides' clocks need not agree.
fn select_prunable(
    names: &[SnapshotName],
    cutoff: NaiveDateTime,
    floor: usize,
) -> Vec<SnapshotName> {
    let mut sorted = names.to_vec();
    sorted.sort_by_key(SnapshotName::taken);

    let deletable = sorted.len().saturating_sub(floor);

    sorted
        .into_iter()
        .take(deletable)
        .filter(|name| name.taken() < cutoff)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(raw: &[&str]) -> Vec<SnapshotName> {
        raw.iter()
            .map(|s| SnapshotName::try_from(*s).unwrap())
            .collect()
    }

    fn cutoff(raw: &str) -> NaiveDateTime {
        SnapshotName::try_from(format!("x.{raw}").as_str())
            .unwrap()
            .taken()
    }

    #[test]
    fn prunes_only_past_the_cutoff() {
        let all = names(&[
            "data.2025-01-01T00:00:00Z",
            "data.2025-02-01T00:00:00Z",
            "data.2025-03-01T00:00:00Z",
        ]);

        let picked = select_prunable(&all, cutoff("2025-02-15T00:00:00Z"), 1);
        assert_eq!(
            picked.iter().map(ToString::to_string).collect::<Vec<_>>(),
            [
                "data.2025-01-01T00:00:00Z".to_string(),
                "data.2025-02-01T00:00:00Z".to_string(),
            ]
        );
    }

    #[test]
    fn floor_survives_even_when_everything_is_old() {
        let all = names(&[
            "data.2024-01-01T00:00:00Z",
            "data.2024-02-01T00:00:00Z",
            "data.2024-03-01T00:00:00Z",
        ]);

        let picked = select_prunable(&all, cutoff("2025-01-01T00:00:00Z"), 2);

        // The two newest stay regardless of age.
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].to_string(), "data.2024-01-01T00:00:00Z");
    }

    #[test]
    fn fewer_snapshots_than_the_floor_means_no_pruning() {
        let all = names(&["data.2024-01-01T00:00:00Z"]);
        let picked = select_prunable(&all, cutoff("2025-01-01T00:00:00Z"), 2);
        assert!(picked.is_empty());
    }

    #[test]
    fn policy_floor_is_never_zero() {
        let policy = RetentionPolicy {
            retention_days: 7,
            keep_minimum: 0,
        };
        assert_eq!(policy.floor(), 1);
    }

    #[test]
    fn zero_days_disables_retention() {
        let policy = RetentionPolicy {
            retention_days: 0,
            keep_minimum: 3,
        };
        assert!(!policy.is_enabled());
    }
}
