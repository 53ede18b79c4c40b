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

//! The run orchestrator: one invocation, one state machine.

use crate::bytes;
use crate::cancel::CancelToken;
use crate::config::BackupConfig;
use crate::estimate;
use crate::lock;
use crate::mount;
use crate::observe::Observer;
use crate::pipeline;
use crate::retention::{self, RetentionPolicy};
use crate::snapshot::{self, BackupKind, Location, SnapshotName};
use crate::subvol;
use crate::{Error, Result};

use std::fs;
use std::path::Path;

/// Progression of one run. Every terminal state other than `Retained`
/// goes through `CleaningUp` first.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunPhase {
    Initial,
    Locked,
    Mounted,
    SnapshotCreated,
    Ready,
    Approved,
    Transferred,
    Verified,
    Retained,
    CleaningUp,
    Failed,
}

/// Per-invocation state. The two flags exist for cleanup: they record
/// what was actually created and verified, not what was planned.
#[derive(Clone, Debug)]
pub struct RunState {
    phase: RunPhase,
    snapshot_name: SnapshotName,
    snapshot_created: bool,
    backup_successful: bool,
}

impl RunState {
    pub fn new(snapshot_name: SnapshotName) -> Self {
        Self {
            phase: RunPhase::Initial,
            snapshot_name,
            snapshot_created: false,
            backup_successful: false,
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn snapshot_name(&self) -> &SnapshotName {
        &self.snapshot_name
    }

    /// Whether the source snapshot was created. Once set this is never
    /// cleared, no matter what fails afterwards.
    pub fn snapshot_created(&self) -> bool {
        self.snapshot_created
    }

    /// Whether the destination copy was verified against the source.
    pub fn backup_successful(&self) -> bool {
        self.backup_successful
    }

    fn advance(&mut self, phase: RunPhase) {
        self.phase = phase;
    }

    fn mark_snapshot_created(&mut self) {
        self.snapshot_created = true;
        self.phase = RunPhase::SnapshotCreated;
    }

    fn mark_verified(&mut self) {
        self.backup_successful = true;
        self.phase = RunPhase::Verified;
    }
}

/// Sequences a complete backup run.
pub struct Engine<'a> {
    config: &'a BackupConfig,
    observer: &'a dyn Observer,
    cancel: CancelToken,
}

impl<'a> Engine<'a> {
    pub fn new(config: &'a BackupConfig, observer: &'a dyn Observer, cancel: CancelToken) -> Self {
        Self {
            config,
            observer,
            cancel,
        }
    }

    /// Runs one backup: lock, verify mounts, snapshot, transfer, verify,
    /// prune. A failure anywhere after the snapshot exists drives the
    /// cleanup path before the error is returned; the lock is released
    /// on every exit path when the guard drops.
    pub fn run(&self) -> Result<()> {
        let basename = self.config.source_basename()?;
        let mut state = RunState::new(SnapshotName::now(&basename));

        let _lock = lock::acquire(&self.config.lock_file, &self.cancel)?;
        state.advance(RunPhase::Locked);

        mount::assert_mounted(&self.config.source_volume, &self.cancel)?;
        mount::assert_mounted(&self.config.destination_mount, &self.cancel)?;
        state.advance(RunPhase::Mounted);

        match self.transfer(&mut state, &basename) {
            Ok(()) => {
                self.observer
                    .on_info(&format!("backup {} complete", state.snapshot_name()));
                Ok(())
            }
            Err(primary) => {
                state.advance(RunPhase::CleaningUp);

                let suppressed = if state.backup_successful() {
                    // The new pair is already verified; a late failure
                    // must not cost the baseline.
                    self.observer
                        .on_warn("failure after verification; both snapshots are kept");
                    Vec::new()
                } else {
                    retention::cleanup_failed_run(
                        &state,
                        &self.config.source_snapshot_dir(),
                        &self.config.destination_dir(),
                        self.observer,
                    )
                };

                state.advance(RunPhase::Failed);
                Err(primary.with_suppressed(suppressed))
            }
        }
    }

    fn transfer(&self, state: &mut RunState, basename: &str) -> Result<()> {
        let snapshot_dir = self.config.source_snapshot_dir();
        let dest_dir = self.config.destination_dir();

        fs::create_dir_all(&snapshot_dir).map_err(|e| Error::SnapshotOperationFailed {
            operation: "prepare",
            path: snapshot_dir.clone(),
            source: Box::new(e),
        })?;

        let source_path = state.snapshot_name().in_dir(&snapshot_dir);
        self.observer
            .on_info(&format!("creating snapshot {}", state.snapshot_name()));
        snapshot::create_readonly(&self.config.source_volume, &source_path, &self.cancel)?;
        state.mark_snapshot_created();

        let kind = match snapshot::select_parent(
            &snapshot_dir,
            &dest_dir,
            basename,
            state.snapshot_name(),
        )? {
            Some(parent) => BackupKind::Incremental { parent },
            None => BackupKind::Full,
        };
        state.advance(RunPhase::Ready);

        let parent_path = match &kind {
            BackupKind::Incremental { parent } => {
                // An ancestor pair that has diverged refuses the run
                // here, before a stream built on it goes anywhere.
                self.verify_pair(parent, &snapshot_dir, &dest_dir)?;
                self.observer
                    .on_info(&format!("incremental transfer, parent {parent}"));
                Some(parent.in_dir(&snapshot_dir))
            }
            BackupKind::Full => {
                self.observer
                    .on_info("full transfer, no common parent on both sides");
                None
            }
        };

        let estimate = estimate::transfer_size(
            &kind,
            &source_path,
            &snapshot_dir,
            self.observer,
            &self.cancel,
        )?;
        self.observer.on_info(&format!(
            "estimated transfer size {}",
            bytes::format_bytes(estimate)
        ));

        estimate::check_space(
            &self.config.destination_mount,
            estimate,
            self.config.safety_buffer(),
            &self.cancel,
        )?;
        state.advance(RunPhase::Approved);

        pipeline::run(
            &source_path,
            parent_path.as_deref(),
            &dest_dir,
            estimate,
            self.observer,
            &self.cancel,
        )?;
        state.advance(RunPhase::Transferred);

        let dest_path = state.snapshot_name().in_dir(&dest_dir);
        self.verify_transfer(state.snapshot_name(), &source_path, &dest_path)?;
        state.mark_verified();
        self.observer.on_info("destination verified against source");

        let policy = RetentionPolicy {
            retention_days: self.config.retention_days,
            keep_minimum: self.config.keep_minimum,
        };
        if policy.is_enabled() {
            retention::prune(
                &snapshot_dir,
                basename,
                Location::Source,
                &policy,
                self.observer,
                &self.cancel,
            )?;
            retention::prune(
                &dest_dir,
                basename,
                Location::Destination,
                &policy,
                self.observer,
                &self.cancel,
            )?;
        }
        state.advance(RunPhase::Retained);

        Ok(())
    }

    /// The transferred copy is genuine iff the destination recorded the
    /// source snapshot's own identifier during receive.
    fn verify_transfer(
        &self,
        name: &SnapshotName,
        source_path: &Path,
        dest_path: &Path,
    ) -> Result<()> {
        let source = subvol::show(source_path, &self.cancel)?;
        let dest = subvol::show(dest_path, &self.cancel)?;

        match &dest.received_id {
            Some(received) if *received == source.id => Ok(()),
            received => Err(Error::IdentifierMismatch {
                snapshot: name.to_string(),
                source_id: source.id.to_string(),
                received_id: received.as_ref().map(ToString::to_string),
            }),
        }
    }

    /// Confirms that the chosen parent is still a consistent pair.
    fn verify_pair(
        &self,
        parent: &SnapshotName,
        snapshot_dir: &Path,
        dest_dir: &Path,
    ) -> Result<()> {
        let source = subvol::show(&parent.in_dir(snapshot_dir), &self.cancel)?;

        // A source snapshot carrying a received identifier was not
        // created by this engine; the pair cannot be trusted.
        if source.received_id.is_some() {
            return Err(Error::IdentifierMismatch {
                snapshot: parent.to_string(),
                source_id: source.id.to_string(),
                received_id: source.received_id.map(|id| id.to_string()),
            });
        }

        let dest = subvol::show(&parent.in_dir(dest_dir), &self.cancel)?;

        match &dest.received_id {
            Some(received) if *received == source.id => Ok(()),
            received => Err(Error::IdentifierMismatch {
                snapshot: parent.to_string(),
                source_id: source.id.to_string(),
                received_id: received.as_ref().map(ToString::to_string),
            }),
        }
    }
}
