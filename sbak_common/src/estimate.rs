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

//! Pre-flight transfer size estimation and destination space checks.
//!
//! Estimates exist to refuse doomed runs before the stream starts, not
//! to promise a transfer size. Overshooting wastes a refusal, while
//! undershooting wastes hours of streaming, so every path rounds up.

use crate::cancel::CancelToken;
use crate::cmd;
use crate::observe::Observer;
use crate::snapshot::BackupKind;
use crate::subvol;
use crate::{Error, Result};

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// No estimate is ever below this.
pub const MIN_ESTIMATE: u64 = 10 * 1024 * 1024;

/// The dry run is truncated once this many bytes have been counted.
const DRY_RUN_CAP: u64 = 10 * 1024 * 1024;
const DRY_RUN_DEADLINE: Duration = Duration::from_secs(300);

/// Margin applied on top of counted dry-run bytes.
const DRY_RUN_MARGIN: f64 = 1.05;

/// Assumed changed fraction of the subvolume when the dry run fails.
const FALLBACK_CHANGE_RATIO: f64 = 0.10;

const DU_DEADLINE: Duration = Duration::from_secs(600);
const USAGE_DEADLINE: Duration = Duration::from_secs(60);

const SPACE_ATTEMPTS: u32 = 3;
const SPACE_PAUSE: Duration = Duration::from_secs(3);

/// Estimates how many bytes the transfer for `kind` will move.
///
/// Full transfers use the subvolume's reported size. Incremental
/// transfers meter a `--no-data` dry run from parent to current and add
/// a small margin; if the dry run fails, a tenth of the subvolume is
/// assumed changed instead.
pub fn transfer_size(
    kind: &BackupKind,
    current: &Path,
    snapshot_dir: &Path,
    observer: &dyn Observer,
    cancel: &CancelToken,
) -> Result<u64> {
    let estimate = match kind {
        BackupKind::Full => subvolume_bytes(current, cancel)?,
        BackupKind::Incremental { parent } => {
            let parent_path = parent.in_dir(snapshot_dir);

            match delta_bytes(&parent_path, current, cancel) {
                Ok(counted) => (counted as f64 * DRY_RUN_MARGIN) as u64,
                Err(e @ Error::Interrupted(_)) => return Err(e),
                Err(e) => {
                    observer.on_warn(&format!(
                        "size dry run failed ({e}); assuming {}% of the subvolume changed",
                        (FALLBACK_CHANGE_RATIO * 100.0) as u32
                    ));

                    let source_bytes = subvolume_bytes(current, cancel)?;
                    (source_bytes as f64 * FALLBACK_CHANGE_RATIO * DRY_RUN_MARGIN) as u64
                }
            }
        }
    };

    Ok(apply_floor(estimate))
}

/// Verifies that the destination has room for `estimate` plus the
/// safety buffer. The usage query tolerates transient failures under
/// heavy destination activity.
pub fn check_space(
    dest_mount: &Path,
    estimate: u64,
    safety_buffer: u64,
    cancel: &CancelToken,
) -> Result<()> {
    let available = free_bytes(dest_mount, cancel)?;
    let required = estimate.saturating_add(safety_buffer);

    if available < required {
        Err(Error::InsufficientSpace {
            required,
            available,
        })
    } else {
        Ok(())
    }
}

fn apply_floor(estimate: u64) -> u64 {
    estimate.max(MIN_ESTIMATE)
}

/// Size of the subvolume at `path`, preferring the filesystem's own
/// accounting over a directory walk.
fn subvolume_bytes(path: &Path, cancel: &CancelToken) -> Result<u64> {
    match subvol::show(path, cancel) {
        Ok(info) => {
            if let Some(bytes) = info.total_bytes {
                return Ok(bytes);
            }
        }
        Err(e @ Error::Interrupted(_)) => return Err(e),
        Err(_) => {}
    }

    let output = cmd::run(
        "du",
        &["-sb", cmd::path_arg(path)?],
        DU_DEADLINE,
        cancel,
    )?;

    String::from_utf8_lossy(&output.stdout)
        .split_whitespace()
        .next()
        .and_then(|token| token.parse().ok())
        .ok_or_else(|| Error::InvalidInput("du produced no byte count".to_string()))
}

/// Meters a `--no-data` send from `parent` to `current`, stopping once
/// the cap is reached so a huge delta does not stall the pre-flight.
fn delta_bytes(parent: &Path, current: &Path, cancel: &CancelToken) -> Result<u64> {
    let parent_str = cmd::path_arg(parent)?;
    let current_str = cmd::path_arg(current)?;
    let args = ["send", "--no-data", "-p", parent_str, current_str];
    cmd::check_args(&args)?;

    let tool = cmd::tool_path("btrfs")?;
    let mut argv = vec!["btrfs".to_string()];
    argv.extend(args.iter().map(|s| s.to_string()));

    let mut child = Command::new(&tool)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| cmd::spawn_error("btrfs", &tool, e))?;

    let mut stream = child
        .stdout
        .take()
        .ok_or_else(|| cmd::missing_pipe(&argv, "stdout"))?;

    let start = Instant::now();
    let mut counted: u64 = 0;
    let mut chunk = [0u8; 64 * 1024];

    loop {
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Interrupted(
                "size dry run aborted by termination signal".to_string(),
            ));
        }

        if start.elapsed() >= DRY_RUN_DEADLINE {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Timeout {
                operation: "size dry run".to_string(),
                limit: DRY_RUN_DEADLINE,
            });
        }

        if counted >= DRY_RUN_CAP {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(DRY_RUN_CAP);
        }

        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => counted += n as u64,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::CommandFailed {
                    argv,
                    exit_code: None,
                    stderr: e.to_string(),
                });
            }
        }
    }

    let status = child.wait().map_err(|e| Error::CommandFailed {
        argv: argv.clone(),
        exit_code: None,
        stderr: e.to_string(),
    })?;

    if status.success() {
        Ok(counted)
    } else {
        Err(Error::CommandFailed {
            argv,
            exit_code: status.code(),
            stderr: String::new(),
        })
    }
}

fn free_bytes(dest_mount: &Path, cancel: &CancelToken) -> Result<u64> {
    let mut attempt = 0;

    loop {
        attempt += 1;
        cancel.check()?;

        match cmd::run(
            "btrfs",
            &["filesystem", "usage", "-b", cmd::path_arg(dest_mount)?],
            USAGE_DEADLINE,
            cancel,
        ) {
            Ok(output) => return parse_free(&String::from_utf8_lossy(&output.stdout)),
            Err(Error::CommandFailed { .. }) if attempt < SPACE_ATTEMPTS => {
                thread::sleep(SPACE_PAUSE)
            }
            Err(e) => return Err(e),
        }
    }
}

pub(crate) fn parse_free(output: &str) -> Result<u64> {
    output
        .lines()
        .find_map(|line| {
            line.trim()
                .strip_prefix("Free (estimated):")
                .and_then(|rest| rest.split_whitespace().next())
                .and_then(|token| token.parse().ok())
        })
        .ok_or_else(|| {
            Error::InvalidInput(
                "filesystem usage output has no `Free (estimated)` field".to_string(),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const USAGE_OUTPUT: &str = "\
Overall:
    Device size:\t\t 2000398934016
    Device allocated:\t\t 1857858441216
    Device unallocated:\t\t  142540492800
    Device missing:\t\t\t      0
    Used:\t\t\t 1782126633728
    Free (estimated):\t\t  214182248448\t(min: 142912002048)
    Free (statfs, df):\t\t  214182248448
    Data ratio:\t\t\t\t   1.00
    Metadata ratio:\t\t\t   2.00
    Global reserve:\t\t      536870912\t(used: 0)
";

    #[test]
    fn parses_estimated_free_bytes() {
        assert_eq!(parse_free(USAGE_OUTPUT).unwrap(), 214182248448);
    }

    #[test]
    fn missing_free_field_is_an_error() {
        assert!(parse_free("Overall:\n    Used: 5\n").is_err());
    }

    #[test]
    fn statfs_line_is_not_mistaken_for_the_estimate() {
        let output = "    Free (statfs, df):\t\t  99\n    Free (estimated):\t\t  42\t(min: 1)\n";
        assert_eq!(parse_free(output).unwrap(), 42);
    }

    #[test]
    fn estimates_never_undershoot_the_floor() {
        assert_eq!(apply_floor(0), MIN_ESTIMATE);
        assert_eq!(apply_floor(MIN_ESTIMATE - 1), MIN_ESTIMATE);
        assert_eq!(apply_floor(MIN_ESTIMATE + 1), MIN_ESTIMATE + 1);
    }

    #[test]
    fn margins_round_the_expected_way() {
        let counted: u64 = 100 * 1024 * 1024;
        let with_margin = (counted as f64 * DRY_RUN_MARGIN) as u64;
        assert_eq!(with_margin, 110100480);

        let source: u64 = 1024 * 1024 * 1024;
        let fallback = (source as f64 * FALLBACK_CHANGE_RATIO * DRY_RUN_MARGIN) as u64;
        assert_eq!(fallback, 112742891);
    }
}
