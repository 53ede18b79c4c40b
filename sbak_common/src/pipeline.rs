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

//! The send | meter | receive transfer pipeline.
//!
//! Each stage is a separately spawned child with retained handles so
//! that every exit status can be captured on its own. A shell pipeline
//! would collapse the three statuses into one and make it impossible to
//! tell a sender abort from a rejected stream.

use crate::cancel::CancelToken;
use crate::cmd;
use crate::observe::{self, Observer};
use crate::snapshot;
use crate::{Error, Result};

use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Child, ChildStderr, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// The pipeline stages, in pipeline order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    Send,
    Meter,
    Receive,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send => write!(f, "send"),
            Self::Meter => write!(f, "meter"),
            Self::Receive => write!(f, "receive"),
        }
    }
}

/// How long each stage may take to exit once the stream has drained.
pub const STAGE_DEADLINE: Duration = Duration::from_secs(300);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a child gets to honor a terminate request before it is
/// killed outright.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Chunk-size hint handed to the send tool.
const SEND_CHUNK_HINT: &str = "1024";

#[derive(Clone, Debug, Eq, PartialEq)]
enum StageOutcome {
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    TimedOut,
    Interrupted,
}

impl StageOutcome {
    fn success(&self) -> bool {
        matches!(
            self,
            Self::Exited {
                code: Some(0),
                ..
            }
        )
    }
}

/// Streams `source_snapshot` into `dest_dir`, incrementally relative to
/// `parent` when one is given.
///
/// On failure, a half-written destination subvolume is removed before
/// the error is returned; whether one exists depends on how far the
/// receive stage got, so its presence is probed rather than assumed.
pub fn run(
    source_snapshot: &Path,
    parent: Option<&Path>,
    dest_dir: &Path,
    estimate: u64,
    observer: &dyn Observer,
    cancel: &CancelToken,
) -> Result<()> {
    let snapshot_str = cmd::path_arg(source_snapshot)?;
    let dest_dir_str = cmd::path_arg(dest_dir)?;

    let mut send_args: Vec<String> = vec![
        "send".to_string(),
        "-e".to_string(),
        SEND_CHUNK_HINT.to_string(),
        "-s".to_string(),
        estimate.to_string(),
    ];
    if let Some(parent) = parent {
        send_args.push("-p".to_string());
        send_args.push(cmd::path_arg(parent)?.to_string());
    }
    send_args.push(snapshot_str.to_string());

    let receive_args = ["receive", dest_dir_str];
    cmd::check_args(&send_args)?;
    cmd::check_args(&receive_args)?;

    let file_name = source_snapshot.file_name().ok_or_else(|| {
        Error::InvalidInput(format!(
            "{} has no snapshot name component",
            source_snapshot.display()
        ))
    })?;
    let in_flight = dest_dir.join(file_name);

    let Err(primary) = execute(&send_args, &receive_args, estimate, observer, cancel) else {
        return Ok(());
    };

    if !in_flight.exists() {
        return Err(primary);
    }

    observer.on_warn(&format!(
        "removing partial destination snapshot {}",
        in_flight.display()
    ));

    // Cleanup runs to completion even under a pending cancellation.
    match snapshot::delete_with_retry(&in_flight, &CancelToken::new()) {
        Ok(()) => Err(primary),
        Err(e) => {
            let failure = Error::CleanupFailed {
                path: in_flight,
                detail: e.to_string(),
            };
            observer.on_warn(&failure.to_string());
            Err(primary.with_suppressed(vec![failure]))
        }
    }
}

fn execute(
    send_args: &[String],
    receive_args: &[&str],
    estimate: u64,
    observer: &dyn Observer,
    cancel: &CancelToken,
) -> Result<()> {
    let btrfs = cmd::tool_path("btrfs")?;
    let pv = cmd::tool_path("pv")?;

    let mut send = Command::new(&btrfs)
        .args(send_args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| cmd::spawn_error("btrfs", &btrfs, e))?;

    let Some(send_stdout) = send.stdout.take() else {
        terminate(&mut [&mut send]);
        return Err(stage_broken(Stage::Send, "stdout"));
    };

    // -f forces progress output even without a terminal.
    let mut meter = match Command::new(&pv)
        .arg("-f")
        .stdin(Stdio::from(send_stdout))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            terminate(&mut [&mut send]);
            return Err(cmd::spawn_error("pv", &pv, e));
        }
    };

    let Some(meter_stdout) = meter.stdout.take() else {
        terminate(&mut [&mut send, &mut meter]);
        return Err(stage_broken(Stage::Meter, "stdout"));
    };

    let mut receive = match Command::new(&btrfs)
        .args(receive_args)
        .stdin(Stdio::from(meter_stdout))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            terminate(&mut [&mut send, &mut meter]);
            return Err(cmd::spawn_error("btrfs", &btrfs, e));
        }
    };

    let (Some(send_stderr), Some(meter_stderr), Some(receive_stderr)) = (
        send.stderr.take(),
        meter.stderr.take(),
        receive.stderr.take(),
    ) else {
        terminate(&mut [&mut send, &mut meter, &mut receive]);
        return Err(stage_broken(Stage::Send, "stderr"));
    };

    let outcomes = thread::scope(|scope| {
        let send_lines = scope.spawn(|| capture(send_stderr));
        let meter_lines = scope.spawn(|| relay_meter(meter_stderr, estimate, observer));
        let receive_lines = scope.spawn(|| relay_receive(receive_stderr, observer));

        // The send stage defines end-of-stream; it is awaited without a
        // deadline while bytes are still flowing. The downstream stages
        // then get a bounded grace period each.
        let send_outcome = wait_stage(&mut send, None, cancel);
        if !matches!(send_outcome, StageOutcome::Exited { .. }) {
            terminate(&mut [&mut meter, &mut receive]);
        }
        let meter_outcome = wait_stage(&mut meter, Some(STAGE_DEADLINE), cancel);
        let receive_outcome = wait_stage(&mut receive, Some(STAGE_DEADLINE), cancel);

        [
            (
                Stage::Send,
                send_outcome,
                send_lines.join().unwrap_or_default(),
            ),
            (
                Stage::Meter,
                meter_outcome,
                meter_lines.join().unwrap_or_default(),
            ),
            (
                Stage::Receive,
                receive_outcome,
                receive_lines.join().unwrap_or_default(),
            ),
        ]
    });

    classify(outcomes)
}

/// Reduces the three stage outcomes to the pipeline result.
///
/// Failures are attributed to the first failing stage in pipeline
/// order. A stage that died of a collapsed pipe is skipped during
/// attribution: its death is a consequence of its neighbor failing,
/// and blaming it would hide the actual diagnostics.
fn classify(outcomes: [(Stage, StageOutcome, String); 3]) -> Result<()> {
    for (stage, outcome, _) in &outcomes {
        match outcome {
            StageOutcome::Interrupted => {
                return Err(Error::Interrupted(format!(
                    "transfer aborted during {stage} stage"
                )))
            }
            StageOutcome::TimedOut => {
                return Err(Error::Timeout {
                    operation: format!("waiting for {stage} stage"),
                    limit: STAGE_DEADLINE,
                })
            }
            StageOutcome::Exited { .. } => {}
        }
    }

    let failed: Vec<(Stage, &StageOutcome, &str)> = outcomes
        .iter()
        .filter(|(_, outcome, _)| !outcome.success())
        .map(|(stage, outcome, stderr)| (*stage, outcome, stderr.as_str()))
        .collect();

    if failed.is_empty() {
        return Ok(());
    }

    let (stage, outcome, stderr) = *failed
        .iter()
        .find(|(_, outcome, stderr)| !is_pipe_collapse(outcome, stderr))
        .unwrap_or(&failed[0]);

    let (code, signal) = match outcome {
        StageOutcome::Exited { code, signal } => (*code, *signal),
        _ => (None, None),
    };

    let mut stderr = cmd::excerpt(stderr.as_bytes());
    if stderr.is_empty() {
        stderr = match signal {
            Some(signal) => format!("terminated by signal {signal}"),
            None => "no diagnostics on stderr".to_string(),
        };
    }

    Err(Error::StreamFailed {
        stage,
        exit_code: code,
        stderr,
    })
}

fn is_pipe_collapse(outcome: &StageOutcome, stderr: &str) -> bool {
    match outcome {
        StageOutcome::Exited { signal, .. } => {
            *signal == Some(Signal::SIGPIPE as i32) || stderr.contains("Broken pipe")
        }
        _ => false,
    }
}

fn wait_stage(child: &mut Child, deadline: Option<Duration>, cancel: &CancelToken) -> StageOutcome {
    let start = Instant::now();

    loop {
        match child.try_wait() {
            Ok(Some(status)) => return outcome_of(status),
            Ok(None) => {}
            Err(_) => {
                terminate(&mut [child]);
                return StageOutcome::Exited {
                    code: None,
                    signal: None,
                };
            }
        }

        if cancel.is_cancelled() {
            terminate(&mut [child]);
            return StageOutcome::Interrupted;
        }

        if let Some(deadline) = deadline {
            if start.elapsed() >= deadline {
                terminate(&mut [child]);
                return StageOutcome::TimedOut;
            }
        }

        thread::sleep(POLL_INTERVAL);
    }
}

fn outcome_of(status: ExitStatus) -> StageOutcome {
    StageOutcome::Exited {
        code: status.code(),
        signal: status.signal(),
    }
}

/// Asks the children to terminate, then reaps them. A child that
/// ignores the request past the grace period is killed outright.
fn terminate(children: &mut [&mut Child]) {
    for child in children.iter_mut() {
        let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM);
    }

    for child in children {
        let start = Instant::now();

        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if start.elapsed() < TERM_GRACE => thread::sleep(POLL_INTERVAL),
                _ => {
                    let _ = child.kill();
                    let _ = child.wait();
                    break;
                }
            }
        }
    }
}

fn stage_broken(stage: Stage, pipe: &str) -> Error {
    Error::StreamFailed {
        stage,
        exit_code: None,
        stderr: format!("child {pipe} unavailable"),
    }
}

fn capture(stderr: ChildStderr) -> String {
    let mut text = String::new();
    let mut reader = BufReader::new(stderr);
    let mut raw = Vec::new();

    if reader.read_to_end(&mut raw).is_ok() {
        text = String::from_utf8_lossy(&raw).into_owned();
    }

    text
}

/// Follows the meter's stderr, translating its carriage-return separated
/// updates into progress reports. Lines that do not parse as updates are
/// kept for diagnostics.
fn relay_meter(stderr: ChildStderr, estimate: u64, observer: &dyn Observer) -> String {
    let mut reader = BufReader::new(stderr);
    let mut captured = String::new();
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        for &byte in &chunk[..n] {
            if byte == b'\r' || byte == b'\n' {
                flush_meter_line(&pending, estimate, observer, &mut captured);
                pending.clear();
            } else {
                pending.push(byte);
            }
        }
    }

    flush_meter_line(&pending, estimate, observer, &mut captured);
    captured
}

fn flush_meter_line(raw: &[u8], estimate: u64, observer: &dyn Observer, captured: &mut String) {
    if raw.is_empty() {
        return;
    }

    let line = String::from_utf8_lossy(raw);
    let line = line.trim();

    match observe::parse_meter_line(line, estimate) {
        Some(progress) => observer.on_progress(&progress),
        None => {
            captured.push_str(line);
            captured.push('\n');
        }
    }
}

/// Follows the receive stage's stderr. Per-extent write chatter is
/// dropped; everything else is surfaced and kept for diagnostics.
fn relay_receive(stderr: ChildStderr, observer: &dyn Observer) -> String {
    let reader = BufReader::new(stderr);
    let mut captured = String::new();

    for line in reader.lines() {
        let Ok(line) = line else {
            break;
        };

        if is_receive_noise(&line) {
            continue;
        }

        observer.on_info(&format!("receive: {}", line.trim_end()));
        captured.push_str(&line);
        captured.push('\n');
    }

    captured
}

/// Matches the `write <path> offset=<n>` lines receive emits per extent.
fn is_receive_noise(line: &str) -> bool {
    match line.find("write ") {
        Some(at) => line[at..].contains("offset="),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(code: i32) -> StageOutcome {
        StageOutcome::Exited {
            code: Some(code),
            signal: None,
        }
    }

    fn signalled(signal: i32) -> StageOutcome {
        StageOutcome::Exited {
            code: None,
            signal: Some(signal),
        }
    }

    #[test]
    fn all_stages_succeeding_is_success() {
        let outcomes = [
            (Stage::Send, exited(0), String::new()),
            (Stage::Meter, exited(0), String::new()),
            (Stage::Receive, exited(0), String::new()),
        ];

        assert!(classify(outcomes).is_ok());
    }

    #[test]
    fn first_failing_stage_in_pipeline_order_is_blamed() {
        let outcomes = [
            (Stage::Send, exited(1), "ERROR: send failed".to_string()),
            (Stage::Meter, exited(0), String::new()),
            (Stage::Receive, exited(1), "ERROR: unexpected EOF".to_string()),
        ];

        match classify(outcomes) {
            Err(Error::StreamFailed { stage, stderr, .. }) => {
                assert_eq!(stage, Stage::Send);
                assert!(stderr.contains("send failed"));
            }
            other => panic!("expected StreamFailed, got {other:?}"),
        }
    }

    #[test]
    fn upstream_pipe_collapse_does_not_hide_a_receive_failure() {
        // A dying receiver breaks the pipe under send and meter; the
        // receiver is still the stage to report.
        let outcomes = [
            (Stage::Send, signalled(Signal::SIGPIPE as i32), String::new()),
            (Stage::Meter, signalled(Signal::SIGPIPE as i32), String::new()),
            (
                Stage::Receive,
                signalled(9),
                String::new(),
            ),
        ];

        match classify(outcomes) {
            Err(Error::StreamFailed { stage, stderr, .. }) => {
                assert_eq!(stage, Stage::Receive);
                assert!(stderr.contains("signal 9"));
            }
            other => panic!("expected StreamFailed, got {other:?}"),
        }
    }

    #[test]
    fn broken_pipe_on_stderr_counts_as_collapse() {
        let outcomes = [
            (
                Stage::Send,
                exited(1),
                "ERROR: write returned Broken pipe".to_string(),
            ),
            (Stage::Meter, exited(0), String::new()),
            (
                Stage::Receive,
                exited(1),
                "ERROR: destination full".to_string(),
            ),
        ];

        match classify(outcomes) {
            Err(Error::StreamFailed { stage, stderr, .. }) => {
                assert_eq!(stage, Stage::Receive);
                assert!(stderr.contains("destination full"));
            }
            other => panic!("expected StreamFailed, got {other:?}"),
        }
    }

    #[test]
    fn interruption_beats_exit_classification() {
        let outcomes = [
            (Stage::Send, StageOutcome::Interrupted, String::new()),
            (Stage::Meter, exited(1), String::new()),
            (Stage::Receive, exited(1), String::new()),
        ];

        assert!(matches!(classify(outcomes), Err(Error::Interrupted(_))));
    }

    #[test]
    fn timeouts_name_their_stage() {
        let outcomes = [
            (Stage::Send, exited(0), String::new()),
            (Stage::Meter, exited(0), String::new()),
            (Stage::Receive, StageOutcome::TimedOut, String::new()),
        ];

        match classify(outcomes) {
            Err(Error::Timeout { operation, .. }) => {
                assert!(operation.contains("receive"));
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[test]
    fn receive_write_chatter_is_noise() {
        assert!(is_receive_noise(
            "write var/log/syslog offset=1048576 len=4096"
        ));
        assert!(!is_receive_noise("At snapshot data.2025-01-01T00:00:00Z"));
        assert!(!is_receive_noise("ERROR: writing to stream failed"));
    }
}
