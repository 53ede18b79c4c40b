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

//! Execution of allow-listed external tools with sanitized arguments.

use crate::cancel::CancelToken;
use crate::{Error, Result};

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// All tools are resolved against this fixed directory, never `PATH`.
pub const TOOL_DIR: &str = "/usr/bin";

/// The only external tools the engine is allowed to execute.
const ALLOWED_TOOLS: [&str; 8] = [
    "btrfs",
    "mount",
    "mountpoint",
    "find",
    "pv",
    "du",
    "lsblk",
    "blkid",
];

pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(300);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

const EXCERPT_LIMIT: usize = 2048;

/// Captured output of a successfully exited tool.
pub struct Output {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Resolves an allow-listed tool to its fixed installation path.
pub fn tool_path(tool: &str) -> Result<PathBuf> {
    if !ALLOWED_TOOLS.contains(&tool) {
        return Err(Error::InvalidInput(format!(
            "tool `{tool}` is not allow-listed"
        )));
    }

    let path = Path::new(TOOL_DIR).join(tool);
    if !path.exists() {
        return Err(Error::DependencyMissing {
            tool: tool.to_string(),
            path,
        });
    }

    Ok(path)
}

/// Rejects any argument that would change under the engine's character
/// filter. Arguments are never rewritten, only refused.
pub fn check_args<S: AsRef<str>>(args: &[S]) -> Result<()> {
    for arg in args {
        let arg = arg.as_ref();
        let clean = arg.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || c.is_ascii_whitespace()
                || matches!(c, '_' | '/' | '-' | '=' | '.' | ':')
        });

        if !clean {
            return Err(Error::InvalidInput(format!(
                "argument `{arg}` contains characters outside the permitted set"
            )));
        }
    }

    Ok(())
}

/// Converts a path into a command argument, rejecting non-Unicode paths.
pub fn path_arg(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| {
        Error::InvalidInput(format!("path {} is not valid Unicode", path.display()))
    })
}

/// Runs one allow-listed tool to completion, capturing stdout and stderr.
/// The child is killed if `deadline` elapses or the cancel flag is raised
/// before it exits.
pub fn run(tool: &str, args: &[&str], deadline: Duration, cancel: &CancelToken) -> Result<Output> {
    check_args(args)?;
    let path = tool_path(tool)?;

    let mut argv = vec![tool.to_string()];
    argv.extend(args.iter().map(|s| s.to_string()));

    let mut child = Command::new(&path)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| spawn_error(tool, &path, e))?;

    let stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| missing_pipe(&argv, "stdout"))?;
    let stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| missing_pipe(&argv, "stderr"))?;

    let stdout_thread = thread::spawn(move || read_all(stdout_pipe));
    let stderr_thread = thread::spawn(move || read_all(stderr_pipe));

    let status = wait_deadline(&mut child, &argv, deadline, cancel)?;

    let stdout = stdout_thread.join().unwrap_or_default();
    let stderr = stderr_thread.join().unwrap_or_default();

    if status.success() {
        Ok(Output { stdout, stderr })
    } else {
        Err(Error::CommandFailed {
            argv,
            exit_code: status.code(),
            stderr: excerpt(&stderr),
        })
    }
}

pub(crate) fn spawn_error(tool: &str, path: &Path, e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::NotFound => Error::DependencyMissing {
            tool: tool.to_string(),
            path: path.to_path_buf(),
        },
        io::ErrorKind::PermissionDenied => Error::InvalidInput(format!(
            "permission denied executing {}",
            path.display()
        )),
        _ => Error::CommandFailed {
            argv: vec![tool.to_string()],
            exit_code: None,
            stderr: e.to_string(),
        },
    }
}

pub(crate) fn missing_pipe(argv: &[String], pipe: &str) -> Error {
    Error::CommandFailed {
        argv: argv.to_vec(),
        exit_code: None,
        stderr: format!("child {pipe} unavailable"),
    }
}

/// Keeps the tail of a stderr capture, which is where the tools put
/// their final diagnostics.
pub(crate) fn excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();

    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= EXCERPT_LIMIT {
        text.to_string()
    } else {
        chars[chars.len() - EXCERPT_LIMIT..].iter().collect()
    }
}

fn read_all<R: Read>(mut pipe: R) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf);
    buf
}

fn wait_deadline(
    child: &mut Child,
    argv: &[String],
    deadline: Duration,
    cancel: &CancelToken,
) -> Result<ExitStatus> {
    let start = Instant::now();

    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {}
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::CommandFailed {
                    argv: argv.to_vec(),
                    exit_code: None,
                    stderr: e.to_string(),
                });
            }
        }

        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Interrupted(format!(
                "`{}` aborted by termination signal",
                argv.join(" ")
            )));
        }

        if start.elapsed() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Timeout {
                operation: format!("`{}`", argv.join(" ")),
                limit: deadline,
            });
        }

        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_tools_outside_the_allow_list() {
        assert!(matches!(tool_path("rm"), Err(Error::InvalidInput(_))));
        assert!(matches!(tool_path("sh"), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn accepts_plain_arguments() {
        let args = ["subvolume", "show", "/mnt/data/.snapshots/data.2025-01-01T00:00:00Z"];
        assert!(check_args(&args).is_ok());
    }

    #[test]
    fn rejects_shell_metacharacters() {
        assert!(check_args(&["$(reboot)"]).is_err());
        assert!(check_args(&["a;b"]).is_err());
        assert!(check_args(&["a|b"]).is_err());
        assert!(check_args(&["a&b"]).is_err());
        assert!(check_args(&["`id`"]).is_err());
    }

    #[test]
    fn run_refuses_unknown_tool_before_spawning() {
        let cancel = CancelToken::new();
        assert!(matches!(
            run("sh", &["-c", "true"], DEFAULT_DEADLINE, &cancel),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn run_refuses_forbidden_argument_before_spawning() {
        let cancel = CancelToken::new();
        assert!(matches!(
            run("btrfs", &["subvolume; reboot"], DEFAULT_DEADLINE, &cancel),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn excerpt_keeps_the_tail() {
        let long: String = "x".repeat(EXCERPT_LIMIT * 2) + "ERROR: end";
        let out = excerpt(long.as_bytes());
        assert_eq!(out.chars().count(), EXCERPT_LIMIT);
        assert!(out.ends_with("ERROR: end"));
    }
}
