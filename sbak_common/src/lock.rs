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

//! Single-instance run lock with stale-owner reclamation.

use crate::cancel::CancelToken;
use crate::{Error, Result};

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process;
use std::time::{Duration, Instant};

use nix::fcntl::{flock, FlockArg};
use nix::sys::signal::kill;
use nix::unistd::Pid;

pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Holds the run lock. Dropping the guard releases the advisory lock and
/// removes the lock file, on every exit path.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    // Keeps the advisory lock alive for the lifetime of the guard.
    _file: File,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Acquires the exclusive run lock at `path`.
///
/// The file is created with `O_CREAT | O_EXCL` and mode 0600 and filled
/// with our process id. If it already exists, the stored owner is probed
/// with signal 0; a dead owner's file is removed and creation is retried
/// exactly once. A lock file whose contents do not parse as a process id
/// is never removed automatically.
pub fn acquire(path: &Path, cancel: &CancelToken) -> Result<LockGuard> {
    let start = Instant::now();
    let mut reclaimed = false;

    loop {
        cancel.check()?;

        if start.elapsed() >= ACQUIRE_TIMEOUT {
            return Err(Error::Timeout {
                operation: format!("acquiring run lock at {}", path.display()),
                limit: ACQUIRE_TIMEOUT,
            });
        }

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
        {
            Ok(file) => return claim(path, file),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if reclaimed {
                    return Err(unavailable(
                        path,
                        "lock file reappeared after removing a stale one",
                    ));
                }

                let owner = read_owner(path)?;
                if process_alive(owner) {
                    return Err(unavailable(
                        path,
                        &format!("held by running process {owner}"),
                    ));
                }

                fs::remove_file(path)
                    .map_err(|e| unavailable(path, &format!("cannot remove stale lock: {e}")))?;
                reclaimed = true;
            }
            Err(e) => return Err(unavailable(path, &e.to_string())),
        }
    }
}

fn claim(path: &Path, mut file: File) -> Result<LockGuard> {
    let write_result = writeln!(file, "{}", process::id())
        .and_then(|_| file.flush())
        .map_err(|e| unavailable(path, &format!("cannot record owner pid: {e}")));

    let lock_result = write_result.and_then(|_| {
        flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)
            .map_err(|e| unavailable(path, &format!("advisory lock refused: {e}")))
    });

    match lock_result {
        Ok(_) => Ok(LockGuard {
            path: path.to_path_buf(),
            _file: file,
        }),
        Err(e) => {
            // Half-claimed file, do not leave it behind.
            let _ = fs::remove_file(path);
            Err(e)
        }
    }
}

fn read_owner(path: &Path) -> Result<i32> {
    let contents = fs::read_to_string(path)
        .map_err(|e| unavailable(path, &format!("unreadable lock file: {e}")))?;

    contents.trim().parse().map_err(|_| {
        unavailable(
            path,
            "lock file does not contain a process id; remove it manually if no run is active",
        )
    })
}

fn process_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

fn unavailable(path: &Path, reason: &str) -> Error {
    Error::LockUnavailable {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}
