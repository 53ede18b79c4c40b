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

use std::path::Path;
use std::thread;
use std::time::Duration;

const PROBE_ATTEMPTS: u32 = 3;
const PROBE_PAUSE: Duration = Duration::from_secs(2);
const PROBE_DEADLINE: Duration = Duration::from_secs(10);

/// Confirms that `path` is a mount point. The engine refuses to operate
/// on unmounted paths and never mounts anything on its own.
pub fn assert_mounted(path: &Path, cancel: &CancelToken) -> Result<()> {
    let mut attempt = 0;

    loop {
        attempt += 1;
        cancel.check()?;

        match cmd::run(
            "mountpoint",
            &["-q", cmd::path_arg(path)?],
            PROBE_DEADLINE,
            cancel,
        ) {
            Ok(_) => return Ok(()),
            Err(Error::CommandFailed { .. }) if attempt < PROBE_ATTEMPTS => {
                thread::sleep(PROBE_PAUSE);
            }
            Err(Error::CommandFailed { .. }) => {
                return Err(Error::MountMissing {
                    path: path.to_path_buf(),
                })
            }
            Err(e) => return Err(e),
        }
    }
}
