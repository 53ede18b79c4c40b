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

use crate::{Error, Result};

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A `BackupConfig` describes one source subvolume and the destination
/// it is replicated to, plus the run policies.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BackupConfig {
    /// The subvolume to back up.
    pub source_volume: PathBuf,
    /// Directory holding source-side snapshots. Defaults to
    /// `.snapshots` below the source volume.
    #[serde(default)]
    pub snapshot_dir: Option<PathBuf>,
    /// Where the backup filesystem is mounted. Snapshots are received
    /// directly below this path.
    pub destination_mount: PathBuf,
    /// Safety buffer in GiB added on top of every size estimate.
    #[serde(default = "default_min_free_gb")]
    pub min_free_gb: u64,
    /// Lock file preventing concurrent runs.
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,
    /// Snapshots older than this many days are pruned after a verified
    /// run. 0 disables pruning.
    #[serde(default)]
    pub retention_days: u32,
    /// Never prune below this many snapshots per side.
    #[serde(default = "default_keep_minimum")]
    pub keep_minimum: usize,
    /// Whether the frontend should render transfer progress.
    #[serde(default = "default_show_progress")]
    pub show_progress: bool,
}

fn default_min_free_gb() -> u64 {
    1
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("/run/sbak.lock")
}

fn default_keep_minimum() -> usize {
    1
}

fn default_show_progress() -> bool {
    true
}

impl BackupConfig {
    pub const DEFAULT_PATH: &'static str = "/etc/sbak.conf";

    /// Returns a configuration with default policies for the given
    /// source and destination.
    pub fn new(source_volume: PathBuf, destination_mount: PathBuf) -> Self {
        Self {
            source_volume,
            snapshot_dir: None,
            destination_mount,
            min_free_gb: default_min_free_gb(),
            lock_file: default_lock_file(),
            retention_days: 0,
            keep_minimum: default_keep_minimum(),
            show_progress: default_show_progress(),
        }
    }

    /// Loads the configuration from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let mut f = File::open(path).map_err(|e| {
            Error::InvalidInput(format!("cannot open configuration {}: {e}", path.display()))
        })?;

        let mut s = String::new();
        f.read_to_string(&mut s).map_err(|e| {
            Error::InvalidInput(format!("cannot read configuration {}: {e}", path.display()))
        })?;

        toml::from_str(&s).map_err(|e| {
            Error::InvalidInput(format!("malformed configuration {}: {e}", path.display()))
        })
    }

    /// Writes the configuration to `path`, mode 0600. Refuses to
    /// overwrite an existing file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let s = toml::to_string_pretty(self)
            .map_err(|e| Error::InvalidInput(format!("cannot serialize configuration: {e}")))?;

        let mut f = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .map_err(|e| {
                Error::InvalidInput(format!(
                    "cannot create configuration {}: {e}",
                    path.display()
                ))
            })?;

        write!(f, "{}", s).map_err(|e| {
            Error::InvalidInput(format!("cannot write configuration {}: {e}", path.display()))
        })?;

        Ok(())
    }

    /// The basename snapshots of the source volume are named after.
    pub fn source_basename(&self) -> Result<String> {
        self.source_volume
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                Error::InvalidInput(format!(
                    "source volume {} has no usable basename",
                    self.source_volume.display()
                ))
            })
    }

    pub fn source_snapshot_dir(&self) -> PathBuf {
        self.snapshot_dir
            .clone()
            .unwrap_or_else(|| self.source_volume.join(".snapshots"))
    }

    pub fn destination_dir(&self) -> PathBuf {
        self.destination_mount.clone()
    }

    /// The configured safety buffer in bytes.
    pub fn safety_buffer(&self) -> u64 {
        self.min_free_gb * 1024 * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    #[test]
    fn minimal_configuration_gets_defaults() {
        let config: BackupConfig = toml::from_str(
            "source_volume = \"/mnt/data\"\ndestination_mount = \"/mnt/backup\"\n",
        )
        .unwrap();

        assert_eq!(config.min_free_gb, 1);
        assert_eq!(config.lock_file, PathBuf::from("/run/sbak.lock"));
        assert_eq!(config.retention_days, 0);
        assert_eq!(config.keep_minimum, 1);
        assert!(config.show_progress);
        assert_eq!(
            config.source_snapshot_dir(),
            PathBuf::from("/mnt/data/.snapshots")
        );
        assert_eq!(config.destination_dir(), PathBuf::from("/mnt/backup"));
    }

    #[test]
    fn explicit_snapshot_dir_wins() {
        let config: BackupConfig = toml::from_str(
            "source_volume = \"/mnt/data\"\nsnapshot_dir = \"/mnt/data/snaps\"\ndestination_mount = \"/mnt/backup\"\n",
        )
        .unwrap();

        assert_eq!(
            config.source_snapshot_dir(),
            PathBuf::from("/mnt/data/snaps")
        );
    }

    #[test]
    fn safety_buffer_converts_gib() {
        let mut config =
            BackupConfig::new(PathBuf::from("/mnt/data"), PathBuf::from("/mnt/backup"));
        config.min_free_gb = 2;
        assert_eq!(config.safety_buffer(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn source_basename_is_the_last_component() {
        let config = BackupConfig::new(PathBuf::from("/mnt/data"), PathBuf::from("/mnt/backup"));
        assert_eq!(config.source_basename().unwrap(), "data");
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sbak.conf");

        let config = BackupConfig::new(PathBuf::from("/mnt/data"), PathBuf::from("/mnt/backup"));
        config.save(&path).unwrap();

        let loaded = BackupConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn save_refuses_to_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sbak.conf");

        let config = BackupConfig::new(PathBuf::from("/mnt/data"), PathBuf::from("/mnt/backup"));
        config.save(&path).unwrap();

        assert!(matches!(config.save(&path), Err(Error::InvalidInput(_))));
    }
}
