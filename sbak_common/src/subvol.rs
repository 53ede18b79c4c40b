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

//! Queries against `btrfs subvolume show` output.

use crate::cancel::CancelToken;
use crate::cmd;
use crate::{Error, Result};

use std::fmt;
use std::path::Path;
use std::time::Duration;

const SHOW_DEADLINE: Duration = Duration::from_secs(60);

/// The identifier the filesystem assigns to a subvolume at creation,
/// 36 characters of hex with dashes.
///
/// A snapshot's own identifier and the received identifier recorded by
/// the receive tool share this representation but must never be read
/// from each other's field: confusing them makes every verification
/// compare a value with itself.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SubvolumeId(String);

impl SubvolumeId {
    pub fn parse(value: &str) -> Result<Self> {
        let shape_ok = value.len() == 36
            && value.chars().enumerate().all(|(i, c)| match i {
                8 | 13 | 18 | 23 => c == '-',
                _ => c.is_ascii_hexdigit(),
            });

        if shape_ok {
            Ok(Self(value.to_string()))
        } else {
            Err(Error::InvalidInput(format!(
                "`{value}` is not a valid subvolume identifier"
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubvolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The fields of one subvolume this engine cares about.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubvolumeInfo {
    /// The subvolume's own identifier.
    pub id: SubvolumeId,
    /// Set only on subvolumes written by the receive tool, carrying the
    /// identifier of the snapshot that was sent.
    pub received_id: Option<SubvolumeId>,
    /// Referenced size as reported by the filesystem, when available.
    pub total_bytes: Option<u64>,
}

/// Runs `btrfs subvolume show` on `path` and extracts the identifier
/// fields and size.
pub fn show(path: &Path, cancel: &CancelToken) -> Result<SubvolumeInfo> {
    let output = cmd::run(
        "btrfs",
        &["subvolume", "show", cmd::path_arg(path)?],
        SHOW_DEADLINE,
        cancel,
    )?;

    parse_show(&String::from_utf8_lossy(&output.stdout))
}

/// Finds the value of an exactly-named key. Matching the whole key up to
/// the colon keeps `UUID` from matching `Parent UUID` or `Received UUID`.
fn field<'a>(output: &'a str, key: &str) -> Option<&'a str> {
    output.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        (k.trim() == key).then(|| v.trim())
    })
}

pub(crate) fn parse_show(output: &str) -> Result<SubvolumeInfo> {
    let id = field(output, "UUID").ok_or_else(|| {
        Error::InvalidInput("subvolume show output carries no UUID field".to_string())
    })?;

    let received_id = field(output, "Received UUID")
        .filter(|v| *v != "-")
        .map(SubvolumeId::parse)
        .transpose()?;

    let total_bytes = field(output, "Total bytes")
        .and_then(|v| v.split_whitespace().next())
        .and_then(|v| v.parse().ok());

    Ok(SubvolumeInfo {
        id: SubvolumeId::parse(id)?,
        received_id,
        total_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHOW_OUTPUT: &str = "\
data.2025-01-01T00:00:00Z
\tName: \t\t\tdata.2025-01-01T00:00:00Z
\tUUID: \t\t\taabbccdd-1122-3344-5566-778899aabbcc
\tParent UUID: \t\t99887766-5544-3322-1100-ffeeddccbbaa
\tReceived UUID: \t\t-
\tCreation time: \t\t2025-01-01 00:00:00 +0000
\tSubvolume ID: \t\t256
\tGeneration: \t\t42
\tGen at creation: \t40
\tParent ID: \t\t5
\tTop level ID: \t\t5
\tFlags: \t\t\treadonly
\tTotal bytes: \t\t1073741824
";

    const RECEIVED_OUTPUT: &str = "\
data.2025-01-01T00:00:00Z
\tUUID: \t\t\t00000000-0000-0000-0000-0000000000aa
\tParent UUID: \t\t-
\tReceived UUID: \t\taabbccdd-1122-3344-5566-778899aabbcc
\tTotal bytes: \t\t1073741824
";

    #[test]
    fn parses_own_identifier_not_parent_or_received() {
        let info = parse_show(SHOW_OUTPUT).unwrap();
        assert_eq!(info.id.as_str(), "aabbccdd-1122-3344-5566-778899aabbcc");
    }

    #[test]
    fn dash_means_no_received_identifier() {
        let info = parse_show(SHOW_OUTPUT).unwrap();
        assert_eq!(info.received_id, None);
    }

    #[test]
    fn received_identifier_is_read_from_its_own_field() {
        let info = parse_show(RECEIVED_OUTPUT).unwrap();
        assert_eq!(info.id.as_str(), "00000000-0000-0000-0000-0000000000aa");
        assert_eq!(
            info.received_id.unwrap().as_str(),
            "aabbccdd-1122-3344-5566-778899aabbcc"
        );
    }

    #[test]
    fn parses_total_bytes() {
        let info = parse_show(SHOW_OUTPUT).unwrap();
        assert_eq!(info.total_bytes, Some(1073741824));
    }

    #[test]
    fn missing_uuid_is_an_error() {
        assert!(parse_show("Name: x\n").is_err());
    }

    #[test]
    fn identifier_shape_is_validated() {
        assert!(SubvolumeId::parse("aabbccdd-1122-3344-5566-778899aabbcc").is_ok());
        assert!(SubvolumeId::parse("not-an-id").is_err());
        assert!(SubvolumeId::parse("gghhccdd-1122-3344-5566-778899aabbcc").is_err());
        assert!(SubvolumeId::parse("aabbccdd-1122-3344-5566-778899aabbcc0").is_err());
    }
}
