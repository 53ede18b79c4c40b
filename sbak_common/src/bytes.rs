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

//! Conversion between byte counts and human-readable sizes.

use crate::{Error, Result};

const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

/// Formats a byte count using binary units, e.g. `1.5 KiB`.
pub fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;

    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Parses a size like `12.5GB`, `100 MiB` or `4096` into a byte count.
/// Decimal units multiply by powers of 1000, binary units by powers of 1024.
pub fn parse_bytes(input: &str) -> Result<u64> {
    let s = input.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| Error::InvalidInput(format!("`{input}` is not a size")))?;

    let factor: f64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1.0,
        "K" | "KB" => 1e3,
        "M" | "MB" => 1e6,
        "G" | "GB" => 1e9,
        "T" | "TB" => 1e12,
        "KIB" => 1024.0,
        "MIB" => 1024.0 * 1024.0,
        "GIB" => 1024.0 * 1024.0 * 1024.0,
        "TIB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        other => {
            return Err(Error::InvalidInput(format!(
                "`{other}` is not a recognized size unit"
            )))
        }
    };

    Ok((value * factor).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_exact_bytes_without_decimals() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
    }

    #[test]
    fn formats_binary_units() {
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10.0 MiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }

    #[test]
    fn parses_decimal_units() {
        assert_eq!(parse_bytes("12.5GB").unwrap(), 12_500_000_000);
        assert_eq!(parse_bytes("1 kb").unwrap(), 1000);
    }

    #[test]
    fn parses_binary_units() {
        assert_eq!(parse_bytes("100 MiB").unwrap(), 100 * 1024 * 1024);
        assert_eq!(parse_bytes("1.5KiB").unwrap(), 1536);
    }

    #[test]
    fn parses_bare_numbers_as_bytes() {
        assert_eq!(parse_bytes("4096").unwrap(), 4096);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_bytes("lots").is_err());
        assert!(parse_bytes("12XB").is_err());
        assert!(parse_bytes("").is_err());
    }

    #[test]
    fn round_trips_through_parse() {
        assert_eq!(parse_bytes(&format_bytes(1536)).unwrap(), 1536);
    }
}
