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

//! The narrow reporting surface between the engine and its frontend.

use crate::bytes;

use std::time::Duration;

/// A point-in-time transfer report parsed from the meter.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Progress {
    pub bytes_transferred: u64,
    pub total_estimated: u64,
    /// Bytes per second.
    pub throughput: u64,
    pub elapsed: Duration,
    pub eta: Option<Duration>,
}

/// Receives engine events. Implementations decide how (and whether) to
/// render them; the engine itself never writes to a terminal or log.
pub trait Observer: Sync {
    fn on_info(&self, _message: &str) {}
    fn on_warn(&self, _message: &str) {}
    fn on_error(&self, _message: &str) {}
    fn on_progress(&self, _progress: &Progress) {}
}

/// Discards every event.
pub struct NullObserver;

impl Observer for NullObserver {}

/// Parses one meter stderr update of the form
/// `1.23GiB 0:00:12 [98.5MiB/s]` into a [`Progress`] report.
///
/// Parsing is lossy on purpose: a line the meter formats differently is
/// dropped rather than guessed at, and the authoritative transfer size
/// is never taken from here.
pub fn parse_meter_line(line: &str, total_estimated: u64) -> Option<Progress> {
    let mut tokens = line.split_whitespace();

    let bytes_transferred = bytes::parse_bytes(tokens.next()?).ok()?;
    let elapsed = parse_clock(tokens.next()?)?;

    let rate = tokens.next()?;
    let rate = rate
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches("/s");
    let throughput = bytes::parse_bytes(rate).ok()?;

    let eta = if throughput > 0 {
        Some(Duration::from_secs(
            total_estimated.saturating_sub(bytes_transferred) / throughput,
        ))
    } else {
        None
    };

    Some(Progress {
        bytes_transferred,
        total_estimated,
        throughput,
        elapsed,
        eta,
    })
}

/// Parses `H:MM:SS` or `MM:SS` clock readings.
fn parse_clock(value: &str) -> Option<Duration> {
    let mut secs: u64 = 0;

    for part in value.split(':') {
        secs = secs.checked_mul(60)?.checked_add(part.parse().ok()?)?;
    }

    Some(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_meter_update() {
        let total = 4 * 1024 * 1024 * 1024u64;
        let progress = parse_meter_line("1.00GiB 0:00:10 [100MiB/s]", total).unwrap();

        assert_eq!(progress.bytes_transferred, 1024 * 1024 * 1024);
        assert_eq!(progress.elapsed, Duration::from_secs(10));
        assert_eq!(progress.throughput, 100 * 1024 * 1024);

        // 3 GiB to go at 100 MiB/s.
        let eta = progress.eta.unwrap();
        assert_eq!(eta, Duration::from_secs(3 * 1024 / 100));
    }

    #[test]
    fn zero_rate_has_no_eta() {
        let progress = parse_meter_line("0B 0:00:01 [0B/s]", 1024).unwrap();
        assert_eq!(progress.eta, None);
    }

    #[test]
    fn unrecognized_lines_are_dropped() {
        assert_eq!(parse_meter_line("", 1024), None);
        assert_eq!(parse_meter_line("pv: write error", 1024), None);
        assert_eq!(parse_meter_line("no clock here", 1024), None);
    }

    #[test]
    fn clock_accepts_hours() {
        let progress = parse_meter_line("5MiB 1:02:03 [1MiB/s]", 1024).unwrap();
        assert_eq!(progress.elapsed, Duration::from_secs(3723));
    }
}
