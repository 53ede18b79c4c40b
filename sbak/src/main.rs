// sbak is a tool for replicating btrfs subvolumes to local backup drives.
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

mod error;
use error::*;

use sbak_common::bytes;
use sbak_common::cancel::CancelToken;
use sbak_common::config::BackupConfig;
use sbak_common::engine::Engine;
use sbak_common::lock;
use sbak_common::observe::{Observer, Progress};
use sbak_common::retention::{self, RetentionPolicy};
use sbak_common::snapshot::{self, Location, SnapshotName};
use sbak_common::subvol;

use std::collections::HashSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = BackupConfig::DEFAULT_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Snapshot the source subvolume and replicate it to the destination.
    Backup {
        /// Render a progress line during the transfer.
        #[arg(short, long)]
        progress: bool,
    },
    /// List snapshots on both sides and whether the pairs are consistent.
    List,
    /// Apply the retention policy without taking a backup.
    Prune,
    /// Write a starter configuration file.
    Init {
        /// The subvolume to back up.
        source_volume: PathBuf,
        /// Where the backup filesystem is mounted.
        destination_mount: PathBuf,
    },
}

fn logic() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Backup { progress } => {
            let config = BackupConfig::load(&cli.config)?;
            let cancel = interruptible()?;

            let observer = ConsoleObserver::new(progress || config.show_progress);
            Engine::new(&config, &observer, cancel).run()?;
        }
        Commands::List => {
            let config = BackupConfig::load(&cli.config)?;
            let cancel = CancelToken::new();

            let basename = config.source_basename()?;
            let snapshot_dir = config.source_snapshot_dir();
            let dest_dir = config.destination_dir();

            let source = snapshot::list(&snapshot_dir, &basename)?;
            let dest = snapshot::list(&dest_dir, &basename)?;
            let on_dest: HashSet<&SnapshotName> = dest.iter().collect();

            for name in &source {
                let status = if on_dest.contains(name) {
                    pair_status(name, &snapshot_dir, &dest_dir, &cancel)
                } else {
                    "source-only".to_string()
                };

                println!("{name}\t{status}");
            }

            for name in &dest {
                if !source.contains(name) {
                    println!("{name}\tdestination-only");
                }
            }
        }
        Commands::Prune => {
            let config = BackupConfig::load(&cli.config)?;
            let cancel = interruptible()?;

            let policy = RetentionPolicy {
                retention_days: config.retention_days,
                keep_minimum: config.keep_minimum,
            };
            if !policy.is_enabled() {
                eprintln!("[warn] retention_days is 0, nothing to prune");
                return Ok(());
            }

            let basename = config.source_basename()?;
            let observer = ConsoleObserver::new(false);

            // Pruning mutates both sides, so it runs under the same lock
            // as a backup.
            let _lock = lock::acquire(&config.lock_file, &cancel)?;

            let removed = retention::prune(
                &config.source_snapshot_dir(),
                &basename,
                Location::Source,
                &policy,
                &observer,
                &cancel,
            )? + retention::prune(
                &config.destination_dir(),
                &basename,
                Location::Destination,
                &policy,
                &observer,
                &cancel,
            )?;

            eprintln!("[info] pruned {removed} snapshots");
        }
        Commands::Init {
            source_volume,
            destination_mount,
        } => {
            BackupConfig::new(source_volume, destination_mount).save(&cli.config)?;
            println!("Wrote {}", cli.config.display());
        }
    }

    Ok(())
}

fn main() {
    match logic() {
        Ok(_) => {}
        Err(Error::Engine(e)) => {
            let primary = e.primary();
            eprintln!("[error] {primary}");

            let mut cause = std::error::Error::source(primary);
            while let Some(err) = cause {
                eprintln!("[error]   caused by: {err}");
                cause = err.source();
            }

            for suppressed in e.suppressed() {
                eprintln!("[error]   suppressed: {suppressed}");
            }

            if let Some(hint) = primary.suggestion() {
                eprintln!("[error]   hint: {hint}");
            }

            process::exit(1);
        }
        Err(e) => {
            eprintln!("[error] {e}");
            process::exit(1);
        }
    }
}

/// Returns a cancel token wired to SIGINT, SIGTERM and SIGHUP.
fn interruptible() -> Result<CancelToken> {
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();

    ctrlc::set_handler(move || {
        eprintln!("\n[warn] caught termination signal, aborting");
        handler_token.cancel();
    })?;

    Ok(cancel)
}

fn pair_status(
    name: &SnapshotName,
    snapshot_dir: &Path,
    dest_dir: &Path,
    cancel: &CancelToken,
) -> String {
    let source = subvol::show(&name.in_dir(snapshot_dir), cancel);
    let dest = subvol::show(&name.in_dir(dest_dir), cancel);

    match (source, dest) {
        (Ok(source), Ok(dest)) => {
            if dest.received_id.as_ref() == Some(&source.id) {
                "consistent pair".to_string()
            } else {
                "MISMATCHED pair".to_string()
            }
        }
        (Err(e), _) | (_, Err(e)) => format!("unknown ({e})"),
    }
}

/// Renders engine events as prefixed stderr lines, plus an in-place
/// progress line while the transfer is running.
struct ConsoleObserver {
    progress: bool,
    line_open: AtomicBool,
}

impl ConsoleObserver {
    fn new(progress: bool) -> Self {
        Self {
            progress,
            line_open: AtomicBool::new(false),
        }
    }

    fn end_progress_line(&self) {
        if self.line_open.swap(false, Ordering::Relaxed) {
            eprintln!();
        }
    }
}

impl Observer for ConsoleObserver {
    fn on_info(&self, message: &str) {
        self.end_progress_line();
        eprintln!("[info] {message}");
    }

    fn on_warn(&self, message: &str) {
        self.end_progress_line();
        eprintln!("[warn] {message}");
    }

    fn on_error(&self, message: &str) {
        self.end_progress_line();
        eprintln!("[error] {message}");
    }

    fn on_progress(&self, progress: &Progress) {
        if !self.progress {
            return;
        }

        let eta = match progress.eta {
            Some(eta) => format_clock(eta),
            None => "-".to_string(),
        };

        eprint!(
            "\r[info] {} / {} [{}/s] elapsed {} eta {}   ",
            bytes::format_bytes(progress.bytes_transferred),
            bytes::format_bytes(progress.total_estimated),
            bytes::format_bytes(progress.throughput),
            format_clock(progress.elapsed),
            eta,
        );
        let _ = io::stderr().flush();

        self.line_open.store(true, Ordering::Relaxed);
    }
}

fn format_clock(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}
