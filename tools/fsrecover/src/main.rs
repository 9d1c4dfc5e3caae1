// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Scans a data file from the start, truncates a damaged tail, and optionally checks the
//! record links and index sidecar. Run it only while no storage has the file open.
//!
//! Exit status: 0 when the file is clean, 1 when a damaged tail was (or, with `--dry-run`,
//! would be) truncated, 2 when the file cannot be recovered.

use clap::Parser;
use clap_derive::Parser;
use moor_filestorage::StorageError;
use moor_filestorage::recovery::{RecoveryOutcome, scan, verify};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::format::FmtSpan;

const EXIT_TRUNCATED: u8 = 1;
const EXIT_UNRECOVERABLE: u8 = 2;

#[derive(Parser, Debug)]
#[command(version, about = "Recover or verify a filestorage data file")]
struct Args {
    #[clap(help = "Path to the data file, e.g. data.fs")]
    path: PathBuf,

    #[clap(long, help = "Report what would be truncated without modifying the file")]
    dry_run: bool,

    #[clap(
        long,
        help = "After scanning, check record back-links and compare the index sidecar"
    )]
    verify: bool,

    #[clap(long, help = "Enable debug logging")]
    debug: bool,
}

fn main() -> Result<ExitCode, eyre::Report> {
    color_eyre::install()?;
    let args: Args = Args::parse();

    let main_subscriber = tracing_subscriber::fmt()
        .compact()
        .with_ansi(true)
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_thread_names(false)
        .with_span_events(FmtSpan::NONE)
        .with_max_level(if args.debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .finish();
    tracing::subscriber::set_global_default(main_subscriber)
        .map_err(|e| eyre::eyre!("Unable to configure logging: {e}"))?;

    Ok(run(&args))
}

fn run(args: &Args) -> ExitCode {
    let report = match scan(&args.path, !args.dry_run) {
        Ok(report) => report,
        Err(e @ StorageError::Corrupted { .. }) => {
            error!("{:?} is not recoverable: {e}", args.path);
            return ExitCode::from(EXIT_UNRECOVERABLE);
        }
        Err(e) => {
            error!("Unable to scan {:?}: {e}", args.path);
            return ExitCode::from(EXIT_UNRECOVERABLE);
        }
    };
    info!(
        "{:?}: {} transactions, {} records, {} objects, last transaction {}, {} bytes",
        args.path, report.transactions, report.records, report.oids, report.last_tid, report.end
    );

    let status = match &report.outcome {
        RecoveryOutcome::Clean => {
            info!("No damage found");
            ExitCode::SUCCESS
        }
        RecoveryOutcome::Truncated(truncation) if args.dry_run => {
            warn!(
                "Would truncate {} bytes at offset {}: {}",
                truncation.dropped, truncation.at, truncation.reason
            );
            // The damaged tail would only be reported again by verification.
            return ExitCode::from(EXIT_TRUNCATED);
        }
        RecoveryOutcome::Truncated(truncation) => {
            warn!(
                "Truncated {} bytes at offset {}: {}",
                truncation.dropped, truncation.at, truncation.reason
            );
            ExitCode::from(EXIT_TRUNCATED)
        }
    };

    if args.verify {
        match verify(&args.path) {
            Ok(verified) if verified.is_ok() => {
                info!(
                    "Verified {} transactions, {} records, {} objects",
                    verified.transactions, verified.records, verified.oids
                );
            }
            Ok(verified) => {
                for problem in &verified.problems {
                    error!("{problem}");
                }
                error!("{} problems found", verified.problems.len());
                return ExitCode::from(EXIT_UNRECOVERABLE);
            }
            Err(e) => {
                error!("Unable to verify {:?}: {e}", args.path);
                return ExitCode::from(EXIT_UNRECOVERABLE);
            }
        }
    }
    status
}
