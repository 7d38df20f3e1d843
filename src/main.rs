mod identity;
mod index;
mod procfs;
mod report;
mod scan;

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use env_logger::Env;

use crate::report::TableWriter;
use crate::scan::MatchRecord;

/// At least one process maps a target.
const EXIT_MATCHES: u8 = 2;
/// The run could not complete.
const EXIT_ERROR: u8 = 1;
/// The invocation itself was wrong.
const EXIT_USAGE: u8 = 64;

#[derive(Parser)]
#[command(
    name = "lspu",
    version,
    about = "Lists processes holding executable mappings of the given files"
)]
struct Cli {
    /// Executables or shared objects to look for
    #[arg(value_name = "PATH")]
    paths: Vec<PathBuf>,

    /// Do not print the column header
    #[arg(short = 'n', long)]
    no_header: bool,

    /// Emit matches as JSON instead of a table
    #[arg(long)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(EXIT_USAGE);
        }
    };

    env_logger::Builder::from_env(
        Env::default().default_filter_or(if cli.verbose { "debug" } else { "warn" }),
    )
    .format_timestamp(None)
    .format_target(false)
    .init();

    if cli.paths.is_empty() {
        eprintln!("{}", Cli::command().render_usage());
        eprintln!("Try 'lspu --help' for more information.");
        return ExitCode::from(exit_status(&cli.paths, &[]));
    }

    // Other users' mapping tables are unreadable without privilege; the
    // sweep still runs, it just cannot see everything.
    if !nix::unistd::Uid::effective().is_root() {
        log::warn!("not running as root; matches in other users' processes will be missed");
    }

    let result = match scan::run(&cli.paths) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("lspu: {e:#}");
            return ExitCode::from(EXIT_ERROR);
        }
    };

    if cli.json {
        match serde_json::to_string_pretty(&result) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("lspu: encoding output: {e}");
                return ExitCode::from(EXIT_ERROR);
            }
        }
    } else {
        let stdout = io::stdout();
        let mut table = TableWriter::new(stdout.lock(), !cli.no_header);
        for rec in &result.matches {
            match table.write_match(rec) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => break,
                Err(e) => {
                    eprintln!("lspu: writing output: {e}");
                    return ExitCode::from(EXIT_ERROR);
                }
            }
        }
    }

    ExitCode::from(exit_status(&cli.paths, &result.matches))
}

/// Status for the whole invocation: an empty target list is the caller's
/// error and nothing is scanned; otherwise distinct statuses let scripts
/// tell "found" from "found nothing" without parsing the table.
fn exit_status(paths: &[PathBuf], matches: &[MatchRecord]) -> u8 {
    if paths.is_empty() {
        EXIT_USAGE
    } else if matches.is_empty() {
        0
    } else {
        EXIT_MATCHES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec() -> MatchRecord {
        MatchRecord {
            pid: 1,
            ns_id: 0,
            comm: "init".to_string(),
            path: PathBuf::from("/init"),
        }
    }

    #[test]
    fn no_targets_is_a_usage_error_before_anything_runs() {
        assert_eq!(exit_status(&[], &[]), EXIT_USAGE);
    }

    #[test]
    fn matches_and_clean_sweeps_report_distinct_statuses() {
        let paths = [PathBuf::from("/usr/lib/libc.so.6")];
        assert_eq!(exit_status(&paths, &[]), 0);
        assert_eq!(exit_status(&paths, &[rec()]), EXIT_MATCHES);
    }
}
