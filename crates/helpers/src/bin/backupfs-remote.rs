//! Source-side half of a remote backup: walks the source and leaves the three session
//! artifacts in the working directory.

use backupfs_core::layout::normalize_absolute;
use backupfs_core::logging::init_logging;
use backupfs_core::{CaptureConfig, Result, SessionId, run_capture};
use backupfs_helpers::{finish, path_arg, positional_args, settings, usage, utf8_arg};
use tracing::info;

const PROGRAM: &str = "backupfs-remote";

fn main() {
    init_logging();
    finish(PROGRAM, run());
}

fn run() -> Result<()> {
    let args = positional_args();
    let [source, dated_dir, host, session_id] = args.as_slice() else {
        return Err(usage(PROGRAM, "<source> <dated-dir> <host> <session-id>"));
    };
    let settings = settings()?;
    let config = CaptureConfig {
        source: normalize_absolute(&path_arg(source), "source")?,
        dated_dir: normalize_absolute(&path_arg(dated_dir), "dated directory")?,
        host: utf8_arg(host, "host")?,
        session_id: SessionId::parse(&utf8_arg(session_id, "session id")?)?,
        work_dir: std::env::current_dir()?,
        now: chrono::Local::now(),
        journal_file: settings.layout.journal_file,
    };

    let report = run_capture(&config)?;
    info!(
        event = "capture.finished",
        strategy = report.strategy,
        directories = report.directories,
        links = report.links,
        new = report.stats.new,
        changed = report.stats.changed,
        unchanged = report.stats.unchanged,
        "capture.finished"
    );
    Ok(())
}
