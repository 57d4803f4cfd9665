//! Creates or corrects the directories described on stdin, relative to the working
//! directory.

use backupfs_core::Result;
use backupfs_core::layout::normalize_absolute;
use backupfs_core::materialize::materialize_dirs;
use backupfs_core::privilege::require_root;
use backupfs_core::logging::init_logging;
use backupfs_helpers::{finish, path_arg, positional_args, usage};
use tracing::info;

const PROGRAM: &str = "backupfs-mkdir";

fn main() {
    init_logging();
    finish(PROGRAM, run());
}

fn run() -> Result<()> {
    let args = positional_args();
    let confine = match args.as_slice() {
        [] => None,
        [dir] => Some(normalize_absolute(&path_arg(dir), "confining directory")?),
        _ => return Err(usage(PROGRAM, "[confining-dir]")),
    };
    require_root(PROGRAM)?;

    let base = std::env::current_dir()?;
    let summary = materialize_dirs(std::io::stdin().lock(), &base, confine.as_deref())?;
    info!(
        event = "mkdir.finished",
        created = summary.created,
        corrected = summary.corrected,
        failed = summary.failed,
        "mkdir.finished"
    );
    Ok(())
}
