//! Hard-links unchanged files from the previous backup, as listed on stdin.

use backupfs_core::Result;
use backupfs_core::layout::normalize_absolute;
use backupfs_core::materialize::materialize_links;
use backupfs_core::privilege::require_root;
use backupfs_core::logging::init_logging;
use backupfs_helpers::{finish, path_arg, positional_args, usage};
use tracing::info;

const PROGRAM: &str = "backupfs-mklink";

fn main() {
    init_logging();
    finish(PROGRAM, run());
}

fn run() -> Result<()> {
    let args = positional_args();
    let [root, dated_dir, source] = args.as_slice() else {
        return Err(usage(PROGRAM, "<backup-root> <dated-dir> <source>"));
    };
    let root = normalize_absolute(&path_arg(root), "backup root")?;
    let dated_dir = normalize_absolute(&path_arg(dated_dir), "dated directory")?;
    let source = normalize_absolute(&path_arg(source), "source")?;
    require_root(PROGRAM)?;

    let summary = materialize_links(std::io::stdin().lock(), &root, &dated_dir, &source)?;
    info!(
        event = "mklink.finished",
        previous = ?summary.previous_dir,
        linked = summary.linked,
        failed = summary.failed,
        "mklink.finished"
    );
    Ok(())
}
